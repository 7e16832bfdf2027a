// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod catalog;
mod anthropic;
mod error;
mod mock;
mod openai;
mod provider;
mod retry;
mod stream;
mod types;

pub use anthropic::AnthropicProvider;
pub use error::{looks_like_context_overflow, ProviderError};
pub use mock::{error_events, text_events, tool_call_events, ScriptedProvider};
pub use openai::OpenAiProvider;
pub use provider::{
    provider_stream, MessageAssembler, Provider, ProviderEvent, ProviderRequest, ProviderResult,
    ProviderStream,
};
pub use retry::{stream_with_retry, OnRetry, RetryPolicy};
pub use stream::{EventStream, StreamError};
pub use types::{
    AssistantMessage, ContentBlock, Message, StopReason, TokenUsage, ToolResultMessage, ToolSchema,
    UserContent, UserMessage,
};

use std::sync::Arc;

use diligent_config::Config;

/// Construct a provider from configuration.
///
/// The model string (id or alias) is resolved against the catalog to select
/// the vendor; unknown models fall back on a prefix guess so custom
/// OpenAI-compatible endpoints keep working.  Returns the canonical model id
/// together with the driver.
pub fn from_config(cfg: &Config) -> anyhow::Result<(String, Arc<dyn Provider>)> {
    let requested = cfg.model.as_deref().unwrap_or("claude-sonnet-4-5");
    let model = catalog::resolve_model_id(requested);
    let vendor = catalog::lookup(&model)
        .map(|e| e.provider)
        .unwrap_or_else(|| {
            if model.starts_with("claude") {
                "anthropic".into()
            } else {
                "openai".into()
            }
        });

    let provider: Arc<dyn Provider> = match vendor.as_str() {
        "anthropic" => {
            let creds = cfg.provider.anthropic.clone().unwrap_or_default();
            Arc::new(AnthropicProvider::new(creds.api_key, creds.base_url))
        }
        "openai" => {
            let creds = cfg.provider.openai.clone().unwrap_or_default();
            Arc::new(OpenAiProvider::new(creds.api_key, creds.base_url))
        }
        "scripted" => Arc::new(ScriptedProvider::always_text("[mock reply]")),
        other => anyhow::bail!("unknown provider: {other}"),
    };
    Ok((model, provider))
}
