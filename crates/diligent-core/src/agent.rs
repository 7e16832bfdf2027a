// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use diligent_config::AgentMode;
use diligent_model::{
    catalog, stream_with_retry, AssistantMessage, ContentBlock, Message, Provider, ProviderEvent,
    ProviderRequest, RetryPolicy, StopReason, TokenUsage, ToolSchema,
};
use diligent_tools::{ApproveFn, ToolContext, ToolRegistry};

use crate::events::{agent_stream, AgentEvent, AgentStatus, AgentStream, RetryStatus, SerializedError};
use crate::loop_detect::LoopDetector;
use crate::prompts::{self, READ_ONLY_TOOLS};

/// Source of steering messages, drained at the three drain points of every
/// turn.  Returns the messages queued since the last drain.
pub type SteeringFn = Arc<dyn Fn() -> Vec<Message> + Send + Sync>;

/// Configuration for one agent-loop invocation.
pub struct AgentLoopConfig {
    pub model: String,
    /// Base system prompt (mode directives are prepended per turn).
    pub system_prompt: String,
    pub tools: Arc<ToolRegistry>,
    pub provider: Arc<dyn Provider>,
    pub cancel: CancellationToken,
    pub max_turns: u32,
    pub retry: RetryPolicy,
    pub mode: AgentMode,
    pub steering: Option<SteeringFn>,
    pub approve: Option<ApproveFn>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl AgentLoopConfig {
    pub fn new(model: impl Into<String>, provider: Arc<dyn Provider>, tools: Arc<ToolRegistry>) -> Self {
        Self {
            model: model.into(),
            system_prompt: String::new(),
            tools,
            provider,
            cancel: CancellationToken::new(),
            max_turns: 100,
            retry: RetryPolicy::default(),
            mode: AgentMode::Default,
            steering: None,
            approve: None,
            max_tokens: None,
            temperature: None,
        }
    }
}

/// Run the agent loop over `initial_messages`.
///
/// Returns immediately; the loop runs in a spawned task and reports through
/// the event stream.  The stream's terminal future ALWAYS resolves with the
/// final message list: uncaught failures become a fatal `error` event
/// followed by `agent_end` with the pre-error conversation.
pub fn run_agent(config: AgentLoopConfig, initial_messages: Vec<Message>) -> AgentStream {
    let stream = agent_stream();
    let out = stream.clone();

    tokio::spawn(async move {
        let mut messages = initial_messages;
        out.push(AgentEvent::AgentStart);
        out.push(AgentEvent::StatusChange {
            status: AgentStatus::Busy,
            retry: None,
        });
        if let Err(err) = drive_loop(&config, &mut messages, &out).await {
            warn!(error = %err, "agent loop failed");
            out.push(AgentEvent::Error {
                error: SerializedError::from_anyhow(&err),
                fatal: true,
            });
        }
        out.push(AgentEvent::StatusChange {
            status: AgentStatus::Idle,
            retry: None,
        });
        out.push(AgentEvent::AgentEnd { messages });
    });

    stream
}

/// The turn state machine.  Mutates `messages` in place so the caller can
/// hand the partial conversation to `agent_end` even when a turn fails.
async fn drive_loop(
    config: &AgentLoopConfig,
    messages: &mut Vec<Message>,
    out: &AgentStream,
) -> anyhow::Result<()> {
    let mut turn_count = 0u32;
    let item_ids = std::sync::atomic::AtomicU64::new(0);
    let next_item_id = || item_ids.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
    let mut detector = LoopDetector::new();
    let system_prompt = prompts::system_prompt(config.mode, Some(&config.system_prompt), &[]);
    let tools = tools_for_mode(&config.tools, config.mode);

    while turn_count < config.max_turns {
        if config.cancel.is_cancelled() {
            break;
        }
        drain_steering(config, messages, out);

        turn_count += 1;
        let turn_id = format!("turn-{turn_count}");
        out.push(AgentEvent::TurnStart {
            turn_id: turn_id.clone(),
        });

        // One model call, retry-wrapped.  Streaming events are re-tagged
        // with this turn's item id.
        let assistant = stream_turn(
            config,
            &system_prompt,
            &tools,
            messages,
            out,
            next_item_id(),
        )
        .await?;

        messages.push(Message::Assistant(assistant.clone()));
        out.push(AgentEvent::Usage {
            usage: assistant.usage,
            cost: catalog::cost(&config.model, assistant.usage.input, assistant.usage.output),
        });

        let tool_calls: Vec<(String, String, Value)> = assistant
            .tool_calls()
            .into_iter()
            .map(|(id, name, input)| (id.to_string(), name.to_string(), input.clone()))
            .collect();
        if tool_calls.is_empty() {
            out.push(AgentEvent::TurnEnd {
                turn_id,
                message: assistant,
                tool_results: vec![],
            });
            break;
        }

        drain_steering(config, messages, out);

        let mut tool_results = Vec::new();
        for (call_id, tool_name, input) in &tool_calls {
            if config.cancel.is_cancelled() {
                break;
            }
            let item_id = next_item_id();
            out.push(AgentEvent::ToolStart {
                item_id,
                tool_call_id: call_id.clone(),
                tool_name: tool_name.clone(),
                input: input.clone(),
            });

            let output = execute_tool(config, out, item_id, call_id, tool_name, input).await;
            let is_error = output.is_error();
            out.push(AgentEvent::ToolEnd {
                item_id,
                tool_call_id: call_id.clone(),
                tool_name: tool_name.clone(),
                output: output.output.clone(),
                is_error,
            });
            if let Some(meta) = &output.metadata {
                if let Some(kid) = meta.get("knowledge_id").and_then(Value::as_str) {
                    out.push(AgentEvent::KnowledgeSaved {
                        knowledge_id: kid.to_string(),
                        content: meta
                            .get("knowledge_content")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                    });
                }
            }

            let result = Message::tool_result(call_id.clone(), output.output, is_error);
            if let Message::ToolResult(tr) = &result {
                tool_results.push(tr.clone());
            }
            messages.push(result);
            detector.record(tool_name, input);
        }

        if let Some(hit) = detector.check() {
            debug!(pattern_length = hit.pattern_length, tool = %hit.tool_name, "tool-call loop detected");
            out.push(AgentEvent::LoopDetected {
                pattern_length: hit.pattern_length,
                tool_name: hit.tool_name.clone(),
            });
            messages.push(Message::user(prompts::loop_warning(
                hit.pattern_length,
                &hit.tool_name,
            )));
            detector.clear();
        }

        drain_steering(config, messages, out);

        out.push(AgentEvent::TurnEnd {
            turn_id,
            message: assistant,
            tool_results,
        });
    }

    Ok(())
}

/// Stream one assistant message out of the provider, forwarding deltas as
/// `message_*` events under `item_id`.
async fn stream_turn(
    config: &AgentLoopConfig,
    system_prompt: &str,
    tools: &[ToolSchema],
    messages: &[Message],
    out: &AgentStream,
    item_id: u64,
) -> anyhow::Result<AssistantMessage> {
    let mut req = ProviderRequest::new(&config.model, messages.to_vec());
    req.system_prompt = system_prompt.to_string();
    req.tools = tools.to_vec();
    req.cancel = config.cancel.clone();
    req.max_tokens = config.max_tokens;
    req.temperature = config.temperature;

    let retry_out = out.clone();
    let provider_stream = stream_with_retry(
        Arc::clone(&config.provider),
        req,
        config.retry,
        Some(Box::new(move |attempt, delay_ms, err| {
            retry_out.push(AgentEvent::StatusChange {
                status: AgentStatus::Retry,
                retry: Some(RetryStatus {
                    attempt,
                    delay_ms,
                    message: err.to_string(),
                }),
            });
        })),
    );

    let mut started = false;
    let mut blocks: Vec<ContentBlock> = Vec::new();
    let mut final_message: Option<AssistantMessage> = None;

    let ensure_started = |blocks: &[ContentBlock], out: &AgentStream, started: &mut bool| {
        if !*started {
            *started = true;
            out.push(AgentEvent::MessageStart {
                item_id,
                message: partial_message(&config.model, blocks),
            });
        }
    };

    while let Some(event) = provider_stream.next().await {
        match event {
            ProviderEvent::Start => {}
            ProviderEvent::TextDelta { delta } | ProviderEvent::ThinkingDelta { delta } => {
                ensure_started(&blocks, out, &mut started);
                out.push(AgentEvent::MessageDelta {
                    item_id,
                    message: partial_message(&config.model, &blocks),
                    delta,
                });
            }
            ProviderEvent::ToolCallStart { .. } | ProviderEvent::ToolCallDelta { .. } => {
                ensure_started(&blocks, out, &mut started);
            }
            ProviderEvent::TextEnd { text } => blocks.push(ContentBlock::Text { text }),
            ProviderEvent::ThinkingEnd { thinking } => {
                blocks.push(ContentBlock::Thinking { thinking })
            }
            ProviderEvent::ToolCallEnd { id, name, input } => {
                blocks.push(ContentBlock::ToolCall { id, name, input })
            }
            ProviderEvent::Usage { .. } => {}
            ProviderEvent::Done { message, .. } => {
                ensure_started(&blocks, out, &mut started);
                out.push(AgentEvent::MessageEnd {
                    item_id,
                    message: message.clone(),
                });
                final_message = Some(message);
            }
            ProviderEvent::Error { error } => return Err(error.into()),
        }
    }

    final_message.ok_or_else(|| anyhow::anyhow!("provider stream ended without a message"))
}

fn partial_message(model: &str, blocks: &[ContentBlock]) -> AssistantMessage {
    AssistantMessage {
        content: blocks.to_vec(),
        model: model.to_string(),
        usage: TokenUsage::default(),
        stop_reason: StopReason::EndTurn,
        timestamp: Utc::now(),
    }
}

async fn execute_tool(
    config: &AgentLoopConfig,
    out: &AgentStream,
    item_id: u64,
    call_id: &str,
    tool_name: &str,
    input: &Value,
) -> diligent_tools::ToolOutput {
    if config.mode == AgentMode::Plan && !READ_ONLY_TOOLS.contains(&tool_name) {
        return diligent_tools::ToolOutput::error(format!(
            "Error: tool '{tool_name}' is not available in plan mode"
        ));
    }

    let update_out = out.clone();
    let update_ids = (item_id, call_id.to_string(), tool_name.to_string());
    let mut ctx = ToolContext::new(call_id);
    ctx.cancel = config.cancel.clone();
    ctx.approve = config.approve.clone();
    ctx.on_update = Some(Arc::new(move |partial: String| {
        update_out.push(AgentEvent::ToolUpdate {
            item_id: update_ids.0,
            tool_call_id: update_ids.1.clone(),
            tool_name: update_ids.2.clone(),
            partial_result: partial,
        });
    }));

    config.tools.execute(tool_name, input.clone(), &ctx).await
}

/// The tool schemas offered to the model in `mode`.  Plan mode restricts to
/// the read-only set; other modes pass the registry through in registration
/// order.
fn tools_for_mode(registry: &ToolRegistry, mode: AgentMode) -> Vec<ToolSchema> {
    registry
        .schemas()
        .into_iter()
        .filter(|(name, _, _)| mode != AgentMode::Plan || READ_ONLY_TOOLS.contains(&name.as_str()))
        .map(|(name, description, json_schema)| ToolSchema {
            name,
            description,
            json_schema,
        })
        .collect()
}

fn drain_steering(config: &AgentLoopConfig, messages: &mut Vec<Message>, out: &AgentStream) {
    let Some(steering) = &config.steering else {
        return;
    };
    let queued = steering();
    if queued.is_empty() {
        return;
    }
    let count = queued.len();
    messages.extend(queued);
    out.push(AgentEvent::SteeringInjected {
        message_count: count,
    });
}

// Unit tests for the loop live in `tests.rs`, which drives full scenarios
// against the scripted provider; the helpers here are covered there.
