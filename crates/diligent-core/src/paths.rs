// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;

/// On-disk layout of a project's `.diligent/` state directory.
#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    root: PathBuf,
}

impl WorkspacePaths {
    pub fn new(project_root: impl AsRef<Path>) -> Self {
        Self {
            root: project_root.as_ref().join(".diligent"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    pub fn knowledge_dir(&self) -> PathBuf {
        self.root.join("knowledge")
    }

    pub fn knowledge_file(&self) -> PathBuf {
        self.knowledge_dir().join("knowledge.jsonl")
    }

    pub fn skills_dir(&self) -> PathBuf {
        self.root.join("skills")
    }

    /// Create the directory layout and a `.gitignore` that keeps the
    /// machine-local state (sessions, knowledge) out of version control.
    pub fn ensure_layout(&self) -> anyhow::Result<()> {
        for dir in [self.sessions_dir(), self.knowledge_dir(), self.skills_dir()] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        let gitignore = self.root.join(".gitignore");
        if !gitignore.exists() {
            std::fs::write(&gitignore, "sessions/\nknowledge/\n")
                .with_context(|| format!("writing {}", gitignore.display()))?;
        }
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_created_with_gitignore() {
        let dir = tempfile::tempdir().unwrap();
        let paths = WorkspacePaths::new(dir.path());
        paths.ensure_layout().unwrap();
        assert!(paths.sessions_dir().is_dir());
        assert!(paths.knowledge_dir().is_dir());
        assert!(paths.skills_dir().is_dir());
        let gi = std::fs::read_to_string(paths.root().join(".gitignore")).unwrap();
        assert!(gi.contains("sessions/"));
        assert!(gi.contains("knowledge/"));
    }

    #[test]
    fn existing_gitignore_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let paths = WorkspacePaths::new(dir.path());
        std::fs::create_dir_all(paths.root()).unwrap();
        std::fs::write(paths.root().join(".gitignore"), "custom\n").unwrap();
        paths.ensure_layout().unwrap();
        let gi = std::fs::read_to_string(paths.root().join(".gitignore")).unwrap();
        assert_eq!(gi, "custom\n");
    }

    #[test]
    fn ensure_layout_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let paths = WorkspacePaths::new(dir.path());
        paths.ensure_layout().unwrap();
        paths.ensure_layout().unwrap();
    }
}
