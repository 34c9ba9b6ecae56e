use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

/// One approved shell command, ready to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub command: String,
    pub cwd: PathBuf,
    pub timeout: Duration,
    /// Per-stream capture limit in bytes; the tail is kept.
    pub output_limit: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

/// Body of `POST {endpoint}/api/generate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerateRequest<'a> {
    pub model: &'a str,
    pub prompt: &'a str,
    pub stream: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GenerateResponse {
    #[serde(default)]
    pub response: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditKind {
    Command,
    User,
    Assistant,
}

impl AuditKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Command => "COMMAND",
            Self::User => "USER",
            Self::Assistant => "AI",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    pub kind: AuditKind,
    pub text: String,
    pub exit_code: Option<i32>,
}

impl AuditRecord {
    pub fn command(command: &str, exit_code: Option<i32>) -> Self {
        Self {
            kind: AuditKind::Command,
            text: command.to_string(),
            exit_code,
        }
    }

    pub fn interaction(kind: AuditKind, text: &str) -> Self {
        Self {
            kind,
            text: text.to_string(),
            exit_code: None,
        }
    }
}
