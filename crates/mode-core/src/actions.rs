use std::path::PathBuf;

use crate::menu::MenuOutcome;
use crate::prompt::ParsedReply;

#[derive(Debug, Clone)]
pub enum ModeAction {
    User(UserAction),
    Runtime(RuntimeAction),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserAction {
    ToggleChat,
    ChatInput(char),
    ChatBackspace,
    ChatPaste(String),
    Submit,
    Confirm,
    Decline,
    Cancel,
    Quit,
    MenuUp,
    MenuDown,
    MenuSelect,
    MenuBack,
    ScrollTranscript(ScrollDirection),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollDirection {
    Up,
    Down,
    Bottom,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelFailure {
    Unavailable(String),
    Timeout { after_ms: u64 },
}

impl ModelFailure {
    pub fn notice(&self) -> String {
        match self {
            Self::Unavailable(detail) => format!("AI service not available: {detail}"),
            Self::Timeout { after_ms } => format!("AI request timed out after {after_ms} ms"),
        }
    }
}

/// Exit status and captured output tails of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReport {
    pub exit_code: i32,
    pub stdout_tail: String,
    pub stderr_tail: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandFailure {
    TimedOut {
        after_ms: u64,
        stdout_tail: String,
        stderr_tail: String,
    },
    Spawn(String),
}

impl CommandFailure {
    pub fn notice(&self, command: &str) -> String {
        match self {
            Self::TimedOut { after_ms, .. } => {
                format!("`{command}` timed out after {after_ms} ms and was killed")
            }
            Self::Spawn(detail) => format!("failed to start `{command}`: {detail}"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum RuntimeAction {
    ModelReplied {
        generation: u64,
        result: Result<ParsedReply, ModelFailure>,
    },
    CommandFinished {
        generation: u64,
        command: String,
        result: Result<CommandReport, CommandFailure>,
        new_cwd: Option<PathBuf>,
        audit_error: Option<String>,
    },
    MenuCompleted {
        outcome: MenuOutcome,
    },
    ModelProbed {
        available: bool,
    },
    AuditFailed {
        detail: String,
    },
}

impl RuntimeAction {
    pub fn label(&self) -> &'static str {
        match self {
            Self::ModelReplied { .. } => "model_replied",
            Self::CommandFinished { .. } => "command_finished",
            Self::MenuCompleted { .. } => "menu_completed",
            Self::ModelProbed { .. } => "model_probed",
            Self::AuditFailed { .. } => "audit_failed",
        }
    }
}
