use std::path::PathBuf;
use std::sync::Arc;

use crate::config::Config;
use crate::menu::MenuCursor;
use crate::menu::MenuNode;
use crate::transcript::TranscriptStore;

/// The single active interaction mode. The chat draft lives inside `ChatComposing`, so
/// leaving that state drops it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModeState {
    Menu,
    ChatComposing {
        draft: String,
    },
    ChatAwaitingModel {
        pending_user_text: String,
    },
    ChatAwaitingConfirmation {
        command: String,
        explanation: String,
    },
    ChatExecuting {
        command: String,
    },
}

impl ModeState {
    pub fn composing() -> Self {
        Self::ChatComposing {
            draft: String::new(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Menu => "Menu",
            Self::ChatComposing { .. } => "Chat",
            Self::ChatAwaitingModel { .. } => "Thinking",
            Self::ChatAwaitingConfirmation { .. } => "Confirm",
            Self::ChatExecuting { .. } => "Running",
        }
    }

    pub fn is_chat(&self) -> bool {
        !matches!(self, Self::Menu)
    }

    pub fn draft(&self) -> Option<&str> {
        match self {
            Self::ChatComposing { draft } => Some(draft),
            _ => None,
        }
    }

    /// True while a worker owns the outcome of this state.
    pub fn is_waiting(&self) -> bool {
        matches!(
            self,
            Self::ChatAwaitingModel { .. } | Self::ChatExecuting { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuPanel {
    pub title: String,
    pub lines: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MenuState {
    pub root: Arc<MenuNode>,
    pub cursor: MenuCursor,
    pub panel: Option<MenuPanel>,
    pub dispatching: bool,
}

impl MenuState {
    pub fn new(root: Arc<MenuNode>) -> Self {
        Self {
            root,
            cursor: MenuCursor::default(),
            panel: None,
            dispatching: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ModelAvailability {
    #[default]
    Unknown,
    Available,
    Unavailable,
}

/// Root aggregate for one run of the program. Only the reducer mutates it.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub mode: ModeState,
    pub cwd: PathBuf,
    pub launch_cwd: PathBuf,
    pub transcript: TranscriptStore,
    pub config: Arc<Config>,
    /// Bumped whenever pending chat work is abandoned or issued. Completions carrying an
    /// older value are dropped.
    pub generation: u64,
    pub menu: MenuState,
    /// Lines scrolled up from the bottom of the transcript.
    pub transcript_scroll: usize,
    pub model: ModelAvailability,
    /// Generation of the command whose process may still be alive. Cancelling abandons the
    /// result but not the process, so this clears only when that command reports back.
    pub command_in_flight: Option<u64>,
}

impl SessionState {
    pub fn new(config: Arc<Config>, cwd: PathBuf, menu_root: Arc<MenuNode>) -> Self {
        Self {
            mode: ModeState::Menu,
            launch_cwd: cwd.clone(),
            cwd,
            transcript: TranscriptStore::new(config.assistant.transcript_capacity),
            config,
            generation: 0,
            menu: MenuState::new(menu_root),
            transcript_scroll: 0,
            model: ModelAvailability::Unknown,
            command_in_flight: None,
        }
    }

    pub fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Directory to hand back to the parent shell on exit, if it moved.
    pub fn handoff_directory(&self) -> Option<PathBuf> {
        (self.cwd != self.launch_cwd).then(|| self.cwd.clone())
    }
}
