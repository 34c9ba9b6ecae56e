use std::path::PathBuf;
use std::sync::Arc;

use pretty_assertions::assert_eq;

pub(super) use super::reduce;
pub(super) use super::InteractionRole;
pub(super) use super::ModeEffect;
pub(super) use super::MODEL_UNAVAILABLE_NOTICE;
pub(super) use crate::actions::CommandFailure;
pub(super) use crate::actions::CommandReport;
pub(super) use crate::actions::ModeAction;
pub(super) use crate::actions::ModelFailure;
pub(super) use crate::actions::RuntimeAction;
pub(super) use crate::actions::ScrollDirection;
pub(super) use crate::actions::UserAction;
pub(super) use crate::config::Config;
pub(super) use crate::menu::MenuNode;
pub(super) use crate::menu::MenuOutcome;
pub(super) use crate::menu::MenuPath;
pub(super) use crate::prompt::ParsedReply;
pub(super) use crate::state::ModeState;
pub(super) use crate::state::ModelAvailability;
pub(super) use crate::state::SessionState;
pub(super) use crate::transcript::Severity;
pub(super) use crate::transcript::TranscriptEntry;


const BASE: &str = "/home/alice/work";
const CWD: &str = "/home/alice/work/project";

fn config_with(edit: impl FnOnce(&mut Config)) -> Arc<Config> {
    let mut config = Config::default();
    config.assistant.allowed_base_path = Some(PathBuf::from(BASE));
    config.assistant.home_directory = Some(PathBuf::from("/home/alice"));
    edit(&mut config);
    Arc::new(config)
}

fn menu_root() -> MenuNode {
    MenuNode::submenu(
        "main",
        "Main Menu",
        "",
        vec![
            MenuNode::submenu(
                "projects",
                "Projects",
                "",
                vec![MenuNode::leaf("overview", "Overview", "")],
            ),
            MenuNode::leaf("help", "Help", ""),
        ],
    )
}

fn state_with(edit: impl FnOnce(&mut Config)) -> SessionState {
    SessionState::new(config_with(edit), PathBuf::from(CWD), Arc::new(menu_root()))
}

fn state() -> SessionState {
    state_with(|_| {})
}

fn run_user(state: &mut SessionState, action: UserAction) -> Vec<ModeEffect> {
    reduce(state, ModeAction::User(action))
}

fn run_runtime(state: &mut SessionState, action: RuntimeAction) -> Vec<ModeEffect> {
    reduce(state, ModeAction::Runtime(action))
}

fn type_text(state: &mut SessionState, text: &str) {
    for c in text.chars() {
        run_user(state, UserAction::ChatInput(c));
    }
}

/// Enters chat if needed, types `text`, submits it and returns the request generation.
fn submit(state: &mut SessionState, text: &str) -> u64 {
    if state.mode == ModeState::Menu {
        run_user(state, UserAction::ToggleChat);
    }
    type_text(state, text);
    let effects = run_user(state, UserAction::Submit);
    effects
        .iter()
        .find_map(|effect| match effect {
            ModeEffect::RequestSuggestion { generation, .. } => Some(*generation),
            _ => None,
        })
        .unwrap_or_else(|| panic!("submit of {text:?} issued no request: {effects:?}"))
}

fn model_reply(
    state: &mut SessionState,
    generation: u64,
    explanation: &str,
    command: Option<&str>,
) -> Vec<ModeEffect> {
    run_runtime(
        state,
        RuntimeAction::ModelReplied {
            generation,
            result: Ok(ParsedReply {
                explanation: explanation.to_string(),
                proposed_command: command.map(str::to_string),
            }),
        },
    )
}

fn execution(effects: &[ModeEffect]) -> Option<(u64, String)> {
    effects.iter().find_map(|effect| match effect {
        ModeEffect::ExecuteCommand {
            generation,
            command,
            ..
        } => Some((*generation, command.clone())),
        _ => None,
    })
}

fn report(exit_code: i32, stdout: &str) -> CommandReport {
    CommandReport {
        exit_code,
        stdout_tail: stdout.to_string(),
        stderr_tail: String::new(),
        duration_ms: 12,
    }
}

fn finish(
    state: &mut SessionState,
    generation: u64,
    command: &str,
    result: Result<CommandReport, CommandFailure>,
) -> Vec<ModeEffect> {
    run_runtime(
        state,
        RuntimeAction::CommandFinished {
            generation,
            command: command.to_string(),
            result,
            new_cwd: None,
            audit_error: None,
        },
    )
}

fn kinds(state: &SessionState) -> Vec<&'static str> {
    state
        .transcript
        .all()
        .map(|record| record.entry.kind())
        .collect()
}

fn last_notice(state: &SessionState) -> Option<(Severity, String)> {
    state.transcript.all().rev().find_map(|record| match &record.entry {
        TranscriptEntry::SystemNotice { text, severity } => Some((*severity, text.to_string())),
        _ => None,
    })
}

fn assert_composing_with_empty_draft(state: &SessionState) {
    assert_eq!(state.mode, ModeState::composing());
}
