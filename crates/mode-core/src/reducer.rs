use std::path::PathBuf;

use tracing::debug;
use tracing::info;
use tracing::warn;

use super::actions::CommandFailure;
use super::actions::CommandReport;
use super::actions::ModeAction;
use super::actions::ModelFailure;
use super::actions::RuntimeAction;
use super::actions::ScrollDirection;
use super::actions::UserAction;
use super::command_rules;
use super::menu::MenuCursor;
use super::menu::MenuNode;
use super::menu::MenuOutcome;
use super::menu::MenuPath;
use super::menu::MenuSelection;
use super::policy_engine;
use super::policy_engine::Verdict;
use super::prompt;
use super::prompt::ParsedReply;
use super::prompt::PromptContext;
use super::state::MenuPanel;
use super::state::ModeState;
use super::state::ModelAvailability;
use super::state::SessionState;
use super::transcript::Severity;
use super::transcript::TranscriptEntry;

pub const MODEL_UNAVAILABLE_NOTICE: &str = "AI service not available. Please start Ollama.";

const SCROLL_STEP: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModeEffect {
    RequestFrame,
    RequestSuggestion {
        generation: u64,
        prompt: String,
    },
    ExecuteCommand {
        generation: u64,
        command: String,
        cwd: PathBuf,
        timeout_ms: u64,
        output_limit: usize,
        directory_change: bool,
    },
    RecordInteraction {
        role: InteractionRole,
        text: String,
    },
    DispatchMenu {
        path: MenuPath,
        cwd: PathBuf,
    },
    Quit {
        handoff: Option<PathBuf>,
    },
}

pub fn reduce(state: &mut SessionState, action: ModeAction) -> Vec<ModeEffect> {
    match action {
        ModeAction::User(user) => reduce_user(state, user),
        ModeAction::Runtime(runtime) => reduce_runtime(state, runtime),
    }
}

fn reduce_user(state: &mut SessionState, action: UserAction) -> Vec<ModeEffect> {
    match action {
        UserAction::ToggleChat => match state.mode {
            ModeState::Menu => {
                transition(state, ModeState::composing());
                vec![ModeEffect::RequestFrame]
            }
            ModeState::ChatComposing { .. } => {
                transition(state, ModeState::Menu);
                vec![ModeEffect::RequestFrame]
            }
            _ => Vec::new(),
        },
        UserAction::ChatInput(c) => edit_draft(state, |draft| {
            if !c.is_control() {
                draft.push(c);
            }
        }),
        UserAction::ChatBackspace => edit_draft(state, |draft| {
            draft.pop();
        }),
        UserAction::ChatPaste(text) => edit_draft(state, |draft| {
            draft.extend(
                text.chars()
                    .map(|c| if c == '\n' || c == '\t' { ' ' } else { c })
                    .filter(|c| !c.is_control()),
            );
        }),
        UserAction::Submit => {
            if let Some(draft) = state.mode.draft() {
                let text = draft.trim().to_string();
                if text.is_empty() {
                    return Vec::new();
                }
                return submit_chat(state, text);
            }
            confirm(state)
        }
        UserAction::Confirm => confirm(state),
        UserAction::Decline => {
            if !matches!(state.mode, ModeState::ChatAwaitingConfirmation { .. }) {
                return Vec::new();
            }
            info!("command declined");
            state
                .transcript
                .append(TranscriptEntry::notice(Severity::Info, "declined"));
            transition(state, ModeState::composing());
            vec![ModeEffect::RequestFrame]
        }
        UserAction::Cancel => {
            if !state.mode.is_chat() {
                return Vec::new();
            }
            // Outstanding completions carry the old generation and will be dropped.
            state.next_generation();
            info!(from = state.mode.label(), "chat cancelled");
            transition(state, ModeState::Menu);
            vec![ModeEffect::RequestFrame]
        }
        UserAction::Quit => vec![ModeEffect::Quit {
            handoff: state.handoff_directory(),
        }],
        UserAction::MenuUp => menu_move(state, |cursor, root| cursor.move_up(root)),
        UserAction::MenuDown => menu_move(state, |cursor, root| cursor.move_down(root)),
        UserAction::MenuBack => menu_move(state, |cursor, _| {
            cursor.back();
        }),
        UserAction::MenuSelect => select_menu(state),
        UserAction::ScrollTranscript(direction) => {
            state.transcript_scroll = match direction {
                ScrollDirection::Up => state.transcript_scroll.saturating_add(SCROLL_STEP),
                ScrollDirection::Down => state.transcript_scroll.saturating_sub(SCROLL_STEP),
                ScrollDirection::Bottom => 0,
            };
            vec![ModeEffect::RequestFrame]
        }
    }
}

fn transition(state: &mut SessionState, next: ModeState) {
    debug!(from = state.mode.label(), to = next.label(), "mode transition");
    state.mode = next;
}

fn edit_draft(state: &mut SessionState, edit: impl FnOnce(&mut String)) -> Vec<ModeEffect> {
    match &mut state.mode {
        ModeState::ChatComposing { draft } => {
            edit(draft);
            vec![ModeEffect::RequestFrame]
        }
        _ => Vec::new(),
    }
}

fn submit_chat(state: &mut SessionState, text: String) -> Vec<ModeEffect> {
    let generation = state.next_generation();
    let assistant = &state.config.assistant;
    let prompt = prompt::build_prompt(
        &text,
        PromptContext {
            working_directory: &state.cwd,
            base_path: assistant.base_path(),
        },
        state.transcript.recent(assistant.context_entries),
    );
    let log_interactions = assistant.log_commands;

    state.transcript.append(TranscriptEntry::user(text.as_str()));
    state.transcript_scroll = 0;
    info!(generation, "chat submitted");

    let mut effects = Vec::with_capacity(3);
    if log_interactions {
        effects.push(ModeEffect::RecordInteraction {
            role: InteractionRole::User,
            text: text.clone(),
        });
    }
    transition(
        state,
        ModeState::ChatAwaitingModel {
            pending_user_text: text,
        },
    );
    effects.push(ModeEffect::RequestSuggestion { generation, prompt });
    effects.push(ModeEffect::RequestFrame);
    effects
}

fn confirm(state: &mut SessionState) -> Vec<ModeEffect> {
    let ModeState::ChatAwaitingConfirmation {
        command,
        explanation,
    } = &state.mode
    else {
        return Vec::new();
    };
    let (command, explanation) = (command.clone(), explanation.clone());
    info!(%command, "command confirmed");
    let mut effects = start_execution(state, command, explanation);
    effects.push(ModeEffect::RequestFrame);
    effects
}

/// Moves to `ChatExecuting`. Re-evaluates the policy so nothing denied can reach the executor.
///
/// While an earlier command is still running the candidate is parked in
/// `ChatAwaitingConfirmation` instead; confirming it again after that command reports back
/// starts it.
fn start_execution(
    state: &mut SessionState,
    command: String,
    explanation: String,
) -> Vec<ModeEffect> {
    let decision = policy_engine::evaluate(&command, &state.cwd, &state.config.assistant);
    if decision.verdict == Verdict::Deny {
        warn!(%command, reason = %decision.reason, "execution refused");
        deny(state, &decision.reason);
        return Vec::new();
    }

    if let Some(running) = state.command_in_flight {
        info!(%command, running, "previous command still running, holding candidate");
        state.transcript.append(TranscriptEntry::notice(
            Severity::Info,
            format!("a previous command is still running; confirm `{command}` once it finishes"),
        ));
        transition(
            state,
            ModeState::ChatAwaitingConfirmation {
                command,
                explanation,
            },
        );
        return Vec::new();
    }

    let generation = state.next_generation();
    let directory_change = command_rules::parse(&command)
        .map(|parsed| command_rules::is_directory_change(&parsed))
        .unwrap_or(false);
    let assistant = &state.config.assistant;
    let effect = ModeEffect::ExecuteCommand {
        generation,
        command: command.clone(),
        cwd: state.cwd.clone(),
        timeout_ms: assistant.command_timeout_ms,
        output_limit: assistant.output_limit_bytes,
        directory_change,
    };
    state.command_in_flight = Some(generation);
    transition(state, ModeState::ChatExecuting { command });
    vec![effect]
}

fn deny(state: &mut SessionState, reason: &str) {
    state.transcript.append(TranscriptEntry::notice(
        Severity::Warning,
        format!("denied: {reason}"),
    ));
    transition(state, ModeState::composing());
}

fn menu_move(
    state: &mut SessionState,
    step: impl FnOnce(&mut MenuCursor, &MenuNode),
) -> Vec<ModeEffect> {
    if state.mode != ModeState::Menu {
        return Vec::new();
    }
    let root = state.menu.root.clone();
    step(&mut state.menu.cursor, &root);
    vec![ModeEffect::RequestFrame]
}

fn select_menu(state: &mut SessionState) -> Vec<ModeEffect> {
    if state.mode != ModeState::Menu || state.menu.dispatching {
        return Vec::new();
    }
    let root = state.menu.root.clone();
    match state.menu.cursor.select(&root) {
        Some(MenuSelection::Opened) => {
            state.menu.panel = None;
            vec![ModeEffect::RequestFrame]
        }
        Some(MenuSelection::Leaf) => {
            let path = state.menu.cursor.path(&root);
            debug!(path = %path.join(), "menu dispatch");
            state.menu.dispatching = true;
            vec![
                ModeEffect::DispatchMenu {
                    path,
                    cwd: state.cwd.clone(),
                },
                ModeEffect::RequestFrame,
            ]
        }
        None => Vec::new(),
    }
}

fn reduce_runtime(state: &mut SessionState, action: RuntimeAction) -> Vec<ModeEffect> {
    match action {
        RuntimeAction::ModelReplied { generation, result } => {
            if generation != state.generation
                || !matches!(state.mode, ModeState::ChatAwaitingModel { .. })
            {
                debug!(generation, current = state.generation, "dropping stale model reply");
                return Vec::new();
            }
            match result {
                Ok(reply) => apply_reply(state, reply),
                Err(failure) => {
                    warn!(?failure, "model request failed");
                    apply_model_failure(state, &failure);
                    vec![ModeEffect::RequestFrame]
                }
            }
        }
        RuntimeAction::CommandFinished {
            generation,
            command,
            result,
            new_cwd,
            audit_error,
        } => {
            let released = state.command_in_flight == Some(generation);
            if released {
                state.command_in_flight = None;
            }
            if generation != state.generation
                || !matches!(state.mode, ModeState::ChatExecuting { .. })
            {
                debug!(generation, %command, "dropping stale command result");
                return if released {
                    vec![ModeEffect::RequestFrame]
                } else {
                    Vec::new()
                };
            }
            apply_command_result(state, command, result, new_cwd);
            if let Some(detail) = audit_error {
                state.transcript.append(TranscriptEntry::notice(
                    Severity::Warning,
                    format!("audit log write failed: {detail}"),
                ));
            }
            transition(state, ModeState::composing());
            vec![ModeEffect::RequestFrame]
        }
        RuntimeAction::MenuCompleted { outcome } => {
            state.menu.dispatching = false;
            match outcome {
                MenuOutcome::NoOp => vec![ModeEffect::RequestFrame],
                MenuOutcome::Display {
                    title,
                    lines,
                    cwd_change,
                } => {
                    if let Some(cwd) = cwd_change {
                        info!(cwd = %cwd.display(), "menu changed directory");
                        state.cwd = cwd;
                    }
                    state.menu.panel = Some(MenuPanel { title, lines });
                    vec![ModeEffect::RequestFrame]
                }
                MenuOutcome::Exit { handoff } => vec![ModeEffect::Quit {
                    handoff: handoff.or_else(|| state.handoff_directory()),
                }],
            }
        }
        RuntimeAction::ModelProbed { available } => {
            state.model = if available {
                ModelAvailability::Available
            } else {
                ModelAvailability::Unavailable
            };
            if !available {
                state.transcript.append(TranscriptEntry::notice(
                    Severity::Warning,
                    MODEL_UNAVAILABLE_NOTICE,
                ));
            }
            vec![ModeEffect::RequestFrame]
        }
        RuntimeAction::AuditFailed { detail } => {
            state.transcript.append(TranscriptEntry::notice(
                Severity::Warning,
                format!("audit log write failed: {detail}"),
            ));
            vec![ModeEffect::RequestFrame]
        }
    }
}

fn apply_reply(state: &mut SessionState, reply: ParsedReply) -> Vec<ModeEffect> {
    let ParsedReply {
        explanation,
        proposed_command,
    } = reply;
    let proposed_command = proposed_command
        .map(|command| command.trim().to_string())
        .filter(|command| !command.is_empty());

    state.model = ModelAvailability::Available;
    state.transcript.append(TranscriptEntry::reply(
        explanation.as_str(),
        proposed_command.as_deref().map(Into::into),
    ));

    let mut effects = Vec::new();
    if state.config.assistant.log_commands {
        let text = match &proposed_command {
            Some(command) => format!("{explanation} [command: {command}]"),
            None => explanation.clone(),
        };
        effects.push(ModeEffect::RecordInteraction {
            role: InteractionRole::Assistant,
            text,
        });
    }

    let Some(command) = proposed_command else {
        transition(state, ModeState::composing());
        effects.push(ModeEffect::RequestFrame);
        return effects;
    };

    let decision = policy_engine::evaluate(&command, &state.cwd, &state.config.assistant);
    info!(
        %command,
        verdict = decision.verdict.label(),
        rule = decision.matched_rule,
        "policy decision"
    );
    match decision.verdict {
        Verdict::Deny => deny(state, &decision.reason),
        Verdict::Confirm => transition(
            state,
            ModeState::ChatAwaitingConfirmation {
                command,
                explanation,
            },
        ),
        Verdict::Allow => effects.extend(start_execution(state, command, explanation)),
    }
    effects.push(ModeEffect::RequestFrame);
    effects
}

fn apply_model_failure(state: &mut SessionState, failure: &ModelFailure) {
    if matches!(failure, ModelFailure::Unavailable(_)) {
        state.model = ModelAvailability::Unavailable;
    }
    state
        .transcript
        .append(TranscriptEntry::notice(Severity::Error, failure.notice()));
    transition(state, ModeState::composing());
}

fn apply_command_result(
    state: &mut SessionState,
    command: String,
    result: Result<CommandReport, CommandFailure>,
    new_cwd: Option<PathBuf>,
) {
    match result {
        Ok(report) => {
            info!(
                %command,
                exit_code = report.exit_code,
                duration_ms = report.duration_ms,
                "command finished"
            );
            let succeeded = report.exit_code == 0;
            state.transcript.append(TranscriptEntry::CommandResult {
                command: command.into(),
                exit_code: report.exit_code,
                stdout_tail: report.stdout_tail.into(),
                stderr_tail: report.stderr_tail.into(),
                duration_ms: report.duration_ms,
                timestamp: chrono::Utc::now(),
            });
            if let Some(cwd) = new_cwd.filter(|_| succeeded) {
                change_directory(state, cwd);
            }
        }
        Err(failure) => {
            warn!(%command, ?failure, "command failed");
            let notice = failure.notice(&command);
            if let CommandFailure::TimedOut {
                after_ms,
                stdout_tail,
                stderr_tail,
            } = failure
            {
                // Partial output captured before the kill.
                state.transcript.append(TranscriptEntry::CommandResult {
                    command: command.into(),
                    exit_code: -1,
                    stdout_tail: stdout_tail.into(),
                    stderr_tail: stderr_tail.into(),
                    duration_ms: after_ms,
                    timestamp: chrono::Utc::now(),
                });
            }
            state
                .transcript
                .append(TranscriptEntry::notice(Severity::Error, notice));
        }
    }
}

fn change_directory(state: &mut SessionState, cwd: PathBuf) {
    if !cwd.starts_with(state.config.assistant.base_path()) {
        state.transcript.append(TranscriptEntry::notice(
            Severity::Warning,
            format!("denied: outside allowed path: {}", cwd.display()),
        ));
        return;
    }
    info!(cwd = %cwd.display(), "working directory changed");
    state.cwd = cwd;
}

#[cfg(test)]
mod tests;
