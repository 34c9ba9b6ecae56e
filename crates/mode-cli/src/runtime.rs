use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use mode_core::actions::CommandFailure;
use mode_core::actions::CommandReport;
use mode_core::actions::ModelFailure;
use mode_core::actions::RuntimeAction;
use mode_core::menu::MenuDispatcher;
use mode_core::reducer::InteractionRole;
use mode_core::reducer::ModeEffect;
use mode_exec::AuditKind;
use mode_exec::AuditRecord;
use mode_exec::AuditSink;
use mode_exec::CommandExecutor;
use mode_exec::ExecError;
use mode_exec::ExecRequest;
use mode_exec::ModelClient;
use mode_exec::ModelError;
use tracing::debug;
use tracing::info;
use tracing::warn;

/// Collaborators the effect runner hands work to.
#[derive(Clone)]
pub struct Services {
    pub model: Arc<dyn ModelClient>,
    pub executor: Arc<dyn CommandExecutor>,
    pub audit: Arc<dyn AuditSink>,
    pub menu: Arc<dyn MenuDispatcher>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EffectOutcome {
    Continue,
    Quit { handoff: Option<PathBuf> },
}

/// Turns reducer effects into worker threads. Every worker reports back through the
/// channel as a [`RuntimeAction`]; the reducer decides whether the result is still wanted.
pub struct EffectRunner {
    services: Services,
    tx: mpsc::Sender<RuntimeAction>,
}

impl EffectRunner {
    pub fn new(services: Services, tx: mpsc::Sender<RuntimeAction>) -> Self {
        Self { services, tx }
    }

    pub fn probe_model(&self) {
        let model = Arc::clone(&self.services.model);
        let tx = self.tx.clone();
        thread::spawn(move || {
            let available = model.probe();
            info!(available, "inference service probe");
            let _ = tx.send(RuntimeAction::ModelProbed { available });
        });
    }

    pub fn run(&self, effect: ModeEffect) -> EffectOutcome {
        match effect {
            ModeEffect::RequestFrame => {}
            ModeEffect::RequestSuggestion { generation, prompt } => {
                let model = Arc::clone(&self.services.model);
                let tx = self.tx.clone();
                thread::spawn(move || {
                    let result = model.request_suggestion(&prompt).map_err(model_failure);
                    debug!(generation, ok = result.is_ok(), "model request finished");
                    let _ = tx.send(RuntimeAction::ModelReplied { generation, result });
                });
            }
            ModeEffect::ExecuteCommand {
                generation,
                command,
                cwd,
                timeout_ms,
                output_limit,
                directory_change,
            } => {
                let services = self.services.clone();
                let tx = self.tx.clone();
                thread::spawn(move || {
                    let job = CommandJob {
                        generation,
                        command,
                        cwd,
                        timeout: Duration::from_millis(timeout_ms),
                        output_limit,
                        directory_change,
                    };
                    let _ = tx.send(execute_command(
                        services.executor.as_ref(),
                        services.audit.as_ref(),
                        job,
                    ));
                });
            }
            ModeEffect::RecordInteraction { role, text } => {
                let kind = match role {
                    InteractionRole::User => AuditKind::User,
                    InteractionRole::Assistant => AuditKind::Assistant,
                };
                if let Err(err) = self
                    .services
                    .audit
                    .record(&AuditRecord::interaction(kind, &text))
                {
                    warn!(error = %err, "interaction audit failed");
                    let _ = self.tx.send(RuntimeAction::AuditFailed {
                        detail: err.to_string(),
                    });
                }
            }
            ModeEffect::DispatchMenu { path, cwd } => {
                let menu = Arc::clone(&self.services.menu);
                let tx = self.tx.clone();
                thread::spawn(move || {
                    let outcome = menu.dispatch(&path, &cwd);
                    let _ = tx.send(RuntimeAction::MenuCompleted { outcome });
                });
            }
            ModeEffect::Quit { handoff } => return EffectOutcome::Quit { handoff },
        }
        EffectOutcome::Continue
    }
}

#[derive(Debug, Clone)]
pub struct CommandJob {
    pub generation: u64,
    pub command: String,
    pub cwd: PathBuf,
    pub timeout: Duration,
    pub output_limit: usize,
    pub directory_change: bool,
}

/// Runs one approved command to completion and writes its audit line.
pub fn execute_command(
    executor: &dyn CommandExecutor,
    audit: &dyn AuditSink,
    job: CommandJob,
) -> RuntimeAction {
    // A lone `cd` only changes the child shell, so have it report where it landed.
    let shell_command = if job.directory_change {
        format!("{} && pwd", job.command)
    } else {
        job.command.clone()
    };
    let request = ExecRequest {
        command: shell_command,
        cwd: job.cwd,
        timeout: job.timeout,
        output_limit: job.output_limit,
    };

    let (result, new_cwd) = match executor.execute(&request) {
        Ok(mut output) => {
            let new_cwd = if job.directory_change && output.exit_code == 0 {
                take_last_line(&mut output.stdout).map(PathBuf::from)
            } else {
                None
            };
            let report = CommandReport {
                exit_code: output.exit_code,
                stdout_tail: output.stdout,
                stderr_tail: output.stderr,
                duration_ms: output.duration_ms,
            };
            (Ok(report), new_cwd)
        }
        Err(ExecError::TimedOut { after_ms, partial }) => (
            Err(CommandFailure::TimedOut {
                after_ms,
                stdout_tail: partial.stdout,
                stderr_tail: partial.stderr,
            }),
            None,
        ),
        Err(err @ ExecError::Spawn(_)) => (Err(CommandFailure::Spawn(err.to_string())), None),
    };

    let exit_code = result.as_ref().ok().map(|report| report.exit_code);
    let audit_error = audit
        .record(&AuditRecord::command(&job.command, exit_code))
        .err()
        .map(|err| {
            warn!(error = %err, "command audit failed");
            err.to_string()
        });

    RuntimeAction::CommandFinished {
        generation: job.generation,
        command: job.command,
        result,
        new_cwd,
        audit_error,
    }
}

/// Removes the final non-empty line from `text` and returns it.
fn take_last_line(text: &mut String) -> Option<String> {
    let trimmed_len = text.trim_end_matches(['\n', '\r']).len();
    let start = text[..trimmed_len].rfind('\n').map_or(0, |i| i + 1);
    let line = text[start..trimmed_len].to_string();
    if line.is_empty() {
        return None;
    }
    text.truncate(start);
    Some(line)
}

fn model_failure(err: ModelError) -> ModelFailure {
    match err {
        ModelError::Unavailable { detail } => ModelFailure::Unavailable(detail),
        ModelError::Timeout { after_ms } => ModelFailure::Timeout { after_ms },
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Mutex;

    use mode_core::menu::MenuOutcome;
    use mode_core::menu::MenuPath;
    use mode_core::prompt::ParsedReply;
    use mode_exec::AuditError;
    use mode_exec::CommandOutput;
    use pretty_assertions::assert_eq;

    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    struct FakeModel {
        reply: Result<ParsedReply, ModelError>,
    }

    impl ModelClient for FakeModel {
        fn request_suggestion(&self, _prompt: &str) -> Result<ParsedReply, ModelError> {
            self.reply.clone()
        }

        fn probe(&self) -> bool {
            self.reply.is_ok()
        }
    }

    #[derive(Default)]
    struct FakeExecutor {
        requests: Mutex<Vec<ExecRequest>>,
        stdout: String,
        timeout: bool,
    }

    impl CommandExecutor for FakeExecutor {
        fn execute(&self, request: &ExecRequest) -> Result<CommandOutput, ExecError> {
            self.requests
                .lock()
                .expect("requests lock")
                .push(request.clone());
            if self.timeout {
                return Err(ExecError::TimedOut {
                    after_ms: 50,
                    partial: CommandOutput {
                        stdout: "partial\n".to_string(),
                        ..CommandOutput::default()
                    },
                });
            }
            Ok(CommandOutput {
                exit_code: 0,
                stdout: self.stdout.clone(),
                stderr: String::new(),
                duration_ms: 3,
            })
        }
    }

    #[derive(Default)]
    struct MemoryAudit {
        records: Mutex<Vec<AuditRecord>>,
        fail: bool,
    }

    impl AuditSink for MemoryAudit {
        fn record(&self, record: &AuditRecord) -> Result<(), AuditError> {
            if self.fail {
                return Err(AuditError::Io {
                    path: PathBuf::from("/read-only/ai_commands.log"),
                    source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
                });
            }
            self.records.lock().expect("audit lock").push(record.clone());
            Ok(())
        }
    }

    struct FixedMenu;

    impl MenuDispatcher for FixedMenu {
        fn dispatch(&self, path: &MenuPath, _working_directory: &Path) -> MenuOutcome {
            MenuOutcome::Display {
                title: path.join(),
                lines: Vec::new(),
                cwd_change: None,
            }
        }
    }

    fn job(command: &str, directory_change: bool) -> CommandJob {
        CommandJob {
            generation: 7,
            command: command.to_string(),
            cwd: PathBuf::from("/home/alice/work"),
            timeout: Duration::from_secs(1),
            output_limit: 1024,
            directory_change,
        }
    }

    fn runner(
        reply: Result<ParsedReply, ModelError>,
        audit: Arc<MemoryAudit>,
    ) -> (EffectRunner, mpsc::Receiver<RuntimeAction>) {
        let (tx, rx) = mpsc::channel();
        let services = Services {
            model: Arc::new(FakeModel { reply }),
            executor: Arc::new(FakeExecutor::default()),
            audit,
            menu: Arc::new(FixedMenu),
        };
        (EffectRunner::new(services, tx), rx)
    }

    #[test]
    fn plain_command_is_run_and_audited() {
        let executor = FakeExecutor {
            stdout: "a.txt\n".to_string(),
            ..FakeExecutor::default()
        };
        let audit = MemoryAudit::default();
        let action = execute_command(&executor, &audit, job("ls", false));

        let RuntimeAction::CommandFinished {
            generation,
            command,
            result,
            new_cwd,
            audit_error,
        } = action
        else {
            panic!("expected command result");
        };
        assert_eq!(generation, 7);
        assert_eq!(command, "ls");
        assert_eq!(result.expect("report").stdout_tail, "a.txt\n");
        assert_eq!(new_cwd, None);
        assert_eq!(audit_error, None);
        assert_eq!(
            executor.requests.lock().expect("lock")[0].command,
            "ls".to_string()
        );
        assert_eq!(
            *audit.records.lock().expect("lock"),
            vec![AuditRecord::command("ls", Some(0))]
        );
    }

    #[test]
    fn directory_change_reads_resolved_directory() {
        let executor = FakeExecutor {
            stdout: "/home/alice/work/api\n".to_string(),
            ..FakeExecutor::default()
        };
        let audit = MemoryAudit::default();
        let action = execute_command(&executor, &audit, job("cd api", true));

        let RuntimeAction::CommandFinished {
            result, new_cwd, ..
        } = action
        else {
            panic!("expected command result");
        };
        assert_eq!(
            executor.requests.lock().expect("lock")[0].command,
            "cd api && pwd"
        );
        assert_eq!(new_cwd, Some(PathBuf::from("/home/alice/work/api")));
        assert_eq!(result.expect("report").stdout_tail, "");
        // The audit line names what was proposed, not the wrapped form.
        assert_eq!(
            *audit.records.lock().expect("lock"),
            vec![AuditRecord::command("cd api", Some(0))]
        );
    }

    #[test]
    fn timeout_maps_to_failure_without_exit_code() {
        let executor = FakeExecutor {
            timeout: true,
            ..FakeExecutor::default()
        };
        let audit = MemoryAudit::default();
        let action = execute_command(&executor, &audit, job("sleep 60", false));

        let RuntimeAction::CommandFinished { result, .. } = action else {
            panic!("expected command result");
        };
        assert_eq!(
            result,
            Err(CommandFailure::TimedOut {
                after_ms: 50,
                stdout_tail: "partial\n".to_string(),
                stderr_tail: String::new(),
            })
        );
        assert_eq!(
            *audit.records.lock().expect("lock"),
            vec![AuditRecord::command("sleep 60", None)]
        );
    }

    #[test]
    fn audit_failure_travels_with_the_result() {
        let executor = FakeExecutor::default();
        let audit = MemoryAudit {
            fail: true,
            ..MemoryAudit::default()
        };
        let action = execute_command(&executor, &audit, job("ls", false));
        let RuntimeAction::CommandFinished {
            result,
            audit_error,
            ..
        } = action
        else {
            panic!("expected command result");
        };
        assert!(result.is_ok());
        assert!(audit_error.is_some_and(|detail| detail.contains("ai_commands.log")));
    }

    #[test]
    fn take_last_line_handles_trailing_newlines() {
        let mut text = "moved\n/srv/app\n\n".to_string();
        assert_eq!(take_last_line(&mut text), Some("/srv/app".to_string()));
        assert_eq!(text, "moved\n");

        let mut empty = String::new();
        assert_eq!(take_last_line(&mut empty), None);
    }

    #[test]
    fn suggestion_reply_is_sent_with_its_generation() {
        let reply = ParsedReply {
            explanation: "Lists files.".to_string(),
            proposed_command: Some("ls".to_string()),
        };
        let (runner, rx) = runner(Ok(reply.clone()), Arc::new(MemoryAudit::default()));
        let outcome = runner.run(ModeEffect::RequestSuggestion {
            generation: 3,
            prompt: "prompt".to_string(),
        });
        assert_eq!(outcome, EffectOutcome::Continue);

        let RuntimeAction::ModelReplied { generation, result } =
            rx.recv_timeout(WAIT).expect("reply")
        else {
            panic!("expected model reply");
        };
        assert_eq!(generation, 3);
        assert_eq!(result, Ok(reply));
    }

    #[test]
    fn model_errors_become_failures() {
        let (runner, rx) = runner(
            Err(ModelError::Timeout { after_ms: 30_000 }),
            Arc::new(MemoryAudit::default()),
        );
        runner.run(ModeEffect::RequestSuggestion {
            generation: 1,
            prompt: String::new(),
        });
        let RuntimeAction::ModelReplied { result, .. } = rx.recv_timeout(WAIT).expect("reply")
        else {
            panic!("expected model reply");
        };
        assert_eq!(result, Err(ModelFailure::Timeout { after_ms: 30_000 }));
    }

    #[test]
    fn probe_reports_availability() {
        let (runner, rx) = runner(
            Err(ModelError::Unavailable {
                detail: "refused".to_string(),
            }),
            Arc::new(MemoryAudit::default()),
        );
        runner.probe_model();
        let action = rx.recv_timeout(WAIT).expect("probe");
        assert!(matches!(
            action,
            RuntimeAction::ModelProbed { available: false }
        ));
    }

    #[test]
    fn interactions_are_audited_inline() {
        let audit = Arc::new(MemoryAudit::default());
        let (runner, rx) = runner(
            Err(ModelError::Timeout { after_ms: 1 }),
            Arc::clone(&audit),
        );
        runner.run(ModeEffect::RecordInteraction {
            role: InteractionRole::User,
            text: "list files".to_string(),
        });
        runner.run(ModeEffect::RecordInteraction {
            role: InteractionRole::Assistant,
            text: "Lists files. [command: ls]".to_string(),
        });
        assert_eq!(
            *audit.records.lock().expect("lock"),
            vec![
                AuditRecord::interaction(AuditKind::User, "list files"),
                AuditRecord::interaction(AuditKind::Assistant, "Lists files. [command: ls]"),
            ]
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn failed_interaction_audit_is_reported() {
        let audit = Arc::new(MemoryAudit {
            fail: true,
            ..MemoryAudit::default()
        });
        let (runner, rx) = runner(Err(ModelError::Timeout { after_ms: 1 }), audit);
        runner.run(ModeEffect::RecordInteraction {
            role: InteractionRole::User,
            text: "hi".to_string(),
        });
        assert!(matches!(
            rx.try_recv().expect("audit failure"),
            RuntimeAction::AuditFailed { .. }
        ));
    }

    #[test]
    fn menu_dispatch_and_quit() {
        let (runner, rx) = runner(
            Err(ModelError::Timeout { after_ms: 1 }),
            Arc::new(MemoryAudit::default()),
        );
        runner.run(ModeEffect::DispatchMenu {
            path: MenuPath(vec!["help".to_string()]),
            cwd: PathBuf::from("/tmp"),
        });
        let RuntimeAction::MenuCompleted { outcome } = rx.recv_timeout(WAIT).expect("menu") else {
            panic!("expected menu completion");
        };
        assert!(matches!(outcome, MenuOutcome::Display { title, .. } if title == "help"));

        assert_eq!(
            runner.run(ModeEffect::Quit {
                handoff: Some(PathBuf::from("/srv"))
            }),
            EffectOutcome::Quit {
                handoff: Some(PathBuf::from("/srv"))
            }
        );
    }
}
