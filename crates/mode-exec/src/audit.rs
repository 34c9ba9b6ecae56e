use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Local;
use thiserror::Error;

use crate::contracts::AuditRecord;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("failed to write audit log {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Destination for one-line audit records. Writes are best-effort: callers report
/// failures and move on.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: &AuditRecord) -> Result<(), AuditError>;
}

/// Appends records to a plain-text log file, creating parent directories on first use.
#[derive(Debug)]
pub struct FileAuditSink {
    path: PathBuf,
    // Serializes appends from concurrent workers so lines never interleave.
    lock: Mutex<()>,
}

impl FileAuditSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub fn format_record(record: &AuditRecord, timestamp: &str) -> String {
    let text = record.text.replace(['\n', '\r'], " ");
    match record.exit_code {
        Some(code) => format!("[{timestamp}] {}: {text} (exit {code})", record.kind.label()),
        None => format!("[{timestamp}] {}: {text}", record.kind.label()),
    }
}

impl AuditSink for FileAuditSink {
    fn record(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let io_error = |source| AuditError::Io {
            path: self.path.clone(),
            source,
        };
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io_error)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_error)?;
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        writeln!(file, "{}", format_record(record, &timestamp)).map_err(io_error)
    }
}

/// Sink used when `log_commands` is off.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn record(&self, _record: &AuditRecord) -> Result<(), AuditError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::contracts::AuditKind;

    #[test]
    fn formats_command_and_interaction_lines() {
        assert_eq!(
            format_record(&AuditRecord::command("ls -la", Some(0)), "2026-01-02 03:04:05"),
            "[2026-01-02 03:04:05] COMMAND: ls -la (exit 0)"
        );
        assert_eq!(
            format_record(
                &AuditRecord::interaction(AuditKind::Assistant, "line one\nline two"),
                "t"
            ),
            "[t] AI: line one line two"
        );
        assert_eq!(
            format_record(&AuditRecord::interaction(AuditKind::User, "hi"), "t"),
            "[t] USER: hi"
        );
    }

    #[test]
    fn file_sink_creates_directories_and_appends() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = FileAuditSink::new(dir.path().join("logs").join("ai_commands.log"));
        sink.record(&AuditRecord::interaction(AuditKind::User, "list files"))
            .expect("first write");
        sink.record(&AuditRecord::command("ls", Some(0)))
            .expect("second write");

        let contents = std::fs::read_to_string(sink.path()).expect("read log");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("] USER: list files"));
        assert!(lines[1].ends_with("] COMMAND: ls (exit 0)"));
    }

    #[test]
    fn unwritable_path_reports_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "").expect("write");
        let sink = FileAuditSink::new(blocker.join("nested.log"));
        let err = sink
            .record(&AuditRecord::command("ls", None))
            .expect_err("parent is a file");
        assert!(matches!(err, AuditError::Io { .. }));
    }
}
