use std::collections::VecDeque;
use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn label(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptEntry {
    UserMessage {
        text: Arc<str>,
        timestamp: DateTime<Utc>,
    },
    ModelReply {
        explanation: Arc<str>,
        proposed_command: Option<Arc<str>>,
        timestamp: DateTime<Utc>,
    },
    CommandResult {
        command: Arc<str>,
        exit_code: i32,
        stdout_tail: Arc<str>,
        stderr_tail: Arc<str>,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    SystemNotice {
        text: Arc<str>,
        severity: Severity,
    },
}

impl TranscriptEntry {
    pub fn user(text: impl Into<Arc<str>>) -> Self {
        Self::UserMessage {
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn reply(explanation: impl Into<Arc<str>>, proposed_command: Option<Arc<str>>) -> Self {
        Self::ModelReply {
            explanation: explanation.into(),
            proposed_command,
            timestamp: Utc::now(),
        }
    }

    pub fn notice(severity: Severity, text: impl Into<Arc<str>>) -> Self {
        Self::SystemNotice {
            text: text.into(),
            severity,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::UserMessage { .. } => "user",
            Self::ModelReply { .. } => "assistant",
            Self::CommandResult { .. } => "command",
            Self::SystemNotice { .. } => "notice",
        }
    }
}

/// An entry as stored, tagged with its position in the session-wide sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptRecord {
    pub seq: u64,
    pub entry: TranscriptEntry,
}

/// Bounded, append-only transcript. Once `cap` is reached each append evicts the oldest
/// record in the same call, so the store is never observable above capacity. Sequence
/// numbers keep increasing across evictions.
#[derive(Debug, Clone)]
pub struct TranscriptStore {
    cap: usize,
    next_seq: u64,
    buf: VecDeque<TranscriptRecord>,
}

impl TranscriptStore {
    pub fn new(cap: usize) -> Self {
        let cap = cap.max(1);
        Self {
            cap,
            next_seq: 1,
            buf: VecDeque::with_capacity(cap),
        }
    }

    pub fn append(&mut self, entry: TranscriptEntry) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;

        if self.buf.len() == self.cap {
            self.buf.pop_front();
        }
        self.buf.push_back(TranscriptRecord { seq, entry });
        seq
    }

    /// The last `n` entries, oldest first.
    pub fn recent(&self, n: usize) -> impl Iterator<Item = &TranscriptEntry> + Clone + '_ {
        let skip = self.buf.len().saturating_sub(n);
        self.buf.iter().skip(skip).map(|record| &record.entry)
    }

    pub fn all(&self) -> impl DoubleEndedIterator<Item = &TranscriptRecord> + Clone + '_ {
        self.buf.iter()
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn first_seq(&self) -> Option<u64> {
        self.buf.front().map(|record| record.seq)
    }

    pub fn last(&self) -> Option<&TranscriptEntry> {
        self.buf.back().map(|record| &record.entry)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn texts(store: &TranscriptStore) -> Vec<String> {
        store
            .all()
            .map(|record| match &record.entry {
                TranscriptEntry::SystemNotice { text, .. } => text.to_string(),
                other => other.kind().to_string(),
            })
            .collect()
    }

    #[test]
    fn capacity_is_never_exceeded_for_any_append_count() {
        for cap in 1..=6 {
            for appends in 0..=20usize {
                let mut store = TranscriptStore::new(cap);
                for i in 0..appends {
                    store.append(TranscriptEntry::notice(Severity::Info, i.to_string()));
                    assert!(store.len() <= cap, "cap {cap} exceeded after {i} appends");
                }
                let expected: Vec<String> = (appends.saturating_sub(cap)..appends)
                    .map(|i| i.to_string())
                    .collect();
                assert_eq!(texts(&store), expected);
            }
        }
    }

    #[test]
    fn eviction_keeps_sequence_numbers_stable() {
        let mut store = TranscriptStore::new(3);
        for i in 0..5 {
            store.append(TranscriptEntry::notice(Severity::Info, i.to_string()));
        }
        let seqs: Vec<u64> = store.all().map(|record| record.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
        assert_eq!(store.first_seq(), Some(3));
    }

    #[test]
    fn recent_returns_tail_oldest_first() {
        let mut store = TranscriptStore::new(10);
        store.append(TranscriptEntry::user("a"));
        store.append(TranscriptEntry::reply("b", None));
        store.append(TranscriptEntry::notice(Severity::Warning, "c"));

        let kinds: Vec<&str> = store.recent(2).map(TranscriptEntry::kind).collect();
        assert_eq!(kinds, vec!["assistant", "notice"]);

        let all_kinds: Vec<&str> = store.recent(50).map(TranscriptEntry::kind).collect();
        assert_eq!(all_kinds, vec!["user", "assistant", "notice"]);
        assert_eq!(store.recent(0).count(), 0);
    }

    #[test]
    fn all_is_restartable() {
        let mut store = TranscriptStore::new(4);
        store.append(TranscriptEntry::user("one"));
        store.append(TranscriptEntry::user("two"));

        let iter = store.all();
        let first_pass: Vec<u64> = iter.clone().map(|record| record.seq).collect();
        let second_pass: Vec<u64> = iter.map(|record| record.seq).collect();
        assert_eq!(first_pass, second_pass);
    }

    #[test]
    fn zero_capacity_is_clamped_to_one() {
        let mut store = TranscriptStore::new(0);
        store.append(TranscriptEntry::user("a"));
        store.append(TranscriptEntry::user("b"));
        assert_eq!(store.capacity(), 1);
        assert_eq!(store.len(), 1);
    }
}
