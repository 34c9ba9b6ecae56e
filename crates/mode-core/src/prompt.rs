use std::fmt::Write as _;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::transcript::TranscriptEntry;

/// Output tails quoted back to the model are cut to this many characters.
const CONTEXT_OUTPUT_CHARS: usize = 400;

/// First words accepted from an inline backtick span.
pub const KNOWN_PROGRAMS: &[&str] = &[
    "ls", "cat", "grep", "rg", "find", "pwd", "echo", "which", "head", "tail", "tree", "wc", "du",
    "df", "cd", "rm", "rmdir", "mv", "cp", "mkdir", "touch", "chmod", "pip", "pip3", "npm", "npx",
    "yarn", "brew", "git", "python", "python3", "node", "cargo", "make", "open", "code", "sort",
    "uniq", "diff", "file", "stat", "ps", "lsof", "uname", "date", "curl", "wget", "tar", "unzip",
];

const PREAMBLE: &str =
    "You are a terminal assistant. Translate the user's request into exactly one shell command.";

const RULES: &str = r"RULES:
1. Put the command alone in a fenced code block (```sh ... ```), one line.
2. Explain what it does in one or two plain sentences before the block.
3. Never use sudo and never touch paths outside the allowed base path.
4. If no command is needed, answer in plain text without a code block.";

#[derive(Debug, Clone, Copy)]
pub struct PromptContext<'a> {
    pub working_directory: &'a Path,
    pub base_path: &'a Path,
}

/// Full prompt for one `/api/generate` call. `recent` is expected oldest first.
pub fn build_prompt<'e>(
    user_text: &str,
    context: PromptContext<'_>,
    recent: impl IntoIterator<Item = &'e TranscriptEntry>,
) -> String {
    let mut system = format!(
        "{PREAMBLE}\n\nCURRENT CONTEXT:\n- Working directory: {}\n- Allowed base path: {}\n\n{RULES}\n",
        context.working_directory.display(),
        context.base_path.display(),
    );

    let mut history = String::new();
    for entry in recent {
        render_context_entry(&mut history, entry);
    }
    if !history.is_empty() {
        let _ = writeln!(system);
        let _ = writeln!(system, "RECENT CONVERSATION:");
        system.push_str(&history);
    }

    format!(
        "System: {}\n\nUser: {}\n\nAssistant:",
        system.trim_end(),
        user_text.trim()
    )
}

fn render_context_entry(out: &mut String, entry: &TranscriptEntry) {
    match entry {
        TranscriptEntry::UserMessage { text, .. } => {
            let _ = writeln!(out, "User: {text}");
        }
        TranscriptEntry::ModelReply {
            explanation,
            proposed_command,
            ..
        } => match proposed_command {
            Some(command) => {
                let _ = writeln!(out, "Assistant: {explanation} (proposed `{command}`)");
            }
            None => {
                let _ = writeln!(out, "Assistant: {explanation}");
            }
        },
        TranscriptEntry::CommandResult {
            command,
            exit_code,
            stdout_tail,
            stderr_tail,
            ..
        } => {
            let _ = writeln!(out, "Ran `{command}` (exit {exit_code})");
            for (label, text) in [("stdout", stdout_tail), ("stderr", stderr_tail)] {
                let text = text.trim();
                if !text.is_empty() {
                    let _ = writeln!(out, "{label}: {}", tail_chars(text, CONTEXT_OUTPUT_CHARS));
                }
            }
        }
        TranscriptEntry::SystemNotice { text, .. } => {
            let _ = writeln!(out, "Notice: {text}");
        }
    }
}

fn tail_chars(text: &str, max: usize) -> &str {
    let count = text.chars().count();
    if count <= max {
        return text;
    }
    let skip = count - max;
    let start = text
        .char_indices()
        .nth(skip)
        .map_or(text.len(), |(index, _)| index);
    &text[start..]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedReply {
    pub explanation: String,
    pub proposed_command: Option<String>,
}

fn fence_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```[A-Za-z0-9_+-]*[ \t]*\n?(.*?)```")
            .unwrap_or_else(|err| panic!("invalid fence regex: {err}"))
    })
}

fn inline_code_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"`([^`\n]+)`").unwrap_or_else(|err| panic!("invalid inline code regex: {err}"))
    })
}

fn emoji_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[\x{1F000}-\x{1FAFF}\x{2600}-\x{27BF}\x{2B00}-\x{2BFF}\x{FE0F}\x{200D}]+")
            .unwrap_or_else(|err| panic!("invalid emoji regex: {err}"))
    })
}

/// Removes emoji and collapses runs of whitespace into single spaces.
pub fn clean_text(text: &str) -> String {
    let stripped = emoji_regex().replace_all(text, "");
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Splits a raw model reply into display text and at most one candidate command.
///
/// Candidates are looked for in a fenced code block first, then a line starting with `$ `,
/// then an inline backtick span whose first word is a known program. Only the first
/// candidate is used; a command that is empty after trimming counts as absent.
pub fn parse_reply(raw: &str) -> ParsedReply {
    let fenced = fence_regex()
        .captures(raw)
        .and_then(|caps| caps.get(1))
        .and_then(|block| first_command_line(block.as_str()));

    let without_fences = fence_regex().replace_all(raw, " ");

    let proposed_command = fenced
        .or_else(|| {
            without_fences.lines().find_map(|line| {
                line.trim()
                    .strip_prefix("$ ")
                    .map(str::trim)
                    .filter(|command| !command.is_empty())
                    .map(str::to_string)
            })
        })
        .or_else(|| {
            inline_code_regex()
                .captures_iter(&without_fences)
                .filter_map(|caps| caps.get(1))
                .map(|span| span.as_str().trim())
                .find(|span| starts_with_known_program(span))
                .map(str::to_string)
        });

    let explanation_source: String = without_fences
        .lines()
        .filter(|line| {
            proposed_command.is_none() || !line.trim_start().starts_with("$ ")
        })
        .collect::<Vec<_>>()
        .join("\n");

    ParsedReply {
        explanation: clean_text(&explanation_source),
        proposed_command,
    }
}

fn first_command_line(block: &str) -> Option<String> {
    block
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| line.strip_prefix("$ ").unwrap_or(line).trim().to_string())
        .filter(|line| !line.is_empty())
}

fn starts_with_known_program(span: &str) -> bool {
    span.split_whitespace()
        .next()
        .is_some_and(|word| KNOWN_PROGRAMS.contains(&word))
}
