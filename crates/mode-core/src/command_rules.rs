//! Tokenizing and classification of candidate shell commands.
//!
//! Everything here is read-only and conservative: when a construct is ambiguous it is split
//! or classified the way that asks the user more, never less.

use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty command")]
    Empty,
    #[error("unparseable command")]
    Unbalanced,
}

/// How a segment is joined to the one before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connector {
    Start,
    Sequence,
    And,
    Or,
    Pipe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectOp {
    Write,
    Append,
    Read,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub op: RedirectOp,
    pub target: String,
}

impl Redirect {
    pub fn is_output(&self) -> bool {
        matches!(self.op, RedirectOp::Write | RedirectOp::Append)
    }

    pub fn targets_null_device(&self) -> bool {
        NULL_DEVICES.contains(&self.target.as_str())
    }
}

const NULL_DEVICES: &[&str] = &["/dev/null", "/dev/stdout", "/dev/stderr", "/dev/tty"];

/// One simple command between shell operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub words: Vec<String>,
    pub redirects: Vec<Redirect>,
    pub connector: Connector,
    program_index: Option<usize>,
}

impl Segment {
    /// Basename of the program word, after environment assignments and wrappers.
    pub fn program(&self) -> Option<&str> {
        let word = self.words.get(self.program_index?)?;
        Some(word.rsplit('/').next().unwrap_or(word))
    }

    pub fn program_word(&self) -> Option<&str> {
        self.program_index
            .and_then(|index| self.words.get(index))
            .map(String::as_str)
    }

    pub fn args(&self) -> &[String] {
        match self.program_index {
            Some(index) => &self.words[index + 1..],
            None => &[],
        }
    }

    fn first_positional(&self) -> Option<&str> {
        self.args()
            .iter()
            .map(String::as_str)
            .find(|arg| !arg.starts_with('-'))
    }

    fn has_flag(&self, flags: &[&str]) -> bool {
        self.args().iter().any(|arg| flags.contains(&arg.as_str()))
    }

    /// Arguments that name, or may name, a filesystem location.
    pub fn path_operands(&self) -> impl Iterator<Item = &str> + '_ {
        self.args().iter().filter_map(|arg| {
            let arg = arg.as_str();
            if arg == "-" || arg == "--" {
                return None;
            }
            if let Some((key, value)) = arg.split_once('=') {
                let key = key.trim_start_matches('-');
                if !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
                    return (!value.is_empty()).then_some(value);
                }
            }
            if !arg.starts_with('-') {
                return Some(arg);
            }
            // Short option with its value attached, such as `-C/etc` or `-f~/list`.
            let value = arg
                .strip_prefix('-')
                .filter(|rest| !rest.starts_with('-'))
                .and_then(|rest| rest.get(1..))
                .filter(|value| !value.is_empty())?;
            looks_like_path(value).then_some(value)
        })
    }
}

fn looks_like_path(value: &str) -> bool {
    value.contains(['/', '$', '`']) || value.starts_with('~')
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub segments: Vec<Segment>,
}

impl ParsedCommand {
    /// Each segment together with the segment piping into it, if any.
    pub fn pipeline(&self) -> impl Iterator<Item = (&Segment, Option<&Segment>)> + '_ {
        self.segments.iter().enumerate().map(|(index, segment)| {
            let upstream = match segment.connector {
                Connector::Pipe if index > 0 => self.segments.get(index - 1),
                _ => None,
            };
            (segment, upstream)
        })
    }

    pub fn programs(&self) -> impl Iterator<Item = &str> + '_ {
        self.segments.iter().filter_map(Segment::program)
    }
}

pub fn parse(command: &str) -> Result<ParsedCommand, ParseError> {
    let trimmed = command.trim();
    if trimmed.is_empty() {
        return Err(ParseError::Empty);
    }
    let tokens = shlex::split(trimmed).ok_or(ParseError::Unbalanced)?;

    let mut segments = Vec::new();
    let mut words: Vec<String> = Vec::new();
    let mut connector = Connector::Start;
    for token in &tokens {
        for piece in split_operators(token) {
            match piece {
                Piece::Word(word) => {
                    let word = strip_grouping(&word);
                    if !word.is_empty() {
                        words.push(word.to_string());
                    }
                }
                Piece::Op(next) => {
                    if !words.is_empty() {
                        segments.push(build_segment(std::mem::take(&mut words), connector));
                    }
                    connector = next;
                }
            }
        }
    }
    if !words.is_empty() {
        segments.push(build_segment(words, connector));
    }
    if segments.is_empty() {
        return Err(ParseError::Empty);
    }
    Ok(ParsedCommand { segments })
}

enum Piece {
    Word(String),
    Op(Connector),
}

// Quoting is gone after shlex, so operators inside quoted text are split too.
fn split_operators(token: &str) -> Vec<Piece> {
    let chars: Vec<char> = token.chars().collect();
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        let prev = i.checked_sub(1).map(|p| chars[p]);
        let op = match (c, next) {
            (';', _) => Some((Connector::Sequence, 1)),
            ('|', Some('|')) => Some((Connector::Or, 2)),
            ('|', Some('&')) => Some((Connector::Pipe, 2)),
            ('|', _) => Some((Connector::Pipe, 1)),
            ('&', Some('&')) => Some((Connector::And, 2)),
            ('&', Some('>')) => None,
            ('&', _) if matches!(prev, Some('>') | Some('<')) => None,
            ('&', _) => Some((Connector::Sequence, 1)),
            _ => None,
        };
        match op {
            Some((connector, width)) => {
                if !current.is_empty() {
                    pieces.push(Piece::Word(std::mem::take(&mut current)));
                }
                pieces.push(Piece::Op(connector));
                i += width;
            }
            None => {
                current.push(c);
                i += 1;
            }
        }
    }
    if !current.is_empty() {
        pieces.push(Piece::Word(current));
    }
    pieces
}

fn strip_grouping(word: &str) -> &str {
    let word = word.strip_prefix("$(").unwrap_or(word);
    word.trim_start_matches(['(', '{', '`'])
        .trim_end_matches([')', '}', '`'])
}

fn redirect_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<pre>[^<>]*?)(?P<op>>>|>\||>|<<<|<<|<)(?P<target>.*)$")
            .unwrap_or_else(|err| panic!("invalid redirect regex: {err}"))
    })
}

fn assignment_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*=")
            .unwrap_or_else(|err| panic!("invalid assignment regex: {err}"))
    })
}

const WRAPPERS: &[&str] = &["env", "command", "exec", "nohup", "time", "xargs", "builtin"];

fn build_segment(raw: Vec<String>, connector: Connector) -> Segment {
    let mut words = Vec::with_capacity(raw.len());
    let mut redirects = Vec::new();
    let mut iter = raw.into_iter();
    while let Some(word) = iter.next() {
        let Some(caps) = redirect_regex().captures(&word) else {
            words.push(word);
            continue;
        };
        let pre = &caps["pre"];
        let op = &caps["op"];
        let inline_target = &caps["target"];
        if !pre.is_empty() && pre != "&" && !pre.chars().all(|c| c.is_ascii_digit()) {
            words.push(pre.to_string());
        }
        let target = if inline_target.is_empty() {
            iter.next().unwrap_or_default()
        } else {
            inline_target.to_string()
        };
        let op = match op {
            ">>" => RedirectOp::Append,
            ">" | ">|" => RedirectOp::Write,
            "<" => RedirectOp::Read,
            // Here-documents and here-strings carry text, not paths.
            _ => continue,
        };
        if target.is_empty() || target.starts_with('&') {
            continue;
        }
        redirects.push(Redirect { op, target });
    }

    let mut index = 0;
    while index < words.len() {
        let word = words[index].as_str();
        if assignment_regex().is_match(word) {
            index += 1;
        } else if WRAPPERS.contains(&word) {
            index += 1;
            while words.get(index).is_some_and(|w| w.starts_with('-')) {
                index += 1;
            }
        } else {
            break;
        }
    }
    let program_index = (index < words.len()).then_some(index);

    Segment {
        words,
        redirects,
        connector,
        program_index,
    }
}

/// Mutation classes that require confirmation. Order is the classification order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    FetchAndExecute,
    PackageInstall,
    Delete,
    Move,
    Write,
    ScriptExecution,
}

impl MutationKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::FetchAndExecute => "network fetch-and-execute",
            Self::PackageInstall => "package install",
            Self::Delete => "delete",
            Self::Move => "move",
            Self::Write => "write",
            Self::ScriptExecution => "script execution",
        }
    }
}

struct ClassificationRule {
    kind: MutationKind,
    matches: fn(&Segment, Option<&Segment>) -> bool,
}

const CLASSIFICATION_RULES: &[ClassificationRule] = &[
    ClassificationRule {
        kind: MutationKind::FetchAndExecute,
        matches: is_fetch_and_execute,
    },
    ClassificationRule {
        kind: MutationKind::PackageInstall,
        matches: is_package_install,
    },
    ClassificationRule {
        kind: MutationKind::Delete,
        matches: is_delete,
    },
    ClassificationRule {
        kind: MutationKind::Move,
        matches: is_move,
    },
    ClassificationRule {
        kind: MutationKind::Write,
        matches: is_write,
    },
    ClassificationRule {
        kind: MutationKind::ScriptExecution,
        matches: is_script_execution,
    },
];

/// First matching mutation class across all segments, or `None` for read-only commands.
pub fn classify(parsed: &ParsedCommand) -> Option<MutationKind> {
    CLASSIFICATION_RULES.iter().find_map(|rule| {
        parsed
            .pipeline()
            .any(|(segment, upstream)| (rule.matches)(segment, upstream))
            .then_some(rule.kind)
    })
}

const FETCHERS: &[&str] = &["curl", "wget"];

const INTERPRETERS: &[&str] = &[
    "sh", "bash", "zsh", "fish", "dash", "ksh", "python", "python3", "node", "deno", "bun",
    "ruby", "perl", "php", "source", ".", "osascript",
];

fn is_fetch_and_execute(segment: &Segment, upstream: Option<&Segment>) -> bool {
    let Some(program) = segment.program() else {
        return false;
    };
    if !INTERPRETERS.contains(&program) {
        return false;
    }
    if upstream
        .and_then(Segment::program)
        .is_some_and(|up| FETCHERS.contains(&up))
    {
        return true;
    }
    segment
        .args()
        .iter()
        .any(|arg| FETCHERS.iter().any(|fetcher| arg.contains(fetcher)))
}

/// Package managers and the subcommands that change installed state.
const PACKAGE_RULES: &[(&str, &[&str])] = &[
    ("pip", &["install", "uninstall", "download"]),
    ("pip3", &["install", "uninstall", "download"]),
    ("pipx", &["install", "uninstall", "run", "inject", "upgrade"]),
    ("npm", &["install", "i", "add", "ci", "uninstall", "remove", "update", "link"]),
    ("yarn", &["add", "install", "remove", "global", "upgrade"]),
    ("pnpm", &["add", "install", "i", "remove", "update", "link"]),
    ("brew", &["install", "uninstall", "reinstall", "upgrade", "tap", "link"]),
    ("cargo", &["install", "uninstall", "add", "remove"]),
    ("apt", &["install", "remove", "purge", "upgrade"]),
    ("apt-get", &["install", "remove", "purge", "upgrade"]),
    ("gem", &["install", "uninstall", "update"]),
    ("go", &["install", "get"]),
    ("conda", &["install", "remove", "update", "create"]),
    ("port", &["install", "uninstall"]),
];

const ALWAYS_INSTALLS: &[&str] = &["npx", "bunx", "uvx"];

fn is_package_install(segment: &Segment, _upstream: Option<&Segment>) -> bool {
    let Some(program) = segment.program() else {
        return false;
    };
    if ALWAYS_INSTALLS.contains(&program) {
        return true;
    }
    if program.starts_with("python") {
        let args = segment.args();
        return args
            .windows(3)
            .any(|w| w[0] == "-m" && w[1].starts_with("pip") && w[2] == "install");
    }
    let Some((_, subcommands)) = PACKAGE_RULES.iter().find(|(name, _)| *name == program) else {
        return false;
    };
    segment
        .first_positional()
        .is_some_and(|sub| subcommands.contains(&sub))
}

fn is_delete(segment: &Segment, _upstream: Option<&Segment>) -> bool {
    match segment.program() {
        Some("rm" | "rmdir" | "unlink" | "srm" | "trash") => true,
        Some("find") => segment.has_flag(&["-delete"]),
        Some("git") => git_subcommand(segment) == Some("rm"),
        _ => false,
    }
}

fn is_move(segment: &Segment, _upstream: Option<&Segment>) -> bool {
    match segment.program() {
        Some("mv" | "rename") => true,
        Some("git") => git_subcommand(segment) == Some("mv"),
        _ => false,
    }
}

const WRITE_PROGRAMS: &[&str] = &[
    "touch", "mkdir", "cp", "tee", "ln", "chmod", "chown", "chgrp", "truncate", "install",
    "rsync", "patch", "unzip", "gunzip", "gzip", "zip", "ditto", "xattr", "mkfifo", "wget",
];

fn is_write(segment: &Segment, _upstream: Option<&Segment>) -> bool {
    if segment
        .redirects
        .iter()
        .any(|redirect| redirect.is_output() && !redirect.targets_null_device())
    {
        return true;
    }
    let Some(program) = segment.program() else {
        return false;
    };
    if WRITE_PROGRAMS.contains(&program) {
        return true;
    }
    match program {
        "sed" | "perl" => segment
            .args()
            .iter()
            .any(|arg| arg.starts_with("-i") || arg == "--in-place"),
        "curl" => segment.args().iter().any(|arg| {
            matches!(
                arg.as_str(),
                "-o" | "-O" | "--output" | "--remote-name" | "--remote-name-all"
            ) || arg.starts_with("--output=")
                || (arg.starts_with('-') && !arg.starts_with("--") && arg.contains(['o', 'O']))
        }),
        "tar" => segment
            .args()
            .first()
            .is_some_and(|mode| !mode.starts_with("--") && mode.contains(['x', 'c', 'r', 'u'])),
        "git" => is_mutating_git(segment),
        _ => false,
    }
}

/// Script runners and the subcommands that run project-defined code.
const SCRIPT_RULES: &[(&str, &[&str])] = &[
    ("npm", &["run", "run-script", "exec", "start", "test"]),
    ("yarn", &["run", "exec", "start", "test"]),
    ("pnpm", &["run", "exec", "start", "test"]),
    ("cargo", &["run", "test", "bench", "build"]),
    ("go", &["run", "test", "generate"]),
];

const SCRIPT_PROGRAMS: &[&str] = &["make", "just", "rake", "gradle", "mvn", "eval"];

fn is_script_execution(segment: &Segment, _upstream: Option<&Segment>) -> bool {
    let Some(program) = segment.program() else {
        return false;
    };
    if INTERPRETERS.contains(&program) || SCRIPT_PROGRAMS.contains(&program) {
        return true;
    }
    if segment
        .program_word()
        .is_some_and(|word| word.starts_with("./") || word.starts_with("../") || word.ends_with(".sh"))
    {
        return true;
    }
    if program == "find" {
        return segment.has_flag(&["-exec", "-execdir", "-ok", "-okdir"]);
    }
    SCRIPT_RULES
        .iter()
        .find(|(name, _)| *name == program)
        .is_some_and(|(_, subcommands)| {
            segment
                .first_positional()
                .is_some_and(|sub| subcommands.contains(&sub))
        })
}

const SAFE_GIT_SUBCOMMANDS: &[&str] = &[
    "status", "log", "show", "diff", "rev-parse", "ls-files", "blame", "describe", "shortlog",
    "grep", "cat-file", "reflog", "help", "version",
];

// Listing forms only: any positional argument after these creates or deletes a ref.
const LISTING_GIT_SUBCOMMANDS: &[&str] = &["branch", "remote", "tag", "stash"];

fn git_subcommand(segment: &Segment) -> Option<&str> {
    let mut iter = segment.args().iter();
    while let Some(arg) = iter.next() {
        let arg = arg.as_str();
        if matches!(arg, "-C" | "-c" | "--git-dir" | "--work-tree" | "--namespace") {
            iter.next()?;
            continue;
        }
        if arg.starts_with('-') {
            continue;
        }
        return Some(arg);
    }
    None
}

fn is_mutating_git(segment: &Segment) -> bool {
    let Some(sub) = git_subcommand(segment) else {
        return false;
    };
    if SAFE_GIT_SUBCOMMANDS.contains(&sub) {
        return false;
    }
    if LISTING_GIT_SUBCOMMANDS.contains(&sub) {
        let args = segment.args();
        let position = args.iter().position(|arg| arg == sub).unwrap_or(args.len());
        let rest = &args[(position + 1).min(args.len())..];
        if sub == "stash" {
            return !matches!(rest.first().map(String::as_str), Some("list" | "show"));
        }
        return rest.iter().any(|arg| {
            !arg.starts_with('-')
                || matches!(arg.as_str(), "-d" | "-D" | "-m" | "-M" | "--delete" | "--move")
        });
    }
    true
}

/// True when the command is a lone `cd`, optionally with one target.
pub fn is_directory_change(parsed: &ParsedCommand) -> bool {
    match parsed.segments.as_slice() {
        [segment] => {
            segment.program_word() == Some("cd")
                && segment.args().len() <= 1
                && segment.redirects.is_empty()
        }
        _ => false,
    }
}
