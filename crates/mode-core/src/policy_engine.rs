use std::path::Component;
use std::path::Path;
use std::path::PathBuf;
use std::sync::OnceLock;

use regex::Regex;

use crate::command_rules;
use crate::command_rules::ParsedCommand;
use crate::command_rules::Segment;
use crate::config::AssistantConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Confirm,
    Deny,
}

impl Verdict {
    pub fn label(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Confirm => "confirm",
            Self::Deny => "deny",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDecision {
    pub verdict: Verdict,
    pub matched_rule: &'static str,
    pub reason: String,
}

impl PolicyDecision {
    fn new(verdict: Verdict, matched_rule: &'static str, reason: impl Into<String>) -> Self {
        Self {
            verdict,
            matched_rule,
            reason: reason.into(),
        }
    }
}

/// Decides whether a candidate command may run in `working_directory`.
///
/// Rules are checked in order and the first match wins: tokenizing, the destructive-pattern
/// denylist, the allowed-path scope, then mutation classification. Pure: no filesystem access,
/// so paths are compared lexically after `~` expansion.
pub fn evaluate(command: &str, working_directory: &Path, config: &AssistantConfig) -> PolicyDecision {
    let parsed = match command_rules::parse(command) {
        Ok(parsed) => parsed,
        Err(err) => return PolicyDecision::new(Verdict::Deny, "parse", err.to_string()),
    };

    if let Some(rule) = DENY_RULES
        .iter()
        .find(|rule| (rule.matches)(command, &parsed))
    {
        return PolicyDecision::new(Verdict::Deny, rule.id, rule.description);
    }

    let scope = PathScope {
        base: config.base_path(),
        home: config.home_directory.as_deref(),
    };
    if !scope.contains(Some(normalize(working_directory))) {
        return PolicyDecision::new(
            Verdict::Deny,
            "path_scope",
            format!(
                "outside allowed path: working directory {}",
                working_directory.display()
            ),
        );
    }
    if let Some(word) = command_substitution(command) {
        return PolicyDecision::new(
            Verdict::Deny,
            "path_scope",
            format!("outside allowed path: cannot resolve {word}"),
        );
    }
    if let Some(operand) = scope.first_escape(&parsed, working_directory) {
        return PolicyDecision::new(
            Verdict::Deny,
            "path_scope",
            format!("outside allowed path: {operand}"),
        );
    }

    match command_rules::classify(&parsed) {
        Some(kind) if config.require_confirmation => PolicyDecision::new(
            Verdict::Confirm,
            "mutating",
            format!("{} requires confirmation", kind.label()),
        ),
        Some(kind) => PolicyDecision::new(
            Verdict::Allow,
            "confirmation_disabled",
            format!("{} allowed without confirmation", kind.label()),
        ),
        None => PolicyDecision::new(Verdict::Allow, "read_only", "read-only command"),
    }
}

struct DenyRule {
    id: &'static str,
    description: &'static str,
    matches: fn(&str, &ParsedCommand) -> bool,
}

const DENY_RULES: &[DenyRule] = &[
    DenyRule {
        id: "recursive_root_delete",
        description: "recursive delete of a root-level path",
        matches: is_recursive_root_delete,
    },
    DenyRule {
        id: "disk_erase",
        description: "disk-erase utility",
        matches: is_disk_erase,
    },
    DenyRule {
        id: "raw_device_write",
        description: "write redirected onto a disk device",
        matches: is_raw_device_write,
    },
    DenyRule {
        id: "privilege_escalation",
        description: "privilege escalation",
        matches: is_privilege_escalation,
    },
    DenyRule {
        id: "fork_bomb",
        description: "fork bomb",
        matches: is_fork_bomb,
    },
];

const ROOT_LEVEL_TARGETS: &[&str] = &[
    "/", "/*", "~", "~/", "~/*", ".", "./", "./*", "..", "../", "../*", "*", ".*", "$HOME",
    "$HOME/", "$HOME/*", "${HOME}", "${HOME}/",
];

fn single_component_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^/+[^/]+/*\*?$")
            .unwrap_or_else(|err| panic!("invalid root component regex: {err}"))
    })
}

fn is_root_level(target: &str) -> bool {
    ROOT_LEVEL_TARGETS.contains(&target) || single_component_regex().is_match(target)
}

fn is_recursive_flag(arg: &str) -> bool {
    arg == "--recursive" || (arg.starts_with('-') && !arg.starts_with("--") && arg.contains(['r', 'R']))
}

fn is_recursive_root_delete(_raw: &str, parsed: &ParsedCommand) -> bool {
    parsed.segments.iter().any(|segment| match segment.program() {
        Some("rm") => {
            let args = segment.args();
            args.iter().any(|arg| is_recursive_flag(arg))
                && args
                    .iter()
                    .filter(|arg| !arg.starts_with('-'))
                    .any(|arg| is_root_level(arg))
        }
        Some("find") => {
            let args = segment.args();
            args.iter().any(|arg| arg == "-delete")
                && args
                    .iter()
                    .take_while(|arg| !arg.starts_with('-'))
                    .any(|arg| is_root_level(arg))
        }
        _ => false,
    })
}

const ERASE_VERBS: &[&str] = &[
    "erase",
    "zerodisk",
    "randomdisk",
    "secureerase",
    "partitiondisk",
    "reformat",
];

fn is_disk_erase(_raw: &str, parsed: &ParsedCommand) -> bool {
    parsed.segments.iter().any(|segment| {
        let Some(program) = segment.program() else {
            return false;
        };
        match program {
            "wipefs" | "shred" => true,
            "dd" => segment.args().iter().any(|arg| arg.starts_with("of=/dev/")),
            "diskutil" => segment
                .args()
                .iter()
                .find(|arg| !arg.starts_with('-'))
                .map(|verb| verb.to_ascii_lowercase())
                .is_some_and(|verb| ERASE_VERBS.iter().any(|erase| verb.starts_with(erase))),
            _ => program.starts_with("mkfs") || program.starts_with("newfs"),
        }
    })
}

fn disk_device_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^/dev/(sd|hd|vd|xvd|nvme|mmcblk|disk|rdisk)")
            .unwrap_or_else(|err| panic!("invalid device regex: {err}"))
    })
}

fn is_raw_device_write(_raw: &str, parsed: &ParsedCommand) -> bool {
    parsed.segments.iter().any(|segment| {
        segment
            .redirects
            .iter()
            .any(|redirect| redirect.is_output() && disk_device_regex().is_match(&redirect.target))
            || (segment.program() == Some("tee")
                && segment.args().iter().any(|arg| disk_device_regex().is_match(arg)))
    })
}

const ESCALATION_PROGRAMS: &[&str] = &["sudo", "su", "doas", "pkexec", "runas"];

fn is_privilege_escalation(_raw: &str, parsed: &ParsedCommand) -> bool {
    parsed
        .programs()
        .any(|program| ESCALATION_PROGRAMS.contains(&program))
}

fn fork_bomb_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // A function whose body pipes into something and backgrounds it.
        Regex::new(r"\(\s*\)\s*\{[^}]*\|[^}]*&[^}]*\}")
            .unwrap_or_else(|err| panic!("invalid fork bomb regex: {err}"))
    })
}

fn is_fork_bomb(raw: &str, _parsed: &ParsedCommand) -> bool {
    fork_bomb_regex().is_match(raw)
}

struct PathScope<'a> {
    base: &'a Path,
    home: Option<&'a Path>,
}

impl PathScope<'_> {
    fn contains(&self, resolved: Option<PathBuf>) -> bool {
        resolved.is_some_and(|path| path.starts_with(self.base))
    }

    fn first_escape<'c>(&self, parsed: &'c ParsedCommand, cwd: &Path) -> Option<&'c str> {
        if command_rules::is_directory_change(parsed) {
            let target = parsed.segments[0].args().first().map_or("~", String::as_str);
            if !self.contains(self.resolve(target, cwd)) {
                return Some(target);
            }
        }
        parsed.segments.iter().find_map(|segment| self.segment_escape(segment, cwd))
    }

    fn segment_escape<'c>(&self, segment: &'c Segment, cwd: &Path) -> Option<&'c str> {
        let redirects = segment
            .redirects
            .iter()
            .filter(|redirect| !redirect.targets_null_device())
            .map(|redirect| redirect.target.as_str());
        segment
            .path_operands()
            .chain(redirects)
            .find(|operand| !self.contains(self.resolve(operand, cwd)))
    }

    /// `None` when the operand cannot be placed on disk, such as `~otheruser` or anything
    /// the shell would expand other than `$HOME`.
    fn resolve(&self, operand: &str, cwd: &Path) -> Option<PathBuf> {
        let home_relative = ["~", "$HOME", "${HOME}"].iter().find_map(|prefix| {
            let rest = operand.strip_prefix(prefix)?;
            (rest.is_empty() || rest.starts_with('/')).then_some(rest)
        });
        if let Some(rest) = home_relative {
            let home = self.home?;
            if has_expansion(rest) {
                return None;
            }
            return Some(normalize(&home.join(rest.trim_start_matches('/'))));
        }
        if operand.starts_with('~') || has_expansion(operand) {
            return None;
        }
        Some(normalize(&cwd.join(operand)))
    }
}

fn expansion_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // Parameter expansion or command substitution; a trailing `$` as in `grep 'end$'` is literal.
        Regex::new(r"\$[A-Za-z0-9_{(]|`")
            .unwrap_or_else(|err| panic!("invalid expansion regex: {err}"))
    })
}

fn has_expansion(operand: &str) -> bool {
    expansion_regex().is_match(operand)
}

/// The tokenizer unwraps `$(...)` and backticks to find programs, so substitutions are
/// caught on the raw text.
fn command_substitution(command: &str) -> Option<&str> {
    command
        .split_whitespace()
        .find(|word| word.contains("$(") || word.contains('`'))
}

/// Resolves `.` and `..` without touching the filesystem. `..` never climbs above the root.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(Component::RootDir.as_os_str());
    }
    out
}
