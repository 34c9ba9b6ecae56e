use std::path::Path;
use std::path::PathBuf;
use std::process::Command;
use std::process::Stdio;

use chrono::DateTime;
use chrono::Local;
use mode_core::menu::MenuDispatcher;
use mode_core::menu::MenuNode;
use mode_core::menu::MenuOutcome;
use mode_core::menu::MenuPath;
use tracing::debug;
use tracing::warn;

const OVERVIEW_LIMIT: usize = 40;

pub fn main_menu() -> MenuNode {
    MenuNode::submenu(
        "main",
        "Mode Terminal",
        "Main menu",
        vec![
            MenuNode::leaf(
                "default_directory",
                "Normal Use",
                "Leave Mode Terminal and continue in the default directory",
            ),
            MenuNode::submenu(
                "projects",
                "Projects & Development",
                "Inspect the projects around the current directory",
                vec![
                    MenuNode::leaf(
                        "overview",
                        "Project Overview",
                        "List directories here with their last-modified dates",
                    ),
                    MenuNode::leaf(
                        "git_status",
                        "Git Status",
                        "Branch and working tree status of the current directory",
                    ),
                ],
            ),
            MenuNode::submenu(
                "system",
                "System & Maintenance",
                "Ports and machine information",
                vec![
                    MenuNode::leaf(
                        "ports",
                        "Listening Ports",
                        "TCP ports with a process listening on them",
                    ),
                    MenuNode::leaf(
                        "info",
                        "System Info",
                        "Kernel, uptime and disk usage",
                    ),
                ],
            ),
            MenuNode::leaf(
                "the_code",
                "The Code",
                "Leave Mode Terminal inside its own directory (~/.mode)",
            ),
            MenuNode::leaf("help", "Help", "Keys and modes"),
        ],
    )
}

/// Runs the leaf actions of [`main_menu`].
#[derive(Debug, Clone)]
pub struct ModeMenuDispatcher {
    default_directory: Option<PathBuf>,
    home: Option<PathBuf>,
    mode_root: Option<PathBuf>,
}

impl ModeMenuDispatcher {
    pub fn new(
        default_directory: Option<PathBuf>,
        home: Option<PathBuf>,
        mode_root: Option<PathBuf>,
    ) -> Self {
        Self {
            default_directory,
            home,
            mode_root,
        }
    }

    fn go_to_default_directory(&self) -> MenuOutcome {
        match self.default_directory.as_ref().or(self.home.as_ref()) {
            Some(dir) if dir.is_dir() => MenuOutcome::Exit {
                handoff: Some(dir.clone()),
            },
            Some(dir) => display(
                "Normal Use",
                vec![format!("Default directory not found: {}", dir.display())],
            ),
            None => display(
                "Normal Use",
                vec!["No default directory configured".to_string()],
            ),
        }
    }

    fn go_to_code(&self) -> MenuOutcome {
        match &self.mode_root {
            Some(dir) if dir.is_dir() => MenuOutcome::Exit {
                handoff: Some(dir.clone()),
            },
            Some(dir) => display(
                "The Code",
                vec![format!("Mode Terminal directory not found: {}", dir.display())],
            ),
            None => display(
                "The Code",
                vec!["No home directory to look in".to_string()],
            ),
        }
    }
}

impl MenuDispatcher for ModeMenuDispatcher {
    fn dispatch(&self, path: &MenuPath, working_directory: &Path) -> MenuOutcome {
        let segments: Vec<&str> = path.segments().collect();
        debug!(path = %path.join(), "dispatching menu leaf");
        match segments.as_slice() {
            ["default_directory"] => self.go_to_default_directory(),
            ["projects", "overview"] => display(
                "Project Overview",
                project_overview(working_directory),
            ),
            ["projects", "git_status"] => display(
                "Git Status",
                run_lines(
                    "git",
                    &["status", "--short", "--branch"],
                    working_directory,
                ),
            ),
            ["system", "ports"] => display("Listening Ports", listening_ports(working_directory)),
            ["system", "info"] => display("System Info", system_info(working_directory)),
            ["the_code"] => self.go_to_code(),
            ["help"] => display("Help", help_lines()),
            _ => {
                warn!(path = %path.join(), "unknown menu path");
                MenuOutcome::NoOp
            }
        }
    }
}

fn display(title: &str, lines: Vec<String>) -> MenuOutcome {
    MenuOutcome::Display {
        title: title.to_string(),
        lines,
        cwd_change: None,
    }
}

/// Directories under `dir`, newest first.
fn project_overview(dir: &Path) -> Vec<String> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => return vec![format!("Cannot read {}: {err}", dir.display())],
    };
    let mut projects: Vec<(String, Option<DateTime<Local>>)> = entries
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_ok_and(|kind| kind.is_dir()))
        .map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            let modified = entry
                .metadata()
                .and_then(|meta| meta.modified())
                .ok()
                .map(DateTime::<Local>::from);
            (name, modified)
        })
        .filter(|(name, _)| !name.starts_with('.'))
        .collect();
    if projects.is_empty() {
        return vec![format!("No project directories in {}", dir.display())];
    }
    projects.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let total = projects.len();
    let mut lines: Vec<String> = projects
        .into_iter()
        .take(OVERVIEW_LIMIT)
        .map(|(name, modified)| match modified {
            Some(time) => format!("{:<32} {}", name, time.format("%Y-%m-%d %H:%M")),
            None => name,
        })
        .collect();
    if total > OVERVIEW_LIMIT {
        lines.push(format!("... and {} more", total - OVERVIEW_LIMIT));
    }
    lines
}

fn listening_ports(cwd: &Path) -> Vec<String> {
    let lsof = run_capture("lsof", &["-nP", "-iTCP", "-sTCP:LISTEN"], cwd);
    match lsof {
        Ok(lines) if !lines.is_empty() => lines,
        _ => run_lines("ss", &["-ltn"], cwd),
    }
}

fn system_info(cwd: &Path) -> Vec<String> {
    let mut lines = Vec::new();
    for (program, args) in [
        ("uname", &["-srm"][..]),
        ("uptime", &[][..]),
        ("df", &["-h", "."][..]),
    ] {
        lines.extend(run_lines(program, args, cwd));
    }
    lines
}

fn help_lines() -> Vec<String> {
    [
        "Menu: Up/Down or k/j to move, Enter to open, Backspace or b to go back, q to quit.",
        "Tab switches between the menu and the AI chat.",
        "Chat: type a request and press Enter. Esc or Ctrl+C returns to the menu.",
        "Proposed commands are checked against the safety policy before they run.",
        "When asked to confirm, press y or Enter to run, n to decline.",
        "PageUp/PageDown scroll the transcript.",
    ]
    .iter()
    .map(ToString::to_string)
    .collect()
}

fn run_lines(program: &str, args: &[&str], cwd: &Path) -> Vec<String> {
    match run_capture(program, args, cwd) {
        Ok(lines) if lines.is_empty() => vec![format!("{program}: no output")],
        Ok(lines) => lines,
        Err(message) => vec![message],
    }
}

fn run_capture(program: &str, args: &[&str], cwd: &Path) -> Result<Vec<String>, String> {
    let output = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .output()
        .map_err(|err| format!("failed to run {program}: {err}"))?;
    let text = if output.status.success() {
        String::from_utf8_lossy(&output.stdout).into_owned()
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("{program} failed: {}", stderr.trim()));
    };
    Ok(text.lines().map(str::to_string).collect())
}
