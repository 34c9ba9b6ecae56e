use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use mode_core::config::Config;
use tracing::info;

const MODE_DIR: &str = ".mode";
const CONFIG_FILE: &str = "config.toml";
const LOG_DIR: &str = "logs";
const AUDIT_FILE: &str = "ai_commands.log";
const HANDOFF_FILE: &str = ".mode_cd";

/// Well-known locations under `~/.mode`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModePaths {
    pub root: PathBuf,
}

impl ModePaths {
    pub fn under(home: &Path) -> Self {
        Self {
            root: home.join(MODE_DIR),
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join(LOG_DIR)
    }

    pub fn audit_log(&self) -> PathBuf {
        self.log_dir().join(AUDIT_FILE)
    }

    pub fn handoff_file(&self) -> PathBuf {
        self.root.join(HANDOFF_FILE)
    }
}

/// Loads and validates the configuration.
///
/// An explicit path must exist. The default path (`~/.mode/config.toml`) is optional and
/// its absence yields defaults.
pub fn load(explicit: Option<&Path>, home: Option<&Path>) -> anyhow::Result<Config> {
    let config = match explicit {
        Some(path) => Config::load(path)?,
        None => match home.map(|home| ModePaths::under(home).config_file()) {
            Some(path) if path.exists() => Config::load(&path)?,
            Some(path) => {
                info!(path = %path.display(), "no config file, using defaults");
                Config::default()
            }
            None => Config::default(),
        },
    };
    config
        .validate(home.map(Path::to_path_buf))
        .context("invalid configuration")
}

/// Writes the directory the parent shell should switch to after exit.
pub fn write_handoff(paths: &ModePaths, directory: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(&paths.root)
        .with_context(|| format!("failed to create {}", paths.root.display()))?;
    let file = paths.handoff_file();
    std::fs::write(&file, directory.to_string_lossy().as_bytes())
        .with_context(|| format!("failed to write {}", file.display()))
}
