use std::path::Path;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_MODEL: &str = "dolphin-mistral:7b";
pub const DEFAULT_ENDPOINT: &str = "http://localhost:11434";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("allowed_base_path is not set and no home directory could be resolved")]
    MissingBasePath,
    #[error("allowed_base_path must be absolute: {0}")]
    RelativeBasePath(PathBuf),
    #[error("allowed_base_path is not an existing directory: {0}")]
    BasePathNotDirectory(PathBuf),
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub assistant: AssistantConfig,
    pub interface: InterfaceConfig,
}

/// Settings read by the chat pipeline. Never mutated once a session starts.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AssistantConfig {
    pub model: String,
    pub endpoint: String,
    pub allowed_base_path: Option<PathBuf>,
    pub command_timeout_ms: u64,
    pub model_timeout_ms: u64,
    pub require_confirmation: bool,
    pub log_commands: bool,
    pub transcript_capacity: usize,
    pub context_entries: usize,
    pub output_limit_bytes: usize,
    /// Resolved by the loader; `~` arguments expand against it.
    #[serde(skip)]
    pub home_directory: Option<PathBuf>,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            allowed_base_path: None,
            command_timeout_ms: 30_000,
            model_timeout_ms: 30_000,
            require_confirmation: true,
            log_commands: true,
            transcript_capacity: 200,
            context_entries: 5,
            output_limit_bytes: 8 * 1024,
            home_directory: None,
        }
    }
}

impl AssistantConfig {
    /// Only meaningful after [`Config::validate`] has filled it in.
    pub fn base_path(&self) -> &Path {
        self.allowed_base_path
            .as_deref()
            .unwrap_or_else(|| Path::new("/"))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct InterfaceConfig {
    pub default_directory: Option<PathBuf>,
    pub show_help_text: bool,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            default_directory: None,
            show_help_text: true,
        }
    }
}

impl Config {
    pub fn from_toml_str(text: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text, path)
    }

    /// Resolves the allowed base path (defaulting to `home`) and rejects values the
    /// policy engine cannot work with. Runs once, before the session loop.
    pub fn validate(mut self, home: Option<PathBuf>) -> Result<Self, ConfigError> {
        let base = match self.assistant.allowed_base_path.take() {
            Some(base) => base,
            None => home.clone().ok_or(ConfigError::MissingBasePath)?,
        };
        if base.as_os_str().is_empty() {
            return Err(ConfigError::MissingBasePath);
        }
        if !base.is_absolute() {
            return Err(ConfigError::RelativeBasePath(base));
        }
        if !base.is_dir() {
            return Err(ConfigError::BasePathNotDirectory(base));
        }
        let base = base.canonicalize().unwrap_or(base);

        self.assistant.allowed_base_path = Some(base);
        self.assistant.home_directory = home;
        self.assistant.transcript_capacity = self.assistant.transcript_capacity.max(1);
        Ok(self)
    }
}
