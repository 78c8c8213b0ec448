//! Runtime Configuration
//!
//! Handles parsing and management of hostrt.toml configuration files.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::logging::LogLevel;

/// File name searched for by [`RuntimeConfig::find_and_load`].
pub const CONFIG_FILE_NAME: &str = "hostrt.toml";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file not found: {0}")]
    NotFound(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Root configuration structure matching hostrt.toml.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RuntimeConfig {
    /// Loop tuning
    #[serde(default)]
    pub event_loop: EventLoopConfig,

    /// Child process handling
    #[serde(default)]
    pub process: ProcessConfig,

    /// Worker threads
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl RuntimeConfig {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: RuntimeConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from the current directory or parents.
    pub fn load_from_cwd() -> ConfigResult<Self> {
        let cwd = std::env::current_dir().map_err(ConfigError::Io)?;
        Self::find_and_load(&cwd)
    }

    /// Find and load configuration by searching up from the given directory.
    pub fn find_and_load(start_dir: &Path) -> ConfigResult<Self> {
        let mut dir = start_dir.to_path_buf();
        loop {
            let config_path = dir.join(CONFIG_FILE_NAME);
            if config_path.exists() {
                return Self::load(&config_path);
            }
            if !dir.pop() {
                // Reached root without finding config
                return Ok(Self::default());
            }
        }
    }

    /// Save configuration to a file.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Event loop tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventLoopConfig {
    /// Initial capacity of the poll set
    #[serde(default = "default_max_poll_fds")]
    pub max_poll_fds: usize,

    /// Messages delivered per worker port in one iteration
    #[serde(default = "default_max_messages")]
    pub max_messages_per_iteration: usize,
}

fn default_max_poll_fds() -> usize {
    64
}

fn default_max_messages() -> usize {
    256
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            max_poll_fds: default_max_poll_fds(),
            max_messages_per_iteration: default_max_messages(),
        }
    }
}

/// Child process handling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessConfig {
    /// Collect terminated background children when SIGCHLD arrives
    #[serde(default = "default_true")]
    pub reap_on_sigchld: bool,

    /// Upper bound on descriptors closed in a freshly forked child
    #[serde(default = "default_close_fds_limit")]
    pub close_fds_limit: usize,
}

fn default_true() -> bool {
    true
}

fn default_close_fds_limit() -> usize {
    1024
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            reap_on_sigchld: true,
            close_fds_limit: default_close_fds_limit(),
        }
    }
}

/// Worker thread settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    /// Stack size of each worker thread in bytes
    #[serde(default = "default_stack_size")]
    pub stack_size: usize,

    /// Thread names are this prefix followed by the worker id
    #[serde(default = "default_thread_name_prefix")]
    pub thread_name_prefix: String,
}

fn default_stack_size() -> usize {
    2 * 1024 * 1024
}

fn default_thread_name_prefix() -> String {
    "hostrt-worker-".to_string()
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            stack_size: default_stack_size(),
            thread_name_prefix: default_thread_name_prefix(),
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Minimum level written by [`crate::logging::init_from_config`]
    #[serde(default)]
    pub level: LogLevel,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert!(config.process.reap_on_sigchld);
        assert_eq!(config.event_loop.max_messages_per_iteration, 256);
        assert_eq!(config.worker.thread_name_prefix, "hostrt-worker-");
        assert_eq!(config.logging.level, LogLevel::Info);
    }

    #[test]
    fn test_parse_config() {
        let toml_str = r#"
[event_loop]
max_messages_per_iteration = 8

[process]
reap_on_sigchld = false

[logging]
level = "debug"
"#;
        let config: RuntimeConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.event_loop.max_messages_per_iteration, 8);
        assert_eq!(config.event_loop.max_poll_fds, 64);
        assert!(!config.process.reap_on_sigchld);
        assert_eq!(config.process.close_fds_limit, 1024);
        assert_eq!(config.logging.level, LogLevel::Debug);
    }

    #[test]
    fn test_save_and_find() {
        let dir = std::env::temp_dir().join(format!("hostrt-config-{}", std::process::id()));
        let nested = dir.join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        let mut config = RuntimeConfig::default();
        config.worker.stack_size = 512 * 1024;
        config.save(&dir.join(CONFIG_FILE_NAME)).unwrap();

        let found = RuntimeConfig::find_and_load(&nested).unwrap();
        assert_eq!(found, config);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_load_missing() {
        let err = RuntimeConfig::load(Path::new("/nonexistent/hostrt.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }
}
