//! Configuration parsing and structures

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::env::substitute_env_vars;
use crate::mount::{MountOptions, DEFAULT_MOUNT_TIMEOUT};

/// Top-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// The mount to serve
    pub mount: MountConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Mount point configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MountConfig {
    /// Path where the filesystem will be mounted
    pub path: PathBuf,

    /// Program name handed to the native loop
    #[serde(default = "default_name")]
    pub name: String,

    /// Serve on the calling thread until unmounted
    #[serde(default)]
    pub blocking: bool,

    /// Native loop debug output
    #[serde(default)]
    pub debug: bool,

    /// How long a non-blocking mount waits for the loop to fail
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// `-o` options passed to the native loop
    #[serde(default)]
    pub options: BTreeSet<String>,

    /// Worker threads for the dispatcher's runtime
    pub worker_threads: Option<usize>,
}

fn default_name() -> String {
    "fuse".to_string()
}

fn default_timeout() -> Duration {
    DEFAULT_MOUNT_TIMEOUT
}

impl MountConfig {
    pub fn to_options(&self) -> MountOptions {
        MountOptions {
            blocking: self.blocking,
            debug: self.debug,
            options: self.options.clone(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(path.to_path_buf(), e.to_string()))?;

        Self::from_str(&content)
    }

    /// Parse configuration from a YAML string, expanding `${VAR}` references
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let content = substitute_env_vars(content)?;
        serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mount = &self.mount;
        if mount.path.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "Mount path cannot be empty".to_string(),
            ));
        }
        if mount.name.trim().is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "Mount {:?}: name cannot be empty",
                mount.path
            )));
        }
        if mount.timeout.is_zero() {
            return Err(ConfigError::ValidationError(format!(
                "Mount {:?}: timeout must be greater than zero",
                mount.path
            )));
        }
        if mount.worker_threads == Some(0) {
            return Err(ConfigError::ValidationError(format!(
                "Mount {:?}: worker_threads must be at least 1",
                mount.path
            )));
        }
        if let Some(option) = mount.options.iter().find(|o| o.is_empty() || o.contains(',')) {
            return Err(ConfigError::ValidationError(format!(
                "Mount {:?}: invalid option {:?}, list options separately",
                mount.path, option
            )));
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    ReadError(PathBuf, String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
logging:
  level: debug

mount:
  path: /mnt/data
  name: datafs
  blocking: true
  debug: true
  timeout: 500ms
  worker_threads: 2
  options:
    - allow_other
    - ro
    - allow_other
"#;

        let config = Config::from_str(yaml).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.mount.path, PathBuf::from("/mnt/data"));
        assert_eq!(config.mount.name, "datafs");
        assert_eq!(config.mount.timeout, Duration::from_millis(500));
        assert_eq!(config.mount.worker_threads, Some(2));

        let options = config.mount.to_options();
        assert!(options.blocking);
        assert!(options.debug);
        assert_eq!(
            options.options.into_iter().collect::<Vec<_>>(),
            vec!["allow_other", "ro"]
        );
        config.validate().unwrap();
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_str("mount:\n  path: /mnt/x\n").unwrap();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.mount.name, "fuse");
        assert!(!config.mount.blocking);
        assert_eq!(config.mount.timeout, DEFAULT_MOUNT_TIMEOUT);
        assert!(config.mount.options.is_empty());
        assert!(config.mount.worker_threads.is_none());
    }

    #[test]
    fn test_env_substitution() {
        std::env::set_var("PATHFUSE_TEST_MOUNT_ROOT", "/srv");
        let config =
            Config::from_str("mount:\n  path: ${PATHFUSE_TEST_MOUNT_ROOT}/fs\n  name: ${PATHFUSE_TEST_UNSET_NAME:-memfs}\n")
                .unwrap();
        std::env::remove_var("PATHFUSE_TEST_MOUNT_ROOT");

        assert_eq!(config.mount.path, PathBuf::from("/srv/fs"));
        assert_eq!(config.mount.name, "memfs");
    }

    #[test]
    fn test_missing_mount_section() {
        let err = Config::from_str("logging:\n  level: info\n").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)), "{}", err);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let base = Config::from_str("mount:\n  path: /mnt/x\n").unwrap();

        let mut config = base.clone();
        config.mount.timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.mount.name = " ".to_string();
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.mount.worker_threads = Some(0);
        assert!(config.validate().is_err());

        let mut config = base;
        config.mount.options.insert("ro,allow_other".to_string());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("ro,allow_other"), "{}", err);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "mount:\n  path: /mnt/from-file").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.mount.path, PathBuf::from("/mnt/from-file"));

        let err = Config::from_file(Path::new("/nonexistent/pathfuse.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadError(..)));
    }
}
