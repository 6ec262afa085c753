use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// File looked up in the working directory when no `--config` is given
pub const DEFAULT_CONFIG_FILE: &str = "theo.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{}': {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// How the final report is rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Tree per specification with a failure digest
    #[default]
    Nice,
    /// One line per lifecycle event, as it happens
    Events,
    /// The whole run summary as JSON
    Json,
}

/// External memory checker invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemcheckConfig {
    /// Checker executable, looked up on PATH
    pub tool: String,
    /// Arguments added after the harness's own flags
    pub extra_args: Vec<String>,
}

impl Default for MemcheckConfig {
    fn default() -> Self {
        Self {
            tool: "valgrind".to_string(),
            extra_args: Vec::new(),
        }
    }
}

/// Harness-wide settings: defaults < config file < command line
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Maximum number of specifications executed at once
    pub parallelism: usize,
    /// Default per-test timeout in seconds
    pub timeout_secs: u64,
    /// Timeout for each setup command in seconds
    pub setup_timeout_secs: u64,
    /// When false, `valgrind: true` in annotations is ignored
    pub memory_check: bool,
    pub memcheck: MemcheckConfig,
    pub format: OutputFormat,
    pub color: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            parallelism: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            timeout_secs: 600,
            setup_timeout_secs: 600,
            memory_check: true,
            memcheck: MemcheckConfig::default(),
            format: OutputFormat::Nice,
            color: true,
        }
    }
}

impl HarnessConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load settings from a TOML file; missing keys keep their defaults.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Use `explicit` if given, else `./theo.toml` when present, else defaults.
    pub fn load(explicit: Option<&Path>) -> ConfigResult<Self> {
        match explicit {
            Some(path) => Self::from_file(path),
            None => {
                let local = Path::new(DEFAULT_CONFIG_FILE);
                if local.is_file() {
                    Self::from_file(local)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_setup_timeout_secs(mut self, secs: u64) -> Self {
        self.setup_timeout_secs = secs;
        self
    }

    pub fn with_memory_check(mut self, enabled: bool) -> Self {
        self.memory_check = enabled;
        self
    }

    pub fn with_memcheck_tool(mut self, tool: impl Into<String>) -> Self {
        self.memcheck.tool = tool.into();
        self
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_color(mut self, color: bool) -> Self {
        self.color = color;
        self
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_secs(self.setup_timeout_secs)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let invalid = |message: &str| {
            Err(ConfigError::Invalid {
                message: message.to_string(),
            })
        };

        if self.parallelism == 0 {
            return invalid("Parallelism must be greater than 0");
        }

        if self.timeout_secs == 0 {
            return invalid("Timeout must be greater than 0");
        }

        if self.setup_timeout_secs == 0 {
            return invalid("Setup timeout must be greater than 0");
        }

        if self.memcheck.tool.trim().is_empty() {
            return invalid("Memory checker tool cannot be empty");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HarnessConfig::default();
        assert!(config.parallelism >= 1);
        assert_eq!(config.timeout_secs, 600);
        assert_eq!(config.memcheck.tool, "valgrind");
        assert_eq!(config.format, OutputFormat::Nice);
        assert!(config.memory_check);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = HarnessConfig::new()
            .with_parallelism(3)
            .with_timeout_secs(5)
            .with_setup_timeout_secs(60)
            .with_memory_check(false)
            .with_format(OutputFormat::Json);

        assert_eq!(config.parallelism, 3);
        assert_eq!(config.test_timeout(), Duration::from_secs(5));
        assert_eq!(config.setup_timeout(), Duration::from_secs(60));
        assert!(!config.memory_check);
        assert_eq!(config.format, OutputFormat::Json);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = HarnessConfig::default();

        config.parallelism = 0;
        assert!(config.validate().is_err());

        config.parallelism = 2;
        config.timeout_secs = 0;
        assert!(config.validate().is_err());

        config.timeout_secs = 10;
        config.setup_timeout_secs = 0;
        assert!(config.validate().is_err());

        config.setup_timeout_secs = 10;
        config.memcheck.tool = " ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("theo.toml");
        std::fs::write(
            &path,
            "parallelism = 2\ntimeout_secs = 30\nformat = \"events\"\n\n[memcheck]\ntool = \"/opt/valgrind/bin/valgrind\"\nextra_args = [\"--track-origins=yes\"]\n",
        )
        .unwrap();

        let config = HarnessConfig::from_file(&path).unwrap();
        assert_eq!(config.parallelism, 2);
        assert_eq!(config.timeout_secs, 30);
        assert_eq!(config.setup_timeout_secs, 600);
        assert_eq!(config.format, OutputFormat::Events);
        assert_eq!(config.memcheck.tool, "/opt/valgrind/bin/valgrind");
        assert_eq!(config.memcheck.extra_args, vec!["--track-origins=yes"]);
    }

    #[test]
    fn test_config_file_errors() {
        let missing = HarnessConfig::from_file(Path::new("/nonexistent/theo.toml"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("theo.toml");
        std::fs::write(&path, "parallelism = \"many\"\n").unwrap();
        let err = HarnessConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("theo.toml"));
    }
}
