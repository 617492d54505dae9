use cgdelegate_core::ContainerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/cgdelegate/config.toml";

/// Prefix of environment variables overriding the file (`CGDELEGATE__LOGGING__LEVEL`)
pub const ENV_PREFIX: &str = "CGDELEGATE";

/// Main configuration for the cgdelegate CLI
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LogConfig,

    /// Where applied containers are remembered between invocations
    pub state: StateConfig,

    /// The container whose cgroups are managed
    pub container: ContainerConfig,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter when RUST_LOG is unset (default: "info")
    pub level: String,

    /// Directory for daily rotated log files; stderr only when unset
    pub log_dir: Option<PathBuf>,

    /// Log file name prefix (default: cgdelegate.log)
    pub file_name: String,
}

/// State directory configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Directory holding one JSON file per applied container (default: /run/cgdelegate)
    pub dir: PathBuf,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: None,
            file_name: "cgdelegate.log".to_string(),
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/run/cgdelegate"),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file overlaid by `CGDELEGATE__*` variables
    ///
    /// A missing file is not an error; defaults and the environment apply.
    ///
    /// # Example
    /// ```no_run
    /// use cgdelegate_cli::config::Config;
    ///
    /// let config = Config::load("/etc/cgdelegate/config.toml").unwrap();
    /// println!("Unit: {}", config.container.cgroup.unit_name());
    /// ```
    pub fn load(path: impl AsRef<Path>) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(
                config::File::from(path.as_ref())
                    .format(config::FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        settings.try_deserialize()
    }

    /// Save configuration to TOML file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), Box<dyn std::error::Error>> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        let cgroup = &self.container.cgroup;

        if cgroup.name.is_empty() {
            return Err("Container name must not be empty".to_string());
        }

        if cgroup.name.contains('/') {
            return Err(format!(
                "Container name must not contain '/', got: {}",
                cgroup.name
            ));
        }

        if cgroup.child_cgroup_dir.is_empty() || cgroup.child_cgroup_dir.contains('/') {
            return Err(format!(
                "Child cgroup directory must be a single path component, got: {:?}",
                cgroup.child_cgroup_dir
            ));
        }

        cgroup.resources.validate().map_err(|e| e.to_string())?;

        if self.state.dir.as_os_str().is_empty() {
            return Err("State directory must be set".to_string());
        }

        if self.logging.file_name.is_empty() {
            return Err("Log file name must not be empty".to_string());
        }

        Ok(())
    }

    /// Path of the log file prefix, if file logging is enabled
    pub fn log_path(&self) -> Option<PathBuf> {
        self.logging
            .log_dir
            .as_ref()
            .map(|dir| dir.join(&self.logging.file_name))
    }
}
