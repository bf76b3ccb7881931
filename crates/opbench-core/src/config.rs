use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;

/// Top-level harness configuration, loaded from opbench.toml.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarnessConfig {
    #[serde(default)]
    pub profile: ProfileConfig,
    #[serde(default)]
    pub device: DeviceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileConfig {
    /// Number of timed kernel invocations
    #[serde(default = "default_iterations")]
    pub iterations: usize,
    /// Opaque launch hint forwarded to the kernel
    #[serde(default = "default_threads_per_block")]
    pub threads_per_block: u16,
    /// Which kernel status is surfaced when iterating more than once
    #[serde(default)]
    pub status_policy: StatusPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Execution backend: "cuda" or "host"
    #[serde(default)]
    pub backend: Backend,
    /// CUDA device ordinal
    #[serde(default)]
    pub ordinal: i32,
    /// Driver library names tried in order (None = platform defaults)
    pub driver_libraries: Option<Vec<String>>,
}

/// How the profiling loop reports kernel status across iterations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusPolicy {
    /// Run every iteration and surface only the status of the last one.
    #[default]
    #[serde(rename = "last-iteration")]
    LastIteration,
    /// Stop at the first nonzero status and surface it.
    #[serde(rename = "fail-fast")]
    FailFast,
}

/// Where device buffers live and kernels run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Backend {
    /// Real GPU through the CUDA driver API
    #[default]
    #[serde(rename = "cuda")]
    Cuda,
    /// Host memory standing in for device memory (CPU operator libraries)
    #[serde(rename = "host")]
    Host,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            iterations: default_iterations(),
            threads_per_block: default_threads_per_block(),
            status_policy: StatusPolicy::default(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            ordinal: 0,
            driver_libraries: None,
        }
    }
}

impl HarnessConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        Self::parse(path, &content)
    }

    /// Parse configuration text; `origin` is only used in error messages.
    pub fn parse(origin: &str, content: &str) -> Result<Self, ConfigError> {
        let config: HarnessConfig = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file if it exists, otherwise return defaults.
    pub fn load_or_default(path: &str) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                debug!("using default configuration: {}", e);
                Self::default()
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.device.ordinal < 0 {
            return Err(ConfigError::Invalid(format!(
                "device ordinal must be non-negative, got {}",
                self.device.ordinal
            )));
        }
        if let Some(ref libs) = self.device.driver_libraries {
            if libs.is_empty() {
                return Err(ConfigError::Invalid(
                    "driver_libraries must name at least one library".to_string(),
                ));
            }
        }
        Ok(())
    }
}

impl fmt::Display for StatusPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusPolicy::LastIteration => f.write_str("last-iteration"),
            StatusPolicy::FailFast => f.write_str("fail-fast"),
        }
    }
}

impl FromStr for StatusPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "last-iteration" => Ok(StatusPolicy::LastIteration),
            "fail-fast" => Ok(StatusPolicy::FailFast),
            other => Err(ConfigError::Invalid(format!("unknown status policy: {}", other))),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Cuda => f.write_str("cuda"),
            Backend::Host => f.write_str("host"),
        }
    }
}

impl FromStr for Backend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cuda" => Ok(Backend::Cuda),
            "host" => Ok(Backend::Host),
            other => Err(ConfigError::Invalid(format!("unknown backend: {}", other))),
        }
    }
}

/// Returns the default config file path based on platform conventions.
/// Search order:
/// 1. System-wide config: `%PROGRAMDATA%\opbench\opbench.toml` (Windows) or `/etc/opbench/opbench.toml`
/// 2. Local fallback: `./opbench.toml`
pub fn default_config_path() -> String {
    #[cfg(windows)]
    {
        let programdata = std::env::var("PROGRAMDATA")
            .unwrap_or_else(|_| r"C:\ProgramData".to_string());
        let system_path = format!(r"{}\opbench\opbench.toml", programdata);
        if std::path::Path::new(&system_path).exists() {
            return system_path;
        }
    }
    #[cfg(not(windows))]
    {
        let system_path = "/etc/opbench/opbench.toml";
        if std::path::Path::new(system_path).exists() {
            return system_path.to_string();
        }
    }
    "opbench.toml".to_string()
}

fn default_iterations() -> usize {
    10
}

fn default_threads_per_block() -> u16 {
    256
}
