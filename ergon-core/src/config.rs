//! Configuration types for the Ergon engine

use serde::{Deserialize, Serialize};
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

/// Smallest memory ceiling an isolate is provisioned with
pub const MIN_MEMORY_CEILING_BYTES: u64 = 8 * MIB;

/// Main configuration for the Ergon engine
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct ErgonConfig {
    /// Sandbox execution configuration
    pub sandbox: SandboxConfig,
}

/// Sandbox execution configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SandboxConfig {
    /// Wall-clock budget for one invocation, in milliseconds
    pub timeout_ms: u64,

    /// Forward sandbox console output to the host log (otherwise discarded)
    pub allow_console_forwarding: bool,

    /// Memory ceiling for the isolate, in bytes
    pub memory_ceiling_bytes: u64,

    /// Prefix the result text with one line per capability call
    pub include_trace_in_output: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            allow_console_forwarding: true,
            memory_ceiling_bytes: 128 * MIB,
            include_trace_in_output: false,
        }
    }
}

impl SandboxConfig {
    /// Set the timeout
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Set the memory ceiling
    pub fn with_memory_ceiling_bytes(mut self, bytes: u64) -> Self {
        self.memory_ceiling_bytes = bytes;
        self
    }

    /// Enable or disable console forwarding
    pub fn with_console_forwarding(mut self, enabled: bool) -> Self {
        self.allow_console_forwarding = enabled;
        self
    }

    /// Enable or disable trace lines in the result text
    pub fn with_trace_in_output(mut self, enabled: bool) -> Self {
        self.include_trace_in_output = enabled;
        self
    }

    /// Timeout as a duration
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Memory ceiling actually applied: rounded up to a whole MiB, at least 8 MiB
    pub fn memory_limit_bytes(&self) -> u64 {
        let rounded = self.memory_ceiling_bytes.div_ceil(MIB).saturating_mul(MIB);
        rounded.max(MIN_MEMORY_CEILING_BYTES)
    }

    /// Validate the sandbox settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the timeout is zero.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.timeout_ms == 0 {
            return Err(crate::error::ErgonError::Configuration(
                "sandbox.timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl ErgonConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Loads in this order:
    /// 1. Default configuration
    /// 2. `ergon.toml` in the working directory
    /// 3. The file named by `ERGON_CONFIG_PATH`
    /// 4. `ERGON_` environment variables (`__` separates nesting levels)
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration source is invalid.
    pub fn load() -> crate::error::Result<Self> {
        use figment::{
            Figment,
            providers::{Env, Format, Serialized, Toml},
        };

        let mut figment = Figment::from(Serialized::defaults(ErgonConfig::default()))
            .merge(Toml::file("ergon.toml"));

        // Check for custom config path
        if let Ok(path) = std::env::var("ERGON_CONFIG_PATH") {
            figment = figment.merge(Toml::file(path));
        }

        let figment = figment.merge(Env::prefixed("ERGON_").split("__"));

        let config: ErgonConfig = figment.extract().map_err(|e| {
            crate::error::ErgonError::Configuration(format!("Failed to load configuration: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::error::Result<Self> {
        use figment::{
            Figment,
            providers::{Format, Serialized, Toml},
        };

        let path = path.as_ref();
        if !path.exists() {
            return Err(crate::error::ErgonError::Configuration(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }

        let config: ErgonConfig = Figment::from(Serialized::defaults(ErgonConfig::default()))
            .merge(Toml::file(path))
            .extract()
            .map_err(|e| {
                crate::error::ErgonError::Configuration(format!(
                    "Failed to load configuration file: {}",
                    e
                ))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> crate::error::Result<()> {
        self.sandbox.validate()
    }
}
