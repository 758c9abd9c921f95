//! Configuration types for the Strand framework

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// What a context service does with one context type when capturing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContextPolicy {
    /// Capture the calling thread's value and reinstate it on the executing thread
    Propagated,

    /// Clear the type on the executing thread for the duration of the task
    #[default]
    Cleared,

    /// Leave the executing thread's ambient value alone
    Unchanged,
}

/// Main configuration for a context service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextServiceConfig {
    /// Service name, used in executor names and log output
    pub name: String,

    /// Per-context-type policy overrides, keyed by context type name
    #[serde(default)]
    pub policies: BTreeMap<String, ContextPolicy>,

    /// Policy applied to every registered context type not named in `policies`
    #[serde(default)]
    pub default_policy: ContextPolicy,

    /// How long a graceful shutdown waits for in-flight tasks
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for ContextServiceConfig {
    fn default() -> Self {
        Self {
            name: "context-service".to_string(),
            policies: BTreeMap::new(),
            default_policy: ContextPolicy::Cleared,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl ContextServiceConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Loads in this order:
    /// 1. Default configuration
    /// 2. Configuration file (strand.toml or path from STRAND_CONFIG_PATH)
    /// 3. Environment variable overrides
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file is invalid.
    pub fn load() -> crate::error::Result<Self> {
        use figment::{
            Figment,
            providers::{Env, Format, Serialized, Toml},
        };

        let mut figment = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file("strand.toml"))
            .merge(Env::prefixed("STRAND_").split("_"));

        // Check for custom config path
        if let Ok(path) = std::env::var("STRAND_CONFIG_PATH") {
            figment = figment.merge(Toml::file(path));
        }

        let config: ContextServiceConfig = figment.extract().map_err(|e| {
            crate::error::StrandError::Configuration(format!("Failed to load configuration: {}", e))
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

        let config: ContextServiceConfig = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .extract()
            .map_err(|e| {
                crate::error::StrandError::Configuration(format!(
                    "Failed to load configuration file: {}",
                    e
                ))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.name.trim().is_empty() {
            return Err(crate::error::StrandError::Configuration(
                "Service name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
