//! Configuration for the admission controller.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TurnstileError};

/// Settings for a single admission controller instance.
///
/// Supplied once at construction; there is no runtime reconfiguration.
/// The key extractor and skip predicate are closures and are configured
/// through [`AdmissionController::builder`](crate::AdmissionController::builder)
/// rather than here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Length of each counting window in milliseconds
    #[serde(default = "default_window_duration_ms")]
    pub window_duration_ms: u64,

    /// Maximum requests admitted per key per window
    #[serde(default = "default_max_requests")]
    pub max_requests_per_window: u64,

    /// Attach quota headers (limit/remaining/reset) to every decision
    #[serde(default = "default_emit_headers")]
    pub emit_headers: bool,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            window_duration_ms: default_window_duration_ms(),
            max_requests_per_window: default_max_requests(),
            emit_headers: default_emit_headers(),
        }
    }
}

fn default_window_duration_ms() -> u64 {
    60_000
}

fn default_max_requests() -> u64 {
    60
}

fn default_emit_headers() -> bool {
    true
}

impl AdmissionConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: AdmissionConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration, failing fast on unusable values.
    pub fn validate(&self) -> Result<()> {
        if self.window_duration_ms == 0 {
            return Err(TurnstileError::Config(
                "window_duration_ms must be positive".to_string(),
            ));
        }
        if self.max_requests_per_window == 0 {
            return Err(TurnstileError::Config(
                "max_requests_per_window must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
