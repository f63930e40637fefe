// Ingestion session configuration

use crate::error::{StreamError, StreamResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for an ingestion loop
///
/// Every field has a default so partial JSON documents are accepted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IngestionConfig {
    /// Name used in log lines for this stream (e.g. "eeg")
    pub session_name: String,

    /// Maximum time to wait for the source to advertise its channels (seconds)
    pub resolve_timeout_secs: f64,

    /// Maximum time a single pull may block before yielding nothing (seconds)
    pub pull_timeout_secs: f64,

    /// Extra channels created alongside the advertised ones when a session
    /// starts, e.g. a marker channel written by an external tagger
    pub event_channels: Vec<String>,

    /// Consecutive failed pulls tolerated before the session ends (0 = unlimited)
    pub max_consecutive_pull_errors: u32,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            session_name: "eeg".to_string(),
            resolve_timeout_secs: 30.0,
            pull_timeout_secs: 1.0,
            event_channels: Vec::new(),
            max_consecutive_pull_errors: 10,
        }
    }
}

impl IngestionConfig {
    /// Parse a configuration from JSON and validate it
    pub fn from_json(json: &str) -> StreamResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| StreamError::InvalidConfig(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> StreamResult<()> {
        if self.session_name.trim().is_empty() {
            return Err(StreamError::InvalidConfig(
                "session_name must not be empty".to_string(),
            ));
        }

        for (field, value) in [
            ("resolve_timeout_secs", self.resolve_timeout_secs),
            ("pull_timeout_secs", self.pull_timeout_secs),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(StreamError::InvalidConfig(format!(
                    "{} must be a positive number of seconds, got {}",
                    field, value
                )));
            }
        }

        if let Some(blank) = self.event_channels.iter().find(|n| n.trim().is_empty()) {
            return Err(StreamError::InvalidConfig(format!(
                "event channel names must not be blank, got {:?}",
                blank
            )));
        }

        Ok(())
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.resolve_timeout_secs)
    }

    pub fn pull_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.pull_timeout_secs)
    }
}
