// Common types for the streaming module

use serde::{Deserialize, Serialize};

/// A single timestamped measurement
///
/// The payload is opaque to the store; scalar readings use the default `f64`,
/// but a sample may just as well carry a vector or a marker string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample<V = f64> {
    /// Timestamp on the common clock, in seconds
    pub timestamp: f64,
    pub value: V,
}

impl<V> Sample<V> {
    pub fn new(timestamp: f64, value: V) -> Self {
        Self { timestamp, value }
    }
}

/// Lifecycle of an ingestion loop
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "type", content = "data")]
pub enum IngestionState {
    /// No source has been resolved yet
    #[default]
    Idle,

    /// Channel names resolved, no background task running
    Connected { channels: usize },

    /// Background task is pulling from the source
    Streaming { session_id: String, started_at: f64 },

    /// Session was stopped by the caller
    Stopped,

    /// Session ended on its own after repeated source failures
    Failed { message: String },
}

/// Counters for the current (or most recent) ingestion session
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct IngestionStats {
    pub total_pulls: u64,
    pub empty_pulls: u64,
    pub pull_errors: u64,
    pub samples_appended: u64,
    pub samples_dropped: u64,
    pub uptime_seconds: Option<f64>,
}
