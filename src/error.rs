// Error types shared by the channel store and the ingestion loop

use thiserror::Error;

/// Result type for streaming operations
pub type StreamResult<T> = Result<T, StreamError>;

/// Errors that can occur while storing, querying or ingesting samples
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StreamError {
    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    #[error("Channel has no data: {0}")]
    EmptyChannel(String),

    #[error("Channel already exists: {0}")]
    DuplicateChannel(String),

    #[error("Channel was removed while streaming: {0}")]
    AppendToRemovedChannel(String),

    #[error("Sample not found in channel: {0}")]
    SampleNotFound(String),

    #[error("Invalid sample timestamp: {0}")]
    InvalidTimestamp(f64),

    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Source error: {0}")]
    Source(String),

    #[error("Ingestion loop is not connected to a source")]
    NotConnected,

    #[error("Ingestion loop is already streaming")]
    AlreadyStreaming,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Ingestion task failed: {0}")]
    TaskJoin(String),

    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl StreamError {
    /// Conditions that are reported to the caller but leave the store intact
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StreamError::DuplicateChannel(_) | StreamError::AppendToRemovedChannel(_)
        )
    }
}
