//! Multi-channel time-series buffering for streamed biosignal data.
//!
//! A [`ChannelStore`] keeps one timestamp-ordered sample sequence per named
//! channel and answers point and time-range queries while an
//! [`IngestionLoop`] keeps appending samples pulled from a [`SampleSource`]
//! on a background task.
//!
//! ```rust,ignore
//! use neurostack::{ChannelStore, IngestionLoop, ReplaySource};
//! use std::sync::Arc;
//!
//! let store = Arc::new(ChannelStore::new());
//! let ingest = IngestionLoop::new(ReplaySource::new(["TP9", "AF7"]).with_frame(10.0, 0.5, vec![1.0, 2.0]));
//! ingest.connect().await?;
//! ingest.start(Arc::clone(&store))?;
//! // ... later
//! ingest.stop_and_wait().await?;
//! let tp9 = store.query("TP9", Some(10.0), Some(1.0))?;
//! ```

pub mod config;
pub mod error;
pub mod streaming;

pub use config::IngestionConfig;
pub use error::{StreamError, StreamResult};
pub use streaming::{
    ChannelStore, IngestionEvent, IngestionLoop, IngestionState, IngestionStats, PulledSamples,
    ReplaySource, Sample, SampleSource,
};
