// Channel-indexed time-series buffering with concurrent ingestion
//
// Architecture:
// - `store`: channel name -> timestamped samples, queryable by time range
// - `channel`: per-channel storage with its own lock and binary-search lookup
// - `source`: trait-based pluggable sample sources (device adapters)
// - `controller`: ingestion loop lifecycle (connect, start, stop)

mod channel;
pub mod controller;
pub mod source;
pub mod store;
pub mod types;

pub use controller::{IngestionEvent, IngestionLoop};
pub use source::{PulledSamples, ReplaySource, SampleSource};
pub use store::ChannelStore;
pub use types::{IngestionState, IngestionStats, Sample};
