// Pluggable sample sources for ingestion
//
// Device adapters (LSL inlets, vendor SDK bridges, ...) implement the
// `SampleSource` trait. Both methods are blocking: the ingestion loop runs
// them on Tokio's blocking pool, so an adapter may wrap a synchronous SDK
// directly.
//
// Current implementations:
// - Replay: in-memory scripted pulls for tests, demos and recorded sessions

mod replay;

use crate::error::StreamResult;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use replay::ReplaySource;

/// One sample set returned by a pull
///
/// Every value shares the same source timestamp; the clock correction is
/// reported by the source alongside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PulledSamples<V = f64> {
    /// Per-channel values, keyed by channel name
    pub values: Vec<(String, V)>,

    /// Timestamp on the source's local clock (seconds)
    pub source_timestamp: f64,

    /// Offset that maps the source clock onto the common clock (seconds)
    pub clock_correction: f64,
}

impl<V> PulledSamples<V> {
    pub fn new(values: Vec<(String, V)>, source_timestamp: f64, clock_correction: f64) -> Self {
        Self {
            values,
            source_timestamp,
            clock_correction,
        }
    }

    /// Build a sample set from a positional frame, pairing the i-th value with
    /// the i-th channel name. Surplus values or names are ignored.
    pub fn from_frame<S: AsRef<str>>(
        channel_names: &[S],
        frame: Vec<V>,
        source_timestamp: f64,
        clock_correction: f64,
    ) -> Self {
        if channel_names.len() != frame.len() {
            log::warn!(
                "Frame has {} values for {} channels",
                frame.len(),
                channel_names.len()
            );
        }

        let values = channel_names
            .iter()
            .map(|name| name.as_ref().to_string())
            .zip(frame)
            .collect();

        Self::new(values, source_timestamp, clock_correction)
    }

    /// Timestamp on the common clock
    pub fn corrected_timestamp(&self) -> f64 {
        self.source_timestamp + self.clock_correction
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Trait for all sample sources consumed by the ingestion loop
///
/// # Extension Example
///
/// ```rust,ignore
/// use neurostack::streaming::{PulledSamples, SampleSource};
/// use neurostack::StreamResult;
/// use std::time::Duration;
///
/// struct MyDevice { /* SDK handle */ }
///
/// impl SampleSource<f64> for MyDevice {
///     fn resolve_channel_names(&mut self, timeout: Duration) -> StreamResult<Vec<String>> {
///         // Wait up to `timeout` for the device to advertise its channels
///         Ok(vec!["TP9".into(), "AF7".into()])
///     }
///
///     fn pull(&mut self, timeout: Duration) -> StreamResult<Option<PulledSamples<f64>>> {
///         // Block up to `timeout` for the next frame
///         Ok(None)
///     }
/// }
/// ```
pub trait SampleSource<V>: Send {
    /// Channel names advertised by the source, in source order
    ///
    /// May block up to `timeout`. An empty list or an error means no stream
    /// could be resolved.
    fn resolve_channel_names(&mut self, timeout: Duration) -> StreamResult<Vec<String>>;

    /// Pull the next sample set, blocking up to `timeout`
    ///
    /// `Ok(None)` means nothing arrived in time and is not an error.
    fn pull(&mut self, timeout: Duration) -> StreamResult<Option<PulledSamples<V>>>;
}

impl<V, T: SampleSource<V> + ?Sized> SampleSource<V> for Box<T> {
    fn resolve_channel_names(&mut self, timeout: Duration) -> StreamResult<Vec<String>> {
        (**self).resolve_channel_names(timeout)
    }

    fn pull(&mut self, timeout: Duration) -> StreamResult<Option<PulledSamples<V>>> {
        (**self).pull(timeout)
    }
}
