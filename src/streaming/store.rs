// Channel-indexed time-series store
//
// The name -> channel index is guarded by a structural lock that is only
// held long enough to add, remove, list or look up a channel. Appends and
// reads take the per-channel lock after the index lock has been released, so
// a reader of one channel is never blocked by a writer of another.
//
// A store accepts at most one ingestion session at a time; the session id
// holding it is kept in a separate slot claimed by the ingestion loop.

use crate::error::{StreamError, StreamResult};
use crate::streaming::channel::Channel;
use crate::streaming::types::Sample;
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

struct ChannelIndex<V> {
    /// Channel names in insertion order
    order: Vec<String>,
    by_name: HashMap<String, Arc<Channel<V>>>,
}

impl<V> Default for ChannelIndex<V> {
    fn default() -> Self {
        Self {
            order: Vec::new(),
            by_name: HashMap::new(),
        }
    }
}

/// Thread-safe mapping from channel name to its timestamped samples
///
/// Share it between the ingestion loop and readers with `Arc<ChannelStore>`.
pub struct ChannelStore<V = f64> {
    index: RwLock<ChannelIndex<V>>,
    ingestion: Mutex<Option<String>>,
}

impl<V> Default for ChannelStore<V> {
    fn default() -> Self {
        Self {
            index: RwLock::new(ChannelIndex::default()),
            ingestion: Mutex::new(None),
        }
    }
}

impl<V> ChannelStore<V> {
    /// Id of the ingestion session currently writing into this store
    pub fn active_ingestion(&self) -> Option<String> {
        self.ingestion.lock().clone()
    }

    /// Reserve the store for `session_id`; fails if another session holds it
    pub(crate) fn claim_ingestion(&self, session_id: &str) -> StreamResult<()> {
        let mut active = self.ingestion.lock();
        if let Some(holder) = active.as_ref() {
            log::warn!(
                "Store already ingesting session {}, refusing session {}",
                holder,
                session_id
            );
            return Err(StreamError::AlreadyStreaming);
        }
        *active = Some(session_id.to_string());
        Ok(())
    }

    /// Release the store if `session_id` still holds it
    pub(crate) fn release_ingestion(&self, session_id: &str) {
        let mut active = self.ingestion.lock();
        if active.as_deref() == Some(session_id) {
            *active = None;
        }
    }
}

impl<V: Clone + Send + Sync> ChannelStore<V> {
    pub fn new() -> Self {
        Self::default()
    }

    fn channel(&self, name: &str) -> StreamResult<Arc<Channel<V>>> {
        self.index
            .read()
            .by_name
            .get(name)
            .cloned()
            .ok_or_else(|| StreamError::ChannelNotFound(name.to_string()))
    }

    /// Create an empty channel
    ///
    /// Returns `DuplicateChannel` and leaves the existing channel untouched if
    /// the name is already taken.
    pub fn add_channel(&self, name: &str) -> StreamResult<()> {
        let mut index = self.index.write();
        if index.by_name.contains_key(name) {
            log::debug!("Channel {} already exists", name);
            return Err(StreamError::DuplicateChannel(name.to_string()));
        }

        index
            .by_name
            .insert(name.to_string(), Arc::new(Channel::new(name)));
        index.order.push(name.to_string());
        log::debug!("Added channel {}", name);
        Ok(())
    }

    /// Delete a channel together with its samples
    pub fn remove_channel(&self, name: &str) -> StreamResult<()> {
        let channel = {
            let mut index = self.index.write();
            let channel = index
                .by_name
                .remove(name)
                .ok_or_else(|| StreamError::ChannelNotFound(name.to_string()))?;
            index.order.retain(|n| n != name);
            channel
        };

        // A writer that looked the channel up before removal sees this flag
        channel.mark_removed();
        log::debug!("Removed channel {}", name);
        Ok(())
    }

    /// Point-in-time view of the channel names, in insertion order
    pub fn list_channels(&self) -> Vec<String> {
        self.index.read().order.clone()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.read().by_name.contains_key(name)
    }

    pub fn channel_count(&self) -> usize {
        self.index.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channel_count() == 0
    }

    /// Drop every channel
    pub fn clear(&self) {
        let drained: Vec<Arc<Channel<V>>> = {
            let mut index = self.index.write();
            index.order.clear();
            index.by_name.drain().map(|(_, channel)| channel).collect()
        };

        for channel in &drained {
            channel.mark_removed();
        }
        log::debug!("Cleared {} channels", drained.len());
    }

    /// Append a sample to an existing channel; channels are never created here
    ///
    /// Timestamps are expected to be non-decreasing. An earlier timestamp is
    /// still stored, but range queries scan every sample appended from that
    /// point on linearly instead of binary searching them.
    pub fn append(&self, name: &str, sample: Sample<V>) -> StreamResult<()> {
        self.channel(name)?.append(sample)
    }

    /// True iff the channel exists and holds at least one sample
    pub fn has_data(&self, name: &str) -> bool {
        self.channel(name).map_or(false, |channel| channel.len() > 0)
    }

    pub fn sample_count(&self, name: &str) -> StreamResult<usize> {
        Ok(self.channel(name)?.len())
    }

    /// Most recently appended sample of a channel
    pub fn latest(&self, name: &str) -> StreamResult<Sample<V>> {
        self.channel(name)?
            .latest()
            .ok_or_else(|| StreamError::EmptyChannel(name.to_string()))
    }

    /// Latest sample for each named channel
    ///
    /// Empty channels map to `None`; channels that do not exist are left out.
    pub fn latest_multi<S: AsRef<str>>(&self, names: &[S]) -> HashMap<String, Option<Sample<V>>> {
        let mut latest = HashMap::with_capacity(names.len());
        for name in names {
            let name = name.as_ref();
            match self.channel(name) {
                Ok(channel) => {
                    latest.insert(name.to_string(), channel.latest());
                }
                Err(_) => log::warn!("Channel {} does not exist, skipping", name),
            }
        }
        latest
    }

    /// Samples of one channel, optionally restricted to a time window
    ///
    /// - no start: every sample
    /// - start only: samples with `timestamp >= start`
    /// - start and duration: samples with `start <= timestamp < start + duration`
    ///
    /// The result is a copy; a window past the last sample yields an empty vec.
    /// Lookup is logarithmic over the in-order prefix of the channel plus a
    /// linear pass over samples appended after the first out-of-order one.
    pub fn query(
        &self,
        name: &str,
        start_time: Option<f64>,
        duration: Option<f64>,
    ) -> StreamResult<Vec<Sample<V>>> {
        let channel = self.channel(name)?;

        let Some(start) = start_time else {
            return Ok(channel.snapshot());
        };

        if !start.is_finite() {
            return Err(StreamError::InvalidTimestamp(start));
        }
        if let Some(duration) = duration.filter(|d| d.is_nan()) {
            return Err(StreamError::InvalidTimestamp(duration));
        }

        Ok(channel.range(start, duration))
    }

    /// `query` applied to several channels
    ///
    /// A failure on one channel is recorded under its name and does not
    /// affect the others.
    pub fn query_multi<S: AsRef<str> + Sync>(
        &self,
        names: &[S],
        start_time: Option<f64>,
        duration: Option<f64>,
    ) -> HashMap<String, StreamResult<Vec<Sample<V>>>> {
        names
            .par_iter()
            .map(|name| {
                let name = name.as_ref();
                (name.to_string(), self.query(name, start_time, duration))
            })
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn channel_handle(&self, name: &str) -> StreamResult<Arc<Channel<V>>> {
        self.channel(name)
    }
}

impl<V: Clone + Send + Sync + PartialEq> ChannelStore<V> {
    /// Remove the first stored sample equal to `sample`
    pub fn remove_sample(&self, name: &str, sample: &Sample<V>) -> StreamResult<()> {
        self.channel(name)?.remove_sample(sample)
    }
}
