// Per-channel sample storage
//
// Each channel owns its own lock so that writers and readers of different
// channels never contend. Samples are kept in append order; while timestamps
// stay non-decreasing, range lookups use binary search. The length of the
// sorted prefix is recorded: once an out-of-order sample is appended, the
// prefix before it is still binary searched and only the samples from the
// regression onwards are scanned linearly.

use crate::error::{StreamError, StreamResult};
use crate::streaming::types::Sample;
use parking_lot::RwLock;

pub(crate) struct ChannelData<V> {
    pub(crate) samples: Vec<Sample<V>>,
    /// `samples[..sorted_len]` is non-decreasing by timestamp
    sorted_len: usize,
    removed: bool,
}

pub(crate) struct Channel<V> {
    name: String,
    data: RwLock<ChannelData<V>>,
}

impl<V: Clone> Channel<V> {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: RwLock::new(ChannelData {
                samples: Vec::new(),
                sorted_len: 0,
                removed: false,
            }),
        }
    }

    pub(crate) fn append(&self, sample: Sample<V>) -> StreamResult<()> {
        if !sample.timestamp.is_finite() {
            return Err(StreamError::InvalidTimestamp(sample.timestamp));
        }

        let mut data = self.data.write();
        if data.removed {
            return Err(StreamError::AppendToRemovedChannel(self.name.clone()));
        }

        let prefix_intact = data.sorted_len == data.samples.len();
        let in_order = data
            .samples
            .last()
            .map_or(true, |last| sample.timestamp >= last.timestamp);

        if prefix_intact && !in_order {
            log::warn!(
                "Out-of-order sample on channel {} at index {}, later samples are scanned linearly",
                self.name,
                data.samples.len()
            );
        }

        data.samples.push(sample);
        if prefix_intact && in_order {
            data.sorted_len = data.samples.len();
        }
        Ok(())
    }

    /// Flag the channel as detached from its store; later appends fail
    pub(crate) fn mark_removed(&self) {
        self.data.write().removed = true;
    }

    pub(crate) fn len(&self) -> usize {
        self.data.read().samples.len()
    }

    pub(crate) fn latest(&self) -> Option<Sample<V>> {
        self.data.read().samples.last().cloned()
    }

    pub(crate) fn snapshot(&self) -> Vec<Sample<V>> {
        self.data.read().samples.clone()
    }

    /// Samples with `start <= timestamp`, bounded above by `start + duration`
    /// (exclusive) when a duration is given
    pub(crate) fn range(&self, start: f64, duration: Option<f64>) -> Vec<Sample<V>> {
        let data = self.data.read();
        let end = duration.map(|d| start + d);
        let (sorted, unsorted) = data.samples.split_at(data.sorted_len);

        let lo = sorted.partition_point(|s| s.timestamp < start);
        let hi = match end {
            Some(end) => lo + sorted[lo..].partition_point(|s| s.timestamp < end),
            None => sorted.len(),
        };

        let mut window = sorted[lo..hi].to_vec();
        window.extend(
            unsorted
                .iter()
                .filter(|s| s.timestamp >= start && end.map_or(true, |end| s.timestamp < end))
                .cloned(),
        );
        window
    }

    #[cfg(test)]
    pub(crate) fn sorted_len(&self) -> usize {
        self.data.read().sorted_len
    }

    #[cfg(test)]
    pub(crate) fn write_guard(&self) -> parking_lot::RwLockWriteGuard<'_, ChannelData<V>> {
        self.data.write()
    }
}

impl<V: Clone + PartialEq> Channel<V> {
    /// Remove the first sample equal to `sample`
    pub(crate) fn remove_sample(&self, sample: &Sample<V>) -> StreamResult<()> {
        let mut data = self.data.write();
        let idx = data
            .samples
            .iter()
            .position(|s| s == sample)
            .ok_or_else(|| StreamError::SampleNotFound(self.name.clone()))?;
        data.samples.remove(idx);
        if idx < data.sorted_len {
            data.sorted_len -= 1;
        }
        Ok(())
    }
}
