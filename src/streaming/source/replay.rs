// In-memory replay source
//
// Serves a scripted sequence of pulls, useful for:
// - Testing ingestion without external hardware
// - Replaying recorded sessions
// - Demo and development

use super::{PulledSamples, SampleSource};
use crate::error::{StreamError, StreamResult};
use std::collections::VecDeque;
use std::time::Duration;

pub struct ReplaySource<V> {
    channel_names: Vec<String>,
    script: VecDeque<StreamResult<PulledSamples<V>>>,
    pull_delay: Option<Duration>,
    resolve_delay: Option<Duration>,
    available: bool,
}

impl<V> ReplaySource<V> {
    pub fn new<S: Into<String>>(channel_names: impl IntoIterator<Item = S>) -> Self {
        Self {
            channel_names: channel_names.into_iter().map(Into::into).collect(),
            script: VecDeque::new(),
            pull_delay: None,
            resolve_delay: None,
            available: true,
        }
    }

    /// A source that never advertises a stream
    pub fn unavailable() -> Self {
        let mut source = Self::new(Vec::<String>::new());
        source.available = false;
        source
    }

    /// Queue one pull whose values are paired positionally with the channel names
    pub fn with_frame(mut self, source_timestamp: f64, clock_correction: f64, frame: Vec<V>) -> Self {
        let pulled = PulledSamples::from_frame(
            &self.channel_names,
            frame,
            source_timestamp,
            clock_correction,
        );
        self.script.push_back(Ok(pulled));
        self
    }

    pub fn with_pull(mut self, pulled: PulledSamples<V>) -> Self {
        self.script.push_back(Ok(pulled));
        self
    }

    /// Queue a failing pull
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.script.push_back(Err(StreamError::Source(message.into())));
        self
    }

    /// Sleep before serving each pull (simulates the device sample rate)
    pub fn with_pull_delay(mut self, delay: Duration) -> Self {
        self.pull_delay = Some(delay);
        self
    }

    /// Sleep before answering channel resolution
    pub fn with_resolve_delay(mut self, delay: Duration) -> Self {
        self.resolve_delay = Some(delay);
        self
    }

    pub fn remaining(&self) -> usize {
        self.script.len()
    }
}

impl<V: Send> SampleSource<V> for ReplaySource<V> {
    fn resolve_channel_names(&mut self, timeout: Duration) -> StreamResult<Vec<String>> {
        if let Some(delay) = self.resolve_delay {
            std::thread::sleep(delay);
        }

        if !self.available {
            std::thread::sleep(timeout);
            return Ok(Vec::new());
        }

        Ok(self.channel_names.clone())
    }

    fn pull(&mut self, timeout: Duration) -> StreamResult<Option<PulledSamples<V>>> {
        match self.script.pop_front() {
            Some(next) => {
                if let Some(delay) = self.pull_delay {
                    std::thread::sleep(delay);
                }
                next.map(Some)
            }
            None => {
                // Exhausted: behave like a quiet inlet
                std::thread::sleep(timeout);
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replays_script_in_order() {
        let mut source = ReplaySource::new(["C1", "C2"])
            .with_frame(10.0, 0.5, vec![1.0, 2.0])
            .with_error("inlet lost")
            .with_frame(11.0, 0.5, vec![3.0, 4.0]);

        assert_eq!(
            source.resolve_channel_names(Duration::from_millis(1)).unwrap(),
            vec!["C1".to_string(), "C2".to_string()]
        );

        let first = source.pull(Duration::from_millis(1)).unwrap().unwrap();
        assert_eq!(first.corrected_timestamp(), 10.5);
        assert_eq!(first.values[1], ("C2".to_string(), 2.0));

        assert_eq!(
            source.pull(Duration::from_millis(1)),
            Err(StreamError::Source("inlet lost".to_string()))
        );

        let third = source.pull(Duration::from_millis(1)).unwrap().unwrap();
        assert_eq!(third.source_timestamp, 11.0);
        assert_eq!(source.remaining(), 0);

        assert_eq!(source.pull(Duration::from_millis(1)).unwrap(), None);
    }

    #[test]
    fn test_unavailable_resolves_nothing() {
        let mut source: ReplaySource<f64> = ReplaySource::unavailable();
        assert!(source
            .resolve_channel_names(Duration::from_millis(1))
            .unwrap()
            .is_empty());
    }
}
