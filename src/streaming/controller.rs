// Ingestion loop - moves samples from a source into a channel store
//
// The loop manages:
// - Source connection (channel name resolution with a bounded wait)
// - Channel creation in the target store
// - One background pull task per session, stopped via CancellationToken
// - Timestamp correction onto the common clock
// - Per-session statistics
// - Event emission for recovered errors and state changes
//
// Stopping is advisory: `stop` cancels the session token and returns at once,
// so the pull that is in flight still completes and its samples are appended.
// `stop_and_wait` additionally awaits the background task.
//
// A store is written by at most one session at a time, across all loops.
// `start` claims the store for the new session and fails with
// `AlreadyStreaming` if another session holds it; `stop`, the end of the
// background task and dropping the loop release it.

use crate::config::IngestionConfig;
use crate::error::{StreamError, StreamResult};
use crate::streaming::{
    source::{PulledSamples, SampleSource},
    store::ChannelStore,
    types::{IngestionState, IngestionStats, Sample},
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{self, JoinHandle};
use tokio_util::sync::CancellationToken;

type SharedSource<V> = Arc<Mutex<Box<dyn SampleSource<V>>>>;
type EventCallback = Arc<dyn Fn(IngestionEvent) + Send + Sync>;

/// Events emitted by the ingestion loop
#[derive(Debug, Clone)]
pub enum IngestionEvent {
    StateChanged {
        session_name: String,
        state: IngestionState,
    },
    ChannelAdded {
        channel: String,
    },
    /// A pulled value could not be appended; ingestion continued
    SampleDropped {
        channel: String,
        timestamp: f64,
        error: StreamError,
    },
    /// The source failed a pull; ingestion retried
    PullFailed {
        error: StreamError,
    },
    SessionEnded {
        session_id: String,
        stats: IngestionStats,
    },
}

/// State shared between the loop handle and its background task
struct Shared {
    session_name: String,
    state: RwLock<IngestionState>,
    event_callback: RwLock<Option<EventCallback>>,
}

impl Shared {
    /// Invoke the callback with no lock held, so it may call back into the loop
    fn emit(&self, event: IngestionEvent) {
        let callback = self.event_callback.read().clone();
        if let Some(callback) = callback {
            callback(event);
        }
    }

    /// Set `state` only while `session_id` is still the streaming session
    fn end_session(&self, session_id: &str, state: IngestionState) {
        let current = {
            let mut guard = self.state.write();
            let current = matches!(
                &*guard,
                IngestionState::Streaming { session_id: id, .. } if id == session_id
            );
            if current {
                *guard = state.clone();
            }
            current
        };

        if current {
            self.emit(IngestionEvent::StateChanged {
                session_name: self.session_name.clone(),
                state,
            });
        }
    }
}

#[derive(Default)]
struct SessionCounters {
    total_pulls: AtomicU64,
    empty_pulls: AtomicU64,
    pull_errors: AtomicU64,
    samples_appended: AtomicU64,
    samples_dropped: AtomicU64,
}

impl SessionCounters {
    fn snapshot(&self, started: Instant) -> IngestionStats {
        IngestionStats {
            total_pulls: self.total_pulls.load(Ordering::Relaxed),
            empty_pulls: self.empty_pulls.load(Ordering::Relaxed),
            pull_errors: self.pull_errors.load(Ordering::Relaxed),
            samples_appended: self.samples_appended.load(Ordering::Relaxed),
            samples_dropped: self.samples_dropped.load(Ordering::Relaxed),
            uptime_seconds: Some(started.elapsed().as_secs_f64()),
        }
    }
}

struct Session<V> {
    id: String,
    cancel_token: CancellationToken,
    handle: Option<JoinHandle<()>>,
    store: Arc<ChannelStore<V>>,
    counters: Arc<SessionCounters>,
    started: Instant,
}

/// Pulls samples from a source into a [`ChannelStore`] on a background task
pub struct IngestionLoop<V = f64> {
    config: IngestionConfig,
    source: SharedSource<V>,
    channel_names: RwLock<Option<Vec<String>>>,
    shared: Arc<Shared>,
    session: Mutex<Option<Session<V>>>,
}

impl<V: Clone + Send + Sync + 'static> IngestionLoop<V> {
    /// Create a loop with the default configuration
    pub fn new(source: impl SampleSource<V> + 'static) -> Self {
        Self::build(Box::new(source), IngestionConfig::default())
    }

    pub fn with_config(
        source: impl SampleSource<V> + 'static,
        config: IngestionConfig,
    ) -> StreamResult<Self> {
        config.validate()?;
        Ok(Self::build(Box::new(source), config))
    }

    fn build(source: Box<dyn SampleSource<V>>, config: IngestionConfig) -> Self {
        let shared = Arc::new(Shared {
            session_name: config.session_name.clone(),
            state: RwLock::new(IngestionState::Idle),
            event_callback: RwLock::new(None),
        });

        Self {
            config,
            source: Arc::new(Mutex::new(source)),
            channel_names: RwLock::new(None),
            shared,
            session: Mutex::new(None),
        }
    }

    /// Set event callback function
    pub fn set_event_callback<F>(&self, callback: F)
    where
        F: Fn(IngestionEvent) + Send + Sync + 'static,
    {
        *self.shared.event_callback.write() = Some(Arc::new(callback));
    }

    pub fn config(&self) -> &IngestionConfig {
        &self.config
    }

    /// Resolve the channel names advertised by the source
    ///
    /// Fails with `SourceUnavailable` if nothing is resolved within the
    /// configured timeout. There is no retry; callers decide whether to
    /// connect again.
    pub async fn connect(&self) -> StreamResult<Vec<String>> {
        if self.is_streaming() {
            return Err(StreamError::AlreadyStreaming);
        }

        log::info!(
            "Resolving channels for stream '{}' (timeout: {}s)",
            self.config.session_name,
            self.config.resolve_timeout_secs
        );

        let timeout = self.config.resolve_timeout();
        let source = Arc::clone(&self.source);
        let resolve = task::spawn_blocking(move || source.lock().resolve_channel_names(timeout));

        let names = match tokio::time::timeout(timeout, resolve).await {
            Err(_) => {
                return Err(StreamError::SourceUnavailable(format!(
                    "no stream resolved within {}s",
                    self.config.resolve_timeout_secs
                )))
            }
            Ok(Err(e)) => return Err(StreamError::TaskJoin(e.to_string())),
            Ok(Ok(Err(e))) => return Err(StreamError::SourceUnavailable(e.to_string())),
            Ok(Ok(Ok(names))) if names.is_empty() => {
                return Err(StreamError::SourceUnavailable(
                    "source advertised no channels".to_string(),
                ))
            }
            Ok(Ok(Ok(names))) => names,
        };

        log::info!(
            "Stream '{}' connected: {} channels {:?}",
            self.config.session_name,
            names.len(),
            names
        );

        // A session may have started while the resolve was running
        let state = {
            let session = self.session.lock();
            if session
                .as_ref()
                .map_or(false, |s| !s.cancel_token.is_cancelled())
            {
                return Err(StreamError::AlreadyStreaming);
            }
            let state = IngestionState::Connected {
                channels: names.len(),
            };
            *self.channel_names.write() = Some(names.clone());
            *self.shared.state.write() = state.clone();
            state
        };
        self.shared.emit(IngestionEvent::StateChanged {
            session_name: self.shared.session_name.clone(),
            state,
        });

        Ok(names)
    }

    /// Start streaming into `store`
    ///
    /// Creates every advertised channel (and configured event channel) that
    /// is missing from the store, then spawns the background pull task on
    /// Tokio's blocking pool. Must be called from within a Tokio runtime.
    /// Fails with `AlreadyStreaming` if this loop, or any other loop, is
    /// already streaming into `store`. Returns the new session id.
    pub fn start(&self, store: Arc<ChannelStore<V>>) -> StreamResult<String> {
        let mut session = self.session.lock();
        if session
            .as_ref()
            .map_or(false, |s| !s.cancel_token.is_cancelled())
        {
            return Err(StreamError::AlreadyStreaming);
        }

        let names = self
            .channel_names
            .read()
            .clone()
            .ok_or(StreamError::NotConnected)?;

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| StreamError::Runtime(e.to_string()))?;

        let session_id = uuid::Uuid::new_v4().to_string();
        store.claim_ingestion(&session_id)?;

        let mut added = Vec::new();
        for name in names.iter().chain(self.config.event_channels.iter()) {
            match store.add_channel(name) {
                Ok(()) => added.push(name.clone()),
                Err(StreamError::DuplicateChannel(_)) => {}
                Err(e) => {
                    store.release_ingestion(&session_id);
                    return Err(e);
                }
            }
        }

        let cancel_token = CancellationToken::new();
        let counters = Arc::new(SessionCounters::default());

        // Written before the task exists so a failing task can end this session
        let state = IngestionState::Streaming {
            session_id: session_id.clone(),
            started_at: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
        };
        *self.shared.state.write() = state.clone();

        let worker = Worker {
            session_id: session_id.clone(),
            store: Arc::clone(&store),
            source: Arc::clone(&self.source),
            cancel_token: cancel_token.clone(),
            counters: Arc::clone(&counters),
            shared: Arc::clone(&self.shared),
            pull_timeout: self.config.pull_timeout(),
            max_consecutive_errors: self.config.max_consecutive_pull_errors,
        };
        let handle = runtime.spawn_blocking(move || worker.run());

        *session = Some(Session {
            id: session_id.clone(),
            cancel_token,
            handle: Some(handle),
            store,
            counters,
            started: Instant::now(),
        });
        drop(session);

        log::info!(
            "Stream '{}' started session {}",
            self.config.session_name,
            session_id
        );

        for channel in added {
            self.shared.emit(IngestionEvent::ChannelAdded { channel });
        }
        self.shared.emit(IngestionEvent::StateChanged {
            session_name: self.shared.session_name.clone(),
            state,
        });

        Ok(session_id)
    }

    /// Signal the background task to stop and return immediately
    ///
    /// The pull in flight completes and is appended before the task exits.
    /// The store is released at once, so another session may start on it
    /// while that last pull is still being appended.
    /// Calling this when nothing is streaming is a no-op.
    pub fn stop(&self) {
        let session_id = {
            let session = self.session.lock();
            let Some(session) = session.as_ref() else {
                return;
            };
            if session.cancel_token.is_cancelled() {
                return;
            }
            session.cancel_token.cancel();
            session.store.release_ingestion(&session.id);
            session.id.clone()
        };

        log::info!(
            "Stopping stream '{}' session {}",
            self.config.session_name,
            session_id
        );
        self.shared.end_session(&session_id, IngestionState::Stopped);
    }

    /// Stop and wait until the background task has exited
    pub async fn stop_and_wait(&self) -> StreamResult<()> {
        self.stop();

        let handle = self.session.lock().as_mut().and_then(|s| s.handle.take());
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|e| StreamError::TaskJoin(e.to_string()))?;
        }

        Ok(())
    }

    pub fn state(&self) -> IngestionState {
        self.shared.state.read().clone()
    }

    pub fn is_streaming(&self) -> bool {
        self.session
            .lock()
            .as_ref()
            .map_or(false, |s| !s.cancel_token.is_cancelled())
    }

    /// Channel names advertised by the source at the last successful connect
    pub fn channel_names(&self) -> Option<Vec<String>> {
        self.channel_names.read().clone()
    }

    /// Id of the current (or most recent) session
    pub fn session_id(&self) -> Option<String> {
        self.session.lock().as_ref().map(|s| s.id.clone())
    }

    /// Counters of the current (or most recent) session
    pub fn stats(&self) -> IngestionStats {
        self.session
            .lock()
            .as_ref()
            .map(|s| s.counters.snapshot(s.started))
            .unwrap_or_default()
    }

    /// Query every advertised channel in the store of the current (or most
    /// recent) session
    pub fn query_session(
        &self,
        start_time: Option<f64>,
        duration: Option<f64>,
    ) -> StreamResult<HashMap<String, StreamResult<Vec<Sample<V>>>>> {
        let store = self
            .session
            .lock()
            .as_ref()
            .map(|s| Arc::clone(&s.store))
            .ok_or(StreamError::NotConnected)?;
        let names = self.channel_names().ok_or(StreamError::NotConnected)?;

        Ok(store.query_multi(&names, start_time, duration))
    }
}

impl<V> Drop for IngestionLoop<V> {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().as_ref() {
            session.cancel_token.cancel();
            session.store.release_ingestion(&session.id);
        }
    }
}

/// Background half of a session, run on the blocking pool
struct Worker<V> {
    session_id: String,
    store: Arc<ChannelStore<V>>,
    source: SharedSource<V>,
    cancel_token: CancellationToken,
    counters: Arc<SessionCounters>,
    shared: Arc<Shared>,
    pull_timeout: Duration,
    max_consecutive_errors: u32,
}

impl<V: Clone + Send + Sync> Worker<V> {
    fn run(self) {
        let started = Instant::now();
        let mut consecutive_errors = 0u32;
        let mut failure = None;

        while !self.cancel_token.is_cancelled() {
            let pulled = self.source.lock().pull(self.pull_timeout);
            self.counters.total_pulls.fetch_add(1, Ordering::Relaxed);

            match pulled {
                Ok(Some(pulled)) => {
                    consecutive_errors = 0;
                    self.ingest(pulled);
                }
                Ok(None) => {
                    consecutive_errors = 0;
                    self.counters.empty_pulls.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    consecutive_errors += 1;
                    self.counters.pull_errors.fetch_add(1, Ordering::Relaxed);
                    log::warn!(
                        "Pull failed in session {} ({} in a row): {}",
                        self.session_id,
                        consecutive_errors,
                        e
                    );
                    self.shared.emit(IngestionEvent::PullFailed { error: e.clone() });

                    if self.max_consecutive_errors > 0
                        && consecutive_errors >= self.max_consecutive_errors
                    {
                        failure = Some(format!(
                            "{} consecutive pull failures, last: {}",
                            consecutive_errors, e
                        ));
                        break;
                    }
                }
            }
        }

        self.cancel_token.cancel();
        self.store.release_ingestion(&self.session_id);

        if let Some(message) = failure {
            log::error!("Session {} ended: {}", self.session_id, message);
            self.shared
                .end_session(&self.session_id, IngestionState::Failed { message });
        }

        let stats = self.counters.snapshot(started);
        log::info!(
            "Session {} finished: {} pulls, {} samples appended, {} dropped",
            self.session_id,
            stats.total_pulls,
            stats.samples_appended,
            stats.samples_dropped
        );
        self.shared.emit(IngestionEvent::SessionEnded {
            session_id: self.session_id.clone(),
            stats,
        });
    }

    fn ingest(&self, pulled: PulledSamples<V>) {
        let timestamp = pulled.corrected_timestamp();
        log::debug!(
            "Session {}: {} values at {}",
            self.session_id,
            pulled.values.len(),
            timestamp
        );

        for (channel, value) in pulled.values {
            match self.store.append(&channel, Sample::new(timestamp, value)) {
                Ok(()) => {
                    self.counters.samples_appended.fetch_add(1, Ordering::Relaxed);
                }
                Err(error) => {
                    // A channel removed mid-stream must not halt the others
                    self.counters.samples_dropped.fetch_add(1, Ordering::Relaxed);
                    log::warn!("Dropped sample for channel {}: {}", channel, error);
                    self.shared.emit(IngestionEvent::SampleDropped {
                        channel,
                        timestamp,
                        error,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::source::ReplaySource;

    fn fast_config() -> IngestionConfig {
        IngestionConfig {
            resolve_timeout_secs: 0.5,
            pull_timeout_secs: 0.01,
            ..Default::default()
        }
    }

    #[test]
    fn test_new_loop_is_idle() {
        let ingest: IngestionLoop = IngestionLoop::new(ReplaySource::new(["C1"]));
        assert_eq!(ingest.state(), IngestionState::Idle);
        assert!(!ingest.is_streaming());
        assert_eq!(ingest.channel_names(), None);
        assert_eq!(ingest.session_id(), None);
        assert_eq!(ingest.stats(), IngestionStats::default());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = IngestionConfig {
            pull_timeout_secs: -1.0,
            ..Default::default()
        };
        let result: StreamResult<IngestionLoop> =
            IngestionLoop::with_config(ReplaySource::new(["C1"]), config);
        assert!(matches!(result, Err(StreamError::InvalidConfig(_))));
    }

    #[test]
    fn test_stop_without_session_is_noop() {
        let ingest: IngestionLoop = IngestionLoop::new(ReplaySource::new(["C1"]));
        ingest.stop();
        ingest.stop();
        assert_eq!(ingest.state(), IngestionState::Idle);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_start_requires_connect() {
        let ingest: IngestionLoop =
            IngestionLoop::with_config(ReplaySource::new(["C1"]), fast_config()).unwrap();
        let store = Arc::new(ChannelStore::new());
        assert_eq!(ingest.start(store), Err(StreamError::NotConnected));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_connect_resolves_names() {
        let ingest: IngestionLoop =
            IngestionLoop::with_config(ReplaySource::new(["TP9", "AF7"]), fast_config()).unwrap();
        let names = ingest.connect().await.unwrap();
        assert_eq!(names, vec!["TP9".to_string(), "AF7".to_string()]);
        assert_eq!(ingest.state(), IngestionState::Connected { channels: 2 });
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_connect_unavailable_source() {
        let ingest: IngestionLoop =
            IngestionLoop::with_config(ReplaySource::unavailable(), fast_config()).unwrap();
        let err = ingest.connect().await.unwrap_err();
        assert!(matches!(err, StreamError::SourceUnavailable(_)));
        assert_eq!(ingest.state(), IngestionState::Idle);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_connect_times_out() {
        let source = ReplaySource::<f64>::new(["C1"]).with_resolve_delay(Duration::from_millis(500));
        let config = IngestionConfig {
            resolve_timeout_secs: 0.05,
            ..fast_config()
        };
        let ingest = IngestionLoop::with_config(source, config).unwrap();
        let err = ingest.connect().await.unwrap_err();
        assert!(matches!(err, StreamError::SourceUnavailable(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_start_twice_fails() {
        let ingest: IngestionLoop =
            IngestionLoop::with_config(ReplaySource::new(["C1"]), fast_config()).unwrap();
        ingest.connect().await.unwrap();

        let store = Arc::new(ChannelStore::new());
        ingest.start(Arc::clone(&store)).unwrap();
        assert!(ingest.is_streaming());
        assert_eq!(
            ingest.start(Arc::clone(&store)),
            Err(StreamError::AlreadyStreaming)
        );
        assert_eq!(ingest.connect().await, Err(StreamError::AlreadyStreaming));

        ingest.stop_and_wait().await.unwrap();
        assert!(!ingest.is_streaming());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_session_holds_store_until_stopped() {
        let ingest: IngestionLoop =
            IngestionLoop::with_config(ReplaySource::new(["C1"]), fast_config()).unwrap();
        ingest.connect().await.unwrap();

        let store = Arc::new(ChannelStore::new());
        let session_id = ingest.start(Arc::clone(&store)).unwrap();
        assert_eq!(store.active_ingestion(), Some(session_id));

        ingest.stop();
        assert_eq!(store.active_ingestion(), None);
        ingest.stop_and_wait().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_store_released_when_loop_dropped() {
        let store = Arc::new(ChannelStore::new());
        {
            let ingest: IngestionLoop =
                IngestionLoop::with_config(ReplaySource::new(["C1"]), fast_config()).unwrap();
            ingest.connect().await.unwrap();
            ingest.start(Arc::clone(&store)).unwrap();
        }
        assert_eq!(store.active_ingestion(), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_connect_finishing_after_start_is_rejected() {
        let source = ReplaySource::<f64>::new(["C1"]).with_resolve_delay(Duration::from_millis(100));
        let config = IngestionConfig {
            resolve_timeout_secs: 1.0,
            ..fast_config()
        };
        let ingest = Arc::new(IngestionLoop::with_config(source, config).unwrap());
        ingest.connect().await.unwrap();

        let pending = {
            let ingest = Arc::clone(&ingest);
            tokio::spawn(async move { ingest.connect().await })
        };
        // Past the streaming check, still resolving
        tokio::time::sleep(Duration::from_millis(20)).await;

        let session_id = ingest.start(Arc::new(ChannelStore::new())).unwrap();
        assert_eq!(pending.await.unwrap(), Err(StreamError::AlreadyStreaming));
        assert!(matches!(
            ingest.state(),
            IngestionState::Streaming { session_id: id, .. } if id == session_id
        ));

        ingest.stop_and_wait().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_callback_may_call_back_into_loop() {
        use std::sync::atomic::AtomicUsize;

        let ingest: Arc<IngestionLoop> = Arc::new(
            IngestionLoop::with_config(ReplaySource::new(["C1"]), fast_config()).unwrap(),
        );
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let weak = Arc::downgrade(&ingest);
            let calls = Arc::clone(&calls);
            ingest.set_event_callback(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                if let Some(ingest) = weak.upgrade() {
                    assert!(!ingest.is_streaming());
                    // Replaces this callback while it is running
                    ingest.set_event_callback(|_| {});
                }
            });
        }

        tokio::time::timeout(Duration::from_secs(2), ingest.connect())
            .await
            .expect("connect blocked on its own callback")
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        ingest.start(Arc::new(ChannelStore::new())).unwrap();
        ingest.stop_and_wait().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_event_channels_created() {
        let config = IngestionConfig {
            event_channels: vec!["P300".to_string()],
            ..fast_config()
        };
        let ingest: IngestionLoop =
            IngestionLoop::with_config(ReplaySource::new(["TP9"]), config).unwrap();
        ingest.connect().await.unwrap();

        let store = Arc::new(ChannelStore::new());
        ingest.start(Arc::clone(&store)).unwrap();
        assert_eq!(store.list_channels(), vec!["TP9", "P300"]);

        // Markers can be written next to the streamed data
        store.append("P300", Sample::new(1.0, 1.0)).unwrap();
        ingest.stop_and_wait().await.unwrap();
        assert!(store.has_data("P300"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_repeated_pull_failures_end_session() {
        let source = ReplaySource::new(["C1"])
            .with_frame(1.0, 0.0, vec![1.0])
            .with_error("inlet lost")
            .with_error("inlet lost");
        let config = IngestionConfig {
            max_consecutive_pull_errors: 2,
            ..fast_config()
        };
        let ingest: IngestionLoop = IngestionLoop::with_config(source, config).unwrap();
        ingest.connect().await.unwrap();

        let store = Arc::new(ChannelStore::new());
        ingest.start(Arc::clone(&store)).unwrap();

        let handle = ingest.session.lock().as_mut().and_then(|s| s.handle.take());
        handle.unwrap().await.unwrap();

        assert!(!ingest.is_streaming());
        assert!(matches!(ingest.state(), IngestionState::Failed { .. }));
        let stats = ingest.stats();
        assert_eq!(stats.pull_errors, 2);
        assert_eq!(stats.samples_appended, 1);
        assert_eq!(store.query("C1", None, None).unwrap().len(), 1);
    }
}
