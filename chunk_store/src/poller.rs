//! A polling client that feeds a subscription from repeated global scans.

use std::{
    sync::atomic::{AtomicI64, Ordering},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use data_types::{Chunk, Position};
use observability_deps::tracing::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::{
    sync::{Mutex as AsyncMutex, Notify},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    core::{ChunkStoreError, Persistence},
    subscription::Subscription,
};

/// What the polling loop does after an error reached the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorStrategy {
    /// Log and keep polling; for transient failures.
    Continue,
    /// Log and leave the loop; for fatal failures.
    Halt,
}

/// Tuning for [`PollingClient`].
#[derive(Debug, Clone)]
pub struct PollingClientConfig {
    /// Pause between polls that made no progress.
    pub poll_interval: Duration,

    /// Re-poll immediately after an iteration that delivered chunks.
    pub eager_repoll: bool,

    /// Error policy of the polling loop.
    pub error_strategy: ErrorStrategy,

    /// Position to resume from; the first poll scans from
    /// `start_position + 1`.
    pub start_position: Position,
}

impl Default for PollingClientConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            eager_repoll: true,
            error_strategy: ErrorStrategy::Continue,
            start_position: Position::new(0),
        }
    }
}

/// Lifecycle state of a [`PollingClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollingState {
    /// No polling loop is running.
    Stopped,
    /// The loop is polling.
    Running,
    /// A stop was requested; the loop is winding down.
    Stopping,
}

#[derive(Debug)]
struct PollerShared {
    /// Largest position delivered to the consumer so far.
    position: AtomicI64,
    state: Mutex<PollingState>,
    /// Pulsed after every poll iteration; drives the catch-up wait.
    poll_tick: Notify,
}

/// Drives a [`Subscription`] by repeatedly scanning the global stream from
/// the last delivered position.
///
/// The consumer observes one full subscription lifecycle per poll iteration.
/// Its tracked position only ever moves forward, so no delivered position is
/// ever scanned twice and none is silently skipped.
#[derive(Debug)]
pub struct PollingClient {
    store: Arc<dyn Persistence>,
    subscription: Arc<AsyncMutex<Box<dyn Subscription>>>,
    config: PollingClientConfig,
    shared: Arc<PollerShared>,
    cancel: Mutex<CancellationToken>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PollingClient {
    /// A client feeding `subscription` from `store`.
    pub fn new(
        store: Arc<dyn Persistence>,
        subscription: Box<dyn Subscription>,
        config: PollingClientConfig,
    ) -> Self {
        let shared = Arc::new(PollerShared {
            position: AtomicI64::new(config.start_position.get()),
            state: Mutex::new(PollingState::Stopped),
            poll_tick: Notify::new(),
        });
        Self {
            store,
            subscription: Arc::new(AsyncMutex::new(subscription)),
            config,
            shared,
            cancel: Mutex::new(CancellationToken::new()),
            worker: Mutex::new(None),
        }
    }

    /// Largest position delivered to the consumer so far.
    pub fn position(&self) -> Position {
        Position::new(self.shared.position.load(Ordering::SeqCst))
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PollingState {
        *self.shared.state.lock()
    }

    /// Start the polling loop. Idempotent; a no-op when already running.
    pub fn start(&self) {
        {
            let mut state = self.shared.state.lock();
            if *state != PollingState::Stopped {
                return;
            }
            *state = PollingState::Running;
        }

        let cancel = CancellationToken::new();
        *self.cancel.lock() = cancel.clone();

        let store = Arc::clone(&self.store);
        let subscription = Arc::clone(&self.subscription);
        let shared = Arc::clone(&self.shared);
        let config = self.config.clone();

        let handle = tokio::spawn(async move {
            info!(
                position = shared.position.load(Ordering::SeqCst),
                "polling client started"
            );
            loop {
                if cancel.is_cancelled() {
                    break;
                }

                let step = poll_iteration(&store, &subscription, &shared, &config, &cancel).await;
                shared.poll_tick.notify_waiters();

                match step {
                    PollStep::Halt => {
                        error!("polling client halting after fatal error");
                        break;
                    }
                    PollStep::Progress if config.eager_repoll => continue,
                    _ => {
                        tokio::select! {
                            _ = tokio::time::sleep(config.poll_interval) => {}
                            _ = cancel.cancelled() => {}
                        }
                    }
                }
            }
            *shared.state.lock() = PollingState::Stopped;
            info!(
                position = shared.position.load(Ordering::SeqCst),
                "polling client stopped"
            );
        });
        *self.worker.lock() = Some(handle);
    }

    /// Request a stop and wait until the loop has exited.
    pub async fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            if *state == PollingState::Running {
                *state = PollingState::Stopping;
            }
        }
        self.cancel.lock().cancel();

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(%e, "polling worker did not exit cleanly");
            }
        }
        *self.shared.state.lock() = PollingState::Stopped;
    }

    /// Run a single poll iteration, e.g. to drive the client manually.
    pub async fn poll_once(&self) {
        let cancel = CancellationToken::new();
        poll_iteration(
            &self.store,
            &self.subscription,
            &self.shared,
            &self.config,
            &cancel,
        )
        .await;
        self.shared.poll_tick.notify_waiters();
    }

    /// Wait until this client has seen everything the store currently has,
    /// i.e. until `position() >= read_last_position()`.
    ///
    /// Progress requires the loop to be running (or someone calling
    /// [`poll_once`](Self::poll_once)).
    pub async fn wait_until_caught_up(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(), ChunkStoreError> {
        loop {
            let target = self.store.read_last_position(cancel).await?;
            if self.position() >= target {
                return Ok(());
            }

            let tick = self.shared.poll_tick.notified();
            // the tick may have fired between the check and the registration
            if self.position() >= target {
                return Ok(());
            }
            tokio::select! {
                _ = tick => {}
                _ = cancel.cancelled() => return Err(ChunkStoreError::cancelled()),
            }
        }
    }
}

enum PollStep {
    Progress,
    Idle,
    Halt,
}

async fn poll_iteration(
    store: &Arc<dyn Persistence>,
    subscription: &Arc<AsyncMutex<Box<dyn Subscription>>>,
    shared: &Arc<PollerShared>,
    config: &PollingClientConfig,
    cancel: &CancellationToken,
) -> PollStep {
    let from = Position::new(shared.position.load(Ordering::SeqCst) + 1);

    let mut guard = subscription.lock().await;
    let mut tracker = TrackingSubscription {
        inner: guard.as_mut(),
        highest: None,
        errored: false,
    };

    let result = store.read_all(from, u64::MAX, &mut tracker, cancel).await;
    let highest = tracker.highest;
    let errored = tracker.errored;
    drop(guard);

    if let Err(e) = result {
        // the backend rejected the scan outright
        warn!(%e, from = from.get(), "poll iteration failed");
        return match config.error_strategy {
            ErrorStrategy::Halt => PollStep::Halt,
            ErrorStrategy::Continue => PollStep::Idle,
        };
    }

    if let Some(highest) = highest {
        // an empty poll leaves the position at `from - 1`, which is where it
        // already is; progress only ever moves it forward
        let previous = shared.position.fetch_max(highest, Ordering::SeqCst);
        debug!(from = previous, to = highest, "poll advanced");
    }

    if errored {
        match config.error_strategy {
            ErrorStrategy::Halt => PollStep::Halt,
            ErrorStrategy::Continue => PollStep::Idle,
        }
    } else if highest.is_some() {
        PollStep::Progress
    } else {
        PollStep::Idle
    }
}

/// Forwards every callback to the consumer while recording the highest
/// delivered position and whether the scan errored.
#[derive(Debug)]
struct TrackingSubscription<'a> {
    inner: &'a mut dyn Subscription,
    highest: Option<i64>,
    errored: bool,
}

#[async_trait]
impl Subscription for TrackingSubscription<'_> {
    async fn on_start(&mut self, first: i64) -> Result<(), ChunkStoreError> {
        self.inner.on_start(first).await
    }

    async fn on_next(&mut self, chunk: Chunk) -> Result<bool, ChunkStoreError> {
        let position = chunk.position().get();
        let decision = self.inner.on_next(chunk).await?;
        self.highest = Some(self.highest.map_or(position, |h| h.max(position)));
        Ok(decision)
    }

    async fn completed(&mut self, last: i64) {
        self.inner.completed(last).await
    }

    async fn stopped(&mut self, last: i64) {
        self.inner.stopped(last).await
    }

    async fn on_error(&mut self, last: i64, error: &ChunkStoreError) {
        self.errored = true;
        self.inner.on_error(last, error).await
    }
}
