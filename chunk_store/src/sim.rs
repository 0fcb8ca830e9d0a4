//! Latency injection for the in-memory backend.
//!
//! The in-memory backend awaits [`LatencySimulator::wait`] before every
//! observable step — before a write becomes visible and before each chunk is
//! handed to a subscription — so tests can shake out ordering and
//! cancellation behavior that a zero-latency store would never exhibit.

use async_trait::async_trait;
use rand::{thread_rng, Rng};
use std::{fmt::Debug, time::Duration};

/// Injection point for artificial latency.
#[async_trait]
pub trait LatencySimulator: Send + Sync + Debug + 'static {
    /// Awaited before every observable step of the backend.
    async fn wait(&self);
}

/// The default simulator: no delay at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLatency;

#[async_trait]
impl LatencySimulator for NoLatency {
    async fn wait(&self) {}
}

/// A fixed delay before every step.
#[derive(Debug, Clone, Copy)]
pub struct FixedLatency(Duration);

impl FixedLatency {
    /// Delay every step by `delay`.
    pub fn new(delay: Duration) -> Self {
        Self(delay)
    }
}

#[async_trait]
impl LatencySimulator for FixedLatency {
    async fn wait(&self) {
        tokio::time::sleep(self.0).await;
    }
}

/// A uniformly random delay in `[min, max)` before every step.
#[derive(Debug, Clone, Copy)]
pub struct RandomLatency {
    min: Duration,
    max: Duration,
}

impl RandomLatency {
    /// Delay every step by a fresh sample from `[min, max)`.
    pub fn new(min: Duration, max: Duration) -> Self {
        assert!(min < max, "empty latency range");
        Self { min, max }
    }
}

#[async_trait]
impl LatencySimulator for RandomLatency {
    async fn wait(&self) {
        let delay = thread_rng().gen_range(self.min..self.max);
        tokio::time::sleep(delay).await;
    }
}
