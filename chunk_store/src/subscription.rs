//! The push-based delivery protocol feeding chunk scans to consumers.

use async_trait::async_trait;
use data_types::Chunk;
use std::fmt::Debug;

use crate::core::ChunkStoreError;

/// Consumer of a chunk scan.
///
/// The producer invokes the callbacks strictly serially per instance:
/// [`on_start`](Self::on_start) exactly once, then zero or more
/// [`on_next`](Self::on_next) deliveries in the scan order, then exactly one
/// terminal callback — [`completed`](Self::completed) when the query was
/// exhausted, [`stopped`](Self::stopped) when the consumer declined to
/// continue (or nothing was delivered at all), or
/// [`on_error`](Self::on_error) when the scan, the codec, the consumer
/// itself, or cancellation failed the read.
///
/// The `first`/`last` argument is the chunk index for partition-scoped reads
/// and the global position for store-wide reads.
#[async_trait]
pub trait Subscription: Send + Debug {
    /// Invoked once, before any delivery, with the start of the scan.
    async fn on_start(&mut self, first: i64) -> Result<(), ChunkStoreError>;

    /// One chunk, payload already decoded. Return `false` to stop the scan.
    async fn on_next(&mut self, chunk: Chunk) -> Result<bool, ChunkStoreError>;

    /// The query was exhausted; `last` is the last key delivered.
    async fn completed(&mut self, last: i64);

    /// The scan stopped early — either the consumer returned `false` (then
    /// `last` is the key of the final delivery) or nothing matched at all
    /// (then `last` is the value passed to [`on_start`](Self::on_start)).
    async fn stopped(&mut self, last: i64);

    /// The scan failed; no further callbacks occur.
    async fn on_error(&mut self, last: i64, error: &ChunkStoreError);
}

/// Adapts a plain chunk handler to the [`Subscription`] lifecycle.
///
/// The handler's return value has [`on_next`](Subscription::on_next)
/// semantics: `false` stops the scan. Terminal callbacks are ignored.
pub struct LambdaSubscription<F>
where
    F: FnMut(Chunk) -> bool + Send,
{
    handler: F,
}

impl<F> LambdaSubscription<F>
where
    F: FnMut(Chunk) -> bool + Send,
{
    /// Wrap `handler`.
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

impl<F> Debug for LambdaSubscription<F>
where
    F: FnMut(Chunk) -> bool + Send,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LambdaSubscription").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F> Subscription for LambdaSubscription<F>
where
    F: FnMut(Chunk) -> bool + Send,
{
    async fn on_start(&mut self, _first: i64) -> Result<(), ChunkStoreError> {
        Ok(())
    }

    async fn on_next(&mut self, chunk: Chunk) -> Result<bool, ChunkStoreError> {
        Ok((self.handler)(chunk))
    }

    async fn completed(&mut self, _last: i64) {}

    async fn stopped(&mut self, _last: i64) {}

    async fn on_error(&mut self, _last: i64, _error: &ChunkStoreError) {}
}

/// The terminal event observed by a [`Recorder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    /// The producer exhausted the query.
    Completed(i64),
    /// The scan stopped before exhausting the query.
    Stopped(i64),
    /// The scan failed; the payload is the error kind observed.
    Errored(i64, crate::core::ChunkStoreErrorKind),
}

/// A subscription that records every callback, for assertions in tests and
/// for simple collect-style consumers.
#[derive(Debug, Default)]
pub struct Recorder {
    chunks: Vec<Chunk>,
    started_at: Option<i64>,
    terminal: Option<Terminal>,
    stop_after: Option<usize>,
}

impl Recorder {
    /// A recorder that consumes the whole scan.
    pub fn new() -> Self {
        Self::default()
    }

    /// A recorder that requests a stop after `n` deliveries.
    pub fn with_stop_after(n: usize) -> Self {
        Self {
            stop_after: Some(n),
            ..Self::default()
        }
    }

    /// The chunks delivered so far, in delivery order.
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Positions of the delivered chunks, in delivery order.
    pub fn positions(&self) -> Vec<i64> {
        self.chunks.iter().map(|c| c.position().get()).collect()
    }

    /// Indexes of the delivered chunks, in delivery order.
    pub fn indexes(&self) -> Vec<i64> {
        self.chunks.iter().map(|c| c.index().get()).collect()
    }

    /// The argument passed to `on_start`, if the scan started.
    pub fn started_at(&self) -> Option<i64> {
        self.started_at
    }

    /// The terminal event, if the scan terminated.
    pub fn terminal(&self) -> Option<Terminal> {
        self.terminal
    }
}

#[async_trait]
impl Subscription for Recorder {
    async fn on_start(&mut self, first: i64) -> Result<(), ChunkStoreError> {
        assert!(self.started_at.is_none(), "on_start invoked twice");
        self.started_at = Some(first);
        Ok(())
    }

    async fn on_next(&mut self, chunk: Chunk) -> Result<bool, ChunkStoreError> {
        assert!(
            self.started_at.is_some(),
            "on_next invoked before on_start"
        );
        assert!(self.terminal.is_none(), "on_next invoked after terminal");
        self.chunks.push(chunk);
        Ok(match self.stop_after {
            Some(n) => self.chunks.len() < n,
            None => true,
        })
    }

    async fn completed(&mut self, last: i64) {
        assert!(self.terminal.is_none(), "two terminal callbacks");
        self.terminal = Some(Terminal::Completed(last));
    }

    async fn stopped(&mut self, last: i64) {
        assert!(self.terminal.is_none(), "two terminal callbacks");
        self.terminal = Some(Terminal::Stopped(last));
    }

    async fn on_error(&mut self, last: i64, error: &ChunkStoreError) {
        assert!(self.terminal.is_none(), "two terminal callbacks");
        self.terminal = Some(Terminal::Errored(last, error.kind()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use data_types::{ChunkIndex, OperationId, PartitionId, Position};

    fn chunk(position: i64, index: i64) -> Chunk {
        Chunk::new(
            Position::new(position),
            PartitionId::from("p"),
            ChunkIndex::new(index),
            OperationId::from(format!("op-{position}")),
            Some(Bytes::from(format!("e{position}"))),
        )
    }

    #[tokio::test]
    async fn recorder_captures_lifecycle() {
        let mut recorder = Recorder::new();

        recorder.on_start(1).await.unwrap();
        assert!(recorder.on_next(chunk(1, 1)).await.unwrap());
        assert!(recorder.on_next(chunk(2, 2)).await.unwrap());
        recorder.completed(2).await;

        assert_eq!(recorder.started_at(), Some(1));
        assert_eq!(recorder.positions(), vec![1, 2]);
        assert_eq!(recorder.indexes(), vec![1, 2]);
        assert_eq!(recorder.terminal(), Some(Terminal::Completed(2)));
    }

    #[tokio::test]
    async fn recorder_requests_stop() {
        let mut recorder = Recorder::with_stop_after(2);

        recorder.on_start(1).await.unwrap();
        assert!(recorder.on_next(chunk(1, 1)).await.unwrap());
        assert!(!recorder.on_next(chunk(2, 2)).await.unwrap());
        recorder.stopped(2).await;

        assert_eq!(recorder.terminal(), Some(Terminal::Stopped(2)));
        assert_eq!(recorder.chunks().len(), 2);
    }

    #[tokio::test]
    async fn lambda_subscription_forwards_decision() {
        let mut seen = 0;
        {
            let mut sub = LambdaSubscription::new(|_chunk| {
                seen += 1;
                seen < 2
            });

            sub.on_start(1).await.unwrap();
            assert!(sub.on_next(chunk(1, 1)).await.unwrap());
            assert!(!sub.on_next(chunk(2, 2)).await.unwrap());
            sub.stopped(2).await;
        }
        assert_eq!(seen, 2);
    }
}
