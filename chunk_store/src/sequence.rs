//! Allocation of the global, strictly monotonic position sequence.

use async_trait::async_trait;
use data_types::Position;
use observability_deps::tracing::debug;
use parking_lot::Mutex;
use std::{
    fmt::Debug,
    sync::atomic::{AtomicI64, Ordering},
    sync::Arc,
};

use crate::core::ChunkStoreError;

/// Source of globally unique, monotonically increasing positions.
///
/// An allocator instance never hands out the same id twice. Whether two
/// *instances* can collide depends on the implementation: the local allocator
/// is only safe within one process, the shared allocator is safe for every
/// writer drawing from the same counter document.
#[async_trait]
pub trait SequenceAllocator: Send + Sync + Debug + 'static {
    /// Reserve `count` contiguous ids and return the last of them.
    ///
    /// The caller owns the whole range `[last - count + 1, last]`.
    async fn next_ids(&self, count: u64) -> Result<Position, ChunkStoreError>;

    /// Raise the counter to at least `max_persisted`.
    ///
    /// Called when a position collision reveals that this counter is stale
    /// (another writer advanced the store behind our back).
    async fn reload(&self, max_persisted: Position);
}

fn check_count(count: u64) -> Result<i64, ChunkStoreError> {
    if count == 0 {
        return Err(ChunkStoreError::invalid_input(
            "cannot reserve an empty id range",
        ));
    }
    i64::try_from(count).map_err(ChunkStoreError::invalid_input)
}

/// Process-local allocator: an atomic counter primed from the store's last
/// persisted position at open.
///
/// Not safe across processes; the operator opts into this mode knowing only
/// one process writes.
#[derive(Debug)]
pub struct LocalSequence {
    last: AtomicI64,
}

impl LocalSequence {
    /// Create an allocator that will hand out ids starting right after
    /// `last_persisted`.
    pub fn new(last_persisted: Position) -> Self {
        Self {
            last: AtomicI64::new(last_persisted.get()),
        }
    }
}

#[async_trait]
impl SequenceAllocator for LocalSequence {
    async fn next_ids(&self, count: u64) -> Result<Position, ChunkStoreError> {
        let count = check_count(count)?;
        let previous = self.last.fetch_add(count, Ordering::SeqCst);
        Ok(Position::new(previous + count))
    }

    async fn reload(&self, max_persisted: Position) {
        let raised = self.last.fetch_max(max_persisted.get(), Ordering::SeqCst);
        debug!(
            from = raised,
            to = max_persisted.get(),
            "reloaded local sequence"
        );
    }
}

/// The single named row backing a [`SharedSequence`].
///
/// Mutations have find-and-modify semantics: one lock guards the value, every
/// increment is atomic with its read.
#[derive(Debug)]
pub struct CounterDocument {
    name: String,
    last_value: Mutex<i64>,
}

impl CounterDocument {
    /// Create a counter starting at 0.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            last_value: Mutex::new(0),
        }
    }

    /// The configured counter name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The current value.
    pub fn last_value(&self) -> i64 {
        *self.last_value.lock()
    }

    fn increment_and_get(&self, count: i64) -> i64 {
        let mut value = self.last_value.lock();
        *value += count;
        *value
    }

    fn raise_to(&self, floor: i64) {
        let mut value = self.last_value.lock();
        if *value < floor {
            *value = floor;
        }
    }
}

/// Allocator drawing from a [`CounterDocument`] shared by several store
/// instances, emulating the shared-sequence mode where every writer
/// increments one strongly consistent counter.
#[derive(Debug, Clone)]
pub struct SharedSequence {
    counter: Arc<CounterDocument>,
}

impl SharedSequence {
    /// Create an allocator over `counter`.
    pub fn new(counter: Arc<CounterDocument>) -> Self {
        Self { counter }
    }
}

#[async_trait]
impl SequenceAllocator for SharedSequence {
    async fn next_ids(&self, count: u64) -> Result<Position, ChunkStoreError> {
        let count = check_count(count)?;
        Ok(Position::new(self.counter.increment_and_get(count)))
    }

    async fn reload(&self, max_persisted: Position) {
        self.counter.raise_to(max_persisted.get());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ChunkStoreErrorKind;

    #[tokio::test]
    async fn local_sequence_hands_out_contiguous_ranges() {
        let seq = LocalSequence::new(Position::new(0));

        assert_eq!(seq.next_ids(1).await.unwrap(), Position::new(1));
        assert_eq!(seq.next_ids(3).await.unwrap(), Position::new(4));
        assert_eq!(seq.next_ids(1).await.unwrap(), Position::new(5));
    }

    #[tokio::test]
    async fn local_sequence_primed_from_store() {
        let seq = LocalSequence::new(Position::new(41));
        assert_eq!(seq.next_ids(1).await.unwrap(), Position::new(42));
    }

    #[tokio::test]
    async fn local_sequence_reload_never_goes_backwards() {
        let seq = LocalSequence::new(Position::new(10));

        seq.reload(Position::new(4)).await;
        assert_eq!(seq.next_ids(1).await.unwrap(), Position::new(11));

        seq.reload(Position::new(100)).await;
        assert_eq!(seq.next_ids(1).await.unwrap(), Position::new(101));
    }

    #[tokio::test]
    async fn zero_count_is_rejected() {
        let seq = LocalSequence::new(Position::new(0));
        let err = seq.next_ids(0).await.unwrap_err();
        assert_eq!(err.kind(), ChunkStoreErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn shared_sequence_interleaves_writers() {
        let counter = Arc::new(CounterDocument::new("chunks"));
        let a = SharedSequence::new(Arc::clone(&counter));
        let b = SharedSequence::new(Arc::clone(&counter));

        assert_eq!(a.next_ids(1).await.unwrap(), Position::new(1));
        assert_eq!(b.next_ids(2).await.unwrap(), Position::new(3));
        assert_eq!(a.next_ids(1).await.unwrap(), Position::new(4));
        assert_eq!(counter.last_value(), 4);
        assert_eq!(counter.name(), "chunks");
    }

    #[tokio::test]
    async fn concurrent_allocation_is_unique() {
        let seq = Arc::new(LocalSequence::new(Position::new(0)));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let seq = Arc::clone(&seq);
                tokio::spawn(async move {
                    let mut ids = Vec::new();
                    for _ in 0..100 {
                        ids.push(seq.next_ids(1).await.unwrap().get());
                    }
                    ids
                })
            })
            .collect();

        let mut all = Vec::new();
        for task in tasks {
            all.extend(task.await.unwrap());
        }

        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 800);
        assert_eq!(*all.first().unwrap(), 1);
        assert_eq!(*all.last().unwrap(), 800);
    }
}
