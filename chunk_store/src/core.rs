//! The backend-neutral persistence contract and its conformance test suite.

use std::fmt::{Display, Formatter};
use std::{fmt::Debug, io::Error};

use async_trait::async_trait;
use bytes::Bytes;
use data_types::{Chunk, ChunkIndex, OperationId, PartitionId, Position};
use tokio_util::sync::CancellationToken;

use crate::subscription::Subscription;

/// Generic boxed error type that is used in this crate.
///
/// The dynamic boxing makes it easier to deal with errors from different
/// backends and from consumer callbacks.
#[derive(Debug)]
pub struct ChunkStoreError {
    inner: Box<dyn std::error::Error + Sync + Send>,
    kind: ChunkStoreErrorKind,
}

impl ChunkStoreError {
    /// Wrap `e` with the given kind.
    pub fn new(
        kind: ChunkStoreErrorKind,
        e: impl Into<Box<dyn std::error::Error + Sync + Send>>,
    ) -> Self {
        Self {
            inner: e.into(),
            kind,
        }
    }

    /// The caller handed the operation something unusable.
    pub fn invalid_input(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(ChunkStoreErrorKind::InvalidInput, e)
    }

    /// The operation encountered stored data it cannot understand.
    pub fn invalid_data(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(ChunkStoreErrorKind::InvalidData, e)
    }

    /// The backend was constructed with an unusable configuration.
    pub fn invalid_config(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(ChunkStoreErrorKind::InvalidConfig, e)
    }

    /// The operation observed its cancellation token.
    pub fn cancelled() -> Self {
        Self::new(ChunkStoreErrorKind::Cancelled, "operation cancelled")
    }

    /// A delete matched no live chunks.
    pub fn delete_target_not_found(partition_id: &PartitionId) -> Self {
        Self::new(
            ChunkStoreErrorKind::DeleteTargetNotFound,
            format!("no chunks to delete in partition {partition_id}"),
        )
    }

    /// The position-collision retry loop gave up.
    pub fn sequence_exhausted(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(ChunkStoreErrorKind::SequenceExhausted, e)
    }

    /// Wrap `e` as an unclassified failure.
    pub fn unknown(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(ChunkStoreErrorKind::Unknown, e)
    }

    /// Returns the kind of error this was
    pub fn kind(&self) -> ChunkStoreErrorKind {
        self.kind
    }

    /// Returns the inner error
    pub fn inner(&self) -> &dyn std::error::Error {
        self.inner.as_ref()
    }
}

impl Display for ChunkStoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ChunkStoreError({:?}): {}", self.kind, self.inner)
    }
}

impl std::error::Error for ChunkStoreError {}

impl From<std::io::Error> for ChunkStoreError {
    fn from(e: Error) -> Self {
        Self {
            inner: Box::new(e),
            kind: ChunkStoreErrorKind::IO,
        }
    }
}

impl From<String> for ChunkStoreError {
    fn from(e: String) -> Self {
        Self {
            inner: e.into(),
            kind: ChunkStoreErrorKind::Unknown,
        }
    }
}

impl From<&'static str> for ChunkStoreError {
    fn from(e: &'static str) -> Self {
        Self {
            inner: e.into(),
            kind: ChunkStoreErrorKind::Unknown,
        }
    }
}

/// Classification of a [`ChunkStoreError`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChunkStoreErrorKind {
    /// This operation failed for an unknown reason
    Unknown,

    /// This operation was provided with invalid input data
    InvalidInput,

    /// This operation encountered invalid data
    InvalidData,

    /// The backend was constructed with an unusable configuration
    InvalidConfig,

    /// A fatal IO error occurred - non-fatal errors should be retried internally
    IO,

    /// The operation observed its cancellation token
    Cancelled,

    /// A delete matched zero live chunks
    DeleteTargetNotFound,

    /// The sequence allocator failed to converge on a free position
    SequenceExhausted,
}

/// Result of a single write attempt.
///
/// Duplicates are not errors: the caller asked for something that is already
/// durable, and which of the two uniqueness keys collided determines whether
/// that is a success (idempotent replay) or a conflict the caller must
/// reconcile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The chunk was persisted; this is it.
    Persisted(Chunk),

    /// `(partition, operation id)` already exists: the operation was done
    /// before, nothing was written. Treat as already-done.
    DuplicateOperation,

    /// `(partition, index)` already exists: another writer holds this slot.
    DuplicateIndex {
        /// Partition the collision happened in.
        partition_id: PartitionId,
        /// The contested index.
        index: ChunkIndex,
    },
}

impl WriteOutcome {
    /// The persisted chunk, if this outcome carries one.
    pub fn chunk(&self) -> Option<&Chunk> {
        match self {
            Self::Persisted(chunk) => Some(chunk),
            _ => None,
        }
    }
}

/// One write of an [`append_batch`](Persistence::append_batch) call.
#[derive(Debug, Clone)]
pub struct WriteJob {
    /// Target partition.
    pub partition_id: PartitionId,
    /// Explicit index, or `None` to take the chunk's position as its index.
    pub index: Option<ChunkIndex>,
    /// Application payload; `None` persists a payload-less chunk.
    pub payload: Option<Bytes>,
    /// Idempotency token, or `None` to have a fresh unique one generated.
    pub operation_id: Option<OperationId>,
}

impl WriteJob {
    /// Assemble a job.
    pub fn new(
        partition_id: impl Into<PartitionId>,
        index: Option<ChunkIndex>,
        payload: Option<Bytes>,
        operation_id: Option<OperationId>,
    ) -> Self {
        Self {
            partition_id: partition_id.into(),
            index,
            payload,
            operation_id,
        }
    }
}

/// The contract every backend satisfies.
///
/// All operations are asynchronous and observe their [`CancellationToken`]
/// between round-trips and between chunk deliveries. Subscription-driven
/// reads surface cancellation through [`Subscription::on_error`] with a
/// [`Cancelled`](ChunkStoreErrorKind::Cancelled)-kind error; direct-result
/// operations return it as an `Err`.
///
/// `limit` arguments bound the number of chunks a scan delivers and are part
/// of the query: a scan that ran into its limit terminates with
/// [`Subscription::completed`].
#[async_trait]
pub trait Persistence: Send + Sync + Debug + 'static {
    /// Whether this backend reserves the position of a failed write with an
    /// empty filler chunk. Backends answering `false` leak a position on
    /// append conflicts and their global sequence is not dense.
    fn supports_fillers(&self) -> bool;

    /// Deliver the chunks of `partition_id` with index in
    /// `[from_index_inclusive, to_index_inclusive]`, ascending.
    async fn read_forward(
        &self,
        partition_id: &PartitionId,
        from_index_inclusive: ChunkIndex,
        to_index_inclusive: ChunkIndex,
        limit: u64,
        subscription: &mut dyn Subscription,
        cancel: &CancellationToken,
    ) -> Result<(), ChunkStoreError>;

    /// Deliver the chunks of `partition_id` with index in
    /// `[to_index_inclusive, from_index_inclusive]`, descending from
    /// `from_index_inclusive`.
    async fn read_backward(
        &self,
        partition_id: &PartitionId,
        from_index_inclusive: ChunkIndex,
        to_index_inclusive: ChunkIndex,
        limit: u64,
        subscription: &mut dyn Subscription,
        cancel: &CancellationToken,
    ) -> Result<(), ChunkStoreError>;

    /// The live chunk with the largest index `<= from_index_inclusive`, if
    /// any.
    async fn read_single_backward(
        &self,
        partition_id: &PartitionId,
        from_index_inclusive: ChunkIndex,
        cancel: &CancellationToken,
    ) -> Result<Option<Chunk>, ChunkStoreError>;

    /// Deliver chunks of every partition with position `>=
    /// from_position_inclusive`, position-ascending.
    ///
    /// Fillers are delivered (consumers filter by partition id); logically
    /// deleted chunks are not.
    async fn read_all(
        &self,
        from_position_inclusive: Position,
        limit: u64,
        subscription: &mut dyn Subscription,
        cancel: &CancellationToken,
    ) -> Result<(), ChunkStoreError>;

    /// The largest persisted position, fillers included; 0 when the store is
    /// empty.
    async fn read_last_position(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Position, ChunkStoreError>;

    /// The unique live chunk bearing `operation_id` in `partition_id`, if
    /// any.
    async fn read_by_operation_id(
        &self,
        partition_id: &PartitionId,
        operation_id: &OperationId,
        cancel: &CancellationToken,
    ) -> Result<Option<Chunk>, ChunkStoreError>;

    /// Deliver every live chunk bearing `operation_id` across all
    /// partitions, position-ascending.
    async fn read_all_by_operation_id(
        &self,
        operation_id: &OperationId,
        subscription: &mut dyn Subscription,
        cancel: &CancellationToken,
    ) -> Result<(), ChunkStoreError>;

    /// Persist one chunk.
    ///
    /// `index: None` requests auto-assignment (the chunk's position becomes
    /// its index); an explicit index must be `>= 0`. `operation_id: None`
    /// gets a fresh unique token. On a uniqueness conflict the allocated
    /// position is reserved with an empty filler (backends with
    /// [`supports_fillers`](Self::supports_fillers)) and the duplicate is
    /// reported through the returned [`WriteOutcome`].
    async fn append(
        &self,
        partition_id: &PartitionId,
        index: Option<ChunkIndex>,
        payload: Option<Bytes>,
        operation_id: Option<OperationId>,
        cancel: &CancellationToken,
    ) -> Result<WriteOutcome, ChunkStoreError>;

    /// Persist many chunks with one allocator round-trip and one bulk
    /// insert.
    ///
    /// The outcome at position `i` belongs to `jobs[i]`. Duplicate keys are
    /// reported per job and do NOT write fillers — reconciling the resulting
    /// gap is the batch caller's concern. Any other failure is returned as
    /// `Err` and leaves every job unreported.
    async fn append_batch(
        &self,
        jobs: Vec<WriteJob>,
        cancel: &CancellationToken,
    ) -> Result<Vec<WriteOutcome>, ChunkStoreError>;

    /// Mark every live chunk of `partition_id` with index in
    /// `[from_index_inclusive, to_index_inclusive]` as deleted.
    ///
    /// Deleted chunks vanish from every read path but keep their position
    /// and their uniqueness keys: positions are never reused and the index
    /// cannot be written again.
    async fn delete(
        &self,
        partition_id: &PartitionId,
        from_index_inclusive: ChunkIndex,
        to_index_inclusive: ChunkIndex,
        cancel: &CancellationToken,
    ) -> Result<(), ChunkStoreError>;
}

pub mod test_utils {
    //! Generic tests for all persistence backend implementations.

    use super::*;
    use crate::subscription::{Recorder, Terminal};
    use futures::stream::{FuturesUnordered, StreamExt};
    use std::sync::Arc;

    /// Adapter to make a concrete backend work w/ [`perform_generic_tests`].
    #[async_trait]
    pub trait TestAdapter: Send + Sync {
        /// The backend type under test.
        type Store: Persistence;

        /// Create a fresh, empty store.
        ///
        /// This will be called many times during the test suite. Each
        /// resulting store must represent an isolated environment.
        async fn new_store(&self) -> Self::Store;
    }

    /// Generic test suite that must be passed by all proper backend
    /// implementations.
    ///
    /// Note that you might need more tests on top of this to assert specific
    /// implementation behaviors, edge cases, and error handling.
    pub async fn perform_generic_tests<T>(adapter: T)
    where
        T: TestAdapter,
    {
        test_basic_append_and_read(&adapter).await;
        test_auto_and_explicit_index(&adapter).await;
        test_negative_index_rejected(&adapter).await;
        test_operation_idempotency(&adapter).await;
        test_index_collision_reserves_position(&adapter).await;
        test_position_density(&adapter).await;
        test_read_backward(&adapter).await;
        test_read_single_backward(&adapter).await;
        test_read_by_operation_id(&adapter).await;
        test_read_all_by_operation_id(&adapter).await;
        test_early_stop(&adapter).await;
        test_empty_read_stops_at_initial(&adapter).await;
        test_limit_completes_scan(&adapter).await;
        test_batch_with_duplicates(&adapter).await;
        test_batch_intra_batch_duplicate(&adapter).await;
        test_delete_range(&adapter).await;
        test_delete_missing_target(&adapter).await;
        test_reserved_partition_rejected(&adapter).await;
        test_consumer_error_routes_to_on_error(&adapter).await;
        test_cancellation_before_scan(&adapter).await;
        test_concurrent_appends_stay_dense(&adapter).await;
    }

    /// A fresh token, never cancelled.
    pub fn token() -> CancellationToken {
        CancellationToken::new()
    }

    /// Append one event and unwrap the persisted chunk.
    pub async fn append_event<S>(
        store: &S,
        partition: &str,
        index: Option<i64>,
        payload: &str,
        operation: Option<&str>,
    ) -> Chunk
    where
        S: Persistence,
    {
        let outcome = store
            .append(
                &PartitionId::from(partition),
                index.map(ChunkIndex::new),
                Some(Bytes::from(payload.to_string())),
                operation.map(OperationId::from),
                &token(),
            )
            .await
            .unwrap();

        expect_persisted(outcome)
    }

    /// Unwrap [`WriteOutcome::Persisted`], panicking on duplicates.
    pub fn expect_persisted(outcome: WriteOutcome) -> Chunk {
        match outcome {
            WriteOutcome::Persisted(chunk) => chunk,
            other => panic!("expected a persisted chunk, got {other:?}"),
        }
    }

    async fn read_forward_all<S>(store: &S, partition: &str) -> Recorder
    where
        S: Persistence,
    {
        let mut recorder = Recorder::new();
        store
            .read_forward(
                &PartitionId::from(partition),
                ChunkIndex::new(1),
                ChunkIndex::MAX,
                u64::MAX,
                &mut recorder,
                &token(),
            )
            .await
            .unwrap();
        recorder
    }

    async fn test_basic_append_and_read<T>(adapter: &T)
    where
        T: TestAdapter,
    {
        let store = adapter.new_store().await;

        let c1 = append_event(&store, "acct-1", None, "e1", Some("A")).await;
        let c2 = append_event(&store, "acct-1", None, "e2", Some("B")).await;
        let c3 = append_event(&store, "acct-1", None, "e3", Some("C")).await;

        assert_eq!(c1.position(), Position::new(1));
        assert_eq!(c2.position(), Position::new(2));
        assert_eq!(c3.position(), Position::new(3));
        // auto-assignment takes the position as the index
        assert_eq!(c1.index(), ChunkIndex::new(1));
        assert_eq!(c3.index(), ChunkIndex::new(3));
        assert_eq!(c1.payload().unwrap().as_ref(), b"e1");

        let recorder = read_forward_all(&store, "acct-1").await;
        assert_eq!(recorder.started_at(), Some(1));
        assert_eq!(recorder.indexes(), vec![1, 2, 3]);
        assert_eq!(recorder.positions(), vec![1, 2, 3]);
        assert_eq!(recorder.terminal(), Some(Terminal::Completed(3)));
    }

    async fn test_auto_and_explicit_index<T>(adapter: &T)
    where
        T: TestAdapter,
    {
        let store = adapter.new_store().await;

        let explicit = append_event(&store, "s", Some(5), "x", None).await;
        assert_eq!(explicit.position(), Position::new(1));
        assert_eq!(explicit.index(), ChunkIndex::new(5));

        let auto = append_event(&store, "s", None, "y", None).await;
        assert_eq!(auto.position(), Position::new(2));
        assert_eq!(auto.index(), ChunkIndex::new(2));

        // indexes within a partition are unique but not contiguous
        let recorder = read_forward_all(&store, "s").await;
        assert_eq!(recorder.indexes(), vec![2, 5]);
    }

    async fn test_negative_index_rejected<T>(adapter: &T)
    where
        T: TestAdapter,
    {
        let store = adapter.new_store().await;

        let err = store
            .append(
                &PartitionId::from("s"),
                Some(ChunkIndex::new(-1)),
                Some(Bytes::from_static(b"x")),
                None,
                &token(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ChunkStoreErrorKind::InvalidInput);
    }

    async fn test_operation_idempotency<T>(adapter: &T)
    where
        T: TestAdapter,
    {
        let store = adapter.new_store().await;

        let first = append_event(&store, "s", None, "x", Some("op1")).await;
        assert_eq!(first.position(), Position::new(1));

        // the replay is reported as a duplicate no matter what index or
        // payload it carries
        let outcome = store
            .append(
                &PartitionId::from("s"),
                Some(ChunkIndex::new(99)),
                Some(Bytes::from_static(b"y")),
                Some(OperationId::from("op1")),
                &token(),
            )
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::DuplicateOperation);

        let found = store
            .read_by_operation_id(
                &PartitionId::from("s"),
                &OperationId::from("op1"),
                &token(),
            )
            .await
            .unwrap()
            .expect("operation is persisted");
        assert_eq!(found, first);

        if store.supports_fillers() {
            // the failed replay consumed position 2; a filler holds it
            assert_eq!(
                store.read_last_position(&token()).await.unwrap(),
                Position::new(2)
            );
        }
    }

    async fn test_index_collision_reserves_position<T>(adapter: &T)
    where
        T: TestAdapter,
    {
        let store = adapter.new_store().await;

        append_event(&store, "s", Some(5), "x", Some("op1")).await;

        let outcome = store
            .append(
                &PartitionId::from("s"),
                Some(ChunkIndex::new(5)),
                Some(Bytes::from_static(b"y")),
                Some(OperationId::from("op2")),
                &token(),
            )
            .await
            .unwrap();
        assert_eq!(
            outcome,
            WriteOutcome::DuplicateIndex {
                partition_id: PartitionId::from("s"),
                index: ChunkIndex::new(5),
            }
        );

        if !store.supports_fillers() {
            return;
        }

        assert_eq!(
            store.read_last_position(&token()).await.unwrap(),
            Position::new(2)
        );

        let mut recorder = Recorder::new();
        store
            .read_all(Position::FIRST, u64::MAX, &mut recorder, &token())
            .await
            .unwrap();
        assert_eq!(recorder.positions(), vec![1, 2]);

        let filler = &recorder.chunks()[1];
        assert!(filler.is_filler());
        assert_eq!(filler.index(), ChunkIndex::new(2));
        assert_eq!(filler.operation_id(), &OperationId::from("_2"));
        assert!(filler.payload().is_none());
    }

    async fn test_position_density<T>(adapter: &T)
    where
        T: TestAdapter,
    {
        let store = adapter.new_store().await;
        if !store.supports_fillers() {
            return;
        }

        append_event(&store, "a", Some(1), "e1", Some("op1")).await;
        // index conflict -> filler at 2
        store
            .append(
                &PartitionId::from("a"),
                Some(ChunkIndex::new(1)),
                None,
                Some(OperationId::from("op2")),
                &token(),
            )
            .await
            .unwrap();
        append_event(&store, "b", None, "e2", Some("op1")).await;
        // operation conflict -> filler at 4
        store
            .append(
                &PartitionId::from("b"),
                None,
                None,
                Some(OperationId::from("op1")),
                &token(),
            )
            .await
            .unwrap();
        append_event(&store, "a", Some(2), "e3", None).await;

        let last = store.read_last_position(&token()).await.unwrap();
        assert_eq!(last, Position::new(5));

        let mut recorder = Recorder::new();
        store
            .read_all(Position::FIRST, u64::MAX, &mut recorder, &token())
            .await
            .unwrap();

        // every allocated position appears exactly once
        assert_eq!(recorder.positions(), vec![1, 2, 3, 4, 5]);
        assert_eq!(recorder.terminal(), Some(Terminal::Completed(5)));
    }

    async fn test_read_backward<T>(adapter: &T)
    where
        T: TestAdapter,
    {
        let store = adapter.new_store().await;

        append_event(&store, "p", None, "e1", None).await;
        append_event(&store, "p", None, "e2", None).await;
        append_event(&store, "p", None, "e3", None).await;

        let forward = read_forward_all(&store, "p").await;

        let mut backward = Recorder::new();
        store
            .read_backward(
                &PartitionId::from("p"),
                ChunkIndex::MAX,
                ChunkIndex::new(1),
                u64::MAX,
                &mut backward,
                &token(),
            )
            .await
            .unwrap();

        assert_eq!(backward.indexes(), vec![3, 2, 1]);
        assert_eq!(backward.terminal(), Some(Terminal::Completed(1)));

        // the same multiset, reversed
        let mut reversed = backward.chunks().to_vec();
        reversed.reverse();
        assert_eq!(forward.chunks(), &reversed[..]);

        // a bounded backward range
        let mut bounded = Recorder::new();
        store
            .read_backward(
                &PartitionId::from("p"),
                ChunkIndex::new(2),
                ChunkIndex::new(1),
                u64::MAX,
                &mut bounded,
                &token(),
            )
            .await
            .unwrap();
        assert_eq!(bounded.indexes(), vec![2, 1]);
    }

    async fn test_read_single_backward<T>(adapter: &T)
    where
        T: TestAdapter,
    {
        let store = adapter.new_store().await;

        append_event(&store, "p", None, "e1", None).await;
        append_event(&store, "p", None, "e2", None).await;
        append_event(&store, "p", None, "e3", None).await;

        let last = store
            .read_single_backward(&PartitionId::from("p"), ChunkIndex::MAX, &token())
            .await
            .unwrap()
            .expect("partition has chunks");
        assert_eq!(last.index(), ChunkIndex::new(3));

        let second = store
            .read_single_backward(&PartitionId::from("p"), ChunkIndex::new(2), &token())
            .await
            .unwrap()
            .expect("index 2 exists");
        assert_eq!(second.index(), ChunkIndex::new(2));

        assert!(store
            .read_single_backward(&PartitionId::from("p"), ChunkIndex::new(0), &token())
            .await
            .unwrap()
            .is_none());
        assert!(store
            .read_single_backward(&PartitionId::from("nope"), ChunkIndex::MAX, &token())
            .await
            .unwrap()
            .is_none());
    }

    async fn test_read_by_operation_id<T>(adapter: &T)
    where
        T: TestAdapter,
    {
        let store = adapter.new_store().await;

        let written = append_event(&store, "p", None, "e1", Some("op-a")).await;

        let found = store
            .read_by_operation_id(&PartitionId::from("p"), &OperationId::from("op-a"), &token())
            .await
            .unwrap();
        assert_eq!(found, Some(written));

        assert!(store
            .read_by_operation_id(&PartitionId::from("p"), &OperationId::from("op-b"), &token())
            .await
            .unwrap()
            .is_none());
        assert!(store
            .read_by_operation_id(&PartitionId::from("q"), &OperationId::from("op-a"), &token())
            .await
            .unwrap()
            .is_none());
    }

    async fn test_read_all_by_operation_id<T>(adapter: &T)
    where
        T: TestAdapter,
    {
        let store = adapter.new_store().await;

        // operation ids are only unique within a partition
        append_event(&store, "p1", None, "e1", Some("shared")).await;
        append_event(&store, "p2", None, "e2", Some("shared")).await;
        append_event(&store, "p1", None, "e3", Some("other")).await;

        let mut recorder = Recorder::new();
        store
            .read_all_by_operation_id(&OperationId::from("shared"), &mut recorder, &token())
            .await
            .unwrap();

        assert_eq!(recorder.positions(), vec![1, 2]);
        assert_eq!(recorder.terminal(), Some(Terminal::Completed(2)));
    }

    async fn test_early_stop<T>(adapter: &T)
    where
        T: TestAdapter,
    {
        let store = adapter.new_store().await;

        for i in 1..=10 {
            append_event(&store, "p", None, &format!("e{i}"), None).await;
        }

        let mut recorder = Recorder::with_stop_after(3);
        store
            .read_forward(
                &PartitionId::from("p"),
                ChunkIndex::new(1),
                ChunkIndex::MAX,
                u64::MAX,
                &mut recorder,
                &token(),
            )
            .await
            .unwrap();

        assert_eq!(recorder.indexes(), vec![1, 2, 3]);
        assert_eq!(recorder.terminal(), Some(Terminal::Stopped(3)));
    }

    async fn test_empty_read_stops_at_initial<T>(adapter: &T)
    where
        T: TestAdapter,
    {
        let store = adapter.new_store().await;

        let mut recorder = Recorder::new();
        store
            .read_forward(
                &PartitionId::from("missing"),
                ChunkIndex::new(7),
                ChunkIndex::MAX,
                u64::MAX,
                &mut recorder,
                &token(),
            )
            .await
            .unwrap();
        assert!(recorder.chunks().is_empty());
        assert_eq!(recorder.terminal(), Some(Terminal::Stopped(7)));

        let mut recorder = Recorder::new();
        store
            .read_all(Position::FIRST, u64::MAX, &mut recorder, &token())
            .await
            .unwrap();
        assert_eq!(recorder.terminal(), Some(Terminal::Stopped(1)));
    }

    async fn test_limit_completes_scan<T>(adapter: &T)
    where
        T: TestAdapter,
    {
        let store = adapter.new_store().await;

        for i in 1..=5 {
            append_event(&store, "p", None, &format!("e{i}"), None).await;
        }

        let mut recorder = Recorder::new();
        store
            .read_forward(
                &PartitionId::from("p"),
                ChunkIndex::new(1),
                ChunkIndex::MAX,
                2,
                &mut recorder,
                &token(),
            )
            .await
            .unwrap();

        // the limit is part of the query, so hitting it is completion
        assert_eq!(recorder.indexes(), vec![1, 2]);
        assert_eq!(recorder.terminal(), Some(Terminal::Completed(2)));
    }

    async fn test_batch_with_duplicates<T>(adapter: &T)
    where
        T: TestAdapter,
    {
        let store = adapter.new_store().await;

        append_event(&store, "s", Some(1), "a0", Some("o0")).await;

        let outcomes = store
            .append_batch(
                vec![
                    WriteJob::new(
                        "s",
                        Some(ChunkIndex::new(1)),
                        Some(Bytes::from_static(b"a")),
                        Some(OperationId::from("o1")),
                    ),
                    WriteJob::new(
                        "s",
                        Some(ChunkIndex::new(2)),
                        Some(Bytes::from_static(b"b")),
                        Some(OperationId::from("o2")),
                    ),
                    WriteJob::new(
                        "s",
                        Some(ChunkIndex::new(1)),
                        Some(Bytes::from_static(b"c")),
                        Some(OperationId::from("o3")),
                    ),
                    WriteJob::new(
                        "s",
                        Some(ChunkIndex::new(9)),
                        Some(Bytes::from_static(b"d")),
                        Some(OperationId::from("o0")),
                    ),
                ],
                &token(),
            )
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 4);
        assert_eq!(
            outcomes[0],
            WriteOutcome::DuplicateIndex {
                partition_id: PartitionId::from("s"),
                index: ChunkIndex::new(1),
            }
        );
        let persisted = outcomes[1].chunk().expect("job 1 succeeds");
        // jobs draw contiguous positions in order: 2, 3, 4, 5
        assert_eq!(persisted.position(), Position::new(3));
        assert_eq!(persisted.index(), ChunkIndex::new(2));
        assert_eq!(
            outcomes[2],
            WriteOutcome::DuplicateIndex {
                partition_id: PartitionId::from("s"),
                index: ChunkIndex::new(1),
            }
        );
        assert_eq!(outcomes[3], WriteOutcome::DuplicateOperation);

        // batch duplicates do not write fillers
        let mut recorder = Recorder::new();
        store
            .read_all(Position::FIRST, u64::MAX, &mut recorder, &token())
            .await
            .unwrap();
        assert_eq!(recorder.positions(), vec![1, 3]);
    }

    async fn test_batch_intra_batch_duplicate<T>(adapter: &T)
    where
        T: TestAdapter,
    {
        let store = adapter.new_store().await;

        let outcomes = store
            .append_batch(
                vec![
                    WriteJob::new(
                        "t",
                        Some(ChunkIndex::new(7)),
                        Some(Bytes::from_static(b"x")),
                        Some(OperationId::from("t1")),
                    ),
                    WriteJob::new(
                        "t",
                        Some(ChunkIndex::new(7)),
                        Some(Bytes::from_static(b"y")),
                        Some(OperationId::from("t2")),
                    ),
                ],
                &token(),
            )
            .await
            .unwrap();

        assert!(outcomes[0].chunk().is_some());
        assert_eq!(
            outcomes[1],
            WriteOutcome::DuplicateIndex {
                partition_id: PartitionId::from("t"),
                index: ChunkIndex::new(7),
            }
        );
    }

    async fn test_delete_range<T>(adapter: &T)
    where
        T: TestAdapter,
    {
        let store = adapter.new_store().await;

        for i in 1..=5 {
            append_event(&store, "p", None, &format!("e{i}"), None).await;
        }

        store
            .delete(
                &PartitionId::from("p"),
                ChunkIndex::new(2),
                ChunkIndex::new(4),
                &token(),
            )
            .await
            .unwrap();

        let recorder = read_forward_all(&store, "p").await;
        assert_eq!(recorder.indexes(), vec![1, 5]);

        // deleted chunks vanish from the global stream but keep their
        // positions reserved
        let mut all = Recorder::new();
        store
            .read_all(Position::FIRST, u64::MAX, &mut all, &token())
            .await
            .unwrap();
        assert_eq!(all.positions(), vec![1, 5]);
        assert_eq!(
            store.read_last_position(&token()).await.unwrap(),
            Position::new(5)
        );
    }

    async fn test_delete_missing_target<T>(adapter: &T)
    where
        T: TestAdapter,
    {
        let store = adapter.new_store().await;

        let err = store
            .delete(
                &PartitionId::from("nope"),
                ChunkIndex::new(1),
                ChunkIndex::MAX,
                &token(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ChunkStoreErrorKind::DeleteTargetNotFound);

        // a second delete over an already-deleted range also matches nothing
        append_event(&store, "p", Some(1), "e1", None).await;
        store
            .delete(
                &PartitionId::from("p"),
                ChunkIndex::new(1),
                ChunkIndex::new(1),
                &token(),
            )
            .await
            .unwrap();
        let err = store
            .delete(
                &PartitionId::from("p"),
                ChunkIndex::new(1),
                ChunkIndex::new(1),
                &token(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ChunkStoreErrorKind::DeleteTargetNotFound);
    }

    async fn test_reserved_partition_rejected<T>(adapter: &T)
    where
        T: TestAdapter,
    {
        let store = adapter.new_store().await;

        let err = store
            .append(
                &PartitionId::empty(),
                None,
                Some(Bytes::from_static(b"x")),
                None,
                &token(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ChunkStoreErrorKind::InvalidInput);

        let err = store
            .append_batch(
                vec![WriteJob::new(PartitionId::empty(), None, None, None)],
                &token(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ChunkStoreErrorKind::InvalidInput);
    }

    /// A consumer whose `on_next` fails after a configured number of
    /// deliveries.
    #[derive(Debug)]
    struct ExplodingSubscription {
        fail_on: usize,
        seen: usize,
        observed: Option<(i64, ChunkStoreErrorKind)>,
        completed: bool,
    }

    impl ExplodingSubscription {
        fn new(fail_on: usize) -> Self {
            Self {
                fail_on,
                seen: 0,
                observed: None,
                completed: false,
            }
        }
    }

    #[async_trait]
    impl Subscription for ExplodingSubscription {
        async fn on_start(&mut self, _first: i64) -> Result<(), ChunkStoreError> {
            Ok(())
        }

        async fn on_next(&mut self, _chunk: Chunk) -> Result<bool, ChunkStoreError> {
            self.seen += 1;
            if self.seen == self.fail_on {
                Err(ChunkStoreError::invalid_data("consumer exploded"))
            } else {
                Ok(true)
            }
        }

        async fn completed(&mut self, _last: i64) {
            self.completed = true;
        }

        async fn stopped(&mut self, _last: i64) {
            self.completed = true;
        }

        async fn on_error(&mut self, last: i64, error: &ChunkStoreError) {
            self.observed = Some((last, error.kind()));
        }
    }

    async fn test_consumer_error_routes_to_on_error<T>(adapter: &T)
    where
        T: TestAdapter,
    {
        let store = adapter.new_store().await;

        for i in 1..=5 {
            append_event(&store, "p", None, &format!("e{i}"), None).await;
        }

        let mut sub = ExplodingSubscription::new(3);
        store
            .read_forward(
                &PartitionId::from("p"),
                ChunkIndex::new(1),
                ChunkIndex::MAX,
                u64::MAX,
                &mut sub,
                &token(),
            )
            .await
            .unwrap();

        assert_eq!(sub.observed, Some((3, ChunkStoreErrorKind::InvalidData)));
        assert!(!sub.completed, "no terminal besides on_error");

        // the store stays usable after a consumer failure
        let recorder = read_forward_all(&store, "p").await;
        assert_eq!(recorder.chunks().len(), 5);
    }

    async fn test_cancellation_before_scan<T>(adapter: &T)
    where
        T: TestAdapter,
    {
        let store = adapter.new_store().await;
        append_event(&store, "p", None, "e1", None).await;

        let cancelled = CancellationToken::new();
        cancelled.cancel();

        let err = store
            .append(
                &PartitionId::from("p"),
                None,
                Some(Bytes::from_static(b"x")),
                None,
                &cancelled,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ChunkStoreErrorKind::Cancelled);

        let err = store.read_last_position(&cancelled).await.unwrap_err();
        assert_eq!(err.kind(), ChunkStoreErrorKind::Cancelled);

        let mut recorder = Recorder::new();
        store
            .read_forward(
                &PartitionId::from("p"),
                ChunkIndex::new(1),
                ChunkIndex::MAX,
                u64::MAX,
                &mut recorder,
                &cancelled,
            )
            .await
            .unwrap();
        assert_eq!(
            recorder.terminal(),
            Some(Terminal::Errored(1, ChunkStoreErrorKind::Cancelled))
        );
        assert!(recorder.chunks().is_empty());
    }

    async fn test_concurrent_appends_stay_dense<T>(adapter: &T)
    where
        T: TestAdapter,
    {
        let store = Arc::new(adapter.new_store().await);

        let mut tasks: FuturesUnordered<_> = (0..4)
            .map(|w| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    for i in 0..25 {
                        append_event(
                            store.as_ref(),
                            &format!("writer-{w}"),
                            None,
                            &format!("e{i}"),
                            None,
                        )
                        .await;
                    }
                })
            })
            .collect();

        while let Some(task) = tasks.next().await {
            task.unwrap();
        }

        assert_eq!(
            store.read_last_position(&token()).await.unwrap(),
            Position::new(100)
        );

        let mut recorder = Recorder::new();
        store
            .read_all(Position::FIRST, u64::MAX, &mut recorder, &token())
            .await
            .unwrap();
        let positions = recorder.positions();
        assert_eq!(positions, (1..=100).collect::<Vec<_>>());

        // each writer's partition preserved its own ascending order
        let per_writer = read_forward_all(store.as_ref(), "writer-0").await;
        let mut sorted = per_writer.positions();
        sorted.sort_unstable();
        assert_eq!(per_writer.positions(), sorted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_helpers::assert_contains;

    #[test]
    fn error_display_includes_kind() {
        let err = ChunkStoreError::invalid_input("bad index");
        assert_eq!(err.kind(), ChunkStoreErrorKind::InvalidInput);
        assert_contains!(err.to_string(), "InvalidInput");
        assert_contains!(err.to_string(), "bad index");
    }

    #[test]
    fn error_conversions() {
        let err: ChunkStoreError =
            std::io::Error::new(std::io::ErrorKind::Other, "disk gone").into();
        assert_eq!(err.kind(), ChunkStoreErrorKind::IO);

        let err: ChunkStoreError = "something odd".into();
        assert_eq!(err.kind(), ChunkStoreErrorKind::Unknown);

        let err: ChunkStoreError = String::from("also odd").into();
        assert_eq!(err.kind(), ChunkStoreErrorKind::Unknown);
    }

    #[test]
    fn write_outcome_accessors() {
        let outcome = WriteOutcome::DuplicateOperation;
        assert!(outcome.chunk().is_none());
    }
}
