//! The in-memory reference backend.
//!
//! This backend defines the behavior every other backend is measured
//! against: uniqueness enforcement, empty-chunk fillers, the stale-sequence
//! retry loop, and strict position-ordered visibility of the global stream.

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicBool, Ordering},
    sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use data_types::{Chunk, ChunkIndex, OperationId, PartitionId, Position};
use hashbrown::HashMap;
use observability_deps::tracing::{debug, warn};
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::{
    backoff::{Backoff, BackoffConfig},
    codec::{IdentityCodec, PayloadCodec},
    core::{ChunkStoreError, Persistence, WriteJob, WriteOutcome},
    sequence::{LocalSequence, SequenceAllocator},
    sim::{LatencySimulator, NoLatency},
    subscription::Subscription,
};

/// A committed row. Content never changes after insert; deletion is a flag.
#[derive(Debug)]
struct StoredChunk {
    position: i64,
    partition_id: PartitionId,
    index: i64,
    operation_id: OperationId,
    wire: Option<Bytes>,
    deleted: AtomicBool,
}

impl StoredChunk {
    fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::SeqCst);
    }

    fn to_chunk(&self, payload: Option<Bytes>) -> Chunk {
        Chunk::new(
            Position::new(self.position),
            self.partition_id.clone(),
            ChunkIndex::new(self.index),
            self.operation_id.clone(),
            payload,
        )
    }
}

/// State of one position slot in the global log.
#[derive(Debug, Clone)]
enum Slot {
    /// Allocated (or never reached); nothing committed yet.
    Pending,
    /// Consumed by a batch duplicate; nothing will ever occupy it.
    Consumed,
    /// A committed row.
    Row(Arc<StoredChunk>),
}

impl Slot {
    fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

#[derive(Debug, Default)]
struct GlobalLog {
    /// Slot `position - 1` tracks the chunk bearing that position.
    slots: Vec<Slot>,
    /// The visibility watermark: every position up to and including it is
    /// committed or consumed. Global reads never run past it, which is what
    /// keeps `read_all` strictly position-ordered even when writers commit
    /// out of order.
    last_position: i64,
}

impl GlobalLog {
    fn advance_watermark(&mut self) {
        while let Some(slot) = self.slots.get(self.last_position as usize) {
            if slot.is_pending() {
                break;
            }
            self.last_position += 1;
        }
    }
}

#[derive(Debug, Default)]
struct PartitionLog {
    by_index: BTreeMap<i64, Arc<StoredChunk>>,
    by_operation: HashMap<OperationId, Arc<StoredChunk>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InsertConflict {
    Position,
    Index,
    Operation,
}

/// Backing storage of [`MemoryChunkStore`] instances.
///
/// Shareable: several stores over one `MemoryStorage` model several writer
/// processes over one database, which is what exercises the stale-sequence
/// retry path.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    log: RwLock<GlobalLog>,
    partitions: RwLock<HashMap<PartitionId, Arc<Mutex<PartitionLog>>>>,
}

impl MemoryStorage {
    /// Fresh, empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    fn last_position(&self) -> Position {
        Position::new(self.log.read().last_position)
    }

    fn partition(&self, partition_id: &PartitionId) -> Option<Arc<Mutex<PartitionLog>>> {
        self.partitions.read().get(partition_id).map(Arc::clone)
    }

    fn partition_or_create(&self, partition_id: &PartitionId) -> Arc<Mutex<PartitionLog>> {
        if let Some(partition) = self.partition(partition_id) {
            return partition;
        }
        let mut partitions = self.partitions.write();
        Arc::clone(partitions.entry(partition_id.clone()).or_default())
    }

    /// Commit `row`, enforcing all three uniqueness keys.
    ///
    /// Lock order is partition first, then the global log; both are released
    /// before any subscription callback runs.
    fn try_insert(&self, row: StoredChunk) -> Result<Arc<StoredChunk>, InsertConflict> {
        let partition = self.partition_or_create(&row.partition_id);
        let mut partition = partition.lock();

        // idempotency wins over index collisions, so the operation key is
        // checked first
        if partition.by_operation.contains_key(&row.operation_id) {
            return Err(InsertConflict::Operation);
        }
        if partition.by_index.contains_key(&row.index) {
            return Err(InsertConflict::Index);
        }

        let mut log = self.log.write();
        let slot_idx = usize::try_from(row.position - 1).expect("positions start at 1");
        if let Some(slot) = log.slots.get(slot_idx) {
            if !slot.is_pending() {
                return Err(InsertConflict::Position);
            }
        }

        let row = Arc::new(row);
        if log.slots.len() <= slot_idx {
            log.slots.resize(slot_idx + 1, Slot::Pending);
        }
        log.slots[slot_idx] = Slot::Row(Arc::clone(&row));
        log.advance_watermark();

        partition.by_index.insert(row.index, Arc::clone(&row));
        partition
            .by_operation
            .insert(row.operation_id.clone(), Arc::clone(&row));

        Ok(row)
    }

    /// Burn a position a batch duplicate consumed so the watermark can move
    /// past it.
    fn mark_consumed(&self, position: i64) {
        let mut log = self.log.write();
        let slot_idx = usize::try_from(position - 1).expect("positions start at 1");
        if log.slots.len() <= slot_idx {
            log.slots.resize(slot_idx + 1, Slot::Pending);
        }
        debug_assert!(log.slots[slot_idx].is_pending());
        log.slots[slot_idx] = Slot::Consumed;
        log.advance_watermark();
    }

    fn range_forward(
        &self,
        partition_id: &PartitionId,
        from: i64,
        to: i64,
        limit: usize,
    ) -> Vec<Arc<StoredChunk>> {
        if from > to {
            return Vec::new();
        }
        let Some(partition) = self.partition(partition_id) else {
            return Vec::new();
        };
        let partition = partition.lock();
        partition
            .by_index
            .range(from..=to)
            .filter(|(_, row)| !row.is_deleted())
            .map(|(_, row)| Arc::clone(row))
            .take(limit)
            .collect()
    }

    fn range_backward(
        &self,
        partition_id: &PartitionId,
        from_upper: i64,
        to_lower: i64,
        limit: usize,
    ) -> Vec<Arc<StoredChunk>> {
        if to_lower > from_upper {
            return Vec::new();
        }
        let Some(partition) = self.partition(partition_id) else {
            return Vec::new();
        };
        let partition = partition.lock();
        partition
            .by_index
            .range(to_lower..=from_upper)
            .rev()
            .filter(|(_, row)| !row.is_deleted())
            .map(|(_, row)| Arc::clone(row))
            .take(limit)
            .collect()
    }

    fn single_backward(
        &self,
        partition_id: &PartitionId,
        from_upper: i64,
    ) -> Option<Arc<StoredChunk>> {
        let partition = self.partition(partition_id)?;
        let partition = partition.lock();
        partition
            .by_index
            .range(..=from_upper)
            .rev()
            .find(|(_, row)| !row.is_deleted())
            .map(|(_, row)| Arc::clone(row))
    }

    fn find_by_operation(
        &self,
        partition_id: &PartitionId,
        operation_id: &OperationId,
    ) -> Option<Arc<StoredChunk>> {
        let partition = self.partition(partition_id)?;
        let partition = partition.lock();
        partition
            .by_operation
            .get(operation_id)
            .filter(|row| !row.is_deleted())
            .map(Arc::clone)
    }

    /// Committed rows at or past `from`, up to the visibility watermark.
    fn global_range(&self, from: i64, limit: usize) -> Vec<Arc<StoredChunk>> {
        let from = from.max(1);
        let log = self.log.read();
        if from > log.last_position {
            return Vec::new();
        }
        let start = (from - 1) as usize;
        let end = log.last_position as usize;
        log.slots[start..end]
            .iter()
            .filter_map(|slot| match slot {
                Slot::Row(row) if !row.is_deleted() => Some(Arc::clone(row)),
                _ => None,
            })
            .take(limit)
            .collect()
    }

    fn scan_by_operation(&self, operation_id: &OperationId) -> Vec<Arc<StoredChunk>> {
        let log = self.log.read();
        let end = log.last_position as usize;
        log.slots[..end]
            .iter()
            .filter_map(|slot| match slot {
                Slot::Row(row) if !row.is_deleted() && &row.operation_id == operation_id => {
                    Some(Arc::clone(row))
                }
                _ => None,
            })
            .collect()
    }

    fn mark_deleted_range(&self, partition_id: &PartitionId, from: i64, to: i64) -> usize {
        if from > to {
            return 0;
        }
        let Some(partition) = self.partition(partition_id) else {
            return 0;
        };
        let partition = partition.lock();
        let mut marked = 0;
        for (_, row) in partition.by_index.range(from..=to) {
            if !row.is_deleted() {
                row.mark_deleted();
                marked += 1;
            }
        }
        marked
    }
}

/// Builds a [`MemoryChunkStore`].
#[derive(Debug)]
pub struct MemoryChunkStoreBuilder {
    storage: Arc<MemoryStorage>,
    allocator: Option<Arc<dyn SequenceAllocator>>,
    codec: Arc<dyn PayloadCodec>,
    simulator: Arc<dyn LatencySimulator>,
    backoff_config: BackoffConfig,
}

impl Default for MemoryChunkStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryChunkStoreBuilder {
    /// A builder for a store over fresh storage with a local sequence, the
    /// identity codec and no artificial latency.
    pub fn new() -> Self {
        Self {
            storage: Arc::new(MemoryStorage::new()),
            allocator: None,
            codec: Arc::new(IdentityCodec),
            simulator: Arc::new(NoLatency),
            backoff_config: BackoffConfig::default(),
        }
    }

    /// Share the backing storage of another store instance.
    pub fn with_storage(mut self, storage: Arc<MemoryStorage>) -> Self {
        self.storage = storage;
        self
    }

    /// Replace the default process-local sequence allocator.
    pub fn with_allocator(mut self, allocator: Arc<dyn SequenceAllocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    /// Replace the identity payload codec.
    pub fn with_codec(mut self, codec: Arc<dyn PayloadCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Inject latency before every observable step.
    pub fn with_simulator(mut self, simulator: Arc<dyn LatencySimulator>) -> Self {
        self.simulator = simulator;
        self
    }

    /// Tune the position-collision retry policy.
    pub fn with_backoff_config(mut self, config: BackoffConfig) -> Self {
        self.backoff_config = config;
        self
    }

    /// Validate the configuration and open the store.
    pub fn build(self) -> Result<MemoryChunkStore, ChunkStoreError> {
        if self.backoff_config.max_attempts == 0 {
            return Err(ChunkStoreError::invalid_config(
                "retry policy allows zero attempts",
            ));
        }
        if self.backoff_config.init_backoff > self.backoff_config.max_backoff {
            return Err(ChunkStoreError::invalid_config(
                "initial backoff exceeds maximum backoff",
            ));
        }

        // a local sequence is primed from the watermark at open
        let allocator = self.allocator.unwrap_or_else(|| {
            Arc::new(LocalSequence::new(self.storage.last_position())) as _
        });

        Ok(MemoryChunkStore {
            storage: self.storage,
            allocator,
            codec: self.codec,
            simulator: self.simulator,
            backoff_config: self.backoff_config,
        })
    }
}

/// Which key a delivery reports to the subscription.
#[derive(Debug, Clone, Copy)]
enum DeliveryKey {
    Index,
    Position,
}

/// The in-memory reference backend.
#[derive(Debug)]
pub struct MemoryChunkStore {
    storage: Arc<MemoryStorage>,
    allocator: Arc<dyn SequenceAllocator>,
    codec: Arc<dyn PayloadCodec>,
    simulator: Arc<dyn LatencySimulator>,
    backoff_config: BackoffConfig,
}

impl MemoryChunkStore {
    /// Shortcut for [`MemoryChunkStoreBuilder`].
    pub fn builder() -> MemoryChunkStoreBuilder {
        MemoryChunkStoreBuilder::new()
    }

    /// Handle on the backing storage, for sharing with another instance.
    pub fn storage(&self) -> Arc<MemoryStorage> {
        Arc::clone(&self.storage)
    }

    /// Push a snapshot of rows through the subscription lifecycle.
    ///
    /// No internal lock is held here; `rows` was snapshotted beforehand.
    async fn deliver(
        &self,
        rows: Vec<Arc<StoredChunk>>,
        first: i64,
        key: DeliveryKey,
        subscription: &mut dyn Subscription,
        cancel: &CancellationToken,
    ) -> Result<(), ChunkStoreError> {
        if cancel.is_cancelled() {
            subscription
                .on_error(first, &ChunkStoreError::cancelled())
                .await;
            return Ok(());
        }

        if let Err(e) = subscription.on_start(first).await {
            subscription.on_error(first, &e).await;
            return Ok(());
        }

        let mut last_delivered: Option<i64> = None;
        for row in rows {
            if cancel.is_cancelled() {
                subscription
                    .on_error(last_delivered.unwrap_or(first), &ChunkStoreError::cancelled())
                    .await;
                return Ok(());
            }

            self.simulator.wait().await;

            let payload = match self.codec.decode(row.wire.as_ref()) {
                Ok(payload) => payload,
                Err(e) => {
                    subscription
                        .on_error(last_delivered.unwrap_or(first), &e)
                        .await;
                    return Ok(());
                }
            };

            let chunk_key = match key {
                DeliveryKey::Index => row.index,
                DeliveryKey::Position => row.position,
            };
            match subscription.on_next(row.to_chunk(payload)).await {
                Ok(true) => last_delivered = Some(chunk_key),
                Ok(false) => {
                    subscription.stopped(chunk_key).await;
                    return Ok(());
                }
                Err(e) => {
                    subscription.on_error(chunk_key, &e).await;
                    return Ok(());
                }
            }
        }

        match last_delivered {
            Some(last) => subscription.completed(last).await,
            None => subscription.stopped(first).await,
        }
        Ok(())
    }

    /// Reserve `position` with an empty chunk in the filler partition.
    async fn write_filler(&self, position: Position) -> Result<(), ChunkStoreError> {
        let wire = self.codec.encode(None)?;
        self.simulator.wait().await;
        let row = StoredChunk {
            position: position.get(),
            partition_id: PartitionId::empty(),
            index: position.get(),
            operation_id: OperationId::filler(position),
            wire,
            deleted: AtomicBool::new(false),
        };
        match self.storage.try_insert(row) {
            Ok(_) => Ok(()),
            Err(conflict) => Err(ChunkStoreError::unknown(format!(
                "filler write failed at position {position}: {conflict:?} conflict"
            ))),
        }
    }

    fn check_job(
        partition_id: &PartitionId,
        index: Option<ChunkIndex>,
    ) -> Result<(), ChunkStoreError> {
        if partition_id.is_empty_partition() {
            return Err(ChunkStoreError::invalid_input(format!(
                "partition {partition_id} is reserved for fillers"
            )));
        }
        if let Some(index) = index {
            if index.get() < 0 {
                return Err(ChunkStoreError::invalid_input(format!(
                    "explicit index must be non-negative, got {index}"
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Persistence for MemoryChunkStore {
    fn supports_fillers(&self) -> bool {
        true
    }

    async fn read_forward(
        &self,
        partition_id: &PartitionId,
        from_index_inclusive: ChunkIndex,
        to_index_inclusive: ChunkIndex,
        limit: u64,
        subscription: &mut dyn Subscription,
        cancel: &CancellationToken,
    ) -> Result<(), ChunkStoreError> {
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        let rows = self.storage.range_forward(
            partition_id,
            from_index_inclusive.get(),
            to_index_inclusive.get(),
            limit,
        );
        self.deliver(
            rows,
            from_index_inclusive.get(),
            DeliveryKey::Index,
            subscription,
            cancel,
        )
        .await
    }

    async fn read_backward(
        &self,
        partition_id: &PartitionId,
        from_index_inclusive: ChunkIndex,
        to_index_inclusive: ChunkIndex,
        limit: u64,
        subscription: &mut dyn Subscription,
        cancel: &CancellationToken,
    ) -> Result<(), ChunkStoreError> {
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        let rows = self.storage.range_backward(
            partition_id,
            from_index_inclusive.get(),
            to_index_inclusive.get(),
            limit,
        );
        self.deliver(
            rows,
            from_index_inclusive.get(),
            DeliveryKey::Index,
            subscription,
            cancel,
        )
        .await
    }

    async fn read_single_backward(
        &self,
        partition_id: &PartitionId,
        from_index_inclusive: ChunkIndex,
        cancel: &CancellationToken,
    ) -> Result<Option<Chunk>, ChunkStoreError> {
        if cancel.is_cancelled() {
            return Err(ChunkStoreError::cancelled());
        }
        self.storage
            .single_backward(partition_id, from_index_inclusive.get())
            .map(|row| {
                let payload = self.codec.decode(row.wire.as_ref())?;
                Ok(row.to_chunk(payload))
            })
            .transpose()
    }

    async fn read_all(
        &self,
        from_position_inclusive: Position,
        limit: u64,
        subscription: &mut dyn Subscription,
        cancel: &CancellationToken,
    ) -> Result<(), ChunkStoreError> {
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        let rows = self
            .storage
            .global_range(from_position_inclusive.get(), limit);
        self.deliver(
            rows,
            from_position_inclusive.get(),
            DeliveryKey::Position,
            subscription,
            cancel,
        )
        .await
    }

    async fn read_last_position(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Position, ChunkStoreError> {
        if cancel.is_cancelled() {
            return Err(ChunkStoreError::cancelled());
        }
        Ok(self.storage.last_position())
    }

    async fn read_by_operation_id(
        &self,
        partition_id: &PartitionId,
        operation_id: &OperationId,
        cancel: &CancellationToken,
    ) -> Result<Option<Chunk>, ChunkStoreError> {
        if cancel.is_cancelled() {
            return Err(ChunkStoreError::cancelled());
        }
        self.storage
            .find_by_operation(partition_id, operation_id)
            .map(|row| {
                let payload = self.codec.decode(row.wire.as_ref())?;
                Ok(row.to_chunk(payload))
            })
            .transpose()
    }

    async fn read_all_by_operation_id(
        &self,
        operation_id: &OperationId,
        subscription: &mut dyn Subscription,
        cancel: &CancellationToken,
    ) -> Result<(), ChunkStoreError> {
        let rows = self.storage.scan_by_operation(operation_id);
        self.deliver(
            rows,
            Position::FIRST.get(),
            DeliveryKey::Position,
            subscription,
            cancel,
        )
        .await
    }

    async fn append(
        &self,
        partition_id: &PartitionId,
        index: Option<ChunkIndex>,
        payload: Option<Bytes>,
        operation_id: Option<OperationId>,
        cancel: &CancellationToken,
    ) -> Result<WriteOutcome, ChunkStoreError> {
        Self::check_job(partition_id, index)?;
        if cancel.is_cancelled() {
            return Err(ChunkStoreError::cancelled());
        }

        let wire = self.codec.encode(payload.as_ref())?;
        let operation_id = operation_id.unwrap_or_else(OperationId::new_unique);

        let mut backoff = Backoff::new(&self.backoff_config);
        let mut position = self.allocator.next_ids(1).await?;

        loop {
            self.simulator.wait().await;

            let chunk_index = index.map(|i| i.get()).unwrap_or_else(|| position.get());
            let row = StoredChunk {
                position: position.get(),
                partition_id: partition_id.clone(),
                index: chunk_index,
                operation_id: operation_id.clone(),
                wire: wire.clone(),
                deleted: AtomicBool::new(false),
            };

            match self.storage.try_insert(row) {
                Ok(row) => {
                    debug!(
                        position = row.position,
                        partition = %partition_id,
                        index = row.index,
                        "chunk persisted"
                    );
                    return Ok(WriteOutcome::Persisted(row.to_chunk(payload.clone())));
                }
                Err(InsertConflict::Operation) => {
                    debug!(
                        partition = %partition_id,
                        operation = %operation_id,
                        %position,
                        "duplicate operation - reserving position with a filler"
                    );
                    self.write_filler(position).await?;
                    return Ok(WriteOutcome::DuplicateOperation);
                }
                Err(InsertConflict::Index) => {
                    debug!(
                        partition = %partition_id,
                        index = chunk_index,
                        %position,
                        "duplicate index - reserving position with a filler"
                    );
                    self.write_filler(position).await?;
                    return Ok(WriteOutcome::DuplicateIndex {
                        partition_id: partition_id.clone(),
                        index: ChunkIndex::new(chunk_index),
                    });
                }
                Err(InsertConflict::Position) => {
                    let Some(delay) = backoff.next() else {
                        return Err(ChunkStoreError::sequence_exhausted(format!(
                            "no free position after {} retry rounds, last tried {position}",
                            self.backoff_config.max_attempts
                        )));
                    };
                    warn!(
                        %position,
                        "position already occupied - reloading stale sequence"
                    );
                    self.allocator.reload(self.storage.last_position()).await;
                    tokio::time::sleep(delay).await;
                    if cancel.is_cancelled() {
                        return Err(ChunkStoreError::cancelled());
                    }
                    position = self.allocator.next_ids(1).await?;
                }
            }
        }
    }

    async fn append_batch(
        &self,
        jobs: Vec<WriteJob>,
        cancel: &CancellationToken,
    ) -> Result<Vec<WriteOutcome>, ChunkStoreError> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }
        for job in &jobs {
            Self::check_job(&job.partition_id, job.index)?;
        }
        if cancel.is_cancelled() {
            return Err(ChunkStoreError::cancelled());
        }

        let wires = jobs
            .iter()
            .map(|job| self.codec.encode(job.payload.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;

        let last = self.allocator.next_ids(jobs.len() as u64).await?;
        let first = last.get() - (jobs.len() as i64 - 1);

        self.simulator.wait().await;

        let mut outcomes = Vec::with_capacity(jobs.len());
        for ((job, wire), position) in jobs.iter().zip(wires).zip(first..) {
            let chunk_index = job.index.map(|i| i.get()).unwrap_or(position);
            let row = StoredChunk {
                position,
                partition_id: job.partition_id.clone(),
                index: chunk_index,
                operation_id: job
                    .operation_id
                    .clone()
                    .unwrap_or_else(OperationId::new_unique),
                wire,
                deleted: AtomicBool::new(false),
            };

            match self.storage.try_insert(row) {
                Ok(row) => {
                    outcomes.push(WriteOutcome::Persisted(row.to_chunk(job.payload.clone())));
                }
                Err(InsertConflict::Operation) => {
                    // batch duplicates are reported, not filled
                    self.storage.mark_consumed(position);
                    outcomes.push(WriteOutcome::DuplicateOperation);
                }
                Err(InsertConflict::Index) => {
                    self.storage.mark_consumed(position);
                    outcomes.push(WriteOutcome::DuplicateIndex {
                        partition_id: job.partition_id.clone(),
                        index: ChunkIndex::new(chunk_index),
                    });
                }
                Err(InsertConflict::Position) => {
                    // stale counter mid-batch: burn the rest of our range so
                    // the watermark is not stalled, then report the failure
                    for unused in position + 1..=last.get() {
                        self.storage.mark_consumed(unused);
                    }
                    self.allocator.reload(self.storage.last_position()).await;
                    warn!(position, "bulk insert ran into an occupied position");
                    return Err(ChunkStoreError::unknown(format!(
                        "position {position} already occupied during bulk insert"
                    )));
                }
            }
        }

        Ok(outcomes)
    }

    async fn delete(
        &self,
        partition_id: &PartitionId,
        from_index_inclusive: ChunkIndex,
        to_index_inclusive: ChunkIndex,
        cancel: &CancellationToken,
    ) -> Result<(), ChunkStoreError> {
        if cancel.is_cancelled() {
            return Err(ChunkStoreError::cancelled());
        }
        self.simulator.wait().await;

        let marked = self.storage.mark_deleted_range(
            partition_id,
            from_index_inclusive.get(),
            to_index_inclusive.get(),
        );
        if marked == 0 {
            return Err(ChunkStoreError::delete_target_not_found(partition_id));
        }
        debug!(
            partition = %partition_id,
            from = from_index_inclusive.get(),
            to = to_index_inclusive.get(),
            marked,
            "chunks marked deleted"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::test_utils::{append_event, perform_generic_tests, token, TestAdapter},
        core::ChunkStoreErrorKind,
        sequence::{CounterDocument, SharedSequence},
        sim::FixedLatency,
        subscription::{Recorder, Terminal},
    };
    use std::time::Duration;

    struct MemTestAdapter {}

    #[async_trait]
    impl TestAdapter for MemTestAdapter {
        type Store = MemoryChunkStore;

        async fn new_store(&self) -> Self::Store {
            MemoryChunkStore::builder().build().unwrap()
        }
    }

    #[tokio::test]
    async fn generic_backend_contract() {
        test_helpers::maybe_start_logging();
        perform_generic_tests(MemTestAdapter {}).await;
    }

    #[tokio::test]
    async fn unusable_retry_policy_is_invalid_config() {
        let err = MemoryChunkStore::builder()
            .with_backoff_config(BackoffConfig {
                max_attempts: 0,
                ..Default::default()
            })
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), ChunkStoreErrorKind::InvalidConfig);

        let err = MemoryChunkStore::builder()
            .with_backoff_config(BackoffConfig {
                init_backoff: Duration::from_secs(10),
                max_backoff: Duration::from_secs(1),
                ..Default::default()
            })
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), ChunkStoreErrorKind::InvalidConfig);
    }

    #[tokio::test]
    async fn stale_local_sequence_recovers_by_reload() {
        test_helpers::maybe_start_logging();

        // two stores over one storage, both with local sequences primed at 0,
        // modeling two writer processes
        let store_a = MemoryChunkStore::builder().build().unwrap();
        let store_b = MemoryChunkStore::builder()
            .with_storage(store_a.storage())
            .build()
            .unwrap();

        append_event(&store_a, "p", None, "e1", None).await;
        append_event(&store_a, "p", None, "e2", None).await;

        // b's counter still believes 0 is the last position; its first
        // attempt collides and the reload converges on 3
        let chunk = append_event(&store_b, "q", None, "e3", None).await;
        assert_eq!(chunk.position(), Position::new(3));

        let mut recorder = Recorder::new();
        store_a
            .read_all(Position::FIRST, u64::MAX, &mut recorder, &token())
            .await
            .unwrap();
        assert_eq!(recorder.positions(), vec![1, 2, 3]);
    }

    /// An allocator that never advances, pinning every write to an occupied
    /// position.
    #[derive(Debug)]
    struct StuckAllocator;

    #[async_trait]
    impl SequenceAllocator for StuckAllocator {
        async fn next_ids(&self, _count: u64) -> Result<Position, ChunkStoreError> {
            Ok(Position::new(1))
        }

        async fn reload(&self, _max_persisted: Position) {}
    }

    #[tokio::test]
    async fn retry_cap_surfaces_as_sequence_exhausted() {
        test_helpers::maybe_start_logging();

        let store = MemoryChunkStore::builder()
            .with_allocator(Arc::new(StuckAllocator))
            .with_backoff_config(BackoffConfig {
                init_backoff: Duration::from_micros(10),
                max_backoff: Duration::from_micros(100),
                base: 2.,
                max_attempts: 3,
            })
            .build()
            .unwrap();

        append_event(&store, "p", None, "e1", None).await;

        // the allocator keeps handing out the occupied position; after the
        // configured rounds the append gives up instead of livelocking
        let err = store
            .append(
                &PartitionId::from("p"),
                None,
                Some(Bytes::from_static(b"e2")),
                None,
                &token(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ChunkStoreErrorKind::SequenceExhausted);
    }

    #[tokio::test]
    async fn shared_sequence_avoids_collisions() {
        let counter = Arc::new(CounterDocument::new("chunk-positions"));
        let storage = Arc::new(MemoryStorage::new());

        let store_a = MemoryChunkStore::builder()
            .with_storage(Arc::clone(&storage))
            .with_allocator(Arc::new(SharedSequence::new(Arc::clone(&counter))))
            .build()
            .unwrap();
        let store_b = MemoryChunkStore::builder()
            .with_storage(Arc::clone(&storage))
            .with_allocator(Arc::new(SharedSequence::new(Arc::clone(&counter))))
            .build()
            .unwrap();

        let c1 = append_event(&store_a, "p", None, "e1", None).await;
        let c2 = append_event(&store_b, "p", None, "e2", None).await;
        let c3 = append_event(&store_a, "q", None, "e3", None).await;

        assert_eq!(c1.position(), Position::new(1));
        assert_eq!(c2.position(), Position::new(2));
        assert_eq!(c3.position(), Position::new(3));
        assert_eq!(counter.last_value(), 3);
    }

    #[tokio::test]
    async fn batch_bails_on_occupied_position_and_converges() {
        test_helpers::maybe_start_logging();

        let store_a = MemoryChunkStore::builder().build().unwrap();
        let store_b = MemoryChunkStore::builder()
            .with_storage(store_a.storage())
            .build()
            .unwrap();

        append_event(&store_a, "p", None, "e1", None).await;

        // b's batch draws positions 1..=2; position 1 is taken
        let err = store_b
            .append_batch(
                vec![
                    WriteJob::new("q", None, Some(Bytes::from_static(b"x")), None),
                    WriteJob::new("q", None, Some(Bytes::from_static(b"y")), None),
                ],
                &token(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ChunkStoreErrorKind::Unknown);

        // the reload converged the counter; the next write lands cleanly
        let chunk = append_event(&store_b, "q", None, "e2", None).await;
        assert_eq!(chunk.position(), Position::new(3));

        let mut recorder = Recorder::new();
        store_a
            .read_all(Position::FIRST, u64::MAX, &mut recorder, &token())
            .await
            .unwrap();
        assert_eq!(recorder.positions(), vec![1, 3]);
        assert_eq!(
            store_a.read_last_position(&token()).await.unwrap(),
            Position::new(3)
        );
    }

    #[tokio::test]
    async fn out_of_order_commit_is_invisible_until_gap_closes() {
        let allocator = Arc::new(LocalSequence::new(Position::new(0)));
        let store = MemoryChunkStore::builder()
            .with_allocator(Arc::clone(&allocator) as _)
            .build()
            .unwrap();

        // burn position 1, as if another task allocated it and has not
        // committed yet
        allocator.next_ids(1).await.unwrap();

        let chunk = append_event(&store, "p", None, "e1", None).await;
        assert_eq!(chunk.position(), Position::new(2));

        // the committed row sits above a pending position, so the global
        // stream does not expose it yet
        assert_eq!(
            store.read_last_position(&token()).await.unwrap(),
            Position::new(0)
        );
        let mut recorder = Recorder::new();
        store
            .read_all(Position::FIRST, u64::MAX, &mut recorder, &token())
            .await
            .unwrap();
        assert!(recorder.chunks().is_empty());

        // partition-scoped reads are not gated by the watermark
        let forward = store
            .read_single_backward(&PartitionId::from("p"), ChunkIndex::MAX, &token())
            .await
            .unwrap();
        assert_eq!(forward.unwrap().position(), Position::new(2));
    }

    /// A consumer that cancels its own token after the first delivery.
    #[derive(Debug)]
    struct CancellingSubscription {
        cancel: CancellationToken,
        delivered: usize,
        terminal: Option<Terminal>,
    }

    #[async_trait]
    impl Subscription for CancellingSubscription {
        async fn on_start(&mut self, _first: i64) -> Result<(), ChunkStoreError> {
            Ok(())
        }

        async fn on_next(&mut self, _chunk: Chunk) -> Result<bool, ChunkStoreError> {
            self.delivered += 1;
            self.cancel.cancel();
            Ok(true)
        }

        async fn completed(&mut self, last: i64) {
            self.terminal = Some(Terminal::Completed(last));
        }

        async fn stopped(&mut self, last: i64) {
            self.terminal = Some(Terminal::Stopped(last));
        }

        async fn on_error(&mut self, last: i64, error: &ChunkStoreError) {
            self.terminal = Some(Terminal::Errored(last, error.kind()));
        }
    }

    #[tokio::test]
    async fn cancellation_mid_scan_surfaces_through_on_error() {
        let store = MemoryChunkStore::builder()
            .with_simulator(Arc::new(FixedLatency::new(Duration::from_millis(1))))
            .build()
            .unwrap();

        for i in 1..=5 {
            append_event(&store, "p", None, &format!("e{i}"), None).await;
        }

        let cancel = CancellationToken::new();
        let mut sub = CancellingSubscription {
            cancel: cancel.clone(),
            delivered: 0,
            terminal: None,
        };
        store
            .read_forward(
                &PartitionId::from("p"),
                ChunkIndex::new(1),
                ChunkIndex::MAX,
                u64::MAX,
                &mut sub,
                &cancel,
            )
            .await
            .unwrap();

        assert_eq!(sub.delivered, 1);
        assert_eq!(
            sub.terminal,
            Some(Terminal::Errored(1, ChunkStoreErrorKind::Cancelled))
        );
    }

    /// A codec that tags stored payloads, to prove both hooks run at the
    /// storage boundary.
    #[derive(Debug)]
    struct PrefixCodec;

    impl PayloadCodec for PrefixCodec {
        fn encode(&self, payload: Option<&Bytes>) -> Result<Option<Bytes>, ChunkStoreError> {
            Ok(payload.map(|p| {
                let mut wire = vec![0x01];
                wire.extend_from_slice(p);
                Bytes::from(wire)
            }))
        }

        fn decode(&self, wire: Option<&Bytes>) -> Result<Option<Bytes>, ChunkStoreError> {
            wire.map(|w| match w.first() {
                Some(&0x01) => Ok(w.slice(1..)),
                other => Err(ChunkStoreError::invalid_data(format!(
                    "unknown payload tag {other:?}"
                ))),
            })
            .transpose()
        }
    }

    #[tokio::test]
    async fn codec_runs_on_both_sides_of_the_boundary() {
        let store = MemoryChunkStore::builder()
            .with_codec(Arc::new(PrefixCodec))
            .build()
            .unwrap();

        append_event(&store, "p", None, "e1", Some("op")).await;

        let chunk = store
            .read_single_backward(&PartitionId::from("p"), ChunkIndex::MAX, &token())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(chunk.payload().unwrap().as_ref(), b"e1");

        let mut recorder = Recorder::new();
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
        assert_eq!(recorder.chunks()[0].payload().unwrap().as_ref(), b"e1");

        // the filler payload also went through the codec (encode of None)
        store
            .append(
                &PartitionId::from("p"),
                Some(chunk.index()),
                Some(Bytes::from_static(b"e2")),
                None,
                &token(),
            )
            .await
            .unwrap();
        let mut all = Recorder::new();
        store
            .read_all(Position::FIRST, u64::MAX, &mut all, &token())
            .await
            .unwrap();
        let filler = all
            .chunks()
            .iter()
            .find(|c| c.is_filler())
            .expect("index conflict reserved a filler");
        assert!(filler.payload().is_none());
    }

    #[tokio::test]
    async fn random_latency_preserves_density_under_concurrency() {
        test_helpers::maybe_start_logging();

        let store = Arc::new(
            MemoryChunkStore::builder()
                .with_simulator(Arc::new(crate::sim::RandomLatency::new(
                    Duration::from_micros(10),
                    Duration::from_millis(2),
                )))
                .build()
                .unwrap(),
        );

        let tasks: Vec<_> = (0..4)
            .map(|w| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    for i in 0..10 {
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
        for task in tasks {
            task.await.unwrap();
        }

        let mut recorder = Recorder::new();
        store
            .read_all(Position::FIRST, u64::MAX, &mut recorder, &token())
            .await
            .unwrap();
        assert_eq!(recorder.positions(), (1..=40).collect::<Vec<_>>());
    }
}
