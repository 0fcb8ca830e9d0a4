//! Thin per-partition façade over the persistence contract.

use bytes::Bytes;
use data_types::{ChunkIndex, OperationId, PartitionId};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::{
    core::{ChunkStoreError, Persistence, WriteOutcome},
    subscription::Subscription,
};

/// Hands out partition-bound stream handles.
///
/// Holds nothing beyond the backend handle: streams are value-typed and
/// nothing is cached or created by opening one.
#[derive(Debug, Clone)]
pub struct Streams {
    store: Arc<dyn Persistence>,
}

impl Streams {
    /// A factory over `store`.
    pub fn new(store: Arc<dyn Persistence>) -> Self {
        Self { store }
    }

    /// A handle on one partition.
    pub fn open(&self, partition_id: impl Into<PartitionId>) -> PartitionStream {
        PartitionStream {
            partition_id: partition_id.into(),
            store: Arc::clone(&self.store),
        }
    }
}

/// A partition-bound view of the store. All real work happens in the
/// backend.
#[derive(Debug, Clone)]
pub struct PartitionStream {
    partition_id: PartitionId,
    store: Arc<dyn Persistence>,
}

impl PartitionStream {
    /// The partition this stream is bound to.
    pub fn partition_id(&self) -> &PartitionId {
        &self.partition_id
    }

    /// Streams produced by [`Streams::open`] accept writes.
    pub fn is_writable(&self) -> bool {
        true
    }

    /// Append one chunk with an auto-assigned index.
    pub async fn append(
        &self,
        payload: Option<Bytes>,
        operation_id: Option<OperationId>,
        cancel: &CancellationToken,
    ) -> Result<WriteOutcome, ChunkStoreError> {
        self.store
            .append(&self.partition_id, None, payload, operation_id, cancel)
            .await
    }

    /// Deliver this partition's chunks with index in
    /// `[from_index_inclusive, to_index_inclusive]`, ascending, unbounded.
    pub async fn read(
        &self,
        from_index_inclusive: ChunkIndex,
        to_index_inclusive: ChunkIndex,
        subscription: &mut dyn Subscription,
        cancel: &CancellationToken,
    ) -> Result<(), ChunkStoreError> {
        self.store
            .read_forward(
                &self.partition_id,
                from_index_inclusive,
                to_index_inclusive,
                u64::MAX,
                subscription,
                cancel,
            )
            .await
    }

    /// Mark every chunk of this partition deleted.
    pub async fn delete_all(&self, cancel: &CancellationToken) -> Result<(), ChunkStoreError> {
        self.store
            .delete(
                &self.partition_id,
                ChunkIndex::new(0),
                ChunkIndex::MAX,
                cancel,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::test_utils::{expect_persisted, token},
        core::ChunkStoreErrorKind,
        mem::MemoryChunkStore,
        subscription::{Recorder, Terminal},
    };
    use data_types::Position;

    fn streams() -> Streams {
        let store = Arc::new(MemoryChunkStore::builder().build().unwrap());
        Streams::new(store as _)
    }

    #[tokio::test]
    async fn facade_round_trip() {
        let streams = streams();
        let stream = streams.open("acct-1");
        assert_eq!(stream.partition_id(), &PartitionId::from("acct-1"));
        assert!(stream.is_writable());

        let c1 = expect_persisted(
            stream
                .append(Some(Bytes::from_static(b"e1")), None, &token())
                .await
                .unwrap(),
        );
        let c2 = expect_persisted(
            stream
                .append(
                    Some(Bytes::from_static(b"e2")),
                    Some(OperationId::from("op-2")),
                    &token(),
                )
                .await
                .unwrap(),
        );
        assert_eq!(c1.position(), Position::new(1));
        assert_eq!(c2.index(), ChunkIndex::new(2));

        let mut recorder = Recorder::new();
        stream
            .read(ChunkIndex::new(1), ChunkIndex::MAX, &mut recorder, &token())
            .await
            .unwrap();
        assert_eq!(recorder.indexes(), vec![1, 2]);
        assert_eq!(recorder.terminal(), Some(Terminal::Completed(2)));
    }

    #[tokio::test]
    async fn two_handles_see_the_same_partition() {
        let streams = streams();
        let writer = streams.open("p");
        let reader = streams.open("p");

        writer
            .append(Some(Bytes::from_static(b"e1")), None, &token())
            .await
            .unwrap();

        let mut recorder = Recorder::new();
        reader
            .read(ChunkIndex::new(1), ChunkIndex::MAX, &mut recorder, &token())
            .await
            .unwrap();
        assert_eq!(recorder.chunks().len(), 1);
    }

    #[tokio::test]
    async fn delete_all_empties_the_stream() {
        let streams = streams();
        let stream = streams.open("p");

        for payload in [&b"e1"[..], b"e2", b"e3"] {
            stream
                .append(Some(Bytes::copy_from_slice(payload)), None, &token())
                .await
                .unwrap();
        }

        stream.delete_all(&token()).await.unwrap();

        let mut recorder = Recorder::new();
        stream
            .read(ChunkIndex::new(1), ChunkIndex::MAX, &mut recorder, &token())
            .await
            .unwrap();
        assert!(recorder.chunks().is_empty());
        assert_eq!(recorder.terminal(), Some(Terminal::Stopped(1)));

        // nothing left to delete
        let err = stream.delete_all(&token()).await.unwrap_err();
        assert_eq!(err.kind(), ChunkStoreErrorKind::DeleteTargetNotFound);
    }

    #[tokio::test]
    async fn duplicate_operation_reported_through_the_facade() {
        let streams = streams();
        let stream = streams.open("p");

        stream
            .append(
                Some(Bytes::from_static(b"e1")),
                Some(OperationId::from("op")),
                &token(),
            )
            .await
            .unwrap();
        let outcome = stream
            .append(
                Some(Bytes::from_static(b"e2")),
                Some(OperationId::from("op")),
                &token(),
            )
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::DuplicateOperation);
    }
}
