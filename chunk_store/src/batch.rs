//! Aggregation of concurrent appends into bulk inserts.

use std::{sync::Arc, time::Duration};

use observability_deps::tracing::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::core::{ChunkStoreError, Persistence, WriteJob, WriteOutcome};

/// Tuning for [`BatchingWriter`].
#[derive(Debug, Clone)]
pub struct BatchingWriterConfig {
    /// How long an append may linger waiting for companions before its batch
    /// is submitted anyway.
    pub linger: Duration,

    /// Submit as soon as this many jobs are pending.
    pub max_jobs: usize,
}

impl Default for BatchingWriterConfig {
    fn default() -> Self {
        Self {
            linger: Duration::from_millis(5),
            max_jobs: 128,
        }
    }
}

type PendingJob = (
    WriteJob,
    oneshot::Sender<Result<WriteOutcome, ChunkStoreError>>,
);

#[derive(Debug, Default)]
struct PendingBatch {
    jobs: Vec<PendingJob>,
    flush_scheduled: bool,
}

/// Aggregates concurrent [`append`](Self::append) calls into single
/// [`Persistence::append_batch`] round-trips.
///
/// An append call is pending until its batch is submitted: when the linger
/// time expires, when [`max_jobs`](BatchingWriterConfig::max_jobs) jobs have
/// accumulated, or when [`flush`](Self::flush) forces an early submission
/// (helpful for controlled shutdown). Cancellation governs the queue only;
/// whatever was accepted is still written during the final flush.
#[derive(Debug)]
pub struct BatchingWriter {
    store: Arc<dyn Persistence>,
    config: BatchingWriterConfig,
    pending: Arc<Mutex<PendingBatch>>,
    cancel: CancellationToken,
}

impl BatchingWriter {
    /// A writer over `store`.
    pub fn new(store: Arc<dyn Persistence>, config: BatchingWriterConfig) -> Self {
        Self {
            store,
            config,
            pending: Arc::new(Mutex::new(PendingBatch::default())),
            cancel: CancellationToken::new(),
        }
    }

    /// Queue one write and wait for its outcome.
    ///
    /// Duplicate outcomes are reported per job exactly as by
    /// [`Persistence::append_batch`]; a batch-level failure is fanned out to
    /// every caller that was in the batch.
    pub async fn append(&self, job: WriteJob) -> Result<WriteOutcome, ChunkStoreError> {
        if self.cancel.is_cancelled() {
            return Err(ChunkStoreError::cancelled());
        }

        let (tx, rx) = oneshot::channel();
        let submit_now = {
            let mut pending = self.pending.lock();
            pending.jobs.push((job, tx));

            if pending.jobs.len() >= self.config.max_jobs {
                true
            } else {
                if !pending.flush_scheduled {
                    pending.flush_scheduled = true;
                    let store = Arc::clone(&self.store);
                    let batch = Arc::clone(&self.pending);
                    let cancel = self.cancel.clone();
                    let linger = self.config.linger;
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = tokio::time::sleep(linger) => {}
                            _ = cancel.cancelled() => {}
                        }
                        Self::submit(store, batch).await;
                    });
                }
                false
            }
        };

        if submit_now {
            Self::submit(Arc::clone(&self.store), Arc::clone(&self.pending)).await;
        }

        rx.await
            .map_err(|_| ChunkStoreError::unknown("batching writer dropped the job unflushed"))?
    }

    /// Submit whatever is pending right now.
    pub async fn flush(&self) {
        Self::submit(Arc::clone(&self.store), Arc::clone(&self.pending)).await;
    }

    /// Stop accepting appends and submit the remainder.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.flush().await;
    }

    async fn submit(store: Arc<dyn Persistence>, pending: Arc<Mutex<PendingBatch>>) {
        let batch = {
            let mut pending = pending.lock();
            pending.flush_scheduled = false;
            std::mem::take(&mut pending.jobs)
        };
        if batch.is_empty() {
            return;
        }
        debug!(jobs = batch.len(), "submitting aggregated batch");

        let (jobs, senders): (Vec<_>, Vec<_>) = batch.into_iter().unzip();

        // the queue already enforced cancellation; the submission itself
        // always runs to completion
        match store.append_batch(jobs, &CancellationToken::new()).await {
            Ok(outcomes) => {
                for (sender, outcome) in senders.into_iter().zip(outcomes) {
                    // the caller may have given up waiting
                    let _ = sender.send(Ok(outcome));
                }
            }
            Err(e) => {
                warn!(%e, "aggregated batch failed - fanning the error out");
                let kind = e.kind();
                let message = e.to_string();
                for sender in senders {
                    let _ = sender.send(Err(ChunkStoreError::new(kind, message.clone())));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::test_utils::{append_event, expect_persisted, token},
        core::ChunkStoreErrorKind,
        mem::MemoryChunkStore,
        subscription::Recorder,
    };
    use bytes::Bytes;
    use data_types::{ChunkIndex, OperationId, PartitionId, Position};

    fn store() -> Arc<MemoryChunkStore> {
        Arc::new(MemoryChunkStore::builder().build().unwrap())
    }

    fn job(partition: &str, index: Option<i64>, payload: &str, operation: &str) -> WriteJob {
        WriteJob::new(
            partition,
            index.map(ChunkIndex::new),
            Some(Bytes::from(payload.to_string())),
            Some(OperationId::from(operation)),
        )
    }

    #[tokio::test]
    async fn concurrent_appends_share_one_batch() {
        test_helpers::maybe_start_logging();

        let store = store();
        let writer = Arc::new(BatchingWriter::new(
            Arc::clone(&store) as _,
            BatchingWriterConfig {
                linger: Duration::from_secs(30),
                max_jobs: 128,
            },
        ));

        let (o1, o2, o3, ()) = tokio::join!(
            writer.append(job("p", None, "e1", "o1")),
            writer.append(job("p", None, "e2", "o2")),
            writer.append(job("q", None, "e3", "o3")),
            async {
                // give the three appends a moment to enqueue, then force the
                // batch out well before the linger expires
                tokio::time::sleep(Duration::from_millis(100)).await;
                writer.flush().await;
            }
        );

        let mut positions = vec![
            expect_persisted(o1.unwrap()).position().get(),
            expect_persisted(o2.unwrap()).position().get(),
            expect_persisted(o3.unwrap()).position().get(),
        ];
        positions.sort_unstable();
        // one allocator call, contiguous range
        assert_eq!(positions, vec![1, 2, 3]);

        let mut recorder = Recorder::new();
        store
            .read_all(Position::FIRST, u64::MAX, &mut recorder, &token())
            .await
            .unwrap();
        assert_eq!(recorder.positions(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn size_cap_submits_without_flush() {
        let store = store();
        let writer = Arc::new(BatchingWriter::new(
            Arc::clone(&store) as _,
            BatchingWriterConfig {
                linger: Duration::from_secs(30),
                max_jobs: 2,
            },
        ));

        let first = {
            let writer = Arc::clone(&writer);
            tokio::spawn(async move { writer.append(job("p", None, "e1", "o1")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // the second job reaches the cap and triggers the submission
        let second = writer.append(job("p", None, "e2", "o2")).await.unwrap();
        let first = first.await.unwrap().unwrap();

        assert!(first.chunk().is_some());
        assert!(second.chunk().is_some());
    }

    #[tokio::test]
    async fn duplicates_are_mapped_to_their_callers() {
        let store = store();
        append_event(store.as_ref(), "s", Some(1), "seed", Some("o0")).await;

        let writer = Arc::new(BatchingWriter::new(
            Arc::clone(&store) as _,
            BatchingWriterConfig {
                linger: Duration::from_secs(30),
                max_jobs: 2,
            },
        ));

        let dup = {
            let writer = Arc::clone(&writer);
            tokio::spawn(async move { writer.append(job("s", Some(1), "x", "o1")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let fresh = writer.append(job("s", Some(2), "y", "o2")).await.unwrap();

        assert_eq!(
            dup.await.unwrap().unwrap(),
            WriteOutcome::DuplicateIndex {
                partition_id: PartitionId::from("s"),
                index: ChunkIndex::new(1),
            }
        );
        assert!(fresh.chunk().is_some());
    }

    #[tokio::test]
    async fn batch_failure_fans_out_to_every_caller() {
        let store = store();
        let writer = Arc::new(BatchingWriter::new(
            Arc::clone(&store) as _,
            BatchingWriterConfig {
                linger: Duration::from_secs(30),
                max_jobs: 2,
            },
        ));

        // one poisoned job fails the whole bulk insert
        let poisoned = {
            let writer = Arc::clone(&writer);
            tokio::spawn(async move {
                writer
                    .append(WriteJob::new(PartitionId::empty(), None, None, None))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let innocent = writer.append(job("p", None, "e1", "o1")).await;

        assert_eq!(
            poisoned.await.unwrap().unwrap_err().kind(),
            ChunkStoreErrorKind::InvalidInput
        );
        assert_eq!(
            innocent.unwrap_err().kind(),
            ChunkStoreErrorKind::InvalidInput
        );
    }

    #[tokio::test]
    async fn shutdown_flushes_the_queue_and_rejects_new_work() {
        let store = store();
        let writer = Arc::new(BatchingWriter::new(
            Arc::clone(&store) as _,
            BatchingWriterConfig {
                linger: Duration::from_secs(30),
                max_jobs: 128,
            },
        ));

        let parked = {
            let writer = Arc::clone(&writer);
            tokio::spawn(async move { writer.append(job("p", None, "e1", "o1")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        writer.shutdown().await;
        assert!(parked.await.unwrap().unwrap().chunk().is_some());

        let err = writer.append(job("p", None, "e2", "o2")).await.unwrap_err();
        assert_eq!(err.kind(), ChunkStoreErrorKind::Cancelled);
    }
}
