/*
 * Copyright 2025 bucketloom
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Distributed scatter/gather execution.
//!
//! Units of work are fed through a bounded queue to a pool of workers. Each
//! worker opens a scoped context, drains units, and pushes its fragments into
//! a result channel; the coordinator blocks on the join barrier and only sees
//! the fragment union once every worker has returned. Any worker failure
//! fails the whole job; the failed attempt's fragments are discarded.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};

use crate::config::CompactionConfig;
use crate::io::IoManager;
use crate::table::{BatchTableWrite, BatchWriteBuilder, CommitMessage, FileStoreTable, PartitionKey, StoreWrite};
use crate::task::CompactionTaskSerializer;
use crate::{CompactionError, Result};

/// The atom of distribution. Units are independent; no unit depends on the
/// output of another within the same job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkUnit {
    /// An existing physical shard of an assigned-bucket table.
    AssignedBucket { partition: PartitionKey, bucket: u32 },
    /// A pre-planned merge for an unaware-bucket table, shipped encoded.
    PlannedTask { encoded: Vec<u8> },
}

/// Scoped execution state owned by exactly one worker.
#[async_trait]
pub trait WorkerContext: Send {
    async fn execute(&mut self, unit: WorkUnit) -> Result<()>;

    /// Called once after the worker drains its units; returns the worker's
    /// fragments. A worker that fails earlier never reaches this point, so
    /// no partial fragment set leaks out of it.
    async fn finish(&mut self) -> Result<Vec<CommitMessage>>;

    /// Releases the context. Runs on every exit path, including failures.
    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
pub trait WorkerContextFactory: Send + Sync + 'static {
    async fn open(&self) -> Result<Box<dyn WorkerContext>>;
}

pub struct DistributedExecutor {
    worker_parallelism: usize,
    work_queue_capacity: usize,
}

impl DistributedExecutor {
    pub fn new(config: &CompactionConfig) -> Self {
        Self {
            worker_parallelism: config.worker_parallelism.max(1),
            work_queue_capacity: config.work_queue_capacity.max(1),
        }
    }

    /// Fans `units` out across the worker pool and gathers every fragment.
    ///
    /// Returns the union of all worker fragments if and only if every worker
    /// completes; otherwise the first failure, with no partial set.
    pub async fn execute(
        &self,
        units: Vec<WorkUnit>,
        factory: Arc<dyn WorkerContextFactory>,
    ) -> Result<Vec<CommitMessage>> {
        if units.is_empty() {
            return Ok(Vec::new());
        }

        let worker_count = self.worker_parallelism.min(units.len());
        let (unit_tx, unit_rx) = mpsc::channel::<WorkUnit>(self.work_queue_capacity);
        let unit_rx = Arc::new(Mutex::new(unit_rx));
        let (fragment_tx, mut fragment_rx) = mpsc::unbounded_channel::<CommitMessage>();

        let mut handles = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let factory = factory.clone();
            let unit_rx = unit_rx.clone();
            let fragment_tx = fragment_tx.clone();
            handles.push(tokio::spawn(async move {
                run_worker(worker_id, factory, unit_rx, fragment_tx).await
            }));
        }
        drop(fragment_tx);
        // only workers may keep the queue receiver alive, otherwise feeding
        // a dead pool would block forever instead of erroring out
        drop(unit_rx);

        for unit in units {
            if unit_tx.send(unit).await.is_err() {
                // every worker already exited; the join below reports why
                break;
            }
        }
        drop(unit_tx);

        // Join barrier: wait for every worker, even after a failure, so all
        // scoped contexts are released before this call returns.
        let mut failure: Option<CompactionError> = None;
        for handle in handles {
            let worker_result = match handle.await {
                Ok(result) => result,
                Err(join_error) => Err(CompactionError::Execution(format!(
                    "worker panicked: {join_error}"
                ))),
            };
            if let Err(e) = worker_result {
                tracing::warn!(error = %e, "compaction worker failed");
                failure = Some(failure.unwrap_or(e));
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }

        let mut fragments = Vec::new();
        while let Ok(message) = fragment_rx.try_recv() {
            fragments.push(message);
        }
        Ok(fragments)
    }
}

async fn run_worker(
    worker_id: usize,
    factory: Arc<dyn WorkerContextFactory>,
    unit_rx: Arc<Mutex<mpsc::Receiver<WorkUnit>>>,
    fragment_tx: mpsc::UnboundedSender<CommitMessage>,
) -> Result<()> {
    let mut context = factory.open().await?;
    let drained = drain_units(context.as_mut(), &unit_rx, &fragment_tx).await;
    let closed = context.close().await;
    if let Err(e) = &closed {
        tracing::warn!(worker_id, error = %e, "failed to release worker context");
    }
    drained.and(closed)
}

async fn drain_units(
    context: &mut dyn WorkerContext,
    unit_rx: &Mutex<mpsc::Receiver<WorkUnit>>,
    fragment_tx: &mpsc::UnboundedSender<CommitMessage>,
) -> Result<()> {
    loop {
        let unit = { unit_rx.lock().await.recv().await };
        let Some(unit) = unit else {
            break;
        };
        context.execute(unit).await?;
    }
    for message in context.finish().await? {
        fragment_tx.send(message).map_err(|_| {
            CompactionError::Execution("fragment channel closed before workers finished".to_owned())
        })?;
    }
    Ok(())
}

/// Worker contexts for assigned-bucket units: one write handle plus a local
/// I/O manager, both released when the worker exits.
pub struct AssignedBucketContextFactory {
    write_builder: Arc<dyn BatchWriteBuilder>,
}

impl AssignedBucketContextFactory {
    pub fn new(write_builder: Arc<dyn BatchWriteBuilder>) -> Self {
        Self { write_builder }
    }
}

#[async_trait]
impl WorkerContextFactory for AssignedBucketContextFactory {
    async fn open(&self) -> Result<Box<dyn WorkerContext>> {
        let mut io_manager = IoManager::new()?;
        let write = match self.write_builder.new_write(&io_manager).await {
            Ok(write) => write,
            Err(e) => {
                io_manager.close()?;
                return Err(e);
            }
        };
        Ok(Box::new(AssignedBucketContext { io_manager, write }))
    }
}

struct AssignedBucketContext {
    io_manager: IoManager,
    write: Box<dyn BatchTableWrite>,
}

#[async_trait]
impl WorkerContext for AssignedBucketContext {
    async fn execute(&mut self, unit: WorkUnit) -> Result<()> {
        match unit {
            WorkUnit::AssignedBucket { partition, bucket } => {
                self.write.compact(&partition, bucket, true).await
            }
            WorkUnit::PlannedTask { .. } => Err(CompactionError::Execution(
                "planned task routed to an assigned-bucket worker".to_owned(),
            )),
        }
    }

    async fn finish(&mut self) -> Result<Vec<CommitMessage>> {
        self.write.prepare_commit().await
    }

    async fn close(&mut self) -> Result<()> {
        let write_closed = self.write.close().await;
        let io_closed = self.io_manager.close();
        write_closed.and(io_closed)
    }
}

/// Worker contexts for unaware-bucket units: a low-level store write keyed by
/// the single commit identity shared by the whole job.
pub struct PlannedTaskContextFactory {
    table: Arc<dyn FileStoreTable>,
    commit_identity: String,
}

impl PlannedTaskContextFactory {
    pub fn new(table: Arc<dyn FileStoreTable>, commit_identity: String) -> Self {
        Self {
            table,
            commit_identity,
        }
    }
}

#[async_trait]
impl WorkerContextFactory for PlannedTaskContextFactory {
    async fn open(&self) -> Result<Box<dyn WorkerContext>> {
        let write = self.table.new_store_write(&self.commit_identity).await?;
        Ok(Box::new(PlannedTaskContext {
            write,
            serializer: CompactionTaskSerializer,
            fragments: Vec::new(),
        }))
    }
}

struct PlannedTaskContext {
    write: Box<dyn StoreWrite>,
    serializer: CompactionTaskSerializer,
    fragments: Vec<CommitMessage>,
}

#[async_trait]
impl WorkerContext for PlannedTaskContext {
    async fn execute(&mut self, unit: WorkUnit) -> Result<()> {
        match unit {
            WorkUnit::PlannedTask { encoded } => {
                let task = self.serializer.deserialize(&encoded)?;
                let message = task.do_compact(self.write.as_mut()).await?;
                self.fragments.push(message);
                Ok(())
            }
            WorkUnit::AssignedBucket { .. } => Err(CompactionError::Execution(
                "assigned-bucket unit routed to a planned-task worker".to_owned(),
            )),
        }
    }

    async fn finish(&mut self) -> Result<Vec<CommitMessage>> {
        Ok(std::mem::take(&mut self.fragments))
    }

    async fn close(&mut self) -> Result<()> {
        self.write.close().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct StubFactory {
        opened: Arc<AtomicUsize>,
        closed: Arc<AtomicUsize>,
        poison_bucket: Option<u32>,
    }

    impl StubFactory {
        fn new(poison_bucket: Option<u32>) -> Self {
            Self {
                opened: Arc::new(AtomicUsize::new(0)),
                closed: Arc::new(AtomicUsize::new(0)),
                poison_bucket,
            }
        }
    }

    #[async_trait]
    impl WorkerContextFactory for StubFactory {
        async fn open(&self) -> Result<Box<dyn WorkerContext>> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(StubContext {
                closed: self.closed.clone(),
                poison_bucket: self.poison_bucket,
                fragments: Vec::new(),
            }))
        }
    }

    struct StubContext {
        closed: Arc<AtomicUsize>,
        poison_bucket: Option<u32>,
        fragments: Vec<CommitMessage>,
    }

    #[async_trait]
    impl WorkerContext for StubContext {
        async fn execute(&mut self, unit: WorkUnit) -> Result<()> {
            let WorkUnit::AssignedBucket { partition, bucket } = unit else {
                panic!("stub only handles assigned buckets");
            };
            if self.poison_bucket == Some(bucket) {
                return Err(CompactionError::Execution("injected merge failure".to_owned()));
            }
            self.fragments.push(CommitMessage {
                partition,
                bucket: Some(bucket),
                compact_before: Vec::new(),
                compact_after: Vec::new(),
            });
            Ok(())
        }

        async fn finish(&mut self) -> Result<Vec<CommitMessage>> {
            Ok(std::mem::take(&mut self.fragments))
        }

        async fn close(&mut self) -> Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn units(count: u32) -> Vec<WorkUnit> {
        (0..count)
            .map(|bucket| WorkUnit::AssignedBucket {
                partition: PartitionKey::new(b"p=1".to_vec()),
                bucket,
            })
            .collect()
    }

    fn executor(parallelism: usize) -> DistributedExecutor {
        let config = CompactionConfig::builder()
            .worker_parallelism(parallelism)
            .work_queue_capacity(2usize)
            .build()
            .unwrap();
        DistributedExecutor::new(&config)
    }

    fn sorted_buckets(fragments: &[CommitMessage]) -> Vec<u32> {
        let mut buckets: Vec<u32> = fragments.iter().filter_map(|m| m.bucket).collect();
        buckets.sort_unstable();
        buckets
    }

    #[tokio::test]
    async fn test_empty_unit_list_is_noop() {
        let factory = Arc::new(StubFactory::new(None));
        let fragments = executor(4).execute(Vec::new(), factory.clone()).await.unwrap();
        assert!(fragments.is_empty());
        assert_eq!(factory.opened.load(Ordering::SeqCst), 0, "no workers spawned");
    }

    #[tokio::test]
    async fn test_every_unit_executed_exactly_once() {
        let factory = Arc::new(StubFactory::new(None));
        let fragments = executor(3).execute(units(10), factory.clone()).await.unwrap();
        assert_eq!(sorted_buckets(&fragments), (0..10).collect::<Vec<_>>());
        assert_eq!(
            factory.opened.load(Ordering::SeqCst),
            factory.closed.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn test_fragment_union_independent_of_worker_count() {
        let single = executor(1)
            .execute(units(7), Arc::new(StubFactory::new(None)))
            .await
            .unwrap();
        let many = executor(4)
            .execute(units(7), Arc::new(StubFactory::new(None)))
            .await
            .unwrap();
        assert_eq!(sorted_buckets(&single), sorted_buckets(&many));
    }

    #[tokio::test]
    async fn test_worker_failure_fails_job_and_releases_contexts() {
        let factory = Arc::new(StubFactory::new(Some(5)));
        let err = executor(3).execute(units(10), factory.clone()).await.unwrap_err();
        assert!(matches!(err, CompactionError::Execution(_)), "{err}");
        assert_eq!(
            factory.opened.load(Ordering::SeqCst),
            factory.closed.load(Ordering::SeqCst),
            "every opened context must be released"
        );
    }

    #[tokio::test]
    async fn test_more_workers_than_units() {
        let factory = Arc::new(StubFactory::new(None));
        let fragments = executor(8).execute(units(2), factory.clone()).await.unwrap();
        assert_eq!(sorted_buckets(&fragments), vec![0, 1]);
        assert!(factory.opened.load(Ordering::SeqCst) <= 2);
    }
}
