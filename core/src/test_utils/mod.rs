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

//! In-memory collaborators for tests: a [`MemoryTable`] implementing every
//! table-side trait, with counters and fault injection, plus a trivial
//! [`LexicographicSorter`] standing in for the external sort.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use itertools::Itertools;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::io::IoManager;
use crate::predicate::PartitionPredicate;
use crate::sort::{RowSorter, SortSpec};
use crate::table::{
    BatchTableWrite, BatchWriteBuilder, BucketMode, CommitMessage, DataSplit, FileMeta,
    FileStoreTable, PartitionKey, RowData, RowStream, StoreWrite, TableCommit,
};
use crate::task::CompactionTask;
use crate::{CompactionError, Result};

#[derive(Default)]
struct TableState {
    snapshot_id: u64,
    partitions: BTreeMap<PartitionKey, PartitionState>,
}

#[derive(Default)]
struct PartitionState {
    spec: Vec<(String, String)>,
    buckets: BTreeMap<u32, Vec<FileMeta>>,
    rows: Vec<RowData>,
}

struct Inner {
    name: String,
    bucket_mode: BucketMode,
    partition_columns: Vec<String>,
    state: Mutex<TableState>,
    write_only: AtomicBool,
    scan_count: AtomicUsize,
    compact_calls: AtomicUsize,
    commit_attempts: AtomicUsize,
    writes_opened: AtomicUsize,
    writes_closed: AtomicUsize,
    pending_commit_conflicts: AtomicU32,
    fail_commits: AtomicBool,
    fail_compact_on: Mutex<Option<(PartitionKey, u32)>>,
    store_write_identities: Mutex<Vec<String>>,
    commit_identities: Mutex<Vec<String>>,
}

/// In-memory bucketed table. Tables start write-only, like freshly opened
/// handles; the procedure re-opens them via `for_compaction`.
pub struct MemoryTable {
    inner: Arc<Inner>,
}

impl MemoryTable {
    pub fn new(name: &str, bucket_mode: BucketMode, partition_columns: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(Inner {
                name: name.to_owned(),
                bucket_mode,
                partition_columns: partition_columns.iter().map(|c| (*c).to_owned()).collect(),
                state: Mutex::new(TableState::default()),
                write_only: AtomicBool::new(true),
                scan_count: AtomicUsize::new(0),
                compact_calls: AtomicUsize::new(0),
                commit_attempts: AtomicUsize::new(0),
                writes_opened: AtomicUsize::new(0),
                writes_closed: AtomicUsize::new(0),
                pending_commit_conflicts: AtomicU32::new(0),
                fail_commits: AtomicBool::new(false),
                fail_compact_on: Mutex::new(None),
                store_write_identities: Mutex::new(Vec::new()),
                commit_identities: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Encodes partition values the way this table keys its partitions.
    pub fn partition_key(spec: &[(&str, &str)]) -> PartitionKey {
        let encoded = spec.iter().map(|(k, v)| format!("{k}={v}")).join("/");
        PartitionKey::new(encoded.into_bytes())
    }

    fn owned_spec(spec: &[(&str, &str)]) -> Vec<(String, String)> {
        spec.iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    pub async fn add_files(&self, spec: &[(&str, &str)], bucket: u32, files: Vec<FileMeta>) {
        let key = Self::partition_key(spec);
        let mut state = self.inner.state.lock().await;
        let partition = state.partitions.entry(key).or_default();
        partition.spec = Self::owned_spec(spec);
        partition.buckets.entry(bucket).or_default().extend(files);
    }

    pub async fn add_rows(&self, spec: &[(&str, &str)], rows: Vec<RowData>) {
        let key = Self::partition_key(spec);
        let mut state = self.inner.state.lock().await;
        let partition = state.partitions.entry(key).or_default();
        partition.spec = Self::owned_spec(spec);
        partition.rows.extend(rows);
    }

    pub async fn snapshot_id(&self) -> u64 {
        self.inner.state.lock().await.snapshot_id
    }

    pub async fn bucket_files(&self, spec: &[(&str, &str)], bucket: u32) -> Vec<FileMeta> {
        let key = Self::partition_key(spec);
        let state = self.inner.state.lock().await;
        state
            .partitions
            .get(&key)
            .and_then(|partition| partition.buckets.get(&bucket))
            .cloned()
            .unwrap_or_default()
    }

    pub async fn partition_rows(&self, spec: &[(&str, &str)]) -> Vec<RowData> {
        let key = Self::partition_key(spec);
        let state = self.inner.state.lock().await;
        state
            .partitions
            .get(&key)
            .map(|partition| partition.rows.clone())
            .unwrap_or_default()
    }

    pub fn scan_count(&self) -> usize {
        self.inner.scan_count.load(Ordering::SeqCst)
    }

    pub fn compact_calls(&self) -> usize {
        self.inner.compact_calls.load(Ordering::SeqCst)
    }

    pub fn commit_attempts(&self) -> usize {
        self.inner.commit_attempts.load(Ordering::SeqCst)
    }

    pub fn writes_opened(&self) -> usize {
        self.inner.writes_opened.load(Ordering::SeqCst)
    }

    pub fn writes_closed(&self) -> usize {
        self.inner.writes_closed.load(Ordering::SeqCst)
    }

    /// The next `count` commit attempts are rejected as concurrent-writer
    /// conflicts, which the commit manager may retry.
    pub fn inject_commit_conflicts(&self, count: u32) {
        self.inner
            .pending_commit_conflicts
            .store(count, Ordering::SeqCst);
    }

    /// Every commit attempt fails permanently.
    pub fn fail_all_commits(&self) {
        self.inner.fail_commits.store(true, Ordering::SeqCst);
    }

    /// Compacting the given `(partition, bucket)` fails inside the worker.
    pub async fn fail_compaction_of(&self, spec: &[(&str, &str)], bucket: u32) {
        *self.inner.fail_compact_on.lock().await = Some((Self::partition_key(spec), bucket));
    }

    pub async fn store_write_identities(&self) -> Vec<String> {
        self.inner.store_write_identities.lock().await.clone()
    }

    pub async fn commit_identities(&self) -> Vec<String> {
        self.inner.commit_identities.lock().await.clone()
    }
}

#[async_trait]
impl FileStoreTable for MemoryTable {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn bucket_mode(&self) -> BucketMode {
        self.inner.bucket_mode
    }

    fn for_compaction(self: Arc<Self>) -> Arc<dyn FileStoreTable> {
        self.inner.write_only.store(false, Ordering::SeqCst);
        self
    }

    async fn scan_splits(&self, filter: Option<&PartitionPredicate>) -> Result<Vec<DataSplit>> {
        self.inner.scan_count.fetch_add(1, Ordering::SeqCst);
        let state = self.inner.state.lock().await;
        let mut splits = Vec::new();
        for (key, partition) in &state.partitions {
            if let Some(filter) = filter {
                if !filter.matches_pairs(&partition.spec) {
                    continue;
                }
            }
            for (bucket, files) in &partition.buckets {
                // one split per file, so duplicated (partition, bucket)
                // pairs reach the decomposer
                for _ in files {
                    splits.push(DataSplit {
                        partition: key.clone(),
                        bucket: *bucket,
                    });
                }
            }
        }
        Ok(splits)
    }

    async fn plan_compaction(
        &self,
        _full_rewrite: bool,
        filter: Option<&PartitionPredicate>,
    ) -> Result<Vec<CompactionTask>> {
        self.inner.scan_count.fetch_add(1, Ordering::SeqCst);
        let state = self.inner.state.lock().await;
        let mut tasks = Vec::new();
        for (key, partition) in &state.partitions {
            if let Some(filter) = filter {
                if !filter.matches_pairs(&partition.spec) {
                    continue;
                }
            }
            // unaware tables keep all files in one unbucketed slot
            let files = partition.buckets.get(&0).cloned().unwrap_or_default();
            if files.len() >= 2 {
                tasks.push(CompactionTask::new(key.clone(), files));
            }
        }
        Ok(tasks)
    }

    fn new_batch_write_builder(&self) -> Arc<dyn BatchWriteBuilder> {
        Arc::new(MemoryWriteBuilder {
            inner: self.inner.clone(),
        })
    }

    async fn new_store_write(&self, commit_identity: &str) -> Result<Box<dyn StoreWrite>> {
        self.inner
            .store_write_identities
            .lock()
            .await
            .push(commit_identity.to_owned());
        self.inner.writes_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryStoreWrite {
            inner: self.inner.clone(),
            closed: false,
        }))
    }

    async fn new_commit(&self, commit_identity: &str) -> Result<Box<dyn TableCommit>> {
        self.inner
            .commit_identities
            .lock()
            .await
            .push(commit_identity.to_owned());
        Ok(Box::new(MemoryTableCommit {
            inner: self.inner.clone(),
        }))
    }

    async fn read_rows(&self, filter: Option<&PartitionPredicate>) -> Result<RowStream> {
        let state = self.inner.state.lock().await;
        let mut rows = Vec::new();
        for partition in state.partitions.values() {
            for row in &partition.rows {
                let selected = filter.is_none_or(|f| f.matches_row(row));
                if selected {
                    rows.push(row.clone());
                }
            }
        }
        Ok(stream::iter(rows.into_iter().map(Ok)).boxed())
    }

    async fn overwrite_dynamic(&self, rows: RowStream) -> Result<()> {
        let rows: Vec<RowData> = rows.try_collect().await?;
        let mut grouped: BTreeMap<PartitionKey, (Vec<(String, String)>, Vec<RowData>)> =
            BTreeMap::new();
        for row in rows {
            let spec: Vec<(String, String)> = self
                .inner
                .partition_columns
                .iter()
                .map(|column| {
                    (
                        column.clone(),
                        row.get(column).unwrap_or_default().to_owned(),
                    )
                })
                .collect();
            let encoded = spec.iter().map(|(k, v)| format!("{k}={v}")).join("/");
            let key = PartitionKey::new(encoded.into_bytes());
            grouped.entry(key).or_insert_with(|| (spec, Vec::new())).1.push(row);
        }

        // one transaction: replace exactly the partitions present in the stream
        let mut state = self.inner.state.lock().await;
        let next_snapshot = state.snapshot_id + 1;
        for (key, (spec, rows)) in grouped {
            let file = FileMeta::new(
                format!("sorted-{next_snapshot}-{key}"),
                rows.len() as u64 * 64,
                rows.len() as u64,
            );
            let partition = state.partitions.entry(key).or_default();
            partition.spec = spec;
            partition.rows = rows;
            partition.buckets = BTreeMap::from([(0, vec![file])]);
        }
        state.snapshot_id = next_snapshot;
        Ok(())
    }
}

struct MemoryWriteBuilder {
    inner: Arc<Inner>,
}

#[async_trait]
impl BatchWriteBuilder for MemoryWriteBuilder {
    async fn new_write(&self, _io_manager: &IoManager) -> Result<Box<dyn BatchTableWrite>> {
        if self.inner.write_only.load(Ordering::SeqCst) {
            return Err(CompactionError::Execution(
                "write-only table handle cannot compact".to_owned(),
            ));
        }
        self.inner.writes_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryBatchWrite {
            inner: self.inner.clone(),
            pending: Vec::new(),
            closed: false,
        }))
    }
}

struct MemoryBatchWrite {
    inner: Arc<Inner>,
    pending: Vec<CommitMessage>,
    closed: bool,
}

#[async_trait]
impl BatchTableWrite for MemoryBatchWrite {
    async fn compact(&mut self, partition: &PartitionKey, bucket: u32, _full: bool) -> Result<()> {
        self.inner.compact_calls.fetch_add(1, Ordering::SeqCst);
        if let Some((fail_partition, fail_bucket)) = &*self.inner.fail_compact_on.lock().await {
            if fail_partition == partition && *fail_bucket == bucket {
                return Err(CompactionError::Execution(format!(
                    "injected merge failure for {partition} bucket {bucket}"
                )));
            }
        }

        let state = self.inner.state.lock().await;
        let files = state
            .partitions
            .get(partition)
            .and_then(|p| p.buckets.get(&bucket))
            .cloned()
            .unwrap_or_default();
        drop(state);

        if files.len() <= 1 {
            // already compact, nothing to rewrite
            return Ok(());
        }
        let merged = FileMeta::new(
            format!("compacted-{}", Uuid::new_v4()),
            files.iter().map(|f| f.file_size).sum(),
            files.iter().map(|f| f.row_count).sum(),
        );
        self.pending.push(CommitMessage {
            partition: partition.clone(),
            bucket: Some(bucket),
            compact_before: files,
            compact_after: vec![merged],
        });
        Ok(())
    }

    async fn prepare_commit(&mut self) -> Result<Vec<CommitMessage>> {
        Ok(std::mem::take(&mut self.pending))
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.inner.writes_closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

struct MemoryStoreWrite {
    inner: Arc<Inner>,
    closed: bool,
}

#[async_trait]
impl StoreWrite for MemoryStoreWrite {
    async fn compact_task(&mut self, task: &CompactionTask) -> Result<CommitMessage> {
        let merged = FileMeta::new(
            format!("compacted-{}", Uuid::new_v4()),
            task.compact_before.iter().map(|f| f.file_size).sum(),
            task.compact_before.iter().map(|f| f.row_count).sum(),
        );
        Ok(CommitMessage {
            partition: task.partition.clone(),
            bucket: None,
            compact_before: task.compact_before.clone(),
            compact_after: vec![merged],
        })
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.inner.writes_closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

struct MemoryTableCommit {
    inner: Arc<Inner>,
}

#[async_trait]
impl TableCommit for MemoryTableCommit {
    async fn commit(&mut self, messages: Vec<CommitMessage>) -> Result<()> {
        self.inner.commit_attempts.fetch_add(1, Ordering::SeqCst);
        if self.inner.fail_commits.load(Ordering::SeqCst) {
            return Err(CompactionError::commit("injected transaction log failure"));
        }
        let injected_conflict = self
            .inner
            .pending_commit_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected_conflict {
            return Err(CompactionError::commit_conflict(
                "injected concurrent writer conflict",
            ));
        }

        let mut state = self.inner.state.lock().await;
        // validate first so a bad message leaves the snapshot untouched
        for message in &messages {
            let bucket = message.bucket.unwrap_or(0);
            let files = state
                .partitions
                .get(&message.partition)
                .and_then(|p| p.buckets.get(&bucket))
                .ok_or_else(|| {
                    CompactionError::commit_conflict(format!(
                        "unknown partition {} bucket {bucket}",
                        message.partition
                    ))
                })?;
            for removed in &message.compact_before {
                if !files.contains(removed) {
                    return Err(CompactionError::commit_conflict(format!(
                        "file {} vanished before commit",
                        removed.file_name
                    )));
                }
            }
        }
        for message in messages {
            let bucket = message.bucket.unwrap_or(0);
            if let Some(files) = state
                .partitions
                .get_mut(&message.partition)
                .and_then(|p| p.buckets.get_mut(&bucket))
            {
                files.retain(|file| !message.compact_before.contains(file));
                files.extend(message.compact_after);
            }
        }
        state.snapshot_id += 1;
        Ok(())
    }
}

/// Plain lexicographic stand-in for the external sort implementation. Treats
/// every strategy the same; sort semantics are not under test here.
pub struct LexicographicSorter;

#[async_trait]
impl RowSorter for LexicographicSorter {
    async fn sort(&self, spec: &SortSpec, rows: RowStream) -> Result<RowStream> {
        let mut rows: Vec<RowData> = rows.try_collect().await?;
        let columns = spec.columns.clone();
        rows.sort_by(|a, b| {
            columns
                .iter()
                .fold(CmpOrdering::Equal, |order, column| {
                    order.then_with(|| a.get(column).cmp(&b.get(column)))
                })
        });
        Ok(stream::iter(rows.into_iter().map(Ok)).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_only_handle_rejects_compaction_writes() {
        let table = MemoryTable::new("orders", BucketMode::Fixed, &["p"]);
        let io_manager = IoManager::new().unwrap();
        let builder = table.new_batch_write_builder();
        let err = match builder.new_write(&io_manager).await {
            Ok(_) => panic!("write-only handle must not open a compaction write"),
            Err(e) => e,
        };
        assert!(matches!(err, CompactionError::Execution(_)), "{err}");

        let opened = table.clone().for_compaction();
        drop(opened);
        assert!(builder.new_write(&io_manager).await.is_ok());
    }

    #[tokio::test]
    async fn test_commit_is_atomic_across_messages() {
        let table = MemoryTable::new("orders", BucketMode::Fixed, &["p"]);
        table
            .add_files(&[("p", "1")], 0, vec![FileMeta::new("a.orc", 1, 1)])
            .await;
        let snapshot_before = table.snapshot_id().await;

        let good = CommitMessage {
            partition: MemoryTable::partition_key(&[("p", "1")]),
            bucket: Some(0),
            compact_before: vec![FileMeta::new("a.orc", 1, 1)],
            compact_after: vec![FileMeta::new("merged.orc", 1, 1)],
        };
        let bad = CommitMessage {
            partition: MemoryTable::partition_key(&[("p", "1")]),
            bucket: Some(0),
            compact_before: vec![FileMeta::new("missing.orc", 1, 1)],
            compact_after: vec![],
        };
        let mut commit = table.new_commit("test-commit").await.unwrap();
        let err = commit.commit(vec![good, bad]).await.unwrap_err();
        assert!(err.is_retryable());

        assert_eq!(table.snapshot_id().await, snapshot_before);
        assert_eq!(
            table.bucket_files(&[("p", "1")], 0).await,
            vec![FileMeta::new("a.orc", 1, 1)],
            "no message from a failed commit is applied"
        );
    }
}
