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

//! Data model of a bucketed table and the collaborator traits the
//! orchestration core composes: the metadata scan, the unaware-bucket
//! compaction coordinator, the write/commit handles, and the row-level
//! read/write used by the reorder rewrite path.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::Result;
use crate::io::IoManager;
use crate::predicate::PartitionPredicate;
use crate::task::CompactionTask;

/// Policy for how buckets are assigned within a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketMode {
    /// Static bucket count; every record maps to a fixed bucket.
    Fixed,
    /// Bucket count grows on demand.
    Dynamic,
    /// No explicit bucket concept; compaction planning infers work units.
    Unaware,
}

/// Opaque encoded partition key. Ordering and equality are over the encoded
/// bytes; the core never interprets the encoding.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionKey(Vec<u8>);

impl PartitionKey {
    pub fn new(encoded: impl Into<Vec<u8>>) -> Self {
        Self(encoded.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// Metadata for one data file inside a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileMeta {
    pub file_name: String,
    pub file_size: u64,
    pub row_count: u64,
}

impl FileMeta {
    pub fn new(file_name: impl Into<String>, file_size: u64, row_count: u64) -> Self {
        Self {
            file_name: file_name.into(),
            file_size,
            row_count,
        }
    }
}

/// One data split from the metadata scan. Splits referencing the same
/// `(partition, bucket)` collapse into one unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DataSplit {
    pub partition: PartitionKey,
    pub bucket: u32,
}

/// File-level changes produced by one unit of compaction work.
///
/// Fragments are order-insensitive; the aggregator combines them by set
/// union before the single commit. `bucket` is `None` for unaware-bucket
/// rewrites.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitMessage {
    pub partition: PartitionKey,
    pub bucket: Option<u32>,
    pub compact_before: Vec<FileMeta>,
    pub compact_after: Vec<FileMeta>,
}

/// A materialized row on the reorder read/write path, keyed by column name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowData {
    fields: Vec<(String, String)>,
}

impl RowData {
    pub fn new(fields: Vec<(String, String)>) -> Self {
        Self { fields }
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value.as_str())
    }

    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }
}

pub type RowStream = BoxStream<'static, Result<RowData>>;

/// Handle to one bucketed table.
///
/// Everything behind this trait is an external collaborator; the core only
/// composes the calls and owns the decomposition/commit protocol around them.
#[async_trait]
pub trait FileStoreTable: Send + Sync {
    fn name(&self) -> &str;

    fn bucket_mode(&self) -> BucketMode;

    /// Re-opens this handle with write-only mode disabled so deferred
    /// merging actually runs during compaction.
    fn for_compaction(self: Arc<Self>) -> Arc<dyn FileStoreTable>;

    /// Metadata scan: the data splits referenced by the current snapshot,
    /// optionally restricted by a partition predicate.
    async fn scan_splits(&self, filter: Option<&PartitionPredicate>) -> Result<Vec<DataSplit>>;

    /// Unaware-bucket planning. Returns pre-planned merge tasks; empty means
    /// there is nothing worth compacting.
    async fn plan_compaction(
        &self,
        full_rewrite: bool,
        filter: Option<&PartitionPredicate>,
    ) -> Result<Vec<CompactionTask>>;

    /// Write builder for assigned-bucket rewrites. Shared by all workers;
    /// each worker opens its own write handle from it.
    fn new_batch_write_builder(&self) -> Arc<dyn BatchWriteBuilder>;

    /// Low-level store write for unaware-bucket tasks, keyed by the job-wide
    /// commit identity.
    async fn new_store_write(&self, commit_identity: &str) -> Result<Box<dyn StoreWrite>>;

    /// Commit handle over the table's transaction log.
    async fn new_commit(&self, commit_identity: &str) -> Result<Box<dyn TableCommit>>;

    /// Row-stream read for the reorder rewrite path.
    async fn read_rows(&self, filter: Option<&PartitionPredicate>) -> Result<RowStream>;

    /// Writes a row stream back with dynamic-overwrite semantics: exactly the
    /// partitions present in the stream are replaced, in one transaction.
    async fn overwrite_dynamic(&self, rows: RowStream) -> Result<()>;
}

#[async_trait]
pub trait BatchWriteBuilder: Send + Sync {
    async fn new_write(&self, io_manager: &IoManager) -> Result<Box<dyn BatchTableWrite>>;
}

/// Per-worker write handle for assigned-bucket tables.
#[async_trait]
pub trait BatchTableWrite: Send {
    /// Compacts one `(partition, bucket)`; `full` forces a full replace of
    /// the bucket rather than an incremental merge.
    async fn compact(&mut self, partition: &PartitionKey, bucket: u32, full: bool) -> Result<()>;

    /// Drains the fragments produced by the `compact` calls issued through
    /// this handle.
    async fn prepare_commit(&mut self) -> Result<Vec<CommitMessage>>;

    /// Must be called on every worker exit path.
    async fn close(&mut self) -> Result<()>;
}

/// Per-worker low-level write handle for unaware-bucket tasks.
#[async_trait]
pub trait StoreWrite: Send {
    /// Runs one planned task's self-contained compaction routine.
    async fn compact_task(&mut self, task: &CompactionTask) -> Result<CommitMessage>;

    /// Must be called on every worker exit path.
    async fn close(&mut self) -> Result<()>;
}

/// One atomic transaction over the table's log: either every fragment in the
/// set becomes visible or none do.
#[async_trait]
pub trait TableCommit: Send {
    async fn commit(&mut self, messages: Vec<CommitMessage>) -> Result<()>;
}
