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

//! Compact procedure. Usage:
//!
//! ```ignore
//! let procedure = CompactProcedure::builder()
//!     .table(table)
//!     .build()?;
//! procedure.call(Some("p1=a;p2=b"), None, None).await?;
//! ```
//!
//! One call performs exactly one compaction pass: decompose the job into
//! independent units by bucket mode, fan the units out across workers, and
//! fold every fragment into a single atomic commit. With an order strategy,
//! the job instead routes through the reorder rewrite path.

use std::sync::Arc;
use std::time::Instant;

use backon::{ExponentialBuilder, Retryable};
use derive_builder::Builder;
use itertools::Itertools;
use uuid::Uuid;

use crate::common::{CompactionMetricsRecorder, Metrics};
use crate::config::{CommitRetryConfig, CompactionConfig};
use crate::executor::{
    AssignedBucketContextFactory, DistributedExecutor, PlannedTaskContextFactory, WorkUnit,
};
use crate::predicate::PartitionPredicate;
use crate::sort::{OrderType, RowSorter, SortSpec};
use crate::table::{BucketMode, CommitMessage, FileStoreTable};
use crate::task::CompactionTaskSerializer;
use crate::{CompactionError, Result};

#[derive(Builder)]
#[builder(pattern = "owned")]
pub struct CompactProcedure {
    table: Arc<dyn FileStoreTable>,
    #[builder(default)]
    config: Arc<CompactionConfig>,
    /// External sort implementation, required only for reorder jobs.
    #[builder(default, setter(strip_option))]
    row_sorter: Option<Arc<dyn RowSorter>>,
    #[builder(default, setter(strip_option))]
    metrics: Option<Arc<Metrics>>,
}

impl CompactProcedure {
    pub fn builder() -> CompactProcedureBuilder {
        CompactProcedureBuilder::default()
    }

    /// Runs one compaction pass.
    ///
    /// `partitions` is a filter string like `"p1=a;p2=b"`; `order_strategy`
    /// defaults to `none`; `order_by` is a comma-separated column list.
    /// Argument conflicts are rejected before any scan or distribution.
    /// Returns `true` on success, matching the procedure's output column.
    pub async fn call(
        &self,
        partitions: Option<&str>,
        order_strategy: Option<&str>,
        order_by: Option<&str>,
    ) -> Result<bool> {
        let spec = SortSpec::parse(order_strategy, order_by)?;
        let filter = match partitions {
            Some(raw) => PartitionPredicate::parse(raw)?,
            None => None,
        };
        self.execute(&spec, filter).await?;
        Ok(true)
    }

    async fn execute(&self, spec: &SortSpec, filter: Option<PartitionPredicate>) -> Result<()> {
        let recorder = self
            .metrics
            .as_ref()
            .map(|m| CompactionMetricsRecorder::new(m.clone(), self.table.name().to_owned()));
        let started = Instant::now();

        let table = self.table.clone().for_compaction();
        let bucket_mode = table.bucket_mode();

        let result = if spec.order_type == OrderType::None {
            match bucket_mode {
                BucketMode::Fixed | BucketMode::Dynamic => {
                    self.compact_assigned_bucket(&table, filter.as_ref(), recorder.as_ref())
                        .await
                }
                BucketMode::Unaware => {
                    self.compact_unaware_bucket(&table, filter.as_ref(), recorder.as_ref())
                        .await
                }
            }
        } else {
            match bucket_mode {
                BucketMode::Unaware => self.sort_compact(&table, spec, filter).await,
                mode => Err(CompactionError::Unsupported(format!(
                    "compact with order strategy \"{}\" only supports unaware-bucket tables, \
                     table {} has bucket mode {mode:?}",
                    spec.order_type,
                    table.name(),
                ))),
            }
        };

        if let Some(recorder) = &recorder {
            recorder.record_compaction_duration(started.elapsed().as_secs_f64());
            match &result {
                Ok(()) => {}
                Err(CompactionError::Commit { .. }) => recorder.record_commit_failure(),
                Err(e) if is_worker_failure(e) => recorder.record_worker_error(),
                Err(_) => {}
            }
        }
        result
    }

    /// FIXED / DYNAMIC: one unit per distinct `(partition, bucket)` pair
    /// referenced by the metadata scan.
    async fn compact_assigned_bucket(
        &self,
        table: &Arc<dyn FileStoreTable>,
        filter: Option<&PartitionPredicate>,
        recorder: Option<&CompactionMetricsRecorder>,
    ) -> Result<()> {
        let splits = table.scan_splits(filter).await?;
        let units: Vec<WorkUnit> = splits
            .into_iter()
            .map(|split| (split.partition, split.bucket))
            .unique()
            .map(|(partition, bucket)| WorkUnit::AssignedBucket { partition, bucket })
            .collect();
        if units.is_empty() {
            tracing::info!(table = table.name(), "no buckets matched, skipping compaction");
            return Ok(());
        }
        tracing::info!(
            table = table.name(),
            units = units.len(),
            "compacting assigned buckets"
        );
        if let Some(recorder) = recorder {
            recorder.record_planned_units(units.len() as u64);
        }

        let commit_identity = Uuid::new_v4().to_string();
        let factory = Arc::new(AssignedBucketContextFactory::new(
            table.new_batch_write_builder(),
        ));
        let fragments = DistributedExecutor::new(&self.config)
            .execute(units, factory)
            .await?;
        self.commit_fragments(table, &commit_identity, fragments, recorder)
            .await
    }

    /// UNAWARE: units come pre-planned from the external compaction
    /// coordinator and are shipped to workers in encoded form.
    async fn compact_unaware_bucket(
        &self,
        table: &Arc<dyn FileStoreTable>,
        filter: Option<&PartitionPredicate>,
        recorder: Option<&CompactionMetricsRecorder>,
    ) -> Result<()> {
        let tasks = table.plan_compaction(false, filter).await?;
        if tasks.is_empty() {
            tracing::info!(table = table.name(), "no compaction tasks planned, skipping");
            return Ok(());
        }

        // fail fast: a task that cannot cross the wire aborts the job before
        // any worker is scheduled
        let serializer = CompactionTaskSerializer;
        let mut units = Vec::with_capacity(tasks.len());
        for task in &tasks {
            units.push(WorkUnit::PlannedTask {
                encoded: serializer.serialize(task)?,
            });
        }
        tracing::info!(
            table = table.name(),
            units = units.len(),
            "compacting planned tasks"
        );
        if let Some(recorder) = recorder {
            recorder.record_planned_units(units.len() as u64);
        }

        let commit_identity = Uuid::new_v4().to_string();
        let factory = Arc::new(PlannedTaskContextFactory::new(
            table.clone(),
            commit_identity.clone(),
        ));
        let fragments = DistributedExecutor::new(&self.config)
            .execute(units, factory)
            .await?;
        self.commit_fragments(table, &commit_identity, fragments, recorder)
            .await
    }

    /// Reorder rewrite: filtered row-stream read, external sort, one
    /// dynamic-overwrite transaction. Unaware-bucket tables only.
    async fn sort_compact(
        &self,
        table: &Arc<dyn FileStoreTable>,
        spec: &SortSpec,
        filter: Option<PartitionPredicate>,
    ) -> Result<()> {
        let sorter = self.row_sorter.clone().ok_or_else(|| {
            CompactionError::Unsupported(format!(
                "order strategy \"{}\" requires a configured row sorter",
                spec.order_type
            ))
        })?;
        match &filter {
            Some(filter) => tracing::info!(
                table = table.name(),
                filter = %filter,
                "sort-compacting filtered partitions"
            ),
            None => tracing::info!(table = table.name(), "sort-compacting full table"),
        }

        let rows = table.read_rows(filter.as_ref()).await?;
        let sorted = sorter.sort(spec, rows).await?;
        table.overwrite_dynamic(sorted).await
    }

    async fn commit_fragments(
        &self,
        table: &Arc<dyn FileStoreTable>,
        commit_identity: &str,
        fragments: Vec<CommitMessage>,
        recorder: Option<&CompactionMetricsRecorder>,
    ) -> Result<()> {
        let committed = CommitManager::new(self.config.commit_retry.clone())
            .commit(table.as_ref(), commit_identity, fragments)
            .await?;
        if committed {
            if let Some(recorder) = recorder {
                recorder.record_commit_success();
            }
        }
        Ok(())
    }
}

/// True only for failures of scheduled work. Argument and configuration
/// rejections happen before any worker exists and stay out of the worker
/// error counter.
fn is_worker_failure(error: &CompactionError) -> bool {
    matches!(
        error,
        CompactionError::Execution(_) | CompactionError::TaskCodec(_) | CompactionError::Io(_)
    )
}

/// Folds the complete fragment set into exactly one atomic commit under the
/// job's commit identity. An empty set never opens a commit. Only rejections
/// the transaction log marks retryable are retried; the fragment set is
/// reused unchanged between tries.
pub struct CommitManager {
    retry: CommitRetryConfig,
}

impl CommitManager {
    pub fn new(retry: CommitRetryConfig) -> Self {
        Self { retry }
    }

    /// Returns whether a commit transaction was opened.
    pub async fn commit(
        &self,
        table: &dyn FileStoreTable,
        commit_identity: &str,
        fragments: Vec<CommitMessage>,
    ) -> Result<bool> {
        if fragments.is_empty() {
            tracing::info!(table = table.name(), "no fragments produced, skipping commit");
            return Ok(false);
        }

        let operation = || {
            let fragments = fragments.clone();
            async move {
                let mut commit = table.new_commit(commit_identity).await?;
                commit.commit(fragments).await
            }
        };
        let retry_strategy = ExponentialBuilder::default()
            .with_min_delay(self.retry.retry_initial_delay)
            .with_max_delay(self.retry.retry_max_delay)
            .with_max_times(self.retry.max_retries as usize);
        operation
            .retry(&retry_strategy)
            .when(|e: &CompactionError| e.is_retryable())
            .await?;

        tracing::info!(table = table.name(), commit_identity, "compaction committed");
        Ok(true)
    }
}
