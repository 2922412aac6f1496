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

use std::sync::Arc;

use mixtrics::metrics::{BoxedCounterVec, BoxedHistogramVec, BoxedRegistry, Buckets};

pub struct Metrics {
    pub compaction_commit_counter: BoxedCounterVec,
    pub compaction_commit_failed_counter: BoxedCounterVec,
    pub compaction_worker_error_counter: BoxedCounterVec,
    pub compaction_planned_units_counter: BoxedCounterVec,
    pub compaction_duration: BoxedHistogramVec,
}

impl Metrics {
    pub fn new(registry: BoxedRegistry) -> Self {
        let compaction_commit_counter = registry.register_counter_vec(
            "bucketloom_compaction_commit_counter".into(),
            "bucketloom compaction total commit counts".into(),
            &["table_name"],
        );

        let compaction_commit_failed_counter = registry.register_counter_vec(
            "bucketloom_compaction_commit_failed_counter".into(),
            "bucketloom compaction commit failed counts".into(),
            &["table_name"],
        );

        let compaction_worker_error_counter = registry.register_counter_vec(
            "bucketloom_compaction_worker_error_counter".into(),
            "bucketloom compaction worker error counts".into(),
            &["table_name"],
        );

        let compaction_planned_units_counter = registry.register_counter_vec(
            "bucketloom_compaction_planned_units_counter".into(),
            "bucketloom compaction planned units of work".into(),
            &["table_name"],
        );

        let compaction_duration = registry.register_histogram_vec_with_buckets(
            "bucketloom_compaction_duration".into(),
            "bucketloom compaction job duration in seconds".into(),
            &["table_name"],
            Buckets::exponential(
                1.0, 2.0, 20, // Start at 1 second, double each bucket, up to 20 buckets
            ),
        );

        Self {
            compaction_commit_counter,
            compaction_commit_failed_counter,
            compaction_worker_error_counter,
            compaction_planned_units_counter,
            compaction_duration,
        }
    }
}

/// Helper for recording per-table compaction metrics.
#[derive(Clone)]
pub struct CompactionMetricsRecorder {
    metrics: Arc<Metrics>,
    table_name: String,
}

impl CompactionMetricsRecorder {
    pub fn new(metrics: Arc<Metrics>, table_name: String) -> Self {
        Self {
            metrics,
            table_name,
        }
    }

    fn label_vec(&self) -> [std::borrow::Cow<'static, str>; 1] {
        [self.table_name.clone().into()]
    }

    pub fn record_commit_success(&self) {
        self.metrics
            .compaction_commit_counter
            .counter(&self.label_vec())
            .increase(1);
    }

    pub fn record_commit_failure(&self) {
        self.metrics
            .compaction_commit_failed_counter
            .counter(&self.label_vec())
            .increase(1);
    }

    pub fn record_worker_error(&self) {
        self.metrics
            .compaction_worker_error_counter
            .counter(&self.label_vec())
            .increase(1);
    }

    pub fn record_planned_units(&self, units: u64) {
        self.metrics
            .compaction_planned_units_counter
            .counter(&self.label_vec())
            .increase(units);
    }

    pub fn record_compaction_duration(&self, duration_secs: f64) {
        self.metrics
            .compaction_duration
            .histogram(&self.label_vec())
            .record(duration_secs);
    }
}
