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

use std::time::Duration;

use derive_builder::Builder;
use serde::Deserialize;
use serde_with::serde_as;

fn default_worker_parallelism() -> usize {
    4
}

fn default_work_queue_capacity() -> usize {
    64
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_retry_max_delay() -> Duration {
    Duration::from_secs(10)
}

/// Knobs for one compaction job.
#[serde_as]
#[derive(Debug, Clone, Deserialize, Builder)]
#[builder(default)]
pub struct CompactionConfig {
    /// Number of parallel workers a job fans out to.
    #[serde(default = "default_worker_parallelism")]
    pub worker_parallelism: usize,
    /// Capacity of the bounded unit queue feeding the workers.
    #[serde(default = "default_work_queue_capacity")]
    pub work_queue_capacity: usize,
    #[serde(default)]
    pub commit_retry: CommitRetryConfig,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            worker_parallelism: default_worker_parallelism(),
            work_queue_capacity: default_work_queue_capacity(),
            commit_retry: CommitRetryConfig::default(),
        }
    }
}

impl CompactionConfig {
    pub fn builder() -> CompactionConfigBuilder {
        CompactionConfigBuilder::default()
    }
}

/// Backoff applied to the single commit call when the transaction log reports
/// a retryable conflict. The fragment set is never recomputed between tries.
#[serde_as]
#[derive(Debug, Clone, Deserialize)]
pub struct CommitRetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_retry_initial_delay")]
    pub retry_initial_delay: Duration,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay: Duration,
}

impl Default for CommitRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_initial_delay: default_retry_initial_delay(),
            retry_max_delay: default_retry_max_delay(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CompactionConfig::default();
        assert_eq!(config.worker_parallelism, 4);
        assert_eq!(config.work_queue_capacity, 64);
        assert_eq!(config.commit_retry.max_retries, 3);
    }

    #[test]
    fn test_builder_overrides() {
        let config = CompactionConfig::builder()
            .worker_parallelism(2usize)
            .build()
            .unwrap();
        assert_eq!(config.worker_parallelism, 2);
        assert_eq!(config.work_queue_capacity, 64);
    }

    #[test]
    fn test_deserialize_partial() {
        let config: CompactionConfig =
            serde_json::from_str(r#"{"worker_parallelism": 8}"#).unwrap();
        assert_eq!(config.worker_parallelism, 8);
        assert_eq!(config.commit_retry.max_retries, 3);
    }

    #[test]
    fn test_deserialize_partial_commit_retry() {
        let config: CompactionConfig =
            serde_json::from_str(r#"{"commit_retry": {"max_retries": 5}}"#).unwrap();
        assert_eq!(config.commit_retry.max_retries, 5);
        assert_eq!(config.commit_retry.retry_initial_delay, Duration::from_secs(1));
        assert_eq!(config.commit_retry.retry_max_delay, Duration::from_secs(10));
    }
}
