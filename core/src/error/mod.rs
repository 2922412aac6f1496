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

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CompactionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unsupported configuration: {0}")]
    Unsupported(String),

    #[error("Task codec error: {0}")]
    TaskCodec(String),

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Commit failed: {message}")]
    Commit { message: String, retryable: bool },
}

impl CompactionError {
    /// A commit rejection the transaction log considers transient, e.g. a
    /// conflicting concurrent writer. Only these are retried.
    pub fn commit_conflict(message: impl Into<String>) -> Self {
        Self::Commit {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn commit(message: impl Into<String>) -> Self {
        Self::Commit {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Commit { retryable: true, .. })
    }
}

pub type Result<T> = std::result::Result<T, CompactionError>;
