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

use std::path::Path;

use tempfile::TempDir;

use crate::Result;

/// Manager for a worker's local scratch I/O. Owns a spill directory that
/// lives exactly as long as the worker's scoped context.
#[derive(Debug)]
pub struct IoManager {
    spill_dir: Option<TempDir>,
}

impl IoManager {
    pub fn new() -> Result<Self> {
        Ok(Self {
            spill_dir: Some(tempfile::tempdir()?),
        })
    }

    /// Scratch directory for merge spill files. `None` once closed.
    pub fn spill_path(&self) -> Option<&Path> {
        self.spill_dir.as_ref().map(|dir| dir.path())
    }

    /// Removes the spill directory. Must run on every worker exit path;
    /// idempotent so an error path can close without tracking state.
    pub fn close(&mut self) -> Result<()> {
        if let Some(dir) = self.spill_dir.take() {
            dir.close()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spill_dir_removed_on_close() {
        let mut io_manager = IoManager::new().unwrap();
        let path = io_manager.spill_path().unwrap().to_path_buf();
        assert!(path.exists());

        io_manager.close().unwrap();
        assert!(!path.exists());
        assert!(io_manager.spill_path().is_none());

        // double close is fine
        io_manager.close().unwrap();
    }
}
