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

//! Compaction task descriptors and their wire codec.
//!
//! Tasks are planned on the coordinator and executed inside workers, so they
//! must cross process boundaries. The codec is deterministic and versioned:
//! the first byte of the encoded form is the schema version, read back before
//! decoding so newer coordinators can still ship older encodings.

use bytes::{Buf, BufMut, BytesMut};

use crate::table::{CommitMessage, FileMeta, PartitionKey, StoreWrite};
use crate::{CompactionError, Result};

/// One pre-planned merge for an unaware-bucket table: a set of files in one
/// partition to rewrite together, not tied to any fixed bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionTask {
    pub partition: PartitionKey,
    pub compact_before: Vec<FileMeta>,
}

impl CompactionTask {
    pub fn new(partition: PartitionKey, compact_before: Vec<FileMeta>) -> Self {
        Self {
            partition,
            compact_before,
        }
    }

    /// Runs this task's self-contained compaction routine against a
    /// low-level write handle, producing exactly one fragment.
    pub async fn do_compact(&self, write: &mut dyn StoreWrite) -> Result<CommitMessage> {
        write.compact_task(self).await
    }
}

/// Versioned binary codec for [`CompactionTask`].
///
/// Version 1 predates per-file row counts; version 2 is current. Encoding
/// always writes the requested version as the leading byte.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompactionTaskSerializer;

impl CompactionTaskSerializer {
    pub const CURRENT_VERSION: u8 = 2;
    pub const MIN_VERSION: u8 = 1;

    pub fn serialize(&self, task: &CompactionTask) -> Result<Vec<u8>> {
        self.serialize_with_version(Self::CURRENT_VERSION, task)
    }

    pub fn serialize_with_version(&self, version: u8, task: &CompactionTask) -> Result<Vec<u8>> {
        if !(Self::MIN_VERSION..=Self::CURRENT_VERSION).contains(&version) {
            return Err(CompactionError::TaskCodec(format!(
                "cannot encode task schema version {version}"
            )));
        }
        let mut buf = BytesMut::new();
        buf.put_u8(version);
        put_slice(&mut buf, task.partition.as_bytes())?;
        let file_count = u32::try_from(task.compact_before.len()).map_err(|_| {
            CompactionError::TaskCodec("task references more than u32::MAX files".to_owned())
        })?;
        buf.put_u32(file_count);
        for file in &task.compact_before {
            put_slice(&mut buf, file.file_name.as_bytes())?;
            buf.put_u64(file.file_size);
            if version >= 2 {
                buf.put_u64(file.row_count);
            }
        }
        Ok(buf.to_vec())
    }

    pub fn deserialize(&self, encoded: &[u8]) -> Result<CompactionTask> {
        let mut buf = encoded;
        let version = take_u8(&mut buf)?;
        if !(Self::MIN_VERSION..=Self::CURRENT_VERSION).contains(&version) {
            return Err(CompactionError::TaskCodec(format!(
                "unknown task schema version {version}"
            )));
        }

        let partition = PartitionKey::new(take_slice(&mut buf)?);
        let file_count = take_u32(&mut buf)? as usize;
        let mut compact_before = Vec::with_capacity(file_count);
        for _ in 0..file_count {
            let file_name = String::from_utf8(take_slice(&mut buf)?).map_err(|_| {
                CompactionError::TaskCodec("file name is not valid utf-8".to_owned())
            })?;
            let file_size = take_u64(&mut buf)?;
            let row_count = if version >= 2 { take_u64(&mut buf)? } else { 0 };
            compact_before.push(FileMeta {
                file_name,
                file_size,
                row_count,
            });
        }
        if buf.has_remaining() {
            return Err(CompactionError::TaskCodec(format!(
                "{} trailing bytes after task",
                buf.remaining()
            )));
        }
        Ok(CompactionTask {
            partition,
            compact_before,
        })
    }
}

fn put_slice(buf: &mut BytesMut, slice: &[u8]) -> Result<()> {
    let len = u32::try_from(slice.len())
        .map_err(|_| CompactionError::TaskCodec("field longer than u32::MAX bytes".to_owned()))?;
    buf.put_u32(len);
    buf.put_slice(slice);
    Ok(())
}

fn ensure(buf: &[u8], needed: usize) -> Result<()> {
    if buf.remaining() < needed {
        return Err(CompactionError::TaskCodec(format!(
            "truncated task: need {needed} bytes, {} left",
            buf.remaining()
        )));
    }
    Ok(())
}

fn take_u8(buf: &mut &[u8]) -> Result<u8> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

fn take_u32(buf: &mut &[u8]) -> Result<u32> {
    ensure(buf, 4)?;
    Ok(buf.get_u32())
}

fn take_u64(buf: &mut &[u8]) -> Result<u64> {
    ensure(buf, 8)?;
    Ok(buf.get_u64())
}

fn take_slice(buf: &mut &[u8]) -> Result<Vec<u8>> {
    let len = take_u32(buf)? as usize;
    ensure(buf, len)?;
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task() -> CompactionTask {
        CompactionTask::new(
            PartitionKey::new(b"dt=2025-08-23".to_vec()),
            vec![
                FileMeta::new("data-0.orc", 1024, 100),
                FileMeta::new("data-1.orc", 2048, 250),
            ],
        )
    }

    #[test]
    fn test_round_trip_current_version() {
        let serializer = CompactionTaskSerializer;
        let task = sample_task();
        let encoded = serializer.serialize(&task).unwrap();
        assert_eq!(encoded[0], CompactionTaskSerializer::CURRENT_VERSION);
        assert_eq!(serializer.deserialize(&encoded).unwrap(), task);
    }

    #[test]
    fn test_round_trip_all_declared_versions() {
        let serializer = CompactionTaskSerializer;
        // row counts are not representable before version 2
        let task = CompactionTask::new(
            PartitionKey::new(b"dt=2025-08-23".to_vec()),
            vec![FileMeta::new("data-0.orc", 1024, 0)],
        );
        for version in CompactionTaskSerializer::MIN_VERSION..=CompactionTaskSerializer::CURRENT_VERSION
        {
            let encoded = serializer.serialize_with_version(version, &task).unwrap();
            assert_eq!(encoded[0], version);
            assert_eq!(serializer.deserialize(&encoded).unwrap(), task, "version {version}");
        }
    }

    #[test]
    fn test_serialization_is_deterministic() {
        let serializer = CompactionTaskSerializer;
        let task = sample_task();
        assert_eq!(
            serializer.serialize(&task).unwrap(),
            serializer.serialize(&task).unwrap()
        );
    }

    #[test]
    fn test_unknown_version_rejected() {
        let serializer = CompactionTaskSerializer;
        let mut encoded = serializer.serialize(&sample_task()).unwrap();
        encoded[0] = 99;
        let err = serializer.deserialize(&encoded).unwrap_err();
        assert!(matches!(err, CompactionError::TaskCodec(_)), "{err}");

        let err = serializer
            .serialize_with_version(0, &sample_task())
            .unwrap_err();
        assert!(matches!(err, CompactionError::TaskCodec(_)), "{err}");
    }

    #[test]
    fn test_truncated_input_rejected() {
        let serializer = CompactionTaskSerializer;
        let encoded = serializer.serialize(&sample_task()).unwrap();
        let err = serializer.deserialize(&encoded[..encoded.len() - 3]).unwrap_err();
        assert!(matches!(err, CompactionError::TaskCodec(_)), "{err}");
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let serializer = CompactionTaskSerializer;
        let mut encoded = serializer.serialize(&sample_task()).unwrap();
        encoded.push(0);
        let err = serializer.deserialize(&encoded).unwrap_err();
        assert!(matches!(err, CompactionError::TaskCodec(_)), "{err}");
    }

    #[test]
    fn test_empty_input_rejected() {
        let serializer = CompactionTaskSerializer;
        let err = serializer.deserialize(&[]).unwrap_err();
        assert!(matches!(err, CompactionError::TaskCodec(_)), "{err}");
    }
}
