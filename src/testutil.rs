//! Fakes used by this crate's own tests and available to integration tests
//! under the `testing` feature, in the spirit of the Fuchsia virtio-block
//! `BackendController`/`BackendTest` harness: a fake collaborator plus a side
//! channel that lets a test poke or inspect its internal state directly.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;

use crate::error::{CloneIoError, Result};
use crate::extent::Extent;
use crate::object_store::{ObjectStore, ReadResult, SnapshotContext, SparseReadResult, WriteOp, WriteStep};

/// A fully in-memory `ObjectStore`. Every object is a flat byte buffer; writes
/// past the current end zero-extend, matching the sparse-object semantics a
/// real object store exposes.
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    copyup_calls: Mutex<HashMap<String, u32>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populates an object, as if it had already been materialised.
    pub async fn seed(&self, oid: &str, data: &[u8]) {
        self.objects.lock().await.insert(oid.to_string(), data.to_vec());
    }

    pub async fn written(&self, oid: &str) -> Option<Vec<u8>> {
        self.objects.lock().await.get(oid).cloned()
    }

    pub async fn copyup_call_count(&self, oid: &str) -> u32 {
        *self.copyup_calls.lock().await.get(oid).unwrap_or(&0)
    }

    fn apply_write(buf: &mut Vec<u8>, offset: u64, data: &[u8]) {
        let offset = offset as usize;
        let end = offset + data.len();
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[offset..end].copy_from_slice(data);
    }

    fn apply_zero(buf: &mut Vec<u8>, offset: u64, length: u64) {
        let offset = offset as usize;
        let end = offset + length as usize;
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[offset..end].iter_mut().for_each(|b| *b = 0);
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn aio_read(&self, oid: &str, off: u64, len: u64, _op_flags: u32) -> Result<ReadResult> {
        let objects = self.objects.lock().await;
        let data = objects.get(oid).ok_or(CloneIoError::NotFound)?;
        let start = (off as usize).min(data.len());
        let end = ((off + len) as usize).min(data.len());
        Ok(Bytes::copy_from_slice(&data[start..end]))
    }

    async fn aio_sparse_read(&self, oid: &str, off: u64, len: u64, op_flags: u32) -> Result<SparseReadResult> {
        let bytes = self.aio_read(oid, off, len, op_flags).await?;
        if bytes.is_empty() {
            return Ok(SparseReadResult::default());
        }
        let length = bytes.len() as u64;
        Ok(SparseReadResult { extents: vec![Extent::new(off, length)], data: bytes })
    }

    async fn assert_exists(&self, oid: &str) -> Result<()> {
        if self.objects.lock().await.contains_key(oid) {
            Ok(())
        } else {
            Err(CloneIoError::NotFound)
        }
    }

    async fn aio_operate(&self, oid: &str, op: WriteOp, _snapshot: SnapshotContext) -> Result<i64> {
        let mut objects = self.objects.lock().await;
        let mut bytes_affected: i64 = 0;

        for step in op.steps {
            match step {
                WriteStep::AssertExists => {
                    if !objects.contains_key(oid) {
                        return Err(CloneIoError::NotFound);
                    }
                }
                WriteStep::Exec { method, data, .. } => {
                    if method == "copyup" {
                        *self.copyup_calls.lock().await.entry(oid.to_string()).or_insert(0) += 1;
                        objects.entry(oid.to_string()).or_insert_with(|| data.to_vec());
                    }
                }
                WriteStep::Write { offset, data } => {
                    let buf = objects.entry(oid.to_string()).or_default();
                    Self::apply_write(buf, offset, &data);
                    bytes_affected += data.len() as i64;
                }
                WriteStep::Zero { offset, length } => {
                    let buf = objects.entry(oid.to_string()).or_default();
                    Self::apply_zero(buf, offset, length);
                }
                WriteStep::WriteSame { offset, data, length } => {
                    let buf = objects.entry(oid.to_string()).or_default();
                    let mut remaining = length;
                    let mut cursor = offset;
                    while remaining > 0 {
                        let chunk = data.len().min(remaining as usize);
                        Self::apply_write(buf, cursor, &data[..chunk]);
                        cursor += chunk as u64;
                        remaining -= chunk as u64;
                    }
                    bytes_affected += length as i64;
                }
                WriteStep::CompareAndWrite { offset, expect, data } => {
                    let buf = objects.entry(oid.to_string()).or_default();
                    let start = offset as usize;
                    let end = start + expect.len();
                    let matches = buf.get(start..end).map(|s| s == expect.as_ref()).unwrap_or(false);
                    if !matches {
                        return Err(CloneIoError::IoError("compare-and-write mismatch".into()));
                    }
                    Self::apply_write(buf, offset, &data);
                    bytes_affected += data.len() as i64;
                }
            }
        }

        Ok(bytes_affected)
    }
}
