//! The external async object-store client this crate drives.
//!
//! Out of scope per spec.md §1: the AIO primitives, the wire protocol and the
//! snapshot-context plumbing all belong to the object store itself. This module
//! only defines the surface the request engine calls (spec.md §6) plus the
//! op-builder for the combined write/copyup operation (spec.md §4.3, §4.4).

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::extent::Extent;

/// The sequence number + list of snapshot ids a write must be tagged with,
/// supplied by the image's current snapshot state (external collaborator).
#[derive(Debug, Clone, Default)]
pub struct SnapshotContext {
    pub seq: u64,
    pub snaps: Vec<u64>,
}

/// Either the writable head of the image, or a specific read snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapId {
    Head,
    Id(u64),
}

impl SnapId {
    pub fn is_head(&self) -> bool {
        matches!(self, SnapId::Head)
    }
}

/// Result of a dense read: a single contiguous buffer.
pub type ReadResult = Bytes;

/// Result of a sparse read: the extents that actually hold data, plus their
/// concatenated bytes. Gaps between extents are implicitly zero.
#[derive(Debug, Clone, Default)]
pub struct SparseReadResult {
    pub extents: Vec<Extent>,
    pub data: Bytes,
}

impl SparseReadResult {
    pub fn total_bytes(&self) -> u64 {
        Extent::total_len(&self.extents)
    }
}

/// One step of a combined object-store write operation. Steps apply atomically
/// and in order within a single `aio_operate` call (spec.md §6 wire-format
/// note).
#[derive(Debug, Clone)]
pub enum WriteStep {
    /// Fails the whole op with `NotFound` if the object does not yet exist.
    /// Used to make a write conditional on prior materialisation.
    AssertExists,
    Write { offset: u64, data: Bytes },
    Zero { offset: u64, length: u64 },
    WriteSame { offset: u64, data: Bytes, length: u64 },
    CompareAndWrite { offset: u64, expect: Bytes, data: Bytes },
    /// The `copyup` verb: writes `data` into the object iff it does not yet
    /// exist, otherwise a no-op (spec.md §6 wire-format note).
    Exec { class: &'static str, method: &'static str, data: Bytes },
}

/// Builds one combined write operation. Appending `assert_exists` or `exec`
/// steps ahead of the payload steps is how [`crate::aio::write`] expresses
/// write-guards and copyup materialisation (spec.md §4.3 `guard_write`,
/// §4.3 `send_copyup`).
#[derive(Debug, Clone, Default)]
pub struct WriteOp {
    pub steps: Vec<WriteStep>,
}

impl WriteOp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assert_exists(mut self) -> Self {
        self.steps.push(WriteStep::AssertExists);
        self
    }

    pub fn exec(mut self, class: &'static str, method: &'static str, data: Bytes) -> Self {
        self.steps.push(WriteStep::Exec { class, method, data });
        self
    }

    pub fn write(mut self, offset: u64, data: Bytes) -> Self {
        self.steps.push(WriteStep::Write { offset, data });
        self
    }

    pub fn zero(mut self, offset: u64, length: u64) -> Self {
        self.steps.push(WriteStep::Zero { offset, length });
        self
    }

    pub fn write_same(mut self, offset: u64, data: Bytes, length: u64) -> Self {
        self.steps.push(WriteStep::WriteSame { offset, data, length });
        self
    }

    pub fn compare_and_write(mut self, offset: u64, expect: Bytes, data: Bytes) -> Self {
        self.steps.push(WriteStep::CompareAndWrite { offset, expect, data });
        self
    }
}

/// The external K/V blob store. Consumed, never implemented, by the request
/// engine; the reference `InMemoryObjectStore` in this crate's tests exists
/// purely to exercise the state machines end to end.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// `op_flags` carries the snapshot read-flags the caller resolved for this
    /// request (spec.md §4.2); the store applies them (e.g. cache bypass,
    /// read-ahead hints) the same way it would for a non-cloned read.
    async fn aio_read(&self, oid: &str, off: u64, len: u64, op_flags: u32) -> Result<ReadResult>;

    async fn aio_sparse_read(&self, oid: &str, off: u64, len: u64, op_flags: u32) -> Result<SparseReadResult>;

    /// Whether `oid` exists right now. Used by write guards that need to check
    /// without paying for a full `assert_exists` round trip bundled into a
    /// mutating op.
    async fn assert_exists(&self, oid: &str) -> Result<()>;

    /// Issues a combined operation (assert/write/zero/exec steps applied in
    /// order, atomically) tagged with `snapshot`. Returns the number of bytes
    /// affected on success (0 for pure metadata ops).
    async fn aio_operate(&self, oid: &str, op: WriteOp, snapshot: SnapshotContext) -> Result<i64>;
}
