//! Snapshot of parent-image metadata consumed by this crate.
//!
//! Read-only to the request engine (spec.md §2.1). Out of scope: the
//! snapshot/clone metadata protocol itself (spec.md §1 Non-goals). This module
//! only defines the query surface and a reference implementation suitable for
//! tests.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{CloneIoError, Result};
use crate::extent::Extent;
use crate::object_store::SnapId;

/// Reads image-space extents from the parent image. Stands in for the full
/// parent `AioRead` path, which is itself an instance of this crate's own
/// request engine one level up the clone chain, out of scope here (spec.md
/// §1 treats the image-level API surface as an external collaborator); this
/// crate only needs the ability to pull bytes out of the parent for a given
/// extent set (spec.md §4.1 `read_from_parent`).
#[async_trait]
pub trait ParentImageReader: Send + Sync {
    async fn read_extents(&self, extents: &[Extent]) -> Result<Bytes>;
}

/// Consumed interface for parent-overlap lookups (spec.md §6).
#[async_trait]
pub trait ParentOverlapView: Send + Sync {
    /// Bytes of this child's address space still backed by the parent for
    /// `snap_id`. Returns `Err(SnapshotGone)` if the snapshot has been deleted
    /// concurrently; callers treat that identically to "no overlap" (spec.md
    /// §7 propagation policy).
    async fn parent_overlap(&self, snap_id: SnapId) -> Result<u64>;

    fn is_parent_attached(&self) -> bool;
}

/// Reference implementation: a fixed overlap size per snapshot id, with an
/// optional "detach" flag to simulate the parent disappearing mid-request
/// (spec.md §8 B2).
pub struct StaticParentOverlapView {
    attached: std::sync::atomic::AtomicBool,
    head_overlap: u64,
    snap_overlaps: std::collections::HashMap<u64, u64>,
    gone_snapshots: std::collections::HashSet<u64>,
}

impl StaticParentOverlapView {
    pub fn new(head_overlap: u64) -> Self {
        Self {
            attached: std::sync::atomic::AtomicBool::new(true),
            head_overlap,
            snap_overlaps: std::collections::HashMap::new(),
            gone_snapshots: std::collections::HashSet::new(),
        }
    }

    pub fn with_snap_overlap(mut self, snap_id: u64, overlap: u64) -> Self {
        self.snap_overlaps.insert(snap_id, overlap);
        self
    }

    pub fn with_gone_snapshot(mut self, snap_id: u64) -> Self {
        self.gone_snapshots.insert(snap_id);
        self
    }

    /// Simulates parent detach: subsequent `parent_overlap` calls see no parent.
    pub fn detach(&self) {
        self.attached.store(false, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl ParentOverlapView for StaticParentOverlapView {
    async fn parent_overlap(&self, snap_id: SnapId) -> Result<u64> {
        if !self.is_parent_attached() {
            return Ok(0);
        }
        match snap_id {
            SnapId::Head => Ok(self.head_overlap),
            SnapId::Id(id) => {
                if self.gone_snapshots.contains(&id) {
                    return Err(CloneIoError::SnapshotGone);
                }
                Ok(self.snap_overlaps.get(&id).copied().unwrap_or(0))
            }
        }
    }

    fn is_parent_attached(&self) -> bool {
        self.attached.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// A parent reader backed by a fixed in-memory image, for tests.
pub struct StaticParentImageReader {
    pub data: Bytes,
}

#[async_trait]
impl ParentImageReader for StaticParentImageReader {
    async fn read_extents(&self, extents: &[Extent]) -> Result<Bytes> {
        let mut out = Vec::with_capacity(Extent::total_len(extents) as usize);
        for extent in extents {
            let start = extent.offset as usize;
            let end = extent.end() as usize;
            if end > self.data.len() {
                // Sparse parent: missing tail reads as zero.
                out.extend(self.data.get(start..self.data.len().min(end)).unwrap_or(&[]));
                out.resize(out.len() + (end - self.data.len().max(start)), 0);
            } else {
                out.extend_from_slice(&self.data[start..end]);
            }
        }
        Ok(Bytes::from(out))
    }
}
