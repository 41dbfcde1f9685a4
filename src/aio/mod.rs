//! The per-object request engine: common state shared by [`read::AioRead`] and
//! [`write::AbstractWrite`], plus the parent-extent bookkeeping both of them
//! build on (spec.md §4.1).

pub mod read;
pub mod write;

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::trace;

use crate::error::{CloneIoError, Result};
use crate::extent::{prune_parent_extents, Extent};
use crate::image::ImageContext;
use crate::object_store::SnapId;

pub use read::AioRead;
pub use write::{AbstractWrite, WritePayload};

/// Fields and operations common to every per-object request (spec.md §3
/// "AioRequest (common state)", §4.1).
pub struct AioRequestCore {
    pub image: Arc<ImageContext>,
    pub oid: String,
    pub object_no: u64,
    /// Intra-object extent this request targets.
    pub extent: Extent,
    pub snap_id: SnapId,
    pub hide_enoent: bool,
    parent_extents: Mutex<Vec<Extent>>,
}

impl AioRequestCore {
    /// Constructs the common state, computing the initial `parent_extents` by
    /// mapping the *full object* address space to image space and pruning
    /// against current parent overlap, under `snap_lock`/`parent_lock` read
    /// locks (spec.md §4.1 `new`). Returns the core plus whether any overlap
    /// was found, which callers use to pick their initial state (spec.md §4.2:
    /// `READ_GUARD` set at construction iff overlap exists).
    pub async fn new(
        image: Arc<ImageContext>,
        oid: String,
        object_no: u64,
        extent: Extent,
        snap_id: SnapId,
        hide_enoent: bool,
    ) -> (Self, bool) {
        let core = Self {
            image,
            oid,
            object_no,
            extent,
            snap_id,
            hide_enoent,
            parent_extents: Mutex::new(Vec::new()),
        };
        let has_overlap = core.compute_parent_extents_for_range(0, core.image.object_size).await;
        (core, has_overlap)
    }

    /// Recomputes `parent_extents` for this request's own sub-extent (not the
    /// full object), as required when a guarded read/write rechecks overlap
    /// after receiving `NotFound` (spec.md §4.1 `compute_parent_extents`).
    /// Returns true iff any byte still overlaps.
    pub async fn compute_parent_extents(&self) -> bool {
        self.compute_parent_extents_for_range(self.extent.offset, self.extent.length).await
    }

    async fn compute_parent_extents_for_range(&self, intra_off: u64, intra_len: u64) -> bool {
        if !self.image.parent_overlap.is_parent_attached() {
            *self.parent_extents.lock().await = Vec::new();
            return false;
        }

        // snap_lock and parent_lock are read-held for the whole computation,
        // including the async overlap lookup (lock ordering: owner -> snap ->
        // parent -> object_map, spec.md §5).
        let _snap = self.image.snap_lock.read().await;
        let _parent = self.image.parent_lock.read().await;

        let mut extents = self.image.extent_mapper.object_to_image_extents(self.object_no, intra_off, intra_len);
        let overlap_result = self.image.parent_overlap.parent_overlap(self.snap_id).await;

        let overlap = match overlap_result {
            Ok(v) => v,
            Err(CloneIoError::SnapshotGone) => {
                // Treated as "no overlap" (spec.md §7).
                *self.parent_extents.lock().await = Vec::new();
                return false;
            }
            Err(_) => {
                *self.parent_extents.lock().await = Vec::new();
                return false;
            }
        };

        let remaining = prune_parent_extents(&mut extents, overlap);
        trace!(object_no = self.object_no, remaining, "recomputed parent extents");
        *self.parent_extents.lock().await = extents;
        remaining > 0
    }

    pub async fn parent_extents(&self) -> Vec<Extent> {
        self.parent_extents.lock().await.clone()
    }

    /// Initiates an async read from the parent image into this request's
    /// result buffer (spec.md §4.1 `read_from_parent`). The `block_completion`
    /// flag from the design (pinning the parent completion against a racing
    /// detach) has no separate representation here: this crate's
    /// `ParentImageReader` abstraction is a single awaited call rather than a
    /// registered completion, so there is no intermediate state to pin.
    /// Cancellation safety is instead provided by `tokio`'s cooperative
    /// cancellation model (dropping the future aborts the read cleanly).
    pub async fn read_from_parent(&self, extents: &[Extent]) -> Result<bytes::Bytes> {
        self.image.parent_reader.read_extents(extents).await
    }

    /// Whether copy-on-read materialisation should trigger for this request:
    /// enabled, not read-only, and targeting HEAD (spec.md §4.2).
    pub fn copy_on_read_enabled(&self) -> bool {
        self.image.config.clone_copy_on_read && !self.image.config.read_only && self.snap_id.is_head()
    }

    /// Single entry point mapping a terminal result to the raw completion
    /// code, applying the `hide_enoent` remap (spec.md §4.1 `complete`, §7
    /// propagation policy (a), §8 P6).
    pub fn complete(&self, result: Result<i64>) -> i64 {
        match result {
            Ok(code) => code,
            Err(CloneIoError::NotFound) if self.hide_enoent => 0,
            Err(CloneIoError::Invariant(msg)) => panic!("cloneio invariant violated: {msg}"),
            Err(err) => err.to_raw(),
        }
    }
}
