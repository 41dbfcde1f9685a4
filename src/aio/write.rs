//! `AbstractWrite`: the write-side per-object state machine (spec.md §4.3),
//! covering full writes, zero/discard, write-same and compare-and-write.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace};

use super::AioRequestCore;
use crate::copyup::new_copyup_request;
use crate::error::{CloneIoError, Result};
use crate::extent::Extent;
use crate::image::ImageContext;
use crate::object_map::ObjectState;
use crate::object_store::{ObjectStore, SnapId, SnapshotContext, WriteOp, WriteStep};

/// States named in spec.md §4.3. Kept here purely for logging/documentation:
/// this implementation expresses the machine as a linear `async fn` with
/// explicit suspension points (an accepted alternative per the Design Notes),
/// so the enum never lives in a field. Transitions are just the sequence of
/// `trace!` calls below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(dead_code)]
pub enum WriteState {
    Flat,
    Guard,
    Pre,
    Post,
    Copyup,
    Error,
}

/// The write payload, covering every `AioWrite` specialisation plus
/// `AioDiscard` (spec.md §2.7).
#[derive(Debug, Clone)]
pub enum WritePayload {
    Write { offset: u64, data: Bytes },
    Zero { offset: u64, length: u64 },
    /// Distinguished from `Zero` because it implies object removal: the
    /// matching `send_post` transitions `Pending -> NonExistent` (invariant
    /// I5), where a partial `Zero` does not.
    Discard { offset: u64, length: u64 },
    WriteSame { offset: u64, data: Bytes, length: u64 },
    CompareAndWrite { offset: u64, expect: Bytes, data: Bytes },
}

impl WritePayload {
    fn to_write_steps(&self) -> Vec<WriteStep> {
        match self.clone() {
            WritePayload::Write { offset, data } => vec![WriteStep::Write { offset, data }],
            WritePayload::Zero { offset, length } => vec![WriteStep::Zero { offset, length }],
            WritePayload::Discard { offset, length } => vec![WriteStep::Zero { offset, length }],
            WritePayload::WriteSame { offset, data, length } => {
                vec![WriteStep::WriteSame { offset, data, length }]
            }
            WritePayload::CompareAndWrite { offset, expect, data } => {
                vec![WriteStep::CompareAndWrite { offset, expect, data }]
            }
        }
    }

    fn removes_object(&self) -> bool {
        matches!(self, WritePayload::Discard { .. })
    }

    /// The state `send_pre` brackets this write's pre-write ObjectMap
    /// transition with (spec.md §4.3 `pre_object_map_update`).
    fn pre_object_map_state(&self) -> ObjectState {
        if self.removes_object() {
            ObjectState::Pending
        } else {
            ObjectState::Exists
        }
    }

    /// The state `send_post` transitions to, or `None` if this write's
    /// semantics do not remove the object and the post transition is skipped
    /// entirely (invariant I5).
    fn post_object_map_state(&self) -> Option<ObjectState> {
        if self.removes_object() {
            Some(ObjectState::NonExistent)
        } else {
            None
        }
    }
}

pub struct AbstractWrite {
    core: AioRequestCore,
    payload: WritePayload,
    snapshot: SnapshotContext,
    initial_has_overlap: bool,
}

impl AbstractWrite {
    pub async fn new_write(
        image: Arc<ImageContext>,
        oid: String,
        object_no: u64,
        offset: u64,
        data: Bytes,
        snapshot: SnapshotContext,
        hide_enoent: bool,
    ) -> Self {
        let extent = Extent::new(offset, data.len().max(1) as u64);
        Self::new(image, oid, object_no, extent, WritePayload::Write { offset, data }, snapshot, hide_enoent).await
    }

    pub async fn new_zero(
        image: Arc<ImageContext>,
        oid: String,
        object_no: u64,
        offset: u64,
        length: u64,
        snapshot: SnapshotContext,
        hide_enoent: bool,
    ) -> Self {
        let extent = Extent::new(offset, length);
        Self::new(image, oid, object_no, extent, WritePayload::Zero { offset, length }, snapshot, hide_enoent).await
    }

    /// `AioDiscard`: a zero whose semantics imply the object can be removed
    /// entirely once applied (spec.md §2.7, invariant I5).
    pub async fn new_discard(
        image: Arc<ImageContext>,
        oid: String,
        object_no: u64,
        offset: u64,
        length: u64,
        snapshot: SnapshotContext,
        hide_enoent: bool,
    ) -> Self {
        let extent = Extent::new(offset, length);
        Self::new(image, oid, object_no, extent, WritePayload::Discard { offset, length }, snapshot, hide_enoent).await
    }

    pub async fn new_write_same(
        image: Arc<ImageContext>,
        oid: String,
        object_no: u64,
        offset: u64,
        data: Bytes,
        length: u64,
        snapshot: SnapshotContext,
        hide_enoent: bool,
    ) -> Self {
        let extent = Extent::new(offset, length);
        Self::new(
            image,
            oid,
            object_no,
            extent,
            WritePayload::WriteSame { offset, data, length },
            snapshot,
            hide_enoent,
        )
        .await
    }

    pub async fn new_compare_and_write(
        image: Arc<ImageContext>,
        oid: String,
        object_no: u64,
        offset: u64,
        expect: Bytes,
        data: Bytes,
        snapshot: SnapshotContext,
        hide_enoent: bool,
    ) -> Self {
        let extent = Extent::new(offset, expect.len().max(data.len()).max(1) as u64);
        Self::new(
            image,
            oid,
            object_no,
            extent,
            WritePayload::CompareAndWrite { offset, expect, data },
            snapshot,
            hide_enoent,
        )
        .await
    }

    async fn new(
        image: Arc<ImageContext>,
        oid: String,
        object_no: u64,
        extent: Extent,
        payload: WritePayload,
        snapshot: SnapshotContext,
        hide_enoent: bool,
    ) -> Self {
        // Writes always target HEAD: a write to a read snapshot is not a
        // concept this engine models (spec.md §3 "snapshot id: either HEAD
        // ... or a specific read snapshot" applies to the common state, but
        // only reads legitimately target a non-HEAD snapshot).
        let (core, has_overlap) = AioRequestCore::new(image, oid, object_no, extent, SnapId::Head, hide_enoent).await;
        Self { core, payload, snapshot, initial_has_overlap: has_overlap }
    }

    /// Drives the state machine to completion (spec.md §4.3 `send`). Runs
    /// under the image's owner lock for its whole duration, matching the
    /// caller-held invariant in spec.md §5.
    pub async fn send(self) -> i64 {
        let _owner = self.core.image.owner_lock.read().await;

        let result = match self.send_pre().await {
            Ok(()) => self.run_write().await,
            Err(err) => Err(err),
        };

        self.core.complete(result)
    }

    /// spec.md §4.3 `send_pre`: conditionally transitions the object map to
    /// the pre-write state. No-ops entirely when the map is disabled (B3) or
    /// already in the desired state (P4).
    async fn send_pre(&self) -> Result<()> {
        if !self.core.image.object_map.enabled() {
            return Ok(());
        }
        debug_assert!(
            self.core.image.watcher.is_lock_owner(),
            "send_pre requires local exclusive-lock ownership"
        );

        let new_state = self.payload.pre_object_map_state();
        let current = self.core.image.object_map.get(self.core.object_no).await;
        if current == new_state {
            trace!(object_no = self.core.object_no, ?new_state, "send_pre: no-op, already in target state");
            return Ok(());
        }

        trace!(object_no = self.core.object_no, ?new_state, state = ?WriteState::Pre, "send_pre: issuing async update");
        let accepted = self.core.image.object_map.aio_update(self.core.object_no, new_state, None).await?;
        if !accepted {
            return Err(CloneIoError::Invariant("object map rejected an unconditional pre-write update".into()));
        }
        Ok(())
    }

    /// spec.md §4.3 `send_write` + `guard_write`: issues the primary write,
    /// prepending `assert_exists` when the request has parent overlap.
    async fn run_write(&self) -> Result<i64> {
        let guarded = self.initial_has_overlap;
        let mut op = WriteOp::new();
        if guarded {
            op = op.assert_exists();
            trace!(object_no = self.core.object_no, state = ?WriteState::Guard, "guard_write: prepending assert_exists");
        } else {
            trace!(object_no = self.core.object_no, state = ?WriteState::Flat, "send_write: no guard needed");
        }
        op.steps.extend(self.payload.to_write_steps());

        let result = self.core.image.object_store.aio_operate(&self.core.oid, op, self.snapshot.clone()).await;

        if !guarded {
            return self.send_post(result).await;
        }

        match result {
            Err(CloneIoError::NotFound) => self.handle_guard_enoent().await,
            Err(err) => {
                trace!(object_no = self.core.object_no, state = ?WriteState::Error, "guarded write failed");
                Err(err)
            }
            Ok(bytes) => self.send_post(Ok(bytes)).await,
        }
    }

    /// spec.md §4.3 WRITE_GUARD's `-ENOENT` branch: recompute overlap for the
    /// actual sub-extent and either materialise via copyup or fall through to
    /// a flat write.
    async fn handle_guard_enoent(&self) -> Result<i64> {
        let has_overlap = self.core.compute_parent_extents().await;
        if !has_overlap {
            trace!(object_no = self.core.object_no, state = ?WriteState::Flat, "parent vanished: no-op copyup + flat write");
            let mut op = WriteOp::new();
            op.steps.extend(self.payload.to_write_steps());
            let result = self.core.image.object_store.aio_operate(&self.core.oid, op, self.snapshot.clone()).await;
            return self.send_post(result).await;
        }

        trace!(object_no = self.core.object_no, state = ?WriteState::Copyup, "materialising via copyup");
        let extents = self.core.parent_extents().await;
        let result = if self.core.copy_on_read_enabled() {
            self.copyup_via_coordinator(extents).await
        } else {
            self.copyup_solo(extents).await
        };
        self.send_post(result).await
    }

    /// Coordinates with other concurrent writers/readers via the
    /// `CopyupCoordinator` (invariant I3, I4). This write always appends
    /// itself as a waiter, even when it is the one creating the request,
    /// and never issues its own copyup op; the `CopyupRequest` issues exactly
    /// one combined op for every participant (spec.md §4.4).
    async fn copyup_via_coordinator(&self, extents: Vec<Extent>) -> Result<i64> {
        let image = Arc::clone(&self.core.image);
        let object_no = self.core.object_no;
        let oid = self.core.oid.clone();
        let snapshot = self.snapshot.clone();

        let (request, created) = image
            .copyup
            .get_or_create(object_no, || {
                new_copyup_request(
                    object_no,
                    oid,
                    extents.clone(),
                    snapshot,
                    Arc::clone(&image.object_store),
                    Arc::clone(&image.parent_reader),
                    image.copyup.clone(),
                )
            })
            .await;

        let my_steps = self.payload.to_write_steps();
        let rx = match request.append_request(my_steps).await {
            Ok(rx) => rx,
            Err(_steps) => {
                // Phase 2 already started without us: fall back to a direct
                // solo copyup rather than lose this write (Design Notes:
                // reject-late-appends path).
                debug!(object_no, "copyup request already in phase 2, falling back to solo copyup");
                return self.copyup_solo(extents).await;
            }
        };

        if created {
            debug!(object_no, "this write originated the copyup request");
            request.send().await;
        }

        rx.await.map_err(|_| CloneIoError::Invariant("copyup request dropped without delivering a result".into()))?
    }

    /// Direct materialisation with no coordinator involvement, used when
    /// copy-on-read is disabled (spec.md §4.3: "issue read_from_parent ...
    /// directly") and as the fallback when a late append is rejected.
    async fn copyup_solo(&self, extents: Vec<Extent>) -> Result<i64> {
        let data = self.core.read_from_parent(&extents).await.unwrap_or_default();
        let mut op = WriteOp::new();
        if !data.is_empty() {
            op = op.exec("rbd", "copyup", data);
        }
        op.steps.extend(self.payload.to_write_steps());
        self.core.image.object_store.aio_operate(&self.core.oid, op, self.snapshot.clone()).await
    }

    /// spec.md §4.3 `send_post`: the symmetric ObjectMap transition,
    /// typically `Pending -> NonExistent` for discard semantics. A CAS
    /// mismatch here (another actor already moved the cell) is treated as
    /// idempotent success rather than an assertion failure (spec.md §9 open
    /// question).
    async fn send_post(&self, result: Result<i64>) -> Result<i64> {
        let code = result?;

        if let Some(target) = self.payload.post_object_map_state() {
            if self.core.image.object_map.enabled() {
                let current = self.core.image.object_map.get(self.core.object_no).await;
                if current == ObjectState::Pending {
                    trace!(object_no = self.core.object_no, state = ?WriteState::Post, ?target, "send_post: transitioning");
                    self.core
                        .image
                        .object_map
                        .aio_update(self.core.object_no, target, Some(ObjectState::Pending))
                        .await?;
                }
            }
        }

        Ok(code)
    }
}
