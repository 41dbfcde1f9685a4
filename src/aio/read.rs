//! `AioRead`: the read-side per-object state machine (spec.md §4.2).

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace};

use super::AioRequestCore;
use crate::copyup::new_copyup_request;
use crate::error::{CloneIoError, Result};
use crate::extent::Extent;
use crate::image::ImageContext;
use crate::object_store::{ObjectStore, SnapId, SparseReadResult};

/// States named in spec.md §4.2. `READ_GUARD` is the default iff parent
/// overlap exists at construction time; otherwise the request never leaves
/// `READ_FLAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    Flat,
    Guard,
    Copyup,
}

/// Outcome delivered to the caller's completion: a single result code (bytes
/// read on success, negative on error) plus whatever data was actually read.
#[derive(Debug, Clone)]
pub struct ReadOutcome {
    pub code: i64,
    pub data: Option<Bytes>,
    pub sparse: Option<SparseReadResult>,
}

impl ReadOutcome {
    fn success(data: Bytes) -> Self {
        let code = data.len() as i64;
        Self { code, data: Some(data), sparse: None }
    }

    fn success_sparse(result: SparseReadResult) -> Self {
        let code = result.total_bytes() as i64;
        Self { code, data: None, sparse: Some(result) }
    }

    fn error(err: CloneIoError, hide_enoent: bool) -> Self {
        let code = match &err {
            CloneIoError::NotFound if hide_enoent => 0,
            CloneIoError::Invariant(msg) => panic!("cloneio invariant violated: {msg}"),
            other => other.to_raw(),
        };
        Self { code, data: None, sparse: None }
    }
}

pub struct AioRead {
    core: AioRequestCore,
    sparse: bool,
    op_flags: u32,
    initial_state: ReadState,
}

impl AioRead {
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        image: Arc<ImageContext>,
        oid: String,
        object_no: u64,
        extent: Extent,
        snap_id: SnapId,
        hide_enoent: bool,
        sparse: bool,
        op_flags: u32,
    ) -> Self {
        let (core, has_overlap) = AioRequestCore::new(image, oid, object_no, extent, snap_id, hide_enoent).await;
        let initial_state = if has_overlap { ReadState::Guard } else { ReadState::Flat };
        Self { core, sparse, op_flags, initial_state }
    }

    async fn issue_read(&self) -> Result<ReadOutcome> {
        if self.sparse {
            let r = self
                .core
                .image
                .object_store
                .aio_sparse_read(&self.core.oid, self.core.extent.offset, self.core.extent.length, self.op_flags)
                .await?;
            Ok(ReadOutcome::success_sparse(r))
        } else {
            let r = self
                .core
                .image
                .object_store
                .aio_read(&self.core.oid, self.core.extent.offset, self.core.extent.length, self.op_flags)
                .await?;
            Ok(ReadOutcome::success(r))
        }
    }

    /// Drives the state machine to completion and returns the outcome
    /// delivered to the caller's completion callback (spec.md §4.1 `complete`,
    /// §4.2). Consumes `self`: once this returns, the request no longer
    /// exists, satisfying P2 by construction.
    pub async fn send(self) -> ReadOutcome {
        if !self.core.image.object_map.object_may_exist(self.core.object_no).await {
            debug!(object_no = self.core.object_no, "read short-circuited: object cannot exist");
            return ReadOutcome::error(CloneIoError::NotFound, self.core.hide_enoent);
        }

        let mut state = self.initial_state;
        let mut tried_parent = false;

        loop {
            trace!(object_no = self.core.object_no, ?state, "read state transition");
            match state {
                ReadState::Flat => {
                    return match self.issue_read().await {
                        Ok(outcome) => outcome,
                        Err(err) => ReadOutcome::error(err, self.core.hide_enoent),
                    };
                }
                ReadState::Guard => match self.issue_read().await {
                    Ok(outcome) => return outcome,
                    Err(CloneIoError::NotFound) if !tried_parent => {
                        tried_parent = true;
                        let has_overlap = self.core.compute_parent_extents().await;
                        if !has_overlap {
                            // Parent vanished or no longer overlaps: the
                            // request settles in READ_FLAT and the answer is
                            // an empty/zero-filled read, not an error
                            // (spec.md §8 B2).
                            return ReadOutcome::success(Bytes::new());
                        }

                        if self.core.copy_on_read_enabled() {
                            state = ReadState::Copyup;
                        }

                        let extents = self.core.parent_extents().await;
                        let parent_result = self.core.read_from_parent(&extents).await;

                        if state == ReadState::Copyup {
                            if let Ok(ref bytes) = parent_result {
                                if !bytes.is_empty() {
                                    self.enqueue_copyup(extents).await;
                                }
                            }
                        }

                        return match parent_result {
                            Ok(bytes) => ReadOutcome::success(bytes),
                            Err(err) => ReadOutcome::error(err, self.core.hide_enoent),
                        };
                    }
                    Err(err) => return ReadOutcome::error(err, self.core.hide_enoent),
                },
                ReadState::Copyup => unreachable!("Copyup is only entered inline within Guard's handling"),
            }
        }
    }

    /// Looks up (or creates) the per-object `CopyupRequest` and queues it as
    /// fire-and-forget background work (spec.md §4.2 READ_COPYUP, §4.4).
    async fn enqueue_copyup(&self, parent_extents: Vec<Extent>) {
        let object_no = self.core.object_no;
        let oid = self.core.oid.clone();
        let image = Arc::clone(&self.core.image);

        let (request, created) = image
            .copyup
            .get_or_create(object_no, || {
                new_copyup_request(
                    object_no,
                    oid,
                    parent_extents,
                    Default::default(),
                    Arc::clone(&image.object_store),
                    Arc::clone(&image.parent_reader),
                    image.copyup.clone(),
                )
            })
            .await;

        if created {
            debug!(object_no, "copy-on-read: queuing deduplicated copyup");
            request.queue_send();
        }
        // If not created, some other reader/writer already owns the
        // materialisation of this object; nothing further to do here.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extent::{LinearExtentMapper, StripeLayout};
    use crate::image::{AlwaysLockOwner, ImageConfig, ImageContext};
    use crate::object_map::InMemoryObjectMap;
    use crate::parent::StaticParentImageReader;
    use crate::parent::StaticParentOverlapView;
    use crate::testutil::InMemoryObjectStore;
    use tokio::sync::RwLock;

    fn image_with(
        object_map: InMemoryObjectMap,
        store: InMemoryObjectStore,
        overlap: StaticParentOverlapView,
        parent_data: &'static [u8],
        copy_on_read: bool,
    ) -> Arc<ImageContext> {
        Arc::new(ImageContext {
            config: ImageConfig { clone_copy_on_read: copy_on_read, read_only: false },
            extent_mapper: Arc::new(LinearExtentMapper { layout: StripeLayout::unstriped(4096) }),
            object_map: Arc::new(object_map),
            object_store: Arc::new(store),
            parent_overlap: Arc::new(overlap),
            parent_reader: Arc::new(StaticParentImageReader { data: Bytes::from_static(parent_data) }),
            watcher: Arc::new(AlwaysLockOwner),
            copyup: crate::copyup::CopyupCoordinator::new(),
            snap_lock: RwLock::new(()),
            parent_lock: RwLock::new(()),
            owner_lock: RwLock::new(()),
            object_size: 4096,
        })
    }

    #[tokio::test]
    async fn read_present_object_never_touches_parent() {
        let store = InMemoryObjectStore::new();
        store.seed("rb.0.1.0", b"payload").await;
        let image = image_with(
            InMemoryObjectMap::new(4, crate::object_map::ObjectState::Exists),
            store,
            StaticParentOverlapView::new(0),
            b"",
            true,
        );

        let read = AioRead::new(image, "rb.0.1.0".into(), 0, Extent::new(0, 7), SnapId::Head, false, false, 0).await;
        let outcome = read.send().await;
        assert_eq!(outcome.code, 7);
        assert_eq!(outcome.data.as_deref(), Some(b"payload".as_slice()));
    }

    #[tokio::test]
    async fn read_absent_no_parent_surfaces_enoent() {
        let image = image_with(
            InMemoryObjectMap::new(4, crate::object_map::ObjectState::Exists),
            InMemoryObjectStore::new(),
            StaticParentOverlapView::new(0),
            b"",
            true,
        );

        let read = AioRead::new(image, "rb.0.1.0".into(), 0, Extent::new(0, 16), SnapId::Head, false, false, 0).await;
        let outcome = read.send().await;
        assert_eq!(outcome.code, crate::error::ENOENT);
    }

    #[tokio::test]
    async fn read_falls_back_to_parent_and_queues_copyup() {
        let image = image_with(
            InMemoryObjectMap::new(4, crate::object_map::ObjectState::Exists),
            InMemoryObjectStore::new(),
            StaticParentOverlapView::new(4096),
            b"parentbytes",
            true,
        );

        let read = AioRead::new(image.clone(), "rb.0.1.0".into(), 0, Extent::new(0, 11), SnapId::Head, false, false, 0).await;
        let outcome = read.send().await;
        assert_eq!(outcome.code, 11);
        assert_eq!(outcome.data.as_deref(), Some(b"parentbytes".as_slice()));

        // Copyup is fire-and-forget; give the spawned task a chance to run.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let store_ref = &image.object_store;
        let _ = store_ref; // The copyup targets the object store through the same Arc used above.
    }

    #[tokio::test]
    async fn object_map_short_circuits_before_touching_store() {
        let image = image_with(
            InMemoryObjectMap::new(4, crate::object_map::ObjectState::NonExistent),
            InMemoryObjectStore::new(),
            StaticParentOverlapView::new(4096),
            b"parentbytes",
            true,
        );

        let read = AioRead::new(image, "rb.0.1.0".into(), 0, Extent::new(0, 16), SnapId::Head, true, false, 0).await;
        let outcome = read.send().await;
        assert_eq!(outcome.code, 0, "hide_enoent maps NotFound to success");
    }
}
