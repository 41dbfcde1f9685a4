//! Deduplicated materialisation of parent data into a child object.
//!
//! A [`CopyupRequest`] is the only path by which parent bytes are written into a
//! backing object. The [`CopyupCoordinator`] guarantees invariant I3: at most one
//! `CopyupRequest` per `(image, object number)` exists at a time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, trace};

use crate::error::Result;
use crate::extent::Extent;
use crate::object_store::{ObjectStore, SnapshotContext, WriteOp, WriteStep};
use crate::parent::ParentImageReader;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CopyupState {
    New,
    ReadingParent,
    WritingCopyup,
    Done,
}

/// A write appended to an in-flight `CopyupRequest`. Its payload steps are
/// combined into the single atomic op the coordinator issues; `notify` is how
/// the waiter's `send_copyup` continuation learns the combined op's result
/// (standing in for re-entering the waiter's own `complete(r)`, spec.md §4.4
/// step 4).
pub struct Waiter {
    pub write_steps: Vec<WriteStep>,
    pub notify: oneshot::Sender<Result<i64>>,
}

/// One in-flight materialisation of a single backing object's parent extents.
pub struct CopyupRequest {
    object_no: u64,
    oid: String,
    parent_extents: Vec<Extent>,
    snapshot: SnapshotContext,
    state: Mutex<CopyupState>,
    buffer: Mutex<Option<Bytes>>,
    waiters: Mutex<Vec<Waiter>>,
    /// Set atomically with taking the waiter list at the start of phase 2.
    /// `append_request` after this point is rejected so the caller can fall
    /// back to a direct parent read + solo copyup (Design Notes: "an
    /// implementation must either reject late appends ... or hold
    /// copyup_list_lock across the phase-1->phase-2 transition"; we do both).
    phase2_started: AtomicBool,
    object_store: Arc<dyn ObjectStore>,
    parent_reader: Arc<dyn ParentImageReader>,
    coordinator: CopyupCoordinator,
}

impl CopyupRequest {
    /// Appends a waiting write's payload steps. Returns the steps back (so the
    /// caller can fall back to the slow path) if phase 2 has already begun
    /// (invariant I4's append-only-before-phase-2 rule).
    pub async fn append_request(
        &self,
        write_steps: Vec<WriteStep>,
    ) -> std::result::Result<oneshot::Receiver<Result<i64>>, Vec<WriteStep>> {
        let mut waiters = self.waiters.lock().await;
        if self.phase2_started.load(Ordering::Acquire) {
            return Err(write_steps);
        }
        let (tx, rx) = oneshot::channel();
        waiters.push(Waiter { write_steps, notify: tx });
        Ok(rx)
    }

    /// Schedules this request's execution on a background task. Used by the
    /// copy-on-read path, where the copyup is fire-and-forget relative to the
    /// read that triggered it (spec.md §4.2 READ_COPYUP).
    pub fn queue_send(self: Arc<Self>) {
        tokio::spawn(async move {
            self.send().await;
        });
    }

    /// Runs phase 1 (parent read) then phase 2 (combined copyup + appended
    /// writes) directly on the calling task. Used by the originating write,
    /// which needs to wait on the result itself (spec.md §4.4 step 1).
    pub async fn send(self: Arc<Self>) {
        *self.state.lock().await = CopyupState::ReadingParent;
        trace!(object_no = self.object_no, oid = %self.oid, "copyup: reading parent extents");

        let data = if self.parent_extents.is_empty() {
            Bytes::new()
        } else {
            match self.parent_reader.read_extents(&self.parent_extents).await {
                Ok(bytes) => bytes,
                // Parent vanished between scheduling and now: the combined op
                // degenerates to "no exec step", i.e. a no-op copyup plus
                // whatever writes were appended (spec.md §7 propagation
                // policy (c)).
                Err(_) => Bytes::new(),
            }
        };

        *self.buffer.lock().await = Some(data.clone());
        *self.state.lock().await = CopyupState::WritingCopyup;

        let waiters = {
            let mut guard = self.waiters.lock().await;
            self.phase2_started.store(true, Ordering::Release);
            std::mem::take(&mut *guard)
        };

        let mut op = WriteOp::new();
        if !data.is_empty() {
            op = op.exec("rbd", "copyup", data);
        }
        for waiter in &waiters {
            op.steps.extend(waiter.write_steps.iter().cloned());
        }

        debug!(
            object_no = self.object_no,
            oid = %self.oid,
            waiters = waiters.len(),
            "copyup: issuing combined write"
        );

        let result = self.object_store.aio_operate(&self.oid, op, self.snapshot.clone()).await;

        *self.state.lock().await = CopyupState::Done;

        for waiter in waiters {
            // Receiver may already be gone if the waiting write itself was
            // abandoned; that is fine, we only need best-effort delivery.
            let _ = waiter.notify.send(result.clone());
        }

        self.coordinator.remove(self.object_no).await;
    }
}

/// Per-image map from object number to in-flight `CopyupRequest`, deduplicating
/// materialisation across concurrent writers/readers (invariant I3).
#[derive(Clone)]
pub struct CopyupCoordinator {
    inner: Arc<Mutex<HashMap<u64, Arc<CopyupRequest>>>>,
}

impl Default for CopyupCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl CopyupCoordinator {
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Atomically looks up an existing `CopyupRequest` for `object_no`, or
    /// constructs and inserts a new one via `make`. Returns the request and
    /// whether this call was the one that created it (the caller uses that to
    /// decide whether it is the originator responsible for calling `send`).
    pub async fn get_or_create<F>(&self, object_no: u64, make: F) -> (Arc<CopyupRequest>, bool)
    where
        F: FnOnce() -> CopyupRequest,
    {
        let mut map = self.inner.lock().await;
        if let Some(existing) = map.get(&object_no) {
            return (Arc::clone(existing), false);
        }
        let request = Arc::new(make());
        map.insert(object_no, Arc::clone(&request));
        (request, true)
    }

    pub async fn remove(&self, object_no: u64) {
        self.inner.lock().await.remove(&object_no);
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

/// Constructs a new, not-yet-started `CopyupRequest`. Kept as a free function
/// (rather than `CopyupRequest::new`) because construction always happens
/// inside `CopyupCoordinator::get_or_create`'s closure, which needs a plain
/// `CopyupRequest` (not yet wrapped in `Arc`) to insert.
pub fn new_copyup_request(
    object_no: u64,
    oid: String,
    parent_extents: Vec<Extent>,
    snapshot: SnapshotContext,
    object_store: Arc<dyn ObjectStore>,
    parent_reader: Arc<dyn ParentImageReader>,
    coordinator: CopyupCoordinator,
) -> CopyupRequest {
    CopyupRequest {
        object_no,
        oid,
        parent_extents,
        snapshot,
        state: Mutex::new(CopyupState::New),
        buffer: Mutex::new(None),
        waiters: Mutex::new(Vec::new()),
        phase2_started: AtomicBool::new(false),
        object_store,
        parent_reader,
        coordinator,
    }
}
