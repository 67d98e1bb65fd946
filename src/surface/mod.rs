//! Surfaces
//!
//! A [`Surface`] owns its double-buffered state, its role, its place in the
//! surface tree and the [`BufferStream`] its buffers are submitted to. The
//! staging requests here only touch pending state; commit and everything that
//! needs other surfaces lives on [`crate::compositor::Compositor`].
//!
//! The part of a surface that outlives a commit on other threads (frame
//! callbacks fired from buffer consumption, liveness) is in [`SurfaceShared`],
//! which deferred work reaches through a `Weak` reference.

pub mod role;
pub mod state;

pub use role::{Role, RoleKind, RoleRequest};
pub use state::{CurrentState, InputShape, PendingState, Staged};

use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::compositor::SurfaceData;
use crate::geometry::{Displacement, Rectangle};
use crate::swapchain::BufferStream;
use crate::transport::{frame_timestamp_ms, AttachedBuffer, ClientConnection, FrameCallback};

static NEXT_SURFACE_ID: AtomicU32 = AtomicU32::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(u32);

impl SurfaceId {
    pub(crate) fn next() -> Self {
        SurfaceId(NEXT_SURFACE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

/// Frame callbacks waiting for a buffer to be consumed
///
/// Each queued callback is tagged with the generation of the newest buffer
/// committed when it was queued; consuming buffer `g` fires every callback
/// tagged `g` or older.
#[derive(Default)]
struct CallbackQueue {
    generation: u64,
    callbacks: Vec<(u64, FrameCallback)>,
}

/// Per-surface state reachable from deferred work
pub struct SurfaceShared {
    id: SurfaceId,
    client: Arc<dyn ClientConnection>,
    alive: AtomicBool,
    frames: Mutex<CallbackQueue>,
}

impl SurfaceShared {
    fn new(id: SurfaceId, client: Arc<dyn ClientConnection>) -> Self {
        Self {
            id,
            client,
            alive: AtomicBool::new(true),
            frames: Mutex::new(CallbackQueue::default()),
        }
    }

    pub fn id(&self) -> SurfaceId {
        self.id
    }

    pub fn client(&self) -> &Arc<dyn ClientConnection> {
        &self.client
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub(crate) fn mark_destroyed(&self) {
        self.alive.store(false, Ordering::Release);
        self.frames.lock().callbacks.clear();
    }

    /// Starts a new buffer generation and returns it
    pub(crate) fn next_generation(&self) -> u64 {
        let mut frames = self.frames.lock();
        frames.generation += 1;
        frames.generation
    }

    /// Queues callbacks against the newest buffer generation
    pub(crate) fn queue_callbacks(&self, callbacks: Vec<FrameCallback>) {
        if callbacks.is_empty() {
            return;
        }
        let mut frames = self.frames.lock();
        let generation = frames.generation;
        frames
            .callbacks
            .extend(callbacks.into_iter().map(|cb| (generation, cb)));
    }

    pub fn queued_callbacks(&self) -> usize {
        self.frames.lock().callbacks.len()
    }

    /// Fires callbacks whose buffer (or an older one) has been consumed
    pub(crate) fn send_frame_callbacks_upto(&self, generation: u64) -> usize {
        let due: Vec<FrameCallback> = {
            let mut frames = self.frames.lock();
            let (due, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut frames.callbacks)
                .into_iter()
                .partition(|(g, _)| *g <= generation);
            frames.callbacks = keep;
            due.into_iter().map(|(_, cb)| cb).collect()
        };
        self.fire(due)
    }

    /// Fires every queued callback
    pub(crate) fn send_frame_callbacks(&self) -> usize {
        let due: Vec<FrameCallback> = std::mem::take(&mut self.frames.lock().callbacks)
            .into_iter()
            .map(|(_, cb)| cb)
            .collect();
        self.fire(due)
    }

    fn fire(&self, callbacks: Vec<FrameCallback>) -> usize {
        if callbacks.is_empty() {
            return 0;
        }
        let timestamp = frame_timestamp_ms();
        for callback in &callbacks {
            callback.fire(self.client.as_ref(), timestamp);
        }
        debug!("🎞️ Sent {} frame callbacks for {:?}", callbacks.len(), self.id);
        callbacks.len()
    }
}

pub struct Surface {
    id: SurfaceId,
    shared: Arc<SurfaceShared>,
    pub(crate) pending: PendingState,
    pub(crate) current: CurrentState,
    pub(crate) role: Role,
    pub(crate) parent: Option<SurfaceId>,
    /// Children in paint order, bottom-most first
    pub(crate) children: Vec<SurfaceId>,
    stream: Arc<BufferStream>,
    pub(crate) data_cache: Option<Arc<SurfaceData>>,
}

impl Surface {
    pub(crate) fn new(client: Arc<dyn ClientConnection>, stream: Arc<BufferStream>) -> Self {
        let id = SurfaceId::next();
        Self {
            id,
            shared: Arc::new(SurfaceShared::new(id, client)),
            pending: PendingState::default(),
            current: CurrentState::default(),
            role: Role::None,
            parent: None,
            children: Vec::new(),
            stream,
            data_cache: None,
        }
    }

    pub fn id(&self) -> SurfaceId {
        self.id
    }

    pub fn shared(&self) -> &Arc<SurfaceShared> {
        &self.shared
    }

    pub fn client(&self) -> &Arc<dyn ClientConnection> {
        &self.shared.client
    }

    pub fn stream(&self) -> &Arc<BufferStream> {
        &self.stream
    }

    pub fn current(&self) -> &CurrentState {
        &self.current
    }

    pub fn pending(&self) -> &PendingState {
        &self.pending
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn role_kind(&self) -> RoleKind {
        self.role.kind()
    }

    pub fn parent(&self) -> Option<SurfaceId> {
        self.parent
    }

    pub fn children(&self) -> &[SurfaceId] {
        &self.children
    }

    pub fn is_mapped(&self) -> bool {
        self.current.is_mapped()
    }

    /// Stages a buffer, or an explicit unmap with `None`
    pub fn attach(&mut self, buffer: Option<AttachedBuffer>, dx: i32, dy: i32) {
        self.pending.buffer = match buffer {
            Some(buffer) => Staged::Set(buffer),
            None => Staged::Cleared,
        };
        self.pending.buffer_offset = Some(Displacement::new(dx, dy));
    }

    pub fn damage(&mut self, rect: Rectangle) {
        self.pending.damage.push(rect);
    }

    pub fn damage_buffer(&mut self, rect: Rectangle) {
        self.pending.buffer_damage.push(rect);
    }

    pub fn frame(&mut self, callback: FrameCallback) {
        self.pending.frame_callbacks.push(callback);
    }

    /// Stages the input region; `None` restores the whole-surface default
    pub fn set_input_region(&mut self, region: Option<Vec<Rectangle>>) {
        self.pending.input_shape = match region {
            Some(rects) => Staged::Set(rects),
            None => Staged::Cleared,
        };
    }

    /// Stages the position relative to the parent
    pub fn set_pending_offset(&mut self, offset: Displacement) {
        self.pending.offset = Some(offset);
    }

    /// Stages the buffer scale; the caller has checked `scale >= 1`
    pub(crate) fn set_buffer_scale(&mut self, scale: i32) {
        self.pending.scale = Some(scale);
    }

    pub(crate) fn teardown(&mut self) {
        self.shared.mark_destroyed();
        self.role = Role::None;
        self.pending = PendingState::default();
        if let Err(e) = self.stream.drain() {
            warn!("⚠️ Failed to drain stream of {:?}: {}", self.id, e);
        }
    }
}

impl std::fmt::Debug for Surface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Surface")
            .field("id", &self.id)
            .field("role", &self.role.kind())
            .field("parent", &self.parent)
            .field("children", &self.children)
            .field("current", &self.current)
            .finish()
    }
}
