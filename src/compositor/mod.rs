//! Compositing core
//!
//! [`Compositor`] is the registry of live surfaces and the entry point for
//! decoded client requests. It owns the commit path:
//!
//! 1. pending state is moved out of the surface (values equal to the current
//!    ones are dropped first),
//! 2. the surface's role decides whether to apply it now or cache it,
//! 3. applying resolves the attached buffer through the [`Allocator`], submits
//!    it to the surface's stream and merges the rest into current state,
//! 4. every child is told its parent committed, in paint order.
//!
//! Frame callbacks for a committed buffer are sent from the protocol
//! [`Executor`] once the presentation side first acquires that buffer. The
//! deferred work holds only a `Weak` reference to the surface, so destroying
//! the surface in the meantime is safe.
//!
//! Client faults are posted on the client connection at the point they are
//! detected and then returned as [`CommitError::Client`].
//!
//! All methods must be called from the protocol-handling context.

mod roles;
mod tree;


pub use tree::{StreamSpec, SurfaceData};

use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use crate::allocator::Allocator;
use crate::buffer::{BufferCallback, BufferHandle};
use crate::config::CoreConfig;
use crate::error::{AllocError, CommitError, FaultCode, InternalError, ProtocolError};
use crate::executor::Executor;
use crate::geometry::{Displacement, Rectangle};
use crate::logging::Span;
use crate::shell::{NoopWindowManagement, WindowManagement};
use crate::surface::{PendingState, Role, RoleKind, Staged, Surface, SurfaceId, SurfaceShared};
use crate::swapchain::{BufferStream, SwapchainMode};
use crate::transport::{AttachedBuffer, ClientConnection, FrameCallback};

pub struct Compositor {
    surfaces: BTreeMap<SurfaceId, Surface>,
    allocator: Arc<Allocator>,
    executor: Arc<dyn Executor>,
    shell: Arc<dyn WindowManagement>,
    swapchain_mode: SwapchainMode,
    prewarm_gpu_images: bool,
}

impl Compositor {
    pub fn new(allocator: Arc<Allocator>, executor: Arc<dyn Executor>, config: &CoreConfig) -> Self {
        info!(
            "🏗️ Compositing core ready (swapchain: {:?}, prewarm: {})",
            config.swapchain.mode(),
            config.allocator.prewarm_gpu_images
        );
        Self {
            surfaces: BTreeMap::new(),
            allocator,
            executor,
            shell: Arc::new(NoopWindowManagement),
            swapchain_mode: config.swapchain.mode(),
            prewarm_gpu_images: config.allocator.prewarm_gpu_images,
        }
    }

    pub fn set_window_management(&mut self, shell: Arc<dyn WindowManagement>) {
        self.shell = shell;
    }

    pub fn allocator(&self) -> &Arc<Allocator> {
        &self.allocator
    }

    pub fn create_surface(&mut self, client: Arc<dyn ClientConnection>) -> SurfaceId {
        let stream = Arc::new(BufferStream::new(
            self.swapchain_mode,
            self.allocator.pool().clone(),
        ));
        let surface = Surface::new(client, stream);
        let id = surface.id();
        debug!(
            "🆕 Surface {:?} created for client {:?}",
            id,
            surface.client().client_id()
        );
        self.surfaces.insert(id, surface);
        id
    }

    pub fn surface(&self, id: SurfaceId) -> Option<&Surface> {
        self.surfaces.get(&id)
    }

    pub fn surface_count(&self) -> usize {
        self.surfaces.len()
    }

    pub fn surface_ids(&self) -> impl Iterator<Item = SurfaceId> + '_ {
        self.surfaces.keys().copied()
    }

    fn get(&self, id: SurfaceId) -> Result<&Surface, InternalError> {
        self.surfaces.get(&id).ok_or(InternalError::UnknownSurface(id))
    }

    fn get_mut(&mut self, id: SurfaceId) -> Result<&mut Surface, InternalError> {
        self.surfaces
            .get_mut(&id)
            .ok_or(InternalError::UnknownSurface(id))
    }

    /// Posts a protocol error on the surface's client and wraps it for return
    fn client_fault(&self, id: SurfaceId, error: ProtocolError) -> CommitError {
        match self.surfaces.get(&id) {
            Some(surface) => {
                warn!("🚫 Client fault on {:?}: {}", id, error);
                surface.client().post_error(error.code, &error.message);
            }
            None => warn!("🚫 Client fault on destroyed {:?}: {}", id, error),
        }
        CommitError::Client(error)
    }

    pub fn attach(
        &mut self,
        id: SurfaceId,
        buffer: Option<AttachedBuffer>,
        dx: i32,
        dy: i32,
    ) -> Result<(), InternalError> {
        self.get_mut(id)?.attach(buffer, dx, dy);
        Ok(())
    }

    pub fn damage(&mut self, id: SurfaceId, rect: Rectangle) -> Result<(), InternalError> {
        self.get_mut(id)?.damage(rect);
        Ok(())
    }

    pub fn damage_buffer(&mut self, id: SurfaceId, rect: Rectangle) -> Result<(), InternalError> {
        self.get_mut(id)?.damage_buffer(rect);
        Ok(())
    }

    pub fn frame(&mut self, id: SurfaceId, callback: FrameCallback) -> Result<(), InternalError> {
        self.get_mut(id)?.frame(callback);
        Ok(())
    }

    pub fn set_input_region(
        &mut self,
        id: SurfaceId,
        region: Option<Vec<Rectangle>>,
    ) -> Result<(), InternalError> {
        self.get_mut(id)?.set_input_region(region);
        Ok(())
    }

    pub fn set_pending_offset(&mut self, id: SurfaceId, offset: Displacement) -> Result<(), InternalError> {
        self.get_mut(id)?.set_pending_offset(offset);
        Ok(())
    }

    pub fn set_buffer_scale(&mut self, id: SurfaceId, scale: i32) -> Result<(), CommitError> {
        if scale < 1 {
            self.get(id)?;
            return Err(self.client_fault(
                id,
                ProtocolError::new(FaultCode::InvalidScale, format!("buffer scale {} is below 1", scale)),
            ));
        }
        self.get_mut(id)?.set_buffer_scale(scale);
        Ok(())
    }

    /// Commits the surface's pending state
    pub fn commit(&mut self, id: SurfaceId) -> Result<(), CommitError> {
        let span = Span::start("commit");
        let surface = self.get_mut(id)?;
        let mut state = std::mem::take(&mut surface.pending);
        state.drop_redundant(&surface.current);

        let result = match surface.role.kind() {
            RoleKind::Subsurface => self.commit_subsurface(id, state),
            RoleKind::Cursor => self.commit_cursor(id, state),
            RoleKind::Toplevel => self.commit_toplevel(id, state),
            RoleKind::None => {
                self.ignore_attach_offset(id, &state);
                self.apply_state(id, state)
            }
        };
        span.finish();
        result
    }

    fn ignore_attach_offset(&self, id: SurfaceId, state: &PendingState) {
        if let Some(offset) = state.buffer_offset {
            if offset != Displacement::zero() {
                warn!(
                    "⚠️ {:?} attached a buffer at offset ({}, {}); attach offsets are ignored for this role",
                    id, offset.dx, offset.dy
                );
            }
        }
    }

    fn commit_toplevel(&mut self, id: SurfaceId, state: PendingState) -> Result<(), CommitError> {
        self.ignore_attach_offset(id, &state);
        self.apply_state(id, state)?;

        let surface = self.get_mut(id)?;
        let size = surface.current.logical_size();
        let Role::Toplevel(toplevel) = &mut surface.role else {
            return Ok(());
        };
        if toplevel.mapped_size == size {
            return Ok(());
        }
        toplevel.mapped_size = size;
        match size {
            Some(size) => self.shell.toplevel_mapped(id, size),
            None => self.shell.toplevel_unmapped(id),
        }
        Ok(())
    }

    fn commit_cursor(&mut self, id: SurfaceId, state: PendingState) -> Result<(), CommitError> {
        if let (Some(offset), false) = (state.buffer_offset, state.buffer.is_untouched()) {
            if let Role::Cursor(cursor) = &mut self.get_mut(id)?.role {
                cursor.hotspot = cursor.hotspot - offset;
            }
        }
        self.apply_state(id, state)
    }

    /// Hotspot of a cursor surface, relative to its top-left corner
    pub fn cursor_hotspot(&self, id: SurfaceId) -> Option<Displacement> {
        match &self.surfaces.get(&id)?.role {
            Role::Cursor(cursor) => Some(cursor.hotspot),
            _ => None,
        }
    }

    /// Merges a committed state into current state
    fn apply_state(&mut self, id: SurfaceId, mut state: PendingState) -> Result<(), CommitError> {
        let (shared, stream) = {
            let surface = self.get(id)?;
            (surface.shared().clone(), surface.stream().clone())
        };

        let buffer = match std::mem::take(&mut state.buffer) {
            Staged::Untouched => Staged::Untouched,
            Staged::Cleared => Staged::Cleared,
            Staged::Set(attached) => match self.import(&shared, &attached) {
                Ok(handle) => Staged::Set(handle),
                Err(e) => return Err(self.client_fault(id, e.into_client_fault())),
            },
        };
        let callbacks = std::mem::take(&mut state.frame_callbacks);

        let surface = self.get_mut(id)?;
        let old_size = surface.current.logical_size();
        let changes = surface.current.apply_attributes(&state);
        shared.queue_callbacks(callbacks);

        match buffer {
            Staged::Untouched => {
                // nothing new to wait for unless an earlier buffer is still unseen
                if !stream.has_unconsumed() {
                    shared.send_frame_callbacks();
                }
            }
            Staged::Cleared => {
                surface.current.buffer_size = None;
                stream.drain()?;
                shared.send_frame_callbacks();
                debug!("🙈 Surface {:?} unmapped", id);
            }
            Staged::Set(handle) => {
                if self.prewarm_gpu_images {
                    self.prewarm(&shared, handle.clone());
                }
                stream.submit(handle)?;
                let surface = self.get_mut(id)?;
                surface.current.buffer_size = stream.stream_size();
            }
        }

        let new_size = self.get(id)?.current.logical_size();
        if changes.any() || new_size != old_size {
            self.invalidate_surface_data(id);
        }

        let children = self.get(id)?.children.clone();
        for child in children {
            self.parent_committed(child)?;
        }
        Ok(())
    }

    /// Resolves an attached client buffer and wires its notifications
    fn import(&self, shared: &Arc<SurfaceShared>, attached: &AttachedBuffer) -> Result<BufferHandle, AllocError> {
        let generation = shared.next_generation();

        let weak: Weak<SurfaceShared> = Arc::downgrade(shared);
        let executor = self.executor.clone();
        let on_consumed: BufferCallback = Box::new(move || {
            executor.spawn(Box::new(move || {
                if let Some(surface) = weak.upgrade() {
                    if surface.is_alive() {
                        surface.send_frame_callbacks_upto(generation);
                    }
                }
            }))
        });

        let client = shared.client().clone();
        let executor = self.executor.clone();
        let buffer_id = attached.id;
        let destroyed = attached.destroyed_flag();
        let on_release: BufferCallback = Box::new(move || {
            executor.spawn(Box::new(move || {
                if !destroyed.load(std::sync::atomic::Ordering::Acquire) {
                    client.send_buffer_release(buffer_id);
                }
            }))
        });

        self.allocator
            .import(&attached.buffer, Some(on_consumed), Some(on_release))
    }

    /// Creates the GPU image ahead of the first bind on the render executor
    fn prewarm(&self, shared: &Arc<SurfaceShared>, handle: BufferHandle) {
        let weak = Arc::downgrade(shared);
        let executor = self.executor.clone();
        self.allocator.prepare_gpu_image(
            handle,
            Box::new(move |result| {
                if let Err(e) = result {
                    warn!("⚠️ GPU image creation failed: {}", e);
                    let fault = e.into_client_fault();
                    executor.spawn(Box::new(move || {
                        if let Some(surface) = weak.upgrade() {
                            if surface.is_alive() {
                                surface.client().post_error(fault.code, &fault.message);
                            }
                        }
                    }));
                }
            }),
        );
    }

    /// Tears a surface down, detaching it from the tree
    ///
    /// Buffers already handed to the presentation side complete their release
    /// path normally; frame callbacks still queued are dropped.
    pub fn destroy_surface(&mut self, id: SurfaceId) -> Result<(), InternalError> {
        let mut surface = self
            .surfaces
            .remove(&id)
            .ok_or(InternalError::UnknownSurface(id))?;

        if let Role::Toplevel(toplevel) = &surface.role {
            if toplevel.mapped_size.is_some() {
                self.shell.toplevel_unmapped(id);
            }
        }

        if let Some(parent) = surface.parent.take() {
            if let Some(parent_surface) = self.surfaces.get_mut(&parent) {
                parent_surface.children.retain(|child| *child != id);
            }
            self.invalidate_surface_data(parent);
        }
        for child in surface.children.drain(..) {
            if let Some(child_surface) = self.surfaces.get_mut(&child) {
                child_surface.parent = None;
            }
        }

        surface.teardown();
        debug!("🗑️ Surface {:?} destroyed", id);
        Ok(())
    }
}

impl Drop for Compositor {
    fn drop(&mut self) {
        let ids: Vec<SurfaceId> = self.surfaces.keys().copied().collect();
        for id in ids {
            if let Err(e) = self.destroy_surface(id) {
                error!("❌ Failed to tear down {:?}: {}", id, e);
            }
        }
    }
}
