//! Recording doubles for the core's collaborators
//!
//! Used by the crate's own tests and by the headless driver. Each double
//! records what it was told so a caller can assert on the event order.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::buffer::BufferId;
use crate::error::{FaultCode, PlatformError};
use crate::geometry::Size;
use crate::presentation::{PresentationSink, PresentedSurface};
use crate::shell::WindowManagement;
use crate::surface::SurfaceId;
use crate::transport::{ClientBufferId, ClientConnection, ClientId};

/// An event sent to a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Error { code: FaultCode, message: String },
    FrameDone { callback: u32 },
    BufferRelease(ClientBufferId),
}

/// Client connection that records outgoing events
pub struct RecordingClient {
    id: ClientId,
    events: Mutex<Vec<ClientEvent>>,
}

impl RecordingClient {
    pub fn new(id: u32) -> Arc<Self> {
        Arc::new(Self {
            id: ClientId(id),
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<ClientEvent> {
        self.events.lock().clone()
    }

    pub fn take_events(&self) -> Vec<ClientEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn errors(&self) -> Vec<FaultCode> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ClientEvent::Error { code, .. } => Some(*code),
                _ => None,
            })
            .collect()
    }

    /// Frame callbacks fired so far, in order
    pub fn frames_done(&self) -> Vec<u32> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ClientEvent::FrameDone { callback } => Some(*callback),
                _ => None,
            })
            .collect()
    }

    pub fn releases(&self) -> Vec<ClientBufferId> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ClientEvent::BufferRelease(id) => Some(*id),
                _ => None,
            })
            .collect()
    }
}

impl ClientConnection for RecordingClient {
    fn client_id(&self) -> ClientId {
        self.id
    }

    fn post_error(&self, code: FaultCode, message: &str) {
        self.events.lock().push(ClientEvent::Error {
            code,
            message: message.to_string(),
        });
    }

    fn send_frame_done(&self, callback_id: u32, _timestamp_ms: u32) {
        self.events
            .lock()
            .push(ClientEvent::FrameDone { callback: callback_id });
    }

    fn send_buffer_release(&self, buffer: ClientBufferId) {
        self.events.lock().push(ClientEvent::BufferRelease(buffer));
    }
}

/// One surface of a recorded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedSurface {
    pub surface: SurfaceId,
    pub buffer: BufferId,
    pub fresh: bool,
}

/// Presentation sink that records every frame; can be told to fail
#[derive(Default)]
pub struct RecordingSink {
    frames: Vec<Vec<RecordedSurface>>,
    fail_next: bool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> &[Vec<RecordedSurface>] {
        &self.frames
    }

    pub fn last_frame(&self) -> Option<&[RecordedSurface]> {
        self.frames.last().map(Vec::as_slice)
    }

    pub fn fail_next(&mut self) {
        self.fail_next = true;
    }
}

impl PresentationSink for RecordingSink {
    fn present(&mut self, frame: &[PresentedSurface]) -> Result<(), PlatformError> {
        if std::mem::take(&mut self.fail_next) {
            return Err(PlatformError::Presentation("injected failure".into()));
        }
        self.frames.push(
            frame
                .iter()
                .map(|s| RecordedSurface {
                    surface: s.renderable.surface,
                    buffer: s.buffer.id(),
                    fresh: s.fresh,
                })
                .collect(),
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEvent {
    Mapped(SurfaceId, Size),
    Unmapped(SurfaceId),
}

/// Window management that records map and unmap notifications
#[derive(Default)]
pub struct RecordingShell {
    events: Mutex<Vec<ShellEvent>>,
}

impl RecordingShell {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<ShellEvent> {
        self.events.lock().clone()
    }
}

impl WindowManagement for RecordingShell {
    fn toplevel_mapped(&self, surface: SurfaceId, size: Size) {
        self.events.lock().push(ShellEvent::Mapped(surface, size));
    }

    fn toplevel_unmapped(&self, surface: SurfaceId) {
        self.events.lock().push(ShellEvent::Unmapped(surface));
    }
}
