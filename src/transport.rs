//! Transport-facing interfaces
//!
//! Decoded client requests arrive as method calls on the compositor; outgoing
//! traffic leaves through [`ClientConnection`]. The core never sees wire bytes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::allocator::ClientBuffer;
use crate::error::FaultCode;

/// Identity of a client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u32);

/// Outgoing side of one client connection
pub trait ClientConnection: Send + Sync {
    fn client_id(&self) -> ClientId;

    /// Posts a fatal protocol error; the transport disconnects the client afterwards
    fn post_error(&self, code: FaultCode, message: &str);

    fn send_frame_done(&self, callback_id: u32, timestamp_ms: u32);

    /// Tells the client it may reuse a buffer it attached
    fn send_buffer_release(&self, buffer: ClientBufferId);
}

/// Protocol object id of a client-side buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientBufferId(pub u32);

/// A client buffer as named by an attach request
///
/// `destroyed` is set by the transport when the client destroys the buffer
/// object; release events for it are then suppressed.
#[derive(Debug, Clone)]
pub struct AttachedBuffer {
    pub id: ClientBufferId,
    pub buffer: ClientBuffer,
    destroyed: Arc<AtomicBool>,
}

impl AttachedBuffer {
    pub fn new(id: ClientBufferId, buffer: ClientBuffer) -> Self {
        Self {
            id,
            buffer,
            destroyed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn destroyed_flag(&self) -> Arc<AtomicBool> {
        self.destroyed.clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }
}

/// A frame-completion callback requested by a client
///
/// The `destroyed` flag is shared with the transport, which sets it if the
/// client destroys the callback object before it fires.
#[derive(Clone)]
pub struct FrameCallback {
    pub id: u32,
    destroyed: Arc<AtomicBool>,
}

impl FrameCallback {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            destroyed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle the transport uses to mark the callback destroyed
    pub fn destroyed_flag(&self) -> Arc<AtomicBool> {
        self.destroyed.clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Sends `done` unless the callback object is already gone
    pub fn fire(&self, client: &dyn ClientConnection, timestamp_ms: u32) {
        if !self.is_destroyed() {
            client.send_frame_done(self.id, timestamp_ms);
            self.destroyed.store(true, Ordering::Release);
        }
    }
}

impl std::fmt::Debug for FrameCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCallback")
            .field("id", &self.id)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

/// Millisecond timestamp for frame-done events; wraps like the protocol field
pub fn frame_timestamp_ms() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or_default()
}

