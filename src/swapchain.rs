//! Per-surface buffer streams
//!
//! A [`BufferStream`] sits between a surface (the producer, submitting one
//! buffer per commit) and the presentation sink (the consumer, acquiring on its
//! own cadence). Two buffering policies are available:
//!
//! - **Mailbox**: at most one buffer waits. A new submission supersedes the
//!   waiting one, which goes straight back to the free pool. Latency is bounded
//!   to a single frame regardless of how fast the client draws.
//! - **Queue**: up to `depth` buffers wait in submission order. When full, the
//!   oldest waiting buffer is dropped back to the pool.
//!
//! Slot state:
//!
//! ```text
//! empty --submit--> pending --acquire--> in-flight --release--> empty
//!                   pending --submit---> pending (previous buffer released)
//! ```
//!
//! A buffer's consumed notification fires on its first acquire, never on submit.

use log::{debug, error};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::allocator::FreePool;
use crate::buffer::BufferHandle;
use crate::error::InternalError;
use crate::geometry::Size;

/// Deepest queue a stream accepts
pub const MAX_QUEUE_DEPTH: usize = 8;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(u64);

/// Buffering policy of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapchainMode {
    Mailbox,
    Queue { depth: usize },
}

impl SwapchainMode {
    fn capacity(&self) -> usize {
        match self {
            SwapchainMode::Mailbox => 1,
            SwapchainMode::Queue { depth } => (*depth).clamp(1, MAX_QUEUE_DEPTH),
        }
    }
}

impl Default for SwapchainMode {
    fn default() -> Self {
        SwapchainMode::Mailbox
    }
}

/// Stream counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub submitted: u64,
    /// Buffers superseded before any consumer saw them
    pub dropped: u64,
    pub acquired: u64,
    pub released: u64,
}

#[derive(Default)]
struct SlotState {
    awaiting: VecDeque<BufferHandle>,
    in_flight: Vec<BufferHandle>,
    stats: StreamStats,
}

impl SlotState {
    fn contains(&self, handle: &BufferHandle) -> bool {
        self.awaiting.iter().any(|h| h.ptr_eq(handle))
            || self.in_flight.iter().any(|h| h.ptr_eq(handle))
    }
}

pub struct BufferStream {
    id: StreamId,
    mode: SwapchainMode,
    pool: Arc<FreePool>,
    state: Mutex<SlotState>,
}

impl BufferStream {
    pub fn new(mode: SwapchainMode, pool: Arc<FreePool>) -> Self {
        Self {
            id: StreamId(NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed)),
            mode,
            pool,
            state: Mutex::new(SlotState::default()),
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn mode(&self) -> SwapchainMode {
        self.mode
    }

    /// Queues a buffer for presentation; never blocks
    ///
    /// Buffers pushed out by the buffering policy are released to the free pool
    /// before this returns.
    pub fn submit(&self, handle: BufferHandle) -> Result<(), InternalError> {
        let superseded = {
            let mut state = self.state.lock();
            if state.contains(&handle) {
                error!("💥 Buffer {:?} submitted to {:?} twice", handle.id(), self.id);
                return Err(InternalError::AlreadyQueued(handle.id()));
            }
            let mut superseded = Vec::new();
            while state.awaiting.len() >= self.mode.capacity() {
                if let Some(old) = state.awaiting.pop_front() {
                    superseded.push(old);
                }
            }
            state.awaiting.push_back(handle);
            state.stats.submitted += 1;
            state.stats.dropped += superseded.len() as u64;
            superseded
        };

        for old in superseded {
            debug!("⏭️ Buffer {:?} superseded before presentation", old.id());
            self.pool.give_back(old)?;
        }
        Ok(())
    }

    /// Takes the next buffer for presentation, if one is waiting
    ///
    /// Fires the buffer's consumed notification the first time it is acquired.
    pub fn acquire(&self) -> Option<BufferHandle> {
        let handle = {
            let mut state = self.state.lock();
            let handle = state.awaiting.pop_front()?;
            state.in_flight.push(handle.clone());
            state.stats.acquired += 1;
            handle
        };
        handle.mark_consumed();
        Some(handle)
    }

    /// Hands a presented buffer back to the free pool
    pub fn release(&self, handle: &BufferHandle) -> Result<(), InternalError> {
        let released = {
            let mut state = self.state.lock();
            let position = state.in_flight.iter().position(|h| h.ptr_eq(handle));
            match position {
                Some(index) => {
                    state.stats.released += 1;
                    state.in_flight.swap_remove(index)
                }
                None => {
                    error!(
                        "💥 Buffer {:?} released to {:?} but it is not in flight",
                        handle.id(),
                        self.id
                    );
                    return Err(InternalError::NotInFlight(handle.id()));
                }
            }
        };
        self.pool.give_back(released)
    }

    /// Releases every waiting buffer; in-flight buffers stay with the consumer
    pub fn drain(&self) -> Result<usize, InternalError> {
        let drained: Vec<BufferHandle> = self.state.lock().awaiting.drain(..).collect();
        let count = drained.len();
        for handle in drained {
            self.pool.give_back(handle)?;
        }
        Ok(count)
    }

    pub fn has_pending(&self) -> bool {
        !self.state.lock().awaiting.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().awaiting.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Size of the newest buffer in the stream
    pub fn stream_size(&self) -> Option<Size> {
        let state = self.state.lock();
        state
            .awaiting
            .back()
            .or_else(|| state.in_flight.last())
            .map(|h| h.size())
    }

    /// Whether any waiting buffer still has its consumed notification armed
    pub fn has_unconsumed(&self) -> bool {
        self.state
            .lock()
            .awaiting
            .iter()
            .any(|h| h.awaiting_consumption())
    }

    pub fn stats(&self) -> StreamStats {
        self.state.lock().stats.clone()
    }
}

impl std::fmt::Debug for BufferStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferStream")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .finish()
    }
}
