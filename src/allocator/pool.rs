//! Free-buffer pool
//!
//! Where consumers hand buffers back. Client buffers are released to their
//! client and dropped; server-allocated buffers are kept for reuse, grouped by
//! size and format, so the next allocation of the same shape skips the
//! allocation entirely.
//!
//! The lock is only held to push or pop; release notifications and
//! destruction (which may touch the GPU) happen outside it.

use log::{debug, error};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

use crate::buffer::{BufferHandle, PixelFormat};
use crate::error::InternalError;
use crate::geometry::Size;

/// Default number of buffers kept per size/format
pub const DEFAULT_POOL_SIZE_PER_KEY: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PoolKey {
    size: Size,
    format: PixelFormat,
}

/// Pool counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers currently pooled
    pub pooled: usize,
    /// Buffers handed back by consumers
    pub returned: usize,
    /// Pooled buffers handed out again
    pub reused: usize,
    /// Pooled buffers dropped because their key was full
    pub evicted: usize,
}

impl PoolStats {
    pub fn reuse_rate(&self) -> f32 {
        if self.returned == 0 {
            return 0.0;
        }
        (self.reused as f32 / self.returned as f32) * 100.0
    }
}

pub struct FreePool {
    buffers: Mutex<HashMap<PoolKey, VecDeque<BufferHandle>>>,
    stats: Mutex<PoolStats>,
    max_per_key: usize,
}

impl FreePool {
    pub fn new(max_per_key: usize) -> Self {
        Self {
            buffers: Mutex::new(HashMap::new()),
            stats: Mutex::new(PoolStats::default()),
            max_per_key: max_per_key.max(1),
        }
    }

    /// Returns a buffer the consumer is done with
    ///
    /// Fires the buffer's release notification. Returning the same buffer
    /// twice without it being reused in between is an invariant violation.
    pub fn give_back(&self, buffer: BufferHandle) -> Result<(), InternalError> {
        if !buffer.notify_release() {
            error!("💥 Buffer {:?} returned to the pool twice", buffer.id());
            return Err(InternalError::DoubleRelease(buffer.id()));
        }
        self.stats.lock().returned += 1;

        if !buffer.is_reusable() {
            debug!("↩️ Client buffer {:?} released", buffer.id());
            return Ok(());
        }

        let key = PoolKey {
            size: buffer.size(),
            format: buffer.format(),
        };
        let evicted = {
            let mut buffers = self.buffers.lock();
            let queue = buffers.entry(key).or_default();
            let evicted = if queue.len() >= self.max_per_key {
                queue.pop_back()
            } else {
                None
            };
            queue.push_front(buffer);
            evicted
        };

        let mut stats = self.stats.lock();
        if evicted.is_some() {
            stats.evicted += 1;
        } else {
            stats.pooled += 1;
        }
        drop(stats);
        // evicted buffer (and its GPU image) is destroyed here, outside both locks
        drop(evicted);
        Ok(())
    }

    /// Takes a pooled server buffer of exactly this shape, if any
    pub fn take(&self, size: Size, format: PixelFormat) -> Option<BufferHandle> {
        let taken = self
            .buffers
            .lock()
            .get_mut(&PoolKey { size, format })
            .and_then(|queue| queue.pop_front());

        if taken.is_some() {
            let mut stats = self.stats.lock();
            stats.reused += 1;
            stats.pooled = stats.pooled.saturating_sub(1);
        }
        taken
    }

    /// Drops every pooled buffer
    pub fn clear(&self) -> usize {
        let drained: Vec<BufferHandle> = self
            .buffers
            .lock()
            .drain()
            .flat_map(|(_, queue)| queue)
            .collect();
        self.stats.lock().pooled = 0;
        let count = drained.len();
        drop(drained);
        if count > 0 {
            debug!("🧹 Cleared {} pooled buffers", count);
        }
        count
    }

    pub fn stats(&self) -> PoolStats {
        self.stats.lock().clone()
    }
}

impl Default for FreePool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_SIZE_PER_KEY)
    }
}
