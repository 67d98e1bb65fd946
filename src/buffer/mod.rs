//! Buffer handles
//!
//! A [`BufferHandle`] is the reference-counted unit of pixel storage that moves
//! from the allocator through a swapchain to the presentation sink. Cloning a
//! handle shares it; the storage and any GPU image behind it are destroyed when
//! the last clone is dropped.
//!
//! Each handle carries two one-shot notifications:
//!
//! - *consumed*: fired the first time a consumer acquires the buffer. Frame
//!   callbacks hang off this.
//! - *release*: fired once the consumer is done with the buffer (or, at the
//!   latest, when the handle is destroyed). Client buffer-release events hang
//!   off this.

pub mod format;

pub use format::PixelFormat;

use log::debug;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::allocator::BufferBackend;
use crate::error::AllocError;
use crate::geometry::Size;

/// Notification fired at most once
pub type BufferCallback = Box<dyn FnOnce() + Send>;

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one allocation; never reused within a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

impl BufferId {
    pub(crate) fn next() -> Self {
        BufferId(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Where the pixels of a buffer live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackingKind {
    /// CPU-accessible memory, uploaded to the GPU on bind
    Software,
    /// GPU-importable memory, sampled directly
    Hardware,
}

struct BufferInner {
    id: BufferId,
    size: Size,
    format: PixelFormat,
    backend: BufferBackend,
    /// Server-allocated buffers go back to the allocator pool instead of a client
    reusable: bool,
    on_consumed: Mutex<Option<BufferCallback>>,
    on_release: Mutex<Option<BufferCallback>>,
    released: AtomicBool,
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        if let Some(release) = self.on_release.get_mut().take() {
            release();
        }
        debug!("🗑️ Buffer {:?} destroyed", self.id);
    }
}

#[derive(Clone)]
pub struct BufferHandle {
    inner: Arc<BufferInner>,
}

impl BufferHandle {
    pub(crate) fn new(
        size: Size,
        format: PixelFormat,
        backend: BufferBackend,
        reusable: bool,
        on_consumed: Option<BufferCallback>,
        on_release: Option<BufferCallback>,
    ) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                id: BufferId::next(),
                size,
                format,
                backend,
                reusable,
                on_consumed: Mutex::new(on_consumed),
                on_release: Mutex::new(on_release),
                released: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> BufferId {
        self.inner.id
    }

    pub fn size(&self) -> Size {
        self.inner.size
    }

    pub fn format(&self) -> PixelFormat {
        self.inner.format
    }

    pub fn backing_kind(&self) -> BackingKind {
        self.inner.backend.backing_kind()
    }

    pub fn is_reusable(&self) -> bool {
        self.inner.reusable
    }

    pub(crate) fn backend(&self) -> &BufferBackend {
        &self.inner.backend
    }

    /// Whether two handles refer to the same allocation
    pub fn ptr_eq(&self, other: &BufferHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Records that a consumer acquired this buffer. Returns `true` the first time.
    pub fn mark_consumed(&self) -> bool {
        let callback = self.inner.on_consumed.lock().take();
        match callback {
            Some(callback) => {
                callback();
                true
            }
            None => false,
        }
    }

    /// Whether the consumed notification is still outstanding
    pub fn awaiting_consumption(&self) -> bool {
        self.inner.on_consumed.lock().is_some()
    }

    /// Fires the release notification once the consumer is done
    ///
    /// Releasing an already released buffer is reported as `false`; callers that
    /// track in-flight state treat that as an invariant violation.
    pub fn notify_release(&self) -> bool {
        if self.inner.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(release) = self.inner.on_release.lock().take() {
            release();
        }
        true
    }

    /// Re-arms the release notification of a pooled server buffer for its next use
    pub(crate) fn rearm(&self, on_consumed: Option<BufferCallback>, on_release: Option<BufferCallback>) {
        *self.inner.on_consumed.lock() = on_consumed;
        *self.inner.on_release.lock() = on_release;
        self.inner.released.store(false, Ordering::Release);
    }

    /// Makes the buffer sampleable by the current render context
    ///
    /// The GPU image is created lazily on the first bind; the caller must have a
    /// render context current.
    pub fn bind(&self) -> Result<(), AllocError> {
        self.inner.backend.bind()
    }

    /// Creates the GPU image without binding it; a no-op when it already exists
    pub fn create_gpu_image(&self) -> Result<(), AllocError> {
        self.inner.backend.create_gpu_image()
    }

    pub fn has_gpu_image(&self) -> bool {
        self.inner.backend.has_gpu_image()
    }
}

impl fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferHandle")
            .field("id", &self.inner.id)
            .field("size", &self.inner.size)
            .field("format", &self.inner.format)
            .field("backing", &self.backing_kind())
            .finish()
    }
}
