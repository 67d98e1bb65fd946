//! Software-backed buffers
//!
//! Pixels live in CPU memory: a client's shared-memory pool, or memory the
//! server owns (server allocations and CPU copies of mappable dmabufs). The
//! GPU image is an upload of those pixels, created on first bind.

use memmap2::{Mmap, MmapOptions};
use std::fmt;
use std::io;
use std::os::fd::AsFd;
use std::sync::Arc;

use super::GpuImageSlot;
use crate::buffer::PixelFormat;
use crate::error::{AllocError, PlatformError};
use crate::geometry::Size;
use crate::platform::{GpuDevice, GpuImage};

enum PoolStorage {
    Mapped(Mmap),
    Memory(Vec<u8>),
}

impl PoolStorage {
    fn bytes(&self) -> &[u8] {
        match self {
            PoolStorage::Mapped(map) => map,
            PoolStorage::Memory(bytes) => bytes,
        }
    }
}

/// A client shared-memory pool
#[derive(Clone)]
pub struct ShmPool {
    storage: Arc<PoolStorage>,
}

impl ShmPool {
    /// Maps `size` bytes of a client-provided file descriptor read-only
    pub fn from_fd(fd: impl AsFd, size: usize) -> io::Result<Self> {
        let fd = fd.as_fd();
        // SAFETY: the mapping is read-only; a client truncating the file under us
        // is the classic wl_shm hazard and is no worse here than in any
        // compositor mapping client memory.
        let map = unsafe { MmapOptions::new().len(size).map(&fd)? };
        Ok(Self {
            storage: Arc::new(PoolStorage::Mapped(map)),
        })
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            storage: Arc::new(PoolStorage::Memory(bytes)),
        }
    }

    pub fn len(&self) -> usize {
        self.storage.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> &[u8] {
        self.storage.bytes()
    }
}

impl fmt::Debug for ShmPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmPool").field("len", &self.len()).finish()
    }
}

/// A buffer carved out of a shared-memory pool, as described by the client
#[derive(Debug, Clone)]
pub struct ShmBufferSpec {
    pub pool: ShmPool,
    pub offset: i32,
    pub width: i32,
    pub height: i32,
    pub stride: i32,
    /// Raw `wl_shm` format code
    pub format: u32,
}

impl ShmBufferSpec {
    pub fn size(&self) -> Size {
        Size::new(self.width.max(0) as u32, self.height.max(0) as u32)
    }

    /// Checks format, stride and pool bounds; returns the decoded format
    pub fn validate(&self, supported: &[PixelFormat]) -> Result<PixelFormat, AllocError> {
        let format =
            PixelFormat::from_shm_code(self.format).ok_or(AllocError::UnknownFormatCode(self.format))?;
        if !supported.contains(&format) {
            return Err(AllocError::UnsupportedFormat(format));
        }

        if self.width <= 0 || self.height <= 0 || self.offset < 0 {
            return Err(AllocError::ImportFailure(format!(
                "invalid shm geometry {}x{} at offset {}",
                self.width, self.height, self.offset
            )));
        }

        let minimum = format.min_stride(self.width as u32);
        if self.stride < 0 || (self.stride as u64) < minimum {
            return Err(AllocError::InvalidStride {
                stride: self.stride,
                minimum,
            });
        }

        let needed = self.offset as usize + self.stride as usize * self.height as usize;
        if needed > self.pool.len() {
            return Err(AllocError::OutOfBounds {
                needed,
                available: self.pool.len(),
            });
        }

        Ok(format)
    }
}

enum PixelSource {
    Shm { pool: ShmPool, offset: usize },
    Owned(Vec<u8>),
}

/// CPU-resident pixels plus their lazily uploaded GPU image
pub struct SoftwareBacking {
    source: PixelSource,
    size: Size,
    format: PixelFormat,
    stride: u32,
    image: GpuImageSlot,
}

impl SoftwareBacking {
    /// Wraps a validated client buffer without copying
    pub(crate) fn wrap_shm(spec: &ShmBufferSpec, format: PixelFormat, device: Arc<dyn GpuDevice>) -> Self {
        Self {
            source: PixelSource::Shm {
                pool: spec.pool.clone(),
                offset: spec.offset as usize,
            },
            size: spec.size(),
            format,
            stride: spec.stride as u32,
            image: GpuImageSlot::new(device),
        }
    }

    /// Takes ownership of pixels already copied out of client memory
    pub(crate) fn from_pixels(
        pixels: Vec<u8>,
        size: Size,
        format: PixelFormat,
        stride: u32,
        device: Arc<dyn GpuDevice>,
    ) -> Self {
        Self {
            source: PixelSource::Owned(pixels),
            size,
            format,
            stride,
            image: GpuImageSlot::new(device),
        }
    }

    /// Zero-filled server-side storage
    pub(crate) fn zeroed(size: Size, format: PixelFormat, device: Arc<dyn GpuDevice>) -> Self {
        let stride = format.min_stride(size.width) as u32;
        let pixels = vec![0u8; stride as usize * size.height as usize];
        Self::from_pixels(pixels, size, format, stride, device)
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// The pixel rows of this buffer, `stride` bytes apart
    pub fn pixels(&self) -> &[u8] {
        let len = self.stride as usize * self.size.height as usize;
        match &self.source {
            PixelSource::Shm { pool, offset } => &pool.bytes()[*offset..*offset + len],
            PixelSource::Owned(bytes) => &bytes[..len],
        }
    }

    fn upload(&self, device: &dyn GpuDevice) -> Result<GpuImage, PlatformError> {
        device.upload_pixels(self.size, self.format, self.stride, self.pixels())
    }

    pub(crate) fn create_gpu_image(&self) -> Result<GpuImage, AllocError> {
        self.image.get_or_create(|device| self.upload(device))
    }

    pub(crate) fn bind(&self) -> Result<(), AllocError> {
        let image = self.create_gpu_image()?;
        self.image.bind(image)
    }

    pub(crate) fn has_gpu_image(&self) -> bool {
        self.image.is_created()
    }
}
