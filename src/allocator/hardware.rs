//! Hardware-importable buffers
//!
//! Two import strategies share the same lifetime rules: the GPU image is
//! created on first bind (a render context must be current then), and it is
//! destroyed exactly once, when the owning buffer handle is destroyed.
//!
//! - Native pixmaps wrap an existing GPU buffer object (legacy path).
//! - Dmabufs build an image from a file descriptor plus layout metadata,
//!   without copying.

use log::debug;
use memmap2::MmapOptions;

use super::GpuImageSlot;
use crate::error::AllocError;
use crate::platform::{DmabufAttributes, GpuDevice, GpuImage, NativePixmap};
use std::sync::Arc;

pub struct PixmapBacking {
    pixmap: NativePixmap,
    image: GpuImageSlot,
}

impl PixmapBacking {
    pub(crate) fn new(pixmap: NativePixmap, device: Arc<dyn GpuDevice>) -> Self {
        Self {
            pixmap,
            image: GpuImageSlot::new(device),
        }
    }

    pub fn pixmap(&self) -> &NativePixmap {
        &self.pixmap
    }

    pub(crate) fn create_gpu_image(&self) -> Result<GpuImage, AllocError> {
        self.image
            .get_or_create(|device| device.create_image_from_pixmap(&self.pixmap))
    }

    pub(crate) fn bind(&self) -> Result<(), AllocError> {
        let image = self.create_gpu_image()?;
        self.image.bind(image)
    }

    pub(crate) fn has_gpu_image(&self) -> bool {
        self.image.is_created()
    }
}

pub struct DmabufBacking {
    attrs: DmabufAttributes,
    image: GpuImageSlot,
}

impl DmabufBacking {
    pub(crate) fn new(attrs: DmabufAttributes, device: Arc<dyn GpuDevice>) -> Self {
        Self {
            attrs,
            image: GpuImageSlot::new(device),
        }
    }

    pub fn attributes(&self) -> &DmabufAttributes {
        &self.attrs
    }

    pub(crate) fn create_gpu_image(&self) -> Result<GpuImage, AllocError> {
        self.image
            .get_or_create(|device| device.create_image_from_dmabuf(&self.attrs))
    }

    pub(crate) fn bind(&self) -> Result<(), AllocError> {
        let image = self.create_gpu_image()?;
        self.image.bind(image)
    }

    pub(crate) fn has_gpu_image(&self) -> bool {
        self.image.is_created()
    }
}

/// Copies the first plane of a linear dmabuf into CPU memory
///
/// Returns the pixels and their stride.
pub(crate) fn read_linear_dmabuf(attrs: &DmabufAttributes) -> Result<(Vec<u8>, u32), AllocError> {
    if !attrs.is_cpu_mappable() {
        return Err(AllocError::ImportFailure(
            "dmabuf is not single-plane linear and cannot be mapped".into(),
        ));
    }
    let plane = attrs.planes[0];
    let minimum = attrs.format.min_stride(attrs.size.width);
    if (plane.stride as u64) < minimum {
        return Err(AllocError::InvalidStride {
            stride: plane.stride as i32,
            minimum,
        });
    }

    let offset = plane.offset as usize;
    let len = plane.stride as usize * attrs.size.height as usize;
    // SAFETY: read-only mapping of a buffer the client handed us; only read
    // while copying below.
    let map = unsafe {
        MmapOptions::new()
            .map(&*attrs.fd)
            .map_err(|e| AllocError::ImportFailure(format!("failed to map dmabuf: {}", e)))?
    };
    if map.len() < offset + len {
        return Err(AllocError::OutOfBounds {
            needed: offset + len,
            available: map.len(),
        });
    }

    debug!(
        "📥 Copied {}x{} linear dmabuf ({} bytes) for software fallback",
        attrs.size.width, attrs.size.height, len
    );
    Ok((map[offset..offset + len].to_vec(), plane.stride))
}
