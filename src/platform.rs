//! Platform collaborators
//!
//! The compositing core never talks to EGL, Vulkan or DRM directly. The
//! platform layer hands the allocator a [`GpuDevice`] (image creation and the
//! capability query) and a [`ContextFactory`] (render contexts for import
//! work). Everything that needs a current context goes through
//! [`ContextGuard`], which releases the context when it goes out of scope,
//! including on the error path.
//!
//! [`HeadlessGpu`] is a complete in-process platform used by the headless
//! driver and by tests. It can be told to fail specific operations.

use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::buffer::PixelFormat;
use crate::error::PlatformError;
use crate::geometry::Size;

/// Extension that enables explicit cross-process (dmabuf) buffer import
pub const DMABUF_IMPORT_EXTENSION: &str = "EGL_EXT_image_dma_buf_import_modifiers";

/// Linear (untiled) layout modifier
pub const DRM_FORMAT_MOD_LINEAR: u64 = 0;

/// Opaque name of a GPU-sampleable image owned by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GpuImage(pub u64);

/// An existing GPU buffer object handed over through the legacy path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativePixmap {
    pub handle: u64,
    pub size: Size,
    pub format: PixelFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmabufPlane {
    pub offset: u32,
    pub stride: u32,
}

/// Cross-process buffer descriptor: file descriptor plus layout metadata
#[derive(Debug, Clone)]
pub struct DmabufAttributes {
    pub fd: Arc<OwnedFd>,
    pub size: Size,
    pub format: PixelFormat,
    pub modifier: u64,
    pub planes: Vec<DmabufPlane>,
}

impl DmabufAttributes {
    /// Single-plane linear buffers can be mapped and read by the CPU
    pub fn is_cpu_mappable(&self) -> bool {
        self.modifier == DRM_FORMAT_MOD_LINEAR && self.planes.len() == 1
    }
}

/// A rendering context that can be made current on the calling thread
pub trait RenderContext: Send + Sync {
    fn make_current(&self) -> Result<(), PlatformError>;
    fn release_current(&self);
}

/// Source of render contexts for allocator and worker use
pub trait ContextFactory: Send + Sync {
    fn create_context(&self) -> Result<Arc<dyn RenderContext>, PlatformError>;
}

/// GPU-side operations the import pipeline needs
///
/// Image creation and binding require a current render context.
pub trait GpuDevice: Send + Sync {
    /// Binds the display for the legacy native-pixmap path
    fn bind_wayland_display(&self) -> Result<(), PlatformError>;
    fn unbind_wayland_display(&self);
    fn has_extension(&self, name: &str) -> bool;
    /// Cheap, context-free check whether a descriptor is importable
    fn validate_dmabuf(&self, attrs: &DmabufAttributes) -> Result<(), PlatformError>;
    fn create_image_from_pixmap(&self, pixmap: &NativePixmap) -> Result<GpuImage, PlatformError>;
    fn create_image_from_dmabuf(&self, attrs: &DmabufAttributes) -> Result<GpuImage, PlatformError>;
    fn upload_pixels(
        &self,
        size: Size,
        format: PixelFormat,
        stride: u32,
        pixels: &[u8],
    ) -> Result<GpuImage, PlatformError>;
    fn bind_image(&self, image: GpuImage) -> Result<(), PlatformError>;
    fn destroy_image(&self, image: GpuImage);
}

/// Scoped acquisition of a render context
///
/// `make_current` happens in [`ContextGuard::acquire`]; `release_current`
/// happens unconditionally when the guard is dropped.
pub struct ContextGuard<'a> {
    context: &'a dyn RenderContext,
}

impl<'a> ContextGuard<'a> {
    pub fn acquire(context: &'a dyn RenderContext) -> Result<Self, PlatformError> {
        context.make_current()?;
        Ok(Self { context })
    }
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        self.context.release_current();
    }
}

/// Operations of [`HeadlessGpu`] that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InjectedFailure {
    BindDisplay,
    ValidateDmabuf,
    PixmapImage,
    DmabufImage,
    Upload,
    MakeCurrent,
}

/// In-process GPU device and render context for headless runs
#[derive(Default)]
pub struct HeadlessGpu {
    extensions: Mutex<HashSet<String>>,
    failures: Mutex<HashSet<InjectedFailure>>,
    next_image: AtomicU64,
    live_images: Mutex<HashSet<GpuImage>>,
    destroyed_images: AtomicUsize,
    bound_images: AtomicUsize,
    uploads: AtomicUsize,
    display_bound: AtomicBool,
    current_contexts: AtomicUsize,
    make_current_calls: AtomicUsize,
    release_current_calls: AtomicUsize,
}

impl HeadlessGpu {
    pub fn new() -> Self {
        Self::default()
    }

    /// Device advertising dmabuf import support
    pub fn with_dmabuf() -> Self {
        let gpu = Self::default();
        gpu.add_extension(DMABUF_IMPORT_EXTENSION);
        gpu
    }

    pub fn add_extension(&self, name: &str) {
        self.extensions.lock().insert(name.to_string());
    }

    pub fn inject_failure(&self, failure: InjectedFailure) {
        warn!("💉 Injecting platform failure: {:?}", failure);
        self.failures.lock().insert(failure);
    }

    pub fn clear_failure(&self, failure: InjectedFailure) {
        self.failures.lock().remove(&failure);
    }

    fn check(&self, failure: InjectedFailure) -> Result<(), PlatformError> {
        if self.failures.lock().contains(&failure) {
            let message = format!("injected failure: {:?}", failure);
            return Err(match failure {
                InjectedFailure::MakeCurrent => PlatformError::ContextUnavailable(message),
                InjectedFailure::BindDisplay | InjectedFailure::ValidateDmabuf => {
                    PlatformError::Unsupported(message)
                }
                _ => PlatformError::ImageCreation(message),
            });
        }
        Ok(())
    }

    fn new_image(&self) -> GpuImage {
        let image = GpuImage(self.next_image.fetch_add(1, Ordering::Relaxed) + 1);
        self.live_images.lock().insert(image);
        image
    }

    pub fn live_image_count(&self) -> usize {
        self.live_images.lock().len()
    }

    pub fn destroyed_image_count(&self) -> usize {
        self.destroyed_images.load(Ordering::Acquire)
    }

    pub fn bound_image_count(&self) -> usize {
        self.bound_images.load(Ordering::Acquire)
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::Acquire)
    }

    pub fn is_display_bound(&self) -> bool {
        self.display_bound.load(Ordering::Acquire)
    }

    /// Number of contexts made current and not yet released
    pub fn current_context_count(&self) -> usize {
        self.current_contexts.load(Ordering::Acquire)
    }

    pub fn make_current_calls(&self) -> usize {
        self.make_current_calls.load(Ordering::Acquire)
    }

    pub fn release_current_calls(&self) -> usize {
        self.release_current_calls.load(Ordering::Acquire)
    }
}

impl GpuDevice for HeadlessGpu {
    fn bind_wayland_display(&self) -> Result<(), PlatformError> {
        self.check(InjectedFailure::BindDisplay)?;
        self.display_bound.store(true, Ordering::Release);
        Ok(())
    }

    fn unbind_wayland_display(&self) {
        self.display_bound.store(false, Ordering::Release);
    }

    fn has_extension(&self, name: &str) -> bool {
        self.extensions.lock().contains(name)
    }

    fn validate_dmabuf(&self, attrs: &DmabufAttributes) -> Result<(), PlatformError> {
        self.check(InjectedFailure::ValidateDmabuf)?;
        if attrs.planes.is_empty() {
            return Err(PlatformError::Unsupported("dmabuf without planes".into()));
        }
        Ok(())
    }

    fn create_image_from_pixmap(&self, pixmap: &NativePixmap) -> Result<GpuImage, PlatformError> {
        self.check(InjectedFailure::PixmapImage)?;
        let image = self.new_image();
        debug!("🖼️ Pixmap {} imported as {:?}", pixmap.handle, image);
        Ok(image)
    }

    fn create_image_from_dmabuf(&self, attrs: &DmabufAttributes) -> Result<GpuImage, PlatformError> {
        self.check(InjectedFailure::DmabufImage)?;
        let image = self.new_image();
        debug!(
            "🖼️ Dmabuf {}x{} {:?} imported as {:?}",
            attrs.size.width, attrs.size.height, attrs.format, image
        );
        Ok(image)
    }

    fn upload_pixels(
        &self,
        size: Size,
        format: PixelFormat,
        stride: u32,
        pixels: &[u8],
    ) -> Result<GpuImage, PlatformError> {
        self.check(InjectedFailure::Upload)?;
        let needed = stride as usize * size.height as usize;
        if pixels.len() < needed {
            return Err(PlatformError::ImageCreation(format!(
                "upload of {:?} needs {} bytes, got {}",
                format,
                needed,
                pixels.len()
            )));
        }
        self.uploads.fetch_add(1, Ordering::AcqRel);
        Ok(self.new_image())
    }

    fn bind_image(&self, image: GpuImage) -> Result<(), PlatformError> {
        if !self.live_images.lock().contains(&image) {
            return Err(PlatformError::ImageCreation(format!("{:?} is not live", image)));
        }
        self.bound_images.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn destroy_image(&self, image: GpuImage) {
        if self.live_images.lock().remove(&image) {
            self.destroyed_images.fetch_add(1, Ordering::AcqRel);
        } else {
            warn!("⚠️ Destroying unknown image {:?}", image);
        }
    }
}

impl RenderContext for HeadlessGpu {
    fn make_current(&self) -> Result<(), PlatformError> {
        self.make_current_calls.fetch_add(1, Ordering::AcqRel);
        self.check(InjectedFailure::MakeCurrent)?;
        self.current_contexts.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn release_current(&self) {
        self.release_current_calls.fetch_add(1, Ordering::AcqRel);
        // release after a failed make_current is still a valid call
        let _ = self
            .current_contexts
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

/// Hands out the headless device itself as the render context
pub struct HeadlessContextFactory {
    gpu: Arc<HeadlessGpu>,
}

impl HeadlessContextFactory {
    pub fn new(gpu: Arc<HeadlessGpu>) -> Self {
        Self { gpu }
    }
}

impl ContextFactory for HeadlessContextFactory {
    fn create_context(&self) -> Result<Arc<dyn RenderContext>, PlatformError> {
        let context: Arc<dyn RenderContext> = self.gpu.clone();
        Ok(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_releases_on_drop() {
        let gpu = HeadlessGpu::new();
        {
            let _guard = ContextGuard::acquire(&gpu).unwrap();
            assert_eq!(gpu.current_context_count(), 1);
        }
        assert_eq!(gpu.current_context_count(), 0);
        assert_eq!(gpu.make_current_calls(), gpu.release_current_calls());
    }

    #[test]
    fn test_guard_releases_on_error_path() {
        let gpu = HeadlessGpu::new();
        let result: Result<(), PlatformError> = (|| {
            let _guard = ContextGuard::acquire(&gpu)?;
            Err(PlatformError::ImageCreation("boom".into()))
        })();
        assert!(result.is_err());
        assert_eq!(gpu.current_context_count(), 0);
        assert_eq!(gpu.release_current_calls(), 1);
    }

    #[test]
    fn test_failed_make_current_yields_no_guard() {
        let gpu = HeadlessGpu::new();
        gpu.inject_failure(InjectedFailure::MakeCurrent);
        assert!(ContextGuard::acquire(&gpu).is_err());
        assert_eq!(gpu.current_context_count(), 0);
    }

    #[test]
    fn test_images_destroyed_once() {
        let gpu = HeadlessGpu::new();
        let pixmap = NativePixmap {
            handle: 7,
            size: Size::new(4, 4),
            format: PixelFormat::Argb8888,
        };
        let image = gpu.create_image_from_pixmap(&pixmap).unwrap();
        assert_eq!(gpu.live_image_count(), 1);
        gpu.destroy_image(image);
        gpu.destroy_image(image);
        assert_eq!(gpu.destroyed_image_count(), 1);
        assert_eq!(gpu.live_image_count(), 0);
    }
}
