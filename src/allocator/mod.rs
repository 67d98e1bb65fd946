//! Buffer allocator and import pipeline
//!
//! Turns a client buffer description into a [`BufferHandle`]. The path is
//! chosen per buffer from its declared origin, never from global state:
//!
//! - [`ClientBuffer::Shm`]: software path. Validated, then wrapped in place.
//! - [`ClientBuffer::NativePixmap`]: legacy hardware path. Needs the display
//!   bound through [`Allocator::bind_display`].
//! - [`ClientBuffer::Dmabuf`]: explicit descriptor import. Needs the platform
//!   to advertise [`DMABUF_IMPORT_EXTENSION`]. If the platform rejects the
//!   descriptor and it is CPU-mappable, its pixels are copied into a software
//!   buffer instead.
//!
//! # Render contexts
//!
//! GPU images need a current render context. The allocator owns one context of
//! its own, made current only inside [`ContextGuard`] scopes, and can hand
//! image creation to a [`RenderExecutor`] so commits never wait on the GPU.
//!
//! # Example
//!
//! ```no_run
//! use meridian::allocator::{Allocator, ClientBuffer, ShmBufferSpec, ShmPool};
//! use meridian::config::AllocatorConfig;
//! use meridian::platform::{HeadlessContextFactory, HeadlessGpu};
//! use std::sync::Arc;
//!
//! let gpu = Arc::new(HeadlessGpu::new());
//! let allocator = Allocator::new(
//!     gpu.clone(),
//!     &HeadlessContextFactory::new(gpu),
//!     AllocatorConfig::default(),
//! ).unwrap();
//! allocator.bind_display();
//!
//! let spec = ShmBufferSpec {
//!     pool: ShmPool::from_bytes(vec![0; 64 * 64 * 4]),
//!     offset: 0,
//!     width: 64,
//!     height: 64,
//!     stride: 256,
//!     format: 0,
//! };
//! let handle = allocator.import(&ClientBuffer::Shm(spec), None, None).unwrap();
//! assert_eq!(handle.size().width, 64);
//! ```

pub mod hardware;
pub mod pool;
pub mod software;

#[cfg(test)]
mod tests;

pub use hardware::{DmabufBacking, PixmapBacking};
pub use pool::{FreePool, PoolStats};
pub use software::{ShmBufferSpec, ShmPool, SoftwareBacking};

use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::buffer::{BackingKind, BufferCallback, BufferHandle, PixelFormat};
use crate::config::AllocatorConfig;
use crate::error::{AllocError, PlatformError};
use crate::executor::RenderExecutor;
use crate::geometry::Size;
use crate::platform::{
    ContextFactory, ContextGuard, DmabufAttributes, GpuDevice, GpuImage, NativePixmap,
    RenderContext, DMABUF_IMPORT_EXTENSION,
};

/// A client buffer as delivered by the transport, tagged with its origin
#[derive(Debug, Clone)]
pub enum ClientBuffer {
    Shm(ShmBufferSpec),
    NativePixmap(NativePixmap),
    Dmabuf(DmabufAttributes),
}

impl ClientBuffer {
    pub fn origin(&self) -> &'static str {
        match self {
            ClientBuffer::Shm(_) => "shm",
            ClientBuffer::NativePixmap(_) => "native-pixmap",
            ClientBuffer::Dmabuf(_) => "dmabuf",
        }
    }
}

/// Lazily created GPU image, destroyed exactly once when dropped
pub(crate) struct GpuImageSlot {
    device: Arc<dyn GpuDevice>,
    image: Mutex<Option<GpuImage>>,
}

impl GpuImageSlot {
    pub(crate) fn new(device: Arc<dyn GpuDevice>) -> Self {
        Self {
            device,
            image: Mutex::new(None),
        }
    }

    pub(crate) fn get_or_create(
        &self,
        create: impl FnOnce(&dyn GpuDevice) -> Result<GpuImage, PlatformError>,
    ) -> Result<GpuImage, AllocError> {
        let mut slot = self.image.lock();
        if let Some(image) = *slot {
            return Ok(image);
        }
        let image =
            create(self.device.as_ref()).map_err(|e| AllocError::ImportFailure(e.to_string()))?;
        *slot = Some(image);
        Ok(image)
    }

    pub(crate) fn bind(&self, image: GpuImage) -> Result<(), AllocError> {
        self.device
            .bind_image(image)
            .map_err(|e| AllocError::ImportFailure(e.to_string()))
    }

    pub(crate) fn is_created(&self) -> bool {
        self.image.lock().is_some()
    }
}

impl Drop for GpuImageSlot {
    fn drop(&mut self) {
        if let Some(image) = self.image.get_mut().take() {
            self.device.destroy_image(image);
        }
    }
}

/// The storage behind a buffer handle; one capability interface over a closed set
pub enum BufferBackend {
    Software(SoftwareBacking),
    NativePixmap(PixmapBacking),
    Dmabuf(DmabufBacking),
}

impl BufferBackend {
    pub fn backing_kind(&self) -> BackingKind {
        match self {
            BufferBackend::Software(_) => BackingKind::Software,
            BufferBackend::NativePixmap(_) | BufferBackend::Dmabuf(_) => BackingKind::Hardware,
        }
    }

    pub fn create_gpu_image(&self) -> Result<(), AllocError> {
        match self {
            BufferBackend::Software(b) => b.create_gpu_image().map(|_| ()),
            BufferBackend::NativePixmap(b) => b.create_gpu_image().map(|_| ()),
            BufferBackend::Dmabuf(b) => b.create_gpu_image().map(|_| ()),
        }
    }

    pub fn bind(&self) -> Result<(), AllocError> {
        match self {
            BufferBackend::Software(b) => b.bind(),
            BufferBackend::NativePixmap(b) => b.bind(),
            BufferBackend::Dmabuf(b) => b.bind(),
        }
    }

    pub fn has_gpu_image(&self) -> bool {
        match self {
            BufferBackend::Software(b) => b.has_gpu_image(),
            BufferBackend::NativePixmap(b) => b.has_gpu_image(),
            BufferBackend::Dmabuf(b) => b.has_gpu_image(),
        }
    }
}

/// Which hardware import paths are currently usable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImportCapabilities {
    pub native_pixmap: bool,
    pub dmabuf: bool,
}

pub struct Allocator {
    device: Arc<dyn GpuDevice>,
    context: Arc<dyn RenderContext>,
    config: AllocatorConfig,
    display_bound: AtomicBool,
    dmabuf_enabled: AtomicBool,
    pool: Arc<FreePool>,
    render_executor: Mutex<Option<Arc<dyn RenderExecutor>>>,
}

impl Allocator {
    pub fn new(
        device: Arc<dyn GpuDevice>,
        contexts: &dyn ContextFactory,
        config: AllocatorConfig,
    ) -> Result<Self, AllocError> {
        let context = contexts
            .create_context()
            .map_err(|e| AllocError::NoRenderContext(e.to_string()))?;

        info!(
            "🧱 Allocator created (hardware import: {}, dmabuf import: {})",
            config.hardware_import, config.dmabuf_import
        );

        Ok(Self {
            device,
            context,
            pool: Arc::new(FreePool::new(config.pool_size_per_key)),
            config,
            display_bound: AtomicBool::new(false),
            dmabuf_enabled: AtomicBool::new(false),
            render_executor: Mutex::new(None),
        })
    }

    /// Executor used to create GPU images off the protocol context
    pub fn set_render_executor(&self, executor: Arc<dyn RenderExecutor>) {
        *self.render_executor.lock() = Some(executor);
    }

    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    pub fn pool(&self) -> &Arc<FreePool> {
        &self.pool
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    pub fn capabilities(&self) -> ImportCapabilities {
        ImportCapabilities {
            native_pixmap: self.display_bound.load(Ordering::Acquire),
            dmabuf: self.dmabuf_enabled.load(Ordering::Acquire),
        }
    }

    /// Negotiates hardware import with the platform
    ///
    /// Never fails: a missing capability only narrows the set of import paths.
    pub fn bind_display(&self) -> ImportCapabilities {
        if !self.config.hardware_import {
            info!("🖥️ Hardware buffer import disabled by configuration; software buffers only");
            return self.capabilities();
        }

        let _guard = match ContextGuard::acquire(self.context.as_ref()) {
            Ok(guard) => guard,
            Err(e) => {
                warn!(
                    "⚠️ Cannot make allocator context current ({}), falling back to software buffers",
                    e
                );
                return self.capabilities();
            }
        };

        match self.device.bind_wayland_display() {
            Ok(()) => {
                self.display_bound.store(true, Ordering::Release);
                debug!("🔗 Display bound for native pixmap import");
            }
            Err(e) => warn!(
                "⚠️ Failed to bind display ({}), falling back to software buffers",
                e
            ),
        }

        if self.config.dmabuf_import && self.device.has_extension(DMABUF_IMPORT_EXTENSION) {
            self.dmabuf_enabled.store(true, Ordering::Release);
            info!("✅ Enabled dmabuf import support");
        } else {
            info!(
                "🟡 No {} support, disabling dmabuf import",
                DMABUF_IMPORT_EXTENSION
            );
        }

        self.capabilities()
    }

    pub fn unbind_display(&self) {
        self.dmabuf_enabled.store(false, Ordering::Release);
        if !self.display_bound.swap(false, Ordering::AcqRel) {
            return;
        }
        match ContextGuard::acquire(self.context.as_ref()) {
            Ok(_guard) => {
                self.device.unbind_wayland_display();
                debug!("🔗 Display unbound");
            }
            Err(e) => warn!("⚠️ Cannot make allocator context current to unbind display: {}", e),
        }
    }

    /// Formats safe to advertise for every use, including scanout
    pub fn supported_pixel_formats(&self) -> Vec<PixelFormat> {
        vec![PixelFormat::Argb8888, PixelFormat::Xrgb8888]
    }

    /// Formats the software path accepts
    pub fn software_formats(&self) -> &[PixelFormat] {
        &self.config.software_formats
    }

    /// Imports a client buffer through the path its origin selects
    pub fn import(
        &self,
        buffer: &ClientBuffer,
        on_consumed: Option<BufferCallback>,
        on_release: Option<BufferCallback>,
    ) -> Result<BufferHandle, AllocError> {
        match buffer {
            ClientBuffer::Shm(spec) => self.import_shm(spec, on_consumed, on_release),
            ClientBuffer::NativePixmap(pixmap) => {
                self.import_pixmap(pixmap, on_consumed, on_release)
            }
            ClientBuffer::Dmabuf(attrs) => self.import_dmabuf(attrs, on_consumed, on_release),
        }
    }

    fn import_shm(
        &self,
        spec: &ShmBufferSpec,
        on_consumed: Option<BufferCallback>,
        on_release: Option<BufferCallback>,
    ) -> Result<BufferHandle, AllocError> {
        let format = spec.validate(&self.config.software_formats)?;
        let backing = SoftwareBacking::wrap_shm(spec, format, self.device.clone());
        let handle = BufferHandle::new(
            spec.size(),
            format,
            BufferBackend::Software(backing),
            false,
            on_consumed,
            on_release,
        );
        debug!("🧾 Imported shm buffer {:?}", handle);
        Ok(handle)
    }

    fn import_pixmap(
        &self,
        pixmap: &NativePixmap,
        on_consumed: Option<BufferCallback>,
        on_release: Option<BufferCallback>,
    ) -> Result<BufferHandle, AllocError> {
        if !self.capabilities().native_pixmap {
            return Err(AllocError::ImportFailure(
                "native pixmap import is unavailable (display not bound)".into(),
            ));
        }
        let handle = BufferHandle::new(
            pixmap.size,
            pixmap.format,
            BufferBackend::NativePixmap(PixmapBacking::new(*pixmap, self.device.clone())),
            false,
            on_consumed,
            on_release,
        );
        debug!("🧾 Imported native pixmap {:?}", handle);
        Ok(handle)
    }

    fn import_dmabuf(
        &self,
        attrs: &DmabufAttributes,
        on_consumed: Option<BufferCallback>,
        on_release: Option<BufferCallback>,
    ) -> Result<BufferHandle, AllocError> {
        let hardware_error = if self.capabilities().dmabuf {
            match self.device.validate_dmabuf(attrs) {
                Ok(()) => {
                    let handle = BufferHandle::new(
                        attrs.size,
                        attrs.format,
                        BufferBackend::Dmabuf(DmabufBacking::new(attrs.clone(), self.device.clone())),
                        false,
                        on_consumed,
                        on_release,
                    );
                    debug!("🧾 Imported dmabuf {:?}", handle);
                    return Ok(handle);
                }
                Err(e) => e.to_string(),
            }
        } else {
            "dmabuf import is not enabled".to_string()
        };

        if !attrs.is_cpu_mappable() {
            return Err(AllocError::ImportFailure(hardware_error));
        }
        if !self.config.software_formats.contains(&attrs.format) {
            return Err(AllocError::UnsupportedFormat(attrs.format));
        }

        warn!(
            "🟡 Dmabuf import failed ({}), copying into a software buffer",
            hardware_error
        );
        let (pixels, stride) = hardware::read_linear_dmabuf(attrs)?;
        let backing =
            SoftwareBacking::from_pixels(pixels, attrs.size, attrs.format, stride, self.device.clone());
        Ok(BufferHandle::new(
            attrs.size,
            attrs.format,
            BufferBackend::Software(backing),
            false,
            on_consumed,
            on_release,
        ))
    }

    /// Allocates (or reuses) a server-side software buffer
    pub fn alloc_software_buffer(&self, size: Size, format: PixelFormat) -> Result<BufferHandle, AllocError> {
        if !self.config.software_formats.contains(&format) {
            return Err(AllocError::UnsupportedFormat(format));
        }
        if let Some(buffer) = self.pool.take(size, format) {
            buffer.rearm(None, None);
            debug!("♻️ Reusing pooled buffer {:?}", buffer.id());
            return Ok(buffer);
        }
        let backing = SoftwareBacking::zeroed(size, format, self.device.clone());
        Ok(BufferHandle::new(
            size,
            format,
            BufferBackend::Software(backing),
            true,
            None,
            None,
        ))
    }

    /// Creates the buffer's GPU image on the render executor
    ///
    /// `on_done` runs on the render worker once the image exists or creation
    /// failed. Without a render executor the image is left for the first bind
    /// and `on_done` runs immediately with `Ok`.
    pub fn prepare_gpu_image(
        &self,
        buffer: BufferHandle,
        on_done: Box<dyn FnOnce(Result<(), AllocError>) + Send>,
    ) {
        let executor = self.render_executor.lock().clone();
        match executor {
            Some(executor) => executor.spawn_render(Box::new(move |context| {
                let result = context
                    .map_err(|e| AllocError::NoRenderContext(e.to_string()))
                    .and_then(|()| buffer.create_gpu_image());
                on_done(result);
            })),
            None => on_done(Ok(())),
        }
    }

    /// Binds a buffer for sampling with the allocator's own context current
    pub fn bind_now(&self, buffer: &BufferHandle) -> Result<(), AllocError> {
        let _guard = ContextGuard::acquire(self.context.as_ref())
            .map_err(|e| AllocError::NoRenderContext(e.to_string()))?;
        buffer.bind()
    }
}

impl Drop for Allocator {
    fn drop(&mut self) {
        self.pool.clear();
        self.unbind_display();
    }
}
