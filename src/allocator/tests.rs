//! Allocator and import pipeline tests

use super::*;
use crate::error::FaultCode;
use crate::platform::{DmabufPlane, HeadlessContextFactory, HeadlessGpu, InjectedFailure};
use std::io::Write;
use std::os::fd::OwnedFd;
use std::sync::atomic::AtomicUsize;

fn allocator_with(gpu: Arc<HeadlessGpu>, config: AllocatorConfig) -> Allocator {
    Allocator::new(gpu.clone(), &HeadlessContextFactory::new(gpu), config).unwrap()
}

fn bound_allocator(gpu: Arc<HeadlessGpu>) -> Allocator {
    let allocator = allocator_with(gpu, AllocatorConfig::default());
    allocator.bind_display();
    allocator
}

fn shm_spec(width: i32, height: i32, stride: i32, format: u32) -> ShmBufferSpec {
    ShmBufferSpec {
        pool: ShmPool::from_bytes(vec![0x7f; (stride.max(0) * height.max(0)) as usize]),
        offset: 0,
        width,
        height,
        stride,
        format,
    }
}

fn linear_dmabuf(width: u32, height: u32) -> DmabufAttributes {
    let stride = width * 4;
    let mut file = tempfile::tempfile().unwrap();
    file.write_all(&vec![0xab; (stride * height) as usize]).unwrap();
    DmabufAttributes {
        fd: Arc::new(OwnedFd::from(file)),
        size: Size::new(width, height),
        format: PixelFormat::Argb8888,
        modifier: crate::platform::DRM_FORMAT_MOD_LINEAR,
        planes: vec![DmabufPlane { offset: 0, stride }],
    }
}

fn counter() -> (Arc<AtomicUsize>, BufferCallback) {
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    (count, Box::new(move || {
        c.fetch_add(1, Ordering::SeqCst);
    }))
}

#[test]
fn test_shm_import_wraps_client_memory() {
    let gpu = Arc::new(HeadlessGpu::new());
    let allocator = bound_allocator(gpu.clone());

    let handle = allocator
        .import(&ClientBuffer::Shm(shm_spec(16, 8, 64, 0)), None, None)
        .unwrap();
    assert_eq!(handle.size(), Size::new(16, 8));
    assert_eq!(handle.format(), PixelFormat::Argb8888);
    assert_eq!(handle.backing_kind(), BackingKind::Software);
    assert!(!handle.has_gpu_image());
    assert_eq!(gpu.upload_count(), 0);
}

#[test]
fn test_shm_stride_too_small_is_rejected() {
    let allocator = bound_allocator(Arc::new(HeadlessGpu::new()));
    let err = allocator
        .import(&ClientBuffer::Shm(shm_spec(16, 8, 16, 0)), None, None)
        .unwrap_err();
    assert_eq!(err, AllocError::InvalidStride { stride: 16, minimum: 64 });
    assert_eq!(err.into_client_fault().code, FaultCode::InvalidStride);
}

#[test]
fn test_shm_unknown_format_is_rejected() {
    let allocator = bound_allocator(Arc::new(HeadlessGpu::new()));
    let err = allocator
        .import(&ClientBuffer::Shm(shm_spec(4, 4, 16, 0xdead_beef)), None, None)
        .unwrap_err();
    assert_eq!(err, AllocError::UnknownFormatCode(0xdead_beef));
    assert_eq!(err.into_client_fault().code, FaultCode::InvalidFormat);
}

#[test]
fn test_shm_format_outside_software_set_is_unsupported() {
    let config = AllocatorConfig {
        software_formats: vec![PixelFormat::Xrgb8888],
        ..AllocatorConfig::default()
    };
    let allocator = allocator_with(Arc::new(HeadlessGpu::new()), config);
    let err = allocator
        .import(&ClientBuffer::Shm(shm_spec(4, 4, 16, 0)), None, None)
        .unwrap_err();
    assert_eq!(err, AllocError::UnsupportedFormat(PixelFormat::Argb8888));
}

#[test]
fn test_shm_buffer_past_pool_end_is_out_of_bounds() {
    let allocator = bound_allocator(Arc::new(HeadlessGpu::new()));
    let mut spec = shm_spec(4, 4, 16, 0);
    spec.offset = 8;
    let err = allocator.import(&ClientBuffer::Shm(spec), None, None).unwrap_err();
    assert_eq!(
        err,
        AllocError::OutOfBounds {
            needed: 72,
            available: 64
        }
    );
}

#[test]
fn test_software_image_created_on_first_bind_and_destroyed_once() {
    let gpu = Arc::new(HeadlessGpu::new());
    let allocator = bound_allocator(gpu.clone());
    let handle = allocator
        .import(&ClientBuffer::Shm(shm_spec(4, 4, 16, 0)), None, None)
        .unwrap();

    allocator.bind_now(&handle).unwrap();
    allocator.bind_now(&handle).unwrap();
    assert_eq!(gpu.upload_count(), 1);
    assert_eq!(gpu.bound_image_count(), 2);
    assert_eq!(gpu.current_context_count(), 0);

    let clone = handle.clone();
    drop(handle);
    assert_eq!(gpu.destroyed_image_count(), 0);
    drop(clone);
    assert_eq!(gpu.destroyed_image_count(), 1);
    assert_eq!(gpu.live_image_count(), 0);
}

#[test]
fn test_bind_display_enables_dmabuf_with_extension() {
    let gpu = Arc::new(HeadlessGpu::with_dmabuf());
    let allocator = allocator_with(gpu.clone(), AllocatorConfig::default());
    let caps = allocator.bind_display();

    assert_eq!(
        caps,
        ImportCapabilities {
            native_pixmap: true,
            dmabuf: true
        }
    );
    assert!(gpu.is_display_bound());
    assert_eq!(gpu.current_context_count(), 0);
    assert_eq!(gpu.make_current_calls(), gpu.release_current_calls());
}

#[test]
fn test_missing_extension_degrades_without_failing() {
    let gpu = Arc::new(HeadlessGpu::new());
    let allocator = allocator_with(gpu, AllocatorConfig::default());
    let caps = allocator.bind_display();
    assert!(caps.native_pixmap);
    assert!(!caps.dmabuf);
}

#[test]
fn test_bind_display_failure_falls_back_to_software() {
    let gpu = Arc::new(HeadlessGpu::with_dmabuf());
    gpu.inject_failure(InjectedFailure::BindDisplay);
    let allocator = allocator_with(gpu.clone(), AllocatorConfig::default());
    let caps = allocator.bind_display();
    assert!(!caps.native_pixmap);
    assert_eq!(gpu.current_context_count(), 0);

    let pixmap = NativePixmap {
        handle: 1,
        size: Size::new(8, 8),
        format: PixelFormat::Xrgb8888,
    };
    let err = allocator
        .import(&ClientBuffer::NativePixmap(pixmap), None, None)
        .unwrap_err();
    assert!(matches!(err, AllocError::ImportFailure(_)));

    // software path still works
    assert!(allocator
        .import(&ClientBuffer::Shm(shm_spec(4, 4, 16, 1)), None, None)
        .is_ok());
}

#[test]
fn test_make_current_failure_leaves_context_released() {
    let gpu = Arc::new(HeadlessGpu::with_dmabuf());
    gpu.inject_failure(InjectedFailure::MakeCurrent);
    let allocator = allocator_with(gpu.clone(), AllocatorConfig::default());
    let caps = allocator.bind_display();
    assert_eq!(caps, ImportCapabilities::default());
    assert_eq!(gpu.current_context_count(), 0);
}

#[test]
fn test_pixmap_image_is_lazy() {
    let gpu = Arc::new(HeadlessGpu::new());
    let allocator = bound_allocator(gpu.clone());
    let pixmap = NativePixmap {
        handle: 42,
        size: Size::new(32, 32),
        format: PixelFormat::Argb8888,
    };
    let handle = allocator
        .import(&ClientBuffer::NativePixmap(pixmap), None, None)
        .unwrap();
    assert_eq!(handle.backing_kind(), BackingKind::Hardware);
    assert_eq!(gpu.live_image_count(), 0);

    allocator.bind_now(&handle).unwrap();
    assert_eq!(gpu.live_image_count(), 1);
    drop(handle);
    assert_eq!(gpu.live_image_count(), 0);
}

#[test]
fn test_pixmap_image_failure_is_import_failure() {
    let gpu = Arc::new(HeadlessGpu::new());
    gpu.inject_failure(InjectedFailure::PixmapImage);
    let allocator = bound_allocator(gpu.clone());
    let pixmap = NativePixmap {
        handle: 3,
        size: Size::new(8, 8),
        format: PixelFormat::Argb8888,
    };
    let handle = allocator
        .import(&ClientBuffer::NativePixmap(pixmap), None, None)
        .unwrap();
    let err = allocator.bind_now(&handle).unwrap_err();
    assert!(matches!(err, AllocError::ImportFailure(_)));
    assert!(!handle.has_gpu_image());
    assert_eq!(gpu.current_context_count(), 0);
}

#[test]
fn test_dmabuf_imported_without_copy_when_supported() {
    let gpu = Arc::new(HeadlessGpu::with_dmabuf());
    let allocator = bound_allocator(gpu.clone());
    let handle = allocator
        .import(&ClientBuffer::Dmabuf(linear_dmabuf(8, 4)), None, None)
        .unwrap();
    assert_eq!(handle.backing_kind(), BackingKind::Hardware);
    allocator.bind_now(&handle).unwrap();
    assert_eq!(gpu.upload_count(), 0);
}

#[test]
fn test_dmabuf_validation_failure_falls_back_to_cpu_copy() {
    let gpu = Arc::new(HeadlessGpu::with_dmabuf());
    gpu.inject_failure(InjectedFailure::ValidateDmabuf);
    let allocator = bound_allocator(gpu.clone());

    let handle = allocator
        .import(&ClientBuffer::Dmabuf(linear_dmabuf(8, 4)), None, None)
        .unwrap();
    assert_eq!(handle.backing_kind(), BackingKind::Software);
    match handle.backend() {
        BufferBackend::Software(backing) => {
            assert_eq!(backing.stride(), 32);
            assert!(backing.pixels().iter().all(|b| *b == 0xab));
        }
        _ => panic!("expected a software backing"),
    }
    allocator.bind_now(&handle).unwrap();
    assert_eq!(gpu.upload_count(), 1);
}

#[test]
fn test_tiled_dmabuf_without_hardware_path_is_import_failure() {
    let allocator = bound_allocator(Arc::new(HeadlessGpu::new()));
    let mut attrs = linear_dmabuf(8, 4);
    attrs.modifier = 0x0100_0000_0000_0001;
    let err = allocator
        .import(&ClientBuffer::Dmabuf(attrs), None, None)
        .unwrap_err();
    assert!(matches!(err, AllocError::ImportFailure(_)));
    assert_eq!(err.into_client_fault().code, FaultCode::ImportFailed);
}

#[test]
fn test_dmabuf_disabled_by_config_uses_fallback() {
    let gpu = Arc::new(HeadlessGpu::with_dmabuf());
    let config = AllocatorConfig {
        dmabuf_import: false,
        ..AllocatorConfig::default()
    };
    let allocator = allocator_with(gpu, config);
    assert!(!allocator.bind_display().dmabuf);
    let handle = allocator
        .import(&ClientBuffer::Dmabuf(linear_dmabuf(2, 2)), None, None)
        .unwrap();
    assert_eq!(handle.backing_kind(), BackingKind::Software);
}

#[test]
fn test_release_notification_fires_once() {
    let allocator = bound_allocator(Arc::new(HeadlessGpu::new()));
    let (released, on_release) = counter();
    let handle = allocator
        .import(&ClientBuffer::Shm(shm_spec(4, 4, 16, 0)), None, Some(on_release))
        .unwrap();

    allocator.pool().give_back(handle.clone()).unwrap();
    assert_eq!(released.load(Ordering::SeqCst), 1);
    assert_eq!(
        allocator.pool().give_back(handle.clone()),
        Err(crate::error::InternalError::DoubleRelease(handle.id()))
    );
    drop(handle);
    assert_eq!(released.load(Ordering::SeqCst), 1);
}

#[test]
fn test_dropping_unreleased_handle_still_notifies() {
    let allocator = bound_allocator(Arc::new(HeadlessGpu::new()));
    let (released, on_release) = counter();
    let handle = allocator
        .import(&ClientBuffer::Shm(shm_spec(4, 4, 16, 0)), None, Some(on_release))
        .unwrap();
    drop(handle);
    assert_eq!(released.load(Ordering::SeqCst), 1);
}

#[test]
fn test_software_allocation_reuses_pooled_buffers() {
    let allocator = bound_allocator(Arc::new(HeadlessGpu::new()));
    let size = Size::new(64, 64);

    let first = allocator.alloc_software_buffer(size, PixelFormat::Xrgb8888).unwrap();
    let first_id = first.id();
    allocator.pool().give_back(first).unwrap();

    let second = allocator.alloc_software_buffer(size, PixelFormat::Xrgb8888).unwrap();
    assert_eq!(second.id(), first_id);
    // reused buffer is releasable again
    allocator.pool().give_back(second).unwrap();

    let other = allocator
        .alloc_software_buffer(Size::new(32, 32), PixelFormat::Xrgb8888)
        .unwrap();
    assert_ne!(other.id(), first_id);

    let stats = allocator.pool().stats();
    assert_eq!(stats.reused, 1);
    assert_eq!(stats.returned, 2);
}

#[test]
fn test_pool_evicts_beyond_capacity() {
    let config = AllocatorConfig {
        pool_size_per_key: 2,
        ..AllocatorConfig::default()
    };
    let allocator = allocator_with(Arc::new(HeadlessGpu::new()), config);
    let size = Size::new(8, 8);
    let buffers: Vec<_> = (0..3)
        .map(|_| allocator.alloc_software_buffer(size, PixelFormat::Argb8888).unwrap())
        .collect();
    for buffer in buffers {
        allocator.pool().give_back(buffer).unwrap();
    }
    let stats = allocator.pool().stats();
    assert_eq!(stats.pooled, 2);
    assert_eq!(stats.evicted, 1);
    assert_eq!(allocator.pool().clear(), 2);
}

#[test]
fn test_software_allocation_rejects_unsupported_format() {
    let config = AllocatorConfig {
        software_formats: vec![PixelFormat::Argb8888],
        ..AllocatorConfig::default()
    };
    let allocator = allocator_with(Arc::new(HeadlessGpu::new()), config);
    assert_eq!(
        allocator
            .alloc_software_buffer(Size::new(4, 4), PixelFormat::Rgb565)
            .unwrap_err(),
        AllocError::UnsupportedFormat(PixelFormat::Rgb565)
    );
}

#[test]
fn test_supported_pixel_formats() {
    let allocator = allocator_with(Arc::new(HeadlessGpu::new()), AllocatorConfig::default());
    assert_eq!(
        allocator.supported_pixel_formats(),
        vec![PixelFormat::Argb8888, PixelFormat::Xrgb8888]
    );
}

#[test]
fn test_prepare_gpu_image_on_render_executor() {
    let gpu = Arc::new(HeadlessGpu::new());
    let allocator = bound_allocator(gpu.clone());
    allocator.set_render_executor(Arc::new(crate::executor::InlineRenderExecutor::new(
        gpu.clone(),
    )));
    let handle = allocator
        .import(&ClientBuffer::Shm(shm_spec(4, 4, 16, 0)), None, None)
        .unwrap();

    let done = Arc::new(Mutex::new(None));
    let out = done.clone();
    allocator.prepare_gpu_image(handle.clone(), Box::new(move |r| *out.lock() = Some(r)));
    assert_eq!(*done.lock(), Some(Ok(())));
    assert!(handle.has_gpu_image());
    assert_eq!(gpu.current_context_count(), 0);
}

#[test]
fn test_prepare_gpu_image_reports_upload_failure() {
    let gpu = Arc::new(HeadlessGpu::new());
    gpu.inject_failure(InjectedFailure::Upload);
    let allocator = bound_allocator(gpu.clone());
    allocator.set_render_executor(Arc::new(crate::executor::InlineRenderExecutor::new(
        gpu.clone(),
    )));
    let handle = allocator
        .import(&ClientBuffer::Shm(shm_spec(4, 4, 16, 0)), None, None)
        .unwrap();

    let done = Arc::new(Mutex::new(None));
    let out = done.clone();
    allocator.prepare_gpu_image(handle.clone(), Box::new(move |r| *out.lock() = Some(r)));
    assert!(matches!(*done.lock(), Some(Err(AllocError::ImportFailure(_)))));
    assert!(!handle.has_gpu_image());
}

#[test]
fn test_drop_unbinds_display() {
    let gpu = Arc::new(HeadlessGpu::new());
    let allocator = bound_allocator(gpu.clone());
    assert!(gpu.is_display_bound());
    drop(allocator);
    assert!(!gpu.is_display_bound());
}
