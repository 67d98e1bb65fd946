// Presentation integration tests
//
// Drives the compositor through the public API and presents frames through
// the presentation driver, checking which buffers are shown, when frame
// callbacks fire and when clients get their buffers back.

use std::sync::Arc;

use meridian::allocator::{Allocator, ClientBuffer, ShmBufferSpec, ShmPool};
use meridian::compositor::Compositor;
use meridian::config::{CoreConfig, StreamMode};
use meridian::error::{PlatformError, PresentationError};
use meridian::executor::QueuedExecutor;
use meridian::platform::{HeadlessContextFactory, HeadlessGpu};
use meridian::presentation::{HeadlessSink, PresentationDriver};
use meridian::surface::{RoleRequest, SurfaceId};
use meridian::testing::{RecordingClient, RecordingSink};
use meridian::transport::{AttachedBuffer, ClientBufferId, FrameCallback};

struct Setup {
    gpu: Arc<HeadlessGpu>,
    allocator: Arc<Allocator>,
    executor: Arc<QueuedExecutor>,
    compositor: Compositor,
    client: Arc<RecordingClient>,
}

fn setup(config: CoreConfig) -> Setup {
    let gpu = Arc::new(HeadlessGpu::new());
    let allocator = Arc::new(
        Allocator::new(
            gpu.clone(),
            &HeadlessContextFactory::new(gpu.clone()),
            config.allocator.clone(),
        )
        .unwrap(),
    );
    allocator.bind_display();
    let executor = Arc::new(QueuedExecutor::new());
    let compositor = Compositor::new(allocator.clone(), executor.clone(), &config);
    Setup {
        gpu,
        allocator,
        executor,
        compositor,
        client: RecordingClient::new(1),
    }
}

fn shm_buffer(id: u32, width: i32, height: i32) -> AttachedBuffer {
    AttachedBuffer::new(
        ClientBufferId(id),
        ClientBuffer::Shm(ShmBufferSpec {
            pool: ShmPool::from_bytes(vec![0x40; (width * height * 4) as usize]),
            offset: 0,
            width,
            height,
            stride: width * 4,
            format: 1,
        }),
    )
}

fn toplevel(s: &mut Setup) -> SurfaceId {
    let id = s.compositor.create_surface(s.client.clone());
    s.compositor.assign_role(id, RoleRequest::Toplevel).unwrap();
    id
}

fn commit(s: &mut Setup, id: SurfaceId, buffer: u32, callback: Option<u32>) {
    s.compositor
        .attach(id, Some(shm_buffer(buffer, 64, 64)), 0, 0)
        .unwrap();
    if let Some(callback) = callback {
        s.compositor.frame(id, FrameCallback::new(callback)).unwrap();
    }
    s.compositor.commit(id).unwrap();
}

#[test]
fn test_first_frame_shows_every_mapped_toplevel() {
    let mut s = setup(CoreConfig::default());
    let a = toplevel(&mut s);
    let b = toplevel(&mut s);
    let hidden = toplevel(&mut s);
    commit(&mut s, a, 1, Some(100));
    commit(&mut s, b, 2, Some(200));

    let mut sink = RecordingSink::new();
    let mut driver = PresentationDriver::new();
    assert_eq!(driver.tick(&s.compositor, &mut sink).unwrap(), 2);

    let frame = sink.last_frame().unwrap();
    let shown: Vec<_> = frame.iter().map(|f| (f.surface, f.fresh)).collect();
    assert_eq!(shown, vec![(a, true), (b, true)]);
    assert!(!frame.iter().any(|f| f.surface == hidden));

    assert!(s.client.frames_done().is_empty());
    s.executor.dispatch_pending();
    assert_eq!(s.client.frames_done(), vec![100, 200]);
}

#[test]
fn test_unchanged_surface_repeats_its_buffer() {
    let mut s = setup(CoreConfig::default());
    let a = toplevel(&mut s);
    commit(&mut s, a, 1, None);

    let mut sink = RecordingSink::new();
    let mut driver = PresentationDriver::new();
    driver.tick(&s.compositor, &mut sink).unwrap();
    driver.tick(&s.compositor, &mut sink).unwrap();

    let frames = sink.frames();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0][0].buffer, frames[1][0].buffer);
    assert!(!frames[1][0].fresh);

    s.executor.dispatch_pending();
    assert!(s.client.releases().is_empty());
    assert_eq!(driver.stats().buffers_released, 0);
}

#[test]
fn test_replaced_buffer_is_released_after_present() {
    let mut s = setup(CoreConfig::default());
    let a = toplevel(&mut s);
    commit(&mut s, a, 1, None);

    let mut sink = RecordingSink::new();
    let mut driver = PresentationDriver::new();
    driver.tick(&s.compositor, &mut sink).unwrap();

    commit(&mut s, a, 2, None);
    s.executor.dispatch_pending();
    assert!(s.client.releases().is_empty());

    driver.tick(&s.compositor, &mut sink).unwrap();
    s.executor.dispatch_pending();
    assert_eq!(s.client.releases(), vec![ClientBufferId(1)]);
    assert_ne!(sink.frames()[0][0].buffer, sink.frames()[1][0].buffer);
    assert_eq!(driver.on_screen(), vec![sink.frames()[1][0].buffer]);
}

#[test]
fn test_unmapped_surface_leaves_the_frame_and_returns_its_buffer() {
    let mut s = setup(CoreConfig::default());
    let a = toplevel(&mut s);
    commit(&mut s, a, 1, None);

    let mut sink = RecordingSink::new();
    let mut driver = PresentationDriver::new();
    driver.tick(&s.compositor, &mut sink).unwrap();

    s.compositor.attach(a, None, 0, 0).unwrap();
    s.compositor.commit(a).unwrap();
    assert_eq!(driver.tick(&s.compositor, &mut sink).unwrap(), 0);

    s.executor.dispatch_pending();
    assert_eq!(s.client.releases(), vec![ClientBufferId(1)]);
    assert!(driver.on_screen().is_empty());
}

#[test]
fn test_destroyed_surface_buffer_is_returned() {
    let mut s = setup(CoreConfig::default());
    let a = toplevel(&mut s);
    commit(&mut s, a, 1, Some(7));

    let mut sink = RecordingSink::new();
    let mut driver = PresentationDriver::new();
    driver.tick(&s.compositor, &mut sink).unwrap();
    s.compositor.destroy_surface(a).unwrap();

    driver.tick(&s.compositor, &mut sink).unwrap();
    s.executor.dispatch_pending();
    // the surface died before its callback could be delivered
    assert!(s.client.frames_done().is_empty());
    assert_eq!(s.client.releases(), vec![ClientBufferId(1)]);
}

#[test]
fn test_queue_mode_presents_every_buffer_in_order() {
    let mut config = CoreConfig::default();
    config.swapchain.mode = StreamMode::Queue;
    config.swapchain.queue_depth = 3;
    let mut s = setup(config);
    let a = toplevel(&mut s);
    commit(&mut s, a, 1, Some(1));
    commit(&mut s, a, 2, Some(2));
    commit(&mut s, a, 3, Some(3));

    let mut sink = RecordingSink::new();
    let mut driver = PresentationDriver::new();
    let mut done = Vec::new();
    for _ in 0..3 {
        driver.tick(&s.compositor, &mut sink).unwrap();
        s.executor.dispatch_pending();
        done.push(s.client.frames_done());
    }

    assert_eq!(done, vec![vec![1], vec![1, 2], vec![1, 2, 3]]);
    assert_eq!(
        s.client.releases(),
        vec![ClientBufferId(1), ClientBufferId(2)]
    );
    let ids: Vec<_> = sink.frames().iter().map(|f| f[0].buffer).collect();
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn test_mailbox_drops_unseen_buffers() {
    let mut s = setup(CoreConfig::default());
    let a = toplevel(&mut s);
    commit(&mut s, a, 1, Some(1));
    commit(&mut s, a, 2, Some(2));
    commit(&mut s, a, 3, Some(3));

    let mut sink = RecordingSink::new();
    let mut driver = PresentationDriver::new();
    driver.tick(&s.compositor, &mut sink).unwrap();
    s.executor.dispatch_pending();

    assert_eq!(s.client.frames_done(), vec![1, 2, 3]);
    assert_eq!(
        s.client.releases(),
        vec![ClientBufferId(1), ClientBufferId(2)]
    );
    assert_eq!(driver.stats().buffers_acquired, 1);
}

#[test]
fn test_sink_failure_is_reported_and_bookkeeping_continues() {
    let mut s = setup(CoreConfig::default());
    let a = toplevel(&mut s);
    commit(&mut s, a, 1, None);

    let mut sink = RecordingSink::new();
    sink.fail_next();
    let mut driver = PresentationDriver::new();
    let err = driver.tick(&s.compositor, &mut sink).unwrap_err();
    assert!(matches!(
        err,
        PresentationError::Platform(PlatformError::Presentation(_))
    ));
    assert_eq!(driver.stats().failed_frames, 1);

    // the acquired buffer is still held and shown again on the next frame
    driver.tick(&s.compositor, &mut sink).unwrap();
    assert_eq!(sink.frames().len(), 1);
    assert!(!sink.frames()[0][0].fresh);
}

#[test]
fn test_release_all_returns_every_buffer() {
    let mut s = setup(CoreConfig::default());
    let a = toplevel(&mut s);
    let b = toplevel(&mut s);
    commit(&mut s, a, 1, None);
    commit(&mut s, b, 2, None);

    let mut sink = RecordingSink::new();
    let mut driver = PresentationDriver::new();
    driver.tick(&s.compositor, &mut sink).unwrap();

    assert_eq!(driver.release_all().unwrap(), 2);
    s.executor.dispatch_pending();
    let mut released = s.client.releases();
    released.sort_by_key(|id| id.0);
    assert_eq!(released, vec![ClientBufferId(1), ClientBufferId(2)]);
}

#[test]
fn test_headless_sink_binds_fresh_buffers_only() {
    let mut s = setup(CoreConfig::default());
    let a = toplevel(&mut s);
    commit(&mut s, a, 1, None);

    let mut sink = HeadlessSink::new(s.allocator.clone());
    let mut driver = PresentationDriver::new();
    driver.tick(&s.compositor, &mut sink).unwrap();
    driver.tick(&s.compositor, &mut sink).unwrap();

    assert_eq!(sink.frames(), 2);
    assert_eq!(sink.buffers_bound(), 1);
    assert_eq!(s.gpu.upload_count(), 1);
    assert_eq!(s.gpu.bound_image_count(), 1);
    assert_eq!(s.gpu.current_context_count(), 0);
    assert_eq!(s.gpu.make_current_calls(), s.gpu.release_current_calls());
}
