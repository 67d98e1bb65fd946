//! Performance benchmarks for the compositing core
//!
//! Covers the per-frame hot paths: swapchain submit/acquire/release, the
//! commit path and surface tree queries.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use std::sync::Arc;

use meridian::allocator::{Allocator, ClientBuffer, FreePool, ShmBufferSpec, ShmPool};
use meridian::buffer::PixelFormat;
use meridian::compositor::Compositor;
use meridian::config::{AllocatorConfig, CoreConfig};
use meridian::executor::QueuedExecutor;
use meridian::geometry::{Point, Size};
use meridian::platform::{HeadlessContextFactory, HeadlessGpu};
use meridian::surface::{RoleRequest, SurfaceId};
use meridian::swapchain::{BufferStream, SwapchainMode};
use meridian::testing::RecordingClient;
use meridian::transport::{AttachedBuffer, ClientBufferId};

fn allocator() -> Arc<Allocator> {
    let gpu = Arc::new(HeadlessGpu::new());
    Arc::new(
        Allocator::new(
            gpu.clone(),
            &HeadlessContextFactory::new(gpu),
            AllocatorConfig::default(),
        )
        .unwrap(),
    )
}

fn shm_buffer(pool: &ShmPool, id: u32, width: i32, height: i32) -> AttachedBuffer {
    AttachedBuffer::new(
        ClientBufferId(id),
        ClientBuffer::Shm(ShmBufferSpec {
            pool: pool.clone(),
            offset: 0,
            width,
            height,
            stride: width * 4,
            format: 0,
        }),
    )
}

/// Benchmark the stream round trip a frame performs per surface
fn bench_swapchain(c: &mut Criterion) {
    let mut group = c.benchmark_group("swapchain");
    let allocator = allocator();
    let size = Size::new(256, 256);

    for (name, mode) in [
        ("mailbox", SwapchainMode::Mailbox),
        ("queue_3", SwapchainMode::Queue { depth: 3 }),
    ] {
        group.bench_function(format!("submit_acquire_release_{}", name), |b| {
            let stream = BufferStream::new(mode, Arc::new(FreePool::new(4)));
            b.iter(|| {
                let buffer = allocator
                    .alloc_software_buffer(size, PixelFormat::Argb8888)
                    .unwrap();
                stream.submit(buffer).unwrap();
                let acquired = stream.acquire().unwrap();
                stream.release(black_box(&acquired)).unwrap();
            });
        });
    }

    group.bench_function("mailbox_overwrite_10", |b| {
        let stream = BufferStream::new(SwapchainMode::Mailbox, allocator.pool().clone());
        b.iter(|| {
            for _ in 0..10 {
                let buffer = allocator
                    .alloc_software_buffer(size, PixelFormat::Xrgb8888)
                    .unwrap();
                stream.submit(buffer).unwrap();
            }
            let acquired = stream.acquire().unwrap();
            stream.release(&acquired).unwrap();
        });
    });

    group.finish();
}

/// Benchmark attach + commit of shm buffers
fn bench_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("commit");
    let config = CoreConfig::default();
    let pool = ShmPool::from_bytes(vec![0; 512 * 512 * 4]);

    group.bench_function("attach_commit_shm", |b| {
        let executor = Arc::new(QueuedExecutor::new());
        let mut compositor = Compositor::new(allocator(), executor.clone(), &config);
        let id = compositor.create_surface(RecordingClient::new(1));
        let mut n = 0;
        b.iter(|| {
            n += 1;
            compositor
                .attach(id, Some(shm_buffer(&pool, n, 512, 512)), 0, 0)
                .unwrap();
            compositor.commit(id).unwrap();
            executor.dispatch_pending();
        });
    });

    group.bench_function("empty_commit", |b| {
        let executor = Arc::new(QueuedExecutor::new());
        let mut compositor = Compositor::new(allocator(), executor, &config);
        let id = compositor.create_surface(RecordingClient::new(1));
        b.iter(|| compositor.commit(black_box(id)).unwrap());
    });

    group.finish();
}

fn build_tree(compositor: &mut Compositor, pool: &ShmPool, children: usize) -> SurfaceId {
    let client = RecordingClient::new(1);
    let root = compositor.create_surface(client.clone());
    compositor.assign_role(root, RoleRequest::Toplevel).unwrap();
    for i in 0..children {
        let child = compositor.create_surface(client.clone());
        compositor.create_subsurface(child, root).unwrap();
        compositor
            .set_position(child, Point::new((i * 8) as i32, (i * 8) as i32))
            .unwrap();
        compositor
            .attach(child, Some(shm_buffer(pool, i as u32 + 2, 32, 32)), 0, 0)
            .unwrap();
        compositor.commit(child).unwrap();
    }
    compositor
        .attach(root, Some(shm_buffer(pool, 1, 256, 256)), 0, 0)
        .unwrap();
    compositor.commit(root).unwrap();
    root
}

/// Benchmark hit-testing and surface data composition
fn bench_tree_queries(c: &mut Criterion) {
    let mut group = c.benchmark_group("surface_tree");
    let config = CoreConfig::default();
    let pool = ShmPool::from_bytes(vec![0; 256 * 256 * 4]);

    for children in [4usize, 32] {
        group.bench_function(format!("subsurface_at_{}_children", children), |b| {
            let mut compositor =
                Compositor::new(allocator(), Arc::new(QueuedExecutor::new()), &config);
            let root = build_tree(&mut compositor, &pool, children);
            b.iter(|| black_box(compositor.subsurface_at(root, Point::new(20, 20))));
        });

        group.bench_function(format!("surface_data_uncached_{}_children", children), |b| {
            b.iter_batched(
                || {
                    let mut compositor =
                        Compositor::new(allocator(), Arc::new(QueuedExecutor::new()), &config);
                    let root = build_tree(&mut compositor, &pool, children);
                    (compositor, root)
                },
                |(mut compositor, root)| black_box(compositor.surface_data(root).unwrap()),
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_swapchain, bench_commit, bench_tree_queries);
criterion_main!(benches);
