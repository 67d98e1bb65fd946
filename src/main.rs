//! # meridian-headless
//!
//! Drives the compositing core without a display: simulated clients commit
//! shm buffers whenever their previous frame callback fires, and a presentation
//! loop paced at the configured refresh rate acquires, binds and releases
//! them. Throughput and latency counters are logged at the end.

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Instant;

use meridian::allocator::{Allocator, ClientBuffer, ShmBufferSpec, ShmPool};
use meridian::compositor::Compositor;
use meridian::config::{CoreConfig, StreamMode};
use meridian::executor::{QueuedExecutor, RenderWorkerPool};
use meridian::geometry::Point;
use meridian::logging::init_logging;
use meridian::platform::{ContextFactory, HeadlessContextFactory, HeadlessGpu};
use meridian::presentation::{FrameClock, HeadlessSink, PresentationDriver};
use meridian::surface::{RoleRequest, SurfaceId};
use meridian::testing::{ClientEvent, RecordingClient};
use meridian::transport::{AttachedBuffer, ClientBufferId, FrameCallback};

#[derive(Parser)]
#[command(name = "meridian-headless")]
#[command(about = "Runs the compositing core against simulated clients and a headless display")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "~/.config/meridian/meridian.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Number of simulated clients
    #[arg(long, default_value_t = 2)]
    clients: u32,

    /// Frames to present before exiting
    #[arg(long, default_value_t = 120)]
    frames: u64,

    /// Use queue-mode swapchains regardless of configuration
    #[arg(long)]
    queue: bool,

    /// Create GPU images on the render workers right after commit
    #[arg(long)]
    prewarm: bool,
}

/// A client that redraws as soon as its last frame was shown
struct SimulatedClient {
    connection: Arc<RecordingClient>,
    toplevel: SurfaceId,
    badge: SurfaceId,
    width: i32,
    height: i32,
    next_object: u32,
    ready: bool,
    frames_drawn: u64,
    buffers_released: u64,
}

impl SimulatedClient {
    fn connect(compositor: &mut Compositor, index: u32) -> Result<Self> {
        let connection = RecordingClient::new(index + 1);
        let toplevel = compositor.create_surface(connection.clone());
        compositor.assign_role(toplevel, RoleRequest::Toplevel)?;

        let badge = compositor.create_surface(connection.clone());
        compositor.create_subsurface(badge, toplevel)?;
        compositor.set_position(badge, Point::new(8, 8))?;
        compositor.set_desync(badge)?;

        Ok(Self {
            connection,
            toplevel,
            badge,
            width: 320 + 64 * index as i32,
            height: 240,
            next_object: 1,
            ready: true,
            frames_drawn: 0,
            buffers_released: 0,
        })
    }

    fn buffer(&mut self, width: i32, height: i32, shade: u8) -> AttachedBuffer {
        let stride = width * 4;
        let pool = ShmPool::from_bytes(vec![shade; (stride * height) as usize]);
        let id = ClientBufferId(self.next_object);
        self.next_object += 1;
        AttachedBuffer::new(
            id,
            ClientBuffer::Shm(ShmBufferSpec {
                pool,
                offset: 0,
                width,
                height,
                stride,
                format: 0,
            }),
        )
    }

    fn draw(&mut self, compositor: &mut Compositor) -> Result<()> {
        if !self.ready {
            return Ok(());
        }
        let shade = (self.frames_drawn % 255) as u8;

        if self.frames_drawn == 0 {
            let badge = self.buffer(32, 32, 0xff);
            compositor.attach(self.badge, Some(badge), 0, 0)?;
            compositor.commit(self.badge)?;
        }

        let buffer = self.buffer(self.width, self.height, shade);
        let callback = FrameCallback::new(self.next_object);
        self.next_object += 1;
        compositor.attach(self.toplevel, Some(buffer), 0, 0)?;
        compositor.frame(self.toplevel, callback)?;
        compositor.commit(self.toplevel)?;

        self.ready = false;
        self.frames_drawn += 1;
        Ok(())
    }

    fn handle_events(&mut self) {
        for event in self.connection.take_events() {
            match event {
                ClientEvent::FrameDone { .. } => self.ready = true,
                ClientEvent::BufferRelease(_) => self.buffers_released += 1,
                ClientEvent::Error { code, message } => {
                    error!("❌ Client {:?} got {:?}: {}", self.toplevel, code, message)
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loaded = CoreConfig::load(&cli.config);
    let mut config = match &loaded {
        Ok(config) => config.clone(),
        Err(_) => CoreConfig::default(),
    };
    if cli.debug {
        config.logging.level = "debug".to_string();
    }
    init_logging(&config.logging);

    info!("🚀 Starting meridian-headless");
    info!(
        "📄 Version: {} ({}, built {})",
        meridian::VERSION,
        meridian::GIT_COMMIT,
        meridian::BUILD_DATE
    );
    if let Err(e) = loaded {
        error!("❌ Failed to load configuration: {:#}", e);
        info!("📝 Using default configuration");
    }

    if cli.queue {
        config.swapchain.mode = StreamMode::Queue;
    }
    if cli.prewarm {
        config.allocator.prewarm_gpu_images = true;
    }
    config.validate().context("Invalid configuration")?;

    run(&cli, &config).await
}

async fn run(cli: &Cli, config: &CoreConfig) -> Result<()> {
    let gpu = Arc::new(HeadlessGpu::with_dmabuf());
    let contexts = HeadlessContextFactory::new(gpu.clone());
    let allocator = Arc::new(
        Allocator::new(gpu.clone(), &contexts, config.allocator.clone())
            .context("Failed to create allocator")?,
    );
    let capabilities = allocator.bind_display();
    info!("🖥️ Import capabilities: {:?}", capabilities);

    let workers = if config.allocator.prewarm_gpu_images {
        let context = contexts
            .create_context()
            .context("Failed to create render worker context")?;
        let pool = RenderWorkerPool::from_current(context, config.workers.render_threads)
            .map(Arc::new)
            .context("No tokio runtime for render workers")?;
        allocator.set_render_executor(pool.clone());
        Some(pool)
    } else {
        None
    };

    let executor = Arc::new(QueuedExecutor::new());
    let mut compositor = Compositor::new(allocator.clone(), executor.clone(), config);

    let mut clients = Vec::new();
    for index in 0..cli.clients {
        clients.push(SimulatedClient::connect(&mut compositor, index)?);
    }
    info!("👥 {} simulated clients connected", clients.len());

    let mut sink = HeadlessSink::new(allocator.clone());
    let mut driver = PresentationDriver::new();
    let mut clock = FrameClock::new(config.presentation.refresh_hz);
    let started = Instant::now();

    for frame in 0..cli.frames {
        clock.wait_next().await;
        let frame_start = Instant::now();

        for client in &mut clients {
            if let Err(e) = client.draw(&mut compositor) {
                warn!("⚠️ Client {:?} failed to draw: {:#}", client.toplevel, e);
            }
        }

        match driver.tick(&compositor, &mut sink) {
            Ok(surfaces) => debug!("🖼️ Frame {} presented {} surfaces", frame, surfaces),
            Err(e) => warn!("⚠️ Frame {} failed: {}", frame, e),
        }

        executor.dispatch_pending();
        for client in &mut clients {
            client.handle_events();
        }
        clock.record_frame(frame_start.elapsed());
    }

    driver.release_all()?;
    executor.dispatch_pending();
    for client in &mut clients {
        client.handle_events();
    }

    if let Some(workers) = &workers {
        while workers.in_flight() > 0 {
            tokio::task::yield_now().await;
        }
    }

    let elapsed = started.elapsed();
    let frame_stats = clock.stats();
    let presentation = driver.stats();
    info!(
        "📊 {} frames in {:.2?} ({:.1} fps), {} missed, avg {:?}, max {:?}",
        frame_stats.total_frames,
        elapsed,
        frame_stats.total_frames as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        frame_stats.missed_frames,
        frame_stats.avg_frame_time,
        frame_stats.max_frame_time
    );
    info!(
        "📊 Buffers: {} acquired, {} released, {} bound, {} uploads",
        presentation.buffers_acquired,
        presentation.buffers_released,
        sink.buffers_bound(),
        gpu.upload_count()
    );
    for client in &clients {
        info!(
            "📊 Client {:?}: {} frames drawn, {} buffers released",
            client.toplevel, client.frames_drawn, client.buffers_released
        );
    }

    Ok(())
}
