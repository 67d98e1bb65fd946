//! Presentation side of the swapchain
//!
//! The compositor enumerates visible surfaces as [`Renderable`]s; the
//! [`PresentationDriver`] acquires each one's next buffer, hands the frame to a
//! [`PresentationSink`] and releases the buffers the frame replaced.
//!
//! # Usage
//!
//! ```no_run
//! use meridian::presentation::{FrameClock, PresentationDriver, PresentationSink};
//! # async fn run(compositor: &meridian::compositor::Compositor, sink: &mut dyn PresentationSink) {
//! let mut clock = FrameClock::new(60);
//! let mut driver = PresentationDriver::new();
//!
//! loop {
//!     clock.wait_next().await;
//!     let started = std::time::Instant::now();
//!     if let Err(e) = driver.tick(compositor, sink) {
//!         log::warn!("frame failed: {}", e);
//!     }
//!     clock.record_frame(started.elapsed());
//! }
//! # }
//! ```

use log::{debug, info, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::allocator::Allocator;
use crate::buffer::{BufferHandle, BufferId};
use crate::compositor::Compositor;
use crate::error::{PlatformError, PresentationError};
use crate::geometry::{Displacement, Rectangle, Size};
use crate::logging::Span;
use crate::surface::SurfaceId;
use crate::swapchain::{BufferStream, StreamId};

/// Frames kept for timing statistics
const FRAME_HISTORY_SIZE: usize = 120;

/// A frame counts as missed when it takes this much longer than the interval
const MISSED_FRAME_THRESHOLD: f32 = 1.5;

/// A visible surface as the compositor reports it
#[derive(Debug, Clone)]
pub struct Renderable {
    pub surface: SurfaceId,
    pub stream: Arc<BufferStream>,
    /// Absolute position of the surface's top-left corner
    pub offset: Displacement,
    /// Logical size
    pub size: Size,
    pub scale: i32,
    /// Absolute input rectangles, clipped to the surface
    pub input_shape: Vec<Rectangle>,
    /// Surface-local damage of the last commit
    pub damage: Vec<Rectangle>,
}

/// A renderable together with the buffer shown for it in this frame
#[derive(Debug, Clone)]
pub struct PresentedSurface {
    pub renderable: Renderable,
    pub buffer: BufferHandle,
    /// Whether the buffer was acquired for this frame (as opposed to repeated)
    pub fresh: bool,
}

/// Consumer of composed frames, typically posting them to a display
pub trait PresentationSink {
    fn present(&mut self, frame: &[PresentedSurface]) -> Result<(), PlatformError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresentationStats {
    pub frames: u64,
    pub buffers_acquired: u64,
    pub buffers_released: u64,
    pub failed_frames: u64,
}

/// Drives streams on the presentation cadence
///
/// Each stream's buffer stays in flight for as long as it is on screen; it is
/// released once a newer buffer replaces it or its surface stops being visible.
#[derive(Default)]
pub struct PresentationDriver {
    on_screen: HashMap<StreamId, (Arc<BufferStream>, BufferHandle)>,
    stats: PresentationStats,
}

impl PresentationDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Composes and presents one frame; returns the number of surfaces shown
    pub fn tick(
        &mut self,
        compositor: &Compositor,
        sink: &mut dyn PresentationSink,
    ) -> Result<usize, PresentationError> {
        let mut frame = Vec::new();
        let mut next_on_screen = HashMap::new();

        for renderable in compositor.renderables() {
            let stream_id = renderable.stream.id();
            let (buffer, fresh) = match renderable.stream.acquire() {
                Some(buffer) => {
                    self.stats.buffers_acquired += 1;
                    (buffer, true)
                }
                None => match self.on_screen.get(&stream_id) {
                    Some((_, previous)) => (previous.clone(), false),
                    // committed but superseded before we ever saw it; nothing to show yet
                    None => continue,
                },
            };
            next_on_screen.insert(stream_id, (renderable.stream.clone(), buffer.clone()));
            frame.push(PresentedSurface {
                renderable,
                buffer,
                fresh,
            });
        }

        let span = Span::start("present");
        let presented = sink.present(&frame);
        span.finish();
        self.stats.frames += 1;

        let previous = std::mem::replace(&mut self.on_screen, next_on_screen);
        for (stream_id, (stream, buffer)) in previous {
            let still_shown = self
                .on_screen
                .get(&stream_id)
                .is_some_and(|(_, current)| current.ptr_eq(&buffer));
            if !still_shown {
                stream.release(&buffer)?;
                self.stats.buffers_released += 1;
            }
        }

        match presented {
            Ok(()) => Ok(frame.len()),
            Err(e) => {
                self.stats.failed_frames += 1;
                warn!("⚠️ Presentation failed: {}", e);
                Err(e.into())
            }
        }
    }

    /// Releases every buffer still on screen
    pub fn release_all(&mut self) -> Result<usize, PresentationError> {
        let mut released = 0;
        for (_, (stream, buffer)) in self.on_screen.drain() {
            stream.release(&buffer)?;
            released += 1;
        }
        self.stats.buffers_released += released as u64;
        Ok(released)
    }

    /// Buffers currently held on screen
    pub fn on_screen(&self) -> Vec<BufferId> {
        self.on_screen.values().map(|(_, b)| b.id()).collect()
    }

    pub fn stats(&self) -> PresentationStats {
        self.stats.clone()
    }
}

/// Sink that binds every fresh buffer with the allocator's context current
///
/// Stands in for a display: it exercises GPU image creation the way a
/// renderer would and otherwise discards the frame.
pub struct HeadlessSink {
    allocator: Arc<Allocator>,
    bound: u64,
    frames: u64,
}

impl HeadlessSink {
    pub fn new(allocator: Arc<Allocator>) -> Self {
        Self {
            allocator,
            bound: 0,
            frames: 0,
        }
    }

    pub fn buffers_bound(&self) -> u64 {
        self.bound
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }
}

impl PresentationSink for HeadlessSink {
    fn present(&mut self, frame: &[PresentedSurface]) -> Result<(), PlatformError> {
        for surface in frame.iter().filter(|s| s.fresh) {
            self.allocator
                .bind_now(&surface.buffer)
                .map_err(|e| PlatformError::Presentation(e.to_string()))?;
            self.bound += 1;
        }
        self.frames += 1;
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct FrameStats {
    pub total_frames: u64,
    pub missed_frames: u64,
    pub avg_frame_time: Duration,
    pub max_frame_time: Duration,
}

/// Paces presentation ticks at the display refresh rate
pub struct FrameClock {
    interval: Interval,
    period: Duration,
    history: VecDeque<Duration>,
    stats: FrameStats,
}

impl FrameClock {
    /// Must be called inside a tokio runtime
    pub fn new(refresh_hz: u32) -> Self {
        let period = Self::period_for(refresh_hz);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("🎬 Frame clock at {}Hz ({:?} per frame)", refresh_hz.max(1), period);
        Self {
            interval,
            period,
            history: VecDeque::with_capacity(FRAME_HISTORY_SIZE),
            stats: FrameStats::default(),
        }
    }

    pub fn period_for(refresh_hz: u32) -> Duration {
        Duration::from_secs_f64(1.0 / refresh_hz.max(1) as f64)
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Waits for the next refresh; missed refreshes are skipped, not bunched up
    pub async fn wait_next(&mut self) -> Instant {
        self.interval.tick().await
    }

    /// Records how long composing a frame took
    pub fn record_frame(&mut self, duration: Duration) {
        let missed = duration.as_secs_f32() > self.period.as_secs_f32() * MISSED_FRAME_THRESHOLD;
        if missed {
            self.stats.missed_frames += 1;
            debug!("⚠️ Frame took {:?} (period {:?})", duration, self.period);
        }

        self.history.push_back(duration);
        if self.history.len() > FRAME_HISTORY_SIZE {
            self.history.pop_front();
        }

        self.stats.total_frames += 1;
        let total: Duration = self.history.iter().sum();
        self.stats.avg_frame_time = total / self.history.len() as u32;
        self.stats.max_frame_time = self.history.iter().copied().max().unwrap_or_default();
    }

    pub fn stats(&self) -> FrameStats {
        self.stats.clone()
    }
}
