//! # Meridian compositing core
//!
//! The client-facing half of a display server: surfaces with double-buffered
//! state, role binding, subsurface trees, client buffer import and the
//! per-surface buffer streams a presentation loop consumes.
//!
//! ## Architecture
//!
//! - `compositor`: surface registry, commit path, roles and tree queries
//! - `surface`: pending/current state records and role data
//! - `allocator`: shm, native pixmap and dmabuf import, software allocation
//! - `swapchain`: per-surface buffer streams (mailbox or bounded queue)
//! - `presentation`: acquiring buffers per frame and handing them to a sink
//! - `executor`: protocol-context and render-worker execution
//! - `platform`: GPU device and render context interfaces, plus a headless device
//! - `transport`: the outgoing side of a client connection
//! - `config`: configuration parsing and validation
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use meridian::allocator::Allocator;
//! use meridian::compositor::Compositor;
//! use meridian::executor::QueuedExecutor;
//! use meridian::platform::{HeadlessContextFactory, HeadlessGpu};
//! use meridian::CoreConfig;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = CoreConfig::default();
//!     let gpu = Arc::new(HeadlessGpu::new());
//!     let allocator = Arc::new(Allocator::new(
//!         gpu.clone(),
//!         &HeadlessContextFactory::new(gpu),
//!         config.allocator.clone(),
//!     )?);
//!     allocator.bind_display();
//!
//!     let executor = Arc::new(QueuedExecutor::new());
//!     let mut compositor = Compositor::new(allocator, executor.clone(), &config);
//!     // feed decoded client requests to `compositor`, drain `executor` after each batch
//!     # let _ = &mut compositor;
//!     Ok(())
//! }
//! ```

pub mod allocator;
pub mod buffer;
pub mod compositor;
pub mod config;
pub mod error;
pub mod executor;
pub mod geometry;
pub mod logging;
pub mod platform;
pub mod presentation;
pub mod shell;
pub mod surface;
pub mod swapchain;
pub mod testing;
pub mod transport;

// Re-export main types for easy access
pub use allocator::{Allocator, ClientBuffer};
pub use buffer::{BufferHandle, PixelFormat};
pub use compositor::{Compositor, SurfaceData};
pub use config::CoreConfig;
pub use error::{AllocError, CommitError, FaultCode, InternalError, ProtocolError};
pub use presentation::{PresentationDriver, PresentationSink};
pub use surface::{RoleRequest, SurfaceId};
pub use swapchain::{BufferStream, SwapchainMode};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const BUILD_DATE: &str = env!("BUILD_DATE");
pub const GIT_COMMIT: &str = env!("GIT_COMMIT");
