//! Window management hooks
//!
//! Placement and focus policy live outside the core. The compositor only tells
//! window management when a toplevel gains or loses content.

use log::debug;

use crate::geometry::Size;
use crate::surface::SurfaceId;

pub trait WindowManagement: Send + Sync {
    /// A toplevel committed its first buffer, or changed size while mapped
    fn toplevel_mapped(&self, surface: SurfaceId, size: Size) {
        let _ = (surface, size);
    }

    /// A toplevel was unmapped or destroyed while mapped
    fn toplevel_unmapped(&self, surface: SurfaceId) {
        let _ = surface;
    }
}

/// Window management that accepts everything and does nothing
#[derive(Debug, Default)]
pub struct NoopWindowManagement;

impl WindowManagement for NoopWindowManagement {
    fn toplevel_mapped(&self, surface: SurfaceId, size: Size) {
        debug!("🪟 Toplevel {:?} mapped at {}x{}", surface, size.width, size.height);
    }

    fn toplevel_unmapped(&self, surface: SurfaceId) {
        debug!("🪟 Toplevel {:?} unmapped", surface);
    }
}
