//! Surface roles
//!
//! A surface gets at most one role in its lifetime. Until then it commits
//! through the passthrough behaviour of [`Role::None`].

use crate::geometry::{Displacement, Point, Size};
use crate::surface::state::PendingState;
use crate::surface::SurfaceId;

/// Role requested by a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleRequest {
    Toplevel,
    Cursor { hotspot: Displacement },
    Subsurface { parent: SurfaceId },
}

impl RoleRequest {
    pub fn kind(&self) -> RoleKind {
        match self {
            RoleRequest::Toplevel => RoleKind::Toplevel,
            RoleRequest::Cursor { .. } => RoleKind::Cursor,
            RoleRequest::Subsurface { .. } => RoleKind::Subsurface,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoleKind {
    None,
    Toplevel,
    Subsurface,
    Cursor,
}

impl std::fmt::Display for RoleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RoleKind::None => "none",
            RoleKind::Toplevel => "toplevel",
            RoleKind::Subsurface => "subsurface",
            RoleKind::Cursor => "cursor",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Default)]
pub struct ToplevelRole {
    /// Size last reported to window management; `None` while unmapped
    pub mapped_size: Option<Size>,
}

#[derive(Debug)]
pub struct SubsurfaceRole {
    /// Own synchronized flag; the effective mode also depends on ancestors
    pub synchronized: bool,
    /// State committed while synchronized, applied on the parent's commit
    pub cached: PendingState,
    pub has_cache: bool,
    /// Position staged by `set_position`, applied on the parent's commit
    pub pending_position: Option<Point>,
    /// Set once the subsurface object is gone; the surface keeps the role
    /// and may only be made a subsurface again
    pub detached: bool,
}

impl Default for SubsurfaceRole {
    fn default() -> Self {
        Self {
            // subsurfaces start synchronized
            synchronized: true,
            cached: PendingState::default(),
            has_cache: false,
            pending_position: None,
            detached: false,
        }
    }
}

impl SubsurfaceRole {
    /// Role state left behind when the subsurface object is destroyed
    pub fn detached() -> Self {
        Self {
            synchronized: false,
            detached: true,
            ..Self::default()
        }
    }

    /// Adds a commit to the cache
    pub fn cache(&mut self, state: PendingState) {
        self.cached.update_from(state);
        self.has_cache = true;
    }

    /// Takes the cached state, leaving the cache empty
    pub fn take_cache(&mut self) -> Option<PendingState> {
        if !self.has_cache {
            return None;
        }
        self.has_cache = false;
        Some(std::mem::take(&mut self.cached))
    }
}

#[derive(Debug, Default)]
pub struct CursorRole {
    pub hotspot: Displacement,
}

#[derive(Debug, Default)]
pub enum Role {
    #[default]
    None,
    Toplevel(ToplevelRole),
    Subsurface(SubsurfaceRole),
    Cursor(CursorRole),
}

impl Role {
    pub fn from_request(request: RoleRequest) -> Self {
        match request {
            RoleRequest::Toplevel => Role::Toplevel(ToplevelRole::default()),
            RoleRequest::Cursor { hotspot } => Role::Cursor(CursorRole { hotspot }),
            RoleRequest::Subsurface { .. } => Role::Subsurface(SubsurfaceRole::default()),
        }
    }

    pub fn kind(&self) -> RoleKind {
        match self {
            Role::None => RoleKind::None,
            Role::Toplevel(_) => RoleKind::Toplevel,
            Role::Subsurface(_) => RoleKind::Subsurface,
            Role::Cursor(_) => RoleKind::Cursor,
        }
    }

    pub fn is_assigned(&self) -> bool {
        !matches!(self, Role::None)
    }

    /// Whether `request` may bind this role: a fresh surface takes any role,
    /// a detached subsurface may only become a subsurface again
    pub fn accepts(&self, request: RoleRequest) -> bool {
        match self {
            Role::None => true,
            Role::Subsurface(role) => role.detached && request.kind() == RoleKind::Subsurface,
            _ => false,
        }
    }

    pub fn as_subsurface(&self) -> Option<&SubsurfaceRole> {
        match self {
            Role::Subsurface(role) => Some(role),
            _ => None,
        }
    }

    pub fn as_subsurface_mut(&mut self) -> Option<&mut SubsurfaceRole> {
        match self {
            Role::Subsurface(role) => Some(role),
            _ => None,
        }
    }
}
