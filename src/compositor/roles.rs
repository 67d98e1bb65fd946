//! Role binding and the subsurface protocol

use log::{debug, info, warn};

use super::Compositor;
use crate::error::{CommitError, FaultCode, InternalError, ProtocolError};
use crate::geometry::{Displacement, Point};
use crate::surface::role::SubsurfaceRole;
use crate::surface::{PendingState, Role, RoleRequest, SurfaceId};

impl Compositor {
    /// Binds a role to a surface that has none
    ///
    /// A second assignment, of any role, is a client fault. The one exception
    /// is a subsurface whose subsurface object was destroyed, which may be
    /// attached to a parent again.
    pub fn assign_role(&mut self, id: SurfaceId, request: RoleRequest) -> Result<(), CommitError> {
        let existing = self.get(id)?.role.kind();
        if !self.get(id)?.role.accepts(request) {
            return Err(self.client_fault(
                id,
                ProtocolError::new(
                    FaultCode::RoleAlreadyBound,
                    format!(
                        "surface {} already has the {} role, cannot become {}",
                        id.as_u32(),
                        existing,
                        request.kind()
                    ),
                ),
            ));
        }

        if let RoleRequest::Subsurface { parent } = request {
            self.check_subsurface_parent(id, parent)?;
        }

        self.get_mut(id)?.role = Role::from_request(request);

        if let RoleRequest::Subsurface { parent } = request {
            self.get_mut(id)?.parent = Some(parent);
            self.get_mut(parent)?.children.push(id);
            self.invalidate_surface_data(parent);
        }

        info!("🎭 Surface {:?} is now a {}", id, request.kind());
        Ok(())
    }

    /// Makes `child` a subsurface of `parent`, stacked on top of its siblings
    pub fn create_subsurface(&mut self, child: SurfaceId, parent: SurfaceId) -> Result<(), CommitError> {
        self.assign_role(child, RoleRequest::Subsurface { parent })
    }

    fn check_subsurface_parent(&self, child: SurfaceId, parent: SurfaceId) -> Result<(), CommitError> {
        self.get(parent)?;
        if parent == child {
            return Err(self.client_fault(
                child,
                ProtocolError::new(FaultCode::BadSurface, "a surface cannot be its own parent"),
            ));
        }
        let mut ancestor = Some(parent);
        while let Some(current) = ancestor {
            if current == child {
                return Err(self.client_fault(
                    child,
                    ProtocolError::new(
                        FaultCode::BadSurface,
                        "parent is a descendant of the subsurface",
                    ),
                ));
            }
            ancestor = self.get(current)?.parent;
        }
        Ok(())
    }

    /// Destroys the subsurface object: the surface leaves its parent and is unmapped
    ///
    /// The surface keeps its subsurface role; it can only be given a parent again.
    pub fn remove_subsurface(&mut self, child: SurfaceId) -> Result<(), CommitError> {
        self.subsurface_parent(child)?;
        let surface = self.get_mut(child)?;
        surface.role = Role::Subsurface(SubsurfaceRole::detached());
        surface.current.buffer_size = None;
        let parent = surface.parent.take();
        let (shared, stream) = (surface.shared().clone(), surface.stream().clone());
        stream.drain()?;
        shared.send_frame_callbacks();

        if let Some(parent) = parent {
            self.get_mut(parent)?.children.retain(|c| *c != child);
            self.invalidate_surface_data(parent);
        }
        self.invalidate_surface_data(child);
        debug!("✂️ Subsurface {:?} detached from {:?}", child, parent);
        Ok(())
    }

    /// Whether commits on this surface are cached until the parent commits
    ///
    /// A subsurface is synchronized if it, or any subsurface ancestor, is in
    /// synchronized mode.
    pub fn is_synchronized(&self, id: SurfaceId) -> bool {
        let mut next = Some(id);
        while let Some(current) = next {
            let Some(surface) = self.surfaces.get(&current) else {
                return false;
            };
            match surface.role.as_subsurface() {
                Some(role) if role.synchronized => return true,
                Some(_) => next = surface.parent,
                None => return false,
            }
        }
        false
    }

    fn subsurface_parent(&self, child: SurfaceId) -> Result<Option<SurfaceId>, CommitError> {
        let surface = self.get(child)?;
        if surface.role.as_subsurface().map_or(true, |role| role.detached) {
            return Err(self.client_fault(
                child,
                ProtocolError::new(FaultCode::BadSurface, "surface is not a subsurface"),
            ));
        }
        Ok(surface.parent)
    }

    pub(super) fn commit_subsurface(&mut self, id: SurfaceId, state: PendingState) -> Result<(), CommitError> {
        if self.is_synchronized(id) {
            if let Some(role) = self.get_mut(id)?.role.as_subsurface_mut() {
                role.cache(state);
            }
            debug!("📦 Cached commit of synchronized subsurface {:?}", id);
            return Ok(());
        }

        let mut merged = self
            .get_mut(id)?
            .role
            .as_subsurface_mut()
            .and_then(|role| role.take_cache())
            .unwrap_or_default();
        merged.update_from(state);
        self.ignore_attach_offset(id, &merged);
        self.apply_state(id, merged)
    }

    /// Runs after the parent's state is fully merged
    pub(super) fn parent_committed(&mut self, child: SurfaceId) -> Result<(), CommitError> {
        let surface = self.get_mut(child)?;
        let Some(role) = surface.role.as_subsurface_mut() else {
            return Err(InternalError::TreeCorrupted(format!(
                "{:?} is a child but not a subsurface",
                child
            ))
            .into());
        };

        if let Some(position) = role.pending_position.take() {
            surface.current.offset = Displacement::new(position.x, position.y);
            self.invalidate_surface_data(child);
        }

        if self.is_synchronized(child) {
            let cached = self
                .get_mut(child)?
                .role
                .as_subsurface_mut()
                .and_then(|role| role.take_cache());
            if let Some(state) = cached {
                self.ignore_attach_offset(child, &state);
                self.apply_state(child, state)?;
            }
        }
        Ok(())
    }

    /// Stages the subsurface position; applied when the parent commits
    pub fn set_position(&mut self, child: SurfaceId, position: Point) -> Result<(), CommitError> {
        self.subsurface_parent(child)?;
        if let Some(role) = self.get_mut(child)?.role.as_subsurface_mut() {
            role.pending_position = Some(position);
        }
        Ok(())
    }

    pub fn set_sync(&mut self, child: SurfaceId) -> Result<(), CommitError> {
        self.subsurface_parent(child)?;
        if let Some(role) = self.get_mut(child)?.role.as_subsurface_mut() {
            role.synchronized = true;
        }
        Ok(())
    }

    /// Leaves synchronized mode; cached state is applied at once if the
    /// surface is no longer synchronized through an ancestor
    pub fn set_desync(&mut self, child: SurfaceId) -> Result<(), CommitError> {
        self.subsurface_parent(child)?;
        if let Some(role) = self.get_mut(child)?.role.as_subsurface_mut() {
            role.synchronized = false;
        }
        if self.is_synchronized(child) {
            return Ok(());
        }
        let cached = self
            .get_mut(child)?
            .role
            .as_subsurface_mut()
            .and_then(|role| role.take_cache());
        match cached {
            Some(state) => self.apply_state(child, state),
            None => Ok(()),
        }
    }

    pub fn place_above(&mut self, child: SurfaceId, sibling: SurfaceId) -> Result<(), CommitError> {
        self.restack(child, sibling, true)
    }

    pub fn place_below(&mut self, child: SurfaceId, sibling: SurfaceId) -> Result<(), CommitError> {
        self.restack(child, sibling, false)
    }

    fn restack(&mut self, child: SurfaceId, sibling: SurfaceId, above: bool) -> Result<(), CommitError> {
        let Some(parent) = self.subsurface_parent(child)? else {
            return Err(self.client_fault(
                child,
                ProtocolError::new(FaultCode::BadSurface, "subsurface has no parent"),
            ));
        };

        let valid_sibling =
            sibling == parent || (sibling != child && self.get(parent)?.children.contains(&sibling));
        if !valid_sibling {
            return Err(self.client_fault(
                child,
                ProtocolError::new(
                    FaultCode::BadSurface,
                    format!("surface {} is not a sibling or the parent", sibling.as_u32()),
                ),
            ));
        }

        let children = &mut self.get_mut(parent)?.children;
        children.retain(|c| *c != child);
        let index = if sibling == parent {
            if !above {
                warn!("⚠️ Placing {:?} below its parent is not supported, keeping it above", child);
            }
            0
        } else {
            let position = children.iter().position(|c| *c == sibling).unwrap_or(0);
            if above {
                position + 1
            } else {
                position
            }
        };
        children.insert(index, child);
        self.invalidate_surface_data(parent);
        Ok(())
    }
}
