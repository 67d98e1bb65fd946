//! Surface tree queries
//!
//! Children are kept in paint order (bottom-most first). Composition walks the
//! tree in that order; hit-testing walks it in reverse so the topmost surface
//! wins.

use std::sync::Arc;

use super::Compositor;
use crate::error::InternalError;
use crate::geometry::{Displacement, Point, Rectangle, Size};
use crate::presentation::Renderable;
use crate::surface::{RoleKind, SurfaceId};
use crate::swapchain::BufferStream;

/// One stream of a composed surface tree
#[derive(Debug, Clone)]
pub struct StreamSpec {
    pub surface: SurfaceId,
    pub stream: Arc<BufferStream>,
    /// Position relative to the root surface's parent space
    pub offset: Displacement,
    pub size: Size,
}

/// A surface tree flattened for the shell: streams in paint order plus the
/// accumulated input region
///
/// An empty `input_shape` means the tree accepts no input.
#[derive(Debug, Clone, Default)]
pub struct SurfaceData {
    pub streams: Vec<StreamSpec>,
    pub input_shape: Vec<Rectangle>,
}

impl SurfaceData {
    pub fn accepts_input_at(&self, point: Point) -> bool {
        self.input_shape.iter().any(|rect| rect.contains(point))
    }
}

impl Compositor {
    /// The outermost ancestor of a surface
    pub fn root_of(&self, id: SurfaceId) -> SurfaceId {
        let mut current = id;
        while let Some(parent) = self.surfaces.get(&current).and_then(|s| s.parent) {
            current = parent;
        }
        current
    }

    /// Drops the cached surface data of the tree `id` belongs to
    pub(super) fn invalidate_surface_data(&mut self, id: SurfaceId) {
        let root = self.root_of(id);
        if let Some(surface) = self.surfaces.get_mut(&root) {
            surface.data_cache = None;
        }
    }

    /// Composed data of the tree rooted at `root`; recomputed only after a change
    pub fn surface_data(&mut self, root: SurfaceId) -> Result<Arc<SurfaceData>, InternalError> {
        if let Some(cached) = &self.get(root)?.data_cache {
            return Ok(cached.clone());
        }

        let mut data = SurfaceData::default();
        self.populate_surface_data(root, Displacement::zero(), &mut data)?;
        let data = Arc::new(data);
        self.get_mut(root)?.data_cache = Some(data.clone());
        Ok(data)
    }

    fn populate_surface_data(
        &self,
        id: SurfaceId,
        parent_offset: Displacement,
        data: &mut SurfaceData,
    ) -> Result<(), InternalError> {
        let surface = self.get(id)?;
        let Some(size) = surface.current.logical_size() else {
            return Ok(());
        };
        let offset = parent_offset + surface.current.offset;

        data.streams.push(StreamSpec {
            surface: id,
            stream: surface.stream().clone(),
            offset,
            size,
        });
        let surface_rect = surface.current.local_rect().translated(offset);
        data.input_shape
            .extend(surface.current.input_shape.clipped_to(surface_rect));

        for child in &surface.children {
            self.populate_surface_data(*child, offset, data)?;
        }
        Ok(())
    }

    /// Topmost surface in the tree of `id` accepting input at `point`
    ///
    /// `point` is in the coordinate space `id` is positioned in. Unmapped
    /// surfaces and everything below them are never hit.
    pub fn subsurface_at(&self, id: SurfaceId, point: Point) -> Option<SurfaceId> {
        let surface = self.surfaces.get(&id)?;
        if !surface.is_mapped() {
            return None;
        }
        let local = point - surface.current.offset;

        for child in surface.children.iter().rev() {
            if let Some(hit) = self.subsurface_at(*child, local) {
                return Some(hit);
            }
        }

        let surface_rect = surface.current.local_rect();
        surface
            .current
            .input_shape
            .clipped_to(surface_rect)
            .iter()
            .any(|rect| rect.contains(local))
            .then_some(id)
    }

    /// Surfaces that head a visible tree, in creation order
    pub fn root_surfaces(&self) -> Vec<SurfaceId> {
        self.surfaces
            .values()
            .filter(|s| s.parent.is_none())
            .filter(|s| matches!(s.role_kind(), RoleKind::Toplevel | RoleKind::Cursor))
            .filter(|s| s.is_mapped())
            .map(|s| s.id())
            .collect()
    }

    /// Calls `f` for every visible surface, trees in creation order and each
    /// tree in paint order
    pub fn for_each_renderable(&self, mut f: impl FnMut(Renderable)) {
        for root in self.root_surfaces() {
            self.visit_renderables(root, Displacement::zero(), &mut f);
        }
    }

    /// All visible surfaces, as [`Compositor::for_each_renderable`] yields them
    pub fn renderables(&self) -> Vec<Renderable> {
        let mut out = Vec::new();
        self.for_each_renderable(|r| out.push(r));
        out
    }

    fn visit_renderables(&self, id: SurfaceId, parent_offset: Displacement, f: &mut impl FnMut(Renderable)) {
        let Some(surface) = self.surfaces.get(&id) else {
            return;
        };
        let Some(size) = surface.current.logical_size() else {
            return;
        };
        let offset = parent_offset + surface.current.offset;
        let rect = surface.current.local_rect().translated(offset);

        f(Renderable {
            surface: id,
            stream: surface.stream().clone(),
            offset,
            size,
            scale: surface.current.scale,
            input_shape: surface.current.input_shape.clipped_to(rect),
            damage: surface.current.damage.clone(),
        });

        for child in &surface.children {
            self.visit_renderables(*child, offset, f);
        }
    }
}
