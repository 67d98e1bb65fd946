//! Double-buffered surface state
//!
//! Requests stage changes into a [`PendingState`]; a commit moves the whole
//! record out and merges it into the [`CurrentState`]. Merging only overwrites
//! what was staged. Frame callbacks and damage accumulate.

use crate::geometry::{Displacement, Rectangle, Size};
use crate::transport::{AttachedBuffer, FrameCallback};

/// A pending field that distinguishes "untouched" from "explicitly cleared"
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Staged<T> {
    /// Not touched since the last commit; current state is kept
    Untouched,
    Set(T),
    /// Explicitly reset (null buffer, null region)
    Cleared,
}

impl<T> Staged<T> {
    pub fn is_untouched(&self) -> bool {
        matches!(self, Staged::Untouched)
    }

    /// Later staging wins unless it left the field untouched
    pub fn update_from(&mut self, newer: Staged<T>) {
        if !newer.is_untouched() {
            *self = newer;
        }
    }
}

impl<T> Default for Staged<T> {
    fn default() -> Self {
        Staged::Untouched
    }
}

/// Changes staged since the last commit
#[derive(Debug, Clone, Default)]
pub struct PendingState {
    /// Attached buffer; `Cleared` unmaps the surface
    pub buffer: Staged<AttachedBuffer>,
    /// `x`/`y` of the last attach request
    pub buffer_offset: Option<Displacement>,
    pub scale: Option<i32>,
    /// Position relative to the parent surface
    pub offset: Option<Displacement>,
    /// `Cleared` restores the default (whole surface) input region
    pub input_shape: Staged<Vec<Rectangle>>,
    /// Surface-local damage
    pub damage: Vec<Rectangle>,
    /// Damage in buffer pixels; scaled into surface coordinates on commit
    pub buffer_damage: Vec<Rectangle>,
    pub frame_callbacks: Vec<FrameCallback>,
}

impl PendingState {
    /// Folds a later pending record into this one
    pub fn update_from(&mut self, newer: PendingState) {
        self.buffer.update_from(newer.buffer);
        if newer.buffer_offset.is_some() {
            self.buffer_offset = newer.buffer_offset;
        }
        if newer.scale.is_some() {
            self.scale = newer.scale;
        }
        if newer.offset.is_some() {
            self.offset = newer.offset;
        }
        self.input_shape.update_from(newer.input_shape);
        self.damage.extend(newer.damage);
        self.buffer_damage.extend(newer.buffer_damage);
        self.frame_callbacks.extend(newer.frame_callbacks);
    }

    /// Drops staged values identical to what is already current
    ///
    /// Region equality is by rectangle list; the same region expressed with
    /// different rectangles still counts as a change.
    pub fn drop_redundant(&mut self, current: &CurrentState) {
        if self.offset == Some(current.offset) {
            self.offset = None;
        }
        let redundant_input = match (&self.input_shape, &current.input_shape) {
            (Staged::Set(rects), InputShape::Region(current)) => rects == current,
            (Staged::Cleared, InputShape::FullSurface) => true,
            _ => false,
        };
        if redundant_input {
            self.input_shape = Staged::Untouched;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_untouched()
            && self.buffer_offset.is_none()
            && self.scale.is_none()
            && self.offset.is_none()
            && self.input_shape.is_untouched()
            && self.damage.is_empty()
            && self.buffer_damage.is_empty()
            && self.frame_callbacks.is_empty()
    }
}

/// Which part of a surface accepts input
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum InputShape {
    /// The whole surface rectangle
    #[default]
    FullSurface,
    /// Exactly these rectangles; an empty list accepts no input at all
    Region(Vec<Rectangle>),
}

impl InputShape {
    /// Input rectangles clipped to `surface_rect`, in the same coordinate space
    pub fn clipped_to(&self, surface_rect: Rectangle) -> Vec<Rectangle> {
        match self {
            InputShape::FullSurface => {
                if surface_rect.is_empty() {
                    Vec::new()
                } else {
                    vec![surface_rect]
                }
            }
            InputShape::Region(rects) => rects
                .iter()
                .map(|r| {
                    r.translated(Displacement::new(surface_rect.top_left.x, surface_rect.top_left.y))
                })
                .map(|r| r.intersection_with(&surface_rect))
                .filter(|r| !r.is_empty())
                .collect(),
        }
    }
}

/// The committed view of a surface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentState {
    pub offset: Displacement,
    pub input_shape: InputShape,
    /// Size of the committed buffer in buffer pixels; `None` while unmapped
    pub buffer_size: Option<Size>,
    pub scale: i32,
    /// Surface-local damage of the last commit
    pub damage: Vec<Rectangle>,
}

impl Default for CurrentState {
    fn default() -> Self {
        Self {
            offset: Displacement::zero(),
            input_shape: InputShape::FullSurface,
            buffer_size: None,
            scale: 1,
            damage: Vec::new(),
        }
    }
}

/// What a merge changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppliedChanges {
    pub offset: bool,
    pub input_shape: bool,
    pub scale: bool,
}

impl AppliedChanges {
    pub fn any(&self) -> bool {
        self.offset || self.input_shape || self.scale
    }
}

impl CurrentState {
    pub fn is_mapped(&self) -> bool {
        self.buffer_size.is_some()
    }

    /// Surface size in logical pixels
    pub fn logical_size(&self) -> Option<Size> {
        self.buffer_size.map(|size| size.downscale(self.scale))
    }

    /// The surface rectangle in its own coordinate space
    pub fn local_rect(&self) -> Rectangle {
        Rectangle::from_size(self.logical_size().unwrap_or_default())
    }

    /// Merges every staged attribute except the buffer
    ///
    /// The buffer needs the allocator and the stream, so the caller resolves it.
    pub fn apply_attributes(&mut self, pending: &PendingState) -> AppliedChanges {
        let mut changes = AppliedChanges::default();

        if let Some(offset) = pending.offset {
            self.offset = offset;
            changes.offset = true;
        }

        match &pending.input_shape {
            Staged::Untouched => {}
            Staged::Set(rects) => {
                self.input_shape = InputShape::Region(rects.clone());
                changes.input_shape = true;
            }
            Staged::Cleared => {
                self.input_shape = InputShape::FullSurface;
                changes.input_shape = true;
            }
        }

        if let Some(scale) = pending.scale {
            changes.scale = scale != self.scale;
            self.scale = scale;
        }

        let scale = self.scale.max(1);
        self.damage = pending
            .damage
            .iter()
            .copied()
            .chain(pending.buffer_damage.iter().map(|r| {
                Rectangle::new(
                    r.top_left.x / scale,
                    r.top_left.y / scale,
                    r.size.width.div_ceil(scale as u32),
                    r.size.height.div_ceil(scale as u32),
                )
            }))
            .collect();

        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_staged_update_keeps_untouched() {
        let mut staged = Staged::Set(3);
        staged.update_from(Staged::Untouched);
        assert_eq!(staged, Staged::Set(3));
        staged.update_from(Staged::Cleared);
        assert_eq!(staged, Staged::Cleared);
    }

    #[test]
    fn test_callbacks_concatenate() {
        let mut older = PendingState::default();
        older.frame_callbacks.push(FrameCallback::new(1));
        let mut newer = PendingState::default();
        newer.frame_callbacks.push(FrameCallback::new(2));
        newer.frame_callbacks.push(FrameCallback::new(3));

        older.update_from(newer);
        let ids: Vec<u32> = older.frame_callbacks.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_redundant_offset_and_input_dropped() {
        let current = CurrentState {
            offset: Displacement::new(4, 4),
            input_shape: InputShape::Region(vec![Rectangle::new(0, 0, 2, 2)]),
            ..CurrentState::default()
        };
        let mut pending = PendingState {
            offset: Some(Displacement::new(4, 4)),
            input_shape: Staged::Set(vec![Rectangle::new(0, 0, 2, 2)]),
            ..PendingState::default()
        };
        pending.drop_redundant(&current);
        assert!(pending.offset.is_none());
        assert!(pending.input_shape.is_untouched());

        let mut pending = PendingState {
            input_shape: Staged::Cleared,
            ..PendingState::default()
        };
        pending.drop_redundant(&current);
        assert_eq!(pending.input_shape, Staged::Cleared);
    }

    #[test]
    fn test_explicit_empty_region_accepts_nothing() {
        let rect = Rectangle::new(10, 10, 100, 100);
        assert!(InputShape::Region(vec![]).clipped_to(rect).is_empty());
        assert_eq!(InputShape::FullSurface.clipped_to(rect), vec![rect]);
    }

    #[test]
    fn test_region_is_clipped_and_translated() {
        let shape = InputShape::Region(vec![Rectangle::new(-5, -5, 10, 10), Rectangle::new(50, 50, 5, 5)]);
        let clipped = shape.clipped_to(Rectangle::new(100, 100, 20, 20));
        assert_eq!(clipped, vec![Rectangle::new(100, 100, 5, 5)]);
    }

    #[test]
    fn test_logical_size_uses_scale() {
        let mut current = CurrentState::default();
        assert_eq!(current.logical_size(), None);
        current.buffer_size = Some(Size::new(200, 100));
        current.apply_attributes(&PendingState {
            scale: Some(2),
            ..PendingState::default()
        });
        assert_eq!(current.logical_size(), Some(Size::new(100, 50)));
        assert_eq!(current.local_rect(), Rectangle::new(0, 0, 100, 50));
    }

    #[test]
    fn test_buffer_damage_scaled_to_surface() {
        let mut current = CurrentState {
            scale: 2,
            ..CurrentState::default()
        };
        current.apply_attributes(&PendingState {
            damage: vec![Rectangle::new(0, 0, 1, 1)],
            buffer_damage: vec![Rectangle::new(4, 4, 3, 3)],
            ..PendingState::default()
        });
        assert_eq!(
            current.damage,
            vec![Rectangle::new(0, 0, 1, 1), Rectangle::new(2, 2, 2, 2)]
        );
    }

    #[derive(Debug, Clone)]
    enum Update {
        Scale(i32),
        Offset(i32, i32),
        Input(Option<Vec<(i32, i32, u32, u32)>>),
    }

    fn update() -> impl Strategy<Value = Update> {
        prop_oneof![
            (1i32..4).prop_map(Update::Scale),
            (-50i32..50, -50i32..50).prop_map(|(x, y)| Update::Offset(x, y)),
            proptest::option::of(proptest::collection::vec(
                (-10i32..10, -10i32..10, 0u32..20, 0u32..20),
                0..3
            ))
            .prop_map(Update::Input),
        ]
    }

    fn stage(pending: &mut PendingState, update: &Update) {
        match update {
            Update::Scale(s) => pending.scale = Some(*s),
            Update::Offset(x, y) => pending.offset = Some(Displacement::new(*x, *y)),
            Update::Input(None) => pending.input_shape = Staged::Cleared,
            Update::Input(Some(rects)) => {
                pending.input_shape = Staged::Set(
                    rects
                        .iter()
                        .map(|(x, y, w, h)| Rectangle::new(*x, *y, *w, *h))
                        .collect(),
                )
            }
        }
    }

    proptest! {
        #[test]
        fn prop_merge_takes_last_staged_value(
            rounds in proptest::collection::vec(proptest::collection::vec(update(), 0..6), 1..5),
            split in 0usize..6,
        ) {
            let mut current = CurrentState::default();
            let mut expected = CurrentState::default();

            for updates in &rounds {
                // stage part of the round directly, the rest through a merged record
                let (first, second) = updates.split_at(split.min(updates.len()));
                let mut pending = PendingState::default();
                for u in first {
                    stage(&mut pending, u);
                }
                let mut later = PendingState::default();
                for u in second {
                    stage(&mut later, u);
                }
                pending.update_from(later);
                pending.drop_redundant(&current);
                current.apply_attributes(&pending);

                for u in updates {
                    match u {
                        Update::Scale(s) => expected.scale = *s,
                        Update::Offset(x, y) => expected.offset = Displacement::new(*x, *y),
                        Update::Input(None) => expected.input_shape = InputShape::FullSurface,
                        Update::Input(Some(rects)) => {
                            expected.input_shape = InputShape::Region(
                                rects.iter().map(|(x, y, w, h)| Rectangle::new(*x, *y, *w, *h)).collect(),
                            )
                        }
                    }
                }

                prop_assert_eq!(&current.offset, &expected.offset);
                prop_assert_eq!(&current.input_shape, &expected.input_shape);
                prop_assert_eq!(current.scale, expected.scale);
                prop_assert_eq!(current.buffer_size, None);
            }
        }
    }
}
