//! Integer geometry used for surface placement and input shapes
//!
//! All coordinates are in logical pixels. Rectangles are half-open: a
//! rectangle at `(0, 0)` of size `10x10` contains `(9, 9)` but not `(10, 10)`.

use std::ops::{Add, Sub};

/// A position in some surface-local or global coordinate space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// A relative offset between two coordinate spaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Displacement {
    pub dx: i32,
    pub dy: i32,
}

impl Displacement {
    pub const fn new(dx: i32, dy: i32) -> Self {
        Self { dx, dy }
    }

    pub const fn zero() -> Self {
        Self { dx: 0, dy: 0 }
    }
}

impl Add for Displacement {
    type Output = Displacement;

    fn add(self, rhs: Displacement) -> Displacement {
        Displacement::new(self.dx + rhs.dx, self.dy + rhs.dy)
    }
}

impl Sub for Displacement {
    type Output = Displacement;

    fn sub(self, rhs: Displacement) -> Displacement {
        Displacement::new(self.dx - rhs.dx, self.dy - rhs.dy)
    }
}

impl Add<Displacement> for Point {
    type Output = Point;

    fn add(self, rhs: Displacement) -> Point {
        Point::new(self.x + rhs.dx, self.y + rhs.dy)
    }
}

impl Sub<Displacement> for Point {
    type Output = Point;

    fn sub(self, rhs: Displacement) -> Point {
        Point::new(self.x - rhs.dx, self.y - rhs.dy)
    }
}

/// Width and height in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Scales down by an integer buffer scale, as clients render at `scale`x
    pub fn downscale(&self, scale: i32) -> Size {
        let scale = scale.max(1) as u32;
        Size::new(self.width / scale, self.height / scale)
    }
}

/// Axis-aligned rectangle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rectangle {
    pub top_left: Point,
    pub size: Size,
}

impl Rectangle {
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            top_left: Point::new(x, y),
            size: Size::new(width, height),
        }
    }

    pub fn from_size(size: Size) -> Self {
        Self {
            top_left: Point::default(),
            size,
        }
    }

    fn right(&self) -> i64 {
        self.top_left.x as i64 + self.size.width as i64
    }

    fn bottom(&self) -> i64 {
        self.top_left.y as i64 + self.size.height as i64
    }

    pub fn is_empty(&self) -> bool {
        self.size.is_empty()
    }

    pub fn contains(&self, point: Point) -> bool {
        let (x, y) = (point.x as i64, point.y as i64);
        x >= self.top_left.x as i64 && y >= self.top_left.y as i64 && x < self.right() && y < self.bottom()
    }

    /// Overlap of two rectangles; empty (zero size) when they do not intersect
    pub fn intersection_with(&self, other: &Rectangle) -> Rectangle {
        let left = self.top_left.x.max(other.top_left.x);
        let top = self.top_left.y.max(other.top_left.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());

        if right <= left as i64 || bottom <= top as i64 {
            return Rectangle::new(left, top, 0, 0);
        }

        Rectangle::new(
            left,
            top,
            (right - left as i64) as u32,
            (bottom - top as i64) as u32,
        )
    }

    pub fn translated(&self, by: Displacement) -> Rectangle {
        Rectangle {
            top_left: self.top_left + by,
            size: self.size,
        }
    }
}
