// THEORY:
// A `Blob` is the spatial summary of one connected region of foreground pixels
// in a single frame. It is a plain data container with no memory of previous
// frames: the detector keeps only the largest blob of each frame and reduces it
// to an area and a bounding box. The bounding box is what the still picture
// writer draws around the moving object.

/// A pixel coordinate, origin top-left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Point {
    pub x: u32,
    pub y: u32,
}

/// Inclusive rectangle spanned by a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BoundingBox {
    /// Top-left corner.
    pub min: Point,
    /// Bottom-right corner, inclusive.
    pub max: Point,
}

impl BoundingBox {
    pub fn width(&self) -> u32 {
        self.max.x - self.min.x + 1
    }

    pub fn height(&self) -> u32 {
        self.max.y - self.min.y + 1
    }

    pub fn contains(&self, p: Point) -> bool {
        p.x >= self.min.x && p.x <= self.max.x && p.y >= self.min.y && p.y <= self.max.y
    }
}

/// A single connected region of foreground pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    /// Number of pixels in the region.
    pub area: u32,
    pub bounding_box: BoundingBox,
}
