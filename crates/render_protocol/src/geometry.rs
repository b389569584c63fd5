use bytemuck::{Pod, Zeroable};

use crate::pixel::Color;

/// One corner of a game quad. Corner order is top-left, top-right,
/// bottom-left, bottom-right; `z` is the game's normalized depth.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct QuadVertex {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub u: f32,
    pub v: f32,
}

impl QuadVertex {
    pub const fn new(x: f32, y: f32, z: f32, u: f32, v: f32) -> Self {
        Self { x, y, z, u, v }
    }
}

/// Index pattern for one quad, relative to its first vertex.
pub const QUAD_INDICES: [u32; 6] = [0, 1, 2, 2, 1, 3];
pub const VERTICES_PER_QUAD: usize = 4;
pub const INDICES_PER_QUAD: usize = QUAD_INDICES.len();

/// Screen-space rectangle of an axis-aligned sprite.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SpriteRect {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
    pub z: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct UvRect {
    pub u0: f32,
    pub v0: f32,
    pub u1: f32,
    pub v1: f32,
}

impl SpriteRect {
    /// Expands the two given corners into a full quad.
    pub fn to_quad(self, uv: UvRect) -> [QuadVertex; 4] {
        [
            QuadVertex::new(self.x0, self.y0, self.z, uv.u0, uv.v0),
            QuadVertex::new(self.x1, self.y0, self.z, uv.u1, uv.v0),
            QuadVertex::new(self.x0, self.y1, self.z, uv.u0, uv.v1),
            QuadVertex::new(self.x1, self.y1, self.z, uv.u1, uv.v1),
        ]
    }
}

/// Pixel rectangle inside a texture, in texels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl TextureRect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub const fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub const fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub const fn right(self) -> u32 {
        self.x + self.width
    }

    pub const fn bottom(self) -> u32 {
        self.y + self.height
    }

    pub fn union(self, other: TextureRect) -> TextureRect {
        if self.is_empty() {
            return other;
        }
        if other.is_empty() {
            return self;
        }
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        TextureRect {
            x,
            y,
            width: self.right().max(other.right()) - x,
            height: self.bottom().max(other.bottom()) - y,
        }
    }

    pub fn fits_within(self, width: u32, height: u32) -> bool {
        self.x.checked_add(self.width).is_some_and(|r| r <= width)
            && self.y.checked_add(self.height).is_some_and(|b| b <= height)
    }

    pub const fn as_tuple(self) -> (u32, u32, u32, u32) {
        (self.x, self.y, self.width, self.height)
    }
}

/// Vertex layout written into the per-frame vertex buffer.
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
#[repr(C)]
pub struct GpuVertex {
    pub position: [f32; 2],
    pub uv: [f32; 2],
    pub color: Color,
}

/// Per-vertex attributes for atlas-resident quads, written into the
/// attribute buffer alongside [`GpuVertex`]. Standalone quads use `-1`
/// for the layer.
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
#[repr(C)]
pub struct GpuAtlasAttributes {
    pub layer: f32,
    pub palette: f32,
}

impl GpuAtlasAttributes {
    pub const STANDALONE: GpuAtlasAttributes = GpuAtlasAttributes {
        layer: -1.0,
        palette: 0.0,
    };
}

const _: () = assert!(std::mem::size_of::<GpuVertex>() == 20);
const _: () = assert!(std::mem::size_of::<GpuAtlasAttributes>() == 8);
