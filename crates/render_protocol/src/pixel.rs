//! Source pixel and palette formats, and their conversion to RGBA8.

use bytemuck::{Pod, Zeroable};

const FNV_OFFSET_BASIS: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;

/// FNV-1a over raw bytes. Used to detect unchanged content on unlock.
pub fn content_hash(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, &byte| {
        (hash ^ byte as u32).wrapping_mul(FNV_PRIME)
    })
}

const EXPAND_5_TO_8: [u8; 32] = {
    let mut table = [0u8; 32];
    let mut i = 0;
    while i < 32 {
        table[i] = ((i as u32 * 255 + 15) / 31) as u8;
        i += 1;
    }
    table
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Pod, Zeroable)]
#[repr(C)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const WHITE: Color = Color::rgba(255, 255, 255, 255);
    pub const TRANSPARENT: Color = Color::rgba(0, 0, 0, 0);

    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    /// Game code passes colors as `0xAARRGGBB`.
    pub const fn from_argb(argb: u32) -> Self {
        Self {
            r: (argb >> 16) as u8,
            g: (argb >> 8) as u8,
            b: argb as u8,
            a: (argb >> 24) as u8,
        }
    }

    /// RGBA5551 with red in the low bits and alpha in bit 15.
    pub const fn from_rgba5551(pixel: u16) -> Self {
        Self {
            r: EXPAND_5_TO_8[(pixel & 0x1F) as usize],
            g: EXPAND_5_TO_8[((pixel >> 5) & 0x1F) as usize],
            b: EXPAND_5_TO_8[((pixel >> 10) & 0x1F) as usize],
            a: if pixel & 0x8000 != 0 { 255 } else { 0 },
        }
    }

    pub const fn to_array(self) -> [u8; 4] {
        [self.r, self.g, self.b, self.a]
    }

    /// Component-wise multiply, as the fixed-function modulate stage does.
    pub fn modulate(self, other: Color) -> Color {
        fn mul(a: u8, b: u8) -> u8 {
            ((a as u16 * b as u16 + 127) / 255) as u8
        }
        Color {
            r: mul(self.r, other.r),
            g: mul(self.g, other.g),
            b: mul(self.b, other.b),
            a: mul(self.a, other.a),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Two pixels per byte, low nibble first.
    Indexed4,
    Indexed8,
    /// RGBA5551, little endian.
    Direct16,
}

impl PixelFormat {
    pub const fn is_indexed(self) -> bool {
        matches!(self, PixelFormat::Indexed4 | PixelFormat::Indexed8)
    }

    pub const fn row_bytes(self, width: u32) -> usize {
        match self {
            PixelFormat::Indexed4 => width.div_ceil(2) as usize,
            PixelFormat::Indexed8 => width as usize,
            PixelFormat::Direct16 => width as usize * 2,
        }
    }

    pub const fn byte_len(self, width: u32, height: u32) -> usize {
        self.row_bytes(width) * height as usize
    }

    pub const fn palette_size(self) -> Option<PaletteSize> {
        match self {
            PixelFormat::Indexed4 => Some(PaletteSize::Colors16),
            PixelFormat::Indexed8 => Some(PaletteSize::Colors256),
            PixelFormat::Direct16 => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaletteSize {
    Colors16,
    Colors256,
}

impl PaletteSize {
    pub const fn count(self) -> usize {
        match self {
            PaletteSize::Colors16 => 16,
            PaletteSize::Colors256 => 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaletteEntryFormat {
    Rgba16,
    /// Little-endian `0xAARRGGBB` words.
    Rgba32,
}

impl PaletteEntryFormat {
    pub const fn bytes_per_entry(self) -> usize {
        match self {
            PaletteEntryFormat::Rgba16 => 2,
            PaletteEntryFormat::Rgba32 => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PaletteFormat {
    pub size: PaletteSize,
    pub entry: PaletteEntryFormat,
}

impl PaletteFormat {
    pub const fn byte_len(self) -> usize {
        self.size.count() * self.entry.bytes_per_entry()
    }
}

/// Swaps bits 3 and 4 of a 256-color index; the hardware stores those
/// CLUTs in 8-entry blocks that are interleaved in pairs.
pub const fn clut_shuffle(index: usize) -> usize {
    (index & !0x18) | ((index & 0x08) << 1) | ((index & 0x10) >> 1)
}

/// Decodes source palette bytes into linear RGBA8 colors.
///
/// Entry 0 is always transparent. 256-color palettes are de-swizzled with
/// [`clut_shuffle`]. Returns `None` when `bytes` is shorter than the format.
pub fn decode_palette(format: PaletteFormat, bytes: &[u8]) -> Option<Vec<Color>> {
    if bytes.len() < format.byte_len() {
        return None;
    }
    let count = format.size.count();
    let shuffle = matches!(format.size, PaletteSize::Colors256);
    let mut colors = Vec::with_capacity(count);
    for i in 0..count {
        let src = if shuffle { clut_shuffle(i) } else { i };
        let color = match format.entry {
            PaletteEntryFormat::Rgba16 => {
                let offset = src * 2;
                Color::from_rgba5551(u16::from_le_bytes([bytes[offset], bytes[offset + 1]]))
            }
            PaletteEntryFormat::Rgba32 => {
                let offset = src * 4;
                Color::from_argb(u32::from_le_bytes([
                    bytes[offset],
                    bytes[offset + 1],
                    bytes[offset + 2],
                    bytes[offset + 3],
                ]))
            }
        };
        colors.push(color);
    }
    if let Some(first) = colors.first_mut() {
        first.a = 0;
    }
    Some(colors)
}

/// Reads one palette index per pixel from an indexed image region.
///
/// `region` is `(x, y, width, height)` inside an image of `image_width`.
pub fn unpack_indices(
    format: PixelFormat,
    source: &[u8],
    image_width: u32,
    region: (u32, u32, u32, u32),
    out: &mut Vec<u8>,
) {
    let (x0, y0, width, height) = region;
    let stride = format.row_bytes(image_width);
    out.clear();
    out.reserve(width as usize * height as usize);
    for y in y0..y0 + height {
        let row = &source[y as usize * stride..];
        for x in x0..x0 + width {
            let index = match format {
                PixelFormat::Indexed4 => {
                    let byte = row[x as usize / 2];
                    if x % 2 == 0 { byte & 0x0F } else { byte >> 4 }
                }
                PixelFormat::Indexed8 => row[x as usize],
                PixelFormat::Direct16 => 0,
            };
            out.push(index);
        }
    }
}

/// Expands an image region to RGBA8, resolving indices through `palette`.
///
/// Direct16 images ignore `palette`. Indices past the end of the palette
/// map to transparent black.
pub fn expand_to_rgba(
    format: PixelFormat,
    source: &[u8],
    image_width: u32,
    region: (u32, u32, u32, u32),
    palette: &[Color],
    out: &mut Vec<u8>,
) {
    let (x0, y0, width, height) = region;
    out.clear();
    out.reserve(width as usize * height as usize * 4);
    match format {
        PixelFormat::Direct16 => {
            let stride = format.row_bytes(image_width);
            for y in y0..y0 + height {
                let row = &source[y as usize * stride..];
                for x in x0..x0 + width {
                    let offset = x as usize * 2;
                    let pixel = u16::from_le_bytes([row[offset], row[offset + 1]]);
                    out.extend_from_slice(&Color::from_rgba5551(pixel).to_array());
                }
            }
        }
        PixelFormat::Indexed4 | PixelFormat::Indexed8 => {
            let mut indices = Vec::new();
            unpack_indices(format, source, image_width, region, &mut indices);
            for index in indices {
                let color = palette
                    .get(index as usize)
                    .copied()
                    .unwrap_or(Color::TRANSPARENT);
                out.extend_from_slice(&color.to_array());
            }
        }
    }
}
