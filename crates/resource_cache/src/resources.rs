//! Source-side texture and palette records, keyed by 1-based id.

use render_protocol::{
    Color, PaletteFormat, PixelFormat, TextureRect, content_hash, decode_palette, unpack_indices,
};

use crate::CacheError;

/// Largest accepted source bitmap edge.
pub const MAX_TEXTURE_EDGE: u32 = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureDesc {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    /// Packed source texels. `None` registers the texture before its pixel
    /// data exists; it cannot be drawn until unlocked with data.
    pub pixels: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaletteDesc {
    pub format: PaletteFormat,
    pub colors: Option<Vec<u8>>,
}

#[derive(Debug)]
pub(crate) struct TextureSource {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub pixels: Option<Vec<u8>>,
    pub hash: Option<u32>,
}

impl TextureSource {
    pub fn new(desc: TextureDesc) -> Result<Self, CacheError> {
        let TextureDesc {
            format,
            width,
            height,
            pixels,
        } = desc;
        if width == 0 || height == 0 || width > MAX_TEXTURE_EDGE || height > MAX_TEXTURE_EDGE {
            return Err(CacheError::InvalidDescriptor(format!(
                "texture size {width}x{height} outside 1..={MAX_TEXTURE_EDGE}"
            )));
        }
        let mut source = Self {
            format,
            width,
            height,
            pixels: None,
            hash: None,
        };
        if let Some(pixels) = pixels {
            source.check_len(&pixels)?;
            source.hash = Some(content_hash(&pixels));
            source.pixels = Some(pixels);
        }
        Ok(source)
    }

    pub fn byte_len(&self) -> usize {
        self.format.byte_len(self.width, self.height)
    }

    pub fn check_len(&self, pixels: &[u8]) -> Result<(), CacheError> {
        if pixels.len() < self.byte_len() {
            return Err(CacheError::InvalidDescriptor(format!(
                "{:?} {}x{} needs {} bytes, got {}",
                self.format,
                self.width,
                self.height,
                self.byte_len(),
                pixels.len()
            )));
        }
        Ok(())
    }

    /// Replaces the pixel data if given, then rehashes. Returns whether the
    /// content differs from what was last hashed.
    pub fn relock(&mut self, pixels: Option<Vec<u8>>) -> Result<bool, CacheError> {
        if let Some(pixels) = pixels {
            self.check_len(&pixels)?;
            self.pixels = Some(pixels);
        }
        let Some(pixels) = self.pixels.as_deref() else {
            return Ok(false);
        };
        let hash = content_hash(pixels);
        let changed = self.hash != Some(hash);
        self.hash = Some(hash);
        Ok(changed)
    }

    /// Writes `bytes`, packed rows of `rect` in the source format, into the
    /// pixel data.
    pub fn write_region(&mut self, rect: TextureRect, bytes: &[u8]) -> Result<(), CacheError> {
        if rect.is_empty() || !rect.fits_within(self.width, self.height) {
            return Err(CacheError::InvalidDescriptor(format!(
                "region {rect:?} outside texture {}x{}",
                self.width, self.height
            )));
        }
        let row_len = self.format.row_bytes(rect.width);
        let needed = row_len * rect.height as usize;
        if bytes.len() < needed {
            return Err(CacheError::InvalidDescriptor(format!(
                "region update needs {needed} bytes, got {}",
                bytes.len()
            )));
        }
        let format = self.format;
        let stride = format.row_bytes(self.width);
        let pixels = self.pixels.as_mut().ok_or(CacheError::ResourceNotReady {
            kind: "texture",
        })?;

        match format {
            PixelFormat::Indexed4 => {
                let mut indices = Vec::new();
                unpack_indices(
                    format,
                    bytes,
                    rect.width,
                    (0, 0, rect.width, rect.height),
                    &mut indices,
                );
                for (i, index) in indices.into_iter().enumerate() {
                    let x = rect.x + i as u32 % rect.width;
                    let y = rect.y + i as u32 / rect.width;
                    let byte = &mut pixels[y as usize * stride + x as usize / 2];
                    *byte = if x % 2 == 0 {
                        (*byte & 0xF0) | (index & 0x0F)
                    } else {
                        (*byte & 0x0F) | (index << 4)
                    };
                }
            }
            PixelFormat::Indexed8 | PixelFormat::Direct16 => {
                let offset = format.row_bytes(rect.x);
                for (row, chunk) in bytes.chunks_exact(row_len).take(rect.height as usize).enumerate()
                {
                    let start = (rect.y as usize + row) * stride + offset;
                    pixels[start..start + row_len].copy_from_slice(chunk);
                }
            }
        }
        self.hash = Some(content_hash(pixels));
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct PaletteSource {
    pub format: PaletteFormat,
    pub colors: Option<Vec<Color>>,
    pub hash: Option<u32>,
}

impl PaletteSource {
    pub fn new(desc: PaletteDesc) -> Result<Self, CacheError> {
        let mut source = Self {
            format: desc.format,
            colors: None,
            hash: None,
        };
        if let Some(raw) = desc.colors {
            source.colors = Some(source.decode(&raw)?);
            source.hash = Some(content_hash(&raw));
        }
        Ok(source)
    }

    fn decode(&self, raw: &[u8]) -> Result<Vec<Color>, CacheError> {
        decode_palette(self.format, raw).ok_or_else(|| {
            CacheError::InvalidDescriptor(format!(
                "palette {:?} needs {} bytes, got {}",
                self.format,
                self.format.byte_len(),
                raw.len()
            ))
        })
    }

    /// Takes new raw colors and returns whether they differ from the
    /// current ones. Without new colors nothing can have changed, since the
    /// decoded form is all that is kept.
    pub fn relock(&mut self, raw: Option<Vec<u8>>) -> Result<bool, CacheError> {
        let Some(raw) = raw else {
            return Ok(false);
        };
        let hash = content_hash(&raw);
        if self.hash == Some(hash) {
            return Ok(false);
        }
        self.colors = Some(self.decode(&raw)?);
        self.hash = Some(hash);
        Ok(true)
    }
}

/// Fixed-capacity id table. Ids are `index + 1`.
#[derive(Debug)]
pub(crate) struct SourceTable<T> {
    entries: Vec<Option<T>>,
    live: usize,
}

impl<T> SourceTable<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        let mut entries = Vec::with_capacity(capacity);
        entries.resize_with(capacity, || None);
        Self { entries, live: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn live(&self) -> usize {
        self.live
    }

    /// Stores `value` in the lowest free index.
    pub fn insert(&mut self, value: T) -> Option<usize> {
        let index = self.entries.iter().position(Option::is_none)?;
        self.entries[index] = Some(value);
        self.live += 1;
        Some(index)
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.entries.get(index).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.entries.get_mut(index).and_then(Option::as_mut)
    }

    pub fn remove(&mut self, index: usize) -> Option<T> {
        let removed = self.entries.get_mut(index).and_then(Option::take);
        if removed.is_some() {
            self.live -= 1;
        }
        removed
    }
}
