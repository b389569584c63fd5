use std::collections::HashMap;

use render_protocol::{PaletteId, TextureId};
use smallvec::SmallVec;

/// Cache key. Direct-color textures always use `palette: None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub texture: TextureId,
    pub palette: Option<PaletteId>,
}

impl CacheKey {
    pub const fn new(texture: TextureId, palette: Option<PaletteId>) -> Self {
        Self { texture, palette }
    }
}

/// Set of cache keys indexed by both halves, so every entry that depends
/// on one texture or one palette can be found without scanning the cache.
#[derive(Debug, Default)]
pub struct LiveSet {
    by_texture: HashMap<TextureId, SmallVec<[Option<PaletteId>; 4]>>,
    by_palette: HashMap<PaletteId, SmallVec<[TextureId; 8]>>,
    len: usize,
}

impl LiveSet {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            by_texture: HashMap::with_capacity(capacity),
            by_palette: HashMap::with_capacity(capacity / 4),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, key: CacheKey) -> bool {
        self.by_texture
            .get(&key.texture)
            .is_some_and(|palettes| palettes.contains(&key.palette))
    }

    pub fn contains_texture(&self, texture: TextureId) -> bool {
        self.by_texture.contains_key(&texture)
    }

    pub fn contains_palette(&self, palette: PaletteId) -> bool {
        self.by_palette.contains_key(&palette)
    }

    /// Returns `false` if the key was already present.
    pub fn insert(&mut self, key: CacheKey) -> bool {
        let palettes = self.by_texture.entry(key.texture).or_default();
        if palettes.contains(&key.palette) {
            return false;
        }
        palettes.push(key.palette);
        if let Some(palette) = key.palette {
            self.by_palette.entry(palette).or_default().push(key.texture);
        }
        self.len += 1;
        true
    }

    pub fn remove(&mut self, key: CacheKey) -> bool {
        let Some(palettes) = self.by_texture.get_mut(&key.texture) else {
            return false;
        };
        let Some(position) = palettes.iter().position(|p| *p == key.palette) else {
            return false;
        };
        palettes.swap_remove(position);
        if palettes.is_empty() {
            self.by_texture.remove(&key.texture);
        }
        if let Some(palette) = key.palette {
            self.unlink_palette(palette, key.texture);
        }
        self.len -= 1;
        true
    }

    /// Removes and returns every key that references `texture`.
    pub fn take_texture(&mut self, texture: TextureId) -> SmallVec<[CacheKey; 4]> {
        let Some(palettes) = self.by_texture.remove(&texture) else {
            return SmallVec::new();
        };
        self.len -= palettes.len();
        palettes
            .into_iter()
            .map(|palette| {
                if let Some(palette) = palette {
                    self.unlink_palette(palette, texture);
                }
                CacheKey::new(texture, palette)
            })
            .collect()
    }

    /// Removes and returns every key that references `palette`.
    pub fn take_palette(&mut self, palette: PaletteId) -> SmallVec<[CacheKey; 8]> {
        let Some(textures) = self.by_palette.remove(&palette) else {
            return SmallVec::new();
        };
        let keys: SmallVec<[CacheKey; 8]> = textures
            .into_iter()
            .map(|texture| CacheKey::new(texture, Some(palette)))
            .collect();
        for key in &keys {
            if let Some(palettes) = self.by_texture.get_mut(&key.texture) {
                palettes.retain(|p| *p != key.palette);
                if palettes.is_empty() {
                    self.by_texture.remove(&key.texture);
                }
            }
        }
        self.len -= keys.len();
        keys
    }

    /// Keys that reference `palette`, without removing them.
    pub fn keys_with_palette(&self, palette: PaletteId) -> impl Iterator<Item = CacheKey> + '_ {
        self.by_palette
            .get(&palette)
            .into_iter()
            .flatten()
            .map(move |texture| CacheKey::new(*texture, Some(palette)))
    }

    pub fn keys_with_texture(&self, texture: TextureId) -> impl Iterator<Item = CacheKey> + '_ {
        self.by_texture
            .get(&texture)
            .into_iter()
            .flatten()
            .map(move |palette| CacheKey::new(texture, *palette))
    }

    pub fn iter(&self) -> impl Iterator<Item = CacheKey> + '_ {
        self.by_texture.iter().flat_map(|(texture, palettes)| {
            palettes
                .iter()
                .map(move |palette| CacheKey::new(*texture, *palette))
        })
    }

    pub fn clear(&mut self) {
        self.by_texture.clear();
        self.by_palette.clear();
        self.len = 0;
    }

    fn unlink_palette(&mut self, palette: PaletteId, texture: TextureId) {
        if let Some(textures) = self.by_palette.get_mut(&palette) {
            if let Some(position) = textures.iter().position(|t| *t == texture) {
                textures.swap_remove(position);
            }
            if textures.is_empty() {
                self.by_palette.remove(&palette);
            }
        }
    }
}
