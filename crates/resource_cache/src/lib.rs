//! Cache of device textures for (texture, palette) pairs.
//!
//! Source bitmaps and palettes are registered by id and uploaded lazily the
//! first time a pair is drawn. Indexed bitmaps that fit a tile go into a
//! layer of the shared atlas and are colored through a palette slot; all
//! others are expanded to RGBA in a standalone texture. Unlocking a source
//! with different content retires its entries to a stale generation that
//! can be refilled in place, and destroyed device textures are held back
//! until the next frame begins.

mod cache;
mod deferred;
mod live_set;
mod resources;
#[cfg(test)]
mod tests;

use atlas::{AtlasLayout, DEFAULT_PALETTE_SLOTS};
use gpu_backend::BackendError;
use thiserror::Error;

pub use cache::{ResolvedTexture, ResourceCache};
pub use deferred::{DeferredDestroyQueue, Deferral};
pub use live_set::{CacheKey, LiveSet};
pub use resources::{MAX_TEXTURE_EDGE, PaletteDesc, TextureDesc};

pub const DEFAULT_MAX_TEXTURES: usize = 1024;
pub const DEFAULT_MAX_PALETTES: usize = 1088;
pub const DEFAULT_DESTROY_QUEUE: usize = 1024;
pub const DEFAULT_LIVE_SET_HINT: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    pub max_textures: usize,
    pub max_palettes: usize,
    pub atlas: AtlasLayout,
    pub palette_slots: u32,
    pub destroy_queue_capacity: usize,
    /// Initial LiveSet capacity. The set grows past it if needed.
    pub live_set_hint: usize,
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), CacheError> {
        let fields = [
            ("max_textures", self.max_textures),
            ("max_palettes", self.max_palettes),
            ("atlas.layers", self.atlas.layers as usize),
            ("atlas.tile_size", self.atlas.tile_size as usize),
            ("palette_slots", self.palette_slots as usize),
            ("destroy_queue_capacity", self.destroy_queue_capacity),
        ];
        if let Some((name, _)) = fields.iter().find(|(_, value)| *value == 0) {
            return Err(CacheError::InvalidDescriptor(format!("{name} must be non-zero")));
        }
        if self.max_textures > u16::MAX as usize || self.max_palettes > u16::MAX as usize {
            return Err(CacheError::InvalidDescriptor(
                "id tables are limited to 65535 entries".to_owned(),
            ));
        }
        Ok(())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_textures: DEFAULT_MAX_TEXTURES,
            max_palettes: DEFAULT_MAX_PALETTES,
            atlas: AtlasLayout::default(),
            palette_slots: DEFAULT_PALETTE_SLOTS,
            destroy_queue_capacity: DEFAULT_DESTROY_QUEUE,
            live_set_hint: DEFAULT_LIVE_SET_HINT,
        }
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("unknown {kind} id {id}")]
    InvalidHandle { kind: &'static str, id: u16 },
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("{what} table full ({capacity} entries)")]
    CapacityExceeded { what: &'static str, capacity: usize },
    #[error("{kind} has no content yet")]
    ResourceNotReady { kind: &'static str },
    #[error("indexed texture {texture} used without a palette")]
    MissingPalette { texture: u16 },
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Running counters since the cache was created, plus the uploads of the
/// current frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub uploads: u64,
    pub region_uploads: u64,
    pub palette_uploads: u64,
    pub stale_reuses: u64,
    pub atlas_placements: u64,
    pub standalone_placements: u64,
    pub deferred_destroys: u64,
    pub immediate_destroys: u64,
    pub frame_uploads: u32,
}
