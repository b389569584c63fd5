//! Bounded allocators for the two shared device pools: layers of the
//! paletted atlas texture array, and slots of the palette color buffer.

mod pool;

use render_protocol::{
    AtlasLayerId, AtlasLayerTag, PALETTE_SLOT_COLORS, PaletteSlotId, PaletteSlotTag,
};

pub use pool::{AllocError, SlotPool};

pub const DEFAULT_ATLAS_LAYERS: u32 = 128;
pub const DEFAULT_TILE_SIZE: u32 = 512;
pub const DEFAULT_PALETTE_SLOTS: u32 = 1088;

/// Shape of the atlas texture array: `layers` square layers of
/// `tile_size` texels, one source bitmap per layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtlasLayout {
    pub layers: u32,
    pub tile_size: u32,
}

impl AtlasLayout {
    pub const fn fits(self, width: u32, height: u32) -> bool {
        width <= self.tile_size && height <= self.tile_size
    }

    /// UV multiplier that maps a bitmap's `0..1` range onto its corner of
    /// a layer.
    pub fn uv_scale(self, width: u32, height: u32) -> [f32; 2] {
        [
            width as f32 / self.tile_size as f32,
            height as f32 / self.tile_size as f32,
        ]
    }
}

impl Default for AtlasLayout {
    fn default() -> Self {
        Self {
            layers: DEFAULT_ATLAS_LAYERS,
            tile_size: DEFAULT_TILE_SIZE,
        }
    }
}

#[derive(Debug)]
pub struct AtlasLayerAllocator {
    layout: AtlasLayout,
    pool: SlotPool<AtlasLayerTag>,
}

impl AtlasLayerAllocator {
    pub fn new(layout: AtlasLayout) -> Self {
        Self {
            layout,
            pool: SlotPool::new(layout.layers),
        }
    }

    pub fn alloc(&mut self) -> Result<AtlasLayerId, AllocError> {
        let layer = self.pool.alloc()?;
        log::debug!("atlas layer {} allocated ({} live)", layer.raw(), self.pool.live());
        Ok(layer)
    }

    pub fn free(&mut self, layer: AtlasLayerId) -> Result<(), AllocError> {
        self.pool.free(layer)?;
        log::debug!("atlas layer {} released", layer.raw());
        Ok(())
    }

    pub fn is_live(&self, layer: AtlasLayerId) -> bool {
        self.pool.is_live(layer)
    }

    pub const fn layout(&self) -> AtlasLayout {
        self.layout
    }

    pub const fn live(&self) -> u32 {
        self.pool.live()
    }

    pub const fn available(&self) -> u32 {
        self.pool.available()
    }
}

#[derive(Debug)]
pub struct PaletteSlotAllocator {
    pool: SlotPool<PaletteSlotTag>,
}

impl PaletteSlotAllocator {
    pub fn new(slots: u32) -> Self {
        Self {
            pool: SlotPool::new(slots),
        }
    }

    pub fn alloc(&mut self) -> Result<PaletteSlotId, AllocError> {
        self.pool.alloc()
    }

    pub fn free(&mut self, slot: PaletteSlotId) -> Result<(), AllocError> {
        self.pool.free(slot)
    }

    pub fn is_live(&self, slot: PaletteSlotId) -> bool {
        self.pool.is_live(slot)
    }

    pub const fn capacity(&self) -> u32 {
        self.pool.capacity()
    }

    pub const fn live(&self) -> u32 {
        self.pool.live()
    }

    pub const fn available(&self) -> u32 {
        self.pool.available()
    }

    /// Byte offset of `slot` inside an RGBA8 palette buffer.
    pub const fn byte_offset(slot: PaletteSlotId) -> u64 {
        slot.raw() as u64 * PALETTE_SLOT_COLORS as u64 * 4
    }
}

impl Default for PaletteSlotAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_PALETTE_SLOTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_allocator_never_exceeds_layout() {
        let mut layers = AtlasLayerAllocator::new(AtlasLayout {
            layers: 4,
            tile_size: 64,
        });
        let held: Vec<_> = (0..4).map(|_| layers.alloc().unwrap()).collect();
        assert!(matches!(
            layers.alloc(),
            Err(AllocError::Exhausted { capacity: 4 })
        ));
        assert_eq!(layers.live(), 4);

        layers.free(held[2]).unwrap();
        assert_eq!(layers.alloc().unwrap(), held[2]);
        assert_eq!(layers.available(), 0);
    }

    #[test]
    fn layout_fit_and_uv_scale() {
        let layout = AtlasLayout::default();
        assert!(layout.fits(512, 100));
        assert!(!layout.fits(513, 1));
        assert_eq!(layout.uv_scale(256, 128), [0.5, 0.25]);
    }

    #[test]
    fn palette_slots_map_to_disjoint_byte_ranges() {
        let mut slots = PaletteSlotAllocator::default();
        assert_eq!(slots.capacity(), DEFAULT_PALETTE_SLOTS);
        let a = slots.alloc().unwrap();
        let b = slots.alloc().unwrap();
        assert_eq!(PaletteSlotAllocator::byte_offset(a), 0);
        assert_eq!(PaletteSlotAllocator::byte_offset(b), 1024);
        slots.free(a).unwrap();
        assert!(!slots.is_live(a));
        assert!(slots.is_live(b));
    }
}
