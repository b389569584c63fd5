//! Plain types shared by the sprite cache, the batch queue, the frame ring
//! and the device backends.

mod geometry;
mod key;
mod pixel;

use std::num::NonZeroU16;

pub use geometry::{
    GpuAtlasAttributes, GpuVertex, INDICES_PER_QUAD, QUAD_INDICES, QuadVertex, SpriteRect,
    TextureRect, UvRect, VERTICES_PER_QUAD,
};
pub use key::{AtlasLayerId, AtlasLayerTag, Id, PaletteSlotId, PaletteSlotTag};
pub use pixel::{
    Color, PaletteEntryFormat, PaletteFormat, PaletteSize, PixelFormat, clut_shuffle,
    content_hash, decode_palette, expand_to_rgba, unpack_indices,
};

/// Colors reserved per palette slot in the device palette buffer,
/// regardless of the palette's own size.
pub const PALETTE_SLOT_COLORS: u32 = 256;

slotmap::new_key_type! {
    pub struct DeviceTextureHandle;
    pub struct DeviceBufferHandle;
    pub struct FenceHandle;
}

macro_rules! resource_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(NonZeroU16);

        impl $name {
            pub const fn new(raw: u16) -> Option<Self> {
                match NonZeroU16::new(raw) {
                    Some(raw) => Some(Self(raw)),
                    None => None,
                }
            }

            pub fn from_index(index: usize) -> Option<Self> {
                u16::try_from(index + 1).ok().and_then(Self::new)
            }

            pub const fn get(self) -> u16 {
                self.0.get()
            }

            /// Zero-based table index.
            pub const fn index(self) -> usize {
                self.0.get() as usize - 1
            }
        }
    };
}

resource_id!(
    /// 1-based handle of a registered source texture.
    TextureId
);
resource_id!(
    /// 1-based handle of a registered source palette.
    PaletteId
);

/// `SetTexture` argument: texture id in the low 16 bits, palette id in the
/// high 16 bits (zero when the texture is drawn without a palette).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CombinedHandle(u32);

impl CombinedHandle {
    pub const NONE: CombinedHandle = CombinedHandle(0);

    pub fn new(texture: TextureId, palette: Option<PaletteId>) -> Self {
        let palette = palette.map_or(0, PaletteId::get) as u32;
        Self(texture.get() as u32 | palette << 16)
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn texture(self) -> Option<TextureId> {
        TextureId::new(self.0 as u16)
    }

    pub const fn palette(self) -> Option<PaletteId> {
        PaletteId::new((self.0 >> 16) as u16)
    }
}

impl From<u32> for CombinedHandle {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

/// Where the device reads a resolved (texture, palette) pair from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureBinding {
    /// Index texels in one atlas layer, colored through a palette slot.
    Atlas {
        layer: AtlasLayerId,
        palette: PaletteSlotId,
    },
    /// A dedicated RGBA texture.
    Standalone(DeviceTextureHandle),
}

impl TextureBinding {
    pub const fn atlas_layer(self) -> Option<AtlasLayerId> {
        match self {
            TextureBinding::Atlas { layer, .. } => Some(layer),
            TextureBinding::Standalone(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_not_a_valid_id() {
        assert!(TextureId::new(0).is_none());
        assert_eq!(TextureId::new(1).map(TextureId::index), Some(0));
        assert_eq!(PaletteId::from_index(4).map(PaletteId::get), Some(5));
        assert!(PaletteId::from_index(u16::MAX as usize).is_none());
    }

    #[test]
    fn combined_handle_packs_texture_low_and_palette_high() {
        let texture = TextureId::new(0x0123).unwrap();
        let palette = PaletteId::new(0x0045).unwrap();
        let handle = CombinedHandle::new(texture, Some(palette));
        assert_eq!(handle.raw(), 0x0045_0123);
        assert_eq!(handle.texture(), Some(texture));
        assert_eq!(handle.palette(), Some(palette));
    }

    #[test]
    fn combined_handle_without_palette_has_zero_high_half() {
        let texture = TextureId::new(9).unwrap();
        let handle = CombinedHandle::new(texture, None);
        assert_eq!(handle.raw(), 9);
        assert_eq!(handle.palette(), None);
        assert_eq!(CombinedHandle::from(0x0002_0000).texture(), None);
    }
}
