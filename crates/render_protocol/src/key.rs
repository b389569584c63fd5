use std::marker::PhantomData;

/// Typed index into one of the fixed-size device pools.
#[derive(Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Id<Tag, Repr> {
    raw: Repr,
    _marker: PhantomData<Tag>,
}

impl<Tag, Repr: Copy> Copy for Id<Tag, Repr> {}

impl<Tag, Repr: Copy> Clone for Id<Tag, Repr> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Tag, Repr> Id<Tag, Repr> {
    pub const fn new(raw: Repr) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    pub const fn raw(self) -> Repr
    where
        Repr: Copy,
    {
        self.raw
    }
}

impl<Tag> Id<Tag, u32> {
    pub const fn index(self) -> usize {
        self.raw as usize
    }
}

#[derive(Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AtlasLayerTag {}
pub type AtlasLayerId = Id<AtlasLayerTag, u32>;

#[derive(Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PaletteSlotTag {}
pub type PaletteSlotId = Id<PaletteSlotTag, u32>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_with_same_raw_compare_equal() {
        let a = AtlasLayerId::new(7);
        let b = AtlasLayerId::new(7);
        assert_eq!(a, b);
        assert_eq!(a.index(), 7);
    }

    #[test]
    fn ids_order_by_raw_value() {
        assert!(PaletteSlotId::new(2) < PaletteSlotId::new(10));
    }
}
