use bitvec::prelude::{BitVec, Lsb0};
use render_protocol::Id;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("pool exhausted: all {capacity} slots are live")]
    Exhausted { capacity: u32 },
    #[error("slot {slot} is already free")]
    DoubleFree { slot: u32 },
    #[error("slot {slot} is outside a pool of {capacity}")]
    OutOfRange { slot: u32, capacity: u32 },
}

/// Fixed-capacity free list of slot indices.
///
/// Never-issued indices are handed out lowest first; freed indices are
/// reused last-in first-out. A slot is either on the free list, never
/// issued, or held by exactly one owner.
#[derive(Debug)]
pub struct SlotPool<Tag> {
    capacity: u32,
    next_slot: u32,
    freelist: Vec<Id<Tag, u32>>,
    live: BitVec<usize, Lsb0>,
    live_count: u32,
}

impl<Tag> SlotPool<Tag> {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            next_slot: 0,
            freelist: Vec::with_capacity(capacity as usize),
            live: BitVec::repeat(false, capacity as usize),
            live_count: 0,
        }
    }

    pub fn alloc(&mut self) -> Result<Id<Tag, u32>, AllocError> {
        let slot = if let Some(slot) = self.freelist.pop() {
            slot
        } else if self.next_slot < self.capacity {
            let slot = Id::new(self.next_slot);
            self.next_slot += 1;
            slot
        } else {
            return Err(AllocError::Exhausted {
                capacity: self.capacity,
            });
        };

        debug_assert!(!self.live[slot.index()], "slot {} issued twice", slot.raw());
        self.live.set(slot.index(), true);
        self.live_count += 1;
        Ok(slot)
    }

    pub fn free(&mut self, slot: Id<Tag, u32>) -> Result<(), AllocError> {
        if slot.raw() >= self.capacity {
            return Err(AllocError::OutOfRange {
                slot: slot.raw(),
                capacity: self.capacity,
            });
        }
        let was_live = self.live[slot.index()];
        debug_assert!(was_live, "double free of slot {}", slot.raw());
        if !was_live {
            log::error!("double free of slot {} ignored", slot.raw());
            return Err(AllocError::DoubleFree { slot: slot.raw() });
        }
        self.live.set(slot.index(), false);
        self.live_count -= 1;
        self.freelist.push(slot);
        Ok(())
    }

    pub fn is_live(&self, slot: Id<Tag, u32>) -> bool {
        self.live.get(slot.index()).is_some_and(|bit| *bit)
    }

    pub fn clear(&mut self) {
        self.next_slot = 0;
        self.freelist.clear();
        self.live.fill(false);
        self.live_count = 0;
    }

    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    pub const fn live(&self) -> u32 {
        self.live_count
    }

    pub const fn available(&self) -> u32 {
        self.capacity - self.live_count
    }

    pub const fn is_exhausted(&self) -> bool {
        self.live_count == self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::{AllocError, SlotPool};
    use render_protocol::{AtlasLayerTag, Id};

    type Pool = SlotPool<AtlasLayerTag>;

    #[test]
    fn allocate_increases_slot_id() {
        let mut pool = Pool::new(3);
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        let c = pool.alloc().unwrap();
        assert_eq!(
            pool.alloc().unwrap_err(),
            AllocError::Exhausted { capacity: 3 }
        );
        assert_eq!(a.raw(), 0);
        assert_eq!(b.raw(), 1);
        assert_eq!(c.raw(), 2);
        assert_eq!(pool.live(), 3);
        assert!(pool.is_exhausted());
    }

    #[test]
    fn freed_slot_is_reused() {
        let mut pool = Pool::new(2);
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        pool.free(a).unwrap();
        let reused = pool.alloc().unwrap();
        assert_eq!(reused, a);
        assert_eq!(pool.live(), 2);
        assert_eq!(b.raw(), 1);
    }

    #[test]
    fn full_pool_reissues_exactly_the_freed_slot() {
        let mut pool = Pool::new(128);
        let slots: Vec<_> = (0..128).map(|_| pool.alloc().unwrap()).collect();
        assert!(pool.alloc().is_err());

        let freed = slots[57];
        pool.free(freed).unwrap();
        assert_eq!(pool.live(), 127);
        assert_eq!(pool.alloc().unwrap(), freed);
        assert_eq!(pool.live(), 128);
        assert!(pool.alloc().is_err());
    }

    #[test]
    fn free_rejects_out_of_range_slot() {
        let mut pool = Pool::new(4);
        assert_eq!(
            pool.free(Id::new(4)).unwrap_err(),
            AllocError::OutOfRange {
                slot: 4,
                capacity: 4
            }
        );
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn double_free_is_reported_in_release() {
        let mut pool = Pool::new(4);
        let a = pool.alloc().unwrap();
        pool.free(a).unwrap();
        assert_eq!(
            pool.free(a).unwrap_err(),
            AllocError::DoubleFree { slot: 0 }
        );
        assert_eq!(pool.available(), 4);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "double free")]
    fn double_free_asserts_in_debug() {
        let mut pool = Pool::new(4);
        let a = pool.alloc().unwrap();
        pool.free(a).unwrap();
        let _ = pool.free(a);
    }

    #[test]
    fn clear_returns_every_slot() {
        let mut pool = Pool::new(2);
        let a = pool.alloc().unwrap();
        pool.alloc().unwrap();
        pool.clear();
        assert_eq!(pool.available(), 2);
        assert!(!pool.is_live(a));
        assert_eq!(pool.alloc().unwrap().raw(), 0);
    }
}
