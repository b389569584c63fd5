use gpu_backend::Backend;
use render_protocol::DeviceTextureHandle;

/// Device textures evicted during a frame. They may still be referenced by
/// commands already recorded for that frame, so they are only destroyed
/// once the next frame begins.
#[derive(Debug)]
pub struct DeferredDestroyQueue {
    pending: Vec<DeviceTextureHandle>,
    capacity: usize,
}

/// What [`DeferredDestroyQueue::push`] did with the texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deferral {
    Queued,
    /// The queue was full and the texture was destroyed on the spot.
    DestroyedNow,
}

impl DeferredDestroyQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pending: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push<B: Backend + ?Sized>(
        &mut self,
        backend: &mut B,
        texture: DeviceTextureHandle,
    ) -> Deferral {
        if self.pending.len() >= self.capacity {
            log::warn!(
                "deferred destroy queue full ({}), destroying texture immediately",
                self.capacity
            );
            backend.destroy_texture(texture);
            return Deferral::DestroyedNow;
        }
        self.pending.push(texture);
        Deferral::Queued
    }

    /// Destroys everything queued so far. Returns how many were destroyed.
    pub fn flush<B: Backend + ?Sized>(&mut self, backend: &mut B) -> usize {
        let count = self.pending.len();
        for texture in self.pending.drain(..) {
            backend.destroy_texture(texture);
        }
        if count > 0 {
            log::trace!("destroyed {count} deferred textures");
        }
        count
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, texture: DeviceTextureHandle) -> bool {
        self.pending.contains(&texture)
    }
}
