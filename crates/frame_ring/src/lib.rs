//! Rotating sets of per-frame vertex, attribute and index buffers.
//!
//! Each set is reused only after the fence of the frame that last drew
//! from it has signaled. With one set every frame waits for the previous
//! one; with three the CPU may run two frames ahead of the device.

use std::mem::size_of;
use std::time::Duration;

use gpu_backend::{Backend, BackendError, BufferUsage, FenceStatus};
use render_protocol::{
    DeviceBufferHandle, FenceHandle, GpuAtlasAttributes, GpuVertex, INDICES_PER_QUAD,
    QUAD_INDICES, VERTICES_PER_QUAD,
};
use thiserror::Error;

pub const DEFAULT_BUFFER_COUNT: usize = 3;
pub const DEFAULT_MAX_QUADS: u32 = 8192;
pub const DEFAULT_FENCE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRingConfig {
    pub buffer_count: usize,
    /// Quads each buffer set can hold.
    pub max_quads: u32,
    pub fence_timeout: Duration,
}

impl Default for FrameRingConfig {
    fn default() -> Self {
        Self {
            buffer_count: DEFAULT_BUFFER_COUNT,
            max_quads: DEFAULT_MAX_QUADS,
            fence_timeout: DEFAULT_FENCE_TIMEOUT,
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameRingError {
    #[error("invalid frame ring config: {0}")]
    InvalidConfig(String),
    #[error("frame of {quads} quads exceeds buffer capacity of {max_quads}")]
    QuadOverflow { quads: usize, max_quads: u32 },
    #[error("retire called without an acquired slot")]
    NotAcquired,
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// How [`FrameRing::acquire`] obtained its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The slot had never been used.
    Free,
    /// The slot's previous fence signaled, possibly after a wait.
    Fenced,
    /// The wait gave up; the device may still be reading the slot.
    TimedOut,
}

/// Buffers of the slot acquired for the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSlot {
    pub index: usize,
    pub vertices: DeviceBufferHandle,
    pub attributes: DeviceBufferHandle,
    pub indices: DeviceBufferHandle,
    pub outcome: AcquireOutcome,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingStats {
    pub acquires: u64,
    pub fenced_acquires: u64,
    pub timeouts: u64,
}

#[derive(Debug)]
struct BufferSet {
    vertices: DeviceBufferHandle,
    attributes: DeviceBufferHandle,
    indices: DeviceBufferHandle,
    fence: Option<FenceHandle>,
}

impl BufferSet {
    fn destroy<B: Backend + ?Sized>(self, backend: &mut B) {
        backend.destroy_buffer(self.vertices);
        backend.destroy_buffer(self.attributes);
        backend.destroy_buffer(self.indices);
    }
}

#[derive(Debug)]
pub struct FrameRing {
    config: FrameRingConfig,
    sets: Vec<BufferSet>,
    current: usize,
    acquired: bool,
    stats: RingStats,
}

impl FrameRing {
    /// Creates `buffer_count` buffer sets and fills every index buffer with
    /// the fixed quad pattern.
    pub fn new<B: Backend + ?Sized>(
        backend: &mut B,
        config: FrameRingConfig,
    ) -> Result<Self, FrameRingError> {
        if config.buffer_count == 0 {
            return Err(FrameRingError::InvalidConfig(
                "buffer_count must be at least 1".to_owned(),
            ));
        }
        if config.max_quads == 0 {
            return Err(FrameRingError::InvalidConfig(
                "max_quads must be at least 1".to_owned(),
            ));
        }

        let indices = quad_indices(config.max_quads);
        let mut sets = Vec::with_capacity(config.buffer_count);
        for _ in 0..config.buffer_count {
            match create_set(backend, config.max_quads, &indices) {
                Ok(set) => sets.push(set),
                Err(err) => {
                    for set in sets {
                        set.destroy(backend);
                    }
                    return Err(err);
                }
            }
        }
        log::debug!(
            "frame ring: {} buffer sets of {} quads",
            config.buffer_count,
            config.max_quads
        );

        Ok(Self {
            current: config.buffer_count - 1,
            config,
            sets,
            acquired: false,
            stats: RingStats::default(),
        })
    }

    /// Advances to the next slot, waiting for the device to release it.
    /// A wait that exceeds the configured timeout is logged and the slot is
    /// handed out anyway. A slot acquired but never retired, because its
    /// frame failed, is handed out again without advancing.
    pub fn acquire<B: Backend + ?Sized>(&mut self, backend: &mut B) -> FrameSlot {
        self.stats.acquires += 1;
        if self.acquired {
            log::debug!(
                "frame buffer {} was never retired, reusing it",
                self.current
            );
            let set = &self.sets[self.current];
            return FrameSlot {
                index: self.current,
                vertices: set.vertices,
                attributes: set.attributes,
                indices: set.indices,
                outcome: AcquireOutcome::Free,
            };
        }
        self.current = (self.current + 1) % self.sets.len();
        self.acquired = true;

        let set = &mut self.sets[self.current];
        let outcome = match set.fence.take() {
            None => AcquireOutcome::Free,
            Some(fence) => {
                let status = backend.wait_fence(fence, self.config.fence_timeout);
                backend.release_fence(fence);
                match status {
                    FenceStatus::Signaled => {
                        self.stats.fenced_acquires += 1;
                        AcquireOutcome::Fenced
                    }
                    FenceStatus::TimedOut => {
                        self.stats.timeouts += 1;
                        log::warn!(
                            "frame buffer {} still in use after {:?}, reusing it anyway",
                            self.current,
                            self.config.fence_timeout
                        );
                        AcquireOutcome::TimedOut
                    }
                }
            }
        };

        FrameSlot {
            index: self.current,
            vertices: set.vertices,
            attributes: set.attributes,
            indices: set.indices,
            outcome,
        }
    }

    /// Copies one frame's vertices and per-vertex atlas attributes into the
    /// slot's buffers.
    pub fn write_frame<B: Backend + ?Sized>(
        &self,
        backend: &mut B,
        slot: &FrameSlot,
        vertices: &[GpuVertex],
        attributes: &[GpuAtlasAttributes],
    ) -> Result<(), FrameRingError> {
        let capacity = self.config.max_quads as usize * VERTICES_PER_QUAD;
        if vertices.len() > capacity || attributes.len() > capacity {
            return Err(FrameRingError::QuadOverflow {
                quads: vertices.len().max(attributes.len()) / VERTICES_PER_QUAD,
                max_quads: self.config.max_quads,
            });
        }
        write_mapped(backend, slot.vertices, bytemuck::cast_slice(vertices))?;
        write_mapped(backend, slot.attributes, bytemuck::cast_slice(attributes))?;
        Ok(())
    }

    /// Records the fence guarding the slot handed out by the last acquire.
    pub fn retire(&mut self, fence: FenceHandle) -> Result<(), FrameRingError> {
        if !self.acquired {
            return Err(FrameRingError::NotAcquired);
        }
        self.acquired = false;
        let set = &mut self.sets[self.current];
        debug_assert!(set.fence.is_none(), "slot {} retired twice", self.current);
        set.fence = Some(fence);
        Ok(())
    }

    /// Waits for every outstanding fence.
    pub fn wait_idle<B: Backend + ?Sized>(&mut self, backend: &mut B) {
        for (index, set) in self.sets.iter_mut().enumerate() {
            if let Some(fence) = set.fence.take() {
                if backend.wait_fence(fence, self.config.fence_timeout) == FenceStatus::TimedOut {
                    self.stats.timeouts += 1;
                    log::warn!("frame buffer {index} did not drain before shutdown");
                }
                backend.release_fence(fence);
            }
        }
    }

    pub fn destroy<B: Backend + ?Sized>(mut self, backend: &mut B) {
        self.wait_idle(backend);
        for set in self.sets {
            set.destroy(backend);
        }
    }

    pub fn config(&self) -> FrameRingConfig {
        self.config
    }

    pub fn buffer_count(&self) -> usize {
        self.sets.len()
    }

    pub fn max_quads(&self) -> u32 {
        self.config.max_quads
    }

    pub fn stats(&self) -> RingStats {
        self.stats
    }

    pub fn in_flight(&self) -> usize {
        self.sets.iter().filter(|set| set.fence.is_some()).count()
    }
}

fn quad_indices(max_quads: u32) -> Vec<u32> {
    (0..max_quads)
        .flat_map(|quad| {
            let base = quad * VERTICES_PER_QUAD as u32;
            QUAD_INDICES.map(|offset| base + offset)
        })
        .collect()
}

fn create_set<B: Backend + ?Sized>(
    backend: &mut B,
    max_quads: u32,
    indices: &[u32],
) -> Result<BufferSet, FrameRingError> {
    let vertex_count = max_quads as u64 * VERTICES_PER_QUAD as u64;
    let vertices = backend.create_buffer(
        vertex_count * size_of::<GpuVertex>() as u64,
        BufferUsage::Vertex,
    )?;
    let attributes = match backend.create_buffer(
        vertex_count * size_of::<GpuAtlasAttributes>() as u64,
        BufferUsage::Attributes,
    ) {
        Ok(buffer) => buffer,
        Err(err) => {
            backend.destroy_buffer(vertices);
            return Err(err.into());
        }
    };
    let index_bytes = max_quads as u64 * INDICES_PER_QUAD as u64 * size_of::<u32>() as u64;
    let index_buffer = backend
        .create_buffer(index_bytes, BufferUsage::Index)
        .and_then(|buffer| {
            backend
                .write_buffer(buffer, 0, bytemuck::cast_slice(indices))
                .map(|()| buffer)
        });
    match index_buffer {
        Ok(indices) => Ok(BufferSet {
            vertices,
            attributes,
            indices,
            fence: None,
        }),
        Err(err) => {
            backend.destroy_buffer(vertices);
            backend.destroy_buffer(attributes);
            Err(err.into())
        }
    }
}

fn write_mapped<B: Backend + ?Sized>(
    backend: &mut B,
    buffer: DeviceBufferHandle,
    bytes: &[u8],
) -> Result<(), FrameRingError> {
    if bytes.is_empty() {
        return Ok(());
    }
    let mapped = backend.map_buffer(buffer)?;
    let size = mapped.len() as u64;
    let result = match mapped.get_mut(..bytes.len()) {
        Some(target) => {
            target.copy_from_slice(bytes);
            Ok(())
        }
        None => Err(BackendError::BufferOverflow {
            offset: 0,
            len: bytes.len(),
            size,
        }),
    };
    let written = if result.is_ok() { bytes.len() as u64 } else { 0 };
    backend.unmap_buffer(buffer, written);
    result.map_err(FrameRingError::from)
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use gpu_backend::{
        DrawBinding, DrawCall, HeadlessBackend, HeadlessConfig, TextureDesc, TextureFormat,
    };
    use render_protocol::{Color, DeviceTextureHandle};

    use super::*;

    fn ring(backend: &mut HeadlessBackend, buffer_count: usize, timeout: Duration) -> FrameRing {
        let _ = env_logger::builder().is_test(true).try_init();
        FrameRing::new(
            backend,
            FrameRingConfig {
                buffer_count,
                max_quads: 4,
                fence_timeout: timeout,
            },
        )
        .unwrap()
    }

    fn white(backend: &mut HeadlessBackend) -> DeviceTextureHandle {
        backend
            .create_texture(&TextureDesc {
                label: "white",
                format: TextureFormat::Rgba8,
                width: 1,
                height: 1,
                layers: 1,
            })
            .unwrap()
    }

    /// One frame: acquire, fill, draw a quad, submit, retire.
    fn run_frame(
        ring: &mut FrameRing,
        backend: &mut HeadlessBackend,
        texture: DeviceTextureHandle,
    ) -> FrameSlot {
        let slot = ring.acquire(backend);
        let vertices = [GpuVertex::default(); VERTICES_PER_QUAD];
        let attributes = [GpuAtlasAttributes::STANDALONE; VERTICES_PER_QUAD];
        ring.write_frame(backend, &slot, &vertices, &attributes)
            .unwrap();
        backend.begin_frame(Color::TRANSPARENT).unwrap();
        backend
            .draw(&DrawCall {
                vertices: slot.vertices,
                attributes: slot.attributes,
                indices: slot.indices,
                binding: DrawBinding::Texture(texture),
                first_index: 0,
                index_count: INDICES_PER_QUAD as u32,
                instance_count: 1,
            })
            .unwrap();
        let fence = backend.submit().unwrap();
        ring.retire(fence).unwrap();
        backend.end_frame().unwrap();
        slot
    }

    #[test]
    fn index_pattern_is_written_once_per_set() {
        let mut backend = HeadlessBackend::default();
        let ring = ring(&mut backend, 2, DEFAULT_FENCE_TIMEOUT);
        let slot_indices: Vec<u32> =
            bytemuck::pod_collect_to_vec(backend.buffer_data(ring.sets[1].indices).unwrap());
        assert_eq!(&slot_indices[..12], &[0, 1, 2, 2, 1, 3, 4, 5, 6, 6, 5, 7]);
        assert_eq!(slot_indices.len(), 4 * INDICES_PER_QUAD);
    }

    #[test]
    fn slots_rotate_in_order() {
        let mut backend = HeadlessBackend::default();
        let mut ring = ring(&mut backend, 3, DEFAULT_FENCE_TIMEOUT);
        let texture = white(&mut backend);
        let indices: Vec<_> = (0..5)
            .map(|_| run_frame(&mut ring, &mut backend, texture).index)
            .collect();
        assert_eq!(indices, vec![0, 1, 2, 0, 1]);
    }

    #[test]
    fn fourth_acquire_waits_for_first_fence() {
        let mut backend = HeadlessBackend::new(HeadlessConfig {
            fence_latency: Duration::from_millis(150),
        });
        let mut ring = ring(&mut backend, 3, DEFAULT_FENCE_TIMEOUT);
        let texture = white(&mut backend);

        for _ in 0..3 {
            let slot = run_frame(&mut ring, &mut backend, texture);
            assert_eq!(slot.outcome, AcquireOutcome::Free);
        }
        assert_eq!(backend.fence_waits(), 0);
        assert_eq!(ring.in_flight(), 3);

        let started = Instant::now();
        let slot = ring.acquire(&mut backend);
        assert_eq!(slot.index, 0);
        assert_eq!(slot.outcome, AcquireOutcome::Fenced);
        assert_eq!(backend.fence_waits(), 1);
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(backend.hazards(), 0);
    }

    #[test]
    fn steady_state_never_writes_in_flight_buffers() {
        let mut backend = HeadlessBackend::new(HeadlessConfig {
            fence_latency: Duration::from_millis(5),
        });
        let mut ring = ring(&mut backend, 2, DEFAULT_FENCE_TIMEOUT);
        let texture = white(&mut backend);
        for _ in 0..8 {
            run_frame(&mut ring, &mut backend, texture);
        }
        assert_eq!(backend.hazards(), 0);
        assert_eq!(ring.stats().acquires, 8);
        assert_eq!(ring.stats().timeouts, 0);
    }

    #[test]
    fn timeout_is_logged_and_frame_proceeds() {
        let mut backend = HeadlessBackend::default();
        backend.set_stall_fences(true);
        let mut ring = ring(&mut backend, 1, Duration::from_millis(10));
        let texture = white(&mut backend);

        run_frame(&mut ring, &mut backend, texture);
        let slot = run_frame(&mut ring, &mut backend, texture);

        assert_eq!(slot.outcome, AcquireOutcome::TimedOut);
        assert_eq!(ring.stats().timeouts, 1);
        assert_eq!(backend.fence_timeouts(), 1);
        // The frame went ahead and overwrote memory the device still owned.
        assert!(backend.hazards() > 0);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut backend = HeadlessBackend::default();
        let mut ring = ring(&mut backend, 1, DEFAULT_FENCE_TIMEOUT);
        let slot = ring.acquire(&mut backend);
        let vertices = vec![GpuVertex::default(); 5 * VERTICES_PER_QUAD];
        assert!(matches!(
            ring.write_frame(&mut backend, &slot, &vertices, &[]),
            Err(FrameRingError::QuadOverflow { quads: 5, max_quads: 4 })
        ));
    }

    #[test]
    fn abandoned_slot_is_handed_out_again() {
        let mut backend = HeadlessBackend::default();
        let mut ring = ring(&mut backend, 3, DEFAULT_FENCE_TIMEOUT);
        let texture = white(&mut backend);

        run_frame(&mut ring, &mut backend, texture);
        let abandoned = ring.acquire(&mut backend);
        assert_eq!(abandoned.index, 1);

        let retried = run_frame(&mut ring, &mut backend, texture);
        assert_eq!(retried.index, 1);
        assert_eq!(run_frame(&mut ring, &mut backend, texture).index, 2);
        assert_eq!(ring.in_flight(), 3);
    }

    #[test]
    fn retire_requires_acquire() {
        let mut backend = HeadlessBackend::default();
        let mut ring = ring(&mut backend, 1, DEFAULT_FENCE_TIMEOUT);
        backend.begin_frame(Color::TRANSPARENT).unwrap();
        let fence = backend.submit().unwrap();
        assert!(matches!(ring.retire(fence), Err(FrameRingError::NotAcquired)));
    }

    #[test]
    fn zero_buffers_is_invalid() {
        let mut backend = HeadlessBackend::default();
        let config = FrameRingConfig {
            buffer_count: 0,
            ..FrameRingConfig::default()
        };
        assert!(matches!(
            FrameRing::new(&mut backend, config),
            Err(FrameRingError::InvalidConfig(_))
        ));
    }
}
