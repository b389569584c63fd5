use batching::{BatchQueue, BatchResource, TaskFill};
use frame_ring::{AcquireOutcome, FrameRing, RingStats};
use gpu_backend::{Backend, DrawBinding, DrawCall};
use render_protocol::{
    Color, CombinedHandle, GpuAtlasAttributes, GpuVertex, INDICES_PER_QUAD, PaletteId, PixelFormat,
    QuadVertex, SpriteRect, TextureBinding, TextureId, TextureRect, UvRect,
};
use resource_cache::{CacheError, PaletteDesc, ResolvedTexture, ResourceCache, TextureDesc};

use crate::{CompositorConfig, CompositorError, FrameStats, create_backend};

#[derive(Debug, Clone, Copy)]
enum Resolution {
    Ready(ResolvedTexture),
    /// A resource named by the handle changed since it was resolved.
    Stale,
    Failed,
}

/// Handle of the last `set_texture`. Stays bound until the next frame even
/// when its resources change; draws then resolve it again.
#[derive(Debug, Clone, Copy)]
struct BoundTexture {
    handle: CombinedHandle,
    resolution: Resolution,
}

impl BoundTexture {
    fn uses(&self, texture: Option<TextureId>, palette: Option<PaletteId>) -> bool {
        (texture.is_some() && self.handle.texture() == texture)
            || (palette.is_some() && self.handle.palette() == palette)
    }
}

pub struct CompositorContext<B: Backend> {
    backend: B,
    config: CompositorConfig,
    cache: ResourceCache,
    queue: BatchQueue,
    ring: FrameRing,
    /// 1x1 opaque white texel that solid quads sample.
    white: TextureId,
    bound: Option<BoundTexture>,
    frame_open: bool,
    frame: FrameStats,
    last_frame: FrameStats,
    vertices: Vec<GpuVertex>,
    attributes: Vec<GpuAtlasAttributes>,
}

impl CompositorContext<Box<dyn Backend>> {
    /// Builds the backend named in `config` and a context around it.
    pub fn from_config(config: CompositorConfig) -> Result<Self, CompositorError> {
        let backend = create_backend(&config)?;
        Self::new(backend, config)
    }
}

impl<B: Backend> CompositorContext<B> {
    pub fn new(mut backend: B, config: CompositorConfig) -> Result<Self, CompositorError> {
        config.validate()?;
        let mut cache = ResourceCache::new(&mut backend, config.cache_config())?;
        let ring = match FrameRing::new(&mut backend, config.frame_ring_config()) {
            Ok(ring) => ring,
            Err(err) => {
                cache.destroy(&mut backend);
                return Err(err.into());
            }
        };
        let white = cache.register_texture(TextureDesc {
            format: PixelFormat::Direct16,
            width: 1,
            height: 1,
            pixels: Some(0xFFFFu16.to_le_bytes().to_vec()),
        })?;

        let quads = config.max_render_tasks;
        log::info!(
            "compositor ready: {} backend, {} tasks per frame, {} frame buffers",
            backend.name(),
            quads,
            ring.buffer_count()
        );
        Ok(Self {
            queue: BatchQueue::with_mode(quads, config.coalesce),
            backend,
            config,
            cache,
            ring,
            white,
            bound: None,
            frame_open: false,
            frame: FrameStats::default(),
            last_frame: FrameStats::default(),
            vertices: Vec::with_capacity(quads * 4),
            attributes: Vec::with_capacity(quads * 4),
        })
    }

    pub fn create_texture(&mut self, desc: TextureDesc) -> Result<TextureId, CompositorError> {
        let texture = self.cache.register_texture(desc)?;
        self.invalidate_bound(Some(texture), None);
        Ok(texture)
    }

    pub fn create_palette(&mut self, desc: PaletteDesc) -> Result<PaletteId, CompositorError> {
        let palette = self.cache.register_palette(desc)?;
        self.invalidate_bound(None, Some(palette));
        Ok(palette)
    }

    pub fn destroy_texture(&mut self, texture: TextureId) -> bool {
        if texture == self.white {
            log::warn!("texture {} is reserved and cannot be destroyed", texture.get());
            return false;
        }
        self.invalidate_bound(Some(texture), None);
        let result = self.cache.destroy_texture(&mut self.backend, texture);
        report("destroy_texture", result).is_some()
    }

    pub fn destroy_palette(&mut self, palette: PaletteId) -> bool {
        self.invalidate_bound(None, Some(palette));
        let result = self.cache.destroy_palette(&mut self.backend, palette);
        report("destroy_palette", result).is_some()
    }

    /// Replaces the texels of `texture`. Returns whether the content
    /// changed; unchanged content keeps every cached copy.
    pub fn unlock_texture(&mut self, texture: TextureId, pixels: Option<Vec<u8>>) -> bool {
        if texture == self.white {
            log::warn!("texture {} is reserved and cannot be rewritten", texture.get());
            return false;
        }
        let result = self.cache.unlock_texture(&mut self.backend, texture, pixels);
        let changed = report("unlock_texture", result).unwrap_or(false);
        if changed {
            self.invalidate_bound(Some(texture), None);
        }
        changed
    }

    pub fn unlock_palette(&mut self, palette: PaletteId, colors: Option<Vec<u8>>) -> bool {
        let result = self.cache.unlock_palette(&mut self.backend, palette, colors);
        let changed = report("unlock_palette", result).unwrap_or(false);
        if changed {
            self.invalidate_bound(None, Some(palette));
        }
        changed
    }

    pub fn update_texture_region(
        &mut self,
        texture: TextureId,
        rect: TextureRect,
        bytes: &[u8],
    ) -> bool {
        if texture == self.white {
            log::warn!("texture {} is reserved and cannot be rewritten", texture.get());
            return false;
        }
        self.invalidate_bound(Some(texture), None);
        let result = self.cache.update_texture_region(texture, rect, bytes);
        report("update_texture_region", result).is_some()
    }

    pub fn begin_frame(&mut self) -> Result<(), CompositorError> {
        if self.frame_open {
            log::warn!("begin_frame while a frame is open; closing it first");
            self.end_frame()?;
        }
        self.cache.begin_frame(&mut self.backend);
        self.queue.clear();
        self.bound = None;
        self.frame = FrameStats::default();
        self.backend
            .begin_frame(Color::from_argb(self.config.clear_color))?;
        self.frame_open = true;
        Ok(())
    }

    /// Binds the texture and palette packed in `handle` for the following
    /// textured draws. Returns false if the pair cannot be drawn; those
    /// draws are then skipped.
    pub fn set_texture(&mut self, handle: CombinedHandle) -> bool {
        if let Some(BoundTexture {
            handle: bound,
            resolution: Resolution::Ready(_),
        }) = self.bound
            && bound == handle
        {
            return true;
        }
        self.resolve_bound(handle).is_some()
    }

    /// Queues a quad textured with the bound texture and modulated by
    /// `tint`. UVs are relative to the source bitmap.
    pub fn draw_textured_quad(&mut self, vertices: [QuadVertex; 4], tint: Color) {
        if !self.check_frame_open() {
            return;
        }
        let resolved = match self.bound {
            Some(BoundTexture {
                resolution: Resolution::Ready(resolved),
                ..
            }) => Some(resolved),
            Some(BoundTexture {
                handle,
                resolution: Resolution::Stale,
            }) => self.resolve_bound(handle),
            Some(BoundTexture {
                resolution: Resolution::Failed,
                ..
            })
            | None => None,
        };
        let Some(resolved) = resolved else {
            self.frame.skipped += 1;
            return;
        };
        let [scale_u, scale_v] = resolved.uv_scale;
        let vertices = vertices.map(|vertex| QuadVertex {
            u: vertex.u * scale_u,
            v: vertex.v * scale_v,
            ..vertex
        });
        self.enqueue(
            vertices,
            TaskFill::Textured {
                binding: resolved.binding,
                tint,
            },
        );
    }

    pub fn draw_solid_quad(&mut self, vertices: [QuadVertex; 4], color: Color) {
        if self.check_frame_open() {
            self.enqueue(vertices, TaskFill::Solid(color));
        }
    }

    pub fn draw_sprite(&mut self, rect: SpriteRect, uv: UvRect, tint: Color) {
        self.draw_textured_quad(rect.to_quad(uv), tint);
    }

    /// Sorts the queued quads, writes them into the next frame buffer and
    /// issues one draw per batch. The queue is emptied whether or not the
    /// device accepted the frame.
    pub fn render_frame(&mut self) -> Result<(), CompositorError> {
        if !self.check_frame_open() {
            return Ok(());
        }
        if self.queue.is_empty() {
            return Ok(());
        }
        let result = self.render_queued();
        self.queue.clear_tasks();
        result
    }

    fn render_queued(&mut self) -> Result<(), CompositorError> {
        let white = self.cache.resolve(&mut self.backend, self.white, None)?;
        let white = draw_binding(&self.cache, white.binding);

        self.queue.flush();
        let tasks = self.queue.sorted_tasks();
        let batches = self.queue.batches();

        self.vertices.clear();
        self.attributes.clear();
        for task in tasks {
            let attribute = match task.fill.binding() {
                Some(TextureBinding::Atlas { layer, palette }) => GpuAtlasAttributes {
                    layer: layer.raw() as f32,
                    palette: palette.raw() as f32,
                },
                _ => GpuAtlasAttributes::STANDALONE,
            };
            let color = task.fill.color();
            for corner in task.vertices {
                self.vertices.push(GpuVertex {
                    position: [corner.x, corner.y],
                    uv: [corner.u, corner.v],
                    color,
                });
                self.attributes.push(attribute);
            }
        }

        let slot = self.ring.acquire(&mut self.backend);
        if slot.outcome == AcquireOutcome::TimedOut {
            self.frame.fence_timeouts += 1;
        }
        self.ring
            .write_frame(&mut self.backend, &slot, &self.vertices, &self.attributes)?;

        for batch in batches {
            let binding = match batch.resource {
                BatchResource::Solid => white,
                BatchResource::Bound(binding) => draw_binding(&self.cache, binding),
                BatchResource::Atlas => DrawBinding::Atlas {
                    atlas: self.cache.atlas_texture(),
                    palettes: self.cache.palette_buffer(),
                },
            };
            let call = DrawCall {
                vertices: slot.vertices,
                attributes: slot.attributes,
                indices: slot.indices,
                binding,
                first_index: (batch.tasks.start * INDICES_PER_QUAD) as u32,
                index_count: (batch.len() * INDICES_PER_QUAD) as u32,
                instance_count: 1,
            };
            match self.backend.draw(&call) {
                Ok(()) => self.frame.draw_calls += 1,
                Err(err) => {
                    log::error!("draw of batch {:?} failed: {err}", batch.tasks);
                    self.frame.draw_errors += 1;
                }
            }
        }

        self.frame.tasks += tasks.len() as u32;
        self.frame.batches += batches.len() as u32;
        let fence = self.backend.submit()?;
        self.ring.retire(fence)?;
        Ok(())
    }

    pub fn end_frame(&mut self) -> Result<(), CompositorError> {
        if !self.frame_open {
            log::warn!("end_frame without begin_frame ignored");
            return Ok(());
        }
        if !self.queue.is_empty() {
            log::warn!(
                "{} quads queued after render_frame were discarded",
                self.queue.len()
            );
        }
        self.frame.dropped = self.queue.dropped_this_frame();
        self.queue.clear();
        self.frame.uploads = self.cache.stats().frame_uploads;
        self.cache.end_frame();
        self.frame_open = false;
        self.last_frame = self.frame;
        log::trace!("frame done: {:?}", self.frame);
        self.backend.end_frame()?;
        Ok(())
    }

    /// Waits for every in-flight frame, then releases all device objects.
    pub fn shutdown(mut self) -> B {
        self.ring.wait_idle(&mut self.backend);
        self.ring.destroy(&mut self.backend);
        self.cache.destroy(&mut self.backend);
        log::info!("compositor shut down");
        self.backend
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn cache(&self) -> &ResourceCache {
        &self.cache
    }

    pub fn config(&self) -> &CompositorConfig {
        &self.config
    }

    pub fn white_texture(&self) -> TextureId {
        self.white
    }

    /// Counters of the frame in progress.
    pub fn frame_stats(&self) -> FrameStats {
        if !self.frame_open {
            return self.frame;
        }
        FrameStats {
            dropped: self.queue.dropped_this_frame(),
            ..self.frame
        }
    }

    /// Counters of the last completed frame.
    pub fn last_frame_stats(&self) -> FrameStats {
        self.last_frame
    }

    pub fn ring_stats(&self) -> RingStats {
        self.ring.stats()
    }

    pub fn queued_quads(&self) -> usize {
        self.queue.len()
    }

    /// Task queue overflow warnings logged since construction.
    pub fn overflow_warnings(&self) -> u64 {
        self.queue.overflow_warnings()
    }

    fn resolve_bound(&mut self, handle: CombinedHandle) -> Option<ResolvedTexture> {
        let resolved = match handle.texture() {
            Some(texture) => {
                let result = self
                    .cache
                    .resolve(&mut self.backend, texture, handle.palette());
                report("texture binding", result)
            }
            None => {
                log::warn!("texture handle {:#010x} names no texture", handle.raw());
                None
            }
        };
        let resolution = match resolved {
            Some(resolved) => Resolution::Ready(resolved),
            None => Resolution::Failed,
        };
        self.bound = Some(BoundTexture { handle, resolution });
        resolved
    }

    fn invalidate_bound(&mut self, texture: Option<TextureId>, palette: Option<PaletteId>) {
        if let Some(bound) = self.bound.as_mut()
            && bound.uses(texture, palette)
        {
            bound.resolution = Resolution::Stale;
        }
    }

    fn check_frame_open(&self) -> bool {
        if !self.frame_open {
            log::warn!("draw outside begin_frame/end_frame ignored");
        }
        self.frame_open
    }

    fn enqueue(&mut self, vertices: [QuadVertex; 4], fill: TaskFill) {
        let depth = self.config.depth_of(vertices[0].z);
        // A full queue logs and counts the drop itself.
        let _ = self.queue.submit(vertices, fill, depth);
    }
}

fn draw_binding(cache: &ResourceCache, binding: TextureBinding) -> DrawBinding {
    match binding {
        TextureBinding::Atlas { .. } => DrawBinding::Atlas {
            atlas: cache.atlas_texture(),
            palettes: cache.palette_buffer(),
        },
        TextureBinding::Standalone(texture) => DrawBinding::Texture(texture),
    }
}

/// Logs a failed per-draw operation at a level matching how expected the
/// failure is.
fn report<T>(operation: &str, result: Result<T, CacheError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err @ CacheError::ResourceNotReady { .. }) => {
            log::debug!("{operation}: {err}");
            None
        }
        Err(err @ CacheError::Backend(_)) => {
            log::error!("{operation}: {err}");
            None
        }
        Err(err) => {
            log::warn!("{operation}: {err}");
            None
        }
    }
}
