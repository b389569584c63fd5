use std::collections::HashMap;

use atlas::{AtlasLayerAllocator, AtlasLayout, PaletteSlotAllocator};
use gpu_backend::{Backend, BufferUsage, TextureFormat, TextureRegion};
use render_protocol::{
    AtlasLayerId, DeviceBufferHandle, DeviceTextureHandle, PALETTE_SLOT_COLORS, PaletteId,
    PaletteSlotId, PixelFormat, TextureBinding, TextureId, TextureRect, expand_to_rgba,
    unpack_indices,
};
use smallvec::SmallVec;

use crate::deferred::{DeferredDestroyQueue, Deferral};
use crate::live_set::{CacheKey, LiveSet};
use crate::resources::{PaletteDesc, PaletteSource, SourceTable, TextureDesc, TextureSource};
use crate::{CacheConfig, CacheError, CacheStats};

/// Device location of a resolved pair, ready to be written into a draw.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedTexture {
    pub binding: TextureBinding,
    /// Multiplier applied to source UVs. Atlas bitmaps only cover the
    /// top-left corner of their layer.
    pub uv_scale: [f32; 2],
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    Atlas(AtlasLayerId),
    Standalone(DeviceTextureHandle),
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    placement: Placement,
    width: u32,
    height: u32,
    /// Source texels changed since the last upload.
    pending: Option<TextureRect>,
}

#[derive(Debug)]
struct PaletteRecord {
    source: PaletteSource,
    slot: Option<PaletteSlotId>,
    slot_dirty: bool,
}

pub struct ResourceCache {
    textures: SourceTable<TextureSource>,
    palettes: SourceTable<PaletteRecord>,
    layers: AtlasLayerAllocator,
    palette_slots: PaletteSlotAllocator,
    atlas_texture: DeviceTextureHandle,
    palette_buffer: DeviceBufferHandle,
    live: HashMap<CacheKey, CacheEntry>,
    live_set: LiveSet,
    stale: HashMap<CacheKey, CacheEntry>,
    stale_set: LiveSet,
    deferred: DeferredDestroyQueue,
    stats: CacheStats,
    scratch: Vec<u8>,
}

impl ResourceCache {
    /// Creates the atlas texture array and the palette buffer.
    pub fn new<B: Backend + ?Sized>(
        backend: &mut B,
        config: CacheConfig,
    ) -> Result<Self, CacheError> {
        config.validate()?;
        let layout = config.atlas;
        let atlas_texture = backend.create_texture(&gpu_backend::TextureDesc {
            label: "sprite atlas",
            format: TextureFormat::Index8,
            width: layout.tile_size,
            height: layout.tile_size,
            layers: layout.layers,
        })?;
        let palette_bytes = config.palette_slots as u64 * PALETTE_SLOT_COLORS as u64 * 4;
        let palette_buffer = match backend.create_buffer(palette_bytes, BufferUsage::Palette) {
            Ok(buffer) => buffer,
            Err(err) => {
                backend.destroy_texture(atlas_texture);
                return Err(err.into());
            }
        };
        log::info!(
            "resource cache on {}: {} atlas layers of {}px, {} palette slots",
            backend.name(),
            layout.layers,
            layout.tile_size,
            config.palette_slots
        );

        Ok(Self {
            textures: SourceTable::with_capacity(config.max_textures),
            palettes: SourceTable::with_capacity(config.max_palettes),
            layers: AtlasLayerAllocator::new(layout),
            palette_slots: PaletteSlotAllocator::new(config.palette_slots),
            atlas_texture,
            palette_buffer,
            live: HashMap::with_capacity(config.live_set_hint),
            live_set: LiveSet::with_capacity(config.live_set_hint),
            stale: HashMap::new(),
            stale_set: LiveSet::default(),
            deferred: DeferredDestroyQueue::with_capacity(config.destroy_queue_capacity),
            stats: CacheStats::default(),
            scratch: Vec::new(),
        })
    }

    pub fn register_texture(&mut self, desc: TextureDesc) -> Result<TextureId, CacheError> {
        let source = TextureSource::new(desc)?;
        let capacity = self.textures.capacity();
        self.textures
            .insert(source)
            .and_then(TextureId::from_index)
            .ok_or(CacheError::CapacityExceeded {
                what: "texture",
                capacity,
            })
    }

    pub fn register_palette(&mut self, desc: PaletteDesc) -> Result<PaletteId, CacheError> {
        let source = PaletteSource::new(desc)?;
        let capacity = self.palettes.capacity();
        self.palettes
            .insert(PaletteRecord {
                source,
                slot: None,
                slot_dirty: false,
            })
            .and_then(PaletteId::from_index)
            .ok_or(CacheError::CapacityExceeded {
                what: "palette",
                capacity,
            })
    }

    /// Returns the device location of `texture` drawn through `palette`,
    /// uploading it first if no current copy exists.
    ///
    /// Direct-color textures ignore `palette`. Repeated calls for the same
    /// pair upload nothing until a source is unlocked with new content.
    pub fn resolve<B: Backend + ?Sized>(
        &mut self,
        backend: &mut B,
        texture: TextureId,
        palette: Option<PaletteId>,
    ) -> Result<ResolvedTexture, CacheError> {
        let source = self.texture_source(texture)?;
        if source.pixels.is_none() {
            return Err(CacheError::ResourceNotReady { kind: "texture" });
        }
        let (format, width, height) = (source.format, source.width, source.height);

        let palette = if format.is_indexed() {
            let palette = palette.ok_or(CacheError::MissingPalette {
                texture: texture.get(),
            })?;
            if self.palette_record(palette)?.source.colors.is_none() {
                return Err(CacheError::ResourceNotReady { kind: "palette" });
            }
            Some(palette)
        } else {
            None
        };
        let key = CacheKey::new(texture, palette);

        if let Some(entry) = self.live.get(&key).copied() {
            self.stats.hits += 1;
            if let Some(rect) = entry.pending {
                self.upload(backend, key, entry.placement, rect)?;
                if let Some(live) = self.live.get_mut(&key) {
                    live.pending = None;
                }
            }
            return self.resolved(backend, key, entry);
        }

        self.stats.misses += 1;
        let entry = self.place(backend, key, format, width, height)?;
        if let Err(err) = self.upload(backend, key, entry.placement, TextureRect::full(width, height))
        {
            self.release(backend, entry);
            return Err(err);
        }
        self.live.insert(key, entry);
        self.live_set.insert(key);
        self.resolved(backend, key, entry)
    }

    /// Binding of a pair that is currently live, without uploading.
    pub fn cached_binding(
        &self,
        texture: TextureId,
        palette: Option<PaletteId>,
    ) -> Option<TextureBinding> {
        let key = self.key_for(texture, palette)?;
        let entry = self.live.get(&key)?;
        match entry.placement {
            Placement::Atlas(layer) => {
                let slot = self.palettes.get(key.palette?.index())?.slot?;
                Some(TextureBinding::Atlas {
                    layer,
                    palette: slot,
                })
            }
            Placement::Standalone(handle) => Some(TextureBinding::Standalone(handle)),
        }
    }

    /// Hands the cache new texel data, or re-reads the current data when
    /// `pixels` is `None`. Returns `true` if the content changed, in which
    /// case every live entry of the texture is retired to stale and will be
    /// re-uploaded on its next resolve.
    pub fn unlock_texture<B: Backend + ?Sized>(
        &mut self,
        backend: &mut B,
        texture: TextureId,
        pixels: Option<Vec<u8>>,
    ) -> Result<bool, CacheError> {
        let source = self
            .textures
            .get_mut(texture.index())
            .ok_or(CacheError::InvalidHandle {
                kind: "texture",
                id: texture.get(),
            })?;
        if !source.relock(pixels)? {
            return Ok(false);
        }
        let retired = self.live_set.take_texture(texture);
        for key in &retired {
            if let Some(entry) = self.live.remove(key) {
                self.stash_stale(backend, *key, entry);
            }
        }
        log::trace!(
            "texture {} changed, {} entries retired",
            texture.get(),
            retired.len()
        );
        Ok(true)
    }

    /// Returns `true` if the colors changed. Atlas entries stay live and
    /// pick up the new colors when the palette slot is rewritten on their
    /// next resolve; standalone entries baked the old colors in and are
    /// retired.
    pub fn unlock_palette<B: Backend + ?Sized>(
        &mut self,
        backend: &mut B,
        palette: PaletteId,
        colors: Option<Vec<u8>>,
    ) -> Result<bool, CacheError> {
        let record = self
            .palettes
            .get_mut(palette.index())
            .ok_or(CacheError::InvalidHandle {
                kind: "palette",
                id: palette.get(),
            })?;
        if !record.source.relock(colors)? {
            return Ok(false);
        }
        record.slot_dirty = true;

        let retired: SmallVec<[CacheKey; 8]> = self
            .live_set
            .keys_with_palette(palette)
            .filter(|key| {
                self.live
                    .get(key)
                    .is_some_and(|entry| matches!(entry.placement, Placement::Standalone(_)))
            })
            .collect();
        for key in retired {
            self.live_set.remove(key);
            if let Some(entry) = self.live.remove(&key) {
                self.stash_stale(backend, key, entry);
            }
        }
        Ok(true)
    }

    /// Writes `bytes` (packed rows of `rect` in the texture's own format)
    /// into the source. Live entries upload just the touched rectangle on
    /// their next resolve.
    pub fn update_texture_region(
        &mut self,
        texture: TextureId,
        rect: TextureRect,
        bytes: &[u8],
    ) -> Result<(), CacheError> {
        let source = self
            .textures
            .get_mut(texture.index())
            .ok_or(CacheError::InvalidHandle {
                kind: "texture",
                id: texture.get(),
            })?;
        source.write_region(rect, bytes)?;
        for key in self.live_set.keys_with_texture(texture) {
            if let Some(entry) = self.live.get_mut(&key) {
                entry.pending = Some(entry.pending.map_or(rect, |pending| pending.union(rect)));
            }
        }
        Ok(())
    }

    /// Evicts every entry built from `texture` and forgets the texture.
    pub fn destroy_texture<B: Backend + ?Sized>(
        &mut self,
        backend: &mut B,
        texture: TextureId,
    ) -> Result<(), CacheError> {
        if self.textures.remove(texture.index()).is_none() {
            return Err(CacheError::InvalidHandle {
                kind: "texture",
                id: texture.get(),
            });
        }
        for key in self.live_set.take_texture(texture) {
            if let Some(entry) = self.live.remove(&key) {
                self.release(backend, entry);
            }
        }
        for key in self.stale_set.take_texture(texture) {
            if let Some(entry) = self.stale.remove(&key) {
                self.release(backend, entry);
            }
        }
        Ok(())
    }

    /// Evicts every entry drawn through `palette`, frees its palette slot
    /// and forgets the palette.
    pub fn destroy_palette<B: Backend + ?Sized>(
        &mut self,
        backend: &mut B,
        palette: PaletteId,
    ) -> Result<(), CacheError> {
        let record = self
            .palettes
            .remove(palette.index())
            .ok_or(CacheError::InvalidHandle {
                kind: "palette",
                id: palette.get(),
            })?;
        for key in self.live_set.take_palette(palette) {
            if let Some(entry) = self.live.remove(&key) {
                self.release(backend, entry);
            }
        }
        for key in self.stale_set.take_palette(palette) {
            if let Some(entry) = self.stale.remove(&key) {
                self.release(backend, entry);
            }
        }
        if let Some(slot) = record.slot
            && let Err(err) = self.palette_slots.free(slot)
        {
            log::warn!("palette {} slot release failed: {err}", palette.get());
        }
        Ok(())
    }

    /// Destroys device textures evicted during the previous frame.
    pub fn begin_frame<B: Backend + ?Sized>(&mut self, backend: &mut B) {
        self.deferred.flush(backend);
        self.stats.frame_uploads = 0;
    }

    pub fn end_frame(&mut self) {
        if self.stats.frame_uploads > 0 {
            log::debug!(
                "frame uploaded {} textures ({} live pairs, {} atlas layers in use)",
                self.stats.frame_uploads,
                self.live_set.len(),
                self.layers.live()
            );
        }
    }

    /// Releases every device object the cache owns.
    pub fn destroy<B: Backend + ?Sized>(mut self, backend: &mut B) {
        for (_, entry) in self.live.drain().chain(self.stale.drain()) {
            if let Placement::Standalone(handle) = entry.placement {
                backend.destroy_texture(handle);
            }
        }
        self.deferred.flush(backend);
        backend.destroy_texture(self.atlas_texture);
        backend.destroy_buffer(self.palette_buffer);
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn live_set(&self) -> &LiveSet {
        &self.live_set
    }

    pub fn is_stale(&self, texture: TextureId, palette: Option<PaletteId>) -> bool {
        self.key_for(texture, palette)
            .is_some_and(|key| self.stale.contains_key(&key))
    }

    pub fn pending_destroys(&self) -> usize {
        self.deferred.len()
    }

    pub fn atlas_texture(&self) -> DeviceTextureHandle {
        self.atlas_texture
    }

    pub fn palette_buffer(&self) -> DeviceBufferHandle {
        self.palette_buffer
    }

    pub fn atlas_layout(&self) -> AtlasLayout {
        self.layers.layout()
    }

    pub fn atlas_layers_live(&self) -> u32 {
        self.layers.live()
    }

    pub fn palette_slots_live(&self) -> u32 {
        self.palette_slots.live()
    }

    pub fn palette_slot(&self, palette: PaletteId) -> Option<PaletteSlotId> {
        self.palettes.get(palette.index())?.slot
    }

    pub fn texture_size(&self, texture: TextureId) -> Option<(u32, u32)> {
        self.textures
            .get(texture.index())
            .map(|source| (source.width, source.height))
    }

    pub fn texture_count(&self) -> usize {
        self.textures.live()
    }

    pub fn palette_count(&self) -> usize {
        self.palettes.live()
    }

    fn texture_source(&self, texture: TextureId) -> Result<&TextureSource, CacheError> {
        self.textures
            .get(texture.index())
            .ok_or(CacheError::InvalidHandle {
                kind: "texture",
                id: texture.get(),
            })
    }

    fn palette_record(&self, palette: PaletteId) -> Result<&PaletteRecord, CacheError> {
        self.palettes
            .get(palette.index())
            .ok_or(CacheError::InvalidHandle {
                kind: "palette",
                id: palette.get(),
            })
    }

    fn key_for(&self, texture: TextureId, palette: Option<PaletteId>) -> Option<CacheKey> {
        let source = self.textures.get(texture.index())?;
        let palette = if source.format.is_indexed() {
            palette
        } else {
            None
        };
        Some(CacheKey::new(texture, palette))
    }

    /// Picks device storage for a pair that has no live entry.
    fn place<B: Backend + ?Sized>(
        &mut self,
        backend: &mut B,
        key: CacheKey,
        format: PixelFormat,
        width: u32,
        height: u32,
    ) -> Result<CacheEntry, CacheError> {
        let wants_atlas = format.is_indexed() && self.layers.layout().fits(width, height);

        if let Some(stale) = self.take_stale(key) {
            let same_kind = matches!(stale.placement, Placement::Atlas(_)) == wants_atlas;
            if same_kind && stale.width == width && stale.height == height {
                self.stats.stale_reuses += 1;
                return Ok(CacheEntry {
                    pending: None,
                    ..stale
                });
            }
            self.release(backend, stale);
        }

        if wants_atlas && let Some(layer) = self.try_atlas_layer(backend, key)? {
            self.stats.atlas_placements += 1;
            return Ok(CacheEntry {
                placement: Placement::Atlas(layer),
                width,
                height,
                pending: None,
            });
        }

        let handle = backend.create_texture(&gpu_backend::TextureDesc {
            label: "sprite texture",
            format: TextureFormat::Rgba8,
            width,
            height,
            layers: 1,
        })?;
        self.stats.standalone_placements += 1;
        Ok(CacheEntry {
            placement: Placement::Standalone(handle),
            width,
            height,
            pending: None,
        })
    }

    fn try_atlas_layer<B: Backend + ?Sized>(
        &mut self,
        backend: &mut B,
        key: CacheKey,
    ) -> Result<Option<AtlasLayerId>, CacheError> {
        let Some(palette) = key.palette else {
            return Ok(None);
        };
        if self.sync_palette_slot(backend, palette)?.is_none() {
            log::debug!("palette slots exhausted, texture {} goes standalone", key.texture.get());
            return Ok(None);
        }
        match self.layers.alloc() {
            Ok(layer) => Ok(Some(layer)),
            Err(err) => {
                log::debug!("{err}, texture {} goes standalone", key.texture.get());
                Ok(None)
            }
        }
    }

    /// Gives `palette` a slot if it has none and rewrites the slot when the
    /// colors changed. `None` means no slot could be allocated.
    fn sync_palette_slot<B: Backend + ?Sized>(
        &mut self,
        backend: &mut B,
        palette: PaletteId,
    ) -> Result<Option<PaletteSlotId>, CacheError> {
        let record = self
            .palettes
            .get_mut(palette.index())
            .ok_or(CacheError::InvalidHandle {
                kind: "palette",
                id: palette.get(),
            })?;
        let slot = match record.slot {
            Some(slot) => slot,
            None => match self.palette_slots.alloc() {
                Ok(slot) => {
                    record.slot = Some(slot);
                    record.slot_dirty = true;
                    slot
                }
                Err(_) => return Ok(None),
            },
        };
        if record.slot_dirty {
            let colors = record
                .source
                .colors
                .as_deref()
                .ok_or(CacheError::ResourceNotReady { kind: "palette" })?;
            backend.write_buffer(
                self.palette_buffer,
                PaletteSlotAllocator::byte_offset(slot),
                bytemuck::cast_slice(colors),
            )?;
            record.slot_dirty = false;
            self.stats.palette_uploads += 1;
        }
        Ok(Some(slot))
    }

    fn upload<B: Backend + ?Sized>(
        &mut self,
        backend: &mut B,
        key: CacheKey,
        placement: Placement,
        rect: TextureRect,
    ) -> Result<(), CacheError> {
        let source = self
            .textures
            .get(key.texture.index())
            .ok_or(CacheError::InvalidHandle {
                kind: "texture",
                id: key.texture.get(),
            })?;
        let pixels = source
            .pixels
            .as_deref()
            .ok_or(CacheError::ResourceNotReady { kind: "texture" })?;

        let (target, layer) = match placement {
            Placement::Atlas(layer) => {
                unpack_indices(
                    source.format,
                    pixels,
                    source.width,
                    rect.as_tuple(),
                    &mut self.scratch,
                );
                (self.atlas_texture, layer.raw())
            }
            Placement::Standalone(handle) => {
                let colors = key
                    .palette
                    .and_then(|palette| self.palettes.get(palette.index()))
                    .and_then(|record| record.source.colors.as_deref())
                    .unwrap_or(&[]);
                expand_to_rgba(
                    source.format,
                    pixels,
                    source.width,
                    rect.as_tuple(),
                    colors,
                    &mut self.scratch,
                );
                (handle, 0)
            }
        };
        let full = rect == TextureRect::full(source.width, source.height);
        backend.upload_region(
            target,
            TextureRegion {
                x: rect.x,
                y: rect.y,
                layer,
                width: rect.width,
                height: rect.height,
            },
            &self.scratch,
        )?;

        if full {
            self.stats.uploads += 1;
        } else {
            self.stats.region_uploads += 1;
        }
        self.stats.frame_uploads += 1;
        Ok(())
    }

    fn resolved<B: Backend + ?Sized>(
        &mut self,
        backend: &mut B,
        key: CacheKey,
        entry: CacheEntry,
    ) -> Result<ResolvedTexture, CacheError> {
        let (binding, uv_scale) = match entry.placement {
            Placement::Atlas(layer) => {
                let palette = key.palette.ok_or(CacheError::MissingPalette {
                    texture: key.texture.get(),
                })?;
                let slot = self
                    .sync_palette_slot(backend, palette)?
                    .ok_or(CacheError::ResourceNotReady {
                        kind: "palette slot",
                    })?;
                (
                    TextureBinding::Atlas {
                        layer,
                        palette: slot,
                    },
                    self.layers.layout().uv_scale(entry.width, entry.height),
                )
            }
            Placement::Standalone(handle) => (TextureBinding::Standalone(handle), [1.0, 1.0]),
        };
        Ok(ResolvedTexture {
            binding,
            uv_scale,
            width: entry.width,
            height: entry.height,
        })
    }

    fn take_stale(&mut self, key: CacheKey) -> Option<CacheEntry> {
        let entry = self.stale.remove(&key)?;
        self.stale_set.remove(key);
        Some(entry)
    }

    /// Keeps at most one stale entry per key; an older one is released.
    fn stash_stale<B: Backend + ?Sized>(&mut self, backend: &mut B, key: CacheKey, entry: CacheEntry) {
        if let Some(previous) = self.stale.insert(key, entry) {
            self.release(backend, previous);
        }
        self.stale_set.insert(key);
    }

    fn release<B: Backend + ?Sized>(&mut self, backend: &mut B, entry: CacheEntry) {
        match entry.placement {
            Placement::Atlas(layer) => {
                if let Err(err) = self.layers.free(layer) {
                    log::warn!("atlas layer {} release failed: {err}", layer.raw());
                }
            }
            Placement::Standalone(handle) => match self.deferred.push(backend, handle) {
                Deferral::Queued => self.stats.deferred_destroys += 1,
                Deferral::DestroyedNow => self.stats.immediate_destroys += 1,
            },
        }
    }
}
