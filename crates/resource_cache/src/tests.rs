use atlas::AtlasLayout;
use gpu_backend::{HeadlessBackend, HeadlessConfig, TextureRegion};
use render_protocol::{
    PaletteEntryFormat, PaletteFormat, PaletteId, PaletteSize, PixelFormat, TextureBinding,
    TextureId, TextureRect,
};

use crate::{CacheConfig, CacheError, CacheKey, PaletteDesc, ResourceCache, TextureDesc};

const TILE: u32 = 16;

fn config() -> CacheConfig {
    CacheConfig {
        max_textures: 8,
        max_palettes: 4,
        atlas: AtlasLayout {
            layers: 3,
            tile_size: TILE,
        },
        palette_slots: 2,
        destroy_queue_capacity: 8,
        live_set_hint: 16,
    }
}

fn setup() -> (HeadlessBackend, ResourceCache) {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut backend = HeadlessBackend::new(HeadlessConfig::default());
    let cache = ResourceCache::new(&mut backend, config()).unwrap();
    (backend, cache)
}

fn indexed(cache: &mut ResourceCache, width: u32, height: u32, fill: u8) -> TextureId {
    cache
        .register_texture(TextureDesc {
            format: PixelFormat::Indexed8,
            width,
            height,
            pixels: Some(vec![fill; (width * height) as usize]),
        })
        .unwrap()
}

fn palette_bytes(value: u8) -> Vec<u8> {
    vec![value; 256 * 4]
}

fn palette(cache: &mut ResourceCache, value: u8) -> PaletteId {
    cache
        .register_palette(PaletteDesc {
            format: PaletteFormat {
                size: PaletteSize::Colors256,
                entry: PaletteEntryFormat::Rgba32,
            },
            colors: Some(palette_bytes(value)),
        })
        .unwrap()
}

#[test]
fn repeated_resolve_uploads_once() {
    let (mut backend, mut cache) = setup();
    let tex = indexed(&mut cache, 8, 4, 3);
    let pal = palette(&mut cache, 0x11);

    let first = cache.resolve(&mut backend, tex, Some(pal)).unwrap();
    let second = cache.resolve(&mut backend, tex, Some(pal)).unwrap();

    assert_eq!(first, second);
    assert_eq!(backend.uploads_to(cache.atlas_texture()).len(), 1);
    let stats = cache.stats();
    assert_eq!((stats.hits, stats.misses, stats.uploads), (1, 1, 1));
    assert_eq!(stats.palette_uploads, 1);
    assert_eq!(cache.cached_binding(tex, Some(pal)), Some(first.binding));
}

#[test]
fn small_indexed_texture_lands_in_atlas_corner() {
    let (mut backend, mut cache) = setup();
    let tex = indexed(&mut cache, 8, 4, 3);
    let pal = palette(&mut cache, 0x11);

    let resolved = cache.resolve(&mut backend, tex, Some(pal)).unwrap();
    let TextureBinding::Atlas { layer, palette } = resolved.binding else {
        panic!("expected atlas placement, got {:?}", resolved.binding);
    };
    assert_eq!(layer.raw(), 0);
    assert_eq!(palette.raw(), 0);
    assert_eq!(resolved.uv_scale, [0.5, 0.25]);

    let atlas = backend.texture_data(cache.atlas_texture()).unwrap();
    assert_eq!(&atlas[..8], &[3; 8]);
    assert_eq!(atlas[8], 0);
    assert_eq!(&atlas[TILE as usize * 3..TILE as usize * 3 + 8], &[3; 8]);

    let colors = backend.buffer_data(cache.palette_buffer()).unwrap();
    assert_eq!(&colors[..8], &[0x11, 0x11, 0x11, 0x00, 0x11, 0x11, 0x11, 0x11]);
}

#[test]
fn unchanged_unlock_keeps_entry_live() {
    let (mut backend, mut cache) = setup();
    let tex = indexed(&mut cache, 4, 4, 1);
    let pal = palette(&mut cache, 0x22);
    cache.resolve(&mut backend, tex, Some(pal)).unwrap();

    assert!(!cache.unlock_texture(&mut backend, tex, None).unwrap());
    assert!(!cache.unlock_texture(&mut backend, tex, Some(vec![1; 16])).unwrap());
    assert!(cache.live_set().contains(CacheKey::new(tex, Some(pal))));

    cache.resolve(&mut backend, tex, Some(pal)).unwrap();
    assert_eq!(backend.uploads_to(cache.atlas_texture()).len(), 1);
}

#[test]
fn changed_unlock_reuploads_once_into_same_layer() {
    let (mut backend, mut cache) = setup();
    let tex = indexed(&mut cache, 4, 4, 1);
    let pal = palette(&mut cache, 0x22);
    let before = cache.resolve(&mut backend, tex, Some(pal)).unwrap();

    assert!(cache.unlock_texture(&mut backend, tex, Some(vec![9; 16])).unwrap());
    assert!(cache.is_stale(tex, Some(pal)));
    assert!(!cache.live_set().contains(CacheKey::new(tex, Some(pal))));

    let after = (0..3)
        .map(|_| cache.resolve(&mut backend, tex, Some(pal)).unwrap())
        .last()
        .unwrap();
    assert_eq!(before.binding, after.binding);
    assert_eq!(backend.uploads_to(cache.atlas_texture()).len(), 2);
    assert_eq!(cache.stats().stale_reuses, 1);
    assert!(!cache.is_stale(tex, Some(pal)));
    assert_eq!(backend.texture_data(cache.atlas_texture()).unwrap()[0], 9);
}

#[test]
fn direct_color_texture_is_standalone_rgba() {
    let (mut backend, mut cache) = setup();
    let red_opaque = 0x801Fu16.to_le_bytes();
    let pixels: Vec<u8> = red_opaque.iter().copied().cycle().take(2 * 2 * 2).collect();
    let tex = cache
        .register_texture(TextureDesc {
            format: PixelFormat::Direct16,
            width: 2,
            height: 2,
            pixels: Some(pixels),
        })
        .unwrap();
    let pal = palette(&mut cache, 0x33);

    let resolved = cache.resolve(&mut backend, tex, Some(pal)).unwrap();
    let TextureBinding::Standalone(handle) = resolved.binding else {
        panic!("direct color textures never use the atlas");
    };
    assert_eq!(resolved.uv_scale, [1.0, 1.0]);
    assert_eq!(&backend.texture_data(handle).unwrap()[..4], &[255, 0, 0, 255]);
    // The palette is irrelevant for direct color, so both keys share one entry.
    assert_eq!(cache.resolve(&mut backend, tex, None).unwrap(), resolved);
    assert_eq!(cache.live_set().len(), 1);
    assert_eq!(cache.palette_slots_live(), 0);
}

#[test]
fn oversized_indexed_texture_expands_through_palette() {
    let (mut backend, mut cache) = setup();
    let tex = indexed(&mut cache, TILE * 2, 2, 5);
    let pal = palette(&mut cache, 0x44);

    let resolved = cache.resolve(&mut backend, tex, Some(pal)).unwrap();
    let TextureBinding::Standalone(handle) = resolved.binding else {
        panic!("texture wider than a tile must be standalone");
    };
    assert_eq!(&backend.texture_data(handle).unwrap()[..4], &[0x44; 4]);
    assert_eq!(cache.atlas_layers_live(), 0);
}

#[test]
fn full_atlas_falls_back_to_standalone() {
    let (mut backend, mut cache) = setup();
    let pal = palette(&mut cache, 0x55);
    let textures: Vec<_> = (0..4).map(|i| indexed(&mut cache, 4, 4, i)).collect();

    let bindings: Vec<_> = textures
        .iter()
        .map(|tex| cache.resolve(&mut backend, *tex, Some(pal)).unwrap().binding)
        .collect();
    assert!(bindings[..3].iter().all(|b| b.atlas_layer().is_some()));
    assert!(matches!(bindings[3], TextureBinding::Standalone(_)));
    assert_eq!(cache.stats().atlas_placements, 3);
    assert_eq!(cache.stats().standalone_placements, 1);
}

#[test]
fn exhausted_palette_slots_fall_back_to_standalone() {
    let (mut backend, mut cache) = setup();
    let tex = indexed(&mut cache, 4, 4, 1);
    let palettes: Vec<_> = (0..3).map(|i| palette(&mut cache, i)).collect();

    let bindings: Vec<_> = palettes
        .iter()
        .map(|pal| cache.resolve(&mut backend, tex, Some(*pal)).unwrap().binding)
        .collect();
    assert!(matches!(bindings[0], TextureBinding::Atlas { .. }));
    assert!(matches!(bindings[1], TextureBinding::Atlas { .. }));
    assert!(matches!(bindings[2], TextureBinding::Standalone(_)));
    assert_eq!(cache.palette_slots_live(), 2);
}

#[test]
fn destroy_texture_evicts_only_its_pairs() {
    let (mut backend, mut cache) = setup();
    let a = indexed(&mut cache, 4, 4, 1);
    let b = indexed(&mut cache, 4, 4, 2);
    let p1 = palette(&mut cache, 1);
    let p2 = palette(&mut cache, 2);
    cache.resolve(&mut backend, a, Some(p1)).unwrap();
    cache.resolve(&mut backend, a, Some(p2)).unwrap();
    cache.resolve(&mut backend, b, Some(p1)).unwrap();
    assert_eq!(cache.live_set().len(), 3);

    cache.destroy_texture(&mut backend, a).unwrap();

    assert_eq!(cache.live_set().len(), 1);
    assert!(cache.live_set().contains(CacheKey::new(b, Some(p1))));
    assert!(!cache.live_set().contains_texture(a));
    assert_eq!(cache.atlas_layers_live(), 1);
    assert!(matches!(
        cache.resolve(&mut backend, a, Some(p1)),
        Err(CacheError::InvalidHandle { kind: "texture", .. })
    ));
}

#[test]
fn destroyed_standalone_texture_survives_until_next_frame() {
    let (mut backend, mut cache) = setup();
    let tex = indexed(&mut cache, TILE * 2, 1, 1);
    let pal = palette(&mut cache, 1);
    let TextureBinding::Standalone(handle) =
        cache.resolve(&mut backend, tex, Some(pal)).unwrap().binding
    else {
        panic!("expected standalone placement");
    };

    cache.destroy_texture(&mut backend, tex).unwrap();
    assert!(backend.texture_exists(handle));
    assert_eq!(cache.pending_destroys(), 1);

    cache.begin_frame(&mut backend);
    assert!(!backend.texture_exists(handle));
    assert_eq!(cache.pending_destroys(), 0);
    assert_eq!(cache.stats().deferred_destroys, 1);
}

#[test]
fn stale_fallback_moves_into_atlas_once_a_layer_frees() {
    let (mut backend, mut cache) = setup();
    let pal = palette(&mut cache, 0x66);
    let textures: Vec<_> = (0..4).map(|i| indexed(&mut cache, 4, 4, i)).collect();
    for tex in &textures {
        cache.resolve(&mut backend, *tex, Some(pal)).unwrap();
    }
    let TextureBinding::Standalone(fallback) = cache.cached_binding(textures[3], Some(pal)).unwrap()
    else {
        panic!("fourth texture should not fit the atlas");
    };

    cache.destroy_texture(&mut backend, textures[0]).unwrap();
    cache
        .unlock_texture(&mut backend, textures[3], Some(vec![7; 16]))
        .unwrap();
    let moved = cache.resolve(&mut backend, textures[3], Some(pal)).unwrap();

    assert!(moved.binding.atlas_layer().is_some());
    assert_eq!(cache.pending_destroys(), 1);
    cache.begin_frame(&mut backend);
    assert!(!backend.texture_exists(fallback));
}

#[test]
fn palette_change_rewrites_slot_and_retires_standalone_entries() {
    let (mut backend, mut cache) = setup();
    let small = indexed(&mut cache, 4, 4, 1);
    let wide = indexed(&mut cache, TILE * 2, 1, 1);
    let pal = palette(&mut cache, 0x10);
    cache.resolve(&mut backend, small, Some(pal)).unwrap();
    cache.resolve(&mut backend, wide, Some(pal)).unwrap();
    let texture_uploads = backend.upload_count();

    assert!(
        cache
            .unlock_palette(&mut backend, pal, Some(palette_bytes(0x20)))
            .unwrap()
    );
    assert!(cache.live_set().contains(CacheKey::new(small, Some(pal))));
    assert!(cache.is_stale(wide, Some(pal)));

    cache.resolve(&mut backend, small, Some(pal)).unwrap();
    assert_eq!(backend.upload_count(), texture_uploads);
    assert_eq!(cache.stats().palette_uploads, 2);
    let colors = backend.buffer_data(cache.palette_buffer()).unwrap();
    assert_eq!(&colors[4..8], &[0x20; 4]);

    let TextureBinding::Standalone(handle) =
        cache.resolve(&mut backend, wide, Some(pal)).unwrap().binding
    else {
        panic!("expected standalone placement");
    };
    assert_eq!(&backend.texture_data(handle).unwrap()[..4], &[0x20; 4]);
    assert_eq!(cache.stats().stale_reuses, 1);
}

#[test]
fn unchanged_palette_unlock_is_ignored() {
    let (mut backend, mut cache) = setup();
    let pal = palette(&mut cache, 0x10);
    assert!(
        !cache
            .unlock_palette(&mut backend, pal, Some(palette_bytes(0x10)))
            .unwrap()
    );
    assert!(!cache.unlock_palette(&mut backend, pal, None).unwrap());
}

#[test]
fn destroy_palette_frees_slot_and_entries() {
    let (mut backend, mut cache) = setup();
    let tex = indexed(&mut cache, 4, 4, 1);
    let p1 = palette(&mut cache, 1);
    let p2 = palette(&mut cache, 2);
    cache.resolve(&mut backend, tex, Some(p1)).unwrap();
    cache.resolve(&mut backend, tex, Some(p2)).unwrap();

    cache.destroy_palette(&mut backend, p1).unwrap();
    assert_eq!(cache.palette_slots_live(), 1);
    assert_eq!(cache.atlas_layers_live(), 1);
    assert!(cache.live_set().contains(CacheKey::new(tex, Some(p2))));
    assert!(!cache.live_set().contains_palette(p1));
    assert_eq!(cache.palette_count(), 1);
}

#[test]
fn indexed_texture_without_palette_is_rejected() {
    let (mut backend, mut cache) = setup();
    let tex = indexed(&mut cache, 4, 4, 1);
    assert!(matches!(
        cache.resolve(&mut backend, tex, None),
        Err(CacheError::MissingPalette { .. })
    ));
    assert!(cache.live_set().is_empty());
}

#[test]
fn texture_without_pixels_is_not_ready_until_unlocked() {
    let (mut backend, mut cache) = setup();
    let tex = cache
        .register_texture(TextureDesc {
            format: PixelFormat::Indexed8,
            width: 2,
            height: 2,
            pixels: None,
        })
        .unwrap();
    let pal = palette(&mut cache, 1);

    assert!(matches!(
        cache.resolve(&mut backend, tex, Some(pal)),
        Err(CacheError::ResourceNotReady { kind: "texture" })
    ));
    assert!(cache.unlock_texture(&mut backend, tex, Some(vec![4; 4])).unwrap());
    assert!(cache.resolve(&mut backend, tex, Some(pal)).is_ok());
}

#[test]
fn unknown_ids_are_invalid_handles() {
    let (mut backend, mut cache) = setup();
    let ghost = TextureId::new(7).unwrap();
    assert!(matches!(
        cache.resolve(&mut backend, ghost, None),
        Err(CacheError::InvalidHandle { kind: "texture", id: 7 })
    ));
    assert!(cache.destroy_texture(&mut backend, ghost).is_err());
    let ghost_palette = PaletteId::new(3).unwrap();
    assert!(cache.destroy_palette(&mut backend, ghost_palette).is_err());
}

#[test]
fn region_update_uploads_only_the_touched_rect() {
    let (mut backend, mut cache) = setup();
    let tex = indexed(&mut cache, 8, 8, 0);
    let pal = palette(&mut cache, 1);
    let layer = cache
        .resolve(&mut backend, tex, Some(pal))
        .unwrap()
        .binding
        .atlas_layer()
        .unwrap();

    cache
        .update_texture_region(tex, TextureRect::new(1, 1, 2, 2), &[1, 2, 3, 4])
        .unwrap();
    cache
        .update_texture_region(tex, TextureRect::new(4, 1, 1, 1), &[5])
        .unwrap();
    cache.resolve(&mut backend, tex, Some(pal)).unwrap();

    let uploads = backend.uploads_to(cache.atlas_texture());
    assert_eq!(uploads.len(), 2);
    assert_eq!(
        uploads[1],
        TextureRegion {
            x: 1,
            y: 1,
            layer: layer.raw(),
            width: 4,
            height: 2,
        }
    );
    assert_eq!(cache.stats().region_uploads, 1);
    let atlas = backend.texture_data(cache.atlas_texture()).unwrap();
    assert_eq!(&atlas[TILE as usize + 1..TILE as usize + 5], &[1, 2, 0, 5]);
}

#[test]
fn texture_table_is_bounded() {
    let (_, mut cache) = setup();
    for _ in 0..8 {
        indexed(&mut cache, 1, 1, 0);
    }
    let err = cache
        .register_texture(TextureDesc {
            format: PixelFormat::Indexed8,
            width: 1,
            height: 1,
            pixels: Some(vec![0]),
        })
        .unwrap_err();
    assert!(matches!(
        err,
        CacheError::CapacityExceeded {
            what: "texture",
            capacity: 8
        }
    ));
}

#[test]
fn zero_capacity_config_is_rejected() {
    let mut backend = HeadlessBackend::new(HeadlessConfig::default());
    let config = CacheConfig {
        palette_slots: 0,
        ..config()
    };
    assert!(matches!(
        ResourceCache::new(&mut backend, config),
        Err(CacheError::InvalidDescriptor(_))
    ));
    assert_eq!(backend.texture_count(), 0);
}

#[test]
fn shutdown_releases_device_objects() {
    let (mut backend, mut cache) = setup();
    let tex = indexed(&mut cache, TILE * 2, 1, 1);
    let pal = palette(&mut cache, 1);
    cache.resolve(&mut backend, tex, Some(pal)).unwrap();
    assert_eq!(backend.texture_count(), 2);

    cache.destroy(&mut backend);
    assert_eq!(backend.texture_count(), 0);
}
