use std::time::Duration;

use atlas::AtlasLayout;
use batching::CoalesceMode;
use frame_ring::FrameRingConfig;
use resource_cache::CacheConfig;
use serde::{Deserialize, Serialize};

use crate::CompositorError;

/// Device implementation chosen at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Records commands without drawing.
    #[default]
    Headless,
    /// CPU rasterizer into an RGBA canvas.
    Software,
    /// GPU through wgpu. Needs the `wgpu` feature.
    Wgpu,
}

/// Compositor tuning. Every field has a default, so a JSON override only
/// needs the keys it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompositorConfig {
    pub backend: BackendKind,
    /// Render tasks per frame; also the quad capacity of each frame buffer.
    pub max_render_tasks: usize,
    pub destroy_queue_capacity: usize,
    pub max_textures: usize,
    pub max_palettes: usize,
    pub atlas_layers: u32,
    pub atlas_tile_size: u32,
    pub palette_slots: u32,
    pub live_set_hint: usize,
    pub frame_buffers: usize,
    pub fence_timeout_ms: u64,
    pub canvas_width: u32,
    pub canvas_height: u32,
    /// Depth range that normalized vertex `z` is mapped onto.
    pub z_max: f32,
    pub coalesce: CoalesceMode,
    /// `0xAARRGGBB`.
    pub clear_color: u32,
}

impl Default for CompositorConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            max_render_tasks: batching::DEFAULT_TASK_CAPACITY,
            destroy_queue_capacity: resource_cache::DEFAULT_DESTROY_QUEUE,
            max_textures: resource_cache::DEFAULT_MAX_TEXTURES,
            max_palettes: resource_cache::DEFAULT_MAX_PALETTES,
            atlas_layers: atlas::DEFAULT_ATLAS_LAYERS,
            atlas_tile_size: atlas::DEFAULT_TILE_SIZE,
            palette_slots: atlas::DEFAULT_PALETTE_SLOTS,
            live_set_hint: resource_cache::DEFAULT_LIVE_SET_HINT,
            frame_buffers: frame_ring::DEFAULT_BUFFER_COUNT,
            fence_timeout_ms: 1000,
            canvas_width: 384,
            canvas_height: 224,
            z_max: 65535.0,
            coalesce: CoalesceMode::PerResource,
            clear_color: 0xFF00_0000,
        }
    }
}

impl CompositorConfig {
    /// Defaults overridden by the keys present in `json`.
    pub fn from_json_str(json: &str) -> Result<Self, CompositorError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CompositorError> {
        let counts = [
            ("max_render_tasks", self.max_render_tasks),
            ("frame_buffers", self.frame_buffers),
            ("canvas_width", self.canvas_width as usize),
            ("canvas_height", self.canvas_height as usize),
        ];
        if let Some((name, _)) = counts.iter().find(|(_, value)| *value == 0) {
            return Err(CompositorError::Config(format!("{name} must be non-zero")));
        }
        if self.max_render_tasks > u32::MAX as usize / 4 {
            return Err(CompositorError::Config(format!(
                "max_render_tasks {} is too large",
                self.max_render_tasks
            )));
        }
        if !self.z_max.is_finite() || self.z_max <= 0.0 {
            return Err(CompositorError::Config(format!(
                "z_max must be positive, got {}",
                self.z_max
            )));
        }
        self.cache_config()
            .validate()
            .map_err(|err| CompositorError::Config(err.to_string()))
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_textures: self.max_textures,
            max_palettes: self.max_palettes,
            atlas: AtlasLayout {
                layers: self.atlas_layers,
                tile_size: self.atlas_tile_size,
            },
            palette_slots: self.palette_slots,
            destroy_queue_capacity: self.destroy_queue_capacity,
            live_set_hint: self.live_set_hint,
        }
    }

    pub fn frame_ring_config(&self) -> FrameRingConfig {
        FrameRingConfig {
            buffer_count: self.frame_buffers,
            max_quads: self.max_render_tasks as u32,
            fence_timeout: Duration::from_millis(self.fence_timeout_ms),
        }
    }

    /// Sort key for a vertex `z` in `-1..=1`. Larger `z` is further back,
    /// so it gets a smaller key and is painted first.
    pub fn depth_of(&self, z: f32) -> f32 {
        (1.0 - z) * 0.5 * self.z_max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_hardware_budgets() {
        let config = CompositorConfig::default();
        assert_eq!(config.max_render_tasks, 8192);
        assert_eq!(config.destroy_queue_capacity, 1024);
        assert_eq!(config.atlas_layers, 128);
        assert_eq!(config.atlas_tile_size, 512);
        assert_eq!(config.palette_slots, 1088);
        assert_eq!(config.frame_buffers, 3);
        assert_eq!(config.frame_ring_config().fence_timeout, Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn json_overrides_only_named_keys() {
        let config = CompositorConfig::from_json_str(
            r#"{ "backend": "software", "frame_buffers": 1, "coalesce": "shared_atlas" }"#,
        )
        .unwrap();
        assert_eq!(config.backend, BackendKind::Software);
        assert_eq!(config.frame_buffers, 1);
        assert_eq!(config.coalesce, CoalesceMode::SharedAtlas);
        assert_eq!(config.max_render_tasks, 8192);
    }

    #[test]
    fn unknown_keys_and_zero_capacities_are_rejected() {
        assert!(matches!(
            CompositorConfig::from_json_str(r#"{ "frame_bufers": 2 }"#),
            Err(CompositorError::ConfigParse(_))
        ));
        assert!(matches!(
            CompositorConfig::from_json_str(r#"{ "palette_slots": 0 }"#),
            Err(CompositorError::Config(_))
        ));
        assert!(matches!(
            CompositorConfig::from_json_str(r#"{ "max_render_tasks": 0 }"#),
            Err(CompositorError::Config(_))
        ));
    }

    #[test]
    fn larger_z_sorts_first() {
        let config = CompositorConfig::default();
        assert_eq!(config.depth_of(1.0), 0.0);
        assert_eq!(config.depth_of(-1.0), 65535.0);
        assert!(config.depth_of(0.5) < config.depth_of(0.0));
    }
}
