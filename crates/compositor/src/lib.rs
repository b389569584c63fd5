//! Frame-level entry point for paletted sprite drawing.
//!
//! [`CompositorContext`] owns the resource cache, the batch queue, the
//! frame buffer ring and one device backend. Game code opens a frame,
//! binds textures through combined handles, queues quads, renders, and
//! closes the frame. Per-draw problems (unknown handles, textures without
//! data, a full task queue) are logged and the draw is skipped; only
//! construction can fail outright.

mod backend;
mod config;
mod context;

use frame_ring::FrameRingError;
use gpu_backend::BackendError;
use resource_cache::CacheError;
use thiserror::Error;

pub use backend::create_backend;
pub use config::{BackendKind, CompositorConfig};
pub use context::CompositorContext;

#[derive(Debug, Error)]
pub enum CompositorError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("configuration parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    FrameRing(#[from] FrameRingError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Counters for one frame, reset by `begin_frame`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub tasks: u32,
    pub batches: u32,
    pub draw_calls: u32,
    /// Tasks lost to a full queue.
    pub dropped: u32,
    /// Textured draws skipped because no texture was bound.
    pub skipped: u32,
    pub uploads: u32,
    pub fence_timeouts: u32,
    pub draw_errors: u32,
}
