//! Device collaborator interface for the sprite compositor.
//!
//! The compositor only talks to a device through [`Backend`]. Three
//! implementations are provided: [`HeadlessBackend`] records commands and
//! simulates fence latency, [`SoftwareBackend`] rasterizes on the CPU, and
//! `WgpuBackend` (feature `wgpu`) drives a real GPU.

mod headless;
mod host;
mod software;
#[cfg(feature = "wgpu")]
mod wgpu_backend;

use std::time::Duration;

use render_protocol::{
    Color, DeviceBufferHandle, DeviceTextureHandle, FenceHandle, INDICES_PER_QUAD,
};
use thiserror::Error;

pub use headless::{HeadlessBackend, HeadlessCommand, HeadlessConfig};
pub use software::{SoftwareBackend, SoftwareConfig};
#[cfg(feature = "wgpu")]
pub use wgpu_backend::{WgpuBackend, WgpuBackendConfig, request_device};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    /// Normalized RGBA, 4 bytes per texel.
    Rgba8,
    /// Unsigned palette index, 1 byte per texel.
    Index8,
}

impl TextureFormat {
    pub const fn bytes_per_texel(self) -> u32 {
        match self {
            TextureFormat::Rgba8 => 4,
            TextureFormat::Index8 => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureDesc {
    pub label: &'static str,
    pub format: TextureFormat,
    pub width: u32,
    pub height: u32,
    /// Array layers; 1 for a plain 2D texture.
    pub layers: u32,
}

impl TextureDesc {
    pub const fn layer_len(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_texel() as usize
    }
}

/// Destination of an upload. Source bytes are tightly packed rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureRegion {
    pub x: u32,
    pub y: u32,
    pub layer: u32,
    pub width: u32,
    pub height: u32,
}

impl TextureRegion {
    pub const fn byte_len(&self, format: TextureFormat) -> usize {
        self.width as usize * self.height as usize * format.bytes_per_texel() as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    Vertex,
    Index,
    /// Per-vertex atlas layer and palette slot.
    Attributes,
    /// RGBA8 palette colors, read by atlas draws.
    Palette,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DrawBinding {
    /// Index atlas plus palette buffer; layer and slot come from the
    /// attribute buffer.
    Atlas {
        atlas: DeviceTextureHandle,
        palettes: DeviceBufferHandle,
    },
    Texture(DeviceTextureHandle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DrawCall {
    pub vertices: DeviceBufferHandle,
    pub attributes: DeviceBufferHandle,
    pub indices: DeviceBufferHandle,
    pub binding: DrawBinding,
    pub first_index: u32,
    pub index_count: u32,
    pub instance_count: u32,
}

impl DrawCall {
    pub const fn quad_count(&self) -> u32 {
        self.index_count / INDICES_PER_QUAD as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    Signaled,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("unknown {kind} handle")]
    InvalidHandle { kind: &'static str },
    #[error("unsupported texture: {0}")]
    UnsupportedTexture(String),
    #[error("region {region:?} outside texture {width}x{height}x{layers}")]
    RegionOutOfBounds {
        region: TextureRegion,
        width: u32,
        height: u32,
        layers: u32,
    },
    #[error("upload of {actual} bytes, expected {expected}")]
    UploadSizeMismatch { expected: usize, actual: usize },
    #[error("write of {len} bytes at {offset} overflows buffer of {size}")]
    BufferOverflow { offset: u64, len: usize, size: u64 },
    #[error("buffer is already mapped")]
    AlreadyMapped,
    #[error("no frame in progress")]
    NoFrame,
    #[error("device request failed: {0}")]
    DeviceUnavailable(String),
}

/// Capability set the compositor needs from a graphics device.
///
/// Device objects are referred to by slotmap keys so stale handles are
/// detected instead of aliasing new objects.
pub trait Backend {
    fn name(&self) -> &'static str;

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<DeviceTextureHandle, BackendError>;

    fn upload_region(
        &mut self,
        texture: DeviceTextureHandle,
        region: TextureRegion,
        bytes: &[u8],
    ) -> Result<(), BackendError>;

    fn destroy_texture(&mut self, texture: DeviceTextureHandle);

    fn create_buffer(
        &mut self,
        size: u64,
        usage: BufferUsage,
    ) -> Result<DeviceBufferHandle, BackendError>;

    /// CPU view of the whole buffer. Must be paired with [`Backend::unmap_buffer`].
    fn map_buffer(&mut self, buffer: DeviceBufferHandle) -> Result<&mut [u8], BackendError>;

    /// Makes the first `written` bytes of the mapping visible to the device.
    fn unmap_buffer(&mut self, buffer: DeviceBufferHandle, written: u64);

    /// Queued write, ordered before the next submit.
    fn write_buffer(
        &mut self,
        buffer: DeviceBufferHandle,
        offset: u64,
        bytes: &[u8],
    ) -> Result<(), BackendError>;

    fn destroy_buffer(&mut self, buffer: DeviceBufferHandle);

    fn begin_frame(&mut self, clear: Color) -> Result<(), BackendError>;

    fn draw(&mut self, call: &DrawCall) -> Result<(), BackendError>;

    /// Submits the frame's draws and returns a fence that signals once
    /// the device has finished them.
    fn submit(&mut self) -> Result<FenceHandle, BackendError>;

    fn wait_fence(&mut self, fence: FenceHandle, timeout: Duration) -> FenceStatus;

    fn release_fence(&mut self, fence: FenceHandle);

    fn end_frame(&mut self) -> Result<(), BackendError>;
}

impl<B: Backend + ?Sized> Backend for Box<B> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<DeviceTextureHandle, BackendError> {
        (**self).create_texture(desc)
    }

    fn upload_region(
        &mut self,
        texture: DeviceTextureHandle,
        region: TextureRegion,
        bytes: &[u8],
    ) -> Result<(), BackendError> {
        (**self).upload_region(texture, region, bytes)
    }

    fn destroy_texture(&mut self, texture: DeviceTextureHandle) {
        (**self).destroy_texture(texture)
    }

    fn create_buffer(
        &mut self,
        size: u64,
        usage: BufferUsage,
    ) -> Result<DeviceBufferHandle, BackendError> {
        (**self).create_buffer(size, usage)
    }

    fn map_buffer(&mut self, buffer: DeviceBufferHandle) -> Result<&mut [u8], BackendError> {
        (**self).map_buffer(buffer)
    }

    fn unmap_buffer(&mut self, buffer: DeviceBufferHandle, written: u64) {
        (**self).unmap_buffer(buffer, written)
    }

    fn write_buffer(
        &mut self,
        buffer: DeviceBufferHandle,
        offset: u64,
        bytes: &[u8],
    ) -> Result<(), BackendError> {
        (**self).write_buffer(buffer, offset, bytes)
    }

    fn destroy_buffer(&mut self, buffer: DeviceBufferHandle) {
        (**self).destroy_buffer(buffer)
    }

    fn begin_frame(&mut self, clear: Color) -> Result<(), BackendError> {
        (**self).begin_frame(clear)
    }

    fn draw(&mut self, call: &DrawCall) -> Result<(), BackendError> {
        (**self).draw(call)
    }

    fn submit(&mut self) -> Result<FenceHandle, BackendError> {
        (**self).submit()
    }

    fn wait_fence(&mut self, fence: FenceHandle, timeout: Duration) -> FenceStatus {
        (**self).wait_fence(fence, timeout)
    }

    fn release_fence(&mut self, fence: FenceHandle) {
        (**self).release_fence(fence)
    }

    fn end_frame(&mut self) -> Result<(), BackendError> {
        (**self).end_frame()
    }
}
