use std::time::{Duration, Instant};

use render_protocol::{Color, DeviceBufferHandle, DeviceTextureHandle, FenceHandle};
use slotmap::SlotMap;

use crate::host::HostMemory;
use crate::{
    Backend, BackendError, BufferUsage, DrawBinding, DrawCall, FenceStatus, TextureDesc,
    TextureRegion,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadlessConfig {
    /// Time between submit and fence signal.
    pub fence_latency: Duration,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            fence_latency: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HeadlessCommand {
    CreateTexture {
        texture: DeviceTextureHandle,
        desc: TextureDesc,
    },
    Upload {
        texture: DeviceTextureHandle,
        region: TextureRegion,
        len: usize,
    },
    DestroyTexture(DeviceTextureHandle),
    CreateBuffer {
        buffer: DeviceBufferHandle,
        size: u64,
        usage: BufferUsage,
    },
    WriteBuffer {
        buffer: DeviceBufferHandle,
        offset: u64,
        len: usize,
    },
    BeginFrame {
        clear: Color,
    },
    Draw(DrawCall),
    Submit(FenceHandle),
    EndFrame,
}

struct HeadlessFence {
    /// `None` while stalled.
    ready_at: Option<Instant>,
    buffers: Vec<DeviceBufferHandle>,
    released: bool,
}

impl HeadlessFence {
    fn is_signaled(&self, now: Instant) -> bool {
        self.ready_at.is_some_and(|ready_at| ready_at <= now)
    }
}

/// Device stand-in that keeps resources in host memory, records every
/// command, and simulates device latency on fences.
///
/// Mapping a buffer that an unsignaled fence still covers is counted as a
/// hazard: on a real device that write would race the GPU read.
pub struct HeadlessBackend {
    config: HeadlessConfig,
    memory: HostMemory,
    commands: Vec<HeadlessCommand>,
    fences: SlotMap<FenceHandle, HeadlessFence>,
    frame_open: bool,
    frame_buffers: Vec<DeviceBufferHandle>,
    stall_fences: bool,
    hazards: u32,
    fence_waits: u32,
    fence_timeouts: u32,
}

impl HeadlessBackend {
    pub fn new(config: HeadlessConfig) -> Self {
        Self {
            config,
            memory: HostMemory::default(),
            commands: Vec::new(),
            fences: SlotMap::with_key(),
            frame_open: false,
            frame_buffers: Vec::new(),
            stall_fences: false,
            hazards: 0,
            fence_waits: 0,
            fence_timeouts: 0,
        }
    }

    pub fn set_fence_latency(&mut self, latency: Duration) {
        self.config.fence_latency = latency;
    }

    /// While stalled, newly submitted fences never signal on their own.
    pub fn set_stall_fences(&mut self, stall: bool) {
        self.stall_fences = stall;
    }

    /// Completes every outstanding fence, as if the device caught up.
    pub fn signal_all(&mut self) {
        let now = Instant::now();
        for fence in self.fences.values_mut() {
            if !fence.is_signaled(now) {
                fence.ready_at = Some(now);
            }
        }
    }

    pub fn commands(&self) -> &[HeadlessCommand] {
        &self.commands
    }

    pub fn clear_commands(&mut self) {
        self.commands.clear();
    }

    pub fn draws(&self) -> impl Iterator<Item = &DrawCall> {
        self.commands.iter().filter_map(|command| match command {
            HeadlessCommand::Draw(call) => Some(call),
            _ => None,
        })
    }

    pub fn upload_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|command| matches!(command, HeadlessCommand::Upload { .. }))
            .count()
    }

    pub fn uploads_to(&self, texture: DeviceTextureHandle) -> Vec<TextureRegion> {
        self.commands
            .iter()
            .filter_map(|command| match command {
                HeadlessCommand::Upload {
                    texture: target,
                    region,
                    ..
                } if *target == texture => Some(*region),
                _ => None,
            })
            .collect()
    }

    pub fn destroyed_textures(&self) -> Vec<DeviceTextureHandle> {
        self.commands
            .iter()
            .filter_map(|command| match command {
                HeadlessCommand::DestroyTexture(texture) => Some(*texture),
                _ => None,
            })
            .collect()
    }

    pub fn texture_count(&self) -> usize {
        self.memory.textures.len()
    }

    pub fn texture_exists(&self, texture: DeviceTextureHandle) -> bool {
        self.memory.textures.contains_key(texture)
    }

    pub fn texture_data(&self, texture: DeviceTextureHandle) -> Option<&[u8]> {
        self.memory
            .textures
            .get(texture)
            .map(|texture| texture.data.as_slice())
    }

    pub fn buffer_data(&self, buffer: DeviceBufferHandle) -> Option<&[u8]> {
        self.memory
            .buffers
            .get(buffer)
            .map(|buffer| buffer.data.as_slice())
    }

    pub fn hazards(&self) -> u32 {
        self.hazards
    }

    pub fn fence_waits(&self) -> u32 {
        self.fence_waits
    }

    pub fn fence_timeouts(&self) -> u32 {
        self.fence_timeouts
    }

    fn collect_released_fences(&mut self) {
        let now = Instant::now();
        self.fences
            .retain(|_, fence| !(fence.released && fence.is_signaled(now)));
    }

    fn validate_draw(&self, call: &DrawCall) -> Result<(), BackendError> {
        self.memory.buffer(call.vertices)?;
        self.memory.buffer(call.attributes)?;
        let indices = self.memory.buffer(call.indices)?;
        match call.binding {
            DrawBinding::Atlas { atlas, palettes } => {
                self.memory.texture(atlas)?;
                self.memory.buffer(palettes)?;
            }
            DrawBinding::Texture(texture) => {
                self.memory.texture(texture)?;
            }
        }
        let end = (call.first_index as u64 + call.index_count as u64) * 4;
        if end > indices.data.len() as u64 {
            return Err(BackendError::BufferOverflow {
                offset: call.first_index as u64 * 4,
                len: call.index_count as usize * 4,
                size: indices.data.len() as u64,
            });
        }
        Ok(())
    }
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new(HeadlessConfig::default())
    }
}

impl Backend for HeadlessBackend {
    fn name(&self) -> &'static str {
        "headless"
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<DeviceTextureHandle, BackendError> {
        let texture = self.memory.create_texture(desc)?;
        self.commands.push(HeadlessCommand::CreateTexture {
            texture,
            desc: *desc,
        });
        Ok(texture)
    }

    fn upload_region(
        &mut self,
        texture: DeviceTextureHandle,
        region: TextureRegion,
        bytes: &[u8],
    ) -> Result<(), BackendError> {
        self.memory.upload_region(texture, region, bytes)?;
        self.commands.push(HeadlessCommand::Upload {
            texture,
            region,
            len: bytes.len(),
        });
        Ok(())
    }

    fn destroy_texture(&mut self, texture: DeviceTextureHandle) {
        if self.memory.destroy_texture(texture) {
            self.commands.push(HeadlessCommand::DestroyTexture(texture));
        } else {
            log::warn!("headless: destroy of unknown texture {texture:?}");
        }
    }

    fn create_buffer(
        &mut self,
        size: u64,
        usage: BufferUsage,
    ) -> Result<DeviceBufferHandle, BackendError> {
        let buffer = self.memory.create_buffer(size);
        self.commands
            .push(HeadlessCommand::CreateBuffer { buffer, size, usage });
        Ok(buffer)
    }

    fn map_buffer(&mut self, buffer: DeviceBufferHandle) -> Result<&mut [u8], BackendError> {
        let now = Instant::now();
        let racing = self
            .fences
            .values()
            .any(|fence| !fence.is_signaled(now) && fence.buffers.contains(&buffer));
        if racing {
            self.hazards += 1;
            log::error!("headless: buffer {buffer:?} mapped while the device may still read it");
        }
        self.memory.map_buffer(buffer)
    }

    fn unmap_buffer(&mut self, buffer: DeviceBufferHandle, written: u64) {
        self.memory.unmap_buffer(buffer);
        self.commands.push(HeadlessCommand::WriteBuffer {
            buffer,
            offset: 0,
            len: written as usize,
        });
    }

    fn write_buffer(
        &mut self,
        buffer: DeviceBufferHandle,
        offset: u64,
        bytes: &[u8],
    ) -> Result<(), BackendError> {
        self.memory.write_buffer(buffer, offset, bytes)?;
        self.commands.push(HeadlessCommand::WriteBuffer {
            buffer,
            offset,
            len: bytes.len(),
        });
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: DeviceBufferHandle) {
        self.memory.destroy_buffer(buffer);
    }

    fn begin_frame(&mut self, clear: Color) -> Result<(), BackendError> {
        self.frame_open = true;
        self.frame_buffers.clear();
        self.commands.push(HeadlessCommand::BeginFrame { clear });
        Ok(())
    }

    fn draw(&mut self, call: &DrawCall) -> Result<(), BackendError> {
        if !self.frame_open {
            return Err(BackendError::NoFrame);
        }
        self.validate_draw(call)?;
        for buffer in [call.vertices, call.attributes, call.indices] {
            if !self.frame_buffers.contains(&buffer) {
                self.frame_buffers.push(buffer);
            }
        }
        self.commands.push(HeadlessCommand::Draw(*call));
        Ok(())
    }

    fn submit(&mut self) -> Result<FenceHandle, BackendError> {
        if !self.frame_open {
            return Err(BackendError::NoFrame);
        }
        self.collect_released_fences();
        let ready_at = if self.stall_fences {
            None
        } else {
            Some(Instant::now() + self.config.fence_latency)
        };
        let fence = self.fences.insert(HeadlessFence {
            ready_at,
            buffers: std::mem::take(&mut self.frame_buffers),
            released: false,
        });
        self.commands.push(HeadlessCommand::Submit(fence));
        Ok(fence)
    }

    fn wait_fence(&mut self, fence: FenceHandle, timeout: Duration) -> FenceStatus {
        let Some(state) = self.fences.get(fence) else {
            return FenceStatus::Signaled;
        };
        let now = Instant::now();
        if state.is_signaled(now) {
            return FenceStatus::Signaled;
        }
        self.fence_waits += 1;
        match state.ready_at {
            Some(ready_at) if ready_at - now <= timeout => {
                std::thread::sleep(ready_at - now);
                FenceStatus::Signaled
            }
            _ => {
                std::thread::sleep(timeout);
                self.fence_timeouts += 1;
                FenceStatus::TimedOut
            }
        }
    }

    fn release_fence(&mut self, fence: FenceHandle) {
        if let Some(state) = self.fences.get_mut(fence) {
            state.released = true;
        }
    }

    fn end_frame(&mut self) -> Result<(), BackendError> {
        self.frame_open = false;
        self.commands.push(HeadlessCommand::EndFrame);
        Ok(())
    }
}
