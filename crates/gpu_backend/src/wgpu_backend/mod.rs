//! `wgpu` device: an R8Uint layered atlas read through a storage palette
//! buffer, plus RGBA standalone textures, rendered into an offscreen canvas.

mod pipelines;

use std::collections::HashMap;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use render_protocol::{Color, DeviceBufferHandle, DeviceTextureHandle, FenceHandle};
use slotmap::SlotMap;

use crate::host::{validate_texture_desc, validate_upload};
use crate::{
    Backend, BackendError, BufferUsage, DrawBinding, DrawCall, FenceStatus, TextureDesc,
    TextureFormat, TextureRegion,
};
use pipelines::SpritePipelines;

pub const CANVAS_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WgpuBackendConfig {
    pub canvas_width: u32,
    pub canvas_height: u32,
}

impl Default for WgpuBackendConfig {
    fn default() -> Self {
        Self {
            canvas_width: 384,
            canvas_height: 224,
        }
    }
}

/// Requests a device from the first adapter that does not need a surface.
pub fn request_device() -> Result<(wgpu::Device, wgpu::Queue), BackendError> {
    pollster::block_on(async {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|error| BackendError::DeviceUnavailable(error.to_string()))?;
        let limits = adapter.limits();
        adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("sprite compositor"),
                required_features: wgpu::Features::empty(),
                required_limits: limits,
                experimental_features: wgpu::ExperimentalFeatures::disabled(),
                memory_hints: wgpu::MemoryHints::Performance,
                trace: wgpu::Trace::Off,
            })
            .await
            .map_err(|error| BackendError::DeviceUnavailable(error.to_string()))
    })
}

struct GpuTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    desc: TextureDesc,
}

struct GpuBuffer {
    buffer: wgpu::Buffer,
    shadow: Vec<u8>,
    usage: BufferUsage,
    mapped: bool,
}

enum GpuFence {
    Pending(mpsc::Receiver<()>),
    Signaled,
}

pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    config: WgpuBackendConfig,
    canvas: wgpu::Texture,
    canvas_view: wgpu::TextureView,
    canvas_bind_group: wgpu::BindGroup,
    pipelines: SpritePipelines,
    textures: SlotMap<DeviceTextureHandle, GpuTexture>,
    buffers: SlotMap<DeviceBufferHandle, GpuBuffer>,
    fences: SlotMap<FenceHandle, GpuFence>,
    bind_groups: HashMap<DrawBinding, wgpu::BindGroup>,
    frame_draws: Vec<DrawCall>,
    pending_clear: Option<Color>,
    frame_open: bool,
}

const fn align_to_copy(size: u64) -> u64 {
    size.next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT)
}

impl WgpuBackend {
    pub fn new(device: wgpu::Device, queue: wgpu::Queue, config: WgpuBackendConfig) -> Self {
        let canvas = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("sprite.canvas"),
            size: wgpu::Extent3d {
                width: config.canvas_width,
                height: config.canvas_height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: CANVAS_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let canvas_view = canvas.create_view(&wgpu::TextureViewDescriptor::default());
        let pipelines = SpritePipelines::new(&device, CANVAS_FORMAT);

        let canvas_uniform = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("sprite.canvas_uniform"),
            size: 16,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let canvas_size = [
            config.canvas_width as f32,
            config.canvas_height as f32,
            0.0,
            0.0,
        ];
        queue.write_buffer(&canvas_uniform, 0, bytemuck::cast_slice(&canvas_size));
        let canvas_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("sprite.canvas_bind_group"),
            layout: &pipelines.canvas_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: canvas_uniform.as_entire_binding(),
            }],
        });

        Self {
            device,
            queue,
            config,
            canvas,
            canvas_view,
            canvas_bind_group,
            pipelines,
            textures: SlotMap::with_key(),
            buffers: SlotMap::with_key(),
            fences: SlotMap::with_key(),
            bind_groups: HashMap::new(),
            frame_draws: Vec::new(),
            pending_clear: None,
            frame_open: false,
        }
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn canvas_texture(&self) -> &wgpu::Texture {
        &self.canvas
    }

    /// Copies the canvas back to the CPU as tightly packed RGBA8 rows.
    pub fn read_canvas(&self) -> Result<Vec<u8>, BackendError> {
        let width = self.config.canvas_width;
        let height = self.config.canvas_height;
        let row_bytes = width * 4;
        let padded_row = row_bytes.next_multiple_of(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);
        let readback = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("sprite.canvas_readback"),
            size: padded_row as u64 * height as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("sprite.canvas_readback"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &self.canvas,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &readback,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(Some(encoder.finish()));

        let slice = readback.slice(..);
        let (sender, receiver) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device
            .poll(wgpu::PollType::wait_indefinitely())
            .map_err(|error| BackendError::DeviceUnavailable(error.to_string()))?;
        receiver
            .recv()
            .map_err(|error| BackendError::DeviceUnavailable(error.to_string()))?
            .map_err(|error| BackendError::DeviceUnavailable(error.to_string()))?;

        let mapped = slice.get_mapped_range();
        let mut pixels = Vec::with_capacity((row_bytes * height) as usize);
        for row in mapped.chunks_exact(padded_row as usize) {
            pixels.extend_from_slice(&row[..row_bytes as usize]);
        }
        drop(mapped);
        readback.unmap();
        Ok(pixels)
    }

    fn bind_group_for(&mut self, binding: DrawBinding) -> Result<(), BackendError> {
        if self.bind_groups.contains_key(&binding) {
            return Ok(());
        }
        let bind_group = match binding {
            DrawBinding::Atlas { atlas, palettes } => {
                let atlas = self
                    .textures
                    .get(atlas)
                    .ok_or(BackendError::InvalidHandle { kind: "texture" })?;
                let palettes = self
                    .buffers
                    .get(palettes)
                    .ok_or(BackendError::InvalidHandle { kind: "buffer" })?;
                self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("sprite.atlas_bind_group"),
                    layout: &self.pipelines.atlas_layout,
                    entries: &[
                        wgpu::BindGroupEntry {
                            binding: 0,
                            resource: wgpu::BindingResource::TextureView(&atlas.view),
                        },
                        wgpu::BindGroupEntry {
                            binding: 1,
                            resource: palettes.buffer.as_entire_binding(),
                        },
                    ],
                })
            }
            DrawBinding::Texture(texture) => {
                let texture = self
                    .textures
                    .get(texture)
                    .ok_or(BackendError::InvalidHandle { kind: "texture" })?;
                self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("sprite.texture_bind_group"),
                    layout: &self.pipelines.texture_layout,
                    entries: &[
                        wgpu::BindGroupEntry {
                            binding: 0,
                            resource: wgpu::BindingResource::TextureView(&texture.view),
                        },
                        wgpu::BindGroupEntry {
                            binding: 1,
                            resource: wgpu::BindingResource::Sampler(&self.pipelines.sampler),
                        },
                    ],
                })
            }
        };
        self.bind_groups.insert(binding, bind_group);
        Ok(())
    }

    fn encode_frame(&mut self, draws: &[DrawCall]) -> wgpu::CommandBuffer {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("sprite.frame"),
            });
        let load = match self.pending_clear.take() {
            Some(clear) => wgpu::LoadOp::Clear(wgpu::Color {
                r: clear.r as f64 / 255.0,
                g: clear.g as f64 / 255.0,
                b: clear.b as f64 / 255.0,
                a: clear.a as f64 / 255.0,
            }),
            None => wgpu::LoadOp::Load,
        };
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("sprite.frame"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &self.canvas_view,
                    resolve_target: None,
                    depth_slice: None,
                    ops: wgpu::Operations {
                        load,
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
                multiview_mask: None,
            });
            pass.set_bind_group(0, &self.canvas_bind_group, &[]);
            for call in draws {
                let (Some(bind_group), Some(vertices), Some(attributes), Some(indices)) = (
                    self.bind_groups.get(&call.binding),
                    self.buffers.get(call.vertices),
                    self.buffers.get(call.attributes),
                    self.buffers.get(call.indices),
                ) else {
                    log::warn!("wgpu: draw references a destroyed resource, skipped");
                    continue;
                };
                match call.binding {
                    DrawBinding::Atlas { .. } => {
                        pass.set_pipeline(&self.pipelines.atlas);
                        pass.set_vertex_buffer(1, attributes.buffer.slice(..));
                    }
                    DrawBinding::Texture(_) => pass.set_pipeline(&self.pipelines.texture),
                }
                pass.set_bind_group(1, bind_group, &[]);
                pass.set_vertex_buffer(0, vertices.buffer.slice(..));
                pass.set_index_buffer(indices.buffer.slice(..), wgpu::IndexFormat::Uint32);
                let first = call.first_index;
                pass.draw_indexed(
                    first..first + call.index_count,
                    0,
                    0..call.instance_count.max(1),
                );
            }
        }
        encoder.finish()
    }
}

impl Backend for WgpuBackend {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<DeviceTextureHandle, BackendError> {
        validate_texture_desc(desc)?;
        let (format, view_dimension) = match desc.format {
            TextureFormat::Index8 => (
                wgpu::TextureFormat::R8Uint,
                wgpu::TextureViewDimension::D2Array,
            ),
            TextureFormat::Rgba8 if desc.layers == 1 => (
                wgpu::TextureFormat::Rgba8Unorm,
                wgpu::TextureViewDimension::D2,
            ),
            TextureFormat::Rgba8 => {
                return Err(BackendError::UnsupportedTexture(format!(
                    "{}: layered RGBA textures are not supported",
                    desc.label
                )));
            }
        };
        let limits = self.device.limits();
        if desc.width > limits.max_texture_dimension_2d
            || desc.height > limits.max_texture_dimension_2d
            || desc.layers > limits.max_texture_array_layers
        {
            return Err(BackendError::UnsupportedTexture(format!(
                "{} ({}x{}x{}) exceeds device limits",
                desc.label, desc.width, desc.height, desc.layers
            )));
        }
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(desc.label),
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: desc.layers,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some(desc.label),
            dimension: Some(view_dimension),
            ..Default::default()
        });
        Ok(self.textures.insert(GpuTexture {
            texture,
            view,
            desc: *desc,
        }))
    }

    fn upload_region(
        &mut self,
        texture: DeviceTextureHandle,
        region: TextureRegion,
        bytes: &[u8],
    ) -> Result<(), BackendError> {
        let target = self
            .textures
            .get(texture)
            .ok_or(BackendError::InvalidHandle { kind: "texture" })?;
        validate_upload(&target.desc, region, bytes)?;
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &target.texture,
                mip_level: 0,
                origin: wgpu::Origin3d {
                    x: region.x,
                    y: region.y,
                    z: region.layer,
                },
                aspect: wgpu::TextureAspect::All,
            },
            bytes,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(region.width * target.desc.format.bytes_per_texel()),
                rows_per_image: Some(region.height),
            },
            wgpu::Extent3d {
                width: region.width,
                height: region.height,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    fn destroy_texture(&mut self, texture: DeviceTextureHandle) {
        if self.textures.remove(texture).is_none() {
            log::warn!("wgpu: destroy of unknown texture {texture:?}");
            return;
        }
        self.bind_groups.retain(|binding, _| match binding {
            DrawBinding::Atlas { atlas, .. } => *atlas != texture,
            DrawBinding::Texture(bound) => *bound != texture,
        });
    }

    fn create_buffer(
        &mut self,
        size: u64,
        usage: BufferUsage,
    ) -> Result<DeviceBufferHandle, BackendError> {
        let size = align_to_copy(size.max(4));
        let usages = match usage {
            BufferUsage::Vertex | BufferUsage::Attributes => wgpu::BufferUsages::VERTEX,
            BufferUsage::Index => wgpu::BufferUsages::INDEX,
            BufferUsage::Palette => wgpu::BufferUsages::STORAGE,
        };
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(match usage {
                BufferUsage::Vertex => "sprite.vertices",
                BufferUsage::Attributes => "sprite.attributes",
                BufferUsage::Index => "sprite.indices",
                BufferUsage::Palette => "sprite.palettes",
            }),
            size,
            usage: usages | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Ok(self.buffers.insert(GpuBuffer {
            buffer,
            shadow: vec![0; size as usize],
            usage,
            mapped: false,
        }))
    }

    fn map_buffer(&mut self, buffer: DeviceBufferHandle) -> Result<&mut [u8], BackendError> {
        let buffer = self
            .buffers
            .get_mut(buffer)
            .ok_or(BackendError::InvalidHandle { kind: "buffer" })?;
        if buffer.mapped {
            return Err(BackendError::AlreadyMapped);
        }
        buffer.mapped = true;
        Ok(&mut buffer.shadow)
    }

    fn unmap_buffer(&mut self, buffer: DeviceBufferHandle, written: u64) {
        let Some(buffer) = self.buffers.get_mut(buffer) else {
            return;
        };
        buffer.mapped = false;
        let len = align_to_copy(written).min(buffer.shadow.len() as u64) as usize;
        if len > 0 {
            self.queue
                .write_buffer(&buffer.buffer, 0, &buffer.shadow[..len]);
        }
    }

    fn write_buffer(
        &mut self,
        buffer: DeviceBufferHandle,
        offset: u64,
        bytes: &[u8],
    ) -> Result<(), BackendError> {
        let target = self
            .buffers
            .get_mut(buffer)
            .ok_or(BackendError::InvalidHandle { kind: "buffer" })?;
        let size = target.shadow.len() as u64;
        let aligned = offset % wgpu::COPY_BUFFER_ALIGNMENT == 0
            && bytes.len() as u64 % wgpu::COPY_BUFFER_ALIGNMENT == 0;
        if !aligned || offset + bytes.len() as u64 > size {
            return Err(BackendError::BufferOverflow {
                offset,
                len: bytes.len(),
                size,
            });
        }
        let start = offset as usize;
        target.shadow[start..start + bytes.len()].copy_from_slice(bytes);
        self.queue.write_buffer(&target.buffer, offset, bytes);
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: DeviceBufferHandle) {
        let Some(removed) = self.buffers.remove(buffer) else {
            return;
        };
        if removed.usage == BufferUsage::Palette {
            self.bind_groups.retain(|binding, _| match binding {
                DrawBinding::Atlas { palettes, .. } => *palettes != buffer,
                DrawBinding::Texture(_) => true,
            });
        }
    }

    fn begin_frame(&mut self, clear: Color) -> Result<(), BackendError> {
        self.pending_clear = Some(clear);
        self.frame_draws.clear();
        self.frame_open = true;
        Ok(())
    }

    fn draw(&mut self, call: &DrawCall) -> Result<(), BackendError> {
        if !self.frame_open {
            return Err(BackendError::NoFrame);
        }
        for buffer in [call.vertices, call.attributes, call.indices] {
            if !self.buffers.contains_key(buffer) {
                return Err(BackendError::InvalidHandle { kind: "buffer" });
            }
        }
        self.bind_group_for(call.binding)?;
        self.frame_draws.push(*call);
        Ok(())
    }

    fn submit(&mut self) -> Result<FenceHandle, BackendError> {
        if !self.frame_open {
            return Err(BackendError::NoFrame);
        }
        let draws = std::mem::take(&mut self.frame_draws);
        let commands = self.encode_frame(&draws);
        self.frame_draws = draws;
        self.frame_draws.clear();
        self.queue.submit(Some(commands));

        let (sender, receiver) = mpsc::channel();
        self.queue.on_submitted_work_done(move || {
            let _ = sender.send(());
        });
        Ok(self.fences.insert(GpuFence::Pending(receiver)))
    }

    fn wait_fence(&mut self, fence: FenceHandle, timeout: Duration) -> FenceStatus {
        let deadline = Instant::now() + timeout;
        let signaled = loop {
            let Some(GpuFence::Pending(receiver)) = self.fences.get(fence) else {
                return FenceStatus::Signaled;
            };
            if let Err(error) = self.device.poll(wgpu::PollType::Poll) {
                log::error!("wgpu: device poll failed while waiting on fence: {error}");
            }
            match receiver.try_recv() {
                Ok(()) => break true,
                Err(mpsc::TryRecvError::Disconnected) => {
                    log::warn!("wgpu: fence callback dropped before signaling");
                    break true;
                }
                Err(mpsc::TryRecvError::Empty) => {}
            }
            if Instant::now() >= deadline {
                break false;
            }
            std::thread::sleep(Duration::from_micros(100));
        };
        if !signaled {
            return FenceStatus::TimedOut;
        }
        if let Some(state) = self.fences.get_mut(fence) {
            *state = GpuFence::Signaled;
        }
        FenceStatus::Signaled
    }

    fn release_fence(&mut self, fence: FenceHandle) {
        self.fences.remove(fence);
    }

    fn end_frame(&mut self) -> Result<(), BackendError> {
        if self.frame_open && self.pending_clear.is_some() {
            let commands = self.encode_frame(&[]);
            self.queue.submit(Some(commands));
        }
        self.frame_open = false;
        Ok(())
    }
}
