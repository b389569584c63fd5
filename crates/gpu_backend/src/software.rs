use std::time::Duration;

use bytemuck::pod_read_unaligned;
use render_protocol::{
    Color, DeviceBufferHandle, DeviceTextureHandle, FenceHandle, GpuAtlasAttributes, GpuVertex,
    PALETTE_SLOT_COLORS,
};
use slotmap::SlotMap;

use crate::host::{HostMemory, HostTexture};
use crate::{
    Backend, BackendError, BufferUsage, DrawBinding, DrawCall, FenceStatus, TextureDesc,
    TextureRegion,
};

const VERTEX_SIZE: usize = std::mem::size_of::<GpuVertex>();
const ATTRIBUTE_SIZE: usize = std::mem::size_of::<GpuAtlasAttributes>();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoftwareConfig {
    pub width: u32,
    pub height: u32,
}

impl Default for SoftwareConfig {
    fn default() -> Self {
        Self {
            width: 384,
            height: 224,
        }
    }
}

/// CPU rasterizer into an RGBA canvas. Draws execute immediately, so every
/// fence is already signaled when it is returned.
pub struct SoftwareBackend {
    config: SoftwareConfig,
    memory: HostMemory,
    canvas: Vec<Color>,
    fences: SlotMap<FenceHandle, ()>,
    frame_open: bool,
    draw_calls: u64,
}

impl SoftwareBackend {
    pub fn new(config: SoftwareConfig) -> Self {
        Self {
            config,
            memory: HostMemory::default(),
            canvas: vec![Color::TRANSPARENT; config.width as usize * config.height as usize],
            fences: SlotMap::with_key(),
            frame_open: false,
            draw_calls: 0,
        }
    }

    pub fn width(&self) -> u32 {
        self.config.width
    }

    pub fn height(&self) -> u32 {
        self.config.height
    }

    pub fn canvas(&self) -> &[Color] {
        &self.canvas
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<Color> {
        if x >= self.config.width || y >= self.config.height {
            return None;
        }
        self.canvas
            .get(y as usize * self.config.width as usize + x as usize)
            .copied()
    }

    pub fn draw_calls(&self) -> u64 {
        self.draw_calls
    }

    fn rasterize(&mut self, call: &DrawCall) -> Result<(), BackendError> {
        let vertices = &self.memory.buffer(call.vertices)?.data;
        let attributes = &self.memory.buffer(call.attributes)?.data;
        let indices = &self.memory.buffer(call.indices)?.data;
        let sampler = Sampler::new(&self.memory, call.binding)?;

        let first = call.first_index as usize * 4;
        let end = first + call.index_count as usize * 4;
        let Some(index_bytes) = indices.get(first..end) else {
            return Err(BackendError::BufferOverflow {
                offset: first as u64,
                len: end - first,
                size: indices.len() as u64,
            });
        };

        let read_index = |chunk: &[u8]| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        for triangle in index_bytes.chunks_exact(12) {
            let ids = [
                read_index(&triangle[0..4]) as usize,
                read_index(&triangle[4..8]) as usize,
                read_index(&triangle[8..12]) as usize,
            ];
            let mut corners = [GpuVertex::default(); 3];
            for (corner, &id) in corners.iter_mut().zip(ids.iter()) {
                let bytes = vertices
                    .get(id * VERTEX_SIZE..(id + 1) * VERTEX_SIZE)
                    .ok_or(BackendError::BufferOverflow {
                        offset: (id * VERTEX_SIZE) as u64,
                        len: VERTEX_SIZE,
                        size: vertices.len() as u64,
                    })?;
                *corner = pod_read_unaligned(bytes);
            }
            let attribute = attributes
                .get(ids[0] * ATTRIBUTE_SIZE..(ids[0] + 1) * ATTRIBUTE_SIZE)
                .map(pod_read_unaligned::<GpuAtlasAttributes>)
                .unwrap_or(GpuAtlasAttributes::STANDALONE);
            fill_triangle(
                &mut self.canvas,
                self.config.width,
                self.config.height,
                corners,
                |u, v| sampler.sample(u, v, attribute),
            );
        }
        Ok(())
    }
}

impl Default for SoftwareBackend {
    fn default() -> Self {
        Self::new(SoftwareConfig::default())
    }
}

enum Sampler<'a> {
    Atlas {
        atlas: &'a HostTexture,
        palettes: &'a [u8],
    },
    Texture(&'a HostTexture),
}

impl<'a> Sampler<'a> {
    fn new(memory: &'a HostMemory, binding: DrawBinding) -> Result<Self, BackendError> {
        Ok(match binding {
            DrawBinding::Atlas { atlas, palettes } => Sampler::Atlas {
                atlas: memory.texture(atlas)?,
                palettes: &memory.buffer(palettes)?.data,
            },
            DrawBinding::Texture(texture) => Sampler::Texture(memory.texture(texture)?),
        })
    }

    fn sample(&self, u: f32, v: f32, attribute: GpuAtlasAttributes) -> Color {
        match self {
            Sampler::Texture(texture) => {
                let (x, y) = texel_coords(texture, u, v);
                let texel = texture.texel(x, y, 0);
                Color::rgba(texel[0], texel[1], texel[2], texel[3])
            }
            Sampler::Atlas { atlas, palettes } => {
                if attribute.layer < 0.0 {
                    return Color::TRANSPARENT;
                }
                let layer = (attribute.layer as u32).min(atlas.desc.layers - 1);
                let (x, y) = texel_coords(atlas, u, v);
                let index = atlas.texel(x, y, layer)[0] as usize;
                let slot = attribute.palette.max(0.0) as usize;
                let offset = (slot * PALETTE_SLOT_COLORS as usize + index) * 4;
                match palettes.get(offset..offset + 4) {
                    Some(c) => Color::rgba(c[0], c[1], c[2], c[3]),
                    None => Color::TRANSPARENT,
                }
            }
        }
    }
}

fn texel_coords(texture: &HostTexture, u: f32, v: f32) -> (u32, u32) {
    let width = texture.desc.width;
    let height = texture.desc.height;
    let x = (u * width as f32).floor().clamp(0.0, (width - 1) as f32) as u32;
    let y = (v * height as f32).floor().clamp(0.0, (height - 1) as f32) as u32;
    (x, y)
}

fn edge(a: [f32; 2], b: [f32; 2], p: [f32; 2]) -> f32 {
    (b[0] - a[0]) * (p[1] - a[1]) - (b[1] - a[1]) * (p[0] - a[0])
}

/// Pixels exactly on an edge belong to one of the two triangles sharing
/// it, so the diagonal of a quad is not blended twice.
fn owns_edge(a: [f32; 2], b: [f32; 2]) -> bool {
    let dx = b[0] - a[0];
    let dy = b[1] - a[1];
    dy > 0.0 || (dy == 0.0 && dx < 0.0)
}

fn covers(weight: f32, a: [f32; 2], b: [f32; 2]) -> bool {
    weight > 0.0 || (weight == 0.0 && owns_edge(a, b))
}

fn fill_triangle(
    canvas: &mut [Color],
    width: u32,
    height: u32,
    mut corners: [GpuVertex; 3],
    sample: impl Fn(f32, f32) -> Color,
) {
    let mut area = edge(corners[0].position, corners[1].position, corners[2].position);
    if area == 0.0 {
        return;
    }
    if area < 0.0 {
        corners.swap(1, 2);
        area = -area;
    }
    let [p0, p1, p2] = [corners[0].position, corners[1].position, corners[2].position];

    let min_x = p0[0].min(p1[0]).min(p2[0]).floor().max(0.0) as u32;
    let min_y = p0[1].min(p1[1]).min(p2[1]).floor().max(0.0) as u32;
    let max_x = (p0[0].max(p1[0]).max(p2[0]).ceil().max(0.0) as u32).min(width);
    let max_y = (p0[1].max(p1[1]).max(p2[1]).ceil().max(0.0) as u32).min(height);

    for y in min_y..max_y {
        for x in min_x..max_x {
            let p = [x as f32 + 0.5, y as f32 + 0.5];
            let w0 = edge(p1, p2, p);
            let w1 = edge(p2, p0, p);
            let w2 = edge(p0, p1, p);
            if !(covers(w0, p1, p2) && covers(w1, p2, p0) && covers(w2, p0, p1)) {
                continue;
            }
            let (b0, b1, b2) = (w0 / area, w1 / area, w2 / area);
            let u = b0 * corners[0].uv[0] + b1 * corners[1].uv[0] + b2 * corners[2].uv[0];
            let v = b0 * corners[0].uv[1] + b1 * corners[1].uv[1] + b2 * corners[2].uv[1];
            let tint = interpolate_color(
                [corners[0].color, corners[1].color, corners[2].color],
                [b0, b1, b2],
            );
            let src = sample(u, v).modulate(tint);
            let dst = &mut canvas[y as usize * width as usize + x as usize];
            *dst = blend_over(src, *dst);
        }
    }
}

fn interpolate_color(colors: [Color; 3], weights: [f32; 3]) -> Color {
    let channel = |pick: fn(Color) -> u8| {
        let value: f32 = colors
            .iter()
            .zip(weights.iter())
            .map(|(color, weight)| pick(*color) as f32 * weight)
            .sum();
        value.round().clamp(0.0, 255.0) as u8
    };
    Color::rgba(
        channel(|c| c.r),
        channel(|c| c.g),
        channel(|c| c.b),
        channel(|c| c.a),
    )
}

/// `src_alpha, one_minus_src_alpha` blending.
fn blend_over(src: Color, dst: Color) -> Color {
    let alpha = src.a as u32;
    let inverse = 255 - alpha;
    let mix = |s: u8, d: u8| ((s as u32 * alpha + d as u32 * inverse + 127) / 255) as u8;
    Color::rgba(
        mix(src.r, dst.r),
        mix(src.g, dst.g),
        mix(src.b, dst.b),
        (alpha + (dst.a as u32 * inverse + 127) / 255).min(255) as u8,
    )
}

impl Backend for SoftwareBackend {
    fn name(&self) -> &'static str {
        "software"
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<DeviceTextureHandle, BackendError> {
        self.memory.create_texture(desc)
    }

    fn upload_region(
        &mut self,
        texture: DeviceTextureHandle,
        region: TextureRegion,
        bytes: &[u8],
    ) -> Result<(), BackendError> {
        self.memory.upload_region(texture, region, bytes)
    }

    fn destroy_texture(&mut self, texture: DeviceTextureHandle) {
        self.memory.destroy_texture(texture);
    }

    fn create_buffer(
        &mut self,
        size: u64,
        _usage: BufferUsage,
    ) -> Result<DeviceBufferHandle, BackendError> {
        Ok(self.memory.create_buffer(size))
    }

    fn map_buffer(&mut self, buffer: DeviceBufferHandle) -> Result<&mut [u8], BackendError> {
        self.memory.map_buffer(buffer)
    }

    fn unmap_buffer(&mut self, buffer: DeviceBufferHandle, _written: u64) {
        self.memory.unmap_buffer(buffer);
    }

    fn write_buffer(
        &mut self,
        buffer: DeviceBufferHandle,
        offset: u64,
        bytes: &[u8],
    ) -> Result<(), BackendError> {
        self.memory.write_buffer(buffer, offset, bytes)
    }

    fn destroy_buffer(&mut self, buffer: DeviceBufferHandle) {
        self.memory.destroy_buffer(buffer);
    }

    fn begin_frame(&mut self, clear: Color) -> Result<(), BackendError> {
        self.canvas.fill(clear);
        self.frame_open = true;
        Ok(())
    }

    fn draw(&mut self, call: &DrawCall) -> Result<(), BackendError> {
        if !self.frame_open {
            return Err(BackendError::NoFrame);
        }
        for _ in 0..call.instance_count.max(1) {
            self.rasterize(call)?;
        }
        self.draw_calls += 1;
        Ok(())
    }

    fn submit(&mut self) -> Result<FenceHandle, BackendError> {
        if !self.frame_open {
            return Err(BackendError::NoFrame);
        }
        Ok(self.fences.insert(()))
    }

    fn wait_fence(&mut self, _fence: FenceHandle, _timeout: Duration) -> FenceStatus {
        FenceStatus::Signaled
    }

    fn release_fence(&mut self, fence: FenceHandle) {
        self.fences.remove(fence);
    }

    fn end_frame(&mut self) -> Result<(), BackendError> {
        self.frame_open = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TextureFormat;
    use render_protocol::QUAD_INDICES;

    struct Quad {
        vertices: DeviceBufferHandle,
        attributes: DeviceBufferHandle,
        indices: DeviceBufferHandle,
    }

    fn quad(
        backend: &mut SoftwareBackend,
        rect: [f32; 4],
        color: Color,
        attribute: GpuAtlasAttributes,
    ) -> Quad {
        let [x0, y0, x1, y1] = rect;
        let corners = [
            GpuVertex {
                position: [x0, y0],
                uv: [0.0, 0.0],
                color,
            },
            GpuVertex {
                position: [x1, y0],
                uv: [1.0, 0.0],
                color,
            },
            GpuVertex {
                position: [x0, y1],
                uv: [0.0, 1.0],
                color,
            },
            GpuVertex {
                position: [x1, y1],
                uv: [1.0, 1.0],
                color,
            },
        ];
        let vertices = backend.create_buffer(80, BufferUsage::Vertex).unwrap();
        backend
            .write_buffer(vertices, 0, bytemuck::cast_slice(&corners))
            .unwrap();
        let attributes = backend.create_buffer(32, BufferUsage::Attributes).unwrap();
        backend
            .write_buffer(attributes, 0, bytemuck::cast_slice(&[attribute; 4]))
            .unwrap();
        let indices = backend.create_buffer(24, BufferUsage::Index).unwrap();
        backend
            .write_buffer(indices, 0, bytemuck::cast_slice(&QUAD_INDICES))
            .unwrap();
        Quad {
            vertices,
            attributes,
            indices,
        }
    }

    fn draw(backend: &mut SoftwareBackend, quad: &Quad, binding: DrawBinding) {
        backend
            .draw(&DrawCall {
                vertices: quad.vertices,
                attributes: quad.attributes,
                indices: quad.indices,
                binding,
                first_index: 0,
                index_count: 6,
                instance_count: 1,
            })
            .unwrap();
    }

    fn white_texture(backend: &mut SoftwareBackend) -> DeviceTextureHandle {
        let texture = backend
            .create_texture(&TextureDesc {
                label: "white",
                format: TextureFormat::Rgba8,
                width: 1,
                height: 1,
                layers: 1,
            })
            .unwrap();
        backend
            .upload_region(
                texture,
                TextureRegion {
                    x: 0,
                    y: 0,
                    layer: 0,
                    width: 1,
                    height: 1,
                },
                &[255; 4],
            )
            .unwrap();
        texture
    }

    #[test]
    fn solid_quad_covers_its_rect_exactly() {
        let mut backend = SoftwareBackend::new(SoftwareConfig {
            width: 16,
            height: 16,
        });
        let white = white_texture(&mut backend);
        let red = Color::rgba(255, 0, 0, 255);
        let quad = quad(
            &mut backend,
            [2.0, 2.0, 6.0, 5.0],
            red,
            GpuAtlasAttributes::STANDALONE,
        );

        backend.begin_frame(Color::TRANSPARENT).unwrap();
        draw(&mut backend, &quad, DrawBinding::Texture(white));

        let covered = backend.canvas().iter().filter(|c| **c == red).count();
        assert_eq!(covered, 12);
        assert_eq!(backend.pixel(2, 2), Some(red));
        assert_eq!(backend.pixel(5, 4), Some(red));
        assert_eq!(backend.pixel(6, 4), Some(Color::TRANSPARENT));
    }

    #[test]
    fn half_transparent_quad_blends_once_along_diagonal() {
        let mut backend = SoftwareBackend::new(SoftwareConfig {
            width: 8,
            height: 8,
        });
        let white = white_texture(&mut backend);
        let quad = quad(
            &mut backend,
            [0.0, 0.0, 8.0, 8.0],
            Color::rgba(255, 255, 255, 128),
            GpuAtlasAttributes::STANDALONE,
        );

        backend.begin_frame(Color::rgba(0, 0, 0, 255)).unwrap();
        draw(&mut backend, &quad, DrawBinding::Texture(white));

        let first = backend.canvas()[0];
        assert!(backend.canvas().iter().all(|c| *c == first));
        assert_eq!(first.r, 128);
    }

    #[test]
    fn atlas_draw_resolves_indices_through_palette_slot() {
        let mut backend = SoftwareBackend::new(SoftwareConfig {
            width: 4,
            height: 4,
        });
        let atlas = backend
            .create_texture(&TextureDesc {
                label: "atlas",
                format: TextureFormat::Index8,
                width: 4,
                height: 4,
                layers: 2,
            })
            .unwrap();
        backend
            .upload_region(
                atlas,
                TextureRegion {
                    x: 0,
                    y: 0,
                    layer: 1,
                    width: 4,
                    height: 4,
                },
                &[3; 16],
            )
            .unwrap();
        let palettes = backend
            .create_buffer(2 * PALETTE_SLOT_COLORS as u64 * 4, BufferUsage::Palette)
            .unwrap();
        let green = Color::rgba(0, 255, 0, 255);
        let offset = (PALETTE_SLOT_COLORS as u64 + 3) * 4;
        backend
            .write_buffer(palettes, offset, &green.to_array())
            .unwrap();

        let quad = quad(
            &mut backend,
            [0.0, 0.0, 4.0, 4.0],
            Color::WHITE,
            GpuAtlasAttributes {
                layer: 1.0,
                palette: 1.0,
            },
        );
        backend.begin_frame(Color::TRANSPARENT).unwrap();
        draw(&mut backend, &quad, DrawBinding::Atlas { atlas, palettes });

        assert!(backend.canvas().iter().all(|c| *c == green));
    }

    #[test]
    fn fences_are_signaled_immediately() {
        let mut backend = SoftwareBackend::default();
        backend.begin_frame(Color::TRANSPARENT).unwrap();
        let fence = backend.submit().unwrap();
        assert_eq!(
            backend.wait_fence(fence, Duration::ZERO),
            FenceStatus::Signaled
        );
        backend.release_fence(fence);
    }
}
