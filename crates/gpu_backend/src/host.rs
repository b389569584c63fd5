//! Host-memory storage for the CPU-side backends.

use render_protocol::{DeviceBufferHandle, DeviceTextureHandle};
use slotmap::SlotMap;

use crate::{BackendError, TextureDesc, TextureRegion};

pub(crate) fn validate_texture_desc(desc: &TextureDesc) -> Result<(), BackendError> {
    if desc.width == 0 || desc.height == 0 || desc.layers == 0 {
        return Err(BackendError::UnsupportedTexture(format!(
            "{} has zero extent ({}x{}x{})",
            desc.label, desc.width, desc.height, desc.layers
        )));
    }
    Ok(())
}

pub(crate) fn validate_upload(
    desc: &TextureDesc,
    region: TextureRegion,
    bytes: &[u8],
) -> Result<(), BackendError> {
    let in_bounds = region
        .x
        .checked_add(region.width)
        .is_some_and(|right| right <= desc.width)
        && region
            .y
            .checked_add(region.height)
            .is_some_and(|bottom| bottom <= desc.height)
        && region.layer < desc.layers;
    if !in_bounds {
        return Err(BackendError::RegionOutOfBounds {
            region,
            width: desc.width,
            height: desc.height,
            layers: desc.layers,
        });
    }
    let expected = region.byte_len(desc.format);
    if bytes.len() != expected {
        return Err(BackendError::UploadSizeMismatch {
            expected,
            actual: bytes.len(),
        });
    }
    Ok(())
}

pub(crate) struct HostTexture {
    pub desc: TextureDesc,
    pub data: Vec<u8>,
}

impl HostTexture {
    pub fn texel(&self, x: u32, y: u32, layer: u32) -> &[u8] {
        let bpp = self.desc.format.bytes_per_texel() as usize;
        let offset = layer as usize * self.desc.layer_len()
            + (y as usize * self.desc.width as usize + x as usize) * bpp;
        &self.data[offset..offset + bpp]
    }
}

pub(crate) struct HostBuffer {
    pub data: Vec<u8>,
    pub mapped: bool,
}

#[derive(Default)]
pub(crate) struct HostMemory {
    pub textures: SlotMap<DeviceTextureHandle, HostTexture>,
    pub buffers: SlotMap<DeviceBufferHandle, HostBuffer>,
}

impl HostMemory {
    pub fn create_texture(
        &mut self,
        desc: &TextureDesc,
    ) -> Result<DeviceTextureHandle, BackendError> {
        validate_texture_desc(desc)?;
        let data = vec![0; desc.layer_len() * desc.layers as usize];
        Ok(self.textures.insert(HostTexture { desc: *desc, data }))
    }

    pub fn upload_region(
        &mut self,
        texture: DeviceTextureHandle,
        region: TextureRegion,
        bytes: &[u8],
    ) -> Result<(), BackendError> {
        let texture = self
            .textures
            .get_mut(texture)
            .ok_or(BackendError::InvalidHandle { kind: "texture" })?;
        validate_upload(&texture.desc, region, bytes)?;

        let bpp = texture.desc.format.bytes_per_texel() as usize;
        let row_len = region.width as usize * bpp;
        let layer_base = region.layer as usize * texture.desc.layer_len();
        for (row, src) in bytes.chunks_exact(row_len).enumerate() {
            let y = region.y as usize + row;
            let offset = layer_base + (y * texture.desc.width as usize + region.x as usize) * bpp;
            texture.data[offset..offset + row_len].copy_from_slice(src);
        }
        Ok(())
    }

    pub fn destroy_texture(&mut self, texture: DeviceTextureHandle) -> bool {
        self.textures.remove(texture).is_some()
    }

    pub fn create_buffer(&mut self, size: u64) -> DeviceBufferHandle {
        self.buffers.insert(HostBuffer {
            data: vec![0; size as usize],
            mapped: false,
        })
    }

    pub fn map_buffer(&mut self, buffer: DeviceBufferHandle) -> Result<&mut [u8], BackendError> {
        let buffer = self
            .buffers
            .get_mut(buffer)
            .ok_or(BackendError::InvalidHandle { kind: "buffer" })?;
        if buffer.mapped {
            return Err(BackendError::AlreadyMapped);
        }
        buffer.mapped = true;
        Ok(&mut buffer.data)
    }

    pub fn unmap_buffer(&mut self, buffer: DeviceBufferHandle) {
        if let Some(buffer) = self.buffers.get_mut(buffer) {
            buffer.mapped = false;
        }
    }

    pub fn write_buffer(
        &mut self,
        buffer: DeviceBufferHandle,
        offset: u64,
        bytes: &[u8],
    ) -> Result<(), BackendError> {
        let buffer = self
            .buffers
            .get_mut(buffer)
            .ok_or(BackendError::InvalidHandle { kind: "buffer" })?;
        let size = buffer.data.len() as u64;
        let end = offset.checked_add(bytes.len() as u64);
        if end.is_none_or(|end| end > size) {
            return Err(BackendError::BufferOverflow {
                offset,
                len: bytes.len(),
                size,
            });
        }
        let start = offset as usize;
        buffer.data[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn destroy_buffer(&mut self, buffer: DeviceBufferHandle) -> bool {
        self.buffers.remove(buffer).is_some()
    }

    pub fn texture(&self, texture: DeviceTextureHandle) -> Result<&HostTexture, BackendError> {
        self.textures
            .get(texture)
            .ok_or(BackendError::InvalidHandle { kind: "texture" })
    }

    pub fn buffer(&self, buffer: DeviceBufferHandle) -> Result<&HostBuffer, BackendError> {
        self.buffers
            .get(buffer)
            .ok_or(BackendError::InvalidHandle { kind: "buffer" })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TextureFormat;

    fn desc(format: TextureFormat, width: u32, height: u32, layers: u32) -> TextureDesc {
        TextureDesc {
            label: "test",
            format,
            width,
            height,
            layers,
        }
    }

    #[test]
    fn upload_writes_rows_into_the_selected_layer() {
        let mut memory = HostMemory::default();
        let texture = memory
            .create_texture(&desc(TextureFormat::Index8, 4, 4, 2))
            .unwrap();
        let region = TextureRegion {
            x: 1,
            y: 2,
            layer: 1,
            width: 2,
            height: 2,
        };
        memory.upload_region(texture, region, &[1, 2, 3, 4]).unwrap();

        let stored = memory.texture(texture).unwrap();
        assert_eq!(stored.texel(1, 2, 1), &[1]);
        assert_eq!(stored.texel(2, 3, 1), &[4]);
        assert_eq!(stored.texel(1, 2, 0), &[0]);
    }

    #[test]
    fn upload_rejects_out_of_bounds_and_short_payloads() {
        let mut memory = HostMemory::default();
        let texture = memory
            .create_texture(&desc(TextureFormat::Rgba8, 2, 2, 1))
            .unwrap();
        let outside = TextureRegion {
            x: 1,
            y: 0,
            layer: 0,
            width: 2,
            height: 1,
        };
        assert!(matches!(
            memory.upload_region(texture, outside, &[0; 8]),
            Err(BackendError::RegionOutOfBounds { .. })
        ));
        let inside = TextureRegion { width: 1, ..outside };
        assert_eq!(
            memory.upload_region(texture, inside, &[0; 3]),
            Err(BackendError::UploadSizeMismatch {
                expected: 4,
                actual: 3
            })
        );
    }

    #[test]
    fn zero_sized_texture_is_unsupported() {
        let mut memory = HostMemory::default();
        assert!(matches!(
            memory.create_texture(&desc(TextureFormat::Rgba8, 0, 4, 1)),
            Err(BackendError::UnsupportedTexture(_))
        ));
    }

    #[test]
    fn buffer_write_is_bounds_checked() {
        let mut memory = HostMemory::default();
        let buffer = memory.create_buffer(8);
        memory.write_buffer(buffer, 4, &[9; 4]).unwrap();
        assert!(memory.write_buffer(buffer, 6, &[9; 4]).is_err());
        assert_eq!(&memory.buffer(buffer).unwrap().data[4..], &[9; 4]);
    }

    #[test]
    fn buffer_cannot_be_mapped_twice() {
        let mut memory = HostMemory::default();
        let buffer = memory.create_buffer(4);
        memory.map_buffer(buffer).unwrap()[0] = 7;
        assert_eq!(memory.map_buffer(buffer), Err(BackendError::AlreadyMapped));
        memory.unmap_buffer(buffer);
        assert_eq!(memory.map_buffer(buffer).unwrap()[0], 7);
    }
}
