//! Velocity raster uploaded as a GPU texture.

use crate::velocity::{FilterMode, LinearDecode, VelocityImage};

use super::{create_sampler, create_texture, write_texture};

/// An `Rg8Unorm` copy of a [`VelocityImage`] with its sampler and decode.
pub struct FieldTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    sampler: wgpu::Sampler,
    decode: LinearDecode,
    filter: FilterMode,
}

impl FieldTexture {
    pub fn new(device: &wgpu::Device, queue: &wgpu::Queue, image: &VelocityImage) -> Self {
        let (texture, view) = create_texture(
            device,
            "Velocity Field Texture",
            image.width(),
            image.height(),
            wgpu::TextureFormat::Rg8Unorm,
            wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        );
        write_texture(queue, &texture, image.as_bytes(), 2);

        Self {
            texture,
            view,
            sampler: create_sampler(device, "Velocity Field Sampler", image.filter().into()),
            decode: *image.decode(),
            filter: image.filter(),
        }
    }

    /// A 1x1 field with no data anywhere.
    pub fn empty(device: &wgpu::Device, queue: &wgpu::Queue) -> Self {
        let image = VelocityImage::from_fn(1, 1, LinearDecode::new(1.0, 0.0, 1.0, 0.0), |_, _| None);
        Self::new(device, queue, &image)
    }

    /// Replace the sampler when the filter mode changes.
    pub fn set_filter(&mut self, device: &wgpu::Device, filter: FilterMode) {
        if filter != self.filter {
            self.sampler = create_sampler(device, "Velocity Field Sampler", filter.into());
            self.filter = filter;
        }
    }

    pub fn view(&self) -> &wgpu::TextureView {
        &self.view
    }

    pub fn sampler(&self) -> &wgpu::Sampler {
        &self.sampler
    }

    pub fn decode(&self) -> &LinearDecode {
        &self.decode
    }

    /// Decode parameters as `(u_scale, u_offset, v_scale, v_offset)`.
    pub fn decode_uniform(&self) -> [f32; 4] {
        [
            self.decode.u_scale,
            self.decode.u_offset,
            self.decode.v_scale,
            self.decode.v_offset,
        ]
    }

    pub fn size(&self) -> (u32, u32) {
        let size = self.texture.size();
        (size.width, size.height)
    }
}
