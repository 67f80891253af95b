//! GPU side of the streamline pipeline.
//!
//! Every stage owns its pipeline and the resources only it touches:
//!
//! - [`FieldTexture`] - the velocity raster as an `Rg8Unorm` texture
//! - [`Propagator`] - compute pass advancing particle state
//! - [`ParticleRenderer`] - instanced particle quads and the sprite overlay
//! - [`TrailAccumulator`] - double-buffered fading trail targets
//! - [`Compositor`] - colour-mapped magnitude field blended with trails
//!
//! Shared WGSL snippets live here and are spliced into each shader with
//! `format!`.

pub mod compositor;
pub mod field_texture;
pub mod particle_renderer;
pub mod propagator;
pub mod trail;

use std::sync::Arc;

pub use compositor::{CompositeParams, Compositor};
pub use field_texture::FieldTexture;
pub use particle_renderer::{ParticleRenderer, Sprite};
pub use propagator::{max_particles, Propagator, PropagatorStep};
pub use trail::TrailAccumulator;

use crate::error::GpuError;

/// Format of the offscreen trail targets.
pub const TRAIL_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

const WORKGROUP_SIZE: u32 = 64;

/// Device and queue shared by all pipeline stages.
#[derive(Clone)]
pub struct GpuContext {
    pub device: Arc<wgpu::Device>,
    pub queue: Arc<wgpu::Queue>,
}

impl GpuContext {
    /// Wrap a device and queue owned by the host.
    pub fn from_parts(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>) -> Self {
        Self { device, queue }
    }

    /// Request an adapter and device, optionally compatible with `surface`.
    pub async fn request(
        instance: &wgpu::Instance,
        surface: Option<&wgpu::Surface<'_>>,
    ) -> Result<(Self, wgpu::Adapter), GpuError> {
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: surface,
                force_fallback_adapter: false,
            })
            .await
            .ok_or(GpuError::NoAdapter)?;

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Streamlines Device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                    memory_hints: Default::default(),
                },
                None,
            )
            .await?;

        log::info!("Using GPU adapter: {}", adapter.get_info().name);
        Ok((Self::from_parts(Arc::new(device), Arc::new(queue)), adapter))
    }

    /// Device without a surface, for offscreen rendering and tests.
    pub async fn new_headless() -> Result<Self, GpuError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });
        let (context, _) = Self::request(&instance, None).await?;
        Ok(context)
    }
}

/// What a block run under [`with_error_scopes`] creates, for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScopeKind {
    /// Shader modules and pipelines.
    Pipeline,
    /// Buffers, textures and bind groups.
    Resource,
}

/// Run `f` inside validation and out-of-memory error scopes.
///
/// Shader compilation and resource creation report problems asynchronously;
/// popping the scopes turns them into a [`GpuError`] with the device's
/// diagnostics attached instead of reaching the uncaptured-error handler.
pub(crate) fn with_error_scopes<T>(
    device: &wgpu::Device,
    label: &str,
    kind: ScopeKind,
    f: impl FnOnce() -> T,
) -> Result<T, GpuError> {
    device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let value = f();
    let validation = pollster::block_on(device.pop_error_scope());
    let out_of_memory = pollster::block_on(device.pop_error_scope());

    if let Some(error) = validation {
        let (label, diagnostics) = (label.to_string(), error.to_string());
        return Err(match kind {
            ScopeKind::Pipeline => GpuError::ShaderValidation { label, diagnostics },
            ScopeKind::Resource => GpuError::Validation { label, diagnostics },
        });
    }
    if let Some(error) = out_of_memory {
        return Err(GpuError::Allocation {
            label: label.to_string(),
            reason: error.to_string(),
        });
    }
    Ok(value)
}

/// `Err(GpuError::LimitExceeded)` when `requested > limit`.
pub(crate) fn check_limit(label: &str, requested: u64, limit: u64) -> Result<(), GpuError> {
    if requested > limit {
        return Err(GpuError::LimitExceeded {
            label: label.to_string(),
            requested,
            limit,
        });
    }
    Ok(())
}

/// Check a 2D texture size against `max_texture_dimension_2d`.
pub(crate) fn check_texture_size(
    limits: &wgpu::Limits,
    label: &str,
    width: u32,
    height: u32,
) -> Result<(), GpuError> {
    let limit = u64::from(limits.max_texture_dimension_2d);
    check_limit(label, u64::from(width.max(height)), limit)
}

/// Create a 2D texture and its default view.
pub(crate) fn create_texture(
    device: &wgpu::Device,
    label: &str,
    width: u32,
    height: u32,
    format: wgpu::TextureFormat,
    usage: wgpu::TextureUsages,
) -> (wgpu::Texture, wgpu::TextureView) {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: wgpu::Extent3d {
            width: width.max(1),
            height: height.max(1),
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format,
        usage,
        view_formats: &[],
    });
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    (texture, view)
}

/// Clamp-to-edge sampler with the same filter for magnification and minification.
pub(crate) fn create_sampler(
    device: &wgpu::Device,
    label: &str,
    filter: wgpu::FilterMode,
) -> wgpu::Sampler {
    device.create_sampler(&wgpu::SamplerDescriptor {
        label: Some(label),
        address_mode_u: wgpu::AddressMode::ClampToEdge,
        address_mode_v: wgpu::AddressMode::ClampToEdge,
        address_mode_w: wgpu::AddressMode::ClampToEdge,
        mag_filter: filter,
        min_filter: filter,
        mipmap_filter: wgpu::FilterMode::Nearest,
        ..Default::default()
    })
}

/// Upload tightly packed texels covering a whole texture.
pub(crate) fn write_texture(
    queue: &wgpu::Queue,
    texture: &wgpu::Texture,
    data: &[u8],
    bytes_per_texel: u32,
) {
    let size = texture.size();
    queue.write_texture(
        wgpu::TexelCopyTextureInfo {
            texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        data,
        wgpu::TexelCopyBufferLayout {
            offset: 0,
            bytes_per_row: Some(size.width * bytes_per_texel),
            rows_per_image: Some(size.height),
        },
        size,
    );
}

/// Additive colour with max alpha, so overlapping particles keep their opacity.
pub(crate) const ADDITIVE_MAX_ALPHA: wgpu::BlendState = wgpu::BlendState {
    color: wgpu::BlendComponent {
        src_factor: wgpu::BlendFactor::One,
        dst_factor: wgpu::BlendFactor::One,
        operation: wgpu::BlendOperation::Add,
    },
    alpha: wgpu::BlendComponent {
        src_factor: wgpu::BlendFactor::One,
        dst_factor: wgpu::BlendFactor::One,
        operation: wgpu::BlendOperation::Max,
    },
};

pub(crate) fn uniform_entry(binding: u32, visibility: wgpu::ShaderStages) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

pub(crate) fn storage_entry(
    binding: u32,
    visibility: wgpu::ShaderStages,
    read_only: bool,
) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

pub(crate) fn texture_entry(binding: u32, visibility: wgpu::ShaderStages) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility,
        ty: wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: true },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        count: None,
    }
}

pub(crate) fn sampler_entry(binding: u32, visibility: wgpu::ShaderStages) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility,
        ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
        count: None,
    }
}

/// Hash-based random numbers, bit-identical to [`crate::particle::pcg_hash`].
pub(crate) const RANDOM_WGSL: &str = r#"
fn pcg_hash(input: u32) -> u32 {
    let state = input * 747796405u + 2891336453u;
    let word = ((state >> ((state >> 28u) + 4u)) ^ state) * 277803737u;
    return (word >> 22u) ^ word;
}

fn random_unit(seed: u32, index: u32, stream: u32) -> f32 {
    let h = pcg_hash(seed ^ pcg_hash(index * 4u + stream));
    return f32(h >> 8u) / 16777216.0;
}
"#;

/// Velocity field lookups. Expects `field` and `field_sampler` globals.
pub(crate) const FIELD_WGSL: &str = r#"
fn clip_to_texture(p: vec2<f32>) -> vec2<f32> {
    return vec2<f32>((p.x + 1.0) * 0.5, 1.0 - (p.y + 1.0) * 0.5);
}

// Nearest texel decides no-data so filtering never invents a sentinel.
fn is_no_data(uv: vec2<f32>) -> bool {
    let dims = vec2<i32>(textureDimensions(field));
    let texel = clamp(vec2<i32>(floor(uv * vec2<f32>(dims))), vec2<i32>(0), dims - vec2<i32>(1));
    let raw = textureLoad(field, texel, 0).rg;
    return all(raw >= vec2<f32>(1.0));
}

// decode = (u_scale, u_offset, v_scale, v_offset)
fn physical_velocity(uv: vec2<f32>, decode: vec4<f32>) -> vec2<f32> {
    let raw = textureSampleLevel(field, field_sampler, uv, 0.0).rg;
    return raw * decode.xz + decode.yw;
}
"#;

/// Fullscreen triangle. `clip` is the unremapped position, used for lookups.
pub(crate) const FULLSCREEN_WGSL: &str = r#"
struct FullscreenOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) uv: vec2<f32>,
};

fn fullscreen_vertex(vertex_index: u32, scale: vec2<f32>, offset: vec2<f32>) -> FullscreenOutput {
    var positions = array<vec2<f32>, 3>(
        vec2<f32>(-1.0, -1.0),
        vec2<f32>(3.0, -1.0),
        vec2<f32>(-1.0, 3.0),
    );
    var uvs = array<vec2<f32>, 3>(
        vec2<f32>(0.0, 1.0),
        vec2<f32>(2.0, 1.0),
        vec2<f32>(0.0, -1.0),
    );

    var out: FullscreenOutput;
    out.clip_position = vec4<f32>(positions[vertex_index] * scale + offset, 0.0, 1.0);
    out.uv = uvs[vertex_index];
    return out;
}
"#;
