// SPDX-License-Identifier: MPL-2.0

//! [`GpuBackend`] on top of wgpu (Vulkan/GL/Metal, whatever the adapter offers).

use glam::Mat4;
use tracing::{debug, error, info, warn};
use wgpu::util::DeviceExt;

use super::{GpuBackend, GpuBackendFactory, GpuError, PlatformSurface};
use crate::decode_target::{DecodedFrame, PixelFormat};

#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct Uniforms {
    mvp: [[f32; 4]; 4],
    brightness: f32,
    _padding: [f32; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct Vertex {
    position: [f32; 2],
    uv: [f32; 2],
}

/// Unit quad as a 4-vertex triangle strip. Texture rows run top to bottom.
#[rustfmt::skip]
const QUAD: [Vertex; 4] = [
    Vertex { position: [-1.0, -1.0], uv: [0.0, 1.0] },
    Vertex { position: [ 1.0, -1.0], uv: [1.0, 1.0] },
    Vertex { position: [-1.0,  1.0], uv: [0.0, 0.0] },
    Vertex { position: [ 1.0,  1.0], uv: [1.0, 0.0] },
];

/// Creates [`WgpuBackend`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct WgpuFactory;

impl GpuBackendFactory for WgpuFactory {
    fn create(&self) -> Box<dyn GpuBackend> {
        Box::new(WgpuBackend::default())
    }
}

#[derive(Default)]
pub struct WgpuBackend {
    context: Option<Context>,
    /// Surface texture drawn by `draw_frame`, waiting for `present`.
    pending: Option<wgpu::SurfaceTexture>,
}

struct Context {
    _instance: wgpu::Instance,
    surface: wgpu::Surface<'static>,
    device: wgpu::Device,
    queue: wgpu::Queue,
    config: wgpu::SurfaceConfiguration,
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    sampler: wgpu::Sampler,
    uniform_buffer: wgpu::Buffer,
    vertex_buffer: wgpu::Buffer,
    video: VideoTexture,
}

/// The texture decoded frames are uploaded into.
struct VideoTexture {
    texture: wgpu::Texture,
    bind_group: wgpu::BindGroup,
    width: u32,
    height: u32,
    format: wgpu::TextureFormat,
}

fn texture_format(format: PixelFormat) -> wgpu::TextureFormat {
    match format {
        PixelFormat::Rgba => wgpu::TextureFormat::Rgba8UnormSrgb,
        PixelFormat::Bgrx => wgpu::TextureFormat::Bgra8UnormSrgb,
    }
}

impl Context {
    fn new(target: &PlatformSurface) -> Result<Self, GpuError> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        // SAFETY: the handles stay valid until the render thread is joined,
        // which happens before the platform surface is destroyed.
        let surface = unsafe {
            instance.create_surface_unsafe(wgpu::SurfaceTargetUnsafe::RawHandle {
                raw_display_handle: target.display,
                raw_window_handle: target.window,
            })
        }
        .map_err(|why| GpuError::Surface(why.to_string()))?;

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::LowPower,
            compatible_surface: Some(&surface),
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| GpuError::Init("no suitable adapter".to_string()))?;

        debug!(adapter = ?adapter.get_info(), "selected GPU adapter");

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("vidpaper device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::downlevel_webgl2_defaults()
                    .using_resolution(adapter.limits()),
                memory_hints: wgpu::MemoryHints::MemoryUsage,
            },
            None,
        ))
        .map_err(|why| GpuError::Init(why.to_string()))?;

        device.on_uncaptured_error(Box::new(|why| {
            error!(%why, "uncaptured GPU error");
        }));

        let caps = surface.get_capabilities(&adapter);
        let Some(&fallback_format) = caps.formats.first() else {
            return Err(GpuError::Surface(
                "surface is not supported by the adapter".to_string(),
            ));
        };
        let format = caps
            .formats
            .iter()
            .copied()
            .find(wgpu::TextureFormat::is_srgb)
            .unwrap_or(fallback_format);

        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width: target.width.max(1),
            height: target.height.max(1),
            present_mode: wgpu::PresentMode::Fifo,
            alpha_mode: caps
                .alpha_modes
                .first()
                .copied()
                .unwrap_or(wgpu::CompositeAlphaMode::Auto),
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &config);

        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("video shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("video.wgsl").into()),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("video bind group layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("video pipeline layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("video pipeline"),
            layout: Some(&layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                buffers: &[wgpu::VertexBufferLayout {
                    array_stride: std::mem::size_of::<Vertex>() as wgpu::BufferAddress,
                    step_mode: wgpu::VertexStepMode::Vertex,
                    attributes: &wgpu::vertex_attr_array![0 => Float32x2, 1 => Float32x2],
                }],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format,
                    blend: Some(wgpu::BlendState::REPLACE),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleStrip,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: None,
                polygon_mode: wgpu::PolygonMode::Fill,
                unclipped_depth: false,
                conservative: false,
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        if let Some(why) = pollster::block_on(device.pop_error_scope()) {
            return Err(GpuError::Shader(why.to_string()));
        }

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("video sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("video uniforms"),
            size: std::mem::size_of::<Uniforms>() as wgpu::BufferAddress,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let vertex_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("video quad"),
            contents: bytemuck::cast_slice(&QUAD),
            usage: wgpu::BufferUsages::VERTEX,
        });

        // Black placeholder until the first decoded frame arrives.
        let video = VideoTexture::new(
            &device,
            &bind_group_layout,
            &sampler,
            &uniform_buffer,
            1,
            1,
            texture_format(PixelFormat::Rgba),
        );
        queue.write_texture(
            video.copy_target(),
            &[0, 0, 0, 255],
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(4),
                rows_per_image: Some(1),
            },
            video.extent(),
        );

        info!(
            width = config.width,
            height = config.height,
            format = ?format,
            "GPU render context ready"
        );

        Ok(Self {
            _instance: instance,
            surface,
            device,
            queue,
            config,
            pipeline,
            bind_group_layout,
            sampler,
            uniform_buffer,
            vertex_buffer,
            video,
        })
    }
}

impl VideoTexture {
    fn new(
        device: &wgpu::Device,
        layout: &wgpu::BindGroupLayout,
        sampler: &wgpu::Sampler,
        uniforms: &wgpu::Buffer,
        width: u32,
        height: u32,
        format: wgpu::TextureFormat,
    ) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("video texture"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });

        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("video bind group"),
            layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(sampler),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: uniforms.as_entire_binding(),
                },
            ],
        });

        Self {
            texture,
            bind_group,
            width,
            height,
            format,
        }
    }

    fn copy_target(&self) -> wgpu::ImageCopyTexture<'_> {
        wgpu::ImageCopyTexture {
            texture: &self.texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        }
    }

    fn extent(&self) -> wgpu::Extent3d {
        wgpu::Extent3d {
            width: self.width,
            height: self.height,
            depth_or_array_layers: 1,
        }
    }
}

impl GpuBackend for WgpuBackend {
    fn initialize(&mut self, surface: &PlatformSurface) -> Result<(), GpuError> {
        self.teardown();
        self.context = Some(Context::new(surface)?);
        Ok(())
    }

    fn resize(&mut self, width: u32, height: u32) {
        let Some(ctx) = self.context.as_mut() else {
            return;
        };

        if width == 0 || height == 0 {
            return;
        }

        ctx.config.width = width;
        ctx.config.height = height;
        ctx.surface.configure(&ctx.device, &ctx.config);
    }

    fn update_texture(&mut self, frame: &DecodedFrame) -> Result<(), GpuError> {
        let ctx = self.context.as_mut().ok_or(GpuError::NotInitialized)?;

        if !frame.is_complete() {
            warn!(?frame, "skipping incomplete decoded frame");
            return Ok(());
        }

        let format = texture_format(frame.format);
        if ctx.video.width != frame.width
            || ctx.video.height != frame.height
            || ctx.video.format != format
        {
            debug!(
                width = frame.width,
                height = frame.height,
                ?format,
                "reallocating video texture"
            );
            ctx.video = VideoTexture::new(
                &ctx.device,
                &ctx.bind_group_layout,
                &ctx.sampler,
                &ctx.uniform_buffer,
                frame.width,
                frame.height,
                format,
            );
        }

        ctx.queue.write_texture(
            ctx.video.copy_target(),
            &frame.data,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(frame.stride),
                rows_per_image: Some(frame.height),
            },
            ctx.video.extent(),
        );

        Ok(())
    }

    fn draw_frame(&mut self, mvp: &Mat4, brightness: f32) -> Result<(), GpuError> {
        let ctx = self.context.as_mut().ok_or(GpuError::NotInitialized)?;

        let output = match ctx.surface.get_current_texture() {
            Ok(output) => output,
            Err(wgpu::SurfaceError::Outdated) => {
                ctx.surface.configure(&ctx.device, &ctx.config);
                return Err(GpuError::Surface("surface outdated".to_string()));
            }
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::OutOfMemory) => {
                return Err(GpuError::ContextLost);
            }
            #[allow(unreachable_patterns)]
            Err(why) => return Err(GpuError::Surface(why.to_string())),
        };

        let uniforms = Uniforms {
            mvp: mvp.to_cols_array_2d(),
            brightness,
            _padding: [0.0; 3],
        };
        ctx.queue
            .write_buffer(&ctx.uniform_buffer, 0, bytemuck::bytes_of(&uniforms));

        let view = output
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());

        let mut encoder = ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("video frame"),
            });

        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("video pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });

            pass.set_pipeline(&ctx.pipeline);
            pass.set_bind_group(0, &ctx.video.bind_group, &[]);
            pass.set_vertex_buffer(0, ctx.vertex_buffer.slice(..));
            pass.draw(0..4, 0..1);
        }

        ctx.queue.submit(Some(encoder.finish()));
        self.pending = Some(output);
        Ok(())
    }

    fn present(&mut self) -> Result<(), GpuError> {
        if self.context.is_none() {
            return Err(GpuError::ContextLost);
        }

        let output = self.pending.take().ok_or(GpuError::NotInitialized)?;
        output.present();
        Ok(())
    }

    fn teardown(&mut self) {
        self.pending.take();
        if self.context.take().is_some() {
            debug!("GPU render context released");
        }
    }
}
