//! wgpu scene renderer
//!
//! One render pass per frame into the surface, with a depth attachment:
//! background video (no depth), occlusion pre-pass (depth only), overlay
//! parts (mesh or splats, depth tested, alpha blended).

pub mod types;

pub use types::{GpuSplat, MeshVertex, PartUniforms, QuadUniforms, SplatUniforms};

use glam::Mat4;
use wgpu::util::DeviceExt;

use crate::assets::{OverlayAsset, PartGeometry, Side};
use crate::camera::CameraFrame;
use crate::occlusion::{MaskUpload, OcclusionUniforms};
use crate::scene::DrawItem;

pub const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

const ALPHA_BLEND: wgpu::BlendState = wgpu::BlendState {
    color: wgpu::BlendComponent {
        src_factor: wgpu::BlendFactor::SrcAlpha,
        dst_factor: wgpu::BlendFactor::OneMinusSrcAlpha,
        operation: wgpu::BlendOperation::Add,
    },
    alpha: wgpu::BlendComponent {
        src_factor: wgpu::BlendFactor::One,
        dst_factor: wgpu::BlendFactor::OneMinusSrcAlpha,
        operation: wgpu::BlendOperation::Add,
    },
};

enum PartBuffers {
    Mesh {
        vertex_buffer: wgpu::Buffer,
        index_buffer: wgpu::Buffer,
        index_count: u32,
    },
    Splats {
        count: u32,
    },
}

/// GPU resources of one overlay part
struct PartGpu {
    side: Side,
    buffers: PartBuffers,
    uniform_buffer: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
}

/// A sampled texture with its bind group
struct BoundTexture {
    texture: wgpu::Texture,
    bind_group: wgpu::BindGroup,
}

fn texture_layout_entries() -> [wgpu::BindGroupLayoutEntry; 3] {
    [
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
    ]
}

fn uniform_buffer(device: &wgpu::Device, label: &str, size: usize) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: size as u64,
        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

fn depth_state(write: bool, compare: wgpu::CompareFunction) -> Option<wgpu::DepthStencilState> {
    Some(wgpu::DepthStencilState {
        format: DEPTH_FORMAT,
        depth_write_enabled: write,
        depth_compare: compare,
        stencil: wgpu::StencilState::default(),
        bias: wgpu::DepthBiasState::default(),
    })
}

struct PipelineDesc<'a> {
    label: &'a str,
    shader: &'a wgpu::ShaderModule,
    layout: &'a wgpu::BindGroupLayout,
    buffers: &'a [wgpu::VertexBufferLayout<'a>],
    format: wgpu::TextureFormat,
    blend: Option<wgpu::BlendState>,
    write_mask: wgpu::ColorWrites,
    depth: Option<wgpu::DepthStencilState>,
}

fn create_pipeline(device: &wgpu::Device, desc: PipelineDesc<'_>) -> wgpu::RenderPipeline {
    let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(desc.label),
        bind_group_layouts: &[desc.layout],
        push_constant_ranges: &[],
    });

    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some(desc.label),
        layout: Some(&layout),
        vertex: wgpu::VertexState {
            module: desc.shader,
            entry_point: Some("vs_main"),
            buffers: desc.buffers,
            compilation_options: Default::default(),
        },
        fragment: Some(wgpu::FragmentState {
            module: desc.shader,
            entry_point: Some("fs_main"),
            targets: &[Some(wgpu::ColorTargetState {
                format: desc.format,
                blend: desc.blend,
                write_mask: desc.write_mask,
            })],
            compilation_options: Default::default(),
        }),
        primitive: wgpu::PrimitiveState {
            topology: wgpu::PrimitiveTopology::TriangleList,
            // Mirrored parts and thin assets are seen from both sides
            cull_mode: None,
            ..Default::default()
        },
        depth_stencil: desc.depth,
        multisample: wgpu::MultisampleState::default(),
        multiview: None,
        cache: None,
    })
}

/// Owns pipelines and GPU resources for the composited scene
pub struct SceneRenderer {
    sampler: wgpu::Sampler,

    background_pipeline: wgpu::RenderPipeline,
    background_layout: wgpu::BindGroupLayout,
    background_uniforms: wgpu::Buffer,
    video: BoundTexture,
    last_video_frame: u64,

    occlusion_pipeline: wgpu::RenderPipeline,
    occlusion_layout: wgpu::BindGroupLayout,
    occlusion_uniforms: wgpu::Buffer,
    mask: BoundTexture,

    mesh_pipeline: wgpu::RenderPipeline,
    mesh_layout: wgpu::BindGroupLayout,
    splat_pipeline: wgpu::RenderPipeline,
    splat_layout: wgpu::BindGroupLayout,
    parts: Vec<PartGpu>,

    depth_view: wgpu::TextureView,
}

impl SceneRenderer {
    pub fn new(
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        format: wgpu::TextureFormat,
        width: u32,
        height: u32,
    ) -> Self {
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Scene Sampler"),
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        // Background video plane
        let background_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Background Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("../shaders/background.wgsl").into()),
        });
        let background_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Background Bind Group Layout"),
            entries: &texture_layout_entries(),
        });
        let background_pipeline = create_pipeline(
            device,
            PipelineDesc {
                label: "Background Pipeline",
                shader: &background_shader,
                layout: &background_layout,
                buffers: &[],
                format,
                blend: Some(wgpu::BlendState::REPLACE),
                write_mask: wgpu::ColorWrites::ALL,
                depth: depth_state(false, wgpu::CompareFunction::Always),
            },
        );
        let background_uniforms =
            uniform_buffer(device, "Background Uniforms", std::mem::size_of::<QuadUniforms>());

        // Occlusion pre-pass: depth only
        let occlusion_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Occlusion Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("../shaders/occlusion.wgsl").into()),
        });
        let occlusion_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Occlusion Bind Group Layout"),
            entries: &texture_layout_entries(),
        });
        let occlusion_pipeline = create_pipeline(
            device,
            PipelineDesc {
                label: "Occlusion Pipeline",
                shader: &occlusion_shader,
                layout: &occlusion_layout,
                buffers: &[],
                format,
                blend: None,
                write_mask: wgpu::ColorWrites::empty(),
                depth: depth_state(true, wgpu::CompareFunction::Less),
            },
        );
        let occlusion_uniforms = uniform_buffer(
            device,
            "Occlusion Uniforms",
            std::mem::size_of::<OcclusionUniforms>(),
        );

        // Overlay mesh parts
        let mesh_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Overlay Mesh Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("../shaders/overlay_mesh.wgsl").into()),
        });
        let mesh_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Overlay Mesh Bind Group Layout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }],
        });
        let mesh_pipeline = create_pipeline(
            device,
            PipelineDesc {
                label: "Overlay Mesh Pipeline",
                shader: &mesh_shader,
                layout: &mesh_layout,
                buffers: &[MeshVertex::layout()],
                format,
                blend: Some(ALPHA_BLEND),
                write_mask: wgpu::ColorWrites::ALL,
                depth: depth_state(true, wgpu::CompareFunction::Less),
            },
        );

        // Overlay splat parts
        let splat_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Splat Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("../shaders/splat.wgsl").into()),
        });
        let splat_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Splat Bind Group Layout"),
            entries: &[
                // Splat storage buffer
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: true },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
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
        let splat_pipeline = create_pipeline(
            device,
            PipelineDesc {
                label: "Splat Pipeline",
                shader: &splat_shader,
                layout: &splat_layout,
                buffers: &[],
                format,
                blend: Some(ALPHA_BLEND),
                write_mask: wgpu::ColorWrites::ALL,
                // Translucent splats test against depth but do not write it
                depth: depth_state(false, wgpu::CompareFunction::Less),
            },
        );

        // Placeholders until the first frame / mask arrives
        let video = Self::bind_texture(
            device,
            queue,
            &background_layout,
            &sampler,
            &background_uniforms,
            "Video Texture",
            wgpu::TextureFormat::Rgba8UnormSrgb,
            1,
            1,
            Some(&[0, 0, 0, 255]),
        );
        let mask = Self::bind_texture(
            device,
            queue,
            &occlusion_layout,
            &sampler,
            &occlusion_uniforms,
            "Mask Texture",
            wgpu::TextureFormat::R8Unorm,
            1,
            1,
            Some(&[0]),
        );

        Self {
            sampler,
            background_pipeline,
            background_layout,
            background_uniforms,
            video,
            last_video_frame: 0,
            occlusion_pipeline,
            occlusion_layout,
            occlusion_uniforms,
            mask,
            mesh_pipeline,
            mesh_layout,
            splat_pipeline,
            splat_layout,
            parts: Vec::new(),
            depth_view: Self::create_depth_view(device, width, height),
        }
    }

    fn create_depth_view(device: &wgpu::Device, width: u32, height: u32) -> wgpu::TextureView {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Depth Texture"),
            size: wgpu::Extent3d {
                width: width.max(1),
                height: height.max(1),
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: DEPTH_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        });
        texture.create_view(&wgpu::TextureViewDescriptor::default())
    }

    #[allow(clippy::too_many_arguments)]
    fn bind_texture(
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        layout: &wgpu::BindGroupLayout,
        sampler: &wgpu::Sampler,
        uniforms: &wgpu::Buffer,
        label: &str,
        format: wgpu::TextureFormat,
        width: u32,
        height: u32,
        initial: Option<&[u8]>,
    ) -> BoundTexture {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
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

        if let Some(data) = initial {
            Self::write_texture(queue, &texture, data, width, height);
        }

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(label),
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

        BoundTexture {
            texture,
            bind_group,
        }
    }

    fn write_texture(queue: &wgpu::Queue, texture: &wgpu::Texture, data: &[u8], width: u32, height: u32) {
        let bytes_per_pixel = texture.format().block_copy_size(None).unwrap_or(4);
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
                bytes_per_row: Some(width * bytes_per_pixel),
                rows_per_image: Some(height),
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
    }

    /// Recreate the depth attachment for a new surface size
    pub fn resize(&mut self, device: &wgpu::Device, width: u32, height: u32) {
        self.depth_view = Self::create_depth_view(device, width, height);
    }

    /// Upload the latest camera frame if it is new
    pub fn upload_frame(&mut self, device: &wgpu::Device, queue: &wgpu::Queue, frame: &CameraFrame) {
        if frame.frame_number <= self.last_video_frame {
            return;
        }
        self.last_video_frame = frame.frame_number;

        let size = self.video.texture.size();
        if size.width != frame.width || size.height != frame.height {
            log::info!("Creating video texture: {}x{}", frame.width, frame.height);
            self.video = Self::bind_texture(
                device,
                queue,
                &self.background_layout,
                &self.sampler,
                &self.background_uniforms,
                "Video Texture",
                wgpu::TextureFormat::Rgba8UnormSrgb,
                frame.width,
                frame.height,
                None,
            );
        }
        Self::write_texture(queue, &self.video.texture, &frame.data, frame.width, frame.height);
    }

    /// New camera session: frame numbers restart
    pub fn reset_video(&mut self) {
        self.last_video_frame = 0;
    }

    pub fn upload_mask(&mut self, device: &wgpu::Device, queue: &wgpu::Queue, upload: MaskUpload<'_>) {
        let size = self.mask.texture.size();
        if size.width != upload.width || size.height != upload.height {
            log::debug!("Creating mask texture: {}x{}", upload.width, upload.height);
            self.mask = Self::bind_texture(
                device,
                queue,
                &self.occlusion_layout,
                &self.sampler,
                &self.occlusion_uniforms,
                "Mask Texture",
                wgpu::TextureFormat::R8Unorm,
                upload.width,
                upload.height,
                None,
            );
        }
        Self::write_texture(queue, &self.mask.texture, upload.texels, upload.width, upload.height);
    }

    /// Build GPU buffers for the active asset's parts
    pub fn upload_asset(&mut self, device: &wgpu::Device, asset: &OverlayAsset) {
        self.parts = asset
            .parts()
            .iter()
            .map(|part| {
                let label = format!("Overlay Part ({})", part.side.name());
                match &part.geometry {
                    PartGeometry::PointCloud { cloud, .. } => {
                        let splats = types::gpu_splats(cloud);
                        let splat_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                            label: Some(&label),
                            contents: bytemuck::cast_slice(&splats),
                            usage: wgpu::BufferUsages::STORAGE,
                        });
                        let uniform_buffer = uniform_buffer(
                            device,
                            &label,
                            std::mem::size_of::<SplatUniforms>(),
                        );
                        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                            label: Some(&label),
                            layout: &self.splat_layout,
                            entries: &[
                                wgpu::BindGroupEntry {
                                    binding: 0,
                                    resource: splat_buffer.as_entire_binding(),
                                },
                                wgpu::BindGroupEntry {
                                    binding: 1,
                                    resource: uniform_buffer.as_entire_binding(),
                                },
                            ],
                        });
                        PartGpu {
                            side: part.side,
                            buffers: PartBuffers::Splats {
                                count: splats.len() as u32,
                            },
                            uniform_buffer,
                            bind_group,
                        }
                    }
                    PartGeometry::Mesh(mesh) | PartGeometry::Primitive(mesh) => {
                        let vertices = types::mesh_vertices(mesh);
                        let vertex_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                            label: Some(&label),
                            contents: bytemuck::cast_slice(&vertices),
                            usage: wgpu::BufferUsages::VERTEX,
                        });
                        let index_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                            label: Some(&label),
                            contents: bytemuck::cast_slice(&mesh.indices),
                            usage: wgpu::BufferUsages::INDEX,
                        });
                        let uniform_buffer =
                            uniform_buffer(device, &label, std::mem::size_of::<PartUniforms>());
                        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                            label: Some(&label),
                            layout: &self.mesh_layout,
                            entries: &[wgpu::BindGroupEntry {
                                binding: 0,
                                resource: uniform_buffer.as_entire_binding(),
                            }],
                        });
                        PartGpu {
                            side: part.side,
                            buffers: PartBuffers::Mesh {
                                vertex_buffer,
                                index_buffer,
                                index_count: mesh.indices.len() as u32,
                            },
                            uniform_buffer,
                            bind_group,
                        }
                    }
                }
            })
            .collect();
        log::info!("Uploaded {} overlay parts", self.parts.len());
    }

    fn part(&self, side: Side) -> Option<&PartGpu> {
        self.parts.iter().find(|p| p.side == side)
    }

    /// Render the draw list into `target`
    pub fn render(
        &self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        target: &wgpu::TextureView,
        view_proj: Mat4,
        items: &[DrawItem],
    ) {
        // Uniform writes land before the submit below
        for item in items {
            match item {
                DrawItem::Background {
                    model_view_proj,
                    flip_u,
                } => queue.write_buffer(
                    &self.background_uniforms,
                    0,
                    bytemuck::bytes_of(&QuadUniforms::new(*model_view_proj, *flip_u)),
                ),
                DrawItem::Occlusion(uniforms) => {
                    queue.write_buffer(&self.occlusion_uniforms, 0, bytemuck::bytes_of(uniforms))
                }
                DrawItem::Part {
                    side,
                    model,
                    model_view_proj,
                    color,
                } => {
                    let Some(part) = self.part(*side) else {
                        continue;
                    };
                    match part.buffers {
                        PartBuffers::Mesh { .. } => queue.write_buffer(
                            &part.uniform_buffer,
                            0,
                            bytemuck::bytes_of(&PartUniforms::new(*model_view_proj, *model, *color)),
                        ),
                        PartBuffers::Splats { .. } => queue.write_buffer(
                            &part.uniform_buffer,
                            0,
                            bytemuck::bytes_of(&SplatUniforms::new(view_proj, *model, *color)),
                        ),
                    }
                }
            }
        }

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Scene Encoder"),
        });

        {
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Scene Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: target,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: &self.depth_view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(1.0),
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
            });

            for item in items {
                match item {
                    DrawItem::Background { .. } => {
                        render_pass.set_pipeline(&self.background_pipeline);
                        render_pass.set_bind_group(0, &self.video.bind_group, &[]);
                        render_pass.draw(0..6, 0..1);
                    }
                    DrawItem::Occlusion(_) => {
                        render_pass.set_pipeline(&self.occlusion_pipeline);
                        render_pass.set_bind_group(0, &self.mask.bind_group, &[]);
                        render_pass.draw(0..6, 0..1);
                    }
                    DrawItem::Part { side, .. } => {
                        let Some(part) = self.part(*side) else {
                            continue;
                        };
                        match &part.buffers {
                            PartBuffers::Mesh {
                                vertex_buffer,
                                index_buffer,
                                index_count,
                            } => {
                                render_pass.set_pipeline(&self.mesh_pipeline);
                                render_pass.set_bind_group(0, &part.bind_group, &[]);
                                render_pass.set_vertex_buffer(0, vertex_buffer.slice(..));
                                render_pass
                                    .set_index_buffer(index_buffer.slice(..), wgpu::IndexFormat::Uint32);
                                render_pass.draw_indexed(0..*index_count, 0, 0..1);
                            }
                            PartBuffers::Splats { count } => {
                                render_pass.set_pipeline(&self.splat_pipeline);
                                render_pass.set_bind_group(0, &part.bind_group, &[]);
                                // Instanced rendering: 6 vertices per quad, one instance per splat
                                render_pass.draw(0..6, 0..*count);
                            }
                        }
                    }
                }
            }
        }

        queue.submit(std::iter::once(encoder.finish()));
    }
}
