use std::borrow::Cow;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use frame::OverlaySettings;
use glam::{vec3, Mat4};
use wgpu::util::DeviceExt;

use crate::{GpuContext, GpuFence, RendererError};

/// Placement matrix for an overlay: pin the overlay anchor to the
/// background anchor, then scale and rotate around it. Anchors are in
/// normalized device coordinates.
pub fn overlay_transform(settings: &OverlaySettings) -> Mat4 {
    let (bx, by) = settings.background_anchor;
    let (ax, ay) = settings.overlay_anchor;
    let (sx, sy) = settings.scale;
    Mat4::from_translation(vec3(bx, by, 0.0))
        * Mat4::from_rotation_z(settings.rotation_degrees.to_radians())
        * Mat4::from_scale(vec3(sx, sy, 1.0))
        * Mat4::from_translation(vec3(-ax, -ay, 0.0))
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct LayerUniforms {
    transform: [[f32; 4]; 4],
    alpha_scale: f32,
    luminance_multiplier: f32,
    _padding: [f32; 2],
}

/// One input layer for a composite draw. Layers are passed top-most
/// first and drawn bottom-up.
pub struct CompositeLayer<'a> {
    pub texture: &'a wgpu::Texture,
    pub settings: OverlaySettings,
}

/// Renders a stack of layers into one output texture with source-over
/// blending, straight (non-premultiplied) alpha.
pub struct CompositeProgram {
    ctx: Arc<GpuContext>,
    pipeline: wgpu::RenderPipeline,
    texture_bind_group_layout: wgpu::BindGroupLayout,
    uniform_bind_group_layout: wgpu::BindGroupLayout,
    vertex_buffer: wgpu::Buffer,
    index_buffer: wgpu::Buffer,
    sampler: wgpu::Sampler,
    format: wgpu::TextureFormat,
}

impl CompositeProgram {
    pub fn new(ctx: Arc<GpuContext>, format: wgpu::TextureFormat) -> Self {
        let device = &ctx.device;
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Composite Shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(include_str!(
                "shaders/composite.wgsl"
            ))),
        });

        let texture_bind_group_layout = crate::create_texture_bind_group_layout(device);
        let uniform_bind_group_layout = crate::create_uniform_bind_group_layout(device);
        let (vertex_buffer, index_buffer) = crate::create_quad_buffers(device);

        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Composite Pipeline Layout"),
            bind_group_layouts: &[&texture_bind_group_layout, &uniform_bind_group_layout],
            push_constant_ranges: &[],
        });

        // Source-over with straight alpha:
        //   rgb = src.rgb * src.a + dst.rgb * (1 - src.a)
        //   a   = src.a + dst.a * (1 - src.a)
        let blend = wgpu::BlendState {
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

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Composite Pipeline"),
            layout: Some(&layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: "vs_main",
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                buffers: &[crate::vertex_layout()],
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: "fs_main",
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                targets: &[Some(wgpu::ColorTargetState {
                    format,
                    blend: Some(blend),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: None,
                polygon_mode: wgpu::PolygonMode::Fill,
                unclipped_depth: false,
                conservative: false,
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState {
                count: 1,
                mask: !0,
                alpha_to_coverage_enabled: false,
            },
            multiview: None,
            cache: None,
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Composite Sampler"),
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            ..Default::default()
        });

        Self {
            ctx,
            pipeline,
            texture_bind_group_layout,
            uniform_bind_group_layout,
            vertex_buffer,
            index_buffer,
            sampler,
            format,
        }
    }

    pub fn context(&self) -> &Arc<GpuContext> {
        &self.ctx
    }

    pub fn output_format(&self) -> wgpu::TextureFormat {
        self.format
    }

    /// Allocates an output texture compatible with this program.
    pub fn create_output_texture(&self, width: u32, height: u32) -> wgpu::Texture {
        self.ctx
            .create_target("composite.output", width, height, self.format)
    }

    /// Draws `layers` into `output`, bottom layer first so earlier entries
    /// end up on top, and returns a fence for the submission.
    pub fn draw_layers(
        &self,
        layers: &[CompositeLayer<'_>],
        output: &wgpu::Texture,
    ) -> Result<GpuFence, RendererError> {
        assert!(!layers.is_empty(), "composite draw needs at least one layer");
        let _span = tracing::info_span!("composite_pass", layers = layers.len()).entered();
        let device = &self.ctx.device;
        let output_view = output.create_view(&wgpu::TextureViewDescriptor::default());

        // Per-layer bind groups are built before the pass because the pass
        // borrows them for its full lifetime.
        let mut bindings = Vec::with_capacity(layers.len());
        for layer in layers {
            let view = layer
                .texture
                .create_view(&wgpu::TextureViewDescriptor::default());
            let uniforms = LayerUniforms {
                transform: overlay_transform(&layer.settings).to_cols_array_2d(),
                alpha_scale: layer.settings.alpha_scale,
                luminance_multiplier: layer.settings.luminance_multiplier,
                _padding: [0.0; 2],
            };
            let uniform_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("composite.layer-uniforms"),
                contents: bytemuck::cast_slice(&[uniforms]),
                usage: wgpu::BufferUsages::UNIFORM,
            });
            let texture_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("composite.layer-texture"),
                layout: &self.texture_bind_group_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::TextureView(&view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::Sampler(&self.sampler),
                    },
                ],
            });
            let uniform_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("composite.layer-uniform-bind"),
                layout: &self.uniform_bind_group_layout,
                entries: &[wgpu::BindGroupEntry {
                    binding: 0,
                    resource: uniform_buffer.as_entire_binding(),
                }],
            });
            bindings.push((texture_bind_group, uniform_bind_group, uniform_buffer));
        }

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Composite Encoder"),
        });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Composite Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &output_view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_vertex_buffer(0, self.vertex_buffer.slice(..));
            pass.set_index_buffer(self.index_buffer.slice(..), wgpu::IndexFormat::Uint16);
            // Bottom-up: the last entry is the backdrop, the first ends up
            // on top.
            for (texture_bind_group, uniform_bind_group, _) in bindings.iter().rev() {
                pass.set_bind_group(0, texture_bind_group, &[]);
                pass.set_bind_group(1, uniform_bind_group, &[]);
                pass.draw_indexed(0..crate::INDICES.len() as u32, 0, 0..1);
            }
        }
        self.ctx.queue.submit(std::iter::once(encoder.finish()));
        Ok(GpuFence::after_submission(Arc::clone(&self.ctx)))
    }
}
