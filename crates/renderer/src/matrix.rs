use std::borrow::Cow;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::Mat4;
use wgpu::util::DeviceExt;

use crate::{GpuContext, RendererError};

/// Uniforms for one matrix pass: a vertex-space transformation and an
/// RGBA color matrix applied per fragment.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct MatrixUniforms {
    pub transform: [[f32; 4]; 4],
    pub color_matrix: [[f32; 4]; 4],
}

impl MatrixUniforms {
    pub fn new(transform: Mat4, color_matrix: Mat4) -> Self {
        Self {
            transform: transform.to_cols_array_2d(),
            color_matrix: color_matrix.to_cols_array_2d(),
        }
    }
}

/// Single-input effect pass applying a combined geometric transform and
/// color matrix in one draw.
pub struct MatrixProgram {
    ctx: Arc<GpuContext>,
    pipeline: wgpu::RenderPipeline,
    texture_bind_group_layout: wgpu::BindGroupLayout,
    uniform_bind_group_layout: wgpu::BindGroupLayout,
    vertex_buffer: wgpu::Buffer,
    index_buffer: wgpu::Buffer,
    sampler: wgpu::Sampler,
    format: wgpu::TextureFormat,
}

impl MatrixProgram {
    pub fn new(ctx: Arc<GpuContext>, format: wgpu::TextureFormat) -> Self {
        let device = &ctx.device;
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Matrix Shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(include_str!("shaders/matrix.wgsl"))),
        });

        let texture_bind_group_layout = crate::create_texture_bind_group_layout(device);
        let uniform_bind_group_layout = crate::create_uniform_bind_group_layout(device);
        let (vertex_buffer, index_buffer) = crate::create_quad_buffers(device);

        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Matrix Pipeline Layout"),
            bind_group_layouts: &[&texture_bind_group_layout, &uniform_bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Matrix Pipeline"),
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
                    blend: None,
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
            label: Some("Matrix Sampler"),
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

    pub fn create_output_texture(&self, width: u32, height: u32) -> wgpu::Texture {
        self.ctx
            .create_target("matrix.output", width, height, self.format)
    }

    /// Draws `input` into `output` through the matrix pass.
    pub fn draw(
        &self,
        input: &wgpu::Texture,
        output: &wgpu::Texture,
        uniforms: MatrixUniforms,
    ) -> Result<(), RendererError> {
        let _span = tracing::info_span!("matrix_pass").entered();
        let device = &self.ctx.device;
        let input_view = input.create_view(&wgpu::TextureViewDescriptor::default());
        let output_view = output.create_view(&wgpu::TextureViewDescriptor::default());

        let uniform_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("matrix.uniforms"),
            contents: bytemuck::cast_slice(&[uniforms]),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let texture_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("matrix.input"),
            layout: &self.texture_bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&input_view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
            ],
        });
        let uniform_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("matrix.uniform-bind"),
            layout: &self.uniform_bind_group_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: uniform_buffer.as_entire_binding(),
            }],
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Matrix Encoder"),
        });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Matrix Pass"),
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
            pass.set_bind_group(0, &texture_bind_group, &[]);
            pass.set_bind_group(1, &uniform_bind_group, &[]);
            pass.draw_indexed(0..crate::INDICES.len() as u32, 0, 0..1);
        }
        self.ctx.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::{Bitmap, DynamicRange, TextureReadback, TextureUploader};
    use std::time::Duration;

    fn init_context() -> Option<Arc<GpuContext>> {
        match GpuContext::new() {
            Ok(ctx) => Some(Arc::new(ctx)),
            Err(e) => {
                eprintln!("skipping GPU test, no adapter available: {e}");
                None
            }
        }
    }

    #[test]
    fn color_matrix_is_applied_per_pixel() {
        let Some(ctx) = init_context() else { return };
        let uploader = TextureUploader::new(Arc::clone(&ctx), DynamicRange::Sdr);
        let white = image::RgbaImage::from_pixel(2, 2, image::Rgba([255, 255, 255, 255]));
        let input = uploader.upload(&Bitmap::Rgba8(white)).unwrap();

        let program = MatrixProgram::new(Arc::clone(&ctx), wgpu::TextureFormat::Rgba8Unorm);
        let output = program.create_output_texture(2, 2);
        let darken = Mat4::from_scale(glam::vec3(0.5, 0.5, 0.5));
        program
            .draw(&input, &output, MatrixUniforms::new(Mat4::IDENTITY, darken))
            .unwrap();
        ctx.device.poll(wgpu::Maintain::Wait);
        std::thread::sleep(Duration::from_millis(1));

        let mut readback = TextureReadback::new(ctx, DynamicRange::Sdr);
        let Bitmap::Rgba8(out) = readback.read(&output, 2, 2).unwrap() else {
            panic!("expected an SDR bitmap");
        };
        let pixel = out.get_pixel(1, 1).0;
        assert!((pixel[0] as i32 - 128).abs() <= 2, "got {pixel:?}");
        assert!((pixel[1] as i32 - 128).abs() <= 2, "got {pixel:?}");
        assert!((pixel[2] as i32 - 128).abs() <= 2, "got {pixel:?}");
        assert_eq!(pixel[3], 255);
    }
}
