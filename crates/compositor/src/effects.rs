use std::sync::Arc;

use frame::{Frame, FrameSink, Packet, PipelineError};
use glam::Mat4;
use gpu_tasks::TaskExecutor;
use renderer::{GpuContext, MatrixProgram, MatrixUniforms};

use crate::stage::{ShaderStage, StageInput, StageProcessor};

/// A single matrix-based effect. Transforms act on vertex positions,
/// color matrices on RGBA values.
#[derive(Debug, Clone, Copy)]
pub enum Effect {
    Transform(Mat4),
    ColorMatrix(Mat4),
}

/// The folded parameters of a run of matrix effects, applied as one
/// draw. Geometric and color matrices act on different domains, so
/// folding each kind independently is numerically equivalent to applying
/// the effects in sequence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CombinedMatrix {
    pub transform: Mat4,
    pub color: Mat4,
}

impl CombinedMatrix {
    pub const IDENTITY: CombinedMatrix = CombinedMatrix {
        transform: Mat4::IDENTITY,
        color: Mat4::IDENTITY,
    };
}

/// Collapses consecutive matrix effects into a single combined pass.
/// Application order is left to right, so later matrices multiply from
/// the left.
pub fn combine_effects(effects: &[Effect]) -> CombinedMatrix {
    let mut combined = CombinedMatrix::IDENTITY;
    for effect in effects {
        match effect {
            Effect::Transform(matrix) => combined.transform = *matrix * combined.transform,
            Effect::ColorMatrix(matrix) => combined.color = *matrix * combined.color,
        }
    }
    combined
}

/// Shader stage applying one [`CombinedMatrix`] per frame.
pub struct MatrixStage {
    program: MatrixProgram,
    combined: CombinedMatrix,
}

impl MatrixStage {
    pub fn new(program: MatrixProgram, combined: CombinedMatrix) -> Self {
        Self { program, combined }
    }
}

impl ShaderStage for MatrixStage {
    type Input = wgpu::Texture;
    type Output = wgpu::Texture;

    fn process(&mut self, input: &Frame<wgpu::Texture>) -> Result<Frame<wgpu::Texture>, PipelineError> {
        let (width, height) = input.format().size();
        let output = self.program.create_output_texture(width, height);
        self.program.draw(
            input.resource(),
            &output,
            MatrixUniforms::new(self.combined.transform, self.combined.color),
        )?;
        Ok(Frame::unmanaged(
            output,
            *input.format(),
            input.presentation_time_us(),
        ))
    }
}

/// An effect chain collapsed to its minimal number of GPU passes. All
/// matrix effects fold into one [`MatrixStage`].
pub struct EffectChain {
    processor: StageProcessor<MatrixStage>,
}

impl EffectChain {
    pub fn new(
        ctx: Arc<GpuContext>,
        executor: TaskExecutor,
        effects: &[Effect],
        format: wgpu::TextureFormat,
    ) -> Self {
        let combined = combine_effects(effects);
        let program = MatrixProgram::new(ctx, format);
        let processor = StageProcessor::new(MatrixStage::new(program, combined), executor);
        Self { processor }
    }

    pub fn input(&self) -> Arc<StageInput<MatrixStage>> {
        self.processor.input()
    }

    pub fn set_output(&self, sink: Arc<dyn FrameSink<Packet<Frame<wgpu::Texture>>>>) {
        self.processor.set_output(sink);
    }

    pub fn flush(&self) {
        self.processor.flush();
    }

    pub fn release(&self) {
        self.processor.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{vec4, Vec4};

    fn sample_points() -> Vec<Vec4> {
        vec![
            vec4(0.0, 0.0, 0.0, 1.0),
            vec4(1.0, -1.0, 0.0, 1.0),
            vec4(-0.5, 0.25, 0.0, 1.0),
        ]
    }

    #[test]
    fn empty_chain_is_identity() {
        assert_eq!(combine_effects(&[]), CombinedMatrix::IDENTITY);
    }

    #[test]
    fn combined_transform_matches_sequential_application() {
        let effects = [
            Effect::Transform(Mat4::from_rotation_z(0.3)),
            Effect::Transform(Mat4::from_scale(glam::vec3(2.0, 0.5, 1.0))),
            Effect::Transform(Mat4::from_translation(glam::vec3(0.1, -0.2, 0.0))),
        ];
        let combined = combine_effects(&effects);
        for point in sample_points() {
            let mut sequential = point;
            for effect in &effects {
                if let Effect::Transform(m) = effect {
                    sequential = *m * sequential;
                }
            }
            let folded = combined.transform * point;
            assert!(
                (sequential - folded).length() < 1e-5,
                "sequential {sequential:?} vs folded {folded:?}"
            );
        }
    }

    #[test]
    fn color_and_geometry_fold_independently() {
        let grayscale = Mat4::from_cols_array(&[
            0.299, 0.299, 0.299, 0.0, //
            0.587, 0.587, 0.587, 0.0, //
            0.114, 0.114, 0.114, 0.0, //
            0.0, 0.0, 0.0, 1.0,
        ]);
        let darken = Mat4::from_scale(glam::vec3(0.5, 0.5, 0.5));
        let rotate = Mat4::from_rotation_z(1.0);

        let combined = combine_effects(&[
            Effect::ColorMatrix(grayscale),
            Effect::Transform(rotate),
            Effect::ColorMatrix(darken),
        ]);
        assert!((combined.transform - rotate).abs_diff_eq(Mat4::ZERO, 1e-6));

        let color = vec4(0.8, 0.2, 0.4, 1.0);
        let sequential = darken * (grayscale * color);
        let folded = combined.color * color;
        assert!((sequential - folded).length() < 1e-5);
    }
}
