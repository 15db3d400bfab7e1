use std::sync::Arc;

use frame::{Frame, FrameFormat, PipelineError};
use renderer::{Bitmap, DynamicRange, GpuContext, TextureReadback, TextureUploader};

use crate::stage::ShaderStage;

/// Uploads CPU bitmaps into sampled textures. One converter handles one
/// dynamic range; SDR and HDR content never share an instance.
pub struct BitmapToTextureStage {
    uploader: TextureUploader,
}

impl BitmapToTextureStage {
    pub fn new(ctx: Arc<GpuContext>, range: DynamicRange) -> Self {
        Self {
            uploader: TextureUploader::new(ctx, range),
        }
    }
}

impl ShaderStage for BitmapToTextureStage {
    type Input = Bitmap;
    type Output = wgpu::Texture;

    fn process(&mut self, input: &Frame<Bitmap>) -> Result<Frame<wgpu::Texture>, PipelineError> {
        let texture = self.uploader.upload(input.resource())?;
        let (width, height) = input.resource().dimensions();
        let format = FrameFormat::new(
            width,
            height,
            self.uploader.dynamic_range().pixel_format(),
            input.format().color,
        );
        // The texture is owned by the frame; dropping it frees the GPU
        // allocation, so no releaser is needed.
        Ok(Frame::unmanaged(
            texture,
            format,
            input.presentation_time_us(),
        ))
    }
}

/// Reads textures back into CPU bitmaps, reusing its staging buffer
/// while dimensions stay stable.
pub struct TextureToBitmapStage {
    readback: TextureReadback,
}

impl TextureToBitmapStage {
    pub fn new(ctx: Arc<GpuContext>, range: DynamicRange) -> Self {
        Self {
            readback: TextureReadback::new(ctx, range),
        }
    }
}

impl ShaderStage for TextureToBitmapStage {
    type Input = wgpu::Texture;
    type Output = Bitmap;

    fn process(&mut self, input: &Frame<wgpu::Texture>) -> Result<Frame<Bitmap>, PipelineError> {
        let (width, height) = input.format().size();
        let bitmap = self.readback.read(input.resource(), width, height)?;
        let format = FrameFormat::new(
            width,
            height,
            self.readback.dynamic_range().pixel_format(),
            input.format().color,
        );
        Ok(Frame::unmanaged(
            bitmap,
            format,
            input.presentation_time_us(),
        ))
    }
}
