use frame::{BoxFence, OverlaySettings, PipelineError};
use renderer::{CompositeLayer, CompositeProgram};

/// One input layer for a blend. Layers are ordered top-most first,
/// with the primary source's frame at index 0.
pub struct BlendLayer<'a, T> {
    pub texture: &'a T,
    pub size: (u32, u32),
    pub presentation_time_us: i64,
    pub settings: OverlaySettings,
}

/// The GPU half of the compositor: allocates output textures and blends
/// layer stacks into them. Abstract so the compositing algorithm can be
/// exercised without a device.
pub trait LayerBlender: Send + 'static {
    type Texture: Send + Sync + 'static;

    fn allocate(&mut self, width: u32, height: u32) -> Result<Self::Texture, PipelineError>;

    /// Draws the stack into `output` and returns a fence for the work.
    fn draw(
        &mut self,
        layers: &[BlendLayer<'_, Self::Texture>],
        output: &Self::Texture,
    ) -> Result<BoxFence, PipelineError>;
}

impl LayerBlender for CompositeProgram {
    type Texture = wgpu::Texture;

    fn allocate(&mut self, width: u32, height: u32) -> Result<wgpu::Texture, PipelineError> {
        Ok(self.create_output_texture(width, height))
    }

    fn draw(
        &mut self,
        layers: &[BlendLayer<'_, wgpu::Texture>],
        output: &wgpu::Texture,
    ) -> Result<BoxFence, PipelineError> {
        let gpu_layers: Vec<CompositeLayer<'_>> = layers
            .iter()
            .map(|layer| CompositeLayer {
                texture: layer.texture,
                settings: layer.settings,
            })
            .collect();
        let fence = self.draw_layers(&gpu_layers, output)?;
        Ok(Box::new(fence))
    }
}
