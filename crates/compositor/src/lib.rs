//! Multi-source video compositing and frame processing.
//!
//! The [`Compositor`] merges frames from several registered sources into
//! one output stream, pacing on the primary source and picking the
//! closest frame from each secondary source. Around it sit
//! [`StageProcessor`]s for single-input effect passes, CPU conversion
//! stages, and a pooled CPU frame queue for delivering readback output.

mod blender;
mod compositor;
mod convert;
mod effects;
mod frame_queue;
mod select;
mod stage;

pub use blender::{BlendLayer, LayerBlender};
pub use compositor::{
    CompositeSettingsProvider, Compositor, CompositorOutput, DefaultCompositeSettings,
    FrameReleaser,
};
pub use convert::{BitmapToTextureStage, TextureToBitmapStage};
pub use effects::{combine_effects, CombinedMatrix, Effect, EffectChain, MatrixStage};
pub use frame_queue::{BufferFrame, PooledFrameQueue};
pub use stage::{connect, ShaderStage, StageInput, StageProcessor};
