//! Shared frame model for the video compositing pipeline.
//!
//! Frames move through the pipeline as owned values: whoever holds a
//! [`Frame`] owns the underlying resource until it is released back to
//! its producer. Streams of frames are carried as [`Packet`]s so that
//! end-of-stream travels in-band with the payloads.

mod error;
mod fence;
mod format;
mod frame;
mod overlay;
mod packet;
mod sink;

pub use error::PipelineError;
pub use fence::{BoxFence, Fence, SignaledFence};
pub use format::{ColorInfo, ColorRange, ColorSpace, FrameFormat, PixelFormat, TransferFunction};
pub use frame::{Frame, FrameMetadata, PixelBuffer};
pub use overlay::OverlaySettings;
pub use packet::Packet;
pub use sink::{CapacityWaker, FrameSink};
