use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::format::FrameFormat;

/// Opaque per-frame metadata carried through processing stages untouched.
pub type FrameMetadata = Arc<dyn Any + Send + Sync>;

type Releaser<R> = Box<dyn FnOnce(R) + Send>;

/// An owned frame wrapping some resource `R` (a texture, a CPU pixel
/// buffer, ...) together with its presentation timestamp.
///
/// Ownership is linear: the holder must eventually release the frame,
/// which hands the resource back to whoever produced it. Dropping a
/// frame releases it too, so a frame can never leak its resource, but
/// explicit [`Frame::release`] is preferred at the points where the
/// hand-back is part of the protocol.
pub struct Frame<R> {
    resource: Option<R>,
    releaser: Option<Releaser<R>>,
    presentation_time_us: i64,
    format: FrameFormat,
    metadata: Option<FrameMetadata>,
}

impl<R> Frame<R> {
    /// Wraps `resource` with a release callback invoked exactly once when
    /// the frame is released or dropped.
    pub fn new(
        resource: R,
        format: FrameFormat,
        presentation_time_us: i64,
        releaser: impl FnOnce(R) + Send + 'static,
    ) -> Self {
        Self {
            resource: Some(resource),
            releaser: Some(Box::new(releaser)),
            presentation_time_us,
            format,
            metadata: None,
        }
    }

    /// Wraps `resource` without a release callback; the resource is simply
    /// dropped when the frame goes away.
    pub fn unmanaged(resource: R, format: FrameFormat, presentation_time_us: i64) -> Self {
        Self {
            resource: Some(resource),
            releaser: None,
            presentation_time_us,
            format,
            metadata: None,
        }
    }

    pub fn with_presentation_time(mut self, presentation_time_us: i64) -> Self {
        self.presentation_time_us = presentation_time_us;
        self
    }

    pub fn with_metadata(mut self, metadata: FrameMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn resource(&self) -> &R {
        self.resource
            .as_ref()
            .expect("frame resource already taken")
    }

    pub fn resource_mut(&mut self) -> &mut R {
        self.resource
            .as_mut()
            .expect("frame resource already taken")
    }

    pub fn presentation_time_us(&self) -> i64 {
        self.presentation_time_us
    }

    pub fn format(&self) -> &FrameFormat {
        &self.format
    }

    pub fn metadata(&self) -> Option<&FrameMetadata> {
        self.metadata.as_ref()
    }

    /// Releases the frame, invoking the release callback with the resource.
    pub fn release(self) {
        // Drop does the work; the method exists to make the hand-back
        // explicit at call sites.
        drop(self);
    }

    /// Decomposes the frame without running the release callback, returning
    /// the callback so the caller can rewrap the resource.
    #[allow(clippy::type_complexity)]
    pub fn into_parts(
        mut self,
    ) -> (
        R,
        FrameFormat,
        i64,
        Option<FrameMetadata>,
        Option<Releaser<R>>,
    ) {
        let resource = self.resource.take().expect("frame resource already taken");
        let releaser = self.releaser.take();
        let metadata = self.metadata.take();
        (
            resource,
            self.format,
            self.presentation_time_us,
            metadata,
            releaser,
        )
    }
}

impl<R> Drop for Frame<R> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            if let Some(releaser) = self.releaser.take() {
                releaser(resource);
            }
        }
    }
}

impl<R> fmt::Debug for Frame<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("presentation_time_us", &self.presentation_time_us)
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

/// A tightly packed CPU pixel buffer, the resource type for frames that
/// have been read back from the GPU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    format: FrameFormat,
    data: Vec<u8>,
}

impl PixelBuffer {
    /// Allocates a zeroed buffer sized for `format`.
    pub fn new(format: FrameFormat) -> Self {
        Self {
            data: vec![0; format.buffer_len()],
            format,
        }
    }

    pub fn from_data(format: FrameFormat, data: Vec<u8>) -> Self {
        assert_eq!(
            data.len(),
            format.buffer_len(),
            "pixel data length does not match format"
        );
        Self { format, data }
    }

    pub fn format(&self) -> &FrameFormat {
        &self.format
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}
