use serde::{Deserialize, Serialize};

/// Pixel layout of a frame's storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 8 bits per channel RGBA.
    Rgba8,
    /// 16-bit half-float per channel RGBA, used for HDR content.
    Rgba16Float,
    /// Packed 10-bit RGB with a 2-bit alpha channel.
    Rgb10A2,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgba8 => 4,
            PixelFormat::Rgba16Float => 8,
            PixelFormat::Rgb10A2 => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColorSpace {
    Srgb,
    Bt709,
    Bt2020,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferFunction {
    Sdr,
    Linear,
    Hlg,
    Pq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColorRange {
    Full,
    Limited,
}

/// Color configuration of a stream. All sources feeding one compositor
/// must agree on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorInfo {
    pub space: ColorSpace,
    pub transfer: TransferFunction,
    pub range: ColorRange,
}

impl ColorInfo {
    pub const SDR_BT709: ColorInfo = ColorInfo {
        space: ColorSpace::Bt709,
        transfer: TransferFunction::Sdr,
        range: ColorRange::Full,
    };

    pub fn is_hdr(&self) -> bool {
        matches!(self.transfer, TransferFunction::Hlg | TransferFunction::Pq)
    }
}

impl Default for ColorInfo {
    fn default() -> Self {
        Self::SDR_BT709
    }
}

/// Dimensions plus pixel and color configuration of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameFormat {
    pub width: u32,
    pub height: u32,
    pub pixel: PixelFormat,
    pub color: ColorInfo,
}

impl FrameFormat {
    pub fn new(width: u32, height: u32, pixel: PixelFormat, color: ColorInfo) -> Self {
        assert!(width > 0 && height > 0, "frame dimensions must be non-zero");
        Self {
            width,
            height,
            pixel,
            color,
        }
    }

    pub fn sdr(width: u32, height: u32) -> Self {
        Self::new(width, height, PixelFormat::Rgba8, ColorInfo::SDR_BT709)
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Tightly packed byte length of one frame in this format.
    pub fn buffer_len(&self) -> usize {
        self.width as usize * self.height as usize * self.pixel.bytes_per_pixel()
    }
}
