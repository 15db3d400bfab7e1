use std::sync::mpsc::{channel, TryRecvError};
use std::sync::Arc;
use std::time::Duration;

use frame::PixelFormat;

use crate::{GpuContext, RendererError};

const COPY_ALIGNMENT: u32 = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;

/// Which texture format a converter pair operates in. SDR content uses
/// 8-bit RGBA; HDR content uses half-float RGBA or the packed 10-bit
/// layout. A converter handles exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DynamicRange {
    Sdr,
    HdrHalfFloat,
    HdrPacked10,
}

impl DynamicRange {
    pub fn pixel_format(self) -> PixelFormat {
        match self {
            DynamicRange::Sdr => PixelFormat::Rgba8,
            DynamicRange::HdrHalfFloat => PixelFormat::Rgba16Float,
            DynamicRange::HdrPacked10 => PixelFormat::Rgb10A2,
        }
    }

    pub fn texture_format(self) -> wgpu::TextureFormat {
        match self {
            DynamicRange::Sdr => wgpu::TextureFormat::Rgba8Unorm,
            DynamicRange::HdrHalfFloat => wgpu::TextureFormat::Rgba16Float,
            DynamicRange::HdrPacked10 => wgpu::TextureFormat::Rgb10a2Unorm,
        }
    }

    pub fn bytes_per_pixel(self) -> u32 {
        self.pixel_format().bytes_per_pixel() as u32
    }
}

/// CPU-side image in one of the supported pixel layouts. SDR images use
/// the `image` crate's RGBA buffer; HDR layouts carry raw bytes since
/// half-float and packed 10-bit have no `image` buffer type.
pub enum Bitmap {
    Rgba8(image::RgbaImage),
    Rgba16Float {
        width: u32,
        height: u32,
        data: Vec<u8>,
    },
    Rgb10A2 {
        width: u32,
        height: u32,
        data: Vec<u8>,
    },
}

impl Bitmap {
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            Bitmap::Rgba8(img) => img.dimensions(),
            Bitmap::Rgba16Float { width, height, .. } => (*width, *height),
            Bitmap::Rgb10A2 { width, height, .. } => (*width, *height),
        }
    }

    pub fn dynamic_range(&self) -> DynamicRange {
        match self {
            Bitmap::Rgba8(_) => DynamicRange::Sdr,
            Bitmap::Rgba16Float { .. } => DynamicRange::HdrHalfFloat,
            Bitmap::Rgb10A2 { .. } => DynamicRange::HdrPacked10,
        }
    }

    /// Tightly packed pixel bytes, row-major.
    pub fn data(&self) -> &[u8] {
        match self {
            Bitmap::Rgba8(img) => img.as_raw(),
            Bitmap::Rgba16Float { data, .. } => data,
            Bitmap::Rgb10A2 { data, .. } => data,
        }
    }
}

/// Uploads CPU bitmaps into sampled textures of one dynamic range.
pub struct TextureUploader {
    ctx: Arc<GpuContext>,
    range: DynamicRange,
}

impl TextureUploader {
    pub fn new(ctx: Arc<GpuContext>, range: DynamicRange) -> Self {
        Self { ctx, range }
    }

    pub fn dynamic_range(&self) -> DynamicRange {
        self.range
    }

    /// Creates a texture holding `bitmap`'s pixels. The bitmap's layout
    /// must match the uploader's dynamic range.
    pub fn upload(&self, bitmap: &Bitmap) -> Result<wgpu::Texture, RendererError> {
        assert_eq!(
            bitmap.dynamic_range(),
            self.range,
            "bitmap layout does not match uploader dynamic range"
        );
        let (width, height) = bitmap.dimensions();
        let texture = self.ctx.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("upload.texture"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: self.range.texture_format(),
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        self.ctx.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            bitmap.data(),
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(width * self.range.bytes_per_pixel()),
                rows_per_image: Some(height),
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        Ok(texture)
    }
}

struct ReadbackCache {
    staging: wgpu::Buffer,
    width: u32,
    height: u32,
    row_pitch: u32,
}

/// Copies textures back to CPU bitmaps. The staging buffer is reused
/// across reads and reallocated only when the dimensions change.
pub struct TextureReadback {
    ctx: Arc<GpuContext>,
    range: DynamicRange,
    cache: Option<ReadbackCache>,
}

impl TextureReadback {
    pub fn new(ctx: Arc<GpuContext>, range: DynamicRange) -> Self {
        Self {
            ctx,
            range,
            cache: None,
        }
    }

    pub fn dynamic_range(&self) -> DynamicRange {
        self.range
    }

    pub fn read(
        &mut self,
        texture: &wgpu::Texture,
        width: u32,
        height: u32,
    ) -> Result<Bitmap, RendererError> {
        let _span = tracing::info_span!("texture_readback", width, height).entered();
        self.ensure_cache(width, height);
        let cache = self.cache.as_ref().expect("cache must be populated");
        let row_pitch = cache.row_pitch;

        let mut encoder =
            self.ctx
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("Readback Encoder"),
                });
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &cache.staging,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(row_pitch),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.ctx.queue.submit(std::iter::once(encoder.finish()));

        let pixels = self.map_to_cpu(width, height)?;
        Ok(match self.range {
            DynamicRange::Sdr => Bitmap::Rgba8(
                image::RgbaImage::from_raw(width, height, pixels)
                    .ok_or_else(|| RendererError::InvalidFormat("rgba8 buffer size".into()))?,
            ),
            DynamicRange::HdrHalfFloat => Bitmap::Rgba16Float {
                width,
                height,
                data: pixels,
            },
            DynamicRange::HdrPacked10 => Bitmap::Rgb10A2 {
                width,
                height,
                data: pixels,
            },
        })
    }

    fn ensure_cache(&mut self, width: u32, height: u32) {
        let row_pitch = align_to(width * self.range.bytes_per_pixel(), COPY_ALIGNMENT);
        let recreate = match &self.cache {
            Some(cache) => cache.width != width || cache.height != height,
            None => true,
        };
        if recreate {
            let size = align_to_u64(row_pitch as u64 * height as u64, 4);
            let staging = self.ctx.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("readback.staging"),
                size,
                usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
                mapped_at_creation: false,
            });
            self.cache = Some(ReadbackCache {
                staging,
                width,
                height,
                row_pitch,
            });
        }
    }

    fn map_to_cpu(&self, width: u32, height: u32) -> Result<Vec<u8>, RendererError> {
        let cache = self.cache.as_ref().expect("cache must be populated");
        let slice = cache
            .staging
            .slice(..cache.row_pitch as u64 * height as u64);
        let (tx, rx) = channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });

        loop {
            match rx.try_recv() {
                Ok(Ok(())) => break,
                Ok(Err(_)) => return Err(RendererError::BufferAsync),
                Err(TryRecvError::Empty) => {
                    self.ctx.device.poll(wgpu::Maintain::Poll);
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(TryRecvError::Disconnected) => {
                    return Err(RendererError::BufferAsync);
                }
            }
        }

        let mapped = slice.get_mapped_range();
        let row_stride = width as usize * self.range.bytes_per_pixel() as usize;
        let mut pixels = vec![0u8; row_stride * height as usize];
        for row in 0..height as usize {
            let src_offset = row * cache.row_pitch as usize;
            let dst_offset = row * row_stride;
            pixels[dst_offset..dst_offset + row_stride]
                .copy_from_slice(&mapped[src_offset..src_offset + row_stride]);
        }
        drop(mapped);
        cache.staging.unmap();
        Ok(pixels)
    }
}

fn align_to(value: u32, alignment: u32) -> u32 {
    if value == 0 {
        return alignment;
    }
    value.div_ceil(alignment) * alignment
}

fn align_to_u64(value: u64, alignment: u64) -> u64 {
    if value == 0 {
        return alignment;
    }
    value.div_ceil(alignment) * alignment
}
