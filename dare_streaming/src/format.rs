//! Pixel formats, image descriptions and staging layouts
use crate::error::{Result, StreamError};

/// Uncompressed colour formats a streamed image can take
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    R8Unorm,
    Rg8Unorm,
    Rgba8Unorm,
    Rgba8Srgb,
    Bgra8Unorm,
    Bgra8Srgb,
    R16Float,
    Rg16Float,
    Rgba16Float,
    R32Float,
    Rg32Float,
    Rgba32Float,
    R32Uint,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::R8Unorm => 1,
            PixelFormat::Rg8Unorm | PixelFormat::R16Float => 2,
            PixelFormat::Rgba8Unorm
            | PixelFormat::Rgba8Srgb
            | PixelFormat::Bgra8Unorm
            | PixelFormat::Bgra8Srgb
            | PixelFormat::Rg16Float
            | PixelFormat::R32Float
            | PixelFormat::R32Uint => 4,
            PixelFormat::Rgba16Float | PixelFormat::Rg32Float => 8,
            PixelFormat::Rgba32Float => 16,
        }
    }

    pub fn is_srgb(&self) -> bool {
        matches!(self, PixelFormat::Rgba8Srgb | PixelFormat::Bgra8Srgb)
    }
}

/// Layouts a streamed image moves through
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ImageLayout {
    Undefined,
    CopyDestination,
    ShaderReadOnly,
}

/// Geometry of a streamed image. Always 2D with a single mip level and array layer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ImageDesc {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl ImageDesc {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(StreamError::EmptyExtent { width, height });
        }
        Ok(Self {
            width,
            height,
            format,
        })
    }

    /// Bytes in one tightly packed row
    pub fn row_bytes(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    /// Bytes of the whole image when tightly packed
    pub fn packed_size(&self) -> usize {
        self.row_bytes() * self.height as usize
    }
}

/// Aligns `current` up to the next multiple of `alignment`
pub fn align(current: u64, alignment: u64) -> u64 {
    if alignment == 0 || current % alignment == 0 {
        current
    } else {
        let remainder = current % alignment;
        current + alignment - remainder
    }
}

/// Placement of an image inside a staging buffer
///
/// Rows start every `row_pitch` bytes, the last row is not padded.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct CopyFootprint {
    pub offset: u64,
    pub row_pitch: u64,
    pub row_bytes: u64,
    pub rows: u32,
    pub size: u64,
}

impl CopyFootprint {
    /// Footprint of `desc` for a device requiring rows aligned to `row_pitch_alignment` bytes
    ///
    /// Fails with [`StreamError::ImageTooLarge`] if the staging size does not fit in a `u64`.
    pub fn new(desc: &ImageDesc, row_pitch_alignment: u64) -> Result<Self> {
        let too_large = StreamError::ImageTooLarge {
            width: desc.width,
            height: desc.height,
        };
        let row_bytes = desc.row_bytes() as u64;
        let row_pitch = if row_pitch_alignment == 0 {
            Some(row_bytes)
        } else {
            row_bytes.checked_next_multiple_of(row_pitch_alignment)
        };
        let size = row_pitch.and_then(|row_pitch| {
            row_pitch
                .checked_mul(desc.height as u64 - 1)?
                .checked_add(row_bytes)
                .map(|size| (row_pitch, size))
        });
        let Some((row_pitch, size)) = size else {
            return Err(too_large);
        };
        Ok(Self {
            offset: 0,
            row_pitch,
            row_bytes,
            rows: desc.height,
            size,
        })
    }

    /// Offset of row `row` inside the staging buffer
    pub fn row_offset(&self, row: u32) -> u64 {
        self.offset + self.row_pitch * row as u64
    }

    pub fn is_tightly_packed(&self) -> bool {
        self.row_pitch == self.row_bytes
    }
}
