use bytes::Bytes;
use derivative::Derivative;

use crate::error::{Result, StreamError};
use crate::format::{ImageDesc, PixelFormat};
use crate::resource::ResourceKey;
use crate::traits::Device;

/// Decoded pixels of one image, shared with the caller
///
/// Rows start every `row_pitch` bytes. `slice_pitch` is the distance between depth slices.
/// Images are 2D, so only one slice is read, but the pitch must still cover it.
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct PixelData {
    #[derivative(Debug = "ignore")]
    bytes: Bytes,
    row_pitch: usize,
    slice_pitch: usize,
}

impl PixelData {
    pub fn new(bytes: impl Into<Bytes>, row_pitch: usize, slice_pitch: usize) -> Self {
        Self {
            bytes: bytes.into(),
            row_pitch,
            slice_pitch,
        }
    }

    /// Rows of `width` pixels of `format` stored back to back
    pub fn tightly_packed(bytes: impl Into<Bytes>, width: u32, format: PixelFormat) -> Self {
        let bytes = bytes.into();
        let row_pitch = width as usize * format.bytes_per_pixel();
        let slice_pitch = bytes.len();
        Self {
            bytes,
            row_pitch,
            slice_pitch,
        }
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn row_pitch(&self) -> usize {
        self.row_pitch
    }

    pub fn slice_pitch(&self) -> usize {
        self.slice_pitch
    }

    /// Check that these pixels cover `desc`
    pub fn validate(&self, desc: &ImageDesc) -> Result<()> {
        let row_bytes = desc.row_bytes();
        if self.row_pitch < row_bytes {
            return Err(StreamError::InvalidRowPitch {
                row_pitch: self.row_pitch,
                row_bytes,
            });
        }
        let expected = self
            .row_pitch
            .checked_mul(desc.height as usize - 1)
            .and_then(|rows| rows.checked_add(row_bytes));
        let Some(expected) = expected else {
            return Err(StreamError::InvalidPixelData {
                expected: usize::MAX,
                actual: self.bytes.len(),
            });
        };
        if self.bytes.len() < expected {
            return Err(StreamError::InvalidPixelData {
                expected,
                actual: self.bytes.len(),
            });
        }
        if self.slice_pitch < expected {
            return Err(StreamError::InvalidSlicePitch {
                slice_pitch: self.slice_pitch,
                image_bytes: expected,
            });
        }
        Ok(())
    }

    /// The `row`th row, without its padding
    pub(crate) fn row(&self, row: u32, row_bytes: usize) -> &[u8] {
        let start = self.row_pitch * row as usize;
        &self.bytes[start..start + row_bytes]
    }
}

/// One pending copy of pixels into a streamed resource
///
/// Immutable once built; the pixels are validated against the geometry on construction.
#[derive(Derivative)]
#[derivative(Debug(bound = ""), Clone(bound = ""))]
pub struct LoadRequest<D: Device> {
    resource: ResourceKey,
    data: PixelData,
    desc: ImageDesc,
    binding_slot: D::BindingSlot,
}

impl<D: Device> LoadRequest<D> {
    pub fn new(
        resource: ResourceKey,
        data: PixelData,
        width: u32,
        height: u32,
        format: PixelFormat,
        binding_slot: D::BindingSlot,
    ) -> Result<Self> {
        let desc = ImageDesc::new(width, height, format)?;
        data.validate(&desc)?;
        Ok(Self {
            resource,
            data,
            desc,
            binding_slot,
        })
    }

    pub fn resource(&self) -> ResourceKey {
        self.resource
    }

    pub fn data(&self) -> &PixelData {
        &self.data
    }

    pub fn desc(&self) -> &ImageDesc {
        &self.desc
    }

    pub fn binding_slot(&self) -> D::BindingSlot {
        self.binding_slot
    }
}
