use thiserror::Error;

/// Which heap an allocation failed in
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum MemoryLocation {
    /// Device-local memory backing destination images
    Device,
    /// Host-visible memory backing staging buffers
    Host,
}

impl std::fmt::Display for MemoryLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryLocation::Device => write!(f, "device"),
            MemoryLocation::Host => write!(f, "host"),
        }
    }
}

/// Possible errors
///
/// Contract violations (wrong resource state, finalizing the wrong batch, ...) are not part of
/// this enum; they panic.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// An allocation did not fit. The batch that hit this has been rolled back and may be
    /// retried.
    #[error("Out of {0} memory")]
    OutOfMemory(MemoryLocation),

    /// The device is gone. Nothing on it can be trusted anymore and the engine must be rebuilt.
    #[error("Device lost")]
    DeviceLost,

    #[error("Pixel data too small: expected at least {expected} bytes, got {actual}")]
    InvalidPixelData { expected: usize, actual: usize },

    #[error("Row pitch {row_pitch} is smaller than a row of {row_bytes} bytes")]
    InvalidRowPitch { row_pitch: usize, row_bytes: usize },

    #[error("Slice pitch {slice_pitch} is smaller than the {image_bytes} bytes of one image")]
    InvalidSlicePitch {
        slice_pitch: usize,
        image_bytes: usize,
    },

    #[error("Image of {width}x{height} does not fit in addressable memory")]
    ImageTooLarge { width: u32, height: u32 },

    #[error("Image extent must be non-zero, got {width}x{height}")]
    EmptyExtent { width: u32, height: u32 },

    #[error("Staging write of {len} bytes at offset {offset} exceeds buffer size {size}")]
    StagingOverflow { offset: u64, len: u64, size: u64 },

    /// Any other backend failure. Treated as fatal.
    #[error("Backend error: {0}")]
    Backend(String),
}

impl StreamError {
    /// Whether the caller may retry the failed operation later
    pub fn is_retryable(&self) -> bool {
        matches!(self, StreamError::OutOfMemory(_))
    }

    /// Whether the failure invalidates the whole device and anything recorded on it
    pub fn is_fatal(&self) -> bool {
        matches!(self, StreamError::DeviceLost | StreamError::Backend(_))
    }
}

pub type Result<T, E = StreamError> = std::result::Result<T, E>;
