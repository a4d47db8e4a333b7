use ash::vk;
use dare_streaming::{MemoryLocation, StreamError};
use thiserror::Error;

/// Failures specific to the Vulkan backend
///
/// Converted into [`StreamError`] at the device trait boundary.
#[derive(Debug, Error)]
pub enum VulkanStreamingError {
    #[error(transparent)]
    Vk(#[from] vk::Result),

    #[error("Failed to allocate {location} memory: {source}")]
    Allocation {
        location: MemoryLocation,
        source: gpu_allocator::AllocationError,
    },

    #[error("Allocation has no host mapping")]
    NoMappedPointer,
}

impl VulkanStreamingError {
    pub(crate) fn allocation(
        location: MemoryLocation,
    ) -> impl FnOnce(gpu_allocator::AllocationError) -> Self {
        move |source| Self::Allocation { location, source }
    }
}

impl From<VulkanStreamingError> for StreamError {
    fn from(value: VulkanStreamingError) -> Self {
        match value {
            VulkanStreamingError::Vk(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY) => {
                StreamError::OutOfMemory(MemoryLocation::Device)
            }
            VulkanStreamingError::Vk(vk::Result::ERROR_OUT_OF_HOST_MEMORY) => {
                StreamError::OutOfMemory(MemoryLocation::Host)
            }
            VulkanStreamingError::Vk(vk::Result::ERROR_DEVICE_LOST) => StreamError::DeviceLost,
            VulkanStreamingError::Allocation {
                location,
                source: gpu_allocator::AllocationError::OutOfMemory,
            } => StreamError::OutOfMemory(location),
            other => StreamError::Backend(other.to_string()),
        }
    }
}

/// Shorthand for raw Vulkan calls inside device trait implementations
pub(crate) fn vk_error(result: vk::Result) -> StreamError {
    VulkanStreamingError::Vk(result).into()
}
