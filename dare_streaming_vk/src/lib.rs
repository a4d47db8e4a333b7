//! Vulkan backend for `dare_streaming`
//!
//! Streams through a dedicated transfer queue. The completion fence is a timeline semaphore and
//! binding slots are array elements of a sampled image descriptor binding.
pub mod command;
pub mod device;
pub mod error;
pub mod format;
pub mod resource;
pub mod sync;

pub use command::VulkanCommandStream;
pub use device::{QueueInfo, VulkanStreamingCreateInfo, VulkanStreamingDevice};
pub use error::VulkanStreamingError;
pub use resource::{VulkanImage, VulkanStagingBuffer};
pub use sync::VulkanTimelineCounter;

/// Streaming engine driving a Vulkan transfer queue
pub type VulkanStreamingEngine = dare_streaming::StreamingEngine<VulkanStreamingDevice>;

// Re-exports
pub use {ash, gpu_allocator};
