pub use crate::engine::{
    BatchStatus, CompletedBatch, EngineState, RequestSender, StreamingConfig, StreamingEngine,
    SubmittedBatch,
};
pub use crate::error::{MemoryLocation, Result, StreamError};
pub use crate::fence::CompletionFence;
pub use crate::format::{CopyFootprint, ImageDesc, ImageLayout, PixelFormat};
pub use crate::request::{LoadRequest, PixelData};
pub use crate::resource::{ResourceKey, ResourceState, StreamableResource};
pub use crate::traits::{CommandStream, Device, StagingBuffer, TimelineCounter};
