pub mod engine;
pub mod error;
pub mod fence;
pub mod format;
#[cfg(feature = "headless")]
pub mod headless;
pub mod prelude;
pub mod request;
pub mod resource;
pub mod traits;

pub use engine::{
    BatchStatus, CompletedBatch, EngineState, RequestSender, StreamingConfig, StreamingEngine,
    SubmittedBatch,
};
pub use error::{MemoryLocation, StreamError};
pub use fence::CompletionFence;
pub use resource::{ResourceKey, ResourceState, StreamableResource};

// Re-exports
pub use bytes;
