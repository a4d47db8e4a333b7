//! In-process software device
//!
//! Images and staging buffers live in host memory and a copy-engine thread per command stream
//! plays back submitted batches in order, advancing counters as it goes. Used by tests, benches
//! and tooling that need the streaming core without a GPU.
use std::time::Duration;

mod command;
mod counter;
mod device;
mod resource;

pub use command::HeadlessCommandStream;
pub use counter::HeadlessCounter;
pub use device::{HeadlessDevice, HeadlessStats, HeadlessView, HeadlessViewTable};
pub use resource::{HeadlessImage, HeadlessStagingBuffer};

/// Settings of a [`HeadlessDevice`]
#[derive(Debug, Clone)]
pub struct HeadlessConfig {
    /// Every staging row must start on a multiple of this
    pub copy_row_pitch_alignment: u64,
    /// Bytes of image memory available. `None` is unlimited.
    pub device_memory_budget: Option<u64>,
    /// Bytes of staging memory available. `None` is unlimited.
    pub host_memory_budget: Option<u64>,
    /// How long the copy engine takes per submitted batch
    pub copy_latency: Duration,
    /// Number of binding slots in the view table
    pub view_slots: u32,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            copy_row_pitch_alignment: 256,
            device_memory_budget: None,
            host_memory_budget: None,
            copy_latency: Duration::ZERO,
            view_slots: 1024,
        }
    }
}
