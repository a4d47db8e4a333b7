//! Capabilities the streaming core needs from a graphics backend
//!
//! The core never talks to a graphics API directly. A backend implements [`Device`] and its
//! associated types; everything else in this crate is written against these traits.
use std::fmt::Debug;

use crate::error::Result;
use crate::format::{CopyFootprint, ImageDesc, ImageLayout};

/// A device capable of allocating streamed images, staging buffers and command streams, and of
/// publishing views into binding slots.
///
/// Backend objects ([`Device::Image`], [`Device::StagingBuffer`]) release their memory when
/// dropped.
pub trait Device: Clone {
    type Image: Debug;
    type StagingBuffer: StagingBuffer;
    type Counter: TimelineCounter;
    type CommandStream: CommandStream<Self>;
    type BindingSlot: Copy + Debug + Send;

    /// Create a command stream (allocator + list + queue) on the device's transfer queue
    fn create_command_stream(&self, name: &str) -> Result<Self::CommandStream>;

    /// Create a timeline counter starting at `initial_value`
    fn create_counter(&self, initial_value: u64) -> Result<Self::Counter>;

    /// Allocate a device-local image in [`ImageLayout::CopyDestination`]
    fn create_image(&self, desc: &ImageDesc, name: &str) -> Result<Self::Image>;

    /// Allocate a host-visible buffer of `size` bytes usable as a copy source
    fn create_staging_buffer(&self, size: u64, name: &str) -> Result<Self::StagingBuffer>;

    /// Alignment in bytes every staging row must start on
    fn copy_row_pitch_alignment(&self) -> u64;

    /// Publish a shader-readable view of `image` at `slot`
    fn write_view(&self, slot: Self::BindingSlot, image: &Self::Image) -> Result<()>;

    /// Publish an empty view at `slot` so nothing renderer-visible references the old image
    fn write_null_view(&self, slot: Self::BindingSlot) -> Result<()>;
}

/// Records copies and layout transitions and submits them as one batch
pub trait CommandStream<D: Device + ?Sized> {
    /// Start a new recording. Only legal once previously submitted work has completed.
    fn reset(&mut self) -> Result<()>;

    /// Copy a placed image out of `src` into mip 0 of `dst`
    fn record_copy(&mut self, src: &D::StagingBuffer, footprint: &CopyFootprint, dst: &D::Image);

    fn record_transition(&mut self, image: &D::Image, from: ImageLayout, to: ImageLayout);

    /// Finish recording
    fn close(&mut self) -> Result<()>;

    /// Submit the closed recording to the queue. Does not block.
    fn execute(&mut self) -> Result<()>;

    /// Signal `counter` to `value` once all previously submitted work completes. Does not block.
    fn signal(&mut self, counter: &D::Counter, value: u64) -> Result<()>;

    /// Block until everything executed on this stream completed, without a counter
    fn wait_idle(&mut self) -> Result<()>;
}

/// Host-visible memory the core fills with pixel rows
pub trait StagingBuffer: Debug {
    fn size(&self) -> u64;

    /// Copy `data` into the buffer at `offset`
    fn write(&mut self, offset: u64, data: &[u8]) -> Result<()>;
}

/// A monotonic counter advanced by the device and observable from the host
pub trait TimelineCounter: Debug {
    /// Last value the device reached
    fn completed_value(&self) -> Result<u64>;

    /// Block the calling thread until the counter reached `value`
    fn wait(&self, value: u64) -> Result<()>;
}
