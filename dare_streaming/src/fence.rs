use derivative::Derivative;

use crate::error::Result;
use crate::traits::{CommandStream, Device, TimelineCounter};

/// Tracks completion of submitted batches with a monotonic counter
///
/// Value `0` means "never signaled", so the first signal uses `1`. Waiting with nothing signaled
/// is therefore a wait on `0` and returns immediately.
#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub struct CompletionFence<D: Device> {
    counter: D::Counter,
    next_value: u64,
    value_to_wait_for: u64,
}

impl<D: Device> CompletionFence<D> {
    pub fn new(device: &D) -> Result<Self> {
        let counter = device.create_counter(0)?;
        Ok(Self {
            counter,
            next_value: 1,
            value_to_wait_for: 0,
        })
    }

    /// Have `stream` signal the next value once everything submitted before it completes
    ///
    /// Returns the value signaled.
    pub fn signal_from_queue(&mut self, stream: &mut D::CommandStream) -> Result<u64> {
        stream.signal(&self.counter, self.next_value)?;
        self.value_to_wait_for = self.next_value;
        self.next_value += 1;
        tracing::trace!("Fence signal queued for value {}", self.value_to_wait_for);
        Ok(self.value_to_wait_for)
    }

    /// Block until the most recently signaled value is reached
    pub fn wait_for_completion(&self) -> Result<()> {
        self.counter.wait(self.value_to_wait_for)
    }

    /// Whether the most recently signaled value has been reached, without blocking
    pub fn is_complete(&self) -> Result<bool> {
        Ok(self.counter.completed_value()? >= self.value_to_wait_for)
    }

    pub fn completed_value(&self) -> Result<u64> {
        self.counter.completed_value()
    }

    pub fn next_value(&self) -> u64 {
        self.next_value
    }

    pub fn value_to_wait_for(&self) -> u64 {
        self.value_to_wait_for
    }
}
