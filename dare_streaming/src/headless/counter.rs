use std::sync::{Arc, Condvar, Mutex, PoisonError};

use crate::error::{Result, StreamError};
use crate::traits::TimelineCounter;

#[derive(Debug)]
struct CounterValue {
    value: u64,
    lost: bool,
}

#[derive(Debug)]
pub(super) struct CounterShared {
    state: Mutex<CounterValue>,
    reached: Condvar,
}

impl CounterShared {
    /// Advance to `value`. Never moves backwards.
    pub(super) fn signal(&self, value: u64) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.value = state.value.max(value);
        self.reached.notify_all();
    }

    pub(super) fn lose(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.lost = true;
        self.reached.notify_all();
    }
}

/// Timeline counter advanced by the headless copy engine
#[derive(Debug)]
pub struct HeadlessCounter {
    shared: Arc<CounterShared>,
}

impl HeadlessCounter {
    pub(super) fn new(initial_value: u64) -> Self {
        Self {
            shared: Arc::new(CounterShared {
                state: Mutex::new(CounterValue {
                    value: initial_value,
                    lost: false,
                }),
                reached: Condvar::new(),
            }),
        }
    }

    pub(super) fn shared(&self) -> &Arc<CounterShared> {
        &self.shared
    }
}

impl TimelineCounter for HeadlessCounter {
    fn completed_value(&self) -> Result<u64> {
        let state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if state.lost {
            return Err(StreamError::DeviceLost);
        }
        Ok(state.value)
    }

    fn wait(&self, value: u64) -> Result<()> {
        let mut state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if state.lost {
                return Err(StreamError::DeviceLost);
            }
            if state.value >= value {
                return Ok(());
            }
            state = self
                .shared
                .reached
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}
