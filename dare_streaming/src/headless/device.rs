use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use derivative::Derivative;

use super::HeadlessConfig;
use super::command::HeadlessCommandStream;
use super::counter::{CounterShared, HeadlessCounter};
use super::resource::{HeadlessAllocation, HeadlessImage, HeadlessStagingBuffer};
use crate::error::{MemoryLocation, Result, StreamError};
use crate::format::ImageDesc;
use crate::traits::Device;

/// What a binding slot currently shows to rendering
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HeadlessView {
    pub image_id: u64,
    pub desc: ImageDesc,
}

/// Fixed size table of binding slots
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadlessViewTable {
    slots: Vec<Option<HeadlessView>>,
}

impl HeadlessViewTable {
    pub fn new(slots: u32) -> Self {
        Self {
            slots: vec![None; slots as usize],
        }
    }

    pub fn get(&self, slot: u32) -> Option<HeadlessView> {
        self.slots.get(slot as usize).copied().flatten()
    }

    fn set(&mut self, slot: u32, view: Option<HeadlessView>) -> Result<()> {
        let len = self.slots.len();
        match self.slots.get_mut(slot as usize) {
            Some(entry) => {
                *entry = view;
                Ok(())
            }
            None => Err(StreamError::Backend(format!(
                "Binding slot {slot} out of range for table of {len}"
            ))),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of slots currently showing an image
    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}

/// Snapshot of what a [`HeadlessDevice`] has done and holds
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct HeadlessStats {
    /// Batches submitted through [`crate::traits::CommandStream::execute`]
    pub submissions: usize,
    /// Counter signals queued
    pub signals: usize,
    /// Batches the copy engine finished playing back
    pub completed_batches: usize,
    pub live_device_bytes: u64,
    pub live_host_bytes: u64,
    pub live_images: usize,
    pub live_staging_buffers: usize,
}

#[derive(Debug)]
pub(super) struct DeviceInner {
    pub(super) config: HeadlessConfig,
    next_id: AtomicU64,
    lost: AtomicBool,
    device_bytes: AtomicU64,
    host_bytes: AtomicU64,
    live_images: AtomicUsize,
    live_staging_buffers: AtomicUsize,
    pub(super) submissions: AtomicUsize,
    pub(super) signals: AtomicUsize,
    pub(super) completed_batches: AtomicUsize,
    views: Mutex<HeadlessViewTable>,
    counters: Mutex<Vec<Weak<CounterShared>>>,
}

impl DeviceInner {
    pub(super) fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    pub(super) fn ensure_alive(&self) -> Result<()> {
        if self.is_lost() {
            Err(StreamError::DeviceLost)
        } else {
            Ok(())
        }
    }

    /// Mark the device lost and wake everything blocked on one of its counters
    pub(super) fn lose(&self) {
        if self.lost.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::error!("Headless device lost");
        let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        for counter in counters.iter().filter_map(Weak::upgrade) {
            counter.lose();
        }
    }

    pub(super) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn usage(&self, location: MemoryLocation) -> (&AtomicU64, &AtomicUsize, Option<u64>) {
        match location {
            MemoryLocation::Device => (
                &self.device_bytes,
                &self.live_images,
                self.config.device_memory_budget,
            ),
            MemoryLocation::Host => (
                &self.host_bytes,
                &self.live_staging_buffers,
                self.config.host_memory_budget,
            ),
        }
    }

    /// Account `size` bytes against the budget of `location`
    fn reserve(&self, location: MemoryLocation, size: u64) -> Result<()> {
        let (bytes, live, budget) = self.usage(location);
        bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let next = current.checked_add(size)?;
                match budget {
                    Some(budget) if next > budget => None,
                    _ => Some(next),
                }
            })
            .map_err(|_| StreamError::OutOfMemory(location))?;
        live.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub(super) fn release(&self, location: MemoryLocation, size: u64) {
        let (bytes, live, _) = self.usage(location);
        bytes.fetch_sub(size, Ordering::AcqRel);
        live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A software device. Cheap to clone; clones share all state.
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct HeadlessDevice {
    #[derivative(Debug = "ignore")]
    inner: Arc<DeviceInner>,
}

impl HeadlessDevice {
    pub fn new(config: HeadlessConfig) -> Self {
        let views = HeadlessViewTable::new(config.view_slots);
        Self {
            inner: Arc::new(DeviceInner {
                config,
                next_id: AtomicU64::new(1),
                lost: AtomicBool::new(false),
                device_bytes: AtomicU64::new(0),
                host_bytes: AtomicU64::new(0),
                live_images: AtomicUsize::new(0),
                live_staging_buffers: AtomicUsize::new(0),
                submissions: AtomicUsize::new(0),
                signals: AtomicUsize::new(0),
                completed_batches: AtomicUsize::new(0),
                views: Mutex::new(views),
                counters: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &HeadlessConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> HeadlessStats {
        let inner = &self.inner;
        HeadlessStats {
            submissions: inner.submissions.load(Ordering::Acquire),
            signals: inner.signals.load(Ordering::Acquire),
            completed_batches: inner.completed_batches.load(Ordering::Acquire),
            live_device_bytes: inner.device_bytes.load(Ordering::Acquire),
            live_host_bytes: inner.host_bytes.load(Ordering::Acquire),
            live_images: inner.live_images.load(Ordering::Acquire),
            live_staging_buffers: inner.live_staging_buffers.load(Ordering::Acquire),
        }
    }

    /// The view currently published at `slot`
    pub fn view(&self, slot: u32) -> Option<HeadlessView> {
        self.views().get(slot)
    }

    /// Copy of the whole view table
    pub fn view_table(&self) -> HeadlessViewTable {
        self.views().clone()
    }

    fn views(&self) -> std::sync::MutexGuard<'_, HeadlessViewTable> {
        self.inner
            .views
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Simulate losing the device. Every later operation fails with [`StreamError::DeviceLost`]
    /// and blocked waits return.
    pub fn lose_device(&self) {
        self.inner.lose();
    }

    pub fn is_lost(&self) -> bool {
        self.inner.is_lost()
    }

    pub(super) fn inner(&self) -> &Arc<DeviceInner> {
        &self.inner
    }

    fn allocate(&self, location: MemoryLocation, size: u64) -> Result<HeadlessAllocation> {
        self.inner.ensure_alive()?;
        self.inner.reserve(location, size)?;
        Ok(HeadlessAllocation::new(self.inner.clone(), location, size))
    }
}

impl Device for HeadlessDevice {
    type Image = HeadlessImage;
    type StagingBuffer = HeadlessStagingBuffer;
    type Counter = HeadlessCounter;
    type CommandStream = HeadlessCommandStream;
    type BindingSlot = u32;

    fn create_command_stream(&self, name: &str) -> Result<Self::CommandStream> {
        self.inner.ensure_alive()?;
        HeadlessCommandStream::new(self.clone(), name)
    }

    fn create_counter(&self, initial_value: u64) -> Result<Self::Counter> {
        self.inner.ensure_alive()?;
        let counter = HeadlessCounter::new(initial_value);
        self.inner
            .counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(counter.shared()));
        Ok(counter)
    }

    fn create_image(&self, desc: &ImageDesc, name: &str) -> Result<Self::Image> {
        let allocation = self.allocate(MemoryLocation::Device, desc.packed_size() as u64)?;
        Ok(HeadlessImage::new(
            self.inner.next_id(),
            *desc,
            allocation,
            name,
        ))
    }

    fn create_staging_buffer(&self, size: u64, name: &str) -> Result<Self::StagingBuffer> {
        let allocation = self.allocate(MemoryLocation::Host, size)?;
        Ok(HeadlessStagingBuffer::new(size, allocation, name))
    }

    fn copy_row_pitch_alignment(&self) -> u64 {
        self.inner.config.copy_row_pitch_alignment
    }

    fn write_view(&self, slot: u32, image: &HeadlessImage) -> Result<()> {
        self.inner.ensure_alive()?;
        self.views().set(
            slot,
            Some(HeadlessView {
                image_id: image.id(),
                desc: *image.desc(),
            }),
        )
    }

    fn write_null_view(&self, slot: u32) -> Result<()> {
        self.inner.ensure_alive()?;
        self.views().set(slot, None)
    }
}
