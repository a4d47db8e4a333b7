//! Batches load requests onto a dedicated copy stream and finalizes them once the device is done
//!
//! A batch moves through three calls which hand a token to each other:
//! [`StreamingEngine::execute`] records and submits everything pending and returns a
//! [`SubmittedBatch`], [`StreamingEngine::wait_for_copy_queue`] turns it into a
//! [`CompletedBatch`] once the fence is reached, and [`StreamingEngine::after_execution`] marks
//! every resource of the batch loaded. A resource can therefore never be marked loaded before
//! the device finished copying it.
use std::collections::VecDeque;
use std::mem;

use crossbeam_channel::{Receiver, Sender};
use derivative::Derivative;
use slotmap::SlotMap;

use crate::error::{Result, StreamError};
use crate::fence::CompletionFence;
use crate::request::LoadRequest;
use crate::resource::{ResourceKey, ResourceState, StreamableResource};
use crate::traits::{CommandStream, Device};

/// Settings of a [`StreamingEngine`]
#[derive(Debug, Clone)]
pub struct StreamingConfig {
    /// Debug label of the copy stream, also used in traces
    pub label: String,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            label: String::from("StreamingEngine"),
        }
    }
}

/// Whether the engine has a batch out on the device
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum EngineState {
    /// Nothing in flight, [`StreamingEngine::execute`] may be called
    Idle,
    /// A batch was submitted and has not been finalized yet
    Batched,
}

/// A batch handed to the device. Must be waited on before it can be finalized.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a submitted batch must be waited on and finalized"]
pub struct SubmittedBatch {
    fence_value: u64,
    len: usize,
}

impl SubmittedBatch {
    /// Fence value the batch completes at. `0` for an empty batch.
    pub fn fence_value(&self) -> u64 {
        self.fence_value
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Proof that the device finished a [`SubmittedBatch`]
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a completed batch must be finalized with `after_execution`"]
pub struct CompletedBatch {
    fence_value: u64,
    len: usize,
}

impl CompletedBatch {
    pub fn fence_value(&self) -> u64 {
        self.fence_value
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Result of polling a batch without blocking
#[derive(Debug, PartialEq, Eq)]
pub enum BatchStatus {
    Pending(SubmittedBatch),
    Complete(CompletedBatch),
}

/// Hands requests to a [`StreamingEngine`] from other threads
///
/// Requests sent here join the pending queue at the start of the next
/// [`StreamingEngine::execute`].
#[derive(Derivative)]
#[derivative(Debug(bound = ""), Clone(bound = ""))]
pub struct RequestSender<D: Device> {
    #[derivative(Debug = "ignore")]
    sender: Sender<LoadRequest<D>>,
}

impl<D: Device> RequestSender<D> {
    /// Returns the request back if the engine is gone
    pub fn send(&self, request: LoadRequest<D>) -> std::result::Result<(), LoadRequest<D>> {
        self.sender.send(request).map_err(|err| err.into_inner())
    }
}

/// Streams pixel data into device resources on a dedicated copy stream
///
/// Driven from a single thread: every mutating call takes `&mut self`. Producers on other
/// threads go through [`Self::request_sender`].
#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub struct StreamingEngine<D: Device> {
    #[derivative(Debug = "ignore")]
    device: D,
    #[derivative(Debug = "ignore")]
    command_stream: D::CommandStream,
    fence: CompletionFence<D>,
    resources: SlotMap<ResourceKey, StreamableResource<D>>,
    pending: VecDeque<LoadRequest<D>>,
    in_flight: VecDeque<LoadRequest<D>>,
    #[derivative(Debug = "ignore")]
    sender: Sender<LoadRequest<D>>,
    #[derivative(Debug = "ignore")]
    receiver: Receiver<LoadRequest<D>>,
    device_lost: bool,
    config: StreamingConfig,
}

impl<D: Device> StreamingEngine<D> {
    /// Create the copy stream and fence
    pub fn new(device: D, config: StreamingConfig) -> Result<Self> {
        let command_stream = device.create_command_stream(&config.label)?;
        let fence = CompletionFence::new(&device)?;
        let (sender, receiver) = crossbeam_channel::unbounded();
        tracing::debug!("Created streaming engine {}", config.label);
        Ok(Self {
            device,
            command_stream,
            fence,
            resources: SlotMap::with_key(),
            pending: VecDeque::new(),
            in_flight: VecDeque::new(),
            sender,
            receiver,
            device_lost: false,
            config,
        })
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn fence(&self) -> &CompletionFence<D> {
        &self.fence
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    /// Add an empty, unloaded resource to the table
    pub fn create_resource(&mut self) -> ResourceKey {
        self.resources.insert(StreamableResource::new())
    }

    /// Remove a resource from the table
    ///
    /// # Panics
    /// If the resource does not exist or is not [`ResourceState::Unloaded`].
    pub fn destroy_resource(&mut self, key: ResourceKey) {
        let state = self.resource_ref(key).state();
        assert_eq!(
            state,
            ResourceState::Unloaded,
            "Only unloaded resources can be destroyed"
        );
        self.resources.remove(key);
    }

    pub fn resource(&self, key: ResourceKey) -> Option<&StreamableResource<D>> {
        self.resources.get(key)
    }

    /// Whether the resource exists and may be read by rendering
    pub fn is_valid(&self, key: ResourceKey) -> bool {
        self.resources
            .get(key)
            .map(StreamableResource::is_valid)
            .unwrap_or(false)
    }

    pub fn request_sender(&self) -> RequestSender<D> {
        RequestSender {
            sender: self.sender.clone(),
        }
    }

    /// Queue a request for the next batch. No device work happens here.
    pub fn register_load_request(&mut self, request: LoadRequest<D>) {
        self.pending.push_back(request);
    }

    pub fn state(&self) -> EngineState {
        if self.in_flight.is_empty() {
            EngineState::Idle
        } else {
            EngineState::Batched
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len() + self.receiver.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    fn ensure_device(&self) -> Result<()> {
        if self.device_lost {
            Err(StreamError::DeviceLost)
        } else {
            Ok(())
        }
    }

    /// Remember fatal failures so every later call reports the lost device
    fn note_error(&mut self, err: StreamError) -> StreamError {
        if err.is_fatal() && !self.device_lost {
            tracing::error!("{}: device failure, engine is unusable: {}", self.config.label, err);
            self.device_lost = true;
        }
        err
    }

    fn check_fatal<T>(&mut self, result: Result<T>) -> Result<T> {
        result.map_err(|err| self.note_error(err))
    }

    fn resource_ref(&self, key: ResourceKey) -> &StreamableResource<D> {
        match self.resources.get(key) {
            Some(resource) => resource,
            None => panic!("Unknown resource {:?}", key),
        }
    }

    fn resource_mut(&mut self, key: ResourceKey) -> &mut StreamableResource<D> {
        match self.resources.get_mut(key) {
            Some(resource) => resource,
            None => panic!("Unknown resource {:?}", key),
        }
    }

    /// Record every pending request into one batch, submit it and signal the fence
    ///
    /// With nothing pending this returns an empty batch without touching the device. If an
    /// allocation does not fit, the batch is rolled back: every request returns to the front of
    /// the pending queue in order and a retryable error is returned. Once the batch reached the
    /// queue it is never rolled back; failing to signal it drains the queue and returns
    /// [`StreamError::DeviceLost`].
    ///
    /// # Panics
    /// If the previous batch has not been finalized with [`Self::after_execution`], or a request
    /// names a resource that is missing or not [`ResourceState::Unloaded`].
    pub fn execute(&mut self) -> Result<SubmittedBatch> {
        self.ensure_device()?;
        assert!(
            self.in_flight.is_empty(),
            "Previous batch must be finalized before executing another"
        );
        self.pending.extend(self.receiver.try_iter());
        mem::swap(&mut self.pending, &mut self.in_flight);
        if self.in_flight.is_empty() {
            return Ok(SubmittedBatch {
                fence_value: 0,
                len: 0,
            });
        }
        let _span = tracing::debug_span!("execute", engine = %self.config.label).entered();

        let reset = self.command_stream.reset();
        if let Err(err) = self.check_fatal(reset) {
            self.requeue_in_flight();
            return Err(err);
        }
        let mut recorded = 0;
        let mut failure = None;
        for request in self.in_flight.iter() {
            let resource = match self.resources.get_mut(request.resource()) {
                Some(resource) => resource,
                None => panic!("Unknown resource {:?}", request.resource()),
            };
            assert_eq!(
                resource.state(),
                ResourceState::Unloaded,
                "Requested resource is already loaded or in flight"
            );
            let desc = *request.desc();
            if let Err(err) = resource.start_load(
                &self.device,
                &mut self.command_stream,
                desc.width,
                desc.height,
                desc.format,
                request.data(),
                request.binding_slot(),
            ) {
                failure = Some(err);
                break;
            }
            recorded += 1;
        }
        if let Some(err) = failure {
            self.roll_back(recorded);
            return Err(self.note_error(err));
        }

        if let Err(err) = self.submit() {
            // recorded but never reached the device; the table must not keep loading entries
            if !err.is_fatal() {
                self.roll_back(recorded);
            }
            return Err(self.note_error(err));
        }
        let fence_value = match self.fence.signal_from_queue(&mut self.command_stream) {
            Ok(value) => value,
            Err(err) => return Err(self.abandon_unfenced_batch(err)),
        };
        tracing::debug!(
            "Submitted batch of {} requests at fence value {}",
            self.in_flight.len(),
            fence_value
        );
        Ok(SubmittedBatch {
            fence_value,
            len: self.in_flight.len(),
        })
    }

    /// Close the recording and hand it to the queue
    fn submit(&mut self) -> Result<()> {
        self.command_stream.close()?;
        self.command_stream.execute()
    }

    /// The batch reached the queue but its completion can no longer be observed
    ///
    /// Drains the queue so nothing in flight is released under the device, then poisons the
    /// engine regardless of the kind of failure. In-flight requests are kept as they are.
    fn abandon_unfenced_batch(&mut self, err: StreamError) -> StreamError {
        tracing::error!(
            "{}: failed to signal batch of {} requests, engine is unusable: {}",
            self.config.label,
            self.in_flight.len(),
            err
        );
        if let Err(idle) = self.command_stream.wait_idle() {
            tracing::error!("{}: failed to drain the copy queue: {}", self.config.label, idle);
        }
        self.device_lost = true;
        StreamError::DeviceLost
    }

    /// Abort the first `recorded` in-flight requests and return the whole batch to pending
    fn roll_back(&mut self, recorded: usize) {
        tracing::warn!(
            "{}: rolling back batch of {} requests ({} recorded)",
            self.config.label,
            self.in_flight.len(),
            recorded
        );
        for request in self.in_flight.iter().take(recorded) {
            let resource = match self.resources.get_mut(request.resource()) {
                Some(resource) => resource,
                None => panic!("Unknown resource {:?}", request.resource()),
            };
            if let Err(err) = resource.abort_load(&self.device, request.binding_slot()) {
                tracing::warn!("Failed to clear view while rolling back: {}", err);
            }
        }
        // drop the partial recording and whatever it still references
        if let Err(err) = self.command_stream.reset() {
            tracing::warn!("Failed to discard recording while rolling back: {}", err);
        }
        self.requeue_in_flight();
    }

    /// Put the in-flight requests back in front of anything registered since
    fn requeue_in_flight(&mut self) {
        let mut requests = mem::take(&mut self.in_flight);
        requests.append(&mut self.pending);
        self.pending = requests;
    }

    /// Block until the device finished `batch`
    pub fn wait_for_copy_queue(&mut self, batch: SubmittedBatch) -> Result<CompletedBatch> {
        self.check_batch(&batch);
        if batch.fence_value != 0 {
            self.ensure_device()?;
            let waited = self.fence.wait_for_completion();
            self.check_fatal(waited)?;
        }
        Ok(CompletedBatch {
            fence_value: batch.fence_value,
            len: batch.len,
        })
    }

    /// Check whether the device finished `batch` without blocking
    pub fn poll_copy_queue(&mut self, batch: SubmittedBatch) -> Result<BatchStatus> {
        self.check_batch(&batch);
        if batch.fence_value != 0 {
            self.ensure_device()?;
            let complete = self.fence.is_complete();
            if !self.check_fatal(complete)? {
                return Ok(BatchStatus::Pending(batch));
            }
        }
        Ok(BatchStatus::Complete(CompletedBatch {
            fence_value: batch.fence_value,
            len: batch.len,
        }))
    }

    fn check_batch(&self, batch: &SubmittedBatch) {
        assert!(
            batch.fence_value == 0 || batch.fence_value == self.fence.value_to_wait_for(),
            "Batch at fence value {} does not belong to the current submission ({})",
            batch.fence_value,
            self.fence.value_to_wait_for()
        );
    }

    /// Mark every resource of the completed batch loaded and allow the next
    /// [`Self::execute`]. Returns the number of resources finalized.
    ///
    /// # Panics
    /// If `completed` is not the batch currently in flight, or a resource of the batch is not
    /// [`ResourceState::Loading`].
    pub fn after_execution(&mut self, completed: CompletedBatch) -> usize {
        assert_eq!(
            completed.len,
            self.in_flight.len(),
            "Completed batch does not match the requests in flight"
        );
        let requests = mem::take(&mut self.in_flight);
        for request in requests.iter() {
            let resource = self.resource_mut(request.resource());
            assert_eq!(
                resource.state(),
                ResourceState::Loading,
                "Finalized resource was not loading"
            );
            resource.end_load();
        }
        if !requests.is_empty() {
            tracing::debug!(
                "Finalized batch of {} requests at fence value {}",
                requests.len(),
                completed.fence_value
            );
        }
        requests.len()
    }

    /// Clear the resource's view at `binding_slot`
    pub fn start_unload(&mut self, key: ResourceKey, binding_slot: D::BindingSlot) -> Result<()> {
        self.ensure_device()?;
        let device = self.device.clone();
        let unloaded = self.resource_mut(key).start_unload(&device, binding_slot);
        self.check_fatal(unloaded)
    }

    /// Release the resource's buffers
    pub fn end_unload(&mut self, key: ResourceKey) {
        self.resource_mut(key).end_unload();
    }
}

impl<D: Device> Drop for StreamingEngine<D> {
    fn drop(&mut self) {
        // in-flight buffers must outlive the copies reading them
        if !self.in_flight.is_empty() && !self.device_lost {
            if let Err(err) = self.fence.wait_for_completion() {
                tracing::warn!("{}: failed to wait for batch on drop: {}", self.config.label, err);
            }
        }
    }
}

#[cfg(all(test, feature = "headless"))]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::format::{CopyFootprint, ImageDesc, ImageLayout, PixelFormat};
    use crate::headless::{
        HeadlessCommandStream, HeadlessConfig, HeadlessCounter, HeadlessDevice, HeadlessImage,
        HeadlessStagingBuffer,
    };
    use crate::request::PixelData;

    /// Headless device whose streams accept batches but cannot signal them
    #[derive(Clone)]
    struct UnsignalableDevice(HeadlessDevice);

    struct UnsignalableStream(HeadlessCommandStream);

    impl Device for UnsignalableDevice {
        type Image = HeadlessImage;
        type StagingBuffer = HeadlessStagingBuffer;
        type Counter = HeadlessCounter;
        type CommandStream = UnsignalableStream;
        type BindingSlot = u32;

        fn create_command_stream(&self, name: &str) -> Result<UnsignalableStream> {
            Ok(UnsignalableStream(self.0.create_command_stream(name)?))
        }

        fn create_counter(&self, initial_value: u64) -> Result<HeadlessCounter> {
            self.0.create_counter(initial_value)
        }

        fn create_image(&self, desc: &ImageDesc, name: &str) -> Result<HeadlessImage> {
            self.0.create_image(desc, name)
        }

        fn create_staging_buffer(&self, size: u64, name: &str) -> Result<HeadlessStagingBuffer> {
            self.0.create_staging_buffer(size, name)
        }

        fn copy_row_pitch_alignment(&self) -> u64 {
            self.0.copy_row_pitch_alignment()
        }

        fn write_view(&self, slot: u32, image: &HeadlessImage) -> Result<()> {
            self.0.write_view(slot, image)
        }

        fn write_null_view(&self, slot: u32) -> Result<()> {
            self.0.write_null_view(slot)
        }
    }

    impl CommandStream<UnsignalableDevice> for UnsignalableStream {
        fn reset(&mut self) -> Result<()> {
            self.0.reset()
        }

        fn record_copy(
            &mut self,
            src: &HeadlessStagingBuffer,
            footprint: &CopyFootprint,
            dst: &HeadlessImage,
        ) {
            self.0.record_copy(src, footprint, dst)
        }

        fn record_transition(&mut self, image: &HeadlessImage, from: ImageLayout, to: ImageLayout) {
            self.0.record_transition(image, from, to)
        }

        fn close(&mut self) -> Result<()> {
            self.0.close()
        }

        fn execute(&mut self) -> Result<()> {
            self.0.execute()
        }

        fn signal(&mut self, _counter: &HeadlessCounter, _value: u64) -> Result<()> {
            Err(StreamError::OutOfMemory(crate::error::MemoryLocation::Host))
        }

        fn wait_idle(&mut self) -> Result<()> {
            self.0.wait_idle()
        }
    }

    fn engine(config: HeadlessConfig) -> StreamingEngine<HeadlessDevice> {
        StreamingEngine::new(HeadlessDevice::new(config), StreamingConfig::default()).unwrap()
    }

    fn request<D: Device<BindingSlot = u32>>(
        key: ResourceKey,
        slot: u32,
        size: u32,
    ) -> LoadRequest<D> {
        let bytes = vec![slot as u8; (size * size * 4) as usize];
        LoadRequest::new(
            key,
            PixelData::tightly_packed(bytes, size, PixelFormat::Rgba8Unorm),
            size,
            size,
            PixelFormat::Rgba8Unorm,
            slot,
        )
        .unwrap()
    }

    #[test]
    fn test_empty_execute_is_a_no_op() {
        let mut engine = engine(HeadlessConfig::default());
        let batch = engine.execute().unwrap();
        assert!(batch.is_empty());
        assert_eq!(batch.fence_value(), 0);
        assert_eq!(engine.in_flight_len(), 0);
        assert_eq!(engine.state(), EngineState::Idle);
        assert_eq!(engine.fence().next_value(), 1);
        assert_eq!(engine.device().stats().signals, 0);
        assert_eq!(engine.device().stats().submissions, 0);

        let completed = engine.wait_for_copy_queue(batch).unwrap();
        assert_eq!(engine.after_execution(completed), 0);
    }

    #[test]
    fn test_batch_conservation() {
        let mut engine = engine(HeadlessConfig::default());
        let keys: Vec<_> = (0..5).map(|_| engine.create_resource()).collect();
        for (slot, key) in keys.iter().enumerate() {
            engine.register_load_request(request(*key, slot as u32, 8));
        }
        assert_eq!(engine.pending_len(), 5);

        let batch = engine.execute().unwrap();
        assert_eq!(batch.len(), 5);
        assert_eq!(engine.pending_len(), 0);
        assert_eq!(engine.in_flight_len(), 5);
        assert_eq!(engine.state(), EngineState::Batched);
        for key in keys.iter() {
            assert_eq!(engine.resource(*key).unwrap().state(), ResourceState::Loading);
            assert!(!engine.is_valid(*key));
        }

        let completed = engine.wait_for_copy_queue(batch).unwrap();
        assert_eq!(engine.after_execution(completed), 5);
        assert_eq!(engine.in_flight_len(), 0);
        assert_eq!(engine.state(), EngineState::Idle);
        for key in keys.iter() {
            assert!(engine.is_valid(*key));
            assert!(!engine.resource(*key).unwrap().has_staging());
        }
    }

    #[test]
    fn test_requests_registered_during_batch_wait_for_next_one() {
        let mut engine = engine(HeadlessConfig::default());
        let first = engine.create_resource();
        let second = engine.create_resource();
        engine.register_load_request(request(first, 0, 4));
        let batch = engine.execute().unwrap();
        engine.register_load_request(request(second, 1, 4));
        assert_eq!(engine.pending_len(), 1);

        let completed = engine.wait_for_copy_queue(batch).unwrap();
        engine.after_execution(completed);
        assert!(engine.is_valid(first));
        assert!(!engine.is_valid(second));

        let batch = engine.execute().unwrap();
        assert_eq!(batch.fence_value(), 2);
        let completed = engine.wait_for_copy_queue(batch).unwrap();
        engine.after_execution(completed);
        assert!(engine.is_valid(second));
    }

    #[test]
    #[should_panic(expected = "Previous batch must be finalized before executing another")]
    fn test_execute_with_batch_in_flight_panics() {
        let mut engine = engine(HeadlessConfig::default());
        let key = engine.create_resource();
        engine.register_load_request(request(key, 0, 4));
        let _batch = engine.execute().unwrap();
        let _ = engine.execute();
    }

    #[test]
    #[should_panic(expected = "Requested resource is already loaded or in flight")]
    fn test_loading_a_loaded_resource_panics() {
        let mut engine = engine(HeadlessConfig::default());
        let key = engine.create_resource();
        engine.register_load_request(request(key, 0, 4));
        let batch = engine.execute().unwrap();
        let completed = engine.wait_for_copy_queue(batch).unwrap();
        engine.after_execution(completed);
        engine.register_load_request(request(key, 0, 4));
        let _ = engine.execute();
    }

    #[test]
    fn test_poll_until_complete() {
        let mut engine = engine(HeadlessConfig {
            copy_latency: std::time::Duration::from_millis(10),
            ..Default::default()
        });
        let key = engine.create_resource();
        engine.register_load_request(request(key, 0, 4));
        let mut batch = engine.execute().unwrap();
        let completed = loop {
            match engine.poll_copy_queue(batch).unwrap() {
                BatchStatus::Pending(pending) => {
                    batch = pending;
                    std::thread::yield_now();
                }
                BatchStatus::Complete(completed) => break completed,
            }
        };
        engine.after_execution(completed);
        assert!(engine.is_valid(key));
    }

    #[test]
    fn test_out_of_memory_rolls_back_in_order() {
        // room for exactly two 4x4 RGBA8 images
        let mut engine = engine(HeadlessConfig {
            device_memory_budget: Some(128),
            ..Default::default()
        });
        let keys: Vec<_> = (0..3).map(|_| engine.create_resource()).collect();
        for (slot, key) in keys.iter().enumerate() {
            engine.register_load_request(request(*key, slot as u32, 4));
        }
        let err = engine.execute().unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(engine.state(), EngineState::Idle);
        assert_eq!(engine.pending_len(), 3);
        assert_eq!(engine.device().stats().signals, 0);
        assert_eq!(engine.device().stats().submissions, 0);
        assert_eq!(engine.device().stats().live_device_bytes, 0);
        for (slot, key) in keys.iter().enumerate() {
            let resource = engine.resource(*key).unwrap();
            assert_eq!(resource.state(), ResourceState::Unloaded);
            assert!(!resource.has_image());
            assert!(engine.device().view(slot as u32).is_none());
        }
        assert_eq!(
            engine.pending.iter().map(|r| r.resource()).collect::<Vec<_>>(),
            keys
        );
    }

    #[test]
    fn test_device_loss_poisons_engine() {
        let mut engine = engine(HeadlessConfig::default());
        let key = engine.create_resource();
        engine.register_load_request(request(key, 0, 4));
        engine.device().lose_device();
        assert_eq!(engine.execute().unwrap_err(), StreamError::DeviceLost);
        assert_eq!(engine.execute().unwrap_err(), StreamError::DeviceLost);
    }

    #[test]
    fn test_failed_signal_keeps_submitted_batch() {
        let device = HeadlessDevice::new(HeadlessConfig {
            copy_latency: Duration::from_millis(20),
            ..Default::default()
        });
        let mut engine =
            StreamingEngine::new(UnsignalableDevice(device.clone()), StreamingConfig::default())
                .unwrap();
        let key = engine.create_resource();
        engine.register_load_request(request(key, 5, 4));

        // the device already took the batch, so running out of memory here is not retryable
        assert_eq!(engine.execute().unwrap_err(), StreamError::DeviceLost);
        assert_eq!(device.stats().submissions, 1);
        assert_eq!(device.stats().completed_batches, 1);
        assert_eq!(engine.state(), EngineState::Batched);
        assert_eq!(engine.in_flight_len(), 1);
        assert_eq!(engine.pending_len(), 0);
        let resource = engine.resource(key).unwrap();
        assert_eq!(resource.state(), ResourceState::Loading);
        assert_eq!(resource.image().unwrap().read_texels(), vec![5u8; 64]);
        assert!(device.view(5).is_some());

        assert_eq!(engine.execute().unwrap_err(), StreamError::DeviceLost);
        assert_eq!(engine.start_unload(key, 5).unwrap_err(), StreamError::DeviceLost);
        assert_eq!(device.stats().submissions, 1);
    }

    #[test]
    fn test_device_lost_while_batch_in_flight() {
        let mut engine = engine(HeadlessConfig {
            copy_latency: Duration::from_millis(50),
            ..Default::default()
        });
        let key = engine.create_resource();
        engine.register_load_request(request(key, 0, 4));
        let batch = engine.execute().unwrap();
        engine.device().lose_device();

        assert_eq!(
            engine.wait_for_copy_queue(batch).unwrap_err(),
            StreamError::DeviceLost
        );
        assert!(!engine.is_valid(key));
        assert_eq!(engine.execute().unwrap_err(), StreamError::DeviceLost);
        assert_eq!(engine.start_unload(key, 0).unwrap_err(), StreamError::DeviceLost);
        assert_eq!(engine.device().stats().completed_batches, 0);
    }

    #[test]
    fn test_drop_waits_for_batch_in_flight() {
        let device = HeadlessDevice::new(HeadlessConfig {
            copy_latency: Duration::from_millis(50),
            ..Default::default()
        });
        let mut engine = StreamingEngine::new(device.clone(), StreamingConfig::default()).unwrap();
        let key = engine.create_resource();
        engine.register_load_request(request(key, 0, 4));
        let _batch = engine.execute().unwrap();
        assert_eq!(device.stats().live_images, 1);
        assert_eq!(device.stats().completed_batches, 0);

        drop(engine);
        let stats = device.stats();
        assert_eq!(stats.completed_batches, 1);
        assert_eq!(stats.live_images, 0);
        assert_eq!(stats.live_staging_buffers, 0);
        assert_eq!(stats.live_device_bytes, 0);
    }

    #[test]
    fn test_unload_through_engine() {
        let mut engine = engine(HeadlessConfig::default());
        let key = engine.create_resource();
        engine.register_load_request(request(key, 3, 4));
        let batch = engine.execute().unwrap();
        let completed = engine.wait_for_copy_queue(batch).unwrap();
        engine.after_execution(completed);
        assert!(engine.device().view(3).is_some());

        engine.start_unload(key, 3).unwrap();
        assert!(!engine.is_valid(key));
        assert!(engine.device().view(3).is_none());
        engine.end_unload(key);
        assert_eq!(engine.resource(key).unwrap().state(), ResourceState::Unloaded);
        engine.destroy_resource(key);
        assert!(engine.resource(key).is_none());
        assert!(!engine.is_valid(key));
    }

    #[test]
    #[should_panic(expected = "Only unloaded resources can be destroyed")]
    fn test_destroy_loaded_resource_panics() {
        let mut engine = engine(HeadlessConfig::default());
        let key = engine.create_resource();
        engine.register_load_request(request(key, 0, 4));
        let batch = engine.execute().unwrap();
        let completed = engine.wait_for_copy_queue(batch).unwrap();
        engine.after_execution(completed);
        engine.destroy_resource(key);
    }
}
