use std::mem;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use derivative::Derivative;

use super::counter::{CounterShared, HeadlessCounter};
use super::device::{DeviceInner, HeadlessDevice};
use super::resource::{HeadlessImage, HeadlessStagingBuffer, ImageShared, StagingShared, lock};
use crate::error::{Result, StreamError};
use crate::format::{CopyFootprint, ImageLayout};
use crate::traits::CommandStream;

/// A recorded command. Holds the resources it touches until the copy engine ran it.
#[derive(Debug)]
enum HeadlessCommand {
    Copy {
        src: Arc<StagingShared>,
        footprint: CopyFootprint,
        dst: Arc<ImageShared>,
    },
    Transition {
        image: Arc<ImageShared>,
        from: ImageLayout,
        to: ImageLayout,
    },
}

enum CopyEnginePacket {
    Execute(Vec<HeadlessCommand>),
    Signal { counter: Arc<CounterShared>, value: u64 },
    /// Answered once every packet before it was handled
    Flush(Sender<()>),
    Stop,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum RecordingState {
    Initial,
    Recording,
    Executable,
}

/// Command list plus the queue it submits to
///
/// Each stream owns a copy-engine thread which runs submitted batches and signals in submission
/// order.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct HeadlessCommandStream {
    name: String,
    state: RecordingState,
    commands: Vec<HeadlessCommand>,
    #[derivative(Debug = "ignore")]
    device: HeadlessDevice,
    #[derivative(Debug = "ignore")]
    sender: Sender<CopyEnginePacket>,
    #[derivative(Debug = "ignore")]
    worker: Option<JoinHandle<()>>,
}

impl HeadlessCommandStream {
    pub(super) fn new(device: HeadlessDevice, name: &str) -> Result<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let engine = CopyEngine {
            device: device.inner().clone(),
            receiver,
        };
        let worker = std::thread::Builder::new()
            .name(format!("{name} copy engine"))
            .spawn(move || engine.run())
            .map_err(|err| StreamError::Backend(format!("Failed to spawn copy engine: {err}")))?;
        tracing::trace!("Created headless command stream {}", name);
        Ok(Self {
            name: name.to_string(),
            state: RecordingState::Initial,
            commands: Vec::new(),
            device,
            sender,
            worker: Some(worker),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Commands recorded since the last reset
    pub fn recorded_len(&self) -> usize {
        self.commands.len()
    }

    fn assert_recording(&self) {
        assert_eq!(
            self.state,
            RecordingState::Recording,
            "Command stream {} is not recording",
            self.name
        );
    }

    fn send(&self, packet: CopyEnginePacket) -> Result<()> {
        self.sender
            .send(packet)
            .map_err(|_| StreamError::Backend(format!("Copy engine of {} is gone", self.name)))
    }
}

impl CommandStream<HeadlessDevice> for HeadlessCommandStream {
    fn reset(&mut self) -> Result<()> {
        self.device.inner().ensure_alive()?;
        self.commands.clear();
        self.state = RecordingState::Recording;
        Ok(())
    }

    fn record_copy(
        &mut self,
        src: &HeadlessStagingBuffer,
        footprint: &CopyFootprint,
        dst: &HeadlessImage,
    ) {
        self.assert_recording();
        self.commands.push(HeadlessCommand::Copy {
            src: src.shared().clone(),
            footprint: *footprint,
            dst: dst.shared().clone(),
        });
    }

    fn record_transition(&mut self, image: &HeadlessImage, from: ImageLayout, to: ImageLayout) {
        self.assert_recording();
        self.commands.push(HeadlessCommand::Transition {
            image: image.shared().clone(),
            from,
            to,
        });
    }

    fn close(&mut self) -> Result<()> {
        self.assert_recording();
        self.state = RecordingState::Executable;
        Ok(())
    }

    fn execute(&mut self) -> Result<()> {
        assert_eq!(
            self.state,
            RecordingState::Executable,
            "Command stream {} must be closed before executing",
            self.name
        );
        self.device.inner().ensure_alive()?;
        let commands = mem::take(&mut self.commands);
        self.send(CopyEnginePacket::Execute(commands))?;
        self.state = RecordingState::Initial;
        self.device.inner().submissions.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn signal(&mut self, counter: &HeadlessCounter, value: u64) -> Result<()> {
        self.device.inner().ensure_alive()?;
        self.send(CopyEnginePacket::Signal {
            counter: counter.shared().clone(),
            value,
        })?;
        self.device.inner().signals.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn wait_idle(&mut self) -> Result<()> {
        let (done, flushed) = crossbeam_channel::bounded(1);
        self.send(CopyEnginePacket::Flush(done))?;
        flushed
            .recv()
            .map_err(|_| StreamError::Backend(format!("Copy engine of {} is gone", self.name)))?;
        self.device.inner().ensure_alive()
    }
}

impl Drop for HeadlessCommandStream {
    fn drop(&mut self) {
        let _ = self.sender.send(CopyEnginePacket::Stop);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("Copy engine of {} panicked", self.name);
            }
        }
    }
}

/// Plays back submitted work against host memory
struct CopyEngine {
    device: Arc<DeviceInner>,
    receiver: Receiver<CopyEnginePacket>,
}

impl CopyEngine {
    fn run(self) {
        while let Ok(packet) = self.receiver.recv() {
            match packet {
                CopyEnginePacket::Execute(commands) => {
                    let latency = self.device.config.copy_latency;
                    if !latency.is_zero() {
                        std::thread::sleep(latency);
                    }
                    if self.device.is_lost() {
                        continue;
                    }
                    match commands.iter().try_for_each(Self::apply) {
                        Ok(()) => {
                            self.device.completed_batches.fetch_add(1, Ordering::AcqRel);
                        }
                        Err(err) => {
                            tracing::error!("Copy engine fault: {}", err);
                            self.device.lose();
                        }
                    }
                }
                CopyEnginePacket::Signal { counter, value } => {
                    if !self.device.is_lost() {
                        counter.signal(value);
                    }
                }
                CopyEnginePacket::Flush(done) => {
                    let _ = done.send(());
                }
                CopyEnginePacket::Stop => break,
            }
        }
    }

    fn apply(command: &HeadlessCommand) -> Result<()> {
        match command {
            HeadlessCommand::Copy {
                src,
                footprint,
                dst,
            } => {
                let layout = *lock(&dst.layout);
                if layout != ImageLayout::CopyDestination {
                    return Err(StreamError::Backend(format!(
                        "Copy into image in {layout:?} layout"
                    )));
                }
                let staging = lock(&src.bytes);
                let mut texels = lock(&dst.texels);
                let row_bytes = footprint.row_bytes as usize;
                for row in 0..footprint.rows {
                    let from = footprint.row_offset(row) as usize;
                    let to = row as usize * row_bytes;
                    let (Some(source), Some(target)) = (
                        staging.get(from..from + row_bytes),
                        texels.get_mut(to..to + row_bytes),
                    ) else {
                        return Err(StreamError::Backend(format!(
                            "Copy of row {row} out of bounds"
                        )));
                    };
                    target.copy_from_slice(source);
                }
                Ok(())
            }
            HeadlessCommand::Transition { image, from, to } => {
                let mut layout = lock(&image.layout);
                if *layout != *from {
                    return Err(StreamError::Backend(format!(
                        "Transition from {from:?} but image is in {:?}",
                        *layout
                    )));
                }
                *layout = *to;
                Ok(())
            }
        }
    }
}
