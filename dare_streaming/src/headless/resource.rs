use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use derivative::Derivative;

use super::device::DeviceInner;
use crate::error::{MemoryLocation, Result, StreamError};
use crate::format::{ImageDesc, ImageLayout};
use crate::traits::StagingBuffer;

/// Budget accounting of one image or staging buffer, returned on drop
#[derive(Derivative)]
#[derivative(Debug)]
pub(super) struct HeadlessAllocation {
    #[derivative(Debug = "ignore")]
    device: Arc<DeviceInner>,
    location: MemoryLocation,
    size: u64,
}

impl HeadlessAllocation {
    pub(super) fn new(device: Arc<DeviceInner>, location: MemoryLocation, size: u64) -> Self {
        Self {
            device,
            location,
            size,
        }
    }
}

impl Drop for HeadlessAllocation {
    fn drop(&mut self) {
        self.device.release(self.location, self.size);
    }
}

#[derive(Derivative)]
#[derivative(Debug)]
pub(super) struct ImageShared {
    id: u64,
    name: String,
    desc: ImageDesc,
    #[derivative(Debug = "ignore")]
    pub(super) texels: Mutex<Vec<u8>>,
    pub(super) layout: Mutex<ImageLayout>,
    _allocation: HeadlessAllocation,
}

impl Drop for ImageShared {
    fn drop(&mut self) {
        #[cfg(feature = "log-lifetimes")]
        tracing::trace!("Destroying headless image {} ({})", self.id, self.name);
    }
}

/// Host-memory image. Texels are stored tightly packed.
///
/// Commands recorded against the image keep it alive until the copy engine is done with them.
#[derive(Debug)]
pub struct HeadlessImage {
    shared: Arc<ImageShared>,
}

impl HeadlessImage {
    pub(super) fn new(id: u64, desc: ImageDesc, allocation: HeadlessAllocation, name: &str) -> Self {
        #[cfg(feature = "log-lifetimes")]
        tracing::trace!("Creating headless image {} ({})", id, name);
        Self {
            shared: Arc::new(ImageShared {
                id,
                name: name.to_string(),
                desc,
                texels: Mutex::new(vec![0; desc.packed_size()]),
                layout: Mutex::new(ImageLayout::CopyDestination),
                _allocation: allocation,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn desc(&self) -> &ImageDesc {
        &self.shared.desc
    }

    pub fn layout(&self) -> ImageLayout {
        *lock(&self.shared.layout)
    }

    /// Copy of the image contents, tightly packed
    pub fn read_texels(&self) -> Vec<u8> {
        lock(&self.shared.texels).clone()
    }

    pub(super) fn shared(&self) -> &Arc<ImageShared> {
        &self.shared
    }
}

#[derive(Derivative)]
#[derivative(Debug)]
pub(super) struct StagingShared {
    name: String,
    #[derivative(Debug = "ignore")]
    pub(super) bytes: Mutex<Vec<u8>>,
    _allocation: HeadlessAllocation,
}

impl Drop for StagingShared {
    fn drop(&mut self) {
        #[cfg(feature = "log-lifetimes")]
        tracing::trace!("Destroying headless staging buffer {}", self.name);
    }
}

/// Host-memory staging buffer
#[derive(Debug)]
pub struct HeadlessStagingBuffer {
    size: u64,
    shared: Arc<StagingShared>,
}

impl HeadlessStagingBuffer {
    pub(super) fn new(size: u64, allocation: HeadlessAllocation, name: &str) -> Self {
        #[cfg(feature = "log-lifetimes")]
        tracing::trace!("Creating headless staging buffer {} of {} bytes", name, size);
        Self {
            size,
            shared: Arc::new(StagingShared {
                name: name.to_string(),
                bytes: Mutex::new(vec![0; size as usize]),
                _allocation: allocation,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Copy of the buffer contents
    pub fn read(&self) -> Vec<u8> {
        lock(&self.shared.bytes).clone()
    }

    pub(super) fn shared(&self) -> &Arc<StagingShared> {
        &self.shared
    }
}

impl StagingBuffer for HeadlessStagingBuffer {
    fn size(&self) -> u64 {
        self.size
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let len = data.len() as u64;
        let end = offset.checked_add(len).filter(|end| *end <= self.size);
        let Some(end) = end else {
            return Err(StreamError::StagingOverflow {
                offset,
                len,
                size: self.size,
            });
        };
        lock(&self.shared.bytes)[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }
}

pub(super) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
