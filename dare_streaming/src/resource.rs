use derivative::Derivative;

use crate::error::Result;
use crate::format::{CopyFootprint, ImageDesc, ImageLayout, PixelFormat};
use crate::request::PixelData;
use crate::traits::{CommandStream, Device, StagingBuffer};

slotmap::new_key_type! {
    /// Names one [`StreamableResource`] inside a [`crate::engine::StreamingEngine`]
    pub struct ResourceKey;
}

/// Lifecycle of a streamed resource
///
/// `Unloaded -> Loading -> Loaded -> Unloading -> Unloaded`
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum ResourceState {
    #[default]
    Unloaded,
    /// Copy recorded, device has not confirmed completion yet
    Loading,
    /// Readable by rendering
    Loaded,
    /// View cleared, buffers not yet released
    Unloading,
}

/// One streamed image and the buffers backing it
///
/// Holds a destination image and a staging buffer at the same time only while
/// [`ResourceState::Loading`]. Both are released by dropping them.
#[derive(Derivative)]
#[derivative(Debug(bound = ""), Default(bound = ""))]
pub struct StreamableResource<D: Device> {
    state: ResourceState,
    desc: Option<ImageDesc>,
    image: Option<D::Image>,
    staging: Option<D::StagingBuffer>,
}

impl<D: Device> StreamableResource<D> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the destination image and staging buffer, fill staging with `data` and record
    /// the copy into `command_stream`. Publishes the view at `binding_slot`.
    ///
    /// Only records; nothing is submitted. On failure the resource stays
    /// [`ResourceState::Unloaded`] and owns nothing.
    ///
    /// # Panics
    /// If the resource is not [`ResourceState::Unloaded`] or still owns buffers.
    #[allow(clippy::too_many_arguments)]
    pub fn start_load(
        &mut self,
        device: &D,
        command_stream: &mut D::CommandStream,
        width: u32,
        height: u32,
        format: PixelFormat,
        data: &PixelData,
        binding_slot: D::BindingSlot,
    ) -> Result<()> {
        assert_eq!(
            self.state,
            ResourceState::Unloaded,
            "Only unloaded resources can start loading"
        );
        assert!(
            self.image.is_none() && self.staging.is_none(),
            "Resource still owns buffers, cannot start loading"
        );
        let desc = ImageDesc::new(width, height, format)?;
        data.validate(&desc)?;

        let footprint = CopyFootprint::new(&desc, device.copy_row_pitch_alignment())?;
        let image = device.create_image(&desc, "StreamedImage")?;
        let mut staging = device.create_staging_buffer(footprint.size, "StreamedImageStaging")?;
        Self::fill_staging(&mut staging, &footprint, data)?;

        command_stream.record_copy(&staging, &footprint, &image);
        command_stream.record_transition(
            &image,
            ImageLayout::CopyDestination,
            ImageLayout::ShaderReadOnly,
        );
        device.write_view(binding_slot, &image)?;

        tracing::trace!(
            "Recorded load of {}x{} {:?} ({} staging bytes)",
            width,
            height,
            format,
            footprint.size
        );
        self.desc = Some(desc);
        self.image = Some(image);
        self.staging = Some(staging);
        self.state = ResourceState::Loading;
        Ok(())
    }

    /// Place the rows of `data` at the footprint's row offsets
    fn fill_staging(
        staging: &mut D::StagingBuffer,
        footprint: &CopyFootprint,
        data: &PixelData,
    ) -> Result<()> {
        if data.row_pitch() as u64 == footprint.row_pitch {
            return staging.write(
                footprint.offset,
                &data.bytes()[..footprint.size as usize],
            );
        }
        for row in 0..footprint.rows {
            staging.write(
                footprint.row_offset(row),
                data.row(row, footprint.row_bytes as usize),
            )?;
        }
        Ok(())
    }

    /// Mark the copy as finished and release the staging buffer
    ///
    /// Must only be called once the device confirmed the recorded copy completed.
    ///
    /// # Panics
    /// If the resource is not [`ResourceState::Loading`].
    pub fn end_load(&mut self) {
        assert_eq!(
            self.state,
            ResourceState::Loading,
            "Only loading resources can finish loading"
        );
        self.state = ResourceState::Loaded;
        self.staging = None;
    }

    /// Clear the view at `binding_slot` ahead of releasing the buffers
    ///
    /// # Panics
    /// If the resource is not [`ResourceState::Loaded`].
    pub fn start_unload(&mut self, device: &D, binding_slot: D::BindingSlot) -> Result<()> {
        assert_eq!(
            self.state,
            ResourceState::Loaded,
            "Only loaded resources can start unloading"
        );
        device.write_null_view(binding_slot)?;
        self.state = ResourceState::Unloading;
        Ok(())
    }

    /// Release every buffer and return to [`ResourceState::Unloaded`]
    ///
    /// # Panics
    /// If the resource is not [`ResourceState::Unloading`].
    pub fn end_unload(&mut self) {
        assert_eq!(
            self.state,
            ResourceState::Unloading,
            "Only unloading resources can finish unloading"
        );
        self.release();
    }

    /// Undo a [`Self::start_load`] whose commands were never submitted
    ///
    /// # Panics
    /// If the resource is not [`ResourceState::Loading`].
    pub fn abort_load(&mut self, device: &D, binding_slot: D::BindingSlot) -> Result<()> {
        assert_eq!(
            self.state,
            ResourceState::Loading,
            "Only loading resources can abort loading"
        );
        let cleared = device.write_null_view(binding_slot);
        self.release();
        cleared
    }

    fn release(&mut self) {
        self.staging = None;
        self.image = None;
        self.desc = None;
        self.state = ResourceState::Unloaded;
    }

    /// Whether rendering may read the resource
    pub fn is_valid(&self) -> bool {
        self.state == ResourceState::Loaded
    }

    pub fn state(&self) -> ResourceState {
        self.state
    }

    pub fn desc(&self) -> Option<&ImageDesc> {
        self.desc.as_ref()
    }

    pub fn image(&self) -> Option<&D::Image> {
        self.image.as_ref()
    }

    pub fn has_image(&self) -> bool {
        self.image.is_some()
    }

    pub fn has_staging(&self) -> bool {
        self.staging.is_some()
    }
}
