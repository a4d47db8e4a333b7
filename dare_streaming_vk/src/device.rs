use std::ptr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ash::vk;
use dare_streaming::error::Result;
use dare_streaming::format::ImageDesc;
use dare_streaming::traits::Device;
use derivative::Derivative;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};

use crate::command::VulkanCommandStream;
use crate::error::VulkanStreamingError;
use crate::resource::{VulkanImage, VulkanStagingBuffer};
use crate::sync::VulkanTimelineCounter;

/// A queue handed to the streaming device
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub queue: vk::Queue,
    pub family_index: u32,
}

/// Everything [`VulkanStreamingDevice`] borrows from the application
///
/// The instance, device and descriptor set stay owned by the caller and must outlive the
/// streaming device. Submissions to `transfer_queue` are only synchronized against other
/// submissions made through the streaming device.
pub struct VulkanStreamingCreateInfo<'a> {
    pub instance: &'a ash::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: ash::Device,
    pub transfer_queue: QueueInfo,
    /// Queue families sampling streamed images. Images are shared concurrently between these
    /// and the transfer family.
    pub sampling_queue_families: Vec<u32>,
    /// Set holding the sampled image array binding slots index into
    pub descriptor_set: vk::DescriptorSet,
    pub sampled_image_binding: u32,
    /// Written on unload. `None` writes `VK_NULL_HANDLE`, which requires `nullDescriptor`.
    pub fallback_view: Option<vk::ImageView>,
}

#[derive(Derivative)]
#[derivative(Debug)]
pub(crate) struct DeviceShared {
    #[derivative(Debug = "ignore")]
    pub(crate) device: ash::Device,
    #[derivative(Debug = "ignore")]
    allocator: Mutex<Allocator>,
    submit_lock: Mutex<()>,
    transfer_queue: QueueInfo,
    queue_families: Vec<u32>,
    descriptor_set: vk::DescriptorSet,
    sampled_image_binding: u32,
    fallback_view: Option<vk::ImageView>,
    row_pitch_alignment: u64,
}

impl DeviceShared {
    pub(crate) fn allocator(&self) -> MutexGuard<'_, Allocator> {
        self.allocator.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Held while submitting to a queue
    pub(crate) fn submit_lock(&self) -> MutexGuard<'_, ()> {
        self.submit_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Families streamed images are shared between
    pub(crate) fn queue_families(&self) -> &[u32] {
        &self.queue_families
    }

    fn write_descriptor(&self, slot: u32, view: vk::ImageView) {
        let image_info = vk::DescriptorImageInfo {
            sampler: vk::Sampler::null(),
            image_view: view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        };
        unsafe {
            self.device.update_descriptor_sets(
                &[vk::WriteDescriptorSet {
                    s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
                    p_next: ptr::null(),
                    dst_set: self.descriptor_set,
                    dst_binding: self.sampled_image_binding,
                    dst_array_element: slot,
                    descriptor_count: 1,
                    descriptor_type: vk::DescriptorType::SAMPLED_IMAGE,
                    p_image_info: &image_info,
                    p_buffer_info: ptr::null(),
                    p_texel_buffer_view: ptr::null(),
                    _marker: Default::default(),
                }],
                &[],
            );
        }
    }
}

/// Streaming device backed by a Vulkan transfer queue
///
/// Images and staging buffers come from a [`gpu_allocator`] allocator owned by this device.
/// Cheap to clone.
#[derive(Debug, Clone)]
pub struct VulkanStreamingDevice {
    shared: Arc<DeviceShared>,
}

impl VulkanStreamingDevice {
    pub fn new(create_info: VulkanStreamingCreateInfo<'_>) -> Result<Self, VulkanStreamingError> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: create_info.instance.clone(),
            device: create_info.device.clone(),
            physical_device: create_info.physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(VulkanStreamingError::allocation(
            dare_streaming::MemoryLocation::Device,
        ))?;
        let properties = unsafe {
            create_info
                .instance
                .get_physical_device_properties(create_info.physical_device)
        };
        let row_pitch_alignment = properties
            .limits
            .optimal_buffer_copy_row_pitch_alignment
            .max(1);

        let mut queue_families = create_info.sampling_queue_families;
        queue_families.push(create_info.transfer_queue.family_index);
        queue_families.sort_unstable();
        queue_families.dedup();

        tracing::debug!(
            "Created Vulkan streaming device, row pitch alignment {}, queue families {:?}",
            row_pitch_alignment,
            queue_families
        );
        Ok(Self {
            shared: Arc::new(DeviceShared {
                device: create_info.device,
                allocator: Mutex::new(allocator),
                submit_lock: Mutex::new(()),
                transfer_queue: create_info.transfer_queue,
                queue_families,
                descriptor_set: create_info.descriptor_set,
                sampled_image_binding: create_info.sampled_image_binding,
                fallback_view: create_info.fallback_view,
                row_pitch_alignment,
            }),
        })
    }

    pub fn get_device(&self) -> &ash::Device {
        &self.shared.device
    }

    pub fn transfer_queue(&self) -> QueueInfo {
        self.shared.transfer_queue
    }
}

impl Device for VulkanStreamingDevice {
    type Image = VulkanImage;
    type StagingBuffer = VulkanStagingBuffer;
    type Counter = VulkanTimelineCounter;
    type CommandStream = VulkanCommandStream;
    type BindingSlot = u32;

    fn create_command_stream(&self, name: &str) -> Result<Self::CommandStream> {
        Ok(VulkanCommandStream::new(
            self.shared.clone(),
            self.shared.transfer_queue,
            name,
        )?)
    }

    fn create_counter(&self, initial_value: u64) -> Result<Self::Counter> {
        Ok(VulkanTimelineCounter::new(
            self.shared.clone(),
            initial_value,
        )?)
    }

    fn create_image(&self, desc: &ImageDesc, name: &str) -> Result<Self::Image> {
        Ok(VulkanImage::new(self.shared.clone(), desc, name)?)
    }

    fn create_staging_buffer(&self, size: u64, name: &str) -> Result<Self::StagingBuffer> {
        Ok(VulkanStagingBuffer::new(self.shared.clone(), size, name)?)
    }

    fn copy_row_pitch_alignment(&self) -> u64 {
        self.shared.row_pitch_alignment
    }

    fn write_view(&self, slot: u32, image: &VulkanImage) -> Result<()> {
        self.shared.write_descriptor(slot, image.view());
        Ok(())
    }

    fn write_null_view(&self, slot: u32) -> Result<()> {
        self.shared
            .write_descriptor(slot, self.shared.fallback_view.unwrap_or_default());
        Ok(())
    }
}
