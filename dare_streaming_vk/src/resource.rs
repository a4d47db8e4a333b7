use std::ptr;
use std::sync::Arc;

use ash::vk;
use dare_streaming::error::{Result, StreamError};
use dare_streaming::format::ImageDesc;
use dare_streaming::traits::StagingBuffer;
use dare_streaming::MemoryLocation;
use derivative::Derivative;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};

use crate::device::DeviceShared;
use crate::error::VulkanStreamingError;
use crate::format::{color_subresource_range, vk_format};

/// Device-local sampled image with its view
///
/// Partially created images clean up whatever they own on drop.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct VulkanImage {
    handle: vk::Image,
    view: vk::ImageView,
    desc: ImageDesc,
    name: String,
    #[derivative(Debug = "ignore")]
    allocation: Option<Allocation>,
    #[derivative(Debug = "ignore")]
    shared: Arc<DeviceShared>,
}

impl VulkanImage {
    pub(crate) fn new(
        shared: Arc<DeviceShared>,
        desc: &ImageDesc,
        name: &str,
    ) -> Result<Self, VulkanStreamingError> {
        let format = vk_format(desc.format);
        let families = shared.queue_families();
        let sharing_mode = if families.len() > 1 {
            vk::SharingMode::CONCURRENT
        } else {
            vk::SharingMode::EXCLUSIVE
        };
        let image_ci = vk::ImageCreateInfo {
            s_type: vk::StructureType::IMAGE_CREATE_INFO,
            p_next: ptr::null(),
            flags: vk::ImageCreateFlags::empty(),
            image_type: vk::ImageType::TYPE_2D,
            format,
            extent: vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
            sharing_mode,
            queue_family_index_count: families.len() as u32,
            p_queue_family_indices: families.as_ptr(),
            initial_layout: vk::ImageLayout::UNDEFINED,
            _marker: Default::default(),
        };
        let handle = unsafe { shared.device.create_image(&image_ci, None)? };
        #[cfg(feature = "log-lifetimes")]
        tracing::trace!("Creating VkImage {:p}", handle);

        let mut image = Self {
            handle,
            view: vk::ImageView::null(),
            desc: *desc,
            name: name.to_string(),
            allocation: None,
            shared,
        };
        let requirements = unsafe { image.shared.device.get_image_memory_requirements(handle) };
        let allocation = image
            .shared
            .allocator()
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location: gpu_allocator::MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(VulkanStreamingError::allocation(MemoryLocation::Device))?;
        let (memory, offset) = unsafe { (allocation.memory(), allocation.offset()) };
        image.allocation = Some(allocation);
        unsafe {
            image
                .shared
                .device
                .bind_image_memory(handle, memory, offset)?
        };

        let view_ci = vk::ImageViewCreateInfo {
            s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
            p_next: ptr::null(),
            flags: vk::ImageViewCreateFlags::empty(),
            image: handle,
            view_type: vk::ImageViewType::TYPE_2D,
            format,
            components: vk::ComponentMapping::default(),
            subresource_range: color_subresource_range(),
            _marker: Default::default(),
        };
        image.view = unsafe { image.shared.device.create_image_view(&view_ci, None)? };
        #[cfg(feature = "log-lifetimes")]
        tracing::trace!("Creating VkImageView {:p}", image.view);
        Ok(image)
    }

    pub fn handle(&self) -> vk::Image {
        self.handle
    }

    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    pub fn desc(&self) -> &ImageDesc {
        &self.desc
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for VulkanImage {
    fn drop(&mut self) {
        unsafe {
            if self.view != vk::ImageView::null() {
                #[cfg(feature = "log-lifetimes")]
                tracing::trace!("Destroying VkImageView {:p}", self.view);
                self.shared.device.destroy_image_view(self.view, None);
            }
            #[cfg(feature = "log-lifetimes")]
            tracing::trace!("Destroying VkImage {:p}", self.handle);
            self.shared.device.destroy_image(self.handle, None);
        }
        if let Some(allocation) = self.allocation.take() {
            if let Err(err) = self.shared.allocator().free(allocation) {
                tracing::error!("Failed to free memory of image {}: {}", self.name, err);
            }
        }
    }
}

/// Host-visible copy source
#[derive(Derivative)]
#[derivative(Debug)]
pub struct VulkanStagingBuffer {
    handle: vk::Buffer,
    size: u64,
    name: String,
    #[derivative(Debug = "ignore")]
    allocation: Option<Allocation>,
    #[derivative(Debug = "ignore")]
    shared: Arc<DeviceShared>,
}

impl VulkanStagingBuffer {
    pub(crate) fn new(
        shared: Arc<DeviceShared>,
        size: u64,
        name: &str,
    ) -> Result<Self, VulkanStreamingError> {
        let buffer_ci = vk::BufferCreateInfo {
            s_type: vk::StructureType::BUFFER_CREATE_INFO,
            p_next: ptr::null(),
            flags: vk::BufferCreateFlags::empty(),
            size,
            usage: vk::BufferUsageFlags::TRANSFER_SRC,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            queue_family_index_count: 0,
            p_queue_family_indices: ptr::null(),
            _marker: Default::default(),
        };
        let handle = unsafe { shared.device.create_buffer(&buffer_ci, None)? };
        #[cfg(feature = "log-lifetimes")]
        tracing::trace!("Creating VkBuffer {:p}", handle);

        let mut buffer = Self {
            handle,
            size,
            name: name.to_string(),
            allocation: None,
            shared,
        };
        let requirements = unsafe { buffer.shared.device.get_buffer_memory_requirements(handle) };
        let allocation = buffer
            .shared
            .allocator()
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location: gpu_allocator::MemoryLocation::CpuToGpu,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(VulkanStreamingError::allocation(MemoryLocation::Host))?;
        let (memory, offset) = unsafe { (allocation.memory(), allocation.offset()) };
        buffer.allocation = Some(allocation);
        unsafe {
            buffer
                .shared
                .device
                .bind_buffer_memory(handle, memory, offset)?
        };
        Ok(buffer)
    }

    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl StagingBuffer for VulkanStagingBuffer {
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
        let mapped = self
            .allocation
            .as_mut()
            .and_then(Allocation::mapped_slice_mut)
            .ok_or(VulkanStreamingError::NoMappedPointer)?;
        mapped[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }
}

impl Drop for VulkanStagingBuffer {
    fn drop(&mut self) {
        #[cfg(feature = "log-lifetimes")]
        tracing::trace!("Destroying VkBuffer {:p}", self.handle);
        unsafe {
            self.shared.device.destroy_buffer(self.handle, None);
        }
        if let Some(allocation) = self.allocation.take() {
            if let Err(err) = self.shared.allocator().free(allocation) {
                tracing::error!("Failed to free memory of staging buffer {}: {}", self.name, err);
            }
        }
    }
}
