use std::ptr;
use std::sync::Arc;

use ash::vk;
use dare_streaming::error::Result;
use dare_streaming::format::{CopyFootprint, ImageLayout};
use dare_streaming::traits::CommandStream;
use derivative::Derivative;

use crate::device::{DeviceShared, QueueInfo, VulkanStreamingDevice};
use crate::error::{VulkanStreamingError, vk_error};
use crate::format::{color_subresource_range, layout_scope, vk_layout};
use crate::resource::{VulkanImage, VulkanStagingBuffer};
use crate::sync::VulkanTimelineCounter;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum RecordingState {
    Initial,
    Recording,
    Executable,
}

/// Command pool with a single primary command buffer, bound to one queue
#[derive(Derivative)]
#[derivative(Debug)]
pub struct VulkanCommandStream {
    pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    queue: QueueInfo,
    state: RecordingState,
    name: String,
    #[derivative(Debug = "ignore")]
    shared: Arc<DeviceShared>,
}

impl VulkanCommandStream {
    pub(crate) fn new(
        shared: Arc<DeviceShared>,
        queue: QueueInfo,
        name: &str,
    ) -> Result<Self, VulkanStreamingError> {
        let pool_ci = vk::CommandPoolCreateInfo {
            s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
            p_next: ptr::null(),
            flags: vk::CommandPoolCreateFlags::TRANSIENT,
            queue_family_index: queue.family_index,
            _marker: Default::default(),
        };
        let pool = unsafe { shared.device.create_command_pool(&pool_ci, None)? };
        #[cfg(feature = "log-lifetimes")]
        tracing::trace!("Creating VkCommandPool {:p}", pool);

        let mut stream = Self {
            pool,
            command_buffer: vk::CommandBuffer::null(),
            queue,
            state: RecordingState::Initial,
            name: name.to_string(),
            shared,
        };
        let allocate_info = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            p_next: ptr::null(),
            command_pool: pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: 1,
            _marker: Default::default(),
        };
        let buffers = unsafe {
            stream
                .shared
                .device
                .allocate_command_buffers(&allocate_info)?
        };
        stream.command_buffer = buffers
            .into_iter()
            .next()
            .ok_or(VulkanStreamingError::Vk(vk::Result::ERROR_UNKNOWN))?;
        Ok(stream)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    fn assert_recording(&self) {
        assert_eq!(
            self.state,
            RecordingState::Recording,
            "Command stream {} is not recording",
            self.name
        );
    }

    fn barrier(&self, image: vk::Image, from: ImageLayout, to: ImageLayout) {
        let (src_stage_mask, src_access_mask) = layout_scope(from);
        let (dst_stage_mask, dst_access_mask) = layout_scope(to);
        unsafe {
            self.shared.device.cmd_pipeline_barrier2(
                self.command_buffer,
                &vk::DependencyInfo {
                    s_type: vk::StructureType::DEPENDENCY_INFO,
                    p_next: ptr::null(),
                    dependency_flags: vk::DependencyFlags::empty(),
                    memory_barrier_count: 0,
                    p_memory_barriers: ptr::null(),
                    buffer_memory_barrier_count: 0,
                    p_buffer_memory_barriers: ptr::null(),
                    image_memory_barrier_count: 1,
                    p_image_memory_barriers: &vk::ImageMemoryBarrier2 {
                        s_type: vk::StructureType::IMAGE_MEMORY_BARRIER_2,
                        p_next: ptr::null(),
                        src_stage_mask,
                        src_access_mask,
                        dst_stage_mask,
                        dst_access_mask,
                        old_layout: vk_layout(from),
                        new_layout: vk_layout(to),
                        // images are shared concurrently, no ownership transfer
                        src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                        dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                        image,
                        subresource_range: color_subresource_range(),
                        _marker: Default::default(),
                    },
                    _marker: Default::default(),
                },
            );
        }
    }

    fn submit(&self, submit_info: &vk::SubmitInfo2<'_>) -> Result<()> {
        let _guard = self.shared.submit_lock();
        unsafe {
            self.shared.device.queue_submit2(
                self.queue.queue,
                std::slice::from_ref(submit_info),
                vk::Fence::null(),
            )
        }
        .map_err(vk_error)
    }
}

impl CommandStream<VulkanStreamingDevice> for VulkanCommandStream {
    fn reset(&mut self) -> Result<()> {
        unsafe {
            self.shared
                .device
                .reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())
                .map_err(vk_error)?;
            self.shared
                .device
                .begin_command_buffer(
                    self.command_buffer,
                    &vk::CommandBufferBeginInfo {
                        s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
                        p_next: ptr::null(),
                        flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
                        p_inheritance_info: ptr::null(),
                        _marker: Default::default(),
                    },
                )
                .map_err(vk_error)?;
        }
        self.state = RecordingState::Recording;
        Ok(())
    }

    fn record_copy(
        &mut self,
        src: &VulkanStagingBuffer,
        footprint: &CopyFootprint,
        dst: &VulkanImage,
    ) {
        self.assert_recording();
        self.barrier(dst.handle(), ImageLayout::Undefined, ImageLayout::CopyDestination);
        let desc = dst.desc();
        // texels, 0 meaning tightly packed
        let buffer_row_length = if footprint.is_tightly_packed() {
            0
        } else {
            (footprint.row_pitch / desc.format.bytes_per_pixel() as u64) as u32
        };
        unsafe {
            self.shared.device.cmd_copy_buffer_to_image(
                self.command_buffer,
                src.handle(),
                dst.handle(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[vk::BufferImageCopy {
                    buffer_offset: footprint.offset,
                    buffer_row_length,
                    buffer_image_height: 0,
                    image_subresource: vk::ImageSubresourceLayers {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        mip_level: 0,
                        base_array_layer: 0,
                        layer_count: 1,
                    },
                    image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
                    image_extent: vk::Extent3D {
                        width: desc.width,
                        height: desc.height,
                        depth: 1,
                    },
                }],
            );
        }
    }

    fn record_transition(&mut self, image: &VulkanImage, from: ImageLayout, to: ImageLayout) {
        self.assert_recording();
        self.barrier(image.handle(), from, to);
    }

    fn close(&mut self) -> Result<()> {
        self.assert_recording();
        unsafe { self.shared.device.end_command_buffer(self.command_buffer) }.map_err(vk_error)?;
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
        let command_buffer_info = vk::CommandBufferSubmitInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_SUBMIT_INFO,
            p_next: ptr::null(),
            command_buffer: self.command_buffer,
            device_mask: 0,
            _marker: Default::default(),
        };
        self.submit(&vk::SubmitInfo2 {
            s_type: vk::StructureType::SUBMIT_INFO_2,
            p_next: ptr::null(),
            flags: vk::SubmitFlags::empty(),
            wait_semaphore_info_count: 0,
            p_wait_semaphore_infos: ptr::null(),
            command_buffer_info_count: 1,
            p_command_buffer_infos: &command_buffer_info,
            signal_semaphore_info_count: 0,
            p_signal_semaphore_infos: ptr::null(),
            _marker: Default::default(),
        })?;
        self.state = RecordingState::Initial;
        Ok(())
    }

    fn signal(&mut self, counter: &VulkanTimelineCounter, value: u64) -> Result<()> {
        let signal_info = vk::SemaphoreSubmitInfo {
            s_type: vk::StructureType::SEMAPHORE_SUBMIT_INFO,
            p_next: ptr::null(),
            semaphore: counter.handle(),
            value,
            stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
            device_index: 0,
            _marker: Default::default(),
        };
        self.submit(&vk::SubmitInfo2 {
            s_type: vk::StructureType::SUBMIT_INFO_2,
            p_next: ptr::null(),
            flags: vk::SubmitFlags::empty(),
            wait_semaphore_info_count: 0,
            p_wait_semaphore_infos: ptr::null(),
            command_buffer_info_count: 0,
            p_command_buffer_infos: ptr::null(),
            signal_semaphore_info_count: 1,
            p_signal_semaphore_infos: &signal_info,
            _marker: Default::default(),
        })
    }

    fn wait_idle(&mut self) -> Result<()> {
        let _guard = self.shared.submit_lock();
        unsafe { self.shared.device.queue_wait_idle(self.queue.queue) }.map_err(vk_error)
    }
}

impl Drop for VulkanCommandStream {
    fn drop(&mut self) {
        #[cfg(feature = "log-lifetimes")]
        tracing::trace!("Destroying VkCommandPool {:p}", self.pool);
        unsafe {
            self.shared.device.destroy_command_pool(self.pool, None);
        }
    }
}
