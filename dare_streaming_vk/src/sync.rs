use std::ptr;
use std::sync::Arc;

use ash::vk;
use dare_streaming::error::Result;
use dare_streaming::traits::TimelineCounter;
use derivative::Derivative;

use crate::device::DeviceShared;
use crate::error::{VulkanStreamingError, vk_error};

/// Timeline semaphore observed from the host
#[derive(Derivative)]
#[derivative(Debug)]
pub struct VulkanTimelineCounter {
    handle: vk::Semaphore,
    #[derivative(Debug = "ignore")]
    shared: Arc<DeviceShared>,
}

impl VulkanTimelineCounter {
    pub(crate) fn new(
        shared: Arc<DeviceShared>,
        initial_value: u64,
    ) -> Result<Self, VulkanStreamingError> {
        let type_ci = vk::SemaphoreTypeCreateInfo {
            s_type: vk::StructureType::SEMAPHORE_TYPE_CREATE_INFO,
            p_next: ptr::null(),
            semaphore_type: vk::SemaphoreType::TIMELINE,
            initial_value,
            _marker: Default::default(),
        };
        let handle = unsafe {
            shared.device.create_semaphore(
                &vk::SemaphoreCreateInfo {
                    s_type: vk::StructureType::SEMAPHORE_CREATE_INFO,
                    p_next: &type_ci as *const _ as *const std::ffi::c_void,
                    flags: vk::SemaphoreCreateFlags::empty(),
                    _marker: Default::default(),
                },
                None,
            )?
        };
        #[cfg(feature = "log-lifetimes")]
        tracing::trace!("Creating VkSemaphore {:p}", handle);
        Ok(Self { handle, shared })
    }

    pub fn handle(&self) -> vk::Semaphore {
        self.handle
    }
}

impl TimelineCounter for VulkanTimelineCounter {
    fn completed_value(&self) -> Result<u64> {
        unsafe { self.shared.device.get_semaphore_counter_value(self.handle) }.map_err(vk_error)
    }

    fn wait(&self, value: u64) -> Result<()> {
        let wait_info = vk::SemaphoreWaitInfo {
            s_type: vk::StructureType::SEMAPHORE_WAIT_INFO,
            p_next: ptr::null(),
            flags: vk::SemaphoreWaitFlags::empty(),
            semaphore_count: 1,
            p_semaphores: &self.handle,
            p_values: &value,
            _marker: Default::default(),
        };
        unsafe { self.shared.device.wait_semaphores(&wait_info, u64::MAX) }.map_err(vk_error)
    }
}

impl Drop for VulkanTimelineCounter {
    fn drop(&mut self) {
        #[cfg(feature = "log-lifetimes")]
        tracing::trace!("Destroying VkSemaphore {:p}", self.handle);
        unsafe {
            self.shared.device.destroy_semaphore(self.handle, None);
        }
    }
}
