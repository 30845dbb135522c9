// Synchronization primitives
//
// Two semaphores order a frame on the graphics queue:
// acquire --image_acquired--> submit --image_rendered--> present

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;
use super::VulkanDevice;

pub struct FrameSync {
    /// Signalled by the presentation engine when the acquired image is free
    pub image_acquired: vk::Semaphore,
    /// Signalled by the queue once the frame's commands finished
    pub image_rendered: vk::Semaphore,
    device: Arc<VulkanDevice>,
}

impl FrameSync {
    pub fn new(device: Arc<VulkanDevice>) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();

        unsafe {
            let image_acquired = device
                .device
                .create_semaphore(&semaphore_info, None)
                .context("Failed to create image-acquired semaphore")?;
            let image_rendered = match device.device.create_semaphore(&semaphore_info, None) {
                Ok(semaphore) => semaphore,
                Err(e) => {
                    device.device.destroy_semaphore(image_acquired, None);
                    return Err(e).context("Failed to create image-rendered semaphore");
                }
            };

            Ok(Self {
                image_acquired,
                image_rendered,
                device,
            })
        }
    }
}

impl Drop for FrameSync {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_semaphore(self.image_rendered, None);
            self.device.device.destroy_semaphore(self.image_acquired, None);
        }
    }
}
