// Per-frame synchronization and recording resources
//
// One `FrameSync` per frame in flight: semaphores for acquire/present,
// a fence for CPU-GPU pacing, its own command pool and descriptor pool
// so a slot can be reset without touching work still in flight elsewhere.

use anyhow::{Context, Result};
use ash::vk;

use super::VulkanDevice;

/// Descriptor sets a frame slot can allocate between resets
const DESCRIPTOR_SETS_PER_FRAME: u32 = 256;
/// Texture descriptors a frame slot can allocate between resets
const SAMPLERS_PER_FRAME: u32 = DESCRIPTOR_SETS_PER_FRAME * 32;

pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
    pub command_pool: vk::CommandPool,
    pub command_buffer: vk::CommandBuffer,
    pub descriptor_pool: vk::DescriptorPool,
}

impl FrameSync {
    pub fn new(device: &VulkanDevice) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED); // Start signaled

        let (command_pool, command_buffer) = create_command_resources(device)?;
        let descriptor_pool = create_descriptor_pool(device, DESCRIPTOR_SETS_PER_FRAME, SAMPLERS_PER_FRAME)?;

        unsafe {
            Ok(Self {
                image_available: device.device.create_semaphore(&semaphore_info, None)?,
                render_finished: device.device.create_semaphore(&semaphore_info, None)?,
                in_flight_fence: device.device.create_fence(&fence_info, None)?,
                command_pool,
                command_buffer,
                descriptor_pool,
            })
        }
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_descriptor_pool(self.descriptor_pool, None);
            device.destroy_command_pool(self.command_pool, None);
            device.destroy_semaphore(self.image_available, None);
            device.destroy_semaphore(self.render_finished, None);
            device.destroy_fence(self.in_flight_fence, None);
        }
    }
}

/// Command pool + buffer + fence for one-shot submissions
pub struct ImmediateContext {
    pub command_pool: vk::CommandPool,
    pub command_buffer: vk::CommandBuffer,
    pub fence: vk::Fence,
    pub descriptor_pool: vk::DescriptorPool,
}

impl ImmediateContext {
    pub fn new(device: &VulkanDevice) -> Result<Self> {
        let (command_pool, command_buffer) = create_command_resources(device)?;
        let descriptor_pool = create_descriptor_pool(device, 16, 16 * 32)?;
        let fence = unsafe { device.device.create_fence(&vk::FenceCreateInfo::builder(), None) }?;
        Ok(Self {
            command_pool,
            command_buffer,
            fence,
            descriptor_pool,
        })
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_descriptor_pool(self.descriptor_pool, None);
            device.destroy_command_pool(self.command_pool, None);
            device.destroy_fence(self.fence, None);
        }
    }
}

fn create_command_resources(device: &VulkanDevice) -> Result<(vk::CommandPool, vk::CommandBuffer)> {
    let pool_info = vk::CommandPoolCreateInfo::builder()
        .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
        .queue_family_index(device.graphics_queue_family);

    let pool = unsafe { device.device.create_command_pool(&pool_info, None) }
        .context("Failed to create command pool")?;

    let alloc_info = vk::CommandBufferAllocateInfo::builder()
        .command_pool(pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);

    let buffers = unsafe { device.device.allocate_command_buffers(&alloc_info) }
        .context("Failed to allocate command buffer")?;

    Ok((pool, buffers[0]))
}

fn create_descriptor_pool(device: &VulkanDevice, max_sets: u32, samplers: u32) -> Result<vk::DescriptorPool> {
    let pool_sizes = [vk::DescriptorPoolSize {
        ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        descriptor_count: samplers,
    }];

    let pool_info = vk::DescriptorPoolCreateInfo::builder()
        .max_sets(max_sets)
        .pool_sizes(&pool_sizes);

    unsafe { device.device.create_descriptor_pool(&pool_info, None) }
        .context("Failed to create descriptor pool")
}
