// Host-visible buffers for vertex, index, staging and readback data
//
// Every buffer is persistently mapped through gpu-allocator, so uploads are
// plain memcpys into the mapped slice.

use anyhow::{bail, Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;

use super::VulkanDevice;
use crate::backend::BufferUsage;

pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: vk::DeviceSize,
}

impl GpuBuffer {
    /// Create a mapped buffer for the given usage
    pub fn new(device: &VulkanDevice, name: &str, size: vk::DeviceSize, usage: BufferUsage) -> Result<Self> {
        let (vk_usage, location) = match usage {
            BufferUsage::Vertex => (vk::BufferUsageFlags::VERTEX_BUFFER, MemoryLocation::CpuToGpu),
            BufferUsage::Index => (vk::BufferUsageFlags::INDEX_BUFFER, MemoryLocation::CpuToGpu),
            BufferUsage::Readback => (vk::BufferUsageFlags::TRANSFER_DST, MemoryLocation::GpuToCpu),
        };
        Self::with_flags(device, name, size, vk_usage, location)
    }

    /// Staging buffer filled with `data`, source of buffer-to-image copies
    pub fn staging(device: &VulkanDevice, name: &str, data: &[u8]) -> Result<Self> {
        let mut buffer = Self::with_flags(
            device,
            name,
            data.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
        )?;
        buffer.write(0, data)?;
        Ok(buffer)
    }

    fn with_flags(
        device: &VulkanDevice,
        name: &str,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size.max(4))
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
            .with_context(|| format!("Failed to create buffer '{}'", name))?;

        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

        let allocation = {
            let mut allocator = device.allocator.lock();
            let allocator = allocator.as_mut().context("GPU allocator already released")?;
            allocator.allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
        }
        .with_context(|| format!("Failed to allocate memory for buffer '{}'", name))?;

        unsafe {
            device
                .device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
                .context("Failed to bind buffer memory")?;
        }

        Ok(Self {
            buffer,
            allocation: Some(allocation),
            size,
        })
    }

    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let size = self.size;
        let mapped = self
            .allocation
            .as_mut()
            .and_then(|a| a.mapped_slice_mut())
            .context("Buffer is not host visible")?;
        let start = offset as usize;
        let end = start + data.len();
        if end as u64 > size {
            bail!("Write of {} bytes at {} overflows buffer of {}", data.len(), offset, size);
        }
        mapped[start..end].copy_from_slice(data);
        Ok(())
    }

    pub fn read(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        let mapped = self
            .allocation
            .as_ref()
            .and_then(|a| a.mapped_slice())
            .context("Buffer is not host visible")?;
        let start = offset as usize;
        let end = start + out.len();
        if end as u64 > self.size {
            bail!("Read of {} bytes at {} overflows buffer of {}", out.len(), offset, self.size);
        }
        out.copy_from_slice(&mapped[start..end]);
        Ok(())
    }

    pub fn destroy(&mut self, device: &VulkanDevice) {
        unsafe { device.device.destroy_buffer(self.buffer, None) };
        if let Some(allocation) = self.allocation.take() {
            if let Some(allocator) = device.allocator.lock().as_mut() {
                let _ = allocator.free(allocation);
            }
        }
    }
}
