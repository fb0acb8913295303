// Images, views, samplers and layout barriers

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;

use super::VulkanDevice;
use crate::backend::{Format, ImageDesc, ImageLayout};

pub fn vk_format(format: Format) -> vk::Format {
    match format {
        Format::Rgba8 => vk::Format::R8G8B8A8_UNORM,
        Format::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
        Format::Bgra8 => vk::Format::B8G8R8A8_UNORM,
        Format::Bgra8Srgb => vk::Format::B8G8R8A8_SRGB,
        Format::RedInt => vk::Format::R32_SINT,
        Format::Rgba16F => vk::Format::R16G16B16A16_SFLOAT,
        Format::Depth32F => vk::Format::D32_SFLOAT,
        Format::Depth24Stencil8 => vk::Format::D24_UNORM_S8_UINT,
    }
}

pub fn from_vk_format(format: vk::Format) -> Format {
    match format {
        vk::Format::R8G8B8A8_UNORM => Format::Rgba8,
        vk::Format::R8G8B8A8_SRGB => Format::Rgba8Srgb,
        vk::Format::B8G8R8A8_UNORM => Format::Bgra8,
        _ => Format::Bgra8Srgb,
    }
}

pub fn vk_layout(layout: ImageLayout) -> vk::ImageLayout {
    match layout {
        ImageLayout::Undefined => vk::ImageLayout::UNDEFINED,
        ImageLayout::General => vk::ImageLayout::GENERAL,
        ImageLayout::ColorAttachment => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        ImageLayout::DepthAttachment => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        ImageLayout::TransferSrc => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        ImageLayout::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        ImageLayout::ShaderReadOnly => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ImageLayout::Present => vk::ImageLayout::PRESENT_SRC_KHR,
    }
}

pub fn vk_samples(samples: u32) -> vk::SampleCountFlags {
    match samples {
        0 | 1 => vk::SampleCountFlags::TYPE_1,
        2 => vk::SampleCountFlags::TYPE_2,
        4 => vk::SampleCountFlags::TYPE_4,
        8 => vk::SampleCountFlags::TYPE_8,
        _ => vk::SampleCountFlags::TYPE_16,
    }
}

pub fn aspect_for(format: Format) -> vk::ImageAspectFlags {
    match format {
        Format::Depth32F => vk::ImageAspectFlags::DEPTH,
        Format::Depth24Stencil8 => vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// Integer formats cannot be filtered when blitting
pub fn is_integer(format: Format) -> bool {
    matches!(format, Format::RedInt)
}

pub fn create_view(
    device: &VulkanDevice,
    image: vk::Image,
    format: vk::Format,
    aspect: vk::ImageAspectFlags,
) -> Result<vk::ImageView> {
    let view_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping {
            r: vk::ComponentSwizzle::IDENTITY,
            g: vk::ComponentSwizzle::IDENTITY,
            b: vk::ComponentSwizzle::IDENTITY,
            a: vk::ComponentSwizzle::IDENTITY,
        })
        .subresource_range(subresource_range(aspect));

    unsafe { device.device.create_image_view(&view_info, None) }.context("Failed to create image view")
}

pub fn subresource_range(aspect: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: aspect,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// Device-local image with its view
pub struct GpuImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub allocation: Option<Allocation>,
    pub format: Format,
    pub extent: vk::Extent2D,
}

impl GpuImage {
    /// Colour images are attachment + sampled + storage + transfer,
    /// depth images are attachment + sampled + transfer
    pub fn new(device: &VulkanDevice, desc: &ImageDesc) -> Result<Self> {
        let usage = if desc.format.is_depth() {
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
                | vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST
        } else {
            let mut usage = vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST;
            // Storage is not allowed on multisampled images on most drivers
            if desc.samples <= 1 && !matches!(desc.format, Format::Rgba8Srgb | Format::Bgra8Srgb) {
                usage |= vk::ImageUsageFlags::STORAGE;
            }
            usage
        };
        Self::with_usage(device, &desc.label, desc.format, desc.extent.width, desc.extent.height, desc.samples, usage)
    }

    /// Sampled texture, filled later by a buffer copy
    pub fn texture(device: &VulkanDevice, name: &str, format: Format, width: u32, height: u32) -> Result<Self> {
        Self::with_usage(
            device,
            name,
            format,
            width,
            height,
            1,
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
        )
    }

    fn with_usage(
        device: &VulkanDevice,
        name: &str,
        format: Format,
        width: u32,
        height: u32,
        samples: u32,
        usage: vk::ImageUsageFlags,
    ) -> Result<Self> {
        let extent = vk::Extent2D { width, height };
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(vk_format(format))
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .samples(vk_samples(samples))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe { device.device.create_image(&image_info, None) }
            .map_err(super::map_vk_error)
            .with_context(|| format!("Failed to create image '{}'", name))?;

        let requirements = unsafe { device.device.get_image_memory_requirements(image) };

        let allocation = {
            let mut allocator = device.allocator.lock();
            let allocator = allocator.as_mut().context("GPU allocator already released")?;
            allocator.allocate(&AllocationCreateDesc {
                name,
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
        }
        .with_context(|| format!("Failed to allocate memory for image '{}'", name))?;

        unsafe {
            device
                .device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
                .context("Failed to bind image memory")?;
        }

        let view = create_view(device, image, vk_format(format), aspect_for(format))?;

        Ok(Self {
            image,
            view,
            allocation: Some(allocation),
            format,
            extent,
        })
    }

    pub fn destroy(&mut self, device: &VulkanDevice) {
        unsafe {
            device.device.destroy_image_view(self.view, None);
            device.device.destroy_image(self.image, None);
        }
        if let Some(allocation) = self.allocation.take() {
            if let Some(allocator) = device.allocator.lock().as_mut() {
                let _ = allocator.free(allocation);
            }
        }
    }
}

/// Linear, repeating sampler shared by every texture
pub fn create_sampler(device: &VulkanDevice, filter: vk::Filter) -> Result<vk::Sampler> {
    let sampler_info = vk::SamplerCreateInfo::builder()
        .mag_filter(filter)
        .min_filter(filter)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
        .address_mode_u(vk::SamplerAddressMode::REPEAT)
        .address_mode_v(vk::SamplerAddressMode::REPEAT)
        .address_mode_w(vk::SamplerAddressMode::REPEAT)
        .max_lod(vk::LOD_CLAMP_NONE);

    unsafe { device.device.create_sampler(&sampler_info, None) }.context("Failed to create sampler")
}

/// Full barrier between two layouts of one image
pub fn cmd_transition(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    aspect: vk::ImageAspectFlags,
    old: ImageLayout,
    new: ImageLayout,
) {
    let barrier = vk::ImageMemoryBarrier::builder()
        .old_layout(vk_layout(old))
        .new_layout(vk_layout(new))
        .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
        .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(subresource_range(aspect))
        .build();

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layouts_map_to_vulkan() {
        assert_eq!(vk_layout(ImageLayout::Present), vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(
            vk_layout(ImageLayout::DepthAttachment),
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        );
    }

    #[test]
    fn test_depth_stencil_aspect() {
        assert_eq!(
            aspect_for(Format::Depth24Stencil8),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(aspect_for(Format::RedInt), vk::ImageAspectFlags::COLOR);
        assert_eq!(vk_format(Format::RedInt), vk::Format::R32_SINT);
    }
}
