// Shader module loading
//
// Vulkan consumes SPIR-V; callers pass the raw bytes produced by glslc.

use anyhow::{Context, Result};
use ash::vk;
use std::io::Cursor;

use super::VulkanDevice;

/// Create a shader module from SPIR-V bytes
pub fn create_shader_module(device: &VulkanDevice, code: &[u8]) -> Result<vk::ShaderModule> {
    // read_spv checks the magic number and copies into aligned u32 words
    let words = ash::util::read_spv(&mut Cursor::new(code)).context("Malformed SPIR-V")?;

    let create_info = vk::ShaderModuleCreateInfo::builder().code(&words);

    unsafe {
        device
            .device
            .create_shader_module(&create_info, None)
            .context("Failed to create shader module")
    }
}
