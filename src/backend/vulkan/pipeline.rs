// Graphics pipeline creation
//
// Pipelines target dynamic rendering (no render pass objects). Viewport,
// scissor and line width are dynamic; the camera arrives as push
// constants and textures as a sampler array at set 0, binding 0.

use anyhow::{Context, Result};
use ash::vk;

use super::image::{vk_format, vk_samples};
use super::shader::create_shader_module;
use super::VulkanDevice;
use crate::backend::{BlendMode, CullMode, PipelineDesc, Topology, VertexFormat, VertexLayout};

pub struct GpuPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub set_layout: Option<vk::DescriptorSetLayout>,
    pub texture_slots: u32,
    pub push_stages: vk::ShaderStageFlags,
}

impl GpuPipeline {
    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.layout, None);
            if let Some(set_layout) = self.set_layout {
                device.destroy_descriptor_set_layout(set_layout, None);
            }
        }
    }
}

fn vk_vertex_format(format: VertexFormat) -> vk::Format {
    match format {
        VertexFormat::Float => vk::Format::R32_SFLOAT,
        VertexFormat::Float2 => vk::Format::R32G32_SFLOAT,
        VertexFormat::Float3 => vk::Format::R32G32B32_SFLOAT,
        VertexFormat::Float4 => vk::Format::R32G32B32A32_SFLOAT,
        VertexFormat::Int => vk::Format::R32_SINT,
    }
}

/// Vertex input description for one interleaved binding
pub fn vertex_input_info(
    layout: &VertexLayout,
) -> (
    Vec<vk::VertexInputBindingDescription>,
    Vec<vk::VertexInputAttributeDescription>,
) {
    let binding = vk::VertexInputBindingDescription::builder()
        .binding(0)
        .stride(layout.stride)
        .input_rate(vk::VertexInputRate::VERTEX)
        .build();

    let attributes = layout
        .attributes
        .iter()
        .map(|attr| {
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(attr.location)
                .format(vk_vertex_format(attr.format))
                .offset(attr.offset)
                .build()
        })
        .collect();

    (vec![binding], attributes)
}

pub fn create_graphics_pipeline(device: &VulkanDevice, desc: &PipelineDesc) -> Result<GpuPipeline> {
    let vert_shader = create_shader_module(device, &desc.vertex_spirv)
        .with_context(|| format!("Invalid vertex shader for '{}'", desc.label))?;
    let frag_shader = match create_shader_module(device, &desc.fragment_spirv) {
        Ok(module) => module,
        Err(e) => {
            unsafe { device.device.destroy_shader_module(vert_shader, None) };
            return Err(e.context(format!("Invalid fragment shader for '{}'", desc.label)));
        }
    };

    let result = build_pipeline(device, desc, vert_shader, frag_shader);

    // Modules are baked into the pipeline and no longer needed
    unsafe {
        device.device.destroy_shader_module(vert_shader, None);
        device.device.destroy_shader_module(frag_shader, None);
    }

    result
}

fn build_pipeline(
    device: &VulkanDevice,
    desc: &PipelineDesc,
    vert_shader: vk::ShaderModule,
    frag_shader: vk::ShaderModule,
) -> Result<GpuPipeline> {
    let entry_point = c"main";

    // Texture array length is specialization constant 0 of the fragment stage
    let spec_data = desc.texture_slots.max(1).to_ne_bytes();
    let spec_entries = [vk::SpecializationMapEntry {
        constant_id: 0,
        offset: 0,
        size: std::mem::size_of::<u32>(),
    }];
    let spec_info = vk::SpecializationInfo::builder()
        .map_entries(&spec_entries)
        .data(&spec_data);

    let vert_stage = vk::PipelineShaderStageCreateInfo::builder()
        .stage(vk::ShaderStageFlags::VERTEX)
        .module(vert_shader)
        .name(entry_point)
        .build();

    let mut frag_stage = vk::PipelineShaderStageCreateInfo::builder()
        .stage(vk::ShaderStageFlags::FRAGMENT)
        .module(frag_shader)
        .name(entry_point);
    if desc.texture_slots > 0 {
        frag_stage = frag_stage.specialization_info(&spec_info);
    }
    let shader_stages = [vert_stage, frag_stage.build()];

    // Vertex input
    let (bindings, attributes) = vertex_input_info(&desc.vertex_layout);
    let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&attributes);

    // Input assembly
    let topology = match desc.topology {
        Topology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
        Topology::LineList => vk::PrimitiveTopology::LINE_LIST,
    };
    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(topology)
        .primitive_restart_enable(false);

    // Viewport and scissor are set per rendering scope
    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewport_count(1)
        .scissor_count(1);

    let dynamic_states = [
        vk::DynamicState::VIEWPORT,
        vk::DynamicState::SCISSOR,
        vk::DynamicState::LINE_WIDTH,
    ];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

    // Rasterization
    let cull_mode = match desc.cull_mode {
        CullMode::None => vk::CullModeFlags::NONE,
        CullMode::Back => vk::CullModeFlags::BACK,
        CullMode::Front => vk::CullModeFlags::FRONT,
    };
    let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0)
        .cull_mode(cull_mode)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .depth_bias_enable(false);

    let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
        .sample_shading_enable(false)
        .rasterization_samples(vk_samples(desc.samples));

    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(desc.depth_test)
        .depth_write_enable(desc.depth_write)
        .depth_compare_op(vk::CompareOp::LESS_OR_EQUAL)
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false);

    // Alpha blending on the first colour target only; integer targets
    // (entity ids) cannot blend
    let color_blend_attachments: Vec<_> = desc
        .color_formats
        .iter()
        .enumerate()
        .map(|(i, format)| {
            let blend = i == 0
                && desc.blend == BlendMode::Alpha
                && !super::image::is_integer(*format);
            vk::PipelineColorBlendAttachmentState::builder()
                .color_write_mask(vk::ColorComponentFlags::RGBA)
                .blend_enable(blend)
                .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
                .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                .color_blend_op(vk::BlendOp::ADD)
                .src_alpha_blend_factor(vk::BlendFactor::ONE)
                .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                .alpha_blend_op(vk::BlendOp::ADD)
                .build()
        })
        .collect();

    let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
        .logic_op_enable(false)
        .attachments(&color_blend_attachments);

    // Descriptor set layout for the texture array
    let set_layout = if desc.texture_slots > 0 {
        let binding = vk::DescriptorSetLayoutBinding::builder()
            .binding(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(desc.texture_slots)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)
            .build();
        let layout_info =
            vk::DescriptorSetLayoutCreateInfo::builder().bindings(std::slice::from_ref(&binding));
        Some(
            unsafe { device.device.create_descriptor_set_layout(&layout_info, None) }
                .context("Failed to create descriptor set layout")?,
        )
    } else {
        None
    };

    let push_stages = vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT;
    let push_constant_ranges: Vec<_> = if desc.push_constant_size > 0 {
        vec![vk::PushConstantRange::builder()
            .stage_flags(push_stages)
            .offset(0)
            .size(desc.push_constant_size)
            .build()]
    } else {
        vec![]
    };

    let set_layouts: Vec<_> = set_layout.into_iter().collect();
    let layout_info = vk::PipelineLayoutCreateInfo::builder()
        .set_layouts(&set_layouts)
        .push_constant_ranges(&push_constant_ranges);

    let pipeline_layout = unsafe { device.device.create_pipeline_layout(&layout_info, None) }
        .context("Failed to create pipeline layout")?;

    // Dynamic rendering formats
    let color_formats: Vec<_> = desc.color_formats.iter().map(|f| vk_format(*f)).collect();
    let mut rendering_info = vk::PipelineRenderingCreateInfo::builder()
        .color_attachment_formats(&color_formats)
        .depth_attachment_format(desc.depth_format.map_or(vk::Format::UNDEFINED, vk_format));

    let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&shader_stages)
        .vertex_input_state(&vertex_input_info)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterizer)
        .multisample_state(&multisampling)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blending)
        .dynamic_state(&dynamic_state)
        .layout(pipeline_layout)
        .push_next(&mut rendering_info)
        .build();

    let pipelines = unsafe {
        device
            .device
            .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
            .map_err(|(_, e)| e)
            .with_context(|| format!("Failed to create graphics pipeline '{}'", desc.label))
    };

    let pipelines = match pipelines {
        Ok(pipelines) => pipelines,
        Err(e) => {
            unsafe {
                device.device.destroy_pipeline_layout(pipeline_layout, None);
                if let Some(set_layout) = set_layout {
                    device.device.destroy_descriptor_set_layout(set_layout, None);
                }
            }
            return Err(e);
        }
    };

    log::debug!("Created pipeline '{}'", desc.label);

    Ok(GpuPipeline {
        pipeline: pipelines[0],
        layout: pipeline_layout,
        set_layout,
        texture_slots: desc.texture_slots,
        push_stages,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::VertexAttribute;

    #[test]
    fn test_vertex_layout_translates_every_attribute() {
        let layout = VertexLayout {
            stride: 32,
            attributes: vec![
                VertexAttribute { location: 0, format: VertexFormat::Float3, offset: 0 },
                VertexAttribute { location: 1, format: VertexFormat::Float4, offset: 12 },
                VertexAttribute { location: 2, format: VertexFormat::Int, offset: 28 },
            ],
        };

        let (bindings, attributes) = vertex_input_info(&layout);
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].stride, 32);
        assert_eq!(attributes.len(), 3);
        assert_eq!(attributes[2].format, vk::Format::R32_SINT);
        assert_eq!(attributes[1].offset, 12);
    }
}
