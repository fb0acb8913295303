// Vulkan backend
//
// Maps the `Backend` contract onto ash: one graphics queue, a swapchain,
// `frames_in_flight` recording slots and a one-shot immediate context.
// Resources live in handle tables owned by `VulkanBackend`.

pub mod buffer;
pub mod device;
pub mod image;
pub mod pipeline;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use ash::vk;
use ash::vk::Handle;

pub use device::VulkanDevice;
pub use swapchain::Swapchain;

use self::buffer::GpuBuffer;
use self::image::{aspect_for, cmd_transition, from_vk_format, is_integer, subresource_range, GpuImage};
use self::pipeline::GpuPipeline;
use self::sync::{FrameSync, ImmediateContext};
use super::{
    AcquireOutcome, Backend, BackendFactory, BackendKind, BufferDesc, BufferHandle, CmdTarget,
    DeviceCapabilities, DeviceSettings, Extent2D, Format, FrameAcquire, ImageDesc, ImageHandle,
    ImageLayout, NativeCommandBuffer, PipelineDesc, PipelineHandle, PresentMode, PresentOutcome,
    SurfaceWindow, TextureDesc, TextureHandle, UiTextureId,
};
use crate::backend::types::next_handle_id;
use crate::command::{Command, RenderingInfo};
use crate::error::DeviceError;

/// Turn a raw Vulkan error into an anyhow error, surfacing device loss as
/// `DeviceError::DeviceLost`
pub fn map_vk_error(result: vk::Result) -> anyhow::Error {
    match result {
        vk::Result::ERROR_DEVICE_LOST => DeviceError::DeviceLost.into(),
        other => anyhow::anyhow!("Vulkan error: {:?}", other),
    }
}

pub struct VulkanFactory;

impl BackendFactory for VulkanFactory {
    fn kind(&self) -> BackendKind {
        BackendKind::Vulkan
    }

    fn create(
        &self,
        window: &dyn SurfaceWindow,
        extent: Extent2D,
        settings: &DeviceSettings,
    ) -> Result<Box<dyn Backend>> {
        let handles = window.raw_handles().map_err(|e| DeviceError::Creation(e.to_string()))?;
        Ok(Box::new(VulkanBackend::new(handles, extent, settings)?))
    }
}

enum ImageEntry {
    Owned(GpuImage),
    Swapchain {
        image: vk::Image,
        view: vk::ImageView,
        format: Format,
        extent: vk::Extent2D,
    },
}

impl ImageEntry {
    fn raw(&self) -> (vk::Image, vk::ImageView, Format, vk::Extent2D) {
        match self {
            ImageEntry::Owned(img) => (img.image, img.view, img.format, img.extent),
            ImageEntry::Swapchain { image, view, format, extent } => (*image, *view, *format, *extent),
        }
    }
}

pub struct VulkanBackend {
    device: Arc<VulkanDevice>,
    swapchain: Option<Swapchain>,
    frames: Vec<FrameSync>,
    immediate: ImmediateContext,
    immediate_open: bool,
    caps: DeviceCapabilities,
    present_mode: PresentMode,
    sampler: vk::Sampler,

    images: HashMap<ImageHandle, ImageEntry>,
    swapchain_handles: Vec<ImageHandle>,
    buffers: HashMap<BufferHandle, GpuBuffer>,
    textures: HashMap<TextureHandle, GpuImage>,
    pipelines: HashMap<PipelineHandle, GpuPipeline>,
    ui_textures: HashMap<UiTextureId, ImageHandle>,
}

impl VulkanBackend {
    pub fn new(
        handles: (raw_window_handle::RawDisplayHandle, raw_window_handle::RawWindowHandle),
        extent: Extent2D,
        settings: &DeviceSettings,
    ) -> Result<Self> {
        let device = VulkanDevice::new(&settings.app_name, settings.enable_validation, handles)?;

        let swapchain = Swapchain::new(
            Arc::clone(&device),
            extent.width,
            extent.height,
            settings.present_mode,
            vk::SwapchainKHR::null(),
        )?;

        let frames = (0..settings.frames_in_flight.max(1))
            .map(|_| FrameSync::new(&device))
            .collect::<Result<Vec<_>>>()?;
        let immediate = ImmediateContext::new(&device)?;
        let sampler = image::create_sampler(&device, vk::Filter::LINEAR)?;
        let caps = Self::query_capabilities(&device);

        log::info!(
            "Vulkan backend ready: {} frames in flight, {} texture slots, {}x MSAA max",
            frames.len(),
            caps.max_texture_slots,
            caps.max_samples
        );

        let mut backend = Self {
            device,
            swapchain: None,
            frames,
            immediate,
            immediate_open: false,
            caps,
            present_mode: settings.present_mode,
            sampler,
            images: HashMap::new(),
            swapchain_handles: Vec::new(),
            buffers: HashMap::new(),
            textures: HashMap::new(),
            pipelines: HashMap::new(),
            ui_textures: HashMap::new(),
        };
        backend.install_swapchain(swapchain);
        Ok(backend)
    }

    fn query_capabilities(device: &VulkanDevice) -> DeviceCapabilities {
        let limits = &device.properties.limits;
        let slots = limits
            .max_per_stage_descriptor_samplers
            .min(limits.max_per_stage_descriptor_sampled_images)
            .min(32);
        let counts = limits.framebuffer_color_sample_counts & limits.framebuffer_depth_sample_counts;
        let max_samples = [64, 32, 16, 8, 4, 2]
            .into_iter()
            .find(|&n| counts.contains(vk::SampleCountFlags::from_raw(n)))
            .unwrap_or(1);

        DeviceCapabilities {
            device_name: device.device_name(),
            max_texture_slots: slots,
            max_samples,
            max_image_dimension: limits.max_image_dimension2_d,
        }
    }

    fn install_swapchain(&mut self, swapchain: Swapchain) {
        for handle in self.swapchain_handles.drain(..) {
            self.images.remove(&handle);
        }
        let format = from_vk_format(swapchain.format);
        for (&image, &view) in swapchain.images.iter().zip(&swapchain.image_views) {
            let handle = ImageHandle(next_handle_id());
            self.images.insert(
                handle,
                ImageEntry::Swapchain {
                    image,
                    view,
                    format,
                    extent: swapchain.extent,
                },
            );
            self.swapchain_handles.push(handle);
        }
        self.swapchain = Some(swapchain);
    }

    fn frame(&self, slot: usize) -> Result<&FrameSync> {
        self.frames
            .get(slot)
            .with_context(|| format!("Frame slot {} out of range ({} slots)", slot, self.frames.len()))
    }

    fn image(&self, handle: ImageHandle) -> Result<(vk::Image, vk::ImageView, Format, vk::Extent2D)> {
        self.images
            .get(&handle)
            .map(ImageEntry::raw)
            .with_context(|| format!("Unknown image {:?}", handle))
    }

    fn target(&self, target: CmdTarget) -> Result<(vk::CommandBuffer, vk::DescriptorPool)> {
        match target {
            CmdTarget::Frame(slot) => {
                let frame = self.frame(slot)?;
                Ok((frame.command_buffer, frame.descriptor_pool))
            }
            CmdTarget::Immediate => {
                if !self.immediate_open {
                    bail!("Immediate command buffer is not open");
                }
                Ok((self.immediate.command_buffer, self.immediate.descriptor_pool))
            }
        }
    }

    fn begin_rendering(&self, cmd: vk::CommandBuffer, info: &RenderingInfo) -> Result<()> {
        let extent = vk::Extent2D {
            width: info.extent.width,
            height: info.extent.height,
        };

        let colors = info
            .colors
            .iter()
            .map(|target| {
                let (_, view, format, _) = self.image(target.image)?;
                let clear = target.clear.unwrap_or([0.0; 4]);
                let color = if is_integer(format) {
                    vk::ClearColorValue {
                        int32: clear.map(|c| c as i32),
                    }
                } else {
                    vk::ClearColorValue { float32: clear }
                };
                Ok(vk::RenderingAttachmentInfo::builder()
                    .image_view(view)
                    .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .load_op(if target.clear.is_some() {
                        vk::AttachmentLoadOp::CLEAR
                    } else {
                        vk::AttachmentLoadOp::LOAD
                    })
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .clear_value(vk::ClearValue { color })
                    .build())
            })
            .collect::<Result<Vec<_>>>()?;

        let depth = match &info.depth {
            Some(target) => {
                let (_, view, _, _) = self.image(target.image)?;
                Some(
                    vk::RenderingAttachmentInfo::builder()
                        .image_view(view)
                        .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                        .load_op(if target.clear.is_some() {
                            vk::AttachmentLoadOp::CLEAR
                        } else {
                            vk::AttachmentLoadOp::LOAD
                        })
                        .store_op(vk::AttachmentStoreOp::STORE)
                        .clear_value(vk::ClearValue {
                            depth_stencil: vk::ClearDepthStencilValue {
                                depth: target.clear.unwrap_or(1.0),
                                stencil: 0,
                            },
                        })
                        .build(),
                )
            }
            None => None,
        };

        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
        let mut rendering_info = vk::RenderingInfo::builder()
            .render_area(render_area)
            .layer_count(1)
            .color_attachments(&colors);
        if let Some(depth) = depth.as_ref() {
            rendering_info = rendering_info.depth_attachment(depth);
        }

        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };

        unsafe {
            let device = &self.device.device;
            device.cmd_begin_rendering(cmd, &rendering_info);
            device.cmd_set_viewport(cmd, 0, &[viewport]);
            device.cmd_set_scissor(cmd, 0, &[render_area]);
            device.cmd_set_line_width(cmd, 1.0);
        }
        Ok(())
    }

    fn bind_textures(
        &self,
        cmd: vk::CommandBuffer,
        pool: vk::DescriptorPool,
        pipeline: PipelineHandle,
        textures: &[TextureHandle],
    ) -> Result<()> {
        let gpu = self
            .pipelines
            .get(&pipeline)
            .with_context(|| format!("Unknown pipeline {:?}", pipeline))?;
        let set_layout = gpu
            .set_layout
            .context("Pipeline has no texture bindings")?;
        let first = textures.first().context("Texture binding with no textures")?;

        // Unused array elements repeat slot 0 so every descriptor is valid
        let image_infos = (0..gpu.texture_slots as usize)
            .map(|i| {
                let handle = textures.get(i).unwrap_or(first);
                let texture = self
                    .textures
                    .get(handle)
                    .with_context(|| format!("Unknown texture {:?}", handle))?;
                Ok(vk::DescriptorImageInfo {
                    sampler: self.sampler,
                    image_view: texture.view,
                    image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(std::slice::from_ref(&set_layout));
        let set = unsafe { self.device.device.allocate_descriptor_sets(&alloc_info) }
            .context("Descriptor pool exhausted")?[0];

        let write = vk::WriteDescriptorSet::builder()
            .dst_set(set)
            .dst_binding(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(&image_infos)
            .build();

        unsafe {
            self.device.device.update_descriptor_sets(&[write], &[]);
            self.device.device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                gpu.layout,
                0,
                &[set],
                &[],
            );
        }
        Ok(())
    }

    fn record(&self, target: CmdTarget, command: &Command) -> Result<()> {
        let (cmd, pool) = self.target(target)?;
        let device = &self.device.device;

        match command {
            Command::TransitionImage { image, old, new } => {
                let (raw, _, format, _) = self.image(*image)?;
                cmd_transition(device, cmd, raw, aspect_for(format), *old, *new);
            }
            Command::ClearColor { image, color } => {
                let (raw, _, format, _) = self.image(*image)?;
                let value = if is_integer(format) {
                    vk::ClearColorValue {
                        int32: color.map(|c| c as i32),
                    }
                } else {
                    vk::ClearColorValue { float32: *color }
                };
                unsafe {
                    device.cmd_clear_color_image(
                        cmd,
                        raw,
                        vk::ImageLayout::GENERAL,
                        &value,
                        &[subresource_range(vk::ImageAspectFlags::COLOR)],
                    );
                }
            }
            Command::BeginRendering(info) => self.begin_rendering(cmd, info)?,
            Command::EndRendering => unsafe { device.cmd_end_rendering(cmd) },
            Command::BindPipeline(handle) => {
                let gpu = self
                    .pipelines
                    .get(handle)
                    .with_context(|| format!("Unknown pipeline {:?}", handle))?;
                unsafe { device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, gpu.pipeline) };
            }
            Command::BindVertexBuffer { buffer, offset } => {
                let gpu = self
                    .buffers
                    .get(buffer)
                    .with_context(|| format!("Unknown buffer {:?}", buffer))?;
                unsafe { device.cmd_bind_vertex_buffers(cmd, 0, &[gpu.buffer], &[*offset]) };
            }
            Command::BindIndexBuffer { buffer, offset } => {
                let gpu = self
                    .buffers
                    .get(buffer)
                    .with_context(|| format!("Unknown buffer {:?}", buffer))?;
                unsafe { device.cmd_bind_index_buffer(cmd, gpu.buffer, *offset, vk::IndexType::UINT32) };
            }
            Command::BindTextures { pipeline, textures } => {
                self.bind_textures(cmd, pool, *pipeline, textures)?
            }
            Command::PushConstants { pipeline, data } => {
                let gpu = self
                    .pipelines
                    .get(pipeline)
                    .with_context(|| format!("Unknown pipeline {:?}", pipeline))?;
                unsafe { device.cmd_push_constants(cmd, gpu.layout, gpu.push_stages, 0, data) };
            }
            Command::SetScissor { x, y, extent } => {
                let scissor = vk::Rect2D {
                    offset: vk::Offset2D { x: *x, y: *y },
                    extent: vk::Extent2D {
                        width: extent.width,
                        height: extent.height,
                    },
                };
                unsafe { device.cmd_set_scissor(cmd, 0, &[scissor]) };
            }
            Command::SetLineWidth(width) => {
                let width = if self.device.wide_lines { *width } else { 1.0 };
                unsafe { device.cmd_set_line_width(cmd, width) };
            }
            Command::Draw {
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            } => unsafe {
                device.cmd_draw(cmd, *vertex_count, *instance_count, *first_vertex, *first_instance)
            },
            Command::DrawIndexed {
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            } => unsafe {
                device.cmd_draw_indexed(
                    cmd,
                    *index_count,
                    *instance_count,
                    *first_index,
                    *vertex_offset,
                    *first_instance,
                )
            },
            Command::CopyImage {
                src,
                src_extent,
                dst,
                dst_extent,
            } => {
                let (src_raw, _, src_format, _) = self.image(*src)?;
                let (dst_raw, _, _, _) = self.image(*dst)?;
                let layers = vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                };
                let corner = |e: Extent2D| vk::Offset3D {
                    x: e.width as i32,
                    y: e.height as i32,
                    z: 1,
                };
                let region = vk::ImageBlit::builder()
                    .src_subresource(layers)
                    .src_offsets([vk::Offset3D::default(), corner(*src_extent)])
                    .dst_subresource(layers)
                    .dst_offsets([vk::Offset3D::default(), corner(*dst_extent)])
                    .build();
                let filter = if is_integer(src_format) {
                    vk::Filter::NEAREST
                } else {
                    vk::Filter::LINEAR
                };
                unsafe {
                    device.cmd_blit_image(
                        cmd,
                        src_raw,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        dst_raw,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                        filter,
                    );
                }
            }
            Command::ResolveImage { src, dst, extent } => {
                let (src_raw, _, _, _) = self.image(*src)?;
                let (dst_raw, _, _, _) = self.image(*dst)?;
                let layers = vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                };
                let region = vk::ImageResolve::builder()
                    .src_subresource(layers)
                    .dst_subresource(layers)
                    .extent(vk::Extent3D {
                        width: extent.width,
                        height: extent.height,
                        depth: 1,
                    })
                    .build();
                unsafe {
                    device.cmd_resolve_image(
                        cmd,
                        src_raw,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        dst_raw,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                    );
                }
            }
            Command::CopyPixelToBuffer { image, buffer, x, y } => {
                let (raw, _, format, _) = self.image(*image)?;
                let gpu = self
                    .buffers
                    .get(buffer)
                    .with_context(|| format!("Unknown buffer {:?}", buffer))?;
                let region = vk::BufferImageCopy::builder()
                    .buffer_offset(0)
                    .image_subresource(vk::ImageSubresourceLayers {
                        aspect_mask: if format.is_depth() {
                            vk::ImageAspectFlags::DEPTH
                        } else {
                            vk::ImageAspectFlags::COLOR
                        },
                        mip_level: 0,
                        base_array_layer: 0,
                        layer_count: 1,
                    })
                    .image_offset(vk::Offset3D {
                        x: *x as i32,
                        y: *y as i32,
                        z: 0,
                    })
                    .image_extent(vk::Extent3D {
                        width: 1,
                        height: 1,
                        depth: 1,
                    })
                    .build();
                unsafe {
                    device.cmd_copy_image_to_buffer(
                        cmd,
                        raw,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        gpu.buffer,
                        &[region],
                    );
                }
            }
            Command::RenderUi(recorder) => recorder.record(NativeCommandBuffer(cmd.as_raw())),
        }
        Ok(())
    }

    /// Upload pixels into a fresh texture through the immediate context
    fn upload_texture(&mut self, texture: &GpuImage, pixels: &[u8], label: &str) -> Result<()> {
        let mut staging = GpuBuffer::staging(&self.device, &format!("{} staging", label), pixels)?;
        let result = (|| {
            self.begin_immediate()?;
            let cmd = self.immediate.command_buffer;
            let device = &self.device.device;
            cmd_transition(
                device,
                cmd,
                texture.image,
                vk::ImageAspectFlags::COLOR,
                ImageLayout::Undefined,
                ImageLayout::TransferDst,
            );
            let region = vk::BufferImageCopy::builder()
                .image_subresource(vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                })
                .image_extent(vk::Extent3D {
                    width: texture.extent.width,
                    height: texture.extent.height,
                    depth: 1,
                })
                .build();
            unsafe {
                device.cmd_copy_buffer_to_image(
                    cmd,
                    staging.buffer,
                    texture.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
            }
            cmd_transition(
                device,
                cmd,
                texture.image,
                vk::ImageAspectFlags::COLOR,
                ImageLayout::TransferDst,
                ImageLayout::ShaderReadOnly,
            );
            self.submit_immediate()
        })();
        staging.destroy(&self.device);
        result
    }
}

impl Backend for VulkanBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Vulkan
    }

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.caps
    }

    fn surface_extent(&self) -> Extent2D {
        self.swapchain
            .as_ref()
            .map(|s| Extent2D::new(s.extent.width, s.extent.height))
            .unwrap_or_default()
    }

    fn wait_frame(&mut self, slot: usize) -> Result<()> {
        let fence = self.frame(slot)?.in_flight_fence;
        unsafe { self.device.device.wait_for_fences(&[fence], true, u64::MAX) }
            .map_err(map_vk_error)
            .context("Failed to wait for frame fence")
    }

    fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome> {
        let semaphore = self.frame(slot)?.image_available;
        let swapchain = self.swapchain.as_ref().context("No swapchain")?;
        let Some(index) = swapchain.acquire_next_image(u64::MAX, semaphore)? else {
            return Ok(AcquireOutcome::OutOfDate);
        };
        let image = *self
            .swapchain_handles
            .get(index as usize)
            .context("Swapchain returned an unknown image index")?;
        Ok(AcquireOutcome::Acquired(FrameAcquire {
            image,
            image_index: index,
            format: from_vk_format(swapchain.format),
            extent: Extent2D::new(swapchain.extent.width, swapchain.extent.height),
        }))
    }

    fn begin_commands(&mut self, slot: usize) -> Result<()> {
        let frame = self.frame(slot)?;
        let device = &self.device.device;
        let begin_info =
            vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            device
                .reset_command_buffer(frame.command_buffer, vk::CommandBufferResetFlags::empty())
                .map_err(map_vk_error)?;
            device
                .reset_descriptor_pool(frame.descriptor_pool, vk::DescriptorPoolResetFlags::empty())
                .map_err(map_vk_error)?;
            device
                .begin_command_buffer(frame.command_buffer, &begin_info)
                .map_err(map_vk_error)
                .context("Failed to begin command buffer")?;
        }
        Ok(())
    }

    fn end_commands(&mut self, slot: usize) -> Result<()> {
        let cmd = self.frame(slot)?.command_buffer;
        unsafe { self.device.device.end_command_buffer(cmd) }
            .map_err(map_vk_error)
            .context("Failed to end command buffer")
    }

    fn submit(&mut self, slot: usize, present: Option<u32>) -> Result<PresentOutcome> {
        let frame = self.frame(slot)?;
        let device = &self.device.device;
        let command_buffers = [frame.command_buffer];
        let wait_semaphores = [frame.image_available];
        let signal_semaphores = [frame.render_finished];
        let wait_stages =
            [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::TRANSFER];

        // Reset only right before the submit that signals it again
        unsafe { device.reset_fences(&[frame.in_flight_fence]) }.map_err(map_vk_error)?;

        let Some(image_index) = present else {
            // Intermediate pass: submit and block until done
            let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
            unsafe {
                device
                    .queue_submit(self.device.graphics_queue, &[submit_info.build()], frame.in_flight_fence)
                    .map_err(map_vk_error)
                    .context("Failed to submit command buffer")?;
                device
                    .wait_for_fences(&[frame.in_flight_fence], true, u64::MAX)
                    .map_err(map_vk_error)?;
            }
            return Ok(PresentOutcome::Submitted);
        };

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            device
                .queue_submit(self.device.graphics_queue, &[submit_info.build()], frame.in_flight_fence)
                .map_err(map_vk_error)
                .context("Failed to submit command buffer")?;
        }

        let swapchain = self.swapchain.as_ref().context("No swapchain")?;
        if swapchain.present(self.device.graphics_queue, image_index, &signal_semaphores)? {
            Ok(PresentOutcome::Presented)
        } else {
            Ok(PresentOutcome::OutOfDate)
        }
    }

    fn recreate_swapchain(&mut self, extent: Extent2D) -> Result<()> {
        self.device.wait_idle()?;
        let old = self
            .swapchain
            .as_ref()
            .map_or(vk::SwapchainKHR::null(), |s| s.swapchain);
        let swapchain = Swapchain::new(
            Arc::clone(&self.device),
            extent.width,
            extent.height,
            self.present_mode,
            old,
        )?;
        // Old swapchain is dropped once the new one is installed
        self.install_swapchain(swapchain);
        Ok(())
    }

    fn wait_idle(&mut self) -> Result<()> {
        self.device.wait_idle()
    }

    fn encode(&mut self, target: CmdTarget, command: &Command) -> Result<()> {
        self.record(target, command)
    }

    fn begin_immediate(&mut self) -> Result<()> {
        if self.immediate_open {
            bail!("Immediate submit already open");
        }
        let begin_info =
            vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device
                .device
                .reset_command_buffer(self.immediate.command_buffer, vk::CommandBufferResetFlags::empty())
                .map_err(map_vk_error)?;
            self.device
                .device
                .begin_command_buffer(self.immediate.command_buffer, &begin_info)
                .map_err(map_vk_error)?;
        }
        self.immediate_open = true;
        Ok(())
    }

    fn submit_immediate(&mut self) -> Result<()> {
        if !self.immediate_open {
            bail!("Immediate submit was never begun");
        }
        self.immediate_open = false;

        let device = &self.device.device;
        let command_buffers = [self.immediate.command_buffer];
        let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
        unsafe {
            device
                .end_command_buffer(self.immediate.command_buffer)
                .map_err(map_vk_error)?;
            device
                .queue_submit(self.device.graphics_queue, &[submit_info.build()], self.immediate.fence)
                .map_err(map_vk_error)
                .context("Failed to submit immediate commands")?;
            device
                .wait_for_fences(&[self.immediate.fence], true, u64::MAX)
                .map_err(map_vk_error)?;
            device.reset_fences(&[self.immediate.fence]).map_err(map_vk_error)?;
            device
                .reset_descriptor_pool(self.immediate.descriptor_pool, vk::DescriptorPoolResetFlags::empty())
                .map_err(map_vk_error)?;
        }
        Ok(())
    }

    fn create_image(&mut self, desc: &ImageDesc) -> Result<ImageHandle> {
        let image = GpuImage::new(&self.device, desc)?;
        let handle = ImageHandle(next_handle_id());
        self.images.insert(handle, ImageEntry::Owned(image));
        Ok(handle)
    }

    fn destroy_image(&mut self, image: ImageHandle) {
        if let Some(ImageEntry::Owned(mut gpu)) = self.images.remove(&image) {
            gpu.destroy(&self.device);
        }
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> Result<BufferHandle> {
        let buffer = GpuBuffer::new(&self.device, &desc.label, desc.size, desc.usage)?;
        let handle = BufferHandle(next_handle_id());
        self.buffers.insert(handle, buffer);
        Ok(handle)
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<()> {
        self.buffers
            .get_mut(&buffer)
            .with_context(|| format!("Unknown buffer {:?}", buffer))?
            .write(offset, data)
    }

    fn read_buffer(&mut self, buffer: BufferHandle, offset: u64, out: &mut [u8]) -> Result<()> {
        self.buffers
            .get(&buffer)
            .with_context(|| format!("Unknown buffer {:?}", buffer))?
            .read(offset, out)
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if let Some(mut gpu) = self.buffers.remove(&buffer) {
            gpu.destroy(&self.device);
        }
    }

    fn create_texture(&mut self, desc: &TextureDesc, pixels: &[u8]) -> Result<TextureHandle> {
        let expected = (desc.width * desc.height * desc.format.bytes_per_pixel()) as usize;
        if pixels.len() != expected {
            bail!(
                "Texture '{}' expects {} bytes of pixel data, got {}",
                desc.label,
                expected,
                pixels.len()
            );
        }
        let mut texture = GpuImage::texture(&self.device, &desc.label, desc.format, desc.width, desc.height)?;
        if let Err(e) = self.upload_texture(&texture, pixels, &desc.label) {
            texture.destroy(&self.device);
            return Err(e);
        }
        let handle = TextureHandle(next_handle_id());
        self.textures.insert(handle, texture);
        Ok(handle)
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        if let Some(mut gpu) = self.textures.remove(&texture) {
            gpu.destroy(&self.device);
        }
    }

    fn create_pipeline(&mut self, desc: &PipelineDesc) -> Result<PipelineHandle> {
        let pipeline = pipeline::create_graphics_pipeline(&self.device, desc)?;
        let handle = PipelineHandle(next_handle_id());
        self.pipelines.insert(handle, pipeline);
        Ok(handle)
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineHandle) {
        if let Some(gpu) = self.pipelines.remove(&pipeline) {
            gpu.destroy(&self.device.device);
        }
    }

    fn register_ui_texture(&mut self, image: ImageHandle) -> Result<UiTextureId> {
        self.image(image)?;
        let id = UiTextureId(next_handle_id());
        self.ui_textures.insert(id, image);
        Ok(id)
    }

    fn release_ui_texture(&mut self, id: UiTextureId) {
        self.ui_textures.remove(&id);
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan backend...");
        let _ = self.device.wait_idle();

        for (_, pipeline) in self.pipelines.drain() {
            pipeline.destroy(&self.device.device);
        }
        for (_, mut texture) in self.textures.drain() {
            texture.destroy(&self.device);
        }
        for (_, mut buffer) in self.buffers.drain() {
            buffer.destroy(&self.device);
        }
        for (_, entry) in self.images.drain() {
            if let ImageEntry::Owned(mut image) = entry {
                image.destroy(&self.device);
            }
        }
        self.ui_textures.clear();

        // Per-frame pools → immediate pool → allocator → swapchain; the
        // device, surface and instance follow when the last Arc drops
        unsafe { self.device.device.destroy_sampler(self.sampler, None) };
        for frame in &self.frames {
            frame.destroy(&self.device.device);
        }
        self.immediate.destroy(&self.device.device);
        drop(self.device.allocator.lock().take());
        self.swapchain = None;
    }
}
