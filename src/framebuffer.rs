// Framebuffers - ordered image attachments used as a render target
//
// Attachment index is insertion order. Every framebuffer registers with
// the device so window resizes and device loss reach it; only
// window-relative ones follow the surface size.

use std::sync::Arc;

use anyhow::{bail, Result};
use parking_lot::Mutex;

use crate::backend::{BufferDesc, BufferHandle, BufferUsage, Extent2D, Format, ImageHandle, ImageLayout, UiTextureId};
use crate::command::{ColorTarget, Command, CommandSink, DepthTarget, RenderingInfo};
use crate::device::GraphicsDevice;
use crate::error::CommandError;
use crate::image::{ImageResource, ImageSizing};

pub type SharedFramebuffer = Arc<Mutex<Framebuffer>>;

/// Value written to integer (entity id) attachments on clear
pub const NO_ENTITY: i32 = -1;

const READBACK_SIZE: u64 = 16;

#[derive(Debug, Clone, PartialEq)]
pub struct FramebufferSpec {
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub attachments: Vec<Format>,
    pub samples: u32,
    /// Follow the window size instead of keeping `width`×`height`
    pub window_relative: bool,
}

impl FramebufferSpec {
    pub fn new(label: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            label: label.into(),
            width,
            height,
            attachments: Vec::new(),
            samples: 1,
            window_relative: false,
        }
    }

    pub fn attachment(mut self, format: Format) -> Self {
        self.attachments.push(format);
        self
    }

    pub fn samples(mut self, samples: u32) -> Self {
        self.samples = samples.max(1);
        self
    }

    pub fn window_relative(mut self) -> Self {
        self.window_relative = true;
        self
    }
}

struct UiRegistration {
    index: usize,
    image: ImageHandle,
    id: UiTextureId,
}

pub struct Framebuffer {
    device: Arc<GraphicsDevice>,
    spec: FramebufferSpec,
    attachments: Vec<ImageResource>,
    ui_texture: Option<UiRegistration>,
    readback: Option<(BufferHandle, u64)>,
}

impl Framebuffer {
    /// Describe the framebuffer and register it with the device.
    ///
    /// Images are created now if the device is ready, otherwise once it
    /// becomes ready (or on first use, whichever comes first).
    pub fn create(device: &Arc<GraphicsDevice>, mut spec: FramebufferSpec) -> Result<SharedFramebuffer> {
        if spec.attachments.is_empty() {
            bail!("Framebuffer '{}' has no attachments", spec.label);
        }
        if spec.window_relative {
            let extent = device.surface_extent();
            if !extent.is_zero() {
                spec.width = extent.width;
                spec.height = extent.height;
            }
        }

        let sizing = if spec.window_relative {
            ImageSizing::Window
        } else {
            ImageSizing::Fixed
        };
        let extent = Extent2D::new(spec.width, spec.height);
        let attachments = spec
            .attachments
            .iter()
            .enumerate()
            .map(|(i, format)| ImageResource::new(format!("{} #{}", spec.label, i), *format, extent, spec.samples, sizing))
            .collect();

        log::debug!(
            "Framebuffer '{}': {} attachment(s), {}, {}x MSAA",
            spec.label,
            spec.attachments.len(),
            extent,
            spec.samples
        );

        let framebuffer = Arc::new(Mutex::new(Self {
            device: Arc::clone(device),
            spec,
            attachments,
            ui_texture: None,
            readback: None,
        }));
        device.register_framebuffer(&framebuffer);

        if device.is_initialized() {
            framebuffer.lock().realize()?;
        } else {
            let weak = Arc::downgrade(&framebuffer);
            device.run_when_ready(move |_| {
                let Some(framebuffer) = weak.upgrade() else {
                    return;
                };
                // Held by whoever triggered initialization; they realize it on use
                let Some(mut fb) = framebuffer.try_lock() else {
                    log::debug!("Framebuffer busy; images created on first use");
                    return;
                };
                if let Err(e) = fb.realize() {
                    log::error!("Deferred framebuffer creation failed: {:#}", e);
                }
            });
        }
        Ok(framebuffer)
    }

    /// Create every attachment image that does not exist for the live
    /// backend yet
    pub fn realize(&mut self) -> Result<()> {
        for attachment in &mut self.attachments {
            attachment.realize(&self.device)?;
        }
        Ok(())
    }

    pub fn is_realized(&self) -> bool {
        self.attachments.iter().all(ImageResource::is_realized)
    }

    /// The backend went away with its images; drop every handle
    pub fn forget_images(&mut self) {
        for attachment in &mut self.attachments {
            attachment.forget();
        }
        self.ui_texture = None;
        self.readback = None;
    }

    /// Record a layout barrier for one attachment unless it is already
    /// in `new`
    pub fn transition_image_layout(&mut self, sink: &mut dyn CommandSink, index: usize, new: ImageLayout) -> Result<bool> {
        self.realize()?;
        self.attachment_mut(index)?.transition(sink, new)
    }

    /// Move every attachment into its rendering layout and describe the
    /// rendering scope. Colour attachments are cleared to `clear` (integer
    /// ones to `NO_ENTITY`) and depth to 1.0 when `clear` is set.
    pub fn begin_rendering(&mut self, sink: &mut dyn CommandSink, clear: Option<[f32; 4]>) -> Result<RenderingInfo> {
        self.realize()?;
        let mut colors = Vec::new();
        let mut depth = None;
        for attachment in &mut self.attachments {
            let layout = attachment.attachment_layout();
            attachment.transition(sink, layout)?;
            let image = attachment.require_handle()?;
            if attachment.is_depth() {
                depth = Some(DepthTarget {
                    image,
                    clear: clear.map(|_| 1.0),
                });
            } else {
                let clear = match attachment.format() {
                    Format::RedInt => clear.map(|_| [NO_ENTITY as f32, 0.0, 0.0, 0.0]),
                    _ => clear,
                };
                colors.push(ColorTarget { image, clear });
            }
        }

        let info = RenderingInfo {
            extent: self.extent(),
            colors,
            depth,
        };
        sink.push_command(Command::BeginRendering(info.clone()));
        Ok(info)
    }

    /// Resolve every colour attachment into the matching attachment of
    /// `target`. Does nothing for single-sample framebuffers.
    pub fn resolve_to_framebuffer(&mut self, sink: &mut dyn CommandSink, target: &mut Framebuffer) -> Result<()> {
        if !self.is_multisampled() {
            return Ok(());
        }
        self.realize()?;
        target.realize()?;

        let extent = self.extent();
        for (src, dst) in self.attachments.iter_mut().zip(target.attachments.iter_mut()) {
            if src.is_depth() || dst.is_depth() {
                continue;
            }
            src.transition(sink, ImageLayout::TransferSrc)?;
            dst.transition(sink, ImageLayout::TransferDst)?;
            sink.push_command(Command::ResolveImage {
                src: src.require_handle()?,
                dst: dst.require_handle()?,
                extent,
            });
        }
        Ok(())
    }

    /// Recreate every attachment at the new size. Same size is a no-op.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        if width == self.spec.width && height == self.spec.height {
            return Ok(());
        }
        self.release_ui_texture();

        // Attachments already at the new size skip, so a retry after a
        // failed creation picks up where this one stopped
        for attachment in &mut self.attachments {
            attachment.resize(&self.device, width, height)?;
        }
        self.spec.width = width;
        self.spec.height = height;
        log::debug!("Framebuffer '{}' resized to {}x{}", self.spec.label, width, height);
        Ok(())
    }

    /// UI-displayable handle for one attachment
    ///
    /// Moves the attachment to `ShaderReadOnly` with a one-shot submit and
    /// keeps at most one registration per framebuffer alive.
    pub fn get_ui_texture(&mut self, index: usize) -> Result<UiTextureId> {
        self.realize()?;
        let attachment = self.attachment_mut(index)?;
        let image = attachment.require_handle()?;

        let mut commands = Vec::new();
        attachment.transition(&mut commands, ImageLayout::ShaderReadOnly)?;
        self.device.immediate_submit(&commands)?;

        if let Some(reg) = &self.ui_texture {
            if reg.index == index && reg.image == image {
                return Ok(reg.id);
            }
        }
        self.release_ui_texture();

        let id = self.device.register_ui_texture(image)?;
        self.ui_texture = Some(UiRegistration { index, image, id });
        Ok(id)
    }

    fn release_ui_texture(&mut self) {
        if let Some(reg) = self.ui_texture.take() {
            self.device.release_ui_texture(reg.id);
        }
    }

    /// Read one texel of an integer attachment (object picking)
    pub fn read_pixel(&mut self, index: usize, x: u32, y: u32) -> Result<i32> {
        self.realize()?;
        let extent = self.extent();
        if x >= extent.width || y >= extent.height {
            return Err(CommandError::PixelOutOfBounds { x, y, extent }.into());
        }
        if self.spec.samples > 1 {
            bail!("Cannot read pixels from multisampled framebuffer '{}'", self.spec.label);
        }

        let buffer = self.readback_buffer()?;
        let attachment = self.attachment_mut(index)?;
        let previous = attachment.layout();
        let mut commands = Vec::new();
        attachment.transition(&mut commands, ImageLayout::TransferSrc)?;
        commands.push(Command::CopyPixelToBuffer {
            image: attachment.require_handle()?,
            buffer,
            x,
            y,
        });
        let restore = if previous == ImageLayout::Undefined {
            ImageLayout::General
        } else {
            previous
        };
        attachment.transition(&mut commands, restore)?;
        self.device.immediate_submit(&commands)?;

        let mut bytes = [0u8; 4];
        self.device.read_buffer(buffer, 0, &mut bytes)?;
        Ok(i32::from_le_bytes(bytes))
    }

    fn readback_buffer(&mut self) -> Result<BufferHandle> {
        let generation = self.device.generation();
        if let Some((buffer, created)) = self.readback {
            if created == generation {
                return Ok(buffer);
            }
        }
        let buffer = self.device.create_buffer(&BufferDesc {
            label: format!("{} readback", self.spec.label),
            size: READBACK_SIZE,
            usage: BufferUsage::Readback,
        })?;
        self.readback = Some((buffer, generation));
        Ok(buffer)
    }

    pub fn attachment(&self, index: usize) -> Result<&ImageResource> {
        let count = self.attachments.len();
        self.attachments
            .get(index)
            .ok_or_else(|| CommandError::AttachmentOutOfRange { index, count }.into())
    }

    pub fn attachment_mut(&mut self, index: usize) -> Result<&mut ImageResource> {
        let count = self.attachments.len();
        self.attachments
            .get_mut(index)
            .ok_or_else(|| CommandError::AttachmentOutOfRange { index, count }.into())
    }

    pub fn attachment_count(&self) -> usize {
        self.attachments.len()
    }

    pub fn color_formats(&self) -> Vec<Format> {
        self.spec.attachments.iter().copied().filter(|f| !f.is_depth()).collect()
    }

    pub fn depth_format(&self) -> Option<Format> {
        self.spec.attachments.iter().copied().find(|f| f.is_depth())
    }

    pub fn extent(&self) -> Extent2D {
        Extent2D::new(self.spec.width, self.spec.height)
    }

    pub fn samples(&self) -> u32 {
        self.spec.samples
    }

    pub fn is_multisampled(&self) -> bool {
        self.spec.samples > 1
    }

    pub fn is_window_relative(&self) -> bool {
        self.spec.window_relative
    }

    pub fn spec(&self) -> &FramebufferSpec {
        &self.spec
    }

    pub fn label(&self) -> &str {
        &self.spec.label
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        self.release_ui_texture();
        if let Some((buffer, generation)) = self.readback.take() {
            if self.device.generation() == generation {
                self.device.destroy_buffer(buffer);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DeviceSettings, HeadlessFactory, HeadlessProbe, OffscreenWindow};

    fn device(lazy: bool) -> (Arc<GraphicsDevice>, HeadlessProbe) {
        let factory = HeadlessFactory::new();
        let probe = factory.probe();
        let device = GraphicsDevice::new(Box::new(factory), DeviceSettings::default(), lazy);
        assert!(device.initialize(Some(OffscreenWindow::shared(800, 600)), 800, 600));
        (device, probe)
    }

    fn color_depth(label: &str) -> FramebufferSpec {
        FramebufferSpec::new(label, 256, 128)
            .attachment(Format::Rgba8)
            .attachment(Format::Depth32F)
    }

    #[test]
    fn test_create_realizes_when_ready() {
        let (device, probe) = device(false);
        let fb = Framebuffer::create(&device, color_depth("scene")).unwrap();
        assert!(fb.lock().is_realized());
        assert_eq!(probe.log().images_created, 2);
    }

    #[test]
    fn test_create_defers_until_device_ready() {
        let (device, probe) = device(true);
        let fb = Framebuffer::create(&device, color_depth("scene")).unwrap();
        assert!(!fb.lock().is_realized());
        assert!(device.has_deferred());
        assert_eq!(probe.log().images_created, 0);

        assert!(device.ensure_initialized());
        assert!(fb.lock().is_realized());
        assert_eq!(probe.log().images_created, 2);
    }

    #[test]
    fn test_first_use_under_lock_initializes_lazily() {
        let (device, probe) = device(true);
        let fb = Framebuffer::create(&device, color_depth("scene")).unwrap();

        let mut commands = Vec::new();
        fb.lock()
            .transition_image_layout(&mut commands, 0, ImageLayout::General)
            .unwrap();
        assert!(device.is_initialized());
        assert_eq!(probe.log().images_created, 2);
        assert_eq!(commands.len(), 1);
    }

    #[test]
    fn test_repeated_transition_records_one_barrier() {
        let (device, _probe) = device(false);
        let fb = Framebuffer::create(&device, color_depth("scene")).unwrap();
        let mut fb = fb.lock();

        let mut commands = Vec::new();
        assert!(fb.transition_image_layout(&mut commands, 0, ImageLayout::ColorAttachment).unwrap());
        assert!(!fb.transition_image_layout(&mut commands, 0, ImageLayout::ColorAttachment).unwrap());
        assert_eq!(commands.len(), 1);

        let err = fb
            .transition_image_layout(&mut commands, 5, ImageLayout::General)
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<CommandError>(),
            Some(&CommandError::AttachmentOutOfRange { index: 5, count: 2 })
        );
    }

    #[test]
    fn test_resize_same_size_is_a_no_op() {
        let (device, probe) = device(false);
        let fb = Framebuffer::create(&device, color_depth("scene")).unwrap();
        fb.lock().resize(256, 128).unwrap();
        assert_eq!(probe.log().images_created, 2);
        assert_eq!(probe.log().images_destroyed, 0);
    }

    #[test]
    fn test_resize_recreates_and_keeps_classification() {
        let (device, probe) = device(false);
        let fb = Framebuffer::create(&device, color_depth("scene")).unwrap();
        let mut fb = fb.lock();
        fb.begin_rendering(&mut Vec::new(), Some([0.0; 4])).unwrap();

        fb.resize(300, 200).unwrap();
        let log = probe.log();
        assert_eq!(log.images_created, 4);
        assert_eq!(log.images_destroyed, 2);

        assert_eq!(fb.extent(), Extent2D::new(300, 200));
        assert!(!fb.attachment(0).unwrap().is_depth());
        assert!(fb.attachment(1).unwrap().is_depth());
        assert_eq!(fb.attachment(0).unwrap().layout(), ImageLayout::ColorAttachment);
        assert_eq!(fb.attachment(1).unwrap().layout(), ImageLayout::DepthAttachment);
    }

    #[test]
    fn test_resolve_only_when_multisampled() {
        let (device, _probe) = device(false);
        let single = Framebuffer::create(&device, color_depth("single")).unwrap();
        let msaa = Framebuffer::create(&device, color_depth("msaa").samples(4)).unwrap();
        let target = Framebuffer::create(&device, color_depth("target")).unwrap();

        let mut commands = Vec::new();
        single
            .lock()
            .resolve_to_framebuffer(&mut commands, &mut target.lock())
            .unwrap();
        assert!(commands.is_empty());

        msaa.lock()
            .resolve_to_framebuffer(&mut commands, &mut target.lock())
            .unwrap();
        let names: Vec<_> = commands.iter().map(Command::name).collect();
        assert_eq!(names, vec!["TransitionImage", "TransitionImage", "ResolveImage"]);
        assert_eq!(target.lock().attachment(0).unwrap().layout(), ImageLayout::TransferDst);
    }

    #[test]
    fn test_ui_texture_is_reused_until_resize() {
        let (device, probe) = device(false);
        let fb = Framebuffer::create(&device, color_depth("viewport")).unwrap();
        let mut fb = fb.lock();

        let first = fb.get_ui_texture(0).unwrap();
        assert_eq!(fb.get_ui_texture(0).unwrap(), first);
        assert_eq!(fb.attachment(0).unwrap().layout(), ImageLayout::ShaderReadOnly);
        assert_eq!(probe.log().ui_textures_registered, 1);

        fb.resize(64, 64).unwrap();
        let second = fb.get_ui_texture(0).unwrap();
        assert_ne!(second, first);
        let log = probe.log();
        assert_eq!(log.ui_textures_registered, 2);
        assert_eq!(log.ui_textures_released, 1);
    }

    #[test]
    fn test_read_pixel_returns_entity_id() {
        let (device, _probe) = device(false);
        let spec = FramebufferSpec::new("picking", 32, 32).attachment(Format::RedInt);
        let fb = Framebuffer::create(&device, spec).unwrap();
        let mut fb = fb.lock();

        let mut commands = Vec::new();
        fb.transition_image_layout(&mut commands, 0, ImageLayout::General).unwrap();
        commands.push(Command::ClearColor {
            image: fb.attachment(0).unwrap().require_handle().unwrap(),
            color: [42.0, 0.0, 0.0, 0.0],
        });
        device.immediate_submit(&commands).unwrap();

        assert_eq!(fb.read_pixel(0, 3, 4).unwrap(), 42);
        assert_eq!(fb.attachment(0).unwrap().layout(), ImageLayout::General);

        let err = fb.read_pixel(0, 32, 0).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CommandError>(),
            Some(CommandError::PixelOutOfBounds { x: 32, .. })
        ));
    }

    #[test]
    fn test_only_window_relative_framebuffers_follow_surface() {
        let (device, _probe) = device(false);
        let window = Framebuffer::create(&device, color_depth("window").window_relative()).unwrap();
        let fixed = Framebuffer::create(&device, color_depth("fixed")).unwrap();
        assert_eq!(window.lock().extent(), Extent2D::new(800, 600));

        device.resize_surface(1024, 768).unwrap();
        assert_eq!(window.lock().extent(), Extent2D::new(1024, 768));
        assert_eq!(fixed.lock().extent(), Extent2D::new(256, 128));
    }

    #[test]
    fn test_device_loss_recreates_images() {
        let (device, probe) = device(false);
        let fb = Framebuffer::create(&device, color_depth("scene")).unwrap();
        let before = fb.lock().attachment(0).unwrap().handle();
        let generation = device.generation();

        assert!(device.recover_device_lost());
        assert_eq!(device.generation(), generation + 1);
        let fb = fb.lock();
        assert!(fb.is_realized());
        assert_ne!(fb.attachment(0).unwrap().handle(), before);
        assert_eq!(probe.log().images_created, 4);
    }

    #[test]
    fn test_failed_resize_keeps_extent() {
        let (device, probe) = device(false);
        let fb = Framebuffer::create(&device, color_depth("scene")).unwrap();
        let mut fb = fb.lock();
        let color = fb.attachment(0).unwrap().handle();

        probe.script(|s| s.image_creation_failures = 1);
        assert!(fb.resize(64, 64).is_err());
        assert_eq!(fb.extent(), Extent2D::new(256, 128));
        assert_eq!(fb.attachment(0).unwrap().handle(), color);
        assert!(fb.is_realized());

        fb.resize(64, 64).unwrap();
        assert_eq!(fb.extent(), Extent2D::new(64, 64));
        for i in 0..fb.attachment_count() {
            assert_eq!(fb.attachment(i).unwrap().extent(), Extent2D::new(64, 64));
        }
    }
}
