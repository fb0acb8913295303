// Image resources with tracked layout
//
// The tracker is the single source of truth for an image's layout: every
// barrier goes through `transition`, which records the old layout the
// tracker knows about and then updates it.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;

use crate::backend::{Extent2D, Format, FrameAcquire, ImageDesc, ImageHandle, ImageLayout};
use crate::command::{Command, CommandSink};
use crate::device::GraphicsDevice;
use crate::error::CommandError;

/// How an image's size is decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSizing {
    /// Owned by the swapchain; never created or destroyed here
    Swapchain,
    /// Follows the window size
    Window,
    Fixed,
}

pub struct ImageResource {
    label: String,
    handle: Option<ImageHandle>,
    format: Format,
    extent: Extent2D,
    layout: ImageLayout,
    samples: u32,
    sizing: ImageSizing,
    // Device that owns `handle`, and the backend generation it came from
    owner: Option<(Arc<GraphicsDevice>, u64)>,
}

impl fmt::Debug for ImageResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageResource")
            .field("label", &self.label)
            .field("handle", &self.handle)
            .field("format", &self.format)
            .field("extent", &self.extent)
            .field("layout", &self.layout)
            .field("samples", &self.samples)
            .field("sizing", &self.sizing)
            .field("generation", &self.owner.as_ref().map(|(_, generation)| *generation))
            .finish()
    }
}

impl ImageResource {
    /// Describe an image; nothing is created until `realize`
    pub fn new(label: impl Into<String>, format: Format, extent: Extent2D, samples: u32, sizing: ImageSizing) -> Self {
        Self {
            label: label.into(),
            handle: None,
            format,
            extent,
            layout: ImageLayout::Undefined,
            samples: samples.max(1),
            sizing,
            owner: None,
        }
    }

    /// Wrap the swapchain image acquired for this frame
    pub fn swapchain(frame: &FrameAcquire) -> Self {
        Self {
            label: format!("swapchain #{}", frame.image_index),
            handle: Some(frame.image),
            format: frame.format,
            extent: frame.extent,
            layout: ImageLayout::Undefined,
            samples: 1,
            sizing: ImageSizing::Swapchain,
            owner: None,
        }
    }

    /// Create the GPU image. New images start in `Undefined`.
    pub fn realize(&mut self, device: &Arc<GraphicsDevice>) -> Result<()> {
        if self.sizing == ImageSizing::Swapchain || self.is_realized() {
            return Ok(());
        }
        self.forget();

        let handle = device.create_image(&ImageDesc {
            label: self.label.clone(),
            format: self.format,
            extent: self.extent,
            samples: self.samples,
        })?;
        self.handle = Some(handle);
        self.layout = ImageLayout::Undefined;
        self.owner = Some((Arc::clone(device), device.generation()));
        Ok(())
    }

    /// Holds a handle from the live backend generation
    pub fn is_realized(&self) -> bool {
        match (&self.handle, &self.owner) {
            (Some(_), Some((device, generation))) => device.generation() == *generation && device.is_initialized(),
            (Some(_), None) => self.sizing == ImageSizing::Swapchain,
            _ => false,
        }
    }

    /// Drop the handle without destroying it; the backend that owned it
    /// is already gone
    pub fn forget(&mut self) {
        if self.sizing == ImageSizing::Swapchain {
            return;
        }
        self.handle = None;
        self.owner = None;
        self.layout = ImageLayout::Undefined;
    }

    /// Release the GPU image
    pub fn destroy(&mut self) {
        if self.sizing == ImageSizing::Swapchain {
            return;
        }
        if let (Some(handle), Some((device, generation))) = (self.handle.take(), self.owner.take()) {
            if device.generation() == generation {
                device.destroy_image(handle);
            }
        }
        self.layout = ImageLayout::Undefined;
    }

    /// Record a barrier to `new` unless the image is already there.
    ///
    /// Returns whether a barrier was recorded.
    pub fn transition(&mut self, sink: &mut dyn CommandSink, new: ImageLayout) -> Result<bool> {
        let image = self.require_handle()?;
        if self.layout == new {
            return Ok(false);
        }
        sink.push_command(Command::TransitionImage {
            image,
            old: self.layout,
            new,
        });
        self.layout = new;
        Ok(true)
    }

    /// Recreate at a new size, keeping format, samples and layout.
    ///
    /// The replacement is created before the old image is destroyed, so a
    /// failed creation leaves the old image and extent in place. The fresh
    /// image is moved from `Undefined` to the old layout with a one-shot
    /// submit. Same size is a no-op.
    pub fn resize(&mut self, device: &Arc<GraphicsDevice>, width: u32, height: u32) -> Result<()> {
        let extent = Extent2D::new(width, height);
        if extent == self.extent || self.sizing == ImageSizing::Swapchain {
            return Ok(());
        }

        if !self.is_realized() || extent.is_zero() {
            self.destroy();
            self.extent = extent;
            return Ok(());
        }

        let replacement = device.create_image(&ImageDesc {
            label: self.label.clone(),
            format: self.format,
            extent,
            samples: self.samples,
        })?;
        let previous = self.layout;
        self.destroy();
        self.handle = Some(replacement);
        self.owner = Some((Arc::clone(device), device.generation()));
        self.extent = extent;

        if previous != ImageLayout::Undefined {
            let mut commands = Vec::new();
            self.transition(&mut commands, previous)?;
            device.immediate_submit(&commands)?;
        }
        log::debug!("Resized image '{}' to {}", self.label, extent);
        Ok(())
    }

    /// Override the tracked layout after work recorded elsewhere
    pub fn assume_layout(&mut self, layout: ImageLayout) {
        self.layout = layout;
    }

    pub fn handle(&self) -> Option<ImageHandle> {
        self.handle
    }

    pub fn require_handle(&self) -> Result<ImageHandle> {
        Ok(self.handle.ok_or(CommandError::NotRealized)?)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn extent(&self) -> Extent2D {
        self.extent
    }

    pub fn layout(&self) -> ImageLayout {
        self.layout
    }

    pub fn samples(&self) -> u32 {
        self.samples
    }

    pub fn sizing(&self) -> ImageSizing {
        self.sizing
    }

    pub fn is_depth(&self) -> bool {
        self.format.is_depth()
    }

    /// Layout the image works in while rendering
    pub fn attachment_layout(&self) -> ImageLayout {
        self.format.attachment_layout()
    }
}

impl Drop for ImageResource {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DeviceSettings, HeadlessFactory, HeadlessProbe, OffscreenWindow};

    fn ready_device() -> (Arc<GraphicsDevice>, HeadlessProbe) {
        let factory = HeadlessFactory::new();
        let probe = factory.probe();
        let device = GraphicsDevice::new(Box::new(factory), DeviceSettings::default(), false);
        assert!(device.initialize(Some(OffscreenWindow::shared(64, 64)), 64, 64));
        (device, probe)
    }

    #[test]
    fn test_same_layout_records_one_barrier() {
        let (device, _probe) = ready_device();
        let mut image = ImageResource::new("color", Format::Rgba8, Extent2D::new(16, 16), 1, ImageSizing::Fixed);
        image.realize(&device).unwrap();

        let mut commands = Vec::new();
        assert!(image.transition(&mut commands, ImageLayout::General).unwrap());
        assert!(!image.transition(&mut commands, ImageLayout::General).unwrap());
        assert_eq!(commands.len(), 1);
        assert_eq!(image.layout(), ImageLayout::General);
    }

    #[test]
    fn test_transition_before_realize_fails() {
        let mut image = ImageResource::new("color", Format::Rgba8, Extent2D::new(16, 16), 1, ImageSizing::Fixed);
        let err = image.transition(&mut Vec::new(), ImageLayout::General).unwrap_err();
        assert_eq!(err.downcast_ref::<CommandError>(), Some(&CommandError::NotRealized));
    }

    #[test]
    fn test_resize_restores_layout() {
        let (device, probe) = ready_device();
        let mut image = ImageResource::new("depth", Format::Depth32F, Extent2D::new(16, 16), 1, ImageSizing::Window);
        image.realize(&device).unwrap();
        let mut commands = Vec::new();
        image.transition(&mut commands, ImageLayout::DepthAttachment).unwrap();

        image.resize(&device, 16, 16).unwrap();
        assert_eq!(probe.log().images_created, 1);

        image.resize(&device, 32, 8).unwrap();
        let log = probe.log();
        assert_eq!(log.images_created, 2);
        assert_eq!(log.images_destroyed, 1);
        assert_eq!(log.immediate_submits, 1);
        assert_eq!(image.layout(), ImageLayout::DepthAttachment);
        assert!(image.is_depth());
        assert_eq!(image.extent(), Extent2D::new(32, 8));
    }

    #[test]
    fn test_resize_creates_before_destroying() {
        let (device, _probe) = ready_device();
        let events = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        device.set_resource_callback(move |name, created| sink.lock().push((name.to_string(), created)));

        let mut image = ImageResource::new("color", Format::Rgba8, Extent2D::new(16, 16), 1, ImageSizing::Window);
        image.realize(&device).unwrap();
        events.lock().clear();

        image.resize(&device, 32, 32).unwrap();
        assert_eq!(*events.lock(), vec![("color".to_string(), true), ("image".to_string(), false)]);
    }

    #[test]
    fn test_failed_resize_keeps_old_image() {
        let (device, probe) = ready_device();
        let mut image = ImageResource::new("color", Format::Rgba8, Extent2D::new(16, 16), 1, ImageSizing::Window);
        image.realize(&device).unwrap();
        image.transition(&mut Vec::new(), ImageLayout::General).unwrap();
        let before = image.handle();

        probe.script(|s| s.image_creation_failures = 1);
        assert!(image.resize(&device, 32, 32).is_err());
        assert!(image.is_realized());
        assert_eq!(image.handle(), before);
        assert_eq!(image.extent(), Extent2D::new(16, 16));
        assert_eq!(image.layout(), ImageLayout::General);
        assert_eq!(probe.log().images_destroyed, 0);

        image.resize(&device, 32, 32).unwrap();
        assert_eq!(image.extent(), Extent2D::new(32, 32));
        assert_eq!(image.layout(), ImageLayout::General);
    }

    #[test]
    fn test_debug_skips_owner() {
        let image = ImageResource::new("color", Format::Rgba8, Extent2D::new(4, 4), 1, ImageSizing::Fixed);
        let text = format!("{:?}", image);
        assert!(text.contains("\"color\""));
        assert!(text.contains("generation: None"));
    }

    #[test]
    fn test_drop_destroys_image() {
        let (device, probe) = ready_device();
        {
            let mut image = ImageResource::new("tmp", Format::Rgba8, Extent2D::new(4, 4), 1, ImageSizing::Fixed);
            image.realize(&device).unwrap();
        }
        assert_eq!(probe.log().images_destroyed, 1);
    }

    #[test]
    fn test_stale_generation_is_not_realized() {
        let (device, probe) = ready_device();
        let mut image = ImageResource::new("tmp", Format::Rgba8, Extent2D::new(4, 4), 1, ImageSizing::Fixed);
        image.realize(&device).unwrap();

        assert!(device.recover_device_lost());
        assert!(!image.is_realized());
        image.realize(&device).unwrap();
        assert!(image.is_realized());
        assert_eq!(probe.log().images_created, 2);
    }
}
