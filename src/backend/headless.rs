// Headless backend - no GPU, full bookkeeping
//
// Implements the whole `Backend` contract in memory. Every call lands in a
// shared `HeadlessLog`, so tests (and `--headless` demo runs) can see what
// the layers above asked the device to do. A `HeadlessScript` injects
// creation failures, stale swapchains and device loss.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;

use super::{
    AcquireOutcome, Backend, BackendFactory, BackendKind, BufferDesc, BufferHandle, CmdTarget,
    DeviceCapabilities, DeviceSettings, Extent2D, FrameAcquire, Format, ImageDesc, ImageHandle,
    ImageLayout, PipelineDesc, PipelineHandle, PresentOutcome, SurfaceWindow, TextureDesc,
    TextureHandle, UiTextureId,
};
use super::types::next_handle_id;
use crate::command::Command;
use crate::error::DeviceError;

const SWAPCHAIN_IMAGE_COUNT: usize = 3;

/// Everything the headless device was asked to do
#[derive(Debug, Default, Clone)]
pub struct HeadlessLog {
    pub backends_created: u32,
    pub backends_destroyed: u32,
    pub frames_waited: u32,
    pub acquires: u32,
    pub command_begins: u32,
    pub command_ends: u32,
    pub submits: u32,
    pub presents: u32,
    pub immediate_submits: u32,
    pub swapchain_recreations: u32,
    pub wait_idles: u32,
    /// Every encoded command, frame and one-shot alike, in order
    pub commands: Vec<Command>,
    pub images_created: u32,
    pub images_destroyed: u32,
    pub buffers_created: u32,
    pub buffers_destroyed: u32,
    /// (buffer, offset, byte length)
    pub buffer_writes: Vec<(BufferHandle, u64, usize)>,
    pub textures_created: u32,
    pub textures_destroyed: u32,
    pub pipelines_created: u32,
    pub pipelines_destroyed: u32,
    pub ui_textures_registered: u32,
    pub ui_textures_released: u32,
}

impl HeadlessLog {
    pub fn count(&self, name: &str) -> usize {
        self.commands.iter().filter(|c| c.name() == name).count()
    }

    pub fn draw_calls(&self) -> usize {
        self.commands.iter().filter(|c| c.is_draw()).count()
    }

    /// (image, old, new) for every recorded layout barrier
    pub fn transitions(&self) -> Vec<(ImageHandle, ImageLayout, ImageLayout)> {
        self.commands
            .iter()
            .filter_map(|c| match c {
                Command::TransitionImage { image, old, new } => Some((*image, *old, *new)),
                _ => None,
            })
            .collect()
    }
}

/// Faults the next backend operations should report
#[derive(Debug, Clone)]
pub struct HeadlessScript {
    pub fail_creation: Option<String>,
    pub unsupported_feature_level: Option<String>,
    /// Number of upcoming acquires that report a stale swapchain
    pub acquire_out_of_date: u32,
    /// Number of upcoming presents that report a stale swapchain
    pub present_out_of_date: u32,
    /// Number of upcoming submits that report device loss
    pub device_lost_on_submit: u32,
    /// Number of upcoming image creations that fail
    pub image_creation_failures: u32,
    pub capabilities: DeviceCapabilities,
}

impl Default for HeadlessScript {
    fn default() -> Self {
        Self {
            fail_creation: None,
            unsupported_feature_level: None,
            acquire_out_of_date: 0,
            present_out_of_date: 0,
            device_lost_on_submit: 0,
            image_creation_failures: 0,
            capabilities: DeviceCapabilities {
                device_name: "Headless".to_string(),
                ..DeviceCapabilities::default()
            },
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    log: HeadlessLog,
    script: HeadlessScript,
}

/// Handle onto the log and script shared with every backend a factory makes
#[derive(Debug, Clone, Default)]
pub struct HeadlessProbe(Arc<Mutex<Shared>>);

impl HeadlessProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the log
    pub fn log(&self) -> HeadlessLog {
        self.0.lock().log.clone()
    }

    pub fn clear_log(&self) {
        self.0.lock().log = HeadlessLog::default();
    }

    pub fn script(&self, edit: impl FnOnce(&mut HeadlessScript)) {
        edit(&mut self.0.lock().script);
    }

    fn with<R>(&self, f: impl FnOnce(&mut Shared) -> R) -> R {
        f(&mut self.0.lock())
    }
}

/// Window stand-in for runs without a native window
#[derive(Debug)]
pub struct OffscreenWindow {
    extent: Mutex<Extent2D>,
}

impl OffscreenWindow {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            extent: Mutex::new(Extent2D::new(width, height)),
        }
    }

    pub fn shared(width: u32, height: u32) -> Arc<dyn SurfaceWindow> {
        Arc::new(Self::new(width, height))
    }

    pub fn set_extent(&self, width: u32, height: u32) {
        *self.extent.lock() = Extent2D::new(width, height);
    }
}

impl SurfaceWindow for OffscreenWindow {
    fn raw_handles(
        &self,
    ) -> Result<(raw_window_handle::RawDisplayHandle, raw_window_handle::RawWindowHandle)> {
        bail!("Offscreen window has no native handles")
    }

    fn inner_extent(&self) -> Extent2D {
        *self.extent.lock()
    }
}

#[derive(Debug, Clone, Default)]
pub struct HeadlessFactory {
    probe: HeadlessProbe,
}

impl HeadlessFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_probe(probe: HeadlessProbe) -> Self {
        Self { probe }
    }

    pub fn probe(&self) -> HeadlessProbe {
        self.probe.clone()
    }
}

impl BackendFactory for HeadlessFactory {
    fn kind(&self) -> BackendKind {
        BackendKind::Headless
    }

    fn create(
        &self,
        _window: &dyn SurfaceWindow,
        extent: Extent2D,
        settings: &DeviceSettings,
    ) -> Result<Box<dyn Backend>> {
        let caps = self.probe.with(|shared| {
            if let Some(reason) = shared.script.fail_creation.take() {
                return Err(anyhow::Error::from(DeviceError::Creation(reason)));
            }
            if let Some(level) = shared.script.unsupported_feature_level.take() {
                return Err(DeviceError::UnsupportedFeatureLevel(level).into());
            }
            shared.log.backends_created += 1;
            Ok(shared.script.capabilities.clone())
        })?;

        log::info!(
            "Created headless device '{}' ({} frames in flight, {})",
            caps.device_name,
            settings.frames_in_flight,
            extent
        );

        let mut backend = HeadlessBackend {
            probe: self.probe.clone(),
            caps,
            extent,
            images: HashMap::new(),
            buffers: HashMap::new(),
            textures: HashSet::new(),
            pipelines: HashSet::new(),
            ui_textures: HashSet::new(),
            swapchain_images: Vec::new(),
            next_swapchain_image: 0,
            recording: vec![SlotState::Idle; settings.frames_in_flight.max(1)],
            immediate_open: false,
        };
        backend.build_swapchain();
        Ok(Box::new(backend))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Idle,
    Recording,
    Ended,
}

#[derive(Debug, Clone)]
struct HeadlessImage {
    format: Format,
    extent: Extent2D,
    /// Last clear value, used as the image's uniform contents
    contents: [f32; 4],
}

struct HeadlessBackend {
    probe: HeadlessProbe,
    caps: DeviceCapabilities,
    extent: Extent2D,
    images: HashMap<ImageHandle, HeadlessImage>,
    buffers: HashMap<BufferHandle, Vec<u8>>,
    textures: HashSet<TextureHandle>,
    pipelines: HashSet<PipelineHandle>,
    ui_textures: HashSet<UiTextureId>,
    swapchain_images: Vec<ImageHandle>,
    next_swapchain_image: usize,
    recording: Vec<SlotState>,
    immediate_open: bool,
}

impl HeadlessBackend {
    fn build_swapchain(&mut self) {
        for image in std::mem::take(&mut self.swapchain_images) {
            self.images.remove(&image);
        }
        for _ in 0..SWAPCHAIN_IMAGE_COUNT {
            let image = ImageHandle(next_handle_id());
            self.images.insert(
                image,
                HeadlessImage {
                    format: Format::Bgra8Srgb,
                    extent: self.extent,
                    contents: [0.0; 4],
                },
            );
            self.swapchain_images.push(image);
        }
        self.next_swapchain_image = 0;
    }

    fn slot_mut(&mut self, slot: usize) -> Result<&mut SlotState> {
        let slots = self.recording.len();
        self.recording
            .get_mut(slot)
            .with_context(|| format!("Frame slot {} out of range ({} slots)", slot, slots))
    }

    fn apply(&mut self, command: &Command) -> Result<()> {
        match command {
            Command::ClearColor { image, color } => {
                if let Some(img) = self.images.get_mut(image) {
                    img.contents = *color;
                }
            }
            Command::BeginRendering(info) => {
                for target in &info.colors {
                    if let (Some(clear), Some(img)) = (target.clear, self.images.get_mut(&target.image)) {
                        img.contents = clear;
                    }
                }
            }
            Command::CopyPixelToBuffer { image, buffer, x, y } => {
                let img = self
                    .images
                    .get(image)
                    .with_context(|| format!("Unknown image {:?}", image))?;
                if *x >= img.extent.width || *y >= img.extent.height {
                    bail!("Pixel ({}, {}) outside image {}", x, y, img.extent);
                }
                let bytes = texel_bytes(img.format, img.contents);
                let data = self
                    .buffers
                    .get_mut(buffer)
                    .with_context(|| format!("Unknown buffer {:?}", buffer))?;
                let len = bytes.len().min(data.len());
                data[..len].copy_from_slice(&bytes[..len]);
            }
            Command::RenderUi(recorder) => recorder.record(super::NativeCommandBuffer(0)),
            _ => {}
        }
        Ok(())
    }
}

fn texel_bytes(format: Format, contents: [f32; 4]) -> Vec<u8> {
    match format {
        Format::RedInt => (contents[0] as i32).to_le_bytes().to_vec(),
        Format::Depth32F => contents[0].to_le_bytes().to_vec(),
        _ => contents
            .iter()
            .map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8)
            .collect(),
    }
}

impl Backend for HeadlessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Headless
    }

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.caps
    }

    fn surface_extent(&self) -> Extent2D {
        self.extent
    }

    fn wait_frame(&mut self, slot: usize) -> Result<()> {
        self.slot_mut(slot)?;
        self.probe.with(|s| s.log.frames_waited += 1);
        Ok(())
    }

    fn acquire_image(&mut self, _slot: usize) -> Result<AcquireOutcome> {
        let stale = self.probe.with(|s| {
            s.log.acquires += 1;
            if s.script.acquire_out_of_date > 0 {
                s.script.acquire_out_of_date -= 1;
                true
            } else {
                false
            }
        });
        if stale {
            return Ok(AcquireOutcome::OutOfDate);
        }

        let index = self.next_swapchain_image % self.swapchain_images.len();
        self.next_swapchain_image += 1;
        Ok(AcquireOutcome::Acquired(FrameAcquire {
            image: self.swapchain_images[index],
            image_index: index as u32,
            format: Format::Bgra8Srgb,
            extent: self.extent,
        }))
    }

    fn begin_commands(&mut self, slot: usize) -> Result<()> {
        let state = self.slot_mut(slot)?;
        if *state == SlotState::Recording {
            bail!("Frame slot {} is already recording", slot);
        }
        *state = SlotState::Recording;
        self.probe.with(|s| s.log.command_begins += 1);
        Ok(())
    }

    fn end_commands(&mut self, slot: usize) -> Result<()> {
        let state = self.slot_mut(slot)?;
        if *state != SlotState::Recording {
            bail!("Frame slot {} is not recording", slot);
        }
        *state = SlotState::Ended;
        self.probe.with(|s| s.log.command_ends += 1);
        Ok(())
    }

    fn submit(&mut self, slot: usize, present: Option<u32>) -> Result<PresentOutcome> {
        let state = self.slot_mut(slot)?;
        if *state != SlotState::Ended {
            bail!("Frame slot {} submitted without being ended", slot);
        }
        *state = SlotState::Idle;

        self.probe.with(|s| {
            if s.script.device_lost_on_submit > 0 {
                s.script.device_lost_on_submit -= 1;
                return Err(anyhow::Error::from(DeviceError::DeviceLost));
            }
            s.log.submits += 1;
            let Some(_) = present else {
                return Ok(PresentOutcome::Submitted);
            };
            if s.script.present_out_of_date > 0 {
                s.script.present_out_of_date -= 1;
                return Ok(PresentOutcome::OutOfDate);
            }
            s.log.presents += 1;
            Ok(PresentOutcome::Presented)
        })
    }

    fn recreate_swapchain(&mut self, extent: Extent2D) -> Result<()> {
        self.extent = extent;
        self.build_swapchain();
        self.probe.with(|s| s.log.swapchain_recreations += 1);
        Ok(())
    }

    fn wait_idle(&mut self) -> Result<()> {
        self.probe.with(|s| s.log.wait_idles += 1);
        Ok(())
    }

    fn encode(&mut self, target: CmdTarget, command: &Command) -> Result<()> {
        match target {
            CmdTarget::Frame(slot) => {
                if *self.slot_mut(slot)? != SlotState::Recording {
                    bail!("Encoding {} into frame slot {} outside recording", command.name(), slot);
                }
            }
            CmdTarget::Immediate => {
                if !self.immediate_open {
                    bail!("Encoding {} outside an immediate submit", command.name());
                }
            }
        }
        self.apply(command)?;
        self.probe.with(|s| s.log.commands.push(command.clone()));
        Ok(())
    }

    fn begin_immediate(&mut self) -> Result<()> {
        if self.immediate_open {
            bail!("Immediate submit already open");
        }
        self.immediate_open = true;
        Ok(())
    }

    fn submit_immediate(&mut self) -> Result<()> {
        if !self.immediate_open {
            bail!("Immediate submit was never begun");
        }
        self.immediate_open = false;
        self.probe.with(|s| s.log.immediate_submits += 1);
        Ok(())
    }

    fn create_image(&mut self, desc: &ImageDesc) -> Result<ImageHandle> {
        if desc.extent.is_zero() {
            bail!("Cannot create zero-sized image '{}'", desc.label);
        }
        let fail = self.probe.with(|s| {
            let fail = s.script.image_creation_failures > 0;
            s.script.image_creation_failures = s.script.image_creation_failures.saturating_sub(1);
            fail
        });
        if fail {
            bail!("Out of device memory creating image '{}'", desc.label);
        }
        let image = ImageHandle(next_handle_id());
        self.images.insert(
            image,
            HeadlessImage {
                format: desc.format,
                extent: desc.extent,
                contents: [0.0; 4],
            },
        );
        self.probe.with(|s| s.log.images_created += 1);
        Ok(image)
    }

    fn destroy_image(&mut self, image: ImageHandle) {
        if self.images.remove(&image).is_some() {
            self.probe.with(|s| s.log.images_destroyed += 1);
        }
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> Result<BufferHandle> {
        let buffer = BufferHandle(next_handle_id());
        self.buffers.insert(buffer, vec![0; desc.size as usize]);
        self.probe.with(|s| s.log.buffers_created += 1);
        Ok(buffer)
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<()> {
        let storage = self
            .buffers
            .get_mut(&buffer)
            .with_context(|| format!("Unknown buffer {:?}", buffer))?;
        let start = offset as usize;
        let end = start + data.len();
        if end > storage.len() {
            bail!("Write of {} bytes at {} overflows buffer of {}", data.len(), offset, storage.len());
        }
        storage[start..end].copy_from_slice(data);
        self.probe.with(|s| s.log.buffer_writes.push((buffer, offset, data.len())));
        Ok(())
    }

    fn read_buffer(&mut self, buffer: BufferHandle, offset: u64, out: &mut [u8]) -> Result<()> {
        let storage = self
            .buffers
            .get(&buffer)
            .with_context(|| format!("Unknown buffer {:?}", buffer))?;
        let start = offset as usize;
        let end = start + out.len();
        if end > storage.len() {
            bail!("Read of {} bytes at {} overflows buffer of {}", out.len(), offset, storage.len());
        }
        out.copy_from_slice(&storage[start..end]);
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if self.buffers.remove(&buffer).is_some() {
            self.probe.with(|s| s.log.buffers_destroyed += 1);
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
        let texture = TextureHandle(next_handle_id());
        self.textures.insert(texture);
        self.probe.with(|s| s.log.textures_created += 1);
        Ok(texture)
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        if self.textures.remove(&texture) {
            self.probe.with(|s| s.log.textures_destroyed += 1);
        }
    }

    fn create_pipeline(&mut self, desc: &PipelineDesc) -> Result<PipelineHandle> {
        if desc.texture_slots > self.caps.max_texture_slots {
            bail!(
                "Pipeline '{}' wants {} texture slots, device allows {}",
                desc.label,
                desc.texture_slots,
                self.caps.max_texture_slots
            );
        }
        let pipeline = PipelineHandle(next_handle_id());
        self.pipelines.insert(pipeline);
        self.probe.with(|s| s.log.pipelines_created += 1);
        Ok(pipeline)
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineHandle) {
        if self.pipelines.remove(&pipeline) {
            self.probe.with(|s| s.log.pipelines_destroyed += 1);
        }
    }

    fn register_ui_texture(&mut self, image: ImageHandle) -> Result<UiTextureId> {
        if !self.images.contains_key(&image) {
            bail!("Cannot register unknown image {:?} for UI display", image);
        }
        let id = UiTextureId(next_handle_id());
        self.ui_textures.insert(id);
        self.probe.with(|s| s.log.ui_textures_registered += 1);
        Ok(id)
    }

    fn release_ui_texture(&mut self, id: UiTextureId) {
        if self.ui_textures.remove(&id) {
            self.probe.with(|s| s.log.ui_textures_released += 1);
        }
    }
}

impl Drop for HeadlessBackend {
    fn drop(&mut self) {
        log::info!("Destroying headless device...");
        self.probe.with(|s| s.log.backends_destroyed += 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BufferUsage;

    fn backend(factory: &HeadlessFactory) -> Box<dyn Backend> {
        factory
            .create(&OffscreenWindow::new(64, 64), Extent2D::new(64, 64), &DeviceSettings::default())
            .unwrap()
    }

    #[test]
    fn test_scripted_creation_failure_is_typed() {
        let factory = HeadlessFactory::new();
        factory.probe().script(|s| s.fail_creation = Some("no adapter".into()));

        let err = factory
            .create(&OffscreenWindow::new(64, 64), Extent2D::new(64, 64), &DeviceSettings::default())
            .err()
            .unwrap();
        assert_eq!(
            err.downcast_ref::<DeviceError>(),
            Some(&DeviceError::Creation("no adapter".into()))
        );

        // Fault is consumed; the next attempt succeeds
        let _ = backend(&factory);
        assert_eq!(factory.probe().log().backends_created, 1);
    }

    #[test]
    fn test_submit_requires_ended_slot() {
        let factory = HeadlessFactory::new();
        let mut backend = backend(&factory);

        backend.begin_commands(0).unwrap();
        assert!(backend.submit(0, None).is_err());
        backend.end_commands(0).unwrap();
        assert_eq!(backend.submit(0, None).unwrap(), PresentOutcome::Submitted);
        // Second submit without a new begin
        assert!(backend.submit(0, None).is_err());
    }

    #[test]
    fn test_pixel_copy_reads_clear_value() {
        let factory = HeadlessFactory::new();
        let mut backend = backend(&factory);

        let image = backend
            .create_image(&ImageDesc {
                label: "ids".into(),
                format: Format::RedInt,
                extent: Extent2D::new(8, 8),
                samples: 1,
            })
            .unwrap();
        let buffer = backend
            .create_buffer(&BufferDesc {
                label: "readback".into(),
                size: 4,
                usage: BufferUsage::Readback,
            })
            .unwrap();

        backend.begin_immediate().unwrap();
        backend
            .encode(CmdTarget::Immediate, &Command::ClearColor { image, color: [42.0, 0.0, 0.0, 0.0] })
            .unwrap();
        backend
            .encode(CmdTarget::Immediate, &Command::CopyPixelToBuffer { image, buffer, x: 3, y: 5 })
            .unwrap();
        backend.submit_immediate().unwrap();

        let mut out = [0u8; 4];
        backend.read_buffer(buffer, 0, &mut out).unwrap();
        assert_eq!(i32::from_le_bytes(out), 42);
    }

    #[test]
    fn test_drop_is_logged() {
        let factory = HeadlessFactory::new();
        drop(backend(&factory));
        let log = factory.probe().log();
        assert_eq!(log.backends_created, 1);
        assert_eq!(log.backends_destroyed, 1);
    }
}
