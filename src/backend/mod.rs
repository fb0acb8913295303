// Backend module - native graphics API abstraction
//
// Exactly one backend is live per process. It is picked once at startup
// through a `BackendFactory` and then driven only through the `Backend`
// trait, so nothing above this layer names a native type.

pub mod headless;
pub mod types;
pub mod vulkan;

use anyhow::Result;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};

use crate::command::Command;

pub use headless::{HeadlessFactory, HeadlessLog, HeadlessProbe, HeadlessScript, OffscreenWindow};
pub use types::*;
pub use vulkan::VulkanFactory;

/// Settings a backend is created with
#[derive(Debug, Clone)]
pub struct DeviceSettings {
    pub app_name: String,
    pub enable_validation: bool,
    pub frames_in_flight: usize,
    pub present_mode: PresentMode,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            app_name: "flint".to_string(),
            enable_validation: cfg!(debug_assertions),
            frames_in_flight: 2,
            present_mode: PresentMode::Fifo,
        }
    }
}

/// A window the device can present into
pub trait SurfaceWindow: Send + Sync {
    fn raw_handles(&self) -> Result<(RawDisplayHandle, RawWindowHandle)>;

    /// Current drawable size in physical pixels
    fn inner_extent(&self) -> Extent2D;
}

impl SurfaceWindow for winit::window::Window {
    fn raw_handles(&self) -> Result<(RawDisplayHandle, RawWindowHandle)> {
        let display = self
            .display_handle()
            .map_err(|e| anyhow::anyhow!("Window has no display handle: {e}"))?
            .as_raw();
        let window = self
            .window_handle()
            .map_err(|e| anyhow::anyhow!("Window has no window handle: {e}"))?
            .as_raw();
        Ok((display, window))
    }

    fn inner_extent(&self) -> Extent2D {
        let size = self.inner_size();
        Extent2D::new(size.width, size.height)
    }
}

/// Creates the live backend once a window is available
pub trait BackendFactory: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn create(
        &self,
        window: &dyn SurfaceWindow,
        extent: Extent2D,
        settings: &DeviceSettings,
    ) -> Result<Box<dyn Backend>>;
}

/// Pick the factory for a configured backend kind
pub fn factory_for(kind: BackendKind) -> Box<dyn BackendFactory> {
    match kind {
        BackendKind::Vulkan => Box::new(VulkanFactory),
        BackendKind::Headless => Box::new(HeadlessFactory::new()),
    }
}

/// The native device, swapchain and per-frame command recording
///
/// Frame protocol per slot: `wait_frame` → (`acquire_image` on the first
/// pass) → `begin_commands` → `encode`* → `end_commands` → `submit`.
/// One-shot work goes through `begin_immediate` / `encode(Immediate)` /
/// `submit_immediate`, which blocks until the GPU is done.
pub trait Backend: Send {
    fn kind(&self) -> BackendKind;
    fn capabilities(&self) -> &DeviceCapabilities;
    fn surface_extent(&self) -> Extent2D;

    // Frame lifecycle
    fn wait_frame(&mut self, slot: usize) -> Result<()>;
    fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome>;
    fn begin_commands(&mut self, slot: usize) -> Result<()>;
    fn end_commands(&mut self, slot: usize) -> Result<()>;
    /// Submit the slot's commands. `present` carries the acquired image
    /// index on the last pass of a presenting frame; otherwise the call
    /// blocks until the work has finished.
    fn submit(&mut self, slot: usize, present: Option<u32>) -> Result<PresentOutcome>;
    fn recreate_swapchain(&mut self, extent: Extent2D) -> Result<()>;
    fn wait_idle(&mut self) -> Result<()>;

    // Recording
    fn encode(&mut self, target: CmdTarget, command: &Command) -> Result<()>;
    fn begin_immediate(&mut self) -> Result<()>;
    fn submit_immediate(&mut self) -> Result<()>;

    // Resources
    fn create_image(&mut self, desc: &ImageDesc) -> Result<ImageHandle>;
    fn destroy_image(&mut self, image: ImageHandle);
    fn create_buffer(&mut self, desc: &BufferDesc) -> Result<BufferHandle>;
    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<()>;
    fn read_buffer(&mut self, buffer: BufferHandle, offset: u64, out: &mut [u8]) -> Result<()>;
    fn destroy_buffer(&mut self, buffer: BufferHandle);
    fn create_texture(&mut self, desc: &TextureDesc, pixels: &[u8]) -> Result<TextureHandle>;
    fn destroy_texture(&mut self, texture: TextureHandle);
    fn create_pipeline(&mut self, desc: &PipelineDesc) -> Result<PipelineHandle>;
    fn destroy_pipeline(&mut self, pipeline: PipelineHandle);

    // UI interop
    fn register_ui_texture(&mut self, image: ImageHandle) -> Result<UiTextureId>;
    fn release_ui_texture(&mut self, id: UiTextureId);
}
