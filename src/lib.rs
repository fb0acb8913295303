// =============================================================================
// FLINT - lazy GPU command submission with batched 2D rendering
// =============================================================================
//
// LAYERS:
// ┌─────────────────────────────────────────────────────────────────┐
// │  renderer2d   BatchRenderer: quads, circles, lines → draw calls │
// │  command      CommandList (recorded) → CommandBuffer (native)   │
// │  framebuffer  attachments + layout tracking (image)             │
// │  device       lazy init, deferred work, device-loss recovery    │
// │  backend      Vulkan or headless behind one trait               │
// └─────────────────────────────────────────────────────────────────┘
//
// =============================================================================

pub mod backend;
pub mod camera;
pub mod command;
pub mod config;
pub mod deferred;
pub mod device;
pub mod error;
pub mod framebuffer;
pub mod image;
pub mod pipeline;
pub mod renderer2d;
pub mod texture;
pub mod watcher;

pub use backend::{BackendKind, DeviceSettings, Extent2D, Format, ImageLayout};
pub use command::{Command, CommandBuffer, CommandBufferState, CommandList, Submission};
pub use config::Config;
pub use deferred::DeferredInitManager;
pub use device::{DeviceState, GraphicsDevice};
pub use error::{CommandError, DeviceError};
pub use framebuffer::{Framebuffer, FramebufferSpec, SharedFramebuffer, NO_ENTITY};
pub use image::ImageResource;
pub use renderer2d::{BatchRenderer, Circle, Quad, RenderStats, Renderer2DSettings};
