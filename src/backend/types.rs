// Backend-neutral resource descriptions
//
// Everything above the backend layer talks in these types. A backend maps
// them onto its native objects and hands back opaque handles.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);
    };
}

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Handle values are unique per process, across backend generations
pub(crate) fn next_handle_id() -> u64 {
    NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed)
}

handle_type!(
    /// GPU image owned (or borrowed, for swapchain images) by the backend
    ImageHandle
);
handle_type!(
    /// GPU buffer (vertex, index or readback)
    BufferHandle
);
handle_type!(
    /// Immutable graphics pipeline
    PipelineHandle
);
handle_type!(
    /// Sampled 2D texture (image + view + sampler)
    TextureHandle
);
handle_type!(
    /// Texture handle registered with an external UI layer
    UiTextureId
);

/// Raw native command buffer, handed to external recorders (UI layers)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeCommandBuffer(pub u64);

/// Which native API sits behind the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Vulkan,
    Headless,
}

impl BackendKind {
    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Vulkan => "Vulkan",
            BackendKind::Headless => "Headless",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// GPU-visible access state of an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageLayout {
    Undefined,
    General,
    ColorAttachment,
    DepthAttachment,
    TransferSrc,
    TransferDst,
    ShaderReadOnly,
    Present,
}

/// Pixel formats supported for attachments and textures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Rgba8,
    Rgba8Srgb,
    Bgra8,
    Bgra8Srgb,
    /// Single 32-bit signed integer channel (entity picking)
    RedInt,
    Rgba16F,
    Depth32F,
    Depth24Stencil8,
}

impl Format {
    pub fn is_depth(self) -> bool {
        matches!(self, Format::Depth32F | Format::Depth24Stencil8)
    }

    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            Format::Rgba16F => 8,
            _ => 4,
        }
    }

    /// Layout an attachment of this format renders in
    pub fn attachment_layout(self) -> ImageLayout {
        if self.is_depth() {
            ImageLayout::DepthAttachment
        } else {
            ImageLayout::ColorAttachment
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Extent2D {
    pub width: u32,
    pub height: u32,
}

impl Extent2D {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_zero(self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for Extent2D {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDesc {
    pub label: String,
    pub format: Format,
    pub extent: Extent2D,
    /// 1 for single-sampled images
    pub samples: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferUsage {
    Vertex,
    Index,
    /// Host-readable destination for image copies
    Readback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDesc {
    pub label: String,
    pub size: u64,
    pub usage: BufferUsage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureDesc {
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub format: Format,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexFormat {
    Float,
    Float2,
    Float3,
    Float4,
    Int,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: VertexFormat,
    pub offset: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexLayout {
    pub stride: u32,
    pub attributes: Vec<VertexAttribute>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    TriangleList,
    LineList,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CullMode {
    None,
    Back,
    Front,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendMode {
    Opaque,
    Alpha,
}

/// Everything needed to build one immutable graphics pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineDesc {
    pub label: String,
    /// SPIR-V words as raw little-endian bytes
    pub vertex_spirv: Vec<u8>,
    pub fragment_spirv: Vec<u8>,
    pub vertex_layout: VertexLayout,
    pub topology: Topology,
    pub cull_mode: CullMode,
    pub blend: BlendMode,
    pub depth_test: bool,
    pub depth_write: bool,
    pub color_formats: Vec<Format>,
    pub depth_format: Option<Format>,
    pub samples: u32,
    /// Size of the sampled texture array at set 0 binding 0 (0 = none)
    pub texture_slots: u32,
    pub push_constant_size: u32,
}

/// Device limits the layers above size themselves against
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub device_name: String,
    pub max_texture_slots: u32,
    pub max_samples: u32,
    pub max_image_dimension: u32,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            device_name: "unknown".to_string(),
            max_texture_slots: 32,
            max_samples: 1,
            max_image_dimension: 4096,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentMode {
    Immediate,
    Mailbox,
    Fifo,
    FifoRelaxed,
}

/// A swapchain image handed out for the current frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameAcquire {
    pub image: ImageHandle,
    pub image_index: u32,
    pub format: Format,
    pub extent: Extent2D,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired(FrameAcquire),
    /// Surface changed size; swapchain must be rebuilt before rendering
    OutOfDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    /// Work submitted, nothing presented (intermediate pass)
    Submitted,
    Presented,
    /// Present reported out-of-date or suboptimal
    OutOfDate,
}

/// Where an encoded command lands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdTarget {
    /// Per-frame command buffer of the given frame slot
    Frame(usize),
    /// One-shot command buffer, submitted and waited on immediately
    Immediate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_formats_render_in_depth_layout() {
        assert!(Format::Depth32F.is_depth());
        assert!(Format::Depth24Stencil8.is_depth());
        assert!(!Format::RedInt.is_depth());
        assert_eq!(Format::Depth32F.attachment_layout(), ImageLayout::DepthAttachment);
        assert_eq!(Format::Rgba8.attachment_layout(), ImageLayout::ColorAttachment);
    }

    #[test]
    fn test_zero_extent() {
        assert!(Extent2D::new(0, 720).is_zero());
        assert!(!Extent2D::new(1280, 720).is_zero());
        assert_eq!(Extent2D::new(1280, 720).to_string(), "1280x720");
    }
}
