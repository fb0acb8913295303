// Recorded GPU commands
//
// A CommandList stores these as plain data and replays them into its
// CommandBuffer at execute time. Each variant maps onto one native call.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;

use super::CommandBuffer;
use crate::backend::{
    BufferHandle, Extent2D, ImageHandle, ImageLayout, NativeCommandBuffer, PipelineHandle,
    TextureHandle,
};

/// Colour attachment of a dynamic rendering scope
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorTarget {
    pub image: ImageHandle,
    /// `None` loads existing contents
    pub clear: Option<[f32; 4]>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthTarget {
    pub image: ImageHandle,
    pub clear: Option<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderingInfo {
    pub extent: Extent2D,
    pub colors: Vec<ColorTarget>,
    pub depth: Option<DepthTarget>,
}

/// Callback an external UI layer records its draw data with
#[derive(Clone)]
pub struct UiRecorder(Arc<dyn Fn(NativeCommandBuffer) + Send + Sync>);

impl UiRecorder {
    pub fn new(record: impl Fn(NativeCommandBuffer) + Send + Sync + 'static) -> Self {
        Self(Arc::new(record))
    }

    pub fn record(&self, cmd: NativeCommandBuffer) {
        (self.0)(cmd)
    }
}

impl fmt::Debug for UiRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("UiRecorder")
    }
}

impl PartialEq for UiRecorder {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Layout barrier; `old` is whatever the tracker last recorded
    TransitionImage {
        image: ImageHandle,
        old: ImageLayout,
        new: ImageLayout,
    },
    /// Clear a colour image that is already in `General`
    ClearColor {
        image: ImageHandle,
        color: [f32; 4],
    },
    BeginRendering(RenderingInfo),
    EndRendering,
    BindPipeline(PipelineHandle),
    BindVertexBuffer {
        buffer: BufferHandle,
        offset: u64,
    },
    BindIndexBuffer {
        buffer: BufferHandle,
        offset: u64,
    },
    /// Bind a texture array to set 0 of `pipeline`, slot order preserved
    BindTextures {
        pipeline: PipelineHandle,
        textures: Vec<TextureHandle>,
    },
    PushConstants {
        pipeline: PipelineHandle,
        data: Vec<u8>,
    },
    SetScissor {
        x: i32,
        y: i32,
        extent: Extent2D,
    },
    SetLineWidth(f32),
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
    /// Scaled blit; src in TransferSrc, dst in TransferDst
    CopyImage {
        src: ImageHandle,
        src_extent: Extent2D,
        dst: ImageHandle,
        dst_extent: Extent2D,
    },
    /// Multisample resolve; src in TransferSrc, dst in TransferDst
    ResolveImage {
        src: ImageHandle,
        dst: ImageHandle,
        extent: Extent2D,
    },
    /// Copy one texel at (x, y) into the start of `buffer`
    CopyPixelToBuffer {
        image: ImageHandle,
        buffer: BufferHandle,
        x: u32,
        y: u32,
    },
    RenderUi(UiRecorder),
}

impl Command {
    /// Record this command into `cmd`
    pub fn execute(&self, cmd: &mut CommandBuffer) -> Result<()> {
        cmd.encode(self)
    }

    pub fn is_draw(&self) -> bool {
        matches!(self, Command::Draw { .. } | Command::DrawIndexed { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::TransitionImage { .. } => "TransitionImage",
            Command::ClearColor { .. } => "ClearColor",
            Command::BeginRendering(_) => "BeginRendering",
            Command::EndRendering => "EndRendering",
            Command::BindPipeline(_) => "BindPipeline",
            Command::BindVertexBuffer { .. } => "BindVertexBuffer",
            Command::BindIndexBuffer { .. } => "BindIndexBuffer",
            Command::BindTextures { .. } => "BindTextures",
            Command::PushConstants { .. } => "PushConstants",
            Command::SetScissor { .. } => "SetScissor",
            Command::SetLineWidth(_) => "SetLineWidth",
            Command::Draw { .. } => "Draw",
            Command::DrawIndexed { .. } => "DrawIndexed",
            Command::CopyImage { .. } => "CopyImage",
            Command::ResolveImage { .. } => "ResolveImage",
            Command::CopyPixelToBuffer { .. } => "CopyPixelToBuffer",
            Command::RenderUi(_) => "RenderUi",
        }
    }
}

/// Anything commands can be appended to
///
/// Image and framebuffer transitions record through this so the same
/// code feeds a frame's CommandList or a one-shot batch.
pub trait CommandSink {
    fn push_command(&mut self, command: Command);
}

impl CommandSink for Vec<Command> {
    fn push_command(&mut self, command: Command) {
        self.push(command);
    }
}
