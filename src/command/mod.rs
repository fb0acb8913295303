// Command recording and submission

mod buffer;
mod commands;
mod list;

pub use buffer::{CommandBuffer, CommandBufferState, Submission};
pub use commands::{ColorTarget, Command, CommandSink, DepthTarget, RenderingInfo, UiRecorder};
pub use list::{CommandList, ListOp};
