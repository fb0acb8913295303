// Command lists - recorded frame work replayed into a CommandBuffer
//
// Recording is pure data and works before the device exists. The
// operations that touch the native buffer (begin, end and the presentation
// settings) run immediately when the device is ready and are otherwise
// queued as `ListOp`s and replayed in order once it is.

use std::sync::Arc;

use anyhow::{bail, Result};

use super::{CommandBuffer, CommandBufferState, Submission};
use crate::backend::{BufferHandle, Extent2D, ImageLayout, PipelineHandle, TextureHandle};
use crate::command::{Command, CommandSink, RenderingInfo, UiRecorder};
use crate::deferred::DeferredInitManager;
use crate::device::GraphicsDevice;
use crate::error::is_device_lost;
use crate::framebuffer::SharedFramebuffer;
use crate::pipeline::Pipeline;

/// A command list operation waiting for the device
#[derive(Clone)]
pub enum ListOp {
    Begin,
    SetSourceFramebuffer(Option<SharedFramebuffer>),
    SetShouldPresent(bool),
    SetDrawToSwapchain(bool),
    End,
}

impl ListOp {
    pub fn name(&self) -> &'static str {
        match self {
            ListOp::Begin => "Begin",
            ListOp::SetSourceFramebuffer(_) => "SetSourceFramebuffer",
            ListOp::SetShouldPresent(_) => "SetShouldPresent",
            ListOp::SetDrawToSwapchain(_) => "SetDrawToSwapchain",
            ListOp::End => "End",
        }
    }
}

pub struct CommandList {
    device: Arc<GraphicsDevice>,
    commands: Vec<Command>,
    buffer: CommandBuffer,
    deferred: DeferredInitManager<ListOp>,
    begin_queued: bool,
}

impl CommandList {
    pub fn new(device: &Arc<GraphicsDevice>) -> Self {
        Self {
            device: Arc::clone(device),
            commands: Vec::new(),
            buffer: CommandBuffer::new(device),
            deferred: DeferredInitManager::new(),
            begin_queued: false,
        }
    }

    /// Replay queued operations if the device has become ready.
    ///
    /// Every queued operation runs; the first failure is returned.
    pub fn process_deferred(&mut self) -> Result<usize> {
        let device = Arc::clone(&self.device);
        let commands = &self.commands;
        let buffer = &mut self.buffer;
        let begin_queued = &mut self.begin_queued;
        let mut failure = None;

        let count = self.deferred.process(
            || device.is_initialized(),
            |op| {
                log::debug!("Replaying deferred command list op {}", op.name());
                if matches!(op, ListOp::Begin) {
                    *begin_queued = false;
                }
                if let Err(e) = apply(&device, commands, buffer, op) {
                    log::error!("Deferred command list op failed: {:#}", e);
                    failure.get_or_insert(e);
                }
            },
        );

        match failure {
            Some(e) => Err(e),
            None => Ok(count),
        }
    }

    fn run_or_defer(&mut self, op: ListOp) -> Result<()> {
        self.process_deferred()?;
        if self.device.is_initialized() {
            return apply(&self.device, &self.commands, &mut self.buffer, op);
        }
        log::debug!("Device not ready; deferring command list op {}", op.name());
        self.deferred.enqueue(op);
        Ok(())
    }

    /// Start a frame: clear recorded commands and open the buffer
    pub fn begin(&mut self) -> Result<()> {
        self.commands.clear();
        let was_queued = self.begin_queued;
        self.process_deferred()?;
        if self.device.is_initialized() {
            if was_queued && !self.begin_queued {
                // The queued begin just opened this frame
                return Ok(());
            }
            return apply(&self.device, &self.commands, &mut self.buffer, ListOp::Begin);
        }
        if !self.begin_queued {
            log::debug!("Device not ready; deferring command list begin");
            self.deferred.enqueue(ListOp::Begin);
            self.begin_queued = true;
        }
        Ok(())
    }

    /// Append a command; nothing reaches the GPU until `execute`
    pub fn record_command(&mut self, command: Command) {
        self.commands.push(command);
    }

    /// Replay the recorded commands, close the pass and submit it
    pub fn execute(&mut self, is_last_pass: bool) -> Result<Submission> {
        self.process_deferred()?;
        if !self.device.is_initialized() {
            log::debug!("Device not ready; frame dropped");
            return Ok(Submission::Deferred);
        }
        if self.buffer.is_skipped() {
            self.settle_skipped_frame()?;
            return Ok(Submission::Skipped);
        }

        match self.record_and_submit(is_last_pass) {
            Err(e) if is_device_lost(&e) => {
                if !self.device.recover_device_lost() {
                    return Err(e);
                }
                self.buffer.reset();
                Ok(Submission::Skipped)
            }
            other => other,
        }
    }

    /// Replay, end and submit in one go
    pub fn submit(&mut self) -> Result<Submission> {
        self.execute(true)
    }

    fn record_and_submit(&mut self, is_last_pass: bool) -> Result<Submission> {
        if self.buffer.state() == CommandBufferState::Recording {
            for command in &self.commands {
                command.execute(&mut self.buffer)?;
            }
            self.buffer.end(is_last_pass)?;
        }
        self.buffer.submit(is_last_pass)
    }

    // Recorded layout changes were tracked but never ran; run them now so
    // the tracker matches the GPU again.
    fn settle_skipped_frame(&mut self) -> Result<()> {
        self.buffer.clear_skipped();
        let transitions: Vec<Command> = self
            .commands
            .iter()
            .filter(|c| matches!(c, Command::TransitionImage { .. }))
            .cloned()
            .collect();
        self.device.immediate_submit(&transitions)
    }

    /// Close the frame as its last pass without submitting
    pub fn end(&mut self) -> Result<()> {
        self.run_or_defer(ListOp::End)
    }

    /// Framebuffer whose first attachment is blitted to the swapchain
    pub fn set_source_framebuffer(&mut self, framebuffer: &SharedFramebuffer) -> Result<()> {
        self.run_or_defer(ListOp::SetSourceFramebuffer(Some(Arc::clone(framebuffer))))
    }

    pub fn clear_source_framebuffer(&mut self) -> Result<()> {
        self.run_or_defer(ListOp::SetSourceFramebuffer(None))
    }

    pub fn set_should_present(&mut self, present: bool) -> Result<()> {
        self.run_or_defer(ListOp::SetShouldPresent(present))
    }

    pub fn set_draw_to_swapchain(&mut self, draw: bool) -> Result<()> {
        self.run_or_defer(ListOp::SetDrawToSwapchain(draw))
    }

    // ========================================================================
    // Recording helpers
    // ========================================================================

    /// Clear one colour attachment, moving it to `General` first
    pub fn clear_color(&mut self, framebuffer: &SharedFramebuffer, index: usize, color: [f32; 4]) -> Result<()> {
        let mut fb = framebuffer.lock();
        fb.transition_image_layout(self, index, ImageLayout::General)?;
        let image = fb.attachment(index)?.require_handle()?;
        self.record_command(Command::ClearColor { image, color });
        Ok(())
    }

    pub fn begin_rendering(&mut self, framebuffer: &SharedFramebuffer, clear: Option<[f32; 4]>) -> Result<RenderingInfo> {
        framebuffer.lock().begin_rendering(self, clear)
    }

    pub fn end_rendering(&mut self) {
        self.record_command(Command::EndRendering);
    }

    pub fn transition_image(&mut self, framebuffer: &SharedFramebuffer, index: usize, layout: ImageLayout) -> Result<bool> {
        framebuffer.lock().transition_image_layout(self, index, layout)
    }

    pub fn resolve_framebuffer(&mut self, src: &SharedFramebuffer, dst: &SharedFramebuffer) -> Result<()> {
        if Arc::ptr_eq(src, dst) {
            bail!("Cannot resolve a framebuffer into itself");
        }
        src.lock().resolve_to_framebuffer(self, &mut dst.lock())
    }

    /// Scaled copy of one attachment into another
    pub fn copy_image_to_image(
        &mut self,
        src: &SharedFramebuffer,
        src_index: usize,
        dst: &SharedFramebuffer,
        dst_index: usize,
    ) -> Result<()> {
        if Arc::ptr_eq(src, dst) {
            bail!("Cannot copy between attachments of the same framebuffer");
        }
        let mut src = src.lock();
        let mut dst = dst.lock();
        src.transition_image_layout(self, src_index, ImageLayout::TransferSrc)?;
        dst.transition_image_layout(self, dst_index, ImageLayout::TransferDst)?;
        let command = Command::CopyImage {
            src: src.attachment(src_index)?.require_handle()?,
            src_extent: src.extent(),
            dst: dst.attachment(dst_index)?.require_handle()?,
            dst_extent: dst.extent(),
        };
        self.record_command(command);
        Ok(())
    }

    pub fn bind_pipeline(&mut self, pipeline: &Pipeline) {
        self.record_command(Command::BindPipeline(pipeline.handle()));
    }

    pub fn bind_vertex_buffer(&mut self, buffer: BufferHandle, offset: u64) {
        self.record_command(Command::BindVertexBuffer { buffer, offset });
    }

    pub fn bind_index_buffer(&mut self, buffer: BufferHandle, offset: u64) {
        self.record_command(Command::BindIndexBuffer { buffer, offset });
    }

    pub fn bind_textures(&mut self, pipeline: PipelineHandle, textures: Vec<TextureHandle>) {
        self.record_command(Command::BindTextures { pipeline, textures });
    }

    pub fn push_constants(&mut self, pipeline: PipelineHandle, data: &[u8]) {
        self.record_command(Command::PushConstants {
            pipeline,
            data: data.to_vec(),
        });
    }

    pub fn set_scissor(&mut self, x: i32, y: i32, extent: Extent2D) {
        self.record_command(Command::SetScissor { x, y, extent });
    }

    pub fn set_line_width(&mut self, width: f32) {
        self.record_command(Command::SetLineWidth(width));
    }

    pub fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        self.record_command(Command::Draw {
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        });
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        self.record_command(Command::DrawIndexed {
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        });
    }

    /// Let an external UI layer record into the native buffer
    pub fn render_ui(&mut self, recorder: UiRecorder) {
        self.record_command(Command::RenderUi(recorder));
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn buffer(&self) -> &CommandBuffer {
        &self.buffer
    }

    pub fn state(&self) -> CommandBufferState {
        self.buffer.state()
    }

    pub fn pending_ops(&self) -> usize {
        self.deferred.pending_len()
    }

    pub fn device(&self) -> &Arc<GraphicsDevice> {
        &self.device
    }
}

impl CommandSink for CommandList {
    fn push_command(&mut self, command: Command) {
        self.record_command(command);
    }
}

fn apply(device: &GraphicsDevice, commands: &[Command], buffer: &mut CommandBuffer, op: ListOp) -> Result<()> {
    match op {
        ListOp::Begin => match buffer.start() {
            Err(e) if is_device_lost(&e) => {
                if !device.recover_device_lost() {
                    return Err(e);
                }
                buffer.reset();
                buffer.mark_skipped();
                Ok(())
            }
            other => other,
        },
        ListOp::SetSourceFramebuffer(framebuffer) => {
            buffer.set_source_framebuffer(framebuffer);
            Ok(())
        }
        ListOp::SetShouldPresent(present) => {
            buffer.set_should_present(present);
            Ok(())
        }
        ListOp::SetDrawToSwapchain(draw) => {
            buffer.set_draw_to_swapchain(draw);
            Ok(())
        }
        ListOp::End => {
            if buffer.state() != CommandBufferState::Recording {
                return Ok(());
            }
            for command in commands {
                command.execute(buffer)?;
            }
            buffer.end(true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DeviceSettings, Format, HeadlessFactory, HeadlessProbe, OffscreenWindow};
    use crate::framebuffer::{Framebuffer, FramebufferSpec};

    fn device(lazy: bool) -> (Arc<GraphicsDevice>, HeadlessProbe) {
        let factory = HeadlessFactory::new();
        let probe = factory.probe();
        let device = GraphicsDevice::new(Box::new(factory), DeviceSettings::default(), lazy);
        assert!(device.initialize(Some(OffscreenWindow::shared(320, 240)), 320, 240));
        (device, probe)
    }

    #[test]
    fn test_lazy_begin_is_deferred_then_runs_once() {
        let (device, probe) = device(true);
        let mut list = CommandList::new(&device);

        list.begin().unwrap();
        assert_eq!(list.pending_ops(), 1);
        assert_eq!(probe.log().command_begins, 0);

        // A second begin before the device exists does not queue again
        list.begin().unwrap();
        assert_eq!(list.pending_ops(), 1);

        assert!(device.ensure_initialized());
        assert_eq!(list.process_deferred().unwrap(), 1);
        assert_eq!(probe.log().command_begins, 1);
        assert_eq!(list.state(), CommandBufferState::Recording);
    }

    #[test]
    fn test_begin_after_device_ready_replays_queued_begin_only() {
        let (device, probe) = device(true);
        let mut list = CommandList::new(&device);
        list.begin().unwrap();

        assert!(device.ensure_initialized());
        list.begin().unwrap();

        let log = probe.log();
        assert_eq!(log.command_begins, 1);
        assert_eq!(log.command_ends, 0);
        assert_eq!(list.pending_ops(), 0);
        assert_eq!(list.state(), CommandBufferState::Recording);

        // The next frame opens normally
        list.begin().unwrap();
        assert_eq!(probe.log().command_begins, 2);
    }

    #[test]
    fn test_execute_before_ready_is_deferred() {
        let (device, probe) = device(true);
        let mut list = CommandList::new(&device);
        list.begin().unwrap();
        list.draw(3, 1, 0, 0);
        assert_eq!(list.execute(true).unwrap(), Submission::Deferred);
        assert_eq!(probe.log().submits, 0);
    }

    #[test]
    fn test_settings_replay_in_order() {
        let (device, _probe) = device(true);
        let mut list = CommandList::new(&device);
        list.set_should_present(true).unwrap();
        list.set_draw_to_swapchain(true).unwrap();
        list.set_should_present(false).unwrap();
        assert_eq!(list.pending_ops(), 3);

        device.ensure_initialized();
        list.process_deferred().unwrap();
        assert!(!list.buffer().should_present());
        assert!(list.buffer().draws_to_swapchain());
    }

    #[test]
    fn test_execute_replays_commands_and_presents() {
        let (device, probe) = device(false);
        let fb = Framebuffer::create(&device, FramebufferSpec::new("scene", 320, 240).attachment(Format::Rgba8)).unwrap();

        let mut list = CommandList::new(&device);
        list.set_should_present(true).unwrap();
        list.set_source_framebuffer(&fb).unwrap();
        list.begin().unwrap();
        list.clear_color(&fb, 0, [0.1, 0.2, 0.3, 1.0]).unwrap();
        list.draw(3, 1, 0, 0);
        assert_eq!(probe.log().commands.len(), 0);

        assert_eq!(list.execute(true).unwrap(), Submission::Presented);
        let log = probe.log();
        assert_eq!(log.count("ClearColor"), 1);
        assert_eq!(log.draw_calls(), 1);
        assert_eq!(log.count("CopyImage"), 1);
        assert_eq!(log.presents, 1);
    }

    #[test]
    fn test_begin_clears_previous_commands() {
        let (device, _probe) = device(false);
        let mut list = CommandList::new(&device);
        list.begin().unwrap();
        list.draw(3, 1, 0, 0);
        list.execute(true).unwrap();

        list.begin().unwrap();
        assert!(list.commands().is_empty());
    }

    #[test]
    fn test_stale_acquire_drops_frame_and_settles_layouts() {
        let (device, probe) = device(false);
        let fb = Framebuffer::create(&device, FramebufferSpec::new("scene", 64, 64).attachment(Format::Rgba8)).unwrap();
        probe.script(|s| s.acquire_out_of_date = 1);

        let mut list = CommandList::new(&device);
        list.set_should_present(true).unwrap();
        list.begin().unwrap();
        list.begin_rendering(&fb, Some([0.0; 4])).unwrap();
        list.end_rendering();

        assert_eq!(list.execute(true).unwrap(), Submission::Skipped);
        let log = probe.log();
        assert_eq!(log.submits, 0);
        assert_eq!(log.count("BeginRendering"), 0);
        assert_eq!(log.immediate_submits, 1);
        assert_eq!(log.transitions().len(), 1);

        // Next frame proceeds normally
        list.begin().unwrap();
        assert_eq!(list.execute(true).unwrap(), Submission::Presented);
    }

    #[test]
    fn test_device_loss_on_submit_recovers() {
        let (device, probe) = device(false);
        let generation = device.generation();
        probe.script(|s| s.device_lost_on_submit = 1);

        let mut list = CommandList::new(&device);
        list.begin().unwrap();
        assert_eq!(list.execute(true).unwrap(), Submission::Skipped);
        assert_eq!(device.generation(), generation + 1);

        list.begin().unwrap();
        assert_eq!(list.execute(true).unwrap(), Submission::Submitted);
    }

    #[test]
    fn test_copy_into_same_framebuffer_is_rejected() {
        let (device, _probe) = device(false);
        let fb = Framebuffer::create(&device, FramebufferSpec::new("scene", 64, 64).attachment(Format::Rgba8)).unwrap();
        let mut list = CommandList::new(&device);
        assert!(list.copy_image_to_image(&fb, 0, &fb, 0).is_err());
    }
}
