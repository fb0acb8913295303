// Per-frame command buffer state machine
//
// Initial → Recording → Executable → Pending, back to Recording on the
// next start. The swapchain image is acquired on the first pass of a
// presenting frame and presented by the last.

use std::sync::Arc;

use anyhow::Result;

use crate::backend::{AcquireOutcome, CmdTarget, ImageLayout, PresentOutcome};
use crate::command::Command;
use crate::device::GraphicsDevice;
use crate::error::{CommandError, DeviceError};
use crate::framebuffer::SharedFramebuffer;
use crate::image::ImageResource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandBufferState {
    Initial,
    Recording,
    Executable,
    Pending,
}

/// What happened to a frame's work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// Submitted without presenting
    Submitted,
    Presented,
    /// Submitted, but the swapchain was stale; it has been rebuilt
    OutOfDate,
    /// Dropped: stale swapchain on acquire or device loss
    Skipped,
    /// Dropped: the device is not ready yet
    Deferred,
}

pub struct CommandBuffer {
    device: Arc<GraphicsDevice>,
    state: CommandBufferState,
    frame_slot: usize,
    first_pass: bool,
    skipped: bool,
    swapchain_image: Option<ImageResource>,
    image_index: u32,
    source: Option<SharedFramebuffer>,
    should_present: bool,
    draw_to_swapchain: bool,
    generation: u64,
    frame_index: u64,
}

impl CommandBuffer {
    pub fn new(device: &Arc<GraphicsDevice>) -> Self {
        Self {
            device: Arc::clone(device),
            state: CommandBufferState::Initial,
            frame_slot: 0,
            first_pass: true,
            skipped: false,
            swapchain_image: None,
            image_index: 0,
            source: None,
            should_present: false,
            draw_to_swapchain: false,
            generation: device.generation(),
            frame_index: 0,
        }
    }

    /// Begin recording a pass.
    ///
    /// Waits for the slot's previous work, acquires the swapchain image on
    /// the first pass of a presenting frame and opens the native buffer.
    /// A stale swapchain rebuilds the surface and marks the frame skipped.
    pub fn start(&mut self) -> Result<()> {
        let device = Arc::clone(&self.device);
        if device.generation() != self.generation {
            // Backend was recreated; nothing from the old one is valid
            self.reset();
            self.generation = device.generation();
        }

        let mut backend = device.try_backend().ok_or(DeviceError::NotInitialized)?;
        let slot = self.frame_slot;

        match self.state {
            CommandBufferState::Recording | CommandBufferState::Executable => {
                log::warn!("Command buffer restarted before submit; discarding recorded work");
                if self.state == CommandBufferState::Recording {
                    backend.end_commands(slot)?;
                }
                if let Some(image) = &mut self.swapchain_image {
                    image.assume_layout(ImageLayout::Undefined);
                }
            }
            CommandBufferState::Initial | CommandBufferState::Pending => backend.wait_frame(slot)?,
        }

        if self.first_pass && self.should_present && self.swapchain_image.is_none() {
            match backend.acquire_image(slot)? {
                AcquireOutcome::Acquired(frame) => {
                    self.image_index = frame.image_index;
                    self.swapchain_image = Some(ImageResource::swapchain(&frame));
                }
                AcquireOutcome::OutOfDate => {
                    drop(backend);
                    log::debug!("Swapchain out of date on acquire; skipping frame");
                    self.mark_skipped();
                    return device.handle_surface_out_of_date();
                }
            }
        }

        backend.begin_commands(slot)?;
        self.state = CommandBufferState::Recording;
        self.skipped = false;

        if self.draw_to_swapchain {
            if let Some(image) = &mut self.swapchain_image {
                let mut commands = Vec::new();
                image.transition(&mut commands, ImageLayout::ColorAttachment)?;
                for command in &commands {
                    backend.encode(CmdTarget::Frame(slot), command)?;
                }
            }
        }
        Ok(())
    }

    /// Record one command into the open pass
    pub fn encode(&mut self, command: &Command) -> Result<()> {
        if self.state != CommandBufferState::Recording {
            log::error!("{} recorded outside a pass (state {:?})", command.name(), self.state);
            return Err(CommandError::NotRecording(self.state).into());
        }
        self.device
            .try_backend()
            .ok_or(DeviceError::NotInitialized)?
            .encode(CmdTarget::Frame(self.frame_slot), command)
    }

    /// Close the pass. The last pass of a presenting frame also moves the
    /// swapchain image to `Present`, blitting the source framebuffer's
    /// first attachment into it unless the frame drew there directly.
    pub fn end(&mut self, is_last_pass: bool) -> Result<()> {
        if self.state != CommandBufferState::Recording {
            log::error!("Command buffer ended outside a pass (state {:?})", self.state);
            return Err(CommandError::NotRecording(self.state).into());
        }

        let mut commands = Vec::new();
        if is_last_pass && self.should_present {
            if let Some(image) = &mut self.swapchain_image {
                if !self.draw_to_swapchain {
                    if let Some(source) = &self.source {
                        let mut fb = source.lock();
                        let src_extent = fb.extent();
                        let attachment = fb.attachment_mut(0)?;
                        attachment.transition(&mut commands, ImageLayout::TransferSrc)?;
                        image.transition(&mut commands, ImageLayout::TransferDst)?;
                        commands.push(Command::CopyImage {
                            src: attachment.require_handle()?,
                            src_extent,
                            dst: image.require_handle()?,
                            dst_extent: image.extent(),
                        });
                        attachment.transition(&mut commands, ImageLayout::General)?;
                    }
                }
                image.transition(&mut commands, ImageLayout::Present)?;
            }
        }

        let device = Arc::clone(&self.device);
        let mut backend = device.try_backend().ok_or(DeviceError::NotInitialized)?;
        for command in &commands {
            backend.encode(CmdTarget::Frame(self.frame_slot), command)?;
        }
        backend.end_commands(self.frame_slot)?;
        self.state = CommandBufferState::Executable;
        Ok(())
    }

    /// Hand the pass to the GPU.
    ///
    /// Presents only on the last pass of a presenting frame; any other
    /// submit blocks until the GPU is done with it.
    pub fn submit(&mut self, is_last_pass: bool) -> Result<Submission> {
        match self.state {
            CommandBufferState::Executable => {}
            CommandBufferState::Pending => {
                log::error!("Command buffer submitted twice without an intervening start");
                return Err(CommandError::AlreadySubmitted.into());
            }
            state => {
                log::error!("Command buffer submitted in state {:?}", state);
                return Err(CommandError::NotExecutable(state).into());
            }
        }

        let present = if is_last_pass && self.should_present {
            self.swapchain_image.as_ref().map(|_| self.image_index)
        } else {
            None
        };

        let device = Arc::clone(&self.device);
        let outcome = {
            let mut backend = device.try_backend().ok_or(DeviceError::NotInitialized)?;
            backend.submit(self.frame_slot, present)
        };
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                self.state = CommandBufferState::Initial;
                return Err(e);
            }
        };

        self.state = CommandBufferState::Pending;
        if is_last_pass {
            self.finish_frame();
        } else {
            self.first_pass = false;
        }

        match outcome {
            PresentOutcome::Submitted => Ok(Submission::Submitted),
            PresentOutcome::Presented => Ok(Submission::Presented),
            PresentOutcome::OutOfDate => {
                log::debug!("Swapchain out of date on present; rebuilding");
                device.handle_surface_out_of_date()?;
                Ok(Submission::OutOfDate)
            }
        }
    }

    fn finish_frame(&mut self) {
        self.first_pass = true;
        self.swapchain_image = None;
        self.frame_slot = (self.frame_slot + 1) % self.device.frames_in_flight();
        self.frame_index += 1;
    }

    /// Forget all frame state; used after the backend was recreated
    pub fn reset(&mut self) {
        self.state = CommandBufferState::Initial;
        self.frame_slot = 0;
        self.first_pass = true;
        self.skipped = false;
        self.swapchain_image = None;
        self.generation = self.device.generation();
    }

    /// Drop the current frame
    pub fn mark_skipped(&mut self) {
        self.state = CommandBufferState::Initial;
        self.skipped = true;
    }

    pub fn clear_skipped(&mut self) {
        self.skipped = false;
    }

    pub fn is_skipped(&self) -> bool {
        self.skipped
    }

    pub fn state(&self) -> CommandBufferState {
        self.state
    }

    pub fn frame_slot(&self) -> usize {
        self.frame_slot
    }

    /// Number of frames finished so far
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn is_first_pass(&self) -> bool {
        self.first_pass
    }

    /// Swapchain image acquired for the current frame
    pub fn swapchain_image(&self) -> Option<&ImageResource> {
        self.swapchain_image.as_ref()
    }

    pub fn set_source_framebuffer(&mut self, framebuffer: Option<SharedFramebuffer>) {
        self.source = framebuffer;
    }

    pub fn source_framebuffer(&self) -> Option<&SharedFramebuffer> {
        self.source.as_ref()
    }

    pub fn set_should_present(&mut self, present: bool) {
        self.should_present = present;
    }

    pub fn should_present(&self) -> bool {
        self.should_present
    }

    pub fn set_draw_to_swapchain(&mut self, draw: bool) {
        if draw && !self.should_present {
            log::warn!("Drawing to the swapchain without presenting; no image will be acquired");
        }
        self.draw_to_swapchain = draw;
    }

    pub fn draws_to_swapchain(&self) -> bool {
        self.draw_to_swapchain
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DeviceSettings, Format, HeadlessFactory, HeadlessProbe, OffscreenWindow};
    use crate::framebuffer::{Framebuffer, FramebufferSpec};

    fn ready_device() -> (Arc<GraphicsDevice>, HeadlessProbe) {
        let factory = HeadlessFactory::new();
        let probe = factory.probe();
        let device = GraphicsDevice::new(Box::new(factory), DeviceSettings::default(), false);
        assert!(device.initialize(Some(OffscreenWindow::shared(320, 240)), 320, 240));
        (device, probe)
    }

    #[test]
    fn test_submit_twice_is_rejected() {
        let (device, _probe) = ready_device();
        let mut cmd = CommandBuffer::new(&device);
        cmd.start().unwrap();
        cmd.end(false).unwrap();
        assert_eq!(cmd.submit(false).unwrap(), Submission::Submitted);

        let err = cmd.submit(false).unwrap_err();
        assert_eq!(err.downcast_ref::<CommandError>(), Some(&CommandError::AlreadySubmitted));

        cmd.start().unwrap();
        assert_eq!(cmd.state(), CommandBufferState::Recording);
    }

    #[test]
    fn test_encode_outside_recording_fails() {
        let (device, _probe) = ready_device();
        let mut cmd = CommandBuffer::new(&device);
        let err = cmd.encode(&Command::EndRendering).unwrap_err();
        assert_eq!(
            err.downcast_ref::<CommandError>(),
            Some(&CommandError::NotRecording(CommandBufferState::Initial))
        );
    }

    #[test]
    fn test_intermediate_pass_keeps_frame_slot() {
        let (device, probe) = ready_device();
        let mut cmd = CommandBuffer::new(&device);
        cmd.set_should_present(true);

        cmd.start().unwrap();
        cmd.end(false).unwrap();
        assert_eq!(cmd.submit(false).unwrap(), Submission::Submitted);
        assert!(!cmd.is_first_pass());
        assert_eq!(cmd.frame_slot(), 0);

        cmd.start().unwrap();
        cmd.end(true).unwrap();
        assert_eq!(cmd.submit(true).unwrap(), Submission::Presented);
        assert!(cmd.is_first_pass());
        assert_eq!(cmd.frame_slot(), 1);

        let log = probe.log();
        assert_eq!(log.acquires, 1);
        assert_eq!(log.presents, 1);
    }

    #[test]
    fn test_present_blits_source_attachment() {
        let (device, probe) = ready_device();
        let fb = Framebuffer::create(&device, FramebufferSpec::new("scene", 320, 240).attachment(Format::Rgba8)).unwrap();

        let mut cmd = CommandBuffer::new(&device);
        cmd.set_should_present(true);
        cmd.set_source_framebuffer(Some(Arc::clone(&fb)));
        cmd.start().unwrap();
        cmd.end(true).unwrap();
        cmd.submit(true).unwrap();

        let log = probe.log();
        assert_eq!(log.count("CopyImage"), 1);
        let layouts: Vec<_> = log.transitions().iter().map(|t| t.2).collect();
        assert_eq!(
            layouts,
            vec![
                ImageLayout::TransferSrc,
                ImageLayout::TransferDst,
                ImageLayout::General,
                ImageLayout::Present
            ]
        );
        assert_eq!(fb.lock().attachment(0).unwrap().layout(), ImageLayout::General);
    }

    #[test]
    fn test_stale_acquire_skips_frame() {
        let (device, probe) = ready_device();
        probe.script(|s| s.acquire_out_of_date = 1);

        let mut cmd = CommandBuffer::new(&device);
        cmd.set_should_present(true);
        cmd.start().unwrap();

        assert!(cmd.is_skipped());
        assert_eq!(cmd.state(), CommandBufferState::Initial);
        let log = probe.log();
        assert_eq!(log.command_begins, 0);
        assert_eq!(log.swapchain_recreations, 1);
    }

    #[test]
    fn test_stale_present_rebuilds_swapchain() {
        let (device, probe) = ready_device();
        probe.script(|s| s.present_out_of_date = 1);

        let mut cmd = CommandBuffer::new(&device);
        cmd.set_should_present(true);
        cmd.start().unwrap();
        cmd.end(true).unwrap();
        assert_eq!(cmd.submit(true).unwrap(), Submission::OutOfDate);
        assert_eq!(probe.log().swapchain_recreations, 1);
        assert!(cmd.is_first_pass());
    }
}
