// Typed error conditions
//
// Fallible work returns `anyhow::Result`; the variants below travel inside
// it when a caller needs to branch, and are recovered with `downcast_ref`.

use thiserror::Error;

use crate::backend::Extent2D;
use crate::command::CommandBufferState;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("No window was provided for surface creation")]
    MissingWindow,

    #[error("Unsupported feature level: {0}")]
    UnsupportedFeatureLevel(String),

    #[error("Backend creation failed: {0}")]
    Creation(String),

    #[error("GPU device lost")]
    DeviceLost,

    #[error("Graphics device is not initialized")]
    NotInitialized,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("Command buffer submitted twice without an intervening start")]
    AlreadySubmitted,

    #[error("Command buffer is not recording (state: {0:?})")]
    NotRecording(CommandBufferState),

    #[error("Command buffer is not executable (state: {0:?})")]
    NotExecutable(CommandBufferState),

    #[error("Attachment index {index} out of range ({count} attachments)")]
    AttachmentOutOfRange { index: usize, count: usize },

    #[error("Pixel ({x}, {y}) lies outside the {extent} attachment")]
    PixelOutOfBounds { x: u32, y: u32, extent: Extent2D },

    #[error("Framebuffer images have not been created yet")]
    NotRealized,
}

/// True when `err` carries `DeviceError::DeviceLost` anywhere in its chain
pub fn is_device_lost(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| matches!(cause.downcast_ref::<DeviceError>(), Some(DeviceError::DeviceLost)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_device_lost_survives_context() {
        let err: anyhow::Result<()> = Err(DeviceError::DeviceLost.into());
        let err = err.context("Failed to submit frame").unwrap_err();
        assert!(is_device_lost(&err));
    }

    #[test]
    fn test_other_errors_are_not_device_lost() {
        let err = anyhow::Error::from(DeviceError::MissingWindow);
        assert!(!is_device_lost(&err));
        assert_eq!(err.to_string(), "No window was provided for surface creation");
    }
}
