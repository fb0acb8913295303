// 2D textures with a CPU copy of their pixels
//
// Uploading happens on first use and again whenever the backend has been
// recreated, so a texture can be made before the device exists and
// survives device loss.

use std::sync::Arc;

use anyhow::{bail, Result};
use parking_lot::Mutex;

use crate::backend::{Format, TextureDesc, TextureHandle};
use crate::device::GraphicsDevice;

pub struct Texture2D {
    device: Arc<GraphicsDevice>,
    label: String,
    width: u32,
    height: u32,
    pixels: Vec<u8>,
    // Native texture and the backend generation it was uploaded to
    gpu: Mutex<Option<(TextureHandle, u64)>>,
}

impl Texture2D {
    /// Tightly packed RGBA8 pixels, rows top to bottom
    pub fn from_rgba8(
        device: &Arc<GraphicsDevice>,
        label: impl Into<String>,
        width: u32,
        height: u32,
        pixels: Vec<u8>,
    ) -> Result<Arc<Self>> {
        let label = label.into();
        let expected = width as usize * height as usize * 4;
        if width == 0 || height == 0 {
            bail!("Texture '{}' has zero size", label);
        }
        if pixels.len() != expected {
            bail!("Texture '{}' needs {} bytes of RGBA8 data, got {}", label, expected, pixels.len());
        }
        Ok(Arc::new(Self {
            device: Arc::clone(device),
            label,
            width,
            height,
            pixels,
            gpu: Mutex::new(None),
        }))
    }

    /// 1×1 texture of one colour
    pub fn solid(device: &Arc<GraphicsDevice>, label: impl Into<String>, rgba: [u8; 4]) -> Result<Arc<Self>> {
        Self::from_rgba8(device, label, 1, 1, rgba.to_vec())
    }

    pub fn white(device: &Arc<GraphicsDevice>) -> Result<Arc<Self>> {
        Self::solid(device, "white", [0xff; 4])
    }

    /// Native handle on the live backend, uploading first if needed
    pub fn handle(&self) -> Result<TextureHandle> {
        let mut gpu = self.gpu.lock();
        if let Some((handle, generation)) = *gpu {
            if generation == self.device.generation() && self.device.is_initialized() {
                return Ok(handle);
            }
        }

        let handle = self.device.create_texture(
            &TextureDesc {
                label: self.label.clone(),
                width: self.width,
                height: self.height,
                format: Format::Rgba8,
            },
            &self.pixels,
        )?;
        *gpu = Some((handle, self.device.generation()));
        log::debug!("Uploaded texture '{}' ({}x{})", self.label, self.width, self.height);
        Ok(handle)
    }

    pub fn is_uploaded(&self) -> bool {
        matches!(*self.gpu.lock(), Some((_, generation)) if generation == self.device.generation())
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }
}

impl Drop for Texture2D {
    fn drop(&mut self) {
        if let Some((handle, generation)) = self.gpu.lock().take() {
            if generation == self.device.generation() {
                self.device.destroy_texture(handle);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DeviceSettings, HeadlessFactory, HeadlessProbe, OffscreenWindow};

    fn device(lazy: bool) -> (Arc<GraphicsDevice>, HeadlessProbe) {
        let factory = HeadlessFactory::new();
        let probe = factory.probe();
        let device = GraphicsDevice::new(Box::new(factory), DeviceSettings::default(), lazy);
        assert!(device.initialize(Some(OffscreenWindow::shared(64, 64)), 64, 64));
        (device, probe)
    }

    #[test]
    fn test_rejects_wrong_pixel_count() {
        let (device, _probe) = device(false);
        assert!(Texture2D::from_rgba8(&device, "bad", 2, 2, vec![0; 15]).is_err());
        assert!(Texture2D::from_rgba8(&device, "empty", 0, 2, Vec::new()).is_err());
    }

    #[test]
    fn test_uploads_once_per_backend() {
        let (device, probe) = device(true);
        let texture = Texture2D::white(&device).unwrap();
        assert!(!texture.is_uploaded());
        assert_eq!(probe.log().backends_created, 0);

        let first = texture.handle().unwrap();
        assert_eq!(texture.handle().unwrap(), first);
        assert_eq!(probe.log().textures_created, 1);

        assert!(device.recover_device_lost());
        assert!(!texture.is_uploaded());
        texture.handle().unwrap();
        assert_eq!(probe.log().textures_created, 2);
    }

    #[test]
    fn test_drop_releases_native_texture() {
        let (device, probe) = device(false);
        let texture = Texture2D::solid(&device, "red", [255, 0, 0, 255]).unwrap();
        texture.handle().unwrap();
        drop(texture);
        assert_eq!(probe.log().textures_destroyed, 1);
    }
}
