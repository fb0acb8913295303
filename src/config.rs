// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every section falls back to defaults, so a partial or missing file still
// gives a runnable setup.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::backend::{BackendKind, DeviceSettings, PresentMode};
use crate::renderer2d::Renderer2DSettings;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub renderer2d: Renderer2DConfig,
    pub debug: DebugConfig,
    pub controls: ControlsConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Flint 2D".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    /// "vulkan" or "headless"
    pub backend: String,
    pub present_mode: String,
    pub clear_color: [f32; 4],
    pub max_frames_in_flight: usize,
    /// Create the device on first use instead of at window creation
    pub lazy_init: bool,
    pub msaa_samples: u32,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            backend: "vulkan".to_string(),
            present_mode: "fifo".to_string(),
            clear_color: [0.1, 0.1, 0.12, 1.0],
            max_frames_in_flight: 2,
            lazy_init: false,
            msaa_samples: 1,
        }
    }
}

/// Batch renderer settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Renderer2DConfig {
    pub max_quads: u32,
    /// Upper bound; the device limit can lower it further
    pub max_texture_slots: u32,
    pub line_width: f32,
    pub shader_dir: PathBuf,
}

impl Default for Renderer2DConfig {
    fn default() -> Self {
        let defaults = Renderer2DSettings::default();
        Self {
            max_quads: defaults.max_quads,
            max_texture_slots: defaults.max_texture_slots,
            line_width: defaults.line_width,
            shader_dir: PathBuf::from("shaders"),
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
    /// Rebuild pipelines when compiled shaders change on disk
    pub watch_shaders: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_to_file: false,
            log_file: "flint_debug.log".to_string(),
            show_fps: true,
            watch_shaders: false,
        }
    }
}

/// Control key bindings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ControlsConfig {
    pub fullscreen_key: String,
    pub quit_key: String,
}

impl Default for ControlsConfig {
    fn default() -> Self {
        Self {
            fullscreen_key: "F11".to_string(),
            quit_key: "Escape".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Backend selected by `graphics.backend`
    pub fn backend_kind(&self) -> BackendKind {
        match self.graphics.backend.to_lowercase().as_str() {
            "vulkan" => BackendKind::Vulkan,
            "headless" => BackendKind::Headless,
            other => {
                log::warn!("Unknown backend '{}', defaulting to Vulkan", other);
                BackendKind::Vulkan
            }
        }
    }

    pub fn present_mode(&self) -> PresentMode {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => PresentMode::Immediate,
            "mailbox" => PresentMode::Mailbox,
            "fifo" => PresentMode::Fifo,
            "fifo_relaxed" => PresentMode::FifoRelaxed,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to FIFO",
                    self.graphics.present_mode
                );
                PresentMode::Fifo
            }
        }
    }

    pub fn device_settings(&self) -> DeviceSettings {
        DeviceSettings {
            app_name: self.window.title.clone(),
            enable_validation: cfg!(debug_assertions) && self.debug.validation_layers,
            frames_in_flight: self.graphics.max_frames_in_flight.max(1),
            present_mode: self.present_mode(),
        }
    }

    pub fn renderer_settings(&self) -> Renderer2DSettings {
        Renderer2DSettings {
            max_quads: self.renderer2d.max_quads,
            max_texture_slots: self.renderer2d.max_texture_slots,
            line_width: self.renderer2d.line_width,
        }
    }
}
