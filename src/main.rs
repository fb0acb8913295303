// =============================================================================
// FLINT DEMO - batched 2D rendering on the lazy submission core
// =============================================================================
//
// FRAME FLOW:
// 1. CommandList::begin      (waits for the slot, acquires the swapchain image)
// 2. begin_rendering          (attachments to attachment layouts, clear)
// 3. BatchRenderer scene      (quads, circles, lines → a few draw calls)
// 4. execute                  (replay, blit to swapchain, submit, present)
//
// Run with `--headless` to drive the same frames through the recording
// backend without a window, e.g. `flint-demo --headless --frames 120`.
//
// =============================================================================

use anyhow::{bail, Context, Result};
use flint_gfx::backend::{factory_for, BackendKind, Format, OffscreenWindow, SurfaceWindow};
use flint_gfx::camera::OrthographicCamera;
use flint_gfx::command::{CommandList, Submission};
use flint_gfx::config::Config;
use flint_gfx::device::GraphicsDevice;
use flint_gfx::framebuffer::{Framebuffer, FramebufferSpec, SharedFramebuffer, NO_ENTITY};
use flint_gfx::renderer2d::{BatchRenderer, Circle, Quad, Shaders2D};
use flint_gfx::texture::Texture2D;
use flint_gfx::watcher::ShaderWatcher;
use glam::{Mat4, Vec2, Vec3, Vec4};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::{ElementState, MouseButton, WindowEvent},
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Fullscreen, Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml
    let config = Config::load();

    init_logging(&config);
    let args = Args::parse(std::env::args().skip(1))?;
    log::info!("Starting Flint demo");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!("Present mode: {}", config.graphics.present_mode);

    if args.headless || config.backend_kind() == BackendKind::Headless {
        return run_headless(&config, args.frames);
    }

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

/// Initialize logging with optional file output
fn init_logging(config: &Config) {
    use env_logger::{Builder, Env};

    Builder::from_env(Env::default().default_filter_or("info")).init();

    // Create/clear log file if enabled
    if config.debug.log_to_file {
        if let Ok(mut file) = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
        {
            let _ = writeln!(file, "=== Flint Demo Log ===");
            let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
            let _ = writeln!(file);
        }
    }
}

#[derive(Debug, Default)]
struct Args {
    headless: bool,
    frames: Option<u64>,
}

impl Args {
    fn parse(mut args: impl Iterator<Item = String>) -> Result<Self> {
        let mut parsed = Args::default();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--headless" => parsed.headless = true,
                "--frames" => {
                    let value = args.next().context("--frames needs a count")?;
                    parsed.frames = Some(value.parse().with_context(|| format!("Invalid frame count '{}'", value))?);
                }
                other => bail!("Unknown argument '{}' (expected --headless or --frames N)", other),
            }
        }
        Ok(parsed)
    }
}

// =============================================================================
// HEADLESS RUN
// =============================================================================

fn run_headless(config: &Config, frames: Option<u64>) -> Result<()> {
    let frames = frames.unwrap_or(60);
    let (width, height) = (config.window.width, config.window.height);
    let device = GraphicsDevice::new(
        factory_for(BackendKind::Headless),
        config.device_settings(),
        config.graphics.lazy_init,
    );
    if !device.initialize(Some(OffscreenWindow::shared(width, height)), width, height) {
        bail!(
            "Device initialization failed: {}",
            device.last_error().unwrap_or_default()
        );
    }

    let mut demo = Demo::new(&device, config)?;
    let mut presented = 0;
    for _ in 0..frames {
        if demo.render_frame()? == Submission::Presented {
            presented += 1;
        }
    }

    let stats = demo.renderer.stats();
    log::info!(
        "{} frames, {} presented: {} draw calls, {} quads, {} circles, {} lines",
        frames,
        presented,
        stats.draw_calls,
        stats.quad_count,
        stats.circle_count,
        stats.line_count
    );
    match demo.pick(width / 2, height / 2)? {
        Some(entity) => log::info!("Entity under the centre pixel: {}", entity),
        None => log::info!("Nothing pickable under the centre pixel"),
    }

    drop(demo);
    device.shutdown();
    Ok(())
}

// =============================================================================
// DEMO SCENE
// =============================================================================

const GRID: i32 = 24;
const SPINNER_ENTITY: i32 = 10_000;

/// Everything one frame of the demo needs
struct Demo {
    device: Arc<GraphicsDevice>,
    /// Scene target: colour + entity ids, or colour only when multisampled
    target: SharedFramebuffer,
    /// Single-sample copy of `target` when MSAA is on
    resolve: Option<SharedFramebuffer>,
    renderer: BatchRenderer,
    cmd: CommandList,
    camera: OrthographicCamera,
    checker: Arc<Texture2D>,
    watcher: Option<ShaderWatcher>,
    shader_dir: PathBuf,
    clear_color: [f32; 4],
    start: Instant,
}

impl Demo {
    fn new(device: &Arc<GraphicsDevice>, config: &Config) -> Result<Self> {
        let caps = device
            .capabilities()
            .with_context(|| format!("No GPU device: {}", device.last_error().unwrap_or_default()))?;
        let samples = config.graphics.msaa_samples.clamp(1, caps.max_samples.max(1));

        let (target, resolve) = if samples > 1 {
            log::info!("MSAA x{}: entity picking disabled", samples);
            let target = Framebuffer::create(
                device,
                FramebufferSpec::new("scene msaa", config.window.width, config.window.height)
                    .attachment(Format::Rgba8)
                    .samples(samples)
                    .window_relative(),
            )?;
            let resolve = Framebuffer::create(
                device,
                FramebufferSpec::new("scene resolved", config.window.width, config.window.height)
                    .attachment(Format::Rgba8)
                    .window_relative(),
            )?;
            (target, Some(resolve))
        } else {
            let target = Framebuffer::create(
                device,
                FramebufferSpec::new("scene", config.window.width, config.window.height)
                    .attachment(Format::Rgba8)
                    .attachment(Format::RedInt)
                    .window_relative(),
            )?;
            (target, None)
        };

        let shader_dir = config.renderer2d.shader_dir.clone();
        let shaders = load_shaders(device, &shader_dir)?;
        let renderer = BatchRenderer::new(device, &target.lock(), &shaders, config.renderer_settings())?;

        let mut cmd = CommandList::new(device);
        cmd.set_source_framebuffer(resolve.as_ref().unwrap_or(&target))?;
        cmd.set_should_present(true)?;

        let watcher = if config.debug.watch_shaders && device.kind() != BackendKind::Headless {
            match ShaderWatcher::new(&shader_dir) {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    log::warn!("Shader hot reload unavailable: {:#}", e);
                    None
                }
            }
        } else {
            None
        };

        let extent = device.surface_extent();
        let mut demo = Self {
            device: Arc::clone(device),
            target,
            resolve,
            renderer,
            cmd,
            camera: OrthographicCamera::with_aspect(1.0, 1.0),
            checker: checkerboard(device)?,
            watcher,
            shader_dir,
            clear_color: config.graphics.clear_color,
            start: Instant::now(),
        };
        demo.set_aspect(extent.width, extent.height);
        Ok(demo)
    }

    fn set_aspect(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        let aspect = width as f32 / height as f32;
        self.camera.set_projection(-aspect, aspect, -1.0, 1.0);
    }

    fn render_frame(&mut self) -> Result<Submission> {
        self.poll_shaders();
        let time = self.start.elapsed().as_secs_f32();

        self.cmd.begin()?;
        self.cmd.begin_rendering(&self.target, Some(self.clear_color))?;
        {
            let mut scene = self
                .renderer
                .begin_scene_with_view(&mut self.cmd, self.camera.view_projection())?;

            // Background grid, one pickable entity per cell
            let cell = 1.8 / GRID as f32;
            for y in 0..GRID {
                for x in 0..GRID {
                    let position = Vec3::new(
                        -0.9 + (x as f32 + 0.5) * cell,
                        -0.9 + (y as f32 + 0.5) * cell,
                        0.0,
                    );
                    let color = Vec4::new(x as f32 / GRID as f32, 0.35, y as f32 / GRID as f32, 1.0);
                    scene.draw_quad(&Quad::new(position, Vec2::splat(cell * 0.9), color).with_entity(y * GRID + x))?;
                }
            }

            scene.draw_quad(
                &Quad::rotated(Vec3::new(0.0, 0.0, 0.1), Vec2::splat(0.6), time * 45.0, Vec4::ONE)
                    .with_texture(Arc::clone(&self.checker), 4.0)
                    .with_entity(SPINNER_ENTITY),
            )?;

            for i in 0..8 {
                let angle = time + i as f32 * std::f32::consts::TAU / 8.0;
                let center = Vec3::new(angle.cos() * 0.75, angle.sin() * 0.75, 0.2);
                scene.draw_circle(&Circle::new(center, 0.08, Vec4::new(1.0, 0.8, 0.2, 1.0)).outline(0.3))?;
                scene.draw_line(Vec3::ZERO, center, Vec4::new(1.0, 1.0, 1.0, 0.5))?;
            }

            let frame = Mat4::from_scale(Vec3::new(1.9, 1.9, 1.0));
            scene.draw_rect(&frame, Vec4::new(0.9, 0.9, 0.9, 1.0))?;
            scene.end()?;
        }
        self.cmd.end_rendering();

        if let Some(resolve) = &self.resolve {
            self.cmd.resolve_framebuffer(&self.target, resolve)?;
        }
        self.cmd.execute(true)
    }

    /// Entity id under a framebuffer pixel, if any
    fn pick(&self, x: u32, y: u32) -> Result<Option<i32>> {
        if self.resolve.is_some() {
            return Ok(None);
        }
        let entity = self.target.lock().read_pixel(1, x, y)?;
        Ok((entity != NO_ENTITY).then_some(entity))
    }

    fn poll_shaders(&mut self) {
        let Some(watcher) = &self.watcher else {
            return;
        };
        let changed = watcher.poll();
        if changed.is_empty() {
            return;
        }
        log::info!("Shaders changed: {:?}", changed);
        let result = Shaders2D::load(&self.shader_dir).and_then(|shaders| self.renderer.reload_shaders(&shaders));
        match result {
            Ok(()) => log::info!("Reloaded 2D pipelines"),
            Err(e) => log::warn!("Shader reload failed, keeping previous pipelines: {:#}", e),
        }
    }
}

fn load_shaders(device: &GraphicsDevice, dir: &std::path::Path) -> Result<Shaders2D> {
    if device.kind() == BackendKind::Headless {
        return Ok(Shaders2D::default());
    }
    Shaders2D::load(dir).context("Compiled shaders missing; install glslc and rebuild")
}

fn checkerboard(device: &Arc<GraphicsDevice>) -> Result<Arc<Texture2D>> {
    const SIZE: u32 = 8;
    let pixels = (0..SIZE * SIZE)
        .flat_map(|i| {
            let (x, y) = (i % SIZE, i / SIZE);
            if (x + y) % 2 == 0 {
                [0xff, 0xff, 0xff, 0xff]
            } else {
                [0x30, 0x30, 0x38, 0xff]
            }
        })
        .collect();
    Texture2D::from_rgba8(device, "checkerboard", SIZE, SIZE, pixels)
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

struct App {
    config: Config,
    window: Option<Arc<Window>>,
    device: Option<Arc<GraphicsDevice>>,
    demo: Option<Demo>,
    fullscreen_key: Option<KeyCode>,
    quit_key: Option<KeyCode>,
    is_fullscreen: bool,
    is_minimized: bool,
    cursor: (f64, f64),

    // FPS tracking
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let now = Instant::now();
        Self {
            fullscreen_key: parse_key(&config.controls.fullscreen_key),
            quit_key: parse_key(&config.controls.quit_key),
            is_fullscreen: config.window.fullscreen,
            config,
            window: None,
            device: None,
            demo: None,
            is_minimized: false,
            cursor: (0.0, 0.0),
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    fn init_graphics(&mut self, window: Arc<Window>) -> Result<()> {
        let size = window.inner_size();
        let device = GraphicsDevice::new(
            factory_for(self.config.backend_kind()),
            self.config.device_settings(),
            self.config.graphics.lazy_init,
        );
        device.set_init_callback(|ok, message| {
            if ok {
                log::info!("Graphics device ready");
            } else {
                log::error!("Graphics device failed: {}", message);
            }
        });

        let surface: Arc<dyn SurfaceWindow> = window.clone();
        if !device.initialize(Some(surface), size.width, size.height) {
            bail!(
                "Device initialization failed: {}",
                device.last_error().unwrap_or_default()
            );
        }

        self.demo = Some(Demo::new(&device, &self.config)?);
        self.device = Some(device);
        Ok(())
    }

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }
        }
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.is_minimized = width == 0 || height == 0;
        if let Some(ref device) = self.device {
            if let Err(e) = device.resize_surface(width, height) {
                log::error!("Resize failed: {:#}", e);
            }
        }
        if let Some(ref mut demo) = self.demo {
            demo.set_aspect(width, height);
        }
    }

    fn pick_under_cursor(&self) {
        let Some(ref demo) = self.demo else {
            return;
        };
        let (x, y) = (self.cursor.0.max(0.0) as u32, self.cursor.1.max(0.0) as u32);
        match demo.pick(x, y) {
            Ok(Some(entity)) => log::info!("Picked entity {} at ({}, {})", entity, x, y),
            Ok(None) => log::info!("Nothing to pick at ({}, {})", x, y),
            Err(e) => log::warn!("Pick failed: {:#}", e),
        }
    }

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        // Update title every second
        if now.duration_since(self.last_fps_update).as_secs_f32() >= 1.0 {
            let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
            let fps = self.frame_count as f32 / elapsed;

            if let (Some(window), Some(demo)) = (&self.window, &self.demo) {
                let stats = demo.renderer.stats();
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms) [{} draw calls]",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0,
                    stats.draw_calls / self.frame_count.max(1)
                ));
            }
            if let Some(ref mut demo) = self.demo {
                demo.renderer.reset_stats();
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

fn parse_key(name: &str) -> Option<KeyCode> {
    let key = match name.to_lowercase().as_str() {
        "escape" | "esc" => KeyCode::Escape,
        "f10" => KeyCode::F10,
        "f11" => KeyCode::F11,
        "f12" => KeyCode::F12,
        "q" => KeyCode::KeyQ,
        "f" => KeyCode::KeyF,
        "space" => KeyCode::Space,
        "enter" => KeyCode::Enter,
        _ => {
            log::warn!("Unknown key binding '{}'", name);
            return None;
        }
    };
    Some(key)
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_graphics(window.clone()) {
            log::error!("Failed to initialize graphics: {:#}", e);
            event_loop.exit();
            return;
        }

        self.window = Some(window);
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: winit::window::WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                self.resize(size.width, size.height);
            }

            WindowEvent::RedrawRequested => {
                if self.is_minimized {
                    return;
                }
                let Some(ref mut demo) = self.demo else {
                    return;
                };
                match demo.render_frame() {
                    Ok(Submission::Presented | Submission::Submitted) => self.update_fps(),
                    Ok(other) => log::debug!("Frame not presented: {:?}", other),
                    Err(e) => log::error!("Render error: {:#}", e),
                }
            }

            WindowEvent::CursorMoved { position, .. } => {
                self.cursor = (position.x, position.y);
            }

            WindowEvent::MouseInput {
                state: ElementState::Pressed,
                button: MouseButton::Left,
                ..
            } => self.pick_under_cursor(),

            WindowEvent::KeyboardInput { event, .. } => {
                if event.state.is_pressed() && !event.repeat {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        if Some(key) == self.quit_key {
                            log::info!("{:?} pressed, exiting...", key);
                            event_loop.exit();
                        } else if Some(key) == self.fullscreen_key {
                            self.toggle_fullscreen();
                        }
                    }
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

// =============================================================================
// CLEANUP
// =============================================================================

impl Drop for App {
    fn drop(&mut self) {
        log::info!("Cleaning up graphics resources...");

        // GPU objects before the device that owns them
        self.demo = None;
        if let Some(device) = self.device.take() {
            device.shutdown();
        }

        log::info!("Cleanup complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Result<Args> {
        Args::parse(list.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_args() {
        let parsed = args(&["--headless", "--frames", "12"]).unwrap();
        assert!(parsed.headless);
        assert_eq!(parsed.frames, Some(12));
        assert!(args(&["--frames"]).is_err());
        assert!(args(&["--fast"]).is_err());
    }

    #[test]
    fn test_key_names() {
        assert_eq!(parse_key("Escape"), Some(KeyCode::Escape));
        assert_eq!(parse_key("f11"), Some(KeyCode::F11));
        assert_eq!(parse_key("Hyper"), None);
    }

    #[test]
    fn test_headless_demo_presents_and_picks() {
        let mut config = Config::default();
        config.window.width = 64;
        config.window.height = 48;
        let device = GraphicsDevice::new(factory_for(BackendKind::Headless), config.device_settings(), false);
        assert!(device.initialize(Some(OffscreenWindow::shared(64, 48)), 64, 48));

        let mut demo = Demo::new(&device, &config).unwrap();
        assert_eq!(demo.render_frame().unwrap(), Submission::Presented);
        assert_eq!(demo.render_frame().unwrap(), Submission::Presented);
        // Quads, circles and lines each batch into one draw per frame
        assert_eq!(demo.renderer.stats().draw_calls, 6);
        demo.pick(32, 24).unwrap();
    }
}
