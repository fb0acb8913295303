// Graphics device - owner of the live backend
//
// Creation is either eager (`initialize` builds the backend right away) or
// lazy (`initialize` only records the window; the first `ensure_initialized`
// or `backend()` call builds it). Work issued before the device is ready
// goes through the deferred queue and runs, in order, once it is.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use anyhow::Result;
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};

use crate::backend::{
    Backend, BackendFactory, BackendKind, BufferDesc, BufferHandle, CmdTarget, DeviceCapabilities,
    DeviceSettings, Extent2D, ImageDesc, ImageHandle, PipelineDesc, PipelineHandle, SurfaceWindow,
    TextureDesc, TextureHandle, UiTextureId,
};
use crate::command::Command;
use crate::deferred::DeferredInitManager;
use crate::error::{is_device_lost, DeviceError};
use crate::framebuffer::{Framebuffer, SharedFramebuffer};

/// Work that needs a ready device
pub type DeviceTask = Box<dyn FnOnce(&GraphicsDevice) + Send>;

type InitCallback = Box<dyn Fn(bool, &str) + Send + Sync>;
type StateCallback = Box<dyn Fn(DeviceState, DeviceState) + Send + Sync>;
type ResourceCallback = Box<dyn Fn(&str, bool) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceState {
    Uninitialized,
    Initializing,
    Ready,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub start_time: Option<Instant>,
    pub end_time: Option<Instant>,
    pub resources_created: u64,
    pub resources_destroyed: u64,
}

impl DeviceStats {
    /// Wall time the last backend creation took
    pub fn init_duration(&self) -> Option<Duration> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some(end.saturating_duration_since(start)),
            _ => None,
        }
    }
}

struct InitState {
    window: Option<Arc<dyn SurfaceWindow>>,
    extent: Extent2D,
    initialization_attempted: bool,
    cached_result: Option<bool>,
    state: DeviceState,
    last_error: Option<String>,
    start_time: Option<Instant>,
    end_time: Option<Instant>,
}

/// Notifications collected under the init lock and fired after it
enum Event {
    State(DeviceState, DeviceState),
    Init(bool, String),
}

#[derive(Default)]
struct Callbacks {
    init: Option<InitCallback>,
    state: Option<StateCallback>,
    resource: Option<ResourceCallback>,
}

pub struct GraphicsDevice {
    factory: Box<dyn BackendFactory>,
    settings: DeviceSettings,
    lazy: bool,
    // Lock order: init → backend. Never take `init` while holding `backend`.
    init: Mutex<InitState>,
    backend: Mutex<Option<Box<dyn Backend>>>,
    initialized: AtomicBool,
    generation: AtomicU64,
    deferred: DeferredInitManager<DeviceTask>,
    framebuffers: Mutex<Vec<Weak<Mutex<Framebuffer>>>>,
    callbacks: Mutex<Callbacks>,
    resources_created: AtomicU64,
    resources_destroyed: AtomicU64,
}

impl GraphicsDevice {
    pub fn new(factory: Box<dyn BackendFactory>, settings: DeviceSettings, lazy: bool) -> Arc<Self> {
        log::info!(
            "Graphics device: {} backend, {} initialization",
            factory.kind(),
            if lazy { "lazy" } else { "eager" }
        );
        Arc::new(Self {
            factory,
            settings,
            lazy,
            init: Mutex::new(InitState {
                window: None,
                extent: Extent2D::default(),
                initialization_attempted: false,
                cached_result: None,
                state: DeviceState::Uninitialized,
                last_error: None,
                start_time: None,
                end_time: None,
            }),
            backend: Mutex::new(None),
            initialized: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            deferred: DeferredInitManager::new(),
            framebuffers: Mutex::new(Vec::new()),
            callbacks: Mutex::new(Callbacks::default()),
            resources_created: AtomicU64::new(0),
            resources_destroyed: AtomicU64::new(0),
        })
    }

    // ========================================================================
    // Initialization
    // ========================================================================

    /// Record the window and, unless lazy, create the backend.
    ///
    /// Only the first call does anything; later calls return its result.
    /// Lazy mode returns `true` without touching the GPU.
    pub fn initialize(&self, window: Option<Arc<dyn SurfaceWindow>>, width: u32, height: u32) -> bool {
        let mut events = Vec::new();
        let ok = {
            let mut init = self.init.lock();
            if let Some(result) = init.cached_result {
                return result;
            }
            init.window = window;
            init.extent = Extent2D::new(width, height);
            init.initialization_attempted = true;

            if self.lazy {
                log::info!("Lazy initialization: device creation deferred until first use");
                init.cached_result = Some(true);
                return true;
            }

            let ok = self.create_backend(&mut init, &mut events);
            init.cached_result = Some(ok);
            ok
        };

        self.notify(events);
        if ok {
            self.process_deferred();
        }
        ok
    }

    /// Create the backend if it does not exist yet.
    ///
    /// Safe to call repeatedly and from several threads; a failed attempt
    /// is retried on the next call.
    pub fn ensure_initialized(&self) -> bool {
        if self.is_initialized() {
            return true;
        }

        let mut events = Vec::new();
        let ok = {
            let mut init = self.init.lock();
            // Another caller may have finished while we waited
            if self.is_initialized() {
                true
            } else {
                self.create_backend(&mut init, &mut events)
            }
        };

        self.notify(events);
        if ok {
            self.process_deferred();
        }
        ok
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn initialization_attempted(&self) -> bool {
        self.init.lock().initialization_attempted
    }

    pub fn is_lazy(&self) -> bool {
        self.lazy
    }

    fn create_backend(&self, init: &mut InitState, events: &mut Vec<Event>) -> bool {
        Self::set_state(init, DeviceState::Initializing, events);
        init.start_time = Some(Instant::now());
        init.end_time = None;

        let Some(window) = init.window.clone() else {
            return self.fail(init, DeviceError::MissingWindow.into(), events);
        };
        let extent = if init.extent.is_zero() {
            window.inner_extent()
        } else {
            init.extent
        };

        match self.factory.create(window.as_ref(), extent, &self.settings) {
            Ok(backend) => {
                *self.backend.lock() = Some(backend);
                init.end_time = Some(Instant::now());
                init.last_error = None;
                self.generation.fetch_add(1, Ordering::AcqRel);
                self.initialized.store(true, Ordering::Release);
                Self::set_state(init, DeviceState::Ready, events);
                events.push(Event::Init(true, String::new()));

                let elapsed = init
                    .start_time
                    .zip(init.end_time)
                    .map(|(start, end)| end - start)
                    .unwrap_or_default();
                log::info!("Graphics device ready in {:.2?}", elapsed);
                true
            }
            Err(e) => self.fail(init, e, events),
        }
    }

    fn fail(&self, init: &mut InitState, err: anyhow::Error, events: &mut Vec<Event>) -> bool {
        let message = format!("{:#}", err);
        log::error!("Graphics device initialization failed: {}", message);
        init.end_time = Some(Instant::now());
        init.last_error = Some(message.clone());
        Self::set_state(init, DeviceState::Failed, events);
        events.push(Event::Init(false, message));
        false
    }

    fn set_state(init: &mut InitState, state: DeviceState, events: &mut Vec<Event>) {
        if init.state != state {
            events.push(Event::State(init.state, state));
            init.state = state;
        }
    }

    fn notify(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        let callbacks = self.callbacks.lock();
        for event in events {
            match event {
                Event::State(old, new) => {
                    if let Some(cb) = &callbacks.state {
                        cb(old, new);
                    }
                }
                Event::Init(ok, message) => {
                    if let Some(cb) = &callbacks.init {
                        cb(ok, &message);
                    }
                }
            }
        }
    }

    pub fn set_init_callback(&self, callback: impl Fn(bool, &str) + Send + Sync + 'static) {
        self.callbacks.lock().init = Some(Box::new(callback));
    }

    pub fn set_state_callback(&self, callback: impl Fn(DeviceState, DeviceState) + Send + Sync + 'static) {
        self.callbacks.lock().state = Some(Box::new(callback));
    }

    pub fn set_resource_callback(&self, callback: impl Fn(&str, bool) + Send + Sync + 'static) {
        self.callbacks.lock().resource = Some(Box::new(callback));
    }

    pub fn state(&self) -> DeviceState {
        self.init.lock().state
    }

    pub fn last_error(&self) -> Option<String> {
        self.init.lock().last_error.clone()
    }

    pub fn stats(&self) -> DeviceStats {
        let init = self.init.lock();
        DeviceStats {
            start_time: init.start_time,
            end_time: init.end_time,
            resources_created: self.resources_created.load(Ordering::Relaxed),
            resources_destroyed: self.resources_destroyed.load(Ordering::Relaxed),
        }
    }

    pub fn init_time(&self) -> Option<Duration> {
        self.stats().init_duration()
    }

    /// Bumped every time a backend is created; GPU handles from an older
    /// generation are gone
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn kind(&self) -> BackendKind {
        self.factory.kind()
    }

    pub fn frames_in_flight(&self) -> usize {
        self.settings.frames_in_flight.max(1)
    }

    // ========================================================================
    // Deferred work
    // ========================================================================

    /// Run `task` now if the device is ready, otherwise once it is
    pub fn run_when_ready(&self, task: impl FnOnce(&GraphicsDevice) + Send + 'static) {
        if self.is_initialized() {
            task(self);
        } else {
            log::debug!("Device not ready; deferring task");
            self.deferred.enqueue(Box::new(task));
        }
    }

    pub fn process_deferred(&self) -> usize {
        self.deferred.process(|| self.is_initialized(), |task| task(self))
    }

    pub fn has_deferred(&self) -> bool {
        self.deferred.has_pending()
    }

    // ========================================================================
    // Backend access
    // ========================================================================

    /// Lock the live backend, creating it first in lazy mode
    pub fn backend(&self) -> Option<MappedMutexGuard<'_, dyn Backend>> {
        if !self.is_initialized() && !(self.lazy && self.ensure_initialized()) {
            return None;
        }
        self.try_backend()
    }

    /// Lock the live backend if it exists; never creates it
    pub fn try_backend(&self) -> Option<MappedMutexGuard<'_, dyn Backend>> {
        MutexGuard::try_map(self.backend.lock(), |backend| backend.as_deref_mut()).ok()
    }

    pub fn capabilities(&self) -> Option<DeviceCapabilities> {
        self.backend().map(|b| b.capabilities().clone())
    }

    /// Size of the drawable surface
    pub fn surface_extent(&self) -> Extent2D {
        if let Some(backend) = self.try_backend() {
            let extent = backend.surface_extent();
            if !extent.is_zero() {
                return extent;
            }
        }
        self.init.lock().extent
    }

    pub fn is_minimized(&self) -> bool {
        self.init.lock().extent.is_zero()
    }

    fn resource_created(&self, name: &str) {
        self.resources_created.fetch_add(1, Ordering::Relaxed);
        if let Some(cb) = &self.callbacks.lock().resource {
            cb(name, true);
        }
    }

    fn resource_destroyed(&self, name: &str) {
        self.resources_destroyed.fetch_add(1, Ordering::Relaxed);
        if let Some(cb) = &self.callbacks.lock().resource {
            cb(name, false);
        }
    }

    pub fn create_image(&self, desc: &ImageDesc) -> Result<ImageHandle> {
        let image = self
            .backend()
            .ok_or(DeviceError::NotInitialized)?
            .create_image(desc)?;
        self.resource_created(&desc.label);
        Ok(image)
    }

    pub fn destroy_image(&self, image: ImageHandle) {
        let Some(mut backend) = self.try_backend() else {
            return;
        };
        backend.destroy_image(image);
        drop(backend);
        self.resource_destroyed("image");
    }

    pub fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferHandle> {
        let buffer = self
            .backend()
            .ok_or(DeviceError::NotInitialized)?
            .create_buffer(desc)?;
        self.resource_created(&desc.label);
        Ok(buffer)
    }

    pub fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<()> {
        self.try_backend()
            .ok_or(DeviceError::NotInitialized)?
            .write_buffer(buffer, offset, data)
    }

    pub fn read_buffer(&self, buffer: BufferHandle, offset: u64, out: &mut [u8]) -> Result<()> {
        self.try_backend()
            .ok_or(DeviceError::NotInitialized)?
            .read_buffer(buffer, offset, out)
    }

    pub fn destroy_buffer(&self, buffer: BufferHandle) {
        let Some(mut backend) = self.try_backend() else {
            return;
        };
        backend.destroy_buffer(buffer);
        drop(backend);
        self.resource_destroyed("buffer");
    }

    pub fn create_texture(&self, desc: &TextureDesc, pixels: &[u8]) -> Result<TextureHandle> {
        let texture = self
            .backend()
            .ok_or(DeviceError::NotInitialized)?
            .create_texture(desc, pixels)?;
        self.resource_created(&desc.label);
        Ok(texture)
    }

    pub fn destroy_texture(&self, texture: TextureHandle) {
        let Some(mut backend) = self.try_backend() else {
            return;
        };
        backend.destroy_texture(texture);
        drop(backend);
        self.resource_destroyed("texture");
    }

    pub fn create_pipeline(&self, desc: &PipelineDesc) -> Result<PipelineHandle> {
        let pipeline = self
            .backend()
            .ok_or(DeviceError::NotInitialized)?
            .create_pipeline(desc)?;
        self.resource_created(&desc.label);
        Ok(pipeline)
    }

    pub fn destroy_pipeline(&self, pipeline: PipelineHandle) {
        let Some(mut backend) = self.try_backend() else {
            return;
        };
        backend.destroy_pipeline(pipeline);
        drop(backend);
        self.resource_destroyed("pipeline");
    }

    pub fn register_ui_texture(&self, image: ImageHandle) -> Result<UiTextureId> {
        self.backend()
            .ok_or(DeviceError::NotInitialized)?
            .register_ui_texture(image)
    }

    pub fn release_ui_texture(&self, id: UiTextureId) {
        if let Some(mut backend) = self.try_backend() {
            backend.release_ui_texture(id);
        }
    }

    /// Record `commands` into a one-shot buffer, submit and wait
    pub fn immediate_submit(&self, commands: &[Command]) -> Result<()> {
        if commands.is_empty() {
            return Ok(());
        }
        let mut backend = self.backend().ok_or(DeviceError::NotInitialized)?;
        backend.begin_immediate()?;
        for command in commands {
            if let Err(e) = backend.encode(CmdTarget::Immediate, command) {
                let _ = backend.submit_immediate();
                return Err(e);
            }
        }
        backend.submit_immediate()
    }

    // ========================================================================
    // Surface and framebuffer tracking
    // ========================================================================

    /// Track a framebuffer so it follows surface resizes and device loss
    pub fn register_framebuffer(&self, framebuffer: &SharedFramebuffer) {
        let mut list = self.framebuffers.lock();
        list.retain(|fb| fb.strong_count() > 0);
        list.push(Arc::downgrade(framebuffer));
    }

    fn live_framebuffers(&self) -> Vec<SharedFramebuffer> {
        let mut list = self.framebuffers.lock();
        list.retain(|fb| fb.strong_count() > 0);
        list.iter().filter_map(Weak::upgrade).collect()
    }

    /// The window changed size
    ///
    /// Rebuilds the swapchain and every window-relative framebuffer. A zero
    /// size marks the surface minimized and leaves everything as is.
    pub fn resize_surface(&self, width: u32, height: u32) -> Result<()> {
        let extent = Extent2D::new(width, height);
        self.init.lock().extent = extent;
        if extent.is_zero() {
            log::debug!("Surface minimized");
            return Ok(());
        }

        if self.is_initialized() {
            self.recreate_swapchain(extent)?;
        }
        self.resize_window_framebuffers(extent);
        Ok(())
    }

    /// Acquire or present found the swapchain stale
    pub fn handle_surface_out_of_date(&self) -> Result<()> {
        let (window, stored) = {
            let init = self.init.lock();
            (init.window.clone(), init.extent)
        };
        let extent = window.map_or(stored, |w| w.inner_extent());
        self.resize_surface(extent.width, extent.height)
    }

    fn recreate_swapchain(&self, extent: Extent2D) -> Result<()> {
        let result = match self.try_backend() {
            Some(mut backend) => backend.recreate_swapchain(extent),
            None => return Ok(()),
        };
        match result {
            Err(e) if is_device_lost(&e) => {
                if self.recover_device_lost() {
                    Ok(())
                } else {
                    Err(e)
                }
            }
            other => other,
        }
    }

    fn resize_window_framebuffers(&self, extent: Extent2D) {
        for framebuffer in self.live_framebuffers() {
            let mut fb = framebuffer.lock();
            if !fb.is_window_relative() {
                continue;
            }
            if let Err(e) = fb.resize(extent.width, extent.height) {
                log::error!("Failed to resize framebuffer: {:#}", e);
            }
        }
    }

    /// Tear down and recreate the backend after the GPU reported loss
    ///
    /// Every registered framebuffer gets fresh images; other holders of GPU
    /// handles notice through `generation()`.
    pub fn recover_device_lost(&self) -> bool {
        log::warn!("GPU device lost; recreating backend");

        let old = self.backend.lock().take();
        self.initialized.store(false, Ordering::Release);
        if let Some(mut backend) = old {
            let _ = backend.wait_idle();
        }

        let framebuffers = self.live_framebuffers();
        for framebuffer in &framebuffers {
            framebuffer.lock().forget_images();
        }

        if !self.ensure_initialized() {
            return false;
        }

        for framebuffer in &framebuffers {
            if let Err(e) = framebuffer.lock().realize() {
                log::error!("Failed to recreate framebuffer after device loss: {:#}", e);
            }
        }
        true
    }

    /// Wait for the GPU and release the backend
    pub fn shutdown(&self) {
        let backend = self.backend.lock().take();
        let Some(mut backend) = backend else {
            return;
        };
        log::info!("Shutting down graphics device...");
        let _ = backend.wait_idle();
        self.initialized.store(false, Ordering::Release);
        self.deferred.clear();
        drop(backend);

        let mut events = Vec::new();
        Self::set_state(&mut self.init.lock(), DeviceState::Uninitialized, &mut events);
        self.notify(events);
    }
}

impl Drop for GraphicsDevice {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{HeadlessFactory, HeadlessProbe};
    use crate::backend::OffscreenWindow;
    use parking_lot::Mutex as PlMutex;
    use std::sync::atomic::AtomicUsize;

    fn device(lazy: bool) -> (Arc<GraphicsDevice>, HeadlessProbe) {
        let factory = HeadlessFactory::new();
        let probe = factory.probe();
        let device = GraphicsDevice::new(Box::new(factory), DeviceSettings::default(), lazy);
        (device, probe)
    }

    #[test]
    fn test_eager_initialize_creates_backend() {
        let (device, probe) = device(false);
        assert!(device.initialize(Some(OffscreenWindow::shared(800, 600)), 800, 600));
        assert!(device.is_initialized());
        assert_eq!(device.state(), DeviceState::Ready);
        assert_eq!(probe.log().backends_created, 1);
        assert!(device.init_time().is_some());
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let (device, probe) = device(false);
        assert!(device.initialize(Some(OffscreenWindow::shared(800, 600)), 800, 600));
        assert!(device.initialize(None, 1, 1));
        assert_eq!(probe.log().backends_created, 1);
        assert_eq!(device.surface_extent(), Extent2D::new(800, 600));
    }

    #[test]
    fn test_lazy_initialize_defers_creation() {
        let (device, probe) = device(true);
        assert!(device.initialize(Some(OffscreenWindow::shared(640, 480)), 640, 480));
        assert!(!device.is_initialized());
        assert!(device.initialization_attempted());
        assert_eq!(probe.log().backends_created, 0);

        assert!(device.backend().is_some());
        assert!(device.is_initialized());
        assert_eq!(probe.log().backends_created, 1);
    }

    #[test]
    fn test_missing_window_fails_with_callback() {
        let (device, _probe) = device(true);
        let reports = Arc::new(PlMutex::new(Vec::new()));
        let sink = Arc::clone(&reports);
        device.set_init_callback(move |ok, message| sink.lock().push((ok, message.to_string())));

        assert!(device.initialize(None, 640, 480));
        assert!(!device.ensure_initialized());
        assert_eq!(device.state(), DeviceState::Failed);
        assert!(device.last_error().unwrap().contains("No window"));

        let reports = reports.lock();
        assert_eq!(reports.len(), 1);
        assert!(!reports[0].0);
    }

    #[test]
    fn test_eager_failure_is_cached() {
        let (device, probe) = device(false);
        probe.script(|s| s.fail_creation = Some("adapter missing".into()));

        assert!(!device.initialize(Some(OffscreenWindow::shared(640, 480)), 640, 480));
        // Cached; no second attempt from initialize
        assert!(!device.initialize(Some(OffscreenWindow::shared(640, 480)), 640, 480));
        assert!(device.last_error().unwrap().contains("adapter missing"));
        // ensure_initialized retries and the fault was one-shot
        assert!(device.ensure_initialized());
    }

    #[test]
    fn test_state_callback_sees_transitions() {
        let (device, _probe) = device(true);
        let states = Arc::new(PlMutex::new(Vec::new()));
        let sink = Arc::clone(&states);
        device.set_state_callback(move |old, new| sink.lock().push((old, new)));

        device.initialize(Some(OffscreenWindow::shared(64, 64)), 64, 64);
        device.ensure_initialized();

        assert_eq!(
            *states.lock(),
            vec![
                (DeviceState::Uninitialized, DeviceState::Initializing),
                (DeviceState::Initializing, DeviceState::Ready),
            ]
        );
    }

    #[test]
    fn test_deferred_tasks_run_once_ready() {
        let (device, _probe) = device(true);
        device.initialize(Some(OffscreenWindow::shared(64, 64)), 64, 64);

        let order = Arc::new(PlMutex::new(Vec::new()));
        for i in 0..3 {
            let order = Arc::clone(&order);
            device.run_when_ready(move |dev| {
                assert!(dev.is_initialized());
                order.lock().push(i);
            });
        }
        assert!(order.lock().is_empty());
        assert!(device.has_deferred());

        assert!(device.ensure_initialized());
        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert!(!device.has_deferred());
    }

    #[test]
    fn test_concurrent_ensure_initialized_creates_one_backend() {
        let (device, probe) = device(true);
        device.initialize(Some(OffscreenWindow::shared(64, 64)), 64, 64);

        let ready = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let device = Arc::clone(&device);
                let ready = Arc::clone(&ready);
                std::thread::spawn(move || {
                    if device.ensure_initialized() {
                        ready.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(ready.load(Ordering::SeqCst), 8);
        assert_eq!(probe.log().backends_created, 1);
    }

    #[test]
    fn test_resource_stats_and_callback() {
        let (device, _probe) = device(false);
        device.initialize(Some(OffscreenWindow::shared(64, 64)), 64, 64);

        let names = Arc::new(PlMutex::new(Vec::new()));
        let sink = Arc::clone(&names);
        device.set_resource_callback(move |name, created| sink.lock().push((name.to_string(), created)));

        let buffer = device
            .create_buffer(&BufferDesc {
                label: "scratch".into(),
                size: 64,
                usage: crate::backend::BufferUsage::Vertex,
            })
            .unwrap();
        device.destroy_buffer(buffer);

        let stats = device.stats();
        assert_eq!(stats.resources_created, 1);
        assert_eq!(stats.resources_destroyed, 1);
        assert_eq!(names.lock()[0], ("scratch".to_string(), true));
    }

    #[test]
    fn test_device_loss_recovery_bumps_generation() {
        let (device, probe) = device(false);
        device.initialize(Some(OffscreenWindow::shared(64, 64)), 64, 64);
        let before = device.generation();

        assert!(device.recover_device_lost());
        assert!(device.is_initialized());
        assert_eq!(device.generation(), before + 1);
        let log = probe.log();
        assert_eq!(log.backends_created, 2);
        assert_eq!(log.backends_destroyed, 1);
    }

    #[test]
    fn test_minimized_resize_keeps_swapchain() {
        let (device, probe) = device(false);
        device.initialize(Some(OffscreenWindow::shared(64, 64)), 64, 64);

        device.resize_surface(0, 0).unwrap();
        assert!(device.is_minimized());
        assert_eq!(probe.log().swapchain_recreations, 0);

        device.resize_surface(128, 96).unwrap();
        assert!(!device.is_minimized());
        assert_eq!(probe.log().swapchain_recreations, 1);
        assert_eq!(device.surface_extent(), Extent2D::new(128, 96));
    }

    #[test]
    fn test_shutdown_releases_backend() {
        let (device, probe) = device(false);
        device.initialize(Some(OffscreenWindow::shared(64, 64)), 64, 64);
        device.shutdown();

        assert!(!device.is_initialized());
        assert!(device.try_backend().is_none());
        let log = probe.log();
        assert_eq!(log.backends_destroyed, 1);
        assert_eq!(log.wait_idles, 1);
    }
}
