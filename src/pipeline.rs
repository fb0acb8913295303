// Graphics pipelines built against a render target's formats

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::backend::{BlendMode, CullMode, Format, PipelineDesc, PipelineHandle, Topology, VertexLayout};
use crate::device::GraphicsDevice;
use crate::framebuffer::Framebuffer;

/// Compiled SPIR-V for a vertex + fragment pair
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShaderSource {
    pub vertex: Vec<u8>,
    pub fragment: Vec<u8>,
}

impl ShaderSource {
    pub fn new(vertex: Vec<u8>, fragment: Vec<u8>) -> Self {
        Self { vertex, fragment }
    }

    /// Read `<dir>/<name>.vert.spv` and `<dir>/<name>.frag.spv`
    pub fn load(dir: &Path, name: &str) -> Result<Self> {
        let read = |stage: &str| {
            let path = dir.join(format!("{}.{}.spv", name, stage));
            fs::read(&path).with_context(|| format!("Failed to read shader {}", path.display()))
        };
        Ok(Self {
            vertex: read("vert")?,
            fragment: read("frag")?,
        })
    }
}

/// Fixed-function state of a pipeline; formats come from the target
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSpec {
    pub label: String,
    pub vertex_layout: VertexLayout,
    pub topology: Topology,
    pub cull_mode: CullMode,
    pub blend: BlendMode,
    pub depth_test: bool,
    pub depth_write: bool,
    pub texture_slots: u32,
    pub push_constant_size: u32,
}

impl PipelineSpec {
    pub fn new(label: impl Into<String>, vertex_layout: VertexLayout) -> Self {
        Self {
            label: label.into(),
            vertex_layout,
            topology: Topology::TriangleList,
            cull_mode: CullMode::None,
            blend: BlendMode::Alpha,
            depth_test: false,
            depth_write: false,
            texture_slots: 0,
            push_constant_size: 0,
        }
    }

    pub fn topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    pub fn cull_mode(mut self, cull_mode: CullMode) -> Self {
        self.cull_mode = cull_mode;
        self
    }

    pub fn blend(mut self, blend: BlendMode) -> Self {
        self.blend = blend;
        self
    }

    pub fn depth(mut self, test: bool, write: bool) -> Self {
        self.depth_test = test;
        self.depth_write = write;
        self
    }

    pub fn texture_slots(mut self, slots: u32) -> Self {
        self.texture_slots = slots;
        self
    }

    pub fn push_constants(mut self, size: u32) -> Self {
        self.push_constant_size = size;
        self
    }
}

pub struct Pipeline {
    device: Arc<GraphicsDevice>,
    desc: PipelineDesc,
    handle: PipelineHandle,
    generation: u64,
    released: bool,
}

impl Pipeline {
    /// Build a pipeline that renders into `target`
    pub fn new(device: &Arc<GraphicsDevice>, spec: &PipelineSpec, shaders: &ShaderSource, target: &Framebuffer) -> Result<Self> {
        // Depth state without a depth attachment is meaningless
        let depth_format = target.depth_format();
        let mut spec = spec.clone();
        if depth_format.is_none() {
            spec.depth_test = false;
            spec.depth_write = false;
        }
        Self::for_formats(device, &spec, shaders, target.color_formats(), depth_format, target.samples())
    }

    pub fn for_formats(
        device: &Arc<GraphicsDevice>,
        spec: &PipelineSpec,
        shaders: &ShaderSource,
        color_formats: Vec<Format>,
        depth_format: Option<Format>,
        samples: u32,
    ) -> Result<Self> {
        let desc = PipelineDesc {
            label: spec.label.clone(),
            vertex_spirv: shaders.vertex.clone(),
            fragment_spirv: shaders.fragment.clone(),
            vertex_layout: spec.vertex_layout.clone(),
            topology: spec.topology,
            cull_mode: spec.cull_mode,
            blend: spec.blend,
            depth_test: spec.depth_test,
            depth_write: spec.depth_write,
            color_formats,
            depth_format,
            samples,
            texture_slots: spec.texture_slots,
            push_constant_size: spec.push_constant_size,
        };
        let handle = device
            .create_pipeline(&desc)
            .with_context(|| format!("Failed to create pipeline '{}'", desc.label))?;
        log::debug!("Created pipeline '{}'", desc.label);

        Ok(Self {
            device: Arc::clone(device),
            desc,
            handle,
            generation: device.generation(),
            released: false,
        })
    }

    pub fn handle(&self) -> PipelineHandle {
        self.handle
    }

    /// The handle belongs to a backend that no longer exists
    pub fn is_stale(&self) -> bool {
        self.device.generation() != self.generation
    }

    /// Recreate the native pipeline on the live backend
    pub fn rebuild(&mut self) -> Result<()> {
        let handle = self
            .device
            .create_pipeline(&self.desc)
            .with_context(|| format!("Failed to rebuild pipeline '{}'", self.desc.label))?;
        self.release();
        self.handle = handle;
        self.generation = self.device.generation();
        self.released = false;
        Ok(())
    }

    /// Swap in new shader code; the old pipeline stays if the new one fails
    pub fn reload(&mut self, shaders: &ShaderSource) -> Result<()> {
        let updated = PipelineDesc {
            vertex_spirv: shaders.vertex.clone(),
            fragment_spirv: shaders.fragment.clone(),
            ..self.desc.clone()
        };
        let previous = std::mem::replace(&mut self.desc, updated);
        if let Err(e) = self.rebuild() {
            self.desc = previous;
            return Err(e);
        }
        log::info!("Reloaded shaders for pipeline '{}'", self.desc.label);
        Ok(())
    }

    pub fn desc(&self) -> &PipelineDesc {
        &self.desc
    }

    pub fn label(&self) -> &str {
        &self.desc.label
    }

    pub fn texture_slots(&self) -> u32 {
        self.desc.texture_slots
    }

    /// Release the native pipeline now; `rebuild` brings it back
    pub fn destroy(&mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.released && !self.is_stale() {
            self.device.destroy_pipeline(self.handle);
        }
        self.released = true;
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DeviceSettings, HeadlessFactory, HeadlessProbe, OffscreenWindow, VertexAttribute, VertexFormat};
    use crate::framebuffer::FramebufferSpec;

    fn device() -> (Arc<GraphicsDevice>, HeadlessProbe) {
        let factory = HeadlessFactory::new();
        let probe = factory.probe();
        let device = GraphicsDevice::new(Box::new(factory), DeviceSettings::default(), false);
        assert!(device.initialize(Some(OffscreenWindow::shared(64, 64)), 64, 64));
        (device, probe)
    }

    fn spec() -> PipelineSpec {
        PipelineSpec::new(
            "test",
            VertexLayout {
                stride: 12,
                attributes: vec![VertexAttribute {
                    location: 0,
                    format: VertexFormat::Float3,
                    offset: 0,
                }],
            },
        )
        .depth(true, true)
    }

    #[test]
    fn test_formats_follow_target() {
        let (device, _probe) = device();
        let fb = Framebuffer::create(
            &device,
            FramebufferSpec::new("target", 64, 64)
                .attachment(Format::Rgba8)
                .attachment(Format::RedInt)
                .samples(4),
        )
        .unwrap();

        let pipeline = Pipeline::new(&device, &spec(), &ShaderSource::default(), &fb.lock()).unwrap();
        let desc = pipeline.desc();
        assert_eq!(desc.color_formats, vec![Format::Rgba8, Format::RedInt]);
        assert_eq!(desc.depth_format, None);
        assert!(!desc.depth_test);
        assert_eq!(desc.samples, 4);
    }

    #[test]
    fn test_reload_replaces_native_pipeline() {
        let (device, probe) = device();
        let mut pipeline =
            Pipeline::for_formats(&device, &spec(), &ShaderSource::default(), vec![Format::Rgba8], None, 1).unwrap();
        let old = pipeline.handle();

        pipeline.reload(&ShaderSource::new(vec![1, 2, 3, 4], vec![5, 6, 7, 8])).unwrap();
        assert_ne!(pipeline.handle(), old);
        assert_eq!(pipeline.desc().vertex_spirv, vec![1, 2, 3, 4]);
        let log = probe.log();
        assert_eq!(log.pipelines_created, 2);
        assert_eq!(log.pipelines_destroyed, 1);
    }

    #[test]
    fn test_stale_after_device_loss() {
        let (device, probe) = device();
        let mut pipeline =
            Pipeline::for_formats(&device, &spec(), &ShaderSource::default(), vec![Format::Rgba8], None, 1).unwrap();
        assert!(!pipeline.is_stale());

        assert!(device.recover_device_lost());
        assert!(pipeline.is_stale());
        pipeline.rebuild().unwrap();
        assert!(!pipeline.is_stale());
        // The old handle died with its backend
        assert_eq!(probe.log().pipelines_destroyed, 0);
    }
}
