// Batched 2D renderer
//
// Quads, circles and lines are appended to fixed-size CPU arenas and turned
// into one draw call per primitive type per batch. When an arena or the
// texture slot table fills up the batch is flushed and a new one started,
// so a frame of any size fits in bounded GPU memory.

mod arena;
mod primitives;
mod vertex;

pub use arena::VertexArena;
pub use primitives::{quad_transform, Circle, Quad};
pub use vertex::{CircleVertex, LineVertex, QuadVertex};

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use glam::{Mat4, Vec2, Vec3, Vec4};

use crate::backend::{BufferDesc, BufferHandle, BufferUsage, Topology};
use crate::camera::Camera;
use crate::command::CommandList;
use crate::device::GraphicsDevice;
use crate::error::DeviceError;
use crate::framebuffer::{Framebuffer, NO_ENTITY};
use crate::pipeline::{Pipeline, PipelineSpec, ShaderSource};
use crate::texture::Texture2D;
use primitives::{QUAD_POSITIONS, QUAD_UVS};

const VIEW_PROJECTION_SIZE: u32 = std::mem::size_of::<Mat4>() as u32;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Renderer2DSettings {
    /// Quads (and circles) per batch
    pub max_quads: u32,
    /// Upper bound on texture slots; the device limit may lower it
    pub max_texture_slots: u32,
    pub line_width: f32,
}

impl Default for Renderer2DSettings {
    fn default() -> Self {
        Self {
            max_quads: 10_000,
            max_texture_slots: 32,
            line_width: 1.0,
        }
    }
}

/// SPIR-V for the three 2D pipelines
#[derive(Debug, Clone, Default)]
pub struct Shaders2D {
    pub quad: ShaderSource,
    pub circle: ShaderSource,
    pub line: ShaderSource,
}

impl Shaders2D {
    /// Load `quad`, `circle` and `line` shaders from `dir`
    pub fn load(dir: &Path) -> Result<Self> {
        Ok(Self {
            quad: ShaderSource::load(dir, "quad")?,
            circle: ShaderSource::load(dir, "circle")?,
            line: ShaderSource::load(dir, "line")?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderStats {
    pub draw_calls: u32,
    pub quad_count: u32,
    pub circle_count: u32,
    pub line_count: u32,
}

impl RenderStats {
    pub fn total_vertex_count(&self) -> u32 {
        (self.quad_count + self.circle_count) * 4 + self.line_count * 2
    }

    pub fn total_index_count(&self) -> u32 {
        (self.quad_count + self.circle_count) * 6
    }
}

/// GPU vertex buffers one batch draws from
#[derive(Debug, Clone, Copy)]
struct BatchSegment {
    quads: BufferHandle,
    circles: BufferHandle,
    lines: BufferHandle,
}

pub struct BatchRenderer {
    device: Arc<GraphicsDevice>,
    settings: Renderer2DSettings,
    max_indices: u32,
    max_texture_slots: usize,

    quad_pipeline: Pipeline,
    circle_pipeline: Pipeline,
    line_pipeline: Pipeline,
    index_buffer: BufferHandle,
    // [frame slot][batch within the frame]
    segments: Vec<Vec<BatchSegment>>,
    batch_cursor: usize,
    frame: (usize, u64),
    generation: u64,

    quads: VertexArena<QuadVertex>,
    circles: VertexArena<CircleVertex>,
    lines: VertexArena<LineVertex>,
    quad_index_count: u32,
    circle_index_count: u32,
    // Slot 0 is always the white texture
    texture_slots: Vec<Arc<Texture2D>>,

    view_projection: Mat4,
    stats: RenderStats,
    destroyed: bool,
}

impl BatchRenderer {
    /// Build the pipelines for `target` and the shared GPU state
    pub fn new(
        device: &Arc<GraphicsDevice>,
        target: &Framebuffer,
        shaders: &Shaders2D,
        settings: Renderer2DSettings,
    ) -> Result<Self> {
        let caps = device.capabilities().ok_or(DeviceError::NotInitialized)?;
        let max_texture_slots = settings.max_texture_slots.min(caps.max_texture_slots).max(1);
        let max_quads = settings.max_quads.max(1);
        log::info!(
            "Renderer2D: {} quads per batch, {} texture slots ({})",
            max_quads,
            max_texture_slots,
            caps.device_name
        );

        let quad_spec = PipelineSpec::new("renderer2d quad", QuadVertex::layout())
            .texture_slots(max_texture_slots)
            .push_constants(VIEW_PROJECTION_SIZE);
        let circle_spec =
            PipelineSpec::new("renderer2d circle", CircleVertex::layout()).push_constants(VIEW_PROJECTION_SIZE);
        let line_spec = PipelineSpec::new("renderer2d line", LineVertex::layout())
            .topology(Topology::LineList)
            .push_constants(VIEW_PROJECTION_SIZE);

        let quad_pipeline = Pipeline::new(device, &quad_spec, &shaders.quad, target)?;
        let circle_pipeline = Pipeline::new(device, &circle_spec, &shaders.circle, target)?;
        let line_pipeline = Pipeline::new(device, &line_spec, &shaders.line, target)?;
        let index_buffer = create_index_buffer(device, max_quads)?;
        let white = Texture2D::white(device)?;

        let vertex_capacity = max_quads as usize * 4;
        Ok(Self {
            device: Arc::clone(device),
            settings: Renderer2DSettings {
                max_quads,
                max_texture_slots,
                ..settings
            },
            max_indices: max_quads * 6,
            max_texture_slots: max_texture_slots as usize,
            quad_pipeline,
            circle_pipeline,
            line_pipeline,
            index_buffer,
            segments: Vec::new(),
            batch_cursor: 0,
            frame: (0, 0),
            generation: device.generation(),
            quads: VertexArena::with_capacity(vertex_capacity),
            circles: VertexArena::with_capacity(vertex_capacity),
            lines: VertexArena::with_capacity(max_quads as usize * 2),
            quad_index_count: 0,
            circle_index_count: 0,
            texture_slots: vec![white],
            view_projection: Mat4::IDENTITY,
            stats: RenderStats::default(),
            destroyed: false,
        })
    }

    /// Start a scene seen through `camera` placed at `transform`
    pub fn begin_scene<'a>(&'a mut self, cmd: &'a mut CommandList, camera: &Camera, transform: &Mat4) -> Result<Scene<'a>> {
        self.begin_scene_with_view(cmd, camera.view_projection(transform))
    }

    pub fn begin_scene_with_view<'a>(&'a mut self, cmd: &'a mut CommandList, view_projection: Mat4) -> Result<Scene<'a>> {
        if self.destroyed {
            bail!("Renderer2D used after destroy");
        }
        if self.device.generation() != self.generation {
            self.recreate_gpu_state()?;
        }
        self.view_projection = view_projection;
        self.reset_batch();
        Ok(Scene {
            renderer: self,
            cmd,
            ended: false,
        })
    }

    /// Swap in new shader code for all three pipelines
    pub fn reload_shaders(&mut self, shaders: &Shaders2D) -> Result<()> {
        self.quad_pipeline.reload(&shaders.quad)?;
        self.circle_pipeline.reload(&shaders.circle)?;
        self.line_pipeline.reload(&shaders.line)?;
        Ok(())
    }

    pub fn stats(&self) -> RenderStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = RenderStats::default();
    }

    pub fn settings(&self) -> &Renderer2DSettings {
        &self.settings
    }

    pub fn max_texture_slots(&self) -> usize {
        self.max_texture_slots
    }

    /// Release buffers, then pipelines, then the staged CPU data
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        if self.device.generation() == self.generation {
            for segment in self.segments.drain(..).flatten() {
                self.device.destroy_buffer(segment.quads);
                self.device.destroy_buffer(segment.circles);
                self.device.destroy_buffer(segment.lines);
            }
            self.device.destroy_buffer(self.index_buffer);
        }
        self.segments.clear();
        self.quad_pipeline.destroy();
        self.circle_pipeline.destroy();
        self.line_pipeline.destroy();
        self.reset_batch();
        // Drops the last reference to the white texture
        self.texture_slots.clear();
        log::debug!("Renderer2D destroyed");
    }

    // The backend was recreated: old handles are gone, not destroyed
    fn recreate_gpu_state(&mut self) -> Result<()> {
        log::info!("Renderer2D: recreating GPU state for new device");
        self.segments.clear();
        self.index_buffer = create_index_buffer(&self.device, self.settings.max_quads)?;
        for pipeline in [&mut self.quad_pipeline, &mut self.circle_pipeline, &mut self.line_pipeline] {
            if pipeline.is_stale() {
                pipeline.rebuild()?;
            }
        }
        self.generation = self.device.generation();
        Ok(())
    }

    fn reset_batch(&mut self) {
        self.quads.reset();
        self.circles.reset();
        self.lines.reset();
        self.quad_index_count = 0;
        self.circle_index_count = 0;
        self.texture_slots.truncate(1);
    }

    fn has_pending(&self) -> bool {
        self.quad_index_count > 0 || self.circle_index_count > 0 || !self.lines.is_empty()
    }

    fn texture_slot(&mut self, texture: &Arc<Texture2D>) -> i32 {
        if let Some(slot) = self.texture_slots.iter().position(|t| Arc::ptr_eq(t, texture)) {
            return slot as i32;
        }
        self.texture_slots.push(Arc::clone(texture));
        (self.texture_slots.len() - 1) as i32
    }

    fn draw_quad(&mut self, cmd: &mut CommandList, quad: &Quad) -> Result<()> {
        if self.quad_index_count >= self.max_indices || self.texture_slots.len() >= self.max_texture_slots {
            self.flush_and_reset(cmd)?;
        }

        let tex_index = match &quad.texture {
            Some(texture) => self.texture_slot(texture),
            None => 0,
        };
        for (corner, uv) in QUAD_POSITIONS.iter().zip(QUAD_UVS) {
            self.quads.push(QuadVertex {
                position: (quad.transform * *corner).truncate().to_array(),
                color: quad.color.to_array(),
                tex_coord: uv,
                tex_index,
                tiling_factor: quad.tiling_factor,
                entity_id: quad.entity_id,
            })?;
        }
        self.quad_index_count += 6;
        self.stats.quad_count += 1;
        Ok(())
    }

    fn draw_circle(&mut self, cmd: &mut CommandList, circle: &Circle) -> Result<()> {
        if self.circle_index_count >= self.max_indices {
            self.flush_and_reset(cmd)?;
        }

        for corner in QUAD_POSITIONS {
            self.circles.push(CircleVertex {
                world_position: (circle.transform * corner).truncate().to_array(),
                local_position: (corner.truncate() * 2.0).to_array(),
                color: circle.color.to_array(),
                thickness: circle.thickness,
                fade: circle.fade,
                entity_id: circle.entity_id,
            })?;
        }
        self.circle_index_count += 6;
        self.stats.circle_count += 1;
        Ok(())
    }

    fn draw_line(&mut self, cmd: &mut CommandList, p0: Vec3, p1: Vec3, color: Vec4, entity_id: i32) -> Result<()> {
        if !self.lines.has_room(2) {
            self.flush_and_reset(cmd)?;
        }

        for position in [p0, p1] {
            self.lines.push(LineVertex {
                position: position.to_array(),
                color: color.to_array(),
                entity_id,
            })?;
        }
        self.stats.line_count += 1;
        Ok(())
    }

    fn draw_rect(&mut self, cmd: &mut CommandList, transform: &Mat4, color: Vec4, entity_id: i32) -> Result<()> {
        let corners = QUAD_POSITIONS.map(|corner| (*transform * corner).truncate());
        for i in 0..4 {
            self.draw_line(cmd, corners[i], corners[(i + 1) % 4], color, entity_id)?;
        }
        Ok(())
    }

    /// Upload and draw everything written since the last reset
    fn flush(&mut self, cmd: &mut CommandList) -> Result<()> {
        if !self.has_pending() {
            return Ok(());
        }
        // Bound per batch rather than once per scene: every batch draws
        // from its own vertex buffer segment
        let segment = self.next_segment(cmd)?;
        let view_projection = bytemuck::bytes_of(&self.view_projection).to_vec();

        if self.quad_index_count > 0 {
            self.device.write_buffer(segment.quads, 0, self.quads.as_bytes())?;
            let textures = self
                .texture_slots
                .iter()
                .map(|texture| texture.handle())
                .collect::<Result<Vec<_>>>()?;
            let pipeline = self.quad_pipeline.handle();
            cmd.bind_pipeline(&self.quad_pipeline);
            cmd.push_constants(pipeline, &view_projection);
            cmd.bind_textures(pipeline, textures);
            cmd.bind_vertex_buffer(segment.quads, 0);
            cmd.bind_index_buffer(self.index_buffer, 0);
            cmd.draw_indexed(self.quad_index_count, 1, 0, 0, 0);
            self.stats.draw_calls += 1;
        }

        if self.circle_index_count > 0 {
            self.device.write_buffer(segment.circles, 0, self.circles.as_bytes())?;
            cmd.bind_pipeline(&self.circle_pipeline);
            cmd.push_constants(self.circle_pipeline.handle(), &view_projection);
            cmd.bind_vertex_buffer(segment.circles, 0);
            cmd.bind_index_buffer(self.index_buffer, 0);
            cmd.draw_indexed(self.circle_index_count, 1, 0, 0, 0);
            self.stats.draw_calls += 1;
        }

        if !self.lines.is_empty() {
            self.device.write_buffer(segment.lines, 0, self.lines.as_bytes())?;
            cmd.bind_pipeline(&self.line_pipeline);
            cmd.push_constants(self.line_pipeline.handle(), &view_projection);
            cmd.set_line_width(self.settings.line_width);
            cmd.bind_vertex_buffer(segment.lines, 0);
            cmd.draw(self.lines.len() as u32, 1, 0, 0);
            self.stats.draw_calls += 1;
        }
        Ok(())
    }

    fn flush_and_reset(&mut self, cmd: &mut CommandList) -> Result<()> {
        self.flush(cmd)?;
        self.reset_batch();
        Ok(())
    }

    // Each batch of a frame gets its own buffers, so a later batch never
    // overwrites vertices an earlier draw of the same frame reads.
    fn next_segment(&mut self, cmd: &CommandList) -> Result<BatchSegment> {
        let frame = (cmd.buffer().frame_slot(), cmd.buffer().frame_index());
        if frame != self.frame {
            self.frame = frame;
            self.batch_cursor = 0;
        }
        let (slot, _) = frame;
        if self.segments.len() <= slot {
            self.segments.resize_with(slot + 1, Vec::new);
        }

        let cursor = self.batch_cursor;
        self.batch_cursor += 1;
        if let Some(segment) = self.segments[slot].get(cursor) {
            return Ok(*segment);
        }

        let create = |label: &str, size: u64| {
            self.device.create_buffer(&BufferDesc {
                label: format!("renderer2d {} slot {} batch {}", label, slot, cursor),
                size,
                usage: BufferUsage::Vertex,
            })
        };
        let segment = BatchSegment {
            quads: create("quads", self.quads.byte_capacity())?,
            circles: create("circles", self.circles.byte_capacity())?,
            lines: create("lines", self.lines.byte_capacity())?,
        };
        log::debug!("Renderer2D: allocated batch buffers for slot {} batch {}", slot, cursor);
        self.segments[slot].push(segment);
        Ok(segment)
    }
}

impl Drop for BatchRenderer {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn create_index_buffer(device: &Arc<GraphicsDevice>, max_quads: u32) -> Result<BufferHandle> {
    let indices: Vec<u32> = (0..max_quads)
        .flat_map(|quad| {
            let offset = quad * 4;
            [offset, offset + 1, offset + 2, offset + 2, offset + 3, offset]
        })
        .collect();
    let bytes: &[u8] = bytemuck::cast_slice(&indices);
    let buffer = device.create_buffer(&BufferDesc {
        label: "renderer2d quad indices".to_string(),
        size: bytes.len() as u64,
        usage: BufferUsage::Index,
    })?;
    device
        .write_buffer(buffer, 0, bytes)
        .context("Failed to upload quad index pattern")?;
    Ok(buffer)
}

/// One scene being recorded into a command list
///
/// Ends itself on drop; call `end` to see errors.
pub struct Scene<'a> {
    renderer: &'a mut BatchRenderer,
    cmd: &'a mut CommandList,
    ended: bool,
}

impl Scene<'_> {
    pub fn draw_quad(&mut self, quad: &Quad) -> Result<()> {
        self.renderer.draw_quad(self.cmd, quad)
    }

    pub fn draw_circle(&mut self, circle: &Circle) -> Result<()> {
        self.renderer.draw_circle(self.cmd, circle)
    }

    pub fn draw_line(&mut self, p0: Vec3, p1: Vec3, color: Vec4) -> Result<()> {
        self.renderer.draw_line(self.cmd, p0, p1, color, NO_ENTITY)
    }

    pub fn draw_line_with_entity(&mut self, p0: Vec3, p1: Vec3, color: Vec4, entity_id: i32) -> Result<()> {
        self.renderer.draw_line(self.cmd, p0, p1, color, entity_id)
    }

    /// Outline of the unit quad under `transform`
    pub fn draw_rect(&mut self, transform: &Mat4, color: Vec4) -> Result<()> {
        self.renderer.draw_rect(self.cmd, transform, color, NO_ENTITY)
    }

    pub fn draw_rect_with_entity(&mut self, transform: &Mat4, color: Vec4, entity_id: i32) -> Result<()> {
        self.renderer.draw_rect(self.cmd, transform, color, entity_id)
    }

    /// Axis-aligned outline centred on `position`
    pub fn draw_rect_at(&mut self, position: Vec3, size: Vec2, color: Vec4) -> Result<()> {
        let transform = quad_transform(position, size, 0.0);
        self.renderer.draw_rect(self.cmd, &transform, color, NO_ENTITY)
    }

    /// Record draws for everything written since the last reset
    pub fn flush(&mut self) -> Result<()> {
        self.renderer.flush(self.cmd)
    }

    /// Flush and start a fresh batch within the same scene
    pub fn flush_and_reset(&mut self) -> Result<()> {
        self.renderer.flush_and_reset(self.cmd)
    }

    pub fn stats(&self) -> RenderStats {
        self.renderer.stats
    }

    pub fn end(mut self) -> Result<()> {
        self.ended = true;
        self.renderer.flush(self.cmd)
    }
}

impl Drop for Scene<'_> {
    fn drop(&mut self) {
        if self.ended {
            return;
        }
        if let Err(e) = self.renderer.flush(self.cmd) {
            log::error!("Renderer2D: failed to end scene: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DeviceSettings, Format, HeadlessFactory, HeadlessProbe, OffscreenWindow};
    use crate::command::{Command, Submission};
    use crate::framebuffer::{FramebufferSpec, SharedFramebuffer};

    struct Fixture {
        device: Arc<GraphicsDevice>,
        probe: HeadlessProbe,
        _target: SharedFramebuffer,
        renderer: BatchRenderer,
        cmd: CommandList,
    }

    fn fixture(settings: Renderer2DSettings) -> Fixture {
        let factory = HeadlessFactory::new();
        let probe = factory.probe();
        let device = GraphicsDevice::new(Box::new(factory), DeviceSettings::default(), false);
        assert!(device.initialize(Some(OffscreenWindow::shared(320, 240)), 320, 240));

        let target = crate::framebuffer::Framebuffer::create(
            &device,
            FramebufferSpec::new("scene", 320, 240)
                .attachment(Format::Rgba8)
                .attachment(Format::RedInt),
        )
        .unwrap();
        let renderer = BatchRenderer::new(&device, &target.lock(), &Shaders2D::default(), settings).unwrap();
        let mut cmd = CommandList::new(&device);
        cmd.begin().unwrap();
        Fixture {
            device,
            probe,
            _target: target,
            renderer,
            cmd,
        }
    }

    fn quad(x: f32) -> Quad {
        Quad::new(Vec3::new(x, 0.0, 0.0), Vec2::ONE, Vec4::ONE)
    }

    fn indexed_counts(cmd: &CommandList) -> Vec<u32> {
        cmd.commands()
            .iter()
            .filter_map(|c| match c {
                Command::DrawIndexed { index_count, .. } => Some(*index_count),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_small_scene_is_one_draw_call() {
        let mut f = fixture(Renderer2DSettings::default());
        let mut scene = f.renderer.begin_scene_with_view(&mut f.cmd, Mat4::IDENTITY).unwrap();
        for i in 0..5 {
            scene.draw_quad(&quad(i as f32)).unwrap();
        }
        scene.end().unwrap();

        let stats = f.renderer.stats();
        assert_eq!(stats.quad_count, 5);
        assert_eq!(stats.draw_calls, 1);
        assert_eq!(indexed_counts(&f.cmd), vec![30]);

        assert_eq!(f.cmd.execute(true).unwrap(), Submission::Submitted);
        assert_eq!(f.probe.log().draw_calls(), 1);
    }

    #[test]
    fn test_oversized_scene_splits_into_batches() {
        let mut f = fixture(Renderer2DSettings::default());
        let mut scene = f.renderer.begin_scene_with_view(&mut f.cmd, Mat4::IDENTITY).unwrap();
        for i in 0..10_001 {
            scene.draw_quad(&quad(i as f32)).unwrap();
        }
        scene.end().unwrap();

        let stats = f.renderer.stats();
        assert_eq!(stats.quad_count, 10_001);
        assert_eq!(stats.draw_calls, 2);
        let counts = indexed_counts(&f.cmd);
        assert_eq!(counts, vec![60_000, 6]);
        assert!(counts.iter().all(|c| c % 6 == 0 && *c <= 60_000));
    }

    #[test]
    fn test_upload_covers_only_written_vertices() {
        let mut f = fixture(Renderer2DSettings::default());
        let writes_before = f.probe.log().buffer_writes.len();
        let mut scene = f.renderer.begin_scene_with_view(&mut f.cmd, Mat4::IDENTITY).unwrap();
        for i in 0..3 {
            scene.draw_quad(&quad(i as f32)).unwrap();
        }
        scene.end().unwrap();

        let log = f.probe.log();
        let writes = &log.buffer_writes[writes_before..];
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].2, 3 * 4 * std::mem::size_of::<QuadVertex>());
    }

    #[test]
    fn test_empty_scene_records_nothing() {
        let mut f = fixture(Renderer2DSettings::default());
        let scene = f.renderer.begin_scene_with_view(&mut f.cmd, Mat4::IDENTITY).unwrap();
        scene.end().unwrap();
        assert!(f.cmd.commands().is_empty());
        assert_eq!(f.renderer.stats().draw_calls, 0);
    }

    #[test]
    fn test_same_texture_reuses_slot() {
        let mut f = fixture(Renderer2DSettings::default());
        let texture = Texture2D::solid(&f.device, "checker", [10, 20, 30, 255]).unwrap();
        let mut scene = f.renderer.begin_scene_with_view(&mut f.cmd, Mat4::IDENTITY).unwrap();
        scene.draw_quad(&quad(0.0).with_texture(Arc::clone(&texture), 1.0)).unwrap();
        scene.draw_quad(&quad(1.0).with_texture(Arc::clone(&texture), 1.0)).unwrap();
        scene.draw_quad(&quad(2.0)).unwrap();
        drop(scene);

        assert_eq!(f.renderer.texture_slots.len(), 2);
        let slots: Vec<_> = f.renderer.quads.vertices().iter().map(|v| v.tex_index).collect();
        assert_eq!(slots, vec![1, 1, 1, 1, 1, 1, 1, 1, 0, 0, 0, 0]);
    }

    #[test]
    fn test_full_slot_table_flushes_before_drawing() {
        let mut f = fixture(Renderer2DSettings {
            max_texture_slots: 3,
            ..Renderer2DSettings::default()
        });
        let textures: Vec<_> = (0..3)
            .map(|i| Texture2D::solid(&f.device, format!("t{i}"), [i as u8; 4]).unwrap())
            .collect();

        let mut scene = f.renderer.begin_scene_with_view(&mut f.cmd, Mat4::IDENTITY).unwrap();
        scene.draw_quad(&quad(0.0).with_texture(Arc::clone(&textures[0]), 1.0)).unwrap();
        scene.draw_quad(&quad(1.0).with_texture(Arc::clone(&textures[1]), 1.0)).unwrap();
        assert_eq!(scene.stats().draw_calls, 0);

        // Slots 0..3 are taken; the third texture forces a flush first
        scene.draw_quad(&quad(2.0).with_texture(Arc::clone(&textures[2]), 1.0)).unwrap();
        assert_eq!(scene.stats().draw_calls, 1);
        scene.end().unwrap();

        assert_eq!(f.renderer.stats().draw_calls, 2);
        assert_eq!(f.renderer.texture_slots.len(), 2);
        let bound: Vec<usize> = f
            .cmd
            .commands()
            .iter()
            .filter_map(|c| match c {
                Command::BindTextures { textures, .. } => Some(textures.len()),
                _ => None,
            })
            .collect();
        assert_eq!(bound, vec![3, 2]);
    }

    #[test]
    fn test_each_primitive_type_gets_one_draw() {
        let mut f = fixture(Renderer2DSettings::default());
        let mut scene = f.renderer.begin_scene_with_view(&mut f.cmd, Mat4::IDENTITY).unwrap();
        scene.draw_quad(&quad(0.0)).unwrap();
        scene.draw_circle(&Circle::new(Vec3::ZERO, 1.0, Vec4::ONE)).unwrap();
        scene.draw_circle(&Circle::new(Vec3::X, 1.0, Vec4::ONE).outline(0.1)).unwrap();
        scene.draw_line(Vec3::ZERO, Vec3::Y, Vec4::ONE).unwrap();
        scene.draw_rect(&Mat4::IDENTITY, Vec4::ONE).unwrap();
        scene.end().unwrap();

        let stats = f.renderer.stats();
        assert_eq!(stats.draw_calls, 3);
        assert_eq!(stats.circle_count, 2);
        assert_eq!(stats.line_count, 5);
        assert_eq!(indexed_counts(&f.cmd), vec![6, 12]);
        assert!(f.cmd.commands().contains(&Command::Draw {
            vertex_count: 10,
            instance_count: 1,
            first_vertex: 0,
            first_instance: 0,
        }));
    }

    #[test]
    fn test_rect_at_position_outlines_the_box() {
        let mut f = fixture(Renderer2DSettings::default());
        let mut scene = f.renderer.begin_scene_with_view(&mut f.cmd, Mat4::IDENTITY).unwrap();
        scene.draw_rect_at(Vec3::new(2.0, 1.0, 0.0), Vec2::new(4.0, 2.0), Vec4::ONE).unwrap();
        scene.end().unwrap();

        let corners: Vec<[f32; 3]> = f.renderer.lines.vertices().iter().step_by(2).map(|v| v.position).collect();
        assert_eq!(
            corners,
            vec![[0.0, 0.0, 0.0], [4.0, 0.0, 0.0], [4.0, 2.0, 0.0], [0.0, 2.0, 0.0]]
        );
        assert_eq!(f.renderer.stats().line_count, 4);
    }

    #[test]
    fn test_circle_local_positions_span_unit_square() {
        let mut f = fixture(Renderer2DSettings::default());
        let mut scene = f.renderer.begin_scene_with_view(&mut f.cmd, Mat4::IDENTITY).unwrap();
        scene.draw_circle(&Circle::new(Vec3::new(5.0, 5.0, 0.0), 2.0, Vec4::ONE)).unwrap();
        drop(scene);

        let first = f.renderer.circles.vertices()[0];
        assert_eq!(first.local_position, [-1.0, -1.0, 0.0]);
        assert_eq!(first.world_position, [3.0, 3.0, 0.0]);
    }

    #[test]
    fn test_line_capacity_forces_flush() {
        let mut f = fixture(Renderer2DSettings {
            max_quads: 2,
            ..Renderer2DSettings::default()
        });
        let mut scene = f.renderer.begin_scene_with_view(&mut f.cmd, Mat4::IDENTITY).unwrap();
        for i in 0..3 {
            scene.draw_line(Vec3::ZERO, Vec3::splat(i as f32), Vec4::ONE).unwrap();
        }
        scene.end().unwrap();
        assert_eq!(f.renderer.stats().draw_calls, 2);
    }

    #[test]
    fn test_batches_in_one_frame_use_separate_buffers() {
        let mut f = fixture(Renderer2DSettings {
            max_quads: 1,
            ..Renderer2DSettings::default()
        });
        let mut scene = f.renderer.begin_scene_with_view(&mut f.cmd, Mat4::IDENTITY).unwrap();
        scene.draw_quad(&quad(0.0)).unwrap();
        scene.draw_quad(&quad(1.0)).unwrap();
        scene.end().unwrap();

        let buffers: Vec<_> = f
            .cmd
            .commands()
            .iter()
            .filter_map(|c| match c {
                Command::BindVertexBuffer { buffer, .. } => Some(*buffer),
                _ => None,
            })
            .collect();
        assert_eq!(buffers.len(), 2);
        assert_ne!(buffers[0], buffers[1]);
    }

    #[test]
    fn test_reset_stats() {
        let mut f = fixture(Renderer2DSettings::default());
        let mut scene = f.renderer.begin_scene_with_view(&mut f.cmd, Mat4::IDENTITY).unwrap();
        scene.draw_quad(&quad(0.0)).unwrap();
        scene.end().unwrap();
        f.renderer.reset_stats();
        assert_eq!(f.renderer.stats(), RenderStats::default());
    }

    #[test]
    fn test_recovers_after_device_loss() {
        let mut f = fixture(Renderer2DSettings::default());
        assert!(f.device.recover_device_lost());
        let pipelines_before = f.probe.log().pipelines_created;

        f.cmd.begin().unwrap();
        let mut scene = f.renderer.begin_scene_with_view(&mut f.cmd, Mat4::IDENTITY).unwrap();
        scene.draw_quad(&quad(0.0)).unwrap();
        scene.end().unwrap();
        assert_eq!(f.probe.log().pipelines_created, pipelines_before + 3);
        assert_eq!(f.cmd.execute(true).unwrap(), Submission::Submitted);
    }

    #[test]
    fn test_destroy_releases_buffers() {
        let mut f = fixture(Renderer2DSettings::default());
        let mut scene = f.renderer.begin_scene_with_view(&mut f.cmd, Mat4::IDENTITY).unwrap();
        scene.draw_quad(&quad(0.0)).unwrap();
        scene.end().unwrap();

        let created = f.probe.log().buffers_created;
        f.renderer.destroy();
        f.renderer.destroy();
        // Index buffer plus three vertex buffers
        assert_eq!(created, 4);
        let log = f.probe.log();
        assert_eq!(log.buffers_destroyed, 4);
        assert_eq!(log.pipelines_destroyed, 3);
        // White texture, uploaded by the first flush
        assert_eq!(log.textures_created, 1);
        assert_eq!(log.textures_destroyed, 1);
        assert!(f.renderer.begin_scene_with_view(&mut f.cmd, Mat4::IDENTITY).is_err());
    }
}
