// End-to-end frame scenarios driven through the headless backend

use std::sync::Arc;

use flint_gfx::backend::{DeviceSettings, Format, HeadlessFactory, HeadlessProbe, ImageLayout, OffscreenWindow};
use flint_gfx::command::{Command, CommandList, Submission};
use flint_gfx::deferred::DeferredInitManager;
use flint_gfx::device::GraphicsDevice;
use flint_gfx::framebuffer::{Framebuffer, FramebufferSpec, SharedFramebuffer};
use flint_gfx::renderer2d::{BatchRenderer, Quad, Renderer2DSettings, Shaders2D};
use flint_gfx::texture::Texture2D;
use glam::{Mat4, Vec2, Vec3, Vec4};

fn headless(lazy: bool) -> (Arc<GraphicsDevice>, HeadlessProbe) {
    let factory = HeadlessFactory::new();
    let probe = factory.probe();
    let device = GraphicsDevice::new(Box::new(factory), DeviceSettings::default(), lazy);
    assert!(device.initialize(Some(OffscreenWindow::shared(256, 256)), 256, 256));
    (device, probe)
}

fn scene_target(device: &Arc<GraphicsDevice>) -> SharedFramebuffer {
    Framebuffer::create(
        device,
        FramebufferSpec::new("scene", 256, 256)
            .attachment(Format::Rgba8)
            .attachment(Format::RedInt)
            .attachment(Format::Depth32F),
    )
    .unwrap()
}

/// Draw `count` plain quads in one scene and submit the frame
fn draw_quads(count: usize) -> (flint_gfx::RenderStats, HeadlessProbe) {
    let (device, probe) = headless(false);
    let target = scene_target(&device);
    let mut renderer =
        BatchRenderer::new(&device, &target.lock(), &Shaders2D::default(), Renderer2DSettings::default()).unwrap();
    let mut cmd = CommandList::new(&device);

    cmd.begin().unwrap();
    cmd.begin_rendering(&target, Some([0.0, 0.0, 0.0, 1.0])).unwrap();
    let mut scene = renderer.begin_scene_with_view(&mut cmd, Mat4::IDENTITY).unwrap();
    for i in 0..count {
        scene
            .draw_quad(&Quad::new(Vec3::new(i as f32 * 0.01, 0.0, 0.0), Vec2::splat(0.01), Vec4::ONE))
            .unwrap();
    }
    scene.end().unwrap();
    cmd.end_rendering();
    assert_eq!(cmd.execute(true).unwrap(), Submission::Submitted);

    (renderer.stats(), probe)
}

#[test]
fn deferred_tasks_run_once_in_fifo_order() {
    let queue = DeferredInitManager::new();
    for task in 0..5 {
        queue.enqueue(task);
    }

    let mut ran = Vec::new();
    assert_eq!(queue.process(|| true, |task| ran.push(task)), 5);
    assert_eq!(ran, vec![0, 1, 2, 3, 4]);
    assert!(!queue.has_pending());

    assert_eq!(queue.process(|| true, |task| ran.push(task)), 0);
    assert_eq!(ran.len(), 5);
}

#[test]
fn deferred_queue_unchanged_while_not_ready() {
    let queue = DeferredInitManager::new();
    queue.enqueue("set source");
    queue.enqueue("begin");

    let mut ran = Vec::new();
    assert_eq!(queue.process(|| false, |task| ran.push(task)), 0);
    assert!(ran.is_empty());
    assert_eq!(queue.pending_len(), 2);
}

#[test]
fn five_quads_make_one_draw_call() {
    let (stats, probe) = draw_quads(5);
    assert_eq!(stats.quad_count, 5);
    assert_eq!(stats.draw_calls, 1);
    assert_eq!(probe.log().draw_calls(), 1);
}

#[test]
fn oversized_frame_splits_into_bounded_batches() {
    let (stats, probe) = draw_quads(10_001);
    assert_eq!(stats.quad_count, 10_001);
    assert_eq!(stats.draw_calls, 2);

    let max_indices = Renderer2DSettings::default().max_quads * 6;
    let batches: Vec<u32> = probe
        .log()
        .commands
        .iter()
        .filter_map(|c| match c {
            Command::DrawIndexed { index_count, .. } => Some(*index_count),
            _ => None,
        })
        .collect();
    assert_eq!(batches.len(), 2);
    assert!(batches.iter().all(|n| n % 6 == 0 && *n <= max_indices));
    assert_eq!(batches.iter().sum::<u32>(), 10_001 * 6);
}

#[test]
fn repeated_texture_keeps_its_slot() {
    let (device, _probe) = headless(false);
    let target = scene_target(&device);
    let mut renderer =
        BatchRenderer::new(&device, &target.lock(), &Shaders2D::default(), Renderer2DSettings::default()).unwrap();
    let texture = Texture2D::solid(&device, "brick", [180, 60, 40, 255]).unwrap();
    let mut cmd = CommandList::new(&device);
    cmd.begin().unwrap();

    let mut scene = renderer.begin_scene_with_view(&mut cmd, Mat4::IDENTITY).unwrap();
    for _ in 0..2 {
        scene
            .draw_quad(&Quad::default().with_texture(Arc::clone(&texture), 1.0))
            .unwrap();
    }
    scene.end().unwrap();

    let bound: Vec<usize> = cmd
        .commands()
        .iter()
        .filter_map(|c| match c {
            Command::BindTextures { textures, .. } => Some(textures.len()),
            _ => None,
        })
        .collect();
    // White in slot 0 plus the one texture
    assert_eq!(bound, vec![2]);
}

#[test]
fn repeated_transition_issues_one_barrier() {
    let (device, _probe) = headless(false);
    let target = scene_target(&device);
    let mut cmd = CommandList::new(&device);

    assert!(cmd.transition_image(&target, 0, ImageLayout::General).unwrap());
    assert!(!cmd.transition_image(&target, 0, ImageLayout::General).unwrap());

    let barriers = cmd
        .commands()
        .iter()
        .filter(|c| matches!(c, Command::TransitionImage { .. }))
        .count();
    assert_eq!(barriers, 1);
}

#[test]
fn resize_to_same_size_is_a_no_op() {
    let (device, probe) = headless(false);
    let target = scene_target(&device);
    let created = probe.log().images_created;

    target.lock().resize(256, 256).unwrap();
    assert_eq!(probe.log().images_created, created);

    target.lock().resize(128, 64).unwrap();
    assert_eq!(probe.log().images_created, created + 3);
    let fb = target.lock();
    assert_eq!(fb.extent().width, 128);
    assert_eq!(fb.extent().height, 64);
    let depth: Vec<bool> = (0..fb.attachment_count())
        .map(|i| fb.attachment(i).unwrap().is_depth())
        .collect();
    assert_eq!(depth, vec![false, false, true]);
}

#[test]
fn lazy_begin_waits_for_the_device() {
    let (device, probe) = headless(true);
    let mut cmd = CommandList::new(&device);

    cmd.begin().unwrap();
    let log = probe.log();
    assert_eq!(log.backends_created, 0);
    assert_eq!(log.command_begins, 0);
    assert_eq!(cmd.pending_ops(), 1);

    assert!(device.ensure_initialized());
    assert_eq!(cmd.process_deferred().unwrap(), 1);
    assert_eq!(probe.log().command_begins, 1);
    assert_eq!(cmd.pending_ops(), 0);

    // Nothing left to replay
    assert_eq!(cmd.process_deferred().unwrap(), 0);
    assert_eq!(probe.log().command_begins, 1);
}

#[test]
fn stale_swapchain_drops_one_frame_then_recovers() {
    let (device, probe) = headless(false);
    let target = scene_target(&device);
    let mut cmd = CommandList::new(&device);
    cmd.set_source_framebuffer(&target).unwrap();
    cmd.set_should_present(true).unwrap();

    probe.script(|s| s.acquire_out_of_date = 1);
    cmd.begin().unwrap();
    cmd.clear_color(&target, 0, [1.0, 0.0, 0.0, 1.0]).unwrap();
    assert_eq!(cmd.execute(true).unwrap(), Submission::Skipped);
    assert_eq!(probe.log().swapchain_recreations, 1);

    cmd.begin().unwrap();
    cmd.clear_color(&target, 0, [0.0, 1.0, 0.0, 1.0]).unwrap();
    assert_eq!(cmd.execute(true).unwrap(), Submission::Presented);
    assert_eq!(probe.log().presents, 1);
}
