use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ash::vk::{self, Handle as _};
use deferred_renderer::config::{PassToggles, RendererConfig, STORAGE_BUFFER_ALIGNMENT};
use deferred_renderer::renderer::{AttachmentId, UiDrawList};
use deferred_renderer::vulkan::{DeviceCall, HeadlessDevice, ObjectKind, ShaderCompiler, ShaderSource};
use deferred_renderer::{
    DirectionalLight, FrameInput, FrameOutcome, InstanceData, LightData, MaterialData, PackedMesh,
    PointLight, RenderError, Renderer, Result, SceneCamera, Vertex,
};
use glam::{Mat4, Vec3};

#[derive(Default)]
struct StubCompiler {
    broken: AtomicBool,
}

impl ShaderCompiler for StubCompiler {
    fn compile(&self, source: &ShaderSource) -> Result<Vec<u8>> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(RenderError::ShaderCompile(format!(
                "{}: syntax error",
                source.path.display()
            )));
        }
        Ok([0x0723_0203u32, 0x0001_0300, 0, 1, 0]
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect())
    }
}

fn config() -> RendererConfig {
    let mut config = RendererConfig {
        width: 320,
        height: 240,
        environment_size: 64,
        ..RendererConfig::default()
    };
    config.cascades.resolution = 256;
    config
}

fn renderer_with(config: RendererConfig) -> (Arc<HeadlessDevice>, Arc<StubCompiler>, Renderer) {
    let device = Arc::new(HeadlessDevice::new(vk::Extent2D {
        width: config.width,
        height: config.height,
    }));
    let compiler = Arc::new(StubCompiler::default());
    let renderer = Renderer::new(device.clone(), config, compiler.clone()).expect("renderer");
    (device, compiler, renderer)
}

fn quad() -> PackedMesh {
    let vertex = |x: f32, y: f32| Vertex {
        position: [x, y, 0.0],
        normal: [0.0, 0.0, 1.0],
        ..Default::default()
    };
    PackedMesh::pack(
        &[vertex(-1.0, -1.0), vertex(1.0, -1.0), vertex(1.0, 1.0), vertex(-1.0, 1.0)],
        &[0, 1, 2, 2, 3, 0],
        STORAGE_BUFFER_ALIGNMENT,
    )
}

fn count(calls: &[DeviceCall], pred: impl Fn(&DeviceCall) -> bool) -> usize {
    calls.iter().filter(|call| pred(call)).count()
}

#[test]
fn frames_are_submitted_and_presented() {
    let (device, _compiler, mut renderer) = renderer_with(config());
    let lights = LightData::new();
    let input = FrameInput::new(SceneCamera::default(), DirectionalLight::default(), &lights);

    for _ in 0..3 {
        assert_eq!(renderer.render_frame(&input).unwrap(), FrameOutcome::Rendered);
    }
    assert_eq!(renderer.frame_count(), 3);
    assert_eq!(renderer.stats().frames(), 3);

    let calls = device.calls();
    assert_eq!(count(&calls, |c| matches!(c, DeviceCall::Submit { .. })), 3);
    assert_eq!(count(&calls, |c| matches!(c, DeviceCall::Present { .. })), 3);
    assert_eq!(count(&calls, |c| matches!(c, DeviceCall::Blit { .. })), 3);
}

#[test]
fn environment_is_prefiltered_once() {
    let (device, _compiler, mut renderer) = renderer_with(config());
    let lights = LightData::new();
    let input = FrameInput::new(SceneCamera::default(), DirectionalLight::default(), &lights);
    renderer.render_frame(&input).unwrap();
    renderer.render_frame(&input).unwrap();

    let cube_passes = count(&device.calls(), |c| {
        matches!(c, DeviceCall::BeginRendering { view_mask: 0b11_1111, .. })
    });
    assert_eq!(cube_passes, 1);
}

#[test]
fn meshes_are_drawn_and_point_lights_instanced() {
    let (device, _compiler, mut renderer) = renderer_with(config());
    let instances = [
        InstanceData::from_matrix(Mat4::IDENTITY),
        InstanceData::from_matrix(Mat4::from_translation(Vec3::X * 3.0)).with_shadows(false),
    ];
    renderer.add_mesh("quad", &quad(), &instances).unwrap();

    let mut lights = LightData::new();
    lights.push(PointLight::new(Vec3::Y, 4.0, Vec3::ONE, 2.0));
    lights.push(PointLight::new(-Vec3::Y, 4.0, Vec3::ONE, 2.0));
    let input = FrameInput::new(SceneCamera::default(), DirectionalLight::default(), &lights);
    renderer.render_frame(&input).unwrap();

    let calls = device.calls();
    // Geometry draws every instance, the shadow pass only the casters.
    assert!(calls.contains(&DeviceCall::Draw {
        vertex_count: 6,
        instance_count: 2
    }));
    assert!(calls.contains(&DeviceCall::Draw {
        vertex_count: 6,
        instance_count: 1
    }));
    assert!(calls.contains(&DeviceCall::Draw {
        vertex_count: 60,
        instance_count: 2
    }));
    assert!(renderer.stats().last().draw_calls >= 3);
}

#[test]
fn removed_mesh_outlives_in_flight_frames() {
    let (device, _compiler, mut renderer) = renderer_with(config());
    let id = renderer
        .add_mesh("quad", &quad(), &[InstanceData::from_matrix(Mat4::IDENTITY)])
        .unwrap();
    let geometry = renderer.shared().mesh(id).unwrap().mesh.geometry;
    let raw = renderer.context().buffer(geometry).unwrap().as_raw();

    let lights = LightData::new();
    let input = FrameInput::new(SceneCamera::default(), DirectionalLight::default(), &lights);
    renderer.render_frame(&input).unwrap();
    renderer.remove_mesh(id).unwrap();
    assert!(renderer.shared().mesh(id).is_none());

    renderer.render_frame(&input).unwrap();
    assert_eq!(device.destroy_count(ObjectKind::Buffer, raw), 0);

    // The slot that drew the mesh comes around again.
    renderer.render_frame(&input).unwrap();
    assert_eq!(device.destroy_count(ObjectKind::Buffer, raw), 1);
}

#[test]
fn minimized_window_skips_frames_until_restored() {
    let (device, _compiler, mut renderer) = renderer_with(config());
    let lights = LightData::new();
    let input = FrameInput::new(SceneCamera::default(), DirectionalLight::default(), &lights);

    renderer.on_window_resize(0, 0).unwrap();
    assert!(renderer.is_minimized());
    assert_eq!(renderer.render_frame(&input).unwrap(), FrameOutcome::Skipped);
    assert_eq!(renderer.stats().skipped(), 1);
    assert_eq!(count(&device.calls(), |c| matches!(c, DeviceCall::Submit { .. })), 0);

    renderer.on_window_resize(640, 480).unwrap();
    assert!(!renderer.is_minimized());
    assert_eq!(renderer.render_frame(&input).unwrap(), FrameOutcome::Rendered);
    assert_eq!(
        renderer.attachments().extent(),
        vk::Extent2D {
            width: 640,
            height: 480
        }
    );
    assert_eq!(renderer.config().width, 640);
}

#[test]
fn resize_replaces_size_dependent_attachments_only() {
    let (device, _compiler, mut renderer) = renderer_with(config());
    let albedo = renderer.attachments().get(0, AttachmentId::Albedo).unwrap().raw_image;
    let cascades = renderer
        .attachments()
        .get(0, AttachmentId::ShadowCascades)
        .unwrap()
        .raw_image;

    renderer.on_window_resize(800, 600).unwrap();
    assert_eq!(device.destroy_count(ObjectKind::Image, albedo.as_raw()), 1);
    assert_eq!(device.destroy_count(ObjectKind::Image, cascades.as_raw()), 0);

    let lights = LightData::new();
    let input = FrameInput::new(SceneCamera::default(), DirectionalLight::default(), &lights);
    assert_eq!(renderer.render_frame(&input).unwrap(), FrameOutcome::Rendered);
}

#[test]
fn failed_shader_reload_keeps_rendering() {
    let (_device, compiler, mut renderer) = renderer_with(config());
    let before: Vec<_> = renderer.passes().pipelines().iter().map(|p| p.raw()).collect();

    compiler.broken.store(true, Ordering::SeqCst);
    assert!(!renderer.reload_shaders());
    let status = renderer.shader_status().expect("errors published");
    assert!(status.contains("syntax error"));
    let after: Vec<_> = renderer.passes().pipelines().iter().map(|p| p.raw()).collect();
    assert_eq!(before, after);

    let lights = LightData::new();
    let input = FrameInput::new(SceneCamera::default(), DirectionalLight::default(), &lights);
    assert_eq!(renderer.render_frame(&input).unwrap(), FrameOutcome::Rendered);

    compiler.broken.store(false, Ordering::SeqCst);
    assert!(renderer.reload_shaders());
    assert!(renderer.shader_status().is_none());
}

#[test]
fn ui_commands_are_scissored() {
    let (device, _compiler, mut renderer) = renderer_with(config());
    let mut ui = UiDrawList::new();
    ui.add_rect([10.0, 10.0, 100.0, 40.0], [1.0, 1.0, 1.0, 0.8], None);
    ui.add_rect([500.0, 500.0, 600.0, 600.0], [1.0; 4], None);

    let lights = LightData::new();
    let input = FrameInput::new(SceneCamera::default(), DirectionalLight::default(), &lights).with_ui(&ui);
    renderer.render_frame(&input).unwrap();

    let calls = device.calls();
    let ui_draws = count(&calls, |c| {
        matches!(c, DeviceCall::Draw { vertex_count: 6, instance_count: 1 })
    });
    // The second rectangle lies outside the 320x240 target.
    assert_eq!(ui_draws, 1);
}

#[test]
fn lost_device_is_reported_as_fatal() {
    let (device, _compiler, mut renderer) = renderer_with(config());
    let lights = LightData::new();
    let input = FrameInput::new(SceneCamera::default(), DirectionalLight::default(), &lights);
    renderer.render_frame(&input).unwrap();

    device.lose_device();
    let err = renderer.render_frame(&input).unwrap_err();
    assert!(err.is_fatal());
}

#[test]
fn shutdown_releases_every_device_object() {
    let toggles = PassToggles {
        volumetric: true,
        ..PassToggles::default()
    };
    let (device, _compiler, mut renderer) = renderer_with(RendererConfig {
        passes: toggles,
        ..config()
    });
    renderer
        .add_mesh("quad", &quad(), &[InstanceData::from_matrix(Mat4::IDENTITY)])
        .unwrap();
    let lights = LightData::new();
    let input = FrameInput::new(SceneCamera::default(), DirectionalLight::default(), &lights);
    for _ in 0..2 {
        renderer.render_frame(&input).unwrap();
    }

    renderer.shutdown().unwrap();
    renderer.shutdown().unwrap();
    for kind in [
        ObjectKind::Buffer,
        ObjectKind::Image,
        ObjectKind::ImageView,
        ObjectKind::Pipeline,
        ObjectKind::PipelineLayout,
        ObjectKind::ShaderModule,
        ObjectKind::DescriptorPool,
        ObjectKind::DescriptorSetLayout,
        ObjectKind::Sampler,
        ObjectKind::Fence,
        ObjectKind::Semaphore,
        ObjectKind::CommandPool,
    ] {
        assert_eq!(device.live_count(kind), 0, "{kind:?} leaked");
    }
    assert!(renderer.render_frame(&input).is_err());
}

fn position(calls: &[DeviceCall], pred: impl Fn(&DeviceCall) -> bool) -> Option<usize> {
    calls.iter().position(pred)
}

#[test]
fn environment_source_waits_for_the_slot_fence() {
    let (device, _compiler, mut renderer) = renderer_with(config());
    device.set_deferred_completion(true);
    let lights = LightData::new();
    let input = FrameInput::new(SceneCamera::default(), DirectionalLight::default(), &lights);
    renderer.render_frame(&input).unwrap();

    // Slot 0 is still executing and bound its source set during the prefilter.
    device.clear_calls();
    let view = renderer.attachments().get(0, AttachmentId::Albedo).unwrap().raw_view;
    let sampler = renderer.shared().samplers.linear;
    renderer.set_environment_source(view, sampler).unwrap();
    assert_eq!(
        count(&device.calls(), |c| matches!(c, DeviceCall::UpdateDescriptors { .. })),
        0
    );

    renderer.render_frame(&input).unwrap();
    let calls = device.calls();
    let wait = position(&calls, |c| matches!(c, DeviceCall::WaitFence { signaled: true, .. }))
        .expect("slot 1 fence waited");
    let update = position(&calls, |c| matches!(c, DeviceCall::UpdateDescriptors { .. }))
        .expect("source written for slot 1");
    assert!(wait < update);
    assert_eq!(
        count(&calls, |c| matches!(c, DeviceCall::BeginRendering { view_mask: 0b11_1111, .. })),
        1
    );

    let ibl = renderer.passes().ibl.as_ref().expect("ibl pass");
    assert!(ibl.has_pending_source(0));
    assert!(!ibl.has_pending_source(1));
}

#[test]
fn materials_reach_each_slot_after_its_fence() {
    let (device, _compiler, mut renderer) = renderer_with(config());
    device.set_deferred_completion(true);
    let lights = LightData::new();
    let input = FrameInput::new(SceneCamera::default(), DirectionalLight::default(), &lights);
    renderer.render_frame(&input).unwrap();

    let material = MaterialData {
        base_color: [0.2, 0.4, 0.6, 1.0],
        ..MaterialData::default()
    }
    .with_base_color_texture(7);
    let size = std::mem::size_of::<MaterialData>();
    let read = |renderer: &Renderer, slot: usize| {
        let handle = renderer.shared().material_buffer(slot);
        renderer.context().read_buffer(handle, 0, size).unwrap()
    };

    device.clear_calls();
    renderer.set_materials(&[material]).unwrap();
    assert_eq!(
        count(&device.calls(), |c| matches!(c, DeviceCall::WriteBuffer { .. })),
        0
    );
    assert_eq!(read(&renderer, 0), bytemuck::bytes_of(&MaterialData::default()));

    renderer.render_frame(&input).unwrap();
    let slot1 = renderer
        .context()
        .buffer(renderer.shared().material_buffer(1))
        .unwrap()
        .as_raw();
    let calls = device.calls();
    let wait = position(&calls, |c| matches!(c, DeviceCall::WaitFence { .. })).unwrap();
    let write = position(&calls, |c| matches!(c, DeviceCall::WriteBuffer { buffer, .. } if *buffer == slot1))
        .expect("slot 1 materials written");
    assert!(wait < write);
    assert_eq!(read(&renderer, 1), bytemuck::bytes_of(&material));
    // Slot 0 may still be reading its table.
    assert_eq!(read(&renderer, 0), bytemuck::bytes_of(&MaterialData::default()));

    device.complete_submissions();
    renderer.render_frame(&input).unwrap();
    assert_eq!(read(&renderer, 0), bytemuck::bytes_of(&material));
}

#[test]
fn removed_mesh_set_is_reused_only_after_its_frames_finish() {
    let (_device, _compiler, mut renderer) = renderer_with(config());
    let instances = [InstanceData::from_matrix(Mat4::IDENTITY)];
    let lights = LightData::new();
    let input = FrameInput::new(SceneCamera::default(), DirectionalLight::default(), &lights);

    let first = renderer.add_mesh("first", &quad(), &instances).unwrap();
    let first_set = renderer.shared().mesh(first).unwrap().set.raw();
    renderer.render_frame(&input).unwrap();
    renderer.remove_mesh(first).unwrap();

    let second = renderer.add_mesh("second", &quad(), &instances).unwrap();
    assert_ne!(renderer.shared().mesh(second).unwrap().set.raw(), first_set);

    renderer.render_frame(&input).unwrap();
    renderer.render_frame(&input).unwrap();
    let third = renderer.add_mesh("third", &quad(), &instances).unwrap();
    assert_eq!(renderer.shared().mesh(third).unwrap().set.raw(), first_set);
}

#[test]
fn failed_submit_does_not_stall_the_next_frame() {
    let (device, _compiler, mut renderer) = renderer_with(config());
    let lights = LightData::new();
    let input = FrameInput::new(SceneCamera::default(), DirectionalLight::default(), &lights);
    renderer.render_frame(&input).unwrap();

    device.fail_next_submit();
    let err = renderer.render_frame(&input).unwrap_err();
    assert!(matches!(err, RenderError::Vulkan { .. }));
    assert_eq!(renderer.frame_count(), 1);

    assert_eq!(renderer.render_frame(&input).unwrap(), FrameOutcome::Rendered);
    assert_eq!(renderer.frame_count(), 2);
}
