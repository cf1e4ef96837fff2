use std::sync::Arc;

use ash::vk::{self, Handle as _};
use deferred_renderer::renderer::DeviceContext;
use deferred_renderer::vulkan::{
    BufferDesc, GraphicsPipelineDesc, HeadlessDevice, ImageDesc, MemoryLocation, ObjectKind,
    Pipeline, PipelineParams, ShaderCompiler, ShaderSource,
};
use deferred_renderer::{RenderError, Result};

struct HeaderOnly;

impl ShaderCompiler for HeaderOnly {
    fn compile(&self, _source: &ShaderSource) -> Result<Vec<u8>> {
        Ok([0x0723_0203u32, 0x0001_0300, 0, 1, 0]
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect())
    }
}

fn context() -> (Arc<HeadlessDevice>, DeviceContext) {
    let device = Arc::new(HeadlessDevice::default());
    let ctx = DeviceContext::new(device.clone());
    (device, ctx)
}

fn buffer_desc(name: &str) -> BufferDesc {
    BufferDesc {
        size: 1024,
        usage: vk::BufferUsageFlags::STORAGE_BUFFER,
        location: MemoryLocation::CpuToGpu,
        name: name.to_string(),
    }
}

fn image_desc(name: &str) -> ImageDesc {
    ImageDesc {
        format: vk::Format::R8G8B8A8_UNORM,
        extent: vk::Extent2D {
            width: 64,
            height: 64,
        },
        array_layers: 1,
        mip_levels: 1,
        usage: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::COLOR_ATTACHMENT,
        cube_compatible: false,
        name: name.to_string(),
    }
}

fn pipeline(ctx: &mut DeviceContext) -> Pipeline {
    let desc = GraphicsPipelineDesc {
        color_formats: vec![vk::Format::R8G8B8A8_UNORM],
        ..Default::default()
    };
    let params = PipelineParams::graphics("test", desc)
        .with_shader(ShaderSource::vertex("test.vert"))
        .with_shader(ShaderSource::fragment("test.frag"));
    Pipeline::create_graphics(ctx, Arc::new(HeaderOnly), params).expect("pipeline")
}

#[test]
fn teardown_frees_every_object_exactly_once() {
    let (device, mut ctx) = context();
    let buffers: Vec<u64> = (0..3)
        .map(|i| {
            let handle = ctx.create_buffer(&buffer_desc(&format!("b{i}"))).unwrap();
            ctx.buffer(handle).unwrap().as_raw()
        })
        .collect();
    let images: Vec<u64> = (0..2)
        .map(|i| {
            let handle = ctx.create_image(&image_desc(&format!("i{i}"))).unwrap();
            ctx.image(handle).unwrap().image.as_raw()
        })
        .collect();
    let pipeline = pipeline(&mut ctx);
    let pipeline_raw = pipeline.raw().as_raw();

    let destroyed = ctx.registry_mut().destroy_all_resources();
    // 3 buffers, 2 images, pipeline, its layout and two shader modules
    assert_eq!(destroyed, 9);

    for raw in buffers {
        assert_eq!(device.destroy_count(ObjectKind::Buffer, raw), 1);
    }
    for raw in images {
        assert_eq!(device.destroy_count(ObjectKind::Image, raw), 1);
    }
    assert_eq!(device.destroy_count(ObjectKind::Pipeline, pipeline_raw), 1);
    assert_eq!(ctx.registry().total_live(), 0);
}

#[test]
fn second_teardown_is_a_no_op() {
    let (device, mut ctx) = context();
    ctx.create_buffer(&buffer_desc("only")).unwrap();
    assert_eq!(ctx.registry_mut().destroy_all_resources(), 1);

    let calls_before = device.calls().len();
    assert_eq!(ctx.registry_mut().destroy_all_resources(), 0);
    assert_eq!(device.calls().len(), calls_before);
}

#[test]
fn destroyed_handle_is_rejected_without_double_free() {
    let (device, mut ctx) = context();
    let handle = ctx.create_buffer(&buffer_desc("once")).unwrap();
    let raw = ctx.buffer(handle).unwrap().as_raw();

    ctx.registry_mut().destroy(handle).unwrap();
    let again = ctx.registry_mut().destroy(handle);
    assert!(matches!(again, Err(RenderError::StaleHandle { .. })));
    assert!(ctx.buffer(handle).is_err());
    assert_eq!(device.destroy_count(ObjectKind::Buffer, raw), 1);
}

#[test]
fn recycled_slot_does_not_revive_old_handle() {
    let (_device, mut ctx) = context();
    let first = ctx.create_buffer(&buffer_desc("first")).unwrap();
    ctx.registry_mut().destroy(first).unwrap();
    let second = ctx.create_buffer(&buffer_desc("second")).unwrap();

    assert!(ctx.registry().contains(second));
    assert!(!ctx.registry().contains(first));
}

#[test]
fn live_counts_follow_device_objects() {
    let (device, mut ctx) = context();
    let a = ctx.create_buffer(&buffer_desc("a")).unwrap();
    ctx.create_buffer(&buffer_desc("b")).unwrap();
    ctx.create_image(&image_desc("c")).unwrap();

    assert_eq!(ctx.registry().live_count(ObjectKind::Buffer), 2);
    assert_eq!(device.live_count(ObjectKind::Buffer), 2);

    ctx.registry_mut().destroy(a).unwrap();
    assert_eq!(ctx.registry().live_count(ObjectKind::Buffer), 1);
    assert_eq!(device.live_count(ObjectKind::Buffer), 1);
    assert_eq!(ctx.registry().live_count(ObjectKind::Image), 1);
}

#[test]
fn shutdown_waits_for_idle_before_destroying() {
    let (device, mut ctx) = context();
    ctx.create_buffer(&buffer_desc("late")).unwrap();
    ctx.shutdown().unwrap();

    let calls = device.calls();
    let idle = calls
        .iter()
        .position(|call| matches!(call, deferred_renderer::vulkan::DeviceCall::WaitIdle))
        .expect("wait idle recorded");
    let destroy = calls
        .iter()
        .position(|call| matches!(call, deferred_renderer::vulkan::DeviceCall::Destroy { .. }))
        .expect("destroy recorded");
    assert!(idle < destroy);
    assert_eq!(device.live_count(ObjectKind::Buffer), 0);
}

#[test]
fn interleaved_adds_and_destroys_track_live_count() {
    let (device, mut ctx) = context();
    let mut live = Vec::new();
    let mut dead = Vec::new();
    let mut state = 0x2545_f491u32;
    let mut next = || {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        state
    };

    for step in 0..200 {
        match next() % 3 {
            0 | 1 if live.len() < 16 => {
                live.push(ctx.create_buffer(&buffer_desc(&format!("b{step}"))).unwrap());
            }
            _ if !live.is_empty() => {
                let handle = live.swap_remove(next() as usize % live.len());
                ctx.registry_mut().destroy_buffer(handle).unwrap();
                dead.push(handle);
            }
            _ => {}
        }
        if !dead.is_empty() && next() % 4 == 0 {
            // Destroying a dead handle must not touch whatever now occupies its slot.
            let stale = dead[next() as usize % dead.len()];
            assert!(matches!(
                ctx.registry_mut().destroy_buffer(stale),
                Err(RenderError::StaleHandle { .. })
            ));
        }
        assert_eq!(ctx.registry().live_count(ObjectKind::Buffer), live.len(), "step {step}");
        assert_eq!(device.live_count(ObjectKind::Buffer), live.len(), "step {step}");
    }
    for handle in &live {
        assert!(ctx.registry().contains(*handle));
    }
}

#[test]
fn stale_handle_after_slot_reuse_leaves_new_entry_alone() {
    let (device, mut ctx) = context();
    let old = ctx.create_buffer(&buffer_desc("old")).unwrap();
    ctx.registry_mut().destroy_buffer(old).unwrap();
    let new = ctx.create_buffer(&buffer_desc("new")).unwrap();
    let new_raw = ctx.buffer(new).unwrap().as_raw();

    assert!(matches!(
        ctx.registry_mut().destroy_buffer(old),
        Err(RenderError::StaleHandle { .. })
    ));
    assert!(ctx.registry().contains(new));
    assert_eq!(device.destroy_count(ObjectKind::Buffer, new_raw), 0);
    assert_eq!(ctx.registry().live_count(ObjectKind::Buffer), 1);
}
