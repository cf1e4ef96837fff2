use std::sync::Arc;

use approx::assert_relative_eq;
use ash::vk;
use deferred_renderer::config::{CascadeConfig, CASCADE_RADIUS_STEP};
use deferred_renderer::renderer::resources::{compute_split_fractions, frustum_corners};
use deferred_renderer::renderer::{
    CascadeInput, CascadeSet, CascadedShadowMap, DeviceContext, GpuCascadeData,
};
use deferred_renderer::vulkan::{BufferDesc, HeadlessDevice, MemoryLocation};
use glam::{Mat4, Vec3};

fn camera(eye: Vec3, near: f32, far: f32) -> CascadeInput {
    let view = Mat4::look_at_rh(eye, Vec3::ZERO, Vec3::Y);
    CascadeInput::from_perspective(
        view,
        60f32.to_radians(),
        16.0 / 9.0,
        near,
        far,
        Vec3::new(-0.4, -1.0, -0.2).normalize(),
    )
}

#[test]
fn logarithmic_splits_end_exactly_at_far() {
    let splits = compute_split_fractions(4, 0.5, 48.0, 1.0);
    assert_eq!(splits[3], 1.0);
    for pair in splits.windows(2) {
        assert!(pair[0] < pair[1], "splits must increase: {splits:?}");
    }
    // Pure logarithmic: near * (far/near)^(1/4)
    let expected = (0.5 * (48.0f32 / 0.5).powf(0.25) - 0.5) / 47.5;
    assert_relative_eq!(splits[0], expected, epsilon = 1e-5);
}

#[test]
fn splits_increase_within_unit_range() {
    for count in 1..=4usize {
        for &(near, far) in &[(0.01f32, 10.0f32), (0.1, 1000.0), (2.0, 2.5)] {
            for step in 0..=10 {
                let lambda = step as f32 / 10.0;
                let splits = compute_split_fractions(count, near, far, lambda);
                let active = &splits[..count];
                assert!(active.iter().all(|s| *s > 0.0 && *s <= 1.0), "{active:?}");
                assert!(active.windows(2).all(|w| w[0] < w[1]), "{active:?}");
                assert_eq!(active[count - 1], 1.0);
            }
        }
    }
}

#[test]
fn split_blend_moves_between_uniform_and_log() {
    let uniform = compute_split_fractions(4, 0.5, 48.0, 0.0);
    let practical = compute_split_fractions(4, 0.5, 48.0, 0.5);
    let log = compute_split_fractions(4, 0.5, 48.0, 1.0);
    for i in 0..3 {
        assert!(log[i] < practical[i] && practical[i] < uniform[i]);
    }
}

#[test]
fn identical_inputs_produce_identical_cascades() {
    let config = CascadeConfig::default();
    let input = camera(Vec3::new(3.0, 4.0, 12.0), 0.1, 200.0);
    let first = CascadeSet::compute(&input, &config);
    let second = CascadeSet::compute(&input, &config);
    assert_eq!(first, second);
    assert_eq!(
        bytemuck::bytes_of(&first.to_gpu(&config)),
        bytemuck::bytes_of(&second.to_gpu(&config))
    );
}

#[test]
fn cascade_radii_grow_with_distance() {
    let config = CascadeConfig::default();
    let set = CascadeSet::compute(&camera(Vec3::new(0.0, 2.0, 10.0), 0.5, 48.0), &config);
    assert_eq!(set.count(), 4);
    for pair in set.cascades().windows(2) {
        assert!(pair[0].radius <= pair[1].radius);
        assert!(pair[0].split_depth > pair[1].split_depth);
    }
    assert_relative_eq!(set.cascades()[3].split_depth, -48.0, epsilon = 1e-3);
}

#[test]
fn small_camera_moves_keep_cascade_size() {
    let config = CascadeConfig::default();
    let a = CascadeSet::compute(&camera(Vec3::new(0.0, 2.0, 10.0), 0.5, 48.0), &config);
    let b = CascadeSet::compute(&camera(Vec3::new(0.001, 2.0, 10.0), 0.5, 48.0), &config);
    for (x, y) in a.cascades().iter().zip(b.cascades()) {
        assert_eq!(x.radius, y.radius);
    }
}

#[test]
fn gpu_block_survives_upload_bit_exact() {
    let device = Arc::new(HeadlessDevice::default());
    let mut ctx = DeviceContext::new(device);
    let size = std::mem::size_of::<GpuCascadeData>();
    let buffer = ctx
        .create_buffer(&BufferDesc {
            size: size as u64,
            usage: vk::BufferUsageFlags::UNIFORM_BUFFER,
            location: MemoryLocation::CpuToGpu,
            name: "cascades".into(),
        })
        .unwrap();

    let mut shadows = CascadedShadowMap::new(CascadeConfig::default());
    shadows.update(&camera(Vec3::new(5.0, 8.0, 5.0), 0.1, 100.0));
    shadows.upload(&ctx, buffer).unwrap();

    let bytes = ctx.read_buffer(buffer, 0, size).unwrap();
    let read: GpuCascadeData = bytemuck::pod_read_unaligned(&bytes);
    assert_eq!(bytemuck::bytes_of(&read), bytemuck::bytes_of(shadows.gpu_data()));
    ctx.shutdown().unwrap();
}

#[test]
fn reduced_cascade_count_pads_gpu_block() {
    let config = CascadeConfig::performance();
    let set = CascadeSet::compute(&camera(Vec3::new(0.0, 2.0, 10.0), 0.5, 48.0), &config);
    let gpu = set.to_gpu(&config);
    assert_eq!(gpu.params[0], 2.0);
    assert_eq!(gpu.split_depths[2], f32::MAX);
    assert_eq!(gpu.view_proj[3], Mat4::IDENTITY.to_cols_array());
}

#[test]
fn camera_at_origin_fits_four_log_cascades() {
    let (near, far) = (0.5f32, 48.0f32);
    let input = camera_looking_down_neg_z(near, far);
    let config = CascadeConfig {
        cascade_count: 4,
        split_lambda: 1.0,
        max_shadow_distance: None,
        ..CascadeConfig::default()
    };
    let set = CascadeSet::compute(&input, &config);
    assert_eq!(set.count(), 4);

    let splits = set.splits();
    assert!(splits.windows(2).all(|w| w[0] < w[1]), "{splits:?}");
    assert_eq!(splits[3], 1.0);
    for (i, split) in splits[..3].iter().enumerate() {
        let p = (i + 1) as f32 / 4.0;
        let expected = (near * (far / near).powf(p) - near) / (far - near);
        assert_relative_eq!(*split, expected, epsilon = 1e-5);
    }

    let corners = frustum_corners(input.inv_view_proj);
    let mut previous = 0.0f32;
    for cascade in set.cascades() {
        assert_relative_eq!(
            cascade.split_depth,
            -(near + cascade.split * (far - near)),
            epsilon = 1e-4
        );
        assert!(cascade.radius > 0.0);
        assert_eq!((cascade.radius / CASCADE_RADIUS_STEP).fract(), 0.0, "{}", cascade.radius);

        for edge in 0..4 {
            let (n, f) = (corners[edge], corners[edge + 4]);
            for t in [previous, cascade.split] {
                let corner = n.lerp(f, t);
                assert!(
                    corner.distance(cascade.center) <= cascade.radius + 1e-4,
                    "corner {corner} outside sphere at {} r={}",
                    cascade.center,
                    cascade.radius
                );
            }
        }
        // The slice sits in front of the camera.
        assert!(cascade.center.z < 0.0);
        assert!(cascade.view_proj.is_finite());
        previous = cascade.split;
    }
}

fn camera_looking_down_neg_z(near: f32, far: f32) -> CascadeInput {
    let view = Mat4::look_at_rh(Vec3::ZERO, Vec3::NEG_Z, Vec3::Y);
    assert!(view.abs_diff_eq(Mat4::IDENTITY, 1e-6));
    CascadeInput::from_perspective(
        view,
        60f32.to_radians(),
        16.0 / 9.0,
        near,
        far,
        Vec3::new(-0.4, -1.0, -0.2).normalize(),
    )
}
