use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use deferred_renderer::config::{CascadeConfig, PassToggles};
use deferred_renderer::renderer::resources::compute_split_fractions;
use deferred_renderer::renderer::{AttachmentId, CascadeInput, CascadeSet, RenderGraph};
use deferred_renderer::vulkan::ImageState;
use glam::{Mat4, Vec3};
use std::hint::black_box;

fn input(frame: u32) -> CascadeInput {
    let angle = frame as f32 * 0.01;
    let eye = Vec3::new(angle.cos() * 20.0, 6.0, angle.sin() * 20.0);
    CascadeInput::from_perspective(
        Mat4::look_at_rh(eye, Vec3::ZERO, Vec3::Y),
        60f32.to_radians(),
        16.0 / 9.0,
        0.1,
        500.0,
        Vec3::new(-0.3, -1.0, -0.2).normalize(),
    )
}

fn bench_cascade_fit(c: &mut Criterion) {
    let mut group = c.benchmark_group("cascade_fit");
    for &count in &[1u32, 2, 4] {
        let config = CascadeConfig {
            cascade_count: count,
            ..CascadeConfig::default()
        };
        group.bench_with_input(BenchmarkId::new("compute", count), &config, |b, config| {
            let mut frame = 0;
            b.iter(|| {
                frame += 1;
                let set = CascadeSet::compute(black_box(&input(frame)), config);
                black_box(set.to_gpu(config))
            })
        });
    }
    group.finish();
}

fn bench_splits(c: &mut Criterion) {
    c.bench_function("split_fractions", |b| {
        b.iter(|| compute_split_fractions(black_box(4), black_box(0.1), black_box(500.0), black_box(0.95)))
    });
}

fn bench_graph_plan(c: &mut Criterion) {
    let toggles = PassToggles {
        volumetric: true,
        ..PassToggles::default()
    };
    c.bench_function("render_graph_plan", |b| {
        b.iter(|| {
            let graph = RenderGraph::standard(black_box(&toggles), true).expect("graph");
            black_box(graph.plan(|_: AttachmentId| Some(ImageState::UNDEFINED)).expect("plan"))
        })
    });
}

criterion_group!(benches, bench_cascade_fit, bench_splits, bench_graph_plan);
criterion_main!(benches);
