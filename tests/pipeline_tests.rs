use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use ash::vk::{self, Handle as _};
use deferred_renderer::renderer::DeviceContext;
use deferred_renderer::vulkan::{
    DeletionQueue, GraphicsPipelineDesc, HeadlessDevice, ObjectKind, Pipeline, PipelineParams,
    ShaderCompiler, ShaderSource,
};
use deferred_renderer::{RenderError, Result};

/// Returns a minimal SPIR-V header, or a compile error while `fail` is set.
#[derive(Default)]
struct ToggleCompiler {
    fail: AtomicBool,
    bad_magic: AtomicBool,
    compiles: AtomicUsize,
}

impl ShaderCompiler for ToggleCompiler {
    fn compile(&self, source: &ShaderSource) -> Result<Vec<u8>> {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(RenderError::ShaderCompile(format!(
                "{}:3: error: 'vec5' : undeclared identifier",
                source.path.display()
            )));
        }
        let magic = if self.bad_magic.load(Ordering::SeqCst) {
            0xDEAD_BEEF
        } else {
            0x0723_0203
        };
        Ok([magic, 0x0001_0300, 0, 1, 0]
            .iter()
            .flat_map(|w: &u32| w.to_le_bytes())
            .collect())
    }
}

fn params(vertex: impl Into<PathBuf>) -> PipelineParams {
    PipelineParams::graphics(
        "lighting",
        GraphicsPipelineDesc {
            color_formats: vec![vk::Format::R16G16B16A16_SFLOAT],
            ..Default::default()
        },
    )
    .with_shader(ShaderSource::vertex(vertex))
    .with_shader(ShaderSource::fragment("lighting.frag"))
}

fn setup() -> (Arc<HeadlessDevice>, DeviceContext, Arc<ToggleCompiler>) {
    let device = Arc::new(HeadlessDevice::default());
    let ctx = DeviceContext::new(device.clone());
    (device, ctx, Arc::new(ToggleCompiler::default()))
}

#[test]
fn successful_reload_swaps_and_retires_old_objects() {
    let (device, mut ctx, compiler) = setup();
    let mut pipeline = Pipeline::create_graphics(&mut ctx, compiler.clone(), params("fullscreen.vert")).unwrap();
    let old = pipeline.raw().as_raw();
    let retire = DeletionQueue::new("retire");

    assert!(pipeline.reload(&mut ctx, &retire));
    assert_ne!(pipeline.raw().as_raw(), old);
    assert!(pipeline.last_error().is_none());

    // The old pipeline stays alive until the queue is flushed.
    assert_eq!(device.destroy_count(ObjectKind::Pipeline, old), 0);
    assert_eq!(retire.len(), 3);
    retire.flush(ctx.registry_mut());
    assert_eq!(device.destroy_count(ObjectKind::Pipeline, old), 1);
    assert_eq!(device.live_count(ObjectKind::Pipeline), 1);
    assert_eq!(device.live_count(ObjectKind::ShaderModule), 2);
}

#[test]
fn failed_reload_keeps_previous_pipeline() {
    let (device, mut ctx, compiler) = setup();
    let mut pipeline = Pipeline::create_graphics(&mut ctx, compiler.clone(), params("fullscreen.vert")).unwrap();
    let before = pipeline.raw();
    let live_before = device.live_count(ObjectKind::Pipeline);
    let retire = DeletionQueue::new("retire");

    compiler.fail.store(true, Ordering::SeqCst);
    assert!(!pipeline.reload(&mut ctx, &retire));
    assert_eq!(pipeline.raw(), before);
    assert!(retire.is_empty());
    assert_eq!(device.live_count(ObjectKind::Pipeline), live_before);
    let error = pipeline.last_error().expect("error recorded");
    assert!(error.contains("undeclared identifier"), "{error}");

    // Fixing the shader clears the error on the next attempt.
    compiler.fail.store(false, Ordering::SeqCst);
    assert!(pipeline.reload(&mut ctx, &retire));
    assert!(pipeline.last_error().is_none());
}

#[test]
fn invalid_binary_fails_before_touching_the_device() {
    let (device, mut ctx, compiler) = setup();
    compiler.bad_magic.store(true, Ordering::SeqCst);
    let result = Pipeline::create_graphics(&mut ctx, compiler.clone(), params("fullscreen.vert"));
    assert!(matches!(result, Err(RenderError::InvalidShaderBinary(_))));
    assert_eq!(device.live_count(ObjectKind::ShaderModule), 0);
    assert_eq!(device.live_count(ObjectKind::Pipeline), 0);
    assert_eq!(device.live_count(ObjectKind::PipelineLayout), 0);
}

#[test]
fn reload_with_corrupt_binary_reports_error() {
    let (_device, mut ctx, compiler) = setup();
    let mut pipeline = Pipeline::create_graphics(&mut ctx, compiler.clone(), params("fullscreen.vert")).unwrap();
    let before = pipeline.raw();

    compiler.bad_magic.store(true, Ordering::SeqCst);
    assert!(!pipeline.reload(&mut ctx, &DeletionQueue::new("retire")));
    assert_eq!(pipeline.raw(), before);
    assert!(pipeline.last_error().unwrap().contains("magic"));
}

#[test]
fn modified_source_is_detected_once() {
    let path = std::env::temp_dir().join(format!("deferred_renderer_watch_{}.vert", std::process::id()));
    fs::write(&path, "#version 450\nvoid main() {}\n").unwrap();

    let (_device, mut ctx, compiler) = setup();
    let mut pipeline = Pipeline::create_graphics(&mut ctx, compiler.clone(), params(&path)).unwrap();
    assert!(!pipeline.detect_shader_changes());

    let file = fs::File::options().write(true).open(&path).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(10)).unwrap();
    drop(file);

    assert!(pipeline.detect_shader_changes());
    assert!(!pipeline.detect_shader_changes());
    fs::remove_file(&path).ok();
}

#[test]
fn missing_sources_are_not_reported_as_changed() {
    let (_device, mut ctx, compiler) = setup();
    let mut pipeline =
        Pipeline::create_graphics(&mut ctx, compiler.clone(), params("does/not/exist.vert")).unwrap();
    assert!(!pipeline.detect_shader_changes());
}
