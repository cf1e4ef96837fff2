//! Graphics and compute pipelines that keep their creation parameters for hot-reload.

use ash::vk;
use bytemuck::Pod;
use std::sync::Arc;
use std::time::SystemTime;

use super::deletion_queue::DeletionQueue;
use super::device::{GpuDevice, GraphicsPipelineDesc};
use super::pipeline_state::{DepthBias, PipelineState};
use super::shader::{validate_spirv, ShaderCompiler, ShaderSource};
use crate::renderer::{
    DeviceContext, Handle, PipelineLayoutRecord, PipelineRecord, ShaderModuleRecord,
};
use crate::{RenderError, Result};

/// Fixed-function description of the pipeline, by bind point.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineKind {
    Graphics(GraphicsPipelineDesc),
    Compute,
}

impl PipelineKind {
    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        match self {
            Self::Graphics(_) => vk::PipelineBindPoint::GRAPHICS,
            Self::Compute => vk::PipelineBindPoint::COMPUTE,
        }
    }
}

/// Everything needed to recreate the pipeline from source.
#[derive(Debug, Clone)]
pub struct PipelineParams {
    pub name: String,
    pub kind: PipelineKind,
    pub sources: Vec<ShaderSource>,
    pub set_layouts: Vec<vk::DescriptorSetLayout>,
    pub push_constants: Vec<vk::PushConstantRange>,
}

impl PipelineParams {
    pub fn graphics(name: impl Into<String>, desc: GraphicsPipelineDesc) -> Self {
        Self {
            name: name.into(),
            kind: PipelineKind::Graphics(desc),
            sources: Vec::new(),
            set_layouts: Vec::new(),
            push_constants: Vec::new(),
        }
    }

    pub fn compute(name: impl Into<String>, source: ShaderSource) -> Self {
        Self {
            name: name.into(),
            kind: PipelineKind::Compute,
            sources: vec![source],
            set_layouts: Vec::new(),
            push_constants: Vec::new(),
        }
    }

    pub fn with_shader(mut self, source: ShaderSource) -> Self {
        self.sources.push(source);
        self
    }

    pub fn with_set_layouts(mut self, layouts: &[vk::DescriptorSetLayout]) -> Self {
        self.set_layouts = layouts.to_vec();
        self
    }

    pub fn with_push_constants(mut self, stages: vk::ShaderStageFlags, size: u32) -> Self {
        self.push_constants.push(vk::PushConstantRange {
            stage_flags: stages,
            offset: 0,
            size,
        });
        self
    }
}

#[derive(Debug, Clone)]
pub struct ShaderWatchInfo {
    pub source: ShaderSource,
    last_modified: Option<SystemTime>,
}

/// Native objects of one successful build, not yet registered.
struct Built {
    pipeline: vk::Pipeline,
    modules: Vec<vk::ShaderModule>,
}

pub struct Pipeline {
    params: PipelineParams,
    compiler: Arc<dyn ShaderCompiler>,
    pipeline: Handle<PipelineRecord>,
    raw: vk::Pipeline,
    layout: Handle<PipelineLayoutRecord>,
    raw_layout: vk::PipelineLayout,
    modules: Vec<Handle<ShaderModuleRecord>>,
    state: PipelineState,
    shader_watch: Vec<ShaderWatchInfo>,
    last_error: Option<String>,
}

impl Pipeline {
    pub fn create_graphics(
        ctx: &mut DeviceContext,
        compiler: Arc<dyn ShaderCompiler>,
        params: PipelineParams,
    ) -> Result<Self> {
        let PipelineKind::Graphics(desc) = &params.kind else {
            return Err(RenderError::InvalidPipeline(format!(
                "'{}' is not a graphics pipeline",
                params.name
            )));
        };
        if params.sources.is_empty() {
            return Err(RenderError::InvalidPipeline(format!(
                "'{}' has no shader stages",
                params.name
            )));
        }
        if desc.color_formats.is_empty() && desc.depth_format == vk::Format::UNDEFINED {
            return Err(RenderError::InvalidPipeline(format!(
                "'{}' has no color or depth attachment",
                params.name
            )));
        }
        let state = if desc.depth_bias {
            PipelineState::new().with_depth_bias(DepthBias::shadow())
        } else {
            PipelineState::new()
        };
        Self::create(ctx, compiler, params, state)
    }

    pub fn create_compute(
        ctx: &mut DeviceContext,
        compiler: Arc<dyn ShaderCompiler>,
        params: PipelineParams,
    ) -> Result<Self> {
        if params.kind != PipelineKind::Compute || params.sources.len() != 1 {
            return Err(RenderError::InvalidPipeline(format!(
                "'{}' must be a compute pipeline with exactly one stage",
                params.name
            )));
        }
        Self::create(ctx, compiler, params, PipelineState::new())
    }

    fn create(
        ctx: &mut DeviceContext,
        compiler: Arc<dyn ShaderCompiler>,
        params: PipelineParams,
        state: PipelineState,
    ) -> Result<Self> {
        let raw_layout = ctx
            .device()
            .create_pipeline_layout(&params.set_layouts, &params.push_constants)?;
        let layout = ctx.registry_mut().add_pipeline_layout(raw_layout);

        let built = match build(ctx.device(), compiler.as_ref(), &params, raw_layout) {
            Ok(built) => built,
            Err(err) => {
                ctx.registry_mut().destroy(layout)?;
                return Err(err);
            }
        };

        let bind_point = params.kind.bind_point();
        let pipeline = ctx.registry_mut().add_pipeline(built.pipeline, bind_point);
        let modules = built
            .modules
            .iter()
            .map(|&module| ctx.registry_mut().add_shader_module(module))
            .collect();
        let shader_watch = params
            .sources
            .iter()
            .map(|source| ShaderWatchInfo {
                last_modified: source.modified(),
                source: source.clone(),
            })
            .collect();

        log::info!(
            "[Pipeline] Created '{}' ({:?}, {} stages)",
            params.name,
            bind_point,
            params.sources.len()
        );

        Ok(Self {
            params,
            compiler,
            pipeline,
            raw: built.pipeline,
            layout,
            raw_layout,
            modules,
            state,
            shader_watch,
            last_error: None,
        })
    }

    /// Recompiles every stage and swaps in a new pipeline.
    ///
    /// On any failure the current pipeline and modules stay in place, the error is kept in
    /// [`last_error`](Self::last_error), and `false` is returned. On success the previous
    /// objects are retired through `retire` so in-flight frames can finish with them.
    pub fn reload(&mut self, ctx: &mut DeviceContext, retire: &DeletionQueue) -> bool {
        let built = match build(ctx.device(), self.compiler.as_ref(), &self.params, self.raw_layout) {
            Ok(built) => built,
            Err(err) => {
                log::warn!("[Pipeline] Reload of '{}' failed: {err}", self.params.name);
                self.last_error = Some(err.to_string());
                return false;
            }
        };

        let registry = ctx.registry_mut();
        let pipeline = registry.add_pipeline(built.pipeline, self.params.kind.bind_point());
        let modules: Vec<_> = built
            .modules
            .iter()
            .map(|&module| registry.add_shader_module(module))
            .collect();

        retire.retire(std::mem::replace(&mut self.pipeline, pipeline));
        for old in std::mem::replace(&mut self.modules, modules) {
            retire.retire(old);
        }
        self.raw = built.pipeline;
        self.last_error = None;
        log::info!("[Pipeline] Reloaded '{}'", self.params.name);
        true
    }

    /// Checks every watched source's modification time. Returns whether any changed.
    pub fn detect_shader_changes(&mut self) -> bool {
        let mut changed = false;
        for entry in &mut self.shader_watch {
            let Some(modified) = entry.source.modified() else {
                continue;
            };
            let is_newer = entry
                .last_modified
                .map(|prev| modified > prev)
                .unwrap_or(true);
            if is_newer {
                log::info!(
                    "[Pipeline] Shader change detected ({:?}): {}",
                    entry.source.stage,
                    entry.source.path.display()
                );
                entry.last_modified = Some(modified);
                changed = true;
            }
        }
        changed
    }

    /// Binds the pipeline and applies its dynamic state for `extent`.
    pub fn bind(&self, device: &dyn GpuDevice, cmd: vk::CommandBuffer, extent: vk::Extent2D) {
        let bind_point = self.params.kind.bind_point();
        device.cmd_bind_pipeline(cmd, bind_point, self.raw);
        if bind_point == vk::PipelineBindPoint::GRAPHICS {
            self.state.apply(device, cmd, extent);
        }
    }

    pub fn bind_descriptor_sets(
        &self,
        device: &dyn GpuDevice,
        cmd: vk::CommandBuffer,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        device.cmd_bind_descriptor_sets(
            cmd,
            self.params.kind.bind_point(),
            self.raw_layout,
            first_set,
            sets,
        );
    }

    pub fn push_constants<T: Pod>(
        &self,
        device: &dyn GpuDevice,
        cmd: vk::CommandBuffer,
        stages: vk::ShaderStageFlags,
        value: &T,
    ) {
        device.cmd_push_constants(cmd, self.raw_layout, stages, bytemuck::bytes_of(value));
    }

    pub fn name(&self) -> &str {
        &self.params.name
    }

    pub fn raw(&self) -> vk::Pipeline {
        self.raw
    }

    pub fn handle(&self) -> Handle<PipelineRecord> {
        self.pipeline
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.raw_layout
    }

    pub fn layout_handle(&self) -> Handle<PipelineLayoutRecord> {
        self.layout
    }

    pub fn params(&self) -> &PipelineParams {
        &self.params
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut PipelineState {
        &mut self.state
    }

    pub fn shader_watch_info(&self) -> &[ShaderWatchInfo] {
        &self.shader_watch
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}

/// Compiles, validates and creates modules plus the pipeline. Nothing is registered, and
/// everything created so far is destroyed again if a later step fails.
fn build(
    device: &dyn GpuDevice,
    compiler: &dyn ShaderCompiler,
    params: &PipelineParams,
    layout: vk::PipelineLayout,
) -> Result<Built> {
    let mut binaries = Vec::with_capacity(params.sources.len());
    for source in &params.sources {
        let code = compiler.compile(source)?;
        binaries.push((source.stage, validate_spirv(&code)?));
    }

    let mut stages = Vec::with_capacity(binaries.len());
    for (stage, words) in &binaries {
        match device.create_shader_module(words) {
            Ok(module) => stages.push((*stage, module)),
            Err(err) => {
                destroy_modules(device, &stages);
                return Err(err);
            }
        }
    }

    let created = match &params.kind {
        PipelineKind::Graphics(desc) => device.create_graphics_pipeline(desc, layout, &stages),
        PipelineKind::Compute => device.create_compute_pipeline(layout, stages[0].1),
    };
    match created {
        Ok(pipeline) => Ok(Built {
            pipeline,
            modules: stages.into_iter().map(|(_, module)| module).collect(),
        }),
        Err(err) => {
            destroy_modules(device, &stages);
            Err(err)
        }
    }
}

fn destroy_modules(device: &dyn GpuDevice, stages: &[(vk::ShaderStageFlags, vk::ShaderModule)]) {
    for (_, module) in stages {
        device.destroy_shader_module(*module);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SPIRV_MAGIC;
    use crate::vulkan::{DeviceCall, HeadlessDevice, ObjectKind};
    use ash::vk::Handle as _;

    struct FixedCompiler;

    impl ShaderCompiler for FixedCompiler {
        fn compile(&self, _source: &ShaderSource) -> Result<Vec<u8>> {
            Ok([SPIRV_MAGIC, 0x0001_0300, 0, 1, 0]
                .iter()
                .flat_map(|w| w.to_le_bytes())
                .collect())
        }
    }

    fn fullscreen_params() -> PipelineParams {
        PipelineParams::graphics(
            "fullscreen",
            GraphicsPipelineDesc {
                color_formats: vec![vk::Format::R16G16B16A16_SFLOAT],
                ..Default::default()
            },
        )
        .with_shader(ShaderSource::vertex("fullscreen.vert"))
        .with_shader(ShaderSource::fragment("composite.frag"))
    }

    #[test]
    fn graphics_pipeline_registers_all_objects() {
        let device = Arc::new(HeadlessDevice::default());
        let mut ctx = DeviceContext::new(device.clone());
        let pipeline =
            Pipeline::create_graphics(&mut ctx, Arc::new(FixedCompiler), fullscreen_params()).unwrap();

        assert!(ctx.registry().contains(pipeline.handle()));
        assert_eq!(ctx.registry().live_count(ObjectKind::ShaderModule), 2);
        assert_eq!(ctx.registry().live_count(ObjectKind::PipelineLayout), 1);
    }

    #[test]
    fn bind_sets_dynamic_state() {
        let device = Arc::new(HeadlessDevice::default());
        let mut ctx = DeviceContext::new(device.clone());
        let pipeline =
            Pipeline::create_graphics(&mut ctx, Arc::new(FixedCompiler), fullscreen_params()).unwrap();
        device.clear_calls();
        pipeline.bind(
            ctx.device(),
            vk::CommandBuffer::from_raw(1),
            vk::Extent2D {
                width: 64,
                height: 64,
            },
        );
        assert_eq!(
            device.calls(),
            vec![
                DeviceCall::BindPipeline {
                    pipeline: pipeline.raw().as_raw()
                },
                DeviceCall::SetViewportScissor,
            ]
        );
    }

    #[test]
    fn rejects_pipeline_without_targets() {
        let mut ctx = DeviceContext::new(Arc::new(HeadlessDevice::default()));
        let params = PipelineParams::graphics("empty", GraphicsPipelineDesc::default())
            .with_shader(ShaderSource::vertex("a.vert"));
        assert!(matches!(
            Pipeline::create_graphics(&mut ctx, Arc::new(FixedCompiler), params),
            Err(RenderError::InvalidPipeline(_))
        ));
    }
}
