//! The deferred renderer: owns the device context, frame slots, attachments and passes,
//! and drives one frame at a time through the render graph.

use ash::vk;
use std::sync::Arc;

use super::attachments::{AttachmentId, Attachments};
use super::context::DeviceContext;
use super::frame_graph::{sampled_state, transfer_src_state, RenderGraph};
use super::passes::{
    FrameInput, MeshId, PassRecorder, Passes, PostFxSettings, SharedResources, VolumetricSettings,
};
use super::render_stats::{FrameStats, StatsCollector};
use super::resources::{CascadedShadowMap, FrameUniforms, InstanceData, MaterialData, PackedMesh};
use crate::config::{RendererConfig, FRAMES_IN_FLIGHT};
use crate::utils::logging::{warn_if_frame_budget_exceeded, ScopedTimer};
use crate::vulkan::{
    AcquiredImage, DeletionQueue, FrameContext, GpuDevice, ImageBarrier, ImageState,
    ShaderCompiler,
};
use crate::{RenderError, Result};

/// What happened to a [`Renderer::render_frame`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The frame was recorded and submitted
    Rendered,
    /// Nothing was submitted: the window is minimized or the presentation target is stale
    Skipped,
}

/// Final color view plus a sampler, for hosts that display the image themselves.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisplayHandle {
    pub view: vk::ImageView,
    pub sampler: vk::Sampler,
    pub extent: vk::Extent2D,
    /// Layout the image is left in at the end of the frame
    pub layout: vk::ImageLayout,
}

const PRESENT_DST: ImageState = ImageState {
    layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
    stage: vk::PipelineStageFlags2::BLIT,
    access: vk::AccessFlags2::TRANSFER_WRITE,
};

const PRESENT_SRC: ImageState = ImageState {
    layout: vk::ImageLayout::PRESENT_SRC_KHR,
    stage: vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
    access: vk::AccessFlags2::NONE,
};

pub struct Renderer {
    config: RendererConfig,
    frames: FrameContext,
    passes: Passes,
    shared: SharedResources,
    attachments: Attachments,
    shadows: CascadedShadowMap,
    stats: StatsCollector,
    shader_status: Option<String>,
    last_rendered_slot: Option<usize>,
    minimized: bool,
    shut_down: bool,
    // Dropped last so every component above can still reach the device.
    ctx: DeviceContext,
}

impl Renderer {
    /// Builds every attachment, shared resource and pass for `config`.
    pub fn new(
        device: Arc<dyn GpuDevice>,
        config: RendererConfig,
        compiler: Arc<dyn ShaderCompiler>,
    ) -> Result<Self> {
        config.validate()?;
        log::info!(
            "[Context] Creating renderer on '{}' at {}x{}",
            device.name(),
            config.width,
            config.height
        );

        let mut ctx = DeviceContext::new(Arc::clone(&device));
        let frames = FrameContext::new(device, config.fence_timeout_ns)?;
        let attachments = Attachments::new(&mut ctx, &config)?;
        let shared = SharedResources::new(&mut ctx)?;
        let passes = Passes::new(&mut ctx, &compiler, &config, &shared, &attachments)?;
        let shadows = CascadedShadowMap::new(config.cascades.clone());

        log::info!(
            "[Context] Renderer ready: {} pipelines, {} live objects",
            passes.pipelines().len(),
            ctx.registry().total_live()
        );
        Ok(Self {
            config,
            frames,
            passes,
            shared,
            attachments,
            shadows,
            stats: StatsCollector::new(),
            shader_status: None,
            last_rendered_slot: None,
            minimized: false,
            shut_down: false,
            ctx,
        })
    }

    /// Records, submits and presents one frame.
    ///
    /// Blocks until the frame slot's previous submission has finished. A stale presentation
    /// target abandons the frame and returns [`FrameOutcome::Skipped`]; the host is expected
    /// to call [`on_window_resize`](Self::on_window_resize) before the next frame.
    pub fn render_frame(&mut self, input: &FrameInput<'_>) -> Result<FrameOutcome> {
        if self.shut_down {
            return Err(RenderError::PassOrder("render_frame after shutdown".into()));
        }
        if self.minimized {
            self.stats.record_skip();
            return Ok(FrameOutcome::Skipped);
        }

        let timer = ScopedTimer::new("render_frame");
        let frame = self.frames.frame_count();
        let slot = self.frames.current_index();
        let cmd = self.frames.begin_frame(self.ctx.registry_mut())?;
        self.poll_shaders();

        let acquired = match self.frames.acquire_image() {
            Ok(image) => Some(image),
            Err(RenderError::NoPresentTarget) => None,
            Err(RenderError::SwapchainOutOfDate) => {
                log::debug!("[FrameSync] Presentation target out of date; frame {frame} skipped");
                self.frames.abandon_frame()?;
                self.stats.record_skip();
                return Ok(FrameOutcome::Skipped);
            }
            Err(err) => return Err(self.fail_frame(err)),
        };

        let mut stats = FrameStats::new(frame, slot);
        if let Err(err) = self.record_frame(cmd, slot, input, acquired.as_ref(), &mut stats) {
            return Err(self.fail_frame(err));
        }

        if let Err(err) = self.frames.submit(acquired.is_some()) {
            return Err(self.fail_frame(err));
        }
        if let Some(image) = &acquired {
            let stale = match self.frames.present(image.index) {
                Ok(suboptimal) => suboptimal || image.suboptimal,
                Err(RenderError::SwapchainOutOfDate) => true,
                Err(err) => return Err(err),
            };
            if stale {
                log::debug!("[FrameSync] Presentation target suboptimal after frame {frame}");
            }
        }
        self.frames.advance();
        self.last_rendered_slot = Some(slot);

        let elapsed = timer.elapsed();
        stats.cpu_ms = elapsed.as_secs_f32() * 1000.0;
        warn_if_frame_budget_exceeded(elapsed, self.config.frame_budget_ms);
        log::trace!("[FrameSync] {}", stats.format_compact());
        self.stats.submit(stats);
        Ok(FrameOutcome::Rendered)
    }

    fn fail_frame(&mut self, err: RenderError) -> RenderError {
        if err.is_fatal() {
            log::error!("[FrameSync] Fatal device error: {err}");
        }
        if let Err(abandon) = self.frames.abandon_frame() {
            log::error!("[FrameSync] Could not abandon frame: {abandon}");
        }
        err
    }

    fn record_frame(
        &mut self,
        cmd: vk::CommandBuffer,
        slot: usize,
        input: &FrameInput<'_>,
        acquired: Option<&AcquiredImage>,
        stats: &mut FrameStats,
    ) -> Result<()> {
        let extent = self.attachments.extent();
        let aspect = extent.width as f32 / extent.height.max(1) as f32;

        // Uploads finish before recording starts; the slot's fence guarantees the GPU is
        // done reading the previous contents.
        let mut uniforms = FrameUniforms::default();
        uniforms.set_camera(input.camera.view, input.camera.projection(aspect), input.camera.position);
        uniforms.set_sun(input.sun.direction, input.sun.intensity, input.sun.color, input.sun.ambient);
        uniforms.set_time(input.time);
        uniforms.set_viewport(extent.width, extent.height);
        self.shadows
            .update(&input.camera.cascade_input(aspect, input.sun.direction));
        self.shared
            .upload_frame(&self.ctx, slot, &uniforms, self.shadows.gpu_data(), input.lights)?;

        let graph = RenderGraph::standard(&self.config.passes, self.passes.environment_dirty())?;
        let attachments = &self.attachments;
        let plan = graph.plan(|id| attachments.state(slot, id).ok())?;
        let output = graph.output();

        let mut rec = PassRecorder {
            device: self.ctx.device(),
            cmd,
            slot,
            attachments: &mut self.attachments,
            stats,
        };
        for pass in &plan {
            rec.apply(&pass.before)?;
            self.passes.record(pass.kind, &mut rec, &self.shared, input, output)?;
            rec.apply(&pass.after)?;
        }

        match acquired {
            Some(image) => {
                rec.transition(output, transfer_src_state(), false)?;
                let source = rec.attachment(output)?;
                let (src_image, src_extent) = (source.raw_image, source.extent);
                let swap_barrier = |src: ImageState, dst: ImageState| ImageBarrier {
                    image: image.image,
                    aspect: vk::ImageAspectFlags::COLOR,
                    layer_count: 1,
                    mip_levels: 1,
                    src,
                    dst,
                };
                rec.external_barriers(&[swap_barrier(ImageState::UNDEFINED, PRESENT_DST)]);
                rec.device
                    .cmd_blit_image(cmd, src_image, src_extent, image.image, image.extent);
                rec.external_barriers(&[swap_barrier(PRESENT_DST, PRESENT_SRC)]);
            }
            // Offscreen: leave the output sampleable for the host.
            None => rec.transition(output, sampled_state(), false)?,
        }
        Ok(())
    }

    fn poll_shaders(&mut self) {
        let interval = self.config.reload_check_interval;
        if interval == 0 || self.frames.frame_count() % interval != 0 {
            return;
        }
        let changed: Vec<usize> = self
            .passes
            .pipelines_mut()
            .into_iter()
            .enumerate()
            .filter_map(|(index, pipeline)| pipeline.detect_shader_changes().then_some(index))
            .collect();
        if !changed.is_empty() {
            self.reload_pipelines(|index| changed.contains(&index));
        }
    }

    /// Recompiles every pipeline. Failed pipelines keep running their previous version and
    /// their errors are published through [`shader_status`](Self::shader_status).
    pub fn reload_shaders(&mut self) -> bool {
        self.reload_pipelines(|_| true)
    }

    fn reload_pipelines(&mut self, selected: impl Fn(usize) -> bool) -> bool {
        let Some(retire) = retire_queue(&self.frames) else {
            return false;
        };
        let mut failures = Vec::new();
        for (index, pipeline) in self.passes.pipelines_mut().into_iter().enumerate() {
            if !selected(index) {
                continue;
            }
            if !pipeline.reload(&mut self.ctx, retire) {
                failures.push(format!(
                    "{}: {}",
                    pipeline.name(),
                    pipeline.last_error().unwrap_or("unknown error")
                ));
            }
        }
        self.shader_status = (!failures.is_empty()).then(|| failures.join("\n"));
        failures.is_empty()
    }

    /// Error text of the last failed shader reload, if the most recent attempt failed.
    pub fn shader_status(&self) -> Option<&str> {
        self.shader_status.as_deref()
    }

    /// Rebuilds the presentation target and every size-dependent attachment.
    /// A zero-sized window pauses rendering until the next non-zero resize.
    pub fn on_window_resize(&mut self, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            if !self.minimized {
                log::info!("[Attachments] Window minimized; rendering paused");
            }
            self.minimized = true;
            return Ok(());
        }
        self.minimized = false;
        let extent = vk::Extent2D { width, height };

        self.frames.wait_all(self.ctx.registry_mut())?;
        match self.ctx.device().resize_present_target(extent) {
            Ok(()) | Err(RenderError::NoPresentTarget) => {}
            Err(err) => return Err(err),
        }
        if extent != self.attachments.extent() {
            self.config.width = width;
            self.config.height = height;
            self.attachments.resize(&mut self.ctx, &self.config, extent)?;
            self.passes
                .update_attachment_bindings(self.ctx.device(), &self.shared, &self.attachments)?;
        }
        Ok(())
    }

    /// Uploads a mesh with its instances. Instances that cast shadows must come first.
    pub fn add_mesh(&mut self, name: &str, mesh: &PackedMesh, instances: &[InstanceData]) -> Result<MeshId> {
        let frame_count = self.frames.frame_count();
        let id = self
            .shared
            .add_mesh(&mut self.ctx, name, mesh, instances, frame_count)?;
        log::debug!("[Mesh] '{name}' added as {id:?} ({} instances)", instances.len());
        Ok(id)
    }

    /// Removes a mesh. Its buffers are destroyed once no in-flight frame can draw it.
    pub fn remove_mesh(&mut self, id: MeshId) -> Result<()> {
        let retire = retire_queue(&self.frames)
            .ok_or_else(|| RenderError::PassOrder("remove_mesh after shutdown".into()))?;
        self.shared.remove_mesh(id, retire, self.frames.frame_count())
    }

    /// Replaces the material table. Each frame slot copies it in at the start of its next
    /// frame, so frames already submitted keep reading the previous table.
    pub fn set_materials(&mut self, materials: &[MaterialData]) -> Result<()> {
        self.shared.set_materials(materials)
    }

    /// Appends a sampled texture to the bindless table and returns its shader index.
    pub fn register_texture(&mut self, view: vk::ImageView, sampler: vk::Sampler) -> Result<u32> {
        self.shared.bindless.register(self.ctx.device(), view, sampler)
    }

    /// Replaces the environment map the IBL cube is generated from. The descriptor write
    /// happens when the next frame records the prefilter, after its slot's fence wait.
    pub fn set_environment_source(&mut self, view: vk::ImageView, sampler: vk::Sampler) -> Result<()> {
        let ibl = self
            .passes
            .ibl
            .as_mut()
            .ok_or_else(|| RenderError::Config("image-based lighting and skybox are disabled".into()))?;
        ibl.set_source(view, sampler);
        Ok(())
    }

    pub fn post_fx_settings_mut(&mut self) -> Option<&mut PostFxSettings> {
        self.passes.post_fx.as_mut().map(|pass| pass.settings_mut())
    }

    pub fn set_volumetric_settings(&mut self, settings: VolumetricSettings) {
        if let Some(pass) = self.passes.volumetric.as_mut() {
            pass.set_settings(settings);
        }
    }

    /// The final color of the most recently rendered frame.
    pub fn display_handle(&self) -> Option<DisplayHandle> {
        let slot = self.last_rendered_slot?;
        let output = self.output_attachment();
        let attachment = self.attachments.get(slot, output).ok()?;
        Some(DisplayHandle {
            view: attachment.raw_view,
            sampler: self.shared.samplers.linear,
            extent: attachment.extent,
            layout: attachment.state.layout,
        })
    }

    fn output_attachment(&self) -> AttachmentId {
        if self.config.passes.post_fx {
            AttachmentId::FinalColor
        } else {
            AttachmentId::LightAccum
        }
    }

    pub fn stats(&self) -> &StatsCollector {
        &self.stats
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn context(&self) -> &DeviceContext {
        &self.ctx
    }

    pub fn attachments(&self) -> &Attachments {
        &self.attachments
    }

    pub fn passes(&self) -> &Passes {
        &self.passes
    }

    pub fn shared(&self) -> &SharedResources {
        &self.shared
    }

    pub fn cascades(&self) -> &CascadedShadowMap {
        &self.shadows
    }

    pub fn frame_count(&self) -> u64 {
        self.frames.frame_count()
    }

    pub fn is_minimized(&self) -> bool {
        self.minimized
    }

    /// Waits for the GPU, then destroys every GPU object the renderer created.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;
        let frames = self.frames.shutdown(self.ctx.registry_mut());
        let live = self.ctx.registry().total_live();
        self.ctx.shutdown()?;
        log::info!(
            "[Context] Renderer shut down after {} frames ({live} objects released)",
            self.stats.frames()
        );
        frames
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            log::error!("[Context] Shutdown during drop failed: {err}");
        }
    }
}

/// Deletion queue of the most recently submitted slot. It is flushed right after that
/// slot's fence is next waited on, by which point no frame recorded earlier can still use
/// what was retired into it.
fn retire_queue(frames: &FrameContext) -> Option<&DeletionQueue> {
    let previous = (frames.current_index() + FRAMES_IN_FLIGHT - 1) % FRAMES_IN_FLIGHT;
    frames.slot(previous).map(|slot| slot.deletion_queue())
}
