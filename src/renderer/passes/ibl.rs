//! Environment cube generation for image-based lighting and the skybox.
//!
//! All six faces render in one multiview draw. The pass only runs when its source changed,
//! so the cube is persistent across frames and shared by both frame slots. The source
//! descriptor set is per slot: a new source is staged and written into a slot's set only
//! when that slot records, after its fence wait.

use ash::vk;
use std::sync::Arc;

use super::{color_pass, fullscreen_pipeline, PassRecorder, SharedResources, SET_PASS};
use crate::config::{RendererConfig, FRAMES_IN_FLIGHT};
use crate::renderer::attachments::AttachmentId;
use crate::renderer::context::DeviceContext;
use crate::renderer::frame_graph::sampled_state;
use crate::renderer::resource_registry::{Handle, ImageRecord, ImageViewRecord};
use crate::vulkan::{
    DescriptorPool, DescriptorSet, DescriptorSetLayoutBuilder, GpuDevice, GraphicsPipelineDesc,
    ImageBarrier, ImageDesc, ImageState, ImageViewDesc, LoadOp, Pipeline, ShaderCompiler,
};
use crate::Result;

/// One bit per cube face.
pub const CUBE_FACE_MASK: u32 = 0b11_1111;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct IblPush {
    /// Non-zero when a host environment map is bound; otherwise a procedural sky is used
    pub has_source: u32,
    pub _padding: [u32; 3],
}

/// 1x1 texture bound until the host supplies an environment map.
struct Placeholder {
    image: Handle<ImageRecord>,
    raw_image: vk::Image,
    view: Handle<ImageViewRecord>,
    initialized: bool,
}

pub struct IblPass {
    pipeline: Pipeline,
    sets: Vec<DescriptorSet>,
    /// Host environment map not yet written into every slot's set
    staged_source: Option<(vk::ImageView, vk::Sampler)>,
    stale_sets: [bool; FRAMES_IN_FLIGHT],
    placeholder: Placeholder,
    size: u32,
    has_source: bool,
    dirty: bool,
}

impl IblPass {
    pub fn new(
        ctx: &mut DeviceContext,
        compiler: &Arc<dyn ShaderCompiler>,
        config: &RendererConfig,
        shared: &SharedResources,
    ) -> Result<Self> {
        let layout = DescriptorSetLayoutBuilder::new()
            .add_combined_image_sampler(0, vk::ShaderStageFlags::FRAGMENT, 1)
            .create(ctx, "ibl_source")?;
        let pool = DescriptorPool::for_layout(ctx, &layout, FRAMES_IN_FLIGHT as u32)?;

        let format = vk::Format::R8G8B8A8_UNORM;
        let image = ctx.create_image(&ImageDesc {
            format,
            extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            array_layers: 1,
            mip_levels: 1,
            usage: vk::ImageUsageFlags::SAMPLED,
            cube_compatible: false,
            name: "ibl_placeholder".into(),
        })?;
        let raw_image = ctx.image(image)?.image;
        let view = ctx.create_image_view(&ImageViewDesc {
            image: raw_image,
            view_type: vk::ImageViewType::TYPE_2D,
            format,
            aspect: vk::ImageAspectFlags::COLOR,
            base_layer: 0,
            layer_count: 1,
        })?;
        let placeholder_view = ctx.image_view(view)?;
        let mut sets = Vec::with_capacity(FRAMES_IN_FLIGHT);
        for slot in 0..FRAMES_IN_FLIGHT {
            let set = DescriptorSet::create(ctx.device(), &pool, &layout, &format!("ibl_source_{slot}"))?;
            set.write_combined_image_sampler(
                ctx.device(),
                0,
                placeholder_view,
                shared.samplers.linear,
                sampled_state().layout,
            )?;
            sets.push(set);
        }

        let desc = GraphicsPipelineDesc {
            color_formats: vec![AttachmentId::Environment.format()],
            view_mask: CUBE_FACE_MASK,
            ..Default::default()
        };
        let pipeline = fullscreen_pipeline(
            ctx,
            compiler,
            config,
            "ibl_prefilter",
            "ibl_prefilter.frag",
            desc,
            &shared.fullscreen_layouts(&layout),
            Some(std::mem::size_of::<IblPush>() as u32),
        )?;

        Ok(Self {
            pipeline,
            sets,
            staged_source: None,
            stale_sets: [false; FRAMES_IN_FLIGHT],
            placeholder: Placeholder {
                image,
                raw_image,
                view,
                initialized: false,
            },
            size: config.environment_size,
            has_source: false,
            dirty: true,
        })
    }

    /// Stages an equirectangular environment map and schedules a regeneration.
    /// The view must already be in `SHADER_READ_ONLY_OPTIMAL` and stay alive until
    /// it is replaced.
    pub fn set_source(&mut self, view: vk::ImageView, sampler: vk::Sampler) {
        self.staged_source = Some((view, sampler));
        self.stale_sets = [true; FRAMES_IN_FLIGHT];
        self.has_source = true;
        self.dirty = true;
        log::info!("[Descriptors] Environment source staged; cube will be regenerated");
    }

    /// Whether `slot`'s set still points at an older source.
    pub fn has_pending_source(&self, slot: usize) -> bool {
        self.stale_sets.get(slot).copied().unwrap_or(false)
    }

    // Only called while recording `slot`, so no submitted frame still binds its set.
    fn refresh_source(&mut self, device: &dyn GpuDevice, slot: usize) -> Result<()> {
        if !self.stale_sets[slot] {
            return Ok(());
        }
        if let Some((view, sampler)) = self.staged_source {
            self.sets[slot].write_combined_image_sampler(device, 0, view, sampler, sampled_state().layout)?;
        }
        self.stale_sets[slot] = false;
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn record(&mut self, rec: &mut PassRecorder<'_>, shared: &SharedResources) -> Result<()> {
        self.refresh_source(rec.device, rec.slot)?;
        if !self.placeholder.initialized {
            rec.external_barriers(&[ImageBarrier {
                image: self.placeholder.raw_image,
                aspect: vk::ImageAspectFlags::COLOR,
                layer_count: 1,
                mip_levels: 1,
                src: ImageState::UNDEFINED,
                dst: sampled_state(),
            }]);
            self.placeholder.initialized = true;
        }

        let extent = vk::Extent2D {
            width: self.size,
            height: self.size,
        };
        let mut desc = color_pass(
            extent,
            rec.color_target(AttachmentId::Environment, LoadOp::Clear([0.0, 0.0, 0.0, 1.0]))?,
        );
        desc.view_mask = CUBE_FACE_MASK;

        rec.begin_rendering(&desc);
        self.pipeline.bind(rec.device, rec.cmd, extent);
        self.pipeline.bind_descriptor_sets(
            rec.device,
            rec.cmd,
            SET_PASS,
            &[self.sets[rec.slot].raw(), shared.frame_set(rec.slot)],
        );
        let push = IblPush {
            has_source: self.has_source as u32,
            ..Default::default()
        };
        self.pipeline.push_constants(
            rec.device,
            rec.cmd,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
            &push,
        );
        rec.draw_fullscreen();
        rec.end_rendering();

        self.dirty = false;
        log::debug!("[Pipeline] Environment cube regenerated ({}px)", self.size);
        Ok(())
    }

    pub fn placeholder_image(&self) -> Handle<ImageRecord> {
        self.placeholder.image
    }

    pub fn placeholder_view(&self) -> Handle<ImageViewRecord> {
        self.placeholder.view
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn pipeline_mut(&mut self) -> &mut Pipeline {
        &mut self.pipeline
    }
}
