//! Environment background, drawn behind everything the geometry pass left at far depth.

use ash::vk;
use std::sync::Arc;

use super::{color_pass, fullscreen_pipeline, PassRecorder, SharedResources, SET_PASS};
use crate::config::RendererConfig;
use crate::renderer::attachments::{AttachmentId, Attachments};
use crate::renderer::context::DeviceContext;
use crate::renderer::frame_graph::sampled_state;
use crate::vulkan::{
    BlendMode, DescriptorPool, DescriptorSet, DescriptorSetLayoutBuilder, GraphicsPipelineDesc,
    LoadOp, Pipeline, ShaderCompiler,
};
use crate::Result;

pub struct SkyboxPass {
    pipeline: Pipeline,
    set: DescriptorSet,
}

impl SkyboxPass {
    pub fn new(
        ctx: &mut DeviceContext,
        compiler: &Arc<dyn ShaderCompiler>,
        config: &RendererConfig,
        shared: &SharedResources,
        attachments: &Attachments,
    ) -> Result<Self> {
        let layout = DescriptorSetLayoutBuilder::new()
            .add_combined_image_sampler(0, vk::ShaderStageFlags::FRAGMENT, 1)
            .create(ctx, "skybox")?;
        let pool = DescriptorPool::for_layout(ctx, &layout, 1)?;
        let set = DescriptorSet::create(ctx.device(), &pool, &layout, "skybox")?;
        // The environment cube is shared by both slots and never resized.
        set.batch()
            .sampled_image(
                0,
                attachments.view(0, AttachmentId::Environment)?,
                shared.samplers.linear,
                sampled_state().layout,
            )?
            .submit(ctx.device());

        let desc = GraphicsPipelineDesc {
            color_formats: vec![AttachmentId::LightAccum.format()],
            depth_format: AttachmentId::Depth.format(),
            depth_test: true,
            depth_write: false,
            depth_compare: vk::CompareOp::LESS_OR_EQUAL,
            blend: BlendMode::Opaque,
            ..Default::default()
        };
        let pipeline = fullscreen_pipeline(
            ctx,
            compiler,
            config,
            "skybox",
            "skybox.frag",
            desc,
            &shared.fullscreen_layouts(&layout),
            None,
        )?;
        Ok(Self { pipeline, set })
    }

    pub fn record(&self, rec: &mut PassRecorder<'_>, shared: &SharedResources) -> Result<()> {
        let extent = rec.extent();
        let mut desc = color_pass(extent, rec.color_target(AttachmentId::LightAccum, LoadOp::Load)?);
        desc.depth = Some(rec.depth_target(AttachmentId::Depth, LoadOp::Load, true)?);

        rec.begin_rendering(&desc);
        self.pipeline.bind(rec.device, rec.cmd, extent);
        self.pipeline.bind_descriptor_sets(
            rec.device,
            rec.cmd,
            SET_PASS,
            &[self.set.raw(), shared.frame_set(rec.slot)],
        );
        rec.draw_fullscreen();
        rec.end_rendering();
        Ok(())
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn pipeline_mut(&mut self) -> &mut Pipeline {
        &mut self.pipeline
    }
}
