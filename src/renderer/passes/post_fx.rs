//! Post-processing: HDR to display tonemapping, exposure, gamma and vignette.

use ash::vk;
use std::sync::Arc;

use super::{color_pass, fullscreen_pipeline, PassRecorder, SharedResources, SET_PASS};
use crate::config::{RendererConfig, FRAMES_IN_FLIGHT};
use crate::renderer::attachments::{AttachmentId, Attachments};
use crate::renderer::context::DeviceContext;
use crate::renderer::frame_graph::sampled_state;
use crate::vulkan::{
    DescriptorPool, DescriptorSet, DescriptorSetLayoutBuilder, GpuDevice, GraphicsPipelineDesc,
    LoadOp, Pipeline, ShaderCompiler,
};
use crate::Result;

/// Tonemapping operator selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TonemapOperator {
    /// ACES filmic curve
    #[default]
    Aces,
    /// Reinhard, softer highlights
    Reinhard,
    /// Uncharted 2 filmic
    Uncharted2,
    /// Clamp only
    None,
}

impl TonemapOperator {
    /// Index the fragment shader switches on.
    pub fn shader_index(self) -> u32 {
        match self {
            Self::Aces => 0,
            Self::Reinhard => 1,
            Self::Uncharted2 => 2,
            Self::None => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PostFxSettings {
    pub operator: TonemapOperator,
    /// Exposure multiplier (1.0 = neutral)
    pub exposure: f32,
    /// 2.2 = standard sRGB
    pub gamma: f32,
    /// Vignette strength, 0 disables it
    pub vignette: f32,
}

impl Default for PostFxSettings {
    fn default() -> Self {
        Self {
            operator: TonemapOperator::Aces,
            exposure: 1.0,
            gamma: 2.2,
            vignette: 0.0,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct PostFxPush {
    pub exposure: f32,
    pub gamma: f32,
    pub vignette: f32,
    pub operator: u32,
}

impl From<&PostFxSettings> for PostFxPush {
    fn from(settings: &PostFxSettings) -> Self {
        Self {
            exposure: settings.exposure,
            gamma: settings.gamma,
            vignette: settings.vignette,
            operator: settings.operator.shader_index(),
        }
    }
}

pub struct PostFxPass {
    pipeline: Pipeline,
    sets: Vec<DescriptorSet>,
    settings: PostFxSettings,
}

impl PostFxPass {
    pub fn new(
        ctx: &mut DeviceContext,
        compiler: &Arc<dyn ShaderCompiler>,
        config: &RendererConfig,
        shared: &SharedResources,
        attachments: &Attachments,
    ) -> Result<Self> {
        let layout = DescriptorSetLayoutBuilder::new()
            .add_combined_image_sampler(0, vk::ShaderStageFlags::FRAGMENT, 1)
            .create(ctx, "post_fx")?;
        let pool = DescriptorPool::for_layout(ctx, &layout, FRAMES_IN_FLIGHT as u32)?;
        let sets = (0..FRAMES_IN_FLIGHT)
            .map(|slot| DescriptorSet::create(ctx.device(), &pool, &layout, &format!("post_fx_{slot}")))
            .collect::<Result<Vec<_>>>()?;

        let pipeline = fullscreen_pipeline(
            ctx,
            compiler,
            config,
            "post_fx",
            "post_fx.frag",
            GraphicsPipelineDesc {
                color_formats: vec![AttachmentId::FinalColor.format()],
                ..Default::default()
            },
            &shared.fullscreen_layouts(&layout),
            Some(std::mem::size_of::<PostFxPush>() as u32),
        )?;

        let pass = Self {
            pipeline,
            sets,
            settings: PostFxSettings::default(),
        };
        pass.write_inputs(ctx.device(), shared, attachments)?;
        log::info!("[Pipeline] Post-FX ready (operator: {:?})", pass.settings.operator);
        Ok(pass)
    }

    pub fn write_inputs(
        &self,
        device: &dyn GpuDevice,
        shared: &SharedResources,
        attachments: &Attachments,
    ) -> Result<()> {
        for (slot, set) in self.sets.iter().enumerate() {
            set.batch()
                .sampled_image(
                    0,
                    attachments.view(slot, AttachmentId::LightAccum)?,
                    shared.samplers.linear,
                    sampled_state().layout,
                )?
                .submit(device);
        }
        Ok(())
    }

    pub fn settings(&self) -> &PostFxSettings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut PostFxSettings {
        &mut self.settings
    }

    pub fn record(&self, rec: &mut PassRecorder<'_>, shared: &SharedResources) -> Result<()> {
        let extent = rec.extent();
        let desc = color_pass(extent, rec.color_target(AttachmentId::FinalColor, LoadOp::DontCare)?);
        rec.begin_rendering(&desc);
        self.pipeline.bind(rec.device, rec.cmd, extent);
        self.pipeline.bind_descriptor_sets(
            rec.device,
            rec.cmd,
            SET_PASS,
            &[self.sets[rec.slot].raw(), shared.frame_set(rec.slot)],
        );
        self.pipeline.push_constants(
            rec.device,
            rec.cmd,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
            &PostFxPush::from(&self.settings),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_carries_operator_index() {
        let settings = PostFxSettings {
            operator: TonemapOperator::Uncharted2,
            exposure: 1.5,
            ..Default::default()
        };
        let push = PostFxPush::from(&settings);
        assert_eq!(push.operator, 2);
        assert_eq!(push.exposure, 1.5);
        assert_eq!(push.gamma, 2.2);
    }
}
