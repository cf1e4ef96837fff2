//! Volumetric sun scattering.
//!
//! Ray-marches the shadow cascades into a scattering target, blurs it separably and adds the
//! result onto the light accumulation target. The blur ping-pongs between the two volumetric
//! attachments, so the pass moves them between target and sampled states itself.

use ash::vk;
use std::sync::Arc;

use super::{color_pass, fullscreen_pipeline, PassRecorder, SharedResources, SET_PASS};
use crate::config::{RendererConfig, FRAMES_IN_FLIGHT};
use crate::renderer::attachments::{AttachmentId, Attachments};
use crate::renderer::context::DeviceContext;
use crate::renderer::frame_graph::{sampled_state, AttachmentUse};
use crate::vulkan::{
    BlendMode, DescriptorPool, DescriptorSet, DescriptorSetLayoutBuilder,
    GpuDevice, GraphicsPipelineDesc, LoadOp, Pipeline, ShaderCompiler,
};
use crate::Result;

/// Scattering parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumetricSettings {
    /// Participating medium density
    pub density: f32,
    /// Henyey-Greenstein phase asymmetry in [-1, 1]
    pub anisotropy: f32,
    pub intensity: f32,
    /// Ray-march samples per pixel
    pub steps: u32,
}

impl Default for VolumetricSettings {
    fn default() -> Self {
        Self {
            density: 0.02,
            anisotropy: 0.6,
            intensity: 1.0,
            steps: 32,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct VolumetricPush {
    pub density: f32,
    pub anisotropy: f32,
    pub intensity: f32,
    pub steps: u32,
    /// Blur direction in texels; zero outside the blur passes
    pub direction: [f32; 2],
    pub _padding: [f32; 2],
}

/// Per-slot descriptor sets, one per sub-pass.
struct SlotSets {
    scatter: DescriptorSet,
    blur_h: DescriptorSet,
    blur_v: DescriptorSet,
    composite: DescriptorSet,
}

pub struct VolumetricPass {
    scatter: Pipeline,
    blur: Pipeline,
    composite: Pipeline,
    sets: Vec<SlotSets>,
    settings: VolumetricSettings,
}

impl VolumetricPass {
    pub fn new(
        ctx: &mut DeviceContext,
        compiler: &Arc<dyn ShaderCompiler>,
        config: &RendererConfig,
        shared: &SharedResources,
        attachments: &Attachments,
    ) -> Result<Self> {
        let fragment = vk::ShaderStageFlags::FRAGMENT;
        let scatter_layout = DescriptorSetLayoutBuilder::new()
            .add_combined_image_sampler(0, fragment, 1)
            .add_combined_image_sampler(1, fragment, 1)
            .create(ctx, "volumetric_scatter")?;
        let source_layout = DescriptorSetLayoutBuilder::new()
            .add_combined_image_sampler(0, fragment, 1)
            .create(ctx, "volumetric_source")?;

        let slots = FRAMES_IN_FLIGHT as u32;
        let scatter_pool = DescriptorPool::for_layout(ctx, &scatter_layout, slots)?;
        let source_pool = DescriptorPool::for_layout(ctx, &source_layout, slots * 3)?;
        let sets = (0..FRAMES_IN_FLIGHT)
            .map(|slot| -> Result<SlotSets> {
                let device = ctx.device();
                let source = |name: &str| {
                    DescriptorSet::create(device, &source_pool, &source_layout, &format!("{name}_{slot}"))
                };
                Ok(SlotSets {
                    scatter: DescriptorSet::create(
                        device,
                        &scatter_pool,
                        &scatter_layout,
                        &format!("volumetric_scatter_{slot}"),
                    )?,
                    blur_h: source("volumetric_blur_h")?,
                    blur_v: source("volumetric_blur_v")?,
                    composite: source("volumetric_composite")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let push_size = Some(std::mem::size_of::<VolumetricPush>() as u32);
        let target = |format: vk::Format, blend: BlendMode| GraphicsPipelineDesc {
            color_formats: vec![format],
            blend,
            ..Default::default()
        };
        let scatter = fullscreen_pipeline(
            ctx,
            compiler,
            config,
            "volumetric_scatter",
            "volumetric_scatter.frag",
            target(AttachmentId::Volumetric.format(), BlendMode::Opaque),
            &shared.fullscreen_layouts(&scatter_layout),
            push_size,
        )?;
        let blur = fullscreen_pipeline(
            ctx,
            compiler,
            config,
            "volumetric_blur",
            "volumetric_blur.frag",
            target(AttachmentId::VolumetricBlur.format(), BlendMode::Opaque),
            &shared.fullscreen_layouts(&source_layout),
            push_size,
        )?;
        let composite = fullscreen_pipeline(
            ctx,
            compiler,
            config,
            "volumetric_composite",
            "volumetric_composite.frag",
            target(AttachmentId::LightAccum.format(), BlendMode::Additive),
            &shared.fullscreen_layouts(&source_layout),
            push_size,
        )?;

        let pass = Self {
            scatter,
            blur,
            composite,
            sets,
            settings: VolumetricSettings::default(),
        };
        pass.write_inputs(ctx.device(), shared, attachments)?;
        Ok(pass)
    }

    pub fn write_inputs(
        &self,
        device: &dyn GpuDevice,
        shared: &SharedResources,
        attachments: &Attachments,
    ) -> Result<()> {
        let layout = sampled_state().layout;
        let linear = shared.samplers.linear;
        for (slot, sets) in self.sets.iter().enumerate() {
            let volumetric = attachments.view(slot, AttachmentId::Volumetric)?;
            let blurred = attachments.view(slot, AttachmentId::VolumetricBlur)?;
            sets.scatter
                .batch()
                .sampled_image(0, attachments.view(slot, AttachmentId::Depth)?, shared.samplers.nearest, layout)?
                .sampled_image(1, attachments.view(slot, AttachmentId::ShadowCascades)?, shared.samplers.shadow, layout)?
                .submit(device);
            sets.blur_h.batch().sampled_image(0, volumetric, linear, layout)?.submit(device);
            sets.blur_v.batch().sampled_image(0, blurred, linear, layout)?.submit(device);
            sets.composite.batch().sampled_image(0, volumetric, linear, layout)?.submit(device);
        }
        Ok(())
    }

    pub fn settings(&self) -> &VolumetricSettings {
        &self.settings
    }

    pub fn set_settings(&mut self, settings: VolumetricSettings) {
        self.settings = VolumetricSettings {
            anisotropy: settings.anisotropy.clamp(-0.99, 0.99),
            steps: settings.steps.max(1),
            ..settings
        };
    }

    pub fn record(&self, rec: &mut PassRecorder<'_>, shared: &SharedResources) -> Result<()> {
        let extent = rec.extent();
        let sets = &self.sets[rec.slot];
        let frame_set = shared.frame_set(rec.slot);
        let target_state = AttachmentUse::Produce.target_state(AttachmentId::Volumetric);
        let base = VolumetricPush {
            density: self.settings.density,
            anisotropy: self.settings.anisotropy,
            intensity: self.settings.intensity,
            steps: self.settings.steps,
            ..Default::default()
        };
        let texel = [1.0 / extent.width.max(1) as f32, 1.0 / extent.height.max(1) as f32];

        // Scatter
        self.draw(
            rec,
            &self.scatter,
            AttachmentId::Volumetric,
            LoadOp::DontCare,
            [sets.scatter.raw(), frame_set],
            &base,
        )?;

        // Horizontal blur: Volumetric -> VolumetricBlur
        rec.transition(AttachmentId::Volumetric, sampled_state(), false)?;
        rec.transition(AttachmentId::VolumetricBlur, target_state, true)?;
        let horizontal = VolumetricPush {
            direction: [texel[0], 0.0],
            ..base
        };
        self.draw(
            rec,
            &self.blur,
            AttachmentId::VolumetricBlur,
            LoadOp::DontCare,
            [sets.blur_h.raw(), frame_set],
            &horizontal,
        )?;

        // Vertical blur: VolumetricBlur -> Volumetric
        rec.transition(AttachmentId::VolumetricBlur, sampled_state(), false)?;
        rec.transition(AttachmentId::Volumetric, target_state, true)?;
        let vertical = VolumetricPush {
            direction: [0.0, texel[1]],
            ..base
        };
        self.draw(
            rec,
            &self.blur,
            AttachmentId::Volumetric,
            LoadOp::DontCare,
            [sets.blur_v.raw(), frame_set],
            &vertical,
        )?;

        // Composite onto the lit scene
        rec.transition(AttachmentId::Volumetric, sampled_state(), false)?;
        self.draw(
            rec,
            &self.composite,
            AttachmentId::LightAccum,
            LoadOp::Load,
            [sets.composite.raw(), frame_set],
            &base,
        )
    }

    fn draw(
        &self,
        rec: &mut PassRecorder<'_>,
        pipeline: &Pipeline,
        target: AttachmentId,
        load: LoadOp<[f32; 4]>,
        sets: [vk::DescriptorSet; 2],
        push: &VolumetricPush,
    ) -> Result<()> {
        let extent = rec.extent();
        let desc = color_pass(extent, rec.color_target(target, load)?);
        rec.begin_rendering(&desc);
        pipeline.bind(rec.device, rec.cmd, extent);
        pipeline.bind_descriptor_sets(rec.device, rec.cmd, SET_PASS, &sets);
        pipeline.push_constants(
            rec.device,
            rec.cmd,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
            push,
        );
        rec.draw_fullscreen();
        rec.end_rendering();
        Ok(())
    }

    pub fn pipelines(&self) -> [&Pipeline; 3] {
        [&self.scatter, &self.blur, &self.composite]
    }

    pub fn pipelines_mut(&mut self) -> [&mut Pipeline; 3] {
        [&mut self.scatter, &mut self.blur, &mut self.composite]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_block_is_tightly_packed() {
        assert_eq!(std::mem::size_of::<VolumetricPush>(), 32);
    }

    #[test]
    fn default_settings_are_forward_scattering() {
        let settings = VolumetricSettings::default();
        assert!(settings.anisotropy > 0.0);
        assert!(settings.steps > 0);
    }
}
