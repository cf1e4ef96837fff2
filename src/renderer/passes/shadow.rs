//! Cascaded shadow depth.
//!
//! All cascades render in one draw per mesh: the pipeline's view mask has one bit per
//! cascade and the vertex shader selects the light matrix with the view index.

use ash::vk;
use std::sync::Arc;

use super::{shader_path, PassRecorder, SharedResources, SET_FRAME, SET_MESH};
use crate::config::RendererConfig;
use crate::renderer::attachments::AttachmentId;
use crate::renderer::context::DeviceContext;
use crate::vulkan::{
    GraphicsPipelineDesc, LoadOp, Pipeline, PipelineParams, RenderingDesc, ShaderCompiler,
    ShaderSource,
};
use crate::Result;

/// View mask selecting the first `count` layers.
pub fn cascade_view_mask(count: u32) -> u32 {
    if count >= 32 {
        u32::MAX
    } else {
        (1u32 << count) - 1
    }
}

pub struct ShadowPass {
    pipeline: Pipeline,
    resolution: u32,
    view_mask: u32,
}

impl ShadowPass {
    pub fn new(
        ctx: &mut DeviceContext,
        compiler: &Arc<dyn ShaderCompiler>,
        config: &RendererConfig,
        shared: &SharedResources,
    ) -> Result<Self> {
        let view_mask = cascade_view_mask(config.cascades.cascade_count);
        let desc = GraphicsPipelineDesc {
            depth_format: AttachmentId::ShadowCascades.format(),
            depth_test: true,
            depth_write: true,
            depth_compare: vk::CompareOp::LESS_OR_EQUAL,
            depth_bias: true,
            // Front-face culling keeps acne off lit surfaces
            cull_mode: vk::CullModeFlags::FRONT,
            view_mask,
            ..Default::default()
        };
        let params = PipelineParams::graphics("shadow", desc)
            .with_shader(ShaderSource::vertex(shader_path(&config.shader_dir, "shadow.vert")))
            .with_shader(ShaderSource::fragment(shader_path(&config.shader_dir, "shadow.frag")))
            .with_set_layouts(&[
                shared.mesh_layout.raw(),
                shared.empty_layout.raw(),
                shared.frame_layout.raw(),
            ])
            .with_push_constants(vk::ShaderStageFlags::VERTEX, 16);
        let pipeline = Pipeline::create_graphics(ctx, Arc::clone(compiler), params)?;
        log::info!(
            "[Cascades] Shadow pass: {} cascades at {}px",
            config.cascades.cascade_count,
            config.cascades.resolution
        );
        Ok(Self {
            pipeline,
            resolution: config.cascades.resolution,
            view_mask,
        })
    }

    pub fn record(&self, rec: &mut PassRecorder<'_>, shared: &SharedResources) -> Result<()> {
        let extent = vk::Extent2D {
            width: self.resolution,
            height: self.resolution,
        };
        let desc = RenderingDesc {
            extent,
            layer_count: 1,
            view_mask: self.view_mask,
            color: Vec::new(),
            depth: Some(rec.depth_target(AttachmentId::ShadowCascades, LoadOp::Clear(1.0), false)?),
        };

        rec.begin_rendering(&desc);
        self.pipeline.bind(rec.device, rec.cmd, extent);
        self.pipeline
            .bind_descriptor_sets(rec.device, rec.cmd, SET_FRAME, &[shared.frame_set(rec.slot)]);

        // Casters are sorted to the front of each instance buffer.
        for entry in shared.meshes() {
            let mesh = &entry.mesh;
            if mesh.shadow_instance_count == 0 || mesh.index_count == 0 {
                continue;
            }
            self.pipeline
                .bind_descriptor_sets(rec.device, rec.cmd, SET_MESH, &[entry.set.raw()]);
            let index_offset = [(mesh.index_offset / 4) as u32, 0, 0, 0];
            self.pipeline
                .push_constants(rec.device, rec.cmd, vk::ShaderStageFlags::VERTEX, &index_offset);
            rec.draw(mesh.index_count, mesh.shadow_instance_count, 0, 0);
        }
        rec.end_rendering();
        Ok(())
    }

    pub fn view_mask(&self) -> u32 {
        self.view_mask
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
    fn view_mask_covers_each_cascade() {
        assert_eq!(cascade_view_mask(1), 0b1);
        assert_eq!(cascade_view_mask(4), 0b1111);
        assert_eq!(cascade_view_mask(32), u32::MAX);
    }
}
