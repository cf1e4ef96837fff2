//! G-buffer fill: every mesh instance writes base color, normal and material parameters.

use ash::vk;
use std::sync::Arc;

use super::{shader_path, PassRecorder, SharedResources, SET_MESH, SET_PASS};
use crate::config::RendererConfig;
use crate::renderer::attachments::AttachmentId;
use crate::renderer::context::DeviceContext;
use crate::vulkan::{
    GraphicsPipelineDesc, LoadOp, Pipeline, PipelineParams, RenderingDesc, ShaderCompiler,
    ShaderSource,
};
use crate::Result;

/// Push constants for one mesh draw.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GeometryPush {
    /// Offset of the first index in the geometry buffer, in 32-bit words
    pub index_offset: u32,
    pub _padding: [u32; 3],
}

pub struct GeometryPass {
    pipeline: Pipeline,
}

impl GeometryPass {
    pub fn new(
        ctx: &mut DeviceContext,
        compiler: &Arc<dyn ShaderCompiler>,
        config: &RendererConfig,
        shared: &SharedResources,
    ) -> Result<Self> {
        let desc = GraphicsPipelineDesc {
            color_formats: vec![
                AttachmentId::Albedo.format(),
                AttachmentId::Normal.format(),
                AttachmentId::Material.format(),
            ],
            depth_format: AttachmentId::Depth.format(),
            depth_test: true,
            depth_write: true,
            depth_compare: vk::CompareOp::LESS,
            ..Default::default()
        };
        let params = PipelineParams::graphics("geometry", desc)
            .with_shader(ShaderSource::vertex(shader_path(&config.shader_dir, "gbuffer.vert")))
            .with_shader(ShaderSource::fragment(shader_path(&config.shader_dir, "gbuffer.frag")))
            .with_set_layouts(&[
                shared.mesh_layout.raw(),
                shared.material_layout.raw(),
                shared.frame_layout.raw(),
                shared.bindless.layout().raw(),
            ])
            .with_push_constants(
                vk::ShaderStageFlags::VERTEX,
                std::mem::size_of::<GeometryPush>() as u32,
            );
        let pipeline = Pipeline::create_graphics(ctx, Arc::clone(compiler), params)?;
        Ok(Self { pipeline })
    }

    pub fn record(&self, rec: &mut PassRecorder<'_>, shared: &SharedResources) -> Result<()> {
        let extent = rec.extent();
        let clear = LoadOp::Clear([0.0, 0.0, 0.0, 0.0]);
        let desc = RenderingDesc {
            extent,
            layer_count: 1,
            view_mask: 0,
            color: vec![
                rec.color_target(AttachmentId::Albedo, clear)?,
                rec.color_target(AttachmentId::Normal, clear)?,
                rec.color_target(AttachmentId::Material, clear)?,
            ],
            depth: Some(rec.depth_target(AttachmentId::Depth, LoadOp::Clear(1.0), false)?),
        };

        rec.begin_rendering(&desc);
        self.pipeline.bind(rec.device, rec.cmd, extent);
        self.pipeline.bind_descriptor_sets(
            rec.device,
            rec.cmd,
            SET_PASS,
            &[
                shared.material_set(rec.slot),
                shared.frame_set(rec.slot),
                shared.bindless.set().raw(),
            ],
        );

        for entry in shared.meshes() {
            let mesh = &entry.mesh;
            if mesh.instance_count == 0 || mesh.index_count == 0 {
                continue;
            }
            self.pipeline
                .bind_descriptor_sets(rec.device, rec.cmd, SET_MESH, &[entry.set.raw()]);
            let push = GeometryPush {
                index_offset: (mesh.index_offset / 4) as u32,
                ..Default::default()
            };
            self.pipeline
                .push_constants(rec.device, rec.cmd, vk::ShaderStageFlags::VERTEX, &push);
            rec.draw(mesh.index_count, mesh.instance_count, 0, 0);
        }
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
