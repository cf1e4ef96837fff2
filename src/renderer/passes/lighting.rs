//! Deferred lighting.
//!
//! The sun is one full-screen triangle; point lights are one instanced draw of a light
//! volume. Both blend additively into the accumulation target.

use ash::vk;
use glam::Vec3;
use std::sync::Arc;

use super::{
    fullscreen_pipeline, shader_path, FrameInput, PassRecorder, SharedResources, SET_PASS,
};
use crate::config::{RendererConfig, FRAMES_IN_FLIGHT};
use crate::renderer::attachments::{AttachmentId, Attachments};
use crate::renderer::context::DeviceContext;
use crate::renderer::frame_graph::sampled_state;
use crate::renderer::resource_registry::{BufferRecord, Handle};
use crate::renderer::resources::default_ambient;
use crate::vulkan::{
    BlendMode, BufferDesc, DescriptorPool, DescriptorSet, DescriptorSetLayout,
    DescriptorSetLayoutBuilder, GpuDevice, GraphicsPipelineDesc, LoadOp, MemoryLocation, Pipeline,
    PipelineParams, ShaderCompiler, ShaderSource,
};
use crate::Result;

use super::color_pass;

const BINDING_ALBEDO: u32 = 0;
const BINDING_NORMAL: u32 = 1;
const BINDING_MATERIAL: u32 = 2;
const BINDING_DEPTH: u32 = 3;
const BINDING_SHADOW: u32 = 4;
const BINDING_VOLUME: u32 = 5;
const BINDING_ENVIRONMENT: u32 = 6;

/// Vertices in [`light_volume_vertices`].
pub const LIGHT_VOLUME_VERTEX_COUNT: u32 = 60;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct LightingPush {
    /// rgb: ambient color used without image-based lighting
    pub ambient: [f32; 4],
    /// x: image-based lighting enabled, y: point light count
    pub flags: [u32; 4],
}

/// Unrolled triangle list of an icosahedron whose inscribed sphere has radius 1, so the
/// volume scaled by a light's radius always covers the light's full sphere.
pub fn light_volume_vertices() -> Vec<[f32; 4]> {
    let t = (1.0 + 5f32.sqrt()) / 2.0;
    // Inradius of this icosahedron is t² / √3.
    let scale = 3f32.sqrt() / (t * t);
    let corners = [
        Vec3::new(-1.0, t, 0.0),
        Vec3::new(1.0, t, 0.0),
        Vec3::new(-1.0, -t, 0.0),
        Vec3::new(1.0, -t, 0.0),
        Vec3::new(0.0, -1.0, t),
        Vec3::new(0.0, 1.0, t),
        Vec3::new(0.0, -1.0, -t),
        Vec3::new(0.0, 1.0, -t),
        Vec3::new(t, 0.0, -1.0),
        Vec3::new(t, 0.0, 1.0),
        Vec3::new(-t, 0.0, -1.0),
        Vec3::new(-t, 0.0, 1.0),
    ];
    const FACES: [[usize; 3]; 20] = [
        [0, 11, 5],
        [0, 5, 1],
        [0, 1, 7],
        [0, 7, 10],
        [0, 10, 11],
        [1, 5, 9],
        [5, 11, 4],
        [11, 10, 2],
        [10, 7, 6],
        [7, 1, 8],
        [3, 9, 4],
        [3, 4, 2],
        [3, 2, 6],
        [3, 6, 8],
        [3, 8, 9],
        [4, 9, 5],
        [2, 4, 11],
        [6, 2, 10],
        [8, 6, 7],
        [9, 8, 1],
    ];
    FACES
        .iter()
        .flat_map(|face| face.iter().map(|&i| (corners[i] * scale).extend(1.0).to_array()))
        .collect()
}

pub struct LightingPass {
    directional: Pipeline,
    point: Pipeline,
    layout: DescriptorSetLayout,
    sets: Vec<DescriptorSet>,
    volume: Handle<BufferRecord>,
    volume_raw: vk::Buffer,
    ibl: bool,
}

impl LightingPass {
    pub fn new(
        ctx: &mut DeviceContext,
        compiler: &Arc<dyn ShaderCompiler>,
        config: &RendererConfig,
        shared: &SharedResources,
        attachments: &Attachments,
    ) -> Result<Self> {
        let ibl = config.passes.ibl;
        let fragment = vk::ShaderStageFlags::FRAGMENT;
        let mut builder = DescriptorSetLayoutBuilder::new()
            .add_combined_image_sampler(BINDING_ALBEDO, fragment, 1)
            .add_combined_image_sampler(BINDING_NORMAL, fragment, 1)
            .add_combined_image_sampler(BINDING_MATERIAL, fragment, 1)
            .add_combined_image_sampler(BINDING_DEPTH, fragment, 1)
            .add_combined_image_sampler(BINDING_SHADOW, fragment, 1)
            .add_storage_buffer(BINDING_VOLUME, vk::ShaderStageFlags::VERTEX);
        if ibl {
            builder = builder.add_combined_image_sampler(BINDING_ENVIRONMENT, fragment, 1);
        }
        let layout = builder.create(ctx, "lighting_inputs")?;
        let pool = DescriptorPool::for_layout(ctx, &layout, FRAMES_IN_FLIGHT as u32)?;
        let sets = (0..FRAMES_IN_FLIGHT)
            .map(|slot| DescriptorSet::create(ctx.device(), &pool, &layout, &format!("lighting_{slot}")))
            .collect::<Result<Vec<_>>>()?;

        let vertices = light_volume_vertices();
        let bytes: &[u8] = bytemuck::cast_slice(&vertices);
        let volume = ctx.create_buffer(&BufferDesc {
            size: bytes.len() as u64,
            usage: vk::BufferUsageFlags::STORAGE_BUFFER,
            location: MemoryLocation::CpuToGpu,
            name: "light_volume".into(),
        })?;
        ctx.write_buffer(volume, 0, bytes)?;
        let volume_raw = ctx.buffer(volume)?;

        let set_layouts = shared.fullscreen_layouts(&layout);
        let push_size = std::mem::size_of::<LightingPush>() as u32;
        let accum = GraphicsPipelineDesc {
            color_formats: vec![AttachmentId::LightAccum.format()],
            blend: BlendMode::Additive,
            ..Default::default()
        };
        let directional = fullscreen_pipeline(
            ctx,
            compiler,
            config,
            "lighting_directional",
            "lighting_directional.frag",
            accum.clone(),
            &set_layouts,
            Some(push_size),
        )?;

        // Back faces only, so the volume still shades when the camera is inside it.
        let params = PipelineParams::graphics(
            "lighting_point",
            GraphicsPipelineDesc {
                cull_mode: vk::CullModeFlags::FRONT,
                ..accum
            },
        )
        .with_shader(ShaderSource::vertex(shader_path(&config.shader_dir, "light_volume.vert")))
        .with_shader(ShaderSource::fragment(shader_path(&config.shader_dir, "lighting_point.frag")))
        .with_set_layouts(&set_layouts)
        .with_push_constants(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT, push_size);
        let point = Pipeline::create_graphics(ctx, Arc::clone(compiler), params)?;

        let pass = Self {
            directional,
            point,
            layout,
            sets,
            volume,
            volume_raw,
            ibl,
        };
        pass.write_inputs(ctx.device(), shared, attachments)?;
        Ok(pass)
    }

    /// Points every slot's set at that slot's G-buffer and shadow cascades.
    pub fn write_inputs(
        &self,
        device: &dyn GpuDevice,
        shared: &SharedResources,
        attachments: &Attachments,
    ) -> Result<()> {
        let layout = sampled_state().layout;
        let samplers = &shared.samplers;
        for (slot, set) in self.sets.iter().enumerate() {
            let mut batch = set
                .batch()
                .sampled_image(BINDING_ALBEDO, attachments.view(slot, AttachmentId::Albedo)?, samplers.nearest, layout)?
                .sampled_image(BINDING_NORMAL, attachments.view(slot, AttachmentId::Normal)?, samplers.nearest, layout)?
                .sampled_image(BINDING_MATERIAL, attachments.view(slot, AttachmentId::Material)?, samplers.nearest, layout)?
                .sampled_image(BINDING_DEPTH, attachments.view(slot, AttachmentId::Depth)?, samplers.nearest, layout)?
                .sampled_image(BINDING_SHADOW, attachments.view(slot, AttachmentId::ShadowCascades)?, samplers.shadow, layout)?
                .storage_buffer(BINDING_VOLUME, self.volume_raw, vk::WHOLE_SIZE)?;
            if self.ibl {
                batch = batch.sampled_image(
                    BINDING_ENVIRONMENT,
                    attachments.view(slot, AttachmentId::Environment)?,
                    samplers.linear,
                    layout,
                )?;
            }
            let written = batch.submit(device);
            log::trace!("[Descriptors] Lighting set {slot}: {written} slots written");
        }
        Ok(())
    }

    pub fn record(
        &self,
        rec: &mut PassRecorder<'_>,
        shared: &SharedResources,
        input: &FrameInput<'_>,
    ) -> Result<()> {
        let extent = rec.extent();
        let target = rec.color_target(AttachmentId::LightAccum, LoadOp::Clear([0.0, 0.0, 0.0, 1.0]))?;
        let sets = [self.sets[rec.slot].raw(), shared.frame_set(rec.slot)];
        let light_count = input.lights.len() as u32;
        let push = LightingPush {
            ambient: (default_ambient() * input.sun.ambient.max(0.0) * 10.0).to_array(),
            flags: [self.ibl as u32, light_count, 0, 0],
        };
        let stages = vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT;

        rec.begin_rendering(&color_pass(extent, target));
        self.directional.bind(rec.device, rec.cmd, extent);
        self.directional
            .bind_descriptor_sets(rec.device, rec.cmd, SET_PASS, &sets);
        self.directional.push_constants(rec.device, rec.cmd, stages, &push);
        rec.draw_fullscreen();

        if light_count > 0 {
            self.point.bind(rec.device, rec.cmd, extent);
            self.point.bind_descriptor_sets(rec.device, rec.cmd, SET_PASS, &sets);
            self.point.push_constants(rec.device, rec.cmd, stages, &push);
            rec.draw(LIGHT_VOLUME_VERTEX_COUNT, light_count, 0, 0);
        }
        rec.end_rendering();
        Ok(())
    }

    pub fn layout(&self) -> &DescriptorSetLayout {
        &self.layout
    }

    pub fn volume_buffer(&self) -> Handle<BufferRecord> {
        self.volume
    }

    pub fn pipelines(&self) -> [&Pipeline; 2] {
        [&self.directional, &self.point]
    }

    pub fn pipelines_mut(&mut self) -> [&mut Pipeline; 2] {
        [&mut self.directional, &mut self.point]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn light_volume_encloses_unit_sphere() {
        let vertices = light_volume_vertices();
        assert_eq!(vertices.len() as u32, LIGHT_VOLUME_VERTEX_COUNT);
        for face in vertices.chunks(3) {
            let centroid = face
                .iter()
                .map(|v| Vec3::new(v[0], v[1], v[2]))
                .sum::<Vec3>()
                / 3.0;
            assert_relative_eq!(centroid.length(), 1.0, epsilon = 1e-5);
        }
    }
}
