//! The built-in render passes and the resources they share.
//!
//! Every pass owns its pipelines and descriptor sets and records through a [`PassRecorder`].
//! Descriptor sets are bound in a fixed slot order: mesh-local at [`SET_MESH`], pass inputs
//! at [`SET_PASS`], per-frame data at [`SET_FRAME`] and the bindless table at
//! [`SET_BINDLESS`]. Passes without per-mesh data bind an empty layout at slot 0.

pub mod geometry;
pub mod ibl;
pub mod lighting;
pub mod post_fx;
pub mod shadow;
pub mod skybox;
pub mod ui;
pub mod volumetric;

use ash::vk;
use glam::{Mat4, Vec3};
use std::path::Path;
use std::sync::Arc;

use super::attachments::{Attachment, AttachmentId, Attachments};
use super::context::DeviceContext;
use super::frame_graph::{PassKind, PlannedBarrier};
use super::render_stats::FrameStats;
use super::resource_registry::{BufferRecord, Handle, SamplerRecord};
use super::resources::{
    CascadeInput, GpuCascadeData, GpuMesh, FrameUniforms, InstanceData, LightData, MaterialData,
    PackedMesh, MAX_MATERIALS,
};
use crate::config::{RendererConfig, FRAMES_IN_FLIGHT, MAX_BINDLESS_TEXTURES};
use crate::vulkan::{
    BindlessTextureTable, BufferDesc, ColorTarget, DeletionQueue, DepthTarget, DescriptorPool,
    DescriptorSet, DescriptorSetLayout, DescriptorSetLayoutBuilder, GpuDevice,
    GraphicsPipelineDesc, ImageBarrier, ImageState, LoadOp, MemoryLocation, Pipeline,
    PipelineParams, RenderingDesc, SamplerDesc, ShaderCompiler, ShaderSource,
};
use crate::{RenderError, Result};

pub use geometry::GeometryPass;
pub use ibl::IblPass;
pub use lighting::{light_volume_vertices, LightingPass};
pub use post_fx::{PostFxPass, PostFxSettings, TonemapOperator};
pub use shadow::ShadowPass;
pub use skybox::SkyboxPass;
pub use ui::{UiDrawCmd, UiDrawList, UiPass, UiVertex};
pub use volumetric::{VolumetricPass, VolumetricSettings};

pub const SET_MESH: u32 = 0;
pub const SET_PASS: u32 = 1;
pub const SET_FRAME: u32 = 2;
pub const SET_BINDLESS: u32 = 3;

/// Mesh descriptor sets preallocated for the scene.
pub const MAX_MESHES: u32 = 256;

/// Camera the frame is rendered from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SceneCamera {
    pub view: Mat4,
    pub position: Vec3,
    pub fov_y: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for SceneCamera {
    fn default() -> Self {
        Self::look_at(Vec3::new(0.0, 2.0, 8.0), Vec3::ZERO, 60f32.to_radians(), 0.1, 100.0)
    }
}

impl SceneCamera {
    pub fn look_at(eye: Vec3, target: Vec3, fov_y: f32, near: f32, far: f32) -> Self {
        Self {
            view: Mat4::look_at_rh(eye, target, Vec3::Y),
            position: eye,
            fov_y,
            near,
            far,
        }
    }

    /// Right-handed perspective with depth in [0, 1], Y flipped for Vulkan clip space.
    pub fn projection(&self, aspect: f32) -> Mat4 {
        let mut projection = Mat4::perspective_rh(self.fov_y, aspect, self.near, self.far);
        projection.y_axis.y *= -1.0;
        projection
    }

    pub fn cascade_input(&self, aspect: f32, light_dir: Vec3) -> CascadeInput {
        CascadeInput::from_perspective(self.view, self.fov_y, aspect, self.near, self.far, light_dir)
    }
}

/// The sun.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirectionalLight {
    /// Direction the light travels in
    pub direction: Vec3,
    pub color: Vec3,
    pub intensity: f32,
    pub ambient: f32,
}

impl Default for DirectionalLight {
    fn default() -> Self {
        Self {
            direction: Vec3::new(-0.3, -1.0, -0.2).normalize(),
            color: Vec3::ONE,
            intensity: 3.0,
            ambient: 0.1,
        }
    }
}

/// Everything the host supplies for one frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameInput<'a> {
    pub camera: SceneCamera,
    pub sun: DirectionalLight,
    pub lights: &'a LightData,
    pub ui: Option<&'a UiDrawList>,
    /// Seconds since start
    pub time: f32,
}

impl<'a> FrameInput<'a> {
    pub fn new(camera: SceneCamera, sun: DirectionalLight, lights: &'a LightData) -> Self {
        Self {
            camera,
            sun,
            lights,
            ui: None,
            time: 0.0,
        }
    }

    pub fn with_ui(mut self, ui: &'a UiDrawList) -> Self {
        self.ui = Some(ui);
        self
    }

    pub fn with_time(mut self, seconds: f32) -> Self {
        self.time = seconds;
        self
    }
}

/// Index of a mesh registered with the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MeshId(pub usize);

/// A resident mesh and its mesh-local descriptor set.
#[derive(Debug)]
pub struct MeshEntry {
    pub mesh: GpuMesh,
    pub set: DescriptorSet,
}

/// Host-visible buffers written once per frame, one set per frame slot.
#[derive(Debug, Clone, Copy)]
pub struct SlotBuffers {
    pub frame: Handle<BufferRecord>,
    pub cascades: Handle<BufferRecord>,
    pub lights: Handle<BufferRecord>,
    pub frame_raw: vk::Buffer,
    pub cascades_raw: vk::Buffer,
    pub lights_raw: vk::Buffer,
}

impl SlotBuffers {
    fn new(ctx: &mut DeviceContext, slot: usize) -> Result<Self> {
        let frame = ctx.create_buffer(&BufferDesc {
            size: std::mem::size_of::<FrameUniforms>() as u64,
            usage: vk::BufferUsageFlags::UNIFORM_BUFFER,
            location: MemoryLocation::CpuToGpu,
            name: format!("frame_uniforms_{slot}"),
        })?;
        let cascades = ctx.create_buffer(&BufferDesc {
            size: std::mem::size_of::<GpuCascadeData>() as u64,
            usage: vk::BufferUsageFlags::UNIFORM_BUFFER,
            location: MemoryLocation::CpuToGpu,
            name: format!("cascades_{slot}"),
        })?;
        let lights = ctx.create_buffer(&BufferDesc {
            size: LightData::buffer_size(),
            usage: vk::BufferUsageFlags::STORAGE_BUFFER,
            location: MemoryLocation::CpuToGpu,
            name: format!("lights_{slot}"),
        })?;
        Ok(Self {
            frame,
            cascades,
            lights,
            frame_raw: ctx.buffer(frame)?,
            cascades_raw: ctx.buffer(cascades)?,
            lights_raw: ctx.buffer(lights)?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Samplers {
    pub linear: vk::Sampler,
    pub nearest: vk::Sampler,
    pub shadow: vk::Sampler,
    linear_handle: Handle<SamplerRecord>,
}

impl Samplers {
    fn new(ctx: &mut DeviceContext) -> Result<Self> {
        let linear_handle = ctx.create_sampler(&SamplerDesc::linear_clamp())?;
        let nearest = ctx.create_sampler(&SamplerDesc::nearest_clamp())?;
        let shadow = ctx.create_sampler(&SamplerDesc::shadow_compare())?;
        Ok(Self {
            linear: ctx.sampler(linear_handle)?,
            nearest: ctx.sampler(nearest)?,
            shadow: ctx.sampler(shadow)?,
            linear_handle,
        })
    }

    pub fn linear_handle(&self) -> Handle<SamplerRecord> {
        self.linear_handle
    }
}

/// Layouts, per-frame buffers, samplers and scene data every pass reads.
pub struct SharedResources {
    pub empty_layout: DescriptorSetLayout,
    pub mesh_layout: DescriptorSetLayout,
    pub frame_layout: DescriptorSetLayout,
    pub material_layout: DescriptorSetLayout,
    mesh_pool: DescriptorPool,
    frame_sets: Vec<DescriptorSet>,
    material_sets: Vec<DescriptorSet>,
    buffers: Vec<SlotBuffers>,
    pub samplers: Samplers,
    pub bindless: BindlessTextureTable,
    /// One material table per slot; staged tables are copied in after the slot's fence wait
    materials: Vec<Handle<BufferRecord>>,
    staged_materials: Vec<MaterialData>,
    stale_materials: [bool; FRAMES_IN_FLIGHT],
    meshes: Vec<Option<MeshEntry>>,
    /// Sets of removed meshes and the frame count from which no submitted frame can bind them
    spare_sets: Vec<(DescriptorSet, u64)>,
    allocated_mesh_sets: u32,
}

impl SharedResources {
    pub fn new(ctx: &mut DeviceContext) -> Result<Self> {
        let empty_layout = DescriptorSetLayoutBuilder::new().create(ctx, "empty")?;
        let mesh_layout = DescriptorSetLayoutBuilder::new()
            .add_storage_buffer(0, vk::ShaderStageFlags::VERTEX)
            .add_storage_buffer(1, vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
            .create(ctx, "mesh")?;
        let frame_layout = DescriptorSetLayoutBuilder::new()
            .add_uniform_buffer(0, vk::ShaderStageFlags::ALL_GRAPHICS)
            .add_uniform_buffer(1, vk::ShaderStageFlags::ALL_GRAPHICS)
            .add_storage_buffer(2, vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
            .create(ctx, "frame")?;
        let material_layout = DescriptorSetLayoutBuilder::new()
            .add_storage_buffer(0, vk::ShaderStageFlags::FRAGMENT)
            .create(ctx, "materials")?;

        let frame_pool = DescriptorPool::for_layouts(
            ctx,
            &[&frame_layout, &material_layout],
            FRAMES_IN_FLIGHT as u32,
        )?;
        let mesh_pool = DescriptorPool::for_layout(ctx, &mesh_layout, MAX_MESHES)?;

        let mut buffers = Vec::with_capacity(FRAMES_IN_FLIGHT);
        let mut frame_sets = Vec::with_capacity(FRAMES_IN_FLIGHT);
        for slot in 0..FRAMES_IN_FLIGHT {
            let slot_buffers = SlotBuffers::new(ctx, slot)?;
            let set = DescriptorSet::create(ctx.device(), &frame_pool, &frame_layout, &format!("frame_{slot}"))?;
            set.batch()
                .uniform_buffer(0, slot_buffers.frame_raw, std::mem::size_of::<FrameUniforms>() as u64)?
                .uniform_buffer(1, slot_buffers.cascades_raw, std::mem::size_of::<GpuCascadeData>() as u64)?
                .storage_buffer(2, slot_buffers.lights_raw, LightData::buffer_size())?
                .submit(ctx.device());
            buffers.push(slot_buffers);
            frame_sets.push(set);
        }

        let material_size = (std::mem::size_of::<MaterialData>() * MAX_MATERIALS) as u64;
        let mut materials = Vec::with_capacity(FRAMES_IN_FLIGHT);
        let mut material_sets = Vec::with_capacity(FRAMES_IN_FLIGHT);
        for slot in 0..FRAMES_IN_FLIGHT {
            let buffer = ctx.create_buffer(&BufferDesc {
                size: material_size,
                usage: vk::BufferUsageFlags::STORAGE_BUFFER,
                location: MemoryLocation::CpuToGpu,
                name: format!("materials_{slot}"),
            })?;
            ctx.upload(buffer, &MaterialData::default())?;
            let set = DescriptorSet::create(ctx.device(), &frame_pool, &material_layout, &format!("materials_{slot}"))?;
            set.write_storage_buffer(ctx.device(), 0, ctx.buffer(buffer)?, 0, material_size)?;
            materials.push(buffer);
            material_sets.push(set);
        }

        let samplers = Samplers::new(ctx)?;
        let bindless = BindlessTextureTable::new(ctx, MAX_BINDLESS_TEXTURES)?;

        Ok(Self {
            empty_layout,
            mesh_layout,
            frame_layout,
            material_layout,
            mesh_pool,
            frame_sets,
            material_sets,
            buffers,
            samplers,
            bindless,
            materials,
            staged_materials: Vec::new(),
            stale_materials: [false; FRAMES_IN_FLIGHT],
            meshes: Vec::new(),
            spare_sets: Vec::new(),
            allocated_mesh_sets: 0,
        })
    }

    pub fn slot_buffers(&self, slot: usize) -> &SlotBuffers {
        &self.buffers[slot]
    }

    pub fn frame_set(&self, slot: usize) -> vk::DescriptorSet {
        self.frame_sets[slot].raw()
    }

    pub fn material_set(&self, slot: usize) -> vk::DescriptorSet {
        self.material_sets[slot].raw()
    }

    pub fn material_buffer(&self, slot: usize) -> Handle<BufferRecord> {
        self.materials[slot]
    }

    /// Writes this frame's uniforms, cascades and lights into `slot`'s buffers, plus the
    /// staged material table if the slot has not seen it yet. Only call after the slot's
    /// fence wait.
    pub fn upload_frame(
        &mut self,
        ctx: &DeviceContext,
        slot: usize,
        uniforms: &FrameUniforms,
        cascades: &GpuCascadeData,
        lights: &LightData,
    ) -> Result<()> {
        let buffers = &self.buffers[slot];
        ctx.upload(buffers.frame, uniforms)?;
        ctx.upload(buffers.cascades, cascades)?;
        ctx.write_buffer(buffers.lights, 0, &lights.to_bytes())?;
        if self.stale_materials[slot] {
            if !self.staged_materials.is_empty() {
                ctx.upload_slice(self.materials[slot], &self.staged_materials)?;
            }
            self.stale_materials[slot] = false;
            if !self.stale_materials.contains(&true) {
                self.staged_materials = Vec::new();
            }
        }
        Ok(())
    }

    /// Stages a new material table. Each slot picks it up in
    /// [`upload_frame`](Self::upload_frame), once its previous submission has finished.
    pub fn set_materials(&mut self, materials: &[MaterialData]) -> Result<()> {
        if materials.len() > MAX_MATERIALS {
            return Err(RenderError::Config(format!(
                "{} materials exceed the limit of {MAX_MATERIALS}",
                materials.len()
            )));
        }
        self.staged_materials = materials.to_vec();
        self.stale_materials = [true; FRAMES_IN_FLIGHT];
        Ok(())
    }

    /// Uploads a mesh and binds it to a mesh-local descriptor set. `frame_count` is the
    /// number of frames submitted so far; sets of removed meshes are only rewritten once
    /// every frame that could bind them has finished.
    pub fn add_mesh(
        &mut self,
        ctx: &mut DeviceContext,
        name: &str,
        mesh: &PackedMesh,
        instances: &[InstanceData],
        frame_count: u64,
    ) -> Result<MeshId> {
        let reusable = self
            .spare_sets
            .iter()
            .position(|(_, reusable_from)| *reusable_from <= frame_count);
        let spare = reusable.map(|index| self.spare_sets.swap_remove(index).0);
        if spare.is_none() && self.allocated_mesh_sets >= MAX_MESHES {
            return Err(RenderError::Config(format!(
                "mesh limit of {MAX_MESHES} reached"
            )));
        }
        let gpu = GpuMesh::upload(ctx, name, mesh, instances)?;
        let set = match spare {
            Some(set) => set,
            None => {
                self.allocated_mesh_sets += 1;
                DescriptorSet::create(ctx.device(), &self.mesh_pool, &self.mesh_layout, name)?
            }
        };
        set.batch()
            .storage_buffer(0, ctx.buffer(gpu.geometry)?, ctx.buffer_size(gpu.geometry)?)?
            .storage_buffer(1, ctx.buffer(gpu.instances)?, ctx.buffer_size(gpu.instances)?)?
            .submit(ctx.device());

        let entry = MeshEntry { mesh: gpu, set };
        let id = match self.meshes.iter().position(Option::is_none) {
            Some(index) => {
                self.meshes[index] = Some(entry);
                MeshId(index)
            }
            None => {
                self.meshes.push(Some(entry));
                MeshId(self.meshes.len() - 1)
            }
        };
        Ok(id)
    }

    /// Retires a mesh's buffers once the slots that may still draw it have finished.
    /// `frame_count` is the number of frames submitted so far.
    pub fn remove_mesh(&mut self, id: MeshId, retire: &DeletionQueue, frame_count: u64) -> Result<()> {
        let entry = self
            .meshes
            .get_mut(id.0)
            .and_then(Option::take)
            .ok_or_else(|| RenderError::Config(format!("no mesh with id {}", id.0)))?;
        retire.retire(entry.mesh.geometry);
        retire.retire(entry.mesh.instances);
        // The last frame that may bind the set is `frame_count - 1`; its fence is waited
        // when its slot starts frame `frame_count + 1`.
        self.spare_sets
            .push((entry.set, frame_count + FRAMES_IN_FLIGHT as u64));
        log::debug!("[Mesh] '{}' retired", entry.mesh.name);
        Ok(())
    }

    pub fn mesh(&self, id: MeshId) -> Option<&MeshEntry> {
        self.meshes.get(id.0).and_then(Option::as_ref)
    }

    pub fn meshes(&self) -> impl Iterator<Item = &MeshEntry> + '_ {
        self.meshes.iter().flatten()
    }

    pub fn mesh_count(&self) -> usize {
        self.meshes().count()
    }

    /// Slot 0 (empty), pass layout, frame layout.
    pub fn fullscreen_layouts(&self, pass: &DescriptorSetLayout) -> [vk::DescriptorSetLayout; 3] {
        [self.empty_layout.raw(), pass.raw(), self.frame_layout.raw()]
    }
}

/// Command recording scope handed to a pass.
pub struct PassRecorder<'a> {
    pub device: &'a dyn GpuDevice,
    pub cmd: vk::CommandBuffer,
    pub slot: usize,
    pub attachments: &'a mut Attachments,
    pub stats: &'a mut FrameStats,
}

impl<'a> PassRecorder<'a> {
    pub fn extent(&self) -> vk::Extent2D {
        self.attachments.extent()
    }

    pub fn attachment(&self, id: AttachmentId) -> Result<&Attachment> {
        self.attachments.get(self.slot, id)
    }

    /// Issues the planned transitions as one barrier batch, using each attachment's live
    /// state as the source.
    pub fn apply(&mut self, planned: &[PlannedBarrier]) -> Result<()> {
        let mut barriers = Vec::with_capacity(planned.len());
        for barrier in planned {
            if let Some(native) = self.barrier_for(barrier.attachment, barrier.dst, barrier.discards(), true)? {
                barriers.push(native);
            }
        }
        self.flush(&barriers);
        Ok(())
    }

    /// Moves one attachment to `dst` unless it is already there.
    pub fn transition(&mut self, id: AttachmentId, dst: ImageState, discard: bool) -> Result<()> {
        if let Some(native) = self.barrier_for(id, dst, discard, false)? {
            self.flush(&[native]);
        }
        Ok(())
    }

    /// Records raw barriers on images the attachment set does not track.
    pub fn external_barriers(&mut self, barriers: &[ImageBarrier]) {
        self.flush(barriers);
    }

    fn flush(&mut self, barriers: &[ImageBarrier]) {
        if barriers.is_empty() {
            return;
        }
        self.device.cmd_image_barriers(self.cmd, barriers);
        self.stats.barriers += barriers.len() as u32;
    }

    fn barrier_for(
        &mut self,
        id: AttachmentId,
        dst: ImageState,
        discard: bool,
        force: bool,
    ) -> Result<Option<ImageBarrier>> {
        let attachment = self.attachments.get_mut(self.slot, id)?;
        let src = attachment.state;
        if src == dst && !discard && !force {
            return Ok(None);
        }
        let barrier = ImageBarrier {
            image: attachment.raw_image,
            aspect: attachment.aspect(),
            layer_count: attachment.layers,
            mip_levels: 1,
            src: ImageState {
                layout: if discard {
                    vk::ImageLayout::UNDEFINED
                } else {
                    src.layout
                },
                ..src
            },
            dst,
        };
        attachment.state = dst;
        Ok(Some(barrier))
    }

    pub fn color_target(&self, id: AttachmentId, load: LoadOp<[f32; 4]>) -> Result<ColorTarget> {
        Ok(ColorTarget {
            view: self.attachment(id)?.target_view,
            load,
            store: true,
        })
    }

    pub fn depth_target(&self, id: AttachmentId, load: LoadOp<f32>, read_only: bool) -> Result<DepthTarget> {
        Ok(DepthTarget {
            view: self.attachment(id)?.target_view,
            load,
            store: !read_only,
            read_only,
        })
    }

    pub fn begin_rendering(&mut self, desc: &RenderingDesc) {
        self.device.cmd_begin_rendering(self.cmd, desc);
    }

    pub fn end_rendering(&mut self) {
        self.device.cmd_end_rendering(self.cmd);
    }

    pub fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        self.device
            .cmd_draw(self.cmd, vertex_count, instance_count, first_vertex, first_instance);
        self.stats.record_draw(instance_count);
    }

    /// One triangle covering the target; positions come from the vertex index.
    pub fn draw_fullscreen(&mut self) {
        self.draw(3, 1, 0, 0);
    }
}

/// Single-target rendering scope over the full attachment extent.
pub(crate) fn color_pass(extent: vk::Extent2D, target: ColorTarget) -> RenderingDesc {
    RenderingDesc {
        extent,
        layer_count: 1,
        view_mask: 0,
        color: vec![target],
        depth: None,
    }
}

pub(crate) fn shader_path(dir: &Path, name: &str) -> std::path::PathBuf {
    dir.join(name)
}

/// Full-screen triangle pipeline: shared vertex stage plus `fragment`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn fullscreen_pipeline(
    ctx: &mut DeviceContext,
    compiler: &Arc<dyn ShaderCompiler>,
    config: &RendererConfig,
    name: &str,
    fragment: &str,
    desc: GraphicsPipelineDesc,
    set_layouts: &[vk::DescriptorSetLayout],
    push_constant_size: Option<u32>,
) -> Result<Pipeline> {
    let mut params = PipelineParams::graphics(
        name,
        GraphicsPipelineDesc {
            cull_mode: vk::CullModeFlags::NONE,
            ..desc
        },
    )
    .with_shader(ShaderSource::vertex(shader_path(&config.shader_dir, "fullscreen.vert")))
    .with_shader(ShaderSource::fragment(shader_path(&config.shader_dir, fragment)))
    .with_set_layouts(set_layouts);
    if let Some(size) = push_constant_size {
        params = params.with_push_constants(
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
            size,
        );
    }
    Pipeline::create_graphics(ctx, Arc::clone(compiler), params)
}

/// Every built-in pass. Optional ones are `None` when disabled in the configuration.
pub struct Passes {
    pub geometry: GeometryPass,
    pub shadow: ShadowPass,
    pub lighting: LightingPass,
    pub skybox: Option<SkyboxPass>,
    pub ibl: Option<IblPass>,
    pub volumetric: Option<VolumetricPass>,
    pub post_fx: Option<PostFxPass>,
    pub ui: Option<UiPass>,
}

impl Passes {
    pub fn new(
        ctx: &mut DeviceContext,
        compiler: &Arc<dyn ShaderCompiler>,
        config: &RendererConfig,
        shared: &SharedResources,
        attachments: &Attachments,
    ) -> Result<Self> {
        let toggles = &config.passes;
        let geometry = GeometryPass::new(ctx, compiler, config, shared)?;
        let shadow = ShadowPass::new(ctx, compiler, config, shared)?;
        let lighting = LightingPass::new(ctx, compiler, config, shared, attachments)?;
        let ibl = if toggles.ibl || toggles.skybox {
            Some(IblPass::new(ctx, compiler, config, shared)?)
        } else {
            None
        };
        let skybox = if toggles.skybox {
            Some(SkyboxPass::new(ctx, compiler, config, shared, attachments)?)
        } else {
            None
        };
        let volumetric = if toggles.volumetric {
            Some(VolumetricPass::new(ctx, compiler, config, shared, attachments)?)
        } else {
            None
        };
        let post_fx = if toggles.post_fx {
            Some(PostFxPass::new(ctx, compiler, config, shared, attachments)?)
        } else {
            None
        };
        let ui = if toggles.ui {
            Some(UiPass::new(ctx, compiler, config, shared)?)
        } else {
            None
        };

        Ok(Self {
            geometry,
            shadow,
            lighting,
            skybox,
            ibl,
            volumetric,
            post_fx,
            ui,
        })
    }

    /// Records one pass. The graph has already moved its attachments into place.
    pub fn record(
        &mut self,
        kind: PassKind,
        rec: &mut PassRecorder<'_>,
        shared: &SharedResources,
        input: &FrameInput<'_>,
        output: AttachmentId,
    ) -> Result<()> {
        rec.stats.passes += 1;
        match kind {
            PassKind::Geometry => self.geometry.record(rec, shared),
            PassKind::Shadow => self.shadow.record(rec, shared),
            PassKind::Lighting => self.lighting.record(rec, shared, input),
            PassKind::IblPrefilter => required(self.ibl.as_mut(), kind)?.record(rec, shared),
            PassKind::Skybox => required(self.skybox.as_ref(), kind)?.record(rec, shared),
            PassKind::Volumetric => required(self.volumetric.as_ref(), kind)?.record(rec, shared),
            PassKind::PostFx => required(self.post_fx.as_ref(), kind)?.record(rec, shared),
            PassKind::Ui => required(self.ui.as_ref(), kind)?.record(rec, shared, input.ui, output),
        }
    }

    /// Whether the environment cube must be (re)generated this frame.
    pub fn environment_dirty(&self) -> bool {
        self.ibl.as_ref().map(IblPass::is_dirty).unwrap_or(false)
    }

    /// Rewrites every descriptor that references a size-dependent attachment.
    pub fn update_attachment_bindings(
        &self,
        device: &dyn GpuDevice,
        shared: &SharedResources,
        attachments: &Attachments,
    ) -> Result<()> {
        self.lighting.write_inputs(device, shared, attachments)?;
        if let Some(volumetric) = &self.volumetric {
            volumetric.write_inputs(device, shared, attachments)?;
        }
        if let Some(post_fx) = &self.post_fx {
            post_fx.write_inputs(device, shared, attachments)?;
        }
        Ok(())
    }

    pub fn pipelines(&self) -> Vec<&Pipeline> {
        let mut pipelines = vec![self.geometry.pipeline(), self.shadow.pipeline()];
        pipelines.extend(self.lighting.pipelines());
        if let Some(ibl) = &self.ibl {
            pipelines.push(ibl.pipeline());
        }
        if let Some(skybox) = &self.skybox {
            pipelines.push(skybox.pipeline());
        }
        if let Some(volumetric) = &self.volumetric {
            pipelines.extend(volumetric.pipelines());
        }
        if let Some(post_fx) = &self.post_fx {
            pipelines.push(post_fx.pipeline());
        }
        if let Some(ui) = &self.ui {
            pipelines.push(ui.pipeline());
        }
        pipelines
    }

    pub fn pipelines_mut(&mut self) -> Vec<&mut Pipeline> {
        let mut pipelines = vec![self.geometry.pipeline_mut(), self.shadow.pipeline_mut()];
        pipelines.extend(self.lighting.pipelines_mut());
        if let Some(ibl) = &mut self.ibl {
            pipelines.push(ibl.pipeline_mut());
        }
        if let Some(skybox) = &mut self.skybox {
            pipelines.push(skybox.pipeline_mut());
        }
        if let Some(volumetric) = &mut self.volumetric {
            pipelines.extend(volumetric.pipelines_mut());
        }
        if let Some(post_fx) = &mut self.post_fx {
            pipelines.push(post_fx.pipeline_mut());
        }
        if let Some(ui) = &mut self.ui {
            pipelines.push(ui.pipeline_mut());
        }
        pipelines
    }
}

fn required<T>(pass: Option<T>, kind: PassKind) -> Result<T> {
    pass.ok_or_else(|| {
        RenderError::PassOrder(format!("pass '{}' is scheduled but disabled", kind.name()))
    })
}
