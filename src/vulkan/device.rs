//! The device seam: every native call the renderer core issues goes through [`GpuDevice`].
//!
//! [`AshDevice`](super::AshDevice) implements it on a real Vulkan 1.3 device;
//! [`HeadlessDevice`](super::HeadlessDevice) fabricates handles and records calls so the
//! registry, frame pacing and pass orchestration can run without a GPU.

use ash::vk;

use crate::Result;

/// Every category of native object the core creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    Buffer,
    Image,
    ImageView,
    ShaderModule,
    Pipeline,
    PipelineLayout,
    DescriptorPool,
    DescriptorSetLayout,
    Sampler,
    Fence,
    Semaphore,
    CommandPool,
}

/// Where a buffer's memory lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryLocation {
    /// Device-local, not mappable
    GpuOnly,
    /// Host-visible and coherent; written by the CPU every frame
    CpuToGpu,
}

#[derive(Debug, Clone)]
pub struct BufferDesc {
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct ImageDesc {
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub array_layers: u32,
    pub mip_levels: u32,
    pub usage: vk::ImageUsageFlags,
    pub cube_compatible: bool,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct ImageViewDesc {
    pub image: vk::Image,
    pub view_type: vk::ImageViewType,
    pub format: vk::Format,
    pub aspect: vk::ImageAspectFlags,
    pub base_layer: u32,
    pub layer_count: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct SamplerDesc {
    pub filter: vk::Filter,
    pub address_mode: vk::SamplerAddressMode,
    pub border_color: vk::BorderColor,
    pub compare_op: Option<vk::CompareOp>,
    pub max_lod: f32,
}

impl SamplerDesc {
    pub fn linear_clamp() -> Self {
        Self {
            filter: vk::Filter::LINEAR,
            address_mode: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            border_color: vk::BorderColor::FLOAT_OPAQUE_WHITE,
            compare_op: None,
            max_lod: vk::LOD_CLAMP_NONE,
        }
    }

    pub fn nearest_clamp() -> Self {
        Self {
            filter: vk::Filter::NEAREST,
            ..Self::linear_clamp()
        }
    }

    /// Depth comparison sampler for shadow lookups; outside the map is lit.
    pub fn shadow_compare() -> Self {
        Self {
            filter: vk::Filter::LINEAR,
            address_mode: vk::SamplerAddressMode::CLAMP_TO_BORDER,
            border_color: vk::BorderColor::FLOAT_OPAQUE_WHITE,
            compare_op: Some(vk::CompareOp::LESS_OR_EQUAL),
            max_lod: 1.0,
        }
    }
}

/// Resource attached by a descriptor write.
#[derive(Debug, Clone, Copy)]
pub enum DescriptorResource {
    Buffer(vk::DescriptorBufferInfo),
    Image(vk::DescriptorImageInfo),
}

/// One slot update of one descriptor set.
#[derive(Debug, Clone, Copy)]
pub struct DescriptorWrite {
    pub set: vk::DescriptorSet,
    pub binding: u32,
    pub array_element: u32,
    pub descriptor_type: vk::DescriptorType,
    pub resource: DescriptorResource,
}

/// Blend state applied to every color attachment of a graphics pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendMode {
    Opaque,
    /// src + dst; light accumulation
    Additive,
    /// src * a + dst * (1 - a); UI and composites
    Alpha,
}

/// Fixed-function state of a graphics pipeline. Viewport and scissor are always dynamic.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphicsPipelineDesc {
    pub color_formats: Vec<vk::Format>,
    /// `vk::Format::UNDEFINED` when the pipeline has no depth attachment
    pub depth_format: vk::Format,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare: vk::CompareOp,
    pub depth_bias: bool,
    pub blend: BlendMode,
    pub topology: vk::PrimitiveTopology,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    /// Bit i renders to output layer i; 0 disables multiview
    pub view_mask: u32,
}

impl Default for GraphicsPipelineDesc {
    fn default() -> Self {
        Self {
            color_formats: Vec::new(),
            depth_format: vk::Format::UNDEFINED,
            depth_test: false,
            depth_write: false,
            depth_compare: vk::CompareOp::LESS_OR_EQUAL,
            depth_bias: false,
            blend: BlendMode::Opaque,
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            view_mask: 0,
        }
    }
}

/// Layout plus the pipeline stages and access an image is in (or must move to).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageState {
    pub layout: vk::ImageLayout,
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
}

impl ImageState {
    pub const UNDEFINED: Self = Self {
        layout: vk::ImageLayout::UNDEFINED,
        stage: vk::PipelineStageFlags2::TOP_OF_PIPE,
        access: vk::AccessFlags2::NONE,
    };
}

/// A single layout transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub aspect: vk::ImageAspectFlags,
    pub layer_count: u32,
    pub mip_levels: u32,
    pub src: ImageState,
    pub dst: ImageState,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LoadOp<T> {
    Clear(T),
    Load,
    DontCare,
}

#[derive(Debug, Clone, Copy)]
pub struct ColorTarget {
    pub view: vk::ImageView,
    pub load: LoadOp<[f32; 4]>,
    pub store: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct DepthTarget {
    pub view: vk::ImageView,
    pub load: LoadOp<f32>,
    pub store: bool,
    pub read_only: bool,
}

/// Dynamic (render-pass-less) rendering scope.
#[derive(Debug, Clone)]
pub struct RenderingDesc {
    pub extent: vk::Extent2D,
    pub layer_count: u32,
    pub view_mask: u32,
    pub color: Vec<ColorTarget>,
    pub depth: Option<DepthTarget>,
}

#[derive(Debug, Clone, Copy)]
pub struct SubmitDesc {
    pub command_buffer: vk::CommandBuffer,
    pub wait: Option<(vk::Semaphore, vk::PipelineStageFlags)>,
    pub signal: Option<vk::Semaphore>,
    pub fence: vk::Fence,
}

/// A swap image handed out by the presentation target.
#[derive(Debug, Clone, Copy)]
pub struct AcquiredImage {
    pub index: u32,
    pub image: vk::Image,
    pub extent: vk::Extent2D,
    pub suboptimal: bool,
}

/// Native device operations used by the renderer core.
///
/// All handle types are plain `ash::vk` handles. Implementations must be callable from the
/// recording thread only; they are `Send + Sync` so a context can move between threads.
pub trait GpuDevice: Send + Sync {
    fn name(&self) -> &str;

    // Memory-backed objects. The second handle is the backing memory block.
    fn create_buffer(&self, desc: &BufferDesc) -> Result<(vk::Buffer, vk::DeviceMemory)>;
    fn destroy_buffer(&self, buffer: vk::Buffer, memory: vk::DeviceMemory);
    /// Copies `data` into a host-visible buffer; the write is visible to the next submission.
    fn write_buffer(&self, buffer: vk::Buffer, offset: u64, data: &[u8]) -> Result<()>;
    fn read_buffer(&self, buffer: vk::Buffer, offset: u64, len: usize) -> Result<Vec<u8>>;
    fn create_image(&self, desc: &ImageDesc) -> Result<(vk::Image, vk::DeviceMemory)>;
    fn destroy_image(&self, image: vk::Image, memory: vk::DeviceMemory);
    fn create_image_view(&self, desc: &ImageViewDesc) -> Result<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);
    fn create_sampler(&self, desc: &SamplerDesc) -> Result<vk::Sampler>;
    fn destroy_sampler(&self, sampler: vk::Sampler);

    // Programs and binding tables.
    fn create_shader_module(&self, code: &[u32]) -> Result<vk::ShaderModule>;
    fn destroy_shader_module(&self, module: vk::ShaderModule);
    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'static>],
        binding_flags: &[vk::DescriptorBindingFlags],
    ) -> Result<vk::DescriptorSetLayout>;
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);
    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
        update_after_bind: bool,
    ) -> Result<vk::DescriptorPool>;
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);
    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
        variable_count: Option<u32>,
    ) -> Result<vk::DescriptorSet>;
    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]);
    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constants: &[vk::PushConstantRange],
    ) -> Result<vk::PipelineLayout>;
    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);
    fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDesc,
        layout: vk::PipelineLayout,
        stages: &[(vk::ShaderStageFlags, vk::ShaderModule)],
    ) -> Result<vk::Pipeline>;
    fn create_compute_pipeline(
        &self,
        layout: vk::PipelineLayout,
        module: vk::ShaderModule,
    ) -> Result<vk::Pipeline>;
    fn destroy_pipeline(&self, pipeline: vk::Pipeline);

    // Synchronization and submission.
    fn create_fence(&self, signaled: bool) -> Result<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    /// Returns `Ok(false)` when the timeout expired before the fence signaled.
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<bool>;
    fn reset_fence(&self, fence: vk::Fence) -> Result<()>;
    fn create_semaphore(&self) -> Result<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    fn create_command_pool(&self) -> Result<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> Result<vk::CommandBuffer>;
    /// Resets and begins a one-time-submit recording.
    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()>;
    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()>;
    fn submit(&self, submit: &SubmitDesc) -> Result<()>;
    fn wait_idle(&self) -> Result<()>;

    // Presentation.
    fn acquire_next_image(&self, signal: vk::Semaphore) -> Result<AcquiredImage>;
    /// Returns `true` when the target is suboptimal and should be recreated.
    fn present(&self, image_index: u32, wait: vk::Semaphore) -> Result<bool>;
    /// Rebuilds the presentation target at the new extent. The device must be idle.
    fn resize_present_target(&self, extent: vk::Extent2D) -> Result<()>;

    // Command recording.
    fn cmd_image_barriers(&self, cmd: vk::CommandBuffer, barriers: &[ImageBarrier]);
    fn cmd_begin_rendering(&self, cmd: vk::CommandBuffer, desc: &RenderingDesc);
    fn cmd_end_rendering(&self, cmd: vk::CommandBuffer);
    fn cmd_bind_pipeline(
        &self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    );
    fn cmd_bind_descriptor_sets(
        &self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    );
    fn cmd_push_constants(
        &self,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        data: &[u8],
    );
    fn cmd_set_viewport_scissor(
        &self,
        cmd: vk::CommandBuffer,
        viewport: vk::Viewport,
        scissor: vk::Rect2D,
    );
    fn cmd_set_depth_bias(&self, cmd: vk::CommandBuffer, constant: f32, clamp: f32, slope: f32);
    fn cmd_draw(
        &self,
        cmd: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    );
    fn cmd_dispatch(&self, cmd: vk::CommandBuffer, x: u32, y: u32, z: u32);
    fn cmd_blit_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Image,
        src_extent: vk::Extent2D,
        dst: vk::Image,
        dst_extent: vk::Extent2D,
    );
}

/// Full-extent viewport with standard depth range.
pub fn full_viewport(extent: vk::Extent2D) -> vk::Viewport {
    vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    }
}

pub fn full_scissor(extent: vk::Extent2D) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    }
}

pub fn is_depth_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::D32_SFLOAT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
            | vk::Format::D16_UNORM_S8_UINT
    )
}

/// Depth formats get the depth aspect, everything else color.
pub fn aspect_for(format: vk::Format) -> vk::ImageAspectFlags {
    if is_depth_format(format) {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}
