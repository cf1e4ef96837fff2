//! Low-level GPU abstractions: the device seam and its two backends, descriptor binding,
//! pipelines, and frame synchronization.

pub mod ash_device;
pub mod deletion_queue;
pub mod descriptor_bindless;
pub mod descriptor_layout;
pub mod descriptor_set;
pub mod device;
pub mod headless;
pub mod pipeline;
pub mod pipeline_state;
pub mod shader;
pub mod sync;

pub use ash_device::{AshDevice, PresentSurface};
pub use deletion_queue::DeletionQueue;
pub use descriptor_bindless::BindlessTextureTable;
pub use descriptor_layout::{DescriptorSetLayout, DescriptorSetLayoutBuilder, LayoutBinding};
pub use descriptor_set::{DescriptorPool, DescriptorSet, DescriptorWriteBatch};
pub use device::{
    aspect_for, full_scissor, full_viewport, is_depth_format, AcquiredImage, BlendMode,
    BufferDesc, ColorTarget, DepthTarget, DescriptorResource, DescriptorWrite, GpuDevice,
    GraphicsPipelineDesc, ImageBarrier, ImageDesc, ImageState, ImageViewDesc, LoadOp,
    MemoryLocation, ObjectKind, RenderingDesc, SamplerDesc, SubmitDesc,
};
pub use headless::{DeviceCall, HeadlessDevice};
pub use pipeline::{Pipeline, PipelineKind, PipelineParams, ShaderWatchInfo};
pub use pipeline_state::{DepthBias, PipelineState};
pub use shader::{validate_spirv, GlslcCompiler, PrecompiledShaders, ShaderCompiler, ShaderSource};
pub use sync::{FrameContext, FrameSlot, SlotState};
