//! High-level renderer module.
//!
//! This module provides the main [`Renderer`] struct, the registry every GPU object is
//! owned by, the render graph, and the passes it orders.

pub mod attachments;
pub mod context;
pub mod frame_graph;
pub mod passes;
pub mod render_stats;
#[allow(clippy::module_inception)]
pub mod renderer;
pub mod resource_registry;
pub mod resources;

pub use attachments::{Attachment, AttachmentId, AttachmentSet, Attachments};
pub use context::DeviceContext;
pub use frame_graph::{AttachmentUse, PassDecl, PassKind, PassPlan, PlannedBarrier, RenderGraph};
pub use passes::{
    DirectionalLight, FrameInput, MeshId, PostFxSettings, SceneCamera, TonemapOperator, UiDrawCmd,
    UiDrawList, UiVertex, VolumetricSettings,
};
pub use render_stats::{FrameStats, StatsCollector};
pub use renderer::{DisplayHandle, FrameOutcome, Renderer};
pub use resource_registry::{
    BufferRecord, Category, DescriptorPoolRecord, DescriptorSetLayoutRecord, Handle, ImageRecord,
    ImageViewRecord, PipelineLayoutRecord, PipelineRecord, RegistryResource, ResourceRegistry,
    SamplerRecord, ShaderModuleRecord,
};

// Re-export from resources submodule
pub use resources::{
    CascadeInput, CascadeSet, CascadedShadowMap, FrameUniforms, GpuCascadeData, GpuMesh,
    InstanceData, LightData, MaterialData, PackedMesh, PointLight, Vertex,
};
