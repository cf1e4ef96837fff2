//! CPU-side data blocks and the GPU resources built from them.

pub mod mesh;
pub mod shadow;
pub mod uniform;

pub use mesh::{align_up, GpuMesh, InstanceData, PackedMesh, Vertex};
pub use shadow::{
    compute_split_fractions, frustum_corners, light_view_proj, quantize_radius, Cascade,
    CascadeInput, CascadeSet, CascadedShadowMap, GpuCascadeData,
};
pub use uniform::{
    default_ambient, FrameUniforms, LightData, LightHeader, MaterialData, PointLight,
    MAX_MATERIALS, MAX_POINT_LIGHTS,
};
