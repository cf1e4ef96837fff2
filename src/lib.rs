//! # Deferred Renderer
//!
//! A deferred Vulkan rendering core built with ASH (Vulkan bindings) and VMA (GPU memory allocator).
//!
//! ## Features
//!
//! - **Resource Registry**: every GPU object is owned by one registry and addressed through
//!   typed generational handles, so use-after-destroy is an error instead of a crash
//! - **Frame Pacing**: two frame slots recorded and executed concurrently, each guarded by
//!   its own fence and deletion queue
//! - **Render Graph**: passes declare the attachments they read and write; layout
//!   transitions are derived from those declarations
//! - **Cascaded Shadows**: stabilized cascade fitting, all cascades rendered with one
//!   multiview draw per mesh
//! - **Hot Reload**: pipelines remember how they were built and rebuild when their shaders change
//!
//! ## Quick Start
//!
//! ```ignore
//! use deferred_renderer::prelude::*;
//! use std::sync::Arc;
//!
//! fn main() -> Result<()> {
//!     let (instance, surface) = create_instance_and_surface();
//!     let device = Arc::new(unsafe { AshDevice::new(&instance, Some(surface))? });
//!     let compiler = Arc::new(GlslcCompiler::default());
//!     let mut renderer = Renderer::new(device, RendererConfig::default(), compiler)?;
//!
//!     let lights = LightData::new();
//!     let input = FrameInput::new(SceneCamera::default(), DirectionalLight::default(), &lights);
//!     renderer.render_frame(&input)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **`vulkan`**: the device seam (`GpuDevice`) with an ash backend and a headless backend,
//!   descriptor binding, pipelines and frame synchronization
//! - **`renderer`**: the registry, attachments, render graph, passes and the [`Renderer`]

#![warn(clippy::all)]
#![allow(clippy::module_inception)]

pub mod config;
mod error;
pub mod renderer;
pub mod utils;
pub mod vulkan;

pub use error::{RenderError, Result};

pub use config::{CascadeConfig, PassToggles, RendererConfig};
pub use renderer::{
    CascadeSet, CascadedShadowMap, DeviceContext, DirectionalLight, DisplayHandle, FrameInput,
    FrameOutcome, FrameStats, Handle, InstanceData, LightData, MaterialData, MeshId, PackedMesh,
    PointLight, RenderGraph, Renderer, ResourceRegistry, SceneCamera, StatsCollector, UiDrawList,
    Vertex,
};
pub use vulkan::{GpuDevice, HeadlessDevice, ShaderCompiler};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::vulkan::{AshDevice, GlslcCompiler, HeadlessDevice, PrecompiledShaders};
    pub use crate::{
        DirectionalLight, FrameInput, FrameOutcome, LightData, PointLight, RenderError, Renderer,
        RendererConfig, Result, SceneCamera,
    };
}
