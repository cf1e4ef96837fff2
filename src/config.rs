//! Global configuration constants and runtime settings for the renderer.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{RenderError, Result};

/// Number of frame slots recorded/executed concurrently (double buffering).
pub const FRAMES_IN_FLIGHT: usize = 2;

/// Number of shadow cascades carried by a cascade set.
pub const CASCADE_COUNT: usize = 4;

/// Default blend between logarithmic (1.0) and uniform (0.0) cascade splits.
pub const DEFAULT_SPLIT_LAMBDA: f32 = 0.95;

/// Granularity the cascade bounding radius is rounded up to.
pub const CASCADE_RADIUS_STEP: f32 = 1.0 / 16.0;

/// Bounded fence wait; large enough to mean "wait until done".
pub const FENCE_TIMEOUT_NS: u64 = 10_000_000_000;

/// First word of every SPIR-V binary.
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Capacity of the bindless texture array.
pub const MAX_BINDLESS_TEXTURES: u32 = 4096;

/// Frame time above which a warning is logged.
pub const DEFAULT_FRAME_BUDGET_MS: f32 = 16.6;

/// Alignment used between the vertex and index halves of a packed mesh buffer.
pub const STORAGE_BUFFER_ALIGNMENT: u64 = 256;

/// Cascaded shadow configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadeConfig {
    /// Number of cascades (1..=CASCADE_COUNT)
    pub cascade_count: u32,
    /// Split interpolation weight (0 = uniform, 1 = logarithmic)
    pub split_lambda: f32,
    /// Radius rounding step, in world units
    pub radius_step: f32,
    /// Shadow map resolution per cascade layer
    pub resolution: u32,
    /// Optional cap on the camera far plane used for shadows
    pub max_shadow_distance: Option<f32>,
    /// Enable cascade blending in the lighting shader
    pub blend_cascades: bool,
    /// Blend region size, as a fraction of a cascade
    pub blend_size: f32,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            cascade_count: CASCADE_COUNT as u32,
            split_lambda: DEFAULT_SPLIT_LAMBDA,
            radius_step: CASCADE_RADIUS_STEP,
            resolution: 2048,
            max_shadow_distance: None,
            blend_cascades: true,
            blend_size: 0.1,
        }
    }
}

impl CascadeConfig {
    /// High quality preset
    pub fn high_quality() -> Self {
        Self {
            resolution: 4096,
            split_lambda: 0.8,
            blend_size: 0.15,
            ..Self::default()
        }
    }

    /// Performance preset
    pub fn performance() -> Self {
        Self {
            cascade_count: 2,
            resolution: 1024,
            split_lambda: 0.5,
            blend_cascades: false,
            blend_size: 0.0,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.cascade_count == 0 || self.cascade_count as usize > CASCADE_COUNT {
            return Err(RenderError::Config(format!(
                "cascade_count must be in 1..={CASCADE_COUNT}, got {}",
                self.cascade_count
            )));
        }
        if !(0.0..=1.0).contains(&self.split_lambda) {
            return Err(RenderError::Config(format!(
                "split_lambda must be in [0, 1], got {}",
                self.split_lambda
            )));
        }
        if self.radius_step <= 0.0 {
            return Err(RenderError::Config("radius_step must be positive".into()));
        }
        Ok(())
    }
}

/// Optional passes. Disabled passes are skipped as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassToggles {
    pub ibl: bool,
    pub skybox: bool,
    pub volumetric: bool,
    pub post_fx: bool,
    pub ui: bool,
}

impl Default for PassToggles {
    fn default() -> Self {
        Self {
            ibl: true,
            skybox: true,
            volumetric: false,
            post_fx: true,
            ui: true,
        }
    }
}

/// Top-level renderer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RendererConfig {
    pub width: u32,
    pub height: u32,
    pub cascades: CascadeConfig,
    pub passes: PassToggles,
    pub fence_timeout_ns: u64,
    /// Directory holding shader sources (and their compiled binaries)
    pub shader_dir: PathBuf,
    /// Frames between shader modification checks; 0 disables hot-reload
    pub reload_check_interval: u64,
    pub frame_budget_ms: f32,
    /// Resolution of the prefiltered environment cubemap faces
    pub environment_size: u32,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            cascades: CascadeConfig::default(),
            passes: PassToggles::default(),
            fence_timeout_ns: FENCE_TIMEOUT_NS,
            shader_dir: PathBuf::from("shaders"),
            reload_check_interval: 60,
            frame_budget_ms: DEFAULT_FRAME_BUDGET_MS,
            environment_size: 512,
        }
    }
}

impl RendererConfig {
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(RenderError::Config(format!(
                "render extent must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        if self.fence_timeout_ns == 0 {
            return Err(RenderError::Config("fence_timeout_ns must be non-zero".into()));
        }
        self.cascades.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = RendererConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cascades.cascade_count, 4);
    }

    #[test]
    fn config_presets() {
        let hq = CascadeConfig::high_quality();
        assert_eq!(hq.resolution, 4096);
        assert!(hq.validate().is_ok());

        let perf = CascadeConfig::performance();
        assert_eq!(perf.cascade_count, 2);
        assert!(perf.validate().is_ok());
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = RendererConfig::default();
        config.cascades.cascade_count = 5;
        assert!(config.validate().is_err());

        let mut config = RendererConfig::default();
        config.cascades.split_lambda = 1.5;
        assert!(config.validate().is_err());

        let mut config = RendererConfig::default();
        config.width = 0;
        assert!(config.validate().is_err());
    }
}
