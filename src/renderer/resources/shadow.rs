//! Cascaded Shadow Maps (CSM) for the directional light
//!
//! Splits the camera frustum into up to [`CASCADE_COUNT`] depth ranges and fits an
//! orthographic light projection around each one.
//!
//! # Algorithm
//! - Practical split scheme: `λ·log + (1-λ)·uniform`, normalized to `[0, 1]`
//! - Frustum slice corners from the inverse view-projection, interpolated along the
//!   near→far edges
//! - Bounding sphere around the slice centroid, radius rounded up to a fixed step so the
//!   cascade only changes size in discrete increments
//! - Light view from `center - dir·radius`, ortho `[-r, r]²` in XY and `[0, 2r]` in Z
//!
//! Everything here is pure and deterministic; the same inputs always produce bit-identical
//! output.

use glam::{Mat4, Vec3, Vec4};

use crate::config::{CascadeConfig, CASCADE_COUNT, CASCADE_RADIUS_STEP};
use crate::renderer::{BufferRecord, DeviceContext, Handle};
use crate::Result;

/// Camera and light state the cascades are fitted to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CascadeInput {
    /// Camera near clip distance (> 0)
    pub near: f32,
    /// Camera far clip distance (> near)
    pub far: f32,
    pub view: Mat4,
    /// Inverse of `projection * view`; maps NDC (z in [0, 1]) to world space
    pub inv_view_proj: Mat4,
    /// World-space direction the light travels in
    pub light_dir: Vec3,
}

impl CascadeInput {
    /// Builds the input from a right-handed perspective camera.
    pub fn from_perspective(
        view: Mat4,
        fov_y: f32,
        aspect: f32,
        near: f32,
        far: f32,
        light_dir: Vec3,
    ) -> Self {
        let projection = Mat4::perspective_rh(fov_y, aspect, near, far);
        Self {
            near,
            far,
            view,
            inv_view_proj: (projection * view).inverse(),
            light_dir,
        }
    }
}

/// One fitted cascade.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cascade {
    pub view_proj: Mat4,
    /// Far edge of the slice as a fraction of the shadow range
    pub split: f32,
    /// View-space depth of the far edge (negative, camera looks down -Z)
    pub split_depth: f32,
    pub center: Vec3,
    pub radius: f32,
}

impl Default for Cascade {
    fn default() -> Self {
        Self {
            view_proj: Mat4::IDENTITY,
            split: 1.0,
            split_depth: 0.0,
            center: Vec3::ZERO,
            radius: 0.0,
        }
    }
}

/// GPU-ready cascade data (std140, matches the lighting shader block)
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GpuCascadeData {
    /// Light view-projection per cascade
    pub view_proj: [[f32; 16]; CASCADE_COUNT],
    /// View-space far depth per cascade
    pub split_depths: [f32; CASCADE_COUNT],
    /// Cascade count, blend enabled, blend size, texel size
    pub params: [f32; 4],
}

impl Default for GpuCascadeData {
    fn default() -> Self {
        Self {
            view_proj: [Mat4::IDENTITY.to_cols_array(); CASCADE_COUNT],
            split_depths: [0.0; CASCADE_COUNT],
            params: [CASCADE_COUNT as f32, 1.0, 0.1, 0.0],
        }
    }
}

/// Normalized far edge of each cascade.
///
/// Entries past `count` are 1.0. The last active split is exactly 1.0.
pub fn compute_split_fractions(count: usize, near: f32, far: f32, lambda: f32) -> [f32; CASCADE_COUNT] {
    let mut splits = [1.0f32; CASCADE_COUNT];
    let count = count.clamp(1, CASCADE_COUNT);
    let range = far - near;
    let ratio = far / near;

    for (i, split) in splits.iter_mut().enumerate().take(count) {
        let p = (i + 1) as f32 / count as f32;
        let log_split = near * ratio.powf(p);
        let uniform_split = near + range * p;
        let depth = lambda * log_split + (1.0 - lambda) * uniform_split;
        *split = (depth - near) / range;
    }
    // pow() can land a hair off the far plane
    splits[count - 1] = 1.0;
    splits
}

/// World-space corners of the full camera frustum: near plane first, then far, in matching
/// order so `corners[i]` and `corners[i + 4]` lie on the same edge.
pub fn frustum_corners(inv_view_proj: Mat4) -> [Vec3; 8] {
    const NDC: [(f32, f32); 4] = [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)];
    let mut corners = [Vec3::ZERO; 8];
    for (z_index, z) in [0.0f32, 1.0].into_iter().enumerate() {
        for (i, (x, y)) in NDC.iter().enumerate() {
            let world = inv_view_proj * Vec4::new(*x, *y, z, 1.0);
            corners[z_index * 4 + i] = world.truncate() / world.w;
        }
    }
    corners
}

/// Rounds `radius` up to a multiple of `step`; at least one step, so a degenerate slice
/// still gets a finite projection.
pub fn quantize_radius(radius: f32, step: f32) -> f32 {
    ((radius.max(0.0) / step).ceil() * step).max(step)
}

/// Light view-projection enclosing a sphere. Radii below [`CASCADE_RADIUS_STEP`] are
/// raised to it.
pub fn light_view_proj(center: Vec3, radius: f32, light_dir: Vec3) -> Mat4 {
    let radius = radius.max(CASCADE_RADIUS_STEP);
    let dir = light_dir.normalize_or(Vec3::NEG_Y);
    let up = if dir.abs().dot(Vec3::Y) > 0.99 {
        Vec3::Z
    } else {
        Vec3::Y
    };
    let eye = center - dir * radius;
    let view = Mat4::look_at_rh(eye, center, up);
    let projection = Mat4::orthographic_rh(-radius, radius, -radius, radius, 0.0, radius * 2.0);
    projection * view
}

/// A full set of fitted cascades.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CascadeSet {
    cascades: [Cascade; CASCADE_COUNT],
    count: usize,
}

impl CascadeSet {
    /// Fits every cascade for the given camera and light.
    pub fn compute(input: &CascadeInput, config: &CascadeConfig) -> Self {
        let count = (config.cascade_count as usize).clamp(1, CASCADE_COUNT);
        let near = input.near;
        let shadow_far = config
            .max_shadow_distance
            .map(|max| max.min(input.far))
            .unwrap_or(input.far)
            .max(near + f32::EPSILON);
        let shadow_range = shadow_far - near;
        let camera_range = input.far - near;

        let splits = compute_split_fractions(count, near, shadow_far, config.split_lambda);
        let corners = frustum_corners(input.inv_view_proj);

        let mut cascades = [Cascade::default(); CASCADE_COUNT];
        let mut previous = 0.0f32;
        for (i, cascade) in cascades.iter_mut().enumerate().take(count) {
            let split = splits[i];
            // Slice bounds as fractions along the camera's own near→far edges.
            let t_near = previous * shadow_range / camera_range;
            let t_far = split * shadow_range / camera_range;

            let mut slice = [Vec3::ZERO; 8];
            for edge in 0..4 {
                let (n, f) = (corners[edge], corners[edge + 4]);
                slice[edge] = n.lerp(f, t_near);
                slice[edge + 4] = n.lerp(f, t_far);
            }

            let center = slice.iter().copied().sum::<Vec3>() / 8.0;
            let radius = slice
                .iter()
                .map(|corner| corner.distance(center))
                .fold(0.0f32, f32::max);
            let radius = quantize_radius(radius, config.radius_step);

            *cascade = Cascade {
                view_proj: light_view_proj(center, radius, input.light_dir),
                split,
                split_depth: -(near + split * shadow_range),
                center,
                radius,
            };
            previous = split;
        }

        Self { cascades, count }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn cascades(&self) -> &[Cascade] {
        &self.cascades[..self.count]
    }

    pub fn get(&self, index: usize) -> Option<&Cascade> {
        self.cascades().get(index)
    }

    pub fn splits(&self) -> Vec<f32> {
        self.cascades().iter().map(|c| c.split).collect()
    }

    /// Packs the set for upload. Unused slots get an identity matrix and `f32::MAX` depth.
    pub fn to_gpu(&self, config: &CascadeConfig) -> GpuCascadeData {
        let mut data = GpuCascadeData::default();
        for i in 0..CASCADE_COUNT {
            if i < self.count {
                data.view_proj[i] = self.cascades[i].view_proj.to_cols_array();
                data.split_depths[i] = self.cascades[i].split_depth;
            } else {
                data.split_depths[i] = f32::MAX;
            }
        }
        data.params = [
            self.count as f32,
            if config.blend_cascades { 1.0 } else { 0.0 },
            config.blend_size,
            1.0 / config.resolution.max(1) as f32,
        ];
        data
    }
}

/// Cascade manager: recomputes the set every frame and keeps the packed GPU copy.
pub struct CascadedShadowMap {
    config: CascadeConfig,
    set: Option<CascadeSet>,
    gpu_data: GpuCascadeData,
}

impl CascadedShadowMap {
    pub fn new(config: CascadeConfig) -> Self {
        Self {
            config,
            set: None,
            gpu_data: GpuCascadeData::default(),
        }
    }

    /// Refits all cascades. Never cached across frames; camera and light may both move.
    pub fn update(&mut self, input: &CascadeInput) -> &CascadeSet {
        let set = CascadeSet::compute(input, &self.config);
        self.gpu_data = set.to_gpu(&self.config);
        log::trace!("[Cascades] Updated {} cascades, splits {:?}", set.count(), set.splits());
        self.set.insert(set)
    }

    /// Writes the packed cascade block into a host-visible buffer.
    pub fn upload(&self, ctx: &DeviceContext, buffer: Handle<BufferRecord>) -> Result<()> {
        ctx.upload(buffer, &self.gpu_data)
    }

    pub fn gpu_data(&self) -> &GpuCascadeData {
        &self.gpu_data
    }

    pub fn cascades(&self) -> Option<&CascadeSet> {
        self.set.as_ref()
    }

    pub fn cascade_count(&self) -> usize {
        self.config.cascade_count as usize
    }

    pub fn config(&self) -> &CascadeConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut CascadeConfig {
        &mut self.config
    }
}

impl Default for CascadedShadowMap {
    fn default() -> Self {
        Self::new(CascadeConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn input() -> CascadeInput {
        let view = Mat4::look_at_rh(Vec3::new(0.0, 5.0, 10.0), Vec3::ZERO, Vec3::Y);
        CascadeInput::from_perspective(
            view,
            45.0_f32.to_radians(),
            16.0 / 9.0,
            0.1,
            100.0,
            Vec3::new(-0.5, -1.0, -0.3),
        )
    }

    #[test]
    fn uniform_splits_are_evenly_spaced() {
        let splits = compute_split_fractions(4, 1.0, 101.0, 0.0);
        for (i, split) in splits.iter().enumerate() {
            assert_relative_eq!(*split, (i + 1) as f32 / 4.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn unused_splits_are_one() {
        let splits = compute_split_fractions(2, 0.1, 50.0, 0.5);
        assert!(splits[0] < 1.0);
        assert_eq!(&splits[1..], &[1.0, 1.0, 1.0]);
    }

    #[test]
    fn radius_is_quantized() {
        assert_relative_eq!(quantize_radius(1.01, 1.0 / 16.0), 1.0625);
        assert_relative_eq!(quantize_radius(2.0, 1.0 / 16.0), 2.0);
        assert_eq!(quantize_radius(-3.0, 1.0 / 16.0), 1.0 / 16.0);
        assert_eq!(quantize_radius(0.0, 1.0 / 16.0), 1.0 / 16.0);
    }

    #[test]
    fn zero_radius_projection_stays_finite() {
        let vp = light_view_proj(Vec3::new(1.0, 2.0, 3.0), 0.0, Vec3::new(-0.3, -1.0, 0.2));
        assert!(vp.is_finite());
        assert!(light_view_proj(Vec3::ZERO, -1.0, Vec3::NEG_Y).is_finite());
    }

    #[test]
    fn frustum_corners_lie_on_clip_planes() {
        let view = Mat4::IDENTITY;
        let input = CascadeInput::from_perspective(view, 90.0_f32.to_radians(), 1.0, 1.0, 10.0, Vec3::NEG_Y);
        let corners = frustum_corners(input.inv_view_proj);
        for corner in &corners[..4] {
            assert_relative_eq!(corner.z, -1.0, epsilon = 1e-4);
        }
        for corner in &corners[4..] {
            assert_relative_eq!(corner.z, -10.0, epsilon = 1e-3);
        }
        // 90° fov: half-width equals depth
        assert_relative_eq!(corners[6].x.abs(), 10.0, epsilon = 1e-3);
    }

    #[test]
    fn cascade_centers_lie_inside_their_sphere() {
        let mut csm = CascadedShadowMap::default();
        let set = *csm.update(&input());
        assert_eq!(set.count(), 4);
        for cascade in set.cascades() {
            assert!(cascade.radius > 0.0);
            // The center projects to the middle of the light's clip volume.
            let clip = cascade.view_proj * cascade.center.extend(1.0);
            assert_relative_eq!(clip.x / clip.w, 0.0, epsilon = 1e-3);
            assert_relative_eq!(clip.y / clip.w, 0.0, epsilon = 1e-3);
            assert_relative_eq!(clip.z / clip.w, 0.5, epsilon = 1e-3);
        }
        assert_eq!(csm.gpu_data().params[0], 4.0);
    }

    #[test]
    fn max_shadow_distance_limits_last_split_depth() {
        let config = CascadeConfig {
            max_shadow_distance: Some(40.0),
            ..CascadeConfig::default()
        };
        let set = CascadeSet::compute(&input(), &config);
        assert_relative_eq!(set.cascades()[3].split_depth, -40.0, epsilon = 1e-4);
    }

    #[test]
    fn vertical_light_uses_alternate_up() {
        let vp = light_view_proj(Vec3::ZERO, 4.0, Vec3::NEG_Y);
        assert!(vp.is_finite());
    }
}
