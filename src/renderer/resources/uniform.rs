//! Per-frame GPU data blocks.

use glam::{Mat4, Vec3, Vec4};

/// Maximum point lights in the light-data buffer.
pub const MAX_POINT_LIGHTS: usize = 256;

/// Camera and sun data shared by every pass (std140).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct FrameUniforms {
    pub view: [f32; 16],
    pub projection: [f32; 16],
    pub view_proj: [f32; 16],
    pub inv_view_proj: [f32; 16],
    /// xyz: camera position, w: time in seconds
    pub camera_pos: [f32; 4],
    /// xyz: direction the light travels, w: intensity
    pub light_direction: [f32; 4],
    /// rgb: light color, a: ambient strength
    pub light_color: [f32; 4],
    /// x: width, y: height, z: 1/width, w: 1/height
    pub viewport: [f32; 4],
}

impl Default for FrameUniforms {
    fn default() -> Self {
        let identity = Mat4::IDENTITY.to_cols_array();
        Self {
            view: identity,
            projection: identity,
            view_proj: identity,
            inv_view_proj: identity,
            camera_pos: [0.0; 4],
            light_direction: [0.0, -1.0, 0.0, 1.0],
            light_color: [1.0, 1.0, 1.0, 0.1],
            viewport: [1.0; 4],
        }
    }
}

impl FrameUniforms {
    pub fn set_camera(&mut self, view: Mat4, projection: Mat4, position: Vec3) {
        let view_proj = projection * view;
        self.view = view.to_cols_array();
        self.projection = projection.to_cols_array();
        self.view_proj = view_proj.to_cols_array();
        self.inv_view_proj = view_proj.inverse().to_cols_array();
        self.camera_pos = [position.x, position.y, position.z, self.camera_pos[3]];
    }

    pub fn set_sun(&mut self, direction: Vec3, intensity: f32, color: Vec3, ambient: f32) {
        let dir = direction.normalize_or(Vec3::NEG_Y);
        self.light_direction = [dir.x, dir.y, dir.z, intensity];
        self.light_color = [color.x, color.y, color.z, ambient];
    }

    pub fn set_time(&mut self, seconds: f32) {
        self.camera_pos[3] = seconds;
    }

    pub fn set_viewport(&mut self, width: u32, height: u32) {
        let (w, h) = (width.max(1) as f32, height.max(1) as f32);
        self.viewport = [w, h, 1.0 / w, 1.0 / h];
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::from_cols_array(&self.view)
    }

    pub fn light_dir(&self) -> Vec3 {
        Vec3::new(
            self.light_direction[0],
            self.light_direction[1],
            self.light_direction[2],
        )
    }
}

/// One point light (std430).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct PointLight {
    /// xyz: position, w: radius
    pub position_radius: [f32; 4],
    /// rgb: color, a: intensity
    pub color_intensity: [f32; 4],
}

impl PointLight {
    pub fn new(position: Vec3, radius: f32, color: Vec3, intensity: f32) -> Self {
        Self {
            position_radius: position.extend(radius).to_array(),
            color_intensity: color.extend(intensity).to_array(),
        }
    }

    /// Model matrix of the unit light-volume sphere scaled to the light radius.
    pub fn volume_transform(&self) -> Mat4 {
        let [x, y, z, r] = self.position_radius;
        Mat4::from_scale_rotation_translation(Vec3::splat(r), Default::default(), Vec3::new(x, y, z))
    }
}

/// Header of the light storage buffer; followed by `count` [`PointLight`]s.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct LightHeader {
    pub count: u32,
    pub _padding: [u32; 3],
}

/// CPU-side light list, serialized as `[LightHeader][PointLight; n]`.
#[derive(Debug, Clone, Default)]
pub struct LightData {
    lights: Vec<PointLight>,
}

impl LightData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a light; returns `false` when the buffer is full.
    pub fn push(&mut self, light: PointLight) -> bool {
        if self.lights.len() >= MAX_POINT_LIGHTS {
            log::warn!("[Lights] Point light limit ({MAX_POINT_LIGHTS}) reached, dropping light");
            return false;
        }
        self.lights.push(light);
        true
    }

    pub fn clear(&mut self) {
        self.lights.clear();
    }

    pub fn lights(&self) -> &[PointLight] {
        &self.lights
    }

    pub fn len(&self) -> usize {
        self.lights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lights.is_empty()
    }

    /// Buffer size that holds the header plus the maximum number of lights.
    pub const fn buffer_size() -> u64 {
        (std::mem::size_of::<LightHeader>() + MAX_POINT_LIGHTS * std::mem::size_of::<PointLight>())
            as u64
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let header = LightHeader {
            count: self.lights.len() as u32,
            _padding: [0; 3],
        };
        let mut bytes = Vec::with_capacity(
            std::mem::size_of::<LightHeader>() + self.lights.len() * std::mem::size_of::<PointLight>(),
        );
        bytes.extend_from_slice(bytemuck::bytes_of(&header));
        bytes.extend_from_slice(bytemuck::cast_slice(&self.lights));
        bytes
    }
}

/// Entries in the material storage buffer.
pub const MAX_MATERIALS: usize = 1024;

/// Surface parameters indexed by `InstanceData::params[0]` (std430).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct MaterialData {
    pub base_color: [f32; 4],
    /// x: metallic, y: roughness, z: occlusion, w: emissive strength
    pub surface: [f32; 4],
    /// Bindless indices: base color, normal, metallic-roughness, emissive (`u32::MAX` = none)
    pub textures: [u32; 4],
}

impl Default for MaterialData {
    fn default() -> Self {
        Self {
            base_color: [1.0; 4],
            surface: [0.0, 0.5, 1.0, 0.0],
            textures: [u32::MAX; 4],
        }
    }
}

impl MaterialData {
    pub fn with_base_color_texture(mut self, index: u32) -> Self {
        self.textures[0] = index;
        self
    }
}

/// Ambient tint used when image-based lighting is disabled.
pub fn default_ambient() -> Vec4 {
    Vec4::new(0.03, 0.03, 0.03, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn frame_uniforms_are_std140_sized() {
        assert_eq!(std::mem::size_of::<FrameUniforms>() % 16, 0);
        assert_eq!(std::mem::size_of::<PointLight>(), 32);
    }

    #[test]
    fn camera_matrices_are_consistent() {
        let mut uniforms = FrameUniforms::default();
        let view = Mat4::look_at_rh(Vec3::new(0.0, 2.0, 5.0), Vec3::ZERO, Vec3::Y);
        let projection = Mat4::perspective_rh(1.0, 1.5, 0.1, 50.0);
        uniforms.set_camera(view, projection, Vec3::new(0.0, 2.0, 5.0));
        uniforms.set_time(3.5);

        let vp = Mat4::from_cols_array(&uniforms.view_proj);
        let inv = Mat4::from_cols_array(&uniforms.inv_view_proj);
        assert!((vp * inv).abs_diff_eq(Mat4::IDENTITY, 1e-4));
        assert_relative_eq!(uniforms.camera_pos[3], 3.5);
        assert_eq!(uniforms.view_matrix(), view);
    }

    #[test]
    fn light_data_serializes_header_then_lights() {
        let mut lights = LightData::new();
        lights.push(PointLight::new(Vec3::ONE, 2.0, Vec3::X, 5.0));
        lights.push(PointLight::new(Vec3::ZERO, 1.0, Vec3::Y, 1.0));
        let bytes = lights.to_bytes();
        assert_eq!(bytes.len(), 16 + 2 * 32);
        let header: LightHeader = bytemuck::pod_read_unaligned(&bytes[..16]);
        assert_eq!(header.count, 2);
        let first: PointLight = bytemuck::pod_read_unaligned(&bytes[16..48]);
        assert_eq!(first.position_radius, [1.0, 1.0, 1.0, 2.0]);
    }
}
