//! Mesh data as the geometry pass consumes it: one storage buffer holding vertices followed
//! by indices, plus a per-instance transform buffer.

use ash::vk;
use glam::{Mat4, Vec4};

use crate::renderer::{BufferRecord, DeviceContext, Handle};
use crate::vulkan::{BufferDesc, MemoryLocation};
use crate::Result;

/// Vertex layout read from the storage buffer (std430).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub uv_x: f32,
    pub normal: [f32; 3],
    pub uv_y: f32,
    pub tangent: [f32; 4],
}

/// Per-instance data (GPU layout)
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct InstanceData {
    /// Model matrix, column-major
    pub model: [f32; 16],
    /// Instance color multiplier (RGBA)
    pub color: [f32; 4],
    /// x: material index, y: casts shadows (0/1), zw: unused
    pub params: [u32; 4],
}

impl InstanceData {
    pub fn new(model: Mat4, color: Vec4, material: u32) -> Self {
        Self {
            model: model.to_cols_array(),
            color: color.to_array(),
            params: [material, 1, 0, 0],
        }
    }

    pub fn from_matrix(model: Mat4) -> Self {
        Self::new(model, Vec4::ONE, 0)
    }

    pub fn with_shadows(mut self, casts_shadows: bool) -> Self {
        self.params[1] = casts_shadows as u32;
        self
    }

    pub fn casts_shadows(&self) -> bool {
        self.params[1] != 0
    }
}

/// Vertex and index bytes packed into one buffer, indices starting at an aligned offset.
#[derive(Debug, Clone, PartialEq)]
pub struct PackedMesh {
    pub bytes: Vec<u8>,
    pub vertex_count: u32,
    pub index_count: u32,
    /// Byte offset of the first index
    pub index_offset: u64,
}

impl PackedMesh {
    pub fn pack(vertices: &[Vertex], indices: &[u32], alignment: u64) -> Self {
        let vertex_bytes: &[u8] = bytemuck::cast_slice(vertices);
        let index_offset = align_up(vertex_bytes.len() as u64, alignment);
        let index_bytes: &[u8] = bytemuck::cast_slice(indices);

        let mut bytes = vec![0u8; index_offset as usize + index_bytes.len()];
        bytes[..vertex_bytes.len()].copy_from_slice(vertex_bytes);
        bytes[index_offset as usize..].copy_from_slice(index_bytes);

        Self {
            bytes,
            vertex_count: vertices.len() as u32,
            index_count: indices.len() as u32,
            index_offset,
        }
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// Rounds `value` up to a multiple of `alignment` (0 and 1 leave it unchanged).
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

/// A mesh resident in a registered storage buffer, drawn as `instance_count` instances.
#[derive(Debug, Clone)]
pub struct GpuMesh {
    pub name: String,
    pub geometry: Handle<BufferRecord>,
    pub instances: Handle<BufferRecord>,
    pub index_count: u32,
    pub index_offset: u64,
    pub instance_count: u32,
    pub shadow_instance_count: u32,
}

impl GpuMesh {
    pub fn upload(
        ctx: &mut DeviceContext,
        name: &str,
        mesh: &PackedMesh,
        instances: &[InstanceData],
    ) -> Result<Self> {
        let geometry = ctx.create_buffer(&BufferDesc {
            size: mesh.size().max(4),
            usage: vk::BufferUsageFlags::STORAGE_BUFFER,
            location: MemoryLocation::CpuToGpu,
            name: format!("{name}_geometry"),
        })?;
        ctx.write_buffer(geometry, 0, &mesh.bytes)?;

        // Shadow casters first so the shadow pass can draw a prefix of the instance buffer.
        let mut ordered: Vec<InstanceData> = instances.to_vec();
        ordered.sort_by_key(|instance| !instance.casts_shadows());
        let shadow_instance_count = ordered.iter().filter(|i| i.casts_shadows()).count() as u32;

        let instance_buffer = ctx.create_buffer(&BufferDesc {
            size: (std::mem::size_of::<InstanceData>() * ordered.len().max(1)) as u64,
            usage: vk::BufferUsageFlags::STORAGE_BUFFER,
            location: MemoryLocation::CpuToGpu,
            name: format!("{name}_instances"),
        })?;
        ctx.upload_slice(instance_buffer, &ordered)?;

        log::debug!(
            "[Mesh] '{name}' uploaded: {} vertices, {} indices, {} instances",
            mesh.vertex_count,
            mesh.index_count,
            ordered.len()
        );

        Ok(Self {
            name: name.to_string(),
            geometry,
            instances: instance_buffer,
            index_count: mesh.index_count,
            index_offset: mesh.index_offset,
            instance_count: ordered.len() as u32,
            shadow_instance_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle() -> Vec<Vertex> {
        (0..3)
            .map(|i| Vertex {
                position: [i as f32, 0.0, 0.0],
                ..Default::default()
            })
            .collect()
    }

    #[test]
    fn index_offset_is_aligned() {
        let packed = PackedMesh::pack(&triangle(), &[0, 1, 2], 256);
        // 3 vertices * 48 bytes = 144, rounded up to 256
        assert_eq!(packed.index_offset, 256);
        assert_eq!(packed.size(), 256 + 12);
        let second: u32 = bytemuck::pod_read_unaligned(&packed.bytes[260..264]);
        assert_eq!(second, 1);
    }

    #[test]
    fn align_up_edge_cases() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
        assert_eq!(align_up(7, 1), 7);
    }

    #[test]
    fn instance_shadow_flag() {
        let instance = InstanceData::from_matrix(Mat4::IDENTITY);
        assert!(instance.casts_shadows());
        assert!(!instance.with_shadows(false).casts_shadows());
    }
}
