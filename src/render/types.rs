//! GPU-side data layouts (must match the WGSL structs)

use bytemuck::{Pod, Zeroable};
use glam::Mat4;

use crate::assets::{MeshData, SplatCloud};

/// Background quad parameters
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct QuadUniforms {
    pub model_view_proj: [[f32; 4]; 4],
    /// 1.0 samples the video at 1 - u
    pub flip_u: f32,
    pub _pad: [f32; 3],
}

impl QuadUniforms {
    pub fn new(model_view_proj: Mat4, flip_u: bool) -> Self {
        Self {
            model_view_proj: model_view_proj.to_cols_array_2d(),
            flip_u: if flip_u { 1.0 } else { 0.0 },
            _pad: [0.0; 3],
        }
    }
}

/// Per-part parameters of the mesh pass
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct PartUniforms {
    pub model_view_proj: [[f32; 4]; 4],
    pub model: [[f32; 4]; 4],
    /// Tint (RGBA)
    pub color: [f32; 4],
}

impl PartUniforms {
    pub fn new(model_view_proj: Mat4, model: Mat4, color: [f32; 4]) -> Self {
        Self {
            model_view_proj: model_view_proj.to_cols_array_2d(),
            model: model.to_cols_array_2d(),
            color,
        }
    }
}

/// Per-part parameters of the splat pass. Quads are expanded in view
/// space, so the projection is kept apart from the model matrix.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct SplatUniforms {
    pub view_proj: [[f32; 4]; 4],
    pub model: [[f32; 4]; 4],
    pub color: [f32; 4],
}

impl SplatUniforms {
    pub fn new(view_proj: Mat4, model: Mat4, color: [f32; 4]) -> Self {
        Self {
            view_proj: view_proj.to_cols_array_2d(),
            model: model.to_cols_array_2d(),
            color,
        }
    }
}

/// Mesh vertex (position + normal)
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct MeshVertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
}

impl MeshVertex {
    const ATTRIBUTES: [wgpu::VertexAttribute; 2] =
        wgpu::vertex_attr_array![0 => Float32x3, 1 => Float32x3];

    pub fn layout() -> wgpu::VertexBufferLayout<'static> {
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<MeshVertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &Self::ATTRIBUTES,
        }
    }
}

/// GPU splat (48 bytes, vec4-aligned for WGSL)
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct GpuSplat {
    /// xyz, w unused
    pub position: [f32; 4],
    /// xyz standard deviation, w unused
    pub scale: [f32; 4],
    /// Linear RGBA in [0, 1]
    pub color: [f32; 4],
}

pub fn mesh_vertices(mesh: &MeshData) -> Vec<MeshVertex> {
    mesh.positions
        .iter()
        .zip(&mesh.normals)
        .map(|(&position, &normal)| MeshVertex { position, normal })
        .collect()
}

pub fn gpu_splats(cloud: &SplatCloud) -> Vec<GpuSplat> {
    cloud
        .positions
        .chunks_exact(3)
        .zip(cloud.scales.chunks_exact(3))
        .zip(cloud.colors.chunks_exact(4))
        .map(|((p, s), c)| GpuSplat {
            position: [p[0], p[1], p[2], 1.0],
            scale: [s[0], s[1], s[2], 0.0],
            color: [
                c[0] as f32 / 255.0,
                c[1] as f32 / 255.0,
                c[2] as f32 / 255.0,
                c[3] as f32 / 255.0,
            ],
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_sizes_match_wgsl() {
        assert_eq!(std::mem::size_of::<QuadUniforms>(), 80);
        assert_eq!(std::mem::size_of::<PartUniforms>(), 144);
        assert_eq!(std::mem::size_of::<SplatUniforms>(), 144);
        assert_eq!(std::mem::size_of::<GpuSplat>(), 48);
        assert_eq!(std::mem::size_of::<MeshVertex>(), 24);
        assert_eq!(
            std::mem::size_of::<crate::occlusion::OcclusionUniforms>(),
            80
        );
    }

    #[test]
    fn test_gpu_splats() {
        let cloud = SplatCloud {
            positions: vec![1.0, 2.0, 3.0],
            colors: vec![255, 0, 51, 255],
            scales: vec![0.1, 0.2, 0.3],
            rotations: vec![1.0, 0.0, 0.0, 0.0],
            count: 1,
        };
        let splats = gpu_splats(&cloud);
        assert_eq!(splats.len(), 1);
        assert_eq!(splats[0].position, [1.0, 2.0, 3.0, 1.0]);
        assert_eq!(splats[0].color, [1.0, 0.0, 0.2, 1.0]);
    }

    #[test]
    fn test_mesh_vertices() {
        let mesh = MeshData::box_volume([1.0, 1.0, 1.0]);
        let vertices = mesh_vertices(&mesh);
        assert_eq!(vertices.len(), 24);
        assert_eq!(vertices[0].normal, [1.0, 0.0, 0.0]);
    }
}
