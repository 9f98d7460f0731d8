//! Triangle meshes for the mesh and placeholder tiers

use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum MeshError {
    #[error("Line {line}: {message}")]
    Parse { line: usize, message: String },
    #[error("Mesh has no faces")]
    Empty,
}

/// Indexed triangle mesh with per-vertex normals
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshData {
    pub positions: Vec<[f32; 3]>,
    pub normals: Vec<[f32; 3]>,
    pub indices: Vec<u32>,
}

fn sub(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn cross(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn normalized(v: [f32; 3]) -> [f32; 3] {
    let len = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
    if len > f32::EPSILON {
        [v[0] / len, v[1] / len, v[2] / len]
    } else {
        [0.0, 0.0, 1.0]
    }
}

/// Resolve a 1-based (or negative, relative) OBJ index
fn resolve_index(token: &str, count: usize, line: usize) -> Result<usize, MeshError> {
    let value: i64 = token.parse().map_err(|_| MeshError::Parse {
        line,
        message: format!("invalid index '{}'", token),
    })?;
    let resolved = if value > 0 {
        value - 1
    } else {
        count as i64 + value
    };
    if value == 0 || resolved < 0 || resolved as usize >= count {
        return Err(MeshError::Parse {
            line,
            message: format!("index {} out of range ({} entries)", value, count),
        });
    }
    Ok(resolved as usize)
}

fn parse_floats<const N: usize>(
    parts: &mut std::str::SplitWhitespace<'_>,
    line: usize,
) -> Result<[f32; N], MeshError> {
    let mut out = [0.0f32; N];
    for slot in out.iter_mut() {
        let token = parts.next().ok_or_else(|| MeshError::Parse {
            line,
            message: format!("expected {} components", N),
        })?;
        *slot = token.parse().map_err(|_| MeshError::Parse {
            line,
            message: format!("invalid number '{}'", token),
        })?;
    }
    Ok(out)
}

/// Parse a Wavefront OBJ document.
///
/// Supports `v`, `vn` and `f` (polygons are fan-triangulated); everything
/// else is ignored. Vertices are unshared per face corner so normals from
/// `vn` can be honored. Faces without normals get flat normals.
pub fn parse_obj(source: &str) -> Result<MeshData, MeshError> {
    let mut positions: Vec<[f32; 3]> = Vec::new();
    let mut normals: Vec<[f32; 3]> = Vec::new();
    let mut mesh = MeshData::default();

    for (i, raw) in source.lines().enumerate() {
        let line = i + 1;
        let mut parts = raw.split_whitespace();
        match parts.next() {
            Some("v") => positions.push(parse_floats::<3>(&mut parts, line)?),
            Some("vn") => normals.push(normalized(parse_floats::<3>(&mut parts, line)?)),
            Some("f") => {
                let mut corners = Vec::new();
                for token in parts {
                    let mut fields = token.split('/');
                    let position = fields.next().unwrap_or_default();
                    let position = resolve_index(position, positions.len(), line)?;
                    let normal = match fields.nth(1) {
                        Some(n) if !n.is_empty() => Some(resolve_index(n, normals.len(), line)?),
                        _ => None,
                    };
                    corners.push((position, normal));
                }
                if corners.len() < 3 {
                    return Err(MeshError::Parse {
                        line,
                        message: format!("face with {} vertices", corners.len()),
                    });
                }

                for k in 1..corners.len() - 1 {
                    let triangle = [corners[0], corners[k], corners[k + 1]];
                    let p = triangle.map(|(pi, _)| positions[pi]);
                    let flat = normalized(cross(sub(p[1], p[0]), sub(p[2], p[0])));
                    for (pi, ni) in triangle {
                        mesh.indices.push(mesh.positions.len() as u32);
                        mesh.positions.push(positions[pi]);
                        mesh.normals.push(ni.map(|n| normals[n]).unwrap_or(flat));
                    }
                }
            }
            _ => {}
        }
    }

    if mesh.indices.is_empty() {
        return Err(MeshError::Empty);
    }
    Ok(mesh)
}

impl MeshData {
    /// Axis-aligned box centered at the origin with the given extents
    pub fn box_volume(size: [f32; 3]) -> Self {
        let [hx, hy, hz] = size.map(|s| s / 2.0);
        let faces: [([f32; 3], [[f32; 3]; 4]); 6] = [
            ([1.0, 0.0, 0.0], [[hx, -hy, -hz], [hx, hy, -hz], [hx, hy, hz], [hx, -hy, hz]]),
            ([-1.0, 0.0, 0.0], [[-hx, -hy, hz], [-hx, hy, hz], [-hx, hy, -hz], [-hx, -hy, -hz]]),
            ([0.0, 1.0, 0.0], [[-hx, hy, -hz], [-hx, hy, hz], [hx, hy, hz], [hx, hy, -hz]]),
            ([0.0, -1.0, 0.0], [[-hx, -hy, hz], [-hx, -hy, -hz], [hx, -hy, -hz], [hx, -hy, hz]]),
            ([0.0, 0.0, 1.0], [[-hx, -hy, hz], [hx, -hy, hz], [hx, hy, hz], [-hx, hy, hz]]),
            ([0.0, 0.0, -1.0], [[hx, -hy, -hz], [-hx, -hy, -hz], [-hx, hy, -hz], [hx, hy, -hz]]),
        ];

        let mut mesh = MeshData::default();
        for (normal, corners) in faces {
            let base = mesh.positions.len() as u32;
            for corner in corners {
                mesh.positions.push(corner);
                mesh.normals.push(normal);
            }
            mesh.indices
                .extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }
        mesh
    }

    /// Reflect across the YZ plane, keeping triangles front-facing
    pub fn mirrored_x(&self) -> Self {
        let flip = |v: &[f32; 3]| [-v[0], v[1], v[2]];
        let indices = self
            .indices
            .chunks_exact(3)
            .flat_map(|t| [t[0], t[2], t[1]])
            .collect();
        Self {
            positions: self.positions.iter().map(flip).collect(),
            normals: self.normals.iter().map(flip).collect(),
            indices,
        }
    }

    pub fn bounds(&self) -> Option<([f32; 3], [f32; 3])> {
        let first = *self.positions.first()?;
        Some(self.positions.iter().fold((first, first), |(mut min, mut max), p| {
            for axis in 0..3 {
                min[axis] = min[axis].min(p[axis]);
                max[axis] = max[axis].max(p[axis]);
            }
            (min, max)
        }))
    }

    pub fn largest_extent(&self) -> f32 {
        self.bounds()
            .map(|(min, max)| (0..3).map(|a| max[a] - min[a]).fold(0.0, f32::max))
            .unwrap_or(0.0)
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUAD: &str = "\
# unit quad
v 0 0 0
v 2 0 0
v 2 1 0
v 0 1 0
f 1 2 3 4
";

    #[test]
    fn test_parse_quad_fan() {
        let mesh = parse_obj(QUAD).unwrap();
        assert_eq!(mesh.triangle_count(), 2);
        assert_eq!(mesh.normals[0], [0.0, 0.0, 1.0]);
        assert_eq!(mesh.largest_extent(), 2.0);
    }

    #[test]
    fn test_negative_indices_and_normals() {
        let source = "v 0 0 0\nv 1 0 0\nv 0 1 0\nvn 0 0 2\nf -3//1 -2//1 -1//1\n";
        let mesh = parse_obj(source).unwrap();
        assert_eq!(mesh.triangle_count(), 1);
        assert_eq!(mesh.positions[2], [0.0, 1.0, 0.0]);
        assert_eq!(mesh.normals[1], [0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(parse_obj("v 0 0 0\n"), Err(MeshError::Empty));
        assert!(matches!(
            parse_obj("v 0 0 0\nf 1 2 3\n"),
            Err(MeshError::Parse { line: 2, .. })
        ));
        assert!(matches!(
            parse_obj("v 0 zero 0\n"),
            Err(MeshError::Parse { line: 1, .. })
        ));
    }

    #[test]
    fn test_mirrored_x_flips_winding() {
        let mesh = parse_obj(QUAD).unwrap();
        let mirrored = mesh.mirrored_x();
        assert_eq!(mirrored.positions[1], [-2.0, 0.0, 0.0]);
        assert_eq!(mirrored.indices[..3], [mesh.indices[0], mesh.indices[2], mesh.indices[1]]);
        assert_eq!(mirrored.normals[0], [-0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_box_volume() {
        let mesh = MeshData::box_volume([0.6, 0.05, 1.0]);
        assert_eq!(mesh.triangle_count(), 12);
        let (min, max) = mesh.bounds().unwrap();
        assert_eq!(min, [-0.3, -0.025, -0.5]);
        assert_eq!(max, [0.3, 0.025, 0.5]);
    }
}
