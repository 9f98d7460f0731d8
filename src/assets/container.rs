//! Point-cloud container decoding
//!
//! Layout: optional 4-byte magic (3 ASCII letters + version byte), a
//! little-endian u32 element count, then 44-byte records:
//! position (3 x f32), rotation (4 x f32), scale (3 x f32), color (4 x u8).

use thiserror::Error;

pub const RECORD_SIZE: usize = 44;
pub const MAX_ELEMENTS: usize = 10_000_000;
const MAGIC_SIZE: usize = 4;
const COUNT_SIZE: usize = 4;

#[derive(Error, Debug, PartialEq)]
pub enum ContainerError {
    #[error("Container too short: {0} bytes")]
    TooShort(usize),
    #[error("Implausible element count {declared} for {bytes} bytes")]
    Corrupt { declared: u32, bytes: usize },
    #[error("Container truncated: {expected} elements declared, data for {available}")]
    Truncated { expected: usize, available: usize },
}

/// Decoded point cloud, flattened per attribute
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SplatCloud {
    /// xyz per element
    pub positions: Vec<f32>,
    /// RGBA per element
    pub colors: Vec<u8>,
    /// xyz per element
    pub scales: Vec<f32>,
    /// Quaternion per element, stored as (w, x, y, z)
    pub rotations: Vec<f32>,
    pub count: usize,
}

fn has_magic(bytes: &[u8]) -> bool {
    bytes.len() >= MAGIC_SIZE && bytes[..3].iter().all(|b| b.is_ascii_uppercase())
}

fn read_f32(bytes: &[u8], offset: usize) -> f32 {
    f32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// Decode a container into a [`SplatCloud`]
pub fn decode_splat_container(bytes: &[u8]) -> Result<SplatCloud, ContainerError> {
    let header_size = if has_magic(bytes) { MAGIC_SIZE } else { 0 };
    if bytes.len() < header_size + COUNT_SIZE {
        return Err(ContainerError::TooShort(bytes.len()));
    }

    let declared = u32::from_le_bytes([
        bytes[header_size],
        bytes[header_size + 1],
        bytes[header_size + 2],
        bytes[header_size + 3],
    ]);

    let count = if declared == 0 || declared as usize > MAX_ELEMENTS {
        // The size estimate includes the count field in the header
        let estimate = (bytes.len() - header_size) / RECORD_SIZE;
        if estimate == 0 || estimate > MAX_ELEMENTS {
            return Err(ContainerError::Corrupt {
                declared,
                bytes: bytes.len(),
            });
        }
        log::debug!(
            "Container declares {} elements, estimated {} from size",
            declared,
            estimate
        );
        estimate
    } else {
        declared as usize
    };

    let data = &bytes[header_size + COUNT_SIZE..];
    // The final record may omit its alpha byte
    let available = (data.len() + 1) / RECORD_SIZE;
    let count = if declared == 0 || declared as usize > MAX_ELEMENTS {
        match count.min(available) {
            0 => {
                return Err(ContainerError::Corrupt {
                    declared,
                    bytes: bytes.len(),
                })
            }
            n => n,
        }
    } else if available < count {
        return Err(ContainerError::Truncated {
            expected: count,
            available,
        });
    } else {
        count
    };

    let mut cloud = SplatCloud {
        positions: Vec::with_capacity(count * 3),
        colors: Vec::with_capacity(count * 4),
        scales: Vec::with_capacity(count * 3),
        rotations: Vec::with_capacity(count * 4),
        count,
    };

    for i in 0..count {
        let base = i * RECORD_SIZE;
        for axis in 0..3 {
            cloud.positions.push(read_f32(data, base + axis * 4));
        }
        for component in 0..4 {
            cloud.rotations.push(read_f32(data, base + 12 + component * 4));
        }
        for axis in 0..3 {
            cloud.scales.push(read_f32(data, base + 28 + axis * 4));
        }
        for channel in 0..4 {
            let byte = data.get(base + 40 + channel).copied();
            cloud.colors.push(byte.unwrap_or(255));
        }
    }

    Ok(cloud)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(position: [f32; 3], color: [u8; 4]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(RECORD_SIZE);
        for v in position {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        for v in [1.0f32, 0.0, 0.0, 0.0] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        for v in [0.1f32, 0.2, 0.3] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes.extend_from_slice(&color);
        bytes
    }

    #[test]
    fn test_decode_with_magic_header() {
        let mut bytes = b"KSP".to_vec();
        bytes.push(1);
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend(record([1.0, 2.0, 3.0], [10, 20, 30, 40]));
        bytes.extend(record([4.0, 5.0, 6.0], [50, 60, 70, 80]));

        let cloud = decode_splat_container(&bytes).unwrap();
        assert_eq!(cloud.count, 2);
        assert_eq!(cloud.positions.len(), 6);
        assert_eq!(cloud.colors.len(), 8);
        assert_eq!(cloud.scales.len(), 6);
        assert_eq!(cloud.rotations.len(), 8);
        assert_eq!(cloud.positions[3..], [4.0, 5.0, 6.0]);
        assert_eq!(cloud.colors[..4], [10, 20, 30, 40]);
        assert_eq!(cloud.rotations[..4], [1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_zero_count_estimates_from_size() {
        let mut bytes = vec![0u8; 4];
        for i in 0..3 {
            bytes.extend(record([i as f32, 0.0, 0.0], [1, 2, 3, 4]));
        }
        assert_eq!(bytes.len(), 4 + 3 * RECORD_SIZE);

        let cloud = decode_splat_container(&bytes).unwrap();
        assert_eq!(cloud.count, 3);
        assert_eq!(cloud.positions[6], 2.0);
    }

    #[test]
    fn test_missing_final_alpha_defaults_opaque() {
        let mut bytes = 1u32.to_le_bytes().to_vec();
        let mut r = record([0.0, 0.0, 0.0], [9, 9, 9, 9]);
        r.pop();
        bytes.extend(r);

        let cloud = decode_splat_container(&bytes).unwrap();
        assert_eq!(cloud.colors, vec![9, 9, 9, 255]);
    }

    #[test]
    fn test_truncated_and_corrupt() {
        let mut bytes = 5u32.to_le_bytes().to_vec();
        bytes.extend(record([0.0, 0.0, 0.0], [0, 0, 0, 0]));
        assert_eq!(
            decode_splat_container(&bytes),
            Err(ContainerError::Truncated {
                expected: 5,
                available: 1
            })
        );

        assert!(matches!(
            decode_splat_container(&[0, 0, 0, 0, 1, 2]),
            Err(ContainerError::Corrupt { declared: 0, .. })
        ));
        assert_eq!(
            decode_splat_container(&[1, 2]),
            Err(ContainerError::TooShort(2))
        );
    }

    #[test]
    fn test_estimate_without_complete_record_is_corrupt() {
        // Size estimate of one element, but only 40 record bytes
        let mut bytes = vec![0u8; 4];
        bytes.extend(std::iter::repeat(0u8).take(40));
        assert_eq!(
            decode_splat_container(&bytes),
            Err(ContainerError::Corrupt {
                declared: 0,
                bytes: 44
            })
        );

        let mut bytes = b"KSP\x01".to_vec();
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend(std::iter::repeat(0u8).take(40));
        assert!(matches!(
            decode_splat_container(&bytes),
            Err(ContainerError::Corrupt { declared: 0, .. })
        ));
    }
}
