//! Gradient direction (b-vector) rotation
//!
//! FSL layout: three rows (x, y, z), one column per volume. Each non-zero
//! direction is rotated by the inverse of its volume's registration matrix
//! and renormalized.

use crate::error::{PipelineError, Result};
use crate::motion::Affine;
use std::path::Path;

type Mat3 = [[f64; 3]; 3];

const SINGULAR_EPSILON: f64 = 1e-12;

pub fn parse_bvecs(text: &str, path: &Path) -> Result<Vec<[f64; 3]>> {
    let malformed = |reason: String| PipelineError::MalformedBvec {
        path: path.to_path_buf(),
        reason,
    };

    let rows = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| {
            l.split_whitespace()
                .map(str::parse::<f64>)
                .collect::<std::result::Result<Vec<_>, _>>()
        })
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| malformed(e.to_string()))?;

    if rows.len() != 3 {
        return Err(malformed(format!("expected 3 rows, found {}", rows.len())));
    }
    let n = rows[0].len();
    if rows.iter().any(|r| r.len() != n) {
        return Err(malformed("rows have different lengths".to_string()));
    }

    Ok((0..n).map(|i| [rows[0][i], rows[1][i], rows[2][i]]).collect())
}

pub fn read_bvecs(path: &Path) -> Result<Vec<[f64; 3]>> {
    parse_bvecs(&std::fs::read_to_string(path)?, path)
}

fn invert3(m: &Mat3) -> Option<Mat3> {
    let det = m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0]);
    if det.abs() < SINGULAR_EPSILON {
        return None;
    }

    let inv_det = 1.0 / det;
    Some([
        [
            (m[1][1] * m[2][2] - m[1][2] * m[2][1]) * inv_det,
            (m[0][2] * m[2][1] - m[0][1] * m[2][2]) * inv_det,
            (m[0][1] * m[1][2] - m[0][2] * m[1][1]) * inv_det,
        ],
        [
            (m[1][2] * m[2][0] - m[1][0] * m[2][2]) * inv_det,
            (m[0][0] * m[2][2] - m[0][2] * m[2][0]) * inv_det,
            (m[0][2] * m[1][0] - m[0][0] * m[1][2]) * inv_det,
        ],
        [
            (m[1][0] * m[2][1] - m[1][1] * m[2][0]) * inv_det,
            (m[0][1] * m[2][0] - m[0][0] * m[2][1]) * inv_det,
            (m[0][0] * m[1][1] - m[0][1] * m[1][0]) * inv_det,
        ],
    ])
}

/// Rotate every direction by the inverse of the matching matrix.
///
/// `names` labels the matrices in error messages.
pub fn rotate_bvecs(
    vectors: &[[f64; 3]],
    matrices: &[Affine],
    names: &[String],
) -> Result<Vec<[f64; 3]>> {
    if vectors.len() != matrices.len() {
        return Err(PipelineError::CountMismatch {
            vectors: vectors.len(),
            matrices: matrices.len(),
        });
    }

    vectors
        .iter()
        .zip(matrices)
        .enumerate()
        .map(|(i, (v, m))| {
            if v.iter().all(|c| *c == 0.0) {
                return Ok(*v);
            }

            let upper = [
                [m[0][0], m[0][1], m[0][2]],
                [m[1][0], m[1][1], m[1][2]],
                [m[2][0], m[2][1], m[2][2]],
            ];
            let inv = invert3(&upper).ok_or_else(|| {
                PipelineError::SingularMatrix(
                    names
                        .get(i)
                        .cloned()
                        .unwrap_or_else(|| format!("matrix {}", i)),
                )
            })?;

            let rotated = [
                inv[0][0] * v[0] + inv[0][1] * v[1] + inv[0][2] * v[2],
                inv[1][0] * v[0] + inv[1][1] * v[1] + inv[1][2] * v[2],
                inv[2][0] * v[0] + inv[2][1] * v[1] + inv[2][2] * v[2],
            ];
            let norm = rotated.iter().map(|c| c * c).sum::<f64>().sqrt();
            Ok([rotated[0] / norm, rotated[1] / norm, rotated[2] / norm])
        })
        .collect()
}

/// Three rows, 15 decimals
pub fn format_bvecs(vectors: &[[f64; 3]]) -> String {
    let mut out = String::new();
    for axis in 0..3 {
        let row: Vec<String> = vectors.iter().map(|v| format!("{:.15}", v[axis])).collect();
        out.push_str(&row.join(" "));
        out.push('\n');
    }
    out
}

/// `sub-01_dwi.bvec` -> `sub-01_dwi_rotated.bvec`.
///
/// The extension is always `.bvec`, so FSL-style `bvecs` becomes
/// `bvecs_rotated.bvec`. A trailing `.gz` is stripped along with the
/// extension before it.
pub fn rotated_bvec_name(bvec: &Path) -> String {
    let name = bvec
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = name.strip_suffix(".gz").unwrap_or(&name);
    let stem = match name.rfind('.') {
        Some(dot) if dot > 0 => &name[..dot],
        _ => name,
    };
    format!("{}_rotated.bvec", stem)
}
