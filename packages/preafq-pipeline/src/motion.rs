//! Rigid-body motion parameters from registration matrices
//!
//! Each 4x4 matrix is assumed to be `[R | t]` with the rotation built as
//!
//! ```text
//! R = [          c5*c6,           c5*s6, s5   ]
//!     [-s4*s5*c6-c4*s6, -s4*s5*s6+c4*c6, s4*c5]
//!     [-c4*s5*c6+s4*s6, -c4*s5*s6-s4*c6, c4*c5]
//! ```
//!
//! where 4, 5, 6 index the rotations about x, y, z (SPM's `spm_imatrix`
//! convention, with shears and zooms already removed).

use crate::error::{PipelineError, Result};
use std::f64::consts::FRAC_PI_2;
use std::fmt::Write as _;
use std::path::Path;

pub type Affine = [[f64; 4]; 4];

/// Squared distance of |Ry| from pi/2 under which the x and z rotations
/// can no longer be separated
pub const GIMBAL_TOLERANCE: f64 = 1e-9;

/// Header of the matrix block printed by `avscale --allparams`
pub const AVSCALE_MATRIX_HEADER: &str = "Rotation & Translation Matrix:";

/// Output file of the motion parameter node
pub const MOTION_PARAMS_FILE: &str = "motion_parameters.par";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionParams {
    /// (Rx, Ry, Rz) in radians
    pub rotations: [f64; 3],
    /// (Tx, Ty, Tz) in mm
    pub translations: [f64; 3],
}

impl MotionParams {
    /// (Rx, Ry, Rz, Tx, Ty, Tz)
    pub fn values(&self) -> [f64; 6] {
        let [rx, ry, rz] = self.rotations;
        let [tx, ty, tz] = self.translations;
        [rx, ry, rz, tx, ty, tz]
    }
}

/// Clamp to the domain of the inverse trig functions
fn rang(b: f64) -> f64 {
    b.clamp(-1.0, 1.0)
}

pub fn decompose(a: &Affine) -> MotionParams {
    let ry = rang(a[0][2]).asin();

    let (rx, rz) = if (ry.abs() - FRAC_PI_2).powi(2) < GIMBAL_TOLERANCE {
        // Gimbal lock: only Rz +/- Rx is determined, attribute it all to Rz
        (0.0, (-rang(a[1][0])).atan2(rang(-a[2][0] / a[0][2])))
    } else {
        let c = ry.cos();
        (
            rang(a[1][2] / c).atan2(rang(a[2][2] / c)),
            rang(a[0][1] / c).atan2(rang(a[0][0] / c)),
        )
    };

    MotionParams {
        rotations: [rx, ry, rz],
        translations: [a[0][3], a[1][3], a[2][3]],
    }
}

pub fn recompose(params: &MotionParams) -> Affine {
    let [x, y, z] = params.rotations;
    let [tx, ty, tz] = params.translations;
    let (s4, c4) = x.sin_cos();
    let (s5, c5) = y.sin_cos();
    let (s6, c6) = z.sin_cos();

    [
        [c5 * c6, c5 * s6, s5, tx],
        [
            -s4 * s5 * c6 - c4 * s6,
            -s4 * s5 * s6 + c4 * c6,
            s4 * c5,
            ty,
        ],
        [
            -c4 * s5 * c6 + s4 * s6,
            -c4 * s5 * s6 - s4 * c6,
            c4 * c5,
            tz,
        ],
        [0.0, 0.0, 0.0, 1.0],
    ]
}

/// Parse a 4x4 matrix written as whitespace-separated rows (FLIRT `.mat`)
pub fn parse_matrix(text: &str, source_name: &str) -> Result<Affine> {
    let malformed = |reason: String| PipelineError::MalformedMatrix {
        source_name: source_name.to_string(),
        reason,
    };

    let rows: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    if rows.len() != 4 {
        return Err(malformed(format!("expected 4 rows, found {}", rows.len())));
    }

    let mut matrix = [[0.0; 4]; 4];
    for (i, row) in rows.iter().enumerate() {
        let values = row
            .split_whitespace()
            .map(|v| v.parse::<f64>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| malformed(format!("row {}: {}", i + 1, e)))?;
        if values.len() != 4 {
            return Err(malformed(format!(
                "row {} has {} columns, expected 4",
                i + 1,
                values.len()
            )));
        }
        matrix[i].copy_from_slice(&values);
    }

    Ok(matrix)
}

/// Extract the rigid part printed by `avscale --allparams`
pub fn parse_avscale(stdout: &str, source_name: &str) -> Result<Affine> {
    let block: Vec<&str> = stdout
        .lines()
        .skip_while(|l| !l.contains(AVSCALE_MATRIX_HEADER))
        .skip(1)
        .filter(|l| !l.trim().is_empty())
        .take(4)
        .collect();

    if block.is_empty() {
        return Err(PipelineError::MalformedMatrix {
            source_name: source_name.to_string(),
            reason: format!("no '{}' block in avscale output", AVSCALE_MATRIX_HEADER),
        });
    }

    parse_matrix(&block.join("\n"), source_name)
}

/// One line per volume, `%f `-formatted values
pub fn format_parameters(params: &[MotionParams]) -> String {
    let mut out = String::new();
    for p in params {
        for v in p.values() {
            let _ = write!(out, "{:.6} ", v);
        }
        out.push('\n');
    }
    out
}

pub fn write_parameters(path: &Path, params: &[MotionParams]) -> Result<()> {
    std::fs::write(path, format_parameters(params))?;
    Ok(())
}
