//! Peak location on a measured line.
//!
//! A magnet's field maximum along the scan axis is estimated by a least-squares
//! parabola through the samples of one field component.

use crate::error::{AppResult, DaqError};
use crate::scan::LineScanResult;

/// Field component of a [`crate::core::FieldVector`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Component {
    /// Bx
    X,
    /// By
    Y,
    /// Bz
    Z,
}

/// Least-squares parabola through one component of a line.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PeakFit {
    /// `[a, b, c]` of `a x^2 + b x + c`
    pub coefficients: [f64; 3],
    /// Vertex position `-b / 2a`
    pub position: f64,
    /// Fitted value at the vertex
    pub value: f64,
}

impl PeakFit {
    /// `(name, value)` rows for the export, positions in `units`.
    pub fn notes(&self, units: &str) -> Vec<(String, String)> {
        let coefficients: Vec<String> = self
            .coefficients
            .iter()
            .map(|c| format!("{:.6e}", c))
            .collect();
        vec![
            ("Polynomial fit coefficients".to_string(), coefficients.join(", ")),
            (format!("Peak position [{}]", units), format!("{:.3}", self.position)),
        ]
    }
}

/// Fit `y = a x^2 + b x + c` by least squares, returning `[a, b, c]`.
pub fn fit_quadratic(xs: &[f64], ys: &[f64]) -> AppResult<[f64; 3]> {
    if xs.len() != ys.len() {
        return Err(DaqError::Configuration(format!(
            "fit needs as many x as y values ({} vs {})",
            xs.len(),
            ys.len()
        )));
    }
    if xs.len() < 3 {
        return Err(DaqError::Configuration(format!(
            "quadratic fit needs at least 3 points, got {}",
            xs.len()
        )));
    }

    // Normal equations: sums of x^0..x^4 and of y*x^0..y*x^2.
    let mut s = [0.0; 5];
    let mut t = [0.0; 3];
    for (&x, &y) in xs.iter().zip(ys) {
        let mut p = 1.0;
        for (k, sk) in s.iter_mut().enumerate() {
            *sk += p;
            if k < 3 {
                t[k] += y * p;
            }
            p *= x;
        }
    }
    let mut m = [
        [s[4], s[3], s[2], t[2]],
        [s[3], s[2], s[1], t[1]],
        [s[2], s[1], s[0], t[0]],
    ];

    for col in 0..3 {
        let pivot = (col..3)
            .max_by(|&a, &b| m[a][col].abs().total_cmp(&m[b][col].abs()))
            .unwrap_or(col);
        if m[pivot][col].abs() < 1e-12 {
            return Err(DaqError::Configuration(
                "quadratic fit is singular (too few distinct positions)".to_string(),
            ));
        }
        m.swap(col, pivot);
        for row in 0..3 {
            if row != col {
                let factor = m[row][col] / m[col][col];
                for k in col..4 {
                    m[row][k] -= factor * m[col][k];
                }
            }
        }
    }
    Ok([m[0][3] / m[0][0], m[1][3] / m[1][1], m[2][3] / m[2][2]])
}

/// Locate the extremum of `component` along the line.
pub fn fit_peak(line: &LineScanResult, component: Component) -> AppResult<PeakFit> {
    let xs: Vec<f64> = line.positions.iter().map(|p| p.value).collect();
    let ys: Vec<f64> = line
        .fields
        .iter()
        .map(|f| match component {
            Component::X => f.x,
            Component::Y => f.y,
            Component::Z => f.z,
        })
        .collect();

    let coefficients = fit_quadratic(&xs, &ys)?;
    let [a, b, c] = coefficients;
    if a.abs() < f64::EPSILON {
        return Err(DaqError::Configuration(
            "field profile is linear, no peak to locate".to_string(),
        ));
    }
    let position = -b / (2.0 * a);
    Ok(PeakFit {
        coefficients,
        position,
        value: c - b * b / (4.0 * a),
    })
}
