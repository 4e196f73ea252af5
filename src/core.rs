//! Core data types shared by the devices and the scan orchestrators.
//!
//! - [`AxisPosition`]: an engineering-unit coordinate bound to the step scale of
//!   the axis it belongs to. The step count is what hardware sees, so every
//!   comparison that decides whether a trigger fires is made on steps.
//! - [`ScanRange`]: an inclusive, evenly spaced sequence of targets.
//! - [`FieldVector`]: one three-component probe reading.

use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fraction of one step added before flooring the point count, so that
/// `(stop - start) / step` landing a hair under an integer still includes `stop`.
const RANGE_EPSILON: f64 = 1e-6;

// =============================================================================
// AxisPosition
// =============================================================================

/// A physical coordinate (mm or degrees) together with its unit-to-step factor.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AxisPosition {
    /// Position in engineering units
    pub value: f64,
    /// Device steps per engineering unit
    pub scale_factor: f64,
}

impl AxisPosition {
    /// Bind a coordinate to an axis scale.
    pub fn new(value: f64, scale_factor: f64) -> Self {
        Self {
            value,
            scale_factor,
        }
    }

    /// The integer step count transmitted to hardware.
    pub fn steps(&self) -> i64 {
        (self.value * self.scale_factor).round() as i64
    }

    /// Convert a raw step count back to engineering units.
    pub fn from_steps(steps: f64, scale_factor: f64) -> Self {
        Self::new(steps / scale_factor, scale_factor)
    }
}

impl fmt::Display for AxisPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3} ({} steps)", self.value, self.steps())
    }
}

// =============================================================================
// ScanRange
// =============================================================================

/// Inclusive, evenly spaced scan targets from `start` towards `stop`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScanRange {
    start: f64,
    stop: f64,
    step: f64,
}

impl ScanRange {
    /// Build a range, validating that `step` is usable for `start -> stop`.
    ///
    /// The sign of `step` must agree with `stop - start`. When `start == stop`
    /// the range holds a single point regardless of `step`.
    pub fn new(start: f64, stop: f64, step: f64) -> AppResult<Self> {
        if !start.is_finite() || !stop.is_finite() || !step.is_finite() {
            return Err(DaqError::Configuration(format!(
                "scan range ({}, {}, {}) must be finite",
                start, stop, step
            )));
        }
        if start != stop {
            if step == 0.0 {
                return Err(DaqError::Configuration(
                    "scan step must be nonzero".to_string(),
                ));
            }
            if (stop - start).signum() != step.signum() {
                return Err(DaqError::Configuration(format!(
                    "step {} does not lead from {} to {}",
                    step, start, stop
                )));
            }
        }
        Ok(Self { start, stop, step })
    }

    /// A one-point range, used for fixed axis positions.
    pub fn single(position: f64) -> Self {
        Self {
            start: position,
            stop: position,
            step: 0.0,
        }
    }

    /// First target.
    pub fn start(&self) -> f64 {
        self.start
    }

    /// Nominal last target.
    pub fn stop(&self) -> f64 {
        self.stop
    }

    /// Signed spacing between targets.
    pub fn step(&self) -> f64 {
        self.step
    }

    /// `+1.0` for ascending, `-1.0` for descending, `0.0` for a single point.
    pub fn direction(&self) -> f64 {
        if self.stop == self.start {
            0.0
        } else {
            (self.stop - self.start).signum()
        }
    }

    /// Number of targets: `floor((stop - start) / step) + 1`.
    pub fn len(&self) -> usize {
        if self.start == self.stop {
            return 1;
        }
        ((self.stop - self.start) / self.step + RANGE_EPSILON).floor() as usize + 1
    }

    /// Never true; a valid range always has at least its start point.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Target at index `i`, computed directly so no rounding accumulates.
    pub fn value_at(&self, i: usize) -> f64 {
        self.start + i as f64 * self.step
    }

    /// All targets in scan order.
    pub fn values(&self) -> Vec<f64> {
        (0..self.len()).map(|i| self.value_at(i)).collect()
    }

    /// All targets bound to an axis scale.
    pub fn positions(&self, scale_factor: f64) -> Vec<AxisPosition> {
        self.values()
            .into_iter()
            .map(|v| AxisPosition::new(v, scale_factor))
            .collect()
    }
}

// =============================================================================
// FieldVector
// =============================================================================

/// Three field components in the probe's configured unit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldVector {
    /// X component
    pub x: f64,
    /// Y component
    pub y: f64,
    /// Z component
    pub z: f64,
}

impl FieldVector {
    /// Build a vector from its components.
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Components in X, Y, Z order.
    pub fn components(&self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_length_and_values() {
        let range = ScanRange::new(-10.0, 0.0, 0.5).unwrap();
        let values = range.values();
        assert_eq!(values.len(), 21);
        assert_eq!(values[0], -10.0);
        assert_eq!(values[1], -9.5);
        assert_eq!(*values.last().unwrap(), 0.0);
        assert_eq!(range.direction(), 1.0);
    }

    #[test]
    fn test_range_includes_stop_despite_float_truncation() {
        // 0.3 / 0.1 evaluates to 2.9999999999999996
        let range = ScanRange::new(0.0, 0.3, 0.1).unwrap();
        assert_eq!(range.len(), 4);
    }

    #[test]
    fn test_range_partial_last_step_is_dropped() {
        let range = ScanRange::new(0.0, 1.0, 0.3).unwrap();
        assert_eq!(range.len(), 4);
        assert!((range.values()[3] - 0.9).abs() < 1e-12);
    }

    #[test]
    fn test_descending_range_is_monotonic() {
        let range = ScanRange::new(5.0, -5.0, -0.25).unwrap();
        assert_eq!(range.len(), 41);
        assert_eq!(range.direction(), -1.0);
        let values = range.values();
        assert!(values.windows(2).all(|w| w[1] < w[0]));
    }

    #[test]
    fn test_range_lengths_match_formula() {
        for &(start, stop, step) in &[
            (-60.0, 90.0, 0.5),
            (-0.5, 10.0, 0.5),
            (0.0, 40.0, 0.5),
            (3.0, 3.7, 0.07),
            (10.0, -2.0, -1.5),
        ] {
            let range = ScanRange::new(start, stop, step).unwrap();
            let expected = ((stop - start) / step + RANGE_EPSILON).floor() as usize + 1;
            assert_eq!(range.len(), expected, "({start}, {stop}, {step})");
            let values = range.values();
            let dir = range.direction();
            assert!(values.windows(2).all(|w| (w[1] - w[0]) * dir > 0.0));
        }
    }

    #[test]
    fn test_invalid_ranges_rejected() {
        assert!(matches!(
            ScanRange::new(0.0, 1.0, 0.0),
            Err(DaqError::Configuration(_))
        ));
        assert!(matches!(
            ScanRange::new(0.0, 1.0, -0.1),
            Err(DaqError::Configuration(_))
        ));
        assert!(ScanRange::new(0.0, f64::NAN, 0.1).is_err());
    }

    #[test]
    fn test_single_point_range() {
        let range = ScanRange::single(12.579);
        assert_eq!(range.values(), vec![12.579]);
        assert_eq!(range.direction(), 0.0);
        let same = ScanRange::new(2.0, 2.0, 0.5).unwrap();
        assert_eq!(same.len(), 1);
    }

    #[test]
    fn test_steps_round_to_nearest() {
        assert_eq!(AxisPosition::new(-9.5, 1000.0).steps(), -9500);
        assert_eq!(AxisPosition::new(0.00049, 1000.0).steps(), 0);
        assert_eq!(AxisPosition::new(0.0005, 2000.0).steps(), 1);
        // 1.005 * 1000 = 1004.9999999999999 in binary floating point
        assert_eq!(AxisPosition::new(1.005, 1000.0).steps(), 1005);
    }
}
