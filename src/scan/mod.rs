//! Scan orchestration.
//!
//! A [`line_scan::LineScanEngine`] runs one synchronized sweep of the primary
//! axis: the probe takes a BUS-triggered sample at every target, either while
//! the stage moves continuously (on-the-fly, gated by the encoder comparator)
//! or with the stage stopped at each target (point-by-point).
//!
//! A [`grid::GridSweep`] repeats line scans over the Cartesian product of one
//! or two outer axes and is the only place failures are retried.

pub mod grid;
pub mod line_scan;
pub mod retry;

use crate::core::{AxisPosition, FieldVector};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use grid::{CellCoordinate, GridCell, GridSweep, SweepSummary};
pub use line_scan::{LineScanEngine, LineScanParams};
pub use retry::{OperatorPrompt, RetryBudget, RetryPolicy, StdinPrompt};

/// How samples are taken along the primary axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    /// On-the-fly when the primary axis has an encoder, otherwise point-by-point
    #[default]
    Auto,
    /// Continuous motion, encoder-gated triggers
    OnTheFly,
    /// Move, settle, trigger
    PointByPoint,
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScanMode::Auto => "auto",
            ScanMode::OnTheFly => "on-the-fly",
            ScanMode::PointByPoint => "point-by-point",
        })
    }
}

/// Line scan state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanStatus {
    /// Not started
    Idle,
    /// Moving to the first target at full speed
    Homing,
    /// Probe armed, first sample taken at rest
    Armed,
    /// Sampling the remaining targets
    InProgress,
    /// Stage passed a target before its trigger was armed
    MissedTrigger,
    /// Reading the probe buffer
    Fetching,
    /// Samples aligned with positions
    Complete,
}

/// Progress of the line scan in flight.
#[derive(Clone, Debug)]
pub struct ScanSession {
    /// Targets in sampling order
    pub positions: Vec<AxisPosition>,
    /// Samples fetched from the probe, empty until `Fetching` completes
    pub field_samples: Vec<FieldVector>,
    /// Resolved sampling mode
    pub mode: ScanMode,
    /// Current state
    pub status: ScanStatus,
    /// Software triggers issued since the probe was armed
    pub triggers_asserted: usize,
}

impl ScanSession {
    /// Fresh session in `Idle`.
    pub fn new(positions: Vec<AxisPosition>, mode: ScanMode) -> Self {
        Self {
            positions,
            field_samples: Vec::new(),
            mode,
            status: ScanStatus::Idle,
            triggers_asserted: 0,
        }
    }
}

/// Result of one completed line scan.
#[derive(Clone, Debug, PartialEq)]
pub struct LineScanResult {
    /// Canonical name of the primary axis
    pub axis: String,
    /// Unit of the primary axis
    pub units: String,
    /// Unit of the field samples
    pub field_units: String,
    /// Sampling targets
    pub positions: Vec<AxisPosition>,
    /// One sample per target, in the same order
    pub fields: Vec<FieldVector>,
    /// Mode the line was actually taken in
    pub mode: ScanMode,
    /// Attempts needed, including the successful one
    pub attempts: u32,
}

impl LineScanResult {
    /// `(position, field)` pairs.
    pub fn samples(&self) -> impl Iterator<Item = (&AxisPosition, &FieldVector)> {
        self.positions.iter().zip(self.fields.iter())
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Whether the line holds no samples.
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}
