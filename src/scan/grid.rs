//! Grid sweep controller.
//!
//! Repeats line scans of the primary axis over the Cartesian product of the
//! outer axes, first outer axis slowest. A fixed axis is an outer axis with a
//! single position, so it is moved once and then left alone.
//!
//! Retryable line failures are retried from `Idle` with the primary axis
//! stopped in between; every `confirm_every` consecutive failures of one cell
//! the operator decides whether to go on.

use crate::config::Settings;
use crate::core::ScanRange;
use crate::error::{AppResult, DaqError};
use crate::export::SweepSink;
use crate::hardware::{DeviceRegistry, MotionAxis, MoveOptions};
use crate::scan::line_scan::{LineScanEngine, LineScanParams};
use crate::scan::retry::{OperatorPrompt, RetryBudget, RetryPolicy};
use crate::scan::{LineScanResult, ScanMode};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Most outer axes a grid supports.
pub const MAX_OUTER_AXES: usize = 2;

/// Position of one outer axis in a cell.
#[derive(Clone, Debug, PartialEq)]
pub struct CellCoordinate {
    /// Canonical axis name
    pub axis: String,
    /// Axis unit
    pub units: String,
    /// Position in engineering units
    pub value: f64,
}

/// Outer axis positions of one line.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GridCell {
    /// One coordinate per outer axis, in sweep order
    pub coords: Vec<CellCoordinate>,
}

impl fmt::Display for GridCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.coords.is_empty() {
            return f.write_str("single line");
        }
        let parts: Vec<String> = self
            .coords
            .iter()
            .map(|c| format!("{} = {} {}", c.axis, c.value, c.units))
            .collect();
        f.write_str(&parts.join(", "))
    }
}

/// Outcome of a completed sweep.
#[derive(Clone, Debug, PartialEq)]
pub struct SweepSummary {
    /// Lines measured
    pub lines: usize,
    /// Samples measured over all lines
    pub samples: usize,
    /// Failed attempts that were retried
    pub retried_failures: u32,
    /// Wall time of the sweep
    pub elapsed: Duration,
}

struct OuterAxis {
    name: String,
    axis: Arc<dyn MotionAxis>,
    range: ScanRange,
}

/// Runs a complete field map.
pub struct GridSweep {
    registry: DeviceRegistry,
    primary: String,
    range: ScanRange,
    outer: Vec<OuterAxis>,
    mode: ScanMode,
    params: LineScanParams,
    policy: RetryPolicy,
}

impl GridSweep {
    /// Grid over `outer` (sweep order, first slowest) of lines of `primary`.
    pub fn new(
        registry: DeviceRegistry,
        primary: &str,
        range: ScanRange,
        outer: Vec<(String, ScanRange)>,
        mode: ScanMode,
        params: LineScanParams,
        policy: RetryPolicy,
    ) -> AppResult<Self> {
        if outer.len() > MAX_OUTER_AXES {
            return Err(DaqError::Configuration(format!(
                "at most {} outer axes are supported, got {}",
                MAX_OUTER_AXES,
                outer.len()
            )));
        }
        let primary = registry.resolve(primary)?;
        let mut used = vec![primary.clone()];
        let mut axes = Vec::with_capacity(outer.len());
        for (name, range) in outer {
            let name = registry.resolve(&name)?;
            if used.contains(&name) {
                return Err(DaqError::Configuration(format!(
                    "axis '{}' is used twice in the sweep",
                    name
                )));
            }
            used.push(name.clone());
            axes.push(OuterAxis {
                axis: registry.axis(&name)?,
                name,
                range,
            });
        }

        // Resolves the mode and fails early on a missing encoder or probe.
        LineScanEngine::new(&registry, &primary, range, mode, params.clone())?;

        Ok(Self {
            registry,
            primary,
            range,
            outer: axes,
            mode,
            params,
            policy,
        })
    }

    /// Grid described by the `sweep` settings section.
    pub fn from_settings(registry: DeviceRegistry, settings: &Settings) -> AppResult<Self> {
        Self::new(
            registry,
            &settings.sweep.primary.axis,
            settings.sweep.primary.range()?,
            settings.outer_ranges()?,
            settings.sweep.mode,
            LineScanParams::from_settings(settings),
            RetryPolicy::from_settings(&settings.retry),
        )
    }

    /// Outer positions of every cell in sweep order.
    pub fn cells(&self) -> Vec<Vec<f64>> {
        self.outer.iter().fold(vec![Vec::new()], |cells, outer| {
            cells
                .iter()
                .flat_map(|prefix| {
                    outer.range.values().into_iter().map(move |v| {
                        let mut cell = prefix.clone();
                        cell.push(v);
                        cell
                    })
                })
                .collect()
        })
    }

    /// Measure every cell, handing each line to `sink` as soon as it is done.
    ///
    /// The sink is finished even when the sweep fails.
    pub async fn run(
        &self,
        sink: &mut dyn SweepSink,
        prompt: &dyn OperatorPrompt,
    ) -> AppResult<SweepSummary> {
        let result = self.sweep(sink, prompt).await;
        let finished = sink.finish().await;
        let summary = result?;
        finished?;
        Ok(summary)
    }

    async fn sweep(
        &self,
        sink: &mut dyn SweepSink,
        prompt: &dyn OperatorPrompt,
    ) -> AppResult<SweepSummary> {
        let cells = self.cells();
        let total = cells.len();
        let started = Instant::now();
        let mut engine = LineScanEngine::new(
            &self.registry,
            &self.primary,
            self.range,
            self.mode,
            self.params.clone(),
        )?;
        info!(
            primary = %self.primary,
            mode = %engine.mode(),
            lines = total,
            points = self.range.len(),
            "starting sweep"
        );

        let mut last: Vec<Option<f64>> = vec![None; self.outer.len()];
        let mut summary = SweepSummary {
            lines: 0,
            samples: 0,
            retried_failures: 0,
            elapsed: Duration::ZERO,
        };

        for (index, values) in cells.iter().enumerate() {
            let mut coords = Vec::with_capacity(values.len());
            for ((outer, &value), previous) in self.outer.iter().zip(values).zip(last.iter_mut()) {
                if *previous != Some(value) {
                    info!(axis = %outer.name, value, "moving outer axis");
                    outer
                        .axis
                        .move_to(value, MoveOptions::wait(self.params.move_tolerance))
                        .await?;
                    *previous = Some(value);
                }
                coords.push(CellCoordinate {
                    axis: outer.name.clone(),
                    units: outer.axis.units().to_string(),
                    value,
                });
            }
            let cell = GridCell { coords };
            info!(line = index + 1, of = total, "{}", cell);

            let line = self.scan_cell(&mut engine, prompt).await?;
            summary.lines += 1;
            summary.samples += line.len();
            summary.retried_failures += line.attempts - 1;
            sink.write_line(&cell, &line).await?;

            let done = index + 1;
            if done < total {
                let elapsed = started.elapsed();
                let remaining = elapsed.mul_f64((total - done) as f64 / done as f64);
                let eta = chrono::Duration::from_std(remaining)
                    .ok()
                    .map(|d| chrono::Local::now() + d);
                match eta {
                    Some(eta) => info!(
                        done,
                        total,
                        eta = %eta.format("%H:%M:%S"),
                        "progress"
                    ),
                    None => info!(done, total, "progress"),
                }
            }
        }

        summary.elapsed = started.elapsed();
        info!(
            lines = summary.lines,
            samples = summary.samples,
            retried = summary.retried_failures,
            elapsed_s = summary.elapsed.as_secs_f64(),
            "sweep complete"
        );
        Ok(summary)
    }

    async fn scan_cell(
        &self,
        engine: &mut LineScanEngine,
        prompt: &dyn OperatorPrompt,
    ) -> AppResult<LineScanResult> {
        let mut budget = RetryBudget::new(&self.policy);
        loop {
            let err = match engine.run().await {
                Ok(mut line) => {
                    line.attempts = budget.failures() + 1;
                    return Ok(line);
                }
                Err(err) if err.is_retryable() => err,
                Err(err) => return Err(err),
            };

            if let Ok(primary) = self.registry.axis(&self.primary) {
                if let Err(stop_err) = primary.stop().await {
                    warn!(axis = %self.primary, error = %stop_err, "failed to stop primary axis");
                }
            }
            let failures = budget.record_failure();
            warn!(failures, error = %err, "line scan failed, retrying");

            if budget.needs_confirmation() && !prompt.confirm_retry(failures, &err).await {
                warn!(failures, "retry declined, aborting sweep");
                return Err(err);
            }
            if !self.policy.backoff_delay.is_zero() {
                tokio::time::sleep(self.policy.backoff_delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::SweepSink;
    use async_trait::async_trait;
    use tracing_test::traced_test;

    struct AlwaysRetry;

    #[async_trait]
    impl OperatorPrompt for AlwaysRetry {
        async fn confirm_retry(&self, _failures: u32, _error: &DaqError) -> bool {
            true
        }
    }

    #[derive(Default)]
    struct CountingSink {
        lines: usize,
    }

    #[async_trait]
    impl SweepSink for CountingSink {
        async fn write_line(&mut self, _cell: &GridCell, _line: &LineScanResult) -> AppResult<()> {
            self.lines += 1;
            Ok(())
        }

        async fn finish(&mut self) -> AppResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_cells_first_outer_axis_slowest() {
        let mut settings = Settings::default();
        settings.simulation.time_scale = 50.0;
        let rig = crate::hardware::sim::SimRig::build(&settings).await.unwrap();
        let grid = GridSweep::new(
            rig.registry,
            "z",
            ScanRange::new(-1.0, 0.0, 0.5).unwrap(),
            vec![
                ("x".to_string(), ScanRange::new(0.0, 1.0, 1.0).unwrap()),
                ("y".to_string(), ScanRange::new(-1.0, 1.0, 1.0).unwrap()),
            ],
            ScanMode::Auto,
            LineScanParams::default(),
            RetryPolicy::default(),
        )
        .unwrap();
        assert_eq!(
            grid.cells(),
            vec![
                vec![0.0, -1.0],
                vec![0.0, 0.0],
                vec![0.0, 1.0],
                vec![1.0, -1.0],
                vec![1.0, 0.0],
                vec![1.0, 1.0],
            ]
        );
    }

    #[tokio::test]
    async fn test_rejects_reused_and_excess_axes() {
        let rig = crate::hardware::sim::SimRig::build(&Settings::default())
            .await
            .unwrap();
        let range = ScanRange::new(-1.0, 0.0, 0.5).unwrap();
        let single = ScanRange::single(0.0);

        let reused = GridSweep::new(
            rig.registry.clone(),
            "z",
            range,
            vec![("hp z".to_string(), single)],
            ScanMode::Auto,
            LineScanParams::default(),
            RetryPolicy::default(),
        );
        assert!(matches!(reused, Err(DaqError::Configuration(_))));

        let too_many = GridSweep::new(
            rig.registry,
            "z",
            range,
            vec![
                ("x".to_string(), single),
                ("y".to_string(), single),
                ("x".to_string(), single),
            ],
            ScanMode::Auto,
            LineScanParams::default(),
            RetryPolicy::default(),
        );
        assert!(matches!(too_many, Err(DaqError::Configuration(_))));
    }

    #[test]
    fn test_cell_display() {
        let cell = GridCell {
            coords: vec![CellCoordinate {
                axis: "hp x".to_string(),
                units: "mm".to_string(),
                value: -0.5,
            }],
        };
        assert_eq!(cell.to_string(), "hp x = -0.5 mm");
        assert_eq!(GridCell::default().to_string(), "single line");
    }

    #[tokio::test]
    #[traced_test]
    async fn test_failed_lines_are_logged_and_retried() {
        let mut settings = Settings::default();
        settings.simulation.time_scale = 10.0;
        settings.simulation.noise_t = 0.0;
        settings.timing.poll_interval_ms = 2;
        let rig = crate::hardware::sim::SimRig::build(&settings).await.unwrap();
        rig.encoder.fail_next_waits(1);
        let grid = GridSweep::new(
            rig.registry,
            "z",
            ScanRange::new(-1.0, 0.0, 0.5).unwrap(),
            Vec::new(),
            ScanMode::OnTheFly,
            LineScanParams::from_settings(&settings),
            RetryPolicy::default(),
        )
        .unwrap();

        let mut sink = CountingSink::default();
        let summary = grid.run(&mut sink, &AlwaysRetry).await.unwrap();
        assert_eq!(summary.retried_failures, 1);
        assert_eq!(sink.lines, 1);
        assert!(logs_contain("line scan failed, retrying"));
        assert!(logs_contain("sweep complete"));
    }
}
