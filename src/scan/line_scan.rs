//! One synchronized sweep of the primary axis.
//!
//! ```text
//! Idle -> Homing -> Armed -> InProgress -> Fetching -> Complete
//!                                 |
//!                                 +-> MissedTrigger (error)
//! ```
//!
//! The first sample is always taken at rest on the start position. In
//! on-the-fly mode the stage is then sent past the last target in a single
//! move and each following sample is gated by the encoder comparator; in
//! point-by-point mode the stage stops on every target.

use crate::config::Settings;
use crate::core::{AxisPosition, ScanRange};
use crate::error::{AppResult, DaqError};
use crate::hardware::{
    DeviceRegistry, FieldInstrument, MotionAxis, MoveOptions, TriggerEncoder, TriggerSource,
};
use crate::scan::{LineScanResult, ScanMode, ScanSession, ScanStatus};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Timing and tolerance parameters of a line scan.
#[derive(Clone, Debug, PartialEq)]
pub struct LineScanParams {
    /// Shortest time the probe needs between two triggers
    pub min_trigger_interval: Duration,
    /// Distance driven past the last target so it is crossed at speed
    pub overshoot: f64,
    /// Settle tolerance when homing to the start position
    pub home_tolerance: f64,
    /// Settle tolerance for point-by-point moves
    pub move_tolerance: f64,
    /// Bound on each encoder comparator wait
    pub encoder_timeout_ms: u64,
    /// Significant digits requested when fetching samples
    pub digits: u8,
}

impl LineScanParams {
    /// Collect the line scan parameters from the settings.
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            min_trigger_interval: Duration::from_secs_f64(settings.timing.min_trigger_interval_s),
            overshoot: settings.timing.overshoot,
            home_tolerance: settings.timing.home_tolerance,
            move_tolerance: settings.timing.move_tolerance,
            encoder_timeout_ms: settings.encoder.wait_timeout_ms,
            digits: settings.probe.digits,
        }
    }
}

impl Default for LineScanParams {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// Runs line scans of one axis over one range.
pub struct LineScanEngine {
    axis: Arc<dyn MotionAxis>,
    axis_name: String,
    encoder: Option<Arc<dyn TriggerEncoder>>,
    instrument: Arc<dyn FieldInstrument>,
    range: ScanRange,
    mode: ScanMode,
    params: LineScanParams,
    session: ScanSession,
}

impl LineScanEngine {
    /// Bind the engine to the devices in the registry and resolve the mode.
    ///
    /// `Auto` picks on-the-fly when an encoder tracks the axis. Forcing
    /// on-the-fly without an encoder, or a line longer than the instrument can
    /// buffer, is a configuration error.
    pub fn new(
        registry: &DeviceRegistry,
        axis: &str,
        range: ScanRange,
        mode: ScanMode,
        params: LineScanParams,
    ) -> AppResult<Self> {
        let axis_name = registry.resolve(axis)?;
        let motion = registry.axis(&axis_name)?;
        let instrument = registry.instrument()?;
        let encoder = registry.encoder_for(&axis_name);

        let (mode, encoder) = match (mode, encoder) {
            (ScanMode::PointByPoint, _) => (ScanMode::PointByPoint, None),
            (ScanMode::Auto, None) => (ScanMode::PointByPoint, None),
            (ScanMode::Auto, Some(e)) | (ScanMode::OnTheFly, Some(e)) => (ScanMode::OnTheFly, Some(e)),
            (ScanMode::OnTheFly, None) => {
                return Err(DaqError::Configuration(format!(
                    "on-the-fly scan of '{}' needs an encoder",
                    axis_name
                )))
            }
        };

        let positions = range.positions(motion.scale_factor());
        let capacity = instrument.buffer_capacity();
        if positions.len() > capacity {
            return Err(DaqError::Configuration(format!(
                "line of {} positions exceeds the probe buffer of {} samples",
                positions.len(),
                capacity
            )));
        }
        Ok(Self {
            axis: motion,
            axis_name,
            encoder,
            instrument,
            range,
            mode,
            params,
            session: ScanSession::new(positions, mode),
        })
    }

    /// Mode the engine will scan in.
    pub fn mode(&self) -> ScanMode {
        self.mode
    }

    /// State of the most recent run.
    pub fn session(&self) -> &ScanSession {
        &self.session
    }

    /// Stage speed while sampling on the fly: one step per trigger interval,
    /// capped at the axis maximum.
    pub fn scan_speed(&self) -> f64 {
        let interval = self.params.min_trigger_interval.as_secs_f64();
        (self.range.step().abs() / interval).min(self.axis.max_speed())
    }

    /// Run one line scan from `Idle`.
    ///
    /// On failure the axis is stopped before the error is returned; a failing
    /// stop is only logged.
    pub async fn run(&mut self) -> AppResult<LineScanResult> {
        let positions = self.range.positions(self.axis.scale_factor());
        self.session = ScanSession::new(positions, self.mode);

        match self.execute().await {
            Ok(result) => Ok(result),
            Err(err) => {
                warn!(axis = %self.axis_name, status = ?self.session.status, error = %err, "line scan failed");
                if let Err(stop_err) = self.axis.stop().await {
                    warn!(axis = %self.axis_name, error = %stop_err, "failed to stop axis");
                }
                Err(err)
            }
        }
    }

    fn transition(&mut self, status: ScanStatus) {
        info!(axis = %self.axis_name, from = ?self.session.status, to = ?status, "line scan");
        self.session.status = status;
    }

    async fn trigger(&mut self) -> AppResult<()> {
        self.instrument.assert_trigger().await?;
        self.session.triggers_asserted += 1;
        debug!(
            axis = %self.axis_name,
            trigger = self.session.triggers_asserted,
            of = self.session.positions.len(),
            "trigger"
        );
        Ok(())
    }

    async fn execute(&mut self) -> AppResult<LineScanResult> {
        let count = self.session.positions.len();

        self.transition(ScanStatus::Homing);
        self.axis.set_speed(None).await?;
        self.axis
            .move_to(self.range.start(), MoveOptions::wait(self.params.home_tolerance))
            .await?;

        self.instrument.abort_trigger().await?;
        self.instrument.arm_trigger(TriggerSource::Bus, count).await?;
        self.transition(ScanStatus::Armed);
        self.trigger().await?;

        self.transition(ScanStatus::InProgress);
        if count > 1 {
            match self.encoder.clone() {
                Some(encoder) => self.sweep_on_the_fly(encoder.as_ref()).await?,
                None => self.step_through().await?,
            }
        }

        self.transition(ScanStatus::Fetching);
        let fields = self
            .instrument
            .fetch_buffered(count, self.params.digits)
            .await?;
        if fields.len() != count {
            return Err(DaqError::protocol(
                "field instrument",
                format!("fetched {} samples for {} triggers", fields.len(), count),
            ));
        }
        self.session.field_samples = fields.clone();
        self.transition(ScanStatus::Complete);

        Ok(LineScanResult {
            axis: self.axis_name.clone(),
            units: self.axis.units().to_string(),
            field_units: self.instrument.units().await?,
            positions: self.session.positions.clone(),
            fields,
            mode: self.mode,
            attempts: 1,
        })
    }

    async fn sweep_on_the_fly(&mut self, encoder: &dyn TriggerEncoder) -> AppResult<()> {
        let scale = self.axis.scale_factor();
        let actual = self.axis.get_position(false).await?;
        encoder
            .set_position(AxisPosition::new(actual, scale).steps() as f64)
            .await?;

        let speed = self.scan_speed();
        self.axis.set_speed(Some(speed)).await?;
        let direction = self.range.direction();
        let end = self.range.stop() + direction * self.params.overshoot;
        info!(axis = %self.axis_name, speed, end, "sweeping");
        self.axis.move_to(end, MoveOptions::no_wait()).await?;

        let targets: Vec<i64> = self
            .session
            .positions
            .iter()
            .skip(1)
            .map(AxisPosition::steps)
            .collect();
        for target in targets {
            let current = encoder.get_position().await?;
            if (target as f64 - current) * direction < 0.0 {
                self.transition(ScanStatus::MissedTrigger);
                return Err(DaqError::MissedTrigger { target, current });
            }
            encoder
                .wait_for_position(target, self.params.encoder_timeout_ms)
                .await?;
            self.trigger().await?;
        }

        self.axis.set_speed(None).await
    }

    async fn step_through(&mut self) -> AppResult<()> {
        let targets: Vec<f64> = self
            .session
            .positions
            .iter()
            .skip(1)
            .map(|p| p.value)
            .collect();
        for target in targets {
            self.axis
                .move_to(target, MoveOptions::wait(self.params.move_tolerance))
                .await?;
            self.trigger().await?;
        }
        Ok(())
    }
}
