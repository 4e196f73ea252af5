//! Configuration system using Figment
//!
//! Settings are assembled from three layers, lowest precedence first:
//! 1. Built-in defaults describing the Hall-probe bench (three McLennan axes,
//!    one encoder channel on Z, a THM1176 probe)
//! 2. A TOML file (`config/default.toml` unless `--config` says otherwise)
//! 3. Environment variables prefixed with `FIELDMAP_`, using `__` to nest
//!
//! ```text
//! FIELDMAP_APPLICATION__LOG_LEVEL=debug
//! FIELDMAP_SWEEP__MODE=point_by_point
//! FIELDMAP_PROBE__AVERAGES=50
//! ```
//!
//! Maps merge key by key, so a file that only overrides `axes."hp z".max_speed`
//! keeps every other axis parameter from the defaults. Arrays are replaced.

use crate::core::ScanRange;
use crate::error::{AppResult, DaqError};
use crate::hardware::mclennan::ProtocolVariant;
use crate::hardware::metrolab::MAX_FETCH;
use crate::scan::ScanMode;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default settings file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Top-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Application-level settings
    pub application: ApplicationSettings,
    /// Poll intervals, tolerances and timeouts
    pub timing: TimingSettings,
    /// Grid sweep retry policy
    pub retry: RetrySettings,
    /// Motion controller serial link
    pub controller: ControllerSettings,
    /// Motion axes keyed by canonical (lowercase) name
    pub axes: BTreeMap<String, AxisSettings>,
    /// Encoder card channels
    pub encoder: EncoderSettings,
    /// Hall probe
    pub probe: ProbeSettings,
    /// What to scan
    pub sweep: SweepSettings,
    /// Free-form run description written to the export header
    pub metadata: MetadataSettings,
    /// Simulated rig parameters, used with `--simulate`
    pub simulation: SimulationSettings,
}

/// Application-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationSettings {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

/// Poll intervals, tolerances and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingSettings {
    /// Position poll interval while waiting for a move to settle
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Added to `distance / max_speed` to form the default move timeout
    #[serde(default = "default_move_timeout_margin")]
    pub move_timeout_margin_s: f64,
    /// Shortest time the probe needs between two triggers
    #[serde(default = "default_min_trigger_interval")]
    pub min_trigger_interval_s: f64,
    /// Distance past `stop` that an on-the-fly move is sent to
    #[serde(default = "default_overshoot")]
    pub overshoot: f64,
    /// Tolerance when moving to the start of a line
    #[serde(default = "default_home_tolerance")]
    pub home_tolerance: f64,
    /// Tolerance for point-by-point and outer axis moves
    #[serde(default = "default_move_tolerance")]
    pub move_tolerance: f64,
}

/// Grid sweep retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Consult the operator after every this many consecutive failures
    #[serde(default = "default_confirm_every")]
    pub confirm_every: u32,
    /// Pause before re-running a failed line
    #[serde(default)]
    pub backoff_ms: u64,
}

/// Serial parameters of the McLennan controller chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerSettings {
    /// Serial port (e.g., "/dev/ttyUSB0", "COM1")
    pub port: String,
    /// Baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// 7 or 8
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    /// "none", "even" or "odd"
    #[serde(default = "default_parity")]
    pub parity: String,
    /// Upper bound on one command/reply exchange
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
    /// Pause before collecting a reply
    #[serde(default = "default_reply_wait")]
    pub reply_wait_ms: u64,
    /// Pause before collecting the reply to slow commands (query all)
    #[serde(default = "default_long_reply_wait")]
    pub long_reply_wait_ms: u64,
}

/// Linear stages report millimetres, rotation stages degrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AxisKind {
    /// Millimetres
    #[default]
    Linear,
    /// Degrees
    Rotation,
}

impl AxisKind {
    /// Engineering unit label
    pub fn units(&self) -> &'static str {
        match self {
            AxisKind::Linear => "mm",
            AxisKind::Rotation => "deg",
        }
    }
}

/// One controller axis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AxisSettings {
    /// Address on the controller daisy chain
    pub id: u8,
    /// Steps per engineering unit
    pub scale_factor: f64,
    /// Engineering units per second
    pub max_speed: f64,
    /// Engineering units per second squared
    #[serde(default)]
    pub acceleration: f64,
    /// Linear or rotation stage
    #[serde(default)]
    pub kind: AxisKind,
    /// Controller revision
    #[serde(default)]
    pub variant: ProtocolVariant,
    /// Alternative names this axis answers to
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// Encoder card wiring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderSettings {
    /// Vendor driver library loaded by the bench binary
    #[serde(default = "default_encoder_library")]
    pub library: PathBuf,
    /// Card numbering passed to `_8102_initial`: 0 by PCI slot, 1 by DIP switch
    #[serde(default)]
    pub manual_id: i16,
    /// Card number passed to interrupt control
    #[serde(default)]
    pub card_id: i16,
    /// Motion axis name -> encoder axis number on the card
    #[serde(default)]
    pub channels: BTreeMap<String, i16>,
    /// Bound on one comparator interrupt wait
    #[serde(default = "default_encoder_timeout")]
    pub wait_timeout_ms: u64,
}

/// Hall probe connection and acquisition settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeSettings {
    /// VISA resource string
    pub resource: String,
    /// I/O timeout
    #[serde(default = "default_probe_timeout")]
    pub timeout_ms: u64,
    /// Field unit (T, MT, UT, NT, GAUSS, KGAUSS, MGAUSS, MA/M)
    #[serde(default = "default_units")]
    pub units: String,
    /// Readings averaged per sample
    #[serde(default = "default_averages")]
    pub averages: u32,
    /// Let the probe choose its own range
    #[serde(default)]
    pub auto_range: bool,
    /// Requested range in tesla when `auto_range` is off
    #[serde(default = "default_range")]
    pub range: f64,
    /// Significant digits requested per sample (1-5)
    #[serde(default = "default_digits")]
    pub digits: u8,
}

/// `start..=stop` by `step` along a named axis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AxisRangeSettings {
    /// Axis name or alias
    pub axis: String,
    /// First target
    pub start: f64,
    /// Last target (inclusive)
    pub stop: f64,
    /// Signed spacing
    pub step: f64,
}

impl AxisRangeSettings {
    /// Validate into a [`ScanRange`].
    pub fn range(&self) -> AppResult<ScanRange> {
        ScanRange::new(self.start, self.stop, self.step).map_err(|e| {
            DaqError::Configuration(format!("axis '{}': {}", self.axis, e))
        })
    }
}

/// An axis parked at one position for the whole sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixedAxisSettings {
    /// Axis name or alias
    pub axis: String,
    /// Parking position
    pub position: f64,
}

/// The grid to map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepSettings {
    /// Axis scanned by the line scan engine
    pub primary: AxisRangeSettings,
    /// Stepped axes, slowest first
    #[serde(default)]
    pub outer: Vec<AxisRangeSettings>,
    /// Parked axes
    #[serde(default)]
    pub fixed: Vec<FixedAxisSettings>,
    /// Line scan mode
    #[serde(default)]
    pub mode: ScanMode,
    /// CSV destination when `--output` is not given
    #[serde(default = "default_output")]
    pub output: PathBuf,
}

/// Run description written to the export header.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MetadataSettings {
    /// Magnet under test
    #[serde(default)]
    pub magnet: String,
    /// Magnet current in amperes
    #[serde(default)]
    pub current_a: f64,
    /// Free text
    #[serde(default)]
    pub comment: String,
}

/// Simulated rig parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationSettings {
    /// Simulated seconds per wall-clock second
    #[serde(default = "default_time_scale")]
    pub time_scale: f64,
    /// Standard deviation of added probe noise, in tesla
    #[serde(default = "default_noise")]
    pub noise_t: f64,
    /// Peak on-axis field of the simulated solenoid, in tesla
    #[serde(default = "default_peak_field")]
    pub peak_field_t: f64,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_poll_interval() -> u64 {
    100
}

fn default_move_timeout_margin() -> f64 {
    10.0
}

fn default_min_trigger_interval() -> f64 {
    0.2
}

fn default_overshoot() -> f64 {
    0.1
}

fn default_home_tolerance() -> f64 {
    0.001
}

fn default_move_tolerance() -> f64 {
    0.01
}

fn default_confirm_every() -> u32 {
    5
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    7
}

fn default_parity() -> String {
    "even".to_string()
}

fn default_read_timeout() -> u64 {
    5000
}

fn default_reply_wait() -> u64 {
    200
}

fn default_long_reply_wait() -> u64 {
    2000
}

fn default_encoder_library() -> PathBuf {
    PathBuf::from(r"C:\Program Files\ADLINK\PCI-8102\Library\8102.dll")
}

fn default_encoder_timeout() -> u64 {
    10_000
}

fn default_probe_timeout() -> u64 {
    10_000
}

fn default_units() -> String {
    "MT".to_string()
}

fn default_averages() -> u32 {
    100
}

fn default_range() -> f64 {
    0.1
}

fn default_digits() -> u8 {
    5
}

fn default_output() -> PathBuf {
    PathBuf::from("field_map.csv")
}

fn default_time_scale() -> f64 {
    1.0
}

fn default_noise() -> f64 {
    2e-6
}

fn default_peak_field() -> f64 {
    0.05
}

fn axis(id: u8, scale_factor: f64, max_speed: f64, acceleration: f64, variant: ProtocolVariant, alias: &str) -> AxisSettings {
    AxisSettings {
        id,
        scale_factor,
        max_speed,
        acceleration,
        kind: AxisKind::Linear,
        variant,
        aliases: vec![alias.to_string()],
    }
}

impl Default for Settings {
    fn default() -> Self {
        let mut axes = BTreeMap::new();
        axes.insert("hp x".to_string(), axis(2, 2000.0, 2.0, 0.5, ProtocolVariant::Pm341, "x"));
        axes.insert("hp y".to_string(), axis(1, 2000.0, 6.0, 0.75, ProtocolVariant::Pm341, "y"));
        axes.insert("hp z".to_string(), axis(3, 1000.0, 30.0, 10.0, ProtocolVariant::Pm304, "z"));

        let mut channels = BTreeMap::new();
        channels.insert("hp z".to_string(), 0);

        Self {
            application: ApplicationSettings {
                name: "field_map".to_string(),
                log_level: "info".to_string(),
            },
            timing: TimingSettings {
                poll_interval_ms: default_poll_interval(),
                move_timeout_margin_s: default_move_timeout_margin(),
                min_trigger_interval_s: default_min_trigger_interval(),
                overshoot: default_overshoot(),
                home_tolerance: default_home_tolerance(),
                move_tolerance: default_move_tolerance(),
            },
            retry: RetrySettings {
                confirm_every: default_confirm_every(),
                backoff_ms: 0,
            },
            controller: ControllerSettings {
                port: "/dev/ttyUSB0".to_string(),
                baud_rate: default_baud_rate(),
                data_bits: default_data_bits(),
                parity: default_parity(),
                read_timeout_ms: default_read_timeout(),
                reply_wait_ms: default_reply_wait(),
                long_reply_wait_ms: default_long_reply_wait(),
            },
            axes,
            encoder: EncoderSettings {
                library: default_encoder_library(),
                manual_id: 0,
                card_id: 0,
                channels,
                wait_timeout_ms: default_encoder_timeout(),
            },
            probe: ProbeSettings {
                resource: "USB0::0x1BFA::0x0498::0000155::INSTR".to_string(),
                timeout_ms: default_probe_timeout(),
                units: default_units(),
                averages: default_averages(),
                auto_range: false,
                range: default_range(),
                digits: default_digits(),
            },
            sweep: SweepSettings {
                primary: AxisRangeSettings {
                    axis: "z".to_string(),
                    start: -10.0,
                    stop: 0.0,
                    step: 0.5,
                },
                outer: vec![AxisRangeSettings {
                    axis: "x".to_string(),
                    start: -0.5,
                    stop: 0.5,
                    step: 0.5,
                }],
                fixed: vec![FixedAxisSettings {
                    axis: "y".to_string(),
                    position: 0.0,
                }],
                mode: ScanMode::Auto,
                output: default_output(),
            },
            metadata: MetadataSettings::default(),
            simulation: SimulationSettings {
                time_scale: default_time_scale(),
                noise_t: default_noise(),
                peak_field_t: default_peak_field(),
            },
        }
    }
}

// ============================================================================
// Loading and validation
// ============================================================================

impl Settings {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file and the environment, then validate.
    ///
    /// A missing file is not an error; the defaults and environment apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Self = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("FIELDMAP_").split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Check the settings for semantic errors.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        self.validate_axes()?;

        let timing = &self.timing;
        for (name, value) in [
            ("timing.move_timeout_margin_s", timing.move_timeout_margin_s),
            ("timing.min_trigger_interval_s", timing.min_trigger_interval_s),
            ("timing.home_tolerance", timing.home_tolerance),
            ("timing.move_tolerance", timing.move_tolerance),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(DaqError::Configuration(format!(
                    "{} must be positive, got {}",
                    name, value
                )));
            }
        }
        if !(timing.overshoot.is_finite() && timing.overshoot >= 0.0) {
            return Err(DaqError::Configuration(format!(
                "timing.overshoot must not be negative, got {}",
                timing.overshoot
            )));
        }
        if timing.poll_interval_ms == 0 {
            return Err(DaqError::Configuration(
                "timing.poll_interval_ms must be > 0".to_string(),
            ));
        }

        if self.retry.confirm_every == 0 {
            return Err(DaqError::Configuration(
                "retry.confirm_every must be > 0".to_string(),
            ));
        }

        if self.probe.averages == 0 {
            return Err(DaqError::Configuration(
                "probe.averages must be > 0".to_string(),
            ));
        }
        if !(1..=5).contains(&self.probe.digits) {
            return Err(DaqError::Configuration(format!(
                "probe.digits must be 1-5, got {}",
                self.probe.digits
            )));
        }
        if !self.probe.auto_range && !(self.probe.range > 0.0) {
            return Err(DaqError::Configuration(format!(
                "probe.range must be positive, got {}",
                self.probe.range
            )));
        }

        for name in self.encoder.channels.keys() {
            self.resolve_axis(name)?;
        }

        if !(self.simulation.time_scale.is_finite() && self.simulation.time_scale > 0.0) {
            return Err(DaqError::Configuration(
                "simulation.time_scale must be positive".to_string(),
            ));
        }

        self.validate_sweep()
    }

    fn validate_axes(&self) -> AppResult<()> {
        if self.axes.is_empty() {
            return Err(DaqError::Configuration("no axes configured".to_string()));
        }

        let mut names = HashSet::new();
        let mut ids = HashSet::new();
        for (name, axis) in &self.axes {
            if name.to_lowercase() != *name {
                return Err(DaqError::Configuration(format!(
                    "axis name '{}' must be lowercase",
                    name
                )));
            }
            if !ids.insert(axis.id) {
                return Err(DaqError::Configuration(format!(
                    "Duplicate controller id {} (axis '{}')",
                    axis.id, name
                )));
            }
            if !(axis.scale_factor.is_finite() && axis.scale_factor > 0.0) {
                return Err(DaqError::Configuration(format!(
                    "axis '{}': scale_factor must be positive",
                    name
                )));
            }
            if !(axis.max_speed.is_finite() && axis.max_speed > 0.0) {
                return Err(DaqError::Configuration(format!(
                    "axis '{}': max_speed must be positive",
                    name
                )));
            }
            for label in std::iter::once(name).chain(axis.aliases.iter()) {
                if !names.insert(label.to_lowercase()) {
                    return Err(DaqError::Configuration(format!(
                        "Duplicate axis name or alias '{}'",
                        label
                    )));
                }
            }
        }
        Ok(())
    }

    fn validate_sweep(&self) -> AppResult<()> {
        let sweep = &self.sweep;
        let primary = self.resolve_axis(&sweep.primary.axis)?;
        let points = sweep.primary.range()?.len();
        if points > MAX_FETCH {
            return Err(DaqError::Configuration(format!(
                "primary line has {} positions, the probe buffers at most {}",
                points, MAX_FETCH
            )));
        }

        let outer_count = sweep.outer.len() + sweep.fixed.len();
        if outer_count > 2 {
            return Err(DaqError::Configuration(format!(
                "a sweep has at most two outer axes, got {}",
                outer_count
            )));
        }

        let mut used = HashSet::new();
        used.insert(primary);
        for outer in &sweep.outer {
            outer.range()?;
            let name = self.resolve_axis(&outer.axis)?;
            if !used.insert(name) {
                return Err(DaqError::Configuration(format!(
                    "axis '{}' is used twice in the sweep",
                    outer.axis
                )));
            }
        }
        for fixed in &sweep.fixed {
            if !fixed.position.is_finite() {
                return Err(DaqError::Configuration(format!(
                    "fixed position of '{}' must be finite",
                    fixed.axis
                )));
            }
            let name = self.resolve_axis(&fixed.axis)?;
            if !used.insert(name) {
                return Err(DaqError::Configuration(format!(
                    "axis '{}' is used twice in the sweep",
                    fixed.axis
                )));
            }
        }

        if sweep.mode == ScanMode::OnTheFly && self.encoder_channel(primary).is_none() {
            return Err(DaqError::Configuration(format!(
                "on-the-fly mode needs an encoder channel for axis '{}'",
                primary
            )));
        }
        Ok(())
    }

    /// Canonical name of an axis given its name or one of its aliases.
    pub fn resolve_axis(&self, name: &str) -> AppResult<&str> {
        let wanted = name.to_lowercase();
        self.axes
            .iter()
            .find(|(key, axis)| {
                **key == wanted || axis.aliases.iter().any(|a| a.to_lowercase() == wanted)
            })
            .map(|(key, _)| key.as_str())
            .ok_or_else(|| DaqError::Configuration(format!("can't find axis '{}'", name)))
    }

    /// Encoder axis number wired to a canonical axis, if any.
    pub fn encoder_channel(&self, canonical: &str) -> Option<i16> {
        self.encoder.channels.iter().find_map(|(name, channel)| {
            match self.resolve_axis(name) {
                Ok(resolved) if resolved == canonical => Some(*channel),
                _ => None,
            }
        })
    }

    /// Outer axes in sweep order, fixed axes last as one-point ranges.
    pub fn outer_ranges(&self) -> AppResult<Vec<(String, ScanRange)>> {
        let mut ranges = Vec::with_capacity(self.sweep.outer.len() + self.sweep.fixed.len());
        for outer in &self.sweep.outer {
            ranges.push((self.resolve_axis(&outer.axis)?.to_string(), outer.range()?));
        }
        for fixed in &self.sweep.fixed {
            ranges.push((
                self.resolve_axis(&fixed.axis)?.to_string(),
                ScanRange::single(fixed.position),
            ));
        }
        Ok(ranges)
    }

    /// Position poll interval as a duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.timing.poll_interval_ms)
    }

    /// Margin added to computed move timeouts.
    pub fn move_timeout_margin(&self) -> Duration {
        Duration::from_secs_f64(self.timing.move_timeout_margin_s)
    }
}
