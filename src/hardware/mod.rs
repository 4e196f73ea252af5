//! Hardware capabilities and the device registry.
//!
//! The scan orchestrators only see three capability traits:
//!
//! - [`MotionAxis`]: a stage axis in engineering units
//! - [`TriggerEncoder`]: an independent position counter with a one-shot
//!   trigger comparator
//! - [`FieldInstrument`]: a triggered, buffered field probe
//!
//! Each trait is async, `Send + Sync` and takes `&self`; implementations keep
//! their mutable state behind `tokio::sync::Mutex`. Concrete drivers live in
//! the submodules and are collected in a [`DeviceRegistry`] that is handed to
//! the line scan engine and the grid sweep controller.

pub mod adlink;
pub mod encoder;
pub mod mclennan;
pub mod metrolab;
pub mod sim;
pub mod transport;

use crate::core::FieldVector;
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Motion
// =============================================================================

/// How a move is issued and whether it is waited for.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MoveOptions {
    /// Interpret the target as an offset from the commanded position
    pub relative: bool,
    /// Poll until the commanded position is within `tolerance`
    pub wait: bool,
    /// Settle tolerance in engineering units
    pub tolerance: f64,
    /// Bound on the wait; `None` uses `distance / max_speed + margin`
    pub timeout: Option<Duration>,
}

impl MoveOptions {
    /// Fire-and-forget absolute move.
    pub fn no_wait() -> Self {
        Self {
            relative: false,
            wait: false,
            tolerance: 0.01,
            timeout: None,
        }
    }

    /// Absolute move that returns once within `tolerance` of the target.
    pub fn wait(tolerance: f64) -> Self {
        Self {
            wait: true,
            tolerance,
            ..Self::no_wait()
        }
    }

    /// Make the move relative.
    pub fn relative(mut self) -> Self {
        self.relative = true;
        self
    }

    /// Override the computed timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl Default for MoveOptions {
    fn default() -> Self {
        Self::no_wait()
    }
}

/// A single motorised axis.
#[async_trait]
pub trait MotionAxis: Send + Sync {
    /// Canonical axis name
    fn name(&self) -> &str;

    /// Device steps per engineering unit
    fn scale_factor(&self) -> f64;

    /// Fastest permitted speed in engineering units per second
    fn max_speed(&self) -> f64;

    /// Engineering unit label ("mm" or "deg")
    fn units(&self) -> &str;

    /// Issue a move, optionally waiting for it to settle.
    async fn move_to(&self, target: f64, options: MoveOptions) -> AppResult<()>;

    /// Set the slew speed; `None` restores `max_speed`.
    async fn set_speed(&self, speed: Option<f64>) -> AppResult<()>;

    /// Read back the slew speed.
    async fn get_speed(&self) -> AppResult<f64>;

    /// Commanded (`set_value = true`) or actual position.
    async fn get_position(&self, set_value: bool) -> AppResult<f64>;

    /// Halt immediately.
    async fn stop(&self) -> AppResult<()>;

    /// Rewrite both position counters.
    async fn reset_position(&self, position: f64) -> AppResult<()>;

    /// Apply soft limits, or lift them with `None`.
    async fn set_limits(&self, limits: Option<(f64, f64)>) -> AppResult<()>;

    /// Current soft limits, `None` when inhibited.
    async fn get_limits(&self) -> AppResult<Option<(f64, f64)>>;
}

// =============================================================================
// Encoder / trigger comparator
// =============================================================================

/// Counter feeding the trigger comparator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i16)]
pub enum ComparingSource {
    /// Command pulse counter
    Command = 0,
    /// Encoder feedback counter
    Feedback = 1,
    /// Position error counter
    Error = 2,
    /// General purpose counter
    General = 3,
}

/// Condition under which the comparator fires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i16)]
pub enum CompareMethod {
    /// Counter equals data, either direction
    EqualDirectionIndependent = 1,
    /// Counter equals data while counting up
    EqualCountUp = 2,
    /// Counter equals data while counting down
    EqualCountDown = 3,
    /// Data greater than counter
    DataGreater = 4,
    /// Data less than counter
    DataLess = 5,
}

/// Interrupt factor bit raised when the trigger comparator condition is met.
pub const TRIGGER_COMPARATOR_FACTOR_BIT: u32 = 12;

/// Interrupt factor mask for [`TRIGGER_COMPARATOR_FACTOR_BIT`].
pub const TRIGGER_COMPARATOR_FACTOR: u32 = 1 << TRIGGER_COMPARATOR_FACTOR_BIT;

/// Position counter with an armable one-shot comparator.
#[async_trait]
pub trait TriggerEncoder: Send + Sync {
    /// Preload the counter (step domain).
    async fn set_position(&self, steps: f64) -> AppResult<()>;

    /// Read the counter (step domain).
    async fn get_position(&self) -> AppResult<f64>;

    /// Arm the comparator; a second call replaces the first.
    async fn set_trigger_comparator(
        &self,
        source: ComparingSource,
        method: CompareMethod,
        target: i64,
    ) -> AppResult<()>;

    /// Block until the interrupt for `factor_bit` fires.
    async fn wait_for_interrupt(&self, factor_bit: u32, timeout_ms: u64) -> AppResult<()>;

    /// Arm an equality match on the feedback counter and wait for it.
    async fn wait_for_position(&self, target: i64, timeout_ms: u64) -> AppResult<()> {
        self.set_trigger_comparator(
            ComparingSource::Feedback,
            CompareMethod::EqualDirectionIndependent,
            target,
        )
        .await?;
        self.wait_for_interrupt(TRIGGER_COMPARATOR_FACTOR_BIT, timeout_ms)
            .await
    }
}

// =============================================================================
// Field instrument
// =============================================================================

/// Where the instrument takes its triggers from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerSource {
    /// Software trigger (`*TRG`)
    Bus,
    /// Internal timer
    Timer,
    /// Free running
    Immediate,
}

impl TriggerSource {
    /// SCPI mnemonic
    pub fn mnemonic(&self) -> &'static str {
        match self {
            TriggerSource::Bus => "BUS",
            TriggerSource::Timer => "TIM",
            TriggerSource::Immediate => "IMM",
        }
    }
}

/// A triggered three-axis field probe with an on-board sample buffer.
#[async_trait]
pub trait FieldInstrument: Send + Sync {
    /// Cancel any pending acquisition.
    async fn abort_trigger(&self) -> AppResult<()>;

    /// Expect `count` triggers from `source` and start acquiring.
    async fn arm_trigger(&self, source: TriggerSource, count: usize) -> AppResult<()>;

    /// Issue one software trigger.
    async fn assert_trigger(&self) -> AppResult<()>;

    /// Retrieve `count` buffered samples in trigger order.
    async fn fetch_buffered(&self, count: usize, digits: u8) -> AppResult<Vec<FieldVector>>;

    /// Unit the samples are reported in
    async fn units(&self) -> AppResult<String>;

    /// Most samples one acquisition can buffer.
    fn buffer_capacity(&self) -> usize {
        usize::MAX
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Device handles for one bench, keyed by lowercase axis name.
///
/// Encoders are registered against the motion axis whose position they track.
#[derive(Default, Clone)]
pub struct DeviceRegistry {
    axes: HashMap<String, Arc<dyn MotionAxis>>,
    aliases: HashMap<String, String>,
    encoders: HashMap<String, Arc<dyn TriggerEncoder>>,
    instrument: Option<Arc<dyn FieldInstrument>>,
}

impl DeviceRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an axis under its own name.
    pub fn add_axis(&mut self, axis: Arc<dyn MotionAxis>) {
        self.axes.insert(axis.name().to_lowercase(), axis);
    }

    /// Let `alias` refer to an already registered axis.
    pub fn add_alias(&mut self, alias: &str, name: &str) -> AppResult<()> {
        let canonical = self.resolve(name)?;
        self.aliases.insert(alias.to_lowercase(), canonical);
        Ok(())
    }

    /// Attach an encoder to an axis.
    pub fn add_encoder(&mut self, axis: &str, encoder: Arc<dyn TriggerEncoder>) -> AppResult<()> {
        let canonical = self.resolve(axis)?;
        self.encoders.insert(canonical, encoder);
        Ok(())
    }

    /// Install the field instrument.
    pub fn set_instrument(&mut self, instrument: Arc<dyn FieldInstrument>) {
        self.instrument = Some(instrument);
    }

    /// Canonical name for a name or alias, case-insensitive.
    pub fn resolve(&self, name: &str) -> AppResult<String> {
        let key = name.to_lowercase();
        if self.axes.contains_key(&key) {
            return Ok(key);
        }
        self.aliases
            .get(&key)
            .cloned()
            .ok_or_else(|| DaqError::Configuration(format!("can't find axis '{}'", name)))
    }

    /// Look up an axis by name or alias.
    pub fn axis(&self, name: &str) -> AppResult<Arc<dyn MotionAxis>> {
        let canonical = self.resolve(name)?;
        self.axes
            .get(&canonical)
            .cloned()
            .ok_or_else(|| DaqError::Configuration(format!("can't find axis '{}'", name)))
    }

    /// Encoder tracking the named axis, if one is registered.
    pub fn encoder_for(&self, name: &str) -> Option<Arc<dyn TriggerEncoder>> {
        let canonical = self.resolve(name).ok()?;
        self.encoders.get(&canonical).cloned()
    }

    /// The field instrument.
    pub fn instrument(&self) -> AppResult<Arc<dyn FieldInstrument>> {
        self.instrument
            .clone()
            .ok_or_else(|| DaqError::Configuration("no field instrument registered".to_string()))
    }

    /// Canonical names of every registered axis, sorted.
    pub fn axis_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.axes.keys().cloned().collect();
        names.sort();
        names
    }
}
