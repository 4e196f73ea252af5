//! ADLINK PCI-8102 encoder card.
//!
//! The card is driven through a C-style function table in which every call
//! returns an `i16` status code. [`EncoderDriver`] mirrors that table so the
//! native library and the simulated card are interchangeable; [`EncoderAxis`]
//! turns status codes into [`DaqError`]s and exposes the card as a
//! [`TriggerEncoder`].
//!
//! The comparator interrupt wait blocks the calling thread, so it runs on the
//! blocking pool.

use crate::config::Settings;
use crate::error::{AppResult, DaqError};
use crate::hardware::{
    CompareMethod, ComparingSource, DeviceRegistry, TriggerEncoder, TRIGGER_COMPARATOR_FACTOR,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Status returned when a comparator interrupt wait expires.
pub const AXIS_INT_WAIT_FAILED: i16 = -10220;

/// Description of a card status code.
pub fn describe_code(code: i16) -> &'static str {
    match code {
        0 => "success",
        -10000 => "Card number",
        -10001 => "operation system version",
        -10002 => "card's ID conflict",
        -10200 => "other process exist",
        -10201 => "card not found",
        -10202 => "Open driver failed",
        -10203 => "ID mapping failed",
        -10204 => "trigger channel",
        -10205 => "trigger type",
        -10206 => "event already enabled",
        -10207 => "event not enable yet",
        -10208 => "on board FIFO full",
        -10209 => "unknown command type",
        -10210 => "unknown chip type",
        -10211 => "card not initial",
        -10212 => "position out of range",
        -10213 => "motion busy",
        -10214 => "speed error",
        -10215 => "slow down point",
        -10216 => "axis range error",
        -10217 => "compare parameter error",
        -10218 => "compare method",
        -10219 => "axis already stop",
        -10220 => "axis INT wait failed",
        -10221 => "user code write failed",
        -10222 => "array size exceed",
        -10223 => "factor number",
        -10224 => "enable range",
        -10225 => "auto accelerate time",
        -10226 => "dwell time",
        -10227 => "dwell distance",
        -10228 => "new position",
        -10229 => "motion not in running",
        -10230 => "velocity change time",
        -10231 => "speed target",
        -10232 => "velocity percent",
        -10233 => "position change backward",
        -10234 => "counter number",
        _ => "unknown error",
    }
}

/// Function table of the encoder card.
///
/// Calls are synchronous and may block (`wait_motion_interrupt` in particular).
pub trait EncoderDriver: Send + Sync {
    /// `_8102_initial`: open the driver and report the cards found, one bit per
    /// card. `manual_id` 0 numbers cards by PCI slot, 1 by the on-board switch.
    fn initial(&self, card_id_inbit: &mut u16, manual_id: i16) -> i16;
    /// `_8102_config_from_file`: load the card configuration written by the
    /// vendor's setup tool.
    fn config_from_file(&self) -> i16;
    /// `_8102_set_position`
    fn set_position(&self, axis: i16, position: f64) -> i16;
    /// `_8102_get_position`
    fn get_position(&self, axis: i16, position: &mut f64) -> i16;
    /// `_8102_set_motion_int_factor`
    fn set_motion_int_factor(&self, axis: i16, factor: u32) -> i16;
    /// `_8102_set_trigger_comparator`
    fn set_trigger_comparator(&self, axis: i16, source: i16, method: i16, data: i32) -> i16;
    /// `_8102_int_control`
    fn int_control(&self, card: i16, enable: i16) -> i16;
    /// `_8102_wait_motion_interrupt`
    fn wait_motion_interrupt(&self, axis: i16, factor_bit: i16, timeout_ms: i32) -> i16;
}

fn card_error(function: &str, code: i16) -> DaqError {
    DaqError::protocol(
        "encoder card",
        format!(
            "function _8102_{} failed with error code {} \"{}\"",
            function,
            code,
            describe_code(code)
        ),
    )
}

/// Bring the card up: initialise the driver, then load its configuration file.
///
/// Returns the bit mask of cards found.
pub fn initialize_card(driver: &dyn EncoderDriver, manual_id: i16) -> AppResult<u16> {
    let mut cards = 0u16;
    match driver.initial(&mut cards, manual_id) {
        0 => {}
        code => return Err(card_error("initial", code)),
    }
    if cards == 0 {
        return Err(DaqError::Configuration("no encoder card found".to_string()));
    }
    match driver.config_from_file() {
        0 => {}
        code => return Err(card_error("config_from_file", code)),
    }
    info!(cards = format_args!("{:#06b}", cards), "encoder card initialised");
    Ok(cards)
}

/// One encoder channel of the card, bound to the motion axis it tracks.
pub struct EncoderAxis {
    name: String,
    driver: Arc<dyn EncoderDriver>,
    axis: i16,
}

impl EncoderAxis {
    /// Enable the trigger comparator interrupt on `axis` and interrupt control
    /// on `card`.
    pub fn new(name: &str, driver: Arc<dyn EncoderDriver>, axis: i16, card: i16) -> AppResult<Self> {
        let encoder = Self {
            name: name.to_string(),
            driver,
            axis,
        };
        encoder.check(
            encoder
                .driver
                .set_motion_int_factor(axis, TRIGGER_COMPARATOR_FACTOR),
            "set_motion_int_factor",
        )?;
        encoder.check(encoder.driver.int_control(card, 1), "int_control")?;
        info!(encoder = %encoder.name, axis, card, "encoder interrupts enabled");
        Ok(encoder)
    }

    /// Register one encoder axis per `encoder.channels` entry, keyed by the
    /// canonical name of the motion axis it tracks.
    pub fn register_all(
        registry: &mut DeviceRegistry,
        settings: &Settings,
        driver: Arc<dyn EncoderDriver>,
    ) -> AppResult<()> {
        for (axis_name, channel) in &settings.encoder.channels {
            let canonical = settings.resolve_axis(axis_name)?;
            let encoder = Self::new(canonical, driver.clone(), *channel, settings.encoder.card_id)?;
            registry.add_encoder(canonical, Arc::new(encoder))?;
        }
        Ok(())
    }

    /// Encoder axis number on the card.
    pub fn axis(&self) -> i16 {
        self.axis
    }

    fn check(&self, code: i16, function: &str) -> AppResult<()> {
        if code == 0 {
            return Ok(());
        }
        let mut err = card_error(function, code);
        if let DaqError::DeviceProtocol { device, .. } = &mut err {
            *device = format!("encoder {}", self.name);
        }
        Err(err)
    }
}

#[async_trait]
impl TriggerEncoder for EncoderAxis {
    async fn set_position(&self, steps: f64) -> AppResult<()> {
        debug!(encoder = %self.name, steps, "preload");
        self.check(self.driver.set_position(self.axis, steps), "set_position")
    }

    async fn get_position(&self) -> AppResult<f64> {
        let mut position = 0.0;
        self.check(
            self.driver.get_position(self.axis, &mut position),
            "get_position",
        )?;
        Ok(position)
    }

    async fn set_trigger_comparator(
        &self,
        source: ComparingSource,
        method: CompareMethod,
        target: i64,
    ) -> AppResult<()> {
        let data = i32::try_from(target).map_err(|_| {
            DaqError::OutOfRange(format!("comparator target {} exceeds 32 bits", target))
        })?;
        self.check(
            self.driver
                .set_trigger_comparator(self.axis, source as i16, method as i16, data),
            "set_trigger_comparator",
        )
    }

    async fn wait_for_interrupt(&self, factor_bit: u32, timeout_ms: u64) -> AppResult<()> {
        let driver = self.driver.clone();
        let axis = self.axis;
        let bit = factor_bit as i16;
        let timeout = i32::try_from(timeout_ms).unwrap_or(i32::MAX);

        let code = tokio::task::spawn_blocking(move || driver.wait_motion_interrupt(axis, bit, timeout))
            .await
            .map_err(|e| DaqError::protocol(format!("encoder {}", self.name), e.to_string()))?;

        if code == AXIS_INT_WAIT_FAILED {
            return Err(DaqError::timeout(
                format!("encoder {}", self.name),
                format!("interrupt factor bit {}", factor_bit),
                timeout_ms,
            ));
        }
        self.check(code, "wait_motion_interrupt")
    }
}
