//! Metrolab THM1176 three-axis Hall probe.
//!
//! The probe speaks SCPI over USB-TMC. Field samples are taken on BUS triggers
//! into the on-board buffer and fetched per component afterwards:
//!
//! ```text
//! :ABOR                    cancel pending acquisition
//! :TRIG:SOUR BUS           trigger on *TRG
//! :TRIG:COUN 21            expect 21 triggers
//! :INIT                    start
//! *TRG                     (x21)
//! :FETC:ARR:X? 21,5        "0.01234 MT,0.01240 MT,..."
//! ```
//!
//! On connection the probe is identified and its supported ranges and units
//! are discovered, so later range and unit requests can be checked locally.

use crate::config::ProbeSettings;
use crate::core::FieldVector;
use crate::error::{AppResult, DaqError};
use crate::hardware::transport::ScpiTransport;
use crate::hardware::{FieldInstrument, TriggerSource};
use async_trait::async_trait;
use std::fmt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Manufacturer string reported by genuine probes.
pub const MANUFACTURER: &str = "Metrolab Technology SA";

/// Largest number of samples one fetch may return.
pub const MAX_FETCH: usize = 2048;

const DEVICE: &str = "THM1176";
const COMPONENTS: [char; 3] = ['X', 'Y', 'Z'];

/// `*IDN?` fields.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProbeIdentity {
    /// Manufacturer name
    pub manufacturer: String,
    /// Model name
    pub model: String,
    /// Serial number
    pub serial: String,
    /// Firmware version
    pub firmware: String,
}

impl fmt::Display for ProbeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} S/N {}", self.manufacturer, self.model, self.serial)
    }
}

#[derive(Debug, Default)]
struct ProbeState {
    identity: ProbeIdentity,
    ranges: Vec<f64>,
    range_units: String,
    unit_names: Vec<String>,
    units: String,
    averages: u32,
    auto_range: bool,
    range: f64,
}

/// Pick the probe range to use for a requested full scale.
///
/// An exact match is used as is; otherwise the next higher range is chosen.
/// A request above the largest range is rejected.
pub fn select_range(ranges: &[f64], requested: f64) -> AppResult<f64> {
    if ranges.contains(&requested) {
        return Ok(requested);
    }
    ranges
        .iter()
        .copied()
        .find(|&r| requested < r)
        .ok_or_else(|| {
            DaqError::Configuration(format!(
                "range {} is above maximum range {} of probe",
                requested,
                ranges.last().copied().unwrap_or(0.0)
            ))
        })
}

/// Format a range with two significant digits: 0.1, 0.5, 3, 20.
pub fn format_range(range: f64) -> String {
    if range == 0.0 || !range.is_finite() {
        return range.to_string();
    }
    let magnitude = range.abs().log10().floor();
    let factor = 10f64.powf(1.0 - magnitude);
    ((range * factor).round() / factor).to_string()
}

/// Parse one `"<value> <unit>,<value> <unit>,..."` answer.
pub fn parse_values(answer: &str) -> AppResult<Vec<f64>> {
    answer
        .split(',')
        .map(|item| {
            item.split_whitespace()
                .next()
                .and_then(|v| v.parse::<f64>().ok())
                .ok_or_else(|| DaqError::protocol(DEVICE, format!("bad field value '{}'", item)))
        })
        .collect()
}

/// Hall probe driver.
pub struct MetrolabProbe {
    transport: Mutex<Box<dyn ScpiTransport>>,
    state: Mutex<ProbeState>,
}

impl MetrolabProbe {
    /// Identify the probe and read its capabilities and current settings.
    pub async fn connect(transport: Box<dyn ScpiTransport>) -> AppResult<Self> {
        let probe = Self {
            transport: Mutex::new(transport),
            state: Mutex::new(ProbeState::default()),
        };

        let idn = probe.query("*IDN?").await?;
        let mut fields = idn.split(',').map(|f| f.trim().to_string());
        let identity = ProbeIdentity {
            manufacturer: fields.next().unwrap_or_default(),
            model: fields.next().unwrap_or_default(),
            serial: fields.next().unwrap_or_default(),
            firmware: fields.next().unwrap_or_default(),
        };
        if identity.manufacturer != MANUFACTURER {
            return Err(DaqError::protocol(
                DEVICE,
                format!(
                    "resource is not a Metrolab probe - manufacturer is \"{}\"",
                    identity.manufacturer
                ),
            ));
        }

        let (ranges, range_units) = Self::parse_ranges(&probe.query(":SENS:ALL?").await?)?;
        let unit_names: Vec<String> = probe
            .query(":UNIT:ALL?")
            .await?
            .split(',')
            .step_by(2)
            .map(|name| name.trim().to_uppercase())
            .collect();

        {
            let mut state = probe.state.lock().await;
            state.identity = identity;
            state.ranges = ranges;
            state.range_units = range_units;
            state.unit_names = unit_names;
        }
        probe.refresh().await?;

        let state = probe.state.lock().await;
        info!(
            probe = %state.identity,
            units = %state.units,
            averages = state.averages,
            range = state.range,
            "probe connected"
        );
        drop(state);
        Ok(probe)
    }

    fn parse_ranges(answer: &str) -> AppResult<(Vec<f64>, String)> {
        let mut ranges = Vec::new();
        let mut units: Option<String> = None;
        for item in answer.split(',') {
            let mut parts = item.split_whitespace();
            let value = parts
                .next()
                .and_then(|v| v.parse::<f64>().ok())
                .ok_or_else(|| DaqError::protocol(DEVICE, format!("bad range '{}'", item)))?;
            let unit = parts.next().unwrap_or_default().to_string();
            match &units {
                Some(u) if *u != unit => {
                    return Err(DaqError::protocol(
                        DEVICE,
                        format!("ranges reported in mixed units: '{}'", answer),
                    ))
                }
                Some(_) => {}
                None => units = Some(unit),
            }
            ranges.push(value);
        }
        ranges.sort_by(|a, b| a.total_cmp(b));
        Ok((ranges, units.unwrap_or_default()))
    }

    async fn write(&self, command: &str) -> AppResult<()> {
        debug!(probe = DEVICE, command, "write");
        self.transport.lock().await.write(command).await
    }

    async fn query(&self, command: &str) -> AppResult<String> {
        let answer = self.transport.lock().await.query(command).await?;
        debug!(probe = DEVICE, command, answer = %answer, "query");
        Ok(answer.trim().to_string())
    }

    /// Re-read units, averages and range from the probe.
    pub async fn refresh(&self) -> AppResult<()> {
        let units = self.query(":UNIT?").await?.to_uppercase();
        let averages_answer = self.query(":AVER:COUN?").await?;
        let averages = averages_answer.parse::<u32>().map_err(|_| {
            DaqError::protocol(DEVICE, format!("bad averages '{}'", averages_answer))
        })?;
        let auto_range = match self.query(":SENS:AUTO?").await?.as_str() {
            "ON" => true,
            "OFF" => false,
            other => {
                return Err(DaqError::protocol(
                    DEVICE,
                    format!("bad reply to auto-range query: \"{}\"", other),
                ))
            }
        };
        let range_answer = self.query(":SENS?").await?;
        let range = range_answer
            .split_whitespace()
            .next()
            .and_then(|v| v.parse::<f64>().ok())
            .ok_or_else(|| DaqError::protocol(DEVICE, format!("bad range '{}'", range_answer)))?;

        let mut state = self.state.lock().await;
        state.units = units;
        state.averages = averages;
        state.auto_range = auto_range;
        state.range = range;
        Ok(())
    }

    /// Identification fields.
    pub async fn identity(&self) -> ProbeIdentity {
        self.state.lock().await.identity.clone()
    }

    /// Supported ranges, ascending, with their unit.
    pub async fn ranges(&self) -> (Vec<f64>, String) {
        let state = self.state.lock().await;
        (state.ranges.clone(), state.range_units.clone())
    }

    /// Select the unit samples are reported in.
    pub async fn set_units(&self, unit: &str) -> AppResult<String> {
        let unit = unit.to_uppercase();
        if !self.state.lock().await.unit_names.contains(&unit) {
            return Err(DaqError::Configuration(format!("bad unit: \"{}\"", unit)));
        }
        self.write(&format!(":UNIT {}", unit)).await?;
        self.state.lock().await.units = unit.clone();
        Ok(unit)
    }

    /// Readings averaged into each sample.
    pub async fn averages(&self) -> u32 {
        self.state.lock().await.averages
    }

    /// Set the number of readings averaged into each sample.
    pub async fn set_averages(&self, averages: u32) -> AppResult<()> {
        if averages == 0 {
            return Err(DaqError::Configuration(format!(
                "bad number of averages: {}",
                averages
            )));
        }
        self.write(&format!(":AVER:COUN {}", averages)).await?;
        self.state.lock().await.averages = averages;
        Ok(())
    }

    /// `(auto_range, range)` as last set or read.
    pub async fn range(&self) -> (bool, f64) {
        let state = self.state.lock().await;
        (state.auto_range, state.range)
    }

    /// Fix the range, or hand it to the probe with `None`.
    pub async fn set_range(&self, range: Option<f64>) -> AppResult<()> {
        let requested = match range {
            None => {
                self.write(":SENS:AUTO ON").await?;
                self.state.lock().await.auto_range = true;
                return Ok(());
            }
            Some(r) => r,
        };

        let ranges = self.state.lock().await.ranges.clone();
        let selected = select_range(&ranges, requested)?;
        if selected != requested {
            warn!(
                "Range {} is not in allowed ranges. Using {} instead.",
                requested, selected
            );
        }
        self.write(":SENS:AUTO OFF").await?;
        self.write(&format!(":SENS {}", format_range(selected))).await?;

        let mut state = self.state.lock().await;
        state.auto_range = false;
        state.range = selected;
        Ok(())
    }

    /// Apply units, averages and range from the settings.
    pub async fn apply_settings(&self, settings: &ProbeSettings) -> AppResult<()> {
        self.set_units(&settings.units).await?;
        self.set_averages(settings.averages).await?;
        let range = if settings.auto_range {
            None
        } else {
            Some(settings.range)
        };
        self.set_range(range).await
    }

    /// Take one immediate reading of all three components.
    pub async fn read_field(&self, digits: u8) -> AppResult<FieldVector> {
        check_digits(digits)?;
        let mut components = [0.0; 3];
        for (slot, axis) in components.iter_mut().zip(COMPONENTS) {
            let values = parse_values(&self.query(&format!(":READ:ARR:{}? 1,,{}", axis, digits)).await?)?;
            *slot = values.first().copied().ok_or_else(|| {
                DaqError::protocol(DEVICE, format!("empty {} reading", axis))
            })?;
        }
        Ok(FieldVector::new(components[0], components[1], components[2]))
    }
}

fn check_digits(digits: u8) -> AppResult<()> {
    if (1..=5).contains(&digits) {
        Ok(())
    } else {
        Err(DaqError::OutOfRange(format!("digits must be 1-5, got {}", digits)))
    }
}

#[async_trait]
impl FieldInstrument for MetrolabProbe {
    async fn abort_trigger(&self) -> AppResult<()> {
        self.write(":ABOR").await
    }

    async fn arm_trigger(&self, source: TriggerSource, count: usize) -> AppResult<()> {
        if count == 0 {
            return Err(DaqError::Configuration(format!("bad trigger count: {}", count)));
        }
        if count > MAX_FETCH {
            return Err(DaqError::OutOfRange(format!(
                "trigger count must be 1-{}, got {}",
                MAX_FETCH, count
            )));
        }
        self.write(&format!(":TRIG:SOUR {}", source.mnemonic())).await?;
        self.write(&format!(":TRIG:COUN {}", count)).await?;
        self.write(":INIT").await
    }

    async fn assert_trigger(&self) -> AppResult<()> {
        self.write("*TRG").await
    }

    async fn fetch_buffered(&self, count: usize, digits: u8) -> AppResult<Vec<FieldVector>> {
        if !(1..=MAX_FETCH).contains(&count) {
            return Err(DaqError::OutOfRange(format!(
                "fetch count must be 1-{}, got {}",
                MAX_FETCH, count
            )));
        }
        check_digits(digits)?;

        let mut columns = Vec::with_capacity(3);
        for axis in COMPONENTS {
            let values = parse_values(&self.query(&format!(":FETC:ARR:{}? {},{}", axis, count, digits)).await?)?;
            if values.len() != count {
                return Err(DaqError::protocol(
                    DEVICE,
                    format!("fetched {} {} values, expected {}", values.len(), axis, count),
                ));
            }
            columns.push(values);
        }
        Ok((0..count)
            .map(|i| FieldVector::new(columns[0][i], columns[1][i], columns[2][i]))
            .collect())
    }

    async fn units(&self) -> AppResult<String> {
        Ok(self.state.lock().await.units.clone())
    }

    fn buffer_capacity(&self) -> usize {
        MAX_FETCH
    }
}
