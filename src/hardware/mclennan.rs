//! McLennan PM-series stepper motor controller driver
//!
//! Protocol Overview:
//! - Format: `{id}{command}{parameter}` followed by CR LF (ASCII)
//! - Address: decimal axis id on the daisy chain
//! - Parameters: integers only; positions and speeds are sent in steps
//! - Timing: half-duplex; the controller echoes the command line, then answers
//!
//! Answers carry a revision-dependent prefix:
//!
//! | Revision | Prefix    | Position answer   | Soft limits inhibitable |
//! |----------|-----------|-------------------|-------------------------|
//! | PM304    | none      | `CP=123`/`AP=123` | yes                     |
//! | PM341    | `02#`     | `02#123`          | yes                     |
//! | PM600    | `02:`     | `02:123`          | no                      |
//!
//! Several axes normally share one serial port, so every axis holds a clone of
//! the same [`SharedTransport`] and locks it for the duration of one exchange.

use crate::config::{AxisKind, AxisSettings, Settings};
use crate::core::AxisPosition;
use crate::error::{AppResult, DaqError};
use crate::hardware::transport::SharedTransport;
use crate::hardware::{DeviceRegistry, MotionAxis, MoveOptions};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Soft limit counter range used where limits cannot be switched off.
pub const FULL_COUNTER_RANGE: i64 = 9_999_999;

/// Runs of two or more spaces separate parameter pairs in a query-all line.
static PAIR_GAP: Lazy<Regex> = Lazy::new(|| Regex::new(r" {2,}").expect("valid regex"));

/// Name/value separator inside a pair.
static PAIR_SPLIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"[:=]").expect("valid regex"));

/// Controller revision, chosen per axis at construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ProtocolVariant {
    /// No answer prefix, positions reported as `CP=`/`AP=`
    #[serde(rename = "PM304")]
    Pm304,
    /// Answers prefixed `NN#`
    #[default]
    #[serde(rename = "PM341")]
    Pm341,
    /// Answers prefixed `NN:`; soft limits are always active
    #[serde(rename = "PM600")]
    Pm600,
}

impl ProtocolVariant {
    /// Prefix expected on every answer from axis `id`.
    pub fn prefix(&self, id: u8) -> String {
        match self {
            ProtocolVariant::Pm304 => String::new(),
            ProtocolVariant::Pm341 => format!("{:02}#", id),
            ProtocolVariant::Pm600 => format!("{:02}:", id),
        }
    }

    /// Prefix expected on a position answer.
    pub fn position_prefix(&self, id: u8, set_value: bool) -> String {
        match self {
            ProtocolVariant::Pm304 if set_value => "CP=".to_string(),
            ProtocolVariant::Pm304 => "AP=".to_string(),
            _ => self.prefix(id),
        }
    }

    /// Whether `il` (inhibit limits) is understood.
    pub fn can_inhibit_limits(&self) -> bool {
        !matches!(self, ProtocolVariant::Pm600)
    }
}

/// One value from a query-all report.
#[derive(Clone, Debug, PartialEq)]
pub enum QaValue {
    /// Integer parameter (already in steps where applicable)
    Int(i64),
    /// Enabled/Disabled, On/Off
    Flag(bool),
    /// Anything else, lowercased
    Text(String),
}

impl QaValue {
    /// Integer payload, if any.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            QaValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Boolean payload, if any.
    pub fn as_flag(&self) -> Option<bool> {
        match self {
            QaValue::Flag(v) => Some(*v),
            _ => None,
        }
    }
}

/// Parsed query-all report keyed by normalised parameter name.
pub type QueryAll = BTreeMap<String, QaValue>;

fn normalise_name(name: &str) -> String {
    match name {
        "actual pos" => "actual position",
        "command pos" => "command position",
        "autoexec" => "auto execute",
        "fast jog" => "fast jog speed",
        "lower limit" => "lower soft limit",
        "upper limit" => "upper soft limit",
        "settling" | "settle time" => "settling time",
        "tracking" => "tracking window",
        other => other,
    }
    .to_string()
}

fn parse_value(name: &str, value: &str) -> QaValue {
    let radix = if name == "read port" || name == "last write" {
        2
    } else {
        10
    };
    if let Ok(v) = i64::from_str_radix(value, radix) {
        return QaValue::Int(v);
    }
    match value.to_lowercase().as_str() {
        "enabled" | "on" => QaValue::Flag(true),
        "disabled" | "off" => QaValue::Flag(false),
        other => QaValue::Text(other.to_string()),
    }
}

/// Split a report line at gaps of two or more spaces, except where the gap is
/// followed by `=`, `-` or a digit (alignment padding inside a pair).
fn split_pairs(line: &str) -> Vec<&str> {
    let mut pairs = Vec::new();
    let mut start = 0;
    for gap in PAIR_GAP.find_iter(line) {
        let next = line[gap.end()..].chars().next();
        let padding = matches!(next, Some(c) if c == '=' || c == '-' || c.is_ascii_digit());
        if !padding {
            pairs.push(&line[start..gap.start()]);
            start = gap.end();
        }
    }
    pairs.push(&line[start..]);
    pairs
}

/// Parse the body of a query-all report (the identification line removed).
pub fn parse_query_all<S: AsRef<str>>(lines: &[S]) -> QueryAll {
    let mut report = QueryAll::new();
    for line in lines {
        for pair in split_pairs(line.as_ref().trim()) {
            let mut parts = PAIR_SPLIT.split(pair);
            let (name, value) = match (parts.next(), parts.next()) {
                (Some(name), Some(value)) => (name, value),
                _ => match pair.trim().rsplit_once(' ') {
                    Some((name, value)) => (name, value),
                    None => continue,
                },
            };
            let name = normalise_name(&name.trim().to_lowercase());
            let value = parse_value(&name, value.trim());
            report.insert(name, value);
        }
    }
    report
}

// =============================================================================
// Axis driver
// =============================================================================

/// Timing shared by every axis on one controller chain.
#[derive(Clone, Copy, Debug)]
pub struct AxisTiming {
    /// Pause before collecting an answer
    pub reply_wait: Duration,
    /// Pause before collecting the answer to `qa`, `he`, `hc`
    pub long_reply_wait: Duration,
    /// Position poll interval while waiting on a move
    pub poll_interval: Duration,
    /// Added to `distance / max_speed` for the default move timeout
    pub timeout_margin: Duration,
}

impl AxisTiming {
    /// Collect the timing parameters from the settings.
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            reply_wait: Duration::from_millis(settings.controller.reply_wait_ms),
            long_reply_wait: Duration::from_millis(settings.controller.long_reply_wait_ms),
            poll_interval: settings.poll_interval(),
            timeout_margin: settings.move_timeout_margin(),
        }
    }
}

/// One axis of a McLennan controller.
pub struct McLennanAxis {
    name: String,
    id: u8,
    scale_factor: f64,
    max_speed: f64,
    kind: AxisKind,
    variant: ProtocolVariant,
    prefix: String,
    transport: SharedTransport,
    timing: AxisTiming,
}

impl McLennanAxis {
    /// Bind an axis to a (possibly shared) transport.
    pub fn new(
        name: &str,
        settings: &AxisSettings,
        transport: SharedTransport,
        timing: AxisTiming,
    ) -> Self {
        Self {
            name: name.to_string(),
            id: settings.id,
            scale_factor: settings.scale_factor,
            max_speed: settings.max_speed,
            kind: settings.kind,
            variant: settings.variant,
            prefix: settings.variant.prefix(settings.id),
            transport,
            timing,
        }
    }

    /// Register every configured axis, all sharing `transport`, with its aliases.
    pub fn register_all(
        registry: &mut DeviceRegistry,
        settings: &Settings,
        transport: SharedTransport,
    ) -> AppResult<()> {
        let timing = AxisTiming::from_settings(settings);
        for (name, axis) in &settings.axes {
            registry.add_axis(Arc::new(Self::new(name, axis, transport.clone(), timing)));
            for alias in &axis.aliases {
                registry.add_alias(alias, name)?;
            }
        }
        Ok(())
    }

    /// Controller id.
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Controller revision.
    pub fn variant(&self) -> ProtocolVariant {
        self.variant
    }

    /// Send one command and return the answer lines after the echo.
    async fn talk(&self, command: &str, parameter: Option<i64>, check_ok: bool) -> AppResult<Vec<String>> {
        let command = command.to_lowercase();
        let send = match parameter {
            Some(p) => format!("{}{}{}", self.id, command, p),
            None => format!("{}{}", self.id, command),
        };
        let wait = if matches!(command.as_str(), "qa" | "he" | "hc") {
            self.timing.long_reply_wait
        } else {
            self.timing.reply_wait
        };

        let lines = {
            let mut transport = self.transport.lock().await;
            transport.exchange(&send, wait).await?
        };
        trace!(axis = %self.name, %send, ?lines, "controller exchange");

        let echo = lines.first().map(String::as_str).unwrap_or("");
        if echo != send {
            return Err(DaqError::protocol(
                &self.name,
                format!("Incorrect command echo: sent \"{}\", received \"{}\"", send, echo),
            ));
        }
        let answer = match lines.get(1) {
            Some(answer) => answer,
            None => {
                return Err(DaqError::protocol(
                    &self.name,
                    format!("No answer to command \"{}\"", send),
                ))
            }
        };
        if check_ok && *answer != format!("{}OK", self.prefix) {
            return Err(DaqError::protocol(
                &self.name,
                format!("Error response on command \"{}\": received \"{}\"", send, answer),
            ));
        }
        Ok(lines[1..].to_vec())
    }

    fn steps(&self, value: f64) -> i64 {
        AxisPosition::new(value, self.scale_factor).steps()
    }

    /// Query every parameter of the axis.
    pub async fn query_all(&self) -> AppResult<QueryAll> {
        let lines = self.talk("qa", None, false).await?;
        Ok(parse_query_all(lines.get(1..).unwrap_or(&[])))
    }

    fn report_int(&self, report: &QueryAll, key: &str) -> AppResult<i64> {
        report
            .get(key)
            .and_then(QaValue::as_int)
            .ok_or_else(|| DaqError::protocol(&self.name, format!("query all has no integer '{}'", key)))
    }

    async fn wait_settled(&self, target: f64, tolerance: f64, timeout: Duration) -> AppResult<()> {
        let start = Instant::now();
        loop {
            tokio::time::sleep(self.timing.poll_interval).await;
            let position = self.get_position(true).await?;
            if (position - target).abs() <= tolerance {
                debug!(axis = %self.name, position, "settled");
                return Ok(());
            }
            if start.elapsed() > timeout {
                return Err(DaqError::timeout(
                    &self.name,
                    format!("reach position {} (at {})", target, position),
                    timeout.as_millis() as u64,
                ));
            }
        }
    }
}

#[async_trait]
impl MotionAxis for McLennanAxis {
    fn name(&self) -> &str {
        &self.name
    }

    fn scale_factor(&self) -> f64 {
        self.scale_factor
    }

    fn max_speed(&self) -> f64 {
        self.max_speed
    }

    fn units(&self) -> &str {
        self.kind.units()
    }

    async fn move_to(&self, target: f64, options: MoveOptions) -> AppResult<()> {
        let current = if options.wait || options.relative {
            Some(self.get_position(true).await?)
        } else {
            None
        };
        let final_position = match (options.relative, current) {
            (true, Some(current)) => current + target,
            _ => target,
        };

        let command = if options.relative { "mr" } else { "ma" };
        debug!(axis = %self.name, target = final_position, wait = options.wait, "move");
        self.talk(command, Some(self.steps(target)), true).await?;

        if !options.wait {
            return Ok(());
        }
        let timeout = options.timeout.unwrap_or_else(|| {
            let distance = (final_position - current.unwrap_or(final_position)).abs();
            Duration::from_secs_f64(distance / self.max_speed) + self.timing.timeout_margin
        });
        self.wait_settled(final_position, options.tolerance, timeout).await
    }

    async fn set_speed(&self, speed: Option<f64>) -> AppResult<()> {
        let speed = speed.unwrap_or(self.max_speed);
        if speed > self.max_speed {
            return Err(DaqError::OutOfRange(format!(
                "Requested speed {} {}/s on axis '{}' is higher than maximum {} {}/s",
                speed,
                self.units(),
                self.name,
                self.max_speed,
                self.units()
            )));
        }
        if !(speed > 0.0) {
            return Err(DaqError::OutOfRange(format!(
                "Requested speed {} on axis '{}' must be positive",
                speed, self.name
            )));
        }
        self.talk("sv", Some(self.steps(speed)), true).await?;
        Ok(())
    }

    async fn get_speed(&self) -> AppResult<f64> {
        let report = self.query_all().await?;
        Ok(self.report_int(&report, "slew speed")? as f64 / self.scale_factor)
    }

    async fn get_position(&self, set_value: bool) -> AppResult<f64> {
        let answer = self
            .talk(if set_value { "oc" } else { "oa" }, None, false)
            .await?
            .remove(0);
        let prefix = self.variant.position_prefix(self.id, set_value);
        let steps = answer
            .strip_prefix(prefix.as_str())
            .and_then(|rest| rest.trim().parse::<i64>().ok())
            .ok_or_else(|| {
                DaqError::protocol(
                    &self.name,
                    format!("Bad reply \"{}\" does not begin \"{}\" and a step count", answer, prefix),
                )
            })?;
        Ok(AxisPosition::from_steps(steps as f64, self.scale_factor).value)
    }

    async fn stop(&self) -> AppResult<()> {
        debug!(axis = %self.name, "stop");
        self.talk("st", None, false).await?;
        Ok(())
    }

    async fn reset_position(&self, position: f64) -> AppResult<()> {
        let steps = self.steps(position);
        self.talk("cp", Some(steps), true).await?;
        self.talk("ap", Some(steps), true).await?;
        Ok(())
    }

    async fn set_limits(&self, limits: Option<(f64, f64)>) -> AppResult<()> {
        let (lower, upper) = match limits {
            Some((a, b)) => (self.steps(a.min(b)), self.steps(a.max(b))),
            None if self.variant.can_inhibit_limits() => {
                self.talk("il", None, true).await?;
                return Ok(());
            }
            None => (-FULL_COUNTER_RANGE, FULL_COUNTER_RANGE),
        };
        if self.variant.can_inhibit_limits() {
            self.talk("al", None, true).await?;
        }
        self.talk("ll", Some(lower), true).await?;
        self.talk("ul", Some(upper), true).await?;
        Ok(())
    }

    async fn get_limits(&self) -> AppResult<Option<(f64, f64)>> {
        let report = self.query_all().await?;
        let enabled = !self.variant.can_inhibit_limits()
            || report
                .get("soft limits")
                .and_then(QaValue::as_flag)
                .unwrap_or(false);
        if !enabled {
            return Ok(None);
        }
        let lower = self.report_int(&report, "lower soft limit")? as f64 / self.scale_factor;
        let upper = self.report_int(&report, "upper soft limit")? as f64 / self.scale_factor;
        Ok(Some((lower, upper)))
    }
}
