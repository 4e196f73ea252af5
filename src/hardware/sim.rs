//! Simulated bench for running sweeps without hardware.
//!
//! The simulation sits below the drivers, not beside them: [`SimController`]
//! answers the McLennan serial protocol, [`SimEncoderDriver`] implements the
//! encoder card function table and [`SimProbeTransport`] answers the probe's
//! SCPI commands. The real [`McLennanAxis`], [`EncoderAxis`] and
//! [`MetrolabProbe`] drivers run on top, so a simulated sweep exercises the
//! same code paths as a bench sweep.
//!
//! All three share one [`SimWorld`] holding the axis kinematics. Axes move at
//! constant velocity; `time_scale` speeds simulated time up relative to the
//! wall clock.

use crate::config::{Settings, SimulationSettings};
use crate::core::FieldVector;
use crate::error::{AppResult, DaqError};
use crate::hardware::encoder::{initialize_card, EncoderAxis, EncoderDriver, AXIS_INT_WAIT_FAILED};
use crate::hardware::mclennan::{McLennanAxis, ProtocolVariant};
use crate::hardware::metrolab::{MetrolabProbe, MANUFACTURER};
use crate::hardware::transport::{shared, CommandTransport, ScpiTransport};
use crate::hardware::{
    CompareMethod, ComparingSource, DeviceRegistry, TRIGGER_COMPARATOR_FACTOR,
    TRIGGER_COMPARATOR_FACTOR_BIT,
};
use async_trait::async_trait;
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info};

const EVENT_NOT_ENABLED: i16 = -10207;
const COMPARE_METHOD_ERROR: i16 = -10218;
const AXIS_RANGE_ERROR: i16 = -10216;
const CARD_NOT_INITIAL: i16 = -10211;

/// Half-width of the simulated solenoid field profile, in mm.
const PROFILE_HALF_WIDTH_MM: f64 = 20.0;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// World
// =============================================================================

#[derive(Debug, Clone)]
struct AxisMotion {
    variant: ProtocolVariant,
    scale_factor: f64,
    speed: f64,
    start: f64,
    target: f64,
    started_at: f64,
    soft_limits: bool,
    lower: i64,
    upper: i64,
}

impl AxisMotion {
    fn position(&self, now: f64) -> f64 {
        let distance = self.target - self.start;
        let travelled = (self.speed * (now - self.started_at)).min(distance.abs());
        self.start + distance.signum() * travelled
    }

    fn moving(&self, now: f64) -> bool {
        self.position(now) != self.target
    }

    fn rebase(&mut self, now: f64) {
        self.start = self.position(now);
        self.started_at = now;
    }
}

/// Kinematic state of every simulated controller axis, in steps.
pub struct SimWorld {
    epoch: Instant,
    time_scale: f64,
    axes: Mutex<BTreeMap<u8, AxisMotion>>,
}

impl SimWorld {
    /// Empty world; `time_scale` simulated seconds pass per wall second.
    pub fn new(time_scale: f64) -> Self {
        Self {
            epoch: Instant::now(),
            time_scale,
            axes: Mutex::new(BTreeMap::new()),
        }
    }

    /// Simulated seconds since creation.
    pub fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64() * self.time_scale
    }

    /// Wall-clock duration of a simulated interval.
    pub fn wall(&self, simulated: Duration) -> Duration {
        simulated.div_f64(self.time_scale)
    }

    /// Add a controller axis at position zero, slewing at `max_speed`.
    pub fn add_axis(&self, id: u8, variant: ProtocolVariant, scale_factor: f64, max_speed: f64) {
        locked(&self.axes).insert(
            id,
            AxisMotion {
                variant,
                scale_factor,
                speed: max_speed * scale_factor,
                start: 0.0,
                target: 0.0,
                started_at: 0.0,
                soft_limits: false,
                lower: -crate::hardware::mclennan::FULL_COUNTER_RANGE,
                upper: crate::hardware::mclennan::FULL_COUNTER_RANGE,
            },
        );
    }

    /// Position of controller axis `id` in steps.
    pub fn steps(&self, id: u8) -> Option<f64> {
        let now = self.now();
        locked(&self.axes).get(&id).map(|axis| axis.position(now))
    }

    /// Position of controller axis `id` in engineering units.
    pub fn position(&self, id: u8) -> Option<f64> {
        let now = self.now();
        locked(&self.axes)
            .get(&id)
            .map(|axis| axis.position(now) / axis.scale_factor)
    }

    /// Place an axis without moving it.
    pub fn teleport(&self, id: u8, steps: f64) {
        if let Some(axis) = locked(&self.axes).get_mut(&id) {
            axis.start = steps;
            axis.target = steps;
        }
    }

    /// Answer one McLennan command line, or `None` when no axis has the id.
    fn command(&self, line: &str) -> Option<Vec<String>> {
        let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
        let id: u8 = line[..digits].parse().ok()?;
        let rest = &line[digits..];
        let split = rest
            .char_indices()
            .find(|(_, c)| !c.is_ascii_alphabetic())
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        let (command, parameter) = rest.split_at(split);
        let parameter = parameter.parse::<i64>().ok();

        let now = self.now();
        let mut axes = locked(&self.axes);
        let axis = axes.get_mut(&id)?;
        let prefix = axis.variant.prefix(id);
        let ok = vec![format!("{}OK", prefix)];

        let answer = match (command, parameter) {
            ("ma", Some(steps)) | ("mr", Some(steps)) => {
                let base = if command == "mr" {
                    axis.position(now)
                } else {
                    0.0
                };
                let mut target = base + steps as f64;
                if axis.soft_limits || !axis.variant.can_inhibit_limits() {
                    target = target.clamp(axis.lower as f64, axis.upper as f64);
                }
                axis.rebase(now);
                axis.target = target;
                ok
            }
            ("sv", Some(steps)) if steps > 0 => {
                axis.rebase(now);
                axis.speed = steps as f64;
                ok
            }
            ("st", None) => {
                axis.rebase(now);
                axis.target = axis.start;
                ok
            }
            ("cp", Some(steps)) | ("ap", Some(steps)) => {
                axis.start = steps as f64;
                axis.target = steps as f64;
                axis.started_at = now;
                ok
            }
            ("il", None) if axis.variant.can_inhibit_limits() => {
                axis.soft_limits = false;
                ok
            }
            ("al", None) if axis.variant.can_inhibit_limits() => {
                axis.soft_limits = true;
                ok
            }
            ("ll", Some(steps)) => {
                axis.lower = steps;
                ok
            }
            ("ul", Some(steps)) => {
                axis.upper = steps;
                ok
            }
            ("oc", None) | ("oa", None) => {
                let steps = axis.position(now).round() as i64;
                let position_prefix = axis.variant.position_prefix(id, command == "oc");
                vec![format!("{}{}", position_prefix, steps)]
            }
            ("qa", None) => Self::report(id, axis, now),
            _ => vec![format!("{}! invalid command", prefix)],
        };
        Some(answer)
    }

    fn report(id: u8, axis: &AxisMotion, now: f64) -> Vec<String> {
        let position = axis.position(now).round() as i64;
        let flag = |on: bool| if on { "Enabled" } else { "Disabled" };
        vec![
            "Mclennan Digiloop Motor Controller V2.18a (simulated)".to_string(),
            format!("Address = {}    Privilege level = 4", id),
            format!(
                "Mode = {}    Display = command",
                if axis.moving(now) { "Moving" } else { "Idle" }
            ),
            format!(
                "Soft limits = {}    Autoexec = Off",
                flag(axis.soft_limits || !axis.variant.can_inhibit_limits())
            ),
            format!(
                "Lower limit = {}    Upper limit = {}",
                axis.lower, axis.upper
            ),
            format!(
                "Slew speed = {}    Fast jog = {}",
                axis.speed.round() as i64,
                (axis.speed * 2.0).round() as i64
            ),
            format!("Command pos = {}    Actual pos = {}", position, position),
        ]
    }
}

// =============================================================================
// Controller
// =============================================================================

/// Serial link to the simulated controller chain.
pub struct SimController {
    world: Arc<SimWorld>,
}

impl SimController {
    /// Controller chain backed by `world`.
    pub fn new(world: Arc<SimWorld>) -> Self {
        Self { world }
    }
}

#[async_trait]
impl CommandTransport for SimController {
    async fn exchange(&mut self, command: &str, _reply_wait: Duration) -> AppResult<Vec<String>> {
        let answer = self.world.command(command).ok_or_else(|| {
            DaqError::timeout("simulated controller", format!("reply to '{}'", command), 0)
        })?;
        let mut lines = vec![command.to_string()];
        lines.extend(answer);
        Ok(lines)
    }
}

// =============================================================================
// Encoder card
// =============================================================================

#[derive(Debug, Default, Clone)]
struct ChannelState {
    controller_id: u8,
    offset: f64,
    factor: u32,
    comparator: Option<(f64, f64)>,
}

#[derive(Debug, Default)]
struct CardState {
    channels: BTreeMap<i16, ChannelState>,
    initialized: bool,
    interrupts: bool,
    failing_waits: u32,
}

/// Encoder card whose channels follow simulated controller axes.
///
/// The counter of a channel is the step position of its controller axis plus
/// the preload offset. The comparator fires once the counter has reached the
/// armed value, counting from where it was when armed.
pub struct SimEncoderDriver {
    world: Arc<SimWorld>,
    state: Mutex<CardState>,
}

impl SimEncoderDriver {
    /// Card with no channels attached.
    pub fn new(world: Arc<SimWorld>) -> Self {
        Self {
            world,
            state: Mutex::new(CardState::default()),
        }
    }

    /// Wire encoder channel `axis` to controller axis `controller_id`.
    pub fn attach(&self, axis: i16, controller_id: u8) {
        locked(&self.state).channels.insert(
            axis,
            ChannelState {
                controller_id,
                ..ChannelState::default()
            },
        );
    }

    /// Make the next `count` interrupt waits time out.
    pub fn fail_next_waits(&self, count: u32) {
        locked(&self.state).failing_waits = count;
    }

    fn counter(&self, channel: &ChannelState) -> f64 {
        self.world.steps(channel.controller_id).unwrap_or(0.0) + channel.offset
    }
}

impl EncoderDriver for SimEncoderDriver {
    fn initial(&self, card_id_inbit: &mut u16, _manual_id: i16) -> i16 {
        locked(&self.state).initialized = true;
        *card_id_inbit = 0b1;
        0
    }

    fn config_from_file(&self) -> i16 {
        if locked(&self.state).initialized {
            0
        } else {
            CARD_NOT_INITIAL
        }
    }

    fn set_position(&self, axis: i16, position: f64) -> i16 {
        let raw = match locked(&self.state).channels.get(&axis) {
            Some(channel) => self.world.steps(channel.controller_id).unwrap_or(0.0),
            None => return AXIS_RANGE_ERROR,
        };
        if let Some(channel) = locked(&self.state).channels.get_mut(&axis) {
            channel.offset = position - raw;
        }
        0
    }

    fn get_position(&self, axis: i16, position: &mut f64) -> i16 {
        let state = locked(&self.state);
        match state.channels.get(&axis) {
            Some(channel) => {
                *position = self.counter(channel);
                0
            }
            None => AXIS_RANGE_ERROR,
        }
    }

    fn set_motion_int_factor(&self, axis: i16, factor: u32) -> i16 {
        match locked(&self.state).channels.get_mut(&axis) {
            Some(channel) => {
                channel.factor = factor;
                0
            }
            None => AXIS_RANGE_ERROR,
        }
    }

    fn set_trigger_comparator(&self, axis: i16, source: i16, method: i16, data: i32) -> i16 {
        if source != ComparingSource::Feedback as i16
            || method != CompareMethod::EqualDirectionIndependent as i16
        {
            return COMPARE_METHOD_ERROR;
        }
        let mut state = locked(&self.state);
        let channel = match state.channels.get_mut(&axis) {
            Some(channel) => channel,
            None => return AXIS_RANGE_ERROR,
        };
        let armed_at = self.world.steps(channel.controller_id).unwrap_or(0.0) + channel.offset;
        channel.comparator = Some((armed_at, f64::from(data)));
        0
    }

    fn int_control(&self, _card: i16, enable: i16) -> i16 {
        locked(&self.state).interrupts = enable != 0;
        0
    }

    fn wait_motion_interrupt(&self, axis: i16, factor_bit: i16, timeout_ms: i32) -> i16 {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms.max(0) as u64);
        {
            let mut state = locked(&self.state);
            let enabled = state.interrupts
                && factor_bit as u32 == TRIGGER_COMPARATOR_FACTOR_BIT
                && state
                    .channels
                    .get(&axis)
                    .map(|c| c.factor & TRIGGER_COMPARATOR_FACTOR != 0 && c.comparator.is_some())
                    .unwrap_or(false);
            if !enabled {
                return EVENT_NOT_ENABLED;
            }
            if state.failing_waits > 0 {
                state.failing_waits -= 1;
                debug!(axis, "simulated interrupt wait failure");
                return AXIS_INT_WAIT_FAILED;
            }
        }

        loop {
            {
                let mut state = locked(&self.state);
                if let Some(channel) = state.channels.get(&axis).cloned() {
                    if let Some((armed_at, target)) = channel.comparator {
                        let now = self.counter(&channel);
                        if (target - armed_at) * (target - now) <= 0.0 {
                            if let Some(channel) = state.channels.get_mut(&axis) {
                                channel.comparator = None;
                            }
                            return 0;
                        }
                    }
                }
            }
            if Instant::now() >= deadline {
                return AXIS_INT_WAIT_FAILED;
            }
            std::thread::sleep(Duration::from_micros(200));
        }
    }
}

// =============================================================================
// Probe
// =============================================================================

#[derive(Debug)]
struct ProbeSim {
    units: String,
    averages: u32,
    auto_range: bool,
    range: f64,
    trigger_count: usize,
    armed: bool,
    buffer: Vec<FieldVector>,
    triggers: usize,
}

/// SCPI link to a simulated three-axis Hall probe.
///
/// The field is that of a short solenoid centred on the origin of the
/// component axes. Clones share state, so a clone kept by a test can inspect
/// the trigger count after another clone has been handed to the driver.
#[derive(Clone)]
pub struct SimProbeTransport {
    world: Arc<SimWorld>,
    components: [Option<u8>; 3],
    settings: SimulationSettings,
    state: Arc<Mutex<ProbeSim>>,
}

impl SimProbeTransport {
    const RANGES: [f64; 4] = [0.1, 0.5, 3.0, 20.0];
    const UNITS: [(&'static str, f64); 4] = [("T", 1.0), ("MT", 1e3), ("UT", 1e6), ("GAUSS", 1e4)];

    /// Probe reading the positions of the controller axes carrying x, y, z.
    pub fn new(world: Arc<SimWorld>, components: [Option<u8>; 3], settings: SimulationSettings) -> Self {
        Self {
            world,
            components,
            settings,
            state: Arc::new(Mutex::new(ProbeSim {
                units: "T".to_string(),
                averages: 1,
                auto_range: true,
                range: 0.1,
                trigger_count: 1,
                armed: false,
                buffer: Vec::new(),
                triggers: 0,
            })),
        }
    }

    /// Software triggers received so far.
    pub fn triggers(&self) -> usize {
        locked(&self.state).triggers
    }

    /// Field at the current stage position, in tesla.
    pub fn field(&self) -> FieldVector {
        let coordinate = |i: usize| {
            self.components[i]
                .and_then(|id| self.world.position(id))
                .unwrap_or(0.0)
        };
        let (x, y, z) = (coordinate(0), coordinate(1), coordinate(2));
        let profile = 1.0 / (1.0 + (z / PROFILE_HALF_WIDTH_MM).powi(2));
        let peak = self.settings.peak_field_t;
        let radial = peak * profile * z / (PROFILE_HALF_WIDTH_MM * PROFILE_HALF_WIDTH_MM);

        let mut rng = rand::thread_rng();
        let mut noise = || {
            let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
            let u2: f64 = rng.gen();
            self.settings.noise_t
                * (-2.0 * u1.ln()).sqrt()
                * (2.0 * std::f64::consts::PI * u2).cos()
        };
        FieldVector::new(
            radial * x + noise(),
            radial * y + noise(),
            peak * profile + noise(),
        )
    }

    fn unit_factor(unit: &str) -> Option<f64> {
        Self::UNITS
            .iter()
            .find(|(name, _)| *name == unit)
            .map(|(_, factor)| *factor)
    }

    fn format_values(values: &[f64], digits: usize, unit: &str) -> String {
        values
            .iter()
            .map(|v| format!("{:.*e} {}", digits.saturating_sub(1), v, unit))
            .collect::<Vec<_>>()
            .join(",")
    }

    fn component(field: &FieldVector, axis: &str) -> Option<f64> {
        match axis {
            "X" => Some(field.x),
            "Y" => Some(field.y),
            "Z" => Some(field.z),
            _ => None,
        }
    }

    fn bad(command: &str) -> DaqError {
        DaqError::protocol("simulated probe", format!("unsupported command '{}'", command))
    }
}

#[async_trait]
impl ScpiTransport for SimProbeTransport {
    async fn write(&mut self, command: &str) -> AppResult<()> {
        let (head, argument) = command
            .split_once(' ')
            .map(|(h, a)| (h, a.trim()))
            .unwrap_or((command, ""));
        let field = if head == "*TRG" { Some(self.field()) } else { None };

        let mut state = locked(&self.state);
        match head {
            ":UNIT" => {
                let unit = argument.to_uppercase();
                if Self::unit_factor(&unit).is_none() {
                    return Err(Self::bad(command));
                }
                state.units = unit;
            }
            ":AVER:COUN" => {
                state.averages = argument.parse().map_err(|_| Self::bad(command))?;
            }
            ":SENS:AUTO" => state.auto_range = argument == "ON",
            ":SENS" => state.range = argument.parse().map_err(|_| Self::bad(command))?,
            ":ABOR" => {
                state.armed = false;
            }
            ":TRIG:SOUR" => {}
            ":TRIG:COUN" => {
                state.trigger_count = argument.parse().map_err(|_| Self::bad(command))?;
            }
            ":INIT" => {
                state.armed = true;
                state.buffer.clear();
            }
            "*TRG" => {
                state.triggers += 1;
                if state.armed && state.buffer.len() < state.trigger_count {
                    if let Some(field) = field {
                        state.buffer.push(field);
                    }
                }
            }
            _ => return Err(Self::bad(command)),
        }
        Ok(())
    }

    async fn query(&mut self, command: &str) -> AppResult<String> {
        let (head, argument) = command
            .split_once(' ')
            .map(|(h, a)| (h, a.trim()))
            .unwrap_or((command, ""));
        let state = locked(&self.state);
        let scale = Self::unit_factor(&state.units).unwrap_or(1.0);

        let answer = match head {
            "*IDN?" => format!("{},THM1176-MF,SIM0001,sim", MANUFACTURER),
            ":SENS:ALL?" => Self::RANGES
                .iter()
                .map(|r| format!("{} T", r))
                .collect::<Vec<_>>()
                .join(","),
            ":UNIT:ALL?" => Self::UNITS
                .iter()
                .map(|(name, factor)| format!("{},{}", name, factor))
                .collect::<Vec<_>>()
                .join(","),
            ":UNIT?" => state.units.clone(),
            ":AVER:COUN?" => state.averages.to_string(),
            ":SENS:AUTO?" => (if state.auto_range { "ON" } else { "OFF" }).to_string(),
            ":SENS?" => format!("{:.6} T", state.range),
            _ => {
                let (kind, axis) = head
                    .strip_prefix(":READ:ARR:")
                    .map(|a| ("read", a))
                    .or_else(|| head.strip_prefix(":FETC:ARR:").map(|a| ("fetch", a)))
                    .ok_or_else(|| Self::bad(command))?;
                let axis = axis.strip_suffix('?').ok_or_else(|| Self::bad(command))?;
                let mut arguments = argument.split(',');
                let count: usize = arguments
                    .next()
                    .and_then(|c| c.parse().ok())
                    .ok_or_else(|| Self::bad(command))?;
                let digits: usize = arguments
                    .last()
                    .and_then(|d| d.parse().ok())
                    .ok_or_else(|| Self::bad(command))?;

                let samples: Vec<FieldVector> = if kind == "read" {
                    let units = state.units.clone();
                    drop(state);
                    let field = self.field();
                    let value = Self::component(&field, axis).ok_or_else(|| Self::bad(command))?;
                    return Ok(Self::format_values(&[value * scale], digits, &units));
                } else {
                    state.buffer.iter().take(count).cloned().collect()
                };
                let values = samples
                    .iter()
                    .map(|f| Self::component(f, axis).map(|v| v * scale))
                    .collect::<Option<Vec<f64>>>()
                    .ok_or_else(|| Self::bad(command))?;
                Self::format_values(&values, digits, &state.units)
            }
        };
        Ok(answer)
    }
}

// =============================================================================
// Rig
// =============================================================================

/// A complete simulated bench built from the settings.
pub struct SimRig {
    /// Devices for the scan engine
    pub registry: DeviceRegistry,
    /// Shared kinematics
    pub world: Arc<SimWorld>,
    /// Encoder card, for fault injection
    pub encoder: Arc<SimEncoderDriver>,
    /// Probe link, for inspection
    pub probe: SimProbeTransport,
    /// Probe driver running on the link
    pub instrument: Arc<MetrolabProbe>,
}

impl SimRig {
    /// Build every configured axis, encoder channel and the probe.
    pub async fn build(settings: &Settings) -> AppResult<Self> {
        let world = Arc::new(SimWorld::new(settings.simulation.time_scale));
        for axis in settings.axes.values() {
            world.add_axis(axis.id, axis.variant, axis.scale_factor, axis.max_speed);
        }

        let mut registry = DeviceRegistry::new();
        McLennanAxis::register_all(
            &mut registry,
            settings,
            shared(SimController::new(world.clone())),
        )?;

        let encoder = Arc::new(SimEncoderDriver::new(world.clone()));
        for (axis_name, channel) in &settings.encoder.channels {
            let canonical = settings.resolve_axis(axis_name)?;
            let axis = settings.axes.get(canonical).ok_or_else(|| {
                DaqError::Configuration(format!("can't find axis '{}'", axis_name))
            })?;
            encoder.attach(*channel, axis.id);
        }
        initialize_card(encoder.as_ref(), settings.encoder.manual_id)?;
        EncoderAxis::register_all(&mut registry, settings, encoder.clone())?;

        let component = |name: &str| {
            settings
                .resolve_axis(name)
                .ok()
                .and_then(|canonical| settings.axes.get(canonical))
                .map(|axis| axis.id)
        };
        let probe = SimProbeTransport::new(
            world.clone(),
            [component("x"), component("y"), component("z")],
            settings.simulation.clone(),
        );
        let instrument = Arc::new(MetrolabProbe::connect(Box::new(probe.clone())).await?);
        instrument.apply_settings(&settings.probe).await?;
        registry.set_instrument(instrument.clone());

        info!(
            axes = ?registry.axis_names(),
            time_scale = settings.simulation.time_scale,
            "simulated rig ready"
        );
        Ok(Self {
            registry,
            world,
            encoder,
            probe,
            instrument,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{FieldInstrument, MotionAxis, MoveOptions, TriggerEncoder, TriggerSource};

    fn fast_settings() -> Settings {
        let mut settings = Settings::default();
        settings.simulation.time_scale = 50.0;
        settings.simulation.noise_t = 0.0;
        settings.timing.poll_interval_ms = 2;
        settings
    }

    #[test]
    fn test_world_answers_protocol_per_variant() {
        let world = SimWorld::new(1.0);
        world.add_axis(3, ProtocolVariant::Pm304, 1000.0, 30.0);
        world.add_axis(2, ProtocolVariant::Pm341, 2000.0, 2.0);

        assert_eq!(world.command("3cp1200").unwrap(), vec!["OK"]);
        assert_eq!(world.command("3ap1200").unwrap(), vec!["OK"]);
        assert_eq!(world.command("3oc").unwrap(), vec!["CP=1200"]);
        assert_eq!(world.command("3oa").unwrap(), vec!["AP=1200"]);
        assert_eq!(world.command("2oc").unwrap(), vec!["02#0"]);
        assert_eq!(world.command("2xx").unwrap(), vec!["02#! invalid command"]);
        assert!(world.command("7oc").is_none());
    }

    #[test]
    fn test_world_report_parses() {
        let world = SimWorld::new(1.0);
        world.add_axis(2, ProtocolVariant::Pm341, 2000.0, 2.0);
        let lines = world.command("2qa").unwrap();
        let report = crate::hardware::mclennan::parse_query_all(&lines[1..]);
        assert_eq!(report["address"].as_int(), Some(2));
        assert_eq!(report["slew speed"].as_int(), Some(4000));
        assert_eq!(report["soft limits"].as_flag(), Some(false));
    }

    #[tokio::test]
    async fn test_axis_moves_at_constant_velocity() {
        let rig = SimRig::build(&fast_settings()).await.unwrap();
        let z = rig.registry.axis("z").unwrap();
        z.move_to(-5.0, MoveOptions::wait(0.001)).await.unwrap();
        assert_eq!(z.get_position(false).await.unwrap(), -5.0);
        assert_eq!(rig.world.position(3), Some(-5.0));
        assert_eq!(z.get_speed().await.unwrap(), 30.0);
    }

    #[tokio::test]
    async fn test_encoder_comparator_fires_when_passed() {
        let rig = SimRig::build(&fast_settings()).await.unwrap();
        let z = rig.registry.axis("z").unwrap();
        let encoder = rig.registry.encoder_for("z").unwrap();

        z.set_speed(Some(0.5)).await.unwrap();
        encoder.set_position(0.0).await.unwrap();
        z.move_to(2.0, MoveOptions::no_wait()).await.unwrap();
        encoder.wait_for_position(1000, 2000).await.unwrap();
        let counter = encoder.get_position().await.unwrap();
        assert!(counter >= 1000.0, "counter {}", counter);

        rig.encoder.fail_next_waits(1);
        let err = encoder.wait_for_position(1500, 2000).await.unwrap_err();
        assert!(matches!(err, DaqError::DeviceTimeout { .. }));
    }

    #[test]
    fn test_card_loads_config_only_after_initial() {
        let driver = SimEncoderDriver::new(Arc::new(SimWorld::new(1.0)));
        assert_eq!(driver.config_from_file(), CARD_NOT_INITIAL);
        assert!(initialize_card(&driver, 0).is_ok());
        assert_eq!(driver.config_from_file(), 0);
    }

    #[tokio::test]
    async fn test_probe_buffers_triggered_samples() {
        let rig = SimRig::build(&fast_settings()).await.unwrap();
        let probe = rig.registry.instrument().unwrap();
        assert_eq!(probe.units().await.unwrap(), "MT");

        probe.abort_trigger().await.unwrap();
        probe.arm_trigger(TriggerSource::Bus, 2).await.unwrap();
        probe.assert_trigger().await.unwrap();
        probe.assert_trigger().await.unwrap();
        let samples = probe.fetch_buffered(2, 5).await.unwrap();

        assert_eq!(rig.probe.triggers(), 2);
        // At the origin the simulated field is purely axial at its peak.
        assert!((samples[0].z - 50.0).abs() < 1e-3, "{:?}", samples[0]);
        assert!(samples[0].x.abs() < 1e-9);
    }
}
