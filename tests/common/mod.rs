//! Fake devices shared by the integration tests.
//!
//! Every fake appends to one [`CallLog`] so tests can assert on the relative
//! order of axis, encoder and probe calls.

#![allow(dead_code)]

use async_trait::async_trait;
use field_mapper::core::FieldVector;
use field_mapper::error::{AppResult, DaqError};
use field_mapper::export::SweepSink;
use field_mapper::hardware::{
    CompareMethod, ComparingSource, DeviceRegistry, FieldInstrument, MotionAxis, MoveOptions,
    TriggerEncoder, TriggerSource,
};
use field_mapper::scan::{GridCell, LineScanResult, OperatorPrompt};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// One observed device call.
#[derive(Clone, Debug, PartialEq)]
pub enum Call {
    Move { axis: String, target: f64, wait: bool },
    SetSpeed { axis: String, speed: Option<f64> },
    Stop { axis: String },
    Preload(f64),
    ReadEncoder,
    WaitForPosition(i64),
    Abort,
    Arm(usize),
    Trigger,
    Fetch(usize),
}

/// Ordered record of calls across all fakes.
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<Call>>>);

impl CallLog {
    pub fn push(&self, call: Call) {
        self.0.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| predicate(c)).count()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

/// Axis that arrives instantly.
pub struct FakeAxis {
    pub name: String,
    pub scale_factor: f64,
    pub max_speed: f64,
    pub position: Mutex<f64>,
    log: CallLog,
}

impl FakeAxis {
    pub fn new(name: &str, scale_factor: f64, max_speed: f64, log: &CallLog) -> Self {
        Self {
            name: name.to_string(),
            scale_factor,
            max_speed,
            position: Mutex::new(0.0),
            log: log.clone(),
        }
    }
}

#[async_trait]
impl MotionAxis for FakeAxis {
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
        "mm"
    }

    async fn move_to(&self, target: f64, options: MoveOptions) -> AppResult<()> {
        self.log.push(Call::Move {
            axis: self.name.clone(),
            target,
            wait: options.wait,
        });
        *self.position.lock().unwrap() = target;
        Ok(())
    }

    async fn set_speed(&self, speed: Option<f64>) -> AppResult<()> {
        self.log.push(Call::SetSpeed {
            axis: self.name.clone(),
            speed,
        });
        Ok(())
    }

    async fn get_speed(&self) -> AppResult<f64> {
        Ok(self.max_speed)
    }

    async fn get_position(&self, _set_value: bool) -> AppResult<f64> {
        Ok(*self.position.lock().unwrap())
    }

    async fn stop(&self) -> AppResult<()> {
        self.log.push(Call::Stop {
            axis: self.name.clone(),
        });
        Ok(())
    }

    async fn reset_position(&self, position: f64) -> AppResult<()> {
        *self.position.lock().unwrap() = position;
        Ok(())
    }

    async fn set_limits(&self, _limits: Option<(f64, f64)>) -> AppResult<()> {
        Ok(())
    }

    async fn get_limits(&self) -> AppResult<Option<(f64, f64)>> {
        Ok(None)
    }
}

/// Encoder whose counter jumps to each comparator target when waited on.
///
/// `readings` overrides the next counter reads; `failing_waits` makes the
/// next waits time out.
#[derive(Default)]
pub struct FakeEncoder {
    pub counter: Mutex<f64>,
    pub readings: Mutex<VecDeque<f64>>,
    pub failing_waits: Mutex<u32>,
    log: CallLog,
}

impl FakeEncoder {
    pub fn new(log: &CallLog) -> Self {
        Self {
            log: log.clone(),
            ..Self::default()
        }
    }

    pub fn script_readings(&self, readings: &[f64]) {
        self.readings.lock().unwrap().extend(readings);
    }

    pub fn fail_waits(&self, count: u32) {
        *self.failing_waits.lock().unwrap() = count;
    }
}

#[async_trait]
impl TriggerEncoder for FakeEncoder {
    async fn set_position(&self, steps: f64) -> AppResult<()> {
        self.log.push(Call::Preload(steps));
        *self.counter.lock().unwrap() = steps;
        Ok(())
    }

    async fn get_position(&self) -> AppResult<f64> {
        self.log.push(Call::ReadEncoder);
        let scripted = self.readings.lock().unwrap().pop_front();
        Ok(scripted.unwrap_or(*self.counter.lock().unwrap()))
    }

    async fn set_trigger_comparator(
        &self,
        _source: ComparingSource,
        _method: CompareMethod,
        _target: i64,
    ) -> AppResult<()> {
        Ok(())
    }

    async fn wait_for_interrupt(&self, _factor_bit: u32, timeout_ms: u64) -> AppResult<()> {
        let mut failing = self.failing_waits.lock().unwrap();
        if *failing > 0 {
            *failing -= 1;
            return Err(DaqError::timeout("fake encoder", "comparator", timeout_ms));
        }
        Ok(())
    }

    async fn wait_for_position(&self, target: i64, timeout_ms: u64) -> AppResult<()> {
        self.log.push(Call::WaitForPosition(target));
        self.wait_for_interrupt(12, timeout_ms).await?;
        *self.counter.lock().unwrap() = target as f64;
        Ok(())
    }
}

/// Probe that returns one sample per trigger, `z` holding the trigger index.
///
/// `capacity` bounds the buffer when set.
#[derive(Default)]
pub struct FakeProbe {
    pub triggers: Mutex<usize>,
    pub reject_arm: Mutex<bool>,
    pub capacity: Mutex<Option<usize>>,
    log: CallLog,
}

impl FakeProbe {
    pub fn new(log: &CallLog) -> Self {
        Self {
            log: log.clone(),
            ..Self::default()
        }
    }
}

#[async_trait]
impl FieldInstrument for FakeProbe {
    async fn abort_trigger(&self) -> AppResult<()> {
        self.log.push(Call::Abort);
        *self.triggers.lock().unwrap() = 0;
        Ok(())
    }

    async fn arm_trigger(&self, _source: TriggerSource, count: usize) -> AppResult<()> {
        self.log.push(Call::Arm(count));
        if *self.reject_arm.lock().unwrap() {
            return Err(DaqError::OutOfRange(format!("trigger count {}", count)));
        }
        Ok(())
    }

    async fn assert_trigger(&self) -> AppResult<()> {
        self.log.push(Call::Trigger);
        *self.triggers.lock().unwrap() += 1;
        Ok(())
    }

    async fn fetch_buffered(&self, count: usize, _digits: u8) -> AppResult<Vec<FieldVector>> {
        self.log.push(Call::Fetch(count));
        let taken = *self.triggers.lock().unwrap();
        Ok((0..count.min(taken))
            .map(|i| FieldVector::new(0.0, 0.0, i as f64))
            .collect())
    }

    async fn units(&self) -> AppResult<String> {
        Ok("MT".to_string())
    }

    fn buffer_capacity(&self) -> usize {
        self.capacity.lock().unwrap().unwrap_or(usize::MAX)
    }
}

/// Primary axis "hp z" (1000 steps/mm, 30 mm/s), outer axes "hp x" and
/// "hp y", and a probe; the encoder on z is optional.
pub struct Bench {
    pub registry: DeviceRegistry,
    pub log: CallLog,
    pub z: Arc<FakeAxis>,
    pub encoder: Arc<FakeEncoder>,
    pub probe: Arc<FakeProbe>,
}

impl Bench {
    pub fn new(with_encoder: bool) -> Self {
        Self::with_max_speed(with_encoder, 30.0)
    }

    pub fn with_max_speed(with_encoder: bool, max_speed: f64) -> Self {
        let log = CallLog::default();
        let z = Arc::new(FakeAxis::new("hp z", 1000.0, max_speed, &log));
        let encoder = Arc::new(FakeEncoder::new(&log));
        let probe = Arc::new(FakeProbe::new(&log));

        let mut registry = DeviceRegistry::new();
        registry.add_axis(z.clone());
        registry.add_axis(Arc::new(FakeAxis::new("hp x", 2000.0, 2.0, &log)));
        registry.add_axis(Arc::new(FakeAxis::new("hp y", 2000.0, 6.0, &log)));
        registry.add_alias("z", "hp z").unwrap();
        registry.add_alias("x", "hp x").unwrap();
        registry.add_alias("y", "hp y").unwrap();
        if with_encoder {
            registry.add_encoder("hp z", encoder.clone()).unwrap();
        }
        registry.set_instrument(probe.clone());

        Self {
            registry,
            log,
            z,
            encoder,
            probe,
        }
    }
}

/// Prompt answering from a script, `true` once the script runs out.
#[derive(Default)]
pub struct ScriptedPrompt {
    answers: Mutex<VecDeque<bool>>,
    pub asked: Mutex<Vec<u32>>,
}

impl ScriptedPrompt {
    pub fn answering(answers: &[bool]) -> Self {
        Self {
            answers: Mutex::new(answers.iter().copied().collect()),
            asked: Mutex::new(Vec::new()),
        }
    }

    pub fn asked(&self) -> Vec<u32> {
        self.asked.lock().unwrap().clone()
    }
}

#[async_trait]
impl OperatorPrompt for ScriptedPrompt {
    async fn confirm_retry(&self, failures: u32, _error: &DaqError) -> bool {
        self.asked.lock().unwrap().push(failures);
        self.answers.lock().unwrap().pop_front().unwrap_or(true)
    }
}

/// Sink keeping every line in memory.
#[derive(Default)]
pub struct MemorySink {
    pub lines: Vec<(GridCell, LineScanResult)>,
    pub finished: bool,
}

#[async_trait]
impl SweepSink for MemorySink {
    async fn write_line(&mut self, cell: &GridCell, line: &LineScanResult) -> AppResult<()> {
        self.lines.push((cell.clone(), line.clone()));
        Ok(())
    }

    async fn finish(&mut self) -> AppResult<()> {
        self.finished = true;
        Ok(())
    }
}
