mod common;

use async_trait::async_trait;
use common::{Bench, Call, FakeEncoder, MemorySink, ScriptedPrompt};
use field_mapper::core::ScanRange;
use field_mapper::error::{AppResult, DaqError};
use field_mapper::export::SweepSink;
use field_mapper::scan::{
    GridCell, GridSweep, LineScanParams, LineScanResult, RetryPolicy, ScanMode,
};
use std::sync::Arc;

fn grid(bench: &Bench, outer: Vec<(String, ScanRange)>) -> GridSweep {
    GridSweep::new(
        bench.registry.clone(),
        "z",
        ScanRange::new(-2.0, 0.0, 0.5).unwrap(),
        outer,
        ScanMode::Auto,
        LineScanParams::default(),
        RetryPolicy::default(),
    )
    .unwrap()
}

#[tokio::test]
async fn test_lines_cover_the_grid_in_order() {
    let bench = Bench::new(true);
    let sweep = grid(
        &bench,
        vec![
            ("x".to_string(), ScanRange::new(-0.5, 0.5, 0.5).unwrap()),
            ("y".to_string(), ScanRange::single(1.0)),
        ],
    );
    let mut sink = MemorySink::default();
    let prompt = ScriptedPrompt::default();

    let summary = sweep.run(&mut sink, &prompt).await.unwrap();
    assert_eq!(summary.lines, 3);
    assert_eq!(summary.samples, 15);
    assert_eq!(summary.retried_failures, 0);
    assert!(sink.finished);

    let xs: Vec<f64> = sink.lines.iter().map(|(cell, _)| cell.coords[0].value).collect();
    assert_eq!(xs, vec![-0.5, 0.0, 0.5]);
    assert!(sink
        .lines
        .iter()
        .all(|(cell, line)| cell.coords[1].value == 1.0 && line.len() == 5));

    // The fixed axis is moved once, the outer axis once per line.
    let y_moves = bench.log.count(|c| matches!(c, Call::Move { axis, .. } if axis == "hp y"));
    let x_moves = bench.log.count(|c| matches!(c, Call::Move { axis, wait: true, .. } if axis == "hp x"));
    assert_eq!(y_moves, 1);
    assert_eq!(x_moves, 3);
    assert!(prompt.asked().is_empty());
}

#[tokio::test]
async fn test_six_missed_triggers_prompt_exactly_once() {
    let bench = Bench::new(true);
    // The stage reads as already past the first comparator target six times.
    bench.encoder.script_readings(&[0.0; 6]);
    let sweep = grid(&bench, vec![]);
    let mut sink = MemorySink::default();
    let prompt = ScriptedPrompt::default();

    let summary = sweep.run(&mut sink, &prompt).await.unwrap();
    assert_eq!(prompt.asked(), vec![5]);
    assert_eq!(summary.retried_failures, 6);
    assert_eq!(sink.lines.len(), 1);
    assert_eq!(sink.lines[0].1.attempts, 7);
    // Misses are raised before waiting, so only the seventh attempt waits.
    assert_eq!(bench.log.count(|c| matches!(c, Call::WaitForPosition(_))), 4);
    // Each failed attempt homes again and is stopped by both the engine and the grid.
    assert_eq!(bench.log.count(|c| *c == Call::Arm(5)), 7);
    assert_eq!(bench.log.count(|c| matches!(c, Call::Stop { .. })), 12);
}

#[tokio::test]
async fn test_six_timeouts_prompt_exactly_once() {
    let bench = Bench::new(true);
    bench.encoder.fail_waits(6);
    let sweep = grid(&bench, vec![]);
    let mut sink = MemorySink::default();
    let prompt = ScriptedPrompt::default();

    let summary = sweep.run(&mut sink, &prompt).await.unwrap();
    assert_eq!(prompt.asked(), vec![5]);
    assert_eq!(summary.retried_failures, 6);
    assert_eq!(sink.lines[0].1.attempts, 7);
}

#[tokio::test]
async fn test_declined_retry_aborts_with_last_error() {
    let bench = Bench::new(true);
    bench.encoder.fail_waits(100);
    let sweep = grid(
        &bench,
        vec![("x".to_string(), ScanRange::new(0.0, 1.0, 1.0).unwrap())],
    );
    let mut sink = MemorySink::default();
    let prompt = ScriptedPrompt::answering(&[false]);

    let err = sweep.run(&mut sink, &prompt).await.unwrap_err();
    assert!(matches!(err, DaqError::DeviceTimeout { .. }));
    assert_eq!(prompt.asked(), vec![5]);
    assert_eq!(bench.log.count(|c| *c == Call::Arm(5)), 5);
    assert!(sink.lines.is_empty());
    assert!(sink.finished);
}

#[tokio::test]
async fn test_confirmation_repeats_every_threshold() {
    let bench = Bench::new(true);
    bench.encoder.fail_waits(11);
    let sweep = grid(&bench, vec![]);
    let mut sink = MemorySink::default();
    let prompt = ScriptedPrompt::default();

    sweep.run(&mut sink, &prompt).await.unwrap();
    assert_eq!(prompt.asked(), vec![5, 10]);
    assert_eq!(sink.lines[0].1.attempts, 12);
}

#[tokio::test]
async fn test_non_retryable_errors_abort_immediately() {
    let bench = Bench::new(true);
    *bench.probe.reject_arm.lock().unwrap() = true;
    let sweep = grid(&bench, vec![]);
    let mut sink = MemorySink::default();
    let prompt = ScriptedPrompt::default();

    let err = sweep.run(&mut sink, &prompt).await.unwrap_err();
    assert!(matches!(err, DaqError::OutOfRange(_)));
    assert!(prompt.asked().is_empty());
    assert_eq!(bench.log.count(|c| matches!(c, Call::Arm(_))), 1);
    assert!(sink.finished);
}

#[tokio::test]
async fn test_missed_triggers_are_retried() {
    let bench = Bench::new(true);
    bench.encoder.script_readings(&[0.0]);
    let sweep = grid(&bench, vec![]);
    let mut sink = MemorySink::default();
    let prompt = ScriptedPrompt::default();

    let summary = sweep.run(&mut sink, &prompt).await.unwrap();
    assert_eq!(summary.retried_failures, 1);
    assert_eq!(sink.lines[0].1.fields.len(), 5);
}

/// Breaks the encoder once the first line has been written.
struct FaultAfterFirstLine {
    inner: MemorySink,
    encoder: Arc<FakeEncoder>,
}

#[async_trait]
impl SweepSink for FaultAfterFirstLine {
    async fn write_line(&mut self, cell: &GridCell, line: &LineScanResult) -> AppResult<()> {
        self.encoder.fail_waits(100);
        self.inner.write_line(cell, line).await
    }

    async fn finish(&mut self) -> AppResult<()> {
        self.inner.finish().await
    }
}

#[tokio::test]
async fn test_completed_lines_survive_an_abort() {
    let bench = Bench::new(true);
    let sweep = grid(
        &bench,
        vec![("x".to_string(), ScanRange::new(0.0, 2.0, 1.0).unwrap())],
    );
    let mut sink = FaultAfterFirstLine {
        inner: MemorySink::default(),
        encoder: bench.encoder.clone(),
    };
    let prompt = ScriptedPrompt::answering(&[false]);

    let err = sweep.run(&mut sink, &prompt).await.unwrap_err();
    assert!(matches!(err, DaqError::DeviceTimeout { .. }));
    assert_eq!(sink.inner.lines.len(), 1);
    assert_eq!(sink.inner.lines[0].0.coords[0].value, 0.0);
    assert!(sink.inner.finished);
}
