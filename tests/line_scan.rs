mod common;

use common::{Bench, Call};
use field_mapper::core::ScanRange;
use field_mapper::error::DaqError;
use field_mapper::scan::{LineScanEngine, LineScanParams, ScanMode, ScanStatus};

fn z_range() -> ScanRange {
    ScanRange::new(-10.0, 0.0, 0.5).unwrap()
}

fn engine(bench: &Bench, range: ScanRange, mode: ScanMode) -> LineScanEngine {
    LineScanEngine::new(&bench.registry, "z", range, mode, LineScanParams::default()).unwrap()
}

#[tokio::test]
async fn test_on_the_fly_takes_one_sample_per_position() {
    let bench = Bench::new(true);
    let mut engine = engine(&bench, z_range(), ScanMode::Auto);
    assert_eq!(engine.mode(), ScanMode::OnTheFly);

    let line = engine.run().await.unwrap();
    assert_eq!(line.positions.len(), 21);
    assert_eq!(line.fields.len(), 21);
    assert_eq!(line.positions[0].value, -10.0);
    assert_eq!(line.positions[20].value, 0.0);
    assert_eq!(line.mode, ScanMode::OnTheFly);
    assert_eq!(line.field_units, "MT");
    assert_eq!(line.attempts, 1);
    assert_eq!(engine.session().status, ScanStatus::Complete);
    assert_eq!(engine.session().triggers_asserted, 21);

    let waits: Vec<i64> = bench
        .log
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::WaitForPosition(t) => Some(t),
            _ => None,
        })
        .collect();
    assert_eq!(waits.len(), 20);
    assert_eq!(waits[0], -9500);
    assert_eq!(waits[19], 0);
}

#[tokio::test]
async fn test_every_trigger_precedes_the_fetch() {
    let bench = Bench::new(true);
    engine(&bench, z_range(), ScanMode::OnTheFly)
        .run()
        .await
        .unwrap();

    let calls = bench.log.calls();
    let arm = calls.iter().position(|c| *c == Call::Arm(21)).unwrap();
    let fetch = calls.iter().position(|c| *c == Call::Fetch(21)).unwrap();
    let triggers: Vec<usize> = calls
        .iter()
        .enumerate()
        .filter(|(_, c)| **c == Call::Trigger)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(triggers.len(), 21);
    assert!(triggers.iter().all(|&i| arm < i && i < fetch));
    assert_eq!(calls[arm - 1], Call::Abort);
}

#[tokio::test]
async fn test_homes_then_sweeps_past_the_end_at_scan_speed() {
    let bench = Bench::new(true);
    let mut scan = engine(&bench, z_range(), ScanMode::OnTheFly);
    assert_eq!(scan.scan_speed(), 2.5);
    scan.run().await.unwrap();

    let calls = bench.log.calls();
    let moves: Vec<&Call> = calls
        .iter()
        .filter(|c| matches!(c, Call::Move { .. }))
        .collect();
    assert_eq!(
        moves,
        vec![
            &Call::Move {
                axis: "hp z".to_string(),
                target: -10.0,
                wait: true
            },
            &Call::Move {
                axis: "hp z".to_string(),
                target: 0.1,
                wait: false
            },
        ]
    );

    let speeds: Vec<Option<f64>> = calls
        .iter()
        .filter_map(|c| match c {
            Call::SetSpeed { speed, .. } => Some(*speed),
            _ => None,
        })
        .collect();
    assert_eq!(speeds, vec![None, Some(2.5), None]);
    assert!(calls.contains(&Call::Preload(-10000.0)));
}

#[tokio::test]
async fn test_scan_speed_capped_at_axis_maximum() {
    let bench = Bench::with_max_speed(true, 2.0);
    let engine = engine(&bench, z_range(), ScanMode::OnTheFly);
    assert_eq!(engine.scan_speed(), 2.0);
}

#[tokio::test]
async fn test_missed_trigger_raised_before_waiting() {
    let bench = Bench::new(true);
    bench.encoder.script_readings(&[-9000.0]);
    let mut engine = engine(&bench, z_range(), ScanMode::OnTheFly);

    let err = engine.run().await.unwrap_err();
    match err {
        DaqError::MissedTrigger { target, current } => {
            assert_eq!(target, -9500);
            assert_eq!(current, -9000.0);
        }
        other => panic!("expected a missed trigger, got {other}"),
    }
    assert_eq!(engine.session().status, ScanStatus::MissedTrigger);
    assert_eq!(
        bench
            .log
            .count(|c| matches!(c, Call::WaitForPosition(_))),
        0
    );
    assert_eq!(bench.log.count(|c| matches!(c, Call::Fetch(_))), 0);
    assert_eq!(bench.log.calls().last(), Some(&Call::Stop { axis: "hp z".to_string() }));
}

#[tokio::test]
async fn test_reading_on_target_is_not_a_miss() {
    let bench = Bench::new(true);
    bench.encoder.script_readings(&[-9500.0]);
    let line = engine(&bench, z_range(), ScanMode::OnTheFly)
        .run()
        .await
        .unwrap();
    assert_eq!(line.len(), 21);
}

#[tokio::test]
async fn test_descending_range() {
    let bench = Bench::new(true);
    let range = ScanRange::new(0.0, -2.0, -0.5).unwrap();
    let line = engine(&bench, range, ScanMode::OnTheFly)
        .run()
        .await
        .unwrap();
    assert_eq!(line.len(), 5);
    assert!(bench.log.calls().contains(&Call::Move {
        axis: "hp z".to_string(),
        target: -2.1,
        wait: false
    }));
}

#[tokio::test]
async fn test_point_by_point_never_touches_the_encoder() {
    let bench = Bench::new(true);
    let mut engine = engine(&bench, z_range(), ScanMode::PointByPoint);
    let line = engine.run().await.unwrap();
    assert_eq!(line.len(), 21);
    assert_eq!(line.mode, ScanMode::PointByPoint);

    assert_eq!(
        bench.log.count(|c| matches!(
            c,
            Call::Preload(_) | Call::ReadEncoder | Call::WaitForPosition(_)
        )),
        0
    );
    assert_eq!(
        bench
            .log
            .count(|c| matches!(c, Call::Move { wait: true, .. })),
        21
    );
    assert_eq!(bench.log.count(|c| *c == Call::Trigger), 21);
}

#[tokio::test]
async fn test_mode_resolution_without_encoder() {
    let bench = Bench::new(false);
    let auto = engine(&bench, z_range(), ScanMode::Auto);
    assert_eq!(auto.mode(), ScanMode::PointByPoint);

    let forced = LineScanEngine::new(
        &bench.registry,
        "z",
        z_range(),
        ScanMode::OnTheFly,
        LineScanParams::default(),
    );
    assert!(matches!(forced, Err(DaqError::Configuration(_))));
}

#[tokio::test]
async fn test_single_point_line_is_taken_at_rest() {
    let bench = Bench::new(true);
    let line = engine(&bench, ScanRange::single(-3.0), ScanMode::OnTheFly)
        .run()
        .await
        .unwrap();
    assert_eq!(line.len(), 1);
    assert_eq!(bench.log.count(|c| matches!(c, Call::Preload(_))), 0);
    assert_eq!(bench.log.count(|c| *c == Call::Trigger), 1);
}

#[tokio::test]
async fn test_failed_wait_stops_the_axis() {
    let bench = Bench::new(true);
    bench.encoder.fail_waits(1);
    let err = engine(&bench, z_range(), ScanMode::OnTheFly)
        .run()
        .await
        .unwrap_err();
    assert!(matches!(err, DaqError::DeviceTimeout { .. }));
    assert!(err.is_retryable());
    assert_eq!(
        bench.log.count(|c| matches!(c, Call::Stop { .. })),
        1
    );
}

#[tokio::test]
async fn test_line_longer_than_probe_buffer_is_rejected_up_front() {
    let bench = Bench::new(true);
    *bench.probe.capacity.lock().unwrap() = Some(20);

    let err = LineScanEngine::new(
        &bench.registry,
        "z",
        z_range(),
        ScanMode::OnTheFly,
        LineScanParams::default(),
    )
    .err()
    .unwrap();
    assert!(matches!(err, DaqError::Configuration(_)));
    assert!(bench.log.calls().is_empty());

    let fits = ScanRange::new(-9.5, 0.0, 0.5).unwrap();
    let line = engine(&bench, fits, ScanMode::OnTheFly).run().await.unwrap();
    assert_eq!(line.len(), 20);
}
