//! Integration tests for the synchronized source/load sweep.
//!
//! These drive the efficiency sweep through the service boundary against the
//! simulated bench and check step ordering, arming order, timeouts and
//! session release on failure.

use pmic_bench::hardware::simulated::{Call, ErrorConfig, ErrorScenario, Operation};
use pmic_bench::hardware::SimulatedBench;
use pmic_bench::procedures::efficiency::EfficiencyParams;
use pmic_bench::procedures::STATUS_MEASURED;
use pmic_bench::{BenchError, Invocation, MeasureRequest, ModeOfOperation, Outputs, Report};
use std::time::Duration;
use tracing_test::traced_test;

const TEARDOWN: [Call; 4] = [Call::Abort, Call::DisableOutput, Call::Reset, Call::Close];

fn last_position(bench: &SimulatedBench, resource: &str, call: &Call) -> Option<usize> {
    bench
        .journal()
        .iter()
        .rposition(|entry| entry.resource == resource && &entry.call == call)
}

fn efficiency(params: EfficiencyParams) -> MeasureRequest {
    MeasureRequest::Efficiency(params)
}

// =============================================================================
// Step ordering
// =============================================================================

#[tokio::test]
async fn test_efficiency_yields_one_partial_per_step() {
    let bench = SimulatedBench::new();
    let mut invocation = Invocation::new(
        &bench,
        ModeOfOperation::Measure,
        efficiency(EfficiencyParams::default()),
    );

    let mut partials = 0;
    let mut last = None;
    while let Some(report) = invocation.next().await {
        match report.unwrap() {
            Report::Partial(Outputs::Efficiency(outputs)) => {
                assert_eq!(outputs.summary, None);
                partials += 1;
            }
            Report::Partial(other) => panic!("unexpected partial {:?}", other),
            report @ Report::Final(_) => last = Some(report),
        }
    }
    assert_eq!(partials, 40);

    let outputs = match last {
        Some(Report::Final(Outputs::Efficiency(outputs))) => outputs,
        other => panic!("unexpected final report {:?}", other),
    };
    assert_eq!(outputs.status, STATUS_MEASURED);
    assert_eq!(outputs.source_sweep_points, 4);
    assert_eq!(outputs.load_sweep_points, 10);
    assert_eq!(outputs.voltage_values.len(), 4);
    assert_eq!(outputs.load_currents.len(), 40);

    // Inner sweep repeats for every source voltage.
    for block in outputs.load_currents.chunks(10) {
        assert_eq!(block, &outputs.load_currents[..10]);
    }
    assert!((outputs.load_currents[0] - 0.1).abs() < 1e-9);
    assert!((outputs.load_currents[9] - 24.0).abs() < 1e-9);

    for efficiency in &outputs.efficiency {
        assert!(*efficiency > 0.0 && *efficiency < 90.0, "efficiency {}", efficiency);
    }

    let summary = outputs.summary.expect("final report carries a summary");
    let mean_efficiency = outputs.efficiency.iter().sum::<f64>() / 40.0;
    assert!((summary.efficiency_pct - mean_efficiency).abs() < 1e-9);
    let lowest = outputs.load_voltages.iter().cloned().fold(f64::INFINITY, f64::min);
    let highest = outputs.load_voltages.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    assert!((summary.peak_to_peak - (highest - lowest)).abs() < 1e-9);
    assert_eq!(bench.open_sessions(), 0);
}

#[tokio::test]
async fn test_source_samples_follow_outer_sweep() {
    let bench = SimulatedBench::new();
    let params = EfficiencyParams {
        source_start_voltage: 6.0,
        source_stop_voltage: 12.0,
        source_voltage_sweep_points: 2,
        load_start_current: 1.0,
        load_stop_current: 3.0,
        load_current_sweep_points: 3,
        ..EfficiencyParams::default()
    };
    let plan = params.plan().unwrap();
    let steps = pmic_bench::procedures::engine::start_sweep(&bench, &plan)
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();

    let source_voltages: Vec<f64> = steps.iter().map(|p| p.metrics.source.voltage).collect();
    assert_eq!(source_voltages, vec![6.0, 6.0, 6.0, 12.0, 12.0, 12.0]);
    let load_currents: Vec<f64> = steps.iter().map(|p| p.metrics.load_current).collect();
    assert_eq!(load_currents, vec![1.0, 2.0, 3.0, 1.0, 2.0, 3.0]);
    let indices: Vec<usize> = steps.iter().map(|p| p.step).collect();
    assert_eq!(indices, (1..=6).collect::<Vec<_>>());
}

// =============================================================================
// Arming order and teardown
// =============================================================================

#[tokio::test]
async fn test_load_is_armed_before_source() {
    let bench = SimulatedBench::new();
    Invocation::new(
        &bench,
        ModeOfOperation::Measure,
        efficiency(EfficiencyParams::default()),
    )
    .run_to_completion()
    .await
    .unwrap();

    let load = last_position(&bench, "E-load", &Call::Initiate).unwrap();
    let source = last_position(&bench, "PPS", &Call::Initiate).unwrap();
    assert!(load < source, "load armed at {}, source started at {}", load, source);

    assert!(bench.calls("PPS").ends_with(&TEARDOWN));
    assert!(bench.calls("E-load").ends_with(&TEARDOWN));
    // Stage-wise: both channels abort before either is closed.
    let last_abort = last_position(&bench, "E-load", &Call::Abort).unwrap();
    let pps_close = last_position(&bench, "PPS", &Call::Close).unwrap();
    assert!(last_abort < pps_close);
}

#[tokio::test]
async fn test_load_listens_on_source_terminals() {
    let bench = SimulatedBench::new();
    let params = EfficiencyParams {
        source_voltage_sweep_points: 1,
        load_current_sweep_points: 1,
        ..EfficiencyParams::default()
    };
    let plan = params.plan().unwrap();
    let mut stream = pmic_bench::procedures::engine::start_sweep(&bench, &plan)
        .await
        .unwrap();

    let load = bench.channel("E-load", "0").unwrap();
    assert_eq!(
        load.source_trigger_input.unwrap().to_string(),
        "/PPS/Engine0/SourceTrigger"
    );
    assert_eq!(
        load.measure_trigger_input.unwrap().to_string(),
        "/PPS/Engine0/SourceCompleteEvent"
    );

    while let Some(step) = stream.next().await {
        step.unwrap();
    }
    assert_eq!(bench.open_sessions(), 0);
}

// =============================================================================
// Failure paths
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_stalled_load_times_out_and_releases() {
    let bench = SimulatedBench::new().with_faults(ErrorConfig::scenario(
        ErrorScenario::StallEvents {
            resource: "E-load".into(),
        },
    ));
    let params = EfficiencyParams {
        sequence_timeout: Duration::from_secs(2),
        ..EfficiencyParams::default()
    };
    let mut invocation = Invocation::new(&bench, ModeOfOperation::Measure, efficiency(params));

    let err = invocation.next().await.unwrap().unwrap_err();
    assert!(matches!(err, BenchError::HardwareTimeout(_)), "{}", err);
    assert!(invocation.next().await.is_none());

    assert!(bench.calls("PPS").contains(&Call::Close));
    assert!(bench.calls("E-load").contains(&Call::Close));
    assert_eq!(bench.open_sessions(), 0);
}

#[tokio::test]
async fn test_load_commit_fault_closes_every_session() {
    let bench = SimulatedBench::new().with_faults(ErrorConfig::scenario(ErrorScenario::Fail {
        resource: "E-load".into(),
        operation: Operation::Commit,
    }));
    let mut invocation = Invocation::new(
        &bench,
        ModeOfOperation::Measure,
        efficiency(EfficiencyParams::default()),
    );

    let err = invocation.next().await.unwrap().unwrap_err();
    assert!(matches!(err, BenchError::DriverFault(_)), "{}", err);
    assert!(invocation.next().await.is_none());

    assert!(bench.calls("PPS").contains(&Call::Close));
    assert!(bench.calls("E-load").contains(&Call::Close));
    assert!(bench.position("PPS", &Call::Initiate).is_some());
    assert_eq!(bench.open_sessions(), 0);
    // Recovery de-energized the source.
    assert_eq!(bench.channel("PPS", "0").unwrap().applied, None);
}

#[tokio::test]
#[traced_test]
async fn test_fetch_fault_mid_sweep_recovers() {
    let bench = SimulatedBench::new().with_faults(ErrorConfig::scenarios(vec![
        // Pre-energize reads nothing from the load, so the third fetch is
        // the third drained step.
        ErrorScenario::FailAfterN {
            resource: "E-load".into(),
            operation: Operation::Fetch,
            count: 2,
        },
        ErrorScenario::Fail {
            resource: "E-load".into(),
            operation: Operation::Reset,
        },
    ]));
    let mut invocation = Invocation::new(
        &bench,
        ModeOfOperation::Measure,
        efficiency(EfficiencyParams::default()),
    );

    let mut partials = 0;
    let mut failure = None;
    while let Some(report) = invocation.next().await {
        match report {
            Ok(_) => partials += 1,
            Err(err) => failure = Some(err),
        }
    }
    assert_eq!(partials, 2);
    assert!(matches!(failure, Some(BenchError::DriverFault(_))));
    assert_eq!(bench.open_sessions(), 0);
    assert!(logs_contain("recovery step failed"));
}

#[tokio::test]
async fn test_empty_sweep_is_rejected_before_hardware() {
    let bench = SimulatedBench::new();
    let params = EfficiencyParams {
        load_start_current: 5.0,
        load_stop_current: 1.0,
        ..EfficiencyParams::default()
    };
    let mut invocation = Invocation::new(&bench, ModeOfOperation::Measure, efficiency(params));
    let err = invocation.next().await.unwrap().unwrap_err();
    assert!(matches!(err, BenchError::Validation(_)));
    assert!(bench.journal().is_empty());
}
