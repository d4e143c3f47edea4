//! End-to-end tests for every bench procedure against the simulated bench.
//!
//! The default regulator model outputs
//! `3.3 + 0.0005 * (Vin - 12) - 0.002 * Iload` at 90 % conversion efficiency
//! plus 5 mA quiescent input current, with a 20 mV, 500 Hz ripple.

use pmic_bench::hardware::simulated::{Call, ErrorConfig, ErrorScenario, Operation};
use pmic_bench::hardware::SimulatedBench;
use pmic_bench::procedures::line_regulation::LineRegulationParams;
use pmic_bench::procedures::load_transient::LoadTransientParams;
use pmic_bench::procedures::output_accuracy::OutputAccuracyParams;
use pmic_bench::procedures::ripple::RippleParams;
use pmic_bench::procedures::STATUS_MEASURED;
use pmic_bench::service::TestKind;
use pmic_bench::{BenchError, Invocation, MeasureRequest, ModeOfOperation, Outputs, Report};

async fn run(bench: &SimulatedBench, request: MeasureRequest) -> (Vec<Outputs>, Outputs) {
    let mut invocation = Invocation::new(bench, ModeOfOperation::Measure, request);
    let mut partials = Vec::new();
    while let Some(report) = invocation.next().await {
        match report.unwrap() {
            Report::Partial(outputs) => partials.push(outputs),
            Report::Final(outputs) => {
                assert!(invocation.next().await.is_none());
                return (partials, outputs);
            }
        }
    }
    panic!("invocation ended without a final report");
}

// =============================================================================
// Single-point efficiency
// =============================================================================

#[tokio::test]
async fn test_single_point_efficiency() {
    let bench = SimulatedBench::new();
    let (partials, outputs) = run(&bench, MeasureRequest::defaults(TestKind::SinglePointEfficiency)).await;
    assert!(partials.is_empty());

    let outputs = match outputs {
        Outputs::SinglePointEfficiency(outputs) => outputs,
        other => panic!("unexpected outputs {:?}", other),
    };
    assert_eq!(outputs.status, STATUS_MEASURED);
    assert_eq!(outputs.load_current, 1.0);
    assert!((outputs.load_voltage - 3.298).abs() < 1e-9);
    assert!((outputs.load_voltage_deviation - (-0.2 / 3.3)).abs() < 1e-6);
    assert!(outputs.efficiency > 88.0 && outputs.efficiency < 89.0);
    assert_eq!(bench.open_sessions(), 0);
}

// =============================================================================
// Line regulation
// =============================================================================

#[tokio::test]
async fn test_line_regulation() {
    let bench = SimulatedBench::new();
    let (partials, outputs) = run(
        &bench,
        MeasureRequest::LineRegulation(LineRegulationParams::default()),
    )
    .await;
    assert_eq!(partials.len(), 10);

    let outputs = match outputs {
        Outputs::LineRegulation(outputs) => outputs,
        other => panic!("unexpected outputs {:?}", other),
    };
    assert_eq!(outputs.status, STATUS_MEASURED);
    let graph = &outputs.load_voltage_vs_source_voltage;
    assert_eq!(graph.len(), 10);
    assert_eq!(graph.x[0], 6.0);
    assert_eq!(graph.x[9], 20.0);
    assert!(graph.x.windows(2).all(|w| w[0] < w[1]));
    // Output rises with input at 0.5 mV/V.
    assert!(graph.y.windows(2).all(|w| w[0] < w[1]));
    assert!((outputs.load_voltage - 3.2985).abs() < 1e-9);
    assert_eq!(outputs.load_voltage_deviation_vs_source_voltage.x, graph.x);

    let summary = outputs.summary.expect("final report carries a summary");
    assert!((summary.deviation_pct - outputs.load_voltage_deviation).abs() < 1e-9);
    // 0.5 mV/V across 6 V to 20 V.
    assert!((summary.peak_to_peak - 0.007).abs() < 1e-9);
    assert!((summary.peak_to_peak - (graph.y[9] - graph.y[0])).abs() < 1e-12);
    assert!(summary.rms > 3.29 && summary.rms < 3.31);
    assert!(summary.efficiency_pct > 0.0 && summary.efficiency_pct < 90.0);
}

#[tokio::test]
async fn test_line_regulation_partials_accumulate() {
    let bench = SimulatedBench::new();
    let params = LineRegulationParams {
        points: 3,
        ..LineRegulationParams::default()
    };
    let (partials, _) = run(&bench, MeasureRequest::LineRegulation(params)).await;
    let lengths: Vec<usize> = partials
        .iter()
        .map(|outputs| match outputs {
            Outputs::LineRegulation(o) => o.load_voltage_vs_source_voltage.len(),
            other => panic!("unexpected outputs {:?}", other),
        })
        .collect();
    assert_eq!(lengths, vec![1, 2, 3]);
    assert!(partials.iter().all(|outputs| match outputs {
        Outputs::LineRegulation(o) => o.summary.is_none(),
        _ => false,
    }));
}

// =============================================================================
// Ripple
// =============================================================================

#[tokio::test]
async fn test_ripple_windows() {
    let bench = SimulatedBench::new();
    let (partials, outputs) = run(&bench, MeasureRequest::Ripple(RippleParams::default())).await;
    assert_eq!(partials.len(), 3);

    let outputs = match outputs {
        Outputs::Ripple(outputs) => outputs,
        other => panic!("unexpected outputs {:?}", other),
    };
    assert_eq!(outputs.status, STATUS_MEASURED);
    assert_eq!(outputs.supply_voltage, 10.0);
    assert!((outputs.load_voltage - 3.297).abs() < 1e-9);
    assert_eq!(outputs.load_current, -1.0);
    assert_eq!(outputs.ripple_graph.len(), 30_000);
    assert!((outputs.ripple_voltage_peak_to_peak - 0.04).abs() < 1e-9);
    assert!((outputs.ripple_voltage_rms - 0.02 / 2f64.sqrt()).abs() < 1e-6);

    let scope = bench.scope("Scope", "0").unwrap();
    assert!(!scope.open);
    let initiates = bench
        .calls("Scope")
        .iter()
        .filter(|call| **call == Call::Initiate)
        .count();
    assert_eq!(initiates, 3);
    assert_eq!(bench.open_sessions(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_ripple_fetch_fault_releases_supplies() {
    // sample_rate() is the first fetch-class call; the second window fails.
    let bench = SimulatedBench::new().with_faults(ErrorConfig::scenario(
        ErrorScenario::FailAfterN {
            resource: "Scope".into(),
            operation: Operation::Fetch,
            count: 2,
        },
    ));
    let mut invocation = Invocation::new(
        &bench,
        ModeOfOperation::Measure,
        MeasureRequest::Ripple(RippleParams::default()),
    );
    assert!(matches!(invocation.next().await, Some(Ok(Report::Partial(_)))));
    assert!(matches!(
        invocation.next().await,
        Some(Err(BenchError::DriverFault(_)))
    ));
    assert!(invocation.next().await.is_none());
    assert_eq!(bench.open_sessions(), 0);
    assert_eq!(bench.channel("PPS", "0").unwrap().applied, None);
}

// =============================================================================
// Output voltage accuracy
// =============================================================================

#[tokio::test]
async fn test_output_accuracy() {
    let bench = SimulatedBench::new();
    let (partials, outputs) = run(
        &bench,
        MeasureRequest::OutputAccuracy(OutputAccuracyParams::default()),
    )
    .await;
    assert!(partials.is_empty());

    let outputs = match outputs {
        Outputs::OutputAccuracy(outputs) => outputs,
        other => panic!("unexpected outputs {:?}", other),
    };
    assert_eq!(outputs.load_voltage_vs_time.len(), 1001);
    assert!((outputs.output_voltage - 3.295).abs() < 1e-9);
    assert!((outputs.output_voltage_error - 0.005).abs() < 1e-9);
    assert!((outputs.output_voltage_accuracy - 0.5 / 3.3).abs() < 1e-6);
    let last_x = *outputs.load_voltage_vs_time.x.last().unwrap();
    assert!((last_x - 1.0).abs() < 1e-12);

    // The record is drained in backlog-sized chunks.
    let backlog_queries = bench
        .calls("E-load")
        .iter()
        .filter(|call| **call == Call::FetchBacklog)
        .count();
    assert_eq!(backlog_queries, 4);
    assert_eq!(bench.open_sessions(), 0);
}

// =============================================================================
// Load transient
// =============================================================================

#[tokio::test]
async fn test_load_transient() {
    let bench = SimulatedBench::new();
    let (partials, outputs) = run(
        &bench,
        MeasureRequest::LoadTransient(LoadTransientParams::default()),
    )
    .await;
    assert!(partials.is_empty());

    let outputs = match outputs {
        Outputs::LoadTransient(outputs) => outputs,
        other => panic!("unexpected outputs {:?}", other),
    };
    let current = &outputs.load_current_graph.y;
    let voltage = &outputs.load_voltage_graph.y;
    assert_eq!(current.len(), 5400);
    assert_eq!(voltage.len(), 5400);
    assert_eq!(current[0], -4.0);
    assert_eq!(current[1800], -14.0);
    assert_eq!(current[3600], -4.0);

    // Undershoot on the rising step, overshoot on the falling one.
    assert!(voltage[1800] < voltage[1799] - 0.05);
    assert!(voltage[3600] > voltage[3599] + 0.05);
    // Settled by the end of each dwell.
    assert!((voltage[3599] - 3.272).abs() < 1e-6);
    assert!((voltage[5399] - 3.292).abs() < 1e-6);

    let dt = outputs.load_current_graph.x[1];
    assert!((dt - 1.0 / 1.8e6).abs() < 1e-9);

    let load = bench.channel("E-load", "0").unwrap();
    assert_eq!(load.sequence, Vec::<f64>::new());
    assert_eq!(bench.open_sessions(), 0);
}

// =============================================================================
// Parameter validation
// =============================================================================

async fn assert_rejected_before_hardware(request: MeasureRequest, field: &str) {
    let bench = SimulatedBench::new();
    let err = Invocation::new(&bench, ModeOfOperation::Measure, request)
        .run_to_completion()
        .await
        .unwrap_err();
    assert!(matches!(err, BenchError::Validation(_)), "{}", err);
    assert!(err.to_string().contains(field), "{}", err);
    assert!(bench.journal().is_empty());
}

#[tokio::test]
async fn test_zero_sample_rate_is_rejected_before_hardware() {
    assert_rejected_before_hardware(
        MeasureRequest::LoadTransient(LoadTransientParams {
            sample_rate: 0.0,
            ..LoadTransientParams::default()
        }),
        "sample_rate",
    )
    .await;
}

#[tokio::test]
async fn test_nan_acquisition_time_is_rejected_before_hardware() {
    assert_rejected_before_hardware(
        MeasureRequest::Ripple(RippleParams {
            scope_acquisition_time: f64::NAN,
            ..RippleParams::default()
        }),
        "scope_acquisition_time",
    )
    .await;
}

#[tokio::test]
async fn test_zero_aperture_is_rejected_before_hardware() {
    assert_rejected_before_hardware(
        MeasureRequest::OutputAccuracy(OutputAccuracyParams {
            aperture_time: std::time::Duration::ZERO,
            ..OutputAccuracyParams::default()
        }),
        "aperture_time",
    )
    .await;
}

#[tokio::test]
async fn test_nan_source_voltage_is_rejected_before_hardware() {
    assert_rejected_before_hardware(
        MeasureRequest::LineRegulation(LineRegulationParams {
            source_stop_voltage: f64::NAN,
            ..LineRegulationParams::default()
        }),
        "source_stop_voltage",
    )
    .await;
}

#[tokio::test]
async fn test_load_transient_initiates_source_first() {
    let bench = SimulatedBench::new();
    run(
        &bench,
        MeasureRequest::LoadTransient(LoadTransientParams::default()),
    )
    .await;
    let source = bench.position("PPS", &Call::Initiate).unwrap();
    let load = bench.position("E-load", &Call::Initiate).unwrap();
    assert!(source < load);
    assert!(bench
        .calls("E-load")
        .contains(&Call::SetSequence(vec![4.0, 14.0, 4.0])));
}
