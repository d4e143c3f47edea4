//! Integration tests for the `PowerOn` / `Measure` / `PowerOff` modes.

use futures::StreamExt;
use pmic_bench::hardware::simulated::{Call, ErrorConfig, ErrorScenario, Operation};
use pmic_bench::hardware::SimulatedBench;
use pmic_bench::procedures::STATUS_POWERED_OFF;
use pmic_bench::service::TestKind;
use pmic_bench::{BenchError, Invocation, MeasureRequest, ModeOfOperation, Outputs, Report};

// =============================================================================
// PowerOn
// =============================================================================

#[tokio::test]
async fn test_power_on_reports_levels_and_releases() {
    let bench = SimulatedBench::new();
    let report = Invocation::new(
        &bench,
        ModeOfOperation::PowerOn,
        MeasureRequest::defaults(TestKind::SinglePointEfficiency),
    )
    .run_to_completion()
    .await
    .unwrap();

    assert!(report.is_final());
    assert_eq!(
        report.outputs().status(),
        "The DUT is powered ON\nVoltage Level: 12.0\nCurrent Level: 0.005"
    );
    let source = bench.channel("PPS", "0").unwrap();
    assert!(!source.open);
    assert_eq!(source.applied, None);
    // The load is never touched.
    assert!(bench.calls("E-load").is_empty());
}

#[tokio::test]
async fn test_power_on_fills_ripple_supply_fields() {
    let bench = SimulatedBench::new();
    let report = Invocation::new(
        &bench,
        ModeOfOperation::PowerOn,
        MeasureRequest::defaults(TestKind::Ripple),
    )
    .run_to_completion()
    .await
    .unwrap();

    match report {
        Report::Final(Outputs::Ripple(outputs)) => {
            assert_eq!(outputs.supply_voltage, 10.0);
            assert!((outputs.supply_current - 0.005).abs() < 1e-12);
            assert!(outputs.ripple_graph.is_empty());
        }
        other => panic!("unexpected report {:?}", other),
    }
}

#[tokio::test]
async fn test_power_on_uses_each_tests_start_voltage() {
    let expected = [
        (TestKind::Efficiency, 6.0),
        (TestKind::SinglePointEfficiency, 12.0),
        (TestKind::LineRegulation, 6.0),
        (TestKind::Ripple, 10.0),
        (TestKind::OutputAccuracy, 6.0),
        (TestKind::LoadTransient, 12.0),
    ];
    for (kind, voltage) in expected {
        let bench = SimulatedBench::new();
        let report = Invocation::new(&bench, ModeOfOperation::PowerOn, MeasureRequest::defaults(kind))
            .run_to_completion()
            .await
            .unwrap();
        let status = report.outputs().status().to_string();
        assert!(
            status.contains(&format!("Voltage Level: {:?}", voltage)),
            "{}: {}",
            kind,
            status
        );
    }
}

#[tokio::test]
async fn test_power_on_busy_channel_fails() {
    let bench = SimulatedBench::new();
    let _held = pmic_bench::hardware::InstrumentDriver::open_dcpower(&bench, "PPS", "0")
        .await
        .unwrap();
    let mut invocation = Invocation::new(
        &bench,
        ModeOfOperation::PowerOn,
        MeasureRequest::defaults(TestKind::Efficiency),
    );
    let err = invocation.next().await.unwrap().unwrap_err();
    assert!(matches!(err, BenchError::DriverFault(_)));
}

// =============================================================================
// PowerOff
// =============================================================================

#[tokio::test]
async fn test_power_off_disables_resets_and_closes() {
    let bench = SimulatedBench::new();
    let report = Invocation::new(
        &bench,
        ModeOfOperation::PowerOff,
        MeasureRequest::defaults(TestKind::Efficiency),
    )
    .run_to_completion()
    .await
    .unwrap();

    assert_eq!(report.outputs().status(), STATUS_POWERED_OFF);
    let expected = vec![Call::Open, Call::DisableOutput, Call::Reset, Call::Close];
    assert_eq!(bench.calls("PPS"), expected);
    assert_eq!(bench.calls("E-load"), expected);
    assert_eq!(bench.open_sessions(), 0);
}

#[tokio::test]
async fn test_power_off_after_power_on() {
    let bench = SimulatedBench::new();
    for mode in [ModeOfOperation::PowerOn, ModeOfOperation::PowerOff] {
        Invocation::new(&bench, mode, MeasureRequest::defaults(TestKind::LoadTransient))
            .run_to_completion()
            .await
            .unwrap();
    }
    assert_eq!(bench.channel("PPS", "0").unwrap().applied, None);
    assert_eq!(bench.open_sessions(), 0);
}

#[tokio::test]
async fn test_power_off_reports_teardown_failure() {
    let bench = SimulatedBench::new().with_faults(ErrorConfig::scenario(ErrorScenario::Fail {
        resource: "E-load".into(),
        operation: Operation::Reset,
    }));
    let err = Invocation::new(
        &bench,
        ModeOfOperation::PowerOff,
        MeasureRequest::defaults(TestKind::Ripple),
    )
    .run_to_completion()
    .await
    .unwrap_err();
    assert!(matches!(err, BenchError::DriverFault(_)));
    // Close still ran on both channels.
    assert_eq!(bench.open_sessions(), 0);
}

// =============================================================================
// Mode parsing and the stream adapter
// =============================================================================

#[test]
fn test_mode_parsing() {
    let cases = [
        ("power-on", ModeOfOperation::PowerOn),
        ("POWER_ON", ModeOfOperation::PowerOn),
        ("Power On DUT", ModeOfOperation::PowerOn),
        ("measure", ModeOfOperation::Measure),
        ("Perform Measurement", ModeOfOperation::Measure),
        ("power_off", ModeOfOperation::PowerOff),
        ("PowerOffDUT", ModeOfOperation::PowerOff),
    ];
    for (text, mode) in cases {
        assert_eq!(text.parse::<ModeOfOperation>().unwrap(), mode, "{}", text);
    }
    assert!(matches!(
        "standby".parse::<ModeOfOperation>(),
        Err(BenchError::Validation(_))
    ));

    let mode: ModeOfOperation = serde_json::from_str("\"power-off\"").unwrap();
    assert_eq!(mode, ModeOfOperation::PowerOff);
    assert_eq!(ModeOfOperation::PowerOn.to_string(), "power-on");
}

#[tokio::test]
async fn test_invocation_as_stream() {
    let bench = SimulatedBench::new();
    let mut request = MeasureRequest::defaults(TestKind::LineRegulation);
    if let MeasureRequest::LineRegulation(params) = &mut request {
        params.points = 4;
    }
    let reports: Vec<_> = Invocation::new(&bench, ModeOfOperation::Measure, request)
        .into_stream()
        .collect()
        .await;
    assert_eq!(reports.len(), 5);
    assert!(reports[..4]
        .iter()
        .all(|r| matches!(r, Ok(Report::Partial(_)))));
    assert!(matches!(reports[4], Ok(Report::Final(_))));
}

#[test]
fn test_report_serializes_with_kind_and_test_tags() {
    let report = Report::Final(Outputs::status_only(TestKind::Ripple, STATUS_POWERED_OFF));
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["kind"], "final");
    assert_eq!(json["outputs"]["test"], "ripple");
    assert_eq!(json["outputs"]["outputs"]["status"], STATUS_POWERED_OFF);
}
