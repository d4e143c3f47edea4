//! Mode Controller
//!
//! The single entry point a hosting framework calls: one [`MeasureRequest`]
//! (which test, with which parameters) run in one [`ModeOfOperation`].
//!
//! An [`Invocation`] is pulled with `next()`. Sweeps and ripple captures
//! yield a [`Report::Partial`] per step or window, then a [`Report::Final`]
//! carrying the status line; one-shot tests yield only the final report.
//! The sequence is finite and cannot be restarted; run a new invocation
//! instead.
//!
//! # Example
//!
//! ```rust,ignore
//! let bench = SimulatedBench::new();
//! let request = MeasureRequest::defaults(TestKind::Efficiency);
//! let mut invocation = Invocation::new(&bench, ModeOfOperation::Measure, request);
//! while let Some(report) = invocation.next().await {
//!     println!("{:?}", report?);
//! }
//! ```

use crate::error::{BenchError, BenchResult};
use crate::hardware::capabilities::{InstrumentDriver, MeasurementSample};
use crate::measurement::metrics::{DerivedMetrics, StepMetrics};
use crate::measurement::stream::{RippleStream, SweepStream};
use crate::procedures::dut_power::{power_off, power_on, power_on_status};
use crate::procedures::efficiency::{
    self, EfficiencyOutputs, EfficiencyParams, SinglePointOutputs, SinglePointParams,
};
use crate::procedures::line_regulation::{self, LineRegulationOutputs, LineRegulationParams};
use crate::procedures::load_transient::{self, LoadTransientOutputs, LoadTransientParams};
use crate::procedures::output_accuracy::{self, OutputAccuracyOutputs, OutputAccuracyParams};
use crate::procedures::ripple::{self, RippleOutputs, RippleParams};
use crate::procedures::{ChannelAddress, STATUS_MEASURED, STATUS_POWERED_OFF};
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{info, warn};
use uuid::Uuid;

// =============================================================================
// Modes and tests
// =============================================================================

/// What one invocation does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModeOfOperation {
    /// Energize the source once to check the DUT, then de-energize.
    PowerOn,
    /// Run the measurement.
    Measure,
    /// Disable, reset and close source and load.
    PowerOff,
}

impl fmt::Display for ModeOfOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ModeOfOperation::PowerOn => "power-on",
            ModeOfOperation::Measure => "measure",
            ModeOfOperation::PowerOff => "power-off",
        };
        write!(f, "{}", label)
    }
}

impl FromStr for ModeOfOperation {
    type Err = BenchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| !matches!(c, '-' | '_' | ' '))
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "poweron" | "powerondut" => Ok(ModeOfOperation::PowerOn),
            "measure" | "performmeasurement" => Ok(ModeOfOperation::Measure),
            "poweroff" | "poweroffdut" => Ok(ModeOfOperation::PowerOff),
            _ => Err(BenchError::Validation(format!(
                "Mode '{}' is not supported. Must be one of: power-on, measure, power-off",
                s
            ))),
        }
    }
}

/// Bench tests the service can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestKind {
    /// Efficiency and load regulation sweep.
    Efficiency,
    /// Efficiency at one operating point.
    SinglePointEfficiency,
    /// Line regulation sweep.
    LineRegulation,
    /// Output ripple capture.
    Ripple,
    /// Output voltage accuracy.
    OutputAccuracy,
    /// Load transient response.
    LoadTransient,
}

impl TestKind {
    /// Every test, in menu order.
    pub const ALL: [TestKind; 6] = [
        TestKind::Efficiency,
        TestKind::SinglePointEfficiency,
        TestKind::LineRegulation,
        TestKind::Ripple,
        TestKind::OutputAccuracy,
        TestKind::LoadTransient,
    ];
}

impl fmt::Display for TestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TestKind::Efficiency => "efficiency",
            TestKind::SinglePointEfficiency => "single_point_efficiency",
            TestKind::LineRegulation => "line_regulation",
            TestKind::Ripple => "ripple",
            TestKind::OutputAccuracy => "output_accuracy",
            TestKind::LoadTransient => "load_transient",
        };
        write!(f, "{}", label)
    }
}

// =============================================================================
// Requests and outputs
// =============================================================================

/// A test together with its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "test", content = "params", rename_all = "snake_case")]
pub enum MeasureRequest {
    /// Efficiency and load regulation sweep.
    Efficiency(EfficiencyParams),
    /// Efficiency at one operating point.
    SinglePointEfficiency(SinglePointParams),
    /// Line regulation sweep.
    LineRegulation(LineRegulationParams),
    /// Output ripple capture.
    Ripple(RippleParams),
    /// Output voltage accuracy.
    OutputAccuracy(OutputAccuracyParams),
    /// Load transient response.
    LoadTransient(LoadTransientParams),
}

impl MeasureRequest {
    /// `kind` with default parameters.
    pub fn defaults(kind: TestKind) -> Self {
        match kind {
            TestKind::Efficiency => MeasureRequest::Efficiency(Default::default()),
            TestKind::SinglePointEfficiency => {
                MeasureRequest::SinglePointEfficiency(Default::default())
            }
            TestKind::LineRegulation => MeasureRequest::LineRegulation(Default::default()),
            TestKind::Ripple => MeasureRequest::Ripple(Default::default()),
            TestKind::OutputAccuracy => MeasureRequest::OutputAccuracy(Default::default()),
            TestKind::LoadTransient => MeasureRequest::LoadTransient(Default::default()),
        }
    }

    /// Which test this is.
    pub fn kind(&self) -> TestKind {
        match self {
            MeasureRequest::Efficiency(_) => TestKind::Efficiency,
            MeasureRequest::SinglePointEfficiency(_) => TestKind::SinglePointEfficiency,
            MeasureRequest::LineRegulation(_) => TestKind::LineRegulation,
            MeasureRequest::Ripple(_) => TestKind::Ripple,
            MeasureRequest::OutputAccuracy(_) => TestKind::OutputAccuracy,
            MeasureRequest::LoadTransient(_) => TestKind::LoadTransient,
        }
    }

    /// Check the parameters without touching hardware.
    pub fn validate(&self) -> BenchResult<()> {
        match self {
            MeasureRequest::Efficiency(p) => p.validate(),
            MeasureRequest::SinglePointEfficiency(p) => p.validate(),
            MeasureRequest::LineRegulation(p) => p.validate(),
            MeasureRequest::Ripple(p) => p.validate(),
            MeasureRequest::OutputAccuracy(p) => p.validate(),
            MeasureRequest::LoadTransient(p) => p.validate(),
        }
    }

    /// Source channel with the voltage and current limit used by `PowerOn`.
    pub fn power_on_target(&self) -> (&ChannelAddress, f64, f64) {
        match self {
            MeasureRequest::Efficiency(p) => {
                (&p.source, p.source_start_voltage, p.source_current_limit)
            }
            MeasureRequest::SinglePointEfficiency(p) => {
                (&p.source, p.source_voltage, p.source_current_limit)
            }
            MeasureRequest::LineRegulation(p) => {
                (&p.source, p.source_start_voltage, p.source_current_limit)
            }
            MeasureRequest::Ripple(p) => {
                (&p.source, p.source_voltage_level, p.source_current_limit)
            }
            MeasureRequest::OutputAccuracy(p) => {
                (&p.source, p.source_voltage_level, p.source_current_limit)
            }
            MeasureRequest::LoadTransient(p) => {
                (&p.source, p.source_voltage_level, p.source_current_limit)
            }
        }
    }

    /// Source and load channels released by `PowerOff`.
    pub fn channels(&self) -> (&ChannelAddress, &ChannelAddress) {
        match self {
            MeasureRequest::Efficiency(p) => (&p.source, &p.load),
            MeasureRequest::SinglePointEfficiency(p) => (&p.source, &p.load),
            MeasureRequest::LineRegulation(p) => (&p.source, &p.load),
            MeasureRequest::Ripple(p) => (&p.source, &p.load),
            MeasureRequest::OutputAccuracy(p) => (&p.source, &p.load),
            MeasureRequest::LoadTransient(p) => (&p.source, &p.load),
        }
    }
}

/// Outputs of one test, as reported to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "test", content = "outputs", rename_all = "snake_case")]
pub enum Outputs {
    /// Efficiency and load regulation sweep.
    Efficiency(EfficiencyOutputs),
    /// Efficiency at one operating point.
    SinglePointEfficiency(SinglePointOutputs),
    /// Line regulation sweep.
    LineRegulation(LineRegulationOutputs),
    /// Output ripple capture.
    Ripple(RippleOutputs),
    /// Output voltage accuracy.
    OutputAccuracy(OutputAccuracyOutputs),
    /// Load transient response.
    LoadTransient(LoadTransientOutputs),
}

impl Outputs {
    /// Empty outputs of `kind` carrying only `status`.
    pub fn status_only(kind: TestKind, status: impl Into<String>) -> Self {
        let status = status.into();
        match kind {
            TestKind::Efficiency => {
                Outputs::Efficiency(EfficiencyOutputs::default().with_status(status))
            }
            TestKind::SinglePointEfficiency => {
                Outputs::SinglePointEfficiency(SinglePointOutputs::default().with_status(status))
            }
            TestKind::LineRegulation => {
                Outputs::LineRegulation(LineRegulationOutputs::default().with_status(status))
            }
            TestKind::Ripple => Outputs::Ripple(RippleOutputs::default().with_status(status)),
            TestKind::OutputAccuracy => {
                Outputs::OutputAccuracy(OutputAccuracyOutputs::default().with_status(status))
            }
            TestKind::LoadTransient => {
                Outputs::LoadTransient(LoadTransientOutputs::default().with_status(status))
            }
        }
    }

    /// Outputs of a `PowerOn` invocation.
    pub fn powered_on(kind: TestKind, sample: &MeasurementSample) -> Self {
        match Outputs::status_only(kind, power_on_status(sample)) {
            Outputs::Ripple(outputs) => Outputs::Ripple(RippleOutputs {
                supply_voltage: sample.voltage,
                supply_current: sample.current,
                ..outputs
            }),
            other => other,
        }
    }

    /// Status line.
    pub fn status(&self) -> &str {
        match self {
            Outputs::Efficiency(o) => &o.status,
            Outputs::SinglePointEfficiency(o) => &o.status,
            Outputs::LineRegulation(o) => &o.status,
            Outputs::Ripple(o) => &o.status,
            Outputs::OutputAccuracy(o) => &o.status,
            Outputs::LoadTransient(o) => &o.status,
        }
    }
}

/// One report pulled from an [`Invocation`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "outputs", rename_all = "snake_case")]
pub enum Report {
    /// Cumulative outputs after a step or window.
    Partial(Outputs),
    /// Outputs once the invocation completed.
    Final(Outputs),
}

impl Report {
    /// Outputs carried by this report.
    pub fn outputs(&self) -> &Outputs {
        match self {
            Report::Partial(outputs) | Report::Final(outputs) => outputs,
        }
    }

    /// Whether this is the last report.
    pub fn is_final(&self) -> bool {
        matches!(self, Report::Final(_))
    }
}

// =============================================================================
// Invocation
// =============================================================================

enum Phase {
    Pending,
    Efficiency {
        stream: SweepStream,
        outputs: EfficiencyOutputs,
        steps: Vec<StepMetrics>,
    },
    LineRegulation {
        stream: SweepStream,
        outputs: LineRegulationOutputs,
        steps: Vec<StepMetrics>,
    },
    Ripple {
        stream: RippleStream,
        outputs: RippleOutputs,
    },
    Done,
}

/// One run of one test in one mode.
pub struct Invocation<'a> {
    id: Uuid,
    started_at: DateTime<Utc>,
    driver: &'a dyn InstrumentDriver,
    mode: ModeOfOperation,
    request: MeasureRequest,
    phase: Phase,
}

impl<'a> Invocation<'a> {
    /// Prepare an invocation; nothing touches hardware until `next()`.
    pub fn new(
        driver: &'a dyn InstrumentDriver,
        mode: ModeOfOperation,
        request: MeasureRequest,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            driver,
            mode,
            request,
            phase: Phase::Pending,
        }
    }

    /// Unique id, for correlating logs and reports.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Creation time.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Next report, `None` once the final report was returned or an error ended
    /// the invocation.
    pub async fn next(&mut self) -> Option<BenchResult<Report>> {
        let item = loop {
            let step = match std::mem::replace(&mut self.phase, Phase::Done) {
                Phase::Pending => {
                    info!(
                        invocation = %self.id,
                        test = %self.request.kind(),
                        mode = %self.mode,
                        started_at = %self.started_at,
                        "invocation started"
                    );
                    match self.start().await {
                        // A stream was started; pull its first item.
                        Ok(None) => continue,
                        Ok(Some(report)) => Ok(report),
                        Err(err) => Err(err),
                    }
                }
                Phase::Efficiency {
                    mut stream,
                    outputs,
                    mut steps,
                } => match stream.next().await {
                    Some(Ok(progress)) => {
                        let outputs = outputs.with_step(&progress.metrics);
                        steps.push(progress.metrics);
                        let report = Report::Partial(Outputs::Efficiency(outputs.clone()));
                        self.phase = Phase::Efficiency {
                            stream,
                            outputs,
                            steps,
                        };
                        Ok(report)
                    }
                    Some(Err(err)) => Err(err),
                    None => Ok(Report::Final(Outputs::Efficiency(
                        outputs
                            .with_summary(DerivedMetrics::from_steps(&steps))
                            .with_status(STATUS_MEASURED),
                    ))),
                },
                Phase::LineRegulation {
                    mut stream,
                    outputs,
                    mut steps,
                } => match stream.next().await {
                    Some(Ok(progress)) => {
                        let outputs = outputs.with_step(&progress.metrics);
                        steps.push(progress.metrics);
                        let report = Report::Partial(Outputs::LineRegulation(outputs.clone()));
                        self.phase = Phase::LineRegulation {
                            stream,
                            outputs,
                            steps,
                        };
                        Ok(report)
                    }
                    Some(Err(err)) => Err(err),
                    None => Ok(Report::Final(Outputs::LineRegulation(
                        outputs
                            .with_summary(DerivedMetrics::from_steps(&steps))
                            .with_status(STATUS_MEASURED),
                    ))),
                },
                Phase::Ripple {
                    mut stream,
                    outputs,
                } => match stream.next().await {
                    Some(Ok(window)) => {
                        let outputs = outputs.with_window(window);
                        let report = Report::Partial(Outputs::Ripple(outputs.clone()));
                        self.phase = Phase::Ripple { stream, outputs };
                        Ok(report)
                    }
                    Some(Err(err)) => Err(err),
                    None => Ok(Report::Final(Outputs::Ripple(
                        outputs.with_status(STATUS_MEASURED),
                    ))),
                },
                Phase::Done => return None,
            };
            break step;
        };

        match &item {
            Ok(report) if report.is_final() => {
                info!(invocation = %self.id, status = report.outputs().status(), "invocation finished");
            }
            Err(err) => warn!(invocation = %self.id, error = %err, "invocation failed"),
            Ok(_) => {}
        }
        Some(item)
    }

    /// Runs the mode. `None` means a stream was started and holds the first item.
    async fn start(&mut self) -> BenchResult<Option<Report>> {
        let kind = self.request.kind();
        match self.mode {
            ModeOfOperation::PowerOn => {
                let (source, voltage, limit) = self.request.power_on_target();
                let sample = power_on(self.driver, source, voltage, limit).await?;
                Ok(Some(Report::Final(Outputs::powered_on(kind, &sample))))
            }
            ModeOfOperation::PowerOff => {
                let (source, load) = self.request.channels();
                power_off(self.driver, source, load).await?;
                Ok(Some(Report::Final(Outputs::status_only(
                    kind,
                    STATUS_POWERED_OFF,
                ))))
            }
            ModeOfOperation::Measure => self.start_measurement().await,
        }
    }

    /// Starts a streaming test and returns `None`, or runs a one-shot test to
    /// its final report.
    async fn start_measurement(&mut self) -> BenchResult<Option<Report>> {
        let driver = self.driver;
        let phase = match &self.request {
            MeasureRequest::Efficiency(params) => {
                let (outputs, stream) = efficiency::measure(driver, params).await?;
                Phase::Efficiency {
                    steps: Vec::with_capacity(stream.total()),
                    stream,
                    outputs,
                }
            }
            MeasureRequest::LineRegulation(params) => {
                let stream = line_regulation::measure(driver, params).await?;
                Phase::LineRegulation {
                    steps: Vec::with_capacity(stream.total()),
                    stream,
                    outputs: LineRegulationOutputs::default(),
                }
            }
            MeasureRequest::Ripple(params) => {
                let (outputs, stream) = ripple::measure(driver, params).await?;
                Phase::Ripple { stream, outputs }
            }
            MeasureRequest::SinglePointEfficiency(params) => {
                let outputs = efficiency::measure_single_point(driver, params).await?;
                return Ok(Some(Report::Final(Outputs::SinglePointEfficiency(
                    outputs.with_status(STATUS_MEASURED),
                ))));
            }
            MeasureRequest::OutputAccuracy(params) => {
                let outputs = output_accuracy::measure(driver, params).await?;
                return Ok(Some(Report::Final(Outputs::OutputAccuracy(
                    outputs.with_status(STATUS_MEASURED),
                ))));
            }
            MeasureRequest::LoadTransient(params) => {
                let outputs = load_transient::measure(driver, params).await?;
                return Ok(Some(Report::Final(Outputs::LoadTransient(
                    outputs.with_status(STATUS_MEASURED),
                ))));
            }
        };
        self.phase = phase;
        Ok(None)
    }

    /// Pull every report and return the final one.
    pub async fn run_to_completion(mut self) -> BenchResult<Report> {
        let mut last = None;
        while let Some(item) = self.next().await {
            last = Some(item?);
        }
        last.ok_or_else(|| BenchError::InvalidState {
            expected: "a final report".into(),
            actual: "no report".into(),
        })
    }

    /// Adapt into a [`futures::Stream`].
    pub fn into_stream(self) -> impl Stream<Item = BenchResult<Report>> + 'a {
        stream::unfold(self, |mut this| async move {
            this.next().await.map(|item| (item, this))
        })
    }
}
