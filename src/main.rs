//! CLI Entry Point for pmic-bench
//!
//! Runs one bench test in one mode against the simulated bench and prints
//! every partial and the final outputs as JSON lines on stdout. Logs go to
//! stderr.
//!
//! # Usage
//!
//! ```bash
//! pmic-bench efficiency
//! pmic-bench --config bench.toml ripple --mode power-on
//! PMIC_BENCH_LINE_REGULATION__POINTS=3 pmic-bench line-regulation
//! pmic-bench --print-config efficiency > bench.toml
//! ```

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use pmic_bench::config::BenchConfig;
use pmic_bench::hardware::SimulatedBench;
use pmic_bench::service::{Invocation, ModeOfOperation, TestKind};
use pmic_bench::tracing_setup::{self, OutputFormat, TracingConfig};
use std::io::Write;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "pmic-bench")]
#[command(about = "Synchronized source/load bench measurements", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level, overrides the configuration
    #[arg(long)]
    log_level: Option<String>,

    /// Log format, overrides the configuration
    #[arg(long, value_enum)]
    log_format: Option<LogFormatArg>,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,

    /// Test to run
    #[arg(value_enum)]
    test: TestArg,

    /// Mode of operation
    #[arg(long, value_enum, default_value = "measure")]
    mode: ModeArg,
}

#[derive(Clone, Copy, ValueEnum)]
enum TestArg {
    Efficiency,
    SinglePointEfficiency,
    LineRegulation,
    Ripple,
    OutputAccuracy,
    LoadTransient,
}

impl From<TestArg> for TestKind {
    fn from(arg: TestArg) -> Self {
        match arg {
            TestArg::Efficiency => TestKind::Efficiency,
            TestArg::SinglePointEfficiency => TestKind::SinglePointEfficiency,
            TestArg::LineRegulation => TestKind::LineRegulation,
            TestArg::Ripple => TestKind::Ripple,
            TestArg::OutputAccuracy => TestKind::OutputAccuracy,
            TestArg::LoadTransient => TestKind::LoadTransient,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    PowerOn,
    Measure,
    PowerOff,
}

impl From<ModeArg> for ModeOfOperation {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::PowerOn => ModeOfOperation::PowerOn,
            ModeArg::Measure => ModeOfOperation::Measure,
            ModeArg::PowerOff => ModeOfOperation::PowerOff,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormatArg {
    Pretty,
    Compact,
    Json,
}

impl From<LogFormatArg> for OutputFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Pretty => OutputFormat::Pretty,
            LogFormatArg::Compact => OutputFormat::Compact,
            LogFormatArg::Json => OutputFormat::Json,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => BenchConfig::load_from(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => BenchConfig::load().context("loading configuration")?,
    };
    if let Some(level) = cli.log_level {
        config.log.level = level;
    }
    if let Some(format) = cli.log_format {
        config.log.format = format.into();
    }
    config.validate().context("invalid configuration")?;

    if cli.print_config {
        print!("{}", config.to_toml().context("rendering configuration")?);
        return Ok(());
    }

    let tracing_config = TracingConfig::from_bench_config(&config).map_err(anyhow::Error::msg)?;
    tracing_setup::init(tracing_config).map_err(anyhow::Error::msg)?;

    let kind = TestKind::from(cli.test);
    let mode = ModeOfOperation::from(cli.mode);
    let bench = SimulatedBench::new();
    let mut invocation = Invocation::new(&bench, mode, config.request(kind));
    info!(invocation = %invocation.id(), test = %kind, %mode, "running against simulated bench");

    let stdout = std::io::stdout();
    while let Some(report) = invocation.next().await {
        let report = report.with_context(|| format!("{} {} failed", kind, mode))?;
        let line = serde_json::to_string(&report).context("serializing report")?;
        let mut out = stdout.lock();
        writeln!(out, "{}", line).context("writing report")?;
    }
    Ok(())
}
