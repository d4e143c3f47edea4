//! Bench configuration using Figment.
//!
//! Values are layered, later layers winning:
//! 1. built-in defaults (every test's parameter defaults)
//! 2. an optional TOML file
//! 3. environment variables prefixed `PMIC_BENCH_`, nested with `__`
//!
//! ```toml
//! [log]
//! level = "debug"
//!
//! [ripple]
//! scope_sample_rate = 20000.0
//! dut_setup_time = "500ms"
//!
//! [efficiency.source]
//! resource = "PPS2"
//! ```
//!
//! `PMIC_BENCH_RIPPLE__SCOPE_ACQUISITION_TIME=5` overrides the same tree.

use crate::error::{BenchError, BenchResult};
use crate::procedures::efficiency::{EfficiencyParams, SinglePointParams};
use crate::procedures::line_regulation::LineRegulationParams;
use crate::procedures::load_transient::LoadTransientParams;
use crate::procedures::output_accuracy::OutputAccuracyParams;
use crate::procedures::ripple::RippleParams;
use crate::service::{MeasureRequest, TestKind};
use crate::tracing_setup::{parse_log_level, OutputFormat};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "PMIC_BENCH_";

/// Logging section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// trace, debug, info, warn or error
    pub level: String,
    /// Output format
    pub format: OutputFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: OutputFormat::Pretty,
        }
    }
}

/// Top-level bench configuration: logging plus one section per test.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    /// Logging settings
    pub log: LogConfig,
    /// Efficiency sweep parameters
    pub efficiency: EfficiencyParams,
    /// Single-point efficiency parameters
    pub single_point_efficiency: SinglePointParams,
    /// Line regulation parameters
    pub line_regulation: LineRegulationParams,
    /// Ripple parameters
    pub ripple: RippleParams,
    /// Output accuracy parameters
    pub output_accuracy: OutputAccuracyParams,
    /// Load transient parameters
    pub load_transient: LoadTransientParams,
}

impl BenchConfig {
    /// Defaults overridden by the environment.
    pub fn load() -> BenchResult<Self> {
        Self::figment(None).extract().map_err(BenchError::from)
    }

    /// Defaults overridden by `path` (if it exists) and then the environment.
    pub fn load_from<P: AsRef<Path>>(path: P) -> BenchResult<Self> {
        Self::figment(Some(path.as_ref()))
            .extract()
            .map_err(BenchError::from)
    }

    /// The provider stack, exposed for callers that merge their own layers.
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(BenchConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Request for `kind` built from this configuration's section.
    pub fn request(&self, kind: TestKind) -> MeasureRequest {
        match kind {
            TestKind::Efficiency => MeasureRequest::Efficiency(self.efficiency.clone()),
            TestKind::SinglePointEfficiency => {
                MeasureRequest::SinglePointEfficiency(self.single_point_efficiency.clone())
            }
            TestKind::LineRegulation => {
                MeasureRequest::LineRegulation(self.line_regulation.clone())
            }
            TestKind::Ripple => MeasureRequest::Ripple(self.ripple.clone()),
            TestKind::OutputAccuracy => MeasureRequest::OutputAccuracy(self.output_accuracy.clone()),
            TestKind::LoadTransient => MeasureRequest::LoadTransient(self.load_transient.clone()),
        }
    }

    /// Effective configuration rendered as TOML, loadable with [`Self::load_from`].
    pub fn to_toml(&self) -> BenchResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| BenchError::Processing(format!("failed to render configuration: {}", e)))
    }

    /// Check values a TOML file or the environment could have broken.
    pub fn validate(&self) -> BenchResult<()> {
        parse_log_level(&self.log.level).map_err(BenchError::Validation)?;
        TestKind::ALL
            .iter()
            .try_for_each(|&kind| self.request(kind).validate())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn defaults_are_valid() {
        let config = BenchConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.efficiency.source.resource, "PPS");
        assert_eq!(config.ripple.scope.resource, "Scope");
    }

    #[test]
    fn toml_layer_overrides_defaults() {
        let config: BenchConfig = BenchConfig::figment(None)
            .merge(Toml::string(
                r#"
                [ripple]
                scope_sample_rate = 20000.0
                dut_setup_time = "250ms"

                [efficiency.load]
                resource = "E-load2"
                "#,
            ))
            .extract()
            .unwrap();
        assert_eq!(config.ripple.scope_sample_rate, 20_000.0);
        assert_eq!(config.ripple.dut_setup_time, Duration::from_millis(250));
        assert_eq!(config.ripple.scope_acquisition_time, 3.0);
        assert_eq!(config.efficiency.load.resource, "E-load2");
        assert_eq!(config.efficiency.load.channel, "0");
    }

    #[test]
    fn rendered_toml_loads_back() {
        let mut config = BenchConfig::default();
        config.line_regulation.points = 7;
        config.output_accuracy.dut_setup_time = Duration::from_millis(150);

        let rendered = config.to_toml().unwrap();
        let loaded: BenchConfig = Figment::new()
            .merge(Toml::string(&rendered))
            .extract()
            .unwrap();
        assert_eq!(loaded.line_regulation.points, 7);
        assert_eq!(loaded.output_accuracy.dut_setup_time, Duration::from_millis(150));
        assert_eq!(loaded.ripple.scope, config.ripple.scope);
    }

    #[test]
    fn empty_resource_is_rejected() {
        let mut config = BenchConfig::default();
        config.ripple.scope.resource = "  ".into();
        config.ripple.scope_sample_rate = 0.0;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("[ripple]"));
        assert!(err.contains("scope.resource"));
        assert!(err.contains("scope_sample_rate"));
    }

    #[test]
    fn bad_log_level_is_rejected() {
        let mut config = BenchConfig::default();
        config.log.level = "verbose".into();
        assert!(matches!(config.validate(), Err(BenchError::Validation(_))));
    }

    #[test]
    fn request_uses_section() {
        let mut config = BenchConfig::default();
        config.line_regulation.points = 3;
        match config.request(TestKind::LineRegulation) {
            MeasureRequest::LineRegulation(params) => assert_eq!(params.points, 3),
            other => panic!("unexpected request {:?}", other),
        }
    }
}
