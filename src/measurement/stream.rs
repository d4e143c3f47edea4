//! Partial results of long captures.
//!
//! Both streams are pull based: every `next()` performs one unit of hardware
//! work (one sweep step, one acquisition window) and returns its result.
//! They are finite and fused. The sessions they own are released right after
//! the last item (strictly, reporting teardown errors) or right after the
//! first error (best effort). Use `into_stream()` to get a
//! [`futures::Stream`].

use crate::error::{BenchError, BenchResult};
use crate::measurement::metrics::{RippleStats, StepMetrics};
use crate::measurement::protocol::SynchronizedSweep;
use crate::procedures::supervisor::{recover_all, shutdown_all, DcPowerGuard, ScopeGuard};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error};

// =============================================================================
// Sweep
// =============================================================================

/// One drained sweep step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepProgress {
    /// 1-based step index.
    pub step: usize,
    /// Total steps in the sweep.
    pub total: usize,
    /// Figures of merit for the step.
    pub metrics: StepMetrics,
}

/// Step-by-step results of a synchronized sweep.
pub struct SweepStream {
    sweep: Option<SynchronizedSweep>,
    nominal_voltage: f64,
    step: usize,
}

impl SweepStream {
    /// Stream over a sweep that has reached `Synchronized`.
    pub fn new(sweep: SynchronizedSweep, nominal_voltage: f64) -> Self {
        Self {
            sweep: Some(sweep),
            nominal_voltage,
            step: 0,
        }
    }

    /// Total steps in the sweep.
    pub fn total(&self) -> usize {
        self.sweep.as_ref().map_or(self.step, SynchronizedSweep::steps)
    }

    /// Next step, `None` once exhausted.
    pub async fn next(&mut self) -> Option<BenchResult<SweepProgress>> {
        let sweep = self.sweep.as_mut()?;
        let total = sweep.steps();
        match sweep.next_pair().await {
            Ok(Some((source, load))) => {
                match StepMetrics::from_pair(source, load, self.nominal_voltage) {
                    Ok(metrics) => {
                        self.step += 1;
                        debug!(step = self.step, total, "sweep step drained");
                        Some(Ok(SweepProgress {
                            step: self.step,
                            total,
                            metrics,
                        }))
                    }
                    Err(err) => {
                        error!(step = self.step + 1, error = %err, "step reduction failed");
                        sweep.abandon().await;
                        self.sweep = None;
                        Some(Err(err))
                    }
                }
            }
            Ok(None) => {
                let outcome = sweep.finish().await;
                self.sweep = None;
                outcome.err().map(Err)
            }
            Err(err) => {
                self.sweep = None;
                Some(Err(err))
            }
        }
    }

    /// Collect every step, stopping at the first error.
    pub async fn collect(mut self) -> BenchResult<Vec<SweepProgress>> {
        let mut steps = Vec::new();
        while let Some(item) = self.next().await {
            steps.push(item?);
        }
        Ok(steps)
    }

    /// Adapt into a [`futures::Stream`].
    pub fn into_stream(self) -> impl Stream<Item = BenchResult<SweepProgress>> {
        stream::unfold(self, |mut this| async move {
            this.next().await.map(|item| (item, this))
        })
    }
}

// =============================================================================
// Ripple
// =============================================================================

/// Length of one ripple acquisition window in seconds.
pub const RIPPLE_WINDOW_SECS: f64 = 1.0;

/// One ripple acquisition window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RippleWindow {
    /// 1-based window index.
    pub window: usize,
    /// Sample times of this window, continuing from the previous one.
    pub time: Vec<f64>,
    /// Ripple voltages of this window.
    pub voltage: Vec<f64>,
    /// Statistics over every window so far.
    pub stats: RippleStats,
}

/// Repeated scope acquisitions until the requested time is used up.
///
/// Each window re-arms the scope, fetches `rate * min(1 s, remaining)`
/// samples with a timeout of twice the remaining time, then aborts.
pub struct RippleStream {
    scope: Option<ScopeGuard>,
    supplies: Vec<DcPowerGuard>,
    sample_rate: f64,
    sample_interval: f64,
    remaining: f64,
    window: usize,
    samples_seen: usize,
    stats: RippleStats,
}

impl RippleStream {
    /// Stream over a configured scope.
    ///
    /// `sample_interval` is the scope's actual sample period. `supplies` are
    /// released together with the scope.
    pub fn new(
        scope: ScopeGuard,
        supplies: Vec<DcPowerGuard>,
        sample_rate: f64,
        sample_interval: f64,
        acquisition_time: f64,
    ) -> Self {
        Self {
            scope: Some(scope),
            supplies,
            sample_rate,
            sample_interval,
            remaining: acquisition_time,
            window: 0,
            samples_seen: 0,
            stats: RippleStats::default(),
        }
    }

    /// Statistics over every window so far.
    pub fn stats(&self) -> RippleStats {
        self.stats
    }

    /// Next window, `None` once the acquisition time is used up.
    pub async fn next(&mut self) -> Option<BenchResult<RippleWindow>> {
        self.scope.as_ref()?;
        if self.remaining <= 0.0 {
            return self.release().await.err().map(Err);
        }

        match self.acquire().await {
            Ok(voltage) => {
                self.window += 1;
                let time = (self.samples_seen..self.samples_seen + voltage.len())
                    .map(|index| index as f64 * self.sample_interval)
                    .collect();
                self.samples_seen += voltage.len();
                self.stats = self.stats.absorb(&voltage);
                self.remaining -= RIPPLE_WINDOW_SECS;
                debug!(
                    window = self.window,
                    samples = voltage.len(),
                    rms = self.stats.rms(),
                    "ripple window acquired"
                );
                Some(Ok(RippleWindow {
                    window: self.window,
                    time,
                    voltage,
                    stats: self.stats,
                }))
            }
            Err(err) => {
                error!(window = self.window + 1, error = %err, "ripple acquisition failed");
                self.abandon().await;
                Some(Err(err))
            }
        }
    }

    async fn acquire(&self) -> BenchResult<Vec<f64>> {
        let scope = self
            .scope
            .as_ref()
            .ok_or_else(|| BenchError::SessionReleased("scope".into()))?
            .session()?;
        let span = self.remaining.min(RIPPLE_WINDOW_SECS);
        let count = (self.sample_rate * span) as usize;
        let timeout = Duration::try_from_secs_f64(self.remaining * 2.0).map_err(|err| {
            BenchError::Validation(format!("acquisition time {} s: {}", self.remaining, err))
        })?;

        scope.initiate().await?;
        let fetched = scope.fetch(count, timeout).await;
        let aborted = scope.abort().await;
        let samples = fetched?;
        aborted?;
        Ok(samples)
    }

    async fn release(&mut self) -> BenchResult<()> {
        let scope = self.scope.take();
        let supplies = std::mem::take(&mut self.supplies);
        let scope_outcome = match scope {
            Some(scope) => scope.shutdown().await,
            None => Ok(()),
        };
        let supplies_outcome = shutdown_all(supplies).await;
        scope_outcome.and(supplies_outcome)
    }

    async fn abandon(&mut self) {
        if let Some(scope) = self.scope.take() {
            scope.recover().await;
        }
        recover_all(std::mem::take(&mut self.supplies)).await;
    }

    /// Adapt into a [`futures::Stream`].
    pub fn into_stream(self) -> impl Stream<Item = BenchResult<RippleWindow>> {
        stream::unfold(self, |mut this| async move {
            this.next().await.map(|item| (item, this))
        })
    }
}
