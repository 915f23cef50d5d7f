//! Common analyzer trait and timing metrics

use crate::inspect::{AnalysisContext, AnalysisOutcome};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use wcp_core::{Columns, Trace, WcpResult};

/// Per-trace analysis algorithm
pub trait TraceAnalyzer: Send + Sync {
    /// Per-event record
    type Event: Columns + Clone;
    /// Per-trial summary
    type Summary: Columns + Clone;

    /// Analysis kind, used in table and file names
    fn name(&self) -> &str;

    /// Analyze one trace. Input problems are errors; a reviewer abort is
    /// `AnalysisOutcome::Aborted`.
    fn analyze(
        &self,
        trace: &Trace,
        ctx: &mut AnalysisContext<'_>,
    ) -> WcpResult<AnalysisOutcome<TraceResult<Self::Event, Self::Summary>>>;
}

/// Events and summary of one analyzed trace
#[derive(Debug, Clone)]
pub struct TraceResult<E, S> {
    pub events: Vec<E>,
    pub summary: S,
    pub metrics: AnalysisMetrics,
}

/// Cost of one analyzer call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisMetrics {
    /// Wall-clock analysis time in microseconds
    pub analysis_time_us: u64,
    /// Samples examined
    pub samples: usize,
    /// Candidate events considered before acceptance tests
    pub candidates: usize,
    /// Curve fits attempted
    pub fits_attempted: usize,
    /// Curve fits rejected or failed
    pub fits_rejected: usize,
    pub success: bool,
    pub error_message: Option<String>,
}

impl Default for AnalysisMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AnalysisMetrics {
    pub fn new() -> Self {
        Self {
            analysis_time_us: 0,
            samples: 0,
            candidates: 0,
            fits_attempted: 0,
            fits_rejected: 0,
            success: true,
            error_message: None,
        }
    }

    /// Start timing an analysis
    pub fn start_timing() -> AnalysisTimer {
        AnalysisTimer {
            start_time: Instant::now(),
            metrics: AnalysisMetrics::new(),
        }
    }

    /// Fraction of attempted fits that were kept
    pub fn fit_acceptance(&self) -> f64 {
        if self.fits_attempted == 0 {
            return 1.0;
        }
        (self.fits_attempted - self.fits_rejected) as f64 / self.fits_attempted as f64
    }
}

/// Helper for timing analyzer calls
pub struct AnalysisTimer {
    start_time: Instant,
    metrics: AnalysisMetrics,
}

impl AnalysisTimer {
    /// Finish timing and return metrics
    pub fn finish(mut self) -> AnalysisMetrics {
        self.metrics.analysis_time_us = self.start_time.elapsed().as_micros() as u64;
        self.metrics
    }

    /// Finish with error
    pub fn finish_with_error(mut self, error: &str) -> AnalysisMetrics {
        self.metrics.analysis_time_us = self.start_time.elapsed().as_micros() as u64;
        self.metrics.success = false;
        self.metrics.error_message = Some(error.to_string());
        self.metrics
    }

    pub fn set_samples(&mut self, samples: usize) {
        self.metrics.samples = samples;
    }

    pub fn add_candidates(&mut self, count: usize) {
        self.metrics.candidates += count;
    }

    /// Record one fit attempt and whether it was kept
    pub fn record_fit(&mut self, accepted: bool) {
        self.metrics.fits_attempted += 1;
        if !accepted {
            self.metrics.fits_rejected += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_analysis_metrics() {
        let mut timer = AnalysisMetrics::start_timing();
        timer.set_samples(100);
        timer.record_fit(true);
        timer.record_fit(false);
        std::thread::sleep(Duration::from_millis(1));
        let metrics = timer.finish();

        assert!(metrics.analysis_time_us > 0);
        assert!(metrics.success);
        assert_eq!(metrics.samples, 100);
        assert!((metrics.fit_acceptance() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_finish_with_error() {
        let metrics = AnalysisMetrics::start_timing().finish_with_error("no stimulus");
        assert!(!metrics.success);
        assert_eq!(metrics.error_message.as_deref(), Some("no stimulus"));
    }
}
