//! Sequential batch analysis of one protocol

use crate::source::TraceSource;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use wcp_core::{ResultTable, Trace, TrialKey, WcpResult};
use wcp_processing::{AnalysisContext, AnalysisOutcome, FilterChain, TraceAnalyzer, TraceResult};

/// Cooperative cancellation flag, checked between trials
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchStatus {
    /// Every trial was attempted
    Completed,
    /// Stopped between trials through the stop handle
    Stopped,
    /// The reviewer aborted a detection
    Aborted,
}

/// Counters of one run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchStats {
    pub trials_total: usize,
    pub trials_processed: usize,
    pub trials_failed: usize,
    pub total_analysis_time_us: u64,
    pub fits_attempted: usize,
    pub fits_rejected: usize,
}

impl BatchStats {
    pub fn average_latency_us(&self) -> u64 {
        if self.trials_processed == 0 {
            0
        } else {
            self.total_analysis_time_us / self.trials_processed as u64
        }
    }
}

/// Result table of a run with its status
#[derive(Debug, Clone)]
pub struct BatchRun<E, S> {
    pub table: ResultTable<E, S>,
    pub status: BatchStatus,
    pub stats: BatchStats,
}

/// Runs one analyzer over every selected trial of a protocol
pub struct BatchRunner<'a> {
    source: &'a dyn TraceSource,
    filters: FilterChain,
    stop: StopHandle,
}

impl<'a> BatchRunner<'a> {
    pub fn new(source: &'a dyn TraceSource) -> Self {
        Self {
            source,
            filters: FilterChain::new(),
            stop: StopHandle::new(),
        }
    }

    /// Conditioning applied to every trace before analysis
    pub fn with_filters(mut self, filters: FilterChain) -> Self {
        self.filters = filters;
        self
    }

    /// Share an existing stop handle
    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Trials of `protocol` whose cell is selected
    pub fn trials(&self, protocol: &str) -> Vec<TrialKey> {
        let selected = self.source.selected_cells();
        self.source
            .iterate_trials(protocol)
            .into_iter()
            .filter(|k| selected.contains(&k.cell))
            .collect()
    }

    fn analyze_trace<A: TraceAnalyzer>(
        &self,
        analyzer: &A,
        trace: &Trace,
        ctx: &mut AnalysisContext<'_>,
    ) -> WcpResult<AnalysisOutcome<TraceResult<A::Event, A::Summary>>> {
        if let Some(stimulus) = trace.stimulus() {
            stimulus.validate()?;
        }
        let conditioned = self.filters.apply_trace(trace)?;
        analyzer.analyze(&conditioned, ctx)
    }

    /// Analyze the protocol. Failing trials are recorded in the table and the
    /// run goes on; a missing trace ends the run with an error.
    pub fn run<A: TraceAnalyzer>(
        &self,
        analyzer: &A,
        protocol: &str,
        ctx: &mut AnalysisContext<'_>,
    ) -> WcpResult<BatchRun<A::Event, A::Summary>> {
        let trials = self.trials(protocol);
        let mut table = ResultTable::new(protocol);
        let mut stats = BatchStats {
            trials_total: trials.len(),
            ..BatchStats::default()
        };
        let mut status = BatchStatus::Completed;
        info!(
            analyzer = analyzer.name(),
            protocol,
            trials = trials.len(),
            run_id = %table.run_id,
            "starting batch run"
        );

        for (i, key) in trials.iter().enumerate() {
            if self.stop.is_stopped() {
                info!(processed = i, "batch run stopped");
                status = BatchStatus::Stopped;
                break;
            }
            ctx.progress(format!("{} {}: {}/{} {}", analyzer.name(), protocol, i + 1, trials.len(), key));

            let trace = self.source.load_trace(key.cell, key.trial).map_err(|e| {
                error!(%key, error = %e, "batch run aborted");
                e
            })?;

            match self.analyze_trace(analyzer, &trace, ctx) {
                Ok(AnalysisOutcome::Completed(result)) => {
                    stats.trials_processed += 1;
                    stats.total_analysis_time_us += result.metrics.analysis_time_us;
                    stats.fits_attempted += result.metrics.fits_attempted;
                    stats.fits_rejected += result.metrics.fits_rejected;
                    table.push_trial(*key, result.events, result.summary);
                }
                Ok(AnalysisOutcome::Aborted) => {
                    info!(%key, "detection aborted by reviewer");
                    status = BatchStatus::Aborted;
                    break;
                }
                Err(e) if e.aborts_batch() => {
                    error!(%key, error = %e, "batch run aborted");
                    return Err(e);
                }
                Err(e) => {
                    warn!(%key, error = %e, "trial failed");
                    ctx.progress(format!("{} failed: {}", key, e));
                    stats.trials_failed += 1;
                    table.push_failure(*key, e.to_string());
                }
            }
        }

        info!(
            ?status,
            processed = stats.trials_processed,
            failed = stats.trials_failed,
            avg_latency_us = stats.average_latency_us(),
            "batch run finished"
        );
        Ok(BatchRun { table, status, stats })
    }
}
