//! Action potential detection and per-spike shape metrics

use crate::analyzer::{AnalysisMetrics, TraceAnalyzer, TraceResult};
use crate::inspect::{AnalysisContext, AnalysisOutcome, DetectionDecision, PlotRequest};
use crate::params::{Parameterized, SpikeParams};
use crate::stats;
use tracing::{debug, warn};
use wcp_core::{SpikeRecord, SpikeTrialSummary, Stimulus, Trace, WcpResult};

/// Threshold-based spike detector
#[derive(Debug, Clone)]
pub struct SpikeDetector {
    params: SpikeParams,
}

impl SpikeDetector {
    pub fn new(params: SpikeParams) -> WcpResult<Self> {
        params.validate()?;
        Ok(Self { params })
    }

    pub fn params(&self) -> &SpikeParams {
        &self.params
    }

    /// Onset sample indices inside the stimulation window, strictly increasing.
    ///
    /// `x` must already carry the detection polarity.
    pub fn detect_onsets(&self, x: &[f64], sample_rate: f64, stimulus: &Stimulus) -> Vec<usize> {
        if x.len() < 2 {
            return Vec::new();
        }
        let slopes: Vec<f64> = x.windows(2).map(|w| (w[1] - w[0]) * sample_rate).collect();
        let rises: Vec<usize> = (0..slopes.len())
            .filter(|&k| slopes[k] > self.params.slope_threshold)
            .collect();
        let falls: Vec<usize> = (0..slopes.len()).filter(|&k| slopes[k] < 0.0).collect();

        let window_start = stimulus.start * sample_rate;
        let window_end = stimulus.end() * sample_rate;
        let max_width = self.params.half_width_threshold * sample_rate;

        let mut onsets = Vec::new();
        let (mut i, mut j) = (0, 0);
        while i < rises.len() && j < falls.len() && (rises[i] as f64) < window_end {
            let rise = rises[i];
            if (rise as f64) < window_start {
                i += 1;
                continue;
            }
            let peak = falls[j];
            if rise >= peak {
                j += 1;
                continue;
            }
            if x[peak] - x[rise] > self.params.peak_threshold && ((peak - rise) as f64) < max_width {
                onsets.push(rise);
                while i < rises.len() && rises[i] < peak {
                    i += 1;
                }
            } else {
                i += 1;
            }
        }
        onsets
    }

    /// Shape metrics for each onset. `x` carries the detection polarity;
    /// threshold voltages are reported in the units of the raw trace.
    ///
    /// Every spike gets an mAHP, the last one included: its window is
    /// bounded by the trace end instead of a following onset. An onset
    /// whose window holds fewer than two samples has no metrics.
    pub fn spike_metrics(&self, x: &[f64], sample_rate: f64, onsets: &[usize]) -> Vec<SpikeRecord> {
        let sign = self.params.polarity.factor();
        let last_window = ((self.params.last_spike_window * sample_rate) as usize).max(2);
        let mahp_begin = (self.params.mahp_begin * sample_rate) as usize;
        let mahp_end = (self.params.mahp_end * sample_rate) as usize;

        let mut records = Vec::with_capacity(onsets.len());
        for (k, &start) in onsets.iter().enumerate() {
            let next = match onsets.get(k + 1) {
                Some(&n) => n,
                None => (start + last_window).min(x.len()),
            };
            if next <= start + 1 {
                warn!(onset = start, "spike window too short for metrics");
                continue;
            }
            let span = &x[start..next];
            let peak_rel = stats::argmax(span).unwrap_or(0);
            let peak = start + peak_rel;
            let trough_rel = stats::argmin(&x[peak..next]).unwrap_or(0);
            let trough = peak + trough_rel;

            let slope = if peak_rel < 2 {
                (x[start + 1] - x[start]) * sample_rate
            } else {
                x[start..start + peak_rel]
                    .windows(2)
                    .map(|w| w[1] - w[0])
                    .fold(f64::NEG_INFINITY, f64::max)
                    * sample_rate
            };

            let amplitude = x[peak] - x[start];
            let half = x[start] + amplitude / 2.0;
            let pre = x[start..peak].iter().position(|&v| v > half);
            let post = x[peak..trough].iter().rposition(|&v| v > half).unwrap_or(0);
            let half_width = match pre {
                Some(pre) => (peak_rel - pre + post) as f64 / sample_rate,
                None => (post + 1) as f64 / sample_rate,
            };

            // mAHP window is bounded by the next onset, or the trace end for the last spike
            let bound = onsets.get(k + 1).copied().unwrap_or(x.len());
            let lo = start + mahp_begin;
            let mahp = if lo < bound {
                let hi = (start + mahp_end).min(bound);
                stats::min(&x[lo..hi]).map(|m| x[start] - m)
            } else {
                None
            };

            records.push(SpikeRecord {
                onset: start,
                onset_time: start as f64 / sample_rate,
                peak_time: peak as f64 / sample_rate,
                trough_time: trough as f64 / sample_rate,
                slope,
                amplitude,
                threshold: sign * x[start],
                half_width,
                mahp,
            });
        }
        records
    }

    /// Trial summary over `onset_count` detected onsets, metrics or not
    pub fn trial_summary(&self, trace: &Trace, stimulus: &Stimulus, onset_count: usize) -> SpikeTrialSummary {
        SpikeTrialSummary {
            stimulus_amplitude: stimulus.amplitude,
            rate: onset_count as f64 / stimulus.duration,
            spike_count: onset_count,
            sahp: self.sahp(trace, stimulus),
        }
    }

    /// Slow afterhyperpolarization: pre-stimulus baseline mean minus the
    /// mean of the post-stimulus window. `None` when a window lies outside
    /// the trace.
    pub fn sahp(&self, trace: &Trace, stimulus: &Stimulus) -> Option<f64> {
        let before = trace.window_time(stimulus.start - self.params.baseline, stimulus.start);
        let after = trace.window_time(
            stimulus.end() + self.params.sahp_begin,
            stimulus.end() + self.params.sahp_end,
        );
        Some(stats::mean(before)? - stats::mean(after)?)
    }
}

impl TraceAnalyzer for SpikeDetector {
    type Event = SpikeRecord;
    type Summary = SpikeTrialSummary;

    fn name(&self) -> &str {
        "spike"
    }

    fn analyze(
        &self,
        trace: &Trace,
        ctx: &mut AnalysisContext<'_>,
    ) -> WcpResult<AnalysisOutcome<TraceResult<SpikeRecord, SpikeTrialSummary>>> {
        let mut timer = AnalysisMetrics::start_timing();
        let stimulus = trace.require_stimulus()?;
        let sr = trace.sample_rate();
        let sign = self.params.polarity.factor();
        let x: Vec<f64> = trace.samples().iter().map(|v| v * sign).collect();
        timer.set_samples(x.len());

        let onsets = self.detect_onsets(&x, sr, stimulus);
        timer.add_candidates(onsets.len());
        let records = self.spike_metrics(&x, sr, &onsets);
        debug!(spikes = records.len(), "spike detection finished");

        if ctx.is_interactive() {
            let request = PlotRequest::new("spike onsets", trace.samples().to_vec(), sr)
                .with_markers(records.iter().map(|r| r.onset_time).collect());
            ctx.plot(&request);
            if ctx.inspector.review_detection(&request) == DetectionDecision::Abort {
                return Ok(AnalysisOutcome::Aborted);
            }
        }

        let summary = self.trial_summary(trace, stimulus, onsets.len());
        Ok(AnalysisOutcome::Completed(TraceResult {
            events: records,
            summary,
            metrics: timer.finish(),
        }))
    }
}
