//! Miniature synaptic event detection
//!
//! The trace is conditioned (polarity, median prefilter, scale, detrend,
//! lowpass) and its derivative is scanned for rise, peak and trough
//! candidates. A peak close enough after a rise becomes an event when its
//! amplitude over the local baseline is large enough and a double
//! exponential fits its decay. Peaks closer than the stacking window are
//! resolved together.

use crate::analyzer::{AnalysisMetrics, AnalysisTimer, TraceAnalyzer, TraceResult};
use crate::filters::{derivative, remove_linear_trend, smooth, thresholded_median_filter};
use crate::fitting::{levenberg_marquardt, DoubleExponential, FitOptions, Model};
use crate::inspect::{AnalysisContext, AnalysisOutcome, DetectionDecision, FitReview, PlotRequest};
use crate::params::{MiniParams, Parameterized};
use crate::stats;
use tracing::{debug, trace};
use wcp_core::{trace_error, MiniRecord, MiniTrialSummary, Trace, WcpResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum CandidateKind {
    Rise,
    Peak,
    Trough,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Candidate {
    index: usize,
    kind: CandidateKind,
}

/// Conditioned trace and its derivative, in scaled units
#[derive(Debug, Clone)]
pub struct ConditionedTrace {
    /// Window start in seconds, added back to event times
    pub offset: f64,
    /// Detrended scaled samples
    pub detrended: Vec<f64>,
    /// Lowpass filtered `detrended`
    pub smoothed: Vec<f64>,
    /// Derivative of `smoothed`, units per second
    pub slope: Vec<f64>,
}

/// Rise/peak scanning detector with double-exponential decay fits
#[derive(Debug, Clone)]
pub struct MiniDetector {
    params: MiniParams,
    fit_options: FitOptions,
}

impl MiniDetector {
    pub fn new(params: MiniParams) -> WcpResult<Self> {
        params.validate()?;
        Ok(Self {
            params,
            fit_options: FitOptions::default(),
        })
    }

    pub fn with_fit_options(mut self, options: FitOptions) -> Self {
        self.fit_options = options;
        self
    }

    pub fn params(&self) -> &MiniParams {
        &self.params
    }

    /// Window, flip, median-filter, scale, detrend, lowpass and differentiate
    pub fn condition(&self, trace: &Trace) -> WcpResult<ConditionedTrace> {
        let p = &self.params;
        let [w0, w1] = p.window;
        let (samples, offset) = if w0 != w1 {
            (trace.window_time(w0, w1), w0)
        } else {
            (trace.samples(), 0.0)
        };
        if samples.len() < 4 {
            return Err(trace_error!("analysis window holds {} samples", samples.len()));
        }

        let sign = p.polarity.factor();
        let flipped: Vec<f64> = samples.iter().map(|v| v * sign).collect();
        let filtered = thresholded_median_filter(&flipped, p.median_window, p.median_threshold)?;
        let scaled: Vec<f64> = filtered.iter().map(|v| v * p.scale).collect();
        let detrended = remove_linear_trend(&scaled);
        let smoothed = smooth(&detrended, trace.sample_rate(), p.low_band_width)?;
        let slope = derivative(&smoothed, trace.sample_rate());

        Ok(ConditionedTrace {
            offset,
            detrended,
            smoothed,
            slope,
        })
    }

    /// Sorted rise, peak and trough candidates followed by an end sentinel.
    /// One candidate per index; a rise wins over a trough at the same sample.
    fn candidates(&self, slope: &[f64], len: usize) -> Vec<Candidate> {
        let rise_slope = self.params.rise_slope * self.params.scale;
        let mut list = Vec::new();
        for (k, w) in slope.windows(2).enumerate() {
            let (a, b) = (w[0], w[1]);
            let index = k + 1;
            if a > 0.0 && b < 0.0 {
                list.push(Candidate { index, kind: CandidateKind::Peak });
            }
            if a < 0.0 && b > 0.0 {
                list.push(Candidate { index, kind: CandidateKind::Trough });
            }
            if a < rise_slope && rise_slope < b {
                list.push(Candidate { index, kind: CandidateKind::Rise });
            }
        }
        list.sort();
        list.dedup_by_key(|c| c.index);
        list.push(Candidate { index: len, kind: CandidateKind::End });
        list
    }

    fn scan(
        &self,
        data: &ConditionedTrace,
        sample_rate: f64,
        ctx: &mut AnalysisContext<'_>,
        timer: &mut AnalysisTimer,
    ) -> Vec<MiniRecord> {
        let p = &self.params;
        let x = &data.detrended;
        let fx = &data.smoothed;
        let candidates = self.candidates(&data.slope, x.len());
        timer.add_candidates(candidates.len() - 1);

        let rise_samples = p.rise_time * sample_rate;
        let stack_samples = p.stack_win * sample_rate;
        let baseline_samples = (p.baseline_window * sample_rate) as usize;
        let min_amp = p.min_amp * p.scale;

        let mut reviewing = ctx.is_interactive();
        let mut last_rise: Option<usize> = None;
        let mut last2_rise: Option<usize> = None;
        let mut baseline = 0.0;
        let mut stack: Vec<usize> = Vec::new();
        let mut records = Vec::new();

        for i in 0..candidates.len() - 1 {
            let candidate = candidates[i];
            let next = candidates[i + 1].index;
            match candidate.kind {
                CandidateKind::Rise => {
                    last2_rise = last_rise;
                    last_rise = Some(candidate.index);
                }
                CandidateKind::Peak => {
                    let Some(rise) = last_rise else { continue };
                    let peak = candidate.index;
                    let near_rise = ((peak - rise) as f64) < rise_samples;
                    if !near_rise && stack.is_empty() {
                        continue;
                    }
                    if let Some(&first) = stack.first() {
                        if ((next - first) as f64) < stack_samples {
                            stack.push(peak);
                            continue;
                        }
                    }

                    let refresh = match last2_rise {
                        None => true,
                        Some(r2) => (r2 as f64) < rise as f64 - baseline_samples as f64,
                    };
                    if refresh {
                        let lo = rise.saturating_sub(baseline_samples);
                        if let Some(m) = stats::mean(&x[lo..rise]) {
                            baseline = m;
                        }
                    }

                    let mut amp = fx[peak] - baseline;
                    if !(min_amp < amp || !stack.is_empty()) {
                        continue;
                    }
                    if stack.is_empty()
                        && ((next - peak) as f64) < stack_samples
                        && i + 3 < candidates.len()
                        && candidates[i + 2].kind != CandidateKind::Rise
                    {
                        stack.push(peak);
                        continue;
                    }

                    let mut event_peak = peak;
                    if !stack.is_empty() {
                        // The resolving peak belongs to the stacked event
                        stack.push(peak);
                        event_peak = stack
                            .iter()
                            .copied()
                            .max_by(|&a, &b| fx[a].total_cmp(&fx[b]))
                            .unwrap_or(peak);
                        amp = fx[event_peak] - baseline;
                        stack.clear();
                    }

                    if let Some(record) =
                        self.fit_event(data, sample_rate, rise, event_peak, next, amp, baseline, ctx, timer, &mut reviewing)
                    {
                        records.push(record);
                    }
                }
                CandidateKind::Trough | CandidateKind::End => {}
            }
        }
        records
    }

    #[allow(clippy::too_many_arguments)]
    fn fit_event(
        &self,
        data: &ConditionedTrace,
        sample_rate: f64,
        rise: usize,
        peak: usize,
        end: usize,
        amp: f64,
        baseline: f64,
        ctx: &mut AnalysisContext<'_>,
        timer: &mut AnalysisTimer,
        reviewing: &mut bool,
    ) -> Option<MiniRecord> {
        let p = &self.params;
        let segment = &data.detrended[rise..end];
        let time: Vec<f64> = (0..segment.len()).map(|t| t as f64).collect();
        let guess = [
            p.off_tau_ini,
            p.on_tau_ini,
            (data.smoothed[rise] + amp - baseline).max(0.0),
            amp.max(0.0),
            baseline,
        ];
        let rise_time = rise as f64 / sample_rate + data.offset;

        let fit = match levenberg_marquardt(&DoubleExponential, &time, segment, &guess, &self.fit_options) {
            Ok(fit) => fit,
            Err(e) => {
                timer.record_fit(false);
                ctx.progress(format!("fit failed for event at {:.4} s: {}", rise_time, e));
                return None;
            }
        };

        let decay_tau = fit.params[0] / sample_rate;
        let accepted = p.min_tau < decay_tau && fit.residual < p.residual;
        timer.record_fit(accepted);
        trace!(rise, peak, decay_tau, residual = fit.residual, accepted, "mini fit");

        if *reviewing {
            let curve: Vec<f64> = time.iter().map(|&t| DoubleExponential.eval(t, &fit.params)).collect();
            let request = PlotRequest::new(format!("event fit at {:.4} s", rise_time), segment.to_vec(), sample_rate)
                .with_overlay(curve);
            ctx.plot(&request);
            if ctx.inspector.review_fit(&request) == FitReview::Continue {
                *reviewing = false;
            }
        }

        if !accepted {
            ctx.progress(format!(
                "rejected event at {:.4} s: tau {:.3e} s, residual {:.3}",
                rise_time, decay_tau, fit.residual
            ));
            return None;
        }

        Some(MiniRecord {
            rise_time,
            peak_time: peak as f64 / sample_rate + data.offset,
            amplitude: amp / p.scale,
            decay_tau,
            rise_tau: fit.params[1] / sample_rate,
            residual: fit.residual,
        })
    }
}

impl TraceAnalyzer for MiniDetector {
    type Event = MiniRecord;
    type Summary = MiniTrialSummary;

    fn name(&self) -> &str {
        "mini"
    }

    fn analyze(
        &self,
        trace: &Trace,
        ctx: &mut AnalysisContext<'_>,
    ) -> WcpResult<AnalysisOutcome<TraceResult<MiniRecord, MiniTrialSummary>>> {
        let mut timer = AnalysisMetrics::start_timing();
        let sr = trace.sample_rate();
        let data = self.condition(trace)?;
        timer.set_samples(data.detrended.len());

        let records = self.scan(&data, sr, ctx, &mut timer);
        debug!(events = records.len(), "mini detection finished");

        if ctx.is_interactive() {
            let request = PlotRequest::new("detected events", data.detrended.clone(), sr)
                .with_overlay(data.smoothed.clone())
                .with_markers(records.iter().map(|r| r.peak_time - data.offset).collect());
            ctx.plot(&request);
            if ctx.inspector.review_detection(&request) == DetectionDecision::Abort {
                return Ok(AnalysisOutcome::Aborted);
            }
        }

        let [w0, w1] = self.params.window;
        let duration = if w0 != w1 {
            w1.min(trace.duration()) - w0
        } else {
            trace.duration()
        };
        let summary = MiniTrialSummary {
            event_count: records.len(),
            duration,
        };
        Ok(AnalysisOutcome::Completed(TraceResult {
            events: records,
            summary,
            metrics: timer.finish(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspect::{CollectingSink, HeadlessInspector, NullSink, ScriptedInspector};
    use wcp_simulation::{MiniEvent, PatchSimulator, SimulationConfig};

    const SR: f64 = 20_000.0;

    fn mini_trace(times: &[f64], noise: f64) -> Trace {
        let mut sim = PatchSimulator::new(SimulationConfig {
            sample_rate: SR,
            duration: 1.0,
            noise_std: noise,
            seed: 11,
        })
        .unwrap();
        let events: Vec<MiniEvent> = times.iter().map(|&t| MiniEvent::new(t, -30e-12)).collect();
        sim.minis(&events).unwrap()
    }

    fn loose() -> MiniParams {
        MiniParams {
            residual: 1e6,
            ..MiniParams::default()
        }
    }

    fn run(detector: &MiniDetector, trace: &Trace) -> TraceResult<MiniRecord, MiniTrialSummary> {
        let mut inspector = HeadlessInspector;
        let mut sink = NullSink;
        let mut ctx = AnalysisContext::new(&mut inspector, &mut sink);
        detector.analyze(trace, &mut ctx).unwrap().completed().unwrap()
    }

    #[test]
    fn test_flat_trace_has_no_events() {
        let detector = MiniDetector::new(MiniParams::default()).unwrap();
        let trace = Trace::new(vec![0.0; 20_000], SR).unwrap();
        let result = run(&detector, &trace);
        assert!(result.events.is_empty());
        assert!((result.summary.duration - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_separated_events_detected() {
        let detector = MiniDetector::new(loose()).unwrap();
        let result = run(&detector, &mini_trace(&[0.2, 0.5, 0.8], 0.0));

        assert_eq!(result.events.len(), 3);
        for (record, expected) in result.events.iter().zip([0.2, 0.5, 0.8]) {
            assert!((record.rise_time - expected).abs() < 0.003);
            assert!(record.peak_time > record.rise_time);
            assert!(record.amplitude > 10e-12);
            assert!(record.decay_tau > detector.params().min_tau);
        }
    }

    #[test]
    fn test_window_offsets_event_times() {
        let detector = MiniDetector::new(MiniParams {
            window: [0.4, 0.9],
            ..loose()
        })
        .unwrap();
        let result = run(&detector, &mini_trace(&[0.2, 0.5, 0.8], 0.0));

        assert_eq!(result.events.len(), 2);
        assert!((result.events[0].rise_time - 0.5).abs() < 0.003);
        assert!((result.summary.duration - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_fit_limits_reject_events() {
        let trace = mini_trace(&[0.2, 0.5, 0.8], 0.0);
        let accepted = run(&MiniDetector::new(loose()).unwrap(), &trace);
        assert_eq!(accepted.events.len(), 3);
        for record in &accepted.events {
            assert!(record.decay_tau > MiniParams::default().min_tau);
            assert!(record.residual < loose().residual);
        }

        let detector = MiniDetector::new(MiniParams {
            min_tau: 0.1,
            ..loose()
        })
        .unwrap();
        let mut inspector = HeadlessInspector;
        let mut sink = CollectingSink::default();
        let mut ctx = AnalysisContext::new(&mut inspector, &mut sink);
        let result = detector.analyze(&trace, &mut ctx).unwrap().completed().unwrap();

        assert!(result.events.is_empty());
        assert_eq!(result.summary.event_count, 0);
        assert!(result.metrics.fits_rejected >= 3);
        assert_eq!(result.metrics.fits_rejected, result.metrics.fits_attempted);
        assert!(sink.messages.iter().filter(|m| m.starts_with("rejected event")).count() >= 3);
    }

    const CRAFTED_SR: f64 = 1_000.0;
    const CRAFTED_RISE: usize = 20;

    /// 100 slope samples of 100 units/s with `overrides` applied
    fn slopes(overrides: &[(std::ops::Range<usize>, f64)]) -> Vec<f64> {
        let mut slope = vec![100.0; 100];
        for (range, value) in overrides {
            slope[range.clone()].fill(*value);
        }
        slope
    }

    /// Flat data with smoothed `peaks` and, from the rise on, a decay equal
    /// to the initial fit guess for the largest peak
    fn crafted(slope: Vec<f64>, peaks: &[(usize, f64)], ripple: f64) -> ConditionedTrace {
        let n = slope.len();
        let mut smoothed = vec![0.0; n];
        for &(i, v) in peaks {
            smoothed[i] = v;
        }
        let amp = peaks.iter().map(|p| p.1).fold(0.0, f64::max);
        let detrended = (0..n)
            .map(|i| match i.checked_sub(CRAFTED_RISE) {
                None => 0.0,
                Some(t) => {
                    let sign = if t % 2 == 0 { 1.0 } else { -1.0 };
                    DoubleExponential.eval(t as f64, &[20.0, 1.0, amp, amp, 0.0]) + sign * ripple
                }
            })
            .collect();
        ConditionedTrace {
            offset: 0.0,
            detrended,
            smoothed,
            slope,
        }
    }

    fn scan(detector: &MiniDetector, data: &ConditionedTrace) -> (Vec<MiniRecord>, AnalysisMetrics, Vec<String>) {
        let mut inspector = HeadlessInspector;
        let mut sink = CollectingSink::default();
        let mut timer = AnalysisMetrics::start_timing();
        let records = {
            let mut ctx = AnalysisContext::new(&mut inspector, &mut sink);
            detector.scan(data, CRAFTED_SR, &mut ctx, &mut timer)
        };
        (records, timer.finish(), sink.messages)
    }

    #[test]
    fn test_one_candidate_per_index() {
        let detector = MiniDetector::new(MiniParams::default()).unwrap();
        let found: Vec<(usize, CandidateKind)> = detector
            .candidates(&[1.0, -1.0, 5000.0, -1.0, 1.0], 6)
            .iter()
            .map(|c| (c.index, c.kind))
            .collect();
        assert_eq!(
            found,
            vec![
                (1, CandidateKind::Peak),
                (2, CandidateKind::Rise),
                (3, CandidateKind::Peak),
                (4, CandidateKind::Trough),
                (6, CandidateKind::End),
            ]
        );
    }

    #[test]
    fn test_crafted_event_accepted() {
        let detector = MiniDetector::new(MiniParams::default()).unwrap();
        let data = crafted(slopes(&[(20..22, 5000.0), (22..60, -100.0)]), &[(22, 40.0)], 0.0);
        let (records, metrics, _) = scan(&detector, &data);

        assert_eq!(records.len(), 1);
        assert!((records[0].rise_time - 0.02).abs() < 1e-12);
        assert!((records[0].peak_time - 0.022).abs() < 1e-12);
        assert!((records[0].amplitude - 40e-12).abs() < 1e-20);
        assert!((records[0].decay_tau - 0.02).abs() < 1e-9);
        assert_eq!((metrics.fits_attempted, metrics.fits_rejected), (1, 0));
    }

    #[test]
    fn test_short_decay_rejected() {
        let detector = MiniDetector::new(MiniParams {
            min_tau: 0.05,
            ..MiniParams::default()
        })
        .unwrap();
        let data = crafted(slopes(&[(20..22, 5000.0), (22..60, -100.0)]), &[(22, 40.0)], 0.0);
        let (records, metrics, messages) = scan(&detector, &data);

        assert!(records.is_empty());
        assert_eq!((metrics.fits_attempted, metrics.fits_rejected), (1, 1));
        assert_eq!(messages.len(), 1);
        assert!(messages[0].starts_with("rejected event at 0.0200 s"));
    }

    #[test]
    fn test_poor_fit_rejected() {
        let detector = MiniDetector::new(MiniParams::default()).unwrap();
        let data = crafted(slopes(&[(20..22, 5000.0), (22..60, -100.0)]), &[(22, 40.0)], 0.5);
        let (records, metrics, _) = scan(&detector, &data);

        assert!(records.is_empty());
        assert_eq!(metrics.fits_rejected, 1);
    }

    #[test]
    fn test_stacked_peaks_merge_at_maximum() {
        let detector = MiniDetector::new(MiniParams::default()).unwrap();
        // rise at 20, peaks at 22 and 26 with a trough at 24 between them
        let slope = slopes(&[(20..22, 5000.0), (22..24, -100.0), (26..60, -100.0)]);
        let data = crafted(slope, &[(22, 30.0), (26, 40.0)], 0.0);
        let (records, metrics, _) = scan(&detector, &data);

        assert_eq!(metrics.candidates, 5);
        assert_eq!(records.len(), 1);
        assert!((records[0].rise_time - 0.02).abs() < 1e-12);
        assert!((records[0].peak_time - 0.026).abs() < 1e-12);
        assert!((records[0].amplitude - 40e-12).abs() < 1e-20);
    }

    #[test]
    fn test_fit_review_continue_stops_reviewing() {
        let detector = MiniDetector::new(loose()).unwrap();
        let mut inspector = ScriptedInspector::new().with_fit_reviews([FitReview::Step, FitReview::Continue]);
        let mut sink = CollectingSink::default();
        let mut ctx = AnalysisContext::new(&mut inspector, &mut sink);
        let result = detector
            .analyze(&mini_trace(&[0.2, 0.5, 0.8], 0.0), &mut ctx)
            .unwrap()
            .completed()
            .unwrap();

        assert_eq!(result.events.len(), 3);
        // two fit reviews plus the final detection review
        assert_eq!(sink.plots.len(), 3);
    }

    #[test]
    fn test_detection_abort() {
        let detector = MiniDetector::new(loose()).unwrap();
        let mut inspector = ScriptedInspector::new().with_detections([DetectionDecision::Abort]);
        let mut sink = NullSink;
        let mut ctx = AnalysisContext::new(&mut inspector, &mut sink);
        let outcome = detector.analyze(&mini_trace(&[0.2], 0.0), &mut ctx).unwrap();
        assert!(outcome.is_aborted());
    }
}
