//! Passive membrane properties from step responses
//!
//! A single exponential fitted to the charging curve gives access (series)
//! resistance, input resistance and capacitance. Failed or suspicious fits go
//! through the inspector until the reviewer accepts, refilters or abandons.

use crate::analyzer::{AnalysisMetrics, AnalysisTimer, TraceAnalyzer, TraceResult};
use crate::filters::thresholded_median_filter;
use crate::fitting::{fit_exponential_decay, DecayFit};
use crate::inspect::{AnalysisContext, AnalysisOutcome, FitReport, FitResolution, PlotRequest};
use crate::params::{Parameterized, Polarity, SealTestParams, SubthresholdParams};
use crate::stats;
use tracing::{debug, info};
use wcp_core::{trace_error, ClampMode, MembraneFitStatus, MembraneSummary, Trace, WcpError, WcpResult};

/// Median window of the reviewer-requested refilter
const REFILTER_WINDOW: usize = 5;

/// Which step protocol is analyzed
#[derive(Debug, Clone, PartialEq)]
pub enum MembraneTest {
    /// Test pulse at fixed times with a configured amplitude
    SealTest(SealTestParams),
    /// Stimulus step, windows relative to its onset, sag reported
    Subthreshold(SubthresholdParams),
}

/// Sample windows and step settings resolved for one trace
#[derive(Debug, Clone)]
struct StepLayout {
    clamp_mode: ClampMode,
    amplitude: f64,
    scale: f64,
    min_tau: f64,
    compensated: bool,
    baseline: (usize, usize),
    steady: (usize, usize),
    fit_start: usize,
    fit_end: usize,
    /// Peak-aligned fit start (voltage-clamp seal test)
    align_to_peak: bool,
    with_sag: bool,
}

/// Seal test and subthreshold step analyzer
#[derive(Debug, Clone)]
pub struct MembraneTestAnalyzer {
    test: MembraneTest,
}

impl MembraneTestAnalyzer {
    pub fn seal_test(params: SealTestParams) -> WcpResult<Self> {
        params.validate()?;
        Ok(Self {
            test: MembraneTest::SealTest(params),
        })
    }

    pub fn subthreshold(params: SubthresholdParams) -> WcpResult<Self> {
        params.validate()?;
        Ok(Self {
            test: MembraneTest::Subthreshold(params),
        })
    }

    pub fn test(&self) -> &MembraneTest {
        &self.test
    }

    fn layout(&self, trace: &Trace) -> WcpResult<StepLayout> {
        let idx = |t: f64| trace.index_at(t);
        match &self.test {
            MembraneTest::SealTest(p) => {
                let (amplitude, scale) = p.step();
                Ok(StepLayout {
                    clamp_mode: p.clamp_mode,
                    amplitude,
                    scale,
                    min_tau: p.min_tau,
                    compensated: p.compensated,
                    baseline: (idx(p.baseline_start), idx(p.baseline_end)),
                    steady: (idx(p.steady_state_start), idx(p.steady_state_end)),
                    fit_start: idx(p.seal_test_start),
                    fit_end: idx(p.fit_end),
                    align_to_peak: p.clamp_mode == ClampMode::Voltage,
                    with_sag: false,
                })
            }
            MembraneTest::Subthreshold(p) => {
                let stimulus = trace.require_stimulus()?;
                if stimulus.amplitude == 0.0 {
                    return Err(WcpError::InvalidStimulus {
                        reason: "subthreshold step has zero amplitude".to_string(),
                    });
                }
                let t0 = stimulus.start;
                Ok(StepLayout {
                    clamp_mode: p.clamp_mode,
                    amplitude: stimulus.amplitude,
                    scale: p.scale(),
                    min_tau: p.min_tau,
                    compensated: p.compensated,
                    baseline: (idx(t0 + p.baseline_start), idx(t0 + p.baseline_end)),
                    steady: (idx(t0 + p.steady_state_start), idx(t0 + p.steady_state_end)),
                    fit_start: idx(t0 + p.fit_start),
                    fit_end: idx(t0 + p.fit_end),
                    align_to_peak: false,
                    with_sag: true,
                })
            }
        }
    }

    /// Samples the analysis starts from
    fn prefilter(&self, samples: &[f64]) -> WcpResult<Vec<f64>> {
        match &self.test {
            MembraneTest::SealTest(_) => Ok(samples.to_vec()),
            MembraneTest::Subthreshold(p) => {
                thresholded_median_filter(samples, p.prefilter_window, p.prefilter_threshold)
            }
        }
    }

    fn fit(&self, x: &[f64], sample_rate: f64, layout: &StepLayout) -> WcpResult<(usize, DecayFit)> {
        let mut start = layout.fit_start;
        if layout.align_to_peak {
            let sign = layout.amplitude.signum();
            let end = layout.steady.1.min(x.len());
            if start < end {
                let signed: Vec<f64> = x[start..end].iter().map(|v| v * sign).collect();
                start += stats::argmax(&signed).unwrap_or(0);
            }
        }
        let end = layout.fit_end.min(x.len());
        if start >= end {
            return Err(WcpError::FitInput {
                reason: format!("fit starts at sample {} past the fit end {}", start, end),
            });
        }
        let polarity = Polarity::of(x[start] - x[end - 1]);
        let fit = fit_exponential_decay(x, sample_rate, layout.scale, start, end, polarity, None)?;
        Ok((start, fit))
    }

    /// Fit, then loop over the inspector until the fit is kept or abandoned.
    /// Returns the samples the final estimate is computed from.
    fn resolve(
        &self,
        raw: &[f64],
        mut x: Vec<f64>,
        sample_rate: f64,
        layout: &StepLayout,
        ctx: &mut AnalysisContext<'_>,
        timer: &mut AnalysisTimer,
    ) -> (Vec<f64>, Option<DecayFit>) {
        let mut attempt = self.fit(&x, sample_rate, layout);
        timer.record_fit(matches!(&attempt, Ok((_, f)) if f.tau >= layout.min_tau));

        loop {
            let suspicious = match &attempt {
                Ok((_, fit)) => fit.tau < layout.min_tau,
                Err(_) => true,
            };
            if !suspicious && !ctx.inspector.review_fits() {
                break;
            }

            let report = match &attempt {
                Ok((_, fit)) => FitReport {
                    x0: Some(fit.x0),
                    x_steady: Some(fit.x_steady),
                    tau: Some(fit.tau),
                    min_tau: layout.min_tau,
                    failure: None,
                },
                Err(e) => FitReport {
                    x0: None,
                    x_steady: None,
                    tau: None,
                    min_tau: layout.min_tau,
                    failure: Some(e.to_string()),
                },
            };
            if ctx.is_interactive() {
                let start = attempt.as_ref().map(|(s, _)| *s).unwrap_or(layout.fit_start);
                let request = PlotRequest::new("membrane fit", x.clone(), sample_rate).with_markers(vec![
                    start as f64 / sample_rate,
                    layout.fit_end as f64 / sample_rate,
                ]);
                ctx.plot(&request);
            }

            match ctx.inspector.resolve_fit_failure(&report) {
                FitResolution::Refilter(threshold) => {
                    match thresholded_median_filter(raw, REFILTER_WINDOW, threshold) {
                        Ok(filtered) => {
                            x = filtered;
                            attempt = self.fit(&x, sample_rate, layout);
                            timer.record_fit(matches!(&attempt, Ok((_, f)) if f.tau >= layout.min_tau));
                        }
                        Err(e) => ctx.progress(format!("refilter rejected: {}", e)),
                    }
                }
                FitResolution::Accept => {
                    if report.has_fit() {
                        break;
                    }
                    ctx.progress("no fit to accept");
                }
                FitResolution::Abandon => {
                    info!("membrane fit abandoned, using steady state only");
                    return (x, None);
                }
            }
        }

        (x, attempt.ok().map(|(_, fit)| fit))
    }

    fn summarize(&self, x: &[f64], layout: &StepLayout, fit: Option<DecayFit>, status: MembraneFitStatus) -> WcpResult<MembraneSummary> {
        let window = |(lo, hi): (usize, usize), name: &str| {
            let hi = hi.min(x.len());
            stats::mean(&x[lo.min(hi)..hi]).ok_or_else(|| trace_error!("{} window lies outside the trace", name))
        };
        let baseline = window(layout.baseline, "baseline")?;
        let steady = window(layout.steady, "steady-state")?;
        let a = layout.amplitude;
        let measured_steady = layout.with_sag;

        let (rin, rs, cm, tau) = match (&fit, layout.clamp_mode) {
            (Some(f), ClampMode::Voltage) => {
                let rs = a / (f.x0 - baseline);
                let xs = if measured_steady { steady } else { f.x_steady };
                let rin = a / (xs - baseline) - rs;
                (rin, rs, f.tau * (rin + rs) / (rin * rs), Some(f.tau))
            }
            (Some(f), ClampMode::Current) => {
                let rs = (f.x0 - baseline) / a;
                let xs = if measured_steady { steady } else { f.x_steady };
                let rin = (xs - baseline) / a - rs;
                (rin, rs, f.tau / rin, Some(f.tau))
            }
            (None, ClampMode::Voltage) => (a / (steady - baseline), 0.0, 0.0, None),
            (None, ClampMode::Current) => ((steady - baseline) / a, 0.0, 0.0, None),
        };

        let sag = if layout.with_sag {
            let hi = layout.steady.0.min(x.len());
            let lo = layout.fit_end.min(hi);
            let sg = a.signum();
            let signed: Vec<f64> = x[lo..hi].iter().map(|v| v * sg).collect();
            let extremum = match layout.clamp_mode {
                ClampMode::Voltage => stats::min(&signed),
                ClampMode::Current => stats::max(&signed),
            };
            extremum.map(|m| (sg * m - steady) / (baseline - steady))
        } else {
            None
        };

        Ok(MembraneSummary {
            clamp_mode: layout.clamp_mode,
            stimulus_amplitude: a,
            baseline,
            steady_state: steady,
            rin,
            rs,
            cm,
            tau,
            sag,
            status,
        })
    }
}

impl TraceAnalyzer for MembraneTestAnalyzer {
    type Event = ();
    type Summary = MembraneSummary;

    fn name(&self) -> &str {
        match self.test {
            MembraneTest::SealTest(_) => "seal_test",
            MembraneTest::Subthreshold(_) => "subthreshold",
        }
    }

    fn analyze(
        &self,
        trace: &Trace,
        ctx: &mut AnalysisContext<'_>,
    ) -> WcpResult<AnalysisOutcome<TraceResult<(), MembraneSummary>>> {
        let mut timer = AnalysisMetrics::start_timing();
        let layout = self.layout(trace)?;
        let sr = trace.sample_rate();
        timer.set_samples(trace.len());
        let x = self.prefilter(trace.samples())?;

        let (x, fit, status) = if layout.compensated {
            (x, None, MembraneFitStatus::Compensated)
        } else {
            let (x, fit) = self.resolve(trace.samples(), x, sr, &layout, ctx, &mut timer);
            let status = if fit.is_some() {
                MembraneFitStatus::Fitted
            } else {
                MembraneFitStatus::Abandoned
            };
            (x, fit, status)
        };

        let summary = self.summarize(&x, &layout, fit, status)?;
        debug!(rin = summary.rin, rs = summary.rs, cm = summary.cm, status = %summary.status, "membrane test");
        Ok(AnalysisOutcome::Completed(TraceResult {
            events: Vec::new(),
            summary,
            metrics: timer.finish(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspect::{CollectingSink, HeadlessInspector, NullSink, ScriptedInspector};
    use wcp_core::Stimulus;
    use wcp_simulation::{PatchSimulator, SimulationConfig, StepResponse};

    const SR: f64 = 20_000.0;

    fn simulate(step: &StepResponse) -> Trace {
        let mut sim = PatchSimulator::new(SimulationConfig {
            sample_rate: SR,
            duration: 1.0,
            noise_std: 0.0,
            seed: 3,
        })
        .unwrap();
        sim.step_response(step).unwrap()
    }

    fn headless(analyzer: &MembraneTestAnalyzer, trace: &Trace) -> MembraneSummary {
        let mut inspector = HeadlessInspector;
        let mut sink = NullSink;
        let mut ctx = AnalysisContext::new(&mut inspector, &mut sink);
        analyzer.analyze(trace, &mut ctx).unwrap().completed().unwrap().summary
    }

    fn close(actual: f64, expected: f64, tolerance: f64) -> bool {
        ((actual - expected) / expected).abs() < tolerance
    }

    #[test]
    fn test_voltage_clamp_seal_test() {
        let step = StepResponse::default();
        let analyzer = MembraneTestAnalyzer::seal_test(SealTestParams::default()).unwrap();
        let summary = headless(&analyzer, &simulate(&step));

        assert_eq!(summary.status, MembraneFitStatus::Fitted);
        assert!(close(summary.rs, step.rs, 0.02));
        assert!(close(summary.rin, step.rin, 0.02));
        assert!(close(summary.cm, step.cm, 0.05));
        assert!(summary.sag.is_none());
    }

    #[test]
    fn test_current_clamp_seal_test() {
        let step = StepResponse::current_clamp();
        let params = SealTestParams {
            clamp_mode: ClampMode::Current,
            ..SealTestParams::default()
        };
        let analyzer = MembraneTestAnalyzer::seal_test(params).unwrap();
        let summary = headless(&analyzer, &simulate(&step));

        assert_eq!(summary.status, MembraneFitStatus::Fitted);
        assert!(close(summary.rs, step.rs, 0.05));
        assert!(close(summary.rin, step.rin, 0.02));
        assert!(close(summary.cm, step.cm, 0.05));
    }

    #[test]
    fn test_headless_abandons_without_blocking() {
        // pure step, no charging curve to fit
        let mut samples = vec![0.0; 20_000];
        for v in samples.iter_mut().skip(1_000).take(4_000) {
            *v = -50e-12;
        }
        let trace = Trace::new(samples, SR).unwrap();
        let analyzer = MembraneTestAnalyzer::seal_test(SealTestParams::default()).unwrap();
        let summary = headless(&analyzer, &trace);

        assert_eq!(summary.status, MembraneFitStatus::Abandoned);
        assert_eq!(summary.rs, 0.0);
        assert_eq!(summary.cm, 0.0);
        assert!(close(summary.rin, 1e8, 1e-9));
        assert!(summary.tau.is_none());
    }

    #[test]
    fn test_compensated_skips_fit() {
        let params = SealTestParams {
            compensated: true,
            ..SealTestParams::default()
        };
        let analyzer = MembraneTestAnalyzer::seal_test(params).unwrap();
        let step = StepResponse::default();
        let summary = headless(&analyzer, &simulate(&step));
        assert_eq!(summary.status, MembraneFitStatus::Compensated);
        assert_eq!(summary.rs, 0.0);
        assert!(close(summary.rin, step.rin + step.rs, 0.02));
    }

    #[test]
    fn test_review_refilter_then_accept() {
        let analyzer = MembraneTestAnalyzer::seal_test(SealTestParams::default()).unwrap();
        let mut inspector = ScriptedInspector::new()
            .with_resolutions([FitResolution::Refilter(1e-9), FitResolution::Accept]);
        inspector.review_all_fits = true;
        let mut sink = CollectingSink::default();
        let mut ctx = AnalysisContext::new(&mut inspector, &mut sink);
        let summary = analyzer
            .analyze(&simulate(&StepResponse::default()), &mut ctx)
            .unwrap()
            .completed()
            .unwrap()
            .summary;

        assert_eq!(summary.status, MembraneFitStatus::Fitted);
        assert_eq!(inspector.seen_reports.len(), 2);
        assert_eq!(sink.plots.len(), 2);
    }

    #[test]
    fn test_invalid_refilter_reported() {
        let analyzer = MembraneTestAnalyzer::seal_test(SealTestParams::default()).unwrap();
        let mut inspector = ScriptedInspector::new()
            .with_resolutions([FitResolution::Refilter(-1.0), FitResolution::Abandon]);
        inspector.review_all_fits = true;
        let mut sink = CollectingSink::default();
        let mut ctx = AnalysisContext::new(&mut inspector, &mut sink);
        let summary = analyzer
            .analyze(&simulate(&StepResponse::default()), &mut ctx)
            .unwrap()
            .completed()
            .unwrap()
            .summary;

        assert_eq!(summary.status, MembraneFitStatus::Abandoned);
        assert!(sink.messages.iter().any(|m| m.starts_with("refilter rejected")));
    }

    #[test]
    fn test_subthreshold_with_sag() {
        let params = SubthresholdParams {
            clamp_mode: ClampMode::Current,
            fit_end: 0.1,
            ..SubthresholdParams::default()
        };
        let analyzer = MembraneTestAnalyzer::subthreshold(params).unwrap();

        let plain = StepResponse {
            onset: 0.1,
            duration: 0.7,
            ..StepResponse::current_clamp()
        };
        let summary = headless(&analyzer, &simulate(&plain));
        assert_eq!(summary.status, MembraneFitStatus::Fitted);
        assert!(close(summary.rin, plain.rin, 0.05));
        assert!(summary.sag.unwrap().abs() < 0.02);

        let sagging = StepResponse { sag: 0.3, ..plain };
        let summary = headless(&analyzer, &simulate(&sagging));
        assert!(summary.sag.unwrap().abs() > 0.1);
    }

    #[test]
    fn test_subthreshold_requires_stimulus() {
        let analyzer = MembraneTestAnalyzer::subthreshold(SubthresholdParams::default()).unwrap();
        let trace = Trace::new(vec![0.0; 100], SR)
            .unwrap()
            .with_stimulus(Stimulus::new(0.001, 0.0, -1e-11));
        let mut inspector = HeadlessInspector;
        let mut sink = NullSink;
        let mut ctx = AnalysisContext::new(&mut inspector, &mut sink);
        assert!(matches!(
            analyzer.analyze(&trace, &mut ctx),
            Err(WcpError::InvalidStimulus { .. })
        ));
    }
}
