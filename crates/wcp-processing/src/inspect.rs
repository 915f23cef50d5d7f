//! Inspection and progress seams
//!
//! Analyzers never talk to a user directly. Decisions at inspection points go
//! through an `Inspector`; progress text and plot requests go to an
//! `AnalysisSink`. A headless inspector takes the default branch everywhere so
//! batch runs never block.

use std::collections::VecDeque;
use tracing::info;

/// Data for an external plotting collaborator
#[derive(Debug, Clone, PartialEq)]
pub struct PlotRequest {
    pub title: String,
    pub sample_rate: f64,
    /// Primary trace
    pub trace: Vec<f64>,
    /// Optional overlay (filtered trace or fitted curve), same length
    pub overlay: Option<Vec<f64>>,
    /// Marked time points in seconds
    pub markers: Vec<f64>,
}

impl PlotRequest {
    pub fn new(title: impl Into<String>, trace: Vec<f64>, sample_rate: f64) -> Self {
        Self {
            title: title.into(),
            sample_rate,
            trace,
            overlay: None,
            markers: Vec::new(),
        }
    }

    pub fn with_overlay(mut self, overlay: Vec<f64>) -> Self {
        self.overlay = Some(overlay);
        self
    }

    pub fn with_markers(mut self, markers: Vec<f64>) -> Self {
        self.markers = markers;
        self
    }
}

/// Reviewer verdict on a set of detected events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionDecision {
    Accept,
    Abort,
}

/// Reviewer choice after seeing one event fit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitReview {
    /// Keep showing every fit
    Step,
    /// Stop showing fits for the rest of the trace
    Continue,
}

/// Reviewer choice when a membrane fit failed or looks wrong
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FitResolution {
    /// Median-filter the raw trace with this threshold and refit
    Refilter(f64),
    /// Keep the current fit
    Accept,
    /// Give up fitting, estimate from steady state only
    Abandon,
}

/// What the reviewer sees when asked to resolve a membrane fit
#[derive(Debug, Clone, PartialEq)]
pub struct FitReport {
    pub x0: Option<f64>,
    pub x_steady: Option<f64>,
    pub tau: Option<f64>,
    pub min_tau: f64,
    /// Fit error, when the fit failed
    pub failure: Option<String>,
}

impl FitReport {
    pub fn has_fit(&self) -> bool {
        self.tau.is_some()
    }
}

/// Decision maker at inspection points
pub trait Inspector: Send {
    /// Interactive inspectors receive plot requests and are consulted
    fn is_interactive(&self) -> bool;

    /// Review detected events of one trace
    fn review_detection(&mut self, _request: &PlotRequest) -> DetectionDecision {
        DetectionDecision::Accept
    }

    /// Review one event fit
    fn review_fit(&mut self, _request: &PlotRequest) -> FitReview {
        FitReview::Continue
    }

    /// Resolve a failed or suspicious membrane fit
    fn resolve_fit_failure(&mut self, _report: &FitReport) -> FitResolution {
        FitResolution::Abandon
    }

    /// Whether every membrane fit should be shown, not only failures
    fn review_fits(&self) -> bool {
        false
    }
}

/// Never asks anyone. Every decision takes the default branch.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeadlessInspector;

impl Inspector for HeadlessInspector {
    fn is_interactive(&self) -> bool {
        false
    }
}

/// Interactive inspector replaying prepared answers, default branch once exhausted
#[derive(Debug, Clone, Default)]
pub struct ScriptedInspector {
    pub detections: VecDeque<DetectionDecision>,
    pub fit_reviews: VecDeque<FitReview>,
    pub resolutions: VecDeque<FitResolution>,
    pub review_all_fits: bool,
    /// Reports received by `resolve_fit_failure`
    pub seen_reports: Vec<FitReport>,
}

impl ScriptedInspector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_detections(mut self, answers: impl IntoIterator<Item = DetectionDecision>) -> Self {
        self.detections.extend(answers);
        self
    }

    pub fn with_fit_reviews(mut self, answers: impl IntoIterator<Item = FitReview>) -> Self {
        self.fit_reviews.extend(answers);
        self
    }

    pub fn with_resolutions(mut self, answers: impl IntoIterator<Item = FitResolution>) -> Self {
        self.resolutions.extend(answers);
        self
    }
}

impl Inspector for ScriptedInspector {
    fn is_interactive(&self) -> bool {
        true
    }

    fn review_detection(&mut self, _request: &PlotRequest) -> DetectionDecision {
        self.detections.pop_front().unwrap_or(DetectionDecision::Accept)
    }

    fn review_fit(&mut self, _request: &PlotRequest) -> FitReview {
        self.fit_reviews.pop_front().unwrap_or(FitReview::Continue)
    }

    fn resolve_fit_failure(&mut self, report: &FitReport) -> FitResolution {
        self.seen_reports.push(report.clone());
        self.resolutions.pop_front().unwrap_or(FitResolution::Abandon)
    }

    fn review_fits(&self) -> bool {
        self.review_all_fits
    }
}

/// Receiver of progress text and plot requests
pub trait AnalysisSink: Send {
    fn on_progress(&mut self, message: &str);

    fn on_plot_request(&mut self, _request: &PlotRequest) {}
}

/// Discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl AnalysisSink for NullSink {
    fn on_progress(&mut self, _message: &str) {}
}

/// Forwards progress text to `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl AnalysisSink for TracingSink {
    fn on_progress(&mut self, message: &str) {
        info!(target: "wcp::progress", "{}", message);
    }

    fn on_plot_request(&mut self, request: &PlotRequest) {
        info!(
            target: "wcp::progress",
            title = %request.title,
            samples = request.trace.len(),
            markers = request.markers.len(),
            "plot requested"
        );
    }
}

/// Keeps everything, for tests and headless reports
#[derive(Debug, Clone, Default)]
pub struct CollectingSink {
    pub messages: Vec<String>,
    pub plots: Vec<PlotRequest>,
}

impl AnalysisSink for CollectingSink {
    fn on_progress(&mut self, message: &str) {
        self.messages.push(message.to_string());
    }

    fn on_plot_request(&mut self, request: &PlotRequest) {
        self.plots.push(request.clone());
    }
}

/// Result of one analyzer call that may be aborted by the reviewer
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisOutcome<T> {
    Completed(T),
    Aborted,
}

impl<T> AnalysisOutcome<T> {
    pub fn completed(self) -> Option<T> {
        match self {
            AnalysisOutcome::Completed(v) => Some(v),
            AnalysisOutcome::Aborted => None,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, AnalysisOutcome::Aborted)
    }
}

/// Collaborators handed to every analyzer call
pub struct AnalysisContext<'a> {
    pub inspector: &'a mut dyn Inspector,
    pub sink: &'a mut dyn AnalysisSink,
}

impl<'a> AnalysisContext<'a> {
    pub fn new(inspector: &'a mut dyn Inspector, sink: &'a mut dyn AnalysisSink) -> Self {
        Self { inspector, sink }
    }

    pub fn is_interactive(&self) -> bool {
        self.inspector.is_interactive()
    }

    pub fn progress(&mut self, message: impl AsRef<str>) {
        self.sink.on_progress(message.as_ref());
    }

    /// Forward a plot request, only in interactive mode
    pub fn plot(&mut self, request: &PlotRequest) {
        if self.inspector.is_interactive() {
            self.sink.on_plot_request(request);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headless_defaults() {
        let mut inspector = HeadlessInspector;
        let request = PlotRequest::new("t", vec![0.0; 4], 1.0);
        assert!(!inspector.is_interactive());
        assert_eq!(inspector.review_detection(&request), DetectionDecision::Accept);
        assert_eq!(inspector.review_fit(&request), FitReview::Continue);
        let report = FitReport { x0: None, x_steady: None, tau: None, min_tau: 1e-3, failure: None };
        assert_eq!(inspector.resolve_fit_failure(&report), FitResolution::Abandon);
    }

    #[test]
    fn test_scripted_replays_then_defaults() {
        let mut inspector = ScriptedInspector::new()
            .with_resolutions([FitResolution::Refilter(1e-10), FitResolution::Accept]);
        let report = FitReport { x0: None, x_steady: None, tau: Some(0.01), min_tau: 1e-3, failure: None };
        assert_eq!(inspector.resolve_fit_failure(&report), FitResolution::Refilter(1e-10));
        assert_eq!(inspector.resolve_fit_failure(&report), FitResolution::Accept);
        assert_eq!(inspector.resolve_fit_failure(&report), FitResolution::Abandon);
        assert_eq!(inspector.seen_reports.len(), 3);
    }

    #[test]
    fn test_plots_only_when_interactive() {
        let request = PlotRequest::new("spikes", vec![1.0, 2.0], 10.0).with_markers(vec![0.1]);

        let mut headless = HeadlessInspector;
        let mut sink = CollectingSink::default();
        let mut ctx = AnalysisContext::new(&mut headless, &mut sink);
        ctx.plot(&request);
        ctx.progress("cell 1 trial 1");
        assert!(sink.plots.is_empty());
        assert_eq!(sink.messages, vec!["cell 1 trial 1".to_string()]);

        let mut scripted = ScriptedInspector::new();
        let mut sink = CollectingSink::default();
        AnalysisContext::new(&mut scripted, &mut sink).plot(&request);
        assert_eq!(sink.plots.len(), 1);
    }
}
