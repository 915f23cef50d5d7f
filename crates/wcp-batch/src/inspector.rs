//! Inspector that forwards decisions to another thread over channels
//!
//! The analysis runs on a blocking thread and waits for each answer; the UI
//! side receives requests asynchronously and replies through the handle.

use tokio::sync::mpsc;
use tracing::warn;
use wcp_processing::{DetectionDecision, FitReport, FitResolution, FitReview, Inspector, PlotRequest};

/// Question sent to the reviewer
#[derive(Debug, Clone)]
pub enum InspectionRequest {
    Detection(PlotRequest),
    Fit(PlotRequest),
    FitFailure(FitReport),
}

impl InspectionRequest {
    /// Question shown to a text reviewer
    pub fn prompt(&self) -> String {
        match self {
            InspectionRequest::Detection(plot) => {
                format!("{}: {} marks. [a]ccept or a[b]ort?", plot.title, plot.markers.len())
            }
            InspectionRequest::Fit(plot) => format!("{}: [s]tep or [c]ontinue?", plot.title),
            InspectionRequest::FitFailure(report) => {
                let state = match (&report.failure, report.tau) {
                    (Some(reason), _) => format!("fit failed: {}", reason),
                    (None, Some(tau)) => format!("tau {:.3e} s below {:.3e} s", tau, report.min_tau),
                    (None, None) => "no fit".to_string(),
                };
                format!("{}. [a]ccept, a[b]andon or a median threshold to refilter?", state)
            }
        }
    }

    /// Reviewer text as an answer to this request. `None` when not understood.
    pub fn parse_answer(&self, text: &str) -> Option<InspectionAnswer> {
        let text = text.trim().to_ascii_lowercase();
        match self {
            InspectionRequest::Detection(_) => match text.as_str() {
                "" | "a" | "accept" => Some(InspectionAnswer::Detection(DetectionDecision::Accept)),
                "b" | "abort" => Some(InspectionAnswer::Detection(DetectionDecision::Abort)),
                _ => None,
            },
            InspectionRequest::Fit(_) => match text.as_str() {
                "" | "s" | "step" => Some(InspectionAnswer::Fit(FitReview::Step)),
                "c" | "continue" => Some(InspectionAnswer::Fit(FitReview::Continue)),
                _ => None,
            },
            InspectionRequest::FitFailure(_) => match text.as_str() {
                "a" | "accept" => Some(InspectionAnswer::Resolution(FitResolution::Accept)),
                "" | "b" | "abandon" => Some(InspectionAnswer::Resolution(FitResolution::Abandon)),
                number => number
                    .parse::<f64>()
                    .ok()
                    .filter(|t| t.is_finite() && *t >= 0.0)
                    .map(|t| InspectionAnswer::Resolution(FitResolution::Refilter(t))),
            },
        }
    }
}

/// Reviewer's reply
#[derive(Debug, Clone)]
pub enum InspectionAnswer {
    Detection(DetectionDecision),
    Fit(FitReview),
    Resolution(FitResolution),
}

/// Blocking side, handed to the analyzers
#[derive(Debug)]
pub struct ChannelInspector {
    requests: mpsc::Sender<InspectionRequest>,
    answers: mpsc::Receiver<InspectionAnswer>,
    review_fits: bool,
}

/// Reviewer side
#[derive(Debug)]
pub struct InspectorHandle {
    requests: mpsc::Receiver<InspectionRequest>,
    answers: mpsc::Sender<InspectionAnswer>,
}

impl ChannelInspector {
    /// Connected inspector and handle with `buffer` pending messages per direction
    pub fn pair(buffer: usize) -> (ChannelInspector, InspectorHandle) {
        let (request_tx, request_rx) = mpsc::channel(buffer);
        let (answer_tx, answer_rx) = mpsc::channel(buffer);
        (
            ChannelInspector {
                requests: request_tx,
                answers: answer_rx,
                review_fits: false,
            },
            InspectorHandle {
                requests: request_rx,
                answers: answer_tx,
            },
        )
    }

    /// Show every membrane fit, not only the failed ones
    pub fn with_fit_review(mut self, review_fits: bool) -> Self {
        self.review_fits = review_fits;
        self
    }

    /// Send a request and wait for the answer. `None` when the reviewer is gone.
    fn ask(&mut self, request: InspectionRequest) -> Option<InspectionAnswer> {
        if self.requests.blocking_send(request).is_err() {
            warn!("reviewer disconnected, taking the default branch");
            return None;
        }
        let answer = self.answers.blocking_recv();
        if answer.is_none() {
            warn!("reviewer disconnected, taking the default branch");
        }
        answer
    }
}

impl Inspector for ChannelInspector {
    fn is_interactive(&self) -> bool {
        true
    }

    fn review_detection(&mut self, request: &PlotRequest) -> DetectionDecision {
        match self.ask(InspectionRequest::Detection(request.clone())) {
            Some(InspectionAnswer::Detection(decision)) => decision,
            Some(other) => {
                warn!(?other, "unexpected answer to a detection review");
                DetectionDecision::Accept
            }
            None => DetectionDecision::Accept,
        }
    }

    fn review_fit(&mut self, request: &PlotRequest) -> FitReview {
        match self.ask(InspectionRequest::Fit(request.clone())) {
            Some(InspectionAnswer::Fit(review)) => review,
            Some(other) => {
                warn!(?other, "unexpected answer to a fit review");
                FitReview::Continue
            }
            None => FitReview::Continue,
        }
    }

    fn resolve_fit_failure(&mut self, report: &FitReport) -> FitResolution {
        match self.ask(InspectionRequest::FitFailure(report.clone())) {
            Some(InspectionAnswer::Resolution(resolution)) => resolution,
            Some(other) => {
                warn!(?other, "unexpected answer to a fit failure");
                FitResolution::Abandon
            }
            None => FitResolution::Abandon,
        }
    }

    fn review_fits(&self) -> bool {
        self.review_fits
    }
}

impl InspectorHandle {
    /// Next request, `None` once the inspector is dropped
    pub async fn next_request(&mut self) -> Option<InspectionRequest> {
        self.requests.recv().await
    }

    /// Reply to the pending request. False when the inspector is gone.
    pub async fn answer(&self, answer: InspectionAnswer) -> bool {
        self.answers.send(answer).await.is_ok()
    }
}
