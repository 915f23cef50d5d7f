//! Trace: sampled recording of one trial plus its stimulation window

use crate::error::{WcpError, WcpResult};
use crate::trace_error;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stimulation window applied during a trial
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stimulus {
    /// Stimulus onset in seconds
    pub start: f64,
    /// Stimulus duration in seconds
    pub duration: f64,
    /// Stimulus amplitude in physical units (A or V)
    pub amplitude: f64,
    /// Optional stimulus type label from the acquisition software
    #[serde(default)]
    pub kind: Option<String>,
}

impl Stimulus {
    pub fn new(start: f64, duration: f64, amplitude: f64) -> Self {
        Self {
            start,
            duration,
            amplitude,
            kind: None,
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    /// Stimulus offset in seconds
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }

    /// Reject descriptors that cannot drive an analysis
    pub fn validate(&self) -> WcpResult<()> {
        if !self.start.is_finite() || self.start < 0.0 {
            return Err(WcpError::InvalidStimulus {
                reason: format!("start {} must be finite and non-negative", self.start),
            });
        }
        if !self.duration.is_finite() || self.duration <= 0.0 {
            return Err(WcpError::InvalidStimulus {
                reason: format!("duration {} must be positive", self.duration),
            });
        }
        if !self.amplitude.is_finite() {
            return Err(WcpError::InvalidStimulus {
                reason: format!("amplitude {} is not finite", self.amplitude),
            });
        }
        Ok(())
    }
}

/// Recording configuration of the amplifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClampMode {
    /// Voltage clamp: command voltage, recorded current
    Voltage,
    /// Current clamp: injected current, recorded voltage
    Current,
}

impl std::fmt::Display for ClampMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClampMode::Voltage => write!(f, "voltage clamp"),
            ClampMode::Current => write!(f, "current clamp"),
        }
    }
}

/// One recorded trial. Immutable once constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    /// Unique identifier for this trace
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    /// Samples in physical units
    samples: Vec<f64>,
    /// Sampling rate in Hz
    sample_rate: f64,
    /// Stimulation window, when the protocol has one
    #[serde(default)]
    stimulus: Option<Stimulus>,
}

impl Trace {
    /// Create a trace from samples and sampling rate
    pub fn new(samples: Vec<f64>, sample_rate: f64) -> WcpResult<Self> {
        if samples.is_empty() {
            return Err(trace_error!("trace has no samples"));
        }
        if !sample_rate.is_finite() || sample_rate <= 0.0 {
            return Err(trace_error!("sampling rate {} must be positive", sample_rate));
        }

        Ok(Trace {
            id: Uuid::new_v4(),
            samples,
            sample_rate,
            stimulus: None,
        })
    }

    /// Attach the stimulation window
    pub fn with_stimulus(mut self, stimulus: Stimulus) -> Self {
        self.stimulus = Some(stimulus);
        self
    }

    /// New trace with replaced samples, same sampling rate and stimulus
    pub fn with_samples(&self, samples: Vec<f64>) -> WcpResult<Trace> {
        let mut trace = Trace::new(samples, self.sample_rate)?;
        trace.stimulus = self.stimulus.clone();
        Ok(trace)
    }

    /// Re-check invariants after deserialization
    pub fn validate(&self) -> WcpResult<()> {
        if self.samples.is_empty() {
            return Err(trace_error!("trace has no samples"));
        }
        if !self.sample_rate.is_finite() || self.sample_rate <= 0.0 {
            return Err(trace_error!("sampling rate {} must be positive", self.sample_rate));
        }
        Ok(())
    }

    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Trace duration in seconds
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate
    }

    /// Raw stimulus descriptor, if any
    pub fn stimulus(&self) -> Option<&Stimulus> {
        self.stimulus.as_ref()
    }

    /// Stimulus descriptor, validated. Missing or malformed descriptors are
    /// reported as `InvalidStimulus`.
    pub fn require_stimulus(&self) -> WcpResult<&Stimulus> {
        let stimulus = self.stimulus.as_ref().ok_or_else(|| WcpError::InvalidStimulus {
            reason: "trace carries no stimulus descriptor".to_string(),
        })?;
        stimulus.validate()?;
        Ok(stimulus)
    }

    /// Sample index of a time point, truncating toward zero.
    /// Negative times map to 0, times past the end map past the last sample.
    pub fn index_at(&self, time: f64) -> usize {
        (time * self.sample_rate) as usize
    }

    /// Time of a sample index in seconds
    pub fn time_at(&self, index: usize) -> f64 {
        index as f64 / self.sample_rate
    }

    /// Samples in `[start, end)`, both bounds clamped to the trace
    pub fn window(&self, start: usize, end: usize) -> &[f64] {
        let end = end.min(self.samples.len());
        let start = start.min(end);
        &self.samples[start..end]
    }

    /// Samples between two time points, clamped to the trace
    pub fn window_time(&self, start_time: f64, end_time: f64) -> &[f64] {
        self.window(self.index_at(start_time), self.index_at(end_time))
    }

    /// Copy a time range into a new trace. The stimulus onset is shifted
    /// so it stays aligned with the samples.
    pub fn slice_time(&self, start_time: f64, end_time: f64) -> WcpResult<Trace> {
        if start_time < 0.0 || end_time > self.duration() || start_time >= end_time {
            return Err(trace_error!(
                "Invalid time range [{:.4}, {:.4}]s for trace duration {:.4}s",
                start_time,
                end_time,
                self.duration()
            ));
        }

        let sliced = self.window_time(start_time, end_time).to_vec();
        let mut trace = Trace::new(sliced, self.sample_rate)?;
        trace.stimulus = self.stimulus.as_ref().map(|s| Stimulus {
            start: s.start - start_time,
            ..s.clone()
        });
        Ok(trace)
    }

    /// Time vector for plotting
    pub fn time_vector(&self) -> Vec<f64> {
        (0..self.samples.len()).map(|i| self.time_at(i)).collect()
    }

    pub fn stats(&self) -> TraceStats {
        TraceStats::calculate(&self.samples)
    }
}

/// Basic statistics for a sample window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TraceStats {
    pub mean: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    pub peak_to_peak: f64,
}

impl TraceStats {
    pub fn calculate(data: &[f64]) -> Self {
        if data.is_empty() {
            return Self {
                mean: 0.0,
                std_dev: 0.0,
                min: 0.0,
                max: 0.0,
                peak_to_peak: 0.0,
            };
        }

        let n = data.len() as f64;
        let mean = data.iter().sum::<f64>() / n;
        let variance = data.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        let min = data.iter().fold(f64::INFINITY, |a, &b| a.min(b));
        let max = data.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));

        Self {
            mean,
            std_dev: variance.sqrt(),
            min,
            max,
            peak_to_peak: max - min,
        }
    }
}
