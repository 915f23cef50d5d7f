//! Error handling for the patch-clamp analysis engine
//!
//! One error enum is shared by every crate in the workspace. Variants are
//! grouped by how the batch loop reacts to them: filter, stimulus and fit
//! errors abort a single trace, a missing trace aborts the whole protocol run.

use core::fmt;

/// Result type alias for analysis operations
pub type WcpResult<T> = Result<T, WcpError>;

/// Error type for all analysis operations
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum WcpError {
    /// Invalid filter or band configuration
    FilterConfig {
        /// Description of the configuration error
        reason: String,
    },

    /// Nonlinear least-squares optimizer did not converge
    FitConvergence {
        /// Description of the failure
        reason: String,
        /// Iterations spent before giving up
        iterations: usize,
    },

    /// Malformed fit input: bad range, bad initial guess, missing crossing
    FitInput {
        /// Description of the input problem
        reason: String,
    },

    /// Trace file missing or unreadable
    TraceNotFound {
        /// Cell id of the requested trace
        cell: u32,
        /// Trial id of the requested trace
        trial: u32,
        /// Underlying cause
        reason: String,
    },

    /// Stimulus descriptor rejected at input validation
    InvalidStimulus {
        /// Description of the stimulus problem
        reason: String,
    },

    /// Trace data rejected (empty, bad sampling rate, windows outside the trace)
    InvalidTrace {
        /// Description of the trace problem
        reason: String,
    },

    /// Parameter value does not match its schema
    InvalidParameter {
        /// Parameter name
        name: String,
        /// Description of the mismatch
        reason: String,
    },

    /// Parameter change attempted while a batch run holds the parameters
    ParametersLocked {
        /// Analyzer whose parameters are locked
        analyzer: String,
    },

    /// Filesystem error from a collaborator or exporter
    Io {
        /// Error description
        reason: String,
    },

    /// Serialization/deserialization error
    Serialization {
        /// Serialization error description
        reason: String,
    },
}

impl WcpError {
    /// True for errors that must stop a whole protocol run
    pub fn aborts_batch(&self) -> bool {
        matches!(self, WcpError::TraceNotFound { .. })
    }
}

impl fmt::Display for WcpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WcpError::FilterConfig { reason } => {
                write!(f, "Invalid filter configuration: {}", reason)
            }
            WcpError::FitConvergence { reason, iterations } => {
                write!(f, "Fit did not converge after {} iterations: {}",
                       iterations, reason)
            }
            WcpError::FitInput { reason } => {
                write!(f, "Invalid fit input: {}", reason)
            }
            WcpError::TraceNotFound { cell, trial, reason } => {
                write!(f, "Trace not found for cell {} trial {}: {}",
                       cell, trial, reason)
            }
            WcpError::InvalidStimulus { reason } => {
                write!(f, "Invalid stimulus: {}", reason)
            }
            WcpError::InvalidTrace { reason } => {
                write!(f, "Invalid trace: {}", reason)
            }
            WcpError::InvalidParameter { name, reason } => {
                write!(f, "Invalid parameter '{}': {}", name, reason)
            }
            WcpError::ParametersLocked { analyzer } => {
                write!(f, "Parameters of '{}' are locked while an analysis is running",
                       analyzer)
            }
            WcpError::Io { reason } => {
                write!(f, "I/O error: {}", reason)
            }
            WcpError::Serialization { reason } => {
                write!(f, "Serialization error: {}", reason)
            }
        }
    }
}

impl std::error::Error for WcpError {}

impl From<std::io::Error> for WcpError {
    fn from(e: std::io::Error) -> Self {
        WcpError::Io { reason: e.to_string() }
    }
}

/// Convenience macro for creating filter configuration errors
#[macro_export]
macro_rules! filter_error {
    ($($arg:tt)+) => {
        $crate::error::WcpError::FilterConfig {
            reason: format!($($arg)+)
        }
    };
}

/// Convenience macro for creating fit input errors
#[macro_export]
macro_rules! fit_input_error {
    ($($arg:tt)+) => {
        $crate::error::WcpError::FitInput {
            reason: format!($($arg)+)
        }
    };
}

/// Convenience macro for creating trace validation errors
#[macro_export]
macro_rules! trace_error {
    ($($arg:tt)+) => {
        $crate::error::WcpError::InvalidTrace {
            reason: format!($($arg)+)
        }
    };
}
