//! WCP-Processing: Detection and curve-fitting engine for patch-clamp traces
//!
//! Conditioning filters, exponential fitting, spike, mini and membrane-test
//! analyzers, and per-cell aggregation of their result tables.

pub mod filters;
pub mod fitting;
pub mod params;
pub mod inspect;
pub mod analyzer;
pub mod stats;
pub mod spikes;
pub mod minis;
pub mod membrane;
pub mod aggregate;

pub use filters::{
    band_filter, smooth, thresholded_median_filter, BandType, FilterChain, FilterFamily,
    FilterSpec, FilterStep, ZeroPhaseFilter
};
pub use fitting::{fit_exponential_decay, DecayFit, FitOptions};
pub use params::{
    AnalysisConfig, MiniParams, ParamKind, ParamSpec, ParamValue, Parameterized, Polarity,
    SealTestParams, SpikeParams, SubthresholdParams
};
pub use inspect::*;
pub use analyzer::{AnalysisMetrics, TraceAnalyzer, TraceResult};
pub use spikes::SpikeDetector;
pub use minis::MiniDetector;
pub use membrane::{MembraneTest, MembraneTestAnalyzer};
pub use aggregate::*;
