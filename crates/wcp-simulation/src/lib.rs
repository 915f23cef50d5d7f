//! WCP-Simulation: Synthetic patch-clamp recordings
//!
//! Seeded spike trains, miniature synaptic currents and passive step
//! responses for tests and demos.

pub mod waveforms;
pub mod simulator;

pub use simulator::*;
pub use waveforms::*;
