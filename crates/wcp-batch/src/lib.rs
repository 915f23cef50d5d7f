//! WCP-Batch: Protocol-level batch analysis of patch-clamp projects
//!
//! Trace sources, the batch runner with cooperative stop, result storage and
//! export, the shared parameter registry and a channel-backed inspector.

pub mod source;
pub mod runner;
pub mod store;
pub mod registry;
pub mod inspector;
pub mod subtract;

pub use source::*;
pub use runner::*;
pub use store::*;
pub use registry::{ParameterRegistry, RunGuard};
pub use inspector::*;
pub use subtract::*;
