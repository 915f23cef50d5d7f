//! WCP-Core: Foundation types for whole-cell patch-clamp analysis
//!
//! Trace container, stimulus metadata, result records and the shared error type.

pub mod trace;
pub mod records;
pub mod error;

pub use trace::*;
pub use records::*;
pub use error::{WcpError, WcpResult};
