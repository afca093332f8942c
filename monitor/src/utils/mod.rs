//! Utility modules for the Hivewatch monitor.
//!
//! - [`backoff`]: Exponential backoff with jitter for poll loops

pub mod backoff;

pub use backoff::Backoff;
