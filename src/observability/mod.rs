//! Observability
//!
//! Lifecycle metrics for operational visibility.

pub mod metrics;
