//! Resilience patterns for Lattice
//!
//! Retry policies with pluggable backoff, used to re-run workflow stages
//! that fail transiently.

pub mod backoff;
pub mod retry;

// Re-export commonly used types
pub use backoff::{BackoffCalculator, BackoffStrategy};
pub use retry::{RetryError, RetryExecutor, RetryPolicy, Retryable};
