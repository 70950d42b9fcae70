//! Retry and backoff for transient failures.

mod retry;

pub use retry::{RetryConfig, RetryPolicy, retry_with_backoff};
