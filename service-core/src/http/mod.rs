//! Outbound HTTP utilities shared by service clients.

pub mod retry;

pub use retry::{is_retryable_status, retry_http_call, RetryConfig, Retryable};
