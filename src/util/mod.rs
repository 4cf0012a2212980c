//! Utility modules: retry, polling, timeout.

pub mod duration_ms;
pub mod retry;
pub mod timeout;

pub use retry::{poll_until, RetryPolicy};
pub use timeout::{with_optional_timeout, with_timeout};
