//! Timeout helpers.

use std::future::Future;
use std::time::Duration;

use crate::error::ConductorError;

/// Wrap a future with a timeout.
pub async fn with_timeout<T>(
    duration: Duration,
    future: impl Future<Output = Result<T, ConductorError>>,
) -> Result<T, ConductorError> {
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(ConductorError::Timeout(duration.as_millis() as u64)),
    }
}

/// Like [`with_timeout`], but `None` means wait forever.
pub async fn with_optional_timeout<T>(
    duration: Option<Duration>,
    future: impl Future<Output = Result<T, ConductorError>>,
) -> Result<T, ConductorError> {
    match duration {
        Some(duration) => with_timeout(duration, future).await,
        None => future.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn elapsed_timeout_reports_its_duration() {
        let result: Result<(), _> = with_timeout(Duration::from_millis(20), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(ConductorError::Timeout(20))));
    }

    #[tokio::test]
    async fn no_timeout_passes_result_through() {
        let result = with_optional_timeout(None, async { Ok::<_, ConductorError>(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
