//! Fixed-backoff retry for store calls the write API rate limits.

use std::future::Future;
use std::time::Duration;

use crate::error::StoreError;

/// Run `op` until it returns something other than
/// `StoreError::TooManyRequests`, sleeping `backoff` between attempts.
/// There is no attempt limit; HTTP 429s are already absorbed by the fetch
/// layer underneath.
pub async fn retry_rate_limited<T, F, Fut>(backoff: Duration, label: &str, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match op().await {
            Err(e) if e.is_rate_limited() => {
                log::warn!(
                    "Engine: {} rate limited ({}), attempt {}, retrying in {:?}",
                    label,
                    e,
                    attempt,
                    backoff
                );
                tokio::time::sleep(backoff).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let started = tokio::time::Instant::now();

        let result = retry_rate_limited(Duration::from_secs(10), "test", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StoreError::TooManyRequests("ratelimited".to_string()))
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_secs(20));
    }

    #[tokio::test]
    async fn test_other_errors_returned_immediately() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), StoreError> = retry_rate_limited(Duration::from_secs(10), "test", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::EntityNotFound("Q1".to_string()))
        })
        .await;

        assert!(matches!(result, Err(StoreError::EntityNotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
