use std::future::Future;
use std::time::Duration;

use log::warn;
use tokio::time;

use crate::error::{AuthError, AuthResult};

/// Runs a provider call bounded by `timeout`, retrying once when the first
/// attempt fails transiently or times out. Non-transient errors (bad token,
/// unknown principal) return immediately.
pub async fn call_with_retry<T, F, Fut>(timeout: Duration, mut op: F) -> AuthResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AuthResult<T>>,
{
    match attempt(timeout, op()).await {
        Err(e) if e.is_transient() => {
            warn!("Identity provider call failed, retry once: {e}");
            attempt(timeout, op()).await
        }
        result => result,
    }
}

async fn attempt<T, Fut>(timeout: Duration, fut: Fut) -> AuthResult<T>
where
    Fut: Future<Output = AuthResult<T>>,
{
    match time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(AuthError::ProviderUnavailable(format!(
            "call timed out after {}ms",
            timeout.as_millis()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn test_retry_once_on_transient() {
        let calls = AtomicUsize::new(0);
        let result = call_with_retry(TIMEOUT, || async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(AuthError::provider("connection reset"))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_no_second_retry() {
        let calls = AtomicUsize::new(0);
        let result: AuthResult<()> = call_with_retry(TIMEOUT, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(AuthError::provider("down"))
        })
        .await;
        assert!(matches!(result, Err(AuthError::ProviderUnavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicUsize::new(0);
        let result: AuthResult<()> = call_with_retry(TIMEOUT, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(AuthError::NotFound(String::from("principal")))
        })
        .await;
        assert!(matches!(result, Err(AuthError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout() {
        let calls = AtomicUsize::new(0);
        let result: AuthResult<()> = call_with_retry(Duration::from_millis(20), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(AuthError::ProviderUnavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
