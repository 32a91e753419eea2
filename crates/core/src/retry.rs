//! Bounded retry for fallible async operations

use std::future::Future;
use std::time::Duration;

use color_eyre::Result;
use tracing::warn;

/// Run `op`, retrying up to `retries` more times after a failure
///
/// With `retries == 0` the operation runs exactly once. The last error is
/// returned when every attempt fails.
pub async fn retry<T, F, Fut>(retries: u32, delay: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut remaining = retries;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if remaining > 0 => {
                remaining -= 1;
                warn!("attempt failed ({remaining} retries left): {err:#}");
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_no_retries_runs_once() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry(0, Duration::ZERO, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            color_eyre::eyre::bail!("nope")
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let calls = AtomicU32::new(0);
        let value = retry(3, Duration::ZERO, || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                color_eyre::eyre::bail!("flaky {n}");
            }
            Ok(n)
        })
        .await
        .unwrap();

        assert_eq!(value, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_returns_last_error() {
        let calls = AtomicU32::new(0);
        let err = retry(2, Duration::ZERO, || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(color_eyre::eyre::eyre!("failure {n}"))
        })
        .await
        .unwrap_err();

        assert_eq!(err.to_string(), "failure 2");
    }
}
