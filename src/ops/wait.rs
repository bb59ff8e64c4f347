//! Poll-until-deadline primitive
//!
//! Every lifecycle wait in the protocol (volume available, attachment
//! settled, long-running operation done) goes through [`wait_for`], which
//! polls at a fixed interval and aborts at the caller's deadline.

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Poll `poll` every `interval` until it yields a value or `timeout`
/// elapses.
///
/// `Ok(Some(v))` completes the wait, `Ok(None)` polls again, `Err` aborts
/// immediately (terminal provider errors are not retried here). On expiry
/// the error names the operation that timed out.
pub async fn wait_for<T, F, Fut>(
    operation: &str,
    timeout: Duration,
    interval: Duration,
    mut poll: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = poll().await? {
            return Ok(value);
        }
        if Instant::now() + interval > deadline {
            return Err(Error::OperationTimeout {
                operation: operation.to_string(),
                waited_secs: timeout.as_secs(),
            });
        }
        trace!(operation, "still pending, polling again");
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_wait_resolves_after_pending_polls() {
        let polls = AtomicU32::new(0);
        let polls = &polls;
        let value = wait_for(
            "test",
            Duration::from_secs(5),
            Duration::from_millis(1),
            || async move {
                if polls.fetch_add(1, Ordering::SeqCst) < 3 {
                    Ok(None)
                } else {
                    Ok(Some(42))
                }
            },
        )
        .await
        .unwrap();
        assert_eq!(value, 42);
        assert_eq!(polls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let err = wait_for::<u32, _, _>(
            "attach",
            Duration::from_millis(10),
            Duration::from_millis(2),
            || async move { Ok(None) },
        )
        .await
        .unwrap_err();
        assert_matches!(err, Error::OperationTimeout { operation, .. } if operation == "attach");
    }

    #[tokio::test]
    async fn test_wait_aborts_on_terminal_error() {
        let polls = AtomicU32::new(0);
        let polls = &polls;
        let err = wait_for::<u32, _, _>(
            "inspect",
            Duration::from_secs(5),
            Duration::from_millis(1),
            || async move {
                polls.fetch_add(1, Ordering::SeqCst);
                Err(Error::VolNotFound {
                    volume_id: "vol-1".into(),
                })
            },
        )
        .await
        .unwrap_err();
        assert_matches!(err, Error::VolNotFound { .. });
        assert_eq!(polls.load(Ordering::SeqCst), 1);
    }
}
