//! Forever-retry exponential backoff for Access and Relay (§4.5, §9):
//! keep re-dialing a Hub until it connects or the caller cancels.
//!
//! Grounded on `original_source/interact.go`'s `NewNeverStopBackOff` and
//! its `backoff.RetryNotify(dial, backoff.WithContext(...), notify)`
//! call: the defaults (500ms initial interval, 1.5x multiplier, 60s cap,
//! 0.5 randomization) with `MaxElapsedTime` disabled so the retry loop
//! never gives up on its own — only cancellation stops it.

use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use tokio_util::sync::CancellationToken;

use overlay_core::error::{OverlayError, OverlayResult};

fn never_stop() -> ExponentialBackoff {
    ExponentialBackoff {
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

/// Call `attempt` until it succeeds or `ctx` is cancelled, sleeping with
/// exponentially growing, jittered delays between failures. `notify` is
/// invoked with the error and the delay before the next retry, mirroring
/// the Go loop's warning log.
pub async fn retry_forever<F, Fut, T, N>(
    ctx: &CancellationToken,
    mut attempt: F,
    mut notify: N,
) -> OverlayResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = OverlayResult<T>>,
    N: FnMut(&OverlayError, Duration),
{
    let mut backoff = never_stop();

    loop {
        let result = tokio::select! {
            _ = ctx.cancelled() => return Err(OverlayError::DialCancelled("context cancelled".into())),
            res = attempt() => res,
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) => {
                let delay = backoff.next_backoff().unwrap_or(Duration::from_secs(60));
                notify(&e, delay);
                tokio::select! {
                    _ = ctx.cancelled() => return Err(OverlayError::DialCancelled("context cancelled".into())),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn retries_until_success() {
        let ctx = CancellationToken::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts2 = attempts.clone();

        let result = retry_forever(
            &ctx,
            move || {
                let attempts = attempts2.clone();
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(OverlayError::NoRoute)
                    } else {
                        Ok(42)
                    }
                }
            },
            |_, _| {},
        )
        .await
        .unwrap();

        assert_eq!(result, 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancellation_stops_retry_loop() {
        let ctx = CancellationToken::new();
        let ctx2 = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            ctx2.cancel();
        });

        let err = retry_forever(
            &ctx,
            || async { Err::<(), _>(OverlayError::NoRoute) },
            |_, _| {},
        )
        .await
        .unwrap_err();

        assert!(matches!(err, OverlayError::DialCancelled(_)));
    }
}
