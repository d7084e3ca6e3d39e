//! Bridge from callback-style tests to [`Predicate`].
//!
//! A raw test receives the item and a one-shot [`Completion`] it must call
//! with its verdict. The adapter delays each invocation behind a timer task
//! that is aborted (not merely ignored) when the token fires, so a canceled
//! check never leaves a stray wake-up behind.

use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::trace;

use crate::cancel::{CancellationToken, ListenerGuard};
use crate::error::{PredicateError, Result, ScanError};
use crate::predicate::Predicate;

/// Aborts the timer task when the evaluation that started it goes away.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// One-shot callback handed to a raw test.
pub type Completion = Box<dyn FnOnce(std::result::Result<bool, PredicateError>) + Send>;

/// A legacy callback-style test.
pub trait RawTest<T: ?Sized>: Send + Sync {
    fn run(&self, item: &T, done: Completion);
}

impl<T, F> RawTest<T> for F
where
    T: ?Sized,
    F: Fn(&T, Completion) + Send + Sync,
{
    fn run(&self, item: &T, done: Completion) {
        self(item, done)
    }
}

/// Wraps `raw` so that every evaluation first waits `delay` on a cancellable
/// timer, then invokes the raw test.
pub fn wrap<T, R>(raw: R, delay: Duration) -> CallbackPredicate<T, R>
where
    T: ?Sized + Sync,
    R: RawTest<T>,
{
    CallbackPredicate {
        raw,
        delay,
        _item: PhantomData,
    }
}

pub struct CallbackPredicate<T: ?Sized, R> {
    raw: R,
    delay: Duration,
    _item: PhantomData<fn(&T)>,
}

impl<T: ?Sized, R> CallbackPredicate<T, R> {
    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl<T: ?Sized, R> fmt::Debug for CallbackPredicate<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackPredicate")
            .field("delay", &self.delay)
            .field("raw_type", &std::any::type_name::<R>())
            .finish()
    }
}

impl<T: ?Sized, R> CallbackPredicate<T, R>
where
    R: RawTest<T>,
{
    async fn wait_timer(&self, token: &CancellationToken) -> Result<()> {
        if self.delay.is_zero() {
            return Ok(());
        }

        let delay = self.delay;
        let timer = tokio::spawn(async move { tokio::time::sleep(delay).await });
        let _timer_guard = AbortOnDrop(timer.abort_handle());
        let handle = timer.abort_handle();
        let id = token.on_abort(move || handle.abort());
        let _guard = ListenerGuard { token, id };

        match timer.await {
            Ok(()) => Ok(()),
            Err(err) if err.is_cancelled() => {
                trace!("predicate timer cleared on abort");
                Err(ScanError::Canceled)
            }
            Err(err) => Err(ScanError::predicate(format!("predicate timer failed: {err}"))),
        }
    }

    async fn run_raw(&self, item: &T, token: &CancellationToken) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        let done: Completion = Box::new(move |verdict| {
            let _ = tx.send(verdict);
        });
        self.raw.run(item, done);

        let verdict = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(ScanError::Canceled),
            verdict = rx => verdict,
        };

        // The raw test may have completed after an abort it could not observe.
        if token.is_aborted() {
            return Err(ScanError::Canceled);
        }

        match verdict {
            Ok(Ok(flag)) => Ok(flag),
            Ok(Err(err)) => Err(ScanError::Predicate(err)),
            Err(_) => Err(ScanError::predicate(
                "raw test dropped its completion without a verdict",
            )),
        }
    }
}

#[async_trait]
impl<T, R> Predicate<T> for CallbackPredicate<T, R>
where
    T: ?Sized + Sync,
    R: RawTest<T>,
{
    async fn test(&self, item: &T, token: &CancellationToken) -> Result<bool> {
        if token.is_aborted() {
            return Err(ScanError::Canceled);
        }
        self.wait_timer(token).await?;
        self.run_raw(item, token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_raw(
        calls: Arc<AtomicUsize>,
    ) -> impl Fn(&u32, Completion) + Send + Sync {
        move |n: &u32, done: Completion| {
            calls.fetch_add(1, Ordering::SeqCst);
            done(Ok(*n == 2));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn resolves_raw_verdict_after_delay() {
        let calls = Arc::new(AtomicUsize::new(0));
        let predicate = wrap(counting_raw(Arc::clone(&calls)), Duration::from_millis(100));
        let token = CancellationToken::new();

        assert!(predicate.test(&2, &token).await.unwrap());
        assert!(!predicate.test(&3, &token).await.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(token.pending_listeners(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_clears_timer_and_skips_raw_test() {
        let calls = Arc::new(AtomicUsize::new(0));
        let predicate = Arc::new(wrap(
            counting_raw(Arc::clone(&calls)),
            Duration::from_secs(10),
        ));
        let token = CancellationToken::new();

        let pending = {
            let predicate = Arc::clone(&predicate);
            let token = token.clone();
            tokio::spawn(async move { predicate.test(&2, &token).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.abort();

        let err = pending.await.unwrap().unwrap_err();
        assert!(err.is_canceled());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn pre_aborted_token_never_reaches_raw_test() {
        let calls = Arc::new(AtomicUsize::new(0));
        let predicate = wrap(counting_raw(Arc::clone(&calls)), Duration::ZERO);
        let token = CancellationToken::new();
        token.abort();

        assert!(predicate.test(&2, &token).await.unwrap_err().is_canceled());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn raw_errors_and_dropped_completions_are_predicate_errors() {
        let token = CancellationToken::new();

        let failing = wrap(
            |_: &u32, done: Completion| done(Err(PredicateError::new("boom"))),
            Duration::ZERO,
        );
        let err = failing.test(&1, &token).await.unwrap_err();
        assert_eq!(err.to_string(), "Predicate error: boom");

        let forgetful = wrap(|_: &u32, done: Completion| drop(done), Duration::ZERO);
        let err = forgetful.test(&1, &token).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Predicate);
    }

    #[tokio::test]
    async fn abort_during_raw_test_wins_over_its_verdict() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        let predicate = wrap(
            move |_: &u32, done: Completion| {
                trigger.abort();
                done(Ok(true));
            },
            Duration::ZERO,
        );

        let err = predicate.test(&1, &token).await.unwrap_err();
        assert!(err.is_canceled());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_evaluation_stops_its_timer() {
        let calls = Arc::new(AtomicUsize::new(0));
        let predicate = wrap(counting_raw(Arc::clone(&calls)), Duration::from_millis(400));
        let token = CancellationToken::new();
        let metrics = tokio::runtime::Handle::current().metrics();
        let baseline = metrics.num_alive_tasks();

        let evaluation = predicate.test(&2, &token);
        let timed_out = tokio::time::timeout(Duration::from_millis(50), evaluation).await;
        assert!(timed_out.is_err());

        for _ in 0..10 {
            if metrics.num_alive_tasks() == baseline {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(metrics.num_alive_tasks(), baseline);
        assert_eq!(token.pending_listeners(), 0);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
