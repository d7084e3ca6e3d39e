//! Existential quantifiers ("does some item satisfy the predicate?") over an
//! ordered sequence, with cooperative cancellation.
//!
//! Two engines are provided as free functions:
//!
//! - [`sequential_some`] evaluates one item at a time, in order, and stops at
//!   the first `true` or the first error.
//! - [`parallel_some`] starts every evaluation at once and resolves with the
//!   first `true` to arrive. Errors are only surfaced after every evaluation
//!   has settled without a `true`, aggregated into a
//!   [`CompositeError`](crate::error::CompositeError).
//!
//! [`Strategy`] selects between them for callers that make the choice at
//! runtime.

use std::sync::Arc;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::cancel::{CancellationToken, ListenerGuard};
use crate::error::{CompositeError, Result, ScanError};
use crate::predicate::Predicate;

/// What happens to still-running evaluations once [`parallel_some`] has its
/// winning `true`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParallelMode {
    /// Losing evaluations are detached and keep running to completion; their
    /// results are discarded.
    #[default]
    LetLosersRun,
    /// Evaluations share a token linked to the caller's; the winning `true`
    /// aborts it so cooperative predicates stop early. The caller's token is
    /// left untouched.
    AbortLosers,
}

/// Runtime choice of quantifier engine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    Sequential,
    Parallel(ParallelMode),
}

impl Strategy {
    pub async fn some<I, T, P>(
        self,
        items: I,
        predicate: Arc<P>,
        token: &CancellationToken,
    ) -> Result<bool>
    where
        I: IntoIterator<Item = T>,
        T: Send + Sync + 'static,
        P: Predicate<T> + ?Sized + 'static,
    {
        match self {
            Strategy::Sequential => sequential_some(items, predicate.as_ref(), token).await,
            Strategy::Parallel(mode) => parallel_some(items, predicate, token, mode).await,
        }
    }
}

/// Evaluates `predicate` on each item strictly in order, awaiting each result
/// before starting the next.
///
/// Resolves `true` on the first affirmative result without touching the
/// remaining items, and `false` once every item evaluated negative. The first
/// predicate error halts evaluation and is returned as-is, unless the token
/// has aborted in the meantime, in which case the result is
/// [`ScanError::Canceled`].
pub async fn sequential_some<I, T, P>(
    items: I,
    predicate: &P,
    token: &CancellationToken,
) -> Result<bool>
where
    I: IntoIterator<Item = T>,
    T: Sync,
    P: Predicate<T> + ?Sized,
{
    if token.is_aborted() {
        return Err(ScanError::Canceled);
    }

    for (index, item) in items.into_iter().enumerate() {
        if token.is_aborted() {
            return Err(ScanError::Canceled);
        }

        match predicate.test(&item, token).await {
            Ok(true) => {
                trace!(index, "sequential quantifier short-circuited");
                return Ok(true);
            }
            Ok(false) => {}
            Err(_) if token.is_aborted() => return Err(ScanError::Canceled),
            Err(err) => return Err(err),
        }
    }

    Ok(false)
}

/// Starts an evaluation for every item concurrently (no backpressure) and
/// resolves `true` as soon as any of them does.
///
/// Without a `true`, the call waits for every evaluation to settle: any
/// cancellation yields [`ScanError::Canceled`], otherwise any failure yields
/// [`ScanError::Composite`], otherwise `false`. An abort of `token` observed
/// while waiting resolves [`ScanError::Canceled`] immediately.
///
/// Each evaluation runs as its own tokio task so that, under
/// [`ParallelMode::LetLosersRun`], losers genuinely keep running after this
/// call returns.
pub async fn parallel_some<I, T, P>(
    items: I,
    predicate: Arc<P>,
    token: &CancellationToken,
    mode: ParallelMode,
) -> Result<bool>
where
    I: IntoIterator<Item = T>,
    T: Send + Sync + 'static,
    P: Predicate<T> + ?Sized + 'static,
{
    if token.is_aborted() {
        return Err(ScanError::Canceled);
    }

    // Dropping this call early must not leave the link on the caller's token.
    let (eval_token, _link) = match mode {
        ParallelMode::LetLosersRun => (token.clone(), None),
        ParallelMode::AbortLosers => {
            let (child, id) = token.linked_child();
            (child, Some(ListenerGuard { token, id }))
        }
    };

    let mut pending: FuturesUnordered<_> = items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            let predicate = Arc::clone(&predicate);
            let token = eval_token.clone();
            let handle = tokio::spawn(async move { predicate.test(&item, &token).await });
            async move { (index, handle.await) }
        })
        .collect();
    let evaluated = pending.len();

    let outcome = settle(&mut pending, token, evaluated).await;

    if mode == ParallelMode::AbortLosers && matches!(outcome, Ok(true)) {
        eval_token.abort();
    }
    outcome
}

async fn settle<S>(pending: &mut S, token: &CancellationToken, evaluated: usize) -> Result<bool>
where
    S: futures::Stream<Item = (usize, std::result::Result<Result<bool>, tokio::task::JoinError>)>
        + Unpin,
{
    let cancelled = token.cancelled();
    tokio::pin!(cancelled);

    let mut failures = Vec::new();
    let mut canceled = false;

    loop {
        let next = tokio::select! {
            biased;
            next = pending.next() => next,
            _ = &mut cancelled => return Err(ScanError::Canceled),
        };
        let Some((index, joined)) = next else {
            break;
        };

        match joined {
            Ok(Ok(true)) => {
                trace!(index, evaluated, "parallel quantifier resolved");
                return Ok(true);
            }
            Ok(Ok(false)) => {}
            Ok(Err(ScanError::Canceled)) => canceled = true,
            Ok(Err(err)) => failures.push((index, err)),
            Err(join_err) => failures.push((
                index,
                ScanError::predicate(format!("predicate evaluation panicked: {join_err}")),
            )),
        }
    }

    if canceled || token.is_aborted() {
        return Err(ScanError::Canceled);
    }
    if !failures.is_empty() {
        return Err(CompositeError::new(evaluated, failures).into());
    }
    Ok(false)
}
