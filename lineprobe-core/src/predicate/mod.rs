//! Uniform, future-returning predicates.
//!
//! Everything downstream of this module (quantifiers, match detection) only
//! ever sees [`Predicate`]. Legacy callback-style tests are normalized once at
//! the boundary through [`adapter::wrap`].

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

use crate::cancel::CancellationToken;
use crate::error::Result;

pub mod adapter;
pub mod email;

pub use adapter::{CallbackPredicate, Completion, RawTest, wrap};
pub use email::EmailPattern;

/// An asynchronous, possibly slow or fallible test over one item.
///
/// Implementations that wait on anything (timers, I/O) should watch `token`
/// and return [`crate::ScanError::Canceled`] once it aborts.
#[async_trait]
pub trait Predicate<T: ?Sized + Sync>: Send + Sync {
    async fn test(&self, item: &T, token: &CancellationToken) -> Result<bool>;
}

#[async_trait]
impl<T, P> Predicate<T> for Arc<P>
where
    T: ?Sized + Sync,
    P: Predicate<T> + ?Sized,
{
    async fn test(&self, item: &T, token: &CancellationToken) -> Result<bool> {
        (**self).test(item, token).await
    }
}

/// Predicate backed by an async closure over an owned copy of the item.
pub struct FnPredicate<T, F> {
    func: F,
    _item: PhantomData<fn(T)>,
}

impl<T, F> fmt::Debug for FnPredicate<T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnPredicate")
            .field("item_type", &std::any::type_name::<T>())
            .finish()
    }
}

/// Lifts `func(item, token)` into a [`Predicate`].
///
/// ```
/// use lineprobe_core::predicate::{self, Predicate};
/// use lineprobe_core::CancellationToken;
///
/// # async fn demo() -> lineprobe_core::Result<()> {
/// let even = predicate::from_fn(|n: u32, _token| async move { Ok(n % 2 == 0) });
/// assert!(even.test(&4, &CancellationToken::new()).await?);
/// # Ok(())
/// # }
/// ```
pub fn from_fn<T, F, Fut>(func: F) -> FnPredicate<T, F>
where
    T: Clone + Send + Sync,
    F: Fn(T, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<bool>> + Send,
{
    FnPredicate {
        func,
        _item: PhantomData,
    }
}

#[async_trait]
impl<T, F, Fut> Predicate<T> for FnPredicate<T, F>
where
    T: Clone + Send + Sync,
    F: Fn(T, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<bool>> + Send,
{
    async fn test(&self, item: &T, token: &CancellationToken) -> Result<bool> {
        (self.func)(item.clone(), token.clone()).await
    }
}

#[async_trait]
impl Predicate<str> for regex::Regex {
    async fn test(&self, item: &str, token: &CancellationToken) -> Result<bool> {
        if token.is_aborted() {
            return Err(crate::ScanError::Canceled);
        }
        Ok(self.is_match(item))
    }
}

#[async_trait]
impl Predicate<String> for regex::Regex {
    async fn test(&self, item: &String, token: &CancellationToken) -> Result<bool> {
        <Self as Predicate<str>>::test(self, item.as_str(), token).await
    }
}
