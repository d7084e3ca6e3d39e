//! Ordered, per-source fan-out of items to subscribers.
//!
//! Unlike the broadcast buses used for cross-task notifications, a
//! [`Channel`] delivers each item to its subscribers one after another, in
//! registration order, awaiting each before starting the next. Side effects
//! of subscriber *i* are therefore always visible to subscriber *i + 1*.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;

/// Receives every item published on a [`Channel`].
#[async_trait]
pub trait Subscriber<T>: Send + Sync {
    async fn on_item(&self, item: &T) -> Result<()>;
}

#[async_trait]
impl<T, S> Subscriber<T> for Arc<S>
where
    T: Sync,
    S: Subscriber<T> + ?Sized,
{
    async fn on_item(&self, item: &T) -> Result<()> {
        (**self).on_item(item).await
    }
}

/// Subscriber backed by an async closure over an owned copy of the item.
pub struct FnSubscriber<T, F> {
    func: F,
    _item: PhantomData<fn(T)>,
}

impl<T, F> fmt::Debug for FnSubscriber<T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnSubscriber")
            .field("item_type", &std::any::type_name::<T>())
            .finish()
    }
}

#[async_trait]
impl<T, F, Fut> Subscriber<T> for FnSubscriber<T, F>
where
    T: Clone + Send + Sync,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn on_item(&self, item: &T) -> Result<()> {
        (self.func)(item.clone()).await
    }
}

/// Ordered subscriber list for one source. The channel exclusively owns its
/// subscribers and never removes them; a subscriber that no longer cares
/// about items must skip them itself.
pub struct Channel<T> {
    subscribers: Vec<Arc<dyn Subscriber<T>>>,
}

impl<T> Default for Channel<T> {
    fn default() -> Self {
        Self {
            subscribers: Vec::new(),
        }
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

impl<T: Sync + 'static> Channel<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a subscriber; it receives every item published from now on.
    pub fn subscribe<S>(&mut self, subscriber: S)
    where
        S: Subscriber<T> + 'static,
    {
        self.subscribers.push(Arc::new(subscriber));
    }

    /// Appends a subscriber built from an async closure.
    pub fn subscribe_fn<F, Fut>(&mut self, func: F)
    where
        T: Clone + Send,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.subscribe(FnSubscriber {
            func,
            _item: PhantomData,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Delivers `item` to every subscriber sequentially in registration
    /// order. Delivery stops at the first subscriber error, which is
    /// returned; later subscribers do not see this item.
    pub async fn publish(&self, item: &T) -> Result<()> {
        for subscriber in &self.subscribers {
            subscriber.on_item(item).await?;
        }
        Ok(())
    }
}
