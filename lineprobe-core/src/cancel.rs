//! Cooperative cancellation shared by every layer of a scan.
//!
//! A [`CancellationToken`] is a monotonic abort flag plus an ordered registry
//! of one-shot listeners. Work that holds a token checks
//! [`CancellationToken::is_aborted`] before each discrete unit (next item,
//! next line, next timer) and registers a listener to unwind whatever it is
//! currently waiting on. Listeners fire exactly once, in registration order,
//! on the pending → aborted transition.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tracing::debug;

type Listener = Box<dyn FnOnce() + Send + 'static>;

/// Handle returned by [`CancellationToken::on_abort`], used to deregister a
/// listener that is no longer needed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: Vec<(u64, Listener)>,
}

#[derive(Default)]
struct Inner {
    aborted: AtomicBool,
    registry: Mutex<Registry>,
}

impl Inner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        // Listeners never run under this lock, so a poisoned guard still
        // holds a consistent registry.
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cloneable handle onto one shared abort flag.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pending = self.inner.registry().listeners.len();
        f.debug_struct("CancellationToken")
            .field("aborted", &self.is_aborted())
            .field("pending_listeners", &pending)
            .finish()
    }
}

impl CancellationToken {
    /// Creates a new pending token.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::Acquire)
    }

    /// Moves the token to the aborted state and runs every registered
    /// listener in registration order. Calling it again is a no-op.
    pub fn abort(&self) {
        let listeners = {
            let mut registry = self.inner.registry();
            if self.inner.aborted.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut registry.listeners)
        };

        debug!(listeners = listeners.len(), "cancellation token aborted");
        for (_, listener) in listeners {
            listener();
        }
    }

    /// Registers `listener` to run on abort. If the token is already aborted
    /// the listener runs immediately, before this call returns.
    pub fn on_abort<F>(&self, listener: F) -> ListenerId
    where
        F: FnOnce() + Send + 'static,
    {
        let mut registry = self.inner.registry();
        let id = registry.next_id;
        registry.next_id += 1;

        if self.inner.aborted.load(Ordering::Acquire) {
            drop(registry);
            listener();
        } else {
            registry.listeners.push((id, Box::new(listener)));
        }
        ListenerId(id)
    }

    /// Deregisters a listener that has not fired yet. Returns `false` when the
    /// listener already ran or was never registered on this token.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut registry = self.inner.registry();
        let before = registry.listeners.len();
        registry.listeners.retain(|(candidate, _)| *candidate != id.0);
        registry.listeners.len() != before
    }

    /// Resolves once the token is aborted.
    pub async fn cancelled(&self) {
        if self.is_aborted() {
            return;
        }

        let (tx, rx) = oneshot::channel::<()>();
        let id = self.on_abort(move || {
            let _ = tx.send(());
        });
        let _guard = ListenerGuard { token: self, id };
        let _ = rx.await;
    }

    /// Creates a token that aborts whenever `self` does, but can also be
    /// aborted on its own without affecting `self`. The returned
    /// [`ListenerId`] lives on `self` and should be removed once the child is
    /// no longer in use.
    pub fn linked_child(&self) -> (CancellationToken, ListenerId) {
        let child = CancellationToken::new();
        let weak = Arc::downgrade(&child.inner);
        let id = self.on_abort(move || {
            if let Some(inner) = weak.upgrade() {
                CancellationToken { inner }.abort();
            }
        });
        (child, id)
    }

    #[cfg(test)]
    pub(crate) fn pending_listeners(&self) -> usize {
        self.inner.registry().listeners.len()
    }
}

/// Removes a listener when the wait that registered it ends.
pub(crate) struct ListenerGuard<'a> {
    pub(crate) token: &'a CancellationToken,
    pub(crate) id: ListenerId,
}

impl Drop for ListenerGuard<'_> {
    fn drop(&mut self) {
        self.token.remove_listener(self.id);
    }
}

impl fmt::Debug for ListenerGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerGuard").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn listeners_fire_once_in_registration_order() {
        let token = CancellationToken::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let order = Arc::clone(&order);
            token.on_abort(move || order.lock().unwrap().push(n));
        }

        token.abort();
        token.abort();

        assert!(token.is_aborted());
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(token.pending_listeners(), 0);
    }

    #[test]
    fn late_listener_runs_immediately() {
        let token = CancellationToken::new();
        token.abort();

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        token.on_abort(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removed_listener_never_fires() {
        let token = CancellationToken::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let id = token.on_abort(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(token.remove_listener(id));
        assert!(!token.remove_listener(id));
        token.abort();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn clones_share_state() {
        let token = CancellationToken::new();
        let clone = token.clone();
        clone.abort();
        assert!(token.is_aborted());
    }

    #[test]
    fn linked_child_follows_parent_only() {
        let parent = CancellationToken::new();
        let (child, _) = parent.linked_child();
        child.abort();
        assert!(!parent.is_aborted());

        let (second, link) = parent.linked_child();
        parent.abort();
        assert!(second.is_aborted());
        assert!(!parent.remove_listener(link));
    }

    #[tokio::test]
    async fn cancelled_resolves_after_abort() {
        let token = CancellationToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        tokio::task::yield_now().await;
        token.abort();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn dropped_wait_deregisters_its_listener() {
        let token = CancellationToken::new();
        let wait = token.cancelled();
        let _ = tokio::time::timeout(std::time::Duration::from_millis(5), wait).await;
        assert_eq!(token.pending_listeners(), 0);
    }
}
