use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::Stream;
use tracing::debug;

use crate::cancel::{CancellationToken, ListenerId};
use crate::error::{Result, ScanError};
use crate::scan::source::{LineRecord, LineResource, ResourceOpener, SourceId};

/// Resource cell shared between the stream and its abort listener. The
/// resource is `None` while a read is in flight and after release.
struct Slot {
    resource: Option<Box<dyn LineResource>>,
    released: bool,
}

type SharedSlot = Arc<Mutex<Slot>>;

fn lock(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Marks the slot released and closes whatever resource it still holds.
/// Returns `false` if it was already released.
fn release_slot(slot: &Mutex<Slot>, source_id: &SourceId, lines: Option<u64>) -> bool {
    let resource = {
        let mut slot = lock(slot);
        if slot.released {
            return false;
        }
        slot.released = true;
        slot.resource.take()
    };

    if let Some(mut resource) = resource {
        resource.close();
    }
    debug!(source = %source_id, lines, "line source released");
    true
}

/// Lazy, finite, cancellable sequence of [`LineRecord`]s from one source.
///
/// The underlying resource is released exactly once: on exhaustion, on
/// [`LineStream::stop`] (or drop), on a read error, or as soon as the token
/// aborts, even while nobody is reading. A stream is not restartable; open a
/// fresh one to scan the source again.
pub struct LineStream {
    source_id: SourceId,
    slot: SharedSlot,
    token: CancellationToken,
    listener: Option<ListenerId>,
    line_number: u64,
}

impl fmt::Debug for LineStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineStream")
            .field("source_id", &self.source_id)
            .field("line_number", &self.line_number)
            .field("released", &self.is_released())
            .field("token", &self.token)
            .finish()
    }
}

impl LineStream {
    /// Opens `source_id` through `opener`. Fails with
    /// [`ScanError::Canceled`] without touching the opener if the token has
    /// already aborted.
    pub async fn open<O>(opener: &O, source_id: SourceId, token: CancellationToken) -> Result<Self>
    where
        O: ResourceOpener + ?Sized,
    {
        if token.is_aborted() {
            return Err(ScanError::Canceled);
        }

        let opened = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(ScanError::Canceled),
            opened = opener.open(&source_id) => opened,
        };

        match opened {
            Ok(mut resource) if token.is_aborted() => {
                resource.close();
                Err(ScanError::Canceled)
            }
            Ok(resource) => Ok(Self::from_resource(source_id, resource, token)),
            Err(err) => Err(ScanError::source_io(source_id, err)),
        }
    }

    /// Wraps an already open resource. The resource is closed by an abort
    /// listener on `token` if the stream is still holding it then.
    pub fn from_resource(
        source_id: SourceId,
        resource: Box<dyn LineResource>,
        token: CancellationToken,
    ) -> Self {
        let slot: SharedSlot = Arc::new(Mutex::new(Slot {
            resource: Some(resource),
            released: false,
        }));

        let listener = {
            let slot = Arc::clone(&slot);
            let source_id = source_id.clone();
            token.on_abort(move || {
                release_slot(&slot, &source_id, None);
            })
        };

        Self {
            source_id,
            slot,
            token,
            listener: Some(listener),
            line_number: 0,
        }
    }

    pub fn source_id(&self) -> &SourceId {
        &self.source_id
    }

    /// Number of lines produced so far.
    pub fn lines_read(&self) -> u64 {
        self.line_number
    }

    pub fn is_released(&self) -> bool {
        lock(&self.slot).released
    }

    /// Produces the next line, `Ok(None)` once the source is exhausted.
    ///
    /// A read requested after the token aborted fails with
    /// [`ScanError::Canceled`] even if the resource still has data buffered;
    /// an abort that lands while a read is in flight abandons that read.
    pub async fn next(&mut self) -> Result<Option<LineRecord>> {
        if self.token.is_aborted() {
            self.release();
            return Err(ScanError::Canceled);
        }

        let taken = {
            let mut slot = lock(&self.slot);
            if slot.released {
                None
            } else {
                slot.resource.take()
            }
        };
        let Some(mut resource) = taken else {
            return Ok(None);
        };

        let read = tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            read = resource.next_line() => Some(read),
        };

        match read {
            Some(Ok(Some(text))) if !self.token.is_aborted() => {
                if !self.restore(resource) {
                    return Err(ScanError::Canceled);
                }
                self.line_number += 1;
                Ok(Some(LineRecord {
                    source_id: self.source_id.clone(),
                    line_number: self.line_number,
                    text,
                }))
            }
            None | Some(Ok(Some(_))) => {
                self.release_with(resource);
                Err(ScanError::Canceled)
            }
            Some(Ok(None)) => {
                self.release_with(resource);
                Ok(None)
            }
            Some(Err(err)) => {
                self.release_with(resource);
                Err(ScanError::source_io(self.source_id.clone(), err))
            }
        }
    }

    /// Stops early, releasing the resource. Later reads yield `Ok(None)`
    /// (or `Canceled` once the token aborts).
    pub fn stop(&mut self) {
        self.release();
    }

    /// Adapts the stream into a [`futures::Stream`]. The adapted stream ends
    /// after the first error.
    pub fn into_stream(mut self) -> impl Stream<Item = Result<LineRecord>> + Send {
        async_stream::stream! {
            loop {
                match self.next().await {
                    Ok(Some(record)) => yield Ok(record),
                    Ok(None) => break,
                    Err(err) => {
                        yield Err(err);
                        break;
                    }
                }
            }
        }
    }

    /// Puts a resource back after a read. Closes it instead if the abort
    /// listener released the slot while the read was in flight.
    fn restore(&mut self, mut resource: Box<dyn LineResource>) -> bool {
        {
            let mut slot = lock(&self.slot);
            if !slot.released {
                slot.resource = Some(resource);
                return true;
            }
        }
        resource.close();
        self.forget_listener();
        false
    }

    fn release_with(&mut self, resource: Box<dyn LineResource>) {
        lock(&self.slot).resource = Some(resource);
        self.release();
    }

    fn release(&mut self) {
        if !release_slot(&self.slot, &self.source_id, Some(self.line_number)) {
            // Released by the abort listener while the resource was idle,
            // or by the read path after the listener found an empty slot.
            let orphan = lock(&self.slot).resource.take();
            if let Some(mut resource) = orphan {
                resource.close();
            }
        }
        self.forget_listener();
    }

    fn forget_listener(&mut self) {
        if let Some(id) = self.listener.take() {
            self.token.remove_listener(id);
        }
    }
}

impl Drop for LineStream {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::source::{MemoryOpener, ResourceStats};
    use futures::StreamExt;

    fn opener() -> MemoryOpener {
        MemoryOpener::new().with_source("s", ["one", "two", "three"])
    }

    #[tokio::test]
    async fn numbers_lines_and_releases_on_exhaustion() {
        let opener = opener();
        let id = SourceId::from("s");
        let mut stream = LineStream::open(&opener, id.clone(), CancellationToken::new())
            .await
            .unwrap();

        let mut seen = Vec::new();
        while let Some(record) = stream.next().await.unwrap() {
            assert_eq!(record.source_id, id);
            seen.push((record.line_number, record.text));
        }
        assert_eq!(
            seen,
            vec![(1, "one".into()), (2, "two".into()), (3, "three".into())]
        );
        assert!(stream.is_released());
        assert_eq!(stream.next().await.unwrap(), None);
        drop(stream);

        assert_eq!(
            opener.stats(&id).unwrap(),
            ResourceStats { opens: 1, reads: 3, closes: 1 }
        );
    }

    #[tokio::test]
    async fn abort_mid_iteration_halts_delivery_and_closes_once() {
        let opener = opener();
        let id = SourceId::from("s");
        let token = CancellationToken::new();
        let mut stream = LineStream::open(&opener, id.clone(), token.clone()).await.unwrap();

        assert_eq!(stream.next().await.unwrap().unwrap().line_number, 1);
        token.abort();

        assert!(stream.next().await.unwrap_err().is_canceled());
        assert!(stream.next().await.unwrap_err().is_canceled());
        stream.stop();
        drop(stream);

        let stats = opener.stats(&id).unwrap();
        assert_eq!(stats.reads, 1);
        assert_eq!(stats.closes, 1);
    }

    #[tokio::test]
    async fn abort_while_idle_closes_the_resource_immediately() {
        let opener = opener();
        let id = SourceId::from("s");
        let token = CancellationToken::new();
        let mut stream = LineStream::open(&opener, id.clone(), token.clone()).await.unwrap();

        stream.next().await.unwrap();
        assert_eq!(token.pending_listeners(), 1);
        token.abort();

        assert!(stream.is_released());
        assert_eq!(opener.stats(&id).unwrap().closes, 1);

        assert!(stream.next().await.unwrap_err().is_canceled());
        drop(stream);
        assert_eq!(
            opener.stats(&id).unwrap(),
            ResourceStats { opens: 1, reads: 1, closes: 1 }
        );
    }

    #[tokio::test]
    async fn release_deregisters_the_abort_listener() {
        let opener = opener();
        let token = CancellationToken::new();
        let mut stream = LineStream::open(&opener, SourceId::from("s"), token.clone())
            .await
            .unwrap();
        assert_eq!(token.pending_listeners(), 1);

        while stream.next().await.unwrap().is_some() {}
        assert_eq!(token.pending_listeners(), 0);

        token.abort();
        drop(stream);
        assert_eq!(opener.stats(&SourceId::from("s")).unwrap().closes, 1);
    }

    #[tokio::test]
    async fn early_stop_and_drop_release_once() {
        let opener = opener();
        let id = SourceId::from("s");
        let mut stream = LineStream::open(&opener, id.clone(), CancellationToken::new())
            .await
            .unwrap();
        stream.next().await.unwrap();
        stream.stop();
        stream.stop();
        assert_eq!(stream.next().await.unwrap(), None);
        drop(stream);

        let dropped = LineStream::open(&opener, id.clone(), CancellationToken::new())
            .await
            .unwrap();
        drop(dropped);

        let stats = opener.stats(&id).unwrap();
        assert_eq!(stats.opens, 2);
        assert_eq!(stats.closes, 2);
    }

    #[tokio::test]
    async fn read_errors_surface_as_source_errors() {
        let opener = MemoryOpener::new().with_failing_source("bad", ["ok", "never"], 2);
        let id = SourceId::from("bad");
        let mut stream = LineStream::open(&opener, id.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert!(stream.next().await.unwrap().is_some());
        let err = stream.next().await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Source);
        assert!(stream.is_released());
        assert_eq!(opener.stats(&id).unwrap().closes, 1);
    }

    #[tokio::test]
    async fn pre_aborted_open_never_touches_the_opener() {
        let opener = opener();
        let token = CancellationToken::new();
        token.abort();
        let err = LineStream::open(&opener, SourceId::from("s"), token)
            .await
            .unwrap_err();
        assert!(err.is_canceled());
        assert_eq!(opener.stats(&SourceId::from("s")).unwrap().opens, 0);
    }

    #[tokio::test]
    async fn adapts_into_a_futures_stream() {
        let opener = opener();
        let stream = LineStream::open(&opener, SourceId::from("s"), CancellationToken::new())
            .await
            .unwrap();
        let texts: Vec<String> = stream
            .into_stream()
            .map(|record| record.unwrap().text)
            .collect()
            .await;
        assert_eq!(texts, vec!["one", "two", "three"]);
        assert_eq!(opener.stats(&SourceId::from("s")).unwrap().closes, 1);
    }
}
