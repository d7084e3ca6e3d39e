//! Multi-source scan driver.
//!
//! Every source gets its own [`LineStream`] and a fresh [`Channel`] with a
//! [`MatchDetector`] subscribed first. Lines are published one at a time; the
//! detector's flag is checked after each publish and the source stops as soon
//! as it is set. Sources run concurrently inside the calling task, and each
//! one's outcome lands in its own [`ScanResult`] regardless of what happens
//! to its siblings.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{Instrument, debug, debug_span, info, warn};
use uuid::Uuid;

use crate::cancel::CancellationToken;
use crate::error::{ErrorKind, Result, ScanError};
use crate::predicate::Predicate;
use crate::scan::channel::{Channel, Subscriber};
use crate::scan::config::ScanConfig;
use crate::scan::source::{LineRecord, ResourceOpener, SourceId};
use crate::scan::stream::LineStream;

/// Per-source lifecycle: `Init → Streaming → {Matched | Exhausted | Aborted | Errored}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanState {
    Init,
    Streaming,
    Matched,
    Exhausted,
    Aborted,
    Errored,
}

impl ScanState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ScanState::Matched | ScanState::Exhausted | ScanState::Aborted | ScanState::Errored
        )
    }

    /// Whether `self → next` is a legal transition.
    pub fn can_advance_to(self, next: ScanState) -> bool {
        match self {
            ScanState::Init => matches!(
                next,
                ScanState::Streaming | ScanState::Aborted | ScanState::Errored
            ),
            ScanState::Streaming => next.is_terminal(),
            _ => false,
        }
    }

    fn advance(&mut self, next: ScanState) {
        debug_assert!(
            self.can_advance_to(next),
            "illegal scan transition {self:?} -> {next:?}"
        );
        *self = next;
    }

    fn for_error(err: &ScanError) -> ScanState {
        if err.is_canceled() {
            ScanState::Aborted
        } else {
            ScanState::Errored
        }
    }
}

/// Outcome of scanning one source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResult {
    pub source_id: SourceId,
    pub matched: bool,
    pub match_line: Option<LineRecord>,
    pub state: ScanState,
    pub lines_read: u64,
    pub error: Option<ErrorKind>,
    pub error_message: Option<String>,
}

impl ScanResult {
    /// User-facing summary: "match found at line N", "no match" or
    /// "error: <kind>".
    pub fn outcome(&self) -> String {
        match (&self.match_line, self.state) {
            (Some(record), _) => format!("match found at line {}", record.line_number),
            (None, ScanState::Exhausted) => "no match".to_string(),
            (None, ScanState::Aborted) => format!("error: {}", ErrorKind::Canceled),
            (None, _) => format!(
                "error: {}",
                self.error.map(|kind| kind.as_str()).unwrap_or("unknown")
            ),
        }
    }

    /// Matched or exhausted without interference.
    pub fn is_success(&self) -> bool {
        matches!(self.state, ScanState::Matched | ScanState::Exhausted)
    }
}

/// Results of one `scan_sources` call, keyed by source.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanReport {
    pub scan_id: Uuid,
    pub results: BTreeMap<SourceId, ScanResult>,
}

impl ScanReport {
    pub fn get(&self, source_id: &SourceId) -> Option<&ScanResult> {
        self.results.get(source_id)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn matched(&self) -> impl Iterator<Item = &ScanResult> {
        self.results.values().filter(|result| result.matched)
    }

    /// Sources that ended aborted or in error.
    pub fn errored(&self) -> impl Iterator<Item = &ScanResult> {
        self.results.values().filter(|result| !result.is_success())
    }

    pub fn all_succeeded(&self) -> bool {
        self.errored().next().is_none()
    }
}

/// Observability hook for scan progress.
pub trait ScanObserver: Send + Sync {
    fn on_line(&self, _record: &LineRecord) {}
    fn on_match(&self, _record: &LineRecord) {}
    fn on_complete(&self, _result: &ScanResult) {}
}

/// Default observer: one log line per read, per match and per source.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingScanObserver;

impl ScanObserver for TracingScanObserver {
    fn on_line(&self, record: &LineRecord) {
        debug!(
            target: "scan::read",
            source = %record.source_id,
            line = record.line_number,
            text = %record.text,
            "line read"
        );
    }

    fn on_match(&self, record: &LineRecord) {
        info!(
            target: "scan::match",
            source = %record.source_id,
            line = record.line_number,
            text = %record.text,
            "match found"
        );
    }

    fn on_complete(&self, result: &ScanResult) {
        info!(
            target: "scan::summary",
            source = %result.source_id,
            state = ?result.state,
            lines_read = result.lines_read,
            outcome = %result.outcome(),
            "source scan finished"
        );
    }
}

/// No-op observer used when nothing should be reported.
pub struct NoopScanObserver;

impl ScanObserver for NoopScanObserver {}

impl fmt::Debug for NoopScanObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NoopScanObserver")
    }
}

/// Channel subscriber that records the first line its predicate accepts and
/// skips every line after that.
pub struct MatchDetector<P: ?Sized> {
    predicate: Arc<P>,
    token: CancellationToken,
    observer: Arc<dyn ScanObserver>,
    found: Mutex<Option<LineRecord>>,
}

impl<P: ?Sized> fmt::Debug for MatchDetector<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatchDetector")
            .field("matched", &self.is_matched())
            .finish()
    }
}

impl<P: ?Sized> MatchDetector<P> {
    pub fn new(
        predicate: Arc<P>,
        token: CancellationToken,
        observer: Arc<dyn ScanObserver>,
    ) -> Self {
        Self {
            predicate,
            token,
            observer,
            found: Mutex::new(None),
        }
    }

    pub fn is_matched(&self) -> bool {
        self.found
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn match_line(&self) -> Option<LineRecord> {
        self.found
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl<P> Subscriber<LineRecord> for MatchDetector<P>
where
    P: Predicate<String> + ?Sized,
{
    async fn on_item(&self, record: &LineRecord) -> Result<()> {
        if self.is_matched() {
            return Ok(());
        }

        if self.predicate.test(&record.text, &self.token).await? {
            let mut found = self.found.lock().unwrap_or_else(PoisonError::into_inner);
            if found.is_none() {
                *found = Some(record.clone());
                drop(found);
                self.observer.on_match(record);
            }
        }
        Ok(())
    }
}

/// Builds the extra subscribers for one source's channel. Called once per
/// source so no subscriber state is shared between sources.
pub type SubscriberFactory =
    Arc<dyn Fn(&SourceId) -> Vec<Arc<dyn Subscriber<LineRecord>>> + Send + Sync>;

/// Drives one line stream, channel and match detector per source.
pub struct ScanOrchestrator<O: ?Sized, P: ?Sized> {
    opener: Arc<O>,
    predicate: Arc<P>,
    config: ScanConfig,
    observer: Arc<dyn ScanObserver>,
    subscribers: Option<SubscriberFactory>,
}

impl<O: ?Sized, P: ?Sized> fmt::Debug for ScanOrchestrator<O, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanOrchestrator")
            .field("opener_type", &std::any::type_name::<O>())
            .field("predicate_type", &std::any::type_name::<P>())
            .field("config", &self.config)
            .field("extra_subscribers", &self.subscribers.is_some())
            .finish()
    }
}

impl<O, P> ScanOrchestrator<O, P>
where
    O: ResourceOpener + ?Sized + 'static,
    P: Predicate<String> + ?Sized + 'static,
{
    pub fn new(opener: Arc<O>, predicate: Arc<P>) -> Self {
        Self {
            opener,
            predicate,
            config: ScanConfig::default(),
            observer: Arc::new(TracingScanObserver),
            subscribers: None,
        }
    }

    pub fn with_config(mut self, config: ScanConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ScanObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Registers additional subscribers on every source's channel, after the
    /// match detector.
    pub fn with_subscribers<F>(mut self, factory: F) -> Self
    where
        F: Fn(&SourceId) -> Vec<Arc<dyn Subscriber<LineRecord>>> + Send + Sync + 'static,
    {
        self.subscribers = Some(Arc::new(factory));
        self
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Scans every source concurrently and collects one result per distinct
    /// source id. Duplicate ids are scanned once.
    pub async fn scan_sources<I, S>(&self, source_ids: I, token: &CancellationToken) -> ScanReport
    where
        I: IntoIterator<Item = S>,
        S: Into<SourceId>,
    {
        let scan_id = Uuid::now_v7();
        let mut seen = HashSet::new();
        let ids: Vec<SourceId> = source_ids
            .into_iter()
            .map(Into::into)
            .filter(|id: &SourceId| seen.insert(id.clone()))
            .collect();
        let concurrency = self.config.concurrency_for(ids.len());

        debug!(
            %scan_id,
            sources = ids.len(),
            concurrency = concurrency.get(),
            "starting multi-source scan"
        );

        let results: BTreeMap<SourceId, ScanResult> = futures::stream::iter(ids)
            .map(|source_id| {
                let span = debug_span!("scan_source", %scan_id, source = %source_id);
                self.scan_source(source_id, token).instrument(span)
            })
            .buffer_unordered(concurrency.get())
            .map(|result| (result.source_id.clone(), result))
            .collect()
            .await;

        ScanReport { scan_id, results }
    }

    /// Scans a single source to a terminal state.
    pub async fn scan_source(&self, source_id: SourceId, token: &CancellationToken) -> ScanResult {
        let started = Instant::now();
        let mut state = ScanState::Init;

        let detector = Arc::new(MatchDetector::new(
            Arc::clone(&self.predicate),
            token.clone(),
            Arc::clone(&self.observer),
        ));
        let mut channel: Channel<LineRecord> = Channel::new();
        channel.subscribe(Arc::clone(&detector));
        if let Some(factory) = &self.subscribers {
            for subscriber in factory(&source_id) {
                channel.subscribe(subscriber);
            }
        }

        let opened =
            LineStream::open(self.opener.as_ref(), source_id.clone(), token.clone()).await;
        let (lines_read, error) = match opened {
            Ok(mut stream) => {
                state.advance(ScanState::Streaming);
                let observer = self.observer.as_ref();
                let driven = drive(&mut stream, &channel, detector.as_ref(), observer).await;
                stream.stop();
                match driven {
                    Ok(terminal) => {
                        state.advance(terminal);
                        (stream.lines_read(), None)
                    }
                    Err(err) => {
                        state.advance(ScanState::for_error(&err));
                        (stream.lines_read(), Some(err))
                    }
                }
            }
            Err(err) => {
                state.advance(ScanState::for_error(&err));
                (0, Some(err))
            }
        };

        if state == ScanState::Errored {
            if let Some(err) = &error {
                warn!(source = %source_id, error = %err, "source scan failed");
            }
            if self.config.abort_siblings_on_error {
                warn!(source = %source_id, "aborting sibling scans after source failure");
                token.abort();
            }
        }

        let match_line = detector.match_line();
        let result = ScanResult {
            source_id,
            matched: match_line.is_some(),
            match_line,
            state,
            lines_read,
            error: error.as_ref().map(ScanError::kind),
            error_message: error.as_ref().map(ToString::to_string),
        };

        debug!(elapsed_ms = started.elapsed().as_millis() as u64, "source scan timing");
        self.observer.on_complete(&result);
        result
    }
}

async fn drive<P>(
    stream: &mut LineStream,
    channel: &Channel<LineRecord>,
    detector: &MatchDetector<P>,
    observer: &dyn ScanObserver,
) -> Result<ScanState>
where
    P: ?Sized,
{
    loop {
        let Some(record) = stream.next().await? else {
            return Ok(ScanState::Exhausted);
        };
        observer.on_line(&record);

        // A recorded match is final; later subscribers cannot undo it.
        if let Err(err) = channel.publish(&record).await {
            if !detector.is_matched() {
                return Err(err);
            }
            warn!(
                source = %record.source_id,
                line = record.line_number,
                error = %err,
                "subscriber failed after the match was recorded"
            );
        }

        if detector.is_matched() {
            return Ok(ScanState::Matched);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predicate;
    use crate::scan::source::MemoryOpener;

    #[test]
    fn only_forward_transitions_are_legal() {
        assert!(ScanState::Init.can_advance_to(ScanState::Streaming));
        assert!(ScanState::Init.can_advance_to(ScanState::Errored));
        assert!(!ScanState::Init.can_advance_to(ScanState::Matched));
        assert!(ScanState::Streaming.can_advance_to(ScanState::Exhausted));
        assert!(!ScanState::Streaming.can_advance_to(ScanState::Init));
        for terminal in [
            ScanState::Matched,
            ScanState::Exhausted,
            ScanState::Aborted,
            ScanState::Errored,
        ] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_advance_to(ScanState::Streaming));
        }
    }

    #[test]
    fn outcome_text_covers_every_terminal_state() {
        let mut result = ScanResult {
            source_id: SourceId::from("a"),
            matched: true,
            match_line: Some(LineRecord {
                source_id: SourceId::from("a"),
                line_number: 3,
                text: "x@y.z".into(),
            }),
            state: ScanState::Matched,
            lines_read: 3,
            error: None,
            error_message: None,
        };
        assert_eq!(result.outcome(), "match found at line 3");

        result.matched = false;
        result.match_line = None;
        result.state = ScanState::Exhausted;
        assert_eq!(result.outcome(), "no match");

        result.state = ScanState::Aborted;
        result.error = Some(ErrorKind::Canceled);
        assert_eq!(result.outcome(), "error: canceled");

        result.state = ScanState::Errored;
        result.error = Some(ErrorKind::Source);
        assert_eq!(result.outcome(), "error: source");
        assert!(!result.is_success());
    }

    #[tokio::test]
    async fn detector_skips_lines_after_first_match() {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let predicate = Arc::new(predicate::from_fn(move |text: String, _| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async move { Ok(text.contains('!')) }
        }));
        let detector = MatchDetector::new(
            predicate,
            CancellationToken::new(),
            Arc::new(NoopScanObserver),
        );

        for (n, text) in ["a", "b!", "c!"].into_iter().enumerate() {
            let record = LineRecord {
                source_id: SourceId::from("s"),
                line_number: n as u64 + 1,
                text: text.into(),
            };
            detector.on_item(&record).await.unwrap();
        }

        assert_eq!(detector.match_line().unwrap().line_number, 2);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unknown_source_is_errored_before_streaming() {
        let opener = Arc::new(MemoryOpener::new());
        let predicate = Arc::new(predicate::from_fn(|_: String, _| async { Ok(false) }));
        let orchestrator = ScanOrchestrator::new(opener, predicate)
            .with_observer(Arc::new(NoopScanObserver));

        let result = orchestrator
            .scan_source(SourceId::from("ghost"), &CancellationToken::new())
            .await;
        assert_eq!(result.state, ScanState::Errored);
        assert_eq!(result.error, Some(ErrorKind::Source));
        assert_eq!(result.lines_read, 0);
        assert_eq!(result.outcome(), "error: source");
    }
}
