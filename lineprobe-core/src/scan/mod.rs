//! Multi-source line scanning.
//!
//! A scan opens one cancellable [`LineStream`] per source, fans every line out
//! through a per-source [`Channel`], and stops each source at its first
//! matching line. The [`ScanOrchestrator`] ties the pieces together and
//! reports one [`ScanResult`] per source.

pub mod channel;
pub mod config;
pub mod orchestrator;
pub mod source;
pub mod stream;

pub use channel::{Channel, FnSubscriber, Subscriber};
pub use config::ScanConfig;
pub use orchestrator::{
    MatchDetector, NoopScanObserver, ScanObserver, ScanOrchestrator, ScanReport, ScanResult,
    ScanState, SubscriberFactory, TracingScanObserver,
};
pub use source::{
    FsOpener, LineRecord, LineResource, MemoryOpener, ResourceOpener, ResourceStats, SourceId,
};
pub use stream::LineStream;
