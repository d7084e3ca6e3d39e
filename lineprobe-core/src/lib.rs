//! # Lineprobe Core
//!
//! Cancellable building blocks for probing many line-oriented sources at once.
//!
//! ## Overview
//!
//! - **Cancellation**: [`CancellationToken`], a shared one-shot abort flag with
//!   ordered listeners
//! - **Predicates**: the [`predicate::Predicate`] trait, plus an adapter that
//!   normalizes callback-style tests into it
//! - **Quantifiers**: [`quantifier::sequential_some`] and
//!   [`quantifier::parallel_some`], existential checks over a collection
//! - **Scanning**: [`scan::LineStream`], the ordered [`scan::Channel`] fan-out
//!   and the [`scan::ScanOrchestrator`] that runs one scan per source
//!
//! ## Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use lineprobe_core::CancellationToken;
//! use lineprobe_core::predicate::EmailPattern;
//! use lineprobe_core::scan::{FsOpener, ScanOrchestrator};
//!
//! # async fn demo() {
//! let predicate = Arc::new(EmailPattern::new().into_predicate(Duration::from_millis(400)));
//! let orchestrator = ScanOrchestrator::new(Arc::new(FsOpener::new()), predicate);
//!
//! let token = CancellationToken::new();
//! let report = orchestrator.scan_sources(["a.txt", "b.txt"], &token).await;
//! for result in report.results.values() {
//!     println!("{}: {}", result.source_id, result.outcome());
//! }
//! # }
//! ```

pub mod cancel;
pub mod error;
pub mod predicate;
pub mod quantifier;
pub mod scan;

pub use cancel::{CancellationToken, ListenerId};
pub use error::{CompositeError, ErrorKind, PredicateError, Result, ScanError};
pub use quantifier::{ParallelMode, Strategy, parallel_some, sequential_some};
