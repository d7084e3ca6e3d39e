use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scan::SourceId;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Operation canceled")]
    Canceled,

    #[error("Predicate error: {0}")]
    Predicate(#[from] PredicateError),

    #[error("Source error in {source_id}: {source}")]
    Source {
        source_id: SourceId,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Composite(#[from] CompositeError),
}

impl ScanError {
    pub fn source_io(source_id: SourceId, source: std::io::Error) -> Self {
        Self::Source { source_id, source }
    }

    pub fn predicate(message: impl Into<String>) -> Self {
        Self::Predicate(PredicateError::new(message))
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Canceled => ErrorKind::Canceled,
            Self::Predicate(_) => ErrorKind::Predicate,
            Self::Source { .. } => ErrorKind::Source,
            Self::Composite(_) => ErrorKind::Composite,
        }
    }
}

/// A single predicate invocation failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct PredicateError {
    message: String,
}

impl PredicateError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Every failure collected by a parallel quantifier that found no match.
#[derive(Error, Debug)]
#[error("{} of {evaluated} predicate evaluations failed", failures.len())]
pub struct CompositeError {
    evaluated: usize,
    failures: Vec<(usize, ScanError)>,
}

impl CompositeError {
    pub(crate) fn new(evaluated: usize, mut failures: Vec<(usize, ScanError)>) -> Self {
        failures.sort_by_key(|(index, _)| *index);
        Self {
            evaluated,
            failures,
        }
    }

    /// Total number of evaluations that were started.
    pub fn evaluated(&self) -> usize {
        self.evaluated
    }

    /// Failures keyed by the ordinal of the item that produced them.
    pub fn failures(&self) -> &[(usize, ScanError)] {
        &self.failures
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Coarse classification used in scan results and user-facing output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Canceled,
    Predicate,
    Source,
    Composite,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Canceled => "canceled",
            ErrorKind::Predicate => "predicate",
            ErrorKind::Source => "source",
            ErrorKind::Composite => "composite",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type Result<T> = std::result::Result<T, ScanError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_orders_failures_by_item() {
        let err = CompositeError::new(
            4,
            vec![
                (3, ScanError::predicate("late")),
                (1, ScanError::predicate("early")),
            ],
        );
        let order: Vec<usize> = err.failures().iter().map(|(i, _)| *i).collect();
        assert_eq!(order, vec![1, 3]);
        assert_eq!(err.to_string(), "2 of 4 predicate evaluations failed");
        assert_eq!(ScanError::from(err).kind(), ErrorKind::Composite);
    }

    #[test]
    fn source_errors_carry_their_source_id() {
        let err = ScanError::source_io(
            SourceId::from("logs/a.txt"),
            std::io::Error::other("disk gone"),
        );
        assert_eq!(err.kind(), ErrorKind::Source);
        assert_eq!(err.to_string(), "Source error in logs/a.txt: disk gone");
        assert!(!err.is_canceled());
    }
}
