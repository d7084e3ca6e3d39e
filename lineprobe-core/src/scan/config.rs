use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

/// Knobs for a multi-source scan.
///
/// All fields carry defaults so configuration files only need to name what
/// they change.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Upper bound on sources scanned at the same time. `0` scans every
    /// requested source concurrently.
    pub max_concurrent_sources: usize,
    /// Abort the shared token as soon as any source ends in error, which
    /// stops every sibling scan at its next suspension point. Off by default:
    /// a failing source only affects its own result.
    pub abort_siblings_on_error: bool,
}

impl ScanConfig {
    /// Effective concurrency for `source_count` sources.
    pub fn concurrency_for(&self, source_count: usize) -> NonZeroUsize {
        let limit = match self.max_concurrent_sources {
            0 => source_count,
            cap => cap.min(source_count),
        };
        NonZeroUsize::new(limit).unwrap_or(NonZeroUsize::MIN)
    }
}
