//! Line records and the collaborators that turn source identifiers into
//! readable line sequences.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};

/// Identifier of one scanned source (a file path for [`FsOpener`]).
#[derive(Clone, Debug, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SourceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&Path> for SourceId {
    fn from(value: &Path) -> Self {
        Self(value.display().to_string())
    }
}

impl AsRef<str> for SourceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// One line of a source, tagged with its 1-based position.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRecord {
    pub source_id: SourceId,
    pub line_number: u64,
    pub text: String,
}

/// An open, readable line sequence. Owned exclusively by one
/// [`LineStream`](super::LineStream).
#[async_trait]
pub trait LineResource: Send {
    /// Next raw line without its terminator, or `None` at end of input.
    async fn next_line(&mut self) -> std::io::Result<Option<String>>;

    /// Releases the underlying resource. Called exactly once by the owning
    /// stream.
    fn close(&mut self);
}

/// Resolves a source identifier into an open [`LineResource`].
#[async_trait]
pub trait ResourceOpener: Send + Sync {
    async fn open(&self, source_id: &SourceId) -> std::io::Result<Box<dyn LineResource>>;
}

#[async_trait]
impl<O: ResourceOpener + ?Sized> ResourceOpener for Arc<O> {
    async fn open(&self, source_id: &SourceId) -> std::io::Result<Box<dyn LineResource>> {
        (**self).open(source_id).await
    }
}

/// Opens source identifiers as files, optionally relative to a root directory.
#[derive(Clone, Debug, Default)]
pub struct FsOpener {
    root: Option<PathBuf>,
}

impl FsOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    pub fn resolve(&self, source_id: &SourceId) -> PathBuf {
        let path = Path::new(source_id.as_str());
        match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }
}

#[async_trait]
impl ResourceOpener for FsOpener {
    async fn open(&self, source_id: &SourceId) -> std::io::Result<Box<dyn LineResource>> {
        let file = File::open(self.resolve(source_id)).await?;
        Ok(Box::new(FileLines {
            lines: Some(BufReader::new(file).lines()),
        }))
    }
}

struct FileLines {
    lines: Option<Lines<BufReader<File>>>,
}

#[async_trait]
impl LineResource for FileLines {
    async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        let Some(lines) = self.lines.as_mut() else {
            return Ok(None);
        };
        let line = lines.next_line().await?;
        // `lines()` only strips `\n`; accept CRLF input as well.
        Ok(line.map(|mut text| {
            if text.ends_with('\r') {
                text.pop();
            }
            text
        }))
    }

    fn close(&mut self) {
        self.lines = None;
    }
}

/// Read and release counters for one in-memory source.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResourceStats {
    pub opens: u64,
    pub reads: u64,
    pub closes: u64,
}

#[derive(Debug, Default)]
struct Counters {
    opens: AtomicU64,
    reads: AtomicU64,
    closes: AtomicU64,
}

#[derive(Debug)]
struct MemorySource {
    lines: Arc<[String]>,
    fail_at: Option<u64>,
    counters: Arc<Counters>,
}

/// In-memory opener that records how each source was read and released.
///
/// `reads` counts every line handed out, so tests can assert that a scan
/// never requested lines past the point where it should have stopped.
#[derive(Debug, Default)]
pub struct MemoryOpener {
    sources: HashMap<SourceId, MemorySource>,
}

impl MemoryOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source<I, S>(mut self, source_id: impl Into<SourceId>, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.insert(source_id, lines, None);
        self
    }

    /// Adds a source whose read of line `fail_at` (1-based) fails with an
    /// I/O error.
    pub fn with_failing_source<I, S>(
        mut self,
        source_id: impl Into<SourceId>,
        lines: I,
        fail_at: u64,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.insert(source_id, lines, Some(fail_at));
        self
    }

    fn insert<I, S>(&mut self, source_id: impl Into<SourceId>, lines: I, fail_at: Option<u64>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let lines: Vec<String> = lines.into_iter().map(Into::into).collect();
        self.sources.insert(
            source_id.into(),
            MemorySource {
                lines: lines.into(),
                fail_at,
                counters: Arc::new(Counters::default()),
            },
        );
    }

    pub fn stats(&self, source_id: &SourceId) -> Option<ResourceStats> {
        self.sources.get(source_id).map(|source| ResourceStats {
            opens: source.counters.opens.load(Ordering::SeqCst),
            reads: source.counters.reads.load(Ordering::SeqCst),
            closes: source.counters.closes.load(Ordering::SeqCst),
        })
    }
}

#[async_trait]
impl ResourceOpener for MemoryOpener {
    async fn open(&self, source_id: &SourceId) -> std::io::Result<Box<dyn LineResource>> {
        let source = self.sources.get(source_id).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("unknown source {source_id}"),
            )
        })?;
        source.counters.opens.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(MemoryLines {
            lines: Arc::clone(&source.lines),
            position: 0,
            fail_at: source.fail_at,
            counters: Arc::clone(&source.counters),
        }))
    }
}

struct MemoryLines {
    lines: Arc<[String]>,
    position: usize,
    fail_at: Option<u64>,
    counters: Arc<Counters>,
}

#[async_trait]
impl LineResource for MemoryLines {
    async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        // Yield so concurrent scans interleave the way real I/O would.
        tokio::task::yield_now().await;

        let next_number = self.position as u64 + 1;
        if self.fail_at == Some(next_number) {
            return Err(std::io::Error::other(format!(
                "simulated read failure at line {next_number}"
            )));
        }

        let Some(line) = self.lines.get(self.position) else {
            return Ok(None);
        };
        self.position += 1;
        self.counters.reads.fetch_add(1, Ordering::SeqCst);
        Ok(Some(line.clone()))
    }

    fn close(&mut self) {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
    }
}
