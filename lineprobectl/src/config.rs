use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use lineprobe_core::scan::ScanConfig;
use serde::{Deserialize, Serialize};

/// Where the active configuration came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConfigSource {
    #[default]
    Default,
    Cli(PathBuf),
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

/// Settings for one probe run. Every field has a default, and command-line
/// flags override whatever a file sets.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProbeConfig {
    /// Source concurrency and failure propagation.
    pub scan: ScanConfig,
    /// Simulated latency (ms) each line test waits before matching.
    pub predicate_delay_ms: u64,
    /// Abort every unfinished source after this many milliseconds.
    pub deadline_ms: Option<u64>,
    /// Regex used instead of the built-in email pattern.
    pub pattern: Option<String>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            scan: ScanConfig::default(),
            predicate_delay_ms: 400,
            deadline_ms: None,
            pattern: None,
        }
    }
}

/// On-disk encodings a probe config may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Json,
}

impl ConfigFormat {
    /// `.json` files are JSON; everything else is read as TOML.
    pub fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => ConfigFormat::Json,
            _ => ConfigFormat::Toml,
        }
    }

    pub fn parse(self, contents: &str) -> anyhow::Result<ProbeConfig> {
        let parsed = match self {
            ConfigFormat::Toml => toml::from_str(contents).map_err(anyhow::Error::from),
            ConfigFormat::Json => serde_json::from_str(contents).map_err(anyhow::Error::from),
        };
        parsed.with_context(|| format!("invalid {self:?} config"))
    }
}

const PATH_VAR: &str = "LINEPROBE_CONFIG_PATH";
const INLINE_VAR: &str = "LINEPROBE_CONFIG_JSON";
const DEFAULT_FILES: [&str; 4] = [
    "lineprobe.toml",
    "lineprobe.json",
    "config/lineprobe.toml",
    "config/lineprobe.json",
];

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

impl ProbeConfig {
    /// Resolves the configuration in precedence order: `explicit`, the path
    /// in `LINEPROBE_CONFIG_PATH`, inline JSON in `LINEPROBE_CONFIG_JSON`,
    /// the first default file that exists, then built-in defaults.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<(Self, ConfigSource)> {
        if let Some(path) = explicit {
            return Ok((Self::read(path)?, ConfigSource::Cli(path.to_path_buf())));
        }
        if let Some(path) = non_empty_var(PATH_VAR).map(PathBuf::from) {
            return Ok((Self::read(&path)?, ConfigSource::EnvPath(path)));
        }
        if let Some(raw) = non_empty_var(INLINE_VAR) {
            let config = ConfigFormat::Json
                .parse(&raw)
                .with_context(|| format!("failed to parse {INLINE_VAR}"))?;
            return Ok((config, ConfigSource::EnvInline));
        }

        let default_file = DEFAULT_FILES.iter().map(Path::new).find(|path| path.is_file());
        match default_file {
            Some(path) => Ok((Self::read(path)?, ConfigSource::File(path.to_path_buf()))),
            None => Ok((Self::default(), ConfigSource::Default)),
        }
    }

    /// Reads one config file, choosing the format from its extension.
    pub fn read(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read probe config from {}", path.display()))?;
        ConfigFormat::for_path(path)
            .parse(&contents)
            .with_context(|| format!("in {}", path.display()))
    }

    pub fn predicate_delay(&self) -> Duration {
        Duration::from_millis(self.predicate_delay_ms)
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }
}
