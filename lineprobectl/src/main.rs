use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use lineprobe_core::CancellationToken;
use lineprobe_core::predicate::EmailPattern;
use lineprobe_core::scan::{FsOpener, ScanOrchestrator, ScanReport};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::ProbeConfig;

mod config;

/// Exit status when any source errored or was aborted.
const EXIT_SOURCE_FAILURE: u8 = 2;

#[derive(Parser, Debug)]
#[command(
    name = "lineprobectl",
    version,
    about = "Scan files concurrently and report the first matching line of each"
)]
struct Cli {
    /// Files to scan
    #[arg(required = true, value_name = "SOURCES")]
    sources: Vec<String>,
    /// Configuration file (TOML or JSON)
    #[arg(long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,
    /// Abort every unfinished scan after this long, e.g. `500ms` or `2s`
    #[arg(long, value_parser = humantime::parse_duration)]
    deadline: Option<Duration>,
    /// Latency each line test waits before matching
    #[arg(long, value_parser = humantime::parse_duration)]
    delay: Option<Duration>,
    /// Regex to search for instead of the built-in email pattern
    #[arg(long)]
    pattern: Option<String>,
    /// Abort sibling scans as soon as one source fails
    #[arg(long)]
    fail_fast: bool,
    /// Print the full report as JSON
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn apply_overrides(&self, config: &mut ProbeConfig) {
        if let Some(deadline) = self.deadline {
            config.deadline_ms = Some(duration_ms(deadline));
        }
        if let Some(delay) = self.delay {
            config.predicate_delay_ms = duration_ms(delay);
        }
        if let Some(pattern) = &self.pattern {
            config.pattern = Some(pattern.clone());
        }
        if self.fail_fast {
            config.scan.abort_siblings_on_error = true;
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,scan::read=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let (mut config, source) = ProbeConfig::load(cli.config.as_deref())?;
    info!(?source, "probe configuration loaded");
    cli.apply_overrides(&mut config);

    let pattern = match config.pattern.as_deref() {
        Some(raw) => EmailPattern::with_pattern(raw)
            .with_context(|| format!("invalid --pattern regex {raw:?}"))?,
        None => EmailPattern::new(),
    };
    let predicate = Arc::new(pattern.into_predicate(config.predicate_delay()));
    let orchestrator = ScanOrchestrator::new(Arc::new(FsOpener::new()), predicate)
        .with_config(config.scan.clone());

    let token = CancellationToken::new();
    let deadline = config
        .deadline()
        .map(|after| spawn_deadline(token.clone(), after));

    let report = orchestrator.scan_sources(cli.sources.clone(), &token).await;

    if let Some(handle) = deadline {
        handle.abort();
    }

    print_report(&report, cli.json)?;

    if report.all_succeeded() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(EXIT_SOURCE_FAILURE))
    }
}

fn spawn_deadline(token: CancellationToken, after: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        if !token.is_aborted() {
            warn!(deadline = %humantime::format_duration(after), "deadline reached, aborting scan");
            token.abort();
        }
    })
}

fn print_report(report: &ScanReport, json: bool) -> anyhow::Result<()> {
    if json {
        let rendered =
            serde_json::to_string_pretty(report).context("failed to serialize scan report")?;
        println!("{rendered}");
        return Ok(());
    }

    for result in report.results.values() {
        println!("{}: {}", result.source_id, result.outcome());
    }
    Ok(())
}
