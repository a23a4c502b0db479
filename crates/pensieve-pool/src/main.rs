//! Pensieve relay pool CLI.
//!
//! Connects to a set of relays and either watches their health, runs one
//! fan-out query, or looks up a relay's NIP-11 document.
//!
//! # Usage
//!
//! ```bash
//! # Watch relay health until Ctrl+C, exposing Prometheus metrics
//! pensieve-pool --relays wss://relay.damus.io,wss://nos.lol --metrics-port 9091 watch
//!
//! # Latest 20 text notes with per-relay timing
//! pensieve-pool --relays wss://relay.damus.io,wss://nos.lol query --kinds 1 --limit 20
//!
//! # Kind and author breakdown instead of raw events
//! pensieve-pool query --kinds 1,7 --limit 500 --aggregate --tags t
//!
//! # NIP-11 document for one relay
//! pensieve-pool info wss://relay.damus.io
//! ```
//!
//! Pool timeouts and intervals come from `POOL_*` environment variables
//! (see [`PoolConfig::from_env`]), optionally loaded from a `.env` file.

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pensieve_core::metrics::{init_metrics, start_metrics_server};
use pensieve_pool::{AdvancedQuery, HttpInfoFetcher, NostrConnector, PoolConfig, RelayPool};
use tokio::time::{Instant, MissedTickBehavior};
use tracing_subscriber::EnvFilter;

/// Pensieve relay pool CLI.
#[derive(Parser, Debug)]
#[command(name = "pensieve-pool")]
#[command(about = "Concurrent Nostr relay pool: health, fan-out queries, relay info")]
#[command(version)]
struct Args {
    /// Relay URLs (comma-separated)
    #[arg(
        long,
        env = "POOL_RELAYS",
        value_delimiter = ',',
        default_value = "wss://relay.damus.io,wss://nos.lol,wss://relay.primal.net"
    )]
    relays: Vec<String>,

    /// Load environment variables from this file before reading config.
    /// Applied before other arguments, so it also feeds their env fallbacks.
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, env = "POOL_METRICS_PORT", default_value = "0")]
    metrics_port: u16,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Monitor relay health until interrupted
    Watch {
        /// Re-attempt disconnected relays every monitoring interval
        #[arg(long)]
        auto_reconnect: bool,
    },

    /// Run one fan-out query and print the result as JSON
    Query {
        /// Event kinds (comma-separated)
        #[arg(long, value_delimiter = ',')]
        kinds: Vec<u16>,

        /// Author pubkeys, hex (comma-separated)
        #[arg(long, value_delimiter = ',')]
        authors: Vec<String>,

        /// Only events created at or after this unix timestamp
        #[arg(long)]
        since: Option<u64>,

        /// Only events created at or before this unix timestamp
        #[arg(long)]
        until: Option<u64>,

        /// Maximum number of merged events
        #[arg(long, default_value = "100")]
        limit: usize,

        /// Print aggregate statistics instead of events
        #[arg(long)]
        aggregate: bool,

        /// Tag names to count when aggregating (comma-separated)
        #[arg(long, value_delimiter = ',', default_value = "t")]
        tags: Vec<String>,
    },

    /// Look up a relay's NIP-11 information document
    Info {
        /// Relay URL (ws:// or wss://)
        url: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls crypto provider (required when both ring and aws-lc-rs are present)
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse()?)
                .add_directive("pensieve_pool=debug".parse()?),
        )
        .init();

    if let Some(path) = env_file_arg(std::env::args_os()) {
        dotenvy::from_path(&path)
            .with_context(|| format!("Failed to load env file {}", path.display()))?;
    }
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut config = PoolConfig::from_env().context("Invalid pool configuration")?;
    if let Command::Watch { auto_reconnect } = args.command {
        config.auto_reconnect |= auto_reconnect;
    }

    if args.metrics_port > 0 {
        let metrics_handle = init_metrics();
        start_metrics_server(args.metrics_port, metrics_handle)
            .await
            .context("Failed to start metrics server")?;
    }

    let fetcher =
        HttpInfoFetcher::new(config.connect_timeout).context("Failed to build HTTP client")?;
    let pool = RelayPool::new(config, Arc::new(NostrConnector::new()), Arc::new(fetcher));

    let result = match args.command {
        Command::Watch { .. } => watch(&pool, &args.relays).await,
        Command::Query {
            kinds,
            authors,
            since,
            until,
            limit,
            aggregate,
            tags,
        } => {
            let query = AdvancedQuery {
                kinds,
                authors,
                since,
                until,
                limit: Some(limit),
                ..Default::default()
            };
            run_query(&pool, &args.relays, &query, aggregate.then_some(tags.as_slice())).await
        }
        Command::Info { url } => {
            let document = pool
                .fetch_relay_info_cached(&url, false)
                .await
                .with_context(|| format!("Failed to fetch relay info for {url}"))?;
            println!("{}", serde_json::to_string_pretty(&document)?);
            Ok(())
        }
    };

    pool.shutdown().await;
    result
}

/// The `--env-file` value, found ahead of full argument parsing.
fn env_file_arg(args: impl IntoIterator<Item = OsString>) -> Option<PathBuf> {
    let mut args = args.into_iter().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--" {
            break;
        }
        if arg == "--env-file" {
            return args.next().map(PathBuf::from);
        }
        if let Some(path) = arg.to_str().and_then(|a| a.strip_prefix("--env-file=")) {
            return Some(PathBuf::from(path));
        }
    }
    None
}

/// Add every relay, logging each status change.
fn add_relays(pool: &RelayPool, relays: &[String]) -> Result<()> {
    pool.set_status_callback(|url, connected, error| {
        if connected {
            tracing::info!(relay = %url, "Connected");
        } else if error.is_empty() {
            tracing::info!(relay = %url, "Disconnected");
        } else {
            tracing::warn!(relay = %url, "Disconnected: {}", error);
        }
    });

    for url in relays {
        pool.add(url)
            .with_context(|| format!("Failed to add relay {url}"))?;
    }
    tracing::info!("Added {} relays", pool.count());
    Ok(())
}

/// Wait until every tracked relay has settled or the connect timeout passes.
async fn wait_for_connections(pool: &RelayPool) {
    let deadline = Instant::now() + pool.config().connect_timeout;
    while Instant::now() < deadline {
        if pool.list().iter().all(|r| !r.connecting) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    tracing::info!(
        "{}/{} relays connected",
        pool.get_connected().len(),
        pool.count()
    );
}

async fn watch(pool: &RelayPool, relays: &[String]) -> Result<()> {
    add_relays(pool, relays)?;
    let monitor = pool.start_monitoring();

    let mut report = tokio::time::interval(pool.config().health_check_interval);
    report.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            r = tokio::signal::ctrl_c() => {
                r.context("Failed to listen for Ctrl+C")?;
                tracing::info!("Shutdown signal received, stopping gracefully...");
                break;
            }
            _ = report.tick() => {
                let data = pool.monitoring_data();
                tracing::info!(
                    "{}/{} relays connected, {} events, {:.2} events/s",
                    data.connected_relays,
                    data.total_relays,
                    data.total_events,
                    data.events_per_second
                );
                for relay in &data.relays {
                    tracing::info!(
                        relay = %relay.url,
                        "score {:.1}, latency {:.0}ms, errors {}/{}",
                        relay.health.score,
                        relay.latency_ms,
                        relay.error_count,
                        relay.check_count
                    );
                }
            }
        }
    }

    pool.shutdown().await;
    monitor.await.context("Monitoring task failed")?;
    Ok(())
}

async fn run_query(
    pool: &RelayPool,
    relays: &[String],
    query: &AdvancedQuery,
    tracked_tags: Option<&[String]>,
) -> Result<()> {
    add_relays(pool, relays)?;
    wait_for_connections(pool).await;

    let output = match tracked_tags {
        Some(tags) => {
            let result = pool
                .aggregate_events(query, tags)
                .await
                .context("Aggregation query failed")?;
            serde_json::to_string_pretty(&result)?
        }
        None => {
            let result = pool
                .query_events_advanced_timed(query)
                .await
                .context("Query failed")?;
            for timing in &result.relays {
                tracing::info!(
                    relay = %timing.url,
                    "{} events in {}ms{}",
                    timing.event_count,
                    timing.latency_ms,
                    if timing.timed_out { " (timed out)" } else { "" }
                );
            }
            serde_json::to_string_pretty(&result)?
        }
    };

    println!("{output}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<OsString> {
        args.iter().map(OsString::from).collect()
    }

    #[test]
    fn test_env_file_arg_forms() {
        assert_eq!(
            env_file_arg(argv(&["pensieve-pool", "--env-file", "pool.env", "watch"])),
            Some(PathBuf::from("pool.env"))
        );
        assert_eq!(
            env_file_arg(argv(&["pensieve-pool", "--env-file=pool.env", "watch"])),
            Some(PathBuf::from("pool.env"))
        );
        assert_eq!(env_file_arg(argv(&["pensieve-pool", "watch"])), None);
        assert_eq!(env_file_arg(argv(&["pensieve-pool", "--env-file"])), None);
        assert_eq!(
            env_file_arg(argv(&["pensieve-pool", "info", "--", "--env-file", "x"])),
            None
        );
    }

    #[test]
    fn test_env_file_feeds_relay_fallback() {
        let path = std::env::temp_dir().join(format!("pensieve-pool-{}.env", std::process::id()));
        std::fs::write(&path, "POOL_RELAYS=wss://from-file.example\n").unwrap();
        let path_arg = path.to_string_lossy().into_owned();
        let args = argv(&["pensieve-pool", "--env-file", &path_arg, "watch"]);

        let found = env_file_arg(args.clone()).unwrap();
        dotenvy::from_path(&found).unwrap();
        let parsed = Args::try_parse_from(args).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(parsed.relays, vec!["wss://from-file.example".to_string()]);
        assert_eq!(parsed.env_file, Some(path));
    }
}
