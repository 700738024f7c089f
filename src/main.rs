//! tiercache admin CLI
//!
//! Inspects and maintains a cache directory, or runs the expiry reaper in
//! the foreground.
//!
//! ```text
//! tiercache --cache-dir ./cache stats --prometheus
//! tiercache put price_data -p symbol=AAA -p days=30 --json '{"close": 10.5}' --tag prices
//! tiercache get price_data -p symbol=AAA -p days=30
//! tiercache clear --tier disk --tag prices
//! tiercache run
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tiercache::cache::entry::MAX_TTL_HOURS;
use tiercache::cache::{CacheManager, CacheValue, ExpiryReaper, Params, TagSet, TierName};
use tiercache::config::CacheConfig;

// =============================================================================
// CLI Arguments
// =============================================================================

/// Four-tier artifact cache administration
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "TIERCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Cache root directory (overrides the config file)
    #[arg(long, env = "TIERCACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Memory tier capacity in bytes (overrides the config file)
    #[arg(long, env = "TIERCACHE_MAX_MEMORY_BYTES")]
    max_memory_bytes: Option<u64>,

    /// Disable payload compression (overrides the config file)
    #[arg(long, env = "TIERCACHE_NO_COMPRESSION")]
    no_compression: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print hit/miss counters and tier sizes
    Stats {
        /// Prometheus text format instead of JSON
        #[arg(long)]
        prometheus: bool,
    },
    /// Sweep expired entries and compact the structured store
    Cleanup,
    /// Remove entries from one tier or all of them
    Clear {
        /// Tier to clear (memory, disk, compressed, structured)
        #[arg(long)]
        tier: Option<TierName>,
        /// Only remove entries carrying this tag (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// Look up a value
    Get {
        namespace: String,
        /// Parameter as key=value; JSON values are parsed (repeatable)
        #[arg(short = 'p', long = "param")]
        params: Vec<String>,
    },
    /// Store a value
    Put {
        namespace: String,
        /// Parameter as key=value; JSON values are parsed (repeatable)
        #[arg(short = 'p', long = "param")]
        params: Vec<String>,
        /// JSON value to store
        #[arg(long, conflicts_with = "file", required_unless_present = "file")]
        json: Option<String>,
        /// File whose bytes are stored as a blob
        #[arg(long)]
        file: Option<PathBuf>,
        /// Time to live in hours (defaults to the configured TTL)
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..=MAX_TTL_HOURS))]
        ttl_hours: Option<u64>,
        /// Tag for bulk invalidation (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// Run the expiry reaper until interrupted
    Run,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = load_config(&args)?;
    let manager = Arc::new(CacheManager::new(config.clone()).context("failed to open cache")?);

    match args.command {
        Command::Stats { prometheus } => {
            let snapshot = manager.stats().await;
            if prometheus {
                print!("{}", snapshot.render_prometheus()?);
            } else {
                print_json(&serde_json::to_value(&snapshot)?)?;
            }
        }
        Command::Cleanup => {
            let report = manager.cleanup_expired().await;
            print_json(&serde_json::to_value(&report)?)?;
        }
        Command::Clear { tier, tags } => {
            let tags = tag_set(tags);
            let removed = manager.clear(tier, tags.as_ref()).await?;
            print_json(&json!({ "removed": removed }))?;
        }
        Command::Get { namespace, params } => {
            let params = parse_params(&params)?;
            let key = manager.key_for(&namespace, &params);
            let output = match manager.get(&namespace, &params).await {
                Some(value) => json!({ "key": key.as_str(), "hit": true, "value": render_value(&value)? }),
                None => json!({ "key": key.as_str(), "hit": false }),
            };
            print_json(&output)?;
        }
        Command::Put {
            namespace,
            params,
            json: json_value,
            file,
            ttl_hours,
            tags,
        } => {
            let params = parse_params(&params)?;
            let value = match (json_value, file) {
                (Some(text), _) => {
                    let parsed: Value = serde_json::from_str(&text).context("--json is not valid JSON")?;
                    CacheValue::from(parsed)
                }
                (None, Some(path)) => CacheValue::from(
                    std::fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?,
                ),
                (None, None) => bail!("one of --json or --file is required"),
            };
            let ttl = ttl_hours
                .map(|h| i64::try_from(h).map(chrono::Duration::hours))
                .transpose()
                .context("--ttl-hours out of range")?;

            manager.put(&namespace, &params, value, ttl, tag_set(tags)).await?;
            let key = manager.key_for(&namespace, &params);
            print_json(&json!({ "key": key.as_str(), "stored": true }))?;
        }
        Command::Run => {
            let interval = config.reaper_interval();
            info!(?interval, root = %config.cache_root_dir.display(), "Running expiry reaper");
            let handle = ExpiryReaper::spawn(Arc::clone(&manager), interval);

            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for Ctrl-C")?;
            info!("Interrupted, stopping reaper");
            handle.shutdown().await;
        }
    }

    Ok(())
}

// =============================================================================
// Helpers
// =============================================================================

fn load_config(args: &Args) -> anyhow::Result<CacheConfig> {
    let mut config = match &args.config {
        Some(path) => CacheConfig::from_yaml_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => CacheConfig::default(),
    };
    if let Some(dir) = &args.cache_dir {
        config.cache_root_dir = dir.clone();
    }
    if let Some(bytes) = args.max_memory_bytes {
        config.max_memory_bytes = bytes;
    }
    if args.no_compression {
        config.compression_enabled = false;
    }
    config.validate()?;
    Ok(config)
}

/// Parse `key=value` pairs; values that parse as JSON keep their type
fn parse_params(pairs: &[String]) -> anyhow::Result<Params> {
    let mut params = Params::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("parameter {:?} is not key=value", pair))?;
        let value = serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        params.insert(key, &value);
    }
    Ok(params)
}

fn tag_set(tags: Vec<String>) -> Option<TagSet> {
    if tags.is_empty() {
        None
    } else {
        Some(tags.into_iter().collect())
    }
}

fn render_value(value: &CacheValue) -> anyhow::Result<Value> {
    Ok(match value {
        CacheValue::Structured(structured) => serde_json::to_value(structured)?,
        CacheValue::Blob(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => json!({ "blob": text }),
            Err(_) => json!({ "blob_bytes": bytes.len() }),
        },
    })
}

fn print_json(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // stdout carries command output
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
