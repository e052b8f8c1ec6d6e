//! CoucheCache CLI
//!
//! Inspect and operate a durable cache database from the command line.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        couchecache CLI                           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │   Commands   │───▶│ CacheService │───▶│  SledStore   │       │
//! │  │ get/set/...  │    │ memory tier  │    │  (on disk)   │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use couchecache::adapters::{HttpFetcher, LoggingEventPublisher, PrometheusExporter, DEFAULT_FETCH_TIMEOUT};
use couchecache::config::StorageBackend;
use couchecache::error::{Error, Result};
use couchecache::{generate_key, CacheConfig, CacheService, FetchRequest, GetOptions, SetOptions};

// =============================================================================
// CLI Arguments
// =============================================================================

/// CoucheCache - layered response cache tooling
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "COUCHECACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Database directory (overrides the configuration file)
    #[arg(long, env = "COUCHECACHE_DB_PATH")]
    db_path: Option<PathBuf>,

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
    /// Print the cached payload for a key
    Get {
        key: String,
        /// Serve a stale value when the entry allows it
        #[arg(long)]
        stale: Option<bool>,
    },

    /// Store a JSON payload under a key
    Set {
        key: String,
        /// JSON document
        value: String,
        /// Time to live in seconds
        #[arg(long)]
        ttl_secs: Option<u64>,
        /// Allow stale-while-revalidate reads
        #[arg(long)]
        swr: bool,
        /// Queue a refresh once the TTL elapses
        #[arg(long)]
        background_refresh: bool,
        /// Store the durable copy uncompressed
        #[arg(long)]
        no_compress: bool,
    },

    /// Remove a key from both tiers
    Delete { key: String },

    /// Remove every entry
    Clear,

    /// Remove every key containing a substring
    Invalidate { pattern: String },

    /// Print cache statistics
    Stats {
        /// Prometheus text format instead of JSON
        #[arg(long)]
        prometheus: bool,
    },

    /// Print persisted analytics snapshots
    History {
        /// How many days back
        #[arg(long, default_value = "7")]
        days: u64,
    },

    /// Run the durable retention and capacity sweep
    Sweep,

    /// Print the canonical key for a path and `name=value` parameters
    Key { path: String, params: Vec<String> },

    /// Fetch resources over HTTP and cache them
    Preload {
        /// Base URL prepended to relative paths
        #[arg(long, env = "COUCHECACHE_BASE_URL")]
        base_url: Option<String>,
        /// Time to live in seconds
        #[arg(long)]
        ttl_secs: Option<u64>,
        /// Request timeout in seconds
        #[arg(long, default_value_t = DEFAULT_FETCH_TIMEOUT.as_secs())]
        timeout_secs: u64,
        /// Paths or URLs
        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// Keep the cache open with background timers until interrupted
    Run {
        /// Seconds between stats log lines
        #[arg(long, default_value = "60")]
        stats_interval_secs: u64,
    },
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let mut config = load_config(&args)?;
    let long_running = matches!(args.command, Command::Run { .. });
    if !long_running {
        config.scheduler.enabled = false;
        config.analytics.persist_snapshots = false;
    }

    let mut builder = CacheService::builder(config).publisher(Arc::new(LoggingEventPublisher::new()));
    if let Command::Preload {
        base_url,
        timeout_secs,
        ..
    } = &args.command
    {
        let mut fetcher = HttpFetcher::new(Duration::from_secs(*timeout_secs))?;
        if let Some(base_url) = base_url {
            fetcher = fetcher.with_base_url(base_url.clone());
        }
        builder = builder.fetcher(Arc::new(fetcher));
    }

    let cache = Arc::new(builder.build()?);
    cache.init().await;

    let result = run_command(&cache, args.command).await;
    cache.destroy().await;
    result
}

async fn run_command(cache: &Arc<CacheService>, command: Command) -> Result<()> {
    match command {
        Command::Get { key, stale } => {
            let options = GetOptions {
                use_stale_while_revalidate: stale,
                ..Default::default()
            };
            match cache.get(&key, options).await {
                Some(payload) => println!("{}", serde_json::to_string_pretty(&payload)?),
                None => {
                    return Err(Error::Internal(format!("No cached value for {}", key)));
                }
            }
        }

        Command::Set {
            key,
            value,
            ttl_secs,
            swr,
            background_refresh,
            no_compress,
        } => {
            let payload: Value = serde_json::from_str(&value)?;
            let options = SetOptions {
                stale_while_revalidate: swr,
                background_refresh,
                compress: !no_compress,
            };
            cache
                .set(&key, payload, ttl_secs.map(Duration::from_secs), options)
                .await;
            info!(key = %key, "Stored");
        }

        Command::Delete { key } => {
            let removed = cache.delete(&key).await;
            println!("{}", if removed { "deleted" } else { "not found" });
        }

        Command::Clear => {
            cache.clear().await;
            println!("cleared");
        }

        Command::Invalidate { pattern } => {
            let removed = cache.invalidate_pattern(&pattern).await;
            println!("{} key(s) removed", removed);
        }

        Command::Stats { prometheus } => {
            let stats = cache.stats();
            if prometheus {
                print!("{}", PrometheusExporter::default().render(&stats)?);
            } else {
                let mut document = serde_json::to_value(&stats)?;
                if let Value::Object(map) = &mut document {
                    map.insert("durable_size".into(), cache.cache_size().await.into());
                }
                println!("{}", serde_json::to_string_pretty(&document)?);
            }
        }

        Command::History { days } => {
            let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
            let since = now.saturating_sub(days * 24 * 60 * 60 * 1000);
            let history = cache.analytics_history(since).await;
            println!("{}", serde_json::to_string_pretty(&history)?);
        }

        Command::Sweep => {
            let report = cache.sweep_durable().await;
            println!(
                "expired: {}, abandoned: {}, trimmed: {}",
                report.expired, report.abandoned, report.trimmed
            );
        }

        Command::Key { path, params } => {
            let pairs = params
                .iter()
                .map(|raw| parse_param(raw))
                .collect::<Result<Vec<_>>>()?;
            println!("{}", generate_key(&path, pairs));
        }

        Command::Preload { urls, ttl_secs, .. } => {
            let requests: Vec<FetchRequest> = urls
                .into_iter()
                .map(|url| {
                    let request = FetchRequest::new(url);
                    match ttl_secs {
                        Some(secs) => request.with_ttl(Duration::from_secs(secs)),
                        None => request,
                    }
                })
                .collect();
            let total = requests.len();
            let stored = cache.preload(requests).await;
            println!("{}/{} resource(s) cached", stored, total);
        }

        Command::Run {
            stats_interval_secs,
        } => {
            info!("Cache running, press Ctrl-C to stop");
            let mut ticker = tokio::time::interval(Duration::from_secs(stats_interval_secs.max(1)));
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Shutdown signal received");
                        break;
                    }
                    _ = ticker.tick() => {
                        let stats = cache.stats();
                        info!(
                            hit_rate = stats.hit_rate,
                            memory = stats.memory_size,
                            refresh_queue = stats.refresh_queue_len,
                            warming_queue = stats.warming_queue_len,
                            "Cache stats"
                        );
                    }
                }
            }
        }
    }

    Ok(())
}

// =============================================================================
// Helpers
// =============================================================================

fn load_config(args: &Args) -> Result<CacheConfig> {
    let config = match &args.config {
        Some(path) => CacheConfig::from_yaml_file(path)?,
        None => CacheConfig::default(),
    };
    let mut config = config.apply_env()?;

    if let Some(path) = &args.db_path {
        config.durable.path = path.clone();
        if config.durable.backend != StorageBackend::Sled {
            warn!("--db-path given, switching durable backend to sled");
            config.durable.backend = StorageBackend::Sled;
        }
    }

    Ok(config)
}

/// `name=value`, where the value is JSON when it parses as JSON and a plain
/// string otherwise
fn parse_param(raw: &str) -> Result<(String, Value)> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| Error::Config(format!("Expected name=value, got {}", raw)))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.to_string(), value))
}

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{},sled=warn,reqwest=warn,hyper=warn",
            level.as_str().to_lowercase()
        ))
    });

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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_param() {
        assert_eq!(parse_param("page=2").unwrap(), ("page".into(), Value::from(2)));
        assert_eq!(
            parse_param("q=rust").unwrap(),
            ("q".into(), Value::String("rust".into()))
        );
        assert!(parse_param("novalue").is_err());
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from(["couchecache", "--db-path", "/tmp/db", "get", "/api/tasks"])
            .unwrap();
        assert_eq!(args.db_path, Some(PathBuf::from("/tmp/db")));
        assert!(matches!(args.command, Command::Get { ref key, stale: None } if key == "/api/tasks"));
    }
}
