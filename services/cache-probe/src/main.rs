//! Diagnostic CLI for the block cache stack.
//!
//! Opens the block cache and file manager from the environment (see
//! `FileCacheConfig::from_env`), then reads, prefetches or describes a
//! logical file and prints the outcome as JSON:
//! - `read`: fetch ranges, optionally several times to compare cold and warm
//! - `prefetch`: start background fetches and wait for them to land
//! - `stat`: resolve the file and print its entry

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use remote_file::{EntryInfo, FileCacheConfig, ManagerStats, RemoteFileManager};

#[derive(Parser, Debug)]
#[command(name = "cache-probe")]
#[command(about = "Read logical files through the block cache and report cache behaviour")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Cache table file (overrides BLOCK_CACHE_PATH)
    #[arg(long)]
    cache_path: Option<PathBuf>,

    /// Local data directory (overrides LOCAL_DATA_DIR)
    #[arg(long)]
    local_dir: Option<PathBuf>,

    /// Remote base URL (overrides REMOTE_BASE_URL)
    #[arg(long)]
    remote_url: Option<String>,

    /// Print Prometheus metrics after the command
    #[arg(long)]
    metrics: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read byte ranges of a file
    Read {
        file: String,
        /// Range as OFFSET:LEN, repeatable
        #[arg(short, long = "range", value_parser = parse_range, required = true)]
        ranges: Vec<(u64, u64)>,
        /// Read the ranges this many times
        #[arg(long, default_value = "1")]
        repeat: usize,
    },
    /// Prefetch byte ranges of a file
    Prefetch {
        file: String,
        /// Range as OFFSET:LEN, repeatable
        #[arg(short, long = "range", value_parser = parse_range, required = true)]
        ranges: Vec<(u64, u64)>,
        /// How long to wait for background fetches, in seconds
        #[arg(long, default_value = "10")]
        wait_secs: u64,
    },
    /// Resolve a file and print its entry
    Stat { file: String },
}

fn parse_range(value: &str) -> std::result::Result<(u64, u64), String> {
    let (offset, len) = value
        .split_once(':')
        .ok_or_else(|| format!("expected OFFSET:LEN, got {:?}", value))?;
    let offset = offset
        .parse()
        .map_err(|e| format!("invalid offset {:?}: {}", offset, e))?;
    let len = len
        .parse()
        .map_err(|e| format!("invalid length {:?}: {}", len, e))?;
    Ok((offset, len))
}

#[derive(Debug, Serialize)]
struct RangeReport {
    offset: u64,
    len: u64,
    /// First bytes, hex encoded.
    head: String,
}

#[derive(Debug, Serialize)]
struct PassReport {
    pass: usize,
    elapsed_ms: f64,
    ranges: Vec<RangeReport>,
}

#[derive(Debug, Serialize)]
struct Report {
    file: String,
    passes: Vec<PassReport>,
    entry: Option<EntryInfo>,
    manager: ManagerStats,
}

fn hex_head(bytes: &[u8]) -> String {
    bytes.iter().take(16).map(|b| format!("{:02x}", b)).collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment from .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Initialize tracing
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let metrics = if args.metrics {
        Some(
            PrometheusBuilder::new()
                .install_recorder()
                .context("Failed to install metrics recorder")?,
        )
    } else {
        None
    };

    let mut config = FileCacheConfig::from_env();
    if let Some(path) = args.cache_path {
        config.block_cache_path = Some(path);
    }
    if let Some(dir) = args.local_dir {
        config.local_data_dir = Some(dir);
    }
    if let Some(url) = args.remote_url {
        config.remote_base_url = Some(url);
    }
    config.validate().map_err(|e| anyhow!(e))?;

    let cache = Arc::new(config.open_block_cache()?);
    let manager = RemoteFileManager::new(cache, &config)?;

    info!(command = ?args.command, "Starting cache probe");

    let report = match args.command {
        Command::Read {
            file,
            ranges,
            repeat,
        } => {
            let mut passes = Vec::with_capacity(repeat);
            for pass in 0..repeat.max(1) {
                let start = Instant::now();
                let parts = manager.read(&file, &ranges).await?;
                let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
                passes.push(PassReport {
                    pass,
                    elapsed_ms,
                    ranges: ranges
                        .iter()
                        .zip(&parts)
                        .map(|(&(offset, len), bytes)| RangeReport {
                            offset,
                            len,
                            head: hex_head(bytes),
                        })
                        .collect(),
                });
            }
            build_report(&manager, file, passes).await
        }
        Command::Prefetch {
            file,
            ranges,
            wait_secs,
        } => {
            let start = Instant::now();
            manager.prefetch(&file, &ranges).await?;

            // Prefetch never waits for data; poll the coordinator until the
            // background fetches settle.
            let deadline = start + Duration::from_secs(wait_secs);
            let mut last = None;
            while Instant::now() < deadline {
                let fetched = manager
                    .entry_info(&file)
                    .await
                    .and_then(|i| i.coordinator)
                    .map(|c| c.blocks_fetched + c.failures);
                if fetched.is_some() && fetched == last {
                    break;
                }
                last = fetched;
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            let passes = vec![PassReport {
                pass: 0,
                elapsed_ms: start.elapsed().as_secs_f64() * 1000.0,
                ranges: Vec::new(),
            }];
            build_report(&manager, file, passes).await
        }
        Command::Stat { file } => {
            manager.prefetch(&file, &[]).await?;
            build_report(&manager, file, Vec::new()).await
        }
    };

    println!("{}", serde_json::to_string_pretty(&report)?);

    if let Some(handle) = metrics {
        println!("{}", handle.render());
    }

    manager.flush()?;
    Ok(())
}

async fn build_report(
    manager: &RemoteFileManager,
    file: String,
    passes: Vec<PassReport>,
) -> Report {
    Report {
        entry: manager.entry_info(&file).await,
        manager: manager.stats().await,
        file,
        passes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range() {
        assert_eq!(parse_range("0:4096"), Ok((0, 4096)));
        assert_eq!(parse_range("65536:1"), Ok((65536, 1)));
        assert!(parse_range("12").is_err());
        assert!(parse_range("a:1").is_err());
    }

    #[test]
    fn test_hex_head() {
        assert_eq!(hex_head(&[0x00, 0xab, 0x10]), "00ab10");
        assert_eq!(hex_head(&[0xff; 40]).len(), 32);
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "cache-probe",
            "--remote-url",
            "http://localhost:9000/data",
            "read",
            "gfs/t2m.om",
            "-r",
            "0:100",
            "--range",
            "4096:10",
        ])
        .unwrap();
        match args.command {
            Command::Read { file, ranges, repeat } => {
                assert_eq!(file, "gfs/t2m.om");
                assert_eq!(ranges, vec![(0, 100), (4096, 10)]);
                assert_eq!(repeat, 1);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
