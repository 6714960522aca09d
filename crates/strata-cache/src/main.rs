//! Strata Cache - operator tool for the tiered result cache

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod config;

use config::Config;
use strata_core::{Category, TieredCache, build_key, spawn_maintenance_task};

/// Strata Cache - inspect and maintain a tiered result cache
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/default.toml")]
    config: String,

    /// Cache root directory
    #[arg(long, env = "STRATA_CACHE_ROOT")]
    root: Option<PathBuf>,

    /// Log level or filter directive
    #[arg(long, env = "STRATA_CACHE_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print cache statistics as JSON
    Stats,
    /// Remove expired entries and re-enforce size ceilings
    Sweep,
    /// Print the cached value for a category and parameter set
    Get {
        category: String,
        /// Parameters as a JSON object
        params: String,
    },
    /// Store a value for a category and parameter set
    Put {
        category: String,
        /// Parameters as a JSON object
        params: String,
        /// Literal value to store
        #[arg(long, conflicts_with = "file")]
        value: Option<String>,
        /// Read the value from a file
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Drop the entry for a category and parameter set
    Invalidate {
        category: String,
        /// Parameters as a JSON object
        params: String,
    },
    /// Print the key a category and parameter set map to
    Key {
        category: String,
        /// Parameters as a JSON object
        params: String,
    },
    /// Remove every entry from both tiers
    Clear,
    /// Keep the cache open with periodic maintenance until interrupted
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(&args.config)?;
    if let Some(root) = args.root {
        config.cache.root_path = root;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    init_logging(&config.logging.level, &config.logging.format);

    // Key derivation needs no cache on disk
    if let Command::Key { category, params } = &args.command {
        let key = build_key(&Category::from(category.as_str()), &parse_params(params)?)?;
        println!("{}", key);
        return Ok(());
    }

    let cache = TieredCache::open(config.cache.clone())
        .await
        .with_context(|| format!("Failed to open cache at {:?}", config.cache.root_path))?;

    match args.command {
        Command::Stats => {
            println!("{}", serde_json::to_string_pretty(&cache.stats())?);
        }
        Command::Sweep => {
            let (expired, freed) = cache.run_maintenance().await;
            println!("{} expired entries removed, {} bytes freed", expired, freed);
        }
        Command::Get { category, params } => {
            let category = Category::from(category.as_str());
            let params = parse_params(&params)?;
            match cache.get(&category, &params).await? {
                Some(value) => {
                    let mut stdout = std::io::stdout().lock();
                    stdout.write_all(&value)?;
                    stdout.flush()?;
                }
                None => {
                    cache.close().await;
                    anyhow::bail!("No live entry for {} {}", category, params);
                }
            }
        }
        Command::Put {
            category,
            params,
            value,
            file,
        } => {
            let value = match (value, file) {
                (Some(value), None) => Bytes::from(value),
                (None, Some(path)) => Bytes::from(
                    tokio::fs::read(&path)
                        .await
                        .with_context(|| format!("Failed to read value from {:?}", path))?,
                ),
                _ => anyhow::bail!("Exactly one of --value or --file is required"),
            };
            let key = cache
                .put(&Category::from(category.as_str()), &parse_params(&params)?, value)
                .await?;
            println!("{}", key);
        }
        Command::Invalidate { category, params } => {
            let removed = cache
                .invalidate(&Category::from(category.as_str()), &parse_params(&params)?)
                .await?;
            println!("{}", if removed { "invalidated" } else { "not cached" });
        }
        Command::Clear => {
            println!("{} entries removed", cache.clear().await);
        }
        Command::Run => {
            return run_until_shutdown(cache).await;
        }
        Command::Key { .. } => {}
    }

    cache.close().await;
    Ok(())
}

/// Hold the cache open, sweeping on the configured interval
async fn run_until_shutdown(cache: TieredCache) -> Result<()> {
    let interval_secs = cache.config().maintenance_interval_secs;
    let cache = Arc::new(cache);

    let task = if interval_secs > 0 {
        Some(spawn_maintenance_task(cache.clone(), interval_secs))
    } else {
        info!("Background maintenance disabled");
        None
    };

    shutdown_signal().await?;

    if let Some(task) = task {
        task.abort();
        let _ = task.await;
    }

    match Arc::try_unwrap(cache) {
        Ok(cache) => cache.close().await,
        Err(_) => warn!("Cache still shared at shutdown, skipping close"),
    }
    Ok(())
}

fn parse_params(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("Parameters are not valid JSON: {}", raw))
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // Logs go to stderr so values printed by `get` stay clean
    if format == "json" {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .init();
    }
}

/// Wait for shutdown signal
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to install CTRL+C handler")?;
    info!("Shutdown signal received");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "strata-cache",
            "-c",
            "custom.toml",
            "put",
            "enrichment",
            r#"{"siren": "552037806"}"#,
            "--value",
            "company",
        ])
        .unwrap();

        assert_eq!(args.config, "custom.toml");
        match args.command {
            Command::Put {
                category,
                value,
                file,
                ..
            } => {
                assert_eq!(category, "enrichment");
                assert_eq!(value.as_deref(), Some("company"));
                assert!(file.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_value_and_file_conflict() {
        let result = Args::try_parse_from([
            "strata-cache",
            "put",
            "template",
            "{}",
            "--value",
            "x",
            "--file",
            "x.bin",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_params() {
        assert!(parse_params(r#"{"query": "recel"}"#).unwrap().is_object());
        assert!(parse_params("{not json").is_err());
    }
}
