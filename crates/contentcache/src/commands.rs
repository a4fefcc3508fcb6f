//! Implementation of the individual commands.
use std::time::Duration;

use anyhow::{Context, Result, bail};
use contentcache_service::caching::clear_tmp;
use contentcache_service::config::Config;
use contentcache_service::{ContentCache, FetchOptions};
use reqwest::Url;
use serde_json::Value;

use crate::cli::Command;

/// Runs the given command against the cache described by `config`.
pub async fn run(command: Command, config: Config) -> Result<()> {
    match command {
        Command::Run => serve(&config).await,
        Command::Cleanup { dry_run } => cleanup(&config, dry_run).await,
        Command::Get { key } => {
            let cache = open(&config)?;
            let Some(value) = cache.get::<Value>(&key) else {
                bail!("no cache entry for `{key}`");
            };
            print_json(&value)
        }
        Command::Invalidate { key, prefix } => {
            let cache = open(&config)?;
            match (key, prefix) {
                (_, Some(prefix)) => {
                    let removed = cache.invalidate_prefix(&prefix);
                    println!("removed {removed} entries");
                }
                (Some(key), None) => cache.invalidate(&key),
                (None, None) => bail!("either a key or a prefix is required"),
            }
            Ok(())
        }
        Command::Fetch {
            url,
            key,
            ttl,
            no_cache,
        } => {
            let cache = open(&config)?;
            let key = key.unwrap_or_else(|| url.to_string());
            let ttl = ttl.unwrap_or(cache.default_ttl());
            let value = fetch(&cache, &key, url, ttl, no_cache).await?;
            print_json(&value)
        }
    }
}

fn open(config: &Config) -> Result<ContentCache> {
    ContentCache::from_config(config).context("failed to open the cache")
}

/// Runs the expiry sweeper until ctrl-c is pressed.
async fn serve(config: &Config) -> Result<()> {
    clear_tmp(config).context("failed to clear the tmp directory")?;
    let cache = open(config)?;
    tracing::info!(
        durable = cache.store().has_durable_tier(),
        sweep_interval = ?config.caches.sweep_interval,
        "Content cache running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    tracing::info!("Shutting down");
    cache.shutdown();
    Ok(())
}

async fn cleanup(config: &Config, dry_run: bool) -> Result<()> {
    if config.cache_dir.is_none() {
        bail!("no `cache_dir` configured, there is nothing to clean up");
    }

    if !dry_run {
        clear_tmp(config).context("failed to clear the tmp directory")?;
    }
    let cache = open(config)?;
    cache.shutdown();

    let store = cache.store().clone();
    let stats = tokio::task::spawn_blocking(move || store.sweep_expired_with(dry_run))
        .await
        .context("cleanup panicked")?;

    let verb = if dry_run { "would remove" } else { "removed" };
    println!(
        "{verb} {} entries, {} retained, {} failed",
        stats.removed_durable, stats.retained, stats.failed
    );
    Ok(())
}

/// Fetches a JSON document through the cache.
///
/// Cache hits are not refreshed in the background, as the process exits right away.
async fn fetch(
    cache: &ContentCache,
    key: &str,
    url: Url,
    ttl: Duration,
    no_cache: bool,
) -> Result<Value> {
    let client = reqwest::Client::new();
    let fetcher = move || async move {
        tracing::debug!(%url, "Fetching document");
        client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json::<Value>()
            .await
    };

    let options = FetchOptions {
        use_cache: !no_cache,
        skip_refresh: true,
    };
    cache
        .fetch_with_cache(key, ttl, fetcher, options)
        .await
        .context("failed to fetch document")
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
