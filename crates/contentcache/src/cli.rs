//! Exposes the command line application.
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use contentcache_service::config::Config;
use contentcache_service::metrics;
use reqwest::Url;

use crate::commands;
use crate::logging;

/// Contentcache commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the expiry sweeper until interrupted.
    Run,

    /// Remove expired and corrupt entries from the cache directory.
    Cleanup {
        /// Only report what would be removed.
        #[arg(long)]
        dry_run: bool,
    },

    /// Print the cached payload of a key.
    Get {
        /// The cache key.
        key: String,
    },

    /// Remove entries from the cache.
    Invalidate {
        /// The cache key to remove.
        #[arg(required_unless_present = "prefix", conflicts_with = "prefix")]
        key: Option<String>,

        /// Remove every key starting with this prefix instead.
        #[arg(long)]
        prefix: Option<String>,
    },

    /// Fetch a JSON document through the cache and print it.
    Fetch {
        /// The URL to fetch.
        url: Url,

        /// The cache key to use, defaults to the URL.
        #[arg(long)]
        key: Option<String>,

        /// How long to cache the document, defaults to the configured `default_ttl`.
        #[arg(long, value_parser = humantime::parse_duration)]
        ttl: Option<Duration>,

        /// Fetch the document even if it is cached.
        #[arg(long)]
        no_cache: bool,
    },
}

/// Command line interface parser.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: option_env!("CONTENTCACHE_RELEASE")
            .map(|release| format!("contentcache@{release}").into())
            .or_else(|| sentry::release_name!()),
        ..Default::default()
    });

    // SAFETY: We are still single-threaded at this point, the runtime is created below.
    unsafe { logging::init_logging(&config) }.context("failed to initialize logging")?;

    if let Some(ref statsd) = config.metrics.statsd {
        metrics::configure_statsd(
            &config.metrics.prefix,
            statsd.as_str(),
            config.metrics.custom_tags.clone(),
        )
        .context("failed to configure statsd")?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("contentcache")
        .enable_all()
        .build()?;

    runtime.block_on(commands::run(cli.command, config))
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_fetch() {
        let cli = Cli::parse_from([
            "contentcache",
            "-c",
            "config.yml",
            "fetch",
            "https://example.com/api/content/1",
            "--ttl",
            "90s",
            "--no-cache",
        ]);
        assert_eq!(cli.config(), Some(Path::new("config.yml")));

        let Command::Fetch {
            url,
            key,
            ttl,
            no_cache,
        } = cli.command
        else {
            panic!("expected fetch command");
        };
        assert_eq!(url.as_str(), "https://example.com/api/content/1");
        assert_eq!(key, None);
        assert_eq!(ttl, Some(Duration::from_secs(90)));
        assert!(no_cache);
    }

    #[test]
    fn test_parse_invalidate() {
        let cli = Cli::parse_from(["contentcache", "invalidate", "--prefix", "list_content_"]);
        assert!(matches!(
            cli.command,
            Command::Invalidate { key: None, prefix: Some(ref p) } if p == "list_content_"
        ));

        assert!(Cli::try_parse_from(["contentcache", "invalidate"]).is_err());
        assert!(
            Cli::try_parse_from(["contentcache", "invalidate", "k", "--prefix", "p"]).is_err()
        );
    }
}
