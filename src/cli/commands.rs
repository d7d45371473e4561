//! CLI command definitions for metaraid.
//!
//! `scrape` runs the crawl until interrupted or until every credential is
//! cold, `export` dumps the collected tracks to Parquet, `status` reports
//! the frontier, `config` prints the defaults.

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use crate::catalog::SpotifyClient;
use crate::config::{Config, DEFAULT_CONFIG_PATH};
use crate::export::export_tracks;
use crate::scheduler::{FrontierKeys, FrontierStore, RedisFrontier, WorkerPool};
use crate::storage::{connect_redis, RedisRecordReader, RedisRecordSink};

/// Default output file for `export`.
const DEFAULT_EXPORT_PATH: &str = "./tracks.parquet";

/// Records fetched per SCAN page during export.
const DEFAULT_EXPORT_BATCH: usize = 1000;

/// Music catalog crawler.
#[derive(Parser)]
#[command(name = "metaraid")]
#[command(about = "Crawl the Spotify artist graph into Redis and export track features")]
#[command(version)]
#[command(
    long_about = "metaraid walks the artist collaboration graph breadth-first, one worker per API credential, \
storing every track with its audio features in Redis.\n\nExample usage:\n  metaraid scrape --config ./config.yaml\n  metaraid export --output ./tracks.parquet"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Crawl the artist graph until interrupted or out of credentials.
    Scrape(ScrapeArgs),

    /// Write every stored track with audio features to a Parquet file.
    Export(ExportArgs),

    /// Show the frontier queue counts.
    Status(StatusArgs),

    /// Print the default configuration as YAML.
    Config,
}

#[derive(Parser, Debug)]
pub struct ScrapeArgs {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: String,

    /// Artist id to seed an empty frontier with (overrides the config).
    #[arg(short, long)]
    pub seed: Option<String>,
}

#[derive(Parser, Debug)]
pub struct ExportArgs {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: String,

    /// Output Parquet file.
    #[arg(short, long, default_value = DEFAULT_EXPORT_PATH)]
    pub output: String,

    /// Keys requested per SCAN page; each page becomes one row group.
    #[arg(short, long, default_value_t = DEFAULT_EXPORT_BATCH)]
    pub batch_size: usize,
}

#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: String,

    /// Output as JSON.
    #[arg(short, long)]
    pub json: bool,
}

/// Parse CLI arguments and return the Cli struct.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Scrape(args) => run_scrape_command(args).await,
        Commands::Export(args) => run_export_command(args).await,
        Commands::Status(args) => run_status_command(args).await,
        Commands::Config => run_config_command(),
    }
}

async fn run_scrape_command(args: ScrapeArgs) -> anyhow::Result<()> {
    let config = Config::load(Path::new(&args.config))?;
    config.spotify.validate()?;
    let seed = args.seed.unwrap_or_else(|| config.scraper.seed_artist_id.clone());

    let redis = connect_redis(&config.redis).await?;
    let frontier = Arc::new(RedisFrontier::from_connection(redis.clone(), FrontierKeys::default()));
    let sink = Arc::new(RedisRecordSink::from_connection(redis));

    let clients = SpotifyClient::connect_all(&config.spotify).await?;
    if clients.is_empty() {
        warn!("every credential is rate limited, the crawl will end at the first health check");
    }

    let mut pool = WorkerPool::new(config.scraper.pool_config(), frontier, sink, clients);
    pool.start(&seed).await?;

    let shutdown = pool.shutdown_token();
    tokio::select! {
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => info!("interrupt received, shutting down"),
            Err(e) => {
                warn!(error = %e, "failed to listen for interrupt");
                shutdown.cancelled().await;
            }
        },
        _ = shutdown.cancelled() => {
            if pool.snapshot().all_cold() {
                info!("every credential is cold, shutting down");
            } else {
                warn!("a worker failed, shutting down");
            }
        }
    }

    pool.stop().await?;
    info!("scraper stopped");
    Ok(())
}

async fn run_export_command(args: ExportArgs) -> anyhow::Result<()> {
    if args.batch_size == 0 {
        anyhow::bail!("--batch-size must be greater than zero");
    }

    let config = Config::load(Path::new(&args.config))?;
    let redis = connect_redis(&config.redis).await?;
    let mut reader = RedisRecordReader::from_connection(redis, args.batch_size);

    let summary = export_tracks(&mut reader, Path::new(&args.output)).await?;
    println!(
        "Exported {} tracks to {} ({} without audio features skipped) in {:.1}s",
        summary.rows_written,
        args.output,
        summary.skipped,
        summary.duration.as_secs_f64()
    );
    Ok(())
}

async fn run_status_command(args: StatusArgs) -> anyhow::Result<()> {
    let config = Config::load(Path::new(&args.config))?;
    let redis = connect_redis(&config.redis).await?;
    let frontier = RedisFrontier::from_connection(redis, FrontierKeys::default());

    let stats = frontier.counts().await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!("Frontier status");
        println!("  pending: {}", stats.pending_jobs);
        println!("  working: {}", stats.working_jobs);
        println!("  done:    {}", stats.done_jobs);
        println!("  total:   {}", stats.total_jobs());
    }
    Ok(())
}

fn run_config_command() -> anyhow::Result<()> {
    print!("{}", Config::default_yaml()?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_scrape_command_defaults() {
        let cli = Cli::try_parse_from(["metaraid", "scrape"]).expect("should parse");

        assert_eq!(cli.log_level, "info");
        match cli.command {
            Commands::Scrape(args) => {
                assert_eq!(args.config, DEFAULT_CONFIG_PATH);
                assert!(args.seed.is_none());
            }
            _ => panic!("Expected Scrape command"),
        }
    }

    #[test]
    fn test_scrape_command_with_seed() {
        let cli = Cli::try_parse_from([
            "metaraid",
            "scrape",
            "--config",
            "/etc/metaraid.yaml",
            "--seed",
            "1Xyo4u8uXC1ZmMpatF05PJ",
            "--log-level",
            "debug",
        ])
        .expect("should parse");

        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::Scrape(args) => {
                assert_eq!(args.config, "/etc/metaraid.yaml");
                assert_eq!(args.seed.as_deref(), Some("1Xyo4u8uXC1ZmMpatF05PJ"));
            }
            _ => panic!("Expected Scrape command"),
        }
    }

    #[test]
    fn test_export_command_defaults() {
        let cli = Cli::try_parse_from(["metaraid", "export"]).expect("should parse");

        match cli.command {
            Commands::Export(args) => {
                assert_eq!(args.output, DEFAULT_EXPORT_PATH);
                assert_eq!(args.batch_size, DEFAULT_EXPORT_BATCH);
            }
            _ => panic!("Expected Export command"),
        }
    }

    #[test]
    fn test_status_json_flag() {
        let cli = Cli::try_parse_from(["metaraid", "status", "--json"]).expect("should parse");

        match cli.command {
            Commands::Status(args) => assert!(args.json),
            _ => panic!("Expected Status command"),
        }
    }

    #[test]
    fn test_unknown_command_rejected() {
        assert!(Cli::try_parse_from(["metaraid", "crawl"]).is_err());
    }
}
