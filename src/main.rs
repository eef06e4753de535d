use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nodescope::config::Config;

mod commands;

#[derive(Parser)]
#[command(
    name = "nodescope",
    version,
    about = "Inspect and drive the node scheduling store of a P2P crawler",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML); NODESCOPE_* variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json)
    #[arg(long, global = true)]
    log_format: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show node counts and the client histogram
    Stats {
        /// Number of client names to list
        #[arg(short, long, default_value = "10")]
        top: usize,

        /// Only count nodes with at most this many ping failures
        #[arg(long)]
        max_ping_tries: Option<u32>,
    },

    /// Show the stored state of one node
    Node {
        /// Node id
        id: String,
    },

    /// Claim a batch of handshake candidates and print their ids
    TakeHandshake {
        /// Override the configured batch size
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Claim a batch of crawl candidates and print their ids
    TakeCrawl {
        /// Override the configured batch size
        #[arg(short, long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref())?;
    apply_cli(&mut config, &cli);
    config.validate().context("Invalid configuration")?;

    setup_tracing(&config.logging.format, &config.logging.level, cli.verbose)?;

    tracing::debug!(path = %config.store.path.display(), "Using node store");

    match cli.command {
        Commands::Stats { top, max_ping_tries } => {
            commands::stats(&config, top, max_ping_tries).await?;
        }

        Commands::Node { id } => {
            commands::node(&config, id).await?;
        }

        Commands::TakeHandshake { .. } => {
            commands::take_handshake(&config).await?;
        }

        Commands::TakeCrawl { .. } => {
            commands::take_crawl(&config).await?;
        }
    }

    Ok(())
}

/// Command-line overrides; applied before validation
fn apply_cli(config: &mut Config, cli: &Cli) {
    if let Some(format) = &cli.log_format {
        config.logging.format = format.clone();
    }

    match cli.command {
        Commands::TakeHandshake { limit: Some(limit) } => config.handshake.batch_size = limit,
        Commands::TakeCrawl { limit: Some(limit) } => config.crawl.batch_size = limit,
        _ => {}
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config> {
    let Some(path) = path else {
        return Ok(Config::from_env()?);
    };

    let mut config = Config::from_file(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    config.apply_env();
    Ok(config)
}

fn setup_tracing(format: &str, level: &str, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("nodescope=debug,info")
    } else {
        tracing_subscriber::EnvFilter::try_new(format!("nodescope={level},warn"))
            .context("Invalid log level")?
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    Ok(())
}
