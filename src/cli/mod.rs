pub mod commands;
pub mod config;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to the saved default config)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a crawl worker
    Run {
        /// Worker identifier (defaults to a generated one)
        #[arg(short, long)]
        worker_id: Option<String>,

        /// Domains processed concurrently by this worker
        #[arg(long, default_value_t = 1)]
        concurrent_domains: usize,

        /// Use the in-process queue instead of MongoDB
        #[arg(long)]
        memory_queue: bool,

        /// Run the browser headless
        #[arg(long)]
        headless: Option<bool>,

        /// Override the artifact data directory
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Form region (india or usa)
        #[arg(long)]
        region: Option<String>,
    },

    /// Load seed URLs from a file into the queue, grouped by domain
    LoadUrls {
        /// File with one URL per line
        #[arg(required = true)]
        file: PathBuf,

        /// Also pull seed URLs from each domain's sitemap.xml
        #[arg(long)]
        sitemap: bool,
    },

    /// Show per-domain URL counts and overall progress
    Status,

    /// Reset stalled domains and URL tasks back to pending
    ResetStalled {
        /// Minutes of silence before a claim counts as stalled
        #[arg(long)]
        cutoff_minutes: Option<i64>,
    },
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => config::CrawlerConfig::load_from_file(path)?,
        None => config::CrawlerConfig::load_default()?,
    };

    match cli.command {
        Commands::Run {
            worker_id,
            concurrent_domains,
            memory_queue,
            headless,
            data_dir,
            region,
        } => {
            let mut config = config;
            if let Some(headless) = headless {
                config.browser.headless = headless;
            }
            if let Some(data_dir) = data_dir {
                config.storage.data_dir = data_dir;
            }
            if let Some(region) = region {
                config.forms.region = region;
            }
            commands::run(config, worker_id, concurrent_domains, memory_queue).await
        }
        Commands::LoadUrls { file, sitemap } => {
            info!("Loading seed URLs from {}", file.display());
            commands::load_urls(config, file, sitemap).await
        }
        Commands::Status => commands::status(config).await,
        Commands::ResetStalled { cutoff_minutes } => {
            commands::reset_stalled(config, cutoff_minutes).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert()
    }
}
