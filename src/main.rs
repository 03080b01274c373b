use anyhow::Result;
use chat_recall::commands::{RebuildArgs, query, rebuild, serve, show_status, stats};
use chat_recall::config::{Config, init_config, resolve_home, show_config};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "chat-recall")]
#[command(about = "Index exported chat history into a vector store and search it")]
#[command(version)]
struct Cli {
    /// Application home (defaults to $CHAT_RECALL_HOME or ~/.chat-recall)
    #[arg(long, global = true)]
    home: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show or initialize the configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
        /// Write a default config.toml
        #[arg(long, conflicts_with = "show")]
        init: bool,
    },
    /// Rebuild a collection from a directory of CSV exports
    Rebuild {
        /// Directory searched recursively for *.csv files
        csv_dir: PathBuf,
        #[arg(long)]
        collection: Option<String>,
        /// Stop after this many accepted documents
        #[arg(long)]
        limit: Option<usize>,
        /// Documents per upsert batch
        #[arg(long)]
        batch_size: Option<usize>,
        /// Delete the collection up front instead of building a staged copy
        #[arg(long)]
        in_place: bool,
    },
    /// Search a collection
    Query {
        question: String,
        #[arg(long)]
        max_results: Option<usize>,
        /// Minimum similarity (or maximum distance, depending on the metric)
        #[arg(long)]
        threshold: Option<f32>,
        #[arg(long)]
        collection: Option<String>,
    },
    /// Show sampled statistics for a collection
    Stats {
        #[arg(long)]
        collection: Option<String>,
    },
    /// Serve the HTTP API
    Serve {
        /// Address to bind, e.g. 127.0.0.1:8000
        #[arg(long)]
        bind: Option<String>,
        #[arg(long)]
        collection: Option<String>,
    },
    /// Show Ollama connectivity and collections on disk
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("chat_recall=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let home = resolve_home(cli.home.as_deref())?;

    match cli.command {
        Commands::Config { show, init } => {
            if init {
                let path = init_config(&home)?;
                eprintln!("Configuration written to {}", path.display());
            } else {
                show_config(&home)?;
            }
        }
        command => {
            let config = Config::load(&home)?;
            run(&config, command).await?;
        }
    }

    Ok(())
}

async fn run(config: &Config, command: Commands) -> Result<()> {
    match command {
        Commands::Config { .. } => {}
        Commands::Rebuild {
            csv_dir,
            collection,
            limit,
            batch_size,
            in_place,
        } => {
            let args = RebuildArgs {
                csv_dir,
                collection,
                limit,
                batch_size,
                in_place,
            };
            let report = rebuild(config, &args).await?;
            if !report.committed {
                anyhow::bail!("rebuild of '{}' was not committed", report.collection);
            }
        }
        Commands::Query {
            question,
            max_results,
            threshold,
            collection,
        } => {
            query(
                config,
                &question,
                max_results,
                threshold,
                collection.as_deref(),
            )
            .await?;
        }
        Commands::Stats { collection } => {
            stats(config, collection.as_deref()).await?;
        }
        Commands::Serve { bind, collection } => {
            serve(config, bind.as_deref(), collection.as_deref()).await?;
        }
        Commands::Status => {
            show_status(config).await?;
        }
    }

    Ok(())
}
