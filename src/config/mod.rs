// Configuration management module
// TOML settings under the application home directory

pub mod settings;


use anyhow::{Context, Result};
use console::style;
use std::path::{Path, PathBuf};

pub use settings::{
    Config, ConfigError, HOME_ENV, IngestConfig, OllamaConfig, RetrievalConfig, ServerConfig,
};

/// Resolve the home directory from an explicit override or the environment.
#[inline]
pub fn resolve_home(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    explicit.map_or_else(Config::default_dir, |dir| Ok(dir.to_path_buf()))
}

/// Print the effective configuration to stderr.
#[inline]
pub fn show_config(home: &Path) -> Result<()> {
    let config = Config::load(home).context("Failed to load configuration")?;

    eprintln!("{}", style("📋 Current Configuration").bold().cyan());
    eprintln!();

    eprintln!("{}", style("Ollama Settings:").bold().yellow());
    eprintln!("  Host: {}", style(&config.ollama.host).cyan());
    eprintln!("  Port: {}", style(config.ollama.port).cyan());
    eprintln!("  Model: {}", style(&config.ollama.model).cyan());
    eprintln!("  Batch Size: {}", style(config.ollama.batch_size).cyan());
    match config.ollama_url() {
        Ok(url) => eprintln!("  Ollama URL: {}", style(url).cyan()),
        Err(e) => eprintln!("  Ollama URL: {} ({})", style("Invalid").red(), e),
    }

    eprintln!();
    eprintln!("{}", style("Ingestion:").bold().yellow());
    eprintln!("  Batch Size: {}", style(config.ingest.batch_size).cyan());
    eprintln!("  Max Attempts: {}", style(config.ingest.max_retries).cyan());
    eprintln!("  Pacing: {}ms", style(config.ingest.pacing_ms).cyan());
    eprintln!("  Concurrency: {}", style(config.ingest.concurrency).cyan());
    eprintln!(
        "  Rebuild Strategy: {}",
        style(config.ingest.rebuild_strategy).cyan()
    );

    eprintln!();
    eprintln!("{}", style("Retrieval:").bold().yellow());
    eprintln!("  Collection: {}", style(&config.retrieval.collection).cyan());
    eprintln!("  Metric: {}", style(config.retrieval.metric).cyan());
    eprintln!(
        "  Default Max Results: {}",
        style(config.retrieval.default_max_results).cyan()
    );
    eprintln!("  Server Bind: {}", style(&config.server.bind).cyan());

    eprintln!();
    eprintln!(
        "Config file: {}",
        style(config.config_file_path().display()).dim()
    );

    Ok(())
}

/// Write the default configuration unless a config file already exists.
#[inline]
pub fn init_config(home: &Path) -> Result<PathBuf> {
    let config = Config {
        base_dir: home.to_path_buf(),
        ..Config::default()
    };
    let path = config.config_file_path();

    if path.exists() {
        eprintln!(
            "{}",
            style(format!("Config already exists at {}", path.display())).yellow()
        );
        return Ok(path);
    }

    config.save()?;
    eprintln!(
        "{}",
        style(format!("✅ Wrote default config to {}", path.display())).green()
    );
    Ok(path)
}
