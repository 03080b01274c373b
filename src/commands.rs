use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::context::RecallContext;
use crate::database::{CollectionStore, VectorIndex};
use crate::database::lancedb::LanceCollections;
use crate::embeddings::OllamaClient;
use crate::indexer::{Indexer, RebuildReport, RebuildStrategy};
use crate::records::loader::ArchiveLoader;
use crate::search::{QueryEngine, QueryRequest, QueryResult, QuerySettings};
use crate::server::{self, AppState};
use crate::stats::{CollectionStats, StatsSampler};

/// Options for `rebuild`; `None` fields fall back to the configuration.
#[derive(Debug, Clone, Default)]
pub struct RebuildArgs {
    pub csv_dir: PathBuf,
    pub collection: Option<String>,
    pub limit: Option<usize>,
    pub batch_size: Option<usize>,
    pub in_place: bool,
}

fn collection_or<'a>(config: &'a Config, collection: Option<&'a str>) -> &'a str {
    collection.unwrap_or(&config.retrieval.collection)
}

fn collections(config: &Config) -> LanceCollections {
    LanceCollections::new(config.collections_dir(), config.retrieval.metric)
}

async fn check_ollama(client: &OllamaClient) -> Result<()> {
    let client = client.clone();
    tokio::task::spawn_blocking(move || client.health_check())
        .await
        .context("Ollama health check panicked")?
        .context("Ollama is not ready; start it and pull the configured model")
}

async fn engine(config: &Config, collection: &str) -> Result<QueryEngine> {
    let context = RecallContext::from_config(config, collection).await?;
    Ok(QueryEngine::new(
        Arc::new(context),
        QuerySettings::from_config(&config.retrieval),
    ))
}

/// Load the CSV archive and rebuild a collection from it.
#[inline]
pub async fn rebuild(config: &Config, args: &RebuildArgs) -> Result<RebuildReport> {
    let collection = collection_or(config, args.collection.as_deref());

    let client = OllamaClient::new(&config.ollama)?;
    check_ollama(&client).await?;

    let loader = ArchiveLoader::new(&args.csv_dir).with_limit(args.limit);
    let archive = tokio::task::spawn_blocking(move || loader.load())
        .await
        .context("Archive loading panicked")?
        .with_context(|| format!("Failed to load archive from {}", args.csv_dir.display()))?;

    let report = &archive.report;
    println!("📂 Archive: {}", args.csv_dir.display());
    println!(
        "   Files: {} ({} unreadable)",
        report.files_found, report.files_failed
    );
    println!(
        "   Records: {} read, {} accepted, {} rejected, {} malformed",
        report.records_read,
        report.accepted,
        report.total_rejected(),
        report.malformed
    );
    for (reason, count) in &report.rejected {
        println!("     - {}: {}", reason, count);
    }

    let mut ingest = config.ingest.clone();
    if let Some(batch_size) = args.batch_size {
        ingest.batch_size = batch_size.max(1);
    }
    let mut indexer =
        Indexer::from_config(Arc::new(client), &ingest).with_lock_dir(config.collections_dir());
    if args.in_place {
        indexer = indexer.with_strategy(RebuildStrategy::InPlace);
    }

    let rebuild = indexer
        .rebuild(&collections(config), collection, &archive.documents)
        .await
        .with_context(|| format!("Failed to rebuild collection '{collection}'"))?;

    let ingest = &rebuild.ingest;
    println!();
    println!("🧮 Collection '{}' ({} strategy)", collection, rebuild.strategy);
    println!(
        "   Batches: {} total, {} failed",
        ingest.batches, ingest.failed_batches
    );
    println!(
        "   Documents: {} indexed, {} skipped",
        ingest.succeeded, ingest.failed_documents
    );
    println!("   Duration: {:?}", ingest.elapsed);
    if rebuild.committed {
        println!("✅ Rebuild committed");
    } else {
        println!("❌ Every batch failed; the previous collection was kept");
    }

    Ok(rebuild)
}

/// Run one query and print the matching records.
#[inline]
pub async fn query(
    config: &Config,
    question: &str,
    max_results: Option<usize>,
    threshold: Option<f32>,
    collection: Option<&str>,
) -> Result<QueryResult> {
    let collection = collection_or(config, collection);
    let engine = engine(config, collection).await?;

    let mut request = QueryRequest::new(
        question,
        max_results.unwrap_or(config.retrieval.default_max_results),
    );
    request.similarity_threshold = threshold;

    let result = engine
        .query(&request)
        .await
        .map_err(|e| anyhow::anyhow!("[{}] {}", e.code(), e))?;

    println!(
        "🔍 {} result(s) for {:?} in '{}'",
        result.total_found, result.question, collection
    );
    for (rank, record) in result.records.iter().enumerate() {
        println!();
        println!(
            "#{} {} {:.4} | {} | {}",
            rank + 1,
            config.retrieval.metric,
            record.score,
            record.metadata.sender_or(crate::records::UNKNOWN_SENDER),
            record.metadata.chat_time_or(crate::records::UNKNOWN_TIME)
        );
        println!("{}", record.content);
    }

    Ok(result)
}

/// Print sampled statistics for a collection.
#[inline]
pub async fn stats(config: &Config, collection: Option<&str>) -> Result<CollectionStats> {
    let collection = collection_or(config, collection);
    let index = collections(config)
        .open(collection)
        .await
        .with_context(|| format!("Failed to open collection '{collection}'"))?;

    let stats = StatsSampler::new(index, config.retrieval.stats_sample_cap)
        .stats()
        .await?;

    println!("📊 Collection '{}'", collection);
    println!(
        "   Documents: {}{}",
        stats.total_count,
        if stats.total_is_exact { "" } else { " (estimated)" }
    );
    println!("   Sampled: {}", stats.sample_size);
    println!("   Senders: {}", stats.unique_senders.join(", "));
    println!("   Message types: {}", stats.message_types.join(", "));
    if let (Some(earliest), Some(latest)) = (&stats.time_range.earliest, &stats.time_range.latest)
    {
        println!("   Time range: {} → {}", earliest, latest);
    }
    if let Some(note) = &stats.note {
        println!("   ⚠️  {}", note);
    }

    Ok(stats)
}

/// Serve the HTTP API until interrupted.
#[inline]
pub async fn serve(config: &Config, bind: Option<&str>, collection: Option<&str>) -> Result<()> {
    let collection = collection_or(config, collection);
    let bind = bind.unwrap_or(&config.server.bind);

    let engine = engine(config, collection).await?;
    if let Some(reason) = engine.context().unavailable_reason() {
        warn!(
            "Starting without an index; queries will fail until '{}' is rebuilt: {}",
            collection, reason
        );
    }

    info!("Serving collection '{}' on {}", collection, bind);
    server::serve(
        AppState::new(Arc::new(engine), config.retrieval.stats_sample_cap),
        bind,
    )
    .await
}

/// Show connectivity and the collections on disk.
#[inline]
pub async fn show_status(config: &Config) -> Result<()> {
    println!("📊 Chat-Recall Status Report");
    println!("{}", "=".repeat(50));
    println!();

    println!("🤖 Ollama Status:");
    match OllamaClient::new(&config.ollama) {
        Ok(client) => match check_ollama(&client).await {
            Ok(()) => {
                println!(
                    "   ✅ Ollama: Connected ({}:{})",
                    config.ollama.host, config.ollama.port
                );
                println!("   📋 Model: {}", config.ollama.model);
            }
            Err(e) => println!("   ⚠️  Ollama: Unhealthy - {:#}", e),
        },
        Err(e) => println!("   ❌ Ollama: Misconfigured - {}", e),
    }

    println!();
    println!("🔍 Collections ({}):", config.collections_dir().display());
    let store = collections(config);
    let names = store.list().await.context("Failed to list collections")?;
    if names.is_empty() {
        println!("   No collections yet. Use 'chat-recall rebuild <csv_dir>' to create one.");
    }
    for name in &names {
        let marker = if *name == config.retrieval.collection {
            " (default)"
        } else {
            ""
        };
        match store.open(name).await {
            Ok(index) => match index.count().await {
                Ok(count) => println!("   📚 {}{}: {} documents", name, marker, count),
                Err(e) => println!("   ⚠️  {}{}: count failed - {}", name, marker, e),
            },
            Err(e) => println!("   ❌ {}{}: {}", name, marker, e),
        }
    }

    Ok(())
}
