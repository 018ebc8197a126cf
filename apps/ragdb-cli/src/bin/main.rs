use std::io::BufRead;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use ragdb_core::config::Config;
use ragdb_core::loader::collect_files;
use ragdb_engine::{Engine, IngestRequest, QueryRequest};

#[derive(Parser)]
#[command(name = "ragdb", about = "Local retrieval-augmented generation over document collections")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load, chunk, embed and index documents into a collection.
    Ingest {
        /// Files or directories to ingest.
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        #[arg(short, long, default_value = "general")]
        collection: String,
        #[arg(long)]
        chunk_size: Option<usize>,
        #[arg(long)]
        chunk_overlap: Option<usize>,
        /// Exit with an error unless every document and chunk was stored.
        #[arg(long)]
        strict: bool,
    },
    /// Answer a question from a collection.
    Query {
        text: String,
        #[arg(short, long, default_value = "general")]
        collection: String,
        #[arg(short)]
        k: Option<usize>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Probe every configured generation backend once.
    Health,
    /// Run queries read from stdin (one per line) and print latency statistics.
    Metrics {
        #[arg(short, long, default_value = "general")]
        collection: String,
    },
    /// Delete a collection and its index artifact.
    Drop { collection: String },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
}

fn ingest_request(paths: Vec<PathBuf>, collection: String) -> IngestRequest {
    if let [only] = paths.as_slice() {
        if only.is_dir() {
            return IngestRequest::directory(only, collection);
        }
    }
    let files = paths
        .into_iter()
        .flat_map(|p| if p.is_dir() { collect_files(&p) } else { vec![p] })
        .collect();
    IngestRequest::files(files, collection)
}

fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner} {msg} [{elapsed}]") {
        pb.set_style(style);
    }
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = Config::load().context("loading configuration")?;
    let engine = Engine::from_config(config.engine()?)?;

    match cli.command {
        Command::Ingest { paths, collection, chunk_size, chunk_overlap, strict } => {
            let mut request = ingest_request(paths, collection);
            request.chunk_size = chunk_size;
            request.chunk_overlap = chunk_overlap;
            let pb = spinner(&format!("Ingesting into '{}'", request.collection));
            let report = engine.ingest(request).await;
            pb.finish_and_clear();
            let report = report?;
            print_json(&report)?;
            if strict {
                report.ensure_complete()?;
            }
        }
        Command::Query { text, collection, k, model, timeout_ms } => {
            let request = QueryRequest { query: text, collection, k, model, filters: None, timeout_ms };
            let response = engine.query(request).await?;
            print_json(&response)?;
        }
        Command::Health => {
            let monitor = engine.health_monitor()?;
            monitor.probe_once().await;
            print_json(&engine.health().snapshot())?;
        }
        Command::Metrics { collection } => {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                if let Err(e) = engine.query(QueryRequest::new(line.trim(), collection.clone())).await {
                    tracing::warn!(error = %e, "query failed");
                }
            }
            print_json(&json!({
                "backends": engine.metrics().report(),
                "queries": engine.query_stats(),
                "cache": engine.cache_stats(),
            }))?;
        }
        Command::Drop { collection } => {
            let existed = engine.delete_collection(&collection)?;
            print_json(&json!({ "collection": collection, "deleted": existed }))?;
        }
    }
    Ok(())
}
