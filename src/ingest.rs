//! Bundle ingestion and the store-side CLI commands.
//!
//! A bundle is a JSON file holding one source with its chunks and
//! extractions, the unit produced by the upstream extraction pipeline:
//!
//! ```json
//! {
//!   "source": { "id": "ai-eng-huyen", "project_id": "ai_eng", ... },
//!   "chunks": [ ... ],
//!   "extractions": [ ... ]
//! }
//! ```
//!
//! `ingested_at`, `status`, and `extracted_at` may be omitted; they
//! default to now / `pending`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::embedding::create_provider;
use crate::indexer::Indexer;
use crate::models::{Chunk, Extraction, Source};
use crate::store::DocumentStore;
use crate::vector::VectorIndex;

/// One source plus its derived content, as authored on disk.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Bundle {
    pub source: Source,
    #[serde(default)]
    pub chunks: Vec<Chunk>,
    #[serde(default)]
    pub extractions: Vec<Extraction>,
}

/// Read and parse a bundle file.
pub fn load_bundle(path: &Path) -> Result<Bundle> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read bundle: {}", path.display()))?;
    let bundle: Bundle = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse bundle: {}", path.display()))?;
    Ok(bundle)
}

/// Build the indexing stack from configuration.
pub async fn open_indexer(config: &Config) -> Result<Indexer> {
    let store = Arc::new(DocumentStore::open(&config.document_store.path).await?);
    let provider = create_provider(&config.embedding)?;
    let dims = provider.dims();
    let index = Arc::new(
        VectorIndex::open(&config.vector_index.path, &config.vector_index.collection, dims)
            .await?,
    );
    Ok(Indexer::new(store, index, provider, config.embedding.clone()))
}

/// `lore init` — create both databases and the shared collection.
pub async fn run_init(config: &Config) -> Result<()> {
    let store = DocumentStore::open(&config.document_store.path).await?;
    store.ensure_project(&config.default_project).await?;

    let provider = create_provider(&config.embedding)?;
    VectorIndex::open(
        &config.vector_index.path,
        &config.vector_index.collection,
        provider.dims(),
    )
    .await?;

    println!("Initialized stores:");
    println!("  documents: {}", config.document_store.path.display());
    println!(
        "  vectors:   {} (collection '{}', {} dims)",
        config.vector_index.path.display(),
        config.vector_index.collection,
        provider.dims()
    );
    Ok(())
}

/// `lore ingest <bundle.json>` — ingest one bundle end to end.
pub async fn run_ingest(config: &Config, path: &Path) -> Result<()> {
    let bundle = load_bundle(path)?;
    let indexer = open_indexer(config).await?;

    println!(
        "Ingesting '{}' ({} chunks, {} extractions) into project '{}'...",
        bundle.source.title,
        bundle.chunks.len(),
        bundle.extractions.len(),
        bundle.source.project_id
    );

    let summary = indexer
        .ingest_source(&bundle.source, &bundle.chunks, &bundle.extractions)
        .await?;

    println!(
        "Done: {} chunks and {} extractions indexed.",
        summary.chunks_indexed, summary.extractions_indexed
    );
    Ok(())
}

/// `lore reindex` — rebuild a project's vector slice from the
/// document store.
pub async fn run_reindex(config: &Config, project: Option<&str>) -> Result<()> {
    let project = project.unwrap_or(&config.default_project);
    let indexer = open_indexer(config).await?;

    println!("Reindexing project '{project}'...");
    let summary = indexer.reindex_project(project).await?;
    println!(
        "Done: {} chunks and {} extractions reindexed.",
        summary.chunks_indexed, summary.extractions_indexed
    );
    Ok(())
}

/// `lore purge --yes` — delete a project from both stores.
pub async fn run_purge(config: &Config, project: Option<&str>, confirmed: bool) -> Result<()> {
    let project = project.unwrap_or(&config.default_project);
    if !confirmed {
        anyhow::bail!("refusing to purge project '{project}' without --yes");
    }

    let indexer = open_indexer(config).await?;
    let removed = indexer.purge_project(project).await?;
    println!("Purged project '{project}' ({removed} vector points removed).");
    Ok(())
}
