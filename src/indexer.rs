//! Indexing coordinator: drives content from the document store into
//! the vector index.
//!
//! Ordering is fixed: canonical records are written to the document
//! store first, then embedded, then upserted into the index. A crash
//! between the two writes leaves a record that is stored but not yet
//! searchable, which the reindex sweep repairs. Every write is an
//! upsert by id, so re-running an ingestion is safe.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::EmbeddingConfig;
use crate::embedding::{embed_texts, EmbeddingProvider};
use crate::error::{Error, Result};
use crate::models::{
    Chunk, ContentType, Extraction, Source, SourceStatus, VectorPayload, VectorPoint,
};
use crate::store::DocumentStore;
use crate::vector::VectorIndex;

/// Counts reported back from an ingestion or reindex run.
#[derive(Debug, Default, serde::Serialize)]
pub struct IndexSummary {
    pub chunks_indexed: usize,
    pub extractions_indexed: usize,
}

pub struct Indexer {
    store: Arc<DocumentStore>,
    index: Arc<VectorIndex>,
    provider: Box<dyn EmbeddingProvider>,
    embedding: EmbeddingConfig,
}

impl Indexer {
    pub fn new(
        store: Arc<DocumentStore>,
        index: Arc<VectorIndex>,
        provider: Box<dyn EmbeddingProvider>,
        embedding: EmbeddingConfig,
    ) -> Self {
        Self {
            store,
            index,
            provider,
            embedding,
        }
    }

    /// Ingest one source with its chunks and extractions, end to end.
    ///
    /// The source is created `pending`, moved to `processing`, and ends
    /// `complete` or `failed`. Chunks and extractions land in the
    /// document store before any embedding happens.
    pub async fn ingest_source(
        &self,
        source: &Source,
        chunks: &[Chunk],
        extractions: &[Extraction],
    ) -> Result<IndexSummary> {
        self.validate_bundle(source, chunks, extractions)?;

        self.store.create_source(source).await?;
        self.store
            .update_source_status(&source.project_id, &source.id, SourceStatus::Processing)
            .await?;

        let result = self.index_content(source, chunks, extractions).await;

        match result {
            Ok(summary) => {
                self.store
                    .update_source_status(&source.project_id, &source.id, SourceStatus::Complete)
                    .await?;
                info!(
                    source_id = %source.id,
                    project = %source.project_id,
                    chunks = summary.chunks_indexed,
                    extractions = summary.extractions_indexed,
                    "source ingested"
                );
                Ok(summary)
            }
            Err(e) => {
                warn!(source_id = %source.id, error = %e, "ingestion failed");
                // Best-effort: the root cause must survive even when the
                // status update itself fails.
                if let Err(status_err) = self
                    .store
                    .update_source_status(&source.project_id, &source.id, SourceStatus::Failed)
                    .await
                {
                    warn!(
                        source_id = %source.id,
                        error = %status_err,
                        "could not mark source as failed"
                    );
                }
                Err(e)
            }
        }
    }

    fn validate_bundle(
        &self,
        source: &Source,
        chunks: &[Chunk],
        extractions: &[Extraction],
    ) -> Result<()> {
        if source.title.trim().is_empty() {
            return Err(Error::Validation("source title must not be empty".to_string()));
        }
        for chunk in chunks {
            if chunk.text.trim().is_empty() {
                return Err(Error::Validation(format!(
                    "chunk '{}' has empty text",
                    chunk.id
                )));
            }
            if chunk.source_id != source.id {
                return Err(Error::Validation(format!(
                    "chunk '{}' references source '{}', bundle source is '{}'",
                    chunk.id, chunk.source_id, source.id
                )));
            }
            if chunk.project_id != source.project_id {
                return Err(Error::Validation(format!(
                    "chunk '{}' project differs from source project",
                    chunk.id
                )));
            }
        }
        for extraction in extractions {
            if extraction.source_id != source.id {
                return Err(Error::Validation(format!(
                    "extraction '{}' references source '{}', bundle source is '{}'",
                    extraction.id, extraction.source_id, source.id
                )));
            }
            if extraction.project_id != source.project_id {
                return Err(Error::Validation(format!(
                    "extraction '{}' project differs from source project",
                    extraction.id
                )));
            }
        }
        Ok(())
    }

    async fn index_content(
        &self,
        source: &Source,
        chunks: &[Chunk],
        extractions: &[Extraction],
    ) -> Result<IndexSummary> {
        self.store.bulk_create_chunks(chunks).await?;
        for extraction in extractions {
            self.store.save_extraction(extraction).await?;
        }

        let mut sources = HashMap::new();
        sources.insert(source.id.clone(), source.clone());

        let chunks_indexed = self.index_chunk_batch(chunks, &sources).await?;
        let extractions_indexed = self.index_extraction_batch(extractions, &sources).await?;

        Ok(IndexSummary {
            chunks_indexed,
            extractions_indexed,
        })
    }

    /// Embed and upsert a batch of chunks. Sources are resolved once per
    /// batch, never per point.
    async fn index_chunk_batch(
        &self,
        chunks: &[Chunk],
        sources: &HashMap<String, Source>,
    ) -> Result<usize> {
        let mut indexed = 0;

        for batch in chunks.chunks(self.embedding.batch_size.max(1)) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = embed_texts(self.provider.as_ref(), &self.embedding, &texts).await?;

            if vectors.len() != batch.len() {
                return Err(Error::Embedding(format!(
                    "provider returned {} vectors for {} texts",
                    vectors.len(),
                    batch.len()
                )));
            }

            let indexed_at = chrono::Utc::now().timestamp();
            for (chunk, vector) in batch.iter().zip(vectors) {
                let source = sources.get(&chunk.source_id).ok_or_else(|| {
                    Error::Internal(format!("source '{}' missing from batch cache", chunk.source_id))
                })?;

                self.index
                    .upsert(&VectorPoint {
                        id: chunk.id.clone(),
                        vector,
                        payload: chunk_payload(chunk, source, indexed_at),
                    })
                    .await?;
                indexed += 1;
            }
        }

        Ok(indexed)
    }

    async fn index_extraction_batch(
        &self,
        extractions: &[Extraction],
        sources: &HashMap<String, Source>,
    ) -> Result<usize> {
        let mut indexed = 0;

        for batch in extractions.chunks(self.embedding.batch_size.max(1)) {
            let texts: Vec<String> = batch.iter().map(|e| e.embedding_text()).collect();
            let vectors = embed_texts(self.provider.as_ref(), &self.embedding, &texts).await?;

            if vectors.len() != batch.len() {
                return Err(Error::Embedding(format!(
                    "provider returned {} vectors for {} texts",
                    vectors.len(),
                    batch.len()
                )));
            }

            let indexed_at = chrono::Utc::now().timestamp();
            for (extraction, vector) in batch.iter().zip(vectors) {
                let source = sources.get(&extraction.source_id).ok_or_else(|| {
                    Error::Internal(format!(
                        "source '{}' missing from batch cache",
                        extraction.source_id
                    ))
                })?;

                self.index
                    .upsert(&VectorPoint {
                        id: extraction.id.clone(),
                        vector,
                        payload: extraction_payload(extraction, source, indexed_at),
                    })
                    .await?;
                indexed += 1;
            }
        }

        Ok(indexed)
    }

    /// Rebuild a project's slice of the vector index from the document
    /// store. The index is a derived cache; this sweep is the recovery
    /// path after a crash, a model change, or payload drift.
    pub async fn reindex_project(&self, project_id: &str) -> Result<IndexSummary> {
        let chunks = self.store.list_chunks(project_id).await?;
        let extractions = self.store.list_all_extractions(project_id).await?;

        let mut source_ids: Vec<String> = chunks.iter().map(|c| c.source_id.clone()).collect();
        source_ids.extend(extractions.iter().map(|e| e.source_id.clone()));
        source_ids.sort();
        source_ids.dedup();
        let sources = self.store.get_sources_by_ids(project_id, &source_ids).await?;

        self.index.delete_project(project_id).await?;

        let chunks_indexed = self.index_chunk_batch(&chunks, &sources).await?;
        let extractions_indexed = self.index_extraction_batch(&extractions, &sources).await?;

        info!(
            project = %project_id,
            chunks = chunks_indexed,
            extractions = extractions_indexed,
            "project reindexed"
        );

        Ok(IndexSummary {
            chunks_indexed,
            extractions_indexed,
        })
    }

    /// Remove a project entirely: vector points first, then the
    /// canonical tables.
    pub async fn purge_project(&self, project_id: &str) -> Result<u64> {
        let removed = self.index.delete_project(project_id).await?;
        self.store.purge_project(project_id).await?;
        info!(project = %project_id, points_removed = removed, "project purged");
        Ok(removed)
    }
}

fn chunk_payload(chunk: &Chunk, source: &Source, indexed_at: i64) -> VectorPayload {
    VectorPayload {
        project_id: chunk.project_id.clone(),
        content_type: ContentType::Chunk,
        source_id: chunk.source_id.clone(),
        source_type: source.source_type,
        source_category: source.category,
        source_year: source.year,
        extraction_type: None,
        topics: source.tags.clone(),
        chapter: chunk.position.chapter.clone(),
        source_title: source.title.clone(),
        extraction_title: None,
        section: chunk.position.section.clone(),
        page: chunk.position.page,
        indexed_at,
    }
}

fn extraction_payload(extraction: &Extraction, source: &Source, indexed_at: i64) -> VectorPayload {
    VectorPayload {
        project_id: extraction.project_id.clone(),
        content_type: ContentType::Extraction,
        source_id: extraction.source_id.clone(),
        source_type: source.source_type,
        source_category: source.category,
        source_year: source.year,
        extraction_type: Some(extraction.extraction_type()),
        topics: extraction.topics.clone(),
        chapter: extraction.chapter.clone(),
        source_title: source.title.clone(),
        extraction_title: Some(extraction.title.clone()),
        section: None,
        page: None,
        indexed_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExtractionContent, SourceCategory, SourceType, SCHEMA_VERSION};

    fn sample_source() -> Source {
        Source {
            id: "s1".to_string(),
            project_id: "p1".to_string(),
            title: "AI Engineering".to_string(),
            authors: vec!["Chip Huyen".to_string()],
            source_type: SourceType::Book,
            year: Some(2025),
            category: SourceCategory::Foundational,
            tags: vec!["llm".to_string()],
            path: None,
            ingested_at: chrono::Utc::now(),
            status: SourceStatus::Pending,
            metadata: serde_json::json!({}),
            schema_version: SCHEMA_VERSION,
        }
    }

    #[test]
    fn test_chunk_payload_denormalizes_source_fields() {
        let source = sample_source();
        let chunk = Chunk {
            id: "c1".to_string(),
            source_id: "s1".to_string(),
            project_id: "p1".to_string(),
            text: "Evaluation drives iteration.".to_string(),
            token_count: 5,
            position: crate::models::ChunkPosition {
                chapter: Some("4".to_string()),
                section: Some("4.2".to_string()),
                page: Some(112),
            },
            parent_chunk_id: None,
            depth: 0,
            schema_version: SCHEMA_VERSION,
        };

        let payload = chunk_payload(&chunk, &source, 1_700_000_000);
        assert_eq!(payload.content_type, ContentType::Chunk);
        assert_eq!(payload.source_title, "AI Engineering");
        assert_eq!(payload.source_year, Some(2025));
        assert_eq!(payload.topics, vec!["llm".to_string()]);
        assert_eq!(payload.extraction_type, None);
        assert_eq!(payload.page, Some(112));
    }

    #[test]
    fn test_extraction_payload_carries_type_and_topics() {
        let source = sample_source();
        let extraction = Extraction {
            id: "e1".to_string(),
            source_id: "s1".to_string(),
            chunk_id: "c1".to_string(),
            project_id: "p1".to_string(),
            content: ExtractionContent::Decision {
                context: "choosing a vector store".to_string(),
                choice: "start with a library, not a service".to_string(),
                rationale: "operational simplicity".to_string(),
                tradeoffs: vec![],
            },
            topics: vec!["retrieval".to_string()],
            title: "Vector store selection".to_string(),
            source_title: "AI Engineering".to_string(),
            source_type: SourceType::Book,
            chapter: Some("6".to_string()),
            extracted_at: chrono::Utc::now(),
            schema_version: SCHEMA_VERSION,
        };

        let payload = extraction_payload(&extraction, &source, 1_700_000_000);
        assert_eq!(payload.content_type, ContentType::Extraction);
        assert_eq!(
            payload.extraction_type,
            Some(crate::models::ExtractionType::Decision)
        );
        assert_eq!(payload.topics, vec!["retrieval".to_string()]);
        assert_eq!(
            payload.extraction_title,
            Some("Vector store selection".to_string())
        );
    }
}
