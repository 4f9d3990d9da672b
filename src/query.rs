//! Query service: semantic search, typed listing, and cross-source
//! comparison over the indexed knowledge.
//!
//! Every search goes through [`KnowledgeFilter`], so tenant scoping is
//! decided in exactly one place. Hits are enriched from the document
//! store with batched id lookups, one per content type, never one per
//! hit. Transient index failures are retried once before surfacing.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::config::{EmbeddingConfig, QueryConfig};
use crate::embedding::{embed_query, EmbeddingProvider};
use crate::error::{Error, Result};
use crate::models::{
    ContentType, Extraction, ExtractionType, ScoredPoint, SourceType,
};
use crate::store::{DocumentStore, ExtractionPage};
use crate::vector::{KnowledgeFilter, VectorIndex};

// ============ Request / response types ============

/// A semantic search request. Unknown fields are rejected so that a
/// misspelled filter can never silently widen the result set.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub content_type: Option<ContentType>,
    #[serde(default)]
    pub extraction_type: Option<ExtractionType>,
    #[serde(default)]
    pub source_type: Option<SourceType>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub year_from: Option<i64>,
    #[serde(default)]
    pub year_to: Option<i64>,
    #[serde(default)]
    pub chapter: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
    /// Keep only the best hit per source.
    #[serde(default)]
    pub diversify: Option<bool>,
    /// Search across all projects. Requires the premium tier; the
    /// middleware rejects it for lower tiers before it reaches here.
    #[serde(default)]
    pub cross_project: bool,
}

/// Where a result came from, resolved without extra lookups.
#[derive(Debug, Clone, Serialize)]
pub struct SourceRef {
    pub id: String,
    pub title: String,
    pub source_type: SourceType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chapter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<i64>,
}

/// One ranked search hit with its display content.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub id: String,
    pub score: f32,
    pub project_id: String,
    pub content_type: ContentType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extraction_type: Option<ExtractionType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Chunk text, or the extraction's structured content.
    pub content: serde_json::Value,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub topics: Vec<String>,
    pub source: SourceRef,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub results: Vec<SearchResult>,
    pub result_count: usize,
    /// Distinct source titles among the results, for citation lines.
    pub sources_cited: Vec<String>,
    pub latency_ms: u64,
}

/// One source's extractions on the compared topic.
#[derive(Debug, Serialize)]
pub struct SourceComparison {
    pub source_id: String,
    pub source_title: String,
    pub extractions: Vec<Extraction>,
}

/// Side-by-side view of what each source says about a topic. Pure
/// grouping: no embedding, no scores, no cross-source ranking.
#[derive(Debug, Serialize)]
pub struct CompareResponse {
    pub topic: String,
    pub comparisons: Vec<SourceComparison>,
    pub latency_ms: u64,
}

// ============ Service ============

pub struct QueryService {
    store: Arc<DocumentStore>,
    index: Arc<VectorIndex>,
    provider: Box<dyn EmbeddingProvider>,
    embedding: EmbeddingConfig,
    config: QueryConfig,
    default_project: String,
}

impl QueryService {
    pub fn new(
        store: Arc<DocumentStore>,
        index: Arc<VectorIndex>,
        provider: Box<dyn EmbeddingProvider>,
        embedding: EmbeddingConfig,
        config: QueryConfig,
        default_project: String,
    ) -> Self {
        Self {
            store,
            index,
            provider,
            embedding,
            config,
            default_project,
        }
    }

    /// Semantic search over chunks and extractions together.
    pub async fn search_knowledge(&self, request: &SearchRequest) -> Result<SearchResponse> {
        let started = Instant::now();

        if request.query.trim().is_empty() {
            return Err(Error::Validation("query must not be empty".to_string()));
        }
        let limit = self.resolve_limit(request.limit)?;
        let diversify = request.diversify.unwrap_or(self.config.diversify);

        let filter = self.build_filter(request)?;
        let query_vector = embed_query(self.provider.as_ref(), &self.embedding, &request.query).await?;

        // Over-fetch when diversifying so deduplication by source still
        // fills the requested limit.
        let fetch_limit = if diversify { limit * 4 } else { limit };
        let mut hits = self
            .search_with_retry(&query_vector, &filter, fetch_limit as usize)
            .await?;

        if diversify {
            hits = diversify_by_source(hits);
            hits.truncate(limit as usize);
        }

        let results = self.enrich(&hits).await?;

        let mut sources_cited: Vec<String> =
            results.iter().map(|r| r.source.title.clone()).collect();
        sources_cited.sort();
        sources_cited.dedup();

        debug!(
            query = %request.query,
            results = results.len(),
            "search complete"
        );

        Ok(SearchResponse {
            query: request.query.clone(),
            result_count: results.len(),
            results,
            sources_cited,
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// List stored extractions of one type, paginated, no embedding
    /// involved. `topic` narrows to extractions tagged with it.
    pub async fn get_by_type(
        &self,
        project_id: Option<&str>,
        extraction_type: ExtractionType,
        topic: Option<&str>,
        cursor: Option<&str>,
        page_size: i64,
    ) -> Result<ExtractionPage> {
        let project = project_id.unwrap_or(&self.default_project);
        self.store
            .list_extractions(project, Some(extraction_type), topic, cursor, page_size)
            .await
    }

    /// Group each named source's extractions on a topic, side by side.
    /// A pure document-store operation: nothing is embedded or ranked,
    /// and raw chunks never appear. A source with nothing on the topic
    /// contributes an empty group, not an error.
    pub async fn compare_across_sources(
        &self,
        project_id: Option<&str>,
        topic: &str,
        source_ids: &[String],
    ) -> Result<CompareResponse> {
        let started = Instant::now();

        if topic.trim().is_empty() {
            return Err(Error::Validation("topic must not be empty".to_string()));
        }
        if source_ids.len() < 2 || source_ids.len() > 4 {
            return Err(Error::Validation(format!(
                "comparison requires 2 to 4 sources, got {}",
                source_ids.len()
            )));
        }

        let project = project_id.unwrap_or(&self.default_project);

        // Verify all named sources exist up front.
        let sources = self.store.get_sources_by_ids(project, source_ids).await?;
        for id in source_ids {
            if !sources.contains_key(id) {
                return Err(Error::NotFound(format!(
                    "source '{id}' in project '{project}'"
                )));
            }
        }

        // One batched fetch, then group in input order.
        let all = self
            .store
            .list_extractions_for_sources(project, source_ids, Some(topic))
            .await?;
        let mut grouped: HashMap<String, Vec<Extraction>> = HashMap::new();
        for extraction in all {
            grouped
                .entry(extraction.source_id.clone())
                .or_default()
                .push(extraction);
        }

        let comparisons = source_ids
            .iter()
            .map(|source_id| SourceComparison {
                source_id: source_id.clone(),
                source_title: sources[source_id].title.clone(),
                extractions: grouped.remove(source_id).unwrap_or_default(),
            })
            .collect();

        Ok(CompareResponse {
            topic: topic.to_string(),
            comparisons,
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }

    fn resolve_limit(&self, limit: Option<i64>) -> Result<i64> {
        let limit = limit.unwrap_or(self.config.default_limit);
        if limit < 1 || limit > self.config.max_limit {
            return Err(Error::Validation(format!(
                "limit must be between 1 and {}",
                self.config.max_limit
            )));
        }
        Ok(limit)
    }

    fn build_filter(&self, request: &SearchRequest) -> Result<KnowledgeFilter> {
        let mut filter = if request.cross_project {
            KnowledgeFilter::cross_project()
        } else {
            let project = request
                .project_id
                .as_deref()
                .unwrap_or(&self.default_project);
            KnowledgeFilter::scoped(project)?
        };

        filter.content_type = request.content_type;
        filter.extraction_type = request.extraction_type;
        filter.source_type = request.source_type;
        filter.topics = request.topics.clone();
        filter.year_from = request.year_from;
        filter.year_to = request.year_to;
        filter.chapter = request.chapter.clone();
        Ok(filter)
    }

    /// One retry on transient index failure, then give up.
    async fn search_with_retry(
        &self,
        query_vector: &[f32],
        filter: &KnowledgeFilter,
        limit: usize,
    ) -> Result<Vec<ScoredPoint>> {
        match self.index.search(query_vector, filter, limit).await {
            Err(Error::Upstream(first)) => {
                debug!(error = %first, "index search failed, retrying once");
                self.index.search(query_vector, filter, limit).await
            }
            other => other,
        }
    }

    /// Resolve hit content from the document store with one batched
    /// lookup per (project, content type) pair.
    async fn enrich(&self, hits: &[ScoredPoint]) -> Result<Vec<SearchResult>> {
        let mut chunk_ids: HashMap<String, Vec<String>> = HashMap::new();
        let mut extraction_ids: HashMap<String, Vec<String>> = HashMap::new();

        for hit in hits {
            let bucket = match hit.payload.content_type {
                ContentType::Chunk => &mut chunk_ids,
                ContentType::Extraction => &mut extraction_ids,
            };
            bucket
                .entry(hit.payload.project_id.clone())
                .or_default()
                .push(hit.id.clone());
        }

        let mut chunks = HashMap::new();
        for (project, ids) in &chunk_ids {
            chunks.extend(self.store.get_chunks_by_ids(project, ids).await?);
        }
        let mut extractions: HashMap<String, Extraction> = HashMap::new();
        for (project, ids) in &extraction_ids {
            extractions.extend(self.store.get_extractions_by_ids(project, ids).await?);
        }

        let mut results = Vec::with_capacity(hits.len());
        for hit in hits {
            let payload = &hit.payload;
            let source = SourceRef {
                id: payload.source_id.clone(),
                title: payload.source_title.clone(),
                source_type: payload.source_type,
                year: payload.source_year,
                chapter: payload.chapter.clone(),
                section: payload.section.clone(),
                page: payload.page,
            };

            let (title, content) = match payload.content_type {
                ContentType::Chunk => {
                    // A point whose record has vanished means the index is
                    // stale; skip it rather than fail the whole query.
                    let Some(chunk) = chunks.get(&hit.id) else {
                        debug!(id = %hit.id, "stale index point, skipping");
                        continue;
                    };
                    (None, serde_json::Value::String(chunk.text.clone()))
                }
                ContentType::Extraction => {
                    let Some(extraction) = extractions.get(&hit.id) else {
                        debug!(id = %hit.id, "stale index point, skipping");
                        continue;
                    };
                    (
                        Some(extraction.title.clone()),
                        serde_json::to_value(&extraction.content)?,
                    )
                }
            };

            results.push(SearchResult {
                id: hit.id.clone(),
                score: hit.score,
                project_id: payload.project_id.clone(),
                content_type: payload.content_type,
                extraction_type: payload.extraction_type,
                title,
                content,
                topics: payload.topics.clone(),
                source,
            });
        }

        Ok(results)
    }
}

/// Keep only the best-scoring hit for each source. Input is already
/// ranked, so the first hit seen per source wins.
fn diversify_by_source(hits: Vec<ScoredPoint>) -> Vec<ScoredPoint> {
    let mut seen = std::collections::HashSet::new();
    hits.into_iter()
        .filter(|hit| seen.insert(hit.payload.source_id.clone()))
        .collect()
}
