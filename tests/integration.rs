//! End-to-end tests over the library surface: ingest bundles into
//! temporary stores with the deterministic hash embedder, then exercise
//! search, listing, comparison, and the tenant boundary.

use std::sync::Arc;
use tempfile::TempDir;

use lorekit::auth::{AccessControl, Operation};
use lorekit::config::{ApiKeyEntry, AuthConfig, EmbeddingConfig, QueryConfig, RateLimitConfig};
use lorekit::embedding::create_provider;
use lorekit::indexer::Indexer;
use lorekit::models::{
    Chunk, ChunkPosition, ContentType, Extraction, ExtractionContent, ExtractionType, Source,
    SourceCategory, SourceStatus, SourceType, SCHEMA_VERSION,
};
use lorekit::query::{QueryService, SearchRequest};
use lorekit::store::DocumentStore;
use lorekit::vector::{KnowledgeFilter, VectorIndex};

struct TestEnv {
    _tmp: TempDir,
    store: Arc<DocumentStore>,
    index: Arc<VectorIndex>,
    indexer: Indexer,
    query: QueryService,
}

async fn setup() -> TestEnv {
    let tmp = TempDir::new().unwrap();
    let embedding = EmbeddingConfig::default(); // hash provider, 384 dims

    let store = Arc::new(
        DocumentStore::open(&tmp.path().join("documents.sqlite"))
            .await
            .unwrap(),
    );
    let index = Arc::new(
        VectorIndex::open(&tmp.path().join("vectors.sqlite"), "knowledge_vectors", 384)
            .await
            .unwrap(),
    );

    let indexer = Indexer::new(
        store.clone(),
        index.clone(),
        create_provider(&embedding).unwrap(),
        embedding.clone(),
    );
    let query = QueryService::new(
        store.clone(),
        index.clone(),
        create_provider(&embedding).unwrap(),
        embedding,
        QueryConfig::default(),
        "p1".to_string(),
    );

    TestEnv {
        _tmp: tmp,
        store,
        index,
        indexer,
        query,
    }
}

fn source(project: &str, id: &str, title: &str, year: i64) -> Source {
    Source {
        id: id.to_string(),
        project_id: project.to_string(),
        title: title.to_string(),
        authors: vec![],
        source_type: SourceType::Book,
        year: Some(year),
        category: SourceCategory::Foundational,
        tags: vec!["llm".to_string()],
        path: None,
        ingested_at: chrono::Utc::now(),
        status: SourceStatus::Pending,
        metadata: serde_json::json!({}),
        schema_version: SCHEMA_VERSION,
    }
}

fn chunk(project: &str, source_id: &str, id: &str, text: &str) -> Chunk {
    Chunk {
        id: id.to_string(),
        source_id: source_id.to_string(),
        project_id: project.to_string(),
        text: text.to_string(),
        token_count: text.split_whitespace().count() as i64,
        position: ChunkPosition {
            chapter: Some("1".to_string()),
            section: None,
            page: Some(10),
        },
        parent_chunk_id: None,
        depth: 0,
        schema_version: SCHEMA_VERSION,
    }
}

fn warning(project: &str, source_id: &str, id: &str, title: &str, topics: &[&str]) -> Extraction {
    Extraction {
        id: id.to_string(),
        source_id: source_id.to_string(),
        chunk_id: format!("{source_id}-c1"),
        project_id: project.to_string(),
        content: ExtractionContent::Warning {
            risk: format!("{title} risk"),
            symptoms: vec![],
            mitigation: format!("{title} mitigation"),
        },
        topics: topics.iter().map(|t| t.to_string()).collect(),
        title: title.to_string(),
        source_title: source_id.to_string(),
        source_type: SourceType::Book,
        chapter: Some("1".to_string()),
        extracted_at: chrono::Utc::now(),
        schema_version: SCHEMA_VERSION,
    }
}

/// Ingest one small bundle into a project.
async fn ingest_fixture(env: &TestEnv, project: &str, source_id: &str, year: i64) {
    let src = source(project, source_id, &format!("{source_id} title"), year);
    let chunks = vec![
        chunk(
            project,
            source_id,
            &format!("{source_id}-c1"),
            "Retrieval quality depends on chunking strategy.",
        ),
        chunk(
            project,
            source_id,
            &format!("{source_id}-c2"),
            "Evaluation sets catch regressions before users do.",
        ),
    ];
    let extractions = vec![warning(
        project,
        source_id,
        &format!("{source_id}-e1"),
        "Unmeasured pipelines",
        &["evaluation"],
    )];
    env.indexer
        .ingest_source(&src, &chunks, &extractions)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_ingest_completes_source_and_counts() {
    let env = setup().await;
    ingest_fixture(&env, "p1", "s1", 2024).await;

    let src = env.store.get_source("p1", "s1").await.unwrap();
    assert_eq!(src.status, SourceStatus::Complete);

    let sources = env.store.list_sources("p1").await.unwrap();
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0].chunk_count, 2);
    assert_eq!(sources[0].extraction_count, 1);

    // 2 chunks + 1 extraction in the index
    assert_eq!(env.index.count().await.unwrap(), 3);
}

#[tokio::test]
async fn test_duplicate_source_rejected() {
    let env = setup().await;
    ingest_fixture(&env, "p1", "s1", 2024).await;

    let err = env
        .indexer
        .ingest_source(&source("p1", "s1", "again", 2024), &[], &[])
        .await
        .unwrap_err();
    assert_eq!(err.code(), "DUPLICATE_ID");
}

#[tokio::test]
async fn test_tenant_isolation() {
    let env = setup().await;
    ingest_fixture(&env, "p1", "s1", 2024).await;
    ingest_fixture(&env, "p2", "s2", 2024).await;

    let request = SearchRequest {
        query: "chunking strategy".to_string(),
        project_id: Some("p1".to_string()),
        content_type: None,
        extraction_type: None,
        source_type: None,
        topics: vec![],
        year_from: None,
        year_to: None,
        chapter: None,
        limit: Some(50),
        diversify: None,
        cross_project: false,
    };
    let response = env.query.search_knowledge(&request).await.unwrap();

    assert!(!response.results.is_empty());
    assert!(response.results.iter().all(|r| r.project_id == "p1"));
}

#[tokio::test]
async fn test_cross_project_search_spans_tenants() {
    let env = setup().await;
    ingest_fixture(&env, "p1", "s1", 2024).await;
    ingest_fixture(&env, "p2", "s2", 2024).await;

    let request = SearchRequest {
        query: "chunking strategy".to_string(),
        project_id: None,
        content_type: None,
        extraction_type: None,
        source_type: None,
        topics: vec![],
        year_from: None,
        year_to: None,
        chapter: None,
        limit: Some(50),
        diversify: None,
        cross_project: true,
    };
    let response = env.query.search_knowledge(&request).await.unwrap();

    let mut projects: Vec<&str> = response.results.iter().map(|r| r.project_id.as_str()).collect();
    projects.sort();
    projects.dedup();
    assert_eq!(projects, vec!["p1", "p2"]);
}

#[tokio::test]
async fn test_filters_are_conjunctive() {
    let env = setup().await;
    ingest_fixture(&env, "p1", "s1", 2020).await;
    ingest_fixture(&env, "p1", "s2", 2025).await;

    // Type + year range together
    let request = SearchRequest {
        query: "pipelines".to_string(),
        project_id: Some("p1".to_string()),
        content_type: Some(ContentType::Extraction),
        extraction_type: Some(ExtractionType::Warning),
        source_type: None,
        topics: vec!["evaluation".to_string()],
        year_from: Some(2024),
        year_to: None,
        chapter: None,
        limit: Some(50),
        diversify: None,
        cross_project: false,
    };
    let response = env.query.search_knowledge(&request).await.unwrap();

    assert_eq!(response.results.len(), 1);
    let result = &response.results[0];
    assert_eq!(result.content_type, ContentType::Extraction);
    assert_eq!(result.extraction_type, Some(ExtractionType::Warning));
    assert_eq!(result.source.id, "s2");
}

#[tokio::test]
async fn test_reindex_is_idempotent() {
    let env = setup().await;
    ingest_fixture(&env, "p1", "s1", 2024).await;

    let before = env.index.count().await.unwrap();
    let summary = env.indexer.reindex_project("p1").await.unwrap();
    assert_eq!(summary.chunks_indexed, 2);
    assert_eq!(summary.extractions_indexed, 1);
    assert_eq!(env.index.count().await.unwrap(), before);

    // Reindexing one project leaves others untouched
    ingest_fixture(&env, "p2", "s2", 2024).await;
    env.indexer.reindex_project("p1").await.unwrap();
    let filter = KnowledgeFilter::scoped("p2").unwrap();
    let vector = vec![0.0f32; 384];
    // Score is irrelevant; only presence matters
    let hits = env.index.search(&vector, &filter, 10).await.unwrap();
    assert_eq!(hits.len(), 3);
}

#[tokio::test]
async fn test_diversify_one_hit_per_source() {
    let env = setup().await;
    ingest_fixture(&env, "p1", "s1", 2024).await;
    ingest_fixture(&env, "p1", "s2", 2024).await;

    let request = SearchRequest {
        query: "evaluation".to_string(),
        project_id: Some("p1".to_string()),
        content_type: None,
        extraction_type: None,
        source_type: None,
        topics: vec![],
        year_from: None,
        year_to: None,
        chapter: None,
        limit: Some(10),
        diversify: Some(true),
        cross_project: false,
    };
    let response = env.query.search_knowledge(&request).await.unwrap();

    let mut sources: Vec<&str> = response.results.iter().map(|r| r.source.id.as_str()).collect();
    sources.sort();
    assert_eq!(sources, vec!["s1", "s2"]);
}

#[tokio::test]
async fn test_limit_validation() {
    let env = setup().await;
    let mut request = SearchRequest {
        query: "x".to_string(),
        project_id: Some("p1".to_string()),
        content_type: None,
        extraction_type: None,
        source_type: None,
        topics: vec![],
        year_from: None,
        year_to: None,
        chapter: None,
        limit: Some(0),
        diversify: None,
        cross_project: false,
    };
    let err = env.query.search_knowledge(&request).await.unwrap_err();
    assert_eq!(err.code(), "VALIDATION_ERROR");

    request.limit = Some(51); // above QueryConfig::default() max
    let err = env.query.search_knowledge(&request).await.unwrap_err();
    assert_eq!(err.code(), "VALIDATION_ERROR");

    request.limit = Some(10);
    request.query = "   ".to_string();
    let err = env.query.search_knowledge(&request).await.unwrap_err();
    assert_eq!(err.code(), "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_get_by_type_pagination() {
    let env = setup().await;
    let src = source("p1", "s1", "s1 title", 2024);
    let chunks = vec![chunk("p1", "s1", "s1-c1", "text")];
    let extractions: Vec<Extraction> = (0..5)
        .map(|i| warning("p1", "s1", &format!("s1-e{i}"), &format!("W{i}"), &["eval"]))
        .collect();
    env.indexer
        .ingest_source(&src, &chunks, &extractions)
        .await
        .unwrap();

    let page1 = env
        .query
        .get_by_type(Some("p1"), ExtractionType::Warning, None, None, 2)
        .await
        .unwrap();
    assert_eq!(page1.items.len(), 2);
    let cursor = page1.next_cursor.expect("more pages");

    let page2 = env
        .query
        .get_by_type(Some("p1"), ExtractionType::Warning, None, Some(&cursor), 2)
        .await
        .unwrap();
    assert_eq!(page2.items.len(), 2);
    assert!(page2.items.iter().all(|e| e.id > cursor));

    // Topic filter narrows to nothing for an unused topic
    let empty = env
        .query
        .get_by_type(Some("p1"), ExtractionType::Warning, Some("absent"), None, 10)
        .await
        .unwrap();
    assert!(empty.items.is_empty());
    assert!(empty.next_cursor.is_none());

    // Pattern listing is empty; only warnings were stored
    let patterns = env
        .query
        .get_by_type(Some("p1"), ExtractionType::Pattern, None, None, 10)
        .await
        .unwrap();
    assert!(patterns.items.is_empty());
}

#[tokio::test]
async fn test_compare_groups_extractions_only_no_ranking() {
    let env = setup().await;
    // Each fixture carries 2 chunks and 1 topic-tagged extraction;
    // chunks must never leak into a comparison.
    ingest_fixture(&env, "p1", "s1", 2024).await;
    ingest_fixture(&env, "p1", "s2", 2024).await;

    let response = env
        .query
        .compare_across_sources(
            Some("p1"),
            "evaluation",
            &["s1".to_string(), "s2".to_string()],
        )
        .await
        .unwrap();

    assert_eq!(response.topic, "evaluation");
    assert_eq!(response.comparisons.len(), 2);
    for comparison in &response.comparisons {
        assert_eq!(comparison.extractions.len(), 1);
        assert!(comparison
            .extractions
            .iter()
            .all(|e| e.source_id == comparison.source_id));
        assert!(comparison
            .extractions
            .iter()
            .all(|e| e.topics.contains(&"evaluation".to_string())));
    }

    // A topic nobody covers yields empty groups, not an error.
    let empty = env
        .query
        .compare_across_sources(
            Some("p1"),
            "quantum_gardening",
            &["s1".to_string(), "s2".to_string()],
        )
        .await
        .unwrap();
    assert!(empty.comparisons.iter().all(|c| c.extractions.is_empty()));
}

#[tokio::test]
async fn test_compare_input_bounds() {
    let env = setup().await;
    ingest_fixture(&env, "p1", "s1", 2024).await;
    ingest_fixture(&env, "p1", "s2", 2024).await;

    // One source is too few
    let err = env
        .query
        .compare_across_sources(Some("p1"), "evaluation", &["s1".to_string()])
        .await
        .unwrap_err();
    assert_eq!(err.code(), "VALIDATION_ERROR");

    // A blank topic is rejected
    let err = env
        .query
        .compare_across_sources(
            Some("p1"),
            "  ",
            &["s1".to_string(), "s2".to_string()],
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "VALIDATION_ERROR");

    // A missing source is NotFound
    let err = env
        .query
        .compare_across_sources(
            Some("p1"),
            "evaluation",
            &["s1".to_string(), "ghost".to_string()],
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "NOT_FOUND");
}

#[tokio::test]
async fn test_failed_ingestion_keeps_root_cause_and_marks_source() {
    let env = setup().await;
    let src = source("p1", "s1", "s1 title", 2024);
    let chunks = vec![chunk("p1", "s1", "s1-c1", "some text")];
    // Blank title and content make the embedding input empty, which
    // fails after the store writes have landed.
    let bad = Extraction {
        id: "s1-e1".to_string(),
        source_id: "s1".to_string(),
        chunk_id: "s1-c1".to_string(),
        project_id: "p1".to_string(),
        content: ExtractionContent::Warning {
            risk: "".to_string(),
            symptoms: vec![],
            mitigation: "".to_string(),
        },
        topics: vec![],
        title: "".to_string(),
        source_title: "s1 title".to_string(),
        source_type: SourceType::Book,
        chapter: None,
        extracted_at: chrono::Utc::now(),
        schema_version: SCHEMA_VERSION,
    };

    let err = env
        .indexer
        .ingest_source(&src, &chunks, &[bad])
        .await
        .unwrap_err();
    assert_eq!(err.code(), "VALIDATION_ERROR");

    let stored = env.store.get_source("p1", "s1").await.unwrap();
    assert_eq!(stored.status, SourceStatus::Failed);
}

#[tokio::test]
async fn test_purge_removes_project_everywhere() {
    let env = setup().await;
    ingest_fixture(&env, "p1", "s1", 2024).await;
    ingest_fixture(&env, "p2", "s2", 2024).await;

    let removed = env.indexer.purge_project("p1").await.unwrap();
    assert_eq!(removed, 3);

    env.store.get_source("p1", "s1").await.unwrap_err();

    // p2 untouched
    env.store.get_source("p2", "s2").await.unwrap();
    assert_eq!(env.index.count().await.unwrap(), 3);
}

#[test]
fn test_tier_gating_over_operations() {
    let access = AccessControl::new(
        &AuthConfig {
            keys: vec![
                ApiKeyEntry {
                    key: "reg".to_string(),
                    tier: "registered".to_string(),
                    disabled: false,
                },
                ApiKeyEntry {
                    key: "prem".to_string(),
                    tier: "premium".to_string(),
                    disabled: false,
                },
            ],
        },
        RateLimitConfig::default(),
    )
    .unwrap();

    // Public may search and read raw reference types
    access
        .authorize(None, "10.0.0.1", Operation::SearchKnowledge)
        .unwrap();
    access
        .authorize(
            None,
            "10.0.0.1",
            Operation::GetByType(ExtractionType::Decision),
        )
        .unwrap();

    // Synthesized views need registration
    let err = access
        .authorize(
            None,
            "10.0.0.1",
            Operation::GetByType(ExtractionType::Methodology),
        )
        .unwrap_err();
    assert_eq!(err.code(), "FORBIDDEN");
    access
        .authorize(
            Some("reg"),
            "10.0.0.1",
            Operation::GetByType(ExtractionType::Methodology),
        )
        .unwrap();

    // Cross-project is premium only
    let err = access
        .authorize(Some("reg"), "10.0.0.1", Operation::CrossProjectSearch)
        .unwrap_err();
    assert_eq!(err.code(), "FORBIDDEN");
    access
        .authorize(Some("prem"), "10.0.0.1", Operation::CrossProjectSearch)
        .unwrap();

    // Unknown keys are rejected, not downgraded
    let err = access
        .authorize(Some("bogus"), "10.0.0.1", Operation::SearchKnowledge)
        .unwrap_err();
    assert_eq!(err.code(), "UNAUTHORIZED");
}
