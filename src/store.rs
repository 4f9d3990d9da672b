//! Document store: durable, queryable storage of canonical records.
//!
//! Sources, chunks, and extractions live in per-project SQLite tables
//! (`{project}_sources`, `{project}_chunks`, `{project}_extractions`),
//! created lazily. Project ids are validated strictly so the dynamic
//! table names are safe to interpolate. No embedding computation
//! happens here; the vector index holds only a derived projection.

use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::Path;

use crate::db;
use crate::error::{Error, Result};
use crate::models::{
    Chunk, ChunkPosition, Extraction, ExtractionContent, ExtractionType, Source, SourceCategory,
    SourceStatus, SourceType,
};

/// Maximum project id length. Project ids become table-name prefixes.
const MAX_PROJECT_ID_LEN: usize = 64;

/// Default page size for extraction listing.
pub const DEFAULT_PAGE_SIZE: i64 = 100;

/// Validate a project/tenant id: lowercase alphanumeric plus underscore,
/// starting with a letter. Anything else is rejected before it can reach
/// a table name.
pub fn validate_project_id(project_id: &str) -> Result<()> {
    let mut chars = project_id.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_lowercase() => chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'),
        _ => false,
    };
    if !valid || project_id.len() > MAX_PROJECT_ID_LEN {
        return Err(Error::Validation(format!(
            "invalid project id '{project_id}': must match [a-z][a-z0-9_]* and be at most {MAX_PROJECT_ID_LEN} chars"
        )));
    }
    Ok(())
}

/// A source together with its chunk/extraction counts, for inventories.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SourceSummary {
    pub id: String,
    pub title: String,
    pub source_type: SourceType,
    pub category: SourceCategory,
    pub year: Option<i64>,
    pub status: SourceStatus,
    pub chunk_count: i64,
    pub extraction_count: i64,
}

/// One page of extraction listing plus the cursor to resume from.
#[derive(Debug)]
pub struct ExtractionPage {
    pub items: Vec<Extraction>,
    /// Pass back as the cursor to fetch the next page; `None` when done.
    pub next_cursor: Option<String>,
}

pub struct DocumentStore {
    pool: SqlitePool,
}

impl DocumentStore {
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect(path).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the per-project tables if they do not exist. Idempotent.
    pub async fn ensure_project(&self, project_id: &str) -> Result<()> {
        validate_project_id(project_id)?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {project_id}_sources (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                authors TEXT NOT NULL DEFAULT '[]',
                source_type TEXT NOT NULL,
                year INTEGER,
                category TEXT NOT NULL,
                tags TEXT NOT NULL DEFAULT '[]',
                path TEXT,
                ingested_at INTEGER NOT NULL,
                status TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{{}}',
                schema_version INTEGER NOT NULL
            )
            "#
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {project_id}_chunks (
                id TEXT PRIMARY KEY,
                source_id TEXT NOT NULL,
                text TEXT NOT NULL,
                token_count INTEGER NOT NULL,
                chapter TEXT,
                section TEXT,
                page INTEGER,
                parent_chunk_id TEXT,
                depth INTEGER NOT NULL DEFAULT 0,
                schema_version INTEGER NOT NULL,
                FOREIGN KEY (source_id) REFERENCES {project_id}_sources(id)
            )
            "#
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {project_id}_extractions (
                id TEXT PRIMARY KEY,
                source_id TEXT NOT NULL,
                chunk_id TEXT NOT NULL,
                extraction_type TEXT NOT NULL,
                content TEXT NOT NULL,
                topics TEXT NOT NULL DEFAULT '[]',
                title TEXT NOT NULL,
                source_title TEXT NOT NULL,
                source_type TEXT NOT NULL,
                chapter TEXT,
                extracted_at INTEGER NOT NULL,
                schema_version INTEGER NOT NULL,
                FOREIGN KEY (source_id) REFERENCES {project_id}_sources(id)
            )
            "#
        ))
        .execute(&self.pool)
        .await?;

        for stmt in [
            format!("CREATE INDEX IF NOT EXISTS idx_{project_id}_chunks_source ON {project_id}_chunks(source_id)"),
            format!("CREATE INDEX IF NOT EXISTS idx_{project_id}_extractions_source ON {project_id}_extractions(source_id)"),
            format!("CREATE INDEX IF NOT EXISTS idx_{project_id}_extractions_type ON {project_id}_extractions(extraction_type)"),
        ] {
            sqlx::query(&stmt).execute(&self.pool).await?;
        }

        Ok(())
    }

    // ============ Sources ============

    /// Store a new source. Fails with `DuplicateId` on id collision
    /// within the project.
    pub async fn create_source(&self, source: &Source) -> Result<()> {
        self.ensure_project(&source.project_id).await?;
        let project = &source.project_id;

        let existing: Option<String> =
            sqlx::query_scalar(&format!("SELECT id FROM {project}_sources WHERE id = ?"))
                .bind(&source.id)
                .fetch_optional(&self.pool)
                .await?;
        if existing.is_some() {
            return Err(Error::DuplicateId(format!(
                "source '{}' already exists in project '{project}'",
                source.id
            )));
        }

        sqlx::query(&format!(
            r#"
            INSERT INTO {project}_sources
                (id, title, authors, source_type, year, category, tags, path, ingested_at, status, metadata, schema_version)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#
        ))
        .bind(&source.id)
        .bind(&source.title)
        .bind(serde_json::to_string(&source.authors)?)
        .bind(source.source_type.as_str())
        .bind(source.year)
        .bind(source.category.as_str())
        .bind(serde_json::to_string(&source.tags)?)
        .bind(&source.path)
        .bind(source.ingested_at.timestamp())
        .bind(source.status.as_str())
        .bind(serde_json::to_string(&source.metadata)?)
        .bind(source.schema_version as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Fetch a source or fail with `NotFound`.
    pub async fn get_source(&self, project_id: &str, id: &str) -> Result<Source> {
        validate_project_id(project_id)?;
        let row = sqlx::query(&format!("SELECT * FROM {project_id}_sources WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!("source '{id}' in project '{project_id}'"))
            })?;
        source_from_row(project_id, &row)
    }

    /// Fetch several sources in one query. Missing ids are simply absent
    /// from the returned map.
    pub async fn get_sources_by_ids(
        &self,
        project_id: &str,
        ids: &[String],
    ) -> Result<HashMap<String, Source>> {
        validate_project_id(project_id)?;
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!("SELECT * FROM {project_id}_sources WHERE id IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }

        let rows = query.fetch_all(&self.pool).await?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in &rows {
            let source = source_from_row(project_id, row)?;
            out.insert(source.id.clone(), source);
        }
        Ok(out)
    }

    /// Advance a source's ingestion status, enforcing the legal
    /// pending → processing → {complete | failed} transitions.
    pub async fn update_source_status(
        &self,
        project_id: &str,
        id: &str,
        next: SourceStatus,
    ) -> Result<()> {
        let source = self.get_source(project_id, id).await?;
        if !source.status.can_transition_to(next) {
            return Err(Error::Validation(format!(
                "illegal status transition {} -> {} for source '{id}'",
                source.status.as_str(),
                next.as_str()
            )));
        }

        sqlx::query(&format!(
            "UPDATE {project_id}_sources SET status = ? WHERE id = ?"
        ))
        .bind(next.as_str())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// List all sources in a project with chunk and extraction counts.
    pub async fn list_sources(&self, project_id: &str) -> Result<Vec<SourceSummary>> {
        self.ensure_project(project_id).await?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT s.id, s.title, s.source_type, s.category, s.year, s.status,
                   (SELECT COUNT(*) FROM {project_id}_chunks c WHERE c.source_id = s.id) AS chunk_count,
                   (SELECT COUNT(*) FROM {project_id}_extractions e WHERE e.source_id = s.id) AS extraction_count
            FROM {project_id}_sources s
            ORDER BY s.ingested_at DESC, s.id ASC
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(SourceSummary {
                    id: row.get("id"),
                    title: row.get("title"),
                    source_type: parse_source_type(&row.get::<String, _>("source_type"))?,
                    category: parse_category(&row.get::<String, _>("category"))?,
                    year: row.get("year"),
                    status: parse_status(&row.get::<String, _>("status"))?,
                    chunk_count: row.get("chunk_count"),
                    extraction_count: row.get("extraction_count"),
                })
            })
            .collect()
    }

    // ============ Chunks ============

    /// All-or-nothing insert of a chunk batch. Every chunk's project id
    /// must match its owning source's project; otherwise the whole batch
    /// fails with `Validation`. Upserts by id, so re-running the same
    /// batch is safe.
    pub async fn bulk_create_chunks(&self, chunks: &[Chunk]) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }

        let project = &chunks[0].project_id;
        validate_project_id(project)?;

        // Resolve the owning sources once per batch, then validate every
        // chunk against the cached set.
        let mut source_ids: Vec<String> = chunks.iter().map(|c| c.source_id.clone()).collect();
        source_ids.sort();
        source_ids.dedup();
        let sources = self.get_sources_by_ids(project, &source_ids).await?;

        for chunk in chunks {
            if &chunk.project_id != project {
                return Err(Error::Validation(format!(
                    "chunk '{}' project '{}' differs from batch project '{project}'",
                    chunk.id, chunk.project_id
                )));
            }
            let source = sources.get(&chunk.source_id).ok_or_else(|| {
                Error::NotFound(format!(
                    "source '{}' in project '{project}'",
                    chunk.source_id
                ))
            })?;
            if source.project_id != chunk.project_id {
                return Err(Error::Validation(format!(
                    "chunk '{}' project '{}' does not match source '{}' project '{}'",
                    chunk.id, chunk.project_id, source.id, source.project_id
                )));
            }
        }

        let mut tx = self.pool.begin().await?;
        for chunk in chunks {
            sqlx::query(&format!(
                r#"
                INSERT INTO {project}_chunks
                    (id, source_id, text, token_count, chapter, section, page, parent_chunk_id, depth, schema_version)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    source_id = excluded.source_id,
                    text = excluded.text,
                    token_count = excluded.token_count,
                    chapter = excluded.chapter,
                    section = excluded.section,
                    page = excluded.page,
                    parent_chunk_id = excluded.parent_chunk_id,
                    depth = excluded.depth,
                    schema_version = excluded.schema_version
                "#
            ))
            .bind(&chunk.id)
            .bind(&chunk.source_id)
            .bind(&chunk.text)
            .bind(chunk.token_count)
            .bind(&chunk.position.chapter)
            .bind(&chunk.position.section)
            .bind(chunk.position.page)
            .bind(&chunk.parent_chunk_id)
            .bind(chunk.depth)
            .bind(chunk.schema_version as i64)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(())
    }

    /// Fetch several chunks in one query.
    pub async fn get_chunks_by_ids(
        &self,
        project_id: &str,
        ids: &[String],
    ) -> Result<HashMap<String, Chunk>> {
        validate_project_id(project_id)?;
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!("SELECT * FROM {project_id}_chunks WHERE id IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }

        let rows = query.fetch_all(&self.pool).await?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in &rows {
            let chunk = chunk_from_row(project_id, row)?;
            out.insert(chunk.id.clone(), chunk);
        }
        Ok(out)
    }

    pub async fn count_chunks(&self, project_id: &str, source_id: &str) -> Result<i64> {
        validate_project_id(project_id)?;
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {project_id}_chunks WHERE source_id = ?"
        ))
        .bind(source_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// All chunks of a project, for reindex sweeps.
    pub async fn list_chunks(&self, project_id: &str) -> Result<Vec<Chunk>> {
        self.ensure_project(project_id).await?;
        let rows = sqlx::query(&format!(
            "SELECT * FROM {project_id}_chunks ORDER BY id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|row| chunk_from_row(project_id, row)).collect()
    }

    // ============ Extractions ============

    /// Upsert an extraction keyed by id.
    pub async fn save_extraction(&self, extraction: &Extraction) -> Result<()> {
        self.ensure_project(&extraction.project_id).await?;
        let project = &extraction.project_id;

        sqlx::query(&format!(
            r#"
            INSERT INTO {project}_extractions
                (id, source_id, chunk_id, extraction_type, content, topics, title, source_title, source_type, chapter, extracted_at, schema_version)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                source_id = excluded.source_id,
                chunk_id = excluded.chunk_id,
                extraction_type = excluded.extraction_type,
                content = excluded.content,
                topics = excluded.topics,
                title = excluded.title,
                source_title = excluded.source_title,
                source_type = excluded.source_type,
                chapter = excluded.chapter,
                extracted_at = excluded.extracted_at,
                schema_version = excluded.schema_version
            "#
        ))
        .bind(&extraction.id)
        .bind(&extraction.source_id)
        .bind(&extraction.chunk_id)
        .bind(extraction.extraction_type().as_str())
        .bind(serde_json::to_string(&extraction.content)?)
        .bind(serde_json::to_string(&extraction.topics)?)
        .bind(&extraction.title)
        .bind(&extraction.source_title)
        .bind(extraction.source_type.as_str())
        .bind(&extraction.chapter)
        .bind(extraction.extracted_at.timestamp())
        .bind(extraction.schema_version as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Fetch several extractions in one query.
    pub async fn get_extractions_by_ids(
        &self,
        project_id: &str,
        ids: &[String],
    ) -> Result<HashMap<String, Extraction>> {
        validate_project_id(project_id)?;
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!("SELECT * FROM {project_id}_extractions WHERE id IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }

        let rows = query.fetch_all(&self.pool).await?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in &rows {
            let extraction = extraction_from_row(project_id, row)?;
            out.insert(extraction.id.clone(), extraction);
        }
        Ok(out)
    }

    /// Keyset-paginated listing of a project's extractions, optionally
    /// filtered by type and topic. Restartable: pass the returned cursor
    /// back to resume. Ordered by id for a stable iteration.
    pub async fn list_extractions(
        &self,
        project_id: &str,
        extraction_type: Option<ExtractionType>,
        topic: Option<&str>,
        cursor: Option<&str>,
        page_size: i64,
    ) -> Result<ExtractionPage> {
        self.ensure_project(project_id).await?;
        let page_size = page_size.clamp(1, 1000);

        let mut sql = format!("SELECT * FROM {project_id}_extractions WHERE 1=1");
        if extraction_type.is_some() {
            sql.push_str(" AND extraction_type = ?");
        }
        if topic.is_some() {
            sql.push_str(" AND EXISTS (SELECT 1 FROM json_each(topics) WHERE json_each.value = ?)");
        }
        if cursor.is_some() {
            sql.push_str(" AND id > ?");
        }
        sql.push_str(" ORDER BY id ASC LIMIT ?");

        let mut query = sqlx::query(&sql);
        if let Some(t) = extraction_type {
            query = query.bind(t.as_str());
        }
        if let Some(t) = topic {
            query = query.bind(t);
        }
        if let Some(c) = cursor {
            query = query.bind(c);
        }
        query = query.bind(page_size + 1);

        let rows = query.fetch_all(&self.pool).await?;
        let mut items: Vec<Extraction> = rows
            .iter()
            .map(|row| extraction_from_row(project_id, row))
            .collect::<Result<_>>()?;

        let next_cursor = if items.len() as i64 > page_size {
            items.truncate(page_size as usize);
            items.last().map(|e| e.id.clone())
        } else {
            None
        };

        Ok(ExtractionPage { items, next_cursor })
    }

    /// Extractions belonging to any of the given sources, optionally
    /// narrowed to a topic, in one query. Ordered by extraction type
    /// then id so side-by-side views line up across sources.
    pub async fn list_extractions_for_sources(
        &self,
        project_id: &str,
        source_ids: &[String],
        topic: Option<&str>,
    ) -> Result<Vec<Extraction>> {
        self.ensure_project(project_id).await?;
        if source_ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; source_ids.len()].join(", ");
        let mut sql = format!(
            "SELECT * FROM {project_id}_extractions WHERE source_id IN ({placeholders})"
        );
        if topic.is_some() {
            sql.push_str(" AND EXISTS (SELECT 1 FROM json_each(topics) WHERE json_each.value = ?)");
        }
        sql.push_str(" ORDER BY extraction_type ASC, id ASC");

        let mut query = sqlx::query(&sql);
        for id in source_ids {
            query = query.bind(id);
        }
        if let Some(t) = topic {
            query = query.bind(t);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| extraction_from_row(project_id, row))
            .collect()
    }

    /// All extractions of a project, for reindex sweeps.
    pub async fn list_all_extractions(&self, project_id: &str) -> Result<Vec<Extraction>> {
        self.ensure_project(project_id).await?;
        let rows = sqlx::query(&format!(
            "SELECT * FROM {project_id}_extractions ORDER BY id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| extraction_from_row(project_id, row))
            .collect()
    }

    // ============ Purge ============

    /// Drop all of a project's tables. The only path that hard-deletes
    /// canonical records.
    pub async fn purge_project(&self, project_id: &str) -> Result<()> {
        validate_project_id(project_id)?;
        for table in ["extractions", "chunks", "sources"] {
            sqlx::query(&format!("DROP TABLE IF EXISTS {project_id}_{table}"))
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }
}

// ============ Row mapping ============

fn parse_source_type(s: &str) -> Result<SourceType> {
    SourceType::parse(s).ok_or_else(|| Error::Internal(format!("corrupt source_type '{s}'")))
}

fn parse_category(s: &str) -> Result<SourceCategory> {
    SourceCategory::parse(s).ok_or_else(|| Error::Internal(format!("corrupt category '{s}'")))
}

fn parse_status(s: &str) -> Result<SourceStatus> {
    SourceStatus::parse(s).ok_or_else(|| Error::Internal(format!("corrupt status '{s}'")))
}

fn timestamp_to_datetime(ts: i64) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

fn source_from_row(project_id: &str, row: &sqlx::sqlite::SqliteRow) -> Result<Source> {
    let authors: Vec<String> = serde_json::from_str(&row.get::<String, _>("authors"))?;
    let tags: Vec<String> = serde_json::from_str(&row.get::<String, _>("tags"))?;
    let metadata: serde_json::Value = serde_json::from_str(&row.get::<String, _>("metadata"))?;

    Ok(Source {
        id: row.get("id"),
        project_id: project_id.to_string(),
        title: row.get("title"),
        authors,
        source_type: parse_source_type(&row.get::<String, _>("source_type"))?,
        year: row.get("year"),
        category: parse_category(&row.get::<String, _>("category"))?,
        tags,
        path: row.get("path"),
        ingested_at: timestamp_to_datetime(row.get("ingested_at")),
        status: parse_status(&row.get::<String, _>("status"))?,
        metadata,
        schema_version: row.get::<i64, _>("schema_version") as u32,
    })
}

fn chunk_from_row(project_id: &str, row: &sqlx::sqlite::SqliteRow) -> Result<Chunk> {
    Ok(Chunk {
        id: row.get("id"),
        source_id: row.get("source_id"),
        project_id: project_id.to_string(),
        text: row.get("text"),
        token_count: row.get("token_count"),
        position: ChunkPosition {
            chapter: row.get("chapter"),
            section: row.get("section"),
            page: row.get("page"),
        },
        parent_chunk_id: row.get("parent_chunk_id"),
        depth: row.get("depth"),
        schema_version: row.get::<i64, _>("schema_version") as u32,
    })
}

fn extraction_from_row(project_id: &str, row: &sqlx::sqlite::SqliteRow) -> Result<Extraction> {
    let content: ExtractionContent = serde_json::from_str(&row.get::<String, _>("content"))?;
    let topics: Vec<String> = serde_json::from_str(&row.get::<String, _>("topics"))?;

    Ok(Extraction {
        id: row.get("id"),
        source_id: row.get("source_id"),
        chunk_id: row.get("chunk_id"),
        project_id: project_id.to_string(),
        content,
        topics,
        title: row.get("title"),
        source_title: row.get("source_title"),
        source_type: parse_source_type(&row.get::<String, _>("source_type"))?,
        chapter: row.get("chapter"),
        extracted_at: timestamp_to_datetime(row.get("extracted_at")),
        schema_version: row.get::<i64, _>("schema_version") as u32,
    })
}
