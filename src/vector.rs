//! Vector index: nearest-neighbor search over one shared collection.
//!
//! All projects share a single table; isolation is enforced purely by
//! the mandatory tenant filter, so every query path must build its
//! filter through [`KnowledgeFilter`] — the one chokepoint that either
//! scopes to a project or records an explicit cross-project opt-in.
//!
//! Vectors are stored as little-endian f32 BLOBs and scored with cosine
//! similarity in Rust after the SQL payload filter has narrowed the
//! candidate set. Ties are broken by most-recent `indexed_at`, then id,
//! so result order is always deterministic.

use sqlx::{Row, SqlitePool};
use std::path::Path;

use crate::db;
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::{Error, Result};
use crate::models::{
    ContentType, ExtractionType, ScoredPoint, SourceCategory, SourceType, VectorPayload,
    VectorPoint,
};
use crate::store::validate_project_id;

/// Filter specification for a vector search: a conjunction of payload
/// conditions. Construct via [`KnowledgeFilter::scoped`] (tenant filter
/// always attached) or [`KnowledgeFilter::cross_project`] (explicit
/// opt-in; the project condition is omitted entirely, never wildcarded).
#[derive(Debug, Clone, Default)]
pub struct KnowledgeFilter {
    project_id: Option<String>,
    pub content_type: Option<ContentType>,
    pub extraction_type: Option<ExtractionType>,
    pub source_id: Option<String>,
    pub source_type: Option<SourceType>,
    pub source_category: Option<SourceCategory>,
    /// Any-of match against the payload topic list.
    pub topics: Vec<String>,
    pub year_from: Option<i64>,
    pub year_to: Option<i64>,
    pub chapter: Option<String>,
}

impl KnowledgeFilter {
    /// A filter scoped to one project. This is the normal path.
    pub fn scoped(project_id: &str) -> Result<Self> {
        validate_project_id(project_id)?;
        Ok(Self {
            project_id: Some(project_id.to_string()),
            ..Self::default()
        })
    }

    /// A filter spanning all projects. Callers must opt in explicitly;
    /// there is no way to reach this by leaving a field unset.
    pub fn cross_project() -> Self {
        Self::default()
    }

    pub fn project_id(&self) -> Option<&str> {
        self.project_id.as_deref()
    }

    /// Render the conjunction as a SQL WHERE clause over whitelisted
    /// payload columns, returning the clause and its bind values.
    fn to_sql(&self) -> (String, Vec<String>) {
        let mut clauses: Vec<String> = Vec::new();
        let mut binds: Vec<String> = Vec::new();

        if let Some(ref project) = self.project_id {
            clauses.push("project_id = ?".to_string());
            binds.push(project.clone());
        }
        if let Some(ct) = self.content_type {
            clauses.push("content_type = ?".to_string());
            binds.push(ct.as_str().to_string());
        }
        if let Some(et) = self.extraction_type {
            clauses.push("extraction_type = ?".to_string());
            binds.push(et.as_str().to_string());
        }
        if let Some(ref sid) = self.source_id {
            clauses.push("source_id = ?".to_string());
            binds.push(sid.clone());
        }
        if let Some(st) = self.source_type {
            clauses.push("source_type = ?".to_string());
            binds.push(st.as_str().to_string());
        }
        if let Some(sc) = self.source_category {
            clauses.push("source_category = ?".to_string());
            binds.push(sc.as_str().to_string());
        }
        if !self.topics.is_empty() {
            let placeholders = vec!["?"; self.topics.len()].join(", ");
            clauses.push(format!(
                "EXISTS (SELECT 1 FROM json_each(topics) WHERE json_each.value IN ({placeholders}))"
            ));
            binds.extend(self.topics.iter().cloned());
        }
        if let Some(from) = self.year_from {
            clauses.push("source_year >= ?".to_string());
            binds.push(from.to_string());
        }
        if let Some(to) = self.year_to {
            clauses.push("source_year <= ?".to_string());
            binds.push(to.to_string());
        }
        if let Some(ref chapter) = self.chapter {
            clauses.push("chapter = ?".to_string());
            binds.push(chapter.clone());
        }

        if clauses.is_empty() {
            ("1=1".to_string(), binds)
        } else {
            (clauses.join(" AND "), binds)
        }
    }
}

pub struct VectorIndex {
    pool: SqlitePool,
    collection: String,
    dims: usize,
}

impl VectorIndex {
    /// Open the index and ensure the shared collection exists with the
    /// given dimension. Idempotent; fails with `Validation` when the
    /// stored dimension disagrees.
    pub async fn open(path: &Path, collection: &str, dims: usize) -> Result<Self> {
        if dims == 0 {
            return Err(Error::Validation("vector dimension must be > 0".to_string()));
        }
        // Collection names share the project-id alphabet.
        validate_project_id(collection)?;

        let pool = db::connect(path).await?;
        let index = Self {
            pool,
            collection: collection.to_string(),
            dims,
        };
        index.ensure_collection().await?;
        Ok(index)
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    async fn ensure_collection(&self) -> Result<()> {
        let collection = &self.collection;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {collection} (
                id TEXT PRIMARY KEY,
                embedding BLOB NOT NULL,
                project_id TEXT NOT NULL,
                content_type TEXT NOT NULL,
                source_id TEXT NOT NULL,
                source_type TEXT NOT NULL,
                source_category TEXT NOT NULL,
                source_year INTEGER,
                extraction_type TEXT,
                topics TEXT NOT NULL DEFAULT '[]',
                chapter TEXT,
                source_title TEXT NOT NULL,
                extraction_title TEXT,
                section TEXT,
                page INTEGER,
                indexed_at INTEGER NOT NULL
            )
            "#
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {collection}_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#
        ))
        .execute(&self.pool)
        .await?;

        // Every filterable field gets an index; project_id first since it
        // partitions the whole collection.
        for column in [
            "project_id",
            "content_type",
            "source_id",
            "source_type",
            "source_category",
            "source_year",
            "extraction_type",
            "chapter",
        ] {
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS idx_{collection}_{column} ON {collection}({column})"
            ))
            .execute(&self.pool)
            .await?;
        }

        // Record the collection dimension and refuse to reopen with a
        // different one: mixed-dimension vectors make scores meaningless.
        let stored: Option<String> = sqlx::query_scalar(&format!(
            "SELECT value FROM {collection}_meta WHERE key = 'dims'"
        ))
        .fetch_optional(&self.pool)
        .await?;

        match stored {
            Some(value) => {
                let stored_dims: usize = value
                    .parse()
                    .map_err(|_| Error::Internal(format!("corrupt dims metadata '{value}'")))?;
                if stored_dims != self.dims {
                    return Err(Error::Validation(format!(
                        "collection '{collection}' has dimension {stored_dims}, requested {}",
                        self.dims
                    )));
                }
            }
            None => {
                sqlx::query(&format!(
                    "INSERT INTO {collection}_meta (key, value) VALUES ('dims', ?)"
                ))
                .bind(self.dims.to_string())
                .execute(&self.pool)
                .await?;
            }
        }

        Ok(())
    }

    /// Insert or overwrite a point by id.
    pub async fn upsert(&self, point: &VectorPoint) -> Result<()> {
        if point.vector.len() != self.dims {
            return Err(Error::Validation(format!(
                "vector for '{}' has dimension {}, collection expects {}",
                point.id,
                point.vector.len(),
                self.dims
            )));
        }

        let collection = &self.collection;
        let payload = &point.payload;

        sqlx::query(&format!(
            r#"
            INSERT INTO {collection}
                (id, embedding, project_id, content_type, source_id, source_type, source_category,
                 source_year, extraction_type, topics, chapter, source_title, extraction_title,
                 section, page, indexed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                embedding = excluded.embedding,
                project_id = excluded.project_id,
                content_type = excluded.content_type,
                source_id = excluded.source_id,
                source_type = excluded.source_type,
                source_category = excluded.source_category,
                source_year = excluded.source_year,
                extraction_type = excluded.extraction_type,
                topics = excluded.topics,
                chapter = excluded.chapter,
                source_title = excluded.source_title,
                extraction_title = excluded.extraction_title,
                section = excluded.section,
                page = excluded.page,
                indexed_at = excluded.indexed_at
            "#
        ))
        .bind(&point.id)
        .bind(vec_to_blob(&point.vector))
        .bind(&payload.project_id)
        .bind(payload.content_type.as_str())
        .bind(&payload.source_id)
        .bind(payload.source_type.as_str())
        .bind(payload.source_category.as_str())
        .bind(payload.source_year)
        .bind(payload.extraction_type.map(|t| t.as_str()))
        .bind(serde_json::to_string(&payload.topics)?)
        .bind(&payload.chapter)
        .bind(&payload.source_title)
        .bind(&payload.extraction_title)
        .bind(&payload.section)
        .bind(payload.page)
        .bind(payload.indexed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Ranked nearest-neighbor search under the filter conjunction.
    /// Returns up to `limit` hits; zero hits is a normal empty result.
    pub async fn search(
        &self,
        query_vector: &[f32],
        filter: &KnowledgeFilter,
        limit: usize,
    ) -> Result<Vec<ScoredPoint>> {
        if query_vector.len() != self.dims {
            return Err(Error::Validation(format!(
                "query vector has dimension {}, collection expects {}",
                query_vector.len(),
                self.dims
            )));
        }

        let collection = &self.collection;
        let (where_clause, binds) = filter.to_sql();

        let sql = format!("SELECT * FROM {collection} WHERE {where_clause}");
        let mut query = sqlx::query(&sql);
        for value in &binds {
            query = query.bind(value);
        }

        let rows = query.fetch_all(&self.pool).await?;

        let mut hits: Vec<ScoredPoint> = Vec::with_capacity(rows.len());
        for row in &rows {
            let blob: Vec<u8> = row.get("embedding");
            let vector = blob_to_vec(&blob);
            let score = cosine_similarity(query_vector, &vector);
            hits.push(ScoredPoint {
                id: row.get("id"),
                score,
                payload: payload_from_row(row)?,
            });
        }

        // Score desc, then most-recent indexed_at, then id asc.
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.payload.indexed_at.cmp(&a.payload.indexed_at))
                .then(a.id.cmp(&b.id))
        });
        hits.truncate(limit);

        Ok(hits)
    }

    /// Remove every point owned by a source. Used when a source is purged.
    pub async fn delete_by_source(&self, project_id: &str, source_id: &str) -> Result<u64> {
        let collection = &self.collection;
        let result = sqlx::query(&format!(
            "DELETE FROM {collection} WHERE project_id = ? AND source_id = ?"
        ))
        .bind(project_id)
        .bind(source_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Remove every point in a project. Used by project purge.
    pub async fn delete_project(&self, project_id: &str) -> Result<u64> {
        let collection = &self.collection;
        let result = sqlx::query(&format!("DELETE FROM {collection} WHERE project_id = ?"))
            .bind(project_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Total points in the shared collection, across all projects.
    pub async fn count(&self) -> Result<i64> {
        let collection = &self.collection;
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {collection}"))
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

fn payload_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<VectorPayload> {
    let content_type_raw: String = row.get("content_type");
    let content_type = ContentType::parse(&content_type_raw)
        .ok_or_else(|| Error::Internal(format!("corrupt content_type '{content_type_raw}'")))?;

    let source_type_raw: String = row.get("source_type");
    let source_type = SourceType::parse(&source_type_raw)
        .ok_or_else(|| Error::Internal(format!("corrupt source_type '{source_type_raw}'")))?;

    let category_raw: String = row.get("source_category");
    let source_category = SourceCategory::parse(&category_raw)
        .ok_or_else(|| Error::Internal(format!("corrupt source_category '{category_raw}'")))?;

    let extraction_type = match row.get::<Option<String>, _>("extraction_type") {
        Some(raw) => Some(
            ExtractionType::parse(&raw)
                .ok_or_else(|| Error::Internal(format!("corrupt extraction_type '{raw}'")))?,
        ),
        None => None,
    };

    let topics: Vec<String> = serde_json::from_str(&row.get::<String, _>("topics"))?;

    Ok(VectorPayload {
        project_id: row.get("project_id"),
        content_type,
        source_id: row.get("source_id"),
        source_type,
        source_category,
        source_year: row.get("source_year"),
        extraction_type,
        topics,
        chapter: row.get("chapter"),
        source_title: row.get("source_title"),
        extraction_title: row.get("extraction_title"),
        section: row.get("section"),
        page: row.get("page"),
        indexed_at: row.get("indexed_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoped_filter_always_binds_project() {
        let filter = KnowledgeFilter::scoped("p1").unwrap();
        let (clause, binds) = filter.to_sql();
        assert!(clause.starts_with("project_id = ?"));
        assert_eq!(binds, vec!["p1".to_string()]);
    }

    #[test]
    fn test_cross_project_filter_omits_project_condition() {
        let filter = KnowledgeFilter::cross_project();
        let (clause, binds) = filter.to_sql();
        assert!(!clause.contains("project_id"));
        assert!(binds.is_empty());
    }

    #[test]
    fn test_filter_conjunction_renders_all_conditions() {
        let mut filter = KnowledgeFilter::scoped("p1").unwrap();
        filter.content_type = Some(ContentType::Extraction);
        filter.extraction_type = Some(ExtractionType::Warning);
        filter.topics = vec!["embedding".to_string(), "rag".to_string()];
        filter.year_from = Some(2020);
        filter.year_to = Some(2024);

        let (clause, binds) = filter.to_sql();
        assert!(clause.contains("project_id = ?"));
        assert!(clause.contains("content_type = ?"));
        assert!(clause.contains("extraction_type = ?"));
        assert!(clause.contains("json_each"));
        assert!(clause.contains("source_year >= ?"));
        assert!(clause.contains("source_year <= ?"));
        // project + content_type + extraction_type + 2 topics + 2 years
        assert_eq!(binds.len(), 7);
    }

    #[test]
    fn test_scoped_rejects_bad_project_id() {
        assert!(KnowledgeFilter::scoped("x; DROP TABLE y").is_err());
    }
}
