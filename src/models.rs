//! Core data models for the knowledge store.
//!
//! These types represent the canonical records (sources, chunks,
//! extractions) owned by the document store, and the denormalized
//! vector payload projected into the shared vector index.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current schema version stamped on every persisted record.
pub const SCHEMA_VERSION: u32 = 1;

// ============ Enumerations ============

/// Kind of ingested document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Book,
    Paper,
    CaseStudy,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Book => "book",
            Self::Paper => "paper",
            Self::CaseStudy => "case_study",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "book" => Some(Self::Book),
            "paper" => Some(Self::Paper),
            "case_study" => Some(Self::CaseStudy),
            _ => None,
        }
    }
}

/// Editorial category of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceCategory {
    Foundational,
    Advanced,
    Reference,
    CaseStudy,
}

impl SourceCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Foundational => "foundational",
            Self::Advanced => "advanced",
            Self::Reference => "reference",
            Self::CaseStudy => "case_study",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "foundational" => Some(Self::Foundational),
            "advanced" => Some(Self::Advanced),
            "reference" => Some(Self::Reference),
            "case_study" => Some(Self::CaseStudy),
            _ => None,
        }
    }
}

/// Ingestion lifecycle of a source.
///
/// Legal transitions: pending → processing → {complete | failed}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Pending,
    Processing,
    Complete,
    Failed,
}

impl SourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "complete" => Some(Self::Complete),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether a transition to `next` is legal.
    pub fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Processing, Self::Complete)
                | (Self::Processing, Self::Failed)
        )
    }
}

/// Discriminant for the two kinds of content indexed together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Chunk,
    Extraction,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chunk => "chunk",
            Self::Extraction => "extraction",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "chunk" => Some(Self::Chunk),
            "extraction" => Some(Self::Extraction),
            _ => None,
        }
    }
}

/// The seven structured knowledge kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionType {
    Decision,
    Pattern,
    Warning,
    Methodology,
    Checklist,
    Persona,
    Workflow,
}

impl ExtractionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Decision => "decision",
            Self::Pattern => "pattern",
            Self::Warning => "warning",
            Self::Methodology => "methodology",
            Self::Checklist => "checklist",
            Self::Persona => "persona",
            Self::Workflow => "workflow",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "decision" => Some(Self::Decision),
            "pattern" => Some(Self::Pattern),
            "warning" => Some(Self::Warning),
            "methodology" => Some(Self::Methodology),
            "checklist" => Some(Self::Checklist),
            "persona" => Some(Self::Persona),
            "workflow" => Some(Self::Workflow),
            _ => None,
        }
    }
}

// ============ Canonical records ============

/// Top-level ingested document (book, paper, case study).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub project_id: String,
    pub title: String,
    #[serde(default)]
    pub authors: Vec<String>,
    pub source_type: SourceType,
    #[serde(default)]
    pub year: Option<i64>,
    pub category: SourceCategory,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default = "Utc::now")]
    pub ingested_at: DateTime<Utc>,
    #[serde(default = "default_status")]
    pub status: SourceStatus,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

fn default_status() -> SourceStatus {
    SourceStatus::Pending
}

/// Structural position of a chunk within its source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkPosition {
    #[serde(default)]
    pub chapter: Option<String>,
    #[serde(default)]
    pub section: Option<String>,
    #[serde(default)]
    pub page: Option<i64>,
}

/// A contiguous span of raw text extracted from a source.
///
/// Immutable once written; re-ingestion creates new chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub source_id: String,
    /// Denormalized from the owning source; must match it.
    pub project_id: String,
    pub text: String,
    pub token_count: i64,
    #[serde(default)]
    pub position: ChunkPosition,
    /// Parent chunk for hierarchical chunking, if any.
    #[serde(default)]
    pub parent_chunk_id: Option<String>,
    #[serde(default)]
    pub depth: i64,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
}

/// Type-specific content of an extraction. Exactly one shape per record,
/// discriminated by the `type` tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExtractionContent {
    Decision {
        context: String,
        choice: String,
        rationale: String,
        #[serde(default)]
        tradeoffs: Vec<String>,
    },
    Pattern {
        problem: String,
        solution: String,
        #[serde(default)]
        applicability: Option<String>,
        #[serde(default)]
        examples: Vec<String>,
    },
    Warning {
        risk: String,
        #[serde(default)]
        symptoms: Vec<String>,
        mitigation: String,
    },
    Methodology {
        goal: String,
        steps: Vec<String>,
        #[serde(default)]
        prerequisites: Vec<String>,
    },
    Checklist {
        purpose: String,
        items: Vec<String>,
    },
    Persona {
        role: String,
        #[serde(default)]
        goals: Vec<String>,
        #[serde(default)]
        pain_points: Vec<String>,
    },
    Workflow {
        trigger: String,
        stages: Vec<String>,
        #[serde(default)]
        outputs: Vec<String>,
    },
}

impl ExtractionContent {
    /// The type tag matching this content shape.
    pub fn extraction_type(&self) -> ExtractionType {
        match self {
            Self::Decision { .. } => ExtractionType::Decision,
            Self::Pattern { .. } => ExtractionType::Pattern,
            Self::Warning { .. } => ExtractionType::Warning,
            Self::Methodology { .. } => ExtractionType::Methodology,
            Self::Checklist { .. } => ExtractionType::Checklist,
            Self::Persona { .. } => ExtractionType::Persona,
            Self::Workflow { .. } => ExtractionType::Workflow,
        }
    }

    /// Primary prose of the content, used together with the title as the
    /// embedding input for structured extractions.
    pub fn summary(&self) -> String {
        match self {
            Self::Decision {
                context,
                choice,
                rationale,
                ..
            } => format!("{context} {choice} {rationale}"),
            Self::Pattern {
                problem, solution, ..
            } => format!("{problem} {solution}"),
            Self::Warning {
                risk, mitigation, ..
            } => format!("{risk} {mitigation}"),
            Self::Methodology { goal, steps, .. } => {
                format!("{goal} {}", steps.join(" "))
            }
            Self::Checklist { purpose, items } => {
                format!("{purpose} {}", items.join(" "))
            }
            Self::Persona { role, goals, .. } => {
                format!("{role} {}", goals.join(" "))
            }
            Self::Workflow {
                trigger, stages, ..
            } => format!("{trigger} {}", stages.join(" ")),
        }
    }
}

/// A structured knowledge item derived from one chunk.
///
/// Immutable; re-extraction supersedes but never mutates in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Extraction {
    pub id: String,
    pub source_id: String,
    pub chunk_id: String,
    pub project_id: String,
    #[serde(flatten)]
    pub content: ExtractionContent,
    #[serde(default)]
    pub topics: Vec<String>,
    pub title: String,
    /// Denormalized from the owning source for display without a join.
    pub source_title: String,
    pub source_type: SourceType,
    #[serde(default)]
    pub chapter: Option<String>,
    #[serde(default = "Utc::now")]
    pub extracted_at: DateTime<Utc>,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
}

impl Extraction {
    pub fn extraction_type(&self) -> ExtractionType {
        self.content.extraction_type()
    }

    /// Text embedded for this extraction: title plus content summary.
    pub fn embedding_text(&self) -> String {
        format!("{} {}", self.title, self.content.summary())
    }
}

// ============ Vector index projection ============

/// Non-vector metadata attached to a point in the shared collection.
///
/// `project_id` is the tenant partition key and is always present.
/// The remaining fields split into filterable attributes and
/// display-only fields resolved without a document-store lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorPayload {
    // Tenant partition key and filterable attributes
    pub project_id: String,
    pub content_type: ContentType,
    pub source_id: String,
    pub source_type: SourceType,
    pub source_category: SourceCategory,
    #[serde(default)]
    pub source_year: Option<i64>,
    #[serde(default)]
    pub extraction_type: Option<ExtractionType>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub chapter: Option<String>,

    // Display-only fields
    pub source_title: String,
    #[serde(default)]
    pub extraction_title: Option<String>,
    #[serde(default)]
    pub section: Option<String>,
    #[serde(default)]
    pub page: Option<i64>,

    /// Unix timestamp of the most recent upsert; tie-break key.
    pub indexed_at: i64,
}

/// An indexed embedding entry, one per chunk or extraction.
#[derive(Debug, Clone)]
pub struct VectorPoint {
    /// Mirrors the chunk or extraction id.
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: VectorPayload,
}

/// A ranked hit returned from the vector index.
#[derive(Debug, Clone)]
pub struct ScoredPoint {
    pub id: String,
    pub score: f32,
    pub payload: VectorPayload,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        assert!(SourceStatus::Pending.can_transition_to(SourceStatus::Processing));
        assert!(SourceStatus::Processing.can_transition_to(SourceStatus::Complete));
        assert!(SourceStatus::Processing.can_transition_to(SourceStatus::Failed));
        assert!(!SourceStatus::Pending.can_transition_to(SourceStatus::Complete));
        assert!(!SourceStatus::Complete.can_transition_to(SourceStatus::Processing));
        assert!(!SourceStatus::Failed.can_transition_to(SourceStatus::Pending));
    }

    #[test]
    fn test_extraction_content_tag_matches_type() {
        let content = ExtractionContent::Warning {
            risk: "model migration breaks stored vectors".to_string(),
            symptoms: vec!["scores collapse".to_string()],
            mitigation: "reindex after switching models".to_string(),
        };
        assert_eq!(content.extraction_type(), ExtractionType::Warning);

        let json = serde_json::to_value(&content).unwrap();
        assert_eq!(json["type"], "warning");

        let back: ExtractionContent = serde_json::from_value(json).unwrap();
        assert_eq!(back.extraction_type(), ExtractionType::Warning);
    }

    #[test]
    fn test_extraction_type_parse_roundtrip() {
        for t in [
            ExtractionType::Decision,
            ExtractionType::Pattern,
            ExtractionType::Warning,
            ExtractionType::Methodology,
            ExtractionType::Checklist,
            ExtractionType::Persona,
            ExtractionType::Workflow,
        ] {
            assert_eq!(ExtractionType::parse(t.as_str()), Some(t));
        }
        assert_eq!(ExtractionType::parse("poem"), None);
    }

    #[test]
    fn test_embedding_text_includes_title() {
        let extraction = Extraction {
            id: "e1".to_string(),
            source_id: "s1".to_string(),
            chunk_id: "c1".to_string(),
            project_id: "p1".to_string(),
            content: ExtractionContent::Pattern {
                problem: "hallucination".to_string(),
                solution: "ground answers in retrieved context".to_string(),
                applicability: None,
                examples: vec![],
            },
            topics: vec!["rag".to_string()],
            title: "Retrieval grounding".to_string(),
            source_title: "RAG in Practice".to_string(),
            source_type: SourceType::Book,
            chapter: None,
            extracted_at: Utc::now(),
            schema_version: SCHEMA_VERSION,
        };
        let text = extraction.embedding_text();
        assert!(text.contains("Retrieval grounding"));
        assert!(text.contains("hallucination"));
    }
}
