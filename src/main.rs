//! # lorekit CLI (`lore`)
//!
//! The `lore` binary manages the knowledge stores and runs queries
//! against them.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `lore init` | Create both databases and the shared vector collection |
//! | `lore ingest <bundle.json>` | Ingest one source bundle end to end |
//! | `lore search "<query>"` | Semantic search over chunks and extractions |
//! | `lore get <type>` | List stored extractions of one type |
//! | `lore sources` | List a project's sources with counts |
//! | `lore compare "<topic>" --source a --source b` | Group a topic's extractions per source |
//! | `lore reindex` | Rebuild a project's vector slice from the document store |
//! | `lore purge --yes` | Delete a project from both stores |
//! | `lore serve api` | Start the JSON HTTP API |
//!
//! ## Examples
//!
//! ```bash
//! lore --config ./lore.toml init
//! lore --config ./lore.toml ingest ./bundles/ai-engineering.json
//! lore --config ./lore.toml search "chunking strategies for code"
//! lore --config ./lore.toml get warning --topic retrieval
//! lore --config ./lore.toml compare "evaluation" --source ai-eng --source llm-patterns
//! lore --config ./lore.toml serve api
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use lorekit::config::{self, Config};
use lorekit::embedding::create_provider;
use lorekit::ingest;
use lorekit::models::{ContentType, ExtractionType, SourceType};
use lorekit::query::{QueryService, SearchRequest};
use lorekit::server;
use lorekit::store::DocumentStore;
use lorekit::vector::VectorIndex;

/// lorekit CLI — project-scoped storage and semantic retrieval for an
/// engineering knowledge base.
#[derive(Parser)]
#[command(
    name = "lore",
    about = "lorekit — storage and retrieval for distilled engineering knowledge",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./lore.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the document store, the vector collection, and the
    /// default project tables. Idempotent.
    Init,

    /// Ingest a source bundle (source + chunks + extractions).
    Ingest {
        /// Path to the bundle JSON file.
        bundle: PathBuf,
    },

    /// Semantic search over indexed knowledge.
    Search {
        /// The search query string.
        query: String,

        /// Project to search. Defaults to `default_project` from config.
        #[arg(long)]
        project: Option<String>,

        /// Restrict to `chunk` or `extraction` content.
        #[arg(long)]
        content_type: Option<String>,

        /// Restrict to one extraction type (e.g. `decision`, `warning`).
        #[arg(long)]
        extraction_type: Option<String>,

        /// Restrict to one source type (`book`, `paper`, `case_study`).
        #[arg(long)]
        source_type: Option<String>,

        /// Require one of these topics (repeatable).
        #[arg(long = "topic")]
        topics: Vec<String>,

        /// Only sources published in or after this year.
        #[arg(long)]
        year_from: Option<i64>,

        /// Only sources published in or before this year.
        #[arg(long)]
        year_to: Option<i64>,

        /// Maximum number of results.
        #[arg(long)]
        limit: Option<i64>,

        /// Keep only the best hit per source.
        #[arg(long)]
        diversify: bool,

        /// Search across all projects instead of one.
        #[arg(long)]
        cross_project: bool,
    },

    /// List stored extractions of one type, without embedding.
    Get {
        /// Extraction type: decision, pattern, warning, methodology,
        /// checklist, persona, or workflow.
        kind: String,

        #[arg(long)]
        project: Option<String>,

        /// Only extractions tagged with this topic.
        #[arg(long)]
        topic: Option<String>,

        /// Resume from a cursor returned by a previous page.
        #[arg(long)]
        cursor: Option<String>,

        #[arg(long, default_value_t = 20)]
        page_size: i64,
    },

    /// List a project's sources with chunk and extraction counts.
    Sources {
        #[arg(long)]
        project: Option<String>,
    },

    /// Show what several sources say on one topic, side by side.
    Compare {
        /// The topic tag to compare on.
        topic: String,

        /// Source ids to compare (2 to 4, repeatable).
        #[arg(long = "source", required = true)]
        sources: Vec<String>,

        #[arg(long)]
        project: Option<String>,
    },

    /// Rebuild a project's vector index slice from the document store.
    Reindex {
        #[arg(long)]
        project: Option<String>,
    },

    /// Delete a project from both stores. Irreversible.
    Purge {
        #[arg(long)]
        project: Option<String>,

        /// Confirm the deletion.
        #[arg(long)]
        yes: bool,
    },

    /// Run a server.
    Serve {
        #[command(subcommand)]
        service: ServeService,
    },
}

#[derive(Subcommand)]
enum ServeService {
    /// Start the JSON HTTP API on `[server].bind`.
    Api,
}

/// Build the query-side services from configuration.
async fn build_query_service(
    config: &Config,
) -> anyhow::Result<(Arc<DocumentStore>, Arc<QueryService>)> {
    let store = Arc::new(DocumentStore::open(&config.document_store.path).await?);
    let provider = create_provider(&config.embedding)?;
    let dims = provider.dims();
    let index = Arc::new(
        VectorIndex::open(&config.vector_index.path, &config.vector_index.collection, dims)
            .await?,
    );
    let query = Arc::new(QueryService::new(
        store.clone(),
        index,
        provider,
        config.embedding.clone(),
        config.query.clone(),
        config.default_project.clone(),
    ));
    Ok((store, query))
}

fn parse_extraction_type(s: &str) -> anyhow::Result<ExtractionType> {
    ExtractionType::parse(s)
        .ok_or_else(|| anyhow::anyhow!("unknown extraction type '{s}' (expected one of: decision, pattern, warning, methodology, checklist, persona, workflow)"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("lorekit=info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            ingest::run_init(&cfg).await?;
        }
        Commands::Ingest { bundle } => {
            ingest::run_ingest(&cfg, &bundle).await?;
        }
        Commands::Search {
            query,
            project,
            content_type,
            extraction_type,
            source_type,
            topics,
            year_from,
            year_to,
            limit,
            diversify,
            cross_project,
        } => {
            let content_type = content_type
                .map(|s| {
                    ContentType::parse(&s)
                        .ok_or_else(|| anyhow::anyhow!("unknown content type '{s}'"))
                })
                .transpose()?;
            let extraction_type = extraction_type
                .map(|s| parse_extraction_type(&s))
                .transpose()?;
            let source_type = source_type
                .map(|s| {
                    SourceType::parse(&s)
                        .ok_or_else(|| anyhow::anyhow!("unknown source type '{s}'"))
                })
                .transpose()?;

            let request = SearchRequest {
                query,
                project_id: project,
                content_type,
                extraction_type,
                source_type,
                topics,
                year_from,
                year_to,
                chapter: None,
                limit,
                diversify: if diversify { Some(true) } else { None },
                cross_project,
            };

            let (_, service) = build_query_service(&cfg).await?;
            let response = service.search_knowledge(&request).await?;

            println!(
                "{} results for \"{}\" ({} ms)\n",
                response.result_count, response.query, response.latency_ms
            );
            for (i, result) in response.results.iter().enumerate() {
                let label = match result.extraction_type {
                    Some(t) => t.as_str().to_string(),
                    None => result.content_type.as_str().to_string(),
                };
                println!(
                    "{}. [{:.3}] ({label}) {}",
                    i + 1,
                    result.score,
                    result.title.as_deref().unwrap_or("—")
                );
                println!("   {}", snippet(&result.content));
                let mut origin = result.source.title.clone();
                if let Some(ch) = &result.source.chapter {
                    origin.push_str(&format!(", ch. {ch}"));
                }
                if let Some(page) = result.source.page {
                    origin.push_str(&format!(", p. {page}"));
                }
                println!("   — {origin}\n");
            }
            if !response.sources_cited.is_empty() {
                println!("Sources: {}", response.sources_cited.join("; "));
            }
        }
        Commands::Get {
            kind,
            project,
            topic,
            cursor,
            page_size,
        } => {
            let extraction_type = parse_extraction_type(&kind)?;
            let (_, service) = build_query_service(&cfg).await?;
            let page = service
                .get_by_type(
                    project.as_deref(),
                    extraction_type,
                    topic.as_deref(),
                    cursor.as_deref(),
                    page_size,
                )
                .await?;

            println!("{} {}(s):\n", page.items.len(), kind);
            for extraction in &page.items {
                println!("• {} [{}]", extraction.title, extraction.id);
                println!("  {}", extraction.content.summary());
                if !extraction.topics.is_empty() {
                    println!("  topics: {}", extraction.topics.join(", "));
                }
                println!("  — {}\n", extraction.source_title);
            }
            if let Some(cursor) = page.next_cursor {
                println!("More available; resume with --cursor {cursor}");
            }
        }
        Commands::Sources { project } => {
            let store = DocumentStore::open(&cfg.document_store.path).await?;
            let project = project.unwrap_or_else(|| cfg.default_project.clone());
            let sources = store.list_sources(&project).await?;

            println!("{} source(s) in project '{project}':\n", sources.len());
            for s in &sources {
                let year = s.year.map(|y| y.to_string()).unwrap_or_else(|| "—".into());
                println!(
                    "{:<24} {:<10} {:<12} {:<6} {:>6} chunks {:>5} extractions  [{}]",
                    s.id,
                    s.source_type.as_str(),
                    s.category.as_str(),
                    year,
                    s.chunk_count,
                    s.extraction_count,
                    s.status.as_str()
                );
            }
        }
        Commands::Compare {
            topic,
            sources,
            project,
        } => {
            let (_, service) = build_query_service(&cfg).await?;
            let response = service
                .compare_across_sources(project.as_deref(), &topic, &sources)
                .await?;

            println!(
                "\"{}\" across {} sources ({} ms)\n",
                response.topic,
                response.comparisons.len(),
                response.latency_ms
            );
            for comparison in &response.comparisons {
                println!("== {} ==", comparison.source_title);
                if comparison.extractions.is_empty() {
                    println!("   (nothing on this topic)\n");
                    continue;
                }
                for extraction in &comparison.extractions {
                    println!(
                        "   [{}] {}",
                        extraction.extraction_type().as_str(),
                        extraction.title
                    );
                    println!("   {}", extraction.content.summary());
                }
                println!();
            }
        }
        Commands::Reindex { project } => {
            ingest::run_reindex(&cfg, project.as_deref()).await?;
        }
        Commands::Purge { project, yes } => {
            ingest::run_purge(&cfg, project.as_deref(), yes).await?;
        }
        Commands::Serve { service } => match service {
            ServeService::Api => {
                let (store, query) = build_query_service(&cfg).await?;
                server::run_server(&cfg, query, store).await?;
            }
        },
    }

    Ok(())
}

/// First line of a result's content, capped for terminal display.
fn snippet(content: &serde_json::Value) -> String {
    let text = match content {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let line = text.lines().next().unwrap_or("");
    let mut out: String = line.chars().take(160).collect();
    if line.chars().count() > 160 {
        out.push('…');
    }
    out
}
