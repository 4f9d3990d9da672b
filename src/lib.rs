//! # lorekit
//!
//! Storage and retrieval core for an engineering knowledge base:
//! ingested sources (books, papers, case studies) are chunked and
//! distilled into structured extractions, embedded, and served through
//! project-scoped semantic search.
//!
//! ## Architecture
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`models`] | Canonical records: sources, chunks, extractions, vector payloads |
//! | [`store`] | Document store — per-project SQLite tables, the system of record |
//! | [`vector`] | Vector index — one shared collection, tenant-filtered search |
//! | [`embedding`] | Embedding providers (OpenAI, Ollama, local, hash) |
//! | [`indexer`] | Coordinator driving store writes into the index |
//! | [`query`] | Search, typed listing, and cross-source comparison |
//! | [`auth`] | Tiered access control and fixed-window rate limiting |
//! | [`ingest`] | Bundle loading and store-side CLI commands |
//! | [`server`] | JSON HTTP API |
//!
//! The document store is the system of record; the vector index is a
//! derived cache that can be rebuilt from it at any time with
//! `lore reindex`.

pub mod auth;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod indexer;
pub mod ingest;
pub mod models;
pub mod query;
pub mod server;
pub mod store;
pub mod vector;
