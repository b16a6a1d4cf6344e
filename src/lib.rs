//! Recall — a local-first knowledge base with semantic retrieval, entity
//! graphs, and session-aware navigation for AI agents.
//!
//! Everything lives in a single SQLite database: documents, text
//! fragments, embedding vectors, the entity co-occurrence graph, and
//! conversational sessions. Retrieval is brute-force cosine similarity
//! over stored vectors, deterministic for a fixed index state.
//!
//! # Module map
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration with defaults and validation |
//! | [`models`] | Core data types shared across the crate |
//! | [`error`] | The query core's error taxonomy |
//! | [`db`] | SQLite connection pool setup |
//! | [`migrate`] | Idempotent schema migrations |
//! | [`chunk`] | Paragraph-boundary text fragmenting |
//! | [`embedding`] | Embedding providers (hash, OpenAI, Ollama) |
//! | [`index`] | Vector storage and nearest-neighbor queries |
//! | [`graph`] | Entity extraction and co-occurrence graph |
//! | [`ingest`] | Text ingestion pipeline |
//! | [`session`] | Bounded, TTL-expiring conversation sessions |
//! | [`synthesis`] | Optional LLM answer synthesis with fallback |
//! | [`engine`] | The composed query/navigation core |
//! | [`server`] | HTTP JSON API |

pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod graph;
pub mod index;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod server;
pub mod session;
pub mod synthesis;
