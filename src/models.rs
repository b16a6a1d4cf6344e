//! Core data models used throughout Recall.
//!
//! These types represent the documents, fragments, entities, and query
//! responses that flow through the ingestion and retrieval pipeline.

use serde::Serialize;

/// A fragment of a document's body text, sized for embedding and retrieval.
///
/// Immutable once created. The id is deterministic:
/// `{document_id}-{position}`.
#[derive(Debug, Clone)]
pub struct Fragment {
    pub id: String,
    pub document_id: String,
    pub position: i64,
    pub text: String,
    pub created_at: i64,
}

/// An extracted named entity with its running mention count.
#[derive(Debug, Clone, Serialize)]
pub struct Entity {
    pub id: i64,
    pub name: String,
    pub kind: String,
    pub mention_count: i64,
}

/// Entity summary attached to a query response.
///
/// `related` lists entities one co-occurrence hop away, ranked by edge
/// weight descending.
#[derive(Debug, Clone, Serialize)]
pub struct EntitySummary {
    pub name: String,
    pub kind: String,
    pub mention_count: i64,
    pub related: Vec<String>,
}

/// A single retrieval hit: fragment plus normalized relevance.
///
/// Transient; produced per query and never persisted. `score` is in
/// `[0, 1]`, higher is more relevant. `rank` starts at 1.
#[derive(Debug, Clone)]
pub struct RetrievalResult {
    pub fragment: Fragment,
    pub score: f64,
    pub rank: usize,
}

/// A cited source in a [`QueryResponse`].
#[derive(Debug, Clone, Serialize)]
pub struct SourceRef {
    pub document_id: String,
    pub fragment_id: String,
    pub text: String,
    pub score: f64,
}

/// How the `answer` field of a response was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisMode {
    /// Answer generated by the configured LLM.
    Llm,
    /// Extractive fallback — no LLM configured, the call failed, or the
    /// deadline was exhausted before synthesis could run.
    Extractive,
    /// The index holds no documents; there was nothing to retrieve.
    NoKnowledge,
}

/// The public output contract of [`crate::engine::QueryEngine`].
#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub answer: String,
    pub synthesis: SynthesisMode,
    pub sources: Vec<SourceRef>,
    pub entities: Vec<EntitySummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// A conversational session owned by the session manager.
///
/// Mutated only by turn appends; destroyed by the expiry sweep or an
/// explicit close.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub created_at: i64,
    pub last_active_at: i64,
    pub turn_count: i64,
}

/// One question/answer turn stored in a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionTurn {
    pub question: String,
    pub answer_summary: String,
    pub fragment_ids: Vec<String>,
    pub created_at: i64,
}

/// Knowledge-base statistics returned by `recall stats` and
/// `GET /collections`.
#[derive(Debug, Clone, Serialize)]
pub struct KnowledgeStats {
    pub documents: i64,
    pub fragments: i64,
    pub entities: i64,
    pub relations: i64,
    pub sessions: i64,
}
