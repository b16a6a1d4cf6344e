//! The query/navigation core.
//!
//! Composes the retriever, the optional synthesizer, and the session
//! manager into a single request/response contract:
//!
//! - [`QueryEngine::query`] — stateless single-shot question answering.
//! - [`QueryEngine::navigate`] — session-aware: prior turns augment the
//!   retrieval input and the new turn is appended afterwards.
//!
//! Both share one pipeline: validate → retrieve (embed, over-fetch,
//! dedup, rank, enrich with entities) → synthesize or fall back to an
//! extractive answer. Retrieval is deterministic for a fixed index
//! state; only LLM answer text may vary.
//!
//! Degradation rules: an empty index becomes an explicit "no knowledge"
//! response, and a failed or timed-out synthesis call degrades that one
//! request to retrieval-only. Neither surfaces as an error.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{Config, RetrievalConfig};
use crate::embedding::EmbeddingProvider;
use crate::error::{RecallError, Result};
use crate::graph::EntityGraph;
use crate::index::{VectorHit, VectorIndex};
use crate::ingest::{self, IngestReport};
use crate::models::{
    EntitySummary, KnowledgeStats, QueryResponse, RetrievalResult, SessionTurn, SourceRef,
    SynthesisMode,
};
use crate::session::SessionManager;
use crate::synthesis::{self, Synthesizer};

/// Per-request knobs. `Default` uses the configured values.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Override the number of sources returned.
    pub k: Option<usize>,
    /// Restrict retrieval to a single document.
    pub doc_filter: Option<String>,
    /// End-to-end deadline; synthesis is dropped first when it runs short.
    pub timeout: Option<Duration>,
}

/// Retrieval output: ranked results plus enriched entity summaries.
#[derive(Debug, Clone)]
pub struct RetrievalOutcome {
    pub results: Vec<RetrievalResult>,
    pub entities: Vec<EntitySummary>,
}

// ============ Retriever ============

/// Embeds a query, searches the vector index, deduplicates and ranks the
/// hits, and attaches entity-graph context.
pub struct Retriever {
    index: VectorIndex,
    graph: EntityGraph,
    embedder: Arc<dyn EmbeddingProvider>,
    config: RetrievalConfig,
}

/// Related entity names listed on each mentioned entity's summary.
const RELATED_PER_ENTITY: usize = 3;

impl Retriever {
    pub fn new(
        index: VectorIndex,
        graph: EntityGraph,
        embedder: Arc<dyn EmbeddingProvider>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            index,
            graph,
            embedder,
            config,
        }
    }

    /// Retrieve up to `k` deduplicated fragments for `query_text`.
    ///
    /// # Errors
    ///
    /// - [`RecallError::EmptyIndex`] when the index holds zero fragments
    ///   (callers turn this into a "no knowledge" response).
    /// - [`RecallError::Embedding`] when the provider fails.
    pub async fn retrieve(
        &self,
        query_text: &str,
        k: usize,
        doc_filter: Option<&str>,
    ) -> Result<RetrievalOutcome> {
        if self.index.fragment_count().await? == 0 {
            return Err(RecallError::EmptyIndex);
        }

        let query_vector = self
            .embedder
            .embed_query(query_text)
            .await
            .map_err(RecallError::Embedding)?;

        // Over-fetch to leave deduplication headroom
        let overfetch = k.saturating_mul(self.config.overfetch_factor).max(k);
        let hits = self.index.query(&query_vector, overfetch, doc_filter).await?;

        let results = rank_and_dedup(hits, k, self.config.per_doc_cap);
        let entities = self.enrich_entities(&results).await?;

        Ok(RetrievalOutcome { results, entities })
    }

    /// Union the entities mentioned by the surviving fragments, then
    /// expand one co-occurrence hop to surface related-but-unmentioned
    /// entities, ranked by edge weight descending and capped.
    async fn enrich_entities(&self, results: &[RetrievalResult]) -> Result<Vec<EntitySummary>> {
        let mut mentioned = BTreeMap::new();
        for result in results {
            for entity in self.graph.entities_for_fragment(&result.fragment.id).await? {
                mentioned.insert(entity.id, entity);
            }
        }

        // (weight, entity) for one-hop neighbors not already mentioned
        let mut expansion: BTreeMap<i64, (i64, crate::models::Entity)> = BTreeMap::new();
        let mut summaries = Vec::with_capacity(mentioned.len());

        let mut by_name: Vec<_> = mentioned.values().cloned().collect();
        by_name.sort_by(|a, b| a.name.cmp(&b.name));

        for entity in &by_name {
            let related = self
                .graph
                .related_entities(entity.id, self.config.related_entity_cap)
                .await?;

            let related_names: Vec<String> = related
                .iter()
                .take(RELATED_PER_ENTITY)
                .map(|(e, _)| e.name.clone())
                .collect();

            for (neighbor, weight) in related {
                if mentioned.contains_key(&neighbor.id) {
                    continue;
                }
                let entry = expansion.entry(neighbor.id).or_insert((weight, neighbor));
                if weight > entry.0 {
                    entry.0 = weight;
                }
            }

            summaries.push(EntitySummary {
                name: entity.name.clone(),
                kind: entity.kind.clone(),
                mention_count: entity.mention_count,
                related: related_names,
            });
        }

        let mut expanded: Vec<(i64, crate::models::Entity)> = expansion.into_values().collect();
        expanded.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.name.cmp(&b.1.name)));
        expanded.truncate(self.config.related_entity_cap);

        summaries.extend(expanded.into_iter().map(|(_, e)| EntitySummary {
            name: e.name,
            kind: e.kind,
            mention_count: e.mention_count,
            related: Vec::new(),
        }));

        Ok(summaries)
    }
}

/// Normalize scores, order deterministically, and cap fragments per
/// document.
///
/// Raw cosine distance `d` maps to `score = 1 / (1 + d)` so scores are
/// comparable across queries and land in `[0, 1]`. Ties break by
/// fragment recency descending, then fragment id ascending. The
/// per-document cap relaxes to `ceil(k / distinct documents)` when `k`
/// exceeds the number of distinct documents among the hits.
fn rank_and_dedup(hits: Vec<VectorHit>, k: usize, per_doc_cap: usize) -> Vec<RetrievalResult> {
    let mut scored: Vec<(f64, VectorHit)> = hits
        .into_iter()
        .map(|hit| (1.0 / (1.0 + hit.distance.max(0.0)), hit))
        .collect();

    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.1.fragment.created_at.cmp(&a.1.fragment.created_at))
            .then_with(|| a.1.fragment.id.cmp(&b.1.fragment.id))
    });

    let distinct_docs = {
        let mut ids: Vec<&str> = scored.iter().map(|(_, h)| h.fragment.document_id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    };

    let cap = if distinct_docs > 0 && k > distinct_docs {
        per_doc_cap.max(k.div_ceil(distinct_docs))
    } else {
        per_doc_cap
    };

    let mut per_doc: BTreeMap<String, usize> = BTreeMap::new();
    let mut results = Vec::with_capacity(k);

    for (score, hit) in scored {
        if results.len() == k {
            break;
        }
        let seen = per_doc.entry(hit.fragment.document_id.clone()).or_insert(0);
        if *seen >= cap {
            continue;
        }
        *seen += 1;
        results.push(RetrievalResult {
            fragment: hit.fragment,
            score,
            rank: results.len() + 1,
        });
    }

    results
}

// ============ QueryEngine ============

/// The composed query/navigation core.
///
/// Holds injected stateful services (index, graph, sessions) plus the
/// embedding provider and the optional synthesizer. Construct with
/// [`QueryEngine::init`] from config, or [`QueryEngine::with_components`]
/// to inject providers directly (used by tests).
pub struct QueryEngine {
    config: Config,
    pool: SqlitePool,
    index: VectorIndex,
    graph: EntityGraph,
    sessions: SessionManager,
    embedder: Arc<dyn EmbeddingProvider>,
    synthesizer: Option<Arc<dyn Synthesizer>>,
}

impl QueryEngine {
    /// Connect to the database, run migrations, and build providers from
    /// config.
    pub async fn init(config: Config) -> anyhow::Result<Self> {
        let pool = crate::db::connect(&config.db.path).await?;
        crate::migrate::run_migrations(&pool).await?;

        let embedder: Arc<dyn EmbeddingProvider> =
            crate::embedding::create_provider(&config.embedding)?.into();
        let synthesizer = synthesis::create_synthesizer(&config.synthesis)?;

        Ok(Self::with_components(config, pool, embedder, synthesizer))
    }

    /// Assemble an engine from pre-built parts. The pool must already be
    /// migrated.
    pub fn with_components(
        config: Config,
        pool: SqlitePool,
        embedder: Arc<dyn EmbeddingProvider>,
        synthesizer: Option<Arc<dyn Synthesizer>>,
    ) -> Self {
        let index = VectorIndex::new(pool.clone());
        let graph = EntityGraph::new(pool.clone());
        let sessions = SessionManager::new(
            pool.clone(),
            config.session.history_cap,
            config.session.ttl_secs,
        );

        Self {
            config,
            pool,
            index,
            graph,
            sessions,
            embedder,
            synthesizer,
        }
    }

    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    pub fn graph(&self) -> &EntityGraph {
        &self.graph
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Release the underlying pool. Call once at shutdown.
    pub async fn close(self) {
        self.pool.close().await;
    }

    /// Stateless single-shot query.
    pub async fn query(&self, question: &str, opts: &QueryOptions) -> Result<QueryResponse> {
        let question = validate_question(question, self.config.query.max_question_chars)?;
        let deadline = self.deadline(opts);

        self.run_pipeline(question, question, &[], opts, deadline, None)
            .await
    }

    /// Session-aware query. Prior turns augment the retrieval input;
    /// the new turn is appended after the answer is produced.
    pub async fn navigate(
        &self,
        question: &str,
        session_id: Option<&str>,
        opts: &QueryOptions,
    ) -> Result<QueryResponse> {
        let question = validate_question(question, self.config.query.max_question_chars)?;
        let deadline = self.deadline(opts);

        let session_id = session_id
            .map(|s| s.to_string())
            .unwrap_or_else(new_session_id);

        self.sessions.get_or_create(&session_id).await?;
        let history = self.sessions.build_context(&session_id).await?;

        // Prepend the most recent turn for embedding continuity; the
        // stored question stays unaugmented
        let embed_input = match history.last() {
            Some(last) => format!(
                "Context: Previously asked '{}'. Now: {}",
                last.question, question
            ),
            None => question.to_string(),
        };

        let response = self
            .run_pipeline(
                &embed_input,
                question,
                &history,
                opts,
                deadline,
                Some(session_id.clone()),
            )
            .await?;

        let fragment_ids: Vec<String> = response
            .sources
            .iter()
            .map(|s| s.fragment_id.clone())
            .collect();
        self.sessions
            .append_turn(&session_id, question, &response.answer, &fragment_ids)
            .await?;

        Ok(response)
    }

    /// Shared pipeline behind `query` and `navigate`.
    async fn run_pipeline(
        &self,
        embed_input: &str,
        question: &str,
        history: &[SessionTurn],
        opts: &QueryOptions,
        deadline: Instant,
        session_id: Option<String>,
    ) -> Result<QueryResponse> {
        let k = opts.k.unwrap_or(self.config.retrieval.k);

        // Retrieval shares the end-to-end deadline; a slow embedding
        // provider must not hold the request past it
        let remaining = deadline.saturating_duration_since(Instant::now());
        let retriever = self.retriever();
        let retrieval = retriever.retrieve(embed_input, k, opts.doc_filter.as_deref());

        let outcome = match tokio::time::timeout(remaining, retrieval).await {
            Err(_) => {
                return Err(RecallError::Embedding(anyhow::anyhow!(
                    "retrieval did not complete within the request deadline"
                )))
            }
            Ok(result) => result,
        };

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(RecallError::EmptyIndex) => {
                info!("query against empty index; returning no-knowledge response");
                return Ok(QueryResponse {
                    answer: "The knowledge base is empty. Ingest some documents first."
                        .to_string(),
                    synthesis: SynthesisMode::NoKnowledge,
                    sources: Vec::new(),
                    entities: Vec::new(),
                    session_id,
                });
            }
            Err(e) => return Err(e),
        };

        let (answer, mode) = self
            .synthesize_or_fallback(question, &outcome.results, history, deadline)
            .await;

        let snippet_chars = self.config.retrieval.snippet_chars;
        let sources = outcome
            .results
            .iter()
            .map(|r| SourceRef {
                document_id: r.fragment.document_id.clone(),
                fragment_id: r.fragment.id.clone(),
                text: r.fragment.text.chars().take(snippet_chars).collect(),
                score: r.score,
            })
            .collect();

        Ok(QueryResponse {
            answer,
            synthesis: mode,
            sources,
            entities: outcome.entities,
            session_id,
        })
    }

    /// Run the configured synthesizer within the remaining deadline, or
    /// degrade to the extractive fallback. Failure is logged, never
    /// raised: citations take priority over synthesis.
    async fn synthesize_or_fallback(
        &self,
        question: &str,
        results: &[RetrievalResult],
        history: &[SessionTurn],
        deadline: Instant,
    ) -> (String, SynthesisMode) {
        if let Some(synthesizer) = &self.synthesizer {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!("deadline exhausted before synthesis; degrading to retrieval-only");
            } else {
                let budget =
                    remaining.min(Duration::from_secs(self.config.synthesis.timeout_secs));
                match tokio::time::timeout(budget, synthesizer.synthesize(question, results, history))
                    .await
                {
                    Ok(Ok(answer)) => return (answer, SynthesisMode::Llm),
                    Ok(Err(e)) => {
                        let err = RecallError::Synthesis(e);
                        warn!(provider = synthesizer.name(), error = %err, "degrading to retrieval-only");
                    }
                    Err(_) => {
                        warn!(
                            provider = synthesizer.name(),
                            "synthesis timed out; degrading to retrieval-only"
                        );
                    }
                }
            }
        }

        (
            synthesis::extractive_answer(question, results),
            SynthesisMode::Extractive,
        )
    }

    /// Ingest raw text into the knowledge base.
    pub async fn ingest_text(&self, text: &str, source: &str) -> anyhow::Result<IngestReport> {
        ingest::ingest_text(
            &self.index,
            &self.graph,
            self.embedder.as_ref(),
            &self.config.chunking,
            text,
            source,
        )
        .await
    }

    /// Knowledge-base summary statistics.
    pub async fn stats(&self) -> Result<KnowledgeStats> {
        Ok(KnowledgeStats {
            documents: self.index.document_count().await?,
            fragments: self.index.fragment_count().await?,
            entities: self.graph.entity_count().await?,
            relations: self.graph.relation_count().await?,
            sessions: self.sessions.session_count().await?,
        })
    }

    /// Delete a document, cascading to fragments, vectors, entity
    /// mentions, and edges without remaining provenance. Returns the
    /// number of fragments removed.
    pub async fn delete_document(&self, document_id: &str) -> Result<u64> {
        let removed = self.index.delete_document(document_id).await?;
        self.graph.remove_document(document_id).await?;
        info!(document_id = %document_id, fragments = removed, "deleted document");
        Ok(removed)
    }

    fn retriever(&self) -> Retriever {
        Retriever::new(
            self.index.clone(),
            self.graph.clone(),
            self.embedder.clone(),
            self.config.retrieval.clone(),
        )
    }

    fn deadline(&self, opts: &QueryOptions) -> Instant {
        let timeout = opts
            .timeout
            .unwrap_or(Duration::from_secs(self.config.query.timeout_secs));
        Instant::now() + timeout
    }
}

fn new_session_id() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

fn validate_question(question: &str, max_chars: usize) -> Result<&str> {
    let trimmed = question.trim();
    if trimmed.is_empty() {
        return Err(RecallError::InvalidInput(
            "question must not be empty".to_string(),
        ));
    }
    if trimmed.chars().count() > max_chars {
        return Err(RecallError::InvalidInput(format!(
            "question exceeds {} characters",
            max_chars
        )));
    }
    Ok(trimmed)
}
