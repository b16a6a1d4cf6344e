//! End-to-end tests over a temporary SQLite database with the hash
//! embedding provider. No network, fully deterministic.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use tempfile::TempDir;

use recall::config::{Config, DbConfig};
use recall::embedding::{EmbeddingProvider, HashProvider};
use recall::engine::{QueryEngine, QueryOptions};
use recall::error::RecallError;
use recall::models::{RetrievalResult, SessionTurn, SynthesisMode};
use recall::synthesis::Synthesizer;

fn test_config(dir: &TempDir) -> Config {
    Config {
        db: DbConfig {
            path: dir.path().join("recall.sqlite"),
        },
        chunking: Default::default(),
        retrieval: Default::default(),
        session: Default::default(),
        embedding: Default::default(),
        synthesis: Default::default(),
        query: Default::default(),
        server: Default::default(),
    }
}

async fn test_engine(dir: &TempDir) -> QueryEngine {
    QueryEngine::init(test_config(dir)).await.unwrap()
}

fn db_path(config: &Config) -> PathBuf {
    config.db.path.clone()
}

// ============ Query pipeline ============

#[tokio::test]
async fn test_ingest_then_query_end_to_end() {
    let dir = TempDir::new().unwrap();
    let engine = test_engine(&dir).await;

    engine
        .ingest_text("Bitcoin reached $100k in 2025", "notes.md")
        .await
        .unwrap();

    let response = engine
        .query("What happened with Bitcoin?", &QueryOptions::default())
        .await
        .unwrap();

    assert!(!response.sources.is_empty());
    assert!(response.sources[0].text.contains("Bitcoin reached $100k"));
    assert!(
        response.entities.iter().any(|e| e.name == "Bitcoin"),
        "entities: {:?}",
        response.entities.iter().map(|e| &e.name).collect::<Vec<_>>()
    );
    // No LLM configured: the answer is extractive and says so
    assert_eq!(response.synthesis, SynthesisMode::Extractive);
    assert!(response.answer.contains("no LLM synthesis"));
    assert!(response.session_id.is_none());
}

#[tokio::test]
async fn test_empty_index_returns_no_knowledge() {
    let dir = TempDir::new().unwrap();
    let engine = test_engine(&dir).await;

    let response = engine
        .query("anything at all", &QueryOptions::default())
        .await
        .unwrap();

    assert_eq!(response.synthesis, SynthesisMode::NoKnowledge);
    assert!(response.sources.is_empty());
    assert!(response.entities.is_empty());
    assert!(response.answer.contains("empty"));
}

#[tokio::test]
async fn test_empty_question_rejected() {
    let dir = TempDir::new().unwrap();
    let engine = test_engine(&dir).await;

    let err = engine.query("   ", &QueryOptions::default()).await.unwrap_err();
    assert!(matches!(err, RecallError::InvalidInput(_)));
}

#[tokio::test]
async fn test_results_deduplicated_across_documents() {
    let dir = TempDir::new().unwrap();
    let engine = test_engine(&dir).await;

    engine
        .ingest_text("Rust compiles to fast native code", "a.md")
        .await
        .unwrap();
    engine
        .ingest_text("Rust guarantees memory safety without garbage collection", "b.md")
        .await
        .unwrap();
    engine
        .ingest_text("Rust tooling includes cargo and clippy", "c.md")
        .await
        .unwrap();

    let opts = QueryOptions {
        k: Some(3),
        ..Default::default()
    };
    let response = engine.query("Tell me about Rust", &opts).await.unwrap();

    let mut docs: Vec<&str> = response
        .sources
        .iter()
        .map(|s| s.document_id.as_str())
        .collect();
    docs.sort_unstable();
    docs.dedup();
    assert_eq!(
        docs.len(),
        response.sources.len(),
        "per-document cap of 1 should make every source a distinct document"
    );
    assert_eq!(response.sources.len(), 3);
}

#[tokio::test]
async fn test_cap_relaxes_when_fewer_documents_than_k() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    // Force one fragment per paragraph
    config.chunking.max_chars = 40;
    let engine = QueryEngine::init(config).await.unwrap();

    let text = "Alpha servers run in Oregon.\n\n\
                Alpha storage uses replicated disks.\n\n\
                Alpha networking is dual-stack.\n\n\
                Alpha deploys happen nightly.";
    engine.ingest_text(text, "alpha.md").await.unwrap();

    let opts = QueryOptions {
        k: Some(3),
        ..Default::default()
    };
    let response = engine.query("How does Alpha work?", &opts).await.unwrap();

    assert!(
        response.sources.len() > 1,
        "single-document corpus should still fill results past the cap"
    );
}

#[tokio::test]
async fn test_retrieval_is_deterministic() {
    let dir = TempDir::new().unwrap();
    let engine = test_engine(&dir).await;

    engine
        .ingest_text("The Eiffel Tower is in Paris", "facts1.md")
        .await
        .unwrap();
    engine
        .ingest_text("The Colosseum is in Rome", "facts2.md")
        .await
        .unwrap();

    let first = engine
        .query("Where is the Eiffel Tower?", &QueryOptions::default())
        .await
        .unwrap();
    let second = engine
        .query("Where is the Eiffel Tower?", &QueryOptions::default())
        .await
        .unwrap();

    let ids = |r: &recall::models::QueryResponse| {
        r.sources
            .iter()
            .map(|s| (s.fragment_id.clone(), s.score))
            .collect::<Vec<_>>()
    };
    assert_eq!(ids(&first), ids(&second));
}

#[tokio::test]
async fn test_document_filter_restricts_results() {
    let dir = TempDir::new().unwrap();
    let engine = test_engine(&dir).await;

    let report = engine
        .ingest_text("Postgres supports logical replication", "pg.md")
        .await
        .unwrap();
    engine
        .ingest_text("Redis supports pub/sub messaging", "redis.md")
        .await
        .unwrap();

    let opts = QueryOptions {
        doc_filter: Some(report.document_id.clone()),
        ..Default::default()
    };
    let response = engine.query("What does it support?", &opts).await.unwrap();

    assert!(!response.sources.is_empty());
    for source in &response.sources {
        assert_eq!(source.document_id, report.document_id);
    }
}

// ============ Synthesis degradation ============

struct FailingSynthesizer;

#[async_trait]
impl Synthesizer for FailingSynthesizer {
    fn name(&self) -> &str {
        "failing"
    }

    async fn synthesize(
        &self,
        _question: &str,
        _results: &[RetrievalResult],
        _history: &[SessionTurn],
    ) -> anyhow::Result<String> {
        Err(anyhow!("simulated provider outage"))
    }
}

#[tokio::test]
async fn test_synthesis_failure_degrades_to_extractive() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    let pool = recall::db::connect(&db_path(&config)).await.unwrap();
    recall::migrate::run_migrations(&pool).await.unwrap();

    let embedder: Arc<dyn EmbeddingProvider> =
        Arc::new(HashProvider::new(&config.embedding));
    let engine = QueryEngine::with_components(
        config,
        pool,
        embedder,
        Some(Arc::new(FailingSynthesizer)),
    );

    engine
        .ingest_text("Saturn has visible rings", "space.md")
        .await
        .unwrap();

    let response = engine
        .query("What does Saturn have?", &QueryOptions::default())
        .await
        .unwrap();

    // The failure is recovered, not surfaced: retrieval results survive
    assert_eq!(response.synthesis, SynthesisMode::Extractive);
    assert!(!response.sources.is_empty());
    assert!(response.sources[0].text.contains("Saturn"));
}

struct SlowEmbedder {
    inner: HashProvider,
    delay: Duration,
}

#[async_trait]
impl EmbeddingProvider for SlowEmbedder {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn dims(&self) -> usize {
        self.inner.dims()
    }

    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        tokio::time::sleep(self.delay).await;
        self.inner.embed(texts).await
    }
}

#[tokio::test]
async fn test_deadline_bounds_slow_embedding() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    let pool = recall::db::connect(&db_path(&config)).await.unwrap();
    recall::migrate::run_migrations(&pool).await.unwrap();

    let fast = QueryEngine::with_components(
        config.clone(),
        pool.clone(),
        Arc::new(HashProvider::new(&config.embedding)),
        None,
    );
    fast.ingest_text("Saturn has visible rings", "space.md")
        .await
        .unwrap();

    let slow = QueryEngine::with_components(
        config.clone(),
        pool,
        Arc::new(SlowEmbedder {
            inner: HashProvider::new(&config.embedding),
            delay: Duration::from_secs(60),
        }),
        None,
    );

    let opts = QueryOptions {
        timeout: Some(Duration::from_millis(200)),
        ..Default::default()
    };
    let start = std::time::Instant::now();
    let err = slow
        .query("What does Saturn have?", &opts)
        .await
        .unwrap_err();

    assert!(matches!(err, RecallError::Embedding(_)), "got {:?}", err);
    assert!(
        start.elapsed() < Duration::from_secs(5),
        "deadline must bound retrieval, took {:?}",
        start.elapsed()
    );
}

// ============ Sessions ============

#[tokio::test]
async fn test_navigate_creates_session_and_records_turns() {
    let dir = TempDir::new().unwrap();
    let engine = test_engine(&dir).await;

    engine
        .ingest_text("The capital of France is Paris", "geo.md")
        .await
        .unwrap();

    let first = engine
        .navigate("What is the capital of France?", None, &QueryOptions::default())
        .await
        .unwrap();
    let session_id = first.session_id.clone().unwrap();

    let second = engine
        .navigate("What about its population?", Some(&session_id), &QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(second.session_id.as_deref(), Some(session_id.as_str()));

    let turns = engine.sessions().build_context(&session_id).await.unwrap();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].question, "What is the capital of France?");
    assert_eq!(turns[1].question, "What about its population?");
}

#[tokio::test]
async fn test_session_history_capped_fifo() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.session.history_cap = 3;
    let engine = QueryEngine::init(config).await.unwrap();

    engine
        .ingest_text("Some background knowledge about topics", "bg.md")
        .await
        .unwrap();

    for i in 0..5 {
        engine
            .navigate(&format!("question number {}", i), Some("s1"), &QueryOptions::default())
            .await
            .unwrap();
    }

    let turns = engine.sessions().build_context("s1").await.unwrap();
    assert_eq!(turns.len(), 3, "history must hold min(N, cap) turns");
    let questions: Vec<&str> = turns.iter().map(|t| t.question.as_str()).collect();
    assert_eq!(
        questions,
        vec!["question number 2", "question number 3", "question number 4"],
        "oldest turns evicted first, order preserved"
    );
}

#[tokio::test]
async fn test_expired_session_restarts_fresh() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.session.ttl_secs = 1;
    let engine = QueryEngine::init(config).await.unwrap();

    engine
        .ingest_text("Something to retrieve", "x.md")
        .await
        .unwrap();

    engine
        .navigate("first question", Some("expiring"), &QueryOptions::default())
        .await
        .unwrap();
    let session = engine.sessions().get_or_create("expiring").await.unwrap();
    assert_eq!(session.turn_count, 1);

    tokio::time::sleep(Duration::from_secs(3)).await;

    // Same id, fresh session: no error, empty history
    let session = engine.sessions().get_or_create("expiring").await.unwrap();
    assert_eq!(session.turn_count, 0);
    let turns = engine.sessions().build_context("expiring").await.unwrap();
    assert!(turns.is_empty());
}

#[tokio::test]
async fn test_sweep_removes_only_expired_sessions() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.session.ttl_secs = 1;
    let engine = QueryEngine::init(config).await.unwrap();

    engine.sessions().get_or_create("old").await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;
    engine.sessions().get_or_create("fresh").await.unwrap();

    let removed = engine.sessions().sweep_expired().await.unwrap();
    assert_eq!(removed, 1);
    assert_eq!(engine.sessions().session_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_closed_session_is_gone() {
    let dir = TempDir::new().unwrap();
    let engine = test_engine(&dir).await;

    engine.sessions().get_or_create("temp").await.unwrap();
    engine
        .sessions()
        .append_turn("temp", "q", "a", &[])
        .await
        .unwrap();
    engine.sessions().close("temp").await.unwrap();

    assert_eq!(engine.sessions().session_count().await.unwrap(), 0);
    assert!(engine.sessions().build_context("temp").await.unwrap().is_empty());
}

// ============ Lifecycle ============

#[tokio::test]
async fn test_reingest_replaces_document() {
    let dir = TempDir::new().unwrap();
    let engine = test_engine(&dir).await;

    let first = engine
        .ingest_text("Bitcoin reached $100k in 2025", "notes.md")
        .await
        .unwrap();
    let second = engine
        .ingest_text("Bitcoin reached $100k in 2025", "notes.md")
        .await
        .unwrap();
    assert_eq!(first.document_id, second.document_id);

    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.documents, 1);
    assert_eq!(stats.fragments, first.fragments_created as i64);
}

#[tokio::test]
async fn test_delete_document_cascades() {
    let dir = TempDir::new().unwrap();
    let engine = test_engine(&dir).await;

    let report = engine
        .ingest_text("Ada Lovelace worked with Charles Babbage", "history.md")
        .await
        .unwrap();

    let stats = engine.stats().await.unwrap();
    assert!(stats.entities > 0);
    assert!(stats.relations > 0);

    let removed = engine.delete_document(&report.document_id).await.unwrap();
    assert_eq!(removed as usize, report.fragments_created);

    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.documents, 0);
    assert_eq!(stats.fragments, 0);
    assert_eq!(stats.entities, 0);
    assert_eq!(stats.relations, 0);

    // Queries now see an empty index again
    let response = engine
        .query("Who was Ada Lovelace?", &QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(response.synthesis, SynthesisMode::NoKnowledge);
}

#[tokio::test]
async fn test_stats_counts_everything() {
    let dir = TempDir::new().unwrap();
    let engine = test_engine(&dir).await;

    engine
        .ingest_text("Tokyo is the capital of Japan", "geo.md")
        .await
        .unwrap();
    engine
        .navigate("Where is Tokyo?", Some("s1"), &QueryOptions::default())
        .await
        .unwrap();

    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.documents, 1);
    assert!(stats.fragments >= 1);
    assert!(stats.entities >= 2); // Tokyo, Japan
    assert_eq!(stats.sessions, 1);
}

// ============ Entity enrichment ============

#[tokio::test]
async fn test_related_entities_surface_in_response() {
    let dir = TempDir::new().unwrap();
    let engine = test_engine(&dir).await;

    // Satoshi co-occurs with Bitcoin; a query matching only the Bitcoin
    // fragment should still surface Satoshi through the graph
    engine
        .ingest_text("Satoshi created Bitcoin", "a.md")
        .await
        .unwrap();
    engine
        .ingest_text("Bitcoin reached $100k in 2025", "b.md")
        .await
        .unwrap();

    let opts = QueryOptions {
        k: Some(1),
        ..Default::default()
    };
    let response = engine
        .query("price of Bitcoin reached $100k 2025", &opts)
        .await
        .unwrap();

    let names: Vec<&str> = response.entities.iter().map(|e| e.name.as_str()).collect();
    assert!(names.contains(&"Bitcoin"), "entities: {:?}", names);
    assert!(
        names.contains(&"Satoshi"),
        "one-hop expansion should surface Satoshi: {:?}",
        names
    );
}
