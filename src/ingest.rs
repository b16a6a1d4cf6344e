//! Text ingestion pipeline: fragment → embed → index → extract entities.
//!
//! Raw text arrives from the CLI or the HTTP API already extracted —
//! PDF/URL extraction lives outside this crate. Document ids are
//! deterministic (SHA-256 of source + content prefix), so re-ingesting
//! the same text replaces the document instead of duplicating it.

use anyhow::{bail, Result};
use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::chunk::split_fragments;
use crate::config::ChunkingConfig;
use crate::embedding::EmbeddingProvider;
use crate::graph::{EntityExtractor, EntityGraph};
use crate::index::VectorIndex;

/// Outcome of a successful ingestion.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub document_id: String,
    pub source: String,
    pub fragments_created: usize,
    pub entities_found: usize,
}

/// Deterministic document id from source + content prefix.
pub fn document_id_for(source: &str, text: &str) -> String {
    let prefix: String = text.chars().take(200).collect();
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update(b":");
    hasher.update(prefix.as_bytes());
    let mut id = hex::encode(hasher.finalize());
    id.truncate(16);
    id
}

/// Ingest raw text: fragment, embed, store, extract entities.
///
/// The document/fragment/vector write is one transaction; the entity
/// graph is populated afterwards, per fragment. Concurrent queries see
/// the document either fully absent or fully present.
pub async fn ingest_text(
    index: &VectorIndex,
    graph: &EntityGraph,
    embedder: &dyn EmbeddingProvider,
    chunking: &ChunkingConfig,
    text: &str,
    source: &str,
) -> Result<IngestReport> {
    if text.trim().is_empty() {
        bail!("Empty text provided");
    }

    let document_id = document_id_for(source, text);
    let created_at = Utc::now().timestamp();

    let fragments = split_fragments(&document_id, text, chunking.max_chars, created_at);
    if fragments.is_empty() {
        bail!("Text produced no fragments after splitting");
    }

    let texts: Vec<String> = fragments.iter().map(|f| f.text.clone()).collect();
    let vectors = embedder.embed(&texts).await?;
    if vectors.len() != fragments.len() {
        bail!(
            "Embedding provider returned {} vectors for {} fragments",
            vectors.len(),
            fragments.len()
        );
    }

    index
        .insert_document(&document_id, source, created_at, &fragments, &vectors)
        .await?;

    // A document replacing an earlier version must not leave the old
    // version's mentions behind
    graph.remove_document(&document_id).await?;

    let extractor = EntityExtractor::new();
    let mut entities_found = 0;
    for fragment in &fragments {
        let entities = extractor.extract(&fragment.text);
        entities_found += entities.len();
        graph
            .record_fragment(&document_id, &fragment.id, &entities)
            .await?;
    }

    info!(
        document_id = %document_id,
        source = %source,
        fragments = fragments.len(),
        entities = entities_found,
        "ingested document"
    );

    Ok(IngestReport {
        document_id,
        source: source.to_string(),
        fragments_created: fragments.len(),
        entities_found,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_id_deterministic() {
        let a = document_id_for("notes.md", "Bitcoin reached $100k in 2025");
        let b = document_id_for("notes.md", "Bitcoin reached $100k in 2025");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn test_document_id_is_lowercase_hex() {
        let id = document_id_for("notes.md", "some text");
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_document_id_varies_by_source() {
        let a = document_id_for("notes.md", "same text");
        let b = document_id_for("other.md", "same text");
        assert_ne!(a, b);
    }

    #[test]
    fn test_document_id_varies_by_content() {
        let a = document_id_for("notes.md", "first text");
        let b = document_id_for("notes.md", "second text");
        assert_ne!(a, b);
    }
}
