//! Entity extraction and co-occurrence graph storage.
//!
//! Entities are extracted with regex heuristics (proper nouns, tickers,
//! @mentions, URLs, emails, money/percent metrics) and stored in SQLite
//! together with per-fragment mentions and co-occurrence edges. The
//! co-occurrence window is a single fragment: two entities appearing in
//! the same fragment gain one unit of edge weight per fragment.
//!
//! Edges are unordered pairs stored with `entity_a < entity_b`; no
//! self-edges. Edge weight equals the number of provenance fragments and
//! is monotonically non-decreasing while those fragments exist.

use regex::Regex;
use sqlx::{Row, SqlitePool};

use crate::error::Result;
use crate::models::Entity;

// ============ Extraction ============

/// Regex-based entity extractor. Compile once, reuse across fragments.
pub struct EntityExtractor {
    proper_noun: Regex,
    ticker: Regex,
    mention: Regex,
    url: Regex,
    email: Regex,
    metric: Regex,
}

/// Capitalized words that are almost never entities on their own.
const STOPWORDS: &[&str] = &[
    "The", "This", "That", "These", "Those", "There", "Then", "They", "Their", "A", "An", "And",
    "But", "Or", "If", "In", "On", "At", "For", "From", "With", "What", "When", "Where", "Which",
    "Who", "Why", "How", "It", "Its", "As", "By", "To", "Of", "Is", "Are", "Was", "Were", "Be",
    "Has", "Have", "Had", "Not", "No", "Yes", "We", "You", "He", "She", "All", "Any", "Some",
    "Also", "After", "Before", "While", "During", "However",
];

impl EntityExtractor {
    pub fn new() -> Self {
        Self {
            // Capitalized word sequences; single words are filtered
            // against STOPWORDS below
            proper_noun: Regex::new(r"\b([A-Z][a-z]+(?:\s+[A-Z][a-z]+)*)\b").unwrap(),
            ticker: Regex::new(r"\$([A-Z]{2,10})\b").unwrap(),
            mention: Regex::new(r"@(\w{2,30})\b").unwrap(),
            url: Regex::new(r#"https?://[^\s<>"]+"#).unwrap(),
            email: Regex::new(r"[\w.+-]+@[\w-]+\.[\w.-]+").unwrap(),
            metric: Regex::new(r"\$[\d,.]+[KMBkmb]?|\d+\.?\d*%").unwrap(),
        }
    }

    /// Extract `(name, kind)` pairs from a fragment's text.
    ///
    /// Deduplicated and sorted by name for deterministic storage order.
    pub fn extract(&self, text: &str) -> Vec<(String, String)> {
        let mut entities: Vec<(String, String)> = Vec::new();

        for m in self.proper_noun.find_iter(text) {
            let name = m.as_str();
            let single_word = !name.contains(' ');
            if single_word && STOPWORDS.contains(&name) {
                continue;
            }
            entities.push((name.to_string(), "proper_noun".to_string()));
        }

        for c in self.ticker.captures_iter(text) {
            entities.push((format!("${}", &c[1]), "ticker".to_string()));
        }

        for c in self.mention.captures_iter(text) {
            entities.push((format!("@{}", &c[1]), "mention".to_string()));
        }

        for m in self.url.find_iter(text) {
            entities.push((m.as_str().to_string(), "url".to_string()));
        }

        for m in self.email.find_iter(text) {
            entities.push((m.as_str().to_string(), "email".to_string()));
        }

        for m in self.metric.find_iter(text) {
            entities.push((m.as_str().to_string(), "metric".to_string()));
        }

        entities.sort();
        entities.dedup_by(|a, b| a.0 == b.0);
        entities
    }
}

impl Default for EntityExtractor {
    fn default() -> Self {
        Self::new()
    }
}

// ============ Graph store ============

/// Handle to the entity/edge store. Cheap to clone.
#[derive(Clone)]
pub struct EntityGraph {
    pool: SqlitePool,
}

impl EntityGraph {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record one fragment's entities: upsert each entity (incrementing
    /// its mention count), store the mention, and add one unit of weight
    /// to every co-occurring pair. Runs in a single transaction.
    pub async fn record_fragment(
        &self,
        document_id: &str,
        fragment_id: &str,
        entities: &[(String, String)],
    ) -> Result<()> {
        if entities.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(entities.len());

        for (name, kind) in entities {
            sqlx::query(
                r#"
                INSERT INTO entities (name, kind, mention_count) VALUES (?, ?, 1)
                ON CONFLICT(name) DO UPDATE SET mention_count = mention_count + 1
                "#,
            )
            .bind(name)
            .bind(kind)
            .execute(&mut *tx)
            .await?;

            let id: i64 = sqlx::query_scalar("SELECT id FROM entities WHERE name = ?")
                .bind(name)
                .fetch_one(&mut *tx)
                .await?;

            sqlx::query(
                "INSERT OR IGNORE INTO entity_mentions (entity_id, fragment_id, document_id) VALUES (?, ?, ?)",
            )
            .bind(id)
            .bind(fragment_id)
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

            ids.push(id);
        }

        // Pairwise co-occurrence within the fragment; no self-edges
        for i in 0..ids.len() {
            for j in (i + 1)..ids.len() {
                let (a, b) = if ids[i] < ids[j] {
                    (ids[i], ids[j])
                } else {
                    (ids[j], ids[i])
                };
                if a == b {
                    continue;
                }

                let inserted = sqlx::query(
                    "INSERT OR IGNORE INTO edge_provenance (entity_a, entity_b, fragment_id, document_id) VALUES (?, ?, ?, ?)",
                )
                .bind(a)
                .bind(b)
                .bind(fragment_id)
                .bind(document_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();

                if inserted > 0 {
                    sqlx::query(
                        r#"
                        INSERT INTO entity_edges (entity_a, entity_b, weight) VALUES (?, ?, 1)
                        ON CONFLICT(entity_a, entity_b) DO UPDATE SET weight = weight + 1
                        "#,
                    )
                    .bind(a)
                    .bind(b)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// All entities mentioned in a fragment, ordered by name.
    pub async fn entities_for_fragment(&self, fragment_id: &str) -> Result<Vec<Entity>> {
        let rows = sqlx::query(
            r#"
            SELECT e.id, e.name, e.kind, e.mention_count
            FROM entity_mentions m
            JOIN entities e ON e.id = m.entity_id
            WHERE m.fragment_id = ?
            ORDER BY e.name
            "#,
        )
        .bind(fragment_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_entity).collect())
    }

    /// Entities one co-occurrence hop away, ranked by edge weight
    /// descending, name ascending for determinism.
    pub async fn related_entities(&self, entity_id: i64, limit: usize) -> Result<Vec<(Entity, i64)>> {
        let rows = sqlx::query(
            r#"
            SELECT e.id, e.name, e.kind, e.mention_count, g.weight
            FROM (
                SELECT entity_b AS other, weight FROM entity_edges WHERE entity_a = ?
                UNION ALL
                SELECT entity_a AS other, weight FROM entity_edges WHERE entity_b = ?
            ) g
            JOIN entities e ON e.id = g.other
            ORDER BY g.weight DESC, e.name ASC
            LIMIT ?
            "#,
        )
        .bind(entity_id)
        .bind(entity_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| (row_to_entity(row), row.get::<i64, _>("weight")))
            .collect())
    }

    /// Cascade a document removal: drop its mentions and edge provenance,
    /// recompute mention counts and edge weights from what remains, and
    /// delete entities and edges left without any provenance.
    pub async fn remove_document(&self, document_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM entity_mentions WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM edge_provenance WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            UPDATE entity_edges SET weight = (
                SELECT COUNT(*) FROM edge_provenance p
                WHERE p.entity_a = entity_edges.entity_a AND p.entity_b = entity_edges.entity_b
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM entity_edges WHERE weight = 0")
            .execute(&mut *tx)
            .await?;

        // Mention counts follow the same rule as edge weights: recompute
        // from surviving mentions, then drop entities left with none
        sqlx::query(
            r#"
            UPDATE entities SET mention_count = (
                SELECT COUNT(*) FROM entity_mentions m WHERE m.entity_id = entities.id
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM entities WHERE mention_count = 0")
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn entity_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entities")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn relation_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entity_edges")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

fn row_to_entity(row: &sqlx::sqlite::SqliteRow) -> Entity {
    Entity {
        id: row.get("id"),
        name: row.get("name"),
        kind: row.get("kind"),
        mention_count: row.get("mention_count"),
    }
}
