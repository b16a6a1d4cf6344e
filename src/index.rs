//! SQLite-backed vector index.
//!
//! Stores one embedding BLOB per fragment and answers nearest-neighbor
//! queries by brute-force cosine similarity computed in Rust. Document
//! writes are transactional, so concurrent readers observe either the
//! pre-ingestion or post-ingestion state of a document, never a partial
//! one.

use sqlx::{Row, SqlitePool};

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::Result;
use crate::models::Fragment;

/// A raw nearest-neighbor hit before ranking and deduplication.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub fragment: Fragment,
    /// Cosine distance: `1 − cos(query, fragment)`, in `[0, 2]`.
    pub distance: f64,
}

/// Handle to the fragment/vector store. Cheap to clone.
#[derive(Clone)]
pub struct VectorIndex {
    pool: SqlitePool,
}

impl VectorIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Replace a document and all of its fragments and vectors in one
    /// transaction.
    pub async fn insert_document(
        &self,
        document_id: &str,
        source: &str,
        created_at: i64,
        fragments: &[Fragment],
        vectors: &[Vec<f32>],
    ) -> Result<()> {
        debug_assert_eq!(fragments.len(), vectors.len());

        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM fragment_vectors WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM fragments WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO documents (id, source, created_at, fragment_count)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                source = excluded.source,
                fragment_count = excluded.fragment_count
            "#,
        )
        .bind(document_id)
        .bind(source)
        .bind(created_at)
        .bind(fragments.len() as i64)
        .execute(&mut *tx)
        .await?;

        for (fragment, vector) in fragments.iter().zip(vectors.iter()) {
            sqlx::query(
                "INSERT INTO fragments (id, document_id, position, text, created_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&fragment.id)
            .bind(&fragment.document_id)
            .bind(fragment.position)
            .bind(&fragment.text)
            .bind(fragment.created_at)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO fragment_vectors (fragment_id, document_id, dims, embedding) VALUES (?, ?, ?, ?)",
            )
            .bind(&fragment.id)
            .bind(&fragment.document_id)
            .bind(vector.len() as i64)
            .bind(vec_to_blob(vector))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Top-`k` nearest fragments by cosine distance, ascending.
    ///
    /// Ties are left to the caller; the returned order within equal
    /// distances follows fragment id ascending for determinism.
    pub async fn query(
        &self,
        query_vector: &[f32],
        k: usize,
        doc_filter: Option<&str>,
    ) -> Result<Vec<VectorHit>> {
        let rows = match doc_filter {
            Some(doc_id) => {
                sqlx::query(
                    r#"
                    SELECT f.id, f.document_id, f.position, f.text, f.created_at, v.embedding
                    FROM fragment_vectors v
                    JOIN fragments f ON f.id = v.fragment_id
                    WHERE f.document_id = ?
                    "#,
                )
                .bind(doc_id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT f.id, f.document_id, f.position, f.text, f.created_at, v.embedding
                    FROM fragment_vectors v
                    JOIN fragments f ON f.id = v.fragment_id
                    "#,
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        let mut hits: Vec<VectorHit> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let vec = blob_to_vec(&blob);
                let similarity = cosine_similarity(query_vector, &vec) as f64;
                VectorHit {
                    fragment: Fragment {
                        id: row.get("id"),
                        document_id: row.get("document_id"),
                        position: row.get("position"),
                        text: row.get("text"),
                        created_at: row.get("created_at"),
                    },
                    distance: 1.0 - similarity,
                }
            })
            .collect();

        hits.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.fragment.id.cmp(&b.fragment.id))
        });
        hits.truncate(k);

        Ok(hits)
    }

    /// Delete a document, cascading to its fragments and vectors.
    /// Returns the number of fragments removed.
    pub async fn delete_document(&self, document_id: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM fragment_vectors WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM fragments WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(deleted)
    }

    pub async fn fragment_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM fragments")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn document_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
