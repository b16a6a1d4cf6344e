//! Per-agent conversational sessions.
//!
//! Each session is a bounded, ordered log of question/answer turns.
//! `get_or_create` never fails: an unknown id starts an empty session,
//! and an expired id is wiped and restarted fresh. Appends on the same
//! session are serialized by a per-session mutex so turn order matches
//! call order; sessions never contend with each other. Each append runs
//! in one SQL transaction, so a cancelled request leaves either the
//! whole turn or none of it.

use chrono::Utc;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::error::Result;
use crate::models::{Session, SessionTurn};

#[derive(Clone)]
pub struct SessionManager {
    pool: SqlitePool,
    history_cap: usize,
    ttl_secs: i64,
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

/// Stored answer summaries are truncated to this many characters to
/// bound context-window growth.
const ANSWER_SUMMARY_CHARS: usize = 500;

impl SessionManager {
    pub fn new(pool: SqlitePool, history_cap: usize, ttl_secs: i64) -> Self {
        Self {
            pool,
            history_cap,
            ttl_secs,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock_for(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("session lock map poisoned");
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Fetch a session, creating it if absent. Never fails with
    /// "not found": an expired session is wiped and restarted under the
    /// same id with empty history.
    pub async fn get_or_create(&self, session_id: &str) -> Result<Session> {
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        let now = Utc::now().timestamp();

        let row = sqlx::query("SELECT created_at, last_active_at FROM sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let last_active_at: i64 = row.get("last_active_at");
                if now - last_active_at > self.ttl_secs {
                    debug!(session_id = %session_id, "session expired; restarting fresh");
                    let mut tx = self.pool.begin().await?;
                    sqlx::query("DELETE FROM session_turns WHERE session_id = ?")
                        .bind(session_id)
                        .execute(&mut *tx)
                        .await?;
                    sqlx::query(
                        "UPDATE sessions SET created_at = ?, last_active_at = ? WHERE id = ?",
                    )
                    .bind(now)
                    .bind(now)
                    .bind(session_id)
                    .execute(&mut *tx)
                    .await?;
                    tx.commit().await?;

                    return Ok(Session {
                        id: session_id.to_string(),
                        created_at: now,
                        last_active_at: now,
                        turn_count: 0,
                    });
                }

                let turn_count: i64 = sqlx::query_scalar(
                    "SELECT COUNT(*) FROM session_turns WHERE session_id = ?",
                )
                .bind(session_id)
                .fetch_one(&self.pool)
                .await?;

                Ok(Session {
                    id: session_id.to_string(),
                    created_at: row.get("created_at"),
                    last_active_at,
                    turn_count,
                })
            }
            None => {
                sqlx::query(
                    "INSERT OR IGNORE INTO sessions (id, created_at, last_active_at) VALUES (?, ?, ?)",
                )
                .bind(session_id)
                .bind(now)
                .bind(now)
                .execute(&self.pool)
                .await?;

                Ok(Session {
                    id: session_id.to_string(),
                    created_at: now,
                    last_active_at: now,
                    turn_count: 0,
                })
            }
        }
    }

    /// Append a turn, evicting the oldest turns beyond the history cap
    /// and refreshing the activity timestamp. All-or-nothing.
    pub async fn append_turn(
        &self,
        session_id: &str,
        question: &str,
        answer_summary: &str,
        fragment_ids: &[String],
    ) -> Result<()> {
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        let now = Utc::now().timestamp();
        let summary: String = answer_summary.chars().take(ANSWER_SUMMARY_CHARS).collect();
        let fragment_ids_json =
            serde_json::to_string(fragment_ids).unwrap_or_else(|_| "[]".to_string());

        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT OR IGNORE INTO sessions (id, created_at, last_active_at) VALUES (?, ?, ?)")
            .bind(session_id)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        let next_index: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(turn_index), -1) + 1 FROM session_turns WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO session_turns (session_id, turn_index, question, answer_summary, fragment_ids, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(session_id)
        .bind(next_index)
        .bind(question)
        .bind(&summary)
        .bind(&fragment_ids_json)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        // FIFO eviction beyond the history cap
        sqlx::query(
            r#"
            DELETE FROM session_turns
            WHERE session_id = ? AND turn_index <= ? - ?
            "#,
        )
        .bind(session_id)
        .bind(next_index)
        .bind(self.history_cap as i64)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE sessions SET last_active_at = ? WHERE id = ?")
            .bind(now)
            .bind(session_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Retained turns in chronological order, oldest first.
    pub async fn build_context(&self, session_id: &str) -> Result<Vec<SessionTurn>> {
        let rows = sqlx::query(
            r#"
            SELECT question, answer_summary, fragment_ids, created_at
            FROM session_turns
            WHERE session_id = ?
            ORDER BY turn_index ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let fragment_ids: Vec<String> =
                    serde_json::from_str(row.get::<String, _>("fragment_ids").as_str())
                        .unwrap_or_default();
                SessionTurn {
                    question: row.get("question"),
                    answer_summary: row.get("answer_summary"),
                    fragment_ids,
                    created_at: row.get("created_at"),
                }
            })
            .collect())
    }

    /// Explicitly destroy a session and its turns.
    pub async fn close(&self, session_id: &str) -> Result<()> {
        {
            let lock = self.lock_for(session_id);
            let _guard = lock.lock().await;

            let mut tx = self.pool.begin().await?;
            sqlx::query("DELETE FROM session_turns WHERE session_id = ?")
                .bind(session_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM sessions WHERE id = ?")
                .bind(session_id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
        }

        // Drop the mutex only when no other caller holds it; a waiter
        // queued on the old mutex must not race a fresh one
        let mut locks = self.locks.lock().expect("session lock map poisoned");
        if locks
            .get(session_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(session_id);
        }
        Ok(())
    }

    /// Remove every session idle past its TTL. Returns the number of
    /// sessions destroyed.
    pub async fn sweep_expired(&self) -> Result<u64> {
        let cutoff = Utc::now().timestamp() - self.ttl_secs;

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM session_turns WHERE session_id IN (SELECT id FROM sessions WHERE last_active_at < ?)",
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;
        let removed = sqlx::query("DELETE FROM sessions WHERE last_active_at < ?")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;

        // Drop mutexes no caller currently holds; the map must not grow
        // with every session id ever seen
        self.locks
            .lock()
            .expect("session lock map poisoned")
            .retain(|_, lock| Arc::strong_count(lock) > 1);

        if removed > 0 {
            debug!(removed, "swept expired sessions");
        }
        Ok(removed)
    }

    pub async fn session_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sessions")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn manager(dir: &TempDir) -> SessionManager {
        let pool = crate::db::connect(&dir.path().join("sessions.sqlite"))
            .await
            .unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        SessionManager::new(pool, 20, 3600)
    }

    fn lock_map_len(manager: &SessionManager) -> usize {
        manager.locks.lock().unwrap().len()
    }

    #[tokio::test]
    async fn test_close_releases_session_lock() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir).await;

        m.get_or_create("a").await.unwrap();
        m.append_turn("a", "q", "a", &[]).await.unwrap();
        assert_eq!(lock_map_len(&m), 1);

        m.close("a").await.unwrap();
        assert_eq!(lock_map_len(&m), 0);
    }

    #[tokio::test]
    async fn test_sweep_prunes_lock_map() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir).await;

        m.get_or_create("a").await.unwrap();
        m.get_or_create("b").await.unwrap();
        assert_eq!(lock_map_len(&m), 2);

        // Age both sessions past the TTL without waiting on the clock
        sqlx::query("UPDATE sessions SET last_active_at = last_active_at - 7200")
            .execute(&m.pool)
            .await
            .unwrap();

        let removed = m.sweep_expired().await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(lock_map_len(&m), 0, "idle mutexes must not accumulate");
    }

    #[tokio::test]
    async fn test_close_keeps_lock_held_elsewhere() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir).await;

        m.get_or_create("a").await.unwrap();
        // Another caller between lock_for() and .lock().await still
        // references the mutex; discarding it would allow two writers
        // on the same session id
        let _held = m.lock_for("a");

        m.close("a").await.unwrap();
        assert_eq!(lock_map_len(&m), 1);
    }
}
