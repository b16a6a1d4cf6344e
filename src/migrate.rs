use anyhow::Result;
use sqlx::SqlitePool;

/// Create all tables and indexes. Idempotent — safe to run on every start.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Documents and their fragments
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            source TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            fragment_count INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS fragments (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            text TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE(document_id, position),
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Embedding vectors, one BLOB of little-endian f32 per fragment
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS fragment_vectors (
            fragment_id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            FOREIGN KEY (fragment_id) REFERENCES fragments(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Entity graph: entities, per-fragment mentions, co-occurrence edges
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entities (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            kind TEXT NOT NULL,
            mention_count INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entity_mentions (
            entity_id INTEGER NOT NULL,
            fragment_id TEXT NOT NULL,
            document_id TEXT NOT NULL,
            PRIMARY KEY (entity_id, fragment_id),
            FOREIGN KEY (entity_id) REFERENCES entities(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Unordered pair stored with entity_a < entity_b; weight equals the
    // number of provenance rows while those fragments exist
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entity_edges (
            entity_a INTEGER NOT NULL,
            entity_b INTEGER NOT NULL,
            weight INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (entity_a, entity_b),
            CHECK (entity_a < entity_b)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS edge_provenance (
            entity_a INTEGER NOT NULL,
            entity_b INTEGER NOT NULL,
            fragment_id TEXT NOT NULL,
            document_id TEXT NOT NULL,
            PRIMARY KEY (entity_a, entity_b, fragment_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Sessions: append-only turn log keyed by session id
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            created_at INTEGER NOT NULL,
            last_active_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS session_turns (
            session_id TEXT NOT NULL,
            turn_index INTEGER NOT NULL,
            question TEXT NOT NULL,
            answer_summary TEXT NOT NULL,
            fragment_ids TEXT NOT NULL DEFAULT '[]',
            created_at INTEGER NOT NULL,
            PRIMARY KEY (session_id, turn_index),
            FOREIGN KEY (session_id) REFERENCES sessions(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_fragments_document_id ON fragments(document_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_fragment_vectors_document_id ON fragment_vectors(document_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_entity_mentions_fragment ON entity_mentions(fragment_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_entity_mentions_document ON entity_mentions(document_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_edge_provenance_document ON edge_provenance(document_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
