//! Schema migration for the memory store. Idempotent; runs on startup.

use rusqlite::Connection;

use crate::error::Result;

pub fn init_db(conn: &Connection) -> Result<()> {
    create_items_table(conn)?;
    create_fts_index(conn)?;
    create_retrieval_events_table(conn)?;
    Ok(())
}

fn create_items_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS memory_items (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            owner_user_id   TEXT NOT NULL,
            source_scope_id TEXT,
            session_id      TEXT,
            channel         TEXT,
            tier            TEXT NOT NULL DEFAULT 'short',
            memory_type     TEXT NOT NULL DEFAULT 'turn',
            domain          TEXT NOT NULL DEFAULT 'general',
            topic           TEXT NOT NULL DEFAULT 'misc',
            item            TEXT NOT NULL DEFAULT 'item',
            content         TEXT NOT NULL,
            summary         TEXT NOT NULL,
            importance      REAL NOT NULL DEFAULT 0.5,
            confidence      REAL NOT NULL DEFAULT 0.5,
            pinned          INTEGER NOT NULL DEFAULT 0,
            skill_name      TEXT,
            skill_key       TEXT NOT NULL DEFAULT '',
            content_hash    TEXT NOT NULL,
            access_count    INTEGER NOT NULL DEFAULT 0,
            last_accessed_at TEXT,
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL,
            is_deleted      INTEGER NOT NULL DEFAULT 0,
            embedding       TEXT,
            UNIQUE(owner_user_id, content_hash, memory_type, skill_key)
        );
        CREATE INDEX IF NOT EXISTS idx_memory_owner_tier
            ON memory_items(owner_user_id, tier, updated_at DESC);
        CREATE INDEX IF NOT EXISTS idx_memory_tree
            ON memory_items(owner_user_id, domain, topic, item);",
    )?;
    Ok(())
}

/// External-content FTS5 index over summary + content; synced manually
/// on every write.
fn create_fts_index(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE VIRTUAL TABLE IF NOT EXISTS memory_fts
            USING fts5(summary, content, content='memory_items', content_rowid='id');",
    )?;
    Ok(())
}

fn create_retrieval_events_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS memory_retrieval_events (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            owner_user_id    TEXT NOT NULL,
            session_id       TEXT,
            channel          TEXT,
            query            TEXT NOT NULL,
            query_hash       TEXT NOT NULL,
            result_count     INTEGER NOT NULL DEFAULT 0,
            top_score        REAL,
            latency_ms       INTEGER NOT NULL DEFAULT 0,
            used_vector      INTEGER NOT NULL DEFAULT 0,
            fallback_to_text INTEGER NOT NULL DEFAULT 0,
            context_injected INTEGER NOT NULL DEFAULT 0,
            injected_count   INTEGER NOT NULL DEFAULT 0,
            feedback         TEXT,
            feedback_note    TEXT,
            created_at       TEXT NOT NULL,
            updated_at       TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_retrieval_owner_created
            ON memory_retrieval_events(owner_user_id, created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_retrieval_query_hash
            ON memory_retrieval_events(owner_user_id, query_hash);",
    )?;
    Ok(())
}
