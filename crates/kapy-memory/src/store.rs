//! Tiered, user-isolated memory store with vector + full-text retrieval.
//!
//! Retrieval policy: vector ANN first (cosine over stored embeddings,
//! rows kept when `score >= min_similarity` or pinned), then FTS rank,
//! then a recency listing flagged as a non-hit. Every retrieval logs an
//! event; touching rows bumps `access_count` and applies tier promotion
//! in the same statement.

use std::sync::Mutex;
use std::time::Instant;

use kapy_core::config::MemoryConfig;
use rusqlite::{params, Connection};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::classify;
use crate::db;
use crate::embed::{cosine_similarity, EmbeddingClient};
use crate::error::Result;
use crate::types::*;
use crate::SYSTEM_OWNER;

const ROW_COLUMNS: &str = "id, owner_user_id, tier, memory_type, domain, topic, item, \
     summary, content, importance, confidence, pinned, skill_name, \
     access_count, created_at, updated_at";

pub struct MemoryStore {
    pub enabled: bool,
    cfg: MemoryConfig,
    db: Mutex<Connection>,
    embedder: EmbeddingClient,
    probe_stop: CancellationToken,
    last_probe_at: Mutex<Option<String>>,
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn hash_parts(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

fn safe_slug(name: &str) -> String {
    let lowered = name.trim().to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    let mut last_dash = false;
    for c in lowered.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
            out.push(c);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    let out = out.trim_matches('-').to_string();
    if out.is_empty() {
        "shared-skill".to_string()
    } else {
        out
    }
}

/// Build an FTS5 MATCH expression from free text: each token quoted,
/// implicit AND. Returns `None` when no searchable token remains.
fn fts_query(text: &str) -> Option<String> {
    let tokens: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\""))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" "))
    }
}

impl MemoryStore {
    pub fn new(cfg: MemoryConfig) -> Result<Self> {
        let conn = Connection::open(&cfg.db_path)?;
        db::init_db(&conn)?;
        let embedder = EmbeddingClient::new(cfg.embedding.clone());
        info!(
            db = %cfg.db_path,
            embedder_configured = embedder.is_configured(),
            "memory store initialized"
        );
        Ok(Self {
            enabled: cfg.enabled,
            embedder,
            cfg,
            db: Mutex::new(conn),
            probe_stop: CancellationToken::new(),
            last_probe_at: Mutex::new(None),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory(mut cfg: MemoryConfig) -> Result<Self> {
        cfg.db_path = ":memory:".to_string();
        Self::new(cfg)
    }

    pub fn vector_supported(&self) -> bool {
        self.cfg.embedding.enabled && self.embedder.is_configured()
    }

    /// Start the background environment-probe loop, when configured.
    pub fn start(self: std::sync::Arc<Self>) {
        if !self.enabled || !self.cfg.env_probe.enabled || self.cfg.env_probe.commands.is_empty() {
            return;
        }
        let store = std::sync::Arc::clone(&self);
        let stop = self.probe_stop.clone();
        let interval = self.cfg.env_probe.interval_seconds.max(60);
        tokio::spawn(async move {
            loop {
                if let Err(e) = store.run_env_probe_once().await {
                    warn!(error = %e, "memory env probe failed");
                }
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(std::time::Duration::from_secs(interval)) => {}
                }
            }
        });
    }

    pub fn stop(&self) {
        self.probe_stop.cancel();
    }

    // ── capture ────────────────────────────────────────────────

    /// Capture one conversation turn. Returns the memory id, or `None`
    /// when capture is disabled, empty, or dropped by the safety filter.
    #[allow(clippy::too_many_arguments)]
    pub async fn capture_turn(
        &self,
        user_id: &str,
        scope_id: &str,
        session_id: &str,
        channel: &str,
        user_text: &str,
        assistant_text: &str,
    ) -> Option<i64> {
        if !self.enabled || !self.cfg.capture.enabled_auto {
            return None;
        }
        let u = classify::norm_text(user_text, self.cfg.capture.max_content_chars);
        let a = classify::norm_text(assistant_text, self.cfg.capture.assistant_max_chars);
        if u.is_empty() && a.is_empty() {
            return None;
        }
        let combined = format!("User: {u}\nAssistant: {a}").trim().to_string();
        if self.cfg.reject_sensitive && classify::contains_sensitive(&combined) {
            info!(user_id, "memory capture skipped due to sensitive pattern");
            return None;
        }

        let (memory_type, importance, confidence) = classify::classify_type(&u, &a);
        let (domain, topic, item) =
            classify::classify_tree(&u, &a, &self.cfg.default_domain, &self.cfg.default_topic);
        let tier = classify::initial_tier(memory_type, importance);
        let summary = classify::build_summary(&u, &a, &domain, &topic);
        let embedding = self.embed(&format!("{summary}\n{combined}")).await;

        self.insert_memory_sync(
            user_id,
            Some(scope_id),
            Some(session_id),
            Some(channel),
            tier,
            memory_type,
            &domain,
            &topic,
            &item,
            &combined,
            &summary,
            importance,
            confidence,
            None,
            embedding.as_deref(),
        )
    }

    /// Store a manual note (`/memory note …`). Notes start in `mid`.
    pub async fn add_note(
        &self,
        user_id: &str,
        scope_id: &str,
        session_id: Option<&str>,
        channel: &str,
        text: &str,
    ) -> Option<i64> {
        if !self.enabled {
            return None;
        }
        let note = classify::norm_text(text, self.cfg.capture.max_content_chars);
        if note.is_empty() {
            return None;
        }
        if self.cfg.reject_sensitive && classify::contains_sensitive(&note) {
            return None;
        }
        let (domain, topic, item) =
            classify::classify_tree(&note, "", &self.cfg.default_domain, &self.cfg.default_topic);
        let summary = format!("[manual] {}", note.chars().take(120).collect::<String>());
        let embedding = self.embed(&format!("{summary}\n{note}")).await;
        self.insert_memory_sync(
            user_id,
            Some(scope_id),
            session_id,
            Some(channel),
            "mid",
            "note",
            &domain,
            &topic,
            &item,
            &note,
            &summary,
            1.0,
            0.95,
            None,
            embedding.as_deref(),
        )
    }

    async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        if !self.vector_supported() {
            return None;
        }
        self.embedder.embed(text).await
    }

    /// Dedup upsert keyed on `(owner, content_hash, memory_type,
    /// skill_key)`; conflicting inserts refresh content and keep the
    /// higher importance/confidence.
    #[allow(clippy::too_many_arguments)]
    fn insert_memory_sync(
        &self,
        owner_user_id: &str,
        scope_id: Option<&str>,
        session_id: Option<&str>,
        channel: Option<&str>,
        tier: &str,
        memory_type: &str,
        domain: &str,
        topic: &str,
        item: &str,
        content: &str,
        summary: &str,
        importance: f64,
        confidence: f64,
        skill_name: Option<&str>,
        embedding: Option<&[f32]>,
    ) -> Option<i64> {
        let content_hash = hash_parts(&[
            owner_user_id,
            memory_type,
            content,
            skill_name.unwrap_or(""),
        ]);
        let skill_key = skill_name.unwrap_or("");
        let importance = importance.clamp(0.0, 1.0);
        let confidence = confidence.clamp(0.0, 1.0);
        let now = now_rfc3339();
        let embedding_json =
            embedding.map(|v| serde_json::to_string(v).unwrap_or_else(|_| "[]".to_string()));

        let db = self.db.lock().unwrap();
        let existing: Option<i64> = db
            .query_row(
                "SELECT id FROM memory_items
                 WHERE owner_user_id = ?1 AND content_hash = ?2
                   AND memory_type = ?3 AND skill_key = ?4",
                params![owner_user_id, content_hash, memory_type, skill_key],
                |row| row.get(0),
            )
            .ok();

        let result = match existing {
            Some(id) => {
                // External-content FTS delete needs the values as indexed,
                // so it must run before the row is updated.
                let _ = db.execute(
                    "INSERT INTO memory_fts(memory_fts, rowid, summary, content)
                     SELECT 'delete', id, summary, content FROM memory_items WHERE id = ?1",
                    params![id],
                );
                let updated = db.execute(
                    "UPDATE memory_items SET
                        summary = ?1,
                        content = ?2,
                        importance = MAX(importance, ?3),
                        confidence = MAX(confidence, ?4),
                        updated_at = ?5,
                        embedding = COALESCE(?6, embedding)
                     WHERE id = ?7",
                    params![summary, content, importance, confidence, now, embedding_json, id],
                );
                if updated.is_err() {
                    return None;
                }
                let _ = db.execute(
                    "INSERT INTO memory_fts(rowid, summary, content) VALUES (?1, ?2, ?3)",
                    params![id, summary, content],
                );
                Some(id)
            }
            None => {
                let inserted = db.execute(
                    "INSERT INTO memory_items (
                        owner_user_id, source_scope_id, session_id, channel,
                        tier, memory_type, domain, topic, item,
                        content, summary, importance, confidence,
                        pinned, skill_name, skill_key, content_hash,
                        created_at, updated_at, embedding
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                              0, ?14, ?15, ?16, ?17, ?17, ?18)",
                    params![
                        owner_user_id,
                        scope_id,
                        session_id,
                        channel,
                        tier,
                        memory_type,
                        domain,
                        topic,
                        item,
                        content,
                        summary,
                        importance,
                        confidence,
                        skill_name,
                        skill_key,
                        content_hash,
                        now,
                        embedding_json,
                    ],
                );
                if inserted.is_err() {
                    return None;
                }
                let id = db.last_insert_rowid();
                let _ = db.execute(
                    "INSERT INTO memory_fts(rowid, summary, content) VALUES (?1, ?2, ?3)",
                    params![id, summary, content],
                );
                Some(id)
            }
        };
        result
    }

    // ── retrieval ─────────────────────────────────────────────

    pub async fn search_memories(
        &self,
        user_id: &str,
        query: &str,
        limit: usize,
        min_score: f64,
    ) -> Vec<MemoryRecord> {
        self.search_memories_with_event(user_id, query, None, None, limit, min_score)
            .await
            .0
    }

    /// Search and log a retrieval event; returns the rows and the event id.
    pub async fn search_memories_with_event(
        &self,
        user_id: &str,
        query: &str,
        session_id: Option<&str>,
        channel: Option<&str>,
        limit: usize,
        min_score: f64,
    ) -> (Vec<MemoryRecord>, Option<i64>) {
        if !self.enabled {
            return (Vec::new(), None);
        }
        let q = classify::norm_text(query, 600);
        if q.is_empty() {
            return (Vec::new(), None);
        }
        let limit = limit.max(1);
        let started = Instant::now();
        let mut used_vector = false;
        let mut fallback_to_text = false;
        let mut effective_result_count;

        let mut rows = Vec::new();
        if let Some(vector) = self.embed(&q).await {
            used_vector = true;
            rows = self.search_vector_sync(user_id, &vector, limit, min_score);
        }
        effective_result_count = rows.len();
        if rows.is_empty() {
            fallback_to_text = used_vector;
            let (text_rows, matched) = self.search_text_sync(user_id, &q, limit);
            effective_result_count = if matched { text_rows.len() } else { 0 };
            rows = text_rows;
        }

        let latency_ms = started.elapsed().as_millis() as i64;
        let top_score = if effective_result_count > 0 {
            rows.first().map(|r| r.score)
        } else {
            None
        };
        let retrieval_id = self.log_retrieval_event_sync(
            user_id,
            session_id,
            channel,
            &q,
            effective_result_count as i64,
            top_score,
            latency_ms,
            used_vector,
            fallback_to_text,
        );
        (rows, retrieval_id)
    }

    fn search_vector_sync(
        &self,
        user_id: &str,
        vector: &[f32],
        limit: usize,
        min_score: f64,
    ) -> Vec<MemoryRecord> {
        let candidates = {
            let db = self.db.lock().unwrap();
            let mut stmt = match db.prepare(&format!(
                "SELECT {ROW_COLUMNS}, embedding FROM memory_items
                 WHERE is_deleted = 0
                   AND embedding IS NOT NULL
                   AND (owner_user_id = ?1 OR owner_user_id = ?2)
                 ORDER BY updated_at DESC
                 LIMIT ?3"
            )) {
                Ok(stmt) => stmt,
                Err(_) => return Vec::new(),
            };
            let mapped = stmt.query_map(
                params![user_id, SYSTEM_OWNER, self.cfg.retrieval.candidate_limit as i64],
                |row| {
                    let mut record = row_to_record(row)?;
                    let embedding_json: Option<String> = row.get(16)?;
                    let embedding: Vec<f32> = embedding_json
                        .and_then(|j| serde_json::from_str(&j).ok())
                        .unwrap_or_default();
                    record.score = cosine_similarity(&embedding, vector);
                    Ok(record)
                },
            );
            match mapped {
                Ok(rows) => rows.filter_map(|r| r.ok()).collect::<Vec<_>>(),
                Err(_) => Vec::new(),
            }
        };

        let mut kept: Vec<MemoryRecord> = candidates
            .into_iter()
            .filter(|r| r.score >= min_score || r.pinned)
            .collect();
        kept.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.pinned.cmp(&a.pinned))
                .then(b.updated_at.cmp(&a.updated_at))
        });
        kept.truncate(limit);
        self.touch_rows_sync(&kept);
        kept
    }

    /// FTS rank search; on empty, a recency listing is returned with
    /// `matched = false` so the caller can log a zero-hit event.
    fn search_text_sync(&self, user_id: &str, query: &str, limit: usize) -> (Vec<MemoryRecord>, bool) {
        let db = self.db.lock().unwrap();
        let mut rows: Vec<MemoryRecord> = Vec::new();
        if let Some(match_expr) = fts_query(query) {
            if let Ok(mut stmt) = db.prepare(&format!(
                "SELECT {ROW_COLUMNS}, -bm25(memory_fts) AS score
                 FROM memory_items m
                 JOIN memory_fts f ON m.id = f.rowid
                 WHERE m.is_deleted = 0
                   AND (m.owner_user_id = ?1 OR m.owner_user_id = ?2)
                   AND memory_fts MATCH ?3
                 ORDER BY m.pinned DESC, score DESC, m.access_count DESC, m.updated_at DESC
                 LIMIT ?4"
            )) {
                if let Ok(mapped) = stmt.query_map(
                    params![user_id, SYSTEM_OWNER, match_expr, limit as i64],
                    |row| {
                        let mut record = row_to_record(row)?;
                        record.score = row.get::<_, f64>(16).unwrap_or(0.0);
                        Ok(record)
                    },
                ) {
                    rows = mapped.filter_map(|r| r.ok()).collect();
                }
            }
        }
        let matched = !rows.is_empty();
        if !matched {
            if let Ok(mut stmt) = db.prepare(&format!(
                "SELECT {ROW_COLUMNS} FROM memory_items
                 WHERE is_deleted = 0
                   AND (owner_user_id = ?1 OR owner_user_id = ?2)
                 ORDER BY pinned DESC, access_count DESC, updated_at DESC
                 LIMIT ?3"
            )) {
                if let Ok(mapped) =
                    stmt.query_map(params![user_id, SYSTEM_OWNER, limit as i64], row_to_record)
                {
                    rows = mapped.filter_map(|r| r.ok()).collect();
                }
            }
        }
        drop(db);
        if !rows.is_empty() {
            self.touch_rows_sync(&rows);
        }
        (rows, matched)
    }

    /// Bump access counters and apply tier promotion atomically.
    fn touch_rows_sync(&self, rows: &[MemoryRecord]) {
        if rows.is_empty() {
            return;
        }
        let ids: Vec<String> = rows.iter().map(|r| r.memory_id.to_string()).collect();
        let now = now_rfc3339();
        let sql = format!(
            "UPDATE memory_items
             SET access_count = access_count + 1,
                 last_accessed_at = ?1,
                 updated_at = ?1,
                 tier = CASE
                     WHEN pinned = 1 THEN 'long'
                     WHEN access_count + 1 >= ?2 THEN 'long'
                     WHEN access_count + 1 >= ?3 AND tier = 'short' THEN 'mid'
                     ELSE tier
                 END
             WHERE id IN ({})",
            ids.join(",")
        );
        let db = self.db.lock().unwrap();
        if let Err(e) = db.execute(
            &sql,
            params![
                now,
                self.cfg.tiers.promote_hits_mid_to_long,
                self.cfg.tiers.promote_hits_short_to_mid
            ],
        ) {
            warn!(error = %e, "failed to touch memory rows");
        }
    }

    // ── context injection ─────────────────────────────────────

    /// Bounded `[MEMORY CONTEXT]` block for prompt injection. Marks the
    /// retrieval event as injected with the line count.
    pub async fn build_memory_context(
        &self,
        user_id: &str,
        query: &str,
        session_id: Option<&str>,
        channel: Option<&str>,
    ) -> String {
        if !self.enabled {
            return String::new();
        }
        let q = classify::norm_text(query, 800);
        if q.is_empty() {
            return String::new();
        }
        let (rows, retrieval_id) = self
            .search_memories_with_event(
                user_id,
                &q,
                session_id,
                channel,
                self.cfg.retrieval.top_k,
                self.cfg.retrieval.min_similarity,
            )
            .await;
        if rows.is_empty() {
            return String::new();
        }

        let budget = self.cfg.retrieval.context_char_limit.max(200);
        let mut lines = vec!["[MEMORY CONTEXT]".to_string()];
        let mut consumed = lines[0].len() + 1;
        for row in &rows {
            let line = format!("- ({}|{}/{}) {}", row.tier, row.domain, row.topic, row.summary);
            if consumed + line.len() + 1 > budget {
                break;
            }
            consumed += line.len() + 1;
            lines.push(line);
        }
        let injected_count = (lines.len() - 1) as i64;
        lines.push("[END MEMORY CONTEXT]".to_string());

        if let Some(id) = retrieval_id {
            self.mark_context_injected_sync(id, user_id, injected_count);
        }
        format!("{}\n\n", lines.join("\n"))
    }

    // ── management ────────────────────────────────────────────

    pub fn list_memories(&self, user_id: &str, tier: Option<&str>, limit: usize) -> Vec<MemoryRecord> {
        if !self.enabled {
            return Vec::new();
        }
        let limit = limit.clamp(1, 100) as i64;
        let db = self.db.lock().unwrap();
        let run = |stmt: &mut rusqlite::Statement<'_>, p: &[&dyn rusqlite::ToSql]| {
            stmt.query_map(p, row_to_record)
                .map(|rows| rows.filter_map(|r| r.ok()).collect::<Vec<_>>())
                .unwrap_or_default()
        };
        match tier.filter(|t| *t != "all") {
            Some(tier) => {
                let mut stmt = match db.prepare(&format!(
                    "SELECT {ROW_COLUMNS} FROM memory_items
                     WHERE is_deleted = 0 AND tier = ?1
                       AND (owner_user_id = ?2 OR owner_user_id = ?3)
                     ORDER BY pinned DESC, updated_at DESC LIMIT ?4"
                )) {
                    Ok(stmt) => stmt,
                    Err(_) => return Vec::new(),
                };
                run(&mut stmt, &[&tier, &user_id, &SYSTEM_OWNER, &limit])
            }
            None => {
                let mut stmt = match db.prepare(&format!(
                    "SELECT {ROW_COLUMNS} FROM memory_items
                     WHERE is_deleted = 0
                       AND (owner_user_id = ?1 OR owner_user_id = ?2)
                     ORDER BY pinned DESC, updated_at DESC LIMIT ?3"
                )) {
                    Ok(stmt) => stmt,
                    Err(_) => return Vec::new(),
                };
                run(&mut stmt, &[&user_id, &SYSTEM_OWNER, &limit])
            }
        }
    }

    pub fn get_memory(&self, user_id: &str, memory_id: i64) -> Option<MemoryRecord> {
        if !self.enabled {
            return None;
        }
        let db = self.db.lock().unwrap();
        db.query_row(
            &format!(
                "SELECT {ROW_COLUMNS} FROM memory_items
                 WHERE id = ?1 AND is_deleted = 0
                   AND (owner_user_id = ?2 OR owner_user_id = ?3)"
            ),
            params![memory_id, user_id, SYSTEM_OWNER],
            row_to_record,
        )
        .ok()
    }

    /// Soft delete; only the owner can forget a record.
    pub fn forget_memory(&self, user_id: &str, memory_id: i64) -> bool {
        if !self.enabled {
            return false;
        }
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE memory_items SET is_deleted = 1, updated_at = ?1
             WHERE id = ?2 AND owner_user_id = ?3 AND is_deleted = 0",
            params![now_rfc3339(), memory_id, user_id],
        )
        .map(|n| n > 0)
        .unwrap_or(false)
    }

    /// Pinning also promotes the record to `long`.
    pub fn set_pinned(&self, user_id: &str, memory_id: i64, pinned: bool) -> bool {
        if !self.enabled {
            return false;
        }
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE memory_items
             SET pinned = ?1,
                 tier = CASE WHEN ?1 THEN 'long' ELSE tier END,
                 updated_at = ?2
             WHERE id = ?3 AND owner_user_id = ?4 AND is_deleted = 0",
            params![pinned, now_rfc3339(), memory_id, user_id],
        )
        .map(|n| n > 0)
        .unwrap_or(false)
    }

    /// Cross-user sharing is disabled; the operation is a recorded no-op.
    pub fn share_memory_as_skill(&self, user_id: &str, memory_id: i64, _skill_name: &str) -> Option<String> {
        info!(user_id, memory_id, "cross-user memory sharing is disabled");
        None
    }

    // ── retrieval telemetry ───────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    fn log_retrieval_event_sync(
        &self,
        user_id: &str,
        session_id: Option<&str>,
        channel: Option<&str>,
        query: &str,
        result_count: i64,
        top_score: Option<f64>,
        latency_ms: i64,
        used_vector: bool,
        fallback_to_text: bool,
    ) -> Option<i64> {
        let query_text = classify::norm_text(query, 600);
        let query_hash = hash_parts(&[user_id, &query_text]);
        let now = now_rfc3339();
        let db = self.db.lock().unwrap();
        let result = db.execute(
            "INSERT INTO memory_retrieval_events (
                owner_user_id, session_id, channel, query, query_hash,
                result_count, top_score, latency_ms, used_vector,
                fallback_to_text, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
            params![
                user_id,
                session_id,
                channel,
                query_text,
                query_hash,
                result_count.max(0),
                top_score,
                latency_ms.max(0),
                used_vector,
                fallback_to_text,
                now,
            ],
        );
        match result {
            Ok(_) => Some(db.last_insert_rowid()),
            Err(e) => {
                warn!(error = %e, "failed to log retrieval event");
                None
            }
        }
    }

    fn mark_context_injected_sync(&self, retrieval_id: i64, user_id: &str, injected_count: i64) {
        let db = self.db.lock().unwrap();
        let _ = db.execute(
            "UPDATE memory_retrieval_events
             SET context_injected = 1, injected_count = MAX(0, ?1), updated_at = ?2
             WHERE id = ?3 AND owner_user_id = ?4",
            params![injected_count, now_rfc3339(), retrieval_id, user_id],
        );
    }

    pub fn record_retrieval_feedback(
        &self,
        user_id: &str,
        retrieval_id: i64,
        feedback: &str,
        note: Option<&str>,
    ) -> bool {
        if !self.enabled {
            return false;
        }
        let fb = feedback.trim().to_lowercase();
        if fb != "good" && fb != "bad" {
            return false;
        }
        let safe_note = note
            .map(|n| classify::norm_text(n, 300))
            .filter(|n| !n.is_empty());
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE memory_retrieval_events
             SET feedback = ?1, feedback_note = ?2, updated_at = ?3
             WHERE id = ?4 AND owner_user_id = ?5",
            params![fb, safe_note, now_rfc3339(), retrieval_id, user_id],
        )
        .map(|n| n > 0)
        .unwrap_or(false)
    }

    pub fn retrieval_stats(&self, user_id: &str, days: i64) -> RetrievalStats {
        let span_days = days.clamp(1, 90);
        let mut out = RetrievalStats {
            days: span_days,
            ..Default::default()
        };
        if !self.enabled {
            return out;
        }
        let cutoff = (chrono::Utc::now() - chrono::Duration::days(span_days)).to_rfc3339();
        let db = self.db.lock().unwrap();
        let row = db.query_row(
            "SELECT
                COUNT(*),
                COALESCE(SUM(result_count > 0), 0),
                COALESCE(SUM(context_injected), 0),
                COALESCE(AVG(result_count), 0.0),
                COALESCE(AVG(latency_ms), 0.0),
                COALESCE(SUM(used_vector), 0),
                COALESCE(SUM(feedback = 'good'), 0),
                COALESCE(SUM(feedback = 'bad'), 0)
             FROM memory_retrieval_events
             WHERE owner_user_id = ?1 AND created_at >= ?2",
            params![user_id, cutoff],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, i64>(7)?,
                ))
            },
        );
        if let Ok((total, hits, injected, avg_count, avg_latency, vector, good, bad)) = row {
            out.total_queries = total;
            out.hit_queries = hits;
            out.context_injected_queries = injected;
            out.avg_result_count = avg_count;
            out.avg_latency_ms = avg_latency;
            out.vector_queries = vector;
            out.feedback_good = good;
            out.feedback_bad = bad;
            let feedback_total = good + bad;
            if total > 0 {
                out.hit_rate = hits as f64 / total as f64;
                out.context_inject_rate = injected as f64 / total as f64;
                out.vector_usage_rate = vector as f64 / total as f64;
                out.feedback_coverage = feedback_total as f64 / total as f64;
            }
            if feedback_total > 0 {
                out.positive_feedback_rate = good as f64 / feedback_total as f64;
            }
        }
        out
    }

    pub fn recent_retrieval_events(&self, user_id: &str, limit: usize) -> Vec<RetrievalEvent> {
        if !self.enabled {
            return Vec::new();
        }
        let limit = limit.clamp(1, 50) as i64;
        let db = self.db.lock().unwrap();
        let mut stmt = match db.prepare(
            "SELECT id, query, result_count, top_score, latency_ms,
                    context_injected, feedback, created_at
             FROM memory_retrieval_events
             WHERE owner_user_id = ?1
             ORDER BY created_at DESC, id DESC
             LIMIT ?2",
        ) {
            Ok(stmt) => stmt,
            Err(_) => return Vec::new(),
        };
        stmt.query_map(params![user_id, limit], |row| {
            Ok(RetrievalEvent {
                retrieval_id: row.get(0)?,
                query: row.get(1)?,
                result_count: row.get(2)?,
                top_score: row.get(3)?,
                latency_ms: row.get(4)?,
                context_injected: row.get(5)?,
                feedback: row.get(6)?,
                created_at: row.get(7)?,
            })
        })
        .map(|rows| rows.filter_map(|r| r.ok()).collect())
        .unwrap_or_default()
    }

    pub fn user_stats(&self, user_id: &str) -> UserStats {
        if !self.enabled {
            return UserStats::default();
        }
        let db = self.db.lock().unwrap();
        let user_items = db
            .query_row(
                "SELECT COUNT(*) FROM memory_items
                 WHERE is_deleted = 0 AND owner_user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .unwrap_or(0);
        UserStats {
            user_items,
            vector_supported: self.vector_supported(),
        }
    }

    pub fn health_stats(&self) -> HealthStats {
        if !self.enabled {
            return HealthStats::default();
        }
        let db = self.db.lock().unwrap();
        let total_items = db
            .query_row(
                "SELECT COUNT(*) FROM memory_items WHERE is_deleted = 0",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);
        HealthStats {
            enabled: true,
            total_items,
            vector_supported: self.vector_supported(),
            last_probe_at: self.last_probe_at.lock().unwrap().clone(),
        }
    }

    // ── env probe ─────────────────────────────────────────────

    async fn run_env_probe_once(&self) -> Result<()> {
        for cmd in &self.cfg.env_probe.commands {
            if cmd.is_empty() {
                continue;
            }
            let output = self.exec_probe_cmd(cmd).await;
            if output.is_empty() {
                continue;
            }
            let first_line = output.lines().next().unwrap_or("");
            let summary = format!(
                "[env] {} -> {}",
                cmd.join(" "),
                first_line.chars().take(120).collect::<String>()
            );
            if self.cfg.reject_sensitive && classify::contains_sensitive(&output) {
                continue;
            }
            let embedding = self.embed(&format!("{summary}\n{output}")).await;
            self.insert_memory_sync(
                SYSTEM_OWNER,
                Some("system:env"),
                Some("env-probe"),
                Some("system"),
                "long",
                "env",
                "operations",
                "environment",
                &safe_slug(&cmd.join(" ")),
                &output,
                &summary,
                0.8,
                0.8,
                None,
                embedding.as_deref(),
            );
        }
        *self.last_probe_at.lock().unwrap() = Some(now_rfc3339());
        Ok(())
    }

    async fn exec_probe_cmd(&self, cmd: &[String]) -> String {
        let timeout = std::time::Duration::from_secs(self.cfg.env_probe.timeout_seconds.max(1));
        let header = format!("$ {}", cmd.join(" "));
        let mut command = tokio::process::Command::new(&cmd[0]);
        command.args(&cmd[1..]);
        let result = tokio::time::timeout(timeout, command.output()).await;
        let payload = match result {
            Ok(Ok(output)) => {
                let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stderr.is_empty() {
                    text.push('\n');
                    text.push_str(&stderr);
                }
                let text = text.trim().to_string();
                if text.is_empty() {
                    format!("(exit={})", output.status.code().unwrap_or(-1))
                } else {
                    text
                }
            }
            Ok(Err(e)) => format!("error: {e}"),
            Err(_) => "error: probe timed out".to_string(),
        };
        let max = self.cfg.env_probe.max_output_chars.max(100);
        let clipped: String = payload.chars().take(max).collect();
        let suffix = if clipped.len() < payload.len() { "..." } else { "" };
        format!("{header}\n{clipped}{suffix}")
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryRecord> {
    Ok(MemoryRecord {
        memory_id: row.get(0)?,
        owner_user_id: row.get(1)?,
        tier: row.get(2)?,
        memory_type: row.get(3)?,
        domain: row.get(4)?,
        topic: row.get(5)?,
        item: row.get(6)?,
        summary: row.get(7)?,
        content: row.get(8)?,
        importance: row.get(9)?,
        confidence: row.get(10)?,
        pinned: row.get(11)?,
        skill_name: row.get(12)?,
        access_count: row.get(13)?,
        score: 0.0,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        let cfg = MemoryConfig {
            enabled: true,
            embedding: kapy_core::config::EmbeddingConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        };
        MemoryStore::open_in_memory(cfg).unwrap()
    }

    #[tokio::test]
    async fn capture_and_find_by_text() {
        let s = store();
        let id = s
            .capture_turn(
                "u1",
                "telegram:dm:u1",
                "aabbccdd",
                "telegram",
                "how do I run pytest for this repo",
                "use `pytest -x tests/`",
            )
            .await
            .unwrap();
        assert!(id > 0);

        let (rows, event) = s
            .search_memories_with_event("u1", "pytest", None, None, 5, 0.2)
            .await;
        assert!(!rows.is_empty());
        assert!(event.is_some());
        assert_eq!(rows[0].domain, "engineering");
        assert_eq!(rows[0].topic, "testing");
    }

    #[tokio::test]
    async fn sensitive_turns_are_dropped() {
        let s = store();
        let id = s
            .capture_turn(
                "u1",
                "scope",
                "aabbccdd",
                "telegram",
                "my token = abcdef123456",
                "noted",
            )
            .await;
        assert!(id.is_none());
    }

    #[tokio::test]
    async fn duplicate_capture_dedupes() {
        let s = store();
        let a = s
            .capture_turn("u1", "scope", "sess", "telegram", "remember this fact", "ok")
            .await
            .unwrap();
        let b = s
            .capture_turn("u1", "scope", "sess", "telegram", "remember this fact", "ok")
            .await
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(s.user_stats("u1").user_items, 1);
    }

    #[tokio::test]
    async fn cross_user_isolation_holds() {
        let s = store();
        s.capture_turn("u1", "scope", "sess", "telegram", "u1 secret pytest recipe", "ok")
            .await
            .unwrap();
        let (rows, _) = s
            .search_memories_with_event("u2", "pytest", None, None, 5, 0.2)
            .await;
        assert!(rows.is_empty() || rows.iter().all(|r| r.owner_user_id != "u1"));
    }

    #[tokio::test]
    async fn recency_fallback_is_flagged_as_non_hit() {
        let s = store();
        s.capture_turn("u1", "scope", "sess", "telegram", "completely unrelated", "ok")
            .await
            .unwrap();
        let (rows, event_id) = s
            .search_memories_with_event("u1", "zzzqqqxxx", None, None, 5, 0.2)
            .await;
        // Fallback rows are returned but the event logs zero hits.
        assert!(!rows.is_empty());
        let events = s.recent_retrieval_events("u1", 1);
        assert_eq!(events[0].retrieval_id, event_id.unwrap());
        assert_eq!(events[0].result_count, 0);
        assert!(events[0].top_score.is_none());
    }

    #[tokio::test]
    async fn access_promotes_tiers() {
        let s = store();
        s.capture_turn("u1", "scope", "sess", "telegram", "plain chatter", "ok")
            .await
            .unwrap();
        // Default thresholds: 3 hits short->mid, 8 -> long.
        for _ in 0..3 {
            let _ = s
                .search_memories_with_event("u1", "plain chatter", None, None, 5, 0.2)
                .await;
        }
        let rows = s.list_memories("u1", None, 10);
        assert_eq!(rows[0].tier, "mid");
        for _ in 0..5 {
            let _ = s
                .search_memories_with_event("u1", "plain chatter", None, None, 5, 0.2)
                .await;
        }
        let rows = s.list_memories("u1", None, 10);
        assert_eq!(rows[0].tier, "long");
    }

    #[tokio::test]
    async fn pinning_promotes_to_long() {
        let s = store();
        let id = s
            .capture_turn("u1", "scope", "sess", "telegram", "pin me please", "ok")
            .await
            .unwrap();
        assert!(s.set_pinned("u1", id, true));
        assert_eq!(s.get_memory("u1", id).unwrap().tier, "long");
        assert!(s.get_memory("u1", id).unwrap().pinned);
    }

    #[tokio::test]
    async fn forget_is_owner_scoped_soft_delete() {
        let s = store();
        let id = s
            .capture_turn("u1", "scope", "sess", "telegram", "forget me later", "ok")
            .await
            .unwrap();
        assert!(!s.forget_memory("u2", id));
        assert!(s.forget_memory("u1", id));
        assert!(s.get_memory("u1", id).is_none());
        assert!(!s.forget_memory("u1", id));
    }

    #[tokio::test]
    async fn context_block_is_bounded_and_marked() {
        let s = store();
        s.capture_turn("u1", "scope", "sess", "telegram", "deploy with systemd", "ok")
            .await
            .unwrap();
        let ctx = s
            .build_memory_context("u1", "how to deploy", Some("sess"), Some("telegram"))
            .await;
        assert!(ctx.starts_with("[MEMORY CONTEXT]\n"));
        assert!(ctx.contains("[END MEMORY CONTEXT]"));
        let events = s.recent_retrieval_events("u1", 1);
        assert!(events[0].context_injected);
    }

    #[tokio::test]
    async fn feedback_round_trips_into_stats() {
        let s = store();
        s.capture_turn("u1", "scope", "sess", "telegram", "stats fodder pytest", "ok")
            .await
            .unwrap();
        let (_, event_id) = s
            .search_memories_with_event("u1", "pytest", None, None, 5, 0.2)
            .await;
        let id = event_id.unwrap();
        assert!(s.record_retrieval_feedback("u1", id, "good", Some("helpful")));
        assert!(!s.record_retrieval_feedback("u1", id, "meh", None));
        assert!(!s.record_retrieval_feedback("u2", id, "good", None));

        let stats = s.retrieval_stats("u1", 7);
        assert_eq!(stats.feedback_good, 1);
        assert!(stats.hit_rate > 0.0);
        assert!(stats.positive_feedback_rate == 1.0);
    }

    #[tokio::test]
    async fn note_starts_in_mid_tier() {
        let s = store();
        let id = s
            .add_note("u1", "scope", None, "telegram", "the staging box is 10.0.0.7")
            .await
            .unwrap();
        let row = s.get_memory("u1", id).unwrap();
        assert_eq!(row.tier, "mid");
        assert_eq!(row.memory_type, "note");
        assert!(row.summary.starts_with("[manual]"));
    }

    #[tokio::test]
    async fn sharing_is_disabled() {
        let s = store();
        assert!(s.share_memory_as_skill("u1", 1, "my-skill").is_none());
    }

    #[test]
    fn fts_query_quotes_tokens() {
        assert_eq!(fts_query("hello world"), Some("\"hello\" \"world\"".into()));
        assert_eq!(fts_query("a-b c:d"), Some("\"a\" \"b\" \"c\" \"d\"".into()));
        assert_eq!(fts_query("!!!"), None);
    }

    #[test]
    fn safe_slug_normalizes() {
        assert_eq!(safe_slug("uname -a"), "uname--a");
        assert_eq!(safe_slug("  "), "shared-skill");
    }
}
