use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub memory_id: i64,
    pub owner_user_id: String,
    /// `short`, `mid`, or `long`.
    pub tier: String,
    /// `turn`, `preference`, `procedure`, `env`, `note`, or `skill`.
    pub memory_type: String,
    pub domain: String,
    pub topic: String,
    pub item: String,
    pub summary: String,
    pub content: String,
    pub importance: f64,
    pub confidence: f64,
    pub pinned: bool,
    pub skill_name: Option<String>,
    pub access_count: i64,
    /// Retrieval score for this result set (0 outside retrieval).
    pub score: f64,
    pub created_at: String,
    pub updated_at: String,
}

/// One logged retrieval, optionally annotated later with user feedback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalEvent {
    pub retrieval_id: i64,
    pub query: String,
    pub result_count: i64,
    pub top_score: Option<f64>,
    pub latency_ms: i64,
    pub context_injected: bool,
    pub feedback: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrievalStats {
    pub total_queries: i64,
    pub hit_queries: i64,
    pub context_injected_queries: i64,
    pub avg_result_count: f64,
    pub avg_latency_ms: f64,
    pub vector_queries: i64,
    pub feedback_good: i64,
    pub feedback_bad: i64,
    pub hit_rate: f64,
    pub context_inject_rate: f64,
    pub vector_usage_rate: f64,
    pub feedback_coverage: f64,
    pub positive_feedback_rate: f64,
    pub days: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UserStats {
    pub user_items: i64,
    pub vector_supported: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthStats {
    pub enabled: bool,
    pub total_items: i64,
    pub vector_supported: bool,
    pub last_probe_at: Option<String>,
}
