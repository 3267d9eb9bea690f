//! Append-only per-session billing log.
//!
//! One JSONL file per session under the billing directory. Cumulative
//! totals are cached in memory (full precision) and rebuilt on startup
//! by replaying existing files; the serialized lines carry the totals
//! rounded to 8 decimals.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingEntry {
    pub timestamp: String,
    pub session_id: String,
    pub user_id: String,
    pub channel: String,
    pub agent: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cost_usd: f64,
    pub cumulative_cost_usd: f64,
    pub duration_ms: u64,
}

/// Per-turn input to `record`.
#[derive(Debug, Clone, Default)]
pub struct BillingRecord {
    pub session_id: String,
    pub user_id: String,
    pub channel: String,
    pub agent: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cost_usd: f64,
    pub duration_ms: u64,
}

pub struct BillingLog {
    billing_dir: PathBuf,
    /// session_id -> cumulative cost, full precision.
    cumulative: Mutex<HashMap<String, f64>>,
}

fn round8(value: f64) -> f64 {
    (value * 1e8).round() / 1e8
}

impl BillingLog {
    pub fn new(billing_dir: impl Into<PathBuf>) -> Self {
        let billing_dir = billing_dir.into();
        let _ = std::fs::create_dir_all(&billing_dir);
        let cumulative = Self::load_cumulative(&billing_dir);
        info!(dir = %billing_dir.display(), sessions = cumulative.len(), "billing log initialized");
        Self {
            billing_dir,
            cumulative: Mutex::new(cumulative),
        }
    }

    /// Rebuild cumulative totals from the last line of each session file.
    fn load_cumulative(dir: &PathBuf) -> HashMap<String, f64> {
        let mut totals = HashMap::new();
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(_) => return totals,
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let session_id = match path.file_stem().and_then(|s| s.to_str()) {
                Some(stem) => stem.to_string(),
                None => continue,
            };
            let raw = match std::fs::read_to_string(&path) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to read billing file");
                    continue;
                }
            };
            let mut total = 0.0;
            for line in raw.lines().filter(|l| !l.trim().is_empty()) {
                match serde_json::from_str::<BillingEntry>(line) {
                    Ok(entry) => total = entry.cumulative_cost_usd,
                    Err(e) => warn!(session_id, error = %e, "skipping malformed billing line"),
                }
            }
            totals.insert(session_id, total);
        }
        totals
    }

    /// Append a billing line and return the entry (with the cumulative
    /// total as written).
    pub fn record(&self, record: BillingRecord) -> BillingEntry {
        let cumulative = {
            let mut totals = self.cumulative.lock().unwrap();
            let prev = totals.get(&record.session_id).copied().unwrap_or(0.0);
            let next = prev + record.cost_usd;
            totals.insert(record.session_id.clone(), next);
            next
        };

        let entry = BillingEntry {
            timestamp: chrono::Utc::now().to_rfc3339(),
            session_id: record.session_id.clone(),
            user_id: record.user_id,
            channel: record.channel,
            agent: record.agent,
            model: record.model,
            input_tokens: record.input_tokens,
            output_tokens: record.output_tokens,
            cache_read_tokens: record.cache_read_tokens,
            cache_creation_tokens: record.cache_creation_tokens,
            // Rounding applies to the logged line only; the in-memory
            // cumulative keeps full precision.
            cost_usd: round8(record.cost_usd),
            cumulative_cost_usd: round8(cumulative),
            duration_ms: record.duration_ms,
        };

        let path = self.billing_dir.join(format!("{}.jsonl", record.session_id));
        let write = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| {
                let line = serde_json::to_string(&entry).unwrap_or_default();
                writeln!(f, "{line}")
            });
        match write {
            Ok(()) => info!(
                session_id = %entry.session_id,
                agent = %entry.agent,
                model = %entry.model,
                cost_usd = entry.cost_usd,
                cumulative = entry.cumulative_cost_usd,
                "billing recorded"
            ),
            Err(e) => error!(session_id = %entry.session_id, error = %e, "failed to write billing line"),
        }
        entry
    }

    /// Cumulative cost for a session (0 when unknown).
    pub fn session_total(&self, session_id: &str) -> f64 {
        self.cumulative
            .lock()
            .unwrap()
            .get(session_id)
            .copied()
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(session: &str, cost: f64) -> BillingRecord {
        BillingRecord {
            session_id: session.to_string(),
            user_id: "123".to_string(),
            channel: "telegram".to_string(),
            agent: "claude".to_string(),
            model: "claude-opus-4-6".to_string(),
            input_tokens: 10,
            output_tokens: 5,
            cost_usd: cost,
            duration_ms: 500,
            ..Default::default()
        }
    }

    #[test]
    fn cumulative_equals_running_sum() {
        let dir = tempfile::tempdir().unwrap();
        let log = BillingLog::new(dir.path());
        let a = log.record(record("aabbccdd", 0.002));
        assert_eq!(a.cost_usd, 0.002);
        assert_eq!(a.cumulative_cost_usd, 0.002);
        let b = log.record(record("aabbccdd", 0.003));
        assert!((b.cumulative_cost_usd - 0.005).abs() < 1e-12);
    }

    #[test]
    fn sessions_do_not_share_totals() {
        let dir = tempfile::tempdir().unwrap();
        let log = BillingLog::new(dir.path());
        log.record(record("aaaa1111", 1.0));
        log.record(record("bbbb2222", 2.0));
        assert_eq!(log.session_total("aaaa1111"), 1.0);
        assert_eq!(log.session_total("bbbb2222"), 2.0);
    }

    #[test]
    fn totals_are_rebuilt_on_startup() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = BillingLog::new(dir.path());
            log.record(record("aabbccdd", 0.002));
            log.record(record("aabbccdd", 0.001));
        }
        let log = BillingLog::new(dir.path());
        assert!((log.session_total("aabbccdd") - 0.003).abs() < 1e-9);
        let entry = log.record(record("aabbccdd", 0.001));
        assert!((entry.cumulative_cost_usd - 0.004).abs() < 1e-9);
    }

    #[test]
    fn lines_are_valid_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let log = BillingLog::new(dir.path());
        log.record(record("aabbccdd", 0.002));
        log.record(record("aabbccdd", 0.001));
        let raw = std::fs::read_to_string(dir.path().join("aabbccdd.jsonl")).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let entry: BillingEntry = serde_json::from_str(line).unwrap();
            assert_eq!(entry.session_id, "aabbccdd");
        }
    }

    #[test]
    fn logged_values_are_rounded_to_8_decimals() {
        let dir = tempfile::tempdir().unwrap();
        let log = BillingLog::new(dir.path());
        let entry = log.record(record("aabbccdd", 0.123456789123));
        assert_eq!(entry.cost_usd, 0.12345679);
    }
}
