//! Audit logging with payload redaction.
//!
//! Every privileged action's payload and result are logged as one JSON
//! line. Fields in the redaction set are replaced with a digest stub
//! before anything reaches the log.

use sha2::{Digest, Sha256};
use tracing::info;

const REDACTED_FIELDS: &[&str] = &["text", "output", "stderr", "stdout", "content"];

fn redacted_value(value: &serde_json::Value) -> serde_json::Value {
    if value.is_null() {
        return serde_json::json!({"redacted": true, "bytes": 0});
    }
    let raw = match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    serde_json::json!({
        "redacted": true,
        "bytes": raw.len(),
        "sha256": hex::encode(hasher.finalize()),
    })
}

/// Recursively replace sensitive fields with `{redacted, bytes, sha256}`.
pub fn sanitize_for_audit(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut cleaned = serde_json::Map::new();
            for (k, v) in map {
                if REDACTED_FIELDS.contains(&k.to_lowercase().as_str()) {
                    cleaned.insert(k.clone(), redacted_value(v));
                } else {
                    cleaned.insert(k.clone(), sanitize_for_audit(v));
                }
            }
            serde_json::Value::Object(cleaned)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(sanitize_for_audit).collect())
        }
        other => other.clone(),
    }
}

/// Emit one audit event line. `payload` and `result` are sanitized here
/// so callers cannot accidentally log raw content.
pub fn audit_event(
    channel: &str,
    chat_id: &str,
    user_id: &str,
    action: &str,
    payload: &serde_json::Value,
    result: &serde_json::Value,
) {
    let event = serde_json::json!({
        "ts": chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
        "channel": channel,
        "chat_id": chat_id,
        "user_id": user_id,
        "action": action,
        "payload": sanitize_for_audit(payload),
        "result": sanitize_for_audit(result),
    });
    info!(target: "kapy::audit", event = %event, "audit");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sensitive_fields_are_replaced_with_digests() {
        let payload = json!({
            "path": "/etc/app.conf",
            "content": "secret-data",
            "nested": {"stdout": "lines", "lines": 3},
        });
        let cleaned = sanitize_for_audit(&payload);
        assert_eq!(cleaned["path"], "/etc/app.conf");
        assert_eq!(cleaned["content"]["redacted"], true);
        assert_eq!(cleaned["content"]["bytes"], 11);
        assert!(cleaned["content"]["sha256"].as_str().unwrap().len() == 64);
        assert_eq!(cleaned["nested"]["stdout"]["redacted"], true);
        assert_eq!(cleaned["nested"]["lines"], 3);
    }

    #[test]
    fn redaction_is_case_insensitive() {
        let cleaned = sanitize_for_audit(&json!({"STDOUT": "x"}));
        assert_eq!(cleaned["STDOUT"]["redacted"], true);
    }

    #[test]
    fn arrays_are_sanitized_element_wise() {
        let cleaned = sanitize_for_audit(&json!([{"output": "a"}, {"safe": "b"}]));
        assert_eq!(cleaned[0]["output"]["redacted"], true);
        assert_eq!(cleaned[1]["safe"], "b");
    }
}
