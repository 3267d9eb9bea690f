//! Short-lived signed grants for privileged system actions.
//!
//! Token format: compact JWS-like three-segment string with an HS256
//! signature. Tokens are single-use; consumed nonces are remembered until
//! their expiry so a replayed token is rejected even within its TTL.

use std::collections::HashMap;
use std::sync::Mutex;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{PrivilegedError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Canonicalize an action payload for deterministic hashing/signing:
/// object keys sorted, no whitespace. Strings pass through unchanged.
pub fn canonical_action(payload: &serde_json::Value) -> String {
    match payload {
        serde_json::Value::String(s) => s.clone(),
        other => canonical_json(other),
    }
}

fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let parts: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", parts.join(","))
        }
        serde_json::Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", parts.join(","))
        }
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// SHA-256 hex of the canonical action serialization.
pub fn action_hash(payload: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_action(payload).as_bytes());
    hex::encode(hasher.finalize())
}

/// Grant claims. Field order is the canonical (sorted) key order so the
/// serialized segment matches the signing convention byte-for-byte.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrantClaims {
    pub act: String,
    pub exp: i64,
    pub iat: i64,
    pub nonce: String,
    pub uid: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct GrantHeader {
    alg: String,
    typ: String,
    v: u32,
}

/// Why verification failed (stable reason codes surfaced to the chat).
pub type VerifyOutcome = (bool, &'static str, Option<GrantClaims>);

pub struct SystemGrantManager {
    secret: Vec<u8>,
    ttl_seconds: i64,
    consumed_nonces: Mutex<HashMap<String, i64>>,
}

impl SystemGrantManager {
    pub fn new(secret: &str, ttl_seconds: u64) -> Result<Self> {
        if secret.is_empty() {
            return Err(PrivilegedError::MissingSecret);
        }
        Ok(Self {
            secret: secret.as_bytes().to_vec(),
            ttl_seconds: (ttl_seconds as i64).max(5),
            consumed_nonces: Mutex::new(HashMap::new()),
        })
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    fn sign(&self, signing_input: &[u8]) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length");
        mac.update(signing_input);
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }

    /// Issue a one-shot grant for `(user, action)`.
    pub fn issue(&self, user_id: &str, action: &serde_json::Value) -> String {
        self.issue_at(user_id, action, Self::now())
    }

    pub fn issue_at(&self, user_id: &str, action: &serde_json::Value, now: i64) -> String {
        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let claims = GrantClaims {
            act: action_hash(action),
            exp: now + self.ttl_seconds,
            iat: now,
            nonce: hex::encode(nonce_bytes),
            uid: user_id.to_string(),
        };
        let header = GrantHeader {
            alg: "HS256".to_string(),
            typ: "SYSGRANT".to_string(),
            v: 1,
        };
        let enc_header =
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).unwrap_or_default());
        let enc_claims =
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).unwrap_or_default());
        let signing_input = format!("{enc_header}.{enc_claims}");
        let signature = self.sign(signing_input.as_bytes());
        format!("{enc_header}.{enc_claims}.{signature}")
    }

    /// Verify a token against the expected user and action. With
    /// `consume`, the nonce is burned so a second verify is rejected.
    pub fn verify(
        &self,
        token: &str,
        user_id: &str,
        action: &serde_json::Value,
        consume: bool,
    ) -> VerifyOutcome {
        self.verify_at(token, user_id, action, consume, Self::now())
    }

    pub fn verify_at(
        &self,
        token: &str,
        user_id: &str,
        action: &serde_json::Value,
        consume: bool,
        now: i64,
    ) -> VerifyOutcome {
        {
            let mut nonces = self.consumed_nonces.lock().unwrap();
            nonces.retain(|_, exp| *exp > now);
        }

        let parts: Vec<&str> = token.split('.').collect();
        if parts.len() != 3 {
            return (false, "token_malformed", None);
        }
        let signing_input = format!("{}.{}", parts[0], parts[1]);
        let expected = self.sign(signing_input.as_bytes());
        if !constant_time_eq(parts[2].as_bytes(), expected.as_bytes()) {
            return (false, "token_signature_invalid", None);
        }

        let header: GrantHeader = match URL_SAFE_NO_PAD
            .decode(parts[0])
            .ok()
            .and_then(|raw| serde_json::from_slice(&raw).ok())
        {
            Some(h) => h,
            None => return (false, "token_decode_failed", None),
        };
        let claims: GrantClaims = match URL_SAFE_NO_PAD
            .decode(parts[1])
            .ok()
            .and_then(|raw| serde_json::from_slice(&raw).ok())
        {
            Some(c) => c,
            None => return (false, "token_decode_failed", None),
        };

        if header.typ != "SYSGRANT" {
            return (false, "token_type_invalid", None);
        }
        if header.alg != "HS256" {
            return (false, "token_alg_invalid", None);
        }
        if claims.uid.is_empty()
            || claims.act.is_empty()
            || claims.nonce.is_empty()
            || claims.iat <= 0
            || claims.exp <= 0
        {
            return (false, "token_claims_invalid", None);
        }
        if claims.exp <= now {
            return (false, "token_expired", None);
        }
        if claims.uid != user_id {
            return (false, "token_user_mismatch", None);
        }
        if claims.act != action_hash(action) {
            return (false, "token_action_mismatch", None);
        }

        if consume {
            let mut nonces = self.consumed_nonces.lock().unwrap();
            if let Some(exp) = nonces.get(&claims.nonce) {
                if *exp > now {
                    return (false, "token_replayed", None);
                }
            }
            nonces.insert(claims.nonce.clone(), claims.exp);
        }

        (true, "ok", Some(claims))
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager() -> SystemGrantManager {
        SystemGrantManager::new("test-secret", 60).unwrap()
    }

    #[test]
    fn empty_secret_is_rejected() {
        assert!(SystemGrantManager::new("", 60).is_err());
    }

    #[test]
    fn canonical_json_sorts_keys() {
        let payload = json!({"b": 2, "a": {"d": 4, "c": 3}});
        assert_eq!(canonical_action(&payload), r#"{"a":{"c":3,"d":4},"b":2}"#);
    }

    #[test]
    fn canonical_json_is_stable_under_reparse() {
        let payload = json!({"op": "docker_exec", "args": ["ps"]});
        let first = canonical_action(&payload);
        let reparsed: serde_json::Value = serde_json::from_str(&first).unwrap();
        assert_eq!(first, canonical_action(&reparsed));
    }

    #[test]
    fn issue_then_verify_consumes_once() {
        let m = manager();
        let action = json!({"op": "docker_exec", "args": ["ps"]});
        let token = m.issue_at("u1", &action, 1000);

        let (ok, reason, claims) = m.verify_at(&token, "u1", &action, true, 1001);
        assert!(ok, "first verify failed: {reason}");
        assert_eq!(claims.unwrap().uid, "u1");

        let (ok, reason, _) = m.verify_at(&token, "u1", &action, true, 1001);
        assert!(!ok);
        assert_eq!(reason, "token_replayed");
    }

    #[test]
    fn non_consuming_verify_does_not_burn_nonce() {
        let m = manager();
        let action = json!({"op": "cron_list"});
        let token = m.issue_at("u1", &action, 1000);
        let (ok, _, _) = m.verify_at(&token, "u1", &action, false, 1001);
        assert!(ok);
        let (ok, _, _) = m.verify_at(&token, "u1", &action, true, 1002);
        assert!(ok);
    }

    #[test]
    fn expired_token_is_rejected() {
        let m = manager();
        let action = json!({"op": "cron_list"});
        let token = m.issue_at("u1", &action, 1000);
        let (ok, reason, _) = m.verify_at(&token, "u1", &action, true, 1061);
        assert!(!ok);
        assert_eq!(reason, "token_expired");
    }

    #[test]
    fn user_and_action_mismatches_are_distinct() {
        let m = manager();
        let action = json!({"op": "cron_list"});
        let token = m.issue_at("u1", &action, 1000);

        let (_, reason, _) = m.verify_at(&token, "u2", &action, true, 1001);
        assert_eq!(reason, "token_user_mismatch");
        let (_, reason, _) =
            m.verify_at(&token, "u1", &json!({"op": "cron_delete"}), true, 1001);
        assert_eq!(reason, "token_action_mismatch");
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let m = manager();
        let action = json!({"op": "cron_list"});
        let token = m.issue_at("u1", &action, 1000);
        let mut tampered = token.clone();
        tampered.pop();
        tampered.push('A');
        let (ok, reason, _) = m.verify_at(&tampered, "u1", &action, true, 1001);
        assert!(!ok);
        assert!(reason == "token_signature_invalid" || reason == "token_malformed");
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        let m = manager();
        let action = json!({"op": "cron_list"});
        let (_, reason, _) = m.verify_at("abc", "u1", &action, true, 1001);
        assert_eq!(reason, "token_malformed");
        let (_, reason, _) = m.verify_at("a.b.c", "u1", &action, true, 1001);
        assert_eq!(reason, "token_signature_invalid");
    }

    #[test]
    fn ttl_floor_is_five_seconds() {
        let m = SystemGrantManager::new("s", 1).unwrap();
        let action = json!({"op": "cron_list"});
        let token = m.issue_at("u1", &action, 1000);
        // Still valid at +4s because the floor raises the TTL to 5.
        let (ok, _, _) = m.verify_at(&token, "u1", &action, false, 1004);
        assert!(ok);
    }
}
