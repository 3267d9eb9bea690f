//! Embedding client for an OpenAI-compatible embeddings endpoint.

use std::time::Duration;

use kapy_core::config::EmbeddingConfig;
use serde_json::json;
use tracing::warn;

pub struct EmbeddingClient {
    cfg: EmbeddingConfig,
    http: reqwest::Client,
}

impl EmbeddingClient {
    pub fn new(cfg: EmbeddingConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs_f64(cfg.timeout_seconds.max(0.1)))
            .build()
            .unwrap_or_default();
        Self { cfg, http }
    }

    pub fn dimensions(&self) -> usize {
        self.cfg.dimensions
    }

    fn api_key(&self) -> Option<String> {
        std::env::var(&self.cfg.api_key_env)
            .ok()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
    }

    /// True when endpoint, model, and key are all present.
    pub fn is_configured(&self) -> bool {
        !self.cfg.endpoint.is_empty() && !self.cfg.model.is_empty() && self.api_key().is_some()
    }

    /// Embed one text. Any failure degrades to `None`; retrieval falls
    /// back to full-text search in that case.
    pub async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        let api_key = self.api_key()?;
        let mut payload = json!({"model": self.cfg.model, "input": text});
        if self.cfg.dimensions > 0 {
            payload["dimensions"] = json!(self.cfg.dimensions);
        }

        let response = match self
            .http
            .post(&self.cfg.endpoint)
            .bearer_auth(api_key)
            .json(&payload)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                warn!(error = %e, "embedding request error");
                return None;
            }
        };
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(%status, body = %body.chars().take(300).collect::<String>(), "embedding request failed");
            return None;
        }
        let doc: serde_json::Value = response.json().await.ok()?;
        let values = doc.pointer("/data/0/embedding")?.as_array()?;
        let vector: Vec<f32> = values
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect();
        if vector.is_empty() {
            None
        } else {
            Some(vector)
        }
    }
}

/// Cosine similarity, 0 when either vector is degenerate.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![0.5f32, 0.5, 0.7];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        let a = vec![1.0f32, 0.0];
        let b = vec![0.0f32, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-9);
    }

    #[test]
    fn mismatched_or_empty_vectors_score_zero() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn unconfigured_client_reports_so() {
        let cfg = EmbeddingConfig {
            api_key_env: "KAPY_TEST_NO_SUCH_KEY".to_string(),
            ..Default::default()
        };
        let client = EmbeddingClient::new(cfg);
        assert!(!client.is_configured());
    }
}
