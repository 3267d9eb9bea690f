//! Client for the privileged daemon over a local Unix socket.
//!
//! Best-effort by contract: every failure becomes an `{ok:false, reason}`
//! value so callers never have to distinguish transport errors from
//! daemon-side rejections.

use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::debug;

pub struct SystemServiceClient {
    socket_path: String,
    timeout: Duration,
}

impl SystemServiceClient {
    pub fn new(socket_path: impl Into<String>, timeout_seconds: f64) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: Duration::from_secs_f64(timeout_seconds.max(0.1)),
        }
    }

    pub fn socket_path(&self) -> &str {
        &self.socket_path
    }

    /// Execute one action: single request line, single response line.
    pub async fn execute(
        &self,
        user_id: &str,
        action: &serde_json::Value,
        grant_token: Option<&str>,
    ) -> serde_json::Value {
        let mut request = json!({
            "user_id": user_id,
            "action": action,
        });
        if let Some(token) = grant_token {
            request["grant"] = json!(token);
        }

        let stream = match tokio::time::timeout(self.timeout, UnixStream::connect(&self.socket_path))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return json!({"ok": false, "reason": format!("connect_failed:{e}")}),
            Err(_) => return json!({"ok": false, "reason": "connect_failed:timeout"}),
        };

        let (reader, mut writer) = stream.into_split();
        let wire = match serde_json::to_string(&request) {
            Ok(w) => w + "\n",
            Err(e) => return json!({"ok": false, "reason": format!("request_encode_failed:{e}")}),
        };
        debug!(socket = %self.socket_path, bytes = wire.len(), "privileged RPC request");

        if let Err(e) =
            tokio::time::timeout(self.timeout, writer.write_all(wire.as_bytes())).await
                .unwrap_or_else(|_| Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "write timeout")))
        {
            return json!({"ok": false, "reason": format!("request_failed:{e}")});
        }

        let mut line = String::new();
        let mut reader = BufReader::new(reader);
        match tokio::time::timeout(self.timeout, reader.read_line(&mut line)).await {
            Ok(Ok(0)) => json!({"ok": false, "reason": "empty_response"}),
            Ok(Ok(_)) => match serde_json::from_str::<serde_json::Value>(&line) {
                Ok(value) if value.is_object() => value,
                Ok(_) => json!({"ok": false, "reason": "response_not_object"}),
                Err(e) => json!({"ok": false, "reason": format!("response_decode_failed:{e}")}),
            },
            Ok(Err(e)) => json!({"ok": false, "reason": format!("request_failed:{e}")}),
            Err(_) => json!({"ok": false, "reason": "request_failed:timeout"}),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_failure_is_a_result_not_an_error() {
        let client = SystemServiceClient::new("/nonexistent/kapy-sysd.sock", 0.5);
        let result = client.execute("u1", &json!({"op": "cron_list"}), None).await;
        assert_eq!(result["ok"], false);
        assert!(result["reason"]
            .as_str()
            .unwrap()
            .starts_with("connect_failed:"));
    }
}
