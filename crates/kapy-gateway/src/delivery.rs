//! Streaming delivery: relay agent output chunks to a channel.
//!
//! Streaming channels get a first message that is edited with the
//! growing buffer on a debounce interval; batch channels (email) get one
//! post at the end. Both modes honor the cancel token and an idle
//! timeout, and both finish by splitting the cleaned buffer into
//! channel-sized chunks.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use kapy_agent::ChunkStream;
use kapy_channels::Channel;
use kapy_core::formatter::OutputFormatter;
use kapy_core::{STREAM_IDLE_TIMEOUT_SECS, STREAM_UPDATE_INTERVAL_SECS};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const PLACEHOLDER: &str = "⏳ 处理中...";
const DONE_FALLBACK: &str = "✅ 完成";
const IDLE_TIMEOUT_NOTICE: &str = "\n\n⚠️ 输出空闲超时，结果可能不完整";

pub struct StreamingDelivery<'a> {
    formatter: &'a OutputFormatter,
    idle_timeout: Duration,
}

impl<'a> StreamingDelivery<'a> {
    pub fn new(formatter: &'a OutputFormatter) -> Self {
        Self {
            formatter,
            idle_timeout: Duration::from_secs(STREAM_IDLE_TIMEOUT_SECS),
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Relay `chunks` to `chat_id` and return the delivered text.
    pub async fn deliver(
        &self,
        channel: &Arc<dyn Channel>,
        chat_id: &str,
        chunks: ChunkStream,
        cancel: CancellationToken,
    ) -> String {
        if channel.supports_streaming() {
            self.stream_mode(channel, chat_id, chunks, cancel).await
        } else {
            self.batch_mode(channel, chat_id, chunks, cancel).await
        }
    }

    async fn stream_mode(
        &self,
        channel: &Arc<dyn Channel>,
        chat_id: &str,
        mut chunks: ChunkStream,
        cancel: CancellationToken,
    ) -> String {
        let update_interval = Duration::from_secs_f64(STREAM_UPDATE_INTERVAL_SECS);
        let mut message_id: Option<String> = None;
        let mut last_update: Option<Instant> = None;
        let mut buffer = String::new();
        let mut stalled = false;

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("stream cancelled");
                    break;
                }
                next = tokio::time::timeout(self.idle_timeout, chunks.next()) => next,
            };
            match next {
                Ok(Some(chunk)) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    buffer.push_str(&chunk);
                    let due = last_update
                        .map(|t| t.elapsed() >= update_interval)
                        .unwrap_or(true);
                    if due {
                        let snapshot = if buffer.is_empty() {
                            PLACEHOLDER.to_string()
                        } else {
                            buffer.clone()
                        };
                        match &message_id {
                            None => {
                                if let Ok(id) = channel.send_text(chat_id, &snapshot).await {
                                    message_id = id;
                                }
                            }
                            Some(id) => {
                                let _ = channel.edit_message(chat_id, id, &snapshot).await;
                            }
                        }
                        last_update = Some(Instant::now());
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(idle_secs = self.idle_timeout.as_secs(), "stream idle timeout");
                    stalled = true;
                    break;
                }
            }
        }

        let cleaned = self.finalize(&buffer, stalled);
        let parts = self.formatter.split_message(&cleaned);
        match &message_id {
            None => {
                let _ = channel.send_text(chat_id, &parts[0]).await;
            }
            Some(id) => {
                let _ = channel.edit_message(chat_id, id, &parts[0]).await;
            }
        }
        for part in &parts[1..] {
            let _ = channel.send_text(chat_id, part).await;
        }
        cleaned
    }

    async fn batch_mode(
        &self,
        channel: &Arc<dyn Channel>,
        chat_id: &str,
        mut chunks: ChunkStream,
        cancel: CancellationToken,
    ) -> String {
        let mut buffer = String::new();
        let mut stalled = false;
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("stream cancelled");
                    break;
                }
                next = tokio::time::timeout(self.idle_timeout, chunks.next()) => next,
            };
            match next {
                Ok(Some(chunk)) => buffer.push_str(&chunk),
                Ok(None) => break,
                Err(_) => {
                    warn!(idle_secs = self.idle_timeout.as_secs(), "stream idle timeout");
                    stalled = true;
                    break;
                }
            }
        }

        let cleaned = self.finalize(&buffer, stalled);
        for part in self.formatter.split_message(&cleaned) {
            let _ = channel.send_text(chat_id, &part).await;
        }
        cleaned
    }

    fn finalize(&self, buffer: &str, stalled: bool) -> String {
        let mut cleaned = self.formatter.clean(buffer);
        if stalled {
            cleaned.push_str(IDLE_TIMEOUT_NOTICE);
        }
        if cleaned.is_empty() {
            cleaned = DONE_FALLBACK.to_string();
        }
        cleaned
    }
}
