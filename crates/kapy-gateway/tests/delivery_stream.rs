//! Streaming delivery properties: payload reconstruction, cancellation,
//! and message splitting.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{FakeChannel, Sent};
use futures_util::StreamExt;
use kapy_channels::Channel;
use kapy_core::formatter::OutputFormatter;
use kapy_gateway::delivery::StreamingDelivery;
use tokio_util::sync::CancellationToken;

fn chunk_stream(chunks: Vec<&str>) -> kapy_agent::ChunkStream {
    Box::pin(futures_util::stream::iter(
        chunks.into_iter().map(|c| c.to_string()).collect::<Vec<_>>(),
    ))
}

/// Reconstruct what a reader of the chat ultimately sees: the last edit
/// per message id (or the original send), in order, plus standalone sends.
fn final_payload(channel: &FakeChannel) -> String {
    let mut messages: Vec<(Option<String>, String)> = Vec::new();
    for sent in channel.all() {
        match sent {
            Sent::Text(text) => {
                let id = format!("m{}", messages.len() + 1);
                messages.push((Some(id), text));
            }
            Sent::Edit { message_id, text } => {
                if let Some(slot) = messages
                    .iter_mut()
                    .find(|(id, _)| id.as_deref() == Some(message_id.as_str()))
                {
                    slot.1 = text;
                }
            }
            Sent::File { .. } => {}
        }
    }
    messages.into_iter().map(|(_, text)| text).collect::<Vec<_>>().join("")
}

#[tokio::test]
async fn streamed_payload_equals_cleaned_concatenation() {
    let channel = Arc::new(FakeChannel::new(true));
    let formatter = OutputFormatter::new(4096);
    let delivery = StreamingDelivery::new(&formatter);

    let chunks = vec!["line one\n", "line two\n", "\x1b[32mline three\x1b[0m\n"];
    let expected = formatter.clean(&chunks.concat());

    let delivered = delivery
        .deliver(
            &(channel.clone() as Arc<dyn Channel>),
            "chat1",
            chunk_stream(chunks),
            CancellationToken::new(),
        )
        .await;

    assert_eq!(delivered, expected);
    assert_eq!(final_payload(&channel), expected);
}

#[tokio::test]
async fn batch_mode_posts_once() {
    let channel = Arc::new(FakeChannel::new(false));
    let formatter = OutputFormatter::new(4096);
    let delivery = StreamingDelivery::new(&formatter);

    let delivered = delivery
        .deliver(
            &(channel.clone() as Arc<dyn Channel>),
            "chat1",
            chunk_stream(vec!["part a ", "part b"]),
            CancellationToken::new(),
        )
        .await;

    assert_eq!(delivered, "part a part b");
    assert_eq!(channel.texts(), vec!["part a part b".to_string()]);
}

#[tokio::test]
async fn long_output_is_split_with_markers() {
    let channel = Arc::new(FakeChannel::new(false));
    let formatter = OutputFormatter::new(100);
    let delivery = StreamingDelivery::new(&formatter);

    let long_line = "word ".repeat(60);
    let _ = delivery
        .deliver(
            &(channel.clone() as Arc<dyn Channel>),
            "chat1",
            chunk_stream(vec![&long_line]),
            CancellationToken::new(),
        )
        .await;

    let texts = channel.texts();
    assert!(texts.len() > 1);
    let total = texts.len();
    assert!(texts[0].contains(&format!("[1/{total}]")));
}

#[tokio::test]
async fn cancellation_stops_pulling_chunks() {
    let channel = Arc::new(FakeChannel::new(false));
    let formatter = OutputFormatter::new(4096);
    let delivery = StreamingDelivery::new(&formatter);

    let cancel = CancellationToken::new();
    cancel.cancel();

    // An endless stream: if cancellation were ignored, this would hang.
    let endless = Box::pin(
        futures_util::stream::repeat("tick ".to_string()).then(|c| async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            c
        }),
    );

    let delivered = tokio::time::timeout(
        Duration::from_secs(2),
        delivery.deliver(&(channel.clone() as Arc<dyn Channel>), "chat1", endless, cancel),
    )
    .await
    .expect("delivery should stop promptly on cancel");

    // Nothing was pulled after the cancel fired at the start.
    assert_eq!(delivered, "✅ 完成");
}

#[tokio::test]
async fn idle_timeout_appends_truncation_notice() {
    let channel = Arc::new(FakeChannel::new(false));
    let formatter = OutputFormatter::new(4096);
    let delivery =
        StreamingDelivery::new(&formatter).with_idle_timeout(Duration::from_millis(50));

    // One chunk, then silence forever.
    let stalling = Box::pin(async_stream::stream! {
        yield "partial output".to_string();
        loop {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
    });

    let delivered = tokio::time::timeout(
        Duration::from_secs(2),
        delivery.deliver(
            &(channel.clone() as Arc<dyn Channel>),
            "chat1",
            stalling,
            CancellationToken::new(),
        ),
    )
    .await
    .expect("idle timeout should end the stream");

    assert!(delivered.starts_with("partial output"));
    assert!(delivered.contains("结果可能不完整"));
}
