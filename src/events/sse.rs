//! SSE response shaping
//!
//! Wire format per frame: `event: <type>\ndata: <json>\n\n`. The stream
//! emits its own `heartbeat` frames whenever the subscriber queue has
//! been idle for the heartbeat interval, and response headers disable
//! intermediary buffering so frames reach the dashboard immediately.

use axum::http::header;
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use futures::stream::{self, Stream};
use serde_json::json;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::mpsc;

use super::SseMessage;

/// Turn a subscriber queue into the frame stream. The stream ends when
/// the bus drops the sending side (force disconnect or reaper).
pub fn frame_stream(
    rx: mpsc::Receiver<SseMessage>,
    heartbeat: Duration,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(rx, move |mut rx| async move {
        match tokio::time::timeout(heartbeat, rx.recv()).await {
            Ok(Some(message)) => {
                let event = Event::default()
                    .event(message.event)
                    .data(message.data.to_string());
                Some((Ok(event), rx))
            }
            // Sender gone: terminate the stream.
            Ok(None) => None,
            // Idle: synthesize a heartbeat frame.
            Err(_) => {
                let event = Event::default()
                    .event("heartbeat")
                    .data(json!({"ts": chrono::Utc::now().timestamp_millis()}).to_string());
                Some((Ok(event), rx))
            }
        }
    })
}

/// Complete SSE response with buffering disabled.
pub fn sse_response(rx: mpsc::Receiver<SseMessage>, heartbeat: Duration) -> impl IntoResponse {
    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (header::HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Sse::new(frame_stream(rx, heartbeat)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::Value;

    #[tokio::test]
    async fn test_messages_become_events() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(SseMessage {
            event: "order_update",
            data: json!({"order_id": 7}),
        })
        .await
        .unwrap();
        drop(tx);

        let frames: Vec<_> = frame_stream(rx, Duration::from_secs(10)).collect().await;
        assert_eq!(frames.len(), 1);
    }

    #[tokio::test]
    async fn test_idle_stream_heartbeats() {
        let (tx, rx) = mpsc::channel::<SseMessage>(4);
        let mut stream = Box::pin(frame_stream(rx, Duration::from_millis(20)));

        // No traffic: the first frame is a heartbeat.
        let frame = stream.next().await.unwrap().unwrap();
        let rendered = format!("{:?}", frame);
        assert!(rendered.contains("heartbeat"));
        drop(tx);
    }

    #[tokio::test]
    async fn test_stream_ends_when_sender_drops() {
        let (tx, rx) = mpsc::channel::<SseMessage>(4);
        drop(tx);
        let frames: Vec<_> = frame_stream(rx, Duration::from_secs(10)).collect().await;
        assert!(frames.is_empty());
    }

    #[test]
    fn test_heartbeat_body_is_nonempty_json() {
        let body = json!({"ts": 1700000000000_i64});
        let parsed: Value = serde_json::from_str(&body.to_string()).unwrap();
        assert!(parsed.get("ts").is_some());
    }
}
