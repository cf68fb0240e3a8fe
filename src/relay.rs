//! Re-frames an upstream event stream into the downstream `data: {"content": ...}` protocol
//! while accumulating the full answer for the transcript.

use crate::error::ChatError;
use crate::providers::ProviderAdapter;
use crate::transcript::{PendingChat, TranscriptPersister};
use axum::response::sse::Event;
use eventsource_stream::{Event as UpstreamEvent, Eventsource};
use futures_util::{Stream, StreamExt};
use serde_json::{Value, json};
use std::convert::Infallible;
use std::fmt::Display;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

pub const DONE_MARKER: &str = "[DONE]";
const RELAY_CHANNEL_CAPACITY: usize = 64;

/// One decoded upstream event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamFrame {
    Delta(String),
    Done,
    Error(String),
}

/// The answer accumulated so far for one streamed chat.
#[derive(Debug)]
pub struct StreamAccumulator {
    full_content: String,
    chat_id: Uuid,
}

impl StreamAccumulator {
    pub fn new(chat_id: Uuid) -> Self {
        Self {
            full_content: String::new(),
            chat_id,
        }
    }

    pub fn into_full_content(self) -> String {
        self.full_content
    }

    /// Classifies one parsed upstream event. Deltas are appended to the answer.
    pub fn decode_event(
        &mut self,
        event: &UpstreamEvent,
        adapter: &ProviderAdapter,
    ) -> Option<UpstreamFrame> {
        let payload = event.data.trim();
        if payload.is_empty() {
            return None;
        }
        if payload == DONE_MARKER {
            return Some(UpstreamFrame::Done);
        }
        let value: Value = match serde_json::from_str(payload) {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(chat_id = %self.chat_id, "undecodable upstream stream event: {err}");
                return Some(UpstreamFrame::Error(format!(
                    "undecodable upstream stream event: {err}"
                )));
            }
        };
        if let Some(err) = value.get("error").filter(|v| !v.is_null()) {
            let message = err
                .get("message")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| err.to_string());
            return Some(UpstreamFrame::Error(message));
        }
        let delta = adapter.extract_stream_delta(&value)?;
        if delta.is_empty() {
            return None;
        }
        self.full_content.push_str(&delta);
        Some(UpstreamFrame::Delta(delta))
    }
}

pub fn delta_event(delta: &str) -> Event {
    Event::default().data(json!({ "content": delta }).to_string())
}

pub fn done_event() -> Event {
    Event::default().data(DONE_MARKER)
}

pub fn error_event(err: &ChatError) -> Event {
    Event::default().event("error").data(
        json!({ "error": { "code": err.code(), "message": err.to_string() } }).to_string(),
    )
}

/// Spawns the relay task and returns the downstream event stream.
///
/// The channel is bounded, so the task only reads upstream as fast as the client drains
/// events. If the client goes away the task stops and drops the upstream body.
pub fn spawn_relay(
    upstream_resp: reqwest::Response,
    adapter: ProviderAdapter,
    pending: PendingChat,
    persister: TranscriptPersister,
    idle_timeout: Duration,
) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
    let (tx, rx) = mpsc::channel::<Event>(RELAY_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let chat_id = pending.id;
        let body = upstream_resp.bytes_stream();
        match relay_upstream(body, &adapter, chat_id, &tx, idle_timeout).await {
            RelayOutcome::Completed(full_content) => {
                tracing::info!(
                    chat_id = %chat_id,
                    answer_len = full_content.len(),
                    "stream completed"
                );
                persister.spawn_persist(pending.complete(full_content));
            }
            RelayOutcome::Failed(err) => {
                tracing::warn!(chat_id = %chat_id, "upstream stream failed: {err}");
                let _ = tx.send(error_event(&err)).await;
            }
            RelayOutcome::ClientGone => {
                tracing::info!(chat_id = %chat_id, "client disconnected, upstream stream dropped");
            }
        }
    });
    tokio_stream::wrappers::ReceiverStream::new(rx).map(Ok)
}

#[derive(Debug)]
enum RelayOutcome {
    Completed(String),
    Failed(ChatError),
    ClientGone,
}

async fn relay_upstream<S, B, E>(
    body: S,
    adapter: &ProviderAdapter,
    chat_id: Uuid,
    tx: &mpsc::Sender<Event>,
    idle_timeout: Duration,
) -> RelayOutcome
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
{
    let mut acc = StreamAccumulator::new(chat_id);
    let mut events = std::pin::pin!(body.eventsource());
    loop {
        let frame = match tokio::time::timeout(idle_timeout, events.next()).await {
            Err(_) => {
                return RelayOutcome::Failed(ChatError::Stream(format!(
                    "no upstream data for {}ms",
                    idle_timeout.as_millis()
                )));
            }
            Ok(Some(Err(err))) => return RelayOutcome::Failed(ChatError::Stream(err.to_string())),
            Ok(Some(Ok(event))) => match acc.decode_event(&event, adapter) {
                Some(frame) => frame,
                None => continue,
            },
            // A clean end of body counts as completion even without the marker.
            Ok(None) => UpstreamFrame::Done,
        };
        match frame {
            UpstreamFrame::Delta(delta) => {
                if tx.send(delta_event(&delta)).await.is_err() {
                    return RelayOutcome::ClientGone;
                }
            }
            UpstreamFrame::Error(message) => {
                return RelayOutcome::Failed(ChatError::Stream(message));
            }
            UpstreamFrame::Done => {
                if tx.send(done_event()).await.is_err() {
                    return RelayOutcome::ClientGone;
                }
                return RelayOutcome::Completed(acc.into_full_content());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::models::ProviderKind;
    use crate::providers::ProviderSet;

    fn hosted() -> ProviderAdapter {
        ProviderSet::new(&GatewayConfig::with_gateway_url("http://gw.test"))
            .adapter(ProviderKind::HostedChat)
            .clone()
    }

    fn chunk(delta: &str) -> String {
        format!(
            "data: {}\n\n",
            json!({"choices": [{"delta": {"content": delta}}]})
        )
    }

    fn upstream_event(data: &str) -> UpstreamEvent {
        UpstreamEvent {
            event: "message".to_string(),
            data: data.to_string(),
            id: String::new(),
            retry: None,
        }
    }

    fn body_of(chunks: Vec<Vec<u8>>) -> impl Stream<Item = Result<Vec<u8>, Infallible>> {
        futures_util::stream::iter(chunks.into_iter().map(Ok))
    }

    async fn drain(mut rx: mpsc::Receiver<Event>) -> usize {
        let mut count = 0;
        while rx.recv().await.is_some() {
            count += 1;
        }
        count
    }

    #[test]
    fn role_only_chunks_are_skipped() {
        let adapter = hosted();
        let mut acc = StreamAccumulator::new(Uuid::new_v4());
        let role = json!({"choices": [{"delta": {"role": "assistant"}}]}).to_string();
        assert_eq!(acc.decode_event(&upstream_event(&role), &adapter), None);
        assert_eq!(
            acc.decode_event(&upstream_event(" [DONE] "), &adapter),
            Some(UpstreamFrame::Done)
        );
    }

    #[test]
    fn error_payload_becomes_error_frame() {
        let adapter = hosted();
        let mut acc = StreamAccumulator::new(Uuid::new_v4());
        let data = json!({"error": {"message": "overloaded"}}).to_string();
        assert_eq!(
            acc.decode_event(&upstream_event(&data), &adapter),
            Some(UpstreamFrame::Error("overloaded".to_string()))
        );
    }

    #[test]
    fn undecodable_payload_becomes_error_frame() {
        let adapter = hosted();
        let mut acc = StreamAccumulator::new(Uuid::new_v4());
        let frame = acc.decode_event(&upstream_event("{\"choices\": [tru"), &adapter);
        assert!(matches!(frame, Some(UpstreamFrame::Error(_))));
        assert!(acc.into_full_content().is_empty());
    }

    #[tokio::test]
    async fn multibyte_character_split_across_chunks_survives() {
        let adapter = hosted();
        let wire = format!("{}{}data: [DONE]\n\n", chunk("Hel"), chunk("你好"));
        let split = wire.find('你').unwrap() + 1;
        let bytes = wire.into_bytes();
        let body = body_of(vec![bytes[..split].to_vec(), bytes[split..].to_vec()]);
        let (tx, rx) = mpsc::channel(RELAY_CHANNEL_CAPACITY);
        let outcome =
            relay_upstream(body, &adapter, Uuid::new_v4(), &tx, Duration::from_secs(1)).await;
        drop(tx);
        match outcome {
            RelayOutcome::Completed(content) => assert_eq!(content, "Hel你好"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(drain(rx).await, 3);
    }

    #[tokio::test]
    async fn comments_and_crlf_framing_are_tolerated() {
        let adapter = hosted();
        let wire = format!(": keep-alive\r\n\r\n{}", chunk("x").replace('\n', "\r\n"));
        let body = body_of(vec![wire.into_bytes()]);
        let (tx, _rx) = mpsc::channel(RELAY_CHANNEL_CAPACITY);
        let outcome =
            relay_upstream(body, &adapter, Uuid::new_v4(), &tx, Duration::from_secs(1)).await;
        match outcome {
            RelayOutcome::Completed(content) => assert_eq!(content, "x"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn undecodable_event_fails_the_stream() {
        let adapter = hosted();
        let wire = format!("{}data: not json\n\n{}", chunk("a"), chunk("b"));
        let body = body_of(vec![wire.into_bytes()]);
        let (tx, _rx) = mpsc::channel(RELAY_CHANNEL_CAPACITY);
        let outcome =
            relay_upstream(body, &adapter, Uuid::new_v4(), &tx, Duration::from_secs(1)).await;
        match outcome {
            RelayOutcome::Failed(err) => assert_eq!(err.code(), "stream_error"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn stalled_upstream_hits_idle_timeout() {
        let adapter = hosted();
        let body = body_of(vec![chunk("a").into_bytes()]).chain(futures_util::stream::pending());
        let (tx, _rx) = mpsc::channel(RELAY_CHANNEL_CAPACITY);
        let outcome =
            relay_upstream(body, &adapter, Uuid::new_v4(), &tx, Duration::from_millis(50)).await;
        match outcome {
            RelayOutcome::Failed(err) => assert!(err.to_string().contains("no upstream data")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropped_receiver_stops_the_relay() {
        let adapter = hosted();
        let body = body_of(vec![chunk("a").into_bytes()]).chain(futures_util::stream::pending());
        let (tx, rx) = mpsc::channel(RELAY_CHANNEL_CAPACITY);
        drop(rx);
        let outcome =
            relay_upstream(body, &adapter, Uuid::new_v4(), &tx, Duration::from_secs(5)).await;
        assert!(matches!(outcome, RelayOutcome::ClientGone));
    }

    #[test]
    fn error_event_carries_code_and_message() {
        let err = ChatError::Stream("boom".to_string());
        let rendered = format!("{:?}", error_event(&err));
        assert!(rendered.contains("stream_error"));
    }
}
