//! Live event delivery over SSE
//!
//! One stream covers one bounded window of a conversation's event log. The
//! client gets a `ready` frame with its starting cursor, `events` frames as
//! the log grows, and a final `end` frame carrying the cursor to resume
//! from, with `timeout` telling a still-active client to reconnect. Any
//! failure mid-stream also ends with `end`, so the client always has exactly
//! one way back in: pull or reconnect with the last cursor.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use spar_core::{ConversationId, ConversationStatus};
use spar_pipeline::{EventPage, Ops};

use crate::error::ApiError;
use crate::AppState;

/// Ending a conversation appends no event; a quiet stream re-reads the
/// status this often so it does not outlive the conversation by a whole
/// window.
const STATUS_RECHECK: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    #[serde(default)]
    pub cursor: u64,
    #[serde(default)]
    pub wait_ms: Option<u64>,
}

/// One frame on the wire. Variant names double as the SSE event names.
#[derive(Debug)]
pub(crate) enum Frame {
    Ready { cursor: u64 },
    Events(EventPage),
    End { cursor: u64, timeout: bool },
}

impl Frame {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Ready { .. } => "ready",
            Self::Events(_) => "events",
            Self::End { .. } => "end",
        }
    }

    fn to_sse(&self) -> Result<Event, axum::Error> {
        let data = match self {
            Self::Ready { cursor } => json!({ "next_cursor": cursor }),
            Self::Events(page) => json!({
                "events": page.events,
                "next_cursor": page.next_cursor,
                "has_more": page.has_more,
                "conversation_status": page.conversation_status,
            }),
            Self::End { cursor, timeout } => json!({
                "next_cursor": cursor,
                "timeout": timeout,
            }),
        };
        Event::default().event(self.name()).json_data(data)
    }
}

/// The frame sequence for one stream window.
pub(crate) fn live_frames(
    ops: Arc<Ops>,
    conversation_id: ConversationId,
    start_cursor: u64,
    window: Duration,
    status_recheck: Duration,
) -> impl Stream<Item = Frame> {
    async_stream::stream! {
        let mut cursor = start_cursor;
        yield Frame::Ready { cursor };

        let deadline = Instant::now() + window;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                yield Frame::End { cursor, timeout: true };
                return;
            }

            let wait = remaining.min(status_recheck);
            match ops.next_page(conversation_id, cursor, wait).await {
                Ok(page) => {
                    cursor = page.next_cursor;
                    let ended = page.conversation_status != ConversationStatus::Active;
                    if !page.events.is_empty() {
                        yield Frame::Events(page);
                    }
                    if ended {
                        yield Frame::End { cursor, timeout: false };
                        return;
                    }
                }
                Err(error) => {
                    warn!(
                        "event stream for {} dropped: {}",
                        conversation_id.short(),
                        error
                    );
                    yield Frame::End { cursor, timeout: false };
                    return;
                }
            }
        }
    }
}

pub async fn handle_stream_events(
    State(state): State<AppState>,
    Path(conversation_id): Path<ConversationId>,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    // A bad id is a plain 404; only a live conversation gets a stream.
    state.ops.snapshot(conversation_id).await?;

    let config = state.ops.config();
    let window = Duration::from_millis(config.clamp_stream_wait_ms(query.wait_ms));
    let keepalive = Duration::from_secs(config.events.keepalive_secs);

    let frames = live_frames(
        state.ops.clone(),
        conversation_id,
        query.cursor,
        window,
        STATUS_RECHECK,
    );
    Ok(Sse::new(frames.map(|frame| frame.to_sse()))
        .keep_alive(KeepAlive::new().interval(keepalive).text("ping")))
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;

    use spar_core::config::SpeechConfig;
    use spar_core::{AudioFormat, CoachingNote, Result, SparConfig};
    use spar_pipeline::{
        AnalysisRequest, CoachingAnalyst, MemoryAudioStore, Pipeline, SubmitRequest,
    };
    use spar_policy::PackLibrary;
    use spar_speech::{SpeechInput, Transcriber, Transcript};
    use spar_store::MemoryStore;

    struct SayingTranscriber;

    #[async_trait]
    impl Transcriber for SayingTranscriber {
        async fn transcribe(&self, _audio: &[u8], _format: AudioFormat) -> Result<Transcript> {
            Ok(Transcript {
                text: "I hear you on the price.".to_string(),
                confidence: Some(0.9),
                seconds: Some(2.0),
            })
        }
    }

    struct MockAnalyst;

    #[async_trait]
    impl CoachingAnalyst for MockAnalyst {
        async fn analyze(&self, _request: &AnalysisRequest<'_>) -> Result<CoachingNote> {
            Ok(CoachingNote::default())
        }
    }

    fn ops() -> Arc<Ops> {
        let mut config = SparConfig::default();
        config.worker.kick_enabled = false;
        config.llm.rewrite_enabled = false;
        config.speech = SpeechConfig {
            fallback_enabled: false,
            ..SpeechConfig::default()
        };
        let store = Arc::new(MemoryStore::new());
        let speech_input =
            SpeechInput::new(&config.speech).with_primary(Arc::new(SayingTranscriber));
        let pipeline = Arc::new(Pipeline::new(
            store,
            Arc::new(MemoryAudioStore::new()),
            speech_input,
            Arc::new(MockAnalyst),
            Arc::new(PackLibrary::builtin()),
            &config,
        ));
        Arc::new(Ops::new(pipeline, config))
    }

    async fn submit(ops: &Ops) -> (ConversationId, u64) {
        let new = ops.start_conversation(Some("objections"), None).await.unwrap();
        let receipt = ops
            .submit_turn(SubmitRequest {
                conversation_id: new.conversation.id,
                audio: b"RIFF\x24\x08\x00\x00WAVEfmt ".to_vec(),
                declared_format: None,
                reply_to_turn_id: new.opening.id,
                client_seconds: Some(2.0),
                idempotency_token: None,
            })
            .await
            .unwrap();
        (new.conversation.id, receipt.next_cursor)
    }

    #[tokio::test]
    async fn test_stream_replays_then_times_out() {
        let ops = ops();
        let (conversation_id, cursor) = submit(&ops).await;

        let frames: Vec<Frame> = live_frames(
            ops,
            conversation_id,
            0,
            Duration::from_millis(250),
            Duration::from_millis(50),
        )
        .collect()
        .await;

        assert_eq!(frames.len(), 3);
        assert!(matches!(frames[0], Frame::Ready { cursor: 0 }));
        match &frames[1] {
            Frame::Events(page) => {
                assert_eq!(page.events.len(), 1);
                assert_eq!(page.next_cursor, cursor);
            }
            other => panic!("expected events frame, got {}", other.name()),
        }
        match frames[2] {
            Frame::End { cursor: last, timeout } => {
                assert_eq!(last, cursor);
                assert!(timeout, "an exhausted window reports timeout");
            }
            ref other => panic!("expected end frame, got {}", other.name()),
        }
    }

    #[tokio::test]
    async fn test_stream_ends_promptly_after_conversation_ends() {
        let ops = ops();
        let new = ops.start_conversation(None, None).await.unwrap();
        ops.end_conversation(new.conversation.id).await.unwrap();

        let started = Instant::now();
        let frames: Vec<Frame> = live_frames(
            ops,
            new.conversation.id,
            0,
            Duration::from_secs(10),
            Duration::from_millis(30),
        )
        .collect()
        .await;

        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[0], Frame::Ready { .. }));
        assert!(matches!(
            frames[1],
            Frame::End {
                timeout: false,
                ..
            }
        ));
        assert!(
            started.elapsed() < Duration::from_secs(2),
            "the status recheck should beat the window by a wide margin"
        );
    }

    #[tokio::test]
    async fn test_stream_failure_ends_with_last_cursor() {
        let ops = ops();

        let frames: Vec<Frame> = live_frames(
            ops,
            ConversationId::new(),
            7,
            Duration::from_secs(5),
            Duration::from_millis(30),
        )
        .collect()
        .await;

        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[0], Frame::Ready { cursor: 7 }));
        match frames[1] {
            Frame::End { cursor, timeout } => {
                assert_eq!(cursor, 7, "the client resumes from where it was");
                assert!(!timeout);
            }
            ref other => panic!("expected end frame, got {}", other.name()),
        }
    }
}
