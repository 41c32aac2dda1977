//! Persistence tee: mirror a normalized stream to the caller while building
//! the assistant message, then store that message once.
//!
//! The caller's branch is an unbounded channel fed by a spawned task, so
//! delivery never waits on accumulation or on the database. Persistence runs
//! after the caller's stream has closed and its failure is only logged.

use async_trait::async_trait;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, Span};
use uuid::Uuid;

use crate::adapters::EventStream;
use crate::cancel::CancelToken;
use crate::events::StreamEvent;
use crate::models::{ContentPart, Message, NewMessage, Role};
use crate::Result;

/// Where finished assistant messages go.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn persist_message(&self, conversation_id: Uuid, message: NewMessage) -> Result<Message>;
}

/// Builds message parts in event order. Consecutive deltas of the same kind
/// merge into one part.
#[derive(Debug, Default)]
pub struct MessageAccumulator {
    parts: Vec<ContentPart>,
}

impl MessageAccumulator {
    pub fn ingest(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::TextDelta { delta, .. } => match self.parts.last_mut() {
                Some(ContentPart::Text { text }) => text.push_str(delta),
                _ => self.parts.push(ContentPart::Text { text: delta.clone() }),
            },
            StreamEvent::ReasoningDelta { delta, .. } => match self.parts.last_mut() {
                Some(ContentPart::Reasoning { text }) => text.push_str(delta),
                _ => self.parts.push(ContentPart::Reasoning { text: delta.clone() }),
            },
            StreamEvent::ToolCall { tool_call_id, tool_name, input } => {
                self.parts.push(ContentPart::ToolCall {
                    tool_call_id: tool_call_id.clone(),
                    tool_name: tool_name.clone(),
                    input: input.clone(),
                });
            }
            StreamEvent::ToolResult { tool_call_id, tool_name, result } => {
                self.parts.push(ContentPart::ToolResult {
                    tool_call_id: tool_call_id.clone(),
                    tool_name: tool_name.clone(),
                    result: result.clone(),
                });
            }
            StreamEvent::StreamStart { .. } | StreamEvent::Error { .. } | StreamEvent::Finish { .. } => {}
        }
    }

    pub fn parts(&self) -> &[ContentPart] {
        &self.parts
    }

    pub fn into_message(self, external_id: Option<String>) -> NewMessage {
        NewMessage {
            role: Role::Assistant,
            parts: self.parts,
            external_id,
        }
    }
}

pub struct PersistenceTee {
    sink: Arc<dyn MessageSink>,
    span: Span,
}

impl PersistenceTee {
    pub fn new(sink: Arc<dyn MessageSink>) -> Self {
        Self {
            sink,
            span: tracing::info_span!("persistence_tee"),
        }
    }

    /// Wrap `stream`. The returned stream yields exactly what `stream` yields.
    ///
    /// `cancel` must be the token the upstream adapter was started with: if
    /// the caller drops the returned stream, the tee cancels the upstream,
    /// drains it to its terminal `finish`, and still persists the partial
    /// message.
    pub fn wrap(
        &self,
        stream: EventStream,
        conversation_id: Uuid,
        external_id: Option<String>,
        cancel: CancelToken,
    ) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel::<StreamEvent>();
        let sink = Arc::clone(&self.sink);
        let span = tracing::info_span!(parent: &self.span, "tee", conversation_id = %conversation_id);

        tokio::spawn(async move {
            let mut upstream = stream;
            let mut accumulator = MessageAccumulator::default();
            let mut receiver_connected = true;

            loop {
                let next = tokio::select! {
                    biased;
                    event = upstream.next() => event,
                    _ = tx.closed(), if receiver_connected => {
                        receiver_connected = false;
                        debug!(parent: &span, "Caller went away; cancelling upstream");
                        cancel.cancel();
                        continue;
                    }
                };

                let Some(event) = next else {
                    break;
                };

                accumulator.ingest(&event);
                let finished = event.is_finish();

                if receiver_connected && tx.send(event).is_err() {
                    receiver_connected = false;
                    debug!(parent: &span, "Caller went away; cancelling upstream");
                    cancel.cancel();
                }

                if finished {
                    break;
                }
            }

            // Close the caller's stream before touching the database.
            drop(tx);
            drop(upstream);

            let message = accumulator.into_message(external_id);
            let parts = message.parts.len();
            match sink.persist_message(conversation_id, message).await {
                Ok(saved) => {
                    info!(parent: &span, message_id = %saved.id, parts, "Persisted assistant message")
                }
                Err(e) => {
                    error!(parent: &span, error = %e, "Failed to persist assistant message")
                }
            }
        });

        Box::pin(UnboundedReceiverStream::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{normalize, Signal, UpstreamStream};
    use crate::events::{FinishReason, Usage};
    use crate::Error;
    use chrono::Utc;
    use futures_util::stream;
    use serde_json::json;
    use std::time::Duration;

    /// Forwards every persist call to a channel the test can await.
    struct RecordingSink {
        calls: mpsc::UnboundedSender<(Uuid, NewMessage)>,
        fail: bool,
    }

    #[async_trait]
    impl MessageSink for RecordingSink {
        async fn persist_message(&self, conversation_id: Uuid, message: NewMessage) -> Result<Message> {
            let _ = self.calls.send((conversation_id, message.clone()));
            if self.fail {
                return Err(Error::Persistence("disk full".into()));
            }
            Ok(Message {
                id: Uuid::new_v4(),
                conversation_id,
                role: message.role,
                parts: message.parts,
                external_id: message.external_id,
                created_at: Utc::now(),
            })
        }
    }

    fn recording(fail: bool) -> (Arc<dyn MessageSink>, mpsc::UnboundedReceiver<(Uuid, NewMessage)>) {
        let (calls, rx) = mpsc::unbounded_channel();
        (Arc::new(RecordingSink { calls, fail }), rx)
    }

    /// Every sender is gone once the tee and its task are dropped.
    async fn assert_no_more_calls(calls: &mut mpsc::UnboundedReceiver<(Uuid, NewMessage)>) {
        let next = tokio::time::timeout(Duration::from_secs(1), calls.recv())
            .await
            .expect("tee task should finish");
        assert!(next.is_none(), "message persisted more than once");
    }

    fn events() -> Vec<StreamEvent> {
        vec![
            StreamEvent::StreamStart { warnings: vec![] },
            StreamEvent::ReasoningDelta { id: "r".into(), delta: "let me ".into() },
            StreamEvent::ReasoningDelta { id: "r".into(), delta: "think".into() },
            StreamEvent::TextDelta { id: "t".into(), delta: "Hel".into() },
            StreamEvent::TextDelta { id: "t".into(), delta: "lo".into() },
            StreamEvent::ToolCall { tool_call_id: "c".into(), tool_name: "f".into(), input: json!({}) },
            StreamEvent::TextDelta { id: "t".into(), delta: "!".into() },
            StreamEvent::Finish { finish_reason: FinishReason::Stop, usage: Usage::default() },
        ]
    }

    #[test]
    fn test_accumulator_merges_consecutive_deltas() {
        let mut accumulator = MessageAccumulator::default();
        for event in events() {
            accumulator.ingest(&event);
        }

        assert_eq!(
            accumulator.parts(),
            &[
                ContentPart::Reasoning { text: "let me think".into() },
                ContentPart::Text { text: "Hello".into() },
                ContentPart::ToolCall { tool_call_id: "c".into(), tool_name: "f".into(), input: json!({}) },
                ContentPart::Text { text: "!".into() },
            ]
        );
    }

    #[tokio::test]
    async fn test_caller_sees_identical_stream_and_message_persists_once() {
        let (sink, mut calls) = recording(false);
        let tee = PersistenceTee::new(sink);
        let conversation_id = Uuid::new_v4();

        let source: EventStream = Box::pin(stream::iter(events()));
        let observed: Vec<_> = tee
            .wrap(source, conversation_id, Some("client-msg".into()), CancelToken::new())
            .collect()
            .await;
        assert_eq!(observed, events());

        let (persisted_for, message) = tokio::time::timeout(Duration::from_secs(1), calls.recv())
            .await
            .expect("persist should run")
            .expect("one call");
        assert_eq!(persisted_for, conversation_id);
        assert_eq!(message.role, Role::Assistant);
        assert_eq!(message.parts.len(), 4);
        assert_eq!(message.external_id.as_deref(), Some("client-msg"));

        drop(tee);
        assert_no_more_calls(&mut calls).await;
    }

    #[tokio::test]
    async fn test_persistence_failure_does_not_affect_caller() {
        let (sink, mut calls) = recording(true);
        let tee = PersistenceTee::new(sink);

        let source: EventStream = Box::pin(stream::iter(events()));
        let observed: Vec<_> = tee
            .wrap(source, Uuid::new_v4(), None, CancelToken::new())
            .collect()
            .await;

        assert_eq!(observed.len(), events().len());
        assert!(observed.last().is_some_and(StreamEvent::is_finish));
        assert!(calls.recv().await.is_some());
        drop(tee);
        assert_no_more_calls(&mut calls).await;
    }

    #[tokio::test]
    async fn test_caller_disconnect_cancels_upstream_and_persists_partial() {
        let (sink, mut calls) = recording(false);
        let tee = PersistenceTee::new(sink);
        let cancel = CancelToken::new();

        let upstream: UpstreamStream = Box::pin(
            stream::iter(vec![Ok(Signal::Event(StreamEvent::TextDelta {
                id: "t".into(),
                delta: "partial".into(),
            }))])
            .chain(stream::pending()),
        );
        let source = normalize(upstream, cancel.clone(), Span::none());

        let mut wrapped = tee.wrap(source, Uuid::new_v4(), None, cancel.clone());
        assert!(matches!(wrapped.next().await, Some(StreamEvent::StreamStart { .. })));
        assert!(matches!(wrapped.next().await, Some(StreamEvent::TextDelta { .. })));
        drop(wrapped);

        let (_, message) = tokio::time::timeout(Duration::from_secs(1), calls.recv())
            .await
            .expect("partial message should persist")
            .expect("one call");
        assert!(cancel.is_cancelled());
        assert_eq!(message.parts, vec![ContentPart::Text { text: "partial".into() }]);
        drop(tee);
        assert_no_more_calls(&mut calls).await;
    }
}
