//! Protocol adapters: one per external wire format, all producing the same
//! normalized event stream.
//!
//! Adapters only describe how to talk to their upstream and how to decode its
//! output into [`Signal`]s. The stream lifecycle (a single leading
//! `stream-start`, a single trailing `finish`, cancellation, turning transport
//! failures into in-band events) lives in [`normalize`], so every adapter gets
//! it identically.

pub mod lines;
mod native;
mod sse;
mod webhook;

pub use native::NativeStreamAdapter;
pub use sse::SseAdapter;
pub use webhook::WebhookAdapter;

use futures_util::{Stream, StreamExt};
use serde_json::{json, Value};
use std::pin::Pin;
use tracing::{debug, warn, Span};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::events::{FinishReason, StreamEvent, Usage};
use crate::models::{ChatMessage, Endpoint, ModelConfig, Role};
use crate::template::{build_body, render_str};
use crate::{Error, Result};

/// The normalized stream handed to callers.
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// What an adapter's decoder yields before lifecycle framing.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    /// A content event (`text-delta`, `tool-call`, in-band `error`, ...).
    Event(StreamEvent),
    /// The upstream reported how it finished. Remembered, emitted once at the end.
    Finish {
        reason: Option<FinishReason>,
        usage: Option<Usage>,
    },
}

pub(crate) type UpstreamStream = Pin<Box<dyn Stream<Item = Result<Signal>> + Send>>;

/// The conversation turn an adapter is asked to answer.
#[derive(Debug, Clone, Default)]
pub struct ChatTurn {
    /// Ordered history, oldest first.
    pub messages: Vec<ChatMessage>,
    pub conversation_id: Option<Uuid>,
    pub actor_id: Option<String>,
}

/// Common adapter contract.
pub trait ProtocolAdapter: Send + Sync {
    fn stream(&self, config: &ModelConfig, turn: &ChatTurn, cancel: CancelToken) -> EventStream;
}

/// Variables available to URL, header and body templates.
pub(crate) fn template_vars(config: &ModelConfig, turn: &ChatTurn) -> Value {
    let messages: Vec<Value> = turn
        .messages
        .iter()
        .map(|m| json!({ "role": m.role.as_str(), "content": m.text() }))
        .collect();

    let prompt = turn
        .messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(ChatMessage::text)
        .unwrap_or_default();

    json!({
        "messages": messages,
        "prompt": prompt,
        "conversationId": turn.conversation_id,
        "modelId": config.id,
        "organizationId": config.organization_id,
        "userId": turn.actor_id,
    })
}

pub(crate) fn build_request(
    client: &reqwest::Client,
    endpoint: &Endpoint,
    vars: &Value,
) -> Result<reqwest::RequestBuilder> {
    let method = reqwest::Method::from_bytes(endpoint.method.to_uppercase().as_bytes())
        .map_err(|_| Error::Validation(format!("Invalid HTTP method: {}", endpoint.method)))?;

    let mut request = client.request(method.clone(), render_str(&endpoint.url, vars));
    for (name, value) in &endpoint.headers {
        request = request.header(name.as_str(), render_str(value, vars));
    }
    if method != reqwest::Method::GET && method != reqwest::Method::HEAD {
        request = request.json(&build_body(&endpoint.body_template, vars));
    }
    Ok(request)
}

/// Send the request; connection failures and non-2xx statuses become `Error::Endpoint`.
pub(crate) async fn send(request: reqwest::RequestBuilder, span: &Span) -> Result<reqwest::Response> {
    let response = request
        .send()
        .await
        .map_err(|e| Error::Endpoint(format!("Failed to reach endpoint: {}", e)))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let snippet: String = body.chars().take(512).collect();
        warn!(parent: span, status = status.as_u16(), body = %snippet, "Endpoint returned error status");
        return Err(Error::Endpoint(format!("Endpoint returned {}", status)));
    }
    Ok(response)
}

/// An upstream that fails before producing anything.
pub(crate) fn failed(error: Error) -> UpstreamStream {
    Box::pin(futures_util::stream::once(async move { Err(error) }))
}

pub(crate) fn part_id(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4().simple())
}

enum Outcome {
    Completed,
    Cancelled,
    Failed(Error),
}

/// Frame an adapter's upstream into a well-formed normalized stream.
///
/// Guarantees exactly one leading `stream-start` and exactly one trailing
/// `finish`, whatever the upstream does: a transport failure becomes `error`
/// followed by `finish{error}`, and cancellation drops the upstream (closing
/// its reader) and ends with `finish{other}`.
pub(crate) fn normalize(upstream: UpstreamStream, cancel: CancelToken, span: Span) -> EventStream {
    Box::pin(async_stream::stream! {
        yield StreamEvent::StreamStart { warnings: Vec::new() };

        let mut upstream = upstream;
        let mut finish_reason: Option<FinishReason> = None;
        let mut usage = Usage::default();
        let mut saw_error = false;

        let outcome = loop {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                item = upstream.next() => Some(item),
            };

            match step {
                None => break Outcome::Cancelled,
                Some(None) => break Outcome::Completed,
                Some(Some(Err(e))) => break Outcome::Failed(e),
                Some(Some(Ok(Signal::Finish { reason, usage: reported }))) => {
                    if reason.is_some() {
                        finish_reason = reason;
                    }
                    if let Some(reported) = reported {
                        usage = reported;
                    }
                }
                Some(Some(Ok(Signal::Event(event)))) => match event {
                    StreamEvent::StreamStart { .. } | StreamEvent::Finish { .. } => {}
                    StreamEvent::Error { .. } => {
                        saw_error = true;
                        yield event;
                    }
                    other => yield other,
                },
            }
        };

        drop(upstream);

        match outcome {
            Outcome::Completed => {
                let reason = finish_reason.unwrap_or(if saw_error {
                    FinishReason::Error
                } else {
                    FinishReason::Stop
                });
                yield StreamEvent::Finish { finish_reason: reason, usage };
            }
            Outcome::Cancelled => {
                debug!(parent: &span, "Stream cancelled by caller");
                yield StreamEvent::Finish { finish_reason: FinishReason::Other, usage };
            }
            Outcome::Failed(e) => {
                warn!(parent: &span, error = %e, "Upstream stream failed");
                yield StreamEvent::Error { error: e.to_string() };
                yield StreamEvent::Finish { finish_reason: FinishReason::Error, usage };
            }
        }
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use chrono::Utc;

    use crate::models::Protocol;

    pub fn model(url: &str, protocol: Protocol) -> ModelConfig {
        ModelConfig {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            name: "test model".to_string(),
            endpoint: Endpoint {
                url: url.to_string(),
                method: "POST".to_string(),
                headers: Default::default(),
                body_template: json!({ "messages": "${messages}", "prompt": "${prompt}" }),
            },
            protocol,
            created_at: Utc::now(),
        }
    }

    pub fn turn(prompt: &str) -> ChatTurn {
        ChatTurn {
            messages: vec![ChatMessage::user(prompt)],
            conversation_id: Some(Uuid::new_v4()),
            actor_id: Some("user-1".to_string()),
        }
    }

    /// Assert the lifecycle invariant and return the events in between.
    pub fn assert_framed(events: &[StreamEvent]) -> &[StreamEvent] {
        assert!(
            matches!(events.first(), Some(StreamEvent::StreamStart { .. })),
            "stream must start with stream-start: {:?}",
            events
        );
        assert!(
            matches!(events.last(), Some(StreamEvent::Finish { .. })),
            "stream must end with finish: {:?}",
            events
        );
        let starts = events.iter().filter(|e| matches!(e, StreamEvent::StreamStart { .. })).count();
        let finishes = events.iter().filter(|e| e.is_finish()).count();
        assert_eq!(starts, 1, "exactly one stream-start: {:?}", events);
        assert_eq!(finishes, 1, "exactly one finish: {:?}", events);
        &events[1..events.len() - 1]
    }

    pub fn finish_reason(events: &[StreamEvent]) -> FinishReason {
        match events.last() {
            Some(StreamEvent::Finish { finish_reason, .. }) => *finish_reason,
            other => panic!("expected finish, got {:?}", other),
        }
    }

    pub fn text(events: &[StreamEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::TextDelta { delta, .. } => Some(delta.as_str()),
                _ => None,
            })
            .collect()
    }
}
