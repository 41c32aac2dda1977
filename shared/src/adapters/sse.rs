//! Adapter for endpoints that answer with Server-Sent Events.
//!
//! Each `data:` payload is decoded as JSON and mapped into normalized events
//! through the model's [`SseMapping`].

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use tracing::{debug, Span};

use super::lines::{lines, sse_data};
use super::{
    build_request, failed, normalize, part_id, send, template_vars, ChatTurn, EventStream,
    ProtocolAdapter, Signal, UpstreamStream,
};
use crate::cancel::CancelToken;
use crate::events::{FinishReason, StreamEvent, Usage};
use crate::models::{AttachmentEncoding, ModelConfig, Protocol, SseMapping};
use crate::template::get_by_path;
use crate::Error;

pub struct SseAdapter {
    client: reqwest::Client,
    span: Span,
}

impl SseAdapter {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            span: tracing::info_span!("sse_adapter"),
        }
    }
}

impl ProtocolAdapter for SseAdapter {
    fn stream(&self, config: &ModelConfig, turn: &ChatTurn, cancel: CancelToken) -> EventStream {
        let span = tracing::info_span!(parent: &self.span, "stream", model_id = %config.id);

        let mapping = match &config.protocol {
            Protocol::Sse(mapping) => mapping.clone(),
            other => {
                let error = Error::Validation(format!("SSE adapter cannot serve {} models", other.kind()));
                return normalize(failed(error), cancel, span);
            }
        };

        let vars = template_vars(config, turn);
        let request = match build_request(&self.client, &config.endpoint, &vars) {
            Ok(request) => request.header(reqwest::header::ACCEPT, "text/event-stream"),
            Err(e) => return normalize(failed(e), cancel, span),
        };

        normalize(upstream(request, mapping, span.clone()), cancel, span)
    }
}

fn upstream(request: reqwest::RequestBuilder, mapping: SseMapping, span: Span) -> UpstreamStream {
    Box::pin(async_stream::try_stream! {
        let response = send(request, &span).await?;
        let mut decoded = decode_sse(response.bytes_stream(), mapping, span);
        while let Some(signal) = decoded.next().await {
            yield signal?;
        }
    })
}

/// Decode an SSE byte stream. Read errors end the stream with
/// `Error::Endpoint`; payloads that are not JSON are skipped.
pub(crate) fn decode_sse<S, E>(bytes: S, mapping: SseMapping, span: Span) -> UpstreamStream
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    Box::pin(async_stream::try_stream! {
        let mut decoder = SseDecoder::new(mapping);
        let mut lines = Box::pin(lines(bytes));

        while let Some(line) = lines.next().await {
            let line = line.map_err(|e| Error::Endpoint(format!("Stream read error: {}", e)))?;
            let Some(data) = sse_data(&line) else {
                continue;
            };
            if data.is_empty() || data == "[DONE]" {
                continue;
            }

            let payload: Value = match serde_json::from_str(data) {
                Ok(payload) => payload,
                Err(e) => {
                    debug!(parent: &span, error = %e, "Skipping malformed SSE payload");
                    continue;
                }
            };

            for signal in decoder.decode(&payload, &span) {
                yield signal;
            }
        }

        for signal in decoder.flush_tool_calls() {
            yield signal;
        }
    })
}

/// A tool call whose arguments arrive in fragments, keyed by `index`.
#[derive(Debug, Default)]
struct PendingToolCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
    input: Option<Value>,
}

struct SseDecoder {
    mapping: SseMapping,
    text_id: String,
    reasoning_id: String,
    tool_names: HashMap<String, String>,
    pending: BTreeMap<u64, PendingToolCall>,
}

impl SseDecoder {
    fn new(mapping: SseMapping) -> Self {
        Self {
            mapping,
            text_id: part_id("txt"),
            reasoning_id: part_id("rsn"),
            tool_names: HashMap::new(),
            pending: BTreeMap::new(),
        }
    }

    fn decode(&mut self, payload: &Value, span: &Span) -> Vec<Signal> {
        let mut signals = Vec::new();

        if let Some(error) = payload.get("error").filter(|e| !e.is_null()) {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| error.as_str().map(str::to_string))
                .unwrap_or_else(|| error.to_string());
            signals.push(Signal::Event(StreamEvent::Error { error: message }));
            return signals;
        }

        let role = self.role(payload);
        let content = get_by_path(payload, &self.mapping.content_path);

        match role.as_str() {
            "assistant" => {
                if let Some(delta) = content.and_then(|c| self.encode(c, span)).filter(|d| !d.is_empty()) {
                    signals.push(Signal::Event(StreamEvent::TextDelta {
                        id: self.text_id.clone(),
                        delta,
                    }));
                }
            }
            "reasoning" => {
                if let Some(delta) = content.and_then(|c| self.encode(c, span)).filter(|d| !d.is_empty()) {
                    signals.push(Signal::Event(StreamEvent::ReasoningDelta {
                        id: self.reasoning_id.clone(),
                        delta,
                    }));
                }
            }
            "tool" => {
                if let Some(result) = content {
                    let tool_call_id = self
                        .mapping
                        .tool_call_id_path
                        .as_deref()
                        .and_then(|path| get_by_path(payload, path))
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let tool_name = self.tool_names.get(&tool_call_id).cloned().unwrap_or_default();
                    signals.push(Signal::Event(StreamEvent::ToolResult {
                        tool_call_id,
                        tool_name,
                        result: parse_json_text(result.clone()),
                    }));
                }
            }
            other => debug!(parent: span, role = %other, "Ignoring SSE event with unmapped role"),
        }

        if let Some(calls) = self
            .mapping
            .tool_calls_path
            .as_deref()
            .and_then(|path| get_by_path(payload, path))
            .and_then(Value::as_array)
        {
            for call in calls {
                if let Some(signal) = self.tool_call(call) {
                    signals.push(signal);
                }
            }
        }

        let reason = self
            .mapping
            .finish_reason_path
            .as_deref()
            .and_then(|path| get_by_path(payload, path))
            .and_then(Value::as_str)
            .map(FinishReason::from_upstream);
        let usage = payload.get("usage").and_then(Usage::from_value);

        if reason.is_some() {
            signals.extend(self.flush_tool_calls());
        }
        if reason.is_some() || usage.is_some() {
            signals.push(Signal::Finish { reason, usage });
        }

        signals
    }

    fn role(&self, payload: &Value) -> String {
        let raw = self
            .mapping
            .role_path
            .as_deref()
            .and_then(|path| get_by_path(payload, path))
            .and_then(Value::as_str)
            .unwrap_or("assistant");
        self.mapping
            .role_map
            .get(raw)
            .cloned()
            .unwrap_or_else(|| raw.to_string())
    }

    fn encode(&self, content: &Value, span: &Span) -> Option<String> {
        match self.mapping.attachment_encoding {
            AttachmentEncoding::Text => content.as_str().map(str::to_string),
            AttachmentEncoding::Json => match content {
                Value::String(text) => Some(text.clone()),
                other => Some(other.to_string()),
            },
            AttachmentEncoding::Base64 => {
                let encoded = content.as_str()?;
                match STANDARD.decode(encoded.trim()) {
                    Ok(raw) => Some(String::from_utf8_lossy(&raw).into_owned()),
                    Err(e) => {
                        debug!(parent: span, error = %e, "Skipping content that is not valid base64");
                        None
                    }
                }
            }
        }
    }

    /// Complete calls are emitted at once; indexed fragments are merged and
    /// emitted when the upstream reports a finish reason or the body ends.
    fn tool_call(&mut self, call: &Value) -> Option<Signal> {
        let id = call.get("id").and_then(Value::as_str).map(str::to_string);
        let name = call
            .get("name")
            .or_else(|| call.pointer("/function/name"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let arguments = call
            .get("arguments")
            .or_else(|| call.pointer("/function/arguments"))
            .or_else(|| call.get("input"));

        if let Some(index) = call.get("index").and_then(Value::as_u64) {
            let pending = self.pending.entry(index).or_default();
            if id.is_some() {
                pending.id = id;
            }
            if name.is_some() {
                pending.name = name;
            }
            match arguments {
                Some(Value::String(fragment)) => pending.arguments.push_str(fragment),
                Some(Value::Null) | None => {}
                Some(structured) => pending.input = Some(structured.clone()),
            }
            return None;
        }

        Some(self.emit_tool_call(
            id,
            name,
            arguments.cloned().map(parse_json_text).unwrap_or_else(empty_object),
        ))
    }

    fn flush_tool_calls(&mut self) -> Vec<Signal> {
        let pending = std::mem::take(&mut self.pending);
        pending
            .into_values()
            .map(|call| {
                let input = call.input.unwrap_or_else(|| {
                    if call.arguments.trim().is_empty() {
                        empty_object()
                    } else {
                        parse_json_text(Value::String(call.arguments))
                    }
                });
                self.emit_tool_call(call.id, call.name, input)
            })
            .collect()
    }

    fn emit_tool_call(&mut self, id: Option<String>, name: Option<String>, input: Value) -> Signal {
        let tool_call_id = id.unwrap_or_else(|| part_id("call"));
        let tool_name = name.unwrap_or_default();
        self.tool_names.insert(tool_call_id.clone(), tool_name.clone());
        Signal::Event(StreamEvent::ToolCall {
            tool_call_id,
            tool_name,
            input,
        })
    }
}

/// Tool arguments and results often arrive as JSON encoded in a string.
fn parse_json_text(value: Value) -> Value {
    match value {
        Value::String(text) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
        other => other,
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}
