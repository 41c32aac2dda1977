//! Adapter for endpoints that already speak an incremental message protocol.
//!
//! Two dialects exist in the wild. The "data stream" dialect carries text in
//! `textDelta` and tools as `tool-input-available` / `tool-output-available`;
//! the "UI message stream" dialect carries text in `delta` and tools as
//! `tool-call` (`toolInvocation`) / `tool-result` (`toolResult`). The dialect
//! is announced in a response header, with the model's `defaultFormat` as
//! fallback.

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::header::HeaderMap;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt::Display;
use tracing::{debug, info, Span};

use super::lines::{lines, sse_data};
use super::{
    build_request, failed, normalize, part_id, send, template_vars, ChatTurn, EventStream,
    ProtocolAdapter, Signal, UpstreamStream,
};
use crate::cancel::CancelToken;
use crate::events::{FinishReason, StreamEvent, Usage};
use crate::models::{ModelConfig, NativeFormat, Protocol};
use crate::Error;

pub const DATA_STREAM_HEADER: &str = "x-vercel-ai-data-stream";
pub const UI_MESSAGE_STREAM_HEADER: &str = "x-vercel-ai-ui-message-stream";

/// Field names of one dialect.
#[derive(Debug)]
struct Vocabulary {
    text_field: &'static str,
    tool_call_type: &'static str,
    tool_call_container: Option<&'static str>,
    tool_input_field: &'static str,
    tool_result_type: &'static str,
    tool_result_container: Option<&'static str>,
    tool_output_field: &'static str,
}

const DATA_STREAM: Vocabulary = Vocabulary {
    text_field: "textDelta",
    tool_call_type: "tool-input-available",
    tool_call_container: None,
    tool_input_field: "input",
    tool_result_type: "tool-output-available",
    tool_result_container: None,
    tool_output_field: "output",
};

const UI_MESSAGE_STREAM: Vocabulary = Vocabulary {
    text_field: "delta",
    tool_call_type: "tool-call",
    tool_call_container: Some("toolInvocation"),
    tool_input_field: "args",
    tool_result_type: "tool-result",
    tool_result_container: Some("toolResult"),
    tool_output_field: "result",
};

const fn vocabulary(format: NativeFormat) -> &'static Vocabulary {
    match format {
        NativeFormat::DataStream => &DATA_STREAM,
        NativeFormat::UiMessageStream => &UI_MESSAGE_STREAM,
    }
}

pub struct NativeStreamAdapter {
    client: reqwest::Client,
    span: Span,
}

impl NativeStreamAdapter {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            span: tracing::info_span!("native_stream_adapter"),
        }
    }
}

impl ProtocolAdapter for NativeStreamAdapter {
    fn stream(&self, config: &ModelConfig, turn: &ChatTurn, cancel: CancelToken) -> EventStream {
        let span = tracing::info_span!(parent: &self.span, "stream", model_id = %config.id);

        let default_format = match &config.protocol {
            Protocol::NativeStream(options) => options.default_format,
            other => {
                let error = Error::Validation(format!(
                    "Native stream adapter cannot serve {} models",
                    other.kind()
                ));
                return normalize(failed(error), cancel, span);
            }
        };

        let vars = template_vars(config, turn);
        let request = match build_request(&self.client, &config.endpoint, &vars) {
            Ok(request) => request,
            Err(e) => return normalize(failed(e), cancel, span),
        };

        normalize(upstream(request, default_format, span.clone()), cancel, span)
    }
}

fn upstream(request: reqwest::RequestBuilder, default_format: NativeFormat, span: Span) -> UpstreamStream {
    Box::pin(async_stream::try_stream! {
        let response = send(request, &span).await?;
        let format = detect_format(response.headers(), default_format);
        info!(parent: &span, format = ?format, "Native stream format resolved");

        let mut decoded = decode_native(response.bytes_stream(), format, span);
        while let Some(signal) = decoded.next().await {
            yield signal?;
        }
    })
}

/// Pick the dialect from the response headers.
pub(crate) fn detect_format(headers: &HeaderMap, default: NativeFormat) -> NativeFormat {
    if headers.contains_key(UI_MESSAGE_STREAM_HEADER) {
        NativeFormat::UiMessageStream
    } else if headers.contains_key(DATA_STREAM_HEADER) {
        NativeFormat::DataStream
    } else {
        default
    }
}

/// Decode a native event stream. Lines may be SSE `data:` blocks or bare
/// JSON objects.
pub(crate) fn decode_native<S, E>(bytes: S, format: NativeFormat, span: Span) -> UpstreamStream
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    Box::pin(async_stream::try_stream! {
        let mut decoder = NativeDecoder::new(format);
        let mut lines = Box::pin(lines(bytes));

        while let Some(line) = lines.next().await {
            let line = line.map_err(|e| Error::Endpoint(format!("Stream read error: {}", e)))?;
            let data = match sse_data(&line) {
                Some(data) => data,
                None if line.trim_start().starts_with('{') => line.trim(),
                None => continue,
            };
            if data.is_empty() || data == "[DONE]" {
                continue;
            }

            let payload: Value = match serde_json::from_str(data) {
                Ok(payload) => payload,
                Err(e) => {
                    debug!(parent: &span, error = %e, "Skipping malformed native stream event");
                    continue;
                }
            };

            if let Some(signal) = decoder.decode(&payload, &span) {
                yield signal;
            }
        }
    })
}

/// `toolInputAvailable` and `tool-input-available` name the same event.
fn kebab_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for c in name.chars() {
        if c.is_ascii_uppercase() {
            out.push('-');
            out.push(c.to_ascii_lowercase());
        } else if c == '_' {
            out.push('-');
        } else {
            out.push(c);
        }
    }
    out
}

fn str_field(value: &Value, name: &str) -> Option<String> {
    value.get(name).and_then(Value::as_str).map(str::to_string)
}

struct NativeDecoder {
    vocabulary: &'static Vocabulary,
    text_id: String,
    reasoning_id: String,
    tool_names: HashMap<String, String>,
}

impl NativeDecoder {
    fn new(format: NativeFormat) -> Self {
        Self {
            vocabulary: vocabulary(format),
            text_id: part_id("txt"),
            reasoning_id: part_id("rsn"),
            tool_names: HashMap::new(),
        }
    }

    fn decode(&mut self, payload: &Value, span: &Span) -> Option<Signal> {
        let kind = kebab_case(payload.get("type").and_then(Value::as_str)?);
        let vocab = self.vocabulary;

        let event = match kind.as_str() {
            "text-delta" => {
                let delta = str_field(payload, vocab.text_field).or_else(|| str_field(payload, "delta"))?;
                StreamEvent::TextDelta {
                    id: str_field(payload, "id").unwrap_or_else(|| self.text_id.clone()),
                    delta,
                }
            }
            "reasoning-delta" | "reasoning" => {
                let delta = str_field(payload, vocab.text_field)
                    .or_else(|| str_field(payload, "delta"))
                    .or_else(|| str_field(payload, "text"))?;
                StreamEvent::ReasoningDelta {
                    id: str_field(payload, "id").unwrap_or_else(|| self.reasoning_id.clone()),
                    delta,
                }
            }
            kind if kind == vocab.tool_call_type => {
                let call = vocab
                    .tool_call_container
                    .and_then(|field| payload.get(field))
                    .unwrap_or(payload);
                let tool_call_id = str_field(call, "toolCallId").unwrap_or_else(|| part_id("call"));
                let tool_name = str_field(call, "toolName").unwrap_or_default();
                self.tool_names.insert(tool_call_id.clone(), tool_name.clone());
                StreamEvent::ToolCall {
                    tool_call_id,
                    tool_name,
                    input: call
                        .get(vocab.tool_input_field)
                        .cloned()
                        .unwrap_or_else(|| Value::Object(Map::new())),
                }
            }
            kind if kind == vocab.tool_result_type => {
                let result = vocab
                    .tool_result_container
                    .and_then(|field| payload.get(field))
                    .unwrap_or(payload);
                let tool_call_id = str_field(result, "toolCallId").unwrap_or_default();
                let tool_name = str_field(result, "toolName")
                    .or_else(|| self.tool_names.get(&tool_call_id).cloned())
                    .unwrap_or_default();
                StreamEvent::ToolResult {
                    tool_call_id,
                    tool_name,
                    result: result.get(vocab.tool_output_field).cloned().unwrap_or(Value::Null),
                }
            }
            "error" => StreamEvent::Error {
                error: str_field(payload, "errorText")
                    .or_else(|| str_field(payload, "error"))
                    .unwrap_or_else(|| "Upstream reported an error".to_string()),
            },
            "finish" | "finish-message" => {
                return Some(Signal::Finish {
                    reason: payload
                        .get("finishReason")
                        .and_then(Value::as_str)
                        .map(FinishReason::from_upstream),
                    usage: payload.get("usage").and_then(Usage::from_value),
                });
            }
            "start" | "start-step" | "finish-step" => return None,
            other => {
                debug!(parent: span, event_type = %other, "Ignoring unknown native stream event");
                return None;
            }
        };

        Some(Signal::Event(event))
    }
}
