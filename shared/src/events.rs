//! The normalized stream event vocabulary every adapter translates into.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Why a stream ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    #[default]
    Stop,
    Length,
    ContentFilter,
    ToolCalls,
    Error,
    Other,
    Unknown,
}

impl FinishReason {
    /// Map the finish reasons used by common upstreams (`stop`, `end_turn`,
    /// `max_tokens`, `tool_calls`, ...) onto the normalized set.
    pub fn from_upstream(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "stop" | "end-turn" | "stop-sequence" | "complete" | "completed" => Self::Stop,
            "length" | "max-tokens" => Self::Length,
            "content-filter" | "safety" => Self::ContentFilter,
            "tool-calls" | "tool-use" | "function-call" => Self::ToolCalls,
            "error" => Self::Error,
            "other" | "cancelled" | "aborted" => Self::Other,
            _ => Self::Unknown,
        }
    }
}

/// Token accounting reported by the upstream, when it reports any.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
}

impl Usage {
    /// Read usage from an upstream `usage` object, accepting both the
    /// `prompt_tokens`/`completion_tokens` and `input_tokens`/`output_tokens`
    /// spellings (snake or camel case).
    pub fn from_value(value: &Value) -> Option<Self> {
        let field = |names: &[&str]| names.iter().find_map(|name| value.get(*name)?.as_u64());

        let usage = Self {
            input_tokens: field(&["input_tokens", "inputTokens", "prompt_tokens", "promptTokens"]),
            output_tokens: field(&[
                "output_tokens",
                "outputTokens",
                "completion_tokens",
                "completionTokens",
            ]),
            total_tokens: field(&["total_tokens", "totalTokens"]),
        };

        if usage == Self::default() {
            None
        } else {
            Some(usage)
        }
    }
}

/// One event of a normalized stream.
///
/// Every stream starts with exactly one `StreamStart` and ends with exactly
/// one `Finish`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum StreamEvent {
    StreamStart {
        warnings: Vec<String>,
    },
    TextDelta {
        id: String,
        delta: String,
    },
    ReasoningDelta {
        id: String,
        delta: String,
    },
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        input: Value,
    },
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        result: Value,
    },
    Error {
        error: String,
    },
    Finish {
        finish_reason: FinishReason,
        usage: Usage,
    },
}

impl StreamEvent {
    pub fn is_finish(&self) -> bool {
        matches!(self, StreamEvent::Finish { .. })
    }

    /// Encode as one Server-Sent-Events block for the client.
    pub fn to_sse(&self) -> Bytes {
        let payload = serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"type":"error","error":"unserializable event"}"#.to_string());
        Bytes::from(format!("data: {}\n\n", payload))
    }
}
