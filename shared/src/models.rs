//! Shared data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;
use validator::Validate;

use crate::secrets::validate_secret_refs;
use crate::{Error, Result};

/// Scope of one request, resolved from identity before any core operation.
///
/// Never persisted. `organization_id` is absent for actors that do not belong
/// to an organization yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantContext {
    pub actor_id: String,
    pub organization_id: Option<Uuid>,
    pub session_id: String,
}

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// One ordered piece of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ContentPart {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
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
}

/// A message as sent by the client on the inbound chat call.
///
/// Clients send either plain `content` or structured `parts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Client-generated identifier, stored as the message's external id.
    #[serde(default)]
    pub id: Option<String>,
    pub role: Role,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub parts: Vec<ContentPart>,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            id: None,
            role: Role::User,
            content: Some(text.into()),
            parts: Vec::new(),
        }
    }

    /// Concatenated text of the message.
    pub fn text(&self) -> String {
        if let Some(content) = &self.content {
            return content.clone();
        }
        self.parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// Parts to persist: structured parts when given, otherwise the content as one text part.
    pub fn to_parts(&self) -> Vec<ContentPart> {
        if !self.parts.is_empty() {
            return self.parts.clone();
        }
        match &self.content {
            Some(text) => vec![ContentPart::Text { text: text.clone() }],
            None => Vec::new(),
        }
    }
}

/// Inbound chat call payload.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[validate(length(min = 1, message = "at least one message is required"))]
    pub messages: Vec<ChatMessage>,
    pub model_id: Uuid,
    pub conversation_id: Option<Uuid>,
    pub organization_id: Option<Uuid>,
}

/// A chat conversation, owned by the organization of its model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub user_id: String,
    pub model_id: Uuid,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

/// Attributes for a new conversation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewConversation {
    pub user_id: String,
    pub model_id: Uuid,
    pub title: String,
}

/// An organization-owned group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A persisted message. Messages carry no organization of their own; access
/// is always mediated by the parent conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: Role,
    pub parts: Vec<ContentPart>,
    #[serde(default)]
    pub external_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Attributes for a new message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub role: Role,
    pub parts: Vec<ContentPart>,
    #[serde(default)]
    pub external_id: Option<String>,
}

/// How to reach an external AI endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    /// Header template; values may contain `${var}` tokens and `{{secret:name}}` placeholders.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_body_template")]
    pub body_template: Value,
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_body_template() -> Value {
    serde_json::json!({ "messages": "${messages}" })
}

/// Settings for synchronous JSON endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookOptions {
    pub response_path: String,
    #[serde(default)]
    pub simulate_stream: bool,
    #[serde(default)]
    pub chunk_delay_ms: Option<u64>,
}

/// How non-text SSE content is turned into text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentEncoding {
    #[default]
    Text,
    Json,
    Base64,
}

/// Field mapping from an SSE endpoint's events into normalized events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SseMapping {
    #[serde(default)]
    pub role_path: Option<String>,
    pub content_path: String,
    #[serde(default)]
    pub role_map: HashMap<String, String>,
    #[serde(default)]
    pub attachment_encoding: AttachmentEncoding,
    #[serde(default)]
    pub tool_calls_path: Option<String>,
    #[serde(default)]
    pub tool_call_id_path: Option<String>,
    #[serde(default)]
    pub finish_reason_path: Option<String>,
}

/// Event vocabulary spoken by a native-stream endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NativeFormat {
    DataStream,
    #[default]
    UiMessageStream,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeStreamOptions {
    #[serde(default)]
    pub default_format: NativeFormat,
}

/// Protocol settings, keyed by the wire format the endpoint speaks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Protocol {
    Webhook(WebhookOptions),
    Sse(SseMapping),
    NativeStream(NativeStreamOptions),
}

impl Protocol {
    pub const fn kind(&self) -> &'static str {
        match self {
            Protocol::Webhook(_) => "webhook",
            Protocol::Sse(_) => "sse",
            Protocol::NativeStream(_) => "native-stream",
        }
    }
}

/// One connected AI endpoint, owned by an organization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub endpoint: Endpoint,
    pub protocol: Protocol,
    pub created_at: DateTime<Utc>,
}

/// Attributes accepted when creating or replacing a model configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfigInput {
    pub name: String,
    pub endpoint: Endpoint,
    pub protocol: Protocol,
}

impl ModelConfigInput {
    /// Parse and validate a raw payload. Unknown protocol kinds are rejected here.
    pub fn from_value(value: Value) -> Result<Self> {
        let input: Self = serde_json::from_value(value)
            .map_err(|e| Error::Validation(format!("Invalid model configuration: {}", e)))?;
        validate_model(&input.endpoint, &input.protocol)?;
        Ok(input)
    }
}

impl ModelConfig {
    /// Check the parts serde cannot: URL scheme, HTTP method, secret
    /// references, required paths.
    pub fn validate(&self) -> Result<()> {
        validate_model(&self.endpoint, &self.protocol)
    }
}

fn validate_model(endpoint: &Endpoint, protocol: &Protocol) -> Result<()> {
    let url = reqwest::Url::parse(&endpoint.url)
        .map_err(|e| Error::Validation(format!("Invalid endpoint URL: {}", e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::Validation(format!(
            "Unsupported endpoint scheme: {}",
            url.scheme()
        )));
    }

    reqwest::Method::from_bytes(endpoint.method.to_uppercase().as_bytes())
        .map_err(|_| Error::Validation(format!("Invalid HTTP method: {}", endpoint.method)))?;

    validate_secret_refs(&endpoint.headers)?;

    match protocol {
        Protocol::Webhook(options) if options.response_path.trim().is_empty() => Err(
            Error::Validation("Webhook models require a responsePath".to_string()),
        ),
        Protocol::Sse(mapping) if mapping.content_path.trim().is_empty() => Err(
            Error::Validation("SSE models require a contentPath".to_string()),
        ),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_webhook_model() {
        let input = ModelConfigInput::from_value(json!({
            "name": "Support bot",
            "endpoint": { "url": "https://bot.example.com/run" },
            "protocol": { "kind": "webhook", "responsePath": "choices[0].text", "simulateStream": true }
        }))
        .unwrap();

        assert_eq!(input.endpoint.method, "POST");
        assert_eq!(input.protocol.kind(), "webhook");
        match input.protocol {
            Protocol::Webhook(options) => assert!(options.simulate_stream),
            other => panic!("unexpected protocol {:?}", other),
        }
    }

    #[test]
    fn test_unknown_protocol_kind_is_validation_error() {
        let err = ModelConfigInput::from_value(json!({
            "name": "Mystery",
            "endpoint": { "url": "https://example.com" },
            "protocol": { "kind": "grpc" }
        }))
        .unwrap_err();

        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_rejects_non_http_scheme() {
        let err = ModelConfigInput::from_value(json!({
            "name": "Local",
            "endpoint": { "url": "file:///etc/passwd" },
            "protocol": { "kind": "native-stream" }
        }))
        .unwrap_err();

        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_rejects_secret_paths_in_headers() {
        let err = ModelConfigInput::from_value(json!({
            "name": "Leaky",
            "endpoint": {
                "url": "https://collector.example.com",
                "headers": { "x-db": "{{secret:prod/chat-gateway/database}}" }
            },
            "protocol": { "kind": "native-stream" }
        }))
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        assert!(ModelConfigInput::from_value(json!({
            "name": "Keyed",
            "endpoint": {
                "url": "https://api.example.com",
                "headers": { "authorization": "Bearer {{secret:openai-key}}" }
            },
            "protocol": { "kind": "native-stream" }
        }))
        .is_ok());
    }

    #[test]
    fn test_chat_message_text_from_parts() {
        let message: ChatMessage = serde_json::from_value(json!({
            "id": "msg-1",
            "role": "user",
            "parts": [
                { "type": "text", "text": "Hello " },
                { "type": "reasoning", "text": "ignored" },
                { "type": "text", "text": "there" }
            ]
        }))
        .unwrap();

        assert_eq!(message.text(), "Hello there");
        assert_eq!(message.to_parts().len(), 3);
    }

    #[test]
    fn test_chat_request_requires_messages() {
        let request: ChatRequest = serde_json::from_value(json!({
            "messages": [],
            "modelId": Uuid::new_v4()
        }))
        .unwrap();

        assert!(request.validate().is_err());
    }
}
