//! Chat Lambda - streams a normalized event stream for one chat turn.
//!
//! Deployed behind a function URL with response streaming enabled.
//!
//! Endpoints:
//! - POST /v1/chat - Run a chat turn against a configured model
//!
//! The response body is `text/event-stream`, one `data: <event>` block per
//! normalized event. The resolved conversation id is returned in the
//! `x-conversation-id` header.

use futures_util::StreamExt;
use lambda_http::{run_with_streaming_response, service_fn, Error, Request, Response};
use lambda_runtime::streaming::{channel, Body};
use shared::adapters::ChatTurn;
use shared::http::{route_path, tenant_context};
use shared::models::{ChatMessage, ChatRequest, Conversation, ModelConfig, NewConversation, NewMessage, Role};
use shared::secrets::{resolve_header_secrets, SecretSource};
use shared::{parse_json_body, ApiResponse, CancelToken, GatewayState, PersistenceTee, StreamRouter, TenantMediator};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use validator::Validate;

const MAX_TITLE_CHARS: usize = 80;

struct AppState {
    gateway: GatewayState,
    router: StreamRouter,
}

/// Title for a new conversation: the opening user message, shortened.
fn conversation_title(messages: &[ChatMessage]) -> String {
    let text = messages
        .iter()
        .find(|m| m.role == Role::User)
        .map(ChatMessage::text)
        .unwrap_or_default();
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");

    if text.is_empty() {
        return "New conversation".to_string();
    }
    if text.chars().count() <= MAX_TITLE_CHARS {
        return text;
    }
    let mut title: String = text.chars().take(MAX_TITLE_CHARS - 1).collect();
    title.push('…');
    title
}

fn error_stream_response(err: &shared::Error) -> Result<Response<Body>, Error> {
    let status = err.status_code();
    if status >= 500 {
        error!(error = %err, status, "Chat request failed");
    } else {
        warn!(error = %err, status, "Chat request rejected");
    }

    let payload = serde_json::to_string(&ApiResponse::<()>::error(err.public_message()))?;
    Ok(Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(payload))?)
}

/// Everything a turn needs before the upstream is called.
struct PreparedTurn {
    model: ModelConfig,
    conversation: Conversation,
    turn: ChatTurn,
}

/// Resolve the model, its secrets and the conversation, and store the
/// latest user message. Configuration problems are rejected before anything
/// is written.
async fn prepare_turn(
    router: &StreamRouter,
    mediator: &TenantMediator,
    secrets: &dyn SecretSource,
    request: ChatRequest,
) -> shared::Result<PreparedTurn> {
    let context = mediator.context();

    // The body may name an organization, but identity decides which one.
    if let Some(organization_id) = request.organization_id {
        if context.organization_id != Some(organization_id) {
            return Err(shared::Error::TenantAccessViolation(
                "Request organization does not match caller".to_string(),
            ));
        }
    }
    let actor_id = context.actor_id.clone();

    let mut model = mediator.models().find_by_id(request.model_id).await?;
    model.validate()?;
    router.adapter_for_kind(model.protocol.kind())?;
    model.endpoint.headers =
        resolve_header_secrets(&model.endpoint.headers, model.organization_id, secrets).await?;

    let conversation = match request.conversation_id {
        Some(id) => {
            let conversation = mediator.conversations().find_by_id(id).await?;
            if conversation.model_id != model.id {
                return Err(shared::Error::Validation(format!(
                    "Conversation {} belongs to a different model",
                    id
                )));
            }
            conversation
        }
        None => {
            let attrs = NewConversation {
                user_id: actor_id.clone(),
                model_id: model.id,
                title: conversation_title(&request.messages),
            };
            mediator.conversations().create(serde_json::to_value(attrs)?).await?
        }
    };

    if let Some(latest) = request.messages.last().filter(|m| m.role == Role::User) {
        let message = NewMessage {
            role: Role::User,
            parts: latest.to_parts(),
            external_id: latest.id.clone(),
        };
        mediator.messages().create(conversation.id, message).await?;
    }

    let turn = ChatTurn {
        messages: request.messages,
        conversation_id: Some(conversation.id),
        actor_id: Some(actor_id),
    };
    Ok(PreparedTurn { model, conversation, turn })
}

async fn start_chat(state: &AppState, event: &Request) -> shared::Result<Response<Body>> {
    let context = tenant_context(event, state.gateway.session_secret.as_deref())?;

    let request: ChatRequest = parse_json_body(event.body())?;
    request.validate()?;

    let cancel = CancelToken::new();
    let mediator = state.gateway.mediator(context, cancel.clone());

    let PreparedTurn { model, conversation, turn } =
        prepare_turn(&state.router, &mediator, &state.gateway.secrets, request).await?;

    info!(
        conversation_id = %conversation.id,
        model_id = %model.id,
        protocol = model.protocol.kind(),
        "Starting chat turn"
    );

    let stream = state.router.route(&model, &turn, cancel.clone())?;

    let tee = PersistenceTee::new(Arc::new(mediator.detached()));
    let mut events = tee.wrap(stream, conversation.id, None, cancel.clone());

    let (mut tx, rx) = channel();
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            if let Err(e) = tx.send_data(event.to_sse()).await {
                warn!(error = %e, "Client disconnected mid-stream");
                cancel.cancel();
                break;
            }
        }
    });

    Response::builder()
        .status(200)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .header("x-conversation-id", conversation.id.to_string())
        .body(rx)
        .map_err(|e| shared::Error::Internal(format!("Failed to build response: {}", e)))
}

async fn handler(state: Arc<AppState>, event: Request) -> Result<Response<Body>, Error> {
    let path = route_path(&event);
    let method = event.method().as_str();

    match (method, path.as_str()) {
        ("POST", "/v1/chat") => match start_chat(&state, &event).await {
            Ok(response) => Ok(response),
            Err(e) => error_stream_response(&e),
        },
        _ => {
            let payload = serde_json::to_string(&ApiResponse::<()>::error("Not found"))?;
            Ok(Response::builder()
                .status(404)
                .header("content-type", "application/json")
                .body(Body::from(payload))?)
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let gateway = GatewayState::from_env().await?;
    let router = StreamRouter::from_config(&gateway.config)?;
    let state = Arc::new(AppState { gateway, router });

    run_with_streaming_response(service_fn(move |event| {
        let state = Arc::clone(&state);
        async move { handler(state, event).await }
    }))
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared::tenant::{Collection, MemoryStore, TenantStore};
    use shared::TenantContext;
    use std::collections::HashMap;
    use std::time::Duration;
    use uuid::Uuid;

    #[test]
    fn test_conversation_title() {
        assert_eq!(
            conversation_title(&[ChatMessage::user("  What   is\nRust? ")]),
            "What is Rust?"
        );
        assert_eq!(conversation_title(&[]), "New conversation");

        let long = "word ".repeat(40);
        let title = conversation_title(&[ChatMessage::user(long)]);
        assert_eq!(title.chars().count(), MAX_TITLE_CHARS);
        assert!(title.ends_with('…'));
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        organization_id: Uuid,
        router: StreamRouter,
        secrets: HashMap<String, String>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: Arc::new(MemoryStore::new()),
                organization_id: Uuid::new_v4(),
                router: StreamRouter::new(reqwest::Client::new(), Duration::ZERO),
                secrets: HashMap::new(),
            }
        }

        fn mediator(&self) -> TenantMediator {
            let context = TenantContext {
                actor_id: "user-1".to_string(),
                organization_id: Some(self.organization_id),
                session_id: "session-1".to_string(),
            };
            TenantMediator::new(context, self.store.clone() as Arc<dyn TenantStore>)
        }

        async fn model(&self) -> ModelConfig {
            self.mediator()
                .models()
                .create(json!({
                    "name": "bot",
                    "endpoint": { "url": "http://127.0.0.1:9/run" },
                    "protocol": { "kind": "webhook", "responsePath": "text" }
                }))
                .await
                .unwrap()
        }

        async fn prepare(&self, request: serde_json::Value) -> shared::Result<PreparedTurn> {
            let request: ChatRequest = serde_json::from_value(request).unwrap();
            prepare_turn(&self.router, &self.mediator(), &self.secrets, request).await
        }
    }

    #[tokio::test]
    async fn test_prepare_creates_conversation_and_stores_user_message() {
        let fixture = Fixture::new();
        let model = fixture.model().await;

        let prepared = fixture
            .prepare(json!({
                "modelId": model.id,
                "messages": [{ "id": "m-1", "role": "user", "content": "Plan my week" }]
            }))
            .await
            .unwrap();

        assert_eq!(prepared.conversation.title, "Plan my week");
        assert_eq!(prepared.turn.conversation_id, Some(prepared.conversation.id));

        let stored = fixture
            .mediator()
            .messages()
            .find_by_conversation(prepared.conversation.id)
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].external_id.as_deref(), Some("m-1"));
    }

    #[tokio::test]
    async fn test_invalid_stored_model_is_rejected_before_any_write() {
        let fixture = Fixture::new();
        let mut doc = serde_json::Map::new();
        doc.insert("name".to_string(), json!("legacy"));
        doc.insert("endpoint".to_string(), json!({ "url": "ftp://files.example.com" }));
        doc.insert("protocol".to_string(), json!({ "kind": "webhook", "responsePath": "text" }));
        let row = fixture
            .store
            .insert(Collection::Models, fixture.organization_id, doc)
            .await
            .unwrap();

        let err = fixture
            .prepare(json!({ "modelId": row.id, "messages": [{ "role": "user", "content": "hi" }] }))
            .await
            .err()
            .expect("invalid model must be rejected");
        assert!(matches!(err, shared::Error::Validation(_)));

        let conversations = fixture.mediator().conversations().find_many(None).await.unwrap();
        assert!(conversations.is_empty());
    }

    #[tokio::test]
    async fn test_conversation_must_belong_to_requested_model() {
        let fixture = Fixture::new();
        let first = fixture.model().await;
        let second = fixture.model().await;

        let prepared = fixture
            .prepare(json!({ "modelId": first.id, "messages": [{ "role": "user", "content": "hi" }] }))
            .await
            .unwrap();
        let conversation_id = prepared.conversation.id;

        let err = fixture
            .prepare(json!({
                "modelId": second.id,
                "conversationId": conversation_id,
                "messages": [{ "role": "user", "content": "switch" }]
            }))
            .await
            .err()
            .expect("model mismatch must be rejected");
        assert!(matches!(err, shared::Error::Validation(_)));

        let stored = fixture
            .mediator()
            .messages()
            .find_by_conversation(conversation_id)
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn test_header_secrets_resolve_in_model_organization() {
        let mut fixture = Fixture::new();
        fixture.secrets.insert(
            shared::secrets::tenant_secret_id(fixture.organization_id, "bot-key"),
            "sk-live".to_string(),
        );
        let model: ModelConfig = fixture
            .mediator()
            .models()
            .create(json!({
                "name": "keyed",
                "endpoint": {
                    "url": "https://bot.example.com",
                    "headers": { "authorization": "Bearer {{secret:bot-key}}" }
                },
                "protocol": { "kind": "native-stream" }
            }))
            .await
            .unwrap();

        let prepared = fixture
            .prepare(json!({ "modelId": model.id, "messages": [{ "role": "user", "content": "hi" }] }))
            .await
            .unwrap();
        assert_eq!(prepared.model.endpoint.headers["authorization"], "Bearer sk-live");
    }
}
