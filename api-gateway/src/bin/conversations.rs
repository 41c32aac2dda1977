//! Conversations Lambda - tenant-scoped conversation history.
//!
//! Endpoints:
//! - GET /v1/conversations - List conversations (optional `modelId` filter)
//! - GET /v1/conversations/{id} - Get a conversation
//! - PATCH /v1/conversations/{id} - Rename a conversation
//! - DELETE /v1/conversations/{id} - Delete a conversation and its messages
//! - GET /v1/conversations/{id}/messages - List messages in creation order

use lambda_http::{run, service_fn, Body, Error, Request, RequestExt, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use shared::http::{route_path, tenant_context};
use shared::{error_to_response, json_response, parse_json_body, ApiResponse, CancelToken, GatewayState, TenantMediator};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;
use validator::Validate;

const COLLECTION_PATH: &str = "/v1/conversations";

/// Rename request
#[derive(Debug, Deserialize, Validate)]
struct UpdateConversationRequest {
    #[validate(length(min = 1, max = 200, message = "title must be 1-200 characters"))]
    title: String,
}

enum Route {
    List,
    Item(Uuid),
    Messages(Uuid),
}

fn parse_route(path: &str) -> Option<shared::Result<Route>> {
    if path == COLLECTION_PATH {
        return Some(Ok(Route::List));
    }
    let rest = path.strip_prefix(COLLECTION_PATH)?.strip_prefix('/')?;
    let mut segments = rest.split('/');
    let id = match segments.next().map(Uuid::parse_str) {
        Some(Ok(id)) => id,
        _ => {
            return Some(Err(shared::Error::Validation(
                "Invalid conversation ID".to_string(),
            )))
        }
    };

    match (segments.next(), segments.next()) {
        (None, _) => Some(Ok(Route::Item(id))),
        (Some("messages"), None) => Some(Ok(Route::Messages(id))),
        _ => None,
    }
}

async fn dispatch(mediator: &TenantMediator, event: &Request, route: Route) -> shared::Result<Option<(u16, Value)>> {
    let method = event.method().as_str();

    let reply = match (method, route) {
        ("GET", Route::List) => {
            let params = event.query_string_parameters();
            let filter = match params.first("modelId") {
                Some(model_id) => {
                    let model_id = Uuid::parse_str(model_id)
                        .map_err(|_| shared::Error::Validation("Invalid modelId".to_string()))?;
                    Some(json!({ "modelId": model_id }))
                }
                None => None,
            };
            let conversations = mediator.conversations().find_many(filter).await?;
            (200, serde_json::to_value(conversations)?)
        }

        ("GET", Route::Item(id)) => {
            let conversation = mediator.conversations().find_by_id(id).await?;
            (200, serde_json::to_value(conversation)?)
        }

        ("PATCH", Route::Item(id)) => {
            let request: UpdateConversationRequest = parse_json_body(event.body())?;
            request.validate()?;

            let conversation = mediator
                .conversations()
                .update(id, json!({ "title": request.title }))
                .await?;
            info!(conversation_id = %id, "Renamed conversation");
            (200, serde_json::to_value(conversation)?)
        }

        ("DELETE", Route::Item(id)) => {
            mediator.conversations().delete(id).await?;
            info!(conversation_id = %id, "Deleted conversation");
            (200, json!({ "deleted": id }))
        }

        ("GET", Route::Messages(id)) => {
            let messages = mediator.messages().find_by_conversation(id).await?;
            (200, serde_json::to_value(messages)?)
        }

        _ => return Ok(None),
    };

    Ok(Some(reply))
}

async fn handler(state: Arc<GatewayState>, event: Request) -> Result<Response<Body>, Error> {
    let path = route_path(&event);

    let route = match parse_route(&path) {
        Some(Ok(route)) => route,
        Some(Err(e)) => return error_to_response(&e),
        None => return json_response(404, &ApiResponse::<()>::error("Not found")),
    };

    let context = match tenant_context(&event, state.session_secret.as_deref()) {
        Ok(context) => context,
        Err(e) => return error_to_response(&e),
    };
    let mediator = state.mediator(context, CancelToken::new());

    match dispatch(&mediator, &event, route).await {
        Ok(Some((status, data))) => json_response(status, &ApiResponse::success(data)),
        Ok(None) => json_response(405, &ApiResponse::<()>::error("Method not allowed")),
        Err(e) => error_to_response(&e),
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let state = Arc::new(GatewayState::from_env().await?);

    run(service_fn(move |event| {
        let state = Arc::clone(&state);
        async move { handler(state, event).await }
    }))
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_route() {
        let id = Uuid::new_v4();
        assert!(matches!(parse_route("/v1/conversations"), Some(Ok(Route::List))));
        assert!(matches!(parse_route(&format!("/v1/conversations/{}", id)), Some(Ok(Route::Item(got))) if got == id));
        assert!(matches!(
            parse_route(&format!("/v1/conversations/{}/messages", id)),
            Some(Ok(Route::Messages(got))) if got == id
        ));
        assert!(matches!(parse_route("/v1/conversations/nope"), Some(Err(shared::Error::Validation(_)))));
        assert!(parse_route("/v1/models").is_none());
        assert!(parse_route(&format!("/v1/conversations/{}/other", id)).is_none());
    }
}
