//! Models Lambda - organization-owned model configurations and groups.
//!
//! Endpoints:
//! - GET /v1/models - List model configurations
//! - POST /v1/models - Connect a new AI endpoint
//! - GET /v1/models/{id} - Get a model configuration
//! - PUT /v1/models/{id} - Replace a model configuration
//! - DELETE /v1/models/{id} - Delete a model configuration
//! - GET /v1/groups - List groups
//! - POST /v1/groups - Create a group
//! - GET /v1/groups/{id} - Get a group
//! - PUT /v1/groups/{id} - Update a group
//! - DELETE /v1/groups/{id} - Delete a group

use lambda_http::{run, service_fn, Body, Error, Request, Response};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shared::http::{route_path, tenant_context};
use shared::models::ModelConfigInput;
use shared::{error_to_response, json_response, parse_json_body, ApiResponse, CancelToken, GatewayState, TenantMediator};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;
use validator::Validate;

/// Create or update group request
#[derive(Debug, Serialize, Deserialize, Validate)]
struct GroupRequest {
    #[validate(length(min = 1, max = 120, message = "name must be 1-120 characters"))]
    name: String,
    #[validate(length(max = 1000))]
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Resource {
    Models,
    Groups,
}

impl Resource {
    fn label(self) -> &'static str {
        match self {
            Resource::Models => "model",
            Resource::Groups => "group",
        }
    }
}

/// Resource and optional item id of a path.
fn parse_route(path: &str) -> Option<shared::Result<(Resource, Option<Uuid>)>> {
    let mut segments = path.trim_start_matches('/').split('/');
    if segments.next() != Some("v1") {
        return None;
    }

    let resource = match segments.next() {
        Some("models") => Resource::Models,
        Some("groups") => Resource::Groups,
        _ => return None,
    };

    match (segments.next(), segments.next()) {
        (None, _) => Some(Ok((resource, None))),
        (Some(id), None) => Some(
            Uuid::parse_str(id)
                .map(|id| (resource, Some(id)))
                .map_err(|_| shared::Error::Validation(format!("Invalid {} ID", resource.label()))),
        ),
        _ => None,
    }
}

/// Validate a group payload and turn it back into attributes.
fn group_attributes(event: &Request) -> shared::Result<Value> {
    let request: GroupRequest = serde_json::from_value(parse_json_body(event.body())?)
        .map_err(|e| shared::Error::Validation(format!("Invalid group: {}", e)))?;
    request.validate()?;
    Ok(serde_json::to_value(request)?)
}

/// Validate a model payload and turn it back into attributes.
fn model_attributes(event: &Request) -> shared::Result<Value> {
    let input = ModelConfigInput::from_value(parse_json_body(event.body())?)?;
    Ok(serde_json::to_value(input)?)
}

async fn dispatch(
    mediator: &TenantMediator,
    event: &Request,
    resource: Resource,
    id: Option<Uuid>,
) -> shared::Result<Option<(u16, Value)>> {
    let method = event.method().as_str();

    let reply = match (method, resource, id) {
        ("GET", Resource::Models, None) => (200, serde_json::to_value(mediator.models().find_many(None).await?)?),
        ("GET", Resource::Groups, None) => (200, serde_json::to_value(mediator.groups().find_many(None).await?)?),

        ("POST", Resource::Models, None) => {
            let model = mediator.models().create(model_attributes(event)?).await?;
            info!(model_id = %model.id, protocol = model.protocol.kind(), "Created model configuration");
            (201, serde_json::to_value(model)?)
        }
        ("POST", Resource::Groups, None) => {
            let group = mediator.groups().create(group_attributes(event)?).await?;
            info!(group_id = %group.id, "Created group");
            (201, serde_json::to_value(group)?)
        }

        ("GET", Resource::Models, Some(id)) => (200, serde_json::to_value(mediator.models().find_by_id(id).await?)?),
        ("GET", Resource::Groups, Some(id)) => (200, serde_json::to_value(mediator.groups().find_by_id(id).await?)?),

        ("PUT", Resource::Models, Some(id)) => {
            let model = mediator.models().update(id, model_attributes(event)?).await?;
            info!(model_id = %id, "Updated model configuration");
            (200, serde_json::to_value(model)?)
        }
        ("PUT", Resource::Groups, Some(id)) => {
            let group = mediator.groups().update(id, group_attributes(event)?).await?;
            info!(group_id = %id, "Updated group");
            (200, serde_json::to_value(group)?)
        }

        ("DELETE", resource, Some(id)) => {
            match resource {
                Resource::Models => mediator.models().delete(id).await?,
                Resource::Groups => mediator.groups().delete(id).await?,
            }
            info!(resource = resource.label(), id = %id, "Deleted");
            (200, json!({ "deleted": id }))
        }

        _ => return Ok(None),
    };

    Ok(Some(reply))
}

async fn handler(state: Arc<GatewayState>, event: Request) -> Result<Response<Body>, Error> {
    let path = route_path(&event);

    let (resource, id) = match parse_route(&path) {
        Some(Ok(route)) => route,
        Some(Err(e)) => return error_to_response(&e),
        None => return json_response(404, &ApiResponse::<()>::error("Not found")),
    };

    let context = match tenant_context(&event, state.session_secret.as_deref()) {
        Ok(context) => context,
        Err(e) => return error_to_response(&e),
    };
    let mediator = state.mediator(context, CancelToken::new());

    match dispatch(&mediator, &event, resource, id).await {
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

    fn request(body: &str) -> Request {
        Request::new(Body::from(body.to_string()))
    }

    #[test]
    fn test_parse_route() {
        let id = Uuid::new_v4();
        assert!(matches!(parse_route("/v1/models"), Some(Ok((Resource::Models, None)))));
        assert!(matches!(parse_route("/v1/groups"), Some(Ok((Resource::Groups, None)))));
        assert!(matches!(
            parse_route(&format!("/v1/models/{}", id)),
            Some(Ok((Resource::Models, Some(got)))) if got == id
        ));
        assert!(matches!(parse_route("/v1/groups/abc"), Some(Err(shared::Error::Validation(_)))));
        assert!(parse_route("/v1/chat").is_none());
        assert!(parse_route(&format!("/v1/models/{}/extra", id)).is_none());
    }

    #[test]
    fn test_group_attributes_validated() {
        let attrs = group_attributes(&request(r#"{"name":"Support","description":"Tier 1"}"#)).unwrap();
        assert_eq!(attrs, json!({ "name": "Support", "description": "Tier 1" }));

        let err = group_attributes(&request(r#"{"name":""}"#)).unwrap_err();
        assert!(matches!(err, shared::Error::Validation(_)));
    }

    #[test]
    fn test_model_attributes_reject_unknown_protocol() {
        let err = model_attributes(&request(
            r#"{"name":"x","endpoint":{"url":"https://example.com"},"protocol":{"kind":"carrier-pigeon"}}"#,
        ))
        .unwrap_err();
        assert!(matches!(err, shared::Error::Validation(_)));
    }
}
