//! HTTP helpers for Lambda functions.

use lambda_http::{Body, Request, RequestExt, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{error, warn};

use crate::auth::{context_from_claims, context_from_token};
use crate::models::TenantContext;
use crate::Error;

/// Standard API response wrapper.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> ApiResponse<()> {
        ApiResponse {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Create a JSON response with the given status code and data.
pub fn json_response<T: Serialize>(status: u16, data: &T) -> Result<Response<Body>, lambda_http::Error> {
    Ok(Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(data)?))?)
}

/// Create an error response with the given status code and message.
pub fn error_response(status: u16, message: impl Into<String>) -> Result<Response<Body>, lambda_http::Error> {
    json_response(status, &ApiResponse::<()>::error(message))
}

/// Map a gateway error to its response. Infrastructure details are logged,
/// never returned.
pub fn error_to_response(err: &Error) -> Result<Response<Body>, lambda_http::Error> {
    let status = err.status_code();
    if status >= 500 {
        error!(error = %err, status, "Request failed");
    } else {
        warn!(error = %err, status, "Request rejected");
    }
    error_response(status, err.public_message())
}

/// Parse a request body as JSON. Malformed bodies are `Error::Validation` (400).
pub fn parse_json_body<T: DeserializeOwned>(body: &Body) -> crate::Result<T> {
    serde_json::from_slice(body.as_ref())
        .map_err(|e| Error::Validation(format!("Invalid request body: {}", e)))
}

/// Strip the `/api` stage prefix API Gateway REST APIs put in front of the path.
pub fn route_path(event: &Request) -> String {
    let raw = event.uri().path();
    raw.strip_prefix("/api").unwrap_or(raw).trim_end_matches('/').to_string()
}

/// Resolve the tenant context of a request.
///
/// Authorizer claims win; otherwise a bearer session token is accepted when
/// a session secret is configured.
pub fn tenant_context(event: &Request, session_secret: Option<&[u8]>) -> crate::Result<TenantContext> {
    let claims = event
        .request_context_ref()
        .and_then(|context| context.authorizer())
        .and_then(|authorizer| authorizer.fields.get("claims"));

    if let Some(claims) = claims {
        return context_from_claims(claims);
    }

    let bearer = event
        .headers()
        .get("authorization")
        .and_then(|value| value.to_str().ok());

    match (bearer, session_secret) {
        (Some(token), Some(secret)) => context_from_token(token, secret),
        _ => Err(Error::Auth("Authentication required".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_shape() {
        let response = error_to_response(&Error::TenantResourceNotFound("model 1".into())).unwrap();
        assert_eq!(response.status(), 404);

        let body: serde_json::Value = serde_json::from_slice(response.body().as_ref()).unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "Resource not found: model 1");
    }

    #[test]
    fn test_internal_error_is_opaque() {
        let response = error_to_response(&Error::Config("DATABASE_HOST unset".into())).unwrap();
        assert_eq!(response.status(), 500);

        let body: serde_json::Value = serde_json::from_slice(response.body().as_ref()).unwrap();
        assert_eq!(body["error"], "Internal server error");
    }

    #[test]
    fn test_request_without_identity_is_rejected() {
        let event = Request::new(Body::Empty);
        let err = tenant_context(&event, Some(b"secret")).unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
    }

    #[test]
    fn test_parse_json_body() {
        let value: serde_json::Value = parse_json_body(&Body::from(r#"{"title":"x"}"#)).unwrap();
        assert_eq!(value["title"], "x");

        let err = parse_json_body::<serde_json::Value>(&Body::from("{not json")).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn test_route_path_strips_stage() {
        let mut event = Request::new(Body::Empty);
        *event.uri_mut() = "/api/v1/models/".parse().unwrap();
        assert_eq!(route_path(&event), "/v1/models");
    }
}
