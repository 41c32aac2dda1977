//! Shared library for the chat gateway Lambda functions.
//!
//! Normalizes heterogeneous AI endpoints (webhook, SSE, native stream) into one
//! event stream, records assistant replies through a persistence tee, and
//! confines every data access to the caller's organization.

pub mod adapters;
pub mod auth;
pub mod cancel;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod http;
pub mod models;
pub mod router;
pub mod secrets;
pub mod state;
pub mod tee;
pub mod template;
pub mod tenant;

pub use adapters::{ChatTurn, EventStream, ProtocolAdapter};
pub use auth::{context_from_claims, context_from_token};
pub use cancel::CancelToken;
pub use config::Config;
pub use error::{Error, Result};
pub use events::{FinishReason, StreamEvent, Usage};
pub use http::{error_response, error_to_response, json_response, parse_json_body, ApiResponse};
pub use models::{ChatMessage, ChatRequest, Conversation, Group, Message, ModelConfig, TenantContext};
pub use router::StreamRouter;
pub use secrets::{get_database_credentials, get_secret, resolve_header_secrets, DatabaseCredentials};
pub use state::GatewayState;
pub use tee::{MessageSink, PersistenceTee};
pub use tenant::{MemoryStore, PgStore, TenantMediator, TenantStore};
