//! Stream router: one uniform streaming call over every protocol adapter.

use std::time::Duration;
use tracing::{info, Span};

use crate::adapters::{ChatTurn, EventStream, NativeStreamAdapter, ProtocolAdapter, SseAdapter, WebhookAdapter};
use crate::cancel::CancelToken;
use crate::config::Config;
use crate::models::ModelConfig;
use crate::{Error, Result};

/// Dispatches a chat turn to the adapter for the model's protocol kind.
///
/// Holds no per-request state; one router serves every invocation of a
/// warm Lambda container.
pub struct StreamRouter {
    webhook: WebhookAdapter,
    sse: SseAdapter,
    native: NativeStreamAdapter,
    span: Span,
}

impl StreamRouter {
    pub fn new(client: reqwest::Client, simulated_chunk_delay: Duration) -> Self {
        Self {
            webhook: WebhookAdapter::new(client.clone(), simulated_chunk_delay),
            sse: SseAdapter::new(client.clone()),
            native: NativeStreamAdapter::new(client),
            span: tracing::info_span!("stream_router"),
        }
    }

    /// Build a router with an HTTP client configured from the environment.
    pub fn from_config(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(config.upstream_timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self::new(client, config.simulated_chunk_delay))
    }

    /// Look up an adapter by protocol kind. Unknown kinds are rejected.
    pub fn adapter_for_kind(&self, kind: &str) -> Result<&dyn ProtocolAdapter> {
        match kind {
            "webhook" => Ok(&self.webhook),
            "sse" => Ok(&self.sse),
            "native-stream" => Ok(&self.native),
            other => Err(Error::Validation(format!("Unknown protocol kind: {}", other))),
        }
    }

    /// Validate the configuration and start streaming. Nothing touches the
    /// network unless validation passes.
    pub fn route(&self, config: &ModelConfig, turn: &ChatTurn, cancel: CancelToken) -> Result<EventStream> {
        config.validate()?;
        let adapter = self.adapter_for_kind(config.protocol.kind())?;

        info!(
            parent: &self.span,
            model_id = %config.id,
            protocol = config.protocol.kind(),
            messages = turn.messages.len(),
            "Routing chat turn"
        );

        Ok(adapter.stream(config, turn, cancel))
    }
}
