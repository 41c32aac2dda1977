//! Adapter for synchronous JSON endpoints.
//!
//! The whole response is read, the reply text is pulled out with the model's
//! `responsePath`, and it is emitted as a single `text-delta` or, when
//! `simulateStream` is set, as word-sized chunks with a short delay between
//! them.

use serde_json::Value;
use std::time::Duration;
use tracing::{info, warn, Span};

use super::{
    build_request, failed, normalize, part_id, send, template_vars, ChatTurn, EventStream,
    ProtocolAdapter, Signal, UpstreamStream,
};
use crate::cancel::CancelToken;
use crate::events::{FinishReason, StreamEvent, Usage};
use crate::models::{ModelConfig, Protocol, WebhookOptions};
use crate::template::get_by_path;
use crate::Error;

pub struct WebhookAdapter {
    client: reqwest::Client,
    default_delay: Duration,
    span: Span,
}

impl WebhookAdapter {
    pub fn new(client: reqwest::Client, default_delay: Duration) -> Self {
        Self {
            client,
            default_delay,
            span: tracing::info_span!("webhook_adapter"),
        }
    }
}

impl ProtocolAdapter for WebhookAdapter {
    fn stream(&self, config: &ModelConfig, turn: &ChatTurn, cancel: CancelToken) -> EventStream {
        let span = tracing::info_span!(parent: &self.span, "stream", model_id = %config.id);

        let options = match &config.protocol {
            Protocol::Webhook(options) => options.clone(),
            other => {
                let error = Error::Validation(format!("Webhook adapter cannot serve {} models", other.kind()));
                return normalize(failed(error), cancel, span);
            }
        };

        let vars = template_vars(config, turn);
        let request = match build_request(&self.client, &config.endpoint, &vars) {
            Ok(request) => request,
            Err(e) => return normalize(failed(e), cancel, span),
        };

        let delay = options
            .chunk_delay_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_delay);

        normalize(upstream(request, options, delay, span.clone()), cancel, span)
    }
}

fn upstream(
    request: reqwest::RequestBuilder,
    options: WebhookOptions,
    delay: Duration,
    span: Span,
) -> UpstreamStream {
    Box::pin(async_stream::try_stream! {
        let response = send(request, &span).await?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| Error::Endpoint(format!("Invalid JSON response: {}", e)))?;

        let text = extract_text(&body, &options.response_path, &span);
        let id = part_id("txt");

        if let Some(text) = text.filter(|t| !t.is_empty()) {
            if options.simulate_stream {
                let chunks = simulated_chunks(&text);
                let last = chunks.len().saturating_sub(1);
                for (index, chunk) in chunks.into_iter().enumerate() {
                    yield Signal::Event(StreamEvent::TextDelta { id: id.clone(), delta: chunk });
                    if index < last && !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            } else {
                yield Signal::Event(StreamEvent::TextDelta { id, delta: text });
            }
        }

        yield Signal::Finish {
            reason: Some(FinishReason::Stop),
            usage: body.get("usage").and_then(Usage::from_value),
        };
    })
}

/// Pull the reply out of the response body. Non-string values are sent as
/// their JSON text.
fn extract_text(body: &Value, path: &str, span: &Span) -> Option<String> {
    match get_by_path(body, path) {
        Some(Value::String(text)) => Some(text.clone()),
        Some(other) => Some(other.to_string()),
        None => {
            warn!(parent: span, response_path = %path, "Response path not found in webhook body");
            None
        }
    }
}

/// Split into word-sized chunks that concatenate back to the original text.
fn simulated_chunks(text: &str) -> Vec<String> {
    let chunks: Vec<String> = text
        .split_inclusive(char::is_whitespace)
        .map(str::to_string)
        .collect();
    info!(chunks = chunks.len(), "Simulating stream from webhook response");
    chunks
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use futures_util::StreamExt;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn webhook(url: &str, response_path: &str, simulate_stream: bool) -> ModelConfig {
        model(
            url,
            Protocol::Webhook(WebhookOptions {
                response_path: response_path.to_string(),
                simulate_stream,
                chunk_delay_ms: Some(0),
            }),
        )
    }

    fn adapter() -> WebhookAdapter {
        WebhookAdapter::new(reqwest::Client::new(), Duration::ZERO)
    }

    #[tokio::test]
    async fn test_single_text_delta() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/run"))
            .and(body_partial_json(json!({ "prompt": "hi" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "text": "hello" }],
                "usage": { "prompt_tokens": 2, "completion_tokens": 1 }
            })))
            .mount(&server)
            .await;

        let config = webhook(&format!("{}/run", server.uri()), "choices[0].text", false);
        let events: Vec<_> = adapter()
            .stream(&config, &turn("hi"), CancelToken::new())
            .collect()
            .await;

        let body = assert_framed(&events);
        assert_eq!(body.len(), 1);
        assert_eq!(text(&events), "hello");
        assert_eq!(
            events.last(),
            Some(&StreamEvent::Finish {
                finish_reason: FinishReason::Stop,
                usage: Usage { input_tokens: Some(2), output_tokens: Some(1), total_tokens: None },
            })
        );
    }

    #[tokio::test]
    async fn test_simulated_stream_concatenates_to_original() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "output": "one two  three" })))
            .mount(&server)
            .await;

        let config = webhook(&server.uri(), "output", true);
        let events: Vec<_> = adapter()
            .stream(&config, &turn("hi"), CancelToken::new())
            .collect()
            .await;

        let body = assert_framed(&events);
        assert!(body.len() > 1);
        assert_eq!(text(&events), "one two  three");
    }

    #[tokio::test]
    async fn test_missing_path_yields_no_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "other": 1 })))
            .mount(&server)
            .await;

        let config = webhook(&server.uri(), "choices[0].text", false);
        let events: Vec<_> = adapter()
            .stream(&config, &turn("hi"), CancelToken::new())
            .collect()
            .await;

        assert!(assert_framed(&events).is_empty());
        assert_eq!(finish_reason(&events), FinishReason::Stop);
    }

    #[tokio::test]
    async fn test_non_string_value_is_json_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": { "n": 1 } })))
            .mount(&server)
            .await;

        let config = webhook(&server.uri(), "result", false);
        let events: Vec<_> = adapter()
            .stream(&config, &turn("hi"), CancelToken::new())
            .collect()
            .await;

        assert_eq!(text(&events), r#"{"n":1}"#);
    }

    #[tokio::test]
    async fn test_error_status_is_in_band() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let config = webhook(&server.uri(), "text", false);
        let events: Vec<_> = adapter()
            .stream(&config, &turn("hi"), CancelToken::new())
            .collect()
            .await;

        let body = assert_framed(&events);
        assert!(matches!(&body[0], StreamEvent::Error { error } if error.contains("503")));
        assert_eq!(finish_reason(&events), FinishReason::Error);
    }

    #[tokio::test]
    async fn test_invalid_json_is_in_band_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let config = webhook(&server.uri(), "text", false);
        let events: Vec<_> = adapter()
            .stream(&config, &turn("hi"), CancelToken::new())
            .collect()
            .await;

        assert_framed(&events);
        assert_eq!(finish_reason(&events), FinishReason::Error);
    }

    #[test]
    fn test_simulated_chunks() {
        assert_eq!(simulated_chunks("a b\nc"), vec!["a ", "b\n", "c"]);
        assert!(simulated_chunks("").is_empty());
    }

    #[tokio::test]
    async fn test_cancel_during_request_finishes_with_other() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "text": "too late" }))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let cancel = CancelToken::new();
        let config = webhook(&server.uri(), "text", false);
        let stream = adapter().stream(&config, &turn("hi"), cancel.clone());

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let events: Vec<_> = tokio::time::timeout(Duration::from_secs(2), stream.collect::<Vec<_>>())
            .await
            .expect("cancellation must not wait for the endpoint");

        assert!(assert_framed(&events).is_empty());
        assert_eq!(finish_reason(&events), FinishReason::Other);
    }

    #[tokio::test]
    async fn test_cancel_between_simulated_chunks() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "text": "one two three" })))
            .mount(&server)
            .await;

        let cancel = CancelToken::new();
        let config = model(
            &server.uri(),
            Protocol::Webhook(WebhookOptions {
                response_path: "text".to_string(),
                simulate_stream: true,
                chunk_delay_ms: Some(5_000),
            }),
        );
        let mut stream = adapter().stream(&config, &turn("hi"), cancel.clone());

        let mut seen = vec![stream.next().await.expect("stream-start")];
        seen.push(stream.next().await.expect("first chunk"));
        cancel.cancel();

        let rest = tokio::time::timeout(Duration::from_secs(1), stream.collect::<Vec<_>>())
            .await
            .expect("cancellation must interrupt the chunk delay");
        seen.extend(rest);

        assert_eq!(text(&seen), "one ");
        assert_eq!(finish_reason(&seen), FinishReason::Other);
        assert_framed(&seen);
    }
}
