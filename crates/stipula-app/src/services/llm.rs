//! Structured clause extraction against an OpenAI-compatible chat endpoint.
//!
//! The engine is generic over a [`ChatCompletions`] transport so retry and
//! classification logic is exercised in tests without a network. One attempt
//! means one request; transient failures are retried with the shared backoff
//! up to a configured ceiling, terminal failures abort after the first
//! attempt, and response-shape errors are never retried here at all.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bon::Builder;
use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::num::NonZeroU32;
use thiserror::Error;

use crate::config::LlmConfig;
use crate::pipeline::{ClauseExtraction, ExtractionValidationError, build_prompt};
use crate::services::retry::backoff_duration;

pub type GenericRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

const SCHEMA_NAME: &str = "clause_extraction";

/// Classified outcome of a single API attempt.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("malformed request: {0}")]
    BadRequest(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("upstream server error (status {status}): {message}")]
    Upstream { status: u16, message: String },
    #[error("malformed provider response: {0}")]
    Protocol(String),
}

impl ApiError {
    /// Transient failures are worth another attempt; everything else fails
    /// the call immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ApiError::RateLimited(_)
                | ApiError::Connection(_)
                | ApiError::Timeout(_)
                | ApiError::Upstream { .. }
        )
    }
}

/// Errors surfaced by the extraction client.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("missing OPENAI_API_KEY environment variable")]
    MissingApiKey,
    #[error("empty text provided")]
    EmptyInput,
    #[error("non-retryable API error: {0}")]
    NonRetryable(#[source] ApiError),
    #[error("API error after {attempts} retries: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: ApiError,
    },
    #[error("empty response from model")]
    EmptyResponse,
    #[error("invalid JSON response: {0}")]
    InvalidJson(String),
    #[error(transparent)]
    Validation(#[from] ExtractionValidationError),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

/// Chat-completion wire types (OpenAI-compatible subset).
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub temperature: f64,
    pub messages: Vec<ChatMessage>,
    pub response_format: ResponseFormat,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseFormat {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub json_schema: JsonSchemaFormat,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonSchemaFormat {
    pub name: &'static str,
    pub strict: bool,
    pub schema: JsonValue,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub choices: Vec<ChatChoice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatChoice {
    pub message: ChatResponseMessage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponseMessage {
    #[serde(default)]
    pub content: Option<String>,
}

/// One request/response against the structured-output model.
#[async_trait]
pub trait ChatCompletions: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, ApiError>;
}

/// Extracts contract clauses from plain text.
#[async_trait]
pub trait ClauseExtractor: Send + Sync {
    async fn extract(&self, text: &str) -> Result<ClauseExtraction, ExtractError>;
}

/// Retry/validation engine wrapping a transport.
#[derive(Clone, Builder)]
pub struct ClauseExtractionEngine<T> {
    transport: T,
    #[builder(into)]
    model: String,
    #[builder(default = 0.1)]
    temperature: f64,
    #[builder(default = 200_000)]
    max_chars: usize,
    #[builder(default = 3)]
    max_attempts: u32,
    #[builder(default = 1_000)]
    base_delay_ms: i64,
    #[builder(default = 60_000)]
    max_delay_ms: i64,
    limiter: Option<Arc<GenericRateLimiter>>,
}

#[async_trait]
impl<T> ClauseExtractor for ClauseExtractionEngine<T>
where
    T: ChatCompletions,
{
    async fn extract(&self, text: &str) -> Result<ClauseExtraction, ExtractError> {
        debug_assert!(self.max_attempts > 0);

        if text.trim().is_empty() {
            return Err(ExtractError::EmptyInput);
        }

        let truncated = truncate_text(text, self.max_chars);
        let prompt = build_prompt(truncated);

        let request = ChatRequest {
            model: self.model.clone(),
            temperature: self.temperature,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: prompt.system_message,
                },
                ChatMessage {
                    role: "user",
                    content: prompt.user_message,
                },
            ],
            response_format: ResponseFormat {
                kind: "json_schema",
                json_schema: JsonSchemaFormat {
                    name: SCHEMA_NAME,
                    strict: true,
                    schema: prompt.schema,
                },
            },
        };

        let mut attempt: u32 = 0;
        loop {
            if let Some(limiter) = &self.limiter {
                limiter.until_ready().await;
            }

            match self.transport.complete(&request).await {
                Ok(response) => return parse_response(response),
                Err(err) if err.is_transient() => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        return Err(ExtractError::RetriesExhausted {
                            attempts: self.max_attempts,
                            source: err,
                        });
                    }
                    let delay =
                        backoff_duration(attempt - 1, self.base_delay_ms, self.max_delay_ms);
                    tracing::warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient extraction failure; backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err @ (ApiError::Auth(_) | ApiError::BadRequest(_))) => {
                    return Err(ExtractError::NonRetryable(err));
                }
                Err(err) => return Err(ExtractError::Unexpected(err.to_string())),
            }
        }
    }
}

fn parse_response(response: ChatResponse) -> Result<ClauseExtraction, ExtractError> {
    let content = response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content);

    let Some(content) = content else {
        return Err(ExtractError::EmptyResponse);
    };
    if content.trim().is_empty() {
        return Err(ExtractError::EmptyResponse);
    }

    let payload: ClauseExtraction = serde_json::from_str(content.trim())
        .map_err(|err| ExtractError::InvalidJson(err.to_string()))?;
    payload.validate()?;
    Ok(payload)
}

/// Truncate to `max_chars` characters, preferring a sentence boundary when
/// one falls within the last 20% of the window so the model never sees a
/// mid-sentence cut.
pub fn truncate_text(text: &str, max_chars: usize) -> &str {
    let Some((hard_cut, _)) = text.char_indices().nth(max_chars) else {
        return text;
    };
    let window = &text[..hard_cut];

    let boundary = window
        .char_indices()
        .filter(|(_, ch)| matches!(ch, '.' | '!' | '?'))
        .map(|(idx, ch)| (idx + ch.len_utf8(), window[..idx].chars().count() + 1))
        .next_back();

    if let Some((byte_end, char_count)) = boundary
        && char_count * 5 > max_chars * 4
    {
        return &text[..byte_end];
    }

    window
}

/// HTTP transport speaking the OpenAI-compatible REST protocol.
#[derive(Clone)]
pub struct HttpChatCompletions {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpChatCompletions {
    /// Build a transport from `OPENAI_API_KEY` and the configured endpoint.
    pub fn from_env(base_url: impl Into<String>, timeout_s: u64) -> Result<Self, ExtractError> {
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| ExtractError::MissingApiKey)?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_s))
            .build()
            .map_err(|err| ExtractError::Unexpected(err.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl ChatCompletions for HttpChatCompletions {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, ApiError> {
        let url = format!("{}/chat/completions", self.base_url);

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = extract_api_message(&body).unwrap_or(body);
            return Err(classify_status(status.as_u16(), message));
        }

        response
            .json::<ChatResponse>()
            .await
            .map_err(|err| ApiError::Protocol(err.to_string()))
    }
}

fn classify_transport_error(err: reqwest::Error) -> ApiError {
    if err.is_timeout() {
        ApiError::Timeout(err.to_string())
    } else {
        ApiError::Connection(err.to_string())
    }
}

fn classify_status(status: u16, message: String) -> ApiError {
    match status {
        401 | 403 => ApiError::Auth(message),
        429 => ApiError::RateLimited(message),
        408 => ApiError::Timeout(message),
        500..=599 => ApiError::Upstream { status, message },
        _ => ApiError::BadRequest(message),
    }
}

/// Pull `error.message` out of a provider error body, if present.
fn extract_api_message(body: &str) -> Option<String> {
    let value: JsonValue = serde_json::from_str(body).ok()?;
    value
        .get("error")?
        .get("message")?
        .as_str()
        .map(str::to_owned)
}

/// Assemble the production extractor from configuration.
pub fn build_extractor(
    config: &LlmConfig,
) -> Result<ClauseExtractionEngine<HttpChatCompletions>, ExtractError> {
    let transport = HttpChatCompletions::from_env(config.base_url.clone(), config.timeout_s)?;
    let quota = Quota::per_second(NonZeroU32::new(4).expect("quota must be non-zero"));
    let limiter = Arc::new(RateLimiter::direct(quota));

    Ok(ClauseExtractionEngine::builder()
        .transport(transport)
        .model(config.model.clone())
        .temperature(config.temperature)
        .max_chars(config.max_chars)
        .max_attempts(config.max_attempts)
        .base_delay_ms(config.base_delay_ms)
        .max_delay_ms(config.max_delay_ms)
        .limiter(limiter)
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::result::sample_extraction;
    use proptest::prelude::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Transport that replays a script of outcomes and records every request.
    /// Clones share state so the test keeps a handle after the engine takes
    /// its copy.
    #[derive(Clone)]
    struct ScriptedTransport {
        script: Arc<Mutex<VecDeque<Result<ChatResponse, ApiError>>>>,
        requests: Arc<Mutex<Vec<ChatRequest>>>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<ChatResponse, ApiError>>) -> Self {
            Self {
                script: Arc::new(Mutex::new(script.into())),
                requests: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn call_count(&self) -> usize {
            self.requests.lock().expect("request log poisoned").len()
        }
    }

    #[async_trait]
    impl ChatCompletions for ScriptedTransport {
        async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, ApiError> {
            self.requests
                .lock()
                .expect("request log poisoned")
                .push(request.clone());
            self.script
                .lock()
                .expect("script poisoned")
                .pop_front()
                .expect("script exhausted")
        }
    }

    fn response_with(content: impl Into<String>) -> ChatResponse {
        ChatResponse {
            choices: vec![ChatChoice {
                message: ChatResponseMessage {
                    content: Some(content.into()),
                },
            }],
        }
    }

    fn valid_response() -> ChatResponse {
        let payload = serde_json::to_string(&sample_extraction()).expect("serialize sample");
        response_with(payload)
    }

    fn engine_over(transport: &ScriptedTransport) -> ClauseExtractionEngine<ScriptedTransport> {
        ClauseExtractionEngine::builder()
            .transport(transport.clone())
            .model("test-model")
            .max_attempts(3)
            .base_delay_ms(1)
            .max_delay_ms(2)
            .build()
    }

    #[tokio::test]
    async fn empty_input_fails_without_any_request() {
        let transport = ScriptedTransport::new(vec![]);
        let engine = engine_over(&transport);

        let err = engine.extract("   \n\t ").await.expect_err("must fail");
        assert!(matches!(err, ExtractError::EmptyInput));
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn rate_limits_then_success_uses_exactly_n_attempts() {
        let transport = ScriptedTransport::new(vec![
            Err(ApiError::RateLimited("429".to_string())),
            Err(ApiError::RateLimited("429".to_string())),
            Ok(valid_response()),
        ]);
        let engine = engine_over(&transport);

        let extraction = engine
            .extract("The parties agree as follows.")
            .await
            .expect("third attempt succeeds");
        assert!((0.0..=1.0).contains(&extraction.confidence));
        assert_eq!(transport.call_count(), 3);
    }

    #[tokio::test]
    async fn auth_failure_makes_exactly_one_attempt() {
        let transport =
            ScriptedTransport::new(vec![Err(ApiError::Auth("invalid api key".to_string()))]);
        let engine = engine_over(&transport);

        let err = engine
            .extract("The parties agree as follows.")
            .await
            .expect_err("auth errors are terminal");
        assert!(matches!(err, ExtractError::NonRetryable(ApiError::Auth(_))));
        assert!(err.to_string().contains("non-retryable API error"));
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn exhausting_transient_retries_reports_attempt_count() {
        let transport = ScriptedTransport::new(vec![
            Err(ApiError::Upstream {
                status: 503,
                message: "overloaded".to_string(),
            }),
            Err(ApiError::Connection("reset by peer".to_string())),
            Err(ApiError::Timeout("deadline exceeded".to_string())),
        ]);
        let engine = engine_over(&transport);

        let err = engine
            .extract("The parties agree as follows.")
            .await
            .expect_err("retries must exhaust");
        assert!(matches!(
            err,
            ExtractError::RetriesExhausted { attempts: 3, .. }
        ));
        assert!(err.to_string().contains("API error after 3 retries"));
        assert_eq!(transport.call_count(), 3);
    }

    #[tokio::test]
    async fn empty_response_body_is_terminal() {
        let transport = ScriptedTransport::new(vec![Ok(response_with("   "))]);
        let engine = engine_over(&transport);

        let err = engine
            .extract("Some contract text.")
            .await
            .expect_err("blank content must fail");
        assert!(matches!(err, ExtractError::EmptyResponse));
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn unparseable_response_is_terminal() {
        let transport = ScriptedTransport::new(vec![Ok(response_with("not json at all"))]);
        let engine = engine_over(&transport);

        let err = engine
            .extract("Some contract text.")
            .await
            .expect_err("bad json must fail");
        assert!(matches!(err, ExtractError::InvalidJson(_)));
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn out_of_range_confidence_fails_validation() {
        let mut payload = sample_extraction();
        payload.confidence = 2.5;
        let body = serde_json::to_string(&payload).expect("serialize");
        let transport = ScriptedTransport::new(vec![Ok(response_with(body))]);
        let engine = engine_over(&transport);

        let err = engine
            .extract("Some contract text.")
            .await
            .expect_err("invalid confidence must fail");
        assert!(matches!(err, ExtractError::Validation(_)));
    }

    #[tokio::test]
    async fn request_carries_schema_and_truncated_text() {
        let transport = ScriptedTransport::new(vec![Ok(valid_response())]);
        let long_text = "An agreement. ".repeat(200);
        let engine = ClauseExtractionEngine::builder()
            .transport(transport.clone())
            .model("test-model")
            .max_chars(100)
            .max_attempts(1)
            .base_delay_ms(1)
            .max_delay_ms(2)
            .build();

        engine.extract(&long_text).await.expect("succeeds");

        let requests = transport.requests.lock().expect("request log poisoned");
        let request = &requests[0];
        assert_eq!(request.response_format.kind, "json_schema");
        assert!(request.response_format.json_schema.strict);
        let user = &request.messages[1].content;
        // Only the truncated window may appear in the user payload.
        assert!(user.chars().count() < long_text.chars().count());
    }

    #[test]
    fn truncation_keeps_short_text_untouched() {
        assert_eq!(truncate_text("short", 100), "short");
    }

    #[test]
    fn truncation_prefers_sentence_boundary_in_last_fifth() {
        // Boundary at char 90 of a 100-char window: inside the last 20%.
        let text = format!("{}{}", "a".repeat(89), ". tail that will be cut off entirely");
        let cut = truncate_text(&text, 100);
        assert!(cut.ends_with('.'));
        assert_eq!(cut.chars().count(), 90);
    }

    #[test]
    fn truncation_hard_cuts_without_late_boundary() {
        // Sole boundary at char 10 of 100: outside the last 20%, so ignore it.
        let text = format!("{}. {}", "b".repeat(9), "c".repeat(200));
        let cut = truncate_text(&text, 100);
        assert_eq!(cut.chars().count(), 100);
        assert!(!cut.ends_with('.'));
    }

    proptest! {
        #[test]
        fn truncation_never_exceeds_limit(text in ".{0,300}", max_chars in 1usize..200) {
            let cut = truncate_text(&text, max_chars);
            prop_assert!(cut.chars().count() <= max_chars);
            prop_assert!(text.starts_with(cut));
        }
    }
}
