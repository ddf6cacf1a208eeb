use anyhow::{Context, Result};
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Request, Url};

use crate::interceptor::AuthInterceptor;
use crate::models::{ChatRequest, ChatResponse};
use crate::telemetry;

/** \brief Base address of the hosted API. */
pub const DEFAULT_API_BASE: &str = "https://api.openai.com/";

/** \brief Endpoint path, relative to the API base. */
pub const CHAT_COMPLETIONS_PATH: &str = "v1/chat/completions";

const JSON_UTF8: &str = "application/json; charset=utf-8";

/**
 * \brief Why a send produced no reply.
 */
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Failure {
    /** \brief The server answered with a non-success status. */
    #[error("response error: HTTP {0}")]
    Status(u16),
    /** \brief No response was received (connect, timeout, TLS, ...). */
    #[error("{0}")]
    Transport(String),
}

/**
 * \brief Result of one send. Exactly one variant is produced per call.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Success { text: String },
    EmptyResponse,
    Failure(Failure),
}

/**
 * \brief Single-turn client for `v1/chat/completions`.
 * \details Every request passes through the auth interceptor. No retry, no timeout beyond
 *          the transport defaults, no cancellation.
 */
#[derive(Clone)]
pub struct ChatClient {
    http: Client,
    endpoint: Url,
    interceptor: AuthInterceptor,
}

impl ChatClient {
    /**
     * \brief Build a client for `api_base` (e.g. `https://api.openai.com/`).
     */
    pub fn new(api_base: &str, interceptor: AuthInterceptor) -> Result<Self> {
        let endpoint = endpoint_for(api_base)?;
        let http = Client::builder().build()?;
        Ok(Self {
            http,
            endpoint,
            interceptor,
        })
    }

    /**
     * \brief Build the authenticated POST for `user_text` without sending it.
     */
    pub fn build_request(&self, user_text: &str) -> Result<Request> {
        let body = serde_json::to_vec(&ChatRequest::single_turn(user_text))?;
        let request = self
            .http
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, HeaderValue::from_static(JSON_UTF8))
            .body(body)
            .build()?;
        Ok(self.interceptor.intercept(request))
    }

    /**
     * \brief Send `user_text` as the only user message and classify the completion.
     */
    pub async fn send(&self, user_text: &str) -> SendOutcome {
        tracing::debug!(prompt_len = user_text.len(), "sending chat request");
        telemetry::log_event("chat.send", &format!("prompt_len={}", user_text.len()));

        let outcome = match self.build_request(user_text) {
            Ok(request) => self.execute(request).await,
            Err(err) => SendOutcome::Failure(Failure::Transport(format!("{:#}", err))),
        };

        match &outcome {
            SendOutcome::Success { text } => {
                telemetry::log_event("chat.send", &format!("reply_len={}", text.len()));
            }
            SendOutcome::EmptyResponse => {
                tracing::debug!("response body is empty");
                telemetry::log_error("chat.send", "empty response");
            }
            SendOutcome::Failure(Failure::Status(code)) => {
                tracing::error!("response error code: {}", code);
                telemetry::log_error("chat.send", &format!("status={}", code));
            }
            SendOutcome::Failure(Failure::Transport(msg)) => {
                tracing::error!("call failed with error: {}", msg);
                telemetry::log_error("chat.send", &format!("transport={}", msg));
            }
        }
        outcome
    }

    async fn execute(&self, request: Request) -> SendOutcome {
        let resp = match self.http.execute(request).await {
            Ok(resp) => resp,
            Err(err) => return SendOutcome::Failure(Failure::Transport(err.to_string())),
        };

        let status = resp.status();
        if !status.is_success() {
            return SendOutcome::Failure(Failure::Status(status.as_u16()));
        }

        match resp.bytes().await {
            Ok(body) => classify_body(&body),
            Err(err) => SendOutcome::Failure(Failure::Transport(err.to_string())),
        }
    }
}

/**
 * \brief Map a successful response body to an outcome.
 * \details Absent, malformed, choice-less or assistant-less bodies are all `EmptyResponse`.
 */
pub fn classify_body(body: &[u8]) -> SendOutcome {
    if body.iter().all(|b| b.is_ascii_whitespace()) {
        return SendOutcome::EmptyResponse;
    }
    let parsed: ChatResponse = match serde_json::from_slice(body) {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::warn!("unreadable response body: {}", err);
            return SendOutcome::EmptyResponse;
        }
    };
    match parsed.first_assistant_content() {
        Some(text) => SendOutcome::Success {
            text: text.to_string(),
        },
        None => SendOutcome::EmptyResponse,
    }
}

fn endpoint_for(api_base: &str) -> Result<Url> {
    let base = format!("{}/", api_base.trim_end_matches('/'));
    let base = Url::parse(&base).with_context(|| format!("invalid api base: {}", api_base))?;
    base.join(CHAT_COMPLETIONS_PATH)
        .with_context(|| format!("invalid api base: {}", api_base))
}
