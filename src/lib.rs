use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use axum::body::Bytes;
use axum::extract::rejection::{BytesRejection, FailedToBufferBody};
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::cors::CorsLayer;

pub mod auth;
pub mod rate_limit;
pub mod relay;
pub mod types;

use auth::ApiKeys;
use rate_limit::{LimiterRegistry, RateLimitConfig};
use relay::UpstreamResponse;
use types::ChatRequest;

#[derive(Clone)]
pub struct AppState {
    config: AppConfig,
    http_client: Client,
    limiters: LimiterRegistry,
    api_keys: Option<Arc<ApiKeys>>,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub max_request_bytes: usize,
    pub upstream_base_url: String,
    pub upstream_api_key: Option<String>,
    pub upstream_connect_timeout: Duration,
    pub rate_limit: RateLimitConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            max_request_bytes: 1_048_576,
            upstream_base_url: "https://api.groq.com/openai".to_string(),
            upstream_api_key: None,
            upstream_connect_timeout: Duration::from_millis(10_000),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl AppState {
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        let limiters = LimiterRegistry::new(config.rate_limit.clone())
            .context("invalid rate limit configuration")?;
        let http_client = Client::builder()
            .connect_timeout(config.upstream_connect_timeout)
            .build()
            .context("failed to build upstream HTTP client")?;
        Ok(Self {
            config,
            http_client,
            limiters,
            api_keys: None,
        })
    }

    /// Requires callers to present one of `keys`.
    pub fn with_api_keys(mut self, keys: ApiKeys) -> Self {
        self.api_keys = Some(Arc::new(keys));
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn limiters(&self) -> &LimiterRegistry {
        &self.limiters
    }
}

pub fn app(state: AppState) -> Router {
    let max_request_bytes = state.config.max_request_bytes;

    let mut chat = Router::new()
        .route("/chat/completions", post(chat_completions))
        .route("/v1/chat/completions", post(chat_completions));
    if let Some(keys) = state.api_keys.clone() {
        chat = chat.route_layer(middleware::from_fn_with_state(keys, auth::require_api_key));
    }
    // Added last so it runs first: quota is charged before authentication.
    let chat = chat.route_layer(middleware::from_fn_with_state(
        state.limiters.clone(),
        rate_limit::rate_limit,
    ));

    Router::new()
        .route("/healthz", get(healthz))
        .merge(chat)
        .layer(DefaultBodyLimit::max(max_request_bytes))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

fn upstream_chat_completions_url(config: &AppConfig) -> String {
    format!(
        "{}/v1/chat/completions",
        config.upstream_base_url.trim_end_matches('/')
    )
}

async fn chat_completions(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let body = match body {
        Ok(body) => body,
        Err(BytesRejection::FailedToBufferBody(FailedToBufferBody::LengthLimitError(_))) => {
            return openai_error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                "invalid_request_error",
                "request body too large",
                None,
                Some(Value::from("request_too_large")),
            );
        }
        Err(_) => {
            return openai_error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "Invalid request body",
                None,
                None,
            );
        }
    };

    let Some(upstream_api_key) = state.config.upstream_api_key.as_deref() else {
        return openai_error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "GROQ_API_KEY not set",
            None,
            None,
        );
    };

    let mut request: ChatRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            tracing::debug!(error = %err, "rejected chat request body");
            return openai_error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "Invalid request body",
                None,
                None,
            );
        }
    };
    request.apply_defaults();

    let payload = match serde_json::to_vec(&request) {
        Ok(bytes) => bytes,
        Err(_) => {
            return openai_error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "Failed to marshal request",
                None,
                None,
            );
        }
    };

    let upstream = match state
        .http_client
        .post(upstream_chat_completions_url(&state.config))
        .bearer_auth(upstream_api_key)
        .header(header::CONTENT_TYPE, "application/json")
        .body(payload)
        .send()
        .await
    {
        Ok(resp) => resp,
        Err(err) => {
            tracing::warn!(error = %err, model = %request.model, "upstream request failed");
            return openai_error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "api_error",
                "Failed to make request to Groq API",
                None,
                None,
            );
        }
    };

    tracing::info!(
        model = %request.model,
        stream = request.stream,
        upstream_status = upstream.status().as_u16(),
        "relaying upstream response"
    );

    relay::relay(UpstreamResponse::from_reqwest(upstream), request.stream).await
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OpenAiErrorResponse {
    pub error: OpenAiError,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OpenAiError {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<Value>,
}

pub fn openai_error_response(
    status: StatusCode,
    error_type: &str,
    message: &str,
    param: Option<&str>,
    code: Option<Value>,
) -> Response {
    let body = OpenAiErrorResponse {
        error: OpenAiError {
            message: message.to_string(),
            error_type: error_type.to_string(),
            param: param.map(ToString::to_string),
            code,
        },
    };
    (status, Json(body)).into_response()
}
