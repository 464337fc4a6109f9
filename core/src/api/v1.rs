//! Version 1 of the HTTP API.
//!
//! Handlers are intentionally thin wrappers that validate input, hand work
//! to the dispatcher (or a blocking section for SQLite access) and map the
//! error catalogue onto status codes. Raw internal errors never reach the
//! response body.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::spawn_blocking;

use crate::dispatcher::Dispatcher;
use crate::errors::DispatchError;
use crate::logging::log_event;
use crate::memory::Turn;
use crate::providers::registry;
use crate::store::DbPool;

/// Shared state injected into each handler.
#[derive(Clone)]
pub struct ApiState {
    pub dispatcher: Arc<Dispatcher>,
    pub pool: DbPool,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub user_id: String,
    pub message: String,
    /// Model name or profile key; empty means the configured default.
    #[serde(default)]
    pub model: String,
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub reply: String,
    pub provider: String,
    pub model: String,
    pub elapsed_ms: u64,
    pub history_length: usize,
    pub memory_snapshot: Vec<Turn>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setup_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApiKeyRequest {
    pub user_id: String,
    pub provider: String,
    pub api_key: String,
}

#[derive(Debug, Serialize)]
pub struct AckResponse {
    pub ok: bool,
    pub provider: String,
    pub configured: bool,
}

#[derive(Debug, Deserialize)]
pub struct ProvidersQuery {
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ProviderEntry {
    pub id: String,
    pub display_name: String,
    pub kind: String,
    pub requires_api_key: bool,
    pub has_credentials: bool,
    pub setup_url: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/chat", post(chat))
        .route("/api/settings/key", post(save_key))
        .route("/api/providers", get(providers))
        .with_state(state)
}

async fn chat(
    State(state): State<ApiState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    if req.message.trim().is_empty() {
        return Err(bad_request("message must not be empty"));
    }

    let outcome = state
        .dispatcher
        .dispatch(
            &req.user_id,
            &req.message,
            &req.model,
            req.session_id.as_deref(),
        )
        .await
        .map_err(error_response)?;

    let snapshot = {
        let memory = state.dispatcher.memory().clone();
        let user = req.user_id.clone();
        let session = req.session_id.clone();
        spawn_blocking(move || memory.tail(&user, session.as_deref(), 3))
            .await
            .ok()
            .and_then(Result::ok)
            .unwrap_or_default()
    };

    Ok(Json(ChatResponse {
        reply: outcome.reply,
        provider: outcome.provider_id,
        model: outcome.model,
        elapsed_ms: outcome.elapsed_ms,
        history_length: outcome.history_length,
        memory_snapshot: snapshot,
    }))
}

/// Write-only by design: keys can be saved or cleared, never read back.
async fn save_key(
    State(state): State<ApiState>,
    Json(req): Json<ApiKeyRequest>,
) -> Result<Json<AckResponse>, ApiError> {
    let configured = !req.api_key.trim().is_empty();
    let pool = state.pool.clone();
    let credentials = state.dispatcher.credentials().clone();
    let ApiKeyRequest {
        user_id,
        provider,
        api_key,
    } = req;
    let provider_id = provider.clone();

    spawn_blocking(move || -> Result<(), ApiError> {
        let conn = pool
            .get()
            .map_err(|_| internal_error())?;
        registry::get_provider(&conn, &provider)
            .map_err(|_| not_found(format!("unknown provider: {provider}")))?;
        credentials
            .set(&user_id, &provider, &api_key)
            .map_err(|_| internal_error())?;
        let _ = log_event(
            &conn,
            "info",
            Some("CRED-0100"),
            "ai.credentials",
            "API credential updated",
            Some("Key material is never logged"),
            Some(json!({ "user": user_id, "provider": provider, "configured": !api_key.trim().is_empty() })),
        );
        Ok(())
    })
    .await
    .map_err(|_| internal_error())??;

    Ok(Json(AckResponse {
        ok: true,
        provider: provider_id,
        configured,
    }))
}

async fn providers(
    State(state): State<ApiState>,
    Query(query): Query<ProvidersQuery>,
) -> Result<Json<Vec<ProviderEntry>>, ApiError> {
    let pool = state.pool.clone();
    let credentials = state.dispatcher.credentials().clone();

    let entries = spawn_blocking(move || -> Result<Vec<ProviderEntry>, ApiError> {
        let conn = pool.get().map_err(|_| internal_error())?;
        let providers = registry::list_providers(&conn).map_err(|_| internal_error())?;
        let configured = match &query.user_id {
            Some(user_id) => credentials
                .configured(user_id)
                .map_err(|_| internal_error())?,
            None => Default::default(),
        };
        Ok(providers
            .into_iter()
            .map(|p| ProviderEntry {
                has_credentials: configured.contains(&p.id),
                id: p.id,
                display_name: p.display_name,
                kind: p.kind,
                requires_api_key: p.requires_api_key,
                setup_url: p.setup_url,
            })
            .collect())
    })
    .await
    .map_err(|_| internal_error())??;

    Ok(Json(entries))
}

async fn health(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let pool = state.pool.clone();
    let providers = spawn_blocking(move || {
        pool.get()
            .ok()
            .and_then(|conn| registry::list_providers(&conn).ok())
            .map(|list| list.into_iter().map(|p| p.id).collect::<Vec<_>>())
    })
    .await
    .ok()
    .flatten()
    .unwrap_or_default();

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "providers": providers,
    }))
}

fn error_response(err: DispatchError) -> ApiError {
    let status = match err.kind() {
        "MISSING_CREDENTIAL" => StatusCode::UNPROCESSABLE_ENTITY,
        "TIMEOUT" => StatusCode::GATEWAY_TIMEOUT,
        "BACKEND_ERROR" => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorBody {
            error: err.explain(),
            setup_url: err.setup_hint().map(str::to_string),
        }),
    )
}

fn bad_request(message: &str) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody {
            error: message.to_string(),
            setup_url: None,
        }),
    )
}

fn not_found(message: String) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody {
            error: message,
            setup_url: None,
        }),
    )
}

fn internal_error() -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            error: "The dispatch layer could not access its local store.".to_string(),
            setup_url: None,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{BackendError, BackendFault};

    #[test]
    fn dispatch_errors_map_to_distinct_status_codes() {
        let missing = DispatchError::MissingCredential {
            provider: "openai".into(),
            setup_url: "https://platform.openai.com/".into(),
        };
        let (status, body) = error_response(missing);
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body.0.setup_url.as_deref(), Some("https://platform.openai.com/"));

        let timeout = DispatchError::Backend(BackendError::new(
            "ollama",
            BackendFault::Timeout,
            "deadline expired",
        ));
        assert_eq!(error_response(timeout).0, StatusCode::GATEWAY_TIMEOUT);

        let backend = DispatchError::Backend(BackendError::new(
            "deepseek",
            BackendFault::Status(500),
            "upstream answered 500",
        ));
        assert_eq!(error_response(backend).0, StatusCode::BAD_GATEWAY);

        let storage = DispatchError::Storage("disk on fire".into());
        assert_eq!(error_response(storage).0, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn error_bodies_never_leak_internal_detail() {
        let storage = DispatchError::Storage("/var/lib/secret-path: io error".into());
        let (_, body) = error_response(storage);
        assert!(!body.0.error.contains("/var/lib"));
    }
}
