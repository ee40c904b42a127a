use axum::extract::{Path, Query, State};
use axum::http::{
    StatusCode,
    header::{CONTENT_TYPE, HeaderValue},
};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parley_domain::model::{ChatEnvelope, MessageEnvelope, QueueName};
use parley_domain::search::{IndexedMessage, PageMeta, SearchRequest};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use validator::Validate;

use crate::{error::ApiError, observability, state::AppState, validation};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/applications/:token/chats", post(create_chat))
        .route(
            "/applications/:token/chats/:number/messages",
            post(create_message),
        )
        .route(
            "/applications/:token/chats/:number/messages/search",
            get(search_messages),
        )
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn metrics() -> Response {
    let Some(body) = observability::render_metrics() else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    let mut response = (StatusCode::OK, body).into_response();
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
    );
    response
}

#[derive(Serialize)]
struct CreateChatResponse {
    number: i64,
    status: &'static str,
}

/// Hands the caller a reserved chat number immediately; the row itself
/// is persisted by the worker once the queued event lands.
async fn create_chat(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<(StatusCode, Json<CreateChatResponse>), ApiError> {
    if token.is_empty() {
        return Err(ApiError::Validation("app token is required".to_string()));
    }

    let number = state
        .allocator
        .next_chat_number(&token)
        .await
        .map_err(|err| {
            error!(error = %err, app_token = %token, "failed to increment chat counter");
            observability::register_chat_allocated("error");
            ApiError::Internal("failed to increment chat counter".to_string())
        })?;

    let envelope = ChatEnvelope {
        app_token: token.clone(),
        chat_number: number,
    };
    let payload = serde_json::to_value(&envelope)
        .map_err(|_| ApiError::Internal("failed to queue chat".to_string()))?;
    state
        .publisher
        .publish(QueueName::Chats, payload)
        .await
        .map_err(|err| {
            error!(error = %err, app_token = %token, "failed to queue chat for persistence");
            observability::register_chat_allocated("error");
            ApiError::Internal("failed to queue chat".to_string())
        })?;

    info!(app_token = %token, number, "chat queued");
    observability::register_chat_allocated("ok");

    Ok((
        StatusCode::CREATED,
        Json(CreateChatResponse {
            number,
            status: "processing",
        }),
    ))
}

#[derive(Debug, Deserialize, Validate)]
struct CreateMessageRequest {
    #[validate(length(min = 1, message = "content is required"))]
    content: String,
}

#[derive(Serialize)]
struct CreateMessageResponse {
    number: i64,
}

async fn create_message(
    State(state): State<AppState>,
    Path((token, chat_number)): Path<(String, String)>,
    Json(payload): Json<CreateMessageRequest>,
) -> Result<Json<CreateMessageResponse>, ApiError> {
    if token.is_empty() {
        return Err(ApiError::Validation("app token is required".to_string()));
    }
    let chat_number = parse_chat_number(&chat_number)?;
    validation::validate(&payload)?;

    let number = state
        .allocator
        .next_message_number(&token, chat_number)
        .await
        .map_err(|err| {
            error!(error = %err, app_token = %token, chat_number, "failed to increment message counter");
            observability::register_message_allocated("error");
            ApiError::Internal("failed to increment message counter".to_string())
        })?;

    let envelope = MessageEnvelope {
        app_token: token.clone(),
        chat_number,
        message_number: number,
        content: payload.content,
    };
    let queued = serde_json::to_value(&envelope)
        .map_err(|_| ApiError::Internal("failed to queue message".to_string()))?;
    state
        .publisher
        .publish(QueueName::Messages, queued)
        .await
        .map_err(|err| {
            error!(error = %err, app_token = %token, chat_number, "failed to queue message for persistence");
            observability::register_message_allocated("error");
            ApiError::Internal("failed to queue message".to_string())
        })?;

    info!(app_token = %token, chat_number, number, "message queued");
    observability::register_message_allocated("ok");

    Ok(Json(CreateMessageResponse { number }))
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    q: Option<String>,
    // Unparseable paging values fall back to the defaults.
    page: Option<String>,
    per_page: Option<String>,
}

#[derive(Serialize)]
struct SearchResponse {
    data: Vec<IndexedMessage>,
    meta: PageMeta,
}

async fn search_messages(
    State(state): State<AppState>,
    Path((token, chat_number)): Path<(String, String)>,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchResponse>, ApiError> {
    if token.is_empty() {
        return Err(ApiError::Validation("app token is required".to_string()));
    }
    let chat_number = parse_chat_number(&chat_number)?;
    let query = params
        .q
        .filter(|q| !q.is_empty())
        .ok_or_else(|| ApiError::Validation("query parameter 'q' is required".to_string()))?;

    let page = params.page.and_then(|raw| raw.parse().ok());
    let per_page = params.per_page.and_then(|raw| raw.parse().ok());
    let request = SearchRequest::new(token, chat_number, query, page, per_page);
    let results = state.index.search(&request).await.map_err(|err| {
        error!(
            error = %err,
            app_token = %request.app_token,
            chat_number = request.chat_number,
            "failed to search messages"
        );
        observability::register_search("error");
        ApiError::Internal("failed to search messages".to_string())
    })?;

    info!(
        app_token = %request.app_token,
        chat_number = request.chat_number,
        hits = results.messages.len(),
        total = results.total,
        "search completed"
    );
    observability::register_search("ok");

    let meta = PageMeta::new(request.page, request.per_page, results.total);
    Ok(Json(SearchResponse {
        data: results.messages,
        meta,
    }))
}

fn parse_chat_number(raw: &str) -> Result<i64, ApiError> {
    raw.parse().map_err(|_| {
        ApiError::Validation("chat number must be a valid integer".to_string())
    })
}
