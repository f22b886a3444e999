//! REST API Handlers
//!
//! Subscription management, health and metrics endpoints.

use super::validation::{is_unsubscribe_sentinel, validate_address, validate_push_token};
use crate::context::RelayContext;
use crate::error::{Error, ErrorCategory};
use crate::registry::Subscription;
use axum::{
    extract::{Json, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

// =============================================================================
// Request/Response Types
// =============================================================================

/// Subscribe request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    #[serde(default)]
    pub device_token: Option<String>,
    #[serde(default)]
    pub addresses: Option<Vec<String>>,
    #[serde(default)]
    pub expo_push_token: Option<String>,
}

/// Unsubscribe request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeRequest {
    #[serde(default)]
    pub device_token: Option<String>,
}

/// Subscribe response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsubscribed: Option<bool>,
}

/// Unsubscribe response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeResponse {
    pub success: bool,
    /// Whether a subscription existed
    pub removed: bool,
}

/// Public view of a subscription; the push token itself is never exposed
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionView {
    pub device_token: String,
    pub addresses: Vec<String>,
    pub has_push_token: bool,
    pub created_at: DateTime<Utc>,
}

impl From<Subscription> for SubscriptionView {
    fn from(sub: Subscription) -> Self {
        Self {
            has_push_token: sub.has_push_token(),
            device_token: sub.device_token,
            addresses: sub.addresses.into_iter().collect(),
            created_at: sub.created_at,
        }
    }
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ApiErrorResponse {
    fn from_error(e: &Error) -> Self {
        Self {
            error: e.code().to_string(),
            message: e.to_string(),
            details: None,
        }
    }
}

fn error_response(e: Error) -> Response {
    let status = match (&e, e.category()) {
        (Error::SubscriptionNotFound { .. }, _) => StatusCode::NOT_FOUND,
        (_, ErrorCategory::Validation) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!(error = %e, "Request failed");
    }
    (status, Json(ApiErrorResponse::from_error(&e))).into_response()
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    context: Arc<RelayContext>,
}

impl RestRouter {
    pub fn new(context: Arc<RelayContext>) -> Self {
        Self { context }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            context: self.context,
        };

        Router::new()
            // Subscription endpoints
            .route("/subscribe", post(subscribe))
            .route("/subscribe/:device_token", delete(unsubscribe_by_path))
            .route("/unsubscribe", post(unsubscribe))
            .route("/subscriptions", get(list_subscriptions))
            .route("/subscriptions/:device_token", get(get_subscription))
            // Operational endpoints
            .route("/health", get(health_check))
            .route("/metrics", get(render_metrics))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    context: Arc<RelayContext>,
}

// =============================================================================
// Handlers
// =============================================================================

/// Create or replace a subscription
async fn subscribe(
    State(state): State<AppState>,
    Json(request): Json<SubscribeRequest>,
) -> Response {
    let device_token = match request.device_token.as_deref().map(str::trim) {
        Some(token) if !token.is_empty() => token.to_string(),
        _ => {
            return error_response(Error::validation(
                "missing_device_token",
                "deviceToken is required",
            ))
        }
    };
    let addresses = match request.addresses {
        Some(addresses) if !addresses.is_empty() => addresses,
        _ => {
            return error_response(Error::validation(
                "missing_addresses",
                "addresses must be a non-empty list",
            ))
        }
    };

    if addresses.iter().any(|a| is_unsubscribe_sentinel(a)) {
        let removed = state.context.registry.remove_subscription(&device_token).await;
        info!(device_token = %device_token, removed = removed, "Unsubscribed via reserved address");
        return Json(SubscribeResponse {
            success: true,
            unsubscribed: Some(true),
        })
        .into_response();
    }

    if let Err(e) = addresses.iter().try_for_each(|a| validate_address(a)) {
        return error_response(e);
    }
    if let Some(token) = request.expo_push_token.as_deref() {
        if let Err(e) = validate_push_token(token) {
            return error_response(e);
        }
    } else {
        warn!(device_token = %device_token, "Subscription without push token");
    }

    match state
        .context
        .registry
        .add_subscription(&device_token, &addresses, request.expo_push_token.as_deref())
        .await
    {
        Ok(()) => Json(SubscribeResponse {
            success: true,
            unsubscribed: None,
        })
        .into_response(),
        Err(e) => error_response(e),
    }
}

/// Remove a subscription named in the path
async fn unsubscribe_by_path(
    State(state): State<AppState>,
    Path(device_token): Path<String>,
) -> Response {
    remove(&state, &device_token).await
}

/// Remove a subscription named in the body
async fn unsubscribe(
    State(state): State<AppState>,
    Json(request): Json<UnsubscribeRequest>,
) -> Response {
    match request.device_token.as_deref().map(str::trim) {
        Some(token) if !token.is_empty() => remove(&state, token).await,
        _ => error_response(Error::validation(
            "missing_device_token",
            "deviceToken is required",
        )),
    }
}

async fn remove(state: &AppState, device_token: &str) -> Response {
    let removed = state.context.registry.remove_subscription(device_token).await;
    Json(UnsubscribeResponse {
        success: true,
        removed,
    })
    .into_response()
}

/// Get one subscription
async fn get_subscription(
    State(state): State<AppState>,
    Path(device_token): Path<String>,
) -> Response {
    match state.context.registry.subscription(&device_token) {
        Some(sub) => Json(SubscriptionView::from(sub)).into_response(),
        None => error_response(Error::SubscriptionNotFound { device_token }),
    }
}

/// List all subscriptions
async fn list_subscriptions(State(state): State<AppState>) -> impl IntoResponse {
    let views: Vec<SubscriptionView> = state
        .context
        .registry
        .list_all()
        .into_iter()
        .map(SubscriptionView::from)
        .collect();
    Json(views)
}

/// Health check
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.context.health())
}

/// Prometheus exposition
async fn render_metrics(State(state): State<AppState>) -> Response {
    state.context.refresh_gauges();
    match state.context.metrics.render() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}
