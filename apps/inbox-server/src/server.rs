//! HTTP ingress for provider callbacks

use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use inbox_conversation::{DeliveryReceipt, InboundMessage, InboundOutcome, Message, PendingLink};
use inbox_core::{InboxError, ServerConfig};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

use crate::app::AppState;

pub struct Server {
    config: ServerConfig,
    state: AppState,
}

impl Server {
    pub fn new(config: ServerConfig, state: AppState) -> Self {
        Self { config, state }
    }

    pub async fn run(self) -> Result<()> {
        let addr = self.config.address();
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind HTTP server on {}", addr))?;

        info!("HTTP server listening on {}", addr);

        axum::serve(listener, router(self.state).into_make_service())
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("HTTP server error")?;

        info!("HTTP server stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

pub fn router(state: AppState) -> Router {
    let tenant_routes = Router::new()
        .route("/inbound", post(receive_inbound))
        .route("/receipts", post(apply_receipt))
        .route("/channel-links", post(begin_link))
        .route("/channel-links/:state/complete", post(complete_link));

    Router::new()
        .route("/health", get(health_check))
        .nest("/v1/tenants/:tenant_id", tenant_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Maps the shared error taxonomy onto HTTP statuses
#[derive(Debug)]
pub struct ApiError(InboxError);

impl From<InboxError> for ApiError {
    fn from(err: InboxError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            InboxError::NotFound { .. } => StatusCode::NOT_FOUND,
            InboxError::Validation(_) => StatusCode::BAD_REQUEST,
            InboxError::InvalidState(_) | InboxError::Conflict { .. } => StatusCode::CONFLICT,
            InboxError::Configuration(_) => StatusCode::UNPROCESSABLE_ENTITY,
            InboxError::DeliveryFailure(_) => StatusCode::BAD_GATEWAY,
            InboxError::Storage(_) | InboxError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        }
        let body = json!({
            "error": {
                "code": self.0.code(),
                "message": self.0.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn receive_inbound(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Json(inbound): Json<InboundMessage>,
) -> ApiResult<(StatusCode, Json<InboundOutcome>)> {
    let outcome = state.inbox.receive_inbound(&tenant_id, inbound).await?;
    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(outcome)))
}

async fn apply_receipt(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Json(receipt): Json<DeliveryReceipt>,
) -> ApiResult<Json<Message>> {
    let message = state.inbox.apply_delivery_receipt(&tenant_id, receipt).await?;
    Ok(Json(message))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BeginLinkRequest {
    provider: String,
    #[serde(default)]
    account_type: Option<String>,
    #[serde(default)]
    initiated_by: Option<String>,
}

async fn begin_link(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Json(request): Json<BeginLinkRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let token = state
        .linker
        .begin_link(
            &tenant_id,
            &request.provider,
            request.account_type.as_deref(),
            request.initiated_by.as_deref(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "state": token }))))
}

async fn complete_link(
    State(state): State<AppState>,
    Path((tenant_id, token)): Path<(String, String)>,
) -> ApiResult<Json<PendingLink>> {
    let link = state.linker.complete_link(&tenant_id, &token).await?;
    Ok(Json(link))
}
