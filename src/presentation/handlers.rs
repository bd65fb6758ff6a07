// HTTP request handlers
use crate::application::site_session::{CommandRoute, ControlError, SiteSession};
use crate::domain::command::{ControlCommand, PendingCommand};
use crate::domain::connection::ConnectionState;
use crate::domain::site::SiteState;
use crate::presentation::app_state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteView {
    pub site: SiteState,
    pub connection: ConnectionState,
    pub pending_commands: Vec<PendingCommand>,
    pub control_permitted: bool,
}

impl SiteView {
    pub fn of(session: &SiteSession) -> Self {
        Self {
            site: session.snapshot(),
            connection: session.connection(),
            pending_commands: session.pending_commands(),
            control_permitted: session.control_permitted(),
        }
    }
}

#[derive(Deserialize)]
pub struct ForegroundRequest {
    pub foreground: bool,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({"error": message.into()}))).into_response()
}

fn not_attached(id: &str) -> Response {
    error_response(
        StatusCode::NOT_FOUND,
        format!("no screen is attached to site {}", id),
    )
}

/// Health check endpoint
pub async fn health_check() -> &'static str {
    "ok"
}

/// Current model of an attached site
pub async fn get_site(Path(id): Path<String>, State(state): State<Arc<AppState>>) -> Response {
    let Some(session) = state.registry.session(&id) else {
        return not_attached(&id);
    };

    Json(SiteView::of(&session)).into_response()
}

/// Issue a control command on an attached site
pub async fn post_command(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(command): Json<ControlCommand>,
) -> Response {
    let Some(session) = state.registry.session(&id) else {
        return not_attached(&id);
    };

    match session.send_command(command).await {
        Ok(CommandRoute::Socket { correlation_id }) => (
            StatusCode::ACCEPTED,
            Json(json!({"route": "socket", "correlationId": correlation_id})),
        )
            .into_response(),
        Ok(CommandRoute::Http) => Json(json!({"route": "http"})).into_response(),
        Err(e @ ControlError::PermissionDenied) => {
            error_response(StatusCode::FORBIDDEN, e.to_string())
        }
        Err(e @ ControlError::Invalid(_)) => {
            error_response(StatusCode::UNPROCESSABLE_ENTITY, e.to_string())
        }
        Err(e @ ControlError::Fallback(_)) => {
            tracing::error!("Command on site {} failed: {}", id, e);
            error_response(StatusCode::BAD_GATEWAY, e.to_string())
        }
    }
}

/// Ask for fresh state (socket snapshot or HTTP fetch)
pub async fn post_refresh(Path(id): Path<String>, State(state): State<Arc<AppState>>) -> Response {
    let Some(session) = state.registry.session(&id) else {
        return not_attached(&id);
    };

    match session.refresh().await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            tracing::warn!("Refresh of site {} failed: {:#}", id, e);
            error_response(StatusCode::BAD_GATEWAY, format!("{:#}", e))
        }
    }
}

/// Application moved between foreground and background
pub async fn put_foreground(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ForegroundRequest>,
) -> StatusCode {
    state.registry.set_foreground(request.foreground);
    StatusCode::NO_CONTENT
}
