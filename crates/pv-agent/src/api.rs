//! Agent HTTP API
//!
//! - `GET /tunnels[?services=a,b]`: current tunnel URLs, waiting for the
//!   latest update to settle
//! - `GET /machine-status`: output of the configured status command
//! - `GET /healthz`

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;

use crate::reconciler::TunnelState;
use crate::state::AgentState;

/// Build the API router
pub fn router(state: Arc<AgentState>) -> Router {
    Router::new()
        .route("/tunnels", get(tunnels))
        .route("/machine-status", get(machine_status))
        .route("/healthz", get(healthz))
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
struct TunnelsQuery {
    /// Comma-separated service names
    services: Option<String>,
}

impl TunnelsQuery {
    fn services(&self) -> Vec<String> {
        self.services
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

async fn tunnels(
    State(state): State<Arc<AgentState>>,
    Query(query): Query<TunnelsQuery>,
) -> Response {
    match state.tunnels.current().await {
        TunnelState::Ready(mut result) => {
            result.retain_services(&query.services());
            Json(result).into_response()
        }
        TunnelState::Failed(message) => {
            (StatusCode::SERVICE_UNAVAILABLE, message).into_response()
        }
        TunnelState::Pending => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

async fn machine_status(State(state): State<Arc<AgentState>>) -> Response {
    let Some(status) = state.machine_status.as_ref() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Some((program, args)) = status.command.split_first() else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "empty machine status command").into_response();
    };

    match tokio::process::Command::new(program).args(args).output().await {
        Ok(output) if output.status.success() => (
            [(header::CONTENT_TYPE, status.content_type.clone())],
            output.stdout,
        )
            .into_response(),
        Ok(output) => {
            tracing::warn!(
                "Machine status command exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                String::from_utf8_lossy(&output.stderr).into_owned(),
            )
                .into_response()
        }
        Err(e) => {
            tracing::warn!("Failed to run machine status command: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn healthz() -> &'static str {
    "ok"
}
