//! Health check endpoints.
//!
//! Used by orchestration probes to decide whether the controller is alive
//! and whether its dependencies are reachable.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::state::AppState;

const SERVICE: &str = "classifier-controller";

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// "ok" or "degraded".
    pub status: String,
    pub service: String,
    pub version: String,
    /// RFC 3339.
    pub timestamp: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub components: Option<ComponentHealth>,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ComponentHealth {
    pub declaration_store: ComponentStatus,
    pub member_catalog: ComponentStatus,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ComponentStatus {
    /// "ok" or "unavailable".
    pub status: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ComponentStatus {
    fn from_result<E: std::fmt::Display>(result: Result<(), E>) -> Self {
        match result {
            Ok(()) => Self {
                status: "ok".to_string(),
                message: None,
            },
            Err(e) => Self {
                status: "unavailable".to_string(),
                message: Some(e.to_string()),
            },
        }
    }

    fn is_ok(&self) -> bool {
        self.message.is_none()
    }
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/livez", get(livez))
}

/// Returns 200 while the process is serving. Does not check dependencies.
async fn healthz() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: SERVICE.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        components: None,
    })
}

/// Returns 503 unless the declaration store and member catalog answer.
async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let declaration_store = ComponentStatus::from_result(state.store().health_check().await);
    let member_catalog =
        ComponentStatus::from_result(state.catalog().list_members().await.map(|_| ()));

    let all_ok = declaration_store.is_ok() && member_catalog.is_ok();

    let response = HealthResponse {
        status: if all_ok { "ok" } else { "degraded" }.to_string(),
        service: SERVICE.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        components: Some(ComponentHealth {
            declaration_store,
            member_catalog,
        }),
    };

    if all_ok {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

async fn livez() -> impl IntoResponse {
    StatusCode::OK
}
