//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks the signer can sign and verify

use crate::{
    models::object::{ObjectRef, OperationKind},
    services::gatekeeper::Gatekeeper,
};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use chrono::Utc;
use serde::Serialize;

/// `GET /healthz`
///
/// Very small liveness probe. Always returns 200 OK with a plain JSON body.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
            error: None,
        }),
    )
}

/// `GET /readyz`
///
/// Signs a probe object and verifies the result. HTTP 503 when either fails.
pub async fn readyz(State(gatekeeper): State<Gatekeeper>) -> impl IntoResponse {
    let probe = ObjectRef::new("readyz", "probe");
    let now = Utc::now();
    let check = gatekeeper
        .signer()
        .sign(OperationKind::Get, &probe, now)
        .and_then(|url| gatekeeper.signer().verify(OperationKind::Get, &url, &probe, now));

    match check {
        Ok(()) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok".into(),
                error: None,
            }),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "error".into(),
                error: Some(format!("signer check failed: {}", e)),
            }),
        ),
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}
