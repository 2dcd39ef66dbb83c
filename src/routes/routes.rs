//! Defines routes for the gatekeeper service.
//!
//! - `POST /gatekeeper` -> evaluate a batch of proposed operations
//! - `GET  /healthz`    -> liveness
//! - `GET  /readyz`     -> readiness (signer self-check)

use crate::{
    handlers::{
        gatekeeper_handlers::authorize,
        health_handlers::{healthz, readyz},
    },
    services::gatekeeper::Gatekeeper,
};
use axum::{
    Router,
    routing::{get, post},
};

/// Build the router. The shared `Gatekeeper` is supplied with `with_state`.
pub fn routes() -> Router<Gatekeeper> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/gatekeeper", post(authorize))
}
