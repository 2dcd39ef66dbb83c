//! HTTP handler for authorization requests.
//!
//! - POST /gatekeeper -> one grant per proposed operation, in request order

use crate::{
    errors::AppError,
    models::message::{GatekeeperRequest, GatekeeperResponse},
    services::gatekeeper::Gatekeeper,
};
use axum::{
    Json,
    extract::{ConnectInfo, State, rejection::JsonRejection},
    http::{HeaderMap, header},
};
use std::net::SocketAddr;
use tracing::info;

/// `POST /gatekeeper`
///
/// Client details missing from the body are filled from the connection: the
/// peer address and the `User-Agent` header.
pub async fn authorize(
    State(gatekeeper): State<Gatekeeper>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    payload: Result<Json<GatekeeperRequest>, JsonRejection>,
) -> Result<Json<GatekeeperResponse>, AppError> {
    let Json(mut request) = payload?;

    if request.client.remote_address.is_none() {
        request.client.remote_address = Some(peer.ip().to_string());
    }
    if request.client.user_agent.is_none() {
        request.client.user_agent = headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
    }

    let response = gatekeeper.handle(&request);
    let signed = response.grants.iter().filter(|g| g.is_signed()).count();
    info!(
        "authorized {}/{} operations for {}",
        signed,
        response.grants.len(),
        peer
    );
    Ok(Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::object::{ObjectRef, ProposedOperation},
        services::{
            gatekeeper::SequentialTransactionIdProvider, policy::DefaultPolicy, signer::UrlSigner,
        },
    };
    use axum::http::HeaderValue;
    use std::{sync::Arc, time::Duration};

    fn gatekeeper() -> Gatekeeper {
        let signer = UrlSigner::new("secret", "http://store.local/", Duration::from_secs(60)).unwrap();
        Gatekeeper::new(
            Arc::new(SequentialTransactionIdProvider::new("tx-")),
            Arc::new(DefaultPolicy::default()),
            signer,
        )
    }

    #[tokio::test]
    async fn answers_every_operation_and_records_client() {
        let request = GatekeeperRequest {
            operations: vec![
                ProposedOperation::put(ObjectRef::new("bucket", "a.txt")),
                ProposedOperation::get(ObjectRef::new("bucket", "b.txt")),
            ],
            ..GatekeeperRequest::default()
        };
        let mut headers = HeaderMap::new();
        headers.insert(header::USER_AGENT, HeaderValue::from_static("uploader/1.0"));

        let Json(response) = authorize(
            State(gatekeeper()),
            ConnectInfo("10.0.0.7:5000".parse().unwrap()),
            headers,
            Ok(Json(request)),
        )
        .await
        .unwrap();

        assert_eq!(response.grants.len(), 2);
        assert!(response.grants.iter().all(|g| g.is_signed()));
        assert_eq!(response.grants[0].transaction_id, "tx-1");
    }
}
