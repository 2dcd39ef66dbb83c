use anyhow::Result;
use axum::Router;
use object_gatekeeper::{
    config,
    routes,
    services::gatekeeper::{Gatekeeper, UuidTransactionIdProvider},
};
use std::{io::ErrorKind, net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config ---
    let cfg = config::AppConfig::from_env_and_args()?;

    tracing::info!(
        "Starting gatekeeper on {} signing for {} (ttl {}s, max {} ops/request)",
        cfg.addr(),
        cfg.endpoint,
        cfg.url_ttl_secs,
        cfg.max_operations
    );

    // --- Initialize core service ---
    let signer = cfg.signer()?;
    let policy = cfg.policy();
    tracing::debug!("policy: {:?}", policy);
    let gatekeeper = Gatekeeper::new(
        Arc::new(UuidTransactionIdProvider),
        Arc::new(policy),
        signer,
    );

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(gatekeeper);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
