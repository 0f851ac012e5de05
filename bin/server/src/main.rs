//! The popsigner control plane server: wires the Signing Service, the
//! JSON-RPC signer endpoint, and the Unified Orchestrator behind one HTTP
//! listener, then runs until shutdown.

mod auth;
mod rest;

use axum::middleware;
use axum::Router;
use popsigner_api_keys::{ApiKeyManager, DeploymentCredentialManager};
use popsigner_certs::CertificateProvider;
use popsigner_core::ApiKeyScope;
use popsigner_orchestrator::{HttpL1Client, KeyResolver, L1Client, NitroOrchestrator, OpOrchestrator, UnifiedOrchestrator};
use popsigner_pki::SelfSignedCa;
use popsigner_rpc_signer::{build_module, stop_handles, RpcContext};
use popsigner_signing::{QuotaPolicy, SigningService};
use popsigner_store::PgStore;
use popsigner_vault::HttpVaultGateway;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let config = popsigner_config::Config::from_env()?;
    popsigner_tracing::init(config.debug);
    let _metrics_handle = popsigner_metrics::install_recorder(config.metrics_bind_addr)?;

    tracing::info!(http_bind_addr = %config.http_bind_addr, "starting popsigner control plane");

    let pool = PgPoolOptions::new()
        .max_connections(config.db.pool_size)
        .connect(&config.db.connection_string())
        .await?;
    let store = Arc::new(PgStore::new(pool));

    let vault = Arc::new(HttpVaultGateway::new(config.vault.addr.clone(), config.vault.token.clone(), config.vault.namespace.clone(), config.vault.timeout));

    let signing = Arc::new(SigningService::new(
        store.clone(),
        vault.clone(),
        QuotaPolicy { signatures_per_month: config.signatures_per_month as i64 },
    ));
    let api_keys = Arc::new(ApiKeyManager::new(store.clone()));
    let deployment_credentials = Arc::new(DeploymentCredentialManager::new(store.clone(), vault.clone()));

    let ca = Arc::new(SelfSignedCa::generate("popsigner")?);
    let certs = Arc::new(CertificateProvider::new(store.clone(), ca));

    let resolver = KeyResolver::new(signing.clone());
    let l1: Arc<dyn L1Client> = Arc::new(HttpL1Client::new(config.l1_rpc_url.clone()));

    let op = Arc::new(OpOrchestrator::new(store.clone(), resolver, deployment_credentials.clone(), l1, config.signer_endpoint.clone(), config.confirmations_required));
    let nitro = Arc::new(NitroOrchestrator::new(store.clone(), certs, deployment_credentials, config.signer_endpoint.clone(), config.worker_binary_path.clone()));
    let orchestrator = Arc::new(UnifiedOrchestrator::new(store.clone(), op, nitro));

    {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            tracing::info!("sweeping for non-terminal deployments left over from a prior process");
            if let Err(err) = orchestrator.process_pending_deployments().await {
                tracing::error!(%err, "pending-deployment recovery sweep failed");
            }
        });
    }

    let rpc_ctx = Arc::new(RpcContext::new(signing, store.clone()));
    let rpc_module = build_module(rpc_ctx);
    let (stop_handle, _rpc_server_handle) = stop_handles();
    let rpc_service = jsonrpsee::server::Server::builder().to_service_builder().build(rpc_module.into(), stop_handle);

    let deployment_state = rest::DeploymentApiState::new(store.clone(), orchestrator);

    let rpc_router = Router::new()
        .route_service("/v1/rpc", rpc_service)
        .layer(middleware::from_fn_with_state(auth::AuthState::new(api_keys.clone(), ApiKeyScope::KeysSign), auth::require_scope));

    let rest_router = rest::router(deployment_state).layer(middleware::from_fn_with_state(auth::AuthState::new(api_keys, ApiKeyScope::KeysWrite), auth::require_scope));

    let app = Router::new().merge(rpc_router).merge(rest_router).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.http_bind_addr).await?;
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    tracing::info!("popsigner control plane shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
