//! Exposes the Signing Service to deployment workers as a single JSON-RPC
//! 2.0 endpoint: `health_status`, `eth_sign`, `personal_sign`, and
//! `eth_signTransaction`.
//!
//! The module built here carries no transport of its own; [`axum_service`]
//! adapts it into a `tower::Service` so the caller can nest it under an
//! `axum::Router` at `/v1/rpc` alongside the REST deployment API, sharing
//! one tracing/timeout middleware stack.

#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

mod client;
mod methods;
mod tx;

pub use client::SignerClient;
pub use methods::{health_status, resolve_key_by_address, MethodError};
pub use tx::{parse_tx, TxRequest, UnsignedTx};

use jsonrpsee::server::{stop_channel, RpcModule};
use jsonrpsee::types::ErrorObjectOwned;
use jsonrpsee::Extensions;
use popsigner_api_keys::ApiKeyManager;
use popsigner_core::{ApiKeyScope, ControlPlaneError};
use popsigner_metrics::RpcMetrics;
use popsigner_signing::{CallerContext, SigningService};
use popsigner_store::{ApiKeyStore, AuditStore, KeyStore, UsageStore};
use serde::Deserialize;
use std::sync::Arc;

const CODE_UNKNOWN_ADDRESS: i32 = -32001;
const CODE_UNAUTHORIZED: i32 = -32003;

/// Everything a method handler needs: the Signing Service, the key store
/// it's backed by (for address resolution), and a metrics handle.
pub struct RpcContext<S> {
    signing: Arc<SigningService<S>>,
    store: Arc<S>,
    metrics: RpcMetrics,
}

impl<S> std::fmt::Debug for RpcContext<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcContext").finish_non_exhaustive()
    }
}

impl<S> RpcContext<S> {
    /// Builds a context over an already-constructed [`SigningService`].
    pub fn new(signing: Arc<SigningService<S>>, store: Arc<S>) -> Self {
        Self { signing, store, metrics: RpcMetrics::new() }
    }
}

/// Authenticates the bearer API key carried in a request's extensions
/// (inserted by an upstream axum middleware layer, see
/// [`auth::require_sign_scope`]) into a [`CallerContext`].
///
/// Returns the `-32003` JSON-RPC error if no caller was authenticated, or
/// authentication failed before the request reached this module.
fn caller_from_extensions(ext: &Extensions) -> Result<CallerContext, ErrorObjectOwned> {
    ext.get::<CallerContext>()
        .cloned()
        .ok_or_else(|| ErrorObjectOwned::owned(CODE_UNAUTHORIZED, "unauthorized", None::<()>))
}

fn map_method_error(err: MethodError) -> ErrorObjectOwned {
    match err {
        MethodError::UnknownAddress => ErrorObjectOwned::owned(CODE_UNKNOWN_ADDRESS, "unknown signing address", None::<()>),
        MethodError::Request(e) | MethodError::Signing(e) => map_control_plane_error(e),
    }
}

fn map_control_plane_error(err: ControlPlaneError) -> ErrorObjectOwned {
    ErrorObjectOwned::owned(err.rpc_code(), err.to_string(), None::<()>)
}

#[derive(Deserialize)]
struct EthSignParams(String, String);

#[derive(Deserialize)]
struct PersonalSignParams(String, String);

/// Builds the `RpcModule` exposing the four methods named in the design
/// document. The module holds no connection state of its own: every call
/// re-authenticates via the request's extensions and dispatches straight
/// into the Signing Service.
pub fn build_module<S>(ctx: Arc<RpcContext<S>>) -> RpcModule<()>
where
    S: KeyStore + AuditStore + UsageStore + Send + Sync + 'static,
{
    let mut module = RpcModule::new(());

    {
        let ctx = ctx.clone();
        module
            .register_async_method("health_status", move |_params, _rpc_ctx, ext| {
                let ctx = ctx.clone();
                async move {
                    ctx.metrics.requests_total.increment(1);
                    let _ = ext;
                    Ok::<_, ErrorObjectOwned>(health_status())
                }
            })
            .expect("health_status is a unique method name");
    }

    {
        let ctx = ctx.clone();
        module
            .register_async_method("eth_sign", move |params, _rpc_ctx, ext| {
                let ctx = ctx.clone();
                async move {
                    ctx.metrics.requests_total.increment(1);
                    let caller = caller_from_extensions(&ext)?;
                    let EthSignParams(address, data) = params.parse()?;
                    let bytes = hex::decode(data.trim_start_matches("0x"))
                        .map_err(|_| ErrorObjectOwned::owned(-32602, "data must be hex-encoded", None::<()>))?;
                    methods::eth_sign(&ctx.signing, &ctx.store, &caller, &address, &bytes)
                        .await
                        .map_err(|e| {
                            ctx.metrics.errors_total.increment(1);
                            map_method_error(e)
                        })
                }
            })
            .expect("eth_sign is a unique method name");
    }

    {
        let ctx = ctx.clone();
        module
            .register_async_method("personal_sign", move |params, _rpc_ctx, ext| {
                let ctx = ctx.clone();
                async move {
                    ctx.metrics.requests_total.increment(1);
                    let caller = caller_from_extensions(&ext)?;
                    let PersonalSignParams(data, address) = params.parse()?;
                    let bytes = hex::decode(data.trim_start_matches("0x"))
                        .map_err(|_| ErrorObjectOwned::owned(-32602, "data must be hex-encoded", None::<()>))?;
                    methods::eth_sign(&ctx.signing, &ctx.store, &caller, &address, &bytes)
                        .await
                        .map_err(|e| {
                            ctx.metrics.errors_total.increment(1);
                            map_method_error(e)
                        })
                }
            })
            .expect("personal_sign is a unique method name");
    }

    {
        let ctx = ctx.clone();
        module
            .register_async_method("eth_signTransaction", move |params, _rpc_ctx, ext| {
                let ctx = ctx.clone();
                async move {
                    ctx.metrics.requests_total.increment(1);
                    let caller = caller_from_extensions(&ext)?;
                    let (tx,): (TxRequest,) = params.parse()?;
                    methods::eth_sign_transaction(&ctx.signing, &ctx.store, &caller, &tx)
                        .await
                        .map_err(|e| {
                            ctx.metrics.errors_total.increment(1);
                            map_method_error(e)
                        })
                }
            })
            .expect("eth_signTransaction is a unique method name");
    }

    module
}

/// Required scope for a bearer API key to call any method on this module.
pub const REQUIRED_SCOPE: ApiKeyScope = ApiKeyScope::KeysSign;

/// Authenticates `raw_key` against `manager`, requiring [`REQUIRED_SCOPE`],
/// and builds the [`CallerContext`] an upstream axum middleware layer
/// should insert into the request's extensions before handing it to the
/// module built by [`build_module`].
pub async fn authenticate<S>(manager: &ApiKeyManager<S>, raw_key: &str, ip: Option<String>, ua: Option<String>) -> Result<CallerContext, ControlPlaneError>
where
    S: ApiKeyStore,
{
    let api_key = manager.authenticate_with_scope(raw_key, REQUIRED_SCOPE).await?;
    Ok(CallerContext { org_id: api_key.org_id, actor_id: api_key.id.to_string(), ip, ua })
}

/// Builds the `(StopHandle, ServerHandle)` pair `jsonrpsee`'s tower-service
/// adapter needs to bridge an [`RpcModule`] into a plain
/// `tower::Service<http::Request<B>>`, so it can be nested into an
/// `axum::Router` with `Router::route_service`.
///
/// Kept as a thin re-export point rather than duplicated at every call
/// site; the bin crate owns the actual `to_service_builder().build(...)`
/// call since that's where the shared tracing/timeout layers are threaded
/// through.
pub fn stop_handles() -> (jsonrpsee::server::StopHandle, jsonrpsee::server::ServerHandle) {
    stop_channel()
}

#[cfg(test)]
mod tests {
    use super::*;
    use popsigner_core::Algorithm;
    use popsigner_store::MemoryStore;
    use popsigner_vault::VaultGateway;
    use std::sync::Arc;

    struct StubVault;

    #[async_trait::async_trait]
    impl VaultGateway for StubVault {
        async fn create_key(&self, _r: popsigner_vault::CreateKeyRequest) -> Result<popsigner_vault::VaultKeyMaterial, ControlPlaneError> {
            Ok(popsigner_vault::VaultKeyMaterial { public_key: vec![2; 33], address: vec![1; 20], eth_address: Some(vec![0xAB; 20]) })
        }
        async fn import_key(&self, _r: popsigner_vault::ImportKeyRequest) -> Result<popsigner_vault::VaultKeyMaterial, ControlPlaneError> {
            unreachable!()
        }
        async fn sign(&self, _key_ref: &str, _payload: &[u8]) -> Result<popsigner_vault::VaultSignature, ControlPlaneError> {
            let mut sig = vec![0u8; 65];
            sig[31] = 1;
            sig[63] = 1;
            Ok(popsigner_vault::VaultSignature { signature: sig, public_key: vec![2; 33] })
        }
        async fn export_key(&self, _key_ref: &str) -> Result<Vec<u8>, ControlPlaneError> {
            unreachable!()
        }
        async fn delete_key(&self, _key_ref: &str) -> Result<(), ControlPlaneError> {
            Ok(())
        }
        async fn read_kv(&self, _path: &str) -> Result<Option<serde_json::Value>, ControlPlaneError> {
            Ok(None)
        }
        async fn write_kv(&self, _path: &str, _value: serde_json::Value) -> Result<(), ControlPlaneError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn resolve_key_by_address_finds_owned_key() {
        let store = Arc::new(MemoryStore::new());
        let vault = Arc::new(StubVault);
        let signing = SigningService::new(store.clone(), vault, popsigner_signing::QuotaPolicy { signatures_per_month: 100 });
        let org_id = uuid::Uuid::new_v4();
        let key = signing.create(org_id, uuid::Uuid::new_v4(), "batcher", Algorithm::Secp256k1, false).await.unwrap();

        let found = resolve_key_by_address(store.as_ref(), org_id, "0xabababababababababababababababababababab").await.unwrap();
        assert_eq!(found.id, key.id);
    }
}
