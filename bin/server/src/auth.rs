//! `X-API-Key` bearer authentication, shared by the REST deployment API and
//! the nested JSON-RPC signer endpoint. A successful check inserts a
//! [`CallerContext`] into the request's extensions; axum handlers read it
//! back via the `Extension` extractor, and jsonrpsee propagates the same
//! HTTP request extensions into its method handlers' `Extensions` param.

use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use popsigner_api_keys::ApiKeyManager;
use popsigner_core::ApiKeyScope;
use popsigner_signing::CallerContext;
use popsigner_store::ApiKeyStore;
use std::sync::Arc;

const API_KEY_HEADER: &str = "x-api-key";

/// State threaded through [`require_scope`] by `axum::middleware::from_fn_with_state`.
#[derive(Clone)]
pub struct AuthState<S> {
    manager: Arc<ApiKeyManager<S>>,
    scope: ApiKeyScope,
}

impl<S> AuthState<S> {
    /// Requires `scope` on every request this middleware guards.
    pub fn new(manager: Arc<ApiKeyManager<S>>, scope: ApiKeyScope) -> Self {
        Self { manager, scope }
    }
}

/// Validates the `X-API-Key` header against `state.manager`, requiring
/// `state.scope`. Rejects with `401` if the header is absent or the key is
/// invalid/revoked, `403` if the key lacks the required scope.
pub async fn require_scope<S>(State(state): State<AuthState<S>>, mut req: Request, next: Next) -> Result<Response, StatusCode>
where
    S: ApiKeyStore + Send + Sync + 'static,
{
    let raw_key = extract_key(req.headers()).ok_or(StatusCode::UNAUTHORIZED)?;
    let ip = header_string(req.headers(), "x-forwarded-for");
    let ua = header_string(req.headers(), "user-agent");

    let api_key = state.manager.authenticate_with_scope(&raw_key, state.scope).await.map_err(|e| e.http_status())?;

    req.extensions_mut().insert(CallerContext {
        org_id: api_key.org_id,
        actor_id: api_key.id.to_string(),
        ip,
        ua,
    });

    Ok(next.run(req).await)
}

fn extract_key(headers: &HeaderMap) -> Option<String> {
    headers.get(API_KEY_HEADER)?.to_str().ok().map(str::to_string)
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name)?.to_str().ok().map(str::to_string)
}
