//! The REST deployment API: `POST /v1/deployments`, `GET /v1/deployments/{id}`,
//! `GET /v1/deployments/{id}/artifacts/{type}`, `POST /v1/deployments/{id}/cancel`.
//! Every route is guarded by [`crate::auth::require_scope`] for
//! `keys:write`, which inserts the caller's [`CallerContext`] ahead of the
//! handler.

use axum::extract::{Extension, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use popsigner_core::{ControlPlaneError, Deployment, Stack, Transaction};
use popsigner_orchestrator::{ControlPlaneStore, DeploymentRequest, UnifiedOrchestrator};
use popsigner_signing::CallerContext;
use popsigner_store::DeploymentStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Shared state for the deployment routes.
#[derive(Clone)]
pub struct DeploymentApiState<S> {
    store: Arc<S>,
    orchestrator: Arc<UnifiedOrchestrator<S>>,
}

impl<S> DeploymentApiState<S> {
    /// Builds state over the shared store and the Unified Orchestrator.
    pub fn new(store: Arc<S>, orchestrator: Arc<UnifiedOrchestrator<S>>) -> Self {
        Self { store, orchestrator }
    }
}

/// Builds the `/v1/deployments` route tree. The caller nests this under
/// whatever middleware stack (auth, tracing, timeouts) it composes.
pub fn router<S>(state: DeploymentApiState<S>) -> Router
where
    S: ControlPlaneStore,
{
    Router::new()
        .route("/v1/deployments", post(create_deployment::<S>))
        .route("/v1/deployments/:id", get(get_deployment::<S>))
        .route("/v1/deployments/:id/artifacts/:type", get(get_artifact::<S>))
        .route("/v1/deployments/:id/cancel", post(cancel_deployment::<S>))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct CreateDeploymentBody {
    stack: Stack,
    config: serde_json::Value,
    l1_chain_id: u64,
}

#[derive(Debug, Serialize)]
struct CreateDeploymentView {
    id: Uuid,
    status: &'static str,
}

async fn create_deployment<S>(
    State(state): State<DeploymentApiState<S>>,
    Extension(caller): Extension<CallerContext>,
    Json(body): Json<CreateDeploymentBody>,
) -> Result<(StatusCode, Json<CreateDeploymentView>), ApiError>
where
    S: ControlPlaneStore,
{
    let id = state
        .orchestrator
        .start(DeploymentRequest { org_id: caller.org_id, stack: body.stack, l1_chain_id: body.l1_chain_id, config: body.config })
        .await?;
    Ok((StatusCode::CREATED, Json(CreateDeploymentView { id, status: "pending" })))
}

#[derive(Debug, Serialize)]
struct ArtifactSummary {
    #[serde(rename = "type")]
    artifact_type: String,
    created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize)]
struct DeploymentView {
    #[serde(flatten)]
    deployment: Deployment,
    transactions: Vec<Transaction>,
    artifacts: Vec<ArtifactSummary>,
}

async fn get_deployment<S>(
    State(state): State<DeploymentApiState<S>>,
    Extension(caller): Extension<CallerContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<DeploymentView>, ApiError>
where
    S: ControlPlaneStore,
{
    let deployment = state.store.get_deployment(id).await?;
    if deployment.org_id != caller.org_id {
        return Err(ApiError(ControlPlaneError::NotFound(format!("deployment {id}"))));
    }

    let transactions = state.store.get_transactions_by_deployment(id).await?;
    let artifacts = state
        .store
        .get_all_artifacts(id)
        .await?
        .into_iter()
        .map(|a| ArtifactSummary { artifact_type: a.artifact_type, created_at: a.created_at })
        .collect();

    Ok(Json(DeploymentView { deployment, transactions, artifacts }))
}

async fn get_artifact<S>(
    State(state): State<DeploymentApiState<S>>,
    Extension(caller): Extension<CallerContext>,
    Path((id, artifact_type)): Path<(Uuid, String)>,
) -> Result<Response, ApiError>
where
    S: ControlPlaneStore,
{
    let deployment = state.store.get_deployment(id).await?;
    if deployment.org_id != caller.org_id {
        return Err(ApiError(ControlPlaneError::NotFound(format!("deployment {id}"))));
    }

    let artifact = state.store.get_artifact(id, &artifact_type).await?;
    Ok(([("content-type", "application/octet-stream")], artifact.body).into_response())
}

async fn cancel_deployment<S>(
    State(state): State<DeploymentApiState<S>>,
    Extension(caller): Extension<CallerContext>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError>
where
    S: ControlPlaneStore,
{
    let deployment = state.store.get_deployment(id).await?;
    if deployment.org_id != caller.org_id {
        return Err(ApiError(ControlPlaneError::NotFound(format!("deployment {id}"))));
    }

    if !state.orchestrator.cancel(id) {
        return Err(ApiError(ControlPlaneError::NotFound(format!("no active task for deployment {id}"))));
    }
    Ok(StatusCode::ACCEPTED)
}

/// Wraps [`ControlPlaneError`] so it can be returned directly from a
/// handler; renders as a JSON `{error}` body with the mapped status code.
struct ApiError(ControlPlaneError);

impl From<ControlPlaneError> for ApiError {
    fn from(err: ControlPlaneError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.http_status();
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}
