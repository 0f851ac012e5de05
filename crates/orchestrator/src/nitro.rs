//! The Nitro+DA orchestrator: drives a deployment through `issue_cert →
//! invoke_worker → capture_contracts → materialize_artifacts →
//! persist_infra → complete`.
//!
//! Unlike the OP stack, Nitro deployment work happens in an external
//! worker binary; this orchestrator's job is to hand the worker a short-
//! lived mTLS identity and an environment describing where to call back
//! into, then parse what it produces.

use crate::artifacts;
use crate::{ControlPlaneStore, StackOrchestrator};
use async_trait::async_trait;
use popsigner_api_keys::DeploymentCredentialManager;
use popsigner_certs::CertificateProvider;
use popsigner_core::{Artifact, ControlPlaneError, Deployment, DeploymentStatus};
use popsigner_store::{DeploymentStore, InfraRegistryStore};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Overall ceiling on worker execution, per the design document's resource
/// budget for an external subprocess.
const WORKER_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Validity of the mTLS cert handed to a worker: long enough to outlast
/// [`WORKER_TIMEOUT`] with margin, short enough to not be a standing
/// credential.
const WORKER_CERT_VALIDITY: Duration = Duration::from_secs(3 * 60 * 60);

/// Stack-specific configuration carried opaquely on [`Deployment::config`].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NitroConfig {
    pub l1_rpc_url: String,
    pub l1_chain_id: u64,
    #[serde(default = "default_namespace")]
    pub celestia_namespace: String,
    #[serde(default = "default_celestia_endpoint")]
    pub celestia_rpc_endpoint: String,
}

fn default_namespace() -> String {
    "popsigner".to_string()
}

fn default_celestia_endpoint() -> String {
    "http://localhost:26658".to_string()
}

/// Drives the Nitro+DA stack's deployment pipeline.
pub struct NitroOrchestrator<S> {
    store: Arc<S>,
    certs: Arc<CertificateProvider<S>>,
    credentials: Arc<DeploymentCredentialManager<S>>,
    signer_endpoint: String,
    worker_binary_path: String,
}

impl<S> std::fmt::Debug for NitroOrchestrator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NitroOrchestrator").finish_non_exhaustive()
    }
}

impl<S> NitroOrchestrator<S>
where
    S: ControlPlaneStore,
{
    /// Builds an orchestrator against the shared repository store, the
    /// Certificate Provider, the deployment credential manager, and the
    /// path to the external worker binary.
    pub fn new(
        store: Arc<S>,
        certs: Arc<CertificateProvider<S>>,
        credentials: Arc<DeploymentCredentialManager<S>>,
        signer_endpoint: String,
        worker_binary_path: String,
    ) -> Self {
        Self { store, certs, credentials, signer_endpoint, worker_binary_path }
    }

    fn config_of(deployment: &Deployment) -> Result<NitroConfig, ControlPlaneError> {
        serde_json::from_value(deployment.config.clone()).map_err(|e| ControlPlaneError::BadRequest(format!("invalid nitro stack config: {e}")))
    }

    async fn set_stage(&self, id: Uuid, status: DeploymentStatus, stage: &str) -> Result<(), ControlPlaneError> {
        self.store.update_status(id, status, Some(stage.to_string())).await
    }

    /// Stage 1: issue a deployment-scoped mTLS client cert, persisted as a
    /// hidden artifact (for audit/download) and written to a temp dir for
    /// the worker's side channel.
    async fn issue_cert(&self, deployment: &Deployment) -> Result<tempfile::TempDir, ControlPlaneError> {
        self.set_stage(deployment.id, DeploymentStatus::Initializing, "issue_cert").await?;

        let bundle = self.certs.issue_for_deployment(deployment.org_id, deployment.id, WORKER_CERT_VALIDITY).await?;

        self.store
            .save_artifact(Artifact {
                deployment_id: deployment.id,
                artifact_type: "_client-cert.pem".to_string(),
                body: bundle.certificate.client_cert.clone(),
                created_at: chrono::Utc::now(),
            })
            .await?;

        let dir = tempfile::tempdir().map_err(|e| ControlPlaneError::Internal(format!("failed to create worker cert dir: {e}")))?;
        tokio::fs::write(dir.path().join("client.pem"), &bundle.certificate.client_cert)
            .await
            .map_err(|e| ControlPlaneError::Internal(format!("failed to write client cert: {e}")))?;
        tokio::fs::write(dir.path().join("client.key"), &bundle.client_key)
            .await
            .map_err(|e| ControlPlaneError::Internal(format!("failed to write client key: {e}")))?;
        tokio::fs::write(dir.path().join("ca.pem"), &bundle.ca_cert)
            .await
            .map_err(|e| ControlPlaneError::Internal(format!("failed to write ca cert: {e}")))?;

        Ok(dir)
    }

    /// Stage 2: launches the external worker and waits for it to exit,
    /// streaming its stdout as progress events and capturing stderr for
    /// diagnosis on a non-zero exit.
    async fn invoke_worker(&self, deployment: &Deployment, config: &NitroConfig, cert_dir: &tempfile::TempDir, cancel: &CancellationToken) -> Result<(), ControlPlaneError> {
        self.set_stage(deployment.id, DeploymentStatus::Running, "invoke_worker").await?;

        let api_key = self.credentials.get_or_create(deployment.org_id).await?;
        let workdir = cert_dir.path();

        let mut child = Command::new(&self.worker_binary_path)
            .env("SIGNER_ENDPOINT", &self.signer_endpoint)
            .env("SIGNER_API_KEY", &api_key)
            .env("CLIENT_CERT_PATH", workdir.join("client.pem"))
            .env("CLIENT_KEY_PATH", workdir.join("client.key"))
            .env("CA_CERT_PATH", workdir.join("ca.pem"))
            .env("L1_RPC_URL", &config.l1_rpc_url)
            .env("L1_CHAIN_ID", config.l1_chain_id.to_string())
            .env("CHAIN_ID", deployment.chain_id.to_string())
            .env("WORKDIR", workdir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ControlPlaneError::Internal(format!("failed to spawn nitro worker: {e}")))?;

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");
        let deployment_id = deployment.id;

        let stdout_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::info!(%deployment_id, worker_line = %line, "nitro worker progress");
            }
        });

        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut captured = String::new();
            while let Ok(Some(line)) = lines.next_line().await {
                captured.push_str(&line);
                captured.push('\n');
            }
            captured
        });

        let wait = async {
            tokio::time::timeout(WORKER_TIMEOUT, child.wait())
                .await
                .map_err(|_| ControlPlaneError::Internal("nitro worker exceeded its 1 hour execution ceiling".to_string()))?
                .map_err(|e| ControlPlaneError::Internal(format!("failed to wait on nitro worker: {e}")))
        };

        let status = tokio::select! {
            status = wait => status?,
            _ = cancel.cancelled() => {
                stdout_task.abort();
                stderr_task.abort();
                return Err(ControlPlaneError::Cancelled("invoke_worker".into()));
            }
        };

        let _ = stdout_task.await;
        let stderr_captured = stderr_task.await.unwrap_or_default();

        if !status.success() {
            return Err(ControlPlaneError::Internal(format!("nitro worker exited with {status}: {stderr_captured}")));
        }
        Ok(())
    }

    /// Stage 3: reads the worker's JSON document of deployed addresses and
    /// validates every entry is a non-zero address.
    async fn capture_contracts(&self, deployment: &Deployment, cert_dir: &tempfile::TempDir) -> Result<BTreeMap<String, String>, ControlPlaneError> {
        self.set_stage(deployment.id, DeploymentStatus::Running, "capture_contracts").await?;

        let path = cert_dir.path().join("contracts.json");
        let body = tokio::fs::read(&path)
            .await
            .map_err(|e| ControlPlaneError::Internal(format!("worker did not produce {}: {e}", path.display())))?;
        let contracts: BTreeMap<String, String> =
            serde_json::from_slice(&body).map_err(|e| ControlPlaneError::Internal(format!("malformed contracts.json from worker: {e}")))?;

        if contracts.is_empty() {
            return Err(ControlPlaneError::Internal("worker reported no deployed contract addresses".into()));
        }
        for (name, address) in &contracts {
            if is_zero_address(address) {
                return Err(ControlPlaneError::Internal(format!("worker reported a zero address for {name}")));
            }
        }

        Ok(contracts)
    }

    /// Stage 4: renders the fixed artifact set and persists each.
    async fn materialize_artifacts(&self, deployment: &Deployment, config: &NitroConfig, contracts: &BTreeMap<String, String>) -> Result<(), ControlPlaneError> {
        self.set_stage(deployment.id, DeploymentStatus::Running, "materialize_artifacts").await?;

        let jwt = artifacts::generate_jwt_hex();
        for artifact in artifacts::render_all(deployment, config, contracts, &jwt) {
            self.store.save_artifact(artifact).await?;
        }
        Ok(())
    }

    /// Stage 5: registers the deployed rollup factory for reuse by future
    /// deployments against the same `(org_id, l1_chain_id)`.
    async fn persist_infra(&self, deployment: &Deployment, config: &NitroConfig, contracts: &BTreeMap<String, String>) -> Result<(), ControlPlaneError> {
        self.set_stage(deployment.id, DeploymentStatus::Running, "persist_infra").await?;

        if let Some(factory) = contracts.get("rollup_creator").or_else(|| contracts.get("factory")) {
            self.store.record_factory_address(deployment.org_id, config.l1_chain_id, factory.clone()).await?;
        }
        Ok(())
    }

    /// Drives every stage short of the final completion transition, so a
    /// [`crate::unified::BundleOrchestrator`] can run this stack and the
    /// OP stack against one deployment before finalizing once.
    pub(crate) async fn run_stages(&self, deployment: &Deployment, cancel: &CancellationToken, resume_stage: Option<&str>) -> Result<(), ControlPlaneError> {
        let config = Self::config_of(deployment)?;

        let already_captured = resume_stage.map(|s| matches!(s, "capture_contracts" | "materialize_artifacts" | "persist_infra" | "complete")).unwrap_or(false);

        let contracts = if already_captured {
            let artifact = self.store.get_artifact(deployment.id, "addresses.json").await;
            match artifact {
                Ok(a) => serde_json::from_slice::<serde_json::Value>(&a.body)
                    .ok()
                    .and_then(|v| v.get("contracts").cloned())
                    .and_then(|v| serde_json::from_value::<BTreeMap<String, String>>(v).ok())
                    .unwrap_or_default(),
                Err(_) => BTreeMap::new(),
            }
        } else {
            let cert_dir = self.issue_cert(deployment).await?;
            self.invoke_worker(deployment, &config, &cert_dir, cancel).await?;
            self.capture_contracts(deployment, &cert_dir).await?
        };

        self.materialize_artifacts(deployment, &config, &contracts).await?;
        self.persist_infra(deployment, &config, &contracts).await?;
        Ok(())
    }

    pub(crate) async fn finalize(&self, deployment_id: Uuid) -> Result<(), ControlPlaneError> {
        self.set_stage(deployment_id, DeploymentStatus::Running, "complete").await?;
        self.store.update_status(deployment_id, DeploymentStatus::Completed, Some("complete".to_string())).await
    }

    async fn run(&self, deployment: Deployment, cancel: CancellationToken, resume_stage: Option<String>) -> Result<(), ControlPlaneError> {
        self.run_stages(&deployment, &cancel, resume_stage.as_deref()).await?;
        self.finalize(deployment.id).await
    }
}

fn is_zero_address(address: &str) -> bool {
    let digits = address.trim_start_matches("0x");
    !digits.is_empty() && digits.chars().all(|c| c == '0')
}

#[async_trait]
impl<S> StackOrchestrator for NitroOrchestrator<S>
where
    S: ControlPlaneStore,
{
    async fn start(&self, deployment: Deployment, cancel: CancellationToken) -> Result<(), ControlPlaneError> {
        if let Err(err) = self.run(deployment.clone(), cancel, None).await {
            self.store.set_error(deployment.id, err.to_string()).await.ok();
            return Err(err);
        }
        Ok(())
    }

    async fn resume(&self, deployment: Deployment, cancel: CancellationToken) -> Result<(), ControlPlaneError> {
        let stage = deployment.stage.clone();
        if let Err(err) = self.run(deployment.clone(), cancel, Some(stage)).await {
            self.store.set_error(deployment.id, err.to_string()).await.ok();
            return Err(err);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_zero_address() {
        assert!(is_zero_address("0x0000000000000000000000000000000000000000"));
        assert!(!is_zero_address("0x0000000000000000000000000000000000abcd"));
    }

    #[test]
    fn config_applies_celestia_defaults() {
        let config: NitroConfig = serde_json::from_value(serde_json::json!({
            "l1RpcUrl": "http://localhost:8545",
            "l1ChainId": 1,
        }))
        .unwrap();
        assert_eq!(config.celestia_namespace, "popsigner");
        assert_eq!(config.celestia_rpc_endpoint, "http://localhost:26658");
    }
}
