//! The Unified Orchestrator: the public entry point that allocates a chain
//! id, persists a `pending` deployment, dispatches it to the right stack
//! orchestrator by `stack`, and tracks the resulting task so it can be
//! cancelled or recovered after a crash.

use crate::{arc, ControlPlaneStore, DeploymentHandle, NitroOrchestrator, OpOrchestrator, StackOrchestrator};
use async_trait::async_trait;
use dashmap::DashMap;
use popsigner_core::{ControlPlaneError, Deployment, DeploymentStatus, Stack};
use popsigner_metrics::OrchestratorMetrics;
use popsigner_store::{ChainIdAllocator, DeploymentStore};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Input to [`UnifiedOrchestrator::start`].
#[derive(Debug, Clone)]
pub struct DeploymentRequest {
    /// Owning organization.
    pub org_id: Uuid,
    /// Which stack to deploy.
    pub stack: Stack,
    /// The L1 network the chain id is allocated against and contracts are
    /// deployed on.
    pub l1_chain_id: u64,
    /// Opaque, stack-typed configuration blob.
    pub config: Value,
}

/// Drives both halves of a [`Stack::Bundle`] deployment against one
/// `Deployment` row, finalizing only once both have run their stages.
pub struct BundleOrchestrator<S> {
    op: Arc<OpOrchestrator<S>>,
    nitro: Arc<NitroOrchestrator<S>>,
}

impl<S> std::fmt::Debug for BundleOrchestrator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundleOrchestrator").finish_non_exhaustive()
    }
}

#[async_trait]
impl<S> StackOrchestrator for BundleOrchestrator<S>
where
    S: ControlPlaneStore,
{
    async fn start(&self, deployment: Deployment, cancel: CancellationToken) -> Result<(), ControlPlaneError> {
        self.op.run_stages(&deployment, &cancel, false).await?;
        self.nitro.run_stages(&deployment, &cancel, None).await?;
        self.op.finalize(deployment.id).await
    }

    async fn resume(&self, deployment: Deployment, cancel: CancellationToken) -> Result<(), ControlPlaneError> {
        let stage = deployment.stage.clone();
        let op_done = matches!(stage.as_str(), "wait_confirmations" | "verify_config") || stage.starts_with("issue_cert") || stage.starts_with("invoke_worker") || stage.starts_with("capture_contracts") || stage.starts_with("materialize_artifacts") || stage.starts_with("persist_infra");
        if !op_done {
            self.op.run_stages(&deployment, &cancel, true).await?;
        }
        self.nitro.run_stages(&deployment, &cancel, Some(&stage)).await?;
        self.op.finalize(deployment.id).await
    }
}

/// Public entry point: chooses a stack orchestrator by tag, tracks active
/// deployment tasks, and recovers non-terminal deployments on restart.
pub struct UnifiedOrchestrator<S> {
    store: Arc<S>,
    op: Arc<OpOrchestrator<S>>,
    nitro: Arc<NitroOrchestrator<S>>,
    bundle: Arc<BundleOrchestrator<S>>,
    active: DashMap<Uuid, DeploymentHandle>,
    metrics: OrchestratorMetrics,
}

impl<S> std::fmt::Debug for UnifiedOrchestrator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnifiedOrchestrator").field("active", &self.active.len()).finish_non_exhaustive()
    }
}

impl<S> UnifiedOrchestrator<S>
where
    S: ControlPlaneStore,
{
    /// Builds an orchestrator over the shared store and its two stack
    /// orchestrators.
    pub fn new(store: Arc<S>, op: Arc<OpOrchestrator<S>>, nitro: Arc<NitroOrchestrator<S>>) -> Self {
        Self {
            store,
            bundle: arc(BundleOrchestrator { op: op.clone(), nitro: nitro.clone() }),
            op,
            nitro,
            active: DashMap::new(),
            metrics: OrchestratorMetrics::new(),
        }
    }

    /// Allocates a chain id, persists a `pending` deployment, and spawns
    /// its stack task. Returns immediately with the new deployment's id.
    pub async fn start(self: &Arc<Self>, req: DeploymentRequest) -> Result<Uuid, ControlPlaneError> {
        let chain_id = self.store.allocate(req.l1_chain_id).await?;
        let now = chrono::Utc::now();
        let deployment = Deployment {
            id: Uuid::new_v4(),
            org_id: req.org_id,
            stack: req.stack,
            chain_id,
            status: DeploymentStatus::Pending,
            stage: String::new(),
            error: None,
            config: req.config,
            created_at: now,
            updated_at: now,
        };

        self.store.create_deployment(deployment.clone()).await?;
        self.metrics.deployments_started_total.increment(1);
        let deployment_id = deployment.id;
        self.spawn(deployment, false);
        Ok(deployment_id)
    }

    /// Signals cancellation to a deployment's active task, if one is
    /// tracked. Returns `false` if no task is currently running for
    /// `deployment_id` (already finished, or not yet recovered after a
    /// restart).
    pub fn cancel(&self, deployment_id: Uuid) -> bool {
        match self.active.get(&deployment_id) {
            Some(handle) => {
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Lists every non-terminal deployment and resumes its stack
    /// orchestrator, skipping deployments already tracked as active.
    /// Intended to be called once, roughly 5 seconds after startup.
    pub async fn process_pending_deployments(self: &Arc<Self>) -> Result<(), ControlPlaneError> {
        for status in [DeploymentStatus::Pending, DeploymentStatus::Initializing, DeploymentStatus::Running] {
            for deployment in self.store.list_by_status(status).await? {
                if !self.active.contains_key(&deployment.id) {
                    tracing::info!(deployment_id = %deployment.id, stage = %deployment.stage, "resuming deployment after restart");
                    self.spawn(deployment, true);
                }
            }
        }
        Ok(())
    }

    fn spawn(self: &Arc<Self>, deployment: Deployment, resume: bool) {
        let cancel = CancellationToken::new();
        self.active.insert(deployment.id, DeploymentHandle { deployment_id: deployment.id, cancel: cancel.clone() });
        self.metrics.active_deployments.increment(1.0);

        let this = self.clone();
        tokio::spawn(async move {
            let deployment_id = deployment.id;
            let stack = deployment.stack;
            let result = if resume {
                this.dispatch(stack).resume(deployment, cancel).await
            } else {
                this.dispatch(stack).start(deployment, cancel).await
            };
            if let Err(err) = result {
                tracing::warn!(%deployment_id, %err, "deployment task ended in error");
            }
            this.active.remove(&deployment_id);
            this.metrics.active_deployments.decrement(1.0);
        });
    }

    fn dispatch(&self, stack: Stack) -> Arc<dyn StackOrchestrator> {
        match stack {
            Stack::Op => self.op.clone(),
            Stack::Nitro => self.nitro.clone(),
            Stack::Bundle => self.bundle.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_resolver::KeyResolver;
    use crate::l1::{L1Client, TxReceipt};
    use popsigner_api_keys::DeploymentCredentialManager;
    use popsigner_certs::CertificateProvider;
    use popsigner_core::ControlPlaneError;
    use popsigner_pki::SelfSignedCa;
    use popsigner_signing::{QuotaPolicy, SigningService};
    use popsigner_store::MemoryStore;
    use popsigner_vault::{CreateKeyRequest, ImportKeyRequest, VaultGateway, VaultKeyMaterial, VaultSignature};

    struct StubVault;
    #[async_trait]
    impl VaultGateway for StubVault {
        async fn create_key(&self, _r: CreateKeyRequest) -> Result<VaultKeyMaterial, ControlPlaneError> {
            Ok(VaultKeyMaterial { public_key: vec![2; 33], address: vec![1; 20], eth_address: Some(vec![0x11; 20]) })
        }
        async fn import_key(&self, _r: ImportKeyRequest) -> Result<VaultKeyMaterial, ControlPlaneError> {
            unreachable!()
        }
        async fn sign(&self, _key_ref: &str, _payload: &[u8]) -> Result<VaultSignature, ControlPlaneError> {
            Ok(VaultSignature { signature: vec![0u8; 65], public_key: vec![2; 33] })
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

    struct StubL1;
    #[async_trait]
    impl L1Client for StubL1 {
        async fn transaction_count(&self, _address: &str) -> Result<u64, ControlPlaneError> {
            Ok(0)
        }
        async fn send_raw_transaction(&self, _raw_tx_hex: &str) -> Result<String, ControlPlaneError> {
            Ok("0xdeadbeef".to_string())
        }
        async fn transaction_receipt(&self, _tx_hash: &str) -> Result<Option<TxReceipt>, ControlPlaneError> {
            Ok(Some(TxReceipt { block_number: Some(1), success: true, contract_address: Some("0x00000000000000000000000000000000000abc".to_string()) }))
        }
        async fn block_number(&self) -> Result<u64, ControlPlaneError> {
            Ok(2)
        }
    }

    fn build_orchestrator() -> Arc<UnifiedOrchestrator<MemoryStore>> {
        let store = Arc::new(MemoryStore::new());
        let vault = Arc::new(StubVault);
        let signing = Arc::new(SigningService::new(store.clone(), vault.clone(), QuotaPolicy { signatures_per_month: 1000 }));
        let resolver = KeyResolver::new(signing);
        let credentials = Arc::new(DeploymentCredentialManager::new(store.clone(), vault.clone()));
        let l1: Arc<dyn L1Client> = Arc::new(StubL1);
        let op = Arc::new(OpOrchestrator::new(store.clone(), resolver, credentials.clone(), l1, "http://127.0.0.1:1/v1/rpc".to_string(), 1));

        let pki = Arc::new(SelfSignedCa::generate("acme").unwrap());
        let certs = Arc::new(CertificateProvider::new(store.clone(), pki));
        let nitro = Arc::new(NitroOrchestrator::new(store.clone(), certs, credentials, "http://127.0.0.1:1/v1/rpc".to_string(), "/bin/true".to_string()));

        Arc::new(UnifiedOrchestrator::new(store, op, nitro))
    }

    #[tokio::test]
    async fn start_persists_a_pending_deployment_and_tracks_it() {
        let orchestrator = build_orchestrator();
        let req = DeploymentRequest { org_id: Uuid::new_v4(), stack: Stack::Op, l1_chain_id: 11155111, config: serde_json::json!({ "roles": {} }) };

        let id = orchestrator.start(req).await.unwrap();
        let deployment = orchestrator.store.get_deployment(id).await.unwrap();
        assert_eq!(deployment.chain_id, 1);
        assert!(orchestrator.active.contains_key(&id) || !orchestrator.active.is_empty());
    }

    #[tokio::test]
    async fn cancel_returns_false_for_unknown_deployment() {
        let orchestrator = build_orchestrator();
        assert!(!orchestrator.cancel(Uuid::new_v4()));
    }

    #[tokio::test]
    async fn process_pending_deployments_resumes_non_terminal_rows() {
        let orchestrator = build_orchestrator();
        let deployment = Deployment {
            id: Uuid::new_v4(),
            org_id: Uuid::new_v4(),
            stack: Stack::Op,
            chain_id: 7,
            status: DeploymentStatus::Running,
            stage: "resolve_keys".to_string(),
            error: None,
            config: serde_json::json!({ "roles": {} }),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        orchestrator.store.create_deployment(deployment).await.unwrap();

        orchestrator.process_pending_deployments().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
}
