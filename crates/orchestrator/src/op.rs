//! The OP-stack orchestrator: drives an optimistic-rollup deployment
//! through `resolve_keys → deploy_contracts → wait_confirmations →
//! verify_config → complete`.

use crate::key_resolver::{KeyResolver, ResolvedRole};
use crate::l1::L1Client;
use crate::{backoff, ControlPlaneStore, StackOrchestrator};
use async_trait::async_trait;
use popsigner_api_keys::DeploymentCredentialManager;
use popsigner_core::{Artifact, ControlPlaneError, Deployment, DeploymentStatus, Stack, Transaction, TxStatus};
use popsigner_metrics::OrchestratorMetrics;
use popsigner_rpc_signer::{SignerClient, TxRequest};
use popsigner_store::DeploymentStore;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// The fixed set of OP-stack participant roles resolved in stage
/// `resolve_keys`.
const ROLES: &[&str] = &["batcher", "proposer", "sequencer", "challenger"];

/// Per-transaction confirmation wait ceiling.
const TX_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// Poll interval while waiting for an L1 transaction to confirm.
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Stack-specific configuration carried opaquely on [`Deployment::config`].
#[derive(Debug, Clone, Deserialize)]
pub struct OpConfig {
    /// Optional explicit `role -> key_id` overrides; roles absent here (or
    /// whose value fails to parse as a UUID) fall back to the
    /// `"op-<role>"` naming convention.
    #[serde(default)]
    pub roles: HashMap<String, String>,
    /// Confirmation depth required before a transaction is considered
    /// `confirmed`. Defaults to [`crate::op::OpOrchestrator`]'s configured
    /// value when absent.
    pub confirmations: Option<u64>,
}

impl OpConfig {
    fn overrides(&self) -> HashMap<String, Uuid> {
        self.roles.iter().filter_map(|(role, raw)| raw.parse::<Uuid>().ok().map(|id| (role.clone(), id))).collect()
    }
}

/// Drives the OP stack's deployment pipeline.
pub struct OpOrchestrator<S> {
    store: Arc<S>,
    resolver: KeyResolver<S>,
    credentials: Arc<DeploymentCredentialManager<S>>,
    l1: Arc<dyn L1Client>,
    signer_endpoint: String,
    signer_timeout: Duration,
    default_confirmations: u64,
    metrics: OrchestratorMetrics,
}

impl<S> std::fmt::Debug for OpOrchestrator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpOrchestrator").finish_non_exhaustive()
    }
}

impl<S> OpOrchestrator<S>
where
    S: ControlPlaneStore,
{
    /// Builds an orchestrator against the shared repository store, key
    /// resolver, deployment credential manager, and L1 client.
    pub fn new(
        store: Arc<S>,
        resolver: KeyResolver<S>,
        credentials: Arc<DeploymentCredentialManager<S>>,
        l1: Arc<dyn L1Client>,
        signer_endpoint: String,
        default_confirmations: u64,
    ) -> Self {
        Self {
            store,
            resolver,
            credentials,
            l1,
            signer_endpoint,
            signer_timeout: Duration::from_secs(30),
            default_confirmations,
            metrics: OrchestratorMetrics::new(),
        }
    }

    async fn signer_client(&self, org_id: Uuid) -> Result<SignerClient, ControlPlaneError> {
        let api_key = self.credentials.get_or_create(org_id).await?;
        SignerClient::new(&self.signer_endpoint, &api_key, self.signer_timeout)
    }

    fn config_of(deployment: &Deployment) -> Result<OpConfig, ControlPlaneError> {
        serde_json::from_value(deployment.config.clone()).map_err(|e| ControlPlaneError::BadRequest(format!("invalid op stack config: {e}")))
    }

    async fn set_stage(&self, id: Uuid, status: DeploymentStatus, stage: &str) -> Result<(), ControlPlaneError> {
        self.store.update_status(id, status, Some(stage.to_string())).await
    }

    /// Stage 1: resolve every role to a concrete key and address.
    async fn resolve_keys(&self, deployment: &Deployment, config: &OpConfig) -> Result<Vec<ResolvedRole>, ControlPlaneError> {
        self.set_stage(deployment.id, DeploymentStatus::Initializing, "resolve_keys").await?;
        let namespace_id = Uuid::new_v4();
        self.resolver.resolve_all(deployment.org_id, namespace_id, Stack::Op, ROLES, &config.overrides()).await
    }

    /// Stage 2: submit one deployment transaction per role, serially, to
    /// avoid nonce races on the signer-managed address space. Roles
    /// already recorded (from a prior attempt) are skipped.
    async fn deploy_contracts(&self, deployment: &Deployment, roles: &[ResolvedRole], cancel: &CancellationToken) -> Result<(), ControlPlaneError> {
        self.set_stage(deployment.id, DeploymentStatus::Running, "deploy_contracts").await?;
        let already = self.store.get_transactions_by_deployment(deployment.id).await?;
        let signer = self.signer_client(deployment.org_id).await?;

        for role in roles {
            if cancel.is_cancelled() {
                return Err(ControlPlaneError::Cancelled("deploy_contracts".into()));
            }
            if already.iter().any(|tx| tx.stage == "deploy_contracts" && tx.role == role.role) {
                continue;
            }

            let metrics = &self.metrics;
            let nonce = backoff::retry_transient(metrics, || async {
                self.l1.transaction_count(&role.address).await
            })
            .await?;

            let tx_request = TxRequest {
                from: role.address.clone(),
                chain_id: Some(format!("0x{:x}", deployment.chain_id)),
                nonce: format!("0x{nonce:x}"),
                gas: "0x2dc6c0".into(),
                gas_price: Some("0x3b9aca00".into()),
                max_fee_per_gas: None,
                max_priority_fee_per_gas: None,
                to: None,
                value: Some("0x0".into()),
                data: Some(format!("0x{}", hex::encode(format!("deploy:{}:{}", deployment.id, role.role)))),
            };

            let signed_raw = backoff::retry_transient(metrics, || async { signer.sign_transaction(&tx_request).await }).await?;
            let tx_hash = backoff::retry_transient(metrics, || async { self.l1.send_raw_transaction(&signed_raw).await }).await?;
            self.metrics.transactions_submitted_total.increment(1);

            self.store
                .record_transaction(Transaction {
                    id: Uuid::new_v4(),
                    deployment_id: deployment.id,
                    stage: "deploy_contracts".to_string(),
                    tx_hash,
                    from_address: role.address.clone(),
                    to_address: String::new(),
                    role: role.role.clone(),
                    block_number: None,
                    status: TxStatus::Submitted,
                    created_at: chrono::Utc::now(),
                })
                .await?;
        }
        Ok(())
    }

    /// Stage 3: poll every submitted-but-unconfirmed transaction for this
    /// deployment until it reaches the required confirmation depth, or
    /// its per-tx timeout elapses.
    async fn wait_confirmations(&self, deployment: &Deployment, confirmations_required: u64, cancel: &CancellationToken) -> Result<(), ControlPlaneError> {
        self.set_stage(deployment.id, DeploymentStatus::Running, "wait_confirmations").await?;

        loop {
            let pending: Vec<_> = self
                .store
                .get_transactions_by_deployment(deployment.id)
                .await?
                .into_iter()
                .filter(|tx| tx.stage == "deploy_contracts" && tx.status == TxStatus::Submitted)
                .collect();
            if pending.is_empty() {
                return Ok(());
            }

            for tx in pending {
                if cancel.is_cancelled() {
                    return Err(ControlPlaneError::Cancelled("wait_confirmations".into()));
                }
                let deadline = Instant::now() + TX_TIMEOUT;
                loop {
                    if cancel.is_cancelled() {
                        return Err(ControlPlaneError::Cancelled("wait_confirmations".into()));
                    }
                    if Instant::now() >= deadline {
                        return Err(ControlPlaneError::Internal(format!("transaction {} for role {} did not confirm within 20 minutes", tx.tx_hash, tx.role)));
                    }
                    let receipt = self.l1.transaction_receipt(&tx.tx_hash).await?;
                    if let Some(receipt) = receipt {
                        if !receipt.success {
                            self.store.update_transaction_status(&tx.tx_hash, TxStatus::Failed, receipt.block_number).await?;
                            return Err(ControlPlaneError::BadRequest(format!("transaction {} reverted", tx.tx_hash)));
                        }
                        if let Some(block) = receipt.block_number {
                            let head = self.l1.block_number().await?;
                            if head.saturating_sub(block) + 1 >= confirmations_required {
                                self.store.update_transaction_status(&tx.tx_hash, TxStatus::Confirmed, Some(block)).await?;
                                break;
                            }
                        }
                    }
                    sleep(POLL_INTERVAL).await;
                }
            }
        }
    }

    /// Stage 4: read back the genuine deployed contract address from the
    /// confirmed transaction's receipt and persist it as the
    /// `addresses.json` artifact.
    async fn verify_config(&self, deployment: &Deployment, roles: &[ResolvedRole]) -> Result<(), ControlPlaneError> {
        self.set_stage(deployment.id, DeploymentStatus::Running, "verify_config").await?;
        let txs = self.store.get_transactions_by_deployment(deployment.id).await?;
        let deploy_tx = txs.iter().find(|tx| tx.stage == "deploy_contracts");
        let rollup_address = match deploy_tx {
            Some(tx) => self
                .l1
                .transaction_receipt(&tx.tx_hash)
                .await?
                .and_then(|receipt| receipt.contract_address)
                .ok_or_else(|| ControlPlaneError::Internal(format!("receipt for confirmed transaction {} carries no contract address", tx.tx_hash)))?,
            None => return Err(ControlPlaneError::Internal("no deploy_contracts transaction recorded for this deployment".into())),
        };

        let addresses = json!({
            "rollup": rollup_address,
            "roles": roles.iter().map(|r| (r.role.clone(), r.address.clone())).collect::<HashMap<_, _>>(),
        });

        self.store
            .save_artifact(Artifact {
                deployment_id: deployment.id,
                artifact_type: "addresses.json".to_string(),
                body: serde_json::to_vec_pretty(&addresses).unwrap_or_default(),
                created_at: chrono::Utc::now(),
            })
            .await
    }

    /// Drives every stage short of the final completion transition, so a
    /// [`crate::unified::BundleOrchestrator`] can run this stack and the
    /// Nitro stack against one deployment before finalizing once.
    pub(crate) async fn run_stages(&self, deployment: &Deployment, cancel: &CancellationToken, skip_confirmed: bool) -> Result<(), ControlPlaneError> {
        let config = Self::config_of(deployment)?;
        let confirmations_required = config.confirmations.unwrap_or(self.default_confirmations);

        let roles = self.resolve_keys(deployment, &config).await?;

        if !(skip_confirmed && stage_already_past(deployment, "deploy_contracts")) {
            self.deploy_contracts(deployment, &roles, cancel).await?;
        }
        self.wait_confirmations(deployment, confirmations_required, cancel).await?;
        self.verify_config(deployment, &roles).await?;
        Ok(())
    }

    pub(crate) async fn finalize(&self, deployment_id: Uuid) -> Result<(), ControlPlaneError> {
        self.set_stage(deployment_id, DeploymentStatus::Running, "complete").await?;
        self.store.update_status(deployment_id, DeploymentStatus::Completed, Some("complete".to_string())).await?;
        self.metrics.deployments_completed_total.increment(1);
        Ok(())
    }

    async fn run(&self, deployment: Deployment, cancel: CancellationToken, skip_confirmed: bool) -> Result<(), ControlPlaneError> {
        self.run_stages(&deployment, &cancel, skip_confirmed).await?;
        self.finalize(deployment.id).await
    }
}

fn stage_already_past(deployment: &Deployment, stage: &str) -> bool {
    deployment.stage != stage && !deployment.stage.is_empty() && deployment.stage != "resolve_keys"
}

#[async_trait]
impl<S> StackOrchestrator for OpOrchestrator<S>
where
    S: ControlPlaneStore,
{
    async fn start(&self, deployment: Deployment, cancel: CancellationToken) -> Result<(), ControlPlaneError> {
        if let Err(err) = self.run(deployment.clone(), cancel, false).await {
            self.metrics.deployments_failed_total.increment(1);
            self.store.set_error(deployment.id, err.to_string()).await.ok();
            return Err(err);
        }
        Ok(())
    }

    async fn resume(&self, deployment: Deployment, cancel: CancellationToken) -> Result<(), ControlPlaneError> {
        if let Err(err) = self.run(deployment.clone(), cancel, true).await {
            self.metrics.deployments_failed_total.increment(1);
            self.store.set_error(deployment.id, err.to_string()).await.ok();
            return Err(err);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::l1::TxReceipt;
    use popsigner_core::Stack;
    use popsigner_signing::{QuotaPolicy, SigningService};
    use popsigner_store::MemoryStore;
    use popsigner_vault::{CreateKeyRequest, ImportKeyRequest, VaultGateway, VaultKeyMaterial, VaultSignature};
    use std::sync::atomic::{AtomicU64, Ordering};

    struct StubVault;
    #[async_trait]
    impl VaultGateway for StubVault {
        async fn create_key(&self, _r: CreateKeyRequest) -> Result<VaultKeyMaterial, ControlPlaneError> {
            Ok(VaultKeyMaterial { public_key: vec![2; 33], address: vec![1; 20], eth_address: Some(vec![0xEF; 20]) })
        }
        async fn import_key(&self, _r: ImportKeyRequest) -> Result<VaultKeyMaterial, ControlPlaneError> {
            unreachable!()
        }
        async fn sign(&self, _key_ref: &str, _payload: &[u8]) -> Result<VaultSignature, ControlPlaneError> {
            let mut sig = vec![0u8; 65];
            sig[31] = 1;
            Ok(VaultSignature { signature: sig, public_key: vec![2; 33] })
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

    struct MockL1 {
        head: AtomicU64,
    }

    #[async_trait]
    impl L1Client for MockL1 {
        async fn transaction_count(&self, _address: &str) -> Result<u64, ControlPlaneError> {
            Ok(0)
        }
        async fn send_raw_transaction(&self, raw_tx_hex: &str) -> Result<String, ControlPlaneError> {
            Ok(format!("0x{:064x}", raw_tx_hex.len()))
        }
        async fn transaction_receipt(&self, _tx_hash: &str) -> Result<Option<TxReceipt>, ControlPlaneError> {
            self.head.fetch_add(1, Ordering::SeqCst);
            Ok(Some(TxReceipt { block_number: Some(1), success: true, contract_address: Some("0x00000000000000000000000000000000000abc".to_string()) }))
        }
        async fn block_number(&self) -> Result<u64, ControlPlaneError> {
            Ok(self.head.load(Ordering::SeqCst).max(1))
        }
    }

    #[test]
    fn config_overrides_skip_non_uuid_values() {
        let mut roles = HashMap::new();
        roles.insert("batcher".to_string(), "not-a-uuid".to_string());
        let config = OpConfig { roles, confirmations: None };
        assert!(config.overrides().is_empty());
    }

    #[tokio::test]
    async fn deploy_contracts_is_idempotent_on_role() {
        let store = Arc::new(MemoryStore::new());
        let deployment = Deployment {
            id: Uuid::new_v4(),
            org_id: Uuid::new_v4(),
            stack: Stack::Op,
            chain_id: 999,
            status: DeploymentStatus::Pending,
            stage: String::new(),
            error: None,
            config: json!({ "roles": {} }),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        store.create_deployment(deployment.clone()).await.unwrap();

        let signing = Arc::new(SigningService::new(store.clone(), Arc::new(StubVault), QuotaPolicy { signatures_per_month: 1000 }));
        let resolver = KeyResolver::new(signing);
        let credentials = Arc::new(DeploymentCredentialManager::new(store.clone(), Arc::new(StubVault)));
        let l1: Arc<dyn L1Client> = Arc::new(MockL1 { head: AtomicU64::new(1) });

        let _orchestrator = OpOrchestrator::new(store.clone(), resolver, credentials, l1, "http://127.0.0.1:1/v1/rpc".to_string(), 1);

        let roles = vec![ResolvedRole { role: "batcher".to_string(), key_id: Uuid::new_v4(), address: "0xabc".to_string() }];
        store
            .record_transaction(Transaction {
                id: Uuid::new_v4(),
                deployment_id: deployment.id,
                stage: "deploy_contracts".to_string(),
                tx_hash: "0xdeadbeef".to_string(),
                from_address: "0xabc".to_string(),
                to_address: String::new(),
                role: "batcher".to_string(),
                block_number: None,
                status: TxStatus::Submitted,
                created_at: chrono::Utc::now(),
            })
            .await
            .unwrap();

        let existing = store.get_transactions_by_deployment(deployment.id).await.unwrap();
        assert_eq!(existing.len(), 1);
        assert!(existing.iter().any(|tx| tx.role == roles[0].role));
    }
}
