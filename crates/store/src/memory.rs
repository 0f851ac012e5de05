//! In-memory repository implementations, used by integration tests that
//! would otherwise need a live Postgres instance.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use popsigner_core::{
    Artifact, AuditLog, ApiKey, Certificate, ControlPlaneError, Deployment, DeploymentStatus,
    Key, Transaction, TxStatus, UsageCounter,
};
use std::collections::HashMap;
use uuid::Uuid;

use crate::traits::{
    ApiKeyStore, AuditStore, CertificateStore, ChainIdAllocator, DeploymentStore,
    InfraRegistryStore, KeyStore, UsageStore,
};

/// A single in-memory store implementing every repository trait, guarded by
/// one lock per entity collection.
#[derive(Debug, Default)]
pub struct MemoryStore {
    deployments: RwLock<HashMap<Uuid, Deployment>>,
    transactions: RwLock<HashMap<Uuid, Transaction>>,
    artifacts: RwLock<HashMap<(Uuid, String), Artifact>>,
    keys: RwLock<HashMap<Uuid, Key>>,
    api_keys: RwLock<HashMap<Uuid, ApiKey>>,
    certificates: RwLock<HashMap<Uuid, Certificate>>,
    audit_logs: RwLock<Vec<AuditLog>>,
    usage: RwLock<HashMap<(Uuid, String, DateTime<Utc>), i64>>,
    infra: RwLock<HashMap<(Uuid, u64), Vec<String>>>,
    chain_seq: RwLock<HashMap<u64, u64>>,
}

impl MemoryStore {
    /// Builds an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeploymentStore for MemoryStore {
    async fn create_deployment(&self, deployment: Deployment) -> Result<(), ControlPlaneError> {
        self.deployments.write().insert(deployment.id, deployment);
        Ok(())
    }

    async fn get_deployment(&self, id: Uuid) -> Result<Deployment, ControlPlaneError> {
        self.deployments
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| ControlPlaneError::NotFound(format!("deployment {id}")))
    }

    async fn get_by_chain_id(&self, chain_id: u64) -> Result<Deployment, ControlPlaneError> {
        self.deployments
            .read()
            .values()
            .find(|d| d.chain_id == chain_id)
            .cloned()
            .ok_or_else(|| ControlPlaneError::NotFound(format!("deployment with chain_id {chain_id}")))
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: DeploymentStatus,
        stage: Option<String>,
    ) -> Result<(), ControlPlaneError> {
        let mut deployments = self.deployments.write();
        let deployment = deployments
            .get_mut(&id)
            .ok_or_else(|| ControlPlaneError::NotFound(format!("deployment {id}")))?;
        if deployment.status.is_terminal() {
            return Err(ControlPlaneError::Terminal);
        }
        deployment.status = status;
        if let Some(stage) = stage {
            deployment.stage = stage;
        }
        deployment.updated_at = Utc::now();
        Ok(())
    }

    async fn set_error(&self, id: Uuid, message: String) -> Result<(), ControlPlaneError> {
        let mut deployments = self.deployments.write();
        let deployment = deployments
            .get_mut(&id)
            .ok_or_else(|| ControlPlaneError::NotFound(format!("deployment {id}")))?;
        if deployment.status.is_terminal() {
            return Err(ControlPlaneError::Terminal);
        }
        deployment.status = DeploymentStatus::Failed;
        deployment.error = Some(message);
        deployment.updated_at = Utc::now();
        Ok(())
    }

    async fn list_by_status(&self, status: DeploymentStatus) -> Result<Vec<Deployment>, ControlPlaneError> {
        Ok(self
            .deployments
            .read()
            .values()
            .filter(|d| d.status == status)
            .cloned()
            .collect())
    }

    async fn list_all(&self, org_id: Option<Uuid>) -> Result<Vec<Deployment>, ControlPlaneError> {
        Ok(self
            .deployments
            .read()
            .values()
            .filter(|d| org_id.map(|o| o == d.org_id).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn record_transaction(&self, tx: Transaction) -> Result<(), ControlPlaneError> {
        let mut transactions = self.transactions.write();
        if transactions.values().any(|t| t.tx_hash == tx.tx_hash) {
            return Ok(());
        }
        transactions.insert(tx.id, tx);
        Ok(())
    }

    async fn update_transaction_status(
        &self,
        tx_hash: &str,
        status: TxStatus,
        block_number: Option<u64>,
    ) -> Result<(), ControlPlaneError> {
        let mut transactions = self.transactions.write();
        let tx = transactions
            .values_mut()
            .find(|t| t.tx_hash == tx_hash)
            .ok_or_else(|| ControlPlaneError::NotFound(format!("transaction {tx_hash}")))?;
        tx.status = status;
        if block_number.is_some() {
            tx.block_number = block_number;
        }
        Ok(())
    }

    async fn get_transactions_by_deployment(&self, deployment_id: Uuid) -> Result<Vec<Transaction>, ControlPlaneError> {
        let mut txs: Vec<Transaction> = self
            .transactions
            .read()
            .values()
            .filter(|t| t.deployment_id == deployment_id)
            .cloned()
            .collect();
        txs.sort_by_key(|t| t.created_at);
        Ok(txs)
    }

    async fn get_transaction_by_hash(&self, tx_hash: &str) -> Result<Option<Transaction>, ControlPlaneError> {
        Ok(self.transactions.read().values().find(|t| t.tx_hash == tx_hash).cloned())
    }

    async fn save_artifact(&self, artifact: Artifact) -> Result<(), ControlPlaneError> {
        let key = (artifact.deployment_id, artifact.artifact_type.clone());
        self.artifacts.write().insert(key, artifact);
        Ok(())
    }

    async fn get_artifact(&self, deployment_id: Uuid, artifact_type: &str) -> Result<Artifact, ControlPlaneError> {
        self.artifacts
            .read()
            .get(&(deployment_id, artifact_type.to_string()))
            .cloned()
            .ok_or_else(|| ControlPlaneError::NotFound(format!("artifact {deployment_id}/{artifact_type}")))
    }

    async fn get_all_artifacts(&self, deployment_id: Uuid) -> Result<Vec<Artifact>, ControlPlaneError> {
        Ok(self
            .artifacts
            .read()
            .values()
            .filter(|a| a.deployment_id == deployment_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl KeyStore for MemoryStore {
    async fn create_key(&self, key: Key) -> Result<(), ControlPlaneError> {
        self.keys.write().insert(key.id, key);
        Ok(())
    }

    async fn get_key(&self, id: Uuid) -> Result<Key, ControlPlaneError> {
        self.keys
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| ControlPlaneError::NotFound(format!("key {id}")))
    }

    async fn get_key_by_name(&self, org_id: Uuid, name: &str) -> Result<Key, ControlPlaneError> {
        self.keys
            .read()
            .values()
            .find(|k| k.org_id == org_id && k.name == name)
            .cloned()
            .ok_or_else(|| ControlPlaneError::NotFound(format!("key {name}")))
    }

    async fn list_keys(&self, org_id: Uuid) -> Result<Vec<Key>, ControlPlaneError> {
        Ok(self.keys.read().values().filter(|k| k.org_id == org_id).cloned().collect())
    }

    async fn delete_key(&self, id: Uuid) -> Result<(), ControlPlaneError> {
        self.keys.write().remove(&id);
        Ok(())
    }
}

#[async_trait]
impl ApiKeyStore for MemoryStore {
    async fn create_api_key(&self, api_key: ApiKey) -> Result<(), ControlPlaneError> {
        self.api_keys.write().insert(api_key.id, api_key);
        Ok(())
    }

    async fn get_api_key(&self, id: Uuid) -> Result<ApiKey, ControlPlaneError> {
        self.api_keys
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| ControlPlaneError::NotFound(format!("api key {id}")))
    }

    async fn find_by_prefix(&self, key_prefix: &str) -> Result<Vec<ApiKey>, ControlPlaneError> {
        Ok(self
            .api_keys
            .read()
            .values()
            .filter(|k| k.key_prefix == key_prefix)
            .cloned()
            .collect())
    }

    async fn list_api_keys(&self, org_id: Uuid) -> Result<Vec<ApiKey>, ControlPlaneError> {
        Ok(self.api_keys.read().values().filter(|k| k.org_id == org_id).cloned().collect())
    }

    async fn revoke_api_key(&self, id: Uuid) -> Result<(), ControlPlaneError> {
        let mut api_keys = self.api_keys.write();
        let api_key = api_keys
            .get_mut(&id)
            .ok_or_else(|| ControlPlaneError::NotFound(format!("api key {id}")))?;
        api_key.status = popsigner_core::ApiKeyStatus::Revoked;
        Ok(())
    }

    async fn touch_last_used(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), ControlPlaneError> {
        let mut api_keys = self.api_keys.write();
        let api_key = api_keys
            .get_mut(&id)
            .ok_or_else(|| ControlPlaneError::NotFound(format!("api key {id}")))?;
        api_key.last_used_at = Some(at);
        Ok(())
    }
}

#[async_trait]
impl CertificateStore for MemoryStore {
    async fn create_certificate(&self, certificate: Certificate) -> Result<(), ControlPlaneError> {
        self.certificates.write().insert(certificate.id, certificate);
        Ok(())
    }

    async fn get_certificate(&self, id: Uuid) -> Result<Certificate, ControlPlaneError> {
        self.certificates
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| ControlPlaneError::NotFound(format!("certificate {id}")))
    }

    async fn list_certificates(&self, org_id: Uuid) -> Result<Vec<Certificate>, ControlPlaneError> {
        Ok(self
            .certificates
            .read()
            .values()
            .filter(|c| c.org_id == org_id)
            .cloned()
            .collect())
    }

    async fn revoke_certificate(&self, id: Uuid, reason: String, at: DateTime<Utc>) -> Result<(), ControlPlaneError> {
        let mut certificates = self.certificates.write();
        let certificate = certificates
            .get_mut(&id)
            .ok_or_else(|| ControlPlaneError::NotFound(format!("certificate {id}")))?;
        if certificate.revoked_at.is_none() {
            certificate.revoked_at = Some(at);
            certificate.revocation_reason = Some(reason);
        }
        Ok(())
    }

    async fn delete_certificate(&self, id: Uuid) -> Result<(), ControlPlaneError> {
        self.certificates.write().remove(&id);
        Ok(())
    }
}

#[async_trait]
impl AuditStore for MemoryStore {
    async fn append(&self, entry: AuditLog) -> Result<(), ControlPlaneError> {
        self.audit_logs.write().push(entry);
        Ok(())
    }

    async fn list(&self, org_id: Uuid, limit: i64) -> Result<Vec<AuditLog>, ControlPlaneError> {
        let mut entries: Vec<AuditLog> = self
            .audit_logs
            .read()
            .iter()
            .filter(|e| e.org_id == org_id)
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        entries.truncate(limit.max(0) as usize);
        Ok(entries)
    }

    async fn delete_older_than(&self, before: DateTime<Utc>) -> Result<u64, ControlPlaneError> {
        let mut logs = self.audit_logs.write();
        let before_len = logs.len();
        logs.retain(|e| e.created_at >= before);
        Ok((before_len - logs.len()) as u64)
    }
}

#[async_trait]
impl UsageStore for MemoryStore {
    async fn increment(
        &self,
        org_id: Uuid,
        metric: &str,
        period_start: DateTime<Utc>,
        delta: i64,
    ) -> Result<i64, ControlPlaneError> {
        let mut usage = self.usage.write();
        let entry = usage.entry((org_id, metric.to_string(), period_start)).or_insert(0);
        *entry += delta;
        Ok(*entry)
    }

    async fn get(&self, org_id: Uuid, metric: &str, period_start: DateTime<Utc>) -> Result<UsageCounter, ControlPlaneError> {
        let value = *self
            .usage
            .read()
            .get(&(org_id, metric.to_string(), period_start))
            .unwrap_or(&0);
        Ok(UsageCounter {
            org_id,
            metric: metric.to_string(),
            period_start,
            value,
        })
    }
}

#[async_trait]
impl InfraRegistryStore for MemoryStore {
    async fn record_factory_address(&self, org_id: Uuid, l1_chain_id: u64, address: String) -> Result<(), ControlPlaneError> {
        self.infra.write().entry((org_id, l1_chain_id)).or_default().push(address);
        Ok(())
    }

    async fn get_factory_addresses(&self, org_id: Uuid, l1_chain_id: u64) -> Result<Vec<String>, ControlPlaneError> {
        Ok(self.infra.read().get(&(org_id, l1_chain_id)).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl ChainIdAllocator for MemoryStore {
    async fn allocate(&self, l1_chain_id: u64) -> Result<u64, ControlPlaneError> {
        let mut seq = self.chain_seq.write();
        let next = seq.entry(l1_chain_id).or_insert(0);
        *next += 1;
        Ok(*next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use popsigner_core::Stack;
    use serde_json::json;

    fn sample_deployment(id: Uuid) -> Deployment {
        Deployment {
            id,
            org_id: Uuid::new_v4(),
            stack: Stack::Op,
            chain_id: 0,
            status: DeploymentStatus::Pending,
            stage: String::new(),
            error: None,
            config: json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn update_status_rejects_terminal_overwrite() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        store.create_deployment(sample_deployment(id)).await.unwrap();
        store
            .update_status(id, DeploymentStatus::Completed, Some("complete".into()))
            .await
            .unwrap();

        let err = store
            .update_status(id, DeploymentStatus::Running, Some("deploy_contracts".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlPlaneError::Terminal));
    }

    #[tokio::test]
    async fn record_transaction_is_idempotent_on_hash() {
        let store = MemoryStore::new();
        let deployment_id = Uuid::new_v4();
        let tx = Transaction {
            id: Uuid::new_v4(),
            deployment_id,
            stage: "deploy_contracts".into(),
            tx_hash: "0xabc".into(),
            from_address: "0x1".into(),
            to_address: "0x2".into(),
            role: "batcher".into(),
            block_number: None,
            status: TxStatus::Submitted,
            created_at: Utc::now(),
        };
        store.record_transaction(tx.clone()).await.unwrap();
        let mut second = tx;
        second.id = Uuid::new_v4();
        store.record_transaction(second).await.unwrap();

        let txs = store.get_transactions_by_deployment(deployment_id).await.unwrap();
        assert_eq!(txs.len(), 1);
    }

    #[tokio::test]
    async fn save_artifact_overwrites_by_key() {
        let store = MemoryStore::new();
        let deployment_id = Uuid::new_v4();
        store
            .save_artifact(Artifact {
                deployment_id,
                artifact_type: "addresses.json".into(),
                body: b"v1".to_vec(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        store
            .save_artifact(Artifact {
                deployment_id,
                artifact_type: "addresses.json".into(),
                body: b"v2".to_vec(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let artifact = store.get_artifact(deployment_id, "addresses.json").await.unwrap();
        assert_eq!(artifact.body, b"v2");
    }

    #[tokio::test]
    async fn chain_id_allocator_is_monotone_per_l1() {
        let store = MemoryStore::new();
        assert_eq!(store.allocate(1).await.unwrap(), 1);
        assert_eq!(store.allocate(1).await.unwrap(), 2);
        assert_eq!(store.allocate(5).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn usage_increment_accumulates_per_period() {
        let store = MemoryStore::new();
        let org_id = Uuid::new_v4();
        let period = Utc::now();
        assert_eq!(store.increment(org_id, "signatures", period, 1).await.unwrap(), 1);
        assert_eq!(store.increment(org_id, "signatures", period, 1).await.unwrap(), 2);
        let counter = store.get(org_id, "signatures", period).await.unwrap();
        assert_eq!(counter.value, 2);
    }
}
