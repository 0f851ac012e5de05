use async_trait::async_trait;
use chrono::{DateTime, Utc};
use popsigner_core::{
    Artifact, AuditLog, ApiKey, ApiKeyStatus, Certificate, ControlPlaneError, Deployment,
    DeploymentStatus, Key, Transaction, TxStatus, UsageCounter,
};
use uuid::Uuid;

/// Persists deployments, their per-stage transactions, and their artifacts.
///
/// `UpdateStatus` must fail with [`ControlPlaneError::Terminal`] when the
/// deployment is already `completed` or `failed`. `RecordTransaction` must be
/// idempotent on `tx_hash`. `SaveArtifact` is an upsert keyed on
/// `(deployment_id, type)`.
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    /// Inserts a new deployment row in `pending` status.
    async fn create_deployment(&self, deployment: Deployment) -> Result<(), ControlPlaneError>;

    /// Fetches a deployment by id.
    async fn get_deployment(&self, id: Uuid) -> Result<Deployment, ControlPlaneError>;

    /// Fetches a deployment by its assigned chain id.
    async fn get_by_chain_id(&self, chain_id: u64) -> Result<Deployment, ControlPlaneError>;

    /// Transitions `status` and optionally records a new `stage` label.
    /// Refuses to overwrite a terminal deployment.
    async fn update_status(
        &self,
        id: Uuid,
        status: DeploymentStatus,
        stage: Option<String>,
    ) -> Result<(), ControlPlaneError>;

    /// Records a failure and transitions to `failed` in one step.
    async fn set_error(&self, id: Uuid, message: String) -> Result<(), ControlPlaneError>;

    /// Lists every deployment currently in `status`.
    async fn list_by_status(&self, status: DeploymentStatus) -> Result<Vec<Deployment>, ControlPlaneError>;

    /// Lists every deployment, optionally scoped to one organization.
    async fn list_all(&self, org_id: Option<Uuid>) -> Result<Vec<Deployment>, ControlPlaneError>;

    /// Records a submitted transaction. A second call with the same
    /// `tx_hash` is a no-op.
    async fn record_transaction(&self, tx: Transaction) -> Result<(), ControlPlaneError>;

    /// Moves a previously recorded transaction to `confirmed` or `failed`,
    /// setting `block_number` on confirmation.
    async fn update_transaction_status(
        &self,
        tx_hash: &str,
        status: TxStatus,
        block_number: Option<u64>,
    ) -> Result<(), ControlPlaneError>;

    /// Lists every transaction recorded for a deployment, submission order.
    async fn get_transactions_by_deployment(&self, deployment_id: Uuid) -> Result<Vec<Transaction>, ControlPlaneError>;

    /// Looks up a single transaction by hash, if recorded.
    async fn get_transaction_by_hash(&self, tx_hash: &str) -> Result<Option<Transaction>, ControlPlaneError>;

    /// Upserts an artifact keyed on `(deployment_id, type)`.
    async fn save_artifact(&self, artifact: Artifact) -> Result<(), ControlPlaneError>;

    /// Fetches one artifact body.
    async fn get_artifact(&self, deployment_id: Uuid, artifact_type: &str) -> Result<Artifact, ControlPlaneError>;

    /// Lists every artifact recorded for a deployment, bodies included.
    async fn get_all_artifacts(&self, deployment_id: Uuid) -> Result<Vec<Artifact>, ControlPlaneError>;
}

/// Persists vault-backed key metadata. Private material never passes
/// through this trait.
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Inserts a new key row.
    async fn create_key(&self, key: Key) -> Result<(), ControlPlaneError>;

    /// Fetches a key by id.
    async fn get_key(&self, id: Uuid) -> Result<Key, ControlPlaneError>;

    /// Fetches a key by its org-unique name.
    async fn get_key_by_name(&self, org_id: Uuid, name: &str) -> Result<Key, ControlPlaneError>;

    /// Lists every key owned by an organization.
    async fn list_keys(&self, org_id: Uuid) -> Result<Vec<Key>, ControlPlaneError>;

    /// Deletes a key row. Weak reference: existing `Transaction` rows that
    /// name this key are left untouched.
    async fn delete_key(&self, id: Uuid) -> Result<(), ControlPlaneError>;
}

/// Persists bearer API-key credentials.
#[async_trait]
pub trait ApiKeyStore: Send + Sync {
    /// Inserts a new API key row.
    async fn create_api_key(&self, api_key: ApiKey) -> Result<(), ControlPlaneError>;

    /// Fetches an API key by id.
    async fn get_api_key(&self, id: Uuid) -> Result<ApiKey, ControlPlaneError>;

    /// Fetches every API key whose prefix matches, for hash verification
    /// against the presented raw key.
    async fn find_by_prefix(&self, key_prefix: &str) -> Result<Vec<ApiKey>, ControlPlaneError>;

    /// Lists every API key owned by an organization.
    async fn list_api_keys(&self, org_id: Uuid) -> Result<Vec<ApiKey>, ControlPlaneError>;

    /// Marks an API key `revoked`.
    async fn revoke_api_key(&self, id: Uuid) -> Result<(), ControlPlaneError>;

    /// Records a successful authentication.
    async fn touch_last_used(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), ControlPlaneError>;
}

/// Persists issued mTLS client certificates.
#[async_trait]
pub trait CertificateStore: Send + Sync {
    /// Inserts a newly issued certificate row.
    async fn create_certificate(&self, certificate: Certificate) -> Result<(), ControlPlaneError>;

    /// Fetches a certificate by id.
    async fn get_certificate(&self, id: Uuid) -> Result<Certificate, ControlPlaneError>;

    /// Lists every certificate owned by an organization.
    async fn list_certificates(&self, org_id: Uuid) -> Result<Vec<Certificate>, ControlPlaneError>;

    /// Sets `revoked_at`/`revocation_reason`. Idempotent if already revoked.
    async fn revoke_certificate(&self, id: Uuid, reason: String, at: DateTime<Utc>) -> Result<(), ControlPlaneError>;

    /// Deletes a certificate row. Callers must enforce the
    /// revoked-before-delete precondition; the store does not.
    async fn delete_certificate(&self, id: Uuid) -> Result<(), ControlPlaneError>;
}

/// Appends audit events. No update or delete by id; retention is a bulk
/// operation only.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Appends one audit entry.
    async fn append(&self, entry: AuditLog) -> Result<(), ControlPlaneError>;

    /// Lists audit entries for an organization, newest first.
    async fn list(&self, org_id: Uuid, limit: i64) -> Result<Vec<AuditLog>, ControlPlaneError>;

    /// Deletes every entry older than `before`, for retention enforcement.
    async fn delete_older_than(&self, before: DateTime<Utc>) -> Result<u64, ControlPlaneError>;
}

/// Increment-only per-organization usage counters.
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Atomically adds `delta` to the counter for `(org_id, metric,
    /// period_start)`, creating it at zero first if absent, and returns the
    /// value after increment.
    async fn increment(
        &self,
        org_id: Uuid,
        metric: &str,
        period_start: DateTime<Utc>,
        delta: i64,
    ) -> Result<i64, ControlPlaneError>;

    /// Reads the current value without mutating it.
    async fn get(&self, org_id: Uuid, metric: &str, period_start: DateTime<Utc>) -> Result<UsageCounter, ControlPlaneError>;
}

/// Registry of rollup-factory addresses deployed per `(org_id,
/// l1_chain_id)`, consulted by the Nitro+DA orchestrator's `persist_infra`
/// stage so a future deployment against the same L1 can reuse the factory
/// instead of redeploying it.
#[async_trait]
pub trait InfraRegistryStore: Send + Sync {
    /// Appends a newly deployed factory address.
    async fn record_factory_address(&self, org_id: Uuid, l1_chain_id: u64, address: String) -> Result<(), ControlPlaneError>;

    /// Lists every factory address recorded for `(org_id, l1_chain_id)`, in
    /// the order they were recorded.
    async fn get_factory_addresses(&self, org_id: Uuid, l1_chain_id: u64) -> Result<Vec<String>, ControlPlaneError>;
}

/// Allocates globally unique `chain_id` values, one monotone sequence per
/// L1 network.
#[async_trait]
pub trait ChainIdAllocator: Send + Sync {
    /// Returns the next unused chain id for `l1_chain_id`.
    async fn allocate(&self, l1_chain_id: u64) -> Result<u64, ControlPlaneError>;
}
