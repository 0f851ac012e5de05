use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// A tenant. Exclusively owns its keys, API keys, certificates, namespaces,
/// deployments, audit entries, and usage counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    /// Primary key.
    pub id: Uuid,
    /// Display name.
    pub name: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// A named grouping of keys within an organization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Namespace {
    /// Primary key.
    pub id: Uuid,
    /// Owning organization.
    pub org_id: Uuid,
    /// Display name, unique per org.
    pub name: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// The family of contracts and off-chain processes comprising one kind of
/// L2 rollup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stack {
    /// Optimistic-rollup style stack.
    Op,
    /// Nitro-with-DA style stack.
    Nitro,
    /// Both stacks driven as one logical request.
    Bundle,
}

/// Lifecycle state of a [`Deployment`].
///
/// `Completed` and `Failed` are terminal: once reached, `status` and
/// `updated_at` must never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    /// Row created, no work dispatched yet.
    Pending,
    /// Stack orchestrator has started but not yet begun submitting txs.
    Initializing,
    /// Stack orchestrator is actively driving stages.
    Running,
    /// Terminal success.
    Completed,
    /// Terminal failure; `error` is set.
    Failed,
}

impl DeploymentStatus {
    /// Terminal states must not be overwritten.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One logical request that yields one L2 chain configured end-to-end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    /// Primary key.
    pub id: Uuid,
    /// Owning organization.
    pub org_id: Uuid,
    /// Which stack orchestrator drives this deployment.
    pub stack: Stack,
    /// Assigned chain id; zero until allocated. Unique across completed
    /// deployments once assigned, and never mutated thereafter.
    pub chain_id: u64,
    /// Current lifecycle state.
    pub status: DeploymentStatus,
    /// Free-form, stack-specific checkpoint label; last observed.
    pub stage: String,
    /// Set iff `status == Failed`.
    pub error: Option<String>,
    /// Opaque stack-typed configuration blob supplied at creation.
    pub config: serde_json::Value,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp; frozen once `status` is terminal.
    pub updated_at: DateTime<Utc>,
}

/// Status of a single recorded on-chain transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    /// Broadcast to L1, outcome unknown.
    Submitted,
    /// Observed with the required confirmation depth.
    Confirmed,
    /// Reverted, dropped, or otherwise terminally failed.
    Failed,
}

/// A transaction submitted by a stack orchestrator on behalf of a
/// deployment. `(deployment_id, tx_hash)` is unique; at most one `Confirmed`
/// row may exist per `(deployment_id, role, stage)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    /// Primary key.
    pub id: Uuid,
    /// Owning deployment.
    pub deployment_id: Uuid,
    /// Pipeline stage that submitted this transaction.
    pub stage: String,
    /// L1 transaction hash, hex-encoded with `0x` prefix.
    pub tx_hash: String,
    /// Signer-resolved sender address, hex-encoded with `0x` prefix.
    pub from_address: String,
    /// Recipient address, hex-encoded with `0x` prefix.
    pub to_address: String,
    /// Semantic participant this transaction was submitted for.
    pub role: String,
    /// Set once the transaction is observed confirmed.
    pub block_number: Option<u64>,
    /// Current observed status.
    pub status: TxStatus,
    /// Creation timestamp (submission time).
    pub created_at: DateTime<Utc>,
}

/// A file-shaped byproduct of a deployment, stored as bytes. Primary key is
/// `(deployment_id, type)`; a second `SaveArtifact` for the same key
/// overwrites the first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    /// Owning deployment.
    pub deployment_id: Uuid,
    /// Artifact kind, e.g. `"addresses.json"`.
    #[serde(rename = "type")]
    pub artifact_type: String,
    /// Raw contents.
    pub body: Vec<u8>,
    /// Creation (or last-overwrite) timestamp.
    pub created_at: DateTime<Utc>,
}

/// Signature algorithm backing a [`Key`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// secp256k1, used for EVM-compatible signing.
    Secp256k1,
    /// Ed25519.
    Ed25519,
}

/// A vault-backed signing key. Private material never leaves the vault;
/// this row is metadata plus public key material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Key {
    /// Primary key.
    pub id: Uuid,
    /// Owning organization.
    pub org_id: Uuid,
    /// Owning namespace.
    pub namespace_id: Uuid,
    /// Display name, unique per org.
    pub name: String,
    /// Signature algorithm.
    pub algorithm: Algorithm,
    /// Compressed public key bytes.
    pub public_key: Vec<u8>,
    /// 20-byte address hash.
    pub address: Vec<u8>,
    /// Keccak-derived Ethereum address; only set for `Secp256k1` keys.
    pub eth_address: Option<Vec<u8>>,
    /// Whether `Export` is permitted. Immutable after creation.
    pub exportable: bool,
    /// Monotone rotation counter.
    pub version: u32,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// A scope grantable to an [`ApiKey`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiKeyScope {
    /// Read key metadata.
    KeysRead,
    /// Create/rotate/delete keys.
    KeysWrite,
    /// Invoke signing operations.
    KeysSign,
    /// Export private key material.
    KeysExport,
    /// Read certificate metadata.
    CertificatesRead,
    /// Issue/revoke certificates.
    CertificatesWrite,
}

/// Lifecycle state of an [`ApiKey`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiKeyStatus {
    /// Usable for authentication.
    Active,
    /// No longer usable; retained for audit history.
    Revoked,
}

/// A bearer credential. Raw key material is returned exactly once, at
/// creation; every subsequent read exposes only `key_prefix`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    /// Primary key.
    pub id: Uuid,
    /// Owning organization.
    pub org_id: Uuid,
    /// First characters of the raw key, shown once at creation and
    /// thereafter for identification purposes.
    pub key_prefix: String,
    /// One-way hash of the full raw key.
    pub hash: String,
    /// Granted scopes.
    pub scopes: BTreeSet<ApiKeyScope>,
    /// Current status.
    pub status: ApiKeyStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Timestamp of last successful authentication, if any.
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Derived (never stored) lifecycle state of a [`Certificate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateStatus {
    /// Not revoked and not yet expired.
    Active,
    /// Explicitly revoked.
    Revoked,
    /// Past `expires_at`.
    Expired,
}

/// An mTLS client certificate issued by the PKI provider, bound to either an
/// organization or a specific deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Certificate {
    /// Primary key.
    pub id: Uuid,
    /// Owning organization.
    pub org_id: Uuid,
    /// Human-readable label, e.g. `"staging"`.
    pub name: String,
    /// Unique fingerprint of the issued certificate.
    pub fingerprint: String,
    /// CA-assigned serial number, hex-encoded.
    pub serial_number: String,
    /// `org_<org_id>` or `deployment_<id>`.
    pub common_name: String,
    /// PEM-encoded client certificate, retained for one-time download.
    pub client_cert: Vec<u8>,
    /// Issuance timestamp.
    pub issued_at: DateTime<Utc>,
    /// Expiry timestamp.
    pub expires_at: DateTime<Utc>,
    /// Set once revoked.
    pub revoked_at: Option<DateTime<Utc>>,
    /// Set once revoked.
    pub revocation_reason: Option<String>,
}

impl Certificate {
    /// Derives [`CertificateStatus`] from `revoked_at` and `expires_at`
    /// against the given instant. Never stored; always computed on read.
    pub fn status_at(&self, now: DateTime<Utc>) -> CertificateStatus {
        if self.revoked_at.is_some() {
            CertificateStatus::Revoked
        } else if now >= self.expires_at {
            CertificateStatus::Expired
        } else {
            CertificateStatus::Active
        }
    }
}

/// An append-only audit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLog {
    /// Primary key.
    pub id: Uuid,
    /// Owning organization.
    pub org_id: Uuid,
    /// Event name, e.g. `"key.signed"`.
    pub event: String,
    /// Acting principal id.
    pub actor_id: String,
    /// Acting principal kind, e.g. `"api_key"`.
    pub actor_type: String,
    /// Affected resource kind, e.g. `"key"`.
    pub resource_type: String,
    /// Affected resource id.
    pub resource_id: String,
    /// Caller IP, if known.
    pub ip: Option<String>,
    /// Caller user agent, if known.
    pub ua: Option<String>,
    /// Free-form structured context.
    pub metadata: serde_json::Value,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// An increment-only billing counter keyed by `(org_id, metric, period_start)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageCounter {
    /// Owning organization.
    pub org_id: Uuid,
    /// Metric name, e.g. `"signatures"`.
    pub metric: String,
    /// Start of the accounting period this counter covers.
    pub period_start: DateTime<Utc>,
    /// Current accumulated value.
    pub value: i64,
}
