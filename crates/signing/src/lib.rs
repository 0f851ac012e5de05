//! Policy-checked signing of arbitrary payloads and EIP-155 transactions.
//!
//! The Signing Service is the only component that is allowed to call
//! [`VaultGateway::sign`]; every other component reaches the vault's signing
//! capability through here so that quota enforcement, audit logging, and
//! usage accounting happen exactly once per signature.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

mod evm;

pub use evm::EvmSignature;

use chrono::{DateTime, Datelike, TimeZone, Utc};
use popsigner_core::{Algorithm, ApiKeyScope, AuditLog, ControlPlaneError, Key};
use popsigner_metrics::SigningMetrics;
use popsigner_store::{AuditStore, KeyStore, UsageStore};
use popsigner_vault::{CreateKeyRequest, ImportKeyRequest, VaultGateway};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

/// Digest size, in bytes, an algorithm expects when `prehashed = true`.
fn digest_size(algorithm: Algorithm) -> usize {
    match algorithm {
        Algorithm::Secp256k1 => 32,
        Algorithm::Ed25519 => 64,
    }
}

/// Result of a single `Sign` call.
#[derive(Debug, Clone)]
pub struct SignResult {
    /// Raw signature bytes, vault-encoded.
    pub signature: Vec<u8>,
    /// The signer's public key.
    pub public_key: Vec<u8>,
}

/// One request within a [`SigningService::sign_batch`] call.
#[derive(Debug, Clone)]
pub struct SignRequest {
    /// Key to sign with.
    pub key_id: Uuid,
    /// Payload to sign (already hashed iff `prehashed`).
    pub payload: Vec<u8>,
    /// Whether `payload` is already a digest.
    pub prehashed: bool,
}

/// Monthly signing quota enforced absent a richer plan system. The design
/// document does not specify per-plan overrides, so one value applies
/// uniformly per organization.
#[derive(Debug, Clone, Copy)]
pub struct QuotaPolicy {
    /// Maximum `signatures` increments allowed per calendar month.
    pub signatures_per_month: i64,
}

/// Context identifying the caller for audit and quota purposes.
#[derive(Debug, Clone)]
pub struct CallerContext {
    /// Organization the caller's API key belongs to.
    pub org_id: Uuid,
    /// The API key's own id, used as the audit actor.
    pub actor_id: String,
    /// Caller IP, if known.
    pub ip: Option<String>,
    /// Caller user agent, if known.
    pub ua: Option<String>,
}

/// Policy-checked signing over vault-backed keys.
pub struct SigningService<S> {
    store: Arc<S>,
    vault: Arc<dyn VaultGateway>,
    metrics: SigningMetrics,
    quota: QuotaPolicy,
}

impl<S> std::fmt::Debug for SigningService<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningService").finish_non_exhaustive()
    }
}

/// Start of the calendar month containing `at`, used as the usage-counter
/// `period_start`.
pub fn month_start(at: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(at.year(), at.month(), 1, 0, 0, 0).single().unwrap_or(at)
}

impl<S> SigningService<S>
where
    S: KeyStore + AuditStore + UsageStore,
{
    /// Builds a signing service backed by `store` (implementing every
    /// repository trait the service needs) and `vault`.
    pub fn new(store: Arc<S>, vault: Arc<dyn VaultGateway>, quota: QuotaPolicy) -> Self {
        Self {
            store,
            vault,
            metrics: SigningMetrics::new(),
            quota,
        }
    }

    /// Creates a new key: material first in the vault, then the metadata
    /// row. On DB failure after the vault call succeeds, best-effort
    /// deletes the vault entry and returns [`ControlPlaneError::Inconsistent`]
    /// so the caller can retry the whole logical operation.
    pub async fn create(
        &self,
        org_id: Uuid,
        namespace_id: Uuid,
        name: &str,
        algorithm: Algorithm,
        exportable: bool,
    ) -> Result<Key, ControlPlaneError> {
        let id = Uuid::new_v4();
        let key_ref = vault_key_ref(org_id, id);

        let material = self
            .vault
            .create_key(CreateKeyRequest {
                key_ref: key_ref.clone(),
                algorithm,
            })
            .await?;

        let key = Key {
            id,
            org_id,
            namespace_id,
            name: name.to_string(),
            algorithm,
            public_key: material.public_key,
            address: material.address,
            eth_address: material.eth_address,
            exportable,
            version: 1,
            created_at: Utc::now(),
        };

        if let Err(err) = self.store.create_key(key.clone()).await {
            if let Err(cleanup_err) = self.vault.delete_key(&key_ref).await {
                tracing::warn!(%cleanup_err, %key_ref, "failed to roll back vault key after db insert failure");
            }
            return Err(ControlPlaneError::Inconsistent(format!(
                "key {id} created in vault but not persisted: {err}"
            )));
        }

        Ok(key)
    }

    /// Creates `count` keys named `<prefix>-0`, `<prefix>-1`, ... `count`
    /// must be in `1..=100`.
    pub async fn create_batch(
        &self,
        org_id: Uuid,
        namespace_id: Uuid,
        prefix: &str,
        count: u32,
        algorithm: Algorithm,
        exportable: bool,
    ) -> Result<Vec<Key>, ControlPlaneError> {
        if !(1..=100).contains(&count) {
            return Err(ControlPlaneError::BadRequest(format!(
                "count must be between 1 and 100, got {count}"
            )));
        }
        let mut keys = Vec::with_capacity(count as usize);
        for i in 0..count {
            let name = format!("{prefix}-{i}");
            keys.push(self.create(org_id, namespace_id, &name, algorithm, exportable).await?);
        }
        Ok(keys)
    }

    /// Imports externally generated key material.
    pub async fn import(
        &self,
        org_id: Uuid,
        namespace_id: Uuid,
        name: &str,
        algorithm: Algorithm,
        private_key: Vec<u8>,
        exportable: bool,
    ) -> Result<Key, ControlPlaneError> {
        let id = Uuid::new_v4();
        let key_ref = vault_key_ref(org_id, id);

        let material = self
            .vault
            .import_key(ImportKeyRequest {
                key_ref: key_ref.clone(),
                algorithm,
                private_key,
            })
            .await?;

        let key = Key {
            id,
            org_id,
            namespace_id,
            name: name.to_string(),
            algorithm,
            public_key: material.public_key,
            address: material.address,
            eth_address: material.eth_address,
            exportable,
            version: 1,
            created_at: Utc::now(),
        };

        if let Err(err) = self.store.create_key(key.clone()).await {
            if let Err(cleanup_err) = self.vault.delete_key(&key_ref).await {
                tracing::warn!(%cleanup_err, %key_ref, "failed to roll back vault key after db insert failure");
            }
            return Err(ControlPlaneError::Inconsistent(format!(
                "key {id} imported into vault but not persisted: {err}"
            )));
        }

        Ok(key)
    }

    /// Exports private key material. Consults only the stored row's
    /// `exportable` flag, never the vault's own notion of exportability.
    pub async fn export(&self, org_id: Uuid, key_id: Uuid) -> Result<Vec<u8>, ControlPlaneError> {
        let key = self.owned_key(org_id, key_id).await?;
        if !key.exportable {
            return Err(ControlPlaneError::Forbidden(format!("key {key_id} is not exportable")));
        }
        self.vault.export_key(&vault_key_ref(org_id, key_id)).await
    }

    /// Deletes a key. Succeeds even if the vault has already forgotten it.
    pub async fn delete(&self, org_id: Uuid, key_id: Uuid) -> Result<(), ControlPlaneError> {
        self.owned_key(org_id, key_id).await?;
        match self.vault.delete_key(&vault_key_ref(org_id, key_id)).await {
            Ok(()) => {}
            Err(err) if err.kind() == popsigner_core::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        self.store.delete_key(key_id).await
    }

    /// Fetches a key owned by `org_id`.
    pub async fn get(&self, org_id: Uuid, key_id: Uuid) -> Result<Key, ControlPlaneError> {
        self.owned_key(org_id, key_id).await
    }

    /// Lists every key owned by `org_id`.
    pub async fn list(&self, org_id: Uuid) -> Result<Vec<Key>, ControlPlaneError> {
        self.store.list_keys(org_id).await
    }

    async fn owned_key(&self, org_id: Uuid, key_id: Uuid) -> Result<Key, ControlPlaneError> {
        let key = self.store.get_key(key_id).await?;
        if key.org_id != org_id {
            return Err(ControlPlaneError::Forbidden(format!("key {key_id} is not owned by this organization")));
        }
        Ok(key)
    }

    /// Signs an arbitrary payload, checking quota and recording audit/usage
    /// effects iff the vault call succeeds.
    pub async fn sign(&self, caller: &CallerContext, key_id: Uuid, payload: &[u8], prehashed: bool) -> Result<SignResult, ControlPlaneError> {
        let key = self.owned_key(caller.org_id, key_id).await?;

        if prehashed && payload.len() != digest_size(key.algorithm) {
            return Err(ControlPlaneError::BadRequest(format!(
                "prehashed payload must be {} bytes for {:?}, got {}",
                digest_size(key.algorithm),
                key.algorithm,
                payload.len()
            )));
        }

        let now = Utc::now();
        let period_start = month_start(now);
        let current = self.store.get(caller.org_id, "signatures", period_start).await?;
        if current.value >= self.quota.signatures_per_month {
            self.metrics.quota_rejections_total.increment(1);
            return Err(ControlPlaneError::QuotaExceeded(format!(
                "signatures_per_month limit of {} reached",
                self.quota.signatures_per_month
            )));
        }

        let key_ref = vault_key_ref(caller.org_id, key_id);
        let signature = self.vault.sign(&key_ref, payload).await?;

        self.store.increment(caller.org_id, "signatures", period_start, 1).await?;
        self.metrics.signatures_total.increment(1);
        self.audit(caller, "key.signed", "key", &key_id.to_string(), json!({ "prehashed": prehashed }))
            .await;

        Ok(SignResult {
            signature: signature.signature,
            public_key: signature.public_key,
        })
    }

    /// Signs `digest` (already hashed by the caller) producing an EIP-155
    /// signature if `chain_id != 0`, or a legacy `v ∈ {27, 28}` signature
    /// otherwise.
    pub async fn sign_evm(&self, caller: &CallerContext, key_id: Uuid, digest: [u8; 32], chain_id: u64) -> Result<EvmSignature, ControlPlaneError> {
        let result = self.sign(caller, key_id, &digest, true).await?;
        evm::decode_evm_signature(&result.signature, chain_id)
    }

    /// Signs every request independently, isolating failures per-item and
    /// preserving input order.
    pub async fn sign_batch(&self, caller: &CallerContext, requests: Vec<SignRequest>) -> Vec<Result<SignResult, ControlPlaneError>> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            results.push(self.sign(caller, request.key_id, &request.payload, request.prehashed).await);
        }
        results
    }

    async fn audit(&self, caller: &CallerContext, event: &str, resource_type: &str, resource_id: &str, metadata: serde_json::Value) {
        let entry = AuditLog {
            id: Uuid::new_v4(),
            org_id: caller.org_id,
            event: event.to_string(),
            actor_id: caller.actor_id.clone(),
            actor_type: "api_key".to_string(),
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
            ip: caller.ip.clone(),
            ua: caller.ua.clone(),
            metadata,
            created_at: Utc::now(),
        };
        if let Err(err) = self.store.append(entry).await {
            tracing::warn!(%err, event, "failed to append audit entry");
        }
    }
}

/// Required scope for a signing call.
pub const SIGN_SCOPE: ApiKeyScope = ApiKeyScope::KeysSign;

fn vault_key_ref(org_id: Uuid, key_id: Uuid) -> String {
    format!("{org_id}/{key_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use popsigner_store::MemoryStore;
    use popsigner_vault::{VaultKeyMaterial, VaultSignature};

    struct StubVault {
        fail_create: bool,
    }

    #[async_trait]
    impl VaultGateway for StubVault {
        async fn create_key(&self, _request: CreateKeyRequest) -> Result<VaultKeyMaterial, ControlPlaneError> {
            if self.fail_create {
                return Err(ControlPlaneError::Transient("vault down".into()));
            }
            Ok(VaultKeyMaterial {
                public_key: vec![2; 33],
                address: vec![1; 20],
                eth_address: Some(vec![1; 20]),
            })
        }
        async fn import_key(&self, _request: ImportKeyRequest) -> Result<VaultKeyMaterial, ControlPlaneError> {
            unreachable!("not used in tests")
        }
        async fn sign(&self, _key_ref: &str, _payload: &[u8]) -> Result<VaultSignature, ControlPlaneError> {
            let mut sig = vec![0u8; 65];
            sig[31] = 1;
            sig[63] = 1;
            sig[64] = 0;
            Ok(VaultSignature {
                signature: sig,
                public_key: vec![2; 33],
            })
        }
        async fn export_key(&self, _key_ref: &str) -> Result<Vec<u8>, ControlPlaneError> {
            Ok(vec![9; 32])
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

    fn caller(org_id: Uuid) -> CallerContext {
        CallerContext {
            org_id,
            actor_id: "apikey-1".into(),
            ip: None,
            ua: None,
        }
    }

    #[tokio::test]
    async fn create_then_sign_increments_usage_and_audit() {
        let store = Arc::new(MemoryStore::new());
        let vault = Arc::new(StubVault { fail_create: false });
        let service = SigningService::new(store.clone(), vault, QuotaPolicy { signatures_per_month: 100 });

        let org_id = Uuid::new_v4();
        let key = service.create(org_id, Uuid::new_v4(), "batcher", Algorithm::Secp256k1, false).await.unwrap();

        let ctx = caller(org_id);
        service.sign(&ctx, key.id, &[7u8; 32], true).await.unwrap();

        let counter = store.get(org_id, "signatures", month_start(Utc::now())).await.unwrap();
        assert_eq!(counter.value, 1);

        let logs = store.list(org_id, 10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].event, "key.signed");
    }

    #[tokio::test]
    async fn sign_rejects_wrong_digest_size_when_prehashed() {
        let store = Arc::new(MemoryStore::new());
        let vault = Arc::new(StubVault { fail_create: false });
        let service = SigningService::new(store, vault, QuotaPolicy { signatures_per_month: 100 });
        let org_id = Uuid::new_v4();
        let key = service.create(org_id, Uuid::new_v4(), "k", Algorithm::Secp256k1, false).await.unwrap();

        let err = service.sign(&caller(org_id), key.id, &[1u8; 16], true).await.unwrap_err();
        assert!(matches!(err, ControlPlaneError::BadRequest(_)));
    }

    #[tokio::test]
    async fn sign_enforces_monthly_quota() {
        let store = Arc::new(MemoryStore::new());
        let vault = Arc::new(StubVault { fail_create: false });
        let service = SigningService::new(store.clone(), vault, QuotaPolicy { signatures_per_month: 1 });
        let org_id = Uuid::new_v4();
        let key = service.create(org_id, Uuid::new_v4(), "k", Algorithm::Secp256k1, false).await.unwrap();
        let ctx = caller(org_id);

        service.sign(&ctx, key.id, &[1u8; 32], true).await.unwrap();
        let err = service.sign(&ctx, key.id, &[2u8; 32], true).await.unwrap_err();
        assert!(matches!(err, ControlPlaneError::QuotaExceeded(_)));

        let counter = store.get(org_id, "signatures", month_start(Utc::now())).await.unwrap();
        assert_eq!(counter.value, 1);
    }

    #[tokio::test]
    async fn create_batch_rejects_out_of_range_counts() {
        let store = Arc::new(MemoryStore::new());
        let vault = Arc::new(StubVault { fail_create: false });
        let service = SigningService::new(store, vault, QuotaPolicy { signatures_per_month: 100 });
        let org_id = Uuid::new_v4();

        assert!(service.create_batch(org_id, Uuid::new_v4(), "k", 0, Algorithm::Secp256k1, false).await.is_err());
        assert!(service.create_batch(org_id, Uuid::new_v4(), "k", 101, Algorithm::Secp256k1, false).await.is_err());
        let created = service.create_batch(org_id, Uuid::new_v4(), "k", 3, Algorithm::Secp256k1, false).await.unwrap();
        assert_eq!(created.len(), 3);
    }

    #[tokio::test]
    async fn export_forbidden_when_not_exportable() {
        let store = Arc::new(MemoryStore::new());
        let vault = Arc::new(StubVault { fail_create: false });
        let service = SigningService::new(store, vault, QuotaPolicy { signatures_per_month: 100 });
        let org_id = Uuid::new_v4();
        let key = service.create(org_id, Uuid::new_v4(), "k", Algorithm::Secp256k1, false).await.unwrap();

        let err = service.export(org_id, key.id).await.unwrap_err();
        assert!(matches!(err, ControlPlaneError::Forbidden(_)));
    }
}
