use chrono::Utc;
use popsigner_core::{ApiKey, ApiKeyScope, ApiKeyStatus, ControlPlaneError};
use popsigner_store::ApiKeyStore;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

const PREFIX_LEN: usize = 12;
const RAW_KEY_BYTES: usize = 32;

/// A freshly created API key, returned with its one-time raw secret.
#[derive(Debug, Clone)]
pub struct NewApiKey {
    /// The persisted row (only `key_prefix` and `hash`, never the secret).
    pub record: ApiKey,
    /// The raw bearer token. Returned exactly once; the caller is
    /// responsible for surfacing it to the user now, since it cannot be
    /// recovered later.
    pub raw_key: String,
}

/// Lifecycle and authentication for bearer API keys.
pub struct ApiKeyManager<S> {
    store: Arc<S>,
}

impl<S> std::fmt::Debug for ApiKeyManager<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeyManager").finish_non_exhaustive()
    }
}

impl<S> ApiKeyManager<S>
where
    S: ApiKeyStore,
{
    /// Builds a manager over `store`.
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Generates a new raw key, hashes it, and persists the row.
    pub async fn create(&self, org_id: Uuid, scopes: BTreeSet<ApiKeyScope>) -> Result<NewApiKey, ControlPlaneError> {
        let raw_key = generate_raw_key();
        let key_prefix = raw_key[..PREFIX_LEN].to_string();
        let hash = hash_raw_key(&raw_key);

        let record = ApiKey {
            id: Uuid::new_v4(),
            org_id,
            key_prefix,
            hash,
            scopes,
            status: ApiKeyStatus::Active,
            created_at: Utc::now(),
            last_used_at: None,
        };

        self.store.create_api_key(record.clone()).await?;
        Ok(NewApiKey { record, raw_key })
    }

    /// Revokes an API key.
    pub async fn revoke(&self, id: Uuid) -> Result<(), ControlPlaneError> {
        self.store.revoke_api_key(id).await
    }

    /// Validates a presented raw key: looks up candidates sharing its
    /// prefix, compares hashes, and rejects revoked keys. On success,
    /// records `last_used_at`.
    pub async fn authenticate(&self, raw_key: &str) -> Result<ApiKey, ControlPlaneError> {
        if raw_key.len() < PREFIX_LEN {
            return Err(ControlPlaneError::Unauthorized);
        }
        let prefix = &raw_key[..PREFIX_LEN];
        let hash = hash_raw_key(raw_key);

        let candidates = self.store.find_by_prefix(prefix).await?;
        let matched = candidates
            .into_iter()
            .find(|k| k.hash == hash)
            .ok_or(ControlPlaneError::Unauthorized)?;

        if matched.status != ApiKeyStatus::Active {
            return Err(ControlPlaneError::Unauthorized);
        }

        self.store.touch_last_used(matched.id, Utc::now()).await?;
        Ok(matched)
    }

    /// Validates a raw key and additionally requires it to carry `scope`.
    pub async fn authenticate_with_scope(&self, raw_key: &str, scope: ApiKeyScope) -> Result<ApiKey, ControlPlaneError> {
        let key = self.authenticate(raw_key).await?;
        if !key.scopes.contains(&scope) {
            return Err(ControlPlaneError::Forbidden(format!("missing required scope {scope:?}")));
        }
        Ok(key)
    }
}

fn generate_raw_key() -> String {
    let mut bytes = [0u8; RAW_KEY_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("psk_{}", hex::encode(bytes))
}

fn hash_raw_key(raw_key: &str) -> String {
    hex::encode(Sha256::digest(raw_key.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use popsigner_store::MemoryStore;

    #[tokio::test]
    async fn create_then_authenticate_round_trips() {
        let store = Arc::new(MemoryStore::new());
        let manager = ApiKeyManager::new(store);
        let org_id = Uuid::new_v4();
        let scopes: BTreeSet<ApiKeyScope> = [ApiKeyScope::KeysSign].into_iter().collect();

        let created = manager.create(org_id, scopes).await.unwrap();
        let authenticated = manager.authenticate(&created.raw_key).await.unwrap();
        assert_eq!(authenticated.id, created.record.id);
        assert!(authenticated.last_used_at.is_some());
    }

    #[tokio::test]
    async fn revoked_key_fails_authentication() {
        let store = Arc::new(MemoryStore::new());
        let manager = ApiKeyManager::new(store);
        let org_id = Uuid::new_v4();
        let created = manager.create(org_id, BTreeSet::new()).await.unwrap();

        manager.revoke(created.record.id).await.unwrap();
        let err = manager.authenticate(&created.raw_key).await.unwrap_err();
        assert!(matches!(err, ControlPlaneError::Unauthorized));
    }

    #[tokio::test]
    async fn scope_check_rejects_missing_scope() {
        let store = Arc::new(MemoryStore::new());
        let manager = ApiKeyManager::new(store);
        let org_id = Uuid::new_v4();
        let created = manager.create(org_id, BTreeSet::new()).await.unwrap();

        let err = manager
            .authenticate_with_scope(&created.raw_key, ApiKeyScope::KeysSign)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlPlaneError::Forbidden(_)));
    }
}
