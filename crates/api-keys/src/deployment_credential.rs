use crate::manager::ApiKeyManager;
use popsigner_core::{ApiKeyScope, ControlPlaneError};
use popsigner_store::ApiKeyStore;
use popsigner_vault::VaultGateway;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

fn kv_path(org_id: Uuid) -> String {
    format!("orgs/{org_id}/deployment-api-key")
}

/// Gets or creates the long-lived API key the Unified Orchestrator's stack
/// workers use to call back into the JSON-RPC signer, caching the raw key
/// in the vault's KV store so it survives process restarts.
pub struct DeploymentCredentialManager<S> {
    manager: ApiKeyManager<S>,
    vault: Arc<dyn VaultGateway>,
}

impl<S> std::fmt::Debug for DeploymentCredentialManager<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentCredentialManager").finish_non_exhaustive()
    }
}

impl<S> DeploymentCredentialManager<S>
where
    S: ApiKeyStore,
{
    /// Builds a manager over `store` (via an [`ApiKeyManager`]) and `vault`.
    pub fn new(store: Arc<S>, vault: Arc<dyn VaultGateway>) -> Self {
        Self {
            manager: ApiKeyManager::new(store),
            vault,
        }
    }

    /// Returns the raw deployment API key for `org_id`, creating and
    /// caching a new one if the cached key is missing, malformed, or
    /// revoked.
    pub async fn get_or_create(&self, org_id: Uuid) -> Result<String, ControlPlaneError> {
        let path = kv_path(org_id);

        if let Some(cached) = self.vault.read_kv(&path).await? {
            if let Some(raw) = cached.get("api_key").and_then(|v| v.as_str()) {
                if self.manager.authenticate(raw).await.is_ok() {
                    return Ok(raw.to_string());
                }
            }
        }

        let scopes = [ApiKeyScope::KeysSign, ApiKeyScope::KeysRead].into_iter().collect();
        let created = self.manager.create(org_id, scopes).await?;

        if let Err(err) = self.vault.write_kv(&path, json!({ "api_key": created.raw_key })).await {
            tracing::warn!(%err, %org_id, "failed to cache deployment api key in vault kv, will rotate next call");
        }

        Ok(created.raw_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use popsigner_store::MemoryStore;
    use popsigner_vault::{CreateKeyRequest, ImportKeyRequest, VaultKeyMaterial, VaultSignature};
    use std::collections::HashMap;

    #[derive(Default)]
    struct StubVault {
        kv: Mutex<HashMap<String, serde_json::Value>>,
    }

    #[async_trait]
    impl VaultGateway for StubVault {
        async fn create_key(&self, _r: CreateKeyRequest) -> Result<VaultKeyMaterial, ControlPlaneError> {
            unreachable!()
        }
        async fn import_key(&self, _r: ImportKeyRequest) -> Result<VaultKeyMaterial, ControlPlaneError> {
            unreachable!()
        }
        async fn sign(&self, _key_ref: &str, _payload: &[u8]) -> Result<VaultSignature, ControlPlaneError> {
            unreachable!()
        }
        async fn export_key(&self, _key_ref: &str) -> Result<Vec<u8>, ControlPlaneError> {
            unreachable!()
        }
        async fn delete_key(&self, _key_ref: &str) -> Result<(), ControlPlaneError> {
            Ok(())
        }
        async fn read_kv(&self, path: &str) -> Result<Option<serde_json::Value>, ControlPlaneError> {
            Ok(self.kv.lock().get(path).cloned())
        }
        async fn write_kv(&self, path: &str, value: serde_json::Value) -> Result<(), ControlPlaneError> {
            self.kv.lock().insert(path.to_string(), value);
            Ok(())
        }
    }

    #[tokio::test]
    async fn first_call_creates_and_caches() {
        let store = Arc::new(MemoryStore::new());
        let vault = Arc::new(StubVault::default());
        let manager = DeploymentCredentialManager::new(store, vault.clone());
        let org_id = Uuid::new_v4();

        let raw1 = manager.get_or_create(org_id).await.unwrap();
        let cached = vault.read_kv(&kv_path(org_id)).await.unwrap().unwrap();
        assert_eq!(cached["api_key"].as_str().unwrap(), raw1);
    }

    #[tokio::test]
    async fn rotates_after_revocation() {
        let store = Arc::new(MemoryStore::new());
        let vault = Arc::new(StubVault::default());
        let manager = DeploymentCredentialManager::new(store.clone(), vault.clone());
        let org_id = Uuid::new_v4();

        let raw1 = manager.get_or_create(org_id).await.unwrap();
        let key_manager = ApiKeyManager::new(store.clone());
        let key = key_manager.authenticate(&raw1).await.unwrap();
        key_manager.revoke(key.id).await.unwrap();

        let raw2 = manager.get_or_create(org_id).await.unwrap();
        assert_ne!(raw1, raw2);
        let cached = vault.read_kv(&kv_path(org_id)).await.unwrap().unwrap();
        assert_eq!(cached["api_key"].as_str().unwrap(), raw2);
    }
}
