//! Translates a stack-specific role name (`batcher`, `proposer`, …) to a
//! concrete key id and address, creating a bound key on first use when the
//! deployment config does not supply an explicit override.

use popsigner_core::{Algorithm, ControlPlaneError, Key, Stack};
use popsigner_signing::SigningService;
use popsigner_store::KeyStore;
use std::sync::Arc;
use uuid::Uuid;

/// A resolved role: the key backing it plus its `0x`-prefixed address,
/// ready to hand to the JSON-RPC signer as a transaction's `from`.
#[derive(Debug, Clone)]
pub struct ResolvedRole {
    /// The role name this was resolved for, e.g. `"batcher"`.
    pub role: String,
    /// The backing key's id.
    pub key_id: Uuid,
    /// `0x`-prefixed Keccak-derived address.
    pub address: String,
}

/// Maps stack roles to keys, following the naming convention
/// `"<stack>-<role>"` and falling back to creating a fresh key when no
/// bound key exists yet and the caller supplied no override.
pub struct KeyResolver<S> {
    signing: Arc<SigningService<S>>,
}

impl<S> std::fmt::Debug for KeyResolver<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyResolver").finish_non_exhaustive()
    }
}

impl<S> KeyResolver<S>
where
    S: KeyStore,
{
    /// Builds a resolver over an already-constructed [`SigningService`].
    pub fn new(signing: Arc<SigningService<S>>) -> Self {
        Self { signing }
    }

    /// Resolves `role` for `(org_id, namespace_id, stack)`. If `overrides`
    /// names an explicit key id for this role, that key is used (and must
    /// be owned by `org_id`); otherwise the key named `"<stack>-<role>"`
    /// is looked up, creating a new secp256k1 key under that name if none
    /// exists.
    pub async fn resolve(
        &self,
        org_id: Uuid,
        namespace_id: Uuid,
        stack: Stack,
        role: &str,
        overrides: &std::collections::HashMap<String, Uuid>,
    ) -> Result<ResolvedRole, ControlPlaneError> {
        if let Some(&key_id) = overrides.get(role) {
            let key = self.signing.get(org_id, key_id).await?;
            return Ok(resolved(role, &key));
        }

        let name = format!("{}-{role}", stack_str(stack));
        match self.signing.list(org_id).await?.into_iter().find(|k| k.name == name) {
            Some(key) => Ok(resolved(role, &key)),
            None => {
                let key = self.signing.create(org_id, namespace_id, &name, Algorithm::Secp256k1, false).await?;
                Ok(resolved(role, &key))
            }
        }
    }

    /// Resolves every role in `roles`, in order, short-circuiting on the
    /// first failure.
    pub async fn resolve_all(
        &self,
        org_id: Uuid,
        namespace_id: Uuid,
        stack: Stack,
        roles: &[&str],
        overrides: &std::collections::HashMap<String, Uuid>,
    ) -> Result<Vec<ResolvedRole>, ControlPlaneError> {
        let mut out = Vec::with_capacity(roles.len());
        for role in roles {
            out.push(self.resolve(org_id, namespace_id, stack, role, overrides).await?);
        }
        Ok(out)
    }
}

fn resolved(role: &str, key: &Key) -> ResolvedRole {
    let address = key.eth_address.as_deref().map(|a| format!("0x{}", hex::encode(a))).unwrap_or_default();
    ResolvedRole { role: role.to_string(), key_id: key.id, address }
}

fn stack_str(stack: Stack) -> &'static str {
    match stack {
        Stack::Op => "op",
        Stack::Nitro => "nitro",
        Stack::Bundle => "bundle",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use popsigner_store::MemoryStore;
    use popsigner_vault::{CreateKeyRequest, ImportKeyRequest, VaultGateway, VaultKeyMaterial, VaultSignature};
    use std::collections::HashMap;

    struct StubVault;

    #[async_trait]
    impl VaultGateway for StubVault {
        async fn create_key(&self, _r: CreateKeyRequest) -> Result<VaultKeyMaterial, ControlPlaneError> {
            Ok(VaultKeyMaterial { public_key: vec![2; 33], address: vec![1; 20], eth_address: Some(vec![0xCD; 20]) })
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
        async fn read_kv(&self, _path: &str) -> Result<Option<serde_json::Value>, ControlPlaneError> {
            Ok(None)
        }
        async fn write_kv(&self, _path: &str, _value: serde_json::Value) -> Result<(), ControlPlaneError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn creates_key_on_first_resolve_and_reuses_it_after() {
        let store = Arc::new(MemoryStore::new());
        let signing = Arc::new(SigningService::new(store, Arc::new(StubVault), popsigner_signing::QuotaPolicy { signatures_per_month: 1000 }));
        let resolver = KeyResolver::new(signing);
        let org_id = Uuid::new_v4();
        let ns = Uuid::new_v4();

        let first = resolver.resolve(org_id, ns, Stack::Op, "batcher", &HashMap::new()).await.unwrap();
        let second = resolver.resolve(org_id, ns, Stack::Op, "batcher", &HashMap::new()).await.unwrap();
        assert_eq!(first.key_id, second.key_id);
        assert!(first.address.starts_with("0x"));
    }

    #[tokio::test]
    async fn honors_explicit_override() {
        let store = Arc::new(MemoryStore::new());
        let signing = Arc::new(SigningService::new(store, Arc::new(StubVault), popsigner_signing::QuotaPolicy { signatures_per_month: 1000 }));
        let resolver = KeyResolver::new(signing.clone());
        let org_id = Uuid::new_v4();
        let ns = Uuid::new_v4();

        let explicit = signing.create(org_id, ns, "my-custom-key", Algorithm::Secp256k1, false).await.unwrap();
        let mut overrides = HashMap::new();
        overrides.insert("proposer".to_string(), explicit.id);

        let resolved = resolver.resolve(org_id, ns, Stack::Op, "proposer", &overrides).await.unwrap();
        assert_eq!(resolved.key_id, explicit.id);
    }
}
