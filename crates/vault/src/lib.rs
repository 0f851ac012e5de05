//! Adapter to the external secrets vault. The vault is treated as an opaque
//! capability: this crate never reasons about its internal storage, only
//! about the request/response shapes of the calls the control plane needs.
//! Private key material never crosses back out of the vault except through
//! the explicit `export_key` call, gated by the caller's own policy check.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

mod http;

pub use http::HttpVaultGateway;

use async_trait::async_trait;
use popsigner_core::{Algorithm, ControlPlaneError};
use serde_json::Value;

/// Parameters for creating a new key in the vault.
#[derive(Debug, Clone)]
pub struct CreateKeyRequest {
    /// Vault-addressable logical name, conventionally `<org_id>/<key_id>`.
    pub key_ref: String,
    /// Signature algorithm the vault should generate material for.
    pub algorithm: Algorithm,
}

/// Parameters for importing externally generated key material.
#[derive(Debug, Clone)]
pub struct ImportKeyRequest {
    /// Vault-addressable logical name.
    pub key_ref: String,
    /// Signature algorithm of `private_key`.
    pub algorithm: Algorithm,
    /// Raw private key bytes. Never logged.
    pub private_key: Vec<u8>,
}

/// Public material returned by a successful key creation or import.
#[derive(Debug, Clone)]
pub struct VaultKeyMaterial {
    /// Compressed public key bytes.
    pub public_key: Vec<u8>,
    /// Algorithm-appropriate address hash.
    pub address: Vec<u8>,
    /// Keccak-derived Ethereum address, set only for `Secp256k1` keys.
    pub eth_address: Option<Vec<u8>>,
}

/// Result of a signing call.
#[derive(Debug, Clone)]
pub struct VaultSignature {
    /// Raw signature bytes (algorithm-dependent encoding).
    pub signature: Vec<u8>,
    /// The signer's public key, echoed back for convenience.
    pub public_key: Vec<u8>,
}

/// The capability surface the control plane needs from the secrets vault.
///
/// Implementations must treat `key_ref`/KV `path` strings as opaque; they
/// are never parsed, only forwarded.
#[async_trait]
pub trait VaultGateway: Send + Sync {
    /// Generates new key material in the vault under `key_ref`.
    async fn create_key(&self, request: CreateKeyRequest) -> Result<VaultKeyMaterial, ControlPlaneError>;

    /// Imports externally generated key material under `key_ref`.
    async fn import_key(&self, request: ImportKeyRequest) -> Result<VaultKeyMaterial, ControlPlaneError>;

    /// Signs `payload` (already hashed by the caller when required) with
    /// the key at `key_ref`.
    async fn sign(&self, key_ref: &str, payload: &[u8]) -> Result<VaultSignature, ControlPlaneError>;

    /// Exports the raw private key material at `key_ref`. Callers must
    /// enforce the `exportable` policy themselves; the vault performs no
    /// such check.
    async fn export_key(&self, key_ref: &str) -> Result<Vec<u8>, ControlPlaneError>;

    /// Deletes the key at `key_ref`. A vault-side "not found" is treated as
    /// success, matching the idempotent-delete contract the signing
    /// service relies on.
    async fn delete_key(&self, key_ref: &str) -> Result<(), ControlPlaneError>;

    /// Reads a JSON document from the vault's KV store at `path`, or
    /// `None` if nothing is stored there.
    async fn read_kv(&self, path: &str) -> Result<Option<Value>, ControlPlaneError>;

    /// Writes a JSON document to the vault's KV store at `path`,
    /// overwriting any existing value.
    async fn write_kv(&self, path: &str, value: Value) -> Result<(), ControlPlaneError>;
}
