//! EIP-155 signature assembly from a raw vault-returned ECDSA signature.

use popsigner_core::ControlPlaneError;

/// The `(v, r, s)` triple of an ECDSA signature over an EVM transaction or
/// message digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvmSignature {
    /// Recovery id, EIP-155-encoded when `chain_id != 0`, legacy
    /// (`27`/`28`) otherwise.
    pub v: u64,
    /// `r` component, big-endian.
    pub r: [u8; 32],
    /// `s` component, big-endian.
    pub s: [u8; 32],
}

/// Decodes a vault-returned secp256k1 signature (65 bytes: `r || s ||
/// recovery_id`, `recovery_id ∈ {0, 1}`) into an [`EvmSignature`], applying
/// EIP-155 chain-id encoding when `chain_id != 0`.
pub fn decode_evm_signature(raw: &[u8], chain_id: u64) -> Result<EvmSignature, ControlPlaneError> {
    if raw.len() != 65 {
        return Err(ControlPlaneError::Internal(format!(
            "expected a 65-byte vault signature, got {} bytes",
            raw.len()
        )));
    }
    let mut r = [0u8; 32];
    let mut s = [0u8; 32];
    r.copy_from_slice(&raw[0..32]);
    s.copy_from_slice(&raw[32..64]);
    let recovery_id = raw[64] as u64;

    let v = if chain_id == 0 {
        27 + recovery_id
    } else {
        chain_id * 2 + 35 + recovery_id
    };

    Ok(EvmSignature { v, r, s })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_v_is_27_or_28() {
        let mut raw = vec![0u8; 65];
        raw[64] = 1;
        let sig = decode_evm_signature(&raw, 0).unwrap();
        assert_eq!(sig.v, 28);
    }

    #[test]
    fn eip155_v_embeds_chain_id() {
        let mut raw = vec![0u8; 65];
        raw[64] = 0;
        let sig = decode_evm_signature(&raw, 11155111).unwrap();
        assert_eq!(sig.v, 11155111 * 2 + 35);
    }

    #[test]
    fn rejects_wrong_length() {
        let raw = vec![0u8; 64];
        assert!(decode_evm_signature(&raw, 1).is_err());
    }
}
