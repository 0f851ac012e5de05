//! Parses the JSON transaction object accepted by `eth_signTransaction`
//! (legacy and EIP-1559 shapes), computes its signing hash, and re-encodes
//! the signed transaction as RLP once a signature has been produced.

use alloy_consensus::{SignableTransaction, TxEip1559, TxLegacy};
use alloy_eips::eip2718::Encodable2718;
use alloy_primitives::{Address, Bytes, PrimitiveSignature, TxKind, B256, U256};
use popsigner_core::ControlPlaneError;
use popsigner_signing::EvmSignature;
use serde::{Deserialize, Serialize};

/// Raw JSON shape of the `tx-obj` parameter to `eth_signTransaction`.
/// Covers both legacy (`gasPrice`) and EIP-1559 (`maxFeePerGas` +
/// `maxPriorityFeePerGas`) transactions; which shape is used is inferred
/// from which fields are present.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxRequest {
    /// Sender address; resolved to a key within the caller's org.
    pub from: String,
    /// Chain id, hex-encoded. `0x0` or absent selects legacy (non-EIP-155)
    /// signing.
    pub chain_id: Option<String>,
    pub nonce: String,
    pub gas: String,
    pub gas_price: Option<String>,
    pub max_fee_per_gas: Option<String>,
    pub max_priority_fee_per_gas: Option<String>,
    pub to: Option<String>,
    pub value: Option<String>,
    pub data: Option<String>,
}

/// An unsigned transaction plus the digest that must be signed to
/// authorize it.
pub enum UnsignedTx {
    Legacy(TxLegacy),
    Eip1559(TxEip1559),
}

impl UnsignedTx {
    /// The hash the signer must produce a signature over.
    pub fn signature_hash(&self) -> B256 {
        match self {
            Self::Legacy(tx) => tx.signature_hash(),
            Self::Eip1559(tx) => tx.signature_hash(),
        }
    }

    /// The transaction's chain id (`0` for a legacy, pre-EIP-155 tx).
    pub fn chain_id(&self) -> u64 {
        match self {
            Self::Legacy(tx) => tx.chain_id.unwrap_or(0),
            Self::Eip1559(tx) => tx.chain_id,
        }
    }

    /// Re-encodes this transaction as RLP (legacy) or a typed EIP-2718
    /// envelope (EIP-1559), bound to `signature`.
    pub fn into_signed_rlp(self, signature: PrimitiveSignature) -> Vec<u8> {
        match self {
            Self::Legacy(tx) => tx.into_signed(signature).encoded_2718(),
            Self::Eip1559(tx) => tx.into_signed(signature).encoded_2718(),
        }
    }
}

/// Parses a [`TxRequest`] into an [`UnsignedTx`], selecting the legacy or
/// EIP-1559 shape based on which gas-price fields are present.
pub fn parse_tx(req: &TxRequest) -> Result<UnsignedTx, ControlPlaneError> {
    let nonce = parse_u64(&req.nonce, "nonce")?;
    let gas_limit = parse_u64(&req.gas, "gas")?;
    let to = match &req.to {
        Some(addr) if !addr.is_empty() => TxKind::Call(parse_address(addr)?),
        _ => TxKind::Create,
    };
    let value = match &req.value {
        Some(v) => parse_u256(v, "value")?,
        None => U256::ZERO,
    };
    let input: Bytes = match &req.data {
        Some(d) => parse_bytes(d)?.into(),
        None => Bytes::new(),
    };

    if req.max_fee_per_gas.is_some() || req.max_priority_fee_per_gas.is_some() {
        let chain_id = req
            .chain_id
            .as_deref()
            .map(|c| parse_u64(c, "chainId"))
            .transpose()?
            .ok_or_else(|| ControlPlaneError::BadRequest("chainId is required for an EIP-1559 transaction".into()))?;
        let max_fee_per_gas = parse_u128(req.max_fee_per_gas.as_deref().unwrap_or("0x0"), "maxFeePerGas")?;
        let max_priority_fee_per_gas =
            parse_u128(req.max_priority_fee_per_gas.as_deref().unwrap_or("0x0"), "maxPriorityFeePerGas")?;

        Ok(UnsignedTx::Eip1559(TxEip1559 {
            chain_id,
            nonce,
            gas_limit,
            max_fee_per_gas,
            max_priority_fee_per_gas,
            to,
            value,
            access_list: Default::default(),
            input,
        }))
    } else {
        let gas_price = parse_u128(req.gas_price.as_deref().unwrap_or("0x0"), "gasPrice")?;
        let chain_id = match &req.chain_id {
            Some(c) => {
                let parsed = parse_u64(c, "chainId")?;
                if parsed == 0 {
                    None
                } else {
                    Some(parsed)
                }
            }
            None => None,
        };

        Ok(UnsignedTx::Legacy(TxLegacy {
            chain_id,
            nonce,
            gas_price,
            gas_limit,
            to,
            value,
            input,
        }))
    }
}

/// Converts the vault-derived `(v, r, s)` into an `alloy` [`PrimitiveSignature`].
///
/// `v` encodes EIP-155 chain-id replay protection or the legacy `27/28`
/// convention; both collapse to the same odd/even parity bit once the
/// chain id is known to the transaction itself, since `alloy` re-derives
/// `v` from `chain_id` and parity at encode time.
pub fn to_primitive_signature(sig: &EvmSignature) -> PrimitiveSignature {
    let odd_y_parity = sig.v % 2 == 0;
    PrimitiveSignature::new(U256::from_be_bytes(sig.r), U256::from_be_bytes(sig.s), odd_y_parity)
}

fn parse_u64(s: &str, field: &'static str) -> Result<u64, ControlPlaneError> {
    u64::from_str_radix(s.trim_start_matches("0x"), 16).map_err(|_| ControlPlaneError::BadRequest(format!("invalid hex for {field}: {s}")))
}

fn parse_u128(s: &str, field: &'static str) -> Result<u128, ControlPlaneError> {
    u128::from_str_radix(s.trim_start_matches("0x"), 16).map_err(|_| ControlPlaneError::BadRequest(format!("invalid hex for {field}: {s}")))
}

fn parse_u256(s: &str, field: &'static str) -> Result<U256, ControlPlaneError> {
    U256::from_str_radix(s.trim_start_matches("0x"), 16).map_err(|_| ControlPlaneError::BadRequest(format!("invalid hex for {field}: {s}")))
}

fn parse_address(s: &str) -> Result<Address, ControlPlaneError> {
    s.parse::<Address>().map_err(|_| ControlPlaneError::BadRequest(format!("invalid address: {s}")))
}

fn parse_bytes(s: &str) -> Result<Vec<u8>, ControlPlaneError> {
    hex::decode(s.trim_start_matches("0x")).map_err(|_| ControlPlaneError::BadRequest(format!("invalid hex data: {s}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn legacy_req() -> TxRequest {
        TxRequest {
            from: "0x0000000000000000000000000000000000000001".into(),
            chain_id: Some("0x5".into()),
            nonce: "0x0".into(),
            gas: "0x5208".into(),
            gas_price: Some("0x3b9aca00".into()),
            max_fee_per_gas: None,
            max_priority_fee_per_gas: None,
            to: Some("0x0000000000000000000000000000000000000002".into()),
            value: Some("0x1".into()),
            data: None,
        }
    }

    #[test]
    fn parses_legacy_with_eip155_chain_id() {
        let tx = parse_tx(&legacy_req()).unwrap();
        assert_eq!(tx.chain_id(), 5);
        assert!(matches!(tx, UnsignedTx::Legacy(_)));
    }

    #[test]
    fn parses_eip1559_when_fee_fields_present() {
        let mut req = legacy_req();
        req.gas_price = None;
        req.max_fee_per_gas = Some("0x3b9aca00".into());
        req.max_priority_fee_per_gas = Some("0x3b9aca00".into());
        let tx = parse_tx(&req).unwrap();
        assert!(matches!(tx, UnsignedTx::Eip1559(_)));
    }

    #[test]
    fn rejects_malformed_hex() {
        let mut req = legacy_req();
        req.nonce = "zz".into();
        assert!(parse_tx(&req).is_err());
    }

    #[test]
    fn signature_conversion_preserves_r_and_s() {
        let sig = EvmSignature { v: 28, r: [7; 32], s: [9; 32] };
        let converted = to_primitive_signature(&sig);
        assert_eq!(converted.r(), U256::from_be_bytes(sig.r));
        assert_eq!(converted.s(), U256::from_be_bytes(sig.s));
    }
}
