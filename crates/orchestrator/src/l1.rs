//! Minimal JSON-RPC client against the L1 chain a deployment targets.
//! Scope is deliberately narrow: broadcast a signed transaction, read back
//! its receipt, and read the current head — exactly what `deploy_contracts`
//! and `wait_confirmations` need. The orchestrator never executes
//! contract bytecode itself; it only observes what the L1 node reports.

use async_trait::async_trait;
use popsigner_core::ControlPlaneError;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

/// A confirmed (or still-pending) transaction receipt, as reported by the
/// L1 node.
#[derive(Debug, Clone)]
pub struct TxReceipt {
    /// Block the transaction was mined in, if any.
    pub block_number: Option<u64>,
    /// Whether the transaction succeeded (`status == 0x1`).
    pub success: bool,
    /// The deployed contract's address, if this receipt is for a
    /// contract-creation transaction (`to` was null).
    pub contract_address: Option<String>,
}

/// The L1 RPC capability a stack orchestrator needs.
#[async_trait]
pub trait L1Client: Send + Sync {
    /// Returns the next unused nonce for `address`.
    async fn transaction_count(&self, address: &str) -> Result<u64, ControlPlaneError>;

    /// Broadcasts a signed, RLP-encoded transaction and returns its hash.
    async fn send_raw_transaction(&self, raw_tx_hex: &str) -> Result<String, ControlPlaneError>;

    /// Fetches the receipt for `tx_hash`, or `None` if not yet mined.
    async fn transaction_receipt(&self, tx_hash: &str) -> Result<Option<TxReceipt>, ControlPlaneError>;

    /// Returns the current L1 head block number.
    async fn block_number(&self) -> Result<u64, ControlPlaneError>;
}

/// A plain JSON-RPC-over-HTTP [`L1Client`].
#[derive(Debug, Clone)]
pub struct HttpL1Client {
    client: Client,
    endpoint: String,
}

impl HttpL1Client {
    /// Builds a client against `endpoint` (a standard `eth_*` JSON-RPC
    /// node URL), with the 20-minute per-call ceiling the design document
    /// allows for an L1 wait.
    pub fn new(endpoint: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .expect("l1 http client config is static and always valid");
        Self { client, endpoint: endpoint.into() }
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, ControlPlaneError> {
        let body = json!({ "jsonrpc": "2.0", "id": 1, "method": method, "params": params });
        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| ControlPlaneError::Transient(format!("l1 rpc transport error: {e}")))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(ControlPlaneError::Transient(format!("l1 rpc returned {status}")));
        }
        if !status.is_success() {
            return Err(ControlPlaneError::Internal(format!("l1 rpc returned {status}")));
        }

        let envelope: RpcEnvelope = response.json().await.map_err(|e| ControlPlaneError::Internal(format!("malformed l1 rpc response: {e}")))?;
        if let Some(error) = envelope.error {
            return Err(classify_rpc_error(&error));
        }
        envelope.result.ok_or_else(|| ControlPlaneError::Internal("l1 rpc response had neither result nor error".into()))
    }
}

#[derive(Deserialize)]
struct RpcEnvelope {
    result: Option<Value>,
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// Revert and nonce/funds failures are never transient; everything else
/// (rate limiting, internal node errors) is retried by the caller's
/// backoff policy.
fn classify_rpc_error(error: &RpcErrorBody) -> ControlPlaneError {
    let msg = error.message.to_lowercase();
    if msg.contains("revert") || msg.contains("nonce too low") || msg.contains("insufficient funds") {
        ControlPlaneError::BadRequest(error.message.clone())
    } else if error.code == -32005 || msg.contains("rate limit") || msg.contains("too many requests") {
        ControlPlaneError::Transient(error.message.clone())
    } else {
        ControlPlaneError::Transient(error.message.clone())
    }
}

#[async_trait]
impl L1Client for HttpL1Client {
    async fn transaction_count(&self, address: &str) -> Result<u64, ControlPlaneError> {
        let result = self.call("eth_getTransactionCount", json!([address, "pending"])).await?;
        parse_hex_u64(&result)
    }

    async fn send_raw_transaction(&self, raw_tx_hex: &str) -> Result<String, ControlPlaneError> {
        let result = self.call("eth_sendRawTransaction", json!([raw_tx_hex])).await?;
        result.as_str().map(|s| s.to_string()).ok_or_else(|| ControlPlaneError::Internal("eth_sendRawTransaction returned a non-string result".into()))
    }

    async fn transaction_receipt(&self, tx_hash: &str) -> Result<Option<TxReceipt>, ControlPlaneError> {
        let result = self.call("eth_getTransactionReceipt", json!([tx_hash])).await?;
        if result.is_null() {
            return Ok(None);
        }
        let block_number = result.get("blockNumber").and_then(|v| v.as_str()).map(parse_hex_u64_str).transpose()?;
        let status = result.get("status").and_then(|v| v.as_str()).map(parse_hex_u64_str).transpose()?;
        let contract_address = result.get("contractAddress").and_then(|v| v.as_str()).filter(|s| !s.is_empty()).map(str::to_string);
        Ok(Some(TxReceipt { block_number, success: status == Some(1), contract_address }))
    }

    async fn block_number(&self) -> Result<u64, ControlPlaneError> {
        let result = self.call("eth_blockNumber", json!([])).await?;
        parse_hex_u64(&result)
    }
}

fn parse_hex_u64(value: &Value) -> Result<u64, ControlPlaneError> {
    value.as_str().map(parse_hex_u64_str).ok_or_else(|| ControlPlaneError::Internal("expected a hex-string result".into()))?
}

fn parse_hex_u64_str(s: &str) -> Result<u64, ControlPlaneError> {
    u64::from_str_radix(s.trim_start_matches("0x"), 16).map_err(|_| ControlPlaneError::Internal(format!("malformed hex integer: {s}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_revert_as_bad_request() {
        let err = classify_rpc_error(&RpcErrorBody { code: 3, message: "execution reverted: insufficient balance".into() });
        assert!(matches!(err, ControlPlaneError::BadRequest(_)));
    }

    #[test]
    fn classifies_rate_limit_as_transient() {
        let err = classify_rpc_error(&RpcErrorBody { code: -32005, message: "too many requests".into() });
        assert!(matches!(err, ControlPlaneError::Transient(_)));
    }

    #[test]
    fn parses_hex_block_number() {
        assert_eq!(parse_hex_u64_str("0x10").unwrap(), 16);
    }
}
