//! A thin JSON-RPC client against [`SIGNER_ENDPOINT`](popsigner_config),
//! used by stack orchestrator workers to call back into the Signing
//! Service without linking against it directly. Every call carries the
//! deployment's API key as a bearer credential.

use crate::tx::TxRequest;
use jsonrpsee::core::client::ClientT;
use jsonrpsee::http_client::{HeaderMap, HeaderValue, HttpClient, HttpClientBuilder};
use jsonrpsee::rpc_params;
use popsigner_core::ControlPlaneError;
use std::time::Duration;

/// Client for the four methods the JSON-RPC signer endpoint exposes.
#[derive(Debug, Clone)]
pub struct SignerClient {
    inner: HttpClient,
}

impl SignerClient {
    /// Builds a client against `endpoint`, authenticating every call with
    /// `api_key` as `X-API-Key`.
    pub fn new(endpoint: &str, api_key: &str, timeout: Duration) -> Result<Self, ControlPlaneError> {
        let mut headers = HeaderMap::new();
        let value = HeaderValue::from_str(api_key).map_err(|e| ControlPlaneError::Internal(format!("invalid api key header: {e}")))?;
        headers.insert("X-API-Key", value);

        let inner = HttpClientBuilder::default()
            .set_headers(headers)
            .request_timeout(timeout)
            .build(endpoint)
            .map_err(|e| ControlPlaneError::Internal(format!("failed to build signer rpc client: {e}")))?;

        Ok(Self { inner })
    }

    /// Calls `health_status`.
    pub async fn health_status(&self) -> Result<String, ControlPlaneError> {
        self.inner.request("health_status", rpc_params![]).await.map_err(map_rpc_error)
    }

    /// Calls `eth_signTransaction`, returning the `0x`-prefixed signed RLP.
    pub async fn sign_transaction(&self, tx: &TxRequest) -> Result<String, ControlPlaneError> {
        self.inner.request("eth_signTransaction", rpc_params![tx]).await.map_err(map_rpc_error)
    }

    /// Calls `personal_sign(data, address)`.
    pub async fn personal_sign(&self, data_hex: &str, address: &str) -> Result<String, ControlPlaneError> {
        self.inner.request("personal_sign", rpc_params![data_hex, address]).await.map_err(map_rpc_error)
    }
}

fn map_rpc_error(err: jsonrpsee::core::ClientError) -> ControlPlaneError {
    match &err {
        jsonrpsee::core::ClientError::Call(call) => match call.code() {
            -32001 => ControlPlaneError::NotFound(call.message().to_string()),
            -32003 => ControlPlaneError::Unauthorized,
            -32602 => ControlPlaneError::BadRequest(call.message().to_string()),
            _ => ControlPlaneError::Transient(call.message().to_string()),
        },
        other => ControlPlaneError::Transient(other.to_string()),
    }
}
