use crate::{CreateKeyRequest, ImportKeyRequest, VaultGateway, VaultKeyMaterial, VaultSignature};
use async_trait::async_trait;
use popsigner_core::{Algorithm, ControlPlaneError};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// HTTP-backed [`VaultGateway`]. Speaks a KV-v2-shaped secrets API plus a
/// `popsigner/keys/*` surface for key lifecycle and signing calls.
#[derive(Debug, Clone)]
pub struct HttpVaultGateway {
    client: Client,
    base_addr: String,
    token: String,
    namespace: Option<String>,
}

impl HttpVaultGateway {
    /// Builds a gateway against `base_addr`, authenticating every request
    /// with `token` and, if set, scoping to `namespace`.
    pub fn new(base_addr: impl Into<String>, token: impl Into<String>, namespace: Option<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .expect("vault http client config is static and always valid");
        Self {
            client,
            base_addr: base_addr.into(),
            token: token.into(),
            namespace,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_addr.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.header("X-Vault-Token", &self.token);
        match &self.namespace {
            Some(ns) => builder.header("X-Vault-Namespace", ns),
            None => builder,
        }
    }

    async fn map_response<T: for<'de> Deserialize<'de>>(response: reqwest::Response) -> Result<T, ControlPlaneError> {
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ControlPlaneError::NotFound("vault resource not found".into()));
        }
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ControlPlaneError::Transient(format!("vault returned {status}")));
        }
        if !status.is_success() {
            return Err(ControlPlaneError::Internal(format!("vault returned {status}")));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| ControlPlaneError::Internal(format!("malformed vault response: {e}")))
    }
}

fn algorithm_str(algorithm: Algorithm) -> &'static str {
    match algorithm {
        Algorithm::Secp256k1 => "secp256k1",
        Algorithm::Ed25519 => "ed25519",
    }
}

#[derive(Serialize)]
struct CreateKeyBody<'a> {
    algorithm: &'a str,
}

#[derive(Serialize)]
struct ImportKeyBody<'a> {
    algorithm: &'a str,
    private_key: String,
}

#[derive(Serialize)]
struct SignBody {
    payload: String,
}

#[derive(Deserialize)]
struct KeyMaterialResponse {
    public_key: String,
    address: String,
    eth_address: Option<String>,
}

impl KeyMaterialResponse {
    fn into_domain(self) -> Result<VaultKeyMaterial, ControlPlaneError> {
        Ok(VaultKeyMaterial {
            public_key: decode_hex(&self.public_key)?,
            address: decode_hex(&self.address)?,
            eth_address: self.eth_address.as_deref().map(decode_hex).transpose()?,
        })
    }
}

#[derive(Deserialize)]
struct SignResponse {
    signature: String,
    public_key: String,
}

#[derive(Deserialize)]
struct ExportResponse {
    private_key: String,
}

#[derive(Serialize)]
struct KvWriteBody {
    data: Value,
}

#[derive(Deserialize)]
struct KvReadResponse {
    data: KvReadData,
}

#[derive(Deserialize)]
struct KvReadData {
    data: Value,
}

fn decode_hex(s: &str) -> Result<Vec<u8>, ControlPlaneError> {
    hex::decode(s.trim_start_matches("0x")).map_err(|e| ControlPlaneError::Internal(format!("malformed vault hex payload: {e}")))
}

#[async_trait]
impl VaultGateway for HttpVaultGateway {
    async fn create_key(&self, request: CreateKeyRequest) -> Result<VaultKeyMaterial, ControlPlaneError> {
        let url = self.url(&format!("v1/popsigner/keys/{}", request.key_ref));
        let body = CreateKeyBody {
            algorithm: algorithm_str(request.algorithm),
        };
        let response = self
            .authed(self.client.post(url).json(&body))
            .send()
            .await
            .map_err(|e| ControlPlaneError::Transient(e.to_string()))?;
        Self::map_response::<KeyMaterialResponse>(response).await?.into_domain()
    }

    async fn import_key(&self, request: ImportKeyRequest) -> Result<VaultKeyMaterial, ControlPlaneError> {
        let url = self.url(&format!("v1/popsigner/keys/{}/import", request.key_ref));
        let body = ImportKeyBody {
            algorithm: algorithm_str(request.algorithm),
            private_key: hex::encode(request.private_key),
        };
        let response = self
            .authed(self.client.post(url).json(&body))
            .send()
            .await
            .map_err(|e| ControlPlaneError::Transient(e.to_string()))?;
        Self::map_response::<KeyMaterialResponse>(response).await?.into_domain()
    }

    async fn sign(&self, key_ref: &str, payload: &[u8]) -> Result<VaultSignature, ControlPlaneError> {
        let url = self.url(&format!("v1/popsigner/keys/{key_ref}/sign"));
        let body = SignBody {
            payload: hex::encode(payload),
        };
        let response = self
            .authed(self.client.post(url).json(&body))
            .send()
            .await
            .map_err(|e| ControlPlaneError::Transient(e.to_string()))?;
        let parsed: SignResponse = Self::map_response(response).await?;
        Ok(VaultSignature {
            signature: decode_hex(&parsed.signature)?,
            public_key: decode_hex(&parsed.public_key)?,
        })
    }

    async fn export_key(&self, key_ref: &str) -> Result<Vec<u8>, ControlPlaneError> {
        let url = self.url(&format!("v1/popsigner/keys/{key_ref}/export"));
        let response = self
            .authed(self.client.get(url))
            .send()
            .await
            .map_err(|e| ControlPlaneError::Transient(e.to_string()))?;
        let parsed: ExportResponse = Self::map_response(response).await?;
        decode_hex(&parsed.private_key)
    }

    async fn delete_key(&self, key_ref: &str) -> Result<(), ControlPlaneError> {
        let url = self.url(&format!("v1/popsigner/keys/{key_ref}"));
        let response = self
            .authed(self.client.delete(url))
            .send()
            .await
            .map_err(|e| ControlPlaneError::Transient(e.to_string()))?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(()),
            status if status.is_success() => Ok(()),
            status if status.is_server_error() => Err(ControlPlaneError::Transient(format!("vault returned {status}"))),
            status => Err(ControlPlaneError::Internal(format!("vault returned {status}"))),
        }
    }

    async fn read_kv(&self, path: &str) -> Result<Option<Value>, ControlPlaneError> {
        let url = self.url(&format!("v1/kv/data/{path}"));
        let response = self
            .authed(self.client.get(url))
            .send()
            .await
            .map_err(|e| ControlPlaneError::Transient(e.to_string()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let parsed: KvReadResponse = Self::map_response(response).await?;
        Ok(Some(parsed.data.data))
    }

    async fn write_kv(&self, path: &str, value: Value) -> Result<(), ControlPlaneError> {
        let url = self.url(&format!("v1/kv/data/{path}"));
        let body = KvWriteBody { data: value };
        let response = self
            .authed(self.client.put(url).json(&body))
            .send()
            .await
            .map_err(|e| ControlPlaneError::Transient(e.to_string()))?;
        if response.status().is_success() {
            return Ok(());
        }
        if response.status().is_server_error() {
            return Err(ControlPlaneError::Transient(format!("vault returned {}", response.status())));
        }
        Err(ControlPlaneError::Internal(format!("vault returned {}", response.status())))
    }
}
