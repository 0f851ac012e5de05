//! Postgres-backed repository implementations.
//!
//! Each repository trait is implemented directly on [`PgStore`], which wraps
//! a shared connection pool. Column layouts follow the persisted-state
//! tables named in the design document; enum-typed columns are stored as
//! `TEXT` and parsed on read rather than mapped onto Postgres `ENUM` types,
//! so a schema migration never blocks on a Rust enum change. Queries are
//! built with the runtime-checked `query_as`/`query` functions rather than
//! the `query!` macro family, which would otherwise require a live database
//! at compile time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use popsigner_core::{
    Algorithm, Artifact, AuditLog, ApiKey, ApiKeyScope, ApiKeyStatus, Certificate,
    ControlPlaneError, Deployment, DeploymentStatus, Key, Stack, Transaction, TxStatus,
    UsageCounter,
};
use sqlx::{FromRow, PgPool};
use std::collections::BTreeSet;
use std::str::FromStr;
use uuid::Uuid;

use crate::traits::{
    ApiKeyStore, AuditStore, CertificateStore, ChainIdAllocator, DeploymentStore,
    InfraRegistryStore, KeyStore, UsageStore,
};

/// A repository implementation backed by a Postgres connection pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Wraps an already-established pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn map_sqlx(err: sqlx::Error) -> ControlPlaneError {
    match err {
        sqlx::Error::RowNotFound => ControlPlaneError::NotFound("row not found".into()),
        other => ControlPlaneError::Transient(other.to_string()),
    }
}

fn stack_to_str(stack: Stack) -> &'static str {
    match stack {
        Stack::Op => "op",
        Stack::Nitro => "nitro",
        Stack::Bundle => "bundle",
    }
}

fn str_to_stack(s: &str) -> Result<Stack, ControlPlaneError> {
    match s {
        "op" => Ok(Stack::Op),
        "nitro" => Ok(Stack::Nitro),
        "bundle" => Ok(Stack::Bundle),
        other => Err(ControlPlaneError::Internal(format!("unknown stack {other}"))),
    }
}

fn status_to_str(status: DeploymentStatus) -> &'static str {
    match status {
        DeploymentStatus::Pending => "pending",
        DeploymentStatus::Initializing => "initializing",
        DeploymentStatus::Running => "running",
        DeploymentStatus::Completed => "completed",
        DeploymentStatus::Failed => "failed",
    }
}

fn str_to_status(s: &str) -> Result<DeploymentStatus, ControlPlaneError> {
    match s {
        "pending" => Ok(DeploymentStatus::Pending),
        "initializing" => Ok(DeploymentStatus::Initializing),
        "running" => Ok(DeploymentStatus::Running),
        "completed" => Ok(DeploymentStatus::Completed),
        "failed" => Ok(DeploymentStatus::Failed),
        other => Err(ControlPlaneError::Internal(format!("unknown deployment status {other}"))),
    }
}

fn tx_status_to_str(status: TxStatus) -> &'static str {
    match status {
        TxStatus::Submitted => "submitted",
        TxStatus::Confirmed => "confirmed",
        TxStatus::Failed => "failed",
    }
}

fn str_to_tx_status(s: &str) -> Result<TxStatus, ControlPlaneError> {
    match s {
        "submitted" => Ok(TxStatus::Submitted),
        "confirmed" => Ok(TxStatus::Confirmed),
        "failed" => Ok(TxStatus::Failed),
        other => Err(ControlPlaneError::Internal(format!("unknown tx status {other}"))),
    }
}

fn algorithm_to_str(algorithm: Algorithm) -> &'static str {
    match algorithm {
        Algorithm::Secp256k1 => "secp256k1",
        Algorithm::Ed25519 => "ed25519",
    }
}

fn str_to_algorithm(s: &str) -> Result<Algorithm, ControlPlaneError> {
    match s {
        "secp256k1" => Ok(Algorithm::Secp256k1),
        "ed25519" => Ok(Algorithm::Ed25519),
        other => Err(ControlPlaneError::Internal(format!("unknown algorithm {other}"))),
    }
}

fn api_key_status_to_str(status: ApiKeyStatus) -> &'static str {
    match status {
        ApiKeyStatus::Active => "active",
        ApiKeyStatus::Revoked => "revoked",
    }
}

fn str_to_api_key_status(s: &str) -> Result<ApiKeyStatus, ControlPlaneError> {
    match s {
        "active" => Ok(ApiKeyStatus::Active),
        "revoked" => Ok(ApiKeyStatus::Revoked),
        other => Err(ControlPlaneError::Internal(format!("unknown api key status {other}"))),
    }
}

fn scope_to_str(scope: ApiKeyScope) -> &'static str {
    match scope {
        ApiKeyScope::KeysRead => "keys:read",
        ApiKeyScope::KeysWrite => "keys:write",
        ApiKeyScope::KeysSign => "keys:sign",
        ApiKeyScope::KeysExport => "keys:export",
        ApiKeyScope::CertificatesRead => "certificates:read",
        ApiKeyScope::CertificatesWrite => "certificates:write",
    }
}

impl FromStr for ApiKeyScope {
    type Err = ControlPlaneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keys:read" => Ok(Self::KeysRead),
            "keys:write" => Ok(Self::KeysWrite),
            "keys:sign" => Ok(Self::KeysSign),
            "keys:export" => Ok(Self::KeysExport),
            "certificates:read" => Ok(Self::CertificatesRead),
            "certificates:write" => Ok(Self::CertificatesWrite),
            other => Err(ControlPlaneError::Internal(format!("unknown api key scope {other}"))),
        }
    }
}

fn scopes_to_vec(scopes: &BTreeSet<ApiKeyScope>) -> Vec<String> {
    scopes.iter().copied().map(|s| scope_to_str(s).to_string()).collect()
}

fn vec_to_scopes(scopes: Vec<String>) -> Result<BTreeSet<ApiKeyScope>, ControlPlaneError> {
    scopes.into_iter().map(|s| ApiKeyScope::from_str(&s)).collect()
}

#[derive(FromRow)]
struct DeploymentRow {
    id: Uuid,
    org_id: Uuid,
    stack: String,
    chain_id: i64,
    status: String,
    stage: String,
    error: Option<String>,
    config_json: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl DeploymentRow {
    fn into_domain(self) -> Result<Deployment, ControlPlaneError> {
        Ok(Deployment {
            id: self.id,
            org_id: self.org_id,
            stack: str_to_stack(&self.stack)?,
            chain_id: self.chain_id as u64,
            status: str_to_status(&self.status)?,
            stage: self.stage,
            error: self.error,
            config: self.config_json,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

const DEPLOYMENT_COLUMNS: &str =
    "id, org_id, stack, chain_id, status, stage, error, config_json, created_at, updated_at";

#[async_trait]
impl DeploymentStore for PgStore {
    async fn create_deployment(&self, deployment: Deployment) -> Result<(), ControlPlaneError> {
        sqlx::query(
            "INSERT INTO deployments (id, org_id, stack, chain_id, status, stage, error, config_json, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(deployment.id)
        .bind(deployment.org_id)
        .bind(stack_to_str(deployment.stack))
        .bind(deployment.chain_id as i64)
        .bind(status_to_str(deployment.status))
        .bind(deployment.stage)
        .bind(deployment.error)
        .bind(deployment.config)
        .bind(deployment.created_at)
        .bind(deployment.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn get_deployment(&self, id: Uuid) -> Result<Deployment, ControlPlaneError> {
        let query = format!("SELECT {DEPLOYMENT_COLUMNS} FROM deployments WHERE id = $1");
        let row: Option<DeploymentRow> = sqlx::query_as(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.ok_or_else(|| ControlPlaneError::NotFound(format!("deployment {id}")))?
            .into_domain()
    }

    async fn get_by_chain_id(&self, chain_id: u64) -> Result<Deployment, ControlPlaneError> {
        let query = format!("SELECT {DEPLOYMENT_COLUMNS} FROM deployments WHERE chain_id = $1");
        let row: Option<DeploymentRow> = sqlx::query_as(&query)
            .bind(chain_id as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.ok_or_else(|| ControlPlaneError::NotFound(format!("deployment with chain_id {chain_id}")))?
            .into_domain()
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: DeploymentStatus,
        stage: Option<String>,
    ) -> Result<(), ControlPlaneError> {
        let result = sqlx::query(
            "UPDATE deployments SET status = $1, stage = COALESCE($2, stage), updated_at = now() \
             WHERE id = $3 AND status NOT IN ('completed', 'failed')",
        )
        .bind(status_to_str(status))
        .bind(stage)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            let deployment = self.get_deployment(id).await?;
            if deployment.status.is_terminal() {
                return Err(ControlPlaneError::Terminal);
            }
            return Err(ControlPlaneError::NotFound(format!("deployment {id}")));
        }
        Ok(())
    }

    async fn set_error(&self, id: Uuid, message: String) -> Result<(), ControlPlaneError> {
        let result = sqlx::query(
            "UPDATE deployments SET status = 'failed', error = $1, updated_at = now() \
             WHERE id = $2 AND status NOT IN ('completed', 'failed')",
        )
        .bind(message)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            let deployment = self.get_deployment(id).await?;
            if deployment.status.is_terminal() {
                return Err(ControlPlaneError::Terminal);
            }
            return Err(ControlPlaneError::NotFound(format!("deployment {id}")));
        }
        Ok(())
    }

    async fn list_by_status(&self, status: DeploymentStatus) -> Result<Vec<Deployment>, ControlPlaneError> {
        let query = format!("SELECT {DEPLOYMENT_COLUMNS} FROM deployments WHERE status = $1");
        let rows: Vec<DeploymentRow> = sqlx::query_as(&query)
            .bind(status_to_str(status))
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.into_iter().map(DeploymentRow::into_domain).collect()
    }

    async fn list_all(&self, org_id: Option<Uuid>) -> Result<Vec<Deployment>, ControlPlaneError> {
        let rows: Vec<DeploymentRow> = match org_id {
            Some(org_id) => {
                let query = format!("SELECT {DEPLOYMENT_COLUMNS} FROM deployments WHERE org_id = $1");
                sqlx::query_as(&query).bind(org_id).fetch_all(&self.pool).await
            }
            None => {
                let query = format!("SELECT {DEPLOYMENT_COLUMNS} FROM deployments");
                sqlx::query_as(&query).fetch_all(&self.pool).await
            }
        }
        .map_err(map_sqlx)?;
        rows.into_iter().map(DeploymentRow::into_domain).collect()
    }

    async fn record_transaction(&self, tx: Transaction) -> Result<(), ControlPlaneError> {
        sqlx::query(
            "INSERT INTO deployment_txs (id, deployment_id, stage, tx_hash, from_addr, to_addr, role, block_number, status, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (tx_hash) DO NOTHING",
        )
        .bind(tx.id)
        .bind(tx.deployment_id)
        .bind(tx.stage)
        .bind(tx.tx_hash)
        .bind(tx.from_address)
        .bind(tx.to_address)
        .bind(tx.role)
        .bind(tx.block_number.map(|b| b as i64))
        .bind(tx_status_to_str(tx.status))
        .bind(tx.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn update_transaction_status(
        &self,
        tx_hash: &str,
        status: TxStatus,
        block_number: Option<u64>,
    ) -> Result<(), ControlPlaneError> {
        let result = sqlx::query(
            "UPDATE deployment_txs SET status = $1, block_number = COALESCE($2, block_number) WHERE tx_hash = $3",
        )
        .bind(tx_status_to_str(status))
        .bind(block_number.map(|b| b as i64))
        .bind(tx_hash)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(ControlPlaneError::NotFound(format!("transaction {tx_hash}")));
        }
        Ok(())
    }

    async fn get_transactions_by_deployment(&self, deployment_id: Uuid) -> Result<Vec<Transaction>, ControlPlaneError> {
        let rows: Vec<TransactionRow> = sqlx::query_as(
            "SELECT id, deployment_id, stage, tx_hash, from_addr, to_addr, role, block_number, status, created_at \
             FROM deployment_txs WHERE deployment_id = $1 ORDER BY created_at ASC",
        )
        .bind(deployment_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        rows.into_iter().map(TransactionRow::into_domain).collect()
    }

    async fn get_transaction_by_hash(&self, tx_hash: &str) -> Result<Option<Transaction>, ControlPlaneError> {
        let row: Option<TransactionRow> = sqlx::query_as(
            "SELECT id, deployment_id, stage, tx_hash, from_addr, to_addr, role, block_number, status, created_at \
             FROM deployment_txs WHERE tx_hash = $1",
        )
        .bind(tx_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        row.map(TransactionRow::into_domain).transpose()
    }

    async fn save_artifact(&self, artifact: Artifact) -> Result<(), ControlPlaneError> {
        sqlx::query(
            "INSERT INTO deployment_artifacts (deployment_id, type, body, created_at) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (deployment_id, type) DO UPDATE SET body = EXCLUDED.body, created_at = EXCLUDED.created_at",
        )
        .bind(artifact.deployment_id)
        .bind(artifact.artifact_type)
        .bind(artifact.body)
        .bind(artifact.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn get_artifact(&self, deployment_id: Uuid, artifact_type: &str) -> Result<Artifact, ControlPlaneError> {
        let row: Option<ArtifactRow> = sqlx::query_as(
            "SELECT deployment_id, type AS artifact_type, body, created_at FROM deployment_artifacts \
             WHERE deployment_id = $1 AND type = $2",
        )
        .bind(deployment_id)
        .bind(artifact_type)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        row.map(ArtifactRow::into_domain)
            .ok_or_else(|| ControlPlaneError::NotFound(format!("artifact {deployment_id}/{artifact_type}")))
    }

    async fn get_all_artifacts(&self, deployment_id: Uuid) -> Result<Vec<Artifact>, ControlPlaneError> {
        let rows: Vec<ArtifactRow> = sqlx::query_as(
            "SELECT deployment_id, type AS artifact_type, body, created_at FROM deployment_artifacts WHERE deployment_id = $1",
        )
        .bind(deployment_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(rows.into_iter().map(ArtifactRow::into_domain).collect())
    }
}

#[derive(FromRow)]
struct TransactionRow {
    id: Uuid,
    deployment_id: Uuid,
    stage: String,
    tx_hash: String,
    from_addr: String,
    to_addr: String,
    role: String,
    block_number: Option<i64>,
    status: String,
    created_at: DateTime<Utc>,
}

impl TransactionRow {
    fn into_domain(self) -> Result<Transaction, ControlPlaneError> {
        Ok(Transaction {
            id: self.id,
            deployment_id: self.deployment_id,
            stage: self.stage,
            tx_hash: self.tx_hash,
            from_address: self.from_addr,
            to_address: self.to_addr,
            role: self.role,
            block_number: self.block_number.map(|b| b as u64),
            status: str_to_tx_status(&self.status)?,
            created_at: self.created_at,
        })
    }
}

#[derive(FromRow)]
struct ArtifactRow {
    deployment_id: Uuid,
    artifact_type: String,
    body: Vec<u8>,
    created_at: DateTime<Utc>,
}

impl ArtifactRow {
    fn into_domain(self) -> Artifact {
        Artifact {
            deployment_id: self.deployment_id,
            artifact_type: self.artifact_type,
            body: self.body,
            created_at: self.created_at,
        }
    }
}

#[derive(FromRow)]
struct KeyRow {
    id: Uuid,
    org_id: Uuid,
    namespace_id: Uuid,
    name: String,
    algorithm: String,
    public_key: Vec<u8>,
    address: Vec<u8>,
    eth_address: Option<Vec<u8>>,
    exportable: bool,
    version: i32,
    created_at: DateTime<Utc>,
}

impl KeyRow {
    fn into_domain(self) -> Result<Key, ControlPlaneError> {
        Ok(Key {
            id: self.id,
            org_id: self.org_id,
            namespace_id: self.namespace_id,
            name: self.name,
            algorithm: str_to_algorithm(&self.algorithm)?,
            public_key: self.public_key,
            address: self.address,
            eth_address: self.eth_address,
            exportable: self.exportable,
            version: self.version as u32,
            created_at: self.created_at,
        })
    }
}

const KEY_COLUMNS: &str =
    "id, org_id, namespace_id, name, algorithm, public_key, address, eth_address, exportable, version, created_at";

#[async_trait]
impl KeyStore for PgStore {
    async fn create_key(&self, key: Key) -> Result<(), ControlPlaneError> {
        sqlx::query(
            "INSERT INTO keys (id, org_id, namespace_id, name, algorithm, public_key, address, eth_address, exportable, version, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(key.id)
        .bind(key.org_id)
        .bind(key.namespace_id)
        .bind(key.name)
        .bind(algorithm_to_str(key.algorithm))
        .bind(key.public_key)
        .bind(key.address)
        .bind(key.eth_address)
        .bind(key.exportable)
        .bind(key.version as i32)
        .bind(key.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn get_key(&self, id: Uuid) -> Result<Key, ControlPlaneError> {
        let query = format!("SELECT {KEY_COLUMNS} FROM keys WHERE id = $1");
        let row: Option<KeyRow> = sqlx::query_as(&query).bind(id).fetch_optional(&self.pool).await.map_err(map_sqlx)?;
        row.ok_or_else(|| ControlPlaneError::NotFound(format!("key {id}")))?.into_domain()
    }

    async fn get_key_by_name(&self, org_id: Uuid, name: &str) -> Result<Key, ControlPlaneError> {
        let query = format!("SELECT {KEY_COLUMNS} FROM keys WHERE org_id = $1 AND name = $2");
        let row: Option<KeyRow> = sqlx::query_as(&query)
            .bind(org_id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.ok_or_else(|| ControlPlaneError::NotFound(format!("key {name}")))?.into_domain()
    }

    async fn list_keys(&self, org_id: Uuid) -> Result<Vec<Key>, ControlPlaneError> {
        let query = format!("SELECT {KEY_COLUMNS} FROM keys WHERE org_id = $1");
        let rows: Vec<KeyRow> = sqlx::query_as(&query).bind(org_id).fetch_all(&self.pool).await.map_err(map_sqlx)?;
        rows.into_iter().map(KeyRow::into_domain).collect()
    }

    async fn delete_key(&self, id: Uuid) -> Result<(), ControlPlaneError> {
        sqlx::query("DELETE FROM keys WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }
}

#[derive(FromRow)]
struct ApiKeyRow {
    id: Uuid,
    org_id: Uuid,
    key_prefix: String,
    hash: String,
    scopes: Vec<String>,
    status: String,
    created_at: DateTime<Utc>,
    last_used_at: Option<DateTime<Utc>>,
}

impl ApiKeyRow {
    fn into_domain(self) -> Result<ApiKey, ControlPlaneError> {
        Ok(ApiKey {
            id: self.id,
            org_id: self.org_id,
            key_prefix: self.key_prefix,
            hash: self.hash,
            scopes: vec_to_scopes(self.scopes)?,
            status: str_to_api_key_status(&self.status)?,
            created_at: self.created_at,
            last_used_at: self.last_used_at,
        })
    }
}

const API_KEY_COLUMNS: &str = "id, org_id, key_prefix, hash, scopes, status, created_at, last_used_at";

#[async_trait]
impl ApiKeyStore for PgStore {
    async fn create_api_key(&self, api_key: ApiKey) -> Result<(), ControlPlaneError> {
        sqlx::query(
            "INSERT INTO api_keys (id, org_id, key_prefix, hash, scopes, status, created_at, last_used_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(api_key.id)
        .bind(api_key.org_id)
        .bind(api_key.key_prefix)
        .bind(api_key.hash)
        .bind(scopes_to_vec(&api_key.scopes))
        .bind(api_key_status_to_str(api_key.status))
        .bind(api_key.created_at)
        .bind(api_key.last_used_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn get_api_key(&self, id: Uuid) -> Result<ApiKey, ControlPlaneError> {
        let query = format!("SELECT {API_KEY_COLUMNS} FROM api_keys WHERE id = $1");
        let row: Option<ApiKeyRow> = sqlx::query_as(&query).bind(id).fetch_optional(&self.pool).await.map_err(map_sqlx)?;
        row.ok_or_else(|| ControlPlaneError::NotFound(format!("api key {id}")))?.into_domain()
    }

    async fn find_by_prefix(&self, key_prefix: &str) -> Result<Vec<ApiKey>, ControlPlaneError> {
        let query = format!("SELECT {API_KEY_COLUMNS} FROM api_keys WHERE key_prefix = $1");
        let rows: Vec<ApiKeyRow> = sqlx::query_as(&query)
            .bind(key_prefix)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.into_iter().map(ApiKeyRow::into_domain).collect()
    }

    async fn list_api_keys(&self, org_id: Uuid) -> Result<Vec<ApiKey>, ControlPlaneError> {
        let query = format!("SELECT {API_KEY_COLUMNS} FROM api_keys WHERE org_id = $1");
        let rows: Vec<ApiKeyRow> = sqlx::query_as(&query).bind(org_id).fetch_all(&self.pool).await.map_err(map_sqlx)?;
        rows.into_iter().map(ApiKeyRow::into_domain).collect()
    }

    async fn revoke_api_key(&self, id: Uuid) -> Result<(), ControlPlaneError> {
        let result = sqlx::query("UPDATE api_keys SET status = 'revoked' WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        if result.rows_affected() == 0 {
            return Err(ControlPlaneError::NotFound(format!("api key {id}")));
        }
        Ok(())
    }

    async fn touch_last_used(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), ControlPlaneError> {
        sqlx::query("UPDATE api_keys SET last_used_at = $1 WHERE id = $2")
            .bind(at)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }
}

#[derive(FromRow)]
struct CertificateRow {
    id: Uuid,
    org_id: Uuid,
    name: String,
    fingerprint: String,
    serial_number: String,
    common_name: String,
    client_cert: Vec<u8>,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    revoked_at: Option<DateTime<Utc>>,
    revocation_reason: Option<String>,
}

impl CertificateRow {
    fn into_domain(self) -> Certificate {
        Certificate {
            id: self.id,
            org_id: self.org_id,
            name: self.name,
            fingerprint: self.fingerprint,
            serial_number: self.serial_number,
            common_name: self.common_name,
            client_cert: self.client_cert,
            issued_at: self.issued_at,
            expires_at: self.expires_at,
            revoked_at: self.revoked_at,
            revocation_reason: self.revocation_reason,
        }
    }
}

const CERTIFICATE_COLUMNS: &str =
    "id, org_id, name, fingerprint, serial_number, common_name, client_cert, issued_at, expires_at, revoked_at, revocation_reason";

#[async_trait]
impl CertificateStore for PgStore {
    async fn create_certificate(&self, certificate: Certificate) -> Result<(), ControlPlaneError> {
        sqlx::query(
            "INSERT INTO certificates (id, org_id, name, fingerprint, serial_number, common_name, client_cert, issued_at, expires_at, revoked_at, revocation_reason) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(certificate.id)
        .bind(certificate.org_id)
        .bind(certificate.name)
        .bind(certificate.fingerprint)
        .bind(certificate.serial_number)
        .bind(certificate.common_name)
        .bind(certificate.client_cert)
        .bind(certificate.issued_at)
        .bind(certificate.expires_at)
        .bind(certificate.revoked_at)
        .bind(certificate.revocation_reason)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn get_certificate(&self, id: Uuid) -> Result<Certificate, ControlPlaneError> {
        let query = format!("SELECT {CERTIFICATE_COLUMNS} FROM certificates WHERE id = $1");
        let row: Option<CertificateRow> = sqlx::query_as(&query).bind(id).fetch_optional(&self.pool).await.map_err(map_sqlx)?;
        row.map(CertificateRow::into_domain)
            .ok_or_else(|| ControlPlaneError::NotFound(format!("certificate {id}")))
    }

    async fn list_certificates(&self, org_id: Uuid) -> Result<Vec<Certificate>, ControlPlaneError> {
        let query = format!("SELECT {CERTIFICATE_COLUMNS} FROM certificates WHERE org_id = $1");
        let rows: Vec<CertificateRow> = sqlx::query_as(&query).bind(org_id).fetch_all(&self.pool).await.map_err(map_sqlx)?;
        Ok(rows.into_iter().map(CertificateRow::into_domain).collect())
    }

    async fn revoke_certificate(&self, id: Uuid, reason: String, at: DateTime<Utc>) -> Result<(), ControlPlaneError> {
        sqlx::query(
            "UPDATE certificates SET revoked_at = COALESCE(revoked_at, $1), revocation_reason = COALESCE(revocation_reason, $2) WHERE id = $3",
        )
        .bind(at)
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn delete_certificate(&self, id: Uuid) -> Result<(), ControlPlaneError> {
        sqlx::query("DELETE FROM certificates WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }
}

#[derive(FromRow)]
struct AuditLogRow {
    id: Uuid,
    org_id: Uuid,
    event: String,
    actor_id: String,
    actor_type: String,
    resource_type: String,
    resource_id: String,
    ip: Option<String>,
    ua: Option<String>,
    metadata: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl AuditLogRow {
    fn into_domain(self) -> AuditLog {
        AuditLog {
            id: self.id,
            org_id: self.org_id,
            event: self.event,
            actor_id: self.actor_id,
            actor_type: self.actor_type,
            resource_type: self.resource_type,
            resource_id: self.resource_id,
            ip: self.ip,
            ua: self.ua,
            metadata: self.metadata,
            created_at: self.created_at,
        }
    }
}

#[async_trait]
impl AuditStore for PgStore {
    async fn append(&self, entry: AuditLog) -> Result<(), ControlPlaneError> {
        sqlx::query(
            "INSERT INTO audit_logs (id, org_id, event, actor_id, actor_type, resource_type, resource_id, ip, ua, metadata, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(entry.id)
        .bind(entry.org_id)
        .bind(entry.event)
        .bind(entry.actor_id)
        .bind(entry.actor_type)
        .bind(entry.resource_type)
        .bind(entry.resource_id)
        .bind(entry.ip)
        .bind(entry.ua)
        .bind(entry.metadata)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn list(&self, org_id: Uuid, limit: i64) -> Result<Vec<AuditLog>, ControlPlaneError> {
        let rows: Vec<AuditLogRow> = sqlx::query_as(
            "SELECT id, org_id, event, actor_id, actor_type, resource_type, resource_id, ip, ua, metadata, created_at \
             FROM audit_logs WHERE org_id = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(org_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(rows.into_iter().map(AuditLogRow::into_domain).collect())
    }

    async fn delete_older_than(&self, before: DateTime<Utc>) -> Result<u64, ControlPlaneError> {
        let result = sqlx::query("DELETE FROM audit_logs WHERE created_at < $1")
            .bind(before)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(result.rows_affected())
    }
}

#[derive(FromRow)]
struct UsageRow {
    value: i64,
}

#[async_trait]
impl UsageStore for PgStore {
    async fn increment(
        &self,
        org_id: Uuid,
        metric: &str,
        period_start: DateTime<Utc>,
        delta: i64,
    ) -> Result<i64, ControlPlaneError> {
        let row: UsageRow = sqlx::query_as(
            "INSERT INTO usage_counters (org_id, metric, period_start, value) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (org_id, metric, period_start) DO UPDATE SET value = usage_counters.value + EXCLUDED.value \
             RETURNING value",
        )
        .bind(org_id)
        .bind(metric)
        .bind(period_start)
        .bind(delta)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(row.value)
    }

    async fn get(&self, org_id: Uuid, metric: &str, period_start: DateTime<Utc>) -> Result<UsageCounter, ControlPlaneError> {
        let row: Option<UsageRow> = sqlx::query_as(
            "SELECT value FROM usage_counters WHERE org_id = $1 AND metric = $2 AND period_start = $3",
        )
        .bind(org_id)
        .bind(metric)
        .bind(period_start)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(UsageCounter {
            org_id,
            metric: metric.to_string(),
            period_start,
            value: row.map(|r| r.value).unwrap_or(0),
        })
    }
}

#[derive(FromRow)]
struct AddressRow {
    address: String,
}

#[async_trait]
impl InfraRegistryStore for PgStore {
    async fn record_factory_address(&self, org_id: Uuid, l1_chain_id: u64, address: String) -> Result<(), ControlPlaneError> {
        sqlx::query("INSERT INTO infra_registry (org_id, l1_chain_id, address, created_at) VALUES ($1, $2, $3, now())")
            .bind(org_id)
            .bind(l1_chain_id as i64)
            .bind(address)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn get_factory_addresses(&self, org_id: Uuid, l1_chain_id: u64) -> Result<Vec<String>, ControlPlaneError> {
        let rows: Vec<AddressRow> = sqlx::query_as(
            "SELECT address FROM infra_registry WHERE org_id = $1 AND l1_chain_id = $2 ORDER BY created_at ASC",
        )
        .bind(org_id)
        .bind(l1_chain_id as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(rows.into_iter().map(|r| r.address).collect())
    }
}

#[derive(FromRow)]
struct NextValueRow {
    next_value: i64,
}

#[async_trait]
impl ChainIdAllocator for PgStore {
    async fn allocate(&self, l1_chain_id: u64) -> Result<u64, ControlPlaneError> {
        let row: NextValueRow = sqlx::query_as(
            "INSERT INTO chain_id_sequences (l1_chain_id, next_value) VALUES ($1, 1) \
             ON CONFLICT (l1_chain_id) DO UPDATE SET next_value = chain_id_sequences.next_value + 1 \
             RETURNING next_value",
        )
        .bind(l1_chain_id as i64)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(row.next_value as u64)
    }
}
