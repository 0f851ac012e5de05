//! The Deployment Orchestrator: a resumable, multi-stage, concurrent state
//! machine that dispatches per-rollup-stack workers, issues remote-signed
//! L1 transactions through the JSON-RPC Signer, materializes deployment
//! artifacts, and recovers pending deployments across process restarts.
//!
//! [`UnifiedOrchestrator`] is the public entry point; it dispatches to one
//! of the stack orchestrators (`op`, `nitro`) by the [`Stack`] tag on each
//! [`Deployment`](popsigner_core::Deployment). A new stack is added by
//! implementing [`StackOrchestrator`], not by touching the dispatcher.

#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

mod artifacts;
mod backoff;
mod key_resolver;
mod l1;
mod nitro;
mod op;
mod unified;

pub use key_resolver::KeyResolver;
pub use l1::{HttpL1Client, L1Client, TxReceipt};
pub use nitro::NitroOrchestrator;
pub use op::OpOrchestrator;
pub use unified::{DeploymentRequest, UnifiedOrchestrator};

use async_trait::async_trait;
use popsigner_core::{ControlPlaneError, Deployment};
use popsigner_store::{ApiKeyStore, AuditStore, CertificateStore, ChainIdAllocator, DeploymentStore, InfraRegistryStore, KeyStore, UsageStore};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Every repository trait an orchestrator needs, bundled so downstream
/// code can write one bound (`S: ControlPlaneStore`) instead of six.
/// Blanket-implemented for any store that already implements every
/// constituent trait — `MemoryStore` and `PgStore` both qualify as-is.
pub trait ControlPlaneStore:
    DeploymentStore + KeyStore + ApiKeyStore + CertificateStore + AuditStore + UsageStore + InfraRegistryStore + ChainIdAllocator + Send + Sync + 'static
{
}

impl<T> ControlPlaneStore for T where
    T: DeploymentStore + KeyStore + ApiKeyStore + CertificateStore + AuditStore + UsageStore + InfraRegistryStore + ChainIdAllocator + Send + Sync + 'static
{
}

/// The fixed capability set a rollup stack must implement to be dispatched
/// by the [`UnifiedOrchestrator`]: start a fresh deployment, or resume one
/// recovered from a non-terminal persisted state.
#[async_trait]
pub trait StackOrchestrator: Send + Sync {
    /// Drives `deployment` from `pending`/`initializing` through to
    /// `completed` or `failed`, persisting progress at every stage
    /// boundary so a crash can resume from the last checkpoint.
    async fn start(&self, deployment: Deployment, cancel: CancellationToken) -> Result<(), ControlPlaneError>;

    /// Resumes a deployment recovered from a non-terminal persisted state.
    /// Must not replay a stage whose transactions are already `confirmed`;
    /// implementations inspect recorded transactions and skip forward.
    async fn resume(&self, deployment: Deployment, cancel: CancellationToken) -> Result<(), ControlPlaneError>;
}

/// Shared identity for a running or resuming deployment task: its id plus
/// a cancellation signal every suspension point must check.
#[derive(Clone)]
pub struct DeploymentHandle {
    /// The deployment this handle drives.
    pub deployment_id: Uuid,
    /// Signalled by [`UnifiedOrchestrator::cancel`].
    pub cancel: CancellationToken,
}

impl std::fmt::Debug for DeploymentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentHandle").field("deployment_id", &self.deployment_id).finish()
    }
}

pub(crate) fn arc<T>(value: T) -> Arc<T> {
    Arc::new(value)
}
