//! Shared domain types and error taxonomy for the popsigner control plane.
//!
//! This crate has no I/O of its own: it defines the entities that flow
//! between the store, signing, vault, and orchestrator crates, plus the
//! error kinds every surface (REST, JSON-RPC, internal) maps onto.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

mod error;
mod types;

pub use error::{ControlPlaneError, ErrorKind};
pub use types::{
    Algorithm, ApiKey, ApiKeyScope, ApiKeyStatus, Artifact, AuditLog, Certificate, CertificateStatus,
    Deployment, DeploymentStatus, Key, Namespace, Organization, Stack, Transaction, TxStatus,
    UsageCounter,
};
