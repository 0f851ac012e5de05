//! Repository traits and their concrete implementations for the popsigner
//! control plane: a Postgres-backed production implementation and an
//! in-memory implementation used by tests.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

mod memory;
mod postgres;
mod traits;

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use traits::{
    ApiKeyStore, AuditStore, CertificateStore, ChainIdAllocator, DeploymentStore,
    InfraRegistryStore, KeyStore, UsageStore,
};
