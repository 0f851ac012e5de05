//! Bearer API-key lifecycle, and the deployment credential manager that
//! gets-or-creates a long-lived API key per organization for the Unified
//! Orchestrator's stack workers to call back into the JSON-RPC signer with.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

mod deployment_credential;
mod manager;

pub use deployment_credential::DeploymentCredentialManager;
pub use manager::{ApiKeyManager, NewApiKey};
