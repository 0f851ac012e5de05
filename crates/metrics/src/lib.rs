//! Process-wide metrics registry for the popsigner control plane.
//!
//! Installed once at startup; every component that wants to record a
//! metric constructs its own typed handle from the named constructors
//! below rather than calling the `metrics` macros directly, so the metric
//! names stay centralized.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

use metrics::{Counter, Gauge, Histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Installs the global Prometheus recorder and binds its scrape endpoint.
///
/// Global state, init-once: calling this more than once will panic, which
/// is intentional — it would indicate two components racing to own the
/// process metrics registry.
pub fn install_recorder(bind_addr: SocketAddr) -> Result<PrometheusHandle, metrics_exporter_prometheus::BuildError> {
    PrometheusBuilder::new().with_http_listener(bind_addr).install_recorder()
}

/// Signing-service metrics.
#[derive(Debug, Clone)]
pub struct SigningMetrics {
    /// Successful `Sign`/`SignEVM` calls.
    pub signatures_total: Counter,
    /// `Sign`/`SignEVM` calls rejected for exceeding the plan quota.
    pub quota_rejections_total: Counter,
    /// Vault gateway call latency.
    pub vault_call_latency: Histogram,
}

impl SigningMetrics {
    /// Registers the named handles.
    pub fn new() -> Self {
        Self {
            signatures_total: metrics::counter!("popsigner_signatures_total"),
            quota_rejections_total: metrics::counter!("popsigner_quota_rejections_total"),
            vault_call_latency: metrics::histogram!("popsigner_vault_call_latency_seconds"),
        }
    }
}

impl Default for SigningMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Deployment orchestrator metrics.
#[derive(Debug, Clone)]
pub struct OrchestratorMetrics {
    /// Deployments started.
    pub deployments_started_total: Counter,
    /// Deployments that reached `completed`.
    pub deployments_completed_total: Counter,
    /// Deployments that reached `failed`.
    pub deployments_failed_total: Counter,
    /// Currently active (non-terminal) deployments tracked in memory.
    pub active_deployments: Gauge,
    /// L1 transactions submitted across all stack orchestrators.
    pub transactions_submitted_total: Counter,
    /// Per-RPC-call retry attempts taken by the backoff helper.
    pub retry_attempts_total: Counter,
}

impl OrchestratorMetrics {
    /// Registers the named handles.
    pub fn new() -> Self {
        Self {
            deployments_started_total: metrics::counter!("popsigner_deployments_started_total"),
            deployments_completed_total: metrics::counter!("popsigner_deployments_completed_total"),
            deployments_failed_total: metrics::counter!("popsigner_deployments_failed_total"),
            active_deployments: metrics::gauge!("popsigner_active_deployments"),
            transactions_submitted_total: metrics::counter!("popsigner_transactions_submitted_total"),
            retry_attempts_total: metrics::counter!("popsigner_retry_attempts_total"),
        }
    }
}

impl Default for OrchestratorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// JSON-RPC signer endpoint metrics.
#[derive(Debug, Clone)]
pub struct RpcMetrics {
    /// Requests received, by method, are tracked by incrementing this
    /// counter with a `method` label at the call site.
    pub requests_total: Counter,
    /// Requests that resolved to a JSON-RPC error response.
    pub errors_total: Counter,
}

impl RpcMetrics {
    /// Registers the named handles.
    pub fn new() -> Self {
        Self {
            requests_total: metrics::counter!("popsigner_rpc_requests_total"),
            errors_total: metrics::counter!("popsigner_rpc_errors_total"),
        }
    }
}

impl Default for RpcMetrics {
    fn default() -> Self {
        Self::new()
    }
}
