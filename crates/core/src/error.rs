use jsonrpsee_types::ErrorObjectOwned;
use thiserror::Error;

/// Coarse-grained error classification shared by every error kind in
/// [`ControlPlaneError`]. Surfaces (REST, JSON-RPC, internal retry loops)
/// dispatch on this rather than on the concrete variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Input validation failure; never retried.
    BadRequest,
    /// Missing or invalid credentials.
    Unauthorized,
    /// Scope or ownership mismatch.
    Forbidden,
    /// Unknown resource.
    NotFound,
    /// The caller cancelled the operation; not a fault.
    Cancelled,
    /// Non-idempotent re-submission.
    Conflict,
    /// Plan enforcement limit reached.
    QuotaExceeded,
    /// Returned by middleware; retried only at the caller's discretion.
    RateLimited,
    /// Network blip, upstream 5xx, vault/db timeout. Retried internally
    /// with exponential backoff by the caller.
    Transient,
    /// Logic error; surfaced as-is. If a deployment is involved, the
    /// caller must record it via `SetError` and transition to `failed`.
    Fatal,
}

/// The control plane's error taxonomy. One enum covers every component;
/// each variant carries enough context to render a useful message and maps
/// deterministically onto an [`ErrorKind`].
#[derive(Debug, Error)]
pub enum ControlPlaneError {
    /// Input failed validation.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// Caller credentials are missing or invalid.
    #[error("unauthorized")]
    Unauthorized,
    /// Caller lacks the scope, or does not own the resource.
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// Resource does not exist, or is invisible to the caller.
    #[error("not found: {0}")]
    NotFound(String),
    /// The caller cancelled an in-flight deployment; deliberate, not a
    /// fault, and must never read back as an internal error.
    #[error("cancelled: {0}")]
    Cancelled(String),
    /// The requested mutation conflicts with existing state.
    #[error("conflict: {0}")]
    Conflict(String),
    /// A `UpdateStatus` was attempted against a deployment already in a
    /// terminal state.
    #[error("deployment is in a terminal state")]
    Terminal,
    /// A `Delete` was attempted against a certificate that has not been
    /// revoked.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    /// The plan's usage limit for this organization has been reached.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    /// Caller exceeded the request-rate limit.
    #[error("rate limited")]
    RateLimited,
    /// A write succeeded against the vault but failed to persist to the
    /// database (or vice versa); the two stores may be briefly
    /// inconsistent and the caller should retry the logical operation.
    #[error("inconsistent state, retry: {0}")]
    Inconsistent(String),
    /// Transient failure in an outbound dependency (network, vault, L1
    /// RPC, database). Safe to retry with backoff.
    #[error("transient failure: {0}")]
    Transient(String),
    /// An internal invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ControlPlaneError {
    /// Classifies this error into its [`ErrorKind`].
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BadRequest(_) => ErrorKind::BadRequest,
            Self::Unauthorized => ErrorKind::Unauthorized,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Conflict(_) | Self::Terminal | Self::PreconditionFailed(_) => ErrorKind::Conflict,
            Self::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            Self::RateLimited => ErrorKind::RateLimited,
            Self::Inconsistent(_) | Self::Transient(_) => ErrorKind::Transient,
            Self::Internal(_) => ErrorKind::Fatal,
        }
    }

    /// Whether an orchestrator stage should retry this error with backoff
    /// rather than surfacing it immediately. Only `Transient`-kind errors
    /// are retried; everything else terminates the stage.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// HTTP status this error maps onto, per the taxonomy in the design
    /// document.
    pub fn http_status(&self) -> http::StatusCode {
        use http::StatusCode;
        match self.kind() {
            ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Cancelled => StatusCode::CONFLICT,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::QuotaExceeded => StatusCode::PAYMENT_REQUIRED,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Transient => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Fatal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// JSON-RPC 2.0 error code this error maps onto.
    pub fn rpc_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::BadRequest => -32602,
            ErrorKind::Unauthorized => -32003,
            ErrorKind::Forbidden => -32003,
            // -32601 is the reserved JSON-RPC 2.0 "method not found" code;
            // a missing resource must stay distinguishable from that.
            ErrorKind::NotFound => -32004,
            ErrorKind::Conflict | ErrorKind::QuotaExceeded | ErrorKind::RateLimited => -32000,
            ErrorKind::Cancelled => -32000,
            ErrorKind::Transient | ErrorKind::Fatal => -32000,
        }
    }
}

impl From<ControlPlaneError> for ErrorObjectOwned {
    fn from(err: ControlPlaneError) -> Self {
        let code = err.rpc_code();
        ErrorObjectOwned::owned(code, err.to_string(), None::<()>)
    }
}
