//! On-demand mTLS client certificate issuance, bound to either an
//! organization or a single deployment.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

use chrono::Utc;
use popsigner_core::{Certificate, ControlPlaneError};
use popsigner_pki::PkiProvider;
use popsigner_store::CertificateStore;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Default validity for an issued certificate, in hours, when the caller
/// does not specify one: 8760h (one year).
pub const DEFAULT_VALIDITY_HOURS: u64 = 8760;

/// Minimum accepted validity: certificates issued for less than an hour are
/// rejected as a likely caller mistake.
pub const MIN_VALIDITY: Duration = Duration::from_secs(3600);

/// A freshly issued client certificate, including the one-time-download
/// private key. Only returned at issuance time; subsequent reads of the
/// stored [`Certificate`] row omit `client_cert`'s private key component.
#[derive(Debug, Clone)]
pub struct CertBundle {
    /// The persisted certificate row.
    pub certificate: Certificate,
    /// PEM-encoded client private key, returned once.
    pub client_key: Vec<u8>,
    /// PEM-encoded CA certificate.
    pub ca_cert: Vec<u8>,
}

/// Issues, revokes, and deletes mTLS client certificates on behalf of the
/// Certificate Provider component.
pub struct CertificateProvider<S> {
    store: Arc<S>,
    pki: Arc<dyn PkiProvider>,
}

impl<S> std::fmt::Debug for CertificateProvider<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateProvider").finish_non_exhaustive()
    }
}

impl<S> CertificateProvider<S>
where
    S: CertificateStore,
{
    /// Builds a provider over `store` and `pki`.
    pub fn new(store: Arc<S>, pki: Arc<dyn PkiProvider>) -> Self {
        Self { store, pki }
    }

    /// Issues a certificate named `name`, scoped to `common_name` (either
    /// `org_<org_id>` or `deployment_<deployment_id>`), valid for
    /// `validity`. Rejects a `validity` under one hour.
    pub async fn issue(
        &self,
        org_id: Uuid,
        name: &str,
        common_name: &str,
        validity: Duration,
    ) -> Result<CertBundle, ControlPlaneError> {
        if validity < MIN_VALIDITY {
            return Err(ControlPlaneError::BadRequest("certificate validity must be at least 1 hour".into()));
        }

        let issued = self.pki.issue(common_name, validity).await?;

        let certificate = Certificate {
            id: Uuid::new_v4(),
            org_id,
            name: name.to_string(),
            fingerprint: issued.fingerprint,
            serial_number: issued.serial_number,
            common_name: common_name.to_string(),
            client_cert: issued.cert_pem,
            issued_at: issued.issued_at,
            expires_at: issued.expires_at,
            revoked_at: None,
            revocation_reason: None,
        };

        self.store.create_certificate(certificate.clone()).await?;

        Ok(CertBundle {
            certificate,
            client_key: issued.key_pem,
            ca_cert: issued.ca_pem,
        })
    }

    /// Issues a certificate bound to a deployment, for the Nitro stack's
    /// `issue_cert` stage.
    pub async fn issue_for_deployment(&self, org_id: Uuid, deployment_id: Uuid, validity: Duration) -> Result<CertBundle, ControlPlaneError> {
        self.issue(org_id, &format!("deployment-{deployment_id}"), &format!("deployment_{deployment_id}"), validity)
            .await
    }

    /// Revokes a certificate. Idempotent: revoking an already-revoked
    /// certificate succeeds without error.
    pub async fn revoke(&self, cert_id: Uuid, reason: &str) -> Result<(), ControlPlaneError> {
        let certificate = self.store.get_certificate(cert_id).await?;
        self.pki.revoke(&certificate.serial_number, reason).await?;
        self.store.revoke_certificate(cert_id, reason.to_string(), Utc::now()).await
    }

    /// Deletes a certificate. Requires the certificate to already be
    /// revoked; enforced here, not by the store.
    pub async fn delete(&self, cert_id: Uuid) -> Result<(), ControlPlaneError> {
        let certificate = self.store.get_certificate(cert_id).await?;
        if certificate.revoked_at.is_none() {
            return Err(ControlPlaneError::PreconditionFailed(format!(
                "certificate {cert_id} must be revoked before it can be deleted"
            )));
        }
        self.store.delete_certificate(cert_id).await
    }

    /// Lists every certificate owned by `org_id`.
    pub async fn list(&self, org_id: Uuid) -> Result<Vec<Certificate>, ControlPlaneError> {
        self.store.list_certificates(org_id).await
    }

    /// Fetches the PEM-encoded CA certificate.
    pub async fn ca_certificate(&self) -> Result<Vec<u8>, ControlPlaneError> {
        self.pki.ca_certificate().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use popsigner_pki::SelfSignedCa;
    use popsigner_store::MemoryStore;

    #[tokio::test]
    async fn delete_requires_revocation_first() {
        let store = Arc::new(MemoryStore::new());
        let pki = Arc::new(SelfSignedCa::generate("acme").unwrap());
        let provider = CertificateProvider::new(store, pki);
        let org_id = Uuid::new_v4();

        let bundle = provider
            .issue(org_id, "staging", "org_acme", Duration::from_secs(3600 * 168))
            .await
            .unwrap();

        let err = provider.delete(bundle.certificate.id).await.unwrap_err();
        assert!(matches!(err, ControlPlaneError::PreconditionFailed(_)));

        provider.revoke(bundle.certificate.id, "rotation").await.unwrap();
        provider.delete(bundle.certificate.id).await.unwrap();

        let remaining = provider.list(org_id).await.unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn rejects_short_validity() {
        let store = Arc::new(MemoryStore::new());
        let pki = Arc::new(SelfSignedCa::generate("acme").unwrap());
        let provider = CertificateProvider::new(store, pki);

        let err = provider
            .issue(Uuid::new_v4(), "x", "org_x", Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlPlaneError::BadRequest(_)));
    }
}
