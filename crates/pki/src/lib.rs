//! The CA capability that issues short-lived mTLS client certificates.
//!
//! The production deployment of the control plane points this trait at a
//! remote PKI microservice; this crate's [`SelfSignedCa`] implementation is
//! a local, in-process CA suitable for development and for driving the
//! Certificate Provider in tests without a network dependency.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use popsigner_core::ControlPlaneError;
use rcgen::{
    Certificate as RcgenCertificate, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyUsagePurpose, SanType,
};
use std::time::Duration;

/// A freshly issued client certificate and the CA chain needed to validate
/// it.
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    /// PEM-encoded client certificate.
    pub cert_pem: Vec<u8>,
    /// PEM-encoded client private key. Never persisted outside the
    /// one-time download path.
    pub key_pem: Vec<u8>,
    /// PEM-encoded CA certificate, for the peer to validate against.
    pub ca_pem: Vec<u8>,
    /// Lowercase hex SHA-256 fingerprint of `cert_pem`'s DER form.
    pub fingerprint: String,
    /// Hex-encoded CA-assigned serial number.
    pub serial_number: String,
    /// Issuance timestamp.
    pub issued_at: DateTime<Utc>,
    /// Expiry timestamp.
    pub expires_at: DateTime<Utc>,
}

/// The CA capability the Certificate Provider depends on.
#[async_trait]
pub trait PkiProvider: Send + Sync {
    /// Issues a new client certificate with the given `common_name`, valid
    /// for `validity`.
    async fn issue(&self, common_name: &str, validity: Duration) -> Result<IssuedCertificate, ControlPlaneError>;

    /// Revokes a previously issued certificate, identified by its
    /// `serial_number`. Revocation is advisory for a self-signed dev CA
    /// (there is no OCSP/CRL consumer in this workspace) but is still
    /// recorded so a real PKI backend can be swapped in without a trait
    /// change.
    async fn revoke(&self, serial_number: &str, reason: &str) -> Result<(), ControlPlaneError>;

    /// Returns the PEM-encoded CA certificate.
    async fn ca_certificate(&self) -> Result<Vec<u8>, ControlPlaneError>;
}

/// An in-process CA backed by `rcgen`. Generates a self-signed root at
/// construction and signs every client certificate against it.
pub struct SelfSignedCa {
    ca_cert: RcgenCertificate,
    ca_pem: Vec<u8>,
    revoked: Mutex<Vec<(String, String)>>,
}

impl std::fmt::Debug for SelfSignedCa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelfSignedCa").finish_non_exhaustive()
    }
}

impl SelfSignedCa {
    /// Generates a fresh self-signed root CA for `org_name`.
    pub fn generate(org_name: &str) -> Result<Self, ControlPlaneError> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, format!("{org_name} popsigner CA"));
        dn.push(DnType::OrganizationName, org_name);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        params.not_before = time::OffsetDateTime::now_utc();
        params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(3650);

        let ca_cert = RcgenCertificate::from_params(params)
            .map_err(|e| ControlPlaneError::Internal(format!("failed to generate CA: {e}")))?;
        let ca_pem = ca_cert
            .serialize_pem()
            .map_err(|e| ControlPlaneError::Internal(format!("failed to serialize CA: {e}")))?
            .into_bytes();

        Ok(Self {
            ca_cert,
            ca_pem,
            revoked: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl PkiProvider for SelfSignedCa {
    async fn issue(&self, common_name: &str, validity: Duration) -> Result<IssuedCertificate, ControlPlaneError> {
        if validity < Duration::from_secs(3600) {
            return Err(ControlPlaneError::BadRequest("certificate validity must be at least 1 hour".into()));
        }

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;
        params.subject_alt_names = vec![SanType::DnsName(common_name.to_string())];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        let not_before = time::OffsetDateTime::now_utc();
        let not_after = not_before + time::Duration::seconds(validity.as_secs() as i64);
        params.not_before = not_before;
        params.not_after = not_after;
        let serial: u64 = rand::random();
        params.serial_number = Some(rcgen::SerialNumber::from(serial.to_be_bytes().to_vec()));

        let cert = RcgenCertificate::from_params(params)
            .map_err(|e| ControlPlaneError::Internal(format!("failed to generate client cert: {e}")))?;
        let cert_der = cert
            .serialize_der_with_signer(&self.ca_cert)
            .map_err(|e| ControlPlaneError::Internal(format!("failed to sign client cert: {e}")))?;
        let cert_pem = cert
            .serialize_pem_with_signer(&self.ca_cert)
            .map_err(|e| ControlPlaneError::Internal(format!("failed to sign client cert: {e}")))?
            .into_bytes();
        let key_pem = cert.serialize_private_key_pem().into_bytes();

        let fingerprint = {
            use sha2::{Digest, Sha256};
            hex::encode(Sha256::digest(&cert_der))
        };

        let now = Utc::now();
        let expires_at = now + ChronoDuration::seconds(validity.as_secs() as i64);

        Ok(IssuedCertificate {
            cert_pem,
            key_pem,
            ca_pem: self.ca_pem.clone(),
            fingerprint,
            serial_number: hex::encode(serial.to_be_bytes()),
            issued_at: now,
            expires_at,
        })
    }

    async fn revoke(&self, serial_number: &str, reason: &str) -> Result<(), ControlPlaneError> {
        self.revoked.lock().push((serial_number.to_string(), reason.to_string()));
        Ok(())
    }

    async fn ca_certificate(&self) -> Result<Vec<u8>, ControlPlaneError> {
        Ok(self.ca_pem.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn issues_cert_signed_by_generated_ca() {
        let ca = SelfSignedCa::generate("acme").unwrap();
        let issued = ca.issue("deployment_abc", Duration::from_secs(3600 * 24)).await.unwrap();
        assert!(issued.cert_pem.starts_with(b"-----BEGIN CERTIFICATE-----"));
        assert!(issued.expires_at > issued.issued_at);
        assert_eq!(issued.fingerprint.len(), 64);
    }

    #[tokio::test]
    async fn rejects_validity_under_one_hour() {
        let ca = SelfSignedCa::generate("acme").unwrap();
        let err = ca.issue("deployment_abc", Duration::from_secs(60)).await.unwrap_err();
        assert!(matches!(err, ControlPlaneError::BadRequest(_)));
    }
}
