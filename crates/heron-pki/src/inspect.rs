//! Certificate inspection: parsing, chain verification, and the derived
//! status views. Nothing here touches the filesystem; callers hand in PEM.

use chrono::{DateTime, Utc};
use rcgen::{KeyPair, PublicKeyData};
use serde::{Deserialize, Serialize};
use x509_parser::prelude::*;

use crate::error::PkiError;
use crate::fingerprint;

const SECS_PER_DAY: i64 = 86_400;

/// Read-only view of one identity's leaf, computed on demand.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateStatus {
    pub identity: String,
    pub exists: bool,
    pub valid: bool,
    pub subject: Option<String>,
    pub issuer: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub days_until_expiry: Option<i64>,
    pub needs_renewal: bool,
    pub fingerprint: Option<String>,
    /// Why the certificate is not valid.
    pub reason: Option<String>,
}

/// Read-only view of the CA.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaStatus {
    pub exists: bool,
    pub valid: bool,
    pub subject: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub days_until_expiry: Option<i64>,
    pub fingerprint: Option<String>,
    pub reason: Option<String>,
}

/// Fields pulled from a parsed certificate.
#[derive(Debug, Clone)]
pub struct CertFacts {
    pub subject: String,
    pub issuer: String,
    pub not_before: i64,
    pub not_after: i64,
    pub is_ca: bool,
    pub fingerprint: String,
}

impl CertFacts {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp(self.not_after, 0)
    }

    /// Whole days (floor) from `now` until expiry. Negative once expired.
    pub fn days_until_expiry(&self, now: DateTime<Utc>) -> i64 {
        (self.not_after - now.timestamp()).div_euclid(SECS_PER_DAY)
    }

    pub fn in_window(&self, now: DateTime<Utc>) -> bool {
        let now = now.timestamp();
        self.not_before <= now && now <= self.not_after
    }
}

/// Decode the first `CERTIFICATE` block of a PEM document.
pub fn pem_to_der(pem_text: &[u8]) -> Result<Vec<u8>, PkiError> {
    let parsed = ::pem::parse(pem_text).map_err(|e| PkiError::Parse(format!("invalid PEM: {e}")))?;
    if parsed.tag() != "CERTIFICATE" {
        return Err(PkiError::Parse(format!(
            "expected CERTIFICATE, found {}",
            parsed.tag()
        )));
    }
    Ok(parsed.contents().to_vec())
}

pub fn read_facts(der: &[u8]) -> Result<CertFacts, PkiError> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| PkiError::Parse(format!("failed to parse certificate: {e}")))?;
    Ok(CertFacts {
        subject: cert.subject().to_string(),
        issuer: cert.issuer().to_string(),
        not_before: cert.validity().not_before.timestamp(),
        not_after: cert.validity().not_after.timestamp(),
        is_ca: cert.is_ca(),
        fingerprint: fingerprint::fingerprint_sha256(der),
    })
}

/// Verify that `leaf_der` was issued and signed by `ca_der`.
pub fn verify_chain(leaf_der: &[u8], ca_der: &[u8]) -> Result<(), String> {
    let (_, leaf) = X509Certificate::from_der(leaf_der)
        .map_err(|e| format!("failed to parse certificate: {e}"))?;
    let (_, ca) =
        X509Certificate::from_der(ca_der).map_err(|e| format!("failed to parse CA: {e}"))?;

    if leaf.issuer().as_raw() != ca.subject().as_raw() {
        return Err("issuer does not match CA subject".to_string());
    }
    leaf.verify_signature(Some(ca.public_key()))
        .map_err(|_| "signature does not verify against CA".to_string())
}

/// Whether `key_pem` is the private half of the certificate's public key.
pub fn key_matches(cert_der: &[u8], key_pem: &str) -> Result<bool, PkiError> {
    let key = KeyPair::from_pem(key_pem)
        .map_err(|e| PkiError::Parse(format!("failed to parse private key: {e}")))?;
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| PkiError::Parse(format!("failed to parse certificate: {e}")))?;
    Ok(cert.public_key().raw == key.subject_public_key_info().as_slice())
}

/// Derive a leaf's status from its material.
///
/// Valid means: cert and key parse, the key matches, the chain verifies
/// against `ca_der`, and `now` is inside the validity window.
pub fn inspect_leaf(
    identity: &str,
    cert_pem: Option<&str>,
    key_pem: Option<&str>,
    ca_der: Option<&[u8]>,
    renewal_threshold_days: u32,
    now: DateTime<Utc>,
) -> CertificateStatus {
    let mut status = CertificateStatus {
        identity: identity.to_string(),
        ..CertificateStatus::default()
    };

    let Some(cert_pem) = cert_pem else {
        status.reason = Some("certificate missing".to_string());
        return status;
    };
    status.exists = true;

    let facts = match pem_to_der(cert_pem.as_bytes()).and_then(|der| {
        let facts = read_facts(&der)?;
        Ok((der, facts))
    }) {
        Ok(parsed) => parsed,
        Err(e) => {
            status.reason = Some(format!("certificate unreadable: {e}"));
            return status;
        }
    };
    let (der, facts) = facts;

    let days = facts.days_until_expiry(now);
    status.subject = Some(facts.subject.clone());
    status.issuer = Some(facts.issuer.clone());
    status.expires_at = facts.expires_at();
    status.days_until_expiry = Some(days);
    status.needs_renewal = days <= i64::from(renewal_threshold_days);
    status.fingerprint = Some(facts.fingerprint.clone());

    let reason = match (key_pem, ca_der) {
        (None, _) => Some("private key missing".to_string()),
        (_, None) => Some("CA certificate missing".to_string()),
        (Some(key_pem), Some(ca_der)) => match key_matches(&der, key_pem) {
            Err(e) => Some(e.to_string()),
            Ok(false) => Some("private key does not match certificate".to_string()),
            Ok(true) => match verify_chain(&der, ca_der) {
                Err(e) => Some(e),
                Ok(()) if !facts.in_window(now) => {
                    Some(if now.timestamp() < facts.not_before {
                        "certificate not yet valid".to_string()
                    } else {
                        "certificate expired".to_string()
                    })
                }
                Ok(()) => None,
            },
        },
    };
    status.valid = reason.is_none();
    status.reason = reason;
    status
}

/// Derive the CA's status from its material.
pub fn inspect_ca(cert_pem: Option<&str>, key_pem: Option<&str>, now: DateTime<Utc>) -> CaStatus {
    let mut status = CaStatus::default();
    let Some(cert_pem) = cert_pem else {
        status.reason = Some("CA certificate missing".to_string());
        return status;
    };
    status.exists = true;

    let (der, facts) = match pem_to_der(cert_pem.as_bytes()).and_then(|der| {
        let facts = read_facts(&der)?;
        Ok((der, facts))
    }) {
        Ok(parsed) => parsed,
        Err(e) => {
            status.reason = Some(format!("CA certificate unreadable: {e}"));
            return status;
        }
    };

    status.subject = Some(facts.subject.clone());
    status.expires_at = facts.expires_at();
    status.days_until_expiry = Some(facts.days_until_expiry(now));
    status.fingerprint = Some(facts.fingerprint.clone());

    let reason = if !facts.is_ca {
        Some("certificate is not a CA".to_string())
    } else if verify_chain(&der, &der).is_err() {
        Some("CA is not self-signed".to_string())
    } else if !facts.in_window(now) {
        Some("CA certificate outside its validity window".to_string())
    } else {
        match key_pem.map(|k| key_matches(&der, k)) {
            None => Some("CA key missing".to_string()),
            Some(Err(e)) => Some(e.to_string()),
            Some(Ok(false)) => Some("CA key does not match CA certificate".to_string()),
            Some(Ok(true)) => None,
        }
    };
    status.valid = reason.is_none();
    status.reason = reason;
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::CertificateAuthority;
    use chrono::Duration;
    use heron_config::{Identity, PkiSettings};

    struct Material {
        ca: CertificateAuthority,
        cert_pem: String,
        key_pem: String,
        facts: CertFacts,
    }

    fn material() -> Material {
        let settings = PkiSettings::default();
        let ca = CertificateAuthority::generate(&settings).unwrap();
        let leaf = ca
            .issue_leaf(&Identity::new("redis", "10.0.0.5"), &settings)
            .unwrap();
        let facts = read_facts(&pem_to_der(leaf.cert_pem.as_bytes()).unwrap()).unwrap();
        Material {
            ca,
            cert_pem: leaf.cert_pem,
            key_pem: leaf.key_pem,
            facts,
        }
    }

    fn at_days_before_expiry(facts: &CertFacts, days: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(facts.not_after, 0).unwrap() - Duration::days(days)
    }

    #[test]
    fn fresh_leaf_is_valid() {
        let m = material();
        let status = inspect_leaf(
            "redis",
            Some(&m.cert_pem),
            Some(&m.key_pem),
            Some(m.ca.cert_der()),
            30,
            Utc::now(),
        );
        assert!(status.exists);
        assert!(status.valid, "{:?}", status.reason);
        assert!(!status.needs_renewal);
        // Issued within the last second, so 364 or 365 whole days remain.
        assert!(matches!(status.days_until_expiry, Some(364) | Some(365)));
        assert!(status.subject.unwrap().contains("CN=redis"));
    }

    #[test]
    fn renewal_boundary_is_inclusive() {
        let m = material();
        let check = |days_left| {
            inspect_leaf(
                "redis",
                Some(&m.cert_pem),
                Some(&m.key_pem),
                Some(m.ca.cert_der()),
                30,
                at_days_before_expiry(&m.facts, days_left),
            )
        };

        let at_threshold = check(30);
        assert_eq!(at_threshold.days_until_expiry, Some(30));
        assert!(at_threshold.needs_renewal);

        let above = check(31);
        assert_eq!(above.days_until_expiry, Some(31));
        assert!(!above.needs_renewal);
    }

    #[test]
    fn expired_leaf_is_invalid_and_needs_renewal() {
        let m = material();
        let status = inspect_leaf(
            "redis",
            Some(&m.cert_pem),
            Some(&m.key_pem),
            Some(m.ca.cert_der()),
            30,
            at_days_before_expiry(&m.facts, -2),
        );
        assert!(!status.valid);
        assert!(status.needs_renewal);
        assert_eq!(status.reason.as_deref(), Some("certificate expired"));
    }

    #[test]
    fn existing_but_foreign_leaf_is_not_valid() {
        let m = material();
        let other_ca = CertificateAuthority::generate(&PkiSettings::default()).unwrap();
        let status = inspect_leaf(
            "redis",
            Some(&m.cert_pem),
            Some(&m.key_pem),
            Some(other_ca.cert_der()),
            30,
            Utc::now(),
        );
        assert!(status.exists);
        assert!(!status.valid);
    }

    #[test]
    fn swapped_key_is_detected() {
        let m = material();
        let other = m
            .ca
            .issue_leaf(&Identity::new("backend", "10.0.0.2"), &PkiSettings::default())
            .unwrap();
        let status = inspect_leaf(
            "redis",
            Some(&m.cert_pem),
            Some(&other.key_pem),
            Some(m.ca.cert_der()),
            30,
            Utc::now(),
        );
        assert_eq!(
            status.reason.as_deref(),
            Some("private key does not match certificate")
        );
    }

    #[test]
    fn missing_cert_does_not_exist() {
        let status = inspect_leaf("redis", None, None, None, 30, Utc::now());
        assert!(!status.exists);
        assert!(!status.valid);
        assert!(!status.needs_renewal);
    }

    #[test]
    fn garbage_pem_is_unreadable() {
        let status = inspect_leaf("redis", Some("not a pem"), None, None, 30, Utc::now());
        assert!(status.exists);
        assert!(!status.valid);
        assert!(status.reason.unwrap().starts_with("certificate unreadable"));
    }

    #[test]
    fn ca_status_reports_valid_root() {
        let m = material();
        let ca_pem = m.ca.cert_pem().to_string();
        let layout = crate::certfiles::CertLayout::new(heron_common::test::temp_dir("inspect-ca"));
        m.ca.save(&layout).unwrap();
        let key = std::fs::read_to_string(layout.ca_key()).unwrap();
        let status = inspect_ca(Some(&ca_pem), Some(&key), Utc::now());
        assert!(status.valid, "{:?}", status.reason);
        assert_eq!(status.fingerprint, Some(m.ca.fingerprint()));

        let no_key = inspect_ca(Some(&ca_pem), None, Utc::now());
        assert!(!no_key.valid);
    }

    #[test]
    fn leaf_is_not_a_valid_ca() {
        let m = material();
        let status = inspect_ca(Some(&m.cert_pem), Some(&m.key_pem), Utc::now());
        assert_eq!(status.reason.as_deref(), Some("certificate is not a CA"));
    }
}
