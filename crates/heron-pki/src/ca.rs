//! Certificate Authority creation and leaf issuance.
//!
//! One self-signed root per fleet. Leaves go through a real certificate
//! request: the identity key signs a CSR carrying its SAN set, and the CA
//! side sets subject, validity, and key usages before signing.

use chrono::{DateTime, Utc};
use rcgen::string::{Ia5String, PrintableString};
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, DnValue, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
    SignatureAlgorithm,
};

use heron_config::{Identity, KeyAlgorithm, PkiSettings};

use crate::certfiles::{self, CertLayout};
use crate::error::PkiError;
use crate::fingerprint;
use crate::inspect;

/// A loaded (or freshly created) CA. Holds the signing key in PEM form.
pub struct CertificateAuthority {
    cert_pem: String,
    key_pem: String,
    cert_der: Vec<u8>,
}

/// A freshly signed leaf certificate and its key.
#[derive(Debug)]
pub struct IssuedLeaf {
    pub identity: String,
    pub cert_pem: String,
    pub key_pem: String,
    pub fingerprint: String,
    pub not_after: DateTime<Utc>,
}

pub fn signature_algorithm(algorithm: KeyAlgorithm) -> &'static SignatureAlgorithm {
    match algorithm {
        KeyAlgorithm::EcdsaP256 => &rcgen::PKCS_ECDSA_P256_SHA256,
        KeyAlgorithm::EcdsaP384 => &rcgen::PKCS_ECDSA_P384_SHA384,
    }
}

pub fn generate_key(algorithm: KeyAlgorithm) -> Result<KeyPair, PkiError> {
    KeyPair::generate_for(signature_algorithm(algorithm))
        .map_err(|e| PkiError::Generation(format!("{algorithm} key generation: {e}")))
}

fn compute_validity(days: u32) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    let not_after = now + ::time::Duration::days(i64::from(days));
    (now, not_after)
}

/// IP-parseable entries become IP SANs, the rest DNS SANs.
fn san_entries(sans: &[String]) -> Result<Vec<SanType>, PkiError> {
    sans.iter()
        .map(|san| match san.parse::<std::net::IpAddr>() {
            Ok(ip) => Ok(SanType::IpAddress(ip)),
            Err(_) => Ia5String::try_from(san.clone())
                .map(SanType::DnsName)
                .map_err(|e| PkiError::Generation(format!("invalid DNS name '{san}': {e}"))),
        })
        .collect()
}

impl CertificateAuthority {
    /// Create a new self-signed root.
    pub fn generate(settings: &PkiSettings) -> Result<Self, PkiError> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(settings.ca_common_name.clone()),
        );
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String(settings.organization.clone()),
        );
        let country = PrintableString::try_from(settings.country.clone())
            .map_err(|e| PkiError::Generation(format!("invalid country '{}': {e}", settings.country)))?;
        dn.push(DnType::CountryName, DnValue::PrintableString(country));
        params.distinguished_name = dn;

        // Signs leaves only, never intermediates.
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let (not_before, not_after) = compute_validity(settings.ca_validity_days);
        params.not_before = not_before;
        params.not_after = not_after;

        let key_pair = generate_key(settings.key_algorithm)?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| PkiError::Generation(format!("failed to create CA cert: {e}")))?;

        Ok(Self {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
            cert_der: cert.der().to_vec(),
        })
    }

    /// Rebuild from PEM, checking that the key belongs to the certificate.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, PkiError> {
        let cert_der = inspect::pem_to_der(cert_pem.as_bytes())?;
        if !inspect::key_matches(&cert_der, key_pem)? {
            return Err(PkiError::Certificate(
                "CA key does not match CA certificate".to_string(),
            ));
        }
        Ok(Self {
            cert_pem: cert_pem.to_string(),
            key_pem: key_pem.to_string(),
            cert_der,
        })
    }

    pub fn load(layout: &CertLayout) -> Result<Self, PkiError> {
        let cert_path = layout.ca_cert();
        let key_path = layout.ca_key();
        if !cert_path.exists() || !key_path.exists() {
            return Err(PkiError::CaMissing);
        }
        let cert_pem = std::fs::read_to_string(&cert_path)?;
        let key_pem = std::fs::read_to_string(&key_path)?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    pub fn save(&self, layout: &CertLayout) -> Result<(), std::io::Error> {
        certfiles::write_private(&layout.ca_key(), &self.key_pem)?;
        certfiles::write_public(&layout.ca_cert(), &self.cert_pem)?;
        tracing::info!(path = %layout.root().display(), "CA written");
        Ok(())
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn cert_der(&self) -> &[u8] {
        &self.cert_der
    }

    pub fn fingerprint(&self) -> String {
        fingerprint::fingerprint_sha256(&self.cert_der)
    }

    /// Issue a leaf for `identity`, usable for both server and client auth.
    pub fn issue_leaf(
        &self,
        identity: &Identity,
        settings: &PkiSettings,
    ) -> Result<IssuedLeaf, PkiError> {
        // Identity side: key pair and a CSR carrying the SAN set.
        let leaf_key = generate_key(settings.key_algorithm)?;
        let mut request = CertificateParams::default();
        let mut requested_dn = DistinguishedName::new();
        requested_dn.push(DnType::CommonName, DnValue::Utf8String(identity.name.clone()));
        request.distinguished_name = requested_dn;
        request.subject_alt_names = san_entries(&identity.effective_sans())?;

        let csr_pem = request
            .serialize_request(&leaf_key)
            .map_err(|e| PkiError::Generation(format!("failed to create CSR: {e}")))?
            .pem()
            .map_err(|e| PkiError::Generation(format!("failed to serialize CSR: {e}")))?;

        // CA side: SANs come from the request, everything else is ours.
        let mut csr_params = CertificateSigningRequestParams::from_pem(&csr_pem)
            .map_err(|e| PkiError::Parse(format!("failed to parse CSR: {e}")))?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(identity.name.clone()));
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String(settings.organization.clone()),
        );
        csr_params.params.distinguished_name = dn;
        csr_params.params.is_ca = IsCa::ExplicitNoCa;
        csr_params.params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        csr_params.params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        csr_params.params.use_authority_key_identifier_extension = true;

        let (not_before, not_after) = compute_validity(settings.leaf_validity_days);
        csr_params.params.not_before = not_before;
        csr_params.params.not_after = not_after;

        let ca_key = KeyPair::from_pem(&self.key_pem)
            .map_err(|e| PkiError::Parse(format!("failed to parse CA key: {e}")))?;
        let issuer = Issuer::from_ca_cert_pem(&self.cert_pem, &ca_key)
            .map_err(|e| PkiError::Parse(format!("failed to create issuer: {e}")))?;

        let cert = csr_params
            .signed_by(&issuer)
            .map_err(|e| PkiError::Generation(format!("failed to sign certificate: {e}")))?;

        let not_after = DateTime::<Utc>::from_timestamp(not_after.unix_timestamp(), 0)
            .unwrap_or_else(Utc::now);

        Ok(IssuedLeaf {
            identity: identity.name.clone(),
            cert_pem: cert.pem(),
            key_pem: leaf_key.serialize_pem(),
            fingerprint: fingerprint::fingerprint_sha256(cert.der()),
            not_after,
        })
    }
}
