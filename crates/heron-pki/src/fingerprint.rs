//! Certificate fingerprints.
//!
//! Used to prove that the material on a remote host is byte-for-byte the
//! material issued locally.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// SHA-256 of a DER certificate as lowercase hex.
pub fn fingerprint_sha256(cert_der: &[u8]) -> String {
    let hash = Sha256::digest(cert_der);
    hex_encode(&hash)
}

/// Compare two fingerprint strings in constant time.
pub fn fingerprints_match(a: &str, b: &str) -> bool {
    let a_bytes = a.as_bytes();
    let b_bytes = b.as_bytes();

    if a_bytes.len() != b_bytes.len() {
        return false;
    }

    a_bytes.ct_eq(b_bytes).into()
}

/// Constant-time equality for secret bytes (private key PEM read back
/// from a host).
pub fn secrets_match(a: &[u8], b: &[u8]) -> bool {
    let ha = Sha256::digest(a);
    let hb = Sha256::digest(b);
    ha.as_slice().ct_eq(hb.as_slice()).into()
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}
