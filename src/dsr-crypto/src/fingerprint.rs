//! Public key extraction and fingerprints.
//!
//! Token subjects are identified by `SHA-256` over the `subjectPublicKey`
//! bit string of a key's SubjectPublicKeyInfo, i.e. the SEC1 point itself
//! without the algorithm identifier.

use der::asn1::ObjectIdentifier;
use der::{Decode, Encode};
use sha2::{Digest, Sha256};
use spki::SubjectPublicKeyInfoRef;
use x509_cert::Certificate;

use crate::error::CryptoError;

/// Public key pulled out of an SPKI structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyInfo {
    /// Named curve from the algorithm parameters, if present.
    pub curve: Option<ObjectIdentifier>,
    /// SEC1-encoded point.
    pub point: Vec<u8>,
}

impl PublicKeyInfo {
    /// Parse a DER SubjectPublicKeyInfo.
    ///
    /// # Errors
    ///
    /// Returns error if the DER is malformed or the key bits are not
    /// octet-aligned.
    pub fn from_spki_der(spki_der: &[u8]) -> Result<Self, CryptoError> {
        let spki = SubjectPublicKeyInfoRef::from_der(spki_der)
            .map_err(|e| CryptoError::invalid_public_key(e.to_string()))?;
        let point = spki
            .subject_public_key
            .as_bytes()
            .ok_or_else(|| CryptoError::invalid_public_key("subjectPublicKey has unused bits"))?
            .to_vec();
        let curve = spki.algorithm.parameters_oid().ok();
        Ok(Self { curve, point })
    }

    /// Whether the key is on the curve identified by the dotted `oid`.
    #[must_use]
    pub fn is_on_curve(&self, oid: &str) -> bool {
        self.curve
            .map(|c| c.to_string() == oid)
            .unwrap_or(false)
    }

    /// `SHA-256(point)`.
    #[must_use]
    pub fn fingerprint(&self) -> [u8; 32] {
        Sha256::digest(&self.point).into()
    }
}

/// `SHA-256` over the subjectPublicKey bits of `spki_der`.
///
/// # Errors
///
/// Returns error if `spki_der` is not a valid SubjectPublicKeyInfo.
pub fn public_key_fingerprint(spki_der: &[u8]) -> Result<[u8; 32], CryptoError> {
    PublicKeyInfo::from_spki_der(spki_der).map(|info| info.fingerprint())
}

/// DER SubjectPublicKeyInfo of an X.509 certificate.
///
/// # Errors
///
/// Returns error if the certificate cannot be parsed.
pub fn certificate_spki(cert_der: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cert = Certificate::from_der(cert_der)
        .map_err(|e| CryptoError::invalid_certificate(e.to_string()))?;
    cert.tbs_certificate
        .subject_public_key_info
        .to_der()
        .map_err(|e| CryptoError::invalid_certificate(e.to_string()))
}

/// Public key of an X.509 certificate.
///
/// # Errors
///
/// Returns error if the certificate or its key cannot be parsed.
pub fn certificate_public_key(cert_der: &[u8]) -> Result<PublicKeyInfo, CryptoError> {
    PublicKeyInfo::from_spki_der(&certificate_spki(cert_der)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    // SPKI of a P-256 key with point 0x04 || 0x01*64 (not on the curve, but
    // well-formed DER).
    fn sample_spki() -> Vec<u8> {
        let mut der = vec![
            0x30, 0x59, 0x30, 0x13, 0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01, 0x06,
            0x08, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07, 0x03, 0x42, 0x00, 0x04,
        ];
        der.extend_from_slice(&[0x01; 64]);
        der
    }

    #[test]
    fn test_spki_point_and_curve() {
        let info = PublicKeyInfo::from_spki_der(&sample_spki()).unwrap();
        assert_eq!(info.point.len(), 65);
        assert_eq!(info.point[0], 0x04);
        assert!(info.is_on_curve("1.2.840.10045.3.1.7"));
        assert!(!info.is_on_curve("1.3.36.3.3.2.8.1.1.7"));
    }

    #[test]
    fn test_fingerprint_hashes_point_only() {
        let spki = sample_spki();
        let mut point = vec![0x04];
        point.extend_from_slice(&[0x01; 64]);
        let expected: [u8; 32] = Sha256::digest(&point).into();
        assert_eq!(public_key_fingerprint(&spki).unwrap(), expected);
    }

    #[test]
    fn test_rejects_truncated_spki() {
        let spki = sample_spki();
        assert!(public_key_fingerprint(&spki[..20]).is_err());
        assert!(certificate_spki(&spki).is_err());
    }
}
