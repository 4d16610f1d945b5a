//! Key records, aliases and attestation types.

use chrono::{DateTime, Duration, Utc};
use der::asn1::{ObjectIdentifier, OctetString};
use der::{Decode, Sequence};
use x509_cert::Certificate;

use crate::error::KeystoreError;

// ============================================================================
// Aliases
// ============================================================================

/// Trusted-certificate entry holding the GMS-issued client certificate.
/// Its presence marks a completed registration.
pub const MTLS_CERT_ALIAS: &str = "mTLSCertificate";

/// Key pair used for mutual TLS and for signing attestation tokens.
pub const MTLS_KEYPAIR_ALIAS: &str = "mTLSKeyPair";

/// Long-lived key that signs attestations of other keys.
pub const ATTEST_KEY_ALIAS: &str = "attestKey";

/// One-shot key pair generated for each device attestation.
pub const ATTESTATION_KEYPAIR_ALIAS: &str = "attestationKeyPair";

/// Every alias managed by the device binding client.
pub const MANAGED_ALIASES: [&str; 4] = [
    MTLS_CERT_ALIAS,
    MTLS_KEYPAIR_ALIAS,
    ATTEST_KEY_ALIAS,
    ATTESTATION_KEYPAIR_ALIAS,
];

/// Default lifetime of generated signing keys.
pub const DEFAULT_KEY_VALIDITY_DAYS: i64 = 365;

/// Extension carrying the key description in attestation certificates.
pub const KEY_DESCRIPTION_OID: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.11129.2.1.17");

// ============================================================================
// Key generation inputs
// ============================================================================

/// Validity window of a generated key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidityWindow {
    /// Start of validity.
    pub not_before: DateTime<Utc>,
    /// End of validity, `None` for keys that do not expire.
    pub not_after: Option<DateTime<Utc>>,
}

impl ValidityWindow {
    /// `[now, now + days]`.
    #[must_use]
    pub fn days_from(now: DateTime<Utc>, days: i64) -> Self {
        Self {
            not_before: now,
            not_after: Some(now + Duration::days(days)),
        }
    }

    /// Open-ended window starting at `now`.
    #[must_use]
    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self {
            not_before: now,
            not_after: None,
        }
    }

    /// Whether `at` falls inside the window.
    #[must_use]
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.not_before && self.not_after.map_or(true, |end| at <= end)
    }
}

/// What a generated key is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyPurpose {
    /// Ordinary signing key (TLS client auth, JWS).
    Sign,
    /// Key that signs attestation certificates of other keys.
    AttestKey,
}

/// Security level the key material lives at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SecurityLevel {
    /// Plain process memory.
    Software = 0,
    /// Trusted execution environment.
    TrustedEnvironment = 1,
    /// Dedicated secure element.
    StrongBox = 2,
}

impl SecurityLevel {
    fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Software),
            1 => Some(Self::TrustedEnvironment),
            2 => Some(Self::StrongBox),
            _ => None,
        }
    }
}

/// Optional hardware features a keystore may offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlatformCapabilities {
    /// Keys can be generated inside a dedicated secure element.
    pub strongbox: bool,
    /// Keys with purpose [`KeyPurpose::AttestKey`] are supported.
    pub attest_key: bool,
}

// ============================================================================
// Outputs
// ============================================================================

/// Public description of a generated key pair.
///
/// The private key stays inside the keystore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPairRecord {
    /// Keystore alias.
    pub alias: String,
    /// DER SubjectPublicKeyInfo.
    pub public_key: Vec<u8>,
    /// What the key may be used for.
    pub purpose: KeyPurpose,
    /// Validity window baked into the attestation certificate.
    pub validity: ValidityWindow,
    /// Challenge embedded in the attestation.
    pub attestation_challenge: Vec<u8>,
    /// Alias of the attest key that signed the attestation, if any.
    pub attested_by: Option<String>,
}

/// Certificate chain attesting a key, leaf first.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AttestationChain(Vec<Vec<u8>>);

impl AttestationChain {
    /// Wrap DER certificates ordered leaf first.
    #[must_use]
    pub fn new(certificates: Vec<Vec<u8>>) -> Self {
        Self(certificates)
    }

    /// The certificate of the attested key.
    #[must_use]
    pub fn leaf(&self) -> Option<&[u8]> {
        self.0.first().map(Vec::as_slice)
    }

    /// All certificates, leaf first.
    #[must_use]
    pub fn certificates(&self) -> &[Vec<u8>] {
        &self.0
    }

    /// Number of certificates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the chain holds no certificate.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Put `leaf` in front of this chain.
    #[must_use]
    pub fn prepend(mut self, leaf: Vec<u8>) -> Self {
        self.0.insert(0, leaf);
        self
    }

    /// Consume into the DER certificates.
    #[must_use]
    pub fn into_vec(self) -> Vec<Vec<u8>> {
        self.0
    }
}

/// Key description embedded in attestation certificates.
///
/// A reduced form of the Android `KeyDescription` sequence: enough to bind a
/// certificate to the challenge it was generated for.
#[derive(Debug, Clone, PartialEq, Eq, Sequence)]
pub struct KeyDescription {
    /// Format version.
    pub attestation_version: u32,
    /// [`SecurityLevel`] code.
    pub attestation_security_level: u32,
    /// Challenge passed at key generation.
    pub attestation_challenge: OctetString,
}

impl KeyDescription {
    /// Format version written by this crate.
    pub const VERSION: u32 = 200;

    /// Build a description for a new key.
    ///
    /// # Errors
    ///
    /// Returns error if the challenge is too large to encode.
    pub fn new(level: SecurityLevel, challenge: &[u8]) -> Result<Self, KeystoreError> {
        Ok(Self {
            attestation_version: Self::VERSION,
            attestation_security_level: level as u32,
            attestation_challenge: OctetString::new(challenge.to_vec())
                .map_err(|e| KeystoreError::certificate(e.to_string()))?,
        })
    }

    /// Security level, if the code is known.
    #[must_use]
    pub fn security_level(&self) -> Option<SecurityLevel> {
        SecurityLevel::from_code(self.attestation_security_level)
    }

    /// Challenge bytes.
    #[must_use]
    pub fn challenge(&self) -> &[u8] {
        self.attestation_challenge.as_bytes()
    }

    /// Extract the description from a DER attestation certificate.
    ///
    /// Returns `Ok(None)` if the certificate has no such extension.
    ///
    /// # Errors
    ///
    /// Returns error if the certificate or the extension is malformed.
    pub fn from_certificate(cert_der: &[u8]) -> Result<Option<Self>, KeystoreError> {
        let cert = Certificate::from_der(cert_der)
            .map_err(|e| KeystoreError::certificate(e.to_string()))?;
        let Some(extensions) = cert.tbs_certificate.extensions.as_ref() else {
            return Ok(None);
        };
        extensions
            .iter()
            .find(|ext| ext.extn_id == KEY_DESCRIPTION_OID)
            .map(|ext| {
                Self::from_der(ext.extn_value.as_bytes())
                    .map_err(|e| KeystoreError::certificate(e.to_string()))
            })
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use der::Encode;

    #[test]
    fn test_validity_window() {
        let now = Utc::now();
        let window = ValidityWindow::days_from(now, DEFAULT_KEY_VALIDITY_DAYS);
        assert!(window.contains(now + Duration::days(364)));
        assert!(!window.contains(now + Duration::days(366)));
        assert!(!window.contains(now - Duration::seconds(1)));

        let open = ValidityWindow::starting_at(now);
        assert!(open.contains(now + Duration::days(10_000)));
    }

    #[test]
    fn test_chain_prepend_keeps_leaf_first() {
        let chain = AttestationChain::new(vec![vec![2], vec![3]]).prepend(vec![1]);
        assert_eq!(chain.leaf(), Some(&[1u8][..]));
        assert_eq!(chain.len(), 3);
    }

    #[test]
    fn test_key_description_der_roundtrip() {
        let desc = KeyDescription::new(SecurityLevel::StrongBox, b"challenge").unwrap();
        let der = desc.to_der().unwrap();
        let parsed = KeyDescription::from_der(&der).unwrap();
        assert_eq!(parsed.challenge(), b"challenge");
        assert_eq!(parsed.security_level(), Some(SecurityLevel::StrongBox));
    }

    #[test]
    fn test_managed_aliases_distinct() {
        let mut aliases = MANAGED_ALIASES.to_vec();
        aliases.sort_unstable();
        aliases.dedup();
        assert_eq!(aliases.len(), 4);
    }
}
