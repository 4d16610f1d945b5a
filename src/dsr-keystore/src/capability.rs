//! Keystore capability trait and key generation parameters.
//!
//! [`KeystoreCapability`] is the seam between the protocol engine and the
//! platform keystore. Everything that touches key material goes through it,
//! so tests and desktop builds can substitute an in-memory implementation.

use crate::error::KeystoreError;
use crate::types::{AttestationChain, KeyPairRecord, KeyPurpose, PlatformCapabilities, ValidityWindow};

/// Parameters for generating an attested EC P-256 key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyGenSpec {
    /// Alias the key is stored under. An existing entry is replaced.
    pub alias: String,
    /// Key purpose.
    pub purpose: KeyPurpose,
    /// Attestation challenge.
    pub challenge: Vec<u8>,
    /// Certificate validity.
    pub validity: ValidityWindow,
    /// Generate inside the secure element.
    pub strongbox: bool,
    /// Let the attest key under this alias sign the attestation instead of
    /// the factory key.
    pub attest_key_alias: Option<String>,
}

impl KeyGenSpec {
    /// Spec for an ordinary signing key.
    #[must_use]
    pub fn signing(alias: impl Into<String>, challenge: impl Into<Vec<u8>>, validity: ValidityWindow) -> Self {
        Self {
            alias: alias.into(),
            purpose: KeyPurpose::Sign,
            challenge: challenge.into(),
            validity,
            strongbox: false,
            attest_key_alias: None,
        }
    }

    /// Spec for an attest key.
    #[must_use]
    pub fn attest_key(alias: impl Into<String>, challenge: impl Into<Vec<u8>>, validity: ValidityWindow) -> Self {
        Self {
            purpose: KeyPurpose::AttestKey,
            ..Self::signing(alias, challenge, validity)
        }
    }

    /// Request secure element backing.
    #[must_use]
    pub fn strongbox(mut self, strongbox: bool) -> Self {
        self.strongbox = strongbox;
        self
    }

    /// Sign the attestation with the attest key stored under `alias`.
    #[must_use]
    pub fn attested_by(mut self, alias: impl Into<String>) -> Self {
        self.attest_key_alias = Some(alias.into());
        self
    }
}

/// Platform keystore operations.
///
/// Methods are synchronous: keystore calls are local, and the TLS stack
/// signs handshake messages through [`KeystoreCapability::sign`] from a
/// synchronous callback.
///
/// ## Implementations
///
/// - Android: JNI bridge to `AndroidKeyStore` (host application)
/// - Fallback: [`crate::SoftwareKeystore`] (feature: `software`)
pub trait KeystoreCapability: Send + Sync {
    /// Optional hardware features of this keystore.
    fn capabilities(&self) -> PlatformCapabilities;

    /// Generate an EC P-256 key pair with an attestation certificate chain.
    ///
    /// # Errors
    ///
    /// Returns [`KeystoreError::CapabilityUnsupported`] if the spec asks for
    /// a feature the platform lacks, or another error if generation fails.
    fn generate_key(&self, spec: &KeyGenSpec) -> Result<KeyPairRecord, KeystoreError>;

    /// Certificate chain of the key under `alias`, leaf first.
    fn certificate_chain(&self, alias: &str) -> Result<AttestationChain, KeystoreError>;

    /// Leaf certificate (key entries) or stored certificate (trusted entries).
    fn certificate(&self, alias: &str) -> Result<Vec<u8>, KeystoreError>;

    /// Store a DER certificate as a trusted entry under `alias`.
    fn set_certificate(&self, alias: &str, cert_der: &[u8]) -> Result<(), KeystoreError>;

    /// Remove the entry under `alias`.
    ///
    /// # Errors
    ///
    /// Returns [`KeystoreError::KeyNotFound`] if no entry exists.
    fn delete_alias(&self, alias: &str) -> Result<(), KeystoreError>;

    /// Whether an entry exists under `alias`.
    fn contains_alias(&self, alias: &str) -> Result<bool, KeystoreError>;

    /// `SHA256withECDSA` signature by the key under `alias`, DER encoded.
    fn sign(&self, alias: &str, data: &[u8]) -> Result<Vec<u8>, KeystoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_spec_builder() {
        let window = ValidityWindow::starting_at(Utc::now());
        let spec = KeyGenSpec::signing("k", vec![1, 2], window)
            .strongbox(true)
            .attested_by("attestKey");
        assert_eq!(spec.purpose, KeyPurpose::Sign);
        assert!(spec.strongbox);
        assert_eq!(spec.attest_key_alias.as_deref(), Some("attestKey"));

        let attest = KeyGenSpec::attest_key("a", vec![3], window);
        assert_eq!(attest.purpose, KeyPurpose::AttestKey);
        assert!(attest.attest_key_alias.is_none());
    }
}
