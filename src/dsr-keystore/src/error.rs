//! Error types for keystore operations.

use thiserror::Error;

/// Errors that can occur during keystore operations.
#[derive(Debug, Error)]
pub enum KeystoreError {
    /// The keystore cannot be reached or is in an unusable state.
    #[error("Keystore unavailable: {reason}")]
    KeystoreUnavailable {
        /// Reason the keystore is unavailable.
        reason: String,
    },

    /// A requested hardware capability is not offered by this platform.
    #[error("Capability unsupported: {capability}")]
    CapabilityUnsupported {
        /// The missing capability.
        capability: String,
    },

    /// No entry under the given alias.
    #[error("Key not found: {alias}")]
    KeyNotFound {
        /// The alias that was not found.
        alias: String,
    },

    /// The alias holds a certificate entry where a key pair was expected.
    #[error("Alias {alias} does not hold a private key")]
    NotAKeyPair {
        /// The offending alias.
        alias: String,
    },

    /// Key generation failed.
    #[error("Key generation failed: {reason}")]
    KeyGenerationFailed {
        /// Reason for the failure.
        reason: String,
    },

    /// Signing operation failed.
    #[error("Signing failed: {reason}")]
    SigningFailed {
        /// Reason for the failure.
        reason: String,
    },

    /// Certificate could not be built, parsed or stored.
    #[error("Certificate error: {reason}")]
    CertificateError {
        /// Reason for the failure.
        reason: String,
    },
}

impl KeystoreError {
    /// Create an unavailable error from a reason.
    #[must_use]
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::KeystoreUnavailable {
            reason: reason.into(),
        }
    }

    /// Create a capability error.
    #[must_use]
    pub fn unsupported(capability: impl Into<String>) -> Self {
        Self::CapabilityUnsupported {
            capability: capability.into(),
        }
    }

    /// Create a key generation error from a reason.
    #[must_use]
    pub fn key_generation(reason: impl Into<String>) -> Self {
        Self::KeyGenerationFailed {
            reason: reason.into(),
        }
    }

    /// Create a signing error from a reason.
    #[must_use]
    pub fn signing(reason: impl Into<String>) -> Self {
        Self::SigningFailed {
            reason: reason.into(),
        }
    }

    /// Create a certificate error from a reason.
    #[must_use]
    pub fn certificate(reason: impl Into<String>) -> Self {
        Self::CertificateError {
            reason: reason.into(),
        }
    }

    /// Whether the failure stems from missing platform support rather than
    /// a broken keystore.
    #[must_use]
    pub fn is_capability_unsupported(&self) -> bool {
        matches!(self, Self::CapabilityUnsupported { .. })
    }
}
