//! Error types for device binding operations.

use dsr_crypto::CryptoError;
use dsr_keystore::KeystoreError;
use thiserror::Error;

/// Errors that can occur while registering or attesting a device.
///
/// Errors are `Clone` so a failed run can publish the error in its terminal
/// state and return it to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceBindingError {
    /// The platform keystore failed or holds no usable entry.
    #[error("Keystore unavailable: {reason}")]
    KeystoreUnavailable {
        /// Reason for the failure.
        reason: String,
    },

    /// A hardware capability (StrongBox, attest key) is missing.
    #[error("Capability unsupported: {capability}")]
    CapabilityUnsupported {
        /// The missing capability.
        capability: String,
    },

    /// The device integrity service refused or failed.
    #[error("Integrity service error: {detail}")]
    IntegrityServiceError {
        /// Vendor error detail.
        detail: String,
    },

    /// A signature could not be produced.
    #[error("Signing error: {reason}")]
    SigningError {
        /// Reason for the failure.
        reason: String,
    },

    /// The remote service answered with an error body.
    #[error("Error: {message}, ErrorCode: {code}")]
    RemoteServiceError {
        /// Service error code, or the HTTP status when the body had none.
        code: String,
        /// Service error description.
        message: String,
    },

    /// The device token was still pending when the polling deadline passed.
    #[error("Device token not ready after {waited_ms} ms")]
    TokenNotReady {
        /// Time spent polling.
        waited_ms: u64,
    },

    /// The remote service answered with an unexpected body.
    #[error("Malformed response: {reason}")]
    MalformedResponse {
        /// What was wrong with the body.
        reason: String,
    },

    /// An artifact required to build a token was missing or empty.
    #[error("Missing artifact: {artifact}")]
    MissingArtifact {
        /// Name of the missing artifact.
        artifact: &'static str,
    },

    /// The request never produced an HTTP response.
    #[error("Transport error: {message}")]
    TransportError {
        /// Error message.
        message: String,
    },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    ConfigError {
        /// Error message.
        message: String,
    },
}

impl DeviceBindingError {
    /// Create a keystore error from a reason.
    #[must_use]
    pub fn keystore(reason: impl Into<String>) -> Self {
        Self::KeystoreUnavailable {
            reason: reason.into(),
        }
    }

    /// Create a signing error from a reason.
    #[must_use]
    pub fn signing(reason: impl Into<String>) -> Self {
        Self::SigningError {
            reason: reason.into(),
        }
    }

    /// Create an integrity service error.
    #[must_use]
    pub fn integrity(detail: impl Into<String>) -> Self {
        Self::IntegrityServiceError {
            detail: detail.into(),
        }
    }

    /// Create a malformed response error.
    #[must_use]
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedResponse {
            reason: reason.into(),
        }
    }

    /// Create a remote service error.
    #[must_use]
    pub fn remote(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RemoteServiceError {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Create a transport error.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::TransportError {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }

    /// "Ask again later": the server has not decided yet.
    ///
    /// Callers may restart polling instead of the whole run.
    #[must_use]
    pub fn is_token_not_ready(&self) -> bool {
        matches!(self, Self::TokenNotReady { .. })
    }

    /// Error code to show next to the message.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::RemoteServiceError { code, .. } => Some(code),
            Self::TokenNotReady { .. } => Some("202"),
            _ => None,
        }
    }
}

impl From<KeystoreError> for DeviceBindingError {
    fn from(err: KeystoreError) -> Self {
        match err {
            KeystoreError::CapabilityUnsupported { capability } => {
                Self::CapabilityUnsupported { capability }
            },
            KeystoreError::SigningFailed { reason } => Self::SigningError { reason },
            other => Self::KeystoreUnavailable {
                reason: other.to_string(),
            },
        }
    }
}

impl From<CryptoError> for DeviceBindingError {
    fn from(err: CryptoError) -> Self {
        Self::SigningError {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keystore_mapping() {
        let err: DeviceBindingError = KeystoreError::unsupported("StrongBox").into();
        assert_eq!(
            err,
            DeviceBindingError::CapabilityUnsupported {
                capability: "StrongBox".into()
            }
        );

        let err: DeviceBindingError = KeystoreError::KeyNotFound {
            alias: "mTLSKeyPair".into(),
        }
        .into();
        assert!(matches!(err, DeviceBindingError::KeystoreUnavailable { .. }));

        let err: DeviceBindingError = KeystoreError::signing("bad handle").into();
        assert!(matches!(err, DeviceBindingError::SigningError { .. }));
    }

    #[test]
    fn test_remote_error_message() {
        let err = DeviceBindingError::remote("DEVICE_UNKNOWN", "Device not registered");
        assert_eq!(
            err.to_string(),
            "Error: Device not registered, ErrorCode: DEVICE_UNKNOWN"
        );
        assert_eq!(err.code(), Some("DEVICE_UNKNOWN"));
    }

    #[test]
    fn test_token_not_ready_is_distinguished() {
        let err = DeviceBindingError::TokenNotReady { waited_ms: 60_000 };
        assert!(err.is_token_not_ready());
        assert_eq!(err.code(), Some("202"));
        assert!(!DeviceBindingError::transport("reset").is_token_not_ready());
    }
}
