//! Signature algorithm identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// JWS signature algorithm used by the device binding tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignatureAlgorithm {
    /// ECDSA with NIST P-256 (secp256r1) and SHA-256.
    /// Used by hardware-backed device keys.
    #[serde(rename = "ES256")]
    Es256,

    /// ECDSA with brainpoolP256r1 and SHA-256.
    /// Used by health-card credentials.
    #[serde(rename = "BP256R1")]
    Bp256r1,
}

impl SignatureAlgorithm {
    /// The `alg` header value for this algorithm.
    #[must_use]
    pub const fn jws_name(&self) -> &'static str {
        match self {
            Self::Es256 => "ES256",
            Self::Bp256r1 => "BP256R1",
        }
    }

    /// Parse a JWS `alg` header value.
    #[must_use]
    pub fn from_jws_name(name: &str) -> Option<Self> {
        match name {
            "ES256" => Some(Self::Es256),
            "BP256R1" => Some(Self::Bp256r1),
            _ => None,
        }
    }

    /// OID of the curve the signing key lives on.
    #[must_use]
    pub const fn curve_oid(&self) -> &'static str {
        match self {
            Self::Es256 => "1.2.840.10045.3.1.7",   // secp256r1
            Self::Bp256r1 => "1.3.36.3.3.2.8.1.1.7", // brainpoolP256r1
        }
    }

    /// Size of a raw `r || s` signature in bytes.
    #[must_use]
    pub const fn raw_signature_len(&self) -> usize {
        64
    }
}

impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.jws_name())
    }
}
