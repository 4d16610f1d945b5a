//! Purpose-bound nonce derivation.
//!
//! GMS hands out one root nonce per protocol run. Every artifact that needs
//! freshness (key attestation challenge, CSR challenge, integrity request)
//! gets its own value derived as `SHA-256(root || tag)`, so one server
//! challenge can bind several artifacts without any of them being replayable
//! in another role.

use std::fmt;

use sha2::{Digest, Sha256};

/// Length of a derived nonce in bytes.
pub const DERIVED_NONCE_LEN: usize = 32;

/// Domain separation tag for a derived nonce.
///
/// One variant per logical purpose; two call sites never share a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NonceTag {
    /// Attestation challenge of the mTLS key pair (registration).
    KeypairMtls,
    /// Challenge password carried in the CSR (registration).
    CsrMtls,
    /// Integrity verdict request (registration).
    Integrity,
    /// Health-card challenge (registration).
    Smartcard,
    /// Attestation challenge of the shared attest key (registration).
    Attest,
    /// Attestation challenge of the one-shot attestation key pair.
    AttestationChallenge,
    /// Integrity request hash for device attestation.
    AttestationIntegrity,
}

impl NonceTag {
    /// Tags used while registering a device.
    pub const REGISTRATION: [NonceTag; 5] = [
        NonceTag::KeypairMtls,
        NonceTag::CsrMtls,
        NonceTag::Integrity,
        NonceTag::Smartcard,
        NonceTag::Attest,
    ];

    /// Tags used while attesting a registered device.
    pub const ATTESTATION: [NonceTag; 2] =
        [NonceTag::AttestationChallenge, NonceTag::AttestationIntegrity];

    /// The bytes appended to the root nonce.
    #[must_use]
    pub const fn as_bytes(&self) -> &'static [u8] {
        match self {
            Self::KeypairMtls => b"KEYPAIR_MTLS",
            Self::CsrMtls => b"CSR_MTLS",
            Self::Integrity => b"INTEGRITY",
            Self::Smartcard => b"SMARTCARD",
            Self::Attest => b"ATTEST",
            Self::AttestationChallenge => b"1",
            Self::AttestationIntegrity => b"2",
        }
    }
}

/// Server-issued nonce for one protocol run.
#[derive(Clone, PartialEq, Eq)]
pub struct RootNonce(Vec<u8>);

impl RootNonce {
    /// Wrap nonce bytes received from the server.
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Raw nonce bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Whether the server returned an empty nonce.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Derive the nonce for `tag`.
    #[must_use]
    pub fn derive(&self, tag: NonceTag) -> DerivedNonce {
        derive(&self.0, tag.as_bytes())
    }
}

impl fmt::Debug for RootNonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootNonce").field("len", &self.0.len()).finish()
    }
}

/// Nonce bound to one purpose within a run.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DerivedNonce([u8; DERIVED_NONCE_LEN]);

impl DerivedNonce {
    /// Digest bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; DERIVED_NONCE_LEN] {
        &self.0
    }

    /// Copy into an owned buffer.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl AsRef<[u8]> for DerivedNonce {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for DerivedNonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DerivedNonce(")?;
        for b in &self.0[..4] {
            write!(f, "{b:02x}")?;
        }
        write!(f, "..)")
    }
}

/// `SHA-256(root || tag)`.
#[must_use]
pub fn derive(root: &[u8], tag: &[u8]) -> DerivedNonce {
    let mut hasher = Sha256::new();
    hasher.update(root);
    hasher.update(tag);
    DerivedNonce(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_tags_are_unique() {
        let all: Vec<_> = NonceTag::REGISTRATION
            .iter()
            .chain(NonceTag::ATTESTATION.iter())
            .map(NonceTag::as_bytes)
            .collect();
        let unique: HashSet<_> = all.iter().collect();
        assert_eq!(unique.len(), all.len());
    }

    #[test]
    fn test_derive_matches_manual_hash() {
        let root = RootNonce::new(vec![7u8; 16]);
        let mut input = vec![7u8; 16];
        input.extend_from_slice(b"CSR_MTLS");
        let expected: [u8; 32] = Sha256::digest(&input).into();
        assert_eq!(root.derive(NonceTag::CsrMtls).as_bytes(), &expected);
    }

    #[test]
    fn test_zero_root_attest_golden_vector() {
        let root = RootNonce::new(vec![0u8; 32]);
        assert_eq!(
            hex::encode(root.derive(NonceTag::Attest).as_bytes()),
            "5a1e82490820d51901fe4f4d7468db3dd0e11f8bffb76a4951a4f0a632273b81"
        );
    }

    #[test]
    fn test_debug_does_not_dump_nonce() {
        let root = RootNonce::new(vec![0xAB; 32]);
        let rendered = format!("{root:?}");
        assert!(!rendered.contains("171"));
        assert!(rendered.contains("len"));
    }
}
