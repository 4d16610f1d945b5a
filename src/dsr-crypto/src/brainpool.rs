//! ECDSA brainpoolP256r1 (BP256R1) signature operations.
//!
//! German health cards (eGK) sign with brainpool keys. The JWS header value
//! `BP256R1` is the gematik convention for this curve with SHA-256.

use bp256::BrainpoolP256r1;
use ecdsa::signature::{Signer, Verifier};
use rand::rngs::OsRng;

use crate::error::CryptoError;
use crate::traits::{EcSigner, EcVerifier};
use crate::types::SignatureAlgorithm;

type SigningKey = ecdsa::SigningKey<BrainpoolP256r1>;
type VerifyingKey = ecdsa::VerifyingKey<BrainpoolP256r1>;
type Signature = ecdsa::Signature<BrainpoolP256r1>;

/// ECDSA brainpoolP256r1 signer.
pub struct Bp256Signer {
    signing_key: SigningKey,
}

impl Bp256Signer {
    /// Create a new signer with a random key.
    #[must_use]
    pub fn random() -> Self {
        Self {
            signing_key: SigningKey::random(&mut OsRng),
        }
    }

    /// Create a signer from a 32-byte big-endian scalar.
    ///
    /// # Errors
    ///
    /// Returns error if the scalar is zero or out of range.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let signing_key = SigningKey::from_slice(bytes)
            .map_err(|e| CryptoError::invalid_private_key(e.to_string()))?;
        Ok(Self { signing_key })
    }
}

impl EcSigner for Bp256Signer {
    fn algorithm(&self) -> SignatureAlgorithm {
        SignatureAlgorithm::Bp256r1
    }

    fn public_key(&self) -> Result<Vec<u8>, CryptoError> {
        let encoded = self.signing_key.verifying_key().to_encoded_point(false);
        Ok(encoded.as_bytes().to_vec())
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let signature: Signature = self
            .signing_key
            .try_sign(data)
            .map_err(|e| CryptoError::signing_failed(e.to_string()))?;
        Ok(signature.to_bytes().to_vec())
    }
}

/// ECDSA brainpoolP256r1 verifier.
#[derive(Default)]
pub struct Bp256Verifier;

impl Bp256Verifier {
    /// Create a new verifier.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl EcVerifier for Bp256Verifier {
    fn verify(&self, public_key: &[u8], data: &[u8], signature: &[u8]) -> Result<bool, CryptoError> {
        let vk = VerifyingKey::from_sec1_bytes(public_key)
            .map_err(|e| CryptoError::invalid_public_key(e.to_string()))?;
        let sig = Signature::from_slice(signature)
            .map_err(|e| CryptoError::invalid_signature(e.to_string()))?;
        Ok(vk.verify(data, &sig).is_ok())
    }
}
