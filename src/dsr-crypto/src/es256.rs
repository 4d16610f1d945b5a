//! ECDSA P-256 (ES256) signature operations.
//!
//! Device keys live in the keystore and sign with DER-encoded signatures,
//! while JWS wants the fixed 64-byte `r || s` form. The conversion helpers
//! here bridge the two.

use p256::ecdsa::{
    signature::{Signer, Verifier},
    Signature, SigningKey, VerifyingKey,
};
use rand::rngs::OsRng;

use crate::error::CryptoError;
use crate::traits::{EcSigner, EcVerifier};
use crate::types::SignatureAlgorithm;

/// ECDSA P-256 signer.
pub struct P256Signer {
    signing_key: SigningKey,
}

impl P256Signer {
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
    /// Returns error if the key bytes are invalid.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let signing_key = SigningKey::from_slice(bytes)
            .map_err(|e| CryptoError::invalid_private_key(e.to_string()))?;

        Ok(Self { signing_key })
    }

    /// Get the verifying key.
    #[must_use]
    pub fn verifying_key(&self) -> &VerifyingKey {
        self.signing_key.verifying_key()
    }
}

impl EcSigner for P256Signer {
    fn algorithm(&self) -> SignatureAlgorithm {
        SignatureAlgorithm::Es256
    }

    fn public_key(&self) -> Result<Vec<u8>, CryptoError> {
        let encoded = self.signing_key.verifying_key().to_encoded_point(false);
        Ok(encoded.as_bytes().to_vec())
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let signature: Signature = self.signing_key.sign(data);
        Ok(signature.to_bytes().to_vec())
    }
}

/// ECDSA P-256 verifier.
pub struct P256Verifier;

impl P256Verifier {
    /// Create a new verifier.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for P256Verifier {
    fn default() -> Self {
        Self::new()
    }
}

impl EcVerifier for P256Verifier {
    fn verify(&self, public_key: &[u8], data: &[u8], signature: &[u8]) -> Result<bool, CryptoError> {
        let vk = VerifyingKey::from_sec1_bytes(public_key)
            .map_err(|e| CryptoError::invalid_public_key(e.to_string()))?;

        let sig = Signature::from_slice(signature)
            .map_err(|e| CryptoError::invalid_signature(e.to_string()))?;

        Ok(vk.verify(data, &sig).is_ok())
    }
}

/// Convert a DER `ECDSA-Sig-Value` into the 64-byte JWS form.
///
/// # Errors
///
/// Returns error if `der` is not a valid P-256 signature.
pub fn der_signature_to_raw(der: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let sig = Signature::from_der(der).map_err(|e| CryptoError::invalid_signature(e.to_string()))?;
    Ok(sig.to_bytes().to_vec())
}

/// Convert a 64-byte `r || s` signature into DER.
///
/// # Errors
///
/// Returns error if `raw` is not 64 bytes or a scalar is out of range.
pub fn raw_signature_to_der(raw: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let sig = Signature::from_slice(raw).map_err(|e| CryptoError::invalid_signature(e.to_string()))?;
    Ok(sig.to_der().as_bytes().to_vec())
}
