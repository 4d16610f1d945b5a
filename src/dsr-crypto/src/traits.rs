//! Signer and verifier traits shared by the curve implementations.

use crate::error::CryptoError;
use crate::types::SignatureAlgorithm;

/// Produces raw `r || s` ECDSA signatures, the encoding JWS expects.
pub trait EcSigner {
    /// Get the algorithm used by this signer.
    fn algorithm(&self) -> SignatureAlgorithm;

    /// Get the public key as an uncompressed SEC1 point.
    fn public_key(&self) -> Result<Vec<u8>, CryptoError>;

    /// Sign data (SHA-256 is applied internally) and return `r || s`.
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// Verifies raw `r || s` ECDSA signatures.
pub trait EcVerifier {
    /// Verify a signature against a SEC1-encoded public key.
    ///
    /// Returns `Ok(false)` for a well-formed signature that does not verify,
    /// and an error when the key or signature cannot be parsed.
    fn verify(&self, public_key: &[u8], data: &[u8], signature: &[u8])
        -> Result<bool, CryptoError>;
}

/// Verify a raw signature with whichever verifier matches `algorithm`.
///
/// # Errors
///
/// Returns [`CryptoError::UnsupportedAlgorithm`] if the curve was not
/// compiled in, or a parse error from the verifier.
#[allow(unused_variables)]
pub fn verify_signature(
    algorithm: SignatureAlgorithm,
    public_key: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<bool, CryptoError> {
    match algorithm {
        #[cfg(feature = "es256")]
        SignatureAlgorithm::Es256 => crate::es256::P256Verifier::new().verify(public_key, data, signature),
        #[cfg(feature = "bp256r1")]
        SignatureAlgorithm::Bp256r1 => {
            crate::brainpool::Bp256Verifier::new().verify(public_key, data, signature)
        },
        #[allow(unreachable_patterns)]
        other => Err(CryptoError::UnsupportedAlgorithm { algorithm: other }),
    }
}
