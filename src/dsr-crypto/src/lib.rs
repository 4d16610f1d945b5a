//! # dsr-crypto
//!
//! Cryptographic building blocks for the DSR device binding client.
//!
//! - **Nonce derivation**: one GMS root nonce is expanded into purpose-bound
//!   nonces, `SHA-256(root || tag)`.
//! - **ES256**: ECDSA P-256, the curve of hardware-backed device keys.
//! - **BP256R1**: ECDSA brainpoolP256r1, the curve of health-card keys.
//! - **Fingerprints**: SHA-256 over a key's subjectPublicKey bits, used as
//!   the `sub` claim of device tokens.
//!
//! All signers emit raw `r || s` signatures as required by JWS (RFC 7515).
//!
//! ```rust
//! use dsr_crypto::{NonceTag, RootNonce};
//!
//! let root = RootNonce::new(vec![0u8; 32]);
//! let attest = root.derive(NonceTag::Attest);
//! assert_ne!(attest, root.derive(NonceTag::CsrMtls));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod fingerprint;
mod nonce;
mod traits;
mod types;

#[cfg(feature = "es256")]
mod es256;

#[cfg(feature = "bp256r1")]
mod brainpool;

pub use error::CryptoError;
pub use fingerprint::{
    certificate_public_key, certificate_spki, public_key_fingerprint, PublicKeyInfo,
};
pub use nonce::{derive, DerivedNonce, NonceTag, RootNonce, DERIVED_NONCE_LEN};
pub use traits::{verify_signature, EcSigner, EcVerifier};
pub use types::SignatureAlgorithm;

#[cfg(feature = "es256")]
pub use es256::{der_signature_to_raw, raw_signature_to_der, P256Signer, P256Verifier};

#[cfg(feature = "bp256r1")]
pub use brainpool::{Bp256Signer, Bp256Verifier};
