//! # dsr-keystore
//!
//! Keystore abstraction and key attestation for the DSR device binding
//! client.
//!
//! The device binding protocol keeps four entries in the platform keystore:
//!
//! | Alias | Kind | Lifetime |
//! |-------|------|----------|
//! | `mTLSCertificate` | trusted certificate issued by GMS | until reset |
//! | `mTLSKeyPair` | EC P-256 key for mTLS and token signing | 365 days |
//! | `attestKey` | attest key signing other attestations | until reset |
//! | `attestationKeyPair` | one-shot key per device attestation | one run |
//!
//! [`KeystoreCapability`] is the platform seam; [`KeyAttestationProvider`]
//! implements the alias bookkeeping on top of it.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use dsr_keystore::{KeyAttestationProvider, SoftwareKeystore};
//!
//! let provider = KeyAttestationProvider::new(Arc::new(SoftwareKeystore::new()?));
//! let chain = provider.get_attestation_chain(&nonce, chrono::Utc::now())?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)] // Allow Type in module::Type
#![allow(clippy::missing_errors_doc)] // Error documentation not required
#![allow(clippy::must_use_candidate)] // Not all functions need must_use

mod attestation;
mod capability;
mod error;
mod types;

#[cfg(feature = "software")]
mod software;

pub use attestation::KeyAttestationProvider;
pub use capability::{KeyGenSpec, KeystoreCapability};
pub use error::KeystoreError;
pub use types::{
    AttestationChain, KeyDescription, KeyPairRecord, KeyPurpose, PlatformCapabilities,
    SecurityLevel, ValidityWindow, ATTESTATION_KEYPAIR_ALIAS, ATTEST_KEY_ALIAS,
    DEFAULT_KEY_VALIDITY_DAYS, KEY_DESCRIPTION_OID, MANAGED_ALIASES, MTLS_CERT_ALIAS,
    MTLS_KEYPAIR_ALIAS,
};

#[cfg(feature = "software")]
pub use software::SoftwareKeystore;
