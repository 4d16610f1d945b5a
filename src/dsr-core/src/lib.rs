//! # dsr-core
//!
//! Device registration and attestation engine for the gematik DSR proof of
//! concept. A device proves to GMS that it runs on an integrity-checked
//! platform and holds a hardware-backed key, and exchanges that proof for a
//! short-lived device token accepted by FD.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     DeviceBindingEngine                        │
//! │                                                                │
//! │  ┌─────────────────────────┐   ┌─────────────────────────┐    │
//! │  │ RegistrationOrchestrator │   │ AttestationOrchestrator │    │
//! │  │  nonce, keys, CSR,       │   │  nonce, chain, verdict, │    │
//! │  │  verdict, BP256R1 JWT    │   │  ES256 JWT, PKCE, poll  │    │
//! │  └────────────┬────────────┘   └────────────┬────────────┘    │
//! │               └──────────────┬──────────────┘                  │
//! │                              ▼                                 │
//! │  ┌──────────────┐   ┌──────────────────┐   ┌──────────────┐   │
//! │  │  GmsClient   │──▶│ MtlsChannelManager│◀──│   FdClient   │   │
//! │  │ (server TLS) │   │ (one-way upgrade) │   │  (mTLS only) │   │
//! │  └──────────────┘   └──────────────────┘   └──────────────┘   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Keys live behind [`dsr_keystore::KeystoreCapability`]; nonce derivation
//! and curve arithmetic are in [`dsr_crypto`].

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)] // Too strict for production code
#![allow(clippy::doc_markdown)] // Allow product names without backticks
#![allow(clippy::missing_errors_doc)] // Error documentation not required
#![allow(clippy::module_name_repetitions)] // Allow Type in module::Type
#![allow(clippy::must_use_candidate)] // Not all functions need must_use

pub mod attestation;
pub mod channel;
pub mod config;
pub mod credential;
pub mod csr;
pub mod device_attributes;
pub mod engine;
pub mod error;
pub mod fd;
pub mod gms;
pub mod http;
pub mod integrity;
pub mod jwt;
pub mod polling;
pub mod registration;

pub use attestation::{AttestationOrchestrator, AttestationOutcome, AttestationState, Pkce};
pub use channel::{ChannelState, MtlsChannelManager, RustlsChannelFactory, SecureChannelFactory};
pub use config::{DeviceBindingConfig, PollingPolicy, RetryPolicy, TimeoutConfig};
pub use credential::{CredentialSigner, DeviceKeySigner, MockVirtualHealthCardSigner};
pub use csr::{Csr, CsrBuilder};
pub use device_attributes::{DeviceAttributes, DeviceAttributesSource, StaticDeviceAttributes};
pub use engine::{DeviceBindingEngine, EnrollmentOutcome};
pub use error::DeviceBindingError;
pub use fd::{FdApi, FdClient, Prescription};
pub use gms::{DeviceRegistration, DeviceToken, DeviceTokenPoll, GmsApi, GmsClient};
pub use integrity::{
    FixedIntegrityAttestor, IntegrityAttestor, IntegrityVerdict, IntegrityVerdictClient, StandardTokenProvider,
};
pub use jwt::{JwtAssembler, SignedJwt};
pub use polling::TokenPoller;
pub use registration::{RegistrationOrchestrator, RegistrationOutcome, RegistrationState};
