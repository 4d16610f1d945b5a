//! Device registration.
//!
//! One linear pass per run:
//!
//! ```text
//! Idle -> NonceFetched -> KeysGenerated -> CsrBuilt -> IntegrityObtained
//!      -> JwtSigned -> Registered(cert) | Failed(err)
//! ```
//!
//! The GMS client certificate is written to the keystore only after the
//! server accepted the registration token.

use std::sync::Arc;

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{SubsecRound, Utc};
use dsr_crypto::{DerivedNonce, NonceTag, RootNonce};
use dsr_keystore::{KeyAttestationProvider, ATTEST_KEY_ALIAS, MTLS_KEYPAIR_ALIAS};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument};

use crate::credential::CredentialSigner;
use crate::csr::CsrBuilder;
use crate::error::DeviceBindingError;
use crate::gms::GmsApi;
use crate::integrity::IntegrityVerdictClient;
use crate::jwt::{JwtAssembler, RegistrationInput, SignedJwt};

/// Progress of a registration run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationState {
    /// Nothing started.
    Idle,
    /// GMS handed out the root nonce.
    NonceFetched,
    /// Attest key and mTLS key pair exist.
    KeysGenerated,
    /// The CSR for the mTLS key is signed.
    CsrBuilt,
    /// The integrity verdict arrived.
    IntegrityObtained,
    /// The registration token is signed.
    JwtSigned,
    /// GMS issued this DER client certificate. Terminal.
    Registered(Vec<u8>),
    /// The run stopped at the first failing step. Terminal.
    Failed(DeviceBindingError),
}

impl RegistrationState {
    /// Whether the run is over.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Registered(_) | Self::Failed(_))
    }
}

/// What a successful registration produced.
#[derive(Debug, Clone)]
pub struct RegistrationOutcome {
    /// DER client certificate issued by GMS, now stored under `mTLSCertificate`.
    pub client_certificate: Vec<u8>,
    /// Token sent to `register-device`.
    pub registration_token: SignedJwt,
    /// Root nonce, standard base64.
    pub nonce: String,
    /// Integrity nonce, unpadded base64url.
    pub integrity_nonce: String,
    /// Challenge for a card-backed health card signature.
    pub smartcard_nonce: DerivedNonce,
}

/// Nonces of one registration run.
struct RegistrationNonces {
    keypair_mtls: DerivedNonce,
    csr_mtls: DerivedNonce,
    integrity: DerivedNonce,
    smartcard: DerivedNonce,
    attest: DerivedNonce,
}

impl RegistrationNonces {
    fn derive(root: &RootNonce) -> Self {
        Self {
            keypair_mtls: root.derive(NonceTag::KeypairMtls),
            csr_mtls: root.derive(NonceTag::CsrMtls),
            integrity: root.derive(NonceTag::Integrity),
            smartcard: root.derive(NonceTag::Smartcard),
            attest: root.derive(NonceTag::Attest),
        }
    }
}

/// Runs device registration against GMS.
pub struct RegistrationOrchestrator {
    gms: Arc<dyn GmsApi>,
    keys: KeyAttestationProvider,
    integrity: Arc<IntegrityVerdictClient>,
    credential: Arc<dyn CredentialSigner>,
    assembler: JwtAssembler,
    csr: CsrBuilder,
    state: watch::Sender<RegistrationState>,
}

impl RegistrationOrchestrator {
    /// Orchestrator signing the registration token with `credential`.
    pub fn new(
        gms: Arc<dyn GmsApi>,
        keys: KeyAttestationProvider,
        integrity: Arc<IntegrityVerdictClient>,
        credential: Arc<dyn CredentialSigner>,
        assembler: JwtAssembler,
    ) -> Self {
        let (state, _) = watch::channel(RegistrationState::Idle);
        Self {
            gms,
            keys,
            integrity,
            credential,
            assembler,
            csr: CsrBuilder::default(),
            state,
        }
    }

    /// Replace the CSR subject.
    #[must_use]
    pub fn with_csr_builder(mut self, csr: CsrBuilder) -> Self {
        self.csr = csr;
        self
    }

    /// Receiver of state changes.
    pub fn subscribe(&self) -> watch::Receiver<RegistrationState> {
        self.state.subscribe()
    }

    /// Current state.
    pub fn state(&self) -> RegistrationState {
        self.state.borrow().clone()
    }

    fn set(&self, state: RegistrationState) {
        debug!(state = ?state, "Registration state");
        self.state.send_replace(state);
    }

    /// Register this device.
    ///
    /// # Errors
    ///
    /// The first failing step's error, also published as
    /// [`RegistrationState::Failed`].
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<RegistrationOutcome, DeviceBindingError> {
        self.set(RegistrationState::Idle);
        match self.execute().await {
            Ok(outcome) => {
                self.set(RegistrationState::Registered(outcome.client_certificate.clone()));
                Ok(outcome)
            },
            Err(err) => {
                error!(error = %err, "Registration failed");
                self.set(RegistrationState::Failed(err.clone()));
                Err(err)
            },
        }
    }

    /// Registration steps in protocol order.
    ///
    /// The attest key is always required. A keystore without attest key
    /// support fails here with `CapabilityUnsupported`; there is no fallback
    /// to an unattested mTLS key.
    ///
    /// A previously stored client certificate is dropped before the mTLS key
    /// pair is replaced, so a failed re-registration leaves the device
    /// unregistered instead of holding a certificate for a discarded key.
    async fn execute(&self) -> Result<RegistrationOutcome, DeviceBindingError> {
        let root = self.gms.fetch_nonce().await?;
        self.set(RegistrationState::NonceFetched);

        let nonces = RegistrationNonces::derive(&root);
        let now = Utc::now().trunc_subsecs(0);
        let keystore = self.keys.keystore();

        if self.keys.forget_client_certificate()? {
            info!("Re-registering, previous client certificate dropped");
        }
        let attest_key = self.keys.generate_attest_key(&nonces.attest, ATTEST_KEY_ALIAS, now)?;
        let attest_chain = keystore.certificate_chain(ATTEST_KEY_ALIAS)?;
        let mtls_key = self.keys.generate_key_pair(
            &nonces.keypair_mtls,
            self.keys.validity_from(now),
            MTLS_KEYPAIR_ALIAS,
            false,
            true,
        )?;
        let mtls_certificate = keystore.certificate(MTLS_KEYPAIR_ALIAS)?;
        self.set(RegistrationState::KeysGenerated);

        let csr = self.csr.build(keystore.as_ref(), &mtls_key, &nonces.csr_mtls)?;
        self.set(RegistrationState::CsrBuilt);

        let verdict = self.integrity.request_verdict(&nonces.integrity).await?;
        self.set(RegistrationState::IntegrityObtained);

        let input = RegistrationInput {
            root_nonce: &root,
            mtls_public_key: &mtls_key.public_key,
            mtls_certificate: &mtls_certificate,
            csr: &csr,
            integrity_verdict: &verdict,
            attest_chain: &attest_chain,
            attest_public_key: &attest_key.public_key,
        };
        let token = self.assembler.registration_token(&input, now, self.credential.as_ref())?;
        self.set(RegistrationState::JwtSigned);

        let client_certificate = self.gms.register_device(&token).await?;
        self.keys.store_client_certificate(&client_certificate)?;
        info!(cert_len = client_certificate.len(), "Device registration complete");

        Ok(RegistrationOutcome {
            client_certificate,
            registration_token: token,
            nonce: STANDARD.encode(root.as_bytes()),
            integrity_nonce: URL_SAFE_NO_PAD.encode(nonces.integrity.as_bytes()),
            smartcard_nonce: nonces.smartcard,
        })
    }
}

impl std::fmt::Debug for RegistrationOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationOrchestrator")
            .field("keys", &self.keys)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}
