//! Device attestation and device token exchange.
//!
//! ```text
//! Idle -> NonceFetched -> AttestationChainObtained -> IntegrityObtained
//!      -> JwtSigned -> CodeObtained -> PollingForToken
//!      -> Completed(token) | Failed(err)
//! ```
//!
//! The attestation token is signed by the registered mTLS key and carries
//! the GMS-issued certificate in `x5c`. The authorization code returned by
//! GMS is bound to a PKCE challenge and exchanged for the device token.

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{SubsecRound, Utc};
use dsr_crypto::NonceTag;
use dsr_keystore::{KeyAttestationProvider, MTLS_CERT_ALIAS};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument};

use crate::credential::CredentialSigner;
use crate::device_attributes::DeviceAttributesSource;
use crate::error::DeviceBindingError;
use crate::gms::{DeviceToken, GmsApi};
use crate::integrity::IntegrityVerdictClient;
use crate::jwt::{AttestationInput, JwtAssembler, SignedJwt};
use crate::polling::TokenPoller;

/// Random bytes behind a code verifier.
pub const CODE_VERIFIER_BYTES: usize = 64;

/// PKCE verifier and S256 challenge.
#[derive(Clone, PartialEq, Eq)]
pub struct Pkce {
    verifier: String,
    challenge: String,
}

impl Pkce {
    /// Fresh verifier from the OS RNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; CODE_VERIFIER_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self::from_verifier(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Pair for a known verifier.
    pub fn from_verifier(verifier: impl Into<String>) -> Self {
        let verifier = verifier.into();
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
        Self { verifier, challenge }
    }

    /// `code_verifier` sent with the token exchange.
    pub fn verifier(&self) -> &str {
        &self.verifier
    }

    /// `codeChallenge` sent with the attestation.
    pub fn challenge(&self) -> &str {
        &self.challenge
    }
}

impl std::fmt::Debug for Pkce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pkce").field("challenge", &self.challenge).finish_non_exhaustive()
    }
}

/// Progress of an attestation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttestationState {
    /// Nothing started.
    Idle,
    /// GMS handed out the root nonce.
    NonceFetched,
    /// A fresh attestation chain exists.
    AttestationChainObtained,
    /// The integrity verdict arrived.
    IntegrityObtained,
    /// The attestation token is signed.
    JwtSigned,
    /// GMS returned an authorization code.
    CodeObtained,
    /// Waiting for the server to issue the device token.
    PollingForToken,
    /// The device token was issued. Terminal.
    Completed(DeviceToken),
    /// The run stopped at the first failing step. Terminal.
    Failed(DeviceBindingError),
}

impl AttestationState {
    /// Whether the run is over.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed(_) | Self::Failed(_))
    }
}

/// What a successful attestation produced.
#[derive(Debug, Clone)]
pub struct AttestationOutcome {
    /// Bearer token for FD.
    pub device_token: DeviceToken,
    /// Token sent to `device-attestation`.
    pub attestation_token: SignedJwt,
    /// Authorization code exchanged for the device token.
    pub authorization_code: String,
    /// PKCE pair of the run.
    pub pkce: Pkce,
}

/// Runs device attestation against GMS.
pub struct AttestationOrchestrator {
    gms: Arc<dyn GmsApi>,
    keys: KeyAttestationProvider,
    integrity: Arc<IntegrityVerdictClient>,
    credential: Arc<dyn CredentialSigner>,
    attributes: Arc<dyn DeviceAttributesSource>,
    assembler: JwtAssembler,
    poller: TokenPoller,
    state: watch::Sender<AttestationState>,
}

impl AttestationOrchestrator {
    /// Orchestrator signing the attestation token with `credential`.
    pub fn new(
        gms: Arc<dyn GmsApi>,
        keys: KeyAttestationProvider,
        integrity: Arc<IntegrityVerdictClient>,
        credential: Arc<dyn CredentialSigner>,
        attributes: Arc<dyn DeviceAttributesSource>,
        assembler: JwtAssembler,
        poller: TokenPoller,
    ) -> Self {
        let (state, _) = watch::channel(AttestationState::Idle);
        Self {
            gms,
            keys,
            integrity,
            credential,
            attributes,
            assembler,
            poller,
            state,
        }
    }

    /// Receiver of state changes.
    pub fn subscribe(&self) -> watch::Receiver<AttestationState> {
        self.state.subscribe()
    }

    /// Current state.
    pub fn state(&self) -> AttestationState {
        self.state.borrow().clone()
    }

    fn set(&self, state: AttestationState) {
        debug!(state = ?state, "Attestation state");
        self.state.send_replace(state);
    }

    /// Attest this device and obtain a device token.
    ///
    /// # Errors
    ///
    /// The first failing step's error, also published as
    /// [`AttestationState::Failed`]. A token still pending at the deadline
    /// is [`DeviceBindingError::TokenNotReady`].
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<AttestationOutcome, DeviceBindingError> {
        self.set(AttestationState::Idle);
        match self.execute().await {
            Ok(outcome) => {
                self.set(AttestationState::Completed(outcome.device_token.clone()));
                Ok(outcome)
            },
            Err(err) => {
                error!(error = %err, "Attestation failed");
                self.set(AttestationState::Failed(err.clone()));
                Err(err)
            },
        }
    }

    async fn execute(&self) -> Result<AttestationOutcome, DeviceBindingError> {
        let root = self.gms.fetch_nonce().await?;
        self.set(AttestationState::NonceFetched);

        let pkce = Pkce::generate();
        let chain_nonce = root.derive(NonceTag::AttestationChallenge);
        let integrity_nonce = root.derive(NonceTag::AttestationIntegrity);
        let now = Utc::now().trunc_subsecs(0);

        let chain = self.keys.get_attestation_chain(&chain_nonce, now)?;
        self.set(AttestationState::AttestationChainObtained);

        let verdict = self.integrity.request_standard_verdict(&integrity_nonce).await?;
        self.set(AttestationState::IntegrityObtained);

        let mtls_certificate = self
            .keys
            .keystore()
            .certificate(MTLS_CERT_ALIAS)
            .map_err(|e| DeviceBindingError::keystore(format!("device is not registered: {e}")))?;
        let attributes = self.attributes.device_attributes();
        let input = AttestationInput {
            root_nonce: &root,
            mtls_certificate: &mtls_certificate,
            attestation_chain: &chain,
            integrity_verdict: &verdict,
            device_attributes: &attributes,
        };
        let token = self.assembler.attestation_token(&input, now, self.credential.as_ref())?;
        self.set(AttestationState::JwtSigned);

        let code = self.gms.attest_device(&token, pkce.challenge()).await?;
        self.set(AttestationState::CodeObtained);

        self.set(AttestationState::PollingForToken);
        let device_token = self
            .poller
            .poll(|| self.gms.exchange_device_token(&code, pkce.verifier()))
            .await?;
        info!("Device attestation complete");

        Ok(AttestationOutcome {
            device_token,
            attestation_token: token,
            authorization_code: code,
            pkce,
        })
    }
}

impl std::fmt::Debug for AttestationOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttestationOrchestrator")
            .field("keys", &self.keys)
            .field("poller", &self.poller)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pkce_rfc7636_vector() {
        let pkce = Pkce::from_verifier("dBjftJeZ4CVP-mJ92K9Rsc-7bxx2Q2S6QCq7B9uQxZQ");
        assert_eq!(pkce.challenge(), "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM");
    }

    #[test]
    fn test_generated_verifier_shape() {
        let pkce = Pkce::generate();
        assert_eq!(pkce.verifier().len(), 86);
        assert!(!pkce.verifier().contains('='));
        assert_ne!(Pkce::generate(), pkce);
        assert!(!format!("{pkce:?}").contains(pkce.verifier()));
    }
}
