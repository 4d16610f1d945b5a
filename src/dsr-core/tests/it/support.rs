//! Fakes shared by the integration tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use dsr_core::fd::{FdApi, Prescription};
use dsr_core::{
    DeviceBindingConfig, DeviceBindingEngine, DeviceBindingError, DeviceRegistration, DeviceToken, DeviceTokenPoll,
    FixedIntegrityAttestor, GmsApi, SignedJwt, StaticDeviceAttributes,
};
use dsr_crypto::RootNonce;
use dsr_keystore::{KeystoreCapability, SoftwareKeystore};
use reqwest::Client;
use tokio::time::Instant;

pub const ROOT_NONCE: [u8; 32] = [0x42; 32];

/// In-process GMS.
///
/// Registration answers with the `subjectCert` of the token, so the stored
/// client certificate matches the mTLS key the way a real GMS certificate
/// would.
#[derive(Default)]
pub struct FakeGms {
    pub pending_polls: u32,
    pub register_error: Option<DeviceBindingError>,
    pub registration_tokens: Mutex<Vec<SignedJwt>>,
    pub attestations: Mutex<Vec<(SignedJwt, String)>>,
    pub polls: Mutex<Vec<(Instant, String, String)>>,
}

impl FakeGms {
    pub fn poll_count(&self) -> usize {
        self.polls.lock().unwrap().len()
    }
}

#[async_trait]
impl GmsApi for FakeGms {
    async fn fetch_nonce(&self) -> Result<RootNonce, DeviceBindingError> {
        Ok(RootNonce::new(ROOT_NONCE.to_vec()))
    }

    async fn register_device(&self, token: &SignedJwt) -> Result<Vec<u8>, DeviceBindingError> {
        self.registration_tokens.lock().unwrap().push(token.clone());
        if let Some(err) = &self.register_error {
            return Err(err.clone());
        }
        let payload = token.parse()?.payload;
        let subject_cert = payload["subjectCert"].as_str().unwrap_or_default();
        Ok(STANDARD.decode(subject_cert).unwrap())
    }

    async fn attest_device(&self, token: &SignedJwt, code_challenge: &str) -> Result<String, DeviceBindingError> {
        self.attestations
            .lock()
            .unwrap()
            .push((token.clone(), code_challenge.to_string()));
        Ok("auth-code".into())
    }

    async fn exchange_device_token(&self, code: &str, code_verifier: &str) -> Result<DeviceTokenPoll, DeviceBindingError> {
        let mut polls = self.polls.lock().unwrap();
        polls.push((Instant::now(), code.to_string(), code_verifier.to_string()));
        if polls.len() as u32 <= self.pending_polls {
            Ok(DeviceTokenPoll::Pending)
        } else {
            Ok(DeviceTokenPoll::Ready(DeviceToken::new("abc")))
        }
    }

    async fn list_device_registrations(&self, user_identifier: &str) -> Result<Vec<DeviceRegistration>, DeviceBindingError> {
        Ok(vec![DeviceRegistration {
            user_identifier: user_identifier.to_string(),
            device_identifier: "dev-1".into(),
            device_type: "android".into(),
            created_at: "2024-05-01T12:00:00Z".into(),
        }])
    }

    async fn delete_device_registration(&self, _user: &str, _device: &str) -> Result<(), DeviceBindingError> {
        Ok(())
    }
}

/// FD without prescriptions.
pub struct EmptyFd;

#[async_trait]
impl FdApi for EmptyFd {
    async fn prescriptions(&self, _token: &DeviceToken) -> Result<Vec<Prescription>, DeviceBindingError> {
        Ok(Vec::new())
    }
}

/// Plain HTTP clients for mockito servers.
pub struct PlainFactory;

impl dsr_core::SecureChannelFactory for PlainFactory {
    fn server_tls(&self) -> Result<Client, DeviceBindingError> {
        Ok(Client::new())
    }

    fn mutual_tls(&self) -> Result<Client, DeviceBindingError> {
        Ok(Client::new())
    }
}

pub fn software_keystore() -> Arc<dyn KeystoreCapability> {
    Arc::new(SoftwareKeystore::new().unwrap())
}

pub fn engine_with(gms: Arc<FakeGms>, keystore: Arc<dyn KeystoreCapability>) -> DeviceBindingEngine {
    DeviceBindingEngine::with_services(
        DeviceBindingConfig::default(),
        keystore,
        Arc::new(FixedIntegrityAttestor::new("integrity")),
        Arc::new(StaticDeviceAttributes::default()),
        gms,
        Arc::new(EmptyFd),
    )
    .unwrap()
}
