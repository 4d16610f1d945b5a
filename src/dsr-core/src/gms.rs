//! GMS device registration and attestation endpoints.
//!
//! ## Endpoints
//!
//! | Method | Path                    | Channel    | Success                    |
//! |--------|-------------------------|------------|----------------------------|
//! | GET    | `nonce`                 | server TLS | base64url text             |
//! | POST   | `register-device`       | server TLS | `{cert}`                   |
//! | POST   | `device-attestation`    | mTLS       | authorization code text    |
//! | POST   | `device-token`          | mTLS       | `{token}`, or 202 pending  |
//! | GET    | `device-registrations`  | mTLS       | registration list          |
//! | DELETE | `device-registrations`  | mTLS       | empty                      |
//!
//! Error bodies are `{errorCode, description}`.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use dsr_crypto::RootNonce;
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::channel::{MtlsChannelManager, SecureChannelFactory};
use crate::config::DeviceBindingConfig;
use crate::error::DeviceBindingError;
use crate::http::{read_json, read_text, remote_error, ServiceStub};
use crate::jwt::SignedJwt;

/// Bearer token for FD requests.
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceToken(String);

impl DeviceToken {
    /// Wrap a token. Blank tokens are not ready and never wrapped by the
    /// client.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Token text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DeviceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceToken({} bytes)", self.0.len())
    }
}

/// Result of one token exchange attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceTokenPoll {
    /// The server has not decided yet.
    Pending,
    /// The token was issued.
    Ready(DeviceToken),
}

/// A device registered for a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRegistration {
    /// Insurant identifier.
    pub user_identifier: String,
    /// Device identifier.
    pub device_identifier: String,
    /// Device type.
    pub device_type: String,
    /// Creation timestamp as sent by GMS.
    pub created_at: String,
}

#[derive(Debug, Serialize)]
struct RegisterDeviceRequest<'a> {
    token: &'a str,
}

#[derive(Debug, Deserialize)]
struct RegisterDeviceResponse {
    cert: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeviceAttestationRequest<'a> {
    token: &'a str,
    code_challenge: &'a str,
}

#[derive(Debug, Deserialize)]
struct DeviceTokenResponse {
    #[serde(default)]
    token: String,
}

/// GMS operations used by the orchestrators.
#[async_trait]
pub trait GmsApi: Send + Sync {
    /// Fresh root nonce.
    async fn fetch_nonce(&self) -> Result<RootNonce, DeviceBindingError>;

    /// Register with a registration token; returns the DER client certificate.
    async fn register_device(&self, token: &SignedJwt) -> Result<Vec<u8>, DeviceBindingError>;

    /// Attest with an attestation token; returns the authorization code.
    async fn attest_device(&self, token: &SignedJwt, code_challenge: &str) -> Result<String, DeviceBindingError>;

    /// Exchange the authorization code for a device token.
    async fn exchange_device_token(&self, code: &str, code_verifier: &str) -> Result<DeviceTokenPoll, DeviceBindingError>;

    /// Devices registered for `user_identifier`.
    async fn list_device_registrations(&self, user_identifier: &str) -> Result<Vec<DeviceRegistration>, DeviceBindingError>;

    /// Remove a device registration.
    async fn delete_device_registration(&self, user_identifier: &str, device_identifier: &str) -> Result<(), DeviceBindingError>;
}

/// HTTP implementation of [`GmsApi`].
pub struct GmsClient {
    tls: ServiceStub,
    mtls: MtlsChannelManager,
}

impl GmsClient {
    /// Client for the configured GMS URLs.
    pub fn new(config: &DeviceBindingConfig, factory: Arc<dyn SecureChannelFactory>) -> Result<Self, DeviceBindingError> {
        let tls = ServiceStub::new(factory.server_tls()?, &config.gms_url, &config.authorization, config.retry);
        let mtls = MtlsChannelManager::new(&config.gms_mtls_url, &config.authorization, config.retry, factory)?;
        Ok(Self { tls, mtls })
    }

    /// The mutual TLS channel.
    pub fn channel(&self) -> &MtlsChannelManager {
        &self.mtls
    }
}

impl fmt::Debug for GmsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GmsClient")
            .field("gms_url", &self.tls.base_url())
            .field("mtls", &self.mtls)
            .finish()
    }
}

#[async_trait]
impl GmsApi for GmsClient {
    #[instrument(skip(self))]
    async fn fetch_nonce(&self) -> Result<RootNonce, DeviceBindingError> {
        let response = self.tls.send(self.tls.get("nonce").header(ACCEPT, "text/plain")).await?;
        if !response.status().is_success() {
            return Err(remote_error(response).await);
        }

        let body = read_text(response).await?;
        let encoded = body.trim().trim_end_matches('=');
        let nonce = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| DeviceBindingError::malformed(format!("nonce is not base64url: {e}")))?;
        if nonce.is_empty() {
            return Err(DeviceBindingError::malformed("empty nonce"));
        }
        info!(nonce_len = nonce.len(), "Fetched root nonce");
        Ok(RootNonce::new(nonce))
    }

    #[instrument(skip_all)]
    async fn register_device(&self, token: &SignedJwt) -> Result<Vec<u8>, DeviceBindingError> {
        let request = self
            .tls
            .post("register-device")
            .header(ACCEPT, "application/json")
            .json(&RegisterDeviceRequest { token: token.as_str() });
        let response = self.tls.send(request).await?;
        if !response.status().is_success() {
            return Err(remote_error(response).await);
        }

        let body: RegisterDeviceResponse = read_json(response).await?;
        let cert = STANDARD
            .decode(body.cert.trim())
            .map_err(|e| DeviceBindingError::malformed(format!("cert is not base64: {e}")))?;
        if cert.is_empty() {
            return Err(DeviceBindingError::malformed("empty client certificate"));
        }
        info!(cert_len = cert.len(), "Device registered");
        Ok(cert)
    }

    #[instrument(skip_all)]
    async fn attest_device(&self, token: &SignedJwt, code_challenge: &str) -> Result<String, DeviceBindingError> {
        let stub = self.mtls.switch_to_mtls_if_necessary()?;
        let request = stub
            .post("device-attestation")
            .header(ACCEPT, "text/plain")
            .json(&DeviceAttestationRequest {
                token: token.as_str(),
                code_challenge,
            });
        let response = stub.send(request).await?;
        if !response.status().is_success() {
            return Err(remote_error(response).await);
        }

        let code = read_text(response).await?.trim().to_string();
        if code.is_empty() {
            return Err(DeviceBindingError::malformed("empty authorization code"));
        }
        info!(code_len = code.len(), "Authorization code received");
        Ok(code)
    }

    #[instrument(skip_all)]
    async fn exchange_device_token(&self, code: &str, code_verifier: &str) -> Result<DeviceTokenPoll, DeviceBindingError> {
        let stub = self.mtls.switch_to_mtls_if_necessary()?;
        let request = stub
            .post("device-token")
            .header(ACCEPT, "application/json")
            .form(&[("code", code), ("code_verifier", code_verifier)]);
        let response = stub.send(request).await?;

        match response.status() {
            StatusCode::OK => {
                let body: DeviceTokenResponse = read_json(response).await?;
                if body.token.trim().is_empty() {
                    debug!("Blank device token, not ready");
                    return Ok(DeviceTokenPoll::Pending);
                }
                info!(token_len = body.token.len(), "Device token issued");
                Ok(DeviceTokenPoll::Ready(DeviceToken::new(body.token)))
            },
            StatusCode::ACCEPTED => {
                debug!("Device token not ready");
                Ok(DeviceTokenPoll::Pending)
            },
            _ => Err(remote_error(response).await),
        }
    }

    #[instrument(skip(self))]
    async fn list_device_registrations(&self, user_identifier: &str) -> Result<Vec<DeviceRegistration>, DeviceBindingError> {
        let stub = self.mtls.switch_to_mtls_if_necessary()?;
        let request = stub
            .get("device-registrations")
            .header(ACCEPT, "application/json")
            .query(&[("userIdentifier", user_identifier)]);
        let response = stub.send(request).await?;
        if !response.status().is_success() {
            return Err(remote_error(response).await);
        }

        let devices: Vec<DeviceRegistration> = read_json(response).await?;
        info!(count = devices.len(), "Listed device registrations");
        Ok(devices)
    }

    #[instrument(skip(self))]
    async fn delete_device_registration(&self, user_identifier: &str, device_identifier: &str) -> Result<(), DeviceBindingError> {
        let stub = self.mtls.switch_to_mtls_if_necessary()?;
        let request = stub
            .delete("device-registrations")
            .header(ACCEPT, "application/json")
            .query(&[("userIdentifier", user_identifier), ("deviceIdentifier", device_identifier)]);
        let response = stub.send(request).await?;

        let status = response.status();
        if status.is_success() {
            info!("Device registration deleted");
            return Ok(());
        }
        if status == StatusCode::BAD_REQUEST {
            warn!(status = %status, "Device registration delete rejected");
            return Err(DeviceBindingError::remote(
                status.as_u16().to_string(),
                status.canonical_reason().unwrap_or("Bad Request"),
            ));
        }
        Err(remote_error(response).await)
    }
}
