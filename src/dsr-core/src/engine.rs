//! Device binding engine.
//!
//! Wires configuration, keystore, integrity attestor and device attributes
//! into the GMS and FD clients and the two orchestrators:
//!
//! ```text
//!                 DeviceBindingEngine
//!        ┌────────────────┼─────────────────┐
//!        ▼                ▼                 ▼
//!  Registration      Attestation         FdClient
//!  Orchestrator      Orchestrator           │
//!        │                │                 │
//!        └──── GmsApi ────┘                 │
//!                 │                         │
//!        ServiceStub / MtlsChannelManager ──┘
//! ```

use std::sync::Arc;

use dsr_keystore::{KeyAttestationProvider, KeystoreCapability};
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::attestation::{AttestationOrchestrator, AttestationOutcome, AttestationState};
use crate::channel::{RustlsChannelFactory, SecureChannelFactory};
use crate::config::DeviceBindingConfig;
use crate::credential::{DeviceKeySigner, MockVirtualHealthCardSigner};
use crate::device_attributes::DeviceAttributesSource;
use crate::error::DeviceBindingError;
use crate::fd::{FdApi, FdClient, Prescription};
use crate::gms::{DeviceRegistration, DeviceToken, GmsApi, GmsClient};
use crate::integrity::{IntegrityAttestor, IntegrityVerdictClient};
use crate::jwt::JwtAssembler;
use crate::polling::TokenPoller;
use crate::registration::{RegistrationOrchestrator, RegistrationOutcome, RegistrationState};

/// Result of [`DeviceBindingEngine::enroll`].
#[derive(Debug, Clone)]
pub struct EnrollmentOutcome {
    /// Present when this call registered the device.
    pub registration: Option<RegistrationOutcome>,
    /// The attestation that produced the device token.
    pub attestation: AttestationOutcome,
}

/// Entry point for device registration, attestation and FD access.
pub struct DeviceBindingEngine {
    config: DeviceBindingConfig,
    keys: KeyAttestationProvider,
    gms: Arc<dyn GmsApi>,
    fd: Arc<dyn FdApi>,
    registration: RegistrationOrchestrator,
    attestation: AttestationOrchestrator,
}

impl DeviceBindingEngine {
    /// Engine talking to the configured services over rustls channels.
    ///
    /// # Errors
    ///
    /// [`DeviceBindingError::ConfigError`] if the trust anchors or HTTP
    /// clients cannot be set up.
    pub fn new(
        config: DeviceBindingConfig,
        keystore: Arc<dyn KeystoreCapability>,
        attestor: Arc<dyn IntegrityAttestor>,
        attributes: Arc<dyn DeviceAttributesSource>,
    ) -> Result<Self, DeviceBindingError> {
        let factory = RustlsChannelFactory::new(
            Arc::clone(&keystore),
            config.pinned_chain_pem.as_deref(),
            config.timeouts,
        )?;
        Self::with_channel_factory(config, keystore, attestor, attributes, Arc::new(factory))
    }

    /// Engine using `factory` for every HTTP client.
    pub fn with_channel_factory(
        config: DeviceBindingConfig,
        keystore: Arc<dyn KeystoreCapability>,
        attestor: Arc<dyn IntegrityAttestor>,
        attributes: Arc<dyn DeviceAttributesSource>,
        factory: Arc<dyn SecureChannelFactory>,
    ) -> Result<Self, DeviceBindingError> {
        let gms = Arc::new(GmsClient::new(&config, Arc::clone(&factory))?);
        let fd = Arc::new(FdClient::new(&config, factory)?);
        Self::with_services(config, keystore, attestor, attributes, gms, fd)
    }

    /// Engine over explicit service implementations.
    pub fn with_services(
        config: DeviceBindingConfig,
        keystore: Arc<dyn KeystoreCapability>,
        attestor: Arc<dyn IntegrityAttestor>,
        attributes: Arc<dyn DeviceAttributesSource>,
        gms: Arc<dyn GmsApi>,
        fd: Arc<dyn FdApi>,
    ) -> Result<Self, DeviceBindingError> {
        let keys = KeyAttestationProvider::new(Arc::clone(&keystore)).with_validity_days(config.key_validity_days);
        let integrity = Arc::new(IntegrityVerdictClient::new(attestor, config.cloud_project_number));
        let assembler = JwtAssembler::from_config(&config);

        let registration = RegistrationOrchestrator::new(
            Arc::clone(&gms),
            keys.clone(),
            Arc::clone(&integrity),
            Arc::new(MockVirtualHealthCardSigner::new()?),
            assembler.clone(),
        );
        let attestation = AttestationOrchestrator::new(
            Arc::clone(&gms),
            keys.clone(),
            integrity,
            Arc::new(DeviceKeySigner::new(keystore)),
            attributes,
            assembler,
            TokenPoller::new(config.polling),
        );

        info!(gms = %config.gms_url, fd = %config.fd_url, "Device binding engine ready");
        Ok(Self {
            config,
            keys,
            gms,
            fd,
            registration,
            attestation,
        })
    }

    /// Active configuration.
    pub fn config(&self) -> &DeviceBindingConfig {
        &self.config
    }

    /// Register this device with GMS.
    pub async fn register(&self) -> Result<RegistrationOutcome, DeviceBindingError> {
        self.registration.run().await
    }

    /// Attest this device and obtain a device token.
    pub async fn attest(&self) -> Result<AttestationOutcome, DeviceBindingError> {
        self.attestation.run().await
    }

    /// Register unless already registered, then attest.
    #[instrument(skip(self))]
    pub async fn enroll(&self) -> Result<EnrollmentOutcome, DeviceBindingError> {
        let registration = if self.is_registered()? {
            info!("Device already registered, skipping registration");
            None
        } else {
            Some(self.register().await?)
        };
        let attestation = self.attest().await?;
        Ok(EnrollmentOutcome {
            registration,
            attestation,
        })
    }

    /// Whether a GMS client certificate is stored.
    pub fn is_registered(&self) -> Result<bool, DeviceBindingError> {
        Ok(self.keys.is_registered()?)
    }

    /// Delete every device binding key. The device must register again.
    pub fn reset(&self) -> Result<(), DeviceBindingError> {
        warn!("Resetting device binding");
        Ok(self.keys.delete_all_keys()?)
    }

    /// Devices registered for `user_identifier`, or the configured user.
    pub async fn list_devices(
        &self,
        user_identifier: Option<&str>,
    ) -> Result<Vec<DeviceRegistration>, DeviceBindingError> {
        let user = user_identifier.unwrap_or(&self.config.user_identifier);
        self.gms.list_device_registrations(user).await
    }

    /// Remove a registration of `user_identifier`, or the configured user.
    pub async fn delete_device(
        &self,
        user_identifier: Option<&str>,
        device_identifier: &str,
    ) -> Result<(), DeviceBindingError> {
        let user = user_identifier.unwrap_or(&self.config.user_identifier);
        self.gms.delete_device_registration(user, device_identifier).await
    }

    /// Prescriptions reachable with `token`.
    pub async fn prescriptions(&self, token: &DeviceToken) -> Result<Vec<Prescription>, DeviceBindingError> {
        self.fd.prescriptions(token).await
    }

    /// Registration progress.
    pub fn registration_state(&self) -> watch::Receiver<RegistrationState> {
        self.registration.subscribe()
    }

    /// Attestation progress.
    pub fn attestation_state(&self) -> watch::Receiver<AttestationState> {
        self.attestation.subscribe()
    }
}

impl std::fmt::Debug for DeviceBindingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBindingEngine")
            .field("gms_url", &self.config.gms_url)
            .field("fd_url", &self.config.fd_url)
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}
