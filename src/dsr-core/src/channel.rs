//! Secure channels and the one-way upgrade to mutual TLS.
//!
//! A fresh [`MtlsChannelManager`] talks server-authenticated TLS. Once the
//! device holds a GMS client certificate, [`MtlsChannelManager::switch_to_mtls_if_necessary`]
//! builds a client that presents it and swaps channel and service stub in one
//! step. The transition happens at most once.
//!
//! The default [`RustlsChannelFactory`] never exports the private key: the
//! TLS handshake signature is produced by [`KeystoreCapability::sign`].

use std::io::BufReader;
use std::sync::{Arc, Mutex};

use dsr_keystore::{KeystoreCapability, MTLS_CERT_ALIAS, MTLS_KEYPAIR_ALIAS};
use reqwest::redirect::Policy;
use reqwest::{Client, ClientBuilder};
use rustls::client::ResolvesClientCert;
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::CertificateDer;
use rustls::sign::{CertifiedKey, Signer, SigningKey};
use rustls::{ClientConfig, RootCertStore, SignatureScheme};
use tracing::{debug, info, instrument, warn};

use crate::config::{RetryPolicy, TimeoutConfig};
use crate::error::DeviceBindingError;
use crate::http::ServiceStub;

/// Trust anchors for the GMS and FD mTLS endpoints.
pub const GMS_CERT_CHAIN_PEM: &str = include_str!("../resources/gms_cert_chain.pem");

// =============================================================================
// Channel factory
// =============================================================================

/// Builds the HTTP clients behind a channel.
pub trait SecureChannelFactory: Send + Sync {
    /// Client authenticating only the server.
    fn server_tls(&self) -> Result<Client, DeviceBindingError>;

    /// Client that also presents the stored device certificate.
    fn mutual_tls(&self) -> Result<Client, DeviceBindingError>;
}

/// reqwest + rustls channels with pinned trust anchors.
pub struct RustlsChannelFactory {
    keystore: Arc<dyn KeystoreCapability>,
    pinned: Vec<CertificateDer<'static>>,
    timeouts: TimeoutConfig,
}

impl RustlsChannelFactory {
    /// Factory trusting the bundled web PKI roots plus `pinned_pem`, or the
    /// embedded GMS chain when `None`.
    ///
    /// # Errors
    ///
    /// [`DeviceBindingError::ConfigError`] if the PEM holds no certificate.
    pub fn new(
        keystore: Arc<dyn KeystoreCapability>,
        pinned_pem: Option<&str>,
        timeouts: TimeoutConfig,
    ) -> Result<Self, DeviceBindingError> {
        let pinned = parse_pem_chain(pinned_pem.unwrap_or(GMS_CERT_CHAIN_PEM))?;
        debug!(pinned = pinned.len(), "Loaded pinned trust anchors");
        Ok(Self {
            keystore,
            pinned,
            timeouts,
        })
    }

    fn root_store(&self) -> Result<RootCertStore, DeviceBindingError> {
        let mut roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        for cert in &self.pinned {
            roots
                .add(cert.clone())
                .map_err(|e| DeviceBindingError::config(format!("Invalid pinned certificate: {e}")))?;
        }
        Ok(roots)
    }

    fn client_builder(&self, tls: ClientConfig) -> ClientBuilder {
        ClientBuilder::new()
            .use_preconfigured_tls(tls)
            .redirect(Policy::none())
            .connect_timeout(self.timeouts.connect)
            .read_timeout(self.timeouts.read)
            .timeout(self.timeouts.total())
            .user_agent(format!("dsr-client/{}", env!("CARGO_PKG_VERSION")))
    }
}

impl SecureChannelFactory for RustlsChannelFactory {
    fn server_tls(&self) -> Result<Client, DeviceBindingError> {
        let tls = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(tls_config_error)?
            .with_root_certificates(self.root_store()?)
            .with_no_client_auth();

        self.client_builder(tls)
            .build()
            .map_err(|e| DeviceBindingError::config(format!("Failed to create HTTP client: {e}")))
    }

    fn mutual_tls(&self) -> Result<Client, DeviceBindingError> {
        let tls = ClientConfig::builder_with_provider(Arc::new(mtls_provider()))
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(tls_config_error)?
            .with_root_certificates(self.root_store()?)
            .with_client_cert_resolver(Arc::new(KeystoreCertResolver {
                keystore: Arc::clone(&self.keystore),
            }));

        self.client_builder(tls)
            .build()
            .map_err(|e| DeviceBindingError::config(format!("Failed to create mTLS client: {e}")))
    }
}

impl std::fmt::Debug for RustlsChannelFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RustlsChannelFactory")
            .field("pinned", &self.pinned.len())
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

/// ring provider restricted to the TLS 1.3 AEAD suites allowed for mTLS.
fn mtls_provider() -> CryptoProvider {
    CryptoProvider {
        cipher_suites: vec![
            ring::cipher_suite::TLS13_AES_128_GCM_SHA256,
            ring::cipher_suite::TLS13_AES_256_GCM_SHA384,
            ring::cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
        ],
        ..ring::default_provider()
    }
}

fn tls_config_error(e: rustls::Error) -> DeviceBindingError {
    DeviceBindingError::config(format!("TLS configuration: {e}"))
}

/// Parse every certificate in a PEM bundle.
pub fn parse_pem_chain(pem: &str) -> Result<Vec<CertificateDer<'static>>, DeviceBindingError> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(pem.as_bytes()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| DeviceBindingError::config(format!("Invalid PEM: {e}")))?;
    if certs.is_empty() {
        return Err(DeviceBindingError::config("PEM bundle holds no certificate"));
    }
    Ok(certs)
}

// =============================================================================
// Keystore-backed client certificate
// =============================================================================

struct KeystoreCertResolver {
    keystore: Arc<dyn KeystoreCapability>,
}

impl std::fmt::Debug for KeystoreCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeystoreCertResolver")
            .field("alias", &MTLS_CERT_ALIAS)
            .finish()
    }
}

impl ResolvesClientCert for KeystoreCertResolver {
    fn resolve(&self, _root_hint_subjects: &[&[u8]], sigschemes: &[SignatureScheme]) -> Option<Arc<CertifiedKey>> {
        if !sigschemes.contains(&SignatureScheme::ECDSA_NISTP256_SHA256) {
            warn!("Server accepts no ECDSA P-256 client signature");
            return None;
        }
        let cert = match self.keystore.certificate(MTLS_CERT_ALIAS) {
            Ok(cert) => cert,
            Err(e) => {
                warn!(error = %e, "No client certificate for mTLS");
                return None;
            },
        };
        let key = Arc::new(KeystoreSigningKey {
            keystore: Arc::clone(&self.keystore),
        });
        Some(Arc::new(CertifiedKey::new(vec![CertificateDer::from(cert)], key)))
    }

    fn has_certs(&self) -> bool {
        self.keystore.contains_alias(MTLS_CERT_ALIAS).unwrap_or(false)
    }
}

struct KeystoreSigningKey {
    keystore: Arc<dyn KeystoreCapability>,
}

impl std::fmt::Debug for KeystoreSigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeystoreSigningKey")
            .field("alias", &MTLS_KEYPAIR_ALIAS)
            .finish()
    }
}

impl SigningKey for KeystoreSigningKey {
    fn choose_scheme(&self, offered: &[SignatureScheme]) -> Option<Box<dyn Signer>> {
        offered
            .contains(&SignatureScheme::ECDSA_NISTP256_SHA256)
            .then(|| {
                Box::new(KeystoreSigner {
                    keystore: Arc::clone(&self.keystore),
                }) as Box<dyn Signer>
            })
    }

    fn algorithm(&self) -> rustls::SignatureAlgorithm {
        rustls::SignatureAlgorithm::ECDSA
    }
}

struct KeystoreSigner {
    keystore: Arc<dyn KeystoreCapability>,
}

impl std::fmt::Debug for KeystoreSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeystoreSigner")
            .field("scheme", &SignatureScheme::ECDSA_NISTP256_SHA256)
            .finish()
    }
}

impl Signer for KeystoreSigner {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, rustls::Error> {
        // TLS 1.3 carries ECDSA signatures DER-encoded, as the keystore returns them.
        self.keystore
            .sign(MTLS_KEYPAIR_ALIAS, message)
            .map_err(|e| rustls::Error::General(format!("keystore signing failed: {e}")))
    }

    fn scheme(&self) -> SignatureScheme {
        SignatureScheme::ECDSA_NISTP256_SHA256
    }
}

// =============================================================================
// Channel manager
// =============================================================================

/// Which kind of channel is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Only the server is authenticated.
    ServerTlsOnly,
    /// The device certificate is presented. Terminal.
    MutualTls,
}

struct ChannelSlot {
    state: ChannelState,
    stub: Arc<ServiceStub>,
}

/// Holds the current channel and service stub for one service.
pub struct MtlsChannelManager {
    base_url: String,
    authorization: String,
    retry: RetryPolicy,
    factory: Arc<dyn SecureChannelFactory>,
    slot: Mutex<ChannelSlot>,
}

impl MtlsChannelManager {
    /// Manager starting in [`ChannelState::ServerTlsOnly`].
    ///
    /// # Errors
    ///
    /// Propagates failures building the server-TLS client.
    pub fn new(
        base_url: &str,
        authorization: &str,
        retry: RetryPolicy,
        factory: Arc<dyn SecureChannelFactory>,
    ) -> Result<Self, DeviceBindingError> {
        let stub = Arc::new(ServiceStub::new(factory.server_tls()?, base_url, authorization, retry));
        Ok(Self {
            base_url: base_url.to_string(),
            authorization: authorization.to_string(),
            retry,
            factory,
            slot: Mutex::new(ChannelSlot {
                state: ChannelState::ServerTlsOnly,
                stub,
            }),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ChannelSlot>, DeviceBindingError> {
        self.slot
            .lock()
            .map_err(|_| DeviceBindingError::transport("channel lock poisoned"))
    }

    /// Current state.
    pub fn state(&self) -> Result<ChannelState, DeviceBindingError> {
        Ok(self.lock()?.state)
    }

    /// Current service stub.
    pub fn current(&self) -> Result<Arc<ServiceStub>, DeviceBindingError> {
        Ok(Arc::clone(&self.lock()?.stub))
    }

    /// Upgrade to mutual TLS unless already done, and return the stub.
    ///
    /// The lock is held only while the new client is built and swapped in, so
    /// concurrent callers see exactly one transition.
    #[instrument(skip(self), fields(base_url = %self.base_url))]
    pub fn switch_to_mtls_if_necessary(&self) -> Result<Arc<ServiceStub>, DeviceBindingError> {
        let mut slot = self.lock()?;
        if slot.state == ChannelState::MutualTls {
            return Ok(Arc::clone(&slot.stub));
        }

        let client = self.factory.mutual_tls()?;
        slot.stub = Arc::new(ServiceStub::new(client, &self.base_url, &self.authorization, self.retry));
        slot.state = ChannelState::MutualTls;
        info!("Switched to mutual TLS");
        Ok(Arc::clone(&slot.stub))
    }
}

impl std::fmt::Debug for MtlsChannelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MtlsChannelManager")
            .field("base_url", &self.base_url)
            .field("state", &self.state().ok())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingFactory {
        server: AtomicUsize,
        mutual: AtomicUsize,
    }

    impl SecureChannelFactory for CountingFactory {
        fn server_tls(&self) -> Result<Client, DeviceBindingError> {
            self.server.fetch_add(1, Ordering::SeqCst);
            Ok(Client::new())
        }

        fn mutual_tls(&self) -> Result<Client, DeviceBindingError> {
            self.mutual.fetch_add(1, Ordering::SeqCst);
            Ok(Client::new())
        }
    }

    struct FailingFactory;

    impl SecureChannelFactory for FailingFactory {
        fn server_tls(&self) -> Result<Client, DeviceBindingError> {
            Ok(Client::new())
        }

        fn mutual_tls(&self) -> Result<Client, DeviceBindingError> {
            Err(DeviceBindingError::keystore("no client certificate"))
        }
    }

    fn manager(factory: Arc<dyn SecureChannelFactory>) -> MtlsChannelManager {
        MtlsChannelManager::new("http://localhost", "secret", RetryPolicy::disabled(), factory).unwrap()
    }

    #[test]
    fn test_starts_server_tls_only() {
        let factory = Arc::new(CountingFactory::default());
        let manager = manager(factory.clone());
        assert_eq!(manager.state().unwrap(), ChannelState::ServerTlsOnly);
        assert_eq!(factory.server.load(Ordering::SeqCst), 1);
        assert_eq!(factory.mutual.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_second_switch_is_noop() {
        let factory = Arc::new(CountingFactory::default());
        let manager = manager(factory.clone());

        let first = manager.switch_to_mtls_if_necessary().unwrap();
        assert_eq!(manager.state().unwrap(), ChannelState::MutualTls);
        let second = manager.switch_to_mtls_if_necessary().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first, &manager.current().unwrap()));
        assert_eq!(factory.mutual.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_switch_builds_once() {
        let factory = Arc::new(CountingFactory::default());
        let manager = Arc::new(manager(factory.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = Arc::clone(&manager);
                std::thread::spawn(move || manager.switch_to_mtls_if_necessary().unwrap())
            })
            .collect();
        let stubs: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(factory.mutual.load(Ordering::SeqCst), 1);
        assert!(stubs.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[test]
    fn test_failed_switch_stays_server_tls() {
        let manager = manager(Arc::new(FailingFactory));
        assert!(manager.switch_to_mtls_if_necessary().is_err());
        assert_eq!(manager.state().unwrap(), ChannelState::ServerTlsOnly);
    }

    #[test]
    fn test_embedded_chain_parses() {
        let certs = parse_pem_chain(GMS_CERT_CHAIN_PEM).unwrap();
        assert!(!certs.is_empty());
        assert!(parse_pem_chain("not a pem").is_err());
    }

    #[cfg(feature = "software")]
    #[test]
    fn test_rustls_factory_builds_both_clients() {
        let keystore: Arc<dyn KeystoreCapability> = Arc::new(dsr_keystore::SoftwareKeystore::new().unwrap());
        let factory = RustlsChannelFactory::new(keystore, None, TimeoutConfig::default()).unwrap();
        factory.server_tls().unwrap();
        factory.mutual_tls().unwrap();
    }

    #[test]
    fn test_mtls_provider_is_restricted() {
        let provider = mtls_provider();
        assert_eq!(provider.cipher_suites.len(), 3);
        assert!(provider
            .cipher_suites
            .iter()
            .all(|suite| matches!(suite, rustls::SupportedCipherSuite::Tls13(_))));
    }
}
