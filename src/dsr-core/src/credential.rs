//! Token signing credentials.
//!
//! [`CredentialSigner`] produces the JWS signature and the certificate placed
//! in the `x5c` header. Two implementations exist:
//!
//! | Signer                           | alg       | Key                             |
//! |----------------------------------|-----------|---------------------------------|
//! | [`MockVirtualHealthCardSigner`]  | `BP256R1` | fixed demo health card key      |
//! | [`DeviceKeySigner`]              | `ES256`   | keystore `mTLSKeyPair`          |
//!
//! The mock health card is a stand-in for a real card signature. A card
//! backed signer implements the same trait.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use dsr_crypto::{der_signature_to_raw, Bp256Signer, EcSigner, SignatureAlgorithm};
use dsr_keystore::{KeystoreCapability, MTLS_CERT_ALIAS, MTLS_KEYPAIR_ALIAS};
use tracing::debug;

use crate::error::DeviceBindingError;

/// Signs JWS signing inputs.
pub trait CredentialSigner: Send + Sync {
    /// JWS algorithm.
    fn algorithm(&self) -> SignatureAlgorithm;

    /// DER certificate for the `x5c` header.
    fn certificate(&self) -> Result<Vec<u8>, DeviceBindingError>;

    /// Raw `r || s` signature over `signing_input`.
    fn sign(&self, signing_input: &[u8]) -> Result<Vec<u8>, DeviceBindingError>;
}

// =============================================================================
// Mock health card
// =============================================================================

/// Test-only health card certificate (brainpoolP256r1, `NOT-VALID` issuer).
const VIRTUAL_HEALTH_CARD_CERTIFICATE: &str = "MIIDJjCCAsygAwIBAgIHARaNeArTFDAKBggqhkjOPQQDAjCBljELMAkGA1UEBhMCREUxHzAdBgNVBAoMFmdlbWF0aWsgR21iSCBOT1QtVkFMSUQxRTBDBgNVBAsMPEVsZWt0cm9uaXNjaGUgR2VzdW5kaGVpdHNrYXJ0ZS1DQSBkZXIgVGVsZW1hdGlraW5mcmFzdHJ1a3R1cjEfMB0GA1UEAwwWR0VNLkVHSy1DQTEwIFRFU1QtT05MWTAeFw0yMDExMjcwMDAwMDBaFw0yMzExMjcwMDAwMDBaMIGoMQswCQYDVQQGEwJERTEpMCcGA1UECgwgZ2VtYXRpayBNdXN0ZXJrYXNzZTFHS1ZOT1QtVkFMSUQxEjAQBgNVBAsMCTg5OTA3Nzg5MTETMBEGA1UECwwKWDc2NDIyODUzMjEOMAwGA1UEBAwFWmVicmExEjAQBgNVBCoMCVphY2hhcmlhczEhMB8GA1UEAwwYWmFjaGFyaWFzIFplYnJhVEVTVC1PTkxZMFowFAYHKoZIzj0CAQYJKyQDAwIIAQEHA0IABEo3u3g4C5NEQAbTSsgSVryCwnm6sovK3H3ZoBH7kd9LKUNSlWFlRpd2lsDI5CpFAphTVSIcDY8QB6V/2xztAiyjge8wgewwIAYDVR0gBBkwFzAKBggqghQATASBIzAJBgcqghQATARGMDAGBSskCAMDBCcwJTAjMCEwHzAdMBAMDlZlcnNpY2hlcnRlLy1yMAkGByqCFABMBDEwDgYDVR0PAQH/BAQDAgeAMDgGCCsGAQUFBwEBBCwwKjAoBggrBgEFBQcwAYYcaHR0cDovL2VoY2EuZ2VtYXRpay5kZS9vY3NwLzAdBgNVHQ4EFgQUHT0IU25tmCDOlfZaCfqbutn1jTwwDAYDVR0TAQH/BAIwADAfBgNVHSMEGDAWgBREsUwBWFQe3Nk3vuSyPypupFyJHTAKBggqhkjOPQQDAgNIADBFAiEAgu1f1Y/99fS02y4EVO33RAOvucgErlmpsJMPZkJdMLUCICHyjEb9KrbkdOfkNAABQvIsEw0LKpCaDis/1bvbuZgN";

/// Private scalar matching [`VIRTUAL_HEALTH_CARD_CERTIFICATE`].
const VIRTUAL_HEALTH_CARD_PRIVATE_KEY: &str = "Z4N8vzmPX9Ox8eNQVGz1C53WrMpHP5k/4o4+KSdVc1A=";

/// Signs with the fixed demo health card credential.
pub struct MockVirtualHealthCardSigner {
    signer: Bp256Signer,
    certificate: Vec<u8>,
}

impl MockVirtualHealthCardSigner {
    /// Load the embedded demo credential.
    pub fn new() -> Result<Self, DeviceBindingError> {
        let key = STANDARD
            .decode(VIRTUAL_HEALTH_CARD_PRIVATE_KEY)
            .map_err(|e| DeviceBindingError::signing(format!("demo key: {e}")))?;
        let certificate = STANDARD
            .decode(VIRTUAL_HEALTH_CARD_CERTIFICATE)
            .map_err(|e| DeviceBindingError::signing(format!("demo certificate: {e}")))?;
        Ok(Self {
            signer: Bp256Signer::from_bytes(&key)?,
            certificate,
        })
    }
}

impl CredentialSigner for MockVirtualHealthCardSigner {
    fn algorithm(&self) -> SignatureAlgorithm {
        SignatureAlgorithm::Bp256r1
    }

    fn certificate(&self) -> Result<Vec<u8>, DeviceBindingError> {
        Ok(self.certificate.clone())
    }

    fn sign(&self, signing_input: &[u8]) -> Result<Vec<u8>, DeviceBindingError> {
        Ok(self.signer.sign(signing_input)?)
    }
}

impl std::fmt::Debug for MockVirtualHealthCardSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockVirtualHealthCardSigner")
            .field("certificate_len", &self.certificate.len())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Device key
// =============================================================================

/// Signs with the keystore mTLS key; `x5c` is the GMS-issued certificate.
#[derive(Clone)]
pub struct DeviceKeySigner {
    keystore: Arc<dyn KeystoreCapability>,
}

impl DeviceKeySigner {
    /// Signer over `keystore`.
    pub fn new(keystore: Arc<dyn KeystoreCapability>) -> Self {
        Self { keystore }
    }
}

impl CredentialSigner for DeviceKeySigner {
    fn algorithm(&self) -> SignatureAlgorithm {
        SignatureAlgorithm::Es256
    }

    fn certificate(&self) -> Result<Vec<u8>, DeviceBindingError> {
        self.keystore
            .certificate(MTLS_CERT_ALIAS)
            .map_err(|e| DeviceBindingError::keystore(e.to_string()))
    }

    fn sign(&self, signing_input: &[u8]) -> Result<Vec<u8>, DeviceBindingError> {
        let der = self
            .keystore
            .sign(MTLS_KEYPAIR_ALIAS, signing_input)
            .map_err(|e| DeviceBindingError::signing(e.to_string()))?;
        debug!(der_len = der.len(), "Signed with device key");
        Ok(der_signature_to_raw(&der)?)
    }
}

impl std::fmt::Debug for DeviceKeySigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceKeySigner")
            .field("alias", &MTLS_KEYPAIR_ALIAS)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsr_crypto::{certificate_public_key, verify_signature};

    #[test]
    fn test_demo_key_matches_certificate() {
        let signer = MockVirtualHealthCardSigner::new().unwrap();
        let public_key = certificate_public_key(&signer.certificate().unwrap()).unwrap();
        assert!(public_key.is_on_curve("1.3.36.3.3.2.8.1.1.7"));

        let sig = signer.sign(b"header.payload").unwrap();
        assert_eq!(sig.len(), 64);
        assert!(verify_signature(SignatureAlgorithm::Bp256r1, &public_key.point, b"header.payload", &sig).unwrap());
    }

    #[cfg(feature = "software")]
    #[test]
    fn test_device_key_requires_mtls_key() {
        let keystore = Arc::new(dsr_keystore::SoftwareKeystore::new().unwrap());
        let signer = DeviceKeySigner::new(keystore);
        assert!(matches!(signer.sign(b"x").unwrap_err(), DeviceBindingError::SigningError { .. }));
        assert!(matches!(
            signer.certificate().unwrap_err(),
            DeviceBindingError::KeystoreUnavailable { .. }
        ));
    }
}
