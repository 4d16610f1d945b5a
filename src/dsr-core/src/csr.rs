//! PKCS#10 certificate signing requests for the mTLS key.
//!
//! The CSR carries a `challengePassword` attribute with the base64 of a
//! purpose-bound nonce, so GMS can tie the request to the registration run.
//! The private key never leaves the keystore: the request info is signed
//! through [`KeystoreCapability::sign`].

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use der::asn1::{Any, BitString, ObjectIdentifier, PrintableStringRef, SetOfVec, Utf8StringRef};
use der::{Decode, Encode};
use dsr_crypto::{der_signature_to_raw, verify_signature, DerivedNonce, PublicKeyInfo, SignatureAlgorithm};
use dsr_keystore::{KeyPairRecord, KeystoreCapability};
use spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned};
use tracing::debug;
use x509_cert::attr::{Attribute, AttributeTypeAndValue};
use x509_cert::name::{Name, RdnSequence, RelativeDistinguishedName};
use x509_cert::request::{CertReq, CertReqInfo, Version};

use crate::error::DeviceBindingError;

/// PKCS#9 challengePassword.
pub const CHALLENGE_PASSWORD_OID: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.7");

/// ecdsa-with-SHA256.
pub const ECDSA_WITH_SHA256_OID: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.2");

const COUNTRY_OID: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.6");
const ORGANIZATION_OID: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.10");
const COMMON_NAME_OID: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.3");

fn der_err(e: der::Error) -> DeviceBindingError {
    DeviceBindingError::signing(format!("CSR encoding: {e}"))
}

/// Builds CSRs with a fixed subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrBuilder {
    country: String,
    organization: String,
    common_name: String,
}

impl Default for CsrBuilder {
    fn default() -> Self {
        Self {
            country: "DE".into(),
            organization: "DSR_POC".into(),
            common_name: "TRUST_CLIENT".into(),
        }
    }
}

impl CsrBuilder {
    /// Builder with the default `C=DE, O=DSR_POC, CN=TRUST_CLIENT` subject.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn subject(&self) -> Result<Name, DeviceBindingError> {
        let country = Any::encode_from(&PrintableStringRef::new(&self.country).map_err(der_err)?)
            .map_err(der_err)?;
        let organization =
            Any::encode_from(&Utf8StringRef::new(&self.organization).map_err(der_err)?)
                .map_err(der_err)?;
        let common_name =
            Any::encode_from(&Utf8StringRef::new(&self.common_name).map_err(der_err)?)
                .map_err(der_err)?;

        [
            (COUNTRY_OID, country),
            (ORGANIZATION_OID, organization),
            (COMMON_NAME_OID, common_name),
        ]
        .into_iter()
        .map(|(oid, value)| {
            SetOfVec::try_from(vec![AttributeTypeAndValue { oid, value }])
                .map(RelativeDistinguishedName)
                .map_err(der_err)
        })
        .collect::<Result<Vec<_>, _>>()
        .map(RdnSequence)
    }

    /// Build and sign a CSR for `key` with `challenge` as challenge password.
    ///
    /// # Errors
    ///
    /// [`DeviceBindingError::SigningError`] if encoding fails or the keystore
    /// cannot sign with `key.alias`.
    pub fn build(
        &self,
        keystore: &dyn KeystoreCapability,
        key: &KeyPairRecord,
        challenge: &DerivedNonce,
    ) -> Result<Csr, DeviceBindingError> {
        let public_key = SubjectPublicKeyInfoOwned::from_der(&key.public_key).map_err(der_err)?;

        let password = STANDARD.encode(challenge.as_bytes());
        let value = Any::encode_from(&Utf8StringRef::new(&password).map_err(der_err)?)
            .map_err(der_err)?;
        let attribute = Attribute {
            oid: CHALLENGE_PASSWORD_OID,
            values: SetOfVec::try_from(vec![value]).map_err(der_err)?,
        };

        let info = CertReqInfo {
            version: Version::V1,
            subject: self.subject()?,
            public_key,
            attributes: SetOfVec::try_from(vec![attribute]).map_err(der_err)?,
        };

        let tbs = info.to_der().map_err(der_err)?;
        let signature = keystore
            .sign(&key.alias, &tbs)
            .map_err(|e| DeviceBindingError::signing(e.to_string()))?;

        let request = CertReq {
            info,
            algorithm: AlgorithmIdentifierOwned {
                oid: ECDSA_WITH_SHA256_OID,
                parameters: None,
            },
            signature: BitString::from_bytes(&signature).map_err(der_err)?,
        };

        let der = request.to_der().map_err(der_err)?;
        debug!(alias = %key.alias, csr_len = der.len(), "Built CSR");
        Ok(Csr { der })
    }
}

/// DER-encoded PKCS#10 request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Csr {
    der: Vec<u8>,
}

impl Csr {
    /// Wrap and validate DER bytes.
    ///
    /// # Errors
    ///
    /// [`DeviceBindingError::MalformedResponse`] if the bytes are not a CSR.
    pub fn from_der(der: Vec<u8>) -> Result<Self, DeviceBindingError> {
        CertReq::from_der(&der).map_err(|e| DeviceBindingError::malformed(e.to_string()))?;
        Ok(Self { der })
    }

    /// DER bytes.
    #[must_use]
    pub fn as_der(&self) -> &[u8] {
        &self.der
    }

    /// Standard base64 of the DER, as carried in the `csr` claim.
    #[must_use]
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.der)
    }

    fn parse(&self) -> Result<CertReq, DeviceBindingError> {
        CertReq::from_der(&self.der).map_err(|e| DeviceBindingError::malformed(e.to_string()))
    }

    /// The challengePassword attribute, if present.
    pub fn challenge_password(&self) -> Result<Option<String>, DeviceBindingError> {
        let request = self.parse()?;
        let Some(attribute) = request
            .info
            .attributes
            .iter()
            .find(|attr| attr.oid == CHALLENGE_PASSWORD_OID)
        else {
            return Ok(None);
        };
        attribute
            .values
            .iter()
            .next()
            .map(|value| {
                value
                    .decode_as::<Utf8StringRef<'_>>()
                    .map(|s| s.as_str().to_string())
                    .map_err(|e| DeviceBindingError::malformed(e.to_string()))
            })
            .transpose()
    }

    /// DER SubjectPublicKeyInfo of the requested key.
    pub fn public_key(&self) -> Result<Vec<u8>, DeviceBindingError> {
        self.parse()?
            .info
            .public_key
            .to_der()
            .map_err(|e| DeviceBindingError::malformed(e.to_string()))
    }

    /// Check the self-signature with the embedded public key.
    pub fn verify(&self) -> Result<bool, DeviceBindingError> {
        let request = self.parse()?;
        if request.algorithm.oid != ECDSA_WITH_SHA256_OID {
            return Ok(false);
        }
        let tbs = request.info.to_der().map_err(der_err)?;
        let spki = request.info.public_key.to_der().map_err(der_err)?;
        let point = PublicKeyInfo::from_spki_der(&spki)?.point;
        let Some(sig_der) = request.signature.as_bytes() else {
            return Ok(false);
        };
        let raw = der_signature_to_raw(sig_der)?;
        Ok(verify_signature(SignatureAlgorithm::Es256, &point, &tbs, &raw)?)
    }
}

#[cfg(all(test, feature = "software"))]
mod tests {
    use super::*;
    use chrono::Utc;
    use dsr_crypto::{NonceTag, RootNonce};
    use dsr_keystore::{KeyGenSpec, SoftwareKeystore, ValidityWindow, MTLS_KEYPAIR_ALIAS};

    fn setup() -> (SoftwareKeystore, KeyPairRecord, DerivedNonce) {
        let keystore = SoftwareKeystore::new().unwrap();
        let root = RootNonce::new(vec![1u8; 32]);
        let record = keystore
            .generate_key(&KeyGenSpec::signing(
                MTLS_KEYPAIR_ALIAS,
                root.derive(NonceTag::KeypairMtls).to_vec(),
                ValidityWindow::days_from(Utc::now(), 365),
            ))
            .unwrap();
        (keystore, record, root.derive(NonceTag::CsrMtls))
    }

    #[test]
    fn test_csr_carries_challenge_and_key() {
        let (keystore, record, nonce) = setup();
        let csr = CsrBuilder::new().build(&keystore, &record, &nonce).unwrap();

        assert_eq!(
            csr.challenge_password().unwrap().as_deref(),
            Some(STANDARD.encode(nonce.as_bytes()).as_str())
        );
        assert_eq!(csr.public_key().unwrap(), record.public_key);
        assert!(csr.verify().unwrap());
    }

    #[test]
    fn test_csr_subject() {
        let (keystore, record, nonce) = setup();
        let csr = CsrBuilder::new().build(&keystore, &record, &nonce).unwrap();
        let request = CertReq::from_der(csr.as_der()).unwrap();
        let subject = request.info.subject.to_string();
        assert!(subject.contains("CN=TRUST_CLIENT"), "{subject}");
        assert!(subject.contains("O=DSR_POC"), "{subject}");
        assert!(subject.contains("C=DE"), "{subject}");
    }

    #[test]
    fn test_tampered_csr_fails_verification() {
        let (keystore, record, nonce) = setup();
        let csr = CsrBuilder::new().build(&keystore, &record, &nonce).unwrap();

        let other = RootNonce::new(vec![2u8; 32]).derive(NonceTag::CsrMtls);
        let mut request = CertReq::from_der(csr.as_der()).unwrap();
        let forged = CsrBuilder::new().build(&keystore, &record, &other).unwrap();
        request.info = CertReq::from_der(forged.as_der()).unwrap().info;
        // Original signature over a different request info.
        let tampered = Csr::from_der(request.to_der().unwrap()).unwrap();
        assert!(!tampered.verify().unwrap());
    }

    #[test]
    fn test_unknown_alias_is_signing_error() {
        let (keystore, mut record, nonce) = setup();
        record.alias = "missing".into();
        let err = CsrBuilder::new().build(&keystore, &record, &nonce).unwrap_err();
        assert!(matches!(err, DeviceBindingError::SigningError { .. }));
    }

    #[test]
    fn test_from_der_rejects_garbage() {
        assert!(Csr::from_der(vec![0x30, 0x03, 0x02, 0x01, 0x00]).is_err());
    }
}
