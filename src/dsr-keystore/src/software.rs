//! Software-only keystore implementation.
//!
//! WARNING: keys live in process memory with NO hardware binding, and the
//! attestation chain ends in a root generated at construction time that no
//! server trusts. Use only for:
//! - Development and testing
//! - The demo CLI on desktop hosts
//!
//! Attestation certificates carry a [`KeyDescription`] extension with the
//! generation challenge, mirroring what a platform keystore emits.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use der::Encode;
use p256::ecdsa::{signature::Signer, DerSignature, SigningKey};
use p256::pkcs8::{DecodePrivateKey, EncodePublicKey};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CustomExtension, DistinguishedName, DnType,
    IsCa, KeyPair, KeyUsagePurpose, PKCS_ECDSA_P256_SHA256,
};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::capability::{KeyGenSpec, KeystoreCapability};
use crate::error::KeystoreError;
use crate::types::{
    AttestationChain, KeyDescription, KeyPairRecord, KeyPurpose, PlatformCapabilities,
    SecurityLevel, KEY_DESCRIPTION_OID,
};

const LEAF_SUBJECT: &str = "Android Keystore Key";

/// Signs certificates: the device root, the factory key, or an attest key.
struct Issuer {
    cert: Certificate,
    key: KeyPair,
}

enum Entry {
    KeyPair {
        signing_key: SigningKey,
        /// Leaf first.
        chain: Vec<Vec<u8>>,
        /// Present for attest keys only.
        issuer: Option<Issuer>,
    },
    Certificate(Vec<u8>),
}

/// In-memory keystore for development and tests.
pub struct SoftwareKeystore {
    capabilities: PlatformCapabilities,
    root_der: Vec<u8>,
    factory: Issuer,
    factory_der: Vec<u8>,
    entries: RwLock<HashMap<String, Entry>>,
}

impl SoftwareKeystore {
    /// Create a keystore advertising attest key support.
    ///
    /// # Errors
    ///
    /// Returns error if the device root cannot be generated.
    pub fn new() -> Result<Self, KeystoreError> {
        Self::with_capabilities(PlatformCapabilities {
            strongbox: false,
            attest_key: true,
        })
    }

    /// Create a keystore advertising `capabilities`.
    ///
    /// # Errors
    ///
    /// Returns error if the device root cannot be generated.
    pub fn with_capabilities(capabilities: PlatformCapabilities) -> Result<Self, KeystoreError> {
        let root = new_ca("Software Keystore Root", None)?;
        let factory = new_ca("Software Keystore Factory Key", Some(&root))?;

        warn!("SoftwareKeystore: NO HARDWARE BINDING, attestations are self-issued");

        Ok(Self {
            capabilities,
            root_der: root.cert.der().to_vec(),
            factory_der: factory.cert.der().to_vec(),
            factory,
            entries: RwLock::new(HashMap::new()),
        })
    }

    /// DER certificate at the end of every chain this keystore issues.
    #[must_use]
    pub fn root_certificate(&self) -> &[u8] {
        &self.root_der
    }

    fn issue(
        &self,
        spec: &KeyGenSpec,
        key: &KeyPair,
        attest_key: Option<&Issuer>,
    ) -> Result<Certificate, KeystoreError> {
        let level = if spec.strongbox {
            SecurityLevel::StrongBox
        } else {
            SecurityLevel::Software
        };
        let description = KeyDescription::new(level, &spec.challenge)?
            .to_der()
            .map_err(|e| KeystoreError::certificate(e.to_string()))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, LEAF_SUBJECT);
        params.distinguished_name = dn;
        params.not_before = to_offset(spec.validity.not_before)?;
        params.not_after = match spec.validity.not_after {
            Some(end) => to_offset(end)?,
            None => rcgen::date_time_ymd(2048, 1, 1),
        };
        params.key_usages = match spec.purpose {
            KeyPurpose::Sign => vec![KeyUsagePurpose::DigitalSignature],
            KeyPurpose::AttestKey => vec![KeyUsagePurpose::KeyCertSign],
        };
        params.custom_extensions.push(CustomExtension::from_oid_content(
            &oid_arcs(&KEY_DESCRIPTION_OID.to_string()),
            description,
        ));

        let issuer = attest_key.unwrap_or(&self.factory);
        params
            .signed_by(key, &issuer.cert, &issuer.key)
            .map_err(|e| KeystoreError::certificate(e.to_string()))
    }

    fn read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, Entry>>, KeystoreError> {
        self.entries
            .read()
            .map_err(|_| KeystoreError::unavailable("keystore lock poisoned"))
    }

    fn write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, Entry>>, KeystoreError> {
        self.entries
            .write()
            .map_err(|_| KeystoreError::unavailable("keystore lock poisoned"))
    }
}

impl KeystoreCapability for SoftwareKeystore {
    fn capabilities(&self) -> PlatformCapabilities {
        self.capabilities
    }

    fn generate_key(&self, spec: &KeyGenSpec) -> Result<KeyPairRecord, KeystoreError> {
        if spec.strongbox && !self.capabilities.strongbox {
            return Err(KeystoreError::unsupported("StrongBox"));
        }
        if (spec.purpose == KeyPurpose::AttestKey || spec.attest_key_alias.is_some())
            && !self.capabilities.attest_key
        {
            return Err(KeystoreError::unsupported("attest key"));
        }

        let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
            .map_err(|e| KeystoreError::key_generation(e.to_string()))?;
        let signing_key = SigningKey::from_pkcs8_der(&key.serialize_der())
            .map_err(|e| KeystoreError::key_generation(e.to_string()))?;
        let public_key = signing_key
            .verifying_key()
            .to_public_key_der()
            .map_err(|e| KeystoreError::key_generation(e.to_string()))?
            .as_bytes()
            .to_vec();

        let mut entries = self.write()?;

        let (cert, chain) = match spec.attest_key_alias.as_deref() {
            Some(attest_alias) => {
                let issuer = match entries.get(attest_alias) {
                    Some(Entry::KeyPair {
                        issuer: Some(issuer),
                        ..
                    }) => issuer,
                    Some(_) => {
                        return Err(KeystoreError::NotAKeyPair {
                            alias: attest_alias.to_string(),
                        })
                    },
                    None => {
                        return Err(KeystoreError::KeyNotFound {
                            alias: attest_alias.to_string(),
                        })
                    },
                };
                let cert = self.issue(spec, &key, Some(issuer))?;
                // Keys attested by an attest key only carry their own leaf.
                let chain = vec![cert.der().to_vec()];
                (cert, chain)
            },
            None => {
                let cert = self.issue(spec, &key, None)?;
                let chain = vec![
                    cert.der().to_vec(),
                    self.factory_der.clone(),
                    self.root_der.clone(),
                ];
                (cert, chain)
            },
        };

        let issuer = (spec.purpose == KeyPurpose::AttestKey).then_some(Issuer { cert, key });
        if entries.contains_key(&spec.alias) {
            debug!(alias = %spec.alias, "Replacing existing keystore entry");
        }
        entries.insert(
            spec.alias.clone(),
            Entry::KeyPair {
                signing_key,
                chain,
                issuer,
            },
        );

        info!(
            alias = %spec.alias,
            purpose = ?spec.purpose,
            attested_by = ?spec.attest_key_alias,
            "SoftwareKeystore: generated EC P-256 key"
        );

        Ok(KeyPairRecord {
            alias: spec.alias.clone(),
            public_key,
            purpose: spec.purpose,
            validity: spec.validity,
            attestation_challenge: spec.challenge.clone(),
            attested_by: spec.attest_key_alias.clone(),
        })
    }

    fn certificate_chain(&self, alias: &str) -> Result<AttestationChain, KeystoreError> {
        match self.read()?.get(alias) {
            Some(Entry::KeyPair { chain, .. }) => Ok(AttestationChain::new(chain.clone())),
            Some(Entry::Certificate(der)) => Ok(AttestationChain::new(vec![der.clone()])),
            None => Err(KeystoreError::KeyNotFound {
                alias: alias.to_string(),
            }),
        }
    }

    fn certificate(&self, alias: &str) -> Result<Vec<u8>, KeystoreError> {
        match self.read()?.get(alias) {
            Some(Entry::KeyPair { chain, .. }) => chain
                .first()
                .cloned()
                .ok_or_else(|| KeystoreError::certificate("empty chain")),
            Some(Entry::Certificate(der)) => Ok(der.clone()),
            None => Err(KeystoreError::KeyNotFound {
                alias: alias.to_string(),
            }),
        }
    }

    fn set_certificate(&self, alias: &str, cert_der: &[u8]) -> Result<(), KeystoreError> {
        if cert_der.is_empty() {
            return Err(KeystoreError::certificate("empty certificate"));
        }
        self.write()?
            .insert(alias.to_string(), Entry::Certificate(cert_der.to_vec()));
        Ok(())
    }

    fn delete_alias(&self, alias: &str) -> Result<(), KeystoreError> {
        self.write()?
            .remove(alias)
            .map(|_| ())
            .ok_or_else(|| KeystoreError::KeyNotFound {
                alias: alias.to_string(),
            })
    }

    fn contains_alias(&self, alias: &str) -> Result<bool, KeystoreError> {
        Ok(self.read()?.contains_key(alias))
    }

    fn sign(&self, alias: &str, data: &[u8]) -> Result<Vec<u8>, KeystoreError> {
        match self.read()?.get(alias) {
            Some(Entry::KeyPair { signing_key, .. }) => {
                let signature: DerSignature = signing_key
                    .try_sign(data)
                    .map_err(|e| KeystoreError::signing(e.to_string()))?;
                Ok(signature.as_bytes().to_vec())
            },
            Some(Entry::Certificate(_)) => Err(KeystoreError::NotAKeyPair {
                alias: alias.to_string(),
            }),
            None => Err(KeystoreError::KeyNotFound {
                alias: alias.to_string(),
            }),
        }
    }
}

fn new_ca(common_name: &str, parent: Option<&Issuer>) -> Result<Issuer, KeystoreError> {
    let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
        .map_err(|e| KeystoreError::key_generation(e.to_string()))?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, "DSR Software Keystore");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::DigitalSignature];

    let cert = match parent {
        Some(parent) => params.signed_by(&key, &parent.cert, &parent.key),
        None => params.self_signed(&key),
    }
    .map_err(|e| KeystoreError::certificate(e.to_string()))?;

    Ok(Issuer { cert, key })
}

fn to_offset(at: DateTime<Utc>) -> Result<OffsetDateTime, KeystoreError> {
    OffsetDateTime::from_unix_timestamp(at.timestamp())
        .map_err(|e| KeystoreError::certificate(e.to_string()))
}

/// Dotted OID to the arc list rcgen expects.
fn oid_arcs(oid: &str) -> Vec<u64> {
    oid.split('.').filter_map(|s| s.parse::<u64>().ok()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ValidityWindow, ATTEST_KEY_ALIAS, MTLS_KEYPAIR_ALIAS};
    use dsr_crypto::{der_signature_to_raw, verify_signature, PublicKeyInfo, SignatureAlgorithm};

    fn spec(alias: &str) -> KeyGenSpec {
        KeyGenSpec::signing(alias, b"challenge".to_vec(), ValidityWindow::days_from(Utc::now(), 365))
    }

    #[test]
    fn test_generate_and_sign() {
        let ks = SoftwareKeystore::new().unwrap();
        let record = ks.generate_key(&spec(MTLS_KEYPAIR_ALIAS)).unwrap();

        let der_sig = ks.sign(MTLS_KEYPAIR_ALIAS, b"tls transcript").unwrap();
        let raw = der_signature_to_raw(&der_sig).unwrap();
        let point = PublicKeyInfo::from_spki_der(&record.public_key).unwrap().point;
        assert!(verify_signature(SignatureAlgorithm::Es256, &point, b"tls transcript", &raw).unwrap());
    }

    #[test]
    fn test_factory_chain_shape() {
        let ks = SoftwareKeystore::new().unwrap();
        ks.generate_key(&spec("k")).unwrap();

        let chain = ks.certificate_chain("k").unwrap();
        assert_eq!(chain.len(), 3);
        assert_eq!(chain.certificates()[2], ks.root_certificate());

        let desc = KeyDescription::from_certificate(chain.leaf().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(desc.challenge(), b"challenge");
        assert_eq!(desc.security_level(), Some(SecurityLevel::Software));
    }

    #[test]
    fn test_leaf_key_matches_record() {
        let ks = SoftwareKeystore::new().unwrap();
        let record = ks.generate_key(&spec("k")).unwrap();
        let leaf = ks.certificate("k").unwrap();
        assert_eq!(dsr_crypto::certificate_spki(&leaf).unwrap(), record.public_key);
    }

    #[test]
    fn test_attest_key_signs_single_leaf() {
        let ks = SoftwareKeystore::new().unwrap();
        let window = ValidityWindow::starting_at(Utc::now());
        ks.generate_key(&KeyGenSpec::attest_key(ATTEST_KEY_ALIAS, b"a".to_vec(), window))
            .unwrap();
        ks.generate_key(&spec("k").attested_by(ATTEST_KEY_ALIAS)).unwrap();

        assert_eq!(ks.certificate_chain("k").unwrap().len(), 1);
    }

    #[test]
    fn test_attested_by_missing_alias() {
        let ks = SoftwareKeystore::new().unwrap();
        let err = ks.generate_key(&spec("k").attested_by(ATTEST_KEY_ALIAS)).unwrap_err();
        assert!(matches!(err, KeystoreError::KeyNotFound { .. }));
    }

    #[test]
    fn test_signing_key_cannot_attest() {
        let ks = SoftwareKeystore::new().unwrap();
        ks.generate_key(&spec("plain")).unwrap();
        let err = ks.generate_key(&spec("k").attested_by("plain")).unwrap_err();
        assert!(matches!(err, KeystoreError::NotAKeyPair { .. }));
    }

    #[test]
    fn test_certificate_entries() {
        let ks = SoftwareKeystore::new().unwrap();
        ks.set_certificate("cert", b"\x30\x00").unwrap();
        assert_eq!(ks.certificate("cert").unwrap(), b"\x30\x00");
        assert!(matches!(
            ks.sign("cert", b"x"),
            Err(KeystoreError::NotAKeyPair { .. })
        ));
        assert!(ks.set_certificate("cert", b"").is_err());
    }

    #[test]
    fn test_delete_missing_alias() {
        let ks = SoftwareKeystore::new().unwrap();
        assert!(matches!(
            ks.delete_alias("nope"),
            Err(KeystoreError::KeyNotFound { .. })
        ));
        assert!(!ks.contains_alias("nope").unwrap());
    }

    #[test]
    fn test_strongbox_requires_capability() {
        let ks = SoftwareKeystore::new().unwrap();
        let err = ks.generate_key(&spec("k").strongbox(true)).unwrap_err();
        assert!(err.is_capability_unsupported());

        let ks = SoftwareKeystore::with_capabilities(PlatformCapabilities {
            strongbox: true,
            attest_key: false,
        })
        .unwrap();
        ks.generate_key(&spec("k").strongbox(true)).unwrap();
        let desc = KeyDescription::from_certificate(&ks.certificate("k").unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(desc.security_level(), Some(SecurityLevel::StrongBox));
    }
}
