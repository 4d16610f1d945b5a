//! Device registration and attestation tokens.
//!
//! Tokens are compact JWS: `header.payload.signature`, each part unpadded
//! base64url. The header carries `alg` and the signer certificate in `x5c`;
//! the signature is raw `r || s`.
//!
//! Claim values that carry binary data (nonce, CSR, certificates, key hashes)
//! use standard base64 with padding.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Utc};
use dsr_crypto::{certificate_public_key, public_key_fingerprint, verify_signature, RootNonce, SignatureAlgorithm};
use dsr_keystore::AttestationChain;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::config::DeviceBindingConfig;
use crate::credential::CredentialSigner;
use crate::csr::Csr;
use crate::device_attributes::DeviceAttributes;
use crate::error::DeviceBindingError;
use crate::integrity::IntegrityVerdict;

/// Decode unpadded base64url.
pub fn base64url_decode(input: &str) -> Result<Vec<u8>, DeviceBindingError> {
    URL_SAFE_NO_PAD
        .decode(input)
        .map_err(|e| DeviceBindingError::malformed(format!("base64url: {e}")))
}

/// Encode to unpadded base64url.
pub fn base64url_encode(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

/// `base64(SHA-256(subjectPublicKey))` of a DER SubjectPublicKeyInfo.
pub fn public_key_hash(spki_der: &[u8]) -> Result<String, DeviceBindingError> {
    let digest = public_key_fingerprint(spki_der)
        .map_err(|e| DeviceBindingError::signing(format!("public key: {e}")))?;
    Ok(STANDARD.encode(digest))
}

/// JWS header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwsHeader {
    /// Algorithm identifier.
    pub alg: String,
    /// Signer certificate chain, standard base64 DER.
    pub x5c: Vec<String>,
}

/// Claims of the device registration token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationClaims {
    /// Client version.
    pub iss: String,
    /// Hash of the mTLS public key.
    pub sub: String,
    /// Issued at, seconds.
    pub iat: i64,
    /// Device type.
    #[serde(rename = "type")]
    pub device_type: String,
    /// Root nonce.
    pub nonce: String,
    /// DER CSR.
    pub csr: String,
    /// Attestation certificate of the mTLS key.
    pub subject_cert: String,
    /// Integrity token.
    pub integrity_verdict: String,
    /// App package.
    pub package_name: String,
    /// Certificate chain of the attest key.
    pub attest_cert_chain: Vec<String>,
    /// Hash of the attest key's public key.
    pub attest_public_key: String,
}

/// Claims of the device attestation token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestationClaims {
    /// Client version.
    pub iss: String,
    /// Hash of the mTLS certificate's public key.
    pub sub: String,
    /// Issued at, seconds.
    pub iat: i64,
    /// Device type.
    #[serde(rename = "type")]
    pub device_type: String,
    /// Root nonce.
    pub nonce: String,
    /// Fresh attestation chain.
    pub attestation_cert_chain: Vec<String>,
    /// Integrity token.
    pub integrity_verdict: String,
    /// App package.
    pub package_name: String,
    /// Security posture snapshot.
    pub device_attributes: DeviceAttributes,
}

/// Inputs of the registration token.
#[derive(Debug, Clone, Copy)]
pub struct RegistrationInput<'a> {
    /// Root nonce of the run.
    pub root_nonce: &'a RootNonce,
    /// SPKI of the mTLS key.
    pub mtls_public_key: &'a [u8],
    /// Attestation certificate of the mTLS key.
    pub mtls_certificate: &'a [u8],
    /// CSR for the mTLS key.
    pub csr: &'a Csr,
    /// Integrity verdict.
    pub integrity_verdict: &'a IntegrityVerdict,
    /// Chain of the attest key.
    pub attest_chain: &'a AttestationChain,
    /// SPKI of the attest key.
    pub attest_public_key: &'a [u8],
}

/// Inputs of the attestation token.
#[derive(Debug, Clone, Copy)]
pub struct AttestationInput<'a> {
    /// Root nonce of the run.
    pub root_nonce: &'a RootNonce,
    /// GMS-issued mTLS certificate.
    pub mtls_certificate: &'a [u8],
    /// Fresh attestation chain.
    pub attestation_chain: &'a AttestationChain,
    /// Integrity verdict.
    pub integrity_verdict: &'a IntegrityVerdict,
    /// Device attributes.
    pub device_attributes: &'a DeviceAttributes,
}

fn require(present: bool, artifact: &'static str) -> Result<(), DeviceBindingError> {
    if present {
        Ok(())
    } else {
        Err(DeviceBindingError::MissingArtifact { artifact })
    }
}

fn encode_chain(chain: &AttestationChain) -> Vec<String> {
    chain.certificates().iter().map(|cert| STANDARD.encode(cert)).collect()
}

/// Builds and signs device tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JwtAssembler {
    issuer: String,
    package_name: String,
    device_type: String,
}

impl JwtAssembler {
    /// Assembler with explicit static claims.
    pub fn new(issuer: impl Into<String>, package_name: impl Into<String>, device_type: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            package_name: package_name.into(),
            device_type: device_type.into(),
        }
    }

    /// Assembler using the configured client version, package and type.
    pub fn from_config(config: &DeviceBindingConfig) -> Self {
        Self::new(&config.client_version, &config.package_name, &config.device_type)
    }

    /// Registration claims. Fails closed on any missing artifact.
    pub fn registration_claims(
        &self,
        input: &RegistrationInput<'_>,
        issued_at: DateTime<Utc>,
    ) -> Result<RegistrationClaims, DeviceBindingError> {
        require(!input.root_nonce.is_empty(), "nonce")?;
        require(!input.mtls_public_key.is_empty(), "mtlsPublicKey")?;
        require(!input.mtls_certificate.is_empty(), "subjectCert")?;
        require(!input.integrity_verdict.is_blank(), "integrityVerdict")?;
        require(!input.attest_chain.is_empty(), "attestCertChain")?;
        require(!input.attest_public_key.is_empty(), "attestPublicKey")?;

        Ok(RegistrationClaims {
            iss: self.issuer.clone(),
            sub: public_key_hash(input.mtls_public_key)?,
            iat: issued_at.timestamp(),
            device_type: self.device_type.clone(),
            nonce: STANDARD.encode(input.root_nonce.as_bytes()),
            csr: input.csr.to_base64(),
            subject_cert: STANDARD.encode(input.mtls_certificate),
            integrity_verdict: input.integrity_verdict.as_str().to_string(),
            package_name: self.package_name.clone(),
            attest_cert_chain: encode_chain(input.attest_chain),
            attest_public_key: public_key_hash(input.attest_public_key)?,
        })
    }

    /// Attestation claims. Fails closed on any missing artifact.
    pub fn attestation_claims(
        &self,
        input: &AttestationInput<'_>,
        issued_at: DateTime<Utc>,
    ) -> Result<AttestationClaims, DeviceBindingError> {
        require(!input.root_nonce.is_empty(), "nonce")?;
        require(!input.mtls_certificate.is_empty(), "mtlsCertificate")?;
        require(!input.attestation_chain.is_empty(), "attestationCertChain")?;
        require(!input.integrity_verdict.is_blank(), "integrityVerdict")?;

        let spki = dsr_crypto::certificate_spki(input.mtls_certificate)
            .map_err(|e| DeviceBindingError::keystore(format!("mTLS certificate: {e}")))?;

        Ok(AttestationClaims {
            iss: self.issuer.clone(),
            sub: public_key_hash(&spki)?,
            iat: issued_at.timestamp(),
            device_type: self.device_type.clone(),
            nonce: STANDARD.encode(input.root_nonce.as_bytes()),
            attestation_cert_chain: encode_chain(input.attestation_chain),
            integrity_verdict: input.integrity_verdict.as_str().to_string(),
            package_name: self.package_name.clone(),
            device_attributes: input.device_attributes.clone(),
        })
    }

    /// Sign `claims` with `signer`.
    #[instrument(skip_all, fields(alg = %signer.algorithm()))]
    pub fn sign<C: Serialize>(&self, claims: &C, signer: &dyn CredentialSigner) -> Result<SignedJwt, DeviceBindingError> {
        let algorithm = signer.algorithm();
        let header = JwsHeader {
            alg: algorithm.jws_name().to_string(),
            x5c: vec![STANDARD.encode(signer.certificate()?)],
        };

        let header_json =
            serde_json::to_vec(&header).map_err(|e| DeviceBindingError::signing(format!("header: {e}")))?;
        let payload_json =
            serde_json::to_vec(claims).map_err(|e| DeviceBindingError::signing(format!("claims: {e}")))?;
        let signing_input = format!("{}.{}", base64url_encode(&header_json), base64url_encode(&payload_json));

        let signature = signer.sign(signing_input.as_bytes())?;
        if signature.len() != algorithm.raw_signature_len() {
            return Err(DeviceBindingError::signing(format!(
                "{} signature has {} bytes",
                algorithm,
                signature.len()
            )));
        }

        let token = format!("{}.{}", signing_input, base64url_encode(&signature));
        debug!(token_len = token.len(), "Signed token");
        Ok(SignedJwt(token))
    }

    /// Registration token, signed by the health card credential.
    pub fn registration_token(
        &self,
        input: &RegistrationInput<'_>,
        issued_at: DateTime<Utc>,
        signer: &dyn CredentialSigner,
    ) -> Result<SignedJwt, DeviceBindingError> {
        let claims = self.registration_claims(input, issued_at)?;
        self.sign(&claims, signer)
    }

    /// Attestation token, signed by the device mTLS key.
    pub fn attestation_token(
        &self,
        input: &AttestationInput<'_>,
        issued_at: DateTime<Utc>,
        signer: &dyn CredentialSigner,
    ) -> Result<SignedJwt, DeviceBindingError> {
        let claims = self.attestation_claims(input, issued_at)?;
        self.sign(&claims, signer)
    }
}

/// Compact serialized token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedJwt(String);

impl SignedJwt {
    /// Wrap a compact token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Compact form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split and decode the three parts.
    pub fn parse(&self) -> Result<ParsedJws, DeviceBindingError> {
        let parts: Vec<&str> = self.0.split('.').collect();
        if parts.len() != 3 {
            return Err(DeviceBindingError::malformed(format!(
                "Expected 3 parts for JWS, got {}",
                parts.len()
            )));
        }

        let header: JwsHeader = serde_json::from_slice(&base64url_decode(parts[0])?)
            .map_err(|e| DeviceBindingError::malformed(format!("header: {e}")))?;
        let payload: serde_json::Value = serde_json::from_slice(&base64url_decode(parts[1])?)
            .map_err(|e| DeviceBindingError::malformed(format!("payload: {e}")))?;
        let signature = base64url_decode(parts[2])?;

        Ok(ParsedJws {
            header,
            payload,
            signature,
            signing_input: format!("{}.{}", parts[0], parts[1]),
        })
    }
}

impl std::fmt::Display for SignedJwt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Decoded token.
#[derive(Debug, Clone)]
pub struct ParsedJws {
    /// Header.
    pub header: JwsHeader,
    /// Claims as JSON.
    pub payload: serde_json::Value,
    /// Raw signature.
    pub signature: Vec<u8>,
    signing_input: String,
}

impl ParsedJws {
    /// `header.payload` as signed.
    pub fn signing_input(&self) -> &str {
        &self.signing_input
    }

    /// Verify the signature with the first `x5c` certificate.
    pub fn verify_with_x5c(&self) -> Result<bool, DeviceBindingError> {
        let algorithm = SignatureAlgorithm::from_jws_name(&self.header.alg)
            .ok_or_else(|| DeviceBindingError::malformed(format!("unknown alg {}", self.header.alg)))?;
        let leaf = self
            .header
            .x5c
            .first()
            .ok_or_else(|| DeviceBindingError::malformed("empty x5c"))?;
        let cert = STANDARD
            .decode(leaf)
            .map_err(|e| DeviceBindingError::malformed(format!("x5c: {e}")))?;
        let public_key =
            certificate_public_key(&cert).map_err(|e| DeviceBindingError::malformed(format!("x5c: {e}")))?;

        Ok(verify_signature(algorithm, &public_key.point, self.signing_input.as_bytes(), &self.signature).unwrap_or(false))
    }
}
