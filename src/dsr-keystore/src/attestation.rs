//! Key attestation provider.
//!
//! Wraps a [`KeystoreCapability`] with the alias bookkeeping of the device
//! binding protocol: which key attests which, and which stale entries must
//! go before a new attestation is produced.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dsr_crypto::DerivedNonce;
use tracing::{debug, info, instrument, warn};

use crate::capability::{KeyGenSpec, KeystoreCapability};
use crate::error::KeystoreError;
use crate::types::{
    AttestationChain, KeyPairRecord, ValidityWindow, ATTESTATION_KEYPAIR_ALIAS, ATTEST_KEY_ALIAS,
    DEFAULT_KEY_VALIDITY_DAYS, MANAGED_ALIASES, MTLS_CERT_ALIAS, MTLS_KEYPAIR_ALIAS,
};

/// Generates attested keys and assembles attestation chains.
#[derive(Clone)]
pub struct KeyAttestationProvider {
    keystore: Arc<dyn KeystoreCapability>,
    validity_days: i64,
}

impl KeyAttestationProvider {
    /// Create a provider over `keystore`.
    pub fn new(keystore: Arc<dyn KeystoreCapability>) -> Self {
        Self {
            keystore,
            validity_days: DEFAULT_KEY_VALIDITY_DAYS,
        }
    }

    /// Override the lifetime of generated signing keys.
    #[must_use]
    pub fn with_validity_days(mut self, days: i64) -> Self {
        self.validity_days = days;
        self
    }

    /// The underlying keystore.
    pub fn keystore(&self) -> &Arc<dyn KeystoreCapability> {
        &self.keystore
    }

    /// Validity window for a signing key created at `now`.
    pub fn validity_from(&self, now: DateTime<Utc>) -> ValidityWindow {
        ValidityWindow::days_from(now, self.validity_days)
    }

    /// Generate an attested signing key.
    ///
    /// With `use_attest_key`, the attestation is signed by the key under
    /// [`ATTEST_KEY_ALIAS`], which must already exist.
    ///
    /// # Errors
    ///
    /// [`KeystoreError::CapabilityUnsupported`] if StrongBox or attest keys
    /// are requested but unavailable.
    #[instrument(skip(self, nonce, validity))]
    pub fn generate_key_pair(
        &self,
        nonce: &DerivedNonce,
        validity: ValidityWindow,
        alias: &str,
        use_strongbox: bool,
        use_attest_key: bool,
    ) -> Result<KeyPairRecord, KeystoreError> {
        let caps = self.keystore.capabilities();
        if use_strongbox && !caps.strongbox {
            return Err(KeystoreError::unsupported("StrongBox"));
        }
        if use_attest_key && !caps.attest_key {
            return Err(KeystoreError::unsupported("attest key"));
        }

        let mut spec = KeyGenSpec::signing(alias, nonce.to_vec(), validity).strongbox(use_strongbox);
        if use_attest_key {
            spec = spec.attested_by(ATTEST_KEY_ALIAS);
        }

        let record = self.keystore.generate_key(&spec)?;
        info!(alias = %alias, attested_by = ?record.attested_by, "Generated attested key pair");
        Ok(record)
    }

    /// Generate the long-lived attest key under `alias`.
    ///
    /// # Errors
    ///
    /// [`KeystoreError::CapabilityUnsupported`] if the platform has no
    /// attest key support.
    #[instrument(skip(self, nonce))]
    pub fn generate_attest_key(
        &self,
        nonce: &DerivedNonce,
        alias: &str,
        now: DateTime<Utc>,
    ) -> Result<KeyPairRecord, KeystoreError> {
        if !self.keystore.capabilities().attest_key {
            return Err(KeystoreError::unsupported("attest key"));
        }
        let spec = KeyGenSpec::attest_key(alias, nonce.to_vec(), ValidityWindow::starting_at(now));
        let record = self.keystore.generate_key(&spec)?;
        info!(alias = %alias, "Generated attest key");
        Ok(record)
    }

    /// Fresh attestation of a one-shot key bound to `nonce`.
    ///
    /// On a registered device a stale [`ATTESTATION_KEYPAIR_ALIAS`] entry is
    /// deleted first, and the shared attest key signs the new attestation
    /// (provisioned on demand when the platform supports it). The returned
    /// chain is the new leaf followed by the attest key's chain, or the
    /// leaf's own chain when no attest key is involved.
    #[instrument(skip(self, nonce))]
    pub fn get_attestation_chain(
        &self,
        nonce: &DerivedNonce,
        now: DateTime<Utc>,
    ) -> Result<AttestationChain, KeystoreError> {
        let mut use_attest_key = false;

        if self.keystore.contains_alias(MTLS_KEYPAIR_ALIAS)? {
            if self.keystore.contains_alias(ATTESTATION_KEYPAIR_ALIAS)? {
                debug!("Deleting stale attestation key pair");
                self.keystore.delete_alias(ATTESTATION_KEYPAIR_ALIAS)?;
            }

            if self.keystore.contains_alias(ATTEST_KEY_ALIAS)? {
                use_attest_key = true;
            } else if self.keystore.capabilities().attest_key {
                self.generate_attest_key(nonce, ATTEST_KEY_ALIAS, now)?;
                use_attest_key = true;
            }
        }

        self.generate_key_pair(
            nonce,
            self.validity_from(now),
            ATTESTATION_KEYPAIR_ALIAS,
            false,
            use_attest_key,
        )?;

        let chain = if use_attest_key {
            let leaf = self.keystore.certificate(ATTESTATION_KEYPAIR_ALIAS)?;
            self.keystore.certificate_chain(ATTEST_KEY_ALIAS)?.prepend(leaf)
        } else {
            self.keystore.certificate_chain(ATTESTATION_KEYPAIR_ALIAS)?
        };

        info!(chain_len = chain.len(), use_attest_key, "Attestation chain ready");
        Ok(chain)
    }

    /// Remove every managed alias. Absent aliases are skipped.
    #[instrument(skip(self))]
    pub fn delete_all_keys(&self) -> Result<(), KeystoreError> {
        for alias in MANAGED_ALIASES {
            if self.keystore.contains_alias(alias)? {
                self.keystore.delete_alias(alias)?;
                debug!(alias = %alias, "Deleted keystore entry");
            }
        }
        warn!("All device binding keys deleted");
        Ok(())
    }

    /// Whether a GMS client certificate is stored.
    pub fn is_registered(&self) -> Result<bool, KeystoreError> {
        self.keystore.contains_alias(MTLS_CERT_ALIAS)
    }

    /// Store the GMS-issued client certificate.
    pub fn store_client_certificate(&self, cert_der: &[u8]) -> Result<(), KeystoreError> {
        self.keystore.set_certificate(MTLS_CERT_ALIAS, cert_der)?;
        info!(cert_len = cert_der.len(), "Stored client certificate");
        Ok(())
    }

    /// Drop the stored client certificate, if any. Returns whether one was
    /// present.
    ///
    /// Must run before the mTLS key pair is replaced: a certificate for the
    /// old key would otherwise outlive it.
    pub fn forget_client_certificate(&self) -> Result<bool, KeystoreError> {
        if !self.keystore.contains_alias(MTLS_CERT_ALIAS)? {
            return Ok(false);
        }
        self.keystore.delete_alias(MTLS_CERT_ALIAS)?;
        warn!("Forgot client certificate");
        Ok(true)
    }
}

impl std::fmt::Debug for KeyAttestationProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyAttestationProvider")
            .field("capabilities", &self.keystore.capabilities())
            .field("validity_days", &self.validity_days)
            .finish()
    }
}
