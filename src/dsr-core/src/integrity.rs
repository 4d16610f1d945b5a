//! Device integrity verdicts.
//!
//! The vendor integrity service is reached through [`IntegrityAttestor`].
//! Two request shapes exist:
//!
//! - legacy: one call, the nonce is sent as unpadded base64url
//! - standard: a prepared [`StandardTokenProvider`] is asked for a token with
//!   a request hash (padded URL-safe base64 of the nonce)
//!
//! [`IntegrityVerdictClient`] keeps the prepared provider for the session and
//! drops it after a failed request. Failures are never retried here.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use dsr_crypto::DerivedNonce;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::error::DeviceBindingError;

/// Signed integrity token bound to a nonce.
#[derive(Clone, PartialEq, Eq)]
pub struct IntegrityVerdict(String);

impl IntegrityVerdict {
    /// Wrap a raw token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Token text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the token is empty or whitespace.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for IntegrityVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IntegrityVerdict({} bytes)", self.0.len())
    }
}

/// Prepared provider of standard integrity tokens.
#[async_trait]
pub trait StandardTokenProvider: Send + Sync {
    /// Request a token bound to `request_hash`.
    async fn request(&self, request_hash: &str) -> Result<String, DeviceBindingError>;
}

/// Platform integrity service.
#[async_trait]
pub trait IntegrityAttestor: Send + Sync {
    /// Legacy request with the nonce as unpadded base64url.
    async fn request_integrity_token(
        &self,
        nonce: &str,
        cloud_project_number: u64,
    ) -> Result<String, DeviceBindingError>;

    /// Prepare a provider for standard requests.
    async fn prepare_standard_provider(
        &self,
        cloud_project_number: u64,
    ) -> Result<Arc<dyn StandardTokenProvider>, DeviceBindingError>;
}

fn as_integrity_error(err: DeviceBindingError) -> DeviceBindingError {
    match err {
        err @ DeviceBindingError::IntegrityServiceError { .. } => err,
        other => DeviceBindingError::integrity(other.to_string()),
    }
}

fn verdict_from(token: String) -> Result<IntegrityVerdict, DeviceBindingError> {
    let verdict = IntegrityVerdict::new(token);
    if verdict.is_blank() {
        return Err(DeviceBindingError::integrity("empty integrity token"));
    }
    Ok(verdict)
}

/// Requests integrity verdicts for derived nonces.
pub struct IntegrityVerdictClient {
    attestor: Arc<dyn IntegrityAttestor>,
    cloud_project_number: u64,
    provider: Mutex<Option<Arc<dyn StandardTokenProvider>>>,
}

impl IntegrityVerdictClient {
    /// Client for `attestor`.
    pub fn new(attestor: Arc<dyn IntegrityAttestor>, cloud_project_number: u64) -> Self {
        Self {
            attestor,
            cloud_project_number,
            provider: Mutex::new(None),
        }
    }

    /// Legacy verdict for `nonce`.
    #[instrument(skip_all)]
    pub async fn request_verdict(&self, nonce: &DerivedNonce) -> Result<IntegrityVerdict, DeviceBindingError> {
        let encoded = URL_SAFE_NO_PAD.encode(nonce.as_bytes());
        let token = self
            .attestor
            .request_integrity_token(&encoded, self.cloud_project_number)
            .await
            .map_err(|e| {
                warn!(error = %e, "Integrity token request failed");
                as_integrity_error(e)
            })?;
        let verdict = verdict_from(token)?;
        info!(token_len = verdict.as_str().len(), "Integrity verdict obtained");
        Ok(verdict)
    }

    /// The prepared standard provider, preparing it on first use.
    pub async fn prepare_provider(&self) -> Result<Arc<dyn StandardTokenProvider>, DeviceBindingError> {
        let mut slot = self.provider.lock().await;
        if let Some(provider) = slot.as_ref() {
            return Ok(Arc::clone(provider));
        }
        let provider = self
            .attestor
            .prepare_standard_provider(self.cloud_project_number)
            .await
            .map_err(as_integrity_error)?;
        debug!("Prepared standard integrity provider");
        *slot = Some(Arc::clone(&provider));
        Ok(provider)
    }

    /// Standard verdict for `nonce`.
    #[instrument(skip_all)]
    pub async fn request_standard_verdict(
        &self,
        nonce: &DerivedNonce,
    ) -> Result<IntegrityVerdict, DeviceBindingError> {
        let provider = self.prepare_provider().await?;
        let request_hash = URL_SAFE.encode(nonce.as_bytes());

        let token = match provider.request(&request_hash).await {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "Standard integrity request failed, dropping provider");
                self.provider.lock().await.take();
                return Err(as_integrity_error(e));
            },
        };
        let verdict = verdict_from(token)?;
        info!(token_len = verdict.as_str().len(), "Standard integrity verdict obtained");
        Ok(verdict)
    }
}

impl fmt::Debug for IntegrityVerdictClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntegrityVerdictClient")
            .field("cloud_project_number", &self.cloud_project_number)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Fixed attestor
// =============================================================================

/// Attestor issuing `"{prefix}.{nonce}"` tokens without a vendor service.
///
/// For desktop runs against test servers that do not check verdicts.
#[derive(Debug)]
pub struct FixedIntegrityAttestor {
    prefix: String,
    prepared: AtomicUsize,
}

impl FixedIntegrityAttestor {
    /// Attestor with the given token prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            prepared: AtomicUsize::new(0),
        }
    }

    /// Number of providers prepared so far.
    pub fn prepared_count(&self) -> usize {
        self.prepared.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct FixedTokenProvider {
    prefix: String,
}

#[async_trait]
impl StandardTokenProvider for FixedTokenProvider {
    async fn request(&self, request_hash: &str) -> Result<String, DeviceBindingError> {
        Ok(format!("{}.{}", self.prefix, request_hash))
    }
}

#[async_trait]
impl IntegrityAttestor for FixedIntegrityAttestor {
    async fn request_integrity_token(
        &self,
        nonce: &str,
        _cloud_project_number: u64,
    ) -> Result<String, DeviceBindingError> {
        Ok(format!("{}.{}", self.prefix, nonce))
    }

    async fn prepare_standard_provider(
        &self,
        _cloud_project_number: u64,
    ) -> Result<Arc<dyn StandardTokenProvider>, DeviceBindingError> {
        self.prepared.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FixedTokenProvider {
            prefix: self.prefix.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsr_crypto::{NonceTag, RootNonce};

    fn nonce() -> DerivedNonce {
        RootNonce::new(vec![0xfb; 32]).derive(NonceTag::Integrity)
    }

    #[tokio::test]
    async fn test_legacy_nonce_is_unpadded_base64url() {
        let client = IntegrityVerdictClient::new(Arc::new(FixedIntegrityAttestor::new("tok")), 42);
        let verdict = client.request_verdict(&nonce()).await.unwrap();
        let expected = URL_SAFE_NO_PAD.encode(nonce().as_bytes());
        assert_eq!(verdict.as_str(), format!("tok.{expected}"));
        assert!(!verdict.as_str().ends_with('='));
    }

    #[tokio::test]
    async fn test_standard_request_hash_and_provider_cache() {
        let attestor = Arc::new(FixedIntegrityAttestor::new("std"));
        let client = IntegrityVerdictClient::new(attestor.clone(), 42);

        let first = client.request_standard_verdict(&nonce()).await.unwrap();
        client.request_standard_verdict(&nonce()).await.unwrap();

        assert_eq!(first.as_str(), format!("std.{}", URL_SAFE.encode(nonce().as_bytes())));
        assert_eq!(attestor.prepared_count(), 1);
    }

    struct FlakyProvider;

    #[async_trait]
    impl StandardTokenProvider for FlakyProvider {
        async fn request(&self, _request_hash: &str) -> Result<String, DeviceBindingError> {
            Err(DeviceBindingError::transport("binder died"))
        }
    }

    struct FlakyAttestor {
        prepared: AtomicUsize,
    }

    #[async_trait]
    impl IntegrityAttestor for FlakyAttestor {
        async fn request_integrity_token(&self, _nonce: &str, _n: u64) -> Result<String, DeviceBindingError> {
            Ok("   ".into())
        }

        async fn prepare_standard_provider(
            &self,
            _n: u64,
        ) -> Result<Arc<dyn StandardTokenProvider>, DeviceBindingError> {
            self.prepared.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FlakyProvider))
        }
    }

    #[tokio::test]
    async fn test_failed_request_drops_provider() {
        let attestor = Arc::new(FlakyAttestor {
            prepared: AtomicUsize::new(0),
        });
        let client = IntegrityVerdictClient::new(attestor.clone(), 0);

        let err = client.request_standard_verdict(&nonce()).await.unwrap_err();
        assert!(matches!(err, DeviceBindingError::IntegrityServiceError { .. }));
        client.request_standard_verdict(&nonce()).await.unwrap_err();
        assert_eq!(attestor.prepared.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_blank_token_is_an_error() {
        let client = IntegrityVerdictClient::new(
            Arc::new(FlakyAttestor {
                prepared: AtomicUsize::new(0),
            }),
            0,
        );
        let err = client.request_verdict(&nonce()).await.unwrap_err();
        assert!(matches!(err, DeviceBindingError::IntegrityServiceError { .. }));
    }

    #[test]
    fn test_verdict_debug_hides_token() {
        let verdict = IntegrityVerdict::new("secret-token");
        assert_eq!(format!("{verdict:?}"), "IntegrityVerdict(12 bytes)");
    }
}
