//! Configuration for the device binding engine.

use std::time::Duration;

use dsr_keystore::DEFAULT_KEY_VALIDITY_DAYS;

/// Per-request network timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// TCP + TLS connect timeout.
    pub connect: Duration,
    /// Read timeout between body chunks.
    pub read: Duration,
    /// Time allowed to send the request. reqwest has no separate write
    /// timeout, so this widens the whole-request bound of [`Self::total`].
    pub write: Duration,
}

impl TimeoutConfig {
    /// Upper bound for a whole request: connect, then write, then read.
    #[must_use]
    pub fn total(&self) -> Duration {
        self.connect + self.read + self.write
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: Duration::from_millis(10_000),
            read: Duration::from_millis(10_000),
            write: Duration::from_millis(10_000),
        }
    }
}

/// Waiting for the server to hand out a device token.
///
/// Polling awaits an asynchronous server decision; it is not a retry of a
/// failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingPolicy {
    /// Delay before every poll.
    pub interval: Duration,
    /// Give up once this much time has passed since the first poll.
    pub deadline: Duration,
}

impl Default for PollingPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(2_000),
            deadline: Duration::from_millis(60_000),
        }
    }
}

/// Transport-level retry of transient failures (connect errors, timeouts,
/// 429 and 5xx responses).
///
/// Disabled by default: protocol steps are not retried automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Additional attempts after the first one.
    pub max_retries: usize,
    /// First backoff delay.
    pub min_delay: Duration,
    /// Backoff cap.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// No retries.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Whether any retry will be attempted.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.max_retries > 0
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            min_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
        }
    }
}

/// Configuration for the device binding client.
#[derive(Debug, Clone)]
pub struct DeviceBindingConfig {
    /// GMS base URL for server-authenticated TLS.
    pub gms_url: String,
    /// GMS base URL for mutual TLS.
    pub gms_mtls_url: String,
    /// FD (prescription service) base URL, mutual TLS.
    pub fd_url: String,
    /// Static value of the `X-Authorization` header.
    pub authorization: String,
    /// PEM trust anchors pinned for mutual TLS, in addition to the bundled
    /// web PKI roots. `None` uses the embedded GMS chain.
    pub pinned_chain_pem: Option<String>,
    /// Per-request timeouts.
    pub timeouts: TimeoutConfig,
    /// Device token polling.
    pub polling: PollingPolicy,
    /// Transport retry.
    pub retry: RetryPolicy,
    /// `iss` claim of device tokens.
    pub client_version: String,
    /// `packageName` claim of device tokens.
    pub package_name: String,
    /// `type` claim of device tokens.
    pub device_type: String,
    /// Cloud project number sent with integrity requests.
    pub cloud_project_number: u64,
    /// Lifetime of generated signing keys in days.
    pub key_validity_days: i64,
    /// Default user for device list queries.
    pub user_identifier: String,
}

impl Default for DeviceBindingConfig {
    fn default() -> Self {
        Self {
            gms_url: "https://dsr.gms.dev.gematik.solutions".into(),
            gms_mtls_url: "https://dsr.gms-mtls.dev.gematik.solutions".into(),
            fd_url: "https://dsr.fd.dev.gematik.solutions".into(),
            authorization: "FsMxoUGiJZowZ99lg7AfFYZl9/oEZ8jpMvCuMDhbAKE=".into(),
            pinned_chain_pem: None,
            timeouts: TimeoutConfig::default(),
            polling: PollingPolicy::default(),
            retry: RetryPolicy::default(),
            client_version: "TrustSDK_0.0.1".into(),
            package_name: "de.gematik.dsr.android".into(),
            device_type: "android".into(),
            cloud_project_number: 0,
            key_validity_days: DEFAULT_KEY_VALIDITY_DAYS,
            user_identifier: "X764228532".into(),
        }
    }
}

impl DeviceBindingConfig {
    /// Point all three services at one base URL (test servers).
    #[must_use]
    pub fn with_base_url(mut self, url: &str) -> Self {
        let url = url.trim_end_matches('/').to_string();
        self.gms_url.clone_from(&url);
        self.gms_mtls_url.clone_from(&url);
        self.fd_url = url;
        self
    }
}
