//! Device token polling.
//!
//! After device attestation the server decides asynchronously. The token
//! endpoint is polled with a fixed delay before every attempt until a token
//! arrives or the deadline passes. Any error from an attempt ends polling
//! immediately.

use std::future::Future;

use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument, warn};

use crate::config::PollingPolicy;
use crate::error::DeviceBindingError;
use crate::gms::{DeviceToken, DeviceTokenPoll};

/// Polls until a device token is issued.
#[derive(Debug, Clone, Copy)]
pub struct TokenPoller {
    policy: PollingPolicy,
}

impl TokenPoller {
    /// Poller following `policy`.
    pub fn new(policy: PollingPolicy) -> Self {
        Self { policy }
    }

    /// The active policy.
    pub fn policy(&self) -> PollingPolicy {
        self.policy
    }

    /// Run `attempt` until it yields a token.
    ///
    /// The clock starts before the first delay. After every pending answer
    /// the elapsed time is compared with the deadline.
    ///
    /// # Errors
    ///
    /// [`DeviceBindingError::TokenNotReady`] once the deadline has passed
    /// without a token, or the first error returned by `attempt`.
    #[instrument(skip_all, fields(interval_ms = self.policy.interval.as_millis() as u64))]
    pub async fn poll<F, Fut>(&self, mut attempt: F) -> Result<DeviceToken, DeviceBindingError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<DeviceTokenPoll, DeviceBindingError>>,
    {
        let started = Instant::now();
        let mut attempts: u32 = 0;

        loop {
            sleep(self.policy.interval).await;
            attempts += 1;

            match attempt().await? {
                DeviceTokenPoll::Ready(token) => {
                    info!(attempts, elapsed_ms = started.elapsed().as_millis() as u64, "Device token ready");
                    return Ok(token);
                },
                DeviceTokenPoll::Pending => {
                    let elapsed = started.elapsed();
                    if elapsed >= self.policy.deadline {
                        let waited_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
                        warn!(attempts, waited_ms, "Device token still pending at deadline");
                        return Err(DeviceBindingError::TokenNotReady { waited_ms });
                    }
                    debug!(attempts, elapsed_ms = elapsed.as_millis() as u64, "Device token pending");
                },
            }
        }
    }
}

impl Default for TokenPoller {
    fn default() -> Self {
        Self::new(PollingPolicy::default())
    }
}
