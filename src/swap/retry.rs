//! Fixed-interval retry of transiently failing phases

use crate::atom::{AtomError, ErrorClass};
use crate::config::SwapperConfig;
use crate::network::NetworkError;
use crate::state::StoreError;
use crate::watchdog::WatchdogError;

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Failures that may go away on their own
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for AtomError {
    fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

impl Transient for StoreError {
    fn is_transient(&self) -> bool {
        self.is_retryable()
    }
}

impl Transient for NetworkError {
    fn is_transient(&self) -> bool {
        self.is_retryable()
    }
}

impl Transient for WatchdogError {
    fn is_transient(&self) -> bool {
        match self {
            WatchdogError::Http(_) => true,
            WatchdogError::Status(status) => *status >= 500,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub interval: Duration,
    /// Unbounded when `None`
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    pub fn new(interval: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// Run `op` until it succeeds or fails with a non-transient error.
    /// Once the attempt budget is spent the last transient error is returned.
    pub async fn run<T, E, F, Fut>(&self, tag: &str, phase: &'static str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient + Display,
    {
        let mut attempts = 0u32;
        loop {
            match op().await {
                Err(e) if e.is_transient() => {
                    attempts += 1;
                    if self.max_attempts.is_some_and(|max| attempts >= max) {
                        warn!("[{}] Giving up on {} after {} attempts: {}", tag, phase, attempts, e);
                        return Err(e);
                    }
                    warn!(
                        "[{}] {} failed (attempt {}), retrying in {:?}: {}",
                        tag, phase, attempts, self.interval, e
                    );
                    crate::metrics::record_retry(phase);
                    tokio::time::sleep(self.interval).await;
                }
                result => return result,
            }
        }
    }
}

impl From<&SwapperConfig> for RetryPolicy {
    fn from(config: &SwapperConfig) -> Self {
        Self::new(
            Duration::from_secs(config.retry_interval_secs),
            config.max_retries,
        )
    }
}

/// Protocol time windows, in seconds
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    pub owner_address_wait: i64,
    pub swap_details_wait: i64,
    pub requestor_expiry: i64,
    pub responder_safety_margin: i64,
}

impl Default for Timing {
    fn default() -> Self {
        Self::from(&SwapperConfig::default())
    }
}

impl From<&SwapperConfig> for Timing {
    fn from(config: &SwapperConfig) -> Self {
        Self {
            owner_address_wait: config.owner_address_wait_secs,
            swap_details_wait: config.swap_details_wait_secs,
            requestor_expiry: config.requestor_expiry_secs,
            responder_safety_margin: config.responder_safety_margin_secs,
        }
    }
}
