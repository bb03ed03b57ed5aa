//! Complaint client for the external watchdog service

use crate::config::WatchdogConfig;
use crate::OrderId;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::error;

/// Protocol failures the watchdog can be told about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complaint {
    /// Counterparty never published the address it wants to be paid at
    DelayedAddressSubmission,
    DelayedResponderInitiation,
    WrongResponderInitiation,
    DelayedRequestorInitiation,
    WrongRequestorInitiation,
    DelayedRequestorRedemption,
}

impl Complaint {
    pub const ALL: [Complaint; 6] = [
        Complaint::DelayedAddressSubmission,
        Complaint::DelayedResponderInitiation,
        Complaint::WrongResponderInitiation,
        Complaint::DelayedRequestorInitiation,
        Complaint::WrongRequestorInitiation,
        Complaint::DelayedRequestorRedemption,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Complaint::DelayedAddressSubmission => "delayed_address_submission",
            Complaint::DelayedResponderInitiation => "delayed_responder_initiation",
            Complaint::WrongResponderInitiation => "wrong_responder_initiation",
            Complaint::DelayedRequestorInitiation => "delayed_requestor_initiation",
            Complaint::WrongRequestorInitiation => "wrong_requestor_initiation",
            Complaint::DelayedRequestorRedemption => "delayed_requestor_redemption",
        }
    }
}

impl fmt::Display for Complaint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum WatchdogError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("watchdog returned {0}")]
    Status(u16),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Watchdog: Send + Sync {
    async fn complain(&self, order_id: OrderId, complaint: Complaint) -> Result<(), WatchdogError>;
}

/// Posts complaints to `{url}/watch`
pub struct HttpWatchdog {
    base_url: String,
    client: reqwest::Client,
}

impl HttpWatchdog {
    pub fn new(config: &WatchdogConfig) -> Result<Self, WatchdogError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl Watchdog for HttpWatchdog {
    async fn complain(&self, order_id: OrderId, complaint: Complaint) -> Result<(), WatchdogError> {
        let response = self
            .client
            .post(format!("{}/watch", self.base_url))
            .query(&[
                ("orderID", hex::encode(order_id)),
                ("complaint", complaint.as_str().to_string()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            error!(
                "[{}] Watchdog rejected complaint {}: {}",
                crate::order_tag(&order_id),
                complaint,
                response.status()
            );
            return Err(WatchdogError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complaint_names_match_serde() {
        for complaint in Complaint::ALL {
            assert_eq!(
                serde_json::to_string(&complaint).unwrap(),
                format!("\"{}\"", complaint.as_str())
            );
        }
    }

    #[test]
    fn test_base_url_trimmed() {
        let watchdog = HttpWatchdog::new(&WatchdogConfig {
            url: "http://localhost:18516/".to_string(),
        })
        .unwrap();
        assert_eq!(watchdog.base_url, "http://localhost:18516");
    }
}
