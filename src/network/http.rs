//! Signalling over an HTTP relay
//!
//! Values are stored under `/orders/{order_id}/address` and
//! `/orders/{order_id}/details`; a 404 means nothing is published yet.

use super::{NetworkError, SwapNetwork};
use crate::clock::Clock;
use crate::config::NetworkConfig;
use crate::OrderId;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Serialize, Deserialize)]
struct AddressPayload {
    address: String,
}

#[derive(Serialize, Deserialize)]
struct DetailsPayload {
    #[serde(with = "hex::serde")]
    details: Vec<u8>,
}

pub struct HttpNetwork {
    base_url: String,
    client: reqwest::Client,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
}

impl HttpNetwork {
    pub fn new(config: &NetworkConfig, clock: Arc<dyn Clock>) -> Result<Self, NetworkError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            client,
            clock,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        })
    }

    fn path(order_id: &OrderId, field: &str) -> String {
        format!("/orders/{}/{}", hex::encode(order_id), field)
    }

    async fn put<T: Serialize + Sync>(&self, path: &str, body: &T) -> Result<(), NetworkError> {
        let response = self
            .client
            .put(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(NetworkError::Status {
                status: response.status().as_u16(),
                path: path.to_string(),
            });
        }
        debug!("Published {}", path);
        Ok(())
    }

    async fn get<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<Option<T>, NetworkError> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let body = response.text().await?;
                serde_json::from_str(&body)
                    .map(Some)
                    .map_err(|e| NetworkError::Decode(e.to_string()))
            }
            status => Err(NetworkError::Status {
                status: status.as_u16(),
                path: path.to_string(),
            }),
        }
    }

    /// Poll until published; retryable errors only delay the next poll
    async fn wait_for<T: for<'de> Deserialize<'de>>(
        &self,
        order_id: &OrderId,
        field: &str,
        deadline: i64,
        what: &'static str,
    ) -> Result<T, NetworkError> {
        let path = Self::path(order_id, field);
        loop {
            match self.get(&path).await {
                Ok(Some(value)) => return Ok(value),
                Ok(None) => {}
                Err(e) if e.is_retryable() => {
                    warn!("[{}] Polling {} failed: {}", crate::order_tag(order_id), what, e)
                }
                Err(e) => return Err(e),
            }
            if self.clock.now() >= deadline {
                return Err(NetworkError::deadline(order_id, what));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[async_trait]
impl SwapNetwork for HttpNetwork {
    async fn send_owner_address(&self, order_id: OrderId, address: String) -> Result<(), NetworkError> {
        self.put(&Self::path(&order_id, "address"), &AddressPayload { address })
            .await
    }

    async fn receive_owner_address(&self, order_id: OrderId, deadline: i64) -> Result<String, NetworkError> {
        let payload: AddressPayload = self
            .wait_for(&order_id, "address", deadline, "owner address")
            .await?;
        Ok(payload.address)
    }

    async fn send_swap_details(&self, order_id: OrderId, details: Vec<u8>) -> Result<(), NetworkError> {
        self.put(&Self::path(&order_id, "details"), &DetailsPayload { details })
            .await
    }

    async fn receive_swap_details(&self, order_id: OrderId, deadline: i64) -> Result<Vec<u8>, NetworkError> {
        let payload: DetailsPayload = self
            .wait_for(&order_id, "details", deadline, "swap details")
            .await?;
        Ok(payload.details)
    }
}
