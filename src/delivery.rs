//! Delivery of reading batches to the remote collector endpoint.
//!
//! [`DeliveryClient`] is the transport seam: the scheduler only sees a
//! [`DeliveryResult`] per attempt and applies its own retry policy.
//! [`HttpDeliveryClient`] is the production implementation, posting JSON
//! over a pooled reqwest client.

use std::future::Future;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::config::Config;
use crate::reading::Batch;

/// Outcome of a single delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryResult {
    /// The endpoint acknowledged the batch
    Acked,

    /// The endpoint refused the batch; retrying will not help
    Rejected(String),

    /// The batch may not have arrived; safe to retry with the same id
    TransportFailure(String),
}

/// Transport that pushes one batch per call.
///
/// Implementations make exactly one attempt. Dropping the returned future
/// must abandon the attempt, which is how shutdown cancels in-flight sends.
pub trait DeliveryClient: Send + Sync + 'static {
    fn send(&self, batch: &Batch) -> impl Future<Output = DeliveryResult> + Send;
}

/// Acknowledgement body returned by the ingest endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckResponse {
    /// Id of the acknowledged batch
    #[serde(default)]
    pub batch_id: Option<String>,

    #[serde(default)]
    pub status: Option<String>,

    /// Number of readings the endpoint stored
    #[serde(default)]
    pub accepted: Option<u64>,
}

/// Errors that can occur during HTTP client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Request(#[source] reqwest::Error),

    #[error("Server error ({code}): {message}")]
    Status { code: StatusCode, message: String },

    #[error("Request timed out")]
    Timeout,

    #[error("Acknowledgement for batch {acked} does not match sent batch {sent}")]
    AckMismatch { sent: String, acked: String },

    #[error("Client configuration error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::Timeout
        } else {
            ClientError::Request(err)
        }
    }
}

impl ClientError {
    /// Whether resending the same batch could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Request(e) => !e.is_builder(),
            ClientError::Timeout => true,
            ClientError::Status { code, .. } => {
                code.is_server_error()
                    || *code == StatusCode::TOO_MANY_REQUESTS
                    || *code == StatusCode::REQUEST_TIMEOUT
            }
            ClientError::AckMismatch { .. } => true,
            ClientError::Config(_) => false,
        }
    }
}

impl From<ClientError> for DeliveryResult {
    fn from(err: ClientError) -> Self {
        if err.is_retryable() {
            DeliveryResult::TransportFailure(err.to_string())
        } else {
            DeliveryResult::Rejected(err.to_string())
        }
    }
}

/// HTTP delivery client for the ingest endpoint.
///
/// The underlying reqwest client is reused across sends so connections
/// are pooled.
pub struct HttpDeliveryClient {
    client: Client,
    endpoint_url: String,
    timeout: Duration,
}

impl HttpDeliveryClient {
    /// Create a client from the collector configuration.
    pub fn new(config: &Config) -> Result<Self, ClientError> {
        Self::with_settings(config.endpoint_url.clone(), config.request_timeout)
    }

    /// Create a client with explicit settings.
    pub fn with_settings(
        endpoint_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| ClientError::Config(e.to_string()))?;

        Ok(Self {
            client,
            endpoint_url: endpoint_url.into(),
            timeout,
        })
    }

    pub fn endpoint_url(&self) -> &str {
        &self.endpoint_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Post the batch once and interpret the acknowledgement.
    async fn post_batch(&self, batch: &Batch) -> Result<AckResponse, ClientError> {
        let response = self
            .client
            .post(&self.endpoint_url)
            .json(batch)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(ClientError::Status {
                code: status,
                message: body,
            });
        }

        // Status is authoritative; the body only matters if it names a batch
        let ack: AckResponse = serde_json::from_str(&body).unwrap_or_default();
        if let Some(acked) = &ack.batch_id {
            if acked != &batch.batch_id {
                return Err(ClientError::AckMismatch {
                    sent: batch.batch_id.clone(),
                    acked: acked.clone(),
                });
            }
        }

        Ok(ack)
    }
}

impl DeliveryClient for HttpDeliveryClient {
    async fn send(&self, batch: &Batch) -> DeliveryResult {
        debug!(
            batch_id = %batch.batch_id,
            batch_size = batch.len(),
            attempt = batch.attempt,
            url = %self.endpoint_url,
            "Sending reading batch"
        );

        match self.post_batch(batch).await {
            Ok(ack) => {
                debug!(
                    batch_id = %batch.batch_id,
                    accepted = ?ack.accepted,
                    "Batch acknowledged"
                );
                DeliveryResult::Acked
            }
            Err(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_error_display() {
        assert_eq!(ClientError::Timeout.to_string(), "Request timed out");

        let err = ClientError::Status {
            code: StatusCode::BAD_REQUEST,
            message: "Invalid JSON".to_string(),
        };
        assert!(err.to_string().contains("400"));
        assert!(err.to_string().contains("Invalid JSON"));
    }

    #[test]
    fn test_retryable_error_detection() {
        assert!(ClientError::Timeout.is_retryable());

        for code in [
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::REQUEST_TIMEOUT,
        ] {
            let err = ClientError::Status {
                code,
                message: String::new(),
            };
            assert!(err.is_retryable(), "{} should be retryable", code);
        }

        for code in [StatusCode::BAD_REQUEST, StatusCode::UNPROCESSABLE_ENTITY, StatusCode::NOT_FOUND] {
            let err = ClientError::Status {
                code,
                message: String::new(),
            };
            assert!(!err.is_retryable(), "{} should not be retryable", code);
        }

        assert!(!ClientError::Config("bad".to_string()).is_retryable());
        assert!(ClientError::AckMismatch {
            sent: "a".to_string(),
            acked: "b".to_string(),
        }
        .is_retryable());
    }

    #[test]
    fn test_client_error_maps_to_delivery_result() {
        let rejected: DeliveryResult = ClientError::Status {
            code: StatusCode::UNPROCESSABLE_ENTITY,
            message: "readings must not be empty".to_string(),
        }
        .into();
        assert!(matches!(rejected, DeliveryResult::Rejected(reason) if reason.contains("readings must not be empty")));

        let transient: DeliveryResult = ClientError::Timeout.into();
        assert_eq!(
            transient,
            DeliveryResult::TransportFailure("Request timed out".to_string())
        );
    }

    #[test]
    fn test_ack_response_deserialization() {
        let json = r#"{"batchId": "abc-123", "status": "accepted", "accepted": 4}"#;
        let ack: AckResponse = serde_json::from_str(json).unwrap();
        assert_eq!(ack.batch_id.as_deref(), Some("abc-123"));
        assert_eq!(ack.accepted, Some(4));

        let ack: AckResponse = serde_json::from_str("{}").unwrap();
        assert!(ack.batch_id.is_none());
    }

    #[test]
    fn test_client_creation() {
        let config = Config::default();
        let client = HttpDeliveryClient::new(&config).unwrap();
        assert_eq!(client.endpoint_url(), config.endpoint_url);
        assert_eq!(client.timeout(), Duration::from_secs(30));
    }
}
