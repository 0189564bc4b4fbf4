/**
 * ============================================================================
 * HTTP TRANSPORT MODULE
 * ============================================================================
 *
 * PURPOSE: Deliver a serialized payload to the collection endpoint
 *
 * PROTOCOL:
 * 1. POST <endpoint>?api_secret=...&<app id key>=...
 * 2. Header: Content-Type: application/json
 * 3. Body: one-event JSON payload
 * 4. Production endpoint answers 2xx with an empty body
 * 5. Validation endpoint answers with {"validationMessages": [...]}
 *
 * DELIVERY:
 * - Fire-and-forget: the outcome is only logged
 * - No retry, no backoff, no offline queue. A failed send is lost.
 * - Timeouts are the transport's concern
 *
 * ============================================================================
 */

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

/**
 * Raw HTTP outcome
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_server_error(&self) -> bool {
        self.status >= 500
    }
}

/**
 * Outbound HTTP capability
 * Implementations must send `json_body` with Content-Type: application/json
 */
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(&self, url: &str, json_body: String) -> Result<TransportResponse, String>;
}

// =============================================================================
// Reqwest Transport
// =============================================================================

/**
 * Default transport backed by reqwest
 * The HTTP client is built on first use and reused afterwards
 */
pub struct ReqwestTransport {
    timeout: Duration,
    client: OnceCell<Client>,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            client: OnceCell::new(),
        }
    }

    fn client(&self) -> Result<&Client, String> {
        self.client.get_or_try_init(|| {
            Client::builder()
                .timeout(self.timeout)
                .build()
                .map_err(|e| format!("Failed to create HTTP client: {}", e))
        })
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn post(&self, url: &str, json_body: String) -> Result<TransportResponse, String> {
        let response = self
            .client()?
            .post(url)
            .header("Content-Type", "application/json")
            .body(json_body)
            .send()
            .await
            .map_err(|e| format!("Measurement request failed: {}", e))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| format!("Failed to read measurement response: {}", e))?;

        Ok(TransportResponse { status, body })
    }
}

// =============================================================================
// Validation Endpoint Responses
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationMessage {
    #[serde(default)]
    pub field_path: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub validation_code: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValidationResponse {
    #[serde(default)]
    validation_messages: Vec<ValidationMessage>,
}

/**
 * Parse the body returned by the validation endpoint
 */
pub fn parse_validation_messages(body: &str) -> Result<Vec<ValidationMessage>, String> {
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str::<ValidationResponse>(body)
        .map(|response| response.validation_messages)
        .map_err(|e| format!("Failed to parse validation response: {}", e))
}

/**
 * Log the outcome of one send
 * Nothing is retried whatever the outcome
 */
pub fn log_outcome(result: &Result<TransportResponse, String>, validation_endpoint: bool) {
    match result {
        Ok(response) if response.is_success() => {
            log::debug!("[MP-TRANSPORT] Event delivered (status {})", response.status);
            if validation_endpoint {
                log_validation_messages(&response.body);
            }
        }
        Ok(response) if response.is_server_error() => {
            // TODO: retry with backoff once delivery durability is a product requirement
            log::error!(
                "[MP-TRANSPORT] Server error {}, event dropped: {}",
                response.status,
                preview(&response.body)
            );
        }
        Ok(response) => {
            log::warn!(
                "[MP-TRANSPORT] Request rejected with status {}: {}",
                response.status,
                preview(&response.body)
            );
        }
        Err(e) => {
            log::error!("[MP-TRANSPORT] Network error, event dropped: {}", e);
        }
    }
}

fn preview(body: &str) -> String {
    body.chars().take(200).collect()
}

fn log_validation_messages(body: &str) {
    match parse_validation_messages(body) {
        Ok(messages) if messages.is_empty() => {
            log::info!("[MP-TRANSPORT] Validation endpoint accepted the event");
        }
        Ok(messages) => {
            for message in messages {
                log::warn!(
                    "[MP-TRANSPORT] Validation {} at '{}': {}",
                    message.validation_code,
                    message.field_path,
                    message.description
                );
            }
        }
        Err(e) => log::warn!("[MP-TRANSPORT] {}", e),
    }
}
