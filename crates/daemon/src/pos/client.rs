//! HTTP client for the POS devicebox endpoints
//!
//! One `reqwest::Client` configured for the POS appliance: 5 s request
//! timeout and TLS that accepts self-signed certificates. The appliance
//! terminates TLS with a self-issued certificate on the same LAN; the
//! bearer token is the authentication factor, not the certificate.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, header};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use common::ScanEntry;

use super::short_id;

/// Timeout for every POS request.
const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest body excerpt quoted in diagnostics.
const BODY_PREVIEW_CHARS: usize = 200;

/// Scan-session state reported by `GET /api/devicebox/session`.
///
/// Missing fields read as "no active session"; unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SessionState {
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// A classified POS request failure.
///
/// The display form of each variant is the operator-facing status detail.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Invalid token (401)")]
    Unauthorized,

    #[error("Endpoint not found (404)")]
    NotFound,

    #[error("HTTP {0}")]
    Status(u16),

    #[error("POS not reachable")]
    Unreachable(#[source] reqwest::Error),

    #[error("Response is not JSON")]
    InvalidJson(#[source] serde_json::Error),
}

/// Boundary to the POS HTTP API.
///
/// A trait so the polling loop can be exercised against a scripted fake
/// instead of a live endpoint.
#[async_trait]
pub trait SessionApi: Send + Sync {
    /// Fetch the current scan-session state.
    async fn fetch_session(&self, url: &str, token: &str) -> Result<SessionState, FetchError>;

    /// Submit one completed barcode read to the given session.
    async fn send_barcode(
        &self,
        url: &str,
        token: &str,
        session_id: &str,
        entry: &ScanEntry,
    ) -> Result<(), FetchError>;
}

/// Production `SessionApi` backed by reqwest.
#[derive(Debug, Clone)]
pub struct PosClient {
    http: reqwest::Client,
}

impl PosClient {
    pub fn new() -> common::Result<Self> {
        Ok(Self { http: build_http()? })
    }

    /// One-shot connectivity probe against caller-supplied settings.
    ///
    /// Independent of any running poller; used to validate a URL/token pair
    /// before committing it to the settings store. Returns a success flag
    /// and a diagnostic message for the operator.
    pub async fn test_connection(url: &str, token: &str) -> (bool, String) {
        let http = match build_http() {
            Ok(http) => http,
            Err(err) => return (false, format!("Not reachable: {}", err)),
        };

        let endpoint = session_endpoint(url);
        let response = match http
            .get(&endpoint)
            .bearer_auth(token)
            .header(header::ACCEPT, "application/json")
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => return (false, format!("Not reachable: {}", err)),
        };

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        info!(
            "POS test response: status={}, body={}",
            status.as_u16(),
            preview(&body)
        );

        if status == StatusCode::UNAUTHORIZED {
            return (false, "Invalid token (401 Unauthorized)".to_string());
        }
        if !status.is_success() {
            return (false, format!("HTTP {}: {}", status.as_u16(), preview(&body)));
        }

        match serde_json::from_str::<serde_json::Value>(&body) {
            Ok(value) => {
                if value.get("active").is_some() {
                    (true, "Connection successful".to_string())
                } else {
                    let keys = match value.as_object() {
                        Some(map) => map.keys().cloned().collect::<Vec<_>>(),
                        None => Vec::new(),
                    };
                    (false, format!("Unexpected response format: {:?}", keys))
                }
            }
            Err(_) => (false, format!("Response is not JSON: {}", preview(&body))),
        }
    }
}

#[async_trait]
impl SessionApi for PosClient {
    async fn fetch_session(&self, url: &str, token: &str) -> Result<SessionState, FetchError> {
        let endpoint = session_endpoint(url);
        let response = self
            .http
            .get(&endpoint)
            .bearer_auth(token)
            .header(header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|err| {
                // Transient by nature, so not worth a warning on every poll
                debug!("POS not reachable: {}", err);
                FetchError::Unreachable(err)
            })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            warn!("POS rejected the configured token (401 Unauthorized)");
            return Err(FetchError::Unauthorized);
        }
        if status == StatusCode::NOT_FOUND {
            warn!("POS endpoint not found: {}", endpoint);
            return Err(FetchError::NotFound);
        }
        if !status.is_success() {
            warn!("POS session fetch failed: HTTP {}", status.as_u16());
            return Err(FetchError::Status(status.as_u16()));
        }

        let body = response.text().await.map_err(|err| {
            debug!("POS not reachable: {}", err);
            FetchError::Unreachable(err)
        })?;
        parse_session(&body)
    }

    async fn send_barcode(
        &self,
        url: &str,
        token: &str,
        session_id: &str,
        entry: &ScanEntry,
    ) -> Result<(), FetchError> {
        let payload = BarcodePayload {
            session_id,
            barcode: &entry.barcode,
            timestamp: &entry.timestamp,
            device_name: &entry.device,
        };

        let response = self
            .http
            .post(barcode_endpoint(url))
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await
            .map_err(|err| {
                error!("Failed to send barcode to POS: {}", err);
                FetchError::Unreachable(err)
            })?;

        let status = response.status();
        if !status.is_success() {
            error!("Failed to send barcode to POS: HTTP {}", status.as_u16());
            return Err(FetchError::Status(status.as_u16()));
        }

        info!(
            "Barcode sent to POS: {} (session {})",
            entry.barcode,
            short_id(session_id)
        );
        Ok(())
    }
}

/// Wire form of one barcode submission.
#[derive(Debug, Serialize)]
struct BarcodePayload<'a> {
    session_id: &'a str,
    barcode: &'a str,
    timestamp: &'a str,
    device_name: &'a str,
}

fn build_http() -> common::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .danger_accept_invalid_certs(true)
        .build()
        .map_err(|e| common::Error::Http(e.to_string()))
}

fn session_endpoint(url: &str) -> String {
    format!("{}/api/devicebox/session", url.trim_end_matches('/'))
}

fn barcode_endpoint(url: &str) -> String {
    format!("{}/api/devicebox/barcode", url.trim_end_matches('/'))
}

fn parse_session(body: &str) -> Result<SessionState, FetchError> {
    serde_json::from_str(body).map_err(|err| {
        warn!("POS returned a non-JSON session response: {}", preview(body));
        FetchError::InvalidJson(err)
    })
}

fn preview(body: &str) -> String {
    if body.is_empty() {
        "<empty>".to_string()
    } else {
        body.chars().take(BODY_PREVIEW_CHARS).collect()
    }
}
