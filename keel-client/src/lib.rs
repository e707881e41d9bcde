//! Keel Worker Client
//!
//! A small, type-safe HTTP client the master uses to talk to push workers.
//!
//! A worker exposes four endpoints:
//! - `GET /work/available`: whether it can take a job right now
//! - `GET /work/current`: the action-instance ids it is executing
//! - `POST /work`: accept a job
//! - `DELETE /work/{id}`: stop a job
//!
//! # Example
//!
//! ```no_run
//! use keel_client::WorkerClient;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), keel_client::ClientError> {
//!     let client = WorkerClient::new(Duration::from_secs(3))?;
//!
//!     let availability = client.availability("10.0.0.5:9000").await?;
//!     println!("available: {}", availability.can_accept());
//!     Ok(())
//! }
//! ```

pub mod error;
mod work;

// Re-export commonly used types
pub use error::{ClientError, Result};

use reqwest::Client;
use serde::de::DeserializeOwned;
use std::time::Duration;

/// HTTP client for Keel push workers
///
/// Workers are addressed per call by their `ip:port`, so one client serves the
/// whole fleet. Every request is bounded by the timeout given at construction.
#[derive(Debug, Clone)]
pub struct WorkerClient {
    /// HTTP client instance
    client: Client,
}

impl WorkerClient {
    /// Create a new worker client with a per-request timeout
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;

        Ok(Self { client })
    }

    /// Create a new worker client with a custom HTTP client
    ///
    /// This allows you to configure timeouts, proxies, TLS settings, etc.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// Build the URL of an endpoint on a worker
    fn url(address: &str, path: &str) -> String {
        let address = address.trim_end_matches('/');
        if address.starts_with("http://") || address.starts_with("https://") {
            format!("{}{}", address, path)
        } else {
            format!("http://{}{}", address, path)
        }
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    /// Handle a worker response and deserialize JSON
    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)))
    }

    /// Handle a worker response that returns no content
    async fn handle_empty_response(&self, response: reqwest::Response) -> Result<()> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        assert!(WorkerClient::new(Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn test_url_from_bare_address() {
        assert_eq!(
            WorkerClient::url("10.0.0.5:9000", "/work"),
            "http://10.0.0.5:9000/work"
        );
    }

    #[test]
    fn test_url_keeps_scheme_and_trims_slash() {
        assert_eq!(
            WorkerClient::url("https://worker.local:9000/", "/work/current"),
            "https://worker.local:9000/work/current"
        );
    }
}
