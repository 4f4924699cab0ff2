//! Seam to the embedded reverse proxy.
//!
//! The proxy's HTTP engine, TLS automation and ACME client are collaborators;
//! this controller only ever submits a full config document to its load entry
//! point and tells it to stop on shutdown.

use async_trait::async_trait;

use crate::error::{Error, Result};

/// Default admin endpoint of the embedded server.
pub const DEFAULT_ADMIN_ENDPOINT: &str = "http://127.0.0.1:2019";

#[async_trait]
pub trait ProxyServer: Send + Sync {
    /// Atomically replaces the running configuration.
    async fn load(&self, config: &[u8]) -> Result<()>;

    /// Gracefully stops serving.
    async fn stop(&self) -> Result<()>;
}

/// Drives the embedded server through its localhost admin endpoint.
pub struct AdminEndpoint {
    base: String,
    http: reqwest::Client,
}

impl AdminEndpoint {
    pub fn new(base: impl Into<String>) -> Self {
        AdminEndpoint {
            base: base.into(),
            http: reqwest::Client::new(),
        }
    }
}

impl Default for AdminEndpoint {
    fn default() -> Self {
        AdminEndpoint::new(DEFAULT_ADMIN_ENDPOINT)
    }
}

#[async_trait]
impl ProxyServer for AdminEndpoint {
    async fn load(&self, config: &[u8]) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/load", self.base))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(config.to_vec())
            .send()
            .await
            .map_err(|e| Error::ProxyReload(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::ProxyReload(format!("{status}: {body}")));
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.http
            .post(format!("{}/stop", self.base))
            .send()
            .await
            .map_err(|e| Error::ProxyReload(e.to_string()))?;
        Ok(())
    }
}
