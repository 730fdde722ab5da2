//! Delivery of event batches to the ingestion API

use super::events::Event;
use crate::config::TrackerConfig;
use crate::error::{Result, TraceError};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info};

/// Sends one batch of events on behalf of one scope
///
/// Receivers must tolerate duplicates: a batch that failed may be sent again.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, batch: &[Event], scope: &str) -> Result<()>;
}

#[derive(Serialize)]
struct IngestBody<'a> {
    events: &'a [Event],
}

/// Posts batches as `{"events": [...]}` with a bearer token per scope
pub struct HttpTransport {
    client: Client,
    api_url: String,
    verbose: bool,
}

impl HttpTransport {
    pub fn new(config: &TrackerConfig) -> Result<Self> {
        if !config.api_url.starts_with("http://") && !config.api_url.starts_with("https://") {
            return Err(TraceError::ConfigError(format!("Invalid API URL: {}", config.api_url)));
        }

        let client = Client::builder()
            .danger_accept_invalid_certs(!config.ssl_verify)
            .build()?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            verbose: config.verbose,
        })
    }

    pub fn ingest_url(&self) -> String {
        format!("{}/v1/runs/ingest", self.api_url)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, batch: &[Event], scope: &str) -> Result<()> {
        let url = self.ingest_url();
        if self.verbose {
            info!(url = %url, events = batch.len(), "Sending events");
        }

        let response = self
            .client
            .post(&url)
            .bearer_auth(scope)
            .json(&IngestBody { events: batch })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TraceError::TransportError(format!("ingestion returned {}: {}", status, body)));
        }

        if self.verbose {
            info!(status = %status, "Events sent");
        }
        Ok(())
    }
}

/// Accepts and discards every batch
pub struct NullTransport;

#[async_trait]
impl Transport for NullTransport {
    async fn send(&self, batch: &[Event], scope: &str) -> Result<()> {
        debug!(events = batch.len(), scope = scope, "Discarding events");
        Ok(())
    }
}
