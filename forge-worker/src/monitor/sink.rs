//! Report sinks
//!
//! Finalized task reports go to an Elasticsearch-compatible index when one is
//! configured, and to the log otherwise.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info};

use super::TaskReport;
use crate::config::ElasticConfig;

/// Destination of finalized task reports
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn push(&self, report: &TaskReport) -> Result<()>;
}

/// Indexes reports as documents over HTTP
#[derive(Debug, Clone)]
pub struct ElasticSink {
    endpoint: String,
    username: Option<String>,
    password: Option<String>,
    client: Client,
}

impl ElasticSink {
    /// Creates a sink for `<url>/<index>/_doc`
    ///
    /// # Arguments
    /// * `config` - Index location and credentials
    pub fn new(config: &ElasticConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            endpoint: document_endpoint(&config.url, &config.index),
            username: config.username.clone(),
            password: config.password.clone(),
            client,
        })
    }
}

#[async_trait]
impl ReportSink for ElasticSink {
    async fn push(&self, report: &TaskReport) -> Result<()> {
        let mut request = self.client.post(&self.endpoint).json(report);
        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_ref());
        }

        request
            .send()
            .await
            .context("Failed to send report")?
            .error_for_status()
            .context("Report rejected")?;

        debug!("Report indexed at {}", self.endpoint);
        Ok(())
    }
}

/// Writes reports to the log
#[derive(Debug, Clone, Default)]
pub struct LogSink;

#[async_trait]
impl ReportSink for LogSink {
    async fn push(&self, report: &TaskReport) -> Result<()> {
        info!("Task report: {}", serde_json::to_string(report)?);
        Ok(())
    }
}

fn document_endpoint(url: &str, index: &str) -> String {
    // Index names must be lowercase
    format!(
        "{}/{}/_doc",
        url.trim_end_matches('/'),
        index.to_lowercase()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_endpoint() {
        assert_eq!(
            document_endpoint("http://localhost:9200/", "IO-Queue-Stats"),
            "http://localhost:9200/io-queue-stats/_doc"
        );
    }

    #[test]
    fn test_sink_from_config() {
        let config = ElasticConfig {
            url: "https://metrics.example.com".to_string(),
            index: "stats".to_string(),
            username: Some("writer".to_string()),
            password: None,
        };
        let sink = ElasticSink::new(&config).unwrap();
        assert_eq!(sink.endpoint, "https://metrics.example.com/stats/_doc");
        assert_eq!(sink.username.as_deref(), Some("writer"));
    }
}
