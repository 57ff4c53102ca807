//! HTTP implementation of the `Fetcher` capability.

use std::time::Duration;

use async_trait::async_trait;

use resin_core::Fetcher;

/// Fetches remote subscription payloads over HTTP(S) with the configured
/// user-agent and per-request timeout.
#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
        user_agent: &str,
        timeout: Duration,
    ) -> anyhow::Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, user_agent)
            .timeout(timeout)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}
