//! The production [`FrontendClient`]: plain HTTP against the front-end's
//! `/files` and `/result` endpoints.

use crate::dispatch::FrontendClient;
use anyhow::{Context as _, Result};
use async_trait::async_trait;
use std::path::Path;

pub struct HttpFrontend {
    base: String,
    client: reqwest::Client,
}

impl HttpFrontend {
    /// `addr` is the front-end's `host:port`.
    pub fn new(addr: &str) -> Self {
        Self {
            base: format!("http://{addr}"),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl FrontendClient for HttpFrontend {
    async fn fetch_input(&self, jid: &str, dest: &Path) -> Result<()> {
        let url = format!("{}/files/{jid}/input", self.base);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("fetching {url}"))?
            .error_for_status()?;
        let bytes = response.bytes().await?;
        tokio::fs::write(dest, &bytes)
            .await
            .with_context(|| format!("writing input to `{}`", dest.display()))?;
        Ok(())
    }

    async fn put_result(&self, jid: &str, artifact: Vec<u8>) -> Result<()> {
        self.client
            .put(format!("{}/result/{jid}", self.base))
            .body(artifact)
            .send()
            .await
            .context("sending result")?
            .error_for_status()?;
        Ok(())
    }

    async fn put_error(&self, jid: &str, msg: &str) -> Result<()> {
        self.client
            .put(format!("{}/result/{jid}?status=error", self.base))
            .body(msg.to_string())
            .send()
            .await
            .context("sending error result")?
            .error_for_status()?;
        Ok(())
    }
}
