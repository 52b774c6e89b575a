//! Client library for corral.
//!
//! A job is three sequential steps: upload the payload to an engine, poll
//! the result endpoint until the job is terminal (or patience runs out),
//! and download the artifact on success. Errors carry the step they
//! happened in.

use anyhow::{anyhow, Context as _};
use corral_base::JobId;
use serde::Deserialize;
use std::{io::Write, path::Path, time::Duration};

fn default_base() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_polling_interval_ms() -> u64 {
    1000
}

fn default_polling_attempts() -> u32 {
    10
}

#[derive(Clone, Debug, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the front-end.
    #[serde(default = "default_base")]
    pub base: String,

    /// Milliseconds to wait between polls while the job is non-terminal.
    #[serde(default = "default_polling_interval_ms")]
    pub polling_interval_ms: u64,

    /// How many polls before giving up on a non-terminal job.
    #[serde(default = "default_polling_attempts")]
    pub polling_attempts: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base: default_base(),
            polling_interval_ms: default_polling_interval_ms(),
            polling_attempts: default_polling_attempts(),
        }
    }
}

impl ClientConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading client config `{}`", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("parsing client config `{}`", path.display()))
    }
}

/// What `/result/<jid>` answered last.
#[derive(Clone, Debug, Deserialize)]
pub struct JobResult {
    pub status: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub link: String,
}

impl JobResult {
    pub fn is_success(&self) -> bool {
        self.status == "Success"
    }
}

/// A client error, tagged with the pipeline step that produced it.
#[derive(Debug, derive_more::Display)]
pub enum ClientError {
    #[display(fmt = "upload failed: {}", _0)]
    Upload(anyhow::Error),
    #[display(fmt = "polling failed: {}", _0)]
    Poll(anyhow::Error),
    #[display(fmt = "download failed: {}", _0)]
    Download(anyhow::Error),
}

impl std::error::Error for ClientError {}

pub struct Client {
    config: ClientConfig,
    engine: String,
    http: reqwest::Client,
}

impl Client {
    pub fn new(mut config: ClientConfig, engine: impl Into<String>) -> Self {
        if config.polling_attempts < 1 {
            config.polling_attempts = 1;
        }
        Self {
            config,
            engine: engine.into(),
            http: reqwest::Client::new(),
        }
    }

    /// POST the raw payload to the engine's upload endpoint.
    pub async fn upload(&self, payload: Vec<u8>) -> Result<JobId, ClientError> {
        #[derive(Deserialize)]
        struct UploadResponse {
            jobid: String,
        }

        let url = format!("{}/{}/upload", self.config.base, self.engine);
        let response = self
            .http
            .post(&url)
            .body(payload)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .with_context(|| format!("posting to {url}"))
            .map_err(ClientError::Upload)?;
        let parsed: UploadResponse = response
            .json()
            .await
            .context("parsing upload response")
            .map_err(ClientError::Upload)?;
        parsed
            .jobid
            .parse()
            .context("parsing jobid")
            .map_err(ClientError::Upload)
    }

    /// Poll the result endpoint until the job is terminal or the attempt
    /// budget runs out. Either way the last observed result is returned;
    /// the caller checks its status.
    pub async fn poll(&self, jid: JobId) -> Result<JobResult, ClientError> {
        let url = format!("{}/result/{jid}", self.config.base);
        let mut attempt = 0;
        loop {
            let result: JobResult = self
                .http
                .get(&url)
                .send()
                .await
                .and_then(|response| response.error_for_status())
                .with_context(|| format!("getting {url}"))
                .map_err(ClientError::Poll)?
                .json()
                .await
                .context("parsing result response")
                .map_err(ClientError::Poll)?;

            match result.status.as_str() {
                "Success" | "Fail" => return Ok(result),
                "Received" | "Running" => {
                    attempt += 1;
                    if attempt >= self.config.polling_attempts {
                        return Ok(result);
                    }
                    tokio::time::sleep(Duration::from_millis(self.config.polling_interval_ms))
                        .await;
                }
                other => {
                    return Err(ClientError::Poll(anyhow!("unexpected status `{other}`")));
                }
            }
        }
    }

    /// Fetch the artifact behind `link` into `out`.
    pub async fn download(
        &self,
        link: &str,
        out: &mut (dyn Write + Send),
    ) -> Result<(), ClientError> {
        let url = format!("{}{link}", self.config.base);
        let bytes = self
            .http
            .get(&url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .with_context(|| format!("getting {url}"))
            .map_err(ClientError::Download)?
            .bytes()
            .await
            .context("reading artifact body")
            .map_err(ClientError::Download)?;
        out.write_all(&bytes)
            .context("writing artifact")
            .map_err(ClientError::Download)
    }

    /// The whole pipeline. The artifact is downloaded into `out` only when
    /// the job succeeded; a Fail or a still-running job is reported through
    /// the returned result, not as an error.
    pub async fn run_job(
        &self,
        payload: Vec<u8>,
        out: &mut (dyn Write + Send),
    ) -> Result<JobResult, ClientError> {
        let jid = self.upload(payload).await?;
        let result = self.poll(jid).await?;
        if result.is_success() && !result.link.is_empty() {
            self.download(&result.link, out).await?;
        }
        Ok(result)
    }
}
