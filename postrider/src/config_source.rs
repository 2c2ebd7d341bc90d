//! Configuration loading from a local file and/or a remote URL.
//!
//! The remote source is preferred when configured; an unreachable or
//! empty remote falls through to the local file. With a reload interval
//! set, [`ConfigSource::changed`] polls for a differing document and
//! resolves when one appears.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use tracing::warn;

const REMOTE_TIMEOUT: Duration = Duration::from_secs(300);

pub struct ConfigSource {
    path: Option<PathBuf>,
    remote: Option<String>,
    reload: Option<Duration>,
    client: Option<reqwest::Client>,
}

impl ConfigSource {
    #[must_use]
    pub fn new(path: Option<PathBuf>, remote: Option<String>, reload: Option<Duration>) -> Self {
        let client = remote.as_ref().map(|_| {
            reqwest::Client::builder()
                .timeout(REMOTE_TIMEOUT)
                .build()
                .unwrap_or_default()
        });
        Self {
            path,
            remote,
            reload,
            client,
        }
    }

    /// Fetch the current configuration document.
    ///
    /// # Errors
    ///
    /// Returns an error when no source yields a document.
    pub async fn load(&self) -> anyhow::Result<Vec<u8>> {
        if let (Some(client), Some(url)) = (&self.client, &self.remote) {
            match fetch_remote(client, url).await {
                Ok(Some(bytes)) => return Ok(bytes),
                Ok(None) => {
                    warn!(url = %url, "remote configuration is empty, falling back to local");
                }
                Err(error) => {
                    warn!(url = %url, error = %error, "can't fetch remote configuration, falling back to local");
                }
            }
        }

        let path = self
            .path
            .as_ref()
            .context("no configuration source available")?;
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("can't read configuration file {}", path.display()))?;
        Ok(bytes)
    }

    /// Resolve with the new document once the configuration differs from
    /// `current`. Without a reload interval this pends forever.
    pub async fn changed(&self, current: &[u8]) -> Vec<u8> {
        let Some(interval) = self.reload else {
            return std::future::pending().await;
        };

        loop {
            tokio::time::sleep(interval).await;
            match self.load().await {
                Ok(bytes) if bytes != current => return bytes,
                Ok(_) => {}
                Err(error) => {
                    warn!(error = %error, "configuration refresh failed, keeping current");
                }
            }
        }
    }
}

async fn fetch_remote(client: &reqwest::Client, url: &str) -> anyhow::Result<Option<Vec<u8>>> {
    let response = client.get(url).send().await?.error_for_status()?;
    let bytes = response.bytes().await?;
    if bytes.is_empty() {
        Ok(None)
    } else {
        Ok(Some(bytes.to_vec()))
    }
}
