use std::time::Duration;

use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::directive::ContainerDirective;
use crate::error::WatchError;

pub const DEFAULT_METADATA_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/attributes/";

/// Token value before anything has been observed, and when the server
/// sends no `etag`.
pub const NO_TOKEN: &str = "NONE";

/// How long the server may hold a request open.
pub const HANG_TIMEOUT: Duration = Duration::from_secs(120);

/// Local request timeout; longer than [`HANG_TIMEOUT`] so a timeout means
/// "no change yet".
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(130);

/// Pause before reissuing after a connection-level failure.
pub const RETRY_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub url: String,
    pub hang_timeout: Duration,
    pub request_timeout: Duration,
    pub retry_pause: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_METADATA_URL.to_string(),
            hang_timeout: HANG_TIMEOUT,
            request_timeout: REQUEST_TIMEOUT,
            retry_pause: RETRY_PAUSE,
        }
    }
}

/// Long-polls instance attributes and yields a directive each time their
/// content changes.
pub struct MetadataWatcher {
    client: Client,
    config: WatchConfig,
    token: String,
}

impl MetadataWatcher {
    pub fn new(config: WatchConfig) -> Result<Self, WatchError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(WatchError::Client)?;
        Ok(Self {
            client,
            config,
            token: NO_TOKEN.to_string(),
        })
    }

    /// Last observed change token.
    pub fn token(&self) -> &str {
        &self.token
    }

    async fn poll(&self) -> reqwest::Result<reqwest::Response> {
        let hang = self.config.hang_timeout.as_secs().to_string();
        self.client
            .get(&self.config.url)
            .header("Metadata-Flavor", "Google")
            .query(&[
                ("recursive", "true"),
                ("alt", "json"),
                ("wait_for_change", "true"),
                ("timeout_sec", hang.as_str()),
                ("last_etag", self.token.as_str()),
            ])
            .send()
            .await
    }

    /// Wait for the next directive.
    ///
    /// Returns `Ok(None)` once `cancel` fires. Timeouts and unchanged tokens
    /// are reissued at once; other network failures after
    /// [`WatchConfig::retry_pause`]. A new token is stored
    /// before its body is parsed, so a malformed document is reported once
    /// and never yielded again.
    pub async fn watch(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<ContainerDirective>, WatchError> {
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }

            let response = tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                response = self.poll() => response,
            };
            let response = match response {
                Ok(response) => response,
                Err(e) if e.is_timeout() => {
                    debug!("metadata poll timed out, no change");
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "metadata poll failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(None),
                        _ = tokio::time::sleep(self.config.retry_pause) => {}
                    }
                    continue;
                }
            };

            let status = response.status();
            if !status.is_success() {
                return Err(WatchError::Status(status.as_u16()));
            }

            let token = response
                .headers()
                .get("etag")
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .unwrap_or(NO_TOKEN)
                .to_string();
            if token == self.token {
                debug!(token = %token, "metadata unchanged");
                continue;
            }

            let body = tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                body = response.bytes() => body.map_err(WatchError::Body)?,
            };
            info!(old = %self.token, new = %token, "metadata changed");
            self.token = token;
            return ContainerDirective::from_json(&body).map(Some);
        }
    }
}
