use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use vmgate_protocol::codes;

use crate::progress::ProgressTask;

/// Text download provider. Implementations report chunk-level progress
/// through the caller's `ProgressTask` and honor the caller's
/// cancellation token at every suspension point.
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Fetch `url` as UTF-8 text. Returns a negative wire code on
    /// failure; cancellation surfaces as `EXTERNAL_ERROR`.
    async fn download_text(
        &self,
        url: &str,
        progress: Option<&ProgressTask>,
        cancel: &CancellationToken,
    ) -> Result<String, i32>;
}

/// HTTP downloader over a shared reqwest client.
pub struct HttpDownloader {
    client: reqwest::Client,
}

impl HttpDownloader {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for HttpDownloader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn download_text(
        &self,
        url: &str,
        progress: Option<&ProgressTask>,
        cancel: &CancellationToken,
    ) -> Result<String, i32> {
        if cancel.is_cancelled() {
            return Err(codes::EXTERNAL_ERROR);
        }
        let response = tokio::select! {
            r = self.client.get(url).send() => r,
            _ = cancel.cancelled() => return Err(codes::EXTERNAL_ERROR),
        };
        let mut response = match response {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                debug!(url, status = %r.status(), "download rejected");
                return Err(codes::QUERY_ERROR);
            }
            Err(e) => {
                debug!(url, error = %e, "download failed");
                return Err(codes::QUERY_ERROR);
            }
        };

        let total = response.content_length();
        let mut body: Vec<u8> = Vec::new();
        loop {
            let chunk = tokio::select! {
                c = response.chunk() => c,
                _ = cancel.cancelled() => return Err(codes::EXTERNAL_ERROR),
            };
            match chunk {
                Ok(Some(bytes)) => {
                    body.extend_from_slice(&bytes);
                    if let (Some(p), Some(total)) = (progress, total) {
                        if total > 0 {
                            let percent = (body.len() as f64 / total as f64 * 100.0) as u32;
                            p.doing(&format!("Downloading ({}%)", percent.min(100)));
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(url, error = %e, "download stream error");
                    return Err(codes::QUERY_ERROR);
                }
            }
        }

        String::from_utf8(body).map_err(|_| codes::QUERY_ERROR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancelled_download_returns_external_error() {
        let downloader = HttpDownloader::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        // The token is checked before the request resolves, so even an
        // unreachable URL returns promptly.
        let result = downloader
            .download_text("http://127.0.0.1:1/never", None, &cancel)
            .await;
        assert_eq!(result, Err(codes::EXTERNAL_ERROR));
    }
}
