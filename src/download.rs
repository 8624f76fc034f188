//! Resumable artifact downloads
//!
//! Bytes land in `<filename>.downloading` next to the destination and are
//! renamed on completion. An interrupted transfer leaves the partial file in
//! place so the next call resumes with a `Range` request.

use crate::config::DownloadConfig;
use crate::error::{SupervisorError, SupervisorResult};
use futures::StreamExt;
use reqwest::header::{CONTENT_LENGTH, LOCATION, RANGE};
use reqwest::{StatusCode, Url, redirect};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;

const PARTIAL_SUFFIX: &str = ".downloading";

/// Progress snapshot sent while a download runs
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadProgress {
    pub downloaded: u64,
    pub total: u64,
    pub percent: f64,
    pub filename: String,
    pub resumed: bool,
}

/// Completed download
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadOutcome {
    pub path: PathBuf,
    pub bytes: u64,
    pub resumed: bool,
}

/// HTTP downloader with resume support
pub struct ArtifactDownloader {
    /// Redirects disabled; HEAD redirects are followed by hand
    head_client: reqwest::Client,
    client: reqwest::Client,
    config: DownloadConfig,
}

impl ArtifactDownloader {
    pub fn new(config: DownloadConfig) -> SupervisorResult<Self> {
        let head_client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout())
            .redirect(redirect::Policy::none())
            .build()?;
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout())
            .redirect(redirect::Policy::limited(config.max_redirects as usize))
            .build()?;

        Ok(Self {
            head_client,
            client,
            config,
        })
    }

    /// Path of the in-progress file for `filename`
    pub fn partial_path(dest_dir: &Path, filename: &str) -> PathBuf {
        dest_dir.join(format!("{}{}", filename, PARTIAL_SUFFIX))
    }

    /// Fetch `url` into `dest_dir/filename`, resuming a previous attempt
    ///
    /// A partial file larger than the advertised size is deleted and the
    /// download starts over from zero. The final file only appears once its
    /// size matches the expected total.
    pub async fn download(
        &self,
        url: &str,
        dest_dir: &Path,
        filename: &str,
        progress: Option<&mpsc::Sender<DownloadProgress>>,
    ) -> SupervisorResult<DownloadOutcome> {
        tokio::fs::create_dir_all(dest_dir).await?;
        let dest = dest_dir.join(filename);
        let partial = Self::partial_path(dest_dir, filename);

        let (url, advertised) = self.resolve(url).await?;
        if advertised.is_none() {
            tracing::warn!(url = %url, "Content-Length unknown, resume disabled");
        }

        let mut offset = 0u64;
        if let (Some(total), Ok(meta)) = (advertised, tokio::fs::metadata(&partial).await) {
            let size = meta.len();
            if size > total {
                tracing::warn!(
                    partial = ?partial,
                    size,
                    total,
                    "Partial download larger than artifact, deleting and restarting"
                );
                tokio::fs::remove_file(&partial).await?;
            } else if size == total {
                tracing::info!(filename = %filename, "Partial download already complete");
                tokio::fs::rename(&partial, &dest).await?;
                send_progress(progress, progress_for(filename, total, total, true));
                crate::metrics::record_download_completed(true);
                return Ok(DownloadOutcome {
                    path: dest,
                    bytes: total,
                    resumed: true,
                });
            } else {
                offset = size;
                tracing::info!(
                    filename = %filename,
                    offset,
                    total,
                    percent = percent(offset, total),
                    "Resuming download"
                );
            }
        }

        let mut request = self.client.get(url.clone());
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={}-", offset));
        }
        let header_timeout = self.config.response_header_timeout();
        let response = tokio::time::timeout(header_timeout, request.send())
            .await
            .map_err(|_| SupervisorError::Timeout(header_timeout))??;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SupervisorError::Upstream {
                status: status.as_u16(),
                body,
            });
        }
        if offset > 0 && status != StatusCode::PARTIAL_CONTENT {
            tracing::warn!(status = status.as_u16(), "Server ignored range request, restarting from zero");
            offset = 0;
        }

        let total = advertised
            .or_else(|| response.content_length().map(|len| len + offset))
            .unwrap_or(0);
        let resumed = offset > 0;

        let file = if resumed {
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(&partial)
                .await?
        } else {
            tokio::fs::File::create(&partial).await?
        };
        let mut out = BufWriter::with_capacity(self.config.chunk_size.max(1), file);

        tracing::info!(filename = %filename, url = %url, total, offset, "Download started");

        let step = f64::from(self.config.log_step_percent.max(1));
        let mut next_log = if total > 0 {
            (percent(offset, total) / step).floor() * step + step
        } else {
            f64::MAX
        };
        let mut downloaded = offset;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(source) => {
                    out.flush().await?;
                    tracing::warn!(
                        filename = %filename,
                        downloaded,
                        total,
                        partial = ?partial,
                        error = %source,
                        "Download interrupted, partial file kept"
                    );
                    return Err(SupervisorError::DownloadInterrupted {
                        filename: filename.to_string(),
                        downloaded,
                        total,
                        partial,
                        source,
                    });
                }
            };

            out.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            crate::metrics::record_download_bytes(chunk.len() as u64);

            if total > 0 {
                let pct = percent(downloaded, total);
                if pct >= next_log {
                    tracing::info!(filename = %filename, percent = pct.floor(), downloaded, total, "Download progress");
                    next_log = (pct / step).floor() * step + step;
                }
                send_progress(progress, progress_for(filename, downloaded, total, resumed));
            }
        }

        out.flush().await?;
        drop(out);

        if total > 0 && downloaded != total {
            if downloaded > total {
                tracing::warn!(partial = ?partial, downloaded, total, "Download overran expected size, deleting");
                tokio::fs::remove_file(&partial).await?;
                return Err(SupervisorError::DownloadCorrupt {
                    partial,
                    actual: downloaded,
                    expected: total,
                });
            }
            tracing::warn!(
                filename = %filename,
                downloaded,
                total,
                partial = ?partial,
                "Download ended early, partial file kept"
            );
            return Err(SupervisorError::DownloadIncomplete {
                filename: filename.to_string(),
                downloaded,
                total,
                partial,
            });
        }
        tokio::fs::rename(&partial, &dest).await?;

        tracing::info!(filename = %filename, bytes = downloaded, resumed, "Download complete");
        crate::metrics::record_download_completed(resumed);

        Ok(DownloadOutcome {
            path: dest,
            bytes: downloaded,
            resumed,
        })
    }

    /// Follow HEAD redirects by hand, returning the final URL and its size
    pub async fn resolve(&self, url: &str) -> SupervisorResult<(Url, Option<u64>)> {
        let mut current = Url::parse(url)
            .map_err(|e| SupervisorError::InvalidResponse(format!("invalid URL {}: {}", url, e)))?;

        for _ in 0..self.config.max_redirects {
            let response = match self.head_client.head(current.clone()).send().await {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(url = %current, error = %e, "HEAD request failed");
                    return Ok((current, None));
                }
            };

            let status = response.status();
            if status.is_redirection() {
                let Some(location) = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                else {
                    tracing::warn!(url = %current, "Redirect without Location header");
                    return Ok((current, None));
                };
                let next = current.join(location).map_err(|e| {
                    SupervisorError::InvalidResponse(format!("bad redirect {}: {}", location, e))
                })?;
                tracing::debug!(status = status.as_u16(), from = %current, to = %next, "Following redirect");
                current = next;
                continue;
            }

            if !status.is_success() {
                tracing::warn!(url = %current, status = status.as_u16(), "HEAD request rejected");
                return Ok((current, None));
            }

            // HEAD bodies are empty, so read the header rather than the body length
            let total = response
                .headers()
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|len| *len > 0);
            tracing::debug!(url = %current, total = ?total, "Resolved download URL");
            return Ok((current, total));
        }

        Err(SupervisorError::InvalidResponse(format!(
            "more than {} redirects for {}",
            self.config.max_redirects, url
        )))
    }
}

fn percent(downloaded: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    downloaded as f64 / total as f64 * 100.0
}

fn progress_for(filename: &str, downloaded: u64, total: u64, resumed: bool) -> DownloadProgress {
    DownloadProgress {
        downloaded,
        total,
        percent: percent(downloaded, total),
        filename: filename.to_string(),
        resumed,
    }
}

/// Drop the update when the receiver is behind
fn send_progress(sender: Option<&mpsc::Sender<DownloadProgress>>, progress: DownloadProgress) {
    if let Some(sender) = sender {
        let _ = sender.try_send(progress);
    }
}
