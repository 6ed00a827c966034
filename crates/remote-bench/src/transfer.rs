use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::StatusCode;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("invalid download url for {0}: {1}")]
    Url(String, url::ParseError),
    #[error("failed to download file from {url}: {source}")]
    Http { url: Url, source: reqwest::Error },
    #[error("failed to download file from {url} (status code: {status})")]
    Status { url: Url, status: StatusCode },
    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
}

/// Content encoding used to push files through a plain shell session.
pub fn encode(content: &[u8]) -> String {
    STANDARD.encode(content)
}

#[cfg(test)]
fn decode(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(encoded.trim())
}

/// Where a file under the served directory is reachable.
pub fn download_url(
    host: &str,
    port: u16,
    served_dir: &str,
    remote_file: &str,
) -> Result<Url, TransferError> {
    let served_dir = served_dir.trim_end_matches('/');
    let relative = remote_file
        .strip_prefix(served_dir)
        .map(|r| r.trim_start_matches('/'))
        .unwrap_or(remote_file);
    let base = format!("http://{}:{}/", host, port);
    Url::parse(&base)
        .and_then(|base| base.join(relative))
        .map_err(|e| TransferError::Url(host.to_owned(), e))
}

/// Point-to-point file fetch.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn get(&self, url: &Url) -> Result<Vec<u8>, TransferError>;
}

pub struct HttpFetch {
    client: reqwest::Client,
}

impl HttpFetch {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }
}

#[async_trait]
impl Fetch for HttpFetch {
    async fn get(&self, url: &Url) -> Result<Vec<u8>, TransferError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|source| TransferError::Http {
                url: url.clone(),
                source,
            })?;
        if response.status() != StatusCode::OK {
            return Err(TransferError::Status {
                url: url.clone(),
                status: response.status(),
            });
        }
        let body = response
            .bytes()
            .await
            .map_err(|source| TransferError::Http {
                url: url.clone(),
                source,
            })?;
        Ok(body.to_vec())
    }
}

/// Fetch `url` and store it at `local_file`.
pub async fn download<F: Fetch + ?Sized>(
    fetch: &F,
    url: &Url,
    local_file: &str,
) -> Result<(), TransferError> {
    let body = fetch.get(url).await?;
    tokio::fs::write(local_file, body)
        .await
        .map_err(|source| TransferError::Write {
            path: local_file.to_owned(),
            source,
        })
}
