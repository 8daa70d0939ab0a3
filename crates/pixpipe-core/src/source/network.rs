//! Network transport.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;

use crate::config::NetworkConfig;
use crate::error::PipelineError;

/// An accepted response: the advertised length and a stream of body chunks.
pub struct FetchResponse {
    pub content_length: Option<u64>,
    pub body: BoxStream<'static, io::Result<Vec<u8>>>,
}

/// Abstracts the transport. Retries, if any, belong here.
#[async_trait]
pub trait NetworkFetcher: Send + Sync {
    async fn fetch(&self, uri: &str) -> Result<FetchResponse, PipelineError>;
}

/// `reqwest`-backed fetcher.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: &NetworkConfig) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| PipelineError::Network {
                uri: String::new(),
                status_code: None,
                message: format!("Failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl NetworkFetcher for HttpFetcher {
    async fn fetch(&self, uri: &str) -> Result<FetchResponse, PipelineError> {
        let resp = self
            .client
            .get(uri)
            .send()
            .await
            .map_err(|e| PipelineError::Network {
                uri: uri.to_string(),
                status_code: None,
                message: format!("Request failed: {e}"),
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(PipelineError::Network {
                uri: uri.to_string(),
                status_code: Some(status.as_u16()),
                message: format!("HTTP {status}"),
            });
        }

        let content_length = resp.content_length();
        let body = resp
            .bytes_stream()
            .map(|chunk| {
                chunk
                    .map(|bytes| bytes.to_vec())
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
            })
            .boxed();

        Ok(FetchResponse {
            content_length,
            body,
        })
    }
}
