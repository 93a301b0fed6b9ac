//! Network seam: pulls the bytes behind a request key

use crate::error::{FetchError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

/// Body of a fetched resource, delivered in chunks
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Source of remote bytes for a request key
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn fetch(&self, key: &str) -> Result<ByteStream>;
}

/// HTTP client treating request keys as URLs
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Create a transport with reqwest defaults
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    /// Create a transport with an overall per-request timeout
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, key: &str) -> Result<ByteStream> {
        debug!(url = %key, "Fetching image");

        let response = self.client.get(key).send().await?;

        if !response.status().is_success() {
            warn!(status = %response.status(), url = %key, "Failed to fetch image");
            return Err(FetchError::Status(response.status().as_u16()));
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(FetchError::from))
            .boxed())
    }
}
