use super::{AnnounceRequest, AnnounceResponse, Tracker};
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;
use url::Url;

/// HTTP(S) tracker at one announce URL
pub struct HttpTracker {
    client: Client,
    url: Url,
}

impl HttpTracker {
    /// `client` carries the request timeout and may be shared between trackers
    pub fn new(url: Url, client: Client) -> Self {
        Self { client, url }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Tracker for HttpTracker {
    async fn announce(&self, request: &AnnounceRequest) -> Result<AnnounceResponse> {
        let url = request.to_url(&self.url);
        debug!("Tracker request URL: {}", url);

        let response = self.client.get(url).send().await?;
        let status = response.status();
        let body = response.bytes().await?;

        debug!("Tracker response status: {}, body length: {}", status, body.len());

        if !status.is_success() {
            return Err(Error::Tracker(format!("HTTP error: {}", status)));
        }

        AnnounceResponse::from_bytes(&body)
    }
}
