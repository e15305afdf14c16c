use super::{AnnounceRequest, AnnounceResponse, HttpTracker, Tracker, UdpTracker};
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Every announce URL of a torrent, each served by the client for its
/// scheme. Announces try the trackers in order until one answers.
pub struct TrackerList {
    trackers: Vec<(Url, Box<dyn Tracker>)>,
}

impl TrackerList {
    /// URLs with an unsupported scheme are skipped. `timeout` bounds each
    /// request to a single tracker.
    pub fn new(urls: Vec<Url>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;

        let mut trackers: Vec<(Url, Box<dyn Tracker>)> = Vec::new();
        for url in urls {
            let tracker: Box<dyn Tracker> = match url.scheme() {
                "http" | "https" => Box::new(HttpTracker::new(url.clone(), client.clone())),
                "udp" => Box::new(UdpTracker::new(url.clone(), timeout)),
                _ => {
                    debug!("Skipping unsupported tracker: {}", url);
                    continue;
                }
            };
            trackers.push((url, tracker));
        }

        Ok(Self { trackers })
    }

    pub fn urls(&self) -> Vec<&Url> {
        self.trackers.iter().map(|(url, _)| url).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }
}

#[async_trait]
impl Tracker for TrackerList {
    async fn announce(&self, request: &AnnounceRequest) -> Result<AnnounceResponse> {
        let mut last_error = None;

        for (url, tracker) in &self.trackers {
            info!("Announcing to tracker: {}", url);
            match tracker.announce(request).await {
                Ok(response) => {
                    info!(
                        "Received {} peers from tracker (interval: {}s)",
                        response.peers.len(),
                        response.interval.as_secs()
                    );
                    return Ok(response);
                }
                Err(e) => {
                    warn!("Tracker {} failed: {}", url, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| Error::Tracker("No supported tracker to announce to".to_string())))
    }
}
