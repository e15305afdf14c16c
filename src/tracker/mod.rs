mod http;
mod list;
mod request;
mod response;
mod udp;

pub use http::HttpTracker;
pub use list::TrackerList;
pub use request::{AnnounceRequest, TrackerEvent};
pub use response::AnnounceResponse;
pub use udp::UdpTracker;

use crate::error::Result;
use async_trait::async_trait;
use rand::Rng;

/// Source of peer addresses for one torrent
#[async_trait]
pub trait Tracker: Send + Sync {
    async fn announce(&self, request: &AnnounceRequest) -> Result<AnnounceResponse>;
}

/// Generate a random peer ID
/// Format: -RS0100-<12 random alphanumerics>
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    peer_id[0..8].copy_from_slice(b"-RS0100-");

    let mut rng = rand::thread_rng();
    for byte in &mut peer_id[8..] {
        *byte = rng.sample(rand::distributions::Alphanumeric);
    }

    peer_id
}
