use crate::error::{Error, Result};
use crate::tracker::generate_peer_id;
use std::time::Duration;

/// Standard block size (16 KB)
pub const DEFAULT_BLOCK_SIZE: u32 = 16 * 1024;

/// Largest request peers are expected to honour (128 KB)
pub const MAX_BLOCK_SIZE: u32 = 128 * 1024;

/// Tuning knobs for a single download.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Our 20-byte peer id, sent in handshakes and announces
    pub peer_id: [u8; 20],
    /// Port reported to the tracker
    pub listen_port: u16,
    /// Upper bound on simultaneous peer connections
    pub max_peers: usize,
    /// Length of a requested block; the last block of a piece may be shorter
    pub block_size: u32,
    /// Outstanding requests allowed per peer outside endgame
    pub pipeline_depth: usize,
    /// Peers allowed to hold the same block during endgame
    pub max_duplicate_requests: usize,
    pub request_timeout: Duration,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    pub keep_alive_interval: Duration,
    /// Floor applied to the interval a tracker asks for
    pub min_announce_interval: Duration,
    /// An announce still unanswered after this long counts as failed
    pub announce_timeout: Duration,
    /// Consecutive failed announces tolerated before the download fails
    pub tracker_retries: u32,
    /// Attempts per piece write before the download fails
    pub storage_retries: u32,
    /// Hash failures a peer may contribute to before it is banned
    pub max_peer_strikes: u32,
    /// Consecutive hash failures before progress reports a stall
    pub stall_threshold: u32,
    /// Probe storage for already-written pieces before dialing peers
    pub resume: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            peer_id: generate_peer_id(),
            listen_port: 6881,
            max_peers: 50,
            block_size: DEFAULT_BLOCK_SIZE,
            pipeline_depth: 5,
            max_duplicate_requests: 5,
            request_timeout: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(10),
            keep_alive_interval: Duration::from_secs(90),
            min_announce_interval: Duration::from_secs(30),
            announce_timeout: Duration::from_secs(60),
            tracker_retries: 3,
            storage_retries: 3,
            max_peer_strikes: 3,
            stall_threshold: 10,
            resume: true,
        }
    }
}

impl DownloadConfig {
    /// Reject settings the engine cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 || self.block_size > MAX_BLOCK_SIZE {
            return Err(Error::Config(format!(
                "block size {} outside 1..={}",
                self.block_size, MAX_BLOCK_SIZE
            )));
        }
        if self.announce_timeout.is_zero() {
            return Err(Error::Config("announce timeout must be positive".to_string()));
        }
        Ok(())
    }
}
