//! Piece scheduling and peer connection engine for downloading a torrent
//! from a swarm of BitTorrent peers.
//!
//! [`start_download`] takes parsed torrent metadata, a [`Tracker`] that
//! hands out peer addresses and a [`StorageSink`] for verified pieces, and
//! returns a [`DownloadHandle`] to watch progress and cancel.

pub mod client;
pub mod config;
pub mod error;
pub mod peer;
pub mod piece;
pub mod storage;
pub mod torrent;
pub mod tracker;

pub use client::{start_download, DownloadHandle, Progress};
pub use config::DownloadConfig;
pub use error::{Error, Result};
pub use storage::{FileStorage, StorageSink};
pub use torrent::{Metainfo, TorrentInfo};
pub use tracker::{HttpTracker, Tracker, TrackerList, UdpTracker};
