mod metainfo;
mod piece;

pub use metainfo::{FileInfo, Metainfo, TorrentInfo};
pub use piece::{PieceHash, Pieces};

use crate::error::Result;
use std::path::Path;
use tokio::fs;

/// Load and parse a .torrent file
pub async fn load_torrent_file<P: AsRef<Path>>(path: P) -> Result<Metainfo> {
    let data = fs::read(path).await?;
    parse(&data)
}

/// Parse torrent data from bytes
pub fn parse(data: &[u8]) -> Result<Metainfo> {
    Metainfo::from_bytes(data)
}
