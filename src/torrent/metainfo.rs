use super::Pieces;
use crate::error::{Error, Result};
use serde::Deserialize;
use serde_bencode::value::Value;
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};
use url::Url;

/// Immutable description of the content being downloaded.
///
/// Construction checks that the digest count matches the number of pieces
/// `total_length` splits into, so every later index computation can trust it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentInfo {
    /// Number of bytes in each piece (the last one may be shorter)
    pub piece_length: u64,
    /// Length of the whole content
    pub total_length: u64,
    /// SHA1 digest per piece
    pub pieces: Pieces,
    /// SHA1 of the bencoded info dictionary
    pub info_hash: [u8; 20],
}

impl TorrentInfo {
    pub fn new(
        piece_length: u64,
        total_length: u64,
        pieces: Pieces,
        info_hash: [u8; 20],
    ) -> Result<Self> {
        if piece_length == 0 {
            return Err(Error::Parse("Piece length must be positive".to_string()));
        }
        if pieces.is_empty() || total_length == 0 {
            return Err(Error::Parse("Torrent has no content".to_string()));
        }

        let expected = total_length.div_ceil(piece_length);
        if expected != pieces.len() as u64 {
            return Err(Error::Parse(format!(
                "Expected {} piece hashes, found {}",
                expected,
                pieces.len()
            )));
        }

        Ok(Self {
            piece_length,
            total_length,
            pieces,
            info_hash,
        })
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Length of piece `index`; the final piece carries the remainder
    pub fn piece_len(&self, index: usize) -> u64 {
        if index + 1 == self.piece_count() {
            let remainder = self.total_length % self.piece_length;
            if remainder == 0 {
                self.piece_length
            } else {
                remainder
            }
        } else {
            self.piece_length
        }
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }
}

/// Represents a file in a multi-file torrent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub path: Vec<String>,
    pub length: u64,
}

/// Everything a `.torrent` file tells us
#[derive(Debug, Clone)]
pub struct Metainfo {
    /// Suggested name for the file or directory
    pub name: String,
    /// Tracker URLs, `announce` first and then every `announce-list` tier
    pub trackers: Vec<Url>,
    pub files: Vec<FileInfo>,
    pub info: TorrentInfo,
}

#[derive(Deserialize)]
struct RawTorrent {
    announce: Option<String>,
    #[serde(rename = "announce-list")]
    announce_list: Option<Vec<Vec<String>>>,
    info: Value,
}

#[derive(Deserialize)]
struct RawInfo {
    name: String,
    #[serde(rename = "piece length")]
    piece_length: u64,
    pieces: ByteBuf,
    length: Option<u64>,
    files: Option<Vec<RawFile>>,
}

#[derive(Deserialize)]
struct RawFile {
    length: u64,
    path: Vec<String>,
}

impl Metainfo {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let raw: RawTorrent = serde_bencode::from_bytes(data)?;

        // The info dict is hashed as received; re-encoding the generic value
        // keeps keys we do not model.
        let info_bytes = serde_bencode::to_bytes(&raw.info)?;
        let info_hash: [u8; 20] = Sha1::digest(&info_bytes).into();
        let info: RawInfo = serde_bencode::from_bytes(&info_bytes)?;

        let files = match (info.length, info.files) {
            (Some(length), None) => vec![FileInfo {
                path: vec![info.name.clone()],
                length,
            }],
            (None, Some(files)) => {
                if files.iter().any(|f| f.path.is_empty()) {
                    return Err(Error::Parse("File entry with empty path".to_string()));
                }
                files
                    .into_iter()
                    .map(|f| FileInfo {
                        path: f.path,
                        length: f.length,
                    })
                    .collect()
            }
            _ => {
                return Err(Error::Parse(
                    "Exactly one of 'length' or 'files' must be present".to_string(),
                ))
            }
        };
        let total_length = files.iter().map(|f| f.length).sum();

        let pieces = Pieces::from_bytes(&info.pieces)?;
        let torrent_info = TorrentInfo::new(info.piece_length, total_length, pieces, info_hash)?;

        Ok(Self {
            name: info.name,
            trackers: collect_trackers(raw.announce, raw.announce_list),
            files,
            info: torrent_info,
        })
    }
}

fn collect_trackers(announce: Option<String>, tiers: Option<Vec<Vec<String>>>) -> Vec<Url> {
    let mut trackers: Vec<Url> = Vec::new();
    let candidates = announce
        .into_iter()
        .chain(tiers.into_iter().flatten().flatten());

    for candidate in candidates {
        match Url::parse(&candidate) {
            Ok(url) if !trackers.contains(&url) => trackers.push(url),
            Ok(_) => {}
            Err(e) => tracing::debug!("Skipping tracker {:?}: {}", candidate, e),
        }
    }

    trackers
}
