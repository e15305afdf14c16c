use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid torrent: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Handshake info hash mismatch (expected {expected}, got {received})")]
    HandshakeMismatch { expected: String, received: String },

    #[error("Piece {index} failed hash verification")]
    Integrity { index: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection timed out")]
    Timeout,

    #[error("Tracker error: {0}")]
    Tracker(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Bencode error: {0}")]
    Bencode(#[from] serde_bencode::Error),

    #[error("No peers left to download from")]
    PeersExhausted,

    #[error("Download cancelled")]
    Cancelled,
}

impl Error {
    /// Errors that end a single peer connection and never the whole download.
    pub fn is_peer_local(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_)
                | Error::HandshakeMismatch { .. }
                | Error::Integrity { .. }
                | Error::Io(_)
                | Error::Timeout
        )
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::Parse(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}

pub type Result<T> = std::result::Result<T, Error>;
