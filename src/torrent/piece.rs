use crate::error::{Error, Result};
use std::fmt;

/// A 20-byte SHA1 digest of one piece
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PieceHash([u8; 20]);

impl PieceHash {
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        let hash: [u8; 20] = slice
            .try_into()
            .map_err(|_| Error::Parse("Piece hash must be 20 bytes".to_string()))?;
        Ok(Self(hash))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl AsRef<[u8]> for PieceHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for PieceHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PieceHash({})", hex::encode(self.0))
    }
}

/// Ordered piece digests; index `i` is the digest of piece `i`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pieces {
    hashes: Vec<PieceHash>,
}

impl Pieces {
    /// Split the concatenated `pieces` string of a torrent into digests
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() % 20 != 0 {
            return Err(Error::Parse(
                "Pieces length must be multiple of 20".to_string(),
            ));
        }

        let hashes = data
            .chunks_exact(20)
            .map(PieceHash::from_slice)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { hashes })
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&PieceHash> {
        self.hashes.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PieceHash> {
        self.hashes.iter()
    }
}

impl From<Vec<PieceHash>> for Pieces {
    fn from(hashes: Vec<PieceHash>) -> Self {
        Self { hashes }
    }
}

impl FromIterator<PieceHash> for Pieces {
    fn from_iter<I: IntoIterator<Item = PieceHash>>(iter: I) -> Self {
        Self {
            hashes: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pieces_split() {
        let mut raw = vec![1u8; 20];
        raw.extend_from_slice(&[2u8; 20]);

        let pieces = Pieces::from_bytes(&raw).unwrap();
        assert_eq!(pieces.len(), 2);
        assert_eq!(pieces.get(1).unwrap().as_bytes(), &[2u8; 20]);
    }

    #[test]
    fn test_pieces_rejects_ragged_input() {
        assert!(Pieces::from_bytes(&[0u8; 21]).is_err());
    }
}
