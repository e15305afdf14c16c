use crate::error::{Error, Result};

pub const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";

/// Total length of a handshake on the wire
pub const HANDSHAKE_LEN: usize = 68;

/// Handshake message for peer wire protocol
/// Format: <pstrlen><pstr><reserved><info_hash><peer_id>
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self { info_hash, peer_id }
    }

    /// Serialize handshake to bytes
    /// Total: 1 + 19 + 8 + 20 + 20 = 68 bytes
    pub fn to_bytes(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];

        buf[0] = PROTOCOL_STRING.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL_STRING);
        // 20..28 reserved, left zero
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);

        buf
    }

    /// Deserialize handshake from bytes; reserved bits are ignored
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HANDSHAKE_LEN {
            return Err(Error::Protocol("Handshake too short".to_string()));
        }

        let pstrlen = data[0] as usize;
        if pstrlen != PROTOCOL_STRING.len() {
            return Err(Error::Protocol(
                "Invalid protocol string length".to_string(),
            ));
        }

        if &data[1..1 + pstrlen] != PROTOCOL_STRING {
            return Err(Error::Protocol("Invalid protocol string".to_string()));
        }

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        Ok(Handshake { info_hash, peer_id })
    }

    /// Check the remote's handshake against the torrent we are downloading
    pub fn validate(&self, expected_info_hash: &[u8; 20]) -> Result<()> {
        if &self.info_hash != expected_info_hash {
            return Err(Error::HandshakeMismatch {
                expected: hex::encode(expected_info_hash),
                received: hex::encode(self.info_hash),
            });
        }
        Ok(())
    }
}
