use crate::error::{Error, Result};
use serde::{de, Deserialize, Deserializer};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Peers and re-announce interval from a successful announce
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceResponse {
    pub peers: Vec<SocketAddr>,
    /// How long the tracker wants us to wait before announcing again
    pub interval: Duration,
}

impl AnnounceResponse {
    /// Decode a bencoded tracker reply
    pub fn from_bytes(body: &[u8]) -> Result<Self> {
        let raw: RawResponse = serde_bencode::from_bytes(body)?;

        if let Some(reason) = raw.failure_reason {
            return Err(Error::Tracker(reason));
        }

        let interval = raw
            .interval
            .ok_or_else(|| Error::Tracker("Missing 'interval' field".to_string()))?;
        let peers = raw
            .peers
            .ok_or_else(|| Error::Tracker("Missing 'peers' field".to_string()))?;

        Ok(Self {
            peers,
            interval: Duration::from_secs(interval),
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawResponse {
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    interval: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_peers")]
    peers: Option<Vec<SocketAddr>>,
}

/// Parse peers from compact format (6 bytes each: 4 IP + 2 port)
pub(super) fn parse_compact(data: &[u8]) -> Option<Vec<SocketAddr>> {
    if data.len() % 6 != 0 {
        return None;
    }

    let peers = data
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect();
    Some(peers)
}

// Trackers may answer with the compact string even when we asked for the
// dictionary model and vice versa, so both are accepted.
fn deserialize_peers<'de, D>(deserializer: D) -> std::result::Result<Option<Vec<SocketAddr>>, D::Error>
where
    D: Deserializer<'de>,
{
    struct PeerVisitor;

    impl<'de> de::Visitor<'de> for PeerVisitor {
        type Value = Option<Vec<SocketAddr>>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a compact peer string or a list of peer dictionaries")
        }

        fn visit_bytes<E>(self, v: &[u8]) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            parse_compact(v)
                .map(Some)
                .ok_or_else(|| E::custom("compact peer string is not a multiple of 6"))
        }

        fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            #[derive(Deserialize)]
            struct PeerItem {
                ip: String,
                port: u16,
            }

            let mut peers = Vec::new();
            while let Some(peer) = seq.next_element::<PeerItem>()? {
                // hostnames are skipped
                if let Ok(ip) = peer.ip.parse::<IpAddr>() {
                    peers.push(SocketAddr::new(ip, peer.port));
                }
            }
            Ok(Some(peers))
        }
    }

    deserializer.deserialize_any(PeerVisitor)
}
