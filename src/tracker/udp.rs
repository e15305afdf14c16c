use super::response::parse_compact;
use super::{AnnounceRequest, AnnounceResponse, Tracker, TrackerEvent};
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time;
use tracing::debug;
use url::{Host, Url};

// Reference: https://www.bittorrent.org/beps/bep_0015.html

const PROTOCOL_ID: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

/// Largest reply accepted, room for about 1300 compact peers
const MAX_DATAGRAM: usize = 8192;

/// UDP tracker at one announce URL.
///
/// Every announce runs a fresh connect exchange, then the announce itself;
/// each exchange must be answered within `timeout`.
pub struct UdpTracker {
    url: Url,
    timeout: Duration,
}

impl UdpTracker {
    pub fn new(url: Url, timeout: Duration) -> Self {
        Self { url, timeout }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn resolve(&self) -> Result<SocketAddr> {
        let port = self
            .url
            .port()
            .ok_or_else(|| Error::Tracker(format!("No port in {}", self.url)))?;

        match self.url.host() {
            Some(Host::Ipv4(ip)) => Ok(SocketAddr::new(ip.into(), port)),
            Some(Host::Ipv6(ip)) => Ok(SocketAddr::new(ip.into(), port)),
            Some(Host::Domain(domain)) => lookup_host((domain, port))
                .await?
                .next()
                .ok_or_else(|| Error::Tracker(format!("Cannot resolve {}", domain))),
            None => Err(Error::Tracker(format!("No host in {}", self.url))),
        }
    }

    /// Send `packet` and wait for the reply carrying `transaction_id`.
    /// Returns the payload after the action and transaction id.
    async fn exchange(
        &self,
        socket: &UdpSocket,
        packet: &[u8],
        action: u32,
        transaction_id: u32,
    ) -> Result<Vec<u8>> {
        socket.send(packet).await?;

        time::timeout(self.timeout, recv_reply(socket, action, transaction_id))
            .await
            .map_err(|_| {
                Error::Tracker(format!(
                    "{} did not answer within {}s",
                    self.url,
                    self.timeout.as_secs_f32()
                ))
            })?
    }
}

async fn recv_reply(socket: &UdpSocket, action: u32, transaction_id: u32) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let n = socket.recv(&mut buf).await?;
        let mut reply = &buf[..n];
        if reply.len() < 8 {
            debug!("Ignoring {} byte datagram", n);
            continue;
        }

        let got = reply.get_u32();
        if reply.get_u32() != transaction_id {
            debug!("Ignoring datagram for another transaction");
            continue;
        }

        if got == ACTION_ERROR {
            return Err(Error::Tracker(String::from_utf8_lossy(reply).into_owned()));
        }
        if got != action {
            return Err(Error::Tracker(format!(
                "Expected action {}, got {}",
                action, got
            )));
        }
        return Ok(reply.to_vec());
    }
}

fn event_code(event: Option<TrackerEvent>) -> u32 {
    match event {
        None => 0,
        Some(TrackerEvent::Completed) => 1,
        Some(TrackerEvent::Started) => 2,
        Some(TrackerEvent::Stopped) => 3,
    }
}

#[async_trait]
impl Tracker for UdpTracker {
    async fn announce(&self, request: &AnnounceRequest) -> Result<AnnounceResponse> {
        let addr = self.resolve().await?;
        let local = if addr.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(addr).await?;

        // connect
        let transaction_id = rand::random::<u32>();
        let mut packet = BytesMut::with_capacity(16);
        packet.put_u64(PROTOCOL_ID);
        packet.put_u32(ACTION_CONNECT);
        packet.put_u32(transaction_id);

        let reply = self
            .exchange(&socket, &packet, ACTION_CONNECT, transaction_id)
            .await?;
        if reply.len() < 8 {
            return Err(Error::Tracker("Connect reply too short".to_string()));
        }
        let mut id = &reply[..8];
        let connection_id = id.get_u64();
        debug!("Connected to {}", self.url);

        // announce
        let transaction_id = rand::random::<u32>();
        let mut packet = BytesMut::with_capacity(98);
        packet.put_u64(connection_id);
        packet.put_u32(ACTION_ANNOUNCE);
        packet.put_u32(transaction_id);
        packet.put_slice(&request.info_hash);
        packet.put_slice(&request.peer_id);
        packet.put_u64(request.downloaded);
        packet.put_u64(request.left);
        packet.put_u64(request.uploaded);
        packet.put_u32(event_code(request.event));
        packet.put_u32(0); // IP address, default
        packet.put_u32(rand::random());
        packet.put_i32(-1); // num_want, default
        packet.put_u16(request.port);

        let reply = self
            .exchange(&socket, &packet, ACTION_ANNOUNCE, transaction_id)
            .await?;
        if reply.len() < 12 {
            return Err(Error::Tracker("Announce reply too short".to_string()));
        }

        let mut header = &reply[..12];
        let interval = header.get_u32();
        let leechers = header.get_u32();
        let seeders = header.get_u32();
        let peers = parse_compact(&reply[12..])
            .ok_or_else(|| Error::Tracker("Peer list is not a multiple of 6 bytes".to_string()))?;
        debug!(
            "{} reports {} seeders, {} leechers",
            self.url, seeders, leechers
        );

        Ok(AnnounceResponse {
            peers: peers.into_iter().filter(|peer| peer.port() != 0).collect(),
            interval: Duration::from_secs(interval.into()),
        })
    }
}
