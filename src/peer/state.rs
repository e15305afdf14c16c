use super::PeerMessage;
use crate::config::DownloadConfig;
use crate::error::Error;
use crate::piece::{has_piece, Bitfield, Block};
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Lifecycle of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Handshaking,
    /// Handshake done, nothing outstanding
    Idle,
    /// At least one request outstanding
    Active,
    Closing,
    Closed,
}

/// Inputs to the state machine
#[derive(Debug)]
pub enum Event {
    /// Transport established
    Connected,
    /// Remote handshake accepted
    HandshakeOk { peer_id: [u8; 20] },
    Message(PeerMessage),
    /// Blocks handed out by the piece manager after `Action::RequestWork`
    Assigned(Vec<Block>),
    /// Whether the remote has anything we still need
    Interest(bool),
    /// Another peer delivered this block first
    Cancel(Block),
    /// We completed a piece
    LocalHave(u32),
    Tick,
    Close,
}

/// Side effects requested by the state machine
#[derive(Debug)]
pub enum Action {
    Send(PeerMessage),
    /// Register the remote's initial pieces with the piece manager
    Bitfield(Bitfield),
    /// Register one more remote piece with the piece manager
    Have(u32),
    /// Forward received bytes to the piece manager
    Block { block: Block, data: Bytes },
    /// Return unfulfilled requests to the piece manager
    Release(Vec<Block>),
    /// Ask the piece manager for up to this many blocks
    RequestWork(usize),
    /// The remote's pieces changed; re-evaluate interest
    CheckInterest,
    Close(Error),
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    pipeline_depth: usize,
    request_timeout: Duration,
    idle_timeout: Duration,
    keep_alive_interval: Duration,
}

/// Everything one connection knows about its peer.
///
/// `handle` is a pure transition function: it never performs I/O, so every
/// path can be driven with synthetic events.
#[derive(Debug)]
pub struct PeerState {
    addr: SocketAddr,
    peer_id: Option<[u8; 20]>,
    conn: ConnState,
    piece_count: usize,
    /// Pieces the remote advertised
    have: Bitfield,
    /// Always true: we never serve blocks
    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    /// Our requests awaiting a `piece`, with the time they were sent
    outstanding: HashMap<Block, Instant>,
    seen_message: bool,
    last_received: Instant,
    last_sent: Instant,
    limits: Limits,
}

impl PeerState {
    pub fn new(addr: SocketAddr, piece_count: usize, config: &DownloadConfig, now: Instant) -> Self {
        Self {
            addr,
            peer_id: None,
            conn: ConnState::Connecting,
            piece_count,
            have: Bitfield::repeat(false, piece_count),
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            outstanding: HashMap::new(),
            seen_message: false,
            last_received: now,
            last_sent: now,
            limits: Limits {
                pipeline_depth: config.pipeline_depth.max(1),
                request_timeout: config.request_timeout,
                idle_timeout: config.idle_timeout,
                keep_alive_interval: config.keep_alive_interval,
            },
        }
    }

    pub fn handle(&mut self, event: Event, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();

        match event {
            Event::Connected => {
                if self.conn == ConnState::Connecting {
                    self.conn = ConnState::Handshaking;
                }
            }
            Event::HandshakeOk { peer_id } => {
                if self.conn == ConnState::Handshaking {
                    self.peer_id = Some(peer_id);
                    self.conn = ConnState::Idle;
                    self.last_received = now;
                }
            }
            Event::Message(message) => {
                if self.is_open() {
                    self.last_received = now;
                    self.on_message(message, &mut actions);
                }
            }
            Event::Assigned(blocks) => self.on_assigned(blocks, now, &mut actions),
            Event::Interest(interested) => {
                if self.is_open() && interested != self.am_interested {
                    self.am_interested = interested;
                    let message = if interested {
                        PeerMessage::Interested
                    } else {
                        PeerMessage::NotInterested
                    };
                    self.send(message, now, &mut actions);
                    self.request_more(&mut actions);
                }
            }
            Event::Cancel(block) => {
                if self.outstanding.remove(&block).is_some() {
                    self.send(PeerMessage::Cancel { block }, now, &mut actions);
                    self.update_activity();
                    self.request_more(&mut actions);
                }
            }
            Event::LocalHave(piece_index) => {
                if self.is_open() {
                    self.send(PeerMessage::Have { piece_index }, now, &mut actions);
                    actions.push(Action::CheckInterest);
                }
            }
            Event::Tick => self.on_tick(now, &mut actions),
            Event::Close => {
                if self.conn != ConnState::Closed {
                    self.conn = ConnState::Closing;
                    self.release_all(&mut actions);
                }
            }
        }

        actions
    }

    fn on_message(&mut self, message: PeerMessage, actions: &mut Vec<Action>) {
        let first = !self.seen_message;
        if message != PeerMessage::KeepAlive {
            self.seen_message = true;
        }

        match message {
            PeerMessage::KeepAlive => {}
            PeerMessage::Choke => {
                if !self.peer_choking {
                    debug!("{} choked us", self.addr);
                    self.peer_choking = true;
                    // the remote drops pending requests when it chokes
                    self.release_all(actions);
                }
            }
            PeerMessage::Unchoke => {
                if self.peer_choking {
                    debug!("{} unchoked us", self.addr);
                    self.peer_choking = false;
                    self.request_more(actions);
                }
            }
            PeerMessage::Interested | PeerMessage::NotInterested => {
                debug!("{} sent {:?}; uploads are not served", self.addr, message);
            }
            PeerMessage::Have { piece_index } => {
                let index = piece_index as usize;
                if index >= self.piece_count {
                    self.fail(
                        Error::Protocol(format!("Have for piece {} out of range", piece_index)),
                        actions,
                    );
                } else if !self.have[index] {
                    self.have.set(index, true);
                    actions.push(Action::Have(piece_index));
                    actions.push(Action::CheckInterest);
                }
            }
            PeerMessage::Bitfield { bitfield } => {
                if !first {
                    self.fail(Error::Protocol("Unexpected bitfield".to_string()), actions);
                    return;
                }
                match self.parse_bitfield(&bitfield) {
                    Ok(have) => {
                        self.have = have.clone();
                        actions.push(Action::Bitfield(have));
                        actions.push(Action::CheckInterest);
                    }
                    Err(e) => self.fail(e, actions),
                }
            }
            PeerMessage::Request { block } | PeerMessage::Cancel { block } => {
                debug!("{} asked about {:?}; uploads are not served", self.addr, block);
            }
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                let block = Block::new(piece_index, offset, data.len() as u32);
                if self.outstanding.remove(&block).is_none() {
                    debug!("Unrequested block {:?} from {}", block, self.addr);
                }
                // the piece manager decides whether unrequested data is useful
                actions.push(Action::Block { block, data });
                self.update_activity();
                self.request_more(actions);
            }
        }
    }

    fn parse_bitfield(&self, raw: &[u8]) -> Result<Bitfield, Error> {
        if raw.len() != self.piece_count.div_ceil(8) {
            return Err(Error::Protocol(format!(
                "Bitfield of {} bytes for {} pieces",
                raw.len(),
                self.piece_count
            )));
        }

        let mut have = Bitfield::from_slice(raw);
        if have[self.piece_count..].any() {
            return Err(Error::Protocol("Bitfield has spare bits set".to_string()));
        }
        have.truncate(self.piece_count);
        Ok(have)
    }

    fn on_assigned(&mut self, blocks: Vec<Block>, now: Instant, actions: &mut Vec<Action>) {
        if blocks.is_empty() {
            return;
        }

        let mut refused = Vec::new();
        for block in blocks {
            let allowed = self.is_open()
                && !self.peer_choking
                && has_piece(&self.have, block.piece_index as usize)
                && self.outstanding.len() < self.limits.pipeline_depth;

            if allowed {
                self.outstanding.insert(block, now);
                self.send(PeerMessage::Request { block }, now, actions);
            } else {
                refused.push(block);
            }
        }

        if !refused.is_empty() {
            actions.push(Action::Release(refused));
        }
        self.update_activity();
    }

    fn on_tick(&mut self, now: Instant, actions: &mut Vec<Action>) {
        if !self.is_open() {
            return;
        }

        if now.saturating_duration_since(self.last_received) >= self.limits.idle_timeout {
            self.fail(Error::Timeout, actions);
            return;
        }

        let timeout = self.limits.request_timeout;
        let expired: Vec<Block> = self
            .outstanding
            .iter()
            .filter(|(_, sent_at)| now.saturating_duration_since(**sent_at) >= timeout)
            .map(|(block, _)| *block)
            .collect();
        for block in expired {
            debug!("Request {:?} to {} timed out", block, self.addr);
            self.outstanding.remove(&block);
            self.send(PeerMessage::Cancel { block }, now, actions);
        }
        self.update_activity();

        if now.saturating_duration_since(self.last_sent) >= self.limits.keep_alive_interval {
            self.send(PeerMessage::KeepAlive, now, actions);
        }

        self.request_more(actions);
    }

    fn request_more(&self, actions: &mut Vec<Action>) {
        let free = self
            .limits
            .pipeline_depth
            .saturating_sub(self.outstanding.len());
        if self.is_open() && !self.peer_choking && self.am_interested && free > 0 {
            actions.push(Action::RequestWork(free));
        }
    }

    fn send(&mut self, message: PeerMessage, now: Instant, actions: &mut Vec<Action>) {
        self.last_sent = now;
        actions.push(Action::Send(message));
    }

    fn release_all(&mut self, actions: &mut Vec<Action>) {
        if !self.outstanding.is_empty() {
            let blocks = self.outstanding.drain().map(|(block, _)| block).collect();
            actions.push(Action::Release(blocks));
        }
        self.update_activity();
    }

    fn fail(&mut self, error: Error, actions: &mut Vec<Action>) {
        self.conn = ConnState::Closing;
        self.release_all(actions);
        actions.push(Action::Close(error));
    }

    fn update_activity(&mut self) {
        if self.is_open() {
            self.conn = if self.outstanding.is_empty() {
                ConnState::Idle
            } else {
                ConnState::Active
            };
        }
    }

    fn is_open(&self) -> bool {
        matches!(self.conn, ConnState::Idle | ConnState::Active)
    }

    /// The transport is gone
    pub fn finish(&mut self) {
        self.conn = ConnState::Closed;
        self.outstanding.clear();
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn peer_id(&self) -> Option<&[u8; 20]> {
        self.peer_id.as_ref()
    }

    pub fn conn_state(&self) -> ConnState {
        self.conn
    }

    pub fn have(&self) -> &Bitfield {
        &self.have
    }

    pub fn is_choked(&self) -> bool {
        self.peer_choking
    }

    pub fn is_choking(&self) -> bool {
        self.am_choking
    }

    pub fn is_interested(&self) -> bool {
        self.am_interested
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(now: Instant) -> PeerState {
        let config = DownloadConfig {
            pipeline_depth: 3,
            ..DownloadConfig::default()
        };
        let mut state = PeerState::new(SocketAddr::from(([127, 0, 0, 1], 7000)), 10, &config, now);
        state.handle(Event::Connected, now);
        state.handle(Event::HandshakeOk { peer_id: [3u8; 20] }, now);
        state
    }

    fn sent(actions: &[Action]) -> Vec<&PeerMessage> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Send(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    /// Connected peer that advertised every piece, unchoked us and that we
    /// are interested in
    fn ready_peer(now: Instant) -> PeerState {
        let mut state = peer(now);
        state.handle(
            Event::Message(PeerMessage::Bitfield {
                bitfield: Bytes::from_static(&[0xFF, 0xC0]),
            }),
            now,
        );
        state.handle(Event::Interest(true), now);
        state.handle(Event::Message(PeerMessage::Unchoke), now);
        state
    }

    #[test]
    fn test_handshake_transitions() {
        let now = Instant::now();
        let config = DownloadConfig::default();
        let mut state = PeerState::new(SocketAddr::from(([127, 0, 0, 1], 7000)), 10, &config, now);
        assert_eq!(state.conn_state(), ConnState::Connecting);

        state.handle(Event::Connected, now);
        assert_eq!(state.conn_state(), ConnState::Handshaking);

        state.handle(Event::HandshakeOk { peer_id: [3u8; 20] }, now);
        assert_eq!(state.conn_state(), ConnState::Idle);
        assert_eq!(state.peer_id(), Some(&[3u8; 20]));
        assert!(state.is_choked());
        assert!(state.is_choking());
    }

    #[test]
    fn test_bitfield_registers_and_checks_interest() {
        let now = Instant::now();
        let mut state = peer(now);

        let actions = state.handle(
            Event::Message(PeerMessage::Bitfield {
                bitfield: Bytes::from_static(&[0b1000_0001, 0b0100_0000]),
            }),
            now,
        );

        assert!(matches!(&actions[0], Action::Bitfield(have) if have.count_ones() == 3));
        assert!(matches!(actions[1], Action::CheckInterest));
        assert!(has_piece(state.have(), 0));
        assert!(has_piece(state.have(), 9));
        assert!(!has_piece(state.have(), 1));
    }

    #[test]
    fn test_no_requests_while_choked() {
        let now = Instant::now();
        let mut state = peer(now);
        state.handle(
            Event::Message(PeerMessage::Bitfield {
                bitfield: Bytes::from_static(&[0xFF, 0xC0]),
            }),
            now,
        );

        let actions = state.handle(Event::Interest(true), now);
        assert_eq!(sent(&actions), vec![&PeerMessage::Interested]);
        assert!(!actions.iter().any(|a| matches!(a, Action::RequestWork(_))));

        // a stray assignment while choked goes straight back
        let block = Block::new(0, 0, 16384);
        let actions = state.handle(Event::Assigned(vec![block]), now);
        assert!(matches!(&actions[..], [Action::Release(blocks)] if blocks == &vec![block]));
        assert_eq!(state.outstanding(), 0);

        let actions = state.handle(Event::Message(PeerMessage::Unchoke), now);
        assert!(matches!(actions[..], [Action::RequestWork(3)]));
    }

    #[test]
    fn test_assignment_sends_requests_and_choke_releases() {
        let now = Instant::now();
        let mut state = ready_peer(now);

        let blocks = vec![Block::new(0, 0, 16384), Block::new(0, 16384, 16384)];
        let actions = state.handle(Event::Assigned(blocks.clone()), now);
        assert_eq!(sent(&actions).len(), 2);
        assert_eq!(state.conn_state(), ConnState::Active);

        let actions = state.handle(Event::Message(PeerMessage::Choke), now);
        match &actions[..] {
            [Action::Release(released)] => {
                let mut released = released.clone();
                released.sort();
                assert_eq!(released, blocks);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(state.conn_state(), ConnState::Idle);
    }

    #[test]
    fn test_pipeline_depth_is_bounded() {
        let now = Instant::now();
        let mut state = ready_peer(now);

        let blocks: Vec<Block> = (0..5).map(|i| Block::new(i, 0, 16384)).collect();
        let actions = state.handle(Event::Assigned(blocks), now);

        assert_eq!(sent(&actions).len(), 3);
        assert!(matches!(actions.last(), Some(Action::Release(extra)) if extra.len() == 2));
    }

    #[test]
    fn test_piece_forwards_block_and_refills() {
        let now = Instant::now();
        let mut state = ready_peer(now);
        let block = Block::new(2, 0, 4);
        state.handle(Event::Assigned(vec![block]), now);

        let actions = state.handle(
            Event::Message(PeerMessage::Piece {
                piece_index: 2,
                offset: 0,
                data: Bytes::from_static(b"data"),
            }),
            now,
        );

        assert!(matches!(&actions[0], Action::Block { block: b, .. } if *b == block));
        assert!(matches!(actions[1], Action::RequestWork(3)));
        assert_eq!(state.conn_state(), ConnState::Idle);
    }

    #[test]
    fn test_late_bitfield_is_protocol_error() {
        let now = Instant::now();
        let mut state = peer(now);
        state.handle(Event::Message(PeerMessage::Unchoke), now);

        let actions = state.handle(
            Event::Message(PeerMessage::Bitfield {
                bitfield: Bytes::from_static(&[0xFF, 0xC0]),
            }),
            now,
        );
        assert!(matches!(actions.last(), Some(Action::Close(Error::Protocol(_)))));
        assert_eq!(state.conn_state(), ConnState::Closing);
    }

    #[test]
    fn test_bitfield_after_keep_alive_accepted() {
        let now = Instant::now();
        let mut state = peer(now);
        state.handle(Event::Message(PeerMessage::KeepAlive), now);

        let actions = state.handle(
            Event::Message(PeerMessage::Bitfield {
                bitfield: Bytes::from_static(&[0xFF, 0xC0]),
            }),
            now,
        );
        assert!(matches!(&actions[0], Action::Bitfield(have) if have.count_ones() == 10));
        assert_eq!(state.conn_state(), ConnState::Idle);
    }

    #[test]
    fn test_bitfield_with_spare_bits_rejected() {
        let now = Instant::now();
        let mut state = peer(now);
        let actions = state.handle(
            Event::Message(PeerMessage::Bitfield {
                bitfield: Bytes::from_static(&[0xFF, 0xFF]),
            }),
            now,
        );
        assert!(matches!(actions.last(), Some(Action::Close(Error::Protocol(_)))));
    }

    #[test]
    fn test_have_out_of_range() {
        let now = Instant::now();
        let mut state = peer(now);
        let actions = state.handle(Event::Message(PeerMessage::Have { piece_index: 10 }), now);
        assert!(matches!(actions.last(), Some(Action::Close(Error::Protocol(_)))));
    }

    #[test]
    fn test_duplicate_have_counted_once() {
        let now = Instant::now();
        let mut state = peer(now);
        let first = state.handle(Event::Message(PeerMessage::Have { piece_index: 4 }), now);
        let second = state.handle(Event::Message(PeerMessage::Have { piece_index: 4 }), now);

        assert!(matches!(first[0], Action::Have(4)));
        assert!(second.is_empty());
    }

    #[test]
    fn test_request_timeout_cancels_and_refills() {
        let now = Instant::now();
        let mut state = ready_peer(now);
        let block = Block::new(1, 0, 16384);
        state.handle(Event::Assigned(vec![block]), now);

        // keep the connection alive so only the request expires
        let later = now + Duration::from_secs(61);
        state.handle(Event::Message(PeerMessage::KeepAlive), later);
        let actions = state.handle(Event::Tick, later);

        assert!(sent(&actions).contains(&&PeerMessage::Cancel { block }));
        assert!(matches!(actions.last(), Some(Action::RequestWork(3))));
        assert_eq!(state.outstanding(), 0);
    }

    #[test]
    fn test_idle_timeout_closes() {
        let now = Instant::now();
        let mut state = ready_peer(now);
        let block = Block::new(1, 0, 16384);
        state.handle(Event::Assigned(vec![block]), now);

        let actions = state.handle(Event::Tick, now + Duration::from_secs(120));
        assert!(matches!(&actions[0], Action::Release(blocks) if blocks == &vec![block]));
        assert!(matches!(actions.last(), Some(Action::Close(Error::Timeout))));
    }

    #[test]
    fn test_keep_alive_sent_when_quiet() {
        let now = Instant::now();
        let mut state = peer(now);
        let later = now + Duration::from_secs(90);
        state.handle(Event::Message(PeerMessage::KeepAlive), later);

        let actions = state.handle(Event::Tick, later);
        assert_eq!(sent(&actions), vec![&PeerMessage::KeepAlive]);
    }

    #[test]
    fn test_cancel_from_endgame_winner() {
        let now = Instant::now();
        let mut state = ready_peer(now);
        let block = Block::new(3, 0, 16384);
        state.handle(Event::Assigned(vec![block]), now);

        let actions = state.handle(Event::Cancel(block), now);
        assert_eq!(sent(&actions), vec![&PeerMessage::Cancel { block }]);
        assert_eq!(state.outstanding(), 0);
    }

    #[test]
    fn test_close_releases_outstanding() {
        let now = Instant::now();
        let mut state = ready_peer(now);
        let block = Block::new(5, 0, 16384);
        state.handle(Event::Assigned(vec![block]), now);

        let actions = state.handle(Event::Close, now);
        assert!(matches!(&actions[..], [Action::Release(blocks)] if blocks == &vec![block]));
        assert_eq!(state.conn_state(), ConnState::Closing);

        state.finish();
        assert_eq!(state.conn_state(), ConnState::Closed);
        assert!(state.handle(Event::Message(PeerMessage::Unchoke), now).is_empty());
    }
}
