mod verify;

#[cfg(test)]
mod tests;

use crate::config::DownloadConfig;
use crate::error::{Error, Result};
use crate::peer::{PeerCommand, PeerConnection, PeerContext, PeerTx};
use crate::piece::{verify as verify_piece, Block, PieceManager};
use crate::storage::StorageSink;
use crate::torrent::TorrentInfo;
use crate::tracker::{AnnounceRequest, AnnounceResponse, Tracker, TrackerEvent};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio::task::{self, JoinError, JoinHandle, JoinSet};
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use verify::{verify_and_store, Outcome, Verified};

/// How long a best-effort `completed`/`stopped` announce may take
const FAREWELL_TIMEOUT: Duration = Duration::from_secs(5);

/// Reports from connection tasks to the coordinator
#[derive(Debug)]
pub enum SwarmEvent {
    /// Handshake completed
    Connected { addr: SocketAddr },
    /// Every block of a piece arrived; it waits for verification
    PieceReady { index: usize, data: Vec<u8> },
    /// `block` arrived; these peers still have it requested
    CancelBlock { block: Block, peers: Vec<SocketAddr> },
    /// The session ended; `released` blocks went back to the pool
    Disconnected {
        addr: SocketAddr,
        error: Option<Error>,
        released: usize,
    },
}

pub type SwarmTx = mpsc::UnboundedSender<SwarmEvent>;
pub type SwarmRx = mpsc::UnboundedReceiver<SwarmEvent>;

/// Snapshot of a running download
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub pieces_complete: usize,
    pub pieces_total: usize,
    /// Bytes of verified pieces, including those found in storage at start-up
    pub bytes_downloaded: u64,
    /// Peers with a completed handshake
    pub peers: usize,
    /// Hash checks keep failing with no piece completing in between
    pub stalled: bool,
}

/// Caller's side of a download started with [`start_download`]
#[derive(Debug)]
pub struct DownloadHandle {
    progress: watch::Receiver<Progress>,
    cancel: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl DownloadHandle {
    pub fn progress(&self) -> Progress {
        *self.progress.borrow()
    }

    /// Receiver notified on every progress change
    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.progress.clone()
    }

    /// Stop the download; `wait` then resolves with `Error::Cancelled`
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels the download, usable after `wait` took the handle
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Resolve once every piece is stored, or with the error that ended the download
    pub async fn wait(self) -> Result<()> {
        self.task.await.map_err(io::Error::from)?
    }
}

/// Download `info` from the peers `tracker` hands out into `storage`.
///
/// Fails only on an unusable `config`; everything else is reported through
/// [`DownloadHandle::wait`]. Must be called from within a tokio runtime.
pub fn start_download(
    info: Arc<TorrentInfo>,
    tracker: Arc<dyn Tracker>,
    storage: Arc<dyn StorageSink>,
    config: DownloadConfig,
) -> Result<DownloadHandle> {
    config.validate()?;

    let cancel = CancellationToken::new();
    let (progress_tx, progress_rx) = watch::channel(Progress {
        pieces_total: info.piece_count(),
        ..Progress::default()
    });

    let swarm = Swarm::new(info, tracker, storage, config, cancel.clone(), progress_tx);
    let task = tokio::spawn(swarm.run());

    Ok(DownloadHandle {
        progress: progress_rx,
        cancel,
        task,
    })
}

struct PeerHandle {
    tx: PeerTx,
    connected: bool,
}

/// Outcome of a background announce
struct Announced {
    sent_at: Instant,
    /// Sent while the swarm had no peer and nobody to dial
    idle: bool,
    response: Result<AnnounceResponse>,
}

#[derive(Debug, Default)]
struct Announces {
    /// `started` was delivered
    started: bool,
    last: Option<Instant>,
    next: Option<Instant>,
    failures: u32,
}

/// The coordinator task: owns the peer set and reacts to connection,
/// verification and timer events
struct Swarm {
    info: Arc<TorrentInfo>,
    tracker: Arc<dyn Tracker>,
    storage: Arc<dyn StorageSink>,
    config: DownloadConfig,
    ctx: Arc<PeerContext>,
    swarm_rx: SwarmRx,
    /// Whole download, shared with the handle
    cancel: CancellationToken,
    /// Connection tasks only
    sessions_cancel: CancellationToken,
    progress_tx: watch::Sender<Progress>,

    slots: Arc<Semaphore>,
    peers: HashMap<SocketAddr, PeerHandle>,
    sessions: JoinSet<()>,
    backlog: VecDeque<SocketAddr>,
    seen: HashSet<SocketAddr>,
    banned: HashSet<SocketAddr>,
    strikes: HashMap<SocketAddr, u32>,

    verifying: JoinSet<Verified>,
    /// At most one announce in flight
    announcing: JoinSet<Announced>,
    announces: Announces,
    /// Consecutive hash failures since the last completed piece
    failed_in_row: u32,
    /// Verified bytes fetched from peers in this session
    downloaded: u64,
}

impl Swarm {
    fn new(
        info: Arc<TorrentInfo>,
        tracker: Arc<dyn Tracker>,
        storage: Arc<dyn StorageSink>,
        config: DownloadConfig,
        cancel: CancellationToken,
        progress_tx: watch::Sender<Progress>,
    ) -> Self {
        let (swarm_tx, swarm_rx) = mpsc::unbounded_channel();
        let pieces = PieceManager::new(
            info.clone(),
            config.block_size,
            config.max_duplicate_requests,
        );
        let sessions_cancel = cancel.child_token();

        let ctx = Arc::new(PeerContext {
            info_hash: info.info_hash,
            piece_count: info.piece_count(),
            config: config.clone(),
            pieces: Arc::new(Mutex::new(pieces)),
            swarm_tx,
            cancel: sessions_cancel.clone(),
        });

        Self {
            slots: Arc::new(Semaphore::new(config.max_peers.max(1))),
            info,
            tracker,
            storage,
            config,
            ctx,
            swarm_rx,
            cancel,
            sessions_cancel,
            progress_tx,
            peers: HashMap::new(),
            sessions: JoinSet::new(),
            backlog: VecDeque::new(),
            seen: HashSet::new(),
            banned: HashSet::new(),
            strikes: HashMap::new(),
            verifying: JoinSet::new(),
            announcing: JoinSet::new(),
            announces: Announces::default(),
            failed_in_row: 0,
            downloaded: 0,
        }
    }

    #[tracing::instrument(name = "swarm", skip_all, fields(info_hash = %self.info.info_hash_hex()))]
    async fn run(mut self) -> Result<()> {
        info!(
            "Starting download: {} pieces, {} bytes",
            self.info.piece_count(),
            self.info.total_length
        );

        let result = self.download().await;
        match &result {
            Ok(()) => info!("Download complete"),
            Err(Error::Cancelled) => info!("Download cancelled"),
            Err(e) => error!("Download failed: {}", e),
        }

        self.shutdown(&result).await;
        result
    }

    async fn download(&mut self) -> Result<()> {
        if self.config.resume {
            self.resume().await?;
        }
        if self.is_complete().await {
            return Ok(());
        }

        self.start_announce(false).await;

        let mut ticker = time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),

                Some(event) = self.swarm_rx.recv() => self.on_event(event),

                Some(joined) = self.verifying.join_next() => {
                    self.on_verified(joined).await?;
                    if self.is_complete().await {
                        self.farewell(TrackerEvent::Completed).await;
                        return Ok(());
                    }
                }

                Some(joined) = self.sessions.join_next() => {
                    if let Err(e) = joined {
                        warn!("Peer task failed: {}", e);
                    }
                    self.fill_slots();
                }

                Some(joined) = self.announcing.join_next() => self.on_announced(joined)?,

                _ = ticker.tick() => self.tick().await,
            }

            self.publish().await;
        }
    }

    /// Mark pieces already in storage complete before dialing anyone
    async fn resume(&mut self) -> Result<()> {
        let mut recovered = 0;

        for index in 0..self.info.piece_count() {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let length = self.info.piece_len(index) as usize;
            let data = match self.storage.read_piece(index, length).await {
                Ok(Some(data)) => data,
                Ok(None) => continue,
                Err(e) => {
                    debug!("Piece {} not readable from storage: {}", index, e);
                    continue;
                }
            };
            let Some(expected) = self.info.pieces.get(index).copied() else {
                continue;
            };

            let valid = task::spawn_blocking(move || verify_piece(&data, &expected))
                .await
                .map_err(io::Error::from)?;
            if valid && self.ctx.pieces.lock().await.mark_complete(index) {
                recovered += 1;
            }
        }

        if recovered > 0 {
            info!(
                "Resumed {}/{} pieces from storage",
                recovered,
                self.info.piece_count()
            );
            self.publish().await;
        }
        Ok(())
    }

    fn on_event(&mut self, event: SwarmEvent) {
        match event {
            SwarmEvent::Connected { addr } => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.connected = true;
                }
            }

            SwarmEvent::PieceReady { index, data } => {
                let Some(expected) = self.info.pieces.get(index).copied() else {
                    return;
                };
                self.verifying.spawn(verify_and_store(
                    index,
                    data,
                    expected,
                    self.storage.clone(),
                    self.config.storage_retries,
                    self.cancel.clone(),
                ));
            }

            SwarmEvent::CancelBlock { block, peers } => {
                for addr in peers {
                    self.send(addr, PeerCommand::Cancel(block));
                }
            }

            SwarmEvent::Disconnected {
                addr,
                error,
                released,
            } => {
                self.peers.remove(&addr);
                match error {
                    Some(e) if !e.is_peer_local() && !matches!(e, Error::Cancelled) => {
                        warn!("Peer {} ended with {}", addr, e)
                    }
                    _ => debug!("Peer {} gone, {} peers left", addr, self.peers.len()),
                }
                if released > 0 {
                    self.broadcast(PeerCommand::Refill);
                }
                self.fill_slots();
            }
        }
    }

    async fn on_verified(&mut self, joined: std::result::Result<Verified, JoinError>) -> Result<()> {
        let Verified {
            index,
            length,
            outcome,
        } = joined.map_err(io::Error::from)?;

        match outcome {
            Outcome::Stored => {
                let mut pieces = self.ctx.pieces.lock().await;
                if pieces.complete(index) {
                    info!(
                        "Piece {} verified ({}/{})",
                        index,
                        pieces.complete_count(),
                        pieces.piece_count()
                    );
                    drop(pieces);
                    self.downloaded += length as u64;
                    self.failed_in_row = 0;
                    self.broadcast(PeerCommand::Have(index as u32));
                }
            }

            Outcome::Corrupt => {
                let contributors = self.ctx.pieces.lock().await.reject(index);
                warn!(
                    "{}, striking {} contributing peers",
                    Error::Integrity { index },
                    contributors.len()
                );
                self.failed_in_row += 1;
                if self.failed_in_row == self.config.stall_threshold {
                    warn!(
                        "{} pieces in a row failed verification, download is stalled",
                        self.failed_in_row
                    );
                }

                for addr in contributors {
                    self.strike(addr);
                }
                self.broadcast(PeerCommand::Refill);
            }

            Outcome::Abandoned => self.ctx.pieces.lock().await.abandon(index),

            Outcome::Failed(e) => {
                self.ctx.pieces.lock().await.abandon(index);
                return Err(e);
            }
        }

        Ok(())
    }

    /// Count a hash failure against `addr`, banning it at the limit
    fn strike(&mut self, addr: SocketAddr) {
        let strikes = self.strikes.entry(addr).or_insert(0);
        *strikes += 1;

        if *strikes >= self.config.max_peer_strikes && self.banned.insert(addr) {
            warn!("Banning {} after {} bad pieces", addr, strikes);
            self.send(addr, PeerCommand::Shutdown);
        }
    }

    async fn tick(&mut self) {
        let now = Instant::now();

        let expired = self
            .ctx
            .pieces
            .lock()
            .await
            .expire(now, self.config.request_timeout);
        if !expired.is_empty() {
            for (addr, block) in expired {
                self.send(addr, PeerCommand::Cancel(block));
            }
            self.broadcast(PeerCommand::Refill);
        }

        self.fill_slots();

        if !self.announcing.is_empty() {
            return;
        }
        let idle = self.is_idle();
        let due = self.announces.next.map_or(true, |next| now >= next);
        let allowed = self
            .announces
            .last
            .map_or(true, |last| now >= last + self.config.min_announce_interval);

        if due || (idle && allowed) {
            self.start_announce(idle).await;
        }
    }

    /// No connection open and nobody left to dial
    fn is_idle(&self) -> bool {
        self.peers.is_empty() && self.backlog.is_empty()
    }

    /// Announce in the background; the answer comes back through `on_announced`
    async fn start_announce(&mut self, idle: bool) {
        let now = Instant::now();
        let request = self
            .announce_request(if self.announces.started {
                None
            } else {
                Some(TrackerEvent::Started)
            })
            .await;
        self.announces.last = Some(now);

        let tracker = self.tracker.clone();
        let timeout = self.config.announce_timeout;
        self.announcing.spawn(async move {
            let response = match time::timeout(timeout, tracker.announce(&request)).await {
                Ok(response) => response,
                Err(_) => Err(Error::Tracker(format!(
                    "No answer within {}s",
                    timeout.as_secs_f32()
                ))),
            };
            Announced {
                sent_at: now,
                idle,
                response,
            }
        });
    }

    /// Queue the new addresses of a finished announce. Fails the download once
    /// `tracker_retries` announces in a row failed, or when an announce sent
    /// while idle turned up nobody new.
    fn on_announced(&mut self, joined: std::result::Result<Announced, JoinError>) -> Result<()> {
        let Announced {
            sent_at,
            idle,
            response,
        } = joined.map_err(io::Error::from)?;

        match response {
            Ok(response) => {
                self.announces.started = true;
                self.announces.failures = 0;
                let interval = response.interval.max(self.config.min_announce_interval);
                self.announces.next = Some(sent_at + interval);

                let added = self.add_peers(response.peers);
                info!("Tracker returned {} new peers", added);
                if idle && added == 0 && self.is_idle() {
                    return Err(Error::PeersExhausted);
                }
                self.fill_slots();
                Ok(())
            }
            Err(e) => {
                self.announces.failures += 1;
                self.announces.next = Some(sent_at + self.config.min_announce_interval);
                warn!(
                    "Announce failed ({}/{}): {}",
                    self.announces.failures, self.config.tracker_retries, e
                );

                if self.announces.failures >= self.config.tracker_retries {
                    return Err(match e {
                        Error::Tracker(_) => e,
                        other => Error::Tracker(other.to_string()),
                    });
                }
                Ok(())
            }
        }
    }

    async fn announce_request(&self, event: Option<TrackerEvent>) -> AnnounceRequest {
        AnnounceRequest {
            info_hash: self.info.info_hash,
            peer_id: self.config.peer_id,
            port: self.config.listen_port,
            uploaded: 0,
            downloaded: self.downloaded,
            left: self.ctx.pieces.lock().await.bytes_left(),
            event,
        }
    }

    /// Best-effort `completed`/`stopped`; failures are only logged
    async fn farewell(&self, event: TrackerEvent) {
        if !self.announces.started {
            return;
        }

        let request = self.announce_request(Some(event)).await;
        match time::timeout(FAREWELL_TIMEOUT, self.tracker.announce(&request)).await {
            Ok(Ok(_)) => debug!("Announced {}", event.as_str()),
            Ok(Err(e)) => warn!("Announcing {} failed: {}", event.as_str(), e),
            Err(_) => warn!("Announcing {} timed out", event.as_str()),
        }
    }

    fn add_peers(&mut self, addrs: Vec<SocketAddr>) -> usize {
        let mut added = 0;
        for addr in addrs {
            if !self.banned.contains(&addr) && self.seen.insert(addr) {
                self.backlog.push_back(addr);
                added += 1;
            }
        }
        added
    }

    /// Dial backlog addresses while connection slots are free
    fn fill_slots(&mut self) {
        while !self.backlog.is_empty() {
            let Ok(permit) = self.slots.clone().try_acquire_owned() else {
                break;
            };
            let Some(addr) = self.backlog.pop_front() else {
                break;
            };
            if self.banned.contains(&addr) {
                continue;
            }

            debug!("Dialing {}", addr);
            let (connection, tx) = PeerConnection::new(addr, self.ctx.clone());
            self.peers.insert(
                addr,
                PeerHandle {
                    tx,
                    connected: false,
                },
            );
            self.sessions.spawn(async move {
                connection.start().await;
                drop(permit);
            });
        }
    }

    fn send(&self, addr: SocketAddr, command: PeerCommand) {
        if let Some(peer) = self.peers.get(&addr) {
            peer.tx.send(command).ok();
        }
    }

    fn broadcast(&self, command: PeerCommand) {
        for peer in self.peers.values().filter(|p| p.connected) {
            peer.tx.send(command.clone()).ok();
        }
    }

    async fn is_complete(&self) -> bool {
        self.ctx.pieces.lock().await.is_complete()
    }

    async fn publish(&self) {
        let (pieces_complete, bytes_downloaded) = {
            let pieces = self.ctx.pieces.lock().await;
            (pieces.complete_count(), pieces.bytes_complete())
        };

        let progress = Progress {
            pieces_complete,
            pieces_total: self.info.piece_count(),
            bytes_downloaded,
            peers: self.peers.values().filter(|p| p.connected).count(),
            stalled: self.failed_in_row >= self.config.stall_threshold,
        };
        self.progress_tx.send_if_modified(|current| {
            let changed = *current != progress;
            *current = progress;
            changed
        });
    }

    /// Close every connection, settle in-flight verifications and say goodbye
    /// to the tracker
    async fn shutdown(&mut self, result: &Result<()>) {
        self.announcing.shutdown().await;

        info!("Disconnecting from {} peers", self.peers.len());
        for peer in self.peers.values() {
            peer.tx.send(PeerCommand::Shutdown).ok();
        }
        self.sessions_cancel.cancel();
        while let Some(joined) = self.sessions.join_next().await {
            if let Err(e) = joined {
                warn!("Peer task failed: {}", e);
            }
        }
        self.peers.clear();

        while let Some(joined) = self.verifying.join_next().await {
            match joined {
                Ok(Verified {
                    index,
                    outcome: Outcome::Stored,
                    ..
                }) => {
                    self.ctx.pieces.lock().await.complete(index);
                }
                Ok(Verified { index, .. }) => self.ctx.pieces.lock().await.abandon(index),
                Err(e) => warn!("Verification task failed: {}", e),
            }
        }

        match result {
            Ok(()) | Err(Error::Tracker(_)) => {}
            Err(_) => self.farewell(TrackerEvent::Stopped).await,
        }
        self.publish().await;
    }
}
