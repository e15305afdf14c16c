use super::{
    max_frame_len, Action, Event, Handshake, MessageCodec, PeerCommand, PeerRx, PeerState, PeerTx,
    HANDSHAKE_LEN,
};
use crate::client::{SwarmEvent, SwarmTx};
use crate::config::DownloadConfig;
use crate::error::{Error, Result};
use crate::piece::{Bitfield, Block, PieceManager, Received};
use futures::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Read-only state shared by every connection of one download
#[derive(Debug)]
pub struct PeerContext {
    pub info_hash: [u8; 20],
    pub piece_count: usize,
    pub config: DownloadConfig,
    pub pieces: Arc<Mutex<PieceManager>>,
    pub swarm_tx: SwarmTx,
    /// Ends every session of the download
    pub cancel: CancellationToken,
}

/// Drives one peer: handshake, then messages, commands and ticks through
/// the [`PeerState`] machine until the connection ends
pub struct PeerConnection {
    state: PeerState,
    ctx: Arc<PeerContext>,
    peer_rx: PeerRx,
    /// Pieces counted in the piece manager's availability for this peer
    registered: Bitfield,
}

impl PeerConnection {
    pub fn new(addr: SocketAddr, ctx: Arc<PeerContext>) -> (Self, PeerTx) {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let state = PeerState::new(addr, ctx.piece_count, &ctx.config, Instant::now());
        let registered = Bitfield::repeat(false, ctx.piece_count);

        (
            Self {
                state,
                ctx,
                peer_rx,
                registered,
            },
            peer_tx,
        )
    }

    /// Dial the peer and run the session
    #[tracing::instrument(name = "peer", skip(self), fields(address = %self.state.addr()))]
    pub async fn start(self) {
        let addr = self.state.addr();
        let timeout = self.ctx.config.connect_timeout;
        let cancel = self.ctx.cancel.clone();

        let connected = tokio::select! {
            connected = time::timeout(timeout, TcpStream::connect(addr)) => connected,
            _ = cancel.cancelled() => return self.finish(Err(Error::Cancelled)).await,
        };

        match connected {
            Ok(Ok(stream)) => self.serve(stream).await,
            Ok(Err(e)) => self.finish(Err(e.into())).await,
            Err(_) => self.finish(Err(Error::Timeout)).await,
        }
    }

    /// Run the session over an established transport. Always ends with a
    /// `SwarmEvent::Disconnected` for this peer.
    pub async fn serve<S>(mut self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let cancel = self.ctx.cancel.clone();
        let result = tokio::select! {
            result = self.run(stream) => result,
            _ = cancel.cancelled() => Err(Error::Cancelled),
        };
        self.finish(result).await;
    }

    async fn run<S>(&mut self, mut stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.state.handle(Event::Connected, Instant::now());
        self.handshake(&mut stream).await?;

        let addr = self.state.addr();
        info!("Connected to peer: {}", addr);
        self.ctx.swarm_tx.send(SwarmEvent::Connected { addr }).ok();

        let codec = MessageCodec::new(max_frame_len(
            self.ctx.piece_count,
            self.ctx.config.block_size,
        ));
        let mut socket = Framed::new(stream, codec);
        let mut ticker = time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let event = tokio::select! {
                message = socket.next() => match message {
                    Some(message) => {
                        let message = message?;
                        debug!("read: {:?}", message);
                        Event::Message(message)
                    }
                    None => {
                        return Err(Error::Io(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "peer closed the connection",
                        )))
                    }
                },

                command = self.peer_rx.recv() => match command {
                    Some(PeerCommand::Have(index)) => Event::LocalHave(index),
                    Some(PeerCommand::Cancel(block)) => Event::Cancel(block),
                    Some(PeerCommand::Refill) => {
                        // interest may have come back along with the blocks
                        self.perform(&mut socket, vec![Action::CheckInterest]).await?;
                        Event::Tick
                    }
                    Some(PeerCommand::Shutdown) | None => {
                        debug!("Session shutdown");
                        let actions = self.state.handle(Event::Close, Instant::now());
                        self.perform(&mut socket, actions).await?;
                        return Ok(());
                    }
                },

                _ = ticker.tick() => Event::Tick,
            };

            let actions = self.state.handle(event, Instant::now());
            self.perform(&mut socket, actions).await?;
        }
    }

    async fn handshake<S>(&mut self, stream: &mut S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let ours = Handshake::new(self.ctx.info_hash, self.ctx.config.peer_id);
        stream.write_all(&ours.to_bytes()).await?;
        debug!("Sent handshake");

        let mut buf = [0u8; HANDSHAKE_LEN];
        time::timeout(self.ctx.config.connect_timeout, stream.read_exact(&mut buf)).await??;

        let theirs = Handshake::from_bytes(&buf)?;
        theirs.validate(&self.ctx.info_hash)?;

        self.state.handle(
            Event::HandshakeOk {
                peer_id: theirs.peer_id,
            },
            Instant::now(),
        );
        Ok(())
    }

    /// Carry out the actions of one transition, feeding follow-up events
    /// (assignments, interest) back into the state machine
    async fn perform<S>(
        &mut self,
        socket: &mut Framed<S, MessageCodec>,
        actions: Vec<Action>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let addr = self.state.addr();
        let mut queue = VecDeque::from(actions);

        while let Some(action) = queue.pop_front() {
            match action {
                Action::Send(message) => {
                    debug!("send: {:?}", message);
                    socket.feed(message).await?;
                }
                Action::Bitfield(have) => {
                    debug!("Peer has {}/{} pieces", have.count_ones(), have.len());
                    self.ctx.pieces.lock().await.add_peer_bitfield(&have);
                    self.registered = have;
                }
                Action::Have(index) => {
                    let index = index as usize;
                    if self.registered.get(index).map_or(false, |bit| !*bit) {
                        self.ctx.pieces.lock().await.add_peer_have(index);
                        self.registered.set(index, true);
                    }
                }
                Action::Block { block, data } => {
                    let received = self.ctx.pieces.lock().await.receive(addr, block, &data);
                    self.on_received(block, received);
                }
                Action::Release(blocks) => {
                    self.ctx.pieces.lock().await.release(addr, &blocks);
                }
                Action::RequestWork(max) => {
                    let now = Instant::now();
                    let blocks = self
                        .ctx
                        .pieces
                        .lock()
                        .await
                        .assign(addr, self.state.have(), max, now);
                    if !blocks.is_empty() {
                        queue.extend(self.state.handle(Event::Assigned(blocks), now));
                    }
                }
                Action::CheckInterest => {
                    let interested = self.ctx.pieces.lock().await.is_interesting(self.state.have());
                    queue.extend(self.state.handle(Event::Interest(interested), Instant::now()));
                }
                Action::Close(error) => return Err(error),
            }
        }

        socket.flush().await
    }

    fn on_received(&self, block: Block, received: Received) {
        let cancel = match received {
            Received::Ignored => return,
            Received::Stored { cancel } => cancel,
            Received::PieceReady {
                index,
                data,
                cancel,
            } => {
                self.ctx
                    .swarm_tx
                    .send(SwarmEvent::PieceReady { index, data })
                    .ok();
                cancel
            }
        };

        if !cancel.is_empty() {
            self.ctx
                .swarm_tx
                .send(SwarmEvent::CancelBlock {
                    block,
                    peers: cancel,
                })
                .ok();
        }
    }

    /// Return everything this peer held to the pool and tell the coordinator
    async fn finish(mut self, result: Result<()>) {
        let addr = self.state.addr();
        let released = self
            .ctx
            .pieces
            .lock()
            .await
            .remove_peer(addr, &self.registered);
        self.state.finish();

        let error = match result {
            Ok(()) => {
                debug!("Disconnected from {}", addr);
                None
            }
            Err(Error::Cancelled) => {
                debug!("Session with {} cancelled", addr);
                Some(Error::Cancelled)
            }
            Err(e) => {
                warn!("Peer {} dropped: {}", addr, e);
                Some(e)
            }
        };

        self.ctx
            .swarm_tx
            .send(SwarmEvent::Disconnected {
                addr,
                error,
                released: released.len(),
            })
            .ok();
    }
}
