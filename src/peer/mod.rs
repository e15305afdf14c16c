mod connection;
mod message;
mod protocol;
mod state;

#[cfg(test)]
pub(crate) mod testing;

pub use connection::{PeerConnection, PeerContext};
pub use message::{max_frame_len, MessageCodec, PeerMessage};
pub use protocol::{Handshake, HANDSHAKE_LEN, PROTOCOL_STRING};
pub use state::{Action, ConnState, Event, PeerState};

use crate::piece::Block;
use tokio::sync::mpsc;

/// Instructions from the coordinator to one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCommand {
    /// We completed and stored this piece
    Have(u32),
    /// Drop our request for this block; someone else delivered it or it expired
    Cancel(Block),
    /// Blocks went back to the pool; ask for work again
    Refill,
    Shutdown,
}

pub type PeerTx = mpsc::UnboundedSender<PeerCommand>;
pub type PeerRx = mpsc::UnboundedReceiver<PeerCommand>;
