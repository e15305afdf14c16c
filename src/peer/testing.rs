//! In-process seeding peer for connection and swarm tests.

use super::{Handshake, MessageCodec, PeerMessage, HANDSHAKE_LEN};
use crate::error::Result;
use crate::torrent::{PieceHash, Pieces, TorrentInfo};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Framed;

/// `len` bytes of deterministic content and a torrent describing it
pub(crate) fn content_and_info(piece_length: u64, len: u64) -> (Vec<u8>, TorrentInfo) {
    let content: Vec<u8> = (0..len).map(|i| (i * 7 + 3) as u8).collect();
    let pieces: Pieces = content
        .chunks(piece_length as usize)
        .map(|chunk| PieceHash::new(Sha1::digest(chunk).into()))
        .collect();
    let info = TorrentInfo::new(piece_length, len, pieces, [0x42; 20]).unwrap();
    (content, info)
}

/// Wire bitfield advertising every piece, spare bits clear
pub(crate) fn full_bitfield(piece_count: usize) -> Bytes {
    let mut bytes = vec![0u8; piece_count.div_ceil(8)];
    for i in 0..piece_count {
        bytes[i / 8] |= 0x80 >> (i % 8);
    }
    Bytes::from(bytes)
}

/// Answer one downloader's handshake, advertise every piece, unchoke and
/// serve each request until the downloader hangs up. With `corrupt` every
/// served byte is flipped.
pub(crate) async fn seed<S>(
    mut stream: S,
    info: &TorrentInfo,
    content: &[u8],
    corrupt: bool,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; HANDSHAKE_LEN];
    stream.read_exact(&mut buf).await?;
    let theirs = Handshake::from_bytes(&buf)?;
    theirs.validate(&info.info_hash)?;
    stream
        .write_all(&Handshake::new(info.info_hash, [0x53; 20]).to_bytes())
        .await?;

    let mut socket = Framed::new(stream, MessageCodec::new(1 << 20));
    socket
        .send(PeerMessage::Bitfield {
            bitfield: full_bitfield(info.piece_count()),
        })
        .await?;
    socket.send(PeerMessage::Unchoke).await?;

    while let Some(message) = socket.next().await {
        if let PeerMessage::Request { block } = message? {
            let start = (block.piece_index as u64 * info.piece_length + block.offset as u64) as usize;
            let mut data = content[start..start + block.length as usize].to_vec();
            if corrupt {
                data.iter_mut().for_each(|b| *b = !*b);
            }
            socket
                .send(PeerMessage::Piece {
                    piece_index: block.piece_index,
                    offset: block.offset,
                    data: Bytes::from(data),
                })
                .await?;
        }
    }

    Ok(())
}
