use crate::error::{Error, Result};
use crate::piece::Block;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use tokio_util::codec::{Decoder, Encoder};

/// Messages exchanged between peers
#[derive(Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// Keep-alive message (no payload)
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    /// Indicate possession of a piece
    Have { piece_index: u32 },
    /// Bitfield of available pieces, raw as on the wire
    Bitfield { bitfield: Bytes },
    /// Request a block
    Request { block: Block },
    /// Send a block
    Piece {
        piece_index: u32,
        offset: u32,
        data: Bytes,
    },
    /// Cancel a block request
    Cancel { block: Block },
}

impl PeerMessage {
    /// Message type IDs
    const CHOKE: u8 = 0;
    const UNCHOKE: u8 = 1;
    const INTERESTED: u8 = 2;
    const NOT_INTERESTED: u8 = 3;
    const HAVE: u8 = 4;
    const BITFIELD: u8 = 5;
    const REQUEST: u8 = 6;
    const PIECE: u8 = 7;
    const CANCEL: u8 = 8;
}

// Piece payloads are elided so debug logs stay readable.
impl fmt::Debug for PeerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerMessage::KeepAlive => write!(f, "KeepAlive"),
            PeerMessage::Choke => write!(f, "Choke"),
            PeerMessage::Unchoke => write!(f, "Unchoke"),
            PeerMessage::Interested => write!(f, "Interested"),
            PeerMessage::NotInterested => write!(f, "NotInterested"),
            PeerMessage::Have { piece_index } => write!(f, "Have({})", piece_index),
            PeerMessage::Bitfield { bitfield } => write!(f, "Bitfield({} bytes)", bitfield.len()),
            PeerMessage::Request { block } => write!(f, "Request({:?})", block),
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => write!(f, "Piece({}, {}, {} bytes)", piece_index, offset, data.len()),
            PeerMessage::Cancel { block } => write!(f, "Cancel({:?})", block),
        }
    }
}

/// Largest frame a peer may send us: a full block, or a bitfield for
/// `piece_count` pieces, whichever is bigger
pub fn max_frame_len(piece_count: usize, block_size: u32) -> usize {
    let piece_frame = 9 + block_size as usize;
    let bitfield_frame = 1 + piece_count.div_ceil(8);
    piece_frame.max(bitfield_frame)
}

/// Length-prefixed framing for the peer wire protocol
/// Format: <length prefix><message ID><payload>
#[derive(Debug, Clone)]
pub struct MessageCodec {
    max_frame_len: usize,
}

impl MessageCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }
}

impl Encoder<PeerMessage> for MessageCodec {
    type Error = Error;

    fn encode(&mut self, message: PeerMessage, buf: &mut BytesMut) -> Result<()> {
        match message {
            PeerMessage::KeepAlive => {
                buf.put_u32(0);
            }
            PeerMessage::Choke => {
                buf.put_u32(1);
                buf.put_u8(PeerMessage::CHOKE);
            }
            PeerMessage::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(PeerMessage::UNCHOKE);
            }
            PeerMessage::Interested => {
                buf.put_u32(1);
                buf.put_u8(PeerMessage::INTERESTED);
            }
            PeerMessage::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(PeerMessage::NOT_INTERESTED);
            }
            PeerMessage::Have { piece_index } => {
                buf.put_u32(5); // length = 1 + 4
                buf.put_u8(PeerMessage::HAVE);
                buf.put_u32(piece_index);
            }
            PeerMessage::Bitfield { bitfield } => {
                buf.put_u32((1 + bitfield.len()) as u32);
                buf.put_u8(PeerMessage::BITFIELD);
                buf.put_slice(&bitfield);
            }
            PeerMessage::Request { block } => {
                buf.put_u32(13); // length = 1 + 4 + 4 + 4
                buf.put_u8(PeerMessage::REQUEST);
                put_block(buf, &block);
            }
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32((9 + data.len()) as u32);
                buf.put_u8(PeerMessage::PIECE);
                buf.put_u32(piece_index);
                buf.put_u32(offset);
                buf.put_slice(&data);
            }
            PeerMessage::Cancel { block } => {
                buf.put_u32(13);
                buf.put_u8(PeerMessage::CANCEL);
                put_block(buf, &block);
            }
        }

        Ok(())
    }
}

fn put_block(buf: &mut BytesMut, block: &Block) {
    buf.put_u32(block.piece_index);
    buf.put_u32(block.offset);
    buf.put_u32(block.length);
}

impl Decoder for MessageCodec {
    type Item = PeerMessage;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<PeerMessage>> {
        if src.len() < 4 {
            return Ok(None);
        }

        let mut prefix = [0u8; 4];
        prefix.copy_from_slice(&src[..4]);
        let length = u32::from_be_bytes(prefix) as usize;

        if length > self.max_frame_len {
            return Err(Error::Protocol(format!(
                "Frame of {} bytes exceeds limit of {}",
                length, self.max_frame_len
            )));
        }

        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        src.advance(4);
        if length == 0 {
            return Ok(Some(PeerMessage::KeepAlive));
        }

        let mut frame = src.split_to(length);
        let message_id = frame.get_u8();
        let payload = frame.len();

        let expect = |wanted: usize, name: &str| -> Result<()> {
            if payload == wanted {
                Ok(())
            } else {
                Err(Error::Protocol(format!(
                    "Invalid {} message: {} byte payload",
                    name, payload
                )))
            }
        };

        let message = match message_id {
            PeerMessage::CHOKE => {
                expect(0, "choke")?;
                PeerMessage::Choke
            }
            PeerMessage::UNCHOKE => {
                expect(0, "unchoke")?;
                PeerMessage::Unchoke
            }
            PeerMessage::INTERESTED => {
                expect(0, "interested")?;
                PeerMessage::Interested
            }
            PeerMessage::NOT_INTERESTED => {
                expect(0, "not interested")?;
                PeerMessage::NotInterested
            }
            PeerMessage::HAVE => {
                expect(4, "have")?;
                PeerMessage::Have {
                    piece_index: frame.get_u32(),
                }
            }
            PeerMessage::BITFIELD => PeerMessage::Bitfield {
                bitfield: frame.freeze(),
            },
            PeerMessage::REQUEST => {
                expect(12, "request")?;
                PeerMessage::Request {
                    block: get_block(&mut frame),
                }
            }
            PeerMessage::PIECE => {
                if payload < 8 {
                    return Err(Error::Protocol("Invalid piece message".to_string()));
                }
                let piece_index = frame.get_u32();
                let offset = frame.get_u32();
                PeerMessage::Piece {
                    piece_index,
                    offset,
                    data: frame.freeze(),
                }
            }
            PeerMessage::CANCEL => {
                expect(12, "cancel")?;
                PeerMessage::Cancel {
                    block: get_block(&mut frame),
                }
            }
            _ => {
                return Err(Error::Protocol(format!(
                    "Unknown message ID: {}",
                    message_id
                )))
            }
        };

        Ok(Some(message))
    }
}

fn get_block(frame: &mut BytesMut) -> Block {
    let piece_index = frame.get_u32();
    let offset = frame.get_u32();
    let length = frame.get_u32();
    Block::new(piece_index, offset, length)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(message: PeerMessage) -> BytesMut {
        let mut buf = BytesMut::new();
        MessageCodec::new(1 << 16).encode(message, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_wire_layout() {
        assert_eq!(&encode(PeerMessage::KeepAlive)[..], &[0, 0, 0, 0]);
        assert_eq!(&encode(PeerMessage::Interested)[..], &[0, 0, 0, 1, 2]);
        assert_eq!(
            &encode(PeerMessage::Have { piece_index: 258 })[..],
            &[0, 0, 0, 5, 4, 0, 0, 1, 2]
        );
        assert_eq!(
            &encode(PeerMessage::Request {
                block: Block::new(1, 16384, 16384)
            })[..],
            &[0, 0, 0, 13, 6, 0, 0, 0, 1, 0, 0, 0x40, 0, 0, 0, 0x40, 0]
        );
    }

    #[test]
    fn test_decode_waits_for_full_frame() {
        let mut codec = MessageCodec::new(1 << 16);
        let full = encode(PeerMessage::Piece {
            piece_index: 3,
            offset: 0,
            data: Bytes::from_static(b"abcdef"),
        });

        let mut buf = BytesMut::from(&full[..7]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(&full[7..]);
        let message = codec.decode(&mut buf).unwrap();
        assert_eq!(
            message,
            Some(PeerMessage::Piece {
                piece_index: 3,
                offset: 0,
                data: Bytes::from_static(b"abcdef"),
            })
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_back_to_back_frames() {
        let mut codec = MessageCodec::new(1 << 16);
        let mut buf = encode(PeerMessage::KeepAlive);
        buf.extend_from_slice(&encode(PeerMessage::Unchoke));
        buf.extend_from_slice(&encode(PeerMessage::Bitfield {
            bitfield: Bytes::from_static(&[0b1010_0000]),
        }));

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(PeerMessage::KeepAlive));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(PeerMessage::Unchoke));
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(PeerMessage::Bitfield {
                bitfield: Bytes::from_static(&[0b1010_0000])
            })
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_rejects_unknown_id_and_oversized_frames() {
        let mut codec = MessageCodec::new(32);

        let mut unknown = BytesMut::from(&[0u8, 0, 0, 1, 42][..]);
        assert!(matches!(codec.decode(&mut unknown), Err(Error::Protocol(_))));

        let mut huge = BytesMut::from(&[0u8, 0, 1, 0, 7][..]);
        assert!(matches!(codec.decode(&mut huge), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_rejects_bad_payload_size() {
        let mut codec = MessageCodec::new(64);
        let mut have = BytesMut::from(&[0u8, 0, 0, 3, 4, 0, 1][..]);
        assert!(matches!(codec.decode(&mut have), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_max_frame_len() {
        assert_eq!(max_frame_len(10, 16384), 16393);
        assert_eq!(max_frame_len(1_000_000, 16384), 125_001);
    }
}
