//! Wire codecs for the two protocols spoken over a peer connection: the
//! one-shot handshake, and the length-prefixed message stream that follows
//! it.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{Bitfield, BlockInfo, PeerId, Sha1Hash};

pub(crate) const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";
const HANDSHAKE_LEN: usize = 1 + PROTOCOL_STRING.len() + 8 + 20 + 20;

/// The BitTorrent handshake, sent by both sides immediately after
/// connecting, before any other message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Handshake {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub(crate) fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        Self { info_hash, peer_id }
    }
}

#[derive(Debug, Default)]
pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Handshake, dst: &mut BytesMut) -> std::io::Result<()> {
        dst.reserve(HANDSHAKE_LEN);
        dst.put_u8(PROTOCOL_STRING.len() as u8);
        dst.put_slice(PROTOCOL_STRING);
        dst.put_bytes(0, 8);
        dst.put_slice(&item.info_hash);
        dst.put_slice(&item.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> std::io::Result<Option<Handshake>> {
        if src.is_empty() {
            return Ok(None);
        }
        let prot_len = src[0] as usize;
        let total_len = 1 + prot_len + 8 + 20 + 20;
        if src.len() < total_len {
            return Ok(None);
        }

        let mut buf = src.split_to(total_len);
        buf.advance(1);
        let prot = buf.split_to(prot_len);
        if prot != PROTOCOL_STRING {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "unrecognized protocol string in handshake",
            ));
        }
        buf.advance(8); // reserved bytes, unused
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf.split_to(20));
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf.split_to(20));

        Ok(Some(Handshake { info_hash, peer_id }))
    }
}

/// A message exchanged after the handshake, per the peer wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: usize },
    Bitfield(Bitfield),
    Request(BlockInfo),
    Block { piece_index: usize, begin: u32, data: Vec<u8> },
    Cancel(BlockInfo),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl TryFrom<u8> for MessageId {
    type Error = std::io::Error;

    fn try_from(value: u8) -> std::io::Result<Self> {
        Ok(match value {
            0 => MessageId::Choke,
            1 => MessageId::Unchoke,
            2 => MessageId::Interested,
            3 => MessageId::NotInterested,
            4 => MessageId::Have,
            5 => MessageId::Bitfield,
            6 => MessageId::Request,
            7 => MessageId::Piece,
            8 => MessageId::Cancel,
            _ => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("unrecognized message id {value}"),
                ))
            }
        })
    }
}

#[derive(Debug, Default)]
pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> std::io::Result<()> {
        match item {
            Message::KeepAlive => dst.put_u32(0),
            Message::Choke => encode_header(dst, 1, MessageId::Choke),
            Message::Unchoke => encode_header(dst, 1, MessageId::Unchoke),
            Message::Interested => encode_header(dst, 1, MessageId::Interested),
            Message::NotInterested => encode_header(dst, 1, MessageId::NotInterested),
            Message::Have { piece_index } => {
                encode_header(dst, 5, MessageId::Have);
                dst.put_u32(piece_index as u32);
            }
            Message::Bitfield(bitfield) => {
                let bytes = bitfield.into_vec();
                encode_header(dst, 1 + bytes.len() as u32, MessageId::Bitfield);
                dst.put_slice(&bytes);
            }
            Message::Request(block) => {
                encode_header(dst, 13, MessageId::Request);
                dst.put_u32(block.piece_index as u32);
                dst.put_u32(block.begin);
                dst.put_u32(block.len);
            }
            Message::Block { piece_index, begin, data } => {
                encode_header(dst, 9 + data.len() as u32, MessageId::Piece);
                dst.put_u32(piece_index as u32);
                dst.put_u32(begin);
                dst.put_slice(&data);
            }
            Message::Cancel(block) => {
                encode_header(dst, 13, MessageId::Cancel);
                dst.put_u32(block.piece_index as u32);
                dst.put_u32(block.begin);
                dst.put_u32(block.len);
            }
        }
        Ok(())
    }
}

fn encode_header(dst: &mut BytesMut, len: u32, id: MessageId) {
    dst.reserve(4 + len as usize);
    dst.put_u32(len);
    dst.put_u8(id as u8);
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = std::io::Error;

    /// Because the framed stream is polled in a loop, a single TCP read may
    /// contain several coalesced messages; `decode` is called repeatedly
    /// against the same buffer until it returns `Ok(None)`, so each call
    /// only needs to peel off the first complete message, leaving the rest
    /// in `src` for the next call.
    fn decode(&mut self, src: &mut BytesMut) -> std::io::Result<Option<Message>> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes(src[0..4].try_into().unwrap()) as usize;
        if src.len() < 4 + len {
            return Ok(None);
        }

        let mut buf = src.split_to(4 + len);
        buf.advance(4);

        if len == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let id = MessageId::try_from(buf.get_u8())?;
        let msg = match id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => Message::Have {
                piece_index: buf.get_u32() as usize,
            },
            MessageId::Bitfield => Message::Bitfield(Bitfield::from_vec(buf.to_vec())),
            MessageId::Request => Message::Request(BlockInfo {
                piece_index: buf.get_u32() as usize,
                begin: buf.get_u32(),
                len: buf.get_u32(),
            }),
            MessageId::Piece => {
                let piece_index = buf.get_u32() as usize;
                let begin = buf.get_u32();
                Message::Block {
                    piece_index,
                    begin,
                    data: buf.to_vec(),
                }
            }
            MessageId::Cancel => Message::Cancel(BlockInfo {
                piece_index: buf.get_u32() as usize,
                begin: buf.get_u32(),
                len: buf.get_u32(),
            }),
        };
        Ok(Some(msg))
    }
}
