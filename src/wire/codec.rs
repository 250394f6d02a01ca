//! Codec for the messages exchanged after a successful handshake.
//!
//! All of them take the form `<length prefix><message id><payload>`. The
//! length prefix is a four byte big-endian value counting everything that
//! follows it, the message id is a single byte. A length prefix of zero
//! with no id byte is a keep-alive.

use bytes::{Buf, BufMut, BytesMut};
use tokio::io;
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::{
    bitfield::Bitfield,
    error::Error,
    wire::{Block, BlockInfo},
};

/// Messages of the peer wire protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    /// The peer announces it downloaded a new piece.
    Have(usize),
    /// Only ever sent as the first message after the handshake: which
    /// pieces the sender has, one bit per piece, byte 0 holding indices
    /// 0-7 from most to least significant bit.
    Bitfield(Bitfield),
    Request(BlockInfo),
    Piece(Block),
    Cancel(BlockInfo),
}

/// The IDs of the [`Message`]s.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum MessageId {
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
    type Error = io::Error;

    fn try_from(k: u8) -> Result<Self, Self::Error> {
        use MessageId::*;
        match k {
            k if k == Choke as u8 => Ok(Choke),
            k if k == Unchoke as u8 => Ok(Unchoke),
            k if k == Interested as u8 => Ok(Interested),
            k if k == NotInterested as u8 => Ok(NotInterested),
            k if k == Have as u8 => Ok(Have),
            k if k == Bitfield as u8 => Ok(Bitfield),
            k if k == Request as u8 => Ok(Request),
            k if k == Piece as u8 => Ok(Piece),
            k if k == Cancel as u8 => Ok(Cancel),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Unknown message id",
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(
        &mut self,
        item: Message,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        match item {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Choke as u8);
            }
            Message::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Unchoke as u8);
            }
            Message::Interested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Interested as u8);
            }
            Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::NotInterested as u8);
            }
            // <len=0005><id=4><piece index>
            Message::Have(piece_index) => {
                buf.put_u32(1 + 4);
                buf.put_u8(MessageId::Have as u8);
                let piece_index = piece_index.try_into().map_err(|e| {
                    io::Error::new(io::ErrorKind::InvalidInput, e)
                })?;
                buf.put_u32(piece_index);
            }
            // <len=0001+X><id=5><bitfield>
            Message::Bitfield(bitfield) => {
                let v = bitfield.into_vec();
                buf.put_u32(1 + v.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.extend_from_slice(&v);
            }
            // <len=0013><id=6><index><begin><length>
            Message::Request(block_info) => {
                buf.put_u32(1 + 4 + 4 + 4);
                buf.put_u8(MessageId::Request as u8);
                block_info.encode(buf)?;
            }
            // <len=0009+X><id=7><index><begin><block>
            Message::Piece(block) => {
                buf.put_u32(1 + 4 + 4 + block.block.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                block.encode(buf)?;
            }
            // <len=0013><id=8><index><begin><length>
            Message::Cancel(block_info) => {
                buf.put_u32(1 + 4 + 4 + 4);
                buf.put_u8(MessageId::Cancel as u8);
                block_info.encode(buf)?;
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        // the message length header must be present at the minimum,
        // otherwise we can't determine the message type
        if buf.len() < 4 {
            return Ok(None);
        }

        // peek at the length prefix without consuming
        let size =
            u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

        if size == 0 {
            buf.advance(4);
            return Ok(Some(Message::KeepAlive));
        }

        // a message larger than the MTU arrives split over many packets;
        // don't advance the cursor until the buffer holds all of it
        if buf.len() < 4 + size {
            if buf.capacity() < size + 4 {
                buf.reserve((size + 4) - buf.capacity());
            }
            return Ok(None);
        }

        buf.advance(4);
        let msg_id = buf.get_u8();

        let Ok(msg_id) = MessageId::try_from(msg_id) else {
            // unknown message id, skip the segment
            warn!("unknown message_id {msg_id:?}");
            buf.advance(size - 1);
            return Ok(None);
        };

        let msg = match msg_id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => {
                if size < 1 + 4 {
                    return Err(Error::MessageResponse);
                }
                Message::Have(buf.get_u32() as usize)
            }
            MessageId::Bitfield => {
                let bytes = buf.copy_to_bytes(size - 1).to_vec();
                Message::Bitfield(Bitfield::from_vec(bytes))
            }
            MessageId::Request => {
                if size < 1 + 4 + 4 + 4 {
                    return Err(Error::MessageResponse);
                }
                let index = buf.get_u32();
                let begin = buf.get_u32();
                let len = buf.get_u32();
                Message::Request(BlockInfo { index, begin, len })
            }
            MessageId::Piece => {
                if size < 1 + 4 + 4 {
                    return Err(Error::MessageResponse);
                }
                let index = buf.get_u32() as usize;
                let begin = buf.get_u32();

                // size minus msg_id, index and begin
                let block = buf.copy_to_bytes(size - 9).to_vec();

                Message::Piece(Block { index, begin, block })
            }
            MessageId::Cancel => {
                if size < 1 + 4 + 4 + 4 {
                    return Err(Error::MessageResponse);
                }
                let index = buf.get_u32();
                let begin = buf.get_u32();
                let len = buf.get_u32();
                Message::Cancel(BlockInfo { index, begin, len })
            }
        };

        Ok(Some(msg))
    }
}
