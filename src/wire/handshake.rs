//! Codec for encoding and decoding handshakes.
//!
//! This has to be a separate codec as the handshake has a different
//! structure than the rest of the messages, and may only be sent once at
//! the beginning of a connection, preceding all other messages. After the
//! exchange the codec is switched to [`crate::wire::PeerCodec`], taking
//! care not to discard the underlying buffers.

use std::io::Cursor;

use bytes::{Buf, BufMut, BytesMut};
use speedy::{BigEndian, Readable, Writable};
use tokio::io;
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::{error::Error, peer::PeerId, torrent::InfoHash, wire::PSTR};

/// The very first message exchanged, exactly 68 bytes:
/// pstrlen (19) + "BitTorrent protocol" + 8 reserved bytes + info hash +
/// peer id. If the remote's protocol string or info hash differs from
/// ours the connection is severed, never retried.
#[derive(Clone, Debug, PartialEq, Writable, Readable)]
pub struct Handshake {
    pub pstr_len: u8,
    pub pstr: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub const LENGTH: usize = 68;

    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self {
            pstr_len: PSTR.len() as u8,
            pstr: PSTR,
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    pub fn serialize(&self) -> Result<[u8; Self::LENGTH], Error> {
        let v = self.write_to_vec_with_ctx(BigEndian {})?;

        // both ids must already be in place for the fixed layout to hold
        if v.len() != Self::LENGTH {
            return Err(Error::HandshakeInvalid);
        }

        let mut buf = [0u8; Self::LENGTH];
        buf.copy_from_slice(&v);
        Ok(buf)
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self, Error> {
        Self::read_from_buffer_with_ctx(BigEndian {}, buf)
            .map_err(Error::SpeedyError)
    }

    /// Whether `target`, received from the remote, is acceptable for us.
    pub fn validate(&self, target: &Self) -> bool {
        if target.pstr_len != PSTR.len() as u8 || target.pstr != PSTR {
            warn!("! handshake with wrong pstr, dropping connection");
            return false;
        }
        if self.info_hash != target.info_hash {
            warn!("! info_hash of received handshake does not match ours");
            return false;
        }
        true
    }
}

#[derive(Debug)]
pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = io::Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> io::Result<()> {
        debug_assert_eq!(handshake.pstr_len as usize, PSTR.len());

        buf.put_u8(handshake.pstr_len);
        buf.extend_from_slice(&handshake.pstr);
        buf.extend_from_slice(&handshake.reserved);
        buf.extend_from_slice(&handshake.info_hash.0);
        buf.extend_from_slice(&handshake.peer_id.0);

        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Handshake>> {
        if buf.is_empty() {
            return Ok(None);
        }

        // peek at the protocol length without consuming, we may not have
        // the full message yet
        let mut tmp_buf = Cursor::new(&buf);
        let pstr_len = tmp_buf.get_u8() as usize;

        if pstr_len != PSTR.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Handshake must have the string \"BitTorrent protocol\"",
            ));
        }

        if buf.remaining() < Handshake::LENGTH {
            return Ok(None);
        }
        buf.advance(1);

        let mut pstr = [0; 19];
        buf.copy_to_slice(&mut pstr);
        let mut reserved = [0; 8];
        buf.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            pstr_len: pstr.len() as u8,
            pstr,
            reserved,
            info_hash: InfoHash(info_hash),
            peer_id: PeerId(peer_id),
        }))
    }
}
