//! Framed transport between a worker and the orchestrator.
//!
//! Every message starts with a fixed 9-byte header: 1-byte kind, 4-byte
//! big-endian payload size, 4-byte big-endian `field0` (the piece index
//! for every kind defined so far), followed by exactly `payload_size`
//! raw bytes. After spawn the direction is strictly worker to parent.

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{duplex, DuplexStream};
use tokio_util::codec::{Decoder, Encoder, Framed};

use crate::error::Error;

/// Big enough for a whole default-size piece plus the header.
const CHANNEL_CAPACITY: usize = 512 * 1024;

pub const HEADER_LEN: usize = 9;

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum IpcMessageKind {
    PieceDone = 1,
}

impl TryFrom<u8> for IpcMessageKind {
    type Error = Error;

    fn try_from(k: u8) -> Result<Self, Self::Error> {
        match k {
            k if k == Self::PieceDone as u8 => Ok(Self::PieceDone),
            _ => Err(Error::IpcUnknownMessage),
        }
    }
}

/// Messages a worker sends to the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum IpcMessage {
    /// A piece finished downloading; the payload is the whole piece.
    PieceDone { piece_index: u32, payload: Vec<u8> },
}

#[derive(Debug, Clone)]
pub struct IpcCodec;

impl Encoder<IpcMessage> for IpcCodec {
    type Error = Error;

    fn encode(
        &mut self,
        item: IpcMessage,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        match item {
            IpcMessage::PieceDone { piece_index, payload } => {
                buf.reserve(HEADER_LEN + payload.len());
                buf.put_u8(IpcMessageKind::PieceDone as u8);
                buf.put_u32(payload.len() as u32);
                buf.put_u32(piece_index);
                buf.extend_from_slice(&payload);
            }
        }
        Ok(())
    }
}

impl Decoder for IpcCodec {
    type Item = IpcMessage;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        // the payload size can only be trusted once the whole header is
        // buffered
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let payload_size =
            u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;

        if buf.len() < HEADER_LEN + payload_size {
            return Ok(None);
        }

        let kind = IpcMessageKind::try_from(buf.get_u8())?;
        let payload_size = buf.get_u32() as usize;
        let field0 = buf.get_u32();
        let payload = buf.copy_to_bytes(payload_size).to_vec();

        let msg = match kind {
            IpcMessageKind::PieceDone => {
                IpcMessage::PieceDone { piece_index: field0, payload }
            }
        };

        Ok(Some(msg))
    }
}

/// The two framed ends of a fresh worker channel. The orchestrator keeps
/// the first, the worker is handed the second at spawn.
pub fn worker_channel(
) -> (Framed<DuplexStream, IpcCodec>, Framed<DuplexStream, IpcCodec>) {
    let (parent, worker) = duplex(CHANNEL_CAPACITY);
    (Framed::new(parent, IpcCodec), Framed::new(worker, IpcCodec))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let mut buf = BytesMut::new();
        IpcCodec
            .encode(
                IpcMessage::PieceDone {
                    piece_index: 42,
                    payload: vec![0xAB; 3],
                },
                &mut buf,
            )
            .unwrap();

        assert_eq!(buf.len(), HEADER_LEN + 3);
        assert_eq!(buf[0], IpcMessageKind::PieceDone as u8);
        assert_eq!(u32::from_be_bytes(buf[1..5].try_into().unwrap()), 3);
        assert_eq!(u32::from_be_bytes(buf[5..9].try_into().unwrap()), 42);
        assert_eq!(&buf[9..], &[0xAB; 3]);
    }

    #[test]
    fn roundtrip() {
        let msg = IpcMessage::PieceDone {
            piece_index: 7,
            payload: vec![1, 2, 3, 4, 5],
        };

        let mut buf = BytesMut::new();
        IpcCodec.encode(msg.clone(), &mut buf).unwrap();

        let decoded = IpcCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn split_delivery_decodes_exactly_once() {
        let msg = IpcMessage::PieceDone {
            piece_index: 9,
            payload: vec![0xCD; 1000],
        };
        let mut encoded = BytesMut::new();
        IpcCodec.encode(msg.clone(), &mut encoded).unwrap();

        let mut buf = BytesMut::new();
        let mut decoded = Vec::new();

        // feed the bytes in awkward chunks, the header itself split
        for chunk in encoded.chunks(5) {
            buf.extend_from_slice(chunk);
            if let Some(m) = IpcCodec.decode(&mut buf).unwrap() {
                decoded.push(m);
            }
        }

        assert_eq!(decoded, vec![msg]);
        assert!(buf.is_empty());
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(0xFF);
        buf.put_u32(0);
        buf.put_u32(0);

        assert!(matches!(
            IpcCodec.decode(&mut buf),
            Err(Error::IpcUnknownMessage)
        ));
    }

    #[tokio::test]
    async fn channel_carries_a_piece() {
        use futures::{SinkExt, StreamExt};

        let (mut parent, mut worker) = worker_channel();

        worker
            .send(IpcMessage::PieceDone {
                piece_index: 3,
                payload: vec![9u8; 100],
            })
            .await
            .unwrap();

        let got = parent.next().await.unwrap().unwrap();
        assert_eq!(
            got,
            IpcMessage::PieceDone { piece_index: 3, payload: vec![9u8; 100] }
        );
    }
}
