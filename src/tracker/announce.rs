use rand::Rng;
use speedy::{BigEndian, Readable, Writable};

use crate::{
    error::Error,
    peer::PeerId,
    torrent::{InfoHash, Stats},
};

use super::{action::Action, event::Event};

/// An announce request, a fixed 98-byte big-endian packet ending at the
/// port. The peer list follows the [`Response`] header in the same
/// datagram.
#[derive(Debug, PartialEq, Readable, Writable)]
pub struct Request {
    pub connection_id: u64,
    pub action: Action,
    pub transaction_id: u32,
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub downloaded: u64,
    pub left: u64,
    pub uploaded: u64,
    pub event: Event,
    /// 0 means "use the source address of this packet".
    pub ip_address: u32,
    pub key: u32,
    pub num_want: u32,
    pub port: u16,
}

impl Default for Request {
    fn default() -> Self {
        Self {
            connection_id: 0,
            action: Action::Announce,
            transaction_id: rand::thread_rng().gen(),
            info_hash: InfoHash::default(),
            peer_id: PeerId::default(),
            downloaded: 0,
            left: u64::MAX,
            uploaded: 0,
            event: Event::default(),
            ip_address: 0,
            key: rand::thread_rng().gen(),
            num_want: 50,
            port: 0,
        }
    }
}

impl Request {
    pub(crate) const LENGTH: usize = 98;

    pub fn new(
        connection_id: u64,
        info_hash: InfoHash,
        peer_id: PeerId,
        port: u16,
        event: Event,
    ) -> Self {
        Self {
            connection_id,
            info_hash,
            peer_id,
            event,
            port,
            ..Default::default()
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        let buf = self.write_to_vec_with_ctx(BigEndian {})?;
        debug_assert_eq!(buf.len(), Self::LENGTH);
        Ok(buf)
    }
}

/// The 20-byte header of an announce response. The compact peer list
/// that follows it is returned as a separate slice.
#[derive(Debug, PartialEq, Writable, Readable)]
pub struct Response {
    pub action: u32,
    pub transaction_id: u32,
    pub interval: u32,
    pub leechers: u32,
    pub seeders: u32,
}

impl From<&Response> for Stats {
    fn from(value: &Response) -> Self {
        Self {
            interval: value.interval,
            seeders: value.seeders,
            leechers: value.leechers,
        }
    }
}

impl Response {
    pub(crate) const MIN_LEN: usize = 20;

    pub fn deserialize(buf: &[u8]) -> Result<(Self, &[u8]), Error> {
        if buf.len() < Self::MIN_LEN {
            return Err(Error::TrackerShortRead);
        }

        let res = Self::read_from_buffer_with_ctx(
            BigEndian {},
            &buf[..Self::MIN_LEN],
        )?;

        Ok((res, &buf[Self::MIN_LEN..]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_is_98_bytes() {
        let req = Request::new(
            0x0102_0304_0506_0708,
            InfoHash([9u8; 20]),
            PeerId([1u8; 20]),
            6881,
            Event::Started,
        );
        let buf = req.serialize().unwrap();

        assert_eq!(buf.len(), 98);
        assert_eq!(&buf[..8], &0x0102_0304_0506_0708u64.to_be_bytes());
        // action announce
        assert_eq!(&buf[8..12], &[0, 0, 0, 1]);
        assert_eq!(&buf[16..36], &[9u8; 20]);
        assert_eq!(&buf[36..56], &[1u8; 20]);
        // event started
        assert_eq!(&buf[80..84], &[0, 0, 0, 2]);
        // the packet ends at the port
        assert_eq!(&buf[96..98], &6881u16.to_be_bytes());
    }

    #[test]
    fn response_splits_peer_payload() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(Action::Announce as u32).to_be_bytes());
        buf.extend_from_slice(&0xCAFEu32.to_be_bytes());
        buf.extend_from_slice(&1800u32.to_be_bytes());
        buf.extend_from_slice(&3u32.to_be_bytes());
        buf.extend_from_slice(&7u32.to_be_bytes());
        // one compact peer entry
        buf.extend_from_slice(&[127, 0, 0, 1, 0x1A, 0xE1]);

        let (res, payload) = Response::deserialize(&buf).unwrap();
        assert_eq!(res.action, 1);
        assert_eq!(res.transaction_id, 0xCAFE);
        assert_eq!(res.interval, 1800);
        assert_eq!(res.leechers, 3);
        assert_eq!(res.seeders, 7);
        assert_eq!(payload, &[127, 0, 0, 1, 0x1A, 0xE1]);

        assert!(matches!(
            Response::deserialize(&buf[..10]),
            Err(Error::TrackerShortRead)
        ));
    }
}
