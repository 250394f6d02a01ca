use rand::Rng;
use speedy::{BigEndian, Readable, Writable};

use crate::{error::Error, torrent::InfoHash};

use super::action::Action;

/// A scrape asks the tracker for the swarm counters of a torrent without
/// announcing ourselves. We only ever scrape one info hash at a time.
#[derive(Debug, PartialEq, Readable, Writable)]
pub struct Request {
    pub connection_id: u64,
    pub action: Action,
    pub transaction_id: u32,
    pub info_hash: InfoHash,
}

impl Request {
    pub(crate) const LENGTH: usize = 36;

    pub fn new(connection_id: u64, info_hash: InfoHash) -> Self {
        Self {
            connection_id,
            action: Action::Scrape,
            transaction_id: rand::thread_rng().gen(),
            info_hash,
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        let buf = self.write_to_vec_with_ctx(BigEndian {})?;
        debug_assert_eq!(buf.len(), Self::LENGTH);
        Ok(buf)
    }
}

#[derive(Debug, PartialEq, Writable, Readable)]
pub struct Response {
    pub action: u32,
    pub transaction_id: u32,
    pub seeders: u32,
    pub completed: u32,
    pub leechers: u32,
}

impl Response {
    pub(crate) const LENGTH: usize = 20;

    pub fn deserialize(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < Self::LENGTH {
            return Err(Error::TrackerShortRead);
        }

        Self::read_from_buffer_with_ctx(BigEndian {}, &buf[..Self::LENGTH])
            .map_err(Error::SpeedyError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_is_36_bytes() {
        let req = Request::new(77, InfoHash([3u8; 20]));
        let buf = req.serialize().unwrap();

        assert_eq!(buf.len(), 36);
        assert_eq!(&buf[..8], &77u64.to_be_bytes());
        // action scrape
        assert_eq!(&buf[8..12], &[0, 0, 0, 2]);
        assert_eq!(&buf[16..36], &[3u8; 20]);
    }

    #[test]
    fn response_layout() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&2u32.to_be_bytes());
        buf.extend_from_slice(&0xBEEFu32.to_be_bytes());
        buf.extend_from_slice(&10u32.to_be_bytes());
        buf.extend_from_slice(&20u32.to_be_bytes());
        buf.extend_from_slice(&30u32.to_be_bytes());

        let res = Response::deserialize(&buf).unwrap();
        assert_eq!(res.seeders, 10);
        assert_eq!(res.completed, 20);
        assert_eq!(res.leechers, 30);
    }
}
