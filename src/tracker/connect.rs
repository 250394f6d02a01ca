use speedy::{BigEndian, Readable, Writable};
use tracing::debug;

use crate::error::Error;

use super::action::Action;

/// The first packet sent to a UDP tracker. The magic constant in
/// `protocol_id` is how the tracker tells a connect apart from line noise.
#[derive(Debug, PartialEq, Clone, Readable, Writable)]
pub struct Request {
    pub protocol_id: u64,
    pub action: Action,
    pub transaction_id: u32,
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}

impl Request {
    pub(crate) const LENGTH: usize = 16;
    const MAGIC: u64 = 0x41727101980;

    pub fn new() -> Self {
        Self {
            protocol_id: Self::MAGIC,
            action: Action::Connect,
            transaction_id: rand::random::<u32>(),
        }
    }

    pub fn serialize(&self) -> [u8; Self::LENGTH] {
        debug!("sending connect request {self:#?}");
        let mut buf = [0u8; Self::LENGTH];
        buf[..8].copy_from_slice(&Self::MAGIC.to_be_bytes());
        buf[8..12].copy_from_slice(&(self.action as u32).to_be_bytes());
        buf[12..16].copy_from_slice(&self.transaction_id.to_be_bytes());
        buf
    }
}

/// What the tracker sends back: the `connection_id` every later request
/// of this session must carry.
#[derive(Debug, PartialEq, Readable, Writable)]
pub struct Response {
    pub action: u32,
    pub transaction_id: u32,
    pub connection_id: u64,
}

impl Response {
    pub(crate) const LENGTH: usize = 16;

    pub fn deserialize(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < Self::LENGTH {
            return Err(Error::TrackerShortRead);
        }

        Self::read_from_buffer_with_ctx(BigEndian {}, &buf[..Self::LENGTH])
            .map_err(Error::SpeedyError)
    }

    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        self.write_to_vec_with_ctx(BigEndian {}).map_err(Error::SpeedyError)
    }
}
