//! The descriptor of the file being downloaded.
//!
//! Parsing torrent-file containers is outside of this crate; consumers
//! hand us a ready [`TorrentSource`] (or a magnet link, see
//! [`crate::magnet`]) and we only ever read it.

use std::{fmt::Display, ops::Deref};

use speedy::{Readable, Writable};

use crate::{error::Error, magnet::Magnet};

/// The 20-byte hash identifying the file in the swarm.
#[derive(Clone, PartialEq, Eq, Hash, Default, Readable, Writable)]
pub struct InfoHash(pub [u8; 20]);

impl Display for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_string())
    }
}

impl Deref for InfoHash {
    type Target = [u8; 20];
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<[u8; 20]> for InfoHash {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

impl TryFrom<Vec<u8>> for InfoHash {
    type Error = Error;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        let mut buf = [0u8; 20];
        if value.len() != buf.len() {
            return Err(Error::MagnetNoInfoHash);
        }
        buf.copy_from_slice(&value);
        Ok(Self(buf))
    }
}

/// Stats of the most recent announce. Replaced wholesale on each
/// successful announce, never merged.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Stats {
    pub interval: u32,
    pub leechers: u32,
    pub seeders: u32,
}

/// Where the torrent came from. A closed set: consumers match on the
/// variant instead of dispatching through a trait object.
#[derive(Clone, Debug)]
pub enum TorrentSource {
    Magnet {
        trackers: Vec<String>,
        info_hash: InfoHash,
        /// Magnets don't carry the piece length, it arrives with the
        /// metadata; until then we run with the common default.
        piece_length: u32,
        name: String,
    },
    Metainfo {
        trackers: Vec<String>,
        info_hash: InfoHash,
        piece_length: u32,
        name: String,
        /// Total length of the file, in bytes.
        length: u64,
    },
}

impl TorrentSource {
    /// The piece length magnets assume before metadata arrives.
    pub const DEFAULT_PIECE_LENGTH: u32 = 262_144;

    pub fn from_magnet(magnet: &Magnet) -> Result<Self, Error> {
        let trackers = magnet.parse_trackers();
        if trackers.is_empty() {
            return Err(Error::MagnetNoTracker);
        }

        Ok(Self::Magnet {
            trackers,
            info_hash: magnet.parse_xt_infohash()?,
            piece_length: Self::DEFAULT_PIECE_LENGTH,
            name: magnet.parse_dn(),
        })
    }

    pub fn trackers(&self) -> &[String] {
        match self {
            Self::Magnet { trackers, .. }
            | Self::Metainfo { trackers, .. } => trackers,
        }
    }

    pub fn info_hash(&self) -> &InfoHash {
        match self {
            Self::Magnet { info_hash, .. }
            | Self::Metainfo { info_hash, .. } => info_hash,
        }
    }

    pub fn piece_length(&self) -> u32 {
        match self {
            Self::Magnet { piece_length, .. }
            | Self::Metainfo { piece_length, .. } => *piece_length,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Magnet { name, .. } | Self::Metainfo { name, .. } => name,
        }
    }

    /// How many pieces the file has, when the source knows the length.
    pub fn num_pieces(&self) -> Option<usize> {
        match self {
            Self::Magnet { .. } => None,
            Self::Metainfo { length, piece_length, .. } => {
                Some(length.div_ceil(*piece_length as u64) as usize)
            }
        }
    }
}
