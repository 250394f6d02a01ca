//! A library for downloading files with the BitTorrent protocol V1.
//!
//! Remora is a leech-only client: it announces to a tracker, handshakes
//! with the peers of the swarm, and pulls the pieces of the file in
//! parallel, one isolated worker per peer connection. There is no seeding
//! path, no DHT and no choking algorithm, which keeps the building blocks
//! small:
//!
//! * [`bencode`] - streaming decoder for the serialization format used by
//!   both torrent metadata and HTTP tracker responses.
//! * [`bitfield`] - piece ownership bitmaps, including the shared one that
//!   every worker observes.
//! * [`tracker`] - the UDP connect/announce/scrape binary protocol, plus
//!   an HTTP(S) announce fallback.
//! * [`wire`] - the peer handshake and message codecs.
//! * [`peer`] - the per-connection download state machine.
//! * [`swarm`] - the orchestrator that probes addresses, spawns workers
//!   and reassembles completed pieces.
//!
//! # Example
//!
//! ```no_run
//! use remora::{magnet::Magnet, peer::PeerId, swarm::Swarm, torrent::TorrentSource};
//!
//! # async fn run() -> Result<(), remora::error::Error> {
//! let magnet = Magnet::new("magnet:?xt=urn:btih:...")?;
//! let source = TorrentSource::from_magnet(&magnet)?;
//! let peer_id = PeerId::generate();
//!
//! let mut swarm = Swarm::new(source, peer_id, Default::default())?;
//! swarm.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod bencode;
pub mod bitfield;
pub mod config;
pub mod disk;
pub mod error;
pub mod ipc;
pub mod magnet;
pub mod peer;
pub mod swarm;
pub mod torrent;
pub mod tracker;
pub mod wire;
