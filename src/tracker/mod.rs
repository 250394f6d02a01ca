//! A tracker is a server that knows the peers of a torrent. We speak the
//! binary UDP protocol with it (connect, announce, scrape) or, for
//! `http(s)://` trackers, the query-string announce over HTTP.
pub mod action;
pub mod announce;
pub mod connect;
pub mod event;
pub mod scrape;

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use tokio::{net::UdpSocket, time::timeout};
use tracing::{debug, info, warn};

use crate::{
    bencode::Bencode,
    error::Error,
    peer::PeerId,
    torrent::{InfoHash, Stats},
};

use self::event::Event;

pub trait Protocol {}

pub struct Udp {
    pub socket: UdpSocket,
}
pub struct Http {
    pub client: reqwest::Client,
    /// The announce URI as given in the magnet, scheme included.
    pub announce_uri: String,
}

impl Protocol for Udp {}
impl Protocol for Http {}

static ANNOUNCE_RES_BUF_LEN: usize = 8192;

/// Everything an announce gives us. A new announce replaces the previous
/// one wholesale, peer lists are never merged.
#[derive(Debug, Clone, Default)]
pub struct TrackerResponse {
    pub stats: Stats,
    pub peers: Vec<SocketAddr>,
}

/// The generic `P` stands for "Protocol".
/// Currently, only UDP and HTTP are supported.
pub struct Tracker<P: Protocol> {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub local_peer_port: u16,
    pub connection_id: u64,
    state: P,
}

/// A connected tracker of either protocol. Consumers match on the
/// variant, there is no trait object behind this.
pub enum TrackerClient {
    Udp(Tracker<Udp>),
    Http(Tracker<Http>),
}

impl TrackerClient {
    /// Try the given tracker URIs in order and return the first one that
    /// answers. For `udp://` this means a successful connect exchange,
    /// for `http(s)://` we only need the endpoint to resolve, the
    /// announce itself is the first real exchange.
    pub async fn connect_to_tracker(
        trackers: &[String],
        info_hash: InfoHash,
        peer_id: PeerId,
        local_peer_port: u16,
    ) -> Result<Self, Error> {
        info!("trying to connect to one of {} trackers", trackers.len());

        for uri in trackers {
            debug!("trying to connect {uri:?}");

            if uri.starts_with("udp://") {
                let authority = match uri_authority(uri) {
                    Ok(v) => v,
                    Err(_) => {
                        warn!("skipping unparseable tracker uri {uri}");
                        continue;
                    }
                };
                let socket = match Tracker::new_udp_socket(&authority).await {
                    Ok(socket) => socket,
                    Err(_) => {
                        debug!("could not connect to tracker");
                        continue;
                    }
                };

                let mut tracker = Tracker {
                    info_hash: info_hash.clone(),
                    peer_id: peer_id.clone(),
                    local_peer_port,
                    connection_id: 0,
                    state: Udp { socket },
                };

                if tracker.connect().await.is_ok() {
                    debug!("connected to tracker {uri}");
                    return Ok(Self::Udp(tracker));
                }
            } else if uri.starts_with("http://")
                || uri.starts_with("https://")
            {
                return Ok(Self::Http(Tracker {
                    info_hash: info_hash.clone(),
                    peer_id: peer_id.clone(),
                    local_peer_port,
                    connection_id: 0,
                    state: Http {
                        client: reqwest::Client::new(),
                        announce_uri: uri.clone(),
                    },
                }));
            }
        }

        Err(Error::TrackerNoHosts)
    }

    pub async fn announce(
        &mut self,
        event: Event,
        downloaded: u64,
        uploaded: u64,
        left: u64,
    ) -> Result<TrackerResponse, Error> {
        match self {
            Self::Udp(t) => t.announce(event, downloaded, uploaded, left).await,
            Self::Http(t) => t.announce(downloaded, uploaded, left).await,
        }
    }
}

impl Tracker<Udp> {
    /// Bind a local UDP socket and connect it to the tracker's address.
    pub async fn new_udp_socket(addr: &str) -> Result<UdpSocket, Error> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|_| Error::TrackerSocketAddr)?;

        socket
            .connect(addr)
            .await
            .map_err(|_| Error::TrackerSocketConnect)?;

        Ok(socket)
    }

    /// Send `packet` and wait for a reply, retransmitting on timeout with
    /// the protocol's backoff ladder (15 * 2^n seconds, 7 retries).
    async fn exchange(
        &self,
        packet: &[u8],
        buf: &mut [u8],
    ) -> Result<usize, Error> {
        self.state
            .socket
            .send(packet)
            .await
            .map_err(|_| Error::TrackerSendFailed)?;

        let mut retransmit = 15;

        for i in 1..=7 {
            match timeout(
                Duration::from_secs(retransmit),
                self.state.socket.recv(buf),
            )
            .await
            {
                Ok(Ok(len)) => return Ok(len),
                Ok(Err(e)) => return Err(Error::IO(e)),
                Err(_) => {
                    retransmit = 15 * 2_u64.pow(i);
                    debug!(
                        "tracker request was lost, trying again in \
                         {retransmit}s"
                    );
                    self.state
                        .socket
                        .send(packet)
                        .await
                        .map_err(|_| Error::TrackerSendFailed)?;
                }
            }
        }

        Err(Error::TrackerTimeout)
    }

    /// Before doing an `announce`, a client must perform a connect
    /// exchange to obtain a connection_id.
    pub async fn connect(&mut self) -> Result<connect::Response, Error> {
        let req = connect::Request::new();
        let mut buf = [0u8; connect::Response::LENGTH];

        let len = self.exchange(&req.serialize(), &mut buf).await?;

        let res = connect::Response::deserialize(&buf[..len])?;

        debug!("received res from tracker {res:#?}");

        if res.transaction_id != req.transaction_id {
            return Err(Error::TrackerTransactionMismatch);
        }
        if res.action != req.action as u32 {
            return Err(Error::TrackerActionMismatch);
        }

        self.connection_id = res.connection_id;

        Ok(res)
    }

    /// Announce ourselves and get back the current peer list. The peers
    /// arrive in the same datagram, after the fixed response header.
    pub async fn announce(
        &self,
        event: Event,
        downloaded: u64,
        uploaded: u64,
        left: u64,
    ) -> Result<TrackerResponse, Error> {
        debug!("announcing {event:#?} to tracker");

        let req = announce::Request {
            connection_id: self.connection_id,
            info_hash: self.info_hash.clone(),
            peer_id: self.peer_id.clone(),
            downloaded,
            left,
            uploaded,
            event,
            port: self.local_peer_port,
            ..Default::default()
        };

        let mut buf = [0u8; ANNOUNCE_RES_BUF_LEN];
        let len = self.exchange(&req.serialize()?, &mut buf).await?;

        let (res, payload) = announce::Response::deserialize(&buf[..len])?;

        if res.transaction_id != req.transaction_id {
            return Err(Error::TrackerTransactionMismatch);
        }
        if res.action != req.action as u32 {
            return Err(Error::TrackerActionMismatch);
        }

        let peers = parse_compact_peer_list(payload)?;

        Ok(TrackerResponse { stats: (&res).into(), peers })
    }

    /// Ask for the swarm counters without announcing.
    pub async fn scrape(&self) -> Result<scrape::Response, Error> {
        let req =
            scrape::Request::new(self.connection_id, self.info_hash.clone());

        let mut buf = [0u8; scrape::Response::LENGTH];
        let len = self.exchange(&req.serialize()?, &mut buf).await?;

        let res = scrape::Response::deserialize(&buf[..len])?;

        if res.transaction_id != req.transaction_id {
            return Err(Error::TrackerTransactionMismatch);
        }
        if res.action != req.action as u32 {
            return Err(Error::TrackerActionMismatch);
        }

        Ok(res)
    }
}

impl Tracker<Http> {
    /// The HTTP announce is a GET with the binary fields URL-escaped,
    /// answered with a bencoded dictionary.
    pub async fn announce(
        &self,
        downloaded: u64,
        uploaded: u64,
        left: u64,
    ) -> Result<TrackerResponse, Error> {
        let url = format!(
            "{}?info_hash={}&peer_id={}&port={}&uploaded={uploaded}\
             &downloaded={downloaded}&left={left}&compact=1",
            self.state.announce_uri,
            urlencoding::encode_binary(&self.info_hash.0),
            urlencoding::encode_binary(&self.peer_id.0),
            self.local_peer_port,
        );

        debug!("announcing to http tracker {url}");

        let body =
            self.state.client.get(url).send().await?.bytes().await?;

        let tree = Bencode::decode(&body);
        let interval = tree.root()?.get("interval")?.as_int()? as u32;
        let leechers = tree
            .root()?
            .get("incomplete")
            .and_then(|c| c.as_int())
            .unwrap_or(0) as u32;
        let seeders = tree
            .root()?
            .get("complete")
            .and_then(|c| c.as_int())
            .unwrap_or(0) as u32;

        // a dictionary "peers" (BEP23 non-compact) is rejected, we only
        // take the compact byte-string form
        let peers_raw = tree
            .root()?
            .get("peers")?
            .as_bytes()
            .map_err(|_| Error::TrackerCompactPeerList)?;

        let peers = parse_compact_peer_list(peers_raw)?;

        Ok(TrackerResponse {
            stats: Stats { interval, leechers, seeders },
            peers,
        })
    }
}

/// Decode a BEP23 compact peer list: 6-byte entries, 4 for the IPv4
/// address and 2 for the port, ending at the first all-zero entry.
pub fn parse_compact_peer_list(buf: &[u8]) -> Result<Vec<SocketAddr>, Error> {
    let mut peer_list = Vec::<SocketAddr>::new();

    let chunks = buf.chunks_exact(6);
    if !chunks.remainder().is_empty() {
        return Err(Error::TrackerCompactPeerList);
    }

    for hostpost in chunks {
        if hostpost.iter().all(|b| *b == 0) {
            break;
        }

        let (ip, port) = hostpost.split_at(4);
        let ip =
            IpAddr::from(Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3]));
        let port = u16::from_be_bytes(
            port.try_into().expect("chunks_exact guarantees the bounds"),
        );

        peer_list.push((ip, port).into());
    }

    debug!("{} ips of peers {peer_list:#?}", peer_list.len());

    Ok(peer_list)
}

/// Extract `host:port` from a tracker URI such as
/// `udp://tracker.example.org:6969/announce`. Anything more than
/// scheme/host/port extraction belongs to a URL library, not here.
pub fn uri_authority(uri: &str) -> Result<String, Error> {
    let rest = uri
        .split_once("://")
        .map(|(_, rest)| rest)
        .ok_or_else(|| Error::TrackerUriInvalid(uri.to_owned()))?;

    let authority = rest.split('/').next().unwrap_or(rest);

    let (host, port) = authority
        .rsplit_once(':')
        .ok_or_else(|| Error::TrackerUriInvalid(uri.to_owned()))?;

    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(Error::TrackerUriInvalid(uri.to_owned()));
    }

    Ok(authority.to_owned())
}
