//! The download orchestrator: announces to a tracker, probes the
//! returned addresses, keeps a target number of peer workers alive and
//! reassembles the pieces they complete.
//!
//! Workers run as isolated tasks that only ever talk back over their
//! framed channel; the orchestrator is the only writer of pieces and the
//! only one spawning replacements.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures::{stream::SelectAll, StreamExt};
use hashbrown::HashMap;
use tokio::{
    io::DuplexStream,
    net::TcpStream,
    task::JoinHandle,
    time::timeout,
};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::{
    bitfield::{Bitfield, RemoraBitfield, SharedBitfield},
    config::Config,
    disk::Disk,
    error::Error,
    ipc::{worker_channel, IpcCodec, IpcMessage},
    peer::{handshake, PeerConnection, PeerId},
    torrent::TorrentSource,
    tracker::{event::Event, TrackerClient},
};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// The seam where an OS sandbox would go. Workers engage it after the
/// handshake and before parsing any peer bytes; a failure kills that
/// worker only, with an error the supervisor can tell apart from a
/// clean exit.
pub trait IsolationBoundary: Send + Sync + 'static {
    fn engage(&self) -> Result<(), Error>;
}

/// The default boundary: no restriction at all.
pub struct Unrestricted;

impl IsolationBoundary for Unrestricted {
    fn engage(&self) -> Result<(), Error> {
        Ok(())
    }
}

pub struct Swarm {
    source: TorrentSource,
    peer_id: PeerId,
    config: Config,
    shared: SharedBitfield,
    disk: Disk,
    /// Candidate addresses not yet promoted to a worker. A probe failure
    /// discards the address for good.
    pool: Vec<SocketAddr>,
    workers: HashMap<SocketAddr, JoinHandle<Result<(), Error>>>,
    ipc: SelectAll<Framed<DuplexStream, IpcCodec>>,
    boundary: Arc<dyn IsolationBoundary>,
    /// Pieces actually written to disk. Two workers can complete the
    /// same piece before the shared bit lands, this guards the counter
    /// against double counting.
    persisted: Bitfield,
    pieces_done: usize,
}

impl Swarm {
    pub fn new(
        source: TorrentSource,
        peer_id: PeerId,
        config: Config,
    ) -> Result<Self, Error> {
        let disk = Disk::new(config.download_path());

        Ok(Self {
            source,
            peer_id,
            config,
            shared: SharedBitfield::new(),
            disk,
            pool: Vec::new(),
            workers: HashMap::new(),
            ipc: SelectAll::new(),
            boundary: Arc::new(Unrestricted),
            persisted: Bitfield::new(),
            pieces_done: 0,
        })
    }

    /// Replace the default (unrestricted) isolation boundary.
    pub fn with_boundary(
        mut self,
        boundary: Arc<dyn IsolationBoundary>,
    ) -> Self {
        self.boundary = boundary;
        self
    }

    /// Feed candidate addresses directly, bypassing the tracker.
    pub fn add_peers(&mut self, peers: impl IntoIterator<Item = SocketAddr>) {
        self.pool.extend(peers);
    }

    /// Announce, fill the worker slots and supervise until the download
    /// completes or the swarm runs out of peers.
    pub async fn start(&mut self) -> Result<(), Error> {
        let mut tracker = TrackerClient::connect_to_tracker(
            self.source.trackers(),
            self.source.info_hash().clone(),
            self.peer_id.clone(),
            self.config.local_peer_port,
        )
        .await?;

        let res =
            tracker.announce(Event::Started, 0, 0, self.left()).await?;

        info!(
            "announce: {} seeders, {} leechers, {} peers",
            res.stats.seeders,
            res.stats.leechers,
            res.peers.len()
        );

        // the new peer list replaces whatever we had
        self.pool = res.peers;

        if self.pool.is_empty() {
            return Err(Error::NoPeers);
        }

        self.run().await
    }

    /// Fill the worker slots from the current pool and supervise them.
    /// [`Swarm::start`] calls this after the announce; tests call it
    /// directly with peers injected through [`Swarm::add_peers`].
    pub async fn run(&mut self) -> Result<(), Error> {
        self.fill_workers().await;
        self.supervise().await
    }

    fn left(&self) -> u64 {
        match self.source.num_pieces() {
            Some(n) => (n as u64) * self.source.piece_length() as u64,
            None => u64::MAX,
        }
    }

    fn target_pieces(&self) -> usize {
        self.source
            .num_pieces()
            .unwrap_or_else(|| self.shared.capacity_bits())
    }

    /// Promote pool addresses to workers until the target count is
    /// reached or the pool runs dry.
    pub async fn fill_workers(&mut self) {
        while self.workers.len() < self.config.max_workers {
            if !self.spawn_one().await {
                break;
            }
        }
    }

    /// Probe addresses from the pool until one handshake succeeds, then
    /// spawn a worker on it. Probe failures discard the address, never
    /// retry it. Returns false once the pool is empty.
    async fn spawn_one(&mut self) -> bool {
        while let Some(addr) = self.pool.pop() {
            debug!("probing {addr}");

            let stream = match timeout(
                PROBE_TIMEOUT,
                TcpStream::connect(addr),
            )
            .await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    debug!("probe of {addr} failed: {e}");
                    continue;
                }
                Err(_) => {
                    debug!("probe of {addr} timed out");
                    continue;
                }
            };

            let socket = match handshake(
                stream,
                self.source.info_hash().clone(),
                self.peer_id.clone(),
            )
            .await
            {
                Ok(socket) => socket,
                Err(e) => {
                    debug!("handshake with {addr} failed: {e}");
                    continue;
                }
            };

            let (parent_ipc, worker_ipc) = worker_channel();
            self.ipc.push(parent_ipc);

            let shared = self.shared.clone();
            let boundary = self.boundary.clone();
            let piece_length = self.source.piece_length();
            let num_pieces = self.target_pieces();

            let join = tokio::spawn(async move {
                boundary.engage()?;

                let mut conn = PeerConnection::new(
                    socket,
                    shared,
                    worker_ipc,
                    piece_length,
                    num_pieces,
                );
                conn.run().await
            });

            info!("spawned worker for {addr}");
            self.workers.insert(addr, join);
            return true;
        }

        false
    }

    /// Poll the merged worker channels with a bounded timeout; on
    /// timeout sweep for dead workers. Ends when every piece is on disk
    /// or no worker and no candidate is left.
    async fn supervise(&mut self) -> Result<(), Error> {
        loop {
            if self.pieces_done >= self.target_pieces() {
                info!("download complete, {} pieces", self.pieces_done);
                for (_, join) in self.workers.drain() {
                    join.abort();
                }
                return Ok(());
            }

            let interval =
                Duration::from_millis(self.config.supervision_interval_ms);

            match timeout(interval, self.ipc.next()).await {
                Ok(Some(Ok(msg))) => self.handle_ipc(msg).await?,
                Ok(Some(Err(e))) => {
                    warn!("worker channel error: {e}");
                }
                // every channel is gone, or the timeout fired: sweep
                Ok(None) | Err(_) => {
                    self.sweep().await;

                    if self.workers.is_empty() && self.pool.is_empty() {
                        warn!("no workers left and the pool is empty");
                        return Err(Error::NoPeers);
                    }
                }
            }
        }
    }

    async fn handle_ipc(&mut self, msg: IpcMessage) -> Result<(), Error> {
        match msg {
            IpcMessage::PieceDone { piece_index, payload } => {
                self.disk.write_piece(piece_index, &payload).await?;
                self.shared.set(piece_index as usize);

                if !self.persisted.safe_get(piece_index as usize) {
                    self.persisted.safe_set(piece_index as usize);
                    self.pieces_done += 1;
                }

                info!(
                    "piece {piece_index} persisted ({}/{})",
                    self.pieces_done,
                    self.target_pieces()
                );
            }
        }
        Ok(())
    }

    /// Remove finished workers and spawn exactly one replacement per
    /// loss while unclaimed addresses remain. An empty pool spawns
    /// nothing and is not an error.
    pub async fn sweep(&mut self) -> usize {
        let finished: Vec<SocketAddr> = self
            .workers
            .iter()
            .filter(|(_, join)| join.is_finished())
            .map(|(addr, _)| *addr)
            .collect();

        let mut respawned = 0;
        for addr in finished {
            let join = self.workers.remove(&addr).expect("collected above");

            match join.await {
                Ok(Ok(())) => debug!("worker {addr} exited cleanly"),
                Ok(Err(Error::IsolationSetupFailed)) => {
                    warn!(
                        "worker {addr} could not engage its isolation \
                         boundary"
                    );
                }
                Ok(Err(e)) => debug!("worker {addr} died: {e}"),
                Err(e) => warn!("worker {addr} panicked: {e}"),
            }

            if !self.pool.is_empty() && self.spawn_one().await {
                respawned += 1;
            }
        }

        respawned
    }

    /// How many workers are currently believed alive.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// How many candidate addresses were not probed yet.
    pub fn pool_len(&self) -> usize {
        self.pool.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        torrent::InfoHash,
        wire::{Handshake, HandshakeCodec},
    };
    use futures::SinkExt;
    use tokio::net::TcpListener;

    const HASH: [u8; 20] = [3u8; 20];

    fn test_swarm() -> Swarm {
        let source = TorrentSource::Metainfo {
            trackers: vec![],
            info_hash: InfoHash(HASH),
            piece_length: 16384,
            name: "t".to_owned(),
            length: 16384 * 4,
        };
        let config = Config {
            download_dir: std::env::temp_dir()
                .join("remora_swarm_test")
                .to_string_lossy()
                .into_owned(),
            max_workers: 1,
            supervision_interval_ms: 50,
            ..Default::default()
        };

        Swarm::new(source, PeerId::generate(), config).unwrap()
    }

    /// A remote that accepts one connection, answers the handshake and
    /// immediately hangs up.
    async fn handshake_then_close(listener: TcpListener) {
        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(stream, HandshakeCodec);

        let theirs = framed.next().await.unwrap().unwrap();
        assert_eq!(theirs.info_hash, InfoHash(HASH));

        framed
            .send(Handshake::new(InfoHash(HASH), PeerId::generate()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn dead_worker_respawns_exactly_once() {
        let l1 = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let l2 = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let a1 = l1.local_addr().unwrap();
        let a2 = l2.local_addr().unwrap();

        tokio::spawn(handshake_then_close(l1));
        tokio::spawn(handshake_then_close(l2));

        let mut swarm = test_swarm();
        // pop comes from the back, a1 is probed first
        swarm.add_peers([a2, a1]);

        swarm.fill_workers().await;
        assert_eq!(swarm.worker_count(), 1);
        assert_eq!(swarm.pool_len(), 1);

        // the remote hung up right after the handshake, give the worker
        // a moment to notice
        tokio::time::sleep(Duration::from_millis(200)).await;

        let respawned = swarm.sweep().await;
        assert_eq!(respawned, 1);
        assert_eq!(swarm.worker_count(), 1);
        assert_eq!(swarm.pool_len(), 0);
    }

    #[tokio::test]
    async fn empty_pool_spawns_nothing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(handshake_then_close(listener));

        let mut swarm = test_swarm();
        swarm.add_peers([addr]);

        swarm.fill_workers().await;
        assert_eq!(swarm.worker_count(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;

        // the only worker died and there is nobody left to replace it
        let respawned = swarm.sweep().await;
        assert_eq!(respawned, 0);
        assert_eq!(swarm.worker_count(), 0);
        assert_eq!(swarm.pool_len(), 0);
    }

    #[tokio::test]
    async fn probe_failures_discard_addresses() {
        let mut swarm = test_swarm();

        // nothing listens here
        swarm.add_peers(["127.0.0.1:1".parse().unwrap()]);
        swarm.fill_workers().await;

        assert_eq!(swarm.worker_count(), 0);
        assert_eq!(swarm.pool_len(), 0);
    }

    struct Refusing;
    impl IsolationBoundary for Refusing {
        fn engage(&self) -> Result<(), Error> {
            Err(Error::IsolationSetupFailed)
        }
    }

    #[tokio::test]
    async fn isolation_failure_kills_only_that_worker() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(handshake_then_close(listener));

        let mut swarm = test_swarm().with_boundary(Arc::new(Refusing));
        swarm.add_peers([addr]);

        swarm.fill_workers().await;
        assert_eq!(swarm.worker_count(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;

        // dead, no pool, no respawn, no panic
        assert_eq!(swarm.sweep().await, 0);
        assert_eq!(swarm.worker_count(), 0);
    }
}
