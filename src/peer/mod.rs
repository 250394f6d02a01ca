//! The engine driving one connection to one remote peer: handshake, the
//! message state machine, and sequential piece download with pipelined
//! block requests.

use std::{fmt::Display, time::Duration};

use futures::{SinkExt, StreamExt};
use speedy::{Readable, Writable};
use tokio::{
    io::{AsyncRead, AsyncWrite, DuplexStream},
    time::timeout,
};
use tokio_util::codec::{Framed, FramedParts};
use tracing::{debug, info, warn};

use crate::{
    bitfield::{Bitfield, RemoraBitfield, SharedBitfield},
    error::Error,
    ipc::{IpcCodec, IpcMessage},
    torrent::InfoHash,
    wire::{
        Block, BlockInfo, Handshake, HandshakeCodec, Message, PeerCodec,
        BLOCK_LEN,
    },
};

/// The 20-byte id we present to trackers and peers. Generated once per
/// run, never persisted.
#[derive(Clone, PartialEq, Eq, Hash, Default, Readable, Writable)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        // Azureus-style prefix so trackers can tell what we are
        id[..8].copy_from_slice(b"-RM0001-");
        for b in id[8..].iter_mut() {
            *b = rand::random::<u8>();
        }
        Self(id)
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_string())
    }
}

impl From<[u8; 20]> for PeerId {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

/// Where the connection currently stands. Forward-only except for the
/// Downloading <-> Choked pair.
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub enum ConnectionState {
    #[default]
    Unconnected,
    Handshaking,
    /// Handshake done, waiting for the peer's first message.
    AwaitingBitfield,
    Choked,
    Downloading,
    Failed,
}

/// The one piece this connection is pulling right now. Pieces are
/// strictly sequential per connection, only blocks pipeline.
#[derive(Debug)]
pub struct PieceDownload {
    pub index: usize,
    /// Size of the whole piece in bytes.
    pub expected: usize,
    /// How many bytes arrived so far.
    pub downloaded: usize,
    pub buf: Vec<u8>,
}

impl PieceDownload {
    pub fn new(index: usize, expected: usize) -> Self {
        Self { index, expected, downloaded: 0, buf: vec![0u8; expected] }
    }

    /// Whether the block fits inside this piece. Callers drop anything
    /// that does not, remote input must never be able to panic us.
    pub fn accepts(&self, block: &Block) -> bool {
        (block.begin as usize)
            .checked_add(block.block.len())
            .is_some_and(|end| end <= self.expected)
    }

    /// Copy one block at its offset. Returns true when the piece is
    /// done. The block must have passed [`PieceDownload::accepts`].
    pub fn push_block(&mut self, block: &Block) -> bool {
        let begin = block.begin as usize;
        let end = begin + block.block.len();

        self.buf[begin..end].copy_from_slice(&block.block);
        self.downloaded += block.block.len();

        self.downloaded >= self.expected
    }
}

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Send our handshake, wait for theirs, validate it, then swap the codec
/// to [`PeerCodec`] without losing any bytes the peer may already have
/// sent after its handshake.
pub async fn handshake<S: AsyncRead + AsyncWrite + Unpin>(
    stream: S,
    info_hash: InfoHash,
    peer_id: PeerId,
) -> Result<Framed<S, PeerCodec>, Error> {
    let ours = Handshake::new(info_hash, peer_id);
    let mut framed = Framed::new(stream, HandshakeCodec);

    framed.send(ours.clone()).await.map_err(Error::IO)?;

    let theirs = timeout(HANDSHAKE_TIMEOUT, framed.next())
        .await
        .map_err(|_| Error::HandshakeTimeout)?
        .ok_or(Error::PeerClosedSocket)?
        .map_err(Error::IO)?;

    if !ours.validate(&theirs) {
        return Err(Error::HandshakeInvalid);
    }

    debug!("handshaken with peer {:?}", theirs.peer_id);

    // keep the read/write buffers, the peer's bitfield may already be
    // in flight behind the handshake
    let old_parts = framed.into_parts();
    let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
    new_parts.read_buf = old_parts.read_buf;
    new_parts.write_buf = old_parts.write_buf;

    Ok(Framed::from_parts(new_parts))
}

/// One peer connection, generic over the transport so tests can drive it
/// over an in-memory duplex instead of TCP.
pub struct PeerConnection<S: AsyncRead + AsyncWrite + Unpin> {
    pub state: ConnectionState,
    socket: Framed<S, PeerCodec>,
    /// Which pieces the remote peer claims to have.
    peer_bitfield: Bitfield,
    /// Which pieces the swarm already persisted. Only the orchestrator
    /// writes it, a worker dying mid-piece must leave no trace here.
    shared: SharedBitfield,
    /// Pieces this connection finished that the orchestrator may not
    /// have persisted yet, so the follow-up selection skips them.
    completed: Bitfield,
    ipc: Framed<DuplexStream, IpcCodec>,
    piece_length: u32,
    num_pieces: usize,
    in_flight: Option<PieceDownload>,
    peer_choking: bool,
    /// Total payload bytes pulled over this connection.
    pub downloaded: u64,
}

impl<S: AsyncRead + AsyncWrite + Unpin> PeerConnection<S> {
    pub fn new(
        socket: Framed<S, PeerCodec>,
        shared: SharedBitfield,
        ipc: Framed<DuplexStream, IpcCodec>,
        piece_length: u32,
        num_pieces: usize,
    ) -> Self {
        Self {
            state: ConnectionState::AwaitingBitfield,
            socket,
            peer_bitfield: Bitfield::new(),
            shared,
            completed: Bitfield::new(),
            ipc,
            piece_length,
            num_pieces,
            in_flight: None,
            peer_choking: true,
            downloaded: 0,
        }
    }

    /// Drive the connection until the peer goes away or the channel to
    /// the orchestrator dies. Any socket error ends the worker, the
    /// supervisor deals with replacement.
    pub async fn run(&mut self) -> Result<(), Error> {
        let res = self.run_inner().await;
        if res.is_err() {
            self.state = ConnectionState::Failed;
        }
        res
    }

    async fn run_inner(&mut self) -> Result<(), Error> {
        loop {
            let msg = self
                .socket
                .next()
                .await
                .ok_or(Error::PeerClosedSocket)??;

            self.handle_msg(msg).await?;
        }
    }

    pub async fn handle_msg(&mut self, msg: Message) -> Result<(), Error> {
        match msg {
            Message::KeepAlive => {
                debug!("keepalive");
                self.socket.send(Message::KeepAlive).await?;
            }
            Message::Bitfield(bitfield) => {
                debug!("bitfield with {} pieces", bitfield.count_ones());
                self.peer_bitfield = bitfield;
                self.state = ConnectionState::Choked;
                self.socket.send(Message::Interested).await?;
            }
            Message::Have(piece_index) => {
                debug!("have {piece_index}");
                // the index is remote input, growing the bitfield to an
                // arbitrary number would let one message allocate gigabytes
                if piece_index < self.num_pieces {
                    self.peer_bitfield.safe_set(piece_index);
                } else {
                    warn!("ignoring have past the piece count: {piece_index}");
                }
            }
            Message::Unchoke => {
                debug!("unchoke");
                self.peer_choking = false;
                self.state = ConnectionState::Downloading;
                match &self.in_flight {
                    // the peer discarded our pending requests when it
                    // choked, restart the piece and pipeline again
                    Some(piece) => {
                        let index = piece.index;
                        let expected = piece.expected;
                        self.in_flight =
                            Some(PieceDownload::new(index, expected));
                        self.request_blocks(index).await?;
                    }
                    None => self.select_next_piece().await?,
                }
            }
            Message::Choke => {
                debug!("choke");
                self.peer_choking = true;
                self.state = ConnectionState::Choked;
            }
            Message::Piece(block) => {
                self.handle_block(block).await?;
            }
            Message::Interested
            | Message::NotInterested
            | Message::Request(_)
            | Message::Cancel(_) => {
                // no upload path
                warn!("ignoring upload-side message {msg:?}");
            }
        }
        Ok(())
    }

    async fn handle_block(&mut self, block: Block) -> Result<(), Error> {
        let Some(piece) = self.in_flight.as_mut() else {
            warn!("block for piece {} with nothing in flight", block.index);
            return Ok(());
        };

        // a block for a piece we are not downloading is dropped, not an
        // error; slow peers answer cancelled requests
        if block.index != piece.index {
            warn!(
                "dropping block for piece {}, in flight is {}",
                block.index, piece.index
            );
            return Ok(());
        }

        // same for a block whose offset falls outside the piece
        if !piece.accepts(&block) {
            warn!(
                "dropping block at {} + {} bytes, piece {} holds {}",
                block.begin,
                block.block.len(),
                piece.index,
                piece.expected
            );
            return Ok(());
        }

        self.downloaded += block.block.len() as u64;
        let done = piece.push_block(&block);

        if done {
            let piece = self.in_flight.take().expect("checked above");
            info!("piece {} complete ({} bytes)", piece.index, piece.expected);

            self.completed.safe_set(piece.index);

            self.ipc
                .send(IpcMessage::PieceDone {
                    piece_index: piece.index as u32,
                    payload: piece.buf,
                })
                .await
                .map_err(|_| Error::IpcChannelClosed)?;

            self.socket.send(Message::Have(piece.index)).await?;

            // exactly one follow-up selection attempt
            self.select_next_piece().await?;
        }

        Ok(())
    }

    /// Complement-scan the shared bitfield against the peer's: the
    /// lowest piece this peer has that is neither persisted by the
    /// orchestrator nor already finished on this connection. The shared
    /// bit itself is set by the orchestrator on persistence only, so a
    /// worker dying mid-piece leaves the piece selectable by others.
    async fn select_next_piece(&mut self) -> Result<(), Error> {
        if self.peer_choking {
            return Ok(());
        }

        let mut ours = self.shared.snapshot(self.num_pieces);
        for i in self.completed.iter_ones() {
            ours.safe_set(i);
        }

        let Some(index) = ours.first_missing_in(&self.peer_bitfield, false)
        else {
            debug!("nothing left to request from this peer");
            self.socket.send(Message::NotInterested).await?;
            return Ok(());
        };

        let expected = self.piece_length as usize;
        self.in_flight = Some(PieceDownload::new(index, expected));

        self.request_blocks(index).await
    }

    /// Pipeline every block of the piece at consecutive offsets.
    async fn request_blocks(&mut self, index: usize) -> Result<(), Error> {
        let blocks = self.piece_length / BLOCK_LEN;
        debug!("requesting {blocks} blocks of piece {index}");

        for n in 0..blocks {
            let info =
                BlockInfo::new(index as u32, n * BLOCK_LEN, BLOCK_LEN);
            self.socket.feed(Message::Request(info)).await?;
        }
        self.socket.flush().await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::worker_channel;
    use tokio::io::duplex;

    fn engine(
        piece_length: u32,
        num_pieces: usize,
    ) -> (
        PeerConnection<DuplexStream>,
        Framed<DuplexStream, PeerCodec>,
        Framed<DuplexStream, IpcCodec>,
    ) {
        engine_with_shared(piece_length, num_pieces, SharedBitfield::new())
    }

    fn engine_with_shared(
        piece_length: u32,
        num_pieces: usize,
        shared: SharedBitfield,
    ) -> (
        PeerConnection<DuplexStream>,
        Framed<DuplexStream, PeerCodec>,
        Framed<DuplexStream, IpcCodec>,
    ) {
        let (local, remote) = duplex(1024 * 1024);
        let (parent_ipc, worker_ipc) = worker_channel();

        let conn = PeerConnection::new(
            Framed::new(local, PeerCodec),
            shared,
            worker_ipc,
            piece_length,
            num_pieces,
        );
        (conn, Framed::new(remote, PeerCodec), parent_ipc)
    }

    #[tokio::test]
    async fn bitfield_triggers_interested() {
        let (mut conn, mut remote, _ipc) = engine(BLOCK_LEN, 8);

        conn.handle_msg(Message::Bitfield(Bitfield::from_vec_with_len(
            vec![0xFF],
            8,
        )))
        .await
        .unwrap();

        assert_eq!(conn.state, ConnectionState::Choked);
        assert_eq!(
            remote.next().await.unwrap().unwrap(),
            Message::Interested
        );
    }

    #[tokio::test]
    async fn unchoke_pipelines_all_blocks() {
        let piece_length = 4 * BLOCK_LEN;
        let (mut conn, mut remote, _ipc) = engine(piece_length, 8);

        conn.handle_msg(Message::Bitfield(Bitfield::from_vec_with_len(
            vec![0xFF],
            8,
        )))
        .await
        .unwrap();
        let _ = remote.next().await; // interested

        conn.handle_msg(Message::Unchoke).await.unwrap();
        assert_eq!(conn.state, ConnectionState::Downloading);

        for n in 0..4u32 {
            let msg = remote.next().await.unwrap().unwrap();
            assert_eq!(
                msg,
                Message::Request(BlockInfo::new(0, n * BLOCK_LEN, BLOCK_LEN))
            );
        }
    }

    #[tokio::test]
    async fn piece_completion_emits_one_ipc_and_one_have() {
        let (mut conn, mut remote, mut ipc) = engine(BLOCK_LEN, 8);

        // peer only has piece 2
        conn.handle_msg(Message::Bitfield(Bitfield::from_vec_with_len(
            vec![0b0010_0000],
            8,
        )))
        .await
        .unwrap();
        let _ = remote.next().await; // interested

        conn.handle_msg(Message::Unchoke).await.unwrap();
        let req = remote.next().await.unwrap().unwrap();
        assert_eq!(
            req,
            Message::Request(BlockInfo::new(2, 0, BLOCK_LEN))
        );

        conn.handle_msg(Message::Piece(Block {
            index: 2,
            begin: 0,
            block: vec![0x11; BLOCK_LEN as usize],
        }))
        .await
        .unwrap();

        // exactly one completion notification with the whole payload
        let got = ipc.next().await.unwrap().unwrap();
        let IpcMessage::PieceDone { piece_index, payload } = got;
        assert_eq!(piece_index, 2);
        assert_eq!(payload, vec![0x11; BLOCK_LEN as usize]);

        // one have advertisement, then the follow-up selection found
        // nothing else and backed off
        assert_eq!(remote.next().await.unwrap().unwrap(), Message::Have(2));
        assert_eq!(
            remote.next().await.unwrap().unwrap(),
            Message::NotInterested
        );

        // the shared bit belongs to the orchestrator, the worker only
        // records the piece in its own ledger
        assert!(!conn.shared.get(2));
        assert!(conn.completed[2]);
        assert!(conn.in_flight.is_none());
    }

    #[tokio::test]
    async fn piece_survives_a_worker_death_mid_download() {
        let shared = SharedBitfield::new();

        // worker A starts on piece 0 and dies before any block lands
        let (mut a, mut a_remote, _a_ipc) =
            engine_with_shared(BLOCK_LEN, 8, shared.clone());
        a.handle_msg(Message::Bitfield(Bitfield::from_vec_with_len(
            vec![0x80],
            8,
        )))
        .await
        .unwrap();
        let _ = a_remote.next().await; // interested
        a.handle_msg(Message::Unchoke).await.unwrap();
        assert_eq!(
            a_remote.next().await.unwrap().unwrap(),
            Message::Request(BlockInfo::new(0, 0, BLOCK_LEN))
        );
        drop(a);

        // worker B, whose peer also has piece 0, must still request it
        let (mut b, mut b_remote, _b_ipc) =
            engine_with_shared(BLOCK_LEN, 8, shared);
        b.handle_msg(Message::Bitfield(Bitfield::from_vec_with_len(
            vec![0x80],
            8,
        )))
        .await
        .unwrap();
        let _ = b_remote.next().await; // interested
        b.handle_msg(Message::Unchoke).await.unwrap();

        assert_eq!(
            b_remote.next().await.unwrap().unwrap(),
            Message::Request(BlockInfo::new(0, 0, BLOCK_LEN))
        );
    }

    #[tokio::test]
    async fn out_of_range_block_offset_is_dropped() {
        let (mut conn, mut remote, _ipc) = engine(BLOCK_LEN, 8);

        conn.handle_msg(Message::Bitfield(Bitfield::from_vec_with_len(
            vec![0xFF],
            8,
        )))
        .await
        .unwrap();
        let _ = remote.next().await;
        conn.handle_msg(Message::Unchoke).await.unwrap();
        let _ = remote.next().await; // request for piece 0

        // well-framed, but the offset lands past the end of the piece
        conn.handle_msg(Message::Piece(Block {
            index: 0,
            begin: 3 * BLOCK_LEN,
            block: vec![0u8; 10],
        }))
        .await
        .unwrap();

        // begin + len overflowing usize must not panic either
        conn.handle_msg(Message::Piece(Block {
            index: 0,
            begin: u32::MAX,
            block: vec![0u8; 10],
        }))
        .await
        .unwrap();

        assert_eq!(conn.in_flight.as_ref().unwrap().downloaded, 0);
    }

    #[tokio::test]
    async fn unchoke_after_choke_reissues_requests() {
        let (mut conn, mut remote, _ipc) = engine(2 * BLOCK_LEN, 8);

        conn.handle_msg(Message::Bitfield(Bitfield::from_vec_with_len(
            vec![0xFF],
            8,
        )))
        .await
        .unwrap();
        let _ = remote.next().await; // interested

        conn.handle_msg(Message::Unchoke).await.unwrap();
        let _ = remote.next().await; // request block 0
        let _ = remote.next().await; // request block 1

        // the peer chokes, discarding our pending requests, and then
        // unchokes again: the whole piece must be re-pipelined
        conn.handle_msg(Message::Choke).await.unwrap();
        conn.handle_msg(Message::Unchoke).await.unwrap();

        for n in 0..2u32 {
            assert_eq!(
                remote.next().await.unwrap().unwrap(),
                Message::Request(BlockInfo::new(0, n * BLOCK_LEN, BLOCK_LEN))
            );
        }
        assert_eq!(conn.in_flight.as_ref().unwrap().index, 0);
        assert_eq!(conn.in_flight.as_ref().unwrap().downloaded, 0);
    }

    #[tokio::test]
    async fn have_past_piece_count_is_ignored() {
        let (mut conn, _remote, _ipc) = engine(BLOCK_LEN, 16);

        conn.handle_msg(Message::Have(u32::MAX as usize)).await.unwrap();
        assert!(conn.peer_bitfield.len() <= 16);
    }

    #[tokio::test]
    async fn wrong_piece_blocks_are_dropped() {
        let (mut conn, mut remote, mut ipc) = engine(BLOCK_LEN, 8);

        conn.handle_msg(Message::Bitfield(Bitfield::from_vec_with_len(
            vec![0xFF],
            8,
        )))
        .await
        .unwrap();
        let _ = remote.next().await;
        conn.handle_msg(Message::Unchoke).await.unwrap();
        let _ = remote.next().await; // request for piece 0

        conn.handle_msg(Message::Piece(Block {
            index: 5,
            begin: 0,
            block: vec![0u8; BLOCK_LEN as usize],
        }))
        .await
        .unwrap();

        // still waiting on piece 0
        assert_eq!(conn.in_flight.as_ref().unwrap().index, 0);
        assert_eq!(conn.in_flight.as_ref().unwrap().downloaded, 0);

        // and nothing was reported upstream
        drop(conn);
        assert!(ipc.next().await.is_none());
    }

    #[tokio::test]
    async fn have_grows_the_peer_bitfield() {
        let (mut conn, _remote, _ipc) = engine(BLOCK_LEN, 16);

        conn.handle_msg(Message::Have(11)).await.unwrap();
        assert!(conn.peer_bitfield.safe_get(11));
    }

    #[tokio::test]
    async fn keepalive_is_echoed() {
        let (mut conn, mut remote, _ipc) = engine(BLOCK_LEN, 8);

        conn.handle_msg(Message::KeepAlive).await.unwrap();
        assert_eq!(
            remote.next().await.unwrap().unwrap(),
            Message::KeepAlive
        );
    }

    #[test]
    fn peer_id_prefix() {
        let id = PeerId::generate();
        assert_eq!(&id.0[..8], b"-RM0001-");
        assert_ne!(PeerId::generate().0, id.0);
    }
}
