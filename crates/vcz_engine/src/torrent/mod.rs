//! A torrent being downloaded.
//!
//! [`TorrentCtx`] glues the engine together and can be called from any thread,
//! [`Torrent`] is an actor that the wire layer talks to with [`TorrentMsg`].

mod types;

// re-exports
pub use types::*;

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio::{
    select,
    sync::{broadcast, mpsc},
    task::spawn_blocking,
    time::interval,
};
use tracing::{debug, info, warn};

use crate::{
    bitfield::{LocalBitfield, PeerBitfield, PieceStatus},
    block::{Block, BlockInfo},
    config::{Config, PieceStrategy},
    counter::Counter,
    disk::{ChunkStore, Storage},
    error::Error,
    metainfo::Info,
    peer::PeerKey,
    piece::PieceManager,
};

/// Everything the engine knows about one torrent.
#[derive(Debug)]
pub struct TorrentCtx {
    pub info: Info,
    pub config: Config,
    pub bitfield: Arc<LocalBitfield>,
    pub store: ChunkStore,
    pub pieces: PieceManager,
    pub counter: Counter,
    /// Held while a piece is written or hashed, so that a block that passed
    /// the status check cannot land after the piece was verified.
    piece_locks: Vec<Mutex<()>>,
    events: broadcast::Sender<PieceEvent>,
    /// Pieces verified since the torrent started, not counting the ones that
    /// were found on disk.
    downloaded_pieces: AtomicUsize,
    switched_strategy: AtomicBool,
    completed: AtomicBool,
}

impl TorrentCtx {
    /// Lay the torrent over `storages` and find out which pieces are already
    /// there.
    ///
    /// Every piece is hashed, for big torrents call this from a blocking
    /// context.
    #[tracing::instrument(skip_all, fields(name = %info.name))]
    pub fn new(
        info: Info,
        storages: Vec<Arc<dyn Storage>>,
        config: Config,
    ) -> Result<Self, Error> {
        info.validate()?;
        config.validate()?;

        let store = ChunkStore::new(&info, storages, &config)?;
        let verified = store.recheck();
        let bitfield = Arc::new(LocalBitfield::from_verified(
            &info,
            config.block_len,
            &verified,
        )?);
        let pieces =
            PieceManager::new(bitfield.clone(), config.piece_strategy);
        let (events, _) = broadcast::channel(256);
        let bitfield_complete = bitfield.is_complete();
        let piece_locks = (0..info.pieces()).map(|_| Mutex::new(())).collect();

        info!(
            "{} of {} pieces on disk, strategy {:?}",
            bitfield.verified_count(),
            bitfield.pieces(),
            config.piece_strategy
        );

        Ok(Self {
            info,
            config,
            bitfield,
            store,
            pieces,
            counter: Counter::new(),
            piece_locks,
            events,
            downloaded_pieces: AtomicUsize::new(0),
            switched_strategy: AtomicBool::new(false),
            completed: AtomicBool::new(bitfield_complete),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PieceEvent> {
        self.events.subscribe()
    }

    pub fn add_peer(&self) -> PeerKey {
        self.pieces.add_peer()
    }

    /// Decode and apply the bitfield message of a peer.
    pub fn peer_bitfield(
        &self,
        key: PeerKey,
        bytes: &[u8],
    ) -> Result<(), Error> {
        let bitfield = PeerBitfield::from_bytes(bytes, self.info.pieces())?;
        self.pieces.peer_bitfield(key, bitfield)
    }

    pub fn peer_have(&self, key: PeerKey, piece: usize) -> Result<bool, Error> {
        self.pieces.peer_have(key, piece)
    }

    pub fn remove_peer(&self, key: PeerKey) -> Result<(), Error> {
        self.pieces.remove_peer(key)
    }

    /// The peer has a piece that we do not have.
    pub fn is_interested(&self, key: PeerKey) -> bool {
        self.pieces.is_interested(key)
    }

    /// Assign a piece to the peer and return the blocks of it that must be
    /// requested, the blocks already written are left out.
    pub fn request_piece(
        &self,
        key: PeerKey,
    ) -> Result<Option<Vec<BlockInfo>>, Error> {
        let Some(piece) = self.pieces.select_piece_for_peer(key)? else {
            return Ok(None);
        };

        let block_len = self.config.block_len;
        let missing = self.bitfield.missing_blocks(piece)?;
        let blocks: Vec<BlockInfo> = self
            .info
            .get_block_infos_of_piece(piece, block_len)?
            .into_iter()
            .filter(|b| missing.contains(&b.block_index(block_len)))
            .collect();

        debug!("peer {key} will download {} blocks of {piece}", blocks.len());

        Ok(Some(blocks))
    }

    /// Give the piece of a peer that stopped answering to someone else.
    pub fn unselect_piece(&self, key: PeerKey, piece: usize) -> bool {
        self.pieces.unselect_piece_for_peer(key, piece)
    }

    fn piece_lock(&self, piece: usize) -> Result<&Mutex<()>, Error> {
        self.piece_locks.get(piece).ok_or(Error::PieceIndexInvalid(piece))
    }

    /// Store a block and, if it was the last one of its piece, verify the
    /// piece.
    ///
    /// Verification reads the whole piece, this blocks the calling thread.
    /// Blocks of other pieces are not held back.
    #[tracing::instrument(skip_all, fields(piece = block.index))]
    pub fn block_received(&self, block: &Block) -> Result<BlockOutcome, Error> {
        let piece = block.index;
        let _guard = self.piece_lock(piece)?.lock();

        if self.bitfield.get_piece_status(piece)? >= PieceStatus::Complete {
            debug!("dropping block {} of a complete piece", block.begin);
            return Ok(BlockOutcome::Ignored);
        }

        let covered =
            self.store.write_block(piece, block.begin as u64, &block.block)?;
        self.counter.record_write(block.block.len() as u64);

        let mut complete = false;
        for b in covered {
            complete |= self.bitfield.mark_block_complete(piece, b)?;
        }

        if !complete {
            return Ok(BlockOutcome::Stored);
        }

        self.verify_locked(piece)
    }

    /// Verify a complete piece and move it to verified, or back to empty if
    /// the hash did not match.
    pub fn verify_piece(&self, piece: usize) -> Result<BlockOutcome, Error> {
        let _guard = self.piece_lock(piece)?.lock();
        self.verify_locked(piece)
    }

    fn verify_locked(&self, piece: usize) -> Result<BlockOutcome, Error> {
        let size = self.info.piece_size(piece)?;

        let valid = match self.store.verify(piece) {
            Ok(valid) => valid,
            Err(e) => {
                // the piece cannot stay complete forever
                self.fail_piece(piece, size)?;
                return Err(e);
            }
        };

        if !valid {
            warn!("piece {piece} is corrupted");
            self.fail_piece(piece, size)?;
            return Ok(BlockOutcome::PieceFailed(piece));
        }

        self.bitfield.mark_verified(piece)?;
        self.pieces.release_piece(piece);
        self.counter.record_verified(size);
        let _ = self.events.send(PieceEvent::Verified(piece));

        debug!("piece {piece} is valid");

        let downloaded =
            self.downloaded_pieces.fetch_add(1, Ordering::AcqRel) + 1;
        self.maybe_switch_strategy(downloaded);

        if self.bitfield.is_complete()
            && !self.completed.swap(true, Ordering::AcqRel)
        {
            info!("downloaded torrent {:?}", self.info.name);
            let _ = self.events.send(PieceEvent::DownloadComplete);
        }

        Ok(BlockOutcome::PieceVerified(piece))
    }

    fn fail_piece(&self, piece: usize, size: u64) -> Result<(), Error> {
        self.store.reset(piece)?;
        self.bitfield.mark_empty(piece)?;
        self.pieces.release_piece(piece);
        self.counter.record_wasted(size);
        let _ = self.events.send(PieceEvent::Failed(piece));
        Ok(())
    }

    /// Start with one strategy until `switch_to_rarest_after` pieces are
    /// downloaded, then go random rarest-first.
    fn maybe_switch_strategy(&self, downloaded: usize) {
        let Some(after) = self.config.switch_to_rarest_after else { return };

        if self.config.piece_strategy == PieceStrategy::RandomRarestFirst
            || downloaded < after
            || self.switched_strategy.swap(true, Ordering::AcqRel)
        {
            return;
        }

        info!("downloaded {downloaded} pieces, switching to rarest-first");
        self.pieces.set_strategy(PieceStrategy::RandomRarestFirst);
    }

    pub fn state(&self) -> TorrentState {
        let verified_pieces = self.bitfield.verified_count();
        let status = if verified_pieces == self.bitfield.pieces() {
            TorrentStatus::Seeding
        } else {
            TorrentStatus::Downloading
        };

        TorrentState {
            name: self.info.name.clone(),
            status,
            size: self.info.get_torrent_size(),
            pieces: self.bitfield.pieces(),
            verified_pieces,
            connected_peers: self.pieces.peers().len(),
            written: self.counter.written(),
            verified: self.counter.verified(),
            wasted: self.counter.wasted(),
            write_rate: self.counter.write_rate.load(Ordering::Relaxed),
        }
    }
}

/// Actor around a [`TorrentCtx`].
#[derive(Debug)]
pub struct Torrent {
    pub ctx: Arc<TorrentCtx>,
    pub tx: mpsc::Sender<TorrentMsg>,
    rx: mpsc::Receiver<TorrentMsg>,
    peers: HashMap<SocketAddr, PeerKey>,
}

impl Torrent {
    pub fn new(ctx: Arc<TorrentCtx>) -> Self {
        let (tx, rx) = mpsc::channel::<TorrentMsg>(100);
        Self { ctx, tx, rx, peers: HashMap::new() }
    }

    fn key(&self, addr: SocketAddr) -> Result<PeerKey, Error> {
        self.peers.get(&addr).copied().ok_or(Error::PeerAddrUnknown(addr))
    }

    /// Run the Torrent main event loop to listen to internal [`TorrentMsg`].
    #[tracing::instrument(skip_all, name = "torrent::run")]
    pub async fn run(&mut self) -> Result<(), Error> {
        debug!("running torrent: {:?}", self.ctx.info.name);

        let mut rates_interval = interval(Duration::from_secs(1));

        loop {
            select! {
                Some(msg) = self.rx.recv() => {
                    match msg {
                        TorrentMsg::PeerConnected(addr) => {
                            if self.peers.contains_key(&addr) {
                                warn!("{addr} is already connected");
                                continue;
                            }
                            let key = self.ctx.add_peer();
                            debug!("{addr} connected as {key}");
                            self.peers.insert(addr, key);
                        }
                        TorrentMsg::PeerBitfield(addr, bytes, recipient) => {
                            let r = self
                                .key(addr)
                                .and_then(|k| self.ctx.peer_bitfield(k, &bytes));
                            if let Err(e) = &r {
                                warn!("{addr} sent an invalid bitfield: {e}");
                            }
                            let _ = recipient.send(r);
                        }
                        TorrentMsg::PeerHave(addr, piece) => {
                            let r = self
                                .key(addr)
                                .and_then(|k| self.ctx.peer_have(k, piece));
                            if let Err(e) = r {
                                warn!("{addr} have {piece}: {e}");
                            }
                        }
                        TorrentMsg::PeerDisconnected(addr) => {
                            let Some(key) = self.peers.remove(&addr) else {
                                continue;
                            };
                            debug!("{addr} disconnected");
                            if let Err(e) = self.ctx.remove_peer(key) {
                                warn!("removing {addr}: {e}");
                            }
                        }
                        TorrentMsg::RequestPiece(addr, recipient) => {
                            let r = self
                                .key(addr)
                                .and_then(|k| self.ctx.request_piece(k));
                            let blocks = r.unwrap_or_else(|e| {
                                warn!("request piece for {addr}: {e}");
                                None
                            });
                            let _ = recipient.send(blocks);
                        }
                        TorrentMsg::UnselectPiece(addr, piece) => {
                            if let Ok(key) = self.key(addr) {
                                self.ctx.unselect_piece(key, piece);
                            }
                        }
                        TorrentMsg::IsInterested(addr, recipient) => {
                            let interested = self
                                .key(addr)
                                .is_ok_and(|k| self.ctx.is_interested(k));
                            let _ = recipient.send(interested);
                        }
                        TorrentMsg::BlockReceived(block) => {
                            // writing and hashing are blocking I/O
                            let ctx = self.ctx.clone();
                            spawn_blocking(move || {
                                if let Err(e) = ctx.block_received(&block) {
                                    warn!(
                                        "block {} of piece {}: {e}",
                                        block.begin, block.index
                                    );
                                }
                            });
                        }
                        TorrentMsg::ReadBitfield(recipient) => {
                            let _ = recipient
                                .send(self.ctx.bitfield.verified_bitfield());
                        }
                        TorrentMsg::GetTorrentState(recipient) => {
                            let _ = recipient.send(self.ctx.state());
                        }
                        TorrentMsg::Quit => {
                            info!("quitting torrent {:?}", self.ctx.info.name);
                            return Ok(());
                        }
                    }
                }
                _ = rates_interval.tick() => {
                    self.ctx.counter.update_rates().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{Digest, MemoryStorage, Sha1Digest};
    use bytes::Bytes;

    // 3 pieces of 8 bytes and one of 4, blocks of 4 bytes.
    fn setup(config: Config) -> (TorrentCtx, Vec<u8>) {
        setup_with(config, Arc::new(MemoryStorage::new(28)))
    }

    fn setup_with(
        config: Config,
        storage: Arc<dyn Storage>,
    ) -> (TorrentCtx, Vec<u8>) {
        let content: Vec<u8> = (0..28).collect();
        let info = Info {
            file_length: Some(content.len() as u64),
            name: "foo.txt".to_owned(),
            piece_length: 8,
            pieces: content
                .chunks(8)
                .flat_map(|p| Sha1Digest.digest(p))
                .collect(),
            files: None,
        };
        let ctx = TorrentCtx::new(info, vec![storage], config).unwrap();
        (ctx, content)
    }

    /// Sleeps before writing blocks that start with 0xEE.
    #[derive(Debug)]
    struct SlowStorage(MemoryStorage);

    impl Storage for SlowStorage {
        fn size(&self) -> u64 {
            self.0.size()
        }

        fn read_into(&self, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
            self.0.read_into(offset, buf)
        }

        fn write_block(&self, offset: u64, bytes: &[u8]) -> Result<(), Error> {
            if bytes.first() == Some(&0xEE) {
                std::thread::sleep(Duration::from_millis(300));
            }
            self.0.write_block(offset, bytes)
        }
    }

    fn config() -> Config {
        Config {
            block_len: 4,
            piece_strategy: PieceStrategy::Sequential,
            ..Default::default()
        }
    }

    fn block(content: &[u8], info: &BlockInfo) -> Block {
        let b = info.index * 8 + info.begin;
        Block {
            index: info.index,
            begin: info.begin,
            block: Bytes::copy_from_slice(&content[b..b + info.len]),
        }
    }

    #[test]
    fn download_a_piece() {
        let (ctx, content) = setup(config());
        let mut events = ctx.subscribe();
        let peer = ctx.add_peer();
        ctx.peer_bitfield(peer, &[0b1111_0000]).unwrap();
        assert!(ctx.is_interested(peer));

        let blocks = ctx.request_piece(peer).unwrap().unwrap();
        assert_eq!(
            blocks,
            vec![BlockInfo::new(0, 0, 4), BlockInfo::new(0, 4, 4)]
        );

        assert_eq!(
            ctx.block_received(&block(&content, &blocks[0])).unwrap(),
            BlockOutcome::Stored
        );
        assert_eq!(
            ctx.bitfield.get_piece_status(0).unwrap(),
            PieceStatus::Incomplete
        );
        assert_eq!(
            ctx.block_received(&block(&content, &blocks[1])).unwrap(),
            BlockOutcome::PieceVerified(0)
        );
        assert!(ctx.pieces.check_piece_verified(0));
        assert_eq!(ctx.pieces.assignment(peer).unwrap(), None);
        assert_eq!(events.try_recv().unwrap(), PieceEvent::Verified(0));

        // late duplicates are dropped
        assert_eq!(
            ctx.block_received(&block(&content, &blocks[1])).unwrap(),
            BlockOutcome::Ignored
        );

        assert_eq!(
            ctx.request_piece(peer).unwrap().unwrap(),
            vec![BlockInfo::new(1, 0, 4), BlockInfo::new(1, 4, 4)]
        );

        let state = ctx.state();
        assert_eq!(state.verified_pieces, 1);
        assert_eq!(state.written, 8);
        assert_eq!(state.verified, 8);
        assert_eq!(state.status, TorrentStatus::Downloading);
    }

    #[test]
    fn corrupted_piece_is_reset() {
        let (ctx, content) = setup(config());
        let mut events = ctx.subscribe();
        let peer = ctx.add_peer();
        ctx.peer_bitfield(peer, &[0b1111_0000]).unwrap();

        let blocks = ctx.request_piece(peer).unwrap().unwrap();
        ctx.block_received(&block(&content, &blocks[0])).unwrap();

        let mut bad = block(&content, &blocks[1]);
        bad.block = Bytes::from_static(&[0, 0, 0, 0]);
        assert_eq!(
            ctx.block_received(&bad).unwrap(),
            BlockOutcome::PieceFailed(0)
        );

        assert_eq!(
            ctx.bitfield.get_piece_status(0).unwrap(),
            PieceStatus::Empty
        );
        assert_eq!(ctx.bitfield.missing_blocks(0).unwrap(), vec![0, 1]);
        assert!(!ctx.store.chunk(0).unwrap().is_verified());
        assert_eq!(ctx.counter.wasted(), 8);
        assert_eq!(events.try_recv().unwrap(), PieceEvent::Failed(0));

        // immediately selectable again, with every block
        assert_eq!(ctx.request_piece(peer).unwrap().unwrap().len(), 2);
    }

    #[test]
    fn slow_write_cannot_land_on_a_verified_piece() {
        let storage = Arc::new(SlowStorage(MemoryStorage::new(28)));
        let (ctx, content) = setup_with(config(), storage);
        let ctx = Arc::new(ctx);

        let slow = {
            let ctx = ctx.clone();
            std::thread::spawn(move || {
                let bad = Block {
                    index: 0,
                    begin: 0,
                    block: Bytes::from_static(&[0xEE; 4]),
                };
                ctx.block_received(&bad).unwrap()
            })
        };
        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(
            ctx.block_received(&block(&content, &BlockInfo::new(0, 0, 4)))
                .unwrap(),
            BlockOutcome::Stored
        );
        assert_eq!(
            ctx.block_received(&block(&content, &BlockInfo::new(0, 4, 4)))
                .unwrap(),
            BlockOutcome::PieceVerified(0)
        );
        assert_eq!(slow.join().unwrap(), BlockOutcome::Stored);

        assert_eq!(
            ctx.bitfield.get_piece_status(0).unwrap(),
            PieceStatus::CompleteVerified
        );
        assert_eq!(
            ctx.store.read_block(0, 0, 8).unwrap().as_ref(),
            &content[..8]
        );
        assert!(ctx.store.verify(0).unwrap());
    }

    #[test]
    fn complete_assignment_moves_to_the_next_piece() {
        let (ctx, content) = setup(config());
        let peer = ctx.add_peer();
        ctx.peer_bitfield(peer, &[0b1100_0000]).unwrap();

        let blocks = ctx.request_piece(peer).unwrap().unwrap();
        assert_eq!(blocks[0].index, 0);
        for info in &blocks {
            ctx.bitfield.mark_block_complete(0, info.block_index(4)).unwrap();
        }
        assert_eq!(
            ctx.bitfield.get_piece_status(0).unwrap(),
            PieceStatus::Complete
        );

        // piece 0 waits for its hash check, the peer gets piece 1
        let blocks = ctx.request_piece(peer).unwrap().unwrap();
        assert_eq!(
            blocks,
            vec![BlockInfo::new(1, 0, 4), BlockInfo::new(1, 4, 4)]
        );
        for info in &blocks {
            ctx.block_received(&block(&content, info)).unwrap();
        }
        assert_eq!(ctx.request_piece(peer).unwrap(), None);
    }

    #[test]
    fn partial_piece_requests_missing_blocks() {
        let (ctx, content) = setup(config());
        let a = ctx.add_peer();
        let b = ctx.add_peer();
        ctx.peer_bitfield(a, &[0b1000_0000]).unwrap();
        ctx.peer_bitfield(b, &[0b1000_0000]).unwrap();

        let blocks = ctx.request_piece(a).unwrap().unwrap();
        ctx.block_received(&block(&content, &blocks[1])).unwrap();

        // a timed out, b takes over and only needs the first block
        assert!(ctx.unselect_piece(a, 0));
        ctx.remove_peer(a).unwrap();
        assert_eq!(
            ctx.request_piece(b).unwrap().unwrap(),
            vec![BlockInfo::new(0, 0, 4)]
        );
    }

    #[test]
    fn last_piece_and_completion() {
        let (ctx, content) = setup(config());
        let mut events = ctx.subscribe();
        let peer = ctx.add_peer();
        ctx.peer_bitfield(peer, &[0b1111_0000]).unwrap();

        while let Some(blocks) = ctx.request_piece(peer).unwrap() {
            for info in &blocks {
                ctx.block_received(&block(&content, info)).unwrap();
            }
        }

        assert!(ctx.bitfield.is_complete());
        assert_eq!(ctx.state().status, TorrentStatus::Seeding);
        assert!(!ctx.is_interested(peer));

        let mut got = Vec::new();
        while let Ok(e) = events.try_recv() {
            got.push(e);
        }
        assert_eq!(
            got,
            vec![
                PieceEvent::Verified(0),
                PieceEvent::Verified(1),
                PieceEvent::Verified(2),
                PieceEvent::Verified(3),
                PieceEvent::DownloadComplete,
            ]
        );
    }

    #[test]
    fn switch_strategy() {
        let (ctx, content) = setup(Config {
            switch_to_rarest_after: Some(1),
            ..config()
        });
        let a = ctx.add_peer();
        let b = ctx.add_peer();
        ctx.peer_bitfield(a, &[0b1111_0000]).unwrap();
        ctx.peer_bitfield(b, &[0b1110_0000]).unwrap();

        let blocks = ctx.request_piece(a).unwrap().unwrap();
        assert_eq!(blocks[0].index, 0);
        for info in &blocks {
            ctx.block_received(&block(&content, info)).unwrap();
        }

        // piece 3 is the rarest
        assert_eq!(ctx.request_piece(a).unwrap().unwrap()[0].index, 3);
    }

    #[test]
    fn invalid_input() {
        let (ctx, _) = setup(config());
        let peer = ctx.add_peer();
        assert!(matches!(
            ctx.peer_bitfield(peer, &[0, 0]),
            Err(Error::BitfieldLength { .. })
        ));
        assert!(matches!(
            ctx.peer_bitfield(peer, &[0b0000_1000]),
            Err(Error::BitfieldSpareBits)
        ));
        let bad = Block { index: 9, begin: 0, block: Bytes::from_static(&[1]) };
        assert!(matches!(
            ctx.block_received(&bad),
            Err(Error::PieceIndexInvalid(9))
        ));
        let bad =
            Block { index: 3, begin: 2, block: Bytes::from_static(&[1; 4]) };
        assert!(matches!(
            ctx.block_received(&bad),
            Err(Error::OutOfRange { .. })
        ));
    }
}
