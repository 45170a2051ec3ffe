//! Piece selection
//!
//! Decides which block each peer should be asked for next. Pieces covering
//! open stream windows come first, interleaved across streams; every other
//! missing piece follows rarest-first. Outside endgame a block is in flight
//! at most once and a piece at most with `duplicate_cap` peers.
//!
//! The selector is plain data. The engine feeds it peer and piece events and
//! sends the requests it returns.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::peer::{Bitfield, PeerKey};
use crate::storage::piece::{block_count, block_len, blocks_of};
use crate::storage::BlockRef;
use crate::torrent::TorrentInfo;

/// Identifies one open file stream
pub type StreamId = u64;

#[derive(Debug, Clone, Copy)]
pub struct SelectorConfig {
    /// Peers one piece may be requested from concurrently
    pub duplicate_cap: usize,
    /// Endgame starts below this many missing pieces
    pub endgame_threshold: usize,
    pub max_inflight_per_peer: usize,
    pub request_timeout: Duration,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            duplicate_cap: 3,
            endgame_threshold: 4,
            max_inflight_per_peer: 16,
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Default)]
struct BlockSlot {
    received: bool,
    requests: Vec<(PeerKey, Instant)>,
}

#[derive(Debug)]
struct PieceProgress {
    blocks: Vec<BlockSlot>,
    /// Peers that delivered at least one block
    contributors: HashSet<PeerKey>,
}

impl PieceProgress {
    fn new(blocks: usize) -> Self {
        Self {
            blocks: (0..blocks).map(|_| BlockSlot::default()).collect(),
            contributors: HashSet::new(),
        }
    }

    fn requesting_peers(&self) -> HashSet<PeerKey> {
        self.blocks
            .iter()
            .flat_map(|b| b.requests.iter().map(|(k, _)| *k))
            .collect()
    }

    fn is_idle(&self) -> bool {
        self.blocks.iter().all(|b| b.requests.is_empty())
    }

    /// Every block received or in flight
    fn is_saturated(&self) -> bool {
        self.blocks.iter().all(|b| b.received || !b.requests.is_empty())
    }
}

pub struct PieceSelector {
    config: SelectorConfig,
    piece_lengths: Vec<u32>,
    verified: Vec<bool>,
    missing: usize,
    progress: HashMap<u32, PieceProgress>,
    inflight: HashMap<PeerKey, HashSet<BlockRef>>,
    demands: BTreeMap<StreamId, Vec<u32>>,
}

impl PieceSelector {
    pub fn new(info: &TorrentInfo, config: SelectorConfig) -> Self {
        let piece_lengths: Vec<u32> = (0..info.piece_count() as u32).map(|p| info.piece_len(p)).collect();
        let count = piece_lengths.len();
        Self {
            config,
            piece_lengths,
            verified: vec![false; count],
            missing: count,
            progress: HashMap::new(),
            inflight: HashMap::new(),
            demands: BTreeMap::new(),
        }
    }

    pub fn missing_count(&self) -> usize {
        self.missing
    }

    pub fn is_endgame(&self) -> bool {
        self.missing > 0 && self.missing < self.config.endgame_threshold
    }

    pub fn inflight_count(&self, peer: PeerKey) -> usize {
        self.inflight.get(&peer).map(HashSet::len).unwrap_or(0)
    }

    pub fn total_inflight(&self) -> usize {
        self.inflight.values().map(HashSet::len).sum()
    }

    /// Whether `block` matches the piece geometry exactly
    pub fn is_valid_block(&self, block: &BlockRef) -> bool {
        let Some(&piece_len) = self.piece_lengths.get(block.piece as usize) else {
            return false;
        };
        let index = block.index();
        block.offset % crate::storage::BLOCK_SIZE == 0
            && index < block_count(piece_len)
            && block.length == block_len(piece_len, index)
    }

    /// Replace the read window of one stream
    pub fn set_demand(&mut self, stream: StreamId, pieces: Vec<u32>) {
        trace!("Stream {} demands pieces {:?}", stream, pieces);
        self.demands.insert(stream, pieces);
    }

    pub fn clear_demand(&mut self, stream: StreamId) {
        if self.demands.remove(&stream).is_some() {
            trace!("Stream {} demand cleared", stream);
        }
    }

    pub fn demand_count(&self) -> usize {
        self.demands.len()
    }

    /// Unverified window pieces: streams ordered by read position, windows
    /// interleaved by position so every stream gets its next piece early
    pub fn priority_pieces(&self) -> Vec<u32> {
        let mut windows: Vec<Vec<u32>> = self
            .demands
            .values()
            .map(|w| w.iter().copied().filter(|p| !self.is_verified(*p)).collect::<Vec<_>>())
            .filter(|w| !w.is_empty())
            .collect();
        windows.sort_by_key(|w| w[0]);

        let longest = windows.iter().map(Vec::len).max().unwrap_or(0);
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        for position in 0..longest {
            for window in &windows {
                if let Some(&piece) = window.get(position) {
                    if seen.insert(piece) {
                        order.push(piece);
                    }
                }
            }
        }
        order
    }

    pub fn is_verified(&self, piece: u32) -> bool {
        self.verified.get(piece as usize).copied().unwrap_or(false)
    }

    /// Assign blocks to peers with free request slots.
    ///
    /// Peers are visited round-robin, one block per visit, so the blocks of
    /// one piece spread over several peers. A peer only gets rarest-first
    /// work when no window block is assignable to it.
    pub fn schedule(&mut self, peers: &[(PeerKey, &Bitfield)], availability: &[u32], now: Instant) -> Vec<(PeerKey, BlockRef)> {
        let mut issued = Vec::new();
        if self.missing == 0 || peers.is_empty() {
            return issued;
        }
        let endgame = self.is_endgame();
        let priority = self.priority_pieces();
        let in_window: HashSet<u32> = priority.iter().copied().collect();
        let mut rarest: Vec<u32> = (0..self.piece_lengths.len() as u32)
            .filter(|p| !self.verified[*p as usize] && !in_window.contains(p))
            .filter(|p| availability.get(*p as usize).copied().unwrap_or(0) > 0)
            .collect();
        rarest.sort_by_key(|p| (availability[*p as usize], *p));

        let mut saturated = HashSet::new();
        loop {
            let mut progressed = false;
            for (peer, bitfield) in peers {
                if self.inflight_count(*peer) >= self.config.max_inflight_per_peer {
                    continue;
                }
                let block = self
                    .pick(*peer, bitfield, &priority, endgame, &mut saturated)
                    .or_else(|| self.pick(*peer, bitfield, &rarest, endgame, &mut saturated));
                if let Some(block) = block {
                    self.assign(*peer, block, now);
                    issued.push((*peer, block));
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        if !issued.is_empty() {
            debug!(
                "Scheduled {} requests ({} window pieces, endgame: {})",
                issued.len(),
                priority.len(),
                endgame
            );
        }
        issued
    }

    fn pick(&self, peer: PeerKey, bitfield: &Bitfield, pieces: &[u32], endgame: bool, saturated: &mut HashSet<u32>) -> Option<BlockRef> {
        for &piece in pieces {
            if self.verified[piece as usize] || saturated.contains(&piece) || !bitfield.has(piece) {
                continue;
            }
            if let Some(block) = self.next_block(peer, piece, endgame) {
                return Some(block);
            }
            if !endgame && self.progress.get(&piece).map(PieceProgress::is_saturated).unwrap_or(false) {
                saturated.insert(piece);
            }
        }
        None
    }

    fn next_block(&self, peer: PeerKey, piece: u32, endgame: bool) -> Option<BlockRef> {
        let progress = self.progress.get(&piece);
        if !endgame {
            if let Some(progress) = progress {
                let peers = progress.requesting_peers();
                if peers.len() >= self.config.duplicate_cap && !peers.contains(&peer) {
                    return None;
                }
            }
        }
        let piece_len = self.piece_lengths[piece as usize];
        blocks_of(piece, piece_len).enumerate().find_map(|(i, block)| {
            let Some(slot) = progress.and_then(|p| p.blocks.get(i)) else {
                return Some(block);
            };
            let mine = slot.requests.iter().any(|(k, _)| *k == peer);
            let free = slot.requests.is_empty() || endgame;
            (!slot.received && !mine && free).then_some(block)
        })
    }

    fn assign(&mut self, peer: PeerKey, block: BlockRef, now: Instant) {
        let piece_len = self.piece_lengths[block.piece as usize];
        let progress = self
            .progress
            .entry(block.piece)
            .or_insert_with(|| PieceProgress::new(block_count(piece_len)));
        progress.blocks[block.index()].requests.push((peer, now));
        self.inflight.entry(peer).or_default().insert(block);
    }

    /// Record a delivered block.
    ///
    /// Returns the other peers the same block is still requested from, to be
    /// cancelled, or `None` when the block is not wanted (already received,
    /// piece verified or invalid geometry).
    pub fn on_block_received(&mut self, peer: PeerKey, block: BlockRef) -> Option<Vec<PeerKey>> {
        if let Some(blocks) = self.inflight.get_mut(&peer) {
            blocks.remove(&block);
        }
        if !self.is_valid_block(&block) || self.is_verified(block.piece) {
            return None;
        }
        let piece_len = self.piece_lengths[block.piece as usize];
        let progress = self
            .progress
            .entry(block.piece)
            .or_insert_with(|| PieceProgress::new(block_count(piece_len)));
        let slot = &mut progress.blocks[block.index()];
        let requesters: Vec<PeerKey> = slot.requests.drain(..).map(|(k, _)| k).collect();
        for other in &requesters {
            if let Some(blocks) = self.inflight.get_mut(other) {
                blocks.remove(&block);
            }
        }
        if slot.received {
            return None;
        }
        slot.received = true;
        progress.contributors.insert(peer);
        Some(requesters.into_iter().filter(|k| *k != peer).collect())
    }

    /// Undo a block the store refused
    pub fn on_block_rejected(&mut self, block: BlockRef) {
        if let Some(progress) = self.progress.get_mut(&block.piece) {
            if let Some(slot) = progress.blocks.get_mut(block.index()) {
                slot.received = false;
            }
        }
    }

    /// Piece verified; returns requests still outstanding for it
    pub fn on_piece_verified(&mut self, piece: u32) -> Vec<(PeerKey, BlockRef)> {
        let Some(flag) = self.verified.get_mut(piece as usize) else {
            return Vec::new();
        };
        if !*flag {
            *flag = true;
            self.missing -= 1;
        }
        self.drop_progress(piece)
    }

    /// Hash mismatch: the piece starts over. Returns the peers that contributed.
    pub fn on_piece_failed(&mut self, piece: u32) -> Vec<PeerKey> {
        let mut contributors: Vec<PeerKey> = self
            .progress
            .get(&piece)
            .map(|p| p.contributors.iter().copied().collect())
            .unwrap_or_default();
        contributors.sort_unstable();
        self.drop_progress(piece);
        contributors
    }

    fn drop_progress(&mut self, piece: u32) -> Vec<(PeerKey, BlockRef)> {
        let Some(progress) = self.progress.remove(&piece) else {
            return Vec::new();
        };
        let piece_len = self.piece_lengths[piece as usize];
        let mut outstanding = Vec::new();
        for (block, slot) in blocks_of(piece, piece_len).zip(progress.blocks) {
            for (peer, _) in slot.requests {
                if let Some(blocks) = self.inflight.get_mut(&peer) {
                    blocks.remove(&block);
                }
                outstanding.push((peer, block));
            }
        }
        outstanding
    }

    /// Forget every request of a departed peer; returns exactly those blocks
    pub fn release_peer(&mut self, peer: PeerKey) -> Vec<BlockRef> {
        let Some(blocks) = self.inflight.remove(&peer) else {
            return Vec::new();
        };
        let mut released: Vec<BlockRef> = blocks.into_iter().collect();
        released.sort();
        for block in &released {
            if let Some(slot) = self.progress.get_mut(&block.piece).and_then(|p| p.blocks.get_mut(block.index())) {
                slot.requests.retain(|(k, _)| *k != peer);
            }
        }
        released
    }

    /// Withdraw one request that never reached the peer
    pub fn cancel_request(&mut self, peer: PeerKey, block: BlockRef) {
        if let Some(blocks) = self.inflight.get_mut(&peer) {
            blocks.remove(&block);
        }
        if let Some(slot) = self.progress.get_mut(&block.piece).and_then(|p| p.blocks.get_mut(block.index())) {
            slot.requests.retain(|(k, _)| *k != peer);
        }
    }

    /// Drop requests older than the request timeout
    pub fn expire(&mut self, now: Instant) -> Vec<(PeerKey, BlockRef)> {
        let timeout = self.config.request_timeout;
        let mut expired = Vec::new();
        for (&piece, progress) in self.progress.iter_mut() {
            let piece_len = self.piece_lengths[piece as usize];
            for (block, slot) in blocks_of(piece, piece_len).zip(progress.blocks.iter_mut()) {
                slot.requests.retain(|(peer, sent)| {
                    let stale = now.saturating_duration_since(*sent) >= timeout;
                    if stale {
                        expired.push((*peer, block));
                    }
                    !stale
                });
            }
        }
        for (peer, block) in &expired {
            if let Some(blocks) = self.inflight.get_mut(peer) {
                blocks.remove(block);
            }
        }
        expired.sort();
        expired
    }

    /// No request of the piece is in flight
    pub fn is_piece_idle(&self, piece: u32) -> bool {
        self.progress.get(&piece).map(PieceProgress::is_idle).unwrap_or(true)
    }

    /// Peers currently asked for `block`
    pub fn requesters(&self, block: &BlockRef) -> Vec<PeerKey> {
        self.progress
            .get(&block.piece)
            .and_then(|p| p.blocks.get(block.index()))
            .map(|s| s.requests.iter().map(|(k, _)| *k).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::fixtures;

    fn info(pieces: usize, piece_len: usize) -> TorrentInfo {
        fixtures::single_file("sel.bin", &vec![0u8; pieces * piece_len], piece_len).info
    }

    fn config(max_inflight: usize) -> SelectorConfig {
        SelectorConfig {
            max_inflight_per_peer: max_inflight,
            ..SelectorConfig::default()
        }
    }

    fn seed(pieces: usize) -> Bitfield {
        let mut bitfield = Bitfield::new(pieces);
        for p in 0..pieces as u32 {
            bitfield.set(p);
        }
        bitfield
    }

    #[test]
    fn test_two_streams_take_priority_over_rarest() {
        let info = info(64, 16384);
        let mut selector = PieceSelector::new(&info, config(16));
        let first = info.piece_at(0);
        let second = info.piece_at(800_000);
        assert_eq!(second, 48);
        selector.set_demand(1, (first..first + 5).collect());
        selector.set_demand(2, (second..second + 5).collect());

        let mut availability = vec![2u32; 64];
        availability[30] = 1;
        let bitfield = seed(64);
        let peers = vec![(1, &bitfield), (2, &bitfield)];
        let issued = selector.schedule(&peers, &availability, Instant::now());

        let order: Vec<u32> = issued.iter().map(|(_, b)| b.piece).collect();
        assert_eq!(&order[..10], &[0, 48, 1, 49, 2, 50, 3, 51, 4, 52]);
        assert_eq!(order[10], 30);
        assert_eq!(issued.len(), 32);
    }

    #[test]
    fn test_duplicate_cap_outside_endgame() {
        let info = info(16, 65536);
        let mut selector = PieceSelector::new(&info, config(1));
        selector.set_demand(1, vec![0]);
        let bitfield = seed(16);
        let peers: Vec<_> = (1..=5).map(|k| (k, &bitfield)).collect();
        let issued = selector.schedule(&peers, &[5; 16], Instant::now());
        assert_eq!(issued.len(), 5);

        let on_piece0: HashSet<PeerKey> = issued.iter().filter(|(_, b)| b.piece == 0).map(|(k, _)| *k).collect();
        assert_eq!(on_piece0.len(), 3);
        assert!(selector.requesters(&BlockRef::new(0, 3 * 16384, 16384)).is_empty());
        // no block twice
        let blocks: HashSet<BlockRef> = issued.iter().map(|(_, b)| *b).collect();
        assert_eq!(blocks.len(), issued.len());
    }

    #[test]
    fn test_release_returns_exactly_inflight_blocks() {
        let info = info(8, 65536);
        let mut selector = PieceSelector::new(&info, config(6));
        let bitfield = seed(8);
        let issued = selector.schedule(&[(1, &bitfield)], &[1; 8], Instant::now());
        assert_eq!(issued.len(), 6);
        assert_eq!(selector.inflight_count(1), 6);

        let released = selector.release_peer(1);
        assert_eq!(released.len(), 6);
        assert_eq!(selector.inflight_count(1), 0);
        assert_eq!(selector.total_inflight(), 0);
        assert!(selector.release_peer(1).is_empty());

        let reissued = selector.schedule(&[(2, &bitfield)], &[1; 8], Instant::now());
        let mut blocks: Vec<BlockRef> = reissued.iter().map(|(_, b)| *b).collect();
        blocks.sort();
        assert_eq!(blocks, released);
    }

    #[test]
    fn test_endgame_duplicates_and_cancels() {
        let info = info(2, 65536);
        let mut selector = PieceSelector::new(&info, config(8));
        assert!(selector.is_endgame());
        let bitfield = seed(2);
        let issued = selector.schedule(&[(1, &bitfield), (2, &bitfield)], &[2, 2], Instant::now());
        assert_eq!(issued.len(), 16);

        let block = BlockRef::new(0, 0, 16384);
        assert_eq!(selector.requesters(&block), vec![1, 2]);
        assert_eq!(selector.on_block_received(1, block), Some(vec![2]));
        assert_eq!(selector.inflight_count(2), 7);
        assert_eq!(selector.on_block_received(2, block), None);
    }

    #[test]
    fn test_expire_returns_blocks_to_pool() {
        let info = info(4, 16384);
        let mut selector = PieceSelector::new(&info, config(2));
        let bitfield = seed(4);
        let start = Instant::now();
        let issued = selector.schedule(&[(1, &bitfield)], &[1; 4], start);
        assert_eq!(issued.len(), 2);
        assert!(selector.expire(start + Duration::from_secs(5)).is_empty());

        let expired = selector.expire(start + Duration::from_secs(31));
        assert_eq!(expired.len(), 2);
        assert!(selector.is_piece_idle(issued[0].1.piece));
        assert_eq!(selector.inflight_count(1), 0);
    }

    #[test]
    fn test_failed_piece_reports_contributors_and_restarts() {
        let info = info(8, 32768);
        let mut selector = PieceSelector::new(&info, config(1));
        selector.set_demand(1, vec![0]);
        let bitfield = seed(8);
        let issued = selector.schedule(&[(1, &bitfield), (2, &bitfield)], &[2; 8], Instant::now());
        assert_eq!(issued, vec![(1, BlockRef::new(0, 0, 16384)), (2, BlockRef::new(0, 16384, 16384))]);

        assert_eq!(selector.on_block_received(1, issued[0].1), Some(vec![]));
        assert_eq!(selector.on_block_received(2, issued[1].1), Some(vec![]));
        assert_eq!(selector.on_piece_failed(0), vec![1, 2]);

        let again = selector.schedule(&[(3, &bitfield)], &[2; 8], Instant::now());
        assert_eq!(again[0], (3, BlockRef::new(0, 0, 16384)));
    }

    #[test]
    fn test_verified_piece_leaves_window() {
        let info = info(8, 16384);
        let mut selector = PieceSelector::new(&info, config(4));
        selector.set_demand(1, vec![2, 3]);
        selector.set_demand(2, vec![0]);
        assert_eq!(selector.priority_pieces(), vec![0, 2, 3]);
        selector.on_piece_verified(0);
        assert_eq!(selector.priority_pieces(), vec![2, 3]);
        assert_eq!(selector.missing_count(), 7);
        selector.clear_demand(1);
        assert!(selector.priority_pieces().is_empty());
    }

    #[test]
    fn test_block_geometry_checked() {
        let info = info(2, 20000);
        let selector = PieceSelector::new(&info, config(4));
        assert!(selector.is_valid_block(&BlockRef::new(0, 16384, 20000 - 16384)));
        assert!(!selector.is_valid_block(&BlockRef::new(0, 16384, 16384)));
        assert!(!selector.is_valid_block(&BlockRef::new(0, 100, 16384)));
        assert!(!selector.is_valid_block(&BlockRef::new(2, 0, 16384)));
    }
}
