//! In-memory block index.
//!
//! The index is a tree of block descriptors keyed by hash. Nodes live in an
//! arena owned by the index; parent links are stable arena handles, so status
//! mutation never touches ancestors and no ownership cycles exist.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use emberd_consensus::{Hash256, ZERO_HASH};
use emberd_consensus::pow::work_from_bits;
use emberd_primitives::BlockHeader;
use emberd_storage::{KeyValueStore, WriteBatch};
use primitive_types::U256;

use crate::chainio;
use crate::error::ChainError;
use crate::stake::StakeNode;

/// Validation status bit-set of an index entry.
///
/// `VALIDATE_FAILED` and `INVALID_ANCESTOR` are absorbing once set; `VALID`
/// implies the block data is present.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BlockStatus(u8);

impl BlockStatus {
    pub const NONE: BlockStatus = BlockStatus(0);
    pub const HAVE_DATA: BlockStatus = BlockStatus(1 << 0);
    pub const VALID: BlockStatus = BlockStatus(1 << 1);
    pub const VALIDATE_FAILED: BlockStatus = BlockStatus(1 << 2);
    pub const INVALID_ANCESTOR: BlockStatus = BlockStatus(1 << 3);

    pub fn from_bits(bits: u8) -> Self {
        BlockStatus(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn merged(self, other: BlockStatus) -> Self {
        BlockStatus(self.0 | other.0)
    }

    pub fn have_data(self) -> bool {
        self.0 & Self::HAVE_DATA.0 != 0
    }

    pub fn known_valid(self) -> bool {
        self.0 & Self::VALID.0 != 0
    }

    pub fn known_invalid(self) -> bool {
        self.0 & (Self::VALIDATE_FAILED.0 | Self::INVALID_ANCESTOR.0) != 0
    }
}

/// Stable handle to a node in the index arena.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Per-block ticket deltas carried by an index entry. Transient: the pruner
/// drops them for nodes far from the tip.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TicketInfo {
    pub new_tickets: Vec<Hash256>,
    pub tickets_voted: Vec<Hash256>,
    pub tickets_revoked: Vec<Hash256>,
}

struct BlockNode {
    hash: Hash256,
    parent: Option<NodeId>,
    height: i64,
    work_sum: U256,
    header: BlockHeader,
    status: BlockStatus,
    stake_node: Option<Arc<StakeNode>>,
    ticket_info: Option<TicketInfo>,
}

#[derive(Default)]
struct IndexInner {
    nodes: Vec<BlockNode>,
    by_hash: HashMap<Hash256, NodeId>,
    chain_tips: HashMap<i64, Vec<NodeId>>,
    leaf_tips: HashSet<NodeId>,
    dirty: HashSet<NodeId>,
}

pub struct BlockIndex<S> {
    db: Arc<S>,
    inner: RwLock<IndexInner>,
}

impl<S> BlockIndex<S> {
    pub fn new(db: Arc<S>) -> Self {
        Self {
            db,
            inner: RwLock::new(IndexInner::default()),
        }
    }
}

fn lock_poisoned() -> ChainError {
    ChainError::Assert("block index lock poisoned".to_string())
}

impl<S: KeyValueStore> BlockIndex<S> {
    pub fn lookup_node(&self, hash: &Hash256) -> Option<NodeId> {
        let inner = self.inner.read().ok()?;
        inner.by_hash.get(hash).copied()
    }

    pub fn have_block(&self, hash: &Hash256) -> bool {
        self.lookup_node(hash).is_some()
    }

    /// Inserts a new entry for the header whose parent is already indexed
    /// (`None` only for genesis). Height and cumulative work are fixed at
    /// insertion and never recomputed.
    pub fn add_node(
        &self,
        header: &BlockHeader,
        parent: Option<NodeId>,
        status: BlockStatus,
    ) -> Result<NodeId, ChainError> {
        let hash = header.hash();
        let mut inner = self.inner.write().map_err(|_| lock_poisoned())?;

        if inner.by_hash.contains_key(&hash) {
            return Err(ChainError::DuplicateBlock(hash));
        }

        let (height, work_sum) = match parent {
            Some(parent_id) => {
                let parent_node = inner
                    .nodes
                    .get(parent_id.index())
                    .ok_or_else(|| ChainError::Assert("parent handle out of range".to_string()))?;
                if parent_node.hash != header.prev_block {
                    return Err(ChainError::Assert(format!(
                        "header at height {} does not connect to the given parent",
                        header.height
                    )));
                }
                (
                    parent_node.height + 1,
                    parent_node.work_sum + work_from_bits(header.bits),
                )
            }
            None => {
                if header.prev_block != ZERO_HASH {
                    return Err(ChainError::Assert(
                        "non-genesis header inserted without a parent".to_string(),
                    ));
                }
                (0, work_from_bits(header.bits))
            }
        };

        let id = NodeId(inner.nodes.len() as u32);
        inner.nodes.push(BlockNode {
            hash,
            parent,
            height,
            work_sum,
            header: header.clone(),
            status,
            stake_node: None,
            ticket_info: None,
        });
        inner.by_hash.insert(hash, id);
        inner.chain_tips.entry(height).or_default().push(id);
        if let Some(parent_id) = parent {
            inner.leaf_tips.remove(&parent_id);
        }
        inner.leaf_tips.insert(id);
        inner.dirty.insert(id);
        Ok(id)
    }

    pub fn node_status(&self, id: NodeId) -> BlockStatus {
        self.inner
            .read()
            .ok()
            .and_then(|inner| inner.nodes.get(id.index()).map(|node| node.status))
            .unwrap_or(BlockStatus::NONE)
    }

    /// OR-merges the flags into the node's status and marks it dirty.
    /// `INVALID_ANCESTOR` is propagated to descendants only by explicit
    /// walks in the tip engine, never implicitly here.
    pub fn set_status_flags(&self, id: NodeId, flags: BlockStatus) {
        if let Ok(mut inner) = self.inner.write() {
            if let Some(node) = inner.nodes.get_mut(id.index()) {
                node.status = node.status.merged(flags);
            }
            inner.dirty.insert(id);
        }
    }

    pub fn hash_of(&self, id: NodeId) -> Hash256 {
        self.inner
            .read()
            .ok()
            .and_then(|inner| inner.nodes.get(id.index()).map(|node| node.hash))
            .unwrap_or(ZERO_HASH)
    }

    pub fn height_of(&self, id: NodeId) -> i64 {
        self.inner
            .read()
            .ok()
            .and_then(|inner| inner.nodes.get(id.index()).map(|node| node.height))
            .unwrap_or(-1)
    }

    pub fn parent_of(&self, id: NodeId) -> Option<NodeId> {
        let inner = self.inner.read().ok()?;
        inner.nodes.get(id.index()).and_then(|node| node.parent)
    }

    pub fn work_sum_of(&self, id: NodeId) -> U256 {
        self.inner
            .read()
            .ok()
            .and_then(|inner| inner.nodes.get(id.index()).map(|node| node.work_sum))
            .unwrap_or_default()
    }

    pub fn header_of(&self, id: NodeId) -> Option<BlockHeader> {
        let inner = self.inner.read().ok()?;
        inner.nodes.get(id.index()).map(|node| node.header.clone())
    }

    pub fn vote_bits_of(&self, id: NodeId) -> u16 {
        self.inner
            .read()
            .ok()
            .and_then(|inner| inner.nodes.get(id.index()).map(|node| node.header.vote_bits))
            .unwrap_or(0)
    }

    pub fn timestamp_of(&self, id: NodeId) -> i64 {
        self.inner
            .read()
            .ok()
            .and_then(|inner| {
                inner
                    .nodes
                    .get(id.index())
                    .map(|node| node.header.timestamp as i64)
            })
            .unwrap_or(0)
    }

    /// The ancestor of `id` at the given height, walking parent links.
    pub fn ancestor_of(&self, id: NodeId, height: i64) -> Option<NodeId> {
        let inner = self.inner.read().ok()?;
        let mut node = inner.nodes.get(id.index())?;
        if height > node.height || height < 0 {
            return None;
        }
        let mut current = id;
        while node.height > height {
            current = node.parent?;
            node = inner.nodes.get(current.index())?;
        }
        Some(current)
    }

    /// Median timestamp of the node and up to ten of its ancestors.
    pub fn median_time_of(&self, id: NodeId) -> i64 {
        const MEDIAN_TIME_BLOCKS: usize = 11;
        let inner = match self.inner.read() {
            Ok(inner) => inner,
            Err(_) => return 0,
        };
        let mut times = Vec::with_capacity(MEDIAN_TIME_BLOCKS);
        let mut cursor = inner.nodes.get(id.index());
        while let Some(node) = cursor {
            times.push(node.header.timestamp as i64);
            if times.len() == MEDIAN_TIME_BLOCKS {
                break;
            }
            cursor = node.parent.and_then(|parent| inner.nodes.get(parent.index()));
        }
        times.sort_unstable();
        times[times.len() / 2]
    }

    /// All entries at the given height, in insertion order.
    pub fn chain_tips_at(&self, height: i64) -> Vec<NodeId> {
        self.inner
            .read()
            .ok()
            .and_then(|inner| inner.chain_tips.get(&height).cloned())
            .unwrap_or_default()
    }

    /// Entries without any descendant: the tips of every known branch,
    /// ordered by height then insertion.
    pub fn leaf_tips(&self) -> Vec<NodeId> {
        let Ok(inner) = self.inner.read() else {
            return Vec::new();
        };
        let mut tips: Vec<NodeId> = inner.leaf_tips.iter().copied().collect();
        tips.sort_by_key(|id| {
            inner
                .nodes
                .get(id.index())
                .map(|node| (std::cmp::Reverse(node.height), id.index()))
                .unwrap_or((std::cmp::Reverse(0), id.index()))
        });
        tips
    }

    pub fn stake_node_of(&self, id: NodeId) -> Option<Arc<StakeNode>> {
        let inner = self.inner.read().ok()?;
        inner
            .nodes
            .get(id.index())
            .and_then(|node| node.stake_node.clone())
    }

    pub fn set_stake_node(&self, id: NodeId, stake_node: Arc<StakeNode>) {
        if let Ok(mut inner) = self.inner.write() {
            if let Some(node) = inner.nodes.get_mut(id.index()) {
                node.stake_node = Some(stake_node);
            }
        }
    }

    pub fn ticket_info_of(&self, id: NodeId) -> Option<TicketInfo> {
        let inner = self.inner.read().ok()?;
        inner
            .nodes
            .get(id.index())
            .and_then(|node| node.ticket_info.clone())
    }

    pub fn set_ticket_info(&self, id: NodeId, info: TicketInfo) {
        if let Ok(mut inner) = self.inner.write() {
            if let Some(node) = inner.nodes.get_mut(id.index()) {
                node.ticket_info = Some(info);
            }
            inner.dirty.insert(id);
        }
    }

    /// Drops the transient stake data of the node, leaving durable fields
    /// untouched.
    pub fn clear_stake_data(&self, id: NodeId) {
        if let Ok(mut inner) = self.inner.write() {
            if let Some(node) = inner.nodes.get_mut(id.index()) {
                node.stake_node = None;
                node.ticket_info = None;
            }
        }
    }

    /// Forgets pending durable-status changes. Only valid when the in-memory
    /// entries are known to match the store, as after an initial load.
    pub fn clear_dirty(&self) {
        if let Ok(mut inner) = self.inner.write() {
            inner.dirty.clear();
        }
    }

    pub fn dirty_count(&self) -> usize {
        self.inner
            .read()
            .map(|inner| inner.dirty.len())
            .unwrap_or(0)
    }

    pub fn node_count(&self) -> usize {
        self.inner
            .read()
            .map(|inner| inner.nodes.len())
            .unwrap_or(0)
    }

    /// Atomically writes every dirty entry to the store, then clears the
    /// dirty set. The batch commits or fails as a unit, so a failure leaves
    /// the dirty set intact for a later retry.
    pub fn flush(&self) -> Result<(), ChainError> {
        let mut batch = WriteBatch::new();
        {
            let inner = self.inner.read().map_err(|_| lock_poisoned())?;
            if inner.dirty.is_empty() {
                return Ok(());
            }
            for id in &inner.dirty {
                let node = inner
                    .nodes
                    .get(id.index())
                    .ok_or_else(|| ChainError::Assert("dirty handle out of range".to_string()))?;
                let key = chainio::block_index_key(node.height, &node.hash);
                let value = chainio::serialize_block_index_entry(
                    &node.header,
                    node.status,
                    node.ticket_info.as_ref(),
                );
                batch.put(emberd_storage::Column::BlockIndex, key, value);
            }
        }
        self.db.write_batch(&batch)?;
        let mut inner = self.inner.write().map_err(|_| lock_poisoned())?;
        inner.dirty.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emberd_consensus::constants::FINAL_STATE_SIZE;
    use emberd_storage::memory::MemoryStore;

    fn header(height: u32, prev: Hash256, nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_block: prev,
            merkle_root: [0u8; 32],
            vote_bits: 1,
            voters: 0,
            fresh_stake: 0,
            revocations: 0,
            final_state: [0u8; FINAL_STATE_SIZE],
            pool_size: 0,
            bits: 0x207fffff,
            sbits: 20_000,
            height,
            size: 0,
            timestamp: 1_538_524_800 + height,
            nonce,
            stake_version: 0,
        }
    }

    fn index_with_genesis() -> (BlockIndex<MemoryStore>, NodeId, Hash256) {
        let index = BlockIndex::new(Arc::new(MemoryStore::new()));
        let genesis = header(0, ZERO_HASH, 0);
        let genesis_hash = genesis.hash();
        let id = index
            .add_node(&genesis, None, BlockStatus::HAVE_DATA.merged(BlockStatus::VALID))
            .expect("genesis");
        (index, id, genesis_hash)
    }

    #[test]
    fn heights_and_parents_are_linked() {
        let (index, genesis, genesis_hash) = index_with_genesis();
        let child = header(1, genesis_hash, 1);
        let child_id = index
            .add_node(&child, Some(genesis), BlockStatus::HAVE_DATA)
            .expect("child");

        assert_eq!(index.height_of(child_id), 1);
        assert_eq!(index.parent_of(child_id), Some(genesis));
        assert!(index.work_sum_of(child_id) > index.work_sum_of(genesis));
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let (index, genesis, genesis_hash) = index_with_genesis();
        let child = header(1, genesis_hash, 1);
        index
            .add_node(&child, Some(genesis), BlockStatus::HAVE_DATA)
            .expect("child");
        let err = index
            .add_node(&child, Some(genesis), BlockStatus::HAVE_DATA)
            .expect_err("duplicate");
        assert!(matches!(err, ChainError::DuplicateBlock(_)));
    }

    #[test]
    fn status_flags_are_absorbing() {
        let (index, genesis, genesis_hash) = index_with_genesis();
        let child = header(1, genesis_hash, 1);
        let id = index
            .add_node(&child, Some(genesis), BlockStatus::HAVE_DATA)
            .expect("child");

        index.set_status_flags(id, BlockStatus::VALIDATE_FAILED);
        index.set_status_flags(id, BlockStatus::VALID);
        let status = index.node_status(id);
        assert!(status.known_invalid());
        assert!(status.have_data());
    }

    #[test]
    fn flush_clears_dirty_set() {
        let (index, genesis, genesis_hash) = index_with_genesis();
        let child = header(1, genesis_hash, 1);
        index
            .add_node(&child, Some(genesis), BlockStatus::HAVE_DATA)
            .expect("child");
        assert_eq!(index.dirty_count(), 2);
        index.flush().expect("flush");
        assert_eq!(index.dirty_count(), 0);
    }

    #[test]
    fn ancestor_walk() {
        let (index, genesis, genesis_hash) = index_with_genesis();
        let mut prev_hash = genesis_hash;
        let mut prev_id = genesis;
        for height in 1..=5u32 {
            let entry = header(height, prev_hash, height);
            prev_hash = entry.hash();
            prev_id = index
                .add_node(&entry, Some(prev_id), BlockStatus::HAVE_DATA)
                .expect("add");
        }
        let ancestor = index.ancestor_of(prev_id, 2).expect("ancestor");
        assert_eq!(index.height_of(ancestor), 2);
        assert_eq!(index.ancestor_of(prev_id, 9), None);
    }
}
