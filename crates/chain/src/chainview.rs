//! Height-indexed view of the active branch through the block index.
//!
//! The view is a dense array of node handles indexed by height, giving O(1)
//! navigation along the current main chain. Only `set_tip` is more expensive,
//! proportional to the depth of the branch switch.

use emberd_consensus::Hash256;
use emberd_storage::KeyValueStore;

use crate::blockindex::{BlockIndex, NodeId};

#[derive(Default)]
pub struct ChainView {
    nodes: Vec<NodeId>,
}

impl ChainView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tip(&self) -> Option<NodeId> {
        self.nodes.last().copied()
    }

    pub fn genesis(&self) -> Option<NodeId> {
        self.nodes.first().copied()
    }

    /// Height of the tip, or -1 for an empty view.
    pub fn height(&self) -> i64 {
        self.nodes.len() as i64 - 1
    }

    pub fn node_by_height(&self, height: i64) -> Option<NodeId> {
        if height < 0 {
            return None;
        }
        self.nodes.get(height as usize).copied()
    }

    /// Whether the node lies on this view's branch.
    pub fn contains<S: KeyValueStore>(&self, index: &BlockIndex<S>, id: NodeId) -> bool {
        self.node_by_height(index.height_of(id)) == Some(id)
    }

    /// Successor of the node on this view, or `None` at or past the tip.
    pub fn next<S: KeyValueStore>(&self, index: &BlockIndex<S>, id: NodeId) -> Option<NodeId> {
        if !self.contains(index, id) {
            return None;
        }
        self.node_by_height(index.height_of(id) + 1)
    }

    /// The deepest ancestor of `id` that lies on this view. Walks upward, so
    /// the cost is proportional to the fork depth.
    pub fn find_fork<S: KeyValueStore>(&self, index: &BlockIndex<S>, id: NodeId) -> Option<NodeId> {
        let mut cursor = id;
        loop {
            if self.contains(index, cursor) {
                return Some(cursor);
            }
            cursor = index.parent_of(cursor)?;
        }
    }

    /// Makes `id` the tip, truncating and repopulating by walking ancestors
    /// until one already on the view is found.
    pub fn set_tip<S: KeyValueStore>(&mut self, index: &BlockIndex<S>, id: NodeId) {
        let height = index.height_of(id);
        if height < 0 {
            return;
        }
        self.nodes.truncate(height as usize + 1);
        self.nodes
            .resize(height as usize + 1, id);

        let mut cursor = Some(id);
        while let Some(node) = cursor {
            let node_height = index.height_of(node) as usize;
            if self.nodes[node_height] == node && node != id {
                break;
            }
            self.nodes[node_height] = node;
            cursor = index.parent_of(node);
        }
    }

    /// Block locator for the node (the tip when `None`): hashes descending
    /// from the node, stepping back by one for the first ten entries and then
    /// doubling the step, always ending at genesis.
    pub fn block_locator<S: KeyValueStore>(
        &self,
        index: &BlockIndex<S>,
        id: Option<NodeId>,
    ) -> Vec<Hash256> {
        let node = match id.or_else(|| self.tip()) {
            Some(node) => node,
            None => return Vec::new(),
        };

        let mut locator = Vec::new();
        let mut step = 1i64;
        let mut height = index.height_of(node);
        let mut cursor = Some(node);
        while let Some(node) = cursor {
            locator.push(index.hash_of(node));
            if height == 0 {
                break;
            }
            height = (height - step).max(0);
            if locator.len() >= 10 {
                step *= 2;
            }
            // Prefer the O(1) view lookup when the remaining walk is on this
            // branch; otherwise walk parent links through the side chain.
            cursor = if self.contains(index, node) {
                self.node_by_height(height)
            } else {
                index.ancestor_of(node, height)
            };
        }
        locator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockindex::BlockStatus;
    use emberd_consensus::constants::FINAL_STATE_SIZE;
    use emberd_consensus::ZERO_HASH;
    use emberd_primitives::BlockHeader;
    use emberd_storage::memory::MemoryStore;
    use std::sync::Arc;

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

    /// Builds a chain of the given length plus a fork of `fork_len` blocks
    /// branching at `fork_height`.
    fn build_index(
        main_len: u32,
        fork_height: u32,
        fork_len: u32,
    ) -> (BlockIndex<MemoryStore>, Vec<NodeId>, Vec<NodeId>) {
        let index = BlockIndex::new(Arc::new(MemoryStore::new()));
        let genesis = header(0, ZERO_HASH, 0);
        let mut main = vec![index
            .add_node(&genesis, None, BlockStatus::HAVE_DATA)
            .expect("genesis")];
        let mut prev_hash = genesis.hash();
        for height in 1..=main_len {
            let entry = header(height, prev_hash, height);
            prev_hash = entry.hash();
            let id = index
                .add_node(&entry, Some(main[height as usize - 1]), BlockStatus::HAVE_DATA)
                .expect("main");
            main.push(id);
        }

        let mut side = Vec::new();
        let mut prev = main[fork_height as usize];
        let mut prev_hash = index.hash_of(prev);
        for offset in 1..=fork_len {
            let entry = header(fork_height + offset, prev_hash, 0x8000_0000 + offset);
            prev_hash = entry.hash();
            prev = index
                .add_node(&entry, Some(prev), BlockStatus::HAVE_DATA)
                .expect("side");
            side.push(prev);
        }
        (index, main, side)
    }

    #[test]
    fn set_tip_and_navigation() {
        let (index, main, _) = build_index(5, 0, 0);
        let mut view = ChainView::new();
        view.set_tip(&index, main[5]);

        assert_eq!(view.tip(), Some(main[5]));
        assert_eq!(view.genesis(), Some(main[0]));
        assert_eq!(view.height(), 5);
        assert_eq!(view.node_by_height(3), Some(main[3]));
        assert_eq!(view.next(&index, main[3]), Some(main[4]));
        assert_eq!(view.next(&index, main[5]), None);
        assert!(view.contains(&index, main[2]));
    }

    #[test]
    fn find_fork_on_side_chain() {
        let (index, main, side) = build_index(6, 3, 2);
        let mut view = ChainView::new();
        view.set_tip(&index, main[6]);

        let fork = view.find_fork(&index, *side.last().expect("side tip"));
        assert_eq!(fork, Some(main[3]));
        assert!(!view.contains(&index, side[0]));
    }

    #[test]
    fn set_tip_switches_branches() {
        let (index, main, side) = build_index(4, 2, 3);
        let mut view = ChainView::new();
        view.set_tip(&index, main[4]);
        view.set_tip(&index, side[2]);

        assert_eq!(view.height(), 5);
        assert_eq!(view.node_by_height(2), Some(main[2]));
        assert_eq!(view.node_by_height(3), Some(side[0]));
        assert_eq!(view.tip(), Some(side[2]));
    }

    #[test]
    fn locator_starts_at_node_and_ends_at_genesis() {
        let (index, main, _) = build_index(40, 0, 0);
        let view = {
            let mut view = ChainView::new();
            view.set_tip(&index, main[40]);
            view
        };

        let locator = view.block_locator(&index, None);
        assert_eq!(locator[0], index.hash_of(main[40]));
        assert_eq!(*locator.last().expect("genesis"), index.hash_of(main[0]));

        // First ten entries step back by one.
        for (offset, hash) in locator.iter().take(10).enumerate() {
            assert_eq!(*hash, index.hash_of(main[40 - offset]));
        }

        // Bounded by 10 + ceil(log2(height)) + 1.
        let bound = 10 + (64 - (40u64).leading_zeros() as usize) + 1;
        assert!(locator.len() <= bound, "locator length {}", locator.len());
    }

    #[test]
    fn locator_for_side_chain_node_walks_parents() {
        let (index, _, side) = build_index(6, 3, 2);
        let mut view = ChainView::new();
        view.set_tip(&index, side[1]);
        let locator = view.block_locator(&index, Some(side[1]));
        assert_eq!(locator[0], index.hash_of(side[1]));
        assert_eq!(locator.len() as i64, index.height_of(side[1]) + 1);
    }
}
