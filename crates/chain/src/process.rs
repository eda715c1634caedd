//! Block intake: duplicate detection, orphan handling, and acceptance.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use emberd_consensus::Hash256;
use emberd_primitives::Block;
use emberd_storage::{KeyValueStore, WriteBatch};
use log::debug;

use crate::blockindex::{BlockStatus, TicketInfo};
use crate::chain::Chain;
use crate::chainio;
use crate::error::{rule_error, ChainError, RuleErrorKind};
use crate::notifications::Notification;
use crate::validate::{check_block_sanity, BehaviorFlags};

/// The maximum number of orphan blocks queued at once.
pub const MAX_ORPHAN_BLOCKS: usize = 500;

/// How long an orphan is held before lazy expiry.
const ORPHAN_EXPIRE: Duration = Duration::from_secs(60 * 60);

struct OrphanBlock {
    block: Arc<Block>,
    expiration: SystemTime,
}

#[derive(Default)]
struct OrphanInner {
    orphans: HashMap<Hash256, OrphanBlock>,
    prev_orphans: HashMap<Hash256, Vec<Hash256>>,
}

impl OrphanInner {
    fn remove(&mut self, hash: &Hash256) {
        let Some(orphan) = self.orphans.remove(hash) else {
            return;
        };
        let prev_hash = orphan.block.header.prev_block;
        if let Some(bucket) = self.prev_orphans.get_mut(&prev_hash) {
            bucket.retain(|entry| entry != hash);
            if bucket.is_empty() {
                self.prev_orphans.remove(&prev_hash);
            }
        }
    }
}

/// Bounded, parent-keyed holding area for blocks whose parent is unknown.
/// Guarded by its own lock so read-only queries do not contend with block
/// processing.
#[derive(Default)]
pub(crate) struct OrphanPool {
    inner: RwLock<OrphanInner>,
}

impl OrphanPool {
    pub fn contains(&self, hash: &Hash256) -> bool {
        self.inner
            .read()
            .map(|inner| inner.orphans.contains_key(hash))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .map(|inner| inner.orphans.len())
            .unwrap_or(0)
    }

    pub fn get(&self, hash: &Hash256) -> Option<Arc<Block>> {
        let inner = self.inner.read().ok()?;
        inner.orphans.get(hash).map(|orphan| Arc::clone(&orphan.block))
    }

    /// Adds the block, lazily expiring stale entries first and evicting the
    /// record with the earliest expiration when at capacity. Re-adding a
    /// known orphan is a no-op.
    pub fn add(&self, block: Arc<Block>, now: SystemTime) {
        let hash = block.hash();
        let Ok(mut inner) = self.inner.write() else {
            return;
        };
        if inner.orphans.contains_key(&hash) {
            return;
        }

        let expired: Vec<Hash256> = inner
            .orphans
            .iter()
            .filter(|(_, orphan)| orphan.expiration <= now)
            .map(|(hash, _)| *hash)
            .collect();
        for hash in expired {
            inner.remove(&hash);
        }

        if inner.orphans.len() + 1 > MAX_ORPHAN_BLOCKS {
            let oldest = inner
                .orphans
                .iter()
                .min_by_key(|(_, orphan)| orphan.expiration)
                .map(|(hash, _)| *hash);
            if let Some(oldest) = oldest {
                inner.remove(&oldest);
            }
        }

        let prev_hash = block.header.prev_block;
        inner.orphans.insert(
            hash,
            OrphanBlock {
                block,
                expiration: now + ORPHAN_EXPIRE,
            },
        );
        inner.prev_orphans.entry(prev_hash).or_default().push(hash);
    }

    pub fn remove(&self, hash: &Hash256) {
        if let Ok(mut inner) = self.inner.write() {
            inner.remove(hash);
        }
    }

    /// Follows parent links within the pool to the most distant missing
    /// ancestor, used to request the gap from peers.
    pub fn root_of(&self, hash: &Hash256) -> Hash256 {
        let Ok(inner) = self.inner.read() else {
            return *hash;
        };
        let mut root = *hash;
        let mut cursor = *hash;
        while let Some(orphan) = inner.orphans.get(&cursor) {
            root = cursor;
            cursor = orphan.block.header.prev_block;
        }
        root
    }

    /// Hashes of pooled orphans whose parent is the given block.
    pub fn children_of(&self, parent: &Hash256) -> Vec<Hash256> {
        self.inner
            .read()
            .map(|inner| inner.prev_orphans.get(parent).cloned().unwrap_or_default())
            .unwrap_or_default()
    }
}

impl<S: KeyValueStore> Chain<S> {
    /// Handles a new candidate block: rejects duplicates, pools orphans, and
    /// otherwise accepts the block into the index and potentially the main
    /// chain. Returns the fork length and whether the block was pooled as an
    /// orphan. The caller is responsible for re-processing pooled orphans
    /// once their parent is accepted (see `orphan_children`).
    pub fn process_block(
        &self,
        block: Arc<Block>,
        flags: BehaviorFlags,
    ) -> Result<(i64, bool), ChainError> {
        let mut ctx = self.lock_chain_write()?;
        let mut sink = Vec::new();
        let result = self.process_block_locked(&mut ctx, &mut sink, block, flags);
        drop(ctx);
        self.deliver_notifications(sink);
        result
    }

    fn process_block_locked(
        &self,
        ctx: &mut crate::chain::ChainCtx,
        sink: &mut Vec<Notification>,
        block: Arc<Block>,
        flags: BehaviorFlags,
    ) -> Result<(i64, bool), ChainError> {
        let hash = block.hash();
        debug!("processing block {}", emberd_consensus::hash256_to_hex(&hash));

        if self.index.have_block(&hash) {
            return Err(ChainError::DuplicateBlock(hash));
        }

        let parent_known = self.index.lookup_node(&block.header.prev_block);
        if parent_known.is_none() && self.orphans.contains(&hash) {
            return Err(ChainError::DuplicateBlock(hash));
        }

        check_block_sanity(&block, self.time_source.as_ref(), flags, &self.params)?;

        let Some(parent) = parent_known else {
            debug!(
                "adding orphan block {} with parent {}",
                emberd_consensus::hash256_to_hex(&hash),
                emberd_consensus::hash256_to_hex(&block.header.prev_block)
            );
            self.orphans.add(block, SystemTime::now());
            return Ok((0, true));
        };

        // A block at a checkpoint height must be the checkpoint, and no new
        // branch may start below the latest checkpoint.
        if !ctx.no_checkpoints {
            let height = block.height();
            if let Some(checkpoint) = self.params.checkpoint_by_height(height) {
                if checkpoint.hash != hash {
                    return Err(rule_error(
                        RuleErrorKind::BadCheckpoint,
                        format!("block at height {height} does not match checkpoint"),
                    ));
                }
            }
            if height <= self.params.latest_checkpoint_height()
                && !ctx.best_chain.contains(&self.index, parent)
            {
                return Err(rule_error(
                    RuleErrorKind::ForkTooDeep,
                    format!("block at height {height} forks below the latest checkpoint"),
                ));
            }
        }

        let fork_len = self.maybe_accept_block(ctx, sink, Arc::clone(&block), parent, flags)?;

        // The block may have been pooled earlier and re-submitted once its
        // parent arrived.
        self.orphans.remove(&hash);

        Ok((fork_len, false))
    }

    /// Performs contextual checks, inserts the block into the index and the
    /// durable store, and hands it to the best-chain selector.
    fn maybe_accept_block(
        &self,
        ctx: &mut crate::chain::ChainCtx,
        sink: &mut Vec<Notification>,
        block: Arc<Block>,
        parent: crate::blockindex::NodeId,
        flags: BehaviorFlags,
    ) -> Result<i64, ChainError> {
        self.check_block_context(&block, parent, flags)?;

        let node = self
            .index
            .add_node(&block.header, Some(parent), BlockStatus::HAVE_DATA)?;
        self.index.set_ticket_info(node, ticket_info_for_block(&block));

        // Persist the raw block and its index entry immediately so the index
        // never points at data that is not durable, and side-chain entries
        // survive a restart.
        let mut batch = WriteBatch::new();
        chainio::put_block(&mut batch, &block);
        self.db.write_batch(&batch)?;
        self.index.flush()?;

        self.connect_best_chain(ctx, sink, node, block, flags)
    }
}

/// Per-block ticket deltas: purchases made in the block and the tickets its
/// votes and revocations consumed.
pub(crate) fn ticket_info_for_block(block: &Block) -> TicketInfo {
    let mut info = TicketInfo::default();
    for tx in &block.transactions {
        match tx.tx_type() {
            emberd_primitives::TxType::Ticket => info.new_tickets.push(tx.txid()),
            emberd_primitives::TxType::Vote => {
                if let Some(ticket) = tx.spent_ticket_hash() {
                    info.tickets_voted.push(ticket);
                }
            }
            emberd_primitives::TxType::Revocation => {
                if let Some(ticket) = tx.spent_ticket_hash() {
                    info.tickets_revoked.push(ticket);
                }
            }
            emberd_primitives::TxType::Regular => {}
        }
    }
    info
}

#[cfg(test)]
mod tests {
    use super::*;
    use emberd_consensus::constants::FINAL_STATE_SIZE;
    use emberd_primitives::{BlockHeader, OutPoint, Transaction, TxIn, TxOut};

    fn orphan_block(tag: u8) -> Arc<Block> {
        Arc::new(Block {
            header: BlockHeader {
                version: 1,
                prev_block: [tag; 32],
                merkle_root: [0u8; 32],
                vote_bits: 1,
                voters: 0,
                fresh_stake: 0,
                revocations: 0,
                final_state: [0u8; FINAL_STATE_SIZE],
                pool_size: 0,
                bits: 0x207fffff,
                sbits: 20_000,
                height: 10,
                size: 0,
                timestamp: 1_538_525_000 + tag as u32,
                nonce: tag as u32,
                stake_version: 0,
            },
            transactions: vec![Transaction {
                version: 1,
                inputs: vec![TxIn {
                    prevout: OutPoint::null(),
                    signature_script: vec![tag],
                    sequence: u32::MAX,
                }],
                outputs: vec![TxOut {
                    value: 0,
                    script_pubkey: vec![0x51],
                }],
                lock_time: 0,
                expiry: 0,
            }],
        })
    }

    #[test]
    fn duplicate_insert_is_a_noop() {
        let pool = OrphanPool::default();
        let block = orphan_block(1);
        let now = SystemTime::now();
        pool.add(Arc::clone(&block), now);
        pool.add(Arc::clone(&block), now);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn capacity_evicts_earliest_expiration() {
        let pool = OrphanPool::default();
        let base = SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_000);
        let mut first_hash = None;
        for tag in 0..MAX_ORPHAN_BLOCKS {
            let block = orphan_block((tag % 251) as u8);
            // Hashes must differ; vary the nonce by height offset too.
            let mut block = (*block).clone();
            block.header.nonce = tag as u32;
            let block = Arc::new(block);
            if first_hash.is_none() {
                first_hash = Some(block.hash());
            }
            pool.add(block, base + Duration::from_secs(tag as u64));
        }
        assert_eq!(pool.len(), MAX_ORPHAN_BLOCKS);

        let extra = {
            let mut block = (*orphan_block(9)).clone();
            block.header.nonce = 0xdead_beef;
            Arc::new(block)
        };
        pool.add(extra, base + Duration::from_secs(MAX_ORPHAN_BLOCKS as u64));
        assert_eq!(pool.len(), MAX_ORPHAN_BLOCKS);
        assert!(!pool.contains(&first_hash.expect("first")));
    }

    #[test]
    fn expired_orphans_are_dropped_on_add() {
        let pool = OrphanPool::default();
        let base = SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_000);
        pool.add(orphan_block(1), base);
        pool.add(orphan_block(2), base + ORPHAN_EXPIRE + Duration::from_secs(1));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn root_of_follows_pooled_parents() {
        let pool = OrphanPool::default();
        let now = SystemTime::now();
        let child = orphan_block(3);
        let grandchild = Arc::new(Block {
            header: BlockHeader {
                prev_block: child.hash(),
                nonce: 99,
                ..child.header.clone()
            },
            transactions: child.transactions.clone(),
        });
        pool.add(Arc::clone(&child), now);
        pool.add(Arc::clone(&grandchild), now);

        assert_eq!(pool.root_of(&grandchild.hash()), child.hash());
        assert_eq!(pool.children_of(&child.hash()), vec![grandchild.hash()]);
    }
}
