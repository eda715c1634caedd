//! Best-chain selection and the tip engine.
//!
//! All tip transitions are serialized behind the chain lock. Each connect or
//! disconnect step commits one atomic store batch covering the best-state
//! record, the UTXO diff, the spend journal, the stake state, and any active
//! secondary index, so durable state always describes exactly one tip.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crossbeam_channel::{Receiver, TryRecvError};
use emberd_consensus::constants::{
    FINAL_STATE_SIZE, MAX_LOCATE_HASHES, MAX_LOCATE_HEADERS, VOTE_BIT_APPROVE_PARENT,
};
use emberd_consensus::{hash256_to_hex, ChainParams, Hash256, SubsidyCache, ZERO_HASH};
use emberd_primitives::{Block, BlockHeader, OutPoint, Transaction, TxIn, TxOut};
use emberd_storage::{Column, KeyValueStore, WriteBatch};
use log::{debug, error, info, warn};
use primitive_types::U256;

use crate::blockindex::{BlockIndex, BlockStatus, NodeId, TicketInfo};
use crate::chainio;
use crate::chainview::ChainView;
use crate::error::{rule_error, ChainError, RuleErrorKind};
use crate::notifications::{
    Notification, NotificationCallback, ReorganizationData, TicketData,
};
use crate::process::{ticket_info_for_block, OrphanPool};
use crate::stake::{self, StakeNode};
use crate::thresholdstate::ThresholdStateTuple;
use crate::utxoview::{SpentTxOut, StakeViewpoint, UtxoView};
use crate::validate::{BehaviorFlags, MedianTimeSource, SigCache, SystemTimeSource};

/// The minimum number of consecutive nodes needed in memory to perform all
/// necessary validation without dynamic reloading.
pub const MIN_MEMORY_NODES: i64 = 2_880;

/// How far back from the tip stake state is retained in memory. Beyond this
/// band the transient fields must be recalculated on demand.
pub const MIN_MEMORY_STAKE_NODES: i64 = 288;

/// Number of recent main-chain blocks kept decoded in memory to speed up
/// reorganizations.
pub const MAIN_CHAIN_CACHE_SIZE: i64 = 12;

fn panicf(message: String) -> ! {
    error!("{message}");
    panic!("{message}");
}

/// Immutable description of the chain as of the current best block. Replaced
/// wholesale on every tip transition; holders of an old snapshot are
/// unaffected by later transitions and must treat the value as read-only.
#[derive(Clone, Debug, Default)]
pub struct BestState {
    pub hash: Hash256,
    pub prev_hash: Hash256,
    pub height: i64,
    pub bits: u32,
    pub next_pool_size: u32,
    pub next_stake_diff: i64,
    pub block_size: u64,
    pub num_txns: u64,
    pub total_txns: u64,
    pub median_time: i64,
    pub total_subsidy: i64,
    pub next_winning_tickets: Vec<Hash256>,
    pub missed_tickets: Vec<Hash256>,
    pub next_final_state: [u8; FINAL_STATE_SIZE],
}

/// Hook for optional secondary indexes. The connect and disconnect methods
/// contribute writes to the same atomic batch as the tip transition itself.
pub trait IndexManager<S>: Send + Sync {
    fn init(&self, chain: &Chain<S>, interrupt: Option<&Receiver<()>>) -> Result<(), ChainError>;

    fn connect_block(
        &self,
        batch: &mut WriteBatch,
        block: &Block,
        parent: &Block,
        view: &UtxoView,
    ) -> Result<(), ChainError>;

    fn disconnect_block(
        &self,
        batch: &mut WriteBatch,
        block: &Block,
        parent: &Block,
        view: &UtxoView,
    ) -> Result<(), ChainError>;
}

/// Chain instance configuration.
pub struct Config<S> {
    /// Store housing blocks and all metadata created by the chain.
    pub db: Arc<S>,
    /// Parameters of the network the chain is associated with.
    pub chain_params: ChainParams,
    /// Median time source for contextual checks; defaults to the local
    /// clock.
    pub time_source: Option<Arc<dyn MedianTimeSource>>,
    /// Callback receiving chain events.
    pub notifications: Option<NotificationCallback>,
    /// Cache of verified input scripts.
    pub sig_cache: Option<Arc<SigCache>>,
    /// Optional secondary index manager.
    pub index_manager: Option<Arc<dyn IndexManager<S>>>,
    /// Channel the caller can close to interrupt long-running operations.
    pub interrupt: Option<Receiver<()>>,
}

/// State guarded by the chain lock.
pub(crate) struct ChainCtx {
    pub best_chain: ChainView,
    pub no_verify: bool,
    pub no_checkpoints: bool,
    pub deployment_caches: HashMap<u32, Vec<HashMap<Hash256, ThresholdStateTuple>>>,
}

/// Cache of recent fully decoded main-chain blocks.
struct MainChainCache {
    inner: RwLock<HashMap<Hash256, Arc<Block>>>,
    size: i64,
}

impl MainChainCache {
    fn new(size: i64) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            size,
        }
    }

    fn get(&self, hash: &Hash256) -> Option<Arc<Block>> {
        self.inner.read().ok()?.get(hash).map(Arc::clone)
    }

    /// Inserts the block and evicts anything at `height <= new_height - size`.
    fn push(&self, block: Arc<Block>) {
        let height = block.height();
        let size = self.size;
        if let Ok(mut inner) = self.inner.write() {
            inner.insert(block.hash(), block);
            inner.retain(|_, cached| cached.height() > height - size);
        }
    }

    fn drop_block(&self, hash: &Hash256) {
        if let Ok(mut inner) = self.inner.write() {
            inner.remove(hash);
        }
    }
}

/// Detach and attach lists for one reorganization, in execution order:
/// `detach` from the tip down to the fork child, `attach` from the fork
/// child up to the new tip. Named fields on purpose; callers must never rely
/// on positional order.
#[derive(Default)]
pub(crate) struct ReorgPlan {
    pub detach: Vec<NodeId>,
    pub attach: Vec<NodeId>,
}

/// Number of outputs the block spends.
pub(crate) fn count_spent_outputs(block: &Block) -> usize {
    block
        .transactions
        .iter()
        .filter(|tx| !tx.is_coinbase())
        .map(|tx| tx.inputs.len())
        .sum()
}

/// The genesis block derived from the chain parameters.
pub fn genesis_block(params: &ChainParams) -> Block {
    let coinbase = Transaction {
        version: 1,
        inputs: vec![TxIn {
            prevout: OutPoint::null(),
            signature_script: vec![0x00],
            sequence: u32::MAX,
        }],
        outputs: vec![TxOut {
            value: 0,
            script_pubkey: vec![0x51],
        }],
        lock_time: 0,
        expiry: 0,
    };
    let mut block = Block {
        header: BlockHeader {
            version: params.genesis_version,
            prev_block: ZERO_HASH,
            merkle_root: ZERO_HASH,
            vote_bits: 0,
            voters: 0,
            fresh_stake: 0,
            revocations: 0,
            final_state: [0u8; FINAL_STATE_SIZE],
            pool_size: 0,
            bits: params.genesis_bits,
            sbits: params.genesis_sbits,
            height: 0,
            size: 0,
            timestamp: params.genesis_timestamp,
            nonce: params.genesis_nonce,
            stake_version: 0,
        },
        transactions: vec![coinbase],
    };
    block.header.merkle_root = block.compute_merkle_root();
    block.header.size = block.encode().len() as u32;
    block
}

pub struct Chain<S> {
    pub(crate) db: Arc<S>,
    pub(crate) params: Arc<ChainParams>,
    pub(crate) time_source: Arc<dyn MedianTimeSource>,
    notifications: Option<NotificationCallback>,
    pub(crate) sig_cache: Option<Arc<SigCache>>,
    index_manager: Option<Arc<dyn IndexManager<S>>>,
    interrupt: Option<Receiver<()>>,
    subsidy_cache: SubsidyCache,
    /// The in-memory block index. Exposed read-only in spirit: callers may
    /// look up nodes and statuses but must never mutate entries directly.
    pub index: BlockIndex<S>,
    chain_lock: RwLock<ChainCtx>,
    state: RwLock<Arc<BestState>>,
    pub(crate) orphans: OrphanPool,
    block_cache: MainChainCache,
}

impl<S> std::fmt::Debug for Chain<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain").finish_non_exhaustive()
    }
}

impl<S: KeyValueStore> Chain<S> {
    /// Builds a chain instance, initializing the chain state from the store.
    /// An empty store is seeded with the genesis block.
    pub fn new(config: Config<S>) -> Result<Self, ChainError> {
        let params = Arc::new(config.chain_params);
        let chain = Chain {
            db: Arc::clone(&config.db),
            time_source: config
                .time_source
                .unwrap_or_else(|| Arc::new(SystemTimeSource)),
            notifications: config.notifications,
            sig_cache: config.sig_cache,
            index_manager: config.index_manager,
            interrupt: config.interrupt,
            subsidy_cache: SubsidyCache::new((*params).clone()),
            index: BlockIndex::new(config.db),
            chain_lock: RwLock::new(ChainCtx {
                best_chain: ChainView::new(),
                no_verify: false,
                no_checkpoints: false,
                deployment_caches: HashMap::new(),
            }),
            state: RwLock::new(Arc::new(BestState::default())),
            orphans: OrphanPool::default(),
            block_cache: MainChainCache::new(MAIN_CHAIN_CACHE_SIZE),
            params,
        };

        chain.init_chain_state()?;

        if let Some(index_manager) = chain.index_manager.clone() {
            index_manager.init(&chain, chain.interrupt.as_ref())?;
        }

        let snapshot = chain.best_snapshot();
        info!(
            "chain state: height {}, hash {}, total transactions {}",
            snapshot.height,
            hash256_to_hex(&snapshot.hash),
            snapshot.total_txns
        );
        Ok(chain)
    }

    pub(crate) fn lock_chain_write(&self) -> Result<RwLockWriteGuard<'_, ChainCtx>, ChainError> {
        self.chain_lock
            .write()
            .map_err(|_| ChainError::Assert("chain lock poisoned".to_string()))
    }

    fn lock_chain_read(&self) -> Result<RwLockReadGuard<'_, ChainCtx>, ChainError> {
        self.chain_lock
            .read()
            .map_err(|_| ChainError::Assert("chain lock poisoned".to_string()))
    }

    pub(crate) fn deliver_notifications(&self, sink: Vec<Notification>) {
        if let Some(callback) = &self.notifications {
            for notification in sink {
                callback(&notification);
            }
        }
    }

    fn interrupt_requested(&self) -> bool {
        match &self.interrupt {
            Some(receiver) => !matches!(receiver.try_recv(), Err(TryRecvError::Empty)),
            None => false,
        }
    }

    fn publish_best_state(&self, state: Arc<BestState>) {
        if let Ok(mut slot) = self.state.write() {
            *slot = state;
        }
    }

    /// Loads the block index and best chain from the store, or seeds the
    /// store with the genesis block when empty. Observes the interrupt
    /// channel during the catch-up scan.
    fn init_chain_state(&self) -> Result<(), ChainError> {
        let mut ctx = self.lock_chain_write()?;

        if let Some((state, _work)) = chainio::fetch_best_state(&self.db)? {
            let entries = self.db.scan_prefix(Column::BlockIndex, &[])?;
            for (position, (_key, value)) in entries.iter().enumerate() {
                if position % 1_024 == 0 && self.interrupt_requested() {
                    return Err(ChainError::Interrupted);
                }
                let entry = chainio::deserialize_block_index_entry(value)?;
                let parent = if entry.header.height == 0 {
                    None
                } else {
                    Some(
                        self.index
                            .lookup_node(&entry.header.prev_block)
                            .ok_or(ChainError::Corrupt("block index entry without parent"))?,
                    )
                };
                let id = self.index.add_node(&entry.header, parent, entry.status)?;
                if let Some(info) = entry.ticket_info {
                    self.index.set_ticket_info(id, info);
                }
            }
            // Loading back persisted entries is not a modification.
            self.index.clear_dirty();

            let tip = self
                .index
                .lookup_node(&state.hash)
                .ok_or(ChainError::Corrupt("best state references unknown block"))?;
            ctx.best_chain.set_tip(&self.index, tip);
            if let Some(bytes) = self.db.get(Column::StakeState, &state.hash)? {
                self.index
                    .set_stake_node(tip, Arc::new(StakeNode::decode(&bytes)?));
            }
            self.publish_best_state(Arc::new(state));
            return Ok(());
        }

        let genesis = genesis_block(&self.params);
        let genesis_hash = genesis.hash();
        let id = self.index.add_node(
            &genesis.header,
            None,
            BlockStatus::HAVE_DATA.merged(BlockStatus::VALID),
        )?;
        let stake_node = Arc::new(StakeNode::genesis());
        self.index.set_stake_node(id, Arc::clone(&stake_node));
        self.index.set_ticket_info(id, ticket_info_for_block(&genesis));

        let state = BestState {
            hash: genesis_hash,
            prev_hash: ZERO_HASH,
            height: 0,
            bits: genesis.header.bits,
            next_pool_size: 0,
            next_stake_diff: self.params.minimum_stake_diff,
            block_size: genesis.header.size as u64,
            num_txns: genesis.transactions.len() as u64,
            total_txns: genesis.transactions.len() as u64,
            median_time: genesis.header.timestamp as i64,
            total_subsidy: 0,
            next_winning_tickets: Vec::new(),
            missed_tickets: Vec::new(),
            next_final_state: [0u8; FINAL_STATE_SIZE],
        };

        let mut batch = WriteBatch::new();
        chainio::put_block(&mut batch, &genesis);
        chainio::put_best_state(&mut batch, &state, self.index.work_sum_of(id));
        stake::write_connected(&mut batch, &genesis_hash, &stake_node);
        self.db.write_batch(&batch)?;
        self.index.flush()?;

        ctx.best_chain.set_tip(&self.index, id);
        self.publish_best_state(Arc::new(state));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Snapshot and simple queries
    // ------------------------------------------------------------------

    /// The current best-chain snapshot. The returned value is shared and
    /// must be treated as immutable.
    pub fn best_snapshot(&self) -> Arc<BestState> {
        self.state
            .read()
            .map(|slot| Arc::clone(&*slot))
            .unwrap_or_default()
    }

    /// Whether the chain has the block in the index or the orphan pool.
    pub fn have_block(&self, hash: &Hash256) -> bool {
        self.index.have_block(hash) || self.orphans.contains(hash)
    }

    /// Whether the hash is currently a known orphan. Orphans are held for a
    /// limited time, so this must not be used as an absolute test.
    pub fn is_known_orphan(&self, hash: &Hash256) -> bool {
        self.orphans.contains(hash)
    }

    /// Head of the orphan chain containing the given hash, used to request
    /// the missing ancestors from peers.
    pub fn orphan_root(&self, hash: &Hash256) -> Hash256 {
        self.orphans.root_of(hash)
    }

    /// Pooled orphans whose parent is the given block. The caller feeds
    /// these back through `process_block` after the parent is accepted.
    pub fn orphan_children(&self, parent: &Hash256) -> Vec<Arc<Block>> {
        self.orphans
            .children_of(parent)
            .into_iter()
            .filter_map(|hash| self.orphans.get(&hash))
            .collect()
    }

    /// Total work up to and including the block with the given hash.
    pub fn chain_work(&self, hash: &Hash256) -> Result<U256, ChainError> {
        let node = self
            .index
            .lookup_node(hash)
            .ok_or(ChainError::UnknownBlock(*hash))?;
        Ok(self.index.work_sum_of(node))
    }

    /// Hashes of the tips of every known branch: the current best tip plus
    /// the head of each competing side chain.
    pub fn tip_generation(&self) -> Result<Vec<Hash256>, ChainError> {
        let _ctx = self.lock_chain_read()?;
        Ok(self
            .index
            .leaf_tips()
            .into_iter()
            .map(|id| self.index.hash_of(id))
            .collect())
    }

    /// Hash of the block before the current tip.
    pub fn best_prev_hash(&self) -> Hash256 {
        self.best_snapshot().prev_hash
    }

    /// Total subsidy mined so far on the best chain.
    pub fn total_subsidy(&self) -> i64 {
        self.best_snapshot().total_subsidy
    }

    /// Disables connect-time script validation. DO NOT use outside of
    /// debugging: it allows double spends and worse.
    pub fn disable_verify(&self, disable: bool) {
        if let Ok(mut ctx) = self.chain_lock.write() {
            ctx.no_verify = disable;
        }
    }

    /// Disables checkpoint conformance checks.
    pub fn disable_checkpoints(&self, disable: bool) {
        if let Ok(mut ctx) = self.chain_lock.write() {
            ctx.no_checkpoints = disable;
        }
    }

    /// Whether the chain believes it is current: past the latest checkpoint
    /// and with a tip timestamp no older than 24 hours.
    pub fn is_current(&self) -> bool {
        let snapshot = self.best_snapshot();
        if snapshot.height < self.params.latest_checkpoint_height() {
            return false;
        }
        let day_ago = self.time_source.adjusted_time() - 24 * 60 * 60;
        let ctx = match self.lock_chain_read() {
            Ok(ctx) => ctx,
            Err(_) => return false,
        };
        ctx.best_chain
            .tip()
            .map(|tip| self.index.timestamp_of(tip) >= day_ago)
            .unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // Block and header lookups
    // ------------------------------------------------------------------

    /// Header of the block with the given hash, from the main chain or any
    /// side chain.
    pub fn header_by_hash(&self, hash: &Hash256) -> Result<BlockHeader, ChainError> {
        self.index
            .lookup_node(hash)
            .and_then(|node| self.index.header_of(node))
            .ok_or(ChainError::UnknownBlock(*hash))
    }

    /// Header of the main-chain block at the given height.
    pub fn header_by_height(&self, height: i64) -> Result<BlockHeader, ChainError> {
        let ctx = self.lock_chain_read()?;
        ctx.best_chain
            .node_by_height(height)
            .and_then(|node| self.index.header_of(node))
            .ok_or_else(|| {
                ChainError::NotInMainChain(format!("no block at height {height} exists"))
            })
    }

    /// The block with the given hash from any known source, regardless of
    /// which chain it is on.
    pub fn block_by_hash(&self, hash: &Hash256) -> Result<Arc<Block>, ChainError> {
        let node = self
            .index
            .lookup_node(hash)
            .filter(|node| self.index.node_status(*node).have_data())
            .ok_or(ChainError::UnknownBlock(*hash))?;
        self.fetch_block_by_node(node)
    }

    /// The main-chain block at the given height.
    pub fn block_by_height(&self, height: i64) -> Result<Arc<Block>, ChainError> {
        let node = {
            let ctx = self.lock_chain_read()?;
            ctx.best_chain.node_by_height(height).ok_or_else(|| {
                ChainError::NotInMainChain(format!("no block at height {height} exists"))
            })?
        };
        self.fetch_block_by_node(node)
    }

    /// Whether the block with the given hash is in the main chain.
    pub fn main_chain_has_block(&self, hash: &Hash256) -> bool {
        let Ok(ctx) = self.lock_chain_read() else {
            return false;
        };
        self.index
            .lookup_node(hash)
            .map(|node| ctx.best_chain.contains(&self.index, node))
            .unwrap_or(false)
    }

    /// Height of the main-chain block with the given hash.
    pub fn block_height_by_hash(&self, hash: &Hash256) -> Result<i64, ChainError> {
        let ctx = self.lock_chain_read()?;
        let node = self.index.lookup_node(hash);
        match node {
            Some(node) if ctx.best_chain.contains(&self.index, node) => {
                Ok(self.index.height_of(node))
            }
            _ => Err(ChainError::NotInMainChain(format!(
                "block {} is not in the main chain",
                hash256_to_hex(hash)
            ))),
        }
    }

    /// Hash of the main-chain block at the given height.
    pub fn block_hash_by_height(&self, height: i64) -> Result<Hash256, ChainError> {
        let ctx = self.lock_chain_read()?;
        ctx.best_chain
            .node_by_height(height)
            .map(|node| self.index.hash_of(node))
            .ok_or_else(|| {
                ChainError::NotInMainChain(format!("no block at height {height} exists"))
            })
    }

    /// Main-chain block hashes in the half-open range `[start, end)`. The
    /// end is clamped to one past the tip.
    pub fn height_range(&self, start_height: i64, end_height: i64) -> Result<Vec<Hash256>, ChainError> {
        if start_height < 0 {
            return Err(ChainError::InvalidArgument(format!(
                "start height of fetch range must not be less than zero - got {start_height}"
            )));
        }
        if end_height < start_height {
            return Err(ChainError::InvalidArgument(format!(
                "end height of fetch range must not be less than the start height - \
                 got start {start_height}, end {end_height}"
            )));
        }
        if start_height == end_height {
            return Ok(Vec::new());
        }

        let ctx = self.lock_chain_read()?;
        let latest_height = ctx.best_chain.height();
        if start_height > latest_height {
            return Ok(Vec::new());
        }
        let end_height = end_height.min(latest_height + 1);

        let mut hashes = Vec::with_capacity((end_height - start_height) as usize);
        for height in start_height..end_height {
            let node = ctx
                .best_chain
                .node_by_height(height)
                .ok_or(ChainError::Corrupt("gap in the best chain view"))?;
            hashes.push(self.index.hash_of(node));
        }
        Ok(hashes)
    }

    // ------------------------------------------------------------------
    // Locators
    // ------------------------------------------------------------------

    /// Block locator for the given hash, or for the current tip when the
    /// hash is unknown.
    pub fn block_locator_from_hash(&self, hash: &Hash256) -> Vec<Hash256> {
        let Ok(ctx) = self.lock_chain_read() else {
            return Vec::new();
        };
        let node = self.index.lookup_node(hash);
        ctx.best_chain.block_locator(&self.index, node)
    }

    /// Block locator for the current tip.
    pub fn latest_block_locator(&self) -> Vec<Hash256> {
        let Ok(ctx) = self.lock_chain_read() else {
            return Vec::new();
        };
        ctx.best_chain.block_locator(&self.index, None)
    }

    /// Finds the main-chain node after the first locator hash the chain
    /// knows, plus how many subsequent nodes are needed to reach the stop
    /// hash or the entry cap. With an empty locator the stop hash itself is
    /// the request.
    fn locate_inventory(
        &self,
        ctx: &ChainCtx,
        locator: &[Hash256],
        hash_stop: &Hash256,
        max_entries: u32,
    ) -> (Option<NodeId>, u32) {
        let stop_node = self.index.lookup_node(hash_stop);
        if locator.is_empty() {
            let Some(stop_node) = stop_node else {
                return (None, 0);
            };
            return (Some(stop_node), 1);
        }

        let mut start_node = ctx.best_chain.genesis();
        for hash in locator {
            if let Some(node) = self.index.lookup_node(hash) {
                if ctx.best_chain.contains(&self.index, node) {
                    start_node = Some(node);
                    break;
                }
            }
        }
        let start_node = match start_node {
            Some(node) => ctx.best_chain.next(&self.index, node),
            None => None,
        };
        let Some(start_node) = start_node else {
            return (None, 0);
        };

        let start_height = self.index.height_of(start_node);
        let mut total = (ctx.best_chain.height() - start_height + 1) as u32;
        if let Some(stop_node) = stop_node {
            if ctx.best_chain.contains(&self.index, stop_node)
                && self.index.height_of(stop_node) >= start_height
            {
                total = (self.index.height_of(stop_node) - start_height + 1) as u32;
            }
        }
        (Some(start_node), total.min(max_entries))
    }

    /// Hashes of main-chain blocks after the first known locator entry, up
    /// to the stop hash or `max_hashes` (itself capped at
    /// `MAX_LOCATE_HASHES`).
    pub fn locate_blocks(
        &self,
        locator: &[Hash256],
        hash_stop: &Hash256,
        max_hashes: u32,
    ) -> Vec<Hash256> {
        let Ok(ctx) = self.lock_chain_read() else {
            return Vec::new();
        };
        let max_hashes = max_hashes.min(MAX_LOCATE_HASHES);
        let (node, total) = self.locate_inventory(&ctx, locator, hash_stop, max_hashes);
        let mut hashes = Vec::with_capacity(total as usize);
        let mut cursor = node;
        for _ in 0..total {
            let Some(node) = cursor else { break };
            hashes.push(self.index.hash_of(node));
            cursor = ctx.best_chain.next(&self.index, node);
        }
        hashes
    }

    /// Headers of main-chain blocks after the first known locator entry, up
    /// to the stop hash or `max_headers` (itself capped at
    /// `MAX_LOCATE_HEADERS`).
    pub fn locate_headers(
        &self,
        locator: &[Hash256],
        hash_stop: &Hash256,
        max_headers: u32,
    ) -> Vec<BlockHeader> {
        let Ok(ctx) = self.lock_chain_read() else {
            return Vec::new();
        };
        let max_headers = max_headers.min(MAX_LOCATE_HEADERS);
        let (node, total) = self.locate_inventory(&ctx, locator, hash_stop, max_headers);
        let mut headers = Vec::with_capacity(total as usize);
        let mut cursor = node;
        for _ in 0..total {
            let Some(node) = cursor else { break };
            if let Some(header) = self.index.header_of(node) {
                headers.push(header);
            }
            cursor = ctx.best_chain.next(&self.index, node);
        }
        headers
    }

    // ------------------------------------------------------------------
    // Block fetching
    // ------------------------------------------------------------------

    /// The main-chain block for the node, from cache or the store. Errors
    /// with `NotInMainChain` for side-chain nodes.
    fn fetch_main_chain_block_by_node(
        &self,
        ctx: &ChainCtx,
        node: NodeId,
    ) -> Result<Arc<Block>, ChainError> {
        if !ctx.best_chain.contains(&self.index, node) {
            return Err(ChainError::NotInMainChain(format!(
                "block {} is not in the main chain",
                hash256_to_hex(&self.index.hash_of(node))
            )));
        }
        self.fetch_block_by_node(node)
    }

    /// The block for the node from any source: main-chain cache, orphan
    /// pool, or the store.
    fn fetch_block_by_node(&self, node: NodeId) -> Result<Arc<Block>, ChainError> {
        let hash = self.index.hash_of(node);
        if let Some(block) = self.block_cache.get(&hash) {
            return Ok(block);
        }
        if let Some(block) = self.orphans.get(&hash) {
            return Ok(block);
        }
        chainio::fetch_block(&self.db, &hash)?
            .map(Arc::new)
            .ok_or(ChainError::Corrupt("indexed block missing from the store"))
    }

    // ------------------------------------------------------------------
    // Stake state management
    // ------------------------------------------------------------------

    /// Ticket deltas for the node, reloading them from the store (or the raw
    /// block) when the pruner already dropped them.
    pub(crate) fn ticket_info(&self, node: NodeId) -> Result<TicketInfo, ChainError> {
        if let Some(info) = self.index.ticket_info_of(node) {
            return Ok(info);
        }
        let hash = self.index.hash_of(node);
        let key = chainio::block_index_key(self.index.height_of(node), &hash);
        if let Some(bytes) = self.db.get(Column::BlockIndex, &key)? {
            if let Some(info) = chainio::deserialize_block_index_entry(&bytes)?.ticket_info {
                self.index.set_ticket_info(node, info.clone());
                return Ok(info);
            }
        }
        let block = chainio::fetch_block(&self.db, &hash)?
            .ok_or(ChainError::Corrupt("indexed block missing from the store"))?;
        let info = ticket_info_for_block(&block);
        self.index.set_ticket_info(node, info.clone());
        Ok(info)
    }

    /// Tickets entering the live pool at the node's height: the purchases
    /// made `ticket_maturity` blocks earlier.
    fn maturing_tickets(&self, node: NodeId) -> Result<Vec<Hash256>, ChainError> {
        let height = self.index.height_of(node);
        let purchase_height = height - self.params.ticket_maturity;
        if purchase_height < 0 {
            return Ok(Vec::new());
        }
        let Some(ancestor) = self.index.ancestor_of(node, purchase_height) else {
            return Ok(Vec::new());
        };
        Ok(self.ticket_info(ancestor)?.new_tickets)
    }

    /// The stake node for the block, materializing it from memory, the
    /// store, or by replaying forward from the nearest available ancestor.
    pub(crate) fn fetch_stake_node(&self, node: NodeId) -> Result<Arc<StakeNode>, ChainError> {
        let height = self.index.height_of(node);
        if height < self.params.stake_enabled_height {
            return Ok(Arc::new(StakeNode::genesis()));
        }
        if let Some(stake_node) = self.index.stake_node_of(node) {
            return Ok(stake_node);
        }
        let hash = self.index.hash_of(node);
        if let Some(bytes) = self.db.get(Column::StakeState, &hash)? {
            let stake_node = Arc::new(StakeNode::decode(&bytes)?);
            self.index.set_stake_node(node, Arc::clone(&stake_node));
            return Ok(stake_node);
        }

        // Replay from the nearest ancestor whose state is available.
        let mut path = vec![node];
        let mut base = Arc::new(StakeNode::genesis());
        let mut cursor = node;
        while let Some(parent) = self.index.parent_of(cursor) {
            if self.index.height_of(parent) < self.params.stake_enabled_height {
                break;
            }
            if let Some(stake_node) = self.index.stake_node_of(parent) {
                base = stake_node;
                break;
            }
            let parent_hash = self.index.hash_of(parent);
            if let Some(bytes) = self.db.get(Column::StakeState, &parent_hash)? {
                base = Arc::new(StakeNode::decode(&bytes)?);
                break;
            }
            path.push(parent);
            cursor = parent;
        }

        while let Some(step) = path.pop() {
            let info = self.ticket_info(step)?;
            let maturing = self.maturing_tickets(step)?;
            let (next, _undo) = base.connect(
                self.index.height_of(step),
                &maturing,
                &info.tickets_voted,
                &info.tickets_revoked,
                &self.params,
            )?;
            base = Arc::new(next);
            self.index.set_stake_node(step, Arc::clone(&base));
        }
        Ok(base)
    }

    /// Stake difficulty for the block after the given node. Below stake
    /// enabling this is the configured minimum; afterwards it scales with
    /// the pool size.
    pub(crate) fn calc_next_required_stake_difficulty(
        &self,
        node: NodeId,
    ) -> Result<i64, ChainError> {
        let next_height = self.index.height_of(node) + 1;
        let minimum = self.params.minimum_stake_diff;
        if next_height < self.params.stake_enabled_height {
            return Ok(minimum);
        }
        let stake_node = self.fetch_stake_node(node)?;
        let target_pool = (self.params.tickets_per_block as i64 * 8).max(1);
        let scale = (stake_node.pool_size() as i64 / target_pool) + 1;
        Ok(minimum.checked_mul(scale).unwrap_or(i64::MAX).max(minimum))
    }

    /// Drops stake state on ancestors outside the retention horizon so the
    /// memory can be reclaimed. Invoked just before a new node's state is
    /// materialized.
    fn prune_stake_nodes(&self, ctx: &ChainCtx) {
        let Some(tip) = ctx.best_chain.tip() else {
            return;
        };
        let tip_height = self.index.height_of(tip);
        let mut prune_to = Some(tip);
        for _ in 0..MIN_MEMORY_STAKE_NODES - 1 {
            match prune_to {
                Some(node) => prune_to = self.index.parent_of(node),
                None => return,
            }
        }
        let Some(prune_to) = prune_to else { return };

        let mut cursor = self.index.parent_of(prune_to);
        while let Some(node) = cursor {
            // Nodes older than the retention band already have their
            // transient fields cleared.
            if self.index.height_of(node) > tip_height - MIN_MEMORY_NODES {
                self.index.clear_stake_data(node);
            } else {
                break;
            }
            cursor = self.index.parent_of(node);
        }
    }

    // ------------------------------------------------------------------
    // Index flushing
    // ------------------------------------------------------------------

    fn flush_block_index(&self) -> Result<(), ChainError> {
        self.index.flush()
    }

    /// Best-effort flush for post-failure paths: the worst case of losing
    /// these writes is re-validating a block after a restart.
    pub(crate) fn flush_block_index_warn_only(&self) {
        if let Err(err) = self.index.flush() {
            warn!("unable to flush block index changes to the store: {err}");
        }
    }

    // ------------------------------------------------------------------
    // Tip engine
    // ------------------------------------------------------------------

    /// Connects the block to the end of the main chain. The view must
    /// already reflect the connected block, and `stxos` must hold a journal
    /// record per spent output.
    fn connect_block(
        &self,
        ctx: &mut ChainCtx,
        sink: &mut Vec<Notification>,
        node: NodeId,
        block: Arc<Block>,
        parent: Arc<Block>,
        view: &mut UtxoView,
        stxos: Vec<SpentTxOut>,
    ) -> Result<(), ChainError> {
        let tip = ctx.best_chain.tip();
        let node_hash = self.index.hash_of(node);
        let height = self.index.height_of(node);
        if tip.map(|tip| self.index.hash_of(tip)) != Some(block.header.prev_block) {
            panicf(format!(
                "block {} (height {height}) connects to block {} instead of extending the \
                 best chain",
                hash256_to_hex(&node_hash),
                hash256_to_hex(&block.header.prev_block),
            ));
        }
        let spent = count_spent_outputs(&block);
        if stxos.len() != spent {
            panicf(format!(
                "provided {} stxos for block {} (height {height}), but counted {spent} \
                 spent outputs",
                stxos.len(),
                hash256_to_hex(&node_hash),
            ));
        }

        // Modified index entries must be durable before the best state moves
        // past them.
        self.flush_block_index()?;

        self.prune_stake_nodes(ctx);
        let stake_node = self.fetch_stake_node(node)?;

        let previous = self.best_snapshot();
        let num_txns = block.transactions.len() as u64;
        let subsidy = self.subsidy_cache.block_subsidy(height);
        let next_stake_diff = self.calc_next_required_stake_difficulty(node)?;
        let state = Arc::new(BestState {
            hash: node_hash,
            prev_hash: block.header.prev_block,
            height,
            bits: block.header.bits,
            next_pool_size: stake_node.pool_size(),
            next_stake_diff,
            block_size: block.header.size as u64,
            num_txns,
            total_txns: previous.total_txns + num_txns,
            median_time: self.index.median_time_of(node),
            total_subsidy: previous.total_subsidy + subsidy,
            next_winning_tickets: stake_node.winners().to_vec(),
            missed_tickets: stake_node.missed_tickets(),
            next_final_state: stake_node.final_state(),
        });

        let mut batch = WriteBatch::new();
        chainio::put_best_state(&mut batch, &state, self.index.work_sum_of(node));
        view.apply_to_batch(&mut batch);
        chainio::put_spend_journal_entry(&mut batch, &node_hash, &stxos);
        stake::write_connected(&mut batch, &node_hash, &stake_node);
        if let Some(index_manager) = &self.index_manager {
            index_manager.connect_block(&mut batch, &block, &parent, view)?;
        }
        self.db.write_batch(&batch)?;

        view.commit();
        ctx.best_chain.set_tip(&self.index, node);
        self.publish_best_state(Arc::clone(&state));

        sink.push(Notification::BlockConnected {
            block: Arc::clone(&block),
            parent,
        });

        if height >= self.params.stake_enabled_height {
            sink.push(Notification::SpentAndMissedTickets(TicketData {
                hash: node_hash,
                height,
                stake_difficulty: next_stake_diff,
                tickets_spent: stake_node.spent_by_block().to_vec(),
                tickets_missed: stake_node.missed_by_block().to_vec(),
                tickets_new: Vec::new(),
            }));
            sink.push(Notification::NewTickets(TicketData {
                hash: node_hash,
                height,
                stake_difficulty: next_stake_diff,
                tickets_spent: Vec::new(),
                tickets_missed: Vec::new(),
                tickets_new: stake_node.new_tickets().to_vec(),
            }));
        }

        // Below the final checkpoint the parent's stake state can never be
        // needed again.
        if height < self.params.latest_checkpoint_height() {
            if let Some(parent_id) = self.index.parent_of(node) {
                self.index.clear_stake_data(parent_id);
            }
        }

        self.block_cache.push(block);
        Ok(())
    }

    /// Disconnects the tip block from the main chain, restoring its parent
    /// as the tip.
    fn disconnect_block(
        &self,
        ctx: &mut ChainCtx,
        sink: &mut Vec<Notification>,
        node: NodeId,
        block: Arc<Block>,
        parent: Arc<Block>,
        view: &mut UtxoView,
    ) -> Result<(), ChainError> {
        let tip = ctx.best_chain.tip();
        let node_hash = self.index.hash_of(node);
        if tip != Some(node) {
            panicf(format!(
                "block {} (height {}) is not the end of the best chain",
                hash256_to_hex(&node_hash),
                self.index.height_of(node),
            ));
        }

        self.flush_block_index()?;

        let parent_id = self
            .index
            .parent_of(node)
            .unwrap_or_else(|| panicf("disconnect of the genesis block".to_string()));
        let parent_hash = self.index.hash_of(parent_id);
        let parent_stake = self.fetch_stake_node(parent_id)?;

        let previous = self.best_snapshot();
        let num_txns = block.transactions.len() as u64;
        let subsidy = self.subsidy_cache.block_subsidy(self.index.height_of(node));
        let header = block.header.clone();
        let state = Arc::new(BestState {
            hash: parent_hash,
            prev_hash: parent.header.prev_block,
            height: self.index.height_of(parent_id),
            bits: parent.header.bits,
            next_pool_size: parent_stake.pool_size(),
            next_stake_diff: header.sbits,
            block_size: parent.header.size as u64,
            num_txns: parent.transactions.len() as u64,
            total_txns: previous.total_txns - num_txns,
            median_time: self.index.median_time_of(parent_id),
            total_subsidy: previous.total_subsidy - subsidy,
            next_winning_tickets: parent_stake.winners().to_vec(),
            missed_tickets: parent_stake.missed_tickets(),
            next_final_state: parent_stake.final_state(),
        });

        let mut batch = WriteBatch::new();
        chainio::put_best_state(&mut batch, &state, self.index.work_sum_of(parent_id));
        view.apply_to_batch(&mut batch);
        chainio::remove_spend_journal_entry(&mut batch, &node_hash);
        stake::write_disconnected(&mut batch, &node_hash, &parent_hash, &parent_stake);
        if let Some(index_manager) = &self.index_manager {
            index_manager.disconnect_block(&mut batch, &block, &parent, view)?;
        }
        self.db.write_batch(&batch)?;

        view.commit();
        ctx.best_chain.set_tip(&self.index, parent_id);
        self.publish_best_state(state);

        sink.push(Notification::BlockDisconnected {
            block: Arc::clone(&block),
            parent,
        });

        self.block_cache.drop_block(&node_hash);
        Ok(())
    }

    /// Finds the fork point between the main chain and the given node and
    /// builds the detach/attach lists to make the node the new tip. Returns
    /// an empty plan when the node is not on a side chain or the reorg would
    /// cross a known-invalid block; in the latter case the descendants are
    /// marked accordingly.
    fn get_reorganize_nodes(&self, ctx: &ChainCtx, node: NodeId) -> ReorgPlan {
        let mut plan = ReorgPlan::default();

        // Reorganizing onto a chain with a known-invalid parent is refused
        // outright; this avoids walking long unvalidated branches in the
        // common case.
        if let Some(parent) = self.index.parent_of(node) {
            if self.index.node_status(parent).known_invalid() {
                self.index
                    .set_status_flags(node, BlockStatus::INVALID_ANCESTOR);
                return plan;
            }
        }

        let fork = ctx.best_chain.find_fork(&self.index, node);
        let mut cursor = Some(node);
        while let Some(current) = cursor {
            if Some(current) == fork {
                break;
            }
            if self.index.node_status(current).known_invalid() {
                for descendant in &plan.attach {
                    self.index
                        .set_status_flags(*descendant, BlockStatus::INVALID_ANCESTOR);
                }
                plan.attach.clear();
                return plan;
            }
            plan.attach.push(current);
            cursor = self.index.parent_of(current);
        }
        plan.attach.reverse();

        let mut cursor = ctx.best_chain.tip();
        while let Some(current) = cursor {
            if Some(current) == fork {
                break;
            }
            plan.detach.push(current);
            cursor = self.index.parent_of(current);
        }
        plan
    }

    /// Two-phase reorganization: a dry run over a scratch view that proves
    /// every attach block connects, then a deterministic replay of
    /// disconnects and connects, each one an atomic store transaction. A
    /// rule violation in the new branch is detected before the first
    /// disconnect commits, so durable state is never partially reorganized.
    fn reorganize_chain(
        &self,
        ctx: &mut ChainCtx,
        sink: &mut Vec<Notification>,
        plan: ReorgPlan,
    ) -> Result<(), ChainError> {
        if plan.detach.is_empty() && plan.attach.is_empty() {
            return Ok(());
        }

        let tip = ctx
            .best_chain
            .tip()
            .unwrap_or_else(|| panicf("reorganize on an uninitialized chain".to_string()));
        if let Some(&first_detach) = plan.detach.first() {
            if first_detach != tip {
                panicf(format!(
                    "reorganize nodes to detach are not for the current best chain -- \
                     first detach {}, current chain {}",
                    hash256_to_hex(&self.index.hash_of(first_detach)),
                    hash256_to_hex(&self.index.hash_of(tip)),
                ));
            }
        }
        if let (Some(&first_attach), Some(&last_detach)) =
            (plan.attach.first(), plan.detach.last())
        {
            if self.index.parent_of(first_attach) != self.index.parent_of(last_detach) {
                panicf("reorganize nodes do not share a fork point".to_string());
            }
        }

        let old_best = tip;
        let mut new_best = tip;

        // Phase 1: dry run. Blocks and journal entries loaded here are
        // cached for the commit phase so they are read only once.
        let mut detach_blocks: Vec<Arc<Block>> = Vec::with_capacity(plan.detach.len());
        let mut detach_stxos: Vec<Vec<SpentTxOut>> = Vec::with_capacity(plan.detach.len());
        let mut attach_blocks: Vec<Arc<Block>> = Vec::with_capacity(plan.attach.len());

        let mut view = UtxoView::new(self.index.hash_of(old_best), StakeViewpoint::PrevValidInitial);
        for &node in &plan.detach {
            let node_hash = self.index.hash_of(node);
            let block = self.fetch_main_chain_block_by_node(ctx, node)?;
            let stxos = chainio::fetch_spend_journal_entry(&self.db, &node_hash)?
                .ok_or(ChainError::Corrupt("missing spend journal entry"))?;
            if stxos.len() != count_spent_outputs(&block) {
                panicf(format!(
                    "retrieved {} stxos when disconnecting block {} but counted {} spent \
                     outputs",
                    stxos.len(),
                    hash256_to_hex(&node_hash),
                    count_spent_outputs(&block),
                ));
            }
            view.disconnect_transactions(&block, &stxos)?;
            detach_blocks.push(block);
            detach_stxos.push(stxos);
            new_best = self
                .index
                .parent_of(node)
                .unwrap_or_else(|| panicf("detach walk reached past genesis".to_string()));
        }

        let fork = new_best;
        for (position, &node) in plan.attach.iter().enumerate() {
            let block = self.fetch_block_by_node(node)?;
            attach_blocks.push(Arc::clone(&block));

            if self.index.node_status(node).known_valid() {
                // Already proven; only the view needs updating.
                view.fetch_inputs(&self.db, &block)?;
                view.connect_transactions(&block, None)?;
                new_best = node;
                continue;
            }

            match self.check_connect_block(node, &block, &mut view, None, ctx.no_verify) {
                Ok(()) => {}
                Err(err) => {
                    if err.is_rule_error() {
                        self.index
                            .set_status_flags(node, BlockStatus::VALIDATE_FAILED);
                        for &descendant in &plan.attach[position + 1..] {
                            self.index
                                .set_status_flags(descendant, BlockStatus::INVALID_ANCESTOR);
                        }
                    }
                    return Err(err);
                }
            }
            self.index.set_status_flags(node, BlockStatus::VALID);
            new_best = node;
        }
        debug!("new best chain validation completed successfully, commencing reorganization");

        sink.push(Notification::Reorganization(ReorganizationData {
            old_hash: self.index.hash_of(old_best),
            old_height: self.index.height_of(old_best),
            new_hash: self.index.hash_of(new_best),
            new_height: self.index.height_of(new_best),
        }));
        sink.push(Notification::ChainReorgStarted);
        let result = self.reorganize_chain_commit(
            ctx,
            sink,
            &plan,
            old_best,
            fork,
            detach_blocks,
            detach_stxos,
            attach_blocks,
        );
        sink.push(Notification::ChainReorgDone);

        if result.is_ok() {
            info!(
                "REORGANIZE: chain forks at {} (height {})",
                hash256_to_hex(&self.index.hash_of(fork)),
                self.index.height_of(fork)
            );
            info!(
                "REORGANIZE: old best chain head was {} (height {})",
                hash256_to_hex(&self.index.hash_of(old_best)),
                self.index.height_of(old_best)
            );
            info!(
                "REORGANIZE: new best chain head is {} (height {})",
                hash256_to_hex(&self.index.hash_of(new_best)),
                self.index.height_of(new_best)
            );
        }
        result
    }

    /// Phase 2 of a reorganization: replays the proven detach and attach
    /// steps against durable state.
    #[allow(clippy::too_many_arguments)]
    fn reorganize_chain_commit(
        &self,
        ctx: &mut ChainCtx,
        sink: &mut Vec<Notification>,
        plan: &ReorgPlan,
        old_best: NodeId,
        fork: NodeId,
        detach_blocks: Vec<Arc<Block>>,
        detach_stxos: Vec<Vec<SpentTxOut>>,
        attach_blocks: Vec<Arc<Block>>,
    ) -> Result<(), ChainError> {
        let fork_block = if plan.detach.is_empty() {
            None
        } else {
            Some(self.fetch_main_chain_block_by_node(ctx, fork)?)
        };

        let mut view = UtxoView::new(self.index.hash_of(old_best), StakeViewpoint::PrevValidInitial);
        for (position, &node) in plan.detach.iter().enumerate() {
            let block = Arc::clone(&detach_blocks[position]);
            let parent = if position + 1 < detach_blocks.len() {
                Arc::clone(&detach_blocks[position + 1])
            } else {
                Arc::clone(fork_block.as_ref().unwrap_or_else(|| {
                    panicf("detach commit without a cached fork block".to_string())
                }))
            };
            view.disconnect_transactions(&block, &detach_stxos[position])?;
            self.disconnect_block(ctx, sink, node, block, parent, &mut view)?;
        }

        let attach_fork_block = match fork_block {
            Some(block) => Some(block),
            None if !plan.attach.is_empty() => {
                Some(self.fetch_main_chain_block_by_node(ctx, fork)?)
            }
            None => None,
        };
        for (position, &node) in plan.attach.iter().enumerate() {
            let block = Arc::clone(&attach_blocks[position]);
            let parent = if position == 0 {
                Arc::clone(attach_fork_block.as_ref().unwrap_or_else(|| {
                    panicf("attach commit without a cached fork block".to_string())
                }))
            } else {
                Arc::clone(&attach_blocks[position - 1])
            };

            let mut stxos = Vec::with_capacity(count_spent_outputs(&block));
            view.fetch_inputs(&self.db, &block)?;
            view.connect_transactions(&block, Some(&mut stxos))?;
            self.connect_block(ctx, sink, node, block, parent, &mut view, stxos)?;
        }
        Ok(())
    }

    /// Chooses what to do with a block whose parent is in the index: extend
    /// the main chain, record an inert side chain, or reorganize to a
    /// heavier branch. Returns the fork length, zero when the block ends up
    /// on the main chain.
    pub(crate) fn connect_best_chain(
        &self,
        ctx: &mut ChainCtx,
        sink: &mut Vec<Notification>,
        node: NodeId,
        block: Arc<Block>,
        flags: BehaviorFlags,
    ) -> Result<i64, ChainError> {
        let mut fast_add = flags.contains(BehaviorFlags::FAST_ADD);
        let parent_id = self
            .index
            .parent_of(node)
            .unwrap_or_else(|| panicf("connect_best_chain on the genesis block".to_string()));
        let node_hash = self.index.hash_of(node);
        let parent_hash = block.header.prev_block;

        let tip = ctx
            .best_chain
            .tip()
            .unwrap_or_else(|| panicf("connect_best_chain on an uninitialized chain".to_string()));

        if tip == parent_id {
            // Extending the best chain: the common case.
            let is_known_valid = self.index.node_status(node).known_valid();
            fast_add = fast_add || is_known_valid;

            let mut view = UtxoView::new(parent_hash, StakeViewpoint::PrevValidInitial);
            let mut stxos = Vec::with_capacity(count_spent_outputs(&block));
            if !fast_add {
                if let Err(err) =
                    self.check_connect_block(node, &block, &mut view, Some(&mut stxos), ctx.no_verify)
                {
                    if err.is_rule_error() {
                        self.index
                            .set_status_flags(node, BlockStatus::VALIDATE_FAILED);
                        self.flush_block_index_warn_only();
                    }
                    return Err(err);
                }
            }
            if !is_known_valid {
                self.index.set_status_flags(node, BlockStatus::VALID);
                self.flush_block_index_warn_only();
            }

            // The connection check was skipped on the fast-add path, so the
            // view still needs to be populated.
            if fast_add {
                view.fetch_inputs(&self.db, &block)?;
                view.connect_transactions(&block, Some(&mut stxos))?;
            }

            let vote_bits = block.header.vote_bits;
            let parent_block = self.fetch_block_by_node(parent_id)?;
            self.connect_block(ctx, sink, node, block, parent_block, &mut view, stxos)?;

            let validate_str = if vote_bits & VOTE_BIT_APPROVE_PARENT != 0 {
                "validating"
            } else {
                "invalidating"
            };
            debug!(
                "block {} (height {}) connected to the main chain, {} the previous block",
                hash256_to_hex(&node_hash),
                self.index.height_of(node),
                validate_str
            );
            return Ok(0);
        }
        if fast_add {
            warn!(
                "fast add set in the side chain case? {}",
                hash256_to_hex(&node_hash)
            );
        }

        // Side chain with insufficient work: record it and leave the main
        // chain alone.
        if self.index.work_sum_of(node) <= self.index.work_sum_of(tip) {
            let fork = ctx.best_chain.find_fork(&self.index, node);
            let fork_height = fork.map(|fork| self.index.height_of(fork)).unwrap_or(0);
            match fork {
                Some(fork) if self.index.hash_of(fork) == parent_hash => info!(
                    "FORK: block {} (height {}) forks the chain at height {} but does not \
                     cause a reorganize",
                    hash256_to_hex(&node_hash),
                    self.index.height_of(node),
                    fork_height
                ),
                _ => info!(
                    "EXTEND FORK: block {} (height {}) extends a side chain forked at \
                     height {}",
                    hash256_to_hex(&node_hash),
                    self.index.height_of(node),
                    fork_height
                ),
            }
            return Ok(self.index.height_of(node) - fork_height);
        }

        // Heavier side chain: reorganize onto it.
        let plan = self.get_reorganize_nodes(ctx, node);
        info!(
            "REORGANIZE: block {} is causing a reorganize",
            hash256_to_hex(&node_hash)
        );
        let result = self.reorganize_chain(ctx, sink, plan);
        self.flush_block_index_warn_only();
        result?;
        Ok(0)
    }

    // ------------------------------------------------------------------
    // Forced head reorganization
    // ------------------------------------------------------------------

    /// Switches the tip to a named sibling of the current tip, validating it
    /// first when necessary. Driven by an external request rather than by
    /// cumulative work.
    pub fn force_head_reorganization(
        &self,
        former_best: Hash256,
        new_best: Hash256,
    ) -> Result<(), ChainError> {
        let mut ctx = self.lock_chain_write()?;
        let mut sink = Vec::new();
        let result = self.force_head_reorganization_locked(&mut ctx, &mut sink, former_best, new_best);
        drop(ctx);
        self.deliver_notifications(sink);
        result
    }

    fn force_head_reorganization_locked(
        &self,
        ctx: &mut ChainCtx,
        sink: &mut Vec<Notification>,
        former_best: Hash256,
        new_best: Hash256,
    ) -> Result<(), ChainError> {
        if former_best == new_best {
            return Err(ChainError::InvalidArgument(
                "can't reorganize to the same block".to_string(),
            ));
        }
        let tip = ctx
            .best_chain
            .tip()
            .unwrap_or_else(|| panicf("forced reorg on an uninitialized chain".to_string()));
        if self.index.hash_of(tip) != former_best {
            return Err(rule_error(
                RuleErrorKind::ForceReorgWrongChain,
                "tried to force reorg on wrong chain",
            ));
        }

        let new_node = self.index.lookup_node(&new_best);
        let tip_parent = self.index.parent_of(tip);
        let new_node = match new_node {
            Some(node) if self.index.parent_of(node) == tip_parent && tip_parent.is_some() => node,
            _ => {
                return Err(rule_error(
                    RuleErrorKind::ForceReorgMissingChild,
                    "missing child of common parent for forced reorg",
                ))
            }
        };

        let status = self.index.node_status(new_node);
        if status.known_invalid() {
            return Err(rule_error(
                RuleErrorKind::KnownInvalidBlock,
                "block is known to be invalid",
            ));
        }

        if !status.known_valid() {
            let new_block = self.fetch_block_by_node(new_node)?;
            let former_block = self.fetch_block_by_node(tip)?;
            let parent_id = tip_parent
                .unwrap_or_else(|| panicf("forced reorg from the genesis block".to_string()));

            // Validate the target against a scratch view built by
            // disconnecting the former best block from the common parent.
            let stxos = chainio::fetch_spend_journal_entry(&self.db, &former_best)?
                .ok_or(ChainError::Corrupt("missing spend journal entry"))?;
            if stxos.len() != count_spent_outputs(&former_block) {
                panicf(format!(
                    "retrieved {} stxos when disconnecting block {} but counted {} spent \
                     outputs during forced reorg",
                    stxos.len(),
                    hash256_to_hex(&former_best),
                    count_spent_outputs(&former_block),
                ));
            }
            let mut view = UtxoView::new(former_best, StakeViewpoint::PrevValidInitial);
            view.fetch_inputs(&self.db, &former_block)?;
            view.disconnect_transactions(&former_block, &stxos)?;

            crate::validate::check_block_sanity(
                &new_block,
                self.time_source.as_ref(),
                BehaviorFlags::NONE,
                &self.params,
            )?;
            self.check_block_context(&new_block, parent_id, BehaviorFlags::NONE)?;
            match self.check_connect_block(new_node, &new_block, &mut view, None, ctx.no_verify) {
                Ok(()) => self.index.set_status_flags(new_node, BlockStatus::VALID),
                Err(err) => {
                    if err.is_rule_error() {
                        self.index
                            .set_status_flags(new_node, BlockStatus::VALIDATE_FAILED);
                    }
                    return Err(err);
                }
            }
        }

        // The plan carries its lists by name so a detach/attach swap cannot
        // happen silently here.
        let plan = self.get_reorganize_nodes(ctx, new_node);
        let result = self.reorganize_chain(ctx, sink, plan);
        self.flush_block_index_warn_only();
        result
    }
}
