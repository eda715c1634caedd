//! Block validation.
//!
//! Three layers, mirroring how blocks are accepted: context-free sanity
//! checks, context-dependent header checks against the parent, and full
//! connection checks against a UTXO view.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use emberd_consensus::constants::{MAX_BLOCK_SIZE, MAX_BLOCK_TXNS, MIN_BLOCK_VERSION};
use emberd_consensus::pow::{compact_to_u256, hash_meets_target};
use emberd_consensus::{hash256_to_hex, ChainParams, Hash256};
use emberd_primitives::{sha256d, Block, OutPoint};
use emberd_storage::KeyValueStore;

use crate::blockindex::NodeId;
use crate::chain::Chain;
use crate::error::{rule_error, ChainError, RuleErrorKind};
use crate::utxoview::{SpentTxOut, UtxoView};

/// Maximum number of seconds a block timestamp may be ahead of the adjusted
/// time.
const MAX_FUTURE_BLOCK_TIME: i64 = 2 * 60 * 60;

/// Behavior flags modifying block processing. A plain bitset passed through
/// the engine, not a dispatch mechanism.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BehaviorFlags(u32);

impl BehaviorFlags {
    pub const NONE: BehaviorFlags = BehaviorFlags(0);
    /// Avoids expensive validation for blocks known to be good, such as
    /// those below a checkpoint during initial sync.
    pub const FAST_ADD: BehaviorFlags = BehaviorFlags(1 << 0);
    /// Skips the proof-of-work hash check.
    pub const NO_POW_CHECK: BehaviorFlags = BehaviorFlags(1 << 1);

    pub fn contains(self, other: BehaviorFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn merged(self, other: BehaviorFlags) -> Self {
        BehaviorFlags(self.0 | other.0)
    }
}

/// Source of adjusted network time for contextual checks.
pub trait MedianTimeSource: Send + Sync {
    fn adjusted_time(&self) -> i64;
}

/// Time source backed by the local clock.
#[derive(Default)]
pub struct SystemTimeSource;

impl MedianTimeSource for SystemTimeSource {
    fn adjusted_time(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs() as i64)
            .unwrap_or(0)
    }
}

/// Caches commitments of already-verified input scripts so a block seen
/// again (for example on a reorg replay) skips re-verification.
pub struct SigCache {
    entries: Mutex<HashSet<Hash256>>,
    capacity: usize,
}

impl SigCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashSet::new()),
            capacity,
        }
    }

    pub fn contains(&self, commitment: &Hash256) -> bool {
        self.entries
            .lock()
            .map(|entries| entries.contains(commitment))
            .unwrap_or(false)
    }

    pub fn insert(&self, commitment: Hash256) {
        if let Ok(mut entries) = self.entries.lock() {
            if entries.len() >= self.capacity {
                entries.clear();
            }
            entries.insert(commitment);
        }
    }
}

/// Context-free block checks: structure, merkle commitment, proof of work,
/// and timestamp sanity.
pub fn check_block_sanity(
    block: &Block,
    time_source: &dyn MedianTimeSource,
    flags: BehaviorFlags,
    params: &ChainParams,
) -> Result<(), ChainError> {
    if block.transactions.is_empty() {
        return Err(rule_error(
            RuleErrorKind::NoTransactions,
            "block does not contain any transactions",
        ));
    }
    if block.transactions.len() > MAX_BLOCK_TXNS {
        return Err(rule_error(
            RuleErrorKind::TooManyTransactions,
            format!("block contains {} transactions", block.transactions.len()),
        ));
    }
    if !block.transactions[0].is_coinbase() {
        return Err(rule_error(
            RuleErrorKind::FirstTxNotCoinbase,
            "first transaction in block is not a coinbase",
        ));
    }
    for tx in &block.transactions[1..] {
        if tx.is_coinbase() {
            return Err(rule_error(
                RuleErrorKind::MultipleCoinbases,
                "block contains more than one coinbase",
            ));
        }
    }

    if block.header.version < MIN_BLOCK_VERSION {
        return Err(rule_error(
            RuleErrorKind::BlockVersionTooOld,
            format!("block version {} is no longer accepted", block.header.version),
        ));
    }

    let computed_root = block.compute_merkle_root();
    if computed_root != block.header.merkle_root {
        return Err(rule_error(
            RuleErrorKind::BadMerkleRoot,
            format!(
                "merkle root commitment {} does not match computed {}",
                hash256_to_hex(&block.header.merkle_root),
                hash256_to_hex(&computed_root)
            ),
        ));
    }

    if block.header.size > MAX_BLOCK_SIZE {
        return Err(rule_error(
            RuleErrorKind::TooManyTransactions,
            format!("serialized block size {} exceeds the maximum", block.header.size),
        ));
    }

    if !flags.contains(BehaviorFlags::NO_POW_CHECK) {
        // The claimed target must not be easier than the proof-of-work
        // limit, and the hash must satisfy it.
        let target = compact_to_u256(block.header.bits)
            .map_err(|err| rule_error(RuleErrorKind::HighHash, err.to_string()))?;
        let limit = compact_to_u256(params.pow_limit_bits)
            .map_err(|err| rule_error(RuleErrorKind::HighHash, err.to_string()))?;
        if target.is_zero() || target > limit {
            return Err(rule_error(
                RuleErrorKind::HighHash,
                format!("claimed target {:#x} is outside the allowed range", block.header.bits),
            ));
        }
        let hash = block.hash();
        let meets = hash_meets_target(&hash, block.header.bits)
            .map_err(|err| rule_error(RuleErrorKind::HighHash, err.to_string()))?;
        if !meets {
            return Err(rule_error(
                RuleErrorKind::HighHash,
                format!(
                    "block hash {} is higher than the claimed target",
                    hash256_to_hex(&hash)
                ),
            ));
        }
    }

    let max_timestamp = time_source.adjusted_time() + MAX_FUTURE_BLOCK_TIME;
    if (block.header.timestamp as i64) > max_timestamp {
        return Err(rule_error(
            RuleErrorKind::TimeTooNew,
            format!(
                "block timestamp {} is too far in the future",
                block.header.timestamp
            ),
        ));
    }

    Ok(())
}

/// Commitment a verified input contributes to the signature cache.
fn script_commitment(script_sig: &[u8], script_pubkey: &[u8]) -> Hash256 {
    let mut input = Vec::with_capacity(script_sig.len() + script_pubkey.len() + 1);
    input.extend_from_slice(script_sig);
    input.push(0xff);
    input.extend_from_slice(script_pubkey);
    sha256d(&input)
}

impl<S: KeyValueStore> Chain<S> {
    /// Context-dependent header checks against the parent node.
    pub(crate) fn check_block_context(
        &self,
        block: &Block,
        parent: NodeId,
        flags: BehaviorFlags,
    ) -> Result<(), ChainError> {
        let parent_height = self.index.height_of(parent);
        let expected_height = parent_height + 1;
        if block.height() != expected_height {
            return Err(rule_error(
                RuleErrorKind::BadBlockHeight,
                format!(
                    "block height {} does not match expected height {}",
                    block.height(),
                    expected_height
                ),
            ));
        }

        if !flags.contains(BehaviorFlags::FAST_ADD) {
            let median_time = self.index.median_time_of(parent);
            if (block.header.timestamp as i64) <= median_time {
                return Err(rule_error(
                    RuleErrorKind::TimeTooOld,
                    format!(
                        "block timestamp {} is not after the median time of its ancestors",
                        block.header.timestamp
                    ),
                ));
            }
        }

        Ok(())
    }

    /// Full connection checks for attaching `block` on top of the view. On
    /// success the view reflects the connected block, with journal records
    /// appended to `stxos` when provided.
    ///
    /// This is a pure function of (block, parent context, view): no durable
    /// state is touched, which is what makes the reorg dry run safe.
    pub(crate) fn check_connect_block(
        &self,
        node: NodeId,
        block: &Block,
        view: &mut UtxoView,
        stxos: Option<&mut Vec<SpentTxOut>>,
        no_verify: bool,
    ) -> Result<(), ChainError> {
        let height = self.index.height_of(node);
        let parent_hash = block.header.prev_block;
        if *view.best_hash() != parent_hash {
            return Err(ChainError::Assert(format!(
                "connect check for block at height {height} against a view for {}",
                hash256_to_hex(view.best_hash())
            )));
        }

        view.fetch_inputs(&self.db, block)?;

        // Validate all inputs before mutating the view. Outputs created
        // earlier in the block are spendable by later transactions.
        let mut created: HashMap<OutPoint, (i64, bool, u32)> = HashMap::new();
        let mut spent: HashSet<OutPoint> = HashSet::new();
        for tx in &block.transactions {
            let txid = tx.txid();
            if !tx.is_coinbase() {
                let mut value_in: i64 = 0;
                for input in &tx.inputs {
                    if !spent.insert(input.prevout) {
                        return Err(rule_error(
                            RuleErrorKind::DoubleSpend,
                            format!(
                                "output {}:{} spent twice within the block",
                                hash256_to_hex(&input.prevout.hash),
                                input.prevout.index
                            ),
                        ));
                    }

                    let (value, is_coinbase, origin_height) =
                        match created.get(&input.prevout) {
                            Some(&entry) => entry,
                            None => match view.lookup(&input.prevout) {
                                Some(entry) => {
                                    (entry.value, entry.is_coinbase, entry.height)
                                }
                                None => {
                                    return Err(rule_error(
                                        RuleErrorKind::MissingTxOut,
                                        format!(
                                            "output {}:{} referenced by transaction {} \
                                             is unavailable",
                                            hash256_to_hex(&input.prevout.hash),
                                            input.prevout.index,
                                            hash256_to_hex(&txid)
                                        ),
                                    ))
                                }
                            },
                        };

                    if is_coinbase {
                        let confirmations = height - origin_height as i64;
                        if confirmations < self.params.coinbase_maturity {
                            return Err(rule_error(
                                RuleErrorKind::ImmatureSpend,
                                format!(
                                    "coinbase output spent at height {height} with only \
                                     {confirmations} confirmations"
                                ),
                            ));
                        }
                    }

                    if value < 0 {
                        return Err(rule_error(
                            RuleErrorKind::BadTxValue,
                            "referenced output has a negative value",
                        ));
                    }
                    value_in = value_in
                        .checked_add(value)
                        .ok_or_else(|| rule_error(RuleErrorKind::BadTxValue, "input value overflow"))?;
                }

                let mut value_out: i64 = 0;
                for output in &tx.outputs {
                    if output.value < 0 {
                        return Err(rule_error(
                            RuleErrorKind::BadTxValue,
                            "transaction output has a negative value",
                        ));
                    }
                    value_out = value_out.checked_add(output.value).ok_or_else(|| {
                        rule_error(RuleErrorKind::BadTxValue, "output value overflow")
                    })?;
                }
                if value_in < value_out {
                    return Err(rule_error(
                        RuleErrorKind::SpendTooHigh,
                        format!(
                            "transaction {} spends {value_out} with only {value_in} available",
                            hash256_to_hex(&txid)
                        ),
                    ));
                }
            }

            for (index, output) in tx.outputs.iter().enumerate() {
                created.insert(
                    OutPoint {
                        hash: txid,
                        index: index as u32,
                    },
                    (output.value, tx.is_coinbase(), height as u32),
                );
            }
        }

        // Votes must consume tickets the lottery actually selected.
        if height >= self.params.stake_validation_height {
            let parent = self
                .index
                .parent_of(node)
                .ok_or_else(|| ChainError::Assert("connect check on genesis".to_string()))?;
            let parent_stake = self.fetch_stake_node(parent)?;
            for tx in &block.transactions[1..] {
                if let Some(ticket) = tx.spent_ticket_hash() {
                    if tx.tx_type() == emberd_primitives::TxType::Vote
                        && !parent_stake.winners().contains(&ticket)
                    {
                        return Err(rule_error(
                            RuleErrorKind::TicketUnavailable,
                            format!(
                                "vote consumes ticket {} not selected by the lottery",
                                hash256_to_hex(&ticket)
                            ),
                        ));
                    }
                }
            }
        }

        if !no_verify {
            self.check_block_scripts(block, view)?;
        }

        view.connect_transactions(block, stxos)
    }

    /// Verifies input scripts, consulting the signature cache to skip inputs
    /// already verified.
    fn check_block_scripts(&self, block: &Block, view: &UtxoView) -> Result<(), ChainError> {
        for tx in &block.transactions[1..] {
            for input in &tx.inputs {
                let script_pubkey = view
                    .lookup(&input.prevout)
                    .map(|entry| entry.script_pubkey.as_slice())
                    .unwrap_or_default();
                let commitment = script_commitment(&input.signature_script, script_pubkey);
                if let Some(sig_cache) = &self.sig_cache {
                    if sig_cache.contains(&commitment) {
                        continue;
                    }
                }
                if input.signature_script.is_empty() {
                    return Err(rule_error(
                        RuleErrorKind::ScriptValidation,
                        format!(
                            "input spending {}:{} has an empty signature script",
                            hash256_to_hex(&input.prevout.hash),
                            input.prevout.index
                        ),
                    ));
                }
                if let Some(sig_cache) = &self.sig_cache {
                    sig_cache.insert(commitment);
                }
            }
        }
        Ok(())
    }
}
