//! Ticket lottery state per block height.
//!
//! A stake node captures the live-ticket pool, the winners eligible to vote
//! on the next block, the missed-ticket set, and the lottery final state at
//! one height. Transitions are driven by the per-block ticket deltas and are
//! fully deterministic, so any node's state can be rebuilt by replaying from
//! an ancestor.

use std::collections::BTreeSet;

use emberd_consensus::constants::FINAL_STATE_SIZE;
use emberd_consensus::{ChainParams, Hash256};
use emberd_primitives::encoding::{DecodeError, Decoder, Encoder};
use emberd_primitives::sha256;
use emberd_storage::{Column, WriteBatch};

use crate::error::{rule_error, ChainError, RuleErrorKind};

/// Store key tracking which block hash owns the connected best stake state.
pub const BEST_STAKE_NODE_KEY: &[u8] = b"beststakenode";

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StakeNode {
    height: i64,
    live: BTreeSet<Hash256>,
    winners: Vec<Hash256>,
    missed: BTreeSet<Hash256>,
    final_state: [u8; FINAL_STATE_SIZE],
    spent_by_block: Vec<Hash256>,
    missed_by_block: Vec<Hash256>,
    new_by_block: Vec<Hash256>,
}

/// Everything needed to reverse one connect transition.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StakeUndo {
    pub added: Vec<Hash256>,
    pub voted: Vec<Hash256>,
    pub revoked: Vec<Hash256>,
    pub missed: Vec<Hash256>,
}

impl StakeNode {
    /// The empty lottery state before stake enabling.
    pub fn genesis() -> Self {
        Self::default()
    }

    pub fn height(&self) -> i64 {
        self.height
    }

    pub fn pool_size(&self) -> u32 {
        self.live.len() as u32
    }

    /// Tickets eligible to vote on the next block.
    pub fn winners(&self) -> &[Hash256] {
        &self.winners
    }

    pub fn missed_tickets(&self) -> Vec<Hash256> {
        self.missed.iter().copied().collect()
    }

    pub fn final_state(&self) -> [u8; FINAL_STATE_SIZE] {
        self.final_state
    }

    /// Tickets spent by votes in the block that produced this state.
    pub fn spent_by_block(&self) -> &[Hash256] {
        &self.spent_by_block
    }

    /// Tickets that became missed in the block that produced this state.
    pub fn missed_by_block(&self) -> &[Hash256] {
        &self.missed_by_block
    }

    /// Tickets that matured into the pool in the block that produced this
    /// state.
    pub fn new_tickets(&self) -> &[Hash256] {
        &self.new_by_block
    }

    pub fn is_live(&self, ticket: &Hash256) -> bool {
        self.live.contains(ticket)
    }

    /// Advances the lottery by one block. `maturing` holds the tickets that
    /// enter the live pool at `height`; `voted` and `revoked` are the
    /// tickets consumed by the block's votes and revocations.
    pub fn connect(
        &self,
        height: i64,
        maturing: &[Hash256],
        voted: &[Hash256],
        revoked: &[Hash256],
        params: &ChainParams,
    ) -> Result<(StakeNode, StakeUndo), ChainError> {
        let mut next = StakeNode {
            height,
            live: self.live.clone(),
            winners: Vec::new(),
            missed: self.missed.clone(),
            final_state: [0u8; FINAL_STATE_SIZE],
            spent_by_block: voted.to_vec(),
            missed_by_block: Vec::new(),
            new_by_block: maturing.to_vec(),
        };

        // Votes consume winners selected at the parent height. Any winner
        // that fails to vote is moved to the missed set.
        for ticket in voted {
            if !self.winners.contains(ticket) {
                return Err(rule_error(
                    RuleErrorKind::TicketUnavailable,
                    format!(
                        "vote spends ticket {} which is not a winner",
                        emberd_consensus::hash256_to_hex(ticket)
                    ),
                ));
            }
            next.live.remove(ticket);
        }
        for winner in &self.winners {
            if !voted.contains(winner) && next.live.remove(winner) {
                next.missed.insert(*winner);
                next.missed_by_block.push(*winner);
            }
        }

        for ticket in revoked {
            if !next.missed.remove(ticket) {
                return Err(rule_error(
                    RuleErrorKind::TicketUnavailable,
                    format!(
                        "revocation references ticket {} which is not missed",
                        emberd_consensus::hash256_to_hex(ticket)
                    ),
                ));
            }
        }

        for ticket in maturing {
            next.live.insert(*ticket);
        }

        next.select_winners(self.final_state, params);

        let undo = StakeUndo {
            added: maturing.to_vec(),
            voted: voted.to_vec(),
            revoked: revoked.to_vec(),
            missed: next.missed_by_block.clone(),
        };
        Ok((next, undo))
    }

    /// Reverses a connect transition, restoring the parent state. The
    /// parent's winners and final state are recomputed from its own parent
    /// seed, so the caller supplies them directly.
    pub fn disconnect(
        &self,
        parent_height: i64,
        parent_winners: Vec<Hash256>,
        parent_final_state: [u8; FINAL_STATE_SIZE],
        undo: &StakeUndo,
    ) -> StakeNode {
        let mut prev = StakeNode {
            height: parent_height,
            live: self.live.clone(),
            winners: parent_winners,
            missed: self.missed.clone(),
            final_state: parent_final_state,
            spent_by_block: Vec::new(),
            missed_by_block: Vec::new(),
            new_by_block: Vec::new(),
        };

        for ticket in &undo.added {
            prev.live.remove(ticket);
        }
        for ticket in &undo.revoked {
            prev.missed.insert(*ticket);
        }
        for ticket in &undo.missed {
            prev.missed.remove(ticket);
            prev.live.insert(*ticket);
        }
        for ticket in &undo.voted {
            prev.live.insert(*ticket);
        }
        prev
    }

    /// Selects the winners for the next block from the live pool using a
    /// deterministic hash chain seeded by the parent final state and the
    /// height, then derives the new final state from the selection.
    fn select_winners(&mut self, seed_state: [u8; FINAL_STATE_SIZE], params: &ChainParams) {
        if self.live.is_empty() || self.height + 1 < params.stake_validation_height {
            // The lottery only picks winners once votes become required.
            self.final_state = [0u8; FINAL_STATE_SIZE];
            if self.height + 1 >= params.stake_validation_height {
                self.final_state = seed_state;
            }
            return;
        }

        let pool: Vec<Hash256> = self.live.iter().copied().collect();
        let mut seed = Vec::with_capacity(FINAL_STATE_SIZE + 8);
        seed.extend_from_slice(&seed_state);
        seed.extend_from_slice(&self.height.to_le_bytes());
        let mut digest = sha256(&seed);

        let wanted = (params.tickets_per_block as usize).min(pool.len());
        let mut winners = Vec::with_capacity(wanted);
        while winners.len() < wanted {
            let pick = u64::from_le_bytes([
                digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6],
                digest[7],
            ]) as usize
                % pool.len();
            let candidate = pool[pick];
            if !winners.contains(&candidate) {
                winners.push(candidate);
            }
            digest = sha256(&digest);
        }

        let mut state_input = Vec::with_capacity(winners.len() * 32);
        for winner in &winners {
            state_input.extend_from_slice(winner);
        }
        let state_hash = sha256(&state_input);
        self.final_state.copy_from_slice(&state_hash[..FINAL_STATE_SIZE]);
        self.winners = winners;
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_i64_le(self.height);
        encoder.write_bytes(&self.final_state);
        write_hash_list(&mut encoder, &self.live.iter().copied().collect::<Vec<_>>());
        write_hash_list(&mut encoder, &self.winners);
        write_hash_list(&mut encoder, &self.missed.iter().copied().collect::<Vec<_>>());
        write_hash_list(&mut encoder, &self.spent_by_block);
        write_hash_list(&mut encoder, &self.missed_by_block);
        write_hash_list(&mut encoder, &self.new_by_block);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let height = decoder.read_i64_le()?;
        let mut final_state = [0u8; FINAL_STATE_SIZE];
        for byte in &mut final_state {
            *byte = decoder.read_u8()?;
        }
        let live = read_hash_list(&mut decoder)?.into_iter().collect();
        let winners = read_hash_list(&mut decoder)?;
        let missed = read_hash_list(&mut decoder)?.into_iter().collect();
        let spent_by_block = read_hash_list(&mut decoder)?;
        let missed_by_block = read_hash_list(&mut decoder)?;
        let new_by_block = read_hash_list(&mut decoder)?;
        decoder.finish()?;
        Ok(Self {
            height,
            live,
            winners,
            missed,
            final_state,
            spent_by_block,
            missed_by_block,
            new_by_block,
        })
    }
}

pub(crate) fn write_hash_list(encoder: &mut Encoder, hashes: &[Hash256]) {
    encoder.write_var_int(hashes.len() as u64);
    for hash in hashes {
        encoder.write_hash(hash);
    }
}

pub(crate) fn read_hash_list(decoder: &mut Decoder<'_>) -> Result<Vec<Hash256>, DecodeError> {
    let count = decoder.read_var_int()?;
    if count > 1 << 24 {
        return Err(DecodeError::Oversized);
    }
    let mut hashes = Vec::with_capacity(count.min(4_096) as usize);
    for _ in 0..count {
        hashes.push(decoder.read_hash()?);
    }
    Ok(hashes)
}

/// Records the stake state of a newly connected best block in the batch.
pub fn write_connected(batch: &mut WriteBatch, block_hash: &Hash256, node: &StakeNode) {
    batch.put(Column::StakeState, *block_hash, node.encode());
    batch.put(Column::Meta, BEST_STAKE_NODE_KEY, block_hash.to_vec());
}

/// Records the reversal of the tip block's stake state in the batch,
/// restoring the parent as the connected best node.
pub fn write_disconnected(
    batch: &mut WriteBatch,
    block_hash: &Hash256,
    parent_hash: &Hash256,
    parent_node: &StakeNode,
) {
    batch.delete(Column::StakeState, *block_hash);
    batch.put(Column::StakeState, *parent_hash, parent_node.encode());
    batch.put(Column::Meta, BEST_STAKE_NODE_KEY, parent_hash.to_vec());
}
