//! Persisted record layouts.
//!
//! Every layout here must round-trip unchanged: the block-index entry with
//! its status bits, the best-state record, the spend-journal entry, and raw
//! blocks.

use emberd_consensus::constants::FINAL_STATE_SIZE;
use emberd_consensus::Hash256;
use emberd_primitives::encoding::{DecodeError, Decoder, Encoder};
use emberd_primitives::{Block, BlockHeader};
use emberd_storage::{Column, KeyValueStore, WriteBatch};
use primitive_types::U256;

use crate::blockindex::{BlockStatus, TicketInfo};
use crate::chain::BestState;
use crate::error::ChainError;
use crate::stake::{read_hash_list, write_hash_list};
use crate::utxoview::{SpentTxOut, UtxoEntry};

/// Store key of the serialized best-chain state in `Column::Meta`.
pub const BEST_STATE_KEY: &[u8] = b"beststate";

/// Block-index entries are keyed by big-endian height followed by the block
/// hash so a prefix scan yields them in height order.
pub fn block_index_key(height: i64, hash: &Hash256) -> [u8; 36] {
    let mut key = [0u8; 36];
    key[..4].copy_from_slice(&(height as u32).to_be_bytes());
    key[4..].copy_from_slice(hash);
    key
}

pub fn serialize_block_index_entry(
    header: &BlockHeader,
    status: BlockStatus,
    ticket_info: Option<&TicketInfo>,
) -> Vec<u8> {
    let mut encoder = Encoder::new();
    header.write(&mut encoder);
    encoder.write_u8(status.bits());
    match ticket_info {
        Some(info) => {
            encoder.write_u8(1);
            write_hash_list(&mut encoder, &info.new_tickets);
            write_hash_list(&mut encoder, &info.tickets_voted);
            write_hash_list(&mut encoder, &info.tickets_revoked);
        }
        None => encoder.write_u8(0),
    }
    encoder.into_inner()
}

pub struct BlockIndexEntry {
    pub header: BlockHeader,
    pub status: BlockStatus,
    pub ticket_info: Option<TicketInfo>,
}

pub fn deserialize_block_index_entry(bytes: &[u8]) -> Result<BlockIndexEntry, DecodeError> {
    let mut decoder = Decoder::new(bytes);
    let header = BlockHeader::read(&mut decoder)?;
    let status = BlockStatus::from_bits(decoder.read_u8()?);
    let ticket_info = if decoder.read_u8()? != 0 {
        Some(TicketInfo {
            new_tickets: read_hash_list(&mut decoder)?,
            tickets_voted: read_hash_list(&mut decoder)?,
            tickets_revoked: read_hash_list(&mut decoder)?,
        })
    } else {
        None
    };
    decoder.finish()?;
    Ok(BlockIndexEntry {
        header,
        status,
        ticket_info,
    })
}

pub fn serialize_best_state(state: &BestState, work_sum: U256) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_hash(&state.hash);
    encoder.write_hash(&state.prev_hash);
    encoder.write_i64_le(state.height);
    encoder.write_u32_le(state.bits);
    encoder.write_u32_le(state.next_pool_size);
    encoder.write_i64_le(state.next_stake_diff);
    encoder.write_u64_le(state.block_size);
    encoder.write_u64_le(state.num_txns);
    encoder.write_u64_le(state.total_txns);
    encoder.write_i64_le(state.median_time);
    encoder.write_i64_le(state.total_subsidy);
    write_hash_list(&mut encoder, &state.next_winning_tickets);
    write_hash_list(&mut encoder, &state.missed_tickets);
    encoder.write_bytes(&state.next_final_state);
    encoder.write_bytes(&work_sum.to_big_endian());
    encoder.into_inner()
}

pub fn deserialize_best_state(bytes: &[u8]) -> Result<(BestState, U256), DecodeError> {
    let mut decoder = Decoder::new(bytes);
    let hash = decoder.read_hash()?;
    let prev_hash = decoder.read_hash()?;
    let height = decoder.read_i64_le()?;
    let bits = decoder.read_u32_le()?;
    let next_pool_size = decoder.read_u32_le()?;
    let next_stake_diff = decoder.read_i64_le()?;
    let block_size = decoder.read_u64_le()?;
    let num_txns = decoder.read_u64_le()?;
    let total_txns = decoder.read_u64_le()?;
    let median_time = decoder.read_i64_le()?;
    let total_subsidy = decoder.read_i64_le()?;
    let next_winning_tickets = read_hash_list(&mut decoder)?;
    let missed_tickets = read_hash_list(&mut decoder)?;
    let mut next_final_state = [0u8; FINAL_STATE_SIZE];
    for byte in &mut next_final_state {
        *byte = decoder.read_u8()?;
    }
    let work = decoder.read_hash()?;
    decoder.finish()?;
    Ok((
        BestState {
            hash,
            prev_hash,
            height,
            bits,
            next_pool_size,
            next_stake_diff,
            block_size,
            num_txns,
            total_txns,
            median_time,
            total_subsidy,
            next_winning_tickets,
            missed_tickets,
            next_final_state,
        },
        U256::from_big_endian(&work),
    ))
}

pub fn put_best_state(batch: &mut WriteBatch, state: &BestState, work_sum: U256) {
    batch.put(
        Column::Meta,
        BEST_STATE_KEY,
        serialize_best_state(state, work_sum),
    );
}

pub fn fetch_best_state<S: KeyValueStore>(
    store: &S,
) -> Result<Option<(BestState, U256)>, ChainError> {
    match store.get(Column::Meta, BEST_STATE_KEY)? {
        Some(bytes) => Ok(Some(deserialize_best_state(&bytes)?)),
        None => Ok(None),
    }
}

pub fn serialize_spend_journal(stxos: &[SpentTxOut]) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_var_int(stxos.len() as u64);
    for stxo in stxos {
        stxo.outpoint.write(&mut encoder);
        stxo.entry.write(&mut encoder);
    }
    encoder.into_inner()
}

pub fn deserialize_spend_journal(bytes: &[u8]) -> Result<Vec<SpentTxOut>, DecodeError> {
    let mut decoder = Decoder::new(bytes);
    let count = decoder.read_var_int()?;
    if count > 1 << 24 {
        return Err(DecodeError::Oversized);
    }
    let mut stxos = Vec::with_capacity(count.min(4_096) as usize);
    for _ in 0..count {
        stxos.push(SpentTxOut {
            outpoint: emberd_primitives::OutPoint::read(&mut decoder)?,
            entry: UtxoEntry::read(&mut decoder)?,
        });
    }
    decoder.finish()?;
    Ok(stxos)
}

pub fn put_spend_journal_entry(batch: &mut WriteBatch, block_hash: &Hash256, stxos: &[SpentTxOut]) {
    batch.put(
        Column::SpendJournal,
        *block_hash,
        serialize_spend_journal(stxos),
    );
}

pub fn remove_spend_journal_entry(batch: &mut WriteBatch, block_hash: &Hash256) {
    batch.delete(Column::SpendJournal, *block_hash);
}

pub fn fetch_spend_journal_entry<S: KeyValueStore>(
    store: &S,
    block_hash: &Hash256,
) -> Result<Option<Vec<SpentTxOut>>, ChainError> {
    match store.get(Column::SpendJournal, block_hash)? {
        Some(bytes) => Ok(Some(deserialize_spend_journal(&bytes)?)),
        None => Ok(None),
    }
}

pub fn put_block(batch: &mut WriteBatch, block: &Block) {
    batch.put(Column::Blocks, block.hash(), block.encode());
}

pub fn fetch_block<S: KeyValueStore>(
    store: &S,
    hash: &Hash256,
) -> Result<Option<Block>, ChainError> {
    match store.get(Column::Blocks, hash)? {
        Some(bytes) => Ok(Some(Block::decode(&bytes)?)),
        None => Ok(None),
    }
}
