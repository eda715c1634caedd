//! Block and header types.

use emberd_consensus::constants::FINAL_STATE_SIZE;
use emberd_consensus::Hash256;

use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::{merkle_root, sha256d};
use crate::transaction::Transaction;

/// Serialized size of a header, in bytes.
pub const HEADER_SIZE: usize = 4 + 32 + 32 + 2 + 2 + 1 + 1 + FINAL_STATE_SIZE + 4 + 4 + 8 + 4 + 4 + 4 + 4 + 4;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub vote_bits: u16,
    pub voters: u16,
    pub fresh_stake: u8,
    pub revocations: u8,
    pub final_state: [u8; FINAL_STATE_SIZE],
    pub pool_size: u32,
    pub bits: u32,
    pub sbits: i64,
    pub height: u32,
    pub size: u32,
    pub timestamp: u32,
    pub nonce: u32,
    pub stake_version: u32,
}

impl BlockHeader {
    pub fn write(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_hash(&self.prev_block);
        encoder.write_hash(&self.merkle_root);
        encoder.write_u16_le(self.vote_bits);
        encoder.write_u16_le(self.voters);
        encoder.write_u8(self.fresh_stake);
        encoder.write_u8(self.revocations);
        encoder.write_bytes(&self.final_state);
        encoder.write_u32_le(self.pool_size);
        encoder.write_u32_le(self.bits);
        encoder.write_i64_le(self.sbits);
        encoder.write_u32_le(self.height);
        encoder.write_u32_le(self.size);
        encoder.write_u32_le(self.timestamp);
        encoder.write_u32_le(self.nonce);
        encoder.write_u32_le(self.stake_version);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(HEADER_SIZE);
        self.write(&mut encoder);
        encoder.into_inner()
    }

    pub fn read(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;
        let prev_block = decoder.read_hash()?;
        let merkle_root = decoder.read_hash()?;
        let vote_bits = decoder.read_u16_le()?;
        let voters = decoder.read_u16_le()?;
        let fresh_stake = decoder.read_u8()?;
        let revocations = decoder.read_u8()?;
        let mut final_state = [0u8; FINAL_STATE_SIZE];
        for byte in &mut final_state {
            *byte = decoder.read_u8()?;
        }
        Ok(Self {
            version,
            prev_block,
            merkle_root,
            vote_bits,
            voters,
            fresh_stake,
            revocations,
            final_state,
            pool_size: decoder.read_u32_le()?,
            bits: decoder.read_u32_le()?,
            sbits: decoder.read_i64_le()?,
            height: decoder.read_u32_le()?,
            size: decoder.read_u32_le()?,
            timestamp: decoder.read_u32_le()?,
            nonce: decoder.read_u32_le()?,
            stake_version: decoder.read_u32_le()?,
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header = Self::read(&mut decoder)?;
        decoder.finish()?;
        Ok(header)
    }

    pub fn hash(&self) -> Hash256 {
        sha256d(&self.encode())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn height(&self) -> i64 {
        self.header.height as i64
    }

    /// Merkle root over the block's transaction identifiers.
    pub fn compute_merkle_root(&self) -> Hash256 {
        let txids: Vec<Hash256> = self.transactions.iter().map(Transaction::txid).collect();
        merkle_root(&txids)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.header.write(&mut encoder);
        encoder.write_var_int(self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.write(&mut encoder);
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header = BlockHeader::read(&mut decoder)?;
        let count = decoder.read_var_int()?;
        if count > u32::MAX as u64 {
            return Err(DecodeError::Oversized);
        }
        let mut transactions = Vec::with_capacity(count.min(1_024) as usize);
        for _ in 0..count {
            transactions.push(Transaction::read(&mut decoder)?);
        }
        decoder.finish()?;
        Ok(Self {
            header,
            transactions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outpoint::OutPoint;
    use crate::transaction::{TxIn, TxOut};

    fn sample_block() -> Block {
        let coinbase = Transaction {
            version: 1,
            inputs: vec![TxIn {
                prevout: OutPoint::null(),
                signature_script: vec![0x00, 0x01],
                sequence: u32::MAX,
            }],
            outputs: vec![TxOut {
                value: 5_000_000_000,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
            expiry: 0,
        };
        let mut block = Block {
            header: BlockHeader {
                version: 1,
                prev_block: [0u8; 32],
                merkle_root: [0u8; 32],
                vote_bits: 1,
                voters: 0,
                fresh_stake: 0,
                revocations: 0,
                final_state: [0u8; FINAL_STATE_SIZE],
                pool_size: 0,
                bits: 0x207fffff,
                sbits: 20_000,
                height: 1,
                size: 0,
                timestamp: 1_538_524_801,
                nonce: 42,
                stake_version: 0,
            },
            transactions: vec![coinbase],
        };
        block.header.merkle_root = block.compute_merkle_root();
        block
    }

    #[test]
    fn header_encoding_is_fixed_size() {
        let block = sample_block();
        assert_eq!(block.header.encode().len(), HEADER_SIZE);
    }

    #[test]
    fn block_roundtrip_preserves_hash() {
        let block = sample_block();
        let decoded = Block::decode(&block.encode()).expect("decode");
        assert_eq!(decoded, block);
        assert_eq!(decoded.hash(), block.hash());
    }
}
