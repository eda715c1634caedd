//! Transaction output references.

use emberd_consensus::{Hash256, ZERO_HASH};

use crate::encoding::{DecodeError, Decoder, Encoder};

/// Index value marking a coinbase input's null previous output.
pub const NULL_OUTPUT_INDEX: u32 = u32::MAX;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct OutPoint {
    pub hash: Hash256,
    pub index: u32,
}

impl OutPoint {
    pub fn null() -> Self {
        Self {
            hash: ZERO_HASH,
            index: NULL_OUTPUT_INDEX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.hash == ZERO_HASH && self.index == NULL_OUTPUT_INDEX
    }

    pub fn write(&self, encoder: &mut Encoder) {
        encoder.write_hash(&self.hash);
        encoder.write_u32_le(self.index);
    }

    pub fn read(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            hash: decoder.read_hash()?,
            index: decoder.read_u32_le()?,
        })
    }

    /// Fixed-width key for outpoint-indexed store columns.
    pub fn key_bytes(&self) -> [u8; 36] {
        let mut key = [0u8; 36];
        key[..32].copy_from_slice(&self.hash);
        key[32..].copy_from_slice(&self.index.to_le_bytes());
        key
    }
}
