//! Consensus parameters, constants, and subsidy/work arithmetic.

pub mod constants;
pub mod params;
pub mod pow;
pub mod subsidy;

/// 32-byte content hash. Equality and ordering are byte-wise.
pub type Hash256 = [u8; 32];

pub const ZERO_HASH: Hash256 = [0u8; 32];

pub use params::{chain_params, ChainParams, Checkpoint, ConsensusDeployment, Network};
pub use subsidy::{block_subsidy, SubsidyCache};

/// Parses a 64-character hex string into a hash, most significant byte first.
pub fn hash256_from_hex(hex: &str) -> Option<Hash256> {
    if hex.len() != 64 {
        return None;
    }
    let mut out = [0u8; 32];
    let bytes = hex.as_bytes();
    for (i, chunk) in bytes.chunks(2).enumerate() {
        let high = (chunk[0] as char).to_digit(16)? as u8;
        let low = (chunk[1] as char).to_digit(16)? as u8;
        out[i] = high << 4 | low;
    }
    Some(out)
}

/// Renders a hash as lowercase hex, most significant byte first.
pub fn hash256_to_hex(hash: &Hash256) -> String {
    let mut out = String::with_capacity(64);
    for byte in hash {
        out.push(char::from_digit((byte >> 4) as u32, 16).unwrap_or('0'));
        out.push(char::from_digit((byte & 0x0f) as u32, 16).unwrap_or('0'));
    }
    out
}
