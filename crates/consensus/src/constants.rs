//! Consensus-wide constants shared across validation and chain state.

/// The minimum allowed block version (network rule).
pub const MIN_BLOCK_VERSION: i32 = 1;
/// The maximum allowed size for a serialized block, in bytes (network rule).
pub const MAX_BLOCK_SIZE: u32 = 1_310_720;
/// The maximum allowed number of transactions in a block (network rule).
pub const MAX_BLOCK_TXNS: usize = 65_536;
/// Vote bit that commits to the validity of the parent block's regular tree.
pub const VOTE_BIT_APPROVE_PARENT: u16 = 0x0001;
/// Size in bytes of the lottery final state committed to by headers.
pub const FINAL_STATE_SIZE: usize = 6;
/// The maximum number of hashes returned in response to a block locator.
pub const MAX_LOCATE_HASHES: u32 = 500;
/// The maximum number of headers returned in response to a block locator.
pub const MAX_LOCATE_HEADERS: u32 = 2_000;
