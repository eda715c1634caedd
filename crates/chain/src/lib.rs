//! Block-chain core: block index, best-chain view, and the reorganization
//! engine that keeps the persisted UTXO set, spend journal, stake state, and
//! best-state record in lockstep with the chosen tip.

pub mod blockindex;
pub mod chain;
pub mod chainio;
pub mod chainview;
pub mod error;
pub mod notifications;
pub mod process;
pub mod stake;
pub mod stakeversion;
pub mod thresholdstate;
pub mod utxoview;
pub mod validate;

pub use blockindex::{BlockIndex, BlockStatus, NodeId, TicketInfo};
pub use chain::{
    genesis_block, BestState, Chain, Config, IndexManager, MAIN_CHAIN_CACHE_SIZE,
    MIN_MEMORY_NODES, MIN_MEMORY_STAKE_NODES,
};
pub use chainview::ChainView;
pub use error::{ChainError, RuleError, RuleErrorKind};
pub use notifications::{Notification, NotificationCallback, ReorganizationData, TicketData};
pub use process::MAX_ORPHAN_BLOCKS;
pub use stake::{StakeNode, StakeUndo};
pub use stakeversion::{StakeVersions, VoteInfo};
pub use thresholdstate::{ThresholdState, ThresholdStateTuple};
pub use utxoview::{SpentTxOut, StakeViewpoint, UtxoEntry, UtxoView};
pub use validate::{
    check_block_sanity, BehaviorFlags, MedianTimeSource, SigCache, SystemTimeSource,
};
