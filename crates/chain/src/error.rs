//! Chain error types.

use emberd_consensus::{hash256_to_hex, Hash256};
use emberd_primitives::encoding::DecodeError;
use emberd_storage::StoreError;

/// The kind of a consensus rule violation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RuleErrorKind {
    NoTransactions,
    FirstTxNotCoinbase,
    MultipleCoinbases,
    BadMerkleRoot,
    HighHash,
    TooManyTransactions,
    TimeTooOld,
    TimeTooNew,
    BadBlockHeight,
    BlockVersionTooOld,
    BadCheckpoint,
    ForkTooDeep,
    MissingTxOut,
    DoubleSpend,
    ImmatureSpend,
    SpendTooHigh,
    BadTxValue,
    ScriptValidation,
    TicketUnavailable,
    ForceReorgWrongChain,
    ForceReorgMissingChild,
    KnownInvalidBlock,
}

/// A candidate block violated a consensus rule. Never fatal to the process;
/// the offending node is marked failed and the error is returned.
#[derive(Clone, Debug)]
pub struct RuleError {
    pub kind: RuleErrorKind,
    pub description: String,
}

impl std::fmt::Display for RuleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description)
    }
}

impl std::error::Error for RuleError {}

pub(crate) fn rule_error(kind: RuleErrorKind, description: impl Into<String>) -> ChainError {
    ChainError::Rule(RuleError {
        kind,
        description: description.into(),
    })
}

#[derive(Debug)]
pub enum ChainError {
    /// Consensus rule violation for a candidate block.
    Rule(RuleError),
    /// The queried block exists only on a side chain, or not at all.
    NotInMainChain(String),
    /// Hash known to neither the index nor the orphan pool.
    UnknownBlock(Hash256),
    /// Block already present in the index or orphan pool.
    DuplicateBlock(Hash256),
    /// The interrupt channel closed during a long-running operation.
    Interrupted,
    /// Durable-store failure; aborts the current tip transition.
    Store(StoreError),
    /// A persisted record failed to deserialize.
    Corrupt(&'static str),
    /// Invalid query arguments.
    InvalidArgument(String),
    /// Programmer error. Not recoverable by callers.
    Assert(String),
}

impl std::fmt::Display for ChainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainError::Rule(err) => write!(f, "{err}"),
            ChainError::NotInMainChain(message) => write!(f, "{message}"),
            ChainError::UnknownBlock(hash) => {
                write!(f, "block {} is not known", hash256_to_hex(hash))
            }
            ChainError::DuplicateBlock(hash) => {
                write!(f, "already have block {}", hash256_to_hex(hash))
            }
            ChainError::Interrupted => write!(f, "operation interrupted"),
            ChainError::Store(err) => write!(f, "{err}"),
            ChainError::Corrupt(message) => write!(f, "{message}"),
            ChainError::InvalidArgument(message) => write!(f, "{message}"),
            ChainError::Assert(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for ChainError {}

impl From<StoreError> for ChainError {
    fn from(err: StoreError) -> Self {
        ChainError::Store(err)
    }
}

impl From<RuleError> for ChainError {
    fn from(err: RuleError) -> Self {
        ChainError::Rule(err)
    }
}

impl From<DecodeError> for ChainError {
    fn from(_: DecodeError) -> Self {
        ChainError::Corrupt("malformed persisted record")
    }
}

impl ChainError {
    pub fn is_rule_error(&self) -> bool {
        matches!(self, ChainError::Rule(_))
    }

    pub fn rule_kind(&self) -> Option<RuleErrorKind> {
        match self {
            ChainError::Rule(err) => Some(err.kind),
            _ => None,
        }
    }
}
