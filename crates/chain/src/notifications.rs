//! Chain event notifications.
//!
//! The tip engine records events while it holds the chain lock; the public
//! entry points deliver them in order after the lock is released. Callbacks
//! therefore must not re-enter the chain synchronously.

use std::sync::Arc;

use emberd_consensus::Hash256;
use emberd_primitives::Block;

#[derive(Clone, Debug)]
pub struct ReorganizationData {
    pub old_hash: Hash256,
    pub old_height: i64,
    pub new_hash: Hash256,
    pub new_height: i64,
}

#[derive(Clone, Debug)]
pub struct TicketData {
    pub hash: Hash256,
    pub height: i64,
    pub stake_difficulty: i64,
    pub tickets_spent: Vec<Hash256>,
    pub tickets_missed: Vec<Hash256>,
    pub tickets_new: Vec<Hash256>,
}

#[derive(Clone, Debug)]
pub enum Notification {
    /// A block was connected to the main chain. Carries the block and its
    /// parent.
    BlockConnected {
        block: Arc<Block>,
        parent: Arc<Block>,
    },
    /// A block was disconnected from the main chain.
    BlockDisconnected {
        block: Arc<Block>,
        parent: Arc<Block>,
    },
    /// A reorganization moved the tip between competing branches.
    Reorganization(ReorganizationData),
    ChainReorgStarted,
    ChainReorgDone,
    SpentAndMissedTickets(TicketData),
    NewTickets(TicketData),
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::BlockConnected { .. } => "blockconnected",
            Notification::BlockDisconnected { .. } => "blockdisconnected",
            Notification::Reorganization(_) => "reorganization",
            Notification::ChainReorgStarted => "chainreorgstarted",
            Notification::ChainReorgDone => "chainreorgdone",
            Notification::SpentAndMissedTickets(_) => "spentandmissedtickets",
            Notification::NewTickets(_) => "newtickets",
        }
    }
}

pub type NotificationCallback = Arc<dyn Fn(&Notification) + Send + Sync>;
