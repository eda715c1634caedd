//! Shared harness for chain integration tests: an in-memory chain with a
//! notification recorder and a miner producing valid regnet blocks.

use std::sync::{Arc, Mutex};

use emberd_chain::{
    genesis_block, BehaviorFlags, Chain, ChainError, Config, Notification, NotificationCallback,
};
use emberd_consensus::constants::FINAL_STATE_SIZE;
use emberd_consensus::pow::hash_meets_target;
use emberd_consensus::{chain_params, ChainParams, Hash256, Network};
use emberd_primitives::transaction::TAG_TICKET;
use emberd_primitives::{Block, BlockHeader, OutPoint, Transaction, TxIn, TxOut};
use emberd_storage::memory::MemoryStore;
use emberd_storage::{Column, KeyValueStore};

pub const EASY_BITS: u32 = 0x207fffff;
/// Half the `EASY_BITS` target: one of these carries twice the work, so a
/// branch ending in one outweighs an equal-length branch of easy blocks.
pub const HEAVY_BITS: u32 = 0x203fffff;

pub struct TestChain {
    pub chain: Chain<MemoryStore>,
    pub store: Arc<MemoryStore>,
    pub genesis: Block,
    events: Arc<Mutex<Vec<Notification>>>,
}

pub fn regnet_params() -> ChainParams {
    chain_params(Network::Regnet)
}

pub fn new_chain(params: ChainParams) -> TestChain {
    let store = Arc::new(MemoryStore::new());
    let events = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&events);
    let callback: NotificationCallback = Arc::new(move |notification: &Notification| {
        if let Ok(mut recorded) = recorder.lock() {
            recorded.push(notification.clone());
        }
    });
    let genesis = genesis_block(&params);
    let chain = Chain::new(Config {
        db: Arc::clone(&store),
        chain_params: params,
        time_source: None,
        notifications: Some(callback),
        sig_cache: None,
        index_manager: None,
        interrupt: None,
    })
    .expect("chain init");
    TestChain {
        chain,
        store,
        genesis,
        events,
    }
}

impl TestChain {
    pub fn process(&self, block: &Block) -> Result<(i64, bool), ChainError> {
        self.chain
            .process_block(Arc::new(block.clone()), BehaviorFlags::NONE)
    }

    pub fn events(&self) -> Vec<Notification> {
        self.events.lock().expect("events lock").clone()
    }

    pub fn clear_events(&self) {
        self.events.lock().expect("events lock").clear();
    }

    /// Hashes of blocks announced as connected, in order.
    pub fn connected_hashes(&self) -> Vec<Hash256> {
        self.events()
            .iter()
            .filter_map(|event| match event {
                Notification::BlockConnected { block, .. } => Some(block.hash()),
                _ => None,
            })
            .collect()
    }

    /// Hashes of blocks announced as disconnected, in order.
    pub fn disconnected_hashes(&self) -> Vec<Hash256> {
        self.events()
            .iter()
            .filter_map(|event| match event {
                Notification::BlockDisconnected { block, .. } => Some(block.hash()),
                _ => None,
            })
            .collect()
    }

    /// Snapshot of the durable chain-state columns, used to prove an
    /// operation had no durable side effects.
    pub fn state_columns(&self) -> Vec<Vec<(Vec<u8>, Vec<u8>)>> {
        [
            Column::Meta,
            Column::Utxo,
            Column::SpendJournal,
            Column::StakeState,
        ]
        .into_iter()
        .map(|column| self.store.scan_prefix(column, &[]).expect("scan"))
        .collect()
    }
}

/// A coinbase whose script commits to the height and a caller tag, keeping
/// sibling coinbases distinct.
fn coinbase_tx(height: u32, tag: u8, value: i64) -> Transaction {
    let mut script = vec![0x03];
    script.extend_from_slice(&height.to_le_bytes());
    script.push(tag);
    Transaction {
        version: 1,
        inputs: vec![TxIn {
            prevout: OutPoint::null(),
            signature_script: script,
            sequence: u32::MAX,
        }],
        outputs: vec![TxOut {
            value,
            script_pubkey: vec![0x51],
        }],
        lock_time: 0,
        expiry: 0,
    }
}

/// A transaction spending the given output.
pub fn spend_tx(prev: OutPoint, value: i64) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxIn {
            prevout: prev,
            signature_script: vec![0x04, 0x05],
            sequence: u32::MAX,
        }],
        outputs: vec![TxOut {
            value,
            script_pubkey: vec![0x52],
        }],
        lock_time: 0,
        expiry: 0,
    }
}

/// A ticket purchase funded by the given output.
pub fn ticket_tx(prev: OutPoint, value: i64) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxIn {
            prevout: prev,
            signature_script: vec![0x06],
            sequence: u32::MAX,
        }],
        outputs: vec![TxOut {
            value,
            script_pubkey: vec![TAG_TICKET, 0x51],
        }],
        lock_time: 0,
        expiry: 0,
    }
}

pub struct BlockSpec {
    pub txs: Vec<Transaction>,
    pub tag: u8,
    pub bits: u32,
    pub vote_bits: u16,
}

impl Default for BlockSpec {
    fn default() -> Self {
        Self {
            txs: Vec::new(),
            tag: 0,
            bits: EASY_BITS,
            vote_bits: 1,
        }
    }
}

/// Mines a valid child of `parent`.
pub fn build_block_with(parent: &Block, spec: BlockSpec) -> Block {
    let height = parent.header.height + 1;
    let mut transactions = vec![coinbase_tx(height, spec.tag, 50_000)];
    transactions.extend(spec.txs);

    let mut block = Block {
        header: BlockHeader {
            version: 1,
            prev_block: parent.hash(),
            merkle_root: [0u8; 32],
            vote_bits: spec.vote_bits,
            voters: 0,
            fresh_stake: 0,
            revocations: 0,
            final_state: [0u8; FINAL_STATE_SIZE],
            pool_size: 0,
            bits: spec.bits,
            sbits: 20_000,
            height,
            size: 0,
            timestamp: parent.header.timestamp + 60,
            nonce: 0,
            stake_version: 0,
        },
        transactions,
    };
    block.header.merkle_root = block.compute_merkle_root();
    block.header.size = block.encode().len() as u32;
    while !hash_meets_target(&block.hash(), spec.bits).expect("target") {
        block.header.nonce += 1;
    }
    block
}

pub fn build_block(parent: &Block, tag: u8) -> Block {
    build_block_with(
        parent,
        BlockSpec {
            tag,
            ..BlockSpec::default()
        },
    )
}

/// Extends the chain with `count` empty blocks, returning the blocks.
pub fn extend_chain(test: &TestChain, from: &Block, count: usize, tag: u8) -> Vec<Block> {
    let mut blocks = Vec::with_capacity(count);
    let mut parent = from.clone();
    for _ in 0..count {
        let block = build_block(&parent, tag);
        test.process(&block).expect("process");
        parent = block.clone();
        blocks.push(block);
    }
    blocks
}
