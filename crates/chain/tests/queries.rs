//! Query-surface tests: lookups, ranges, locators, version/agenda queries,
//! and chain-state initialization from a populated store.

mod common;

use std::sync::Arc;

use common::{build_block_with, extend_chain, new_chain, regnet_params, BlockSpec};
use emberd_chain::{Chain, ChainError, Config, ThresholdState};
use emberd_consensus::params::ConsensusDeployment;
use emberd_storage::memory::MemoryStore;

#[test]
fn height_range_boundaries() {
    let test = new_chain(regnet_params());
    let blocks = extend_chain(&test, &test.genesis, 5, 0);

    // Same start and end yields nothing.
    assert!(test.chain.height_range(2, 2).expect("range").is_empty());

    assert!(matches!(
        test.chain.height_range(-1, 2),
        Err(ChainError::InvalidArgument(_))
    ));
    assert!(matches!(
        test.chain.height_range(3, 2),
        Err(ChainError::InvalidArgument(_))
    ));

    // The end is clamped to one past the tip.
    let hashes = test.chain.height_range(4, 100).expect("range");
    assert_eq!(hashes, vec![blocks[3].hash(), blocks[4].hash()]);

    // A start past the tip yields nothing.
    assert!(test.chain.height_range(9, 12).expect("range").is_empty());
}

#[test]
fn lookups_by_hash_and_height() {
    let test = new_chain(regnet_params());
    let blocks = extend_chain(&test, &test.genesis, 3, 0);
    let side = build_block_with(
        &blocks[0],
        BlockSpec {
            tag: 3,
            ..BlockSpec::default()
        },
    );
    test.process(&side).expect("side block");

    assert_eq!(
        test.chain.block_hash_by_height(2).expect("hash"),
        blocks[1].hash()
    );
    assert_eq!(
        test.chain.block_height_by_hash(&blocks[1].hash()).expect("height"),
        2
    );
    // Side-chain blocks resolve by hash but have no main-chain height.
    assert!(test.chain.header_by_hash(&side.hash()).is_ok());
    assert!(matches!(
        test.chain.block_height_by_hash(&side.hash()),
        Err(ChainError::NotInMainChain(_))
    ));
    assert!(matches!(
        test.chain.header_by_height(9),
        Err(ChainError::NotInMainChain(_))
    ));

    let block = test.chain.block_by_hash(&side.hash()).expect("block");
    assert_eq!(block.hash(), side.hash());
    assert_eq!(
        test.chain.block_by_height(3).expect("block").hash(),
        blocks[2].hash()
    );

    assert_eq!(test.chain.best_prev_hash(), blocks[1].hash());
    let work_tip = test.chain.chain_work(&blocks[2].hash()).expect("work");
    let work_parent = test.chain.chain_work(&blocks[1].hash()).expect("work");
    assert!(work_tip > work_parent);
    assert!(matches!(
        test.chain.chain_work(&[0x55u8; 32]),
        Err(ChainError::UnknownBlock(_))
    ));
}

#[test]
fn locator_roundtrip_through_locate_inventory() {
    let test = new_chain(regnet_params());
    let blocks = extend_chain(&test, &test.genesis, 8, 0);
    let tip_hash = blocks[7].hash();

    // An empty locator asks for the stop hash itself.
    let located = test.chain.locate_blocks(&[], &tip_hash, 500);
    assert_eq!(located, vec![tip_hash]);

    // A locator built from the tip resolves to nothing further.
    let locator = test.chain.block_locator_from_hash(&tip_hash);
    assert!(test.chain.locate_blocks(&locator, &tip_hash, 500).is_empty());

    // A locator from a lower block yields everything after it up to the
    // stop hash.
    let locator = test.chain.block_locator_from_hash(&blocks[3].hash());
    let located = test.chain.locate_blocks(&locator, &blocks[6].hash(), 500);
    assert_eq!(
        located,
        vec![blocks[4].hash(), blocks[5].hash(), blocks[6].hash()]
    );

    // Headers mirror the block variant, honoring the cap.
    let headers = test.chain.locate_headers(&locator, &[0u8; 32], 2);
    assert_eq!(headers.len(), 2);
    assert_eq!(headers[0].hash(), blocks[4].hash());

    // An unknown locator falls back to just past genesis.
    let located = test.chain.locate_blocks(&[[0x77u8; 32]], &[0u8; 32], 3);
    assert_eq!(located[0], blocks[0].hash());
}

#[test]
fn latest_locator_tracks_tip() {
    let test = new_chain(regnet_params());
    let blocks = extend_chain(&test, &test.genesis, 4, 0);
    let locator = test.chain.latest_block_locator();
    assert_eq!(locator.first().copied(), Some(blocks[3].hash()));
    assert_eq!(locator.last().copied(), Some(test.genesis.hash()));
}

fn agenda_params() -> emberd_consensus::ChainParams {
    let mut params = regnet_params();
    params.rule_change_activation_interval = 8;
    params.rule_change_activation_quorum = 6;
    params.deployments.insert(
        7,
        vec![ConsensusDeployment {
            id: "testdummy",
            bit_mask: 0x0006,
            yes_choice: 0x0002,
            start_time: 0,
            expire_time: u64::MAX,
        }],
    );
    params
}

#[test]
fn threshold_state_progression() {
    let test = new_chain(agenda_params());

    // Everyone votes yes: choice bits 0b010 within the 0b110 mask, plus the
    // parent-approval bit.
    let mut parent = test.genesis.clone();
    for _ in 0..25 {
        let block = build_block_with(
            &parent,
            BlockSpec {
                vote_bits: 0x0003,
                ..BlockSpec::default()
            },
        );
        test.process(&block).expect("process");
        parent = block;
    }

    // Window 8: started after the first boundary, locked in after a full
    // yes window, active one window later.
    let at = |height: i64| {
        let hash = test.chain.block_hash_by_height(height).expect("hash");
        test.chain
            .next_threshold_state(&hash, 7, "testdummy")
            .expect("state")
    };
    assert_eq!(at(3).state, ThresholdState::Defined);
    assert_eq!(at(8).state, ThresholdState::Started);
    assert_eq!(at(16).state, ThresholdState::LockedIn);
    let active = at(24);
    assert_eq!(active.state, ThresholdState::Active);
    assert_eq!(active.choice, Some(0x0002));

    assert!(matches!(
        test.chain.next_threshold_state(&test.genesis.hash(), 9, "testdummy"),
        Err(ChainError::InvalidArgument(_))
    ));
}

#[test]
fn threshold_state_stalls_without_votes() {
    let test = new_chain(agenda_params());
    let mut parent = test.genesis.clone();
    for _ in 0..25 {
        // Vote bits carry only the parent-approval bit: no yes votes.
        let block = build_block_with(&parent, BlockSpec::default());
        test.process(&block).expect("process");
        parent = block;
    }
    let state = test
        .chain
        .next_threshold_state(&parent.hash(), 7, "testdummy")
        .expect("state");
    assert_eq!(state.state, ThresholdState::Started);
}

#[test]
fn stake_versions_walk() {
    let test = new_chain(regnet_params());
    let blocks = extend_chain(&test, &test.genesis, 5, 0);

    let versions = test
        .chain
        .stake_versions(&blocks[4].hash(), 3)
        .expect("versions");
    assert_eq!(versions.len(), 3);
    assert_eq!(versions[0].height, 5);
    assert_eq!(versions[2].height, 3);

    assert!(test
        .chain
        .stake_versions(&blocks[4].hash(), 0)
        .expect("empty")
        .is_empty());
    assert!(matches!(
        test.chain.stake_versions(&blocks[4].hash(), -1),
        Err(ChainError::InvalidArgument(_))
    ));
    // Counts beyond the chain clamp at genesis.
    let versions = test
        .chain
        .stake_versions(&blocks[4].hash(), 100)
        .expect("versions");
    assert_eq!(versions.len(), 6);
    assert!(matches!(
        test.chain.stake_versions(&[0x66u8; 32], 1),
        Err(ChainError::UnknownBlock(_))
    ));
}

#[test]
fn vote_info_checks_hash_and_version() {
    let test = new_chain(agenda_params());
    let blocks = extend_chain(&test, &test.genesis, 2, 0);

    let info = test.chain.vote_info(&blocks[1].hash(), 7).expect("info");
    assert_eq!(info.agendas.len(), 1);
    assert_eq!(info.agenda_status.len(), 1);

    assert!(matches!(
        test.chain.vote_info(&blocks[1].hash(), 3),
        Err(ChainError::InvalidArgument(_))
    ));
    // An unknown hash is rejected rather than silently tolerated.
    assert!(matches!(
        test.chain.vote_info(&[0x42u8; 32], 7),
        Err(ChainError::UnknownBlock(_))
    ));
}

#[test]
fn chain_state_reloads_from_store() {
    let test = new_chain(regnet_params());
    let blocks = extend_chain(&test, &test.genesis, 4, 0);
    let side = build_block_with(
        &blocks[1],
        BlockSpec {
            tag: 8,
            ..BlockSpec::default()
        },
    );
    test.process(&side).expect("side");
    let snapshot = test.chain.best_snapshot();

    let reloaded = Chain::new(Config {
        db: Arc::clone(&test.store),
        chain_params: regnet_params(),
        time_source: None,
        notifications: None,
        sig_cache: None,
        index_manager: None,
        interrupt: None,
    })
    .expect("reload");

    let reloaded_snapshot = reloaded.best_snapshot();
    assert_eq!(reloaded_snapshot.hash, snapshot.hash);
    assert_eq!(reloaded_snapshot.total_txns, snapshot.total_txns);
    assert_eq!(
        reloaded.block_hash_by_height(3).expect("hash"),
        blocks[2].hash()
    );
    // Side-chain entries survive the reload too.
    assert!(reloaded.header_by_hash(&side.hash()).is_ok());
    assert_eq!(
        reloaded.chain_work(&blocks[3].hash()).expect("work"),
        test.chain.chain_work(&blocks[3].hash()).expect("work")
    );
}

#[test]
fn init_observes_interrupt() {
    let test = new_chain(regnet_params());
    extend_chain(&test, &test.genesis, 3, 0);

    let (sender, receiver) = crossbeam_channel::bounded::<()>(0);
    drop(sender);
    let err = Chain::<MemoryStore>::new(Config {
        db: Arc::clone(&test.store),
        chain_params: regnet_params(),
        time_source: None,
        notifications: None,
        sig_cache: None,
        index_manager: None,
        interrupt: Some(receiver),
    })
    .expect_err("interrupted");
    assert!(matches!(err, ChainError::Interrupted));
}
