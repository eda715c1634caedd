//! End-to-end tip-engine scenarios: linear extension, inert forks, two-phase
//! reorganization, dry-run failure isolation, forced head reorganization,
//! and orphan promotion.

mod common;

use common::{
    build_block, build_block_with, extend_chain, new_chain, regnet_params, spend_tx, BlockSpec,
    HEAVY_BITS,
};
use emberd_chain::{BehaviorFlags, ChainError, Notification, RuleErrorKind};
use emberd_primitives::OutPoint;
use emberd_storage::{Column, KeyValueStore};

#[test]
fn linear_extend() {
    let test = new_chain(regnet_params());
    let blocks = extend_chain(&test, &test.genesis, 3, 0);

    let snapshot = test.chain.best_snapshot();
    assert_eq!(snapshot.hash, blocks[2].hash());
    assert_eq!(snapshot.height, 3);

    // Every block, genesis included, carries one transaction.
    let expected_txns: u64 = 1 + blocks.iter().map(|b| b.transactions.len() as u64).sum::<u64>();
    assert_eq!(snapshot.total_txns, expected_txns);

    let locator = test.chain.block_locator_from_hash(&blocks[2].hash());
    assert_eq!(locator.first().copied(), Some(blocks[2].hash()));
    assert_eq!(locator.last().copied(), Some(test.genesis.hash()));

    assert_eq!(
        test.connected_hashes(),
        vec![blocks[0].hash(), blocks[1].hash(), blocks[2].hash()]
    );
}

#[test]
fn shorter_fork_stays_inert() {
    let test = new_chain(regnet_params());
    let blocks = extend_chain(&test, &test.genesis, 3, 0);
    test.clear_events();

    // B2a forks off B1 with less cumulative work than the tip.
    let b2a = build_block(&blocks[0], 1);
    let (fork_len, is_orphan) = test.process(&b2a).expect("process b2a");
    assert!(!is_orphan);
    assert_eq!(fork_len, 1);

    let snapshot = test.chain.best_snapshot();
    assert_eq!(snapshot.hash, blocks[2].hash());
    assert!(test.chain.have_block(&b2a.hash()));
    assert!(!test.chain.main_chain_has_block(&b2a.hash()));
    assert!(test.connected_hashes().is_empty());

    let mut generation = test.chain.tip_generation().expect("tip generation");
    generation.sort();
    let mut expected = vec![blocks[2].hash(), b2a.hash()];
    expected.sort();
    assert_eq!(generation, expected);
}

#[test]
fn heavier_fork_reorganizes() {
    let test = new_chain(regnet_params());
    let blocks = extend_chain(&test, &test.genesis, 3, 0);
    let b2a = build_block(&blocks[0], 1);
    test.process(&b2a).expect("process b2a");
    test.clear_events();

    // B3a extends the side chain with enough extra work to win.
    let b3a = build_block_with(
        &b2a,
        BlockSpec {
            tag: 1,
            bits: HEAVY_BITS,
            ..BlockSpec::default()
        },
    );
    test.process(&b3a).expect("process b3a");

    let snapshot = test.chain.best_snapshot();
    assert_eq!(snapshot.hash, b3a.hash());

    // Exactly one reorganization event with the right endpoints.
    let reorgs: Vec<_> = test
        .events()
        .iter()
        .filter_map(|event| match event {
            Notification::Reorganization(data) => Some(data.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(reorgs.len(), 1);
    assert_eq!(reorgs[0].old_hash, blocks[2].hash());
    assert_eq!(reorgs[0].new_hash, b3a.hash());

    // One disconnect for B3 (plus B2, which shares its fate), then connects
    // for B2a and B3a in that order.
    let disconnected = test.disconnected_hashes();
    assert_eq!(
        disconnected
            .iter()
            .filter(|hash| **hash == blocks[2].hash())
            .count(),
        1
    );
    assert_eq!(disconnected, vec![blocks[2].hash(), blocks[1].hash()]);
    assert_eq!(test.connected_hashes(), vec![b2a.hash(), b3a.hash()]);

    // The UTXO set now reflects G -> B1 -> B2a -> B3a.
    let utxo_present = |block: &emberd_primitives::Block| {
        let outpoint = OutPoint {
            hash: block.transactions[0].txid(),
            index: 0,
        };
        test.store
            .get(Column::Utxo, &outpoint.key_bytes())
            .expect("utxo get")
            .is_some()
    };
    assert!(utxo_present(&blocks[0]));
    assert!(utxo_present(&b2a));
    assert!(utxo_present(&b3a));
    assert!(!utxo_present(&blocks[1]));
    assert!(!utxo_present(&blocks[2]));
}

#[test]
fn dry_run_catches_rule_violation_without_durable_writes() {
    let test = new_chain(regnet_params());
    let blocks = extend_chain(&test, &test.genesis, 3, 0);
    let b2a = build_block(&blocks[0], 1);
    test.process(&b2a).expect("process b2a");
    test.clear_events();

    let before = test.state_columns();

    // B3a would win the reorg but spends an output that does not exist.
    let missing = OutPoint {
        hash: [0xabu8; 32],
        index: 0,
    };
    let b3a = build_block_with(
        &b2a,
        BlockSpec {
            txs: vec![spend_tx(missing, 10)],
            tag: 1,
            bits: HEAVY_BITS,
            ..BlockSpec::default()
        },
    );
    let err = test.process(&b3a).expect_err("invalid reorg");
    assert_eq!(err.rule_kind(), Some(RuleErrorKind::MissingTxOut));

    // Old tip still stands, the node is marked failed, nothing was written,
    // and nothing was announced.
    assert_eq!(test.chain.best_snapshot().hash, blocks[2].hash());
    let node = test.chain.index.lookup_node(&b3a.hash()).expect("node");
    assert!(test.chain.index.node_status(node).known_invalid());
    assert_eq!(test.state_columns(), before);
    assert!(test.events().is_empty());
}

#[test]
fn invalid_ancestor_propagates_to_descendants() {
    let test = new_chain(regnet_params());
    let blocks = extend_chain(&test, &test.genesis, 3, 0);
    let b2a = build_block(&blocks[0], 1);
    test.process(&b2a).expect("process b2a");

    let missing = OutPoint {
        hash: [0xabu8; 32],
        index: 0,
    };
    let b3a = build_block_with(
        &b2a,
        BlockSpec {
            txs: vec![spend_tx(missing, 10)],
            tag: 1,
            bits: HEAVY_BITS,
            ..BlockSpec::default()
        },
    );
    test.process(&b3a).expect_err("invalid reorg");

    // A heavier child of the failed block is recorded but cannot win.
    let b4a = build_block_with(
        &b3a,
        BlockSpec {
            tag: 1,
            bits: HEAVY_BITS,
            ..BlockSpec::default()
        },
    );
    test.process(&b4a).expect("record descendant");
    assert_eq!(test.chain.best_snapshot().hash, blocks[2].hash());
    let node = test.chain.index.lookup_node(&b4a.hash()).expect("node");
    assert!(test.chain.index.node_status(node).known_invalid());
}

#[test]
fn extend_case_marks_invalid_block_failed() {
    let test = new_chain(regnet_params());
    let blocks = extend_chain(&test, &test.genesis, 1, 0);

    let missing = OutPoint {
        hash: [0xcdu8; 32],
        index: 3,
    };
    let bad = build_block_with(
        &blocks[0],
        BlockSpec {
            txs: vec![spend_tx(missing, 10)],
            tag: 2,
            ..BlockSpec::default()
        },
    );
    let err = test.process(&bad).expect_err("invalid extension");
    assert_eq!(err.rule_kind(), Some(RuleErrorKind::MissingTxOut));

    assert_eq!(test.chain.best_snapshot().hash, blocks[0].hash());
    let node = test.chain.index.lookup_node(&bad.hash()).expect("node");
    assert!(test.chain.index.node_status(node).known_invalid());
}

#[test]
fn forced_head_reorg_switches_to_sibling() {
    let test = new_chain(regnet_params());
    let blocks = extend_chain(&test, &test.genesis, 2, 0);

    // A sibling of the tip with equal work stays inert on arrival.
    let b2b = build_block(&blocks[0], 7);
    test.process(&b2b).expect("process sibling");
    assert_eq!(test.chain.best_snapshot().hash, blocks[1].hash());
    test.clear_events();

    test.chain
        .force_head_reorganization(blocks[1].hash(), b2b.hash())
        .expect("forced reorg");

    // The named target, not the positional first argument, became the tip.
    assert_eq!(test.chain.best_snapshot().hash, b2b.hash());
    assert_eq!(test.disconnected_hashes(), vec![blocks[1].hash()]);
    assert_eq!(test.connected_hashes(), vec![b2b.hash()]);
}

#[test]
fn forced_head_reorg_wrong_chain() {
    let test = new_chain(regnet_params());
    let blocks = extend_chain(&test, &test.genesis, 3, 0);
    let b2a = build_block(&blocks[0], 1);
    test.process(&b2a).expect("process b2a");

    // Former best names B2 while the tip is B3.
    let err = test
        .chain
        .force_head_reorganization(blocks[1].hash(), b2a.hash())
        .expect_err("wrong chain");
    assert_eq!(err.rule_kind(), Some(RuleErrorKind::ForceReorgWrongChain));
    assert_eq!(test.chain.best_snapshot().hash, blocks[2].hash());
}

#[test]
fn forced_head_reorg_missing_child() {
    let test = new_chain(regnet_params());
    let blocks = extend_chain(&test, &test.genesis, 2, 0);

    let err = test
        .chain
        .force_head_reorganization(blocks[1].hash(), [0x44u8; 32])
        .expect_err("missing child");
    assert_eq!(err.rule_kind(), Some(RuleErrorKind::ForceReorgMissingChild));
}

#[test]
fn forced_head_reorg_rejects_known_invalid_sibling() {
    let test = new_chain(regnet_params());
    let blocks = extend_chain(&test, &test.genesis, 2, 0);

    // A heavier invalid sibling fails its dry run and is marked failed.
    let missing = OutPoint {
        hash: [0xefu8; 32],
        index: 0,
    };
    let bad_sibling = build_block_with(
        &blocks[0],
        BlockSpec {
            txs: vec![spend_tx(missing, 5)],
            tag: 9,
            bits: HEAVY_BITS,
            ..BlockSpec::default()
        },
    );
    test.process(&bad_sibling).expect_err("invalid sibling");

    let err = test
        .chain
        .force_head_reorganization(blocks[1].hash(), bad_sibling.hash())
        .expect_err("known invalid");
    assert_eq!(err.rule_kind(), Some(RuleErrorKind::KnownInvalidBlock));
}

#[test]
fn forced_reorg_roundtrip_restores_state_bytes() {
    let test = new_chain(regnet_params());
    let blocks = extend_chain(&test, &test.genesis, 2, 0);
    let b2b = build_block(&blocks[0], 7);
    test.process(&b2b).expect("process sibling");

    let before = test.state_columns();
    test.chain
        .force_head_reorganization(blocks[1].hash(), b2b.hash())
        .expect("reorg away");
    test.chain
        .force_head_reorganization(b2b.hash(), blocks[1].hash())
        .expect("reorg back");

    // Connect then disconnect leaves the durable chain state byte-for-byte
    // where it started.
    assert_eq!(test.state_columns(), before);
    assert_eq!(test.chain.best_snapshot().hash, blocks[1].hash());
}

#[test]
fn duplicate_blocks_are_rejected() {
    let test = new_chain(regnet_params());
    let blocks = extend_chain(&test, &test.genesis, 1, 0);
    let err = test.process(&blocks[0]).expect_err("duplicate");
    assert!(matches!(err, ChainError::DuplicateBlock(_)));
}

#[test]
fn orphan_promotion() {
    let test = new_chain(regnet_params());
    let blocks = extend_chain(&test, &test.genesis, 3, 0);

    let b4 = build_block(&blocks[2], 0);
    let b5 = build_block(&b4, 0);

    let (_, is_orphan) = test.process(&b5).expect("process orphan");
    assert!(is_orphan);
    assert!(test.chain.is_known_orphan(&b5.hash()));
    assert!(test.chain.have_block(&b5.hash()));
    assert_eq!(test.chain.orphan_root(&b5.hash()), b5.hash());

    // A second submission of a pooled orphan whose parent is still missing
    // is a duplicate.
    let err = test.process(&b5).expect_err("duplicate orphan");
    assert!(matches!(err, ChainError::DuplicateBlock(_)));

    test.process(&b4).expect("process parent");
    assert_eq!(test.chain.best_snapshot().hash, b4.hash());

    // The caller re-submits pooled children of the accepted block.
    let children = test.chain.orphan_children(&b4.hash());
    assert_eq!(children.len(), 1);
    for child in children {
        test.chain
            .process_block(child, BehaviorFlags::NONE)
            .expect("promote orphan");
    }
    assert_eq!(test.chain.best_snapshot().hash, b5.hash());
    assert!(!test.chain.is_known_orphan(&b5.hash()));
}

#[test]
fn spends_flow_through_reorganization() {
    let test = new_chain(regnet_params());
    let b1 = extend_chain(&test, &test.genesis, 1, 0).remove(0);

    // B2 spends B1's coinbase (maturity is one block on regnet).
    let coinbase_out = OutPoint {
        hash: b1.transactions[0].txid(),
        index: 0,
    };
    let b2 = build_block_with(
        &b1,
        BlockSpec {
            txs: vec![spend_tx(coinbase_out, 40_000)],
            tag: 0,
            ..BlockSpec::default()
        },
    );
    test.process(&b2).expect("process spend block");
    let spent_gone = test
        .store
        .get(Column::Utxo, &coinbase_out.key_bytes())
        .expect("get")
        .is_none();
    assert!(spent_gone);

    // A heavier empty sibling reorganizes the spend away, restoring the
    // coinbase output from the journal.
    let b2_heavy = build_block_with(
        &b1,
        BlockSpec {
            tag: 5,
            bits: HEAVY_BITS,
            ..BlockSpec::default()
        },
    );
    test.process(&b2_heavy).expect("reorg");
    assert_eq!(test.chain.best_snapshot().hash, b2_heavy.hash());
    let restored = test
        .store
        .get(Column::Utxo, &coinbase_out.key_bytes())
        .expect("get")
        .is_some();
    assert!(restored);
    // The side block's journal entry is gone.
    assert!(test
        .store
        .get(Column::SpendJournal, &b2.hash())
        .expect("get")
        .is_none());
}
