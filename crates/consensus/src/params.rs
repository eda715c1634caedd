//! Per-network chain parameters.

use std::collections::HashMap;

use crate::{hash256_from_hex, Hash256};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Network {
    Mainnet,
    Testnet,
    Regnet,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regnet => "regnet",
        }
    }
}

/// A known-good block the chain must pass through at the given height.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Checkpoint {
    pub height: i64,
    pub hash: Hash256,
}

/// A single voteable consensus change, keyed by its owning stake version.
#[derive(Clone, Debug)]
pub struct ConsensusDeployment {
    /// Human readable agenda identifier.
    pub id: &'static str,
    /// Mask isolating this agenda's choice bits within the vote bits.
    pub bit_mask: u16,
    /// Vote bits value within the mask that counts as a yes vote.
    pub yes_choice: u16,
    pub start_time: u64,
    pub expire_time: u64,
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub name: &'static str,

    // Genesis block description. The chain crate materializes the actual
    // block from these fields so this crate stays free of block types.
    pub genesis_bits: u32,
    pub genesis_timestamp: u32,
    pub genesis_sbits: i64,
    pub genesis_nonce: u32,
    pub genesis_version: i32,

    /// Highest proof-of-work target allowed, in compact form.
    pub pow_limit_bits: u32,
    /// Blocks before a coinbase output may be spent.
    pub coinbase_maturity: i64,

    // Subsidy schedule.
    pub base_subsidy: i64,
    pub subsidy_reduction_interval: i64,
    pub mul_subsidy: i64,
    pub div_subsidy: i64,

    // Ticket lottery.
    pub stake_enabled_height: i64,
    pub stake_validation_height: i64,
    pub ticket_maturity: i64,
    pub tickets_per_block: u16,
    pub minimum_stake_diff: i64,

    // Version/agenda voting.
    pub stake_version_interval: i64,
    pub rule_change_activation_interval: u32,
    pub rule_change_activation_quorum: u32,
    pub rule_change_activation_multiplier: u32,
    pub rule_change_activation_divisor: u32,
    pub deployments: HashMap<u32, Vec<ConsensusDeployment>>,

    pub checkpoints: Vec<Checkpoint>,
}

impl ChainParams {
    /// Height of the highest checkpoint, or 0 when none are configured.
    pub fn latest_checkpoint_height(&self) -> i64 {
        self.checkpoints
            .iter()
            .map(|checkpoint| checkpoint.height)
            .max()
            .unwrap_or(0)
    }

    pub fn checkpoint_by_height(&self, height: i64) -> Option<&Checkpoint> {
        self.checkpoints
            .iter()
            .find(|checkpoint| checkpoint.height == height)
    }
}

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Mainnet => mainnet_params(),
        Network::Testnet => testnet_params(),
        Network::Regnet => regnet_params(),
    }
}

fn mainnet_params() -> ChainParams {
    ChainParams {
        network: Network::Mainnet,
        name: "mainnet",
        genesis_bits: 0x1d00ffff,
        genesis_timestamp: 1_454_954_400,
        genesis_sbits: 2 * 100_000_000,
        genesis_nonce: 0x18aea41a,
        genesis_version: 1,
        pow_limit_bits: 0x1d00ffff,
        coinbase_maturity: 256,
        base_subsidy: 3_119_582_664,
        subsidy_reduction_interval: 6_144,
        mul_subsidy: 100,
        div_subsidy: 101,
        stake_enabled_height: 4_096,
        stake_validation_height: 4_352,
        ticket_maturity: 256,
        tickets_per_block: 5,
        minimum_stake_diff: 2 * 100_000_000,
        stake_version_interval: 2_016,
        rule_change_activation_interval: 8_064,
        rule_change_activation_quorum: 4_032,
        rule_change_activation_multiplier: 3,
        rule_change_activation_divisor: 4,
        deployments: HashMap::new(),
        checkpoints: vec![Checkpoint {
            height: 4_096,
            hash: hash256_from_hex(
                "000000000000151e57e11061cf82cbfbc04ce0547c2544b38a4af2e187a064e0",
            )
            .unwrap_or([0u8; 32]),
        }],
    }
}

fn testnet_params() -> ChainParams {
    ChainParams {
        network: Network::Testnet,
        name: "testnet",
        genesis_bits: 0x1e00ffff,
        genesis_timestamp: 1_533_513_600,
        genesis_sbits: 20_000_000,
        genesis_nonce: 0x18aea41a,
        genesis_version: 1,
        pow_limit_bits: 0x1e00ffff,
        coinbase_maturity: 16,
        base_subsidy: 2_500_000_000,
        subsidy_reduction_interval: 2_048,
        mul_subsidy: 100,
        div_subsidy: 101,
        stake_enabled_height: 768,
        stake_validation_height: 1_024,
        ticket_maturity: 16,
        tickets_per_block: 5,
        minimum_stake_diff: 20_000_000,
        stake_version_interval: 144,
        rule_change_activation_interval: 5_040,
        rule_change_activation_quorum: 2_520,
        rule_change_activation_multiplier: 3,
        rule_change_activation_divisor: 4,
        deployments: HashMap::new(),
        checkpoints: Vec::new(),
    }
}

fn regnet_params() -> ChainParams {
    ChainParams {
        network: Network::Regnet,
        name: "regnet",
        genesis_bits: 0x207fffff,
        genesis_timestamp: 1_538_524_800,
        genesis_sbits: 20_000,
        genesis_nonce: 0,
        genesis_version: 1,
        pow_limit_bits: 0x207fffff,
        coinbase_maturity: 1,
        base_subsidy: 5_000_000_000,
        subsidy_reduction_interval: 128,
        mul_subsidy: 100,
        div_subsidy: 101,
        stake_enabled_height: 2_000,
        stake_validation_height: 2_048,
        ticket_maturity: 1,
        tickets_per_block: 5,
        minimum_stake_diff: 20_000,
        stake_version_interval: 8,
        rule_change_activation_interval: 320,
        rule_change_activation_quorum: 160,
        rule_change_activation_multiplier: 3,
        rule_change_activation_divisor: 4,
        deployments: HashMap::new(),
        checkpoints: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_checkpoint_height_empty() {
        let params = chain_params(Network::Regnet);
        assert_eq!(params.latest_checkpoint_height(), 0);
    }

    #[test]
    fn latest_checkpoint_height_mainnet() {
        let params = chain_params(Network::Mainnet);
        assert_eq!(params.latest_checkpoint_height(), 4_096);
    }
}
