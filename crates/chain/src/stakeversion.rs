//! Stake version and agenda vote queries.

use emberd_consensus::params::ConsensusDeployment;
use emberd_consensus::Hash256;
use emberd_storage::KeyValueStore;

use crate::chain::Chain;
use crate::error::ChainError;
use crate::thresholdstate::ThresholdStateTuple;

/// Condensed per-block version information, used instead of raw blocks to
/// keep version walks cheap.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StakeVersions {
    pub hash: Hash256,
    pub height: i64,
    pub block_version: i32,
    pub stake_version: u32,
    pub vote_bits: u16,
}

/// Agendas and their current states for one deployment version.
#[derive(Clone, Debug)]
pub struct VoteInfo {
    pub agendas: Vec<ConsensusDeployment>,
    pub agenda_status: Vec<ThresholdStateTuple>,
}

impl<S: KeyValueStore> Chain<S> {
    /// Walks up to `count` blocks back from the given hash collecting the
    /// version fields of each.
    pub fn stake_versions(
        &self,
        hash: &Hash256,
        count: i32,
    ) -> Result<Vec<StakeVersions>, ChainError> {
        let start = self
            .index
            .lookup_node(hash)
            .filter(|node| self.index.node_status(*node).known_valid())
            .ok_or(ChainError::UnknownBlock(*hash))?;

        if count == 0 {
            return Ok(Vec::new());
        }
        if count < 0 {
            return Err(ChainError::InvalidArgument(format!(
                "count must not be less than zero - got {count}"
            )));
        }

        let count = (count as i64).min(self.index.height_of(start) + 1);
        let mut result = Vec::with_capacity(count as usize);
        let mut cursor = Some(start);
        for _ in 0..count {
            let Some(node) = cursor else { break };
            let header = self
                .index
                .header_of(node)
                .ok_or(ChainError::Corrupt("index entry without header"))?;
            result.push(StakeVersions {
                hash: self.index.hash_of(node),
                height: self.index.height_of(node),
                block_version: header.version,
                stake_version: header.stake_version,
                vote_bits: header.vote_bits,
            });
            cursor = self.index.parent_of(node);
        }
        Ok(result)
    }

    /// Agenda information and state at the given block hash for a deployment
    /// version.
    pub fn vote_info(&self, hash: &Hash256, version: u32) -> Result<VoteInfo, ChainError> {
        let deployments = self
            .params
            .deployments
            .get(&version)
            .cloned()
            .ok_or_else(|| {
                ChainError::InvalidArgument(format!("stake version {version} has no agendas"))
            })?;
        let node = self
            .index
            .lookup_node(hash)
            .ok_or(ChainError::UnknownBlock(*hash))?;

        let mut ctx = self.lock_chain_write()?;
        let mut info = VoteInfo {
            agendas: deployments.clone(),
            agenda_status: Vec::with_capacity(deployments.len()),
        };
        for (index, deployment) in deployments.iter().enumerate() {
            let status = self.threshold_state(&mut ctx, Some(node), version, index, deployment)?;
            info.agenda_status.push(status);
        }
        Ok(info)
    }
}
