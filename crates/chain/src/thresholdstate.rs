//! Per-agenda deployment threshold state.
//!
//! States advance only at rule-change window boundaries. Computed states are
//! memoized per boundary-node hash, which keeps the cache structurally
//! correct across reorganizations without explicit invalidation.

use emberd_consensus::params::ConsensusDeployment;
use emberd_storage::KeyValueStore;

use crate::blockindex::NodeId;
use crate::chain::{Chain, ChainCtx};
use crate::error::ChainError;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ThresholdState {
    Defined,
    Started,
    LockedIn,
    Active,
    Failed,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ThresholdStateTuple {
    pub state: ThresholdState,
    /// The winning choice bits once the agenda locks in or fails.
    pub choice: Option<u16>,
}

impl ThresholdStateTuple {
    fn new(state: ThresholdState) -> Self {
        Self {
            state,
            choice: None,
        }
    }
}

impl<S: KeyValueStore> Chain<S> {
    /// Threshold state of the given agenda for the block AFTER the block
    /// identified by `prev_node`.
    pub(crate) fn threshold_state(
        &self,
        ctx: &mut ChainCtx,
        prev_node: Option<NodeId>,
        version: u32,
        deployment_index: usize,
        deployment: &ConsensusDeployment,
    ) -> Result<ThresholdStateTuple, ChainError> {
        let window = self.params.rule_change_activation_interval as i64;
        let Some(node) = prev_node else {
            return Ok(ThresholdStateTuple::new(ThresholdState::Defined));
        };

        // States change only at window boundaries: retreat to the final node
        // of the window containing `prev_node`.
        let height = self.index.height_of(node);
        let boundary = height - ((height + 1) % window);
        if boundary < 0 {
            return Ok(ThresholdStateTuple::new(ThresholdState::Defined));
        }
        let mut cursor = self
            .index
            .ancestor_of(node, boundary)
            .ok_or_else(|| ChainError::Assert("window boundary walk left the index".to_string()))?;

        // Walk back through boundary nodes until a cached state or the
        // agenda's defined epoch is found.
        let mut pending = Vec::new();
        let mut state = ThresholdStateTuple::new(ThresholdState::Defined);
        loop {
            let hash = self.index.hash_of(cursor);
            if let Some(cached) = ctx
                .deployment_caches
                .get(&version)
                .and_then(|caches| caches.get(deployment_index))
                .and_then(|cache| cache.get(&hash))
            {
                state = *cached;
                break;
            }

            if (self.index.median_time_of(cursor) as u64) < deployment.start_time {
                break;
            }

            pending.push(cursor);
            let cursor_height = self.index.height_of(cursor);
            if cursor_height < window {
                break;
            }
            cursor = self
                .index
                .ancestor_of(cursor, cursor_height - window)
                .ok_or_else(|| {
                    ChainError::Assert("window boundary walk left the index".to_string())
                })?;
        }

        // Replay forward, advancing the state machine one window at a time.
        while let Some(boundary_node) = pending.pop() {
            let median_time = self.index.median_time_of(boundary_node) as u64;
            state = match state.state {
                ThresholdState::Defined => {
                    if median_time >= deployment.expire_time {
                        ThresholdStateTuple::new(ThresholdState::Failed)
                    } else if median_time >= deployment.start_time {
                        ThresholdStateTuple::new(ThresholdState::Started)
                    } else {
                        state
                    }
                }
                ThresholdState::Started => {
                    if median_time >= deployment.expire_time {
                        ThresholdStateTuple::new(ThresholdState::Failed)
                    } else {
                        let (total, yes) =
                            self.tally_window_votes(boundary_node, window, deployment);
                        let quorum_met = total >= self.params.rule_change_activation_quorum as u64;
                        let threshold_met = yes
                            * self.params.rule_change_activation_divisor as u64
                            >= total * self.params.rule_change_activation_multiplier as u64;
                        if quorum_met && threshold_met && yes > 0 {
                            ThresholdStateTuple {
                                state: ThresholdState::LockedIn,
                                choice: Some(deployment.yes_choice),
                            }
                        } else {
                            state
                        }
                    }
                }
                ThresholdState::LockedIn => ThresholdStateTuple {
                    state: ThresholdState::Active,
                    choice: state.choice,
                },
                ThresholdState::Active | ThresholdState::Failed => state,
            };

            let hash = self.index.hash_of(boundary_node);
            let caches = ctx
                .deployment_caches
                .entry(version)
                .or_insert_with(Vec::new);
            while caches.len() <= deployment_index {
                caches.push(Default::default());
            }
            caches[deployment_index].insert(hash, state);
        }

        Ok(state)
    }

    /// Counts votes for the agenda across the window ending at the boundary
    /// node. Each block whose stake version matches contributes one vote.
    fn tally_window_votes(
        &self,
        boundary: NodeId,
        window: i64,
        deployment: &ConsensusDeployment,
    ) -> (u64, u64) {
        let mut total = 0u64;
        let mut yes = 0u64;
        let mut cursor = Some(boundary);
        for _ in 0..window {
            let Some(node) = cursor else { break };
            total += 1;
            let vote_bits = self.index.vote_bits_of(node);
            if vote_bits & deployment.bit_mask == deployment.yes_choice {
                yes += 1;
            }
            cursor = self.index.parent_of(node);
        }
        (total, yes)
    }

    /// Threshold state of the named agenda for the block after the given
    /// block hash.
    pub fn next_threshold_state(
        &self,
        hash: &emberd_consensus::Hash256,
        version: u32,
        agenda_id: &str,
    ) -> Result<ThresholdStateTuple, ChainError> {
        let node = self
            .index
            .lookup_node(hash)
            .ok_or(ChainError::UnknownBlock(*hash))?;
        let deployments = self
            .params
            .deployments
            .get(&version)
            .cloned()
            .ok_or_else(|| {
                ChainError::InvalidArgument(format!("stake version {version} has no agendas"))
            })?;
        let (deployment_index, deployment) = deployments
            .iter()
            .enumerate()
            .find(|(_, deployment)| deployment.id == agenda_id)
            .ok_or_else(|| {
                ChainError::InvalidArgument(format!("no agenda with id {agenda_id}"))
            })?;

        let mut ctx = self.lock_chain_write()?;
        self.threshold_state(&mut ctx, Some(node), version, deployment_index, deployment)
    }
}
