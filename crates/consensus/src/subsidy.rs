//! Block subsidy schedule.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::params::ChainParams;

/// Full subsidy for the block at the given height, before any split between
/// work, stake, and treasury shares.
pub fn block_subsidy(height: i64, params: &ChainParams) -> i64 {
    if height <= 0 {
        return 0;
    }
    if height == 1 {
        // The premine block carries the base subsidy untouched.
        return params.base_subsidy;
    }

    let reductions = height / params.subsidy_reduction_interval;
    let mut subsidy = params.base_subsidy;
    for _ in 0..reductions {
        subsidy = subsidy * params.mul_subsidy / params.div_subsidy;
        if subsidy == 0 {
            break;
        }
    }
    subsidy
}

/// Memoizes the subsidy at each reduction-interval boundary so repeated
/// lookups near the tip avoid rerunning the whole reduction loop.
pub struct SubsidyCache {
    params: ChainParams,
    by_interval: Mutex<HashMap<i64, i64>>,
}

impl SubsidyCache {
    pub fn new(params: ChainParams) -> Self {
        Self {
            params,
            by_interval: Mutex::new(HashMap::new()),
        }
    }

    pub fn block_subsidy(&self, height: i64) -> i64 {
        if height <= 0 {
            return 0;
        }
        if height == 1 {
            return self.params.base_subsidy;
        }

        let interval = height / self.params.subsidy_reduction_interval;
        if let Ok(cache) = self.by_interval.lock() {
            if let Some(&subsidy) = cache.get(&interval) {
                return subsidy;
            }
        }

        let subsidy = block_subsidy(height, &self.params);
        if let Ok(mut cache) = self.by_interval.lock() {
            cache.insert(interval, subsidy);
        }
        subsidy
    }
}
