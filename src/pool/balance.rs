//! Load-balance strategies for picking a data source among candidates

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;

use super::PhysicalDataSource;
use crate::config::BalanceType;

/// Strategy for selecting a data source from a list
pub trait LoadBalance: Send + Sync {
    /// Returns None if the list is empty
    fn select(&self, candidates: &[Arc<PhysicalDataSource>]) -> Option<Arc<PhysicalDataSource>>;
}

/// Build the strategy for a configured balance type
pub fn for_type(balance_type: BalanceType) -> Box<dyn LoadBalance> {
    match balance_type {
        BalanceType::Random => Box::new(RandomBalance),
        BalanceType::WeightedRoundRobin => Box::new(WeightedRoundRobin::default()),
        BalanceType::LeastActive => Box::new(LeastActive),
    }
}

/// Uniform random choice
#[derive(Debug, Default)]
pub struct RandomBalance;

impl LoadBalance for RandomBalance {
    fn select(&self, candidates: &[Arc<PhysicalDataSource>]) -> Option<Arc<PhysicalDataSource>> {
        if candidates.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..candidates.len());
        Some(candidates[idx].clone())
    }
}

/// Smooth weighted round-robin over `weight` of each host
#[derive(Debug, Default)]
pub struct WeightedRoundRobin {
    /// Current weight per data source name
    current: Mutex<HashMap<String, i64>>,
}

impl LoadBalance for WeightedRoundRobin {
    fn select(&self, candidates: &[Arc<PhysicalDataSource>]) -> Option<Arc<PhysicalDataSource>> {
        if candidates.is_empty() {
            return None;
        }

        let mut current = self.current.lock();
        let total: i64 = candidates.iter().map(|c| c.weight().max(1) as i64).sum();

        let mut best: Option<(usize, i64)> = None;
        for (idx, candidate) in candidates.iter().enumerate() {
            let weight = current.entry(candidate.name().to_string()).or_insert(0);
            *weight += candidate.weight().max(1) as i64;
            if best.map_or(true, |(_, w)| *weight > w) {
                best = Some((idx, *weight));
            }
        }

        let (idx, _) = best?;
        if let Some(weight) = current.get_mut(candidates[idx].name()) {
            *weight -= total;
        }
        Some(candidates[idx].clone())
    }
}

/// Fewest borrowed connections; ties broken at random
#[derive(Debug, Default)]
pub struct LeastActive;

impl LoadBalance for LeastActive {
    fn select(&self, candidates: &[Arc<PhysicalDataSource>]) -> Option<Arc<PhysicalDataSource>> {
        let least = candidates.iter().map(|c| c.active_count()).min()?;
        let tied: Vec<_> = candidates
            .iter()
            .filter(|c| c.active_count() == least)
            .cloned()
            .collect();
        RandomBalance.select(&tied)
    }
}
