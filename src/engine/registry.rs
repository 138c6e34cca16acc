//! Append-only pool registry and weight-mass bookkeeping.

use alloc::vec::Vec;
use bytemuck::Zeroable;

use super::pool::{GlobalContext, Pool};
use super::{EngineError, MAX_POOLS};

/// Emitted once per pool whose weight actually changed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WeightChange {
    pub pool_id: u16,
    pub old_weight: u64,
    pub new_weight: u64,
}

/// Ordered pool list. A pool's index is its permanent identity.
///
/// # Invariants
/// - `ctx.total_weight == Σ pools[..pool_count].weight`
/// - pools are never removed and `asset` is unique among them
#[repr(C)]
#[derive(Clone, Copy, Zeroable)]
pub struct PoolRegistry {
    pub ctx: GlobalContext,
    pub pool_count: u64,
    pub _padding: u64,
    pub pools: [Pool; MAX_POOLS],
}

impl PoolRegistry {
    #[inline]
    pub fn len(&self) -> usize {
        self.pool_count as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pool_count == 0
    }

    pub fn pools(&self) -> &[Pool] {
        &self.pools[..self.len()]
    }

    pub fn get(&self, pool_id: u16) -> Result<&Pool, EngineError> {
        self.pools().get(pool_id as usize).ok_or(EngineError::PoolNotFound)
    }

    pub fn find_asset(&self, asset: &[u8; 32]) -> Option<u16> {
        self.pools()
            .iter()
            .position(|p| p.asset == *asset)
            .map(|idx| idx as u16)
    }

    pub fn create(&mut self, asset: [u8; 32], now: i64) -> Result<u16, EngineError> {
        if asset == [0u8; 32] {
            return Err(EngineError::InvalidAsset);
        }
        if self.find_asset(&asset).is_some() {
            return Err(EngineError::DuplicatePool);
        }
        let idx = self.len();
        if idx >= MAX_POOLS {
            return Err(EngineError::PoolCapacity);
        }
        self.pools[idx] = Pool::new(asset, now);
        self.pool_count += 1;
        Ok(idx as u16)
    }

    /// Copy of pool `pool_id` settled to `now`. Nothing is written back.
    pub fn settled(&self, pool_id: u16, now: i64) -> Result<Pool, EngineError> {
        let mut pool = *self.get(pool_id)?;
        pool.update(&self.ctx, now)?;
        Ok(pool)
    }

    fn settled_all(&self, now: i64) -> Result<Vec<Pool>, EngineError> {
        self.pools()
            .iter()
            .map(|p| {
                let mut pool = *p;
                pool.update(&self.ctx, now)?;
                Ok(pool)
            })
            .collect()
    }

    #[inline]
    pub(crate) fn store(&mut self, pool_id: u16, pool: Pool) {
        self.pools[pool_id as usize] = pool;
    }

    fn store_all(&mut self, pools: Vec<Pool>) {
        for (idx, pool) in pools.into_iter().enumerate() {
            self.pools[idx] = pool;
        }
    }

    /// Replace every pool weight. All pools are settled under the old
    /// weights before the new weight mass takes effect.
    pub fn set_weights(&mut self, weights: &[u64], now: i64) -> Result<Vec<WeightChange>, EngineError> {
        if weights.len() != self.len() {
            return Err(EngineError::WeightCountMismatch);
        }
        let mut pools = self.settled_all(now)?;
        let mut total_weight = self.ctx.total_weight;
        let mut changes = Vec::new();
        for (idx, (pool, &new_weight)) in pools.iter_mut().zip(weights).enumerate() {
            if pool.weight == new_weight {
                continue;
            }
            total_weight = total_weight
                .checked_sub(pool.weight as u128)
                .ok_or(EngineError::Overflow)?
                .checked_add(new_weight as u128)
                .ok_or(EngineError::Overflow)?;
            changes.push(WeightChange {
                pool_id: idx as u16,
                old_weight: pool.weight,
                new_weight,
            });
            pool.weight = new_weight;
        }
        self.store_all(pools);
        self.ctx.total_weight = total_weight;
        Ok(changes)
    }

    /// Replace the global rate after settling every pool at the old rate.
    /// Returns the previous rate.
    pub fn set_global_rate(&mut self, rate: u128, now: i64) -> Result<u128, EngineError> {
        let pools = self.settled_all(now)?;
        self.store_all(pools);
        let old = self.ctx.global_rate;
        self.ctx.global_rate = rate;
        Ok(old)
    }

    pub fn weight_mass_consistent(&self) -> bool {
        let sum: u128 = self.pools().iter().map(|p| p.weight as u128).sum();
        sum == self.ctx.total_weight
    }
}
