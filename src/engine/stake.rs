//! Per-(depositor, pool) entitlement ledger.

use alloc::collections::BTreeMap;

use bytemuck::{Pod, Zeroable};

use super::fixed::Fixed;
use super::pool::Pool;
use super::EngineError;

/// One depositor's position in one pool.
///
/// The record is never deleted: after an exit it keeps its claim history so
/// that old proofs cannot be replayed.
///
/// # Invariants
/// - `total_claimed_entitlement` never decreases
/// - `total_deposited` only changes right after `update` against a settled pool
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Stake {
    pub total_deposited: u128,
    pub total_entitlement_unclaimed: u128,
    pub total_claimed_asset: u128,
    pub total_claimed_entitlement: u128,
    /// Pool accumulator at the last settlement of this stake.
    pub last_seen_acc: Fixed,
    pub owner: [u8; 32],
    pub pool_id: u16,
    pub _padding: [u8; 14],
}

impl Stake {
    pub fn new(owner: [u8; 32], pool_id: u16, pool: &Pool) -> Self {
        Stake {
            owner,
            pool_id,
            last_seen_acc: pool.acc_weight_per_unit,
            ..Stake::default()
        }
    }

    /// Entitlement earned between `last_seen_acc` and `acc`.
    pub fn pending(&self, acc: Fixed) -> Result<u128, EngineError> {
        if self.total_deposited == 0 {
            return Ok(0);
        }
        Ok(acc
            .checked_sub(self.last_seen_acc)?
            .mul_int(self.total_deposited)?
            .floor())
    }

    /// Unclaimed entitlement if the stake were settled against `acc`.
    pub fn updated_unclaimed(&self, acc: Fixed) -> Result<u128, EngineError> {
        self.total_entitlement_unclaimed
            .checked_add(self.pending(acc)?)
            .ok_or(EngineError::Overflow)
    }

    /// Settle against `pool`, which must already be settled for the same
    /// timestamp.
    pub fn update(&mut self, pool: &Pool) -> Result<(), EngineError> {
        self.total_entitlement_unclaimed = self.updated_unclaimed(pool.acc_weight_per_unit)?;
        self.last_seen_acc = pool.acc_weight_per_unit;
        Ok(())
    }
}

/// Storage for stake records, keyed by `(owner, pool_id)`.
///
/// On-chain every record lives in its own program-derived account, so the
/// program hands the engine a store holding exactly the accounts the
/// instruction supplied. Asking for any other key is `StakeUnavailable`.
pub trait StakeStore {
    /// `Ok(None)` when `owner` never deposited into `pool_id`.
    fn load(&self, owner: &[u8; 32], pool_id: u16) -> Result<Option<Stake>, EngineError>;
    fn save(&mut self, stake: Stake) -> Result<(), EngineError>;
}

pub type StakeKey = ([u8; 32], u16);

impl StakeStore for BTreeMap<StakeKey, Stake> {
    fn load(&self, owner: &[u8; 32], pool_id: u16) -> Result<Option<Stake>, EngineError> {
        Ok(self.get(&(*owner, pool_id)).copied())
    }

    fn save(&mut self, stake: Stake) -> Result<(), EngineError> {
        self.insert((stake.owner, stake.pool_id), stake);
        Ok(())
    }
}
