//! Per-pool aggregate state and the running per-unit reward accumulator.

use bytemuck::Zeroable;

use super::fixed::Fixed;
use super::EngineError;

/// Global reward parameters shared by every pool.
///
/// # Invariants
/// - `total_weight == Σ pool.weight` over all created pools
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Zeroable)]
pub struct GlobalContext {
    /// Entitlement units emitted per second across all pools.
    pub global_rate: u128,
    pub total_weight: u128,
}

/// Aggregate accounting for one deposit asset.
///
/// # Invariants
/// - `total_entitlement_realized <= total_entitlement_accrued`
/// - `acc_weight_per_unit` never decreases
/// - `asset` never changes after creation
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Zeroable)]
pub struct Pool {
    /// Principal currently locked in the pool.
    pub total_deposited: u128,
    /// Entitlement accrued to depositors and not yet settled by a claim.
    pub total_entitlement_accrued: u128,
    /// Portion of `total_entitlement_accrued` already converted into the
    /// distributable asset.
    pub total_entitlement_realized: u128,
    /// Entitlement earned by one unit of principal since pool creation.
    pub acc_weight_per_unit: Fixed,
    pub asset: [u8; 32],
    pub weight: u64,
    /// Unix seconds of the last settlement.
    pub last_update: i64,
}

impl Pool {
    pub fn new(asset: [u8; 32], now: i64) -> Self {
        Pool {
            asset,
            last_update: now,
            ..Pool::default()
        }
    }

    /// This pool's share of the global rate. Zero while no weight is set.
    pub fn reward_rate(&self, ctx: &GlobalContext) -> Result<u128, EngineError> {
        if ctx.total_weight == 0 {
            return Ok(0);
        }
        let scaled = ctx
            .global_rate
            .checked_mul(self.weight as u128)
            .ok_or(EngineError::Overflow)?;
        Ok(scaled / ctx.total_weight)
    }

    #[inline]
    fn elapsed(&self, now: i64) -> u128 {
        if now > self.last_update {
            (now - self.last_update) as u128
        } else {
            0
        }
    }

    /// Reward emitted to this pool since the last settlement.
    pub fn amount_to_distribute(&self, ctx: &GlobalContext, now: i64) -> Result<u128, EngineError> {
        let elapsed = self.elapsed(now);
        if elapsed == 0 {
            return Ok(0);
        }
        self.reward_rate(ctx)?
            .checked_mul(elapsed)
            .ok_or(EngineError::Overflow)
    }

    /// Emission that actually lands with depositors. Anything emitted while
    /// the pool is empty is dropped.
    fn accruing_amount(&self, ctx: &GlobalContext, now: i64) -> Result<u128, EngineError> {
        if self.total_deposited == 0 {
            return Ok(0);
        }
        self.amount_to_distribute(ctx, now)
    }

    /// Accumulator value as of `now`, without mutating the pool.
    pub fn updated_accumulator(&self, ctx: &GlobalContext, now: i64) -> Result<Fixed, EngineError> {
        let amount = self.accruing_amount(ctx, now)?;
        if amount == 0 {
            return Ok(self.acc_weight_per_unit);
        }
        let per_unit = Fixed::ratio(amount, self.total_deposited)?;
        self.acc_weight_per_unit.checked_add(per_unit)
    }

    /// Outstanding accrued entitlement as of `now`, without mutating the pool.
    pub fn updated_total_unclaimed(&self, ctx: &GlobalContext, now: i64) -> Result<u128, EngineError> {
        self.total_entitlement_accrued
            .checked_add(self.accruing_amount(ctx, now)?)
            .ok_or(EngineError::Overflow)
    }

    /// Settle the pool up to `now`.
    ///
    /// The timestamp advances even when nothing accrues so that an empty
    /// interval is never credited later.
    pub fn update(&mut self, ctx: &GlobalContext, now: i64) -> Result<(), EngineError> {
        let acc = self.updated_accumulator(ctx, now)?;
        let accrued = self.updated_total_unclaimed(ctx, now)?;
        self.acc_weight_per_unit = acc;
        self.total_entitlement_accrued = accrued;
        if now > self.last_update {
            self.last_update = now;
        }
        Ok(())
    }

    /// Accrued entitlement not yet handed to the realizer.
    pub fn unrealized(&self) -> Result<u128, EngineError> {
        self.total_entitlement_accrued
            .checked_sub(self.total_entitlement_realized)
            .ok_or(EngineError::Overflow)
    }
}
