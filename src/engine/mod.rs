//! Reward accrual engine.
//!
//! Pure accounting: no account handles, no token movement. The program
//! wrapper feeds it timestamps and caller identities and performs the asset
//! transfers described by the outcomes it returns.
//!
//! Every mutator starts with the same settlement prologue (`settle`): the
//! pool is brought up to `now`, then the touched stake is settled against
//! that pool. Work happens on copies; nothing is written back until every
//! check for the operation has passed, so a failed call leaves the engine
//! and the `StakeStore` untouched.
//!
//! Stake records are not part of `RewardEngine`. Each lives behind a
//! `StakeStore`, which on-chain is one account per `(owner, pool_id)`.

pub mod fixed;
pub mod pool;
pub mod registry;
pub mod stake;

use bytemuck::Zeroable;

pub use fixed::{Fixed, SCALE};
pub use pool::{GlobalContext, Pool};
pub use registry::{PoolRegistry, WeightChange};
pub use stake::{Stake, StakeKey, StakeStore};

use crate::claim::{self, ClaimLeaf};
use crate::verify;

pub const MAX_POOLS: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("arithmetic overflow")]
    Overflow,
    #[error("division by zero")]
    DivisionByZero,
    #[error("pool not found")]
    PoolNotFound,
    #[error("asset already has a pool")]
    DuplicatePool,
    #[error("pool registry is full")]
    PoolCapacity,
    #[error("invalid pool asset")]
    InvalidAsset,
    #[error("weight count does not match pool count")]
    WeightCountMismatch,
    #[error("stake not found")]
    StakeNotFound,
    #[error("stake record was not supplied")]
    StakeUnavailable,
    #[error("amount must be non-zero")]
    ZeroAmount,
    #[error("stake has no principal to exit")]
    NothingToExit,
    #[error("forfeit account cannot deposit or exit")]
    ForfeitAccount,
    #[error("forfeit account is not configured")]
    ForfeitNotConfigured,
    #[error("invalid forfeit account")]
    InvalidForfeitAccount,
    #[error("forfeit account holds principal")]
    ForfeitHasPrincipal,
    #[error("root already published")]
    DuplicateRoot,
    #[error("claims are not enabled")]
    ClaimsDisabled,
    #[error("invalid claim proof")]
    InvalidProof,
    #[error("claim does not exceed previously claimed totals")]
    ClaimNotIncreasing,
    #[error("claim exceeds unclaimed entitlement")]
    InsufficientEntitlement,
    #[error("claim exceeds realized entitlement")]
    InsufficientRealized,
    #[error("realization exceeds unrealized entitlement")]
    InsufficientUnrealized,
    #[error("realizer consumed less than the minimums")]
    SlippageExceeded,
    #[error("deadline expired")]
    DeadlineExpired,
    #[error("realizer consumed more than requested")]
    RealizerOverconsumed,
    #[error("realizer failed")]
    RealizerFailed,
}

/// Request handed to a `LiquidityRealizer`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LiquidityRequest {
    pub entitlement_qty: u128,
    pub paired_qty: u128,
    pub min_entitlement_qty: u128,
    pub min_paired_qty: u128,
    /// Unix seconds after which the realizer must refuse.
    pub deadline: i64,
}

/// What a realizer actually did with a `LiquidityRequest`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RealizedLiquidity {
    pub entitlement_used: u128,
    pub paired_used: u128,
    pub distributable_created: u128,
}

/// External venue that turns entitlement plus a paired asset into the
/// distributable asset. It may consume less than requested.
pub trait LiquidityRealizer {
    fn add_liquidity(&mut self, request: &LiquidityRequest) -> Result<RealizedLiquidity, EngineError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExitOutcome {
    /// Principal to return to the depositor.
    pub withdrawn: u128,
    /// Unclaimed entitlement moved to the forfeit account.
    pub forfeited: u128,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RealizationOutcome {
    pub entitlement_used: u128,
    pub paired_used: u128,
    /// Requested entitlement the realizer left untouched.
    pub entitlement_unused: u128,
    /// Paired input to hand back to the operator.
    pub paired_refund: u128,
    pub distributable_created: u128,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClaimOutcome {
    /// Distributable asset owed to the claimant.
    pub asset_paid: u128,
    pub entitlement_settled: u128,
}

/// Pool and stake brought up to the same timestamp, not yet committed.
#[derive(Clone, Copy, Debug)]
struct Settlement {
    pool_id: u16,
    pool: Pool,
    stake: Stake,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Open {
    Existing,
    OrCreate,
}

#[repr(C)]
#[derive(Clone, Copy, Zeroable)]
pub struct RewardEngine {
    pub registry: PoolRegistry,
    /// Receives entitlement forfeited by exits. Zero while unconfigured.
    pub forfeit: [u8; 32],
    /// Current cumulative-claim tree root.
    pub root: [u8; 32],
    /// Set by the first root publication, never cleared.
    pub claims_enabled: u8,
    pub _padding: [u8; 15],
}

impl RewardEngine {
    /// Empty engine. On-chain the slab is zero-filled instead; an all-zero
    /// engine is the same state.
    pub fn new() -> Self {
        Self::zeroed()
    }

    // ---- settlement prologue ----

    fn settle_stake_on<S: StakeStore>(
        pool_id: u16,
        pool: &Pool,
        owner: &[u8; 32],
        open: Open,
        stakes: &S,
    ) -> Result<Stake, EngineError> {
        let mut stake = match (stakes.load(owner, pool_id)?, open) {
            (Some(stake), _) => stake,
            (None, Open::OrCreate) => Stake::new(*owner, pool_id, pool),
            (None, Open::Existing) => return Err(EngineError::StakeNotFound),
        };
        stake.update(pool)?;
        Ok(stake)
    }

    fn settle<S: StakeStore>(
        &self,
        stakes: &S,
        pool_id: u16,
        owner: &[u8; 32],
        now: i64,
        open: Open,
    ) -> Result<Settlement, EngineError> {
        let pool = self.registry.settled(pool_id, now)?;
        let stake = Self::settle_stake_on(pool_id, &pool, owner, open, stakes)?;
        Ok(Settlement { pool_id, pool, stake })
    }

    /// Stake first: a store that refuses the write leaves the pool as it was.
    fn commit<S: StakeStore>(&mut self, stakes: &mut S, s: Settlement) -> Result<(), EngineError> {
        stakes.save(s.stake)?;
        self.registry.store(s.pool_id, s.pool);
        Ok(())
    }

    #[inline]
    fn is_forfeit(&self, who: &[u8; 32]) -> bool {
        self.forfeit != [0u8; 32] && self.forfeit == *who
    }

    // ---- operator ----

    pub fn create_pool(&mut self, asset: [u8; 32], now: i64) -> Result<u16, EngineError> {
        self.registry.create(asset, now)
    }

    pub fn set_reward_weights(&mut self, weights: &[u64], now: i64) -> Result<alloc::vec::Vec<WeightChange>, EngineError> {
        self.registry.set_weights(weights, now)
    }

    /// Returns the previous rate.
    pub fn set_global_rate(&mut self, rate: u128, now: i64) -> Result<u128, EngineError> {
        self.registry.set_global_rate(rate, now)
    }

    /// `stakes` must answer for `forfeit` in every pool. An address with
    /// principal in any pool is refused: once it became the forfeit account
    /// that principal could never leave.
    pub fn set_forfeit_account<S: StakeStore>(&mut self, forfeit: [u8; 32], stakes: &S) -> Result<(), EngineError> {
        if forfeit == [0u8; 32] || forfeit == self.forfeit {
            return Err(EngineError::InvalidForfeitAccount);
        }
        for pool_id in 0..self.registry.len() as u16 {
            if let Some(stake) = stakes.load(&forfeit, pool_id)? {
                if stake.total_deposited > 0 {
                    return Err(EngineError::ForfeitHasPrincipal);
                }
            }
        }
        self.forfeit = forfeit;
        Ok(())
    }

    /// Publish a new cumulative-claim root. Returns true on the publication
    /// that enabled claims.
    pub fn set_root(&mut self, root: [u8; 32]) -> Result<bool, EngineError> {
        if root == self.root {
            return Err(EngineError::DuplicateRoot);
        }
        let first = self.claims_enabled == 0;
        self.root = root;
        self.claims_enabled = 1;
        Ok(first)
    }

    /// Convert up to `request.entitlement_qty` of the pool's unrealized
    /// entitlement into the distributable asset through `realizer`.
    ///
    /// Only what the realizer actually consumed is recorded as realized.
    pub fn generate_distributable<R: LiquidityRealizer>(
        &mut self,
        pool_id: u16,
        request: LiquidityRequest,
        now: i64,
        realizer: &mut R,
    ) -> Result<RealizationOutcome, EngineError> {
        if request.entitlement_qty == 0 {
            return Err(EngineError::ZeroAmount);
        }
        if !verify::deadline_ok(now, request.deadline) {
            return Err(EngineError::DeadlineExpired);
        }
        let mut pool = self.registry.settled(pool_id, now)?;
        if request.entitlement_qty > pool.unrealized()? {
            return Err(EngineError::InsufficientUnrealized);
        }

        let got = realizer.add_liquidity(&request)?;
        if !verify::realization_within_request(request.entitlement_qty, got.entitlement_used)
            || !verify::realization_within_request(request.paired_qty, got.paired_used)
        {
            return Err(EngineError::RealizerOverconsumed);
        }
        if !verify::realization_meets_minimum(request.min_entitlement_qty, got.entitlement_used)
            || !verify::realization_meets_minimum(request.min_paired_qty, got.paired_used)
        {
            return Err(EngineError::SlippageExceeded);
        }

        pool.total_entitlement_realized = pool
            .total_entitlement_realized
            .checked_add(got.entitlement_used)
            .ok_or(EngineError::Overflow)?;
        self.registry.store(pool_id, pool);

        Ok(RealizationOutcome {
            entitlement_used: got.entitlement_used,
            paired_used: got.paired_used,
            entitlement_unused: request.entitlement_qty - got.entitlement_used,
            paired_refund: request.paired_qty - got.paired_used,
            distributable_created: got.distributable_created,
        })
    }

    // ---- depositor ----

    pub fn deposit<S: StakeStore>(
        &mut self,
        stakes: &mut S,
        caller: &[u8; 32],
        pool_id: u16,
        amount: u128,
        now: i64,
    ) -> Result<(), EngineError> {
        if self.is_forfeit(caller) {
            return Err(EngineError::ForfeitAccount);
        }
        if amount == 0 {
            return Err(EngineError::ZeroAmount);
        }
        let mut s = self.settle(stakes, pool_id, caller, now, Open::OrCreate)?;
        s.pool.total_deposited = s
            .pool
            .total_deposited
            .checked_add(amount)
            .ok_or(EngineError::Overflow)?;
        s.stake.total_deposited = s
            .stake
            .total_deposited
            .checked_add(amount)
            .ok_or(EngineError::Overflow)?;
        self.commit(stakes, s)
    }

    /// Withdraw all principal and forfeit all unclaimed entitlement.
    ///
    /// The forfeited amount is also folded into the exiting stake's claimed
    /// total so that a proof issued before the exit cannot pay it out later.
    pub fn exit<S: StakeStore>(
        &mut self,
        stakes: &mut S,
        caller: &[u8; 32],
        pool_id: u16,
        now: i64,
    ) -> Result<ExitOutcome, EngineError> {
        if self.is_forfeit(caller) {
            return Err(EngineError::ForfeitAccount);
        }
        if self.forfeit == [0u8; 32] {
            return Err(EngineError::ForfeitNotConfigured);
        }
        let mut s = self.settle(stakes, pool_id, caller, now, Open::Existing)?;
        let withdrawn = s.stake.total_deposited;
        if withdrawn == 0 {
            return Err(EngineError::NothingToExit);
        }
        s.stake.total_deposited = 0;
        s.pool.total_deposited = s
            .pool
            .total_deposited
            .checked_sub(withdrawn)
            .ok_or(EngineError::Overflow)?;

        let forfeit = self.forfeit;
        let mut forfeit_stake = Self::settle_stake_on(pool_id, &s.pool, &forfeit, Open::OrCreate, stakes)?;
        let forfeited = s.stake.total_entitlement_unclaimed;
        forfeit_stake.total_entitlement_unclaimed = forfeit_stake
            .total_entitlement_unclaimed
            .checked_add(forfeited)
            .ok_or(EngineError::Overflow)?;
        s.stake.total_claimed_entitlement = s
            .stake
            .total_claimed_entitlement
            .checked_add(forfeited)
            .ok_or(EngineError::Overflow)?;
        s.stake.total_entitlement_unclaimed = 0;

        stakes.save(forfeit_stake)?;
        self.commit(stakes, s)?;
        Ok(ExitOutcome { withdrawn, forfeited })
    }

    /// Redeem a cumulative-claim leaf. Pays only the part of the leaf's
    /// totals that exceeds what `caller` already claimed in this pool.
    pub fn claim<S: StakeStore>(
        &mut self,
        stakes: &mut S,
        caller: &[u8; 32],
        index: u64,
        pool_id: u16,
        cumulative_asset: u128,
        cumulative_entitlement: u128,
        proof: &[[u8; 32]],
        now: i64,
    ) -> Result<ClaimOutcome, EngineError> {
        if self.claims_enabled == 0 {
            return Err(EngineError::ClaimsDisabled);
        }
        self.registry.get(pool_id)?;
        let leaf = ClaimLeaf {
            index,
            claimant: *caller,
            pool_id,
            cumulative_asset,
            cumulative_entitlement,
        };
        if !claim::verify(proof, &self.root, &leaf.hash()) {
            return Err(EngineError::InvalidProof);
        }

        let mut s = self.settle(stakes, pool_id, caller, now, Open::Existing)?;
        if !verify::claim_advances(
            s.stake.total_claimed_asset,
            s.stake.total_claimed_entitlement,
            cumulative_asset,
            cumulative_entitlement,
        ) {
            return Err(EngineError::ClaimNotIncreasing);
        }
        let asset_paid = cumulative_asset - s.stake.total_claimed_asset;
        let entitlement_settled = cumulative_entitlement - s.stake.total_claimed_entitlement;
        if entitlement_settled > s.stake.total_entitlement_unclaimed {
            return Err(EngineError::InsufficientEntitlement);
        }
        if entitlement_settled > s.pool.total_entitlement_realized {
            return Err(EngineError::InsufficientRealized);
        }

        s.stake.total_claimed_asset = cumulative_asset;
        s.stake.total_claimed_entitlement = cumulative_entitlement;
        s.stake.total_entitlement_unclaimed -= entitlement_settled;
        s.pool.total_entitlement_realized -= entitlement_settled;
        s.pool.total_entitlement_accrued = s
            .pool
            .total_entitlement_accrued
            .checked_sub(entitlement_settled)
            .ok_or(EngineError::Overflow)?;
        self.commit(stakes, s)?;
        Ok(ClaimOutcome { asset_paid, entitlement_settled })
    }

    // ---- read accessors ----

    #[inline]
    pub fn pool_count(&self) -> usize {
        self.registry.len()
    }

    pub fn pool(&self, pool_id: u16) -> Result<&Pool, EngineError> {
        self.registry.get(pool_id)
    }

    #[inline]
    pub fn context(&self) -> &GlobalContext {
        &self.registry.ctx
    }

    pub fn reward_rate(&self, pool_id: u16) -> Result<u128, EngineError> {
        self.registry.get(pool_id)?.reward_rate(&self.registry.ctx)
    }

    /// Pool's outstanding entitlement as of `now`.
    pub fn updated_total_unclaimed(&self, pool_id: u16, now: i64) -> Result<u128, EngineError> {
        self.registry
            .get(pool_id)?
            .updated_total_unclaimed(&self.registry.ctx, now)
    }

    /// `stake`'s unclaimed entitlement as of `now`.
    pub fn pending_entitlement(&self, stake: &Stake, now: i64) -> Result<u128, EngineError> {
        let acc = self
            .registry
            .get(stake.pool_id)?
            .updated_accumulator(&self.registry.ctx, now)?;
        stake.updated_unclaimed(acc)
    }

    pub fn forfeit_account(&self) -> Option<[u8; 32]> {
        (self.forfeit != [0u8; 32]).then_some(self.forfeit)
    }

    #[inline]
    pub fn claims_enabled(&self) -> bool {
        self.claims_enabled != 0
    }

    /// Structural invariants over the engine and the complete set of
    /// `stakes`: weight mass matches, realized never exceeds accrued, and
    /// stake balances add up to their pool.
    pub fn check_invariants<'a, I>(&self, stakes: I) -> bool
    where
        I: IntoIterator<Item = &'a Stake> + Clone,
    {
        if !self.registry.weight_mass_consistent() {
            return false;
        }
        for (pool_id, pool) in self.registry.pools().iter().enumerate() {
            if pool.total_entitlement_realized > pool.total_entitlement_accrued {
                return false;
            }
            let mut principal: u128 = 0;
            let mut unclaimed: u128 = 0;
            for stake in stakes.clone().into_iter().filter(|s| s.pool_id as usize == pool_id) {
                principal = principal.saturating_add(stake.total_deposited);
                unclaimed = unclaimed.saturating_add(stake.total_entitlement_unclaimed);
            }
            if principal != pool.total_deposited || unclaimed > pool.total_entitlement_accrued {
                return false;
            }
        }
        true
    }
}

impl Default for RewardEngine {
    fn default() -> Self {
        Self::new()
    }
}
