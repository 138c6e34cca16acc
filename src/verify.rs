//! Pure decision helpers shared by the processor and the Kani harnesses.
//!
//! Nothing here touches accounts; each function is one authorization or
//! bounds rule expressed over plain values.

/// Admin authorization: admin must be non-zero (not burned) and match signer.
/// Used by every operator instruction and UpdateAdmin.
#[inline]
pub fn admin_ok(admin: [u8; 32], signer: [u8; 32]) -> bool {
    admin != [0u8; 32] && admin == signer
}

/// Stored owner must match signer.
#[inline]
pub fn owner_ok(stored: [u8; 32], signer: [u8; 32]) -> bool {
    stored == signer
}

#[inline]
pub fn pda_key_matches(expected: [u8; 32], provided: [u8; 32]) -> bool {
    expected == provided
}

/// Both cumulative totals must strictly exceed what was already claimed.
#[inline]
pub fn claim_advances(
    claimed_asset: u128,
    claimed_entitlement: u128,
    cumulative_asset: u128,
    cumulative_entitlement: u128,
) -> bool {
    cumulative_asset > claimed_asset && cumulative_entitlement > claimed_entitlement
}

/// The realizer may use less than it was offered, never more.
#[inline]
pub fn realization_within_request(requested: u128, used: u128) -> bool {
    used <= requested
}

#[inline]
pub fn realization_meets_minimum(minimum: u128, used: u128) -> bool {
    used >= minimum
}

#[inline]
pub fn deadline_ok(now: i64, deadline: i64) -> bool {
    now <= deadline
}

/// Guard may be taken only when no call is in flight.
#[inline]
pub fn guard_enter_ok(entered: u8) -> bool {
    entered == 0
}

#[inline]
pub fn len_ok(actual: usize, need: usize) -> bool {
    actual >= need
}
