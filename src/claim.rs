//! Cumulative-claim tree: leaf encoding, proof verification and the
//! operator-side tree builder.
//!
//! Node hashing sorts each pair before hashing, so a proof is just the list
//! of sibling hashes from leaf to root with no left/right flags. Leaves and
//! interior nodes carry different one-byte prefixes.

use alloc::vec::Vec;
use solana_program::keccak;

const LEAF_PREFIX: [u8; 1] = [0x00];
const NODE_PREFIX: [u8; 1] = [0x01];

/// One depositor's cumulative totals for one pool in a published tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClaimLeaf {
    pub index: u64,
    pub claimant: [u8; 32],
    pub pool_id: u16,
    pub cumulative_asset: u128,
    pub cumulative_entitlement: u128,
}

impl ClaimLeaf {
    pub fn hash(&self) -> [u8; 32] {
        keccak::hashv(&[
            &LEAF_PREFIX,
            &self.index.to_le_bytes(),
            &self.claimant,
            &self.pool_id.to_le_bytes(),
            &self.cumulative_asset.to_le_bytes(),
            &self.cumulative_entitlement.to_le_bytes(),
        ])
        .to_bytes()
    }
}

pub fn hash_pair(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    keccak::hashv(&[&NODE_PREFIX, lo, hi]).to_bytes()
}

/// True if `proof` links `leaf` to `root`. An empty proof never verifies.
pub fn verify(proof: &[[u8; 32]], root: &[u8; 32], leaf: &[u8; 32]) -> bool {
    if proof.is_empty() {
        return false;
    }
    let computed = proof
        .iter()
        .fold(*leaf, |acc, sibling| hash_pair(&acc, sibling));
    computed == *root
}

/// Binary tree over leaf hashes in index order. Odd levels are padded by
/// repeating their last node, including a lone leaf, so every proof has at
/// least one element.
#[derive(Clone, Debug)]
pub struct ClaimTree {
    leaf_count: usize,
    levels: Vec<Vec<[u8; 32]>>,
}

impl ClaimTree {
    /// `None` if `leaves` is empty.
    pub fn build(leaves: &[ClaimLeaf]) -> Option<Self> {
        if leaves.is_empty() {
            return None;
        }
        let mut level: Vec<[u8; 32]> = leaves.iter().map(ClaimLeaf::hash).collect();
        let mut levels = Vec::new();
        loop {
            if level.len() % 2 == 1 {
                let last = level[level.len() - 1];
                level.push(last);
            }
            let parent: Vec<[u8; 32]> = level
                .chunks_exact(2)
                .map(|pair| hash_pair(&pair[0], &pair[1]))
                .collect();
            levels.push(level);
            if parent.len() == 1 {
                levels.push(parent);
                break;
            }
            level = parent;
        }
        Some(ClaimTree { leaf_count: leaves.len(), levels })
    }

    /// Number of leaves; never zero since `build` refuses an empty set.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.leaf_count
    }

    pub fn root(&self) -> [u8; 32] {
        self.levels[self.levels.len() - 1][0]
    }

    /// Sibling path for the leaf at `position`, or `None` if out of range.
    pub fn proof(&self, position: usize) -> Option<Vec<[u8; 32]>> {
        if position >= self.leaf_count {
            return None;
        }
        let mut idx = position;
        let mut proof = Vec::with_capacity(self.levels.len() - 1);
        for level in &self.levels[..self.levels.len() - 1] {
            proof.push(level[idx ^ 1]);
            idx /= 2;
        }
        Some(proof)
    }
}
