//! Instruction tag constants for the accrual program.
//!
//! This file is the single source of truth for instruction numbering.
//! Clients and CPI callers must use these exact values.
//!
//! Never reorder, remove, or reuse a tag number. Append new instructions at
//! the end.

pub const TAG_INIT_PROGRAM: u8 = 0;
pub const TAG_CREATE_POOL: u8 = 1;
pub const TAG_SET_REWARD_WEIGHTS: u8 = 2;
pub const TAG_SET_GLOBAL_RATE: u8 = 3;
pub const TAG_SET_FORFEIT_ADDRESS: u8 = 4;
pub const TAG_DEPOSIT: u8 = 5;
pub const TAG_EXIT: u8 = 6;
pub const TAG_GENERATE_DISTRIBUTABLE: u8 = 7;
pub const TAG_SET_ROOT: u8 = 8;
pub const TAG_CLAIM: u8 = 9;
/// Rotate the operator key. The zero key burns it.
pub const TAG_UPDATE_ADMIN: u8 = 10;

/// Tag byte of the single instruction a realizer program must accept.
pub const REALIZER_TAG_ADD_LIQUIDITY: u8 = 0;
