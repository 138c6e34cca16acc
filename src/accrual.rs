//! Accrual: Single-file Solana program wrapping the reward accrual engine.

#![deny(unsafe_code)]

extern crate alloc;

pub mod claim;
pub mod engine;
pub mod tags;
pub mod verify;

// 1. mod constants
pub mod constants {
    use core::mem::{align_of, size_of};
    use crate::engine::{RewardEngine, Stake};
    use crate::state::{ProgramConfig, StakeHeader};

    pub const MAGIC: u64 = 0x4143_4352_5541_4c31; // "ACCRUAL1"
    pub const VERSION: u32 = 1;

    pub const HEADER_LEN: usize = 64;
    pub const CONFIG_LEN: usize = size_of::<ProgramConfig>();
    pub const ENGINE_ALIGN: usize = align_of::<RewardEngine>();

    pub const fn align_up(x: usize, a: usize) -> usize {
        (x + (a - 1)) & !(a - 1)
    }

    pub const ENGINE_OFF: usize = align_up(HEADER_LEN + CONFIG_LEN, ENGINE_ALIGN);
    pub const ENGINE_LEN: usize = size_of::<RewardEngine>();
    pub const SLAB_LEN: usize = ENGINE_OFF + ENGINE_LEN;

    /// Deepest proof accepted by Claim; covers 2^32 leaves.
    pub const MAX_PROOF_LEN: usize = 32;

    pub const STAKE_MAGIC: u64 = 0x4143_4352_5354_4b31; // "ACCRSTK1"
    pub const STAKE_HEADER_LEN: usize = size_of::<StakeHeader>();
    pub const STAKE_ACCOUNT_LEN: usize = STAKE_HEADER_LEN + size_of::<Stake>();
}

// 2. mod zc (Zero-Copy unsafe island)
#[allow(unsafe_code)]
pub mod zc {
    use solana_program::program_error::ProgramError;
    use crate::constants::{ENGINE_ALIGN, ENGINE_LEN, ENGINE_OFF};
    use crate::engine::RewardEngine;

    // Sound because every RewardEngine field is an integer or byte array, so
    // any byte pattern is a valid engine.
    #[inline]
    pub fn engine_ref(data: &[u8]) -> Result<&RewardEngine, ProgramError> {
        if data.len() < ENGINE_OFF + ENGINE_LEN {
            return Err(ProgramError::InvalidAccountData);
        }
        let ptr = unsafe { data.as_ptr().add(ENGINE_OFF) };
        if (ptr as usize) % ENGINE_ALIGN != 0 {
            return Err(ProgramError::InvalidAccountData);
        }
        Ok(unsafe { &*(ptr as *const RewardEngine) })
    }

    #[inline]
    pub fn engine_mut(data: &mut [u8]) -> Result<&mut RewardEngine, ProgramError> {
        if data.len() < ENGINE_OFF + ENGINE_LEN {
            return Err(ProgramError::InvalidAccountData);
        }
        let ptr = unsafe { data.as_mut_ptr().add(ENGINE_OFF) };
        if (ptr as usize) % ENGINE_ALIGN != 0 {
            return Err(ProgramError::InvalidAccountData);
        }
        Ok(unsafe { &mut *(ptr as *mut RewardEngine) })
    }
}

// 3. mod error
pub mod error {
    use num_derive::FromPrimitive;
    use num_traits::FromPrimitive;
    use solana_program::program_error::ProgramError;
    use crate::engine::EngineError;

    #[derive(Clone, Copy, Debug, Eq, PartialEq, FromPrimitive)]
    pub enum AccrualError {
        NotInitialized,
        AlreadyInitialized,
        InvalidVersion,
        InvalidSlabLen,
        InvalidVault,
        InvalidMint,
        ExpectedSigner,
        ExpectedWritable,
        Unauthorized,
        Reentrancy,
        InvalidRealizer,
        InvalidProofLength,
        InvalidStakeAccount,
        // Engine errors mapped:
        EngineOverflow,
        EngineDivisionByZero,
        EnginePoolNotFound,
        EngineDuplicatePool,
        EnginePoolCapacity,
        EngineInvalidAsset,
        EngineWeightCountMismatch,
        EngineStakeNotFound,
        EngineStakeUnavailable,
        EngineZeroAmount,
        EngineNothingToExit,
        EngineForfeitAccount,
        EngineForfeitNotConfigured,
        EngineInvalidForfeitAccount,
        EngineForfeitHasPrincipal,
        EngineDuplicateRoot,
        EngineClaimsDisabled,
        EngineInvalidProof,
        EngineClaimNotIncreasing,
        EngineInsufficientEntitlement,
        EngineInsufficientRealized,
        EngineInsufficientUnrealized,
        EngineSlippageExceeded,
        EngineDeadlineExpired,
        EngineRealizerOverconsumed,
        EngineRealizerFailed,
    }

    impl From<AccrualError> for ProgramError {
        fn from(e: AccrualError) -> Self {
            ProgramError::Custom(e as u32)
        }
    }

    /// Client-side decoding of a `ProgramError::Custom` code.
    pub fn decode_custom(code: u32) -> Option<AccrualError> {
        AccrualError::from_u32(code)
    }

    pub fn map_engine_error(e: EngineError) -> ProgramError {
        let err = match e {
            EngineError::Overflow => AccrualError::EngineOverflow,
            EngineError::DivisionByZero => AccrualError::EngineDivisionByZero,
            EngineError::PoolNotFound => AccrualError::EnginePoolNotFound,
            EngineError::DuplicatePool => AccrualError::EngineDuplicatePool,
            EngineError::PoolCapacity => AccrualError::EnginePoolCapacity,
            EngineError::InvalidAsset => AccrualError::EngineInvalidAsset,
            EngineError::WeightCountMismatch => AccrualError::EngineWeightCountMismatch,
            EngineError::StakeNotFound => AccrualError::EngineStakeNotFound,
            EngineError::StakeUnavailable => AccrualError::EngineStakeUnavailable,
            EngineError::ZeroAmount => AccrualError::EngineZeroAmount,
            EngineError::NothingToExit => AccrualError::EngineNothingToExit,
            EngineError::ForfeitAccount => AccrualError::EngineForfeitAccount,
            EngineError::ForfeitNotConfigured => AccrualError::EngineForfeitNotConfigured,
            EngineError::InvalidForfeitAccount => AccrualError::EngineInvalidForfeitAccount,
            EngineError::ForfeitHasPrincipal => AccrualError::EngineForfeitHasPrincipal,
            EngineError::DuplicateRoot => AccrualError::EngineDuplicateRoot,
            EngineError::ClaimsDisabled => AccrualError::EngineClaimsDisabled,
            EngineError::InvalidProof => AccrualError::EngineInvalidProof,
            EngineError::ClaimNotIncreasing => AccrualError::EngineClaimNotIncreasing,
            EngineError::InsufficientEntitlement => AccrualError::EngineInsufficientEntitlement,
            EngineError::InsufficientRealized => AccrualError::EngineInsufficientRealized,
            EngineError::InsufficientUnrealized => AccrualError::EngineInsufficientUnrealized,
            EngineError::SlippageExceeded => AccrualError::EngineSlippageExceeded,
            EngineError::DeadlineExpired => AccrualError::EngineDeadlineExpired,
            EngineError::RealizerOverconsumed => AccrualError::EngineRealizerOverconsumed,
            EngineError::RealizerFailed => AccrualError::EngineRealizerFailed,
        };
        ProgramError::Custom(err as u32)
    }
}

// 4. mod ix
pub mod ix {
    use alloc::vec::Vec;
    use solana_program::{program_error::ProgramError, pubkey::Pubkey};
    use crate::constants::MAX_PROOF_LEN;
    use crate::error::AccrualError;
    use crate::tags::*;

    #[derive(Debug, PartialEq, Eq)]
    pub enum Instruction {
        /// Accounts: [admin (s), slab (w), reward_mint, paired_mint, distributable_mint]
        InitProgram { realizer_program: Pubkey },
        /// Accounts: [admin (s), slab (w), asset_mint, clock]
        CreatePool,
        /// Accounts: [admin (s), slab (w), clock]
        SetRewardWeights { weights: Vec<u64> },
        /// Accounts: [admin (s), slab (w), clock]
        SetGlobalRate { rate: u64 },
        /// Accounts: [admin (s), slab (w), ...forfeit stake for every pool in id order]
        SetForfeitAddress { forfeit: Pubkey },
        /// Accounts: [user (s, w), slab (w), user_ata (w), pool_vault (w), user_stake (w),
        /// token_program, system_program, clock]
        Deposit { pool_id: u16, amount: u64 },
        /// Accounts: [user (s, w), slab (w), pool_vault (w), user_ata (w), vault_pda,
        /// user_stake (w), forfeit_stake (w), token_program, system_program, clock]
        Exit { pool_id: u16 },
        /// Accounts: [admin (s), slab (w), admin_paired_ata (w), reward_mint (w),
        /// reward_vault (w), paired_vault (w), distributable_vault (w), vault_pda,
        /// realizer_pda, token_program, realizer_program, clock, ...passthrough]
        ///
        /// `reward_vault` and `paired_vault` are staging vaults owned by
        /// `realizer_pda`, the only authority the realizer is handed.
        GenerateDistributable {
            pool_id: u16,
            entitlement_qty: u64,
            paired_qty: u64,
            min_entitlement_qty: u64,
            min_paired_qty: u64,
            deadline: i64,
        },
        /// Accounts: [admin (s), slab (w)]
        SetRoot { root: [u8; 32] },
        /// Accounts: [claimant (s), slab (w), distributable_vault (w), claimant_ata (w),
        /// vault_pda, claimant_stake (w), token_program, clock]
        Claim {
            index: u64,
            pool_id: u16,
            cumulative_asset: u64,
            cumulative_entitlement: u64,
            proof: Vec<[u8; 32]>,
        },
        /// Accounts: [admin (s), slab (w)]
        UpdateAdmin { new_admin: Pubkey },
    }

    impl Instruction {
        pub fn decode(input: &[u8]) -> Result<Self, ProgramError> {
            let (&tag, mut rest) = input.split_first().ok_or(ProgramError::InvalidInstructionData)?;

            match tag {
                TAG_INIT_PROGRAM => {
                    let realizer_program = read_pubkey(&mut rest)?;
                    Ok(Instruction::InitProgram { realizer_program })
                }
                TAG_CREATE_POOL => Ok(Instruction::CreatePool),
                TAG_SET_REWARD_WEIGHTS => {
                    let count = read_u16(&mut rest)? as usize;
                    let mut weights = Vec::with_capacity(count);
                    for _ in 0..count {
                        weights.push(read_u64(&mut rest)?);
                    }
                    Ok(Instruction::SetRewardWeights { weights })
                }
                TAG_SET_GLOBAL_RATE => {
                    let rate = read_u64(&mut rest)?;
                    Ok(Instruction::SetGlobalRate { rate })
                }
                TAG_SET_FORFEIT_ADDRESS => {
                    let forfeit = read_pubkey(&mut rest)?;
                    Ok(Instruction::SetForfeitAddress { forfeit })
                }
                TAG_DEPOSIT => {
                    let pool_id = read_u16(&mut rest)?;
                    let amount = read_u64(&mut rest)?;
                    Ok(Instruction::Deposit { pool_id, amount })
                }
                TAG_EXIT => {
                    let pool_id = read_u16(&mut rest)?;
                    Ok(Instruction::Exit { pool_id })
                }
                TAG_GENERATE_DISTRIBUTABLE => {
                    let pool_id = read_u16(&mut rest)?;
                    let entitlement_qty = read_u64(&mut rest)?;
                    let paired_qty = read_u64(&mut rest)?;
                    let min_entitlement_qty = read_u64(&mut rest)?;
                    let min_paired_qty = read_u64(&mut rest)?;
                    let deadline = read_i64(&mut rest)?;
                    Ok(Instruction::GenerateDistributable {
                        pool_id,
                        entitlement_qty,
                        paired_qty,
                        min_entitlement_qty,
                        min_paired_qty,
                        deadline,
                    })
                }
                TAG_SET_ROOT => {
                    let root = read_bytes32(&mut rest)?;
                    Ok(Instruction::SetRoot { root })
                }
                TAG_CLAIM => {
                    let index = read_u64(&mut rest)?;
                    let pool_id = read_u16(&mut rest)?;
                    let cumulative_asset = read_u64(&mut rest)?;
                    let cumulative_entitlement = read_u64(&mut rest)?;
                    let proof_len = read_u8(&mut rest)? as usize;
                    if proof_len > MAX_PROOF_LEN {
                        return Err(AccrualError::InvalidProofLength.into());
                    }
                    let mut proof = Vec::with_capacity(proof_len);
                    for _ in 0..proof_len {
                        proof.push(read_bytes32(&mut rest)?);
                    }
                    Ok(Instruction::Claim { index, pool_id, cumulative_asset, cumulative_entitlement, proof })
                }
                TAG_UPDATE_ADMIN => {
                    let new_admin = read_pubkey(&mut rest)?;
                    Ok(Instruction::UpdateAdmin { new_admin })
                }
                _ => Err(ProgramError::InvalidInstructionData),
            }
        }
    }

    fn take<'a>(input: &mut &'a [u8], n: usize) -> Result<&'a [u8], ProgramError> {
        if input.len() < n {
            return Err(ProgramError::InvalidInstructionData);
        }
        let (bytes, rest) = input.split_at(n);
        *input = rest;
        Ok(bytes)
    }

    fn read_array<const N: usize>(input: &mut &[u8]) -> Result<[u8; N], ProgramError> {
        take(input, N)?
            .try_into()
            .map_err(|_| ProgramError::InvalidInstructionData)
    }

    fn read_u8(input: &mut &[u8]) -> Result<u8, ProgramError> {
        let (&val, rest) = input.split_first().ok_or(ProgramError::InvalidInstructionData)?;
        *input = rest;
        Ok(val)
    }

    fn read_u16(input: &mut &[u8]) -> Result<u16, ProgramError> {
        read_array(input).map(u16::from_le_bytes)
    }

    fn read_u64(input: &mut &[u8]) -> Result<u64, ProgramError> {
        read_array(input).map(u64::from_le_bytes)
    }

    fn read_i64(input: &mut &[u8]) -> Result<i64, ProgramError> {
        read_array(input).map(i64::from_le_bytes)
    }

    fn read_bytes32(input: &mut &[u8]) -> Result<[u8; 32], ProgramError> {
        read_array(input)
    }

    fn read_pubkey(input: &mut &[u8]) -> Result<Pubkey, ProgramError> {
        read_bytes32(input).map(Pubkey::new_from_array)
    }
}

// 5. mod accounts
pub mod accounts {
    use solana_program::{account_info::AccountInfo, program_error::ProgramError, pubkey::Pubkey};
    use crate::error::AccrualError;
    use crate::verify;

    pub fn expect_len(accounts: &[AccountInfo], n: usize) -> Result<(), ProgramError> {
        if !verify::len_ok(accounts.len(), n) {
            return Err(ProgramError::NotEnoughAccountKeys);
        }
        Ok(())
    }

    pub fn expect_signer(ai: &AccountInfo) -> Result<(), ProgramError> {
        if !ai.is_signer {
            return Err(AccrualError::ExpectedSigner.into());
        }
        Ok(())
    }

    pub fn expect_writable(ai: &AccountInfo) -> Result<(), ProgramError> {
        if !ai.is_writable {
            return Err(AccrualError::ExpectedWritable.into());
        }
        Ok(())
    }

    pub fn expect_owner(ai: &AccountInfo, owner: &Pubkey) -> Result<(), ProgramError> {
        if ai.owner != owner {
            return Err(ProgramError::IllegalOwner);
        }
        Ok(())
    }

    pub fn expect_key(ai: &AccountInfo, expected: &Pubkey) -> Result<(), ProgramError> {
        if !verify::pda_key_matches(expected.to_bytes(), ai.key.to_bytes()) {
            return Err(ProgramError::InvalidArgument);
        }
        Ok(())
    }

    /// Owns the principal, distributable vaults and the reward mint.
    pub fn derive_vault_authority(program_id: &Pubkey, slab_key: &Pubkey) -> (Pubkey, u8) {
        Pubkey::find_program_address(&[b"vault", slab_key.as_ref()], program_id)
    }

    /// Owns only the staging vaults that feed the realizer.
    pub fn derive_realizer_authority(program_id: &Pubkey, slab_key: &Pubkey) -> (Pubkey, u8) {
        Pubkey::find_program_address(&[b"realizer", slab_key.as_ref()], program_id)
    }

    pub fn derive_stake_address(program_id: &Pubkey, slab_key: &Pubkey, pool_id: u16, owner: &Pubkey) -> (Pubkey, u8) {
        Pubkey::find_program_address(
            &[b"stake", slab_key.as_ref(), &pool_id.to_le_bytes(), owner.as_ref()],
            program_id,
        )
    }
}

// 6. mod state
pub mod state {
    use bytemuck::{Pod, Zeroable};
    use core::cell::RefMut;
    use solana_program::account_info::AccountInfo;
    use solana_program::program_error::ProgramError;
    use crate::constants::{CONFIG_LEN, HEADER_LEN, STAKE_ACCOUNT_LEN, STAKE_HEADER_LEN};
    use crate::engine::Stake;

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct SlabHeader {
        pub magic: u64,
        pub version: u32,
        pub bump: u8,
        /// Non-zero while a guarded instruction is in flight.
        pub entered: u8,
        pub _padding: [u8; 2],
        /// Operator key. All zeros once burned.
        pub admin: [u8; 32],
        pub _reserved: [u8; 16],
    }

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct ProgramConfig {
        /// Entitlement mint; its mint authority is the vault PDA.
        pub reward_mint: [u8; 32],
        /// Asset paired with entitlement when realizing.
        pub paired_mint: [u8; 32],
        /// Asset paid out by claims.
        pub distributable_mint: [u8; 32],
        pub realizer_program: [u8; 32],
        pub vault_authority_bump: u8,
        pub realizer_authority_bump: u8,
        pub _padding: [u8; 6],
    }

    /// Prefix of a stake account; the `Stake` record follows it. A zero
    /// magic marks an allocated but unused account.
    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct StakeHeader {
        pub magic: u64,
        pub version: u32,
        pub bump: u8,
        pub _padding: [u8; 3],
    }

    pub fn slab_data_mut<'a, 'b>(ai: &'b AccountInfo<'a>) -> Result<RefMut<'b, &'a mut [u8]>, ProgramError> {
        Ok(ai.try_borrow_mut_data()?)
    }

    pub fn read_header(data: &[u8]) -> SlabHeader {
        let mut h = SlabHeader::zeroed();
        let src = &data[..HEADER_LEN];
        let dst = bytemuck::bytes_of_mut(&mut h);
        dst.copy_from_slice(src);
        h
    }

    pub fn write_header(data: &mut [u8], h: &SlabHeader) {
        let src = bytemuck::bytes_of(h);
        let dst = &mut data[..HEADER_LEN];
        dst.copy_from_slice(src);
    }

    pub fn read_config(data: &[u8]) -> ProgramConfig {
        let mut c = ProgramConfig::zeroed();
        let src = &data[HEADER_LEN..HEADER_LEN + CONFIG_LEN];
        let dst = bytemuck::bytes_of_mut(&mut c);
        dst.copy_from_slice(src);
        c
    }

    pub fn write_config(data: &mut [u8], c: &ProgramConfig) {
        let src = bytemuck::bytes_of(c);
        let dst = &mut data[HEADER_LEN..HEADER_LEN + CONFIG_LEN];
        dst.copy_from_slice(src);
    }

    pub fn read_stake_header(data: &[u8]) -> StakeHeader {
        bytemuck::pod_read_unaligned(&data[..STAKE_HEADER_LEN])
    }

    pub fn read_stake(data: &[u8]) -> Stake {
        bytemuck::pod_read_unaligned(&data[STAKE_HEADER_LEN..STAKE_ACCOUNT_LEN])
    }

    pub fn write_stake(data: &mut [u8], h: &StakeHeader, stake: &Stake) {
        data[..STAKE_HEADER_LEN].copy_from_slice(bytemuck::bytes_of(h));
        data[STAKE_HEADER_LEN..STAKE_ACCOUNT_LEN].copy_from_slice(bytemuck::bytes_of(stake));
    }
}

// 7. mod vault (SPL token movement)
pub mod vault {
    use solana_program::{account_info::AccountInfo, program_error::ProgramError, program_pack::Pack};
    use spl_token::state::Account as TokenAccount;

    #[cfg(not(test))]
    use solana_program::program::{invoke, invoke_signed};

    pub fn balance(ai: &AccountInfo) -> Result<u64, ProgramError> {
        let data = ai.try_borrow_data()?;
        Ok(TokenAccount::unpack(&data)?.amount)
    }

    #[cfg(test)]
    fn adjust(ai: &AccountInfo, credit: bool, amount: u64) -> Result<(), ProgramError> {
        let mut data = ai.try_borrow_mut_data()?;
        let mut state = TokenAccount::unpack(&data)?;
        state.amount = if credit {
            state.amount.checked_add(amount).ok_or(ProgramError::InvalidAccountData)?
        } else {
            state.amount.checked_sub(amount).ok_or(ProgramError::InsufficientFunds)?
        };
        TokenAccount::pack(state, &mut data)?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn credit(ai: &AccountInfo, amount: u64) -> Result<(), ProgramError> {
        adjust(ai, true, amount)
    }

    #[cfg(test)]
    pub(crate) fn debit(ai: &AccountInfo, amount: u64) -> Result<(), ProgramError> {
        adjust(ai, false, amount)
    }

    /// Transfer signed by the owner of `source`.
    pub fn deposit<'a>(
        _token_program: &AccountInfo<'a>,
        source: &AccountInfo<'a>,
        dest: &AccountInfo<'a>,
        _authority: &AccountInfo<'a>,
        amount: u64,
    ) -> Result<(), ProgramError> {
        #[cfg(not(test))]
        {
            let ix = spl_token::instruction::transfer(
                _token_program.key,
                source.key,
                dest.key,
                _authority.key,
                &[],
                amount,
            )?;
            invoke(&ix, &[source.clone(), dest.clone(), _authority.clone(), _token_program.clone()])
        }
        #[cfg(test)]
        {
            debit(source, amount)?;
            credit(dest, amount)
        }
    }

    /// Transfer out of a vault, signed by the vault PDA.
    pub fn withdraw<'a>(
        _token_program: &AccountInfo<'a>,
        source: &AccountInfo<'a>,
        dest: &AccountInfo<'a>,
        _authority: &AccountInfo<'a>,
        amount: u64,
        _signer_seeds: &[&[&[u8]]],
    ) -> Result<(), ProgramError> {
        #[cfg(not(test))]
        {
            let ix = spl_token::instruction::transfer(
                _token_program.key,
                source.key,
                dest.key,
                _authority.key,
                &[],
                amount,
            )?;
            invoke_signed(&ix, &[source.clone(), dest.clone(), _authority.clone(), _token_program.clone()], _signer_seeds)
        }
        #[cfg(test)]
        {
            debit(source, amount)?;
            credit(dest, amount)
        }
    }

    pub fn mint_to<'a>(
        _token_program: &AccountInfo<'a>,
        _mint: &AccountInfo<'a>,
        dest: &AccountInfo<'a>,
        _authority: &AccountInfo<'a>,
        amount: u64,
        _signer_seeds: &[&[&[u8]]],
    ) -> Result<(), ProgramError> {
        #[cfg(not(test))]
        {
            let ix = spl_token::instruction::mint_to(
                _token_program.key,
                _mint.key,
                dest.key,
                _authority.key,
                &[],
                amount,
            )?;
            invoke_signed(&ix, &[_mint.clone(), dest.clone(), _authority.clone(), _token_program.clone()], _signer_seeds)
        }
        #[cfg(test)]
        {
            credit(dest, amount)
        }
    }

    pub fn burn<'a>(
        _token_program: &AccountInfo<'a>,
        source: &AccountInfo<'a>,
        _mint: &AccountInfo<'a>,
        _authority: &AccountInfo<'a>,
        amount: u64,
        _signer_seeds: &[&[&[u8]]],
    ) -> Result<(), ProgramError> {
        #[cfg(not(test))]
        {
            let ix = spl_token::instruction::burn(
                _token_program.key,
                source.key,
                _mint.key,
                _authority.key,
                &[],
                amount,
            )?;
            invoke_signed(&ix, &[source.clone(), _mint.clone(), _authority.clone(), _token_program.clone()], _signer_seeds)
        }
        #[cfg(test)]
        {
            debit(source, amount)
        }
    }
}

// 8. mod realizer (liquidity venue CPI)
pub mod realizer {
    use alloc::vec::Vec;
    use solana_program::{
        account_info::AccountInfo,
        instruction::{AccountMeta, Instruction as SolInstruction},
        program_error::ProgramError,
        pubkey::Pubkey,
    };

    #[cfg(not(test))]
    use solana_program::program::invoke_signed;

    /// Wire arguments of the realizer's add-liquidity instruction.
    #[derive(Clone, Copy, Debug)]
    pub struct AddLiquidity {
        pub entitlement_qty: u64,
        pub paired_qty: u64,
        pub min_entitlement_qty: u64,
        pub min_paired_qty: u64,
        pub deadline: i64,
    }

    pub const ADD_LIQUIDITY_DATA_LEN: usize = 41;

    impl AddLiquidity {
        pub fn encode(&self) -> [u8; ADD_LIQUIDITY_DATA_LEN] {
            let mut out = [0u8; ADD_LIQUIDITY_DATA_LEN];
            out[0] = crate::tags::REALIZER_TAG_ADD_LIQUIDITY;
            out[1..9].copy_from_slice(&self.entitlement_qty.to_le_bytes());
            out[9..17].copy_from_slice(&self.paired_qty.to_le_bytes());
            out[17..25].copy_from_slice(&self.min_entitlement_qty.to_le_bytes());
            out[25..33].copy_from_slice(&self.min_paired_qty.to_le_bytes());
            out[33..41].copy_from_slice(&self.deadline.to_le_bytes());
            out
        }
    }

    /// Add-liquidity instruction as handed to the realizer. `authority` is
    /// the only signer the program adds; passthrough accounts keep the
    /// flags they arrived with.
    #[allow(clippy::too_many_arguments)]
    pub fn add_liquidity_instruction(
        program: &Pubkey,
        authority: &Pubkey,
        reward_vault: &Pubkey,
        paired_vault: &Pubkey,
        distributable_vault: &Pubkey,
        token_program: &Pubkey,
        passthrough: &[AccountInfo],
        args: &AddLiquidity,
    ) -> SolInstruction {
        let mut metas: Vec<AccountMeta> = Vec::with_capacity(5 + passthrough.len());
        metas.push(AccountMeta::new_readonly(*authority, true));
        metas.push(AccountMeta::new(*reward_vault, false));
        metas.push(AccountMeta::new(*paired_vault, false));
        metas.push(AccountMeta::new(*distributable_vault, false));
        metas.push(AccountMeta::new_readonly(*token_program, false));
        for acc in passthrough {
            metas.push(if acc.is_writable {
                AccountMeta::new(*acc.key, acc.is_signer)
            } else {
                AccountMeta::new_readonly(*acc.key, acc.is_signer)
            });
        }
        SolInstruction {
            program_id: *program,
            accounts: metas,
            data: args.encode().to_vec(),
        }
    }

    /// Hand the staged vault balances to the realizer program, signed by the
    /// realizer authority. Results are read back from vault balances by the
    /// caller.
    #[allow(clippy::too_many_arguments)]
    pub fn add_liquidity<'a>(
        _program: &AccountInfo<'a>,
        authority: &AccountInfo<'a>,
        reward_vault: &AccountInfo<'a>,
        paired_vault: &AccountInfo<'a>,
        distributable_vault: &AccountInfo<'a>,
        _token_program: &AccountInfo<'a>,
        _passthrough: &[AccountInfo<'a>],
        args: &AddLiquidity,
        _signer_seeds: &[&[&[u8]]],
    ) -> Result<(), ProgramError> {
        #[cfg(not(test))]
        {
            let ix = add_liquidity_instruction(
                _program.key,
                authority.key,
                reward_vault.key,
                paired_vault.key,
                distributable_vault.key,
                _token_program.key,
                _passthrough,
                args,
            );

            let mut cpi_infos: Vec<AccountInfo> = Vec::with_capacity(6 + _passthrough.len());
            cpi_infos.push(authority.clone());
            cpi_infos.push(reward_vault.clone());
            cpi_infos.push(paired_vault.clone());
            cpi_infos.push(distributable_vault.clone());
            cpi_infos.push(_token_program.clone());
            cpi_infos.extend(_passthrough.iter().cloned());
            cpi_infos.push(_program.clone());

            invoke_signed(&ix, &cpi_infos, _signer_seeds)
        }
        #[cfg(test)]
        {
            // Simulated venue: can only move what `authority` owns. Takes
            // all entitlement and 95% of the paired side, mints one
            // distributable unit per unit consumed.
            use crate::vault;
            use solana_program::program_pack::Pack;
            use spl_token::state::Account as TokenAccount;
            for staged in [reward_vault, paired_vault] {
                let owner = TokenAccount::unpack(&staged.try_borrow_data()?)?.owner;
                if owner != *authority.key {
                    return Err(ProgramError::MissingRequiredSignature);
                }
            }
            let paired_used = args.paired_qty - args.paired_qty / 20;
            vault::debit(reward_vault, args.entitlement_qty)?;
            vault::debit(paired_vault, paired_used)?;
            vault::credit(distributable_vault, args.entitlement_qty + paired_used)
        }
    }
}

// 9. mod processor
pub mod processor {
    use alloc::vec::Vec;
    use solana_program::{
        account_info::AccountInfo,
        entrypoint::ProgramResult,
        msg,
        program_error::ProgramError,
        program_option::COption,
        program_pack::Pack,
        pubkey::Pubkey,
        system_program,
        sysvar::{clock::Clock, Sysvar},
    };
    use crate::{
        accounts,
        constants::{MAGIC, SLAB_LEN, STAKE_ACCOUNT_LEN, STAKE_MAGIC, VERSION},
        engine::{EngineError, LiquidityRealizer, LiquidityRequest, RealizedLiquidity, Stake, StakeStore},
        error::{map_engine_error, AccrualError},
        ix::Instruction,
        realizer,
        state::{self, ProgramConfig, SlabHeader, StakeHeader},
        vault, verify, zc,
    };

    #[cfg(not(test))]
    use solana_program::{program::invoke_signed, rent::Rent, system_instruction};

    /// Realizer backed by a CPI. Stages entitlement and paired input in the
    /// staging vaults, calls the venue, then measures what it actually took.
    ///
    /// The venue is signed for with the realizer authority only; the vault
    /// authority signs nothing but the mint into staging.
    struct CpiRealizer<'a, 'b> {
        operator: &'b AccountInfo<'a>,
        operator_paired: &'b AccountInfo<'a>,
        reward_mint: &'b AccountInfo<'a>,
        reward_vault: &'b AccountInfo<'a>,
        paired_vault: &'b AccountInfo<'a>,
        distributable_vault: &'b AccountInfo<'a>,
        vault_pda: &'b AccountInfo<'a>,
        realizer_pda: &'b AccountInfo<'a>,
        token_program: &'b AccountInfo<'a>,
        program: &'b AccountInfo<'a>,
        passthrough: &'b [AccountInfo<'a>],
        vault_seeds: &'b [&'b [&'b [u8]]],
        realizer_seeds: &'b [&'b [&'b [u8]]],
        failure: Option<ProgramError>,
    }

    impl<'a, 'b> CpiRealizer<'a, 'b> {
        fn run(&self, request: &LiquidityRequest) -> Result<RealizedLiquidity, ProgramError> {
            let args = realizer::AddLiquidity {
                entitlement_qty: to_u64(request.entitlement_qty)?,
                paired_qty: to_u64(request.paired_qty)?,
                min_entitlement_qty: to_u64(request.min_entitlement_qty)?,
                min_paired_qty: to_u64(request.min_paired_qty)?,
                deadline: request.deadline,
            };

            vault::mint_to(
                self.token_program,
                self.reward_mint,
                self.reward_vault,
                self.vault_pda,
                args.entitlement_qty,
                self.vault_seeds,
            )?;
            vault::deposit(self.token_program, self.operator_paired, self.paired_vault, self.operator, args.paired_qty)?;

            let reward_before = vault::balance(self.reward_vault)?;
            let paired_before = vault::balance(self.paired_vault)?;
            let dist_before = vault::balance(self.distributable_vault)?;

            realizer::add_liquidity(
                self.program,
                self.realizer_pda,
                self.reward_vault,
                self.paired_vault,
                self.distributable_vault,
                self.token_program,
                self.passthrough,
                &args,
                self.realizer_seeds,
            )?;

            let reward_after = vault::balance(self.reward_vault)?;
            let paired_after = vault::balance(self.paired_vault)?;
            let dist_after = vault::balance(self.distributable_vault)?;

            Ok(RealizedLiquidity {
                entitlement_used: reward_before.saturating_sub(reward_after) as u128,
                paired_used: paired_before.saturating_sub(paired_after) as u128,
                distributable_created: dist_after.saturating_sub(dist_before) as u128,
            })
        }
    }

    impl<'a, 'b> LiquidityRealizer for CpiRealizer<'a, 'b> {
        fn add_liquidity(&mut self, request: &LiquidityRequest) -> Result<RealizedLiquidity, EngineError> {
            self.run(request).map_err(|e| {
                self.failure = Some(e);
                EngineError::RealizerFailed
            })
        }
    }

    /// A stake account named by the instruction, decoded up front.
    struct StakeAccount<'a, 'b> {
        info: &'b AccountInfo<'a>,
        owner: [u8; 32],
        pool_id: u16,
        bump: u8,
        record: Option<Stake>,
        dirty: bool,
    }

    /// Stake records of the accounts an instruction supplied. The engine
    /// works against this buffer; accounts are written by `flush` once the
    /// engine call has succeeded.
    struct AccountStakes<'a, 'b> {
        entries: Vec<StakeAccount<'a, 'b>>,
    }

    impl<'a, 'b> AccountStakes<'a, 'b> {
        fn new() -> Self {
            Self { entries: Vec::new() }
        }

        /// Load the `(owner, pool_id)` stake account. It must sit at its PDA
        /// and, once initialized, record that same owner and pool.
        fn open(
            &mut self,
            program_id: &Pubkey,
            slab_key: &Pubkey,
            info: &'b AccountInfo<'a>,
            owner: &Pubkey,
            pool_id: u16,
        ) -> Result<(), ProgramError> {
            let (expected, bump) = accounts::derive_stake_address(program_id, slab_key, pool_id, owner);
            accounts::expect_key(info, &expected)?;

            let record = if info.owner == program_id {
                let data = info.try_borrow_data()?;
                if data.len() != STAKE_ACCOUNT_LEN {
                    return Err(AccrualError::InvalidStakeAccount.into());
                }
                let header = state::read_stake_header(&data);
                match header.magic {
                    0 => None,
                    STAKE_MAGIC => {
                        let stake = state::read_stake(&data);
                        if !verify::owner_ok(stake.owner, owner.to_bytes()) || stake.pool_id != pool_id {
                            return Err(AccrualError::InvalidStakeAccount.into());
                        }
                        Some(stake)
                    }
                    _ => return Err(AccrualError::InvalidStakeAccount.into()),
                }
            } else if info.owner == &system_program::ID && info.data_is_empty() {
                None
            } else {
                return Err(ProgramError::IllegalOwner);
            };

            self.entries.push(StakeAccount {
                info,
                owner: owner.to_bytes(),
                pool_id,
                bump,
                record,
                dirty: false,
            });
            Ok(())
        }

        /// Write every record the engine saved. Accounts that do not exist
        /// yet are created from `funding` (payer, system program).
        fn flush(
            &self,
            program_id: &Pubkey,
            slab_key: &Pubkey,
            funding: Option<(&AccountInfo<'a>, &AccountInfo<'a>)>,
        ) -> ProgramResult {
            for entry in self.entries.iter().filter(|e| e.dirty) {
                let Some(stake) = entry.record else {
                    continue;
                };
                if entry.info.owner != program_id {
                    let (payer, system) = funding.ok_or(AccrualError::InvalidStakeAccount)?;
                    create_stake_account(program_id, slab_key, entry, payer, system)?;
                }
                let mut data = entry.info.try_borrow_mut_data()?;
                if data.len() != STAKE_ACCOUNT_LEN {
                    return Err(AccrualError::InvalidStakeAccount.into());
                }
                let header = StakeHeader {
                    magic: STAKE_MAGIC,
                    version: VERSION,
                    bump: entry.bump,
                    _padding: [0; 3],
                };
                state::write_stake(&mut data, &header, &stake);
            }
            Ok(())
        }
    }

    impl<'a, 'b> StakeStore for AccountStakes<'a, 'b> {
        fn load(&self, owner: &[u8; 32], pool_id: u16) -> Result<Option<Stake>, EngineError> {
            self.entries
                .iter()
                .find(|e| e.owner == *owner && e.pool_id == pool_id)
                .map(|e| e.record)
                .ok_or(EngineError::StakeUnavailable)
        }

        fn save(&mut self, stake: Stake) -> Result<(), EngineError> {
            let entry = self
                .entries
                .iter_mut()
                .find(|e| e.owner == stake.owner && e.pool_id == stake.pool_id)
                .ok_or(EngineError::StakeUnavailable)?;
            entry.record = Some(stake);
            entry.dirty = true;
            Ok(())
        }
    }

    /// Allocate a stake PDA. A pre-funded address cannot take
    /// `create_account`, so it is topped up, allocated and assigned instead.
    fn create_stake_account<'a>(
        program_id: &Pubkey,
        slab_key: &Pubkey,
        entry: &StakeAccount<'a, '_>,
        payer: &AccountInfo<'a>,
        system: &AccountInfo<'a>,
    ) -> ProgramResult {
        accounts::expect_key(system, &system_program::ID)?;
        #[cfg(not(test))]
        {
            let pool_le = entry.pool_id.to_le_bytes();
            let bump = [entry.bump];
            let seeds: [&[u8]; 5] = [b"stake", slab_key.as_ref(), &pool_le, &entry.owner, &bump];
            let signer_seeds: [&[&[u8]]; 1] = [&seeds];

            let required = Rent::get()?.minimum_balance(STAKE_ACCOUNT_LEN);
            let current = entry.info.lamports();
            let infos = [payer.clone(), entry.info.clone(), system.clone()];
            if current == 0 {
                let ix = system_instruction::create_account(
                    payer.key,
                    entry.info.key,
                    required,
                    STAKE_ACCOUNT_LEN as u64,
                    program_id,
                );
                invoke_signed(&ix, &infos, &signer_seeds)?;
            } else {
                if current < required {
                    let ix = system_instruction::transfer(payer.key, entry.info.key, required - current);
                    invoke_signed(&ix, &infos, &[])?;
                }
                let ix = system_instruction::allocate(entry.info.key, STAKE_ACCOUNT_LEN as u64);
                invoke_signed(&ix, &infos, &signer_seeds)?;
                let ix = system_instruction::assign(entry.info.key, program_id);
                invoke_signed(&ix, &infos, &signer_seeds)?;
            }
        }
        #[cfg(test)]
        {
            // Test builds pre-create stake accounts at full size.
            let _ = (program_id, slab_key, entry, payer);
        }
        Ok(())
    }

    fn slab_guard(program_id: &Pubkey, slab: &AccountInfo, data: &[u8]) -> Result<(), ProgramError> {
        accounts::expect_owner(slab, program_id)?;
        if data.len() != SLAB_LEN {
            return Err(AccrualError::InvalidSlabLen.into());
        }
        Ok(())
    }

    fn require_initialized(data: &[u8]) -> Result<(), ProgramError> {
        let h = state::read_header(data);
        if h.magic != MAGIC {
            return Err(AccrualError::NotInitialized.into());
        }
        if h.version != VERSION {
            return Err(AccrualError::InvalidVersion.into());
        }
        Ok(())
    }

    fn require_admin(data: &[u8], signer: &AccountInfo) -> Result<(), ProgramError> {
        let h = state::read_header(data);
        if !verify::admin_ok(h.admin, signer.key.to_bytes()) {
            return Err(AccrualError::Unauthorized.into());
        }
        Ok(())
    }

    /// Run `body` with the slab's reentrancy flag held. The flag is cleared
    /// on both exits.
    fn guarded<F>(data: &mut [u8], body: F) -> ProgramResult
    where
        F: FnOnce(&mut [u8]) -> ProgramResult,
    {
        let mut h = state::read_header(data);
        if !verify::guard_enter_ok(h.entered) {
            return Err(AccrualError::Reentrancy.into());
        }
        h.entered = 1;
        state::write_header(data, &h);

        let res = body(data);

        let mut h = state::read_header(data);
        h.entered = 0;
        state::write_header(data, &h);
        res
    }

    fn verify_vault(a_vault: &AccountInfo, expected_owner: &Pubkey, expected_mint: &Pubkey) -> Result<(), ProgramError> {
        if a_vault.owner != &spl_token::ID {
            return Err(AccrualError::InvalidVault.into());
        }
        if a_vault.data_len() != spl_token::state::Account::LEN {
            return Err(AccrualError::InvalidVault.into());
        }
        let data = a_vault.try_borrow_data()?;
        let tok = spl_token::state::Account::unpack(&data)?;
        if tok.mint != *expected_mint {
            return Err(AccrualError::InvalidMint.into());
        }
        if tok.owner != *expected_owner {
            return Err(AccrualError::InvalidVault.into());
        }
        Ok(())
    }

    /// SPL mint check; `authority` additionally pins the mint authority.
    fn verify_mint(a_mint: &AccountInfo, authority: Option<&Pubkey>) -> Result<(), ProgramError> {
        if a_mint.owner != &spl_token::ID || a_mint.data_len() != spl_token::state::Mint::LEN {
            return Err(AccrualError::InvalidMint.into());
        }
        let data = a_mint.try_borrow_data()?;
        let mint = spl_token::state::Mint::unpack(&data)?;
        if let Some(expected) = authority {
            if mint.mint_authority != COption::Some(*expected) {
                return Err(AccrualError::InvalidMint.into());
            }
        }
        Ok(())
    }

    fn unix_now(a_clock: &AccountInfo) -> Result<i64, ProgramError> {
        Ok(Clock::from_account_info(a_clock)?.unix_timestamp)
    }

    fn to_u64(v: u128) -> Result<u64, ProgramError> {
        u64::try_from(v).map_err(|_| map_engine_error(EngineError::Overflow))
    }

    pub fn process_instruction<'a, 'b>(
        program_id: &Pubkey,
        accounts: &'b [AccountInfo<'a>],
        instruction_data: &[u8],
    ) -> ProgramResult {
        let instruction = Instruction::decode(instruction_data)?;

        match instruction {
            Instruction::InitProgram { realizer_program } => {
                accounts::expect_len(accounts, 5)?;
                let a_admin = &accounts[0];
                let a_slab = &accounts[1];
                let a_reward_mint = &accounts[2];
                let a_paired_mint = &accounts[3];
                let a_dist_mint = &accounts[4];

                accounts::expect_signer(a_admin)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;

                let _ = zc::engine_mut(&mut data)?;

                let header = state::read_header(&data);
                if header.magic == MAGIC {
                    return Err(AccrualError::AlreadyInitialized.into());
                }
                if realizer_program == Pubkey::default() {
                    return Err(AccrualError::InvalidRealizer.into());
                }

                let (auth, bump) = accounts::derive_vault_authority(program_id, a_slab.key);
                let (_, realizer_bump) = accounts::derive_realizer_authority(program_id, a_slab.key);
                verify_mint(a_reward_mint, Some(&auth))?;
                verify_mint(a_paired_mint, None)?;
                verify_mint(a_dist_mint, None)?;

                // Zeroed bytes are an empty engine.
                for b in data.iter_mut() {
                    *b = 0;
                }

                let config = ProgramConfig {
                    reward_mint: a_reward_mint.key.to_bytes(),
                    paired_mint: a_paired_mint.key.to_bytes(),
                    distributable_mint: a_dist_mint.key.to_bytes(),
                    realizer_program: realizer_program.to_bytes(),
                    vault_authority_bump: bump,
                    realizer_authority_bump: realizer_bump,
                    _padding: [0; 6],
                };
                state::write_config(&mut data, &config);

                let new_header = SlabHeader {
                    magic: MAGIC,
                    version: VERSION,
                    bump,
                    entered: 0,
                    _padding: [0; 2],
                    admin: a_admin.key.to_bytes(),
                    _reserved: [0; 16],
                };
                state::write_header(&mut data, &new_header);
                msg!("InitProgram: admin={} realizer={}", a_admin.key, realizer_program);
            }
            Instruction::CreatePool => {
                accounts::expect_len(accounts, 4)?;
                let a_admin = &accounts[0];
                let a_slab = &accounts[1];
                let a_asset_mint = &accounts[2];
                let a_clock = &accounts[3];

                accounts::expect_signer(a_admin)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                require_admin(&data, a_admin)?;
                verify_mint(a_asset_mint, None)?;

                let now = unix_now(a_clock)?;
                let engine = zc::engine_mut(&mut data)?;
                let pool_id = engine
                    .create_pool(a_asset_mint.key.to_bytes(), now)
                    .map_err(map_engine_error)?;
                msg!("CreatePool: pool={} asset={}", pool_id, a_asset_mint.key);
            }
            Instruction::SetRewardWeights { weights } => {
                accounts::expect_len(accounts, 3)?;
                let a_admin = &accounts[0];
                let a_slab = &accounts[1];
                let a_clock = &accounts[2];

                accounts::expect_signer(a_admin)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                require_admin(&data, a_admin)?;

                let now = unix_now(a_clock)?;
                let engine = zc::engine_mut(&mut data)?;
                let changes = engine.set_reward_weights(&weights, now).map_err(map_engine_error)?;
                for c in &changes {
                    msg!("PoolWeightChanged: pool={} old={} new={}", c.pool_id, c.old_weight, c.new_weight);
                }
                msg!("SetRewardWeights: total_weight={}", engine.context().total_weight);
            }
            Instruction::SetGlobalRate { rate } => {
                accounts::expect_len(accounts, 3)?;
                let a_admin = &accounts[0];
                let a_slab = &accounts[1];
                let a_clock = &accounts[2];

                accounts::expect_signer(a_admin)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                require_admin(&data, a_admin)?;

                let now = unix_now(a_clock)?;
                let engine = zc::engine_mut(&mut data)?;
                let old = engine.set_global_rate(rate as u128, now).map_err(map_engine_error)?;
                msg!("SetGlobalRate: old={} new={}", old, rate);
            }
            Instruction::SetForfeitAddress { forfeit } => {
                accounts::expect_len(accounts, 2)?;
                let a_admin = &accounts[0];
                let a_slab = &accounts[1];

                accounts::expect_signer(a_admin)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                require_admin(&data, a_admin)?;

                let engine = zc::engine_mut(&mut data)?;
                let pool_count = engine.pool_count();
                accounts::expect_len(accounts, 2 + pool_count)?;
                let mut stakes = AccountStakes::new();
                for (pool_id, a_stake) in accounts[2..2 + pool_count].iter().enumerate() {
                    stakes.open(program_id, a_slab.key, a_stake, &forfeit, pool_id as u16)?;
                }
                engine
                    .set_forfeit_account(forfeit.to_bytes(), &stakes)
                    .map_err(map_engine_error)?;
                msg!("SetForfeitAddress: {}", forfeit);
            }
            Instruction::Deposit { pool_id, amount } => {
                accounts::expect_len(accounts, 8)?;
                let a_user = &accounts[0];
                let a_slab = &accounts[1];
                let a_user_ata = &accounts[2];
                let a_vault = &accounts[3];
                let a_stake = &accounts[4];
                let a_token = &accounts[5];
                let a_system = &accounts[6];
                let a_clock = &accounts[7];

                accounts::expect_signer(a_user)?;
                accounts::expect_writable(a_slab)?;
                accounts::expect_writable(a_stake)?;
                accounts::expect_key(a_token, &spl_token::ID)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;

                let now = unix_now(a_clock)?;
                let (auth, _) = accounts::derive_vault_authority(program_id, a_slab.key);

                guarded(&mut data, |data| {
                    let engine = zc::engine_mut(data)?;
                    let asset = engine.pool(pool_id).map_err(map_engine_error)?.asset;
                    verify_vault(a_vault, &auth, &Pubkey::new_from_array(asset))?;

                    let mut stakes = AccountStakes::new();
                    stakes.open(program_id, a_slab.key, a_stake, a_user.key, pool_id)?;
                    engine
                        .deposit(&mut stakes, &a_user.key.to_bytes(), pool_id, amount as u128, now)
                        .map_err(map_engine_error)?;
                    stakes.flush(program_id, a_slab.key, Some((a_user, a_system)))?;

                    vault::deposit(a_token, a_user_ata, a_vault, a_user, amount)?;
                    msg!("Deposit: pool={} depositor={} amount={}", pool_id, a_user.key, amount);
                    Ok(())
                })?;
            }
            Instruction::Exit { pool_id } => {
                accounts::expect_len(accounts, 10)?;
                let a_user = &accounts[0];
                let a_slab = &accounts[1];
                let a_vault = &accounts[2];
                let a_user_ata = &accounts[3];
                let a_pda = &accounts[4];
                let a_stake = &accounts[5];
                let a_forfeit_stake = &accounts[6];
                let a_token = &accounts[7];
                let a_system = &accounts[8];
                let a_clock = &accounts[9];

                accounts::expect_signer(a_user)?;
                accounts::expect_writable(a_slab)?;
                accounts::expect_writable(a_stake)?;
                accounts::expect_writable(a_forfeit_stake)?;
                accounts::expect_key(a_token, &spl_token::ID)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                let config = state::read_config(&data);

                let (auth, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                accounts::expect_key(a_pda, &auth)?;
                let now = unix_now(a_clock)?;

                let seed1: &[u8] = b"vault";
                let seed2: &[u8] = a_slab.key.as_ref();
                let bump_arr: [u8; 1] = [config.vault_authority_bump];
                let seed3: &[u8] = &bump_arr;
                let seeds: [&[u8]; 3] = [seed1, seed2, seed3];
                let signer_seeds: [&[&[u8]]; 1] = [&seeds];

                guarded(&mut data, |data| {
                    let engine = zc::engine_mut(data)?;
                    let asset = engine.pool(pool_id).map_err(map_engine_error)?.asset;
                    verify_vault(a_vault, &auth, &Pubkey::new_from_array(asset))?;

                    let mut stakes = AccountStakes::new();
                    stakes.open(program_id, a_slab.key, a_stake, a_user.key, pool_id)?;
                    if let Some(forfeit) = engine.forfeit_account() {
                        let forfeit = Pubkey::new_from_array(forfeit);
                        stakes.open(program_id, a_slab.key, a_forfeit_stake, &forfeit, pool_id)?;
                    }

                    let out = engine
                        .exit(&mut stakes, &a_user.key.to_bytes(), pool_id, now)
                        .map_err(map_engine_error)?;
                    stakes.flush(program_id, a_slab.key, Some((a_user, a_system)))?;
                    let amount = to_u64(out.withdrawn)?;

                    vault::withdraw(a_token, a_vault, a_user_ata, a_pda, amount, &signer_seeds)?;
                    msg!(
                        "Exit: pool={} depositor={} withdrawn={} forfeited={}",
                        pool_id,
                        a_user.key,
                        out.withdrawn,
                        out.forfeited
                    );
                    Ok(())
                })?;
            }
            Instruction::GenerateDistributable {
                pool_id,
                entitlement_qty,
                paired_qty,
                min_entitlement_qty,
                min_paired_qty,
                deadline,
            } => {
                accounts::expect_len(accounts, 12)?;
                let a_admin = &accounts[0];
                let a_slab = &accounts[1];
                let a_admin_paired = &accounts[2];
                let a_reward_mint = &accounts[3];
                let a_reward_vault = &accounts[4];
                let a_paired_vault = &accounts[5];
                let a_dist_vault = &accounts[6];
                let a_pda = &accounts[7];
                let a_realizer_pda = &accounts[8];
                let a_token = &accounts[9];
                let a_realizer = &accounts[10];
                let a_clock = &accounts[11];
                let passthrough = &accounts[12..];

                accounts::expect_signer(a_admin)?;
                accounts::expect_writable(a_slab)?;
                accounts::expect_key(a_token, &spl_token::ID)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                require_admin(&data, a_admin)?;
                let config = state::read_config(&data);

                let (auth, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                let (stager, _) = accounts::derive_realizer_authority(program_id, a_slab.key);
                accounts::expect_key(a_pda, &auth)?;
                accounts::expect_key(a_realizer_pda, &stager)?;
                accounts::expect_key(a_reward_mint, &Pubkey::new_from_array(config.reward_mint))?;
                if *a_realizer.key != Pubkey::new_from_array(config.realizer_program) {
                    return Err(AccrualError::InvalidRealizer.into());
                }
                verify_vault(a_reward_vault, &stager, &Pubkey::new_from_array(config.reward_mint))?;
                verify_vault(a_paired_vault, &stager, &Pubkey::new_from_array(config.paired_mint))?;
                verify_vault(a_dist_vault, &auth, &Pubkey::new_from_array(config.distributable_mint))?;

                let now = unix_now(a_clock)?;

                let seed1: &[u8] = b"vault";
                let seed2: &[u8] = a_slab.key.as_ref();
                let bump_arr: [u8; 1] = [config.vault_authority_bump];
                let seed3: &[u8] = &bump_arr;
                let seeds: [&[u8]; 3] = [seed1, seed2, seed3];
                let vault_seeds: [&[&[u8]]; 1] = [&seeds];

                let stage_seed1: &[u8] = b"realizer";
                let stage_bump_arr: [u8; 1] = [config.realizer_authority_bump];
                let stage_seed3: &[u8] = &stage_bump_arr;
                let stage_seeds: [&[u8]; 3] = [stage_seed1, seed2, stage_seed3];
                let realizer_seeds: [&[&[u8]]; 1] = [&stage_seeds];

                guarded(&mut data, |data| {
                    let engine = zc::engine_mut(data)?;
                    let request = LiquidityRequest {
                        entitlement_qty: entitlement_qty as u128,
                        paired_qty: paired_qty as u128,
                        min_entitlement_qty: min_entitlement_qty as u128,
                        min_paired_qty: min_paired_qty as u128,
                        deadline,
                    };
                    let mut cpi = CpiRealizer {
                        operator: a_admin,
                        operator_paired: a_admin_paired,
                        reward_mint: a_reward_mint,
                        reward_vault: a_reward_vault,
                        paired_vault: a_paired_vault,
                        distributable_vault: a_dist_vault,
                        vault_pda: a_pda,
                        realizer_pda: a_realizer_pda,
                        token_program: a_token,
                        program: a_realizer,
                        passthrough,
                        vault_seeds: &vault_seeds,
                        realizer_seeds: &realizer_seeds,
                        failure: None,
                    };

                    let out = match engine.generate_distributable(pool_id, request, now, &mut cpi) {
                        Ok(out) => out,
                        Err(e) => return Err(cpi.failure.take().unwrap_or_else(|| map_engine_error(e))),
                    };

                    let refund = to_u64(out.paired_refund)?;
                    if refund > 0 {
                        vault::withdraw(a_token, a_paired_vault, a_admin_paired, a_realizer_pda, refund, &realizer_seeds)?;
                    }
                    let unused = to_u64(out.entitlement_unused)?;
                    if unused > 0 {
                        vault::burn(a_token, a_reward_vault, a_reward_mint, a_realizer_pda, unused, &realizer_seeds)?;
                    }
                    msg!(
                        "GenerateDistributable: pool={} entitlement_used={} paired_used={} paired_refund={} burned={} created={}",
                        pool_id,
                        out.entitlement_used,
                        out.paired_used,
                        refund,
                        unused,
                        out.distributable_created
                    );
                    Ok(())
                })?;
            }
            Instruction::SetRoot { root } => {
                accounts::expect_len(accounts, 2)?;
                let a_admin = &accounts[0];
                let a_slab = &accounts[1];

                accounts::expect_signer(a_admin)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                require_admin(&data, a_admin)?;

                let engine = zc::engine_mut(&mut data)?;
                let first = engine.set_root(root).map_err(map_engine_error)?;
                if first {
                    msg!("ClaimsEnabled");
                }
                msg!("SetRoot: {}", Pubkey::new_from_array(root));
            }
            Instruction::Claim { index, pool_id, cumulative_asset, cumulative_entitlement, proof } => {
                accounts::expect_len(accounts, 8)?;
                let a_claimant = &accounts[0];
                let a_slab = &accounts[1];
                let a_dist_vault = &accounts[2];
                let a_claimant_ata = &accounts[3];
                let a_pda = &accounts[4];
                let a_stake = &accounts[5];
                let a_token = &accounts[6];
                let a_clock = &accounts[7];

                accounts::expect_signer(a_claimant)?;
                accounts::expect_writable(a_slab)?;
                accounts::expect_writable(a_stake)?;
                accounts::expect_key(a_token, &spl_token::ID)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                let config = state::read_config(&data);

                let (auth, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                accounts::expect_key(a_pda, &auth)?;
                verify_vault(a_dist_vault, &auth, &Pubkey::new_from_array(config.distributable_mint))?;
                let now = unix_now(a_clock)?;

                let seed1: &[u8] = b"vault";
                let seed2: &[u8] = a_slab.key.as_ref();
                let bump_arr: [u8; 1] = [config.vault_authority_bump];
                let seed3: &[u8] = &bump_arr;
                let seeds: [&[u8]; 3] = [seed1, seed2, seed3];
                let signer_seeds: [&[&[u8]]; 1] = [&seeds];

                guarded(&mut data, |data| {
                    let engine = zc::engine_mut(data)?;
                    let mut stakes = AccountStakes::new();
                    stakes.open(program_id, a_slab.key, a_stake, a_claimant.key, pool_id)?;
                    let out = engine
                        .claim(
                            &mut stakes,
                            &a_claimant.key.to_bytes(),
                            index,
                            pool_id,
                            cumulative_asset as u128,
                            cumulative_entitlement as u128,
                            &proof,
                            now,
                        )
                        .map_err(map_engine_error)?;
                    stakes.flush(program_id, a_slab.key, None)?;
                    let paid = to_u64(out.asset_paid)?;

                    vault::withdraw(a_token, a_dist_vault, a_claimant_ata, a_pda, paid, &signer_seeds)?;
                    msg!(
                        "Claim: pool={} claimant={} asset_paid={} entitlement_settled={}",
                        pool_id,
                        a_claimant.key,
                        out.asset_paid,
                        out.entitlement_settled
                    );
                    Ok(())
                })?;
            }
            Instruction::UpdateAdmin { new_admin } => {
                accounts::expect_len(accounts, 2)?;
                let a_admin = &accounts[0];
                let a_slab = &accounts[1];

                accounts::expect_signer(a_admin)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                require_admin(&data, a_admin)?;

                let mut header = state::read_header(&data);
                header.admin = new_admin.to_bytes();
                state::write_header(&mut data, &header);
                msg!("UpdateAdmin: {}", new_admin);
            }
        }
        Ok(())
    }
}

// 10. mod entrypoint
#[cfg(not(feature = "no-entrypoint"))]
pub mod entrypoint {
    use solana_program::{
        account_info::AccountInfo, entrypoint, entrypoint::ProgramResult, pubkey::Pubkey,
    };
    use solana_security_txt::security_txt;
    use crate::processor;

    entrypoint!(process_instruction);

    security_txt! {
        name: "Accrual",
        project_url: "https://github.com/accrual-protocol/accrual-prog",
        contacts: "email:security@accrual.fi",
        policy: "https://github.com/accrual-protocol/accrual-prog/blob/main/SECURITY.md",
        source_code: "https://github.com/accrual-protocol/accrual-prog"
    }

    fn process_instruction<'a>(
        program_id: &Pubkey,
        accounts: &'a [AccountInfo<'a>],
        instruction_data: &[u8],
    ) -> ProgramResult {
        processor::process_instruction(program_id, accounts, instruction_data)
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use alloc::{vec, vec::Vec};
    use super::*;
    use solana_program::{
        account_info::AccountInfo,
        clock::Clock,
        program_error::ProgramError,
        program_option::COption,
        program_pack::Pack,
        pubkey::Pubkey,
        system_program,
    };
    use spl_token::state::{Account as TokenAccount, AccountState, Mint};
    use crate::{
        claim::{ClaimLeaf, ClaimTree},
        constants::{MAGIC, SLAB_LEN, STAKE_ACCOUNT_LEN, STAKE_MAGIC, VERSION},
        engine::Stake,
        error::AccrualError,
        processor::process_instruction,
        state::{self, StakeHeader},
        zc,
    };

    // --- Harness ---

    struct TestAccount {
        key: Pubkey,
        owner: Pubkey,
        lamports: u64,
        data: Vec<u8>,
        is_signer: bool,
        is_writable: bool,
    }

    impl TestAccount {
        fn new(key: Pubkey, owner: Pubkey, lamports: u64, data: Vec<u8>) -> Self {
            Self { key, owner, lamports, data, is_signer: false, is_writable: false }
        }
        fn signer(mut self) -> Self { self.is_signer = true; self }
        fn writable(mut self) -> Self { self.is_writable = true; self }

        fn to_info<'a>(&'a mut self) -> AccountInfo<'a> {
            AccountInfo::new(
                &self.key,
                self.is_signer,
                self.is_writable,
                &mut self.lamports,
                &mut self.data,
                &self.owner,
                false,
                0,
            )
        }
    }

    // --- Builders ---

    fn make_token_account(mint: Pubkey, owner: Pubkey, amount: u64) -> Vec<u8> {
        let mut data = vec![0u8; TokenAccount::LEN];
        let mut account = TokenAccount::default();
        account.mint = mint;
        account.owner = owner;
        account.amount = amount;
        account.state = AccountState::Initialized;
        TokenAccount::pack(account, &mut data).unwrap();
        data
    }

    fn make_mint(authority: Pubkey) -> Vec<u8> {
        let mut data = vec![0u8; Mint::LEN];
        let mint = Mint {
            mint_authority: COption::Some(authority),
            supply: 0,
            decimals: 6,
            is_initialized: true,
            freeze_authority: COption::None,
        };
        Mint::pack(mint, &mut data).unwrap();
        data
    }

    fn make_clock(unix_timestamp: i64) -> Vec<u8> {
        let clock = Clock { unix_timestamp, ..Clock::default() };
        bincode::serialize(&clock).unwrap()
    }

    fn amount_of(acc: &TestAccount) -> u64 {
        TokenAccount::unpack(&acc.data).unwrap().amount
    }

    fn stake_of(acc: &TestAccount) -> Stake {
        assert_eq!(state::read_stake_header(&acc.data).magic, STAKE_MAGIC);
        state::read_stake(&acc.data)
    }

    fn token_account(mint: Pubkey, owner: Pubkey, amount: u64) -> TestAccount {
        TestAccount::new(Pubkey::new_unique(), spl_token::ID, 0, make_token_account(mint, owner, amount)).writable()
    }

    fn mint_account(key: Pubkey, authority: Pubkey) -> TestAccount {
        TestAccount::new(key, spl_token::ID, 0, make_mint(authority)).writable()
    }

    fn wallet() -> TestAccount {
        TestAccount::new(Pubkey::new_unique(), system_program::id(), 0, vec![]).signer().writable()
    }

    struct Fixture {
        program_id: Pubkey,
        admin: TestAccount,
        slab: TestAccount,
        reward_mint: TestAccount,
        paired_mint: TestAccount,
        dist_mint: TestAccount,
        asset_mint: TestAccount,
        pool_vault: TestAccount,
        reward_vault: TestAccount,
        paired_vault: TestAccount,
        dist_vault: TestAccount,
        admin_paired: TestAccount,
        vault_pda: TestAccount,
        realizer_pda: TestAccount,
        token_prog: TestAccount,
        system_prog: TestAccount,
        realizer: TestAccount,
        clock: TestAccount,
    }

    fn setup() -> Fixture {
        let program_id = Pubkey::new_unique();
        let slab_key = Pubkey::new_unique();
        let (vault_pda, _) = accounts::derive_vault_authority(&program_id, &slab_key);
        let (realizer_pda, _) = accounts::derive_realizer_authority(&program_id, &slab_key);
        let reward = Pubkey::new_unique();
        let paired = Pubkey::new_unique();
        let dist = Pubkey::new_unique();
        let asset = Pubkey::new_unique();
        let admin = wallet();
        let admin_key = admin.key;

        Fixture {
            program_id,
            admin,
            slab: TestAccount::new(slab_key, program_id, 0, vec![0u8; SLAB_LEN]).writable(),
            reward_mint: mint_account(reward, vault_pda),
            paired_mint: mint_account(paired, Pubkey::new_unique()),
            dist_mint: mint_account(dist, Pubkey::new_unique()),
            asset_mint: mint_account(asset, Pubkey::new_unique()),
            pool_vault: token_account(asset, vault_pda, 0),
            reward_vault: token_account(reward, realizer_pda, 0),
            paired_vault: token_account(paired, realizer_pda, 0),
            dist_vault: token_account(dist, vault_pda, 0),
            admin_paired: token_account(paired, admin_key, 1_000),
            vault_pda: TestAccount::new(vault_pda, system_program::id(), 0, vec![]),
            realizer_pda: TestAccount::new(realizer_pda, system_program::id(), 0, vec![]),
            token_prog: TestAccount::new(spl_token::ID, Pubkey::default(), 0, vec![]),
            system_prog: TestAccount::new(system_program::id(), Pubkey::default(), 0, vec![]),
            realizer: TestAccount::new(Pubkey::new_unique(), Pubkey::default(), 0, vec![]),
            clock: TestAccount::new(solana_program::sysvar::clock::id(), solana_program::sysvar::id(), 0, make_clock(100)),
        }
    }

    /// Allocated, unused stake account for `(owner, pool_id)`.
    fn stake_account(f: &Fixture, owner: &Pubkey, pool_id: u16) -> TestAccount {
        let (key, _) = accounts::derive_stake_address(&f.program_id, &f.slab.key, pool_id, owner);
        TestAccount::new(key, f.program_id, 0, vec![0u8; STAKE_ACCOUNT_LEN]).writable()
    }

    // --- Encoders ---

    fn encode_u64(val: u64, buf: &mut Vec<u8>) { buf.extend_from_slice(&val.to_le_bytes()); }
    fn encode_u16(val: u16, buf: &mut Vec<u8>) { buf.extend_from_slice(&val.to_le_bytes()); }
    fn encode_pubkey(val: &Pubkey, buf: &mut Vec<u8>) { buf.extend_from_slice(val.as_ref()); }

    fn encode_init(realizer: &Pubkey) -> Vec<u8> {
        let mut data = vec![tags::TAG_INIT_PROGRAM];
        encode_pubkey(realizer, &mut data);
        data
    }

    fn encode_weights(weights: &[u64]) -> Vec<u8> {
        let mut data = vec![tags::TAG_SET_REWARD_WEIGHTS];
        encode_u16(weights.len() as u16, &mut data);
        for w in weights {
            encode_u64(*w, &mut data);
        }
        data
    }

    fn encode_rate(rate: u64) -> Vec<u8> {
        let mut data = vec![tags::TAG_SET_GLOBAL_RATE];
        encode_u64(rate, &mut data);
        data
    }

    fn encode_forfeit(forfeit: &Pubkey) -> Vec<u8> {
        let mut data = vec![tags::TAG_SET_FORFEIT_ADDRESS];
        encode_pubkey(forfeit, &mut data);
        data
    }

    fn encode_deposit(pool_id: u16, amount: u64) -> Vec<u8> {
        let mut data = vec![tags::TAG_DEPOSIT];
        encode_u16(pool_id, &mut data);
        encode_u64(amount, &mut data);
        data
    }

    fn encode_exit(pool_id: u16) -> Vec<u8> {
        let mut data = vec![tags::TAG_EXIT];
        encode_u16(pool_id, &mut data);
        data
    }

    fn encode_generate(pool_id: u16, ent: u64, paired: u64, min_ent: u64, min_paired: u64, deadline: i64) -> Vec<u8> {
        let mut data = vec![tags::TAG_GENERATE_DISTRIBUTABLE];
        encode_u16(pool_id, &mut data);
        encode_u64(ent, &mut data);
        encode_u64(paired, &mut data);
        encode_u64(min_ent, &mut data);
        encode_u64(min_paired, &mut data);
        data.extend_from_slice(&deadline.to_le_bytes());
        data
    }

    fn encode_set_root(root: [u8; 32]) -> Vec<u8> {
        let mut data = vec![tags::TAG_SET_ROOT];
        data.extend_from_slice(&root);
        data
    }

    fn encode_claim(leaf: &ClaimLeaf, proof: &[[u8; 32]]) -> Vec<u8> {
        let mut data = vec![tags::TAG_CLAIM];
        encode_u64(leaf.index, &mut data);
        encode_u16(leaf.pool_id, &mut data);
        encode_u64(leaf.cumulative_asset as u64, &mut data);
        encode_u64(leaf.cumulative_entitlement as u64, &mut data);
        data.push(proof.len() as u8);
        for node in proof {
            data.extend_from_slice(node);
        }
        data
    }

    // --- Flows ---

    fn init(f: &mut Fixture) {
        let realizer = f.realizer.key;
        let accs = vec![
            f.admin.to_info(), f.slab.to_info(), f.reward_mint.to_info(), f.paired_mint.to_info(), f.dist_mint.to_info(),
        ];
        process_instruction(&f.program_id, &accs, &encode_init(&realizer)).unwrap();
    }

    /// Program with one pool (weight 1) emitting `rate` per second from t=100.
    fn init_with_pool(f: &mut Fixture, rate: u64) {
        init(f);
        {
            let accs = vec![f.admin.to_info(), f.slab.to_info(), f.asset_mint.to_info(), f.clock.to_info()];
            process_instruction(&f.program_id, &accs, &[tags::TAG_CREATE_POOL]).unwrap();
        }
        {
            let accs = vec![f.admin.to_info(), f.slab.to_info(), f.clock.to_info()];
            process_instruction(&f.program_id, &accs, &encode_weights(&[1])).unwrap();
        }
        {
            let accs = vec![f.admin.to_info(), f.slab.to_info(), f.clock.to_info()];
            process_instruction(&f.program_id, &accs, &encode_rate(rate)).unwrap();
        }
    }

    fn deposit(
        f: &mut Fixture,
        user: &mut TestAccount,
        ata: &mut TestAccount,
        stake: &mut TestAccount,
        amount: u64,
    ) -> Result<(), ProgramError> {
        let accs = vec![
            user.to_info(), f.slab.to_info(), ata.to_info(), f.pool_vault.to_info(), stake.to_info(),
            f.token_prog.to_info(), f.system_prog.to_info(), f.clock.to_info(),
        ];
        process_instruction(&f.program_id, &accs, &encode_deposit(0, amount))
    }

    fn exit(
        f: &mut Fixture,
        user: &mut TestAccount,
        ata: &mut TestAccount,
        stake: &mut TestAccount,
        forfeit_stake: &mut TestAccount,
    ) -> Result<(), ProgramError> {
        let accs = vec![
            user.to_info(), f.slab.to_info(), f.pool_vault.to_info(), ata.to_info(), f.vault_pda.to_info(),
            stake.to_info(), forfeit_stake.to_info(), f.token_prog.to_info(), f.system_prog.to_info(),
            f.clock.to_info(),
        ];
        process_instruction(&f.program_id, &accs, &encode_exit(0))
    }

    fn set_forfeit(f: &mut Fixture, forfeit: &Pubkey, stakes: &mut [TestAccount]) -> Result<(), ProgramError> {
        let mut accs = vec![f.admin.to_info(), f.slab.to_info()];
        accs.extend(stakes.iter_mut().map(|s| s.to_info()));
        process_instruction(&f.program_id, &accs, &encode_forfeit(forfeit))
    }

    fn generate(f: &mut Fixture, data: &[u8]) -> Result<(), ProgramError> {
        let accs = vec![
            f.admin.to_info(), f.slab.to_info(), f.admin_paired.to_info(), f.reward_mint.to_info(),
            f.reward_vault.to_info(), f.paired_vault.to_info(), f.dist_vault.to_info(), f.vault_pda.to_info(),
            f.realizer_pda.to_info(), f.token_prog.to_info(), f.realizer.to_info(), f.clock.to_info(),
        ];
        process_instruction(&f.program_id, &accs, data)
    }

    fn set_root(f: &mut Fixture, root: [u8; 32]) -> Result<(), ProgramError> {
        let accs = vec![f.admin.to_info(), f.slab.to_info()];
        process_instruction(&f.program_id, &accs, &encode_set_root(root))
    }

    fn claim(
        f: &mut Fixture,
        user: &mut TestAccount,
        ata: &mut TestAccount,
        stake: &mut TestAccount,
        data: &[u8],
    ) -> Result<(), ProgramError> {
        let accs = vec![
            user.to_info(), f.slab.to_info(), f.dist_vault.to_info(), ata.to_info(), f.vault_pda.to_info(),
            stake.to_info(), f.token_prog.to_info(), f.clock.to_info(),
        ];
        process_instruction(&f.program_id, &accs, data)
    }

    // --- Tests ---

    #[test]
    fn test_init_program() {
        let mut f = setup();
        init(&mut f);

        let header = state::read_header(&f.slab.data);
        assert_eq!(header.magic, MAGIC);
        assert_eq!(header.version, VERSION);
        assert_eq!(header.admin, f.admin.key.to_bytes());
        let config = state::read_config(&f.slab.data);
        assert_eq!(config.realizer_program, f.realizer.key.to_bytes());
        assert_eq!(config.reward_mint, f.reward_mint.key.to_bytes());
        let (_, realizer_bump) = accounts::derive_realizer_authority(&f.program_id, &f.slab.key);
        assert_eq!(config.realizer_authority_bump, realizer_bump);

        let engine = zc::engine_ref(&f.slab.data).unwrap();
        assert_eq!(engine.pool_count(), 0);
        assert!(!engine.claims_enabled());

        let realizer = f.realizer.key;
        let accs = vec![
            f.admin.to_info(), f.slab.to_info(), f.reward_mint.to_info(), f.paired_mint.to_info(), f.dist_mint.to_info(),
        ];
        let res = process_instruction(&f.program_id, &accs, &encode_init(&realizer));
        assert_eq!(res, Err(AccrualError::AlreadyInitialized.into()));
    }

    #[test]
    fn test_init_requires_pda_mint_authority() {
        let mut f = setup();
        f.reward_mint.data = make_mint(Pubkey::new_unique());
        let realizer = f.realizer.key;
        let accs = vec![
            f.admin.to_info(), f.slab.to_info(), f.reward_mint.to_info(), f.paired_mint.to_info(), f.dist_mint.to_info(),
        ];
        let res = process_instruction(&f.program_id, &accs, &encode_init(&realizer));
        assert_eq!(res, Err(AccrualError::InvalidMint.into()));
    }

    #[test]
    fn test_operator_only() {
        let mut f = setup();
        init(&mut f);
        let mut intruder = wallet();
        let accs = vec![intruder.to_info(), f.slab.to_info(), f.asset_mint.to_info(), f.clock.to_info()];
        let res = process_instruction(&f.program_id, &accs, &[tags::TAG_CREATE_POOL]);
        assert_eq!(res, Err(AccrualError::Unauthorized.into()));
    }

    #[test]
    fn test_burned_admin_locks_operator_paths() {
        let mut f = setup();
        init(&mut f);
        {
            let mut data = vec![tags::TAG_UPDATE_ADMIN];
            encode_pubkey(&Pubkey::default(), &mut data);
            let accs = vec![f.admin.to_info(), f.slab.to_info()];
            process_instruction(&f.program_id, &accs, &data).unwrap();
        }
        assert_eq!(state::read_header(&f.slab.data).admin, [0u8; 32]);
        let res = set_root(&mut f, [7; 32]);
        assert_eq!(res, Err(AccrualError::Unauthorized.into()));
    }

    #[test]
    fn test_deposit_and_exit() {
        let mut f = setup();
        init_with_pool(&mut f, 10);
        let asset = f.asset_mint.key;
        let mut user = wallet();
        let mut ata = token_account(asset, user.key, 5_000);
        let mut stake = stake_account(&f, &user.key, 0);

        deposit(&mut f, &mut user, &mut ata, &mut stake, 1_000).unwrap();
        assert_eq!(amount_of(&f.pool_vault), 1_000);
        assert_eq!(amount_of(&ata), 4_000);
        assert_eq!(stake_of(&stake).total_deposited, 1_000);
        assert_eq!(stake_of(&stake).owner, user.key.to_bytes());

        let forfeit = Pubkey::new_unique();
        let mut forfeit_stake = stake_account(&f, &forfeit, 0);
        f.clock.data = make_clock(200);
        let res = exit(&mut f, &mut user, &mut ata, &mut stake, &mut forfeit_stake);
        assert_eq!(res, Err(AccrualError::EngineForfeitNotConfigured.into()));

        {
            let mut candidate = [stake_account(&f, &forfeit, 0)];
            set_forfeit(&mut f, &forfeit, &mut candidate).unwrap();
        }
        exit(&mut f, &mut user, &mut ata, &mut stake, &mut forfeit_stake).unwrap();
        assert_eq!(amount_of(&f.pool_vault), 0);
        assert_eq!(amount_of(&ata), 5_000);

        let record = stake_of(&stake);
        assert_eq!(record.total_deposited, 0);
        assert_eq!(record.total_entitlement_unclaimed, 0);
        assert_eq!(record.total_claimed_entitlement, 1_000);
        let sink = stake_of(&forfeit_stake);
        assert_eq!(sink.owner, forfeit.to_bytes());
        assert_eq!(sink.total_entitlement_unclaimed, 1_000);
        assert_eq!(state::read_header(&f.slab.data).entered, 0);
    }

    #[test]
    fn test_dust_depositors_do_not_crowd_out_others() {
        let mut f = setup();
        init_with_pool(&mut f, 10);
        let asset = f.asset_mint.key;

        for _ in 0..200 {
            let mut spammer = wallet();
            let mut ata = token_account(asset, spammer.key, 1);
            let mut stake = stake_account(&f, &spammer.key, 0);
            deposit(&mut f, &mut spammer, &mut ata, &mut stake, 1).unwrap();
        }

        let mut user = wallet();
        let mut ata = token_account(asset, user.key, 5_000);
        let mut stake = stake_account(&f, &user.key, 0);
        deposit(&mut f, &mut user, &mut ata, &mut stake, 1_000).unwrap();
        assert_eq!(stake_of(&stake).total_deposited, 1_000);
        let engine = zc::engine_ref(&f.slab.data).unwrap();
        assert_eq!(engine.pool(0).unwrap().total_deposited, 1_200);
    }

    #[test]
    fn test_stake_account_checks() {
        let mut f = setup();
        init_with_pool(&mut f, 10);
        let asset = f.asset_mint.key;
        let mut user = wallet();
        let mut ata = token_account(asset, user.key, 5_000);

        // Someone else's stake address.
        let mut wrong_address = stake_account(&f, &Pubkey::new_unique(), 0);
        let res = deposit(&mut f, &mut user, &mut ata, &mut wrong_address, 10);
        assert_eq!(res, Err(ProgramError::InvalidArgument));

        // Right address, record naming another owner.
        let mut forged = stake_account(&f, &user.key, 0);
        let header = StakeHeader { magic: STAKE_MAGIC, version: VERSION, bump: 0, _padding: [0; 3] };
        let record = Stake { owner: Pubkey::new_unique().to_bytes(), total_deposited: 7, ..Stake::default() };
        state::write_stake(&mut forged.data, &header, &record);
        let res = deposit(&mut f, &mut user, &mut ata, &mut forged, 10);
        assert_eq!(res, Err(AccrualError::InvalidStakeAccount.into()));

        // Right address, owned by a foreign program.
        let mut foreign = stake_account(&f, &user.key, 0);
        foreign.owner = Pubkey::new_unique();
        let res = deposit(&mut f, &mut user, &mut ata, &mut foreign, 10);
        assert_eq!(res, Err(ProgramError::IllegalOwner));

        assert_eq!(amount_of(&ata), 5_000);
        assert_eq!(state::read_header(&f.slab.data).entered, 0);
    }

    #[test]
    fn test_forfeit_candidate_with_principal_rejected() {
        let mut f = setup();
        init_with_pool(&mut f, 10);
        let asset = f.asset_mint.key;
        let mut user = wallet();
        let mut ata = token_account(asset, user.key, 5_000);
        let mut stake = stake_account(&f, &user.key, 0);
        deposit(&mut f, &mut user, &mut ata, &mut stake, 1_000).unwrap();

        let user_key = user.key;
        let res = set_forfeit(&mut f, &user_key, &mut []);
        assert_eq!(res, Err(ProgramError::NotEnoughAccountKeys));

        let res = set_forfeit(&mut f, &user_key, core::slice::from_mut(&mut stake));
        assert_eq!(res, Err(AccrualError::EngineForfeitHasPrincipal.into()));
        assert_eq!(zc::engine_ref(&f.slab.data).unwrap().forfeit_account(), None);

        // A fresh address with no stake is accepted; the user can still leave.
        let sink = Pubkey::new_unique();
        let mut sink_stake = [TestAccount::new(
            accounts::derive_stake_address(&f.program_id, &f.slab.key, 0, &sink).0,
            system_program::id(),
            0,
            vec![],
        )];
        set_forfeit(&mut f, &sink, &mut sink_stake).unwrap();
        let mut forfeit_stake = stake_account(&f, &sink, 0);
        exit(&mut f, &mut user, &mut ata, &mut stake, &mut forfeit_stake).unwrap();
        assert_eq!(amount_of(&ata), 5_000);
    }

    #[test]
    fn test_realize_then_claim() {
        let mut f = setup();
        init_with_pool(&mut f, 10);
        let asset = f.asset_mint.key;
        let dist = f.dist_mint.key;
        let mut user = wallet();
        let mut ata = token_account(asset, user.key, 5_000);
        let mut user_dist = token_account(dist, user.key, 0);
        let mut stake = stake_account(&f, &user.key, 0);

        deposit(&mut f, &mut user, &mut ata, &mut stake, 1_000).unwrap();
        f.clock.data = make_clock(200);

        generate(&mut f, &encode_generate(0, 500, 200, 0, 0, 1_000)).unwrap();
        assert_eq!(amount_of(&f.reward_vault), 0);
        assert_eq!(amount_of(&f.paired_vault), 0);
        assert_eq!(amount_of(&f.admin_paired), 810);
        assert_eq!(amount_of(&f.dist_vault), 690);
        assert_eq!(amount_of(&f.pool_vault), 1_000);
        {
            let engine = zc::engine_ref(&f.slab.data).unwrap();
            let pool = engine.pool(0).unwrap();
            assert_eq!(pool.total_entitlement_accrued, 1_000);
            assert_eq!(pool.total_entitlement_realized, 500);
        }

        let leaf = ClaimLeaf {
            index: 0,
            claimant: user.key.to_bytes(),
            pool_id: 0,
            cumulative_asset: 300,
            cumulative_entitlement: 400,
        };
        let other = ClaimLeaf { index: 1, claimant: [9; 32], ..leaf };
        let tree = ClaimTree::build(&[leaf, other]).unwrap();
        let proof = tree.proof(0).unwrap();

        let res = claim(&mut f, &mut user, &mut user_dist, &mut stake, &encode_claim(&leaf, &proof));
        assert_eq!(res, Err(AccrualError::EngineClaimsDisabled.into()));

        set_root(&mut f, tree.root()).unwrap();
        claim(&mut f, &mut user, &mut user_dist, &mut stake, &encode_claim(&leaf, &proof)).unwrap();
        assert_eq!(amount_of(&user_dist), 300);
        assert_eq!(amount_of(&f.dist_vault), 390);
        {
            let engine = zc::engine_ref(&f.slab.data).unwrap();
            let pool = engine.pool(0).unwrap();
            assert_eq!(pool.total_entitlement_accrued, 600);
            assert_eq!(pool.total_entitlement_realized, 100);
        }
        let record = stake_of(&stake);
        assert_eq!(record.total_entitlement_unclaimed, 600);
        assert_eq!(record.total_claimed_asset, 300);

        let res = claim(&mut f, &mut user, &mut user_dist, &mut stake, &encode_claim(&leaf, &proof));
        assert_eq!(res, Err(AccrualError::EngineClaimNotIncreasing.into()));
        assert_eq!(state::read_header(&f.slab.data).entered, 0);
    }

    #[test]
    fn test_realizer_signed_only_by_realizer_authority() {
        let f = setup();
        let args = realizer::AddLiquidity {
            entitlement_qty: 500,
            paired_qty: 200,
            min_entitlement_qty: 0,
            min_paired_qty: 0,
            deadline: 1_000,
        };
        let ix = realizer::add_liquidity_instruction(
            &f.realizer.key,
            &f.realizer_pda.key,
            &f.reward_vault.key,
            &f.paired_vault.key,
            &f.dist_vault.key,
            &spl_token::ID,
            &[],
            &args,
        );
        let signers: Vec<Pubkey> = ix.accounts.iter().filter(|m| m.is_signer).map(|m| m.pubkey).collect();
        assert_eq!(signers, vec![f.realizer_pda.key]);
        assert!(ix.accounts.iter().all(|m| m.pubkey != f.vault_pda.key));
        assert!(ix.accounts.iter().all(|m| m.pubkey != f.pool_vault.key));
        assert_ne!(f.realizer_pda.key, f.vault_pda.key);
        assert_eq!(ix.data, args.encode().to_vec());
    }

    #[test]
    fn test_staging_vaults_belong_to_realizer_authority() {
        let mut f = setup();
        init_with_pool(&mut f, 10);
        let asset = f.asset_mint.key;
        let reward = f.reward_mint.key;
        let paired = f.paired_mint.key;
        let vault_pda = f.vault_pda.key;
        let mut user = wallet();
        let mut ata = token_account(asset, user.key, 5_000);
        let mut stake = stake_account(&f, &user.key, 0);
        deposit(&mut f, &mut user, &mut ata, &mut stake, 1_000).unwrap();
        f.clock.data = make_clock(200);

        let staged_reward = core::mem::replace(&mut f.reward_vault, token_account(reward, vault_pda, 0));
        let res = generate(&mut f, &encode_generate(0, 500, 200, 0, 0, 1_000));
        assert_eq!(res, Err(AccrualError::InvalidVault.into()));
        f.reward_vault = staged_reward;

        let staged_paired = core::mem::replace(&mut f.paired_vault, token_account(paired, vault_pda, 0));
        let res = generate(&mut f, &encode_generate(0, 500, 200, 0, 0, 1_000));
        assert_eq!(res, Err(AccrualError::InvalidVault.into()));
        f.paired_vault = staged_paired;

        let real_pda = core::mem::replace(&mut f.realizer_pda.key, vault_pda);
        let res = generate(&mut f, &encode_generate(0, 500, 200, 0, 0, 1_000));
        assert_eq!(res, Err(ProgramError::InvalidArgument));
        f.realizer_pda.key = real_pda;

        assert_eq!(amount_of(&f.pool_vault), 1_000);
        assert_eq!(amount_of(&f.admin_paired), 1_000);
        let engine = zc::engine_ref(&f.slab.data).unwrap();
        assert_eq!(engine.pool(0).unwrap().total_entitlement_realized, 0);
    }

    #[test]
    fn test_realization_slippage_aborts() {
        let mut f = setup();
        init_with_pool(&mut f, 10);
        let asset = f.asset_mint.key;
        let mut user = wallet();
        let mut ata = token_account(asset, user.key, 5_000);
        let mut stake = stake_account(&f, &user.key, 0);
        deposit(&mut f, &mut user, &mut ata, &mut stake, 1_000).unwrap();
        f.clock.data = make_clock(200);

        let res = generate(&mut f, &encode_generate(0, 500, 200, 0, 200, 1_000));
        assert_eq!(res, Err(AccrualError::EngineSlippageExceeded.into()));
        let engine = zc::engine_ref(&f.slab.data).unwrap();
        assert_eq!(engine.pool(0).unwrap().total_entitlement_realized, 0);

        let res = generate(&mut f, &encode_generate(0, 500, 200, 0, 0, 150));
        assert_eq!(res, Err(AccrualError::EngineDeadlineExpired.into()));

        let res = generate(&mut f, &encode_generate(0, 5_000, 200, 0, 0, 1_000));
        assert_eq!(res, Err(AccrualError::EngineInsufficientUnrealized.into()));
    }

    #[test]
    fn test_reentrancy_flag() {
        let mut f = setup();
        init_with_pool(&mut f, 10);
        let asset = f.asset_mint.key;
        let mut user = wallet();
        let mut ata = token_account(asset, user.key, 5_000);
        let mut stake = stake_account(&f, &user.key, 0);

        let mut header = state::read_header(&f.slab.data);
        header.entered = 1;
        state::write_header(&mut f.slab.data, &header);
        let res = deposit(&mut f, &mut user, &mut ata, &mut stake, 10);
        assert_eq!(res, Err(AccrualError::Reentrancy.into()));

        header.entered = 0;
        state::write_header(&mut f.slab.data, &header);
        let res = deposit(&mut f, &mut user, &mut ata, &mut stake, 0);
        assert_eq!(res, Err(AccrualError::EngineZeroAmount.into()));
        assert_eq!(state::read_header(&f.slab.data).entered, 0);
        assert_eq!(state::read_stake_header(&stake.data).magic, 0);
    }

    #[test]
    fn test_wrong_pool_vault_rejected() {
        let mut f = setup();
        init_with_pool(&mut f, 10);
        let asset = f.asset_mint.key;
        f.pool_vault = token_account(Pubkey::new_unique(), f.vault_pda.key, 0);
        let mut user = wallet();
        let mut ata = token_account(asset, user.key, 5_000);
        let mut stake = stake_account(&f, &user.key, 0);
        let res = deposit(&mut f, &mut user, &mut ata, &mut stake, 10);
        assert_eq!(res, Err(AccrualError::InvalidMint.into()));
    }

    #[test]
    fn test_error_codes_round_trip() {
        let err: ProgramError = AccrualError::EngineInvalidProof.into();
        let code = match err {
            ProgramError::Custom(c) => c,
            _ => panic!("expected custom error"),
        };
        assert_eq!(error::decode_custom(code), Some(AccrualError::EngineInvalidProof));
        assert_eq!(error::decode_custom(10_000), None);
    }
}
