//! StakeLedger: Single-file Solana program with embedded stake accounting engine.

#![no_std]
#![deny(unsafe_code)]

extern crate alloc;

pub mod engine;

#[cfg(not(feature = "no-entrypoint"))]
solana_security_txt::security_txt! {
    name: "StakeLedger",
    project_url: "https://github.com/stakeledger/stakeledger-prog",
    contacts: "email:security@stakeledger.dev",
    policy: "https://github.com/stakeledger/stakeledger-prog/blob/master/SECURITY.md"
}

// 1. mod constants
pub mod constants {
    use crate::engine::StakeEngine;
    use crate::state::LedgerConfig;
    use core::mem::{align_of, size_of};

    pub const MAGIC: u64 = 0x5354414b454c4544; // "STAKELED"
    pub const VERSION: u32 = 1;

    pub const HEADER_LEN: usize = 64;
    pub const CONFIG_LEN: usize = size_of::<LedgerConfig>();
    pub const ENGINE_ALIGN: usize = align_of::<StakeEngine>();

    pub const fn align_up(x: usize, a: usize) -> usize {
        (x + (a - 1)) & !(a - 1)
    }

    pub const ENGINE_OFF: usize = align_up(HEADER_LEN + CONFIG_LEN, ENGINE_ALIGN);
    pub const ENGINE_LEN: usize = size_of::<StakeEngine>();
    pub const SLAB_LEN: usize = ENGINE_OFF + ENGINE_LEN;

    /// CPI data handed to a flash-loan callback: borrower_idx + amount.
    pub const FLASH_CALLBACK_LEN: usize = 10;
}

// 2. mod zc (Zero-Copy unsafe island)
#[allow(unsafe_code)]
pub mod zc {
    use crate::constants::{ENGINE_ALIGN, ENGINE_LEN, ENGINE_OFF};
    use crate::engine::StakeEngine;
    use solana_program::program_error::ProgramError;

    #[inline]
    pub fn engine_ref<'a>(data: &'a [u8]) -> Result<&'a StakeEngine, ProgramError> {
        if data.len() < ENGINE_OFF + ENGINE_LEN {
            return Err(ProgramError::InvalidAccountData);
        }
        let ptr = unsafe { data.as_ptr().add(ENGINE_OFF) };
        if (ptr as usize) % ENGINE_ALIGN != 0 {
            return Err(ProgramError::InvalidAccountData);
        }
        Ok(unsafe { &*(ptr as *const StakeEngine) })
    }

    #[inline]
    pub fn engine_mut<'a>(data: &'a mut [u8]) -> Result<&'a mut StakeEngine, ProgramError> {
        if data.len() < ENGINE_OFF + ENGINE_LEN {
            return Err(ProgramError::InvalidAccountData);
        }
        let ptr = unsafe { data.as_mut_ptr().add(ENGINE_OFF) };
        if (ptr as usize) % ENGINE_ALIGN != 0 {
            return Err(ProgramError::InvalidAccountData);
        }
        Ok(unsafe { &mut *(ptr as *mut StakeEngine) })
    }

    #[inline]
    pub fn engine_write(data: &mut [u8], engine: StakeEngine) -> Result<(), ProgramError> {
        if data.len() < ENGINE_OFF + ENGINE_LEN {
            return Err(ProgramError::InvalidAccountData);
        }
        let ptr = unsafe { data.as_mut_ptr().add(ENGINE_OFF) };
        if (ptr as usize) % ENGINE_ALIGN != 0 {
            return Err(ProgramError::InvalidAccountData);
        }
        unsafe { core::ptr::write(ptr as *mut StakeEngine, engine) };
        Ok(())
    }
}

// 3. mod error
pub mod error {
    use crate::engine::StakeError;
    use num_derive::FromPrimitive;
    use solana_program::program_error::ProgramError;

    #[derive(Clone, Copy, Debug, Eq, PartialEq, FromPrimitive)]
    pub enum StakeLedgerError {
        InvalidMagic,
        InvalidVersion,
        AlreadyInitialized,
        NotInitialized,
        InvalidSlabLen,
        InvalidVaultAta,
        InvalidMint,
        ExpectedSigner,
        ExpectedWritable,
        // Engine errors mapped:
        EngineInsufficientBalance,
        EngineInsufficientAllowance,
        EngineBelowMinStake,
        EngineNoFreeSlot,
        EngineUnknownProtocol,
        EngineDuplicateRequest,
        EngineStillLocked,
        EngineWalletLocked,
        EngineSupplyCapExceeded,
        EngineExcessHaircut,
        EngineLastController,
        EngineUnauthorized,
        EngineReentrancy,
        EngineInvalidConfig,
        EngineOverflow,
        EngineLedgerFull,
        EngineWalletNotFound,
        EngineEmptyProtocol,
        EngineMembershipActive,
        EngineRepaymentMismatch,
    }

    impl From<StakeLedgerError> for ProgramError {
        fn from(e: StakeLedgerError) -> Self {
            ProgramError::Custom(e as u32)
        }
    }

    pub fn map_stake_error(e: StakeError) -> ProgramError {
        let err = match e {
            StakeError::InsufficientBalance => StakeLedgerError::EngineInsufficientBalance,
            StakeError::InsufficientAllowance => StakeLedgerError::EngineInsufficientAllowance,
            StakeError::BelowMinStake => StakeLedgerError::EngineBelowMinStake,
            StakeError::NoFreeSlot => StakeLedgerError::EngineNoFreeSlot,
            StakeError::UnknownProtocol => StakeLedgerError::EngineUnknownProtocol,
            StakeError::DuplicateRequest => StakeLedgerError::EngineDuplicateRequest,
            StakeError::StillLocked => StakeLedgerError::EngineStillLocked,
            StakeError::WalletLocked => StakeLedgerError::EngineWalletLocked,
            StakeError::SupplyCapExceeded => StakeLedgerError::EngineSupplyCapExceeded,
            StakeError::ExcessHaircut => StakeLedgerError::EngineExcessHaircut,
            StakeError::LastController => StakeLedgerError::EngineLastController,
            StakeError::Unauthorized => StakeLedgerError::EngineUnauthorized,
            StakeError::Reentrancy => StakeLedgerError::EngineReentrancy,
            StakeError::InvalidConfig => StakeLedgerError::EngineInvalidConfig,
            StakeError::Overflow => StakeLedgerError::EngineOverflow,
            StakeError::LedgerFull => StakeLedgerError::EngineLedgerFull,
            StakeError::WalletNotFound => StakeLedgerError::EngineWalletNotFound,
            StakeError::EmptyProtocol => StakeLedgerError::EngineEmptyProtocol,
            StakeError::MembershipActive => StakeLedgerError::EngineMembershipActive,
            StakeError::RepaymentMismatch => StakeLedgerError::EngineRepaymentMismatch,
        };
        ProgramError::Custom(err as u32)
    }
}

// 4. mod ix
pub mod ix {
    use arrayref::array_ref;
    use solana_program::{program_error::ProgramError, pubkey::Pubkey};

    use crate::engine::MAX_SLOTS;

    #[derive(Debug)]
    pub enum Instruction {
        InitLedger {
            supply_cap: u64,
            max_lock_window: u64,
            max_wallets: u64,
        },
        InitWallet,
        Deposit {
            wallet_idx: u16,
            amount: u64,
        },
        Withdraw {
            wallet_idx: u16,
            amount: u64,
        },
        Transfer {
            from_idx: u16,
            to_idx: u16,
            amount: u64,
        },
        CreateProtocol {
            lock_window: u64,
            min_stake: u64,
        },
        SetMinStake {
            pid: u64,
            min_stake: u64,
        },
        AddController {
            pid: u64,
            controller: Pubkey,
        },
        RemoveController {
            pid: u64,
            controller: Pubkey,
        },
        SwapController {
            pid: u64,
            old: Pubkey,
            new: Pubkey,
        },
        SetMembership {
            wallet_idx: u16,
            stay_mask: u8,
            add_list: [u64; MAX_SLOTS],
        },
        Harvest {
            wallet_idx: u16,
        },
        AddYield {
            pid: u64,
            wallet_idx: u16,
            amount: u64,
        },
        SignalHaircut {
            pid: u64,
            amount: u64,
        },
        CollectHaircut {
            pid: u64,
            to_idx: u16,
        },
        FlashLoan {
            borrower_idx: u16,
            amount: u64,
        },
        ApproveRepayment {
            wallet_idx: u16,
            amount: u64,
        },
    }

    impl Instruction {
        pub fn decode(input: &[u8]) -> Result<Self, ProgramError> {
            let (&tag, mut rest) = input
                .split_first()
                .ok_or(ProgramError::InvalidInstructionData)?;

            match tag {
                0 => {
                    let supply_cap = read_u64(&mut rest)?;
                    let max_lock_window = read_u64(&mut rest)?;
                    let max_wallets = read_u64(&mut rest)?;
                    Ok(Instruction::InitLedger {
                        supply_cap,
                        max_lock_window,
                        max_wallets,
                    })
                }
                1 => Ok(Instruction::InitWallet),
                2 => {
                    let wallet_idx = read_u16(&mut rest)?;
                    let amount = read_u64(&mut rest)?;
                    Ok(Instruction::Deposit { wallet_idx, amount })
                }
                3 => {
                    let wallet_idx = read_u16(&mut rest)?;
                    let amount = read_u64(&mut rest)?;
                    Ok(Instruction::Withdraw { wallet_idx, amount })
                }
                4 => {
                    let from_idx = read_u16(&mut rest)?;
                    let to_idx = read_u16(&mut rest)?;
                    let amount = read_u64(&mut rest)?;
                    Ok(Instruction::Transfer {
                        from_idx,
                        to_idx,
                        amount,
                    })
                }
                5 => {
                    let lock_window = read_u64(&mut rest)?;
                    let min_stake = read_u64(&mut rest)?;
                    Ok(Instruction::CreateProtocol {
                        lock_window,
                        min_stake,
                    })
                }
                6 => {
                    let pid = read_u64(&mut rest)?;
                    let min_stake = read_u64(&mut rest)?;
                    Ok(Instruction::SetMinStake { pid, min_stake })
                }
                7 => {
                    let pid = read_u64(&mut rest)?;
                    let controller = read_pubkey(&mut rest)?;
                    Ok(Instruction::AddController { pid, controller })
                }
                8 => {
                    let pid = read_u64(&mut rest)?;
                    let controller = read_pubkey(&mut rest)?;
                    Ok(Instruction::RemoveController { pid, controller })
                }
                9 => {
                    let pid = read_u64(&mut rest)?;
                    let old = read_pubkey(&mut rest)?;
                    let new = read_pubkey(&mut rest)?;
                    Ok(Instruction::SwapController { pid, old, new })
                }
                10 => {
                    let wallet_idx = read_u16(&mut rest)?;
                    let stay_mask = read_u8(&mut rest)?;
                    let mut add_list = [0u64; MAX_SLOTS];
                    for entry in add_list.iter_mut() {
                        *entry = read_u64(&mut rest)?;
                    }
                    Ok(Instruction::SetMembership {
                        wallet_idx,
                        stay_mask,
                        add_list,
                    })
                }
                11 => {
                    let wallet_idx = read_u16(&mut rest)?;
                    Ok(Instruction::Harvest { wallet_idx })
                }
                12 => {
                    let pid = read_u64(&mut rest)?;
                    let wallet_idx = read_u16(&mut rest)?;
                    let amount = read_u64(&mut rest)?;
                    Ok(Instruction::AddYield {
                        pid,
                        wallet_idx,
                        amount,
                    })
                }
                13 => {
                    let pid = read_u64(&mut rest)?;
                    let amount = read_u64(&mut rest)?;
                    Ok(Instruction::SignalHaircut { pid, amount })
                }
                14 => {
                    let pid = read_u64(&mut rest)?;
                    let to_idx = read_u16(&mut rest)?;
                    Ok(Instruction::CollectHaircut { pid, to_idx })
                }
                15 => {
                    let borrower_idx = read_u16(&mut rest)?;
                    let amount = read_u64(&mut rest)?;
                    Ok(Instruction::FlashLoan {
                        borrower_idx,
                        amount,
                    })
                }
                16 => {
                    let wallet_idx = read_u16(&mut rest)?;
                    let amount = read_u64(&mut rest)?;
                    Ok(Instruction::ApproveRepayment { wallet_idx, amount })
                }
                _ => Err(ProgramError::InvalidInstructionData),
            }
        }
    }

    fn read_u8(input: &mut &[u8]) -> Result<u8, ProgramError> {
        let (&val, rest) = input
            .split_first()
            .ok_or(ProgramError::InvalidInstructionData)?;
        *input = rest;
        Ok(val)
    }

    fn read_u16(input: &mut &[u8]) -> Result<u16, ProgramError> {
        if input.len() < 2 {
            return Err(ProgramError::InvalidInstructionData);
        }
        let (bytes, rest) = input.split_at(2);
        *input = rest;
        Ok(u16::from_le_bytes(*array_ref![bytes, 0, 2]))
    }

    fn read_u64(input: &mut &[u8]) -> Result<u64, ProgramError> {
        if input.len() < 8 {
            return Err(ProgramError::InvalidInstructionData);
        }
        let (bytes, rest) = input.split_at(8);
        *input = rest;
        Ok(u64::from_le_bytes(*array_ref![bytes, 0, 8]))
    }

    fn read_pubkey(input: &mut &[u8]) -> Result<Pubkey, ProgramError> {
        if input.len() < 32 {
            return Err(ProgramError::InvalidInstructionData);
        }
        let (bytes, rest) = input.split_at(32);
        *input = rest;
        Ok(Pubkey::new_from_array(*array_ref![bytes, 0, 32]))
    }
}

// 5. mod accounts
pub mod accounts {
    use crate::error::StakeLedgerError;
    use solana_program::{account_info::AccountInfo, program_error::ProgramError, pubkey::Pubkey};

    pub fn expect_len(accounts: &[AccountInfo], n: usize) -> Result<(), ProgramError> {
        if accounts.len() < n {
            return Err(ProgramError::NotEnoughAccountKeys);
        }
        Ok(())
    }

    pub fn expect_signer(ai: &AccountInfo) -> Result<(), ProgramError> {
        if !ai.is_signer {
            return Err(StakeLedgerError::ExpectedSigner.into());
        }
        Ok(())
    }

    pub fn expect_writable(ai: &AccountInfo) -> Result<(), ProgramError> {
        if !ai.is_writable {
            return Err(StakeLedgerError::ExpectedWritable.into());
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
        if ai.key != expected {
            return Err(ProgramError::InvalidArgument);
        }
        Ok(())
    }

    pub fn derive_vault_authority(program_id: &Pubkey, slab_key: &Pubkey) -> (Pubkey, u8) {
        Pubkey::find_program_address(&[b"vault", slab_key.as_ref()], program_id)
    }
}

// 6. mod state
pub mod state {
    use crate::constants::{CONFIG_LEN, HEADER_LEN};
    use bytemuck::{Pod, Zeroable};
    use core::cell::RefMut;
    use solana_program::account_info::AccountInfo;
    use solana_program::program_error::ProgramError;

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct SlabHeader {
        pub magic: u64,
        pub version: u32,
        pub bump: u8,
        pub _padding: [u8; 3],
        pub admin: [u8; 32],
        pub _reserved: [u8; 16],
    }

    /// Host-level keys for the reserve asset backing the ledger.
    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct LedgerConfig {
        pub reserve_mint: [u8; 32],
        pub vault_pubkey: [u8; 32],
        pub vault_authority_bump: u8,
        pub _padding: [u8; 7],
    }

    pub fn slab_data_mut<'a, 'b>(
        ai: &'b AccountInfo<'a>,
    ) -> Result<RefMut<'b, &'a mut [u8]>, ProgramError> {
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

    pub fn read_config(data: &[u8]) -> LedgerConfig {
        let mut c = LedgerConfig::zeroed();
        let src = &data[HEADER_LEN..HEADER_LEN + CONFIG_LEN];
        let dst = bytemuck::bytes_of_mut(&mut c);
        dst.copy_from_slice(src);
        c
    }

    pub fn write_config(data: &mut [u8], c: &LedgerConfig) {
        let src = bytemuck::bytes_of(c);
        let dst = &mut data[HEADER_LEN..HEADER_LEN + CONFIG_LEN];
        dst.copy_from_slice(src);
    }
}

// 7. mod reserve (SPL vault moves for deposit/withdraw)
pub mod reserve {
    use solana_program::{account_info::AccountInfo, program_error::ProgramError};

    #[cfg(not(test))]
    use solana_program::program::{invoke, invoke_signed};

    #[cfg(test)]
    use solana_program::program_pack::Pack;
    #[cfg(test)]
    use spl_token::state::Account as TokenAccount;

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
            invoke(
                &ix,
                &[
                    source.clone(),
                    dest.clone(),
                    _authority.clone(),
                    _token_program.clone(),
                ],
            )
        }
        #[cfg(test)]
        {
            let mut src_data = source.try_borrow_mut_data()?;
            let mut src_state = TokenAccount::unpack(&src_data)?;
            src_state.amount = src_state
                .amount
                .checked_sub(amount)
                .ok_or(ProgramError::InsufficientFunds)?;
            TokenAccount::pack(src_state, &mut src_data)?;

            let mut dst_data = dest.try_borrow_mut_data()?;
            let mut dst_state = TokenAccount::unpack(&dst_data)?;
            dst_state.amount = dst_state
                .amount
                .checked_add(amount)
                .ok_or(ProgramError::InvalidAccountData)?;
            TokenAccount::pack(dst_state, &mut dst_data)?;
            Ok(())
        }
    }

    pub fn release<'a>(
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
            invoke_signed(
                &ix,
                &[
                    source.clone(),
                    dest.clone(),
                    _authority.clone(),
                    _token_program.clone(),
                ],
                _signer_seeds,
            )
        }
        #[cfg(test)]
        {
            let mut src_data = source.try_borrow_mut_data()?;
            let mut src_state = TokenAccount::unpack(&src_data)?;
            src_state.amount = src_state
                .amount
                .checked_sub(amount)
                .ok_or(ProgramError::InsufficientFunds)?;
            TokenAccount::pack(src_state, &mut src_data)?;

            let mut dst_data = dest.try_borrow_mut_data()?;
            let mut dst_state = TokenAccount::unpack(&dst_data)?;
            dst_state.amount = dst_state
                .amount
                .checked_add(amount)
                .ok_or(ProgramError::InvalidAccountData)?;
            TokenAccount::pack(dst_state, &mut dst_data)?;
            Ok(())
        }
    }
}

// 8. mod events (off-chain notifications via the program log)
pub mod events {
    use crate::engine::{HarvestOutcome, MembershipOutcome};
    use alloc::format;
    use solana_program::msg;

    pub fn wallet_initialized(idx: u16) {
        msg!("wallet {} initialized", idx);
    }

    pub fn credited(idx: u16, amount: u64) {
        msg!("wallet {} credited {}", idx, amount);
    }

    pub fn debited(idx: u16, amount: u64) {
        msg!("wallet {} debited {}", idx, amount);
    }

    pub fn transferred(from: u16, to: u16, amount: u64) {
        msg!("transfer {} -> {}: {}", from, to, amount);
    }

    pub fn protocol_created(pid: u64, lock_window: u64, min_stake: u64) {
        msg!(
            "protocol {} created: lock_window={} min_stake={}",
            pid,
            lock_window,
            min_stake
        );
    }

    pub fn protocol_configured(pid: u64) {
        msg!("protocol {} configuration changed", pid);
    }

    pub fn membership_changed(idx: u16, outcome: &MembershipOutcome) {
        if outcome.left_mask != 0 {
            msg!("wallet {} left slots {:#010b}", idx, outcome.left_mask);
        }
        if outcome.joined_mask != 0 {
            msg!("wallet {} joined slots {:#010b}", idx, outcome.joined_mask);
        }
    }

    pub fn harvested(idx: u16, outcome: &HarvestOutcome) {
        if outcome.yield_paid > 0 {
            msg!("yield {} paid to wallet {}", outcome.yield_paid, idx);
        }
        if outcome.haircut_burned > 0 {
            msg!("haircut {} burned from wallet {}", outcome.haircut_burned, idx);
        }
    }

    pub fn yield_added(pid: u64, amount: u64) {
        msg!("yield {} added to protocol {}", amount, pid);
    }

    pub fn haircut_signaled(pid: u64, amount: u64) {
        msg!("haircut {} signaled on protocol {}", amount, pid);
    }

    pub fn haircut_collected(pid: u64, to: u16, amount: u64) {
        msg!("haircut {} collected from protocol {} to wallet {}", amount, pid, to);
    }

    pub fn flash_loaned(idx: u16, amount: u64) {
        msg!("flash loan {} to wallet {} repaid", amount, idx);
    }
}

// 9. mod processor
pub mod processor {
    use crate::{
        accounts,
        constants::{FLASH_CALLBACK_LEN, MAGIC, SLAB_LEN, VERSION},
        engine::{FlashGuard, StakeEngine},
        error::{map_stake_error, StakeLedgerError},
        events,
        ix::Instruction,
        reserve,
        state::{self, LedgerConfig, SlabHeader},
        zc,
    };
    use solana_program::{
        account_info::AccountInfo,
        entrypoint::ProgramResult,
        instruction::{AccountMeta, Instruction as SolInstruction},
        program_error::ProgramError,
        program_pack::Pack,
        pubkey::Pubkey,
        sysvar::{clock::Clock, Sysvar},
    };

    #[cfg(not(test))]
    use solana_program::program::invoke;

    fn slab_guard(program_id: &Pubkey, slab: &AccountInfo, data: &[u8]) -> Result<(), ProgramError> {
        accounts::expect_owner(slab, program_id)?;
        if data.len() != SLAB_LEN {
            return Err(StakeLedgerError::InvalidSlabLen.into());
        }
        Ok(())
    }

    fn require_initialized(data: &[u8]) -> Result<(), ProgramError> {
        let h = state::read_header(data);
        if h.magic != MAGIC {
            return Err(StakeLedgerError::NotInitialized.into());
        }
        if h.version != VERSION {
            return Err(StakeLedgerError::InvalidVersion.into());
        }
        Ok(())
    }

    fn require_owner(
        engine: &StakeEngine,
        idx: u16,
        signer: &Pubkey,
    ) -> Result<(), ProgramError> {
        if !engine.is_used(idx as usize) {
            return Err(StakeLedgerError::EngineWalletNotFound.into());
        }
        if Pubkey::new_from_array(engine.wallets[idx as usize].owner) != *signer {
            return Err(StakeLedgerError::EngineUnauthorized.into());
        }
        Ok(())
    }

    fn verify_vault(
        a_vault: &AccountInfo,
        expected_owner: &Pubkey,
        expected_mint: &Pubkey,
        expected_pubkey: &Pubkey,
    ) -> Result<(), ProgramError> {
        if a_vault.key != expected_pubkey {
            return Err(StakeLedgerError::InvalidVaultAta.into());
        }
        if a_vault.owner != &spl_token::ID {
            return Err(StakeLedgerError::InvalidVaultAta.into());
        }
        if a_vault.data_len() != spl_token::state::Account::LEN {
            return Err(StakeLedgerError::InvalidVaultAta.into());
        }

        let data = a_vault.try_borrow_data()?;
        let tok = spl_token::state::Account::unpack(&data)?;
        if tok.mint != *expected_mint {
            return Err(StakeLedgerError::InvalidMint.into());
        }
        if tok.owner != *expected_owner {
            return Err(StakeLedgerError::InvalidVaultAta.into());
        }
        Ok(())
    }

    pub fn process_instruction<'a, 'b>(
        program_id: &Pubkey,
        accounts: &'b [AccountInfo<'a>],
        instruction_data: &[u8],
    ) -> ProgramResult {
        let instruction = Instruction::decode(instruction_data)?;

        match instruction {
            Instruction::InitLedger {
                supply_cap,
                max_lock_window,
                max_wallets,
            } => {
                accounts::expect_len(accounts, 4)?;
                let a_admin = &accounts[0];
                let a_slab = &accounts[1];
                let a_mint = &accounts[2];
                let a_vault = &accounts[3];

                accounts::expect_signer(a_admin)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;

                let _ = zc::engine_mut(&mut data)?;

                let header = state::read_header(&data);
                if header.magic == MAGIC {
                    return Err(StakeLedgerError::AlreadyInitialized.into());
                }

                let (auth, bump) = accounts::derive_vault_authority(program_id, a_slab.key);
                verify_vault(a_vault, &auth, a_mint.key, a_vault.key)?;

                for b in data.iter_mut() {
                    *b = 0;
                }

                let engine = StakeEngine::new(crate::engine::LedgerParams {
                    supply_cap,
                    max_lock_window,
                    max_wallets,
                });
                zc::engine_write(&mut data, engine)?;

                let config = LedgerConfig {
                    reserve_mint: a_mint.key.to_bytes(),
                    vault_pubkey: a_vault.key.to_bytes(),
                    vault_authority_bump: bump,
                    _padding: [0; 7],
                };
                state::write_config(&mut data, &config);

                let new_header = SlabHeader {
                    magic: MAGIC,
                    version: VERSION,
                    bump,
                    _padding: [0; 3],
                    admin: a_admin.key.to_bytes(),
                    _reserved: [0; 16],
                };
                state::write_header(&mut data, &new_header);
            }
            Instruction::InitWallet => {
                accounts::expect_len(accounts, 2)?;
                let a_owner = &accounts[0];
                let a_slab = &accounts[1];

                accounts::expect_signer(a_owner)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;

                let engine = zc::engine_mut(&mut data)?;
                let idx = engine
                    .add_wallet(a_owner.key.to_bytes())
                    .map_err(map_stake_error)?;
                events::wallet_initialized(idx);
            }
            Instruction::Deposit { wallet_idx, amount } => {
                accounts::expect_len(accounts, 5)?;
                let a_owner = &accounts[0];
                let a_slab = &accounts[1];
                let a_owner_ata = &accounts[2];
                let a_vault = &accounts[3];
                let a_token = &accounts[4];

                accounts::expect_signer(a_owner)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                let config = state::read_config(&data);

                let (auth, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                verify_vault(
                    a_vault,
                    &auth,
                    &Pubkey::new_from_array(config.reserve_mint),
                    &Pubkey::new_from_array(config.vault_pubkey),
                )?;

                let engine = zc::engine_mut(&mut data)?;
                require_owner(engine, wallet_idx, a_owner.key)?;

                reserve::deposit(a_token, a_owner_ata, a_vault, a_owner, amount)?;
                engine.mint(wallet_idx, amount).map_err(map_stake_error)?;
                events::credited(wallet_idx, amount);
            }
            Instruction::Withdraw { wallet_idx, amount } => {
                accounts::expect_len(accounts, 7)?;
                let a_owner = &accounts[0];
                let a_slab = &accounts[1];
                let a_vault = &accounts[2];
                let a_owner_ata = &accounts[3];
                let a_vault_pda = &accounts[4];
                let a_token = &accounts[5];
                let a_clock = &accounts[6];

                accounts::expect_signer(a_owner)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                let config = state::read_config(&data);

                let (derived_pda, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                accounts::expect_key(a_vault_pda, &derived_pda)?;
                verify_vault(
                    a_vault,
                    &derived_pda,
                    &Pubkey::new_from_array(config.reserve_mint),
                    &Pubkey::new_from_array(config.vault_pubkey),
                )?;

                let engine = zc::engine_mut(&mut data)?;
                require_owner(engine, wallet_idx, a_owner.key)?;

                let clock = Clock::from_account_info(a_clock)?;
                engine
                    .burn(wallet_idx, amount, clock.slot)
                    .map_err(map_stake_error)?;
                events::debited(wallet_idx, amount);

                let seed1: &[u8] = b"vault";
                let seed2: &[u8] = a_slab.key.as_ref();
                let bump_arr: [u8; 1] = [config.vault_authority_bump];
                let seed3: &[u8] = &bump_arr;
                let seeds: [&[u8]; 3] = [seed1, seed2, seed3];
                let signer_seeds: [&[&[u8]]; 1] = [&seeds];

                reserve::release(a_token, a_vault, a_owner_ata, a_vault_pda, amount, &signer_seeds)?;
            }
            Instruction::Transfer {
                from_idx,
                to_idx,
                amount,
            } => {
                accounts::expect_len(accounts, 3)?;
                let a_owner = &accounts[0];
                let a_slab = &accounts[1];
                let a_clock = &accounts[2];

                accounts::expect_signer(a_owner)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;

                let engine = zc::engine_mut(&mut data)?;
                require_owner(engine, from_idx, a_owner.key)?;
                if !engine.is_used(to_idx as usize) {
                    return Err(StakeLedgerError::EngineWalletNotFound.into());
                }

                let clock = Clock::from_account_info(a_clock)?;
                engine
                    .transfer(from_idx, to_idx, amount, clock.slot)
                    .map_err(map_stake_error)?;
                events::transferred(from_idx, to_idx, amount);
            }
            Instruction::CreateProtocol {
                lock_window,
                min_stake,
            } => {
                accounts::expect_len(accounts, 2)?;
                let a_controller = &accounts[0];
                let a_slab = &accounts[1];

                accounts::expect_signer(a_controller)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;

                let engine = zc::engine_mut(&mut data)?;
                let pid = engine
                    .create_protocol(a_controller.key.to_bytes(), lock_window, min_stake)
                    .map_err(map_stake_error)?;
                events::protocol_created(pid, lock_window, min_stake);
            }
            Instruction::SetMinStake { pid, min_stake } => {
                accounts::expect_len(accounts, 2)?;
                let a_controller = &accounts[0];
                let a_slab = &accounts[1];

                accounts::expect_signer(a_controller)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;

                let engine = zc::engine_mut(&mut data)?;
                engine
                    .set_min_stake(pid, &a_controller.key.to_bytes(), min_stake)
                    .map_err(map_stake_error)?;
                events::protocol_configured(pid);
            }
            Instruction::AddController { pid, controller } => {
                accounts::expect_len(accounts, 2)?;
                let a_controller = &accounts[0];
                let a_slab = &accounts[1];

                accounts::expect_signer(a_controller)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;

                let engine = zc::engine_mut(&mut data)?;
                engine
                    .add_controller(pid, &a_controller.key.to_bytes(), controller.to_bytes())
                    .map_err(map_stake_error)?;
                events::protocol_configured(pid);
            }
            Instruction::RemoveController { pid, controller } => {
                accounts::expect_len(accounts, 2)?;
                let a_controller = &accounts[0];
                let a_slab = &accounts[1];

                accounts::expect_signer(a_controller)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;

                let engine = zc::engine_mut(&mut data)?;
                engine
                    .remove_controller(pid, &a_controller.key.to_bytes(), controller.to_bytes())
                    .map_err(map_stake_error)?;
                events::protocol_configured(pid);
            }
            Instruction::SwapController { pid, old, new } => {
                accounts::expect_len(accounts, 2)?;
                let a_controller = &accounts[0];
                let a_slab = &accounts[1];

                accounts::expect_signer(a_controller)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;

                let engine = zc::engine_mut(&mut data)?;
                engine
                    .swap_controller(
                        pid,
                        &a_controller.key.to_bytes(),
                        old.to_bytes(),
                        new.to_bytes(),
                    )
                    .map_err(map_stake_error)?;
                events::protocol_configured(pid);
            }
            Instruction::SetMembership {
                wallet_idx,
                stay_mask,
                add_list,
            } => {
                accounts::expect_len(accounts, 3)?;
                let a_owner = &accounts[0];
                let a_slab = &accounts[1];
                let a_clock = &accounts[2];

                accounts::expect_signer(a_owner)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;

                let engine = zc::engine_mut(&mut data)?;
                require_owner(engine, wallet_idx, a_owner.key)?;

                let clock = Clock::from_account_info(a_clock)?;
                let outcome = engine
                    .set_membership(wallet_idx, &add_list, stay_mask, clock.slot)
                    .map_err(map_stake_error)?;
                events::membership_changed(wallet_idx, &outcome);
            }
            Instruction::Harvest { wallet_idx } => {
                accounts::expect_len(accounts, 2)?;
                let a_caller = &accounts[0];
                let a_slab = &accounts[1];

                // Anyone may harvest any wallet; only the caller's signature
                // is demanded, not the wallet owner's.
                accounts::expect_signer(a_caller)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;

                let engine = zc::engine_mut(&mut data)?;
                let outcome = engine.harvest(wallet_idx).map_err(map_stake_error)?;
                events::harvested(wallet_idx, &outcome);
            }
            Instruction::AddYield {
                pid,
                wallet_idx,
                amount,
            } => {
                accounts::expect_len(accounts, 3)?;
                let a_owner = &accounts[0];
                let a_slab = &accounts[1];
                let a_clock = &accounts[2];

                accounts::expect_signer(a_owner)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;

                let engine = zc::engine_mut(&mut data)?;
                require_owner(engine, wallet_idx, a_owner.key)?;

                let clock = Clock::from_account_info(a_clock)?;
                engine
                    .add_yield(pid, wallet_idx, amount, clock.slot)
                    .map_err(map_stake_error)?;
                events::yield_added(pid, amount);
            }
            Instruction::SignalHaircut { pid, amount } => {
                accounts::expect_len(accounts, 2)?;
                let a_controller = &accounts[0];
                let a_slab = &accounts[1];

                accounts::expect_signer(a_controller)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;

                let engine = zc::engine_mut(&mut data)?;
                engine
                    .signal_haircut(pid, &a_controller.key.to_bytes(), amount)
                    .map_err(map_stake_error)?;
                events::haircut_signaled(pid, amount);
            }
            Instruction::CollectHaircut { pid, to_idx } => {
                accounts::expect_len(accounts, 2)?;
                let a_controller = &accounts[0];
                let a_slab = &accounts[1];

                accounts::expect_signer(a_controller)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;

                let engine = zc::engine_mut(&mut data)?;
                let amount = engine
                    .collect_haircut(pid, &a_controller.key.to_bytes(), to_idx)
                    .map_err(map_stake_error)?;
                events::haircut_collected(pid, to_idx, amount);
            }
            Instruction::FlashLoan {
                borrower_idx,
                amount,
            } => {
                accounts::expect_len(accounts, 3)?;
                let a_borrower = &accounts[0];
                let a_slab = &accounts[1];
                let a_callback = &accounts[2];

                accounts::expect_signer(a_borrower)?;
                accounts::expect_writable(a_slab)?;

                let guard: FlashGuard;
                {
                    let mut data = state::slab_data_mut(a_slab)?;
                    slab_guard(program_id, a_slab, &data)?;
                    require_initialized(&data)?;

                    let engine = zc::engine_mut(&mut data)?;
                    require_owner(engine, borrower_idx, a_borrower.key)?;
                    guard = engine
                        .flash_begin(borrower_idx, amount)
                        .map_err(map_stake_error)?;
                    // Borrow ends here; the callback needs the slab.
                }

                let mut cpi_data = alloc::vec::Vec::with_capacity(FLASH_CALLBACK_LEN);
                cpi_data.extend_from_slice(&borrower_idx.to_le_bytes());
                cpi_data.extend_from_slice(&amount.to_le_bytes());

                let mut metas = alloc::vec![
                    AccountMeta::new(*a_slab.key, false),
                    AccountMeta::new_readonly(*a_borrower.key, true),
                ];
                for acc in accounts.iter().skip(3) {
                    metas.push(if acc.is_writable {
                        AccountMeta::new(*acc.key, acc.is_signer)
                    } else {
                        AccountMeta::new_readonly(*acc.key, acc.is_signer)
                    });
                }

                let ix = SolInstruction {
                    program_id: *a_callback.key,
                    accounts: metas,
                    data: cpi_data,
                };

                let mut cpi_infos: alloc::vec::Vec<AccountInfo> =
                    alloc::vec::Vec::with_capacity(2 + accounts.len().saturating_sub(3));
                cpi_infos.push(a_slab.clone());
                cpi_infos.push(a_borrower.clone());
                for acc in accounts.iter().skip(3) {
                    cpi_infos.push(acc.clone());
                }

                #[cfg(not(test))]
                invoke(&ix, &cpi_infos)?;
                #[cfg(test)]
                let _ = (ix, cpi_infos);

                {
                    let mut data = state::slab_data_mut(a_slab)?;
                    let engine = zc::engine_mut(&mut data)?;
                    engine
                        .flash_settle(borrower_idx, amount, guard)
                        .map_err(map_stake_error)?;
                }
                events::flash_loaned(borrower_idx, amount);
            }
            Instruction::ApproveRepayment { wallet_idx, amount } => {
                accounts::expect_len(accounts, 2)?;
                let a_owner = &accounts[0];
                let a_slab = &accounts[1];

                accounts::expect_signer(a_owner)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;

                // Deliberately not latched: this is the one operation a
                // flash borrower's callback is allowed to reach.
                let engine = zc::engine_mut(&mut data)?;
                require_owner(engine, wallet_idx, a_owner.key)?;
                engine
                    .approve_repayment(wallet_idx, amount)
                    .map_err(map_stake_error)?;
            }
        }
        Ok(())
    }
}

// 10. mod entrypoint
pub mod entrypoint {
    use crate::processor;
    use solana_program::{
        account_info::AccountInfo, entrypoint, entrypoint::ProgramResult, pubkey::Pubkey,
    };

    entrypoint!(process_instruction);

    fn process_instruction<'a>(
        program_id: &Pubkey,
        accounts: &'a [AccountInfo<'a>],
        instruction_data: &[u8],
    ) -> ProgramResult {
        processor::process_instruction(program_id, accounts, instruction_data)
    }
}
