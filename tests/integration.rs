//! Integration tests for the program wrapper.
//!
//! These drive `process_instruction` end to end with in-memory accounts and
//! assert on the engine state inside the slab. SPL token moves go through
//! the host CPI stubs here, so token account balances are not asserted;
//! the engine's own supply accounting is.

use solana_program::{account_info::AccountInfo, program_pack::Pack, pubkey::Pubkey};
use spl_token::state::{Account as TokenAccount, AccountState};
use stakeledger_prog::{
    constants::{MAGIC, SLAB_LEN},
    error::StakeLedgerError,
    processor::process_instruction,
    state, zc,
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
        Self {
            key,
            owner,
            lamports,
            data,
            is_signer: false,
            is_writable: false,
        }
    }
    fn signer(mut self) -> Self {
        self.is_signer = true;
        self
    }
    fn writable(mut self) -> Self {
        self.is_writable = true;
        self
    }

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

/// Clock sysvar data: five fixed-width little-endian fields.
fn make_clock(slot: u64) -> Vec<u8> {
    let mut data = vec![0u8; 40];
    data[0..8].copy_from_slice(&slot.to_le_bytes());
    data
}

struct LedgerFixture {
    program_id: Pubkey,
    admin: TestAccount,
    slab: TestAccount,
    mint: TestAccount,
    vault: TestAccount,
    token_prog: TestAccount,
    clock: TestAccount,
    vault_pda: Pubkey,
}

fn setup_ledger() -> LedgerFixture {
    let program_id = Pubkey::new_unique();
    let slab_key = Pubkey::new_unique();
    let (vault_pda, _) = Pubkey::find_program_address(&[b"vault", slab_key.as_ref()], &program_id);
    let mint_key = Pubkey::new_unique();

    LedgerFixture {
        program_id,
        admin: TestAccount::new(
            Pubkey::new_unique(),
            solana_program::system_program::id(),
            0,
            vec![],
        )
        .signer(),
        slab: TestAccount::new(slab_key, program_id, 0, vec![0u8; SLAB_LEN]).writable(),
        mint: TestAccount::new(mint_key, solana_program::system_program::id(), 0, vec![]),
        vault: TestAccount::new(
            Pubkey::new_unique(),
            spl_token::ID,
            0,
            make_token_account(mint_key, vault_pda, 0),
        )
        .writable(),
        token_prog: TestAccount::new(spl_token::ID, Pubkey::default(), 0, vec![]),
        clock: TestAccount::new(
            solana_program::sysvar::clock::id(),
            solana_program::sysvar::id(),
            0,
            make_clock(100),
        ),
        vault_pda,
    }
}

fn user_account() -> TestAccount {
    TestAccount::new(
        Pubkey::new_unique(),
        solana_program::system_program::id(),
        0,
        vec![],
    )
    .signer()
}

// --- Encoders ---

fn encode_u8(val: u8, buf: &mut Vec<u8>) {
    buf.push(val);
}
fn encode_u16(val: u16, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&val.to_le_bytes());
}
fn encode_u64(val: u64, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&val.to_le_bytes());
}

fn encode_init_ledger(supply_cap: u64, max_lock_window: u64, max_wallets: u64) -> Vec<u8> {
    let mut data = vec![0u8];
    encode_u64(supply_cap, &mut data);
    encode_u64(max_lock_window, &mut data);
    encode_u64(max_wallets, &mut data);
    data
}

fn encode_deposit(wallet_idx: u16, amount: u64) -> Vec<u8> {
    let mut data = vec![2u8];
    encode_u16(wallet_idx, &mut data);
    encode_u64(amount, &mut data);
    data
}

fn encode_withdraw(wallet_idx: u16, amount: u64) -> Vec<u8> {
    let mut data = vec![3u8];
    encode_u16(wallet_idx, &mut data);
    encode_u64(amount, &mut data);
    data
}

fn encode_transfer(from_idx: u16, to_idx: u16, amount: u64) -> Vec<u8> {
    let mut data = vec![4u8];
    encode_u16(from_idx, &mut data);
    encode_u16(to_idx, &mut data);
    encode_u64(amount, &mut data);
    data
}

fn encode_create_protocol(lock_window: u64, min_stake: u64) -> Vec<u8> {
    let mut data = vec![5u8];
    encode_u64(lock_window, &mut data);
    encode_u64(min_stake, &mut data);
    data
}

fn encode_set_membership(wallet_idx: u16, stay_mask: u8, add_list: &[u64]) -> Vec<u8> {
    let mut data = vec![10u8];
    encode_u16(wallet_idx, &mut data);
    encode_u8(stay_mask, &mut data);
    for slot in 0..8 {
        encode_u64(add_list.get(slot).copied().unwrap_or(0), &mut data);
    }
    data
}

fn encode_harvest(wallet_idx: u16) -> Vec<u8> {
    let mut data = vec![11u8];
    encode_u16(wallet_idx, &mut data);
    data
}

fn encode_add_yield(pid: u64, wallet_idx: u16, amount: u64) -> Vec<u8> {
    let mut data = vec![12u8];
    encode_u64(pid, &mut data);
    encode_u16(wallet_idx, &mut data);
    encode_u64(amount, &mut data);
    data
}

fn encode_signal_haircut(pid: u64, amount: u64) -> Vec<u8> {
    let mut data = vec![13u8];
    encode_u64(pid, &mut data);
    encode_u64(amount, &mut data);
    data
}

fn encode_collect_haircut(pid: u64, to_idx: u16) -> Vec<u8> {
    let mut data = vec![14u8];
    encode_u64(pid, &mut data);
    encode_u16(to_idx, &mut data);
    data
}

fn encode_flash_loan(borrower_idx: u16, amount: u64) -> Vec<u8> {
    let mut data = vec![15u8];
    encode_u16(borrower_idx, &mut data);
    encode_u64(amount, &mut data);
    data
}

// --- Flow helpers ---

fn init_ledger(f: &mut LedgerFixture) {
    let data = encode_init_ledger(u64::MAX, 1_000_000, 64);
    let accs = vec![
        f.admin.to_info(),
        f.slab.to_info(),
        f.mint.to_info(),
        f.vault.to_info(),
    ];
    process_instruction(&f.program_id, &accs, &data).unwrap();
}

fn init_wallet(f: &mut LedgerFixture, owner: &mut TestAccount) -> u16 {
    {
        let accs = vec![owner.to_info(), f.slab.to_info()];
        process_instruction(&f.program_id, &accs, &[1u8]).unwrap();
    }
    let engine = zc::engine_ref(&f.slab.data).unwrap();
    (engine.num_wallets - 1) as u16
}

fn deposit(f: &mut LedgerFixture, owner: &mut TestAccount, ata: &mut TestAccount, idx: u16, amount: u64) {
    let accs = vec![
        owner.to_info(),
        f.slab.to_info(),
        ata.to_info(),
        f.vault.to_info(),
        f.token_prog.to_info(),
    ];
    process_instruction(&f.program_id, &accs, &encode_deposit(idx, amount)).unwrap();
}

// --- Tests ---

#[test]
fn test_full_stake_lifecycle() {
    let mut f = setup_ledger();
    init_ledger(&mut f);
    assert_eq!(state::read_header(&f.slab.data).magic, MAGIC);

    let mut user = user_account();
    let mut user_ata = TestAccount::new(
        Pubkey::new_unique(),
        spl_token::ID,
        0,
        make_token_account(f.mint.key, user.key, 10_000),
    )
    .writable();
    let mut funder = user_account();
    let mut funder_ata = TestAccount::new(
        Pubkey::new_unique(),
        spl_token::ID,
        0,
        make_token_account(f.mint.key, funder.key, 10_000),
    )
    .writable();
    let mut controller = user_account();

    let user_idx = init_wallet(&mut f, &mut user);
    let funder_idx = init_wallet(&mut f, &mut funder);
    deposit(&mut f, &mut user, &mut user_ata, user_idx, 1_000);
    deposit(&mut f, &mut funder, &mut funder_ata, funder_idx, 500);

    // Create a protocol controlled by `controller`.
    {
        let accs = vec![controller.to_info(), f.slab.to_info()];
        process_instruction(&f.program_id, &accs, &encode_create_protocol(0, 0)).unwrap();
    }
    let pid = {
        let engine = zc::engine_ref(&f.slab.data).unwrap();
        assert_eq!(engine.protocol_count, 1);
        1u64
    };

    // User stakes everything into the protocol.
    {
        let accs = vec![user.to_info(), f.slab.to_info(), f.clock.to_info()];
        process_instruction(
            &f.program_id,
            &accs,
            &encode_set_membership(user_idx, 0xFF, &[pid]),
        )
        .unwrap();
    }
    {
        let engine = zc::engine_ref(&f.slab.data).unwrap();
        assert_eq!(engine.protocol(pid).unwrap().in_bal.get(), 1_000);
    }

    // Funder seeds the yield reserve.
    {
        let accs = vec![funder.to_info(), f.slab.to_info(), f.clock.to_info()];
        process_instruction(
            &f.program_id,
            &accs,
            &encode_add_yield(pid, funder_idx, 100),
        )
        .unwrap();
    }

    // Anyone can harvest the staker.
    {
        let mut stranger = user_account();
        let accs = vec![stranger.to_info(), f.slab.to_info()];
        process_instruction(&f.program_id, &accs, &encode_harvest(user_idx)).unwrap();
    }
    {
        let engine = zc::engine_ref(&f.slab.data).unwrap();
        assert_eq!(engine.wallets[user_idx as usize].balance, 1_100);
        assert_eq!(engine.protocol(pid).unwrap().reserve, 0);
    }

    // Controller signals a write-down, the next harvest realizes it.
    {
        let accs = vec![controller.to_info(), f.slab.to_info()];
        process_instruction(&f.program_id, &accs, &encode_signal_haircut(pid, 400)).unwrap();
    }
    {
        let mut stranger = user_account();
        let accs = vec![stranger.to_info(), f.slab.to_info()];
        process_instruction(&f.program_id, &accs, &encode_harvest(user_idx)).unwrap();
    }
    {
        let engine = zc::engine_ref(&f.slab.data).unwrap();
        assert_eq!(engine.wallets[user_idx as usize].balance, 700);
        assert_eq!(engine.protocol(pid).unwrap().burned.get(), 400);
        assert_eq!(engine.total_supply, 1_100);
        assert!(engine.check_conservation());
    }

    // Controller collects the burned value.
    {
        let accs = vec![controller.to_info(), f.slab.to_info()];
        process_instruction(
            &f.program_id,
            &accs,
            &encode_collect_haircut(pid, funder_idx),
        )
        .unwrap();
    }
    {
        let engine = zc::engine_ref(&f.slab.data).unwrap();
        assert_eq!(engine.wallets[funder_idx as usize].balance, 800);
        assert_eq!(engine.total_supply, 1_500);
        assert!(engine.check_conservation());
    }

    // Unlocked staker can withdraw; the stake follows the balance down.
    {
        let mut vault_pda_account =
            TestAccount::new(f.vault_pda, solana_program::system_program::id(), 0, vec![]);
        let accs = vec![
            user.to_info(),
            f.slab.to_info(),
            f.vault.to_info(),
            user_ata.to_info(),
            vault_pda_account.to_info(),
            f.token_prog.to_info(),
            f.clock.to_info(),
        ];
        process_instruction(&f.program_id, &accs, &encode_withdraw(user_idx, 200)).unwrap();
    }
    {
        let engine = zc::engine_ref(&f.slab.data).unwrap();
        assert_eq!(engine.wallets[user_idx as usize].balance, 500);
        assert_eq!(engine.member(user_idx, 0).unwrap().stake, 500);
        assert_eq!(engine.protocol(pid).unwrap().in_bal.get(), 500);
        assert!(engine.check_conservation());
    }
}

#[test]
fn test_requires_initialization() {
    let mut f = setup_ledger();
    let mut user = user_account();
    let accs = vec![user.to_info(), f.slab.to_info()];
    let res = process_instruction(&f.program_id, &accs, &[1u8]);
    assert_eq!(res, Err(StakeLedgerError::NotInitialized.into()));
}

#[test]
fn test_rejects_wrong_slab_length() {
    let mut f = setup_ledger();
    f.slab.data = vec![0u8; SLAB_LEN - 1];
    let data = encode_init_ledger(u64::MAX, 1_000_000, 64);
    let accs = vec![
        f.admin.to_info(),
        f.slab.to_info(),
        f.mint.to_info(),
        f.vault.to_info(),
    ];
    let res = process_instruction(&f.program_id, &accs, &data);
    assert_eq!(res, Err(StakeLedgerError::InvalidSlabLen.into()));
}

#[test]
fn test_controller_gating() {
    let mut f = setup_ledger();
    init_ledger(&mut f);
    let mut controller = user_account();
    {
        let accs = vec![controller.to_info(), f.slab.to_info()];
        process_instruction(&f.program_id, &accs, &encode_create_protocol(0, 0)).unwrap();
    }

    let mut outsider = user_account();
    let accs = vec![outsider.to_info(), f.slab.to_info()];
    let res = process_instruction(&f.program_id, &accs, &encode_signal_haircut(1, 10));
    assert_eq!(res, Err(StakeLedgerError::EngineUnauthorized.into()));
}

#[test]
fn test_transfer_between_wallets() {
    let mut f = setup_ledger();
    init_ledger(&mut f);

    let mut a = user_account();
    let mut a_ata = TestAccount::new(
        Pubkey::new_unique(),
        spl_token::ID,
        0,
        make_token_account(f.mint.key, a.key, 1_000),
    )
    .writable();
    let mut b = user_account();

    let a_idx = init_wallet(&mut f, &mut a);
    let b_idx = init_wallet(&mut f, &mut b);
    deposit(&mut f, &mut a, &mut a_ata, a_idx, 1_000);

    {
        let accs = vec![a.to_info(), f.slab.to_info(), f.clock.to_info()];
        process_instruction(&f.program_id, &accs, &encode_transfer(a_idx, b_idx, 300)).unwrap();
    }
    {
        let engine = zc::engine_ref(&f.slab.data).unwrap();
        assert_eq!(engine.wallets[a_idx as usize].balance, 700);
        assert_eq!(engine.wallets[b_idx as usize].balance, 300);
    }

    // Only the source owner may move funds.
    {
        let accs = vec![b.to_info(), f.slab.to_info(), f.clock.to_info()];
        let res = process_instruction(&f.program_id, &accs, &encode_transfer(a_idx, b_idx, 1));
        assert_eq!(res, Err(StakeLedgerError::EngineUnauthorized.into()));
    }
}

#[test]
fn test_membership_errors_surface_as_program_errors() {
    let mut f = setup_ledger();
    init_ledger(&mut f);

    let mut user = user_account();
    let user_idx = init_wallet(&mut f, &mut user);

    let accs = vec![user.to_info(), f.slab.to_info(), f.clock.to_info()];
    let res = process_instruction(
        &f.program_id,
        &accs,
        &encode_set_membership(user_idx, 0xFF, &[42]),
    );
    assert_eq!(res, Err(StakeLedgerError::EngineUnknownProtocol.into()));
}

#[test]
fn test_flash_loan_rejects_enrolled_borrower() {
    let mut f = setup_ledger();
    init_ledger(&mut f);

    let mut user = user_account();
    let mut user_ata = TestAccount::new(
        Pubkey::new_unique(),
        spl_token::ID,
        0,
        make_token_account(f.mint.key, user.key, 1_000),
    )
    .writable();
    let user_idx = init_wallet(&mut f, &mut user);
    deposit(&mut f, &mut user, &mut user_ata, user_idx, 1_000);

    let mut controller = user_account();
    {
        let accs = vec![controller.to_info(), f.slab.to_info()];
        process_instruction(&f.program_id, &accs, &encode_create_protocol(0, 0)).unwrap();
    }
    {
        let accs = vec![user.to_info(), f.slab.to_info(), f.clock.to_info()];
        process_instruction(
            &f.program_id,
            &accs,
            &encode_set_membership(user_idx, 0xFF, &[1]),
        )
        .unwrap();
    }

    let mut callback = TestAccount::new(Pubkey::new_unique(), Pubkey::default(), 0, vec![]);
    let accs = vec![user.to_info(), f.slab.to_info(), callback.to_info()];
    let res = process_instruction(&f.program_id, &accs, &encode_flash_loan(user_idx, 100));
    assert_eq!(res, Err(StakeLedgerError::EngineMembershipActive.into()));
}
