//! Stake accounting engine: a fungible balance ledger in which every wallet
//! can enroll in up to eight independent protocols, each able to distribute
//! pooled yield to its stakers and to impose proportional haircuts on them
//! without iterating stakers.
//!
//! Settlement is lazy: nothing touches a wallet's memberships until the
//! wallet is harvested, and every balance-affecting operation harvests
//! first. A harvest walks the wallet's active slots, pays owed yield from
//! the protocol's reserve, applies pending haircuts via snapshot deltas,
//! and re-anchors the snapshots, all in O(8).
//!
//! All state lives in one contiguous `#[repr(C)]` slab suitable for a
//! single program account. Member and snapshot records are arena-allocated
//! with stack-shaped free lists so membership churn never grows storage.

// MAX_WALLETS is feature-configured, not target-configured, so x86 and SBF
// builds agree on slab sizes for a given feature set.
#[cfg(feature = "test")]
pub const MAX_WALLETS: usize = 64;

#[cfg(not(feature = "test"))]
pub const MAX_WALLETS: usize = 256;

#[cfg(feature = "test")]
pub const MAX_PROTOCOLS: usize = 16;

#[cfg(not(feature = "test"))]
pub const MAX_PROTOCOLS: usize = 64;

/// Membership slots per wallet. The slot mask is a u8; this cannot grow
/// without widening the mask.
pub const MAX_SLOTS: usize = 8;

/// Controllers per protocol (1-of-N authority).
pub const MAX_CONTROLLERS: usize = 8;

/// Arena capacity: one member and one snapshot per occupied slot, plus the
/// reserved null handle at index 0.
pub const RECORD_CAP: usize = MAX_WALLETS * MAX_SLOTS + 1;

/// Null arena handle. Handle 0 is never allocated.
pub const NO_RECORD: u32 = 0;

// ============================================================================
// BPF-Safe 128-bit Type
// ============================================================================
//
// Rust 1.77/1.78 changed u128 alignment from 8 to 16 bytes on x86_64, but
// SBF still uses 8-byte alignment. Aggregates are stored as [u64; 2] so the
// slab layout is identical on both targets.

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct U128([u64; 2]);

impl U128 {
    pub const ZERO: Self = Self([0, 0]);

    #[inline(always)]
    pub const fn new(val: u128) -> Self {
        Self([val as u64, (val >> 64) as u64])
    }

    #[inline(always)]
    pub const fn get(self) -> u128 {
        (self.0[0] as u128) | ((self.0[1] as u128) << 64)
    }

    #[inline(always)]
    pub fn set(&mut self, val: u128) {
        self.0[0] = val as u64;
        self.0[1] = (val >> 64) as u64;
    }

    #[inline(always)]
    pub fn checked_add(self, rhs: u128) -> Option<Self> {
        self.get().checked_add(rhs).map(Self::new)
    }

    #[inline(always)]
    pub fn checked_sub(self, rhs: u128) -> Option<Self> {
        self.get().checked_sub(rhs).map(Self::new)
    }

    #[inline(always)]
    pub fn saturating_add(self, rhs: u128) -> Self {
        Self::new(self.get().saturating_add(rhs))
    }

    #[inline(always)]
    pub fn saturating_sub(self, rhs: u128) -> Self {
        Self::new(self.get().saturating_sub(rhs))
    }

    #[inline(always)]
    pub fn is_zero(self) -> bool {
        self.0[0] == 0 && self.0[1] == 0
    }

    /// Low 64 bits (for layout tests).
    #[inline(always)]
    pub const fn lo(self) -> u64 {
        self.0[0]
    }

    /// High 64 bits (for layout tests).
    #[inline(always)]
    pub const fn hi(self) -> u64 {
        self.0[1]
    }
}

impl Default for U128 {
    fn default() -> Self {
        Self::ZERO
    }
}

impl core::fmt::Debug for U128 {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.get())
    }
}

impl core::fmt::Display for U128 {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.get())
    }
}

impl From<u128> for U128 {
    fn from(v: u128) -> Self {
        Self::new(v)
    }
}

impl From<u64> for U128 {
    fn from(v: u64) -> Self {
        Self::new(v as u128)
    }
}

impl From<U128> for u128 {
    fn from(v: U128) -> Self {
        v.get()
    }
}

impl PartialOrd for U128 {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for U128 {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.get().cmp(&other.get())
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StakeError {
    /// Balance too low for the requested debit
    InsufficientBalance,

    /// Flash repayment allowance below the loaned amount
    InsufficientAllowance,

    /// Wallet balance below the protocol's minimum stake
    BelowMinStake,

    /// All eight membership slots are occupied
    NoFreeSlot,

    /// Protocol id out of range
    UnknownProtocol,

    /// Protocol requested twice in one membership update
    DuplicateRequest,

    /// Membership lock window has not elapsed
    StillLocked,

    /// Wallet holds at least one still-locked membership
    WalletLocked,

    /// Mint would push total supply past the cap
    SupplyCapExceeded,

    /// Signaled haircuts would exceed the staked-in balance
    ExcessHaircut,

    /// Removing the controller would empty the set
    LastController,

    /// Caller is not a controller of the protocol
    Unauthorized,

    /// A state-mutating call re-entered the engine
    Reentrancy,

    /// Rejected protocol or controller configuration
    InvalidConfig,

    /// Arithmetic overflow
    Overflow,

    /// Wallet or protocol table is full
    LedgerFull,

    /// Wallet index out of range
    WalletNotFound,

    /// Yield added to a protocol with no staked balance
    EmptyProtocol,

    /// Flash borrower still holds active memberships
    MembershipActive,

    /// Flash repayment did not restore the pre-loan balance exactly
    RepaymentMismatch,
}

pub type Result<T> = core::result::Result<T, StakeError>;

// ============================================================================
// Records
// ============================================================================

/// Engine parameters, fixed at initialization.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LedgerParams {
    /// Hard ceiling on total supply
    pub supply_cap: u64,

    /// Hard ceiling on a protocol's lock window
    pub max_lock_window: u64,

    /// Logical wallet cap (may be below the slab capacity)
    pub max_wallets: u64,
}

/// One wallet's ledger entry. Created on first touch, never recycled:
/// a zero-balance wallet is valid and inert.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Wallet {
    /// Owner pubkey (signature checks done by wrapper)
    pub owner: [u8; 32],

    /// Live fungible balance
    pub balance: u64,

    /// Flash-loan repayment allowance granted to the ledger
    pub repay_allowance: u64,

    /// Bit s set <=> members[s] holds a live membership
    pub slot_mask: u8,

    pub _padding: [u8; 7],

    /// Member arena handles per slot (NO_RECORD = empty)
    pub members: [u32; MAX_SLOTS],
}

impl Wallet {
    pub const EMPTY: Self = Self {
        owner: [0; 32],
        balance: 0,
        repay_allowance: 0,
        slot_mask: 0,
        _padding: [0; 7],
        members: [NO_RECORD; MAX_SLOTS],
    };

    /// True while any membership slot is occupied.
    pub fn has_memberships(&self) -> bool {
        self.slot_mask != 0
    }
}

/// One wallet's participation in one protocol. Exists exactly while the
/// wallet is enrolled; recycled on leave.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Member {
    pub protocol_id: u64,

    /// Snapshot arena handle
    pub snapshot: u32,

    pub _padding: u32,

    /// Earliest time the membership may be dissolved
    pub unlock_at: u64,

    /// The wallet's stake as of its last harvest
    pub stake: u64,
}

impl Member {
    pub const EMPTY: Self = Self {
        protocol_id: 0,
        snapshot: NO_RECORD,
        _padding: 0,
        unlock_at: 0,
        stake: 0,
    };
}

/// Protocol aggregates as of the wallet's last harvest. The delta between
/// the live protocol and this record is what a harvest settles.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Snapshot {
    /// Protocol in_bal at last harvest
    pub in_start: U128,

    /// Protocol out_bal at last harvest
    pub out_start: U128,

    /// Protocol y_acc at last harvest (Q64.64)
    pub y_start: U128,

    /// Protocol minimum stake at join time
    pub join_min: u64,

    pub _padding: u64,
}

impl Snapshot {
    pub const EMPTY: Self = Self {
        in_start: U128::ZERO,
        out_start: U128::ZERO,
        y_start: U128::ZERO,
        join_min: 0,
        _padding: 0,
    };
}

/// A yield/haircut pool wallets can stake into.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Protocol {
    /// 1-of-N authority set (zero key = empty slot)
    pub controllers: [[u8; 32]; MAX_CONTROLLERS],

    pub controller_count: u8,

    pub _padding: [u8; 7],

    /// Minimum wallet balance required to join
    pub min_stake: u64,

    /// Lock window applied to each join
    pub lock_window: u64,

    /// Sum of all current members' stake
    pub in_bal: U128,

    /// Cumulative haircut signaled
    pub out_bal: U128,

    /// Cumulative tokens actually burned from stakers
    pub burned: U128,

    /// Of `burned`, how much has been re-minted to controllers
    pub collected: U128,

    /// Cumulative yield per unit stake (Q64.64)
    pub y_acc: U128,

    /// Deposited yield not yet paid out
    pub reserve: u64,

    pub _padding2: u64,
}

impl Protocol {
    pub const EMPTY: Self = Self {
        controllers: [[0; 32]; MAX_CONTROLLERS],
        controller_count: 0,
        _padding: [0; 7],
        min_stake: 0,
        lock_window: 0,
        in_bal: U128::ZERO,
        out_bal: U128::ZERO,
        burned: U128::ZERO,
        collected: U128::ZERO,
        y_acc: U128::ZERO,
        reserve: 0,
        _padding2: 0,
    };

    pub fn is_controller(&self, key: &[u8; 32]) -> bool {
        self.controllers[..self.controller_count as usize].contains(key)
    }
}

// ============================================================================
// Arenas
// ============================================================================
//
// Stack-shaped free lists: recycled handles plus parallel is-free flags that
// guard against double release. Handle 0 is the null sentinel and is never
// handed out; fresh handles come from a high-water mark.

#[repr(C)]
#[derive(Clone, PartialEq, Eq)]
pub struct MemberPool {
    /// High-water mark; valid handles are 1..=top
    pub top: u32,

    /// Depth of the free stack
    pub free_len: u32,

    pub free: [u32; RECORD_CAP],

    pub is_free: [u8; RECORD_CAP],

    pub slots: [Member; RECORD_CAP],
}

impl MemberPool {
    pub const EMPTY: Self = Self {
        top: 0,
        free_len: 0,
        free: [NO_RECORD; RECORD_CAP],
        is_free: [0; RECORD_CAP],
        slots: [Member::EMPTY; RECORD_CAP],
    };

    fn allocate(&mut self) -> Result<u32> {
        if self.free_len > 0 {
            self.free_len -= 1;
            let id = self.free[self.free_len as usize];
            self.is_free[id as usize] = 0;
            return Ok(id);
        }
        if (self.top as usize) + 1 >= RECORD_CAP {
            return Err(StakeError::LedgerFull);
        }
        self.top += 1;
        Ok(self.top)
    }

    fn recycle(&mut self, id: u32) {
        if id == NO_RECORD || self.is_free[id as usize] != 0 {
            return;
        }
        self.slots[id as usize] = Member::EMPTY;
        self.is_free[id as usize] = 1;
        self.free[self.free_len as usize] = id;
        self.free_len += 1;
    }
}

#[repr(C)]
#[derive(Clone, PartialEq, Eq)]
pub struct SnapshotPool {
    pub top: u32,

    pub free_len: u32,

    pub free: [u32; RECORD_CAP],

    pub is_free: [u8; RECORD_CAP],

    pub slots: [Snapshot; RECORD_CAP],
}

impl SnapshotPool {
    pub const EMPTY: Self = Self {
        top: 0,
        free_len: 0,
        free: [NO_RECORD; RECORD_CAP],
        is_free: [0; RECORD_CAP],
        slots: [Snapshot::EMPTY; RECORD_CAP],
    };

    fn allocate(&mut self) -> Result<u32> {
        if self.free_len > 0 {
            self.free_len -= 1;
            let id = self.free[self.free_len as usize];
            self.is_free[id as usize] = 0;
            return Ok(id);
        }
        if (self.top as usize) + 1 >= RECORD_CAP {
            return Err(StakeError::LedgerFull);
        }
        self.top += 1;
        Ok(self.top)
    }

    fn recycle(&mut self, id: u32) {
        if id == NO_RECORD || self.is_free[id as usize] != 0 {
            return;
        }
        self.slots[id as usize] = Snapshot::EMPTY;
        self.is_free[id as usize] = 1;
        self.free[self.free_len as usize] = id;
        self.free_len += 1;
    }
}

// ============================================================================
// Outcomes
// ============================================================================

/// What a harvest settled, for the wrapper's notifications.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HarvestOutcome {
    /// Yield credited to the wallet across all slots
    pub yield_paid: u64,

    /// Haircut burned from the wallet across all slots
    pub haircut_burned: u64,
}

/// Which slots a membership update joined and left.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MembershipOutcome {
    pub joined_mask: u8,
    pub left_mask: u8,
}

/// Pre-loan state captured by `flash_begin` and verified by `flash_settle`.
/// The wrapper holds this across the borrower callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlashGuard {
    pub pre_balance: u64,
    pub pre_allowance: u64,
}

// ============================================================================
// Engine
// ============================================================================

/// The whole ledger: wallet slab, protocol table, record arenas, totals.
/// `#[repr(C)]`, allocation-free, fits one program account.
#[repr(C)]
#[derive(Clone, PartialEq, Eq)]
pub struct StakeEngine {
    pub params: LedgerParams,

    /// Global total supply; conservation holds against balances + reserves
    pub total_supply: u64,

    /// Number of protocols created. Ids are 1..=protocol_count; 0 is the
    /// "no protocol" sentinel, so table slot 0 is never used.
    pub protocol_count: u64,

    /// Number of wallet slots in use (wallets are never recycled)
    pub num_wallets: u16,

    /// Single-entry reentrancy latch
    pub latch: u8,

    pub _padding: [u8; 5],

    pub wallets: [Wallet; MAX_WALLETS],

    pub protocols: [Protocol; MAX_PROTOCOLS],

    pub members: MemberPool,

    pub snapshots: SnapshotPool,
}

#[derive(Clone, Copy)]
enum Flow {
    Credit,
    Debit,
}

impl StakeEngine {
    pub fn new(params: LedgerParams) -> Self {
        Self {
            params,
            total_supply: 0,
            protocol_count: 0,
            num_wallets: 0,
            latch: 0,
            _padding: [0; 5],
            wallets: [Wallet::EMPTY; MAX_WALLETS],
            protocols: [Protocol::EMPTY; MAX_PROTOCOLS],
            members: MemberPool::EMPTY,
            snapshots: SnapshotPool::EMPTY,
        }
    }

    // ========================================
    // Latch
    // ========================================

    fn enter(&mut self) -> Result<()> {
        if self.latch != 0 {
            return Err(StakeError::Reentrancy);
        }
        self.latch = 1;
        Ok(())
    }

    fn exit(&mut self) {
        self.latch = 0;
    }

    // ========================================
    // Lookups
    // ========================================

    pub fn is_used(&self, idx: usize) -> bool {
        idx < self.num_wallets as usize
    }

    fn expect_wallet(&self, idx: u16) -> Result<()> {
        if !self.is_used(idx as usize) {
            return Err(StakeError::WalletNotFound);
        }
        Ok(())
    }

    pub fn wallet(&self, idx: u16) -> Result<&Wallet> {
        self.expect_wallet(idx)?;
        Ok(&self.wallets[idx as usize])
    }

    pub fn protocol(&self, pid: u64) -> Result<&Protocol> {
        if pid == 0 || pid > self.protocol_count {
            return Err(StakeError::UnknownProtocol);
        }
        Ok(&self.protocols[pid as usize])
    }

    /// Active protocol ids per slot (0 where empty) plus the slot mask.
    pub fn memberships(&self, idx: u16) -> Result<([u64; MAX_SLOTS], u8)> {
        let w = self.wallet(idx)?;
        let mut pids = [0u64; MAX_SLOTS];
        for (s, pid) in pids.iter_mut().enumerate() {
            let handle = w.members[s];
            if handle != NO_RECORD {
                *pid = self.members.slots[handle as usize].protocol_id;
            }
        }
        Ok((pids, w.slot_mask))
    }

    /// Member record for one occupied slot.
    pub fn member(&self, idx: u16, slot: usize) -> Option<&Member> {
        if !self.is_used(idx as usize) || slot >= MAX_SLOTS {
            return None;
        }
        let handle = self.wallets[idx as usize].members[slot];
        if handle == NO_RECORD {
            return None;
        }
        Some(&self.members.slots[handle as usize])
    }

    /// Snapshot record backing one occupied slot.
    pub fn snapshot(&self, idx: u16, slot: usize) -> Option<&Snapshot> {
        let m = self.member(idx, slot)?;
        Some(&self.snapshots.slots[m.snapshot as usize])
    }

    /// Free-list depths (member pool, snapshot pool), for diagnostics.
    pub fn free_list_depths(&self) -> (u32, u32) {
        (self.members.free_len, self.snapshots.free_len)
    }

    // ========================================
    // Wallet Management
    // ========================================

    /// Allocate a wallet slot for `owner`. Wallets are never recycled.
    pub fn add_wallet(&mut self, owner: [u8; 32]) -> Result<u16> {
        self.enter()?;
        let res = self.add_wallet_inner(owner);
        self.exit();
        res
    }

    fn add_wallet_inner(&mut self, owner: [u8; 32]) -> Result<u16> {
        let idx = self.num_wallets;
        if idx as usize >= MAX_WALLETS || (idx as u64) >= self.params.max_wallets {
            return Err(StakeError::LedgerFull);
        }
        self.num_wallets += 1;
        let w = &mut self.wallets[idx as usize];
        *w = Wallet::EMPTY;
        w.owner = owner;
        Ok(idx)
    }

    /// Grant the ledger a flash repayment allowance. Deliberately outside
    /// the latch: a flash borrower grants this mid-callback, and it touches
    /// nothing but the caller's own allowance field.
    pub fn approve_repayment(&mut self, idx: u16, amount: u64) -> Result<()> {
        self.expect_wallet(idx)?;
        self.wallets[idx as usize].repay_allowance = amount;
        Ok(())
    }

    // ========================================
    // Protocol Registry
    // ========================================

    pub fn create_protocol(
        &mut self,
        controller: [u8; 32],
        lock_window: u64,
        min_stake: u64,
    ) -> Result<u64> {
        self.enter()?;
        let res = self.create_protocol_inner(controller, lock_window, min_stake);
        self.exit();
        res
    }

    fn create_protocol_inner(
        &mut self,
        controller: [u8; 32],
        lock_window: u64,
        min_stake: u64,
    ) -> Result<u64> {
        if controller == [0; 32] || lock_window > self.params.max_lock_window {
            return Err(StakeError::InvalidConfig);
        }
        let pid = self.protocol_count + 1;
        if pid as usize >= MAX_PROTOCOLS {
            return Err(StakeError::LedgerFull);
        }
        let p = &mut self.protocols[pid as usize];
        *p = Protocol::EMPTY;
        p.controllers[0] = controller;
        p.controller_count = 1;
        p.min_stake = min_stake;
        p.lock_window = lock_window;
        self.protocol_count = pid;
        Ok(pid)
    }

    fn require_controller(&self, pid: u64, caller: &[u8; 32]) -> Result<()> {
        let p = self.protocol(pid)?;
        if !p.is_controller(caller) {
            return Err(StakeError::Unauthorized);
        }
        Ok(())
    }

    pub fn set_min_stake(&mut self, pid: u64, caller: &[u8; 32], min_stake: u64) -> Result<()> {
        self.enter()?;
        let res = self.set_min_stake_inner(pid, caller, min_stake);
        self.exit();
        res
    }

    fn set_min_stake_inner(&mut self, pid: u64, caller: &[u8; 32], min_stake: u64) -> Result<()> {
        self.require_controller(pid, caller)?;
        self.protocols[pid as usize].min_stake = min_stake;
        Ok(())
    }

    pub fn add_controller(&mut self, pid: u64, caller: &[u8; 32], new: [u8; 32]) -> Result<()> {
        self.enter()?;
        let res = self.add_controller_inner(pid, caller, new);
        self.exit();
        res
    }

    fn add_controller_inner(&mut self, pid: u64, caller: &[u8; 32], new: [u8; 32]) -> Result<()> {
        self.require_controller(pid, caller)?;
        if new == [0; 32] {
            return Err(StakeError::InvalidConfig);
        }
        let p = &mut self.protocols[pid as usize];
        if p.is_controller(&new) {
            return Err(StakeError::DuplicateRequest);
        }
        if p.controller_count as usize >= MAX_CONTROLLERS {
            return Err(StakeError::NoFreeSlot);
        }
        p.controllers[p.controller_count as usize] = new;
        p.controller_count += 1;
        Ok(())
    }

    pub fn remove_controller(&mut self, pid: u64, caller: &[u8; 32], target: [u8; 32]) -> Result<()> {
        self.enter()?;
        let res = self.remove_controller_inner(pid, caller, target);
        self.exit();
        res
    }

    fn remove_controller_inner(
        &mut self,
        pid: u64,
        caller: &[u8; 32],
        target: [u8; 32],
    ) -> Result<()> {
        self.require_controller(pid, caller)?;
        let p = &mut self.protocols[pid as usize];
        if p.controller_count == 1 {
            return Err(StakeError::LastController);
        }
        let n = p.controller_count as usize;
        let pos = p.controllers[..n]
            .iter()
            .position(|c| *c == target)
            .ok_or(StakeError::InvalidConfig)?;
        // Swap-remove keeps the live prefix dense.
        p.controllers[pos] = p.controllers[n - 1];
        p.controllers[n - 1] = [0; 32];
        p.controller_count -= 1;
        Ok(())
    }

    pub fn swap_controller(
        &mut self,
        pid: u64,
        caller: &[u8; 32],
        old: [u8; 32],
        new: [u8; 32],
    ) -> Result<()> {
        self.enter()?;
        let res = self.swap_controller_inner(pid, caller, old, new);
        self.exit();
        res
    }

    fn swap_controller_inner(
        &mut self,
        pid: u64,
        caller: &[u8; 32],
        old: [u8; 32],
        new: [u8; 32],
    ) -> Result<()> {
        self.require_controller(pid, caller)?;
        if new == [0; 32] {
            return Err(StakeError::InvalidConfig);
        }
        let p = &mut self.protocols[pid as usize];
        if p.is_controller(&new) {
            return Err(StakeError::DuplicateRequest);
        }
        let n = p.controller_count as usize;
        let pos = p.controllers[..n]
            .iter()
            .position(|c| *c == old)
            .ok_or(StakeError::InvalidConfig)?;
        p.controllers[pos] = new;
        Ok(())
    }

    /// Reserve a future write-down against the protocol's stakers. No
    /// individual stake is touched until each staker's next harvest.
    pub fn signal_haircut(&mut self, pid: u64, caller: &[u8; 32], amount: u64) -> Result<()> {
        self.enter()?;
        let res = self.signal_haircut_inner(pid, caller, amount);
        self.exit();
        res
    }

    fn signal_haircut_inner(&mut self, pid: u64, caller: &[u8; 32], amount: u64) -> Result<()> {
        self.require_controller(pid, caller)?;
        let p = &mut self.protocols[pid as usize];
        let next = p
            .out_bal
            .checked_add(amount as u128)
            .ok_or(StakeError::Overflow)?;
        if next.get() > p.in_bal.get() {
            return Err(StakeError::ExcessHaircut);
        }
        p.out_bal = next;
        Ok(())
    }

    /// Re-mint haircut proceeds already burned from stakers. Pays exactly
    /// `burned - collected` to the target wallet.
    pub fn collect_haircut(&mut self, pid: u64, caller: &[u8; 32], to: u16) -> Result<u64> {
        self.enter()?;
        let res = self.collect_haircut_inner(pid, caller, to);
        self.exit();
        res
    }

    fn collect_haircut_inner(&mut self, pid: u64, caller: &[u8; 32], to: u16) -> Result<u64> {
        self.require_controller(pid, caller)?;
        self.expect_wallet(to)?;
        self.harvest_inner(to)?;
        let p = &self.protocols[pid as usize];
        let owed = p.burned.get() - p.collected.get();
        let headroom = (self.params.supply_cap - self.total_supply) as u128;
        if owed > headroom {
            return Err(StakeError::SupplyCapExceeded);
        }
        let owed = owed as u64;
        if owed > 0 {
            self.credit(to, owed, None)?;
            self.total_supply += owed;
            let p = &mut self.protocols[pid as usize];
            p.collected = p.burned;
        }
        Ok(owed)
    }

    /// Deposit yield into the protocol's reserve and advance the per-stake
    /// accumulator. O(1) regardless of staker count: each staker settles its
    /// share lazily at harvest.
    pub fn add_yield(&mut self, pid: u64, caller: u16, amount: u64, now: u64) -> Result<()> {
        self.enter()?;
        let res = self.add_yield_inner(pid, caller, amount, now);
        self.exit();
        res
    }

    fn add_yield_inner(&mut self, pid: u64, caller: u16, amount: u64, now: u64) -> Result<()> {
        self.protocol(pid)?;
        self.expect_wallet(caller)?;
        self.harvest_inner(caller)?;
        self.require_unlocked(caller, now)?;
        if self.wallets[caller as usize].balance < amount {
            return Err(StakeError::InsufficientBalance);
        }
        // The debit below shrinks in_bal when the caller itself stakes in
        // this protocol; the accumulator must divide by the post-debit value.
        let caller_stake_here = if self.member_of(caller, pid).is_some() {
            amount as u128
        } else {
            0
        };
        let in_bal = self.protocols[pid as usize]
            .in_bal
            .get()
            .saturating_sub(caller_stake_here);
        if in_bal == 0 {
            return Err(StakeError::EmptyProtocol);
        }
        self.debit(caller, amount, None)?;
        let p = &mut self.protocols[pid as usize];
        p.reserve = p
            .reserve
            .checked_add(amount)
            .ok_or(StakeError::Overflow)?;
        // Round the per-stake increment up so a sole staker collects the
        // full deposit; the reserve cap absorbs the rounding excess.
        let delta = ((amount as u128) << 64).div_ceil(in_bal);
        p.y_acc = p.y_acc.checked_add(delta).ok_or(StakeError::Overflow)?;
        Ok(())
    }

    fn member_of(&self, idx: u16, pid: u64) -> Option<usize> {
        let w = &self.wallets[idx as usize];
        (0..MAX_SLOTS).find(|&s| {
            let handle = w.members[s];
            handle != NO_RECORD && self.members.slots[handle as usize].protocol_id == pid
        })
    }

    // ========================================
    // Membership Directory
    // ========================================

    /// Atomic membership rebalance: harvest, leave every occupied slot not
    /// tagged in `stay_mask`, then join every non-zero id in `add_list`.
    /// Duplicate detection is scoped to this call.
    pub fn set_membership(
        &mut self,
        idx: u16,
        add_list: &[u64; MAX_SLOTS],
        stay_mask: u8,
        now: u64,
    ) -> Result<MembershipOutcome> {
        self.enter()?;
        let res = self.set_membership_inner(idx, add_list, stay_mask, now);
        self.exit();
        res
    }

    fn set_membership_inner(
        &mut self,
        idx: u16,
        add_list: &[u64; MAX_SLOTS],
        stay_mask: u8,
        now: u64,
    ) -> Result<MembershipOutcome> {
        self.expect_wallet(idx)?;
        self.harvest_inner(idx)?;

        let mut tagged = [0u64; MAX_SLOTS * 2];
        let mut tagged_len = 0usize;
        let mut outcome = MembershipOutcome::default();

        for slot in 0..MAX_SLOTS {
            let handle = self.wallets[idx as usize].members[slot];
            if handle == NO_RECORD {
                continue;
            }
            if stay_mask & (1 << slot) != 0 {
                tagged[tagged_len] = self.members.slots[handle as usize].protocol_id;
                tagged_len += 1;
            } else {
                self.leave(idx, slot, now)?;
                outcome.left_mask |= 1 << slot;
            }
        }

        let mut to_join = [0u64; MAX_SLOTS];
        let mut join_len = 0usize;
        for &pid in add_list.iter() {
            if pid == 0 {
                continue;
            }
            if pid > self.protocol_count {
                return Err(StakeError::UnknownProtocol);
            }
            if tagged[..tagged_len].contains(&pid) {
                return Err(StakeError::DuplicateRequest);
            }
            tagged[tagged_len] = pid;
            tagged_len += 1;
            to_join[join_len] = pid;
            join_len += 1;
        }

        for &pid in &to_join[..join_len] {
            let slot = self.join(idx, pid, now)?;
            outcome.joined_mask |= 1 << slot;
        }
        Ok(outcome)
    }

    fn join(&mut self, idx: u16, pid: u64, now: u64) -> Result<usize> {
        let p = &self.protocols[pid as usize];
        let w = &self.wallets[idx as usize];
        if w.balance < p.min_stake {
            return Err(StakeError::BelowMinStake);
        }
        let slot = (0..MAX_SLOTS)
            .find(|s| w.members[*s] == NO_RECORD)
            .ok_or(StakeError::NoFreeSlot)?;

        let stake = w.balance;
        let member_h = self.members.allocate()?;
        let snap_h = self.snapshots.allocate()?;

        let p = &mut self.protocols[pid as usize];
        p.in_bal = p
            .in_bal
            .checked_add(stake as u128)
            .ok_or(StakeError::Overflow)?;

        // Snapshot seeds from the aggregates with this stake already counted,
        // so the wallet participates in haircuts signaled from here on. The
        // base anchors at in_bal + burned: realizing a cut moves value from
        // in_bal to burned, so the anchor is invariant under other members'
        // harvests and repeated haircuts stay exactly proportional.
        self.snapshots.slots[snap_h as usize] = Snapshot {
            in_start: p.in_bal.saturating_add(p.burned.get()),
            out_start: p.out_bal,
            y_start: p.y_acc,
            join_min: p.min_stake,
            _padding: 0,
        };
        self.members.slots[member_h as usize] = Member {
            protocol_id: pid,
            snapshot: snap_h,
            _padding: 0,
            unlock_at: now.saturating_add(p.lock_window),
            stake,
        };
        let w = &mut self.wallets[idx as usize];
        w.members[slot] = member_h;
        w.slot_mask |= 1 << slot;
        Ok(slot)
    }

    fn leave(&mut self, idx: u16, slot: usize, now: u64) -> Result<()> {
        let handle = self.wallets[idx as usize].members[slot];
        let m = self.members.slots[handle as usize];
        if now < m.unlock_at {
            return Err(StakeError::StillLocked);
        }
        let pid = m.protocol_id as usize;
        self.protocols[pid].in_bal = self.protocols[pid].in_bal.saturating_sub(m.stake as u128);

        // Detach before recycling so the arena never holds a referenced record.
        let w = &mut self.wallets[idx as usize];
        w.members[slot] = NO_RECORD;
        w.slot_mask &= !(1 << slot);
        self.snapshots.recycle(m.snapshot);
        self.members.recycle(handle);
        Ok(())
    }

    // ========================================
    // Harvest Engine
    // ========================================

    /// Settle owed yield and pending haircuts for one wallet, then refresh
    /// its snapshots. Idempotent: a second harvest with no intervening
    /// mutation changes nothing. Callable by anyone on any wallet; locks
    /// are irrelevant here.
    pub fn harvest(&mut self, idx: u16) -> Result<HarvestOutcome> {
        self.enter()?;
        let res = self.harvest_inner(idx);
        self.exit();
        res
    }

    fn harvest_inner(&mut self, idx: u16) -> Result<HarvestOutcome> {
        self.expect_wallet(idx)?;
        let mut outcome = HarvestOutcome::default();

        for slot in 0..MAX_SLOTS {
            let handle = self.wallets[idx as usize].members[slot];
            if handle == NO_RECORD {
                continue;
            }
            let (pid, snap_h) = {
                let m = &self.members.slots[handle as usize];
                (m.protocol_id as usize, m.snapshot as usize)
            };

            // Without stake there is nothing to settle; fall through to the
            // snapshot refresh so the anchors still advance.
            if self.wallets[idx as usize].balance > 0 {
                // Yield first: the haircut below must see a stake that
                // already includes anything paid out here.
                let y_acc = self.protocols[pid].y_acc.get();
                let y_start = self.snapshots.slots[snap_h].y_start.get();
                if y_acc > y_start {
                    let delta = y_acc - y_start;
                    let stake = self.members.slots[handle as usize].stake as u128;
                    // (stake * delta) >> 64 in split halves; each partial
                    // product stays inside u128.
                    let hi = delta >> 64;
                    let lo = delta & u64::MAX as u128;
                    let mut owed = hi
                        .saturating_mul(stake)
                        .saturating_add((lo * stake) >> 64);
                    let reserve = self.protocols[pid].reserve;
                    if owed > reserve as u128 {
                        owed = reserve as u128;
                    }
                    let owed = owed as u64;
                    if owed > 0 {
                        self.protocols[pid].reserve -= owed;
                        self.credit(idx, owed, None)?;
                        outcome.yield_paid += owed;
                    }
                }

                let out_bal = self.protocols[pid].out_bal.get();
                let out_start = self.snapshots.slots[snap_h].out_start.get();
                if out_bal > out_start {
                    let delta = out_bal - out_start;
                    let in_start = self.snapshots.slots[snap_h].in_start.get();
                    let base = in_start.saturating_sub(out_start);
                    let stake = self.members.slots[handle as usize].stake as u128;
                    let cut = if base == 0 {
                        0
                    } else {
                        stake.saturating_mul(delta) / base
                    };
                    let balance = self.wallets[idx as usize].balance;
                    let cut = core::cmp::min(cut, balance as u128) as u64;
                    if cut > 0 {
                        // Burn directly from the wallet and attribute the cut
                        // to this protocol; the mirrored debit below covers
                        // every other membership.
                        self.wallets[idx as usize].balance = balance - cut;
                        self.total_supply -= cut;
                        let m = &mut self.members.slots[handle as usize];
                        m.stake = m.stake.saturating_sub(cut);
                        let p = &mut self.protocols[pid];
                        p.burned = p.burned.saturating_add(cut as u128);
                        p.in_bal = p.in_bal.saturating_sub(cut as u128);
                        self.mirror(idx, cut, Flow::Debit, Some(pid as u64));
                        outcome.haircut_burned += cut;
                    }
                }
            }

            // Re-anchor so the next harvest starts from post-settlement state.
            // The base re-anchors at in_bal + burned (see join).
            let p = &self.protocols[pid];
            let (in_base, out_bal, y_acc) = (
                p.in_bal.saturating_add(p.burned.get()),
                p.out_bal,
                p.y_acc,
            );
            let snap = &mut self.snapshots.slots[snap_h];
            snap.in_start = in_base;
            snap.out_start = out_bal;
            snap.y_start = y_acc;
            self.members.slots[handle as usize].stake = self.wallets[idx as usize].balance;
        }
        Ok(outcome)
    }

    // ========================================
    // Ledger Primitives
    // ========================================

    /// Mirror a balance delta into the wallet's active memberships: stake,
    /// protocol in_bal, and the snapshot base all move together. The
    /// skipped protocol is adjusted explicitly by the haircut path and is
    /// never touched here, in any of the three places.
    fn mirror(&mut self, idx: u16, delta: u64, flow: Flow, skip_pid: Option<u64>) {
        for slot in 0..MAX_SLOTS {
            let handle = self.wallets[idx as usize].members[slot];
            if handle == NO_RECORD {
                continue;
            }
            let (pid, snap_h) = {
                let m = &self.members.slots[handle as usize];
                (m.protocol_id, m.snapshot as usize)
            };
            if skip_pid == Some(pid) {
                continue;
            }
            let m = &mut self.members.slots[handle as usize];
            let p = &mut self.protocols[pid as usize];
            let snap = &mut self.snapshots.slots[snap_h];
            match flow {
                Flow::Credit => {
                    m.stake = m.stake.saturating_add(delta);
                    p.in_bal = p.in_bal.saturating_add(delta as u128);
                    snap.in_start = snap.in_start.saturating_add(delta as u128);
                }
                Flow::Debit => {
                    m.stake = m.stake.saturating_sub(delta);
                    p.in_bal = p.in_bal.saturating_sub(delta as u128);
                    snap.in_start = snap.in_start.saturating_sub(delta as u128);
                }
            }
        }
    }

    fn credit(&mut self, idx: u16, amount: u64, skip_pid: Option<u64>) -> Result<()> {
        let w = &mut self.wallets[idx as usize];
        w.balance = w
            .balance
            .checked_add(amount)
            .ok_or(StakeError::Overflow)?;
        self.mirror(idx, amount, Flow::Credit, skip_pid);
        Ok(())
    }

    fn debit(&mut self, idx: u16, amount: u64, skip_pid: Option<u64>) -> Result<()> {
        let w = &mut self.wallets[idx as usize];
        w.balance = w
            .balance
            .checked_sub(amount)
            .ok_or(StakeError::InsufficientBalance)?;
        self.mirror(idx, amount, Flow::Debit, skip_pid);
        Ok(())
    }

    fn require_unlocked(&self, idx: u16, now: u64) -> Result<()> {
        for slot in 0..MAX_SLOTS {
            let handle = self.wallets[idx as usize].members[slot];
            if handle == NO_RECORD {
                continue;
            }
            if now < self.members.slots[handle as usize].unlock_at {
                return Err(StakeError::WalletLocked);
            }
        }
        Ok(())
    }

    /// Create supply into a wallet (deposit path).
    pub fn mint(&mut self, idx: u16, amount: u64) -> Result<()> {
        self.enter()?;
        let res = self.mint_inner(idx, amount);
        self.exit();
        res
    }

    fn mint_inner(&mut self, idx: u16, amount: u64) -> Result<()> {
        self.expect_wallet(idx)?;
        self.harvest_inner(idx)?;
        let supply = self
            .total_supply
            .checked_add(amount)
            .ok_or(StakeError::SupplyCapExceeded)?;
        if supply > self.params.supply_cap {
            return Err(StakeError::SupplyCapExceeded);
        }
        self.credit(idx, amount, None)?;
        self.total_supply = supply;
        Ok(())
    }

    /// Destroy supply from a wallet (withdraw path). Locked wallets cannot
    /// burn: pulling value out of a locked stake is the same escape hatch
    /// as leaving early.
    pub fn burn(&mut self, idx: u16, amount: u64, now: u64) -> Result<()> {
        self.enter()?;
        let res = self.burn_inner(idx, amount, now);
        self.exit();
        res
    }

    fn burn_inner(&mut self, idx: u16, amount: u64, now: u64) -> Result<()> {
        self.expect_wallet(idx)?;
        self.harvest_inner(idx)?;
        self.require_unlocked(idx, now)?;
        if self.wallets[idx as usize].balance < amount {
            return Err(StakeError::InsufficientBalance);
        }
        self.debit(idx, amount, None)?;
        self.total_supply -= amount;
        Ok(())
    }

    pub fn transfer(&mut self, from: u16, to: u16, amount: u64, now: u64) -> Result<()> {
        self.enter()?;
        let res = self.transfer_inner(from, to, amount, now);
        self.exit();
        res
    }

    fn transfer_inner(&mut self, from: u16, to: u16, amount: u64, now: u64) -> Result<()> {
        self.expect_wallet(from)?;
        self.expect_wallet(to)?;
        self.harvest_inner(from)?;
        if from != to {
            self.harvest_inner(to)?;
        }
        self.require_unlocked(from, now)?;
        if self.wallets[from as usize].balance < amount {
            return Err(StakeError::InsufficientBalance);
        }
        self.debit(from, amount, None)?;
        self.credit(to, amount, None)?;
        Ok(())
    }

    // ========================================
    // Flash Loan
    // ========================================

    /// Mint an ephemeral balance to a borrower with no memberships. The
    /// latch stays held until `flash_settle`, so the callback can reach
    /// nothing but `approve_repayment`.
    pub fn flash_begin(&mut self, idx: u16, amount: u64) -> Result<FlashGuard> {
        self.enter()?;
        let res = self.flash_begin_inner(idx, amount);
        if res.is_err() {
            self.exit();
        }
        res
    }

    fn flash_begin_inner(&mut self, idx: u16, amount: u64) -> Result<FlashGuard> {
        self.expect_wallet(idx)?;
        let w = &self.wallets[idx as usize];
        // An inflated balance would propagate into protocol aggregates.
        if w.has_memberships() {
            return Err(StakeError::MembershipActive);
        }
        let guard = FlashGuard {
            pre_balance: w.balance,
            pre_allowance: w.repay_allowance,
        };
        let supply = self
            .total_supply
            .checked_add(amount)
            .ok_or(StakeError::SupplyCapExceeded)?;
        if supply > self.params.supply_cap {
            return Err(StakeError::SupplyCapExceeded);
        }
        let w = &mut self.wallets[idx as usize];
        w.balance = w.balance.checked_add(amount).ok_or(StakeError::Overflow)?;
        self.total_supply = supply;
        Ok(guard)
    }

    /// Verify repayment and release the latch. The allowance granted during
    /// the callback must equal the loan exactly, and the post-loan balance
    /// must equal the pre-loan balance bit-for-bit.
    pub fn flash_settle(&mut self, idx: u16, amount: u64, guard: FlashGuard) -> Result<()> {
        let res = self.flash_settle_inner(idx, amount, guard);
        self.exit();
        res
    }

    fn flash_settle_inner(&mut self, idx: u16, amount: u64, guard: FlashGuard) -> Result<()> {
        self.expect_wallet(idx)?;
        let w = &self.wallets[idx as usize];
        let granted = w.repay_allowance.wrapping_sub(guard.pre_allowance);
        if w.repay_allowance < guard.pre_allowance || granted < amount {
            return Err(StakeError::InsufficientAllowance);
        }
        if granted > amount {
            return Err(StakeError::RepaymentMismatch);
        }
        if w.balance < amount {
            return Err(StakeError::InsufficientBalance);
        }
        let w = &mut self.wallets[idx as usize];
        w.repay_allowance = guard.pre_allowance;
        w.balance -= amount;
        self.total_supply -= amount;
        if self.wallets[idx as usize].balance != guard.pre_balance {
            return Err(StakeError::RepaymentMismatch);
        }
        Ok(())
    }

    // ========================================
    // Diagnostics
    // ========================================

    /// Supply conservation: balances plus undistributed yield reserves must
    /// equal total supply after every operation.
    pub fn check_conservation(&self) -> bool {
        let mut sum: u128 = 0;
        for w in &self.wallets[..self.num_wallets as usize] {
            sum += w.balance as u128;
        }
        for p in &self.protocols[1..=self.protocol_count as usize] {
            sum += p.reserve as u128;
        }
        sum == self.total_supply as u128
    }

    /// Sum of live member stakes for one protocol (O(wallets), test-side).
    pub fn staked_total(&self, pid: u64) -> u128 {
        let mut sum: u128 = 0;
        for w in &self.wallets[..self.num_wallets as usize] {
            for &handle in &w.members {
                if handle == NO_RECORD {
                    continue;
                }
                let m = &self.members.slots[handle as usize];
                if m.protocol_id == pid {
                    sum += m.stake as u128;
                }
            }
        }
        sum
    }
}
