//! Layout tests for the slab's 128-bit wrapper type.
//!
//! Aggregates are stored as [u64; 2] so x86_64 (16-byte u128 alignment since
//! Rust 1.77/1.78) and SBF (8-byte alignment) agree on every offset inside
//! the slab. Golden values pin the lo/hi split.

use core::mem::{align_of, size_of};
use stakeledger_prog::constants::{ENGINE_LEN, ENGINE_OFF, SLAB_LEN};
use stakeledger_prog::engine::{Member, Protocol, Snapshot, StakeEngine, Wallet, U128};

/// Golden test values: (value, lo word, hi word).
const U128_GOLDEN: [(u128, u64, u64); 8] = [
    (0, 0, 0),
    (1, 1, 0),
    (u128::MAX, u64::MAX, u64::MAX),
    (0xFFFF_FFFF_FFFF_FFFF, u64::MAX, 0),
    (1u128 << 64, 0, 1),
    ((1u128 << 64) + 42, 42, 1),
    (0xDEAD_BEEF_CAFE_BABE, 0xDEAD_BEEF_CAFE_BABE, 0),
    (
        0x0102_0304_0506_0708_090A_0B0C_0D0E_0F10,
        0x090A_0B0C_0D0E_0F10,
        0x0102_0304_0506_0708,
    ),
];

#[test]
fn u128_wrapper_golden_values() {
    for (i, &(value, lo, hi)) in U128_GOLDEN.iter().enumerate() {
        let w = U128::new(value);
        assert_eq!(w.lo(), lo, "case {} lo", i);
        assert_eq!(w.hi(), hi, "case {} hi", i);
        assert_eq!(w.get(), value, "case {} roundtrip", i);

        let mut m = U128::ZERO;
        m.set(value);
        assert_eq!(m, w, "case {} set", i);
    }
}

#[test]
fn u128_wrapper_arithmetic() {
    let a = U128::new(u128::MAX);
    assert_eq!(a.checked_add(1), None);
    assert_eq!(a.saturating_add(1).get(), u128::MAX);

    let z = U128::ZERO;
    assert_eq!(z.checked_sub(1), None);
    assert_eq!(z.saturating_sub(1).get(), 0);
    assert!(z.is_zero());

    let x = U128::new((1 << 64) + 7);
    assert_eq!(x.checked_add(3).unwrap().get(), (1 << 64) + 10);
    assert_eq!(x.checked_sub(8).unwrap().get(), (1 << 64) - 1);
    assert!(x > U128::new(1 << 64));
}

#[test]
fn slab_records_are_eight_byte_aligned() {
    assert_eq!(size_of::<U128>(), 16);
    assert_eq!(align_of::<U128>(), 8);

    assert_eq!(align_of::<StakeEngine>(), 8);
    assert_eq!(size_of::<Snapshot>(), 64);
    assert_eq!(size_of::<Member>(), 32);
    assert_eq!(size_of::<Wallet>(), 88);
    assert_eq!(align_of::<Protocol>(), 8);

    assert_eq!(SLAB_LEN, ENGINE_OFF + ENGINE_LEN);
    assert_eq!(ENGINE_OFF % align_of::<StakeEngine>(), 0);
}
