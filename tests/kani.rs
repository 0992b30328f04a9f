//! Kani formal verification harnesses for the firebreak engine.
//!
//! Run with: `cargo kani --tests`
//!
//! These prove engine-level safety properties over symbolic inputs:
//! - Fixed-point helpers never panic and respect their bounds
//! - The close-factor bound never exceeds the outstanding debt
//! - The seize computation never takes more than the target holds
//! - Slab allocation keeps the bitmap, freelist and counters consistent
//! - Maintained totals stay equal to a recomputation under arbitrary writes
//!
//! The vault orchestration and the SimMarket are NOT modeled here; their
//! atomicity is covered by the rollback and fuzz suites.

#![cfg(kani)]

extern crate kani;

use alloy_primitives::{Address, U256};
use firebreak::constants::{MAX_ASSETS, PERCENTAGE_FACTOR};
use firebreak::ledger::PositionLedger;
use firebreak::math::{percent_mul, u256};
use firebreak::registry::AssetConfig;
use firebreak::risk;

#[kani::proof]
fn percent_mul_bounded_inputs_never_panic() {
    let a: u128 = kani::any();
    let bps: u128 = kani::any();
    kani::assume(a < u128::MAX >> 16);
    kani::assume(bps <= PERCENTAGE_FACTOR);

    let r = percent_mul(u256(a), u256(bps)).unwrap();
    // A sub-unit ratio never grows the operand by more than the half-up step.
    assert!(r <= u256(a) + U256::from(1u8));
}

#[kani::proof]
fn max_repayable_is_at_most_half_plus_rounding() {
    let debt: u128 = kani::any();
    kani::assume(debt < u128::MAX >> 16);

    let max = risk::max_repayable(debt).unwrap();
    assert!(max <= debt / 2 + 1);
    assert!(debt < 2 || max < debt);
}

#[kani::proof]
#[kani::unwind(6)]
fn seize_never_exceeds_target_balance() {
    let debt_to_cover: u128 = kani::any();
    let balance: u128 = kani::any();
    let coll_price: u128 = kani::any();
    let debt_price: u128 = kani::any();
    kani::assume(debt_to_cover > 0 && debt_to_cover < 1 << 40);
    kani::assume(balance < 1 << 40);
    kani::assume(coll_price > 0 && coll_price < 1 << 70);
    kani::assume(debt_price > 0 && debt_price < 1 << 70);

    let coll = AssetConfig::new(Address::new([1; 20]), 2, 7_000, 8_000, 10_500);
    let debt = AssetConfig::new(Address::new([2; 20]), 0, 7_500, 8_500, 10_000);

    let out = risk::collateral_to_seize(
        &coll,
        &debt,
        u256(coll_price),
        u256(debt_price),
        debt_to_cover,
        balance,
    )
    .unwrap();
    assert!(out.collateral_amount <= balance);
    assert!(out.debt_amount <= debt_to_cover);
}

#[kani::proof]
#[kani::unwind(8)]
fn slab_alloc_free_is_consistent() {
    let mut ledger = PositionLedger::new();
    let tag: u8 = kani::any();
    kani::assume(tag > 0);

    let (idx, created) = ledger.get_or_create(Address::new([tag; 20])).unwrap();
    assert!(created);
    assert!(ledger.is_used(idx as usize));
    assert_eq!(ledger.num_used, 1);

    // Same owner resolves to the same slot without a second allocation.
    let (again, created) = ledger.get_or_create(Address::new([tag; 20])).unwrap();
    assert_eq!(idx, again);
    assert!(!created);
    assert_eq!(ledger.num_used, 1);

    ledger.free_slot(idx);
    assert!(!ledger.is_used(idx as usize));
    assert_eq!(ledger.num_used, 0);

    // The freed slot is reusable and the slab never leaks capacity.
    let (reused, _) = ledger.get_or_create(Address::new([tag; 20])).unwrap();
    assert_eq!(reused, idx);
}

#[kani::proof]
#[kani::unwind(8)]
fn maintained_totals_match_recomputation() {
    let mut ledger = PositionLedger::new();
    let asset: usize = kani::any();
    let first: u128 = kani::any();
    let second: u128 = kani::any();
    kani::assume(asset < MAX_ASSETS);
    kani::assume(first < 1 << 60);
    kani::assume(second < 1 << 60);

    let (idx, _) = ledger.get_or_create(Address::new([0x7F; 20])).unwrap();
    ledger.set_collateral(idx, asset, first);
    ledger.set_debt(idx, asset, second);
    assert!(ledger.check_totals());

    // Overwriting in either direction keeps the totals exact.
    ledger.set_collateral(idx, asset, second);
    ledger.set_debt(idx, asset, first);
    assert!(ledger.check_totals());
    assert_eq!(ledger.total_collateral[asset], second);
    assert_eq!(ledger.total_debt[asset], first);
}
