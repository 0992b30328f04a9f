//! Layout pinning for the Pod state structs.
//!
//! The snapshot format is a raw byte image of these structs behind a
//! magic/version header, so any drift in size, alignment or field placement
//! is a silent format break. These tests pin the layout arithmetic and prove
//! the byte image round-trips.

use core::mem::{align_of, size_of};

use alloy_primitives::Address;
use bytemuck::{bytes_of, Zeroable};
use firebreak::constants::{
    pad16, BITMAP_WORDS, HEADER_LEN, HEADER_OFF, LEDGER_LEN, LEDGER_OFF, MAGIC, MAX_ASSETS,
    MAX_USERS, REGISTRY_LEN, REGISTRY_OFF, STATE_LEN, VERSION,
};
use firebreak::ledger::{PositionLedger, UserPosition};
use firebreak::registry::{AssetConfig, AssetRegistry};
use firebreak::state::StateHeader;

#[test]
fn user_position_layout() {
    // 2 * 16 assets * 16 bytes of balances, a 20-byte owner, 12 bytes pad.
    assert_eq!(size_of::<UserPosition>(), 32 * MAX_ASSETS + 32);
    assert_eq!(align_of::<UserPosition>(), 16);
}

#[test]
fn asset_config_layout() {
    // 20-byte address, decimals, active flag, 2 bytes pad, three u64 ratios.
    assert_eq!(size_of::<AssetConfig>(), 48);
    assert_eq!(align_of::<AssetConfig>(), 8);
}

#[test]
fn registry_layout() {
    assert_eq!(
        size_of::<AssetRegistry>(),
        MAX_ASSETS * size_of::<AssetConfig>() + 8
    );
}

#[test]
fn ledger_layout() {
    let tail = 8 * BITMAP_WORDS + 2 * MAX_USERS + 4;
    let expected = MAX_USERS * size_of::<UserPosition>() // user slab
        + 2 * MAX_ASSETS * 16                            // maintained totals
        + tail
        + pad16(tail);
    assert_eq!(size_of::<PositionLedger>(), expected);
    assert_eq!(align_of::<PositionLedger>(), 16);
}

#[test]
fn state_header_layout() {
    assert_eq!(size_of::<StateHeader>(), 80);
    assert_eq!(align_of::<StateHeader>(), 8);

    // Magic sits at offset 0, version right behind it; restore depends on
    // both before it trusts anything else in the image.
    let header = StateHeader::new(
        Address::new([0x11; 20]),
        Address::new([0x22; 20]),
        Address::new([0x33; 20]),
    );
    let bytes = bytes_of(&header);
    assert_eq!(&bytes[0..8], &MAGIC.to_le_bytes());
    assert_eq!(&bytes[8..12], &VERSION.to_le_bytes());
    assert_eq!(&bytes[16..36], &[0x11; 20]);
    assert_eq!(&bytes[36..56], &[0x22; 20]);
    assert_eq!(&bytes[56..76], &[0x33; 20]);
}

#[test]
fn snapshot_regions_tile_the_state() {
    assert_eq!(LEDGER_OFF, 0);
    assert_eq!(LEDGER_LEN, size_of::<PositionLedger>());
    assert_eq!(REGISTRY_OFF, LEDGER_OFF + LEDGER_LEN);
    assert_eq!(REGISTRY_LEN, size_of::<AssetRegistry>());
    assert_eq!(HEADER_OFF, REGISTRY_OFF + REGISTRY_LEN);
    assert_eq!(HEADER_LEN, size_of::<StateHeader>());
    assert_eq!(STATE_LEN, HEADER_OFF + HEADER_LEN);
}

#[test]
fn pod_views_have_no_uninitialized_bytes() {
    // Zeroable + a full bytes_of pass means every byte is accounted for;
    // a struct with implicit padding would not derive Pod at all.
    let ledger: Box<PositionLedger> = bytemuck::zeroed_box();
    assert!(bytes_of(&*ledger).iter().all(|&b| b == 0));
    let registry = AssetRegistry::zeroed();
    assert!(bytes_of(&registry).iter().all(|&b| b == 0));
}

#[test]
fn state_image_round_trips_bytewise() {
    let mut ledger = PositionLedger::new_boxed();
    let (idx, _) = ledger.get_or_create(Address::new([0xAA; 20])).unwrap();
    ledger.set_collateral(idx, 0, 123_456);
    ledger.set_debt(idx, 1, 789);

    let mut registry = AssetRegistry::new();
    registry
        .configure(AssetConfig::new(Address::new([0xC0; 20]), 2, 7_000, 8_000, 10_500))
        .unwrap();

    let header = StateHeader::new(
        Address::new([0x01; 20]),
        Address::new([0x03; 20]),
        Address::new([0x02; 20]),
    );

    let bytes = firebreak::state::write_state(&ledger, &registry, &header);
    assert_eq!(bytes.len(), STATE_LEN);
    let (ledger2, registry2, header2) = firebreak::state::read_state(&bytes).unwrap();
    assert!(*ledger2 == *ledger);
    assert_eq!(registry2, registry);
    assert_eq!(header2, header);

    // And the re-serialization is byte-identical.
    assert_eq!(
        firebreak::state::write_state(&ledger2, &registry2, &header2),
        bytes
    );
}
