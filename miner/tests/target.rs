//! Target comparison and the default hash oracle.

use phoenix_miner::hashing::{self, HashOracle, Sha256d};

fn le(value: u64) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[..8].copy_from_slice(&value.to_le_bytes());
    out
}

#[test]
fn test_target_threshold_is_inclusive() {
    let target = le(0xff);
    assert!(hashing::check_target(&le(0xfe), &target));
    assert!(hashing::check_target(&le(0xff), &target));
    assert!(!hashing::check_target(&le(0x100), &target));
}

#[test]
fn test_high_bytes_decide() {
    let mut target = [0u8; 32];
    target[31] = 0x01;
    let mut hash = [0xffu8; 32];
    hash[31] = 0x00;
    assert!(hashing::check_target(&hash, &target));
    hash[31] = 0x02;
    hash[0] = 0x00;
    assert!(!hashing::check_target(&hash, &target));
}

#[test]
fn test_genesis_header_meets_its_target() {
    // Bitcoin genesis header in wire order; the oracle expects getwork word order
    let wire = hex::decode(concat!(
        "01000000",
        "0000000000000000000000000000000000000000000000000000000000000000",
        "3ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a",
        "29ab5f49",
        "ffff001d",
        "1dac2b7c",
    ))
    .unwrap();
    let mut header = [0u8; hashing::HEADER_LEN];
    header.copy_from_slice(&hashing::swap_words(&wire));

    assert_eq!(hashing::read_timestamp(&header), 1_231_006_505);
    assert_eq!(hashing::read_nonce(&header), 2_083_236_893);

    let digest = Sha256d.digest(&header);
    assert_eq!(
        hex::encode(digest),
        "6fe28c0ab6f1b372c1a6a246ae63f74f931e8365e15a089c68d6190000000000"
    );

    // Difficulty-1 target: 0x00000000ffff0000...0000 as a little-endian integer
    let mut target = [0u8; 32];
    target[26] = 0xff;
    target[27] = 0xff;
    assert!(hashing::check_target(&digest, &target));

    let other = hashing::assemble_header(&header, 1_231_006_505, 0);
    assert!(!hashing::check_target(&Sha256d.digest(&other), &target));
}
