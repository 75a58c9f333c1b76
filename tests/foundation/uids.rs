//! Integration tests for Uid and UidGenerator
//!
//! Tests UID shape, time codes, and strict monotonicity under clock stalls.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use reliquary_foundation::uid::{TIME_CODE_ALPHABET, decode_time_code, encode_time_code};
use reliquary_foundation::{Uid, UidGenerator};

// =============================================================================
// Uid Shape
// =============================================================================

#[test]
fn uid_joins_code_and_time() {
    let uid = Uid::new("I", "6jQZ4zvH");
    assert_eq!(uid.as_str(), "I-6jQZ4zvH");
    assert_eq!(uid.type_code(), "I");
    assert_eq!(uid.time_code(), "6jQZ4zvH");
}

#[test]
fn uid_from_string() {
    let uid = Uid::from("E-abc");
    assert_eq!(uid.to_string(), "E-abc");
    assert_eq!(uid, Uid::from("E-abc".to_string()));
}

#[test]
fn time_codes_use_the_alphabet() {
    let code = encode_time_code(17_000_000_000_000);
    assert!(code.chars().all(|c| TIME_CODE_ALPHABET.contains(c)));
    assert_eq!(decode_time_code(&code), Some(17_000_000_000_000));
}

#[test]
fn ambiguous_characters_are_rejected() {
    assert_eq!(decode_time_code("O0"), None);
    assert_eq!(decode_time_code("l"), None);
    assert_eq!(decode_time_code(""), None);
}

// =============================================================================
// Generation
// =============================================================================

fn stalled() -> u64 {
    500
}

static STALLED: UidGenerator = UidGenerator::with_clock(stalled);

#[test]
fn stalled_clock_still_increases() {
    let first = STALLED.next_time_value();
    let second = STALLED.next_time_value();
    let third = STALLED.next_time_value();
    assert!(first < second && second < third);
}

static BACKWARDS_NOW: AtomicU64 = AtomicU64::new(10_000);

fn backwards() -> u64 {
    BACKWARDS_NOW.fetch_sub(10, Ordering::SeqCst)
}

static BACKWARDS: UidGenerator = UidGenerator::with_clock(backwards);

#[test]
fn backwards_clock_still_increases() {
    let mut last = 0;
    for _ in 0..50 {
        let next = BACKWARDS.next_time_value();
        assert!(next > last);
        last = next;
    }
    assert_eq!(BACKWARDS.last_issued(), last);
}

#[test]
fn uids_are_unique_across_threads() {
    let generator: &'static UidGenerator = Box::leak(Box::new(UidGenerator::new()));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            std::thread::spawn(move || {
                (0..1_000)
                    .map(|_| generator.next_uid("E"))
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        for uid in handle.join().unwrap() {
            assert!(seen.insert(uid));
        }
    }
    assert_eq!(seen.len(), 4_000);
}

#[test]
fn global_generator_is_shared() {
    let a = UidGenerator::global().next_uid("E");
    let b = UidGenerator::global().next_uid("E");
    assert_ne!(a, b);
    assert!(b.time_value() > a.time_value());
}
