//! Unit tests for PersistentTreeMap and TransientTreeMap.

use arbors::{PersistentTreeMap, TransientTreeMap};
use rstest::rstest;

// =============================================================================
// Basic operations
// =============================================================================

#[rstest]
fn test_new_creates_empty_map() {
    let map: PersistentTreeMap<i32, &str> = PersistentTreeMap::new();
    assert!(map.is_empty());
    assert_eq!(map.get(&1), None);
    assert_eq!(map.iter().count(), 0);
}

#[rstest]
fn test_insert_get_and_borrowed_lookup() {
    let map = PersistentTreeMap::new()
        .insert("b".to_string(), 2)
        .insert("a".to_string(), 1);
    assert_eq!(map.get("a"), Some(&1));
    assert_eq!(map.get("b"), Some(&2));
    assert_eq!(map.get("c"), None);
}

#[rstest]
fn test_replace_keeps_length() {
    let map = PersistentTreeMap::new().insert(1, "one").insert(1, "ONE");
    assert_eq!(map.len(), 1);
    assert_eq!(map.get(&1), Some(&"ONE"));
}

#[rstest]
fn test_identity_on_equal_entry() {
    let map = PersistentTreeMap::new().insert(1, "one");
    let same = map.insert(1, "one");
    assert_eq!(map.len(), same.len());
    assert_eq!(map, same);
}

// =============================================================================
// Split / rebalance scenario
// =============================================================================

#[rstest]
fn test_split_and_borrow_scenario() {
    // Insert keys 0..99 in order, in-order iteration yields 0..99
    let mut map: PersistentTreeMap<i32, i32> = PersistentTreeMap::new();
    for key in 0..100 {
        map = map.insert(key, key);
    }
    let keys: Vec<i32> = map.keys().copied().collect();
    let expected: Vec<i32> = (0..100).collect();
    assert_eq!(keys, expected);

    // Delete 0..49
    for key in 0..50 {
        map = map.remove(&key);
    }
    assert_eq!(map.len(), 50);
    for key in 0..50 {
        assert!(!map.contains_key(&key));
    }
    let tail: Vec<i32> = map.iter_from(&50).map(|(key, _)| *key).collect();
    let expected_tail: Vec<i32> = (50..100).collect();
    assert_eq!(tail, expected_tail);
}

#[rstest]
#[case(64)]
#[case(65)]
#[case(4096)]
#[case(4097)]
fn test_fanout_boundaries(#[case] size: i32) {
    let map: PersistentTreeMap<i32, i32> = (0..size).map(|key| (key, key)).collect();
    assert_eq!(map.len(), size as usize);
    for key in 0..size {
        assert_eq!(map.get(&key), Some(&key));
    }
}

// =============================================================================
// Ordered iteration
// =============================================================================

#[rstest]
fn test_iter_from_edges() {
    let map: PersistentTreeMap<i32, i32> = (0..100).map(|key| (key, key)).collect();

    // below the minimum positions at the first entry
    let from_low: Vec<i32> = map.iter_from(&-10).map(|(key, _)| *key).collect();
    assert_eq!(from_low.first(), Some(&0));
    assert_eq!(from_low.len(), 100);

    // past the maximum yields nothing
    assert_eq!(map.iter_from(&100).count(), 0);

    // between stored keys positions at the next one
    let map = map.remove(&50);
    let from_gap: Vec<i32> = map.iter_from(&50).map(|(key, _)| *key).collect();
    assert_eq!(from_gap.first(), Some(&51));
}

#[rstest]
fn test_range_bounds() {
    let map: PersistentTreeMap<i32, i32> = (0..100).map(|key| (key, key)).collect();
    let half_open: Vec<i32> = map.range(10..13).map(|(key, _)| *key).collect();
    assert_eq!(half_open, vec![10, 11, 12]);
    let inclusive: Vec<i32> = map.range(97..=99).map(|(key, _)| *key).collect();
    assert_eq!(inclusive, vec![97, 98, 99]);
    let unbounded: Vec<i32> = map.range(..).map(|(key, _)| *key).collect();
    assert_eq!(unbounded.len(), 100);
}

#[rstest]
fn test_min_max() {
    let map: PersistentTreeMap<i32, &str> = [(5, "five"), (1, "one"), (9, "nine")]
        .into_iter()
        .collect();
    assert_eq!(map.min(), Some((&1, &"one")));
    assert_eq!(map.max(), Some((&9, &"nine")));
}

// =============================================================================
// Transients
// =============================================================================

#[rstest]
fn test_transient_bulk_load_and_delete() {
    let mut transient = TransientTreeMap::new();
    for key in 0..10_000 {
        transient.insert(key, key);
    }
    for key in (0..10_000).step_by(3) {
        transient.remove(&key);
    }
    let map = transient.persistent();
    let expected: Vec<i32> = (0..10_000).filter(|key| key % 3 != 0).collect();
    let keys: Vec<i32> = map.keys().copied().collect();
    assert_eq!(keys, expected);
}

#[rstest]
fn test_transient_does_not_affect_source() {
    let map: PersistentTreeMap<i32, i32> = (0..1000).map(|key| (key, key)).collect();
    let mut transient = map.transient();
    for key in 0..1000 {
        transient.insert(key, -key);
    }
    let mutated = transient.persistent();
    assert_eq!(map.get(&123), Some(&123));
    assert_eq!(mutated.get(&123), Some(&-123));
}

#[rstest]
#[should_panic(expected = "transient used after persistent conversion")]
fn test_transient_seal() {
    let mut transient: TransientTreeMap<i32, i32> = TransientTreeMap::new();
    transient.insert(1, 1);
    let _map = transient.persistent();
    let _ = transient.len();
}
