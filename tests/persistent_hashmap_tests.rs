//! Unit tests for PersistentHashMap and TransientHashMap.

use std::hash::{Hash, Hasher};

use arbors::{PersistentHashMap, TransientHashMap};
use rstest::rstest;

// =============================================================================
// Basic operations
// =============================================================================

#[rstest]
fn test_new_creates_empty_map() {
    let map: PersistentHashMap<String, i32> = PersistentHashMap::new();
    assert!(map.is_empty());
    assert_eq!(map.len(), 0);
    assert_eq!(map.get("key"), None);
}

#[rstest]
fn test_replacement_scenario() {
    let map = PersistentHashMap::new()
        .insert("a".to_string(), 1)
        .insert("b".to_string(), 2)
        .insert("a".to_string(), 3);
    assert_eq!(map.len(), 2);
    assert_eq!(map.get("a"), Some(&3));
    assert_eq!(map.get("b"), Some(&2));
    assert_eq!(map.get("c"), None);
    assert_eq!(map.get_key_value("a"), Some((&"a".to_string(), &3)));
}

#[rstest]
fn test_insert_does_not_modify_original() {
    let map1 = PersistentHashMap::new().insert("key".to_string(), 1);
    let map2 = map1.insert("key".to_string(), 2);
    assert_eq!(map1.get("key"), Some(&1));
    assert_eq!(map2.get("key"), Some(&2));
}

#[rstest]
fn test_remove() {
    let map: PersistentHashMap<i32, i32> = (0..100).map(|key| (key, key)).collect();
    let removed = map.remove(&50);
    assert_eq!(removed.len(), 99);
    assert!(!removed.contains_key(&50));
    assert!(map.contains_key(&50));
    // removing an absent key is a no-op
    assert_eq!(removed.remove(&50).len(), 99);
}

#[rstest]
#[case(10)]
#[case(100)]
#[case(10_000)]
fn test_grow_and_shrink(#[case] size: i32) {
    let mut map = PersistentHashMap::new();
    for key in 0..size {
        map = map.insert(key, key * 2);
    }
    assert_eq!(map.len(), size as usize);
    for key in 0..size {
        assert_eq!(map.get(&key), Some(&(key * 2)));
    }
    for key in 0..size {
        map = map.remove(&key);
    }
    assert!(map.is_empty());
}

// =============================================================================
// Hash collisions
// =============================================================================

/// A key whose hash is constant; all instances collide.
#[derive(Clone, PartialEq, Eq, Debug)]
struct Colliding(u32);

impl Hash for Colliding {
    fn hash<H: Hasher>(&self, state: &mut H) {
        0u64.hash(state);
    }
}

#[rstest]
fn test_collision_scenario() {
    let map = PersistentHashMap::new()
        .insert(Colliding(1), "one")
        .insert(Colliding(2), "two")
        .insert(Colliding(3), "three");
    assert_eq!(map.len(), 3);
    assert_eq!(map.get(&Colliding(1)), Some(&"one"));
    assert_eq!(map.get(&Colliding(2)), Some(&"two"));
    assert_eq!(map.get(&Colliding(3)), Some(&"three"));

    // replacing one updates only that one
    let replaced = map.insert(Colliding(2), "TWO");
    assert_eq!(replaced.len(), 3);
    assert_eq!(replaced.get(&Colliding(1)), Some(&"one"));
    assert_eq!(replaced.get(&Colliding(2)), Some(&"TWO"));
    assert_eq!(replaced.get(&Colliding(3)), Some(&"three"));

    // deleting two leaves the third reachable
    let remaining = map.remove(&Colliding(1)).remove(&Colliding(3));
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining.get(&Colliding(2)), Some(&"two"));
}

// =============================================================================
// Iteration
// =============================================================================

#[rstest]
fn test_iteration_is_total() {
    let map: PersistentHashMap<i32, i32> = (0..1000).map(|key| (key, key)).collect();
    let mut keys: Vec<i32> = map.keys().copied().collect();
    keys.sort_unstable();
    let expected: Vec<i32> = (0..1000).collect();
    assert_eq!(keys, expected);
    assert_eq!(map.values().count(), 1000);
}

#[rstest]
fn test_iteration_of_empty_map() {
    let map: PersistentHashMap<i32, i32> = PersistentHashMap::new();
    assert_eq!(map.iter().count(), 0);
}

// =============================================================================
// Transients
// =============================================================================

#[rstest]
fn test_transient_batch_insert() {
    let mut transient = TransientHashMap::new();
    for key in 0..10_000 {
        transient.insert(key, key);
    }
    let map = transient.persistent();
    assert_eq!(map.len(), 10_000);
    assert_eq!(map.get(&9_999), Some(&9_999));
}

#[rstest]
fn test_transient_does_not_affect_source() {
    let map: PersistentHashMap<i32, i32> = (0..1000).map(|key| (key, key)).collect();
    let mut transient = map.transient();
    for key in 0..1000 {
        transient.insert(key, -key);
    }
    transient.remove(&0);
    let mutated = transient.persistent();

    assert_eq!(map.len(), 1000);
    assert_eq!(map.get(&500), Some(&500));
    assert_eq!(mutated.len(), 999);
    assert_eq!(mutated.get(&500), Some(&-500));
}

#[rstest]
#[should_panic(expected = "transient used after persistent conversion")]
fn test_transient_seal() {
    let mut transient: TransientHashMap<i32, i32> = TransientHashMap::new();
    transient.insert(1, 1);
    let _map = transient.persistent();
    transient.insert(2, 2);
}
