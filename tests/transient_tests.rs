//! Tests for the persistent/transient handoff across all containers.
//!
//! Every container must satisfy the same protocol: `transient()` is O(1)
//! and never affects the source, `persistent()` seals the transient, and
//! a sealed transient fails on any further operation.

use arbors::{
    PersistentHashMap, PersistentHashSet, PersistentTreeMap, PersistentTreeSet, PersistentVector,
    Stack,
};
use rstest::rstest;

// =============================================================================
// Build through a transient, then seal
// =============================================================================

#[rstest]
fn test_vector_scenario() {
    let mut transient = PersistentVector::new().transient();
    for index in 0..=1000 {
        transient.push_back(index);
    }
    let vector = transient.persistent();
    assert_eq!(vector.get(500), Some(&500));
    assert_eq!(vector.len(), 1001);
}

#[rstest]
#[should_panic(expected = "transient used after persistent conversion")]
fn test_vector_seal_is_fatal() {
    let mut transient = PersistentVector::new().transient();
    for index in 0..=1000 {
        transient.push_back(index);
    }
    let _vector = transient.persistent();
    let _ = transient.get(500);
}

#[rstest]
#[should_panic(expected = "transient used after persistent conversion")]
fn test_double_persistent_is_fatal() {
    let mut transient = PersistentVector::new().transient();
    transient.push_back(1);
    let _first = transient.persistent();
    let _second = transient.persistent();
}

// =============================================================================
// Round-trip persistence
// =============================================================================

#[rstest]
fn test_vector_round_trip() {
    let vector: PersistentVector<i32> = (0..100).collect();
    assert_eq!(vector, vector.transient().persistent());
}

#[rstest]
fn test_hashmap_round_trip() {
    let map: PersistentHashMap<i32, i32> = (0..100).map(|key| (key, key)).collect();
    assert_eq!(map, map.transient().persistent());
}

#[rstest]
fn test_treemap_round_trip() {
    let map: PersistentTreeMap<i32, i32> = (0..100).map(|key| (key, key)).collect();
    assert_eq!(map, map.transient().persistent());
}

#[rstest]
fn test_hashset_round_trip() {
    let set: PersistentHashSet<i32> = (0..100).collect();
    assert_eq!(set, set.transient().persistent());
}

#[rstest]
fn test_treeset_round_trip() {
    let set: PersistentTreeSet<i32> = (0..100).collect();
    assert_eq!(set, set.transient().persistent());
}

#[rstest]
fn test_stack_round_trip() {
    let stack: Stack<i32> = (0..100).collect();
    assert_eq!(stack, stack.transient().persistent());
}

// =============================================================================
// Isolation: a transient never leaks into its source
// =============================================================================

#[rstest]
fn test_vector_transient_isolation() {
    let source: PersistentVector<i32> = (0..10_000).collect();
    let snapshot: Vec<i32> = source.iter().copied().collect();

    let mut transient = source.transient();
    for index in (0..10_000).step_by(7) {
        transient.update(index, -1);
    }
    while transient.len() > 5_000 {
        transient.pop_back();
    }
    let mutated = transient.persistent();

    let after: Vec<i32> = source.iter().copied().collect();
    assert_eq!(snapshot, after);
    assert_eq!(mutated.len(), 5_000);
    assert_eq!(mutated.get(7), Some(&-1));
}

#[rstest]
fn test_treemap_transient_isolation() {
    let source: PersistentTreeMap<i32, i32> = (0..10_000).map(|key| (key, key)).collect();

    let mut transient = source.transient();
    for key in 0..5_000 {
        transient.remove(&key);
    }
    let mutated = transient.persistent();

    assert_eq!(source.len(), 10_000);
    assert_eq!(source.get(&0), Some(&0));
    assert_eq!(mutated.len(), 5_000);
    assert_eq!(mutated.get(&0), None);
}

// =============================================================================
// Chained sessions
// =============================================================================

#[rstest]
fn test_alternating_sessions() {
    // Each persistent checkpoint must stay frozen while later sessions
    // keep mutating.
    let mut checkpoints = Vec::new();
    let mut current: PersistentVector<i32> = PersistentVector::new();
    for round in 0..10 {
        let mut transient = current.transient();
        for index in 0..100 {
            transient.push_back(round * 100 + index);
        }
        current = transient.persistent();
        checkpoints.push(current.clone());
    }
    for (round, checkpoint) in checkpoints.iter().enumerate() {
        assert_eq!(checkpoint.len(), (round + 1) * 100);
        assert_eq!(checkpoint.get(0), Some(&0));
        let last_index = checkpoint.len() - 1;
        let expected = i32::try_from(last_index).unwrap();
        assert_eq!(checkpoint.get(last_index), Some(&expected));
    }
}
