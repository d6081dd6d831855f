//! Unit tests for PersistentVector, TransientVector and VectorSlice.

use arbors::{PersistentVector, TransientVector};
use rstest::rstest;

// =============================================================================
// Construction and access
// =============================================================================

#[rstest]
fn test_new_creates_empty_vector() {
    let vector: PersistentVector<i32> = PersistentVector::new();
    assert!(vector.is_empty());
    assert_eq!(vector.len(), 0);
    assert_eq!(vector.get(0), None);
}

#[rstest]
fn test_singleton() {
    let vector = PersistentVector::singleton(42);
    assert_eq!(vector.len(), 1);
    assert_eq!(vector.get(0), Some(&42));
}

#[rstest]
fn test_push_back_does_not_modify_original() {
    let vector1 = PersistentVector::new().push_back(1);
    let vector2 = vector1.push_back(2);

    assert_eq!(vector1.len(), 1);
    assert_eq!(vector1.get(1), None);
    assert_eq!(vector2.len(), 2);
    assert_eq!(vector2.get(1), Some(&2));
}

#[rstest]
fn test_first_and_last() {
    let vector: PersistentVector<i32> = (1..=5).collect();
    assert_eq!(vector.first(), Some(&1));
    assert_eq!(vector.last(), Some(&5));

    let empty: PersistentVector<i32> = PersistentVector::new();
    assert_eq!(empty.first(), None);
    assert_eq!(empty.last(), None);
}

// =============================================================================
// Tail overflow boundary
// =============================================================================

#[rstest]
fn test_tail_overflow_boundary() {
    let mut vector: PersistentVector<i32> = PersistentVector::new();
    for index in 0..=33 {
        vector = vector.push_back(index);
    }
    assert_eq!(vector.len(), 34);
    assert_eq!(vector.get(32), Some(&32));
    assert_eq!(vector.get(33), Some(&33));
    for index in 0..=31 {
        assert_eq!(vector.get(index as usize), Some(&index));
    }

    for _ in 0..32 {
        let (rest, _) = vector.pop_back().unwrap();
        vector = rest;
    }
    assert_eq!(vector.len(), 2);
    assert_eq!(vector.get(0), Some(&0));
    assert_eq!(vector.get(1), Some(&1));
}

#[rstest]
#[case(32)]
#[case(33)]
#[case(1024)]
#[case(1025)]
#[case(1056)]
#[case(1057)]
fn test_level_boundaries(#[case] size: usize) {
    let vector: PersistentVector<usize> = (0..size).collect();
    assert_eq!(vector.len(), size);
    for index in 0..size {
        assert_eq!(vector.get(index), Some(&index));
    }
}

// =============================================================================
// Large vectors
// =============================================================================

#[rstest]
fn test_million_elements_pop_to_one() {
    let mut transient = TransientVector::new();
    for index in 0..1_000_000 {
        transient.push_back(index);
    }
    assert_eq!(transient.len(), 1_000_000);
    assert_eq!(transient.get(999_999), Some(&999_999));

    while transient.len() > 1 {
        transient.pop_back();
    }
    let vector = transient.persistent();
    assert_eq!(vector.len(), 1);
    assert_eq!(vector.get(0), Some(&0));
}

#[rstest]
fn test_deep_update() {
    let vector: PersistentVector<usize> = (0..100_000).collect();
    let updated = vector.update(70_000, 0).unwrap();
    assert_eq!(updated.get(70_000), Some(&0));
    assert_eq!(vector.get(70_000), Some(&70_000));
    assert_eq!(updated.get(69_999), Some(&69_999));
}

// =============================================================================
// Slices
// =============================================================================

#[rstest]
fn test_slice_basics() {
    let vector: PersistentVector<i32> = (0..10).collect();
    let slice = vector.slice(2, 6);
    assert_eq!(slice.len(), 4);
    assert_eq!(slice.get(0), Some(&2));
    assert_eq!(slice.get(3), Some(&5));
    assert_eq!(slice.get(4), None);
}

#[rstest]
fn test_slice_push_back_does_not_touch_backing() {
    let vector: PersistentVector<i32> = (0..10).collect();
    let slice = vector.slice(0, 4);
    let extended = slice.push_back(99);
    assert_eq!(extended.get(4), Some(&99));
    assert_eq!(vector.get(4), Some(&4));
}

#[rstest]
fn test_slice_update() {
    let vector: PersistentVector<i32> = (0..10).collect();
    let slice = vector.slice(3, 7);
    let updated = slice.update(0, -1).unwrap();
    assert_eq!(updated.get(0), Some(&-1));
    assert_eq!(slice.get(0), Some(&3));
    assert!(slice.update(4, -1).is_none());
}

#[rstest]
fn test_slice_of_slice() {
    let vector: PersistentVector<i32> = (0..20).collect();
    let narrow = vector.slice(5, 15).slice(2, 6);
    let collected: Vec<i32> = narrow.iter().copied().collect();
    assert_eq!(collected, vec![7, 8, 9, 10]);
}

#[rstest]
#[should_panic(expected = "index out of bounds")]
fn test_slice_bounds_checked() {
    let vector: PersistentVector<i32> = (0..5).collect();
    let _ = vector.slice(3, 6);
}

// =============================================================================
// Iteration and std traits
// =============================================================================

#[rstest]
fn test_iterator_yields_all() {
    let vector: PersistentVector<usize> = (0..1000).collect();
    let collected: Vec<usize> = vector.iter().copied().collect();
    let expected: Vec<usize> = (0..1000).collect();
    assert_eq!(collected, expected);
    assert_eq!(vector.iter().len(), 1000);
}

#[rstest]
fn test_into_iterator() {
    let vector: PersistentVector<i32> = (0..5).collect();
    let collected: Vec<i32> = vector.into_iter().collect();
    assert_eq!(collected, vec![0, 1, 2, 3, 4]);
}

#[rstest]
fn test_extend() {
    let mut vector: PersistentVector<i32> = (0..3).collect();
    vector.extend(3..6);
    let collected: Vec<i32> = vector.iter().copied().collect();
    assert_eq!(collected, vec![0, 1, 2, 3, 4, 5]);
}

#[rstest]
fn test_index_operator() {
    let vector: PersistentVector<i32> = (0..10).collect();
    assert_eq!(vector[7], 7);
}

#[rstest]
fn test_debug_format() {
    let vector: PersistentVector<i32> = (1..=3).collect();
    assert_eq!(format!("{vector:?}"), "[1, 2, 3]");
}
