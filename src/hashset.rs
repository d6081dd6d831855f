//! Persistent (immutable) hash set based on HAMT.
//!
//! [`PersistentHashSet`] stores its elements as the keys of a
//! [`crate::PersistentHashMap`] with unit values, so all structural
//! behavior (bitmap/array nodes, collision handling, per-set hash seed)
//! comes from the map engine.
//!
//! # Examples
//!
//! ```rust
//! use arbors::PersistentHashSet;
//!
//! let set = PersistentHashSet::new().insert(1).insert(2).insert(3);
//! assert!(set.contains(&1));
//!
//! let other: PersistentHashSet<i32> = [2, 3, 4].into_iter().collect();
//! assert_eq!(set.union(&other).len(), 4);
//! assert_eq!(set.intersection(&other).len(), 2);
//! ```

use std::borrow::Borrow;
use std::fmt;
use std::hash::Hash;
use std::iter::FromIterator;

use crate::hashmap::{
    PersistentHashMap, PersistentHashMapIterator, TransientHashMap,
};

// =============================================================================
// PersistentHashSet Definition
// =============================================================================

/// A persistent (immutable) hash set based on HAMT.
///
/// # Examples
///
/// ```rust
/// use arbors::PersistentHashSet;
///
/// let set: PersistentHashSet<i32> = (0..100).collect();
/// assert_eq!(set.len(), 100);
/// assert!(set.contains(&42));
/// ```
#[derive(Clone)]
pub struct PersistentHashSet<T> {
    map: PersistentHashMap<T, ()>,
}

impl<T> PersistentHashSet<T> {
    /// Creates a new empty set with a fresh random hash seed.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            map: PersistentHashMap::new(),
        }
    }

    /// Returns the number of elements in the set.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns `true` if the set contains no elements.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Returns an iterator over the elements, in unspecified order.
    #[must_use]
    pub fn iter(&self) -> PersistentHashSetIterator<'_, T> {
        PersistentHashSetIterator {
            inner: self.map.iter(),
        }
    }
}

impl<T: Clone + Hash + Eq> PersistentHashSet<T> {
    /// Returns `true` if the set contains the element.
    #[must_use]
    pub fn contains<Q>(&self, element: &Q) -> bool
    where
        T: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.contains_key(element)
    }

    /// Adds an element, returning a new set. Adding an element already in
    /// the set returns the original set unchanged.
    #[must_use]
    pub fn insert(&self, element: T) -> Self {
        Self {
            map: self.map.insert(element, ()),
        }
    }

    /// Removes an element, returning a new set; the original set is
    /// returned unchanged when the element is absent.
    #[must_use]
    pub fn remove<Q>(&self, element: &Q) -> Self
    where
        T: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        Self {
            map: self.map.remove(element),
        }
    }

    /// Returns the union of the two sets.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        let mut transient = self.transient();
        for element in other.iter() {
            transient.insert(element.clone());
        }
        transient.persistent()
    }

    /// Returns the intersection of the two sets.
    #[must_use]
    pub fn intersection(&self, other: &Self) -> Self {
        self.iter()
            .filter(|element| other.contains(element))
            .cloned()
            .collect()
    }

    /// Returns the elements of `self` that are not in `other`.
    #[must_use]
    pub fn difference(&self, other: &Self) -> Self {
        self.iter()
            .filter(|element| !other.contains(element))
            .cloned()
            .collect()
    }

    /// Returns `true` if every element of `self` is in `other`.
    #[must_use]
    pub fn is_subset(&self, other: &Self) -> bool {
        self.len() <= other.len() && self.iter().all(|element| other.contains(element))
    }

    /// Returns `true` if the sets share no element.
    #[must_use]
    pub fn is_disjoint(&self, other: &Self) -> bool {
        self.iter().all(|element| !other.contains(element))
    }

    /// Returns a transient version of this set for efficient batch
    /// mutation.
    #[must_use]
    pub fn transient(&self) -> TransientHashSet<T> {
        TransientHashSet {
            map: self.map.transient(),
        }
    }
}

// =============================================================================
// TransientHashSet Definition
// =============================================================================

/// A transient, single-owner version of [`PersistentHashSet`].
///
/// Calling [`TransientHashSet::persistent`] freezes the transient; any
/// operation after that panics.
pub struct TransientHashSet<T> {
    map: TransientHashMap<T, ()>,
}

impl<T: Clone + Hash + Eq> TransientHashSet<T> {
    /// Creates a new empty transient set.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        PersistentHashSet::new().transient()
    }

    /// Returns the number of elements in the set.
    ///
    /// # Panics
    ///
    /// Panics if called after [`Self::persistent`].
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns `true` if the set contains no elements.
    ///
    /// # Panics
    ///
    /// Panics if called after [`Self::persistent`].
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Returns `true` if the set contains the element.
    ///
    /// # Panics
    ///
    /// Panics if called after [`Self::persistent`].
    #[must_use]
    pub fn contains<Q>(&self, element: &Q) -> bool
    where
        T: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.contains_key(element)
    }

    /// Adds an element in place.
    ///
    /// # Panics
    ///
    /// Panics if called after [`Self::persistent`].
    pub fn insert(&mut self, element: T) -> &mut Self {
        self.map.insert(element, ());
        self
    }

    /// Removes an element in place.
    ///
    /// # Panics
    ///
    /// Panics if called after [`Self::persistent`].
    pub fn remove<Q>(&mut self, element: &Q) -> &mut Self
    where
        T: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.remove(element);
        self
    }

    /// Converts this transient into a persistent set in O(1).
    ///
    /// # Panics
    ///
    /// Panics if called twice: the first call seals the transient and any
    /// later operation on it fails.
    #[must_use]
    pub fn persistent(&mut self) -> PersistentHashSet<T> {
        PersistentHashSet {
            map: self.map.persistent(),
        }
    }
}

impl<T: Clone + Hash + Eq> Default for TransientHashSet<T> {
    #[inline]
    fn default() -> Self {
        TransientHashSet::new()
    }
}

impl<T: Clone + Hash + Eq> Extend<T> for TransientHashSet<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        for element in iter {
            self.insert(element);
        }
    }
}

// =============================================================================
// Iterator Implementations
// =============================================================================

/// An iterator over the elements of a [`PersistentHashSet`].
pub struct PersistentHashSetIterator<'a, T> {
    inner: PersistentHashMapIterator<'a, T, ()>,
}

impl<'a, T> Iterator for PersistentHashSetIterator<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(element, ())| element)
    }
}

/// An owning iterator over the elements of a [`PersistentHashSet`].
pub struct PersistentHashSetIntoIterator<T> {
    elements: std::vec::IntoIter<T>,
}

impl<T> Iterator for PersistentHashSetIntoIterator<T> {
    type Item = T;

    fn next(&mut self) -> Option<Self::Item> {
        self.elements.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.elements.size_hint()
    }
}

impl<T: Clone> IntoIterator for PersistentHashSet<T> {
    type Item = T;
    type IntoIter = PersistentHashSetIntoIterator<T>;

    fn into_iter(self) -> Self::IntoIter {
        let elements: Vec<T> = self.iter().cloned().collect();
        PersistentHashSetIntoIterator {
            elements: elements.into_iter(),
        }
    }
}

impl<'a, T> IntoIterator for &'a PersistentHashSet<T> {
    type Item = &'a T;
    type IntoIter = PersistentHashSetIterator<'a, T>;

    #[inline]
    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

// =============================================================================
// Standard Trait Implementations
// =============================================================================

impl<T> Default for PersistentHashSet<T> {
    #[inline]
    fn default() -> Self {
        PersistentHashSet::new()
    }
}

impl<T: Clone + Hash + Eq> FromIterator<T> for PersistentHashSet<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut transient = TransientHashSet::new();
        for element in iter {
            transient.insert(element);
        }
        transient.persistent()
    }
}

impl<T: Clone + Hash + Eq> Extend<T> for PersistentHashSet<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        let mut transient = self.transient();
        for element in iter {
            transient.insert(element);
        }
        *self = transient.persistent();
    }
}

impl<T: Clone + Hash + Eq> PartialEq for PersistentHashSet<T> {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().all(|element| other.contains(element))
    }
}

impl<T: Clone + Hash + Eq> Eq for PersistentHashSet<T> {}

impl<T: fmt::Debug> fmt::Debug for PersistentHashSet<T> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.debug_set().entries(self.iter()).finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
