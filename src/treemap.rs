//! Persistent (immutable) ordered map based on a B+ tree.
//!
//! This module provides [`PersistentTreeMap`], an immutable ordered map
//! that uses structural sharing for efficient operations, and
//! [`TransientTreeMap`], its single-owner mutable builder.
//!
//! # Overview
//!
//! `PersistentTreeMap` stores key-value entries in a B+ tree with a
//! maximum fan-out of 64, ordered by the key's `Ord` instance.
//!
//! - O(log N) get
//! - O(log N) insert
//! - O(log N) remove
//! - O(log N) min/max
//! - O(log N + k) ordered range iteration where k is the number of results
//! - O(1) len and `is_empty`
//!
//! All operations return new maps without modifying the original,
//! and structural sharing ensures memory efficiency.
//!
//! # Examples
//!
//! ```rust
//! use arbors::PersistentTreeMap;
//!
//! let map = PersistentTreeMap::new()
//!     .insert(3, "three")
//!     .insert(1, "one")
//!     .insert(2, "two");
//!
//! // Entries are always in sorted order
//! let keys: Vec<&i32> = map.keys().collect();
//! assert_eq!(keys, vec![&1, &2, &3]);
//!
//! // Structural sharing: the original map is preserved
//! let updated = map.insert(1, "ONE");
//! assert_eq!(map.get(&1), Some(&"one"));     // Original unchanged
//! assert_eq!(updated.get(&1), Some(&"ONE")); // New version
//! ```

use std::borrow::Borrow;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::iter::FromIterator;
use std::ops::{Bound, RangeBounds};

use crate::btree::{BTree, BTreeIterator, TreeItem};
use crate::transience::USED_AFTER_PERSISTENT;

// =============================================================================
// Map Entry
// =============================================================================

/// A key-value entry as stored in the tree. Ordering considers the key
/// alone; `same` considers key and value, so an insert with an equal key
/// but a different value replaces the stored entry.
#[derive(Clone)]
pub(crate) struct MapEntry<K, V> {
    pub(crate) key: K,
    pub(crate) value: V,
}

impl<K: Ord + Clone, V: Clone + PartialEq> TreeItem for MapEntry<K, V> {
    fn compare(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }

    fn same(&self, other: &Self) -> bool {
        self.key == other.key && self.value == other.value
    }
}

/// Search probe comparing stored entries against a borrowed key.
fn key_probe<'a, K, V, Q>(key: &'a Q) -> impl Fn(&MapEntry<K, V>) -> Ordering + 'a
where
    K: Borrow<Q>,
    Q: Ord + ?Sized,
{
    move |entry| entry.key.borrow().cmp(key)
}

// =============================================================================
// PersistentTreeMap Definition
// =============================================================================

/// A persistent (immutable) ordered map based on a B+ tree.
///
/// # Time Complexity
///
/// | Operation      | Complexity |
/// |----------------|------------|
/// | `new`          | O(1)       |
/// | `get`          | O(log N)   |
/// | `insert`       | O(log N)   |
/// | `remove`       | O(log N)   |
/// | `min` / `max`  | O(log N)   |
/// | `len`          | O(1)       |
/// | `transient`    | O(1)       |
///
/// # Examples
///
/// ```rust
/// use arbors::PersistentTreeMap;
///
/// let map: PersistentTreeMap<i32, i32> = (0..100).map(|key| (key, key)).collect();
/// assert_eq!(map.len(), 100);
/// assert_eq!(map.get(&50), Some(&50));
/// ```
#[derive(Clone)]
pub struct PersistentTreeMap<K, V> {
    tree: BTree<MapEntry<K, V>>,
}

impl<K, V> PersistentTreeMap<K, V> {
    /// Creates a new empty map.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use arbors::PersistentTreeMap;
    ///
    /// let map: PersistentTreeMap<i32, &str> = PersistentTreeMap::new();
    /// assert!(map.is_empty());
    /// ```
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self { tree: BTree::new() }
    }

    /// Returns the number of entries in the map.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.tree.len()
    }

    /// Returns `true` if the map contains no entries.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.tree.len() == 0
    }

    /// Returns the entry with the smallest key.
    #[must_use]
    pub fn min(&self) -> Option<(&K, &V)> {
        self.tree.min_item().map(|entry| (&entry.key, &entry.value))
    }

    /// Returns the entry with the largest key.
    #[must_use]
    pub fn max(&self) -> Option<(&K, &V)> {
        self.tree.max_item().map(|entry| (&entry.key, &entry.value))
    }
}

impl<K: Ord + Clone, V: Clone + PartialEq> PersistentTreeMap<K, V> {
    /// Returns an iterator over the entries in ascending key order.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use arbors::PersistentTreeMap;
    ///
    /// let map = PersistentTreeMap::new()
    ///     .insert(2, "two")
    ///     .insert(1, "one");
    /// let entries: Vec<(&i32, &&str)> = map.iter().collect();
    /// assert_eq!(entries, vec![(&1, &"one"), (&2, &"two")]);
    /// ```
    #[must_use]
    pub fn iter(&self) -> PersistentTreeMapIterator<'_, K, V> {
        PersistentTreeMapIterator {
            inner: self.tree.iter(),
        }
    }

    /// Returns an iterator over the keys in ascending order.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.iter().map(|(key, _)| key)
    }

    /// Returns an iterator over the values, ordered by their keys.
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.iter().map(|(_, value)| value)
    }

    /// Creates a map containing a single key-value pair.
    #[inline]
    #[must_use]
    pub fn singleton(key: K, value: V) -> Self {
        Self::new().insert(key, value)
    }

    /// Returns a reference to the value corresponding to the key.
    ///
    /// The key may be any borrowed form of the map's key type, but `Ord`
    /// on the borrowed form must match `Ord` on the key type.
    ///
    /// # Complexity
    ///
    /// O(log N)
    ///
    /// # Examples
    ///
    /// ```rust
    /// use arbors::PersistentTreeMap;
    ///
    /// let map = PersistentTreeMap::new().insert("hello".to_string(), 42);
    /// assert_eq!(map.get("hello"), Some(&42));
    /// assert_eq!(map.get("world"), None);
    /// ```
    #[must_use]
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.tree.find_by(key_probe(key)).map(|entry| &entry.value)
    }

    /// Returns the stored key-value pair for `key`.
    #[must_use]
    pub fn get_key_value<Q>(&self, key: &Q) -> Option<(&K, &V)>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.tree
            .find_by(key_probe(key))
            .map(|entry| (&entry.key, &entry.value))
    }

    /// Returns `true` if the map contains a value for the specified key.
    #[must_use]
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.tree.find_by(key_probe(key)).is_some()
    }

    /// Inserts a key-value pair into the map.
    ///
    /// If the map already contains the key, the value is replaced. When
    /// the exact entry is already present the original map is returned
    /// unchanged, sharing its root.
    ///
    /// # Complexity
    ///
    /// O(log N)
    ///
    /// # Examples
    ///
    /// ```rust
    /// use arbors::PersistentTreeMap;
    ///
    /// let map1 = PersistentTreeMap::new().insert(1, "one");
    /// let map2 = map1.insert(1, "ONE");
    ///
    /// assert_eq!(map1.get(&1), Some(&"one"));
    /// assert_eq!(map2.get(&1), Some(&"ONE"));
    /// ```
    #[must_use]
    pub fn insert(&self, key: K, value: V) -> Self {
        let (tree, _) = self.tree.add(MapEntry { key, value });
        Self { tree }
    }

    /// Removes a key and its value from the map.
    ///
    /// Returns the original map unchanged if the key is absent.
    ///
    /// # Complexity
    ///
    /// O(log N)
    #[must_use]
    pub fn remove<Q>(&self, key: &Q) -> Self
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.tree
            .remove(key_probe(key))
            .map_or_else(|| self.clone(), |tree| Self { tree })
    }

    /// Returns an iterator over the entries with keys greater than or
    /// equal to `key`, in ascending key order.
    ///
    /// A key below the minimum positions the iterator at the first entry.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use arbors::PersistentTreeMap;
    ///
    /// let map: PersistentTreeMap<i32, i32> = (0..10).map(|key| (key, key)).collect();
    /// let keys: Vec<i32> = map.iter_from(&7).map(|(key, _)| *key).collect();
    /// assert_eq!(keys, vec![7, 8, 9]);
    /// ```
    #[must_use]
    pub fn iter_from<Q>(&self, key: &Q) -> PersistentTreeMapIterator<'_, K, V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        PersistentTreeMapIterator {
            inner: self.tree.iter_from(key_probe(key)),
        }
    }

    /// Returns an iterator over the entries whose keys fall within
    /// `range`, in ascending key order.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use arbors::PersistentTreeMap;
    ///
    /// let map: PersistentTreeMap<i32, i32> = (0..10).map(|key| (key, key)).collect();
    /// let keys: Vec<i32> = map.range(2..5).map(|(key, _)| *key).collect();
    /// assert_eq!(keys, vec![2, 3, 4]);
    /// ```
    pub fn range<R>(&self, range: R) -> PersistentTreeMapRangeIterator<'_, K, V>
    where
        R: RangeBounds<K>,
    {
        let inner = match range.start_bound() {
            Bound::Unbounded => self.tree.iter(),
            Bound::Included(start) => self.tree.iter_from(key_probe(start)),
            Bound::Excluded(start) => self.tree.iter_from(|entry: &MapEntry<K, V>| {
                match entry.key.cmp(start) {
                    // An equal key sorts before the cut as well
                    Ordering::Equal => Ordering::Less,
                    ordering => ordering,
                }
            }),
        };
        let end = match range.end_bound() {
            Bound::Unbounded => Bound::Unbounded,
            Bound::Included(end) => Bound::Included(end.clone()),
            Bound::Excluded(end) => Bound::Excluded(end.clone()),
        };
        PersistentTreeMapRangeIterator { inner, end }
    }

    /// Returns a transient version of this map for efficient batch
    /// mutation.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use arbors::PersistentTreeMap;
    ///
    /// let map: PersistentTreeMap<i32, i32> = PersistentTreeMap::new();
    /// let mut transient = map.transient();
    /// for key in 0..100 {
    ///     transient.insert(key, key);
    /// }
    /// let filled = transient.persistent();
    /// assert_eq!(filled.len(), 100);
    /// assert!(map.is_empty());
    /// ```
    #[must_use]
    pub fn transient(&self) -> TransientTreeMap<K, V> {
        TransientTreeMap {
            tree: self.tree.to_transient(),
        }
    }
}

// =============================================================================
// TransientTreeMap Definition
// =============================================================================

/// A transient, single-owner version of [`PersistentTreeMap`].
///
/// Mutations happen in place on nodes created during this transient
/// session and copy-on-write everywhere else. Calling
/// [`TransientTreeMap::persistent`] freezes the transient; any operation
/// after that panics.
pub struct TransientTreeMap<K, V> {
    tree: BTree<MapEntry<K, V>>,
}

impl<K: Ord + Clone, V: Clone + PartialEq> TransientTreeMap<K, V> {
    /// Creates a new empty transient map.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        PersistentTreeMap::new().transient()
    }

    /// Returns the number of entries in the map.
    ///
    /// # Panics
    ///
    /// Panics if called after [`Self::persistent`].
    #[must_use]
    pub fn len(&self) -> usize {
        self.ensure_editable();
        self.tree.len()
    }

    /// Returns `true` if the map contains no entries.
    ///
    /// # Panics
    ///
    /// Panics if called after [`Self::persistent`].
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a reference to the value corresponding to the key.
    ///
    /// # Panics
    ///
    /// Panics if called after [`Self::persistent`].
    #[must_use]
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.ensure_editable();
        self.tree.find_by(key_probe(key)).map(|entry| &entry.value)
    }

    /// Returns `true` if the map contains a value for the specified key.
    ///
    /// # Panics
    ///
    /// Panics if called after [`Self::persistent`].
    #[must_use]
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.get(key).is_some()
    }

    /// Inserts a key-value pair in place.
    ///
    /// # Panics
    ///
    /// Panics if called after [`Self::persistent`].
    pub fn insert(&mut self, key: K, value: V) -> &mut Self {
        self.ensure_editable();
        self.tree.add_in_place(MapEntry { key, value });
        self
    }

    /// Removes a key and its value in place.
    ///
    /// # Panics
    ///
    /// Panics if called after [`Self::persistent`].
    pub fn remove<Q>(&mut self, key: &Q) -> &mut Self
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.ensure_editable();
        self.tree.remove_in_place(key_probe(key));
        self
    }

    /// Converts this transient into a persistent map in O(1).
    ///
    /// # Panics
    ///
    /// Panics if called twice: the first call seals the transient and any
    /// later operation on it fails.
    #[must_use]
    pub fn persistent(&mut self) -> PersistentTreeMap<K, V> {
        self.ensure_editable();
        PersistentTreeMap {
            tree: self.tree.into_persistent(),
        }
    }

    fn ensure_editable(&self) {
        assert!(self.tree.is_live(), "{USED_AFTER_PERSISTENT}");
    }
}

impl<K: Ord + Clone, V: Clone + PartialEq> Default for TransientTreeMap<K, V> {
    #[inline]
    fn default() -> Self {
        TransientTreeMap::new()
    }
}

impl<K: Ord + Clone, V: Clone + PartialEq> Extend<(K, V)> for TransientTreeMap<K, V> {
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (key, value) in iter {
            self.insert(key, value);
        }
    }
}

// =============================================================================
// Iterator Implementations
// =============================================================================

/// An iterator over the entries of a [`PersistentTreeMap`] in ascending
/// key order.
pub struct PersistentTreeMapIterator<'a, K, V> {
    inner: BTreeIterator<'a, MapEntry<K, V>>,
}

impl<'a, K, V> Iterator for PersistentTreeMapIterator<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|entry| (&entry.key, &entry.value))
    }
}

/// An iterator over a key range of a [`PersistentTreeMap`].
pub struct PersistentTreeMapRangeIterator<'a, K, V> {
    inner: BTreeIterator<'a, MapEntry<K, V>>,
    end: Bound<K>,
}

impl<'a, K: Ord, V> Iterator for PersistentTreeMapRangeIterator<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.inner.next()?;
        let in_range = match &self.end {
            Bound::Unbounded => true,
            Bound::Included(end) => entry.key <= *end,
            Bound::Excluded(end) => entry.key < *end,
        };
        in_range.then_some((&entry.key, &entry.value))
    }
}

/// An owning iterator over the entries of a [`PersistentTreeMap`].
pub struct PersistentTreeMapIntoIterator<K, V> {
    entries: std::vec::IntoIter<(K, V)>,
}

impl<K, V> Iterator for PersistentTreeMapIntoIterator<K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.entries.size_hint()
    }
}

impl<K: Ord + Clone, V: Clone + PartialEq> IntoIterator for PersistentTreeMap<K, V> {
    type Item = (K, V);
    type IntoIter = PersistentTreeMapIntoIterator<K, V>;

    fn into_iter(self) -> Self::IntoIter {
        let entries: Vec<(K, V)> = self
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        PersistentTreeMapIntoIterator {
            entries: entries.into_iter(),
        }
    }
}

impl<'a, K: Ord + Clone, V: Clone + PartialEq> IntoIterator for &'a PersistentTreeMap<K, V> {
    type Item = (&'a K, &'a V);
    type IntoIter = PersistentTreeMapIterator<'a, K, V>;

    #[inline]
    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

// =============================================================================
// Standard Trait Implementations
// =============================================================================

impl<K, V> Default for PersistentTreeMap<K, V> {
    #[inline]
    fn default() -> Self {
        PersistentTreeMap::new()
    }
}

impl<K: Ord + Clone, V: Clone + PartialEq> FromIterator<(K, V)> for PersistentTreeMap<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut transient = TransientTreeMap::new();
        for (key, value) in iter {
            transient.insert(key, value);
        }
        transient.persistent()
    }
}

impl<K: Ord + Clone, V: Clone + PartialEq> Extend<(K, V)> for PersistentTreeMap<K, V> {
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        let mut transient = self.transient();
        for (key, value) in iter {
            transient.insert(key, value);
        }
        *self = transient.persistent();
    }
}

impl<K: Ord + Clone + PartialEq, V: Clone + PartialEq> PartialEq for PersistentTreeMap<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .iter()
                .zip(other.iter())
                .all(|(left, right)| left == right)
    }
}

impl<K: Ord + Clone + Eq, V: Clone + Eq> Eq for PersistentTreeMap<K, V> {}

impl<K: Ord + Clone + Hash, V: Clone + PartialEq + Hash> Hash for PersistentTreeMap<K, V> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.len().hash(state);
        for (key, value) in self.iter() {
            key.hash(state);
            value.hash(state);
        }
    }
}

impl<K: Ord + Clone + fmt::Debug, V: Clone + PartialEq + fmt::Debug> fmt::Debug
    for PersistentTreeMap<K, V>
{
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.debug_map().entries(self.iter()).finish()
    }
}

// =============================================================================
// Serde Support
// =============================================================================

#[cfg(feature = "serde")]
impl<K, V> serde::Serialize for PersistentTreeMap<K, V>
where
    K: serde::Serialize + Ord + Clone,
    V: serde::Serialize + Clone + PartialEq,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(self.len()))?;
        for (key, value) in self.iter() {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

#[cfg(feature = "serde")]
struct PersistentTreeMapVisitor<K, V> {
    key_marker: std::marker::PhantomData<K>,
    value_marker: std::marker::PhantomData<V>,
}

#[cfg(feature = "serde")]
impl<'de, K, V> serde::de::Visitor<'de> for PersistentTreeMapVisitor<K, V>
where
    K: serde::Deserialize<'de> + Ord + Clone,
    V: serde::Deserialize<'de> + Clone + PartialEq,
{
    type Value = PersistentTreeMap<K, V>;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("a map")
    }

    fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
    where
        A: serde::de::MapAccess<'de>,
    {
        let mut transient = TransientTreeMap::new();
        while let Some((key, value)) = access.next_entry()? {
            transient.insert(key, value);
        }
        Ok(transient.persistent())
    }
}

#[cfg(feature = "serde")]
impl<'de, K, V> serde::Deserialize<'de> for PersistentTreeMap<K, V>
where
    K: serde::Deserialize<'de> + Ord + Clone,
    V: serde::Deserialize<'de> + Clone + PartialEq,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_map(PersistentTreeMapVisitor {
            key_marker: std::marker::PhantomData,
            value_marker: std::marker::PhantomData,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
