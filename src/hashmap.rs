//! Persistent (immutable) hash map based on HAMT.
//!
//! This module provides [`PersistentHashMap`], an immutable hash map that
//! uses structural sharing for efficient operations, and
//! [`TransientHashMap`], its single-owner mutable builder.
//!
//! # Overview
//!
//! `PersistentHashMap` is a Hash Array Mapped Trie (HAMT): a 32-way
//! branching trie navigated by successive 5-bit slices of the key hash.
//!
//! - O(log32 N) get (effectively O(1) for practical sizes)
//! - O(log32 N) insert
//! - O(log32 N) remove
//! - O(1) len and `is_empty`
//!
//! All operations return new maps without modifying the original,
//! and structural sharing ensures memory efficiency.
//!
//! # Internal Structure
//!
//! Three node kinds make up the trie:
//!
//! - *Bitmap-indexed* nodes hold up to 16 populated slots in a packed
//!   array addressed through a 32-bit bitmap; a slot is either a direct
//!   entry or a child pointer.
//! - *Array* nodes are dense 32-slot nodes; a bitmap node that receives a
//!   17th slot unpacks into one, and an array node whose population drops
//!   to 16 packs back.
//! - *Hash-collision* nodes hold entries whose keys share a full hash.
//!
//! Hashing is seeded per map: every empty map draws a fresh
//! [`RandomState`], and all maps derived from it inherit the seed so that
//! structural addressing stays consistent. Equality of maps is defined
//! over entry sets and is therefore seed-independent.
//!
//! # Examples
//!
//! ```rust
//! use arbors::PersistentHashMap;
//!
//! let map = PersistentHashMap::new()
//!     .insert("one".to_string(), 1)
//!     .insert("two".to_string(), 2);
//!
//! assert_eq!(map.get("one"), Some(&1));
//!
//! // Structural sharing: the original map is preserved
//! let updated = map.insert("one".to_string(), 100);
//! assert_eq!(map.get("one"), Some(&1));       // Original unchanged
//! assert_eq!(updated.get("one"), Some(&100)); // New version
//! ```

use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::iter::FromIterator;

use crate::transience::{EditToken, USED_AFTER_PERSISTENT};
use crate::ReferenceCounter;

// =============================================================================
// Constants
// =============================================================================

/// Branching factor (2^5 = 32)
const BRANCHING_FACTOR: usize = 32;

/// Bits per level in the trie
const BITS_PER_LEVEL: usize = 5;

/// Bit mask for extracting an index within a node
const MASK: u64 = (BRANCHING_FACTOR - 1) as u64;

/// A bitmap node holding more than this many slots unpacks into an array
/// node; an array node dropping back to this population packs again.
const BITMAP_CAPACITY: usize = BRANCHING_FACTOR / 2;

/// Maximum trie depth: ceil(64 hash bits / 5 bits per level).
const MAX_ITER_DEPTH: usize = (64 + BITS_PER_LEVEL - 1) / BITS_PER_LEVEL + 1;

// =============================================================================
// Hashing
// =============================================================================

#[inline]
fn bit_position(hash: u64, shift: usize) -> u32 {
    1 << ((hash >> shift) & MASK)
}

#[inline]
fn array_index(hash: u64, shift: usize) -> usize {
    ((hash >> shift) & MASK) as usize
}

// =============================================================================
// Node Definition
// =============================================================================

type NodeRef<K, V> = ReferenceCounter<Node<K, V>>;

/// Internal node structure for the HAMT.
#[derive(Clone)]
enum Node<K, V> {
    /// Bitmap-indexed branch node with a packed slot array
    Bitmap(BitmapNode<K, V>),
    /// Dense 32-slot branch node
    Array(ArrayNode<K, V>),
    /// Collision node for keys with the same full hash
    Collision(CollisionNode<K, V>),
}

/// A slot of a bitmap node.
#[derive(Clone)]
enum Slot<K, V> {
    /// A key-value entry stored directly in the node
    Entry { key: K, value: V },
    /// A sub-node
    Child(NodeRef<K, V>),
}

#[derive(Clone)]
struct BitmapNode<K, V> {
    bitmap: u32,
    slots: Vec<Slot<K, V>>,
    edit: EditToken,
}

#[derive(Clone)]
struct ArrayNode<K, V> {
    count: usize,
    children: [Option<NodeRef<K, V>>; BRANCHING_FACTOR],
    edit: EditToken,
}

#[derive(Clone)]
struct CollisionNode<K, V> {
    hash: u64,
    entries: Vec<(K, V)>,
    edit: EditToken,
}

impl<K, V> BitmapNode<K, V> {
    /// Packed index of `bit` within the slot array.
    #[inline]
    fn slot_index(&self, bit: u32) -> usize {
        (self.bitmap & (bit - 1)).count_ones() as usize
    }
}

/// Outcome of an insertion below a node.
#[derive(Clone, Copy, PartialEq, Eq)]
enum InsertOutcome {
    /// The entry was already present with an equal value
    Unchanged,
    /// An existing key got a new value
    Replaced,
    /// A new entry appeared
    Added,
}

/// Outcome of a removal below a node.
#[derive(Clone, Copy, PartialEq, Eq)]
enum RemoveOutcome {
    /// The key was not found
    Unchanged,
    /// The entry was removed and the subtree still holds others
    Removed,
    /// The entry was removed and the subtree is now empty
    RemovedEmpty,
}

impl<K, V> Node<K, V> {
    fn empty_bitmap(edit: EditToken) -> Self {
        Node::Bitmap(BitmapNode {
            bitmap: 0,
            slots: Vec::new(),
            edit,
        })
    }

    const fn edit(&self) -> &EditToken {
        match self {
            Node::Bitmap(node) => &node.edit,
            Node::Array(node) => &node.edit,
            Node::Collision(node) => &node.edit,
        }
    }

    /// Looks up `key` below this node.
    fn find<'a, Q>(&'a self, shift: usize, hash: u64, key: &Q) -> Option<(&'a K, &'a V)>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        match self {
            Node::Bitmap(node) => {
                let bit = bit_position(hash, shift);
                if node.bitmap & bit == 0 {
                    return None;
                }
                match &node.slots[node.slot_index(bit)] {
                    Slot::Entry { key: slot_key, value } => {
                        (slot_key.borrow() == key).then_some((slot_key, value))
                    }
                    Slot::Child(child) => child.find(shift + BITS_PER_LEVEL, hash, key),
                }
            }
            Node::Array(node) => node.children[array_index(hash, shift)]
                .as_ref()?
                .find(shift + BITS_PER_LEVEL, hash, key),
            Node::Collision(node) => node
                .entries
                .iter()
                .find(|(entry_key, _)| entry_key.borrow() == key)
                .map(|(entry_key, value)| (entry_key, value)),
        }
    }
}

impl<K: Clone + Hash + Eq, V: Clone + PartialEq> Node<K, V> {
    /// Shallow copy of this node stamped with a new token.
    fn cloned_with_edit(&self, edit: EditToken) -> Self {
        match self {
            Node::Bitmap(node) => Node::Bitmap(BitmapNode {
                bitmap: node.bitmap,
                slots: node.slots.clone(),
                edit,
            }),
            Node::Array(node) => Node::Array(ArrayNode {
                count: node.count,
                children: node.children.clone(),
                edit,
            }),
            Node::Collision(node) => Node::Collision(CollisionNode {
                hash: node.hash,
                entries: node.entries.clone(),
                edit,
            }),
        }
    }

    /// Makes the node behind `this` writable under `edit`; copies on write
    /// when the node carries any other token or `edit` is frozen.
    fn make_editable<'a>(this: &'a mut NodeRef<K, V>, edit: &EditToken) -> &'a mut Self {
        if !this.edit().writable_under(edit) {
            *this = ReferenceCounter::new(this.cloned_with_edit(edit.clone()));
        }
        ReferenceCounter::make_mut(this)
    }

    /// Inserts `key`/`value` below this node.
    fn insert(
        this: &mut NodeRef<K, V>,
        shift: usize,
        hash: u64,
        key: K,
        value: V,
        edit: &EditToken,
        hasher: &RandomState,
    ) -> InsertOutcome {
        // Peek at the slot first so a value-equal reinsert stays a true
        // no-op with no path copy.
        match this.as_ref() {
            Node::Bitmap(node) => {
                let bit = bit_position(hash, shift);
                if node.bitmap & bit == 0 {
                    if node.slots.len() >= BITMAP_CAPACITY {
                        Self::unpack_and_insert(this, shift, hash, key, value, edit, hasher);
                        return InsertOutcome::Added;
                    }
                    let index = node.slot_index(bit);
                    let node = match Self::make_editable(this, edit) {
                        Node::Bitmap(node) => node,
                        _ => return InsertOutcome::Unchanged,
                    };
                    node.slots.insert(index, Slot::Entry { key, value });
                    node.bitmap |= bit;
                    return InsertOutcome::Added;
                }

                let index = node.slot_index(bit);
                match &node.slots[index] {
                    Slot::Entry {
                        key: slot_key,
                        value: slot_value,
                    } => {
                        if *slot_key == key {
                            if *slot_value == value {
                                return InsertOutcome::Unchanged;
                            }
                            if let Node::Bitmap(node) = Self::make_editable(this, edit) {
                                node.slots[index] = Slot::Entry { key, value };
                            }
                            return InsertOutcome::Replaced;
                        }
                        // Two distinct keys in one slot: either a full hash
                        // collision or a deeper split.
                        let slot_hash = hasher.hash_one(slot_key);
                        let child = if slot_hash == hash {
                            let (slot_key, slot_value) = (slot_key.clone(), slot_value.clone());
                            ReferenceCounter::new(Node::Collision(CollisionNode {
                                hash,
                                entries: vec![(slot_key, slot_value), (key, value)],
                                edit: edit.clone(),
                            }))
                        } else {
                            let mut subtree = ReferenceCounter::new(Node::empty_bitmap(edit.clone()));
                            let (slot_key, slot_value) = (slot_key.clone(), slot_value.clone());
                            Self::insert(
                                &mut subtree,
                                shift + BITS_PER_LEVEL,
                                slot_hash,
                                slot_key,
                                slot_value,
                                edit,
                                hasher,
                            );
                            Self::insert(
                                &mut subtree,
                                shift + BITS_PER_LEVEL,
                                hash,
                                key,
                                value,
                                edit,
                                hasher,
                            );
                            subtree
                        };
                        if let Node::Bitmap(node) = Self::make_editable(this, edit) {
                            node.slots[index] = Slot::Child(child);
                        }
                        InsertOutcome::Added
                    }
                    Slot::Child(_) => {
                        let node = match Self::make_editable(this, edit) {
                            Node::Bitmap(node) => node,
                            _ => return InsertOutcome::Unchanged,
                        };
                        let Slot::Child(child) = &mut node.slots[index] else {
                            return InsertOutcome::Unchanged;
                        };
                        Self::insert(child, shift + BITS_PER_LEVEL, hash, key, value, edit, hasher)
                    }
                }
            }
            Node::Array(node) => {
                let index = array_index(hash, shift);
                if node.children[index].is_none() {
                    let mut child = ReferenceCounter::new(Node::empty_bitmap(edit.clone()));
                    Self::insert(&mut child, shift + BITS_PER_LEVEL, hash, key, value, edit, hasher);
                    if let Node::Array(node) = Self::make_editable(this, edit) {
                        node.children[index] = Some(child);
                        node.count += 1;
                    }
                    return InsertOutcome::Added;
                }
                let node = match Self::make_editable(this, edit) {
                    Node::Array(node) => node,
                    _ => return InsertOutcome::Unchanged,
                };
                let Some(child) = &mut node.children[index] else {
                    return InsertOutcome::Unchanged;
                };
                Self::insert(child, shift + BITS_PER_LEVEL, hash, key, value, edit, hasher)
            }
            Node::Collision(node) => {
                if node.hash == hash {
                    let position = node.entries.iter().position(|(entry_key, _)| *entry_key == key);
                    if let Some(position) = position {
                        if node.entries[position].1 == value {
                            return InsertOutcome::Unchanged;
                        }
                        if let Node::Collision(node) = Self::make_editable(this, edit) {
                            node.entries[position] = (key, value);
                        }
                        return InsertOutcome::Replaced;
                    }
                    if let Node::Collision(node) = Self::make_editable(this, edit) {
                        node.entries.push((key, value));
                    }
                    return InsertOutcome::Added;
                }
                // Different hash at this depth: wrap the collision node in a
                // bitmap node and descend again.
                let wrapped = Node::Bitmap(BitmapNode {
                    bitmap: bit_position(node.hash, shift),
                    slots: vec![Slot::Child(this.clone())],
                    edit: edit.clone(),
                });
                *this = ReferenceCounter::new(wrapped);
                Self::insert(this, shift, hash, key, value, edit, hasher)
            }
        }
    }

    /// Unpacks a full bitmap node into a dense array node while inserting
    /// the new entry; direct entries are promoted into singleton subtrees.
    fn unpack_and_insert(
        this: &mut NodeRef<K, V>,
        shift: usize,
        hash: u64,
        key: K,
        value: V,
        edit: &EditToken,
        hasher: &RandomState,
    ) {
        let Node::Bitmap(node) = this.as_ref() else {
            return;
        };
        let mut children: [Option<NodeRef<K, V>>; BRANCHING_FACTOR] = std::array::from_fn(|_| None);
        let count = node.slots.len() + 1;

        let mut slot_iter = node.slots.iter();
        for index in 0..BRANCHING_FACTOR {
            if (node.bitmap >> index) & 1 == 0 {
                continue;
            }
            let Some(slot) = slot_iter.next() else { break };
            children[index] = Some(match slot {
                Slot::Entry {
                    key: slot_key,
                    value: slot_value,
                } => {
                    let mut subtree = ReferenceCounter::new(Node::empty_bitmap(edit.clone()));
                    Self::insert(
                        &mut subtree,
                        shift + BITS_PER_LEVEL,
                        hasher.hash_one(slot_key),
                        slot_key.clone(),
                        slot_value.clone(),
                        edit,
                        hasher,
                    );
                    subtree
                }
                Slot::Child(child) => child.clone(),
            });
        }

        let index = array_index(hash, shift);
        let mut new_child = ReferenceCounter::new(Node::empty_bitmap(edit.clone()));
        Self::insert(&mut new_child, shift + BITS_PER_LEVEL, hash, key, value, edit, hasher);
        children[index] = Some(new_child);

        *this = ReferenceCounter::new(Node::Array(ArrayNode {
            count,
            children,
            edit: edit.clone(),
        }));
    }

    /// Removes `key` below this node.
    fn remove<Q>(
        this: &mut NodeRef<K, V>,
        shift: usize,
        hash: u64,
        key: &Q,
        edit: &EditToken,
    ) -> RemoveOutcome
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        match this.as_ref() {
            Node::Bitmap(node) => {
                let bit = bit_position(hash, shift);
                if node.bitmap & bit == 0 {
                    return RemoveOutcome::Unchanged;
                }
                let index = node.slot_index(bit);
                match &node.slots[index] {
                    Slot::Entry { key: slot_key, .. } => {
                        if slot_key.borrow() != key {
                            return RemoveOutcome::Unchanged;
                        }
                        if node.bitmap == bit {
                            return RemoveOutcome::RemovedEmpty;
                        }
                        if let Node::Bitmap(node) = Self::make_editable(this, edit) {
                            node.slots.remove(index);
                            node.bitmap &= !bit;
                        }
                        RemoveOutcome::Removed
                    }
                    Slot::Child(_) => {
                        let only_slot = node.bitmap == bit;
                        let node = match Self::make_editable(this, edit) {
                            Node::Bitmap(node) => node,
                            _ => return RemoveOutcome::Unchanged,
                        };
                        let Slot::Child(child) = &mut node.slots[index] else {
                            return RemoveOutcome::Unchanged;
                        };
                        match Self::remove(child, shift + BITS_PER_LEVEL, hash, key, edit) {
                            RemoveOutcome::Unchanged => RemoveOutcome::Unchanged,
                            RemoveOutcome::Removed => {
                                // A collision pair reduced to one entry comes
                                // back inline as a plain slot.
                                if let Node::Collision(collision) = child.as_ref() {
                                    if collision.entries.len() == 1 {
                                        let (only_key, only_value) = collision.entries[0].clone();
                                        node.slots[index] = Slot::Entry {
                                            key: only_key,
                                            value: only_value,
                                        };
                                    }
                                }
                                RemoveOutcome::Removed
                            }
                            RemoveOutcome::RemovedEmpty => {
                                if only_slot {
                                    return RemoveOutcome::RemovedEmpty;
                                }
                                node.slots.remove(index);
                                node.bitmap &= !bit;
                                RemoveOutcome::Removed
                            }
                        }
                    }
                }
            }
            Node::Array(node) => {
                let index = array_index(hash, shift);
                if node.children[index].is_none() {
                    return RemoveOutcome::Unchanged;
                }
                let count = node.count;
                let node = match Self::make_editable(this, edit) {
                    Node::Array(node) => node,
                    _ => return RemoveOutcome::Unchanged,
                };
                let Some(child) = &mut node.children[index] else {
                    return RemoveOutcome::Unchanged;
                };
                match Self::remove(child, shift + BITS_PER_LEVEL, hash, key, edit) {
                    RemoveOutcome::Unchanged => RemoveOutcome::Unchanged,
                    RemoveOutcome::Removed => RemoveOutcome::Removed,
                    RemoveOutcome::RemovedEmpty => {
                        node.children[index] = None;
                        node.count = count - 1;
                        if node.count <= BITMAP_CAPACITY {
                            let packed = node.pack(edit);
                            *this = ReferenceCounter::new(Node::Bitmap(packed));
                        }
                        RemoveOutcome::Removed
                    }
                }
            }
            Node::Collision(node) => {
                let Some(position) = node
                    .entries
                    .iter()
                    .position(|(entry_key, _)| entry_key.borrow() == key)
                else {
                    return RemoveOutcome::Unchanged;
                };
                if node.entries.len() == 1 {
                    return RemoveOutcome::RemovedEmpty;
                }
                if let Node::Collision(node) = Self::make_editable(this, edit) {
                    node.entries.remove(position);
                }
                RemoveOutcome::Removed
            }
        }
    }
}

impl<K, V> ArrayNode<K, V> {
    /// Packs this array node back into a bitmap node.
    fn pack(&self, edit: &EditToken) -> BitmapNode<K, V> {
        let mut bitmap = 0u32;
        let mut slots = Vec::with_capacity(self.count);
        for (index, child) in self.children.iter().enumerate() {
            if let Some(child) = child {
                bitmap |= 1 << index;
                slots.push(Slot::Child(child.clone()));
            }
        }
        BitmapNode {
            bitmap,
            slots,
            edit: edit.clone(),
        }
    }
}

// =============================================================================
// PersistentHashMap Definition
// =============================================================================

/// A persistent (immutable) hash map based on HAMT.
///
/// `PersistentHashMap` is an immutable data structure that uses structural
/// sharing to efficiently support functional programming patterns.
///
/// # Time Complexity
///
/// | Operation      | Complexity        |
/// |----------------|-------------------|
/// | `new`          | O(1)              |
/// | `get`          | O(log32 N)        |
/// | `insert`       | O(log32 N)        |
/// | `remove`       | O(log32 N)        |
/// | `contains_key` | O(log32 N)        |
/// | `len`          | O(1)              |
/// | `is_empty`     | O(1)              |
/// | `transient`    | O(1)              |
///
/// # Examples
///
/// ```rust
/// use arbors::PersistentHashMap;
///
/// let map = PersistentHashMap::singleton("key".to_string(), 42);
/// assert_eq!(map.get("key"), Some(&42));
/// ```
#[derive(Clone)]
pub struct PersistentHashMap<K, V> {
    /// Per-map hash state; drawn fresh for every empty map and inherited
    /// by all derivatives so structural addressing stays consistent
    hasher: RandomState,
    /// Number of entries
    length: usize,
    /// Root node of the trie
    root: NodeRef<K, V>,
}

impl<K, V> PersistentHashMap<K, V> {
    /// Creates a new empty map with a fresh random hash seed.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use arbors::PersistentHashMap;
    ///
    /// let map: PersistentHashMap<String, i32> = PersistentHashMap::new();
    /// assert!(map.is_empty());
    /// ```
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            hasher: RandomState::new(),
            length: 0,
            root: ReferenceCounter::new(Node::empty_bitmap(EditToken::frozen())),
        }
    }

    /// Returns the number of entries in the map.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.length
    }

    /// Returns `true` if the map contains no entries.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Returns an iterator over the entries, in unspecified order.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use arbors::PersistentHashMap;
    ///
    /// let map = PersistentHashMap::new()
    ///     .insert("a".to_string(), 1)
    ///     .insert("b".to_string(), 2);
    ///
    /// let mut total = 0;
    /// for (_, value) in map.iter() {
    ///     total += value;
    /// }
    /// assert_eq!(total, 3);
    /// ```
    #[must_use]
    pub fn iter(&self) -> PersistentHashMapIterator<'_, K, V> {
        PersistentHashMapIterator::new(&self.root)
    }

    /// Returns an iterator over the keys, in unspecified order.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.iter().map(|(key, _)| key)
    }

    /// Returns an iterator over the values, in unspecified order.
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.iter().map(|(_, value)| value)
    }
}

impl<K: Clone + Hash + Eq, V: Clone + PartialEq> PersistentHashMap<K, V> {
    /// Creates a map containing a single key-value pair.
    #[inline]
    #[must_use]
    pub fn singleton(key: K, value: V) -> Self {
        Self::new().insert(key, value)
    }

    /// Returns a reference to the value corresponding to the key.
    ///
    /// The key may be any borrowed form of the map's key type, but `Hash`
    /// and `Eq` on the borrowed form must match those for the key type.
    ///
    /// # Complexity
    ///
    /// O(log32 N)
    ///
    /// # Examples
    ///
    /// ```rust
    /// use arbors::PersistentHashMap;
    ///
    /// let map = PersistentHashMap::new().insert("hello".to_string(), 42);
    ///
    /// // Can use &str to look up String keys
    /// assert_eq!(map.get("hello"), Some(&42));
    /// assert_eq!(map.get("world"), None);
    /// ```
    #[must_use]
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get_key_value(key).map(|(_, value)| value)
    }

    /// Returns the stored key-value pair for `key`.
    #[must_use]
    pub fn get_key_value<Q>(&self, key: &Q) -> Option<(&K, &V)>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.root.find(0, self.hasher.hash_one(key), key)
    }

    /// Returns `true` if the map contains a value for the specified key.
    #[must_use]
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get_key_value(key).is_some()
    }

    /// Inserts a key-value pair into the map.
    ///
    /// If the map already contains the key, the value is replaced. When the
    /// exact entry is already present the original map is returned
    /// unchanged, sharing its root.
    ///
    /// # Complexity
    ///
    /// O(log32 N)
    ///
    /// # Examples
    ///
    /// ```rust
    /// use arbors::PersistentHashMap;
    ///
    /// let map1 = PersistentHashMap::new().insert("key".to_string(), 1);
    /// let map2 = map1.insert("key".to_string(), 2);
    ///
    /// assert_eq!(map1.get("key"), Some(&1)); // Original unchanged
    /// assert_eq!(map2.get("key"), Some(&2)); // New version
    /// ```
    #[must_use]
    pub fn insert(&self, key: K, value: V) -> Self {
        let hash = self.hasher.hash_one(&key);
        let edit = self.root.edit().clone();
        let mut root = self.root.clone();
        match Node::insert(&mut root, 0, hash, key, value, &edit, &self.hasher) {
            InsertOutcome::Unchanged => self.clone(),
            InsertOutcome::Replaced => Self {
                hasher: self.hasher.clone(),
                length: self.length,
                root,
            },
            InsertOutcome::Added => Self {
                hasher: self.hasher.clone(),
                length: self.length + 1,
                root,
            },
        }
    }

    /// Removes a key and its value from the map.
    ///
    /// Returns the original map unchanged if the key is absent.
    ///
    /// # Complexity
    ///
    /// O(log32 N)
    ///
    /// # Examples
    ///
    /// ```rust
    /// use arbors::PersistentHashMap;
    ///
    /// let map = PersistentHashMap::new().insert("key".to_string(), 1);
    /// let removed = map.remove("key");
    ///
    /// assert_eq!(map.len(), 1);
    /// assert_eq!(removed.len(), 0);
    /// ```
    #[must_use]
    pub fn remove<Q>(&self, key: &Q) -> Self
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hasher.hash_one(key);
        let edit = self.root.edit().clone();
        let mut root = self.root.clone();
        match Node::remove(&mut root, 0, hash, key, &edit) {
            RemoveOutcome::Unchanged => self.clone(),
            RemoveOutcome::Removed => Self {
                hasher: self.hasher.clone(),
                length: self.length - 1,
                root,
            },
            RemoveOutcome::RemovedEmpty => Self {
                hasher: self.hasher.clone(),
                length: self.length - 1,
                root: ReferenceCounter::new(Node::empty_bitmap(EditToken::frozen())),
            },
        }
    }

    /// Returns a transient version of this map for efficient batch
    /// mutation.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use arbors::PersistentHashMap;
    ///
    /// let map: PersistentHashMap<i32, i32> = PersistentHashMap::new();
    /// let mut transient = map.transient();
    /// for index in 0..100 {
    ///     transient.insert(index, index * 2);
    /// }
    /// let filled = transient.persistent();
    /// assert_eq!(filled.len(), 100);
    /// assert!(map.is_empty());
    /// ```
    #[must_use]
    pub fn transient(&self) -> TransientHashMap<K, V> {
        TransientHashMap {
            hasher: self.hasher.clone(),
            length: self.length,
            root: self.root.clone(),
            edit: EditToken::live(),
        }
    }
}

// =============================================================================
// TransientHashMap Definition
// =============================================================================

/// A transient, single-owner version of [`PersistentHashMap`].
///
/// Mutations happen in place on nodes created during this transient session
/// and copy-on-write everywhere else, so the persistent map the transient
/// came from is never affected. Calling [`TransientHashMap::persistent`]
/// freezes the transient; any operation after that panics.
///
/// # Examples
///
/// ```rust
/// use arbors::TransientHashMap;
///
/// let mut transient = TransientHashMap::new();
/// transient.insert("a".to_string(), 1);
/// transient.insert("b".to_string(), 2);
/// let map = transient.persistent();
/// assert_eq!(map.len(), 2);
/// ```
pub struct TransientHashMap<K, V> {
    hasher: RandomState,
    length: usize,
    root: NodeRef<K, V>,
    edit: EditToken,
}

impl<K: Clone + Hash + Eq, V: Clone + PartialEq> TransientHashMap<K, V> {
    /// Creates a new empty transient map.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        PersistentHashMap::new().transient()
    }

    /// Returns the number of entries in the map.
    ///
    /// # Panics
    ///
    /// Panics if called after [`Self::persistent`].
    #[must_use]
    pub fn len(&self) -> usize {
        self.ensure_editable();
        self.length
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
        Q: Hash + Eq + ?Sized,
    {
        self.ensure_editable();
        self.root
            .find(0, self.hasher.hash_one(key), key)
            .map(|(_, value)| value)
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
        Q: Hash + Eq + ?Sized,
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
        let hash = self.hasher.hash_one(&key);
        if Node::insert(&mut self.root, 0, hash, key, value, &self.edit, &self.hasher)
            == InsertOutcome::Added
        {
            self.length += 1;
        }
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
        Q: Hash + Eq + ?Sized,
    {
        self.ensure_editable();
        let hash = self.hasher.hash_one(key);
        match Node::remove(&mut self.root, 0, hash, key, &self.edit) {
            RemoveOutcome::Unchanged => {}
            RemoveOutcome::Removed => self.length -= 1,
            RemoveOutcome::RemovedEmpty => {
                self.length -= 1;
                self.root = ReferenceCounter::new(Node::empty_bitmap(self.edit.clone()));
            }
        }
        self
    }

    /// Converts this transient into a persistent map in O(1).
    ///
    /// # Panics
    ///
    /// Panics if called twice: the first call seals the transient and any
    /// later operation on it fails.
    #[must_use]
    pub fn persistent(&mut self) -> PersistentHashMap<K, V> {
        self.ensure_editable();
        self.edit.freeze();
        PersistentHashMap {
            hasher: self.hasher.clone(),
            length: self.length,
            root: self.root.clone(),
        }
    }

    fn ensure_editable(&self) {
        assert!(self.edit.is_live(), "{USED_AFTER_PERSISTENT}");
    }
}

impl<K: Clone + Hash + Eq, V: Clone + PartialEq> Default for TransientHashMap<K, V> {
    #[inline]
    fn default() -> Self {
        TransientHashMap::new()
    }
}

impl<K: Clone + Hash + Eq, V: Clone + PartialEq> Extend<(K, V)> for TransientHashMap<K, V> {
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (key, value) in iter {
            self.insert(key, value);
        }
    }
}

// =============================================================================
// Iterator Implementations
// =============================================================================

/// A frame of the iterator stack: a node and a cursor into it.
type Frame<'a, K, V> = (Option<&'a Node<K, V>>, usize);

/// An iterator over the entries of a [`PersistentHashMap`].
///
/// The traversal keeps an explicit stack sized to the maximum possible trie
/// depth, so advancing never allocates.
pub struct PersistentHashMapIterator<'a, K, V> {
    stack: [Frame<'a, K, V>; MAX_ITER_DEPTH],
    depth: usize,
    finished: bool,
}

impl<'a, K, V> PersistentHashMapIterator<'a, K, V> {
    fn new(root: &'a Node<K, V>) -> Self {
        let mut stack: [Frame<'a, K, V>; MAX_ITER_DEPTH] = std::array::from_fn(|_| (None, 0));
        stack[0] = (Some(root), 0);
        Self {
            stack,
            depth: 0,
            finished: false,
        }
    }

    fn push(&mut self, node: &'a Node<K, V>) {
        self.depth += 1;
        self.stack[self.depth] = (Some(node), 0);
    }

    /// Pops a finished frame; returns `false` at the root.
    fn pop(&mut self) -> bool {
        self.stack[self.depth] = (None, 0);
        if self.depth == 0 {
            self.finished = true;
            return false;
        }
        self.depth -= 1;
        true
    }
}

impl<'a, K, V> Iterator for PersistentHashMapIterator<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        while !self.finished {
            let (node, cursor) = self.stack[self.depth];
            let node = node?;
            match node {
                Node::Bitmap(bitmap_node) => {
                    if cursor >= bitmap_node.slots.len() {
                        self.pop();
                        continue;
                    }
                    self.stack[self.depth].1 = cursor + 1;
                    match &bitmap_node.slots[cursor] {
                        Slot::Entry { key, value } => return Some((key, value)),
                        Slot::Child(child) => self.push(child),
                    }
                }
                Node::Array(array_node) => {
                    let child = array_node.children[cursor..]
                        .iter()
                        .enumerate()
                        .find_map(|(offset, child)| {
                            child.as_ref().map(|child| (cursor + offset, child))
                        });
                    match child {
                        Some((index, child)) => {
                            self.stack[self.depth].1 = index + 1;
                            self.push(child);
                        }
                        None => {
                            self.pop();
                        }
                    }
                }
                Node::Collision(collision_node) => {
                    if cursor >= collision_node.entries.len() {
                        self.pop();
                        continue;
                    }
                    self.stack[self.depth].1 = cursor + 1;
                    let (key, value) = &collision_node.entries[cursor];
                    return Some((key, value));
                }
            }
        }
        None
    }
}

/// An owning iterator over the entries of a [`PersistentHashMap`].
pub struct PersistentHashMapIntoIterator<K, V> {
    entries: std::vec::IntoIter<(K, V)>,
}

impl<K, V> Iterator for PersistentHashMapIntoIterator<K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.entries.size_hint()
    }
}

impl<K: Clone, V: Clone> IntoIterator for PersistentHashMap<K, V> {
    type Item = (K, V);
    type IntoIter = PersistentHashMapIntoIterator<K, V>;

    fn into_iter(self) -> Self::IntoIter {
        let entries: Vec<(K, V)> = self
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        PersistentHashMapIntoIterator {
            entries: entries.into_iter(),
        }
    }
}

impl<'a, K, V> IntoIterator for &'a PersistentHashMap<K, V> {
    type Item = (&'a K, &'a V);
    type IntoIter = PersistentHashMapIterator<'a, K, V>;

    #[inline]
    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

// =============================================================================
// Standard Trait Implementations
// =============================================================================

impl<K, V> Default for PersistentHashMap<K, V> {
    #[inline]
    fn default() -> Self {
        PersistentHashMap::new()
    }
}

impl<K: Clone + Hash + Eq, V: Clone + PartialEq> FromIterator<(K, V)> for PersistentHashMap<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut transient = TransientHashMap::new();
        for (key, value) in iter {
            transient.insert(key, value);
        }
        transient.persistent()
    }
}

impl<K: Clone + Hash + Eq, V: Clone + PartialEq> Extend<(K, V)> for PersistentHashMap<K, V> {
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        let mut transient = self.transient();
        for (key, value) in iter {
            transient.insert(key, value);
        }
        *self = transient.persistent();
    }
}

impl<K, V> PartialEq for PersistentHashMap<K, V>
where
    K: Clone + Hash + Eq,
    V: Clone + PartialEq,
{
    /// Entry-set equality; two maps with different hash seeds compare equal
    /// when they hold the same entries.
    fn eq(&self, other: &Self) -> bool {
        self.length == other.length
            && self
                .iter()
                .all(|(key, value)| other.get(key) == Some(value))
    }
}

impl<K: Clone + Hash + Eq, V: Clone + Eq> Eq for PersistentHashMap<K, V> {}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for PersistentHashMap<K, V> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.debug_map().entries(self.iter()).finish()
    }
}

// =============================================================================
// Serde Support
// =============================================================================

#[cfg(feature = "serde")]
impl<K, V> serde::Serialize for PersistentHashMap<K, V>
where
    K: serde::Serialize,
    V: serde::Serialize,
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
struct PersistentHashMapVisitor<K, V> {
    key_marker: std::marker::PhantomData<K>,
    value_marker: std::marker::PhantomData<V>,
}

#[cfg(feature = "serde")]
impl<'de, K, V> serde::de::Visitor<'de> for PersistentHashMapVisitor<K, V>
where
    K: serde::Deserialize<'de> + Clone + Hash + Eq,
    V: serde::Deserialize<'de> + Clone + PartialEq,
{
    type Value = PersistentHashMap<K, V>;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("a map")
    }

    fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
    where
        A: serde::de::MapAccess<'de>,
    {
        let mut transient = TransientHashMap::new();
        while let Some((key, value)) = access.next_entry()? {
            transient.insert(key, value);
        }
        Ok(transient.persistent())
    }
}

#[cfg(feature = "serde")]
impl<'de, K, V> serde::Deserialize<'de> for PersistentHashMap<K, V>
where
    K: serde::Deserialize<'de> + Clone + Hash + Eq,
    V: serde::Deserialize<'de> + Clone + PartialEq,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_map(PersistentHashMapVisitor {
            key_marker: std::marker::PhantomData,
            value_marker: std::marker::PhantomData,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn test_new_creates_empty_map() {
        let map: PersistentHashMap<String, i32> = PersistentHashMap::new();
        assert!(map.is_empty());
        assert_eq!(map.len(), 0);
        assert_eq!(map.get("missing"), None);
    }

    #[rstest]
    fn test_insert_and_get() {
        let map = PersistentHashMap::new()
            .insert("one".to_string(), 1)
            .insert("two".to_string(), 2)
            .insert("three".to_string(), 3);
        assert_eq!(map.len(), 3);
        assert_eq!(map.get("one"), Some(&1));
        assert_eq!(map.get("two"), Some(&2));
        assert_eq!(map.get("three"), Some(&3));
        assert_eq!(map.get("four"), None);
    }

    #[rstest]
    fn test_replacement_keeps_length() {
        let map = PersistentHashMap::new()
            .insert("a", 1)
            .insert("b", 2)
            .insert("a", 3);
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("a"), Some(&3));
        assert_eq!(map.get("b"), Some(&2));
        assert_eq!(map.get("c"), None);
    }

    #[rstest]
    fn test_insert_does_not_modify_original() {
        let map1 = PersistentHashMap::new().insert("key".to_string(), 1);
        let map2 = map1.insert("key".to_string(), 2);
        assert_eq!(map1.get("key"), Some(&1));
        assert_eq!(map2.get("key"), Some(&2));
    }

    #[rstest]
    fn test_identity_preserved_on_equal_reinsert() {
        let map = PersistentHashMap::new().insert("key".to_string(), 1);
        let same = map.insert("key".to_string(), 1);
        assert!(ReferenceCounter::ptr_eq(&map.root, &same.root));
    }

    #[rstest]
    fn test_many_entries_unpack_to_array_nodes() {
        let mut map = PersistentHashMap::new();
        for index in 0..1000 {
            map = map.insert(index, index * 2);
        }
        assert_eq!(map.len(), 1000);
        for index in 0..1000 {
            assert_eq!(map.get(&index), Some(&(index * 2)));
        }
    }

    #[rstest]
    fn test_remove_packs_array_nodes_back() {
        let mut map = PersistentHashMap::new();
        for index in 0..1000 {
            map = map.insert(index, index);
        }
        for index in 0..990 {
            map = map.remove(&index);
        }
        assert_eq!(map.len(), 10);
        for index in 990..1000 {
            assert_eq!(map.get(&index), Some(&index));
        }
        assert_eq!(map.get(&0), None);
    }

    #[rstest]
    fn test_remove_missing_returns_same_map() {
        let map = PersistentHashMap::new().insert(1, 1);
        let same = map.remove(&2);
        assert!(ReferenceCounter::ptr_eq(&map.root, &same.root));
    }

    #[rstest]
    fn test_seeds_differ_but_equality_holds() {
        let map1: PersistentHashMap<i32, i32> = (0..100).map(|index| (index, index)).collect();
        let map2: PersistentHashMap<i32, i32> = (0..100).rev().map(|index| (index, index)).collect();
        assert_eq!(map1, map2);
        assert_ne!(map1, map2.insert(100, 100));
    }

    #[rstest]
    fn test_iter_is_total() {
        let map: PersistentHashMap<i32, i32> = (0..500).map(|index| (index, index)).collect();
        let mut seen: Vec<i32> = map.iter().map(|(key, _)| *key).collect();
        seen.sort_unstable();
        let expected: Vec<i32> = (0..500).collect();
        assert_eq!(seen, expected);
    }

    #[rstest]
    fn test_transient_insert_and_persistent() {
        let mut transient = TransientHashMap::new();
        for index in 0..100 {
            transient.insert(index, index);
        }
        let map = transient.persistent();
        assert_eq!(map.len(), 100);
        assert_eq!(map.get(&42), Some(&42));
    }

    #[rstest]
    #[should_panic(expected = "transient used after persistent conversion")]
    fn test_transient_seal() {
        let mut transient: TransientHashMap<i32, i32> = TransientHashMap::new();
        transient.insert(1, 1);
        let _map = transient.persistent();
        transient.insert(2, 2);
    }

    #[rstest]
    fn test_transient_does_not_leak_into_source() {
        let map: PersistentHashMap<i32, i32> = (0..100).map(|index| (index, index)).collect();
        let mut transient = map.transient();
        for index in 0..100 {
            transient.insert(index, -1);
        }
        let mutated = transient.persistent();
        assert_eq!(map.get(&50), Some(&50));
        assert_eq!(mutated.get(&50), Some(&-1));
    }

    // Hash collisions are exercised through a key type whose hash is
    // constant while equality still distinguishes values.
    #[derive(Clone, PartialEq, Eq, Debug)]
    struct Colliding(u32);

    impl Hash for Colliding {
        fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
            0u64.hash(state);
        }
    }

    #[rstest]
    fn test_collision_insert_replace_remove() {
        let map = PersistentHashMap::new()
            .insert(Colliding(1), "one")
            .insert(Colliding(2), "two")
            .insert(Colliding(3), "three");
        assert_eq!(map.len(), 3);
        assert_eq!(map.get(&Colliding(1)), Some(&"one"));
        assert_eq!(map.get(&Colliding(2)), Some(&"two"));
        assert_eq!(map.get(&Colliding(3)), Some(&"three"));

        let replaced = map.insert(Colliding(2), "TWO");
        assert_eq!(replaced.len(), 3);
        assert_eq!(replaced.get(&Colliding(2)), Some(&"TWO"));
        assert_eq!(replaced.get(&Colliding(1)), Some(&"one"));

        let remaining = map.remove(&Colliding(1)).remove(&Colliding(2));
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining.get(&Colliding(3)), Some(&"three"));
        assert_eq!(remaining.get(&Colliding(1)), None);
    }

    #[rstest]
    fn test_collision_iteration_covers_all_entries() {
        let map = PersistentHashMap::new()
            .insert(Colliding(1), 1)
            .insert(Colliding(2), 2)
            .insert(Colliding(3), 3);
        let mut values: Vec<i32> = map.iter().map(|(_, value)| *value).collect();
        values.sort_unstable();
        assert_eq!(values, vec![1, 2, 3]);
    }
}
