//! Persistent (immutable) vector based on Radix Balanced Tree.
//!
//! This module provides [`PersistentVector`], an immutable dynamic array
//! that uses structural sharing for efficient operations, together with
//! [`TransientVector`], its single-owner mutable builder, and
//! [`VectorSlice`], a lightweight view over a range of a vector.
//!
//! # Overview
//!
//! `PersistentVector` is a 32-way branching trie (Radix Balanced Tree).
//! It provides:
//!
//! - O(log32 N) random access (effectively O(1) for practical sizes)
//! - O(log32 N) push_back (amortized O(1) with tail optimization)
//! - O(log32 N) update
//! - O(1) len and is_empty
//!
//! All operations return new vectors without modifying the original,
//! and structural sharing ensures memory efficiency.
//!
//! # Internal Structure
//!
//! The vector consists of:
//! - A root node (32-way branching trie)
//! - A tail buffer (up to 32 elements) that absorbs appends so that a new
//!   trie path is only built once per 32 elements
//!
//! Every node records the edit token it was written under. Persistent
//! operations always copy the nodes along the touched path; a transient
//! overwrites a node in place when the node carries the transient's own
//! live token.
//!
//! # Examples
//!
//! ```rust
//! use arbors::PersistentVector;
//!
//! let vector = PersistentVector::new()
//!     .push_back(1)
//!     .push_back(2)
//!     .push_back(3);
//!
//! assert_eq!(vector.get(0), Some(&1));
//! assert_eq!(vector.get(1), Some(&2));
//! assert_eq!(vector.get(2), Some(&3));
//!
//! // Structural sharing: the original vector is preserved
//! let extended = vector.push_back(4);
//! assert_eq!(vector.len(), 3);     // Original unchanged
//! assert_eq!(extended.len(), 4);   // New vector
//! ```

use std::fmt;
use std::iter::FromIterator;
use std::mem;
use std::ops::Index;

use crate::transience::{EditToken, USED_AFTER_PERSISTENT};
use crate::ReferenceCounter;

// =============================================================================
// Constants
// =============================================================================

/// Branching factor (2^5 = 32)
const BRANCHING_FACTOR: usize = 32;

/// Bits per level in the trie
const BITS_PER_LEVEL: usize = 5;

/// Bit mask for extracting index within a node
const MASK: usize = BRANCHING_FACTOR - 1;

/// Panic message for indexed access outside `[0, len)`.
const OUT_OF_BOUNDS: &str = "index out of bounds";

// =============================================================================
// Node Definition
// =============================================================================

type NodeRef<T> = ReferenceCounter<Node<T>>;

/// Internal node structure for the radix balanced tree.
#[derive(Clone)]
enum Node<T> {
    /// Branch node containing child nodes
    Branch {
        children: [Option<NodeRef<T>>; BRANCHING_FACTOR],
        edit: EditToken,
    },
    /// Leaf node containing up to 32 elements
    Leaf { elements: Vec<T>, edit: EditToken },
}

impl<T> Node<T> {
    /// Creates an empty branch node owned by `edit`.
    fn empty_branch(edit: EditToken) -> Self {
        Node::Branch {
            children: std::array::from_fn(|_| None),
            edit,
        }
    }

    /// Returns the token this node was written under.
    const fn edit(&self) -> &EditToken {
        match self {
            Node::Branch { edit, .. } | Node::Leaf { edit, .. } => edit,
        }
    }

    /// Builds a spine of branch nodes of height `level / 5` ending at `node`.
    fn new_path(level: usize, node: Self, edit: &EditToken) -> Self {
        if level == 0 {
            return node;
        }
        let mut children: [Option<NodeRef<T>>; BRANCHING_FACTOR] = std::array::from_fn(|_| None);
        children[0] = Some(ReferenceCounter::new(Self::new_path(
            level - BITS_PER_LEVEL,
            node,
            edit,
        )));
        Node::Branch {
            children,
            edit: edit.clone(),
        }
    }
}

impl<T: Clone> Node<T> {
    /// Shallow copy of this node stamped with a new token.
    fn cloned_with_edit(&self, edit: EditToken) -> Self {
        match self {
            Node::Branch { children, .. } => Node::Branch {
                children: children.clone(),
                edit,
            },
            Node::Leaf { elements, .. } => Node::Leaf {
                elements: elements.clone(),
                edit,
            },
        }
    }

    /// Makes the node behind `this` writable under `edit` and returns a
    /// mutable reference to it.
    ///
    /// When the node already carries `edit` and the token is live, the node
    /// is written in place; otherwise it is replaced by a copy stamped with
    /// `edit`. Passing a frozen token therefore degrades every write into
    /// copy-on-write, which is exactly what the persistent operations rely
    /// on.
    fn make_editable<'a>(this: &'a mut NodeRef<T>, edit: &EditToken) -> &'a mut Self {
        if !this.edit().writable_under(edit) {
            *this = ReferenceCounter::new(this.cloned_with_edit(edit.clone()));
        }
        ReferenceCounter::make_mut(this)
    }

    /// Pushes a full tail leaf down the right spine of the trie.
    ///
    /// `count` is the element count before the append; the leaf covers
    /// indices `[count - 32, count)`.
    fn push_tail(
        this: &mut NodeRef<T>,
        count: usize,
        level: usize,
        tail_node: Self,
        edit: &EditToken,
    ) {
        let subindex = ((count - 1) >> level) & MASK;
        let Node::Branch { children, .. } = Self::make_editable(this, edit) else {
            return;
        };
        if level == BITS_PER_LEVEL {
            // Bottom branch level, insert the leaf itself
            children[subindex] = Some(ReferenceCounter::new(tail_node));
        } else {
            match &mut children[subindex] {
                Some(child) => {
                    Self::push_tail(child, count, level - BITS_PER_LEVEL, tail_node, edit);
                }
                slot @ None => {
                    *slot = Some(ReferenceCounter::new(Self::new_path(
                        level - BITS_PER_LEVEL,
                        tail_node,
                        edit,
                    )));
                }
            }
        }
    }

    /// Removes the rightmost leaf from the trie.
    ///
    /// `count` is the element count before the pop. Returns `false` when
    /// the subtree behind `this` became empty and should be dropped by the
    /// caller.
    fn pop_tail(this: &mut NodeRef<T>, count: usize, level: usize, edit: &EditToken) -> bool {
        let subindex = ((count - 2) >> level) & MASK;
        if level > BITS_PER_LEVEL {
            let Node::Branch { children, .. } = Self::make_editable(this, edit) else {
                return false;
            };
            let keep_child = match &mut children[subindex] {
                Some(child) => Self::pop_tail(child, count, level - BITS_PER_LEVEL, edit),
                None => false,
            };
            if !keep_child {
                if subindex == 0 {
                    return false;
                }
                children[subindex] = None;
            }
            true
        } else if subindex == 0 {
            false
        } else {
            if let Node::Branch { children, .. } = Self::make_editable(this, edit) {
                children[subindex] = None;
            }
            true
        }
    }

    /// Replaces the element at `index` along a freshly editable path.
    fn assoc(this: &mut NodeRef<T>, level: usize, index: usize, element: T, edit: &EditToken) {
        match Self::make_editable(this, edit) {
            Node::Leaf { elements, .. } => {
                let slot = index & MASK;
                if slot < elements.len() {
                    elements[slot] = element;
                }
            }
            Node::Branch { children, .. } => {
                let subindex = (index >> level) & MASK;
                if let Some(child) = &mut children[subindex] {
                    Self::assoc(child, level - BITS_PER_LEVEL, index, element, edit);
                }
            }
        }
    }
}

// =============================================================================
// PersistentVector Definition
// =============================================================================

/// A persistent (immutable) vector based on Radix Balanced Tree.
///
/// `PersistentVector` is an immutable data structure that uses structural
/// sharing to efficiently support functional programming patterns.
///
/// # Time Complexity
///
/// | Operation    | Complexity                    |
/// |--------------|-------------------------------|
/// | `new`        | O(1)                          |
/// | `get`        | O(log32 N)                    |
/// | `push_back`  | O(log32 N) amortized O(1)     |
/// | `pop_back`   | O(log32 N)                    |
/// | `update`     | O(log32 N)                    |
/// | `len`        | O(1)                          |
/// | `is_empty`   | O(1)                          |
/// | `transient`  | O(1)                          |
/// | `iter`       | O(1) to create, O(N) to iterate |
///
/// # Examples
///
/// ```rust
/// use arbors::PersistentVector;
///
/// let vector: PersistentVector<i32> = (0..100).collect();
/// assert_eq!(vector.len(), 100);
/// assert_eq!(vector.get(50), Some(&50));
/// ```
#[derive(Clone)]
pub struct PersistentVector<T> {
    /// Total number of elements
    length: usize,
    /// Shift amount for index calculation: (depth - 1) * BITS_PER_LEVEL
    shift: usize,
    /// Root node of the trie
    root: NodeRef<T>,
    /// Tail buffer for efficient append (up to 32 elements)
    tail: ReferenceCounter<[T]>,
}

impl<T> PersistentVector<T> {
    /// Creates a new empty vector.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use arbors::PersistentVector;
    ///
    /// let vector: PersistentVector<i32> = PersistentVector::new();
    /// assert!(vector.is_empty());
    /// ```
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        PersistentVector {
            length: 0,
            shift: BITS_PER_LEVEL,
            root: ReferenceCounter::new(Node::empty_branch(EditToken::frozen())),
            tail: ReferenceCounter::from(Vec::new()),
        }
    }

    /// Creates a vector containing a single element.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use arbors::PersistentVector;
    ///
    /// let vector = PersistentVector::singleton(42);
    /// assert_eq!(vector.len(), 1);
    /// assert_eq!(vector.get(0), Some(&42));
    /// ```
    #[inline]
    #[must_use]
    pub fn singleton(element: T) -> Self {
        PersistentVector {
            length: 1,
            shift: BITS_PER_LEVEL,
            root: ReferenceCounter::new(Node::empty_branch(EditToken::frozen())),
            tail: ReferenceCounter::from(vec![element]),
        }
    }

    /// Returns the number of elements in the vector.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.length
    }

    /// Returns `true` if the vector contains no elements.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use arbors::PersistentVector;
    ///
    /// let empty: PersistentVector<i32> = PersistentVector::new();
    /// assert!(empty.is_empty());
    ///
    /// let non_empty = empty.push_back(1);
    /// assert!(!non_empty.is_empty());
    /// ```
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Returns the starting index of the tail buffer.
    #[inline]
    const fn tail_offset(&self) -> usize {
        if self.length < BRANCHING_FACTOR {
            0
        } else {
            ((self.length - 1) >> BITS_PER_LEVEL) << BITS_PER_LEVEL
        }
    }

    /// Returns the leaf (or tail) slice covering `index`.
    fn leaf_for(&self, index: usize) -> Option<&[T]> {
        if index >= self.tail_offset() {
            return Some(&self.tail);
        }
        let mut node = self.root.as_ref();
        let mut level = self.shift;
        while level > 0 {
            match node {
                Node::Branch { children, .. } => {
                    node = children[(index >> level) & MASK].as_deref()?;
                    level -= BITS_PER_LEVEL;
                }
                Node::Leaf { .. } => break,
            }
        }
        match node {
            Node::Leaf { elements, .. } => Some(elements),
            Node::Branch { .. } => None,
        }
    }

    /// Returns a reference to the element at the given index.
    ///
    /// Returns `None` if the index is out of bounds.
    ///
    /// # Complexity
    ///
    /// O(log32 N)
    ///
    /// # Examples
    ///
    /// ```rust
    /// use arbors::PersistentVector;
    ///
    /// let vector: PersistentVector<i32> = (1..=5).collect();
    /// assert_eq!(vector.get(0), Some(&1));
    /// assert_eq!(vector.get(4), Some(&5));
    /// assert_eq!(vector.get(10), None);
    /// ```
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&T> {
        if index >= self.length {
            return None;
        }
        self.leaf_for(index)?.get(index & MASK)
    }

    /// Returns a reference to the first element.
    ///
    /// Returns `None` if the vector is empty.
    #[inline]
    #[must_use]
    pub fn first(&self) -> Option<&T> {
        self.get(0)
    }

    /// Returns a reference to the last element.
    ///
    /// Returns `None` if the vector is empty.
    ///
    /// # Complexity
    ///
    /// O(1) - the last element is always in the tail
    #[inline]
    #[must_use]
    pub fn last(&self) -> Option<&T> {
        if self.is_empty() {
            None
        } else {
            self.tail.last()
        }
    }

    /// Returns an iterator over references to the elements.
    ///
    /// The iterator yields elements from front to back.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use arbors::PersistentVector;
    ///
    /// let vector: PersistentVector<i32> = (1..=5).collect();
    /// let collected: Vec<&i32> = vector.iter().collect();
    /// assert_eq!(collected, vec![&1, &2, &3, &4, &5]);
    /// ```
    pub fn iter(&self) -> PersistentVectorIterator<'_, T> {
        PersistentVectorIterator {
            vector: self,
            current_index: 0,
        }
    }

    /// Clone of the root's token; always frozen for a persistent vector,
    /// so node writes stamped with it stay copy-on-write.
    fn root_edit(&self) -> EditToken {
        self.root.edit().clone()
    }
}

impl<T: Clone> PersistentVector<T> {
    /// Appends an element to the back of the vector.
    ///
    /// Returns a new vector with the element at the end.
    ///
    /// # Complexity
    ///
    /// O(log32 N) amortized O(1) due to tail optimization
    ///
    /// # Examples
    ///
    /// ```rust
    /// use arbors::PersistentVector;
    ///
    /// let vector = PersistentVector::new()
    ///     .push_back(1)
    ///     .push_back(2);
    ///
    /// assert_eq!(vector.len(), 2);
    /// assert_eq!(vector.get(1), Some(&2));
    /// ```
    #[must_use]
    pub fn push_back(&self, element: T) -> Self {
        if self.tail.len() < BRANCHING_FACTOR {
            // Tail has space, just add to tail
            let mut new_tail = self.tail.to_vec();
            new_tail.push(element);
            return PersistentVector {
                length: self.length + 1,
                shift: self.shift,
                root: self.root.clone(),
                tail: ReferenceCounter::from(new_tail),
            };
        }

        let edit = self.root_edit();
        let tail_node = Node::Leaf {
            elements: self.tail.to_vec(),
            edit: edit.clone(),
        };

        if (self.length >> BITS_PER_LEVEL) > (1 << self.shift) {
            // The trie is full, grow the root by one level
            let mut children: [Option<NodeRef<T>>; BRANCHING_FACTOR] =
                std::array::from_fn(|_| None);
            children[0] = Some(self.root.clone());
            children[1] = Some(ReferenceCounter::new(Node::new_path(
                self.shift, tail_node, &edit,
            )));
            PersistentVector {
                length: self.length + 1,
                shift: self.shift + BITS_PER_LEVEL,
                root: ReferenceCounter::new(Node::Branch { children, edit }),
                tail: ReferenceCounter::from(vec![element]),
            }
        } else {
            // Push the tail down the right spine
            let mut root = self.root.clone();
            Node::push_tail(&mut root, self.length, self.shift, tail_node, &edit);
            PersistentVector {
                length: self.length + 1,
                shift: self.shift,
                root,
                tail: ReferenceCounter::from(vec![element]),
            }
        }
    }

    /// Removes the last element from the vector.
    ///
    /// Returns `None` if the vector is empty, otherwise returns the new
    /// vector and the removed element.
    ///
    /// # Complexity
    ///
    /// O(log32 N)
    ///
    /// # Examples
    ///
    /// ```rust
    /// use arbors::PersistentVector;
    ///
    /// let vector: PersistentVector<i32> = (1..=5).collect();
    /// let (remaining, element) = vector.pop_back().unwrap();
    ///
    /// assert_eq!(element, 5);
    /// assert_eq!(remaining.len(), 4);
    /// ```
    #[must_use]
    pub fn pop_back(&self) -> Option<(Self, T)> {
        if self.is_empty() {
            return None;
        }
        if self.length == 1 {
            return Some((PersistentVector::new(), self.tail[0].clone()));
        }
        if self.tail.len() > 1 {
            let element = self.tail.last()?.clone();
            let new_tail = self.tail[..self.tail.len() - 1].to_vec();
            return Some((
                PersistentVector {
                    length: self.length - 1,
                    shift: self.shift,
                    root: self.root.clone(),
                    tail: ReferenceCounter::from(new_tail),
                },
                element,
            ));
        }

        // The tail empties, re-materialize the previous leaf as the tail
        let element = self.tail[0].clone();
        let new_tail = ReferenceCounter::from(self.leaf_for(self.length - 2)?.to_vec());
        let edit = self.root_edit();
        let mut root = self.root.clone();
        if !Node::pop_tail(&mut root, self.length, self.shift, &edit) {
            root = ReferenceCounter::new(Node::empty_branch(edit.clone()));
        }
        let mut shift = self.shift;
        if shift > BITS_PER_LEVEL {
            // Collapse one level when only the leftmost child remains
            let collapse = match root.as_ref() {
                Node::Branch { children, .. } if children[1].is_none() => {
                    Some(children[0].clone())
                }
                _ => None,
            };
            if let Some(only_child) = collapse {
                root = only_child
                    .unwrap_or_else(|| ReferenceCounter::new(Node::empty_branch(edit.clone())));
                shift -= BITS_PER_LEVEL;
            }
        }
        Some((
            PersistentVector {
                length: self.length - 1,
                shift,
                root,
                tail: new_tail,
            },
            element,
        ))
    }

    /// Updates the element at the given index.
    ///
    /// Returns `None` if the index is out of bounds, otherwise returns a new
    /// vector with the updated element.
    ///
    /// # Complexity
    ///
    /// O(log32 N)
    ///
    /// # Examples
    ///
    /// ```rust
    /// use arbors::PersistentVector;
    ///
    /// let vector: PersistentVector<i32> = (1..=5).collect();
    /// let updated = vector.update(2, 100).unwrap();
    ///
    /// assert_eq!(updated.get(2), Some(&100));
    /// assert_eq!(vector.get(2), Some(&3)); // Original unchanged
    /// ```
    #[must_use]
    pub fn update(&self, index: usize, element: T) -> Option<Self> {
        if index >= self.length {
            return None;
        }

        let tail_offset = self.tail_offset();
        if index >= tail_offset {
            let mut new_tail = self.tail.to_vec();
            new_tail[index - tail_offset] = element;
            return Some(PersistentVector {
                length: self.length,
                shift: self.shift,
                root: self.root.clone(),
                tail: ReferenceCounter::from(new_tail),
            });
        }

        let edit = self.root_edit();
        let mut root = self.root.clone();
        Node::assoc(&mut root, self.shift, index, element, &edit);
        Some(PersistentVector {
            length: self.length,
            shift: self.shift,
            root,
            tail: self.tail.clone(),
        })
    }

    /// Appends another vector to this vector.
    ///
    /// Returns a new vector containing all elements from this vector
    /// followed by all elements from the other vector.
    ///
    /// # Complexity
    ///
    /// O(M log32 N) where M is the length of other
    #[must_use]
    pub fn append(&self, other: &Self) -> Self {
        if self.is_empty() {
            return other.clone();
        }
        if other.is_empty() {
            return self.clone();
        }
        let mut transient = self.transient();
        for element in other.iter() {
            transient.push_back(element.clone());
        }
        transient.persistent()
    }

    /// Returns a lightweight view of the range `[start, end)`.
    ///
    /// The slice borrows no lifetime: it holds a handle on this vector and
    /// translates indices. Mutating operations on the slice return new
    /// slices backed by new vectors.
    ///
    /// # Panics
    ///
    /// Panics if `start > end` or `end > len`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use arbors::PersistentVector;
    ///
    /// let vector: PersistentVector<i32> = (0..10).collect();
    /// let sliced = vector.slice(2, 5);
    ///
    /// assert_eq!(sliced.len(), 3);
    /// assert_eq!(sliced.get(0), Some(&2));
    /// assert_eq!(sliced.get(2), Some(&4));
    /// ```
    #[must_use]
    pub fn slice(&self, start: usize, end: usize) -> VectorSlice<T> {
        assert!(start <= end && end <= self.length, "{OUT_OF_BOUNDS}");
        VectorSlice {
            vector: self.clone(),
            start,
            end,
        }
    }

    /// Returns a transient version of this vector for efficient batch
    /// mutation.
    ///
    /// The transient owns a fresh live edit token; the persistent vector is
    /// never affected by mutations of the transient.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use arbors::PersistentVector;
    ///
    /// let vector: PersistentVector<i32> = (0..3).collect();
    /// let mut transient = vector.transient();
    /// transient.push_back(3);
    /// let extended = transient.persistent();
    ///
    /// assert_eq!(vector.len(), 3);
    /// assert_eq!(extended.len(), 4);
    /// ```
    #[must_use]
    pub fn transient(&self) -> TransientVector<T> {
        let edit = EditToken::live();
        TransientVector {
            length: self.length,
            shift: self.shift,
            root: ReferenceCounter::new(self.root.cloned_with_edit(edit.clone())),
            tail: self.tail.to_vec(),
            edit,
        }
    }
}

// =============================================================================
// TransientVector Definition
// =============================================================================

/// A transient, single-owner version of [`PersistentVector`].
///
/// Changes made to a transient vector never affect the persistent vector it
/// was created from. Mutations happen in place on nodes created during this
/// transient session and copy-on-write everywhere else. Calling
/// [`TransientVector::persistent`] freezes the transient; any operation
/// after that panics.
///
/// A transient is useful when making multiple modifications where the
/// intermediate results will not be observed.
///
/// # Examples
///
/// ```rust
/// use arbors::TransientVector;
///
/// let mut transient = TransientVector::new();
/// for index in 0..100 {
///     transient.push_back(index);
/// }
/// let vector = transient.persistent();
/// assert_eq!(vector.len(), 100);
/// ```
pub struct TransientVector<T> {
    length: usize,
    shift: usize,
    root: NodeRef<T>,
    tail: Vec<T>,
    edit: EditToken,
}

impl<T: Clone> TransientVector<T> {
    /// Creates a new empty transient vector.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        PersistentVector::new().transient()
    }

    /// Returns the number of elements in the vector.
    ///
    /// # Panics
    ///
    /// Panics if called after [`Self::persistent`].
    #[must_use]
    pub fn len(&self) -> usize {
        self.ensure_editable();
        self.length
    }

    /// Returns `true` if the vector contains no elements.
    ///
    /// # Panics
    ///
    /// Panics if called after [`Self::persistent`].
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a reference to the element at the given index, or `None` if
    /// out of bounds.
    ///
    /// # Panics
    ///
    /// Panics if called after [`Self::persistent`].
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&T> {
        self.ensure_editable();
        if index >= self.length {
            return None;
        }
        self.leaf_for(index)?.get(index & MASK)
    }

    /// Appends an element in place.
    ///
    /// # Panics
    ///
    /// Panics if called after [`Self::persistent`].
    pub fn push_back(&mut self, element: T) -> &mut Self {
        self.ensure_editable();
        if self.tail.len() < BRANCHING_FACTOR {
            self.tail.push(element);
        } else if (self.length >> BITS_PER_LEVEL) > (1 << self.shift) {
            // The trie is full, grow the root by one level
            let tail_node = self.take_tail_node();
            let mut children: [Option<NodeRef<T>>; BRANCHING_FACTOR] =
                std::array::from_fn(|_| None);
            children[0] = Some(self.root.clone());
            children[1] = Some(ReferenceCounter::new(Node::new_path(
                self.shift, tail_node, &self.edit,
            )));
            self.root = ReferenceCounter::new(Node::Branch {
                children,
                edit: self.edit.clone(),
            });
            self.shift += BITS_PER_LEVEL;
            self.tail.push(element);
        } else {
            let tail_node = self.take_tail_node();
            Node::push_tail(&mut self.root, self.length, self.shift, tail_node, &self.edit);
            self.tail.push(element);
        }
        self.length += 1;
        self
    }

    /// Replaces the element at `index` in place.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds, or if called after
    /// [`Self::persistent`].
    pub fn update(&mut self, index: usize, element: T) -> &mut Self {
        self.ensure_editable();
        assert!(index < self.length, "{OUT_OF_BOUNDS}");
        let tail_offset = self.tail_offset();
        if index >= tail_offset {
            self.tail[index - tail_offset] = element;
        } else {
            Node::assoc(&mut self.root, self.shift, index, element, &self.edit);
        }
        self
    }

    /// Removes and returns the last element, or `None` if empty.
    ///
    /// # Panics
    ///
    /// Panics if called after [`Self::persistent`].
    pub fn pop_back(&mut self) -> Option<T> {
        self.ensure_editable();
        if self.length == 0 {
            return None;
        }
        if self.tail.len() > 1 || self.length == 1 {
            self.length -= 1;
            return self.tail.pop();
        }

        // The tail empties, re-materialize the previous leaf as the tail
        let new_tail = self.leaf_for(self.length - 2)?.to_vec();
        let element = self.tail.pop();
        if !Node::pop_tail(&mut self.root, self.length, self.shift, &self.edit) {
            self.root = ReferenceCounter::new(Node::empty_branch(self.edit.clone()));
        }
        if self.shift > BITS_PER_LEVEL {
            let collapse = match self.root.as_ref() {
                Node::Branch { children, .. } if children[1].is_none() => {
                    Some(children[0].clone())
                }
                _ => None,
            };
            if let Some(only_child) = collapse {
                self.root = only_child.unwrap_or_else(|| {
                    ReferenceCounter::new(Node::empty_branch(self.edit.clone()))
                });
                self.shift -= BITS_PER_LEVEL;
            }
        }
        self.tail = new_tail;
        self.length -= 1;
        element
    }

    /// Converts this transient into a persistent vector in O(1).
    ///
    /// The edit token is frozen, so every node created during this
    /// transient session becomes immutable.
    ///
    /// # Panics
    ///
    /// Panics if called twice: the first call seals the transient and any
    /// later operation on it fails.
    #[must_use]
    pub fn persistent(&mut self) -> PersistentVector<T> {
        self.ensure_editable();
        self.edit.freeze();
        PersistentVector {
            length: self.length,
            shift: self.shift,
            root: self.root.clone(),
            tail: ReferenceCounter::from(self.tail.as_slice()),
        }
    }

    /// Detaches the tail as a leaf node, leaving an empty tail in place.
    fn take_tail_node(&mut self) -> Node<T> {
        Node::Leaf {
            elements: mem::replace(&mut self.tail, Vec::with_capacity(BRANCHING_FACTOR)),
            edit: self.edit.clone(),
        }
    }

    #[inline]
    const fn tail_offset(&self) -> usize {
        if self.length < BRANCHING_FACTOR {
            0
        } else {
            ((self.length - 1) >> BITS_PER_LEVEL) << BITS_PER_LEVEL
        }
    }

    fn leaf_for(&self, index: usize) -> Option<&[T]> {
        if index >= self.tail_offset() {
            return Some(&self.tail);
        }
        let mut node = self.root.as_ref();
        let mut level = self.shift;
        while level > 0 {
            match node {
                Node::Branch { children, .. } => {
                    node = children[(index >> level) & MASK].as_deref()?;
                    level -= BITS_PER_LEVEL;
                }
                Node::Leaf { .. } => break,
            }
        }
        match node {
            Node::Leaf { elements, .. } => Some(elements),
            Node::Branch { .. } => None,
        }
    }

    fn ensure_editable(&self) {
        assert!(self.edit.is_live(), "{USED_AFTER_PERSISTENT}");
    }
}

impl<T: Clone> Default for TransientVector<T> {
    #[inline]
    fn default() -> Self {
        TransientVector::new()
    }
}

impl<T: Clone> Extend<T> for TransientVector<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        for element in iter {
            self.push_back(element);
        }
    }
}

// =============================================================================
// VectorSlice Definition
// =============================================================================

/// A view of a contiguous range of a [`PersistentVector`].
///
/// A slice stores the backing vector together with a start and end index
/// and translates accesses. Mutating operations return new slices backed by
/// new vectors; the original vector and slice stay unchanged.
///
/// # Examples
///
/// ```rust
/// use arbors::PersistentVector;
///
/// let vector: PersistentVector<i32> = (0..10).collect();
/// let slice = vector.slice(2, 6);
///
/// assert_eq!(slice.len(), 4);
/// assert_eq!(slice.get(0), Some(&2));
///
/// let narrower = slice.slice(1, 3);
/// assert_eq!(narrower.get(0), Some(&3));
/// ```
#[derive(Clone)]
pub struct VectorSlice<T> {
    vector: PersistentVector<T>,
    start: usize,
    end: usize,
}

impl<T> VectorSlice<T> {
    /// Returns the number of elements visible through the slice.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.end - self.start
    }

    /// Returns `true` if the slice is empty.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Returns a reference to the element at the given slice-relative
    /// index, or `None` if out of bounds.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&T> {
        if index >= self.len() {
            return None;
        }
        self.vector.get(self.start + index)
    }

    /// Returns an iterator over references to the visible elements.
    pub fn iter(&self) -> VectorSliceIterator<'_, T> {
        VectorSliceIterator {
            slice: self,
            current_index: 0,
        }
    }
}

impl<T: Clone> VectorSlice<T> {
    /// Extends the slice by one element.
    ///
    /// When the slice ends at the end of the backing vector, the backing
    /// vector grows; otherwise the element just past the view is
    /// overwritten. Either way the result is a new slice one element
    /// longer, and existing handles observe nothing.
    #[must_use]
    pub fn push_back(&self, element: T) -> Self {
        let vector = if self.end == self.vector.len() {
            self.vector.push_back(element)
        } else {
            self.vector
                .update(self.end, element)
                .expect("slice end is within the backing vector")
        };
        VectorSlice {
            vector,
            start: self.start,
            end: self.end + 1,
        }
    }

    /// Replaces the element at the given slice-relative index.
    ///
    /// Returns `None` if the index is out of bounds.
    #[must_use]
    pub fn update(&self, index: usize, element: T) -> Option<Self> {
        if index >= self.len() {
            return None;
        }
        Some(VectorSlice {
            vector: self.vector.update(self.start + index, element)?,
            start: self.start,
            end: self.end,
        })
    }

    /// Further limits the view of this slice.
    ///
    /// Indices are relative to this slice.
    ///
    /// # Panics
    ///
    /// Panics if `start > end` or `end > len`.
    #[must_use]
    pub fn slice(&self, start: usize, end: usize) -> Self {
        assert!(start <= end && end <= self.len(), "{OUT_OF_BOUNDS}");
        VectorSlice {
            vector: self.vector.clone(),
            start: self.start + start,
            end: self.start + end,
        }
    }
}

impl<T: PartialEq> PartialEq for VectorSlice<T> {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().zip(other.iter()).all(|(a, b)| a == b)
    }
}

impl<T: Eq> Eq for VectorSlice<T> {}

impl<T: fmt::Debug> fmt::Debug for VectorSlice<T> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.debug_list().entries(self.iter()).finish()
    }
}

// =============================================================================
// Iterator Implementations
// =============================================================================

/// An iterator over references to elements of a [`PersistentVector`].
pub struct PersistentVectorIterator<'a, T> {
    vector: &'a PersistentVector<T>,
    current_index: usize,
}

impl<'a, T> Iterator for PersistentVectorIterator<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_index >= self.vector.length {
            return None;
        }
        let item = self.vector.get(self.current_index);
        self.current_index += 1;
        item
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.vector.length.saturating_sub(self.current_index);
        (remaining, Some(remaining))
    }
}

impl<T> ExactSizeIterator for PersistentVectorIterator<'_, T> {
    fn len(&self) -> usize {
        self.vector.length.saturating_sub(self.current_index)
    }
}

/// An owning iterator over elements of a [`PersistentVector`].
pub struct PersistentVectorIntoIterator<T> {
    vector: PersistentVector<T>,
    current_index: usize,
}

impl<T: Clone> Iterator for PersistentVectorIntoIterator<T> {
    type Item = T;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_index >= self.vector.length {
            return None;
        }
        let item = self.vector.get(self.current_index).cloned();
        self.current_index += 1;
        item
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.vector.length.saturating_sub(self.current_index);
        (remaining, Some(remaining))
    }
}

impl<T: Clone> ExactSizeIterator for PersistentVectorIntoIterator<T> {
    fn len(&self) -> usize {
        self.vector.length.saturating_sub(self.current_index)
    }
}

/// An iterator over references to elements of a [`VectorSlice`].
pub struct VectorSliceIterator<'a, T> {
    slice: &'a VectorSlice<T>,
    current_index: usize,
}

impl<'a, T> Iterator for VectorSliceIterator<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.slice.get(self.current_index)?;
        self.current_index += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.slice.len().saturating_sub(self.current_index);
        (remaining, Some(remaining))
    }
}

impl<T> ExactSizeIterator for VectorSliceIterator<'_, T> {
    fn len(&self) -> usize {
        self.slice.len().saturating_sub(self.current_index)
    }
}

// =============================================================================
// Standard Trait Implementations
// =============================================================================

impl<T> Default for PersistentVector<T> {
    #[inline]
    fn default() -> Self {
        PersistentVector::new()
    }
}

impl<T: Clone> FromIterator<T> for PersistentVector<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut transient = TransientVector::new();
        for element in iter {
            transient.push_back(element);
        }
        transient.persistent()
    }
}

impl<T: Clone> Extend<T> for PersistentVector<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        let mut transient = self.transient();
        for element in iter {
            transient.push_back(element);
        }
        *self = transient.persistent();
    }
}

impl<T: Clone> IntoIterator for PersistentVector<T> {
    type Item = T;
    type IntoIter = PersistentVectorIntoIterator<T>;

    #[inline]
    fn into_iter(self) -> Self::IntoIter {
        PersistentVectorIntoIterator {
            vector: self,
            current_index: 0,
        }
    }
}

impl<'a, T> IntoIterator for &'a PersistentVector<T> {
    type Item = &'a T;
    type IntoIter = PersistentVectorIterator<'a, T>;

    #[inline]
    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<T> Index<usize> for PersistentVector<T> {
    type Output = T;

    /// Returns a reference to the element at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds; use [`PersistentVector::get`]
    /// for the total variant.
    fn index(&self, index: usize) -> &T {
        self.get(index).expect(OUT_OF_BOUNDS)
    }
}

impl<T: PartialEq> PartialEq for PersistentVector<T> {
    fn eq(&self, other: &Self) -> bool {
        if self.length != other.length {
            return false;
        }
        self.iter().zip(other.iter()).all(|(a, b)| a == b)
    }
}

impl<T: Eq> Eq for PersistentVector<T> {}

impl<T: fmt::Debug> fmt::Debug for PersistentVector<T> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.debug_list().entries(self.iter()).finish()
    }
}

// =============================================================================
// Serde Support
// =============================================================================

#[cfg(feature = "serde")]
impl<T> serde::Serialize for PersistentVector<T>
where
    T: serde::Serialize,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeSeq;
        let mut sequence = serializer.serialize_seq(Some(self.len()))?;
        for element in self {
            sequence.serialize_element(element)?;
        }
        sequence.end()
    }
}

#[cfg(feature = "serde")]
struct PersistentVectorVisitor<T> {
    marker: std::marker::PhantomData<T>,
}

#[cfg(feature = "serde")]
impl<'de, T> serde::de::Visitor<'de> for PersistentVectorVisitor<T>
where
    T: serde::Deserialize<'de> + Clone,
{
    type Value = PersistentVector<T>;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("a sequence")
    }

    fn visit_seq<A>(self, mut access: A) -> Result<Self::Value, A::Error>
    where
        A: serde::de::SeqAccess<'de>,
    {
        let mut transient = TransientVector::new();
        while let Some(element) = access.next_element()? {
            transient.push_back(element);
        }
        Ok(transient.persistent())
    }
}

#[cfg(feature = "serde")]
impl<'de, T> serde::Deserialize<'de> for PersistentVector<T>
where
    T: serde::Deserialize<'de> + Clone,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_seq(PersistentVectorVisitor {
            marker: std::marker::PhantomData,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
