//! Persistent B+ tree, the engine behind the ordered map and set.
//!
//! Leaves hold sorted runs of items; internal nodes hold, for each child,
//! the maximum item of that child's subtree next to the child pointer, so
//! a lookup that matches at an internal node can answer without descending
//! further. Fan-out is at most [`MAX_LEN`]; a non-root node never holds
//! fewer than [`MIN_LEN`] items.
//!
//! Every recursive operation reports back through [`NodeReturn`]: nothing
//! changed, a change that needs no parent bookkeeping, a replacement, one
//! node, a split into two, or a three-way rebalance of a node and its
//! siblings. The entry layer grows the root on a split and collapses a
//! single-child internal root after a removal.
//!
//! Editable leaves are allocated with up to [`EXPAND_LEN`] slack slots so
//! a transient can absorb several in-place inserts before the node has to
//! be rebuilt.

use std::cmp::Ordering;

use crate::transience::EditToken;
use crate::ReferenceCounter;

// =============================================================================
// Constants
// =============================================================================

/// Maximum number of items in a node.
pub(crate) const MAX_LEN: usize = 64;

/// Minimum number of items in a non-root node.
pub(crate) const MIN_LEN: usize = MAX_LEN >> 1;

/// Extra slots allocated for editable leaves.
const EXPAND_LEN: usize = 8;

/// Maximum iterator depth: the height is bounded by log_32((n+1)/2), so
/// 64 usable index bits never produce more than ceil(64 / 5) = 13 levels.
const MAX_ITER_DEPTH: usize = (64 + 1) / 5;

// =============================================================================
// Item Contract
// =============================================================================

/// The element contract the tree is built over.
///
/// `compare` supplies the total key order used for placement; `same` is
/// full equality, so adding an item that is `same` as a stored one is a
/// no-op while an item that merely compares equal replaces the stored one.
pub(crate) trait TreeItem: Clone {
    fn compare(&self, other: &Self) -> Ordering;
    fn same(&self, other: &Self) -> bool;
}

// =============================================================================
// Node Definition
// =============================================================================

type NodeRef<T> = ReferenceCounter<Node<T>>;

#[derive(Clone)]
pub(crate) enum Node<T> {
    Leaf(LeafNode<T>),
    Internal(InternalNode<T>),
}

#[derive(Clone)]
pub(crate) struct LeafNode<T> {
    items: Vec<T>,
    edit: EditToken,
}

#[derive(Clone)]
pub(crate) struct InternalNode<T> {
    /// `items[i]` is the maximum item of `children[i]`
    items: Vec<T>,
    children: Vec<NodeRef<T>>,
    edit: EditToken,
}

/// Outcome of a recursive tree operation, reported to the caller.
enum NodeReturn<T> {
    /// Nothing changed
    Unchanged,
    /// Changed in a way that needs no parent bookkeeping
    Early,
    /// An existing item was replaced; ancestors refresh their bounds
    Replaced,
    /// One replacement subtree; the parent refreshes key and pointer
    One,
    /// The node split into two
    Two(NodeRef<T>, NodeRef<T>),
    /// A three-way rebalance across the node and its siblings
    Three(Option<NodeRef<T>>, NodeRef<T>, Option<NodeRef<T>>),
}

/// Outcome of an add, as seen by the entry layer.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum AddOutcome {
    Unchanged,
    Replaced,
    Added,
}

impl<T> LeafNode<T> {
    /// A leaf sized for `len` items; editable leaves get expansion slack.
    fn with_len(len: usize, edit: &EditToken) -> Self {
        let capacity = if edit.is_live() {
            (len + EXPAND_LEN).min(MAX_LEN)
        } else {
            len
        };
        LeafNode {
            items: Vec::with_capacity(capacity),
            edit: edit.clone(),
        }
    }
}

impl<T> Node<T> {
    fn empty_leaf(edit: EditToken) -> Self {
        Node::Leaf(LeafNode {
            items: Vec::new(),
            edit,
        })
    }

    const fn edit(&self) -> &EditToken {
        match self {
            Node::Leaf(leaf) => &leaf.edit,
            Node::Internal(internal) => &internal.edit,
        }
    }

    fn len(&self) -> usize {
        match self {
            Node::Leaf(leaf) => leaf.items.len(),
            Node::Internal(internal) => internal.items.len(),
        }
    }

    /// The maximum item of this subtree. Never called on an empty node.
    fn max_item(&self) -> &T {
        match self {
            Node::Leaf(leaf) => leaf.items.last(),
            Node::Internal(internal) => internal.items.last(),
        }
        .expect("non-root nodes are never empty")
    }

    const fn as_leaf(&self) -> Option<&LeafNode<T>> {
        match self {
            Node::Leaf(leaf) => Some(leaf),
            Node::Internal(_) => None,
        }
    }

    const fn as_internal(&self) -> Option<&InternalNode<T>> {
        match self {
            Node::Internal(internal) => Some(internal),
            Node::Leaf(_) => None,
        }
    }

    /// Finds the stored item for which `probe` answers `Equal`.
    fn find_by<'a, F>(&'a self, probe: &F) -> Option<&'a T>
    where
        F: Fn(&T) -> Ordering,
    {
        match self {
            Node::Leaf(leaf) => {
                let index = leaf.items.binary_search_by(|stored| probe(stored)).ok()?;
                Some(&leaf.items[index])
            }
            Node::Internal(internal) => {
                match internal.items.binary_search_by(|stored| probe(stored)) {
                    // The stored bound is the max of its subtree, so a hit
                    // here already is the answer.
                    Ok(index) => Some(&internal.items[index]),
                    Err(index) => {
                        if index == internal.items.len() {
                            None
                        } else {
                            internal.children[index].find_by(probe)
                        }
                    }
                }
            }
        }
    }

    /// The smallest item of this subtree.
    fn min_item(&self) -> Option<&T> {
        match self {
            Node::Leaf(leaf) => leaf.items.first(),
            Node::Internal(internal) => internal.children.first()?.min_item(),
        }
    }
}

impl<T: TreeItem> Node<T> {
    /// Shallow copy of this node stamped with a new token.
    fn cloned_with_edit(&self, edit: EditToken) -> Self {
        match self {
            Node::Leaf(leaf) => Node::Leaf(LeafNode {
                items: leaf.items.clone(),
                edit,
            }),
            Node::Internal(internal) => Node::Internal(InternalNode {
                items: internal.items.clone(),
                children: internal.children.clone(),
                edit,
            }),
        }
    }

    /// Makes the node behind `this` writable under `edit`; copies on write
    /// when the node carries any other token or `edit` is frozen.
    fn make_editable<'a>(this: &'a mut NodeRef<T>, edit: &EditToken) -> &'a mut Self {
        if !this.edit().writable_under(edit) {
            *this = ReferenceCounter::new(this.cloned_with_edit(edit.clone()));
        }
        ReferenceCounter::make_mut(this)
    }

    // -------------------------------------------------------------------------
    // Add
    // -------------------------------------------------------------------------

    fn add(this: &mut NodeRef<T>, item: T, edit: &EditToken) -> NodeReturn<T> {
        match this.as_ref() {
            Node::Leaf(_) => Self::add_to_leaf(this, item, edit),
            Node::Internal(_) => Self::add_to_internal(this, item, edit),
        }
    }

    fn add_to_leaf(this: &mut NodeRef<T>, item: T, edit: &EditToken) -> NodeReturn<T> {
        let Some(leaf) = this.as_leaf() else {
            return NodeReturn::Unchanged;
        };
        match leaf.items.binary_search_by(|stored| stored.compare(&item)) {
            Ok(position) => {
                if leaf.items[position].same(&item) {
                    return NodeReturn::Unchanged;
                }
                if let Node::Leaf(leaf) = Self::make_editable(this, edit) {
                    leaf.items[position] = item;
                }
                NodeReturn::Replaced
            }
            Err(insertion) => {
                let length = leaf.items.len();
                if this.edit().writable_under(edit) && length < leaf.items.capacity() {
                    if let Node::Leaf(leaf) = Self::make_editable(this, edit) {
                        leaf.items.insert(insertion, item);
                    }
                    if insertion == length {
                        return NodeReturn::One;
                    }
                    return NodeReturn::Early;
                }
                if length < MAX_LEN {
                    let mut copy = LeafNode::with_len(length + 1, edit);
                    copy.items.extend_from_slice(&leaf.items[..insertion]);
                    copy.items.push(item);
                    copy.items.extend_from_slice(&leaf.items[insertion..]);
                    *this = ReferenceCounter::new(Node::Leaf(copy));
                    return NodeReturn::One;
                }
                Self::split_leaf(this, insertion, item, edit)
            }
        }
    }

    /// Splits a full leaf so the insertion lands in whichever half
    /// contains its index.
    fn split_leaf(this: &mut NodeRef<T>, insertion: usize, item: T, edit: &EditToken) -> NodeReturn<T> {
        let Some(leaf) = this.as_leaf() else {
            return NodeReturn::Unchanged;
        };
        let length = leaf.items.len();
        let first_half = (length + 1) >> 1;
        let mut first = LeafNode::with_len(first_half, edit);
        let mut second = LeafNode::with_len(length + 1 - first_half, edit);

        if insertion < first_half {
            first.items.extend_from_slice(&leaf.items[..insertion]);
            first.items.push(item);
            first.items.extend_from_slice(&leaf.items[insertion..first_half - 1]);
            second.items.extend_from_slice(&leaf.items[first_half - 1..]);
        } else {
            first.items.extend_from_slice(&leaf.items[..first_half]);
            second.items.extend_from_slice(&leaf.items[first_half..insertion]);
            second.items.push(item);
            second.items.extend_from_slice(&leaf.items[insertion..]);
        }
        NodeReturn::Two(
            ReferenceCounter::new(Node::Leaf(first)),
            ReferenceCounter::new(Node::Leaf(second)),
        )
    }

    fn add_to_internal(this: &mut NodeRef<T>, item: T, edit: &EditToken) -> NodeReturn<T> {
        let Some(internal) = this.as_internal() else {
            return NodeReturn::Unchanged;
        };
        let insertion = match internal.items.binary_search_by(|stored| stored.compare(&item)) {
            Ok(position) => {
                if internal.items[position].same(&item) {
                    return NodeReturn::Unchanged;
                }
                position
            }
            // Beyond the current maximum the rightmost child absorbs it.
            Err(insertion) => insertion.min(internal.items.len() - 1),
        };

        let node = match Self::make_editable(this, edit) {
            Node::Internal(internal) => internal,
            Node::Leaf(_) => return NodeReturn::Unchanged,
        };
        let ret = Self::add(&mut node.children[insertion], item, edit);
        match ret {
            NodeReturn::Unchanged => NodeReturn::Unchanged,
            NodeReturn::Early => NodeReturn::Early,
            NodeReturn::One => {
                node.items[insertion] = node.children[insertion].max_item().clone();
                if insertion == node.items.len() - 1 {
                    NodeReturn::One
                } else {
                    NodeReturn::Early
                }
            }
            NodeReturn::Replaced => {
                node.items[insertion] = node.children[insertion].max_item().clone();
                NodeReturn::Replaced
            }
            NodeReturn::Two(first, second) => {
                if node.items.len() < MAX_LEN {
                    node.items[insertion] = first.max_item().clone();
                    node.items.insert(insertion + 1, second.max_item().clone());
                    node.children[insertion] = first;
                    node.children.insert(insertion + 1, second);
                    if insertion + 1 == node.items.len() - 1 {
                        NodeReturn::One
                    } else {
                        NodeReturn::Early
                    }
                } else {
                    Self::split_internal(node, insertion, first, second, edit)
                }
            }
            NodeReturn::Three(..) => NodeReturn::Unchanged,
        }
    }

    /// Splits a full internal node while replacing child `insertion` with
    /// the pair produced by a lower split.
    fn split_internal(
        node: &InternalNode<T>,
        insertion: usize,
        first_child: NodeRef<T>,
        second_child: NodeRef<T>,
        edit: &EditToken,
    ) -> NodeReturn<T> {
        let length = node.items.len();
        let mut first_half = (length + 1) >> 1;
        // Keep the replaced pair on one side of the cut.
        if insertion + 1 == first_half {
            first_half += 1;
        }
        let second_half = length + 1 - first_half;

        let mut first = InternalBuilder::with_capacity(first_half);
        let mut second = InternalBuilder::with_capacity(second_half);

        if insertion < first_half {
            first.push_range(node, 0, insertion);
            first.push_node(first_child);
            first.push_node(second_child);
            first.push_range(node, insertion + 1, first_half - 1);
            second.push_range(node, first_half - 1, length);
        } else {
            first.push_range(node, 0, first_half);
            second.push_range(node, first_half, insertion);
            second.push_node(first_child);
            second.push_node(second_child);
            second.push_range(node, insertion + 1, length);
        }
        NodeReturn::Two(
            ReferenceCounter::new(Node::Internal(first.build(edit))),
            ReferenceCounter::new(Node::Internal(second.build(edit))),
        )
    }

    // -------------------------------------------------------------------------
    // Remove
    // -------------------------------------------------------------------------

    fn remove<F>(
        this: &mut NodeRef<T>,
        probe: &F,
        left: Option<&NodeRef<T>>,
        right: Option<&NodeRef<T>>,
        edit: &EditToken,
    ) -> NodeReturn<T>
    where
        F: Fn(&T) -> Ordering,
    {
        match this.as_ref() {
            Node::Leaf(_) => Self::remove_from_leaf(this, probe, left, right, edit),
            Node::Internal(_) => Self::remove_from_internal(this, probe, left, right, edit),
        }
    }

    fn remove_from_leaf<F>(
        this: &mut NodeRef<T>,
        probe: &F,
        left: Option<&NodeRef<T>>,
        right: Option<&NodeRef<T>>,
        edit: &EditToken,
    ) -> NodeReturn<T>
    where
        F: Fn(&T) -> Ordering,
    {
        let Some(leaf) = this.as_leaf() else {
            return NodeReturn::Unchanged;
        };
        let Ok(index) = leaf.items.binary_search_by(|stored| probe(stored)) else {
            return NodeReturn::Unchanged;
        };
        let new_length = leaf.items.len() - 1;
        let left_leaf = left.and_then(|node| node.as_leaf());
        let right_leaf = right.and_then(|node| node.as_leaf());

        let needs_merge = new_length < MIN_LEN && (left_leaf.is_some() || right_leaf.is_some());
        if !needs_merge {
            if this.edit().writable_under(edit) {
                if let Node::Leaf(leaf) = Self::make_editable(this, edit) {
                    leaf.items.remove(index);
                }
                if index == new_length {
                    // The max changed, ancestors must refresh their bounds
                    return NodeReturn::Three(left.cloned(), this.clone(), right.cloned());
                }
                return NodeReturn::Early;
            }
            let mut center = LeafNode::with_len(new_length, edit);
            center.items.extend_from_slice(&leaf.items[..index]);
            center.items.extend_from_slice(&leaf.items[index + 1..]);
            return NodeReturn::Three(
                left.cloned(),
                ReferenceCounter::new(Node::Leaf(center)),
                right.cloned(),
            );
        }

        let can_join_left =
            left_leaf.is_some_and(|node| node.items.len() + new_length < MAX_LEN);
        let can_join_right =
            right_leaf.is_some_and(|node| node.items.len() + new_length < MAX_LEN);

        if can_join_left {
            let Some(left_leaf) = left_leaf else {
                return NodeReturn::Unchanged;
            };
            let mut join = LeafNode::with_len(left_leaf.items.len() + new_length, edit);
            join.items.extend_from_slice(&left_leaf.items);
            join.items.extend_from_slice(&leaf.items[..index]);
            join.items.extend_from_slice(&leaf.items[index + 1..]);
            return NodeReturn::Three(
                None,
                ReferenceCounter::new(Node::Leaf(join)),
                right.cloned(),
            );
        }
        if can_join_right {
            let Some(right_leaf) = right_leaf else {
                return NodeReturn::Unchanged;
            };
            let mut join = LeafNode::with_len(right_leaf.items.len() + new_length, edit);
            join.items.extend_from_slice(&leaf.items[..index]);
            join.items.extend_from_slice(&leaf.items[index + 1..]);
            join.items.extend_from_slice(&right_leaf.items);
            return NodeReturn::Three(
                left.cloned(),
                ReferenceCounter::new(Node::Leaf(join)),
                None,
            );
        }

        let borrow_left = left_leaf.is_some_and(|node| {
            left.is_some_and(|left| left.edit().writable_under(edit))
                || right_leaf.is_none()
                || node.items.len() >= right_leaf.map_or(0, |right| right.items.len())
        });
        if borrow_left {
            let Some(left_leaf) = left_leaf else {
                return NodeReturn::Unchanged;
            };
            let total = left_leaf.items.len() + new_length;
            let new_left_length = total >> 1;

            let mut new_left = LeafNode::with_len(new_left_length, edit);
            new_left
                .items
                .extend_from_slice(&left_leaf.items[..new_left_length]);

            let mut new_center = LeafNode::with_len(total - new_left_length, edit);
            new_center
                .items
                .extend_from_slice(&left_leaf.items[new_left_length..]);
            new_center.items.extend_from_slice(&leaf.items[..index]);
            new_center.items.extend_from_slice(&leaf.items[index + 1..]);

            return NodeReturn::Three(
                Some(ReferenceCounter::new(Node::Leaf(new_left))),
                ReferenceCounter::new(Node::Leaf(new_center)),
                right.cloned(),
            );
        }

        let Some(right_leaf) = right_leaf else {
            return NodeReturn::Unchanged;
        };
        let total = new_length + right_leaf.items.len();
        let new_center_length = total >> 1;
        let new_right_length = total - new_center_length;
        let right_head = right_leaf.items.len() - new_right_length;

        let mut new_center = LeafNode::with_len(new_center_length, edit);
        new_center.items.extend_from_slice(&leaf.items[..index]);
        new_center.items.extend_from_slice(&leaf.items[index + 1..]);
        new_center
            .items
            .extend_from_slice(&right_leaf.items[..right_head]);

        let mut new_right = LeafNode::with_len(new_right_length, edit);
        new_right
            .items
            .extend_from_slice(&right_leaf.items[right_head..]);

        NodeReturn::Three(
            left.cloned(),
            ReferenceCounter::new(Node::Leaf(new_center)),
            Some(ReferenceCounter::new(Node::Leaf(new_right))),
        )
    }

    fn remove_from_internal<F>(
        this: &mut NodeRef<T>,
        probe: &F,
        left: Option<&NodeRef<T>>,
        right: Option<&NodeRef<T>>,
        edit: &EditToken,
    ) -> NodeReturn<T>
    where
        F: Fn(&T) -> Ordering,
    {
        let length = this.len();
        let index = {
            let Some(internal) = this.as_internal() else {
                return NodeReturn::Unchanged;
            };
            match internal.items.binary_search_by(|stored| probe(stored)) {
                Ok(position) => position,
                Err(position) => position,
            }
        };
        if index == length {
            return NodeReturn::Unchanged;
        }

        let node = match Self::make_editable(this, edit) {
            Node::Internal(internal) => internal,
            Node::Leaf(_) => return NodeReturn::Unchanged,
        };

        let ret = {
            let (before, rest) = node.children.split_at_mut(index);
            let Some((center, after)) = rest.split_first_mut() else {
                return NodeReturn::Unchanged;
            };
            let left_child: Option<&NodeRef<T>> = before.last();
            let right_child: Option<&NodeRef<T>> = after.first();
            Self::remove(center, probe, left_child, right_child, edit)
        };

        let (removed_left, removed_center, removed_right) = match ret {
            NodeReturn::Unchanged => return NodeReturn::Unchanged,
            NodeReturn::Early => return NodeReturn::Early,
            NodeReturn::Three(trio_left, trio_center, trio_right) => {
                (trio_left, trio_center, trio_right)
            }
            _ => return NodeReturn::Unchanged,
        };

        let had_left = index > 0;
        let had_right = index < length - 1;
        let trio_count =
            usize::from(removed_left.is_some()) + 1 + usize::from(removed_right.is_some());
        let new_length =
            length - 1 - usize::from(had_left) - usize::from(had_right) + trio_count;

        let left_internal = left.and_then(|node| node.as_internal());
        let right_internal = right.and_then(|node| node.as_internal());

        let needs_rebalance =
            new_length < MIN_LEN && (left_internal.is_some() || right_internal.is_some());

        if !needs_rebalance {
            let mut builder = InternalBuilder::with_capacity(new_length);
            if had_left {
                builder.push_range(node, 0, index - 1);
            }
            builder.push_trio(removed_left, removed_center, removed_right);
            builder.push_range(node, index + 2, length);
            let rebuilt = builder.build(edit);
            node.items = rebuilt.items;
            node.children = rebuilt.children;
            if index < length - 2 {
                return NodeReturn::Early;
            }
            return NodeReturn::Three(left.cloned(), this.clone(), right.cloned());
        }

        let can_join_left =
            left_internal.is_some_and(|node| node.items.len() + new_length < MAX_LEN);
        let can_join_right =
            right_internal.is_some_and(|node| node.items.len() + new_length < MAX_LEN);

        if can_join_left {
            let Some(left_node) = left_internal else {
                return NodeReturn::Unchanged;
            };
            let mut builder = InternalBuilder::with_capacity(left_node.items.len() + new_length);
            builder.push_range(left_node, 0, left_node.items.len());
            if had_left {
                builder.push_range(node, 0, index - 1);
            }
            builder.push_trio(removed_left, removed_center, removed_right);
            builder.push_range(node, index + 2, length);
            return NodeReturn::Three(
                None,
                ReferenceCounter::new(Node::Internal(builder.build(edit))),
                right.cloned(),
            );
        }
        if can_join_right {
            let Some(right_node) = right_internal else {
                return NodeReturn::Unchanged;
            };
            let mut builder = InternalBuilder::with_capacity(new_length + right_node.items.len());
            if had_left {
                builder.push_range(node, 0, index - 1);
            }
            builder.push_trio(removed_left, removed_center, removed_right);
            builder.push_range(node, index + 2, length);
            builder.push_range(right_node, 0, right_node.items.len());
            return NodeReturn::Three(
                left.cloned(),
                ReferenceCounter::new(Node::Internal(builder.build(edit))),
                None,
            );
        }

        let borrow_left = left_internal.is_some_and(|node| {
            right_internal.is_none()
                || node.items.len() >= right_internal.map_or(0, |right| right.items.len())
        });
        if borrow_left {
            let Some(left_node) = left_internal else {
                return NodeReturn::Unchanged;
            };
            let total = left_node.items.len() + new_length;
            let new_left_length = total >> 1;

            let mut new_left = InternalBuilder::with_capacity(new_left_length);
            new_left.push_range(left_node, 0, new_left_length);

            let mut new_center = InternalBuilder::with_capacity(total - new_left_length);
            new_center.push_range(left_node, new_left_length, left_node.items.len());
            if had_left {
                new_center.push_range(node, 0, index - 1);
            }
            new_center.push_trio(removed_left, removed_center, removed_right);
            new_center.push_range(node, index + 2, length);

            return NodeReturn::Three(
                Some(ReferenceCounter::new(Node::Internal(new_left.build(edit)))),
                ReferenceCounter::new(Node::Internal(new_center.build(edit))),
                right.cloned(),
            );
        }

        let Some(right_node) = right_internal else {
            return NodeReturn::Unchanged;
        };
        let total = new_length + right_node.items.len();
        let new_center_length = total >> 1;
        let new_right_length = total - new_center_length;
        let right_head = right_node.items.len() - new_right_length;

        let mut new_center = InternalBuilder::with_capacity(new_center_length);
        if had_left {
            new_center.push_range(node, 0, index - 1);
        }
        new_center.push_trio(removed_left, removed_center, removed_right);
        new_center.push_range(node, index + 2, length);
        new_center.push_range(right_node, 0, right_head);

        let mut new_right = InternalBuilder::with_capacity(new_right_length);
        new_right.push_range(right_node, right_head, right_node.items.len());

        NodeReturn::Three(
            left.cloned(),
            ReferenceCounter::new(Node::Internal(new_center.build(edit))),
            Some(ReferenceCounter::new(Node::Internal(new_right.build(edit)))),
        )
    }
}

// =============================================================================
// Internal Node Stitching
// =============================================================================

/// Builds an internal node by stitching together ranges of existing nodes
/// and freshly produced children, keeping the bound items and the child
/// pointers in lockstep.
struct InternalBuilder<T> {
    items: Vec<T>,
    children: Vec<NodeRef<T>>,
}

impl<T: TreeItem> InternalBuilder<T> {
    fn with_capacity(capacity: usize) -> Self {
        InternalBuilder {
            items: Vec::with_capacity(capacity),
            children: Vec::with_capacity(capacity),
        }
    }

    fn push_node(&mut self, node: NodeRef<T>) {
        self.items.push(node.max_item().clone());
        self.children.push(node);
    }

    fn push_range(&mut self, source: &InternalNode<T>, from: usize, to: usize) {
        if to > from {
            self.items.extend_from_slice(&source.items[from..to]);
            self.children.extend_from_slice(&source.children[from..to]);
        }
    }

    fn push_trio(
        &mut self,
        left: Option<NodeRef<T>>,
        center: NodeRef<T>,
        right: Option<NodeRef<T>>,
    ) {
        if let Some(left) = left {
            self.push_node(left);
        }
        self.push_node(center);
        if let Some(right) = right {
            self.push_node(right);
        }
    }

    fn build(self, edit: &EditToken) -> InternalNode<T> {
        InternalNode {
            items: self.items,
            children: self.children,
            edit: edit.clone(),
        }
    }
}

// =============================================================================
// BTree Definition
// =============================================================================

/// The tree handle shared by the ordered map and set overlays.
///
/// A persistent handle carries a frozen token; the overlays derive
/// transients by swapping in a live one and calling the `*_in_place`
/// operations, which then mutate matching nodes instead of copying them.
pub(crate) struct BTree<T> {
    root: NodeRef<T>,
    length: usize,
    edit: EditToken,
}

impl<T> Clone for BTree<T> {
    fn clone(&self) -> Self {
        BTree {
            root: self.root.clone(),
            length: self.length,
            edit: self.edit.clone(),
        }
    }
}

impl<T> BTree<T> {
    pub(crate) fn new() -> Self {
        let edit = EditToken::frozen();
        BTree {
            root: ReferenceCounter::new(Node::empty_leaf(edit.clone())),
            length: 0,
            edit,
        }
    }

    pub(crate) const fn len(&self) -> usize {
        self.length
    }

    pub(crate) fn find_by<F>(&self, probe: F) -> Option<&T>
    where
        F: Fn(&T) -> Ordering,
    {
        self.root.find_by(&probe)
    }

    pub(crate) fn min_item(&self) -> Option<&T> {
        self.root.min_item()
    }

    pub(crate) fn max_item(&self) -> Option<&T> {
        if self.length == 0 {
            return None;
        }
        Some(self.root.max_item())
    }

    /// A handle sharing this tree's structure under a fresh live token.
    pub(crate) fn to_transient(&self) -> Self {
        BTree {
            root: self.root.clone(),
            length: self.length,
            edit: EditToken::live(),
        }
    }

    /// Freezes the token, turning this handle persistent.
    pub(crate) fn into_persistent(&mut self) -> Self {
        self.edit.freeze();
        self.clone()
    }

    pub(crate) fn is_live(&self) -> bool {
        self.edit.is_live()
    }
}

impl<T: TreeItem> BTree<T> {
    /// Adds `item`, replacing a stored item that compares equal but is not
    /// `same`. The no-op case is detected up front so unchanged trees keep
    /// their root.
    pub(crate) fn add_in_place(&mut self, item: T) -> AddOutcome {
        if let Some(stored) = self.root.find_by(&|stored: &T| stored.compare(&item)) {
            if stored.same(&item) {
                return AddOutcome::Unchanged;
            }
        }
        let edit = self.edit.clone();
        let ret = Node::add(&mut self.root, item, &edit);
        match ret {
            NodeReturn::Unchanged => AddOutcome::Unchanged,
            NodeReturn::Replaced => AddOutcome::Replaced,
            NodeReturn::Early | NodeReturn::One | NodeReturn::Three(..) => {
                self.length += 1;
                AddOutcome::Added
            }
            NodeReturn::Two(first, second) => {
                let mut builder = InternalBuilder::with_capacity(2);
                builder.push_node(first);
                builder.push_node(second);
                self.root = ReferenceCounter::new(Node::Internal(builder.build(&edit)));
                self.length += 1;
                AddOutcome::Added
            }
        }
    }

    /// Removes the item `probe` locates. Returns `false` when absent.
    pub(crate) fn remove_in_place<F>(&mut self, probe: F) -> bool
    where
        F: Fn(&T) -> Ordering,
    {
        if self.root.find_by(&probe).is_none() {
            return false;
        }
        let edit = self.edit.clone();
        let ret = Node::remove(&mut self.root, &probe, None, None, &edit);
        match ret {
            NodeReturn::Unchanged => false,
            NodeReturn::Three(_, center, _) => {
                self.root = center;
                self.collapse_root();
                self.length -= 1;
                true
            }
            _ => {
                self.collapse_root();
                self.length -= 1;
                true
            }
        }
    }

    pub(crate) fn add(&self, item: T) -> (Self, AddOutcome) {
        let mut tree = BTree {
            root: self.root.clone(),
            length: self.length,
            edit: self.edit.clone(),
        };
        let outcome = tree.add_in_place(item);
        if outcome == AddOutcome::Unchanged {
            return (self.clone(), outcome);
        }
        (tree, outcome)
    }

    pub(crate) fn remove<F>(&self, probe: F) -> Option<Self>
    where
        F: Fn(&T) -> Ordering,
    {
        let mut tree = BTree {
            root: self.root.clone(),
            length: self.length,
            edit: self.edit.clone(),
        };
        tree.remove_in_place(probe).then_some(tree)
    }

    /// Replaces a single-child internal root by its child.
    fn collapse_root(&mut self) {
        let collapse = match self.root.as_ref() {
            Node::Internal(internal) if internal.items.len() == 1 => {
                Some(internal.children[0].clone())
            }
            _ => None,
        };
        if let Some(only_child) = collapse {
            self.root = only_child;
        }
    }

    pub(crate) fn iter(&self) -> BTreeIterator<'_, T> {
        BTreeIterator::new(&self.root)
    }

    /// An iterator positioned at the first item for which `probe` does not
    /// answer `Less`; a probe below the minimum positions at the first
    /// item.
    pub(crate) fn iter_from<F>(&self, probe: F) -> BTreeIterator<'_, T>
    where
        F: Fn(&T) -> Ordering,
    {
        BTreeIterator::positioned(&self.root, &probe)
    }
}

// =============================================================================
// Iterator Implementation
// =============================================================================

/// An in-order iterator over the tree with a fixed-depth frame stack.
pub(crate) struct BTreeIterator<'a, T> {
    stack: [(Option<&'a Node<T>>, usize); MAX_ITER_DEPTH],
    depth: usize,
    finished: bool,
}

impl<'a, T> BTreeIterator<'a, T> {
    fn new(root: &'a Node<T>) -> Self {
        let mut stack: [(Option<&'a Node<T>>, usize); MAX_ITER_DEPTH] =
            std::array::from_fn(|_| (None, 0));
        stack[0] = (Some(root), 0);
        BTreeIterator {
            stack,
            depth: 0,
            finished: false,
        }
    }

    /// Builds an iterator whose every frame sits at the insertion index
    /// for the probe at that level.
    fn positioned<F>(root: &'a Node<T>, probe: &F) -> Self
    where
        F: Fn(&T) -> Ordering,
    {
        let mut iterator = Self::new(root);
        let mut node = root;
        loop {
            match node {
                Node::Leaf(leaf) => {
                    let position = leaf
                        .items
                        .partition_point(|stored| probe(stored) == Ordering::Less);
                    iterator.stack[iterator.depth].1 = position;
                    return iterator;
                }
                Node::Internal(internal) => {
                    let position = internal
                        .items
                        .partition_point(|stored| probe(stored) == Ordering::Less);
                    if position == internal.items.len() {
                        // Every item is below the probe
                        iterator.stack[iterator.depth].1 = position;
                        return iterator;
                    }
                    iterator.stack[iterator.depth].1 = position + 1;
                    node = internal.children[position].as_ref();
                    iterator.depth += 1;
                    iterator.stack[iterator.depth] = (Some(node), 0);
                }
            }
        }
    }

    fn push(&mut self, node: &'a Node<T>) {
        self.depth += 1;
        self.stack[self.depth] = (Some(node), 0);
    }

    fn pop(&mut self) {
        self.stack[self.depth] = (None, 0);
        if self.depth == 0 {
            self.finished = true;
        } else {
            self.depth -= 1;
        }
    }
}

impl<'a, T> Iterator for BTreeIterator<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.finished {
            let (node, cursor) = self.stack[self.depth];
            let node = node?;
            match node {
                Node::Leaf(leaf) => {
                    if cursor < leaf.items.len() {
                        self.stack[self.depth].1 = cursor + 1;
                        return Some(&leaf.items[cursor]);
                    }
                    self.pop();
                }
                Node::Internal(internal) => {
                    if cursor < internal.children.len() {
                        self.stack[self.depth].1 = cursor + 1;
                        self.push(&internal.children[cursor]);
                    } else {
                        self.pop();
                    }
                }
            }
        }
        None
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    impl TreeItem for i32 {
        fn compare(&self, other: &Self) -> Ordering {
            self.cmp(other)
        }

        fn same(&self, other: &Self) -> bool {
            self == other
        }
    }

    fn probe(key: i32) -> impl Fn(&i32) -> Ordering {
        move |stored| stored.cmp(&key)
    }

    fn tree_of(range: impl Iterator<Item = i32>) -> BTree<i32> {
        let mut tree = BTree::new().to_transient();
        for key in range {
            tree.add_in_place(key);
        }
        tree.into_persistent()
    }

    /// Every non-root node must satisfy the occupancy bounds.
    fn check_invariants(node: &Node<i32>, is_root: bool) {
        match node {
            Node::Leaf(leaf) => {
                if !is_root {
                    assert!(leaf.items.len() >= MIN_LEN, "leaf below minimum occupancy");
                }
                assert!(leaf.items.len() <= MAX_LEN);
                assert!(leaf.items.windows(2).all(|pair| pair[0] < pair[1]));
            }
            Node::Internal(internal) => {
                if !is_root {
                    assert!(internal.items.len() >= MIN_LEN);
                }
                assert!(internal.items.len() <= MAX_LEN);
                assert_eq!(internal.items.len(), internal.children.len());
                assert!(internal.items.windows(2).all(|pair| pair[0] < pair[1]));
                for (bound, child) in internal.items.iter().zip(&internal.children) {
                    assert_eq!(bound, child.max_item(), "stale child bound");
                    check_invariants(child, false);
                }
            }
        }
    }

    #[rstest]
    fn test_empty_tree() {
        let tree: BTree<i32> = BTree::new();
        assert_eq!(tree.len(), 0);
        assert!(tree.find_by(probe(1)).is_none());
        assert_eq!(tree.iter().count(), 0);
    }

    #[rstest]
    fn test_sequential_add_and_iterate() {
        let tree = tree_of(0..100);
        assert_eq!(tree.len(), 100);
        let collected: Vec<i32> = tree.iter().copied().collect();
        let expected: Vec<i32> = (0..100).collect();
        assert_eq!(collected, expected);
        check_invariants(&tree.root, true);
    }

    #[rstest]
    fn test_reverse_add_and_iterate() {
        let tree = tree_of((0..1000).rev());
        let collected: Vec<i32> = tree.iter().copied().collect();
        let expected: Vec<i32> = (0..1000).collect();
        assert_eq!(collected, expected);
        check_invariants(&tree.root, true);
    }

    #[rstest]
    fn test_add_is_persistent() {
        let tree = tree_of(0..200);
        let (bigger, outcome) = tree.add(500);
        assert_eq!(outcome, AddOutcome::Added);
        assert_eq!(tree.len(), 200);
        assert_eq!(bigger.len(), 201);
        assert!(tree.find_by(probe(500)).is_none());
        assert!(bigger.find_by(probe(500)).is_some());
    }

    #[rstest]
    fn test_add_same_is_identity() {
        let tree = tree_of(0..100);
        let (same, outcome) = tree.add(50);
        assert_eq!(outcome, AddOutcome::Unchanged);
        assert!(ReferenceCounter::ptr_eq(&tree.root, &same.root));
    }

    #[rstest]
    fn test_delete_rebalances() {
        let mut tree = tree_of(0..100);
        for key in 0..50 {
            tree = tree.remove(probe(key)).unwrap();
            check_invariants(&tree.root, true);
        }
        assert_eq!(tree.len(), 50);
        for key in 0..50 {
            assert!(tree.find_by(probe(key)).is_none());
        }
        let collected: Vec<i32> = tree.iter_from(probe(50)).copied().collect();
        let expected: Vec<i32> = (50..100).collect();
        assert_eq!(collected, expected);
    }

    #[rstest]
    fn test_delete_everything_collapses_root() {
        let mut tree = tree_of(0..1000);
        for key in 0..1000 {
            tree = tree.remove(probe(key)).unwrap();
        }
        assert_eq!(tree.len(), 0);
        assert!(tree.root.as_leaf().is_some());
    }

    #[rstest]
    fn test_delete_missing_is_none() {
        let tree = tree_of(0..10);
        assert!(tree.remove(probe(42)).is_none());
    }

    #[rstest]
    fn test_transient_delete_interleaved() {
        let mut tree = tree_of(0..10_000).to_transient();
        for key in (0..10_000).step_by(2) {
            assert!(tree.remove_in_place(probe(key)));
        }
        let tree = tree.into_persistent();
        assert_eq!(tree.len(), 5_000);
        check_invariants(&tree.root, true);
        let collected: Vec<i32> = tree.iter().copied().collect();
        let expected: Vec<i32> = (0..10_000).filter(|key| key % 2 == 1).collect();
        assert_eq!(collected, expected);
    }

    #[rstest]
    #[case(-10)]
    #[case(0)]
    fn test_iter_from_below_minimum_starts_at_first(#[case] from: i32) {
        let tree = tree_of(0..100);
        let first = tree.iter_from(probe(from)).next().copied();
        assert_eq!(first, Some(0));
    }

    #[rstest]
    fn test_iter_from_past_maximum_is_empty() {
        let tree = tree_of(0..100);
        assert_eq!(tree.iter_from(probe(100)).count(), 0);
        assert_eq!(tree.iter_from(probe(1000)).count(), 0);
    }

    #[rstest]
    fn test_iter_from_mid() {
        let tree = tree_of(0..100_000);
        let collected: Vec<i32> = tree.iter_from(probe(99_997)).copied().collect();
        assert_eq!(collected, vec![99_997, 99_998, 99_999]);
    }

    #[rstest]
    fn test_random_order_inserts_and_removes() {
        // A deterministic shuffle touching all rebalance paths.
        let mut keys: Vec<i32> = (0..5_000).collect();
        let mut state = 0x9e37_79b9_u64;
        for index in (1..keys.len()).rev() {
            state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            let other = (state >> 33) as usize % (index + 1);
            keys.swap(index, other);
        }
        let mut tree = BTree::new().to_transient();
        for &key in &keys {
            tree.add_in_place(key);
        }
        let tree = tree.into_persistent();
        check_invariants(&tree.root, true);
        assert_eq!(tree.len(), 5_000);

        let mut tree = tree.to_transient();
        for &key in keys.iter().take(2_500) {
            assert!(tree.remove_in_place(probe(key)));
        }
        let tree = tree.into_persistent();
        check_invariants(&tree.root, true);
        assert_eq!(tree.len(), 2_500);
        for &key in keys.iter().take(2_500) {
            assert!(tree.find_by(probe(key)).is_none());
        }
        for &key in keys.iter().skip(2_500) {
            assert!(tree.find_by(probe(key)).is_some());
        }
    }
}
