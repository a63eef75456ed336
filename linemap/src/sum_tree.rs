//! Copy-on-write B-tree with monoidal summaries.
//!
//! Internal nodes cache the composed summary of their children, so any
//! prefix of the tree can be measured in any [`Dimension`] while descending,
//! and whole subtrees can be spliced between trees without touching their
//! items. Cloning is O(1) (shared `Arc`s), which is what makes snapshots for
//! background work cheap.

use std::{cmp::Ordering, sync::Arc};

/// Fan-out is `2 * TREE_BASE`.
pub const TREE_BASE: usize = 8;

/// A monoid over subtree contents.
pub trait Summary: Clone + Default {
    fn add(&mut self, other: &Self);
}

pub trait Item: Clone {
    type Summary: Summary;
    fn summary(&self) -> Self::Summary;
}

/// A monotonically accumulated measurement of tree prefixes.
pub trait Dimension<S: Summary>: Clone + Default {
    fn add_summary(&mut self, summary: &S);
}

/// A position to search for within a [`Dimension`].
pub trait SeekTarget<S: Summary, D: Dimension<S>> {
    fn cmp(&self, position: &D) -> Ordering;
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Bias {
    #[default]
    Left,
    Right,
}

pub struct SumTree<T: Item>(Arc<Node<T>>);

enum Node<T: Item> {
    Leaf {
        items: Vec<T>,
        summaries: Vec<T::Summary>,
        summary: T::Summary,
    },
    Internal {
        children: Vec<SumTree<T>>,
        summary: T::Summary,
    },
}

impl<T: Item> Clone for Node<T> {
    fn clone(&self) -> Self {
        match self {
            Node::Leaf {
                items,
                summaries,
                summary,
            } => Node::Leaf {
                items: items.clone(),
                summaries: summaries.clone(),
                summary: summary.clone(),
            },
            Node::Internal { children, summary } => Node::Internal {
                children: children.clone(),
                summary: summary.clone(),
            },
        }
    }
}

impl<T: Item> Clone for SumTree<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T: Item> Default for SumTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Item> SumTree<T> {
    pub fn new() -> Self {
        Self(Arc::new(Node::Leaf {
            items: Vec::new(),
            summaries: Vec::new(),
            summary: T::Summary::default(),
        }))
    }

    pub fn from_iter(items: impl IntoIterator<Item = T>) -> Self {
        let mut tree = Self::new();
        for item in items {
            tree.push(item);
        }
        tree
    }

    pub fn summary(&self) -> &T::Summary {
        match self.0.as_ref() {
            Node::Leaf { summary, .. } => summary,
            Node::Internal { summary, .. } => summary,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self.0.as_ref() {
            Node::Leaf { items, .. } => items.is_empty(),
            Node::Internal { children, .. } => children.is_empty(),
        }
    }

    pub fn extent<D: Dimension<T::Summary>>(&self) -> D {
        let mut extent = D::default();
        extent.add_summary(self.summary());
        extent
    }

    pub fn push(&mut self, item: T) {
        if let Some(sibling) = self.push_internal(item) {
            self.grow_root(sibling);
        }
    }

    fn grow_root(&mut self, sibling: SumTree<T>) {
        let left = Self(Arc::new(std::mem::replace(
            Arc::make_mut(&mut self.0),
            Node::Leaf {
                items: Vec::new(),
                summaries: Vec::new(),
                summary: T::Summary::default(),
            },
        )));
        let mut summary = left.summary().clone();
        summary.add(sibling.summary());
        *Arc::make_mut(&mut self.0) = Node::Internal {
            children: vec![left, sibling],
            summary,
        };
    }

    fn push_internal(&mut self, item: T) -> Option<SumTree<T>> {
        let item_summary = item.summary();
        let node = Arc::make_mut(&mut self.0);
        match node {
            Node::Leaf {
                items,
                summaries,
                summary,
            } => {
                items.push(item);
                summary.add(&item_summary);
                summaries.push(item_summary);

                (items.len() > 2 * TREE_BASE).then(|| {
                    let midpoint = items.len() / 2;
                    let right_items: Vec<_> = items.drain(midpoint..).collect();
                    let right_summaries: Vec<_> = summaries.drain(midpoint..).collect();

                    *summary = sum(summaries.iter());
                    let right_summary = sum(right_summaries.iter());

                    SumTree(Arc::new(Node::Leaf {
                        items: right_items,
                        summaries: right_summaries,
                        summary: right_summary,
                    }))
                })
            }
            Node::Internal { children, summary } => {
                let sibling = children.last_mut()?.push_internal(item);
                summary.add(&item_summary);

                if let Some(sibling) = sibling {
                    children.push(sibling);
                }

                (children.len() > 2 * TREE_BASE).then(|| Self::split_children(children, summary))
            }
        }
    }

    fn split_children(children: &mut Vec<SumTree<T>>, summary: &mut T::Summary) -> SumTree<T> {
        let midpoint = children.len() / 2;
        let right_children: Vec<_> = children.drain(midpoint..).collect();
        *summary = sum(children.iter().map(|c| c.summary()));
        let right_summary = sum(right_children.iter().map(|c| c.summary()));
        SumTree(Arc::new(Node::Internal {
            children: right_children,
            summary: right_summary,
        }))
    }

    fn height(&self) -> usize {
        match self.0.as_ref() {
            Node::Leaf { .. } => 0,
            Node::Internal { children, .. } => 1 + children[0].height(),
        }
    }

    pub fn append(&mut self, other: Self) {
        if other.is_empty() {
            return;
        }
        if self.is_empty() {
            *self = other;
            return;
        }

        // Graft `other` at matching height so all leaves stay at equal depth.
        let self_height = self.height();
        let other_height = other.height();
        if self_height >= other_height {
            if let Some(sibling) = self.append_at(other, self_height - other_height) {
                self.grow_root(sibling);
            }
        } else {
            let left = std::mem::replace(self, other);
            if let Some(sibling) = self.prepend_at(left, other_height - self_height) {
                self.grow_root(sibling);
            }
        }
    }

    /// Append `other` (a subtree `depth` levels shorter) under the rightmost
    /// spine. Returns a split-off sibling of `self` if the root overflowed.
    fn append_at(&mut self, other: Self, depth: usize) -> Option<SumTree<T>> {
        let other_summary = other.summary().clone();
        let node = Arc::make_mut(&mut self.0);
        match node {
            Node::Leaf {
                items,
                summaries,
                summary,
            } => {
                debug_assert_eq!(depth, 0);
                let other_node = Arc::try_unwrap(other.0).unwrap_or_else(|arc| (*arc).clone());
                let Node::Leaf {
                    items: other_items,
                    summaries: other_summaries,
                    ..
                } = other_node
                else {
                    unreachable!("equal-height append reached a leaf with an internal node");
                };
                items.extend(other_items);
                summaries.extend(other_summaries);
                summary.add(&other_summary);

                (items.len() > 2 * TREE_BASE).then(|| {
                    let midpoint = items.len() / 2;
                    let right_items: Vec<_> = items.drain(midpoint..).collect();
                    let right_summaries: Vec<_> = summaries.drain(midpoint..).collect();
                    *summary = sum(summaries.iter());
                    let right_summary = sum(right_summaries.iter());
                    SumTree(Arc::new(Node::Leaf {
                        items: right_items,
                        summaries: right_summaries,
                        summary: right_summary,
                    }))
                })
            }
            Node::Internal { children, summary } => {
                if depth == 0 {
                    let other_node =
                        Arc::try_unwrap(other.0).unwrap_or_else(|arc| (*arc).clone());
                    let Node::Internal {
                        children: other_children,
                        ..
                    } = other_node
                    else {
                        unreachable!("equal-height append reached an internal node with a leaf");
                    };
                    children.extend(other_children);
                } else {
                    let sibling = children
                        .last_mut()
                        .expect("internal node with no children")
                        .append_at(other, depth - 1);
                    if let Some(sibling) = sibling {
                        children.push(sibling);
                    }
                }
                summary.add(&other_summary);
                (children.len() > 2 * TREE_BASE).then(|| Self::split_children(children, summary))
            }
        }
    }

    /// Prepend `left` (a subtree `depth` levels shorter) under the leftmost
    /// spine of `self`.
    fn prepend_at(&mut self, left: Self, depth: usize) -> Option<SumTree<T>> {
        let left_summary = left.summary().clone();
        let node = Arc::make_mut(&mut self.0);
        match node {
            Node::Leaf {
                items,
                summaries,
                summary,
            } => {
                debug_assert_eq!(depth, 0);
                let left_node = Arc::try_unwrap(left.0).unwrap_or_else(|arc| (*arc).clone());
                let Node::Leaf {
                    items: mut left_items,
                    summaries: mut left_summaries,
                    ..
                } = left_node
                else {
                    unreachable!("equal-height prepend reached a leaf with an internal node");
                };
                left_items.append(items);
                left_summaries.append(summaries);
                *items = left_items;
                *summaries = left_summaries;
                // Summaries compose in item order, so the prefix goes first.
                let mut prepended = left_summary;
                prepended.add(summary);
                *summary = prepended;

                (items.len() > 2 * TREE_BASE).then(|| {
                    let midpoint = items.len() / 2;
                    let right_items: Vec<_> = items.drain(midpoint..).collect();
                    let right_summaries: Vec<_> = summaries.drain(midpoint..).collect();
                    *summary = sum(summaries.iter());
                    let right_summary = sum(right_summaries.iter());
                    SumTree(Arc::new(Node::Leaf {
                        items: right_items,
                        summaries: right_summaries,
                        summary: right_summary,
                    }))
                })
            }
            Node::Internal { children, summary } => {
                if depth == 0 {
                    let left_node = Arc::try_unwrap(left.0).unwrap_or_else(|arc| (*arc).clone());
                    let Node::Internal {
                        children: mut left_children,
                        ..
                    } = left_node
                    else {
                        unreachable!("equal-height prepend reached an internal node with a leaf");
                    };
                    left_children.append(children);
                    *children = left_children;
                } else {
                    let sibling = children
                        .first_mut()
                        .expect("internal node with no children")
                        .prepend_at(left, depth - 1);
                    if let Some(sibling) = sibling {
                        // The split-off sibling follows the node it came from.
                        children.insert(1, sibling);
                    }
                }
                let mut prepended = left_summary;
                prepended.add(summary);
                *summary = prepended;
                (children.len() > 2 * TREE_BASE).then(|| Self::split_children(children, summary))
            }
        }
    }

    /// Everything strictly before `target` (with `bias` breaking ties),
    /// built by appending whole subtrees.
    pub fn slice_to<D, Target>(&self, target: &Target, bias: Bias) -> SumTree<T>
    where
        D: Dimension<T::Summary>,
        Target: SeekTarget<T::Summary, D>,
    {
        let mut out = SumTree::new();
        let mut pos = D::default();
        self.slice_node(target, bias, &mut pos, &mut out);
        out
    }

    fn slice_node<D, Target>(&self, target: &Target, bias: Bias, pos: &mut D, out: &mut SumTree<T>)
    where
        D: Dimension<T::Summary>,
        Target: SeekTarget<T::Summary, D>,
    {
        match self.0.as_ref() {
            Node::Internal { children, .. } => {
                for child in children {
                    let mut end = pos.clone();
                    end.add_summary(child.summary());
                    let cmp = target.cmp(&end);
                    if cmp == Ordering::Greater || (cmp == Ordering::Equal && bias == Bias::Right) {
                        out.append(child.clone());
                        *pos = end;
                    } else {
                        child.slice_node(target, bias, pos, out);
                        return;
                    }
                }
            }
            Node::Leaf {
                items, summaries, ..
            } => {
                for (item, summary) in items.iter().zip(summaries) {
                    let mut end = pos.clone();
                    end.add_summary(summary);
                    let cmp = target.cmp(&end);
                    if cmp == Ordering::Greater || (cmp == Ordering::Equal && bias == Bias::Right) {
                        out.push(item.clone());
                        *pos = end;
                    } else {
                        return;
                    }
                }
            }
        }
    }

    /// Everything from `target` (with `bias` breaking ties) to the end.
    pub fn suffix_from<D, Target>(&self, target: &Target, bias: Bias) -> SumTree<T>
    where
        D: Dimension<T::Summary>,
        Target: SeekTarget<T::Summary, D>,
    {
        let mut out = SumTree::new();
        let mut pos = D::default();
        self.suffix_node(target, bias, &mut pos, &mut out);
        out
    }

    fn suffix_node<D, Target>(&self, target: &Target, bias: Bias, pos: &mut D, out: &mut SumTree<T>)
    where
        D: Dimension<T::Summary>,
        Target: SeekTarget<T::Summary, D>,
    {
        match self.0.as_ref() {
            Node::Internal { children, .. } => {
                let mut tail = false;
                for child in children {
                    if tail {
                        out.append(child.clone());
                        continue;
                    }
                    let mut end = pos.clone();
                    end.add_summary(child.summary());
                    let cmp = target.cmp(&end);
                    if cmp == Ordering::Greater || (cmp == Ordering::Equal && bias == Bias::Right) {
                        *pos = end;
                    } else {
                        child.suffix_node(target, bias, pos, out);
                        tail = true;
                    }
                }
            }
            Node::Leaf {
                items, summaries, ..
            } => {
                let mut tail = false;
                for (item, summary) in items.iter().zip(summaries) {
                    if tail {
                        out.push(item.clone());
                        continue;
                    }
                    let mut end = pos.clone();
                    end.add_summary(summary);
                    let cmp = target.cmp(&end);
                    if cmp == Ordering::Greater || (cmp == Ordering::Equal && bias == Bias::Right) {
                        *pos = end;
                    } else {
                        out.push(item.clone());
                        tail = true;
                    }
                }
            }
        }
    }

    pub fn cursor<D: Dimension<T::Summary>>(&self) -> Cursor<'_, T, D> {
        Cursor {
            tree: self,
            stack: Vec::new(),
            position: D::default(),
            did_seek: false,
            at_end: false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        let mut stack = vec![(self, 0usize)];
        std::iter::from_fn(move || loop {
            let (tree, index) = stack.last_mut()?;
            match tree.0.as_ref() {
                Node::Leaf { items, .. } => {
                    if let Some(item) = items.get(*index) {
                        *index += 1;
                        return Some(item);
                    }
                    stack.pop();
                }
                Node::Internal { children, .. } => {
                    if let Some(child) = children.get(*index) {
                        *index += 1;
                        stack.push((child, 0));
                    } else {
                        stack.pop();
                    }
                }
            }
        })
    }

    pub(crate) fn internal_children(&self) -> Option<&[SumTree<T>]> {
        match self.0.as_ref() {
            Node::Internal { children, .. } => Some(children),
            Node::Leaf { .. } => None,
        }
    }

    pub(crate) fn leaf_entries(&self) -> Option<(&[T], &[T::Summary])> {
        match self.0.as_ref() {
            Node::Leaf {
                items, summaries, ..
            } => Some((items, summaries)),
            Node::Internal { .. } => None,
        }
    }

    #[cfg(test)]
    fn max_node_width(&self) -> usize {
        match self.0.as_ref() {
            Node::Leaf { items, .. } => items.len(),
            Node::Internal { children, .. } => children
                .iter()
                .map(|c| c.max_node_width())
                .max()
                .unwrap_or(0)
                .max(children.len()),
        }
    }

    #[cfg(test)]
    fn leaf_depths(&self, depth: usize, out: &mut Vec<usize>) {
        match self.0.as_ref() {
            Node::Leaf { .. } => out.push(depth),
            Node::Internal { children, .. } => {
                for child in children {
                    child.leaf_depths(depth + 1, out);
                }
            }
        }
    }
}

fn sum<'a, S: Summary + 'a>(iter: impl Iterator<Item = &'a S>) -> S {
    let mut out = S::default();
    for s in iter {
        out.add(s);
    }
    out
}

struct StackEntry<'a, T: Item, D> {
    tree: &'a SumTree<T>,
    index: usize,
    position: D,
}

/// A seekable pointer into the tree, measuring its position in `D`.
pub struct Cursor<'a, T: Item, D> {
    tree: &'a SumTree<T>,
    stack: Vec<StackEntry<'a, T, D>>,
    position: D,
    did_seek: bool,
    at_end: bool,
}

impl<'a, T: Item, D: Dimension<T::Summary>> Cursor<'a, T, D> {
    /// Position the cursor at the first item whose end passes `target`.
    /// Returns true if the accumulated position lands exactly on the target.
    pub fn seek<Target: SeekTarget<T::Summary, D>>(&mut self, target: &Target, bias: Bias) -> bool {
        self.stack.clear();
        self.position = D::default();
        self.did_seek = true;
        self.at_end = self.tree.is_empty();
        if !self.tree.is_empty() {
            self.stack.push(StackEntry {
                tree: self.tree,
                index: 0,
                position: D::default(),
            });
        }

        let mut ascending = false;
        'outer: while let Some(entry) = self.stack.last_mut() {
            match entry.tree.0.as_ref() {
                Node::Internal { children, .. } => {
                    if ascending {
                        entry.index += 1;
                        entry.position = self.position.clone();
                    }

                    let start_index = entry.index;
                    for (ix, child) in children[start_index..].iter().enumerate() {
                        let mut child_end = self.position.clone();
                        child_end.add_summary(child.summary());

                        let cmp = target.cmp(&child_end);
                        if cmp == Ordering::Greater
                            || (cmp == Ordering::Equal && bias == Bias::Right)
                        {
                            self.position = child_end;
                            entry.position = self.position.clone();
                        } else {
                            entry.index = start_index + ix;
                            self.stack.push(StackEntry {
                                tree: child,
                                index: 0,
                                position: self.position.clone(),
                            });
                            ascending = false;
                            continue 'outer;
                        }
                    }
                    entry.index = children.len();
                }
                Node::Leaf { summaries, .. } => {
                    let start_index = entry.index;
                    for (ix, item_summary) in summaries[start_index..].iter().enumerate() {
                        let mut child_end = self.position.clone();
                        child_end.add_summary(item_summary);

                        let cmp = target.cmp(&child_end);
                        if cmp == Ordering::Greater
                            || (cmp == Ordering::Equal && bias == Bias::Right)
                        {
                            self.position = child_end;
                        } else {
                            entry.index = start_index + ix;
                            break 'outer;
                        }
                    }
                    entry.index = summaries.len();
                }
            }
            self.stack.pop();
            ascending = true;
        }

        self.at_end = self.stack.is_empty();

        let mut end = self.position.clone();
        if let Some(summary) = self.item_summary() {
            end.add_summary(summary);
        }
        target.cmp(&end) == Ordering::Equal
    }

    pub fn next(&mut self) {
        if self.at_end || !self.did_seek {
            return;
        }

        while let Some(entry) = self.stack.pop() {
            match entry.tree.0.as_ref() {
                Node::Leaf { summaries, .. } => {
                    let next_index = entry.index + 1;
                    if next_index < summaries.len() {
                        self.position.add_summary(&summaries[entry.index]);
                        self.stack.push(StackEntry {
                            tree: entry.tree,
                            index: next_index,
                            position: self.position.clone(),
                        });
                        return;
                    }
                }
                Node::Internal { children, .. } => {
                    let next_index = entry.index + 1;
                    if next_index < children.len() {
                        self.position.add_summary(children[entry.index].summary());
                        self.stack.push(StackEntry {
                            tree: entry.tree,
                            index: next_index,
                            position: self.position.clone(),
                        });
                        self.descend_to_first(&children[next_index]);
                        return;
                    }
                }
            }
        }
        self.at_end = true;
    }

    fn descend_to_first(&mut self, tree: &'a SumTree<T>) {
        let mut current = tree;
        loop {
            match current.0.as_ref() {
                Node::Leaf { .. } => {
                    self.stack.push(StackEntry {
                        tree: current,
                        index: 0,
                        position: self.position.clone(),
                    });
                    break;
                }
                Node::Internal { children, .. } => {
                    if children.is_empty() {
                        break;
                    }
                    self.stack.push(StackEntry {
                        tree: current,
                        index: 0,
                        position: self.position.clone(),
                    });
                    current = &children[0];
                }
            }
        }
    }

    pub fn item(&self) -> Option<&'a T> {
        if self.at_end || !self.did_seek {
            return None;
        }
        self.stack
            .last()
            .and_then(|entry| match entry.tree.0.as_ref() {
                Node::Leaf { items, .. } => items.get(entry.index),
                Node::Internal { .. } => None,
            })
    }

    fn item_summary(&self) -> Option<&'a T::Summary> {
        if self.at_end || !self.did_seek {
            return None;
        }
        self.stack
            .last()
            .and_then(|entry| match entry.tree.0.as_ref() {
                Node::Leaf { summaries, .. } => summaries.get(entry.index),
                Node::Internal { .. } => None,
            })
    }

    /// Position at the start of the current item.
    pub fn start(&self) -> &D {
        &self.position
    }

    /// Position just past the current item.
    pub fn end(&self) -> D {
        let mut end = self.position.clone();
        if let Some(summary) = self.item_summary() {
            end.add_summary(summary);
        }
        end
    }

    pub fn at_end(&self) -> bool {
        self.at_end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct Run(usize);

    #[derive(Clone, Default, Debug)]
    struct Count {
        items: usize,
        units: usize,
        /// Units of the first item; summaries compose in item order, so this
        /// catches any reversed composition.
        first: Option<usize>,
    }

    impl Summary for Count {
        fn add(&mut self, other: &Self) {
            self.items += other.items;
            self.units += other.units;
            if self.first.is_none() {
                self.first = other.first;
            }
        }
    }

    impl Item for Run {
        type Summary = Count;
        fn summary(&self) -> Count {
            Count {
                items: 1,
                units: self.0,
                first: Some(self.0),
            }
        }
    }

    #[derive(Clone, Default, Debug, PartialEq)]
    struct Units(usize);

    impl Dimension<Count> for Units {
        fn add_summary(&mut self, summary: &Count) {
            self.0 += summary.units;
        }
    }

    impl SeekTarget<Count, Units> for usize {
        fn cmp(&self, position: &Units) -> std::cmp::Ordering {
            Ord::cmp(self, &position.0)
        }
    }

    fn tree_of(lens: impl IntoIterator<Item = usize>) -> SumTree<Run> {
        SumTree::from_iter(lens.into_iter().map(Run))
    }

    fn check_balance(tree: &SumTree<Run>) {
        let mut depths = Vec::new();
        tree.leaf_depths(0, &mut depths);
        assert!(depths.windows(2).all(|w| w[0] == w[1]), "uneven leaf depth");
        assert!(tree.max_node_width() <= 2 * TREE_BASE);
    }

    #[test]
    fn push_keeps_balance_and_sums() {
        let tree = tree_of((0..1000).map(|_| 3));
        assert_eq!(tree.summary().items, 1000);
        assert_eq!(tree.summary().units, 3000);
        check_balance(&tree);
    }

    #[test]
    fn append_trees_of_unequal_height() {
        let mut big = tree_of((0..500).map(|_| 1));
        let small = tree_of([7, 7, 7]);
        big.append(small);
        assert_eq!(big.summary().items, 503);
        assert_eq!(big.summary().units, 521);
        check_balance(&big);

        let mut small = tree_of([7, 7, 7]);
        let big2 = tree_of((0..500).map(|_| 1));
        small.append(big2);
        assert_eq!(small.summary().items, 503);
        assert_eq!(small.summary().units, 521);
        assert_eq!(small.summary().first, Some(7));
        check_balance(&small);
        let first = small.iter().next().unwrap();
        assert_eq!(first.0, 7);
    }

    #[test]
    fn slice_and_suffix_partition_the_tree() {
        let tree = tree_of((1..=100).map(|_| 2));
        for cut in [0usize, 1, 2, 3, 99, 100, 101, 200] {
            let left = tree.slice_to::<Units, _>(&cut, Bias::Left);
            let right = tree.suffix_from::<Units, _>(&cut, Bias::Left);
            assert_eq!(
                left.summary().units + right.summary().units,
                200,
                "cut at {cut}"
            );
            // Left bias: an item ending exactly at the cut goes right.
            let expected: usize = (1..=100).map(|i| 2 * i).filter(|&end| end < cut).count() * 2;
            assert_eq!(left.summary().units, expected, "cut at {cut}");
            check_balance(&left);
            check_balance(&right);
        }
    }

    #[test]
    fn cursor_seeks_and_iterates() {
        let tree = tree_of((0..50).map(|i| i + 1)); // units 1,2,3,...
        let mut cursor = tree.cursor::<Units>();
        // Offset 6 falls at the end of item 3 (1+2+3); with right bias the
        // cursor moves past it.
        cursor.seek(&6usize, Bias::Right);
        assert_eq!(cursor.item().unwrap().0, 4);
        assert_eq!(cursor.start().0, 6);
        cursor.next();
        assert_eq!(cursor.item().unwrap().0, 5);
        assert_eq!(cursor.start().0, 10);

        let mut cursor = tree.cursor::<Units>();
        cursor.seek(&6usize, Bias::Left);
        assert_eq!(cursor.item().unwrap().0, 3);
    }

    #[test]
    fn cursor_past_end() {
        let tree = tree_of([1, 1, 1]);
        let mut cursor = tree.cursor::<Units>();
        assert!(!cursor.seek(&100usize, Bias::Right));
        assert!(cursor.at_end());
        assert!(cursor.item().is_none());
        assert_eq!(cursor.start().0, 3);
    }

    #[test]
    fn empty_tree_behaves() {
        let tree: SumTree<Run> = SumTree::new();
        assert!(tree.is_empty());
        let left = tree.slice_to::<Units, _>(&0usize, Bias::Left);
        assert!(left.is_empty());
        let mut cursor = tree.cursor::<Units>();
        cursor.seek(&0usize, Bias::Left);
        assert!(cursor.at_end());
        assert!(cursor.item().is_none());
    }
}
