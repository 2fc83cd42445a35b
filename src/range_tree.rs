//! Lazy multiplicative segment tree over market bins.
//!
//! Nodes live in one flat array: the root is index 1, the children of `i`
//! are `2i` and `2i + 1`, and bin `b` is the leaf at `capacity + b`, where
//! `capacity` is the next power of two >= the bin count. Padding leaves past
//! the last bin hold zero.
//!
//! Every node's `sum` already includes its own `pending` factor; `pending`
//! is what has not yet been handed to the children. All products round up,
//! so a strictly positive weight can never collapse to zero.
//!
//! Mutations go through [`TreeTransaction`], which buffers node writes in an
//! overlay. Nothing touches the committed tree until [`RangeMultiplyTree::commit`].
//!
//! Only ratios between weights carry meaning. Whenever the root sum grows
//! past 2^128 every weight is scaled down by a power of two, so repeated
//! buys on one bin never run the 256-bit sums out of room.

use std::collections::HashMap;

use ethereum_types::U256;
use tracing::debug;

use crate::error::{ClmsrError, Result};
use crate::fixed_point::{wmul, wmul_wide, Rounding, WAD};

/// Upper bound on bins per tree (2^22).
pub const MAX_TREE_BINS: usize = 1 << 22;

/// Committed multiplicative updates between full rebuilds.
pub const DEFAULT_REBUILD_THRESHOLD: u32 = 1_000;

/// Combined pending factors are kept inside [0.001, 1000]; a tag that would
/// leave the window is pushed to the children first.
const MIN_PENDING: u128 = WAD / 1_000;
const MAX_PENDING: u128 = WAD * 1_000;

/// Largest root sum, in bits, left alone after an update.
pub const MAX_ROOT_BITS: usize = 128;

/// 2^-9 as a WAD; exact because WAD is a multiple of 2^18.
const RENORMALIZE_FACTOR: u128 = WAD >> 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Node {
    pub sum: U256,
    pub pending: u128,
}

impl Node {
    fn with_sum(sum: U256) -> Self {
        Self { sum, pending: WAD }
    }
}

/// Read/write access to tree nodes by flat index.
///
/// Implemented by the committed tree and by transactions, so the lazy
/// propagation routines below run unchanged against either.
pub trait NodeStore {
    /// Number of leaf slots (a power of two).
    fn capacity(&self) -> usize;
    fn node(&self, index: usize) -> Node;
    fn set_node(&mut self, index: usize, node: Node);
}

fn check_bounds(lo: usize, hi: usize, bins: usize) -> Result<()> {
    if lo > hi || hi >= bins {
        return Err(ClmsrError::IndexOutOfBounds { lo, hi, bins });
    }
    Ok(())
}

fn add_sums(a: U256, b: U256) -> Result<U256> {
    a.checked_add(b).ok_or(ClmsrError::MathOverflow)
}

/// Multiply a whole subtree by `factor` by tagging its root.
fn apply_factor<S: NodeStore + ?Sized>(store: &mut S, index: usize, factor: u128) -> Result<()> {
    let mut node = store.node(index);
    if index < store.capacity() {
        let combined = wmul(node.pending, factor, Rounding::Up)?;
        if (MIN_PENDING..=MAX_PENDING).contains(&combined) {
            node.pending = combined;
        } else {
            push_down(store, index)?;
            node.pending = factor;
        }
    }
    node.sum = wmul_wide(node.sum, factor, Rounding::Up)?;
    store.set_node(index, node);
    Ok(())
}

/// Hand an internal node's pending factor to its two children.
fn push_down<S: NodeStore + ?Sized>(store: &mut S, index: usize) -> Result<()> {
    let node = store.node(index);
    if node.pending == WAD {
        return Ok(());
    }
    apply_factor(store, 2 * index, node.pending)?;
    apply_factor(store, 2 * index + 1, node.pending)?;
    store.set_node(index, Node::with_sum(node.sum));
    Ok(())
}

fn update_range<S: NodeStore + ?Sized>(
    store: &mut S,
    index: usize,
    (node_lo, node_hi): (usize, usize),
    (lo, hi): (usize, usize),
    factor: u128,
) -> Result<()> {
    if hi < node_lo || node_hi < lo {
        return Ok(());
    }
    if lo <= node_lo && node_hi <= hi {
        return apply_factor(store, index, factor);
    }

    push_down(store, index)?;
    let mid = node_lo + (node_hi - node_lo) / 2;
    update_range(store, 2 * index, (node_lo, mid), (lo, hi), factor)?;
    update_range(store, 2 * index + 1, (mid + 1, node_hi), (lo, hi), factor)?;

    let sum = add_sums(store.node(2 * index).sum, store.node(2 * index + 1).sum)?;
    store.set_node(index, Node::with_sum(sum));
    Ok(())
}

/// Divide every weight by 2^9 until the root fits in `MAX_ROOT_BITS`.
/// One tag on the root per step; bin ratios are unchanged.
fn renormalize<S: NodeStore + ?Sized>(store: &mut S) -> Result<()> {
    while store.node(1).sum.bits() > MAX_ROOT_BITS {
        apply_factor(store, 1, RENORMALIZE_FACTOR)?;
    }
    Ok(())
}

/// Range sum without pushing anything down: partial results are scaled by
/// each ancestor's pending factor on the way back up.
fn query_range<S: NodeStore + ?Sized>(
    store: &S,
    index: usize,
    (node_lo, node_hi): (usize, usize),
    (lo, hi): (usize, usize),
) -> Result<U256> {
    if hi < node_lo || node_hi < lo {
        return Ok(U256::zero());
    }
    let node = store.node(index);
    if lo <= node_lo && node_hi <= hi {
        return Ok(node.sum);
    }

    let mid = node_lo + (node_hi - node_lo) / 2;
    let left = query_range(store, 2 * index, (node_lo, mid), (lo, hi))?;
    let right = query_range(store, 2 * index + 1, (mid + 1, node_hi), (lo, hi))?;
    let partial = add_sums(left, right)?;
    if node.pending == WAD {
        Ok(partial)
    } else {
        wmul_wide(partial, node.pending, Rounding::Up)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeMultiplyTree {
    bins: usize,
    capacity: usize,
    nodes: Vec<Node>,
    updates_since_rebuild: u32,
    rebuild_threshold: u32,
}

impl NodeStore for RangeMultiplyTree {
    fn capacity(&self) -> usize {
        self.capacity
    }

    fn node(&self, index: usize) -> Node {
        self.nodes[index]
    }

    fn set_node(&mut self, index: usize, node: Node) {
        self.nodes[index] = node;
    }
}

impl RangeMultiplyTree {
    /// Build from per-bin WAD weights in O(n). Every weight must be positive.
    pub fn build(weights: &[u128]) -> Result<Self> {
        let bins = weights.len();
        if bins == 0 || bins > MAX_TREE_BINS {
            return Err(ClmsrError::InvalidBinCount {
                bins,
                max: MAX_TREE_BINS,
            });
        }
        if let Some(index) = weights.iter().position(|w| *w == 0) {
            return Err(ClmsrError::InvalidWeight { index });
        }

        let capacity = bins.next_power_of_two();
        let mut nodes = vec![Node::with_sum(U256::zero()); 2 * capacity];
        for (bin, weight) in weights.iter().enumerate() {
            nodes[capacity + bin].sum = U256::from(*weight);
        }
        for index in (1..capacity).rev() {
            nodes[index].sum = nodes[2 * index].sum + nodes[2 * index + 1].sum;
        }

        let mut tree = Self {
            bins,
            capacity,
            nodes,
            updates_since_rebuild: 0,
            rebuild_threshold: DEFAULT_REBUILD_THRESHOLD,
        };
        renormalize(&mut tree)?;
        Ok(tree)
    }

    pub fn uniform(bins: usize, weight: u128) -> Result<Self> {
        Self::build(&vec![weight; bins])
    }

    pub fn with_rebuild_threshold(mut self, threshold: u32) -> Self {
        self.rebuild_threshold = threshold.max(1);
        self
    }

    pub fn bins(&self) -> usize {
        self.bins
    }

    pub fn rebuild_threshold(&self) -> u32 {
        self.rebuild_threshold
    }

    pub fn updates_since_rebuild(&self) -> u32 {
        self.updates_since_rebuild
    }

    /// Sum of all bins. Padding leaves are zero, so this equals `query(0, bins - 1)`.
    pub fn total_sum(&self) -> U256 {
        self.nodes[1].sum
    }

    /// Sum of bins `lo..=hi`.
    pub fn query(&self, lo: usize, hi: usize) -> Result<U256> {
        check_bounds(lo, hi, self.bins)?;
        query_range(self, 1, (0, self.capacity - 1), (lo, hi))
    }

    /// Multiply bins `lo..=hi` by `factor` and commit immediately.
    pub fn update(&mut self, lo: usize, hi: usize, factor: u128) -> Result<()> {
        let mut txn = self.begin();
        txn.update(lo, hi, factor)?;
        let changes = txn.into_changes();
        self.commit(changes);
        self.maybe_rebuild().map(|_| ())
    }

    pub fn begin(&self) -> TreeTransaction<'_> {
        TreeTransaction {
            tree: self,
            overlay: HashMap::new(),
            updates: 0,
        }
    }

    /// Apply a transaction's buffered writes. The returned log restores the
    /// previous nodes via [`RangeMultiplyTree::revert`].
    pub fn commit(&mut self, changes: ChangeSet) -> UndoLog {
        let mut previous = Vec::with_capacity(changes.writes.len());
        for (index, node) in changes.writes {
            previous.push((index, self.nodes[index]));
            self.nodes[index] = node;
        }
        self.updates_since_rebuild = self.updates_since_rebuild.saturating_add(changes.updates);
        UndoLog {
            previous,
            updates: changes.updates,
        }
    }

    pub fn revert(&mut self, undo: UndoLog) {
        for (index, node) in undo.previous.into_iter().rev() {
            self.nodes[index] = node;
        }
        self.updates_since_rebuild = self.updates_since_rebuild.saturating_sub(undo.updates);
    }

    /// Rebuild once enough multiplicative updates have been committed.
    pub fn maybe_rebuild(&mut self) -> Result<bool> {
        if self.updates_since_rebuild < self.rebuild_threshold {
            return Ok(false);
        }
        self.rebuild()?;
        Ok(true)
    }

    /// Push every pending factor to the leaves and recompute all internal
    /// sums from them, discarding drift accumulated by chained tags.
    ///
    /// A failure part-way leaves the tree consistent: each push preserves
    /// every logical leaf weight.
    pub fn rebuild(&mut self) -> Result<()> {
        for index in 1..self.capacity {
            push_down(self, index)?;
        }
        for index in (1..self.capacity).rev() {
            let sum = add_sums(self.nodes[2 * index].sum, self.nodes[2 * index + 1].sum)?;
            self.nodes[index] = Node::with_sum(sum);
        }
        debug!(
            bins = self.bins,
            updates = self.updates_since_rebuild,
            "range tree rebuilt from leaves"
        );
        self.updates_since_rebuild = 0;
        Ok(())
    }

    /// Logical weight of one bin, applying every ancestor's pending factor.
    pub fn leaf_weight(&self, bin: usize) -> Result<U256> {
        check_bounds(bin, bin, self.bins)?;
        let mut index = self.capacity + bin;
        let mut weight = self.nodes[index].sum;
        while index > 1 {
            index /= 2;
            let pending = self.nodes[index].pending;
            if pending != WAD {
                weight = wmul_wide(weight, pending, Rounding::Up)?;
            }
        }
        Ok(weight)
    }

    /// From-scratch resummation of all logical leaf weights.
    pub fn resum_leaves(&self) -> Result<U256> {
        (0..self.bins).try_fold(U256::zero(), |acc, bin| add_sums(acc, self.leaf_weight(bin)?))
    }
}

/// Buffered node writes from a finished transaction.
#[derive(Debug)]
pub struct ChangeSet {
    writes: Vec<(usize, Node)>,
    updates: u32,
}

/// Pre-images of committed nodes.
#[derive(Debug)]
pub struct UndoLog {
    previous: Vec<(usize, Node)>,
    updates: u32,
}

/// Copy-on-write view over a committed tree.
///
/// Reads see the transaction's own writes; dropping the transaction
/// discards them.
pub struct TreeTransaction<'a> {
    tree: &'a RangeMultiplyTree,
    overlay: HashMap<usize, Node>,
    updates: u32,
}

impl NodeStore for TreeTransaction<'_> {
    fn capacity(&self) -> usize {
        self.tree.capacity
    }

    fn node(&self, index: usize) -> Node {
        self.overlay
            .get(&index)
            .copied()
            .unwrap_or(self.tree.nodes[index])
    }

    fn set_node(&mut self, index: usize, node: Node) {
        self.overlay.insert(index, node);
    }
}

impl TreeTransaction<'_> {
    pub fn bins(&self) -> usize {
        self.tree.bins
    }

    pub fn total_sum(&self) -> U256 {
        self.node(1).sum
    }

    pub fn query(&self, lo: usize, hi: usize) -> Result<U256> {
        check_bounds(lo, hi, self.tree.bins)?;
        query_range(self, 1, (0, self.tree.capacity - 1), (lo, hi))
    }

    pub fn update(&mut self, lo: usize, hi: usize, factor: u128) -> Result<()> {
        check_bounds(lo, hi, self.tree.bins)?;
        if factor == 0 {
            return Err(ClmsrError::InvalidFactor {
                factor,
                min: 1,
                max: u128::MAX,
            });
        }
        let span = (0, self.tree.capacity - 1);
        update_range(self, 1, span, (lo, hi), factor)?;
        renormalize(self)?;
        self.updates = self.updates.saturating_add(1);
        Ok(())
    }

    pub fn updates(&self) -> u32 {
        self.updates
    }

    pub fn into_changes(self) -> ChangeSet {
        ChangeSet {
            writes: self.overlay.into_iter().collect(),
            updates: self.updates,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn wad(units: u128) -> U256 {
        U256::from(units * WAD)
    }

    /// |actual - expected| <= expected / 10^digits
    fn assert_close(actual: U256, expected: U256, digits: usize) {
        let diff = if actual > expected {
            actual - expected
        } else {
            expected - actual
        };
        assert!(
            diff * U256::exp10(digits) <= expected,
            "actual={} expected={} diff={}",
            actual,
            expected,
            diff
        );
    }

    #[test]
    fn build_and_query() {
        let weights: Vec<u128> = (1..=5).map(|w| w * WAD).collect();
        let tree = RangeMultiplyTree::build(&weights).unwrap();
        assert_eq!(tree.bins(), 5);
        assert_eq!(tree.total_sum(), wad(15));
        assert_eq!(tree.query(0, 4).unwrap(), wad(15));
        assert_eq!(tree.query(1, 3).unwrap(), wad(9));
        assert_eq!(tree.query(4, 4).unwrap(), wad(5));
    }

    #[test]
    fn rejects_invalid_construction() {
        assert!(matches!(
            RangeMultiplyTree::build(&[]),
            Err(ClmsrError::InvalidBinCount { .. })
        ));
        assert_eq!(
            RangeMultiplyTree::build(&[WAD, 0, WAD]).unwrap_err(),
            ClmsrError::InvalidWeight { index: 1 }
        );
    }

    #[test]
    fn rejects_out_of_bounds_indices() {
        let mut tree = RangeMultiplyTree::uniform(10, WAD).unwrap();
        let expected = ClmsrError::IndexOutOfBounds {
            lo: 3,
            hi: 10,
            bins: 10,
        };
        assert_eq!(tree.query(3, 10).unwrap_err(), expected);
        assert_eq!(tree.update(3, 10, 2 * WAD).unwrap_err(), expected);
        assert!(matches!(
            tree.query(5, 4),
            Err(ClmsrError::IndexOutOfBounds { .. })
        ));
        assert!(matches!(
            tree.update(0, 0, 0),
            Err(ClmsrError::InvalidFactor { .. })
        ));
    }

    #[test]
    fn update_scales_only_the_range() {
        let mut tree = RangeMultiplyTree::uniform(10, WAD).unwrap();
        tree.update(2, 5, 2 * WAD).unwrap();
        assert_eq!(tree.total_sum(), wad(14));
        assert_eq!(tree.query(0, 1).unwrap(), wad(2));
        assert_eq!(tree.query(2, 5).unwrap(), wad(8));
        assert_eq!(tree.query(5, 7).unwrap(), wad(4));
        assert_eq!(tree.leaf_weight(3).unwrap(), wad(2));
        assert_eq!(tree.leaf_weight(6).unwrap(), wad(1));
    }

    #[test]
    fn overlapping_updates_compose() {
        let mut tree = RangeMultiplyTree::uniform(8, WAD).unwrap();
        tree.update(0, 7, 4 * WAD).unwrap();
        tree.update(2, 3, WAD / 2).unwrap();
        tree.update(3, 6, 3 * WAD).unwrap();
        let expected = [4, 4, 2, 6, 12, 12, 12, 4];
        for (bin, weight) in expected.iter().enumerate() {
            assert_eq!(tree.leaf_weight(bin).unwrap(), wad(*weight), "bin {}", bin);
        }
        assert_eq!(tree.total_sum(), wad(expected.iter().sum()));
        assert_eq!(tree.query(2, 4).unwrap(), wad(20));
    }

    #[test]
    fn weights_never_reach_zero() {
        let mut tree = RangeMultiplyTree::build(&[1, 1, 1]).unwrap();
        for _ in 0..10 {
            tree.update(0, 2, WAD / 2).unwrap();
        }
        for bin in 0..3 {
            assert!(!tree.leaf_weight(bin).unwrap().is_zero());
        }
    }

    #[test]
    fn renormalization_keeps_ratios() {
        let mut tree = RangeMultiplyTree::build(&[WAD, 3 * WAD]).unwrap();
        tree.update(0, 1, 100_000_000_000_000_000_000 * WAD).unwrap();
        assert!(tree.total_sum().bits() <= MAX_ROOT_BITS);
        let first = tree.leaf_weight(0).unwrap();
        assert_eq!(tree.leaf_weight(1).unwrap(), first * U256::from(3u64));
        assert_eq!(tree.total_sum(), first * U256::from(4u64));
    }

    #[test]
    fn repeated_growth_on_one_bin_stays_bounded() {
        let mut tree = RangeMultiplyTree::uniform(4, WAD).unwrap();
        for _ in 0..40 {
            tree.update(0, 0, 1_000 * WAD).unwrap();
            assert!(tree.total_sum().bits() <= MAX_ROOT_BITS);
        }
        let hot = tree.leaf_weight(0).unwrap();
        assert_close(tree.total_sum(), hot, 30);
        for bin in 1..4 {
            assert!(!tree.leaf_weight(bin).unwrap().is_zero());
        }
        assert_close(tree.total_sum(), tree.resum_leaves().unwrap(), 30);
    }

    #[test]
    fn pending_window_pushes_down() {
        let mut tree = RangeMultiplyTree::uniform(16, WAD).unwrap();
        for _ in 0..12 {
            tree.update(0, 15, 2 * WAD).unwrap();
        }
        assert!(tree.nodes.iter().all(|n| n.pending <= MAX_PENDING));
        for bin in 0..16 {
            assert_eq!(tree.leaf_weight(bin).unwrap(), wad(4096));
        }
        assert_eq!(tree.total_sum(), wad(16 * 4096));
    }

    #[test]
    fn dropped_transaction_leaves_tree_untouched() {
        let tree = RangeMultiplyTree::uniform(12, WAD).unwrap();
        let before = tree.nodes.clone();
        {
            let mut txn = tree.begin();
            txn.update(0, 5, 3 * WAD).unwrap();
            txn.update(4, 11, WAD / 4).unwrap();
            assert_ne!(txn.total_sum(), tree.total_sum());
            assert_eq!(txn.query(0, 3).unwrap(), wad(12));
        }
        assert_eq!(tree.nodes, before);
    }

    #[test]
    fn revert_restores_committed_nodes() {
        let mut tree = RangeMultiplyTree::uniform(12, WAD).unwrap();
        tree.update(1, 9, 5 * WAD).unwrap();
        let before = tree.nodes.clone();
        let updates_before = tree.updates_since_rebuild();

        let mut txn = tree.begin();
        txn.update(0, 11, 7 * WAD).unwrap();
        txn.update(3, 4, WAD / 2).unwrap();
        let changes = txn.into_changes();
        let undo = tree.commit(changes);
        assert_ne!(tree.nodes, before);

        tree.revert(undo);
        assert_eq!(tree.nodes, before);
        assert_eq!(tree.updates_since_rebuild(), updates_before);
    }

    #[test]
    fn periodic_rebuild_flushes_pending() {
        let mut tree = RangeMultiplyTree::uniform(20, WAD)
            .unwrap()
            .with_rebuild_threshold(3);
        tree.update(0, 19, 3 * WAD).unwrap();
        tree.update(5, 12, WAD / 3).unwrap();
        assert_eq!(tree.updates_since_rebuild(), 2);
        tree.update(7, 7, 11 * WAD / 10).unwrap();
        assert_eq!(tree.updates_since_rebuild(), 0);
        assert!(tree.nodes[1..tree.capacity].iter().all(|n| n.pending == WAD));
        assert_eq!(tree.total_sum(), tree.resum_leaves().unwrap());
    }

    #[test]
    fn million_bins() {
        let bins = 1_000_000;
        let mut tree = RangeMultiplyTree::uniform(bins, WAD).unwrap();
        tree.update(0, bins - 1, 2 * WAD).unwrap();
        tree.update(500_000, 500_000, 3 * WAD).unwrap();
        tree.update(999_999, 999_999, WAD / 2).unwrap();
        assert_eq!(
            tree.query(123_456, 654_321).unwrap(),
            wad(2 * (654_321 - 123_456 + 1) + 4)
        );
        assert_eq!(tree.leaf_weight(999_999).unwrap(), wad(1));
        assert_eq!(tree.total_sum(), wad(2 * bins as u128 + 4 - 1));
    }

    proptest! {
        #[test]
        fn matches_naive_model(
            bins in 1usize..64,
            ops in prop::collection::vec((0usize..64, 0usize..64, 500u128..2_000u128), 1..60),
        ) {
            let mut tree = RangeMultiplyTree::uniform(bins, WAD).unwrap();
            let mut naive = vec![U256::from(WAD); bins];
            for (a, b, milli) in ops {
                let (lo, hi) = (a.min(b) % bins, a.max(b) % bins);
                let (lo, hi) = (lo.min(hi), lo.max(hi));
                let factor = milli * WAD / 1_000;
                tree.update(lo, hi, factor).unwrap();
                for weight in naive.iter_mut().take(hi + 1).skip(lo) {
                    *weight = wmul_wide(*weight, factor, Rounding::Up).unwrap();
                }
                let expected = naive.iter().fold(U256::zero(), |acc, w| acc + *w);
                assert_close(tree.total_sum(), expected, 12);
                assert_close(tree.query(lo, hi).unwrap(), naive[lo..=hi].iter().fold(U256::zero(), |acc, w| acc + *w), 12);
            }
            assert_close(tree.total_sum(), tree.resum_leaves().unwrap(), 15);
        }
    }
}
