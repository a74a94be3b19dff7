// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{context::Context, histogram::LeafId, HashMap};
use std::sync::Arc;

/// A rooted, unordered subtree, shared structurally between assemblies.
///
/// Clades are immutable; the [`Arena`] interns them by canonical
/// representation, so equal shapes are the same allocation no matter how
/// they were assembled.
#[derive(Clone, Debug)]
pub struct Clade(Arc<Node>);

#[derive(Debug)]
struct Node {
    /// Empty for leaves
    children: Vec<Clade>,

    leaf: Option<LeafId>,

    /// Sorted leaf set
    leaves: Vec<LeafId>,

    /// Edge count from each leaf to this node
    depths: HashMap<LeafId, u32>,

    /// Canonical representation, see [`Clade::repr`]
    repr: Box<str>,

    min_rank: u32,
}

impl PartialEq for Clade {
    fn eq(&self, other: &Self) -> bool {
        self.repr() == other.repr()
    }
}

impl Eq for Clade {}

impl Clade {
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.0.leaf.is_some()
    }

    /// Sorted leaves of this clade.
    #[must_use]
    pub fn leaves(&self) -> &[LeafId] {
        &self.0.leaves
    }

    #[must_use]
    pub fn contains(&self, leaf: LeafId) -> bool {
        self.0.leaves.binary_search(&leaf).is_ok()
    }

    /// Number of internal edges between `leaf` and this clade's root.
    #[must_use]
    pub fn depth_of(&self, leaf: LeafId) -> Option<u32> {
        self.0.depths.get(&leaf).copied()
    }

    pub fn leaf_depths(&self) -> impl Iterator<Item = (LeafId, u32)> + '_ {
        self.0.depths.iter().map(|(&l, &d)| (l, d))
    }

    /// Canonical string form.
    ///
    /// Internal nodes render as a parenthesized list: non-leaf children
    /// first, ordered by minimum leaf rank, then leaf ranks in ascending
    /// order. Leaves render as their bare rank. Equal shapes yield equal
    /// strings regardless of construction order.
    #[must_use]
    pub fn repr(&self) -> &str {
        &self.0.repr
    }

    /// Lowest leaf rank in the clade, used to order siblings canonically.
    #[must_use]
    pub fn min_rank(&self) -> u32 {
        self.0.min_rank
    }

    #[must_use]
    pub fn children(&self) -> &[Clade] {
        &self.0.children
    }

    /// Newick rendering with leaf names, terminated by `;`.
    #[must_use]
    pub fn newick(&self, ctx: &Context) -> String {
        let mut out = String::new();
        self.write_newick(&mut out, &|leaf| ctx.name_of(leaf).to_owned());
        out.push(';');
        out
    }

    /// Newick rendering with 1-based leaf ranks instead of names.
    #[must_use]
    pub fn newick_ranks(&self) -> String {
        let mut out = String::new();
        self.write_newick(&mut out, &|leaf| leaf.rank().to_string());
        out
    }

    fn write_newick(&self, out: &mut String, leaf_label: &dyn Fn(LeafId) -> String) {
        if let Some(leaf) = self.0.leaf {
            out.push_str(&leaf_label(leaf));
            return;
        }

        let mut ordered: Vec<&Clade> = self.0.children.iter().collect();
        ordered.sort_by_key(|c| (c.is_leaf(), c.min_rank()));

        out.push('(');
        for (i, child) in ordered.into_iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            child.write_newick(out, leaf_label);
        }
        out.push(')');
    }
}

/// Canonical representation of a forest of free-standing clades:
/// clade strings ordered by minimum leaf rank, wrapped in `[...]`.
///
/// The wrapping keeps two free-standing clades distinct from one clade with
/// the same two subtrees.
#[must_use]
pub fn forest_repr<'a>(clades: impl IntoIterator<Item = &'a Clade>) -> String {
    let mut parts: Vec<(u32, &str)> = clades
        .into_iter()
        .map(|c| (c.min_rank(), c.repr()))
        .collect();
    parts.sort_by_key(|&(min_rank, _)| min_rank);

    let mut out = String::from("[");
    for (i, (_, repr)) in parts.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(repr);
    }
    out.push(']');
    out
}

/// Owns unique clade nodes, keyed by canonical representation.
///
/// Each worker threads its own arena through its assemblies; nothing is
/// shared across workers, so no locking is involved.
#[derive(Default)]
pub struct Arena {
    interned: HashMap<Box<str>, Clade>,
}

impl Arena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.interned.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.interned.is_empty()
    }

    /// Returns the unique leaf clade for `leaf`.
    pub fn leaf(&mut self, leaf: LeafId) -> Clade {
        let repr = leaf.rank().to_string();

        if let Some(existing) = self.interned.get(repr.as_str()) {
            return existing.clone();
        }

        let clade = Clade(Arc::new(Node {
            children: vec![],
            leaf: Some(leaf),
            leaves: vec![leaf],
            depths: std::iter::once((leaf, 0)).collect(),
            repr: repr.clone().into(),
            min_rank: leaf.rank(),
        }));
        self.interned.insert(repr.into(), clade.clone());
        clade
    }

    /// Returns the unique two-leaf clade `{a, b}`.
    pub fn pair(&mut self, a: LeafId, b: LeafId) -> Clade {
        let a = self.leaf(a);
        let b = self.leaf(b);
        self.join(vec![a, b])
    }

    /// Returns the unique clade whose children are `children`, creating it
    /// if this shape has not been interned yet.
    pub fn join(&mut self, children: Vec<Clade>) -> Clade {
        debug_assert!(children.len() >= 2, "internal nodes have >= 2 children");

        let repr = Self::composite_repr(&children);

        if let Some(existing) = self.interned.get(repr.as_str()) {
            return existing.clone();
        }

        let mut leaves: Vec<LeafId> = children.iter().flat_map(|c| c.leaves()).copied().collect();
        leaves.sort_unstable();

        let depths: HashMap<LeafId, u32> = children
            .iter()
            .flat_map(Clade::leaf_depths)
            .map(|(leaf, depth)| (leaf, depth + 1))
            .collect();

        let min_rank = leaves.first().map_or(0, |l| l.rank());

        let clade = Clade(Arc::new(Node {
            children,
            leaf: None,
            leaves,
            depths,
            repr: repr.clone().into(),
            min_rank,
        }));
        self.interned.insert(repr.into(), clade.clone());
        clade
    }

    fn composite_repr(children: &[Clade]) -> String {
        let mut nonleaves: Vec<&Clade> = children.iter().filter(|c| !c.is_leaf()).collect();
        nonleaves.sort_by_key(|c| c.min_rank());

        let mut leaf_ranks: Vec<u32> = children
            .iter()
            .filter_map(|c| c.0.leaf.map(LeafId::rank))
            .collect();
        leaf_ranks.sort_unstable();

        let mut out = String::from("(");
        for (i, child) in nonleaves.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(child.repr());
        }
        if !nonleaves.is_empty() && !leaf_ranks.is_empty() {
            out.push(',');
        }
        for (i, rank) in leaf_ranks.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&rank.to_string());
        }
        out.push(')');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn l(rank: u32) -> LeafId {
        LeafId::from_rank(rank)
    }

    #[test]
    fn interning_dedupes() {
        let mut arena = Arena::new();

        let ab = arena.pair(l(1), l(2));
        let ba = arena.pair(l(2), l(1));
        assert!(Arc::ptr_eq(&ab.0, &ba.0));

        // leaves 1, 2 plus the pair
        assert_eq!(3, arena.len());
    }

    #[test]
    fn canonical_repr_order_independent() {
        let mut arena = Arena::new();

        let ab = arena.pair(l(1), l(2));
        let cd = arena.pair(l(3), l(4));

        let left = arena.join(vec![ab.clone(), cd.clone()]);
        let right = arena.join(vec![cd, ab]);

        assert_eq!(left.repr(), right.repr());
        assert_eq!("((1,2),(3,4))", left.repr());
    }

    #[test]
    fn repr_mixes_subclades_and_leaves() {
        let mut arena = Arena::new();

        let bc = arena.pair(l(2), l(3));
        let leaf = arena.leaf(l(1));
        let clade = arena.join(vec![leaf, bc]);

        // non-leaf children first, then leaf ranks
        assert_eq!("((2,3),1)", clade.repr());
        assert_eq!(1, clade.min_rank());
    }

    #[test]
    fn depths_accumulate() {
        let mut arena = Arena::new();

        let ab = arena.pair(l(1), l(2));
        assert_eq!(Some(1), ab.depth_of(l(1)));

        let leaf = arena.leaf(l(3));
        let abc = arena.join(vec![ab, leaf]);
        assert_eq!(Some(2), abc.depth_of(l(1)));
        assert_eq!(Some(2), abc.depth_of(l(2)));
        assert_eq!(Some(1), abc.depth_of(l(3)));
        assert_eq!(None, abc.depth_of(l(4)));
    }

    #[test]
    fn forest_repr_sorted_by_min_rank() {
        let mut arena = Arena::new();

        let cd = arena.pair(l(3), l(4));
        let ab = arena.pair(l(1), l(2));

        assert_eq!("[(1,2),(3,4)]", forest_repr([&cd, &ab]));
        assert_eq!("[(1,2),(3,4)]", forest_repr([&ab, &cd]));
    }

    #[test]
    fn newick_leaf_order_is_canonical() -> crate::Result<()> {
        use crate::histogram::PairHistogram;

        let ctx = Context::from_histograms(
            &[
                PairHistogram::new("a", "b", vec![(1, 1.0)]),
                PairHistogram::new("b", "c", vec![(2, 1.0)]),
            ],
            1.0,
            0.01,
        )?;

        let mut arena = Arena::new();
        let bc = arena.pair(l(2), l(3));
        let leaf = arena.leaf(l(1));
        let tree = arena.join(vec![bc, leaf]);

        assert_eq!("((b,c),a);", tree.newick(&ctx));
        assert_eq!("((2,3),1)", tree.newick_ranks());

        Ok(())
    }
}
