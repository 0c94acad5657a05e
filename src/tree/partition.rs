//! Per-action induced subtrees.
//!
//! A node belongs to action `a`'s partition iff it is the root, the predicate permits it for
//! `a`, or one of its descendants belongs to the partition. The predicate is consulted once
//! per (node, action) pair and the whole computation is a single reverse scan over the arena,
//! O(|nodes| x |actions|).

use std::collections::BTreeMap;

use super::{ResourceNode, ResourceTree};
use crate::policy::Action;

/// Node-level permission check; usually backed by `PolicyStore::enforce`.
pub type NodePredicate<'a> = dyn Fn(&ResourceNode, Action) -> bool + 'a;

pub fn partition<F>(tree: &ResourceTree, predicate: F, actions: &[Action]) -> BTreeMap<Action, ResourceTree>
where
    F: Fn(&ResourceNode, Action) -> bool,
{
    let mut wanted: Vec<Action> = actions.to_vec();
    wanted.sort();
    wanted.dedup();
    if wanted.is_empty() { return BTreeMap::new(); }

    let n = tree.nodes.len();
    // keep[a][i]: node i is part of action a's partition
    let mut keep: Vec<Vec<bool>> = vec![vec![false; n]; wanted.len()];
    // Children always sit at higher indexes than their parent, so walking backwards settles
    // every descendant before its ancestors.
    for i in (1..n).rev() {
        let node = &tree.nodes[i];
        for (a, action) in wanted.iter().enumerate() {
            let allowed = predicate(node, *action);
            if allowed || keep[a][i] {
                keep[a][i] = true;
                if let Some(p) = node.parent { keep[a][p] = true; }
            }
        }
    }
    crate::tprintln!("partition nodes={} actions={:?}", n, wanted);

    wanted
        .iter()
        .zip(keep.iter_mut())
        .map(|(action, flags)| {
            flags[0] = true;
            (*action, tree.project(flags))
        })
        .collect()
}
