//! Evaluation order of named sub-queries.
//!
//! Conditions that read several sub-queries link them. The links must form a forest: a query
//! where two sub-queries are connected through more than one chain of conditions is rejected.
//! Every sub-query is evaluated after the ones it depends on, so the root sub-query `""` comes
//! last and a condition is applied when the last of its sub-queries is evaluated.

use std::collections::{BTreeMap, BTreeSet};

use crate::core::error::{Error, Result};
use crate::query::conditions::ConditionsSet;

struct DisjointSets {
    parent: Vec<usize>,
}

impl DisjointSets {
    fn new(len: usize) -> Self {
        DisjointSets {
            parent: (0..len).collect(),
        }
    }

    fn find(&mut self, mut item: usize) -> usize {
        while self.parent[item] != item {
            self.parent[item] = self.parent[self.parent[item]];
            item = self.parent[item];
        }
        item
    }

    /// False when both were already in the same set.
    fn union(&mut self, a: usize, b: usize) -> bool {
        let (a, b) = (self.find(a), self.find(b));
        if a == b {
            return false;
        }
        self.parent[b] = a;
        true
    }
}

/// Returns the sub-queries of `conditions` in evaluation order, ending with `""`.
pub fn evaluation_order(conditions: &ConditionsSet) -> Result<Vec<String>> {
    let mut names: BTreeSet<&str> = BTreeSet::new();
    names.insert("");
    let mut links: BTreeSet<Vec<&str>> = BTreeSet::new();
    let mut local_filters: BTreeMap<&str, usize> = BTreeMap::new();
    for condition in conditions.iter().flat_map(|clause| clause.iter()) {
        let mut sub_queries = condition.sub_queries();
        names.extend(sub_queries.iter().copied());
        match sub_queries.len() {
            0 => {}
            1 => *local_filters.entry(sub_queries[0]).or_default() += 1,
            _ => {
                sub_queries.sort_unstable();
                links.insert(sub_queries);
            }
        }
    }

    let names: Vec<&str> = names.into_iter().collect();
    let position = |name: &str| names.binary_search(&name).unwrap_or_default();
    let mut sets = DisjointSets::new(names.len());
    let mut neighbours: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); names.len()];
    for link in &links {
        let first = position(link[0]);
        for name in &link[1..] {
            let other = position(name);
            if !sets.union(first, other) {
                return Err(Error::unsupported(format!(
                    "cyclic sub-query dependency between {}",
                    link.iter()
                        .map(|name| if name.is_empty() { "the root" } else { name })
                        .collect::<Vec<_>>()
                        .join(", ")
                )));
            }
        }
        for &a in link {
            for &b in link {
                if a != b {
                    neighbours[position(a)].insert(position(b));
                }
            }
        }
    }

    // Sub-queries with many filters of their own narrow their results cheaply, so they go first
    // among siblings.
    let priority = |index: &usize| {
        let name = names[*index];
        (std::cmp::Reverse(local_filters.get(name).copied().unwrap_or(0)), name)
    };

    let mut order = Vec::with_capacity(names.len());
    let mut visited = vec![false; names.len()];
    let root = position("");
    // Components not linked to the root first, then the root's component.
    let starts: Vec<usize> = (0..names.len())
        .filter(|&i| sets.find(i) != sets.find(root))
        .chain(std::iter::once(root))
        .collect();
    for start in starts {
        if visited[start] {
            continue;
        }
        // Iterative post-order walk.
        let mut stack = vec![(start, false)];
        while let Some((node, expanded)) = stack.pop() {
            if expanded {
                order.push(names[node].to_string());
                continue;
            }
            if visited[node] {
                continue;
            }
            visited[node] = true;
            stack.push((node, true));
            let mut children: Vec<usize> = neighbours[node]
                .iter()
                .copied()
                .filter(|&n| !visited[n])
                .collect();
            children.sort_by_key(priority);
            for child in children.into_iter().rev() {
                stack.push((child, false));
            }
        }
    }
    Ok(order)
}
