//! Per-candidate search state.

use std::collections::BTreeMap;

use crate::bitmask::{Bitmask, ConnectedBitmask};

/// The combinations of other sub-queries' results a candidate stream is still consistent with.
///
/// Stored as a union of boxes: each box allows, per sub-query, a set of result positions, and
/// every combination picking one allowed position per sub-query is consistent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubQuerySelection {
    boxes: Vec<BTreeMap<String, ConnectedBitmask>>,
}

impl SubQuerySelection {
    pub fn new(allowed: BTreeMap<String, ConnectedBitmask>) -> Self {
        SubQuerySelection { boxes: vec![allowed] }
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    pub fn boxes(&self) -> &[BTreeMap<String, ConnectedBitmask>] {
        &self.boxes
    }

    /// Positions of `sub_query` that are part of at least one consistent combination.
    pub fn allowed(&self, sub_query: &str) -> ConnectedBitmask {
        let mut result = ConnectedBitmask::new();
        for allowed in &self.boxes {
            if let Some(positions) = allowed.get(sub_query) {
                result.or(positions);
            }
        }
        result
    }

    /// True when some consistent combination uses every given `(sub-query, position)`.
    pub fn allows(&self, positions: &[(&str, usize)]) -> bool {
        self.boxes.iter().any(|allowed| {
            positions.iter().all(|(sub_query, position)| {
                allowed
                    .get(*sub_query)
                    .is_some_and(|p| p.is_set(*position))
            })
        })
    }

    /// Removes every combination whose position for `sub_queries[i]` is in `forbidden[i]` for
    /// all `i` at once.
    pub fn remove(&mut self, sub_queries: &[&str], forbidden: &[&ConnectedBitmask]) {
        let old = std::mem::take(&mut self.boxes);
        'boxes: for mut allowed in old {
            for (sub_query, forbidden) in sub_queries.iter().zip(forbidden) {
                let current = allowed.get(*sub_query).cloned().unwrap_or_default();
                let remove = current.and_copy(forbidden);
                if remove.is_zero() {
                    self.boxes.push(allowed);
                    continue 'boxes;
                }
                let keep = current.sub_copy(forbidden);
                if !keep.is_zero() {
                    let mut kept = allowed.clone();
                    kept.insert(sub_query.to_string(), keep);
                    self.boxes.push(kept);
                }
                allowed.insert(sub_query.to_string(), remove);
            }
            // Every listed sub-query is restricted to forbidden positions: nothing is left.
        }
    }
}

/// State of one candidate stream while the filters of one query part run.
#[derive(Debug, Clone, Default)]
pub struct SearchContext {
    pub selection: SubQuerySelection,
    /// Named captures of the data conditions that matched, without duplicates.
    pub output_variables: BTreeMap<String, Vec<Vec<u8>>>,
}

impl SearchContext {
    pub fn new(selection: SubQuerySelection) -> Self {
        SearchContext {
            selection,
            output_variables: BTreeMap::new(),
        }
    }

    pub fn add_output_variable(&mut self, name: &str, value: &[u8]) {
        let values = self.output_variables.entry(name.to_string()).or_default();
        if !values.iter().any(|v| v == value) {
            values.push(value.to_vec());
        }
    }
}
