//! Result ordering, grouping and the bounded result buffer of one sub-query.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::net::IpAddr;

use crate::bitmask::{Bitmask, ConnectedBitmask, ShortBitmask};
use crate::query::sorting::{Grouping, GroupingKey, SortDirection, Sorting, SortingKey};
use crate::search::context::SearchContext;
use crate::storage::Stream;

/// A named capture of a result stream and the query parts it was captured in.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CapturedVariable {
    pub name: String,
    pub value: Vec<u8>,
    pub parts: ShortBitmask,
}

#[derive(Debug, Clone)]
pub(crate) struct ResultEntry<'r> {
    pub stream: Stream<'r>,
    /// Sorted by name, then value.
    pub variables: Vec<CapturedVariable>,
}

impl<'r> ResultEntry<'r> {
    /// Builds the entry of a stream that matched the query parts `parts`, with one context per
    /// matching part in ascending part order.
    pub fn new(stream: Stream<'r>, parts: &ShortBitmask, contexts: &[SearchContext]) -> Self {
        let mut variables: Vec<CapturedVariable> = Vec::new();
        for (part, context) in parts.ones().into_iter().zip(contexts) {
            for (name, values) in &context.output_variables {
                for value in values {
                    match variables
                        .iter_mut()
                        .find(|v| &v.name == name && &v.value == value)
                    {
                        Some(existing) => existing.parts.set(part),
                        None => {
                            let mut parts = ShortBitmask::new();
                            parts.set(part);
                            variables.push(CapturedVariable {
                                name: name.clone(),
                                value: value.clone(),
                                parts,
                            });
                        }
                    }
                }
            }
        }
        variables.sort_by(|a, b| (&a.name, &a.value).cmp(&(&b.name, &b.value)));
        ResultEntry { stream, variables }
    }
}

fn compare_key(key: SortingKey, a: &Stream<'_>, b: &Stream<'_>) -> Ordering {
    match key {
        SortingKey::Id => a.id().cmp(&b.id()),
        SortingKey::ClientBytes => a.client_bytes().cmp(&b.client_bytes()),
        SortingKey::ServerBytes => a.server_bytes().cmp(&b.server_bytes()),
        SortingKey::FirstPacketTime => a.first_packet_nanos().cmp(&b.first_packet_nanos()),
        SortingKey::LastPacketTime => a.last_packet_nanos().cmp(&b.last_packet_nanos()),
        SortingKey::ClientHost => a.client_host().cmp(&b.client_host()),
        SortingKey::ServerHost => a.server_host().cmp(&b.server_host()),
        SortingKey::ClientPort => a.client_port().cmp(&b.client_port()),
        SortingKey::ServerPort => a.server_port().cmp(&b.server_port()),
    }
}

fn directed(sorting: &Sorting, a: &Stream<'_>, b: &Stream<'_>) -> Ordering {
    let ordering = compare_key(sorting.key, a, b);
    match sorting.direction {
        SortDirection::Ascending => ordering,
        SortDirection::Descending => ordering.reverse(),
    }
}

/// Orders streams by `sorting`, the first key deciding first. `Less` ranks first.
pub(crate) fn compare_streams(sorting: &[Sorting], a: &Stream<'_>, b: &Stream<'_>) -> Ordering {
    sorting
        .iter()
        .map(|s| directed(s, a, b))
        .find(|o| o.is_ne())
        .unwrap_or(Ordering::Equal)
}

/// Ordering by the first sorting key only.
pub(crate) fn compare_primary(sorting: &[Sorting], a: &Stream<'_>, b: &Stream<'_>) -> Ordering {
    sorting
        .first()
        .map_or(Ordering::Equal, |s| directed(s, a, b))
}

fn push_host(key: &mut Vec<u8>, host: IpAddr) {
    match host {
        IpAddr::V4(v4) => {
            key.push(4);
            key.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            key.push(16);
            key.extend_from_slice(&v6.octets());
        }
    }
}

/// Computes group keys for a `group:` template.
#[derive(Debug, Clone)]
pub(crate) struct GroupKeys {
    builtins: Vec<GroupingKey>,
    variables: Vec<String>,
}

impl GroupKeys {
    pub fn new(grouping: &Grouping) -> Self {
        GroupKeys {
            builtins: grouping.builtin_keys(),
            variables: grouping
                .output_variables()
                .into_iter()
                .map(str::to_string)
                .collect(),
        }
    }

    /// Whether the key depends on captured variables and so is only known after matching.
    pub fn uses_variables(&self) -> bool {
        !self.variables.is_empty()
    }

    /// The part of the key built from stream fields.
    pub fn stream_key(&self, stream: &Stream<'_>) -> Vec<u8> {
        let mut key = Vec::new();
        for builtin in &self.builtins {
            match builtin {
                GroupingKey::Id => key.extend_from_slice(&stream.id().0.to_le_bytes()),
                GroupingKey::ClientPort => key.extend_from_slice(&stream.client_port().to_le_bytes()),
                GroupingKey::ServerPort => key.extend_from_slice(&stream.server_port().to_le_bytes()),
                GroupingKey::Bytes => key.extend_from_slice(
                    &(stream.client_bytes().saturating_add(stream.server_bytes())).to_le_bytes(),
                ),
                GroupingKey::ClientBytes => key.extend_from_slice(&stream.client_bytes().to_le_bytes()),
                GroupingKey::ServerBytes => key.extend_from_slice(&stream.server_bytes().to_le_bytes()),
                GroupingKey::FirstPacketTime => {
                    key.extend_from_slice(&stream.first_packet_nanos().to_le_bytes())
                }
                GroupingKey::LastPacketTime => {
                    key.extend_from_slice(&stream.last_packet_nanos().to_le_bytes())
                }
                GroupingKey::Duration => key.extend_from_slice(
                    &(stream.last_packet_nanos() - stream.first_packet_nanos()).to_le_bytes(),
                ),
                GroupingKey::ClientHost => push_host(&mut key, stream.client_host()),
                GroupingKey::ServerHost => push_host(&mut key, stream.server_host()),
            }
        }
        key
    }

    /// The complete key: the stream fields followed by the sorted, deduplicated values of each
    /// grouping variable captured by the matching query parts.
    pub fn full_key(&self, stream: &Stream<'_>, contexts: &[SearchContext]) -> Vec<u8> {
        let mut key = self.stream_key(stream);
        for name in &self.variables {
            let mut values: Vec<&[u8]> = contexts
                .iter()
                .filter_map(|c| c.output_variables.get(name))
                .flatten()
                .map(Vec::as_slice)
                .collect();
            values.sort_unstable();
            values.dedup();
            key.extend_from_slice(&(values.len() as u64).to_le_bytes());
            for value in values {
                key.extend_from_slice(&(value.len() as u64).to_le_bytes());
                key.extend_from_slice(value);
            }
        }
        key
    }
}

/// How a sub-query collects its results.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ResultPolicy<'s> {
    pub sorting: Option<&'s [Sorting]>,
    /// Zero means unbounded.
    pub limit: usize,
    pub grouping: Option<&'s GroupKeys>,
}

/// What to do with a candidate before its filters run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Admission {
    Evaluate,
    /// The candidate can not make it into the results.
    Skip,
    /// Neither this candidate nor any later one in the primary sort order can.
    Stop,
}

/// Matching streams of one sub-query.
#[derive(Debug, Clone)]
pub(crate) struct ResultSet<'r> {
    pub entries: Vec<ResultEntry<'r>>,
    /// Per query part, the entry positions that matched it.
    pub matching_parts: Vec<ConnectedBitmask>,
    groups: HashMap<Vec<u8>, usize>,
    /// Matches that did not fit into the limit.
    pub dropped: usize,
}

impl<'r> ResultSet<'r> {
    pub fn new(part_count: usize) -> Self {
        ResultSet {
            entries: Vec::new(),
            matching_parts: vec![ConnectedBitmask::new(); part_count],
            groups: HashMap::new(),
            dropped: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn ranks_before(policy: &ResultPolicy<'_>, stream: &Stream<'_>, other: &Stream<'_>) -> bool {
        policy
            .sorting
            .is_some_and(|sorting| compare_streams(sorting, stream, other).is_lt())
    }

    /// Decides from the stream's fields alone whether evaluating it can change the results.
    pub fn admit(&self, policy: &ResultPolicy<'_>, stream: &Stream<'_>) -> Admission {
        // Once something was dropped, has_more is settled and only better streams matter.
        let full = self.dropped != 0 && policy.limit != 0 && self.entries.len() >= policy.limit;
        if full {
            let Some(last) = self.entries.last() else {
                return Admission::Skip;
            };
            let Some(sorting) = policy.sorting else {
                return Admission::Stop;
            };
            if !Self::ranks_before(policy, stream, &last.stream) {
                if compare_primary(sorting, stream, &last.stream).is_gt() {
                    return Admission::Stop;
                }
                return Admission::Skip;
            }
        }
        if let Some(grouping) = policy.grouping {
            if !grouping.uses_variables() {
                if let Some(&position) = self.groups.get(&grouping.stream_key(stream)) {
                    if !Self::ranks_before(policy, stream, &self.entries[position].stream) {
                        return Admission::Skip;
                    }
                }
            }
        }
        Admission::Evaluate
    }

    /// Adds a stream that matched the query parts `parts`, with one context per matching part.
    pub fn insert(&mut self, policy: &ResultPolicy<'_>, stream: Stream<'r>, parts: &ShortBitmask, contexts: &[SearchContext]) {
        let key = policy.grouping.map(|g| g.full_key(&stream, contexts));
        let group_position = key.as_ref().and_then(|k| self.groups.get(k).copied());
        match group_position {
            Some(position) => {
                if !Self::ranks_before(policy, &stream, &self.entries[position].stream) {
                    return;
                }
                self.remove_at(position);
            }
            None => {
                if policy.limit != 0 && self.entries.len() >= policy.limit {
                    self.dropped += 1;
                    let better = self
                        .entries
                        .last()
                        .is_some_and(|last| Self::ranks_before(policy, &stream, &last.stream));
                    if !better {
                        return;
                    }
                    self.remove_at(self.entries.len() - 1);
                }
            }
        }

        let position = match policy.sorting {
            Some(sorting) => self
                .entries
                .partition_point(|e| compare_streams(sorting, &e.stream, &stream).is_le()),
            None => self.entries.len(),
        };
        self.entries.insert(position, ResultEntry::new(stream, parts, contexts));
        for (part, matching) in self.matching_parts.iter_mut().enumerate() {
            matching.inject(position, parts.is_set(part));
        }
        for p in self.groups.values_mut() {
            if *p >= position {
                *p += 1;
            }
        }
        if let Some(key) = key {
            self.groups.insert(key, position);
        }
    }

    fn remove_at(&mut self, position: usize) {
        self.entries.remove(position);
        for matching in &mut self.matching_parts {
            matching.extract(position);
        }
        self.groups.retain(|_, p| *p != position);
        for p in self.groups.values_mut() {
            if *p > position {
                *p -= 1;
            }
        }
    }
}
