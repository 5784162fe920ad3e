//! Regex matching over stream data.
//!
//! The data conditions of a query part are evaluated together by one filter. Each condition is a
//! sequence of regexes matched in order, every element starting where the previous one left its
//! direction. Regexes may embed the captured variables of other sub-queries: the results of such
//! a sub-query are grouped by their variable values, and a sequence is first tried with all
//! groups at once before it is split into one variant per group.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::Rc;
use std::sync::Arc;

use ::regex::bytes::Regex;
use tracing::trace;

use crate::analysis::regex::{self as analysis, RegexInfo};
use crate::bitmask::{Bitmask, ConnectedBitmask};
use crate::core::config::Config;
use crate::core::error::{Error, Result};
use crate::query::conditions::{DataCondition, DataElement};
use crate::search::context::SearchContext;
use crate::search::converters::ConverterAccess;
use crate::search::filters::{Filter, PartEnv, Prepared};
use crate::storage::{Stream, StreamData};

/// A compiled data regex with what is known about its matches.
#[derive(Debug)]
pub(crate) struct CompiledRegex {
    regex: Regex,
    info: RegexInfo,
    names: Vec<Option<String>>,
}

impl CompiledRegex {
    fn new(pattern: &str) -> Result<Self> {
        let (regex, names) = analysis::compile_with_names(pattern)?;
        let info = analysis::analyze(pattern)?;
        Ok(CompiledRegex { regex, info, names })
    }
}

/// Compiled regexes of one search, keyed by pattern.
///
/// Holds at most `max_regex_variants` entries; patterns beyond that are compiled on every use.
pub(crate) struct RegexCache {
    limit: usize,
    compiled: RefCell<HashMap<String, Rc<CompiledRegex>>>,
}

impl RegexCache {
    pub fn new(config: &Config) -> Self {
        RegexCache {
            limit: config.max_regex_variants,
            compiled: RefCell::new(HashMap::new()),
        }
    }

    pub fn get(&self, pattern: &str) -> Result<Rc<CompiledRegex>> {
        if let Some(compiled) = self.compiled.borrow().get(pattern) {
            return Ok(Rc::clone(compiled));
        }
        let compiled = Rc::new(CompiledRegex::new(pattern)?);
        let mut cache = self.compiled.borrow_mut();
        if cache.len() < self.limit {
            cache.insert(pattern.to_string(), Rc::clone(&compiled));
        }
        Ok(compiled)
    }
}

struct Found {
    /// Absolute end of the match.
    end: usize,
    captures: Vec<(String, Vec<u8>)>,
}

fn position(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn rposition(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).rposition(|w| w == needle)
}

/// Searches `data` from `*offset` on. Moves `*offset` past bytes that can not start a match, to
/// the end of `data` when there is none.
fn find(compiled: &CompiledRegex, data: &[u8], offset: &mut usize) -> Option<Found> {
    let info = &compiled.info;
    let min = info.accepted_length.min;
    let mut start = (*offset).min(data.len());
    let mut end = data.len();
    if min == usize::MAX {
        *offset = data.len();
        return None;
    }
    if end - start < min {
        return None;
    }
    if !info.context_sensitive {
        if !info.prefix.is_empty() {
            let Some(pos) = position(&data[start..end], &info.prefix) else {
                *offset = data.len();
                return None;
            };
            start += pos;
            *offset = start;
            if end - start < min {
                return None;
            }
        }
        if !info.suffix.is_empty() {
            let Some(pos) = rposition(&data[start..end], &info.suffix) else {
                *offset = data.len();
                return None;
            };
            end = start + pos + info.suffix.len();
            if end - start < min {
                return None;
            }
        }
        if info.accepted_length.is_fixed() && info.prefix.is_empty() && !info.suffix.is_empty() {
            // Only windows of exactly `min` bytes ending in the suffix can match.
            let before_suffix = min - info.suffix.len();
            loop {
                if end - start < min {
                    *offset = data.len();
                    return None;
                }
                let Some(pos) = position(&data[start + before_suffix..end], &info.suffix) else {
                    *offset = data.len();
                    return None;
                };
                start += pos;
                *offset = start;
                if end - start < min {
                    *offset = data.len();
                    return None;
                }
                if let Some(found) = captures(compiled, data, start, start + min) {
                    return Some(found);
                }
                start += 1;
            }
        }
    }
    let found = captures(compiled, data, start, end);
    if found.is_none() {
        *offset = data.len();
    }
    found
}

fn captures(compiled: &CompiledRegex, data: &[u8], start: usize, end: usize) -> Option<Found> {
    let caps = compiled.regex.captures(&data[start..end])?;
    let mut found = Found {
        end: caps.get(0).map_or(start, |m| start + m.end()),
        captures: Vec::new(),
    };
    for (i, name) in compiled.names.iter().enumerate().skip(1) {
        if let (Some(name), Some(m)) = (name, caps.get(i)) {
            // Groups sharing a name: the first one that took part wins.
            if found.captures.iter().any(|(n, _)| n == name) {
                continue;
            }
            found
                .captures
                .push((name.clone(), data[start + m.start()..start + m.end()].to_vec()));
        }
    }
    Some(found)
}

/// Results of another sub-query that share the same variable values.
#[derive(Debug)]
struct ValueGroup {
    /// Per variable name, the quoted values as an alternation.
    quoted: Vec<String>,
    results: ConnectedBitmask,
}

#[derive(Debug)]
struct SubQueryValues {
    names: Vec<String>,
    groups: Vec<ValueGroup>,
}

impl SubQueryValues {
    fn alternation(&self, name: &str, group: Option<usize>) -> Result<String> {
        let index = self
            .names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| Error::internal(format!("variable {:?} was not collected", name)))?;
        Ok(match group {
            Some(group) => self.groups[group].quoted[index].clone(),
            None => self
                .groups
                .iter()
                .map(|g| g.quoted[index].as_str())
                .collect::<Vec<_>>()
                .join("|"),
        })
    }
}

enum Source<'a> {
    Raw,
    Converter(&'a Arc<dyn ConverterAccess + Send + Sync>),
}

impl Source<'_> {
    /// `None` when the source holds no data for the stream.
    fn data(&self, stream: &Stream<'_>) -> Result<Option<StreamData>> {
        match self {
            Source::Raw => Ok(Some(stream.raw_data()?)),
            Source::Converter(converter) => {
                let converted = converter.data_for_search(stream.id())?;
                Ok(converted.was_cached.then_some(converted.data))
            }
        }
    }
}

/// Progress of one condition's sequence for one assignment of value groups.
#[derive(Debug, Clone, Default)]
struct Variant {
    offsets: [usize; 2],
    n_successful: usize,
    captures: BTreeMap<String, Vec<u8>>,
    /// Sub-query to value group.
    assignment: BTreeMap<String, usize>,
    exhausted: bool,
}

/// Final state of a variant.
struct Leaf {
    assignment: BTreeMap<String, usize>,
    success: bool,
}

enum Evaluation {
    Leaves(Vec<Leaf>),
    /// The stream fails regardless of other sub-queries.
    Reject,
}

fn is_local(sub_query: &str, current: &str) -> bool {
    sub_query.is_empty() || sub_query == current
}

/// Prepares the data conditions of a query part.
pub(crate) fn data_filter<'a>(env: &PartEnv<'a>, conditions: &[&'a DataCondition]) -> Result<Prepared<'a>> {
    let mut selected: Vec<&'a DataCondition> = Vec::new();
    let mut converter: Option<&Option<String>> = None;
    'conditions: for &condition in conditions {
        let Some(first) = condition.elements.first() else {
            continue;
        };
        let (mut evaluate, mut foreign) = (false, false);
        for element in &condition.elements {
            if element.sub_query != env.sub_query {
                if !env.previous.contains_key(&element.sub_query) {
                    continue 'conditions;
                }
                foreign = true;
                continue;
            }
            evaluate = true;
            for variable in &element.variables {
                if !is_local(&variable.sub_query, env.sub_query) && !env.previous.contains_key(&variable.sub_query) {
                    return Err(Error::unsupported(format!(
                        "data condition reads variables of sub-query {:?} before it is evaluated",
                        variable.sub_query
                    )));
                }
            }
        }
        if !evaluate {
            continue;
        }
        if foreign {
            return Err(Error::unsupported("data conditions spanning several sub-queries are not supported"));
        }
        let expected = converter.get_or_insert(&first.converter);
        if condition.elements.iter().any(|e| &e.converter != *expected) {
            return Err(Error::unsupported("all data conditions of a query part must use the same converter"));
        }
        selected.push(condition);
    }
    let Some(converter) = converter else {
        return Ok(Prepared::Skip);
    };

    let mut sources = Vec::new();
    if matches!(converter.as_deref(), None | Some("none")) {
        sources.push(Source::Raw);
    }
    match converter.as_deref() {
        Some("none") => {}
        None => sources.extend(env.converters.values().map(Source::Converter)),
        Some(name) => {
            let access = env
                .converters
                .get(name)
                .ok_or_else(|| Error::not_found(format!("converter {:?} does not exist", name)))?;
            sources.push(Source::Converter(access));
        }
    }

    // Variable names each other sub-query has to provide.
    let mut referenced: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for condition in &selected {
        for element in &condition.elements {
            for variable in &element.variables {
                if !is_local(&variable.sub_query, env.sub_query) {
                    referenced.entry(&variable.sub_query).or_default().insert(&variable.name);
                }
            }
        }
    }
    let mut values = BTreeMap::new();
    let mut impossible = Vec::new();
    for (sub_query, names) in referenced {
        let results = env.results(sub_query)?;
        let mut groups: Vec<ValueGroup> = Vec::new();
        let mut by_values: HashMap<Vec<String>, usize> = HashMap::new();
        let mut lacking = ConnectedBitmask::new();
        'entries: for (position, entry) in results.entries.iter().enumerate() {
            let mut quoted = Vec::with_capacity(names.len());
            for name in &names {
                let alternatives: Vec<String> = entry
                    .variables
                    .iter()
                    .filter(|v| v.name == *name)
                    .map(|v| analysis::quote_bytes(&v.value))
                    .collect();
                if alternatives.is_empty() {
                    lacking.set(position);
                    continue 'entries;
                }
                quoted.push(alternatives.join("|"));
            }
            let group = *by_values.entry(quoted.clone()).or_insert_with(|| {
                groups.push(ValueGroup {
                    quoted,
                    results: ConnectedBitmask::new(),
                });
                groups.len() - 1
            });
            groups[group].results.set(position);
        }
        if groups.is_empty() {
            return Ok(Prepared::Never);
        }
        if !lacking.is_zero() {
            impossible.push((sub_query.to_string(), lacking));
        }
        values.insert(
            sub_query.to_string(),
            SubQueryValues {
                names: names.into_iter().map(str::to_string).collect(),
                groups,
            },
        );
    }

    Ok(Prepared::Filter(Box::new(DataFilter {
        sub_query: env.sub_query,
        conditions: selected,
        sources,
        values,
        impossible,
        regexes: env.regexes,
    })))
}

struct DataFilter<'a> {
    sub_query: &'a str,
    conditions: Vec<&'a DataCondition>,
    sources: Vec<Source<'a>>,
    values: BTreeMap<String, SubQueryValues>,
    /// Results of other sub-queries that lack a referenced variable.
    impossible: Vec<(String, ConnectedBitmask)>,
    regexes: &'a RegexCache,
}

impl DataFilter<'_> {
    fn pattern(&self, element: &DataElement, variant: &Variant) -> Result<String> {
        let mut pattern = element.regex.clone();
        for variable in element.variables.iter().rev() {
            let content = if is_local(&variable.sub_query, self.sub_query) {
                let value = variant.captures.get(&variable.name).ok_or_else(|| {
                    Error::invalid_input(format!("variable {:?} is used before it is captured", variable.name))
                })?;
                analysis::quote_bytes(value)
            } else {
                let values = self
                    .values
                    .get(&variable.sub_query)
                    .ok_or_else(|| Error::internal(format!("no values for sub-query {:?}", variable.sub_query)))?;
                values.alternation(&variable.name, variant.assignment.get(&variable.sub_query).copied())?
            };
            let head = pattern
                .get(..variable.position)
                .ok_or_else(|| Error::internal(format!("variable position {} outside the regex", variable.position)))?;
            pattern = format!("{}(?:{}){}", head, content, &pattern[variable.position..]);
        }
        Ok(pattern)
    }

    fn evaluate(&self, condition: &DataCondition, data: &StreamData, context: &mut SearchContext) -> Result<Evaluation> {
        let elements = &condition.elements;
        let mut variants = vec![Variant::default()];
        let mut i = 0;
        while i < variants.len() {
            loop {
                let variant = &variants[i];
                if variant.exhausted || variant.n_successful == elements.len() {
                    break;
                }
                let element = &elements[variant.n_successful];
                let unassigned = element
                    .variables
                    .iter()
                    .map(|v| v.sub_query.as_str())
                    .find(|sq| !is_local(sq, self.sub_query) && !variant.assignment.contains_key(*sq));
                let compiled = self.regexes.get(&self.pattern(element, variant)?)?;
                let dir = element.direction.index();

                let variant = &mut variants[i];
                let Some(found) = find(&compiled, &data.data[dir], &mut variant.offsets[dir]) else {
                    variant.exhausted = true;
                    break;
                };
                if let Some(sub_query) = unassigned {
                    // Some group matches: continue with one variant per group.
                    let group_count = self.values.get(sub_query).map_or(0, |v| v.groups.len());
                    let template = variant.clone();
                    variant.assignment.insert(sub_query.to_string(), 0);
                    for group in 1..group_count {
                        let mut child = template.clone();
                        child.assignment.insert(sub_query.to_string(), group);
                        variants.push(child);
                    }
                    continue;
                }

                variant.n_successful += 1;
                if variant.n_successful == elements.len() && condition.inverted {
                    if variant.assignment.is_empty() && self.sources.len() == 1 {
                        return Ok(Evaluation::Reject);
                    }
                    break;
                }
                for (name, value) in found.captures {
                    if variant.captures.insert(name.clone(), value).is_some() {
                        return Err(Error::invalid_input(format!("variable {:?} is captured twice", name)));
                    }
                }
                if found.end > variant.offsets[dir] {
                    variant.offsets[dir] = found.end;
                    // The other direction continues after the data sent before this match ended.
                    let other = 1 - dir;
                    let chunks = &data.chunk_offsets;
                    if let Some(chunk) = (1..chunks.len()).rev().find(|&c| chunks[c - 1][dir] < found.end) {
                        variant.offsets[other] = variant.offsets[other].max(chunks[chunk][other]);
                    }
                }
            }
            i += 1;
        }

        let mut leaves = Vec::with_capacity(variants.len());
        for variant in variants {
            let unsuccessful = elements.len() - variant.n_successful;
            let success = unsuccessful < 2 && (unsuccessful != 0) == condition.inverted;
            if success {
                for (name, value) in &variant.captures {
                    context.add_output_variable(name, value);
                }
            }
            leaves.push(Leaf {
                assignment: variant.assignment,
                success,
            });
        }
        Ok(Evaluation::Leaves(leaves))
    }

    fn forbidden<'s>(&'s self, assignment: &'s BTreeMap<String, usize>) -> (Vec<&'s str>, Vec<&'s ConnectedBitmask>) {
        assignment
            .iter()
            .filter_map(|(sq, &group)| {
                let values = self.values.get(sq)?;
                Some((sq.as_str(), &values.groups.get(group)?.results))
            })
            .unzip()
    }
}

/// Combines the leaves of two sources into the common refinement of their assignments.
fn refine(regions: Vec<Leaf>, leaves: &[Leaf], inverted: bool) -> Vec<Leaf> {
    let mut refined = Vec::new();
    for region in &regions {
        for leaf in leaves {
            let compatible = leaf
                .assignment
                .iter()
                .all(|(sq, group)| region.assignment.get(sq).is_none_or(|g| g == group));
            if !compatible {
                continue;
            }
            let mut assignment = region.assignment.clone();
            assignment.extend(leaf.assignment.iter().map(|(sq, &g)| (sq.clone(), g)));
            let success = if inverted {
                region.success && leaf.success
            } else {
                region.success || leaf.success
            };
            refined.push(Leaf { assignment, success });
        }
    }
    refined
}

impl Filter for DataFilter<'_> {
    fn matches(&mut self, context: &mut SearchContext, stream: &Stream<'_>) -> Result<bool> {
        for (sub_query, lacking) in &self.impossible {
            context.selection.remove(&[sub_query.as_str()], &[lacking]);
        }
        if context.selection.is_empty() {
            return Ok(false);
        }

        let mut per_condition: Vec<Option<Vec<Leaf>>> = (0..self.conditions.len()).map(|_| None).collect();
        let mut evaluated = 0;
        for source in &self.sources {
            let Some(data) = source.data(stream)? else {
                continue;
            };
            evaluated += 1;
            for (c, condition) in self.conditions.iter().enumerate() {
                let leaves = match self.evaluate(condition, &data, context)? {
                    Evaluation::Reject => return Ok(false),
                    Evaluation::Leaves(leaves) => leaves,
                };
                per_condition[c] = Some(match per_condition[c].take() {
                    None => leaves,
                    Some(regions) => refine(regions, &leaves, condition.inverted),
                });
            }
        }
        if evaluated == 0 {
            trace!(stream = stream.id().0, "no data source holds data");
            return Ok(self.conditions.iter().all(|c| c.inverted));
        }

        for regions in per_condition.into_iter().flatten() {
            if !regions.iter().any(|r| r.success) {
                return Ok(false);
            }
            for region in regions.iter().filter(|r| !r.success) {
                let (sub_queries, forbidden) = self.forbidden(&region.assignment);
                if sub_queries.is_empty() {
                    return Ok(false);
                }
                context.selection.remove(&sub_queries, &forbidden);
                if context.selection.is_empty() {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}
