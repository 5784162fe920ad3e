//! Predicates and candidate lookups of a query part.
//!
//! A query part is one AND-clause of the query, prepared for one sub-query and one reader. Every
//! condition of the clause that can be evaluated at this point becomes a [`Filter`]. Conditions
//! that select streams by id or tag also become a [`Lookup`], so the executor can enumerate
//! candidates instead of scanning the whole reader.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;

use tracing::trace;

use crate::bitmask::{Bitmask, ConnectedBitmask, LongBitmask};
use crate::core::error::{Error, Result};
use crate::core::types::StreamId;
use crate::query::conditions::{
    Condition, Conditions, DataCondition, FlagCondition, HostCondition, HostSide, NumberCondition,
    NumberField, TAG_ACCEPT_ALL, TAG_FAILING, TAG_MATCHING, TAG_UNCERTAIN_FAILING,
    TAG_UNCERTAIN_MATCHING, TagCondition, TimeCondition,
};
use crate::search::context::SearchContext;
use crate::search::converters::{ConverterMap, TagDetails, TagSnapshot};
use crate::search::data::{self, RegexCache};
use crate::search::results::ResultSet;
use crate::storage::{IndexReader, Stream};

pub(crate) trait Filter {
    fn matches(&mut self, context: &mut SearchContext, stream: &Stream<'_>) -> Result<bool>;
}

pub(crate) trait Lookup {
    /// Positions of the streams that may pass, in any order.
    fn positions(&mut self) -> Result<Vec<u32>>;
}

pub(crate) struct QueryPart<'a> {
    pub filters: Vec<Box<dyn Filter + 'a>>,
    pub lookups: Vec<Box<dyn Lookup + 'a>>,
}

/// Outcome of preparing one condition.
pub(crate) enum Prepared<'a> {
    /// The condition does not restrict this sub-query here.
    Skip,
    /// No stream of the reader can fulfil it.
    Never,
    Filter(Box<dyn Filter + 'a>),
}

/// Everything a query part is prepared against.
pub(crate) struct PartEnv<'a> {
    pub reader: &'a IndexReader,
    pub sub_query: &'a str,
    pub part_index: usize,
    /// Results of the sub-queries evaluated before this one.
    pub previous: &'a BTreeMap<String, ResultSet<'a>>,
    /// Query reference time, nanoseconds since the epoch.
    pub reference_nanos: i128,
    /// Readers newer than `reader`.
    pub superseding: &'a [&'a IndexReader],
    pub limit_ids: Option<&'a LongBitmask>,
    pub tags: &'a TagSnapshot,
    pub converters: &'a ConverterMap,
    pub regexes: &'a RegexCache,
}

impl<'a> PartEnv<'a> {
    /// A condition is evaluated at the sub-query it reads that is evaluated last.
    pub fn applies(&self, sub_queries: &[&str]) -> bool {
        sub_queries.contains(&self.sub_query)
            && sub_queries
                .iter()
                .all(|sq| *sq == self.sub_query || self.previous.contains_key(*sq))
    }

    pub fn results(&self, sub_query: &str) -> Result<&'a ResultSet<'a>> {
        self.previous
            .get(sub_query)
            .ok_or_else(|| Error::internal(format!("sub-query {:?} has not been evaluated", sub_query)))
    }
}

/// Prepares `clause` for `env`. `None` when the clause can not match any stream of the reader.
pub(crate) fn build_query_part<'a>(env: &PartEnv<'a>, clause: &'a Conditions) -> Result<Option<QueryPart<'a>>> {
    let mut part = QueryPart {
        filters: Vec::new(),
        lookups: Vec::new(),
    };
    if env.sub_query.is_empty() {
        if let Some(ids) = env.limit_ids {
            part.filters.push(Box::new(StreamIdLimit { ids }));
        }
    }
    if !env.superseding.is_empty() {
        part.filters.push(Box::new(Superseded {
            newer: env.superseding,
        }));
    }

    let mut id_range = (0u64, u64::MAX);
    let mut data_conditions: Vec<&'a DataCondition> = Vec::new();
    for condition in clause.iter() {
        let prepared = match condition {
            Condition::Impossible => Prepared::Never,
            Condition::Tag(c) => {
                if c.sub_query != env.sub_query {
                    continue;
                }
                let details = env
                    .tags
                    .get(&c.name)
                    .ok_or_else(|| Error::not_found(format!("tag {:?} does not exist", c.name)))?;
                tag_filter(env, c, details, &mut part)
            }
            Condition::Flag(c) => flag_filter(env, c)?,
            Condition::Host(c) => host_filter(env, c)?,
            Condition::Number(c) => {
                narrow_id_range(env, c, &mut id_range);
                number_filter(env, c)?
            }
            Condition::Time(c) => time_filter(env, c)?,
            Condition::Data(c) => {
                data_conditions.push(c);
                continue;
            }
        };
        match prepared {
            Prepared::Skip => {}
            Prepared::Never => return Ok(None),
            Prepared::Filter(filter) => part.filters.push(filter),
        }
    }

    let (min, max) = id_range;
    if min > max {
        return Ok(None);
    }
    if min == max {
        match env.reader.stream_index(StreamId(min)) {
            Some(index) => part.lookups.push(Box::new(FixedLookup(vec![index]))),
            None => return Ok(None),
        }
    } else if min != 0 || max != u64::MAX {
        part.lookups.push(Box::new(IdRangeLookup {
            reader: env.reader,
            min,
            max,
        }));
    }

    match data::data_filter(env, &data_conditions)? {
        Prepared::Skip => {}
        Prepared::Never => return Ok(None),
        Prepared::Filter(filter) => part.filters.push(filter),
    }
    trace!(
        sub_query = env.sub_query,
        part = env.part_index,
        filters = part.filters.len(),
        lookups = part.lookups.len(),
        "query part prepared"
    );
    Ok(Some(part))
}

struct StreamIdLimit<'a> {
    ids: &'a LongBitmask,
}

impl Filter for StreamIdLimit<'_> {
    fn matches(&mut self, _: &mut SearchContext, stream: &Stream<'_>) -> Result<bool> {
        Ok(self.ids.is_set(stream.id().0 as usize))
    }
}

/// Drops streams a newer reader also holds.
struct Superseded<'a> {
    newer: &'a [&'a IndexReader],
}

impl Filter for Superseded<'_> {
    fn matches(&mut self, _: &mut SearchContext, stream: &Stream<'_>) -> Result<bool> {
        Ok(!self.newer.iter().any(|r| r.contains_stream(stream.id())))
    }
}

struct FixedLookup(Vec<u32>);

impl Lookup for FixedLookup {
    fn positions(&mut self) -> Result<Vec<u32>> {
        Ok(self.0.clone())
    }
}

struct IdRangeLookup<'a> {
    reader: &'a IndexReader,
    min: u64,
    max: u64,
}

impl Lookup for IdRangeLookup<'_> {
    fn positions(&mut self) -> Result<Vec<u32>> {
        self.reader.positions_in_id_range(self.min, self.max)
    }
}

// tag

/// The `TAG_*` state bit of stream `id`.
pub(crate) fn tag_state(details: &TagDetails, id: StreamId) -> u8 {
    match (details.is_uncertain(id), details.matches_stream(id)) {
        (false, true) => TAG_MATCHING,
        (false, false) => TAG_FAILING,
        (true, true) => TAG_UNCERTAIN_MATCHING,
        (true, false) => TAG_UNCERTAIN_FAILING,
    }
}

fn tag_filter<'a>(env: &PartEnv<'a>, condition: &TagCondition, details: &'a TagDetails, part: &mut QueryPart<'a>) -> Prepared<'a> {
    match condition.accept {
        0 => Prepared::Never,
        TAG_ACCEPT_ALL => Prepared::Skip,
        accept => {
            part.lookups.push(Box::new(TagLookup {
                reader: env.reader,
                details,
                accept,
            }));
            Prepared::Filter(Box::new(TagFilter { details, accept }))
        }
    }
}

struct TagFilter<'a> {
    details: &'a TagDetails,
    accept: u8,
}

impl Filter for TagFilter<'_> {
    fn matches(&mut self, _: &mut SearchContext, stream: &Stream<'_>) -> Result<bool> {
        Ok(tag_state(self.details, stream.id()) & self.accept != 0)
    }
}

struct TagLookup<'a> {
    reader: &'a IndexReader,
    details: &'a TagDetails,
    accept: u8,
}

impl Lookup for TagLookup<'_> {
    fn positions(&mut self) -> Result<Vec<u32>> {
        Ok(self
            .reader
            .stream_ids()
            .filter(|&id| tag_state(self.details, id) & self.accept != 0)
            .filter_map(|id| self.reader.stream_index(id))
            .collect())
    }
}

// flag

fn flag_filter<'a>(env: &PartEnv<'a>, condition: &FlagCondition) -> Result<Prepared<'a>> {
    let sub_queries: Vec<&str> = condition.sub_queries.iter().map(String::as_str).collect();
    if !env.applies(&sub_queries) {
        return Ok(Prepared::Skip);
    }
    // A sub-query listed twice cancels out of the xor.
    let mut odd: BTreeMap<&str, bool> = BTreeMap::new();
    for sq in &sub_queries {
        *odd.entry(*sq).or_default() ^= true;
    }
    let own = odd.remove(env.sub_query).unwrap_or(false);
    let others: Vec<&str> = odd.into_iter().filter(|(_, odd)| *odd).map(|(sq, _)| sq).collect();
    if others.is_empty() {
        return Ok(Prepared::Filter(Box::new(FlagFilter {
            own,
            value: condition.value,
            mask: condition.mask,
        })));
    }

    // Map the flag value of the current stream that fails the condition to the combinations of
    // other results that make it fail.
    let mut combinations: Vec<(u16, Vec<ConnectedBitmask>)> = vec![(condition.value & condition.mask, Vec::new())];
    for sq in &others {
        let mut by_value: BTreeMap<u16, ConnectedBitmask> = BTreeMap::new();
        for (position, entry) in env.results(sq)?.entries.iter().enumerate() {
            by_value
                .entry(entry.stream.record().flags & condition.mask)
                .or_default()
                .set(position);
        }
        let mut next = Vec::with_capacity(combinations.len() * by_value.len());
        for (value, positions) in &combinations {
            for (other_value, other_positions) in &by_value {
                let mut combination = positions.clone();
                combination.push(other_positions.clone());
                next.push((value ^ other_value, combination));
            }
        }
        combinations = next;
    }
    let mut failing: HashMap<u16, Vec<Vec<ConnectedBitmask>>> = HashMap::new();
    for (value, combination) in combinations {
        failing.entry(value).or_default().push(combination);
    }
    Ok(Prepared::Filter(Box::new(CrossFlagFilter {
        own,
        mask: condition.mask,
        sub_queries: others.into_iter().map(str::to_string).collect(),
        failing,
    })))
}

struct FlagFilter {
    own: bool,
    value: u16,
    mask: u16,
}

impl Filter for FlagFilter {
    fn matches(&mut self, _: &mut SearchContext, stream: &Stream<'_>) -> Result<bool> {
        let flags = if self.own { stream.record().flags } else { 0 };
        Ok((flags ^ self.value) & self.mask != 0)
    }
}

struct CrossFlagFilter {
    own: bool,
    mask: u16,
    sub_queries: Vec<String>,
    failing: HashMap<u16, Vec<Vec<ConnectedBitmask>>>,
}

impl Filter for CrossFlagFilter {
    fn matches(&mut self, context: &mut SearchContext, stream: &Stream<'_>) -> Result<bool> {
        let flags = if self.own { stream.record().flags & self.mask } else { 0 };
        let Some(combinations) = self.failing.get(&flags) else {
            return Ok(true);
        };
        let names: Vec<&str> = self.sub_queries.iter().map(String::as_str).collect();
        for combination in combinations {
            let forbidden: Vec<&ConnectedBitmask> = combination.iter().collect();
            context.selection.remove(&names, &forbidden);
        }
        Ok(!context.selection.is_empty())
    }
}

// host

fn octets(host: IpAddr) -> Vec<u8> {
    match host {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

/// Whether the xor of `hosts` is zero under the family's mask. `None` when the hosts are not
/// all of one address family.
pub(crate) fn masked_xor_is_zero(hosts: &[IpAddr], mask4: &[u8; 4], mask6: &[u8; 16]) -> Option<bool> {
    let mut xor: Option<Vec<u8>> = None;
    for &host in hosts {
        let bytes = octets(host);
        match &mut xor {
            None => xor = Some(bytes),
            Some(acc) => {
                if acc.len() != bytes.len() {
                    return None;
                }
                for (a, b) in acc.iter_mut().zip(bytes) {
                    *a ^= b;
                }
            }
        }
    }
    let Some(xor) = xor else {
        return Some(true);
    };
    let mask: &[u8] = if xor.len() == 4 { mask4 } else { mask6 };
    Some(xor.iter().zip(mask).all(|(x, m)| x & m == 0))
}

fn side_host(stream: &Stream<'_>, side: HostSide) -> IpAddr {
    match side {
        HostSide::Client => stream.client_host(),
        HostSide::Server => stream.server_host(),
    }
}

fn host_filter<'a>(env: &PartEnv<'a>, condition: &HostCondition) -> Result<Prepared<'a>> {
    let sub_queries: Vec<&str> = condition.sources.iter().map(|s| s.sub_query.as_str()).collect();
    if !env.applies(&sub_queries) {
        return Ok(Prepared::Skip);
    }
    let (mut client, mut server) = (false, false);
    let mut others = Vec::new();
    for source in &condition.sources {
        if source.sub_query == env.sub_query {
            match source.side {
                HostSide::Client => client = !client,
                HostSide::Server => server = !server,
            }
        } else {
            others.push(source);
        }
    }
    if !(client || server) {
        return Ok(Prepared::Skip);
    }
    if others.is_empty() {
        return Ok(Prepared::Filter(Box::new(HostFilter {
            client,
            server,
            host: condition.host,
            mask4: condition.mask4,
            mask6: condition.mask6,
            invert: condition.invert,
        })));
    }
    if condition.host.is_some() || condition.sources.len() != 2 {
        return Err(Error::unsupported("complex host condition not supported"));
    }
    let other = others[0];
    let own_side = if client { HostSide::Client } else { HostSide::Server };
    let other_hosts: Vec<IpAddr> = env
        .results(&other.sub_query)?
        .entries
        .iter()
        .map(|e| side_host(&e.stream, other.side))
        .collect();

    if condition.mask4 == [0; 4] && condition.mask6 == [0; 16] {
        // Only the address family is compared.
        let mut by_family = [ConnectedBitmask::new(), ConnectedBitmask::new()];
        for (position, host) in other_hosts.iter().enumerate() {
            by_family[usize::from(host.is_ipv6())].set(position);
        }
        return Ok(Prepared::Filter(Box::new(HostFamilyFilter {
            side: own_side,
            other: other.sub_query.clone(),
            by_family,
            invert: condition.invert,
        })));
    }
    Ok(Prepared::Filter(Box::new(CrossHostFilter {
        side: own_side,
        other: other.sub_query.clone(),
        other_hosts,
        mask4: condition.mask4,
        mask6: condition.mask6,
        invert: condition.invert,
    })))
}

struct HostFilter {
    client: bool,
    server: bool,
    host: Option<IpAddr>,
    mask4: [u8; 4],
    mask6: [u8; 16],
    invert: bool,
}

impl Filter for HostFilter {
    fn matches(&mut self, _: &mut SearchContext, stream: &Stream<'_>) -> Result<bool> {
        let mut hosts = Vec::with_capacity(3);
        if self.client {
            hosts.push(stream.client_host());
        }
        if self.server {
            hosts.push(stream.server_host());
        }
        hosts.extend(self.host);
        Ok(match masked_xor_is_zero(&hosts, &self.mask4, &self.mask6) {
            Some(equal) => equal != self.invert,
            None => self.invert,
        })
    }
}

struct HostFamilyFilter {
    side: HostSide,
    other: String,
    /// Result positions of the other sub-query with v4 and v6 hosts.
    by_family: [ConnectedBitmask; 2],
    invert: bool,
}

impl Filter for HostFamilyFilter {
    fn matches(&mut self, context: &mut SearchContext, stream: &Stream<'_>) -> Result<bool> {
        let own = usize::from(side_host(stream, self.side).is_ipv6());
        let forbidden = if self.invert { own } else { 1 - own };
        context
            .selection
            .remove(&[self.other.as_str()], &[&self.by_family[forbidden]]);
        Ok(!context.selection.is_empty())
    }
}

struct CrossHostFilter {
    side: HostSide,
    other: String,
    other_hosts: Vec<IpAddr>,
    mask4: [u8; 4],
    mask6: [u8; 16],
    invert: bool,
}

impl Filter for CrossHostFilter {
    fn matches(&mut self, context: &mut SearchContext, stream: &Stream<'_>) -> Result<bool> {
        let own = side_host(stream, self.side);
        let mut forbidden = ConnectedBitmask::new();
        for (position, &other) in self.other_hosts.iter().enumerate() {
            let fulfilled = match masked_xor_is_zero(&[own, other], &self.mask4, &self.mask6) {
                Some(equal) => equal != self.invert,
                None => self.invert,
            };
            if !fulfilled {
                forbidden.set(position);
            }
        }
        context.selection.remove(&[self.other.as_str()], &[&forbidden]);
        Ok(!context.selection.is_empty())
    }
}

// linear conditions over several sub-queries

/// Restricts the selection to combinations of other results whose summed values, added to the
/// current stream's value, are not negative.
pub(crate) struct CrossSums {
    sub_queries: Vec<String>,
    /// Per sub-query, the distinct values ascending with the result positions holding them. The
    /// last table is cumulative: entry `i` holds every position with a value up to its own.
    tables: Vec<Vec<(i128, ConnectedBitmask)>>,
    min_sum: i128,
    max_sum: i128,
}

impl CrossSums {
    pub fn new(columns: Vec<(String, Vec<i128>)>) -> Self {
        let mut sub_queries = Vec::with_capacity(columns.len());
        let mut tables = Vec::with_capacity(columns.len());
        let (mut min_sum, mut max_sum) = (0i128, 0i128);
        for (sub_query, values) in columns {
            let mut by_value: BTreeMap<i128, ConnectedBitmask> = BTreeMap::new();
            for (position, value) in values.into_iter().enumerate() {
                by_value.entry(value).or_default().set(position);
            }
            let table: Vec<(i128, ConnectedBitmask)> = by_value.into_iter().collect();
            if let (Some(first), Some(last)) = (table.first(), table.last()) {
                min_sum += first.0;
                max_sum += last.0;
            }
            sub_queries.push(sub_query);
            tables.push(table);
        }
        if let Some(last) = tables.last_mut() {
            for i in 1..last.len() {
                let previous = last[i - 1].1.clone();
                last[i].1.or(&previous);
            }
        }
        CrossSums {
            sub_queries,
            tables,
            min_sum,
            max_sum,
        }
    }

    pub fn restrict(&self, context: &mut SearchContext, own: i128) -> bool {
        if self.tables.iter().any(Vec::is_empty) {
            return false;
        }
        if own + self.min_sum >= 0 {
            return true;
        }
        if own + self.max_sum < 0 {
            return false;
        }
        let Some((last, rest)) = self.tables.split_last() else {
            return own >= 0;
        };
        let names: Vec<&str> = self.sub_queries.iter().map(String::as_str).collect();
        let (last_low, last_high) = (last[0].0, last[last.len() - 1].0);
        let mut positions = vec![0usize; rest.len()];
        'combinations: loop {
            let partial = own
                + rest
                    .iter()
                    .zip(&positions)
                    .map(|(table, &p)| table[p].0)
                    .sum::<i128>();
            if partial + last_low < 0 {
                let mut forbidden: Vec<&ConnectedBitmask> = rest
                    .iter()
                    .zip(&positions)
                    .map(|(table, &p)| &table[p].1)
                    .collect();
                if partial + last_high < 0 {
                    // No value of the last sub-query helps.
                    context.selection.remove(&names[..names.len() - 1], &forbidden);
                } else {
                    let first_valid = last.partition_point(|(value, _)| partial + value < 0);
                    forbidden.push(&last[first_valid - 1].1);
                    context.selection.remove(&names, &forbidden);
                }
                if context.selection.is_empty() {
                    return false;
                }
            }
            for (i, p) in positions.iter_mut().enumerate() {
                *p += 1;
                if *p < rest[i].len() {
                    continue 'combinations;
                }
                *p = 0;
            }
            break;
        }
        !context.selection.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct NumberFactors([i64; 5]);

impl NumberFactors {
    fn slot(field: NumberField) -> usize {
        match field {
            NumberField::Id => 0,
            NumberField::ClientBytes => 1,
            NumberField::ServerBytes => 2,
            NumberField::ClientPort => 3,
            NumberField::ServerPort => 4,
        }
    }

    fn is_zero(&self) -> bool {
        self.0.iter().all(|&f| f == 0)
    }

    fn value(&self, stream: &Stream<'_>) -> i128 {
        let fields = [
            stream.id().0 as i128,
            stream.client_bytes() as i128,
            stream.server_bytes() as i128,
            stream.client_port() as i128,
            stream.server_port() as i128,
        ];
        self.0
            .iter()
            .zip(fields)
            .map(|(&factor, field)| factor as i128 * field)
            .sum()
    }
}

/// Tightens `range` with an `id >= n` or `id <= n` condition on the current sub-query.
fn narrow_id_range(env: &PartEnv<'_>, condition: &NumberCondition, range: &mut (u64, u64)) {
    let [summand] = condition.summands.as_slice() else {
        return;
    };
    if summand.sub_query != env.sub_query || summand.field != NumberField::Id {
        return;
    }
    match summand.factor {
        // number + id >= 0
        1 => range.0 = range.0.max(condition.number.saturating_neg().max(0) as u64),
        // number - id >= 0
        -1 => {
            if condition.number < 0 {
                *range = (1, 0);
            } else {
                range.1 = range.1.min(condition.number as u64);
            }
        }
        _ => {}
    }
}

fn number_filter<'a>(env: &PartEnv<'a>, condition: &NumberCondition) -> Result<Prepared<'a>> {
    let sub_queries: Vec<&str> = condition.summands.iter().map(|s| s.sub_query.as_str()).collect();
    if !env.applies(&sub_queries) {
        return Ok(Prepared::Skip);
    }
    let mut factors: BTreeMap<&str, NumberFactors> = BTreeMap::new();
    for summand in &condition.summands {
        factors.entry(&summand.sub_query).or_default().0[NumberFactors::slot(summand.field)] += summand.factor;
    }
    factors.retain(|_, f| !f.is_zero());
    let Some(own) = factors.remove(env.sub_query) else {
        return Ok(Prepared::Skip);
    };
    let number = condition.number as i128;
    if factors.is_empty() {
        return Ok(Prepared::Filter(Box::new(NumberFilter { number, own })));
    }
    let mut columns = Vec::with_capacity(factors.len());
    for (sq, f) in factors {
        let values = env.results(sq)?.entries.iter().map(|e| f.value(&e.stream)).collect();
        columns.push((sq.to_string(), values));
    }
    Ok(Prepared::Filter(Box::new(CrossNumberFilter {
        number,
        own,
        sums: CrossSums::new(columns),
    })))
}

struct NumberFilter {
    number: i128,
    own: NumberFactors,
}

impl Filter for NumberFilter {
    fn matches(&mut self, _: &mut SearchContext, stream: &Stream<'_>) -> Result<bool> {
        Ok(self.number + self.own.value(stream) >= 0)
    }
}

struct CrossNumberFilter {
    number: i128,
    own: NumberFactors,
    sums: CrossSums,
}

impl Filter for CrossNumberFilter {
    fn matches(&mut self, context: &mut SearchContext, stream: &Stream<'_>) -> Result<bool> {
        Ok(self.sums.restrict(context, self.number + self.own.value(stream)))
    }
}

/// `ftime_factor * ftime + ltime_factor * ltime`, times relative to the query reference time.
#[derive(Debug, Clone, Copy, Default)]
struct TimeFactors {
    ftime: i64,
    ltime: i64,
    reference_nanos: i128,
}

impl TimeFactors {
    fn value_at(&self, first: i128, last: i128) -> i128 {
        self.ftime as i128 * (first - self.reference_nanos) + self.ltime as i128 * (last - self.reference_nanos)
    }

    fn value(&self, stream: &Stream<'_>) -> i128 {
        self.value_at(stream.first_packet_nanos(), stream.last_packet_nanos())
    }
}

fn time_filter<'a>(env: &PartEnv<'a>, condition: &TimeCondition) -> Result<Prepared<'a>> {
    let sub_queries: Vec<&str> = condition.summands.iter().map(|s| s.sub_query.as_str()).collect();
    if !env.applies(&sub_queries) {
        return Ok(Prepared::Skip);
    }
    let mut factors: BTreeMap<&str, TimeFactors> = BTreeMap::new();
    for summand in &condition.summands {
        let f = factors.entry(&summand.sub_query).or_insert(TimeFactors {
            reference_nanos: env.reference_nanos,
            ..TimeFactors::default()
        });
        f.ftime += summand.ftime_factor;
        f.ltime += summand.ltime_factor;
    }
    factors.retain(|_, f| f.ftime != 0 || f.ltime != 0);
    let Some(own) = factors.remove(env.sub_query) else {
        return Ok(Prepared::Skip);
    };
    let duration = condition.duration as i128;
    if factors.is_empty() {
        // With a single time field the value is monotonic, so the reader's bounds decide it
        // when both ends agree.
        if own.ftime == 0 || own.ltime == 0 {
            if let (Some((first_min, first_max)), Some((last_min, last_max))) =
                (env.reader.first_packet_bounds(), env.reader.last_packet_bounds())
            {
                let early = duration + own.value_at(first_min, last_min) >= 0;
                let late = duration + own.value_at(first_max, last_max) >= 0;
                if early == late {
                    return Ok(if early { Prepared::Skip } else { Prepared::Never });
                }
            }
        }
        return Ok(Prepared::Filter(Box::new(TimeFilter { duration, own })));
    }
    let mut columns = Vec::with_capacity(factors.len());
    for (sq, f) in factors {
        let values = env.results(sq)?.entries.iter().map(|e| f.value(&e.stream)).collect();
        columns.push((sq.to_string(), values));
    }
    Ok(Prepared::Filter(Box::new(CrossTimeFilter {
        duration,
        own,
        sums: CrossSums::new(columns),
    })))
}

struct TimeFilter {
    duration: i128,
    own: TimeFactors,
}

impl Filter for TimeFilter {
    fn matches(&mut self, _: &mut SearchContext, stream: &Stream<'_>) -> Result<bool> {
        Ok(self.duration + self.own.value(stream) >= 0)
    }
}

struct CrossTimeFilter {
    duration: i128,
    own: TimeFactors,
    sums: CrossSums,
}

impl Filter for CrossTimeFilter {
    fn matches(&mut self, context: &mut SearchContext, stream: &Stream<'_>) -> Result<bool> {
        Ok(self.sums.restrict(context, self.duration + self.own.value(stream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;
    use crate::core::types::{Direction, Protocol};
    use crate::query::Query;
    use crate::search::context::SubQuerySelection;
    use crate::storage::{IndexWriter, PacketSource, StreamInput};
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    // Stream i (1..=4): 10.0.0.i:100i -> 192.168.0.1:80 (odd) or [2001:db8::1]:443 (even),
    // starting i minutes after `start()`, TCP for odd and UDP for even ids.
    fn reader(dir: &tempfile::TempDir) -> IndexReader {
        let mut writer = IndexWriter::new(dir.path().join("filters.idx")).unwrap();
        for i in 1..=4u64 {
            let (server, protocol) = if i % 2 == 1 {
                ("192.168.0.1:80", Protocol::Tcp)
            } else {
                ("[2001:db8::1]:443", Protocol::Udp)
            };
            let client = if i % 2 == 1 {
                format!("10.0.0.{}:{}", i, 1000 + i)
            } else {
                format!("[2001:db8::{}]:{}", i, 1000 + i)
            };
            let mut input = StreamInput::new(client.parse().unwrap(), server.parse().unwrap(), protocol);
            input.push_packet(
                start() + Duration::minutes(i as i64),
                Direction::ClientToServer,
                PacketSource {
                    filename: "f.pcap".to_string(),
                    index: i,
                },
                b"data",
            );
            assert!(writer.add_stream(&input, StreamId(i)).unwrap());
        }
        writer.finalize().unwrap()
    }

    /// Ids of the root streams matching the single clause of `query`, with the lookups' ids.
    fn evaluate(reader: &IndexReader, query: &str) -> Option<(Vec<u64>, Option<Vec<u64>>)> {
        let query = Query::parse_at(query, start() + Duration::hours(1)).unwrap();
        let previous = BTreeMap::new();
        let tags = TagSnapshot::new();
        let converters = ConverterMap::new();
        let regexes = RegexCache::new(&Config::default());
        let env = PartEnv {
            reader,
            sub_query: "",
            part_index: 0,
            previous: &previous,
            reference_nanos: query.reference_time.timestamp_nanos_opt().unwrap() as i128,
            superseding: &[],
            limit_ids: None,
            tags: &tags,
            converters: &converters,
            regexes: &regexes,
        };
        let mut part = build_query_part(&env, &query.conditions[0]).unwrap()?;
        let mut matching = Vec::new();
        for stream in reader.streams() {
            let stream = stream.unwrap();
            let mut context = SearchContext::default();
            let mut ok = true;
            for filter in &mut part.filters {
                if !filter.matches(&mut context, &stream).unwrap() {
                    ok = false;
                    break;
                }
            }
            if ok {
                matching.push(stream.id().0);
            }
        }
        let lookups = part.lookups.first_mut().map(|l| {
            let mut ids: Vec<u64> = l
                .positions()
                .unwrap()
                .into_iter()
                .map(|p| reader.stream_by_index(p).unwrap().id().0)
                .collect();
            ids.sort_unstable();
            ids
        });
        Some((matching, lookups))
    }

    #[test]
    fn local_filters() {
        let dir = tempfile::tempdir().unwrap();
        let reader = reader(&dir);
        assert_eq!(evaluate(&reader, "sport:80").unwrap().0, [1, 3]);
        assert_eq!(evaluate(&reader, "cport:1002:1003").unwrap().0, [2, 3]);
        assert_eq!(evaluate(&reader, "protocol:udp").unwrap().0, [2, 4]);
        assert_eq!(evaluate(&reader, "chost:10.0.0.0/24").unwrap().0, [1, 3]);
        assert_eq!(evaluate(&reader, "-chost:10.0.0.3").unwrap().0, [1, 2, 4]);
        assert_eq!(evaluate(&reader, "shost:2001:db8::/32").unwrap().0, [2, 4]);
    }

    #[test]
    fn id_conditions_become_lookups() {
        let dir = tempfile::tempdir().unwrap();
        let reader = reader(&dir);
        let (matching, lookup) = evaluate(&reader, "id:2:3").unwrap();
        assert_eq!(matching, [2, 3]);
        assert_eq!(lookup, Some(vec![2, 3]));
        assert_eq!(evaluate(&reader, "id:4").unwrap().1, Some(vec![4]));
        // An id the reader does not hold rules the part out.
        assert!(evaluate(&reader, "id:9").is_none());
    }

    #[test]
    fn time_conditions_are_decided_by_reader_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let reader = reader(&dir);
        // Everything in the reader is older than ten minutes before the reference time.
        let (matching, _) = evaluate(&reader, "ftime:-2h:-10m").unwrap();
        assert_eq!(matching, [1, 2, 3, 4]);
        assert!(evaluate(&reader, "ftime:-5m:").is_none());
        assert_eq!(evaluate(&reader, "ftime:0002:0003").unwrap().0, [2, 3]);
    }

    #[test]
    fn unknown_tags_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        let reader = reader(&dir);
        let query = Query::parse_at("tag:missing", start()).unwrap();
        let previous = BTreeMap::new();
        let tags = TagSnapshot::new();
        let converters = ConverterMap::new();
        let regexes = RegexCache::new(&Config::default());
        let env = PartEnv {
            reader: &reader,
            sub_query: "",
            part_index: 0,
            previous: &previous,
            reference_nanos: 0,
            superseding: &[],
            limit_ids: None,
            tags: &tags,
            converters: &converters,
            regexes: &regexes,
        };
        let err = build_query_part(&env, &query.conditions[0]).err().unwrap();
        assert_eq!(err.kind, crate::core::error::ErrorKind::NotFound);
    }

    #[test]
    fn tag_states() {
        let mut details = TagDetails::new(crate::query::ConditionsSet::always());
        details.matches.set(1);
        details.matches.set(3);
        details.uncertain.set(3);
        details.uncertain.set(4);
        assert_eq!(tag_state(&details, StreamId(1)), TAG_MATCHING);
        assert_eq!(tag_state(&details, StreamId(2)), TAG_FAILING);
        assert_eq!(tag_state(&details, StreamId(3)), TAG_UNCERTAIN_MATCHING);
        assert_eq!(tag_state(&details, StreamId(4)), TAG_UNCERTAIN_FAILING);
    }

    #[test]
    fn masked_host_comparison() {
        let a: IpAddr = "10.1.2.3".parse().unwrap();
        let b: IpAddr = "10.1.9.9".parse().unwrap();
        let v6: IpAddr = "::1".parse().unwrap();
        let full = ([0xff; 4], [0xff; 16]);
        let slash16 = ([0xff, 0xff, 0, 0], [0xff; 16]);
        assert_eq!(masked_xor_is_zero(&[a, b], &full.0, &full.1), Some(false));
        assert_eq!(masked_xor_is_zero(&[a, b], &slash16.0, &slash16.1), Some(true));
        assert_eq!(masked_xor_is_zero(&[a, v6], &full.0, &full.1), None);
        assert_eq!(masked_xor_is_zero(&[a, a], &full.0, &full.1), Some(true));
    }

    #[test]
    fn cross_sums_remove_invalid_combinations() {
        // a + b - 22 >= 0 with a in {1, 2, 3} and b in {10, 20}.
        let sums = CrossSums::new(vec![
            ("a".to_string(), vec![1, 2, 3]),
            ("b".to_string(), vec![10, 20]),
        ]);
        let mut context = SearchContext::new(SubQuerySelection::new(BTreeMap::from([
            ("a".to_string(), ConnectedBitmask::from_range(0, 2)),
            ("b".to_string(), ConnectedBitmask::from_range(0, 1)),
        ])));
        assert!(sums.restrict(&mut context, -22));
        let allows = |a: usize, b: usize| context.selection.allows(&[("a", a), ("b", b)]);
        assert!(allows(1, 1));
        assert!(allows(2, 1));
        assert!(!allows(0, 1));
        assert!(!allows(2, 0));

        let mut context = SearchContext::new(SubQuerySelection::new(BTreeMap::from([
            ("a".to_string(), ConnectedBitmask::from_range(0, 2)),
            ("b".to_string(), ConnectedBitmask::from_range(0, 1)),
        ])));
        assert!(!sums.restrict(&mut context, -24));
        assert!(sums.restrict(&mut context, -11));
    }
}
