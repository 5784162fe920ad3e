use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::bitmask::{Bitmask, LongBitmask, ShortBitmask};
use crate::core::config::Config;
use crate::core::error::{Error, Result};
use crate::core::types::Direction;
use crate::query::conditions::Condition;
use crate::query::sorting::{SortDirection, SortingKey};
use crate::query::{subqueries, ConditionsSet, Grouping, Query, Sorting};
use crate::search::context::{SearchContext, SubQuerySelection};
use crate::search::converters::{CancellationToken, ConverterMap, TagSnapshot};
use crate::search::data::RegexCache;
use crate::search::filters::{build_query_part, PartEnv, QueryPart};
use crate::search::results::{Admission, GroupKeys, ResultPolicy, ResultSet};
use crate::storage::format::Section;
use crate::storage::{IndexReader, Stream};

/// Everything a search needs besides the readers.
#[derive(Clone)]
pub struct SearchRequest {
    pub conditions: ConditionsSet,
    /// The time relative times in `conditions` were resolved against.
    pub reference_time: DateTime<Utc>,
    pub sorting: Vec<Sorting>,
    pub grouping: Option<Grouping>,
    /// Zero means unbounded.
    pub limit: usize,
    pub skip: usize,
    /// Restricts the results to these stream ids.
    pub limit_ids: Option<LongBitmask>,
    pub tags: TagSnapshot,
    pub converters: ConverterMap,
    pub cancellation: CancellationToken,
    pub extract_data_regexes: bool,
}

impl SearchRequest {
    pub fn new(conditions: ConditionsSet, config: &Config) -> Self {
        SearchRequest {
            conditions,
            reference_time: Utc::now(),
            sorting: Sorting::default_order(),
            grouping: None,
            limit: config.default_limit,
            skip: 0,
            limit_ids: None,
            tags: TagSnapshot::new(),
            converters: ConverterMap::new(),
            cancellation: CancellationToken::new(),
            extract_data_regexes: false,
        }
    }

    /// Takes the conditions and control terms of a parsed query.
    pub fn from_query(query: &Query, config: &Config) -> Self {
        let mut request = SearchRequest::new(query.conditions.clone(), config);
        request.reference_time = query.reference_time;
        if let Some(sorting) = &query.sorting {
            request.sorting = sorting.clone();
        }
        if let Some(limit) = query.limit {
            request.limit = limit;
        }
        request.grouping = query.grouping.clone();
        request
    }

    pub fn with_reference_time(mut self, reference_time: DateTime<Utc>) -> Self {
        self.reference_time = reference_time;
        self
    }

    /// An empty list sorts by the default order.
    pub fn with_sorting(mut self, sorting: Vec<Sorting>) -> Self {
        self.sorting = if sorting.is_empty() { Sorting::default_order() } else { sorting };
        self
    }

    pub fn with_grouping(mut self, grouping: Option<Grouping>) -> Self {
        self.grouping = grouping;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    pub fn with_limit_ids(mut self, ids: LongBitmask) -> Self {
        self.limit_ids = Some(ids);
        self
    }

    pub fn with_tags(mut self, tags: TagSnapshot) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_converters(mut self, converters: ConverterMap) -> Self {
        self.converters = converters;
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn with_data_regexes(mut self) -> Self {
        self.extract_data_regexes = true;
        self
    }
}

/// Regexes of the data conditions of a query, per direction, for highlighting matches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataRegexes {
    pub client: Vec<String>,
    pub server: Vec<String>,
}

#[derive(Debug)]
pub struct SearchResult<'r> {
    pub streams: Vec<Stream<'r>>,
    /// More matches exist beyond the returned page.
    pub has_more: bool,
    pub data_regexes: Option<DataRegexes>,
}

impl SearchResult<'_> {
    fn empty() -> Self {
        SearchResult {
            streams: Vec::new(),
            has_more: false,
            data_regexes: None,
        }
    }
}

/// Searches `readers`, given oldest first. A stream held by several readers is taken from the
/// newest one.
pub fn search_streams<'r>(readers: &[&'r IndexReader], request: &SearchRequest, config: &Config) -> Result<SearchResult<'r>> {
    if request.conditions.is_empty() {
        return Ok(SearchResult::empty());
    }
    let conditions = request.conditions.inline_tag_filters(&request.tags);
    validate(&conditions, &request.tags, &request.converters)?;
    let order = subqueries::evaluation_order(&conditions)?;

    let reference_nanos = request
        .reference_time
        .timestamp_nanos_opt()
        .map(i128::from)
        .unwrap_or_else(|| i128::from(request.reference_time.timestamp()) * 1_000_000_000);
    let grouping = request.grouping.as_ref().map(GroupKeys::new);
    let regexes = RegexCache::new(config);
    let mut evaluated = 0usize;

    let mut results: BTreeMap<String, ResultSet<'r>> = BTreeMap::new();
    for sub_query in &order {
        let root = sub_query.is_empty();
        let policy = if root {
            ResultPolicy {
                sorting: Some(&request.sorting),
                limit: if request.limit == 0 { 0 } else { request.limit.saturating_add(request.skip) },
                grouping: grouping.as_ref(),
            }
        } else {
            ResultPolicy::default()
        };
        let limit_ids = if root { request.limit_ids.as_ref() } else { None };

        let mut current = ResultSet::new(conditions.len());
        for (i, &reader) in readers.iter().enumerate().rev() {
            let env = PartEnv {
                reader,
                sub_query,
                part_index: 0,
                previous: &results,
                reference_nanos,
                superseding: &readers[i + 1..],
                limit_ids,
                tags: &request.tags,
                converters: &request.converters,
                regexes: &regexes,
            };
            let mut parts = Vec::with_capacity(conditions.len());
            for (part_index, clause) in conditions.iter().enumerate() {
                let env = PartEnv { part_index, ..env };
                parts.push(build_query_part(&env, clause)?);
            }
            let mut scan = ReaderScan {
                reader,
                parts,
                previous: &results,
                policy,
                cancellation: &request.cancellation,
                check_interval: config.cancellation_check_interval,
                evaluated: &mut evaluated,
            };
            let candidates = scan.run(&mut current)?;
            debug!(
                sub_query = sub_query.as_str(),
                reader = %reader.path().display(),
                candidates,
                results = current.entries.len(),
                "searched reader"
            );
        }
        if current.is_empty() {
            debug!(sub_query = sub_query.as_str(), "sub-query has no results");
            return Ok(SearchResult::empty());
        }
        results.insert(sub_query.clone(), current);
    }

    let Some(root) = results.remove("") else {
        return Ok(SearchResult::empty());
    };
    if root.entries.len() <= request.skip {
        return Ok(SearchResult::empty());
    }
    let data_regexes = request
        .extract_data_regexes
        .then(|| extract_data_regexes(&conditions, &request.tags));
    Ok(SearchResult {
        streams: root.entries[request.skip..].iter().map(|e| e.stream).collect(),
        has_more: root.dropped != 0,
        data_regexes,
    })
}

/// Rejects references to unknown tags and converters before anything is scanned.
fn validate(conditions: &ConditionsSet, tags: &TagSnapshot, converters: &ConverterMap) -> Result<()> {
    for name in conditions.referenced_tags() {
        if !tags.contains_key(&name) {
            return Err(Error::not_found(format!("tag {:?} does not exist", name)));
        }
    }
    for condition in conditions.iter().flat_map(|clause| clause.iter()) {
        if let Condition::Data(data) = condition {
            for element in &data.elements {
                if let Some(name) = element.converter.as_deref() {
                    if name != "none" && !converters.contains_key(name) {
                        return Err(Error::not_found(format!("converter {:?} does not exist", name)));
                    }
                }
            }
        }
    }
    Ok(())
}

/// Collects the data regexes of `conditions` and of the tags they reference, transitively.
fn extract_data_regexes(conditions: &ConditionsSet, tags: &TagSnapshot) -> DataRegexes {
    let mut regexes = DataRegexes::default();
    let mut visited: BTreeSet<&str> = BTreeSet::new();
    let mut queue: VecDeque<ConditionsSet> = VecDeque::from([conditions.clone()]);
    while let Some(set) = queue.pop_front() {
        for condition in set.inline_tag_filters(tags).iter().flat_map(|clause| clause.iter()) {
            match condition {
                Condition::Data(data) => {
                    for element in &data.elements {
                        let list = match element.direction {
                            Direction::ClientToServer => &mut regexes.client,
                            Direction::ServerToClient => &mut regexes.server,
                        };
                        if !list.contains(&element.regex) {
                            list.push(element.regex.clone());
                        }
                    }
                }
                Condition::Tag(tag) => {
                    if let Some((name, details)) = tags.get_key_value(&tag.name) {
                        if visited.insert(name.as_str()) {
                            queue.push_back(details.conditions.clone());
                        }
                    }
                }
                _ => {}
            }
        }
    }
    regexes
}

fn sorting_section(sorting: &Sorting) -> Option<Section> {
    match sorting.key {
        SortingKey::Id => Some(Section::ByStreamId),
        SortingKey::FirstPacketTime => Some(Section::ByFirstPacketTime),
        SortingKey::LastPacketTime => Some(Section::ByLastPacketTime),
        _ => None,
    }
}

/// Evaluation of one sub-query over one reader.
struct ReaderScan<'s, 'p, 'r> {
    reader: &'r IndexReader,
    /// `None` for parts that can not match in this reader.
    parts: Vec<Option<QueryPart<'p>>>,
    previous: &'s BTreeMap<String, ResultSet<'r>>,
    policy: ResultPolicy<'s>,
    cancellation: &'s CancellationToken,
    check_interval: usize,
    evaluated: &'s mut usize,
}

impl<'r> ReaderScan<'_, '_, 'r> {
    /// Positions in the primary sort order, when the reader has a lookup for it and the results
    /// are bounded.
    fn sort_order(&self) -> Result<Option<Vec<u32>>> {
        if self.policy.limit == 0 {
            return Ok(None);
        }
        let Some(primary) = self.policy.sorting.and_then(|s| s.first()) else {
            return Ok(None);
        };
        let Some(section) = sorting_section(primary) else {
            return Ok(None);
        };
        let mut order = self.reader.lookup_order(section)?;
        if primary.direction == SortDirection::Descending {
            order.reverse();
        }
        Ok(Some(order))
    }

    /// Returns the number of candidates considered.
    fn run(&mut self, current: &mut ResultSet<'r>) -> Result<usize> {
        let mut active = ShortBitmask::new();
        for (index, part) in self.parts.iter().enumerate() {
            if part.is_some() {
                active.set(index);
            }
        }
        if active.is_zero() {
            return Ok(0);
        }
        let sort_order = self.sort_order()?;
        let complete_lookups = self.parts.iter().flatten().all(|p| !p.lookups.is_empty());

        if !complete_lookups {
            match sort_order {
                Some(order) => {
                    for (n, &position) in order.iter().enumerate() {
                        if self.evaluate(current, position, &active)? == Admission::Stop {
                            return Ok(n + 1);
                        }
                    }
                }
                None => {
                    for position in 0..self.reader.stream_count() as u32 {
                        self.evaluate(current, position, &active)?;
                    }
                }
            }
            return Ok(self.reader.stream_count());
        }

        // Candidates per part: the intersection of its lookups.
        let mut candidates: BTreeMap<u32, ShortBitmask> = BTreeMap::new();
        for (index, part) in self.parts.iter_mut().enumerate() {
            let Some(part) = part else {
                continue;
            };
            let mut positions: Option<Vec<u32>> = None;
            for lookup in &mut part.lookups {
                let found = lookup.positions()?;
                let narrowed = match positions {
                    None => found,
                    Some(previous) => {
                        let found: HashSet<u32> = found.into_iter().collect();
                        previous.into_iter().filter(|p| found.contains(p)).collect()
                    }
                };
                let empty = narrowed.is_empty();
                positions = Some(narrowed);
                if empty {
                    break;
                }
            }
            for position in positions.unwrap_or_default() {
                candidates.entry(position).or_default().set(index);
            }
        }
        let count = candidates.len();
        match sort_order {
            Some(order) => {
                for position in order {
                    let Some(parts) = candidates.get(&position) else {
                        continue;
                    };
                    if self.evaluate(current, position, parts)? == Admission::Stop {
                        break;
                    }
                }
            }
            None => {
                for (&position, parts) in &candidates {
                    self.evaluate(current, position, parts)?;
                }
            }
        }
        Ok(count)
    }

    fn evaluate(&mut self, current: &mut ResultSet<'r>, position: u32, active: &ShortBitmask) -> Result<Admission> {
        *self.evaluated += 1;
        if self.check_interval != 0 && *self.evaluated % self.check_interval == 0 {
            self.cancellation.check()?;
        }
        let stream = self.reader.stream_by_index(position)?;
        let admission = current.admit(&self.policy, &stream);
        if admission != Admission::Evaluate {
            return Ok(admission);
        }

        let mut matching = ShortBitmask::new();
        let mut contexts = Vec::new();
        'parts: for (index, part) in self.parts.iter_mut().enumerate() {
            let Some(part) = part else {
                continue;
            };
            if !active.is_set(index) {
                continue;
            }
            let mut allowed = BTreeMap::new();
            for (sub_query, results) in self.previous {
                let positions = &results.matching_parts[index];
                if positions.is_zero() {
                    continue 'parts;
                }
                allowed.insert(sub_query.clone(), positions.clone());
            }
            let mut context = SearchContext::new(SubQuerySelection::new(allowed));
            for filter in &mut part.filters {
                if !filter.matches(&mut context, &stream)? {
                    continue 'parts;
                }
            }
            matching.set(index);
            contexts.push(context);
        }
        if !matching.is_zero() {
            current.insert(&self.policy, stream, &matching, &contexts);
        }
        Ok(Admission::Evaluate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;
    use crate::core::types::{Protocol, StreamId};
    use crate::search::converters::TagDetails;
    use crate::storage::{IndexWriter, PacketSource, StreamInput};
    use chrono::{Duration, TimeZone};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    // Stream id i starts i seconds in, from 10.0.0.i to port 80 (even) or 443 (odd).
    fn reader(dir: &tempfile::TempDir, name: &str, ids: &[u64]) -> IndexReader {
        let mut writer = IndexWriter::new(dir.path().join(name)).unwrap();
        for &id in ids {
            let server = if id % 2 == 0 { "10.1.0.1:80" } else { "10.1.0.1:443" };
            let mut input = StreamInput::new(
                format!("10.0.0.{}:5000", id).parse().unwrap(),
                server.parse().unwrap(),
                Protocol::Tcp,
            );
            input.push_packet(
                start() + Duration::seconds(id as i64),
                Direction::ClientToServer,
                PacketSource {
                    filename: name.to_string(),
                    index: id,
                },
                format!("hello {}", id).as_bytes(),
            );
            assert!(writer.add_stream(&input, StreamId(id)).unwrap());
        }
        writer.finalize().unwrap()
    }

    fn ids(result: &SearchResult<'_>) -> Vec<u64> {
        result.streams.iter().map(|s| s.id().0).collect()
    }

    fn run<'r>(readers: &[&'r IndexReader], query: &str) -> SearchResult<'r> {
        let config = Config::default();
        let query = Query::parse_at(query, start()).unwrap();
        search_streams(readers, &SearchRequest::from_query(&query, &config), &config).unwrap()
    }

    #[test]
    fn newest_first_with_pages() {
        let dir = tempfile::tempdir().unwrap();
        let reader = reader(&dir, "a.idx", &[1, 2, 3, 4, 5, 6]);
        assert_eq!(ids(&run(&[&reader], "sport:80")), [6, 4, 2]);

        let config = Config::default();
        let query = Query::parse_at("sort:id", start()).unwrap();
        let request = SearchRequest::from_query(&query, &config).with_limit(2).with_skip(2);
        let page = search_streams(&[&reader], &request, &config).unwrap();
        assert_eq!(ids(&page), [3, 4]);
        assert!(page.has_more);
        let last = search_streams(&[&reader], &request.clone().with_skip(4), &config).unwrap();
        assert_eq!(ids(&last), [5, 6]);
        assert!(!last.has_more);
        let beyond = search_streams(&[&reader], &request.with_skip(6), &config).unwrap();
        assert!(beyond.streams.is_empty());
    }

    #[test]
    fn newer_readers_supersede_older_ones() {
        let dir = tempfile::tempdir().unwrap();
        let old = reader(&dir, "old.idx", &[1, 2, 3]);
        let new = reader(&dir, "new.idx", &[3, 4]);
        let result = run(&[&old, &new], "sort:id");
        assert_eq!(ids(&result), [1, 2, 3, 4]);
        assert_eq!(result.streams[2].reader().path(), new.path());
    }

    #[test]
    fn id_lookups_and_limit_ids() {
        let dir = tempfile::tempdir().unwrap();
        let reader = reader(&dir, "a.idx", &[1, 2, 3, 4, 5, 6]);
        assert_eq!(ids(&run(&[&reader], "id:2:4 sort:-id")), [4, 3, 2]);
        assert_eq!(ids(&run(&[&reader], "id:5 or id:1")), [5, 1]);

        let config = Config::default();
        let mut allowed = LongBitmask::new();
        allowed.set(2);
        allowed.set(5);
        let request = SearchRequest::new(ConditionsSet::always(), &config)
            .with_reference_time(start())
            .with_limit_ids(allowed);
        assert_eq!(ids(&search_streams(&[&reader], &request, &config).unwrap()), [5, 2]);
    }

    #[test]
    fn sub_query_results_feed_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let reader = reader(&dir, "a.idx", &[1, 2, 3, 4]);
        // Streams that started at least two seconds after stream 1.
        let result = run(&[&reader], "@a:id:1 ftime:@a:ftime@+2s:");
        assert_eq!(ids(&result), [4, 3]);
        // A sub-query without results empties the search.
        assert!(run(&[&reader], "@a:id:9 ftime:@a:ftime@:").streams.is_empty());
    }

    #[test]
    fn tags_and_their_errors() {
        let dir = tempfile::tempdir().unwrap();
        let reader = reader(&dir, "a.idx", &[1, 2, 3]);
        let config = Config::default();
        let mut tag = TagDetails::new(ConditionsSet::always());
        tag.matches.set(2);
        let tags = TagSnapshot::from([("important".to_string(), tag)]);

        let query = Query::parse_at("tag:important", start()).unwrap();
        let request = SearchRequest::from_query(&query, &config).with_tags(tags);
        assert_eq!(ids(&search_streams(&[&reader], &request, &config).unwrap()), [2]);

        let query = Query::parse_at("tag:unknown", start()).unwrap();
        let err = search_streams(&[&reader], &SearchRequest::from_query(&query, &config), &config).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);

        let query = Query::parse_at("cdata.nothing:x", start()).unwrap();
        let err = search_streams(&[&reader], &SearchRequest::from_query(&query, &config), &config).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[test]
    fn uncertain_tags_are_inlined() {
        let dir = tempfile::tempdir().unwrap();
        let reader = reader(&dir, "a.idx", &[1, 2, 3, 4]);
        let config = Config::default();
        let mut web = TagDetails::new(Query::parse_at("sport:80", start()).unwrap().conditions);
        web.matches.set(1);
        for id in 2..=4 {
            web.uncertain.set(id);
        }
        let tags = TagSnapshot::from([("web".to_string(), web)]);
        let query = Query::parse_at("tag:web", start()).unwrap();
        let request = SearchRequest::from_query(&query, &config).with_tags(tags);
        assert_eq!(ids(&search_streams(&[&reader], &request, &config).unwrap()), [4, 2, 1]);
    }

    #[test]
    fn absolute_times_follow_a_new_reference_time() {
        let dir = tempfile::tempdir().unwrap();
        let reader = reader(&dir, "a.idx", &[1, 2, 3, 4]);
        let config = Config::default();
        let later = start() + Duration::hours(1);
        let mut query = Query::parse_at("ftime:\"2024-01-01 000003:\"", start()).unwrap();
        assert_eq!(ids(&search_streams(&[&reader], &SearchRequest::from_query(&query, &config), &config).unwrap()), [4, 3]);

        query.conditions.update_reference_time(start(), later);
        let request = SearchRequest::from_query(&query, &config).with_reference_time(later);
        assert_eq!(ids(&search_streams(&[&reader], &request, &config).unwrap()), [4, 3]);
    }

    #[test]
    fn grouping_and_data_regexes() {
        let dir = tempfile::tempdir().unwrap();
        let reader = reader(&dir, "a.idx", &[1, 2, 3, 4, 5]);
        let config = Config::default();
        let query = Query::parse_at("cdata:hello group:@sport@", start()).unwrap();
        let request = SearchRequest::from_query(&query, &config).with_data_regexes();
        let result = search_streams(&[&reader], &request, &config).unwrap();
        assert_eq!(ids(&result), [5, 4]);
        assert!(!result.has_more);
        assert_eq!(
            result.data_regexes,
            Some(DataRegexes {
                client: vec!["hello".to_string()],
                server: Vec::new(),
            })
        );
    }

    #[test]
    fn cancelled_searches_fail() {
        let dir = tempfile::tempdir().unwrap();
        let reader = reader(&dir, "a.idx", &[1, 2]);
        let config = Config::default();
        let token = CancellationToken::new();
        token.cancel();
        let request = SearchRequest::new(ConditionsSet::always(), &config).with_cancellation(token);
        let err = search_streams(&[&reader], &request, &config).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancelled);
    }
}
