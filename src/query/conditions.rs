//! Typed query conditions and their canonical string forms.
//!
//! A [`ConditionsSet`] is a disjunction of [`Conditions`], each of which is a conjunction of
//! [`Condition`]s. Every condition names the sub-queries whose streams it reads; the anonymous
//! root sub-query is `""`.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::ops::{Deref, DerefMut};

use chrono::{DateTime, Utc};

use crate::core::types::Direction;

pub const PROTOCOL_MASK: u16 = 0b11;

pub const TAG_MATCHING: u8 = 0b0001;
pub const TAG_FAILING: u8 = 0b0010;
pub const TAG_UNCERTAIN_MATCHING: u8 = 0b0100;
pub const TAG_UNCERTAIN_FAILING: u8 = 0b1000;
pub const TAG_ACCEPT_ALL: u8 = 0b1111;
pub const TAG_ACCEPT_MATCHING: u8 = TAG_MATCHING | TAG_UNCERTAIN_MATCHING;
pub const TAG_ACCEPT_FAILING: u8 = TAG_FAILING | TAG_UNCERTAIN_FAILING;
pub const TAG_CERTAIN: u8 = TAG_MATCHING | TAG_FAILING;
pub const TAG_UNCERTAIN: u8 = TAG_UNCERTAIN_MATCHING | TAG_UNCERTAIN_FAILING;

/// Fulfilled when the stream's tag state (one of the `TAG_*` state bits) is in `accept`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TagCondition {
    pub sub_query: String,
    pub name: String,
    pub accept: u8,
}

/// Fulfilled when `(xor(flags of sub_queries) ^ value) & mask != 0`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FlagCondition {
    pub sub_queries: Vec<String>,
    pub value: u16,
    pub mask: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HostSide {
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostSource {
    pub sub_query: String,
    pub side: HostSide,
}

/// Fulfilled when `((xor(source hosts) ^ host) & mask == 0) != invert`.
///
/// `host` is `None` when the condition only compares sources with each other. Hosts of
/// different address families are never equal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostCondition {
    pub sources: Vec<HostSource>,
    pub host: Option<IpAddr>,
    pub mask4: [u8; 4],
    pub mask6: [u8; 16],
    pub invert: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NumberField {
    Id,
    ClientBytes,
    ServerBytes,
    ClientPort,
    ServerPort,
}

impl NumberField {
    pub fn name(self) -> &'static str {
        match self {
            NumberField::Id => "id",
            NumberField::ClientBytes => "cbytes",
            NumberField::ServerBytes => "sbytes",
            NumberField::ClientPort => "cport",
            NumberField::ServerPort => "sport",
        }
    }

    pub fn from_name(name: &str) -> Option<NumberField> {
        match name {
            "id" => Some(NumberField::Id),
            "cbytes" => Some(NumberField::ClientBytes),
            "sbytes" => Some(NumberField::ServerBytes),
            "cport" => Some(NumberField::ClientPort),
            "sport" => Some(NumberField::ServerPort),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NumberSummand {
    pub sub_query: String,
    pub field: NumberField,
    pub factor: i64,
}

/// Fulfilled when `number + sum(factor * field) >= 0`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NumberCondition {
    pub summands: Vec<NumberSummand>,
    pub number: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeSummand {
    pub sub_query: String,
    pub ftime_factor: i64,
    pub ltime_factor: i64,
}

/// Fulfilled when `duration + sum(ftime_factor * ftime + ltime_factor * ltime) >= 0`, with all
/// times in nanoseconds relative to the query's reference time.
///
/// `reference_time_factor` records how often absolute times were folded into `duration`; it is
/// needed to rebase the condition onto another reference time and is not part of the
/// evaluation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeCondition {
    pub summands: Vec<TimeSummand>,
    pub duration: i64,
    pub reference_time_factor: i64,
}

/// A placeholder inside a data regex, inserted at byte `position` of the element's regex.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DataVariable {
    pub position: usize,
    pub sub_query: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DataElement {
    pub sub_query: String,
    /// `None` searches the raw data and every converter, `Some("none")` only the raw data.
    pub converter: Option<String>,
    pub regex: String,
    pub variables: Vec<DataVariable>,
    pub direction: Direction,
}

/// An ordered sequence of regex matches. When `inverted`, the last element must not match
/// after all the others did.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DataCondition {
    pub elements: Vec<DataElement>,
    pub inverted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Condition {
    Tag(TagCondition),
    Flag(FlagCondition),
    Host(HostCondition),
    Number(NumberCondition),
    Time(TimeCondition),
    Data(DataCondition),
    Impossible,
}

/// AND-list of conditions. Empty means always true.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Conditions(pub Vec<Condition>);

/// OR-list of [`Conditions`]. Empty means always false.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ConditionsSet(pub Vec<Conditions>);

impl Deref for Conditions {
    type Target = Vec<Condition>;

    fn deref(&self) -> &Vec<Condition> {
        &self.0
    }
}

impl DerefMut for Conditions {
    fn deref_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.0
    }
}

impl Deref for ConditionsSet {
    type Target = Vec<Conditions>;

    fn deref(&self) -> &Vec<Conditions> {
        &self.0
    }
}

impl DerefMut for ConditionsSet {
    fn deref_mut(&mut self) -> &mut Vec<Conditions> {
        &mut self.0
    }
}

impl DataElement {
    /// The element's pattern with its variables written back as `@sub:name@`.
    pub fn pattern(&self) -> String {
        let mut out = String::new();
        let mut last = 0;
        for variable in &self.variables {
            out.push_str(&self.regex[last..variable.position].replace('@', "@@"));
            out.push('@');
            if !variable.sub_query.is_empty() {
                out.push_str(&variable.sub_query);
                out.push(':');
            }
            out.push_str(&variable.name);
            out.push('@');
            last = variable.position;
        }
        out.push_str(&self.regex[last..].replace('@', "@@"));
        out
    }
}

impl Condition {
    pub fn is_impossible(&self) -> bool {
        matches!(self, Condition::Impossible)
    }

    /// Names of the sub-queries this condition reads, without duplicates, in order of first
    /// occurrence.
    pub fn sub_queries(&self) -> Vec<&str> {
        fn add<'a>(result: &mut Vec<&'a str>, name: &'a str) {
            if !result.contains(&name) {
                result.push(name);
            }
        }

        let mut result = Vec::new();
        match self {
            Condition::Tag(c) => add(&mut result, &c.sub_query),
            Condition::Flag(c) => {
                for sub_query in &c.sub_queries {
                    add(&mut result, sub_query);
                }
            }
            Condition::Host(c) => {
                for source in &c.sources {
                    add(&mut result, &source.sub_query);
                }
            }
            Condition::Number(c) => {
                for summand in &c.summands {
                    add(&mut result, &summand.sub_query);
                }
            }
            Condition::Time(c) => {
                for summand in &c.summands {
                    add(&mut result, &summand.sub_query);
                }
            }
            Condition::Data(c) => {
                for element in &c.elements {
                    add(&mut result, &element.sub_query);
                    for variable in &element.variables {
                        add(&mut result, &variable.sub_query);
                    }
                }
            }
            Condition::Impossible => {}
        }
        result
    }
}

impl Conditions {
    pub fn new() -> Self {
        Conditions(Vec::new())
    }

    pub fn is_impossible(&self) -> bool {
        self.iter().any(Condition::is_impossible)
    }
}

impl ConditionsSet {
    /// The set matching every stream.
    pub fn always() -> Self {
        ConditionsSet(vec![Conditions::new()])
    }

    /// The set matching no stream.
    pub fn never() -> Self {
        ConditionsSet(Vec::new())
    }

    pub fn single(condition: Condition) -> Self {
        ConditionsSet(vec![Conditions(vec![condition])])
    }

    /// True for the cleaned form of an unsatisfiable set.
    pub fn is_impossible(&self) -> bool {
        self.len() == 1 && self[0].len() == 1 && self[0][0].is_impossible()
    }

    /// Names of all tags referenced, sorted and deduplicated.
    pub fn referenced_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self
            .iter()
            .flat_map(|conditions| conditions.iter())
            .filter_map(|condition| match condition {
                Condition::Tag(c) => Some(c.name.clone()),
                _ => None,
            })
            .collect();
        tags.sort();
        tags.dedup();
        tags
    }

    /// True when some time condition depends on the reference time, i.e. its result changes
    /// as "now" moves.
    pub fn has_relative_times(&self) -> bool {
        self.iter()
            .flat_map(|conditions| conditions.iter())
            .any(|condition| match condition {
                Condition::Time(c) => {
                    let factors: i64 = c.reference_time_factor
                        + c.summands
                            .iter()
                            .map(|s| s.ftime_factor + s.ltime_factor)
                            .sum::<i64>();
                    factors.rem_euclid(2) == 1
                }
                _ => false,
            })
    }

    /// Rebases absolute times, parsed relative to `old`, onto the reference time `new`.
    pub fn update_reference_time(&mut self, old: DateTime<Utc>, new: DateTime<Utc>) {
        let delta = nanos_between(old, new);
        if delta == 0 {
            return;
        }
        for conditions in self.iter_mut() {
            for condition in conditions.iter_mut() {
                if let Condition::Time(c) = condition {
                    if c.reference_time_factor != 0 {
                        c.duration = c
                            .duration
                            .saturating_add(delta.saturating_mul(c.reference_time_factor));
                    }
                }
            }
        }
    }
}

/// `to - from` in nanoseconds, saturated to the `i64` range.
pub(crate) fn nanos_between(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    (to - from).num_nanoseconds().unwrap_or(if to > from { i64::MAX } else { i64::MIN })
}

fn sub_query_prefix(sub_query: &str) -> String {
    if sub_query.is_empty() {
        String::new()
    } else {
        format!("@{}:", sub_query)
    }
}

fn write_factor(out: &mut String, factor: i64, term: &str) {
    if factor < 0 {
        out.push('-');
    } else if !out.is_empty() {
        out.push('+');
    }
    out.push_str(term);
    if factor != 1 && factor != -1 {
        out.push_str(&format!("*{}", factor.unsigned_abs()));
    }
}

/// Formats nanoseconds the way durations are written in queries (`1h30m0s`, `1.5ms`).
pub fn format_duration(nanos: i64) -> String {
    fn fraction(value: u64, scale: u64) -> String {
        let whole = value / scale;
        let rest = value % scale;
        if rest == 0 {
            return whole.to_string();
        }
        let digits = scale.ilog10() as usize;
        let rest = format!("{:0width$}", rest, width = digits);
        format!("{}.{}", whole, rest.trim_end_matches('0'))
    }

    let sign = if nanos < 0 { "-" } else { "" };
    let mut value = nanos.unsigned_abs();
    if value == 0 {
        return "0s".to_string();
    }
    if value < 1_000_000_000 {
        let (unit, scale) = match value {
            0..1_000 => ("ns", 1),
            1_000..1_000_000 => ("µs", 1_000),
            _ => ("ms", 1_000_000),
        };
        return format!("{}{}{}", sign, fraction(value, scale), unit);
    }
    let hours = value / 3_600_000_000_000;
    value %= 3_600_000_000_000;
    let minutes = value / 60_000_000_000;
    value %= 60_000_000_000;
    let mut out = sign.to_string();
    if hours > 0 {
        out.push_str(&format!("{}h", hours));
    }
    if hours > 0 || minutes > 0 {
        out.push_str(&format!("{}m", minutes));
    }
    out.push_str(&fraction(value, 1_000_000_000));
    out.push('s');
    out
}

impl fmt::Display for TagCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = sub_query_prefix(&self.sub_query);
        match self.accept {
            TAG_ACCEPT_MATCHING => write!(f, "{}tag:{}", prefix, self.name),
            TAG_ACCEPT_FAILING => write!(f, "-{}tag:{}", prefix, self.name),
            accept => {
                let states: Vec<&str> = [
                    (TAG_MATCHING, "matching"),
                    (TAG_FAILING, "failing"),
                    (TAG_UNCERTAIN_MATCHING, "uncertain-matching"),
                    (TAG_UNCERTAIN_FAILING, "uncertain-failing"),
                ]
                .into_iter()
                .filter(|(bit, _)| accept & bit != 0)
                .map(|(_, name)| name)
                .collect();
                write!(f, "{}tag[{}]:{}", prefix, states.join(","), self.name)
            }
        }
    }
}

impl fmt::Display for FlagCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (name, value) = if self.mask == PROTOCOL_MASK {
            let value = match self.value & PROTOCOL_MASK {
                0b00 => "0(other)",
                0b01 => "1(tcp)",
                0b10 => "2(udp)",
                _ => "3(sctp)",
            };
            ("protocol".to_string(), value.to_string())
        } else {
            (format!("flags&0x{:x}", self.mask), format!("0x{:x}", self.value))
        };
        let sources: Vec<String> = self
            .sub_queries
            .iter()
            .map(|sub_query| format!("{}{}", sub_query_prefix(sub_query), name))
            .collect();
        write!(f, "{} != {}", sources.join(" ^ "), value)
    }
}

impl fmt::Display for HostCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sources: Vec<String> = self
            .sources
            .iter()
            .map(|source| {
                let side = match source.side {
                    HostSide::Client => "chost",
                    HostSide::Server => "shost",
                };
                format!("{}{}", sub_query_prefix(&source.sub_query), side)
            })
            .collect();
        let host = match self.host {
            Some(host) => host.to_string(),
            None => "0".to_string(),
        };
        write!(
            f,
            "{} {} {}/{} or {}",
            sources.join(" ^ "),
            if self.invert { "!=" } else { "==" },
            host,
            Ipv4Addr::from(self.mask4),
            Ipv6Addr::from(self.mask6)
        )
    }
}

impl fmt::Display for NumberCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        for summand in &self.summands {
            let term = format!("{}{}", sub_query_prefix(&summand.sub_query), summand.field.name());
            write_factor(&mut out, summand.factor, &term);
        }
        if self.number != 0 || out.is_empty() {
            if self.number < 0 {
                out.push('-');
            } else if !out.is_empty() {
                out.push('+');
            }
            out.push_str(&self.number.unsigned_abs().to_string());
        }
        write!(f, "{} >= 0", out)
    }
}

impl fmt::Display for TimeCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        for summand in &self.summands {
            let prefix = sub_query_prefix(&summand.sub_query);
            for (factor, name) in [(summand.ftime_factor, "ftime"), (summand.ltime_factor, "ltime")] {
                if factor != 0 {
                    write_factor(&mut out, factor, &format!("{}{}", prefix, name));
                }
            }
        }
        if self.reference_time_factor != 0 {
            let factor = self.reference_time_factor;
            out.push(if factor < 0 { '-' } else { '+' });
            out.push_str("now");
            if factor != 1 && factor != -1 {
                out.push_str(&format!("*{}", factor.unsigned_abs()));
            }
        }
        if self.duration != 0 || out.is_empty() {
            if self.duration >= 0 {
                out.push('+');
            }
            out.push_str(&format_duration(self.duration));
        }
        write!(f, "{} >= 0", out)
    }
}

impl fmt::Display for DataCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let last = self.elements.len().saturating_sub(1);
        let parts: Vec<String> = self
            .elements
            .iter()
            .enumerate()
            .map(|(i, element)| {
                let direction = match element.direction {
                    Direction::ClientToServer => "cdata",
                    Direction::ServerToClient => "sdata",
                };
                let converter = match &element.converter {
                    Some(name) => format!(".{}", name),
                    None => String::new(),
                };
                format!(
                    "{}{}{}{}:{:?}",
                    if self.inverted && i == last { "-" } else { "" },
                    sub_query_prefix(&element.sub_query),
                    direction,
                    converter,
                    element.pattern()
                )
            })
            .collect();
        write!(f, "{}", parts.join(" > "))
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Tag(c) => c.fmt(f),
            Condition::Flag(c) => c.fmt(f),
            Condition::Host(c) => c.fmt(f),
            Condition::Number(c) => c.fmt(f),
            Condition::Time(c) => c.fmt(f),
            Condition::Data(c) => c.fmt(f),
            Condition::Impossible => write!(f, "false"),
        }
    }
}

impl fmt::Display for Conditions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "true");
        }
        let parts: Vec<String> = self.iter().map(|c| format!("({})", c)).collect();
        write!(f, "{}", parts.join(" & "))
    }
}

impl fmt::Display for ConditionsSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "false");
        }
        let parts: Vec<String> = self.iter().map(|c| c.to_string()).collect();
        write!(f, "{}", parts.join(" | "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_format_like_query_durations() {
        assert_eq!(format_duration(0), "0s");
        assert_eq!(format_duration(1), "1ns");
        assert_eq!(format_duration(1_500), "1.5µs");
        assert_eq!(format_duration(500_000_000), "500ms");
        assert_eq!(format_duration(-90 * 60 * 1_000_000_000), "-1h30m0s");
        assert_eq!(format_duration(61_250_000_000), "1m1.25s");
    }

    #[test]
    fn number_condition_string() {
        let condition = NumberCondition {
            summands: vec![
                NumberSummand {
                    sub_query: String::new(),
                    field: NumberField::ServerPort,
                    factor: 1,
                },
                NumberSummand {
                    sub_query: "a".to_string(),
                    field: NumberField::ClientPort,
                    factor: -2,
                },
            ],
            number: -80,
        };
        assert_eq!(condition.to_string(), "sport-@a:cport*2-80 >= 0");
    }

    #[test]
    fn data_pattern_restores_variables() {
        let element = DataElement {
            sub_query: String::new(),
            converter: Some("b64".to_string()),
            regex: "user=pass@".to_string(),
            variables: vec![DataVariable {
                position: 5,
                sub_query: "a".to_string(),
                name: "user".to_string(),
            }],
            direction: Direction::ClientToServer,
        };
        assert_eq!(element.pattern(), "user=@a:user@pass@@");
        let condition = DataCondition {
            elements: vec![element],
            inverted: true,
        };
        assert_eq!(condition.to_string(), r#"-cdata.b64:"user=@a:user@pass@@""#);
    }

    #[test]
    fn empty_sets_print_as_constants() {
        assert_eq!(ConditionsSet::always().to_string(), "true");
        assert_eq!(ConditionsSet::never().to_string(), "false");
        assert!(ConditionsSet::single(Condition::Impossible).is_impossible());
    }

    #[test]
    fn relative_times_are_detected() {
        let relative = ConditionsSet::single(Condition::Time(TimeCondition {
            summands: vec![TimeSummand {
                sub_query: String::new(),
                ftime_factor: 1,
                ltime_factor: 0,
            }],
            duration: 3_600_000_000_000,
            reference_time_factor: 0,
        }));
        assert!(relative.has_relative_times());
        let absolute = ConditionsSet::single(Condition::Time(TimeCondition {
            summands: vec![TimeSummand {
                sub_query: String::new(),
                ftime_factor: 1,
                ltime_factor: 0,
            }],
            duration: 3_600_000_000_000,
            reference_time_factor: 1,
        }));
        assert!(!absolute.has_relative_times());
    }
}
