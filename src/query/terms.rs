//! Translation of single query terms into conditions.

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::analysis::regex;
use crate::core::error::{Error, Result};
use crate::core::types::Direction;
use crate::query::conditions::*;
use crate::query::parser::Term;
use crate::query::value_parser::{
    self, HostValue, ListItem, NumberOperand, Range, Signed, StringElement, TimeOperand,
};

/// Conditions of a filter term. Control terms (`sort`, `limit`, `group`) are not filters and
/// are rejected here.
pub fn term_conditions(term: &Term, reference_time: DateTime<Utc>) -> Result<ConditionsSet> {
    let data_key = matches!(term.key.as_str(), "data" | "cdata" | "sdata");
    if term.converter.is_some() && !data_key {
        return Err(Error::parse(format!("{} does not take a converter", term.key)));
    }
    match term.key.as_str() {
        "tag" => tag_conditions(term, None),
        "service" | "mark" | "generated" => tag_conditions(term, Some(&term.key)),
        "protocol" => protocol_conditions(term),
        "host" => host_conditions(term, &[HostSide::Client, HostSide::Server]),
        "chost" => host_conditions(term, &[HostSide::Client]),
        "shost" => host_conditions(term, &[HostSide::Server]),
        "id" => number_conditions(term, &[NumberField::Id]),
        "port" => number_conditions(term, &[NumberField::ClientPort, NumberField::ServerPort]),
        "cport" => number_conditions(term, &[NumberField::ClientPort]),
        "sport" => number_conditions(term, &[NumberField::ServerPort]),
        "bytes" => number_conditions(term, &[NumberField::ClientBytes, NumberField::ServerBytes]),
        "cbytes" => number_conditions(term, &[NumberField::ClientBytes]),
        "sbytes" => number_conditions(term, &[NumberField::ServerBytes]),
        "time" | "ftime" | "ltime" => time_conditions(term, reference_time),
        "data" => data_conditions(term, &Direction::BOTH),
        "cdata" => data_conditions(term, &[Direction::ClientToServer]),
        "sdata" => data_conditions(term, &[Direction::ServerToClient]),
        key => Err(Error::parse(format!("{} is not a filter", key))),
    }
}

fn tag_conditions(term: &Term, prefix: Option<&str>) -> Result<ConditionsSet> {
    let mut result = ConditionsSet::never();
    for name in term.value.split(',') {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::parse(format!("empty tag name in {:?}", term.value)));
        }
        let name = match prefix {
            Some(prefix) => format!("{}/{}", prefix, name),
            None => name.to_string(),
        };
        result.push(Conditions(vec![Condition::Tag(TagCondition {
            sub_query: term.sub_query.clone(),
            name,
            accept: TAG_ACCEPT_MATCHING,
        })]));
    }
    Ok(result)
}

fn protocol_conditions(term: &Term) -> Result<ConditionsSet> {
    let mut result = ConditionsSet::never();
    for item in value_parser::parse_token_list(&term.value)? {
        let condition = match item {
            ListItem::Variable(variable) => {
                if variable.name != "protocol" {
                    return Err(Error::parse(format!(
                        "protocol filters only take protocol variables, not {}",
                        variable
                    )));
                }
                if variable.sub_query == term.sub_query {
                    result.push(Conditions::new());
                    continue;
                }
                FlagCondition {
                    sub_queries: vec![term.sub_query.clone(), variable.sub_query],
                    value: 0,
                    mask: PROTOCOL_MASK,
                }
            }
            ListItem::Token(token) => {
                let value = match token.to_ascii_lowercase().as_str() {
                    "other" => 0b00,
                    "tcp" => 0b01,
                    "udp" => 0b10,
                    "sctp" => 0b11,
                    _ => return Err(Error::parse(format!("unknown protocol {:?}", token))),
                };
                FlagCondition {
                    sub_queries: vec![term.sub_query.clone()],
                    value,
                    mask: PROTOCOL_MASK,
                }
            }
        };
        result = result.or(Condition::Flag(condition).invert());
    }
    Ok(result)
}

fn host_conditions(term: &Term, sides: &[HostSide]) -> Result<ConditionsSet> {
    let items = value_parser::parse_host_list(&term.value)?;
    let mut result = ConditionsSet::never();
    for &side in sides {
        for item in &items {
            let (mask4, mask6) = value_parser::build_masks(&item.masks)?;
            let mut condition = HostCondition {
                sources: vec![HostSource {
                    sub_query: term.sub_query.clone(),
                    side,
                }],
                host: None,
                mask4,
                mask6,
                invert: false,
            };
            match &item.value {
                HostValue::Address(address) => condition.host = Some(*address),
                HostValue::Variable(variable) => {
                    let side = match variable.name.as_str() {
                        "chost" => HostSide::Client,
                        "shost" => HostSide::Server,
                        _ => {
                            return Err(Error::parse(format!(
                                "host filters only take chost and shost variables, not {}",
                                variable
                            )));
                        }
                    };
                    condition.sources.push(HostSource {
                        sub_query: variable.sub_query.clone(),
                        side,
                    });
                }
            }
            result.push(Conditions(vec![Condition::Host(condition)]));
        }
    }
    Ok(result)
}

fn out_of_range(value: &str) -> Error {
    Error::parse(format!("number out of range in {:?}", value))
}

fn add_number_summand(summands: &mut Vec<NumberSummand>, sub_query: &str, field: NumberField, factor: i64) {
    match summands
        .iter_mut()
        .find(|s| s.sub_query == sub_query && s.field == field)
    {
        Some(summand) => summand.factor += factor,
        None => summands.push(NumberSummand {
            sub_query: sub_query.to_string(),
            field,
            factor,
        }),
    }
    summands.retain(|s| s.factor != 0);
}

fn number_bound(term: &Term, side: &[Signed<NumberOperand>]) -> Result<NumberCondition> {
    let mut condition = NumberCondition {
        summands: Vec::new(),
        number: 0,
    };
    for part in side {
        let factor = if part.negative { -1 } else { 1 };
        match &part.operand {
            NumberOperand::Number(n) => {
                condition.number = condition
                    .number
                    .checked_add(factor * n)
                    .ok_or_else(|| out_of_range(&term.value))?;
            }
            NumberOperand::Variable(variable) => {
                let field = NumberField::from_name(&variable.name).ok_or_else(|| {
                    Error::parse(format!(
                        "number filters only take id, cport, sport, cbytes and sbytes variables, not {}",
                        variable
                    ))
                })?;
                add_number_summand(&mut condition.summands, &variable.sub_query, field, factor);
            }
        }
    }
    Ok(condition)
}

/// Splits a range into its lower and upper bound, `None` for an open side.
fn bounds<T>(range: &Range<T>) -> [Option<&[Signed<T>]>; 2] {
    fn non_empty<T>(parts: &[Signed<T>]) -> Option<&[Signed<T>]> {
        if parts.is_empty() { None } else { Some(parts) }
    }
    let lower = non_empty(&range.lower);
    let upper = match &range.upper {
        Some(upper) => non_empty(upper),
        None => lower,
    };
    [lower, upper]
}

fn number_conditions(term: &Term, fields: &[NumberField]) -> Result<ConditionsSet> {
    let mut result = ConditionsSet::never();
    for range in value_parser::parse_number_ranges(&term.value)? {
        let bounds = bounds(&range);
        for &field in fields {
            let mut clause = Conditions::new();
            for (i, bound) in bounds.iter().enumerate() {
                let Some(bound) = bound else {
                    continue;
                };
                // bound - field >= 0
                let mut condition = number_bound(term, bound)?;
                add_number_summand(&mut condition.summands, &term.sub_query, field, -1);
                if i == 0 {
                    // field - bound >= 0
                    condition.number = condition
                        .number
                        .checked_neg()
                        .ok_or_else(|| out_of_range(&term.value))?;
                    for summand in &mut condition.summands {
                        summand.factor = -summand.factor;
                    }
                }
                clause.push(Condition::Number(condition));
            }
            result.push(clause);
        }
    }
    Ok(result)
}

fn add_time_summand(summands: &mut Vec<TimeSummand>, sub_query: &str, ftime_factor: i64, ltime_factor: i64) {
    match summands.iter_mut().find(|s| s.sub_query == sub_query) {
        Some(summand) => {
            summand.ftime_factor += ftime_factor;
            summand.ltime_factor += ltime_factor;
        }
        None => summands.push(TimeSummand {
            sub_query: sub_query.to_string(),
            ftime_factor,
            ltime_factor,
        }),
    }
    summands.retain(|s| s.ftime_factor != 0 || s.ltime_factor != 0);
}

fn time_bound(
    term: &Term,
    side: &[Signed<TimeOperand>],
    reference_time: DateTime<Utc>,
) -> Result<TimeCondition> {
    let mut condition = TimeCondition {
        summands: Vec::new(),
        duration: 0,
        reference_time_factor: 0,
    };
    for part in side {
        let factor = if part.negative { -1 } else { 1 };
        match &part.operand {
            TimeOperand::Duration(nanos) => {
                condition.duration = condition
                    .duration
                    .checked_add(factor * nanos)
                    .ok_or_else(|| out_of_range(&term.value))?;
            }
            TimeOperand::Time { date, time } => {
                let date = date.unwrap_or_else(|| reference_time.date_naive());
                let absolute = NaiveDateTime::new(date, *time).and_utc();
                let offset = nanos_between(reference_time, absolute);
                condition.duration = condition
                    .duration
                    .checked_add(factor * offset)
                    .ok_or_else(|| out_of_range(&term.value))?;
                condition.reference_time_factor -= factor;
            }
            TimeOperand::Variable(variable) => {
                let (ftime, ltime) = match variable.name.as_str() {
                    "ftime" => (factor, 0),
                    "ltime" => (0, factor),
                    _ => {
                        return Err(Error::parse(format!(
                            "time filters only take ftime and ltime variables, not {}",
                            variable
                        )));
                    }
                };
                add_time_summand(&mut condition.summands, &variable.sub_query, ftime, ltime);
            }
        }
    }
    Ok(condition)
}

fn time_conditions(term: &Term, reference_time: DateTime<Utc>) -> Result<ConditionsSet> {
    let mut result = ConditionsSet::never();
    for range in value_parser::parse_time_ranges(&term.value)? {
        let mut clause = Conditions::new();
        for (i, bound) in bounds(&range).iter().enumerate() {
            let Some(bound) = bound else {
                continue;
            };
            // the lower bound of `time` limits the last packet, the upper one the first
            let (ftime, ltime) = match (term.key.as_str(), i) {
                ("ftime", _) | ("time", 1) => (-1, 0),
                _ => (0, -1),
            };
            let mut condition = time_bound(term, bound, reference_time)?;
            add_time_summand(&mut condition.summands, &term.sub_query, ftime, ltime);
            if i == 0 {
                condition.duration = condition
                    .duration
                    .checked_neg()
                    .ok_or_else(|| out_of_range(&term.value))?;
                condition.reference_time_factor = -condition.reference_time_factor;
                for summand in &mut condition.summands {
                    summand.ftime_factor = -summand.ftime_factor;
                    summand.ltime_factor = -summand.ltime_factor;
                }
            }
            clause.push(Condition::Time(condition));
        }
        result.push(clause);
    }
    Ok(result)
}

fn data_conditions(term: &Term, directions: &[Direction]) -> Result<ConditionsSet> {
    let mut content = String::new();
    let mut test_content = String::new();
    let mut variables = Vec::new();
    for element in value_parser::parse_string(&term.value)? {
        match element {
            StringElement::Text(text) => {
                content.push_str(&text);
                test_content.push_str(&text);
            }
            StringElement::Variable(variable) => {
                test_content.push_str("(?:test)");
                variables.push(DataVariable {
                    position: content.len(),
                    sub_query: variable.sub_query,
                    name: variable.name,
                });
            }
        }
    }
    regex::compile(&test_content)?;

    let mut result = ConditionsSet::never();
    for &direction in directions {
        result.push(Conditions(vec![Condition::Data(DataCondition {
            elements: vec![DataElement {
                sub_query: term.sub_query.clone(),
                converter: term.converter.clone(),
                regex: content.clone(),
                variables: variables.clone(),
                direction,
            }],
            inverted: false,
        })]));
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;
    use chrono::TimeZone;

    fn term(sub_query: &str, key: &str, value: &str) -> Term {
        Term {
            sub_query: sub_query.to_string(),
            key: key.to_string(),
            converter: None,
            value: value.to_string(),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn render(term: &Term) -> String {
        term_conditions(term, now()).unwrap().to_string()
    }

    #[test]
    fn numbers_become_inequalities() {
        assert_eq!(render(&term("", "sport", "80")), "(sport-80 >= 0) & (-sport+80 >= 0)");
        assert_eq!(render(&term("", "cbytes", ":100")), "(-cbytes+100 >= 0)");
        assert_eq!(
            render(&term("", "port", "22,443")),
            "(cport-22 >= 0) & (-cport+22 >= 0) | (sport-22 >= 0) & (-sport+22 >= 0) | \
             (cport-443 >= 0) & (-cport+443 >= 0) | (sport-443 >= 0) & (-sport+443 >= 0)"
        );
        assert_eq!(
            render(&term("b", "sport", "@a:cport@+1:")),
            "(-@a:cport+@b:sport-1 >= 0)"
        );
        // a variable on the term's own field cancels out
        assert_eq!(render(&term("", "id", "@id@:")), "(0 >= 0)");
    }

    #[test]
    fn times_are_relative_to_the_reference() {
        assert_eq!(render(&term("", "ftime", "-1h:")), "(ftime+1h0m0s >= 0)");
        let set = term_conditions(&term("", "ltime", ":1100"), now()).unwrap();
        let Condition::Time(condition) = &set[0][0] else {
            panic!("expected a time condition");
        };
        assert_eq!(condition.duration, -3_600_000_000_000);
        assert_eq!(condition.reference_time_factor, -1);
        assert_eq!(condition.summands[0].ltime_factor, -1);
    }

    #[test]
    fn time_window_overlaps() {
        let set = term_conditions(&term("", "time", "-2h:-1h"), now()).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set[0].len(), 2);
        assert_eq!(set.to_string(), "(ltime+2h0m0s >= 0) & (-ftime-1h0m0s >= 0)");
    }

    #[test]
    fn protocols_and_tags() {
        assert_eq!(
            render(&term("", "protocol", "tcp")),
            "(protocol != 0(other)) & (protocol != 3(sctp)) & (protocol != 2(udp))"
        );
        assert_eq!(render(&term("a", "protocol", "@a:protocol@")), "true");
        assert!(term_conditions(&term("", "protocol", "icmp"), now()).is_err());
        assert_eq!(render(&term("", "service", "http")), "(tag:service/http)");
        assert_eq!(render(&term("x", "tag", "a, b")), "(@x:tag:a) | (@x:tag:b)");
    }

    #[test]
    fn hosts() {
        let set = term_conditions(&term("", "host", "10.0.0.0/8"), now()).unwrap();
        assert_eq!(set.len(), 2);
        let Condition::Host(client) = &set[0][0] else {
            panic!("expected a host condition");
        };
        assert_eq!(client.sources[0].side, HostSide::Client);
        assert_eq!(client.mask4, [0xff, 0, 0, 0]);

        let set = term_conditions(&term("", "chost", "@a:shost@"), now()).unwrap();
        let Condition::Host(condition) = &set[0][0] else {
            panic!("expected a host condition");
        };
        assert_eq!(condition.host, None);
        assert_eq!(condition.sources.len(), 2);
        assert_eq!(condition.sources[1].sub_query, "a");

        let err = term_conditions(&term("", "chost", "@a:sport@"), now()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Parse);
    }

    #[test]
    fn data_terms() {
        let set = term_conditions(&term("", "data", "user @a:name@!"), now()).unwrap();
        assert_eq!(set.len(), 2);
        let Condition::Data(condition) = &set[1][0] else {
            panic!("expected a data condition");
        };
        assert_eq!(condition.elements[0].direction, Direction::ServerToClient);
        assert_eq!(condition.elements[0].regex, "user !");
        assert_eq!(condition.elements[0].variables[0].position, 5);

        let err = term_conditions(&term("", "cdata", "(unclosed"), now()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Regex);

        let mut with_converter = term("", "sport", "80");
        with_converter.converter = Some("b64".to_string());
        assert!(term_conditions(&with_converter, now()).is_err());
    }
}
