//! Boolean algebra over conditions: inversion, the `and`/`or`/`then` combinators and the
//! simplifier.

use std::collections::{BTreeMap, BTreeSet};

use crate::bitmask::Bitmask;
use crate::query::conditions::*;
use crate::search::converters::TagSnapshot;

impl Condition {
    /// The negation of this condition in disjunctive normal form.
    pub fn invert(&self) -> ConditionsSet {
        match self {
            Condition::Tag(c) => ConditionsSet::single(Condition::Tag(TagCondition {
                accept: c.accept ^ TAG_ACCEPT_ALL,
                ..c.clone()
            })),
            Condition::Flag(c) => {
                // xor & mask == value <=> xor & mask differs from every other value
                let own = c.value & c.mask;
                let mut conditions = Conditions::new();
                let mut value = own;
                loop {
                    value = value.wrapping_sub(1) & c.mask;
                    if value == own {
                        break;
                    }
                    conditions.push(Condition::Flag(FlagCondition {
                        sub_queries: c.sub_queries.clone(),
                        value,
                        mask: c.mask,
                    }));
                }
                ConditionsSet(vec![conditions])
            }
            Condition::Host(c) => ConditionsSet::single(Condition::Host(HostCondition {
                invert: !c.invert,
                ..c.clone()
            })),
            // !(n >= 0) <=> -n-1 >= 0
            Condition::Number(c) => ConditionsSet::single(Condition::Number(NumberCondition {
                summands: c
                    .summands
                    .iter()
                    .map(|s| NumberSummand {
                        factor: -s.factor,
                        ..s.clone()
                    })
                    .collect(),
                number: -c.number - 1,
            })),
            Condition::Time(c) => ConditionsSet::single(Condition::Time(TimeCondition {
                summands: c
                    .summands
                    .iter()
                    .map(|s| TimeSummand {
                        sub_query: s.sub_query.clone(),
                        ftime_factor: -s.ftime_factor,
                        ltime_factor: -s.ltime_factor,
                    })
                    .collect(),
                duration: -c.duration - 1,
                reference_time_factor: -c.reference_time_factor,
            })),
            // !(a > b > c) = !a | a > !b | a > b > !c
            Condition::Data(c) => ConditionsSet(
                (1..=c.elements.len())
                    .map(|len| {
                        Conditions(vec![Condition::Data(DataCondition {
                            elements: c.elements[..len].to_vec(),
                            inverted: if len == c.elements.len() { !c.inverted } else { true },
                        })])
                    })
                    .collect(),
            ),
            Condition::Impossible => ConditionsSet::always(),
        }
    }

    fn rename_sub_query(&mut self, from: &str, to: &str) {
        let rename = |name: &mut String| {
            if name.as_str() == from {
                *name = to.to_string();
            }
        };
        match self {
            Condition::Tag(c) => rename(&mut c.sub_query),
            Condition::Flag(c) => c.sub_queries.iter_mut().for_each(rename),
            Condition::Host(c) => c.sources.iter_mut().for_each(|s| rename(&mut s.sub_query)),
            Condition::Number(c) => c.summands.iter_mut().for_each(|s| rename(&mut s.sub_query)),
            Condition::Time(c) => c.summands.iter_mut().for_each(|s| rename(&mut s.sub_query)),
            Condition::Data(c) => {
                for element in &mut c.elements {
                    rename(&mut element.sub_query);
                    element.variables.iter_mut().for_each(|v| rename(&mut v.sub_query));
                }
            }
            Condition::Impossible => {}
        }
    }
}

impl Conditions {
    /// !(a & b & c) = !a | !b | !c
    pub fn invert(&self) -> ConditionsSet {
        let mut result = ConditionsSet::never();
        for condition in self.iter() {
            result = result.or(condition.invert());
        }
        result
    }

    pub fn and(&self, other: &Conditions) -> Conditions {
        let mut all = self.clone();
        all.extend(other.iter().cloned());
        all.clean()
    }

    /// Appends the data sequences of `other` to those of `self`. Other conditions are combined
    /// with `and`.
    pub fn then(&self, other: &Conditions) -> Conditions {
        let mut result = Conditions::new();
        let mut left = Vec::new();
        let mut right = Vec::new();
        for (source, data) in [(self, &mut left), (other, &mut right)] {
            for condition in source.iter() {
                match condition {
                    Condition::Data(c) => data.push(c),
                    other => result.push(other.clone()),
                }
            }
        }
        if left.is_empty() || right.is_empty() {
            result.extend(left.into_iter().chain(right).cloned().map(Condition::Data));
            return result.clean();
        }
        for a in left {
            let mut prefix_len = a.elements.len();
            if a.inverted {
                result.push(Condition::Data(a.clone()));
                prefix_len -= 1;
            }
            for b in &right {
                let mut elements = a.elements[..prefix_len].to_vec();
                elements.extend(b.elements.iter().cloned());
                result.push(Condition::Data(DataCondition {
                    elements,
                    inverted: b.inverted,
                }));
            }
        }
        result.clean()
    }

    /// Simplifies the clause into its canonical form, or `[Impossible]` when it can never be
    /// fulfilled.
    pub fn clean(&self) -> Conditions {
        let mut tags = Vec::new();
        let mut flags = Vec::new();
        let mut hosts = Vec::new();
        let mut numbers = Vec::new();
        let mut times = Vec::new();
        let mut data = Vec::new();
        for condition in self.iter() {
            match condition {
                Condition::Tag(c) => tags.push(c.clone()),
                Condition::Flag(c) => flags.push(c.clone()),
                Condition::Host(c) => hosts.push(c.clone()),
                Condition::Number(c) => numbers.push(c.clone()),
                Condition::Time(c) => times.push(c.clone()),
                Condition::Data(c) => data.push(c.clone()),
                Condition::Impossible => return Conditions(vec![Condition::Impossible]),
            }
        }
        let possible = clean_tags(&mut tags)
            && clean_flags(&mut flags)
            && clean_hosts(&mut hosts)
            && clean_numbers(&mut numbers)
            && clean_times(&mut times)
            && clean_data(&mut data);
        if !possible {
            return Conditions(vec![Condition::Impossible]);
        }
        let mut result = Conditions::new();
        result.extend(tags.into_iter().map(Condition::Tag));
        result.extend(flags.into_iter().map(Condition::Flag));
        result.extend(hosts.into_iter().map(Condition::Host));
        result.extend(numbers.into_iter().map(Condition::Number));
        result.extend(times.into_iter().map(Condition::Time));
        result.extend(data.into_iter().map(Condition::Data));
        result
    }

    fn rename_sub_query(&mut self, from: &str, to: &str) {
        for condition in self.iter_mut() {
            condition.rename_sub_query(from, to);
        }
    }
}

impl ConditionsSet {
    /// !(a | b | c) = !a & !b & !c
    pub fn invert(&self) -> ConditionsSet {
        let mut result = ConditionsSet::always();
        for conditions in self.iter() {
            result = result.and(&conditions.invert());
        }
        result
    }

    pub fn and(&self, other: &ConditionsSet) -> ConditionsSet {
        let mut result = ConditionsSet::never();
        for a in self.iter() {
            for b in other.iter() {
                result.push(a.and(b));
            }
        }
        result
    }

    pub fn or(&self, other: ConditionsSet) -> ConditionsSet {
        let mut result = self.clone();
        result.extend(other.0);
        result
    }

    pub fn then(&self, other: &ConditionsSet) -> ConditionsSet {
        let mut result = ConditionsSet::never();
        for a in self.iter() {
            for b in other.iter() {
                result.push(a.then(b));
            }
        }
        result
    }

    /// Cleans every clause, drops impossible and subsumed clauses, and collapses a set of only
    /// impossible clauses into `[[Impossible]]`.
    pub fn clean(&self) -> ConditionsSet {
        let mut current = self.clean_once();
        loop {
            let next = current.clean_once();
            if next == current {
                return current;
            }
            current = next;
        }
    }

    fn clean_once(&self) -> ConditionsSet {
        let mut result: Vec<Conditions> = Vec::new();
        'clauses: for clause in self.iter() {
            let clause = clause.clean();
            if clause.is_impossible() {
                continue;
            }
            for existing in result.iter_mut() {
                if *existing == clause {
                    continue 'clauses;
                }
                let both = clause.and(existing);
                if both == clause {
                    // clause is stricter than an existing one
                    continue 'clauses;
                }
                if both == *existing {
                    *existing = clause;
                    continue 'clauses;
                }
            }
            result.push(clause);
        }
        if result.is_empty() && !self.is_empty() {
            return ConditionsSet::single(Condition::Impossible);
        }
        ConditionsSet(result)
    }

    /// Expands tag conditions on tags with uncertain streams into
    /// `certain states | (uncertain & definition)`.
    ///
    /// Only tags whose definition uses no named sub-query are expanded, each at most once.
    /// Unknown tags are left alone.
    pub fn inline_tag_filters(&self, tags: &TagSnapshot) -> ConditionsSet {
        let mut result = self.clone();
        let mut inlined = BTreeSet::new();
        loop {
            let next = result.referenced_tags().into_iter().find(|name| {
                !inlined.contains(name)
                    && tags.get(name).is_some_and(|details| {
                        !details.uncertain.is_zero()
                            && details.conditions.iter().all(|conditions| {
                                conditions
                                    .iter()
                                    .all(|c| c.sub_queries().iter().all(|sq| sq.is_empty()))
                            })
                    })
            });
            let Some(name) = next else {
                break;
            };
            let Some(details) = tags.get(&name) else {
                break;
            };
            result = result.inline_tag(&name, &details.conditions);
            inlined.insert(name);
        }
        result.clean()
    }

    fn inline_tag(&self, name: &str, definition: &ConditionsSet) -> ConditionsSet {
        let mut result = ConditionsSet::never();
        for clause in self.iter() {
            let mut expanded = ConditionsSet::always();
            let mut others = Conditions::new();
            for condition in clause.iter() {
                match condition {
                    Condition::Tag(c) if c.name == name => {
                        expanded = expanded.and(&expand_tag(c, definition));
                    }
                    other => others.push(other.clone()),
                }
            }
            result = result.or(expanded.and(&ConditionsSet(vec![others])));
        }
        result
    }
}

fn expand_tag(condition: &TagCondition, definition: &ConditionsSet) -> ConditionsSet {
    let tag = |accept| {
        ConditionsSet::single(Condition::Tag(TagCondition {
            accept,
            ..condition.clone()
        }))
    };
    let mut result = ConditionsSet::never();
    let certain = condition.accept & TAG_CERTAIN;
    if certain != 0 {
        result = result.or(tag(certain));
    }
    let mut renamed = definition.clone();
    for conditions in renamed.iter_mut() {
        conditions.rename_sub_query("", &condition.sub_query);
    }
    let uncertain = match condition.accept & TAG_UNCERTAIN {
        0 => ConditionsSet::never(),
        TAG_UNCERTAIN => tag(TAG_UNCERTAIN),
        TAG_UNCERTAIN_MATCHING => tag(TAG_UNCERTAIN).and(&renamed),
        _ => tag(TAG_UNCERTAIN).and(&renamed.invert()),
    };
    result.or(uncertain)
}

fn clean_tags(tags: &mut Vec<TagCondition>) -> bool {
    let mut accepted: BTreeMap<(String, String), u8> = BTreeMap::new();
    for tag in tags.drain(..) {
        *accepted.entry((tag.sub_query, tag.name)).or_insert(TAG_ACCEPT_ALL) &= tag.accept;
    }
    for ((sub_query, name), accept) in accepted {
        match accept {
            0 => return false,
            TAG_ACCEPT_ALL => {}
            accept => tags.push(TagCondition {
                sub_query,
                name,
                accept,
            }),
        }
    }
    true
}

/// Values `v` with `v & !mask == 0`, from `mask` down to 0.
fn subsets(mask: u16) -> impl Iterator<Item = u16> {
    let mut next = Some(mask);
    std::iter::from_fn(move || {
        let current = next?;
        next = if current == 0 { None } else { Some((current - 1) & mask) };
        Some(current)
    })
}

/// Removes sub-query names occurring an even number of times; `x ^ x` cancels.
fn cancel_pairs<T: Ord>(items: &mut Vec<T>) {
    items.sort();
    let mut result: Vec<T> = Vec::with_capacity(items.len());
    for item in items.drain(..) {
        if result.last() == Some(&item) {
            result.pop();
        } else {
            result.push(item);
        }
    }
    *items = result;
}

fn clean_flags(flags: &mut Vec<FlagCondition>) -> bool {
    // forbidden values of xor(flags) per sub-query combination
    let mut groups: BTreeMap<Vec<String>, Vec<FlagCondition>> = BTreeMap::new();
    for mut flag in flags.drain(..) {
        cancel_pairs(&mut flag.sub_queries);
        if flag.sub_queries.is_empty() {
            if flag.value & flag.mask == 0 {
                return false;
            }
            continue;
        }
        groups.entry(flag.sub_queries.clone()).or_default().push(flag);
    }
    for (sub_queries, group) in groups {
        let union = group.iter().fold(0, |mask, flag| mask | flag.mask);
        let forbidden: BTreeSet<u16> = subsets(union)
            .filter(|v| group.iter().any(|flag| v & flag.mask == flag.value & flag.mask))
            .collect();
        let mut mask = 0;
        for bit in (0..16).map(|b| 1u16 << b).filter(|bit| union & bit != 0) {
            if subsets(union).any(|v| forbidden.contains(&v) != forbidden.contains(&(v ^ bit))) {
                mask |= bit;
            }
        }
        if mask == 0 {
            if forbidden.contains(&0) {
                return false;
            }
            continue;
        }
        for value in subsets(mask).filter(|v| forbidden.contains(v)) {
            flags.push(FlagCondition {
                sub_queries: sub_queries.clone(),
                value,
                mask,
            });
        }
    }
    flags.sort_by(|a, b| {
        (a.sub_queries.len(), &a.sub_queries, a.mask, a.value)
            .cmp(&(b.sub_queries.len(), &b.sub_queries, b.mask, b.value))
    });
    true
}

fn masked_host(host: &mut Option<std::net::IpAddr>, mask4: &[u8; 4], mask6: &[u8; 16]) -> bool {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
    let masked = match *host {
        None => None,
        Some(IpAddr::V4(v4)) => {
            let mut octets = v4.octets();
            octets.iter_mut().zip(mask4).for_each(|(o, m)| *o &= m);
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        Some(IpAddr::V6(v6)) => {
            let mut octets = v6.octets();
            octets.iter_mut().zip(mask6).for_each(|(o, m)| *o &= m);
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
    };
    *host = masked;
    match masked {
        None => true,
        Some(IpAddr::V4(v4)) => v4.octets() == [0; 4],
        Some(IpAddr::V6(v6)) => v6.octets() == [0; 16],
    }
}

fn clean_hosts(hosts: &mut Vec<HostCondition>) -> bool {
    let mut kept = Vec::with_capacity(hosts.len());
    for mut host in hosts.drain(..) {
        cancel_pairs(&mut host.sources);
        let zero = masked_host(&mut host.host, &host.mask4, &host.mask6);
        if host.sources.is_empty() {
            // xor of no hosts is zero
            if zero == host.invert {
                return false;
            }
            continue;
        }
        kept.push(host);
    }
    kept.sort_by(|a, b| {
        (a.sources.len(), &a.sources, a.host, a.mask4, a.mask6, a.invert)
            .cmp(&(b.sources.len(), &b.sources, b.host, b.mask4, b.mask6, b.invert))
    });
    let mut i = 1;
    while i < kept.len() {
        let (a, b) = (&kept[i - 1], &kept[i]);
        if a.sources == b.sources && a.host == b.host && a.mask4 == b.mask4 && a.mask6 == b.mask6 {
            if a.invert != b.invert {
                return false;
            }
            kept.remove(i);
            continue;
        }
        i += 1;
    }
    *hosts = kept;
    true
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

fn clean_numbers(numbers: &mut Vec<NumberCondition>) -> bool {
    let mut kept = Vec::with_capacity(numbers.len());
    for mut number in numbers.drain(..) {
        let mut merged: BTreeMap<(String, NumberField), i64> = BTreeMap::new();
        for summand in number.summands.drain(..) {
            *merged.entry((summand.sub_query, summand.field)).or_default() += summand.factor;
        }
        number.summands = merged
            .into_iter()
            .filter(|(_, factor)| *factor != 0)
            .map(|((sub_query, field), factor)| NumberSummand {
                sub_query,
                field,
                factor,
            })
            .collect();
        if number.summands.is_empty() {
            if number.number < 0 {
                return false;
            }
            continue;
        }
        let divisor = number
            .summands
            .iter()
            .fold(0, |g, s| gcd(g, s.factor.unsigned_abs()));
        if divisor > 1 {
            let divisor = divisor as i64;
            // sum(k * g * x) >= -n <=> sum(k * x) >= ceil(-n / g) = -floor(n / g)
            number.number = number.number.div_euclid(divisor);
            number.summands.iter_mut().for_each(|s| s.factor /= divisor);
        }
        // fields are never negative
        let all_positive = number.number >= 0 && number.summands.iter().all(|s| s.factor > 0);
        let all_negative = number.number < 0 && number.summands.iter().all(|s| s.factor < 0);
        if all_positive {
            continue;
        }
        if all_negative {
            return false;
        }
        kept.push(number);
    }
    kept.sort();
    // of two conditions with equal summands the one with the smaller number is stricter
    kept.dedup_by(|later, earlier| later.summands == earlier.summands);
    // s + a >= 0 and -s + b >= 0 need a + b >= 0
    for (i, a) in kept.iter().enumerate() {
        for b in &kept[i + 1..] {
            let opposite = a.summands.len() == b.summands.len()
                && a.summands.iter().zip(&b.summands).all(|(x, y)| {
                    x.sub_query == y.sub_query && x.field == y.field && x.factor == -y.factor
                });
            if opposite && a.number.saturating_add(b.number) < 0 {
                return false;
            }
        }
    }
    *numbers = kept;
    true
}

fn clean_times(times: &mut Vec<TimeCondition>) -> bool {
    let mut kept = Vec::with_capacity(times.len());
    for mut time in times.drain(..) {
        let mut merged: BTreeMap<String, (i64, i64)> = BTreeMap::new();
        for summand in time.summands.drain(..) {
            let entry = merged.entry(summand.sub_query).or_default();
            entry.0 += summand.ftime_factor;
            entry.1 += summand.ltime_factor;
        }
        time.summands = merged
            .into_iter()
            .filter(|(_, factors)| *factors != (0, 0))
            .map(|(sub_query, (ftime_factor, ltime_factor))| TimeSummand {
                sub_query,
                ftime_factor,
                ltime_factor,
            })
            .collect();
        match time.summands.as_slice() {
            [] => {
                if time.duration < 0 {
                    return false;
                }
                continue;
            }
            // k * (ftime - ltime) is never positive for k > 0 and never negative for k < 0
            [only] if only.ftime_factor + only.ltime_factor == 0 => {
                if only.ftime_factor > 0 {
                    if time.duration < 0 {
                        return false;
                    }
                } else if time.duration >= 0 {
                    continue;
                }
            }
            _ => {}
        }
        kept.push(time);
    }
    kept.sort_by(|a, b| {
        (&a.summands, a.reference_time_factor, a.duration)
            .cmp(&(&b.summands, b.reference_time_factor, b.duration))
    });
    kept.dedup_by(|later, earlier| {
        later.summands == earlier.summands
            && later.reference_time_factor == earlier.reference_time_factor
    });
    for (i, a) in kept.iter().enumerate() {
        for b in &kept[i + 1..] {
            let opposite = a.summands.len() == b.summands.len()
                && a.summands.iter().zip(&b.summands).all(|(x, y)| {
                    x.sub_query == y.sub_query
                        && x.ftime_factor == -y.ftime_factor
                        && x.ltime_factor == -y.ltime_factor
                });
            if opposite && a.duration.saturating_add(b.duration) < 0 {
                return false;
            }
        }
    }
    *times = kept;
    true
}

fn clean_data(data: &mut Vec<DataCondition>) -> bool {
    data.sort();
    let mut i = 1;
    while i < data.len() {
        let (a, b) = (&data[i - 1], &data[i]);
        if !b.elements.starts_with(&a.elements) {
            i += 1;
            continue;
        }
        if a.elements.len() == b.elements.len() {
            if a.inverted != b.inverted {
                return false;
            }
            data.remove(i);
            continue;
        }
        // b needs every element of the shorter a to match
        if a.inverted {
            return false;
        }
        data.remove(i - 1);
        i = i.saturating_sub(1).max(1);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Direction;

    fn port(field: NumberField, sub_query: &str, factor: i64, number: i64) -> Condition {
        Condition::Number(NumberCondition {
            summands: vec![NumberSummand {
                sub_query: sub_query.to_string(),
                field,
                factor,
            }],
            number,
        })
    }

    fn protocol(value: u16) -> Condition {
        Condition::Flag(FlagCondition {
            sub_queries: vec![String::new()],
            value,
            mask: PROTOCOL_MASK,
        })
    }

    fn data(regexes: &[&str], inverted: bool) -> Condition {
        Condition::Data(DataCondition {
            elements: regexes
                .iter()
                .map(|regex| DataElement {
                    sub_query: String::new(),
                    converter: None,
                    regex: regex.to_string(),
                    variables: Vec::new(),
                    direction: Direction::ClientToServer,
                })
                .collect(),
            inverted,
        })
    }

    fn tag(name: &str, accept: u8) -> Condition {
        Condition::Tag(TagCondition {
            sub_query: String::new(),
            name: name.to_string(),
            accept,
        })
    }

    #[test]
    fn flag_inversion_enumerates_other_values() {
        // protocol != tcp, inverted: protocol is tcp
        let inverted = protocol(1).invert();
        assert_eq!(inverted.len(), 1);
        let values: Vec<u16> = inverted[0]
            .iter()
            .map(|c| match c {
                Condition::Flag(f) => f.value,
                _ => panic!("unexpected {}", c),
            })
            .collect();
        assert_eq!(values, vec![0, 3, 2]);
        let cleaned = inverted.clean();
        assert_eq!(cleaned.to_string(), "(protocol != 0(other)) & (protocol != 2(udp)) & (protocol != 3(sctp))");
    }

    #[test]
    fn flag_clean_detects_contradiction() {
        let all = Conditions(vec![protocol(0), protocol(1), protocol(2), protocol(3)]);
        assert!(all.clean().is_impossible());
    }

    #[test]
    fn flag_without_sub_queries_is_constant() {
        let mut flag = FlagCondition {
            sub_queries: vec!["a".to_string(), "a".to_string()],
            value: 1,
            mask: PROTOCOL_MASK,
        };
        assert!(Conditions(vec![Condition::Flag(flag.clone())]).clean().is_empty());
        flag.value = 0;
        assert!(Conditions(vec![Condition::Flag(flag)]).clean().is_impossible());
    }

    #[test]
    fn number_clean_folds_summands() {
        let clause = Conditions(vec![Condition::Number(NumberCondition {
            summands: vec![
                NumberSummand {
                    sub_query: String::new(),
                    field: NumberField::ServerPort,
                    factor: -2,
                },
                NumberSummand {
                    sub_query: String::new(),
                    field: NumberField::ServerPort,
                    factor: -2,
                },
            ],
            number: 6,
        })]);
        // 6 - 4 * sport >= 0 <=> sport <= 1
        assert_eq!(clause.clean().to_string(), "(-sport+1 >= 0)");

        let trivially_true = Conditions(vec![port(NumberField::ClientPort, "", 1, 0)]);
        assert!(trivially_true.clean().is_empty());
        let never = Conditions(vec![port(NumberField::ClientPort, "", -1, -1)]);
        assert!(never.clean().is_impossible());
    }

    #[test]
    fn number_clean_keeps_stricter_bound() {
        let clause = Conditions(vec![
            port(NumberField::ServerPort, "", -1, 100),
            port(NumberField::ServerPort, "", -1, 80),
        ]);
        assert_eq!(clause.clean().to_string(), "(-sport+80 >= 0)");
    }

    #[test]
    fn number_clean_detects_disjoint_bounds() {
        // sport >= 81 and sport <= 80
        let clause = Conditions(vec![
            port(NumberField::ServerPort, "", 1, -81),
            port(NumberField::ServerPort, "", -1, 80),
        ]);
        assert!(clause.clean().is_impossible());
        let exact = Conditions(vec![
            port(NumberField::ServerPort, "", 1, -80),
            port(NumberField::ServerPort, "", -1, 80),
        ]);
        assert_eq!(exact.clean().to_string(), "(-sport+80 >= 0) & (sport-80 >= 0)");
    }

    #[test]
    fn number_inversion_is_exact() {
        let condition = port(NumberField::ServerPort, "", 1, -80);
        let twice = condition.invert()[0][0].invert();
        assert_eq!(twice, ConditionsSet::single(condition));
    }

    #[test]
    fn time_clean_uses_ftime_before_ltime() {
        let summand = |f, l| TimeSummand {
            sub_query: String::new(),
            ftime_factor: f,
            ltime_factor: l,
        };
        // ltime - ftime + 1s >= 0 always holds
        let always = Conditions(vec![Condition::Time(TimeCondition {
            summands: vec![summand(-1, 1)],
            duration: 1_000_000_000,
            reference_time_factor: 0,
        })]);
        assert!(always.clean().is_empty());
        // ftime - ltime - 1s >= 0 never holds
        let never = Conditions(vec![Condition::Time(TimeCondition {
            summands: vec![summand(1, -1)],
            duration: -1_000_000_000,
            reference_time_factor: 0,
        })]);
        assert!(never.clean().is_impossible());
    }

    #[test]
    fn data_inversion_expands_prefixes() {
        let inverted = data(&["a", "b", "c"], false).invert();
        assert_eq!(
            inverted.to_string(),
            r#"(-cdata:"a") | (cdata:"a" > -cdata:"b") | (cdata:"a" > cdata:"b" > -cdata:"c")"#
        );
    }

    #[test]
    fn data_clean_drops_implied_prefixes() {
        let clause = Conditions(vec![data(&["a", "b"], false), data(&["a"], false)]);
        assert_eq!(clause.clean(), Conditions(vec![data(&["a", "b"], false)]));
        let contradiction = Conditions(vec![data(&["a", "b"], true), data(&["a"], true)]);
        assert!(contradiction.clean().is_impossible());
        let same = Conditions(vec![data(&["a"], true), data(&["a"], false)]);
        assert!(same.clean().is_impossible());
    }

    #[test]
    fn then_appends_sequences() {
        let a = ConditionsSet::single(data(&["a"], false));
        let b = ConditionsSet::single(data(&["b"], false)).or(ConditionsSet::single(data(&["c"], true)));
        assert_eq!(
            a.then(&b).to_string(),
            r#"(cdata:"a" > cdata:"b") | (cdata:"a" > -cdata:"c")"#
        );
        let inverted = ConditionsSet::single(data(&["a"], true));
        assert_eq!(
            inverted.then(&ConditionsSet::single(data(&["b"], false))).to_string(),
            r#"(-cdata:"a") & (cdata:"b")"#
        );
    }

    #[test]
    fn tag_accept_sets_intersect() {
        let clause = Conditions(vec![tag("x", TAG_ACCEPT_MATCHING), tag("x", TAG_MATCHING | TAG_FAILING)]);
        assert_eq!(clause.clean(), Conditions(vec![tag("x", TAG_MATCHING)]));
        let contradiction = Conditions(vec![tag("x", TAG_ACCEPT_MATCHING), tag("x", TAG_ACCEPT_FAILING)]);
        assert!(contradiction.clean().is_impossible());
    }

    #[test]
    fn set_clean_removes_subsumed_clauses() {
        let general = Conditions(vec![tag("x", TAG_ACCEPT_MATCHING)]);
        let special = Conditions(vec![tag("x", TAG_ACCEPT_MATCHING), protocol(1)]);
        let set = ConditionsSet(vec![special.clone(), general.clone()]);
        assert_eq!(set.clean(), ConditionsSet(vec![general.clone()]));
        let set = ConditionsSet(vec![general.clone(), special]);
        assert_eq!(set.clean(), ConditionsSet(vec![general]));
    }

    #[test]
    fn set_clean_is_idempotent_and_collapses_impossible() {
        let set = ConditionsSet(vec![
            Conditions(vec![protocol(1), port(NumberField::ServerPort, "", 1, -80)]),
            Conditions(vec![Condition::Impossible]),
            Conditions(vec![data(&["x"], false), data(&["x"], true)]),
        ]);
        let once = set.clean();
        assert_eq!(once.len(), 1);
        assert_eq!(once.clean(), once);
        assert!(once.iter().all(|c| !c.is_impossible()));

        let impossible = ConditionsSet(vec![Conditions(vec![Condition::Impossible])]);
        assert!(impossible.clean().is_impossible());
        assert!(ConditionsSet::never().clean().is_empty());
    }

    #[test]
    fn set_inversion_round_trips() {
        let clause = ConditionsSet(vec![Conditions(vec![
            tag("x", TAG_ACCEPT_MATCHING),
            port(NumberField::ClientPort, "", -1, 1024),
        ])]);
        assert_eq!(clause.invert().invert().clean(), clause.clean());
        let either = ConditionsSet(vec![
            Conditions(vec![tag("x", TAG_ACCEPT_MATCHING)]),
            Conditions(vec![tag("y", TAG_ACCEPT_MATCHING)]),
        ]);
        assert_eq!(either.invert().clean().to_string(), "(-tag:x) & (-tag:y)");
        assert_eq!(either.invert().invert().clean(), either);
        assert_eq!(ConditionsSet::always().invert(), ConditionsSet::never());
        assert_eq!(ConditionsSet::never().invert(), ConditionsSet::always());
    }

    #[test]
    fn parsed_set_inversion_round_trips() {
        let now = chrono::Utc::now();
        for text in ["protocol:tcp", "chost:10.0.0.0/8", "ftime:-1h:", "cdata:a then sdata:b"] {
            let set = crate::query::Query::parse_at(text, now).unwrap().conditions;
            assert_eq!(set.invert().invert().clean(), set, "{}", text);
        }
        // !(a > b) = !a | a > !b
        let sequence = crate::query::Query::parse_at("cdata:a then sdata:b", now).unwrap().conditions;
        assert_eq!(sequence.invert().clean().len(), 2);
    }
}
