//! The query language: text to a normalized [`ConditionsSet`] plus the control terms.

pub mod algebra;
pub mod conditions;
pub mod parser;
pub mod sorting;
pub mod subqueries;
pub mod terms;
pub mod value_parser;

use chrono::{DateTime, Utc};

use crate::core::error::{Error, Result};
use crate::query::parser::{Expr, Term};

pub use conditions::{Condition, Conditions, ConditionsSet};
pub use sorting::{Grouping, GroupingKey, SortDirection, Sorting, SortingKey};

/// A parsed query.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    /// Cleaned. Empty when the query can never match, `[[]]` when it matches everything.
    pub conditions: ConditionsSet,
    /// `None` when no `sort:` term was given.
    pub sorting: Option<Vec<Sorting>>,
    pub limit: Option<usize>,
    pub grouping: Option<Grouping>,
    /// The time relative times were resolved against.
    pub reference_time: DateTime<Utc>,
}

#[derive(Default)]
struct ControlTerms {
    sorting: Option<Vec<Sorting>>,
    limit: Option<usize>,
    grouping: Option<Grouping>,
}

impl ControlTerms {
    fn apply(&mut self, term: &Term) -> Result<bool> {
        let duplicate = || Error::parse(format!("{} given more than once", term.key));
        match term.key.as_str() {
            "sort" => {
                if self.sorting.is_some() {
                    return Err(duplicate());
                }
                self.sorting = Some(Sorting::parse_list(&term.value)?);
            }
            "limit" => {
                if self.limit.is_some() {
                    return Err(duplicate());
                }
                let limit = term
                    .value
                    .trim()
                    .parse()
                    .map_err(|_| Error::parse(format!("invalid limit {:?}", term.value)))?;
                self.limit = Some(limit);
            }
            "group" => {
                if self.grouping.is_some() {
                    return Err(duplicate());
                }
                self.grouping = Some(Grouping::parse(&term.value)?);
            }
            _ => return Ok(false),
        }
        if !term.sub_query.is_empty() || term.converter.is_some() {
            return Err(Error::parse(format!(
                "{} takes neither a sub-query nor a converter",
                term.key
            )));
        }
        Ok(true)
    }
}

/// Folds `items` with `combine`, skipping items that are only control terms.
fn fold(
    items: &[Expr],
    control: &mut ControlTerms,
    reference_time: DateTime<Utc>,
    combine: impl Fn(ConditionsSet, ConditionsSet) -> ConditionsSet,
) -> Result<Option<ConditionsSet>> {
    let mut result: Option<ConditionsSet> = None;
    for item in items {
        if let Some(conditions) = build(item, control, reference_time)? {
            result = Some(match result {
                Some(acc) => combine(acc, conditions),
                None => conditions,
            });
        }
    }
    Ok(result)
}

fn build(expr: &Expr, control: &mut ControlTerms, reference_time: DateTime<Utc>) -> Result<Option<ConditionsSet>> {
    match expr {
        Expr::Term(term) => {
            if control.apply(term)? {
                return Ok(None);
            }
            Ok(Some(terms::term_conditions(term, reference_time)?))
        }
        Expr::Not(inner) => Ok(build(inner, control, reference_time)?.map(|c| c.invert().clean())),
        Expr::And(items) => fold(items, control, reference_time, |a, b| a.and(&b).clean()),
        Expr::Or(items) => fold(items, control, reference_time, |a, b| a.or(b)),
        Expr::Then(items) => fold(items, control, reference_time, |a, b| a.then(&b).clean()),
    }
}

impl Query {
    /// Parses `text` with "now" as reference time.
    pub fn parse(text: &str) -> Result<Query> {
        Query::parse_at(text, Utc::now())
    }

    pub fn parse_at(text: &str, reference_time: DateTime<Utc>) -> Result<Query> {
        let mut control = ControlTerms::default();
        let conditions = match parser::parse(text)? {
            Some(expr) => build(&expr, &mut control, reference_time)?,
            None => None,
        };
        let conditions = match conditions {
            Some(conditions) => {
                let cleaned = conditions.clean();
                if cleaned.is_impossible() {
                    ConditionsSet::never()
                } else {
                    cleaned
                }
            }
            None => ConditionsSet::always(),
        };
        // Sub-query shapes that can not be evaluated are query errors.
        subqueries::evaluation_order(&conditions)?;
        Ok(Query {
            conditions,
            sorting: control.sorting,
            limit: control.limit,
            grouping: control.grouping,
            reference_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;
    use chrono::TimeZone;

    fn parse(text: &str) -> Query {
        Query::parse_at(text, Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()).unwrap()
    }

    #[test]
    fn empty_and_impossible_queries() {
        assert_eq!(parse("").conditions, ConditionsSet::always());
        assert_eq!(parse("limit:5").conditions, ConditionsSet::always());
        assert_eq!(parse("sport:80 -sport:80").conditions, ConditionsSet::never());
    }

    #[test]
    fn control_terms() {
        let query = parse("sport:80 sort:-id,cport limit:10 group:@chost@");
        assert_eq!(query.conditions.to_string(), "(-sport+80 >= 0) & (sport-80 >= 0)");
        assert_eq!(
            query.sorting,
            Some(vec![
                Sorting::descending(SortingKey::Id),
                Sorting::ascending(SortingKey::ClientPort)
            ])
        );
        assert_eq!(query.limit, Some(10));
        assert_eq!(query.grouping.map(|g| g.builtin_keys()), Some(vec![GroupingKey::ClientHost]));
        assert_eq!(parse("tag:a").sorting, None);
    }

    #[test]
    fn control_term_errors() {
        let now = Utc::now();
        assert!(Query::parse_at("limit:1 limit:2", now).is_err());
        assert!(Query::parse_at("limit:x", now).is_err());
        assert!(Query::parse_at("@a:sort:id", now).is_err());
        assert!(Query::parse_at("sort:bogus", now).is_err());
    }

    #[test]
    fn negation_and_alternatives() {
        assert_eq!(parse("-tag:a").conditions.to_string(), "(-tag:a)");
        assert_eq!(parse("tag:a or tag:b").conditions.to_string(), "(tag:a) | (tag:b)");
        assert_eq!(parse("-limit:3").conditions, ConditionsSet::always());
    }

    #[test]
    fn cyclic_sub_queries_fail_to_parse() {
        let err = Query::parse_at(
            "cport:@a:cport@ sport:@b:sport@ @a:sbytes:@b:sbytes@",
            Utc::now(),
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnsupportedQuery);
    }
}
