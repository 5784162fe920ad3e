//! Query text to syntax tree.
//!
//! ```text
//! query   = or?
//! or      = and ( "or" and )*
//! and     = then ( "and"? then )*
//! then    = unary ( "then" unary )*
//! unary   = ( "!" | "-" ) unary | "(" or ")" | term
//! term    = [ "@" alnum+ ":" ] key [ "." converter ] ( ":" | "=" ) value
//! value   = '"' ( [^"] | '""' )* '"' | unquoted
//! ```
//!
//! Keys and keywords are case-insensitive. An unquoted value runs up to the next whitespace,
//! keeps `\x` escapes as they are and gives up trailing `)` to close groups.

use nom::branch::alt;
use nom::{IResult, Parser, bytes::complete::*, character::complete::*, combinator::*, multi::*, sequence::*};

use crate::core::error::{Error, Result};

const KEYS: &[&str] = &[
    "id", "tag", "service", "mark", "generated", "protocol", "time", "ftime", "ltime", "data",
    "cdata", "sdata", "port", "cport", "sport", "host", "chost", "shost", "bytes", "cbytes",
    "sbytes", "sort", "limit", "group",
];

/// A single `key:value` filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Term {
    pub sub_query: String,
    /// Lower case.
    pub key: String,
    pub converter: Option<String>,
    /// Unquoted, with `""` in quoted values already reduced to `"`.
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Or(Vec<Expr>),
    And(Vec<Expr>),
    Then(Vec<Expr>),
    Not(Box<Expr>),
    Term(Term),
}

fn keyword<'a>(word: &'static str) -> impl Parser<&'a str, Output = &'a str, Error = nom::error::Error<&'a str>> {
    delimited(
        multispace0,
        terminated(
            tag_no_case(word),
            not(satisfy(|c: char| c.is_alphanumeric() || matches!(c, ':' | '=' | '.'))),
        ),
        multispace0,
    )
}

fn sub_query(input: &str) -> IResult<&str, &str> {
    delimited(char('@'), alphanumeric1, char(':')).parse(input)
}

fn key(input: &str) -> IResult<&str, String> {
    map_opt(alphanumeric1, |word: &str| {
        let word = word.to_ascii_lowercase();
        KEYS.contains(&word.as_str()).then_some(word)
    })
    .parse(input)
}

fn converter(input: &str) -> IResult<&str, &str> {
    preceded(
        char('.'),
        take_while1(|c: char| !c.is_whitespace() && c != ':' && c != '='),
    )
    .parse(input)
}

fn quoted(input: &str) -> IResult<&str, String> {
    delimited(
        char('"'),
        fold_many0(
            alt((is_not("\""), value("\"", tag("\"\"")))),
            String::new,
            |mut acc, part| {
                acc.push_str(part);
                acc
            },
        ),
        char('"'),
    )
    .parse(input)
}

fn unquoted(input: &str) -> IResult<&str, String> {
    let mut end = 0;
    let mut chars = input.char_indices();
    while let Some((i, c)) = chars.next() {
        if c.is_whitespace() || (i == 0 && c == '"') {
            break;
        }
        if c == '\\' {
            match chars.next() {
                Some((j, escaped)) => end = j + escaped.len_utf8(),
                None => break,
            }
        } else if c != ')' {
            end = i + c.len_utf8();
        }
    }
    if end == 0 {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::TakeWhile1,
        )));
    }
    Ok((&input[end..], input[..end].to_string()))
}

fn term(input: &str) -> IResult<&str, Term> {
    map(
        (
            opt(sub_query),
            key,
            opt(converter),
            preceded(one_of(":="), alt((quoted, unquoted))),
        ),
        |(sub_query, key, converter, value)| Term {
            sub_query: sub_query.unwrap_or_default().to_string(),
            key,
            converter: converter.map(str::to_string),
            value,
        },
    )
    .parse(input)
}

fn unary(input: &str) -> IResult<&str, Expr> {
    delimited(
        multispace0,
        alt((
            map(preceded(one_of("!-"), unary), |e| Expr::Not(Box::new(e))),
            delimited(char('('), or_expr, preceded(multispace0, char(')'))),
            map(term, Expr::Term),
        )),
        multispace0,
    )
    .parse(input)
}

fn flatten(mut items: Vec<Expr>, wrap: fn(Vec<Expr>) -> Expr) -> Expr {
    if items.len() == 1 {
        items.remove(0)
    } else {
        wrap(items)
    }
}

fn then_expr(input: &str) -> IResult<&str, Expr> {
    map(separated_list1(keyword("then"), unary), |items| flatten(items, Expr::Then)).parse(input)
}

fn and_expr(input: &str) -> IResult<&str, Expr> {
    map(
        pair(then_expr, many0(preceded(opt(keyword("and")), then_expr))),
        |(first, rest)| {
            let mut items = vec![first];
            items.extend(rest);
            flatten(items, Expr::And)
        },
    )
    .parse(input)
}

fn or_expr(input: &str) -> IResult<&str, Expr> {
    map(separated_list1(keyword("or"), and_expr), |items| flatten(items, Expr::Or)).parse(input)
}

/// Parses `input` into its syntax tree. `None` for a query without any term.
pub fn parse(input: &str) -> Result<Option<Expr>> {
    match all_consuming(delimited(multispace0, opt(or_expr), multispace0)).parse(input) {
        Ok((_, expr)) => Ok(expr),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
            let offset = input.len() - e.input.len();
            Err(Error::parse(format!(
                "unexpected input at offset {}: {:?}",
                offset,
                e.input.chars().take(20).collect::<String>()
            )))
        }
        Err(nom::Err::Incomplete(_)) => Err(Error::parse("incomplete query")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn term(sub_query: &str, key: &str, converter: Option<&str>, value: &str) -> Expr {
        Expr::Term(Term {
            sub_query: sub_query.to_string(),
            key: key.to_string(),
            converter: converter.map(str::to_string),
            value: value.to_string(),
        })
    }

    #[test]
    fn single_terms() {
        assert_eq!(parse("sport:80").unwrap(), Some(term("", "sport", None, "80")));
        assert_eq!(parse("  SPort=80 ").unwrap(), Some(term("", "sport", None, "80")));
        assert_eq!(
            parse("@a:cdata.b64:\"x \"\"y\"\"\"").unwrap(),
            Some(term("a", "cdata", Some("b64"), "x \"y\""))
        );
        assert_eq!(parse("").unwrap(), None);
        assert_eq!(parse("   ").unwrap(), None);
    }

    #[test]
    fn unquoted_values() {
        assert_eq!(parse(r"cdata:a\ b").unwrap(), Some(term("", "cdata", None, r"a\ b")));
        assert_eq!(parse("cdata:f(o)o").unwrap(), Some(term("", "cdata", None, "f(o)o")));
        assert_eq!(parse("(cdata:(foo)").unwrap(), Some(term("", "cdata", None, "(foo")));
        assert_eq!(parse(r"cdata:foo\)").unwrap(), Some(term("", "cdata", None, r"foo\)")));
        assert!(parse("cdata:").is_err());
        assert!(parse("cdata: x").is_err());
    }

    #[test]
    fn operators_and_precedence() {
        let expr = parse("sport:80 cport:1 or -chost:10.0.0.1 and (tag:a OR tag:b)").unwrap();
        assert_eq!(
            expr,
            Some(Expr::Or(vec![
                Expr::And(vec![
                    term("", "sport", None, "80"),
                    term("", "cport", None, "1"),
                ]),
                Expr::And(vec![
                    Expr::Not(Box::new(term("", "chost", None, "10.0.0.1"))),
                    Expr::Or(vec![term("", "tag", None, "a"), term("", "tag", None, "b")]),
                ]),
            ]))
        );
    }

    #[test]
    fn then_binds_tighter_than_and() {
        let expr = parse("cdata:a then sdata:b !cdata:c").unwrap();
        assert_eq!(
            expr,
            Some(Expr::And(vec![
                Expr::Then(vec![term("", "cdata", None, "a"), term("", "sdata", None, "b")]),
                Expr::Not(Box::new(term("", "cdata", None, "c"))),
            ]))
        );
    }

    #[test]
    fn control_terms_are_terms() {
        let expr = parse("sort:-ftime limit:10 group:@chost@").unwrap();
        assert_eq!(
            expr,
            Some(Expr::And(vec![
                term("", "sort", None, "-ftime"),
                term("", "limit", None, "10"),
                term("", "group", None, "@chost@"),
            ]))
        );
    }

    #[test]
    fn errors_point_at_the_problem() {
        let err = parse("sport:80 bogus:1").unwrap_err();
        assert!(err.context.contains("offset 9"), "{}", err);
        assert!(parse("(sport:80").is_err());
        assert!(parse("sport:80 or").is_err());
    }
}
