//! Grammars for the values of query terms.
//!
//! ```text
//! variable     = "@" [ alnum+ ":" ] alnum+ "@"
//! string       = ( variable | text )*               text: anything but "@", "@@" for "@"
//! token_list   = item ( "," item )*                 item: alpha+ | variable
//! number_range = side [ ":" side ] ( "," ... )*     side: ( ("+"|"-")* ( digits | variable ) )*
//! time_range   = same as number_range with duration | time | variable operands
//! duration     = ( decimal unit )+                  unit: ns us µs ms s m h
//! time         = [ YYYY "-" MM "-" DD " "+ ] HHMM [ SS ]
//! host_list    = ( ip | variable ) ( "/" ["-"] digits )* ( "," ... )*
//! ```
//!
//! Whitespace is allowed between the elements of lists and ranges, but not inside strings.

use std::fmt;
use std::net::IpAddr;

use chrono::{NaiveDate, NaiveTime};
use nom::branch::alt;
use nom::{IResult, Parser, bytes::complete::*, character::complete::*, combinator::*, multi::*, sequence::*};

use crate::core::error::{Error, Result};

type ParseError<'a> = nom::error::Error<&'a str>;

/// `@sub:name@` inside a value. The root sub-query is `""`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    pub sub_query: String,
    pub name: String,
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.sub_query.is_empty() {
            write!(f, "@{}@", self.name)
        } else {
            write!(f, "@{}:{}@", self.sub_query, self.name)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StringElement {
    Text(String),
    Variable(Variable),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListItem {
    Token(String),
    Variable(Variable),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostValue {
    Address(IpAddr),
    Variable(Variable),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostItem {
    pub value: HostValue,
    /// The `/n` suffixes in order of appearance.
    pub masks: Vec<i64>,
}

/// One operand of a range bound together with its sign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signed<T> {
    pub negative: bool,
    pub operand: T,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NumberOperand {
    Number(i64),
    Variable(Variable),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeOperand {
    /// Nanoseconds.
    Duration(i64),
    /// A wall clock time in UTC; without a date the reference date is used.
    Time { date: Option<NaiveDate>, time: NaiveTime },
    Variable(Variable),
}

/// `lower[:upper]`. A single bound is an equality; an empty side is unbounded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Range<T> {
    pub lower: Vec<Signed<T>>,
    pub upper: Option<Vec<Signed<T>>>,
}

fn ws<'a, O, P>(inner: P) -> impl Parser<&'a str, Output = O, Error = ParseError<'a>>
where
    P: Parser<&'a str, Output = O, Error = ParseError<'a>>,
{
    delimited(multispace0, inner, multispace0)
}

fn variable(input: &str) -> IResult<&str, Variable> {
    map(
        delimited(
            char('@'),
            pair(opt(terminated(alphanumeric1, char(':'))), alphanumeric1),
            char('@'),
        ),
        |(sub_query, name): (Option<&str>, &str)| Variable {
            sub_query: sub_query.unwrap_or_default().to_string(),
            name: name.to_string(),
        },
    )
    .parse(input)
}

fn text(input: &str) -> IResult<&str, String> {
    fold_many1(
        alt((is_not("@"), value("@", tag("@@")))),
        String::new,
        |mut acc, part| {
            acc.push_str(part);
            acc
        },
    )
    .parse(input)
}

fn string_elements(input: &str) -> IResult<&str, Vec<StringElement>> {
    many0(alt((
        map(variable, StringElement::Variable),
        map(text, StringElement::Text),
    )))
    .parse(input)
}

fn list_item(input: &str) -> IResult<&str, ListItem> {
    ws(alt((
        map(variable, ListItem::Variable),
        map(alpha1, |token: &str| ListItem::Token(token.to_string())),
    )))
    .parse(input)
}

fn sign(input: &str) -> IResult<&str, bool> {
    map(many0(ws(one_of("+-"))), |signs: Vec<char>| {
        signs.iter().filter(|&&c| c == '-').count() % 2 == 1
    })
    .parse(input)
}

fn signed<'a, T, P>(operand: P) -> impl Parser<&'a str, Output = Signed<T>, Error = ParseError<'a>>
where
    P: Parser<&'a str, Output = T, Error = ParseError<'a>>,
{
    map(pair(sign, ws(operand)), |(negative, operand)| Signed { negative, operand })
}

fn range<'a, T, P>(operand: P) -> impl Parser<&'a str, Output = Range<T>, Error = ParseError<'a>>
where
    P: Parser<&'a str, Output = T, Error = ParseError<'a>> + Clone,
{
    map(
        pair(
            many0(signed(operand.clone())),
            opt(preceded(ws(char(':')), many0(signed(operand)))),
        ),
        |(lower, upper)| Range { lower, upper },
    )
}

fn number_operand(input: &str) -> IResult<&str, NumberOperand> {
    alt((
        map(variable, NumberOperand::Variable),
        map_res(digit1, |digits: &str| digits.parse::<i64>().map(NumberOperand::Number)),
    ))
    .parse(input)
}

fn unit_nanos(unit: &str) -> i128 {
    match unit {
        "ns" => 1,
        "us" | "µs" => 1_000,
        "ms" => 1_000_000,
        "s" => 1_000_000_000,
        "m" => 60_000_000_000,
        _ => 3_600_000_000_000,
    }
}

fn decimal_nanos(number: &str, unit: &str) -> Option<i128> {
    let scale = unit_nanos(unit);
    let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
    let whole: i128 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let mut nanos = whole.checked_mul(scale)?;
    let mut divisor = 1i128;
    let mut fraction_value = 0i128;
    for digit in fraction.bytes().take(18) {
        divisor *= 10;
        fraction_value = fraction_value * 10 + i128::from(digit - b'0');
    }
    nanos = nanos.checked_add(fraction_value * scale / divisor)?;
    Some(nanos)
}

fn duration(input: &str) -> IResult<&str, i64> {
    let decimal = alt((
        recognize((digit1, char('.'), digit1)),
        recognize(pair(opt(char('.')), digit1)),
    ));
    let unit = alt((tag("ns"), tag("us"), tag("µs"), tag("ms"), tag("s"), tag("m"), tag("h")));
    map_opt(many1(pair(decimal, unit)), |parts: Vec<(&str, &str)>| {
        let mut total = 0i128;
        for (number, unit) in parts {
            total = total.checked_add(decimal_nanos(number, unit)?)?;
        }
        i64::try_from(total).ok()
    })
    .parse(input)
}

fn two_digits(input: &str) -> IResult<&str, u32> {
    map_res(take_while_m_n(2, 2, |c: char| c.is_ascii_digit()), str::parse::<u32>).parse(input)
}

fn date(input: &str) -> IResult<&str, NaiveDate> {
    map_opt(
        (
            map_res(take_while_m_n(4, 4, |c: char| c.is_ascii_digit()), str::parse::<i32>),
            preceded(char('-'), two_digits),
            preceded(char('-'), two_digits),
        ),
        |(year, month, day)| NaiveDate::from_ymd_opt(year, month, day),
    )
    .parse(input)
}

fn clock(input: &str) -> IResult<&str, NaiveTime> {
    map_opt(
        terminated((two_digits, two_digits, opt(two_digits)), not(digit1)),
        |(hour, minute, second)| NaiveTime::from_hms_opt(hour, minute, second.unwrap_or(0)),
    )
    .parse(input)
}

fn time_operand(input: &str) -> IResult<&str, TimeOperand> {
    alt((
        map(variable, TimeOperand::Variable),
        map(duration, TimeOperand::Duration),
        map(pair(opt(terminated(date, space1)), clock), |(date, time)| {
            TimeOperand::Time { date, time }
        }),
    ))
    .parse(input)
}

fn address(input: &str) -> IResult<&str, IpAddr> {
    map_res(
        take_while1(|c: char| c.is_ascii_hexdigit() || c == ':' || c == '.'),
        |text: &str| text.parse::<IpAddr>().map(|ip| ip.to_canonical()),
    )
    .parse(input)
}

fn mask(input: &str) -> IResult<&str, i64> {
    map_res(
        preceded(char('/'), recognize(pair(opt(char('-')), digit1))),
        str::parse::<i64>,
    )
    .parse(input)
}

fn host_item(input: &str) -> IResult<&str, HostItem> {
    map(
        ws(pair(
            alt((map(variable, HostValue::Variable), map(address, HostValue::Address))),
            many0(mask),
        )),
        |(value, masks)| HostItem { value, masks },
    )
    .parse(input)
}

fn list<'a, O, P>(item: P) -> impl Parser<&'a str, Output = Vec<O>, Error = ParseError<'a>>
where
    P: Parser<&'a str, Output = O, Error = ParseError<'a>>,
{
    separated_list1(ws(char(',')), item)
}

fn complete<'a, O>(
    what: &str,
    input: &'a str,
    parser: impl Parser<&'a str, Output = O, Error = ParseError<'a>>,
) -> Result<O> {
    match all_consuming(parser).parse(input) {
        Ok((_, value)) => Ok(value),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err(Error::parse(format!(
            "invalid {} {:?} at offset {}",
            what,
            input,
            input.len() - e.input.len()
        ))),
        Err(nom::Err::Incomplete(_)) => Err(Error::parse(format!("incomplete {} {:?}", what, input))),
    }
}

pub fn parse_string(input: &str) -> Result<Vec<StringElement>> {
    complete("string", input, string_elements)
}

pub fn parse_token_list(input: &str) -> Result<Vec<ListItem>> {
    complete("list", input, list(list_item))
}

pub fn parse_number_ranges(input: &str) -> Result<Vec<Range<NumberOperand>>> {
    complete("number range", input, list(range(number_operand)))
}

pub fn parse_time_ranges(input: &str) -> Result<Vec<Range<TimeOperand>>> {
    complete("time range", input, list(range(time_operand)))
}

pub fn parse_host_list(input: &str) -> Result<Vec<HostItem>> {
    complete("host list", input, list(host_item))
}

/// Parses a Go-style duration such as `1h30m` or `-1.5s` into nanoseconds.
pub fn parse_duration(input: &str) -> Result<i64> {
    complete(
        "duration",
        input,
        map(pair(opt(one_of("+-")), duration), |(sign, nanos)| {
            if sign == Some('-') { -nanos } else { nanos }
        }),
    )
}

/// Builds the IPv4 and IPv6 masks of a host item.
///
/// Every `/n` toggles the first `n` bits, and `/-n` the last `n` bits, of masks that start out
/// empty. Without any `/n` all bits are significant.
pub fn build_masks(masks: &[i64]) -> Result<([u8; 4], [u8; 16])> {
    if masks.is_empty() {
        return Ok(([0xff; 4], [0xff; 16]));
    }
    fn toggle(mask: &mut [u8], bit: usize) {
        mask[bit / 8] ^= 1 << (7 - bit % 8);
    }

    let mut mask4 = [0u8; 4];
    let mut mask6 = [0u8; 16];
    for &n in masks {
        if !(-128..=128).contains(&n) {
            return Err(Error::parse(format!("bad host mask /{}", n)));
        }
        let count = n.unsigned_abs() as usize;
        if n >= 0 {
            for bit in 0..count {
                if bit < 32 {
                    toggle(&mut mask4, bit);
                }
                toggle(&mut mask6, bit);
            }
        } else {
            for bit in 128 - count..128 {
                toggle(&mut mask6, bit);
            }
            if count <= 32 {
                for bit in 32 - count..32 {
                    toggle(&mut mask4, bit);
                }
            }
        }
    }
    Ok((mask4, mask6))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;

    fn var(sub_query: &str, name: &str) -> Variable {
        Variable {
            sub_query: sub_query.to_string(),
            name: name.to_string(),
        }
    }

    fn plus<T>(operand: T) -> Signed<T> {
        Signed {
            negative: false,
            operand,
        }
    }

    fn minus<T>(operand: T) -> Signed<T> {
        Signed {
            negative: true,
            operand,
        }
    }

    #[test]
    fn strings_with_variables() {
        assert_eq!(
            parse_string("user=@a:user@ mail@@host @pass@").unwrap(),
            vec![
                StringElement::Text("user=".to_string()),
                StringElement::Variable(var("a", "user")),
                StringElement::Text(" mail@host ".to_string()),
                StringElement::Variable(var("", "pass")),
            ]
        );
        assert_eq!(parse_string("").unwrap(), vec![]);
        assert!(parse_string("dangling @").is_err());
    }

    #[test]
    fn token_lists() {
        assert_eq!(
            parse_token_list("tcp, udp,@b:protocol@").unwrap(),
            vec![
                ListItem::Token("tcp".to_string()),
                ListItem::Token("udp".to_string()),
                ListItem::Variable(var("b", "protocol")),
            ]
        );
        assert!(parse_token_list("tcp,,udp").is_err());
    }

    #[test]
    fn number_ranges() {
        let ranges = parse_number_ranges("80,1000:2000,:-5,@a:cport@+--1:").unwrap();
        assert_eq!(
            ranges,
            vec![
                Range {
                    lower: vec![plus(NumberOperand::Number(80))],
                    upper: None,
                },
                Range {
                    lower: vec![plus(NumberOperand::Number(1000))],
                    upper: Some(vec![plus(NumberOperand::Number(2000))]),
                },
                Range {
                    lower: vec![],
                    upper: Some(vec![minus(NumberOperand::Number(5))]),
                },
                Range {
                    lower: vec![
                        plus(NumberOperand::Variable(var("a", "cport"))),
                        plus(NumberOperand::Number(1)),
                    ],
                    upper: Some(vec![]),
                },
            ]
        );
        let err = parse_number_ranges("80x").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Parse);
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("1h30m").unwrap(), 90 * 60 * 1_000_000_000);
        assert_eq!(parse_duration("-15m").unwrap(), -15 * 60 * 1_000_000_000);
        assert_eq!(parse_duration("1.5s").unwrap(), 1_500_000_000);
        assert_eq!(parse_duration(".5ms").unwrap(), 500_000);
        assert_eq!(parse_duration("3µs2ns").unwrap(), 3_002);
        assert!(parse_duration("5").is_err());
        assert!(parse_duration("5S").is_err());
        assert!(parse_duration("9999999999h").is_err());
    }

    #[test]
    fn time_ranges() {
        let ranges = parse_time_ranges("-1h:2024-03-01 1504, 120000:@a:ftime@+5s").unwrap();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].lower, vec![minus(TimeOperand::Duration(3_600_000_000_000))]);
        assert_eq!(
            ranges[0].upper,
            Some(vec![plus(TimeOperand::Time {
                date: NaiveDate::from_ymd_opt(2024, 3, 1),
                time: NaiveTime::from_hms_opt(15, 4, 0).unwrap(),
            })])
        );
        assert_eq!(
            ranges[1].lower,
            vec![plus(TimeOperand::Time {
                date: None,
                time: NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
            })]
        );
        assert_eq!(
            ranges[1].upper,
            Some(vec![
                plus(TimeOperand::Variable(var("a", "ftime"))),
                plus(TimeOperand::Duration(5_000_000_000)),
            ])
        );
        assert!(parse_time_ranges("2561").is_err());
        assert!(parse_time_ranges("15040").is_err());
    }

    #[test]
    fn host_lists() {
        let hosts = parse_host_list("10.0.0.1/8, ::ffff:192.168.0.1,@a:chost@/-8,fe80::1").unwrap();
        assert_eq!(hosts[0].value, HostValue::Address("10.0.0.1".parse().unwrap()));
        assert_eq!(hosts[0].masks, vec![8]);
        assert_eq!(hosts[1].value, HostValue::Address("192.168.0.1".parse().unwrap()));
        assert_eq!(hosts[2].value, HostValue::Variable(var("a", "chost")));
        assert_eq!(hosts[2].masks, vec![-8]);
        assert_eq!(hosts[3].value, HostValue::Address("fe80::1".parse().unwrap()));
        assert!(parse_host_list("10.0.0.300").is_err());
    }

    #[test]
    fn masks() {
        let (mask4, mask6) = build_masks(&[]).unwrap();
        assert_eq!(mask4, [0xff; 4]);
        assert_eq!(mask6, [0xff; 16]);

        let (mask4, mask6) = build_masks(&[12]).unwrap();
        assert_eq!(mask4, [0xff, 0xf0, 0, 0]);
        assert_eq!(&mask6[..3], &[0xff, 0xf0, 0]);

        let (mask4, mask6) = build_masks(&[-8]).unwrap();
        assert_eq!(mask4, [0, 0, 0, 0xff]);
        assert_eq!(mask6[15], 0xff);
        assert_eq!(mask6[14], 0);

        // toggling twice cancels
        let (mask4, _) = build_masks(&[24, 16]).unwrap();
        assert_eq!(mask4, [0, 0, 0xff, 0]);

        let (mask4, mask6) = build_masks(&[64]).unwrap();
        assert_eq!(mask4, [0xff; 4]);
        assert_eq!(&mask6[..9], &[0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0]);

        assert!(build_masks(&[129]).is_err());
        assert!(build_masks(&[-129]).is_err());
    }
}
