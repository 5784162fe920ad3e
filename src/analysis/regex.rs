//! Static analysis of the byte regexes used by data conditions.
//!
//! Data regexes run over raw stream bytes: Unicode is disabled, `.` matches every byte except
//! `\n`, and literal text outside ASCII stands for its UTF-8 bytes.

use std::collections::{HashMap, HashSet};

use ::regex::bytes::{Regex, RegexBuilder};
use regex_syntax::ParserBuilder;
use regex_syntax::hir::literal::{ExtractKind, Extractor};
use regex_syntax::hir::{Hir, HirKind};

use crate::core::error::Result;

/// Lengths of the byte strings a regex can match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptedLength {
    /// `usize::MAX` when the regex can never match.
    pub min: usize,
    /// `None` when unbounded.
    pub max: Option<usize>,
}

impl AcceptedLength {
    pub fn is_fixed(&self) -> bool {
        self.max == Some(self.min)
    }
}

/// What the matcher needs to know about a regex before running it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegexInfo {
    pub accepted_length: AcceptedLength,
    /// Every match starts with these bytes.
    pub prefix: Vec<u8>,
    /// Every match ends with these bytes.
    pub suffix: Vec<u8>,
    /// The regex matches exactly `prefix` and nothing else.
    pub complete: bool,
    /// Anchors or word boundaries are used, so a match depends on the bytes around it and the
    /// haystack may not be narrowed before searching.
    pub context_sensitive: bool,
}

/// Renames every repeated capture group name to a fresh one.
///
/// Returns the rewritten pattern and, per fresh name, the name as written.
fn rename_repeated_captures(pattern: &str) -> (String, HashMap<String, String>) {
    let bytes = pattern.as_bytes();
    let mut groups = Vec::new();
    let mut class_depth = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => {
                i += 2;
                continue;
            }
            b'[' => {
                class_depth += 1;
                i += 1;
                if class_depth == 1 {
                    // `]` right after the opening bracket is a literal.
                    if bytes.get(i) == Some(&b'^') {
                        i += 1;
                    }
                    if bytes.get(i) == Some(&b']') {
                        i += 1;
                    }
                }
                continue;
            }
            b']' if class_depth > 0 => class_depth -= 1,
            b'(' if class_depth == 0 => {
                let rest = &pattern[i..];
                let open = if rest.starts_with("(?P<") {
                    4
                } else if rest.starts_with("(?<") {
                    3
                } else {
                    0
                };
                if open != 0 {
                    if let Some(len) = rest[open..].find('>') {
                        groups.push((i + open, i + open + len));
                        i += open + len + 1;
                        continue;
                    }
                }
            }
            _ => {}
        }
        i += 1;
    }

    let written: HashSet<&str> = groups.iter().map(|&(start, end)| &pattern[start..end]).collect();
    let mut seen = HashSet::new();
    let mut renamed: HashMap<String, String> = HashMap::new();
    let mut out = String::with_capacity(pattern.len());
    let mut last = 0;
    for &(start, end) in &groups {
        let name = &pattern[start..end];
        if seen.insert(name) {
            continue;
        }
        let mut n = 1;
        let fresh = loop {
            let candidate = format!("{}__{}", name, n);
            if !written.contains(candidate.as_str()) && !renamed.contains_key(&candidate) {
                break candidate;
            }
            n += 1;
        };
        out.push_str(&pattern[last..start]);
        out.push_str(&fresh);
        last = end;
        renamed.insert(fresh, name.to_string());
    }
    out.push_str(&pattern[last..]);
    (out, renamed)
}

fn parse(pattern: &str) -> Result<(Hir, HashMap<String, String>)> {
    let (unique, renamed) = rename_repeated_captures(pattern);
    let hir = ParserBuilder::new()
        .unicode(false)
        .utf8(false)
        .build()
        .parse(&unique)?;
    Ok((hir, renamed))
}

/// Compiles `pattern` with the byte semantics described at module level.
pub fn compile(pattern: &str) -> Result<Regex> {
    Ok(compile_with_names(pattern)?.0)
}

/// Like [`compile`], also returning the capture name as written for every group index.
///
/// A name may be used by several groups.
pub fn compile_with_names(pattern: &str) -> Result<(Regex, Vec<Option<String>>)> {
    let (unique, renamed) = rename_repeated_captures(pattern);
    let regex = RegexBuilder::new(&unique).unicode(false).build()?;
    let names = regex
        .capture_names()
        .map(|name| name.map(|n| renamed.get(n).map_or(n, String::as_str).to_string()))
        .collect();
    Ok((regex, names))
}

pub fn analyze(pattern: &str) -> Result<RegexInfo> {
    let (hir, _) = parse(pattern)?;
    let properties = hir.properties();
    let accepted_length = AcceptedLength {
        min: properties.minimum_len().unwrap_or(usize::MAX),
        max: properties.maximum_len(),
    };
    let context_sensitive = !properties.look_set().is_empty();

    let prefixes = Extractor::new().kind(ExtractKind::Prefix).extract(&hir);
    let prefix = prefixes.longest_common_prefix().map(<[u8]>::to_vec).unwrap_or_default();
    let complete = prefixes
        .literals()
        .is_some_and(|literals| literals.len() == 1 && literals[0].is_exact());

    let suffix = if complete {
        prefix.clone()
    } else {
        let suffixes = Extractor::new().kind(ExtractKind::Suffix).extract(&hir);
        suffixes.longest_common_suffix().map(<[u8]>::to_vec).unwrap_or_default()
    };

    Ok(RegexInfo {
        accepted_length,
        prefix,
        suffix,
        complete,
        context_sensitive,
    })
}

/// Names of all named capture groups, sorted and without duplicates.
pub fn named_captures(pattern: &str) -> Result<Vec<String>> {
    let (hir, renamed) = parse(pattern)?;
    let mut names = Vec::new();
    let mut stack = vec![&hir];
    while let Some(node) = stack.pop() {
        match node.kind() {
            HirKind::Capture(capture) => {
                if let Some(name) = capture.name.as_deref() {
                    names.push(renamed.get(name).map_or(name, String::as_str).to_string());
                }
                stack.push(&capture.sub);
            }
            HirKind::Repetition(repetition) => stack.push(&repetition.sub),
            HirKind::Concat(subs) | HirKind::Alternation(subs) => stack.extend(subs.iter()),
            HirKind::Empty | HirKind::Literal(_) | HirKind::Class(_) | HirKind::Look(_) => {}
        }
    }
    names.sort();
    names.dedup();
    Ok(names)
}

/// Escapes `bytes` so that the result, compiled with [`compile`], matches exactly them.
pub fn quote_bytes(bytes: &[u8]) -> String {
    let mut quoted = String::with_capacity(bytes.len());
    for &b in bytes {
        match b {
            b'\\' | b'.' | b'+' | b'*' | b'?' | b'(' | b')' | b'|' | b'[' | b']' | b'{' | b'}'
            | b'^' | b'$' | b'#' | b'&' | b'-' | b'~' => {
                quoted.push('\\');
                quoted.push(b as char);
            }
            0x21..=0x7e => quoted.push(b as char),
            _ => quoted.push_str(&format!("\\x{:02x}", b)),
        }
    }
    quoted
}

#[cfg(test)]
mod tests {
    use super::*;

    fn length(pattern: &str) -> AcceptedLength {
        analyze(pattern).unwrap().accepted_length
    }

    #[test]
    fn accepted_lengths() {
        assert_eq!(length(""), AcceptedLength { min: 0, max: Some(0) });
        assert_eq!(length("a"), AcceptedLength { min: 1, max: Some(1) });
        assert_eq!(length("a*"), AcceptedLength { min: 0, max: None });
        assert_eq!(length("a{2,3}"), AcceptedLength { min: 2, max: Some(3) });
        assert_eq!(length("foo.*bar"), AcceptedLength { min: 6, max: None });
        assert_eq!(length("foo.*bar.*baz"), AcceptedLength { min: 9, max: None });
        assert_eq!(
            length("RABA_([A-Za-z0-9+/]|%[0-9a-fA-F]{2}){32}"),
            AcceptedLength { min: 5 + 32, max: Some(5 + 3 * 32) }
        );
        assert_eq!(length("(?:a|bb){64}"), AcceptedLength { min: 64, max: Some(128) });
        // bytes, not code points
        assert_eq!(length("."), AcceptedLength { min: 1, max: Some(1) });
    }

    #[test]
    fn literal_prefix_and_suffix() {
        let info = analyze("foo.*bar").unwrap();
        assert_eq!(info.prefix, b"foo".to_vec());
        assert_eq!(info.suffix, b"bar".to_vec());
        assert!(!info.complete);

        let info = analyze("needle").unwrap();
        assert!(info.complete);
        assert_eq!(info.prefix, b"needle".to_vec());
        assert_eq!(info.suffix, b"needle".to_vec());

        let info = analyze("(?:abc|abd)x").unwrap();
        assert_eq!(info.prefix, b"ab".to_vec());
        assert_eq!(info.suffix, b"x".to_vec());

        assert!(analyze("^GET").unwrap().context_sensitive);
        assert!(!analyze("GET").unwrap().context_sensitive);
    }

    #[test]
    fn dot_skips_newline_only() {
        let regex = compile("a.b").unwrap();
        assert!(regex.is_match(b"a\xffb"));
        assert!(!regex.is_match(b"a\nb"));
    }

    #[test]
    fn named_captures_are_collected() {
        assert_eq!(
            named_captures("(?P<user>[a-z]+):(?P<pass>.*)|(?P<user>x)").unwrap(),
            vec!["pass".to_string(), "user".to_string()]
        );
        assert!(named_captures("(").is_err());
    }

    #[test]
    fn repeated_capture_names_share_one_name() {
        let (regex, names) = compile_with_names("(?P<x>a)|(?P<x>b)|(?<y>[(?P<x>])").unwrap();
        assert_eq!(
            names,
            vec![None, Some("x".to_string()), Some("x".to_string()), Some("y".to_string())]
        );
        let caps = regex.captures(b"b").unwrap();
        assert!(caps.get(1).is_none());
        assert_eq!(caps.get(2).map(|m| m.as_bytes()), Some(&b"b"[..]));
        assert!(compile("(?P<x>a)(?P<x>b)").unwrap().is_match(b"ab"));
        // A fresh name never collides with a written one.
        let (_, names) = compile_with_names("(?P<x>a)(?P<x>b)(?P<x__1>c)").unwrap();
        assert_eq!(names[2].as_deref(), Some("x"));
        assert_eq!(names[3].as_deref(), Some("x__1"));
        assert_eq!(analyze("(?P<x>ab)|(?P<x>ac)").unwrap().prefix, b"a");
    }

    #[test]
    fn quoted_bytes_match_themselves() {
        let raw: &[u8] = b"a.b*(c)\x00\xff @";
        let regex = compile(&format!("^{}$", quote_bytes(raw))).unwrap();
        assert!(regex.is_match(raw));
        assert!(!regex.is_match(b"aXb*(c)\x00\xff @"));
    }
}
