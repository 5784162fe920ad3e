//! `sort:` and `group:` control terms.

use std::fmt;

use crate::core::error::{Error, Result};
use crate::query::conditions::DataVariable;
use crate::query::value_parser::{self, StringElement};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SortingKey {
    Id,
    ClientBytes,
    ServerBytes,
    FirstPacketTime,
    LastPacketTime,
    ClientHost,
    ServerHost,
    ClientPort,
    ServerPort,
}

impl SortingKey {
    pub fn name(self) -> &'static str {
        match self {
            SortingKey::Id => "id",
            SortingKey::ClientBytes => "cbytes",
            SortingKey::ServerBytes => "sbytes",
            SortingKey::FirstPacketTime => "ftime",
            SortingKey::LastPacketTime => "ltime",
            SortingKey::ClientHost => "chost",
            SortingKey::ServerHost => "shost",
            SortingKey::ClientPort => "cport",
            SortingKey::ServerPort => "sport",
        }
    }

    pub fn from_name(name: &str) -> Option<SortingKey> {
        Some(match name {
            "id" => SortingKey::Id,
            "cbytes" => SortingKey::ClientBytes,
            "sbytes" => SortingKey::ServerBytes,
            "ftime" => SortingKey::FirstPacketTime,
            "ltime" => SortingKey::LastPacketTime,
            "chost" => SortingKey::ClientHost,
            "shost" => SortingKey::ServerHost,
            "cport" => SortingKey::ClientPort,
            "sport" => SortingKey::ServerPort,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SortDirection {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sorting {
    pub key: SortingKey,
    pub direction: SortDirection,
}

impl Sorting {
    pub fn ascending(key: SortingKey) -> Self {
        Sorting {
            key,
            direction: SortDirection::Ascending,
        }
    }

    pub fn descending(key: SortingKey) -> Self {
        Sorting {
            key,
            direction: SortDirection::Descending,
        }
    }

    /// Newest first.
    pub fn default_order() -> Vec<Sorting> {
        vec![Sorting::descending(SortingKey::FirstPacketTime)]
    }

    /// Parses `key[,key...]` where a leading `-` sorts descending.
    pub fn parse_list(value: &str) -> Result<Vec<Sorting>> {
        let mut result: Vec<Sorting> = Vec::new();
        for item in value.split(',') {
            let mut item = item.trim();
            let mut direction = SortDirection::Ascending;
            if let Some(rest) = item.strip_prefix('-') {
                direction = SortDirection::Descending;
                item = rest.trim();
            }
            let key = SortingKey::from_name(&item.to_ascii_lowercase())
                .ok_or_else(|| Error::parse(format!("invalid sort key {:?}", item)))?;
            if result.iter().any(|s| s.key == key) {
                return Err(Error::parse(format!("sort key {:?} used twice", item)));
            }
            result.push(Sorting { key, direction });
        }
        Ok(result)
    }
}

impl fmt::Display for Sorting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.direction == SortDirection::Descending {
            f.write_str("-")?;
        }
        f.write_str(self.key.name())
    }
}

/// Stream fields usable as grouping variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupingKey {
    Id,
    ClientPort,
    ServerPort,
    Bytes,
    ClientBytes,
    ServerBytes,
    FirstPacketTime,
    LastPacketTime,
    Duration,
    ClientHost,
    ServerHost,
}

impl GroupingKey {
    pub fn from_name(name: &str) -> Option<GroupingKey> {
        Some(match name {
            "id" => GroupingKey::Id,
            "cport" => GroupingKey::ClientPort,
            "sport" => GroupingKey::ServerPort,
            "bytes" => GroupingKey::Bytes,
            "cbytes" => GroupingKey::ClientBytes,
            "sbytes" => GroupingKey::ServerBytes,
            "ftime" => GroupingKey::FirstPacketTime,
            "ltime" => GroupingKey::LastPacketTime,
            "duration" => GroupingKey::Duration,
            "chost" => GroupingKey::ClientHost,
            "shost" => GroupingKey::ServerHost,
            _ => return None,
        })
    }
}

/// `group:` template: constant text with `@name@` variables at byte positions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grouping {
    pub constant: String,
    pub variables: Vec<DataVariable>,
}

impl Grouping {
    pub fn parse(value: &str) -> Result<Grouping> {
        let mut grouping = Grouping {
            constant: String::new(),
            variables: Vec::new(),
        };
        for element in value_parser::parse_string(value)? {
            match element {
                StringElement::Text(text) => grouping.constant.push_str(&text),
                StringElement::Variable(variable) => {
                    if !variable.sub_query.is_empty() {
                        return Err(Error::parse(format!(
                            "grouping by sub-query variable {} is not supported",
                            variable
                        )));
                    }
                    grouping.variables.push(DataVariable {
                        position: grouping.constant.len(),
                        sub_query: variable.sub_query,
                        name: variable.name,
                    });
                }
            }
        }
        Ok(grouping)
    }

    /// Stream fields to group by, in template order.
    pub fn builtin_keys(&self) -> Vec<GroupingKey> {
        self.variables
            .iter()
            .filter_map(|v| GroupingKey::from_name(&v.name))
            .collect()
    }

    /// Captured output variables to group by, in template order.
    pub fn output_variables(&self) -> Vec<&str> {
        self.variables
            .iter()
            .filter(|v| GroupingKey::from_name(&v.name).is_none())
            .map(|v| v.name.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sort_lists() {
        let sorting = Sorting::parse_list("-ftime, id,- SPORT").unwrap();
        assert_eq!(
            sorting,
            vec![
                Sorting::descending(SortingKey::FirstPacketTime),
                Sorting::ascending(SortingKey::Id),
                Sorting::descending(SortingKey::ServerPort),
            ]
        );
        let rendered: Vec<String> = sorting.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, ["-ftime", "id", "-sport"]);
        assert!(Sorting::parse_list("port").is_err());
        assert!(Sorting::parse_list("id,-id").is_err());
        assert!(Sorting::parse_list("").is_err());
    }

    #[test]
    fn grouping_templates() {
        let grouping = Grouping::parse("@chost@ to @path@/@sport@").unwrap();
        assert_eq!(grouping.constant, " to /");
        assert_eq!(
            grouping.variables.iter().map(|v| v.position).collect::<Vec<_>>(),
            [0, 4, 5]
        );
        assert_eq!(
            grouping.builtin_keys(),
            [GroupingKey::ClientHost, GroupingKey::ServerPort]
        );
        assert_eq!(grouping.output_variables(), ["path"]);
        assert!(Grouping::parse("@a:chost@").is_err());
    }
}
