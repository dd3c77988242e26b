//! The `<name>[#<ranges>]` rules of the `pfNames` and `rootDevices` selectors.
//!
//! `ens2f0` matches every VF of `ens2f0`, `ens2f0#0,3-5` only VFs 0, 3, 4 and 5. Entries of the
//! range list that are not an integer or an inclusive `a-b` range are ignored, a rule left without
//! any usable entry or with more than one `#` matches nothing.
use std::ops::RangeInclusive;

use tracing::warn;

/// A parsed name rule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NameRange {
    name: String,
    indexes: Indexes,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Indexes {
    Any,
    Only(Vec<RangeInclusive<i32>>),
    Never,
}

impl NameRange {
    /// Parses a rule. Parsing never fails, malformed rules simply never match.
    pub fn parse(rule: &str) -> Self {
        let mut parts = rule.split('#');
        let name = parts.next().unwrap_or_default().to_owned();
        let indexes = match (parts.next(), parts.next()) {
            (None, _) => Indexes::Any,
            (Some(ranges), None) => {
                let ranges = ranges
                    .split(',')
                    .filter_map(|entry| {
                        let range = parse_entry(entry.trim());
                        if range.is_none() && !entry.trim().is_empty() {
                            warn!(rule, entry, "Ignoring malformed VF range");
                        }
                        range
                    })
                    .collect::<Vec<_>>();
                if ranges.is_empty() {
                    Indexes::Never
                } else {
                    Indexes::Only(ranges)
                }
            }
            (Some(_), Some(_)) => {
                warn!(rule, "Ignoring selector with more than one '#'");
                Indexes::Never
            }
        };
        NameRange { name, indexes }
    }

    /// The name part of the rule.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True when `name` is the rule's name and `index` is in its ranges. A bare name matches any
    /// index, including devices without one.
    pub fn matches(&self, name: &str, index: Option<i32>) -> bool {
        if self.name != name {
            return false;
        }
        match &self.indexes {
            Indexes::Any => true,
            Indexes::Only(ranges) => {
                index.map_or(false, |i| ranges.iter().any(|r| r.contains(&i)))
            }
            Indexes::Never => false,
        }
    }
}

fn parse_entry(entry: &str) -> Option<RangeInclusive<i32>> {
    match entry.split_once('-') {
        Some((start, end)) => Some(start.trim().parse().ok()?..=end.trim().parse().ok()?),
        None => {
            let index = entry.parse().ok()?;
            Some(index..=index)
        }
    }
}
