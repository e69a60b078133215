//! Line protocol spoken between the reaper client and the sidecar.
//!
//! The client sends newline-terminated registration lines. A line holds one
//! or more `key=value` filters joined with `&`:
//!
//! ```text
//! label=dev.throwaway.session-id=5f0c…\n
//! label=dev.throwaway.session-id=5f0c…&label=dev.throwaway.reap=true\n
//! ```
//!
//! The sidecar answers every line with `ACK\n`, or `ERR <reason>\n` when the
//! line cannot be parsed. Every filter received on one connection belongs to
//! the same AND-set; different connections are OR-ed.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use crate::reaper::error::ReaperError;

/// Acknowledgement sent for every accepted line.
pub const ACK: &str = "ACK";

/// Prefix of the reply sent for a rejected line.
pub const ERR_PREFIX: &str = "ERR";

/// Longest line the sidecar accepts.
pub const MAX_LINE_LEN: usize = 8 * 1024;

/// A single `key=value` filter, e.g. `label=dev.throwaway.session-id=abc`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Filter {
    pub key: String,
    pub value: String,
}

impl Filter {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// A `label=<name>=<value>` filter.
    pub fn label(name: &str, value: &str) -> Self {
        Self::new("label", format!("{name}={value}"))
    }

    /// Whether a resource carrying `labels` (and identified by `id`/`name`)
    /// satisfies this filter. Unknown keys never match.
    pub fn matches(&self, id: &str, name: Option<&str>, labels: &BTreeMap<String, String>) -> bool {
        match self.key.as_str() {
            "label" => match self.value.split_once('=') {
                Some((k, v)) => labels.get(k).is_some_and(|actual| actual == v),
                None => labels.contains_key(&self.value),
            },
            "id" => id.starts_with(&self.value),
            "name" => name.is_some_and(|n| n.trim_start_matches('/') == self.value),
            _ => false,
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// A conjunction of filters. Ordered so equal sets compare and hash equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FilterSet(BTreeSet<Filter>);

impl FilterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Label filters for every entry of `labels`.
    pub fn from_labels<'a>(labels: impl IntoIterator<Item = (&'a String, &'a String)>) -> Self {
        Self(
            labels
                .into_iter()
                .map(|(k, v)| Filter::label(k, v))
                .collect(),
        )
    }

    pub fn with(mut self, filter: Filter) -> Self {
        self.0.insert(filter);
        self
    }

    /// Add a filter; returns `false` if it was already present.
    pub fn insert(&mut self, filter: Filter) -> bool {
        self.0.insert(filter)
    }

    pub fn extend(&mut self, filters: impl IntoIterator<Item = Filter>) {
        self.0.extend(filters);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Filter> {
        self.0.iter()
    }

    /// All filters must match. An empty set matches nothing, so a bare
    /// connection can never select every resource on the host.
    pub fn matches(&self, id: &str, name: Option<&str>, labels: &BTreeMap<String, String>) -> bool {
        !self.0.is_empty() && self.0.iter().all(|f| f.matches(id, name, labels))
    }

    /// Group values by key, the shape engine list APIs take.
    pub fn by_key(&self) -> HashMap<String, Vec<String>> {
        let mut out: HashMap<String, Vec<String>> = HashMap::new();
        for filter in &self.0 {
            out.entry(filter.key.clone())
                .or_default()
                .push(filter.value.clone());
        }
        out
    }

    /// Encode as a single protocol line, without the trailing newline.
    pub fn to_line(&self) -> String {
        self.0
            .iter()
            .map(Filter::to_string)
            .collect::<Vec<_>>()
            .join("&")
    }
}

impl FromIterator<Filter> for FilterSet {
    fn from_iter<I: IntoIterator<Item = Filter>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for FilterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line())
    }
}

/// Parse one registration line (trailing `\r\n`/`\n` tolerated).
pub fn parse_line(line: &str) -> Result<Vec<Filter>, ReaperError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Err(ReaperError::Protocol {
            reason: "empty registration line".to_string(),
        });
    }
    if line.len() > MAX_LINE_LEN {
        return Err(ReaperError::Protocol {
            reason: format!("line exceeds {MAX_LINE_LEN} bytes"),
        });
    }

    line.split('&')
        .map(|pair| {
            let (key, value) = pair.split_once('=').ok_or_else(|| ReaperError::Protocol {
                reason: format!("filter '{pair}' is not key=value"),
            })?;
            let key = key.trim();
            if key.is_empty() || value.is_empty() {
                return Err(ReaperError::Protocol {
                    reason: format!("filter '{pair}' has an empty key or value"),
                });
            }
            Ok(Filter::new(key, value))
        })
        .collect()
}

/// Classify a reply line from the sidecar.
pub fn parse_reply(line: &str) -> Result<(), ReaperError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line == ACK {
        return Ok(());
    }
    let reason = line
        .strip_prefix(ERR_PREFIX)
        .map(|r| r.trim().to_string())
        .unwrap_or_else(|| format!("unexpected reply '{line}'"));
    Err(ReaperError::Protocol { reason })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_single_filter_keeps_inner_equals() {
        let filters = parse_line("label=dev.throwaway.session-id=abc\n").unwrap();
        assert_eq!(
            filters,
            vec![Filter::new("label", "dev.throwaway.session-id=abc")]
        );
    }

    #[test]
    fn test_parse_joined_filters() {
        let filters = parse_line("label=a=1&label=b=2\r\n").unwrap();
        assert_eq!(filters.len(), 2);
        assert_eq!(filters[1], Filter::label("b", "2"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_line("\n").is_err());
        assert!(parse_line("label").is_err());
        assert!(parse_line("=x").is_err());
        assert!(parse_line(&"a=".repeat(MAX_LINE_LEN)).is_err());
    }

    #[test]
    fn test_line_round_trip_is_order_independent() {
        let a = FilterSet::new()
            .with(Filter::label("b", "2"))
            .with(Filter::label("a", "1"));
        let b: FilterSet = parse_line(&a.to_line()).unwrap().into_iter().collect();
        assert_eq!(a, b);
        assert_eq!(a.to_line(), "label=a=1&label=b=2");
    }

    #[test]
    fn test_filter_set_requires_all_filters() {
        let set = FilterSet::new()
            .with(Filter::label("session", "s1"))
            .with(Filter::label("reap", "true"));
        assert!(set.matches("id", None, &labels(&[("session", "s1"), ("reap", "true")])));
        assert!(!set.matches("id", None, &labels(&[("session", "s1")])));
        assert!(!set.matches("id", None, &labels(&[("session", "s2"), ("reap", "true")])));
    }

    #[test]
    fn test_empty_set_matches_nothing() {
        assert!(!FilterSet::new().matches("id", None, &labels(&[("a", "b")])));
    }

    #[test]
    fn test_label_presence_and_name_filters() {
        let l = labels(&[("marker", "x")]);
        assert!(Filter::new("label", "marker").matches("id", None, &l));
        assert!(Filter::new("name", "db").matches("id", Some("/db"), &l));
        assert!(Filter::new("id", "abc").matches("abcdef", None, &l));
        assert!(!Filter::new("volume", "x").matches("id", None, &l));
    }

    #[test]
    fn test_parse_reply() {
        assert!(parse_reply("ACK\n").is_ok());
        let err = parse_reply("ERR bad filter\n").unwrap_err();
        assert!(err.to_string().contains("bad filter"));
        assert!(parse_reply("HELLO\n").is_err());
    }
}
