//! # Query Filters
//!
//! A [`Filter`] is a conjunction of optional constraints. A filter list
//! (`&[Filter]`) matches an event if ANY filter matches:
//!
//! ```text
//! [ {kinds:[0]}, {kinds:[1], authors:[pk]} ]
//!        │                  │
//!        └──── OR ──────────┘       (each filter: AND of its constraints)
//! ```
//!
//! ## Missing vs Empty Constraints
//!
//! `kinds: None` means "any kind". `kinds: Some({})` means "no kind", so the
//! filter matches nothing. The same holds for `ids`, `authors` and every tag
//! constraint. JSON `{"kinds": []}` parses to the empty set, never to `None`.
//!
//! ## Limits
//!
//! `limit` caps a whole filter-list query, not each filter: the smallest limit
//! in the list wins and the most recent events are kept (see
//! [`effective_limit`]).
//!
//! ## Supported Keys
//!
//! `ids`, `kinds`, `authors`, `#<letter>`, `since`, `until`, `limit`. Anything
//! else (`search`, `#long-name`, ...) is rejected with
//! [`Error::MalformedFilter`].

use std::collections::{BTreeMap, BTreeSet};

use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::types::{Event, EventId, Kind, PubKey, Timestamp};

// =============================================================================
// Filter
// =============================================================================

/// A single filter: every present constraint must hold.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    /// Event ids to match.
    pub ids: Option<BTreeSet<EventId>>,
    /// Kinds to match.
    pub kinds: Option<BTreeSet<Kind>>,
    /// Authors to match.
    pub authors: Option<BTreeSet<PubKey>>,
    /// `#x` constraints: the event needs at least one tag `x` whose value is in
    /// the set.
    pub tags: BTreeMap<char, BTreeSet<String>>,
    /// Lower bound on `created_at` (inclusive).
    pub since: Option<Timestamp>,
    /// Upper bound on `created_at` (inclusive).
    pub until: Option<Timestamp>,
    /// Cap on the number of results for the whole filter list.
    pub limit: Option<usize>,
}

impl Filter {
    /// An unconstrained filter (matches every event).
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one id.
    pub fn id(mut self, id: impl Into<EventId>) -> Self {
        self.ids.get_or_insert_with(BTreeSet::new).insert(id.into());
        self
    }

    /// Sets the id constraint. An empty iterator makes the filter match nothing.
    pub fn ids<I, T>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<EventId>,
    {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    /// Adds one kind.
    pub fn kind(mut self, kind: impl Into<Kind>) -> Self {
        self.kinds.get_or_insert_with(BTreeSet::new).insert(kind.into());
        self
    }

    /// Sets the kind constraint. An empty iterator makes the filter match
    /// nothing.
    pub fn kinds<I, T>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Kind>,
    {
        self.kinds = Some(kinds.into_iter().map(Into::into).collect());
        self
    }

    /// Adds one author.
    pub fn author(mut self, author: impl Into<PubKey>) -> Self {
        self.authors
            .get_or_insert_with(BTreeSet::new)
            .insert(author.into());
        self
    }

    /// Sets the author constraint.
    pub fn authors<I, T>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<PubKey>,
    {
        self.authors = Some(authors.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the `#name` constraint.
    pub fn tag<I, T>(mut self, name: char, values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.tags
            .insert(name, values.into_iter().map(Into::into).collect());
        self
    }

    /// Sets `since` (inclusive).
    pub fn since(mut self, since: Timestamp) -> Self {
        self.since = Some(since);
        self
    }

    /// Sets `until` (inclusive).
    pub fn until(mut self, until: Timestamp) -> Self {
        self.until = Some(until);
        self
    }

    /// Sets `limit`.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    // =========================================================================
    // Validation
    // =========================================================================

    /// Rejects constraint shapes the evaluator doesn't support.
    ///
    /// Filters built from JSON are already validated; this catches builder
    /// misuse such as `tag('1', ...)`.
    pub fn validate(&self) -> Result<()> {
        for name in self.tags.keys() {
            if !name.is_ascii_alphabetic() {
                return Err(Error::MalformedFilter(format!(
                    "tag constraint '#{name}' is not a single letter"
                )));
            }
        }
        Ok(())
    }

    /// True if no event can ever satisfy this filter.
    pub fn matches_nothing(&self) -> bool {
        let empty_ids = self.ids.as_ref().is_some_and(BTreeSet::is_empty);
        let empty_kinds = self.kinds.as_ref().is_some_and(BTreeSet::is_empty);
        let empty_authors = self.authors.as_ref().is_some_and(BTreeSet::is_empty);
        let empty_tag = self.tags.values().any(BTreeSet::is_empty);
        let bad_range = matches!((self.since, self.until), (Some(s), Some(u)) if s > u);
        empty_ids || empty_kinds || empty_authors || empty_tag || bad_range
    }

    // =========================================================================
    // Matching
    // =========================================================================

    /// Evaluates the filter against one event.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.contains(&event.id) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.contains(&event.pubkey) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }
        self.tags.iter().all(|(name, values)| {
            event
                .indexable_tags()
                .any(|(n, v)| n == *name && values.contains(v))
        })
    }

    // =========================================================================
    // JSON
    // =========================================================================

    /// Parses a protocol filter object.
    ///
    /// # Errors
    ///
    /// `Error::MalformedFilter` for non-objects, unsupported keys, and values
    /// of the wrong JSON type.
    pub fn from_value(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::MalformedFilter("filter must be a JSON object".to_string()))?;

        let mut filter = Filter::new();
        for (key, val) in obj {
            match key.as_str() {
                "ids" => filter.ids = Some(string_set(key, val)?.into_iter().map(EventId::new).collect()),
                "authors" => {
                    filter.authors = Some(string_set(key, val)?.into_iter().map(PubKey::new).collect())
                }
                "kinds" => {
                    let arr = val.as_array().ok_or_else(|| wrong_type(key, "an array"))?;
                    let mut kinds = BTreeSet::new();
                    for k in arr {
                        let k = k
                            .as_u64()
                            .and_then(|k| u16::try_from(k).ok())
                            .ok_or_else(|| wrong_type(key, "an array of kind numbers"))?;
                        kinds.insert(Kind::new(k));
                    }
                    filter.kinds = Some(kinds);
                }
                "since" => filter.since = Some(val.as_u64().ok_or_else(|| wrong_type(key, "a timestamp"))?),
                "until" => filter.until = Some(val.as_u64().ok_or_else(|| wrong_type(key, "a timestamp"))?),
                "limit" => {
                    let limit = val.as_u64().ok_or_else(|| wrong_type(key, "a number"))?;
                    filter.limit = Some(usize::try_from(limit).unwrap_or(usize::MAX));
                }
                tag if tag.starts_with('#') => {
                    let mut chars = tag[1..].chars();
                    let name = match (chars.next(), chars.next()) {
                        (Some(c), None) if c.is_ascii_alphabetic() => c,
                        _ => {
                            return Err(Error::MalformedFilter(format!(
                                "tag constraint '{tag}' is not a single letter"
                            )))
                        }
                    };
                    filter.tags.insert(name, string_set(key, val)?);
                }
                other => {
                    return Err(Error::MalformedFilter(format!("unsupported key '{other}'")));
                }
            }
        }
        Ok(filter)
    }

    /// Renders the filter as a protocol JSON object.
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        if let Some(ids) = &self.ids {
            obj.insert("ids".into(), ids.iter().map(|i| i.as_str()).collect());
        }
        if let Some(kinds) = &self.kinds {
            obj.insert("kinds".into(), kinds.iter().map(|k| k.as_u16()).collect());
        }
        if let Some(authors) = &self.authors {
            obj.insert("authors".into(), authors.iter().map(|a| a.as_str()).collect());
        }
        for (name, values) in &self.tags {
            obj.insert(format!("#{name}"), values.iter().map(String::as_str).collect());
        }
        if let Some(since) = self.since {
            obj.insert("since".into(), since.into());
        }
        if let Some(until) = self.until {
            obj.insert("until".into(), until.into());
        }
        if let Some(limit) = self.limit {
            obj.insert("limit".into(), limit.into());
        }
        Value::Object(obj)
    }
}

fn wrong_type(key: &str, expected: &str) -> Error {
    Error::MalformedFilter(format!("'{key}' must be {expected}"))
}

fn string_set(key: &str, val: &Value) -> Result<BTreeSet<String>> {
    let arr = val.as_array().ok_or_else(|| wrong_type(key, "an array"))?;
    arr.iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| wrong_type(key, "an array of strings"))
        })
        .collect()
}

impl TryFrom<&Value> for Filter {
    type Error = Error;

    fn try_from(value: &Value) -> Result<Self> {
        Filter::from_value(value)
    }
}

impl Serialize for Filter {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let Value::Object(obj) = self.to_value() else {
            unreachable!("to_value always produces an object");
        };
        let mut map = serializer.serialize_map(Some(obj.len()))?;
        for (k, v) in &obj {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Filter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Filter::from_value(&value).map_err(D::Error::custom)
    }
}

// =============================================================================
// Filter Lists
// =============================================================================

/// True if any filter in the list matches.
///
/// An empty list matches nothing.
pub fn matches_any(filters: &[Filter], event: &Event) -> bool {
    filters.iter().any(|f| f.matches(event))
}

/// The cap applied to a filter-list query: the smallest `limit` present.
pub fn effective_limit(filters: &[Filter]) -> Option<usize> {
    filters.iter().filter_map(|f| f.limit).min()
}

/// Validates every filter in the list.
pub fn validate_all(filters: &[Filter]) -> Result<()> {
    filters.iter().try_for_each(Filter::validate)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventBuilder;
    use serde_json::json;

    fn note(pubkey: &str, created_at: Timestamp) -> Event {
        EventBuilder::new(1, pubkey).created_at(created_at).build()
    }

    #[test]
    fn test_or_across_filters_and_within() {
        let profile = EventBuilder::new(0, "pk").created_at(1).build();
        let text = note("pk", 2);
        let other = EventBuilder::new(7, "pk").created_at(3).build();

        let list = [Filter::new().kinds([0u16]), Filter::new().kinds([1u16])];
        assert!(matches_any(&list, &profile));
        assert!(matches_any(&list, &text));
        assert!(!matches_any(&list, &other));

        let and = Filter::new().kinds([0u16]).authors(["pk"]);
        assert!(and.matches(&profile));
        assert!(!and.matches(&EventBuilder::new(0, "someone").build()));
        assert!(!and.matches(&text));
    }

    #[test]
    fn test_empty_constraint_matches_nothing() {
        let event = note("pk", 1);

        let empty_kinds = Filter::new().kinds(Vec::<u16>::new());
        assert!(!empty_kinds.matches(&event));
        assert!(empty_kinds.matches_nothing());

        // Not the same thing as "no kind constraint"
        assert!(Filter::new().matches(&event));
        assert!(!Filter::new().matches_nothing());

        let parsed = Filter::from_value(&json!({ "kinds": [] })).unwrap();
        assert_eq!(parsed.kinds, Some(BTreeSet::new()));
        assert!(!parsed.matches(&event));

        let empty_tag = Filter::new().tag('e', Vec::<String>::new());
        assert!(!empty_tag.matches(&EventBuilder::new(1, "pk").tag(["e", "x"]).build()));
    }

    #[test]
    fn test_tag_constraints() {
        let event = EventBuilder::new(1, "pk")
            .tag(["t", "rust"])
            .tag(["p", "alice"])
            .build();

        assert!(Filter::new().tag('t', ["rust", "go"]).matches(&event));
        assert!(!Filter::new().tag('t', ["go"]).matches(&event));
        assert!(Filter::new()
            .tag('t', ["rust"])
            .tag('p', ["alice"])
            .matches(&event));
        assert!(!Filter::new()
            .tag('t', ["rust"])
            .tag('p', ["bob"])
            .matches(&event));

        // Events without tags satisfy tag-free filters
        let bare = note("pk", 1);
        assert!(Filter::new().kinds([1u16]).matches(&bare));
        assert!(!Filter::new().tag('t', ["rust"]).matches(&bare));
    }

    #[test]
    fn test_time_range() {
        let filter = Filter::new().since(10).until(20);
        assert!(!filter.matches(&note("pk", 9)));
        assert!(filter.matches(&note("pk", 10)));
        assert!(filter.matches(&note("pk", 20)));
        assert!(!filter.matches(&note("pk", 21)));

        assert!(Filter::new().since(5).until(4).matches_nothing());
    }

    #[test]
    fn test_effective_limit_is_minimum() {
        assert_eq!(effective_limit(&[Filter::new()]), None);
        assert_eq!(
            effective_limit(&[Filter::new().limit(10), Filter::new(), Filter::new().limit(3)]),
            Some(3)
        );
    }

    #[test]
    fn test_from_value_full() {
        let filter = Filter::from_value(&json!({
            "ids": ["a"],
            "kinds": [1, 30023],
            "authors": ["pk"],
            "#t": ["news"],
            "since": 5,
            "until": 50,
            "limit": 2
        }))
        .unwrap();

        assert_eq!(filter.kinds.as_ref().map(BTreeSet::len), Some(2));
        assert_eq!(filter.tags.get(&'t').map(BTreeSet::len), Some(1));
        assert_eq!(filter.limit, Some(2));

        let back = Filter::from_value(&filter.to_value()).unwrap();
        assert_eq!(back, filter);
    }

    #[test]
    fn test_malformed_filters_rejected() {
        let cases = [
            json!({ "search": "cats" }),
            json!({ "#long": ["x"] }),
            json!({ "#1": ["x"] }),
            json!({ "kinds": "1" }),
            json!({ "kinds": [70000] }),
            json!({ "authors": [1] }),
            json!({ "since": -1 }),
            json!(["not", "an", "object"]),
        ];
        for case in cases {
            assert!(
                matches!(Filter::from_value(&case), Err(Error::MalformedFilter(_))),
                "expected {case} to be rejected"
            );
        }

        assert!(Filter::new().tag('1', ["x"]).validate().is_err());
        assert!(Filter::new().tag('e', ["x"]).validate().is_ok());
    }

    #[test]
    fn test_serde_integration() {
        let filter: Filter = serde_json::from_str(r##"{"kinds":[1],"#e":["x"]}"##).unwrap();
        assert_eq!(filter, Filter::new().kinds([1u16]).tag('e', ["x"]));

        let err = serde_json::from_str::<Filter>(r#"{"bogus":1}"#);
        assert!(err.is_err());

        let json = serde_json::to_value(&filter).unwrap();
        assert_eq!(json, json!({ "kinds": [1], "#e": ["x"] }));
    }
}
