//! # Domain Types for NestDB
//!
//! This module defines the event record and the identity keys derived from it.
//!
//! ## Design Philosophy: Newtypes for Safety
//!
//! Event ids and author keys are both 64-character hex strings. Wrapping them in
//! distinct newtypes means a function that wants an [`EventId`] can't be handed
//! a [`PubKey`] by mistake, and the kind number carries its own classification
//! helpers.
//!
//! ## Identity
//!
//! ```text
//! Event ──► id                          (primary index)
//!       └─► (kind, pubkey, identifier)  (replaceable index, only for
//!                                        replaceable/addressable kinds)
//! ```
//!
//! ## Invariants
//!
//! - [`Event`] is immutable once stored; the store hands out `Arc<Event>` and
//!   never mutates protocol fields.
//! - `id` is a pure function of the other fields (see [`crate::codec::compute_id`]).
//! - For addressable kinds the identifier is the value of the first `d` tag,
//!   or `""` when the tag is absent.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec;

/// Unix timestamp in seconds.
pub type Timestamp = u64;

// =============================================================================
// Identifiers
// =============================================================================

/// Content hash of an event (lowercase hex SHA-256).
///
/// `Ord` is lexicographic on the hex string, which is also the tie-break used
/// when two versions of a replaceable event share a `created_at`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    /// Creates an event id from a string.
    ///
    /// No validation happens here; ids coming from the network are checked by
    /// [`crate::codec::verify_id`] when `verify_ids` is enabled.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string representation of this id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EventId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for EventId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Author public key (hex).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PubKey(String);

impl PubKey {
    /// Creates a public key from a string.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the string representation of this key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PubKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for PubKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// =============================================================================
// Kinds
// =============================================================================

/// How the protocol treats events of a given kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindClass {
    /// Stored as-is; every event is independent.
    Regular,
    /// One latest version per (kind, pubkey).
    Replaceable,
    /// Not expected to be stored by relays. Kept like regular events here.
    Ephemeral,
    /// One latest version per (kind, pubkey, `d` tag).
    Addressable,
}

/// Event kind number.
///
/// # Ranges
///
/// | Range | Class |
/// |-------|-------|
/// | `0`, `3`, `10000..20000` | replaceable |
/// | `20000..30000` | ephemeral |
/// | `30000..40000` | addressable |
/// | everything else | regular |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Kind(u16);

impl Kind {
    /// User metadata (profile).
    pub const METADATA: Kind = Kind(0);
    /// Short text note.
    pub const TEXT_NOTE: Kind = Kind(1);
    /// Follow list.
    pub const CONTACTS: Kind = Kind(3);
    /// Deletion request.
    pub const DELETION: Kind = Kind(5);

    /// Creates a kind from its number.
    pub const fn new(kind: u16) -> Self {
        Self(kind)
    }

    /// Returns the raw kind number.
    pub fn as_u16(&self) -> u16 {
        self.0
    }

    /// Classifies this kind.
    pub fn class(&self) -> KindClass {
        match self.0 {
            0 | 3 | 10_000..=19_999 => KindClass::Replaceable,
            20_000..=29_999 => KindClass::Ephemeral,
            30_000..=39_999 => KindClass::Addressable,
            _ => KindClass::Regular,
        }
    }

    /// True for both simple replaceable and addressable kinds: any kind where
    /// a newer event supersedes an older one.
    pub fn is_replaceable(&self) -> bool {
        matches!(self.class(), KindClass::Replaceable | KindClass::Addressable)
    }

    /// True only for addressable (`d`-tagged) kinds.
    pub fn is_addressable(&self) -> bool {
        self.class() == KindClass::Addressable
    }

    /// True for ephemeral kinds.
    pub fn is_ephemeral(&self) -> bool {
        self.class() == KindClass::Ephemeral
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for Kind {
    fn from(kind: u16) -> Self {
        Self(kind)
    }
}

// =============================================================================
// Tags
// =============================================================================

/// A tag: an array of strings whose first element names the tag.
///
/// Tags are stored verbatim so uncommon or custom tags survive a round trip.
/// `["t", "news"]` is represented as `Tag(vec!["t".into(), "news".into()])`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Builds a tag from any iterable of string-likes.
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(fields.into_iter().map(Into::into).collect())
    }

    /// The tag name (first element), if any.
    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// The tag value (second element), if any.
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }

    /// Returns the single-letter name of an indexable tag.
    ///
    /// Only tags named by exactly one ASCII letter and carrying a value are
    /// indexed and can be matched by `#x` filter constraints.
    pub fn indexable_name(&self) -> Option<char> {
        let name = self.name()?;
        self.value()?;
        let mut chars = name.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) if c.is_ascii_alphabetic() => Some(c),
            _ => None,
        }
    }
}

// =============================================================================
// Replaceable Identity
// =============================================================================

/// The identity shared by every version of a replaceable event.
///
/// `identifier` is `""` for simple replaceable kinds and the `d` tag value for
/// addressable kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReplaceableKey {
    /// Event kind (replaceable or addressable)
    pub kind: Kind,
    /// Author
    pub pubkey: PubKey,
    /// `d` tag value, or empty
    pub identifier: String,
}

impl ReplaceableKey {
    /// Creates a key. The identifier is ignored (set to `""`) for simple
    /// replaceable kinds so lookups can't miss on a stray `d` tag.
    pub fn new(kind: Kind, pubkey: impl Into<PubKey>, identifier: impl Into<String>) -> Self {
        let identifier = if kind.is_addressable() {
            identifier.into()
        } else {
            String::new()
        };
        Self {
            kind,
            pubkey: pubkey.into(),
            identifier,
        }
    }
}

impl fmt::Display for ReplaceableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.kind, self.pubkey, self.identifier)
    }
}

// =============================================================================
// Event
// =============================================================================

/// A signed protocol event.
///
/// ```json
/// {
///   "id": "aa11...",
///   "pubkey": "79be...",
///   "kind": 1,
///   "created_at": 1700000000,
///   "tags": [["t", "news"], ["d", "slug"]],
///   "content": "hello",
///   "sig": "dead..."
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Event identifier (hex of SHA-256 over the canonical serialization).
    pub id: EventId,
    /// Author public key (hex).
    pub pubkey: PubKey,
    /// Unix timestamp of creation.
    pub created_at: Timestamp,
    /// Kind number.
    pub kind: Kind,
    /// Tags such as `e`, `p`, `d` or `t`.
    pub tags: Vec<Tag>,
    /// Opaque content body.
    pub content: String,
    /// Schnorr signature over the id. Never checked by the store itself.
    pub sig: String,
}

impl Event {
    /// The identifier used for the replaceable index: first `d` tag value for
    /// addressable kinds, `""` otherwise.
    pub fn identifier(&self) -> &str {
        if !self.kind.is_addressable() {
            return "";
        }
        self.tags
            .iter()
            .find(|tag| tag.name() == Some("d"))
            .and_then(Tag::value)
            .unwrap_or("")
    }

    /// Returns the replaceable identity, or `None` for regular/ephemeral kinds.
    pub fn replaceable_key(&self) -> Option<ReplaceableKey> {
        if !self.kind.is_replaceable() {
            return None;
        }
        Some(ReplaceableKey {
            kind: self.kind,
            pubkey: self.pubkey.clone(),
            identifier: self.identifier().to_string(),
        })
    }

    /// Iterates `(letter, value)` for every indexable tag.
    pub fn indexable_tags(&self) -> impl Iterator<Item = (char, &str)> + '_ {
        self.tags.iter().filter_map(|tag| {
            let name = tag.indexable_name()?;
            Some((name, tag.value()?))
        })
    }

    /// True if the event carries tag `name` with value `value`.
    pub fn has_tag(&self, name: char, value: &str) -> bool {
        self.indexable_tags().any(|(n, v)| n == name && v == value)
    }

    /// Values of every tag named `name` (any arity ≥ 2).
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |tag| tag.name() == Some(name))
            .filter_map(Tag::value)
    }

    /// NIP-40 expiration timestamp, if the event carries a parseable one.
    pub fn expiration(&self) -> Option<Timestamp> {
        self.tag_values("expiration").next()?.parse().ok()
    }

    /// True if the event has an expiration tag at or before `now`.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expiration().is_some_and(|exp| exp <= now)
    }

    /// Orders two events by recency: later `created_at` first, then the higher
    /// id. `Ordering::Greater` means `self` is more recent.
    ///
    /// This single rule decides both replaceable supersession and timeline
    /// order, so the current version of a replaceable event is always the
    /// first entry of its history.
    pub fn recency_cmp(&self, other: &Event) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.id.cmp(&other.id))
    }

    /// True if `self` supersedes `other` under [`Event::recency_cmp`].
    pub fn is_newer_than(&self, other: &Event) -> bool {
        self.recency_cmp(other) == Ordering::Greater
    }
}

// =============================================================================
// Event Builder
// =============================================================================

/// Builds unsigned events with a correctly computed id.
///
/// Signing is out of scope for the store; the `sig` field is left empty unless
/// set explicitly. Mostly useful for tests, fixtures and local drafts.
///
/// ```rust
/// use nestdb::types::{EventBuilder, Kind};
///
/// let note = EventBuilder::new(Kind::TEXT_NOTE, "79be")
///     .created_at(1_700_000_000)
///     .tag(["t", "news"])
///     .content("hello")
///     .build();
/// assert_eq!(note.id.as_str().len(), 64);
/// ```
#[derive(Debug, Clone)]
pub struct EventBuilder {
    pubkey: PubKey,
    kind: Kind,
    created_at: Timestamp,
    tags: Vec<Tag>,
    content: String,
    sig: String,
}

impl EventBuilder {
    /// Starts a builder for `kind` authored by `pubkey`.
    pub fn new(kind: impl Into<Kind>, pubkey: impl Into<PubKey>) -> Self {
        Self {
            pubkey: pubkey.into(),
            kind: kind.into(),
            created_at: codec::current_time_secs(),
            tags: Vec::new(),
            content: String::new(),
            sig: String::new(),
        }
    }

    /// Sets `created_at` (defaults to now).
    pub fn created_at(mut self, created_at: Timestamp) -> Self {
        self.created_at = created_at;
        self
    }

    /// Appends a tag.
    pub fn tag<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.push(Tag::new(fields));
        self
    }

    /// Appends a `d` tag (identifier for addressable kinds).
    pub fn identifier(self, d: impl Into<String>) -> Self {
        self.tag(["d".to_string(), d.into()])
    }

    /// Sets the content.
    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    /// Sets a signature produced elsewhere.
    pub fn sig(mut self, sig: impl Into<String>) -> Self {
        self.sig = sig.into();
        self
    }

    /// Finalizes the event, computing its id.
    pub fn build(self) -> Event {
        let mut event = Event {
            id: EventId::new(String::new()),
            pubkey: self.pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig: self.sig,
        };
        event.id = codec::compute_id(&event);
        event
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(Kind::new(0).class(), KindClass::Replaceable);
        assert_eq!(Kind::new(1).class(), KindClass::Regular);
        assert_eq!(Kind::new(3).class(), KindClass::Replaceable);
        assert_eq!(Kind::new(10_002).class(), KindClass::Replaceable);
        assert_eq!(Kind::new(20_001).class(), KindClass::Ephemeral);
        assert_eq!(Kind::new(30_023).class(), KindClass::Addressable);
        assert_eq!(Kind::new(40_000).class(), KindClass::Regular);

        assert!(Kind::new(30_023).is_replaceable());
        assert!(!Kind::new(1).is_replaceable());
    }

    #[test]
    fn test_identifier_only_for_addressable() {
        let article = EventBuilder::new(30_023, "pk").identifier("slug").build();
        assert_eq!(article.identifier(), "slug");

        // A `d` tag on a simple replaceable kind doesn't create a new slot
        let profile = EventBuilder::new(0, "pk").identifier("ignored").build();
        assert_eq!(profile.identifier(), "");
        assert_eq!(
            profile.replaceable_key(),
            Some(ReplaceableKey::new(Kind::METADATA, "pk", ""))
        );

        // Missing `d` tag on an addressable kind means the empty identifier
        let bare = EventBuilder::new(30_000, "pk").build();
        assert_eq!(bare.identifier(), "");

        let note = EventBuilder::new(1, "pk").build();
        assert!(note.replaceable_key().is_none());
    }

    #[test]
    fn test_indexable_tags() {
        let event = EventBuilder::new(1, "pk")
            .tag(["e", "abc", "wss://relay"])
            .tag(["expiration", "100"])
            .tag(["p"])
            .tag(["T", "Upper"])
            .build();

        let tags: Vec<(char, &str)> = event.indexable_tags().collect();
        assert_eq!(tags, vec![('e', "abc"), ('T', "Upper")]);
        assert!(event.has_tag('e', "abc"));
        assert!(!event.has_tag('p', ""));
    }

    #[test]
    fn test_expiration() {
        let event = EventBuilder::new(1, "pk").tag(["expiration", "100"]).build();
        assert_eq!(event.expiration(), Some(100));
        assert!(event.is_expired(100));
        assert!(!event.is_expired(99));

        let garbage = EventBuilder::new(1, "pk").tag(["expiration", "soon"]).build();
        assert_eq!(garbage.expiration(), None);
    }

    #[test]
    fn test_recency_tie_break_prefers_higher_id() {
        let mut a = EventBuilder::new(0, "pk").created_at(10).build();
        let mut b = a.clone();
        a.id = EventId::new("aaaa");
        b.id = EventId::new("bbbb");

        assert!(b.is_newer_than(&a));
        assert!(!a.is_newer_than(&b));

        let later = EventBuilder::new(0, "pk").created_at(11).build();
        assert!(later.is_newer_than(&b));
    }

    #[test]
    fn test_event_json_shape() {
        let event = EventBuilder::new(1, "pk")
            .created_at(5)
            .tag(["t", "news"])
            .content("hi")
            .build();
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["kind"], 1);
        assert_eq!(value["pubkey"], "pk");
        assert_eq!(value["tags"][0][1], "news");

        let back: Event = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }
}
