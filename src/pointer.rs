//! Pointers to events: by id, or by replaceable address.
//!
//! Pointers are what views hand to the missing-event loader when a seed query
//! comes back empty, and what `a` tags in deletion events reference. An address
//! is written `kind:pubkey:identifier`, e.g. `30023:79be…:my-article`.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::types::{EventId, Kind, PubKey, ReplaceableKey};

/// Points at a single event by id, with optional hints.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventPointer {
    /// Event id
    pub id: EventId,
    /// Relays that may carry the event
    pub relays: Vec<String>,
    /// Author, if known
    pub author: Option<PubKey>,
}

impl EventPointer {
    /// Pointer with no hints.
    pub fn new(id: impl Into<EventId>) -> Self {
        Self {
            id: id.into(),
            relays: Vec::new(),
            author: None,
        }
    }
}

/// Points at the latest version of a replaceable event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AddressPointer {
    /// Replaceable identity
    pub key: ReplaceableKey,
    /// Relays that may carry the event
    pub relays: Vec<String>,
}

impl AddressPointer {
    /// Pointer with no relay hints.
    pub fn new(key: ReplaceableKey) -> Self {
        Self {
            key,
            relays: Vec::new(),
        }
    }

    /// Parses `kind:pubkey:identifier`.
    ///
    /// The identifier may itself contain `:`; only the first two separators
    /// split. The kind must be replaceable or addressable.
    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, ':');
        let (kind, pubkey, identifier) = match (parts.next(), parts.next(), parts.next()) {
            (Some(k), Some(p), ident) if !p.is_empty() => (k, p, ident.unwrap_or("")),
            _ => return Err(Error::InvalidPointer(format!("invalid address '{s}'"))),
        };
        let kind: u16 = kind
            .parse()
            .map_err(|_| Error::InvalidPointer(format!("invalid kind in address '{s}'")))?;
        let kind = Kind::new(kind);
        if !kind.is_replaceable() {
            return Err(Error::InvalidPointer(format!(
                "address '{s}' does not name a replaceable kind"
            )));
        }
        Ok(Self::new(ReplaceableKey::new(kind, pubkey, identifier)))
    }
}

impl fmt::Display for AddressPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key)
    }
}

impl FromStr for AddressPointer {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Either kind of pointer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Pointer {
    /// By id
    Event(EventPointer),
    /// By replaceable address
    Address(AddressPointer),
}

impl fmt::Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pointer::Event(p) => write!(f, "{}", p.id),
            Pointer::Address(p) => write!(f, "{p}"),
        }
    }
}

impl From<EventPointer> for Pointer {
    fn from(p: EventPointer) -> Self {
        Pointer::Event(p)
    }
}

impl From<AddressPointer> for Pointer {
    fn from(p: AddressPointer) -> Self {
        Pointer::Address(p)
    }
}

impl From<ReplaceableKey> for Pointer {
    fn from(key: ReplaceableKey) -> Self {
        Pointer::Address(AddressPointer::new(key))
    }
}

impl From<EventId> for Pointer {
    fn from(id: EventId) -> Self {
        Pointer::Event(EventPointer::new(id))
    }
}
