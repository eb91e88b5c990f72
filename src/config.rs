//! Store configuration.
//!
//! Defaults suit an interactive client. `StoreConfig::from_env` lets a host
//! application override them without recompiling:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `NESTDB_FEED_CAPACITY` | `feed_capacity` |
//! | `NESTDB_INTERN_CACHE` | `intern_cache_size` |
//! | `NESTDB_VERIFY_IDS` | `verify_ids` (`1`/`true`/`yes`) |
//! | `NESTDB_KEEP_EXPIRED` | `keep_expired` |
//! | `NESTDB_REMEMBER_DELETIONS` | `remember_deletions` |
//! | `NESTDB_REQUEST_CHANNEL` | `request_channel_size` |

use std::env;
use std::str::FromStr;

use tracing::warn;

use crate::feed::DEFAULT_FEED_CAPACITY;

/// Decoded events the SQLite backend keeps shared per id.
pub const DEFAULT_INTERN_CACHE_SIZE: usize = 4096;

/// Size of the async handle's request channel.
pub const DEFAULT_REQUEST_CHANNEL_SIZE: usize = 1024;

/// Tunables for [`crate::store::EventStore`] and [`crate::api::StoreHandle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Changes buffered per feed subscriber before it lags.
    pub feed_capacity: usize,

    /// Entries in the SQLite backend's decoded-event cache.
    pub intern_cache_size: usize,

    /// Recompute and check event ids on `add`.
    pub verify_ids: bool,

    /// Accept events whose expiration time has already passed.
    pub keep_expired: bool,

    /// Remember ids and addresses removed by deletion events and refuse to
    /// store them again.
    pub remember_deletions: bool,

    /// Pending requests the async handle queues before callers wait.
    pub request_channel_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            feed_capacity: DEFAULT_FEED_CAPACITY,
            intern_cache_size: DEFAULT_INTERN_CACHE_SIZE,
            verify_ids: false,
            keep_expired: false,
            remember_deletions: true,
            request_channel_size: DEFAULT_REQUEST_CHANNEL_SIZE,
        }
    }
}

impl StoreConfig {
    /// Defaults overridden by any `NESTDB_*` variables that are set.
    ///
    /// Unparseable values are logged and ignored.
    pub fn from_env() -> Self {
        Self::default().merge_env(|name| env::var(name).ok())
    }

    fn merge_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = parse_var(&lookup, "NESTDB_FEED_CAPACITY") {
            self.feed_capacity = v;
        }
        if let Some(v) = parse_var(&lookup, "NESTDB_INTERN_CACHE") {
            self.intern_cache_size = v;
        }
        if let Some(v) = bool_var(&lookup, "NESTDB_VERIFY_IDS") {
            self.verify_ids = v;
        }
        if let Some(v) = bool_var(&lookup, "NESTDB_KEEP_EXPIRED") {
            self.keep_expired = v;
        }
        if let Some(v) = bool_var(&lookup, "NESTDB_REMEMBER_DELETIONS") {
            self.remember_deletions = v;
        }
        if let Some(v) = parse_var(&lookup, "NESTDB_REQUEST_CHANNEL") {
            self.request_channel_size = v;
        }
        self
    }

    /// Sets `verify_ids`.
    pub fn verify_ids(mut self, verify: bool) -> Self {
        self.verify_ids = verify;
        self
    }

    /// Sets `keep_expired`.
    pub fn keep_expired(mut self, keep: bool) -> Self {
        self.keep_expired = keep;
        self
    }

    /// Sets `feed_capacity`.
    pub fn feed_capacity(mut self, capacity: usize) -> Self {
        self.feed_capacity = capacity;
        self
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("ignoring {name}={raw:?}: not a valid number");
            None
        }
    }
}

fn bool_var(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<bool> {
    let raw = lookup(name)?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            warn!("ignoring {name}={raw:?}: expected a boolean");
            None
        }
    }
}
