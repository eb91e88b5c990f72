//! Models opened by name with JSON parameters.
//!
//! Lets a host that only speaks JSON (a bridge, a config file) open views
//! without naming Rust types:
//!
//! ```rust
//! use nestdb::{ErasedView, EventStore, ModelRegistry};
//! use serde_json::json;
//!
//! let store = EventStore::in_memory();
//! let registry = ModelRegistry::with_defaults();
//! let mut view = registry.open(&store, "timeline", &json!({
//!     "filters": [{ "kinds": [1], "limit": 20 }]
//! }))?;
//! view.sync()?;
//! # Ok::<(), nestdb::Error>(())
//! ```

use std::collections::HashMap;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::pointer::AddressPointer;
use crate::store::EventStore;
use crate::types::{EventId, Kind, ReplaceableKey};

use super::{LiveView, Model, TimelineSnapshot, ViewState};

/// Output of a type-erased view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelOutput {
    /// From single-event and replaceable views
    State(ViewState),
    /// From timeline views
    Timeline(TimelineSnapshot),
}

impl From<ViewState> for ModelOutput {
    fn from(state: ViewState) -> Self {
        ModelOutput::State(state)
    }
}

impl From<TimelineSnapshot> for ModelOutput {
    fn from(snapshot: TimelineSnapshot) -> Self {
        ModelOutput::Timeline(snapshot)
    }
}

/// A [`LiveView`] with its model type erased.
pub trait ErasedView: Send + std::fmt::Debug {
    /// See [`LiveView::sync`].
    fn sync(&mut self) -> Result<bool>;
    /// See [`LiveView::current`].
    fn current(&self) -> ModelOutput;
    /// See [`LiveView::version`].
    fn version(&self) -> u64;
}

impl<M> ErasedView for LiveView<M>
where
    M: Model,
    M::Output: Into<ModelOutput>,
{
    fn sync(&mut self) -> Result<bool> {
        LiveView::sync(self)
    }

    fn current(&self) -> ModelOutput {
        LiveView::current(self).into()
    }

    fn version(&self) -> u64 {
        LiveView::version(self)
    }
}

/// Builds a view from JSON parameters.
pub type ModelFactory =
    Box<dyn Fn(&EventStore, &Value) -> Result<Box<dyn ErasedView>> + Send + Sync>;

/// Named model factories.
pub struct ModelRegistry {
    factories: HashMap<String, ModelFactory>,
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("ModelRegistry").field("models", &names).finish()
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ModelRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// A registry with `event`, `replaceable` and `timeline` registered.
    ///
    /// | Name | Parameters |
    /// |------|------------|
    /// | `event` | `{"id": "<hex>"}` |
    /// | `replaceable` | `{"address": "kind:pubkey:d"}` or `{"kind", "pubkey", "identifier"?}` |
    /// | `timeline` | `{"filters": [...], "include_old_versions"?: bool}` |
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("event", |store, params| {
            let id = required_str(params, "id")?;
            Ok(Box::new(store.event_view(EventId::new(id))?))
        });
        registry.register("replaceable", |store, params| {
            Ok(Box::new(store.replaceable_view(replaceable_key(params)?)?))
        });
        registry.register("timeline", |store, params| {
            let filters = match params.get("filters") {
                Some(Value::Array(items)) => items
                    .iter()
                    .map(Filter::from_value)
                    .collect::<Result<Vec<_>>>()?,
                Some(_) => return Err(invalid("'filters' must be an array")),
                None => return Err(invalid("missing 'filters'")),
            };
            let include_old = match params.get("include_old_versions") {
                None | Some(Value::Null) => false,
                Some(Value::Bool(flag)) => *flag,
                Some(_) => return Err(invalid("'include_old_versions' must be a boolean")),
            };
            let view = if include_old {
                store.timeline_view_with_history(filters)?
            } else {
                store.timeline_view(filters)?
            };
            Ok(Box::new(view))
        });
        registry
    }

    /// Registers `factory` under `name`, replacing any previous one.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&EventStore, &Value) -> Result<Box<dyn ErasedView>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    /// True if `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Opens a view of model `name` against `store`.
    pub fn open(
        &self,
        store: &EventStore,
        name: &str,
        params: &Value,
    ) -> Result<Box<dyn ErasedView>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::UnknownModel(name.to_string()))?;
        factory(store, params)
    }
}

fn invalid(reason: &str) -> Error {
    Error::InvalidModelParams(reason.to_string())
}

fn required_str<'a>(params: &'a Value, field: &str) -> Result<&'a str> {
    params
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| invalid(&format!("missing string '{field}'")))
}

fn replaceable_key(params: &Value) -> Result<ReplaceableKey> {
    if let Some(address) = params.get("address") {
        let address = address
            .as_str()
            .ok_or_else(|| invalid("'address' must be a string"))?;
        return Ok(AddressPointer::parse(address)?.key);
    }

    let kind = params
        .get("kind")
        .and_then(Value::as_u64)
        .and_then(|k| u16::try_from(k).ok())
        .map(Kind::new)
        .ok_or_else(|| invalid("missing or out-of-range 'kind'"))?;
    if !kind.is_replaceable() {
        return Err(invalid(&format!("kind {kind} is not replaceable")));
    }
    let pubkey = required_str(params, "pubkey")?;
    let identifier = match params.get("identifier") {
        None | Some(Value::Null) => "",
        Some(Value::String(d)) => d.as_str(),
        Some(_) => return Err(invalid("'identifier' must be a string")),
    };
    Ok(ReplaceableKey::new(kind, pubkey, identifier))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventBuilder;
    use serde_json::json;

    #[test]
    fn test_unknown_model() {
        let store = EventStore::in_memory();
        let registry = ModelRegistry::with_defaults();
        let err = registry.open(&store, "feed", &json!({})).unwrap_err();
        assert!(matches!(err, Error::UnknownModel(name) if name == "feed"));
    }

    #[test]
    fn test_bad_parameters() {
        let store = EventStore::in_memory();
        let registry = ModelRegistry::with_defaults();

        for (name, params) in [
            ("event", json!({})),
            ("replaceable", json!({ "kind": 1, "pubkey": "pk" })),
            ("replaceable", json!({ "kind": 70000, "pubkey": "pk" })),
            ("timeline", json!({ "filters": {} })),
            ("timeline", json!({ "filters": [], "include_old_versions": "yes" })),
        ] {
            let err = registry.open(&store, name, &params).unwrap_err();
            assert!(matches!(err, Error::InvalidModelParams(_)), "{name}: {err}");
        }

        let err = registry
            .open(&store, "timeline", &json!({ "filters": [{ "search": "x" }] }))
            .unwrap_err();
        assert!(matches!(err, Error::MalformedFilter(_)));
    }

    #[test]
    fn test_open_replaceable_by_address() {
        let store = EventStore::in_memory();
        let list = store
            .add(EventBuilder::new(30000, "pk").identifier("friends").build())
            .unwrap()
            .0;

        let registry = ModelRegistry::with_defaults();
        let by_address = registry
            .open(&store, "replaceable", &json!({ "address": "30000:pk:friends" }))
            .unwrap();
        let by_parts = registry
            .open(
                &store,
                "replaceable",
                &json!({ "kind": 30000, "pubkey": "pk", "identifier": "friends" }),
            )
            .unwrap();

        let expected = ModelOutput::State(ViewState::Current(list));
        assert_eq!(by_address.current(), expected);
        assert_eq!(by_parts.current(), expected);
    }

    #[test]
    fn test_custom_factory() {
        let store = EventStore::in_memory();
        let mut registry = ModelRegistry::new();
        assert!(!registry.contains("notes"));
        registry.register("notes", |store, _| {
            Ok(Box::new(store.timeline_view(vec![Filter::new().kinds([1u16])])?))
        });

        let mut view = registry.open(&store, "notes", &json!(null)).unwrap();
        store.add(EventBuilder::new(1, "pk").created_at(9).build()).unwrap();
        assert!(view.sync().unwrap());
        match view.current() {
            ModelOutput::Timeline(snapshot) => assert_eq!(snapshot.timestamps(), vec![9]),
            other => panic!("unexpected output {other:?}"),
        }
    }
}
