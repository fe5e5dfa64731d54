//! State filters select which parts of the state take part in sync.
//!
//! A filter is either [`StateFilter::All`] ("everything at and below this
//! node") or a map from key to nested filter. In JSON form `true` stands for
//! `All` and an object for a key map:
//!
//! ```json
//! { "count": true, "settings": { "theme": true } }
//! ```

use crate::{error::Result, Error};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::collections::BTreeMap;

/// Recursive inclusion mask.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StateFilter {
    /// Include everything at and below this node.
    #[default]
    All,
    /// Include only the listed keys, each with its own nested filter.
    Keys(BTreeMap<String, StateFilter>),
}

impl StateFilter {
    /// A filter matching nothing.
    pub fn none() -> Self {
        StateFilter::Keys(BTreeMap::new())
    }

    /// A filter including each of `keys` entirely.
    pub fn keys<I, K>(keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        StateFilter::Keys(
            keys.into_iter()
                .map(|key| (key.into(), StateFilter::All))
                .collect(),
        )
    }

    /// Add `key` with a nested filter. Turns `All` into a key map.
    pub fn with(self, key: impl Into<String>, filter: StateFilter) -> Self {
        let mut keys = match self {
            StateFilter::All => BTreeMap::new(),
            StateFilter::Keys(keys) => keys,
        };
        keys.insert(key.into(), filter);
        StateFilter::Keys(keys)
    }

    /// Whether this filter includes everything.
    pub fn is_all(&self) -> bool {
        matches!(self, StateFilter::All)
    }

    /// Parse a filter from its JSON form.
    pub fn from_json(value: &Value) -> Result<Self> {
        StateFilter::deserialize(value).map_err(|e| Error::InvalidFilter(e.to_string()))
    }

    /// Apply the filter to `value`.
    ///
    /// `All` borrows the input untouched. Otherwise a fresh object is built;
    /// the input is never modified.
    pub fn apply<'a>(&self, value: &'a Value) -> Cow<'a, Value> {
        match (self, value) {
            (StateFilter::All, _) => Cow::Borrowed(value),
            (StateFilter::Keys(mask), Value::Object(object)) => {
                Cow::Owned(Value::Object(filter_object(mask, object)))
            }
            (StateFilter::Keys(_), _) => Cow::Owned(Value::Object(Map::new())),
        }
    }
}

fn filter_object(mask: &BTreeMap<String, StateFilter>, object: &Map<String, Value>) -> Map<String, Value> {
    let mut result = Map::new();
    for (key, value) in object {
        match (mask.get(key), value) {
            (Some(StateFilter::All), _) => {
                result.insert(key.clone(), value.clone());
            }
            // A nested mask only matches objects, and an empty match means nothing matched.
            (Some(StateFilter::Keys(nested)), Value::Object(inner)) => {
                let filtered = filter_object(nested, inner);
                if !filtered.is_empty() {
                    result.insert(key.clone(), Value::Object(filtered));
                }
            }
            _ => {}
        }
    }
    result
}

impl Serialize for StateFilter {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            StateFilter::All => serializer.serialize_bool(true),
            StateFilter::Keys(keys) => keys.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for StateFilter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Flag(bool),
            Keys(BTreeMap<String, StateFilter>),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Flag(true) => Ok(StateFilter::All),
            Repr::Flag(false) => Err(de::Error::custom(
                "`false` is not a filter; leave the key out instead",
            )),
            Repr::Keys(keys) => Ok(StateFilter::Keys(keys)),
        }
    }
}
