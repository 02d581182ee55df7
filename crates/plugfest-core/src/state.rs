//! Device state snapshots
//!
//! State is an unordered key/value map in raw (wire) units. Updates are
//! shallow merges: incoming keys overwrite, absent keys are kept.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Raw key/value state as carried on the wire
pub type StateMap = Map<String, Value>;

/// Last known state of a device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceState(StateMap);

impl DeviceState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a state body; only a JSON object is a usable state
    pub fn parse(body: &str) -> Option<Self> {
        match serde_json::from_str::<Value>(body.trim()) {
            Ok(Value::Object(map)) => Some(Self(map)),
            _ => None,
        }
    }

    /// Shallow-merge `update` over this state, returning whether anything changed
    pub fn merge(&mut self, update: &StateMap) -> bool {
        let mut changed = false;
        for (key, value) in update {
            if self.0.get(key) != Some(value) {
                self.0.insert(key.clone(), value.clone());
                changed = true;
            }
        }
        changed
    }

    /// The merge result without modifying this state
    pub fn merged(&self, update: &StateMap) -> Self {
        let mut next = self.clone();
        next.merge(update);
        next
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &StateMap {
        &self.0
    }

    pub fn into_map(self) -> StateMap {
        self.0
    }

    pub fn to_json(&self) -> String {
        Value::Object(self.0.clone()).to_string()
    }
}

impl From<StateMap> for DeviceState {
    fn from(map: StateMap) -> Self {
        Self(map)
    }
}
