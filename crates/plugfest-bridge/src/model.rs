//! Model projections between raw device state and the host's cooked view
//!
//! `data_in` turns a freshly read raw state into what the host sees;
//! `data_out` turns a host write back into the wire payload. Both are
//! pure transforms over the maps they are given.

use plugfest_core::StateMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::Result;
use crate::models::PlugfestLight;

/// Raw/cooked transform for one device family
pub trait Projection: Send + Sync {
    fn name(&self) -> &str;

    /// Add host-facing fields to `cooked`, derived from `raw`
    fn data_in(&self, raw: &StateMap, cooked: &mut StateMap);

    /// Rewrite `raw` for the wire from a host write in `cooked`
    fn data_out(&self, cooked: &mut StateMap, raw: &mut StateMap);

    /// Reject writes this model cannot express
    fn validate(&self, _cooked: &StateMap) -> Result<()> {
        Ok(())
    }

    /// Cooked view of a raw state
    fn cook(&self, raw: &StateMap) -> StateMap {
        let mut cooked = raw.clone();
        self.data_in(raw, &mut cooked);
        cooked
    }

    /// Wire payload for a cooked write
    fn uncook(&self, cooked: &StateMap) -> StateMap {
        let mut cooked = cooked.clone();
        let mut raw = cooked.clone();
        self.data_out(&mut cooked, &mut raw);
        raw
    }
}

/// Identity projection
#[derive(Debug, Clone, Copy, Default)]
pub struct GenericModel;

impl Projection for GenericModel {
    fn name(&self) -> &str {
        "generic"
    }

    fn data_in(&self, _raw: &StateMap, _cooked: &mut StateMap) {}

    fn data_out(&self, _cooked: &mut StateMap, _raw: &mut StateMap) {}
}

/// Model selected in configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    #[default]
    Light,
    Generic,
}

impl ModelKind {
    pub fn projection(&self) -> Arc<dyn Projection> {
        match self {
            ModelKind::Light => Arc::new(PlugfestLight),
            ModelKind::Generic => Arc::new(GenericModel),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_generic_is_identity() {
        let raw = json!({"on": true, "brightness": 0.5});
        let raw = raw.as_object().unwrap();
        assert_eq!(&GenericModel.cook(raw), raw);
        assert_eq!(&GenericModel.uncook(raw), raw);
    }

    #[test]
    fn test_model_kind_from_config() {
        #[derive(Deserialize)]
        struct Wrapper {
            model: ModelKind,
        }
        let w: Wrapper = serde_json::from_str(r#"{"model":"generic"}"#).unwrap();
        assert_eq!(w.model, ModelKind::Generic);
        assert_eq!(ModelKind::default().projection().name(), "light");
    }
}
