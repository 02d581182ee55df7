//! Plugfest light: hue/saturation/brightness on the wire, `rgb` for the host

use plugfest_core::StateMap;
use serde_json::Value;

use crate::color::{Hsb, Rgb};
use crate::error::{BridgeError, Result};
use crate::model::Projection;

const HUE: &str = "hue";
const SATURATION: &str = "saturation";
const BRIGHTNESS: &str = "brightness";
const RGB: &str = "rgb";

/// Lighting model exposing the device color as `#RRGGBB`
#[derive(Debug, Clone, Copy, Default)]
pub struct PlugfestLight;

impl Projection for PlugfestLight {
    fn name(&self) -> &str {
        "light"
    }

    fn data_in(&self, raw: &StateMap, cooked: &mut StateMap) {
        let number = |key: &str| raw.get(key).and_then(Value::as_f64);
        let (Some(hue), Some(saturation), Some(brightness)) =
            (number(HUE), number(SATURATION), number(BRIGHTNESS))
        else {
            return;
        };

        let rgb = Hsb::new(hue, saturation, brightness).to_rgb();
        cooked.insert(RGB.to_string(), Value::String(rgb.to_hex()));
    }

    fn data_out(&self, cooked: &mut StateMap, raw: &mut StateMap) {
        raw.remove(RGB);
        let Some(value) = cooked.remove(RGB) else {
            return;
        };
        let Some(rgb) = value.as_str().and_then(Rgb::from_hex) else {
            return;
        };

        let hsb = rgb.to_hsb();
        raw.insert(HUE.to_string(), Value::from(hsb.hue));
        raw.insert(SATURATION.to_string(), Value::from(hsb.saturation));
        raw.insert(BRIGHTNESS.to_string(), Value::from(hsb.brightness));
    }

    fn validate(&self, cooked: &StateMap) -> Result<()> {
        match cooked.get(RGB) {
            None => Ok(()),
            Some(Value::String(hex)) if Rgb::from_hex(hex).is_some() => Ok(()),
            Some(other) => Err(BridgeError::Parse(format!(
                "rgb must be a #RRGGBB string, got {}",
                other
            ))),
        }
    }
}
